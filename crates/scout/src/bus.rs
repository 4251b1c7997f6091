//! The shared bus
//!
//! Every device session on one board talks through the same driver and is
//! recovered by the same escalator. [`BusLink`] is the cloneable handle onto
//! that shared state; its mutex makes each primitive call and each recovery
//! pass exclusive within the process, and the advisory lock extends the
//! exclusion to recovery, discovery and adapter resets across processes.

use common::{Error, Result};
use protocol::{Address, BusFault, BusPrimitives, DeviceSettings, Handle};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::lock::AdvisoryLock;
use crate::reset::{RecoveryReport, ResetEscalator, TierOutcome};

struct Bus {
    primitives: Box<dyn BusPrimitives>,
    escalator: ResetEscalator,
    /// Open descriptor per address
    open: BTreeMap<Address, Handle>,
    lock: AdvisoryLock,
}

impl Bus {
    fn handles(&self) -> Vec<Handle> {
        self.open.values().copied().collect()
    }
}

#[derive(Clone)]
pub struct BusLink {
    inner: Arc<Mutex<Bus>>,
}

impl BusLink {
    pub fn new(
        primitives: impl BusPrimitives + 'static,
        escalator: ResetEscalator,
        lock: AdvisoryLock,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Bus {
                primitives: Box::new(primitives),
                escalator,
                open: BTreeMap::new(),
                lock,
            })),
        }
    }

    fn bus(&self) -> MutexGuard<'_, Bus> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive use of the driver
    pub fn with<T>(&self, f: impl FnOnce(&mut dyn BusPrimitives) -> T) -> T {
        let mut bus = self.bus();
        f(bus.primitives.as_mut())
    }

    /// Hold the cross-process bus lock until the guard is dropped
    pub fn exclusive(&self) -> Result<ExclusiveGuard> {
        self.bus().lock.acquire()?;
        Ok(ExclusiveGuard { link: self.clone() })
    }

    /// Run one recovery pass over every open descriptor
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut guard = self.bus();
        let bus = &mut *guard;
        bus.lock.acquire()?;
        let handles = bus.handles();
        let result = bus.escalator.recover(bus.primitives.as_mut(), &handles);
        bus.lock.release();
        result
    }

    /// Tier 1 alone, returning the board reconfiguration result
    pub fn soft_reset(&self) -> std::result::Result<(), BusFault> {
        let mut guard = self.bus();
        let bus = &mut *guard;
        let handles = bus.handles();
        bus.escalator.soft_reset(bus.primitives.as_mut(), &handles)
    }

    /// Tiers 2 and 3 alone
    pub fn hard_reset(&self) -> Result<RecoveryReport> {
        let mut guard = self.bus();
        let bus = &mut *guard;
        bus.escalator.hard_reset(bus.primitives.as_mut())
    }

    /// Tier 2 alone under the bus lock; failures are only logged
    pub fn usb_reset(&self) -> TierOutcome {
        let mut bus = self.bus();
        if let Err(e) = bus.lock.acquire() {
            warn!("Skipping adapter reset, bus lock unavailable: {}", e);
            return TierOutcome::Failed;
        }
        let outcome = bus.escalator.usb_reset();
        bus.lock.release();
        outcome
    }

    /// Rebind the configured host controller driver, if any
    pub fn rebind_controller(&self) -> Result<bool> {
        let mut bus = self.bus();
        match bus.escalator.policy().host_controller_driver.clone() {
            Some(driver) => bus.escalator.rebind_controller(&driver).map(|()| true),
            None => Ok(false),
        }
    }

    /// Open a descriptor for `address` and record it
    ///
    /// Fails if the address already has one.
    pub fn open(&self, address: Address, settings: &DeviceSettings) -> Result<Handle> {
        let mut bus = self.bus();
        if let Some(existing) = bus.open.get(&address) {
            return Err(Error::Bus(BusFault::Other(format!(
                "address {} already open as {}",
                address, existing
            ))));
        }
        let handle = bus.primitives.open(address, settings)?;
        bus.open.insert(address, handle);
        debug!("Opened {} for address {}", handle, address);
        Ok(handle)
    }

    /// Close a descriptor and forget it
    pub fn close(&self, address: Address, handle: Handle) -> Result<()> {
        let mut bus = self.bus();
        if bus.open.get(&address) == Some(&handle) {
            bus.open.remove(&address);
        } else {
            warn!("Closing {} which is not registered for {}", handle, address);
        }
        bus.primitives.close(handle)?;
        debug!("Closed {} for address {}", handle, address);
        Ok(())
    }

    /// Addresses that currently hold a descriptor
    pub fn open_addresses(&self) -> Vec<Address> {
        self.bus().open.keys().copied().collect()
    }
}

/// Scope of the cross-process bus lock
pub struct ExclusiveGuard {
    link: BusLink,
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        self.link.bus().lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reset::{RecoveryPolicy, Tier};
    use common::test_utils::{BusCall, MockBus, MockHardReset, ResetCall};
    use std::time::Duration;

    fn link(bus: &MockBus, usb: &MockHardReset) -> BusLink {
        let policy = RecoveryPolicy {
            settle_time: Duration::ZERO,
            adapters: vec!["0x3923:0x709b".parse().unwrap()],
            host_controller_driver: Some("ehci-pci".into()),
        };
        BusLink::new(
            bus.clone(),
            ResetEscalator::new(usb.clone(), policy),
            AdvisoryLock::disabled(),
        )
    }

    fn addr(value: u8) -> Address {
        Address::new(value).unwrap()
    }

    #[test]
    fn test_one_descriptor_per_address() {
        let bus = MockBus::new();
        let link = link(&bus, &MockHardReset::new());

        let handle = link.open(addr(4), &DeviceSettings::default()).unwrap();
        assert!(link.open(addr(4), &DeviceSettings::default()).is_err());
        assert_eq!(bus.count(|c| matches!(c, BusCall::Open(_))), 1);

        link.close(addr(4), handle).unwrap();
        assert!(link.open_addresses().is_empty());
        assert!(link.open(addr(4), &DeviceSettings::default()).is_ok());
    }

    #[test]
    fn test_recover_clears_every_open_descriptor() {
        let bus = MockBus::new();
        let usb = MockHardReset::new();
        let link = link(&bus, &usb);
        let first = link.open(addr(1), &DeviceSettings::default()).unwrap();
        let second = link.open(addr(2), &DeviceSettings::default()).unwrap();
        bus.clear_trace();

        let report = link.recover().unwrap();
        assert_eq!(report.outcome(Tier::SoftReset), Some(TierOutcome::Completed));
        let trace = bus.trace();
        assert!(trace.contains(&BusCall::InterfaceClear(first)));
        assert!(trace.contains(&BusCall::InterfaceClear(second)));
        // no adapter on USB, so the controller is rebound
        assert_eq!(usb.count(|c| matches!(c, ResetCall::Rebind(_))), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let bus = MockBus::new();
        let link = link(&bus, &MockHardReset::new());
        let other = link.clone();

        link.open(addr(9), &DeviceSettings::default()).unwrap();
        assert_eq!(other.open_addresses(), vec![addr(9)]);
    }

    fn locked_link(bus: &MockBus, usb: &MockHardReset, path: &std::path::Path) -> BusLink {
        let policy = RecoveryPolicy {
            settle_time: Duration::ZERO,
            adapters: vec!["0x3923:0x709b".parse().unwrap()],
            host_controller_driver: None,
        };
        BusLink::new(
            bus.clone(),
            ResetEscalator::new(usb.clone(), policy),
            AdvisoryLock::new(Some(path)),
        )
    }

    #[test]
    fn test_usb_reset_takes_bus_lock() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock_path = dir.path().join("gpib-scout.lock");
        let usb = MockHardReset::new();
        usb.add_device(1, 7, 0x3923, 0x709b);
        let link = locked_link(&MockBus::new(), &usb, &lock_path);

        assert_eq!(link.usb_reset(), TierOutcome::Completed);
        assert!(lock_path.exists());
        assert!(!link.bus().lock.is_held());
        assert_eq!(usb.trace(), vec![ResetCall::List, ResetCall::ResetDevice(1, 7)]);
    }

    #[test]
    fn test_usb_reset_skipped_without_lock() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let usb = MockHardReset::new();
        usb.add_device(1, 7, 0x3923, 0x709b);
        let link = locked_link(&MockBus::new(), &usb, &blocker.join("gpib-scout.lock"));

        assert_eq!(link.usb_reset(), TierOutcome::Failed);
        assert!(usb.trace().is_empty());
    }

    #[test]
    fn test_exclusive_guard_nests_with_recover() {
        let bus = MockBus::new();
        let link = link(&bus, &MockHardReset::new());
        let guard = link.exclusive().unwrap();
        assert!(link.recover().is_ok());
        drop(guard);
        assert!(link.with(|p| p.reconfigure()).is_ok());
    }
}
