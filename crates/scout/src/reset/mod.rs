//! Escalating bus recovery
//!
//! A wedged adapter affects every device on the bus, so recovery is a
//! bus-wide pass that escalates through three tiers:
//!
//! 1. soft reset: IFC on every open descriptor, board reconfiguration, settle
//! 2. USB port reset of every attached bus adapter
//! 3. unbind and rebind the USB host controller driver, then reconfigure
//!
//! Tier 3 only runs when tier 2 failed or found no adapter to reset.

pub mod system;

use common::{Error, Result};
use protocol::{BusFault, BusPrimitives, Handle, HardResetProvider, UsbIdFilter};
use std::fmt;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::RecoverySettings;

pub use system::SystemResetProvider;

/// Tunables of a recovery pass
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    /// Pause after each reconfiguration so the adapter can re-enumerate
    pub settle_time: Duration,
    /// Signatures of the USB bus adapters
    pub adapters: Vec<UsbIdFilter>,
    /// Host controller driver to rebind as the last resort
    pub host_controller_driver: Option<String>,
}

impl RecoveryPolicy {
    pub fn from_settings(settings: &RecoverySettings) -> Result<Self> {
        let adapters = settings
            .adapter_filters()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            settle_time: settings.settle_time,
            adapters,
            host_controller_driver: settings.host_controller_driver.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    SoftReset,
    UsbDeviceReset,
    ControllerRebind,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::SoftReset => write!(f, "soft reset"),
            Tier::UsbDeviceReset => write!(f, "USB device reset"),
            Tier::ControllerRebind => write!(f, "controller rebind"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierOutcome {
    Completed,
    Failed,
    /// Nothing to do (no adapter attached, no driver configured)
    Skipped,
}

/// The tiers one recovery pass ran, in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub steps: Vec<(Tier, TierOutcome)>,
}

impl RecoveryReport {
    fn record(&mut self, tier: Tier, outcome: TierOutcome) {
        debug!("Recovery tier {}: {:?}", tier, outcome);
        self.steps.push((tier, outcome));
    }

    /// Outcome of `tier`, if it appears in the pass
    pub fn outcome(&self, tier: Tier) -> Option<TierOutcome> {
        self.steps
            .iter()
            .find(|(t, _)| *t == tier)
            .map(|(_, outcome)| *outcome)
    }

    pub fn tiers(&self) -> Vec<Tier> {
        self.steps.iter().map(|(tier, _)| *tier).collect()
    }
}

/// Runs recovery passes against a bus driver and the OS reset facilities
pub struct ResetEscalator {
    provider: Box<dyn HardResetProvider>,
    policy: RecoveryPolicy,
}

impl ResetEscalator {
    pub fn new(provider: impl HardResetProvider + 'static, policy: RecoveryPolicy) -> Self {
        Self {
            provider: Box::new(provider),
            policy,
        }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Run one full recovery pass
    ///
    /// Soft and USB tier failures are logged and escalate; only a failed
    /// controller rebind aborts the pass. A completed pass says nothing
    /// about whether the bus is healthy again.
    pub fn recover(
        &mut self,
        primitives: &mut dyn BusPrimitives,
        handles: &[Handle],
    ) -> Result<RecoveryReport> {
        info!("Starting bus recovery ({} open descriptors)", handles.len());
        let mut report = RecoveryReport::default();

        let soft = match self.soft_reset(primitives, handles) {
            Ok(()) => TierOutcome::Completed,
            Err(_) => TierOutcome::Failed,
        };
        report.record(Tier::SoftReset, soft);

        let hard = self.hard_reset(primitives)?;
        report.steps.extend(hard.steps);

        info!("Bus recovery pass complete");
        Ok(report)
    }

    /// Tiers 2 and 3 only
    ///
    /// Used on its own during bring-up, where tier 1 has just failed.
    pub fn hard_reset(&mut self, primitives: &mut dyn BusPrimitives) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let usb = self.usb_reset();
        report.record(Tier::UsbDeviceReset, usb);

        let rebind = match (usb, self.policy.host_controller_driver.clone()) {
            (TierOutcome::Completed, _) | (_, None) => TierOutcome::Skipped,
            (_, Some(driver)) => {
                self.rebind_controller(&driver)?;
                if let Err(e) = primitives.reconfigure() {
                    warn!("Board reconfiguration after rebind failed: {}", e);
                }
                self.settle();
                TierOutcome::Completed
            }
        };
        report.record(Tier::ControllerRebind, rebind);

        Ok(report)
    }

    /// Tier 1: IFC on every descriptor, then reload the board configuration
    ///
    /// Returns the reconfiguration result, which tells the caller whether an
    /// adapter is attached at all.
    pub fn soft_reset(
        &mut self,
        primitives: &mut dyn BusPrimitives,
        handles: &[Handle],
    ) -> std::result::Result<(), BusFault> {
        for &handle in handles {
            if let Err(e) = primitives.interface_clear(handle) {
                warn!("Interface clear on {} failed: {}", handle, e);
            }
        }

        let result = primitives.reconfigure();
        if let Err(e) = &result {
            warn!("Board reconfiguration failed: {}", e);
        }
        self.settle();
        result
    }

    /// Tier 2: USB port reset of every attached adapter
    pub fn usb_reset(&mut self) -> TierOutcome {
        let devices = match self.provider.list_usb_devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to list USB devices: {}", e);
                return TierOutcome::Failed;
            }
        };

        let adapters: Vec<_> = devices
            .into_iter()
            .filter(|entry| UsbIdFilter::any_matches(&self.policy.adapters, entry.id))
            .collect();
        if adapters.is_empty() {
            debug!("No bus adapter found on USB");
            return TierOutcome::Skipped;
        }

        let mut outcome = TierOutcome::Completed;
        for entry in adapters {
            match self
                .provider
                .reset_usb_device(entry.bus_number, entry.device_address)
            {
                Ok(()) => info!(
                    "Reset USB adapter {} at bus {:03} device {:03}",
                    entry.id, entry.bus_number, entry.device_address
                ),
                Err(e) => {
                    warn!("Failed to reset USB adapter {}: {}", entry.id, e);
                    outcome = TierOutcome::Failed;
                }
            }
        }
        outcome
    }

    /// Tier 3: rebind the host controller driver
    pub fn rebind_controller(&mut self, driver: &str) -> Result<()> {
        match self.provider.rebind_host_controller(driver) {
            Ok(count) => {
                info!("Rebound {} instance(s) of {}", count, driver);
                Ok(())
            }
            Err(e) => {
                error!("Host controller rebind of {} failed: {}", driver, e);
                Err(Error::ResetFailed(e))
            }
        }
    }

    fn settle(&self) {
        if !self.policy.settle_time.is_zero() {
            thread::sleep(self.policy.settle_time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{BusCall, MockBus, MockHardReset, MockOp, ResetCall};
    use protocol::{Address, DeviceSettings};

    const NI_VENDOR: u16 = 0x3923;
    const NI_PRODUCT: u16 = 0x709b;

    fn policy(driver: Option<&str>) -> RecoveryPolicy {
        RecoveryPolicy {
            settle_time: Duration::ZERO,
            adapters: vec!["0x3923:0x709b".parse().unwrap()],
            host_controller_driver: driver.map(str::to_string),
        }
    }

    fn open_one(bus: &mut MockBus) -> Handle {
        bus.open(Address::new(3).unwrap(), &DeviceSettings::default())
            .unwrap()
    }

    #[test]
    fn test_usb_reset_completes_without_rebind() {
        let mut bus = MockBus::new();
        let handle = open_one(&mut bus);
        let usb = MockHardReset::new();
        usb.add_device(1, 4, NI_VENDOR, NI_PRODUCT);
        usb.add_device(1, 5, 0x046d, 0xc52b);
        let mut escalator = ResetEscalator::new(usb.clone(), policy(Some("ehci-pci")));

        let report = escalator.recover(&mut bus, &[handle]).unwrap();
        assert_eq!(report.outcome(Tier::SoftReset), Some(TierOutcome::Completed));
        assert_eq!(
            report.outcome(Tier::UsbDeviceReset),
            Some(TierOutcome::Completed)
        );
        assert_eq!(
            report.outcome(Tier::ControllerRebind),
            Some(TierOutcome::Skipped)
        );
        assert_eq!(
            usb.trace(),
            vec![ResetCall::List, ResetCall::ResetDevice(1, 4)]
        );
        assert_eq!(
            bus.trace()[1..],
            [BusCall::InterfaceClear(handle), BusCall::Reconfigure]
        );
    }

    #[test]
    fn test_failed_usb_reset_escalates_to_rebind() {
        let mut bus = MockBus::new();
        let usb = MockHardReset::new();
        usb.add_device(2, 9, NI_VENDOR, NI_PRODUCT);
        usb.fail_device(2, 9);
        let mut escalator = ResetEscalator::new(usb.clone(), policy(Some("ehci-pci")));

        let report = escalator.recover(&mut bus, &[]).unwrap();
        assert_eq!(
            report.tiers(),
            vec![Tier::SoftReset, Tier::UsbDeviceReset, Tier::ControllerRebind]
        );
        assert_eq!(
            report.outcome(Tier::ControllerRebind),
            Some(TierOutcome::Completed)
        );
        assert_eq!(usb.trace().last(), Some(&ResetCall::Rebind("ehci-pci".into())));
        // reconfigured once by tier 1 and once more after the rebind
        assert_eq!(bus.count(|c| *c == BusCall::Reconfigure), 2);
    }

    #[test]
    fn test_no_adapter_skips_usb_tier() {
        let mut bus = MockBus::new();
        let usb = MockHardReset::new();
        let mut escalator = ResetEscalator::new(usb.clone(), policy(Some("xhci_hcd")));

        let report = escalator.recover(&mut bus, &[]).unwrap();
        assert_eq!(
            report.outcome(Tier::UsbDeviceReset),
            Some(TierOutcome::Skipped)
        );
        assert_eq!(usb.count(|c| matches!(c, ResetCall::Rebind(_))), 1);
    }

    #[test]
    fn test_rebind_needs_configured_driver() {
        let mut bus = MockBus::new();
        let usb = MockHardReset::new();
        usb.fail_listing(true);
        let mut escalator = ResetEscalator::new(usb.clone(), policy(None));

        let report = escalator.recover(&mut bus, &[]).unwrap();
        assert_eq!(
            report.outcome(Tier::UsbDeviceReset),
            Some(TierOutcome::Failed)
        );
        assert_eq!(
            report.outcome(Tier::ControllerRebind),
            Some(TierOutcome::Skipped)
        );
        assert_eq!(usb.count(|c| matches!(c, ResetCall::Rebind(_))), 0);
    }

    #[test]
    fn test_failed_rebind_is_fatal() {
        let mut bus = MockBus::new();
        let usb = MockHardReset::new();
        usb.fail_rebind(true);
        let mut escalator = ResetEscalator::new(usb, policy(Some("ehci-pci")));

        let err = escalator.recover(&mut bus, &[]).unwrap_err();
        assert!(matches!(err, Error::ResetFailed(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_soft_reset_failures_do_not_abort_pass() {
        let mut bus = MockBus::new();
        let handle = open_one(&mut bus);
        bus.fail_next(MockOp::InterfaceClear, BusFault::Other("EDVR".into()));
        bus.fail_next(MockOp::Reconfigure, BusFault::Other("gpib_config".into()));
        let usb = MockHardReset::new();
        usb.add_device(1, 2, NI_VENDOR, NI_PRODUCT);
        let mut escalator = ResetEscalator::new(usb, policy(None));

        let report = escalator.recover(&mut bus, &[handle]).unwrap();
        assert_eq!(report.outcome(Tier::SoftReset), Some(TierOutcome::Failed));
        assert_eq!(
            report.outcome(Tier::UsbDeviceReset),
            Some(TierOutcome::Completed)
        );
    }

    #[test]
    fn test_soft_reset_reports_reconfigure_result() {
        let mut bus = MockBus::new();
        bus.fail_next(MockOp::Reconfigure, BusFault::Other("no board".into()));
        let mut escalator = ResetEscalator::new(MockHardReset::new(), policy(None));

        assert!(escalator.soft_reset(&mut bus, &[]).is_err());
        assert!(escalator.soft_reset(&mut bus, &[]).is_ok());
    }

    #[test]
    fn test_policy_from_settings() {
        let settings = RecoverySettings {
            adapter_ids: vec!["not-an-id".into()],
            ..RecoverySettings::default()
        };
        assert!(matches!(
            RecoveryPolicy::from_settings(&settings),
            Err(Error::Config(_))
        ));

        let policy = RecoveryPolicy::from_settings(&RecoverySettings::default()).unwrap();
        assert_eq!(policy.adapters.len(), 2);
        assert_eq!(policy.settle_time, Duration::from_secs(2));
    }
}
