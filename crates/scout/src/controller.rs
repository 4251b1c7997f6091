//! Bus discovery and the registry of discovered devices
//!
//! Discovery brings the interface up, then probes every configured address
//! with an identification query. Addresses where nothing answers are skipped;
//! any other fault is taken as a wedged bus, which is recovered before the
//! same address is probed again. The retry budget covers the whole run.

use common::{Error, ProgressSink, Result};
use protocol::{Address, BusFault, BusPrimitives, DeviceSettings, Handle, HardResetProvider};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{Level, debug, info, warn};

use crate::bus::BusLink;
use crate::config::{DiscoverySettings, ScoutConfig};
use crate::lock::AdvisoryLock;
use crate::reset::{RecoveryPolicy, ResetEscalator};
use crate::session::{DeviceSession, GenericDriver};

/// Discovered sessions by primary address
pub type BusRegistry = BTreeMap<Address, DeviceSession>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Resetting,
    Probing(Address),
    Done,
}

/// An address and the identification it answered with
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub address: Address,
    pub identification: String,
}

enum Probe {
    Found(Handle, String),
    Absent,
    Fault(BusFault),
}

pub struct BusController {
    link: BusLink,
    registry: BusRegistry,
    state: DiscoveryState,
    device_settings: DeviceSettings,
    discovery: DiscoverySettings,
    max_retries: u32,
    rebind_on_startup: bool,
    reset_on_teardown: bool,
    shut_down: bool,
}

impl BusController {
    /// Build a controller over a bus driver and the system reset facilities
    ///
    /// Fails with [`Error::Privilege`] when root is required but missing.
    pub fn new(
        config: &ScoutConfig,
        primitives: impl BusPrimitives + 'static,
        provider: impl HardResetProvider + 'static,
    ) -> Result<Self> {
        if config.controller.require_root {
            check_root()?;
        }

        let policy = RecoveryPolicy::from_settings(&config.recovery)?;
        let link = BusLink::new(
            primitives,
            ResetEscalator::new(provider, policy),
            AdvisoryLock::new(config.controller.lock_file()),
        );

        Ok(Self {
            link,
            registry: BusRegistry::new(),
            state: DiscoveryState::Idle,
            device_settings: config.device,
            discovery: config.discovery.clone(),
            max_retries: config.recovery.max_retries,
            rebind_on_startup: config.recovery.rebind_on_startup,
            reset_on_teardown: config.recovery.reset_on_teardown,
            shut_down: false,
        })
    }

    /// Probe the bus and rebuild the registry
    ///
    /// Sessions from a previous run are closed first. Finding no device is
    /// not an error.
    pub fn discover(&mut self, progress: &dyn ProgressSink) -> Result<&BusRegistry> {
        self.close_sessions()?;
        self.state = DiscoveryState::Idle;
        self.shut_down = false;

        let result = self.run_discovery(progress);
        if let Err(e) = &result {
            warn!("Discovery failed: {}", e);
            self.state = DiscoveryState::Idle;
            if let Err(close_err) = self.close_sessions() {
                warn!("Failed to close sessions after discovery failure: {}", close_err);
            }
        }
        result?;
        Ok(&self.registry)
    }

    fn run_discovery(&mut self, progress: &dyn ProgressSink) -> Result<()> {
        let _guard = self.link.exclusive()?;

        self.state = DiscoveryState::Resetting;
        progress.report_line("Resetting GPIB interface", Level::INFO);
        self.bring_up()?;

        let addresses = self.discovery.addresses();
        let total = addresses.len();
        progress.report_line(
            &format!(
                "Scanning addresses {}-{}",
                self.discovery.first_address, self.discovery.last_address
            ),
            Level::INFO,
        );

        let mut retries = 0;
        for (index, address) in addresses.into_iter().enumerate() {
            self.state = DiscoveryState::Probing(address);
            loop {
                match self.probe(address)? {
                    Probe::Found(handle, identification) => {
                        debug!("Address {} answered {:?}", address, identification);
                        let session = DeviceSession::new(
                            address,
                            handle,
                            self.link.clone(),
                            self.max_retries,
                            identification,
                        );
                        self.registry.insert(address, session);
                        break;
                    }
                    Probe::Absent => break,
                    Probe::Fault(fault) => {
                        if retries >= self.max_retries {
                            return Err(Error::Unrecoverable {
                                operation: "discovery",
                                attempts: retries + 1,
                                last_fault: fault,
                            });
                        }
                        retries += 1;
                        warn!(
                            "Probe of address {} failed: {}, recovering bus ({}/{})",
                            address, fault, retries, self.max_retries
                        );
                        self.link.recover()?;
                    }
                }
            }
            progress.report_progress((index + 1) as f32 / total as f32);
        }

        self.state = DiscoveryState::Done;
        for (address, session) in &self.registry {
            progress.report_line(
                &format!("{}: {}", address, session.identification().unwrap_or_default()),
                Level::INFO,
            );
        }
        if self.registry.is_empty() {
            progress.report_line("No GPIB devices found", Level::WARN);
        } else {
            progress.report_line(
                &format!("Found {} GPIB device(s)", self.registry.len()),
                Level::INFO,
            );
        }
        Ok(())
    }

    /// Reconfigure the board until it answers, escalating in between
    fn bring_up(&mut self) -> Result<()> {
        if self.rebind_on_startup && !self.link.rebind_controller()? {
            warn!("rebind_on_startup is set but no host controller driver is configured");
        }

        let attempts = self.max_retries + 1;
        for attempt in 1..=attempts {
            match self.link.soft_reset() {
                Ok(()) => {
                    info!("GPIB interface ready");
                    return Ok(());
                }
                Err(fault) => {
                    warn!(
                        "Interface bring-up failed (attempt {}/{}): {}",
                        attempt, attempts, fault
                    );
                    if attempt < attempts {
                        self.link.hard_reset()?;
                    }
                }
            }
        }

        Err(Error::NoInterface { attempts })
    }

    /// Open, clear and identify one address
    fn probe(&self, address: Address) -> Result<Probe> {
        let handle = match self.link.open(address, &self.device_settings) {
            Ok(handle) => handle,
            Err(Error::Bus(fault)) if fault.is_not_present() => return Ok(Probe::Absent),
            Err(Error::Bus(fault)) => return Ok(Probe::Fault(fault)),
            Err(e) => return Err(e),
        };

        let query = self.discovery.identify_command.as_bytes();
        let max_len = self.discovery.identify_max_len;
        let reply = self.link.with(|p| {
            p.clear(handle)?;
            p.write(handle, query)?;
            p.read(handle, max_len)
        });

        match reply {
            Ok(bytes) => Ok(Probe::Found(
                handle,
                String::from_utf8_lossy(&bytes).trim_end().to_string(),
            )),
            Err(fault) => {
                self.link.close(address, handle)?;
                if fault.is_not_present() {
                    debug!("Nothing at address {}: {}", address, fault);
                    Ok(Probe::Absent)
                } else {
                    Ok(Probe::Fault(fault))
                }
            }
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn registry(&self) -> &BusRegistry {
        &self.registry
    }

    pub fn device(&self, address: Address) -> Option<&DeviceSession> {
        self.registry.get(&address)
    }

    pub fn device_mut(&mut self, address: Address) -> Option<&mut DeviceSession> {
        self.registry.get_mut(&address)
    }

    /// Query driver borrowing the session at `address`
    pub fn driver(&mut self, address: Address) -> Option<GenericDriver<&mut DeviceSession>> {
        self.device_mut(address).map(GenericDriver::new)
    }

    /// Addresses and identifications, in address order
    pub fn discovered(&self) -> Vec<DiscoveredDevice> {
        self.registry
            .iter()
            .map(|(address, session)| DiscoveredDevice {
                address: *address,
                identification: session.identification().unwrap_or_default().to_string(),
            })
            .collect()
    }

    /// Close every session, then reset the adapters if configured to
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.state = DiscoveryState::Idle;

        let result = self.close_sessions();
        if self.reset_on_teardown {
            debug!("Resetting bus adapters on teardown");
            self.link.usb_reset();
        }
        result
    }

    fn close_sessions(&mut self) -> Result<()> {
        let mut first_error = None;
        for (address, session) in std::mem::take(&mut self.registry) {
            if let Err(e) = session.close() {
                warn!("Failed to close session for address {}: {}", address, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for BusController {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Bus teardown incomplete: {}", e);
        }
    }
}

fn check_root() -> Result<()> {
    if nix::unistd::geteuid().is_root() {
        Ok(())
    } else {
        Err(Error::Privilege(
            "bus resets need root, run gpib-scout as root".into(),
        ))
    }
}
