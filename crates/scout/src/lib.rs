//! gpib-scout
//!
//! Discovers the instruments on a GPIB bus and keeps a session open to each
//! of them. Sessions survive a wedged bus adapter by escalating through
//! interface clear, USB port reset and host controller rebind.
//!
//! The core is driver agnostic: [`controller::BusController`] takes any
//! [`protocol::BusPrimitives`] and [`protocol::HardResetProvider`]. Build with
//! the `linux-gpib` feature for the linux-gpib backend.

#[cfg(feature = "linux-gpib")]
pub mod backend;
pub mod bus;
pub mod config;
pub mod controller;
pub mod lock;
pub mod reset;
pub mod session;

pub use bus::BusLink;
pub use config::ScoutConfig;
pub use controller::{BusController, BusRegistry, DiscoveredDevice, DiscoveryState};
pub use reset::{
    RecoveryPolicy, RecoveryReport, ResetEscalator, SystemResetProvider, Tier, TierOutcome,
};
pub use session::{DeviceSession, GenericDriver, Instrument};
