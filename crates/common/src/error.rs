//! Common error types
//!
//! Errors are grouped the way callers must react to them. Bus faults that
//! survive their retry budget, and failed controller rebinds, are fatal:
//! the bus is believed wedged and the operation must stop. Missing
//! privileges, a missing adapter, and bad configuration are configuration
//! errors and are never retried.

use protocol::{AddressError, BusFault, HardResetError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A primitive failed outside any retry loop
    #[error("Bus error: {0}")]
    Bus(#[from] BusFault),

    /// Retry budget exhausted
    #[error("Unrecoverable {operation} failure after {attempts} attempts: {last_fault}")]
    Unrecoverable {
        operation: &'static str,
        attempts: u32,
        last_fault: BusFault,
    },

    /// Host controller rebind failed during recovery
    #[error("Bus reset failed: {0}")]
    ResetFailed(#[source] HardResetError),

    #[error("Insufficient privileges: {0}")]
    Privilege(String),

    /// Board reconfiguration kept failing after full reset escalation
    #[error("No GPIB interface connected (board reconfiguration failed {attempts} times)")]
    NoInterface { attempts: u32 },

    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The bus is believed wedged; operator intervention is required
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Unrecoverable { .. } | Error::ResetFailed(_))
    }

    /// A prerequisite is missing; retrying cannot help
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Privilege(_) | Error::NoInterface { .. } | Error::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
