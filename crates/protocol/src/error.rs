//! Bus and reset error types

use thiserror::Error;

/// Invalid address values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("primary address {0} out of range (0-30)")]
    PrimaryOutOfRange(u8),

    #[error("secondary address {0} out of range (0 or 96-126)")]
    SecondaryOutOfRange(u8),
}

/// Fault raised by a bus primitive
///
/// Backends must sort driver errors into these classes, since callers
/// react to them differently: an absent device is expected during
/// discovery, an aborted transaction has to be replayed from the write
/// side, and anything else is treated as a generic transient fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusFault {
    /// No device listening or talking at the addressed location
    #[error("device not present: {0}")]
    NotPresent(String),

    /// Read or write of data bytes aborted, likely a timeout or device clear
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// Any other driver or controller failure
    #[error("bus error: {0}")]
    Other(String),
}

impl BusFault {
    /// Whether the fault means nothing answered at the address
    pub fn is_not_present(&self) -> bool {
        matches!(self, BusFault::NotPresent(_))
    }

    /// Whether the fault lost an in-flight transaction
    pub fn is_aborted(&self) -> bool {
        matches!(self, BusFault::Aborted(_))
    }
}

/// Failure of an OS-level USB or host controller reset
#[derive(Debug, Error)]
pub enum HardResetError {
    /// The USB device disappeared or is held by another process
    #[error("USB device {bus:03}/{device:03} unavailable: {message}")]
    DeviceUnavailable { bus: u8, device: u8, message: String },

    /// Enumerating USB devices failed
    #[error("USB enumeration failed: {0}")]
    Enumeration(String),

    /// Host controller driver not found
    #[error("host controller driver '{0}' not found")]
    DriverNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
