//! GPIB addressing and device setting types
//!
//! These types describe how a device is reached on the bus: its primary and
//! secondary address, the I/O timeout, and end-of-message handling. Numeric
//! encodings follow linux-gpib so that backends can pass them straight through.

use crate::error::AddressError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Primary GPIB address (0-30)
///
/// Address 31 is the protocol's "untalk/unlisten" code and can never be
/// assigned to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Address(u8);

impl Address {
    /// Highest assignable primary address
    pub const MAX: u8 = 30;

    /// Lowest address, conventionally the controller's own
    pub const FIRST: Address = Address(0);

    /// Highest address
    pub const LAST: Address = Address(Self::MAX);

    /// Create an address, rejecting values outside 0-30
    pub fn new(value: u8) -> Result<Self, AddressError> {
        if value > Self::MAX {
            return Err(AddressError::PrimaryOutOfRange(value));
        }
        Ok(Self(value))
    }

    /// Numeric value of the address
    pub fn value(self) -> u8 {
        self.0
    }

    /// Every assignable primary address in ascending order
    pub fn all() -> impl Iterator<Item = Address> {
        (0..=Self::MAX).map(Address)
    }

    /// Addresses from `first` to `last`, inclusive
    pub fn range(first: Address, last: Address) -> impl Iterator<Item = Address> {
        (first.0..=last.0).map(Address)
    }
}

impl TryFrom<u8> for Address {
    type Error = AddressError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Address::new(value)
    }
}

impl From<Address> for u8 {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Secondary GPIB address
///
/// Uses the linux-gpib encoding: 0 disables secondary addressing, otherwise
/// the value is 0x60 plus the secondary address (96-126).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SecondaryAddress(u8);

impl SecondaryAddress {
    /// No secondary address
    pub const NONE: SecondaryAddress = SecondaryAddress(0);

    const BASE: u8 = 0x60;

    /// Create a secondary address from its linux-gpib encoding
    pub fn new(value: u8) -> Result<Self, AddressError> {
        if value == 0 || (Self::BASE..=Self::BASE + 30).contains(&value) {
            Ok(Self(value))
        } else {
            Err(AddressError::SecondaryOutOfRange(value))
        }
    }

    /// Encoded value passed to the driver
    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for SecondaryAddress {
    type Error = AddressError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        SecondaryAddress::new(value)
    }
}

impl From<SecondaryAddress> for u8 {
    fn from(address: SecondaryAddress) -> Self {
        address.0
    }
}

/// Driver-level device descriptor
///
/// Returned by [`crate::BusPrimitives::open`]. Only meaningful to the backend
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub i32);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ud{}", self.0)
    }
}

/// I/O timeout, as the fixed table of linux-gpib timeout codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Timeout {
    /// Wait forever
    #[serde(rename = "none")]
    TNone,
    T10us,
    T30us,
    T100us,
    T300us,
    T1ms,
    T3ms,
    T10ms,
    T30ms,
    T100ms,
    T300ms,
    T1s,
    T3s,
    #[default]
    T10s,
    T30s,
    T100s,
    T300s,
    T1000s,
}

impl Timeout {
    const TABLE: [Timeout; 18] = [
        Timeout::TNone,
        Timeout::T10us,
        Timeout::T30us,
        Timeout::T100us,
        Timeout::T300us,
        Timeout::T1ms,
        Timeout::T3ms,
        Timeout::T10ms,
        Timeout::T30ms,
        Timeout::T100ms,
        Timeout::T300ms,
        Timeout::T1s,
        Timeout::T3s,
        Timeout::T10s,
        Timeout::T30s,
        Timeout::T100s,
        Timeout::T300s,
        Timeout::T1000s,
    ];

    /// Driver timeout code (0 = none, 13 = 10 s, 17 = 1000 s)
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a timeout by its driver code
    pub fn from_code(code: i32) -> Option<Timeout> {
        usize::try_from(code)
            .ok()
            .and_then(|idx| Self::TABLE.get(idx).copied())
    }

    /// Wall-clock duration, or `None` for [`Timeout::TNone`]
    pub fn duration(self) -> Option<Duration> {
        let micros: u64 = match self {
            Timeout::TNone => return None,
            Timeout::T10us => 10,
            Timeout::T30us => 30,
            Timeout::T100us => 100,
            Timeout::T300us => 300,
            Timeout::T1ms => 1_000,
            Timeout::T3ms => 3_000,
            Timeout::T10ms => 10_000,
            Timeout::T30ms => 30_000,
            Timeout::T100ms => 100_000,
            Timeout::T300ms => 300_000,
            Timeout::T1s => 1_000_000,
            Timeout::T3s => 3_000_000,
            Timeout::T10s => 10_000_000,
            Timeout::T30s => 30_000_000,
            Timeout::T100s => 100_000_000,
            Timeout::T300s => 300_000_000,
            Timeout::T1000s => 1_000_000_000,
        };
        Some(Duration::from_micros(micros))
    }
}

/// End-of-string handling word (linux-gpib `eos` argument)
///
/// The low byte is the EOS character; the high bits select how it is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EosMode(pub u16);

impl EosMode {
    /// Terminate reads on the EOS character
    pub const REOS: u16 = 0x0400;
    /// Assert EOI when the EOS character is written
    pub const XEOS: u16 = 0x0800;
    /// Compare all 8 bits of the EOS character
    pub const BIN: u16 = 0x1000;

    /// Disable EOS processing
    pub const DISABLED: EosMode = EosMode(0);

    /// Build an EOS word from a character and flag bits
    pub fn new(eos_char: u8, flags: u16) -> Self {
        EosMode((flags & (Self::REOS | Self::XEOS | Self::BIN)) | u16::from(eos_char))
    }

    /// The EOS character
    pub fn eos_char(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    /// Whether reads stop at the EOS character
    pub fn terminates_reads(self) -> bool {
        self.0 & Self::REOS != 0
    }
}

/// Settings applied when a device descriptor is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub secondary: SecondaryAddress,
    pub timeout: Timeout,
    /// Assert EOI with the last byte of every write
    pub send_eoi: bool,
    pub eos_mode: EosMode,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            secondary: SecondaryAddress::NONE,
            timeout: Timeout::T10s,
            send_eoi: true,
            eos_mode: EosMode::DISABLED,
        }
    }
}

/// Option selector for [`crate::BusPrimitives::configure`] (linux-gpib `ibconfig`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigOption(pub i32);

impl ConfigOption {
    pub const PAD: ConfigOption = ConfigOption(0x01);
    pub const SAD: ConfigOption = ConfigOption(0x02);
    pub const TMO: ConfigOption = ConfigOption(0x03);
    pub const EOT: ConfigOption = ConfigOption(0x04);
    pub const READDR: ConfigOption = ConfigOption(0x06);
    pub const AUTOPOLL: ConfigOption = ConfigOption(0x07);
    pub const SRE: ConfigOption = ConfigOption(0x0b);
    pub const EOS_RD: ConfigOption = ConfigOption(0x0c);
    pub const EOS_WRT: ConfigOption = ConfigOption(0x0d);
    pub const EOS_CMP: ConfigOption = ConfigOption(0x0e);
    pub const EOS_CHAR: ConfigOption = ConfigOption(0x0f);
}
