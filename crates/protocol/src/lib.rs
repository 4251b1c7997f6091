//! GPIB protocol vocabulary for gpib-scout
//!
//! This crate defines the types shared by every layer of the bus stack:
//! addresses and device settings, the fault taxonomy raised by drivers,
//! USB adapter identities, and the collaborator traits the core drives.
//!
//! # Example
//!
//! ```
//! use protocol::{Address, DeviceSettings, Timeout};
//!
//! let address = Address::new(5).unwrap();
//! let settings = DeviceSettings::default();
//! assert_eq!(address.value(), 5);
//! assert_eq!(settings.timeout, Timeout::T10s);
//! assert!(Address::new(31).is_err());
//! ```

pub mod error;
pub mod primitives;
pub mod types;
pub mod usb;

pub use error::{AddressError, BusFault, HardResetError};
pub use primitives::{BusPrimitives, HardResetProvider};
pub use types::{
    Address, ConfigOption, DeviceSettings, EosMode, Handle, SecondaryAddress, Timeout,
};
pub use usb::{UsbDeviceEntry, UsbId, UsbIdFilter};
