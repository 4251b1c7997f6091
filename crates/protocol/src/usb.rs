//! USB identities of GPIB bus adapters

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// USB vendor/product pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

impl UsbId {
    pub const fn new(vendor: u16, product: u16) -> Self {
        Self { vendor, product }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

/// A USB device as seen by a [`crate::HardResetProvider`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDeviceEntry {
    pub bus_number: u8,
    pub device_address: u8,
    pub id: UsbId,
}

/// Vendor/product pattern, written `0xVID:0xPID` with `*` as a wildcard
///
/// ```
/// use protocol::{UsbId, UsbIdFilter};
///
/// let filter: UsbIdFilter = "0x3923:*".parse().unwrap();
/// assert!(filter.matches(UsbId::new(0x3923, 0x709b)));
/// assert!(!filter.matches(UsbId::new(0x0957, 0x0518)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbIdFilter {
    vendor: Option<u16>,
    product: Option<u16>,
}

impl UsbIdFilter {
    /// Filter matching exactly one vendor/product pair
    pub const fn exact(id: UsbId) -> Self {
        Self {
            vendor: Some(id.vendor),
            product: Some(id.product),
        }
    }

    /// Whether the given id satisfies the pattern
    pub fn matches(&self, id: UsbId) -> bool {
        self.vendor.is_none_or(|v| v == id.vendor) && self.product.is_none_or(|p| p == id.product)
    }

    /// Whether any of the filters matches
    pub fn any_matches(filters: &[UsbIdFilter], id: UsbId) -> bool {
        filters.iter().any(|f| f.matches(id))
    }

    fn parse_part(part: &str, name: &str) -> Result<Option<u16>, String> {
        if part == "*" {
            return Ok(None);
        }

        let hex = part
            .strip_prefix("0x")
            .or_else(|| part.strip_prefix("0X"))
            .ok_or_else(|| format!("Invalid {} '{}', must start with '0x' (e.g., '0x3923')", name, part))?;

        if hex.is_empty() || hex.len() > 4 {
            return Err(format!("Invalid {} '{}', hex part must be 1-4 digits", name, part));
        }

        u16::from_str_radix(hex, 16)
            .map(Some)
            .map_err(|_| format!("Invalid {} '{}', not a valid hex number", name, part))
    }
}

impl FromStr for UsbIdFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 2 {
            return Err(format!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x3923:0x709b' or '0x3923:*')",
                s
            ));
        }

        Ok(Self {
            vendor: Self::parse_part(parts[0], "VID")?,
            product: Self::parse_part(parts[1], "PID")?,
        })
    }
}

impl fmt::Display for UsbIdFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor {
            Some(v) => write!(f, "0x{:04x}", v)?,
            None => write!(f, "*")?,
        }
        match self.product {
            Some(p) => write!(f, ":0x{:04x}", p),
            None => write!(f, ":*"),
        }
    }
}
