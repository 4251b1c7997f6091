//! Reset facilities of the running Linux system
//!
//! USB devices are enumerated and port-reset through libusb (`rusb`). Host
//! controllers are rebound by writing their PCI slot names to the driver's
//! `unbind` and `bind` files in sysfs. Both need root.

use protocol::{HardResetError, HardResetProvider, UsbDeviceEntry, UsbId};
use rusb::{Context, UsbContext};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct SystemResetProvider {
    /// Created on first use so that building a provider never touches USB
    context: Option<Context>,
    pci_drivers_path: PathBuf,
}

impl SystemResetProvider {
    /// Provider rebinding drivers under `pci_drivers_path` (normally
    /// `/sys/bus/pci/drivers`)
    pub fn new(pci_drivers_path: impl Into<PathBuf>) -> Self {
        Self {
            context: None,
            pci_drivers_path: pci_drivers_path.into(),
        }
    }

    fn context(&mut self) -> Result<&Context, HardResetError> {
        if self.context.is_none() {
            let context = Context::new()
                .map_err(|e| HardResetError::Enumeration(format!("libusb init: {}", e)))?;
            self.context = Some(context);
        }
        self.context
            .as_ref()
            .ok_or_else(|| HardResetError::Enumeration("libusb context unavailable".into()))
    }
}

impl HardResetProvider for SystemResetProvider {
    fn list_usb_devices(&mut self) -> Result<Vec<UsbDeviceEntry>, HardResetError> {
        let devices = self
            .context()?
            .devices()
            .map_err(|e| HardResetError::Enumeration(e.to_string()))?;

        let mut entries = Vec::new();
        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    debug!(
                        "Skipping device {:03}:{:03}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };
            entries.push(UsbDeviceEntry {
                bus_number: device.bus_number(),
                device_address: device.address(),
                id: UsbId::new(descriptor.vendor_id(), descriptor.product_id()),
            });
        }

        debug!("Enumerated {} USB devices", entries.len());
        Ok(entries)
    }

    fn reset_usb_device(&mut self, bus: u8, device: u8) -> Result<(), HardResetError> {
        let unavailable = |message: String| HardResetError::DeviceUnavailable {
            bus,
            device,
            message,
        };

        let devices = self
            .context()?
            .devices()
            .map_err(|e| HardResetError::Enumeration(e.to_string()))?;
        let target = devices
            .iter()
            .find(|d| d.bus_number() == bus && d.address() == device)
            .ok_or_else(|| unavailable("no such device".into()))?;

        let handle = target.open().map_err(|e| unavailable(e.to_string()))?;
        match handle.reset() {
            Ok(()) => {}
            // the device re-enumerated under a new address
            Err(rusb::Error::NotFound) => {}
            Err(e) => return Err(unavailable(e.to_string())),
        }

        debug!("Reset USB device {:03}:{:03}", bus, device);
        Ok(())
    }

    fn rebind_host_controller(&mut self, driver: &str) -> Result<usize, HardResetError> {
        rebind_driver(&self.pci_drivers_path.join(driver), driver)
    }
}

/// Unbind and rebind every bound instance listed in a driver directory
fn rebind_driver(driver_dir: &Path, driver: &str) -> Result<usize, HardResetError> {
    if !driver_dir.is_dir() {
        return Err(HardResetError::DriverNotFound(driver.to_string()));
    }

    let mut instances: Vec<String> = fs::read_dir(driver_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(|c: char| c.is_ascii_digit()))
        .collect();
    instances.sort();

    for instance in &instances {
        fs::write(driver_dir.join("unbind"), instance)?;
        fs::write(driver_dir.join("bind"), instance)?;
        info!("Rebound {} instance {}", driver, instance);
    }

    Ok(instances.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_driver(root: &Path, name: &str, instances: &[&str]) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for file in ["bind", "unbind", "new_id", "uevent"] {
            fs::write(dir.join(file), "").unwrap();
        }
        fs::create_dir(dir.join("module")).unwrap();
        for instance in instances {
            fs::create_dir(dir.join(instance)).unwrap();
        }
        dir
    }

    #[test]
    fn test_rebind_slot_instances_only() {
        let root = TempDir::new().unwrap();
        let dir = fake_driver(root.path(), "ehci-pci", &["0000:00:1d.0", "0000:00:1a.0"]);
        let mut provider = SystemResetProvider::new(root.path());

        let count = provider.rebind_host_controller("ehci-pci").unwrap();
        assert_eq!(count, 2);
        // instances are processed in sorted order, so the last write wins
        assert_eq!(fs::read_to_string(dir.join("unbind")).unwrap(), "0000:00:1d.0");
        assert_eq!(fs::read_to_string(dir.join("bind")).unwrap(), "0000:00:1d.0");
    }

    #[test]
    fn test_rebind_without_instances() {
        let root = TempDir::new().unwrap();
        fake_driver(root.path(), "xhci_hcd", &[]);
        let mut provider = SystemResetProvider::new(root.path());
        assert_eq!(provider.rebind_host_controller("xhci_hcd").unwrap(), 0);
    }

    #[test]
    fn test_rebind_missing_driver() {
        let root = TempDir::new().unwrap();
        let mut provider = SystemResetProvider::new(root.path());
        assert!(matches!(
            provider.rebind_host_controller("ehci-pci"),
            Err(HardResetError::DriverNotFound(name)) if name == "ehci-pci"
        ));
    }
}
