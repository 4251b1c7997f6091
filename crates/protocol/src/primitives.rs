//! Contracts for the collaborators the bus layer drives
//!
//! [`BusPrimitives`] is the GPIB driver, [`HardResetProvider`] the
//! operating system's USB and PCI reset facilities. Both are blocking.

use crate::error::{BusFault, HardResetError};
use crate::types::{Address, ConfigOption, DeviceSettings, Handle, Timeout};
use crate::usb::UsbDeviceEntry;

/// Driver-level operations on device descriptors and the board
pub trait BusPrimitives: Send {
    /// Open a descriptor for the device at `primary`
    fn open(&mut self, primary: Address, settings: &DeviceSettings) -> Result<Handle, BusFault>;

    /// Release a descriptor
    fn close(&mut self, handle: Handle) -> Result<(), BusFault>;

    fn write(&mut self, handle: Handle, data: &[u8]) -> Result<(), BusFault>;

    /// Read up to `max_len` bytes
    fn read(&mut self, handle: Handle, max_len: usize) -> Result<Vec<u8>, BusFault>;

    /// Send Selected Device Clear
    fn clear(&mut self, handle: Handle) -> Result<(), BusFault>;

    /// Pulse IFC on the interface the descriptor belongs to
    fn interface_clear(&mut self, handle: Handle) -> Result<(), BusFault>;

    fn serial_poll(&mut self, handle: Handle) -> Result<u8, BusFault>;

    /// Change a descriptor option, returning its previous value
    fn configure(&mut self, handle: Handle, option: ConfigOption, value: i32)
    -> Result<i32, BusFault>;

    fn set_timeout(&mut self, handle: Handle, timeout: Timeout) -> Result<(), BusFault>;

    /// Send Group Execute Trigger
    fn trigger(&mut self, handle: Handle) -> Result<(), BusFault>;

    /// Assert or release REN
    fn remote_enable(&mut self, handle: Handle, enable: bool) -> Result<(), BusFault>;

    /// Return the device to local control
    fn go_to_local(&mut self, handle: Handle) -> Result<(), BusFault>;

    /// Reload the board configuration
    ///
    /// Fails when no bus adapter is attached.
    fn reconfigure(&mut self) -> Result<(), BusFault>;
}

/// Operating-system level USB and host controller resets
pub trait HardResetProvider: Send {
    fn list_usb_devices(&mut self) -> Result<Vec<UsbDeviceEntry>, HardResetError>;

    /// Issue a USB port reset to one device
    fn reset_usb_device(&mut self, bus: u8, device: u8) -> Result<(), HardResetError>;

    /// Unbind and rebind every PCI instance of a host controller driver
    ///
    /// Only instances whose identifier starts with a digit (PCI slot names
    /// such as `0000:00:1d.0`) are touched. Returns how many were rebound.
    fn rebind_host_controller(&mut self, driver: &str) -> Result<usize, HardResetError>;
}

impl<T: BusPrimitives + ?Sized> BusPrimitives for Box<T> {
    fn open(&mut self, primary: Address, settings: &DeviceSettings) -> Result<Handle, BusFault> {
        (**self).open(primary, settings)
    }

    fn close(&mut self, handle: Handle) -> Result<(), BusFault> {
        (**self).close(handle)
    }

    fn write(&mut self, handle: Handle, data: &[u8]) -> Result<(), BusFault> {
        (**self).write(handle, data)
    }

    fn read(&mut self, handle: Handle, max_len: usize) -> Result<Vec<u8>, BusFault> {
        (**self).read(handle, max_len)
    }

    fn clear(&mut self, handle: Handle) -> Result<(), BusFault> {
        (**self).clear(handle)
    }

    fn interface_clear(&mut self, handle: Handle) -> Result<(), BusFault> {
        (**self).interface_clear(handle)
    }

    fn serial_poll(&mut self, handle: Handle) -> Result<u8, BusFault> {
        (**self).serial_poll(handle)
    }

    fn configure(
        &mut self,
        handle: Handle,
        option: ConfigOption,
        value: i32,
    ) -> Result<i32, BusFault> {
        (**self).configure(handle, option, value)
    }

    fn set_timeout(&mut self, handle: Handle, timeout: Timeout) -> Result<(), BusFault> {
        (**self).set_timeout(handle, timeout)
    }

    fn trigger(&mut self, handle: Handle) -> Result<(), BusFault> {
        (**self).trigger(handle)
    }

    fn remote_enable(&mut self, handle: Handle, enable: bool) -> Result<(), BusFault> {
        (**self).remote_enable(handle, enable)
    }

    fn go_to_local(&mut self, handle: Handle) -> Result<(), BusFault> {
        (**self).go_to_local(handle)
    }

    fn reconfigure(&mut self) -> Result<(), BusFault> {
        (**self).reconfigure()
    }
}

impl<T: HardResetProvider + ?Sized> HardResetProvider for Box<T> {
    fn list_usb_devices(&mut self) -> Result<Vec<UsbDeviceEntry>, HardResetError> {
        (**self).list_usb_devices()
    }

    fn reset_usb_device(&mut self, bus: u8, device: u8) -> Result<(), HardResetError> {
        (**self).reset_usb_device(bus, device)
    }

    fn rebind_host_controller(&mut self, driver: &str) -> Result<usize, HardResetError> {
        (**self).rebind_host_controller(driver)
    }
}
