//! Device sessions
//!
//! A [`DeviceSession`] owns the descriptor of one discovered instrument and
//! retries failed exchanges through bus recovery. An aborted read usually
//! means the instrument lost the query (a device clear or IFC discards it),
//! so the last command is written again before the read is retried.

use common::{Error, Result};
use protocol::{Address, BusFault, BusPrimitives, ConfigOption, Handle, Timeout};
use tracing::{debug, error, warn};

use crate::bus::BusLink;

/// Bytes read by [`Instrument::exchange`]
pub const DEFAULT_READ_LEN: usize = 512;

/// Bytes read by [`GenericDriver::get`]
pub const DRIVER_READ_LEN: usize = 1024;

/// Command/response surface of an instrument
pub trait Instrument {
    fn write(&mut self, command: &str) -> Result<()>;

    /// Read a response of at most `max_len` bytes, without its line ending
    fn read(&mut self, max_len: usize) -> Result<String>;

    /// Write `command` and read the response
    fn exchange(&mut self, command: &str) -> Result<String> {
        self.write(command)?;
        self.read(DEFAULT_READ_LEN)
    }
}

impl<I: Instrument + ?Sized> Instrument for &mut I {
    fn write(&mut self, command: &str) -> Result<()> {
        (**self).write(command)
    }

    fn read(&mut self, max_len: usize) -> Result<String> {
        (**self).read(max_len)
    }

    fn exchange(&mut self, command: &str) -> Result<String> {
        (**self).exchange(command)
    }
}

pub struct DeviceSession {
    address: Address,
    handle: Handle,
    bus: BusLink,
    /// Extra attempts after the first, per operation
    max_retries: u32,
    /// Replayed after an aborted read
    last_write: Option<String>,
    identification: Option<String>,
    closed: bool,
}

impl DeviceSession {
    pub(crate) fn new(
        address: Address,
        handle: Handle,
        bus: BusLink,
        max_retries: u32,
        identification: String,
    ) -> Self {
        Self {
            address,
            handle,
            bus,
            max_retries,
            last_write: None,
            identification: Some(identification),
            closed: false,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Identification reported during discovery
    pub fn identification(&self) -> Option<&str> {
        self.identification.as_deref()
    }

    /// Last command written, successfully or not
    pub fn last_write(&self) -> Option<&str> {
        self.last_write.as_deref()
    }

    /// Write a command, recovering the bus between failed attempts
    pub fn write(&mut self, command: &str) -> Result<()> {
        self.last_write = Some(command.to_string());
        let handle = self.handle;

        let mut attempt = 1;
        loop {
            let fault = match self.bus.with(|p| p.write(handle, command.as_bytes())) {
                Ok(()) => return Ok(()),
                Err(fault) => fault,
            };
            self.after_failure("write", attempt, fault)?;
            attempt += 1;
        }
    }

    /// Read a response, recovering the bus between failed attempts
    ///
    /// After an aborted read the last command is written again before the
    /// next read. If that replayed write fails too, it is retried with the
    /// read on the following attempt.
    pub fn read(&mut self, max_len: usize) -> Result<String> {
        let handle = self.handle;
        let mut replay = false;

        let mut attempt = 1;
        loop {
            let last_write = self.last_write.as_deref();
            let result = self.bus.with(|p| {
                if replay {
                    if let Some(command) = last_write {
                        debug!("Replaying {:?} to {}", command, handle);
                        p.write(handle, command.as_bytes())?;
                    }
                    replay = false;
                }
                p.read(handle, max_len)
            });

            let fault = match result {
                Ok(bytes) => return Ok(decode(&bytes)),
                Err(fault) => fault,
            };
            if fault.is_aborted() {
                replay = true;
            }
            self.after_failure("read", attempt, fault)?;
            attempt += 1;
        }
    }

    /// Write `command` and read the response
    pub fn exchange(&mut self, command: &str) -> Result<String> {
        self.write(command)?;
        self.read(DEFAULT_READ_LEN)
    }

    /// Give up once the budget is spent, otherwise recover for the next attempt
    fn after_failure(&self, operation: &'static str, attempt: u32, fault: BusFault) -> Result<()> {
        if attempt > self.max_retries {
            error!(
                "{} on address {} failed {} times, giving up: {}",
                operation, self.address, attempt, fault
            );
            return Err(Error::Unrecoverable {
                operation,
                attempts: attempt,
                last_fault: fault,
            });
        }

        warn!(
            "{} on address {} failed (attempt {}/{}): {}, recovering bus",
            operation,
            self.address,
            attempt,
            self.max_retries + 1,
            fault
        );
        self.bus.recover()?;
        Ok(())
    }

    fn pass_through<T>(
        &self,
        f: impl FnOnce(&mut dyn BusPrimitives, Handle) -> std::result::Result<T, BusFault>,
    ) -> Result<T> {
        let handle = self.handle;
        Ok(self.bus.with(|p| f(p, handle))?)
    }

    /// Send Selected Device Clear
    pub fn clear(&self) -> Result<()> {
        self.pass_through(|p, h| p.clear(h))
    }

    /// Pulse IFC on this device's interface
    pub fn interface_clear(&self) -> Result<()> {
        self.pass_through(|p, h| p.interface_clear(h))
    }

    /// Serial poll, returning the status byte
    pub fn serial_poll(&self) -> Result<u8> {
        self.pass_through(|p, h| p.serial_poll(h))
    }

    /// Change a descriptor option, returning its previous value
    pub fn configure(&self, option: ConfigOption, value: i32) -> Result<i32> {
        self.pass_through(|p, h| p.configure(h, option, value))
    }

    pub fn set_timeout(&self, timeout: Timeout) -> Result<()> {
        self.pass_through(|p, h| p.set_timeout(h, timeout))
    }

    pub fn trigger(&self) -> Result<()> {
        self.pass_through(|p, h| p.trigger(h))
    }

    pub fn remote_enable(&self, enable: bool) -> Result<()> {
        self.pass_through(|p, h| p.remote_enable(h, enable))
    }

    pub fn go_to_local(&self) -> Result<()> {
        self.pass_through(|p, h| p.go_to_local(h))
    }

    /// Close the descriptor
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.bus.close(self.address, self.handle)
    }
}

impl Instrument for DeviceSession {
    fn write(&mut self, command: &str) -> Result<()> {
        DeviceSession::write(self, command)
    }

    fn read(&mut self, max_len: usize) -> Result<String> {
        DeviceSession::read(self, max_len)
    }

    fn exchange(&mut self, command: &str) -> Result<String> {
        DeviceSession::exchange(self, command)
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to close session for address {}: {}", self.address, e);
        }
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("address", &self.address)
            .field("handle", &self.handle)
            .field("identification", &self.identification)
            .field("last_write", &self.last_write)
            .finish()
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/// Plain query driver for any instrument
pub struct GenericDriver<I> {
    instrument: I,
}

impl<I: Instrument> GenericDriver<I> {
    pub fn new(instrument: I) -> Self {
        Self { instrument }
    }

    /// Send a query and read up to [`DRIVER_READ_LEN`] bytes of response
    pub fn get(&mut self, command: &str) -> Result<String> {
        self.instrument.write(command)?;
        self.instrument.read(DRIVER_READ_LEN)
    }

    pub fn instrument(&mut self) -> &mut I {
        &mut self.instrument
    }

    pub fn into_inner(self) -> I {
        self.instrument
    }
}
