//! Test utilities for gpib-scout
//!
//! Scriptable stand-ins for the bus driver, the USB reset facilities and
//! the progress sink. Each mock is a cheap handle onto shared state, so a
//! test can hand one clone to the code under test and keep another to
//! script faults and inspect the recorded call trace.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{BusCall, MockBus, MockOp};
//! use protocol::{Address, BusFault, BusPrimitives, DeviceSettings};
//!
//! let bus = MockBus::new();
//! bus.add_device(3, "INSTR-A");
//! bus.fail_next(MockOp::Write, BusFault::Aborted("timeout".into()));
//!
//! let mut driver = bus.clone();
//! let handle = driver.open(Address::new(3).unwrap(), &DeviceSettings::default()).unwrap();
//! assert!(driver.write(handle, b"*IDN?").is_err());
//! driver.write(handle, b"*IDN?").unwrap();
//! assert_eq!(driver.read(handle, 512).unwrap(), b"INSTR-A\n");
//! assert_eq!(bus.count(|c| matches!(c, BusCall::Write(..))), 2);
//! ```

use protocol::{
    Address, BusFault, BusPrimitives, ConfigOption, DeviceSettings, Handle, HardResetError,
    HardResetProvider, Timeout, UsbDeviceEntry, UsbId,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::Level;

use crate::progress::ProgressSink;

/// Identification query answered by every mock device
pub const IDENTIFY_COMMAND: &str = "*IDN?";

/// First descriptor number handed out, as linux-gpib does after the boards
const FIRST_HANDLE: i32 = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Primitive selector used to script faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Open,
    Write,
    Read,
    Clear,
    InterfaceClear,
    Reconfigure,
}

/// One recorded primitive call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCall {
    Open(u8),
    Close(Handle),
    Write(Handle, String),
    Read(Handle),
    Clear(Handle),
    InterfaceClear(Handle),
    SerialPoll(Handle),
    Configure(Handle, i32, i32),
    SetTimeout(Handle, Timeout),
    Trigger(Handle),
    RemoteEnable(Handle, bool),
    GoToLocal(Handle),
    Reconfigure,
}

#[derive(Default)]
struct BusState {
    /// Identification string per responding primary address
    devices: HashMap<u8, String>,
    /// Canned replies per (address, command)
    responses: HashMap<(u8, String), String>,
    /// Open descriptors and the address they point at
    handles: HashMap<Handle, u8>,
    /// Last command written to each descriptor, consumed by a read
    pending: HashMap<Handle, String>,
    next_handle: i32,
    faults: HashMap<MockOp, VecDeque<BusFault>>,
    persistent: HashMap<MockOp, BusFault>,
    /// Addresses whose reads always fail
    jammed: HashMap<u8, BusFault>,
    status_byte: u8,
    trace: Vec<BusCall>,
}

impl BusState {
    fn take_fault(&mut self, op: MockOp) -> Option<BusFault> {
        if let Some(fault) = self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            return Some(fault);
        }
        self.persistent.get(&op).cloned()
    }

    fn address_of(&self, handle: Handle) -> Result<u8, BusFault> {
        self.handles
            .get(&handle)
            .copied()
            .ok_or_else(|| BusFault::Other(format!("bad descriptor {}", handle)))
    }

    fn present(&self, handle: Handle) -> Result<u8, BusFault> {
        let address = self.address_of(handle)?;
        if self.devices.contains_key(&address) {
            Ok(address)
        } else {
            Err(BusFault::NotPresent(format!("no listener at {}", address)))
        }
    }
}

/// In-memory GPIB bus with scriptable devices and faults
#[derive(Clone)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                next_handle: FIRST_HANDLE,
                ..BusState::default()
            })),
        }
    }

    /// Attach a device answering the identification query with `idn`
    pub fn add_device(&self, address: u8, idn: &str) {
        lock(&self.state).devices.insert(address, idn.to_string());
    }

    /// Detach the device at `address`
    pub fn remove_device(&self, address: u8) {
        lock(&self.state).devices.remove(&address);
    }

    /// Reply `reply` whenever `command` was the last write to `address`
    pub fn set_response(&self, address: u8, command: &str, reply: &str) {
        lock(&self.state)
            .responses
            .insert((address, command.to_string()), reply.to_string());
    }

    /// Fail the next call of `op` with `fault`; calls queue up
    pub fn fail_next(&self, op: MockOp, fault: BusFault) {
        lock(&self.state).faults.entry(op).or_default().push_back(fault);
    }

    /// Fail every call of `op` with `fault` once queued faults are used up
    pub fn fail_always(&self, op: MockOp, fault: BusFault) {
        lock(&self.state).persistent.insert(op, fault);
    }

    /// Fail every read from `address` with `fault`
    pub fn jam(&self, address: u8, fault: BusFault) {
        lock(&self.state).jammed.insert(address, fault);
    }

    /// Stop failing `op` persistently
    pub fn heal(&self, op: MockOp) {
        lock(&self.state).persistent.remove(&op);
    }

    pub fn set_status_byte(&self, status: u8) {
        lock(&self.state).status_byte = status;
    }

    /// Every recorded call, in order
    pub fn trace(&self) -> Vec<BusCall> {
        lock(&self.state).trace.clone()
    }

    /// Number of recorded calls matching `pred`
    pub fn count(&self, pred: impl Fn(&BusCall) -> bool) -> usize {
        lock(&self.state).trace.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_trace(&self) {
        lock(&self.state).trace.clear();
    }

    /// Descriptors currently open
    pub fn open_handles(&self) -> HashSet<Handle> {
        lock(&self.state).handles.keys().copied().collect()
    }
}

impl BusPrimitives for MockBus {
    fn open(&mut self, primary: Address, _settings: &DeviceSettings) -> Result<Handle, BusFault> {
        let mut state = lock(&self.state);
        state.trace.push(BusCall::Open(primary.value()));
        if let Some(fault) = state.take_fault(MockOp::Open) {
            return Err(fault);
        }
        let handle = Handle(state.next_handle);
        state.next_handle += 1;
        state.handles.insert(handle, primary.value());
        Ok(handle)
    }

    fn close(&mut self, handle: Handle) -> Result<(), BusFault> {
        let mut state = lock(&self.state);
        state.trace.push(BusCall::Close(handle));
        state.pending.remove(&handle);
        state
            .handles
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| BusFault::Other(format!("bad descriptor {}", handle)))
    }

    fn write(&mut self, handle: Handle, data: &[u8]) -> Result<(), BusFault> {
        let mut state = lock(&self.state);
        let command = String::from_utf8_lossy(data).into_owned();
        state.trace.push(BusCall::Write(handle, command.clone()));
        state.present(handle)?;
        if let Some(fault) = state.take_fault(MockOp::Write) {
            return Err(fault);
        }
        state.pending.insert(handle, command);
        Ok(())
    }

    fn read(&mut self, handle: Handle, max_len: usize) -> Result<Vec<u8>, BusFault> {
        let mut state = lock(&self.state);
        state.trace.push(BusCall::Read(handle));
        let address = state.present(handle)?;
        if let Some(fault) = state.jammed.get(&address).cloned() {
            state.pending.remove(&handle);
            return Err(fault);
        }
        if let Some(fault) = state.take_fault(MockOp::Read) {
            // an aborted transaction loses the device's reply
            if fault.is_aborted() {
                state.pending.remove(&handle);
            }
            return Err(fault);
        }
        let command = state
            .pending
            .remove(&handle)
            .ok_or_else(|| BusFault::Aborted("no data pending, read timed out".into()))?;
        let reply = if command == IDENTIFY_COMMAND {
            state.devices.get(&address).cloned().unwrap_or_default()
        } else {
            state
                .responses
                .get(&(address, command))
                .cloned()
                .unwrap_or_default()
        };
        let mut bytes = format!("{}\n", reply).into_bytes();
        bytes.truncate(max_len);
        Ok(bytes)
    }

    fn clear(&mut self, handle: Handle) -> Result<(), BusFault> {
        let mut state = lock(&self.state);
        state.trace.push(BusCall::Clear(handle));
        state.present(handle)?;
        if let Some(fault) = state.take_fault(MockOp::Clear) {
            return Err(fault);
        }
        state.pending.remove(&handle);
        Ok(())
    }

    fn interface_clear(&mut self, handle: Handle) -> Result<(), BusFault> {
        let mut state = lock(&self.state);
        state.trace.push(BusCall::InterfaceClear(handle));
        state.address_of(handle)?;
        match state.take_fault(MockOp::InterfaceClear) {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn serial_poll(&mut self, handle: Handle) -> Result<u8, BusFault> {
        let mut state = lock(&self.state);
        state.trace.push(BusCall::SerialPoll(handle));
        state.present(handle)?;
        Ok(state.status_byte)
    }

    fn configure(
        &mut self,
        handle: Handle,
        option: ConfigOption,
        value: i32,
    ) -> Result<i32, BusFault> {
        let mut state = lock(&self.state);
        state.trace.push(BusCall::Configure(handle, option.0, value));
        state.address_of(handle)?;
        Ok(0)
    }

    fn set_timeout(&mut self, handle: Handle, timeout: Timeout) -> Result<(), BusFault> {
        let mut state = lock(&self.state);
        state.trace.push(BusCall::SetTimeout(handle, timeout));
        state.address_of(handle).map(|_| ())
    }

    fn trigger(&mut self, handle: Handle) -> Result<(), BusFault> {
        let mut state = lock(&self.state);
        state.trace.push(BusCall::Trigger(handle));
        state.present(handle).map(|_| ())
    }

    fn remote_enable(&mut self, handle: Handle, enable: bool) -> Result<(), BusFault> {
        let mut state = lock(&self.state);
        state.trace.push(BusCall::RemoteEnable(handle, enable));
        state.address_of(handle).map(|_| ())
    }

    fn go_to_local(&mut self, handle: Handle) -> Result<(), BusFault> {
        let mut state = lock(&self.state);
        state.trace.push(BusCall::GoToLocal(handle));
        state.present(handle).map(|_| ())
    }

    fn reconfigure(&mut self) -> Result<(), BusFault> {
        let mut state = lock(&self.state);
        state.trace.push(BusCall::Reconfigure);
        match state.take_fault(MockOp::Reconfigure) {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

/// One recorded reset call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetCall {
    List,
    ResetDevice(u8, u8),
    Rebind(String),
}

#[derive(Default)]
struct ResetState {
    devices: Vec<UsbDeviceEntry>,
    failing_devices: HashSet<(u8, u8)>,
    fail_list: bool,
    fail_rebind: bool,
    controllers: usize,
    trace: Vec<ResetCall>,
}

/// USB topology stand-in recording every reset request
#[derive(Clone)]
pub struct MockHardReset {
    state: Arc<Mutex<ResetState>>,
}

impl Default for MockHardReset {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHardReset {
    /// Topology with one host controller instance and no devices
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ResetState {
                controllers: 1,
                ..ResetState::default()
            })),
        }
    }

    /// Plug in a USB device
    pub fn add_device(&self, bus: u8, device: u8, vendor: u16, product: u16) {
        lock(&self.state).devices.push(UsbDeviceEntry {
            bus_number: bus,
            device_address: device,
            id: UsbId::new(vendor, product),
        });
    }

    /// Make resets of one device fail as busy
    pub fn fail_device(&self, bus: u8, device: u8) {
        lock(&self.state).failing_devices.insert((bus, device));
    }

    pub fn fail_listing(&self, fail: bool) {
        lock(&self.state).fail_list = fail;
    }

    pub fn fail_rebind(&self, fail: bool) {
        lock(&self.state).fail_rebind = fail;
    }

    pub fn trace(&self) -> Vec<ResetCall> {
        lock(&self.state).trace.clone()
    }

    pub fn count(&self, pred: impl Fn(&ResetCall) -> bool) -> usize {
        lock(&self.state).trace.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_trace(&self) {
        lock(&self.state).trace.clear();
    }
}

impl HardResetProvider for MockHardReset {
    fn list_usb_devices(&mut self) -> Result<Vec<UsbDeviceEntry>, HardResetError> {
        let mut state = lock(&self.state);
        state.trace.push(ResetCall::List);
        if state.fail_list {
            return Err(HardResetError::Enumeration("lsusb failed".into()));
        }
        Ok(state.devices.clone())
    }

    fn reset_usb_device(&mut self, bus: u8, device: u8) -> Result<(), HardResetError> {
        let mut state = lock(&self.state);
        state.trace.push(ResetCall::ResetDevice(bus, device));
        if state.failing_devices.contains(&(bus, device)) {
            return Err(HardResetError::DeviceUnavailable {
                bus,
                device,
                message: "resource busy".into(),
            });
        }
        Ok(())
    }

    fn rebind_host_controller(&mut self, driver: &str) -> Result<usize, HardResetError> {
        let mut state = lock(&self.state);
        state.trace.push(ResetCall::Rebind(driver.to_string()));
        if state.fail_rebind {
            return Err(HardResetError::DriverNotFound(driver.to_string()));
        }
        Ok(state.controllers)
    }
}

/// Progress sink that keeps everything it is told
#[derive(Default)]
pub struct RecordingProgress {
    fractions: Mutex<Vec<f32>>,
    lines: Mutex<Vec<(Level, String)>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fractions(&self) -> Vec<f32> {
        lock(&self.fractions).clone()
    }

    pub fn lines(&self) -> Vec<(Level, String)> {
        lock(&self.lines).clone()
    }

    /// Whether any line contains `needle`
    pub fn saw(&self, needle: &str) -> bool {
        lock(&self.lines).iter().any(|(_, line)| line.contains(needle))
    }
}

impl ProgressSink for RecordingProgress {
    fn report_progress(&self, fraction: f32) {
        lock(&self.fractions).push(fraction);
    }

    fn report_line(&self, message: &str, level: Level) {
        lock(&self.lines).push((level, message.to_string()));
    }
}
