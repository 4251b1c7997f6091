//! Bus driver over the linux-gpib user-space library
//!
//! Every call returns the `ibsta` status word; when its ERR bit is set the
//! thread-local `iberr` says why. ENOL (no listener) and EABO (I/O aborted,
//! usually a timeout) are reported as their own fault kinds so that callers
//! can tell an empty address from a wedged bus.

use protocol::{Address, BusFault, BusPrimitives, ConfigOption, DeviceSettings, Handle, Timeout};
use std::ffi::{c_char, c_int, c_long, c_void};
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

#[link(name = "gpib")]
unsafe extern "C" {
    fn ibdev(board_index: c_int, pad: c_int, sad: c_int, tmo: c_int, eot: c_int, eos: c_int)
    -> c_int;
    fn ibonl(ud: c_int, online: c_int) -> c_int;
    fn ibwrt(ud: c_int, buf: *const c_void, count: c_long) -> c_int;
    fn ibrd(ud: c_int, buf: *mut c_void, count: c_long) -> c_int;
    fn ibclr(ud: c_int) -> c_int;
    fn ibsic(ud: c_int) -> c_int;
    fn ibrsp(ud: c_int, status_byte: *mut c_char) -> c_int;
    fn ibconfig(ud: c_int, option: c_int, value: c_int) -> c_int;
    fn ibtmo(ud: c_int, timeout: c_int) -> c_int;
    fn ibtrg(ud: c_int) -> c_int;
    fn ibsre(ud: c_int, enable: c_int) -> c_int;
    fn ibloc(ud: c_int) -> c_int;
    fn ThreadIberr() -> c_int;
    fn ThreadIbcntl() -> c_long;
}

/// ibsta error bit
const ERR: c_int = 0x8000;

const ENOL: c_int = 2;
const EABO: c_int = 6;

fn error_name(code: c_int) -> &'static str {
    match code {
        0 => "EDVR system error",
        1 => "ECIC not controller in charge",
        2 => "ENOL no listeners",
        3 => "EADR not addressed",
        4 => "EARG invalid argument",
        5 => "ESAC not system controller",
        6 => "EABO I/O aborted",
        7 => "ENEB no such board",
        8 => "EDMA DMA error",
        10 => "EOIP I/O in progress",
        11 => "ECAP capability not supported",
        12 => "EFSO file system error",
        14 => "EBUS bus command error",
        15 => "ESTB status byte lost",
        16 => "ESRQ SRQ stuck",
        20 => "ETAB table problem",
        _ => "unknown error",
    }
}

fn check(status: c_int, call: &str) -> Result<c_int, BusFault> {
    if status & ERR == 0 {
        return Ok(status);
    }
    // SAFETY: reads the calling thread's error slot, no arguments
    let code = unsafe { ThreadIberr() };
    let message = format!("{} failed: {} (iberr {})", call, error_name(code), code);
    Err(match code {
        ENOL => BusFault::NotPresent(message),
        EABO => BusFault::Aborted(message),
        _ => BusFault::Other(message),
    })
}

/// One linux-gpib board
pub struct LinuxGpib {
    board_index: i32,
    gpib_config: PathBuf,
}

impl LinuxGpib {
    pub fn new(board_index: i32) -> Self {
        Self {
            board_index,
            gpib_config: PathBuf::from("gpib_config"),
        }
    }

    /// Use a `gpib_config` binary outside `PATH`
    pub fn with_gpib_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.gpib_config = path.into();
        self
    }
}

impl BusPrimitives for LinuxGpib {
    fn open(&mut self, primary: Address, settings: &DeviceSettings) -> Result<Handle, BusFault> {
        // SAFETY: plain integer arguments
        let ud = unsafe {
            ibdev(
                self.board_index,
                c_int::from(primary.value()),
                c_int::from(settings.secondary.value()),
                settings.timeout.code(),
                c_int::from(settings.send_eoi),
                c_int::from(settings.eos_mode.0),
            )
        };
        if ud < 0 {
            // SAFETY: as in `check`
            let code = unsafe { ThreadIberr() };
            return Err(BusFault::Other(format!(
                "ibdev({}) failed: {} (iberr {})",
                primary,
                error_name(code),
                code
            )));
        }
        debug!("ibdev({}) = {}", primary, ud);
        Ok(Handle(ud))
    }

    fn close(&mut self, handle: Handle) -> Result<(), BusFault> {
        // SAFETY: integer arguments; a stale descriptor is reported via ibsta
        check(unsafe { ibonl(handle.0, 0) }, "ibonl").map(|_| ())
    }

    fn write(&mut self, handle: Handle, data: &[u8]) -> Result<(), BusFault> {
        let count = c_long::try_from(data.len())
            .map_err(|_| BusFault::Other(format!("write of {} bytes too large", data.len())))?;
        // SAFETY: `data` is valid for `count` bytes for the duration of the call
        check(
            unsafe { ibwrt(handle.0, data.as_ptr().cast(), count) },
            "ibwrt",
        )
        .map(|_| ())
    }

    fn read(&mut self, handle: Handle, max_len: usize) -> Result<Vec<u8>, BusFault> {
        let count = c_long::try_from(max_len)
            .map_err(|_| BusFault::Other(format!("read of {} bytes too large", max_len)))?;
        let mut buffer = vec![0u8; max_len];
        // SAFETY: `buffer` is writable for `count` bytes for the duration of the call
        check(
            unsafe { ibrd(handle.0, buffer.as_mut_ptr().cast(), count) },
            "ibrd",
        )?;
        // SAFETY: reads the calling thread's byte count, no arguments
        let received = usize::try_from(unsafe { ThreadIbcntl() }).unwrap_or(0);
        buffer.truncate(received.min(max_len));
        Ok(buffer)
    }

    fn clear(&mut self, handle: Handle) -> Result<(), BusFault> {
        // SAFETY: integer argument
        check(unsafe { ibclr(handle.0) }, "ibclr").map(|_| ())
    }

    fn interface_clear(&mut self, handle: Handle) -> Result<(), BusFault> {
        // SAFETY: integer argument
        check(unsafe { ibsic(handle.0) }, "ibsic").map(|_| ())
    }

    fn serial_poll(&mut self, handle: Handle) -> Result<u8, BusFault> {
        let mut status: c_char = 0;
        // SAFETY: `status` outlives the call
        check(unsafe { ibrsp(handle.0, &mut status) }, "ibrsp")?;
        Ok(status as u8)
    }

    fn configure(
        &mut self,
        handle: Handle,
        option: ConfigOption,
        value: i32,
    ) -> Result<i32, BusFault> {
        // SAFETY: integer arguments
        check(unsafe { ibconfig(handle.0, option.0, value) }, "ibconfig")?;
        // ibconfig leaves the previous value in iberr
        // SAFETY: as in `check`
        Ok(unsafe { ThreadIberr() })
    }

    fn set_timeout(&mut self, handle: Handle, timeout: Timeout) -> Result<(), BusFault> {
        // SAFETY: integer arguments
        check(unsafe { ibtmo(handle.0, timeout.code()) }, "ibtmo").map(|_| ())
    }

    fn trigger(&mut self, handle: Handle) -> Result<(), BusFault> {
        // SAFETY: integer argument
        check(unsafe { ibtrg(handle.0) }, "ibtrg").map(|_| ())
    }

    fn remote_enable(&mut self, handle: Handle, enable: bool) -> Result<(), BusFault> {
        // SAFETY: integer arguments
        check(unsafe { ibsre(handle.0, c_int::from(enable)) }, "ibsre").map(|_| ())
    }

    fn go_to_local(&mut self, handle: Handle) -> Result<(), BusFault> {
        // SAFETY: integer argument
        check(unsafe { ibloc(handle.0) }, "ibloc").map(|_| ())
    }

    fn reconfigure(&mut self) -> Result<(), BusFault> {
        let status = Command::new(&self.gpib_config)
            .arg("--minor")
            .arg(self.board_index.to_string())
            .status()
            .map_err(|e| {
                BusFault::Other(format!("failed to run {}: {}", self.gpib_config.display(), e))
            })?;
        if !status.success() {
            return Err(BusFault::Other(format!(
                "{} exited with {}",
                self.gpib_config.display(),
                status
            )));
        }
        debug!("Board {} reconfigured", self.board_index);
        Ok(())
    }
}
