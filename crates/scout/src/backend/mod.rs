//! Bus driver backends

pub mod linux_gpib;

pub use linux_gpib::LinuxGpib;
