//! Common utilities for gpib-scout
//!
//! This crate provides functionality shared by the bus layer and its
//! front ends: the error taxonomy, logging setup, progress reporting, and
//! mock collaborators for tests.

pub mod error;
pub mod logging;
pub mod progress;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use progress::{NullProgress, ProgressSink, TracingProgress};
