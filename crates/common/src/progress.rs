//! User-facing progress and status reporting
//!
//! Discovery reports through a [`ProgressSink`] so that a CLI, a GUI or a
//! test can each present it their own way. Sinks are fire-and-forget: they
//! cannot fail and must not block the caller.

use tracing::Level;

pub trait ProgressSink {
    /// Fraction of the work done, in `0.0..=1.0`
    fn report_progress(&self, fraction: f32);

    /// A status line at the given severity
    fn report_line(&self, message: &str, level: Level);
}

/// Sink that forwards everything to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report_progress(&self, fraction: f32) {
        tracing::debug!("Progress: {:>3.0}%", fraction.clamp(0.0, 1.0) * 100.0);
    }

    fn report_line(&self, message: &str, level: Level) {
        match level {
            Level::ERROR => tracing::error!("{}", message),
            Level::WARN => tracing::warn!("{}", message),
            Level::INFO => tracing::info!("{}", message),
            Level::DEBUG => tracing::debug!("{}", message),
            _ => tracing::trace!("{}", message),
        }
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report_progress(&self, _fraction: f32) {}

    fn report_line(&self, _message: &str, _level: Level) {}
}

impl<S: ProgressSink + ?Sized> ProgressSink for &S {
    fn report_progress(&self, fraction: f32) {
        (**self).report_progress(fraction)
    }

    fn report_line(&self, message: &str, level: Level) {
        (**self).report_line(message, level)
    }
}
