//! Cross-process advisory lock on the bus
//!
//! Another process resetting the adapter in the middle of our discovery run
//! (or vice versa) leaves both sides confused, so resets and discovery hold an
//! exclusive `flock` on a well-known file. The lock is re-entrant within the
//! process: discovery holds it while the recoveries it triggers take it again.

use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct AdvisoryLock {
    path: Option<PathBuf>,
    held: Option<Flock<File>>,
    depth: u32,
}

impl AdvisoryLock {
    /// Lock on `path`, or a no-op lock when `path` is `None`
    pub fn new(path: Option<&Path>) -> Self {
        Self {
            path: path.map(Path::to_path_buf),
            held: None,
            depth: 0,
        }
    }

    /// Lock that never touches the filesystem
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_held(&self) -> bool {
        self.depth > 0
    }

    /// Take the lock, blocking until no other process holds it
    pub fn acquire(&mut self) -> io::Result<()> {
        if self.depth == 0
            && let Some(path) = &self.path
        {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(path)?;
            let flock = Flock::lock(file, FlockArg::LockExclusive)
                .map_err(|(_, errno)| io::Error::from(errno))?;
            debug!("Acquired bus lock {}", path.display());
            self.held = Some(flock);
        }
        self.depth += 1;
        Ok(())
    }

    /// Drop one level of the lock, unlocking at the outermost level
    pub fn release(&mut self) {
        if self.depth == 0 {
            return;
        }
        self.depth -= 1;
        if self.depth == 0
            && let Some(flock) = self.held.take()
        {
            if let Err((_, errno)) = flock.unlock() {
                warn!("Failed to release bus lock: {}", errno);
            } else {
                debug!("Released bus lock");
            }
        }
    }
}
