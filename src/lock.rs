// src/lock.rs

//! Repository lock
//!
//! A directory (created atomically with `mkdir`) guards the installed
//! package state; a `pid` file inside records the holder. Acquisition is
//! reentrant within a process through a counter. A lock whose holder is
//! no longer running, or that is older than two hours, is reclaimed. A lock
//! without a readable pid is only reclaimed once it is older than
//! [`PIDLESS_LOCK_GRACE`], since its holder may still be writing the pid.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::cell::Cell;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Locks older than this are assumed stuck
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(2 * 60 * 60);

/// How long a lock without a readable pid counts as held
pub const PIDLESS_LOCK_GRACE: Duration = Duration::from_secs(30);

const PID_FILE: &str = "pid";

pub struct Lock {
    dir: PathBuf,
    depth: Cell<u32>,
    force: bool,
}

/// Releases one level of the lock when dropped
pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Whether a process with this PID exists
fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM: exists but belongs to someone else
        Err(_) => true,
    }
}

impl Lock {
    /// `force` reclaims any existing lock without checks
    pub fn new(dir: impl Into<PathBuf>, force: bool) -> Self {
        Self {
            dir: dir.into(),
            depth: Cell::new(0),
            force,
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn is_held(&self) -> bool {
        self.depth.get() > 0
    }

    /// PID recorded by the current holder, if readable
    fn holder(&self) -> Option<i32> {
        fs::read_to_string(self.dir.join(PID_FILE))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn age(&self) -> Option<Duration> {
        let modified = fs::metadata(self.dir.join(PID_FILE))
            .or_else(|_| fs::metadata(&self.dir))
            .and_then(|m| m.modified())
            .ok()?;
        SystemTime::now().duration_since(modified).ok()
    }

    fn reclaim(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::LockError(format!(
                "Failed to remove stale lock {}: {}",
                self.dir.display(),
                e
            ))),
        }
    }

    pub fn acquire(&self) -> Result<LockGuard<'_>> {
        if self.is_held() {
            self.depth.set(self.depth.get() + 1);
            return Ok(LockGuard { lock: self });
        }

        if let Some(parent) = self.dir.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::LockError(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        // One retry after reclaiming a stale lock
        for _ in 0..2 {
            match fs::create_dir(&self.dir) {
                Ok(()) => {
                    fs::write(self.dir.join(PID_FILE), std::process::id().to_string()).map_err(|e| {
                        Error::LockError(format!("Failed to write lock pid file: {}", e))
                    })?;
                    self.depth.set(1);
                    debug!("Acquired lock {}", self.dir.display());
                    return Ok(LockGuard { lock: self });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.force {
                        warn!("Forcibly removing lock {}", self.dir.display());
                        self.reclaim()?;
                        continue;
                    }

                    let Some(pid) = self.holder() else {
                        if self.age().is_some_and(|age| age > PIDLESS_LOCK_GRACE) {
                            warn!("Lock {} has no readable pid, removing it", self.dir.display());
                            self.reclaim()?;
                            continue;
                        }
                        return Err(Error::LockError(format!(
                            "tpkg repository {} is being locked by another process",
                            self.dir.display()
                        )));
                    };

                    if !process_alive(pid) {
                        info!("Removing stale lock held by exited PID {}", pid);
                        self.reclaim()?;
                        continue;
                    }

                    if self.age().is_some_and(|age| age > STALE_LOCK_AGE) {
                        warn!("Lock held by PID {} is more than two hours old, removing it", pid);
                        self.reclaim()?;
                        continue;
                    }

                    return Err(Error::LockError(format!(
                        "tpkg repository {} locked by PID {}",
                        self.dir.display(),
                        pid
                    )));
                }
                Err(e) => {
                    return Err(Error::LockError(format!(
                        "Failed to create lock {}: {}",
                        self.dir.display(),
                        e
                    )));
                }
            }
        }

        Err(Error::LockError(format!("Unable to acquire lock {}", self.dir.display())))
    }

    fn release(&self) {
        match self.depth.get() {
            0 => {}
            1 => {
                self.depth.set(0);
                if let Err(e) = fs::remove_dir_all(&self.dir) {
                    warn!("Failed to remove lock {}: {}", self.dir.display(), e);
                } else {
                    debug!("Released lock {}", self.dir.display());
                }
            }
            n => self.depth.set(n - 1),
        }
    }
}
