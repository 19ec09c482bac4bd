//! Signaling the front-end HTTP server.
//!
//! The daemon never talks to the server directly; it delivers two Unix
//! signals to the pid recorded in the server's pidfile: HUP to reload
//! configuration (picking up the rewritten block file) and USR1 to
//! reopen the access log after a rotation. A missing pidfile or a stale
//! pid is skipped silently; the server being down is not the daemon's
//! problem.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Where the front-end server records its master pid.
pub const DEFAULT_PIDFILE: &str = "/run/nginx.pid";

/// The server-signaling seam. Production sends real signals; tests
/// count calls.
pub trait ServerControl {
    /// Ask the server to reload its configuration (HUP).
    fn reload(&self) -> io::Result<()>;
    /// Ask the server to reopen its log files (USR1).
    fn reopen_logs(&self) -> io::Result<()>;
}

/// Signals nginx via its pidfile.
#[derive(Debug, Clone)]
pub struct NginxControl {
    pidfile: PathBuf,
}

impl NginxControl {
    pub fn new<P: AsRef<Path>>(pidfile: P) -> Self {
        Self {
            pidfile: pidfile.as_ref().to_path_buf(),
        }
    }

    fn read_pid(&self) -> Option<i32> {
        let content = std::fs::read_to_string(&self.pidfile).ok()?;
        content.trim().parse().ok()
    }

    fn send(&self, signal: Signal) -> io::Result<()> {
        let Some(pid) = self.read_pid() else {
            debug!(pidfile = %self.pidfile.display(), "no server pid, skipping signal");
            return Ok(());
        };
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) => {
                debug!(pid, signal = %signal, "signaled server");
                Ok(())
            }
            // Process gone between pidfile read and kill
            Err(Errno::ESRCH) => {
                debug!(pid, "server process gone, skipping signal");
                Ok(())
            }
            Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }
}

impl ServerControl for NginxControl {
    fn reload(&self) -> io::Result<()> {
        self.send(Signal::SIGHUP)
    }

    fn reopen_logs(&self) -> io::Result<()> {
        self.send(Signal::SIGUSR1)
    }
}

/// A control that records calls without signaling anything, for tests.
#[derive(Debug, Clone, Default)]
pub struct NoopControl {
    reloads: Arc<AtomicUsize>,
    reopens: Arc<AtomicUsize>,
}

impl NoopControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::Relaxed)
    }

    pub fn reopens(&self) -> usize {
        self.reopens.load(Ordering::Relaxed)
    }
}

impl ServerControl for NoopControl {
    fn reload(&self) -> io::Result<()> {
        self.reloads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn reopen_logs(&self) -> io::Result<()> {
        self.reopens.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
