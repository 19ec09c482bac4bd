//! Rotation-aware log tailing.
//!
//! Follows the access log the way the rest of the pipeline needs it:
//! an ordered stream of lines that survives rotation. Between bursts of
//! up to 1024 lines the tailer stats the path; if the file has been
//! swapped (inode change) it reopens at the start of the new file, and
//! if the file has outgrown the size ceiling the tailer rotates it
//! itself: rename to a sidecar archive, recreate an empty file with the
//! previous owner and mode, and tell the server to reopen its log
//! descriptor. The primary path disappearing is fatal; everything else
//! is routine.

use crate::server::ServerControl;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Lines read between maintenance stats in follow mode.
const BURST_LINES: usize = 1024;

/// Size ceiling before the tailer rotates the log itself.
const MAX_LOG_SIZE: u64 = 1 << 30;

/// Sleep when caught up with the writer, and after a rotation.
const CATCH_UP_SLEEP: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TailError {
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("log file disappeared: {}", .0.display())]
    LogDisappeared(PathBuf),
}

/// Whether the tailer stops at EOF or follows the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailMode {
    /// Yield to EOF, then end. For one-shot processing of a static file.
    Once,
    /// Follow indefinitely, sleeping when caught up.
    Follow,
}

/// A line source over a possibly rotating log file.
pub struct LogTailer<C> {
    path: PathBuf,
    reader: BufReader<File>,
    inode: u64,
    mode: TailMode,
    control: C,
    shutdown: Arc<AtomicBool>,
    burst: usize,
    max_size: u64,
}

impl<C: ServerControl> LogTailer<C> {
    /// Open the log file. Fails if the file cannot be opened — a missing
    /// log at startup is a configuration problem, not a transient one.
    pub async fn open<P: AsRef<Path>>(
        path: P,
        mode: TailMode,
        control: C,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, TailError> {
        let path = path.as_ref().to_path_buf();
        let (reader, inode) = open_reader(&path).await?;
        Ok(Self {
            path,
            reader,
            inode,
            mode,
            control,
            shutdown,
            burst: 0,
            max_size: MAX_LOG_SIZE,
        })
    }

    /// The next log line, without its trailing newline.
    ///
    /// Returns `Ok(None)` at EOF in once mode, or when shutdown has been
    /// requested in follow mode.
    pub async fn next_line(&mut self) -> Result<Option<String>, TailError> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested, stopping tail");
                return Ok(None);
            }

            if self.mode == TailMode::Follow && self.burst >= BURST_LINES {
                self.burst = 0;
                self.maintain().await?;
            }

            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|source| self.io_error(source))?;

            if read > 0 {
                self.burst += 1;
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                return Ok(Some(line));
            }

            match self.mode {
                TailMode::Once => return Ok(None),
                TailMode::Follow => {
                    self.burst = 0;
                    self.maintain().await?;
                    tokio::time::sleep(CATCH_UP_SLEEP).await;
                }
            }
        }
    }

    /// Stat the path and handle growth past the ceiling or an external
    /// rotation.
    async fn maintain(&mut self) -> Result<(), TailError> {
        let meta = tokio::fs::metadata(&self.path)
            .await
            .map_err(|_| TailError::LogDisappeared(self.path.clone()))?;

        if meta.len() > self.max_size {
            self.rotate(meta.uid(), meta.gid(), meta.mode()).await?;
        } else if meta.ino() != self.inode {
            info!(path = %self.path.display(), "log file replaced, reopening");
            self.reopen().await?;
        }
        Ok(())
    }

    /// Rotate the oversized log: archive it, recreate it for the server
    /// (same owner and mode), signal a log reopen, and settle for a
    /// second before reading the fresh file.
    async fn rotate(&mut self, uid: u32, gid: u32, mode: u32) -> Result<(), TailError> {
        let archive = archive_path(&self.path);
        info!(
            path = %self.path.display(),
            archive = %archive.display(),
            "log exceeded size ceiling, rotating"
        );

        tokio::fs::rename(&self.path, &archive)
            .await
            .map_err(|source| self.io_error(source))?;
        File::create(&self.path)
            .await
            .map_err(|source| self.io_error(source))?;

        let perms = {
            use std::os::unix::fs::PermissionsExt;
            std::fs::Permissions::from_mode(mode & 0o7777)
        };
        tokio::fs::set_permissions(&self.path, perms)
            .await
            .map_err(|source| self.io_error(source))?;
        if let Err(e) = std::os::unix::fs::chown(&self.path, Some(uid), Some(gid)) {
            // Running unprivileged; the server will still write via its
            // open descriptor until the reopen signal lands.
            warn!(error = %e, "could not restore log file owner");
        }

        if let Err(e) = self.control.reopen_logs() {
            warn!(error = %e, "log reopen signal failed");
        }
        tokio::time::sleep(CATCH_UP_SLEEP).await;
        self.reopen().await
    }

    /// Reopen the path from the start and re-record its identity.
    async fn reopen(&mut self) -> Result<(), TailError> {
        let (reader, inode) = open_reader(&self.path).await?;
        self.reader = reader;
        self.inode = inode;
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> TailError {
        TailError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

async fn open_reader(path: &Path) -> Result<(BufReader<File>, u64), TailError> {
    let file = File::open(path).await.map_err(|source| TailError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let meta = file.metadata().await.map_err(|source| TailError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((BufReader::new(file), meta.ino()))
}

/// Sidecar archive path for a rotated log (`access.log` → `access.log.old`).
fn archive_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".old");
    PathBuf::from(name)
}
