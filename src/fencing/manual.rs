//! Administrator Override
//!
//! When fencing keeps failing, an administrator who has made sure the
//! victim is really down can declare it fenced by writing the node name
//! into a FIFO. The FIFO only exists while the runner is waiting on it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::stat::Mode;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;

use crate::error::{Error, Result};

/// Longest line read from the FIFO
const OVERRIDE_LINE_MAX: usize = 127;

/// A channel an administrator can use to declare a victim fenced
#[async_trait]
pub trait ManualOverride: Send + Sync {
    /// Wait up to `wait` for an override naming `victim`
    async fn wait_for(&self, victim: &str, wait: Duration) -> Result<bool>;
}

/// Override over a named pipe
#[derive(Debug, Clone)]
pub struct FifoOverride {
    path: PathBuf,
}

/// Removes the FIFO however the wait ends
struct FifoGuard<'a> {
    path: &'a Path,
}

impl Drop for FifoGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("remove override {}: {}", self.path.display(), e);
            }
        }
    }
}

impl FifoOverride {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<pipe::Receiver> {
        nix::unistd::mkfifo(&self.path, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| Error::Override(format!("mkfifo {}: {}", self.path.display(), e)))?;

        let mut options = pipe::OpenOptions::new();
        // holding a write end keeps reads from seeing EOF before a writer shows up
        #[cfg(target_os = "linux")]
        options.read_write(true);

        Ok(options.open_receiver(&self.path)?)
    }
}

/// The name in an override line: everything before the first control character
pub fn override_name(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|b| *b < 0x20).unwrap_or(buf.len());
    &buf[..end]
}

#[async_trait]
impl ManualOverride for FifoOverride {
    async fn wait_for(&self, victim: &str, wait: Duration) -> Result<bool> {
        let _guard = FifoGuard { path: &self.path };

        if victim.is_empty() {
            tokio::time::sleep(wait).await;
            return Ok(false);
        }

        let mut rx = match self.open() {
            Ok(rx) => rx,
            Err(e) => {
                tracing::debug!("check_override open: {}", e);
                tokio::time::sleep(wait).await;
                return Ok(false);
            }
        };

        let mut buf = [0u8; OVERRIDE_LINE_MAX];
        let n = match tokio::time::timeout(wait, rx.read(&mut buf)).await {
            Err(_) => return Ok(false),
            Ok(read) => read.map_err(|e| Error::Override(format!("check_override read: {}", e)))?,
        };

        let name = override_name(&buf[..n]);
        Ok(name.eq_ignore_ascii_case(victim.as_bytes()))
    }
}
