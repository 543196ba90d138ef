//! Client for the QEMU human monitor socket
//!
//! Each command opens a fresh connection, writes one `\r\n`-terminated line
//! and then reads replies until a fixed deadline passes. QEMU only
//! carries out a `screendump` once the connection is read from, so the drain
//! is part of the protocol. Replies are not parsed.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use color_eyre::Result;
use tracing::{debug, instrument, trace};

use crate::args::PRIMARY_MEDIA_ID;
use crate::error::Error;

/// How long a command may spend draining replies after its write
pub const DEFAULT_QUIESCENCE: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 1024;

/// A byte stream whose reads can time out
pub trait Channel: Read + Write {
    /// Bound every subsequent read by `timeout`
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;
}

impl Channel for UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        UnixStream::set_read_timeout(self, timeout)
    }
}

/// Sends commands to the monitor of one machine
#[derive(Debug, Clone)]
pub struct MonitorClient {
    socket_path: Utf8PathBuf,
    quiescence: Duration,
}

impl MonitorClient {
    /// Client for the monitor listening at `socket_path`
    pub fn new(socket_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            quiescence: DEFAULT_QUIESCENCE,
        }
    }

    /// Override how long to drain replies after each command
    pub fn with_quiescence(mut self, quiescence: Duration) -> Self {
        self.quiescence = quiescence;
        self
    }

    /// Socket this client talks to
    pub fn socket_path(&self) -> &Utf8Path {
        &self.socket_path
    }

    /// Ask QEMU to write the framebuffer to a new file and return its path.
    ///
    /// The file is written by QEMU; whether it exists when this returns
    /// depends on the hypervisor.
    #[instrument(skip(self), fields(socket = %self.socket_path))]
    pub fn screendump(&self) -> Result<Utf8PathBuf> {
        let path = screenshot_path()?;
        self.send(&format!("screendump {path}"))?;
        debug!("Requested screenshot {path}");
        Ok(path)
    }

    /// Forcibly eject the medium in `device`, default `cdrom0`
    #[instrument(skip(self), fields(socket = %self.socket_path))]
    pub fn eject(&self, device: Option<&str>) -> Result<()> {
        let device = device.unwrap_or(PRIMARY_MEDIA_ID);
        self.send(&format!("eject -f {device}"))
    }

    fn send(&self, command: &str) -> Result<()> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .with_context(|| format!("Connecting to monitor socket {}", self.socket_path))?;
        execute(&mut stream, command, self.quiescence)
    }
}

fn screenshot_path() -> Result<Utf8PathBuf> {
    let tmp = Utf8PathBuf::try_from(std::env::temp_dir()).context("Non-UTF-8 temporary directory")?;
    Ok(tmp.join(format!("qemu-screenshot-{}.png", uuid::Uuid::new_v4())))
}

/// Write `command` as one line, then drain the channel.
///
/// The drain ends at EOF, on a read error, or once `quiescence` has elapsed
/// since the write, even if the monitor keeps talking.
pub fn execute<C: Channel>(chan: &mut C, command: &str, quiescence: Duration) -> Result<()> {
    let line = format!("{command}\r\n");
    let written = chan
        .write(line.as_bytes())
        .context("Writing monitor command")?;
    if written != line.len() {
        return Err(Error::ShortWrite {
            written,
            expected: line.len(),
        }
        .into());
    }

    let deadline = Instant::now() + quiescence;
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        chan.set_read_timeout(Some(remaining))
            .context("Setting monitor read timeout")?;
        match chan.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => trace!("monitor: {}", String::from_utf8_lossy(&buf[..n])),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
            Err(e) => {
                debug!("Monitor read ended: {e}");
                break;
            }
        }
    }
    Ok(())
}
