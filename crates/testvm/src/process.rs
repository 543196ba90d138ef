//! Hypervisor process lifecycle, keyed by state directory
//!
//! The running process is recorded in `<state-dir>/process.json` so that any
//! handle (or another invocation of the CLI) can probe or stop it knowing only
//! the state directory. Output of the child goes to `stdout.log` and
//! `stderr.log` next to it.
//!
//! Once the process has been seen to exit, the metadata is stamped with the
//! exit time and kept. A stamped pid is never probed or signalled again,
//! since the kernel may have handed it to an unrelated process.

use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::process::CommandExt as _;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::{cap_std, cap_std::fs::Dir, dirext::CapStdExtDirExt};
use chrono::{DateTime, Utc};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// File name of the process metadata inside the state directory
pub const PROCESS_METADATA: &str = "process.json";

/// How long `stop` waits after SIGTERM before escalating to SIGKILL
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

const KILL_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What is known about a launched process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProcessMetadata {
    /// Process id of the hypervisor
    pub pid: u32,
    /// Binary that was executed
    pub binary: Utf8PathBuf,
    /// Arguments it was started with
    pub args: Vec<String>,
    /// Launch time
    pub started: DateTime<Utc>,
    /// Set by `stop` before any signal is sent
    #[serde(default)]
    pub stop_requested: bool,
    /// When the process was seen to exit
    #[serde(default)]
    pub exited: Option<DateTime<Utc>>,
}

/// Controls the process bound to one state directory
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    state_dir: Utf8PathBuf,
    stop_timeout: Duration,
}

impl ProcessSupervisor {
    /// Supervisor for the given state directory
    pub fn new(state_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Override the grace period between SIGTERM and SIGKILL
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// The state directory this supervisor owns
    pub fn state_dir(&self) -> &Utf8Path {
        &self.state_dir
    }

    /// Start `binary` detached from the caller's terminal and record it.
    ///
    /// Returns as soon as the process is spawned. The caller owns the returned
    /// child and is responsible for reaping it.
    #[instrument(skip(self, args), fields(state_dir = %self.state_dir))]
    pub fn launch(&self, binary: &Utf8Path, args: &[String]) -> Result<Child> {
        std::fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("Creating state directory {}", self.state_dir))?;
        let stdout = File::create(self.state_dir.join("stdout.log"))?;
        let stderr = File::create(self.state_dir.join("stderr.log"))?;

        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            // Own process group, so a hangup of the launching terminal does not reach it
            .process_group(0)
            .spawn()
            .with_context(|| format!("Failed to spawn {binary}"))?;

        let metadata = ProcessMetadata {
            pid: child.id(),
            binary: binary.to_owned(),
            args: args.to_vec(),
            started: Utc::now(),
            stop_requested: false,
            exited: None,
        };
        if let Err(e) = self.write_metadata(&metadata) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
        info!("Started {binary} with pid {}", metadata.pid);
        Ok(child)
    }

    /// Read the recorded process, if any
    pub fn metadata(&self) -> Result<Option<ProcessMetadata>> {
        let path = self.metadata_path();
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        };
        let metadata = serde_json::from_str(&contents).with_context(|| format!("Parsing {path}"))?;
        Ok(Some(metadata))
    }

    /// Whether the recorded process is running.
    ///
    /// Never fails: a missing state directory or metadata file means not alive.
    pub fn is_alive(&self) -> bool {
        match self.metadata() {
            Ok(Some(m)) => m.exited.is_none() && pid_alive(m.pid),
            Ok(None) => false,
            Err(e) => {
                warn!("Ignoring unreadable process metadata: {e:#}");
                false
            }
        }
    }

    /// Stamp the exit of `pid` into the metadata and return the result.
    ///
    /// Called by whoever observed the exit. Metadata naming another pid is
    /// left alone; `None` means the state directory was cleaned meanwhile.
    pub fn record_exit(&self, pid: u32) -> Result<Option<ProcessMetadata>> {
        let Some(mut metadata) = self.metadata()? else {
            return Ok(None);
        };
        if metadata.pid == pid && metadata.exited.is_none() {
            metadata.exited = Some(Utc::now());
            self.write_metadata(&metadata)?;
        }
        Ok(Some(metadata))
    }

    /// Terminate the recorded process: SIGTERM, then SIGKILL after the grace period.
    ///
    /// Stopping a process that is not running, or was never started, succeeds.
    /// An exit that nobody has recorded yet is left for its observer, so a
    /// crash racing with `stop` is still reported as a crash.
    #[instrument(skip(self), fields(state_dir = %self.state_dir))]
    pub fn stop(&self) -> Result<()> {
        let Some(mut metadata) = self.metadata()? else {
            debug!("No process recorded, nothing to stop");
            return Ok(());
        };
        if metadata.exited.is_some() || !pid_alive(metadata.pid) {
            debug!("pid {} already exited", metadata.pid);
            return Ok(());
        }

        metadata.stop_requested = true;
        self.write_metadata(&metadata)?;

        let pid = to_pid(metadata.pid)?;
        info!("Stopping pid {pid}");
        signal(pid, Signal::SIGTERM)?;
        if !wait_for_exit(metadata.pid, self.stop_timeout) {
            warn!("pid {pid} did not exit within {:?}, killing", self.stop_timeout);
            signal(pid, Signal::SIGKILL)?;
            if !wait_for_exit(metadata.pid, KILL_TIMEOUT) {
                return Err(eyre!("pid {pid} survived SIGKILL"));
            }
        }
        self.record_exit(metadata.pid)?;
        Ok(())
    }

    fn metadata_path(&self) -> Utf8PathBuf {
        self.state_dir.join(PROCESS_METADATA)
    }

    fn write_metadata(&self, metadata: &ProcessMetadata) -> Result<()> {
        let json = serde_json::to_string_pretty(metadata)?;
        let dir = Dir::open_ambient_dir(&self.state_dir, cap_std::ambient_authority())
            .with_context(|| format!("Opening {}", self.state_dir))?;
        dir.atomic_write(PROCESS_METADATA, json)
            .with_context(|| format!("Writing {PROCESS_METADATA}"))?;
        Ok(())
    }
}

fn to_pid(pid: u32) -> Result<Pid> {
    let raw = i32::try_from(pid).map_err(|_| eyre!("Invalid pid {pid}"))?;
    Ok(Pid::from_raw(raw))
}

fn signal(pid: Pid, sig: Signal) -> Result<()> {
    match kill(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(eyre!("Sending {sig:?} to pid {pid}: {e}")),
    }
}

fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while pid_alive(pid) {
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    true
}

/// Check whether a process exists and has not exited.
pub(crate) fn pid_alive(pid: u32) -> bool {
    let Ok(pid_t) = to_pid(pid) else {
        return false;
    };
    if pid_t.as_raw() <= 0 {
        return false;
    }
    match kill(pid_t, None) {
        Ok(()) => !is_zombie(pid),
        // Exists, but owned by someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// An exited child that has not been reaped yet still answers signals.
        fn is_zombie(pid: u32) -> bool {
            // The state follows the parenthesized command name, which may contain spaces
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .and_then(|stat| {
                    stat.rsplit_once(')')
                        .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                })
                .unwrap_or(false)
        }
    } else {
        fn is_zombie(_pid: u32) -> bool {
            false
        }
    }
}
