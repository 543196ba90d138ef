//! Detection of hypervisor processes that exit on their own
//!
//! A [`FailureMonitor`] takes ownership of the launched child and waits on it
//! from a dedicated thread. If the process goes away without a preceding
//! stop, every registered [`FailureObserver`] is told about it and the
//! machine's cancellation token is cancelled, so that anything polling the
//! guest (e.g. waiting for SSH) gives up early. Crashed machines are not
//! restarted.

use std::os::unix::process::ExitStatusExt as _;
use std::process::{Child, ExitStatus};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::process::ProcessSupervisor;

/// An unexpected exit of the hypervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEvent {
    /// State directory of the machine that failed
    pub state_dir: Utf8PathBuf,
    /// Process id of the hypervisor
    pub pid: u32,
    /// Exit code, if the process exited normally
    pub exit_code: Option<i32>,
    /// Terminating signal, if it was killed
    pub signal: Option<i32>,
    /// When the exit was observed
    pub detected_at: DateTime<Utc>,
}

impl FailureEvent {
    fn new(state_dir: Utf8PathBuf, pid: u32, status: ExitStatus) -> Self {
        Self {
            state_dir,
            pid,
            exit_code: status.code(),
            signal: status.signal(),
            detected_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for FailureEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hypervisor (pid {}) for {} ", self.pid, self.state_dir)?;
        match (self.exit_code, self.signal) {
            (Some(code), _) => write!(f, "exited unexpectedly with code {code}"),
            (None, Some(sig)) => write!(f, "was killed by signal {sig}"),
            (None, None) => write!(f, "exited unexpectedly"),
        }
    }
}

/// Receives failure notifications.
///
/// Implemented for closures, so `|event: &FailureEvent| ...` works directly.
pub trait FailureObserver: Send + Sync {
    /// Called once, from the monitor thread, when the process dies unexpectedly
    fn on_failure(&self, event: &FailureEvent);
}

impl<F> FailureObserver for F
where
    F: Fn(&FailureEvent) + Send + Sync,
{
    fn on_failure(&self, event: &FailureEvent) {
        self(event)
    }
}

/// Forwards failure events into a channel
#[derive(Debug)]
pub struct ChannelObserver(Mutex<mpsc::Sender<FailureEvent>>);

impl FailureObserver for ChannelObserver {
    fn on_failure(&self, event: &FailureEvent) {
        if let Ok(tx) = self.0.lock() {
            // The receiver may be gone; nobody is listening then.
            let _ = tx.send(event.clone());
        }
    }
}

/// Create an observer that queues events for the returned receiver
pub fn channel() -> (ChannelObserver, mpsc::Receiver<FailureEvent>) {
    let (tx, rx) = mpsc::channel();
    (ChannelObserver(Mutex::new(tx)), rx)
}

/// A set of observers, all of which are notified
#[derive(Clone, Default)]
pub struct FailureObservers(Vec<Arc<dyn FailureObserver>>);

impl FailureObservers {
    /// Add an observer
    pub fn push(&mut self, observer: impl FailureObserver + 'static) {
        self.0.push(Arc::new(observer));
    }

    /// Builder-style [`Self::push`]
    pub fn with(mut self, observer: impl FailureObserver + 'static) -> Self {
        self.push(observer);
        self
    }

    /// Number of registered observers
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no observer is registered
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn notify(&self, event: &FailureEvent) {
        for observer in &self.0 {
            observer.on_failure(event);
        }
    }
}

impl std::fmt::Debug for FailureObservers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureObservers")
            .field("count", &self.0.len())
            .finish()
    }
}

/// Watches one hypervisor process from a background thread
#[derive(Debug)]
pub struct FailureMonitor {
    pid: u32,
    handle: JoinHandle<Option<FailureEvent>>,
}

impl FailureMonitor {
    /// Start watching `child`, which must have been launched by `supervisor`.
    ///
    /// Returns immediately.
    pub fn attach(
        mut child: Child,
        supervisor: ProcessSupervisor,
        observers: FailureObservers,
        token: CancellationToken,
    ) -> Result<Self> {
        let pid = child.id();
        let handle = std::thread::Builder::new()
            .name(format!("failure-monitor-{pid}"))
            .spawn(move || {
                let status = match child.wait() {
                    Ok(status) => status,
                    Err(e) => {
                        warn!("Lost track of pid {pid}: {e}");
                        return None;
                    }
                };
                match supervisor.record_exit(pid) {
                    Ok(Some(m)) if m.stop_requested => {
                        debug!("pid {pid} exited after stop: {status}");
                        return None;
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        debug!("pid {pid} exited after its state was cleaned: {status}");
                        return None;
                    }
                    Err(e) => warn!("Recording exit of pid {pid}: {e:#}"),
                }
                let event = FailureEvent::new(supervisor.state_dir().to_owned(), pid, status);
                error!("{event}");
                observers.notify(&event);
                token.cancel();
                Some(event)
            })
            .context("Spawning failure monitor thread")?;
        Ok(Self { pid, handle })
    }

    /// Process id being watched
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the watched process has exited and been handled
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the watched process exits.
    ///
    /// Returns the failure, or `None` if the exit followed a stop.
    pub fn wait(self) -> Result<Option<FailureEvent>> {
        self.handle
            .join()
            .map_err(|_| eyre!("failure monitor for pid {} panicked", self.pid))
    }
}
