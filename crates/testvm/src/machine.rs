//! Backend-independent interface to a test machine

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::Result;
use tokio_util::sync::CancellationToken;

use crate::config::MachineConfig;

/// A disposable VM that can be started, driven and torn down.
///
/// Implementations own their configuration; it does not change after
/// construction.
pub trait Machine: std::fmt::Debug + Send {
    /// The configuration this machine was built from
    fn config(&self) -> &MachineConfig;

    /// Provision, launch and start watching the machine.
    ///
    /// Returns once the hypervisor is spawned, not when the guest is up. The
    /// returned token is a child of `parent` and is cancelled if the
    /// hypervisor exits without being stopped.
    fn create(&mut self, parent: &CancellationToken) -> Result<CancellationToken>;

    /// Terminate the hypervisor. Succeeds if it is not running.
    fn stop(&mut self) -> Result<()>;

    /// Remove the state directory. Fails while the machine is alive.
    fn clean(&mut self) -> Result<()>;

    /// Whether the hypervisor process is running
    fn alive(&self) -> bool;

    /// Capture the framebuffer and return the path it is written to
    fn screenshot(&self) -> Result<Utf8PathBuf>;

    /// Eject the installation medium
    fn detach_cd(&self) -> Result<()>;

    /// Run a shell command in the guest and return its standard output
    fn command(&self, cmd: &str) -> Result<String>;

    /// Copy a host file into the guest and set its mode, e.g. `"0644"`
    fn send_file(&self, src: &Utf8Path, dst: &str, permissions: &str) -> Result<()>;

    /// Copy a guest file to the host
    fn receive_file(&self, src: &str, dst: &Utf8Path) -> Result<()>;
}
