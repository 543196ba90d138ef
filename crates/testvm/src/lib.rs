//! Disposable QEMU virtual machines for system tests.
//!
//! A [`MachineConfig`] describes the VM: memory, CPUs, disks, install and
//! data-source media, SSH credentials. [`QemuMachine`] turns it into a
//! running hypervisor whose state (disk images, the monitor socket, process
//! metadata and logs) lives in a private state directory.
//!
//! ```no_run
//! use testvm::{Machine, MachineConfig, QemuMachine};
//! use tokio_util::sync::CancellationToken;
//!
//! # fn main() -> color_eyre::Result<()> {
//! let config = MachineConfig {
//!     iso: Some("/srv/install.iso".into()),
//!     auto_drive_setup: true,
//!     state_dir: "/tmp/vm1".into(),
//!     ..Default::default()
//! };
//! let mut vm = QemuMachine::new(config)?;
//! let token = vm.create(&CancellationToken::new())?;
//! testvm::matcher::eventually_connects(&vm, &token)?;
//! let shot = vm.screenshot()?;
//! println!("screenshot at {shot}");
//! vm.stop()?;
//! vm.clean()?;
//! # Ok(())
//! # }
//! ```

pub mod arch;
pub mod args;
pub mod config;
pub mod disk;
pub mod error;
pub mod failure;
pub mod machine;
pub mod matcher;
pub mod monitor;
pub mod process;
pub mod qemu;
pub mod ssh;
mod utils;

pub use config::{MachineConfig, SshConfig};
pub use error::Error;
pub use failure::{FailureEvent, FailureObserver, FailureObservers};
pub use machine::Machine;
pub use qemu::QemuMachine;
