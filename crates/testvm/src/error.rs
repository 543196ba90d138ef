//! Typed failure cases that callers may want to match on.
//!
//! Everything in this crate returns [`color_eyre::Result`]; the variants here
//! are the root causes carried inside those reports. Use
//! `report.downcast_ref::<Error>()` to inspect them.

use camino::Utf8PathBuf;

/// Errors raised by machine provisioning and control.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No hypervisor binary was found in any searched location.
    #[error("{binary} not found in {} or PATH", format_searched(.searched))]
    BinaryNotFound {
        /// Binary name that was looked up
        binary: String,
        /// Directories checked before falling back to PATH
        searched: Vec<Utf8PathBuf>,
    },

    /// The machine configuration cannot be turned into a launch.
    #[error("invalid machine configuration: {0}")]
    InvalidConfig(String),

    /// A drive size was not a positive megabyte count.
    #[error("invalid drive size {0:?}: expected a positive number of megabytes")]
    InvalidSize(String),

    /// The disk image tool failed.
    #[error("creating disk {path} with size {size}: {output}")]
    Provision {
        /// Image that was being created
        path: Utf8PathBuf,
        /// Requested size, with unit
        size: String,
        /// Output of the failed tool
        output: String,
    },

    /// A monitor command was not written in one transfer.
    #[error("didn't send the full command ({written} out of {expected} bytes)")]
    ShortWrite {
        /// Bytes accepted by the channel
        written: usize,
        /// Length of the command line
        expected: usize,
    },

    /// The state directory cannot be removed while the hypervisor runs.
    #[error("refusing to clean {state_dir}: the machine is still running, stop it first")]
    StillRunning {
        /// State directory of the live machine
        state_dir: Utf8PathBuf,
    },
}

fn format_searched(searched: &[Utf8PathBuf]) -> String {
    let dirs: Vec<&str> = searched.iter().map(|p| p.as_str()).collect();
    format!("[{}]", dirs.join(", "))
}
