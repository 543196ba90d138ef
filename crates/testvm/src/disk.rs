//! Creation of sparse disk images for new machines

use std::process::Command;

use camino::Utf8Path;
use color_eyre::eyre::Context;
use color_eyre::Result;
use tracing::{debug, instrument};

use crate::error::Error;

/// Size of a disk image, in megabytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DiskSize(u64);

impl DiskSize {
    /// A size of `mb` megabytes
    pub fn from_mb(mb: u64) -> Self {
        Self(mb)
    }

    /// The size in megabytes
    pub fn megabytes(&self) -> u64 {
        self.0
    }
}

/// Formats with the unit suffix `qemu-img` expects, e.g. `10240M`
impl std::fmt::Display for DiskSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}M", self.0)
    }
}

/// File name of the `index`th auto-provisioned disk of machine `id`
pub fn disk_file_name(id: &str, index: usize) -> String {
    format!("{id}-{index}.img")
}

/// Something that can materialize an empty disk image
pub trait DiskProvisioner: std::fmt::Debug + Send + Sync {
    /// Create an image at `path` with the given virtual size
    fn create_image(&self, path: &Utf8Path, size: DiskSize) -> Result<()>;
}

/// Creates sparse qcow2 images with `qemu-img`
#[derive(Debug, Clone)]
pub struct QemuImg {
    binary: String,
}

impl Default for QemuImg {
    fn default() -> Self {
        Self {
            binary: "qemu-img".to_owned(),
        }
    }
}

impl QemuImg {
    /// Use a specific `qemu-img` binary
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, path: &Utf8Path, size: DiskSize) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["create", "-f", "qcow2", path.as_str(), &size.to_string()]);
        cmd
    }
}

impl DiskProvisioner for QemuImg {
    #[instrument(skip(self))]
    fn create_image(&self, path: &Utf8Path, size: DiskSize) -> Result<()> {
        debug!("Creating {size} qcow2 image at {path}");
        let output = self
            .command(path, size)
            .output()
            .with_context(|| format!("Failed to run {}", self.binary))?;
        if !output.status.success() {
            let mut out = String::from_utf8_lossy(&output.stdout).into_owned();
            out.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(Error::Provision {
                path: path.to_owned(),
                size: size.to_string(),
                output: out.trim().to_owned(),
            }
            .into());
        }
        Ok(())
    }
}
