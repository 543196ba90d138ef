//! Declarative description of a single test machine

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::disk::DiskSize;
use crate::error::Error;
use crate::failure::FailureObservers;
use crate::utils::{parse_drive_size_mb, parse_memory_to_mb};

/// Size used when auto-provisioning is enabled without explicit sizes, in MB
pub const DEFAULT_DRIVE_SIZE_MB: u64 = 40000;

/// Host port forwarded to the guest's SSH daemon by default
pub const DEFAULT_SSH_PORT: u16 = 2222;

/// Display arguments used when none are configured
pub const DEFAULT_DISPLAY: &str = "-nographic";

/// File name of the monitor socket inside the state directory
pub const MONITOR_SOCKET: &str = "qemu-monitor.sock";

/// Credentials and forwarding for SSH access to the guest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SshConfig {
    /// Login user
    pub user: String,
    /// Password; requires `sshpass` on the host
    pub password: Option<String>,
    /// Private key used instead of a password
    pub key: Option<Utf8PathBuf>,
    /// Host port forwarded to guest port 22
    pub port: u16,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_owned(),
            password: None,
            key: None,
            port: DEFAULT_SSH_PORT,
        }
    }
}

/// Desired shape of one VM.
///
/// Treated as read-only once handed to a machine. Can be loaded from JSON;
/// failure observers are attached in code only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct MachineConfig {
    /// Unique identifier, used to name provisioned disks
    pub id: String,
    /// Guest memory, "2048", "2048M" or "2G"
    pub memory: String,
    /// Number of CPU cores
    pub cpu: u32,
    /// CPU model override passed to `-cpu`
    pub cpu_type: Option<String>,
    /// Target architecture; defaults to the host
    pub arch: Option<String>,
    /// Persistent disks, booted in this order
    pub drives: Vec<Utf8PathBuf>,
    /// Sizes in MB for auto-provisioned disks
    pub drive_sizes: Vec<String>,
    /// Primary installation medium
    pub iso: Option<Utf8PathBuf>,
    /// Secondary medium, e.g. a cloud-init data source
    pub data_source: Option<Utf8PathBuf>,
    /// Create disks from `drive_sizes` when `drives` is empty
    pub auto_drive_setup: bool,
    /// Skip the default user-mode NIC with SSH forwarding
    pub disable_default_networking: bool,
    /// SSH access to the guest
    pub ssh: SshConfig,
    /// Display arguments, split with shell rules; defaults to headless
    pub display: Option<String>,
    /// Extra QEMU arguments, appended verbatim
    pub args: Vec<String>,
    /// Exclusive directory for disks, the monitor socket and process metadata
    pub state_dir: Utf8PathBuf,
    /// Explicit hypervisor binary, skipping the lookup
    pub process: Option<Utf8PathBuf>,
    /// Notified when the hypervisor exits without being stopped
    #[serde(skip)]
    pub on_failure: FailureObservers,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            memory: "2048".to_owned(),
            cpu: 2,
            cpu_type: None,
            arch: None,
            drives: Vec::new(),
            drive_sizes: Vec::new(),
            iso: None,
            data_source: None,
            auto_drive_setup: false,
            disable_default_networking: false,
            ssh: SshConfig::default(),
            display: None,
            args: Vec::new(),
            state_dir: Utf8PathBuf::new(),
            process: None,
            on_failure: FailureObservers::default(),
        }
    }
}

impl MachineConfig {
    /// Load a configuration from a JSON file
    pub fn from_json_file(path: &Utf8Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Reading machine config {path}"))?;
        serde_json::from_str(&contents).with_context(|| format!("Parsing machine config {path}"))
    }

    /// Path of the monitor socket for this machine
    pub fn monitor_socket(&self) -> Utf8PathBuf {
        self.state_dir.join(MONITOR_SOCKET)
    }

    /// Guest memory in megabytes
    pub fn memory_mb(&self) -> Result<u32> {
        parse_memory_to_mb(&self.memory).map_err(|e| Error::InvalidConfig(format!("{e:#}")).into())
    }

    /// Sizes of the disks to auto-provision, falling back to the default
    pub fn drive_sizes(&self) -> Result<Vec<DiskSize>> {
        if self.drive_sizes.is_empty() {
            return Ok(vec![DiskSize::from_mb(DEFAULT_DRIVE_SIZE_MB)]);
        }
        self.drive_sizes
            .iter()
            .map(|s| parse_drive_size_mb(s).map(DiskSize::from_mb))
            .collect()
    }

    /// Display arguments as individual tokens
    pub fn display_args(&self) -> Result<Vec<String>> {
        let display = self.display.as_deref().unwrap_or(DEFAULT_DISPLAY);
        shlex::split(display).ok_or_else(|| {
            Error::InvalidConfig(format!("cannot split display arguments {display:?}")).into()
        })
    }

    /// Check everything that can be checked before touching the filesystem
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidConfig("id must not be empty".into()).into());
        }
        if self.state_dir.as_str().is_empty() {
            return Err(Error::InvalidConfig("state_dir must be set".into()).into());
        }
        if self.cpu == 0 {
            return Err(Error::InvalidConfig("cpu must be at least 1".into()).into());
        }
        self.memory_mb()?;
        if self.auto_drive_setup && self.drives.is_empty() {
            self.drive_sizes()?;
        }
        self.display_args()?;
        Ok(())
    }
}
