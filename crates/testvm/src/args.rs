//! Translation of a [`MachineConfig`] into QEMU command-line arguments
//!
//! Boot order is decided here and nowhere else. Persistent drives get
//! `bootindex` 1..N in the order they are configured. Removable media hang off
//! a single virtio-scsi controller with fixed, lower priorities, so an
//! installed disk wins over the install medium once it is bootable while a
//! blank disk still falls through to the ISO on first boot.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use color_eyre::Result;
use tracing::info;

use crate::arch::ArchConfig;
use crate::config::MachineConfig;
use crate::disk::{disk_file_name, DiskProvisioner, DiskSize};

/// Boot priority of the primary installation medium
pub const PRIMARY_MEDIA_BOOT_INDEX: u32 = 50;
/// Boot priority of the secondary data-source medium
pub const SECONDARY_MEDIA_BOOT_INDEX: u32 = 60;
/// Drive id of the primary installation medium, used for eject
pub const PRIMARY_MEDIA_ID: &str = "cdrom0";
/// Drive id of the secondary data-source medium
pub const SECONDARY_MEDIA_ID: &str = "cdrom1";
/// Id of the shared controller for removable media
pub const SCSI_CONTROLLER_ID: &str = "scsi0";

/// Kind of backing device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Media {
    /// Persistent disk on a virtio-blk device
    Disk,
    /// Read-only optical medium behind the SCSI controller
    Cdrom,
}

/// One storage device as it will be presented to the guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveDescriptor {
    /// QEMU drive id
    pub id: String,
    /// Backing file
    pub file: Utf8PathBuf,
    /// Device type
    pub media: Media,
    /// Firmware boot priority; lower boots first
    pub boot_index: u32,
}

impl DriveDescriptor {
    fn args(&self) -> [String; 4] {
        let Self {
            id,
            file,
            boot_index,
            ..
        } = self;
        match self.media {
            Media::Disk => [
                "-drive".into(),
                format!("if=none,id={id},file={file}"),
                "-device".into(),
                format!("virtio-blk-pci,drive={id},bootindex={boot_index}"),
            ],
            Media::Cdrom => [
                "-drive".into(),
                format!("if=none,id={id},media=cdrom,file={file}"),
                "-device".into(),
                format!("scsi-cd,drive={id},bus={SCSI_CONTROLLER_ID}.0,bootindex={boot_index}"),
            ],
        }
    }
}

/// Lay out persistent drives and removable media with their boot priorities.
///
/// Media priorities are raised past the last persistent drive when there are
/// more than 49 drives, so every priority stays unique.
pub fn drive_descriptors(
    drives: &[Utf8PathBuf],
    iso: Option<&Utf8Path>,
    data_source: Option<&Utf8Path>,
) -> Vec<DriveDescriptor> {
    let mut r: Vec<DriveDescriptor> = drives
        .iter()
        .enumerate()
        .map(|(i, file)| DriveDescriptor {
            id: format!("drv{i}"),
            file: file.clone(),
            media: Media::Disk,
            boot_index: i as u32 + 1,
        })
        .collect();

    let primary_index = PRIMARY_MEDIA_BOOT_INDEX.max(drives.len() as u32 + 1);
    let secondary_index = SECONDARY_MEDIA_BOOT_INDEX.max(primary_index + 1);
    let media = [
        (PRIMARY_MEDIA_ID, iso, primary_index),
        (SECONDARY_MEDIA_ID, data_source, secondary_index),
    ];
    for (id, file, boot_index) in media {
        if let Some(file) = file {
            r.push(DriveDescriptor {
                id: id.to_owned(),
                file: file.to_owned(),
                media: Media::Cdrom,
                boot_index,
            });
        }
    }
    r
}

/// Arguments for a set of drives, adding the SCSI controller before the first medium
pub fn drive_args(descriptors: &[DriveDescriptor]) -> Vec<String> {
    let mut args = Vec::new();
    let mut scsi_added = false;
    for d in descriptors {
        if d.media == Media::Cdrom && !scsi_added {
            args.extend([
                "-device".to_owned(),
                format!("virtio-scsi-pci,id={SCSI_CONTROLLER_ID}"),
            ]);
            scsi_added = true;
        }
        args.extend(d.args());
    }
    args
}

/// Disks that auto-provisioning would create, as (path, size).
///
/// Empty unless `auto_drive_setup` is set and no explicit drives are given.
pub fn auto_drive_plan(config: &MachineConfig) -> Result<Vec<(Utf8PathBuf, DiskSize)>> {
    if !config.auto_drive_setup || !config.drives.is_empty() {
        return Ok(Vec::new());
    }
    let plan = config
        .drive_sizes()?
        .into_iter()
        .enumerate()
        .map(|(i, size)| (config.state_dir.join(disk_file_name(&config.id, i)), size))
        .collect();
    Ok(plan)
}

/// The persistent drives the machine will boot from, without creating anything
pub fn planned_drives(config: &MachineConfig) -> Result<Vec<Utf8PathBuf>> {
    let plan = auto_drive_plan(config)?;
    if plan.is_empty() {
        return Ok(config.drives.clone());
    }
    Ok(plan.into_iter().map(|(path, _)| path).collect())
}

/// Create any auto-provisioned disks and return the persistent drive list
pub fn provision_drives(
    config: &MachineConfig,
    provisioner: &dyn DiskProvisioner,
) -> Result<Vec<Utf8PathBuf>> {
    let plan = auto_drive_plan(config)?;
    if plan.is_empty() {
        return Ok(config.drives.clone());
    }
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("Creating state directory {}", config.state_dir))?;
    plan.into_iter()
        .map(|(path, size)| {
            info!("Creating disk {path} with size {size}");
            provisioner
                .create_image(&path, size)
                .with_context(|| format!("creating disk with size {size}"))?;
            Ok(path)
        })
        .collect()
}

/// Build the full QEMU argument list.
///
/// Pure: `drives` must already exist (see [`provision_drives`]).
pub fn synthesize(
    config: &MachineConfig,
    drives: &[Utf8PathBuf],
    arch: &ArchConfig,
) -> Result<Vec<String>> {
    let descriptors = drive_descriptors(
        drives,
        config.iso.as_deref(),
        config.data_source.as_deref(),
    );
    let mut args = drive_args(&descriptors);

    let memory_mb = config.memory_mb()?;
    args.extend([
        "-m".to_owned(),
        format!("{memory_mb}M"),
        "-smp".to_owned(),
        format!("cores={}", config.cpu),
        "-rtc".to_owned(),
        "base=utc,clock=rt".to_owned(),
        // Always present, screendump and eject go through it
        "-monitor".to_owned(),
        format!("unix:{},server,nowait", config.monitor_socket()),
        "-device".to_owned(),
        "virtio-serial".to_owned(),
    ]);

    if !config.disable_default_networking {
        args.extend([
            "-nic".to_owned(),
            format!("user,hostfwd=tcp::{}-:22", config.ssh.port),
        ]);
    }

    args.extend(config.display_args()?);

    if let Some(cpu) = config.cpu_type.as_deref().or(arch.default_cpu) {
        args.extend(["-cpu".to_owned(), cpu.to_owned()]);
    }

    args.extend(config.args.iter().cloned());

    if let Some(machine) = arch.machine {
        args.extend(["-machine".to_owned(), machine.to_owned()]);
    }

    args.extend(["-boot".to_owned(), "order=dc,menu=on".to_owned()]);
    Ok(args)
}
