//! The QEMU implementation of [`Machine`]

use std::ffi::OsString;
use std::io::ErrorKind;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use color_eyre::Result;
use itertools::Itertools;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::arch::ArchConfig;
use crate::args::{planned_drives, provision_drives, synthesize};
use crate::config::MachineConfig;
use crate::disk::{DiskProvisioner, QemuImg};
use crate::error::Error;
use crate::failure::FailureMonitor;
use crate::machine::Machine;
use crate::monitor::MonitorClient;
use crate::process::ProcessSupervisor;
use crate::ssh::SshController;

/// Directories searched for the system emulator before falling back to PATH
pub const QEMU_SEARCH_DIRS: &[&str] = &[
    "/home/linuxbrew/.linuxbrew/bin",
    "/usr/local/bin",
    "/usr/bin",
    "/opt/homebrew/bin",
    "/usr/local/homebrew/bin",
];

/// Locate `qemu-system-<arch>` in the usual install locations, then PATH
pub fn find_qemu_binary(arch: &ArchConfig) -> Result<Utf8PathBuf> {
    let dirs = QEMU_SEARCH_DIRS.iter().map(Utf8Path::new).collect::<Vec<_>>();
    find_binary(&arch.qemu_binary(), &dirs, std::env::var_os("PATH"))
}

/// Return the first `dirs/<name>` that is a file, else look `name` up in `path`.
pub fn find_binary(
    name: &str,
    dirs: &[&Utf8Path],
    path: Option<OsString>,
) -> Result<Utf8PathBuf> {
    if let Some(found) = dirs.iter().map(|d| d.join(name)).find(|p| p.is_file()) {
        debug!("Found {name} at {found}");
        return Ok(found);
    }
    let cwd = std::env::current_dir().context("Querying current directory")?;
    let not_found = || Error::BinaryNotFound {
        binary: name.to_owned(),
        searched: dirs.iter().map(|d| d.to_path_buf()).collect(),
    };
    let found = which::which_in(name, path, cwd).map_err(|_| not_found())?;
    Utf8PathBuf::try_from(found).map_err(|_| not_found().into())
}

/// A VM backed by a local QEMU process
#[derive(Debug)]
pub struct QemuMachine {
    config: MachineConfig,
    arch: ArchConfig,
    provisioner: Box<dyn DiskProvisioner>,
    supervisor: ProcessSupervisor,
    monitor: MonitorClient,
    ssh: SshController,
    failure_monitor: Option<FailureMonitor>,
}

impl QemuMachine {
    /// Validate `config` and build a machine for it; nothing is started yet
    pub fn new(config: MachineConfig) -> Result<Self> {
        config.validate()?;
        let arch = ArchConfig::resolve(config.arch.as_deref());
        let supervisor = ProcessSupervisor::new(config.state_dir.clone());
        let monitor = MonitorClient::new(config.monitor_socket());
        let ssh = SshController::new(config.ssh.clone());
        Ok(Self {
            config,
            arch,
            provisioner: Box::new(QemuImg::default()),
            supervisor,
            monitor,
            ssh,
            failure_monitor: None,
        })
    }

    /// Use a different tool for auto-provisioned disks
    pub fn with_provisioner(mut self, provisioner: impl DiskProvisioner + 'static) -> Self {
        self.provisioner = Box::new(provisioner);
        self
    }

    /// Override the SIGTERM grace period used by [`Machine::stop`]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.supervisor = self.supervisor.with_stop_timeout(timeout);
        self
    }

    /// Override how long monitor commands wait for the socket to go quiet
    pub fn with_quiescence(mut self, quiescence: Duration) -> Self {
        self.monitor = self.monitor.with_quiescence(quiescence);
        self
    }

    /// The hypervisor binary that `create` will run
    pub fn binary(&self) -> Result<Utf8PathBuf> {
        match &self.config.process {
            Some(process) => Ok(process.clone()),
            None => find_qemu_binary(&self.arch).context("Failed to find QEMU binary"),
        }
    }

    /// Arguments `create` would pass, without provisioning anything
    pub fn launch_args(&self) -> Result<Vec<String>> {
        let drives = planned_drives(&self.config)?;
        synthesize(&self.config, &drives, &self.arch)
    }

    /// Hand over the watcher of the running process, e.g. to block on it
    pub fn take_failure_monitor(&mut self) -> Option<FailureMonitor> {
        self.failure_monitor.take()
    }

    /// Supervisor of this machine's process
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }
}

impl Machine for QemuMachine {
    fn config(&self) -> &MachineConfig {
        &self.config
    }

    #[instrument(skip_all, fields(id = %self.config.id, state_dir = %self.config.state_dir))]
    fn create(&mut self, parent: &CancellationToken) -> Result<CancellationToken> {
        info!("Create qemu machine");
        // Fail before any disk is created
        let binary = self.binary()?;

        let drives = provision_drives(&self.config, self.provisioner.as_ref())?;
        let args = synthesize(&self.config, &drives, &self.arch)?;

        info!(
            "Starting VM with {binary} [ Memory: {}, CPU: {} ]",
            self.config.memory, self.config.cpu
        );
        for d in &drives {
            info!("HD at {d}");
        }
        if let Some(iso) = &self.config.iso {
            info!("ISO at {iso}");
        }
        debug!("QEMU args: {}", args.iter().join(" "));

        let child = self.supervisor.launch(&binary, &args)?;
        let token = parent.child_token();
        let monitor = FailureMonitor::attach(
            child,
            self.supervisor.clone(),
            self.config.on_failure.clone(),
            token.clone(),
        )?;
        self.failure_monitor = Some(monitor);
        Ok(token)
    }

    fn stop(&mut self) -> Result<()> {
        self.supervisor.stop()?;
        if let Some(monitor) = self.failure_monitor.take() {
            // The process is gone, so this only reaps it
            monitor.wait()?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(state_dir = %self.config.state_dir))]
    fn clean(&mut self) -> Result<()> {
        if self.supervisor.is_alive() {
            return Err(Error::StillRunning {
                state_dir: self.config.state_dir.clone(),
            }
            .into());
        }
        match std::fs::remove_dir_all(&self.config.state_dir) {
            Ok(()) => {
                info!("Removed {}", self.config.state_dir);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Removing {}", self.config.state_dir)),
        }
    }

    fn alive(&self) -> bool {
        self.supervisor.is_alive()
    }

    fn screenshot(&self) -> Result<Utf8PathBuf> {
        self.monitor.screendump()
    }

    fn detach_cd(&self) -> Result<()> {
        self.monitor.eject(None)
    }

    fn command(&self, cmd: &str) -> Result<String> {
        self.ssh.command(cmd)
    }

    fn send_file(&self, src: &Utf8Path, dst: &str, permissions: &str) -> Result<()> {
        self.ssh.send_file(src, dst, permissions)
    }

    fn receive_file(&self, src: &str, dst: &Utf8Path) -> Result<()> {
        self.ssh.receive_file(src, dst)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;

    use tempfile::TempDir;

    use super::*;
    use crate::disk::DiskSize;
    use crate::failure::{self, FailureEvent};

    fn utf8(td: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap()
    }

    fn write_executable(path: &Utf8Path, contents: &str) {
        std::fs::write(path, contents).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn config(td: &TempDir) -> MachineConfig {
        MachineConfig {
            id: "vm1".into(),
            state_dir: utf8(td).join("state"),
            ..Default::default()
        }
    }

    /// A fake hypervisor that ignores its arguments
    fn fake_qemu(td: &TempDir, script: &str) -> Utf8PathBuf {
        let path = utf8(td).join("fake-qemu");
        write_executable(&path, &format!("#!/bin/sh\n{script}\n"));
        path
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(10) {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }

    #[derive(Debug)]
    struct Touch;

    impl DiskProvisioner for Touch {
        fn create_image(&self, path: &Utf8Path, _size: DiskSize) -> Result<()> {
            std::fs::write(path, b"")?;
            Ok(())
        }
    }

    #[test]
    fn test_find_binary_prefers_fixed_dirs() {
        let td = TempDir::new().unwrap();
        let root = utf8(&td);
        let (first, second, on_path) = (root.join("a"), root.join("b"), root.join("path"));
        for d in [&first, &second, &on_path] {
            std::fs::create_dir(d).unwrap();
        }
        write_executable(&second.join("qemu-system-x86_64"), "");
        write_executable(&on_path.join("qemu-system-x86_64"), "");

        let found = find_binary(
            "qemu-system-x86_64",
            &[first.as_path(), second.as_path()],
            Some(on_path.as_str().into()),
        )
        .unwrap();
        assert_eq!(found, second.join("qemu-system-x86_64"));

        // Falls back to PATH
        let found = find_binary(
            "qemu-system-x86_64",
            &[first.as_path()],
            Some(on_path.as_str().into()),
        )
        .unwrap();
        assert_eq!(found, on_path.join("qemu-system-x86_64"));
    }

    #[test]
    fn test_find_binary_names_searched_dirs() {
        let td = TempDir::new().unwrap();
        let root = utf8(&td);
        let err = find_binary(
            "qemu-system-riscv64",
            &[root.join("x").as_path(), root.join("y").as_path()],
            Some(root.as_str().into()),
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("qemu-system-riscv64 not found in"), "{msg}");
        assert!(msg.contains(root.join("x").as_str()), "{msg}");
        assert!(msg.contains(root.join("y").as_str()), "{msg}");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::BinaryNotFound { searched, .. }) if searched.len() == 2
        ));
    }

    #[test]
    fn test_never_started() {
        let td = TempDir::new().unwrap();
        let mut m = QemuMachine::new(config(&td)).unwrap();
        assert!(!m.alive());
        m.stop().unwrap();
        m.stop().unwrap();
        m.clean().unwrap();
        assert!(!m.alive());
    }

    #[test]
    fn test_launch_args_do_not_provision() {
        let td = TempDir::new().unwrap();
        let mut c = config(&td);
        c.auto_drive_setup = true;
        c.arch = Some("x86_64".into());
        let m = QemuMachine::new(c).unwrap();
        let args = m.launch_args().unwrap();
        let disk = utf8(&td).join("state/vm1-0.img");
        assert!(args.contains(&format!("if=none,id=drv0,file={disk}")));
        assert!(!disk.exists());
    }

    #[test]
    fn test_missing_binary_fails_before_provisioning() {
        let td = TempDir::new().unwrap();
        let mut c = config(&td);
        c.auto_drive_setup = true;
        c.arch = Some("no-such-arch".into());
        let mut m = QemuMachine::new(c).unwrap().with_provisioner(Touch);
        let err = m.create(&CancellationToken::new()).unwrap_err();
        assert!(format!("{err:#}").contains("qemu-system-no-such-arch not found"));
        assert!(!utf8(&td).join("state").exists());
    }

    #[test]
    fn test_create_stop_clean() {
        let td = TempDir::new().unwrap();
        let mut c = config(&td);
        c.process = Some(fake_qemu(&td, "exec sleep 30"));
        c.auto_drive_setup = true;
        c.drive_sizes = vec!["64".into()];
        let (tx, rx) = failure::channel();
        c.on_failure.push(tx);
        let state_dir = c.state_dir.clone();

        let mut m = QemuMachine::new(c)
            .unwrap()
            .with_provisioner(Touch)
            .with_stop_timeout(Duration::from_secs(5));
        let parent = CancellationToken::new();
        let token = m.create(&parent).unwrap();
        assert!(state_dir.join("vm1-0.img").exists());
        assert!(wait_until(|| m.alive()));

        let recorded = m.supervisor().metadata().unwrap().unwrap();
        assert!(recorded.args.contains(&"order=dc,menu=on".to_owned()));

        let err = m.clean().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::StillRunning { .. })
        ));
        assert!(state_dir.exists());

        m.stop().unwrap();
        assert!(!m.alive());
        assert!(!token.is_cancelled());
        assert!(rx.try_recv().is_err());

        m.clean().unwrap();
        assert!(!state_dir.exists());
        assert!(!m.alive());
    }

    #[test]
    fn test_crash_cancels_token() {
        let td = TempDir::new().unwrap();
        let mut c = config(&td);
        c.process = Some(fake_qemu(&td, "sleep 1; exit 7"));
        let (tx, rx) = failure::channel();
        c.on_failure.push(tx);

        let mut m = QemuMachine::new(c).unwrap();
        let token = m.create(&CancellationToken::new()).unwrap();
        let event: FailureEvent = m.take_failure_monitor().unwrap().wait().unwrap().unwrap();
        assert_eq!(event.exit_code, Some(7));
        assert!(token.is_cancelled());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), event);
        assert!(!m.alive());
        let recorded = m.supervisor().metadata().unwrap().unwrap();
        assert_eq!(recorded.pid, event.pid);
        assert!(recorded.exited.is_some());
        m.stop().unwrap();
        m.clean().unwrap();
    }
}
