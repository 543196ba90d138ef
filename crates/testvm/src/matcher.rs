//! Helpers for test suites driving a [`Machine`]
//!
//! Everything here takes the machine explicitly; [`Vm`] bundles an owned
//! machine with the token returned when it was started.

use std::os::unix::fs::PermissionsExt as _;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::machine::Machine;

/// How long [`eventually_connects`] waits for the guest by default
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(360);
/// Delay between connection attempts
pub const DEFAULT_CONNECT_INTERVAL: Duration = Duration::from_secs(5);
/// Pause after issuing a reboot before polling again
pub const REBOOT_SETTLE: Duration = Duration::from_secs(60);
/// How long a rebooted guest has to come back
pub const REBOOT_TIMEOUT: Duration = Duration::from_secs(750);

const CANCEL_POLL: Duration = Duration::from_millis(100);

fn quote(s: &str) -> Result<String> {
    shlex::try_quote(s)
        .map(|q| q.into_owned())
        .map_err(|e| eyre!("Cannot quote {s:?}: {e}"))
}

/// Run `cmd` as root through `sudo /bin/sh -c`
pub fn sudo(m: &dyn Machine, cmd: &str) -> Result<String> {
    m.command(&format!("sudo /bin/sh -c {}", quote(cmd)?))
}

fn test_path(m: &dyn Machine, flag: &str, path: &str) -> Result<bool> {
    let out = m.command(&format!(
        "if [ {flag} {} ]; then echo ok; else echo wrong; fi",
        quote(path)?
    ))?;
    Ok(out == "ok\n")
}

/// Whether `path` is a regular file in the guest
pub fn has_file(m: &dyn Machine, path: &str) -> Result<bool> {
    test_path(m, "-f", path)
}

/// Whether `path` is a directory in the guest
pub fn has_dir(m: &dyn Machine, path: &str) -> Result<bool> {
    test_path(m, "-d", path)
}

/// Wait with the default timeout until the guest answers over SSH
pub fn eventually_connects(m: &dyn Machine, token: &CancellationToken) -> Result<()> {
    eventually_connects_with(m, token, DEFAULT_CONNECT_TIMEOUT, DEFAULT_CONNECT_INTERVAL)
}

/// Poll `echo ping` until it answers, `timeout` passes, or `token` is cancelled.
///
/// The token returned from [`Machine::create`] is cancelled when the
/// hypervisor dies, which ends the wait right away.
pub fn eventually_connects_with(
    m: &dyn Machine,
    token: &CancellationToken,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let start = Instant::now();
    let mut attempts = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(eyre!("Machine {} stopped while waiting for SSH", m.config().id));
        }
        attempts += 1;
        match m.command("echo ping") {
            Ok(out) if out == "ping\n" => {
                info!("Connected after {attempts} attempt(s)");
                return Ok(());
            }
            Ok(out) => debug!("Unexpected reply {out:?}"),
            Err(e) => debug!("Not connected yet: {e:#}"),
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(eyre!(
                "Machine {} not reachable after {attempts} attempts in {elapsed:?}",
                m.config().id
            ));
        }
        if !sleep_unless_cancelled(token, interval.min(timeout - elapsed)) {
            return Err(eyre!("Machine {} stopped while waiting for SSH", m.config().id));
        }
    }
}

/// Returns false if the token was cancelled during the sleep
fn sleep_unless_cancelled(token: &CancellationToken, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(CANCEL_POLL.min(deadline - now));
    }
}

/// Reboot the guest and wait for it to come back
pub fn reboot(m: &dyn Machine, token: &CancellationToken) -> Result<()> {
    reboot_with(m, token, REBOOT_SETTLE, REBOOT_TIMEOUT, DEFAULT_CONNECT_INTERVAL)
}

/// [`reboot`] with explicit timings
pub fn reboot_with(
    m: &dyn Machine,
    token: &CancellationToken,
    settle: Duration,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    // The connection usually drops before sudo can report back
    if let Err(e) = sudo(m, "reboot") {
        debug!("reboot: {e:#}");
    }
    if !sleep_unless_cancelled(token, settle) {
        return Err(eyre!("Machine {} stopped during reboot", m.config().id));
    }
    eventually_connects_with(m, token, timeout, interval)
}

/// Copy a guest file into `dest_dir`, making it readable on both ends first
pub fn gather_log(m: &dyn Machine, log_path: &str, dest_dir: &Utf8Path) -> Result<Utf8PathBuf> {
    if let Err(e) = sudo(m, &format!("chmod 777 {}", quote(log_path)?)) {
        warn!("Could not make {log_path} readable: {e:#}");
    }
    let base = Utf8Path::new(log_path)
        .file_name()
        .ok_or_else(|| eyre!("No file name in {log_path}"))?;
    std::fs::create_dir_all(dest_dir).with_context(|| format!("Creating {dest_dir}"))?;
    let dst = dest_dir.join(base);
    m.receive_file(log_path, &dst)?;
    std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(0o666))
        .with_context(|| format!("Setting permissions on {dst}"))?;
    info!("File {base} copied");
    Ok(dst)
}

/// Collect journals, `dmesg`, system information and `log_files` into `dest_dir`.
///
/// Best effort: individual failures are logged and skipped. Returns the
/// files that were copied.
pub fn gather_all_logs(
    m: &dyn Machine,
    services: &[&str],
    log_files: &[&str],
    dest_dir: &Utf8Path,
) -> Vec<Utf8PathBuf> {
    let mut gathered = Vec::new();
    let mut fetch = |path: &str| match gather_log(m, path, dest_dir) {
        Ok(p) => gathered.push(p),
        Err(e) => warn!("Error while copying {path}: {e:#}"),
    };
    let run = |what: &str, cmd: &str| {
        if let Err(e) = sudo(m, cmd) {
            warn!("Error getting {what}: {e:#}");
        }
    };

    for service in services {
        run(
            &format!("journal for service {service}"),
            &format!("journalctl -u {service} -o short-iso >> /run/{service}.log"),
        );
        fetch(&format!("/run/{service}.log"));
    }
    for file in log_files {
        fetch(*file);
    }

    let collected = [
        ("dmesg", "dmesg > /run/dmesg", Some("/run/dmesg")),
        (
            "full journal",
            "journalctl -o short-iso > /run/journal.log",
            Some("/run/journal.log"),
        ),
        ("uname", "uname -a > /run/uname.log", Some("/run/uname.log")),
        ("disk info", "lsblk -a >> /run/disks.log", None),
        ("disk info", "blkid >> /run/disks.log", Some("/run/disks.log")),
    ];
    for (what, cmd, path) in collected {
        run(what, cmd);
        if let Some(path) = path {
            fetch(path);
        }
    }

    fetch("/etc/passwd");
    fetch("/etc/os-release");
    gathered
}

/// An owned machine plus the token from its last start
#[derive(Debug)]
pub struct Vm {
    machine: Box<dyn Machine>,
    token: Option<CancellationToken>,
}

impl Vm {
    /// Wrap a machine that has not been started yet
    pub fn new(machine: impl Machine + 'static) -> Self {
        Self {
            machine: Box::new(machine),
            token: None,
        }
    }

    /// The wrapped machine
    pub fn machine(&self) -> &dyn Machine {
        self.machine.as_ref()
    }

    /// State directory of the machine
    pub fn state_dir(&self) -> &Utf8Path {
        &self.machine.config().state_dir
    }

    /// Launch the machine under `parent`
    pub fn start(&mut self, parent: &CancellationToken) -> Result<CancellationToken> {
        let token = self.machine.create(parent)?;
        self.token = Some(token.clone());
        Ok(token)
    }

    fn token(&self) -> CancellationToken {
        self.token.clone().unwrap_or_else(CancellationToken::new)
    }

    /// See [`sudo`]
    pub fn sudo(&self, cmd: &str) -> Result<String> {
        sudo(self.machine(), cmd)
    }

    /// See [`has_file`]
    pub fn has_file(&self, path: &str) -> Result<bool> {
        has_file(self.machine(), path)
    }

    /// See [`has_dir`]
    pub fn has_dir(&self, path: &str) -> Result<bool> {
        has_dir(self.machine(), path)
    }

    /// See [`eventually_connects_with`]
    pub fn eventually_connects(&self, timeout: Option<Duration>) -> Result<()> {
        eventually_connects_with(
            self.machine(),
            &self.token(),
            timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            DEFAULT_CONNECT_INTERVAL,
        )
    }

    /// See [`reboot`]
    pub fn reboot(&self) -> Result<()> {
        reboot(self.machine(), &self.token())
    }

    /// See [`gather_log`]
    pub fn gather_log(&self, log_path: &str, dest_dir: &Utf8Path) -> Result<Utf8PathBuf> {
        gather_log(self.machine(), log_path, dest_dir)
    }

    /// See [`gather_all_logs`]
    pub fn gather_all_logs(
        &self,
        services: &[&str],
        log_files: &[&str],
        dest_dir: &Utf8Path,
    ) -> Vec<Utf8PathBuf> {
        gather_all_logs(self.machine(), services, log_files, dest_dir)
    }

    /// Run `additional_cleanup`, then stop the machine and remove its state
    pub fn destroy(mut self, additional_cleanup: impl FnOnce(&Vm)) -> Result<()> {
        additional_cleanup(&self);
        self.machine.stop()?;
        self.machine.clean()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::os::unix::fs::PermissionsExt as _;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::MachineConfig;

    /// Answers like a small shell: knows some files, fails pings until up
    #[derive(Debug, Default)]
    struct FakeMachine {
        config: MachineConfig,
        files: HashSet<String>,
        dirs: HashSet<String>,
        pings_until_up: AtomicUsize,
        commands: Arc<Mutex<Vec<String>>>,
        events: Arc<Mutex<Vec<&'static str>>>,
        running: AtomicBool,
    }

    impl FakeMachine {
        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl Machine for FakeMachine {
        fn config(&self) -> &MachineConfig {
            &self.config
        }

        fn create(&mut self, parent: &CancellationToken) -> Result<CancellationToken> {
            self.running.store(true, Ordering::SeqCst);
            self.events.lock().unwrap().push("create");
            Ok(parent.child_token())
        }

        fn stop(&mut self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            self.events.lock().unwrap().push("stop");
            Ok(())
        }

        fn clean(&mut self) -> Result<()> {
            self.events.lock().unwrap().push("clean");
            Ok(())
        }

        fn alive(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn screenshot(&self) -> Result<Utf8PathBuf> {
            Ok("/tmp/shot.png".into())
        }

        fn detach_cd(&self) -> Result<()> {
            Ok(())
        }

        fn command(&self, cmd: &str) -> Result<String> {
            self.commands.lock().unwrap().push(cmd.to_owned());
            if cmd == "echo ping" {
                let left = self.pings_until_up.load(Ordering::SeqCst);
                if left > 0 {
                    self.pings_until_up.store(left - 1, Ordering::SeqCst);
                    return Err(eyre!("Connection refused"));
                }
                return Ok("ping\n".into());
            }
            let exists =
                |set: &HashSet<String>| set.iter().any(|p| cmd.contains(&format!(" {p} ")));
            if cmd.starts_with("if [ -f ") {
                return Ok(if exists(&self.files) { "ok\n" } else { "wrong\n" }.into());
            }
            if cmd.starts_with("if [ -d ") {
                return Ok(if exists(&self.dirs) { "ok\n" } else { "wrong\n" }.into());
            }
            if cmd.contains("lsblk") {
                return Err(eyre!("lsblk: not found"));
            }
            Ok(String::new())
        }

        fn send_file(&self, _src: &Utf8Path, _dst: &str, _permissions: &str) -> Result<()> {
            Ok(())
        }

        fn receive_file(&self, src: &str, dst: &Utf8Path) -> Result<()> {
            if !self.files.contains(src) {
                return Err(eyre!("scp: {src}: No such file or directory"));
            }
            std::fs::write(dst, format!("contents of {src}"))?;
            Ok(())
        }
    }

    fn fake() -> FakeMachine {
        FakeMachine {
            config: MachineConfig {
                id: "fake".into(),
                state_dir: "/state/fake".into(),
                ..Default::default()
            },
            files: ["/etc/os-release", "/etc/passwd", "/run/dmesg"]
                .into_iter()
                .map(Into::into)
                .collect(),
            dirs: ["/oem"].into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_sudo_quotes_command() {
        let m = fake();
        sudo(&m, "echo 'hi' > /run/x").unwrap();
        let commands = m.commands();
        assert_eq!(commands.len(), 1);
        let words = shlex::split(&commands[0]).unwrap();
        assert_eq!(words, vec!["sudo", "/bin/sh", "-c", "echo 'hi' > /run/x"]);
    }

    #[test]
    fn test_has_file_and_dir() {
        let m = fake();
        assert!(has_file(&m, "/etc/os-release").unwrap());
        assert!(!has_file(&m, "/etc/shadow").unwrap());
        assert!(has_dir(&m, "/oem").unwrap());
        assert!(!has_dir(&m, "/etc/os-release").unwrap());
        assert_eq!(
            m.commands()[0],
            "if [ -f /etc/os-release ]; then echo ok; else echo wrong; fi"
        );
    }

    #[test]
    fn test_eventually_connects_retries() {
        let m = fake();
        m.pings_until_up.store(3, Ordering::SeqCst);
        eventually_connects_with(
            &m,
            &CancellationToken::new(),
            Duration::from_secs(10),
            Duration::from_millis(10),
        )
        .unwrap();
        assert_eq!(m.commands().len(), 4);
    }

    #[test]
    fn test_eventually_connects_times_out() {
        let m = fake();
        m.pings_until_up.store(usize::MAX, Ordering::SeqCst);
        let err = eventually_connects_with(
            &m,
            &CancellationToken::new(),
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not reachable"), "{err}");
    }

    #[test]
    fn test_eventually_connects_stops_on_cancel() {
        let m = fake();
        m.pings_until_up.store(usize::MAX, Ordering::SeqCst);
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(200));
                token.cancel();
            })
        };
        let start = Instant::now();
        let err = eventually_connects_with(
            &m,
            &token,
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
        .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(err.to_string().contains("stopped"), "{err}");
        canceller.join().unwrap();
    }

    #[test]
    fn test_reboot_waits_for_guest() {
        let m = fake();
        reboot_with(
            &m,
            &CancellationToken::new(),
            Duration::from_millis(10),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .unwrap();
        let commands = m.commands();
        assert_eq!(commands[0], "sudo /bin/sh -c reboot");
        assert_eq!(commands.last().unwrap(), "echo ping");
    }

    #[test]
    fn test_gather_log() {
        let m = fake();
        let td = tempfile::tempdir().unwrap();
        let dest = Utf8PathBuf::try_from(td.path().join("logs")).unwrap();
        let path = gather_log(&m, "/etc/os-release", &dest).unwrap();
        assert_eq!(path, dest.join("os-release"));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "contents of /etc/os-release"
        );
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);
        let words = shlex::split(&m.commands()[0]).unwrap();
        assert_eq!(words[3], "chmod 777 /etc/os-release");
    }

    #[test]
    fn test_gather_all_logs_is_best_effort() {
        let m = fake();
        let td = tempfile::tempdir().unwrap();
        let dest = Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
        let gathered = gather_all_logs(&m, &["kairos-agent"], &["/var/log/missing.log"], &dest);
        let names: Vec<&str> = gathered.iter().filter_map(|p| p.file_name()).collect();
        assert_eq!(names, vec!["dmesg", "passwd", "os-release"]);
        let journal = "journalctl -u kairos-agent -o short-iso >> /run/kairos-agent.log";
        assert!(m.commands().iter().any(|c| c.contains(journal)));
    }

    #[test]
    fn test_vm_lifecycle() {
        let m = fake();
        let events = m.events.clone();
        let mut vm = Vm::new(m);
        assert_eq!(vm.state_dir(), "/state/fake");
        let parent = CancellationToken::new();
        vm.start(&parent).unwrap();
        assert!(vm.machine().alive());
        assert!(vm.has_dir("/oem").unwrap());
        vm.eventually_connects(Some(Duration::from_secs(1))).unwrap();

        let mut cleaned_up = false;
        vm.destroy(|vm| {
            cleaned_up = vm.machine().alive();
        })
        .unwrap();
        assert!(cleaned_up);
        assert_eq!(*events.lock().unwrap(), vec!["create", "stop", "clean"]);
    }
}
