//! Remote commands and file transfer over the forwarded SSH port
//!
//! This shells out to the host's `ssh` and `scp`; password logins go through
//! `sshpass -e` so the password never shows up in the process list.

use std::process::{Command, ExitStatus, Stdio};

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::{debug, instrument};

use crate::config::SshConfig;

const GUEST_HOST: &str = "127.0.0.1";

/// Options applied to every ssh and scp invocation
#[derive(Debug, Clone)]
pub struct SshConnectionOptions {
    /// Connection timeout in seconds (default: 30)
    pub connect_timeout: u32,
    /// SSH log level (default: ERROR)
    pub log_level: String,
    /// Additional SSH options as key-value pairs
    pub extra_options: Vec<(String, String)>,
}

impl Default for SshConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            log_level: "ERROR".to_string(),
            extra_options: vec![],
        }
    }
}

impl SshConnectionOptions {
    /// Short timeout, for probing whether the guest is reachable yet
    pub fn for_connectivity_test() -> Self {
        Self {
            connect_timeout: 5,
            ..Default::default()
        }
    }
}

/// Runs commands in and copies files to and from one guest
#[derive(Debug, Clone)]
pub struct SshController {
    config: SshConfig,
    options: SshConnectionOptions,
}

impl SshController {
    /// Controller using the given credentials and default options
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            options: SshConnectionOptions::default(),
        }
    }

    /// Replace the connection options
    pub fn with_options(mut self, options: SshConnectionOptions) -> Self {
        self.options = options;
        self
    }

    fn destination(&self) -> String {
        format!("{}@{GUEST_HOST}", self.config.user)
    }

    /// Start `tool`, wrapped in `sshpass` when logging in with a password
    fn base_command(&self, tool: &str) -> Command {
        let mut cmd = match self.config.password.as_deref() {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.env("SSHPASS", password).args(["-e", tool]);
                cmd
            }
            None => Command::new(tool),
        };

        if let Some(key) = self.config.key.as_deref() {
            cmd.args(["-i", key.as_str()]);
            cmd.args(["-o", "IdentitiesOnly=yes"]);
        }
        if self.config.password.is_some() {
            cmd.args(["-o", "PubkeyAuthentication=no"]);
        }
        cmd.args(["-o", "StrictHostKeyChecking=no"]);
        cmd.args(["-o", "UserKnownHostsFile=/dev/null"]);
        cmd.args(["-o", &format!("ConnectTimeout={}", self.options.connect_timeout)]);
        cmd.args(["-o", &format!("LogLevel={}", self.options.log_level)]);
        for (key, value) in &self.options.extra_options {
            cmd.args(["-o", &format!("{key}={value}")]);
        }
        cmd
    }

    fn ssh_command(&self, remote: Option<&str>) -> Command {
        let mut cmd = self.base_command("ssh");
        cmd.args(["-p", &self.config.port.to_string()]);
        cmd.arg(self.destination());
        if let Some(remote) = remote {
            cmd.arg("--").arg(remote);
        }
        cmd
    }

    fn scp_command(&self, from: &str, to: &str) -> Command {
        let mut cmd = self.base_command("scp");
        cmd.args(["-P", &self.config.port.to_string()]);
        cmd.args([from, to]);
        cmd
    }

    fn remote_path(&self, path: &str) -> String {
        format!("{}:{path}", self.destination())
    }

    /// Run `command` through the guest's login shell and return its stdout
    #[instrument(skip(self))]
    pub fn command(&self, command: &str) -> Result<String> {
        let output = self
            .ssh_command(Some(command))
            .stdin(Stdio::null())
            .output()
            .context("Failed to run ssh")?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(eyre!(
                "ssh command failed ({}): {}{}",
                output.status,
                stdout,
                stderr.trim()
            ));
        }
        Ok(stdout)
    }

    /// Copy `src` to `dst` in the guest, then set its mode
    #[instrument(skip(self))]
    pub fn send_file(&self, src: &Utf8Path, dst: &str, permissions: &str) -> Result<()> {
        run_scp(self.scp_command(src.as_str(), &self.remote_path(dst)))
            .with_context(|| format!("Copying {src} to guest:{dst}"))?;
        let quoted = shlex::try_quote(dst).map_err(|e| eyre!("Cannot quote {dst:?}: {e}"))?;
        self.command(&format!("chmod {permissions} {quoted}"))
            .with_context(|| format!("Setting mode {permissions} on {dst}"))?;
        Ok(())
    }

    /// Copy `src` from the guest to `dst` on the host
    #[instrument(skip(self))]
    pub fn receive_file(&self, src: &str, dst: &Utf8Path) -> Result<()> {
        run_scp(self.scp_command(&self.remote_path(src), dst.as_str()))
            .with_context(|| format!("Copying guest:{src} to {dst}"))
    }

    /// Open an interactive session, inheriting the terminal
    pub fn interactive(&self, args: &[String]) -> Result<ExitStatus> {
        let mut cmd = self.ssh_command(None);
        cmd.arg("-t");
        if !args.is_empty() {
            cmd.arg("--").args(args);
        }
        debug!("Running {cmd:?}");
        cmd.status().context("Failed to run ssh")
    }
}

fn run_scp(mut cmd: Command) -> Result<()> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .context("Failed to run scp")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(eyre!("scp failed ({}): {}", output.status, stderr.trim()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn has_option(args: &[String], opt: &str) -> bool {
        args.windows(2).any(|w| w[0] == "-o" && w[1] == opt)
    }

    #[test]
    fn test_ssh_connection_options() {
        let default_opts = SshConnectionOptions::default();
        assert_eq!(default_opts.connect_timeout, 30);
        assert_eq!(default_opts.log_level, "ERROR");
        assert!(default_opts.extra_options.is_empty());

        let probe = SshConnectionOptions::for_connectivity_test();
        assert_eq!(probe.connect_timeout, 5);
    }

    #[test]
    fn test_password_login_uses_sshpass() {
        let controller = SshController::new(SshConfig {
            user: "kairos".into(),
            password: Some("secret".into()),
            key: None,
            port: 2323,
        });
        let cmd = controller.ssh_command(Some("echo ping"));
        assert_eq!(cmd.get_program(), "sshpass");
        let args = args(&cmd);
        assert_eq!(args[..2], ["-e", "ssh"]);
        // Password only goes through the environment
        assert!(!args.iter().any(|a| a.contains("secret")));
        let env: Vec<_> = cmd.get_envs().collect();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].0, "SSHPASS");
        assert!(has_option(&args, "StrictHostKeyChecking=no"));
        assert!(has_option(&args, "UserKnownHostsFile=/dev/null"));
        assert!(has_option(&args, "ConnectTimeout=30"));
        assert!(has_option(&args, "LogLevel=ERROR"));

        let n = args.len();
        assert_eq!(
            args[n - 5..],
            ["-p", "2323", "kairos@127.0.0.1", "--", "echo ping"]
        );
    }

    #[test]
    fn test_key_login() {
        let controller = SshController::new(SshConfig {
            key: Some("/keys/id_ed25519".into()),
            ..Default::default()
        })
        .with_options(SshConnectionOptions {
            extra_options: vec![("ServerAliveInterval".into(), "5".into())],
            ..SshConnectionOptions::for_connectivity_test()
        });
        let cmd = controller.ssh_command(None);
        assert_eq!(cmd.get_program(), "ssh");
        let args = args(&cmd);
        assert_eq!(args[..2], ["-i", "/keys/id_ed25519"]);
        assert!(has_option(&args, "IdentitiesOnly=yes"));
        assert!(has_option(&args, "ServerAliveInterval=5"));
        assert!(has_option(&args, "ConnectTimeout=5"));
        assert_eq!(args.last().unwrap(), "root@127.0.0.1");
        assert!(cmd.get_envs().next().is_none());
    }

    #[test]
    fn test_scp_uses_capital_port_flag() {
        let controller = SshController::new(SshConfig::default());
        let cmd = controller.scp_command("/host/file", &controller.remote_path("/guest/file"));
        assert_eq!(cmd.get_program(), "scp");
        let args = args(&cmd);
        let n = args.len();
        assert_eq!(
            args[n - 4..],
            ["-P", "2222", "/host/file", "root@127.0.0.1:/guest/file"]
        );
        assert!(!args.iter().any(|a| a == "-p"));
    }
}
