//! Command-line front end for managing disposable test VMs.

use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Context};
use color_eyre::{Report, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use testvm::matcher::{eventually_connects_with, DEFAULT_CONNECT_INTERVAL};
use testvm::monitor::{MonitorClient, DEFAULT_QUIESCENCE};
use testvm::process::ProcessSupervisor;
use testvm::ssh::SshController;
use testvm::{FailureEvent, Machine, MachineConfig, QemuMachine};

/// Manage disposable QEMU VMs for system tests.
#[derive(Parser)]
#[clap(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Which machine to act on
#[derive(Debug, clap::Args)]
struct MachineOpts {
    /// JSON machine configuration
    #[clap(long, short = 'c')]
    config: Option<Utf8PathBuf>,

    /// State directory, overriding the one in the configuration
    #[clap(long)]
    state_dir: Option<Utf8PathBuf>,
}

impl MachineOpts {
    fn load(&self) -> Result<MachineConfig> {
        let mut config = match &self.config {
            Some(path) => MachineConfig::from_json_file(path)?,
            None if self.state_dir.is_some() => MachineConfig::default(),
            None => return Err(eyre!("Either --config or --state-dir is required")),
        };
        if let Some(state_dir) = &self.state_dir {
            config.state_dir = state_dir.clone();
        }
        if config.state_dir.as_str().is_empty() {
            config.state_dir = default_state_root()?.join(&config.id);
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Provision disks and start the VM
    Create {
        #[clap(flatten)]
        machine: MachineOpts,

        /// Stay attached and exit when the hypervisor does
        #[clap(long)]
        foreground: bool,
    },

    /// Print the hypervisor command line without starting anything
    Args {
        #[clap(flatten)]
        machine: MachineOpts,
    },

    /// Stop the hypervisor (SIGTERM, then SIGKILL)
    Stop {
        #[clap(flatten)]
        machine: MachineOpts,

        /// Seconds to wait after SIGTERM
        #[clap(long, default_value_t = 10)]
        timeout: u64,
    },

    /// Remove the state directory of a stopped VM
    Clean {
        #[clap(flatten)]
        machine: MachineOpts,
    },

    /// Show whether VMs are running
    Status {
        /// State directories to inspect
        #[clap(required = true)]
        state_dirs: Vec<Utf8PathBuf>,
    },

    /// Capture the framebuffer and print the image path
    Screenshot {
        #[clap(flatten)]
        machine: MachineOpts,

        /// Milliseconds of monitor silence that end the command
        #[clap(long)]
        quiescence_ms: Option<u64>,
    },

    /// Eject a removable medium
    Eject {
        #[clap(flatten)]
        machine: MachineOpts,

        /// Drive id to eject
        #[clap(long, default_value = "cdrom0")]
        device: String,
    },

    /// Open an SSH session to the guest
    Ssh {
        #[clap(flatten)]
        machine: MachineOpts,

        /// Command to run instead of a login shell
        #[clap(allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Wait until the guest accepts SSH connections
    WaitSsh {
        #[clap(flatten)]
        machine: MachineOpts,

        /// Seconds to wait
        #[clap(long, default_value_t = 360)]
        timeout: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum VmState {
    Running,
    Stopped,
    Absent,
}

fn default_state_root() -> Result<Utf8PathBuf> {
    let base = dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir);
    let base = Utf8PathBuf::try_from(base).context("Non-UTF-8 state root")?;
    Ok(base.join("testvm"))
}

fn create(machine: MachineOpts, foreground: bool) -> Result<()> {
    let mut config = machine.load()?;
    if foreground {
        config
            .on_failure
            .push(|event: &FailureEvent| eprintln!("error: {event}"));
    }
    let mut vm = QemuMachine::new(config)?;
    let token = vm.create(&CancellationToken::new())?;
    println!("{}", vm.config().state_dir);

    if foreground {
        if let Some(monitor) = vm.take_failure_monitor() {
            info!("Waiting for pid {}", monitor.pid());
            if monitor.wait()?.is_some() || token.is_cancelled() {
                return Err(eyre!("hypervisor exited unexpectedly"));
            }
        }
    }
    Ok(())
}

fn status(state_dirs: &[Utf8PathBuf]) -> Result<()> {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["STATE DIR", "STATE", "PID", "STARTED", "BINARY"]);
    for dir in state_dirs {
        let supervisor = ProcessSupervisor::new(dir.clone());
        let metadata = supervisor.metadata()?;
        let state = if !dir.exists() {
            VmState::Absent
        } else if supervisor.is_alive() {
            VmState::Running
        } else {
            VmState::Stopped
        };
        let (pid, started, binary) = match (&metadata, state) {
            (Some(m), VmState::Running) => (
                m.pid.to_string(),
                m.started.format("%Y-%m-%d %H:%M:%S").to_string(),
                m.binary.to_string(),
            ),
            _ => (String::new(), String::new(), String::new()),
        };
        table.add_row(vec![dir.to_string(), state.to_string(), pid, started, binary]);
    }
    println!("{table}");
    Ok(())
}

fn wait_ssh(machine: MachineOpts, timeout: u64) -> Result<()> {
    let config = machine.load()?;
    let vm = QemuMachine::new(config)?;

    let pb = ProgressBar::new_spinner();
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_style(ProgressStyle::default_bar().template("{spinner:.green} {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(format!("Waiting for SSH on port {}...", vm.config().ssh.port));

    let r = eventually_connects_with(
        &vm,
        &CancellationToken::new(),
        Duration::from_secs(timeout),
        DEFAULT_CONNECT_INTERVAL,
    );
    match &r {
        Ok(()) => pb.finish_with_message("SSH is up"),
        Err(_) => pb.abandon_with_message("SSH did not come up"),
    }
    r
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by RUST_LOG environment variable, defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Create {
            machine,
            foreground,
        } => create(machine, foreground)?,
        Commands::Args { machine } => {
            let vm = QemuMachine::new(machine.load()?)?;
            let mut line = vec![vm.binary()?.into_string()];
            line.extend(vm.launch_args()?);
            let joined = shlex::try_join(line.iter().map(String::as_str))
                .map_err(|e| eyre!("Cannot quote arguments: {e}"))?;
            println!("{joined}");
        }
        Commands::Stop { machine, timeout } => {
            let mut vm =
                QemuMachine::new(machine.load()?)?.with_stop_timeout(Duration::from_secs(timeout));
            vm.stop()?;
        }
        Commands::Clean { machine } => {
            let mut vm = QemuMachine::new(machine.load()?)?;
            vm.clean()?;
        }
        Commands::Status { state_dirs } => status(&state_dirs)?,
        Commands::Screenshot {
            machine,
            quiescence_ms,
        } => {
            let config = machine.load()?;
            let quiescence = quiescence_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_QUIESCENCE);
            let client = MonitorClient::new(config.monitor_socket()).with_quiescence(quiescence);
            println!("{}", client.screendump()?);
        }
        Commands::Eject { machine, device } => {
            let config = machine.load()?;
            MonitorClient::new(config.monitor_socket()).eject(Some(&device))?;
        }
        Commands::Ssh { machine, args } => {
            let config = machine.load()?;
            let status = SshController::new(config.ssh).interactive(&args)?;
            if !status.success() {
                std::process::exit(status.code().unwrap_or(255));
            }
        }
        Commands::WaitSsh { machine, timeout } => wait_ssh(machine, timeout)?,
    }
    Ok(())
}
