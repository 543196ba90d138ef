//! Tests against a real QEMU installation.
//!
//! Every trial is reported as ignored when no `qemu-system-<host arch>` can
//! be found, so the suite is safe to run on machines without QEMU.

use std::path::Path;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};
use tempfile::TempDir;
use testvm::arch::ArchConfig;
use testvm::qemu::find_qemu_binary;
use testvm::MachineConfig;
use tracing_subscriber::EnvFilter;

mod tests {
    pub mod cli;
    pub mod lifecycle;
    pub mod monitor;
}

/// Get the path to the testvm binary, checking TESTVM_PATH first
pub(crate) fn get_testvm_command() -> Result<String> {
    if let Ok(path) = std::env::var("TESTVM_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/testvm", "target/release/testvm"]
        .into_iter()
        .find(|p| Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set TESTVM_PATH={path} to run using this binary"
        ));
    }
    Ok("testvm".to_owned())
}

/// A diskless, headless, offline machine in a fresh temporary state directory
pub(crate) fn minimal_config() -> (TempDir, MachineConfig) {
    let td = TempDir::new().unwrap();
    let root = Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
    let config = MachineConfig {
        memory: "256".into(),
        cpu: 1,
        display: Some("-display none".into()),
        disable_default_networking: true,
        state_dir: root.join("state"),
        ..Default::default()
    };
    (td, config)
}

/// Poll `f` until it holds, panicking after `timeout`
pub(crate) fn wait_for(timeout: Duration, what: &str, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while !f() {
        assert!(
            start.elapsed() < timeout,
            "timed out after {timeout:?} waiting for {what}"
        );
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn have_tool(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

/// Library logs go to stderr, so a failing trial shows what the machine did
fn install_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    install_tracing();
    let args = Arguments::from_args();
    let no_qemu = find_qemu_binary(&ArchConfig::host()).is_err();
    let no_qemu_img = no_qemu || !have_tool("qemu-img");
    if no_qemu {
        tracing::warn!("No QEMU for this host, all trials are ignored");
    }

    let tests = vec![
        Trial::test("monitor_screendump", || {
            tests::monitor::test_screendump();
            Ok(())
        })
        .with_ignored_flag(no_qemu),
        Trial::test("monitor_eject_without_media", || {
            tests::monitor::test_eject_without_media();
            Ok(())
        })
        .with_ignored_flag(no_qemu),
        Trial::test("lifecycle_stop_clean", || {
            tests::lifecycle::test_stop_clean();
            Ok(())
        })
        .with_ignored_flag(no_qemu),
        Trial::test("lifecycle_crash_detected", || {
            tests::lifecycle::test_crash_detected();
            Ok(())
        })
        .with_ignored_flag(no_qemu),
        Trial::test("lifecycle_auto_provision", || {
            tests::lifecycle::test_auto_provision();
            Ok(())
        })
        .with_ignored_flag(no_qemu_img),
        Trial::test("cli_args_and_status", || {
            tests::cli::test_args_and_status()?;
            Ok(())
        })
        .with_ignored_flag(no_qemu),
    ];

    libtest_mimic::run(&args, tests).exit();
}
