//! Process lifecycle of a real QEMU
//!
//! Failures here must fail the test; nothing warns and continues.

use std::process::Command;
use std::time::Duration;

use testvm::failure;
use testvm::{Machine, QemuMachine};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{minimal_config, wait_for};

pub fn test_stop_clean() {
    let (_td, mut config) = minimal_config();
    let state_dir = config.state_dir.clone();
    let (observer, failures) = failure::channel();
    config.on_failure.push(observer);

    let mut vm = QemuMachine::new(config).unwrap();
    let token = vm.create(&CancellationToken::new()).unwrap();
    assert!(vm.alive());
    assert!(state_dir.join("process.json").exists());

    vm.stop().unwrap();
    assert!(!vm.alive());
    vm.stop().unwrap();
    vm.clean().unwrap();
    assert!(!state_dir.exists());
    assert!(!token.is_cancelled());
    assert!(failures.try_recv().is_err());
}

pub fn test_crash_detected() {
    let (_td, mut config) = minimal_config();
    let (observer, failures) = failure::channel();
    config.on_failure.push(observer);

    let mut vm = QemuMachine::new(config).unwrap();
    let token = vm.create(&CancellationToken::new()).unwrap();
    let pid = vm.supervisor().metadata().unwrap().unwrap().pid;
    debug!("Killing hypervisor pid {pid}");

    let status = Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let event = failures.recv_timeout(Duration::from_secs(30)).unwrap();
    debug!("Observed {event}");
    assert_eq!(event.pid, pid);
    assert_eq!(event.signal, Some(9));
    wait_for(Duration::from_secs(5), "token cancellation", || {
        token.is_cancelled()
    });
    assert!(!vm.alive());

    vm.stop().unwrap();
    vm.clean().unwrap();
}

pub fn test_auto_provision() {
    let (_td, mut config) = minimal_config();
    config.id = "itest".into();
    config.auto_drive_setup = true;
    config.drive_sizes = vec!["64".into(), "32".into()];
    let state_dir = config.state_dir.clone();

    let mut vm = QemuMachine::new(config).unwrap();
    vm.create(&CancellationToken::new()).unwrap();
    for name in ["itest-0.img", "itest-1.img"] {
        let disk = state_dir.join(name);
        assert!(disk.is_file(), "{disk} missing");
    }
    let recorded = vm.supervisor().metadata().unwrap().unwrap();
    assert!(recorded
        .args
        .iter()
        .any(|a| a == "virtio-blk-pci,drive=drv1,bootindex=2"));

    vm.stop().unwrap();
    vm.clean().unwrap();
}
