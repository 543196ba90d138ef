//! The `testvm` binary driven through its command line

use camino::Utf8PathBuf;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::debug;
use xshell::{cmd, Shell};

use crate::get_testvm_command;

pub fn test_args_and_status() -> Result<()> {
    let sh = Shell::new()?;
    let testvm = get_testvm_command()?;
    let td = tempfile::tempdir()?;
    let root = Utf8PathBuf::try_from(td.path().to_path_buf())?;
    let state_dir = root.join("state");
    let config = root.join("vm.json");
    sh.write_file(
        &config,
        format!(
            r#"{{ "id": "cli", "memory": "1G", "iso": "{root}/install.iso", "state_dir": "{state_dir}" }}"#
        ),
    )?;

    let line = cmd!(sh, "{testvm} args --config {config}").read()?;
    debug!("args: {line}");
    let monitor = format!("unix:{state_dir}/qemu-monitor.sock,server,nowait");
    for expected in [
        "-m 1024M",
        "scsi-cd,drive=cdrom0,bus=scsi0.0,bootindex=50",
        monitor.as_str(),
    ] {
        if !line.contains(expected) {
            return Err(eyre!("{expected:?} missing from {line}"));
        }
    }
    if !line.trim_end_matches('\'').ends_with("order=dc,menu=on") {
        return Err(eyre!("unexpected ending: {line}"));
    }
    if state_dir.exists() {
        return Err(eyre!("args must not create {state_dir}"));
    }

    let status = cmd!(sh, "{testvm} status {state_dir}").read()?;
    assert!(status.contains("absent"), "{status}");

    // Stopping and cleaning a VM that never ran is fine
    cmd!(sh, "{testvm} stop --state-dir {state_dir}").run()?;
    cmd!(sh, "{testvm} clean --state-dir {state_dir}").run()?;
    Ok(())
}
