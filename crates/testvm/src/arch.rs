//! Architecture-specific QEMU settings
//!
//! QEMU needs a few extra launch tokens on some targets (a CPU model and a
//! machine type on aarch64). Everything else is shared across architectures.

/// Architecture configuration for QEMU launches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchConfig {
    /// Architecture string as used in the QEMU binary name (e.g. "x86_64")
    pub arch: String,
    /// CPU model to use when the machine config does not override it
    pub default_cpu: Option<&'static str>,
    /// Value for `-machine`, when the architecture has no usable default
    pub machine: Option<&'static str>,
}

impl ArchConfig {
    /// Look up the settings for an architecture tag.
    ///
    /// Unknown architectures are accepted; they get no extra tokens and QEMU
    /// is left to pick its defaults.
    pub fn for_arch(arch: &str) -> Self {
        match arch {
            "aarch64" => Self {
                arch: "aarch64".to_owned(),
                default_cpu: Some("max"),
                machine: Some("virt,accel=tcg,acpi=on,gic-version=2"),
            },
            other => Self {
                arch: other.to_owned(),
                default_cpu: None,
                machine: None,
            },
        }
    }

    /// Settings for the host architecture
    pub fn host() -> Self {
        Self::for_arch(std::env::consts::ARCH)
    }

    /// Resolve an optional architecture tag, defaulting to the host
    pub fn resolve(arch: Option<&str>) -> Self {
        arch.map(Self::for_arch).unwrap_or_else(Self::host)
    }

    /// Name of the system emulator binary, e.g. `qemu-system-aarch64`
    pub fn qemu_binary(&self) -> String {
        format!("qemu-system-{}", self.arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aarch64_needs_cpu_and_machine() {
        let arch = ArchConfig::for_arch("aarch64");
        assert_eq!(arch.default_cpu, Some("max"));
        assert_eq!(arch.machine, Some("virt,accel=tcg,acpi=on,gic-version=2"));
        assert_eq!(arch.qemu_binary(), "qemu-system-aarch64");
    }

    #[test]
    fn test_x86_64_uses_qemu_defaults() {
        let arch = ArchConfig::for_arch("x86_64");
        assert!(arch.default_cpu.is_none());
        assert!(arch.machine.is_none());
        assert_eq!(arch.qemu_binary(), "qemu-system-x86_64");
    }

    #[test]
    fn test_resolve_defaults_to_host() {
        let arch = ArchConfig::resolve(None);
        assert_eq!(arch.arch, std::env::consts::ARCH);

        let arch = ArchConfig::resolve(Some("riscv64"));
        assert_eq!(arch.qemu_binary(), "qemu-system-riscv64");
    }
}
