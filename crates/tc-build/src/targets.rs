//! Target-triple and architecture mapping tables.

use anyhow::{bail, Result};
use std::fmt;

/// How a binutils target is configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flavor {
    /// `--disable-sim --enable-lto --enable-relro --with-pic`
    Standard,
    /// `--disable-multilib --with-gnu-as --with-gnu-ld`
    NoMultilib,
}

impl Flavor {
    pub fn configure_flags(self) -> &'static [&'static str] {
        match self {
            Self::Standard => &["--disable-sim", "--enable-lto", "--enable-relro", "--with-pic"],
            Self::NoMultilib => &["--disable-multilib", "--with-gnu-as", "--with-gnu-ld"],
        }
    }
}

/// Architectures binutils can be built for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BinutilsTarget {
    Aarch64,
    Arm,
    Loongarch64,
    Mips,
    Mipsel,
    Powerpc,
    Powerpc64,
    Powerpc64le,
    Riscv64,
    S390x,
    X86_64,
}

impl BinutilsTarget {
    pub const ALL: &'static [Self] = &[
        Self::Aarch64,
        Self::Arm,
        Self::Loongarch64,
        Self::Mips,
        Self::Mipsel,
        Self::Powerpc,
        Self::Powerpc64,
        Self::Powerpc64le,
        Self::Riscv64,
        Self::S390x,
        Self::X86_64,
    ];

    /// Name as accepted on the command line (first triple component).
    pub fn name(self) -> &'static str {
        match self {
            Self::Aarch64 => "aarch64",
            Self::Arm => "arm",
            Self::Loongarch64 => "loongarch64",
            Self::Mips => "mips",
            Self::Mipsel => "mipsel",
            Self::Powerpc => "powerpc",
            Self::Powerpc64 => "powerpc64",
            Self::Powerpc64le => "powerpc64le",
            Self::Riscv64 => "riscv64",
            Self::S390x => "s390x",
            Self::X86_64 => "x86_64",
        }
    }

    pub fn triple(self) -> &'static str {
        match self {
            Self::Aarch64 => "aarch64-linux-gnu",
            Self::Arm => "arm-linux-gnueabi",
            Self::Loongarch64 => "loongarch64-linux-gnu",
            Self::Mips => "mips-linux-gnu",
            Self::Mipsel => "mipsel-linux-gnu",
            Self::Powerpc => "powerpc-linux-gnu",
            Self::Powerpc64 => "powerpc64-linux-gnu",
            Self::Powerpc64le => "powerpc64le-linux-gnu",
            Self::Riscv64 => "riscv64-linux-gnu",
            Self::S390x => "s390x-linux-gnu",
            Self::X86_64 => "x86_64-linux-gnu",
        }
    }

    /// `uname -m` of a machine that runs this target natively.
    pub fn native_arch(self) -> &'static str {
        match self {
            Self::Arm => "armv7l",
            Self::Powerpc => "ppc",
            Self::Powerpc64 => "ppc64",
            Self::Powerpc64le => "ppc64le",
            other => other.name(),
        }
    }

    pub fn flavor(self) -> Flavor {
        match self {
            Self::Aarch64 | Self::Arm => Flavor::NoMultilib,
            _ => Flavor::Standard,
        }
    }

    /// Value for `--enable-targets`, if the target needs one.
    pub fn extra_targets(self) -> Option<&'static str> {
        match self {
            Self::Mips => Some("mips64-linux-gnuabi64,mips64-linux-gnuabin32"),
            Self::Mipsel => Some("mips64el-linux-gnuabi64,mips64el-linux-gnuabin32"),
            Self::S390x => Some("s390-linux-gnu"),
            Self::X86_64 => Some("x86_64-pep"),
            _ => None,
        }
    }

    /// Whether `machine` (as `uname -m`) runs this target natively.
    pub fn is_native_on(self, machine: &str) -> bool {
        self.native_arch() == machine
    }

    /// Map the host machine to a target, if binutils supports it.
    pub fn from_machine(machine: &str) -> Option<Self> {
        let name = match machine {
            "armv7l" => "arm",
            "ppc" => "powerpc",
            "ppc64" => "powerpc64",
            "ppc64le" => "powerpc64le",
            other => other,
        };
        Self::from_name(name)
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }

    /// Parse user-supplied values into a deduplicated target list.
    ///
    /// `all` expands to `defaults`, `host` to the host machine, and anything
    /// else is read as a triple whose first component names the target.
    pub fn parse_list(values: &[String], defaults: &[Self], machine: &str) -> Result<Vec<Self>> {
        let mut targets = Vec::new();
        for value in values {
            match value.as_str() {
                "all" => targets.extend_from_slice(defaults),
                "host" => match Self::from_machine(machine) {
                    Some(t) => targets.push(t),
                    None => bail!("Host machine '{machine}' is not a supported binutils target"),
                },
                triple => {
                    let arch = triple.split('-').next().unwrap_or(triple);
                    match Self::from_name(arch) {
                        Some(t) => targets.push(t),
                        None => bail!("Unsupported binutils target: {triple}"),
                    }
                }
            }
        }
        targets.sort();
        targets.dedup();
        Ok(targets)
    }
}

impl fmt::Display for BinutilsTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// LLVM backend name for a `uname -m` machine.
pub fn llvm_host_target(machine: &str) -> Option<&'static str> {
    let target = match machine {
        "aarch64" => "AArch64",
        "armv7l" => "ARM",
        "i386" | "x86_64" => "X86",
        "loongarch64" => "LoongArch",
        "mips" | "mipsel" | "mips64" | "mips64el" => "Mips",
        "ppc" | "ppc64" | "ppc64le" => "PowerPC",
        "riscv32" | "riscv64" => "RISCV",
        "s390x" => "SystemZ",
        _ => return None,
    };
    Some(target)
}
