//! Linux kernel builds used as profiling workloads (PGO and BOLT) and for
//! smoke-testing a finished toolchain.

use crate::builder::{self, Builder, Folders, Runner};
use crate::cli::KernelArgs;
use crate::source::Tarball;
use crate::utils;
use anyhow::{bail, Context, Result};
use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;
use std::time::Instant;

pub const LINUX_VERSION: &str = "6.17";
pub const LINUX_URL: &str = "https://cdn.kernel.org/pub/linux/kernel/v6.x";

/// Oldest kernel the build commands below are known to work with.
pub const MINIMUM_SUPPORTED_VERSION: Version = Version(6, 9, 0);

/// LLVM targets the kernel matrix knows how to build.
pub const SUPPORTED_LLVM_TARGETS: &[&str] = &[
    "AArch64",
    "ARM",
    "Hexagon",
    "LoongArch",
    "Mips",
    "PowerPC",
    "RISCV",
    "SystemZ",
    "X86",
];

/// A `major.minor.patch` version, compared numerically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub u32, pub u32, pub u32);

impl Version {
    /// Parse `6.14.0-rc3`, `6.14` or `18 1 8` style strings. Anything after
    /// a `-` in a component is ignored and missing components are zero.
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = [0u32; 3];
        let components = text
            .trim()
            .split(|c: char| c == '.' || c.is_whitespace())
            .filter(|c| !c.is_empty());
        for (slot, component) in parts.iter_mut().zip(components) {
            let number = component.split('-').next().unwrap_or(component);
            *slot = number
                .parse()
                .with_context(|| format!("Invalid version component '{component}' in '{text}'"))?;
        }
        Ok(Self(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// The LLVM toolchain kernels are built with.
#[derive(Debug)]
pub struct Toolchain {
    pub prefix: PathBuf,
    version: OnceCell<Version>,
}

impl Toolchain {
    pub fn new(prefix: PathBuf) -> Self {
        Self {
            prefix,
            version: OnceCell::new(),
        }
    }

    /// A toolchain whose version is already known.
    pub fn with_version(prefix: PathBuf, version: Version) -> Self {
        let toolchain = Self::new(prefix);
        let _ = toolchain.version.set(version);
        toolchain
    }

    pub fn bin(&self, tool: &str) -> PathBuf {
        self.prefix.join("bin").join(tool)
    }

    /// Clang's version, from its predefined macros. Cached after the first
    /// query.
    pub fn version(&self) -> Result<Version> {
        if let Some(version) = self.version.get() {
            return Ok(*version);
        }
        let clang = self.bin("clang");
        if !clang.exists() {
            bail!("clang could not be found in {}?", self.prefix.display());
        }
        let mut cmd = Command::new(&clang);
        cmd.args(["-E", "-P", "-x", "c", "-"]);
        let output = builder::probe_with_input(
            &mut cmd,
            "__clang_major__ __clang_minor__ __clang_patchlevel__",
        )?;
        if !output.status.success() {
            bail!(
                "Could not get version of {}: {}",
                clang.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let version = Version::parse(&String::from_utf8_lossy(&output.stdout))?;
        let _ = self.version.set(version);
        Ok(version)
    }

    /// Whether clang can build the kernel's host programs. It cannot when
    /// LLVM was configured without the host target.
    pub fn can_compile_for_host(&self) -> bool {
        let mut cmd = Command::new(self.bin("clang"));
        cmd.args(["-x", "c", "-c", "-o", "/dev/null", "/dev/null"]);
        builder::capture(&mut cmd).is_ok()
    }
}

/// One kernel configuration the profiling matrix can build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelVariant {
    ArmV5,
    ArmV6,
    ArmV7,
    /// `ARCH=arm` with a config target from the matrix.
    Arm,
    Arm64,
    Hexagon,
    LoongArch,
    Mips,
    PowerPC32,
    PowerPC64,
    PowerPC64le,
    Riscv,
    S390,
    X86_64,
}

impl KernelVariant {
    pub fn arch(self) -> &'static str {
        match self {
            Self::ArmV5 | Self::ArmV6 | Self::ArmV7 | Self::Arm => "arm",
            Self::Arm64 => "arm64",
            Self::Hexagon => "hexagon",
            Self::LoongArch => "loongarch",
            Self::Mips => "mips",
            Self::PowerPC32 | Self::PowerPC64 | Self::PowerPC64le => "powerpc",
            Self::Riscv => "riscv",
            Self::S390 => "s390",
            Self::X86_64 => "x86_64",
        }
    }

    /// `CROSS_COMPILE` prefix for the GNU tools, where binutils may be needed.
    pub fn cross_compile(self) -> Option<&'static str> {
        match self {
            Self::ArmV5 | Self::ArmV6 | Self::ArmV7 | Self::Arm => Some("arm-linux-gnueabi-"),
            Self::PowerPC32 => Some("powerpc-linux-gnu-"),
            Self::PowerPC64 => Some("powerpc64-linux-gnu-"),
            Self::PowerPC64le => Some("powerpc64le-linux-gnu-"),
            Self::Riscv => Some("riscv64-linux-gnu-"),
            Self::S390 => Some("s390x-linux-gnu-"),
            _ => None,
        }
    }

    /// Config targets for variants tied to a specific defconfig.
    pub fn fixed_config_targets(self) -> &'static [&'static str] {
        match self {
            Self::ArmV5 => &["multi_v5_defconfig"],
            Self::ArmV6 => &["aspeed_g5_defconfig"],
            Self::ArmV7 => &["multi_v7_defconfig"],
            Self::Mips => &["malta_defconfig"],
            Self::PowerPC32 => &["pmac32_defconfig", "disable-werror.config"],
            Self::PowerPC64 => &["ppc64_guest_defconfig", "disable-werror.config"],
            Self::PowerPC64le => &["powernv_defconfig", "disable-werror.config"],
            _ => &[],
        }
    }

    /// Whether the integrated assembler works for this variant with the
    /// given clang version.
    pub fn can_use_ias(self, clang: Version) -> bool {
        match self {
            Self::ArmV5 | Self::ArmV6 | Self::ArmV7 | Self::Arm | Self::Riscv => {
                clang >= Version(13, 0, 0)
            }
            Self::PowerPC32 => false,
            Self::PowerPC64 | Self::PowerPC64le => clang >= Version(14, 0, 2),
            _ => true,
        }
    }

    /// Reason to skip building this variant, if any.
    pub fn skip_reason(self, clang: Version, linux: Version) -> Option<&'static str> {
        match self {
            Self::ArmV6 if clang < Version(14, 0, 0) && linux >= Version(6, 14, 0) => Some(
                "aspeed_g5_defconfig does not build with LLVM < 14.0.0 and Linux >= 6.14.0, skipping build...",
            ),
            Self::LoongArch if clang < Version(18, 0, 0) => {
                Some("LoongArch does not build with LLVM < 18.0.0, skipping build...")
            }
            Self::S390 if clang <= Version(15, 0, 0) => {
                Some("s390 does not build with LLVM < 15.0.0, skipping build...")
            }
            Self::X86_64 if clang < Version(15, 0, 0) && linux >= Version(6, 15, 0) => Some(
                "x86_64 does not build with LLVM < 15.0.0 and Linux >= 6.15.0, skipping build...",
            ),
            _ => None,
        }
    }

    /// Variant for an `all*config` build of an LLVM target.
    pub fn allconfig_capable(llvm_target: &str, linux: Version) -> Option<Self> {
        let variant = match llvm_target {
            "AArch64" => Self::Arm64,
            "ARM" => Self::Arm,
            "Hexagon" => Self::Hexagon,
            // Needs https://git.kernel.org/stable/c/ab3f300524697919f64ae920e904d0836b4057b0
            "LoongArch" if linux >= Version(6, 6, 8) => Self::LoongArch,
            "PowerPC" => Self::PowerPC64,
            "RISCV" => Self::Riscv,
            "SystemZ" => Self::S390,
            "X86" => Self::X86_64,
            _ => return None,
        };
        Some(variant)
    }
}

/// Builds one kernel configuration with an LLVM toolchain.
pub struct KernelBuilder {
    pub variant: KernelVariant,
    pub folders: Folders,
    pub runner: Runner,
    pub config_targets: Vec<String>,
    pub make_variables: BTreeMap<String, String>,
    pub bolt_instrumentation: bool,
    pub bolt_sampling_output: Option<PathBuf>,
    pub toolchain: Rc<Toolchain>,
    pub linux_version: Version,
}

impl KernelBuilder {
    /// Kernel builds always echo their `make` invocation.
    pub fn new(variant: KernelVariant, toolchain: Rc<Toolchain>, mut runner: Runner) -> Self {
        runner.show_commands = true;
        let mut make_variables = BTreeMap::new();
        make_variables.insert("ARCH".to_string(), variant.arch().to_string());
        // Warnings must not fail a profiling build.
        make_variables.insert("KCFLAGS".to_string(), "-Wno-error".to_string());
        Self {
            variant,
            folders: Folders::default(),
            runner,
            config_targets: variant
                .fixed_config_targets()
                .iter()
                .map(|t| (*t).to_string())
                .collect(),
            make_variables,
            bolt_instrumentation: false,
            bolt_sampling_output: None,
            toolchain,
            linux_version: Version::default(),
        }
    }

    fn cross_compile(&self) -> &'static str {
        self.variant.cross_compile().unwrap_or_default()
    }

    fn needs_binutils(&self, clang: Version) -> bool {
        match self.variant {
            // https://github.com/ClangBuiltLinux/linux/issues/1601
            KernelVariant::PowerPC64 | KernelVariant::PowerPC64le => true,
            KernelVariant::S390 => {
                self.make_variables.contains_key("LD") || self.make_variables.contains_key("OBJCOPY")
            }
            variant => !variant.can_use_ias(clang),
        }
    }

    /// GNU replacements for LLVM tools that lack s390 support in this
    /// toolchain.
    fn s390_gnu_tools(&self) -> Vec<&'static str> {
        let mut gnu = Vec::new();

        let mut lld = Command::new(self.toolchain.bin("ld.lld"));
        lld.args(["-m", "elf64_s390"]);
        if probe_stderr(&mut lld).contains("error: unknown emulation:") {
            gnu.push("LD");
        }

        let mut objcopy = Command::new(self.toolchain.bin("llvm-objcopy"));
        objcopy.args(["-I", "binary", "-O", "elf64-s390", "-", "/dev/null"]);
        if probe_stderr(&mut objcopy).contains("error: invalid output format:") {
            gnu.push("OBJCOPY");
        }

        gnu
    }

    /// Fill in the make variables, returning a skip reason if this
    /// configuration cannot be built.
    fn prepare_variables(&mut self) -> Result<Option<String>> {
        let clang = self.toolchain.version()?;
        if let Some(reason) = self.variant.skip_reason(clang, self.linux_version) {
            return Ok(Some(reason.to_string()));
        }

        match self.variant {
            // https://github.com/ClangBuiltLinux/linux/issues/1260
            KernelVariant::PowerPC64le if clang < Version(12, 0, 0) => {
                self.set("LD", format!("{}ld", self.cross_compile()));
            }
            KernelVariant::S390 => {
                for key in self.s390_gnu_tools() {
                    self.set(key, format!("{}{}", self.cross_compile(), key.to_lowercase()));
                }
            }
            _ => {}
        }

        if self.bolt_instrumentation {
            let clang_inst = self.toolchain.bin("clang.inst");
            self.set("CC", clang_inst.display().to_string());
        }
        if self.toolchain.can_compile_for_host() {
            if let Some(cc) = self.make_variables.get("CC").cloned() {
                self.set("HOSTCC", cc);
            }
        } else {
            self.set("HOSTCC", "gcc".to_string());
            self.set("HOSTCXX", "g++".to_string());
        }

        if self.needs_binutils(clang) {
            let elfedit = format!("{}elfedit", self.cross_compile());
            if which::which(&elfedit).is_err() {
                return Ok(Some(format!(
                    "binutils for {} ('{}') could not be found, skipping kernel build...",
                    self.variant.arch(),
                    self.cross_compile()
                )));
            }
            self.set("CROSS_COMPILE", self.cross_compile().to_string());
        }

        self.set("LLVM", format!("{}/bin/", self.toolchain.prefix.display()));
        if !self.variant.can_use_ias(clang) {
            self.set("LLVM_IAS", "0".to_string());
        }
        self.set("O", self.folders.build()?.display().to_string());
        Ok(None)
    }

    fn set(&mut self, key: &str, value: String) {
        self.make_variables.insert(key.to_string(), value);
    }

    pub fn make_command(&self) -> Result<Command> {
        let mut words: Vec<String> = Vec::new();
        if let Some(output) = &self.bolt_sampling_output {
            words.extend(
                ["perf", "record", "--branch-filter", "any,u", "--event", "cycles:u", "--output"]
                    .map(String::from),
            );
            words.push(output.display().to_string());
            words.push("--".to_string());
        }
        words.push("make".to_string());
        words.push("-C".to_string());
        words.push(self.folders.source()?.display().to_string());
        words.push(format!("-skj{}", utils::cpu_count()));
        words.extend(self.make_variables.iter().map(|(k, v)| format!("{k}={v}")));
        words.extend(self.config_targets.iter().cloned());
        words.push("all".to_string());

        let mut cmd = Command::new(&words[0]);
        cmd.args(&words[1..]);
        // User CFLAGS leak into the kernel's host tools.
        cmd.env_remove("CFLAGS");
        Ok(cmd)
    }
}

fn probe_stderr(cmd: &mut Command) -> String {
    match builder::probe_with_input(cmd, "") {
        Ok(output) => String::from_utf8_lossy(&output.stderr).into_owned(),
        Err(err) => {
            log::debug!("probe failed: {err:#}");
            String::new()
        }
    }
}

impl Builder for KernelBuilder {
    fn build(&mut self) -> Result<()> {
        if let Some(reason) = self.prepare_variables()? {
            utils::print_warning(&reason);
            return Ok(());
        }

        self.folders.clean_build_folder()?;
        self.folders.make_build_folder()?;

        // allmodconfig turns on CONFIG_WERROR and friends, which would
        // override KCFLAGS.
        let allconfig = if self.config_targets.iter().any(|t| t == "allmodconfig") {
            let mut file = tempfile::NamedTempFile::new_in(self.folders.build()?)
                .context("Failed to create KCONFIG_ALLCONFIG file")?;
            for config in ["DRM_WERROR", "WERROR"] {
                writeln!(file, "CONFIG_{config}=n")?;
            }
            file.flush()?;
            self.set("KCONFIG_ALLCONFIG", file.path().display().to_string());
            Some(file)
        } else {
            None
        };

        let start = Instant::now();
        let result = self.runner.run(&mut self.make_command()?);
        drop(allconfig);
        result?;
        utils::print_info(&format!("Build duration: {}", utils::get_duration(start)));
        Ok(())
    }
}

/// Builds a matrix of kernels: config target -> LLVM targets.
pub struct KernelProfileBuilder {
    pub folders: Folders,
    pub runner: Runner,
    pub matrix: Vec<(String, Vec<String>)>,
    pub bolt_instrumentation: bool,
    pub bolt_sampling_output: Option<PathBuf>,
    pub toolchain_prefix: PathBuf,
}

impl KernelProfileBuilder {
    pub fn new(toolchain_prefix: PathBuf, runner: Runner) -> Self {
        Self {
            folders: Folders::default(),
            runner,
            matrix: Vec::new(),
            bolt_instrumentation: false,
            bolt_sampling_output: None,
            toolchain_prefix,
        }
    }

    /// Expand the matrix into concrete builders without duplicating work:
    /// targets whose `all*config` cannot be built with clang use fixed
    /// defconfigs instead.
    pub fn builders(&self, linux: Version, toolchain: &Rc<Toolchain>) -> Vec<KernelBuilder> {
        let mut variants: Vec<(KernelVariant, Option<&str>)> = Vec::new();
        for (config_target, llvm_targets) in &self.matrix {
            for llvm_target in llvm_targets {
                match (config_target.as_str(), llvm_target.as_str()) {
                    ("defconfig", "ARM") => variants.extend(
                        [KernelVariant::ArmV5, KernelVariant::ArmV6, KernelVariant::ArmV7]
                            .map(|v| (v, None)),
                    ),
                    ("defconfig", "Mips") => variants.push((KernelVariant::Mips, None)),
                    ("defconfig", "PowerPC") => variants.extend(
                        [
                            KernelVariant::PowerPC32,
                            KernelVariant::PowerPC64,
                            KernelVariant::PowerPC64le,
                        ]
                        .map(|v| (v, None)),
                    ),
                    (config, target) => {
                        if let Some(v) = KernelVariant::allconfig_capable(target, linux) {
                            variants.push((v, Some(config)));
                        }
                    }
                }
            }
        }

        variants
            .into_iter()
            .map(|(variant, config_target)| {
                let mut builder = KernelBuilder::new(variant, Rc::clone(toolchain), self.runner.clone());
                if let Some(config) = config_target {
                    builder.config_targets = vec![config.to_string()];
                }
                builder.bolt_instrumentation = self.bolt_instrumentation;
                builder.bolt_sampling_output.clone_from(&self.bolt_sampling_output);
                builder.folders = Folders {
                    build: self.folders.build.clone(),
                    install: None,
                    source: self.folders.source.clone(),
                };
                builder.linux_version = linux;
                builder
            })
            .collect()
    }
}

impl Builder for KernelProfileBuilder {
    fn build(&mut self) -> Result<()> {
        let source = LinuxSource::local(self.folders.source()?.to_path_buf());
        let kernelversion = source.kernelversion()?;
        let linux = Version::parse(&kernelversion)?;
        if linux < MINIMUM_SUPPORTED_VERSION {
            bail!(
                "Linux {kernelversion} is older than the minimum supported version ({MINIMUM_SUPPORTED_VERSION}), use a newer tree?"
            );
        }

        let toolchain = Rc::new(Toolchain::new(self.toolchain_prefix.clone()));
        utils::print_info(&format!("Building Linux {kernelversion} for profiling..."));
        for mut builder in self.builders(linux, &toolchain) {
            builder.build()?;
        }
        Ok(())
    }
}

/// A Linux tree, from a kernel.org release tarball or the user, with
/// optional patches on top.
pub struct LinuxSource {
    pub location: PathBuf,
    pub tarball: Tarball,
    pub patches: Vec<PathBuf>,
}

impl LinuxSource {
    pub fn release(src: &Path) -> Self {
        let name = format!("linux-{LINUX_VERSION}");
        Self {
            location: src.join(&name),
            tarball: Tarball {
                base_download_url: LINUX_URL.to_string(),
                local_location: src.join(format!("{name}.tar.xz")),
                remote_tarball_name: None,
                remote_checksum_name: Some("sha256sums.asc".to_string()),
            },
            patches: Vec::new(),
        }
    }

    pub fn local(location: PathBuf) -> Self {
        Self {
            location,
            tarball: Tarball::default(),
            patches: Vec::new(),
        }
    }

    /// Collect `*.patch` files from `dir` in name order, if it exists.
    pub fn add_patches_from(&mut self, dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        let mut patches: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "patch"))
            .collect();
        patches.sort();
        self.patches.extend(patches);
        Ok(())
    }

    pub fn kernelversion(&self) -> Result<String> {
        let mut make = Command::new("make");
        make.args(["-s", "kernelversion"]).current_dir(&self.location);
        builder::capture(&mut make)
    }

    pub fn patch_command(&self, patch: &Path) -> Command {
        let mut cmd = Command::new("patch");
        cmd.arg(format!("--directory={}", self.location.display()))
            .arg("--forward")
            .arg(format!("--input={}", patch.display()))
            .arg("--strip=1");
        cmd
    }

    pub fn prepare(&self, runner: &Runner) -> Result<()> {
        self.tarball.download()?;
        // A patched tree cannot be assumed to carry the current patches.
        if !self.patches.is_empty() && self.location.exists() {
            std::fs::remove_dir_all(&self.location)
                .with_context(|| format!("Failed to remove {}", self.location.display()))?;
        }
        if !self.location.exists() {
            self.tarball.extract(&self.location, runner)?;
        }

        for patch in &self.patches {
            let Some(output) = runner.output(&mut self.patch_command(patch))? else {
                continue;
            };
            if output.status.success() {
                utils::print_info(&format!(
                    "Applied {} to {}",
                    patch.display(),
                    self.location.display()
                ));
                continue;
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            if stdout.contains("Reversed (or previously applied) patch detected") {
                utils::print_warning(&format!(
                    "{} has already been applied in {}, consider removing it",
                    patch.display(),
                    self.location.display()
                ));
            } else {
                bail!("Applying {} failed:\n{}", patch.display(), stdout.trim());
            }
        }

        utils::print_info(&format!(
            "Source successfully prepared in {}",
            self.location.display()
        ));
        Ok(())
    }
}

/// `tc-build kernel`
pub fn run(args: &KernelArgs, root: &Path) -> Result<()> {
    let runner = Runner::new(args.show_build_commands);

    let source = match &args.linux_folder {
        Some(folder) => LinuxSource::local(folder.clone()),
        None => {
            let mut source = LinuxSource::release(&root.join("src"));
            source.add_patches_from(&root.join("patches/linux"))?;
            source.prepare(&runner)?;
            source
        }
    };

    let targets = if args.targets.is_empty() {
        SUPPORTED_LLVM_TARGETS.iter().map(|t| (*t).to_string()).collect()
    } else {
        args.targets.clone()
    };

    let prefix = args
        .toolchain_prefix
        .clone()
        .unwrap_or_else(|| root.join("build/llvm/final"));
    let mut builder = KernelProfileBuilder::new(prefix, runner);
    builder.folders = Folders {
        build: Some(
            args.build_folder
                .clone()
                .unwrap_or_else(|| root.join("build/linux")),
        ),
        install: None,
        source: Some(source.location),
    };
    builder.matrix = args
        .config_targets
        .iter()
        .map(|config| (config.clone(), targets.clone()))
        .collect();

    utils::print_header("Building Linux kernels");
    builder.build()
}
