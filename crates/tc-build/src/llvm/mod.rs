//! LLVM/Clang builds driven through CMake and Ninja.
//!
//! A single [`LlvmBuilder`] covers every stage of the bootstrap; its
//! [`Role`] and `slim` switch decide which CMake defines are layered on top
//! of the base configuration.

pub mod pipeline;

use crate::builder::{self, Builder, Folders, Runner};
use crate::kernel::KernelProfileBuilder;
use crate::source::GitSource;
use crate::targets;
use crate::tools::Tools;
use crate::utils;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

pub const LLVM_URL: &str = "https://github.com/llvm/llvm-project";

/// Components a slim toolchain ships.
const SLIM_DISTRIBUTION_COMPONENTS: &[&str] = &[
    "clang",
    "clang-resource-headers",
    "lld",
    "llvm-ar",
    "llvm-nm",
    "llvm-ranlib",
    "llvm-objcopy",
    "llvm-objdump",
    "llvm-readelf",
    "llvm-strip",
];

/// Value-profiling counters per site for instrumented builds.
const VP_COUNTERS_PER_SITE: &str = "6";

/// Parse `LLVM_ALL_TARGETS` out of `<llvm>/llvm/CMakeLists.txt`.
pub fn get_all_targets(llvm_folder: &Path) -> Result<Vec<String>> {
    let cmakelists = llvm_folder.join("llvm/CMakeLists.txt");
    let contents = std::fs::read_to_string(&cmakelists)
        .with_context(|| format!("Failed to read {}", cmakelists.display()))?;
    parse_all_targets(&contents)
}

fn parse_all_targets(contents: &str) -> Result<Vec<String>> {
    let re = Regex::new(r"set\(LLVM_ALL_TARGETS([\w|\s]+)\)")?;
    let Some(caps) = re.captures(contents) else {
        bail!("Could not find LLVM_ALL_TARGETS?");
    };
    Ok(caps[1]
        .lines()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect())
}

/// Fail unless every build dependency is in PATH.
pub fn check_dependencies() -> Result<()> {
    for dep in ["cmake", "curl", "git", "ninja"] {
        if which::which(dep).is_err() {
            bail!("Dependency ('{dep}') could not be found!");
        }
    }
    Ok(())
}

/// Facts about the build machine that change the CMake configuration.
#[derive(Clone, Debug, Default)]
pub struct HostEnv {
    pub has_ccache: bool,
    /// GWP-ASan needs `execinfo.h`, which musl systems lack.
    pub has_execinfo: bool,
    /// Clear Linux keeps its C++ headers under `x86_64-generic-linux`.
    pub clear_linux: bool,
    pub default_target_triple: Option<String>,
    pub musl: bool,
    pub apple_silicon: bool,
    /// `uname -m` of the build machine.
    pub machine: String,
}

impl HostEnv {
    pub fn detect() -> Result<Self> {
        let clear_linux = std::fs::read_dir("/usr/include/c++")
            .map(|entries| {
                entries
                    .filter_map(std::result::Result::ok)
                    .any(|entry| entry.path().join("x86_64-generic-linux").exists())
            })
            .unwrap_or(false);

        // The default Linux triples assume glibc; ask the system clang
        // instead unless the toolchain is meant to be shipped elsewhere.
        let distributing = std::env::var_os("DISTRIBUTING").is_some_and(|v| !v.is_empty());
        let default_target_triple = if !distributing && which::which("clang").is_ok() {
            let mut clang = Command::new("clang");
            clang.arg("-print-target-triple");
            Some(builder::capture(&mut clang)?)
        } else {
            None
        };

        let host = Self {
            has_ccache: which::which("ccache").is_ok(),
            has_execinfo: Path::new("/usr/include/execinfo.h").exists(),
            clear_linux,
            default_target_triple,
            musl: utils::libc_is_musl(),
            apple_silicon: utils::cpu_is_apple_silicon(),
            machine: utils::host_machine().to_string(),
        };
        log::debug!("host environment: {host:?}");
        Ok(host)
    }
}

/// Which stage of the bootstrap a builder produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Stage 1: a minimal clang built with the host compiler.
    Bootstrap,
    /// IR-instrumented compiler that records PGO profiles.
    Instrumented,
    /// The toolchain that gets installed.
    Final,
}

/// How BOLT profiles are collected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoltMode {
    Instrumentation,
    Sampling,
}

impl BoltMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instrumentation => "instrumentation",
            Self::Sampling => "sampling",
        }
    }
}

pub struct LlvmBuilder {
    pub role: Role,
    pub slim: bool,
    pub folders: Folders,
    pub runner: Runner,
    pub bolt: bool,
    pub bolt_builder: Option<KernelProfileBuilder>,
    pub ccache: bool,
    pub check_targets: Vec<String>,
    pub cmake_defines: BTreeMap<String, String>,
    pub install_targets: Vec<String>,
    /// Ninja targets; `all` when empty.
    pub build_targets: Vec<String>,
    pub tools: Option<Tools>,
    pub projects: Vec<String>,
    pub targets: Vec<String>,
    pub quiet_cmake: bool,
    pub host: HostEnv,
}

impl LlvmBuilder {
    fn with_role(role: Role, slim: bool, runner: Runner, host: HostEnv) -> Self {
        let mut cmake_defines = BTreeMap::new();
        // Drop the terminfo dependency; colored diagnostics work without it.
        cmake_defines.insert("LLVM_ENABLE_TERMINFO".to_string(), "OFF".to_string());
        Self {
            role,
            slim,
            folders: Folders::default(),
            runner,
            bolt: false,
            bolt_builder: None,
            ccache: false,
            check_targets: Vec::new(),
            cmake_defines,
            install_targets: Vec::new(),
            build_targets: Vec::new(),
            tools: None,
            projects: Vec::new(),
            targets: Vec::new(),
            quiet_cmake: false,
            host,
        }
    }

    /// Stage 1. Always slim.
    pub fn bootstrap(runner: Runner, host: HostEnv) -> Self {
        let mut builder = Self::with_role(Role::Bootstrap, true, runner, host);
        builder.projects = vec!["clang".to_string(), "lld".to_string()];
        builder.targets = vec!["host".to_string()];
        builder
    }

    pub fn instrumented(slim: bool, runner: Runner, host: HostEnv) -> Self {
        let mut builder = Self::with_role(Role::Instrumented, slim, runner, host);
        for (key, value) in [
            ("LLVM_BUILD_INSTRUMENTED", "IR"),
            ("LLVM_BUILD_RUNTIME", "OFF"),
            ("LLVM_LINK_LLVM_DYLIB", "ON"),
        ] {
            builder.set_define(key, value);
        }
        builder
    }

    pub fn final_stage(slim: bool, runner: Runner, host: HostEnv) -> Self {
        Self::with_role(Role::Final, slim, runner, host)
    }

    pub fn set_define(&mut self, key: &str, value: impl Into<String>) {
        self.cmake_defines.insert(key.to_string(), value.into());
    }

    pub fn project_is_enabled(&self, project: &str) -> bool {
        self.projects.iter().any(|p| p == "all" || p == project)
    }

    pub fn host_target(&self) -> Option<&'static str> {
        targets::llvm_host_target(&self.host.machine)
    }

    pub fn host_target_is_enabled(&self) -> bool {
        let host = self.host_target();
        self.targets
            .iter()
            .any(|t| t == "all" || Some(t.as_str()) == host)
    }

    fn tools(&self) -> Result<&Tools> {
        self.tools.as_ref().context("No build tools set?")
    }

    fn role_defines(&self, defines: &mut BTreeMap<String, String>) -> Result<()> {
        match self.role {
            Role::Bootstrap => {
                if self.project_is_enabled("compiler-rt") {
                    set(defines, "COMPILER_RT_BUILD_SANITIZERS", "OFF");
                }
                set(defines, "CMAKE_BUILD_TYPE", "Release");
                set(defines, "LLVM_BUILD_UTILS", "OFF");
                set(defines, "LLVM_ENABLE_ASSERTIONS", "OFF");
                set(defines, "LLVM_ENABLE_BACKTRACES", "OFF");
                set(defines, "LLVM_INCLUDE_TESTS", "OFF");
            }
            Role::Instrumented => {
                // Avoids "Running out of static counters" warnings. Needs
                // LLVM_LINK_LLVM_DYLIB, set at construction.
                let options = self
                    .folders
                    .source()?
                    .join("llvm/cmake/modules/HandleLLVMOptions.cmake");
                let text = std::fs::read_to_string(&options)
                    .with_context(|| format!("Failed to read {}", options.display()))?;
                if text.contains("LLVM_VP_COUNTERS_PER_SITE") {
                    set(defines, "LLVM_VP_COUNTERS_PER_SITE", VP_COUNTERS_PER_SITE);
                } else {
                    let vp_counters =
                        format!("-Xclang -mllvm -Xclang -vp-counters-per-site={VP_COUNTERS_PER_SITE}");
                    for key in ["CMAKE_C_FLAGS", "CMAKE_CXX_FLAGS"] {
                        let flags = match defines.get(key) {
                            Some(existing) if !existing.is_empty() => {
                                format!("{existing} {vp_counters}")
                            }
                            _ => vp_counters.clone(),
                        };
                        set(defines, key, &flags);
                    }
                }
            }
            Role::Final => {}
        }
        Ok(())
    }

    fn slim_defines(&self, defines: &mut BTreeMap<String, String>) {
        let mut components = SLIM_DISTRIBUTION_COMPONENTS.join(";");
        if self.project_is_enabled("bolt") {
            components.push_str(";bolt");
        }
        if self.project_is_enabled("compiler-rt") {
            components.push_str(";llvm-profdata;profile");
        }
        set(defines, "LLVM_DISTRIBUTION_COMPONENTS", &components);

        // Bindings, OCaml docs, docs and examples are never used for kernels.
        set(defines, "LLVM_ENABLE_BINDINGS", "OFF");
        set(defines, "LLVM_ENABLE_OCAMLDOC", "OFF");
        set(defines, "LLVM_EXTERNAL_CLANG_TOOLS_EXTRA_SOURCE_DIR", "");
        set(defines, "LLVM_INCLUDE_DOCS", "OFF");
        set(defines, "LLVM_INCLUDE_EXAMPLES", "OFF");

        if self.project_is_enabled("clang") {
            set(defines, "CLANG_ENABLE_ARCMT", "OFF");
            set(defines, "CLANG_ENABLE_STATIC_ANALYZER", "OFF");
            set(defines, "CLANG_PLUGIN_SUPPORT", "OFF");
        }

        let runtime_on = defines
            .get("LLVM_BUILD_RUNTIME")
            .map_or(true, |v| v == "ON");
        if self.project_is_enabled("compiler-rt") && runtime_on {
            set(defines, "COMPILER_RT_BUILD_LIBFUZZER", "OFF");
            set(defines, "COMPILER_RT_BUILD_CRT", "OFF");
            set(defines, "COMPILER_RT_BUILD_XRAY", "OFF");
        }
    }

    fn base_defines(&self, defines: &mut BTreeMap<String, String>) -> Result<()> {
        let tools = self.tools()?;

        if self.ccache {
            if self.host.has_ccache {
                set(defines, "CMAKE_C_COMPILER_LAUNCHER", "ccache");
                set(defines, "CMAKE_CXX_COMPILER_LAUNCHER", "ccache");
            } else {
                utils::print_warning(
                    "ccache requested but could not be found on your system, ignoring...",
                );
            }
        }

        for (key, tool) in [
            ("CLANG_TABLEGEN", &tools.clang_tblgen),
            ("CMAKE_AR", &tools.ar),
            ("CMAKE_RANLIB", &tools.ranlib),
            ("LLVM_TABLEGEN", &tools.llvm_tblgen),
            ("LLVM_USE_LINKER", &tools.ld),
        ] {
            if let Some(tool) = tool {
                set(defines, key, &tool.display().to_string());
            }
        }

        defines
            .entry("CMAKE_BUILD_TYPE".to_string())
            .or_insert_with(|| "Release".to_string());
        set(defines, "CMAKE_C_COMPILER", &tools.cc.display().to_string());
        set(defines, "CMAKE_CXX_COMPILER", &tools.cxx.display().to_string());
        if self.bolt {
            set(defines, "CMAKE_EXE_LINKER_FLAGS", "-Wl,--emit-relocs");
        }
        if let Some(install) = &self.folders.install {
            set(defines, "CMAKE_INSTALL_PREFIX", &install.display().to_string());
        }

        set(defines, "LLVM_ENABLE_PROJECTS", &self.projects.join(";"));
        set(defines, "LLVM_TARGETS_TO_BUILD", &self.targets.join(";"));

        if self.project_is_enabled("compiler-rt") {
            // The kernel needs none of these.
            if !self.host.has_execinfo {
                set(defines, "COMPILER_RT_BUILD_GWP_ASAN", "OFF");
            }
            if self.host.musl {
                set(defines, "COMPILER_RT_BUILD_SANITIZERS", "OFF");
            }
        }
        if defines.get("CMAKE_BUILD_TYPE").is_some_and(|t| t == "Release") {
            set(defines, "LLVM_ENABLE_WARNINGS", "OFF");
        }
        if self.host.clear_linux {
            set(defines, "LLVM_HOST_TRIPLE", "x86_64-generic-linux");
        }
        if let Some(triple) = &self.host.default_target_triple {
            set(defines, "LLVM_DEFAULT_TARGET_TRIPLE", triple);
        }
        Ok(())
    }

    /// The full set of CMake defines: role, then slim, then base.
    pub fn compute_defines(&self) -> Result<BTreeMap<String, String>> {
        let mut defines = self.cmake_defines.clone();
        self.role_defines(&mut defines)?;
        if self.slim {
            self.slim_defines(&mut defines);
        }
        self.base_defines(&mut defines)?;
        Ok(defines)
    }

    pub fn validate_targets(&self) -> Result<()> {
        if self.targets.is_empty() {
            bail!("No targets set?");
        }
        let all_targets = get_all_targets(self.folders.source()?)?;
        for target in &self.targets {
            if target == "all" || target == "host" {
                continue;
            }
            if !all_targets.contains(target) {
                bail!(
                    "Requested target ('{target}') was not found in LLVM_ALL_TARGETS ({}), check spelling?",
                    all_targets.join(", ")
                );
            }
        }
        Ok(())
    }

    pub fn cmake_command(&self, defines: &BTreeMap<String, String>) -> Result<Command> {
        let mut cmake = Command::new("cmake");
        cmake
            .arg("-B")
            .arg(self.folders.build()?)
            .args(["-G", "Ninja", "-S"])
            .arg(self.folders.source()?.join("llvm"))
            .arg("-Wno-dev");
        if self.quiet_cmake {
            cmake.arg("--log-level=NOTICE");
        }
        cmake.args(defines.iter().map(|(k, v)| format!("-D{k}={v}")));
        Ok(cmake)
    }

    pub fn configure(&mut self) -> Result<()> {
        self.folders.build()?;
        self.folders.source()?;
        self.tools()?;
        if self.projects.is_empty() {
            bail!("No projects set?");
        }
        self.validate_targets()?;

        let defines = self.compute_defines()?;
        self.cmake_defines.clone_from(&defines);

        self.folders.clean_build_folder()?;
        self.runner.run(&mut self.cmake_command(&defines)?)
    }

    fn ninja(&self) -> Result<Command> {
        let mut ninja = Command::new("ninja");
        ninja.arg("-C").arg(self.folders.build()?);
        if self.build_targets.is_empty() {
            ninja.arg("all");
        } else {
            ninja.args(&self.build_targets);
        }
        Ok(ninja)
    }

    /// Collect a BOLT profile for clang with sampling when `perf` can record
    /// branches. Never on Apple silicon.
    pub fn bolt_mode(&self) -> BoltMode {
        if !self.host.apple_silicon && can_use_perf() {
            BoltMode::Sampling
        } else {
            BoltMode::Instrumentation
        }
    }

    /// Post-link optimize `bin/clang` in the build folder with BOLT.
    pub fn bolt_clang(&mut self) -> Result<()> {
        let mode = self.bolt_mode();
        utils::print_header(&format!("Performing BOLT with {}", mode.as_str()));

        let build = self.folders.build()?.to_path_buf();
        let tools = self.tools()?.clone();
        let llvm_bolt = tools.llvm_bolt.clone().context("No llvm-bolt set?")?;
        let dry_run = self.runner.is_dry_run();

        let clang_link = build.join("bin/clang");
        let clang = if dry_run {
            clang_link
        } else {
            std::fs::canonicalize(&clang_link)
                .with_context(|| format!("Failed to resolve {}", clang_link.display()))?
        };
        let clang_bolt = clang.with_file_name("clang.bolt");
        let clang_inst = clang.with_file_name("clang.inst");
        let bolt_profile = build.join("clang.fdata");

        let bolt_builder = self
            .bolt_builder
            .as_mut()
            .context("BOLT requested without a builder?")?;
        match mode {
            BoltMode::Instrumentation => {
                let mut instrument = Command::new(&llvm_bolt);
                instrument
                    .arg("--instrument")
                    .arg(format!("--instrumentation-file={}", bolt_profile.display()))
                    .arg("--instrumentation-file-append-pid")
                    .arg("-o")
                    .arg(&clang_inst)
                    .arg(&clang);
                self.runner.run(&mut instrument)?;
                bolt_builder.bolt_instrumentation = true;
            }
            BoltMode::Sampling => {
                bolt_builder.bolt_sampling_output = Some(build.join("perf.data"));
            }
        }
        bolt_builder.toolchain_prefix.clone_from(&build);
        bolt_builder.build()?;

        match mode {
            BoltMode::Instrumentation => {
                self.merge_fdata(&tools, &build, &bolt_profile)?;
            }
            BoltMode::Sampling => {
                let perf_data = build.join("perf.data");
                let perf2bolt = tools.perf2bolt.clone().context("No perf2bolt set?")?;
                let mut convert = Command::new(perf2bolt);
                convert
                    .arg("-p")
                    .arg(&perf_data)
                    .arg("-o")
                    .arg(&bolt_profile)
                    .arg(&clang);
                self.runner.run(&mut convert)?;
                if !dry_run {
                    std::fs::remove_file(&perf_data)?;
                }
            }
        }

        let mut optimize = Command::new(&llvm_bolt);
        optimize
            .arg(format!("--data={}", bolt_profile.display()))
            .args(["--dyno-stats", "--icf=1", "-o"])
            .arg(&clang_bolt)
            .args([
                "--reorder-blocks=cache+",
                "--reorder-functions=hfsort+",
                "--split-all-cold",
                "--split-functions=3",
                "--use-gnu-stack",
            ])
            .arg(&clang);
        self.runner.run(&mut optimize)?;

        if !dry_run {
            std::fs::rename(&clang_bolt, &clang)
                .with_context(|| format!("Failed to replace {}", clang.display()))?;
            if mode == BoltMode::Instrumentation {
                std::fs::remove_file(&clang_inst)?;
            }
        }
        Ok(())
    }

    /// Combine the per-PID `.fdata` files from an instrumented run.
    fn merge_fdata(&self, tools: &Tools, build: &Path, bolt_profile: &Path) -> Result<()> {
        let merge_fdata = tools.merge_fdata.clone().context("No merge-fdata set?")?;
        let pieces = fdata_pieces(build)?;

        let mut merge = Command::new(merge_fdata);
        merge.args(&pieces);
        utils::print_info("Merging .fdata files, this might take a while...");
        if !self.runner.is_dry_run() {
            // One line per merged file goes to stderr; keep it in a log.
            let out = std::fs::File::create(bolt_profile)?;
            let log = std::fs::File::create(build.join("merge-fdata.log"))?;
            merge.stdout(out).stderr(log);
        }
        self.runner.run(&mut merge)?;

        if !self.runner.is_dry_run() {
            for piece in &pieces {
                std::fs::remove_file(piece)?;
            }
        }
        Ok(())
    }

    /// Merge `<build>/profiles/*.profraw` into `<build>/profdata.prof`.
    pub fn generate_profdata(&self) -> Result<()> {
        let build = self.folders.build()?;
        let profiles = files_with_extension(&build.join("profiles"), "profraw")?;
        if profiles.is_empty() && !self.runner.is_dry_run() {
            bail!("No profiles generated?");
        }
        let llvm_profdata = self
            .tools()?
            .llvm_profdata
            .clone()
            .context("No llvm-profdata set?")?;

        let mut merge = Command::new(llvm_profdata);
        merge
            .arg("merge")
            .arg(format!("-output={}", build.join("profdata.prof").display()))
            .args(&profiles);
        self.runner.run(&mut merge)
    }

    pub fn show_install_info(&self) -> Result<()> {
        let install = self.folders.install_or_build()?;
        if !install.exists() {
            bail!("Installation folder does not exist, run build()?");
        }
        let bin = install.join("bin");
        if !bin.exists() {
            bail!("bin folder does not exist in installation folder, run build()?");
        }

        utils::print_header("LLVM installation information");
        print_path_instructions(install, &bin);

        for tool in ["clang", "ld.lld"] {
            let binary = bin.join(tool);
            if binary.exists() {
                self.runner.run(Command::new(binary).arg("--version"))?;
                println!();
            }
        }
        utils::flush_std_err_out();
        Ok(())
    }
}

impl Builder for LlvmBuilder {
    fn build(&mut self) -> Result<()> {
        let build = self.folders.build()?;
        // A dry-run configure never writes build.ninja.
        if !self.runner.is_dry_run() && !build.join("build.ninja").exists() {
            bail!("No build.ninja in build folder, run configure()?");
        }
        if self.bolt && self.bolt_builder.is_none() {
            bail!("BOLT requested without a builder?");
        }

        let start = Instant::now();
        self.runner.run(&mut self.ninja()?)?;

        if !self.check_targets.is_empty() {
            let checks = self.check_targets.iter().map(|t| format!("check-{t}"));
            self.runner.run(self.ninja()?.args(checks))?;
        }

        utils::print_info(&format!("Build duration: {}", utils::get_duration(start)));

        if self.bolt {
            self.bolt_clang()?;
        }

        if let Some(install) = self.folders.install.clone() {
            let installs: Vec<String> = if self.install_targets.is_empty() {
                vec!["install".to_string()]
            } else {
                self.install_targets
                    .iter()
                    .map(|t| format!("install-{t}"))
                    .collect()
            };
            self.runner.run_quiet(self.ninja()?.args(&installs))?;
            if !self.runner.is_dry_run() {
                utils::create_gitignore(&install)?;
            }
        }
        Ok(())
    }
}

fn set(defines: &mut BTreeMap<String, String>, key: &str, value: &str) {
    defines.insert(key.to_string(), value.to_string());
}

/// Print how to put a toolchain's `bin` folder in PATH.
pub fn print_path_instructions(install: &Path, bin: &Path) {
    let bin = bin.display();
    println!(
        "Toolchain is available at: {}\n\n\
         To use, either run:\n\n\
         \t$ export PATH={bin}:$PATH\n\n\
         or add:\n\n\
         \tPATH={bin}:$PATH\n\n\
         before the command you want to use this toolchain.\n",
        install.display()
    );
}

fn can_use_perf() -> bool {
    if which::which("perf").is_err() {
        return false;
    }
    let mut perf = Command::new("perf");
    perf.args([
        "record",
        "--branch-filter",
        "any,u",
        "--event",
        "cycles:u",
        "--output",
        "/dev/null",
        "--",
        "sleep",
        "1",
    ]);
    builder::capture(&mut perf).is_ok()
}

fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == extension))
        .collect();
    files.sort();
    Ok(files)
}

/// `clang.fdata.<pid>.fdata` files left by an instrumented clang.
fn fdata_pieces(build: &Path) -> Result<Vec<PathBuf>> {
    Ok(files_with_extension(build, "fdata")?
        .into_iter()
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with("clang.fdata."))
        })
        .collect())
}

/// The llvm-project checkout.
pub struct LlvmSource {
    pub git: GitSource,
}

impl LlvmSource {
    pub fn new(repo: PathBuf) -> Self {
        Self {
            git: GitSource {
                repo,
                pretty_name: "LLVM",
                url: LLVM_URL,
            },
        }
    }

    pub fn repo(&self) -> &Path {
        &self.git.repo
    }

    pub fn default_projects() -> Vec<String> {
        ["clang", "compiler-rt", "lld", "polly"]
            .map(String::from)
            .to_vec()
    }

    pub fn default_targets(&self) -> Result<Vec<String>> {
        let all_targets = get_all_targets(self.repo())?;
        let mut targets: Vec<String> = [
            "AArch64", "ARM", "BPF", "Hexagon", "Mips", "PowerPC", "RISCV", "SystemZ", "X86",
        ]
        .map(String::from)
        .to_vec();
        if all_targets.iter().any(|t| t == "LoongArch") {
            targets.push("LoongArch".to_string());
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CMAKELISTS: &str = "\
set(LLVM_ALL_TARGETS
  AArch64
  ARM
  BPF
  LoongArch
  X86
  )
";

    /// A fake llvm-project with just the files configure reads.
    pub(crate) fn fake_llvm_tree(dir: &Path, vp_counters: bool) {
        std::fs::create_dir_all(dir.join("llvm/cmake/modules")).unwrap();
        std::fs::write(dir.join("llvm/CMakeLists.txt"), CMAKELISTS).unwrap();
        let options = if vp_counters {
            "set(LLVM_VP_COUNTERS_PER_SITE \"1.5\" CACHE STRING \"\")"
        } else {
            "# nothing"
        };
        std::fs::write(
            dir.join("llvm/cmake/modules/HandleLLVMOptions.cmake"),
            options,
        )
        .unwrap();
    }

    fn host() -> HostEnv {
        HostEnv {
            has_ccache: true,
            has_execinfo: true,
            machine: "x86_64".to_string(),
            ..HostEnv::default()
        }
    }

    fn with_folders(mut builder: LlvmBuilder, source: &Path, build: &Path) -> LlvmBuilder {
        builder.folders = Folders {
            build: Some(build.to_path_buf()),
            install: None,
            source: Some(source.to_path_buf()),
        };
        builder.tools = Some(Tools::stage(Path::new("/stage1/bin")));
        builder
    }

    #[test]
    fn test_parse_all_targets() {
        assert_eq!(
            parse_all_targets(CMAKELISTS).unwrap(),
            vec!["AArch64", "ARM", "BPF", "LoongArch", "X86"]
        );
        assert!(parse_all_targets("project(LLVM)").is_err());
    }

    #[test]
    fn test_bootstrap_defines() {
        let dir = tempfile::tempdir().unwrap();
        fake_llvm_tree(dir.path(), true);
        let mut builder = with_folders(
            LlvmBuilder::bootstrap(Runner::dry_run(), host()),
            dir.path(),
            &dir.path().join("build"),
        );
        builder.projects.push("compiler-rt".to_string());
        builder.ccache = true;

        let defines = builder.compute_defines().unwrap();
        let get = |k: &str| defines.get(k).map(String::as_str);
        assert_eq!(get("CMAKE_BUILD_TYPE"), Some("Release"));
        assert_eq!(get("COMPILER_RT_BUILD_SANITIZERS"), Some("OFF"));
        assert_eq!(get("LLVM_ENABLE_TERMINFO"), Some("OFF"));
        assert_eq!(get("LLVM_ENABLE_PROJECTS"), Some("clang;lld;compiler-rt"));
        assert_eq!(get("LLVM_TARGETS_TO_BUILD"), Some("host"));
        assert_eq!(get("LLVM_ENABLE_WARNINGS"), Some("OFF"));
        assert_eq!(get("CMAKE_C_COMPILER_LAUNCHER"), Some("ccache"));
        assert_eq!(get("CLANG_PLUGIN_SUPPORT"), Some("OFF"));
        assert_eq!(get("COMPILER_RT_BUILD_XRAY"), Some("OFF"));
        assert_eq!(get("LLVM_USE_LINKER"), Some("/stage1/bin/ld.lld"));
        assert_eq!(
            get("LLVM_DISTRIBUTION_COMPONENTS"),
            Some("clang;clang-resource-headers;lld;llvm-ar;llvm-nm;llvm-ranlib;llvm-objcopy;llvm-objdump;llvm-readelf;llvm-strip;llvm-profdata;profile")
        );
        assert_eq!(get("CMAKE_INSTALL_PREFIX"), None);
    }

    #[test]
    fn test_instrumented_vp_counters_define() {
        let dir = tempfile::tempdir().unwrap();
        fake_llvm_tree(dir.path(), true);
        let mut builder = with_folders(
            LlvmBuilder::instrumented(true, Runner::dry_run(), host()),
            dir.path(),
            &dir.path().join("build"),
        );
        builder.projects = vec!["clang".to_string(), "lld".to_string(), "compiler-rt".to_string()];
        builder.targets = vec!["X86".to_string()];

        let defines = builder.compute_defines().unwrap();
        assert_eq!(defines["LLVM_BUILD_INSTRUMENTED"], "IR");
        assert_eq!(defines["LLVM_VP_COUNTERS_PER_SITE"], "6");
        assert!(!defines.contains_key("CMAKE_C_FLAGS"));
        // Runtime is off, so the compiler-rt trimming does not apply.
        assert!(!defines.contains_key("COMPILER_RT_BUILD_XRAY"));
    }

    #[test]
    fn test_instrumented_vp_counters_flags_fallback() {
        let dir = tempfile::tempdir().unwrap();
        fake_llvm_tree(dir.path(), false);
        let mut builder = with_folders(
            LlvmBuilder::instrumented(false, Runner::dry_run(), host()),
            dir.path(),
            &dir.path().join("build"),
        );
        builder.projects = vec!["clang".to_string()];
        builder.targets = vec!["X86".to_string()];
        builder.set_define("CMAKE_C_FLAGS", "-march=native");

        let defines = builder.compute_defines().unwrap();
        assert_eq!(
            defines["CMAKE_C_FLAGS"],
            "-march=native -Xclang -mllvm -Xclang -vp-counters-per-site=6"
        );
        assert_eq!(
            defines["CMAKE_CXX_FLAGS"],
            "-Xclang -mllvm -Xclang -vp-counters-per-site=6"
        );
        assert!(!defines.contains_key("LLVM_DISTRIBUTION_COMPONENTS"));
    }

    #[test]
    fn test_host_quirks() {
        let dir = tempfile::tempdir().unwrap();
        fake_llvm_tree(dir.path(), true);
        let quirky = HostEnv {
            has_ccache: false,
            has_execinfo: false,
            clear_linux: true,
            default_target_triple: Some("x86_64-alpine-linux-musl".to_string()),
            musl: true,
            apple_silicon: false,
            machine: "x86_64".to_string(),
        };
        let mut builder = with_folders(
            LlvmBuilder::final_stage(false, Runner::dry_run(), quirky),
            dir.path(),
            &dir.path().join("build"),
        );
        builder.projects = vec!["all".to_string()];
        builder.targets = vec!["all".to_string()];
        builder.ccache = true;
        builder.bolt = true;
        builder.set_define("CMAKE_BUILD_TYPE", "Debug");

        let defines = builder.compute_defines().unwrap();
        assert_eq!(defines["COMPILER_RT_BUILD_GWP_ASAN"], "OFF");
        assert_eq!(defines["COMPILER_RT_BUILD_SANITIZERS"], "OFF");
        assert_eq!(defines["LLVM_HOST_TRIPLE"], "x86_64-generic-linux");
        assert_eq!(defines["LLVM_DEFAULT_TARGET_TRIPLE"], "x86_64-alpine-linux-musl");
        assert_eq!(defines["CMAKE_EXE_LINKER_FLAGS"], "-Wl,--emit-relocs");
        assert_eq!(defines["CMAKE_BUILD_TYPE"], "Debug");
        assert!(!defines.contains_key("LLVM_ENABLE_WARNINGS"));
        assert!(!defines.contains_key("CMAKE_C_COMPILER_LAUNCHER"));
    }

    #[test]
    fn test_configure_runs_cmake_with_sorted_defines() {
        let dir = tempfile::tempdir().unwrap();
        fake_llvm_tree(dir.path(), true);
        let build = dir.path().join("build");
        let mut builder = with_folders(
            LlvmBuilder::bootstrap(Runner::dry_run(), host()),
            dir.path(),
            &build,
        );
        builder.quiet_cmake = true;
        builder.folders.install = Some(PathBuf::from("/opt/llvm"));
        builder.configure().unwrap();

        let history = builder.runner.history();
        assert_eq!(history.len(), 1);
        let expected_prefix = format!(
            "cmake -B {} -G Ninja -S {}/llvm -Wno-dev --log-level=NOTICE -DCLANG_ENABLE_ARCMT=OFF",
            build.display(),
            dir.path().display()
        );
        assert!(history[0].starts_with(&expected_prefix), "{}", history[0]);
        assert!(history[0].contains("-DCMAKE_INSTALL_PREFIX=/opt/llvm"));
        assert!(history[0].contains(" -DLLVM_EXTERNAL_CLANG_TOOLS_EXTRA_SOURCE_DIR= "));
    }

    #[test]
    fn test_configure_rejects_unknown_target() {
        let dir = tempfile::tempdir().unwrap();
        fake_llvm_tree(dir.path(), true);
        let mut builder = with_folders(
            LlvmBuilder::final_stage(true, Runner::dry_run(), host()),
            dir.path(),
            &dir.path().join("build"),
        );
        builder.projects = vec!["clang".to_string()];
        builder.targets = vec!["X86".to_string(), "Sparc".to_string()];
        let err = builder.configure().unwrap_err();
        assert!(err.to_string().contains("('Sparc') was not found"));
        assert!(builder.runner.history().is_empty());
    }

    #[test]
    fn test_configure_requires_tools() {
        let dir = tempfile::tempdir().unwrap();
        fake_llvm_tree(dir.path(), true);
        let mut builder = with_folders(
            LlvmBuilder::bootstrap(Runner::dry_run(), host()),
            dir.path(),
            &dir.path().join("build"),
        );
        builder.tools = None;
        assert!(builder.configure().is_err());
    }

    #[test]
    fn test_build_runs_checks_and_installs_targets() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        std::fs::create_dir_all(&build).unwrap();
        std::fs::write(build.join("build.ninja"), "").unwrap();

        let mut builder = with_folders(
            LlvmBuilder::final_stage(true, Runner::dry_run(), host()),
            dir.path(),
            &build,
        );
        builder.folders.install = Some(dir.path().join("install"));
        builder.build_targets = vec!["distribution".to_string()];
        builder.install_targets = vec!["distribution".to_string()];
        builder.check_targets = vec!["clang".to_string(), "lld".to_string()];
        builder.build().unwrap();

        let ninja = format!("ninja -C {} distribution", build.display());
        assert_eq!(
            builder.runner.history(),
            vec![
                ninja.clone(),
                format!("{ninja} check-clang check-lld"),
                format!("{ninja} install-distribution"),
            ]
        );
    }

    #[test]
    fn test_build_requires_build_ninja() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = with_folders(
            LlvmBuilder::final_stage(false, Runner::new(false), host()),
            dir.path(),
            dir.path(),
        );
        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("run configure()"));
    }

    #[test]
    fn test_bolt_without_builder_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("build.ninja"), "").unwrap();
        let mut builder = with_folders(
            LlvmBuilder::final_stage(false, Runner::dry_run(), host()),
            dir.path(),
            dir.path(),
        );
        builder.bolt = true;
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_apple_silicon_forces_instrumentation() {
        let apple = HostEnv {
            apple_silicon: true,
            machine: "aarch64".to_string(),
            ..HostEnv::default()
        };
        let builder = LlvmBuilder::final_stage(false, Runner::dry_run(), apple);
        assert_eq!(builder.bolt_mode(), BoltMode::Instrumentation);
    }

    #[test]
    fn test_generate_profdata() {
        let dir = tempfile::tempdir().unwrap();
        let profiles = dir.path().join("profiles");
        std::fs::create_dir_all(&profiles).unwrap();
        std::fs::write(profiles.join("b.profraw"), "").unwrap();
        std::fs::write(profiles.join("a.profraw"), "").unwrap();
        std::fs::write(profiles.join("notes.txt"), "").unwrap();

        let builder = with_folders(
            LlvmBuilder::instrumented(true, Runner::dry_run(), host()),
            dir.path(),
            dir.path(),
        );
        builder.generate_profdata().unwrap();
        let build = dir.path().display();
        assert_eq!(
            builder.runner.history(),
            vec![format!(
                "/stage1/bin/llvm-profdata merge -output={build}/profdata.prof {build}/profiles/a.profraw {build}/profiles/b.profraw"
            )]
        );
    }

    #[test]
    fn test_generate_profdata_without_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let builder = with_folders(
            LlvmBuilder::instrumented(true, Runner::new(false), host()),
            dir.path(),
            dir.path(),
        );
        let err = builder.generate_profdata().unwrap_err();
        assert!(err.to_string().contains("No profiles generated"));
    }

    #[test]
    fn test_project_and_host_target_helpers() {
        let mut builder = LlvmBuilder::final_stage(false, Runner::dry_run(), host());
        builder.projects = vec!["clang".to_string()];
        assert!(builder.project_is_enabled("clang"));
        assert!(!builder.project_is_enabled("lld"));

        builder.targets = vec!["AArch64".to_string()];
        assert_eq!(builder.host_target(), Some("X86"));
        assert!(!builder.host_target_is_enabled());
        builder.targets.push("X86".to_string());
        assert!(builder.host_target_is_enabled());
        builder.targets = vec!["all".to_string()];
        assert!(builder.host_target_is_enabled());
    }

    #[test]
    fn test_default_targets_include_loongarch_when_known() {
        let dir = tempfile::tempdir().unwrap();
        fake_llvm_tree(dir.path(), true);
        let source = LlvmSource::new(dir.path().to_path_buf());
        let targets = source.default_targets().unwrap();
        assert_eq!(targets.last().map(String::as_str), Some("LoongArch"));
        assert_eq!(targets.len(), 10);
        assert_eq!(LlvmSource::default_projects(), vec!["clang", "compiler-rt", "lld", "polly"]);
    }

    #[test]
    fn test_fdata_pieces() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clang.fdata.123.fdata"), "").unwrap();
        std::fs::write(dir.path().join("clang.fdata.456.fdata"), "").unwrap();
        std::fs::write(dir.path().join("clang.fdata"), "").unwrap();
        let pieces = fdata_pieces(dir.path()).unwrap();
        assert_eq!(pieces.len(), 2);
    }
}
