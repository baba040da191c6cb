//! `tc-build llvm`: the multi-stage bootstrap.
//!
//! bootstrap (host compiler) -> instrumented (PGO, optional) -> final, with
//! BOLT applied to the final clang when requested.

use super::{check_dependencies, HostEnv, LlvmBuilder, LlvmSource};
use crate::builder::{Builder, Folders, Runner};
use crate::cli::{LlvmArgs, Lto, PgoWorkload};
use crate::kernel::{KernelProfileBuilder, LinuxSource, SUPPORTED_LLVM_TARGETS};
use crate::manifest::BuildRecord;
use crate::tools::Tools;
use crate::utils;
use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// A revision of LLVM known to build the kernel.
pub const GOOD_REVISION: &str = "ebad678857a94c32ce7b6931e9c642b32d278b67";

/// Split `KEY=VALUE` user defines.
pub fn parse_defines(defines: &[String]) -> Result<Vec<(String, String)>> {
    defines
        .iter()
        .map(|define| match define.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => bail!("Invalid define '{define}', expected KEY=VALUE"),
        })
        .collect()
}

/// The LLVM targets a kernel can be built for out of `targets`.
pub fn kernel_targets(targets: &[String], host_target: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for target in targets {
        let candidates: Vec<&str> = match target.as_str() {
            "all" => SUPPORTED_LLVM_TARGETS.to_vec(),
            "host" => host_target.into_iter().collect(),
            other => vec![other],
        };
        for candidate in candidates {
            if SUPPORTED_LLVM_TARGETS.contains(&candidate) && !out.iter().any(|t| t == candidate) {
                out.push(candidate.to_string());
            }
        }
    }
    out
}

/// Config target -> LLVM targets for the kernel PGO workloads. `-slim`
/// workloads only build for the host's architecture.
pub fn kernel_matrix(
    workloads: &[PgoWorkload],
    targets: &[String],
    host_target: Option<&str>,
) -> Vec<(String, Vec<String>)> {
    let all = kernel_targets(targets, host_target);
    let host_only: Vec<String> = all
        .iter()
        .filter(|t| Some(t.as_str()) == host_target)
        .cloned()
        .collect();

    let mut matrix: Vec<(String, Vec<String>)> = Vec::new();
    for workload in workloads {
        let Some((config, slim)) = workload.kernel_config() else {
            continue;
        };
        let wanted = if slim { &host_only } else { &all };
        match matrix.iter_mut().find(|(c, _)| c == config) {
            Some((_, existing)) => {
                for target in wanted {
                    if !existing.contains(target) {
                        existing.push(target.clone());
                    }
                }
            }
            None => matrix.push((config.to_string(), wanted.clone())),
        }
    }
    matrix.retain(|(_, targets)| !targets.is_empty());
    matrix
}

/// Apply the user-facing options of the final stage.
pub fn configure_final(
    builder: &mut LlvmBuilder,
    args: &LlvmArgs,
    profdata: Option<&Path>,
) -> Result<()> {
    builder.set_define("CLANG_VENDOR", args.vendor_string.as_str());
    builder.set_define("CMAKE_BUILD_TYPE", args.build_type.as_str());
    builder.set_define("LLVM_ENABLE_ASSERTIONS", if args.assertions { "ON" } else { "OFF" });
    if let Some(lto) = args.lto {
        let value = match lto {
            Lto::Thin => "Thin",
            Lto::Full => "Full",
        };
        builder.set_define("LLVM_ENABLE_LTO", value);
    }
    if let Some(profdata) = profdata {
        builder.set_define("LLVM_PROFDATA_FILE", profdata.display().to_string());
    }
    if let Some(march) = &args.march {
        let flags = format!("-march={march} -mtune={march}");
        builder.set_define("CMAKE_C_FLAGS", flags.as_str());
        builder.set_define("CMAKE_CXX_FLAGS", flags);
    }

    builder.check_targets.clone_from(&args.check_targets);
    if !args.install_targets.is_empty() {
        builder.install_targets.clone_from(&args.install_targets);
    } else if builder.slim {
        builder.install_targets = vec!["distribution".to_string()];
    }
    if builder.slim {
        builder.build_targets = vec!["distribution".to_string()];
    }

    // User defines override the options above. Base defines computed at
    // configure time (compilers, projects, targets) still take priority.
    for (key, value) in parse_defines(&args.defines)? {
        builder.set_define(&key, value);
    }
    Ok(())
}

struct Pipeline<'a> {
    args: &'a LlvmArgs,
    root: &'a Path,
    runner: Runner,
    host: HostEnv,
    llvm: LlvmSource,
    build_root: PathBuf,
    projects: Vec<String>,
    targets: Vec<String>,
    linux: Option<PathBuf>,
}

impl Pipeline<'_> {
    fn folders(&self, stage: &str) -> Folders {
        Folders {
            build: Some(self.build_root.join(stage)),
            install: None,
            source: Some(self.llvm.repo().to_path_buf()),
        }
    }

    /// Linux tree for the kernel workloads, prepared on first use.
    fn linux_source(&mut self) -> Result<PathBuf> {
        if let Some(linux) = &self.linux {
            return Ok(linux.clone());
        }
        let location = match &self.args.linux_folder {
            Some(folder) => folder.clone(),
            None => {
                let mut source = LinuxSource::release(&self.root.join("src"));
                source.add_patches_from(&self.root.join("patches/linux"))?;
                source.prepare(&self.runner)?;
                source.location
            }
        };
        self.linux = Some(location.clone());
        Ok(location)
    }

    fn kernel_builder(
        &mut self,
        prefix: PathBuf,
        matrix: Vec<(String, Vec<String>)>,
    ) -> Result<KernelProfileBuilder> {
        let source = self.linux_source()?;
        let mut kernel = KernelProfileBuilder::new(prefix, self.runner.clone());
        kernel.folders = Folders {
            build: Some(self.build_root.join("linux")),
            install: None,
            source: Some(source),
        };
        kernel.matrix = matrix;
        Ok(kernel)
    }

    fn bootstrap(&self, host_tools: &Tools) -> Result<PathBuf> {
        utils::print_header("Building LLVM (bootstrap)");

        let mut bootstrap = LlvmBuilder::bootstrap(self.runner.clone(), self.host.clone());
        bootstrap.folders = self.folders("bootstrap");
        bootstrap.ccache = !self.args.no_ccache;
        bootstrap.quiet_cmake = self.args.quiet_cmake;
        bootstrap.tools = Some(host_tools.clone());
        if !self.args.pgo.is_empty() {
            bootstrap.projects.push("compiler-rt".to_string());
        }
        if self.args.bolt {
            bootstrap.projects.push("bolt".to_string());
        }
        bootstrap.build_targets = vec!["distribution".to_string()];

        bootstrap.configure()?;
        bootstrap.build()?;
        Ok(bootstrap.folders.build()?.to_path_buf())
    }

    /// Build the instrumented compiler, run the workloads, and return the
    /// merged profile.
    fn instrumented(&mut self, stage1_bin: &Path) -> Result<PathBuf> {
        utils::print_header("Building LLVM (instrumented)");

        let mut instrumented = LlvmBuilder::instrumented(
            !self.args.full_toolchain,
            self.runner.clone(),
            self.host.clone(),
        );
        instrumented.folders = self.folders("instrumented");
        instrumented.quiet_cmake = self.args.quiet_cmake;
        instrumented.tools = Some(Tools::stage(stage1_bin));
        instrumented.projects = vec!["clang".to_string(), "lld".to_string()];
        instrumented.targets.clone_from(&self.targets);
        if instrumented.slim {
            instrumented.build_targets = vec!["distribution".to_string()];
        }

        instrumented.configure()?;
        instrumented.build()?;

        let instrumented_build = instrumented.folders.build()?.to_path_buf();
        utils::print_header("Generating PGO profiles");

        let host_target = instrumented.host_target();
        let matrix = kernel_matrix(&self.args.pgo, &self.targets, host_target);
        if !matrix.is_empty() {
            let mut kernel = self.kernel_builder(instrumented_build.clone(), matrix)?;
            kernel.build()?;
        }

        if self.args.pgo.contains(&PgoWorkload::Llvm) {
            let mut workload =
                LlvmBuilder::final_stage(true, self.runner.clone(), self.host.clone());
            workload.folders = self.folders("profiling");
            workload.quiet_cmake = self.args.quiet_cmake;
            workload.tools = Some(Tools::stage(&instrumented_build.join("bin")));
            workload.projects = vec!["clang".to_string(), "lld".to_string()];
            workload.targets.clone_from(&self.targets);
            workload.build_targets = vec!["distribution".to_string()];
            workload.configure()?;
            workload.build()?;
        }

        instrumented.generate_profdata()?;
        Ok(instrumented_build.join("profdata.prof"))
    }

    /// The final stage, set up but not yet configured.
    fn final_builder(&mut self, tools: Tools, profdata: Option<&Path>) -> Result<LlvmBuilder> {
        let mut final_stage = LlvmBuilder::final_stage(
            !self.args.full_toolchain,
            self.runner.clone(),
            self.host.clone(),
        );
        final_stage.folders = self.folders("final");
        final_stage.folders.install.clone_from(&self.args.install_folder);
        final_stage.quiet_cmake = self.args.quiet_cmake;
        final_stage.projects.clone_from(&self.projects);
        final_stage.targets.clone_from(&self.targets);
        final_stage.ccache = self.args.build_stage1_only && !self.args.no_ccache;
        final_stage.tools = Some(tools);
        configure_final(&mut final_stage, self.args, profdata)?;

        if self.args.bolt {
            final_stage.bolt = true;
            let host_target = final_stage.host_target();
            let targets = kernel_targets(&self.targets, host_target);
            let prefix = self.build_root.join("final");
            final_stage.bolt_builder =
                Some(self.kernel_builder(prefix, vec![("defconfig".to_string(), targets)])?);
        }
        Ok(final_stage)
    }

    /// Every stage in order; returns the built final stage.
    fn build(&mut self, host_tools: Tools) -> Result<LlvmBuilder> {
        if self.args.build_stage1_only {
            return self.final_stage(host_tools, None);
        }
        let stage1_bin = self.bootstrap(&host_tools)?.join("bin");
        let profdata = if self.args.pgo.is_empty() {
            None
        } else {
            Some(self.instrumented(&stage1_bin)?)
        };
        self.final_stage(Tools::stage(&stage1_bin), profdata.as_deref())
    }

    fn final_stage(&mut self, tools: Tools, profdata: Option<&Path>) -> Result<LlvmBuilder> {
        utils::print_header("Building LLVM (final)");

        let mut final_stage = self.final_builder(tools, profdata)?;
        final_stage.configure()?;
        final_stage.build()?;
        Ok(final_stage)
    }
}

/// `tc-build llvm`
pub fn run(args: &LlvmArgs, root: &Path) -> Result<()> {
    let start = Instant::now();
    let runner = Runner::new(args.show_build_commands);

    check_dependencies()?;

    utils::print_header("Checking CC and LD");
    let host_tools = Tools::detect_host()?;
    host_tools.show_compiler_linker();
    let host = HostEnv::detect()?;

    let git_ref = if args.use_good_revision {
        GOOD_REVISION
    } else {
        args.git_ref.as_str()
    };
    let llvm = LlvmSource::new(
        args.llvm_folder
            .clone()
            .unwrap_or_else(|| root.join("src/llvm-project")),
    );
    if args.llvm_folder.is_none() {
        llvm.git.download(git_ref, args.shallow_clone, &runner)?;
        if !args.no_update {
            llvm.git.update(git_ref, &runner)?;
        }
    }

    let projects = if args.projects.is_empty() {
        LlvmSource::default_projects()
    } else {
        args.projects.clone()
    };
    let targets = if args.targets.is_empty() {
        llvm.default_targets()?
    } else {
        args.targets.clone()
    };

    let mut pipeline = Pipeline {
        args,
        root,
        runner,
        host,
        llvm,
        build_root: args
            .build_folder
            .clone()
            .unwrap_or_else(|| root.join("build/llvm")),
        projects,
        targets,
        linux: None,
    };

    let final_stage = pipeline.build(host_tools)?;

    final_stage.show_install_info()?;

    if let Some(install) = &args.install_folder {
        BuildRecord::new("llvm", git_ref, start)
            .option("projects", pipeline.projects.join(";"))
            .option("targets", pipeline.targets.join(";"))
            .option(
                "pgo",
                args.pgo
                    .iter()
                    .copied()
                    .map(PgoWorkload::as_str)
                    .collect::<Vec<_>>()
                    .join(","),
            )
            .option("bolt", args.bolt.to_string())
            .option("lto", args.lto.map(Lto::as_str).unwrap_or_default())
            .write(install)?;
    }

    Ok(())
}
