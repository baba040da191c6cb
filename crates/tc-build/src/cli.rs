use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Lto {
    Thin,
    Full,
}

impl Lto {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thin => "thin",
            Self::Full => "full",
        }
    }
}

/// Workloads run with the instrumented compiler to collect PGO profiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PgoWorkload {
    KernelDefconfig,
    KernelAllmodconfig,
    KernelDefconfigSlim,
    KernelAllmodconfigSlim,
    Llvm,
}

impl PgoWorkload {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KernelDefconfig => "kernel-defconfig",
            Self::KernelAllmodconfig => "kernel-allmodconfig",
            Self::KernelDefconfigSlim => "kernel-defconfig-slim",
            Self::KernelAllmodconfigSlim => "kernel-allmodconfig-slim",
            Self::Llvm => "llvm",
        }
    }

    /// Kernel config target and whether only the host architecture is built.
    pub fn kernel_config(self) -> Option<(&'static str, bool)> {
        match self {
            Self::KernelDefconfig => Some(("defconfig", false)),
            Self::KernelAllmodconfig => Some(("allmodconfig", false)),
            Self::KernelDefconfigSlim => Some(("defconfig", true)),
            Self::KernelAllmodconfigSlim => Some(("allmodconfig", true)),
            Self::Llvm => None,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "tc-build")]
#[command(about = "Build LLVM, binutils, and Rust toolchains for the Linux kernel")]
pub struct Cli {
    /// Folder holding src/, build/ and install/ (defaults to the current directory)
    #[arg(long, global = true, env = "TC_BUILD_ROOT")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build GNU binutils for one or more targets.
    Binutils(BinutilsArgs),

    /// Build LLVM, optionally in multiple stages with PGO and BOLT.
    Llvm(LlvmArgs),

    /// Build Rust against a previously built LLVM.
    Rust(RustArgs),

    /// Build Linux with an existing LLVM toolchain.
    Kernel(KernelArgs),

    /// Inspect or remove downloaded sources.
    Sources {
        #[command(subcommand)]
        cmd: SourcesCmd,
    },
}

#[derive(Debug, Subcommand)]
pub enum SourcesCmd {
    /// Show which sources are downloaded and how big they are
    Status,
    /// Remove a downloaded source
    Clean {
        /// Source name (omit for all)
        name: Option<String>,
    },
}

#[derive(Debug, Args)]
pub struct BinutilsArgs {
    /// Build folder (default: <root>/build/binutils)
    #[arg(short = 'B', long)]
    pub build_folder: Option<PathBuf>,

    /// Install folder (default: <root>/install)
    #[arg(short = 'I', long)]
    pub install_folder: Option<PathBuf>,

    /// Existing binutils source instead of the release tarball
    #[arg(short = 'b', long)]
    pub binutils_folder: Option<PathBuf>,

    /// Targets to build: "all", "host", or architecture names such as aarch64
    #[arg(short = 't', long, num_args = 1.., default_value = "all")]
    pub targets: Vec<String>,

    /// Optimize the host tools for this -march value
    #[arg(short = 'm', long)]
    pub march: Option<String>,

    #[arg(long, help = "Print each build command before running it")]
    pub show_build_commands: bool,
}

#[derive(Debug, Args)]
pub struct LlvmArgs {
    /// Build with assertions enabled
    #[arg(long)]
    pub assertions: bool,

    /// Optimize the final clang with BOLT
    #[arg(long)]
    pub bolt: bool,

    /// Folder holding the per-stage build trees (default: <root>/build/llvm)
    #[arg(short = 'b', long)]
    pub build_folder: Option<PathBuf>,

    /// Build only one stage, with the host compiler
    #[arg(long, conflicts_with_all = ["pgo", "bolt"])]
    pub build_stage1_only: bool,

    /// CMAKE_BUILD_TYPE of the final stage
    #[arg(long, default_value = "Release")]
    pub build_type: String,

    /// Run check-<target> after the final build (e.g. clang lld llvm)
    #[arg(long, num_args = 1..)]
    pub check_targets: Vec<String>,

    /// Extra CMake defines as KEY=VALUE, applied last
    #[arg(short = 'D', long, num_args = 1..)]
    pub defines: Vec<String>,

    /// Build the whole toolchain rather than just what kernel builds need
    #[arg(long)]
    pub full_toolchain: bool,

    /// Install the final toolchain here
    #[arg(short = 'i', long)]
    pub install_folder: Option<PathBuf>,

    /// install-<target> targets to run instead of a full install
    #[arg(long, num_args = 1..)]
    pub install_targets: Vec<String>,

    /// Existing llvm-project checkout; it is never updated
    #[arg(short = 'l', long)]
    pub llvm_folder: Option<PathBuf>,

    /// Linux source for the kernel workloads instead of the release tarball
    #[arg(short = 'L', long)]
    pub linux_folder: Option<PathBuf>,

    /// Link-time optimization for the final stage
    #[arg(long, value_enum)]
    pub lto: Option<Lto>,

    /// Optimize the final stage for this -march value
    #[arg(short = 'm', long)]
    pub march: Option<String>,

    /// Do not use ccache for stage 1
    #[arg(long)]
    pub no_ccache: bool,

    /// Do not update the llvm-project checkout
    #[arg(short = 'n', long)]
    pub no_update: bool,

    /// Profile the compiler with these workloads before the final stage
    #[arg(long, value_enum, num_args = 1..)]
    pub pgo: Vec<PgoWorkload>,

    /// LLVM_ENABLE_PROJECTS of the final stage
    #[arg(short = 'p', long, num_args = 1..)]
    pub projects: Vec<String>,

    /// Hide CMake's configure output
    #[arg(long)]
    pub quiet_cmake: bool,

    /// Branch, tag or commit to build
    #[arg(short = 'r', long = "ref", default_value = "main")]
    pub git_ref: String,

    /// Clone with --depth=1
    #[arg(short = 's', long, conflicts_with = "use_good_revision")]
    pub shallow_clone: bool,

    #[arg(long, help = "Print each build command before running it")]
    pub show_build_commands: bool,

    /// LLVM_TARGETS_TO_BUILD of the final stage
    #[arg(short = 't', long, num_args = 1..)]
    pub targets: Vec<String>,

    /// Build a revision known to work with the kernel
    #[arg(long)]
    pub use_good_revision: bool,

    /// Vendor string shown in `clang --version`
    #[arg(long, default_value = "ClangBuiltLinux")]
    pub vendor_string: String,
}

#[derive(Debug, Args)]
pub struct RustArgs {
    /// Build a debug compiler and standard library
    #[arg(long)]
    pub debug: bool,

    /// Build folder (default: <root>/build/rust)
    #[arg(short = 'b', long, requires = "llvm_install_folder")]
    pub build_folder: Option<PathBuf>,

    /// Install folder; the build folder is used when unset
    #[arg(short = 'i', long)]
    pub install_folder: Option<PathBuf>,

    /// LLVM installation to build against (default: <root>/build/llvm/final)
    #[arg(short = 'l', long)]
    pub llvm_install_folder: Option<PathBuf>,

    /// Existing rust checkout; it is never updated
    #[arg(short = 'R', long)]
    pub rust_folder: Option<PathBuf>,

    /// Do not update the rust checkout
    #[arg(short = 'n', long)]
    pub no_update: bool,

    /// Branch, tag or commit to build
    #[arg(short = 'r', long = "ref", default_value = "master")]
    pub git_ref: String,

    #[arg(long, help = "Print each build command before running it")]
    pub show_build_commands: bool,

    /// Build a revision known to work with the kernel
    #[arg(long)]
    pub use_good_revision: bool,

    /// Release description shown in `rustc --version`
    #[arg(long, default_value = "ClangBuiltLinux")]
    pub vendor_string: String,
}

#[derive(Debug, Args)]
pub struct KernelArgs {
    /// LLVM toolchain to build with (default: <root>/build/llvm/final)
    #[arg(long)]
    pub toolchain_prefix: Option<PathBuf>,

    /// Linux source instead of the release tarball
    #[arg(short = 'L', long)]
    pub linux_folder: Option<PathBuf>,

    /// Build folder (default: <root>/build/linux)
    #[arg(short = 'b', long)]
    pub build_folder: Option<PathBuf>,

    /// LLVM target names to build kernels for (default: all supported)
    #[arg(short = 't', long, num_args = 1..)]
    pub targets: Vec<String>,

    /// Kernel configuration targets
    #[arg(long, num_args = 1.., default_value = "defconfig")]
    pub config_targets: Vec<String>,

    #[arg(long, help = "Print each build command before running it")]
    pub show_build_commands: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(argv: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("tc-build").chain(argv.iter().copied()))
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_llvm_defaults() {
        let Commands::Llvm(args) = parse(&["llvm"]).unwrap().command else {
            panic!("expected llvm");
        };
        assert_eq!(args.git_ref, "main");
        assert_eq!(args.build_type, "Release");
        assert_eq!(args.vendor_string, "ClangBuiltLinux");
        assert!(args.pgo.is_empty());
        assert!(args.lto.is_none());
    }

    #[test]
    fn test_llvm_pgo_workloads() {
        let cli = parse(&[
            "llvm",
            "--pgo",
            "kernel-defconfig-slim",
            "llvm",
            "--lto",
            "full",
            "-D",
            "A=1",
            "-D",
            "B=2",
        ])
        .unwrap();
        let Commands::Llvm(args) = cli.command else {
            panic!("expected llvm");
        };
        assert_eq!(args.pgo, vec![PgoWorkload::KernelDefconfigSlim, PgoWorkload::Llvm]);
        assert_eq!(args.lto, Some(Lto::Full));
        assert_eq!(args.defines, vec!["A=1", "B=2"]);
    }

    #[test]
    fn test_llvm_conflicts() {
        assert!(parse(&["llvm", "--build-stage1-only", "--bolt"]).is_err());
        assert!(parse(&["llvm", "--build-stage1-only", "--pgo", "llvm"]).is_err());
        assert!(parse(&["llvm", "--shallow-clone", "--use-good-revision"]).is_err());
        assert!(parse(&["llvm", "--pgo", "kernel-tinyconfig"]).is_err());
    }

    #[test]
    fn test_rust_build_folder_requires_llvm() {
        assert!(parse(&["rust", "-b", "/tmp/rust"]).is_err());
        let cli = parse(&["rust", "-b", "/tmp/rust", "-l", "/opt/llvm"]).unwrap();
        let Commands::Rust(args) = cli.command else {
            panic!("expected rust");
        };
        assert_eq!(args.git_ref, "master");
        assert_eq!(args.llvm_install_folder, Some(PathBuf::from("/opt/llvm")));
    }

    #[test]
    fn test_binutils_and_kernel_defaults() {
        let Commands::Binutils(args) = parse(&["binutils"]).unwrap().command else {
            panic!("expected binutils");
        };
        assert_eq!(args.targets, vec!["all"]);

        let Commands::Kernel(args) = parse(&["kernel", "-t", "X86", "ARM"]).unwrap().command
        else {
            panic!("expected kernel");
        };
        assert_eq!(args.config_targets, vec!["defconfig"]);
        assert_eq!(args.targets, vec!["X86", "ARM"]);
    }

    #[test]
    fn test_global_root() {
        let cli = parse(&["sources", "status", "--root", "/srv/tc"]).unwrap();
        assert_eq!(cli.root, Some(PathBuf::from("/srv/tc")));
        assert!(matches!(cli.command, Commands::Sources { cmd: SourcesCmd::Status }));
    }

    #[test]
    fn test_workload_kernel_config() {
        assert_eq!(
            PgoWorkload::KernelAllmodconfigSlim.kernel_config(),
            Some(("allmodconfig", true))
        );
        assert_eq!(PgoWorkload::Llvm.kernel_config(), None);
        assert_eq!(PgoWorkload::KernelDefconfig.as_str(), "kernel-defconfig");
    }
}
