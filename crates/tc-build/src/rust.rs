//! Rust, built with `x.py` against an LLVM installed by `tc-build llvm`.

use crate::builder::{Builder, Folders, Runner};
use crate::cli::RustArgs;
use crate::llvm::print_path_instructions;
use crate::manifest::BuildRecord;
use crate::source::GitSource;
use crate::utils;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

/// A revision of Rust known to build the kernel.
pub const GOOD_REVISION: &str = "69b3959afec9b5468d5de15133b199553f6e55d2";
pub const RUST_URL: &str = "https://github.com/rust-lang/rust.git";

const TOOLS: &str = "cargo,clippy,rustdoc,rustfmt,src";

pub struct RustBuilder {
    pub folders: Folders,
    pub runner: Runner,
    pub llvm_install_folder: Option<PathBuf>,
    pub debug: bool,
    pub vendor_string: String,
}

impl RustBuilder {
    pub fn new(runner: Runner) -> Self {
        Self {
            folders: Folders::default(),
            runner,
            llvm_install_folder: None,
            debug: false,
            vendor_string: String::new(),
        }
    }

    pub fn configure_command(&self) -> Result<Command> {
        let llvm = self
            .llvm_install_folder
            .as_deref()
            .context("No LLVM install folder set?")?;
        let source = self.folders.source()?;
        let build = self.folders.build()?;

        // codegen tests need LLVM_INSTALL_UTILS, which the LLVM build leaves off.
        let mut configure = Command::new(source.join("configure"));
        configure
            .arg("--release-description")
            .arg(&self.vendor_string)
            .args(["--disable-docs", "--enable-locked-deps", "--tools", TOOLS])
            .arg("--prefix")
            .arg(self.folders.install_or_build()?)
            .args(["--sysconfdir", "etc"])
            .args([
                "--disable-codegen-tests",
                "--disable-lld",
                "--disable-llvm-bitcode-linker",
            ])
            .arg("--llvm-root")
            .arg(llvm);
        if self.debug {
            configure.arg("--enable-debug");
        }
        configure.current_dir(build);
        Ok(configure)
    }

    /// Write `bootstrap.toml` into a fresh build folder.
    pub fn configure(&mut self) -> Result<()> {
        let mut configure = self.configure_command()?;
        self.folders.clean_build_folder()?;
        self.folders.make_build_folder()?;
        self.runner.run(&mut configure)
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

        utils::print_header("Rust installation information");
        print_path_instructions(install, &bin);

        for tool in ["rustc", "rustdoc", "rustfmt", "clippy-driver", "cargo"] {
            let binary = bin.join(tool);
            if binary.exists() {
                self.runner
                    .run(Command::new(binary).args(["--version", "--verbose"]))?;
                println!();
            }
        }
        utils::flush_std_err_out();
        Ok(())
    }
}

impl Builder for RustBuilder {
    fn build(&mut self) -> Result<()> {
        let build = self.folders.build()?;
        if !build.join("bootstrap.toml").exists() {
            bail!("No bootstrap.toml in build folder, run configure()?");
        }

        let start = Instant::now();
        let mut x = Command::new(self.folders.source()?.join("x.py"));
        x.arg("install").current_dir(build);
        self.runner.run(&mut x)?;

        utils::print_info(&format!("Build duration: {}", utils::get_duration(start)));

        if let Some(install) = &self.folders.install {
            if !self.runner.is_dry_run() {
                utils::create_gitignore(install)?;
            }
        }
        Ok(())
    }
}

/// The rust-lang/rust checkout.
pub struct RustSource {
    pub git: GitSource,
}

impl RustSource {
    pub fn new(repo: PathBuf) -> Self {
        Self {
            git: GitSource {
                repo,
                pretty_name: "Rust",
                url: RUST_URL,
            },
        }
    }

    pub fn repo(&self) -> &Path {
        &self.git.repo
    }
}

/// `tc-build rust`
pub fn run(args: &RustArgs, root: &Path) -> Result<()> {
    let start = Instant::now();
    let runner = Runner::new(args.show_build_commands);

    let build_folder = args
        .build_folder
        .clone()
        .unwrap_or_else(|| root.join("build/rust"));
    let llvm_install_folder = args
        .llvm_install_folder
        .clone()
        .unwrap_or_else(|| root.join("build/llvm/final"));

    let git_ref = if args.use_good_revision {
        GOOD_REVISION
    } else {
        args.git_ref.as_str()
    };
    let source = match &args.rust_folder {
        Some(folder) => {
            if !folder.exists() {
                bail!("Provided Rust folder ('{}') does not exist?", folder.display());
            }
            RustSource::new(folder.clone())
        }
        None => {
            let source = RustSource::new(root.join("src/rust"));
            source.git.download(git_ref, false, &runner)?;
            if !args.no_update {
                source.git.update(git_ref, &runner)?;
            }
            source
        }
    };

    utils::print_header("Building Rust");

    let mut builder = RustBuilder::new(runner);
    builder.folders = Folders {
        build: Some(build_folder.join("final")),
        install: args.install_folder.clone(),
        source: Some(source.repo().to_path_buf()),
    };
    builder.llvm_install_folder = Some(llvm_install_folder.clone());
    builder.debug = args.debug;
    builder.vendor_string.clone_from(&args.vendor_string);

    builder.configure()?;
    builder.build()?;
    builder.show_install_info()?;

    if let Some(install) = &args.install_folder {
        BuildRecord::new("rust", git_ref, start)
            .option("llvm", llvm_install_folder.display().to_string())
            .option("debug", args.debug.to_string())
            .option("vendor", args.vendor_string.as_str())
            .write(install)?;
    }
    Ok(())
}
