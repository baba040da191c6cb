//! GNU binutils: per-target autoconf builds from a release tarball.

use crate::builder::{Builder, Folders, Runner};
use crate::cli::BinutilsArgs;
use crate::source::Tarball;
use crate::targets::BinutilsTarget;
use crate::utils;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

pub const BINUTILS_VERSION: &str = "2.45";
pub const BINUTILS_URL: &str = "https://sourceware.org/pub/binutils/releases";

const COMMON_CONFIGURE_FLAGS: &[&str] = &[
    "--disable-compressed-debug-sections",
    "--disable-gdb",
    "--disable-gprofng",
    "--disable-nls",
    "--disable-werror",
    "--enable-deterministic-archives",
    "--enable-new-dtags",
    "--enable-plugins",
    "--enable-threads",
    "--quiet",
    "--with-system-zlib",
];

/// Documentation is always generated; these send it somewhere disposable.
const DOC_DIRS: &[&str] = &["info", "html", "pdf", "man"];

pub struct BinutilsBuilder {
    pub folders: Folders,
    pub runner: Runner,
    pub target: BinutilsTarget,
    pub cflags: Vec<String>,
    /// `uname -m` of the build machine.
    pub host_machine: String,
}

impl BinutilsBuilder {
    pub fn new(target: BinutilsTarget, runner: Runner) -> Self {
        Self {
            folders: Folders::default(),
            runner,
            target,
            cflags: vec!["-O2".to_string()],
            host_machine: utils::host_machine().to_string(),
        }
    }

    /// Add `-march`/`-mtune` for the machine the toolchain will run on.
    pub fn optimize_for(&mut self, march: &str) {
        self.cflags.push(format!("-march={march}"));
        self.cflags.push(format!("-mtune={march}"));
    }

    pub fn configure_command(&self, doc_dir: &Path) -> Result<Command> {
        let mut flags: Vec<String> = COMMON_CONFIGURE_FLAGS
            .iter()
            .chain(self.target.flavor().configure_flags())
            .map(|f| (*f).to_string())
            .collect();

        if let Some(install) = &self.folders.install {
            flags.push(format!("--prefix={}", install.display()));
        }
        if !self.target.is_native_on(&self.host_machine) {
            let triple = self.target.triple();
            flags.push(format!("--program-prefix={triple}-"));
            flags.push(format!("--target={triple}"));
        }
        if let Some(extra) = self.target.extra_targets() {
            flags.push(format!("--enable-targets={extra}"));
        }
        flags.extend(
            DOC_DIRS
                .iter()
                .map(|doc| format!("--{doc}dir={}", doc_dir.display())),
        );

        let cflags = self.cflags.join(" ");
        let mut configure = Command::new(self.folders.source()?.join("configure"));
        configure
            .args(&flags)
            .arg("CC=gcc")
            .arg("CXX=g++")
            .arg(format!("CFLAGS={cflags}"))
            .arg(format!("CXXFLAGS={cflags}"))
            .current_dir(self.folders.build()?);
        Ok(configure)
    }

    pub fn make_command(&self) -> Result<Command> {
        let mut make = Command::new("make");
        make.arg("-C")
            .arg(self.folders.build()?)
            .args(["-s", &format!("-j{}", utils::cpu_count()), "V=0"]);
        Ok(make)
    }
}

impl Builder for BinutilsBuilder {
    fn build(&mut self) -> Result<()> {
        self.folders.clean_build_folder()?;
        self.folders.make_build_folder()?;
        utils::print_header(&format!("Building {} binutils", self.target.triple()));

        let doc_dir = tempfile::tempdir().context("Failed to create documentation folder")?;

        self.runner.run(&mut self.configure_command(doc_dir.path())?)?;
        self.runner.run(&mut self.make_command()?)?;

        if let Some(install) = &self.folders.install {
            self.runner.run(self.make_command()?.arg("install"))?;
            if !self.runner.is_dry_run() {
                utils::create_gitignore(install)?;
            }
        }
        Ok(())
    }
}

/// A binutils source tree, unpacked from the release tarball on demand.
pub struct BinutilsSource {
    pub location: PathBuf,
    pub tarball: Tarball,
}

impl BinutilsSource {
    /// Release tarball layout under `<src>`.
    pub fn release(src: &Path) -> Self {
        let name = format!("binutils-{BINUTILS_VERSION}");
        Self {
            location: src.join(&name),
            tarball: Tarball {
                base_download_url: BINUTILS_URL.to_string(),
                local_location: src.join(format!("{name}.tar.xz")),
                remote_tarball_name: None,
                remote_checksum_name: Some("sha512.sum".to_string()),
            },
        }
    }

    /// A tree provided by the user; never downloaded.
    pub fn custom(location: PathBuf) -> Self {
        Self {
            location,
            tarball: Tarball::default(),
        }
    }

    pub fn default_targets(&self) -> Vec<BinutilsTarget> {
        let has_loongarch = self.location.join("gas/config/tc-loongarch.c").exists();
        BinutilsTarget::ALL
            .iter()
            .copied()
            .filter(|t| *t != BinutilsTarget::Loongarch64 || has_loongarch)
            .collect()
    }

    pub fn prepare(&self, runner: &Runner) -> Result<()> {
        if self.location.exists() {
            return Ok(());
        }
        if self.tarball.local_location.as_os_str().is_empty() {
            bail!(
                "{} does not exist and no tarball is set up for it?",
                self.location.display()
            );
        }
        self.tarball.download()?;
        self.tarball.extract(&self.location, runner)?;
        utils::print_info(&format!(
            "Source successfully prepared in {}",
            self.location.display()
        ));
        Ok(())
    }
}

/// `tc-build binutils`
pub fn run(args: &BinutilsArgs, root: &Path) -> Result<()> {
    let start = Instant::now();
    let runner = Runner::new(args.show_build_commands);

    let source = match &args.binutils_folder {
        Some(folder) => BinutilsSource::custom(folder.clone()),
        None => BinutilsSource::release(&root.join("src")),
    };
    source.prepare(&runner)?;

    let build_root = args
        .build_folder
        .clone()
        .unwrap_or_else(|| root.join("build/binutils"));
    let install = args
        .install_folder
        .clone()
        .unwrap_or_else(|| root.join("install"));

    let defaults = source.default_targets();
    let targets = BinutilsTarget::parse_list(&args.targets, &defaults, utils::host_machine())?;

    for target in &targets {
        let mut builder = BinutilsBuilder::new(*target, runner.clone());
        builder.folders = Folders {
            build: Some(build_root.join(target.triple())),
            install: Some(install.clone()),
            source: Some(source.location.clone()),
        };
        if let Some(march) = &args.march {
            builder.optimize_for(march);
        }
        builder.build()?;
    }

    crate::manifest::BuildRecord::new("binutils", BINUTILS_VERSION, start)
        .option("targets", targets.iter().map(ToString::to_string).collect::<Vec<_>>().join(","))
        .option("march", args.march.clone().unwrap_or_default())
        .write(&install)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::render;

    fn builder_for(target: BinutilsTarget, machine: &str) -> BinutilsBuilder {
        let mut builder = BinutilsBuilder::new(target, Runner::dry_run());
        builder.host_machine = machine.to_string();
        builder.folders = Folders {
            build: Some(PathBuf::from("/b")),
            install: Some(PathBuf::from("/i")),
            source: Some(PathBuf::from("/s")),
        };
        builder
    }

    #[test]
    fn test_cross_target_configure() {
        let builder = builder_for(BinutilsTarget::Aarch64, "x86_64");
        let cmd = render(&builder.configure_command(Path::new("/tmp/docs")).unwrap());
        assert!(cmd.starts_with("/s/configure --disable-compressed-debug-sections"));
        assert!(cmd.contains("--disable-multilib --with-gnu-as --with-gnu-ld"));
        assert!(cmd.contains("--prefix=/i"));
        assert!(cmd.contains("--program-prefix=aarch64-linux-gnu- --target=aarch64-linux-gnu"));
        assert!(!cmd.contains("--enable-targets"));
        assert!(cmd.contains("--mandir=/tmp/docs"));
        assert!(cmd.ends_with("CC=gcc CXX=g++ CFLAGS=-O2 CXXFLAGS=-O2"));
    }

    #[test]
    fn test_native_target_has_no_prefix() {
        let builder = builder_for(BinutilsTarget::X86_64, "x86_64");
        let cmd = render(&builder.configure_command(Path::new("/tmp/docs")).unwrap());
        assert!(!cmd.contains("--target="));
        assert!(cmd.contains("--disable-sim --enable-lto --enable-relro --with-pic"));
        assert!(cmd.contains("--enable-targets=x86_64-pep"));
    }

    #[test]
    fn test_march_flags() {
        let mut builder = builder_for(BinutilsTarget::S390x, "x86_64");
        builder.optimize_for("znver3");
        let cmd = render(&builder.configure_command(Path::new("/d")).unwrap());
        assert!(cmd.contains("'CFLAGS=-O2 -march=znver3 -mtune=znver3'"));
        assert!(cmd.contains("--enable-targets=s390-linux-gnu"));
    }

    #[test]
    fn test_dry_run_build_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = builder_for(BinutilsTarget::Riscv64, "x86_64");
        builder.folders.build = Some(dir.path().join("riscv64-linux-gnu"));
        builder.build().unwrap();

        let history = builder.runner.history();
        assert_eq!(history.len(), 3);
        assert!(history[0].starts_with("/s/configure "));
        let jobs = format!("-j{}", utils::cpu_count());
        assert!(history[1].ends_with(&format!("-s {jobs} V=0")));
        assert!(history[2].ends_with("V=0 install"));
        assert!(dir.path().join("riscv64-linux-gnu").is_dir());
    }

    #[test]
    fn test_default_targets_loongarch_detection() {
        let dir = tempfile::tempdir().unwrap();
        let source = BinutilsSource::custom(dir.path().to_path_buf());
        assert!(!source.default_targets().contains(&BinutilsTarget::Loongarch64));

        std::fs::create_dir_all(dir.path().join("gas/config")).unwrap();
        std::fs::write(dir.path().join("gas/config/tc-loongarch.c"), "").unwrap();
        let targets = source.default_targets();
        assert!(targets.contains(&BinutilsTarget::Loongarch64));
        assert_eq!(targets.len(), BinutilsTarget::ALL.len());
    }

    #[test]
    fn test_release_layout() {
        let source = BinutilsSource::release(Path::new("/root/src"));
        assert_eq!(source.location, Path::new("/root/src/binutils-2.45"));
        assert_eq!(
            source.tarball.local_location,
            Path::new("/root/src/binutils-2.45.tar.xz")
        );
    }

    #[test]
    fn test_prepare_skips_existing_tree() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::dry_run();
        BinutilsSource::custom(dir.path().to_path_buf())
            .prepare(&runner)
            .unwrap();
        assert!(runner.history().is_empty());
    }
}
