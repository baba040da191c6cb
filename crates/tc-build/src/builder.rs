//! Pieces every component builder shares: folder layout, the command runner,
//! and the [`Builder`] trait.

use anyhow::{bail, Context, Result};
use std::cell::RefCell;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::rc::Rc;

/// Where a component's source lives, where it is built, and where it gets
/// installed. Install is optional for every builder.
#[derive(Clone, Debug, Default)]
pub struct Folders {
    pub build: Option<PathBuf>,
    pub install: Option<PathBuf>,
    pub source: Option<PathBuf>,
}

impl Folders {
    pub fn build(&self) -> Result<&Path> {
        self.build.as_deref().context("No build folder set?")
    }

    pub fn source(&self) -> Result<&Path> {
        self.source.as_deref().context("No source folder set?")
    }

    /// Install folder, falling back to the build folder when the toolchain
    /// is meant to stay where it was built.
    pub fn install_or_build(&self) -> Result<&Path> {
        self.install
            .as_deref()
            .or(self.build.as_deref())
            .context("Installation folder not set?")
    }

    /// Remove the build folder (or a stray file in its place).
    pub fn clean_build_folder(&self) -> Result<()> {
        let build = self.build()?;
        if build.is_dir() {
            std::fs::remove_dir_all(build)
                .with_context(|| format!("Failed to remove {}", build.display()))?;
        } else if build.exists() {
            std::fs::remove_file(build)
                .with_context(|| format!("Failed to remove {}", build.display()))?;
        }
        Ok(())
    }

    pub fn make_build_folder(&self) -> Result<()> {
        let build = self.build()?;
        std::fs::create_dir_all(build)
            .with_context(|| format!("Failed to create {}", build.display()))
    }
}

/// A component that can be built.
pub trait Builder {
    fn build(&mut self) -> Result<()>;
}

/// Runs build-tool invocations one after another, aborting on the first
/// failure.
///
/// With `dry_run` set, commands are rendered and recorded instead of being
/// executed; [`Runner::history`] returns what would have run.
#[derive(Clone, Debug, Default)]
pub struct Runner {
    pub show_commands: bool,
    dry_run: bool,
    history: Rc<RefCell<Vec<String>>>,
}

impl Runner {
    pub fn new(show_commands: bool) -> Self {
        Self {
            show_commands,
            ..Self::default()
        }
    }

    /// A runner that never spawns anything.
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Rendered command lines recorded so far (dry run only).
    pub fn history(&self) -> Vec<String> {
        self.history.borrow().clone()
    }

    fn announce(&self, cmd: &Command) -> bool {
        let rendered = render(cmd);
        log::debug!("[run] {rendered}");
        if self.show_commands {
            // Acts sort of like 'set -x' in bash
            println!("$ {rendered}");
            crate::utils::flush_std_err_out();
        }
        if self.dry_run {
            self.history.borrow_mut().push(rendered);
        }
        self.dry_run
    }

    /// Run with inherited stdio.
    pub fn run(&self, cmd: &mut Command) -> Result<()> {
        if self.announce(cmd) {
            return Ok(());
        }
        let status = cmd
            .status()
            .with_context(|| format!("Failed to run {}", program(cmd)))?;
        if !status.success() {
            bail!("`{}` failed ({status})", render(cmd));
        }
        Ok(())
    }

    /// Run with output captured; stderr is surfaced only on failure.
    pub fn run_quiet(&self, cmd: &mut Command) -> Result<()> {
        if self.announce(cmd) {
            return Ok(());
        }
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run {}", program(cmd)))?;
        if !output.status.success() {
            bail!(
                "`{}` failed ({}):\n{}",
                render(cmd),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Run with output captured and hand the result back without judging the
    /// exit status. `None` in a dry run.
    pub fn output(&self, cmd: &mut Command) -> Result<Option<Output>> {
        if self.announce(cmd) {
            return Ok(None);
        }
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run {}", program(cmd)))?;
        Ok(Some(output))
    }

    /// Run and return trimmed stdout. Empty in a dry run.
    pub fn capture(&self, cmd: &mut Command) -> Result<String> {
        if self.announce(cmd) {
            return Ok(String::new());
        }
        capture(cmd)
    }
}

/// Run a probe command and return its trimmed stdout, failing on a non-zero
/// exit. Probes bypass the [`Runner`] because they inspect the host rather
/// than build anything.
pub fn capture(cmd: &mut Command) -> Result<String> {
    log::trace!("[probe] {}", render(cmd));
    let output = cmd
        .output()
        .with_context(|| format!("Failed to run {}", program(cmd)))?;
    if !output.status.success() {
        bail!(
            "`{}` failed ({}):\n{}",
            render(cmd),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a probe that feeds `input` on stdin. The exit status is left for the
/// caller to judge.
pub fn probe_with_input(cmd: &mut Command, input: &str) -> Result<Output> {
    use std::io::Write;

    log::trace!("[probe] {}", render(cmd));
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to run {}", program(cmd)))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes())?;
    }
    Ok(child.wait_with_output()?)
}

fn program(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

/// Quote a word for a POSIX shell if it needs it.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Render a command the way it would be typed into a shell.
pub fn render(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(OsStr::to_string_lossy)
        .map(|word| shell_quote(&word))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("ninja"), "ninja");
        assert_eq!(shell_quote("-DCMAKE_BUILD_TYPE=Release"), "-DCMAKE_BUILD_TYPE=Release");
        assert_eq!(shell_quote("CFLAGS=-O2 -march=native"), "'CFLAGS=-O2 -march=native'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_render_command() {
        let mut cmd = Command::new("make");
        cmd.args(["-C", "/tmp/build", "KCFLAGS=-Wno-error", "all"]);
        assert_eq!(render(&cmd), "make -C /tmp/build KCFLAGS=-Wno-error all");
    }

    #[test]
    fn test_dry_run_records_history() {
        let runner = Runner::dry_run();
        runner.run(Command::new("ninja").arg("all")).unwrap();
        runner.run_quiet(Command::new("ninja").arg("install")).unwrap();
        assert_eq!(runner.capture(&mut Command::new("clang")).unwrap(), "");

        // Clones share the same history.
        runner.clone().run(&mut Command::new("true")).unwrap();
        assert_eq!(
            runner.history(),
            vec!["ninja all", "ninja install", "clang", "true"]
        );
    }

    #[test]
    fn test_missing_folders_error() {
        let folders = Folders::default();
        assert!(folders.build().is_err());
        assert!(folders.source().is_err());
        assert!(folders.install_or_build().is_err());
    }

    #[test]
    fn test_install_falls_back_to_build() {
        let folders = Folders {
            build: Some(PathBuf::from("/b")),
            ..Folders::default()
        };
        assert_eq!(folders.install_or_build().unwrap(), Path::new("/b"));
    }

    #[test]
    fn test_clean_and_make_build_folder() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        let folders = Folders {
            build: Some(build.clone()),
            ..Folders::default()
        };

        folders.make_build_folder().unwrap();
        std::fs::write(build.join("stale"), "x").unwrap();
        folders.clean_build_folder().unwrap();
        assert!(!build.exists());

        // A plain file where the folder should be is removed too.
        std::fs::write(&build, "x").unwrap();
        folders.clean_build_folder().unwrap();
        assert!(!build.exists());
    }
}
