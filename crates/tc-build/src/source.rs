//! Source acquisition: checksum-verified release tarballs and git checkouts.

use crate::builder::{self, Runner};
use crate::utils;
use anyhow::{bail, Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256, Sha512};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Read size while hashing a tarball.
const BYTES_TO_READ: usize = 128 * 1024;

/// Digest used by a remote checksum file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumAlgo {
    Sha256,
    Sha512,
}

impl ChecksumAlgo {
    /// Pick the algorithm from a checksum file name like `sha512.sum` or
    /// `sha256sums.asc`.
    pub fn from_file_name(name: &str) -> Result<Self> {
        if name.contains("sha256") {
            Ok(Self::Sha256)
        } else if name.contains("sha512") {
            Ok(Self::Sha512)
        } else {
            bail!("No supported hash algorithm for {name}, add support for it?")
        }
    }

    /// Hex digest of a file's contents.
    pub fn file_digest(self, path: &Path) -> Result<String> {
        match self {
            Self::Sha256 => hash_file::<Sha256>(path),
            Self::Sha512 => hash_file::<Sha512>(path),
        }
    }
}

fn hash_file<D: Digest>(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; BYTES_TO_READ];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Find the checksum for `file_name` in a `<hex>  <name>` style listing.
pub fn find_checksum(listing: &str, file_name: &str) -> Option<String> {
    let pattern = format!(r"(?m)^([0-9a-f]+)\s+{}$", regex::escape(file_name));
    let re = Regex::new(&pattern).ok()?;
    re.captures(listing).map(|caps| caps[1].to_string())
}

/// Check `path` against the entry for `remote_name` in `listing`.
pub fn verify_file(path: &Path, listing: &str, remote_name: &str, algo: ChecksumAlgo) -> Result<()> {
    let expected = find_checksum(listing, remote_name)
        .with_context(|| format!("Could not find checksum for {remote_name}?"))?;
    let computed = algo.file_digest(path)?;
    if computed != expected {
        bail!(
            "Computed checksum of {remote_name} ('{computed}') differs from expected checksum ('{expected}'), try again?"
        );
    }
    log::debug!("{remote_name}: checksum ok ({expected})");
    Ok(())
}

/// A release tarball that lives next to an optional checksum listing on a
/// download server.
#[derive(Clone, Debug, Default)]
pub struct Tarball {
    pub base_download_url: String,
    pub local_location: PathBuf,
    /// Defaults to the file name of `local_location`.
    pub remote_tarball_name: Option<String>,
    /// e.g. `sha512.sum`; no verification when unset.
    pub remote_checksum_name: Option<String>,
}

impl Tarball {
    fn remote_name(&self) -> Result<String> {
        if let Some(name) = &self.remote_tarball_name {
            return Ok(name.clone());
        }
        self.local_location
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| {
                format!("Invalid tarball location: {}", self.local_location.display())
            })
    }

    /// Download the tarball unless it is already present, then verify it.
    ///
    /// The download lands in a temporary file next to `local_location` and is
    /// only moved into place once verified.
    pub fn download(&self) -> Result<()> {
        if self.local_location.as_os_str().is_empty() {
            bail!("No local tarball location specified?");
        }
        if self.local_location.exists() {
            return Ok(());
        }
        if self.base_download_url.is_empty() {
            bail!("No tarball download URL specified?");
        }

        let remote_name = self.remote_name()?;
        let full_url = format!("{}/{remote_name}", self.base_download_url);
        let parent = match self.local_location.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
        utils::print_info(&format!(
            "Downloading {full_url} to {}...",
            self.local_location.display()
        ));
        let partial = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create a download file in {}", parent.display()))?;
        utils::curl_to(&full_url, partial.path())?;

        if let Some(checksum_name) = &self.remote_checksum_name {
            let algo = ChecksumAlgo::from_file_name(checksum_name)?;
            let listing = utils::curl(&format!("{}/{checksum_name}", self.base_download_url))?;
            verify_file(partial.path(), &listing, &remote_name, algo)?;
        }

        partial
            .persist(&self.local_location)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to move download to {}", self.local_location.display()))?;
        Ok(())
    }

    /// `tar` invocation that unpacks the tarball into `destination`,
    /// dropping the top-level folder.
    pub fn extract_command(&self, destination: &Path) -> Command {
        let mut tar = Command::new("tar");
        tar.arg("--auto-compress")
            .arg(format!("--directory={}", destination.display()))
            .arg("--extract")
            .arg(format!("--file={}", self.local_location.display()))
            .arg("--strip-components=1");
        tar
    }

    pub fn extract(&self, destination: &Path, runner: &Runner) -> Result<()> {
        if !self.local_location.exists() {
            bail!(
                "Local tarball ('{}') could not be found, download it first?",
                self.local_location.display()
            );
        }
        std::fs::create_dir_all(destination)
            .with_context(|| format!("Failed to create {}", destination.display()))?;
        utils::print_info(&format!(
            "Extracting {} into {}...",
            self.local_location.display(),
            destination.display()
        ));
        runner.run(&mut self.extract_command(destination))
    }
}

/// A git checkout managed by the tool (cloned on first use, updated on
/// later runs).
#[derive(Clone, Debug)]
pub struct GitSource {
    pub repo: PathBuf,
    pub pretty_name: &'static str,
    pub url: &'static str,
}

impl GitSource {
    /// Arguments for the initial clone.
    pub fn clone_command(&self, git_ref: &str, shallow: bool) -> Command {
        let mut git = Command::new("git");
        git.arg("clone");
        if shallow {
            git.arg("--depth=1");
            if git_ref != "main" {
                git.arg("--no-single-branch");
            }
        }
        git.arg(self.url).arg(&self.repo);
        git
    }

    /// Clone and check out `git_ref`, unless the repo already exists.
    pub fn download(&self, git_ref: &str, shallow: bool, runner: &Runner) -> Result<()> {
        if self.repo.exists() {
            return Ok(());
        }

        utils::print_header(&format!("Downloading {}", self.pretty_name));

        runner.run(&mut self.clone_command(git_ref, shallow))?;
        runner.run(&mut self.git(&["checkout", git_ref]))
    }

    fn git(&self, args: &[&str]) -> Command {
        let mut git = Command::new("git");
        git.args(args).current_dir(&self.repo);
        git
    }

    fn git_capture(&self, args: &[&str]) -> Result<String> {
        builder::capture(&mut self.git(args))
    }

    pub fn is_shallow(&self) -> Result<bool> {
        let git_dir = self.git_capture(&["rev-parse", "--git-dir"])?;
        Ok(self.repo.join(git_dir).join("shallow").exists())
    }

    /// Works for branches, tags and raw hashes.
    pub fn ref_exists(&self, git_ref: &str) -> bool {
        self.git_capture(&["show-branch", git_ref]).is_ok()
    }

    /// Fetch, check out `git_ref`, and fast-forward it if it is a branch.
    pub fn update(&self, git_ref: &str, runner: &Runner) -> Result<()> {
        utils::print_header(&format!("Updating {}", self.pretty_name));

        runner.run(&mut self.git(&["fetch", "origin"]))?;

        if !runner.is_dry_run() && self.is_shallow()? && !self.ref_exists(git_ref) {
            bail!("Repo is shallow and supplied ref ('{git_ref}') does not exist!");
        }

        runner.run(&mut self.git(&["checkout", git_ref]))?;

        // Tags and hashes have no symbolic ref; nothing to pull then.
        let local_ref = self.git_capture(&["symbolic-ref", "-q", "HEAD"]).ok();
        if let Some(branch) = local_ref.as_deref().and_then(|r| r.strip_prefix("refs/heads/")) {
            runner.run(&mut self.git(&["pull", "--rebase", "origin", branch]))?;
        }
        Ok(())
    }
}
