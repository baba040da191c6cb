//! Inventory of downloaded sources under `<root>/src`.

#![allow(clippy::cast_precision_loss)] // Sizes are only displayed

use crate::binutils::{BINUTILS_URL, BINUTILS_VERSION};
use crate::kernel::{LINUX_URL, LINUX_VERSION};
use crate::llvm::LLVM_URL;
use crate::rust::RUST_URL;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

pub const SOURCE_DIR: &str = "src";

/// A source the tool downloads on demand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnownSource {
    pub name: String,
    pub origin: String,
}

/// Everything that may end up in `<root>/src`.
pub fn sources() -> Vec<KnownSource> {
    vec![
        KnownSource {
            name: "llvm-project".to_string(),
            origin: format!("git: {LLVM_URL}"),
        },
        KnownSource {
            name: "rust".to_string(),
            origin: format!("git: {RUST_URL}"),
        },
        KnownSource {
            name: format!("binutils-{BINUTILS_VERSION}"),
            origin: format!("tarball: {BINUTILS_URL}"),
        },
        KnownSource {
            name: format!("linux-{LINUX_VERSION}"),
            origin: format!("tarball: {LINUX_URL}"),
        },
    ]
}

pub fn find_source(name: &str) -> Option<KnownSource> {
    sources().into_iter().find(|s| s.name == name)
}

fn source_dir(root: &Path) -> PathBuf {
    root.join(SOURCE_DIR)
}

/// Show which sources are present and how much space they take.
pub fn status(root: &Path) -> Result<()> {
    println!("Sources in {}:\n", source_dir(root).display());

    let known = sources();
    let mut total_size: u64 = 0;
    let mut cached = 0;

    for source in &known {
        let path = source_dir(root).join(&source.name);
        if path.exists() {
            let size = dir_size(&path)?;
            total_size += size;
            cached += 1;
            println!(
                "  {:16} [cached] {:.1} MB",
                source.name,
                size as f64 / 1_000_000.0
            );
        } else {
            println!("  {:16} [missing] {}", source.name, source.origin);
        }
    }

    println!();
    println!(
        "  Total: {}/{} cached ({:.1} MB)",
        cached,
        known.len(),
        total_size as f64 / 1_000_000.0
    );

    Ok(())
}

/// Remove one downloaded source (and its tarball), or all of `<root>/src`.
pub fn clean(root: &Path, name: Option<&str>) -> Result<()> {
    let dir = source_dir(root);
    let Some(name) = name else {
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
            println!("Cleaned all downloaded sources");
        }
        return Ok(());
    };

    if find_source(name).is_none() {
        bail!("Unknown source: {name}");
    }

    let path = dir.join(name);
    if path.exists() {
        std::fs::remove_dir_all(&path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
        println!("Cleaned: {name}");
    } else {
        println!("{name} not downloaded");
    }

    for tarball in tarballs(&dir, name)? {
        std::fs::remove_file(&tarball)
            .with_context(|| format!("Failed to remove {}", tarball.display()))?;
        log::debug!("removed {}", tarball.display());
    }
    Ok(())
}

/// `<name>.tar.*` files sitting next to the unpacked trees.
fn tarballs(dir: &Path, name: &str) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let prefix = format!("{name}.tar.");
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with(&prefix));
        if matches && path.is_file() {
            found.push(path);
        }
    }
    Ok(found)
}

fn dir_size(path: &Path) -> Result<u64> {
    let output = Command::new("du")
        .arg("-sb")
        .arg(path)
        .output()
        .context("Failed to get directory size")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .split_whitespace()
        .next()
        .and_then(|size| size.parse().ok())
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_sources() {
        let names: Vec<String> = sources().into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec!["llvm-project", "rust", "binutils-2.45", "linux-6.17"]
        );
        assert!(find_source("rust").is_some());
        assert!(find_source("gcc").is_none());
    }

    #[test]
    fn test_clean_one_source_with_tarball() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join(SOURCE_DIR);
        std::fs::create_dir_all(src.join("binutils-2.45/gas")).unwrap();
        std::fs::write(src.join("binutils-2.45.tar.xz"), "").unwrap();
        std::fs::create_dir_all(src.join("rust")).unwrap();

        clean(root.path(), Some("binutils-2.45")).unwrap();
        assert!(!src.join("binutils-2.45").exists());
        assert!(!src.join("binutils-2.45.tar.xz").exists());
        assert!(src.join("rust").exists());
    }

    #[test]
    fn test_clean_unknown_source() {
        let root = tempfile::tempdir().unwrap();
        assert!(clean(root.path(), Some("gcc")).is_err());
    }

    #[test]
    fn test_clean_all() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("src/llvm-project")).unwrap();
        clean(root.path(), None).unwrap();
        assert!(!root.path().join(SOURCE_DIR).exists());

        // Nothing left to clean is fine.
        clean(root.path(), None).unwrap();
        clean(root.path(), Some("rust")).unwrap();
    }

    #[test]
    fn test_status_with_missing_sources() {
        let root = tempfile::tempdir().unwrap();
        status(root.path()).unwrap();
    }
}
