//! Host and stage tool detection.
//!
//! The host compiler builds stage 1; every later stage is built with the
//! binaries from the previous stage's `bin` folder.

use crate::builder;
use crate::utils;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Top of tree major version when it cannot be fetched.
const FALLBACK_LLVM_MAJOR: u32 = 16;
/// Oldest versioned clang binary worth looking for.
const OLDEST_LLVM_MAJOR: u32 = 7;

const LLVM_CMAKELISTS_URL: &str =
    "https://raw.githubusercontent.com/llvm/llvm-project/main/llvm/CMakeLists.txt";

/// The programs a build stage is configured with.
///
/// Host detection leaves the LLVM-only tools unset; stage tools point at a
/// previously built `bin` folder.
#[derive(Clone, Debug, Default)]
pub struct Tools {
    pub cc: PathBuf,
    pub cc_is_clang: bool,
    pub cxx: PathBuf,
    /// Either a path or a bare `-fuse-ld=` name such as `gold`.
    pub ld: Option<PathBuf>,
    pub ar: Option<PathBuf>,
    pub ranlib: Option<PathBuf>,
    pub clang_tblgen: Option<PathBuf>,
    pub llvm_tblgen: Option<PathBuf>,
    pub llvm_bolt: Option<PathBuf>,
    pub llvm_profdata: Option<PathBuf>,
    pub merge_fdata: Option<PathBuf>,
    pub perf2bolt: Option<PathBuf>,
}

impl Tools {
    /// Tools from a built stage's `bin` folder.
    pub fn stage(bin: &Path) -> Self {
        let tool = |name: &str| Some(bin.join(name));
        Self {
            cc: bin.join("clang"),
            cc_is_clang: true,
            cxx: bin.join("clang++"),
            ld: tool("ld.lld"),
            ar: tool("llvm-ar"),
            ranlib: tool("llvm-ranlib"),
            clang_tblgen: tool("clang-tblgen"),
            llvm_tblgen: tool("llvm-tblgen"),
            llvm_bolt: tool("llvm-bolt"),
            llvm_profdata: tool("llvm-profdata"),
            merge_fdata: tool("merge-fdata"),
            perf2bolt: tool("perf2bolt"),
        }
    }

    /// Detect the host toolchain, honouring `CC`, `CXX` and `LD`.
    pub fn detect_host() -> Result<Self> {
        let cc = find_host_cc()?;
        let cc_is_clang = is_clang(&cc);
        let bin = cc.parent().map(Path::to_path_buf).unwrap_or_default();

        let beside_cc = |name: &str| {
            let path = bin.join(name);
            path.exists().then_some(path)
        };

        let cxx = find_host_cxx(&bin, cc_is_clang)?;
        let mut tools = Self {
            cc,
            cc_is_clang,
            cxx,
            ..Self::default()
        };
        if cc_is_clang {
            // GNU ar/ranlib are the defaults otherwise.
            tools.ar = beside_cc("llvm-ar");
            tools.ranlib = beside_cc("llvm-ranlib");
        }
        tools.ld = tools.find_host_ld(beside_cc("ld.lld"));
        Ok(tools)
    }

    fn find_host_ld(&self, lld_beside_cc: Option<PathBuf>) -> Option<PathBuf> {
        if let Ok(ld) = std::env::var("LD") {
            return self.validate_ld(Path::new(&ld), true);
        }

        if !self.cc_is_clang {
            // Only gold is worth testing with GCC.
            return self.validate_ld(Path::new("gold"), false);
        }

        // An ld.lld next to clang is known to work with it.
        if lld_beside_cc.is_some() {
            return lld_beside_cc;
        }
        let ld = ["ld.lld", "ld.gold", "ld.bfd"]
            .iter()
            .find_map(|name| which::which(name).ok())?;
        self.validate_ld(&ld, false)
    }

    /// Check that CC can link with `ld`, returning it if so.
    pub fn validate_ld(&self, ld: &Path, warn: bool) -> Option<PathBuf> {
        let mut cc = Command::new(&self.cc);
        cc.arg(format!("-fuse-ld={}", ld.display()))
            .args(["-o", "/dev/null", "-x", "c", "-"]);
        match builder::probe_with_input(&mut cc, "int main(void) { return 0; }") {
            Ok(output) if output.status.success() => Some(ld.to_path_buf()),
            Ok(output) => {
                log::debug!(
                    "-fuse-ld={} rejected: {}",
                    ld.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                if warn {
                    utils::print_warning(&format!(
                        "LD value ('{}') is not supported by CC ('{}'), ignoring it...",
                        ld.display(),
                        self.cc.display()
                    ));
                }
                None
            }
            Err(err) => {
                log::debug!("could not probe linker {}: {err:#}", ld.display());
                None
            }
        }
    }

    /// Printable location of the linker; bare names are looked up in PATH.
    pub fn ld_display(&self) -> Option<String> {
        let ld = self.ld.as_ref()?;
        if ld.components().count() > 1 {
            return Some(ld.display().to_string());
        }
        let name = ld.to_string_lossy();
        let lookup = if name.contains("ld.") {
            name.to_string()
        } else {
            format!("ld.{name}")
        };
        Some(
            which::which(&lookup)
                .map(|p| p.display().to_string())
                .unwrap_or(lookup),
        )
    }

    pub fn show_compiler_linker(&self) {
        println!("CC: {}", self.cc.display());
        println!("CXX: {}", self.cxx.display());
        if let Some(ld) = self.ld_display() {
            println!("LD: {ld}");
        }
        utils::flush_std_err_out();
    }
}

fn is_clang(cc: &Path) -> bool {
    cc.file_name()
        .is_some_and(|name| name.to_string_lossy().contains("clang"))
}

/// Resolve a tool named by an environment variable through PATH.
fn from_env(key: &str) -> Result<Option<PathBuf>> {
    let Ok(value) = std::env::var(key) else {
        return Ok(None);
    };
    let tool = which::which(&value).with_context(|| {
        format!("{key} value ('{value}') could not be found on your system?")
    })?;
    Ok(Some(tool))
}

fn find_host_cc() -> Result<PathBuf> {
    // Resolving gives /usr/lib/llvm-N/bin/... for Debian's versioned binaries.
    let cc = match from_env("CC")? {
        Some(cc) => cc,
        None => {
            let mut candidates = versioned_clangs(llvm_tot_major()?);
            candidates.extend(["clang".to_string(), "gcc".to_string()]);
            candidates
                .iter()
                .find_map(|name| which::which(name).ok())
                .context("Neither clang nor gcc could be found on your system?")?
        }
    };
    std::fs::canonicalize(&cc).with_context(|| format!("Failed to resolve {}", cc.display()))
}

fn find_host_cxx(cc_bin: &Path, cc_is_clang: bool) -> Result<PathBuf> {
    if let Some(cxx) = from_env("CXX")? {
        return Ok(cxx);
    }

    let name = if cc_is_clang { "clang++" } else { "g++" };
    let beside = cc_bin.join(name);
    if beside.exists() {
        return Ok(beside);
    }

    which::which(name)
        .with_context(|| format!("CXX ('{name}') could not be found on your system?"))
}

/// `clang-N` names from `tot` down to the oldest supported major.
pub fn versioned_clangs(tot: u32) -> Vec<String> {
    (OLDEST_LLVM_MAJOR..=tot)
        .rev()
        .map(|major| format!("clang-{major}"))
        .collect()
}

/// Extract `LLVM_VERSION_MAJOR` from an `llvm/CMakeLists.txt`.
pub fn parse_llvm_major(cmakelists: &str) -> Result<u32> {
    let re = Regex::new(r"set\(LLVM_VERSION_MAJOR\s+(\d+)")?;
    let Some(caps) = re.captures(cmakelists) else {
        bail!("Could not find LLVM_VERSION_MAJOR in CMakeLists.txt?");
    };
    Ok(caps[1].parse()?)
}

fn llvm_tot_major() -> Result<u32> {
    match utils::curl(LLVM_CMAKELISTS_URL) {
        Ok(text) => parse_llvm_major(&text),
        Err(err) => {
            log::debug!("falling back to LLVM {FALLBACK_LLVM_MAJOR}: {err:#}");
            Ok(FALLBACK_LLVM_MAJOR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versioned_clangs_newest_first() {
        let names = versioned_clangs(9);
        assert_eq!(names, vec!["clang-9", "clang-8", "clang-7"]);
        assert_eq!(versioned_clangs(FALLBACK_LLVM_MAJOR).len(), 10);
    }

    #[test]
    fn test_parse_llvm_major() {
        let text = "if(NOT DEFINED LLVM_VERSION_MAJOR)\n  set(LLVM_VERSION_MAJOR 22)\nendif()\n";
        assert_eq!(parse_llvm_major(text).unwrap(), 22);
        assert!(parse_llvm_major("project(LLVM)").is_err());
    }

    #[test]
    fn test_stage_tools_layout() {
        let tools = Tools::stage(Path::new("/build/llvm/bootstrap/bin"));
        assert_eq!(tools.cc, Path::new("/build/llvm/bootstrap/bin/clang"));
        assert_eq!(tools.cxx, Path::new("/build/llvm/bootstrap/bin/clang++"));
        assert_eq!(
            tools.ld.as_deref(),
            Some(Path::new("/build/llvm/bootstrap/bin/ld.lld"))
        );
        assert_eq!(
            tools.perf2bolt.as_deref(),
            Some(Path::new("/build/llvm/bootstrap/bin/perf2bolt"))
        );
        assert!(tools.cc_is_clang);
    }

    #[test]
    fn test_is_clang() {
        assert!(is_clang(Path::new("/usr/lib/llvm-18/bin/clang-18")));
        assert!(!is_clang(Path::new("/usr/bin/gcc")));
    }

    #[test]
    fn test_ld_display_keeps_paths() {
        let tools = Tools {
            ld: Some(PathBuf::from("/usr/bin/ld.lld")),
            ..Tools::default()
        };
        assert_eq!(tools.ld_display().as_deref(), Some("/usr/bin/ld.lld"));
        assert_eq!(Tools::default().ld_display(), None);
    }
}
