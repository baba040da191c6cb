//! Small helpers shared by every builder: console output, durations,
//! host facts and `curl`.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::time::Instant;

const CYAN: &str = "\x1b[01;36m";
const YELLOW: &str = "\x1b[01;33m";
const RESET: &str = "\x1b[0m";

fn print_color(color: &str, msg: &str) {
    println!("{color}{msg}{RESET}");
    flush_std_err_out();
}

pub fn print_cyan(msg: &str) {
    print_color(CYAN, msg);
}

/// Render a boxed header, e.g.
///
/// ```text
/// ==============
/// == Building ==
/// ==============
/// ```
pub fn header(title: &str) -> String {
    let border = "=".repeat(title.len() + 6);
    format!("{border}\n== {title} ==\n{border}")
}

/// Print a bold cyan header. Cyan so it is not mistaken for success/failure.
pub fn print_header(title: &str) {
    print_cyan(&format!("\n{}\n", header(title)));
}

pub fn print_info(msg: &str) {
    println!("I: {msg}");
    flush_std_err_out();
}

pub fn print_warning(msg: &str) {
    print_color(YELLOW, &format!("W: {msg}"));
}

pub fn flush_std_err_out() {
    // Nothing useful can be done if the terminal went away.
    let _ = std::io::stderr().flush();
    let _ = std::io::stdout().flush();
}

/// Format a number of seconds as `1d 2h 3m 4s`, omitting zero days, hours,
/// and minutes. Seconds are always shown.
pub fn format_duration(total_seconds: u64) -> String {
    let (days, rem) = (total_seconds / 86_400, total_seconds % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (minutes, seconds) = (rem / 60, rem % 60);

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    parts.push(format!("{seconds}s"));

    parts.join(" ")
}

/// Time elapsed since `start`, formatted with [`format_duration`].
pub fn get_duration(start: Instant) -> String {
    format_duration(start.elapsed().as_secs())
}

/// Make git ignore everything in a generated folder.
pub fn create_gitignore(folder: &Path) -> Result<()> {
    let path = folder.join(".gitignore");
    std::fs::write(&path, "*\n").with_context(|| format!("Failed to write {}", path.display()))
}

fn curl_command(url: &str) -> Command {
    let mut cmd = Command::new("curl");
    cmd.arg("-fLSs");
    cmd.arg(url);
    cmd
}

/// Fetch `url` and return the body as text.
pub fn curl(url: &str) -> Result<String> {
    log::debug!("curl {url}");
    let output = curl_command(url)
        .output()
        .context("Failed to run curl")?;
    if !output.status.success() {
        bail!(
            "curl failed for {url}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Download `url` into `destination`.
pub fn curl_to(url: &str, destination: &Path) -> Result<()> {
    log::debug!("curl {url} -> {}", destination.display());
    let status = curl_command(url)
        .arg("-o")
        .arg(destination)
        .status()
        .context("Failed to run curl")?;
    if !status.success() {
        bail!("Downloading {url} failed ({status})");
    }
    Ok(())
}

/// Whether the host C library is musl.
///
/// musl's `ldd` exits 1 and prints its version banner to stderr, so the exit
/// status is ignored.
pub fn libc_is_musl() -> bool {
    let Ok(output) = Command::new("ldd").arg("--version").output() else {
        return false;
    };
    let text = if output.stderr.is_empty() {
        output.stdout
    } else {
        output.stderr
    };
    String::from_utf8_lossy(&text).contains("musl")
}

/// Whether `/proc/cpuinfo` text describes an Apple CPU (implementer 0x61).
pub fn cpuinfo_is_apple_silicon(cpuinfo: &str) -> bool {
    let Ok(re) = Regex::new(r"implementer\s+:\s+(\w+)") else {
        return false;
    };
    re.captures(cpuinfo)
        .is_some_and(|caps| &caps[1] == "0x61")
}

/// If it cannot be proven to be Apple silicon, it is assumed not to be.
pub fn cpu_is_apple_silicon() -> bool {
    std::fs::read_to_string("/proc/cpuinfo")
        .map(|cpuinfo| cpuinfo_is_apple_silicon(&cpuinfo))
        .unwrap_or(false)
}

pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(1)
}

/// Host machine name as `uname -m` would report it.
pub fn host_machine() -> &'static str {
    match std::env::consts::ARCH {
        "arm" => "armv7l",
        "powerpc" => "ppc",
        "powerpc64" if cfg!(target_endian = "little") => "ppc64le",
        "powerpc64" => "ppc64",
        "mips" if cfg!(target_endian = "little") => "mipsel",
        "mips64" if cfg!(target_endian = "little") => "mips64el",
        "x86" => "i386",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration_seconds_only() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
    }

    #[test]
    fn test_format_duration_skips_zero_units() {
        assert_eq!(format_duration(65), "1m 5s");
        assert_eq!(format_duration(3_600), "1h 0s");
        assert_eq!(format_duration(86_400), "1d 0s");
        assert_eq!(format_duration(90_061), "1d 1h 1m 1s");
    }

    #[test]
    fn test_header_box() {
        assert_eq!(header("LLVM"), "==========\n== LLVM ==\n==========");
    }

    #[test]
    fn test_apple_silicon_detection() {
        let apple = "processor\t: 0\nCPU implementer\t: 0x61\nCPU architecture: 8\n";
        let arm = "processor\t: 0\nCPU implementer\t: 0x41\n";
        assert!(cpuinfo_is_apple_silicon(apple));
        assert!(!cpuinfo_is_apple_silicon(arm));
        assert!(!cpuinfo_is_apple_silicon("model name\t: AMD Ryzen\n"));
    }

    #[test]
    fn test_create_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        create_gitignore(dir.path()).unwrap();
        let content = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(content, "*\n");
    }

    #[test]
    fn test_cpu_count_nonzero() {
        assert!(cpu_count() >= 1);
    }
}
