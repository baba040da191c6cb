//! Build record written next to an installed toolchain.

use crate::utils;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

pub const RECORD_FILE: &str = "tc-build.json";

/// What was built, from which source, and with which options.
#[derive(Debug, Serialize, Deserialize)]
pub struct BuildRecord {
    pub component: String,
    pub version: String,
    pub started_at: String,
    pub finished_at: String,
    pub duration_seconds: u64,
    pub duration: String,
    pub options: BTreeMap<String, String>,
}

impl BuildRecord {
    /// A record for a build that began at `start`.
    pub fn new(component: &str, version: &str, start: Instant) -> Self {
        let elapsed = start.elapsed();
        let now = chrono::Utc::now();
        let started = chrono::Duration::from_std(elapsed)
            .map_or(now, |elapsed| now - elapsed);
        Self {
            component: component.to_string(),
            version: version.to_string(),
            started_at: started.to_rfc3339(),
            finished_at: now.to_rfc3339(),
            duration_seconds: elapsed.as_secs(),
            duration: utils::format_duration(elapsed.as_secs()),
            options: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn option(mut self, key: &str, value: impl Into<String>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    /// Write the record into `folder`, replacing an older one.
    pub fn write(&self, folder: &Path) -> Result<()> {
        std::fs::create_dir_all(folder)
            .with_context(|| format!("Failed to create {}", folder.display()))?;
        let path = folder.join(RECORD_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content + "\n")
            .with_context(|| format!("Failed to write {}", path.display()))?;
        log::debug!("wrote build record {}", path.display());
        Ok(())
    }

    pub fn load(folder: &Path) -> Result<Self> {
        let path = folder.join(RECORD_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_load_record() {
        let dir = tempfile::tempdir().unwrap();
        let install = dir.path().join("install");

        BuildRecord::new("binutils", "2.45", Instant::now())
            .option("targets", "aarch64-linux-gnu,x86_64-linux-gnu")
            .option("march", String::new())
            .write(&install)
            .unwrap();

        let record = BuildRecord::load(&install).unwrap();
        assert_eq!(record.component, "binutils");
        assert_eq!(record.version, "2.45");
        assert_eq!(record.options["targets"], "aarch64-linux-gnu,x86_64-linux-gnu");
        assert_eq!(record.options["march"], "");
        let started = chrono::DateTime::parse_from_rfc3339(&record.started_at).unwrap();
        let finished = chrono::DateTime::parse_from_rfc3339(&record.finished_at).unwrap();
        assert!(started <= finished);
    }

    #[test]
    fn test_record_is_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        BuildRecord::new("llvm", "main", Instant::now())
            .write(dir.path())
            .unwrap();
        let text = std::fs::read_to_string(dir.path().join(RECORD_FILE)).unwrap();
        assert!(text.contains("\n  \"component\": \"llvm\""));
        assert!(text.ends_with("}\n"));
    }

    #[test]
    fn test_load_missing_record() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BuildRecord::load(dir.path()).is_err());
    }
}
