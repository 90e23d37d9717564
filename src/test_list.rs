//! Declarative test lists, read once per runner invocation.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApptestType {
    #[default]
    Gtest,
    GtestIsolated,
    Dart,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApptestEntry {
    pub test: String,
    #[serde(rename = "type", default)]
    pub kind: ApptestType,
    /// Display name; the test URL when absent.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "test-args", default)]
    pub test_args: Vec<String>,
    #[serde(rename = "shell-args", default)]
    pub shell_args: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub target_os: Vec<String>,
}

impl ApptestEntry {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.test)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnittestEntry {
    pub test: String,
    #[serde(default = "default_true")]
    pub cacheable: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub target_os: Vec<String>,
}

/// Common filtering fields of test list entries.
pub trait Selectable {
    fn disabled(&self) -> bool;
    fn target_os(&self) -> &[String];
}

impl Selectable for ApptestEntry {
    fn disabled(&self) -> bool {
        self.disabled
    }
    fn target_os(&self) -> &[String] {
        &self.target_os
    }
}

impl Selectable for UnittestEntry {
    fn disabled(&self) -> bool {
        self.disabled
    }
    fn target_os(&self) -> &[String] {
        &self.target_os
    }
}

fn load<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let text = fs::read_to_string(path).with_context(|| format!("Reading test list {}", path.display()))?;
    let entries: Vec<T> =
        serde_json::from_str(&text).with_context(|| format!("Parsing test list {}", path.display()))?;
    log::debug!("{}: {} entries", path.display(), entries.len());
    Ok(entries)
}

pub fn load_apptests(path: &Path) -> Result<Vec<ApptestEntry>> {
    load(path)
}

pub fn load_unittests(path: &Path) -> Result<Vec<UnittestEntry>> {
    load(path)
}

/// Entries that are enabled and whose `target_os` selector accepts `config`,
/// in list order.
pub fn select<'a, T: Selectable>(entries: &'a [T], config: &Config) -> Vec<&'a T> {
    entries
        .iter()
        .filter(|e| !e.disabled() && config.match_target_os(e.target_os()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TargetArch, TargetOs};

    #[test]
    fn apptest_entries_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apptests.json");
        fs::write(
            &path,
            r#"[
                {"test": "mojo:clipboard_apptests"},
                {"test": "mojo:view_manager_apptests", "type": "gtest_isolated",
                 "test-args": ["--use-headless-config"], "shell-args": ["--enable-multiprocess"]},
                {"test": "mojo:dart_apptests", "type": "dart", "name": "Dart", "disabled": true},
                {"test": "mojo:desktop_only", "target_os": ["!android"]}
            ]"#,
        )
        .unwrap();

        let entries = load_apptests(&path).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].kind, ApptestType::Gtest);
        assert_eq!(entries[0].display_name(), "mojo:clipboard_apptests");
        assert_eq!(entries[1].kind, ApptestType::GtestIsolated);
        assert_eq!(entries[1].shell_args, vec!["--enable-multiprocess".to_string()]);
        assert_eq!(entries[2].display_name(), "Dart");

        let android = Config::new(Some(TargetOs::Android), Some(TargetArch::Arm), true).unwrap();
        let picked: Vec<&str> = select(&entries, &android).iter().map(|e| e.test.as_str()).collect();
        assert_eq!(picked, vec!["mojo:clipboard_apptests", "mojo:view_manager_apptests"]);
    }

    #[test]
    fn unittests_are_cacheable_unless_said_otherwise() {
        let entries: Vec<UnittestEntry> = serde_json::from_str(
            r#"[{"test": "mojo_common_unittests"}, {"test": "mojo_system_unittests", "cacheable": false}]"#,
        )
        .unwrap();
        assert!(entries[0].cacheable);
        assert!(!entries[1].cacheable);
    }

    #[test]
    fn malformed_list_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"[{"type": "gtest"}]"#).unwrap();
        assert!(load_apptests(&path).is_err());
        assert!(load_unittests(&dir.path().join("missing.json")).is_err());
    }
}
