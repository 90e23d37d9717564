// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted defaults for flags that rarely change between invocations.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adb_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logcat_tags: Option<String>,
}

impl Settings {
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "src-root" => self.src_root = Some(PathBuf::from(value)),
            "adb-path" => self.adb_path = Some(value.to_string()),
            "target-device" => self.target_device = Some(value.to_string()),
            "logcat-tags" => self.logcat_tags = Some(value.to_string()),
            _ => anyhow::bail!(
                "Unknown setting {:?} (expected src-root, adb-path, target-device or logcat-tags)",
                key
            ),
        }
        Ok(())
    }

    pub fn clear(&mut self, key: &str) -> Result<()> {
        match key {
            "src-root" => self.src_root = None,
            "adb-path" => self.adb_path = None,
            "target-device" => self.target_device = None,
            "logcat-tags" => self.logcat_tags = None,
            _ => anyhow::bail!("Unknown setting {:?}", key),
        }
        Ok(())
    }
}

pub fn settings_path() -> PathBuf {
    if let Some(dir) = dirs_next::config_dir() {
        return dir.join("mojo-devtools").join("settings.json");
    }
    // Fallback to current directory
    PathBuf::from(".mojo_devtools_settings.json")
}

/// Unreadable or malformed settings are treated as empty.
pub fn load_from(path: &Path) -> Settings {
    match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice::<Settings>(&bytes) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Ignoring malformed settings file {}: {}", path.display(), e);
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    }
}

pub fn save_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }
    let bytes = serde_json::to_vec_pretty(settings)?;
    fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

pub fn load() -> Settings {
    load_from(&settings_path())
}

pub fn save(settings: &Settings) -> Result<()> {
    save_to(&settings_path(), settings)
}
