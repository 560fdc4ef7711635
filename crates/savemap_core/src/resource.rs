use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A YAML store kept in the data directory.
pub trait ResourceFile: Default + Serialize + DeserializeOwned {
    const FILE_NAME: &'static str;

    /// Hook for stores whose empty state is not `Default::default()`.
    fn initialize(self) -> Self {
        self
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default().initialize());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default().initialize());
        }
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from(&dir.join(Self::FILE_NAME))
    }

    /// Returns false when the file already held identical content.
    fn save_to(&self, path: &Path) -> Result<bool> {
        let content = serde_yaml::to_string(self)
            .with_context(|| format!("failed to serialize {}", Self::FILE_NAME))?;
        write_if_changed(path, &content)
    }

    fn save_to_dir(&self, dir: &Path) -> Result<bool> {
        self.save_to(&dir.join(Self::FILE_NAME))
    }
}

pub fn write_if_changed(path: &Path, content: &str) -> Result<bool> {
    if fs::read_to_string(path).is_ok_and(|existing| existing == content) {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}
