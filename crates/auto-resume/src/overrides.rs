use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::fsview::FileSystem;
use crate::settings::ResumeSettings;

/// Where a previous invocation recorded its command-line overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataSource {
    /// `<run>/.hydra/hydra.yaml`, written per run.
    Run,
    /// `<sweep>/multirun.yaml`, written once per sweep.
    Multirun,
}

impl MetadataSource {
    pub fn path(self, dir: &Path, settings: &ResumeSettings) -> PathBuf {
        match self {
            MetadataSource::Run => dir
                .join(&settings.metadata_dir)
                .join(&settings.run_metadata_file),
            MetadataSource::Multirun => dir.join(&settings.multirun_marker),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetadataDoc {
    hydra: Option<HydraSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HydraSection {
    overrides: Option<OverridesSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OverridesSection {
    task: Option<Vec<String>>,
}

pub fn try_load_overrides(fs: &dyn FileSystem, path: &Path) -> Result<Vec<String>> {
    let raw = fs.read_to_string(path)?;
    let doc: MetadataDoc = serde_yaml::from_str(&raw)
        .map_err(|e| Error::msg(format!("YAML parse error in {}: {e}", path.display())))?;
    doc.hydra
        .and_then(|h| h.overrides)
        .and_then(|o| o.task)
        .ok_or_else(|| {
            Error::msg(format!(
                "{} has no hydra.overrides.task list",
                path.display()
            ))
        })
}

/// Task-level overrides recorded at `path`, or nothing when the document is
/// missing, unreadable or lacks the list.
pub fn load_overrides(fs: &dyn FileSystem, path: &Path) -> Vec<String> {
    match try_load_overrides(fs, path) {
        Ok(list) => {
            tracing::info!(path = %path.display(), overrides = ?list, "loaded previous overrides");
            list
        }
        Err(e) => {
            tracing::warn!("failed to load overrides from {}: {e}", path.display());
            Vec::new()
        }
    }
}
