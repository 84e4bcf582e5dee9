use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::{Table, Value};

use crate::error::{Error, Result};

pub const DEFAULT_SETTINGS_FILE: &str = "auto-resume.toml";

fn default_resume_arg_name() -> String {
    "resume".into()
}

fn default_checkpoint_dir() -> String {
    "checkpoints".into()
}

fn default_checkpoint_names() -> Vec<String> {
    vec!["hpc_ckpt.ckpt".into(), "last.ckpt".into()]
}

fn default_checkpoint_ext() -> String {
    ".ckpt".into()
}

fn default_auto_sentinel() -> String {
    "AUTO".into()
}

fn default_metadata_dir() -> String {
    ".hydra".into()
}

fn default_artifact_alias() -> String {
    "latest".into()
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResumeSettings {
    /// Name of the trigger token (`<name>=<target>`).
    pub resume_arg_name: String,
    /// Subdirectory of a run directory holding checkpoints.
    pub checkpoint_dir: String,
    /// Ordered list of checkpoint filenames probed for in-place recovery.
    pub checkpoint_names: Vec<String>,
    pub checkpoint_ext: String,
    pub ckpt_path_key: String,
    pub run_id_key: String,
    pub auto_sentinel: String,
    pub identity_len: usize,
    /// Presence of this variable means the job runs under the scheduler.
    pub scheduler_env_var: String,
    pub metadata_dir: String,
    pub run_metadata_file: String,
    pub multirun_marker: String,
    pub saved_config_file: String,
    pub run_dir_key: String,
    pub sweep_dir_key: String,
    pub output_dir_key: String,
    pub tracker_dir: String,
    pub tracker_latest: String,
    pub remote: RemoteSettings,
}

impl Default for ResumeSettings {
    fn default() -> Self {
        Self {
            resume_arg_name: default_resume_arg_name(),
            checkpoint_dir: default_checkpoint_dir(),
            checkpoint_names: default_checkpoint_names(),
            checkpoint_ext: default_checkpoint_ext(),
            ckpt_path_key: "ckpt_path".into(),
            run_id_key: "wandb_id".into(),
            auto_sentinel: default_auto_sentinel(),
            identity_len: 8,
            scheduler_env_var: "SLURM_JOB_ID".into(),
            metadata_dir: default_metadata_dir(),
            run_metadata_file: "hydra.yaml".into(),
            multirun_marker: "multirun.yaml".into(),
            saved_config_file: "config.yaml".into(),
            run_dir_key: "hydra.run.dir".into(),
            sweep_dir_key: "hydra.sweep.dir".into(),
            output_dir_key: "hydra.runtime.output_dir".into(),
            tracker_dir: "wandb".into(),
            tracker_latest: "latest-run".into(),
            remote: RemoteSettings::default(),
        }
    }
}

impl ResumeSettings {
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("resume_arg_name", &self.resume_arg_name),
            ("checkpoint_dir", &self.checkpoint_dir),
            ("ckpt_path_key", &self.ckpt_path_key),
            ("run_id_key", &self.run_id_key),
            ("auto_sentinel", &self.auto_sentinel),
            ("metadata_dir", &self.metadata_dir),
            ("run_metadata_file", &self.run_metadata_file),
            ("multirun_marker", &self.multirun_marker),
            ("output_dir_key", &self.output_dir_key),
            ("tracker_dir", &self.tracker_dir),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Error::msg(format!("resume.{name} must not be empty")));
            }
        }
        if self.checkpoint_names.iter().all(|n| n.trim().is_empty()) {
            return Err(Error::msg(
                "resume.checkpoint_names must list at least one filename",
            ));
        }
        if self.identity_len == 0 {
            return Err(Error::msg("resume.identity_len must be greater than 0"));
        }
        Ok(())
    }

    /// The `<name>=` prefix identifying the trigger token.
    pub fn trigger_prefix(&self) -> String {
        format!("{}=", self.resume_arg_name)
    }

    /// Name prefix of timestamped metadata backups, e.g. `.hydra.old_`.
    pub fn backup_prefix(&self) -> String {
        format!("{}.old_", self.metadata_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub base_url: Option<String>,
    pub base_url_env: Option<String>,
    pub token: Option<String>,
    pub token_env: Option<String>,
    pub project: Option<String>,
    pub artifact_type: String,
    #[serde(default = "default_artifact_alias")]
    pub artifact_alias: String,
    pub ckpt_pattern: String,
    /// Downloaded checkpoints are renamed to this; empty keeps the artifact's name.
    pub target_filename: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            base_url_env: Some("AUTO_RESUME_REMOTE_URL".into()),
            token: None,
            token_env: Some("WANDB_API_KEY".into()),
            project: None,
            artifact_type: "model".into(),
            artifact_alias: default_artifact_alias(),
            ckpt_pattern: "*.ckpt".into(),
            target_filename: "wandb.ckpt".into(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn non_blank(s: &str) -> Option<&str> {
    let t = s.trim();
    (!t.is_empty()).then_some(t)
}

/// The literal when set, else the value of the named environment variable.
fn literal_or_env(literal: Option<&str>, env_key: Option<&str>) -> Option<String> {
    if let Some(v) = literal.and_then(non_blank) {
        return Some(v.to_string());
    }
    let value = std::env::var(env_key.and_then(non_blank)?).ok()?;
    non_blank(&value).map(ToOwned::to_owned)
}

impl RemoteSettings {
    pub fn resolved_base_url(&self) -> Option<String> {
        literal_or_env(self.base_url.as_deref(), self.base_url_env.as_deref())
    }

    pub fn resolved_token(&self) -> Option<String> {
        literal_or_env(self.token.as_deref(), self.token_env.as_deref())
    }

    /// Falls back to the name of the working directory.
    pub fn project_name(&self) -> String {
        if let Some(p) = self.project.as_deref().and_then(non_blank) {
            return p.to_string();
        }
        std::env::current_dir()
            .ok()
            .and_then(|cwd| cwd.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "default".into())
    }
}

/// Tables from `top` descend into tables of `base`; anything else replaces.
fn overlay(base: &mut Table, top: Table) {
    for (key, value) in top {
        if let Value::Table(upper) = value {
            if let Some(Value::Table(lower)) = base.get_mut(&key) {
                overlay(lower, upper);
                continue;
            }
            base.insert(key, Value::Table(upper));
        } else {
            base.insert(key, value);
        }
    }
}

/// `path` and then every file it `extends`, nearest first.
fn extends_chain(path: &Path) -> Result<Vec<Table>> {
    let mut visited = HashSet::<PathBuf>::new();
    let mut layers = Vec::new();
    let mut next = Some(path.to_path_buf());
    while let Some(file) = next.take() {
        let id = file.canonicalize().unwrap_or_else(|_| file.clone());
        if !visited.insert(id) {
            return Err(Error::msg(format!(
                "circular extends: {} is reached twice starting from {}",
                file.display(),
                path.display()
            )));
        }
        let raw = fs::read_to_string(&file)
            .map_err(|e| Error::msg(format!("cannot read settings {}: {e}", file.display())))?;
        let mut layer: Table = toml::from_str(&raw)
            .map_err(|e| Error::msg(format!("bad settings TOML in {}: {e}", file.display())))?;
        if let Some(parent) = layer.remove("extends") {
            let Some(rel) = parent.as_str() else {
                return Err(Error::msg(format!(
                    "{}: extends must be a path string",
                    file.display()
                )));
            };
            // Relative parents resolve against the extending file's directory.
            let dir = file.parent().unwrap_or_else(|| Path::new("."));
            next = Some(dir.join(rel));
        }
        layers.push(layer);
    }
    Ok(layers)
}

fn from_value(value: Value) -> Result<ResumeSettings> {
    let section = value
        .get("resume")
        .cloned()
        .unwrap_or_else(|| Value::Table(Default::default()));
    let settings: ResumeSettings = section
        .try_into()
        .map_err(|e| Error::msg(format!("invalid [resume] settings: {e}")))?;
    settings.validate()?;
    Ok(settings)
}

pub fn parse_str(raw: &str) -> Result<ResumeSettings> {
    let value: Value = toml::from_str(raw)?;
    from_value(value)
}

pub fn load(path: &Path) -> Result<ResumeSettings> {
    let mut merged = Table::new();
    for layer in extends_chain(path)?.into_iter().rev() {
        overlay(&mut merged, layer);
    }
    from_value(Value::Table(merged))
}

/// Load an explicit settings file, else `auto-resume.toml` in the working
/// directory when present, else defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<ResumeSettings> {
    if let Some(p) = path {
        return load(p);
    }
    let local = Path::new(DEFAULT_SETTINGS_FILE);
    if local.is_file() {
        tracing::debug!(path = %local.display(), "loading settings");
        return load(local);
    }
    Ok(ResumeSettings::default())
}
