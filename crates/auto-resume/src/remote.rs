use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::settings::{RemoteSettings, ResumeSettings};

/// Narrow view of the remote run-tracking service.
///
/// Both calls are best-effort: any access failure is logged and reported as
/// absent/empty.
pub trait RemoteFetcher {
    /// Download the run's checkpoint artifact into `target_dir`.
    fn download_artifact(&self, run_id: &str, target_dir: &Path) -> Option<PathBuf>;
    /// Command-line overrides the run was originally launched with.
    fn download_launch_args(&self, run_id: &str) -> Vec<String>;
}

/// Used when no service endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineFetcher;

impl RemoteFetcher for OfflineFetcher {
    fn download_artifact(&self, run_id: &str, _target_dir: &Path) -> Option<PathBuf> {
        tracing::warn!(run_id, "no remote endpoint configured; cannot download checkpoint");
        None
    }

    fn download_launch_args(&self, run_id: &str) -> Vec<String> {
        tracing::warn!(run_id, "no remote endpoint configured; cannot fetch launch args");
        Vec::new()
    }
}

#[derive(Debug, Deserialize)]
struct RunMetadata {
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ArtifactEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    files: Vec<String>,
}

/// Client for the tracking service's REST API:
///
/// - `GET {base}/{project}/runs/{id}/files/wandb-metadata.json`
/// - `GET {base}/{project}/runs/{id}/artifacts`
/// - `GET {base}/{project}/artifacts/{name}/files/{file}`
pub struct HttpFetcher {
    base: reqwest::Url,
    project: String,
    token: Option<String>,
    artifact_type: String,
    artifact_alias: String,
    pattern: glob::Pattern,
    target_filename: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(base_url: &str, remote: &RemoteSettings) -> Result<Self> {
        let raw = base_url.trim().trim_end_matches('/');
        if raw.is_empty() {
            return Err(Error::msg("remote base_url is empty"));
        }
        let base = reqwest::Url::parse(raw)
            .map_err(|e| Error::msg(format!("invalid remote base_url '{raw}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::msg(format!("remote base_url '{raw}' cannot take a path")));
        }
        let pattern = glob::Pattern::new(&remote.ckpt_pattern).map_err(|e| {
            Error::msg(format!(
                "invalid resume.remote.ckpt_pattern '{}': {e}",
                remote.ckpt_pattern
            ))
        })?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(remote.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        let target_filename = Some(remote.target_filename.trim())
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned);
        Ok(Self {
            base,
            project: remote.project_name(),
            token: remote.resolved_token(),
            artifact_type: remote.artifact_type.clone(),
            artifact_alias: remote.artifact_alias.clone(),
            pattern,
            target_filename,
            client,
        })
    }

    /// `{base}/{project}/<segments...>`, each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::msg(format!("remote base_url '{}' cannot take a path", self.base)))?
            .pop_if_empty()
            .push(&self.project)
            .extend(segments);
        Ok(url)
    }

    fn get_bytes(&self, url: reqwest::Url) -> Result<Option<Vec<u8>>> {
        let mut req = self.client.get(url.clone());
        if let Some(t) = self.token.as_deref() {
            req = req.bearer_auth(t);
        }
        let res = req
            .send()
            .map_err(|e| Error::msg(format!("HTTP request to {url} failed: {e}")))?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "HTTP request to {url} failed with status {}",
                res.status()
            )));
        }
        let bytes = res
            .bytes()
            .map_err(|e| Error::msg(format!("HTTP body read failed: {e}")))?;
        Ok(Some(bytes.to_vec()))
    }

    fn launch_args(&self, run_id: &str) -> Result<Vec<String>> {
        let url = self.url(&["runs", run_id, "files", "wandb-metadata.json"])?;
        let Some(body) = self.get_bytes(url)? else {
            return Err(Error::msg(format!("run {}/{run_id} has no metadata", self.project)));
        };
        let meta: RunMetadata = serde_json::from_slice(&body)?;
        Ok(meta.args)
    }

    fn select_artifact(&self, artifacts: Vec<ArtifactEntry>) -> Option<ArtifactEntry> {
        let matching: Vec<ArtifactEntry> = artifacts
            .into_iter()
            .filter(|a| a.kind == self.artifact_type)
            .collect();
        matching
            .iter()
            .find(|a| a.aliases.iter().any(|al| *al == self.artifact_alias))
            .cloned()
            .or_else(|| matching.last().cloned())
    }

    fn fetch_artifact(&self, run_id: &str, target_dir: &Path) -> Result<Option<PathBuf>> {
        let url = self.url(&["runs", run_id, "artifacts"])?;
        let Some(body) = self.get_bytes(url)? else {
            return Err(Error::msg(format!("run {}/{run_id} not found", self.project)));
        };
        let artifacts: Vec<ArtifactEntry> = serde_json::from_slice(&body)?;
        let Some(artifact) = self.select_artifact(artifacts) else {
            tracing::warn!(
                run_id,
                artifact_type = %self.artifact_type,
                "run has no artifact of the requested type"
            );
            return Ok(None);
        };

        fs::create_dir_all(target_dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", target_dir.display())))?;

        let mut checkpoint = None;
        for file in &artifact.files {
            validate_rel_like_path(file)?;
            let mut segments = vec!["artifacts", artifact.name.as_str(), "files"];
            segments.extend(file.split('/').filter(|s| !s.is_empty()));
            let url = self.url(&segments)?;
            let Some(bytes) = self.get_bytes(url)? else {
                return Err(Error::msg(format!(
                    "artifact '{}' lists '{file}' but it is missing",
                    artifact.name
                )));
            };
            let out = target_dir.join(file);
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
            }
            fs::write(&out, bytes)
                .map_err(|e| Error::msg(format!("failed to write {}: {e}", out.display())))?;
            if checkpoint.is_none() && self.pattern.matches(file) {
                checkpoint = Some(out);
            }
        }

        let Some(found) = checkpoint else {
            tracing::warn!(
                artifact = %artifact.name,
                pattern = %self.pattern,
                "artifact contains no checkpoint file"
            );
            return Ok(None);
        };
        match self.target_filename.as_deref() {
            Some(name) => {
                let renamed = target_dir.join(name);
                fs::rename(&found, &renamed).map_err(|e| {
                    Error::msg(format!(
                        "failed to rename {} -> {}: {e}",
                        found.display(),
                        renamed.display()
                    ))
                })?;
                Ok(Some(renamed))
            }
            None => Ok(Some(found)),
        }
    }
}

impl RemoteFetcher for HttpFetcher {
    fn download_artifact(&self, run_id: &str, target_dir: &Path) -> Option<PathBuf> {
        match self.fetch_artifact(run_id, target_dir) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(run_id, "checkpoint download failed: {e}");
                None
            }
        }
    }

    fn download_launch_args(&self, run_id: &str) -> Vec<String> {
        match self.launch_args(run_id) {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!(run_id, "could not fetch launch args: {e}");
                Vec::new()
            }
        }
    }
}

fn validate_rel_like_path(p: &str) -> Result<()> {
    let path = Path::new(p.trim());
    if p.trim().is_empty() || path.is_absolute() {
        return Err(Error::msg(format!("invalid artifact file path '{p}'")));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::msg(format!("artifact file path '{p}' contains '..'")));
    }
    Ok(())
}

/// HTTP client when an endpoint is configured, otherwise the offline stub.
pub fn from_settings(settings: &ResumeSettings) -> Result<Box<dyn RemoteFetcher>> {
    match settings.remote.resolved_base_url() {
        Some(base) => Ok(Box::new(HttpFetcher::new(&base, &settings.remote)?)),
        None => Ok(Box::new(OfflineFetcher)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(alias: &str) -> HttpFetcher {
        let remote = RemoteSettings {
            project: Some("proj".into()),
            artifact_alias: alias.into(),
            ..RemoteSettings::default()
        };
        HttpFetcher::new("http://127.0.0.1:9/api/", &remote).expect("fetcher")
    }

    fn artifact(name: &str, kind: &str, aliases: &[&str]) -> ArtifactEntry {
        ArtifactEntry {
            name: name.into(),
            kind: kind.into(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            files: vec![],
        }
    }

    #[test]
    fn urls_join_base_and_project() {
        let f = fetcher("latest");
        assert_eq!(
            f.url(&["runs", "x", "artifacts"]).expect("url").as_str(),
            "http://127.0.0.1:9/api/proj/runs/x/artifacts"
        );
    }

    #[test]
    fn url_segments_are_percent_encoded() {
        let f = fetcher("latest");
        assert_eq!(
            f.url(&["artifacts", "model:v1", "files", "epoch#3 best?.ckpt"])
                .expect("url")
                .as_str(),
            "http://127.0.0.1:9/api/proj/artifacts/model:v1/files/epoch%233%20best%3F.ckpt"
        );
    }

    #[test]
    fn base_url_must_parse() {
        assert!(HttpFetcher::new("not a url", &RemoteSettings::default()).is_err());
    }

    #[test]
    fn alias_match_preferred() {
        let f = fetcher("best");
        let picked = f
            .select_artifact(vec![
                artifact("model-a:v0", "model", &["best"]),
                artifact("model-a:v1", "model", &["latest"]),
                artifact("data:v0", "dataset", &["best"]),
            ])
            .expect("artifact");
        assert_eq!(picked.name, "model-a:v0");
    }

    #[test]
    fn falls_back_to_last_of_type() {
        let f = fetcher("best");
        let picked = f
            .select_artifact(vec![
                artifact("model-a:v0", "model", &[]),
                artifact("model-a:v1", "model", &["latest"]),
                artifact("data:v0", "dataset", &[]),
            ])
            .expect("artifact");
        assert_eq!(picked.name, "model-a:v1");
        assert!(f.select_artifact(vec![artifact("d", "dataset", &[])]).is_none());
    }

    #[test]
    fn rejects_escaping_artifact_paths() {
        assert!(validate_rel_like_path("model.ckpt").is_ok());
        assert!(validate_rel_like_path("sub/model.ckpt").is_ok());
        assert!(validate_rel_like_path("../model.ckpt").is_err());
        assert!(validate_rel_like_path("/etc/passwd").is_err());
    }

    #[test]
    fn invalid_glob_rejected() {
        let remote = RemoteSettings {
            ckpt_pattern: "[".into(),
            ..RemoteSettings::default()
        };
        assert!(HttpFetcher::new("http://x", &remote).is_err());
    }

    #[test]
    fn unreachable_service_degrades_to_empty() {
        let f = fetcher("latest");
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(f.download_launch_args("ab12cd34").is_empty());
        assert!(f.download_artifact("ab12cd34", tmp.path()).is_none());
    }
}
