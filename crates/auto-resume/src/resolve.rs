//! In-process pass: decide the checkpoint and run identity once the host
//! configuration exists.
//!
//! The decision is a fixed priority chain:
//!
//! 1. local crash recovery (under the scheduler, or `ckpt_path=AUTO`)
//! 2. checkpoint path / run id declared in the configuration
//! 3. download from the tracking service when only a run id is known

use std::fmt;
use std::path::{Path, PathBuf};

use serde_yaml::Value;

use crate::args;
use crate::config::HostConfig;
use crate::fsview::FileSystem;
use crate::identity::recover_identity;
use crate::inject::find_local_checkpoint;
use crate::remote::RemoteFetcher;
use crate::settings::ResumeSettings;

/// Read access to the process environment.
pub trait Environment {
    fn var_present(&self, name: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn var_present(&self, name: &str) -> bool {
        std::env::var_os(name).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointSource {
    /// Restart after preemption found a checkpoint in the output directory.
    LocalRecovery,
    /// `AUTO` deferred the choice and a local checkpoint was found.
    ExplicitAuto,
    /// Taken from the configuration as given.
    Declared,
    Downloaded,
}

impl CheckpointSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointSource::LocalRecovery => "local_recovery",
            CheckpointSource::ExplicitAuto => "explicit_auto",
            CheckpointSource::Declared => "declared",
            CheckpointSource::Downloaded => "downloaded",
        }
    }
}

impl fmt::Display for CheckpointSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub path: PathBuf,
    pub source: CheckpointSource,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub checkpoint: Option<CheckpointRecord>,
    pub run_id: Option<String>,
    /// Full configuration of the previous run, only set on local recovery.
    pub saved_config: Option<HostConfig>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.checkpoint.is_none() && self.run_id.is_none() && self.saved_config.is_none()
    }

    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.checkpoint.as_ref().map(|c| c.path.as_path())
    }

    /// Merge into `cfg`: saved snapshot first, then checkpoint path and run
    /// id. Every path addressed by `runtime_overrides` keeps the value `cfg`
    /// had composed for it before the snapshot went in.
    pub fn apply(
        &self,
        cfg: &mut HostConfig,
        runtime_overrides: &[String],
        settings: &ResumeSettings,
    ) {
        if let Some(saved) = &self.saved_config {
            let paths: Vec<String> = runtime_overrides
                .iter()
                .filter_map(|t| args::config_path(t))
                .collect();
            let pinned = cfg.capture(&paths);
            cfg.merge(saved);
            cfg.restore(pinned);
        }
        if let Some(ckpt) = &self.checkpoint {
            let path = ckpt.path.display().to_string();
            tracing::info!(key = %settings.ckpt_path_key, value = %path, "setting checkpoint path");
            cfg.set(&settings.ckpt_path_key, Value::String(path));
        }
        if let Some(id) = &self.run_id {
            tracing::info!(key = %settings.run_id_key, value = %id, "setting run id");
            cfg.set(&settings.run_id_key, Value::String(id.clone()));
        }
    }
}

enum Stage {
    CrashRecovery,
    DeclaredIntent,
    RemoteDownload { run_id: String },
    Done(Resolution),
}

pub struct Resolver<'a> {
    settings: &'a ResumeSettings,
    fs: &'a dyn FileSystem,
    env: &'a dyn Environment,
    remote: &'a dyn RemoteFetcher,
}

impl<'a> Resolver<'a> {
    pub fn new(
        settings: &'a ResumeSettings,
        fs: &'a dyn FileSystem,
        env: &'a dyn Environment,
        remote: &'a dyn RemoteFetcher,
    ) -> Self {
        Self {
            settings,
            fs,
            env,
            remote,
        }
    }

    pub fn resolve(&self, cfg: &HostConfig) -> Resolution {
        let Some(output_dir) = cfg
            .get_str(&self.settings.output_dir_key)
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
        else {
            tracing::warn!(
                key = %self.settings.output_dir_key,
                "could not determine output directory; skipping resume resolution"
            );
            return Resolution::default();
        };

        let mut stage = Stage::CrashRecovery;
        loop {
            stage = match stage {
                Stage::CrashRecovery => self.crash_recovery(cfg, &output_dir),
                Stage::DeclaredIntent => self.declared_intent(cfg),
                Stage::RemoteDownload { run_id } => self.remote_download(&output_dir, run_id),
                Stage::Done(resolution) => return resolution,
            };
        }
    }

    fn declared(&self, cfg: &HostConfig, key: &str) -> Option<String> {
        cfg.get_str(key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn crash_recovery(&self, cfg: &HostConfig, output_dir: &Path) -> Stage {
        let under_scheduler = self.env.var_present(&self.settings.scheduler_env_var);
        let deferred = self
            .declared(cfg, &self.settings.ckpt_path_key)
            .is_some_and(|v| v == self.settings.auto_sentinel);
        if !under_scheduler && !deferred {
            return Stage::DeclaredIntent;
        }

        let Some(path) = find_local_checkpoint(self.fs, output_dir, self.settings) else {
            return Stage::DeclaredIntent;
        };
        let source = if under_scheduler {
            tracing::info!(path = %path.display(), "found checkpoint in output dir; assuming restart after preemption");
            CheckpointSource::LocalRecovery
        } else {
            tracing::info!(path = %path.display(), "resolved deferred checkpoint");
            CheckpointSource::ExplicitAuto
        };

        Stage::Done(Resolution {
            checkpoint: Some(CheckpointRecord { path, source }),
            run_id: recover_identity(self.fs, output_dir, self.settings),
            saved_config: self.load_saved_config(output_dir),
        })
    }

    fn declared_intent(&self, cfg: &HostConfig) -> Stage {
        let ckpt = self
            .declared(cfg, &self.settings.ckpt_path_key)
            .filter(|v| {
                let deferred = *v == self.settings.auto_sentinel;
                if deferred {
                    tracing::info!("checkpoint deferred but none found locally; treating as unset");
                }
                !deferred
            })
            .map(PathBuf::from);
        let run_id = self.declared(cfg, &self.settings.run_id_key);

        match (ckpt, run_id) {
            (None, Some(run_id)) => Stage::RemoteDownload { run_id },
            (ckpt, run_id) => Stage::Done(Resolution {
                checkpoint: ckpt.map(|path| CheckpointRecord {
                    path,
                    source: CheckpointSource::Declared,
                }),
                run_id,
                saved_config: None,
            }),
        }
    }

    fn remote_download(&self, output_dir: &Path, run_id: String) -> Stage {
        let target = output_dir.join(&self.settings.checkpoint_dir);
        tracing::info!(run_id = %run_id, "run id given without checkpoint; downloading");
        let checkpoint = match self.remote.download_artifact(&run_id, &target) {
            Some(path) => {
                tracing::info!(path = %path.display(), "downloaded checkpoint");
                Some(CheckpointRecord {
                    path,
                    source: CheckpointSource::Downloaded,
                })
            }
            None => {
                tracing::warn!(run_id = %run_id, "could not download checkpoint; continuing without one");
                None
            }
        };
        Stage::Done(Resolution {
            checkpoint,
            run_id: Some(run_id),
            saved_config: None,
        })
    }

    /// Newest `<metadata_dir>.old_*` backup holding a readable snapshot.
    fn load_saved_config(&self, output_dir: &Path) -> Option<HostConfig> {
        let prefix = self.settings.backup_prefix();
        let mut backups = match self.fs.list_dirs(output_dir) {
            Ok(dirs) => dirs
                .into_iter()
                .filter(|d| d.name().starts_with(&prefix))
                .collect::<Vec<_>>(),
            Err(e) => {
                tracing::warn!("cannot scan {} for saved configs: {e}", output_dir.display());
                return None;
            }
        };
        backups.sort_by_key(|d| d.name());

        for backup in backups.iter().rev() {
            let path = backup.path.join(&self.settings.saved_config_file);
            if !self.fs.is_file(&path) {
                continue;
            }
            let parsed = self
                .fs
                .read_to_string(&path)
                .and_then(|raw| HostConfig::parse(&raw));
            match parsed {
                Ok(cfg) => {
                    tracing::info!(path = %path.display(), "loaded saved configuration");
                    return Some(cfg);
                }
                Err(e) => tracing::warn!("skipping saved configuration {}: {e}", path.display()),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsview::mem::MemFs;
    use crate::remote::OfflineFetcher;
    use std::cell::RefCell;

    struct FakeEnv(bool);

    impl Environment for FakeEnv {
        fn var_present(&self, _name: &str) -> bool {
            self.0
        }
    }

    #[derive(Default)]
    struct FakeRemote {
        artifact: Option<PathBuf>,
        calls: RefCell<Vec<(String, PathBuf)>>,
    }

    impl RemoteFetcher for FakeRemote {
        fn download_artifact(&self, run_id: &str, target_dir: &Path) -> Option<PathBuf> {
            self.calls
                .borrow_mut()
                .push((run_id.to_string(), target_dir.to_path_buf()));
            self.artifact.clone()
        }

        fn download_launch_args(&self, _run_id: &str) -> Vec<String> {
            Vec::new()
        }
    }

    fn cfg(extra: &str) -> HostConfig {
        HostConfig::parse(&format!(
            "hydra:\n  runtime:\n    output_dir: /out/run\n{extra}"
        ))
        .expect("yaml")
    }

    fn resolve_with(fs: &MemFs, scheduler: bool, remote: &dyn RemoteFetcher, c: &HostConfig) -> Resolution {
        let settings = ResumeSettings::default();
        Resolver::new(&settings, fs, &FakeEnv(scheduler), remote).resolve(c)
    }

    #[test]
    fn missing_output_dir_yields_empty_resolution() {
        let fs = MemFs::new();
        let c = HostConfig::parse("ckpt_path: /x.ckpt\nwandb_id: abc\n").expect("yaml");
        assert!(resolve_with(&fs, true, &OfflineFetcher, &c).is_empty());
    }

    #[test]
    fn local_recovery_beats_declared_checkpoint() {
        let fs = MemFs::new()
            .file("/out/run/checkpoints/hpc_ckpt.ckpt", "")
            .dir("/out/run/wandb/run-20240101_000000-rec12345");
        let c = cfg("ckpt_path: /declared/best.ckpt\nwandb_id: decl0000\n");
        let r = resolve_with(&fs, true, &OfflineFetcher, &c);
        assert_eq!(
            r.checkpoint,
            Some(CheckpointRecord {
                path: PathBuf::from("/out/run/checkpoints/hpc_ckpt.ckpt"),
                source: CheckpointSource::LocalRecovery,
            })
        );
        assert_eq!(r.run_id.as_deref(), Some("rec12345"));
    }

    #[test]
    fn local_checkpoint_ignored_outside_scheduler() {
        let fs = MemFs::new().file("/out/run/checkpoints/last.ckpt", "");
        let c = cfg("ckpt_path: /declared/best.ckpt\n");
        let r = resolve_with(&fs, false, &OfflineFetcher, &c);
        assert_eq!(r.checkpoint_path(), Some(Path::new("/declared/best.ckpt")));
        assert_eq!(r.checkpoint.map(|c| c.source), Some(CheckpointSource::Declared));
    }

    #[test]
    fn auto_sentinel_resolves_locally_without_scheduler() {
        let fs = MemFs::new().file("/out/run/checkpoints/last.ckpt", "");
        let r = resolve_with(&fs, false, &OfflineFetcher, &cfg("ckpt_path: AUTO\n"));
        let ckpt = r.checkpoint.expect("checkpoint");
        assert_eq!(ckpt.path, PathBuf::from("/out/run/checkpoints/last.ckpt"));
        assert_eq!(ckpt.source, CheckpointSource::ExplicitAuto);
    }

    #[test]
    fn unresolved_auto_is_treated_as_absent() {
        let fs = MemFs::new().dir("/out/run");
        let r = resolve_with(&fs, false, &OfflineFetcher, &cfg("ckpt_path: AUTO\n"));
        assert!(r.is_empty());
    }

    #[test]
    fn run_id_without_checkpoint_downloads() {
        let fs = MemFs::new().dir("/out/run");
        let remote = FakeRemote {
            artifact: Some(PathBuf::from("/out/run/checkpoints/wandb.ckpt")),
            ..FakeRemote::default()
        };
        let r = resolve_with(&fs, false, &remote, &cfg("wandb_id: ab12cd34\n"));
        assert_eq!(
            r.checkpoint,
            Some(CheckpointRecord {
                path: PathBuf::from("/out/run/checkpoints/wandb.ckpt"),
                source: CheckpointSource::Downloaded,
            })
        );
        assert_eq!(r.run_id.as_deref(), Some("ab12cd34"));
        assert_eq!(
            *remote.calls.borrow(),
            vec![("ab12cd34".to_string(), PathBuf::from("/out/run/checkpoints"))]
        );
    }

    #[test]
    fn failed_download_keeps_run_id() {
        let fs = MemFs::new().dir("/out/run");
        let remote = FakeRemote::default();
        let r = resolve_with(&fs, false, &remote, &cfg("wandb_id: ab12cd34\nckpt_path: AUTO\n"));
        assert!(r.checkpoint.is_none());
        assert_eq!(r.run_id.as_deref(), Some("ab12cd34"));
        assert_eq!(remote.calls.borrow().len(), 1);
    }

    #[test]
    fn declared_pair_is_returned_without_network() {
        let fs = MemFs::new().dir("/out/run");
        let remote = FakeRemote::default();
        let r = resolve_with(
            &fs,
            false,
            &remote,
            &cfg("wandb_id: ab12cd34\nckpt_path: /w/x.ckpt\n"),
        );
        assert_eq!(r.checkpoint_path(), Some(Path::new("/w/x.ckpt")));
        assert_eq!(r.run_id.as_deref(), Some("ab12cd34"));
        assert!(remote.calls.borrow().is_empty());
    }

    #[test]
    fn numeric_run_id_read_as_string() {
        let fs = MemFs::new().dir("/out/run");
        let r = resolve_with(&fs, false, &FakeRemote::default(), &cfg("wandb_id: 12345678\n"));
        assert_eq!(r.run_id.as_deref(), Some("12345678"));
    }

    #[test]
    fn recovery_loads_newest_readable_snapshot() {
        let fs = MemFs::new()
            .file("/out/run/checkpoints/last.ckpt", "")
            .file("/out/run/.hydra.old_20240101_000000/config.yaml", "lr: 0.1\n")
            .file("/out/run/.hydra.old_20240301_000000/config.yaml", "lr: 0.3\n")
            .file("/out/run/.hydra.old_20240501_000000/config.yaml", "- broken\n");
        let r = resolve_with(&fs, true, &OfflineFetcher, &cfg(""));
        let saved = r.saved_config.expect("snapshot");
        assert_eq!(saved.get_str("lr").as_deref(), Some("0.3"));
    }

    #[test]
    fn apply_gives_runtime_overrides_final_say() {
        let settings = ResumeSettings::default();
        let resolution = Resolution {
            checkpoint: Some(CheckpointRecord {
                path: PathBuf::from("/out/run/checkpoints/last.ckpt"),
                source: CheckpointSource::LocalRecovery,
            }),
            run_id: Some("00001111".into()),
            saved_config: Some(
                HostConfig::parse("lr: 0.1\nbatch: 64\nckpt_path: AUTO\n").expect("yaml"),
            ),
        };
        let mut c = cfg("lr: 0.5\n");
        resolution.apply(&mut c, &["lr=0.5".to_string()], &settings);
        assert_eq!(c.get_str("lr").as_deref(), Some("0.5"));
        assert_eq!(c.get_str("batch").as_deref(), Some("64"));
        assert_eq!(
            c.get_str("ckpt_path").as_deref(),
            Some("/out/run/checkpoints/last.ckpt")
        );
        assert_eq!(c.get("wandb_id"), Some(&Value::String("00001111".into())));
    }

    #[test]
    fn apply_keeps_composed_groups_for_overridden_keys() {
        let settings = ResumeSettings::default();
        let resolution = Resolution {
            saved_config: Some(
                HostConfig::parse(
                    "model:\n  width: 128\ndata:\n  aug:\n    kind: weak\ndropout: 0.1\nbatch: 64\n",
                )
                .expect("yaml"),
            ),
            ..Resolution::default()
        };
        let mut c = cfg("model:\n  name: resnet\n  width: 64\ndata:\n  aug:\n    kind: strong\n");
        let overrides: Vec<String> = ["model=resnet", "data/aug=strong", "~dropout", "-m"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        resolution.apply(&mut c, &overrides, &settings);

        assert_eq!(c.get_str("model.name").as_deref(), Some("resnet"));
        assert_eq!(c.get_str("model.width").as_deref(), Some("64"));
        assert_eq!(c.get_str("data.aug.kind").as_deref(), Some("strong"));
        assert!(c.get("data/aug").is_none());
        assert!(c.get("dropout").is_none());
        assert_eq!(c.get_str("batch").as_deref(), Some("64"));
    }

    #[test]
    fn apply_leaves_unresolved_keys_alone() {
        let settings = ResumeSettings::default();
        let mut c = cfg("wandb_id: keepme00\n");
        Resolution::default().apply(&mut c, &[], &settings);
        assert_eq!(c.get_str("wandb_id").as_deref(), Some("keepme00"));
    }
}
