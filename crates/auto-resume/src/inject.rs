//! Pre-initialization pass: turn `resume=<target>` into concrete overrides
//! before the host configuration system parses the command line.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::args::{self, normalize_key};
use crate::fsview::FileSystem;
use crate::overrides::{MetadataSource, load_overrides};
use crate::remote::RemoteFetcher;
use crate::settings::ResumeSettings;
use crate::target::{ResumeTarget, classify};

const MULTIRUN_FLAGS: [&str; 2] = ["-m", "--multirun"];

/// Ordered overrides to splice into the command line.
///
/// Keys the user already passed always win, and the first injected value
/// for a key wins over later ones, so the host never sees a key twice.
#[derive(Debug, Clone)]
pub struct InjectionPlan {
    args: Vec<String>,
    user_keys: HashSet<String>,
    injected: HashSet<String>,
    resume_key: String,
}

impl InjectionPlan {
    pub fn new(raw_args: &[String], resume_key: &str) -> Self {
        let user_keys = raw_args
            .iter()
            .filter(|a| a.contains('='))
            .map(|a| normalize_key(a).to_string())
            .collect();
        Self {
            args: Vec::new(),
            user_keys,
            injected: HashSet::new(),
            resume_key: resume_key.to_string(),
        }
    }

    /// Queue `token` verbatim unless its key is taken.
    pub fn add(&mut self, token: &str) -> bool {
        let key = normalize_key(token);
        if key == self.resume_key {
            return false;
        }
        if self.user_keys.contains(key) {
            tracing::debug!(key, "keeping user-supplied value");
            return false;
        }
        if !self.injected.insert(key.to_string()) {
            tracing::debug!(key, "already injected");
            return false;
        }
        self.args.push(token.to_string());
        true
    }

    /// Queue a replayed override, rewritten to force-override defaults.
    pub fn add_forced(&mut self, token: &str) -> bool {
        self.add(&args::force(token))
    }

    /// Put a bare flag ahead of every queued argument.
    pub fn prepend_flag(&mut self, flag: &str) {
        if self.injected.insert(flag.to_string()) {
            self.args.insert(0, flag.to_string());
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn into_args(self) -> Vec<String> {
        self.args
    }
}

/// First `resume=<value>` value in the argument list.
pub fn find_resume_value<'a>(raw_args: &'a [String], settings: &ResumeSettings) -> Option<&'a str> {
    let prefix = settings.trigger_prefix();
    raw_args.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
}

pub struct Injector<'a> {
    settings: &'a ResumeSettings,
    fs: &'a dyn FileSystem,
    remote: &'a dyn RemoteFetcher,
}

impl<'a> Injector<'a> {
    pub fn new(
        settings: &'a ResumeSettings,
        fs: &'a dyn FileSystem,
        remote: &'a dyn RemoteFetcher,
    ) -> Self {
        Self {
            settings,
            fs,
            remote,
        }
    }

    /// Rewrite the full process argument list (program name first).
    /// Without a non-empty trigger token the list is returned unchanged.
    pub fn bootstrap(&self, raw_args: &[String]) -> Vec<String> {
        let Some(value) = find_resume_value(raw_args, self.settings).filter(|v| !v.is_empty())
        else {
            return raw_args.to_vec();
        };
        tracing::info!(resume_target = value, "resume requested");
        let target = classify(value, self.fs, self.settings);
        self.inject(raw_args, &target)
    }

    pub fn inject(&self, raw_args: &[String], target: &ResumeTarget) -> Vec<String> {
        let plan = self.plan(raw_args, target);
        splice(raw_args, plan, self.settings)
    }

    pub fn plan(&self, raw_args: &[String], target: &ResumeTarget) -> InjectionPlan {
        let mut plan = InjectionPlan::new(raw_args, &self.settings.resume_arg_name);
        match target {
            ResumeTarget::RemoteId(id) => self.plan_remote(&mut plan, id),
            ResumeTarget::CheckpointFile(path) => self.plan_checkpoint(&mut plan, path),
            ResumeTarget::MultirunDirectory(dir) => self.plan_multirun(&mut plan, raw_args, dir),
            ResumeTarget::RunDirectory(dir) => self.plan_run_dir(&mut plan, dir),
        }
        plan
    }

    fn plan_remote(&self, plan: &mut InjectionPlan, id: &str) {
        tracing::info!(run_id = id, "resuming from remote run");
        for arg in self.remote.download_launch_args(id) {
            plan.add_forced(&arg);
        }
        plan.add(&format!("++{}={id}", self.settings.run_id_key));
    }

    fn plan_checkpoint(&self, plan: &mut InjectionPlan, path: &Path) {
        tracing::info!(path = %path.display(), "resuming from checkpoint file");
        plan.add(&format!(
            "++{}={}",
            self.settings.ckpt_path_key,
            path.display()
        ));
    }

    fn plan_multirun(&self, plan: &mut InjectionPlan, raw_args: &[String], dir: &Path) {
        tracing::info!(dir = %dir.display(), "resuming multirun sweep");
        plan.add(&format!("{}={}", self.settings.sweep_dir_key, dir.display()));
        // Trial subdirectories are only known at run time.
        plan.add(&format!(
            "++{}={}",
            self.settings.ckpt_path_key, self.settings.auto_sentinel
        ));

        if !raw_args.iter().any(|a| MULTIRUN_FLAGS.contains(&a.as_str())) {
            tracing::info!("adding '-m' to re-enter multirun mode");
            plan.prepend_flag(MULTIRUN_FLAGS[0]);
        }

        let doc = MetadataSource::Multirun.path(dir, self.settings);
        for arg in load_overrides(self.fs, &doc) {
            plan.add_forced(&arg);
        }
    }

    fn plan_run_dir(&self, plan: &mut InjectionPlan, dir: &Path) {
        if !self.fs.is_dir(dir) {
            tracing::warn!(path = %dir.display(), "resume target is not a checkpoint file or run directory");
            return;
        }
        tracing::info!(dir = %dir.display(), "resuming run directory in place");
        self.backup_metadata(dir);

        plan.add(&format!("{}={}", self.settings.run_dir_key, dir.display()));

        if let Some(ckpt) = find_local_checkpoint(self.fs, dir, self.settings) {
            plan.add(&format!(
                "++{}={}",
                self.settings.ckpt_path_key,
                ckpt.display()
            ));
        } else {
            tracing::info!(dir = %dir.display(), "no checkpoint found; resuming configuration only");
        }

        let doc = MetadataSource::Run.path(dir, self.settings);
        if self.fs.exists(&doc) {
            for arg in load_overrides(self.fs, &doc) {
                plan.add_forced(&arg);
            }
        }
    }

    /// Copy `<dir>/.hydra` aside before the host overwrites it. Best-effort.
    fn backup_metadata(&self, dir: &Path) {
        let meta = dir.join(&self.settings.metadata_dir);
        if !self.fs.is_dir(&meta) {
            return;
        }
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let backup = dir.join(format!("{}{stamp}", self.settings.backup_prefix()));
        tracing::info!(to = %backup.display(), "backing up previous metadata");
        if let Err(e) = self.fs.copy_dir(&meta, &backup) {
            tracing::warn!("failed to back up {}: {e}", meta.display());
        }
    }
}

/// First of the configured checkpoint names present under
/// `<dir>/<checkpoint_dir>`.
pub fn find_local_checkpoint(
    fs: &dyn FileSystem,
    dir: &Path,
    settings: &ResumeSettings,
) -> Option<PathBuf> {
    let ckpt_dir = dir.join(&settings.checkpoint_dir);
    settings
        .checkpoint_names
        .iter()
        .filter(|n| !n.trim().is_empty())
        .map(|n| ckpt_dir.join(n))
        .find(|p| fs.exists(p))
}

/// Drop every trigger token and insert the plan right after the program name.
fn splice(raw_args: &[String], plan: InjectionPlan, settings: &ResumeSettings) -> Vec<String> {
    let prefix = settings.trigger_prefix();
    let clean: Vec<String> = raw_args
        .iter()
        .filter(|a| !a.starts_with(prefix.as_str()))
        .cloned()
        .collect();
    if plan.is_empty() {
        return clean;
    }
    tracing::info!(args = ?plan.args(), "injecting arguments");
    let mut clean = clean.into_iter();
    let mut out = Vec::with_capacity(raw_args.len() + plan.len());
    out.extend(clean.next());
    out.extend(plan.into_args());
    out.extend(clean);
    out
}
