use std::path::{Path, PathBuf};

use crate::fsview::{DirInfo, FileSystem};
use crate::settings::ResumeSettings;

/// Map a file or checkpoint subdirectory back to the run root.
fn run_root(fs: &dyn FileSystem, dir: &Path, checkpoint_dir: &str) -> PathBuf {
    let mut root = dir.to_path_buf();
    if fs.is_file(&root)
        && let Some(parent) = root.parent()
    {
        root = parent.to_path_buf();
    }
    if root.file_name().is_some_and(|n| n == checkpoint_dir)
        && let Some(parent) = root.parent()
    {
        root = parent.to_path_buf();
    }
    root
}

fn newest(mut candidates: Vec<DirInfo>) -> Option<DirInfo> {
    candidates.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    candidates.pop()
}

/// Tracker run directories are named `run-<YYYYmmdd_HHMMSS>-<id>`.
fn identity_from_name(name: &str) -> Option<String> {
    name.rsplit('-')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

/// Recover the remote run identifier previously assigned to the run living
/// in `dir` from the tracker's local directory.
pub fn recover_identity(
    fs: &dyn FileSystem,
    dir: &Path,
    settings: &ResumeSettings,
) -> Option<String> {
    let root = run_root(fs, dir, &settings.checkpoint_dir);
    let tracker = root.join(&settings.tracker_dir);
    if !fs.is_dir(&tracker) {
        tracing::debug!(dir = %tracker.display(), "no tracker directory");
        return None;
    }

    let latest = tracker.join(&settings.tracker_latest);
    let run_dir = match fs.canonicalize(&latest) {
        Some(target) => target,
        None => {
            let candidates = match fs.list_dirs(&tracker) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("cannot scan {}: {e}", tracker.display());
                    return None;
                }
            };
            let candidates = candidates
                .into_iter()
                .filter(|d| d.name() != settings.tracker_latest)
                .collect();
            newest(candidates)?.path
        }
    };

    let name = run_dir.file_name()?.to_string_lossy().into_owned();
    let id = identity_from_name(&name)?;
    tracing::info!(run = %run_dir.display(), id = %id, "recovered run identity");
    Some(id)
}
