use std::fmt;
use std::path::{Path, PathBuf};

use crate::fsview::FileSystem;
use crate::settings::ResumeSettings;

/// What a `resume=<value>` token points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeTarget {
    /// Identifier of a run in the remote tracking service.
    RemoteId(String),
    CheckpointFile(PathBuf),
    RunDirectory(PathBuf),
    /// Sweep root containing the multirun marker file.
    MultirunDirectory(PathBuf),
}

impl ResumeTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            ResumeTarget::RemoteId(_) => "remote_id",
            ResumeTarget::CheckpointFile(_) => "checkpoint_file",
            ResumeTarget::RunDirectory(_) => "run_directory",
            ResumeTarget::MultirunDirectory(_) => "multirun_directory",
        }
    }

    pub fn value(&self) -> String {
        match self {
            ResumeTarget::RemoteId(id) => id.clone(),
            ResumeTarget::CheckpointFile(p)
            | ResumeTarget::RunDirectory(p)
            | ResumeTarget::MultirunDirectory(p) => p.display().to_string(),
        }
    }
}

impl fmt::Display for ResumeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.value())
    }
}

fn looks_like_identity(target: &str, len: usize) -> bool {
    target.chars().count() == len && target.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Classify a resume target.
///
/// Existing paths always win over the identifier heuristic. A string that
/// neither exists nor looks like an identifier is reported as a run
/// directory; the injector rejects it when it finds no such directory.
pub fn classify(target: &str, fs: &dyn FileSystem, settings: &ResumeSettings) -> ResumeTarget {
    let raw = Path::new(target);
    if !fs.exists(raw) {
        if looks_like_identity(target, settings.identity_len) {
            return ResumeTarget::RemoteId(target.to_string());
        }
        return ResumeTarget::RunDirectory(raw.to_path_buf());
    }

    let path = fs.canonicalize(raw).unwrap_or_else(|| raw.to_path_buf());
    if fs.is_file(&path) && path.to_string_lossy().ends_with(&settings.checkpoint_ext) {
        return ResumeTarget::CheckpointFile(path);
    }
    if fs.is_dir(&path) && fs.is_file(&path.join(&settings.multirun_marker)) {
        return ResumeTarget::MultirunDirectory(path);
    }
    ResumeTarget::RunDirectory(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsview::mem::MemFs;

    fn settings() -> ResumeSettings {
        ResumeSettings::default()
    }

    #[test]
    fn eight_char_token_without_path_is_remote_id() {
        let fs = MemFs::new();
        assert_eq!(
            classify("ab12cd34", &fs, &settings()),
            ResumeTarget::RemoteId("ab12cd34".into())
        );
    }

    #[test]
    fn existing_path_beats_identity_heuristic() {
        let fs = MemFs::new().dir("ab12cd34");
        assert_eq!(
            classify("ab12cd34", &fs, &settings()),
            ResumeTarget::RunDirectory(PathBuf::from("ab12cd34"))
        );
    }

    #[test]
    fn checkpoint_file_by_extension() {
        let fs = MemFs::new().file("/runs/x/model.ckpt", "weights");
        assert_eq!(
            classify("/runs/x/model.ckpt", &fs, &settings()),
            ResumeTarget::CheckpointFile(PathBuf::from("/runs/x/model.ckpt"))
        );
    }

    #[test]
    fn other_files_fall_back_to_run_directory() {
        let fs = MemFs::new().file("/runs/x/notes.txt", "");
        assert_eq!(
            classify("/runs/x/notes.txt", &fs, &settings()).kind(),
            "run_directory"
        );
    }

    #[test]
    fn marker_file_makes_multirun_directory() {
        let fs = MemFs::new()
            .file("/multirun/2024-01-01/multirun.yaml", "hydra: {}")
            .dir("/runs/single");
        assert_eq!(
            classify("/multirun/2024-01-01", &fs, &settings()),
            ResumeTarget::MultirunDirectory(PathBuf::from("/multirun/2024-01-01"))
        );
        assert_eq!(
            classify("/runs/single", &fs, &settings()),
            ResumeTarget::RunDirectory(PathBuf::from("/runs/single"))
        );
    }

    #[test]
    fn symlinked_target_resolves_to_real_path() {
        let fs = MemFs::new()
            .file("/store/best.ckpt", "w")
            .link("/runs/best.ckpt", "/store/best.ckpt");
        assert_eq!(
            classify("/runs/best.ckpt", &fs, &settings()),
            ResumeTarget::CheckpointFile(PathBuf::from("/store/best.ckpt"))
        );
    }

    #[test]
    fn missing_non_identity_strings_are_run_directories() {
        let fs = MemFs::new();
        for raw in ["/no/such/dir", "short", "ab-12-cd"] {
            let t = classify(raw, &fs, &settings());
            assert_eq!(t, ResumeTarget::RunDirectory(PathBuf::from(raw)), "{raw}");
        }
    }

    #[test]
    fn classification_is_stable_across_calls() {
        let fs = MemFs::new().file("/runs/x/last.ckpt", "");
        let s = settings();
        for raw in ["/runs/x/last.ckpt", "/runs/x", "zz99yy88", "nope"] {
            assert_eq!(classify(raw, &fs, &s), classify(raw, &fs, &s));
        }
    }
}
