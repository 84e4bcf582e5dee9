use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirInfo {
    pub path: PathBuf,
    pub modified: Option<SystemTime>,
}

impl DirInfo {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Everything the resume passes need to know about the filesystem.
pub trait FileSystem {
    fn exists(&self, path: &Path) -> bool;
    fn is_file(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    fn read_to_string(&self, path: &Path) -> Result<String>;
    /// Child directories of `path` (symlinks followed).
    fn list_dirs(&self, path: &Path) -> Result<Vec<DirInfo>>;
    /// Absolute path with links resolved; `None` if it does not resolve.
    fn canonicalize(&self, path: &Path) -> Option<PathBuf>;
    fn copy_dir(&self, src: &Path, dst: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl FileSystem for LocalFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))
    }

    fn list_dirs(&self, path: &Path) -> Result<Vec<DirInfo>> {
        let rd = fs::read_dir(path)
            .map_err(|e| Error::msg(format!("failed to list {}: {e}", path.display())))?;
        let mut out = Vec::new();
        for entry in rd {
            let entry = entry
                .map_err(|e| Error::msg(format!("failed to list {}: {e}", path.display())))?;
            let p = entry.path();
            let Ok(meta) = fs::metadata(&p) else {
                continue;
            };
            if meta.is_dir() {
                out.push(DirInfo {
                    path: p,
                    modified: meta.modified().ok(),
                });
            }
        }
        Ok(out)
    }

    fn canonicalize(&self, path: &Path) -> Option<PathBuf> {
        fs::canonicalize(path).ok()
    }

    fn copy_dir(&self, src: &Path, dst: &Path) -> Result<()> {
        copy_tree(src, dst)
    }
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    use std::os::unix::fs::symlink;
    let target = fs::read_link(src)
        .map_err(|e| Error::msg(format!("failed to read symlink {}: {e}", src.display())))?;
    symlink(&target, dst).map_err(|e| {
        Error::msg(format!(
            "failed to create symlink {} -> {}: {e}",
            dst.display(),
            target.display()
        ))
    })
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst)
        .map(|_| ())
        .map_err(|e| Error::msg(format!("failed to copy {}: {e}", src.display())))
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(Error::msg(format!("not a directory: {}", src.display())));
    }
    if dst.exists() {
        return Err(Error::msg(format!(
            "refusing to overwrite existing {}",
            dst.display()
        )));
    }
    fs::create_dir_all(dst)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", dst.display())))?;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let p = entry.path();
        let rel = p
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&out)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", out.display())))?;
        } else if entry.file_type().is_symlink() {
            copy_symlink(p, &out)?;
        } else {
            fs::copy(p, &out).map_err(|e| {
                Error::msg(format!(
                    "failed to copy {} -> {}: {e}",
                    p.display(),
                    out.display()
                ))
            })?;
        }
    }
    Ok(())
}
