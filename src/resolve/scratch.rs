use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Private working directory for one dependency's clone.
///
/// # RAII Cleanup
///
/// The directory is removed on [`Drop`] unless `keep` was requested, so an
/// early return from any resolution step (or a cancelled task) never leaves
/// a clone behind. Not `Clone` for the same reason.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    keep: bool,
}

impl ScratchDir {
    /// Creates a fresh directory under `root`. The name combines the
    /// dependency name, the process id and a process-wide sequence number,
    /// so two dependencies never share a directory even when their names
    /// collide.
    pub fn create(root: &Path, label: &str, keep: bool) -> std::io::Result<Self> {
        let safe_label: String = label
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let path = root.join(format!(
            "{}-{}-{}",
            safe_label,
            std::process::id(),
            SEQUENCE.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path, keep })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the repository itself is cloned.
    pub fn checkout(&self) -> PathBuf {
        self.path.join("repo")
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.keep && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove scratch directory"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directories_are_unique_and_removed() {
        let root = tempfile::tempdir().unwrap();
        let first = ScratchDir::create(root.path(), "zlib", false).unwrap();
        let second = ScratchDir::create(root.path(), "zlib", false).unwrap();

        assert_ne!(first.path(), second.path());
        assert!(first.path().exists());

        let path = first.path().to_path_buf();
        drop(first);
        assert!(!path.exists());
        assert!(second.path().exists());
    }

    #[test]
    fn test_keep_preserves_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = ScratchDir::create(root.path(), "../escape", true).unwrap();
        let path = dir.path().to_path_buf();
        assert!(path.starts_with(root.path()));
        drop(dir);
        assert!(path.exists());
    }
}
