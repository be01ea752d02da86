//! Default `ContextRepository` backed by the workspace directory tree.

use anyhow::Context;
use std::path::{Path, PathBuf};
use stitch_core::{ContextRepository, Result};

/// Gitignore-aware workspace view. Read-only paths are declared as glob
/// patterns over workspace-relative paths.
pub struct WorkspaceRepository {
    root: PathBuf,
    read_only: Vec<glob::Pattern>,
}

impl WorkspaceRepository {
    pub fn new(root: &Path) -> Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            read_only: Vec::new(),
        })
    }

    pub fn with_read_only(mut self, patterns: &[&str]) -> Result<Self> {
        for pattern in patterns {
            self.read_only.push(
                glob::Pattern::new(pattern)
                    .with_context(|| format!("invalid read-only pattern '{pattern}'"))?,
            );
        }
        Ok(self)
    }
}

impl ContextRepository for WorkspaceRepository {
    fn workspace_root(&self) -> &Path {
        &self.root
    }

    fn is_read_only(&self, rel_path: &str) -> bool {
        self.read_only.iter().any(|p| p.matches(rel_path))
    }

    fn editable_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in ignore::WalkBuilder::new(&self.root).build() {
            let entry = entry?;
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .context("walked path outside workspace root")?
                .to_string_lossy()
                .replace('\\', "/");
            if self.is_read_only(&rel) {
                continue;
            }
            files.push(rel);
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn lists_files_relative_and_sorted() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).unwrap();
        fs::write(temp.path().join("src/lib.rs"), "x").unwrap();
        fs::write(temp.path().join("README.md"), "y").unwrap();

        let repo = WorkspaceRepository::new(temp.path()).expect("repo");
        let files = repo.editable_files().expect("walk");
        assert_eq!(files, vec!["README.md", "src/lib.rs"]);
    }

    #[test]
    fn read_only_patterns_match_and_exclude() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("vendor")).unwrap();
        fs::write(temp.path().join("vendor/dep.rs"), "x").unwrap();
        fs::write(temp.path().join("main.rs"), "y").unwrap();

        let repo = WorkspaceRepository::new(temp.path())
            .expect("repo")
            .with_read_only(&["vendor/**"])
            .expect("patterns");
        assert!(repo.is_read_only("vendor/dep.rs"));
        assert!(!repo.is_read_only("main.rs"));
        let files = repo.editable_files().expect("walk");
        assert_eq!(files, vec!["main.rs"]);
    }

    #[test]
    fn hidden_runtime_dir_is_not_listed() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join(".stitch")).unwrap();
        fs::write(temp.path().join(".stitch/agent.log"), "log").unwrap();
        fs::write(temp.path().join("a.txt"), "y").unwrap();

        let repo = WorkspaceRepository::new(temp.path()).expect("repo");
        let files = repo.editable_files().expect("walk");
        assert_eq!(files, vec!["a.txt"]);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = WorkspaceRepository::new(temp.path())
            .expect("repo")
            .with_read_only(&["[unclosed"]);
        assert!(result.is_err());
    }
}
