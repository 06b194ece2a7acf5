use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::StagingError;

/// Per-job scratch directory. Removed when dropped; [`Workspace::close`]
/// removes it eagerly and reports cleanup failures.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn create(root: &Path, scoped_id: &str) -> Result<Self, StagingError> {
        std::fs::create_dir_all(root).map_err(|e| StagingError::Workspace {
            path: root.to_path_buf(),
            source: e,
        })?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{}-", path_safe(scoped_id)))
            .tempdir_in(root)
            .map_err(|e| StagingError::Workspace {
                path: root.to_path_buf(),
                source: e,
            })?;

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Creates (if needed) and returns a subdirectory.
    pub fn subdir(&self, name: &str) -> Result<PathBuf, StagingError> {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(&path).map_err(|e| StagingError::Workspace {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }

    pub fn close(self) -> std::io::Result<()> {
        self.dir.close()
    }
}

fn path_safe(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_workspace_is_removed_on_drop() {
        let root = TempDir::new().unwrap();
        let path = {
            let ws = Workspace::create(root.path(), "job-1").unwrap();
            std::fs::write(ws.file("a.bin"), b"data").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_close_removes_directory() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path(), "job/../x").unwrap();
        let path = ws.path().to_path_buf();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("job-job____x-"));
        ws.subdir("audio").unwrap();
        ws.close().unwrap();
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
