use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::StoreError;

use super::{validate_key, ObjectStore};

/// Stores artifacts as files under a volume root. Writes go to a sibling
/// temp file first and are renamed into place.
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _mime: &str) -> Result<String, StoreError> {
        let path = self.path_for(key)?;
        let write_error = |source| StoreError::Write {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_error)?;
        }
        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        tokio::fs::write(&partial, &bytes).await.map_err(write_error)?;
        if let Err(e) = tokio::fs::rename(&partial, &path).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(write_error(e));
        }
        Ok(path.to_string_lossy().into_owned())
    }

    async fn public_url(&self, key: &str) -> Result<String, StoreError> {
        Ok(self.path_for(key)?.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_overwrites_same_key() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemStore::new(dir.path());

        let first = store.put("p/job/a.mp4", b"one".to_vec(), "video/mp4").await.unwrap();
        let second = store.put("p/job/a.mp4", b"two".to_vec(), "video/mp4").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(&second).unwrap(), b"two");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("p/job"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemStore::new(dir.path());
        let err = store
            .put("../outside.mp4", b"x".to_vec(), "video/mp4")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }
}
