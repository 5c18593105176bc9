use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use thumbsup_core::hw::BlobStore;
use thumbsup_core::{ErrorKind, TuError, TuResult};

/// Blob store backed by one file per key in a directory.
/// Writes go through a temporary file and a rename so a crash never leaves
/// a half written blob behind.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    pub fn open(dir: impl AsRef<Path>) -> TuResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            TuError::new_with_cause(&format!("creating blob directory {}", dir.display()), e)
        })?;
        Ok(FileBlobStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> TuResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(TuError::new(
                ErrorKind::InvalidParam,
                format!("invalid blob key '{key}'"),
            ));
        }
        Ok(self.dir.join(format!("{key}.blob")))
    }
}

impl BlobStore for FileBlobStore {
    fn load(&self, key: &str) -> TuResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(TuError::new_with_cause(
                &format!("reading {}", path.display()),
                e,
            )
            .with_kind(ErrorKind::HardwareFault)),
        }
    }

    fn store(&mut self, key: &str, blob: &[u8]) -> TuResult<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("blob.tmp");
        fs::write(&tmp, blob)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| {
                TuError::new_with_cause(&format!("writing {}", path.display()), e)
                    .with_kind(ErrorKind::HardwareFault)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_key_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileBlobStore::open(dir.path()).unwrap();
        assert_eq!(store.load("trim").unwrap(), None);
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let mut store = FileBlobStore::open(dir.path().join("nested")).unwrap();
        store.store("trim", &[1, 2, 3]).unwrap();
        store.store("trim", &[4, 5]).unwrap();
        assert_eq!(store.load("trim").unwrap(), Some(vec![4, 5]));
        assert!(!dir.path().join("nested").join("trim.blob.tmp").exists());

        let reopened = FileBlobStore::open(dir.path().join("nested")).unwrap();
        assert_eq!(reopened.load("trim").unwrap(), Some(vec![4, 5]));
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let dir = TempDir::new().unwrap();
        let mut store = FileBlobStore::open(dir.path()).unwrap();
        let err = store.store("../escape", &[0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParam);
        assert!(store.load("").is_err());
    }
}
