use super::{bundle_key, build_archive, sha256_hex, validate_bundle_key};
use super::{BundleError, BundleRef, BundleStorage};
use crate::blueprint::RenderedFiles;
use crate::shared::atomic_write_file;
use crate::shared::time::now_utc;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Keeps bundles as `<root>/<run_id>/<timestamp>.tar.gz`. The key's
/// `bundles/` prefix is not repeated on disk.
#[derive(Debug, Clone)]
pub struct FsBundleStorage {
    root: PathBuf,
}

impl FsBundleStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BundleError> {
        validate_bundle_key(key)?;
        let relative = key.strip_prefix("bundles/").unwrap_or(key);
        Ok(self.root.join(relative))
    }
}

impl BundleStorage for FsBundleStorage {
    fn store(&self, run_id: &str, files: &RenderedFiles) -> Result<BundleRef, BundleError> {
        let archive = build_archive(run_id, files)?;
        let stamp = now_utc().format("%Y%m%dT%H%M%S%3f").to_string();
        let key = bundle_key(run_id, &stamp);
        let path = self.path_for(&key)?;
        atomic_write_file(&path, &archive).map_err(|source| BundleError::Write {
            path: path.display().to_string(),
            source,
        })?;
        Ok(BundleRef {
            key,
            digest: sha256_hex(&archive),
        })
    }

    fn url(&self, key: &str) -> Result<String, BundleError> {
        let path = self.path_for(key)?;
        if !path.is_file() {
            return Err(BundleError::NotFound {
                key: key.to_string(),
            });
        }
        Ok(format!("file://{}", path.display()))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, BundleError> {
        let path = self.path_for(key)?;
        fs::read(&path).map_err(|source| {
            if source.kind() == ErrorKind::NotFound {
                BundleError::NotFound {
                    key: key.to_string(),
                }
            } else {
                BundleError::Read {
                    path: path.display().to_string(),
                    source,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::read_archive;
    use tempfile::tempdir;

    #[test]
    fn stored_bundles_can_be_fetched_by_key() {
        let temp = tempdir().expect("tempdir");
        let storage = FsBundleStorage::new(temp.path());
        let mut files = RenderedFiles::new();
        files.insert("main.tf".to_string(), "terraform {}\n".to_string());

        let bundle = storage.store("run-1", &files).expect("store");
        assert!(bundle.key.starts_with("bundles/run-1/"));
        let file_name = bundle.key.rsplit('/').next().expect("file name");
        assert!(temp.path().join("run-1").join(file_name).is_file());
        let bytes = storage.get(&bundle.key).expect("get");
        assert_eq!(sha256_hex(&bytes), bundle.digest);
        assert_eq!(read_archive(&bytes).expect("read"), files);

        let url = storage.url(&bundle.key).expect("url");
        assert!(url.starts_with("file://"));
        assert!(url.ends_with(".tar.gz"));
    }

    #[test]
    fn missing_bundles_report_not_found() {
        let temp = tempdir().expect("tempdir");
        let storage = FsBundleStorage::new(temp.path());
        let key = "bundles/run-9/missing.tar.gz";
        assert!(matches!(storage.get(key), Err(BundleError::NotFound { .. })));
        assert!(matches!(storage.url(key), Err(BundleError::NotFound { .. })));
    }
}
