use super::{bundle_key, build_archive, sha256_hex};
use super::{BundleError, BundleRef, BundleStorage};
use crate::blueprint::RenderedFiles;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryBundleStorage {
    bundles: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBundleStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BundleStorage for MemoryBundleStorage {
    fn store(&self, run_id: &str, files: &RenderedFiles) -> Result<BundleRef, BundleError> {
        let archive = build_archive(run_id, files)?;
        let mut bundles = self.bundles.lock().map_err(|_| BundleError::Poisoned)?;
        let key = bundle_key(run_id, &format!("{:06}", bundles.len() + 1));
        let digest = sha256_hex(&archive);
        bundles.insert(key.clone(), archive);
        Ok(BundleRef { key, digest })
    }

    fn url(&self, key: &str) -> Result<String, BundleError> {
        let bundles = self.bundles.lock().map_err(|_| BundleError::Poisoned)?;
        if bundles.contains_key(key) {
            Ok(format!("memory://{key}"))
        } else {
            Err(BundleError::NotFound {
                key: key.to_string(),
            })
        }
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, BundleError> {
        let bundles = self.bundles.lock().map_err(|_| BundleError::Poisoned)?;
        bundles
            .get(key)
            .cloned()
            .ok_or_else(|| BundleError::NotFound {
                key: key.to_string(),
            })
    }
}
