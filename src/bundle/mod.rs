use crate::blueprint::RenderedFiles;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;

pub mod fs;
pub mod memory;

pub use fs::FsBundleStorage;
pub use memory::MemoryBundleStorage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRef {
    pub key: String,
    /// Hex SHA-256 of the archive bytes.
    pub digest: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("deployment bundle `{key}` not found")]
    NotFound { key: String },
    #[error("bundle key `{key}` is invalid")]
    InvalidKey { key: String },
    #[error("bundle for run `{run_id}` has no files")]
    Empty { run_id: String },
    #[error("failed to write bundle {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read bundle {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build bundle archive: {source}")]
    Archive {
        #[source]
        source: std::io::Error,
    },
    #[error("bundle storage state is poisoned")]
    Poisoned,
}

/// Where rendered bundles live between build and plan.
pub trait BundleStorage: Send + Sync {
    fn store(&self, run_id: &str, files: &RenderedFiles) -> Result<BundleRef, BundleError>;

    fn url(&self, key: &str) -> Result<String, BundleError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, BundleError>;
}

pub fn bundle_key(run_id: &str, stamp: &str) -> String {
    format!("bundles/{run_id}/{stamp}.tar.gz")
}

pub fn validate_bundle_key(key: &str) -> Result<(), BundleError> {
    let valid = key.starts_with("bundles/")
        && key.ends_with(".tar.gz")
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if valid {
        Ok(())
    } else {
        Err(BundleError::InvalidKey {
            key: key.to_string(),
        })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Packs files into a gzipped tar with fixed metadata, so identical inputs
/// produce identical archives and digests.
pub fn build_archive(run_id: &str, files: &RenderedFiles) -> Result<Vec<u8>, BundleError> {
    if files.is_empty() {
        return Err(BundleError::Empty {
            run_id: run_id.to_string(),
        });
    }
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .map_err(|source| BundleError::Archive { source })?;
    }
    let encoder = builder
        .into_inner()
        .map_err(|source| BundleError::Archive { source })?;
    encoder
        .finish()
        .map_err(|source| BundleError::Archive { source })
}

pub fn read_archive(bytes: &[u8]) -> Result<RenderedFiles, BundleError> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut files = RenderedFiles::new();
    let entries = archive
        .entries()
        .map_err(|source| BundleError::Archive { source })?;
    for entry in entries {
        let mut entry = entry.map_err(|source| BundleError::Archive { source })?;
        let name = entry
            .path()
            .map_err(|source| BundleError::Archive { source })?
            .to_string_lossy()
            .into_owned();
        let mut content = String::new();
        entry
            .read_to_string(&mut content)
            .map_err(|source| BundleError::Archive { source })?;
        files.insert(name, content);
    }
    Ok(files)
}
