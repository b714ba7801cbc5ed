//! presenca-models — integrity checking for the ONNX model directory.
//!
//! The kiosk ships its models out-of-band; this crate verifies the directory
//! at daemon startup. A `models.json` manifest (file name + SHA-256) sits
//! beside the models; when present every listed file is checksummed, and the
//! three required model files must exist either way. A failure here puts the
//! daemon into manual-only mode — it must never crash the kiosk.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Face detector model file name.
pub const DETECTOR_MODEL: &str = "face_detector.onnx";
/// 68-point landmark regressor file name.
pub const LANDMARK_MODEL: &str = "face_landmark_68.onnx";
/// 128-d recognition net file name.
pub const RECOGNITION_MODEL: &str = "face_recognition_128.onnx";

pub const REQUIRED_MODELS: &[&str] = &[DETECTOR_MODEL, LANDMARK_MODEL, RECOGNITION_MODEL];

/// Manifest file name inside the model directory.
pub const MANIFEST_FILE: &str = "models.json";

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: String, path: PathBuf },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: String,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// One manifest entry: a file expected in the model directory.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelManifest {
    pub files: Vec<ManifestEntry>,
}

/// Default model directory: `$XDG_DATA_HOME/presenca/models` (or the
/// equivalent under `$HOME/.local/share`).
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presenca/models")
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify a single file against an expected checksum.
pub fn verify_file_sha256(
    name: &str,
    path: &Path,
    expected_sha256: &str,
) -> Result<(), ModelIntegrityError> {
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name: name.to_string(),
            path: path.to_path_buf(),
        });
    }

    let digest = sha256_file_hex(path)?;
    if digest != expected_sha256 {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name: name.to_string(),
            path: path.to_path_buf(),
            expected: expected_sha256.to_string(),
            got: digest,
        });
    }

    Ok(())
}

/// Load the manifest from the model directory, if one is present.
pub fn load_manifest(model_dir: &Path) -> Result<Option<ModelManifest>, ModelIntegrityError> {
    let path = model_dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&path).map_err(|source| ModelIntegrityError::Read {
        path: path.clone(),
        source,
    })?;
    let manifest = serde_json::from_str(&contents)
        .map_err(|source| ModelIntegrityError::ManifestParse { path, source })?;
    Ok(Some(manifest))
}

/// Verify the model directory: all required files present, and every
/// manifest entry checksummed when a manifest exists.
pub fn verify_models_dir(model_dir: &Path) -> Result<(), ModelIntegrityError> {
    for name in REQUIRED_MODELS {
        let path = model_dir.join(name);
        if !path.exists() {
            return Err(ModelIntegrityError::MissingModel {
                name: name.to_string(),
                path,
            });
        }
    }

    match load_manifest(model_dir)? {
        Some(manifest) => {
            for entry in &manifest.files {
                verify_file_sha256(&entry.name, &model_dir.join(&entry.name), &entry.sha256)?;
            }
            tracing::info!(
                dir = %model_dir.display(),
                files = manifest.files.len(),
                "model checksums verified"
            );
        }
        None => {
            tracing::warn!(
                dir = %model_dir.display(),
                "no {MANIFEST_FILE} manifest — skipping checksum verification"
            );
        }
    }

    Ok(())
}
