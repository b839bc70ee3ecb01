//! Drift detection between the controller's bundle and the copy a node holds.
//!
//! Nodes report the SHA-256 of their dependency manifest and client entry point as lowercase
//! hex. The controller hashes its own copies and compares the strings exactly.

use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::bundle::{Bundle, CLIENT_APP, MANIFEST};

/// Digests reported by a node for the two verified files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedChecksums {
    pub pyproject_checksum: String,
    pub client_app_checksum: String,
}

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("checksum mismatch for {}", .0.join(", "))]
    Mismatch(Vec<&'static str>),
    #[error("cannot digest reference file {}: {source}", .path.display())]
    Unreadable { path: PathBuf, source: io::Error },
}

/// Hex-encoded SHA-256 of the file at `path`.
pub fn digest_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn reference_digest(path: PathBuf) -> Result<String, IntegrityError> {
    digest_file(&path).map_err(|source| IntegrityError::Unreadable { path, source })
}

/// Compares the node-reported digests with the controller's copies of the bundle files.
pub fn verify(bundle: &Bundle, reported: &ReportedChecksums) -> Result<(), IntegrityError> {
    let manifest = reference_digest(bundle.manifest())?;
    let client_app = reference_digest(bundle.client_app())?;

    let mut mismatched = Vec::new();
    if manifest != reported.pyproject_checksum {
        mismatched.push(MANIFEST);
    }
    if client_app != reported.client_app_checksum {
        mismatched.push(CLIENT_APP);
    }
    if mismatched.is_empty() {
        Ok(())
    } else {
        Err(IntegrityError::Mismatch(mismatched))
    }
}
