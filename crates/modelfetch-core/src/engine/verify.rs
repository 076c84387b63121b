//! Streaming digest of files on disk

use crate::error::FetchError;
use modelfetch_types::{ExpectedHash, HashAlgorithm};
use sha2::{Digest, Sha256, Sha512};
use std::path::Path;
use tokio::io::AsyncReadExt;

const READ_BUFFER: usize = 1024 * 1024;

/// Hex digest of the file at `path`
pub async fn file_digest(path: &Path, algorithm: HashAlgorithm) -> Result<String, FetchError> {
    match algorithm {
        HashAlgorithm::Sha256 => digest_with::<Sha256>(path).await,
        HashAlgorithm::Sha512 => digest_with::<Sha512>(path).await,
    }
}

async fn digest_with<D: Digest>(path: &Path) -> Result<String, FetchError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = D::new();
    let mut buffer = vec![0u8; READ_BUFFER];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Check a file against its expected digest
pub async fn verify_file(path: &Path, expected: &ExpectedHash) -> Result<(), FetchError> {
    let actual = file_digest(path, expected.algorithm).await?;
    if expected.matches(&actual) {
        Ok(())
    } else {
        Err(FetchError::HashMismatch {
            expected: expected.digest.clone(),
            actual,
        })
    }
}
