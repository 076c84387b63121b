//! Post-download security scanning hook

use crate::error::FetchError;
use async_trait::async_trait;
use modelfetch_types::ScanVerdict;
use std::path::Path;

/// Inspects a finished file before it is reported as completed
#[async_trait]
pub trait SecurityScanner: Send + Sync {
    async fn scan(&self, path: &Path) -> Result<ScanVerdict, FetchError>;
}

/// Flags files whose extension can carry executable payloads
///
/// Pickle-based checkpoints can run arbitrary code when loaded, so they are
/// reported as suspicious. Everything else is considered safe.
#[derive(Debug, Clone)]
pub struct ExtensionScanner {
    suspicious: Vec<String>,
    blocked: Vec<String>,
}

impl Default for ExtensionScanner {
    fn default() -> Self {
        Self {
            suspicious: vec!["ckpt".into(), "pt".into(), "pth".into(), "pkl".into(), "bin".into()],
            blocked: vec!["exe".into(), "bat".into(), "cmd".into(), "scr".into()],
        }
    }
}

impl ExtensionScanner {
    pub fn new(suspicious: Vec<String>, blocked: Vec<String>) -> Self {
        Self { suspicious, blocked }
    }
}

#[async_trait]
impl SecurityScanner for ExtensionScanner {
    async fn scan(&self, path: &Path) -> Result<ScanVerdict, FetchError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        if self.blocked.iter().any(|b| *b == ext) {
            Ok(ScanVerdict::Malicious)
        } else if self.suspicious.iter().any(|s| *s == ext) {
            Ok(ScanVerdict::Suspicious)
        } else {
            Ok(ScanVerdict::Safe)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_extension_verdicts() {
        let scanner = ExtensionScanner::default();
        assert_eq!(
            scanner.scan(Path::new("model.safetensors")).await.unwrap(),
            ScanVerdict::Safe
        );
        assert_eq!(
            scanner.scan(Path::new("model.CKPT")).await.unwrap(),
            ScanVerdict::Suspicious
        );
        assert_eq!(
            scanner.scan(Path::new("setup.exe")).await.unwrap(),
            ScanVerdict::Malicious
        );
    }
}
