use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Content-derived identity of a file.
///
/// Validity is decided by the SHA-256 content hash and size only. The
/// modification time is recorded for diagnostics but ignored by
/// [`Fingerprint::matches`], so a fresh checkout of unchanged files still
/// hits the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub hash: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
}

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self {
            hash: format!("{:x}", digest),
            size: bytes.len() as u64,
            modified: None,
        }
    }

    pub fn compute(path: &Path) -> io::Result<Self> {
        let bytes = fs::read(path)?;
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        Ok(Self {
            modified,
            ..Self::of_bytes(&bytes)
        })
    }

    pub fn matches(&self, other: &Fingerprint) -> bool {
        self.hash == other.hash && self.size == other.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_matches_regardless_of_mtime() {
        let a = Fingerprint {
            modified: Some(1),
            ..Fingerprint::of_bytes(b"print('hi')")
        };
        let b = Fingerprint {
            modified: Some(99),
            ..Fingerprint::of_bytes(b"print('hi')")
        };
        assert!(a.matches(&b));
    }

    #[test]
    fn content_change_breaks_match() {
        let a = Fingerprint::of_bytes(b"v1");
        let b = Fingerprint::of_bytes(b"v2");
        assert!(!a.matches(&b));
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn compute_reads_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.py");
        fs::write(&path, "x = 1\n").unwrap();
        let fp = Fingerprint::compute(&path).unwrap();
        assert!(fp.matches(&Fingerprint::of_bytes(b"x = 1\n")));
        assert_eq!(fp.size, 6);
        assert!(fp.modified.is_some());
    }
}
