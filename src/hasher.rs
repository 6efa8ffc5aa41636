//! Content fingerprints for save files.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

/// Length of the fingerprint prefix used in names and log lines
pub const SHORT_FINGERPRINT_LEN: usize = 6;

/// Compute the SHA-256 fingerprint of a file as lowercase hex.
///
/// The file is streamed, not loaded whole. Fails if the file cannot be opened
/// or read, which usually means the game is still writing it.
pub fn fingerprint(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint of an in-memory buffer
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// First few characters of a fingerprint
pub fn short_fingerprint(fingerprint: &str) -> &str {
    let end = fingerprint
        .char_indices()
        .nth(SHORT_FINGERPRINT_LEN)
        .map(|(i, _)| i)
        .unwrap_or(fingerprint.len());
    &fingerprint[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_fingerprint_matches_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"AA").unwrap();
        file.flush().unwrap();

        let fp = fingerprint(file.path()).unwrap();
        assert_eq!(fp, fingerprint_bytes(b"AA"));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            fingerprint_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_different_content_different_fingerprint() {
        assert_ne!(fingerprint_bytes(b"AA"), fingerprint_bytes(b"BB"));
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(fingerprint(&dir.path().join("nope.sav")).is_err());
    }

    #[test]
    fn test_short_fingerprint() {
        assert_eq!(short_fingerprint("0123456789abcdef"), "012345");
        assert_eq!(short_fingerprint("abc"), "abc");
    }
}
