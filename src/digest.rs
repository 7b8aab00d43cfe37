//! Incremental digesters for download verification.
//!
//! Supports MD5, SHA-256 and CRC32 (IEEE) over byte streams. Digest strings
//! are lowercase hexadecimal; comparisons are case-insensitive.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::error::{DownloadError, Result};

/// Buffer size for streaming file digests (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    /// 128-bit MD5.
    Md5,
    /// 32-bit CRC (IEEE polynomial).
    Crc32,
    /// 256-bit SHA-2.
    Sha256,
}

impl HashType {
    /// Length in hex characters of a digest of this type.
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Crc32 => 8,
            Self::Sha256 => 64,
        }
    }
}

/// Incremental digester over a byte stream.
pub enum Digester {
    Md5(Md5),
    Sha256(Sha256),
    Crc32(crc32fast::Hasher),
}

impl Digester {
    /// Create a digester for the given algorithm.
    pub fn new(hash_type: HashType) -> Self {
        match hash_type {
            HashType::Md5 => Self::Md5(Md5::new()),
            HashType::Sha256 => Self::Sha256(Sha256::new()),
            HashType::Crc32 => Self::Crc32(crc32fast::Hasher::new()),
        }
    }

    /// Feed bytes into the digest.
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Md5(h) => h.update(bytes),
            Self::Sha256(h) => h.update(bytes),
            Self::Crc32(h) => h.update(bytes),
        }
    }

    /// Consume the digester and produce the lowercase hex digest.
    pub fn finalize(self) -> String {
        match self {
            Self::Md5(h) => format!("{:x}", h.finalize()),
            Self::Sha256(h) => format!("{:x}", h.finalize()),
            Self::Crc32(h) => format!("{:08x}", h.finalize()),
        }
    }
}

/// Stream a file through a digester and return the lowercase hex digest.
pub fn digest_file(path: &Path, hash_type: HashType) -> Result<String> {
    let mut file = File::open(path).map_err(|e| DownloadError::CalculateHash {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut digester = Digester::new(hash_type);
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| DownloadError::CalculateHash {
                path: path.to_path_buf(),
                source: e,
            })?;

        if bytes_read == 0 {
            break;
        }

        digester.update(&buffer[..bytes_read]);
    }

    Ok(digester.finalize())
}

/// Case-insensitive hexadecimal digest comparison.
pub fn digests_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.chars().zip(b.chars()).all(|(x, y)| x.eq_ignore_ascii_case(&y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_known_value() {
        let mut digester = Digester::new(HashType::Sha256);
        digester.update(b"hello world");
        assert_eq!(
            digester.finalize(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_md5_known_value() {
        let mut digester = Digester::new(HashType::Md5);
        digester.update(b"hello world");
        assert_eq!(digester.finalize(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_crc32_known_value() {
        let mut digester = Digester::new(HashType::Crc32);
        digester.update(b"hello world");
        // CRC-32 (IEEE) of "hello world"
        assert_eq!(digester.finalize(), "0d4a1185");
    }

    #[test]
    fn test_incremental_update_matches_single_shot() {
        let mut split = Digester::new(HashType::Sha256);
        split.update(b"hello ");
        split.update(b"world");

        let mut whole = Digester::new(HashType::Sha256);
        whole.update(b"hello world");

        assert_eq!(split.finalize(), whole.finalize());
    }

    #[test]
    fn test_digest_file() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("test.txt");

        let mut file = File::create(&file_path).unwrap();
        file.write_all(b"hello world").unwrap();

        let digest = digest_file(&file_path, HashType::Sha256).unwrap();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_digest_empty_file() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("empty.bin");
        File::create(&file_path).unwrap();

        let digest = digest_file(&file_path, HashType::Sha256).unwrap();
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_digest_nonexistent_file() {
        let result = digest_file(Path::new("/nonexistent/file.bin"), HashType::Md5);
        assert!(result.is_err());
    }

    #[test]
    fn test_digests_match_case_insensitive() {
        assert!(digests_match("ABCDEF01", "abcdef01"));
        assert!(!digests_match("abcdef01", "abcdef02"));
        assert!(!digests_match("abc", "abcd"));
    }

    #[test]
    fn test_hex_len() {
        assert_eq!(HashType::Md5.hex_len(), 32);
        assert_eq!(HashType::Crc32.hex_len(), 8);
        assert_eq!(HashType::Sha256.hex_len(), 64);
    }
}
