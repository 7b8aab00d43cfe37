//! Sidecar index persistence for crash-safe resumption.
//!
//! The index file sits next to the temporary data file and records which
//! byte ranges are already durable. Every write is atomic: the record is
//! serialized to a swap file, fsynced and renamed over the previous index,
//! so a crash can never leave a torn index behind.
//!
//! ## Binary format
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ Header (12 bytes)                                          │
//! ├──────────────────┬────────────────────────────────────────┤
//! │ magic: [u8; 4]   │ "DPIX"                                 │
//! │ version: u32     │ Format version, currently 1            │
//! │ checksum: u32    │ CRC32 of everything after the header   │
//! ├──────────────────┴────────────────────────────────────────┤
//! │ origin_url: u32 len + utf-8 bytes                          │
//! │ effective_url: u32 len + utf-8 bytes                       │
//! │ total_size: i64 (-1 = unknown)                             │
//! │ created_at: i64 unix ms                                    │
//! │ updated_at: i64 unix ms                                    │
//! │ slice_policy: u8, policy_value: i64                        │
//! │ slice_count: u32                                           │
//! │ slices: (begin i64, end i64 (-1 = open), downloaded i64)…  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian.

use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crc32fast::Hasher;

use crate::error::{DownloadError, Result};

/// Magic bytes identifying an index file: "DPIX".
pub const INDEX_MAGIC: [u8; 4] = *b"DPIX";

/// Current index format version.
pub const INDEX_VERSION: u32 = 1;

/// Size of the index header in bytes.
const INDEX_HEADER_SIZE: usize = 12;

/// Persisted progress of one slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRecord {
    /// First byte of the slice.
    pub begin: i64,
    /// One past the last byte, or -1 for an open-ended slice.
    pub end: i64,
    /// Bytes already durable in the data file.
    pub downloaded: i64,
}

/// The full persisted index record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub version: u32,
    pub origin_url: String,
    pub effective_url: String,
    /// Total resource length, or -1 when unknown.
    pub total_size: i64,
    /// Creation time, unix milliseconds.
    pub created_at: i64,
    /// Last update time, unix milliseconds.
    pub updated_at: i64,
    /// Wire encoding of the slice policy (see [`SlicePolicy`]).
    ///
    /// [`SlicePolicy`]: crate::config::SlicePolicy
    pub slice_policy: u8,
    pub policy_value: i64,
    pub slices: Vec<SliceRecord>,
}

impl IndexRecord {
    /// Serialize the record to bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut content = Vec::new();
        write_string(&mut content, &self.origin_url);
        write_string(&mut content, &self.effective_url);
        content.extend_from_slice(&self.total_size.to_le_bytes());
        content.extend_from_slice(&self.created_at.to_le_bytes());
        content.extend_from_slice(&self.updated_at.to_le_bytes());
        content.push(self.slice_policy);
        content.extend_from_slice(&self.policy_value.to_le_bytes());
        content.extend_from_slice(&(self.slices.len() as u32).to_le_bytes());
        for slice in &self.slices {
            content.extend_from_slice(&slice.begin.to_le_bytes());
            content.extend_from_slice(&slice.end.to_le_bytes());
            content.extend_from_slice(&slice.downloaded.to_le_bytes());
        }

        let checksum = {
            let mut hasher = Hasher::new();
            hasher.update(&content);
            hasher.finalize()
        };

        let mut result = Vec::with_capacity(INDEX_HEADER_SIZE + content.len());
        result.extend_from_slice(&INDEX_MAGIC);
        result.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        result.extend_from_slice(&checksum.to_le_bytes());
        result.extend(content);
        result
    }

    /// Deserialize a record, validating magic, version and checksum.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < INDEX_HEADER_SIZE {
            return Err(DownloadError::InvalidIndexFormat(format!(
                "data too short: {} bytes",
                data.len()
            )));
        }

        if data[0..4] != INDEX_MAGIC {
            return Err(DownloadError::InvalidIndexFormat(format!(
                "invalid magic: {:?}",
                &data[0..4]
            )));
        }

        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if version != INDEX_VERSION {
            return Err(DownloadError::InvalidIndexFormat(format!(
                "unsupported version {version}"
            )));
        }

        let stored_checksum = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let content = &data[INDEX_HEADER_SIZE..];
        let computed_checksum = {
            let mut hasher = Hasher::new();
            hasher.update(content);
            hasher.finalize()
        };
        if stored_checksum != computed_checksum {
            return Err(DownloadError::InvalidIndexFormat(format!(
                "checksum mismatch: stored={stored_checksum:#x}, computed={computed_checksum:#x}"
            )));
        }

        let mut cursor = Cursor::new(content);
        let origin_url = read_string(&mut cursor)?;
        let effective_url = read_string(&mut cursor)?;
        let total_size = read_i64(&mut cursor)?;
        let created_at = read_i64(&mut cursor)?;
        let updated_at = read_i64(&mut cursor)?;
        let slice_policy = read_u8(&mut cursor)?;
        let policy_value = read_i64(&mut cursor)?;
        let slice_count = read_u32(&mut cursor)?;

        let mut slices = Vec::with_capacity(slice_count as usize);
        for _ in 0..slice_count {
            let begin = read_i64(&mut cursor)?;
            let end = read_i64(&mut cursor)?;
            let downloaded = read_i64(&mut cursor)?;
            if begin < 0 || downloaded < 0 || (end >= 0 && begin + downloaded > end) {
                return Err(DownloadError::InvalidIndexFormat(format!(
                    "inconsistent slice record [{begin}, {end}) downloaded={downloaded}"
                )));
            }
            slices.push(SliceRecord {
                begin,
                end,
                downloaded,
            });
        }

        Ok(Self {
            version,
            origin_url,
            effective_url,
            total_size,
            created_at,
            updated_at,
            slice_policy,
            policy_value,
            slices,
        })
    }

    /// Whether the record is older than the given expiry age.
    pub fn is_expired(&self, expiry: Duration, now_ms: i64) -> bool {
        let age_ms = now_ms.saturating_sub(self.created_at);
        age_ms >= 0 && age_ms as u128 > expiry.as_millis()
    }

    /// Whether the record describes the given request URL (origin or
    /// effective form).
    pub fn matches_url(&self, url: &str) -> bool {
        self.origin_url == url || self.effective_url == url
    }
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_exact(cursor, &mut buf)?;
    Ok(buf[0])
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(cursor, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i64(cursor: &mut Cursor<&[u8]>) -> Result<i64> {
    let mut buf = [0u8; 8];
    read_exact(cursor, &mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_exact(cursor: &mut Cursor<&[u8]>, buf: &mut [u8]) -> Result<()> {
    cursor
        .read_exact(buf)
        .map_err(|_| DownloadError::InvalidIndexFormat("truncated record".to_string()))
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = read_u32(cursor)? as usize;
    let mut bytes = vec![0u8; len];
    read_exact(cursor, &mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| DownloadError::InvalidIndexFormat("non-utf8 url".to_string()))
}

/// Reads and atomically rewrites the index file.
#[derive(Debug)]
pub struct IndexStore {
    path: PathBuf,
    swap_path: PathBuf,
}

impl IndexStore {
    /// Create a store for the index at `path`.
    pub fn new(path: PathBuf) -> Self {
        let mut swap_os = path.clone().into_os_string();
        swap_os.push(".swap");
        Self {
            path,
            swap_path: PathBuf::from(swap_os),
        }
    }

    /// Path of the index file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an index file currently exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the persisted record.
    ///
    /// Returns `Ok(None)` when no index file exists. Decode failures are
    /// reported as [`DownloadError::InvalidIndexFormat`]; I/O failures as
    /// [`DownloadError::OpenIndexFile`].
    pub fn load(&self) -> Result<Option<IndexRecord>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DownloadError::OpenIndexFile {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| DownloadError::OpenIndexFile {
                path: self.path.clone(),
                source: e,
            })?;

        IndexRecord::deserialize(&data).map(Some)
    }

    /// Atomically persist the record: write to a swap file, fsync, rename.
    pub fn write(&self, record: &IndexRecord) -> Result<()> {
        let data = record.serialize();

        let io_err = |e| DownloadError::UpdateIndexFile {
            path: self.path.clone(),
            source: e,
        };

        let mut swap = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.swap_path)
            .map_err(io_err)?;
        swap.write_all(&data).map_err(io_err)?;
        swap.sync_all().map_err(io_err)?;
        drop(swap);

        fs::rename(&self.swap_path, &self.path).map_err(io_err)
    }

    /// Delete the index file (and any stale swap file). Missing files are
    /// not an error.
    pub fn remove(&self) -> Result<()> {
        let _ = fs::remove_file(&self.swap_path);
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::UpdateIndexFile {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_record() -> IndexRecord {
        IndexRecord {
            version: INDEX_VERSION,
            origin_url: "http://example.com/file.bin".to_string(),
            effective_url: "http://cdn.example.com/file.bin".to_string(),
            total_size: 1_000_000,
            created_at: 1_700_000_000_000,
            updated_at: 1_700_000_100_000,
            slice_policy: 1,
            policy_value: 250_000,
            slices: vec![
                SliceRecord {
                    begin: 0,
                    end: 250_000,
                    downloaded: 250_000,
                },
                SliceRecord {
                    begin: 250_000,
                    end: 500_000,
                    downloaded: 100_000,
                },
                SliceRecord {
                    begin: 500_000,
                    end: 1_000_000,
                    downloaded: 0,
                },
            ],
        }
    }

    #[test]
    fn test_serialize_round_trip() {
        let record = sample_record();
        let decoded = IndexRecord::deserialize(&record.serialize()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_open_ended_slice_round_trip() {
        let mut record = sample_record();
        record.total_size = -1;
        record.slices = vec![SliceRecord {
            begin: 0,
            end: -1,
            downloaded: 4096,
        }];
        let decoded = IndexRecord::deserialize(&record.serialize()).unwrap();
        assert_eq!(decoded.slices[0].end, -1);
        assert_eq!(decoded.total_size, -1);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut data = sample_record().serialize();
        data[0] = b'X';
        assert!(matches!(
            IndexRecord::deserialize(&data),
            Err(DownloadError::InvalidIndexFormat(_))
        ));
    }

    #[test]
    fn test_corrupt_body_rejected_by_checksum() {
        let mut data = sample_record().serialize();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert!(matches!(
            IndexRecord::deserialize(&data),
            Err(DownloadError::InvalidIndexFormat(_))
        ));
    }

    #[test]
    fn test_truncated_data_rejected() {
        let data = sample_record().serialize();
        assert!(IndexRecord::deserialize(&data[..data.len() / 2]).is_err());
        assert!(IndexRecord::deserialize(&data[..4]).is_err());
    }

    #[test]
    fn test_inconsistent_slice_rejected() {
        let mut record = sample_record();
        record.slices[0].downloaded = record.slices[0].end + 1;
        let data = record.serialize();
        assert!(matches!(
            IndexRecord::deserialize(&data),
            Err(DownloadError::InvalidIndexFormat(_))
        ));
    }

    #[test]
    fn test_store_write_and_load() {
        let temp = TempDir::new().unwrap();
        let store = IndexStore::new(temp.path().join("file.idx"));

        assert!(store.load().unwrap().is_none());

        let record = sample_record();
        store.write(&record).unwrap();
        assert!(store.exists());

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_store_rewrite_replaces_record() {
        let temp = TempDir::new().unwrap();
        let store = IndexStore::new(temp.path().join("file.idx"));

        let mut record = sample_record();
        store.write(&record).unwrap();

        record.slices[1].downloaded = 200_000;
        record.updated_at += 1000;
        store.write(&record).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.slices[1].downloaded, 200_000);
    }

    #[test]
    fn test_store_remove() {
        let temp = TempDir::new().unwrap();
        let store = IndexStore::new(temp.path().join("file.idx"));

        store.write(&sample_record()).unwrap();
        store.remove().unwrap();
        assert!(!store.exists());

        // Removing again is not an error.
        store.remove().unwrap();
    }

    #[test]
    fn test_expiry() {
        let record = sample_record();
        let hour = Duration::from_secs(3600);
        let created = record.created_at;

        assert!(!record.is_expired(hour, created + 1000));
        assert!(record.is_expired(hour, created + 2 * 3600 * 1000));
    }

    #[test]
    fn test_matches_url() {
        let record = sample_record();
        assert!(record.matches_url("http://example.com/file.bin"));
        assert!(record.matches_url("http://cdn.example.com/file.bin"));
        assert!(!record.matches_url("http://other.com/file.bin"));
    }
}
