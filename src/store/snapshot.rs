//! Durable snapshots of an entity table.
//!
//! Each kind is persisted as a single file under the configured data
//! directory: `<data_dir>/<resource>.snapshot`. The payload is a JSON array of
//! rows, optionally zstd-compressed. Writes go to a temporary sibling first and
//! are renamed into place, so a crash mid-write leaves the previous snapshot
//! intact.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::config::StoreConfig;
use crate::entity::EntityKind;

/// First four bytes of every zstd frame.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("snapshot {0} is corrupt: {1}")]
    Corrupt(PathBuf, String),
}

/// A snapshot file for one entity kind.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
    compress: bool,
    zstd_level: i32,
}

impl SnapshotFile {
    pub fn new(data_dir: &Path, kind: EntityKind, compress: bool, zstd_level: i32) -> Self {
        Self {
            path: data_dir.join(format!("{}.snapshot", kind.resource())),
            compress,
            zstd_level,
        }
    }

    /// Snapshot location for `kind` under the configured data directory, if any.
    pub fn for_config(config: &StoreConfig, kind: EntityKind) -> Option<Self> {
        config
            .data_dir
            .as_deref()
            .map(|dir| Self::new(dir, kind, config.compress, config.zstd_level))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize rows into the on-disk representation.
    pub fn encode<'a, E, I>(&self, rows: I) -> Result<Vec<u8>, SnapshotError>
    where
        E: Serialize + 'a,
        I: IntoIterator<Item = &'a E>,
    {
        let rows: Vec<&E> = rows.into_iter().collect();
        let json = serde_json::to_vec(&rows)?;
        if self.compress {
            Ok(zstd::encode_all(json.as_slice(), self.zstd_level)?)
        } else {
            Ok(json)
        }
    }

    /// Decode an on-disk payload, compressed or not.
    pub fn decode<E: DeserializeOwned>(&self, data: &[u8]) -> Result<Vec<E>, SnapshotError> {
        let json = if data.starts_with(&ZSTD_MAGIC) {
            zstd::decode_all(data)
                .map_err(|e| SnapshotError::Corrupt(self.path.clone(), e.to_string()))?
        } else {
            data.to_vec()
        };
        Ok(serde_json::from_slice(&json)?)
    }

    /// Atomically replace the snapshot with `bytes`.
    pub async fn write_bytes(&self, bytes: &[u8]) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("snapshot.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &self.path).await?;

        debug!(
            path = %self.path.display(),
            size = bytes.len(),
            "Wrote snapshot"
        );
        Ok(())
    }

    /// Load all rows. A missing file is an empty table.
    pub async fn load<E: DeserializeOwned>(&self) -> Result<Vec<E>, SnapshotError> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        self.decode(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Post;

    #[tokio::test]
    async fn test_compressed_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path(), EntityKind::Post, true, 3);

        let rows = vec![Post::draft(1, "a"), Post::draft(2, "b")];
        let bytes = file.encode(rows.iter()).unwrap();
        assert!(bytes.starts_with(&ZSTD_MAGIC));

        file.write_bytes(&bytes).await.unwrap();
        let loaded: Vec<Post> = file.load().await.unwrap();
        assert_eq!(loaded, rows);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path(), EntityKind::Event, false, 3);
        let loaded: Vec<crate::entity::Event> = file.load().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_plain_json_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path(), EntityKind::Post, false, 3);
        let bytes = file.encode([Post::draft(5, "x")].iter()).unwrap();
        assert_eq!(bytes[0], b'[');
        let rows: Vec<Post> = file.decode(&bytes).unwrap();
        assert_eq!(rows[0].author_id, 5);
    }
}
