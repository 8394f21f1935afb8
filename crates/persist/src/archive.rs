//! File-backed export of entity histories.
//!
//! Layout inside the archive directory:
//! ```text
//! archive.meta.json           - metadata and schema version
//! histories/
//!   000001.history.cbor.zst   - CBOR+zstd compressed audit log of one entity
//! integrity/
//!   manifest.json             - hash chain manifest
//! ```
//! Segments are append-only: re-exporting an entity writes a new segment and
//! loading returns the newest one.

use crate::error::StoreError;
use retrace_common::EntityKey;
use retrace_kernel::VersionRecord;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const ARCHIVE_SCHEMA_VERSION: u32 = 1;

/// Metadata stored in archive.meta.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMeta {
    pub archive_schema_version: u32,
    pub segment_count: u32,
}

/// A single entry in the integrity manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub entity: EntityKey,
    pub record_count: usize,
    pub sha256: String,
    pub prev_hash: Option<String>,
}

/// Integrity manifest tracking all segment hashes in a chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistorySegment {
    entity: EntityKey,
    records: Vec<VersionRecord>,
}

/// Directory of exported audit logs with a verifiable hash chain.
pub struct HistoryArchive {
    root: PathBuf,
    meta: ArchiveMeta,
    manifest: IntegrityManifest,
}

impl HistoryArchive {
    /// Open or create an archive at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("histories"))?;
        std::fs::create_dir_all(root.join("integrity"))?;

        let meta_path = root.join("archive.meta.json");
        let manifest_path = root.join("integrity").join("manifest.json");

        let (meta, manifest) = if meta_path.exists() {
            let meta: ArchiveMeta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
            if meta.archive_schema_version != ARCHIVE_SCHEMA_VERSION {
                return Err(StoreError::SchemaMismatch {
                    file_version: meta.archive_schema_version,
                    expected_version: ARCHIVE_SCHEMA_VERSION,
                });
            }
            let manifest: IntegrityManifest = if manifest_path.exists() {
                serde_json::from_reader(std::fs::File::open(&manifest_path)?)?
            } else {
                IntegrityManifest::default()
            };
            (meta, manifest)
        } else {
            let meta = ArchiveMeta {
                archive_schema_version: ARCHIVE_SCHEMA_VERSION,
                segment_count: 0,
            };
            let manifest = IntegrityManifest::default();
            serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, &meta)?;
            serde_json::to_writer_pretty(std::fs::File::create(&manifest_path)?, &manifest)?;
            (meta, manifest)
        };

        Ok(Self {
            root,
            meta,
            manifest,
        })
    }

    /// Write the audit log of `entity` as a new segment.
    pub fn export(
        &mut self,
        entity: &EntityKey,
        records: &[VersionRecord],
    ) -> Result<String, StoreError> {
        self.meta.segment_count += 1;
        let filename = format!("{:06}.history.cbor.zst", self.meta.segment_count);
        let path = self.root.join("histories").join(&filename);

        let segment = HistorySegment {
            entity: entity.clone(),
            records: records.to_vec(),
        };
        let cbor_bytes = cbor_serialize(&segment)?;
        let compressed = zstd_compress(&cbor_bytes)?;

        let hash = sha256_hex(&compressed);
        let prev_hash = self.manifest.entries.last().map(|e| e.sha256.clone());

        std::fs::write(&path, &compressed)?;

        self.manifest.entries.push(ManifestEntry {
            filename: filename.clone(),
            entity: entity.clone(),
            record_count: records.len(),
            sha256: hash,
            prev_hash,
        });

        self.save_meta()?;
        self.save_manifest()?;
        info!(%entity, records = records.len(), segment = %filename, "history exported");
        Ok(filename)
    }

    /// Load the newest exported audit log of `entity`, verifying its hash.
    pub fn load(&self, entity: &EntityKey) -> Result<Vec<VersionRecord>, StoreError> {
        let entry = self
            .manifest
            .entries
            .iter()
            .rev()
            .find(|entry| &entry.entity == entity)
            .ok_or_else(|| StoreError::NotArchived(entity.clone()))?;

        let compressed = std::fs::read(self.root.join("histories").join(&entry.filename))?;
        let actual = sha256_hex(&compressed);
        if actual != entry.sha256 {
            return Err(StoreError::IntegrityMismatch {
                expected: entry.sha256.clone(),
                actual,
            });
        }

        let cbor_bytes = zstd_decompress(&compressed)?;
        let segment: HistorySegment = cbor_deserialize(&cbor_bytes)?;
        if &segment.entity != entity {
            return Err(StoreError::IntegrityMismatch {
                expected: entity.to_string(),
                actual: segment.entity.to_string(),
            });
        }
        debug!(%entity, records = segment.records.len(), "history loaded from archive");
        Ok(segment.records)
    }

    /// Verify all integrity hashes in the manifest.
    pub fn verify_integrity(&self) -> Result<(), StoreError> {
        let mut prev_hash: Option<String> = None;
        for entry in &self.manifest.entries {
            if entry.prev_hash != prev_hash {
                return Err(StoreError::IntegrityMismatch {
                    expected: prev_hash.unwrap_or_else(|| "None".into()),
                    actual: entry.prev_hash.clone().unwrap_or_else(|| "None".into()),
                });
            }

            let data = std::fs::read(self.root.join("histories").join(&entry.filename))?;
            let actual_hash = sha256_hex(&data);
            if actual_hash != entry.sha256 {
                return Err(StoreError::IntegrityMismatch {
                    expected: entry.sha256.clone(),
                    actual: actual_hash,
                });
            }

            prev_hash = Some(entry.sha256.clone());
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> &ArchiveMeta {
        &self.meta
    }

    pub fn manifest(&self) -> &IntegrityManifest {
        &self.manifest
    }

    fn save_meta(&self) -> Result<(), StoreError> {
        let path = self.root.join("archive.meta.json");
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.meta)?;
        Ok(())
    }

    fn save_manifest(&self) -> Result<(), StoreError> {
        let path = self.root.join("integrity").join("manifest.json");
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.manifest)?;
        Ok(())
    }
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(data).map_err(|e| StoreError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), 3)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
