// Copyright 2024-2026 Kernel Forge Contributors
// Licensed under the Apache License, Version 2.0

//! On-disk artifact cache.
//!
//! Each artifact is stored as `<key>.bin` plus a `<key>.json` metadata
//! sidecar. The sidecar is written last and acts as the commit marker, so a
//! crash mid-save leaves at most an orphaned binary.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::artifact::{ArtifactKey, ArtifactMetadata, CompiledArtifact};
use super::error::CompileError;

const BINARY_EXT: &str = "bin";
const METADATA_EXT: &str = "json";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) a cache directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CompileError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the binary for `key`.
    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key.to_hex(), BINARY_EXT))
    }

    fn metadata_path(&self, key: &ArtifactKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key.to_hex(), METADATA_EXT))
    }

    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.metadata_path(key).exists() && self.path_for(key).exists()
    }

    /// Load `key` from disk.
    ///
    /// Returns `Ok(None)` when absent. Entries whose metadata is unreadable
    /// or whose binary fails hash verification are deleted and reported as
    /// an error so the caller can rebuild them.
    pub fn load(&self, key: &ArtifactKey) -> Result<Option<CompiledArtifact>, CompileError> {
        let meta_path = self.metadata_path(key);
        if !meta_path.exists() {
            return Ok(None);
        }
        let result = self.read_entry(key, &meta_path);
        if let Err(e) = &result {
            if e.is_corrupt_artifact() {
                warn!(artifact = %key.short(), error = %e, "Discarding corrupt cached artifact");
                self.remove(key)?;
            }
        }
        result.map(Some)
    }

    fn read_entry(&self, key: &ArtifactKey, meta_path: &Path) -> Result<CompiledArtifact, CompileError> {
        let metadata = ArtifactMetadata::from_json(&fs::read_to_string(meta_path)?)?;
        if metadata.key != key.to_hex() {
            return Err(CompileError::InvalidMetadata(format!(
                "sidecar for {} names {}",
                key.short(),
                metadata.key
            )));
        }
        let bin_path = self.path_for(key);
        if !bin_path.exists() {
            return Err(CompileError::InvalidMetadata(format!(
                "binary for {} is missing",
                key.short()
            )));
        }
        let file = File::open(&bin_path)?;
        let len = file.metadata()?.len();
        let binary = if len == 0 {
            Vec::new()
        } else {
            // SAFETY: cache files are only replaced by rename, never
            // truncated in place, and the mapping is copied out immediately.
            let map = unsafe { Mmap::map(&file)? };
            map.to_vec()
        };
        let artifact = CompiledArtifact::from_parts(metadata, binary)?;
        debug!(artifact = %key.short(), bytes = len, "Loaded cached artifact");
        Ok(artifact)
    }

    /// Persist `artifact`, replacing any previous entry atomically.
    pub fn save(&self, artifact: &CompiledArtifact) -> Result<(), CompileError> {
        let json = artifact.metadata().to_json()?;
        self.write_atomic(&self.path_for(&artifact.key), &artifact.binary)?;
        self.write_atomic(&self.metadata_path(&artifact.key), json.as_bytes())?;
        debug!(artifact = %artifact.key.short(), bytes = artifact.binary.len(), "Saved artifact");
        Ok(())
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), CompileError> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| CompileError::Io(e.error))?;
        Ok(())
    }

    /// Metadata of every committed entry, oldest first. Unreadable sidecars
    /// are skipped.
    pub fn list(&self) -> Result<Vec<ArtifactMetadata>, CompileError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(METADATA_EXT) {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(CompileError::from)
                .and_then(|s| ArtifactMetadata::from_json(&s))
            {
                Ok(meta) => entries.push(meta),
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable sidecar"),
            }
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    /// Remove one entry. Returns whether anything was deleted.
    pub fn remove(&self, key: &ArtifactKey) -> Result<bool, CompileError> {
        let mut removed = false;
        for path in [self.metadata_path(key), self.path_for(key)] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    /// Delete every cache file. Returns the number of committed entries
    /// removed.
    pub fn clear(&self) -> Result<usize, CompileError> {
        let mut count = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(METADATA_EXT) => {
                    fs::remove_file(&path)?;
                    count += 1;
                }
                Some(BINARY_EXT) => fs::remove_file(&path)?,
                _ => {}
            }
        }
        Ok(count)
    }

    /// Total size of cached binaries in bytes.
    pub fn size_bytes(&self) -> Result<u64, CompileError> {
        let mut total = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some(BINARY_EXT) {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }
}
