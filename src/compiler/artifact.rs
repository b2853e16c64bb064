//! Compiled artifacts and their content-addressed keys.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::backend::CompileOptions;
use super::error::CompileError;

/// Bumped whenever the key derivation changes, invalidating disk caches.
const KEY_VERSION: &[u8] = b"kernel-forge-artifact-v1";

/// SHA-256 identity of a compiled module.
///
/// Covers the module source, the option fingerprint, the compiler and the
/// target architecture, so any change to either yields a new artifact.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey([u8; 32]);

impl ArtifactKey {
    pub fn compute(source: &str, options: &CompileOptions, compiler: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_VERSION);
        hasher.update([0]);
        hasher.update(source.as_bytes());
        hasher.update([0]);
        hasher.update(options.fingerprint().as_bytes());
        hasher.update([0]);
        hasher.update(compiler.as_bytes());
        hasher.update([0]);
        hasher.update(options.arch.to_le_bytes());
        Self(hasher.finalize().into())
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex digits, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArtifactKey({})", self.short())
    }
}

/// A compiled module and the kernels it exports.
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub key: ArtifactKey,
    pub kernel_names: Vec<String>,
    pub binary: Vec<u8>,
    pub arch: u32,
    pub compiler: String,
    pub created_at: DateTime<Utc>,
    pub binary_sha256: String,
}

impl CompiledArtifact {
    pub fn new(
        key: ArtifactKey,
        kernel_names: Vec<String>,
        binary: Vec<u8>,
        arch: u32,
        compiler: impl Into<String>,
    ) -> Self {
        let binary_sha256 = sha256_hex(&binary);
        Self {
            key,
            kernel_names,
            binary,
            arch,
            compiler: compiler.into(),
            created_at: Utc::now(),
            binary_sha256,
        }
    }

    /// Rebuild an artifact from its sidecar and binary, verifying the hash.
    pub fn from_parts(metadata: ArtifactMetadata, binary: Vec<u8>) -> Result<Self, CompileError> {
        metadata.validate()?;
        let key = ArtifactKey::from_hex(&metadata.key)
            .ok_or_else(|| CompileError::InvalidMetadata(format!("bad key {}", metadata.key)))?;
        let actual = sha256_hex(&binary);
        if actual != metadata.binary_sha256 {
            return Err(CompileError::HashMismatch {
                key: metadata.key,
                expected: metadata.binary_sha256,
                actual,
            });
        }
        Ok(Self {
            key,
            kernel_names: metadata.kernel_names,
            binary,
            arch: metadata.arch,
            compiler: metadata.compiler,
            created_at: metadata.created_at,
            binary_sha256: actual,
        })
    }

    pub fn metadata(&self) -> ArtifactMetadata {
        ArtifactMetadata {
            key: self.key.to_hex(),
            kernel_names: self.kernel_names.clone(),
            arch: self.arch,
            compiler: self.compiler.clone(),
            created_at: self.created_at,
            binary_sha256: self.binary_sha256.clone(),
            size_bytes: self.binary.len() as u64,
        }
    }

    pub fn has_kernel(&self, name: &str) -> bool {
        self.kernel_names.iter().any(|k| k == name)
    }

    pub fn size_bytes(&self) -> usize {
        self.binary.len()
    }
}

/// JSON sidecar stored next to each cached binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub key: String,
    pub kernel_names: Vec<String>,
    pub arch: u32,
    pub compiler: String,
    pub created_at: DateTime<Utc>,
    pub binary_sha256: String,
    pub size_bytes: u64,
}

impl ArtifactMetadata {
    pub fn from_json(json: &str) -> Result<Self, CompileError> {
        serde_json::from_str(json)
            .map_err(|e| CompileError::InvalidMetadata(format!("invalid JSON: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, CompileError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CompileError::InvalidMetadata(format!("serialize failed: {}", e)))
    }

    pub fn validate(&self) -> Result<(), CompileError> {
        if !is_sha256_hex(&self.key) {
            return Err(CompileError::InvalidMetadata(
                "key must be 64 hex characters".into(),
            ));
        }
        if !is_sha256_hex(&self.binary_sha256) {
            return Err(CompileError::InvalidMetadata(
                "binary_sha256 must be 64 hex characters".into(),
            ));
        }
        if self.kernel_names.is_empty() {
            return Err(CompileError::InvalidMetadata("artifact exports no kernels".into()));
        }
        Ok(())
    }
}

/// A named kernel inside a loaded artifact.
#[derive(Debug, Clone)]
pub struct KernelHandle {
    artifact: Arc<CompiledArtifact>,
    name: String,
}

impl KernelHandle {
    pub fn new(artifact: Arc<CompiledArtifact>, name: impl Into<String>) -> Self {
        Self {
            artifact,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn artifact(&self) -> &Arc<CompiledArtifact> {
        &self.artifact
    }

    pub fn key(&self) -> ArtifactKey {
        self.artifact.key
    }

    pub fn binary(&self) -> &[u8] {
        &self.artifact.binary
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(arch: u32) -> CompileOptions {
        CompileOptions {
            arch,
            ..CompileOptions::default()
        }
    }

    #[test]
    fn test_key_depends_on_every_input() {
        let base = ArtifactKey::compute("src", &options(80), "mock");
        assert_eq!(base, ArtifactKey::compute("src", &options(80), "mock"));
        assert_ne!(base, ArtifactKey::compute("src2", &options(80), "mock"));
        assert_ne!(base, ArtifactKey::compute("src", &options(90), "mock"));
        assert_ne!(base, ArtifactKey::compute("src", &options(80), "nvcc"));
        let mut flagged = options(80);
        flagged.flags.push("-lineinfo".into());
        assert_ne!(base, ArtifactKey::compute("src", &flagged, "mock"));
    }

    #[test]
    fn test_key_hex_round_trip() {
        let key = ArtifactKey::compute("src", &options(80), "mock");
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ArtifactKey::from_hex(&hex), Some(key));
        assert_eq!(ArtifactKey::from_hex("abc"), None);
        assert!(hex.starts_with(&key.short()));
    }

    #[test]
    fn test_from_parts_verifies_hash() {
        let key = ArtifactKey::compute("src", &options(80), "mock");
        let artifact = CompiledArtifact::new(key, vec!["k".into()], vec![1, 2, 3], 80, "mock");
        let meta = artifact.metadata();

        let restored = CompiledArtifact::from_parts(meta.clone(), vec![1, 2, 3]).unwrap();
        assert_eq!(restored.key, key);
        assert!(restored.has_kernel("k"));

        let result = CompiledArtifact::from_parts(meta, vec![1, 2, 4]);
        assert!(matches!(result, Err(CompileError::HashMismatch { .. })));
    }

    #[test]
    fn test_metadata_validation() {
        let key = ArtifactKey::compute("src", &options(80), "mock");
        let artifact = CompiledArtifact::new(key, vec!["k".into()], vec![0], 80, "mock");
        let json = artifact.metadata().to_json().unwrap();
        let parsed = ArtifactMetadata::from_json(&json).unwrap();
        assert!(parsed.validate().is_ok());

        let mut bad = parsed.clone();
        bad.binary_sha256 = "xyz".into();
        assert!(bad.validate().is_err());
        let mut empty = parsed;
        empty.kernel_names.clear();
        assert!(empty.validate().is_err());
        assert!(ArtifactMetadata::from_json("{").is_err());
    }
}
