// Copyright 2024-2026 Kernel Forge Contributors
// Licensed under the Apache License, Version 2.0

//! Artifact manager: memory cache, disk cache and compiler in front of each
//! other.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::artifact::{ArtifactKey, CompiledArtifact, KernelHandle};
use super::backend::{CompileOptions, KernelCompiler};
use super::error::CompileError;
use super::source::emit_module_source;
use super::store::ArtifactStore;
use crate::operation::Operation;
use crate::telemetry::{record_cache_lookup, record_compile, CacheOutcome, CompileSpan, SpanExt};

#[derive(Debug, Clone)]
pub struct ArtifactManagerConfig {
    /// Disk cache directory; `None` keeps artifacts in memory only.
    pub cache_dir: Option<PathBuf>,
    /// Artifacts kept in memory before least-recently-used eviction.
    pub max_memory_entries: usize,
    pub options: CompileOptions,
}

impl Default for ArtifactManagerConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            max_memory_entries: 256,
            options: CompileOptions::default(),
        }
    }
}

/// Counters reported by [`ArtifactManager::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub kernels: usize,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub compiles: u64,
    pub compile_failures: u64,
    pub evictions: u64,
}

struct CacheEntry {
    artifact: Arc<CompiledArtifact>,
    last_used: AtomicU64,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    compiles: AtomicU64,
    compile_failures: AtomicU64,
    evictions: AtomicU64,
}

/// Caches compiled modules and resolves kernels by name.
///
/// Lookups go memory, then disk, then compiler. Concurrent requests for
/// the same key wait on one compile instead of racing.
pub struct ArtifactManager {
    config: ArtifactManagerConfig,
    compiler: Arc<dyn KernelCompiler>,
    store: Option<ArtifactStore>,
    entries: DashMap<ArtifactKey, CacheEntry>,
    kernels: DashMap<String, ArtifactKey>,
    in_flight: DashMap<ArtifactKey, Arc<Mutex<()>>>,
    clock: AtomicU64,
    active_compiles: AtomicUsize,
    counters: Counters,
}

impl ArtifactManager {
    pub fn new(
        config: ArtifactManagerConfig,
        compiler: Arc<dyn KernelCompiler>,
    ) -> Result<Self, CompileError> {
        if config.max_memory_entries == 0 {
            return Err(CompileError::Unsupported(
                "max_memory_entries must be at least 1".into(),
            ));
        }
        let store = config
            .cache_dir
            .as_ref()
            .map(ArtifactStore::new)
            .transpose()?;
        info!(
            compiler = compiler.name(),
            arch = config.options.arch,
            disk_cache = ?config.cache_dir,
            "Artifact manager ready"
        );
        Ok(Self {
            config,
            compiler,
            store,
            entries: DashMap::new(),
            kernels: DashMap::new(),
            in_flight: DashMap::new(),
            clock: AtomicU64::new(0),
            active_compiles: AtomicUsize::new(0),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &ArtifactManagerConfig {
        &self.config
    }

    pub fn options(&self) -> &CompileOptions {
        &self.config.options
    }

    pub fn compiler_name(&self) -> &str {
        self.compiler.name()
    }

    pub fn store(&self) -> Option<&ArtifactStore> {
        self.store.as_ref()
    }

    /// Key `source` would be cached under with this manager's options.
    pub fn key_for(&self, source: &str) -> ArtifactKey {
        ArtifactKey::compute(source, &self.config.options, self.compiler.name())
    }

    /// Compile `ops` into one module, reusing any cached artifact.
    pub fn compile(&self, ops: &[&dyn Operation]) -> Result<Arc<CompiledArtifact>, CompileError> {
        let module = emit_module_source(ops)?;
        self.compile_source(&module.source, module.kernel_names)
    }

    /// Compile an already assembled module exporting `kernel_names`.
    pub fn compile_source(
        &self,
        source: &str,
        kernel_names: Vec<String>,
    ) -> Result<Arc<CompiledArtifact>, CompileError> {
        let key = self.key_for(source);
        let span = CompileSpan::new(&key.short(), kernel_names.len());
        let _enter = span.enter();

        if let Some(artifact) = self.lookup_memory(&key) {
            span.record("source", "memory");
            return Ok(artifact);
        }

        let lock = self
            .in_flight
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock();
            self.load_or_compile(&key, source, kernel_names, &span)
        };

        // The last holder of this lock removes it; a newer lock stays.
        let lock_ptr = Arc::as_ptr(&lock);
        drop(lock);
        self.in_flight.remove_if(&key, |_, current| {
            Arc::as_ptr(current) == lock_ptr && Arc::strong_count(current) == 1
        });
        result
    }

    fn load_or_compile(
        &self,
        key: &ArtifactKey,
        source: &str,
        kernel_names: Vec<String>,
        span: &tracing::Span,
    ) -> Result<Arc<CompiledArtifact>, CompileError> {
        // Another caller may have finished this key while we waited.
        if let Some(artifact) = self.lookup_memory(key) {
            span.record("source", "memory");
            return Ok(artifact);
        }

        if let Some(store) = &self.store {
            match store.load(key) {
                Ok(Some(artifact)) => {
                    self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
                    record_cache_lookup(CacheOutcome::DiskHit);
                    span.record("source", "disk");
                    return Ok(self.insert(artifact));
                }
                Ok(None) => {}
                Err(e) if e.is_corrupt_artifact() => {
                    debug!(artifact = %key.short(), "Rebuilding corrupt artifact");
                }
                Err(e) => {
                    warn!(artifact = %key.short(), error = %e, "Disk cache read failed");
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        record_cache_lookup(CacheOutcome::Miss);
        span.record("source", "compiler");

        self.active_compiles.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        let compiled = self.compiler.compile(source, &self.config.options);
        let elapsed = start.elapsed();
        self.active_compiles.fetch_sub(1, Ordering::SeqCst);

        record_compile(elapsed, compiled.is_ok());
        span.record("latency_ms", elapsed.as_millis() as u64);
        span.record_result(&compiled);

        let binary = match compiled {
            Ok(binary) => {
                self.counters.compiles.fetch_add(1, Ordering::Relaxed);
                binary
            }
            Err(e) => {
                self.counters.compile_failures.fetch_add(1, Ordering::Relaxed);
                warn!(artifact = %key.short(), error = %e, "Compilation failed");
                return Err(e);
            }
        };

        let artifact = CompiledArtifact::new(
            *key,
            kernel_names,
            binary,
            self.config.options.arch,
            self.compiler.name(),
        );
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&artifact) {
                warn!(artifact = %key.short(), error = %e, "Failed to persist artifact");
            }
        }
        info!(
            artifact = %key.short(),
            kernels = artifact.kernel_names.len(),
            bytes = artifact.binary.len(),
            latency_ms = elapsed.as_millis() as u64,
            "Compiled artifact"
        );
        Ok(self.insert(artifact))
    }

    /// Compile on tokio's blocking pool.
    pub async fn compile_async(
        self: &Arc<Self>,
        ops: Vec<Arc<dyn Operation>>,
    ) -> Result<Arc<CompiledArtifact>, CompileError> {
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let refs: Vec<&dyn Operation> = ops.iter().map(|op| op.as_ref()).collect();
            manager.compile(&refs)
        })
        .await
        .map_err(|e| CompileError::TaskFailed(e.to_string()))?
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn lookup_memory(&self, key: &ArtifactKey) -> Option<Arc<CompiledArtifact>> {
        let entry = self.entries.get(key)?;
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
        record_cache_lookup(CacheOutcome::MemoryHit);
        Some(Arc::clone(&entry.artifact))
    }

    fn insert(&self, artifact: CompiledArtifact) -> Arc<CompiledArtifact> {
        let artifact = Arc::new(artifact);
        for name in &artifact.kernel_names {
            self.kernels.insert(name.clone(), artifact.key);
        }
        self.entries.insert(
            artifact.key,
            CacheEntry {
                artifact: Arc::clone(&artifact),
                last_used: AtomicU64::new(self.tick()),
            },
        );
        self.evict_overflow();
        artifact
    }

    /// Drop least recently used artifacts beyond the memory budget.
    fn evict_overflow(&self) {
        while self.entries.len() > self.config.max_memory_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().last_used.load(Ordering::Relaxed))
                .map(|e| *e.key());
            let Some(key) = oldest else { break };
            self.forget(&key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(artifact = %key.short(), "Evicted artifact from memory");
        }
    }

    /// Drop `key` from memory. Names it exported move to the most recently
    /// used artifact that still exports them.
    fn forget(&self, key: &ArtifactKey) -> bool {
        let Some((_, entry)) = self.entries.remove(key) else {
            return false;
        };
        for name in &entry.artifact.kernel_names {
            let successor = self
                .entries
                .iter()
                .filter(|e| e.value().artifact.kernel_names.contains(name))
                .max_by_key(|e| e.value().last_used.load(Ordering::Relaxed))
                .map(|e| *e.key());
            match successor {
                Some(next) => {
                    if let Some(mut mapped) = self.kernels.get_mut(name) {
                        if *mapped == *key {
                            *mapped = next;
                        }
                    }
                }
                None => {
                    self.kernels.remove_if(name, |_, k| *k == *key);
                }
            }
        }
        true
    }

    /// Kernel `name` from any artifact held in memory.
    pub fn kernel(&self, name: &str) -> Option<KernelHandle> {
        let key = *self.kernels.get(name)?;
        let entry = self.entries.get(&key)?;
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        Some(KernelHandle::new(Arc::clone(&entry.artifact), name))
    }

    /// Kernel implementing `op`, if compiled.
    pub fn kernel_for(&self, op: &dyn Operation) -> Option<KernelHandle> {
        self.kernel(&op.kernel_name())
    }

    /// Whether `key` is held in memory.
    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop `key` from memory and disk. Returns whether anything was removed.
    pub fn invalidate(&self, key: &ArtifactKey) -> Result<bool, CompileError> {
        let mut removed = self.forget(key);
        if let Some(store) = &self.store {
            removed |= store.remove(key)?;
        }
        if removed {
            info!(artifact = %key.short(), "Invalidated artifact");
        }
        Ok(removed)
    }

    /// Drop every in-memory artifact. Returns the number dropped.
    pub fn clear_memory(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.kernels.clear();
        count
    }

    /// Delete the disk cache. Returns the number of entries deleted.
    pub fn purge_disk(&self) -> Result<usize, CompileError> {
        match &self.store {
            Some(store) => {
                let count = store.clear()?;
                info!(entries = count, dir = %store.dir().display(), "Purged disk cache");
                Ok(count)
            }
            None => Ok(0),
        }
    }

    /// Compiles currently running.
    pub fn active_compiles(&self) -> usize {
        self.active_compiles.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_entries: self.entries.len(),
            kernels: self.kernels.len(),
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            compiles: self.counters.compiles.load(Ordering::Relaxed),
            compile_failures: self.counters.compile_failures.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
