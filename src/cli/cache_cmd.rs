//! `cache` subcommands: stats, list, clear, warm.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::compiler::{ArtifactManager, ArtifactStore};
use crate::config::ForgeConfig;

use super::catalog;
use super::{load_config, EXIT_CONFIG, EXIT_FAILURE, EXIT_OK};

#[derive(Debug, Serialize)]
pub struct DiskCacheSummary {
    pub dir: String,
    pub entries: usize,
    pub size_bytes: u64,
}

/// Result of warming the cache.
#[derive(Debug, Default, Serialize)]
pub struct WarmReport {
    pub compiled: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

fn open_store(cfg: &ForgeConfig) -> Result<ArtifactStore, i32> {
    let Some(dir) = &cfg.cache_dir else {
        eprintln!("No disk cache configured. Set FORGE_CACHE_DIR.");
        return Err(EXIT_CONFIG);
    };
    ArtifactStore::new(dir).map_err(|e| {
        eprintln!("Cannot open cache directory {}: {}", dir.display(), e);
        EXIT_FAILURE
    })
}

fn with_store(f: impl FnOnce(&ArtifactStore) -> i32) -> i32 {
    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    match open_store(&cfg) {
        Ok(store) => f(&store),
        Err(code) => code,
    }
}

pub fn summarize(store: &ArtifactStore) -> Result<DiskCacheSummary, crate::compiler::CompileError> {
    Ok(DiskCacheSummary {
        dir: store.dir().display().to_string(),
        entries: store.list()?.len(),
        size_bytes: store.size_bytes()?,
    })
}

pub fn run_stats(json: bool) -> i32 {
    with_store(|store| match summarize(store) {
        Ok(summary) if json => {
            println!("{}", serde_json::json!(summary));
            EXIT_OK
        }
        Ok(summary) => {
            println!("Cache directory: {}", summary.dir);
            println!("Artifacts:       {}", summary.entries);
            println!("Size:            {} bytes", summary.size_bytes);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Failed to read cache: {}", e);
            EXIT_FAILURE
        }
    })
}

pub fn run_list(json: bool) -> i32 {
    with_store(|store| {
        let entries = match store.list() {
            Ok(entries) => entries,
            Err(e) => {
                eprintln!("Failed to read cache: {}", e);
                return EXIT_FAILURE;
            }
        };
        if json {
            println!("{}", serde_json::json!(entries));
            return EXIT_OK;
        }
        if entries.is_empty() {
            println!("Cache is empty.");
            return EXIT_OK;
        }
        println!(
            "{:<14} {:>6} {:<10} {:>10} {:<22} {}",
            "KEY", "ARCH", "COMPILER", "BYTES", "CREATED", "KERNELS"
        );
        for meta in &entries {
            println!(
                "{:<14} {:>6} {:<10} {:>10} {:<22} {}",
                &meta.key[..12.min(meta.key.len())],
                meta.arch,
                meta.compiler,
                meta.size_bytes,
                meta.created_at.format("%Y-%m-%d %H:%M:%S"),
                meta.kernel_names.join(","),
            );
        }
        EXIT_OK
    })
}

pub fn run_clear() -> i32 {
    with_store(|store| match store.clear() {
        Ok(n) => {
            println!("Removed {} cached artifacts.", n);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Failed to clear cache: {}", e);
            EXIT_FAILURE
        }
    })
}

/// Compile every standard configuration into `manager`, `jobs` at a time.
pub async fn warm(manager: Arc<ArtifactManager>, arch: u32, jobs: usize) -> Result<WarmReport, String> {
    let ops = catalog::standard_operations(arch).map_err(|e| e.to_string())?;
    let start = Instant::now();
    let results: Vec<_> = stream::iter(ops)
        .map(|op| {
            let manager = Arc::clone(&manager);
            async move {
                let name = op.procedural_name();
                let result = manager.compile_async(vec![op]).await;
                (name, result)
            }
        })
        .buffer_unordered(jobs.max(1))
        .collect()
        .await;

    let mut report = WarmReport::default();
    for (name, result) in results {
        match result {
            Ok(_) => report.compiled += 1,
            Err(e) => {
                eprintln!("{}: {}", name, e);
                report.failed += 1;
            }
        }
    }
    report.elapsed_ms = start.elapsed().as_millis() as u64;
    Ok(report)
}

pub async fn run_warm(jobs: Option<usize>) -> i32 {
    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    if let Err(code) = open_store(&cfg) {
        return code;
    }
    let manager = match ArtifactManager::new(cfg.backend_config().artifacts, cfg.build_compiler()) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            eprintln!("Failed to create artifact manager: {}", e);
            return EXIT_CONFIG;
        }
    };
    let jobs = jobs.unwrap_or_else(num_cpus::get);
    match warm(Arc::clone(&manager), cfg.arch(), jobs).await {
        Ok(report) => {
            println!(
                "Warmed {} artifacts ({} failed) in {} ms for sm{}.",
                report.compiled,
                report.failed,
                report.elapsed_ms,
                cfg.arch()
            );
            if report.failed == 0 {
                EXIT_OK
            } else {
                EXIT_FAILURE
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            EXIT_FAILURE
        }
    }
}
