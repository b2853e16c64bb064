//! Artifact manager benchmarks.
//!
//! Measures key hashing, warm memory-cache lookups and disk-cache loads.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use kernel_forge::cli::catalog;
use kernel_forge::compiler::{
    emit_module_source, ArtifactKey, ArtifactManager, ArtifactManagerConfig, CompileOptions, MockCompiler,
};
use kernel_forge::operation::Operation;

fn bench_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("artifact_key");
    let ops = catalog::standard_operations(80).unwrap();
    let refs: Vec<&dyn Operation> = ops.iter().map(|op| op.as_ref()).collect();
    let module = emit_module_source(&refs).unwrap();
    let options = CompileOptions::default();

    group.throughput(Throughput::Bytes(module.source.len() as u64));
    group.bench_function("compute", |b| {
        b.iter(|| ArtifactKey::compute(black_box(&module.source), &options, "mock"))
    });
    group.bench_function("emit_and_compute", |b| {
        b.iter(|| {
            let module = emit_module_source(black_box(&refs)).unwrap();
            ArtifactKey::compute(&module.source, &options, "mock")
        })
    });

    group.finish();
}

fn bench_memory_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("artifact_memory_hit");
    let manager = ArtifactManager::new(ArtifactManagerConfig::default(), Arc::new(MockCompiler::new())).unwrap();
    let ops = catalog::standard_operations(80).unwrap();
    let op = ops[0].as_ref();
    manager.compile(&[op]).unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("compile_cached", |b| b.iter(|| manager.compile(black_box(&[op])).unwrap()));
    group.bench_function("kernel_for", |b| b.iter(|| manager.kernel_for(black_box(op))));

    group.finish();
}

fn bench_disk_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("artifact_disk_hit");
    let dir = tempfile::tempdir().unwrap();
    let config = ArtifactManagerConfig {
        cache_dir: Some(dir.path().to_path_buf()),
        ..ArtifactManagerConfig::default()
    };
    let ops = catalog::standard_operations(80).unwrap();
    let op = ops[0].as_ref();
    ArtifactManager::new(config.clone(), Arc::new(MockCompiler::new()))
        .unwrap()
        .compile(&[op])
        .unwrap();

    group.bench_function("fresh_manager_load", |b| {
        b.iter(|| {
            let manager = ArtifactManager::new(config.clone(), Arc::new(MockCompiler::new())).unwrap();
            black_box(manager.compile(&[op]).unwrap())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_key, bench_memory_hit, bench_disk_hit);
criterion_main!(benches);
