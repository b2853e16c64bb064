//! Kernel compilation and artifact caching.
//!
//! Operations are emitted into one translation unit, keyed by a SHA-256 of
//! the source and compile options, and compiled at most once per key. Built
//! artifacts live in a bounded memory cache and, optionally, a disk cache
//! that survives process restarts.

mod artifact;
mod backend;
mod error;
mod manager;
mod source;
mod store;

pub use artifact::{ArtifactKey, ArtifactMetadata, CompiledArtifact, KernelHandle};
pub use backend::{ArchFlagStyle, CommandCompiler, CompileOptions, KernelCompiler, MockCompiler};
pub use error::CompileError;
pub use manager::{ArtifactManager, ArtifactManagerConfig, CacheStats};
pub use source::{emit_module_source, ModuleSource, MODULE_HEADER};
pub use store::ArtifactStore;
