//! Compiler backends: an external compiler process and a deterministic mock.

use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::error::CompileError;

/// Largest compiler diagnostic kept in an error.
const MAX_STDERR_BYTES: usize = 4096;

/// Options passed to the compiler for one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Target architecture (CUDA compute capability or SYCL arch id).
    pub arch: u32,
    pub flags: Vec<String>,
    pub include_paths: Vec<PathBuf>,
    pub opt_level: u8,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            arch: 80,
            flags: Vec::new(),
            include_paths: Vec::new(),
            opt_level: 3,
        }
    }
}

impl CompileOptions {
    /// Stable textual form of everything that affects the binary.
    pub fn fingerprint(&self) -> String {
        let includes: Vec<String> = self
            .include_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        format!(
            "arch={};O{};flags={};includes={}",
            self.arch,
            self.opt_level,
            self.flags.join(" "),
            includes.join(":")
        )
    }
}

/// Turns module source into a loadable binary.
pub trait KernelCompiler: Send + Sync {
    /// Name recorded in artifact keys and metadata.
    fn name(&self) -> &str;

    fn compile(&self, source: &str, options: &CompileOptions) -> Result<Vec<u8>, CompileError>;
}

/// How a compiler binary expects its target architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchFlagStyle {
    /// `-arch=sm_80`
    Nvcc,
    /// `-fsycl -fsycl-targets=intel_gpu_pvc` style flags.
    Sycl,
    /// No architecture flag.
    None,
}

/// Runs an external compiler over a temporary source file.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    program: PathBuf,
    name: String,
    base_args: Vec<String>,
    style: ArchFlagStyle,
    source_extension: &'static str,
}

impl CommandCompiler {
    pub fn new(program: impl Into<PathBuf>, style: ArchFlagStyle) -> Self {
        let program = program.into();
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "compiler".to_string());
        let (base_args, source_extension) = match style {
            ArchFlagStyle::Nvcc => (vec!["-cubin".to_string(), "-std=c++17".to_string()], "cu"),
            ArchFlagStyle::Sycl => (vec!["-fsycl".to_string(), "-std=c++17".to_string()], "cpp"),
            ArchFlagStyle::None => (Vec::new(), "cpp"),
        };
        Self {
            program,
            name,
            base_args,
            style,
            source_extension,
        }
    }

    pub fn nvcc(program: impl Into<PathBuf>) -> Self {
        Self::new(program, ArchFlagStyle::Nvcc)
    }

    pub fn sycl(program: impl Into<PathBuf>) -> Self {
        Self::new(program, ArchFlagStyle::Sycl)
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    fn arch_args(&self, arch: u32) -> Vec<String> {
        match self.style {
            ArchFlagStyle::Nvcc => vec![format!("-arch=sm_{}", arch)],
            ArchFlagStyle::Sycl => vec![format!("-fsycl-targets={}", sycl_target(arch))],
            ArchFlagStyle::None => Vec::new(),
        }
    }

    /// Full argument list for compiling `source` into `output`.
    pub fn command_args(&self, options: &CompileOptions, source: &str, output: &str) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.extend(self.arch_args(options.arch));
        args.push(format!("-O{}", options.opt_level));
        for include in &options.include_paths {
            args.push(format!("-I{}", include.display()));
        }
        args.extend(options.flags.iter().cloned());
        args.push("-o".to_string());
        args.push(output.to_string());
        args.push(source.to_string());
        args
    }
}

/// SYCL ahead-of-time target for an arch id.
fn sycl_target(arch: u32) -> &'static str {
    match arch {
        11 => "intel_gpu_pvc",
        12 => "intel_gpu_bmg_g21",
        _ => "spir64",
    }
}

impl KernelCompiler for CommandCompiler {
    fn name(&self) -> &str {
        &self.name
    }

    fn compile(&self, source: &str, options: &CompileOptions) -> Result<Vec<u8>, CompileError> {
        let dir = tempfile::tempdir()?;
        let src_path = dir.path().join(format!("module.{}", self.source_extension));
        let out_path = dir.path().join("module.bin");
        std::fs::write(&src_path, source)?;

        let args = self.command_args(
            options,
            &src_path.to_string_lossy(),
            &out_path.to_string_lossy(),
        );
        debug!(compiler = %self.program.display(), args = ?args, "Invoking compiler");
        let output = Command::new(&self.program).args(&args).output()?;

        if !output.status.success() {
            let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if stderr.len() > MAX_STDERR_BYTES {
                let mut cut = MAX_STDERR_BYTES;
                while !stderr.is_char_boundary(cut) {
                    cut -= 1;
                }
                stderr.truncate(cut);
            }
            return Err(CompileError::CompilerFailed {
                compiler: self.name.clone(),
                status: output.status.code(),
                stderr,
            });
        }
        if !out_path.exists() {
            return Err(CompileError::MissingOutput(out_path));
        }
        Ok(std::fs::read(&out_path)?)
    }
}

/// Compiler stand-in that derives its output from the input.
///
/// Output is `FORGEBIN` followed by the SHA-256 of source and options, so
/// identical inputs produce identical binaries.
#[derive(Debug, Default)]
pub struct MockCompiler {
    invocations: AtomicUsize,
    failure: Mutex<Option<String>>,
    delay: Option<Duration>,
}

impl MockCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` inside every compile.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Make subsequent compiles fail with `message`, or succeed with `None`.
    pub fn set_failure(&self, message: Option<&str>) {
        *self.failure.lock() = message.map(str::to_string);
    }
}

impl KernelCompiler for MockCompiler {
    fn name(&self) -> &str {
        "mock"
    }

    fn compile(&self, source: &str, options: &CompileOptions) -> Result<Vec<u8>, CompileError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(message) = self.failure.lock().clone() {
            return Err(CompileError::CompilerFailed {
                compiler: "mock".into(),
                status: Some(1),
                stderr: message,
            });
        }
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update(options.fingerprint().as_bytes());
        let mut binary = b"FORGEBIN".to_vec();
        binary.extend_from_slice(&hasher.finalize());
        Ok(binary)
    }
}
