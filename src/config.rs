//! Configuration loading from environment variables and an optional TOML file.
//!
//! Values come from `FORGE_*` environment variables, then the file named by
//! `FORGE_CONFIG_FILE`, then built-in defaults. Invalid environment values
//! fall back without failing; a malformed config file is an error.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `FORGE_CONFIG_FILE` | unset | TOML file with `[cache]`, `[pool]`, `[compiler]`, `[device]` tables |
//! | `FORGE_CACHE_DIR` | unset | Disk artifact cache (memory only when unset) |
//! | `FORGE_MAX_CACHED_ARTIFACTS` | 256 | Artifacts held in memory |
//! | `FORGE_POOL_INIT_BYTES` | 67108864 | Bytes reserved at pool creation |
//! | `FORGE_POOL_MAX_BYTES` | 4294967296 | Pool ceiling |
//! | `FORGE_POOL_GROW_BYTES` | 33554432 | Minimum growth segment |
//! | `FORGE_COMPILER` | unset | Compiler binary (mock compiler when unset) |
//! | `FORGE_COMPILER_FLAGS` | empty | Extra compiler flags, whitespace separated |
//! | `FORGE_OPT_LEVEL` | 3 | Optimization level (0-3) |
//! | `FORGE_DEVICE_BACKEND` | cpu | `cuda`, `sycl` or `cpu` |
//! | `FORGE_DEVICE_CC` | 0 | Compute capability / SYCL arch id |
//! | `FORGE_DEVICE_MEMORY` | 17179869184 | Device memory (bytes) |
//! | `FORGE_DEVICE_SMS` | 1 | Multiprocessor count |
//! | `FORGE_DEVICE_SMEM` | 49152 | Shared memory per block (bytes) |
//! | `FORGE_REQUIRE_GPU` | false | Fail instead of falling back to CPU |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::compiler::{
    ArchFlagStyle, ArtifactManagerConfig, CommandCompiler, CompileOptions, KernelCompiler,
    MockCompiler,
};
use crate::device::{DeviceBackend, DeviceConfig};
use crate::memory::{PoolConfig, POOL_ALIGNMENT};
use crate::BackendConfig;

/// Architecture compiled for when the device does not name one.
const DEFAULT_ARCH: u32 = 80;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Layout of the TOML config file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub cache: CacheSection,
    pub pool: PoolSection,
    pub compiler: CompilerSection,
    pub device: DeviceSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    pub dir: Option<PathBuf>,
    pub max_artifacts: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSection {
    pub init_bytes: Option<usize>,
    pub max_bytes: Option<usize>,
    pub grow_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerSection {
    pub program: Option<PathBuf>,
    pub flags: Option<Vec<String>>,
    pub include_paths: Option<Vec<PathBuf>>,
    pub opt_level: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSection {
    pub backend: Option<String>,
    pub compute_capability: Option<u32>,
    pub memory_bytes: Option<u64>,
    pub multiprocessors: Option<u32>,
    pub shared_memory_bytes: Option<u32>,
    pub require_gpu: Option<bool>,
}

impl FileConfig {
    pub fn from_toml(path: &Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(path, &text)
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    pub config_file: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub max_cached_artifacts: usize,
    pub pool: PoolConfig,
    pub compiler: Option<PathBuf>,
    pub compiler_flags: Vec<String>,
    pub include_paths: Vec<PathBuf>,
    pub opt_level: u8,
    pub device: DeviceConfig,
}

/// Flat, serializable summary of effective values.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub config_file: Option<String>,
    pub cache_dir: Option<String>,
    pub max_cached_artifacts: usize,
    pub pool_init_bytes: usize,
    pub pool_max_bytes: usize,
    pub pool_grow_bytes: usize,
    pub compiler: String,
    pub compiler_flags: String,
    pub opt_level: u8,
    pub arch: u32,
    pub device_backend: String,
    pub device_cc: u32,
    pub device_memory: u64,
    pub device_sms: u32,
    pub device_smem: u32,
    pub require_gpu: bool,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an env var, warning and returning `None` when invalid.
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring invalid config value");
            None
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = env_string(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(key, value = %raw, "Ignoring invalid boolean");
            None
        }
    }
}

/// Load configuration from the environment and `FORGE_CONFIG_FILE`.
pub fn load() -> Result<ForgeConfig, ConfigError> {
    let config_file = env_string("FORGE_CONFIG_FILE").map(PathBuf::from);
    let file = match &config_file {
        Some(path) => FileConfig::from_file(path)?,
        None => FileConfig::default(),
    };
    let mut config = resolve(&file);
    config.config_file = config_file;
    Ok(config)
}

/// Merge environment over `file` over defaults.
pub fn resolve(file: &FileConfig) -> ForgeConfig {
    let cache_dir = env_string("FORGE_CACHE_DIR")
        .map(PathBuf::from)
        .or_else(|| file.cache.dir.clone());
    let max_cached_artifacts = env_parse("FORGE_MAX_CACHED_ARTIFACTS")
        .or(file.cache.max_artifacts)
        .unwrap_or(256)
        .max(1);

    let compiler = env_string("FORGE_COMPILER")
        .map(PathBuf::from)
        .or_else(|| file.compiler.program.clone());
    let compiler_flags = env_string("FORGE_COMPILER_FLAGS")
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .or_else(|| file.compiler.flags.clone())
        .unwrap_or_default();
    let include_paths = file.compiler.include_paths.clone().unwrap_or_default();
    let opt_level = env_parse("FORGE_OPT_LEVEL")
        .or(file.compiler.opt_level)
        .unwrap_or(3)
        .min(3);

    ForgeConfig {
        config_file: None,
        cache_dir,
        max_cached_artifacts,
        pool: load_pool_config(&file.pool),
        compiler,
        compiler_flags,
        include_paths,
        opt_level,
        device: load_device_config(&file.device),
    }
}

/// Built-in defaults, ignoring environment and config file.
pub fn defaults() -> ForgeConfig {
    ForgeConfig {
        config_file: None,
        cache_dir: None,
        max_cached_artifacts: 256,
        pool: PoolConfig::default(),
        compiler: None,
        compiler_flags: Vec::new(),
        include_paths: Vec::new(),
        opt_level: 3,
        device: DeviceConfig::default(),
    }
}

fn load_pool_config(file: &PoolSection) -> PoolConfig {
    let defaults = PoolConfig::default();
    let init = env_parse("FORGE_POOL_INIT_BYTES")
        .or(file.init_bytes)
        .unwrap_or(defaults.init_pool_size);
    let max = env_parse("FORGE_POOL_MAX_BYTES")
        .or(file.max_bytes)
        .unwrap_or(defaults.max_pool_size);
    let grow = env_parse("FORGE_POOL_GROW_BYTES")
        .or(file.grow_bytes)
        .unwrap_or(defaults.grow_size);
    let max = max.max(POOL_ALIGNMENT); // floor: one block
    let init = init.min(max); // init <= max
    let grow = grow.max(POOL_ALIGNMENT);
    PoolConfig {
        init_pool_size: init,
        max_pool_size: max,
        grow_size: grow,
    }
}

fn load_device_config(file: &DeviceSection) -> DeviceConfig {
    let backend_name = env_string("FORGE_DEVICE_BACKEND").or_else(|| file.backend.clone());
    let backend = match backend_name {
        Some(name) => name.parse::<DeviceBackend>().unwrap_or_else(|e| {
            warn!(backend = %name, error = %e, "Unknown device backend, using cpu");
            DeviceBackend::Cpu
        }),
        None => DeviceBackend::Cpu,
    };
    let cc = env_parse("FORGE_DEVICE_CC")
        .or(file.compute_capability)
        .unwrap_or(0);
    let sms = env_parse("FORGE_DEVICE_SMS")
        .or(file.multiprocessors)
        .unwrap_or(1)
        .max(1);

    let mut device = match backend {
        DeviceBackend::Cuda => DeviceConfig::cuda(cc, sms),
        DeviceBackend::Sycl => DeviceConfig::sycl(cc, sms),
        DeviceBackend::Cpu => DeviceConfig {
            compute_capability: cc,
            multiprocessor_count: sms,
            ..DeviceConfig::default()
        },
    };
    if let Some(memory) = env_parse("FORGE_DEVICE_MEMORY").or(file.memory_bytes) {
        device.total_memory = memory;
    }
    if let Some(smem) = env_parse("FORGE_DEVICE_SMEM").or(file.shared_memory_bytes) {
        device.max_shared_memory_per_block = smem;
    }
    device.require_gpu = env_bool("FORGE_REQUIRE_GPU")
        .or(file.require_gpu)
        .unwrap_or(false);
    device
}

impl ForgeConfig {
    /// Architecture kernels are compiled for.
    pub fn arch(&self) -> u32 {
        match self.device.compute_capability {
            0 => DEFAULT_ARCH,
            cc => cc,
        }
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            arch: self.arch(),
            flags: self.compiler_flags.clone(),
            include_paths: self.include_paths.clone(),
            opt_level: self.opt_level,
        }
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            device: self.device.clone(),
            pool: self.pool.clone(),
            artifacts: ArtifactManagerConfig {
                cache_dir: self.cache_dir.clone(),
                max_memory_entries: self.max_cached_artifacts,
                options: self.compile_options(),
            },
        }
    }

    /// The configured external compiler, or the mock compiler when none is set.
    pub fn build_compiler(&self) -> Arc<dyn KernelCompiler> {
        match &self.compiler {
            Some(program) => {
                let style = match self.device.backend {
                    DeviceBackend::Cuda => ArchFlagStyle::Nvcc,
                    DeviceBackend::Sycl => ArchFlagStyle::Sycl,
                    DeviceBackend::Cpu => ArchFlagStyle::None,
                };
                Arc::new(CommandCompiler::new(program.clone(), style))
            }
            None => Arc::new(MockCompiler::new()),
        }
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            config_file: self.config_file.as_ref().map(|p| p.display().to_string()),
            cache_dir: self.cache_dir.as_ref().map(|p| p.display().to_string()),
            max_cached_artifacts: self.max_cached_artifacts,
            pool_init_bytes: self.pool.init_pool_size,
            pool_max_bytes: self.pool.max_pool_size,
            pool_grow_bytes: self.pool.grow_size,
            compiler: self
                .compiler
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "mock".to_string()),
            compiler_flags: self.compiler_flags.join(" "),
            opt_level: self.opt_level,
            arch: self.arch(),
            device_backend: self.device.backend.to_string().to_ascii_lowercase(),
            device_cc: self.device.compute_capability,
            device_memory: self.device.total_memory,
            device_sms: self.device.multiprocessor_count,
            device_smem: self.device.max_shared_memory_per_block,
            require_gpu: self.device.require_gpu,
        }
    }
}

/// Serialize env-mutating tests across modules.
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) const ENV_KEYS: &[&str] = &[
    "FORGE_CONFIG_FILE",
    "FORGE_CACHE_DIR",
    "FORGE_MAX_CACHED_ARTIFACTS",
    "FORGE_POOL_INIT_BYTES",
    "FORGE_POOL_MAX_BYTES",
    "FORGE_POOL_GROW_BYTES",
    "FORGE_COMPILER",
    "FORGE_COMPILER_FLAGS",
    "FORGE_OPT_LEVEL",
    "FORGE_DEVICE_BACKEND",
    "FORGE_DEVICE_CC",
    "FORGE_DEVICE_MEMORY",
    "FORGE_DEVICE_SMS",
    "FORGE_DEVICE_SMEM",
    "FORGE_REQUIRE_GPU",
];

#[cfg(test)]
pub(crate) fn clear_env_vars() {
    for k in ENV_KEYS {
        std::env::remove_var(k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = lock();
        clear_env_vars();
        let cfg = load().unwrap();
        assert_eq!(cfg.cache_dir, None);
        assert_eq!(cfg.max_cached_artifacts, 256);
        assert_eq!(cfg.pool.init_pool_size, 64 * 1024 * 1024);
        assert_eq!(cfg.pool.max_pool_size, 4 * 1024 * 1024 * 1024);
        assert_eq!(cfg.pool.grow_size, 32 * 1024 * 1024);
        assert_eq!(cfg.compiler, None);
        assert!(cfg.compiler_flags.is_empty());
        assert_eq!(cfg.opt_level, 3);
        assert_eq!(cfg.device.backend, DeviceBackend::Cpu);
        assert_eq!(cfg.device.multiprocessor_count, 1);
        assert_eq!(cfg.device.max_shared_memory_per_block, 48 * 1024);
        assert_eq!(cfg.arch(), DEFAULT_ARCH);
        assert!(!cfg.device.require_gpu);
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = lock();
        clear_env_vars();
        std::env::set_var("FORGE_CACHE_DIR", "/tmp/forge-cache");
        std::env::set_var("FORGE_MAX_CACHED_ARTIFACTS", "32");
        std::env::set_var("FORGE_COMPILER_FLAGS", "-lineinfo  --use_fast_math");
        std::env::set_var("FORGE_DEVICE_BACKEND", "cuda");
        std::env::set_var("FORGE_DEVICE_CC", "90");
        std::env::set_var("FORGE_DEVICE_SMS", "132");
        let cfg = load().unwrap();
        assert_eq!(cfg.cache_dir, Some(PathBuf::from("/tmp/forge-cache")));
        assert_eq!(cfg.max_cached_artifacts, 32);
        assert_eq!(cfg.compiler_flags, vec!["-lineinfo", "--use_fast_math"]);
        assert_eq!(cfg.device.backend, DeviceBackend::Cuda);
        assert_eq!(cfg.device.multiprocessor_count, 132);
        // CUDA preset for sm80+
        assert_eq!(cfg.device.max_shared_memory_per_block, 163 * 1024);
        assert_eq!(cfg.arch(), 90);
        assert_eq!(cfg.compile_options().arch, 90);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = lock();
        clear_env_vars();
        std::env::set_var("FORGE_MAX_CACHED_ARTIFACTS", "lots");
        std::env::set_var("FORGE_DEVICE_BACKEND", "tpu");
        std::env::set_var("FORGE_OPT_LEVEL", "fast");
        std::env::set_var("FORGE_REQUIRE_GPU", "maybe");
        let cfg = load().unwrap();
        assert_eq!(cfg.max_cached_artifacts, 256);
        assert_eq!(cfg.device.backend, DeviceBackend::Cpu);
        assert_eq!(cfg.opt_level, 3);
        assert!(!cfg.device.require_gpu);
        clear_env_vars();
    }

    #[test]
    fn test_floors_and_clamps() {
        let _lock = lock();
        clear_env_vars();
        std::env::set_var("FORGE_MAX_CACHED_ARTIFACTS", "0");
        std::env::set_var("FORGE_POOL_INIT_BYTES", "1048576");
        std::env::set_var("FORGE_POOL_MAX_BYTES", "4096");
        std::env::set_var("FORGE_POOL_GROW_BYTES", "1");
        std::env::set_var("FORGE_OPT_LEVEL", "9");
        std::env::set_var("FORGE_DEVICE_SMS", "0");
        let cfg = load().unwrap();
        assert_eq!(cfg.max_cached_artifacts, 1);
        assert_eq!(cfg.pool.max_pool_size, 4096);
        assert_eq!(cfg.pool.init_pool_size, 4096, "init must not exceed max");
        assert_eq!(cfg.pool.grow_size, POOL_ALIGNMENT);
        assert_eq!(cfg.opt_level, 3);
        assert_eq!(cfg.device.multiprocessor_count, 1);
        clear_env_vars();
    }

    #[test]
    fn test_file_values_and_env_precedence() {
        let _lock = lock();
        clear_env_vars();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.toml");
        std::fs::write(
            &path,
            r#"
[cache]
dir = "/var/cache/forge"
max_artifacts = 64

[pool]
init_bytes = 0
max_bytes = 1073741824

[compiler]
program = "/opt/intel/bin/icpx"
flags = ["-fsycl-device-code-split=per_kernel"]
include_paths = ["/opt/cutlass/include"]

[device]
backend = "sycl"
compute_capability = 11
multiprocessors = 64
"#,
        )
        .unwrap();
        std::env::set_var("FORGE_CONFIG_FILE", &path);
        std::env::set_var("FORGE_MAX_CACHED_ARTIFACTS", "16");

        let cfg = load().unwrap();
        assert_eq!(cfg.config_file.as_deref(), Some(path.as_path()));
        assert_eq!(cfg.cache_dir, Some(PathBuf::from("/var/cache/forge")));
        assert_eq!(cfg.max_cached_artifacts, 16, "env wins over file");
        assert_eq!(cfg.pool.init_pool_size, 0);
        assert_eq!(cfg.pool.max_pool_size, 1 << 30);
        assert_eq!(cfg.include_paths, vec![PathBuf::from("/opt/cutlass/include")]);
        assert_eq!(cfg.device.backend, DeviceBackend::Sycl);
        assert_eq!(cfg.arch(), 11);
        assert_eq!(cfg.build_compiler().name(), "icpx");
        clear_env_vars();
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let _lock = lock();
        clear_env_vars();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[pool]\nunknown_key = 1\n").unwrap();
        std::env::set_var("FORGE_CONFIG_FILE", &path);
        assert!(matches!(load(), Err(ConfigError::Parse { .. })));

        std::env::set_var("FORGE_CONFIG_FILE", dir.path().join("missing.toml"));
        assert!(matches!(load(), Err(ConfigError::Read { .. })));
        clear_env_vars();
    }

    #[test]
    fn test_backend_config_and_effective_summary() {
        let _lock = lock();
        clear_env_vars();
        let cfg = load().unwrap();
        let backend = cfg.backend_config();
        assert_eq!(backend.artifacts.max_memory_entries, 256);
        assert_eq!(backend.artifacts.options.arch, DEFAULT_ARCH);
        assert_eq!(cfg.build_compiler().name(), "mock");

        let eff = cfg.effective_config();
        assert_eq!(eff.compiler, "mock");
        assert_eq!(eff.device_backend, "cpu");
        let json = serde_json::to_value(&eff).unwrap();
        assert_eq!(json["pool_grow_bytes"], 32 * 1024 * 1024);
    }

    #[test]
    fn test_defaults_ignore_environment() {
        let _lock = lock();
        clear_env_vars();
        std::env::set_var("FORGE_MAX_CACHED_ARTIFACTS", "7");
        let cfg = defaults();
        assert_eq!(cfg.max_cached_artifacts, 256);
        assert_eq!(
            cfg.effective_config().device_memory,
            load().unwrap().device.total_memory
        );
        clear_env_vars();
    }
}
