// Copyright 2024-2026 Kernel Forge Contributors
// Licensed under the Apache License, Version 2.0

//! Config CLI subcommands: show, defaults, validate.
//!
//! These read `FORGE_*` variables and the optional config file directly; no
//! backend is constructed.

use crate::config::{self, EffectiveConfig, ForgeConfig};
use crate::device::DeviceBackend;

use super::{load_config, EXIT_FAILURE, EXIT_OK};

/// Print effective config as key-value pairs to stdout.
pub fn run_show(json: bool) -> i32 {
    match load_config() {
        Ok(cfg) => {
            print_config(&cfg.effective_config(), json);
            EXIT_OK
        }
        Err(code) => code,
    }
}

/// Print default config values (no env or file overrides) to stdout.
pub fn run_defaults(json: bool) {
    print_config(&config::defaults().effective_config(), json);
}

/// Validate configuration for obvious misconfigurations.
///
/// Returns 0 if valid, 1 if any warnings are found, 2 if it cannot be loaded.
pub fn run_validate() -> i32 {
    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    let warnings = validation_warnings(&cfg);
    for w in &warnings {
        eprintln!("WARNING: {}", w);
    }
    if warnings.is_empty() {
        println!("Configuration is valid.");
        EXIT_OK
    } else {
        EXIT_FAILURE
    }
}

/// Settings that load but will not behave as intended.
pub fn validation_warnings(cfg: &ForgeConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    let device = &cfg.device;

    if device.backend != DeviceBackend::Cpu && device.compute_capability == 0 {
        warnings.push(format!(
            "FORGE_DEVICE_BACKEND={} without FORGE_DEVICE_CC; the CPU fallback will be used",
            device.backend.to_string().to_ascii_lowercase()
        ));
    }
    if device.require_gpu && device.backend == DeviceBackend::Cpu {
        warnings.push("FORGE_REQUIRE_GPU is set but the device backend is cpu".to_string());
    }
    if (cfg.pool.max_pool_size as u64) > device.total_memory {
        warnings.push(format!(
            "FORGE_POOL_MAX_BYTES ({}) exceeds FORGE_DEVICE_MEMORY ({})",
            cfg.pool.max_pool_size, device.total_memory
        ));
    }
    if let Some(compiler) = &cfg.compiler {
        if compiler.is_absolute() && !compiler.exists() {
            warnings.push(format!("FORGE_COMPILER {} does not exist", compiler.display()));
        }
    }
    if let Some(dir) = &cfg.cache_dir {
        if dir.exists() && !dir.is_dir() {
            warnings.push(format!("FORGE_CACHE_DIR {} is not a directory", dir.display()));
        }
    }
    warnings
}

fn print_config(cfg: &EffectiveConfig, json: bool) {
    if json {
        match serde_json::to_string_pretty(cfg) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Failed to serialize config: {}", e),
        }
        return;
    }
    println!("FORGE_CONFIG_FILE={}", cfg.config_file.as_deref().unwrap_or(""));
    println!("FORGE_CACHE_DIR={}", cfg.cache_dir.as_deref().unwrap_or(""));
    println!("FORGE_MAX_CACHED_ARTIFACTS={}", cfg.max_cached_artifacts);
    println!("FORGE_POOL_INIT_BYTES={}", cfg.pool_init_bytes);
    println!("FORGE_POOL_MAX_BYTES={}", cfg.pool_max_bytes);
    println!("FORGE_POOL_GROW_BYTES={}", cfg.pool_grow_bytes);
    println!("FORGE_COMPILER={}", cfg.compiler);
    println!("FORGE_COMPILER_FLAGS={}", cfg.compiler_flags);
    println!("FORGE_OPT_LEVEL={}", cfg.opt_level);
    println!("FORGE_DEVICE_BACKEND={}", cfg.device_backend);
    println!("FORGE_DEVICE_CC={}", cfg.device_cc);
    println!("FORGE_DEVICE_MEMORY={}", cfg.device_memory);
    println!("FORGE_DEVICE_SMS={}", cfg.device_sms);
    println!("FORGE_DEVICE_SMEM={}", cfg.device_smem);
    println!("FORGE_REQUIRE_GPU={}", cfg.require_gpu);
    println!("# compile arch: {}", cfg.arch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{clear_env_vars, ENV_LOCK};

    #[test]
    fn test_validate_passes_with_defaults() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        assert_eq!(run_validate(), 0, "default config should pass validation");
    }

    #[test]
    fn test_gpu_backend_without_capability_warns() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        std::env::set_var("FORGE_DEVICE_BACKEND", "cuda");
        let cfg = config::load().unwrap();
        let warnings = validation_warnings(&cfg);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("FORGE_DEVICE_CC"));
        assert_eq!(run_validate(), 1);
        clear_env_vars();
    }

    #[test]
    fn test_pool_larger_than_device_warns() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        std::env::set_var("FORGE_DEVICE_MEMORY", "1048576");
        let cfg = config::load().unwrap();
        assert!(validation_warnings(&cfg)
            .iter()
            .any(|w| w.contains("FORGE_POOL_MAX_BYTES")));
        clear_env_vars();
    }

    #[test]
    fn test_missing_compiler_warns() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        std::env::set_var("FORGE_COMPILER", "/nonexistent/bin/nvcc");
        let cfg = config::load().unwrap();
        assert!(validation_warnings(&cfg)
            .iter()
            .any(|w| w.contains("does not exist")));
        clear_env_vars();
    }

    #[test]
    fn test_unreadable_config_file_is_a_config_error() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        std::env::set_var("FORGE_CONFIG_FILE", "/nonexistent/forge.toml");
        assert_eq!(run_validate(), super::super::EXIT_CONFIG);
        assert_eq!(run_show(false), super::super::EXIT_CONFIG);
        clear_env_vars();
    }

    #[test]
    fn test_print_config_both_formats() {
        let cfg = config::defaults().effective_config();
        // Smoke-test: just call without panicking.
        print_config(&cfg, false);
        print_config(&cfg, true);
    }
}
