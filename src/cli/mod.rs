// Copyright 2024-2026 Kernel Forge Contributors
// Licensed under the Apache License, Version 2.0

//! CLI subcommands for `kernel-forge-cli`.
//!
//! ## Usage
//!
//! ```bash
//! kernel-forge-cli device            # Show the active device
//! kernel-forge-cli cache stats       # Disk cache summary
//! kernel-forge-cli emit gemm --arch 90 --dtype bf16
//! kernel-forge-cli config validate   # Check FORGE_* settings
//! ```

pub mod cache_cmd;
pub mod catalog;
pub mod config_cmd;
pub mod device_cmd;
pub mod emit_cmd;

use crate::config::{self, ForgeConfig};

/// Command succeeded.
pub const EXIT_OK: i32 = 0;
/// Command ran but failed.
pub const EXIT_FAILURE: i32 = 1;
/// Configuration is unusable.
pub const EXIT_CONFIG: i32 = 2;

/// Load configuration, reporting errors on stderr.
pub fn load_config() -> Result<ForgeConfig, i32> {
    config::load().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        EXIT_CONFIG
    })
}

/// Whether `flag` appears among `args`.
pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Value following `--name`, if present.
pub fn flag_value<'a>(args: &'a [String], name: &str) -> Result<Option<&'a str>, String> {
    match args.iter().position(|a| a == name) {
        Some(i) => args
            .get(i + 1)
            .map(|v| Some(v.as_str()))
            .ok_or_else(|| format!("Missing value for {}", name)),
        None => Ok(None),
    }
}
