//! `device` subcommand: show detected devices and the active one.

use crate::device::{DeviceInfo, DeviceManager};

use super::{load_config, EXIT_CONFIG, EXIT_OK};

pub fn run_device(json: bool) -> i32 {
    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    let manager = match DeviceManager::new(cfg.device) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Device error: {}", e);
            return EXIT_CONFIG;
        }
    };

    if json {
        let report = serde_json::json!({
            "active": manager.active_device().as_ref(),
            "available": manager.available_devices(),
        });
        println!("{}", report);
        return EXIT_OK;
    }

    println!(
        "{:<8} {:<6} {:<32} {:>6} {:>6} {:>12} {:>14}",
        "ACTIVE", "INDEX", "NAME", "CC", "SMS", "SMEM (KB)", "MEMORY (MB)"
    );
    for device in manager.available_devices() {
        print_row(device, device == manager.active_device().as_ref());
    }
    EXIT_OK
}

fn print_row(device: &DeviceInfo, active: bool) {
    let smem = if device.max_shared_memory_per_block == u32::MAX {
        "-".to_string()
    } else {
        (device.max_shared_memory_per_block / 1024).to_string()
    };
    println!(
        "{:<8} {:<6} {:<32} {:>6} {:>6} {:>12} {:>14}",
        if active { "*" } else { "" },
        device.index,
        device.name,
        device.compute_capability,
        device.multiprocessor_count,
        smem,
        device.total_memory / (1024 * 1024),
    );
}
