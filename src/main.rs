//! kernel-forge-cli entry point.
//!
//! ## CLI Subcommands
//!
//! - `device` - Show detected devices
//! - `cache stats|list|clear|warm` - Inspect or fill the disk artifact cache
//! - `config show|defaults|validate` - Inspect `FORGE_*` configuration
//! - `emit gemm|conv2d|reduction` - Print generated module source

use std::process::ExitCode;

use kernel_forge::cli::{cache_cmd, config_cmd, device_cmd, emit_cmd, flag_value, has_flag, EXIT_FAILURE};
use kernel_forge::config;
use kernel_forge::telemetry::{init_logging, LogConfig, LogFormat};

fn exit(code: i32) -> ExitCode {
    ExitCode::from(code as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    if let Err(e) = init_logging(&LogConfig::from_env(LogFormat::Compact)) {
        eprintln!("Logging disabled: {}", e);
    }

    let rest = args.get(2..).unwrap_or(&[]);
    let json = has_flag(rest, "--json");

    match command {
        "device" | "devices" => exit(device_cmd::run_device(json)),
        "cache" => {
            let subcommand = rest.first().map(|s| s.as_str()).unwrap_or("stats");
            match subcommand {
                "stats" => exit(cache_cmd::run_stats(json)),
                "list" => exit(cache_cmd::run_list(json)),
                "clear" => exit(cache_cmd::run_clear()),
                "warm" => {
                    let jobs = match flag_value(rest, "--jobs") {
                        Ok(Some(v)) => match v.parse::<usize>() {
                            Ok(n) => Some(n),
                            Err(_) => {
                                eprintln!("Invalid --jobs: {}", v);
                                return exit(EXIT_FAILURE);
                            }
                        },
                        Ok(None) => None,
                        Err(e) => {
                            eprintln!("{}", e);
                            return exit(EXIT_FAILURE);
                        }
                    };
                    exit(cache_cmd::run_warm(jobs).await)
                }
                _ => {
                    eprintln!("Unknown cache subcommand: {}", subcommand);
                    print_command_help("cache");
                    ExitCode::FAILURE
                }
            }
        }
        "config" => {
            let subcommand = rest.first().map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => exit(config_cmd::run_show(json)),
                "defaults" => {
                    config_cmd::run_defaults(json);
                    ExitCode::SUCCESS
                }
                "validate" => exit(config_cmd::run_validate()),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        "emit" => {
            let default_arch = config::load().map(|c| c.arch()).unwrap_or(80);
            exit(emit_cmd::run_emit(rest, default_arch))
        }
        "help" | "--help" | "-h" => {
            match rest.first() {
                Some(subcommand) => print_command_help(subcommand),
                None => print_usage(),
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("kernel-forge {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    eprintln!(
        "kernel-forge v{}

USAGE:
    kernel-forge-cli <COMMAND> [OPTIONS]

COMMANDS:
    device       Show detected devices and the active one
    cache        Inspect or fill the disk artifact cache (stats, list, clear, warm)
    config       Inspect configuration (show, defaults, validate)
    emit         Print generated source (gemm, conv2d, reduction)
    version      Show version information
    help         Show this help message

OPTIONS:
    -h, --help     Show help for command
    -V, --version  Show version information
    --json         JSON output where supported

ENVIRONMENT:
    FORGE_CONFIG_FILE   TOML config file
    FORGE_CACHE_DIR     Disk artifact cache directory
    FORGE_COMPILER      Kernel compiler binary (nvcc, icpx)
    FORGE_DEVICE_*      Device description (BACKEND, CC, SMS, MEMORY, SMEM)
    FORGE_LOG_LEVEL     Log filter (info, kernel_forge::compiler=debug)

EXIT CODES:
    0  Success
    1  Failure
    2  Configuration error
",
        env!("CARGO_PKG_VERSION")
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "device" | "devices" => {
            eprintln!(
                "kernel-forge-cli device - Show devices

USAGE:
    kernel-forge-cli device [--json]

DESCRIPTION:
    Lists the CPU fallback and any device described through FORGE_DEVICE_*
    variables, marking the one a backend would select.
"
            );
        }
        "cache" => {
            eprintln!(
                "kernel-forge-cli cache - Manage the artifact cache

USAGE:
    kernel-forge-cli cache <SUBCOMMAND> [OPTIONS]

SUBCOMMANDS:
    stats          Entry count and size of the disk cache
    list           Cached artifacts, oldest first
    clear          Delete every cached artifact
    warm           Compile the standard kernel set into the cache

OPTIONS:
    --json         JSON output (stats, list)
    --jobs N       Parallel compiles for warm (default: CPU count)

EXAMPLES:
    FORGE_CACHE_DIR=/var/cache/forge kernel-forge-cli cache warm --jobs 4
    kernel-forge-cli cache list --json
"
            );
        }
        "config" => {
            eprintln!(
                "kernel-forge-cli config - Inspect configuration

USAGE:
    kernel-forge-cli config <SUBCOMMAND> [--json]

SUBCOMMANDS:
    show           Effective configuration
    defaults       Built-in defaults
    validate       Check for settings that will not behave as intended
"
            );
        }
        "emit" => {
            eprintln!(
                "kernel-forge-cli emit - Print generated module source

USAGE:
    kernel-forge-cli emit <gemm|conv2d|reduction> [OPTIONS]

OPTIONS:
    --arch N           Target architecture (default: configured device)
    --dtype T          f16, bf16 or f32 (default: f16)
    --kind K           gemm: universal, streamk, grouped
    --layout LL        gemm: operand layouts, e.g. tn, nt
    --conv C           conv2d: fprop, dgrad, wgrad

EXAMPLES:
    kernel-forge-cli emit gemm --arch 90 --dtype bf16 --layout nt
    kernel-forge-cli emit conv2d --conv dgrad
"
            );
        }
        _ => {
            eprintln!(
                "No detailed help available for '{}'. Use 'kernel-forge-cli help' for general usage.",
                command
            );
        }
    }
}
