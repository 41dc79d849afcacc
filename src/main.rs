//! CodeFusion image runner.
//!
//! Loads an executable image as module 0 and steps the machine until it
//! halts.
//!
//! # Usage
//! ```text
//! codefusion <image> [OPTIONS]
//! ```
//!
//! # Arguments
//! - `image`: Executable CodeFusion image
//!
//! # Options
//! - `--stack <n>`: Evaluation stack capacity (default 1024)
//! - `--pools <n>`: Pool-allocation stack capacity (default 1024)
//! - `--modules <n>`: Module table capacity, bootstrap included (default 64)
//! - `--quiet`: Disable logging
//!
//! # Exit code
//! A guest `exit` interrupt keeps its code; any other halt exits with the
//! halt status number. The `CF_LOG` environment variable (`info`, `warn`,
//! `error`, `off`) filters log output.

use bytes::{BufMut, BytesMut};
use codefusion::utils::log::{Level, set_min_level};
use codefusion::virtual_machine::image::load_executable;
use codefusion::virtual_machine::interrupts::InterruptTable;
use codefusion::virtual_machine::linker::DynamicLinker;
use codefusion::virtual_machine::vm::{Machine, MachineConfig};
use codefusion::{error, info};
use std::env;
use std::fs::File;
use std::io;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    if let Ok(name) = env::var("CF_LOG") {
        match Level::parse(&name) {
            Ok(level) => set_min_level(level),
            Err(e) => {
                eprintln!("CF_LOG: {e}");
                process::exit(1);
            }
        }
    }

    let image_path = &args[1];
    let mut config = MachineConfig::default();

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            flag @ ("--stack" | "--pools" | "--modules") => {
                i += 1;
                let value = parse_capacity(flag, args.get(i));
                match flag {
                    "--stack" => config.stack_capacity = value,
                    "--pools" => config.pool_capacity = value,
                    _ => config.module_capacity = value,
                }
                i += 1;
            }
            "--quiet" => {
                set_min_level(None);
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let buffer = read_image(image_path).unwrap_or_else(|e| {
        error!("Cannot read {image_path}: {e}");
        process::exit(1);
    });

    let module = load_executable(buffer).unwrap_or_else(|e| {
        error!("Cannot load {image_path}: {e}");
        process::exit(1);
    });

    let interrupts = InterruptTable::standard();
    let mut machine = Machine::new(module, &interrupts, linker(), config).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(e.exit_code());
    });

    info!("running {image_path}");
    let halt = machine.run();
    // `process::exit` skips destructors; release linked modules first.
    drop(machine);
    process::exit(halt.exit_code());
}

/// Reads the whole image into one buffer the loaded module can keep.
fn read_image(path: &str) -> io::Result<BytesMut> {
    let mut file = File::open(path)?;
    let mut writer = BytesMut::new().writer();
    io::copy(&mut file, &mut writer)?;
    Ok(writer.into_inner())
}

fn parse_capacity(flag: &str, value: Option<&String>) -> usize {
    let Some(value) = value else {
        error!("{flag} requires an argument");
        process::exit(1);
    };
    match value.parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => {
            error!("Invalid value for {flag}: '{value}' is not a positive number");
            process::exit(1);
        }
    }
}

#[cfg(feature = "native")]
fn linker() -> DynamicLinker {
    DynamicLinker::new(codefusion::virtual_machine::linker::native::LibraryLoader::new())
}

#[cfg(not(feature = "native"))]
fn linker() -> DynamicLinker {
    DynamicLinker::default()
}

fn print_usage(program: &str) {
    eprintln!("Usage: {program} <image> [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --stack <n>     Evaluation stack capacity (default 1024)");
    eprintln!("  --pools <n>     Pool-allocation stack capacity (default 1024)");
    eprintln!("  --modules <n>   Module table capacity (default 64)");
    eprintln!("  --quiet         Disable logging");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  CF_LOG          Log level: info, warn, error or off");
}
