//! CodeFusion image inspector.
//!
//! Prints the sections of an image without executing it.
//!
//! # Usage
//! ```text
//! cfdump <image> [OPTIONS]
//! ```
//!
//! # Options
//! - `-h`: Header
//! - `-p`: Pool table
//! - `-s`: Symbols
//! - `-d`: Disassembly
//!
//! Without options every section is printed.

use bytes::{BufMut, BytesMut};
use codefusion::error;
use codefusion::virtual_machine::errors::LoadError;
use codefusion::virtual_machine::image::{Header, ImageLoader, PoolEntry};
use codefusion::virtual_machine::module::{Instruction, Symbol};
use std::env;
use std::fs::File;
use std::io;
use std::process;

/// Every section of an image, decoded.
struct Dump {
    header: Header,
    pool: Vec<PoolEntry>,
    instructions: Vec<Instruction>,
    symbols: Vec<Symbol>,
    memory_len: usize,
}

fn decode(buffer: BytesMut) -> Result<Dump, LoadError> {
    let mut loader = ImageLoader::new(buffer);
    let header = loader.load_header()?;
    let pool = loader.load_pool_entries(&header)?;
    let instructions = loader.load_program(&header)?;
    let symbols = loader.load_symbols(&header)?;
    let memory_len = loader.load_memory(&header)?.len();
    loader.finish()?;
    Ok(Dump {
        header,
        pool,
        instructions,
        symbols,
        memory_len,
    })
}

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut path: Option<&str> = None;
    let mut header = false;
    let mut pool = false;
    let mut symbols = false;
    let mut disassembly = false;

    for arg in &args[1..] {
        match arg.as_str() {
            "-h" => header = true,
            "-p" => pool = true,
            "-s" => symbols = true,
            "-d" => disassembly = true,
            "--help" => {
                print_usage(&args[0]);
                process::exit(0);
            }
            other if other.starts_with('-') => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
            other => path = Some(other),
        }
    }

    let Some(path) = path else {
        error!("Missing file");
        print_usage(&args[0]);
        process::exit(1);
    };

    if !(header || pool || symbols || disassembly) {
        (header, pool, symbols, disassembly) = (true, true, true, true);
    }

    let buffer = read_image(path).unwrap_or_else(|e| {
        error!("Cannot read {path}: {e}");
        process::exit(1);
    });
    let dump = decode(buffer).unwrap_or_else(|e| {
        error!("Cannot decode {path}: {e}");
        process::exit(1);
    });

    if header {
        print_header(&dump);
    }
    if pool {
        println!("Pool:");
        for entry in &dump.pool {
            println!("{:>15}: {} bytes", format!("{:#x}", entry.address), entry.size);
        }
        println!();
    }
    if symbols {
        println!("Symbols:");
        for symbol in &dump.symbols {
            println!("{:>15}: {:#x}", symbol.name, symbol.address);
        }
        println!();
    }
    if disassembly {
        println!("Program:");
        let width = dump.instructions.len().max(1).to_string().len();
        for (index, instruction) in dump.instructions.iter().enumerate() {
            let marker = if index as u64 == dump.header.entry_point { '>' } else { ' ' };
            println!("{marker} {index:>width$}  {instruction}");
        }
        println!();
    }
}

fn print_header(dump: &Dump) {
    let h = &dump.header;
    println!("Header:");
    println!("{:>15}: {}", "Magic", String::from_utf8_lossy(&h.magic));
    println!("{:>15}: {}", "Version", h.version);
    println!("{:>15}: {}", "Flags", h.flags);
    println!("{:>15}: {}", "EntryPoint", h.entry_point);
    println!("{:>15}: {}", "Pools", h.pool_size);
    println!("{:>15}: {}", "Instructions", h.program_size);
    println!("{:>15}: {}", "Symbols", h.symbol_size);
    println!("{:>15}: {}", "Memory", dump.memory_len);
    println!();
}

fn read_image(path: &str) -> io::Result<BytesMut> {
    let mut file = File::open(path)?;
    let mut writer = BytesMut::new().writer();
    io::copy(&mut file, &mut writer)?;
    Ok(writer.into_inner())
}

fn print_usage(program: &str) {
    eprintln!("Usage: {program} <image> [-h] [-p] [-s] [-d]");
    eprintln!();
    eprintln!("  -h   Header");
    eprintln!("  -p   Pool table");
    eprintln!("  -s   Symbols");
    eprintln!("  -d   Disassembly");
}
