//! Stack-based bytecode virtual machine for CodeFusion images.
//!
//! An image is decoded into a [`module::Module`] by the [`image`] loader and
//! executed by a [`vm::Machine`], one instruction per [`vm::Machine::step`].
//!
//! # Architecture
//!
//! - **Evaluation stack**: fixed capacity, untagged 8-byte
//!   [`Word`](crate::types::word::Word)s
//! - **Pool stack**: addresses of the pool allocations made by `MALLOC_POOL`
//! - **Modules**: module 0 is the bootstrap image; `INT 9` links further
//!   modules which `VCALL`/`RET` move between
//! - **Interrupts**: 255 host service slots, see [`interrupts`]
//! - **Guest memory**: pool, array and raw allocations plus every module
//!   memory segment live in one guest heap of bounds-checked regions
//!
//! # Modules
//!
//! - [`address_table`]: pool key to allocation size table
//! - [`builder`]: image encoder
//! - [`errors`]: load, link and execution errors
//! - [`image`]: image header and loader
//! - [`interrupts`]: interrupt table and host services
//! - [`isa`]: instruction set definition and opcode mappings
//! - [`linker`]: dynamic module linking
//! - [`module`]: loaded program units
//! - [`vm`]: the machine and its dispatch loop

pub mod address_table;
pub mod builder;
pub mod errors;
pub mod image;
pub mod interrupts;
pub mod isa;
#[cfg(test)]
mod isa_static_check;
pub mod linker;
pub mod module;
pub mod vm;
