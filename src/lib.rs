//! CodeFusion virtual machine library.
//!
//! Loads CodeFusion images, links modules at run time and executes them on a
//! stack-based virtual machine.

pub mod types;
pub mod utils;
pub mod virtual_machine;
