//! Loaded program units.
//!
//! A [`Module`] is everything one image contributes to a running machine:
//! its decoded instructions, the pool-size table, exported symbols and the
//! flat memory segment. Dynamically linked modules additionally remember
//! where they came from so the linker can release them.

use crate::types::encoding::{Encode, EncodeSink};
use crate::types::word::Word;
use crate::virtual_machine::address_table::AddressSizeTable;
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::isa::{Opcode, has_operand};
use crate::virtual_machine::linker::NativeHandle;
use bytes::BytesMut;
use std::fmt;

/// One decoded instruction.
///
/// The opcode is kept as the raw byte: an unassigned opcode is a runtime
/// fault (`IllegalOpcode`), not a load error.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Instruction {
    pub opcode: u8,
    pub operand: Word,
}

impl Instruction {
    /// Instruction without an operand.
    pub const fn new(opcode: Opcode) -> Self {
        Self {
            opcode: opcode as u8,
            operand: Word::ZERO,
        }
    }

    /// Instruction carrying `operand`.
    pub const fn with_operand(opcode: Opcode, operand: u64) -> Self {
        Self {
            opcode: opcode as u8,
            operand: Word::from_u64(operand),
        }
    }

    /// Decodes the opcode byte.
    pub fn opcode(&self) -> Result<Opcode, VmError> {
        Opcode::try_from(self.opcode)
    }
}

/// Number of bytes needed to hold `value` (0 for 0).
fn operand_width(value: u64) -> u8 {
    (8 - value.leading_zeros() / 8) as u8
}

impl Encode for Instruction {
    /// Opcode byte, then for operand carriers the minimal little-endian
    /// operand: length byte `n` followed by `n` bytes.
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.opcode.encode(out);
        if has_operand(self.opcode) {
            let value = self.operand.as_u64();
            let width = operand_width(value);
            width.encode(out);
            out.write(&value.to_le_bytes()[..width as usize]);
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Opcode::try_from(self.opcode) {
            Ok(op) if op.has_operand() => write!(f, "{} {}", op.mnemonic(), self.operand),
            Ok(op) => write!(f, "{}", op.mnemonic()),
            Err(_) => write!(f, "<illegal {:#04x}>", self.opcode),
        }
    }
}

/// Exported name and its address inside the owning module.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
}

impl Symbol {
    pub fn new(name: impl Into<String>, address: u64) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

impl Encode for Symbol {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        (self.name.len() as u16).encode(out);
        out.write(self.name.as_bytes());
        self.address.encode(out);
    }
}

/// Flat memory segment of a module.
///
/// Freshly loaded modules hold their bytes; once the machine installs the
/// module the bytes move into the guest heap and only the mapping remains.
#[derive(Debug)]
pub enum MemorySegment {
    Detached(BytesMut),
    Mapped { base: u64, len: usize },
}

impl MemorySegment {
    pub fn len(&self) -> usize {
        match self {
            MemorySegment::Detached(bytes) => bytes.len(),
            MemorySegment::Mapped { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Guest address of the first byte, if mapped.
    pub fn base(&self) -> Option<u64> {
        match self {
            MemorySegment::Detached(_) => None,
            MemorySegment::Mapped { base, .. } => Some(*base),
        }
    }
}

impl Default for MemorySegment {
    fn default() -> Self {
        MemorySegment::Detached(BytesMut::new())
    }
}

/// One loaded program unit.
#[derive(Debug, Default)]
pub struct Module {
    pub instructions: Vec<Instruction>,
    pub pool: AddressSizeTable,
    pub symbols: Vec<Symbol>,
    pub memory: MemorySegment,
    /// Instruction index execution starts at (bootstrap module only).
    pub entry_point: u64,
    /// Source path of a dynamically linked module.
    pub path: Option<String>,
    pub(crate) handle: Option<NativeHandle>,
}

impl Module {
    /// Looks up an exported symbol by exact name.
    pub fn symbol(&self, name: &[u8]) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name.as_bytes() == name)
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// True if `address` indexes an instruction of this module.
    pub fn contains(&self, address: u64) -> bool {
        address < self.instructions.len() as u64
    }
}
