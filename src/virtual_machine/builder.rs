//! Image encoder.
//!
//! Writes images in the layout read by [`ImageLoader`](super::image::ImageLoader).
//! Operands are emitted in the fewest little-endian bytes that hold them.

use crate::types::encoding::{Encode, EncodeSink};
use crate::virtual_machine::image::{CURRENT_VERSION, Flags, Header, MAGIC, PoolEntry};
use crate::virtual_machine::isa::Opcode;
use crate::virtual_machine::module::{Instruction, Symbol};

/// Builder for a complete image.
#[derive(Clone, Debug, Default)]
pub struct ImageBuilder {
    flags: Flags,
    entry_point: u64,
    pool: Vec<PoolEntry>,
    instructions: Vec<Instruction>,
    symbols: Vec<Symbol>,
    memory: Vec<u8>,
}

impl ImageBuilder {
    /// Starts an image flagged executable.
    pub fn executable() -> Self {
        Self {
            flags: Flags::EXECUTABLE,
            ..Self::default()
        }
    }

    /// Starts an image flagged as a library.
    pub fn library() -> Self {
        Self {
            flags: Flags::LIBRARY,
            ..Self::default()
        }
    }

    /// Replaces the header flags.
    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn entry_point(mut self, entry_point: u64) -> Self {
        self.entry_point = entry_point;
        self
    }

    /// Records the allocation size for pool key `address`.
    pub fn pool_entry(mut self, address: u64, size: u16) -> Self {
        self.pool.push(PoolEntry { address, size });
        self
    }

    pub fn instruction(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    /// Appends an instruction without operand.
    pub fn op(self, opcode: Opcode) -> Self {
        self.instruction(Instruction::new(opcode))
    }

    /// Appends an instruction with operand.
    pub fn op_with(self, opcode: Opcode, operand: u64) -> Self {
        self.instruction(Instruction::with_operand(opcode, operand))
    }

    /// Appends `PUSH` of a signed value.
    pub fn push_i64(self, value: i64) -> Self {
        self.op_with(Opcode::Push, value as u64)
    }

    /// Appends `PUSH` of a float value.
    pub fn push_f64(self, value: f64) -> Self {
        self.op_with(Opcode::Push, value.to_bits())
    }

    pub fn symbol(mut self, name: impl Into<String>, address: u64) -> Self {
        self.symbols.push(Symbol::new(name, address));
        self
    }

    /// Sets the initial contents of the memory segment.
    pub fn memory(mut self, bytes: &[u8]) -> Self {
        self.memory = bytes.to_vec();
        self
    }

    /// Index the next appended instruction will get.
    pub fn next_address(&self) -> u64 {
        self.instructions.len() as u64
    }

    pub fn pool_entries(&self) -> &[PoolEntry] {
        &self.pool
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Header describing the current contents.
    pub fn header(&self) -> Header {
        Header {
            magic: MAGIC,
            version: CURRENT_VERSION,
            flags: self.flags,
            entry_point: self.entry_point,
            pool_size: self.pool.len() as u64,
            program_size: self.instructions.len() as u64,
            symbol_size: self.symbols.len() as u64,
            memory_size: self.memory.len() as u64,
        }
    }

    /// Encodes the image.
    pub fn build(&self) -> Vec<u8> {
        self.to_bytes()
    }
}

impl Encode for ImageBuilder {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.header().encode(out);
        for entry in &self.pool {
            entry.encode(out);
        }
        for instruction in &self.instructions {
            instruction.encode(out);
        }
        for symbol in &self.symbols {
            symbol.encode(out);
        }
        out.write(&self.memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_image_is_header_only() {
        let bytes = ImageBuilder::executable().build();
        assert_eq!(bytes.len(), 46);
        assert_eq!(&bytes[..3], b".CF");
        assert_eq!(u16::from_le_bytes([bytes[3], bytes[4]]), CURRENT_VERSION);
    }

    #[test]
    fn sections_follow_header_in_order() {
        let bytes = ImageBuilder::library()
            .pool_entry(1, 2)
            .op_with(Opcode::Push, 0xAB)
            .symbol("s", 0)
            .memory(&[9, 9])
            .build();
        let body = &bytes[46..];
        assert_eq!(&body[..10], &[1, 0, 0, 0, 0, 0, 0, 0, 2, 0]);
        assert_eq!(&body[10..13], &[Opcode::Push as u8, 1, 0xAB]);
        assert_eq!(&body[13..16], &[1, 0, b's']);
        assert_eq!(&body[24..], &[9, 9]);
    }

    #[test]
    fn header_counts_match_contents() {
        let builder = ImageBuilder::executable()
            .entry_point(1)
            .op(Opcode::Nop)
            .op(Opcode::Nop)
            .symbol("a", 1);
        let header = builder.header();
        assert_eq!(header.program_size, 2);
        assert_eq!(header.symbol_size, 1);
        assert_eq!(header.entry_point, 1);
        assert_eq!(builder.next_address(), 2);
    }
}
