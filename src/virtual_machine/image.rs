//! Binary image loader.
//!
//! An image is a fixed header followed by four variable sections, read in
//! strict order over one cursor:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ magic ".CF" (3) │ version (2) │ flags (1) │ entry_point (8)  │
//! │ pool_size (8) │ program_size (8) │ symbol_size (8)           │
//! │ memory_size (8)                                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │ pool entries      pool_size × (address u64, size u16)        │
//! │ instructions      opcode u8 [n u8, n operand bytes]          │
//! │ symbols           symbol_size × (len u16, name, address u64) │
//! │ memory            memory_size raw bytes                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. The memory section is split off the image
//! buffer without copying and becomes the module's memory segment.

use crate::info;
use crate::types::encoding::{Decode, DecodeError, read_bytes, to_usize};
use crate::types::word::Word;
use crate::virtual_machine::address_table::AddressSizeTable;
use crate::virtual_machine::errors::LoadError;
use crate::virtual_machine::isa::has_operand;
use crate::virtual_machine::module::{Instruction, MemorySegment, Module, Symbol};
use crate::virtual_machine::vm::heap::MAX_REGION_LEN;
use bytes::{Buf, BytesMut};
use codefusion_derive::BinaryCodec;
use std::fmt;
use std::ops::BitOr;

/// Format tag at the start of every image.
pub const MAGIC: [u8; 3] = *b".CF";
/// The only image version this machine runs.
pub const CURRENT_VERSION: u16 = 1;

/// Header flag bits.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, BinaryCodec)]
pub struct Flags(pub u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const RELOCATABLE: Flags = Flags(0b0001);
    pub const EXECUTABLE: Flags = Flags(0b0010);
    pub const CONTAINS_ERROR: Flags = Flags(0b0100);
    pub const LIBRARY: Flags = Flags(0b1000);

    /// True if every bit of `other` is set.
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Flags::RELOCATABLE, "relocatable"),
            (Flags::EXECUTABLE, "executable"),
            (Flags::CONTAINS_ERROR, "contains-error"),
            (Flags::LIBRARY, "library"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", set.join(" | "))
        }
    }
}

/// Image header, laid out exactly as on disk.
#[derive(Clone, Debug, Eq, PartialEq, BinaryCodec)]
pub struct Header {
    pub magic: [u8; 3],
    pub version: u16,
    pub flags: Flags,
    pub entry_point: u64,
    pub pool_size: u64,
    pub program_size: u64,
    pub symbol_size: u64,
    pub memory_size: u64,
}

/// One address pool record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, BinaryCodec)]
pub struct PoolEntry {
    pub address: u64,
    pub size: u16,
}

/// Size of a [`PoolEntry`] on disk.
const POOL_ENTRY_LEN: usize = 10;

/// Sequential reader over one image buffer.
///
/// Call [`load_header`](Self::load_header), then the section loaders in
/// image order, then [`finish`](Self::finish).
pub struct ImageLoader {
    buffer: BytesMut,
}

impl ImageLoader {
    pub fn new(buffer: BytesMut) -> Self {
        Self { buffer }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.buffer.len()
    }

    /// Runs `read` over the unread bytes and advances past what it consumed.
    fn section<T>(
        &mut self,
        read: impl FnOnce(&mut &[u8]) -> Result<T, LoadError>,
    ) -> Result<T, LoadError> {
        let mut cursor: &[u8] = &self.buffer;
        let value = read(&mut cursor)?;
        let used = self.buffer.len() - cursor.len();
        self.buffer.advance(used);
        Ok(value)
    }

    /// Reads and validates the header.
    ///
    /// Magic and version are checked before any other field is decoded.
    pub fn load_header(&mut self) -> Result<Header, LoadError> {
        let mut peek: &[u8] = &self.buffer;
        let found = <[u8; 3]>::decode(&mut peek)?;
        if found != MAGIC {
            return Err(LoadError::BadMagic { found });
        }
        let version = u16::decode(&mut peek)?;
        if version != CURRENT_VERSION {
            return Err(LoadError::UnsupportedVersion {
                found: version,
                expected: CURRENT_VERSION,
            });
        }

        self.section(|cursor| Ok(Header::decode(cursor)?))
    }

    /// Reads the pool entries into a table sized by the entry count.
    pub fn load_pool(&mut self, header: &Header) -> Result<AddressSizeTable, LoadError> {
        Ok(self.load_pool_entries(header)?.into_iter().fold(
            AddressSizeTable::new(to_usize(header.pool_size)?),
            |mut table, entry| {
                table.put(entry.address, entry.size);
                table
            },
        ))
    }

    /// Reads the pool entries as written.
    pub fn load_pool_entries(&mut self, header: &Header) -> Result<Vec<PoolEntry>, LoadError> {
        let count = to_usize(header.pool_size)?;
        self.section(|cursor| {
            let mut entries = Vec::with_capacity(count.min(cursor.len() / POOL_ENTRY_LEN));
            for _ in 0..count {
                entries.push(PoolEntry::decode(cursor)?);
            }
            Ok(entries)
        })
    }

    /// Reads `program_size` instructions.
    pub fn load_program(&mut self, header: &Header) -> Result<Vec<Instruction>, LoadError> {
        let count = header.program_size;
        self.section(|cursor| {
            let mut program = Vec::with_capacity(to_usize(count)?.min(cursor.len()));
            for index in 0..count {
                let opcode = u8::decode(cursor)?;
                let operand = if has_operand(opcode) {
                    decode_operand(cursor, index)?
                } else {
                    Word::ZERO
                };
                program.push(Instruction { opcode, operand });
            }
            Ok(program)
        })
    }

    /// Reads `symbol_size` exported symbols.
    pub fn load_symbols(&mut self, header: &Header) -> Result<Vec<Symbol>, LoadError> {
        let count = header.symbol_size;
        self.section(|cursor| {
            let mut symbols = Vec::new();
            for index in 0..count {
                let len = u16::decode(cursor)? as usize;
                let name = read_bytes(cursor, len)?;
                let name = String::from_utf8(name.to_vec())
                    .map_err(|_| LoadError::InvalidSymbolName { index })?;
                let address = u64::decode(cursor)?;
                symbols.push(Symbol { name, address });
            }
            Ok(symbols)
        })
    }

    /// Splits the memory segment off the image buffer. The segment must fit
    /// in one heap region.
    pub fn load_memory(&mut self, header: &Header) -> Result<BytesMut, LoadError> {
        if header.memory_size > MAX_REGION_LEN {
            return Err(LoadError::MemoryTooLarge {
                len: header.memory_size,
                max: MAX_REGION_LEN,
            });
        }
        let len = to_usize(header.memory_size)?;
        if self.buffer.len() < len {
            return Err(DecodeError::UnexpectedEof {
                needed: len,
                available: self.buffer.len(),
            }
            .into());
        }
        Ok(self.buffer.split_to(len))
    }

    /// Fails if bytes remain after the memory segment.
    pub fn finish(self) -> Result<(), LoadError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(LoadError::TrailingBytes {
                remaining: self.buffer.len(),
            })
        }
    }

    /// Runs every stage and fills `module`.
    pub fn load_into(mut self, module: &mut Module) -> Result<Header, LoadError> {
        let header = self.load_header()?;
        if header.flags.contains(Flags::CONTAINS_ERROR) {
            return Err(LoadError::ContainsErrors);
        }
        module.pool = self.load_pool(&header)?;
        module.instructions = self.load_program(&header)?;
        module.symbols = self.load_symbols(&header)?;
        module.memory = MemorySegment::Detached(self.load_memory(&header)?);
        module.entry_point = header.entry_point;
        self.finish()?;
        Ok(header)
    }
}

/// Reads a length-prefixed operand and zero-extends it to a Word.
fn decode_operand(cursor: &mut &[u8], index: u64) -> Result<Word, LoadError> {
    let width = u8::decode(cursor)?;
    if width > 8 {
        return Err(LoadError::OperandTooWide { index, width });
    }
    let mut raw = [0u8; 8];
    raw[..width as usize].copy_from_slice(read_bytes(cursor, width as usize)?);
    Ok(Word::from_u64(u64::from_le_bytes(raw)))
}

/// Loads the bootstrap module. The image must be flagged executable.
pub fn load_executable(buffer: BytesMut) -> Result<Module, LoadError> {
    let mut module = Module::default();
    let header = ImageLoader::new(buffer).load_into(&mut module)?;
    if !header.flags.contains(Flags::EXECUTABLE) {
        return Err(LoadError::NotExecutable);
    }
    info!(
        "loaded image: {} instructions, {} pool entries, {} symbols, {} bytes of memory",
        header.program_size,
        header.pool_size,
        header.symbol_size,
        header.memory_size
    );
    Ok(module)
}

/// Populates `module` from a library image. The image must be flagged as a
/// library.
pub fn load_library_into(module: &mut Module, buffer: BytesMut) -> Result<(), LoadError> {
    let header = ImageLoader::new(buffer).load_into(module)?;
    if !header.flags.contains(Flags::LIBRARY) {
        return Err(LoadError::NotLibrary);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding::Encode;
    use crate::virtual_machine::builder::ImageBuilder;
    use crate::virtual_machine::isa::Opcode;

    fn sample() -> ImageBuilder {
        ImageBuilder::executable()
            .entry_point(1)
            .pool_entry(7, 24)
            .pool_entry(3, 8)
            .op(Opcode::Nop)
            .op_with(Opcode::Push, 0x1234_5678)
            .op_with(Opcode::Push, 0)
            .op_with(Opcode::Push, u64::MAX)
            .op(Opcode::IAdd)
            .op_with(Opcode::LoadMemory, 2)
            .symbol("main", 1)
            .symbol("helper", 4)
            .memory(b"hello\0")
    }

    #[test]
    fn round_trip_reproduces_every_section() {
        let builder = sample();
        let mut loader = ImageLoader::new(BytesMut::from(&builder.build()[..]));

        let header = loader.load_header().unwrap();
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.version, CURRENT_VERSION);
        assert_eq!(header.entry_point, 1);
        assert_eq!(header.program_size, 6);

        let pool = loader.load_pool_entries(&header).unwrap();
        assert_eq!(pool, builder.pool_entries());
        let program = loader.load_program(&header).unwrap();
        assert_eq!(program, builder.instructions());
        let symbols = loader.load_symbols(&header).unwrap();
        assert_eq!(symbols, builder.symbols());
        let memory = loader.load_memory(&header).unwrap();
        assert_eq!(&memory[..], b"hello\0");
        loader.finish().unwrap();
    }

    #[test]
    fn pool_table_answers_lookups() {
        let builder = sample();
        let mut loader = ImageLoader::new(BytesMut::from(&builder.build()[..]));
        let header = loader.load_header().unwrap();
        let pool = loader.load_pool(&header).unwrap();
        assert_eq!(pool.get(7), 24);
        assert_eq!(pool.get(3), 8);
        assert_eq!(pool.get(4), 0);
    }

    #[test]
    fn zero_length_operand_decodes_to_zero() {
        let mut input: &[u8] = &[0];
        assert_eq!(decode_operand(&mut input, 0).unwrap(), Word::ZERO);
        assert!(input.is_empty());
    }

    #[test]
    fn operand_is_zero_extended() {
        let mut input: &[u8] = &[3, 0x01, 0x02, 0x03];
        assert_eq!(decode_operand(&mut input, 0).unwrap().as_u64(), 0x03_0201);
    }

    #[test]
    fn operand_wider_than_a_word_is_rejected() {
        let mut input: &[u8] = &[9, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            decode_operand(&mut input, 5),
            Err(LoadError::OperandTooWide { index: 5, width: 9 })
        ));
    }

    #[test]
    fn bad_magic_is_reported_before_anything_else() {
        let mut loader = ImageLoader::new(BytesMut::from(&b".XF"[..]));
        assert!(matches!(
            loader.load_header(),
            Err(LoadError::BadMagic { found }) if &found == b".XF"
        ));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut bytes = sample().build();
        bytes[3..5].copy_from_slice(&2u16.to_le_bytes());
        let mut loader = ImageLoader::new(BytesMut::from(&bytes[..]));
        assert!(matches!(
            loader.load_header(),
            Err(LoadError::UnsupportedVersion {
                found: 2,
                expected: CURRENT_VERSION
            })
        ));
    }

    #[test]
    fn truncated_program_is_rejected() {
        let bytes = sample().build();
        let cut = bytes.len() - 30;
        let mut module = Module::default();
        let result = ImageLoader::new(BytesMut::from(&bytes[..cut])).load_into(&mut module);
        assert!(matches!(result, Err(LoadError::Decode(_))));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = sample().build();
        bytes.push(0xAA);
        assert!(matches!(
            load_executable(BytesMut::from(&bytes[..])),
            Err(LoadError::TrailingBytes { remaining: 1 })
        ));
    }

    #[test]
    fn memory_segment_must_fit_a_region() {
        let mut bytes = ImageBuilder::executable().op(Opcode::Nop).build();
        bytes[38..46].copy_from_slice(&(MAX_REGION_LEN + 1).to_le_bytes());
        assert!(matches!(
            load_executable(BytesMut::from(&bytes[..])),
            Err(LoadError::MemoryTooLarge { len, max: MAX_REGION_LEN }) if len == MAX_REGION_LEN + 1
        ));
    }

    #[test]
    fn unknown_opcode_loads_without_operand() {
        let bytes = ImageBuilder::executable()
            .instruction(Instruction {
                opcode: 0x30,
                operand: Word::ZERO,
            })
            .op(Opcode::Nop)
            .build();
        let module = load_executable(BytesMut::from(&bytes[..])).unwrap();
        assert_eq!(module.instructions[0].opcode, 0x30);
        assert_eq!(module.instructions[1].opcode, Opcode::Nop as u8);
    }

    #[test]
    fn flags_are_enforced() {
        let library = ImageBuilder::library().op(Opcode::Ret).build();
        assert!(matches!(
            load_executable(BytesMut::from(&library[..])),
            Err(LoadError::NotExecutable)
        ));

        let executable = ImageBuilder::executable().op(Opcode::Nop).build();
        let mut module = Module::default();
        assert!(matches!(
            load_library_into(&mut module, BytesMut::from(&executable[..])),
            Err(LoadError::NotLibrary)
        ));

        let broken = ImageBuilder::executable()
            .flags(Flags::EXECUTABLE | Flags::CONTAINS_ERROR)
            .op(Opcode::Nop)
            .build();
        assert!(matches!(
            load_executable(BytesMut::from(&broken[..])),
            Err(LoadError::ContainsErrors)
        ));
    }

    #[test]
    fn header_layout_is_46_bytes() {
        let header = Header {
            magic: MAGIC,
            version: CURRENT_VERSION,
            flags: Flags::EXECUTABLE,
            entry_point: 0,
            pool_size: 0,
            program_size: 0,
            symbol_size: 0,
            memory_size: 0,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 46);
        assert_eq!(&bytes[..3], b".CF");
        assert_eq!(bytes[5], 0b10);
    }

    #[test]
    fn flags_display() {
        assert_eq!(Flags::NONE.to_string(), "none");
        assert_eq!(
            (Flags::EXECUTABLE | Flags::LIBRARY).to_string(),
            "executable | library"
        );
    }
}
