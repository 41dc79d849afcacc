use crate::types::encoding::DecodeError;
use codefusion_derive::Error;

/// Numeric halt status reported by the runner.
///
/// The numbering is part of the process contract: `Ok` is zero and every
/// failure is non-zero.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Status {
    Ok = 0,
    IllegalOpcode = 1,
    IllegalAccess = 2,
    StackUnderflow = 3,
    StackOverflow = 4,
    CallStackOverflow = 5,
    CallStackUnderflow = 6,
    DivisionByZero = 7,
    IllegalInterrupt = 8,
    IllegalLibraryIndex = 9,
    LibraryOverflow = 10,
    SymbolNotFound = 11,
    IllegalEntryPoint = 12,
    Exit = 13,
    HostIo = 14,
    LinkFailure = 15,
}

impl Status {
    /// Upper-case status name as printed on halt.
    pub const fn name(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::IllegalOpcode => "ILLEGAL_OPCODE",
            Status::IllegalAccess => "ILLEGAL_ACCESS",
            Status::StackUnderflow => "STACK_UNDERFLOW",
            Status::StackOverflow => "STACK_OVERFLOW",
            Status::CallStackOverflow => "CALL_STACK_OVERFLOW",
            Status::CallStackUnderflow => "CALL_STACK_UNDERFLOW",
            Status::DivisionByZero => "DIVISION_BY_ZERO",
            Status::IllegalInterrupt => "ILLEGAL_INTERRUPT",
            Status::IllegalLibraryIndex => "ILLEGAL_LIBRARY_INDEX",
            Status::LibraryOverflow => "LIBRARY_OVERFLOW",
            Status::SymbolNotFound => "SYMBOL_NOT_FOUND",
            Status::IllegalEntryPoint => "ILLEGAL_ENTRY_POINT",
            Status::Exit => "EXIT",
            Status::HostIo => "HOST_IO",
            Status::LinkFailure => "LINK_FAILURE",
        }
    }
}

/// Errors that halt the machine.
#[derive(Debug, Error)]
pub enum VmError {
    /// Opcode byte has no instruction assigned.
    #[error("illegal opcode {opcode:#04x}")]
    IllegalOpcode { opcode: u8 },
    /// Program counter, branch target or guest memory access out of bounds.
    #[error("illegal access")]
    IllegalAccess,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("stack overflow")]
    StackOverflow,
    /// Pool-allocation stack is empty.
    #[error("call stack underflow")]
    CallStackUnderflow,
    /// Pool-allocation stack is full.
    #[error("call stack overflow")]
    CallStackOverflow,
    #[error("division by zero")]
    DivisionByZero,
    /// Interrupt code out of range or slot empty.
    #[error("illegal interrupt {code}")]
    IllegalInterrupt { code: u64 },
    /// Module index is zero where forbidden, unknown or already unloaded.
    #[error("illegal library index {index}")]
    IllegalLibraryIndex { index: u64 },
    /// Module table is full.
    #[error("library overflow")]
    LibraryOverflow,
    #[error("symbol not found: {name}")]
    SymbolNotFound { name: String },
    /// Declared entry point lies outside the program.
    #[error("illegal entry point {entry} for program of {program_size} instructions")]
    IllegalEntryPoint { entry: u64, program_size: usize },
    /// Guest requested process exit.
    #[error("exit with code {0}")]
    Exit(i64),
    /// An I/O interrupt's host call failed.
    #[error("host io error: {reason}")]
    HostIo { reason: String },
    /// A module could not be linked.
    #[error("link error: {0}")]
    Link(#[from] LinkError),
}

impl VmError {
    /// Maps the error onto the halt status numbering.
    pub fn status(&self) -> Status {
        match self {
            VmError::IllegalOpcode { .. } => Status::IllegalOpcode,
            VmError::IllegalAccess => Status::IllegalAccess,
            VmError::StackUnderflow => Status::StackUnderflow,
            VmError::StackOverflow => Status::StackOverflow,
            VmError::CallStackUnderflow => Status::CallStackUnderflow,
            VmError::CallStackOverflow => Status::CallStackOverflow,
            VmError::DivisionByZero => Status::DivisionByZero,
            VmError::IllegalInterrupt { .. } => Status::IllegalInterrupt,
            VmError::IllegalLibraryIndex { .. } => Status::IllegalLibraryIndex,
            VmError::LibraryOverflow => Status::LibraryOverflow,
            VmError::SymbolNotFound { .. } => Status::SymbolNotFound,
            VmError::IllegalEntryPoint { .. } => Status::IllegalEntryPoint,
            VmError::Exit(_) => Status::Exit,
            VmError::HostIo { .. } => Status::HostIo,
            VmError::Link(_) => Status::LinkFailure,
        }
    }

    /// Process exit code for a machine halted with this error.
    ///
    /// A guest exit keeps its own code; every other halt reports its
    /// status number.
    pub fn exit_code(&self) -> i32 {
        match self {
            VmError::Exit(code) => *code as i32,
            other => other.status() as i32,
        }
    }
}

/// Structural violations found while loading an image.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("truncated image: {0}")]
    Decode(#[from] DecodeError),
    #[error("image has not the correct file format (magic {found:?})")]
    BadMagic { found: [u8; 3] },
    #[error("image version {found} is not supported, expected {expected}")]
    UnsupportedVersion { found: u16, expected: u16 },
    #[error("operand of instruction {index} is {width} bytes wide, at most 8 allowed")]
    OperandTooWide { index: u64, width: u8 },
    #[error("symbol {index} has a name that is not valid utf-8")]
    InvalidSymbolName { index: u64 },
    #[error("memory segment of {len} bytes exceeds the {max} byte limit")]
    MemoryTooLarge { len: u64, max: u64 },
    #[error("{remaining} trailing bytes after the memory segment")]
    TrailingBytes { remaining: usize },
    #[error("image is not executable")]
    NotExecutable,
    #[error("image is not a library")]
    NotLibrary,
    #[error("image was built with errors")]
    ContainsErrors,
}

/// Failures while mapping or initialising a dynamic module.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("cannot map module {path}: {reason}")]
    CannotMap { path: String, reason: String },
    #[error("module {path} has no entry point")]
    MissingEntryPoint { path: String },
    #[error("module {path} failed to load: {reason}")]
    Image { path: String, reason: LoadError },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn status_numbering_is_stable() {
        assert_eq!(Status::Ok as u8, 0);
        assert_eq!(VmError::IllegalOpcode { opcode: 0xFF }.status() as u8, 1);
        assert_eq!(VmError::IllegalAccess.status() as u8, 2);
        assert_eq!(VmError::DivisionByZero.status() as u8, 7);
        assert_eq!(VmError::LibraryOverflow.status().name(), "LIBRARY_OVERFLOW");
    }

    #[test]
    fn exit_keeps_guest_code() {
        assert_eq!(VmError::Exit(3).exit_code(), 3);
        assert_eq!(VmError::StackUnderflow.exit_code(), 3);
        assert_ne!(VmError::IllegalAccess.exit_code(), 0);
    }

    #[test]
    fn display_formats_fields() {
        assert_eq!(
            VmError::IllegalOpcode { opcode: 0x30 }.to_string(),
            "illegal opcode 0x30"
        );
        assert_eq!(
            VmError::SymbolNotFound {
                name: "main".into()
            }
            .to_string(),
            "symbol not found: main"
        );
        assert_eq!(
            LoadError::UnsupportedVersion {
                found: 2,
                expected: 1
            }
            .to_string(),
            "image version 2 is not supported, expected 1"
        );
    }

    #[test]
    fn link_error_converts_and_chains() {
        let err: VmError = LinkError::MissingEntryPoint {
            path: "lib.so".into(),
        }
        .into();
        assert_eq!(err.status(), Status::LinkFailure);
        assert!(err.source().is_some());
    }

    #[test]
    fn decode_error_converts_into_load_error() {
        let err: LoadError = DecodeError::InvalidValue.into();
        assert!(matches!(err, LoadError::Decode(DecodeError::InvalidValue)));
    }
}
