//! Interrupt table and the standard host services.
//!
//! `INT code` calls slot `code` of the [`InterruptTable`] with the machine.
//! The table is filled once before execution and only read afterwards.
//!
//! Standard layout ([`InterruptTable::standard`]), stack shown bottom to top:
//!
//! | code | service       | stack effect                                  |
//! |------|---------------|-----------------------------------------------|
//! | 0    | stdout        | `[] -> [handle]`                              |
//! | 1    | stdin         | `[] -> [handle]`                              |
//! | 2    | stderr        | `[] -> [handle]`                              |
//! | 3    | open          | `[path, mode] -> [handle]` (0 on failure)     |
//! | 4    | write         | `[handle, count, size, buf] -> []`            |
//! | 5    | close         | `[handle] -> []`                              |
//! | 6    | exit          | `[code]`, halts with `Exit(code)`             |
//! | 7    | malloc        | `[size] -> [ptr]`                             |
//! | 8    | free          | `[ptr] -> []`                                 |
//! | 9    | load module   | `[path] -> [index]`                           |
//! | 10   | unload module | `[index] -> []`                               |
//! | 11   | symbol        | `[index, name] -> [address]`                  |
//! | 12   | read          | `[handle, count, size, buf] -> [items_read]`  |
//!
//! Strings are NUL-terminated byte strings in guest memory.

use crate::types::word::Word;
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::vm::Machine;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};

/// Number of interrupt slots. Valid codes are `0..INTERRUPT_COUNT`.
pub const INTERRUPT_COUNT: usize = 255;

/// Interrupt handler.
pub type Handler = for<'t> fn(&mut Machine<'t>) -> Result<(), VmError>;

pub const INT_STDOUT: u8 = 0;
pub const INT_STDIN: u8 = 1;
pub const INT_STDERR: u8 = 2;
pub const INT_OPEN: u8 = 3;
pub const INT_WRITE: u8 = 4;
pub const INT_CLOSE: u8 = 5;
pub const INT_EXIT: u8 = 6;
pub const INT_MALLOC: u8 = 7;
pub const INT_FREE: u8 = 8;
pub const INT_LOAD_MODULE: u8 = 9;
pub const INT_UNLOAD_MODULE: u8 = 10;
pub const INT_SYMBOL: u8 = 11;
pub const INT_READ: u8 = 12;

/// Trap handler slots.
#[derive(Clone)]
pub struct InterruptTable {
    slots: [Option<Handler>; INTERRUPT_COUNT],
}

impl InterruptTable {
    /// Table with every slot empty.
    pub fn empty() -> Self {
        Self {
            slots: [None; INTERRUPT_COUNT],
        }
    }

    /// Table with the standard host services installed.
    pub fn standard() -> Self {
        Self::empty()
            .with(INT_STDOUT, stdout)
            .with(INT_STDIN, stdin)
            .with(INT_STDERR, stderr)
            .with(INT_OPEN, open)
            .with(INT_WRITE, write)
            .with(INT_CLOSE, close)
            .with(INT_EXIT, exit)
            .with(INT_MALLOC, malloc)
            .with(INT_FREE, free)
            .with(INT_LOAD_MODULE, load_module)
            .with(INT_UNLOAD_MODULE, unload_module)
            .with(INT_SYMBOL, retrieve_symbol)
            .with(INT_READ, read)
    }

    /// Installs `handler` at `code`.
    ///
    /// `code` 255 is not a slot and is ignored.
    pub fn with(mut self, code: u8, handler: Handler) -> Self {
        if let Some(slot) = self.slots.get_mut(code as usize) {
            *slot = Some(handler);
        }
        self
    }

    /// Handler for `code`, or `IllegalInterrupt`.
    pub fn get(&self, code: u64) -> Result<Handler, VmError> {
        usize::try_from(code)
            .ok()
            .and_then(|index| self.slots.get(index).copied().flatten())
            .ok_or(VmError::IllegalInterrupt { code })
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::standard()
    }
}

fn push_handle(vm: &mut Machine<'_>, handle: u64) -> Result<(), VmError> {
    vm.stack_mut().push(Word::from_u64(handle))
}

fn stdout(vm: &mut Machine<'_>) -> Result<(), VmError> {
    push_handle(vm, HostIo::STDOUT)
}

fn stdin(vm: &mut Machine<'_>) -> Result<(), VmError> {
    push_handle(vm, HostIo::STDIN)
}

fn stderr(vm: &mut Machine<'_>) -> Result<(), VmError> {
    push_handle(vm, HostIo::STDERR)
}

fn open(vm: &mut Machine<'_>) -> Result<(), VmError> {
    let stack = vm.stack();
    stack.require(2)?;
    let path = stack.peek(1)?.as_address();
    let mode = stack.peek(0)?.as_address();

    let path = vm.heap().read_c_string(path)?.to_vec();
    let mode = vm.heap().read_c_string(mode)?.to_vec();
    let handle = vm.io_mut().open(&path, &mode);

    let stack = vm.stack_mut();
    stack.set(1, Word::from_u64(handle))?;
    stack.drop_n(1)
}

/// Byte count of `count` items of `size` bytes.
fn transfer_len(count: Word, size: Word) -> Result<usize, VmError> {
    count
        .as_u64()
        .checked_mul(size.as_u64())
        .and_then(|n| usize::try_from(n).ok())
        .ok_or(VmError::IllegalAccess)
}

fn write(vm: &mut Machine<'_>) -> Result<(), VmError> {
    let stack = vm.stack();
    stack.require(4)?;
    let handle = stack.peek(3)?.as_u64();
    let len = transfer_len(stack.peek(2)?, stack.peek(1)?)?;
    let buffer = stack.peek(0)?.as_address();

    let (heap, io) = vm.host_parts();
    let data = if len == 0 { &[][..] } else { heap.slice(buffer, len)? };
    io.write(handle, data)?;
    vm.stack_mut().drop_n(4)
}

fn read(vm: &mut Machine<'_>) -> Result<(), VmError> {
    let stack = vm.stack();
    stack.require(4)?;
    let handle = stack.peek(3)?.as_u64();
    let size = stack.peek(1)?.as_u64();
    let len = transfer_len(stack.peek(2)?, stack.peek(1)?)?;
    let buffer = stack.peek(0)?.as_address();

    let (heap, io) = vm.host_parts();
    let filled = if len == 0 {
        0
    } else {
        io.read(handle, heap.slice_mut(buffer, len)?)?
    };
    let items = if size == 0 { 0 } else { filled as u64 / size };

    let stack = vm.stack_mut();
    stack.set(3, Word::from_u64(items))?;
    stack.drop_n(3)
}

fn close(vm: &mut Machine<'_>) -> Result<(), VmError> {
    let handle = vm.stack().top()?.as_u64();
    vm.io_mut().close(handle)?;
    vm.stack_mut().drop_n(1)
}

fn exit(vm: &mut Machine<'_>) -> Result<(), VmError> {
    let code = vm.stack().top()?.as_i64();
    Err(VmError::Exit(code))
}

fn malloc(vm: &mut Machine<'_>) -> Result<(), VmError> {
    let size = vm.stack().top()?.as_u64();
    let address = vm.heap_mut().allocate(size);
    vm.stack_mut().set(0, Word::from_address(address))
}

fn free(vm: &mut Machine<'_>) -> Result<(), VmError> {
    let address = vm.stack().top()?.as_address();
    vm.heap_mut().release(address)?;
    vm.stack_mut().drop_n(1)
}

fn load_module(vm: &mut Machine<'_>) -> Result<(), VmError> {
    let path = vm.stack().top()?.as_address();
    let path = vm.heap().read_c_string(path)?;
    let path = String::from_utf8_lossy(path).into_owned();
    let index = vm.link_module(&path)?;
    vm.stack_mut().set(0, Word::from_u64(index))
}

fn unload_module(vm: &mut Machine<'_>) -> Result<(), VmError> {
    let index = vm.stack().top()?.as_u64();
    vm.unlink_module(index)?;
    vm.stack_mut().drop_n(1)
}

fn retrieve_symbol(vm: &mut Machine<'_>) -> Result<(), VmError> {
    let stack = vm.stack();
    stack.require(2)?;
    let index = stack.peek(1)?.as_u64();
    let name = stack.peek(0)?.as_address();

    let name = vm.heap().read_c_string(name)?.to_vec();
    let address = vm.resolve_symbol(index, &name)?;

    let stack = vm.stack_mut();
    stack.set(1, Word::from_u64(address))?;
    stack.drop_n(1)
}

/// One open host file.
enum HostFile {
    Reader(Box<dyn Read>),
    Writer(Box<dyn Write>),
    File(File),
}

/// Host file table behind the I/O interrupts.
///
/// Handles are small integers; 0 is never issued and means "no file".
pub struct HostIo {
    files: Vec<Option<HostFile>>,
}

fn io_error(err: io::Error) -> VmError {
    VmError::HostIo {
        reason: err.to_string(),
    }
}

impl HostIo {
    pub const STDOUT: u64 = 1;
    pub const STDIN: u64 = 2;
    pub const STDERR: u64 = 3;

    /// File table wired to the process streams.
    pub fn new() -> Self {
        Self::with_streams(
            Box::new(io::stdin()),
            Box::new(io::stdout()),
            Box::new(io::stderr()),
        )
    }

    /// File table wired to the given streams.
    pub fn with_streams(
        stdin: Box<dyn Read>,
        stdout: Box<dyn Write>,
        stderr: Box<dyn Write>,
    ) -> Self {
        Self {
            files: vec![
                Some(HostFile::Writer(stdout)),
                Some(HostFile::Reader(stdin)),
                Some(HostFile::Writer(stderr)),
            ],
        }
    }

    fn file(&mut self, handle: u64) -> Result<&mut HostFile, VmError> {
        handle
            .checked_sub(1)
            .and_then(|slot| usize::try_from(slot).ok())
            .and_then(|slot| self.files.get_mut(slot))
            .and_then(Option::as_mut)
            .ok_or_else(|| VmError::HostIo {
                reason: format!("bad file handle {handle}"),
            })
    }

    /// Opens `path` with a C-style `mode` ("r", "w", "a", optional "+" and
    /// "b"). Returns 0 if the file cannot be opened.
    pub fn open(&mut self, path: &[u8], mode: &[u8]) -> u64 {
        let Ok(path) = std::str::from_utf8(path) else {
            return 0;
        };
        let plus = mode.contains(&b'+');
        let mut options = OpenOptions::new();
        match mode.first() {
            Some(b'r') => options.read(true).write(plus),
            Some(b'w') => options.write(true).create(true).truncate(true).read(plus),
            Some(b'a') => options.append(true).create(true).read(plus),
            _ => return 0,
        };
        match options.open(path) {
            Ok(file) => self.insert(HostFile::File(file)),
            Err(_) => 0,
        }
    }

    /// Stores `file` in the first closed slot, or a new one, and returns its
    /// handle.
    fn insert(&mut self, file: HostFile) -> u64 {
        let slot = match self.files.iter().position(Option::is_none) {
            Some(slot) => {
                self.files[slot] = Some(file);
                slot
            }
            None => {
                self.files.push(Some(file));
                self.files.len() - 1
            }
        };
        slot as u64 + 1
    }

    /// Writes all of `data` to `handle`.
    pub fn write(&mut self, handle: u64, data: &[u8]) -> Result<(), VmError> {
        let result = match self.file(handle)? {
            HostFile::Writer(out) => out.write_all(data).and_then(|_| out.flush()),
            HostFile::File(file) => file.write_all(data),
            HostFile::Reader(_) => {
                return Err(VmError::HostIo {
                    reason: format!("handle {handle} is not writable"),
                });
            }
        };
        result.map_err(io_error)
    }

    /// Fills `buffer` from `handle` until it is full or input ends.
    /// Returns the number of bytes read.
    pub fn read(&mut self, handle: u64, buffer: &mut [u8]) -> Result<usize, VmError> {
        let source: &mut dyn Read = match self.file(handle)? {
            HostFile::Reader(input) => &mut **input,
            HostFile::File(file) => file,
            HostFile::Writer(_) => {
                return Err(VmError::HostIo {
                    reason: format!("handle {handle} is not readable"),
                });
            }
        };
        let mut filled = 0;
        while filled < buffer.len() {
            match source.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(io_error(err)),
            }
        }
        Ok(filled)
    }

    /// Flushes and releases `handle`.
    pub fn close(&mut self, handle: u64) -> Result<(), VmError> {
        let file = self.file(handle)?;
        let result = match file {
            HostFile::Writer(out) => out.flush(),
            HostFile::File(file) => file.flush(),
            HostFile::Reader(_) => Ok(()),
        };
        if let Some(slot) = handle.checked_sub(1).and_then(|s| self.files.get_mut(s as usize)) {
            *slot = None;
        }
        result.map_err(io_error)
    }

    /// Number of open handles, standard streams included.
    pub fn open_handles(&self) -> usize {
        self.files.iter().filter(|f| f.is_some()).count()
    }
}

impl Default for HostIo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::utils::captured_io;

    #[test]
    fn empty_slot_is_illegal() {
        let table = InterruptTable::empty();
        assert!(matches!(
            table.get(0),
            Err(VmError::IllegalInterrupt { code: 0 })
        ));
        assert!(matches!(
            InterruptTable::standard().get(255),
            Err(VmError::IllegalInterrupt { code: 255 })
        ));
        assert!(InterruptTable::standard().get(11).is_ok());
        assert!(InterruptTable::standard().get(13).is_err());
    }

    #[test]
    fn standard_streams_write_and_read() {
        let (mut io, out, _) = captured_io(b"input");
        io.write(HostIo::STDOUT, b"hi").unwrap();
        assert_eq!(out.contents(), b"hi");

        let mut buffer = [0u8; 8];
        assert_eq!(io.read(HostIo::STDIN, &mut buffer).unwrap(), 5);
        assert_eq!(&buffer[..5], b"input");
        assert!(io.write(HostIo::STDIN, b"x").is_err());
    }

    #[test]
    fn closed_handle_is_rejected() {
        let (mut io, _, _) = captured_io(b"");
        io.close(HostIo::STDERR).unwrap();
        assert!(matches!(
            io.write(HostIo::STDERR, b"x"),
            Err(VmError::HostIo { .. })
        ));
        assert!(io.close(0).is_err());
        assert_eq!(io.open_handles(), 2);
    }

    #[test]
    fn files_open_write_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let path = path.to_str().unwrap().as_bytes();
        let (mut io, _, _) = captured_io(b"");

        let handle = io.open(path, b"w");
        assert_ne!(handle, 0);
        io.write(handle, b"data").unwrap();
        io.close(handle).unwrap();

        let handle = io.open(path, b"rb");
        let mut buffer = [0u8; 16];
        assert_eq!(io.read(handle, &mut buffer).unwrap(), 4);
        assert_eq!(&buffer[..4], b"data");
    }

    #[test]
    fn closed_handles_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.txt");
        let path = path.to_str().unwrap().as_bytes();
        let (mut io, _, _) = captured_io(b"");

        let first = io.open(path, b"w");
        assert_eq!(first, 4);
        io.close(first).unwrap();
        for _ in 0..16 {
            let handle = io.open(path, b"a");
            assert_eq!(handle, first);
            io.close(handle).unwrap();
        }
        assert_eq!(io.open_handles(), 3);

        io.close(HostIo::STDIN).unwrap();
        assert_eq!(io.open(path, b"r"), HostIo::STDIN);
    }

    #[test]
    fn open_failure_yields_null_handle() {
        let (mut io, _, _) = captured_io(b"");
        assert_eq!(io.open(b"/nonexistent/dir/file", b"r"), 0);
        assert_eq!(io.open(b"whatever", b"x"), 0);
    }
}
