//! Test utilities for machine testing.

#[cfg(test)]
pub mod utils {
    use crate::virtual_machine::interrupts::HostIo;
    use std::cell::RefCell;
    use std::io::{self, Write};
    use std::rc::Rc;

    /// Writer whose contents stay inspectable after being boxed.
    #[derive(Clone, Default)]
    pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl SharedBuffer {
        /// Everything written so far.
        pub fn contents(&self) -> Vec<u8> {
            self.0.borrow().clone()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Host file table reading `input` as stdin and capturing stdout and
    /// stderr.
    pub fn captured_io(input: &[u8]) -> (HostIo, SharedBuffer, SharedBuffer) {
        let out = SharedBuffer::default();
        let err = SharedBuffer::default();
        let io = HostIo::with_streams(
            Box::new(io::Cursor::new(input.to_vec())),
            Box::new(out.clone()),
            Box::new(err.clone()),
        );
        (io, out, err)
    }
}
