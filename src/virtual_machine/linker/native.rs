//! Shared-library adapter.
//!
//! Maps a platform shared library with `libloading` and reads the library
//! image it exports through `cf_module_image`.

use super::{ModuleInit, NativeHandle, NativeLoader};
use crate::virtual_machine::errors::LinkError;
use crate::virtual_machine::image::load_library_into;
use crate::virtual_machine::module::Module;
use bytes::BytesMut;
use libloading::{Library, Symbol};

/// Exported symbol every native module provides.
pub const ENTRY_POINT: &[u8] = b"cf_module_image\0";

type ImageFn = unsafe extern "C" fn(len: *mut usize) -> *const u8;

/// [`NativeLoader`] backed by the platform dynamic loader.
#[derive(Debug, Default)]
pub struct LibraryLoader;

impl LibraryLoader {
    pub fn new() -> Self {
        Self
    }
}

impl NativeLoader for LibraryLoader {
    fn load(&mut self, path: &str) -> Result<NativeHandle, LinkError> {
        // SAFETY: mapping runs the library's initialisers. Native modules are
        // trusted to the same degree as the bootstrap image.
        let library = unsafe { Library::new(path) }.map_err(|err| LinkError::CannotMap {
            path: path.to_string(),
            reason: err.to_string(),
        })?;
        Ok(NativeHandle::new(path, library))
    }

    fn entry_point<'h>(&self, handle: &'h NativeHandle) -> Result<ModuleInit<'h>, LinkError> {
        let missing = || LinkError::MissingEntryPoint {
            path: handle.path().to_string(),
        };
        let library = handle.downcast_ref::<Library>().ok_or_else(missing)?;
        // SAFETY: `cf_module_image` is declared by `export_module!` with
        // exactly the `ImageFn` signature.
        let image_fn: Symbol<'h, ImageFn> =
            unsafe { library.get(ENTRY_POINT) }.map_err(|_| missing())?;

        Ok(Box::new(move |module: &mut Module| {
            let mut len = 0usize;
            // SAFETY: the export returns a pointer to a static image of `len`
            // bytes that lives as long as the library stays mapped.
            let image = unsafe {
                let ptr = image_fn(&mut len);
                if ptr.is_null() {
                    &[][..]
                } else {
                    std::slice::from_raw_parts(ptr, len)
                }
            };
            load_library_into(module, BytesMut::from(image))
        }))
    }

    fn unload(&mut self, handle: NativeHandle) {
        // Dropping the `Library` unmaps it.
        drop(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_cannot_be_mapped() {
        let mut loader = LibraryLoader::new();
        assert!(matches!(
            loader.load("/nonexistent/codefusion-module.so"),
            Err(LinkError::CannotMap { .. })
        ));
    }

    #[test]
    fn foreign_handle_has_no_entry_point() {
        let loader = LibraryLoader::new();
        let handle = NativeHandle::new("fake", 5u32);
        assert!(matches!(
            loader.entry_point(&handle),
            Err(LinkError::MissingEntryPoint { .. })
        ));
    }
}
