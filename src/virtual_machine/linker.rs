//! Dynamic module linking.
//!
//! The machine never talks to the platform directly. A [`NativeLoader`] maps a
//! native module, hands out its entry point and releases it again; the
//! [`DynamicLinker`] drives that capability to turn a path into a populated
//! [`Module`].
//!
//! Loaders:
//! - [`StaticLoader`]: in-process registry of path to image bytes
//! - [`native::LibraryLoader`] (feature `native`): shared libraries exporting
//!   `cf_module_image`, see [`export_module!`](crate::export_module)

#[cfg(feature = "native")]
pub mod native;

use crate::virtual_machine::errors::{LinkError, LoadError, VmError};
use crate::virtual_machine::image::load_library_into;
use crate::virtual_machine::module::Module;
use crate::{info, warn};
use bytes::BytesMut;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// One-shot callback that fills an empty module.
pub type ModuleInit<'h> = Box<dyn FnOnce(&mut Module) -> Result<(), LoadError> + 'h>;

/// Platform resources backing a loaded module.
pub struct NativeHandle {
    path: String,
    inner: Box<dyn Any>,
}

impl NativeHandle {
    pub fn new(path: impl Into<String>, inner: impl Any) -> Self {
        Self {
            path: path.into(),
            inner: Box::new(inner),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Loader-specific payload.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Platform capability to map and release native modules.
pub trait NativeLoader {
    /// Maps the module at `path`.
    fn load(&mut self, path: &str) -> Result<NativeHandle, LinkError>;

    /// Locates the module's well-known entry point.
    fn entry_point<'h>(&self, handle: &'h NativeHandle) -> Result<ModuleInit<'h>, LinkError>;

    /// Releases everything `load` acquired.
    fn unload(&mut self, handle: NativeHandle);
}

/// Turns module paths into populated modules.
pub struct DynamicLinker {
    loader: Box<dyn NativeLoader>,
}

impl DynamicLinker {
    pub fn new(loader: impl NativeLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
        }
    }

    /// Maps `path`, runs its entry point over an empty module and returns it.
    pub fn load(&mut self, path: &str) -> Result<Module, LinkError> {
        let handle = self.loader.load(path)?;
        let outcome = self.loader.entry_point(&handle).map(|init| {
            let mut module = Module::default();
            init(&mut module).map(|_| module)
        });
        let mut module = match outcome {
            Ok(Ok(module)) => module,
            Ok(Err(reason)) => {
                self.loader.unload(handle);
                return Err(LinkError::Image {
                    path: path.to_string(),
                    reason,
                });
            }
            Err(err) => {
                self.loader.unload(handle);
                return Err(err);
            }
        };

        info!(
            "linked {path}: {} instructions, {} symbols",
            module.instructions.len(),
            module.symbols.len()
        );
        module.path = Some(path.to_string());
        module.handle = Some(handle);
        Ok(module)
    }

    /// Releases a module obtained from [`load`](Self::load).
    pub fn unload(&mut self, mut module: Module) {
        match module.handle.take() {
            Some(handle) => {
                info!("unlinked {}", handle.path());
                self.loader.unload(handle);
            }
            None => warn!("unload of a module without native handle"),
        }
    }

    /// Address of the exported symbol `name` in `module`.
    pub fn resolve_symbol(module: &Module, name: &[u8]) -> Result<u64, VmError> {
        module
            .symbol(name)
            .map(|symbol| symbol.address)
            .ok_or_else(|| VmError::SymbolNotFound {
                name: String::from_utf8_lossy(name).into_owned(),
            })
    }
}

impl Default for DynamicLinker {
    /// Linker with an empty [`StaticLoader`]: every load fails.
    fn default() -> Self {
        Self::new(StaticLoader::new())
    }
}

/// Loader serving library images registered in process.
#[derive(Clone, Debug, Default)]
pub struct StaticLoader {
    images: HashMap<String, Vec<u8>>,
}

/// Payload of a handle issued by [`StaticLoader`].
struct StaticImage(Vec<u8>);

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `image` under `path`.
    pub fn with_image(mut self, path: impl Into<String>, image: Vec<u8>) -> Self {
        self.images.insert(path.into(), image);
        self
    }
}

impl NativeLoader for StaticLoader {
    fn load(&mut self, path: &str) -> Result<NativeHandle, LinkError> {
        let image = self
            .images
            .get(path)
            .ok_or_else(|| LinkError::CannotMap {
                path: path.to_string(),
                reason: "no such module".to_string(),
            })?;
        Ok(NativeHandle::new(path, StaticImage(image.clone())))
    }

    fn entry_point<'h>(&self, handle: &'h NativeHandle) -> Result<ModuleInit<'h>, LinkError> {
        let image = handle
            .downcast_ref::<StaticImage>()
            .ok_or_else(|| LinkError::MissingEntryPoint {
                path: handle.path().to_string(),
            })?;
        Ok(Box::new(move |module: &mut Module| {
            load_library_into(module, BytesMut::from(&image.0[..]))
        }))
    }

    fn unload(&mut self, handle: NativeHandle) {
        drop(handle);
    }
}

/// Exports an embedded library image from a native module.
///
/// Expands to the `cf_module_image` symbol that
/// [`native::LibraryLoader`] looks up:
///
/// ```ignore
/// codefusion::export_module!(include_bytes!("math.cf"));
/// ```
#[macro_export]
macro_rules! export_module {
    ($image:expr) => {
        /// Returns the embedded library image and writes its length to `len`.
        ///
        /// # Safety
        ///
        /// `len` must be null or valid for a `usize` write.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn cf_module_image(len: *mut usize) -> *const u8 {
            static IMAGE: &[u8] = $image;
            if !len.is_null() {
                unsafe { *len = IMAGE.len() };
            }
            IMAGE.as_ptr()
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::builder::ImageBuilder;
    use crate::virtual_machine::isa::Opcode;
    use std::cell::Cell;
    use std::rc::Rc;

    fn library_image() -> Vec<u8> {
        ImageBuilder::library()
            .op_with(Opcode::Push, 1)
            .op(Opcode::Ret)
            .symbol("one", 0)
            .build()
    }

    #[test]
    fn static_loader_populates_module() {
        let mut linker =
            DynamicLinker::new(StaticLoader::new().with_image("lib/one.cf", library_image()));
        let module = linker.load("lib/one.cf").unwrap();
        assert_eq!(module.instructions.len(), 2);
        assert_eq!(module.path.as_deref(), Some("lib/one.cf"));
        assert!(module.handle.is_some());
        assert_eq!(DynamicLinker::resolve_symbol(&module, b"one").unwrap(), 0);
        linker.unload(module);
    }

    #[test]
    fn unknown_path_cannot_be_mapped() {
        let mut linker = DynamicLinker::default();
        assert!(matches!(
            linker.load("missing.cf"),
            Err(LinkError::CannotMap { .. })
        ));
    }

    #[test]
    fn executable_image_is_not_linkable() {
        let image = ImageBuilder::executable().op(Opcode::Nop).build();
        let mut linker = DynamicLinker::new(StaticLoader::new().with_image("exe.cf", image));
        assert!(matches!(
            linker.load("exe.cf"),
            Err(LinkError::Image {
                reason: LoadError::NotLibrary,
                ..
            })
        ));
    }

    #[test]
    fn missing_symbol_is_reported() {
        let module = Module::default();
        assert!(matches!(
            DynamicLinker::resolve_symbol(&module, b"nope"),
            Err(VmError::SymbolNotFound { name }) if name == "nope"
        ));
    }

    /// Loader without an entry point that counts releases.
    struct Headless {
        unloads: Rc<Cell<usize>>,
    }

    impl NativeLoader for Headless {
        fn load(&mut self, path: &str) -> Result<NativeHandle, LinkError> {
            Ok(NativeHandle::new(path, ()))
        }

        fn entry_point<'h>(&self, handle: &'h NativeHandle) -> Result<ModuleInit<'h>, LinkError> {
            Err(LinkError::MissingEntryPoint {
                path: handle.path().to_string(),
            })
        }

        fn unload(&mut self, _handle: NativeHandle) {
            self.unloads.set(self.unloads.get() + 1);
        }
    }

    #[test]
    fn failed_entry_point_releases_handle() {
        let unloads = Rc::new(Cell::new(0));
        let mut linker = DynamicLinker::new(Headless {
            unloads: unloads.clone(),
        });
        assert!(matches!(
            linker.load("x"),
            Err(LinkError::MissingEntryPoint { .. })
        ));
        assert_eq!(unloads.get(), 1);
    }

    /// Loader whose entry point hands back an executable image.
    struct WrongKind {
        unloads: Rc<Cell<usize>>,
    }

    impl NativeLoader for WrongKind {
        fn load(&mut self, path: &str) -> Result<NativeHandle, LinkError> {
            Ok(NativeHandle::new(path, ()))
        }

        fn entry_point<'h>(&self, _handle: &'h NativeHandle) -> Result<ModuleInit<'h>, LinkError> {
            Ok(Box::new(|module: &mut Module| {
                let image = ImageBuilder::executable().op(Opcode::Nop).build();
                load_library_into(module, BytesMut::from(&image[..]))
            }))
        }

        fn unload(&mut self, _handle: NativeHandle) {
            self.unloads.set(self.unloads.get() + 1);
        }
    }

    #[test]
    fn failed_module_init_releases_handle() {
        let unloads = Rc::new(Cell::new(0));
        let mut linker = DynamicLinker::new(WrongKind {
            unloads: unloads.clone(),
        });
        assert!(matches!(
            linker.load("exe"),
            Err(LinkError::Image {
                reason: LoadError::NotLibrary,
                ..
            })
        ));
        assert_eq!(unloads.get(), 1);
    }
}
