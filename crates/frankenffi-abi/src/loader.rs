//! Symbol resolution.
//!
//! A [`Linker`] searches its configured libraries in order and then the
//! process's default search order. Libraries are opened with
//! `RTLD_NOW | RTLD_LOCAL` and stay loaded for as long as any symbol (or
//! binding) resolved from them is alive.

use std::collections::HashMap;
use std::ffi::{CString, c_int, c_void};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use frankenffi_membrane::metrics::{FfiMetrics, global_metrics};
use frankenffi_membrane::{FfiError, FfiResult, RuntimeConfig};
use parking_lot::RwLock;

use crate::binding::{NativeBinding, bind};
use crate::descriptor::FunctionDescriptor;

/// Flags used for every library the linker opens.
pub const LIBRARY_FLAGS: c_int = libc::RTLD_NOW | libc::RTLD_LOCAL;

/// A `dlopen`ed library, closed when the last reference goes away.
pub struct Library {
    path: PathBuf,
    handle: usize,
}

impl Library {
    fn open(path: &Path) -> FfiResult<Self> {
        let not_found = || FfiError::SymbolNotFound {
            symbol: path.display().to_string(),
        };
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| not_found())?;
        // SAFETY: `c_path` is a valid NUL-terminated string.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), LIBRARY_FLAGS) };
        if handle.is_null() {
            return Err(not_found());
        }
        Ok(Self {
            path: path.to_path_buf(),
            handle: handle as usize,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lookup(&self, name: &CString) -> Option<usize> {
        // SAFETY: `handle` came from a successful `dlopen` and is still open.
        let addr = unsafe { libc::dlsym(self.handle as *mut c_void, name.as_ptr()) };
        (!addr.is_null()).then_some(addr as usize)
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        // SAFETY: opened by `Library::open`; closed exactly once here.
        unsafe { libc::dlclose(self.handle as *mut c_void) };
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library").field("path", &self.path).finish()
    }
}

/// Where a symbol was found.
#[derive(Debug, Clone)]
pub enum SymbolOrigin {
    /// The process's default search order.
    Process,
    /// A library opened by the linker; keeps it loaded.
    Library(Arc<Library>),
}

impl SymbolOrigin {
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Process => "<process>".to_string(),
            Self::Library(lib) => lib.path().display().to_string(),
        }
    }
}

impl PartialEq for SymbolOrigin {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Process, Self::Process) => true,
            (Self::Library(a), Self::Library(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for SymbolOrigin {}

impl fmt::Display for SymbolOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// A resolved native entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSymbol {
    name: String,
    address: usize,
    origin: SymbolOrigin,
}

impl NativeSymbol {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-null entry address.
    #[must_use]
    pub fn address(&self) -> usize {
        self.address
    }

    #[must_use]
    pub fn origin(&self) -> &SymbolOrigin {
        &self.origin
    }
}

impl fmt::Display for NativeSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x} ({})", self.name, self.address, self.origin)
    }
}

type CacheKey = (String, FunctionDescriptor);

/// Symbol resolver with a per-linker binding cache.
pub struct Linker {
    libraries: Vec<Arc<Library>>,
    bindings: RwLock<HashMap<CacheKey, NativeBinding>>,
}

impl Default for Linker {
    fn default() -> Self {
        Self::new()
    }
}

impl Linker {
    /// Linker searching only the process's default order.
    #[must_use]
    pub fn new() -> Self {
        Self {
            libraries: Vec::new(),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Linker searching `config.library_path` first.
    pub fn from_config(config: &RuntimeConfig) -> FfiResult<Self> {
        config
            .library_path
            .iter()
            .try_fold(Self::new(), |linker, path| linker.with_library(path))
    }

    /// Append a library to the search order.
    pub fn with_library(mut self, path: impl AsRef<Path>) -> FfiResult<Self> {
        let library = Library::open(path.as_ref())?;
        self.libraries.push(Arc::new(library));
        Ok(self)
    }

    pub fn libraries(&self) -> impl Iterator<Item = &Path> {
        self.libraries.iter().map(|lib| lib.path())
    }

    /// Resolve `name` in library order, then in the process.
    pub fn resolve(&self, name: &str) -> FfiResult<NativeSymbol> {
        let not_found = || FfiError::SymbolNotFound {
            symbol: name.to_string(),
        };
        let c_name = CString::new(name).map_err(|_| not_found())?;

        let found = self
            .libraries
            .iter()
            .find_map(|lib| {
                lib.lookup(&c_name)
                    .map(|addr| (addr, SymbolOrigin::Library(Arc::clone(lib))))
            })
            .or_else(|| lookup_process(&c_name).map(|addr| (addr, SymbolOrigin::Process)));

        let (address, origin) = found.ok_or_else(not_found)?;
        FfiMetrics::inc(&global_metrics().symbols_resolved);
        Ok(NativeSymbol {
            name: name.to_string(),
            address,
            origin,
        })
    }

    /// Resolve and bind through the cache; one binding per distinct pair.
    pub fn bind_symbol(&self, name: &str, descriptor: &FunctionDescriptor) -> FfiResult<NativeBinding> {
        let key = (name.to_string(), descriptor.clone());
        if let Some(binding) = self.bindings.read().get(&key) {
            return Ok(binding.clone());
        }
        let symbol = self.resolve(name)?;
        let binding = bind(&symbol, descriptor.clone())?;
        Ok(self.bindings.write().entry(key).or_insert(binding).clone())
    }

    /// Number of distinct cached bindings.
    #[must_use]
    pub fn cached_bindings(&self) -> usize {
        self.bindings.read().len()
    }
}

impl fmt::Debug for Linker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Linker")
            .field("libraries", &self.libraries.iter().map(|l| l.path()).collect::<Vec<_>>())
            .field("cached_bindings", &self.cached_bindings())
            .finish()
    }
}

fn lookup_process(name: &CString) -> Option<usize> {
    // SAFETY: RTLD_DEFAULT is a valid pseudo-handle and `name` is NUL-terminated.
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    (!addr.is_null()).then_some(addr as usize)
}

/// Resolve `name` in the process's default search order.
pub fn resolve(name: &str) -> FfiResult<NativeSymbol> {
    Linker::new().resolve(name)
}
