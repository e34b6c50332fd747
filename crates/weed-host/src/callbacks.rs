use std::env;
use std::ffi::c_void;
use std::fmt;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use weed_plant::{keys, PlantHandle, VoidPtr};

use crate::abi::{DeinitFn, InitFn, ProcessFn};
use crate::handles;
use crate::loader::PluginLibrary;
use crate::PluginCode;

/// The entry points of a filter class.
///
/// Implementations receive the instance plant; they must not assume the
/// caller holds any lock on it.
pub trait FilterCallbacks: Send + Sync {
    fn init(&self, _instance: &PlantHandle) -> PluginCode {
        PluginCode::Success
    }

    fn process(&self, instance: &PlantHandle, timecode: i64) -> PluginCode;

    fn deinit(&self, _instance: &PlantHandle) -> PluginCode {
        PluginCode::Success
    }

    /// Whether `init` does anything; stateless filters skip reinit when
    /// this is false.
    fn has_init(&self) -> bool {
        true
    }
}

/// Serialises working-directory switches across threads.
static CWD_LOCK: Mutex<()> = parking_lot::const_mutex(());

struct CwdGuard {
    previous: Option<PathBuf>,
}

impl CwdGuard {
    fn enter(dir: &Path) -> Self {
        let previous = env::current_dir().ok();
        if let Err(err) = env::set_current_dir(dir) {
            tracing::debug!(?err, dir = %dir.display(), "could not enter plugin directory");
            return CwdGuard { previous: None };
        }
        CwdGuard { previous }
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = env::set_current_dir(previous);
        }
    }
}

/// Calls into a native plugin through the function pointers of its filter
/// class.
pub struct NativeCallbacks {
    init: Option<InitFn>,
    process: ProcessFn,
    deinit: Option<DeinitFn>,
    install_dir: Option<PathBuf>,
    _library: Option<Arc<PluginLibrary>>,
}

fn funcptr(filter: &PlantHandle, key: &str) -> Option<VoidPtr> {
    filter
        .read()
        .get_funcptr(key)
        .ok()
        .filter(|ptr| !ptr.is_null())
}

impl NativeCallbacks {
    /// Read `init_func`, `process_func` and `deinit_func` from a filter
    /// class. Returns `None` without a process function.
    ///
    /// # Safety
    /// The pointers stored in the filter class must be functions with the
    /// Weed signatures that stay valid while `library` is loaded.
    pub unsafe fn from_filter(filter: &PlantHandle, library: Option<Arc<PluginLibrary>>) -> Option<Self> {
        let process = funcptr(filter, keys::PROCESS_FUNC)?;
        let init = funcptr(filter, keys::INIT_FUNC);
        let deinit = funcptr(filter, keys::DEINIT_FUNC);
        Some(NativeCallbacks {
            init: init.map(|ptr| mem::transmute::<*mut c_void, InitFn>(ptr.as_ptr())),
            process: mem::transmute::<*mut c_void, ProcessFn>(process.as_ptr()),
            deinit: deinit.map(|ptr| mem::transmute::<*mut c_void, DeinitFn>(ptr.as_ptr())),
            install_dir: library.as_ref().and_then(|lib| lib.install_dir()),
            _library: library,
        })
    }
}

impl FilterCallbacks for NativeCallbacks {
    fn init(&self, instance: &PlantHandle) -> PluginCode {
        let Some(init) = self.init else {
            return PluginCode::Success;
        };
        let ptr = handles::expose(instance);
        let _lock = CWD_LOCK.lock();
        let _cwd = self.install_dir.as_deref().map(CwdGuard::enter);
        PluginCode::from_code(unsafe { init(ptr) })
    }

    fn process(&self, instance: &PlantHandle, timecode: i64) -> PluginCode {
        let ptr = handles::expose(instance);
        PluginCode::from_code(unsafe { (self.process)(ptr, timecode) })
    }

    fn deinit(&self, instance: &PlantHandle) -> PluginCode {
        let Some(deinit) = self.deinit else {
            return PluginCode::Success;
        };
        let ptr = handles::expose(instance);
        PluginCode::from_code(unsafe { deinit(ptr) })
    }

    fn has_init(&self) -> bool {
        self.init.is_some()
    }
}

impl fmt::Debug for NativeCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCallbacks")
            .field("init", &self.init.is_some())
            .field("deinit", &self.deinit.is_some())
            .field("install_dir", &self.install_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::c_int;
    use std::sync::atomic::{AtomicI64, Ordering};

    use pretty_assertions::assert_eq;
    use weed_plant::{LeafValue, PlantType};

    use super::*;

    static LAST_TIMECODE: AtomicI64 = AtomicI64::new(0);

    unsafe extern "C" fn record_process(instance: *mut c_void, timecode: i64) -> c_int {
        if handles::resolve(instance).is_none() {
            return PluginCode::FilterInvalid.code();
        }
        LAST_TIMECODE.store(timecode, Ordering::SeqCst);
        0
    }

    unsafe extern "C" fn refuse_init(_instance: *mut c_void) -> c_int {
        PluginCode::MemoryAllocation.code()
    }

    fn filter_with(process: ProcessFn, init: Option<InitFn>) -> PlantHandle {
        let filter = PlantHandle::new(PlantType::FilterClass);
        filter
            .set(
                keys::PROCESS_FUNC,
                LeafValue::FuncPtr(vec![VoidPtr::from_addr(process as usize)]),
            )
            .unwrap();
        if let Some(init) = init {
            filter
                .set(
                    keys::INIT_FUNC,
                    LeafValue::FuncPtr(vec![VoidPtr::from_addr(init as usize)]),
                )
                .unwrap();
        }
        filter
    }

    #[test]
    fn native_process_receives_a_resolvable_instance() {
        let filter = filter_with(record_process, None);
        let callbacks = unsafe { NativeCallbacks::from_filter(&filter, None) }.unwrap();
        let instance = PlantHandle::new(PlantType::FilterInstance);
        assert_eq!(callbacks.process(&instance, 4242), PluginCode::Success);
        assert_eq!(LAST_TIMECODE.load(Ordering::SeqCst), 4242);
        assert!(!callbacks.has_init());
        assert_eq!(callbacks.init(&instance), PluginCode::Success);
    }

    #[test]
    fn init_codes_are_passed_through() {
        let filter = filter_with(record_process, Some(refuse_init));
        let callbacks = unsafe { NativeCallbacks::from_filter(&filter, None) }.unwrap();
        let instance = PlantHandle::new(PlantType::FilterInstance);
        assert_eq!(callbacks.init(&instance), PluginCode::MemoryAllocation);
    }

    #[test]
    fn missing_process_function() {
        let filter = PlantHandle::new(PlantType::FilterClass);
        assert!(unsafe { NativeCallbacks::from_filter(&filter, None) }.is_none());
    }
}
