//! The C ABI spoken with plugins.
//!
//! A plugin exports `weed_setup(bootstrap)`. It calls the host's
//! [`bootstrap`] with the range of API versions it understands and receives
//! a host-info plant whose function-pointer leaves route every later leaf
//! operation back into this module. All of those functions resolve plant
//! addresses through [`crate::handles`] and never trust a raw pointer the
//! host did not issue.

use std::cell::RefCell;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::mem;
use std::ptr;
use std::slice;

use weed_plant::keys;
use weed_plant::{
    result_code, LeafFlags, LeafValue, Origin, Plant, PlantError, PlantHandle, PlantType,
    SeedType, VoidPtr,
};

use crate::handles;

pub type DefaultGetterFn =
    unsafe extern "C" fn(plant: *mut c_void, key: *const c_char, value: *mut c_void) -> c_int;
pub type LeafGetFn = unsafe extern "C" fn(
    plant: *mut c_void,
    key: *const c_char,
    idx: c_int,
    value: *mut c_void,
) -> c_int;
pub type LeafSetFn = unsafe extern "C" fn(
    plant: *mut c_void,
    key: *const c_char,
    seed_type: c_int,
    num_elems: c_int,
    values: *mut c_void,
) -> c_int;
pub type PlantNewFn = unsafe extern "C" fn(plant_type: c_int) -> *mut c_void;
pub type ListLeavesFn = unsafe extern "C" fn(plant: *mut c_void) -> *mut *mut c_char;
pub type NumElementsFn = unsafe extern "C" fn(plant: *mut c_void, key: *const c_char) -> c_int;
pub type ElementSizeFn =
    unsafe extern "C" fn(plant: *mut c_void, key: *const c_char, idx: c_int) -> usize;
pub type SeedTypeFn = unsafe extern "C" fn(plant: *mut c_void, key: *const c_char) -> c_int;
pub type GetFlagsFn = unsafe extern "C" fn(plant: *mut c_void, key: *const c_char) -> c_int;
pub type SetFlagsFn =
    unsafe extern "C" fn(plant: *mut c_void, key: *const c_char, flags: c_int) -> c_int;
pub type PlantFreeFn = unsafe extern "C" fn(plant: *mut c_void) -> c_int;
pub type LeafDeleteFn = unsafe extern "C" fn(plant: *mut c_void, key: *const c_char) -> c_int;

pub type BootstrapFn = unsafe extern "C" fn(
    getter: *mut Option<DefaultGetterFn>,
    weed_min: c_int,
    weed_max: c_int,
    filter_min: c_int,
    filter_max: c_int,
) -> *mut c_void;
pub type SetupFn = unsafe extern "C" fn(bootstrap: BootstrapFn) -> *mut c_void;
pub type DesetupFn = unsafe extern "C" fn();

pub type InitFn = unsafe extern "C" fn(instance: *mut c_void) -> c_int;
pub type DeinitFn = unsafe extern "C" fn(instance: *mut c_void) -> c_int;
pub type ProcessFn = unsafe extern "C" fn(instance: *mut c_void, timecode: i64) -> c_int;

pub const SETUP_SYMBOL: &[u8] = b"weed_setup\0";
pub const DESETUP_SYMBOL: &[u8] = b"weed_desetup\0";

/// Core ABI versions this host implements, ascending.
pub const HOST_WEED_API_VERSIONS: &[i32] = &[200];
/// Filter API versions this host implements, ascending.
pub const HOST_FILTER_API_VERSIONS: &[i32] = &[200];

const NO_ERROR: c_int = PlantError::NO_ERROR;

/// Highest version present in both lists, 0 when there is none.
///
/// `host` must be sorted ascending; the scan stops early on it.
pub fn match_highest_version(host: &[i32], plugin: &[i32]) -> i32 {
    let mut best = 0;
    for &wanted in plugin {
        for &offered in host {
            if offered > wanted {
                break;
            }
            if offered == wanted && wanted > best {
                best = wanted;
            }
        }
    }
    best
}

fn negotiate_range(host: &[i32], min: c_int, max: c_int) -> i32 {
    let (lo, hi) = if min > max { (max, min) } else { (min, max) };
    let supported: Vec<i32> = host
        .iter()
        .copied()
        .filter(|version| (lo..=hi).contains(version))
        .collect();
    match_highest_version(host, &supported)
}

/// What the most recent bootstrap call on this thread handed out.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub host_info: Option<PlantHandle>,
    pub host_id: i64,
    pub weed_api: i32,
    pub filter_api: i32,
    pub calls: u32,
}

thread_local! {
    static HANDSHAKE: RefCell<Option<Handshake>> = const { RefCell::new(None) };
}

/// Arm the handshake record before calling a plugin's setup function.
pub fn begin_handshake() {
    HANDSHAKE.with(|slot| {
        *slot.borrow_mut() = Some(Handshake {
            host_info: None,
            host_id: 0,
            weed_api: 0,
            filter_api: 0,
            calls: 0,
        });
    });
}

pub fn finish_handshake() -> Option<Handshake> {
    HANDSHAKE.with(|slot| slot.borrow_mut().take())
}

macro_rules! funcptr {
    ($f:expr, $ty:ty) => {
        LeafValue::FuncPtr(vec![VoidPtr::from_addr($f as $ty as usize)])
    };
}

/// Build the host-info plant a plugin receives from the bootstrap.
pub fn new_host_info(weed_api: i32, filter_api: i32, host_id: i64) -> Result<PlantHandle, PlantError> {
    let mut info = Plant::new(PlantType::HostInfo);
    info.set(keys::WEED_API_VERSION, weed_api)?;
    info.set(keys::FILTER_API_VERSION, filter_api)?;
    info.set(keys::HOST_ID, host_id)?;
    info.set(keys::HOST_NAME, "weed-host")?;
    info.set(keys::HOST_VERSION, env!("CARGO_PKG_VERSION"))?;

    info.set(keys::MALLOC_FUNC, funcptr!(libc::malloc, unsafe extern "C" fn(usize) -> *mut c_void))?;
    info.set(keys::FREE_FUNC, funcptr!(libc::free, unsafe extern "C" fn(*mut c_void)))?;
    info.set(
        keys::MEMSET_FUNC,
        funcptr!(libc::memset, unsafe extern "C" fn(*mut c_void, c_int, usize) -> *mut c_void),
    )?;
    info.set(
        keys::MEMCPY_FUNC,
        funcptr!(
            libc::memcpy,
            unsafe extern "C" fn(*mut c_void, *const c_void, usize) -> *mut c_void
        ),
    )?;
    info.set(keys::PLANT_NEW_FUNC, funcptr!(plant_new, PlantNewFn))?;
    info.set(keys::LIST_LEAVES_FUNC, funcptr!(list_leaves, ListLeavesFn))?;
    info.set(keys::NUM_ELEMENTS_FUNC, funcptr!(num_elements, NumElementsFn))?;
    info.set(keys::ELEMENT_SIZE_FUNC, funcptr!(element_size, ElementSizeFn))?;
    info.set(keys::SEED_TYPE_FUNC, funcptr!(seed_type, SeedTypeFn))?;
    info.set(keys::GET_FLAGS_FUNC, funcptr!(get_flags, GetFlagsFn))?;
    info.set(keys::SET_FLAGS_FUNC, funcptr!(set_flags, SetFlagsFn))?;
    info.set(keys::GET_FUNC, funcptr!(leaf_get, LeafGetFn))?;
    info.set(keys::SET_FUNC, funcptr!(leaf_set, LeafSetFn))?;
    info.set(keys::DELETE_FUNC, funcptr!(leaf_delete, LeafDeleteFn))?;
    info.set(keys::PLANT_FREE_FUNC, funcptr!(plant_free, PlantFreeFn))?;

    info.add_flags_to_all(LeafFlags::READONLY_PLUGIN);
    Ok(PlantHandle::from_plant(info))
}

/// Host side of `weed_bootstrap_f`.
///
/// # Safety
/// `getter` must be null or point to writable storage for one function
/// pointer.
pub unsafe extern "C" fn bootstrap(
    getter: *mut Option<DefaultGetterFn>,
    weed_min: c_int,
    weed_max: c_int,
    filter_min: c_int,
    filter_max: c_int,
) -> *mut c_void {
    if !getter.is_null() {
        getter.write(Some(default_getter as DefaultGetterFn));
    }

    let weed_api = negotiate_range(HOST_WEED_API_VERSIONS, weed_min, weed_max);
    let filter_api = negotiate_range(HOST_FILTER_API_VERSIONS, filter_min, filter_max);
    if weed_api == 0 || filter_api == 0 {
        tracing::warn!(
            weed_min,
            weed_max,
            filter_min,
            filter_max,
            "plugin API versions not supported by this host"
        );
        return ptr::null_mut();
    }

    let host_id: i64 = rand::random();
    let info = match new_host_info(weed_api, filter_api, host_id) {
        Ok(info) => info,
        Err(err) => {
            tracing::warn!(?err, "failed to build host info");
            return ptr::null_mut();
        }
    };
    let ptr = handles::expose(&info);
    HANDSHAKE.with(|slot| {
        let mut slot = slot.borrow_mut();
        let record = slot.get_or_insert(Handshake {
            host_info: None,
            host_id: 0,
            weed_api: 0,
            filter_api: 0,
            calls: 0,
        });
        record.calls += 1;
        record.host_info = Some(info);
        record.host_id = host_id;
        record.weed_api = weed_api;
        record.filter_api = filter_api;
    });
    ptr
}

unsafe fn key_str<'a>(key: *const c_char) -> Option<&'a str> {
    if key.is_null() {
        return None;
    }
    CStr::from_ptr(key).to_str().ok()
}

unsafe fn lookup<'a>(plant: *mut c_void, key: *const c_char) -> Result<(PlantHandle, &'a str), c_int> {
    let handle = handles::resolve(plant).ok_or(PlantError::NoSuchLeaf.code())?;
    let key = key_str(key).ok_or(PlantError::NoSuchLeaf.code())?;
    Ok((handle, key))
}

/// `weed_default_getter_f`: element 0 of a leaf.
///
/// # Safety
/// See [`leaf_get`].
pub unsafe extern "C" fn default_getter(
    plant: *mut c_void,
    key: *const c_char,
    value: *mut c_void,
) -> c_int {
    leaf_get(plant, key, 0, value)
}

/// Copy element `idx` of a leaf into `value`. A null `value` only checks
/// that the element exists. For strings `value` points at a `char *`
/// buffer of at least `element_size + 1` bytes.
///
/// # Safety
/// `key` must be a NUL-terminated string and `value` null or valid for a
/// write of the leaf's element type.
pub unsafe extern "C" fn leaf_get(
    plant: *mut c_void,
    key: *const c_char,
    idx: c_int,
    value: *mut c_void,
) -> c_int {
    let (handle, key) = match lookup(plant, key) {
        Ok(found) => found,
        Err(code) => return code,
    };
    let plant = handle.read();
    let Some(leaf) = plant.value(key) else {
        return PlantError::NoSuchLeaf.code();
    };
    if idx < 0 || idx as usize >= leaf.len() {
        return PlantError::NoSuchElement.code();
    }
    if value.is_null() {
        return NO_ERROR;
    }
    let idx = idx as usize;
    match leaf {
        LeafValue::Int(values) => value.cast::<i32>().write(values[idx]),
        LeafValue::Boolean(values) => value.cast::<i32>().write(values[idx] as i32),
        LeafValue::Double(values) => value.cast::<f64>().write(values[idx]),
        LeafValue::Int64(values) => value.cast::<i64>().write(values[idx]),
        LeafValue::String(values) => {
            let dst = *value.cast::<*mut c_char>();
            if dst.is_null() {
                return PlantError::MemoryAllocation.code();
            }
            let bytes = values[idx].as_bytes();
            ptr::copy_nonoverlapping(bytes.as_ptr().cast::<c_char>(), dst, bytes.len());
            dst.add(bytes.len()).write(0);
        }
        LeafValue::FuncPtr(values) | LeafValue::VoidPtr(values) => {
            value.cast::<*mut c_void>().write(values[idx].as_ptr())
        }
        LeafValue::PlantPtr(values) => {
            value.cast::<*mut c_void>().write(handles::expose(&values[idx]))
        }
    }
    NO_ERROR
}

unsafe fn read_values(seed: SeedType, num: usize, values: *mut c_void) -> Result<LeafValue, PlantError> {
    if num == 0 {
        return Ok(LeafValue::empty(seed));
    }
    if values.is_null() {
        return Err(PlantError::NoSuchElement);
    }
    Ok(match seed {
        SeedType::Int => LeafValue::Int(slice::from_raw_parts(values.cast::<i32>(), num).to_vec()),
        SeedType::Boolean => LeafValue::Boolean(
            slice::from_raw_parts(values.cast::<i32>(), num)
                .iter()
                .map(|&v| v != 0)
                .collect(),
        ),
        SeedType::Double => {
            LeafValue::Double(slice::from_raw_parts(values.cast::<f64>(), num).to_vec())
        }
        SeedType::Int64 => {
            LeafValue::Int64(slice::from_raw_parts(values.cast::<i64>(), num).to_vec())
        }
        SeedType::String => LeafValue::String(
            slice::from_raw_parts(values.cast::<*const c_char>(), num)
                .iter()
                .map(|&s| {
                    if s.is_null() {
                        String::new()
                    } else {
                        CStr::from_ptr(s).to_string_lossy().into_owned()
                    }
                })
                .collect(),
        ),
        SeedType::FuncPtr | SeedType::VoidPtr => {
            let ptrs = slice::from_raw_parts(values.cast::<*mut c_void>(), num)
                .iter()
                .map(|&p| VoidPtr(p))
                .collect();
            if seed == SeedType::FuncPtr {
                LeafValue::FuncPtr(ptrs)
            } else {
                LeafValue::VoidPtr(ptrs)
            }
        }
        SeedType::PlantPtr => LeafValue::PlantPtr(
            slice::from_raw_parts(values.cast::<*mut c_void>(), num)
                .iter()
                .map(|&p| handles::resolve(p).ok_or(PlantError::NoSuchElement))
                .collect::<Result<_, _>>()?,
        ),
    })
}

/// Replace a leaf with `num_elems` elements read from `values`.
///
/// # Safety
/// `values` must point to `num_elems` elements of the given seed type
/// (strings as `char *`, pointers as `void *`).
pub unsafe extern "C" fn leaf_set(
    plant: *mut c_void,
    key: *const c_char,
    seed_type: c_int,
    num_elems: c_int,
    values: *mut c_void,
) -> c_int {
    let (handle, key) = match lookup(plant, key) {
        Ok(found) => found,
        Err(code) => return code,
    };
    let Some(seed) = SeedType::from_code(seed_type) else {
        return PlantError::WrongSeedType.code();
    };
    let value = match read_values(seed, num_elems.max(0) as usize, values) {
        Ok(value) => value,
        Err(err) => return err.code(),
    };
    let result = handle.write().set_from(Origin::Plugin, key, value);
    result_code(result)
}

/// # Safety
/// Callable with any argument.
pub unsafe extern "C" fn plant_new(plant_type: c_int) -> *mut c_void {
    handles::table().adopt(PlantHandle::from_plant(Plant::with_type_code(plant_type)))
}

/// NULL-terminated array of leaf names, allocated with `malloc`; the plugin
/// frees it with the host's free function.
///
/// # Safety
/// `plant` may be any value; unknown plants yield null.
pub unsafe extern "C" fn list_leaves(plant: *mut c_void) -> *mut *mut c_char {
    let Some(handle) = handles::resolve(plant) else {
        return ptr::null_mut();
    };
    let plant = handle.read();
    let count = plant.len();
    let list = libc::malloc((count + 1) * mem::size_of::<*mut c_char>()).cast::<*mut c_char>();
    if list.is_null() {
        return ptr::null_mut();
    }
    for (i, key) in plant.keys().enumerate() {
        let bytes = key.as_bytes();
        let copy = libc::malloc(bytes.len() + 1).cast::<c_char>();
        if copy.is_null() {
            for j in 0..i {
                libc::free(list.add(j).read().cast());
            }
            libc::free(list.cast());
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(bytes.as_ptr().cast::<c_char>(), copy, bytes.len());
        copy.add(bytes.len()).write(0);
        list.add(i).write(copy);
    }
    list.add(count).write(ptr::null_mut());
    list
}

/// # Safety
/// `key` must be null or NUL-terminated.
pub unsafe extern "C" fn num_elements(plant: *mut c_void, key: *const c_char) -> c_int {
    match lookup(plant, key) {
        Ok((handle, key)) => handle.read().num_elements(key) as c_int,
        Err(_) => 0,
    }
}

/// # Safety
/// `key` must be null or NUL-terminated.
pub unsafe extern "C" fn element_size(plant: *mut c_void, key: *const c_char, idx: c_int) -> usize {
    if idx < 0 {
        return 0;
    }
    match lookup(plant, key) {
        Ok((handle, key)) => handle.read().element_size(key, idx as usize).unwrap_or(0),
        Err(_) => 0,
    }
}

/// # Safety
/// `key` must be null or NUL-terminated.
pub unsafe extern "C" fn seed_type(plant: *mut c_void, key: *const c_char) -> c_int {
    match lookup(plant, key) {
        Ok((handle, key)) => handle.read().seed_type(key).map(SeedType::code).unwrap_or(0),
        Err(_) => 0,
    }
}

/// # Safety
/// `key` must be null or NUL-terminated.
pub unsafe extern "C" fn get_flags(plant: *mut c_void, key: *const c_char) -> c_int {
    match lookup(plant, key) {
        Ok((handle, key)) => handle
            .read()
            .leaf_flags(key)
            .map(LeafFlags::abi_bits)
            .unwrap_or(0),
        Err(_) => 0,
    }
}

/// Plugins may change the shared flag bits, but cannot lift a read-only
/// bit the host placed on a leaf.
///
/// # Safety
/// `key` must be null or NUL-terminated.
pub unsafe extern "C" fn set_flags(plant: *mut c_void, key: *const c_char, flags: c_int) -> c_int {
    let (handle, key) = match lookup(plant, key) {
        Ok(found) => found,
        Err(code) => return code,
    };
    let mut plant = handle.write();
    let old = match plant.leaf_flags(key) {
        Ok(old) => old,
        Err(err) => return err.code(),
    };
    let host_bits = old.bits() & !LeafFlags::ABI_MASK;
    let plugin_bits = flags as u32 & LeafFlags::ABI_MASK;
    let new = LeafFlags::from_bits(host_bits | plugin_bits) | (old & LeafFlags::READONLY_PLUGIN);
    result_code(plant.set_leaf_flags(key, new))
}

/// # Safety
/// `plant` may be any value.
pub unsafe extern "C" fn plant_free(plant: *mut c_void) -> c_int {
    if plant.is_null() {
        return PlantError::NoSuchLeaf.code();
    }
    handles::table().release(plant);
    NO_ERROR
}

/// # Safety
/// `key` must be null or NUL-terminated.
pub unsafe extern "C" fn leaf_delete(plant: *mut c_void, key: *const c_char) -> c_int {
    let (handle, key) = match lookup(plant, key) {
        Ok(found) => found,
        Err(code) => return code,
    };
    let result = handle.write().delete_from(Origin::Plugin, key);
    result_code(result)
}
