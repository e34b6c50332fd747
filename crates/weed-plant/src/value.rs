use std::ffi::c_void;
use std::fmt;

use crate::plant::PlantHandle;
use crate::seed::SeedType;

/// An opaque address carried by `voidptr` and `funcptr` leaves.
///
/// The host never dereferences these on its own; pixel and audio buffers are
/// owned elsewhere and only their addresses travel through plants.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoidPtr(pub *mut c_void);

// Addresses are plain data; ownership of the pointee is tracked by the host.
unsafe impl Send for VoidPtr {}
unsafe impl Sync for VoidPtr {}

impl VoidPtr {
    pub const NULL: VoidPtr = VoidPtr(std::ptr::null_mut());

    pub fn from_addr(addr: usize) -> Self {
        VoidPtr(addr as *mut c_void)
    }

    pub fn addr(self) -> usize {
        self.0 as usize
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }

    /// Pointer `bytes` further on.
    pub fn offset(self, bytes: usize) -> Self {
        VoidPtr((self.0 as *mut u8).wrapping_add(bytes) as *mut c_void)
    }
}

impl Default for VoidPtr {
    fn default() -> Self {
        VoidPtr::NULL
    }
}

impl fmt::Debug for VoidPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

impl<T> From<*mut T> for VoidPtr {
    fn from(ptr: *mut T) -> Self {
        VoidPtr(ptr as *mut c_void)
    }
}

/// The typed element array of a leaf.
///
/// A leaf may hold zero elements while still carrying its seed type.
#[derive(Debug, Clone, PartialEq)]
pub enum LeafValue {
    Int(Vec<i32>),
    Double(Vec<f64>),
    Boolean(Vec<bool>),
    String(Vec<String>),
    Int64(Vec<i64>),
    FuncPtr(Vec<VoidPtr>),
    VoidPtr(Vec<VoidPtr>),
    PlantPtr(Vec<PlantHandle>),
}

impl LeafValue {
    pub fn empty(seed: SeedType) -> Self {
        match seed {
            SeedType::Int => LeafValue::Int(Vec::new()),
            SeedType::Double => LeafValue::Double(Vec::new()),
            SeedType::Boolean => LeafValue::Boolean(Vec::new()),
            SeedType::String => LeafValue::String(Vec::new()),
            SeedType::Int64 => LeafValue::Int64(Vec::new()),
            SeedType::FuncPtr => LeafValue::FuncPtr(Vec::new()),
            SeedType::VoidPtr => LeafValue::VoidPtr(Vec::new()),
            SeedType::PlantPtr => LeafValue::PlantPtr(Vec::new()),
        }
    }

    pub fn seed_type(&self) -> SeedType {
        match self {
            LeafValue::Int(_) => SeedType::Int,
            LeafValue::Double(_) => SeedType::Double,
            LeafValue::Boolean(_) => SeedType::Boolean,
            LeafValue::String(_) => SeedType::String,
            LeafValue::Int64(_) => SeedType::Int64,
            LeafValue::FuncPtr(_) => SeedType::FuncPtr,
            LeafValue::VoidPtr(_) => SeedType::VoidPtr,
            LeafValue::PlantPtr(_) => SeedType::PlantPtr,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            LeafValue::Int(v) => v.len(),
            LeafValue::Double(v) => v.len(),
            LeafValue::Boolean(v) => v.len(),
            LeafValue::String(v) => v.len(),
            LeafValue::Int64(v) => v.len(),
            LeafValue::FuncPtr(v) | LeafValue::VoidPtr(v) => v.len(),
            LeafValue::PlantPtr(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte size of element `idx`: string length without terminator, or the
    /// fixed seed width.
    pub fn element_size(&self, idx: usize) -> Option<usize> {
        if idx >= self.len() {
            return None;
        }
        match self {
            LeafValue::String(v) => Some(v[idx].len()),
            other => other.seed_type().element_size(),
        }
    }

    /// Keep the first `len` elements, padding with the last element when
    /// growing. An empty array is padded with `fill`.
    pub fn resize_with_last(&mut self, len: usize, fill: &LeafValue) -> bool {
        fn grow<T: Clone>(v: &mut Vec<T>, len: usize, fill: Option<&T>) -> bool {
            if v.len() >= len {
                v.truncate(len);
                return true;
            }
            let pad = match v.last().or(fill) {
                Some(pad) => pad.clone(),
                None => return false,
            };
            v.resize(len, pad);
            true
        }
        match (self, fill) {
            (LeafValue::Int(v), LeafValue::Int(f)) => grow(v, len, f.first()),
            (LeafValue::Double(v), LeafValue::Double(f)) => grow(v, len, f.first()),
            (LeafValue::Boolean(v), LeafValue::Boolean(f)) => grow(v, len, f.first()),
            (LeafValue::String(v), LeafValue::String(f)) => grow(v, len, f.first()),
            (LeafValue::Int64(v), LeafValue::Int64(f)) => grow(v, len, f.first()),
            _ => false,
        }
    }
}

macro_rules! impl_from_scalar {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for LeafValue {
            fn from(value: $ty) -> Self {
                LeafValue::$variant(vec![value])
            }
        }

        impl From<Vec<$ty>> for LeafValue {
            fn from(values: Vec<$ty>) -> Self {
                LeafValue::$variant(values)
            }
        }

        impl From<&[$ty]> for LeafValue {
            fn from(values: &[$ty]) -> Self {
                LeafValue::$variant(values.to_vec())
            }
        }
    };
}

impl_from_scalar!(i32, Int);
impl_from_scalar!(f64, Double);
impl_from_scalar!(bool, Boolean);
impl_from_scalar!(i64, Int64);
impl_from_scalar!(VoidPtr, VoidPtr);
impl_from_scalar!(PlantHandle, PlantPtr);
impl_from_scalar!(String, String);

impl From<&str> for LeafValue {
    fn from(value: &str) -> Self {
        LeafValue::String(vec![value.to_string()])
    }
}

impl From<Vec<&str>> for LeafValue {
    fn from(values: Vec<&str>) -> Self {
        LeafValue::String(values.into_iter().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn element_sizes_follow_seed() {
        let value = LeafValue::from(vec!["ab", "cde"]);
        assert_eq!(value.element_size(1), Some(3));
        assert_eq!(value.element_size(2), None);
        assert_eq!(LeafValue::from(1.5f64).element_size(0), Some(8));
        assert_eq!(LeafValue::from(vec![1i32, 2]).element_size(1), Some(4));
    }

    #[test]
    fn resize_pads_with_last_element() {
        let mut value = LeafValue::from(vec![1.0f64, 2.5]);
        assert!(value.resize_with_last(4, &LeafValue::from(0.0f64)));
        assert_eq!(value, LeafValue::from(vec![1.0, 2.5, 2.5, 2.5]));

        let mut empty = LeafValue::Int(Vec::new());
        assert!(empty.resize_with_last(2, &LeafValue::from(7)));
        assert_eq!(empty, LeafValue::from(vec![7, 7]));

        assert!(value.resize_with_last(1, &LeafValue::from(0.0f64)));
        assert_eq!(value, LeafValue::from(1.0f64));
    }

    #[test]
    fn void_ptr_offsets() {
        let base = VoidPtr::from_addr(0x1000);
        assert_eq!(base.offset(0x20).addr(), 0x1020);
        assert!(VoidPtr::NULL.is_null());
    }
}
