use std::ffi::c_void;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::keys;
use crate::seed::{LeafFlags, Origin, PlantError, SeedType};
use crate::value::{LeafValue, VoidPtr};

/// Entity kinds recognised by the `type` leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PlantType {
    Unknown = 0,
    PluginInfo = 1,
    FilterClass = 2,
    FilterInstance = 3,
    ChannelTemplate = 4,
    ParameterTemplate = 5,
    Channel = 6,
    Parameter = 7,
    Gui = 8,
    HostInfo = 9,
    Layer = 128,
}

impl PlantType {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => PlantType::PluginInfo,
            2 => PlantType::FilterClass,
            3 => PlantType::FilterInstance,
            4 => PlantType::ChannelTemplate,
            5 => PlantType::ParameterTemplate,
            6 => PlantType::Channel,
            7 => PlantType::Parameter,
            8 => PlantType::Gui,
            9 => PlantType::HostInfo,
            128 => PlantType::Layer,
            _ => PlantType::Unknown,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// One key/value entry of a plant.
#[derive(Debug, Clone)]
pub struct Leaf {
    key: String,
    value: LeafValue,
    flags: LeafFlags,
}

impl Leaf {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &LeafValue {
        &self.value
    }

    pub fn flags(&self) -> LeafFlags {
        self.flags
    }

    pub fn seed_type(&self) -> SeedType {
        self.value.seed_type()
    }

    pub fn num_elements(&self) -> usize {
        self.value.len()
    }
}

macro_rules! typed_getters {
    ($one:ident, $many:ident, $variant:ident, $ty:ty) => {
        pub fn $one(&self, key: &str) -> Result<$ty, PlantError> {
            match self.value(key) {
                None => Err(PlantError::NoSuchLeaf),
                Some(LeafValue::$variant(values)) => {
                    values.first().cloned().ok_or(PlantError::NoSuchElement)
                }
                Some(_) => Err(PlantError::WrongSeedType),
            }
        }

        pub fn $many(&self, key: &str) -> Result<&[$ty], PlantError> {
            match self.value(key) {
                None => Err(PlantError::NoSuchLeaf),
                Some(LeafValue::$variant(values)) => Ok(values.as_slice()),
                Some(_) => Err(PlantError::WrongSeedType),
            }
        }
    };
}

/// A typed, open-ended key/value container.
///
/// Leaves keep their insertion order so that encoding is deterministic.
/// The `type` leaf is created read-only for both sides and cannot be
/// deleted.
#[derive(Debug, Clone, Default)]
pub struct Plant {
    leaves: Vec<Leaf>,
}

impl Plant {
    pub fn new(plant_type: PlantType) -> Self {
        Self::with_type_code(plant_type.code())
    }

    pub fn with_type_code(code: i32) -> Self {
        Plant {
            leaves: vec![Leaf {
                key: keys::TYPE.to_string(),
                value: LeafValue::Int(vec![code]),
                flags: LeafFlags::IMMUTABLE | LeafFlags::UNDELETABLE,
            }],
        }
    }

    /// A plant without even a `type` leaf, used while decoding.
    pub fn bare() -> Self {
        Plant { leaves: Vec::new() }
    }

    pub fn type_code(&self) -> i32 {
        self.get_int(keys::TYPE).unwrap_or(0)
    }

    pub fn plant_type(&self) -> PlantType {
        PlantType::from_code(self.type_code())
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.leaves.iter().position(|leaf| leaf.key == key)
    }

    pub fn leaf(&self, key: &str) -> Option<&Leaf> {
        self.leaves.iter().find(|leaf| leaf.key == key)
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Leaf> {
        self.leaves.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.leaves.iter().map(|leaf| leaf.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn has_leaf(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn value(&self, key: &str) -> Option<&LeafValue> {
        self.leaf(key).map(|leaf| &leaf.value)
    }

    pub fn num_elements(&self, key: &str) -> usize {
        self.leaf(key).map(Leaf::num_elements).unwrap_or(0)
    }

    pub fn seed_type(&self, key: &str) -> Option<SeedType> {
        self.leaf(key).map(Leaf::seed_type)
    }

    pub fn element_size(&self, key: &str, idx: usize) -> Result<usize, PlantError> {
        let leaf = self.leaf(key).ok_or(PlantError::NoSuchLeaf)?;
        leaf.value
            .element_size(idx)
            .ok_or(PlantError::NoSuchElement)
    }

    pub fn leaf_flags(&self, key: &str) -> Result<LeafFlags, PlantError> {
        self.leaf(key)
            .map(Leaf::flags)
            .ok_or(PlantError::NoSuchLeaf)
    }

    /// Host-side write.
    pub fn set(&mut self, key: &str, value: impl Into<LeafValue>) -> Result<(), PlantError> {
        self.set_from(Origin::Host, key, value.into())
    }

    /// Write on behalf of `origin`, honouring that side's read-only bit and
    /// the fixed seed type of an existing leaf.
    pub fn set_from(
        &mut self,
        origin: Origin,
        key: &str,
        value: LeafValue,
    ) -> Result<(), PlantError> {
        match self.position(key) {
            Some(idx) => {
                let leaf = &mut self.leaves[idx];
                if leaf.flags.contains(origin.readonly_flag()) {
                    return Err(PlantError::LeafReadonly);
                }
                if leaf.value.seed_type() != value.seed_type() {
                    return Err(PlantError::WrongSeedType);
                }
                leaf.value = value;
            }
            None => self.leaves.push(Leaf {
                key: key.to_string(),
                value,
                flags: LeafFlags::NONE,
            }),
        }
        Ok(())
    }

    /// Write ignoring read-only bits. The seed type rule still holds.
    pub fn force_set(&mut self, key: &str, value: impl Into<LeafValue>) -> Result<(), PlantError> {
        let value = value.into();
        match self.position(key) {
            Some(idx) => {
                let leaf = &mut self.leaves[idx];
                if leaf.value.seed_type() != value.seed_type() {
                    return Err(PlantError::WrongSeedType);
                }
                leaf.value = value;
                Ok(())
            }
            None => self.set_from(Origin::Host, key, value),
        }
    }

    pub fn delete(&mut self, key: &str) -> Result<(), PlantError> {
        self.delete_from(Origin::Host, key)
    }

    pub fn delete_from(&mut self, origin: Origin, key: &str) -> Result<(), PlantError> {
        let idx = self.position(key).ok_or(PlantError::NoSuchLeaf)?;
        let flags = self.leaves[idx].flags;
        if flags.contains(LeafFlags::UNDELETABLE) {
            return Err(PlantError::Undeletable);
        }
        if flags.contains(origin.readonly_flag()) {
            return Err(PlantError::LeafReadonly);
        }
        self.leaves.remove(idx);
        Ok(())
    }

    /// Delete after clearing every flag on the leaf. Only a missing leaf can
    /// fail here.
    pub fn force_delete(&mut self, key: &str) -> Result<(), PlantError> {
        let idx = self.position(key).ok_or(PlantError::NoSuchLeaf)?;
        self.leaves[idx].flags = LeafFlags::NONE;
        self.leaves.remove(idx);
        Ok(())
    }

    /// Delete if present; absence is not an error.
    pub fn remove(&mut self, key: &str) {
        if let Some(idx) = self.position(key) {
            self.leaves.remove(idx);
        }
    }

    pub fn set_leaf_flags(&mut self, key: &str, flags: LeafFlags) -> Result<(), PlantError> {
        let idx = self.position(key).ok_or(PlantError::NoSuchLeaf)?;
        self.leaves[idx].flags = flags;
        Ok(())
    }

    pub fn add_flags_to_all(&mut self, flags: LeafFlags) {
        for leaf in &mut self.leaves {
            leaf.flags |= flags;
        }
    }

    pub fn clear_flags_on_all(&mut self, flags: LeafFlags) {
        for leaf in &mut self.leaves {
            if leaf.key != keys::TYPE {
                leaf.flags = leaf.flags & !flags;
            }
        }
    }

    /// Drop every leaf except `type`. Used to break plugin-made reference
    /// cycles before unloading.
    pub fn clear(&mut self) {
        self.leaves.retain(|leaf| leaf.key == keys::TYPE);
    }

    /// Copy `src_key` of `src` into `dst_key` of this plant.
    pub fn copy_leaf_from(
        &mut self,
        dst_key: &str,
        src: &Plant,
        src_key: &str,
    ) -> Result<(), PlantError> {
        let value = src.value(src_key).ok_or(PlantError::NoSuchLeaf)?.clone();
        if let Some(idx) = self.position(dst_key) {
            if self.leaves[idx].seed_type() != value.seed_type() {
                self.leaves[idx].flags = LeafFlags::NONE;
                self.leaves.remove(idx);
            }
        }
        self.force_set(dst_key, value)
    }

    typed_getters!(get_int, get_ints, Int, i32);
    typed_getters!(get_double, get_doubles, Double, f64);
    typed_getters!(get_bool, get_bools, Boolean, bool);
    typed_getters!(get_string, get_strings, String, String);
    typed_getters!(get_int64, get_int64s, Int64, i64);
    typed_getters!(get_funcptr, get_funcptrs, FuncPtr, VoidPtr);
    typed_getters!(get_voidptr, get_voidptrs, VoidPtr, VoidPtr);
    typed_getters!(get_plant, get_plants, PlantPtr, PlantHandle);

    pub fn int_or(&self, key: &str, default: i32) -> i32 {
        self.get_int(key).unwrap_or(default)
    }

    pub fn double_or(&self, key: &str, default: f64) -> f64 {
        self.get_double(key).unwrap_or(default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    pub fn is_true(&self, key: &str) -> bool {
        self.bool_or(key, false)
    }

    /// The `flags` leaf, 0 when absent.
    pub fn flag_bits(&self) -> i32 {
        self.int_or(keys::FLAGS, 0)
    }

    pub fn has_flag(&self, bit: i32) -> bool {
        self.flag_bits() & bit != 0
    }

    /// Plant-pointer array as owned handles, empty when absent.
    pub fn plants(&self, key: &str) -> Vec<PlantHandle> {
        self.get_plants(key).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Copy of this plant without plant-pointer leaves.
    pub fn detached(&self) -> Plant {
        Plant {
            leaves: self
                .leaves
                .iter()
                .filter(|leaf| leaf.seed_type() != SeedType::PlantPtr)
                .cloned()
                .collect(),
        }
    }

    pub(crate) fn push_leaf_unchecked(&mut self, key: String, value: LeafValue) {
        if let Some(idx) = self.position(&key) {
            self.leaves[idx].value = value;
        } else {
            self.leaves.push(Leaf {
                key,
                value,
                flags: LeafFlags::NONE,
            });
        }
    }
}

/// Shared, lockable plant with a stable address.
///
/// The address of the inner allocation is what plugins see as
/// `weed_plant_t *`; it stays valid for as long as any handle exists.
#[derive(Clone)]
pub struct PlantHandle(Arc<RwLock<Plant>>);

impl PlantHandle {
    pub fn new(plant_type: PlantType) -> Self {
        Self::from_plant(Plant::new(plant_type))
    }

    pub fn from_plant(plant: Plant) -> Self {
        PlantHandle(Arc::new(RwLock::new(plant)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Plant> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Plant> {
        self.0.write()
    }

    pub fn plant_type(&self) -> PlantType {
        self.read().plant_type()
    }

    pub fn as_ptr(&self) -> *mut c_void {
        Arc::as_ptr(&self.0) as *mut c_void
    }

    pub fn addr(&self) -> usize {
        self.as_ptr() as usize
    }

    pub fn ptr_eq(&self, other: &PlantHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakPlant {
        WeakPlant(Arc::downgrade(&self.0))
    }

    pub fn snapshot(&self) -> Plant {
        self.read().clone()
    }

    pub fn set(&self, key: &str, value: impl Into<LeafValue>) -> Result<(), PlantError> {
        self.write().set(key, value)
    }

    pub fn has_leaf(&self, key: &str) -> bool {
        self.read().has_leaf(key)
    }

    pub fn int_or(&self, key: &str, default: i32) -> i32 {
        self.read().int_or(key, default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.read().bool_or(key, default)
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.read().get_string(key).ok()
    }

    pub fn plants(&self, key: &str) -> Vec<PlantHandle> {
        self.read().plants(key)
    }

    pub fn plant(&self, key: &str) -> Option<PlantHandle> {
        self.read().get_plant(key).ok()
    }
}

impl PartialEq for PlantHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for PlantHandle {}

impl Hash for PlantHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for PlantHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlantHandle({:#x})", self.addr())
    }
}

/// Non-owning plant reference.
#[derive(Clone, Debug)]
pub struct WeakPlant(Weak<RwLock<Plant>>);

impl WeakPlant {
    pub fn upgrade(&self) -> Option<PlantHandle> {
        self.0.upgrade().map(PlantHandle)
    }

    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }
}
