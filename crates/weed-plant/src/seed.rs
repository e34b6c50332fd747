use std::ffi::c_void;
use std::mem;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use thiserror::Error;

/// Primitive element type stored by a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SeedType {
    Int = 1,
    Double = 2,
    Boolean = 3,
    String = 4,
    Int64 = 5,
    FuncPtr = 64,
    VoidPtr = 65,
    PlantPtr = 66,
}

impl SeedType {
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => SeedType::Int,
            2 => SeedType::Double,
            3 => SeedType::Boolean,
            4 => SeedType::String,
            5 => SeedType::Int64,
            64 => SeedType::FuncPtr,
            65 => SeedType::VoidPtr,
            66 => SeedType::PlantPtr,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_pointer(self) -> bool {
        matches!(
            self,
            SeedType::FuncPtr | SeedType::VoidPtr | SeedType::PlantPtr
        )
    }

    /// Width of one element in memory, `None` for strings.
    pub fn element_size(self) -> Option<usize> {
        match self {
            SeedType::Int | SeedType::Boolean => Some(mem::size_of::<i32>()),
            SeedType::Double => Some(mem::size_of::<f64>()),
            SeedType::Int64 => Some(mem::size_of::<i64>()),
            SeedType::FuncPtr | SeedType::VoidPtr | SeedType::PlantPtr => {
                Some(mem::size_of::<*mut c_void>())
            }
            SeedType::String => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SeedType::Int => "int",
            SeedType::Double => "double",
            SeedType::Boolean => "boolean",
            SeedType::String => "string",
            SeedType::Int64 => "int64",
            SeedType::FuncPtr => "funcptr",
            SeedType::VoidPtr => "voidptr",
            SeedType::PlantPtr => "plantptr",
        }
    }
}

/// Per-leaf mutability flags.
///
/// The two low bits are shared with plugins; the remaining bits are host
/// bookkeeping and never leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LeafFlags(u32);

impl LeafFlags {
    pub const NONE: Self = Self(0);
    pub const READONLY_PLUGIN: Self = Self(1 << 0);
    pub const READONLY_HOST: Self = Self(1 << 1);
    pub const UNDELETABLE: Self = Self(1 << 8);
    pub const AUTO_FREE: Self = Self(1 << 9);
    pub const IMMUTABLE: Self = Self(Self::READONLY_PLUGIN.0 | Self::READONLY_HOST.0);

    /// Bits visible through the plugin ABI.
    pub const ABI_MASK: u32 = 0xff;

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn abi_bits(self) -> i32 {
        (self.0 & Self::ABI_MASK) as i32
    }
}

impl BitOr for LeafFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for LeafFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for LeafFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for LeafFlags {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

/// Who is writing a leaf; decides which read-only bit applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Host,
    Plugin,
}

impl Origin {
    pub(crate) fn readonly_flag(self) -> LeafFlags {
        match self {
            Origin::Host => LeafFlags::READONLY_HOST,
            Origin::Plugin => LeafFlags::READONLY_PLUGIN,
        }
    }
}

/// Leaf-level failures. The discriminants are the Weed core error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum PlantError {
    #[error("memory allocation failed")]
    MemoryAllocation,
    #[error("leaf is read-only")]
    LeafReadonly,
    #[error("no such element")]
    NoSuchElement,
    #[error("no such leaf")]
    NoSuchLeaf,
    #[error("wrong seed type")]
    WrongSeedType,
    #[error("leaf cannot be deleted")]
    Undeletable,
}

impl PlantError {
    pub const NO_ERROR: i32 = 0;

    pub fn code(self) -> i32 {
        match self {
            PlantError::MemoryAllocation => 1,
            PlantError::LeafReadonly | PlantError::Undeletable => 2,
            PlantError::NoSuchElement => 3,
            PlantError::NoSuchLeaf => 4,
            PlantError::WrongSeedType => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => PlantError::MemoryAllocation,
            2 => PlantError::LeafReadonly,
            3 => PlantError::NoSuchElement,
            4 => PlantError::NoSuchLeaf,
            5 => PlantError::WrongSeedType,
            _ => return None,
        })
    }
}

/// Convert a leaf operation result into the integer returned across the ABI.
pub fn result_code(result: Result<(), PlantError>) -> i32 {
    match result {
        Ok(()) => PlantError::NO_ERROR,
        Err(err) => err.code(),
    }
}
