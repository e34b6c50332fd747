//! Binary encoding of plants and leaves.
//!
//! Leaf record: `[keylen][key]? [seed][count] {[len][bytes]}*`, every integer
//! a little-endian 32-bit word and strings written without a terminator.
//! A plant is `[leafcount]` followed by its `type` leaf and then the other
//! leaves in plant order. Plant-pointer leaves are never written.
//!
//! `pixel_data` leaves backed by a [`FrameBuffer`] use an extended record: a
//! zero-length first element, `FRAME_MAGIC`, `FRAME_VERSION`, plane count,
//! palette, width, height, per-plane `(rowstride, bytelen)`, a contiguity
//! word and then the pixel bytes.

use thiserror::Error;

use crate::keys;
use crate::palette::Palette;
use crate::pixel::FrameBuffer;
use crate::plant::{Plant, PlantType};
use crate::seed::{LeafFlags, SeedType};
use crate::value::{LeafValue, VoidPtr};

pub const MAX_KEY_LEN: usize = 4096;
pub const MAX_LEAVES: usize = 1 << 16;
pub const MAX_ELEMENTS: usize = 1 << 20;
pub const MAX_ELEMENT_LEN: usize = 1 << 24;
pub const MAX_FRAME_BYTES: usize = 1 << 30;
pub const MAX_FRAME_DIMENSION: usize = 1 << 16;

pub const FRAME_MAGIC: u32 = 0x5744_4658;
pub const FRAME_VERSION: u32 = 1;

/// Bytes that open every `type` leaf record: key length 4, `"type"`, seed
/// INT, one element.
const TYPE_LEAF_PATTERN: [u8; 16] = [
    4, 0, 0, 0, b't', b'y', b'p', b'e', 1, 0, 0, 0, 1, 0, 0, 0,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerialError {
    #[error("input ended after {0} bytes")]
    Truncated(usize),
    #[error("key of {0} bytes exceeds the limit")]
    KeyTooLong(usize),
    #[error("{0} leaves exceeds the limit")]
    TooManyLeaves(usize),
    #[error("{0} elements exceeds the limit")]
    TooManyElements(usize),
    #[error("element of {0} bytes exceeds the limit")]
    ElementTooLarge(usize),
    #[error("unknown seed type {0}")]
    BadSeedType(i32),
    #[error("{seed} element has {len} bytes")]
    BadElementSize { seed: &'static str, len: usize },
    #[error("string is not valid UTF-8")]
    BadUtf8,
    #[error("plant does not start with a type leaf")]
    NotTypeLeaf,
    #[error("plant has unknown type")]
    UnknownPlantType,
    #[error("bad pixel header: {0}")]
    BadPixelHeader(&'static str),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("no type leaf found while realigning")]
    NoRealignment,
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_len(out: &mut Vec<u8>, len: usize) {
    put_u32(out, len as u32);
}

/// Append one leaf record. `key` is omitted for keyless records such as
/// persisted defaults.
pub fn encode_leaf(out: &mut Vec<u8>, key: Option<&str>, value: &LeafValue) {
    if let Some(key) = key {
        put_len(out, key.len());
        out.extend_from_slice(key.as_bytes());
    }
    put_i32(out, value.seed_type().code());
    put_len(out, value.len());
    match value {
        LeafValue::Int(values) => {
            for v in values {
                put_len(out, 4);
                put_i32(out, *v);
            }
        }
        LeafValue::Boolean(values) => {
            for v in values {
                put_len(out, 4);
                put_i32(out, i32::from(*v));
            }
        }
        LeafValue::Double(values) => {
            for v in values {
                put_len(out, 8);
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        LeafValue::Int64(values) => {
            for v in values {
                put_len(out, 8);
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        LeafValue::String(values) => {
            for v in values {
                put_len(out, v.len());
                out.extend_from_slice(v.as_bytes());
            }
        }
        LeafValue::FuncPtr(values) | LeafValue::VoidPtr(values) => {
            for v in values {
                put_len(out, 8);
                out.extend_from_slice(&(v.addr() as u64).to_le_bytes());
            }
        }
        LeafValue::PlantPtr(_) => {}
    }
}

fn encode_frame_leaf(out: &mut Vec<u8>, frame: &FrameBuffer) {
    put_len(out, keys::PIXEL_DATA.len());
    out.extend_from_slice(keys::PIXEL_DATA.as_bytes());
    put_i32(out, SeedType::VoidPtr.code());
    put_len(out, frame.num_planes());
    put_u32(out, 0);
    put_u32(out, FRAME_MAGIC);
    put_u32(out, FRAME_VERSION);
    put_len(out, frame.num_planes());
    put_i32(out, frame.palette().code());
    put_len(out, frame.width());
    put_len(out, frame.height());
    for (rowstride, bytes) in frame.plane_layout() {
        put_len(out, rowstride);
        put_len(out, bytes);
    }
    put_u32(out, 1);
    out.extend_from_slice(frame.as_bytes());
}

/// Append a plant. When `frame` is given it replaces the `pixel_data` leaf.
pub fn encode_plant(out: &mut Vec<u8>, plant: &Plant, frame: Option<&FrameBuffer>) {
    let written = |key: &str, seed: SeedType| {
        seed != SeedType::PlantPtr && key != keys::TYPE && !(frame.is_some() && key == keys::PIXEL_DATA)
    };
    let others = plant
        .leaves()
        .filter(|leaf| written(leaf.key(), leaf.seed_type()))
        .count();
    put_len(out, others + 1 + usize::from(frame.is_some()));

    encode_leaf(out, Some(keys::TYPE), &LeafValue::Int(vec![plant.type_code()]));
    for leaf in plant.leaves() {
        if written(leaf.key(), leaf.seed_type()) {
            encode_leaf(out, Some(leaf.key()), leaf.value());
        }
    }
    if let Some(frame) = frame {
        encode_frame_leaf(out, frame);
    }
}

pub fn plant_to_bytes(plant: &Plant) -> Vec<u8> {
    let mut out = Vec::new();
    encode_plant(&mut out, plant, None);
    out
}

/// A decoded plant and, for layers, the frame its `pixel_data` described.
#[derive(Debug)]
pub struct Decoded {
    pub plant: Plant,
    pub frame: Option<FrameBuffer>,
}

/// One decoded leaf record.
#[derive(Debug)]
pub enum LeafRecord {
    Value(LeafValue),
    Frame(FrameBuffer),
    /// Plant pointers cannot be restored.
    Skipped,
}

/// Cursor over an encoded byte stream.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Decoder { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], SerialError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(SerialError::Truncated(self.buf.len()))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, SerialError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, SerialError> {
        Ok(self.read_u32()? as i32)
    }

    fn read_u64(&mut self) -> Result<u64, SerialError> {
        let bytes = self.read_bytes(8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(word))
    }

    fn read_len(&mut self) -> Result<usize, SerialError> {
        Ok(self.read_u32()? as usize)
    }

    /// Length-prefixed string.
    pub fn read_string(&mut self, limit: usize) -> Result<String, SerialError> {
        let len = self.read_len()?;
        if len > limit {
            return Err(SerialError::KeyTooLong(len));
        }
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| SerialError::BadUtf8)
    }

    fn read_element(&mut self, seed: SeedType) -> Result<&'a [u8], SerialError> {
        let len = self.read_len()?;
        if len > MAX_ELEMENT_LEN {
            return Err(SerialError::ElementTooLarge(len));
        }
        let expected = match seed {
            SeedType::String => None,
            SeedType::FuncPtr | SeedType::VoidPtr | SeedType::PlantPtr => Some(8),
            other => other.element_size(),
        };
        if let Some(expected) = expected {
            if expected != len {
                return Err(SerialError::BadElementSize {
                    seed: seed.label(),
                    len,
                });
            }
        }
        self.read_bytes(len)
    }

    /// Read the body of a leaf record after its key.
    pub fn read_leaf_value(&mut self) -> Result<LeafRecord, SerialError> {
        let code = self.read_i32()?;
        let seed = SeedType::from_code(code).ok_or(SerialError::BadSeedType(code))?;
        let count = self.read_len()?;
        if count > MAX_ELEMENTS {
            return Err(SerialError::TooManyElements(count));
        }

        if seed == SeedType::VoidPtr && count > 0 && self.peek_u32() == Some(0) {
            self.read_u32()?;
            return self.read_frame().map(LeafRecord::Frame);
        }

        macro_rules! collect {
            ($variant:ident, $conv:expr) => {{
                let mut values = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let bytes = self.read_element(seed)?;
                    values.push($conv(bytes)?);
                }
                LeafValue::$variant(values)
            }};
        }

        let value = match seed {
            SeedType::Int => collect!(Int, |b: &[u8]| -> Result<i32, SerialError> {
                Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            }),
            SeedType::Boolean => collect!(Boolean, |b: &[u8]| -> Result<bool, SerialError> {
                Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]) != 0)
            }),
            SeedType::Double => collect!(Double, |b: &[u8]| -> Result<f64, SerialError> {
                let mut word = [0u8; 8];
                word.copy_from_slice(b);
                Ok(f64::from_le_bytes(word))
            }),
            SeedType::Int64 => collect!(Int64, |b: &[u8]| -> Result<i64, SerialError> {
                let mut word = [0u8; 8];
                word.copy_from_slice(b);
                Ok(i64::from_le_bytes(word))
            }),
            SeedType::String => collect!(String, |b: &[u8]| -> Result<String, SerialError> {
                String::from_utf8(b.to_vec()).map_err(|_| SerialError::BadUtf8)
            }),
            SeedType::VoidPtr | SeedType::FuncPtr => {
                let mut values = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let bytes = self.read_element(seed)?;
                    let mut word = [0u8; 8];
                    word.copy_from_slice(bytes);
                    values.push(VoidPtr::from_addr(u64::from_le_bytes(word) as usize));
                }
                if seed == SeedType::VoidPtr {
                    LeafValue::VoidPtr(values)
                } else {
                    LeafValue::FuncPtr(values)
                }
            }
            SeedType::PlantPtr => {
                for _ in 0..count {
                    self.read_element(seed)?;
                }
                return Ok(LeafRecord::Skipped);
            }
        };
        Ok(LeafRecord::Value(value))
    }

    fn peek_u32(&self) -> Option<u32> {
        let bytes = self.buf.get(self.pos..self.pos + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_frame(&mut self) -> Result<FrameBuffer, SerialError> {
        if self.read_u32()? != FRAME_MAGIC {
            return Err(SerialError::BadPixelHeader("magic"));
        }
        if self.read_u32()? != FRAME_VERSION {
            return Err(SerialError::BadPixelHeader("version"));
        }
        let nplanes = self.read_len()?;
        let palette = Palette::from_code(self.read_i32()?)
            .ok_or(SerialError::BadPixelHeader("palette"))?;
        if nplanes != palette.num_planes() {
            return Err(SerialError::BadPixelHeader("plane count"));
        }
        let width = self.read_len()?;
        let height = self.read_len()?;
        if width > MAX_FRAME_DIMENSION || height > MAX_FRAME_DIMENSION {
            return Err(SerialError::BadPixelHeader("dimensions"));
        }

        let mut rowstrides = Vec::with_capacity(nplanes);
        let mut total = 0usize;
        for plane in 0..nplanes {
            let rowstride = self.read_len()?;
            let bytes = self.read_len()?;
            if rowstride < palette.plane_row_bytes(width, plane)
                || rowstride.checked_mul(palette.plane_rows(height, plane)) != Some(bytes)
            {
                return Err(SerialError::BadPixelHeader("plane size"));
            }
            total = total
                .checked_add(bytes)
                .filter(|&total| total <= MAX_FRAME_BYTES)
                .ok_or(SerialError::FrameTooLarge(bytes))?;
            rowstrides.push(rowstride);
        }

        let contiguous = self.read_u32()? != 0;
        let data = if contiguous {
            self.read_bytes(total)?.to_vec()
        } else {
            let mut data = Vec::with_capacity(total);
            for plane in 0..nplanes {
                let bytes = rowstrides[plane] * palette.plane_rows(height, plane);
                data.extend_from_slice(self.read_bytes(bytes)?);
            }
            data
        };
        FrameBuffer::from_bytes(palette, width, height, rowstrides, data)
            .ok_or(SerialError::BadPixelHeader("layout"))
    }

    fn read_key(&mut self) -> Result<String, SerialError> {
        self.read_string(MAX_KEY_LEN)
    }

    fn read_type_leaf(&mut self) -> Result<i32, SerialError> {
        if self.read_key()? != keys::TYPE {
            return Err(SerialError::NotTypeLeaf);
        }
        match self.read_leaf_value()? {
            LeafRecord::Value(LeafValue::Int(values)) if values.len() == 1 => Ok(values[0]),
            _ => Err(SerialError::NotTypeLeaf),
        }
    }

    fn read_plant_header(&mut self) -> Result<(usize, i32), SerialError> {
        let count = self.read_len()?;
        if count == 0 || count > MAX_LEAVES {
            return Err(SerialError::TooManyLeaves(count));
        }
        let type_code = self.read_type_leaf()?;
        Ok((count, type_code))
    }

    /// Move to the next position at which a `type` leaf record starts,
    /// leaving the cursor on the leaf count in front of it.
    fn realign(&mut self, from: usize) -> Result<(), SerialError> {
        let start = from.max(4);
        let found = self
            .buf
            .get(start..)
            .and_then(|rest| {
                rest.windows(TYPE_LEAF_PATTERN.len())
                    .position(|window| window == TYPE_LEAF_PATTERN)
            })
            .ok_or(SerialError::NoRealignment)?;
        self.pos = start + found - 4;
        Ok(())
    }

    /// Decode the next plant. If the leading `type` leaf is damaged the
    /// stream is scanned byte by byte for the next one.
    pub fn decode_plant(&mut self) -> Result<Decoded, SerialError> {
        let start = self.pos;
        let (count, type_code) = match self.read_plant_header() {
            Ok(header) => header,
            Err(err) => {
                log::warn!("plant header damaged at byte {start} ({err}), realigning");
                self.realign(start + 1)?;
                let at = self.pos;
                let header = self.read_plant_header()?;
                log::debug!("realigned to byte {at}");
                header
            }
        };

        let mut plant = Plant::bare();
        plant.push_leaf_unchecked(keys::TYPE.to_string(), LeafValue::Int(vec![type_code]));
        let mut frame = None;
        for _ in 1..count {
            let key = self.read_key()?;
            match self.read_leaf_value()? {
                LeafRecord::Value(value) => plant.push_leaf_unchecked(key, value),
                LeafRecord::Frame(buffer) => {
                    plant.push_leaf_unchecked(key, LeafValue::VoidPtr(Vec::new()));
                    frame = Some(buffer);
                }
                LeafRecord::Skipped => {}
            }
        }

        if PlantType::from_code(type_code) == PlantType::Unknown {
            return Err(SerialError::UnknownPlantType);
        }
        let _ = plant.set_leaf_flags(keys::TYPE, LeafFlags::IMMUTABLE | LeafFlags::UNDELETABLE);
        Ok(Decoded { plant, frame })
    }
}

pub fn plant_from_bytes(bytes: &[u8]) -> Result<Decoded, SerialError> {
    Decoder::new(bytes).decode_plant()
}

/// Entry point for the fuzz target: decode plants until the input runs out
/// or an error stops the stream.
#[cfg(feature = "fuzzing")]
pub fn fuzz_deserialize(data: &[u8]) {
    let mut decoder = Decoder::new(data);
    while !decoder.is_empty() {
        let before = decoder.position();
        match decoder.decode_plant() {
            Ok(decoded) => {
                let mut out = Vec::new();
                encode_plant(&mut out, &decoded.plant, decoded.frame.as_ref());
            }
            Err(_) => break,
        }
        if decoder.position() == before {
            break;
        }
    }
}
