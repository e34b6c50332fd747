//! The Weed property-bag model.
//!
//! Every entity exchanged with an effect plugin (filter classes, instances,
//! channels, parameters, plugin and host info) is a [`Plant`]: an ordered set
//! of typed [`Leaf`] entries. This crate holds the plant store, the palette
//! tables, frame buffers and the binary encoding used for persistence and
//! for moving layers between processes.

pub mod keys;
pub mod palette;
pub mod pixel;
pub mod plant;
pub mod seed;
pub mod serialize;
pub mod value;

pub use palette::{best_palette_match, Palette};
pub use pixel::FrameBuffer;
pub use plant::{Leaf, Plant, PlantHandle, PlantType, WeakPlant};
pub use seed::{result_code, LeafFlags, Origin, PlantError, SeedType};
pub use serialize::{Decoded, Decoder, SerialError};
pub use value::{LeafValue, VoidPtr};
