//! Pixel and audio buffers exchanged with the player.
//!
//! A [`Layer`] owns its frame memory and mirrors the frame geometry into a
//! `Layer` plant so channels can copy leaves from it. The plant is rebuilt
//! whenever the buffer changes; plane addresses stay valid until the next
//! change because frame memory is never reallocated in place.

use std::fmt;

use parking_lot::Mutex;
use weed_plant::serialize::encode_plant;
use weed_plant::{
    keys, Decoder, FrameBuffer, LeafValue, Palette, PlantHandle, PlantType, SerialError, VoidPtr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LayerStatus {
    #[default]
    Invalid,
    Ready,
    Loaded,
    Busy,
}

/// Non-interleaved float samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    rate: i32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn new(rate: i32, channels: usize, samples: usize) -> Self {
        Self {
            rate,
            channels: vec![vec![0.0; samples]; channels],
        }
    }

    pub fn from_channels(rate: i32, channels: Vec<Vec<f32>>) -> Self {
        Self { rate, channels }
    }

    pub fn rate(&self) -> i32 {
        self.rate
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn samples(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel(&self, idx: usize) -> &[f32] {
        &self.channels[idx]
    }

    pub fn channel_mut(&mut self, idx: usize) -> &mut [f32] {
        &mut self.channels[idx]
    }

    pub fn channel_ptrs(&mut self) -> Vec<VoidPtr> {
        self.channels
            .iter_mut()
            .map(|channel| VoidPtr::from(channel.as_mut_ptr()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum LayerData {
    #[default]
    Empty,
    Video(FrameBuffer),
    Audio(AudioBuffer),
}

pub struct Layer {
    plant: PlantHandle,
    data: LayerData,
    status: Mutex<LayerStatus>,
}

impl Layer {
    /// A layer with no frame, standing for "nothing on this track".
    pub fn blank(clip: i32) -> Self {
        let layer = Self {
            plant: PlantHandle::new(PlantType::Layer),
            data: LayerData::Empty,
            status: Mutex::new(LayerStatus::Invalid),
        };
        layer.set_leaf(keys::CLIP, clip);
        layer.set_leaf(keys::FRAME, 0);
        layer
    }

    pub fn from_frame(frame: FrameBuffer) -> Self {
        let mut layer = Self::blank(0);
        layer.set_leaf(keys::FRAME, 1);
        layer.set_frame(frame);
        layer
    }

    pub fn from_audio(audio: AudioBuffer) -> Self {
        let mut layer = Self::blank(0);
        layer.set_leaf(keys::FRAME, 1);
        layer.set_audio(audio);
        layer
    }

    fn set_leaf(&self, key: &str, value: impl Into<LeafValue>) {
        let _ = self.plant.write().force_set(key, value);
    }

    pub fn plant(&self) -> &PlantHandle {
        &self.plant
    }

    pub fn status(&self) -> LayerStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: LayerStatus) {
        *self.status.lock() = status;
    }

    /// Mark the layer busy for the duration of a filter call and return
    /// its previous status.
    pub fn begin_use(&self) -> LayerStatus {
        std::mem::replace(&mut *self.status.lock(), LayerStatus::Busy)
    }

    pub fn end_use(&self, ok: bool) {
        self.set_status(if ok {
            LayerStatus::Ready
        } else {
            LayerStatus::Invalid
        });
    }

    pub fn clip(&self) -> i32 {
        self.plant.int_or(keys::CLIP, 0)
    }

    pub fn frame_number(&self) -> i32 {
        self.plant.int_or(keys::FRAME, 0)
    }

    pub fn set_frame_number(&self, frame: i32) {
        self.set_leaf(keys::FRAME, frame);
    }

    pub fn data(&self) -> &LayerData {
        &self.data
    }

    /// No pixel data and frame number 0.
    pub fn is_blank(&self) -> bool {
        matches!(self.data, LayerData::Empty) && self.frame_number() == 0
    }

    pub fn has_pixels(&self) -> bool {
        matches!(self.data, LayerData::Video(_))
    }

    pub fn frame(&self) -> Option<&FrameBuffer> {
        match &self.data {
            LayerData::Video(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn frame_mut(&mut self) -> Option<&mut FrameBuffer> {
        match &mut self.data {
            LayerData::Video(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn audio(&self) -> Option<&AudioBuffer> {
        match &self.data {
            LayerData::Audio(audio) => Some(audio),
            _ => None,
        }
    }

    pub fn audio_mut(&mut self) -> Option<&mut AudioBuffer> {
        match &mut self.data {
            LayerData::Audio(audio) => Some(audio),
            _ => None,
        }
    }

    pub fn palette(&self) -> Option<Palette> {
        self.frame().map(FrameBuffer::palette)
    }

    /// Width in macropixels.
    pub fn width(&self) -> usize {
        self.frame().map_or(0, FrameBuffer::width)
    }

    pub fn height(&self) -> usize {
        self.frame().map_or(0, FrameBuffer::height)
    }

    /// Replace the pixel data. Plane addresses handed out earlier become
    /// invalid.
    pub fn set_frame(&mut self, frame: FrameBuffer) {
        self.data = LayerData::Video(frame);
        self.sync_leaves();
    }

    pub fn take_frame(&mut self) -> Option<FrameBuffer> {
        match std::mem::take(&mut self.data) {
            LayerData::Video(frame) => {
                self.sync_leaves();
                Some(frame)
            }
            other => {
                self.data = other;
                None
            }
        }
    }

    pub fn set_audio(&mut self, audio: AudioBuffer) {
        self.data = LayerData::Audio(audio);
        self.sync_leaves();
    }

    /// Drop the buffer, keeping clip and frame bookkeeping.
    pub fn clear(&mut self) {
        self.data = LayerData::Empty;
        self.sync_leaves();
    }

    fn sync_leaves(&mut self) {
        let mut plant = self.plant.write();
        for key in [
            keys::CURRENT_PALETTE,
            keys::WIDTH,
            keys::HEIGHT,
            keys::ROWSTRIDES,
            keys::PIXEL_DATA,
            keys::AUDIO_RATE,
            keys::AUDIO_CHANNELS,
            keys::AUDIO_DATA_LENGTH,
            keys::AUDIO_DATA,
        ] {
            plant.remove(key);
        }
        match &mut self.data {
            LayerData::Empty => {}
            LayerData::Video(frame) => {
                let _ = plant.set(keys::CURRENT_PALETTE, frame.palette().code());
                let _ = plant.set(keys::WIDTH, frame.width() as i32);
                let _ = plant.set(keys::HEIGHT, frame.height() as i32);
                let strides: Vec<i32> = frame.rowstrides().iter().map(|&s| s as i32).collect();
                let _ = plant.set(keys::ROWSTRIDES, strides);
                let _ = plant.set(keys::PIXEL_DATA, frame.plane_ptrs());
            }
            LayerData::Audio(audio) => {
                let _ = plant.set(keys::AUDIO_RATE, audio.rate());
                let _ = plant.set(keys::AUDIO_CHANNELS, audio.num_channels() as i32);
                let _ = plant.set(keys::AUDIO_DATA_LENGTH, audio.samples() as i32);
                let _ = plant.set(keys::AUDIO_DATA, audio.channel_ptrs());
            }
        }
    }

    /// Encode the layer plant and its pixels for another process or a
    /// later session.
    pub fn to_bytes(&self) -> Vec<u8> {
        let plant = self.plant.read().detached();
        let mut out = Vec::new();
        encode_plant(&mut out, &plant, self.frame());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerialError> {
        let decoded = Decoder::new(bytes).decode_plant()?;
        if decoded.plant.plant_type() != PlantType::Layer {
            return Err(SerialError::UnknownPlantType);
        }
        let mut layer = Self {
            plant: PlantHandle::from_plant(decoded.plant),
            data: LayerData::Empty,
            status: Mutex::new(LayerStatus::Ready),
        };
        match decoded.frame {
            Some(frame) => layer.set_frame(frame),
            None => layer.sync_leaves(),
        }
        Ok(layer)
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("clip", &self.clip())
            .field("frame", &self.frame_number())
            .field("status", &self.status())
            .field("data", &self.data)
            .finish()
    }
}
