//! Links between filters that do not go through layers.
//!
//! Alpha channels carry masks from one instance to another: whatever a
//! filter writes to an alpha output is kept until the connected input of
//! another instance asks for it. Parameter links copy the out parameters of
//! one part of a compound filter into the in parameters of a later part.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;
use weed_plant::{keys, FrameBuffer, PlantHandle};

use crate::filter::ChannelTemplate;
use crate::instance::Instance;

/// Source and sink of alpha frames for one apply.
///
/// Channel indices count every channel of the instance, audio included.
pub trait AlphaRouter: Send + Sync {
    /// Mask for alpha input `channel`, if something is connected to it.
    fn pull_alpha(&self, instance: &Instance, channel: usize) -> Option<FrameBuffer>;

    /// Mask the filter wrote to alpha output `channel`.
    fn push_alpha(&self, instance: &Instance, channel: usize, frame: FrameBuffer);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("instance has no channel {0}")]
    NoSuchChannel(usize),
    #[error("channel {0} does not carry alpha")]
    NotAlpha(usize),
    #[error("an instance cannot feed its own alpha")]
    SameInstance,
}

type Endpoint = (u64, usize);

#[derive(Default)]
struct Links {
    /// input endpoint -> output endpoint feeding it
    sources: HashMap<Endpoint, Endpoint>,
    frames: HashMap<Endpoint, FrameBuffer>,
}

/// Alpha routing between live instances, keyed by instance id.
#[derive(Default)]
pub struct AlphaConnections {
    inner: Mutex<Links>,
}

fn alpha_channel(instance: &Instance, channels: Vec<PlantHandle>, idx: usize) -> Result<(), ConnectError> {
    let channel = channels.get(idx).ok_or(ConnectError::NoSuchChannel(idx))?;
    let template = channel
        .plant(keys::TEMPLATE)
        .map(ChannelTemplate::new)
        .ok_or(ConnectError::NoSuchChannel(idx))?;
    if !instance.filter().class().is_alpha_template(&template) {
        return Err(ConnectError::NotAlpha(idx));
    }
    Ok(())
}

impl AlphaConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed alpha input `in_channel` of `to` from alpha output
    /// `out_channel` of `from`, replacing any earlier source.
    pub fn connect(
        &self,
        from: &Instance,
        out_channel: usize,
        to: &Instance,
        in_channel: usize,
    ) -> Result<(), ConnectError> {
        if from.id() == to.id() {
            return Err(ConnectError::SameInstance);
        }
        alpha_channel(from, from.out_channels(), out_channel)?;
        alpha_channel(to, to.in_channels(), in_channel)?;
        self.inner
            .lock()
            .sources
            .insert((to.id(), in_channel), (from.id(), out_channel));
        tracing::debug!(
            from = from.id(),
            out_channel,
            to = to.id(),
            in_channel,
            "alpha channels connected"
        );
        Ok(())
    }

    pub fn disconnect(&self, to: &Instance, in_channel: usize) -> bool {
        self.inner.lock().sources.remove(&(to.id(), in_channel)).is_some()
    }

    /// Drop every link and stored mask touching `instance`.
    pub fn disconnect_instance(&self, instance: &Instance) {
        let id = instance.id();
        let mut inner = self.inner.lock();
        inner
            .sources
            .retain(|&(to, _), &mut (from, _)| to != id && from != id);
        inner.frames.retain(|&(from, _), _| from != id);
    }

    pub fn is_connected(&self, to: &Instance, in_channel: usize) -> bool {
        self.inner.lock().sources.contains_key(&(to.id(), in_channel))
    }
}

impl AlphaRouter for AlphaConnections {
    fn pull_alpha(&self, instance: &Instance, channel: usize) -> Option<FrameBuffer> {
        let inner = self.inner.lock();
        let source = inner.sources.get(&(instance.id(), channel))?;
        inner.frames.get(source).cloned()
    }

    fn push_alpha(&self, instance: &Instance, channel: usize, frame: FrameBuffer) {
        let endpoint = (instance.id(), channel);
        let mut inner = self.inner.lock();
        if inner.sources.values().any(|&source| source == endpoint) {
            inner.frames.insert(endpoint, frame);
        }
    }
}

/// Copies out parameter `out_param` of part `from_part` into in parameter
/// `in_param` of part `to_part` after `from_part` has processed.
///
/// `in_param` counts the target part's own parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamLink {
    pub from_part: usize,
    pub out_param: usize,
    pub to_part: usize,
    pub in_param: usize,
}

impl ParamLink {
    pub fn new(from_part: usize, out_param: usize, to_part: usize, in_param: usize) -> Self {
        Self {
            from_part,
            out_param,
            to_part,
            in_param,
        }
    }
}
