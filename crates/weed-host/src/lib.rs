//! Host runtime for Weed effect plugins.
//!
//! Plugins are shared libraries exporting `weed_setup`. The [`loader`]
//! opens them and performs the version handshake, the [`registry`] keeps
//! the filter classes they describe, [`instance`] drives init and deinit,
//! and [`negotiate`] matches layers to channels before [`pipeline`] calls
//! the plugin, on several threads when the filter allows it. [`WeedHost`]
//! ties these together behind one configuration.

pub mod abi;
pub mod callbacks;
pub mod config;
pub mod connect;
pub mod convert;
mod error;
pub mod filter;
pub mod flags;
pub mod handles;
pub mod host;
pub mod instance;
pub mod interpolate;
pub mod keytable;
pub mod layer;
pub mod loader;
pub mod negotiate;
pub mod persist;
pub mod pipeline;
pub mod registry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use callbacks::{FilterCallbacks, NativeCallbacks};
pub use config::{HostConfig, LoaderOptions};
pub use connect::{AlphaConnections, AlphaRouter, ConnectError, ParamLink};
pub use convert::{BasicConverter, FrameConverter};
pub use error::{FilterError, FilterResult, FilterStatus, HostError, PluginCode};
pub use filter::{Category, ChannelTemplate, FilterClass, ParamTemplate};
pub use host::{LoadSummary, WeedHost};
pub use instance::{Instance, LiveCounter};
pub use interpolate::{interpolate, interpolate_params, ParamChange};
pub use keytable::{EffectKeyTable, GeneratorSlot, KeyError, Mode};
pub use layer::{AudioBuffer, Layer, LayerStatus};
pub use loader::{PluginLibrary, PluginLoader};
pub use negotiate::{FrameSource, Negotiator, SizeLimits, TrackMap};
pub use registry::{FilterRegistry, RegisterError, RegisteredFilter};
