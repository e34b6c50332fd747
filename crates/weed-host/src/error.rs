use std::path::PathBuf;

use thiserror::Error;
use weed_plant::{PlantError, SerialError};

/// Errors that can occur while loading plugins or persisting host state.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("plugin binary not found at {0}")]
    MissingBinary(PathBuf),
    #[error("failed to load plugin library: {0}")]
    LibraryLoad(#[from] libloading::Error),
    #[error("{path} does not export `{symbol}`")]
    MissingEntry { path: PathBuf, symbol: &'static str },
    #[error("invalid plugin {path}: {reason}")]
    InvalidPlugin { path: PathBuf, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed record: {0}")]
    Serial(#[from] SerialError),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("leaf error: {0}")]
    Plant(#[from] PlantError),
    #[error("invalid host state: {0}")]
    InvalidState(String),
}

impl HostError {
    pub fn missing_entry(path: PathBuf, symbol: &'static str) -> Self {
        HostError::MissingEntry { path, symbol }
    }

    pub fn invalid_plugin(path: PathBuf, reason: impl Into<String>) -> Self {
        HostError::InvalidPlugin {
            path,
            reason: reason.into(),
        }
    }
}

/// Per-call failures of the effect host.
///
/// None of these are fatal: the caller skips the effect for the current
/// frame and passes its input through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum FilterError {
    #[error("plugin must be reloaded")]
    InvalidPlugin,
    #[error("filter is invalid")]
    InvalidFilter,
    #[error("instance is invalid")]
    InvalidInstance,
    #[error("layer is invalid")]
    InvalidLayer,
    #[error("no usable channel")]
    MissingChannel,
    #[error("a mandatory channel has no layer")]
    MissingLayer,
    #[error("blank frame on a mandatory channel")]
    BlankFrame,
    #[error("layer does not fit the channel template")]
    TemplateMismatch,
    #[error("invalid track mapping")]
    InvalidTrack,
    #[error("could not share buffer with layer")]
    CopyingFailed,
    #[error("out of memory")]
    MemoryError,
    #[error("instance is busy")]
    Busy,
    #[error("instance needs reinit")]
    NeedsReinit,
    #[error("reinit failed")]
    CouldNotReinit,
    #[error("parameter interpolation failed")]
    InterpolationFailed,
    #[error("filter only processes audio")]
    IsAudio,
    #[error("filter cannot be applied to the scrap clip")]
    IsScrapFile,
    #[error("slicing not possible")]
    DontThread,
}

/// Success and informational outcomes of an apply or reinit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterStatus {
    #[default]
    Success,
    InfoReinited,
    InfoRedrawn,
}

pub type FilterResult = Result<FilterStatus, FilterError>;

/// Error codes returned by plugin callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginCode {
    Success,
    MemoryAllocation,
    PluginInvalid,
    FilterInvalid,
    TooManyInstances,
    ReinitNeeded,
    NotReady,
    Other(i32),
}

impl PluginCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => PluginCode::Success,
            1 => PluginCode::MemoryAllocation,
            64 => PluginCode::PluginInvalid,
            65 => PluginCode::FilterInvalid,
            66 => PluginCode::TooManyInstances,
            67 => PluginCode::ReinitNeeded,
            68 => PluginCode::NotReady,
            other => PluginCode::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            PluginCode::Success => 0,
            PluginCode::MemoryAllocation => 1,
            PluginCode::PluginInvalid => 64,
            PluginCode::FilterInvalid => 65,
            PluginCode::TooManyInstances => 66,
            PluginCode::ReinitNeeded => 67,
            PluginCode::NotReady => 68,
            PluginCode::Other(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == PluginCode::Success
    }

    /// Combine results from several slices of one frame. The more severe
    /// code wins.
    pub fn merge(self, other: PluginCode) -> PluginCode {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    fn severity(self) -> u8 {
        match self {
            PluginCode::Success => 0,
            PluginCode::Other(_) => 1,
            PluginCode::TooManyInstances => 2,
            PluginCode::MemoryAllocation => 3,
            PluginCode::NotReady => 4,
            PluginCode::ReinitNeeded => 5,
            PluginCode::FilterInvalid => 6,
            PluginCode::PluginInvalid => 7,
        }
    }

    pub fn into_result(self) -> Result<(), FilterError> {
        match self {
            PluginCode::Success => Ok(()),
            PluginCode::MemoryAllocation => Err(FilterError::MemoryError),
            PluginCode::PluginInvalid => Err(FilterError::InvalidPlugin),
            PluginCode::FilterInvalid | PluginCode::Other(_) => Err(FilterError::InvalidFilter),
            PluginCode::TooManyInstances | PluginCode::NotReady => Err(FilterError::Busy),
            PluginCode::ReinitNeeded => Err(FilterError::NeedsReinit),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn codes_survive_the_abi() {
        for code in [0, 1, 64, 65, 66, 67, 68, 99] {
            assert_eq!(PluginCode::from_code(code).code(), code);
        }
    }

    #[test]
    fn merge_prefers_severe_codes() {
        let merged = [
            PluginCode::Success,
            PluginCode::ReinitNeeded,
            PluginCode::NotReady,
            PluginCode::Success,
        ]
        .into_iter()
        .fold(PluginCode::Success, PluginCode::merge);
        assert_eq!(merged, PluginCode::ReinitNeeded);
        assert_eq!(
            PluginCode::FilterInvalid.merge(PluginCode::PluginInvalid),
            PluginCode::PluginInvalid
        );
        assert_eq!(
            PluginCode::ReinitNeeded.into_result(),
            Err(FilterError::NeedsReinit)
        );
    }
}
