use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::HostError;

/// Environment variable holding extra plugin directories.
pub const PLUGIN_PATH_ENV: &str = "WEED_PLUGIN_PATH";

/// Host-wide settings, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directories searched for plugin binaries.
    pub plugin_paths: Vec<PathBuf>,
    /// Worker threads used to slice frames.
    pub threads: usize,
    pub min_width: usize,
    pub min_height: usize,
    pub max_width: usize,
    pub max_height: usize,
    pub default_generator_width: usize,
    pub default_generator_height: usize,
    pub default_generator_fps: f64,
    /// Keys a user can bind directly.
    pub keys: usize,
    /// Extra keys reserved for timeline playback.
    pub virtual_keys: usize,
    pub modes_per_key: usize,
    pub max_instances: usize,
    /// Hashname prefixes that are never registered.
    pub blacklist: Vec<String>,
    /// Let outputs alias their input even when slices run in parallel.
    pub inplace_when_threaded: bool,
    pub defaults_file: Option<PathBuf>,
    pub generator_sizes_file: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        let config_dir = config_dir();
        Self {
            plugin_paths: default_plugin_paths(),
            threads: num_cpus::get().max(1),
            min_width: 4,
            min_height: 4,
            max_width: 8192,
            max_height: 8192,
            default_generator_width: 640,
            default_generator_height: 480,
            default_generator_fps: 25.0,
            keys: 9,
            virtual_keys: 256,
            modes_per_key: 8,
            max_instances: 65536,
            blacklist: Vec::new(),
            inplace_when_threaded: false,
            defaults_file: config_dir.as_ref().map(|dir| dir.join("filter_defaults")),
            generator_sizes_file: config_dir.map(|dir| dir.join("generator_sizes")),
        }
    }
}

fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("weed"))
}

/// `$WEED_PLUGIN_PATH` entries followed by the usual install locations.
pub fn default_plugin_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = env::var_os(PLUGIN_PATH_ENV)
        .map(|value| env::split_paths(&value).collect())
        .unwrap_or_default();
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".local/lib/weed"));
    }
    paths.push(PathBuf::from("/usr/lib/weed"));
    paths.push(PathBuf::from("/usr/local/lib/weed"));
    paths
}

impl HostConfig {
    /// Default location of the settings file.
    pub fn settings_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("host.json"))
    }

    pub fn load(path: &Path) -> Result<Self, HostError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), HostError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Settings from the default location, or defaults when the file is
    /// missing or unreadable.
    pub fn load_or_default() -> Self {
        let Some(path) = Self::settings_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(?err, path = %path.display(), "failed to read host settings");
                Self::default()
            }
        }
    }

    pub fn total_keys(&self) -> usize {
        self.keys + self.virtual_keys
    }
}

/// How plugin directories are walked.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Subdirectory levels below each search path.
    pub max_depth: usize,
    /// Subdirectory names holding plugin resources rather than binaries.
    pub skip_dirs: Vec<String>,
    pub extension: String,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_depth: 1,
            skip_dirs: vec!["icons".to_string(), "data".to_string()],
            extension: env::consts::DLL_EXTENSION.to_string(),
        }
    }
}
