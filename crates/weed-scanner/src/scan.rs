use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use weed_host::{HostConfig, LoadSummary, WeedHost};

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Host settings file; the user's settings (or defaults) when unset.
    pub config: Option<PathBuf>,
    pub extra_paths: Vec<PathBuf>,
    /// Only scan `extra_paths`.
    pub skip_default_paths: bool,
    /// List filters hidden behind a newer version too.
    pub include_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginEntry {
    pub file: String,
    pub path: PathBuf,
    pub weed_api: i32,
    pub filter_api: i32,
    pub suspicious: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterEntry {
    pub hashname: String,
    pub name: String,
    pub author: String,
    pub version: i32,
    pub plugin: String,
    pub category: String,
    pub category_code: i32,
    pub inputs: usize,
    pub outputs: usize,
    pub params: usize,
    pub may_thread: bool,
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Problem {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub plugins: Vec<PluginEntry>,
    pub filters: Vec<FilterEntry>,
    pub failed: Vec<Problem>,
    pub rejected: Vec<Problem>,
}

fn host_config(options: &ScanOptions) -> Result<HostConfig> {
    let mut config = match &options.config {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?,
        None => HostConfig::load_or_default(),
    };
    if options.skip_default_paths {
        config.plugin_paths.clear();
    }
    config.plugin_paths.extend(options.extra_paths.iter().cloned());
    Ok(config)
}

/// Load every plugin the options point at and describe what was found.
pub fn scan(options: &ScanOptions) -> Result<ScanReport> {
    let config = host_config(options)?;
    tracing::debug!(paths = ?config.plugin_paths, "scanning for plugins");
    let mut host = WeedHost::new(config);
    let summary = host.load_plugins();
    let report = collect(&host, summary, options.include_hidden);
    host.shutdown().context("failed to unload plugins")?;
    Ok(report)
}

/// Describe the plugins and filters `host` holds.
pub fn collect(host: &WeedHost, summary: LoadSummary, include_hidden: bool) -> ScanReport {
    let plugins = host
        .loader()
        .plugins()
        .iter()
        .map(|plugin| {
            let (weed_api, filter_api) = plugin.api_versions();
            PluginEntry {
                file: plugin.name().to_string(),
                path: plugin.library().path().to_path_buf(),
                weed_api,
                filter_api,
                suspicious: plugin.is_suspicious(),
            }
        })
        .collect();

    let mut filters: Vec<FilterEntry> = host
        .registry()
        .iter()
        .filter(|filter| include_hidden || !filter.is_hidden())
        .map(|filter| {
            let class = filter.class();
            let category = filter.category();
            FilterEntry {
                hashname: filter.hashname().to_string(),
                name: filter.name(),
                author: class.author(),
                version: class.version(),
                plugin: filter.plugin_name().to_string(),
                category: category.label().to_string(),
                category_code: category.code(),
                inputs: class.in_channel_templates().len(),
                outputs: class.out_channel_templates().len(),
                params: class.in_param_templates().len(),
                may_thread: class.may_thread(),
                hidden: filter.is_hidden(),
            }
        })
        .collect();
    filters.sort_by(|a, b| a.hashname.cmp(&b.hashname));

    ScanReport {
        plugins,
        filters,
        failed: summary
            .failed
            .into_iter()
            .map(|(path, err)| Problem {
                source: path.display().to_string(),
                reason: err.to_string(),
            })
            .collect(),
        rejected: summary
            .rejected
            .into_iter()
            .map(|(plugin, err)| Problem {
                source: plugin,
                reason: err.to_string(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;
    use weed_host::{testing, LoaderOptions};

    use super::*;

    #[test]
    fn scan_of_a_directory_without_plugins() {
        let dir = tempdir().unwrap();
        let ext = LoaderOptions::default().extension;
        fs::write(dir.path().join("readme.txt"), b"hello").unwrap();
        fs::write(dir.path().join(format!("fake.{ext}")), b"not elf").unwrap();
        let settings = dir.path().join("settings.json");
        HostConfig::default().save(&settings).unwrap();

        let report = scan(&ScanOptions {
            config: Some(settings),
            extra_paths: vec![dir.path().to_path_buf()],
            skip_default_paths: true,
            include_hidden: false,
        })
        .unwrap();
        assert!(report.plugins.is_empty());
        assert!(report.filters.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].source.ends_with(&format!("fake.{ext}")));
    }

    #[test]
    fn unreadable_settings_are_an_error() {
        let dir = tempdir().unwrap();
        let settings = dir.path().join("settings.json");
        fs::write(&settings, b"{ not json").unwrap();
        let err = scan(&ScanOptions {
            config: Some(settings),
            ..ScanOptions::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("failed to read settings"));
    }

    #[test]
    fn builtin_plugin_is_described() {
        let config = HostConfig {
            plugin_paths: Vec::new(),
            ..HostConfig::default()
        };
        let mut host = WeedHost::new(config);
        host.load_builtin("builtin_fill.so", testing::builtin_setup, None)
            .unwrap();
        let report = collect(&host, LoadSummary::default(), false);
        assert_eq!(report.plugins.len(), 1);
        assert_eq!(report.plugins[0].weed_api, 200);
        assert!(!report.plugins[0].suspicious);
        assert_eq!(
            report.filters,
            vec![FilterEntry {
                hashname: "builtin_fillfillbuiltin1".into(),
                name: "fill".into(),
                author: "builtin".into(),
                version: 1,
                plugin: "builtin_fill.so".into(),
                category: "generator".into(),
                category_code: 1,
                inputs: 0,
                outputs: 1,
                params: 0,
                may_thread: true,
                hidden: false,
            }]
        );
        host.shutdown().unwrap();
    }
}
