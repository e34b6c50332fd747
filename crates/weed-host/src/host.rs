//! The host runtime as one value: configuration, loaded plugins, the
//! filter registry, key bindings and the pieces needed to run a frame.

use std::path::PathBuf;
use std::sync::Arc;

use weed_plant::keys;

use crate::abi::{DesetupFn, SetupFn};
use crate::callbacks::NativeCallbacks;
use crate::config::{HostConfig, LoaderOptions};
use crate::connect::AlphaConnections;
use crate::convert::{BasicConverter, FrameConverter};
use crate::instance::{Instance, LiveCounter};
use crate::keytable::{EffectKeyTable, GeneratorSlot};
use crate::layer::Layer;
use crate::loader::PluginLoader;
use crate::negotiate::{FrameSource, Negotiator};
use crate::persist::{self, GeneratorSize};
use crate::registry::{FilterRegistry, RegisterError};
use crate::{FilterError, HostError};

/// Outcome of a plugin directory scan.
#[derive(Debug, Default)]
pub struct LoadSummary {
    pub plugins: usize,
    pub filters: usize,
    /// Filters a plugin exported that the registry refused, by plugin file.
    pub rejected: Vec<(String, RegisterError)>,
    /// Binaries that could not be loaded at all.
    pub failed: Vec<(PathBuf, HostError)>,
}

pub struct WeedHost {
    config: HostConfig,
    loader: PluginLoader,
    registry: FilterRegistry,
    keys: EffectKeyTable,
    converter: Box<dyn FrameConverter>,
    source: Option<Box<dyn FrameSource>>,
    alpha: AlphaConnections,
}

impl WeedHost {
    pub fn new(config: HostConfig) -> Self {
        Self::with_loader_options(config, LoaderOptions::default())
    }

    pub fn with_loader_options(config: HostConfig, options: LoaderOptions) -> Self {
        let counter = LiveCounter::new(config.max_instances);
        Self {
            loader: PluginLoader::new(options),
            registry: FilterRegistry::new(config.blacklist.clone()),
            keys: EffectKeyTable::new(config.total_keys(), config.modes_per_key, counter),
            converter: Box::new(BasicConverter),
            source: None,
            alpha: AlphaConnections::new(),
            config,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut FilterRegistry {
        &mut self.registry
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    pub fn keys(&self) -> &EffectKeyTable {
        &self.keys
    }

    /// Alpha links between live instances, used by every negotiator.
    pub fn alpha_connections(&self) -> &AlphaConnections {
        &self.alpha
    }

    pub fn counter(&self) -> &LiveCounter {
        self.keys.counter()
    }

    pub fn set_converter(&mut self, converter: Box<dyn FrameConverter>) {
        self.converter = converter;
    }

    /// Where optional channels without a layer fetch a frame from.
    pub fn set_frame_source(&mut self, source: Option<Box<dyn FrameSource>>) {
        self.source = source;
    }

    /// A negotiator set up from the host configuration.
    pub fn negotiator(&self) -> Negotiator<'_> {
        Negotiator {
            source: self.source.as_deref(),
            fps: self.config.default_generator_fps,
            alpha: Some(&self.alpha),
            ..Negotiator::from_config(&self.config, self.converter.as_ref())
        }
    }

    /// Load every plugin binary under the configured search paths and
    /// register the filters they export.
    pub fn load_plugins(&mut self) -> LoadSummary {
        let roots = self.config.plugin_paths.clone();
        let mut summary = LoadSummary::default();
        for path in self.loader.discover(&roots) {
            match self.loader.load_plugin(&path) {
                Ok(idx) => {
                    summary.plugins += 1;
                    self.register_plugin(idx, &mut summary);
                }
                Err(err) => {
                    tracing::warn!(plugin = %path.display(), %err, "plugin failed to load");
                    summary.failed.push((path, err));
                }
            }
        }
        tracing::info!(
            plugins = summary.plugins,
            filters = summary.filters,
            failed = summary.failed.len(),
            "plugin scan finished"
        );
        summary
    }

    /// Install a plugin linked into the host binary. Returns the number of
    /// filters it registered.
    pub fn load_builtin(
        &mut self,
        name: &str,
        setup: SetupFn,
        desetup: Option<DesetupFn>,
    ) -> Result<usize, HostError> {
        let idx = self.loader.load_builtin(name, setup, desetup)?;
        let mut summary = LoadSummary::default();
        self.register_plugin(idx, &mut summary);
        Ok(summary.filters)
    }

    fn register_plugin(&mut self, idx: usize, summary: &mut LoadSummary) {
        let Some(plugin) = self.loader.get(idx) else {
            return;
        };
        for class in plugin.filters() {
            // SAFETY: the function leaves were written by this plugin and the
            // callbacks keep its library loaded.
            let callbacks =
                unsafe { NativeCallbacks::from_filter(class.handle(), Some(plugin.library().clone())) };
            let Some(callbacks) = callbacks else {
                tracing::info!(
                    plugin = plugin.name(),
                    filter = %class.name(),
                    "filter has no process function"
                );
                continue;
            };
            match self.registry.register(plugin.name(), class, Arc::new(callbacks)) {
                Ok(_) => summary.filters += 1,
                Err(err) => {
                    if let RegisterError::Rejected(reason) = &err {
                        tracing::info!(plugin = plugin.name(), code = reason.code(), %err, "filter rejected");
                    } else {
                        tracing::info!(plugin = plugin.name(), %err, "filter not registered");
                    }
                    summary.rejected.push((plugin.name().to_string(), err));
                }
            }
        }
    }

    fn fallback_size(&self) -> GeneratorSize {
        GeneratorSize {
            width: i32::try_from(self.config.default_generator_width).unwrap_or(i32::MAX),
            height: i32::try_from(self.config.default_generator_height).unwrap_or(i32::MAX),
        }
    }

    /// Restore saved parameter defaults and generator sizes. Missing files
    /// are not an error.
    pub fn load_persisted(&self) -> Result<(), HostError> {
        if let Some(path) = &self.config.defaults_file {
            let applied = persist::load_defaults(&self.registry, path)?;
            tracing::debug!(applied, path = %path.display(), "parameter defaults restored");
        }
        if let Some(path) = &self.config.generator_sizes_file {
            let applied = persist::load_generator_sizes(&self.registry, path, self.fallback_size())?;
            tracing::debug!(applied, path = %path.display(), "generator sizes restored");
        }
        Ok(())
    }

    pub fn save_persisted(&self) -> Result<(), HostError> {
        if let Some(path) = &self.config.defaults_file {
            persist::save_defaults(&self.registry, path)?;
        }
        if let Some(path) = &self.config.generator_sizes_file {
            persist::save_generator_sizes(&self.registry, path)?;
        }
        Ok(())
    }

    /// Size `instance`'s outputs, set its frame rate, init it and put it in
    /// a generator slot. The instance the slot held before is deinited.
    pub fn generator_start(&self, instance: &Instance, which: GeneratorSlot) -> Result<(), FilterError> {
        if !instance.filter().is_generator() {
            return Err(FilterError::InvalidFilter);
        }
        let fallback = self.fallback_size();
        for channel in instance.out_channels() {
            let template = channel.read().get_plant(keys::TEMPLATE).ok();
            let saved = |key: &str| {
                template
                    .as_ref()
                    .and_then(|template| template.read().get_int(key).ok())
                    .filter(|&n| n > 0)
            };
            let width = saved(keys::HOST_WIDTH).unwrap_or(fallback.width);
            let height = saved(keys::HOST_HEIGHT).unwrap_or(fallback.height);
            let mut plant = channel.write();
            plant
                .force_set(keys::WIDTH, width)
                .and_then(|_| plant.force_set(keys::HEIGHT, height))
                .map_err(|_| FilterError::InvalidInstance)?;
        }

        let fps = instance
            .filter()
            .class()
            .handle()
            .read()
            .get_double(keys::HOST_FPS)
            .ok()
            .filter(|&fps| fps > 0.0)
            .unwrap_or(self.config.default_generator_fps);
        {
            let mut plant = instance.plant().write();
            plant
                .force_set(keys::HOST_FPS, fps)
                .and_then(|_| plant.force_set(keys::TARGET_FPS, fps))
                .map_err(|_| FilterError::InvalidInstance)?;
        }

        if !instance.is_inited() {
            instance.init()?;
        }
        if let Some(old) = self.keys.set_generator(which, Some(instance.clone())) {
            if !old.ptr_eq(instance) {
                if let Err(err) = old.deinit() {
                    tracing::debug!(?err, ?which, "deinit of the previous generator failed");
                }
            }
        }
        tracing::debug!(filter = instance.filter().hashname(), ?which, fps, "generator started");
        Ok(())
    }

    /// Deinit the generator in `which` and empty the slot.
    pub fn generator_end(&self, which: GeneratorSlot) -> Result<(), FilterError> {
        match self.keys.set_generator(which, None) {
            Some(instance) => instance.deinit(),
            None => Ok(()),
        }
    }

    /// Render one frame of a started generator.
    pub fn layer_from_generator(&self, instance: &Instance, timecode: i64) -> Result<Layer, FilterError> {
        if !instance.is_inited() {
            return Err(FilterError::InvalidInstance);
        }
        self.negotiator().run_generator(instance, timecode)
    }

    /// Release every instance the host holds, drop the registry and unload
    /// every plugin. Fails while instances created elsewhere are alive.
    pub fn shutdown(&mut self) -> Result<(), HostError> {
        for which in [GeneratorSlot::Foreground, GeneratorSlot::Background] {
            if let Err(err) = self.generator_end(which) {
                tracing::debug!(?which, ?err, "generator deinit failed");
            }
        }
        self.keys.clear();
        let live = self.counter().get();
        if live > 0 {
            return Err(HostError::InvalidState(format!("{live} filter instances still alive")));
        }
        self.registry.clear();
        self.loader.unload_all(live)
    }
}

impl std::fmt::Debug for WeedHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeedHost")
            .field("plugins", &self.loader.len())
            .field("filters", &self.registry.len())
            .field("keys", &self.keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::testing;

    fn config_in(dir: &std::path::Path) -> HostConfig {
        HostConfig {
            plugin_paths: vec![dir.to_path_buf()],
            threads: 1,
            default_generator_width: 32,
            default_generator_height: 24,
            defaults_file: Some(dir.join("filter_defaults")),
            generator_sizes_file: Some(dir.join("generator_sizes")),
            ..HostConfig::default()
        }
    }

    #[test]
    fn scan_skips_files_that_are_not_plugins() {
        let dir = tempdir().unwrap();
        let ext = LoaderOptions::default().extension;
        fs::write(dir.path().join(format!("broken.{ext}")), b"garbage").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let mut host = WeedHost::new(config_in(dir.path()));
        let summary = host.load_plugins();
        assert_eq!(summary.plugins, 0);
        assert_eq!(summary.failed.len(), 1);
        assert!(matches!(summary.failed[0].1, HostError::LibraryLoad(_)));
        assert!(host.registry().is_empty());
    }

    #[test]
    fn builtin_generator_runs_end_to_end() {
        let dir = tempdir().unwrap();
        let mut host = WeedHost::new(config_in(dir.path()));
        assert_eq!(host.load_builtin("builtin_fill.so", testing::builtin_setup, None).unwrap(), 1);
        let filter = host.registry().get(0).unwrap().clone();
        assert_eq!(filter.hashname(), "builtin_fillfillbuiltin1");
        assert!(filter.is_generator());

        let instance = Instance::create(&filter, host.counter()).unwrap();
        host.generator_start(&instance, GeneratorSlot::Foreground).unwrap();
        assert_eq!(instance.plant().read().get_double(keys::TARGET_FPS).unwrap(), 25.0);
        let layer = host.layer_from_generator(&instance, 0).unwrap();
        let frame = layer.frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (32, 24));
        assert!(frame.row(0, 23).iter().all(|&b| b == 0x80));

        host.generator_end(GeneratorSlot::Foreground).unwrap();
        assert!(!instance.is_inited());
        assert!(matches!(host.shutdown(), Err(HostError::InvalidState(_))));
        assert_eq!(host.registry().len(), 1);
        drop(instance);
        drop(layer);
        host.shutdown().unwrap();
        assert!(host.registry().is_empty());
        assert!(host.loader().is_empty());
    }

    #[test]
    fn ordinary_filters_are_not_started_as_generators() {
        let dir = tempdir().unwrap();
        let host = WeedHost::new(config_in(dir.path()));
        let filter = testing::FilterBuilder::new("copy")
            .register(Arc::new(testing::FakeCallbacks::new(testing::FakeEffect::Copy)));
        let instance = Instance::create(&filter, host.counter()).unwrap();
        assert_eq!(
            host.generator_start(&instance, GeneratorSlot::Background),
            Err(FilterError::InvalidFilter)
        );
        assert!(host.keys().generator(GeneratorSlot::Background).is_none());
    }

    #[test]
    fn saved_generator_sizes_are_used_on_start() {
        let dir = tempdir().unwrap();
        let mut host = WeedHost::new(config_in(dir.path()));
        host.load_builtin("builtin_fill.so", testing::builtin_setup, None).unwrap();
        let filter = host.registry().get(0).unwrap().clone();
        let template = filter.class().out_channel_templates()[0].clone();
        template.handle().write().force_set(keys::HOST_WIDTH, 48).unwrap();
        template.handle().write().force_set(keys::HOST_HEIGHT, 0).unwrap();
        filter.class().handle().write().force_set(keys::HOST_FPS, 12.5).unwrap();
        host.save_persisted().unwrap();
        assert!(dir.path().join("generator_sizes").exists());

        template.handle().write().force_set(keys::HOST_WIDTH, 8).unwrap();
        host.load_persisted().unwrap();
        assert_eq!(template.int(keys::HOST_WIDTH), Some(48));

        let instance = Instance::create(&filter, host.counter()).unwrap();
        host.generator_start(&instance, GeneratorSlot::Background).unwrap();
        let out = instance.out_channels()[0].clone();
        assert_eq!(out.int_or(keys::WIDTH, 0), 48);
        assert_eq!(out.int_or(keys::HEIGHT, 0), 24);
        assert_eq!(instance.plant().read().get_double(keys::HOST_FPS).unwrap(), 12.5);
        host.generator_end(GeneratorSlot::Background).unwrap();
    }
}
