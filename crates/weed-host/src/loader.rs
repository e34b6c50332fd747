use std::ffi::{c_void, OsStr};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use walkdir::WalkDir;
use weed_plant::{keys, PlantHandle, PlantType};

use crate::abi::{self, DesetupFn, SetupFn, DESETUP_SYMBOL, SETUP_SYMBOL};
use crate::config::LoaderOptions;
use crate::filter::FilterClass;
use crate::handles;
use crate::HostError;

/// An opened plugin binary, or a setup function linked into the host.
pub struct PluginLibrary {
    path: PathBuf,
    name: String,
    setup: SetupFn,
    desetup: Option<DesetupFn>,
    library: Option<Library>,
}

impl PluginLibrary {
    /// Load a plugin binary and resolve `weed_setup` (and `weed_desetup`
    /// when exported).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HostError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(HostError::MissingBinary(path.to_path_buf()));
        }

        let library = unsafe { Library::new(path) }?;
        let setup = unsafe {
            *library
                .get::<SetupFn>(SETUP_SYMBOL)
                .map_err(|_| HostError::missing_entry(path.to_path_buf(), "weed_setup"))?
        };
        let desetup = unsafe { library.get::<DesetupFn>(DESETUP_SYMBOL).ok().map(|sym| *sym) };

        Ok(Self {
            path: path.to_path_buf(),
            name: file_name(path),
            setup,
            desetup,
            library: Some(library),
        })
    }

    /// Wrap a setup function compiled into the host binary.
    pub fn builtin(name: &str, setup: SetupFn, desetup: Option<DesetupFn>) -> Self {
        Self {
            path: PathBuf::from(name),
            name: name.to_string(),
            setup,
            desetup,
            library: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the binary; the first component of every hashname.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_builtin(&self) -> bool {
        self.library.is_none()
    }

    /// Directory a plugin expects as its working directory during init.
    pub fn install_dir(&self) -> Option<PathBuf> {
        if self.is_builtin() {
            return None;
        }
        self.path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
    }

    fn run_setup(&self) -> *mut c_void {
        unsafe { (self.setup)(abi::bootstrap) }
    }

    fn run_desetup(&self) {
        if let Some(desetup) = self.desetup {
            unsafe { desetup() };
        }
    }
}

impl fmt::Debug for PluginLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLibrary")
            .field("path", &self.path)
            .field("builtin", &self.is_builtin())
            .finish()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(OsStr::to_str)
        .unwrap_or_default()
        .to_string()
}

/// Structural checks on the plant returned by `weed_setup`.
pub fn check_plugin_info(info: &PlantHandle) -> Result<(), &'static str> {
    let plant = info.read();
    if plant.plant_type() != PlantType::PluginInfo {
        return Err("setup did not return a plugin info plant");
    }
    if !plant.has_leaf(keys::HOST_INFO) {
        return Err("plugin info has no host_info");
    }
    if !plant.has_leaf(keys::VERSION) {
        return Err("plugin info has no version");
    }
    if plant.plants(keys::FILTERS).is_empty() {
        return Err("plugin info lists no filters");
    }
    Ok(())
}

/// A plugin whose setup succeeded.
#[derive(Debug)]
pub struct LoadedPlugin {
    library: Arc<PluginLibrary>,
    info: PlantHandle,
    owned: Vec<PlantHandle>,
    suspicious: bool,
    weed_api: i32,
    filter_api: i32,
}

impl LoadedPlugin {
    pub fn library(&self) -> &Arc<PluginLibrary> {
        &self.library
    }

    pub fn name(&self) -> &str {
        self.library.name()
    }

    pub fn info(&self) -> &PlantHandle {
        &self.info
    }

    pub fn filters(&self) -> Vec<FilterClass> {
        self.info
            .plants(keys::FILTERS)
            .into_iter()
            .map(FilterClass::new)
            .collect()
    }

    /// The handshake did not match what the host handed out.
    pub fn is_suspicious(&self) -> bool {
        self.suspicious
    }

    pub fn api_versions(&self) -> (i32, i32) {
        (self.weed_api, self.filter_api)
    }

    fn release(self) {
        for plant in &self.owned {
            plant.write().clear();
        }
        self.info.write().clear();
        self.library.run_desetup();
    }
}

/// Finds, opens and keeps plugin binaries.
#[derive(Debug, Default)]
pub struct PluginLoader {
    options: LoaderOptions,
    plugins: Vec<LoadedPlugin>,
}

impl PluginLoader {
    pub fn new(options: LoaderOptions) -> Self {
        Self {
            options,
            plugins: Vec::new(),
        }
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Plugin binaries under `roots`, descending into subdirectories up to
    /// the configured depth. The result is sorted and free of duplicates.
    pub fn discover(&self, roots: &[PathBuf]) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for root in roots {
            if !root.is_dir() {
                continue;
            }
            let walker = WalkDir::new(root)
                .max_depth(self.options.max_depth + 1)
                .follow_links(true)
                .into_iter()
                .filter_entry(|entry| {
                    entry.depth() == 0
                        || !entry.file_type().is_dir()
                        || !self
                            .options
                            .skip_dirs
                            .iter()
                            .any(|skip| entry.file_name() == OsStr::new(skip))
                });
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::debug!(%err, root = %root.display(), "skipping entry");
                        continue;
                    }
                };
                let matches = entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == OsStr::new(&self.options.extension));
                if entry.file_type().is_file() && matches {
                    found.push(entry.into_path());
                }
            }
        }
        found.sort();
        found.dedup();
        found
    }

    /// Open the binary at `path` and run its setup. Returns the plugin's
    /// index.
    pub fn load_plugin(&mut self, path: &Path) -> Result<usize, HostError> {
        let library = PluginLibrary::open(path)?;
        self.install(library)
    }

    pub fn load_builtin(
        &mut self,
        name: &str,
        setup: SetupFn,
        desetup: Option<DesetupFn>,
    ) -> Result<usize, HostError> {
        self.install(PluginLibrary::builtin(name, setup, desetup))
    }

    fn install(&mut self, library: PluginLibrary) -> Result<usize, HostError> {
        let table = handles::table();
        let mark = table.mark();
        abi::begin_handshake();
        let ptr = library.run_setup();
        let handshake = abi::finish_handshake();
        let owned = table.demote_since(mark);

        let fail = |reason: &str| {
            for plant in &owned {
                plant.write().clear();
            }
            library.run_desetup();
            HostError::invalid_plugin(library.path().to_path_buf(), reason)
        };

        let Some(handshake) = handshake.filter(|h| h.calls > 0) else {
            return Err(fail("setup never called the bootstrap"));
        };
        let Some(info) = handles::resolve(ptr) else {
            return Err(fail("setup returned no plugin info"));
        };
        if let Err(reason) = check_plugin_info(&info) {
            return Err(fail(reason));
        }

        let expected = handshake.host_info.clone();
        let returned = info.plant(keys::HOST_INFO);
        let suspicious = match (&expected, &returned) {
            (Some(expected), Some(returned)) => {
                !expected.ptr_eq(returned)
                    || returned.read().get_int64(keys::HOST_ID).ok() != Some(handshake.host_id)
            }
            _ => true,
        };
        if suspicious {
            tracing::warn!(
                plugin = %library.path().display(),
                "plugin returned a host info the host did not issue"
            );
        }

        let _ = info.write().force_set(keys::PACKAGE_NAME, library.name());
        tracing::debug!(
            plugin = %library.path().display(),
            weed_api = handshake.weed_api,
            filter_api = handshake.filter_api,
            "plugin loaded"
        );
        self.plugins.push(LoadedPlugin {
            library: Arc::new(library),
            info,
            owned,
            suspicious,
            weed_api: handshake.weed_api,
            filter_api: handshake.filter_api,
        });
        Ok(self.plugins.len() - 1)
    }

    pub fn plugins(&self) -> &[LoadedPlugin] {
        &self.plugins
    }

    pub fn get(&self, idx: usize) -> Option<&LoadedPlugin> {
        self.plugins.get(idx)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Break every plugin-made plant apart, run `weed_desetup` and drop
    /// the libraries. Refused while instances are alive.
    pub fn unload_all(&mut self, live_instances: usize) -> Result<(), HostError> {
        if live_instances > 0 {
            return Err(HostError::InvalidState(format!(
                "{live_instances} filter instances still alive"
            )));
        }
        for plugin in self.plugins.drain(..) {
            plugin.release();
        }
        handles::table().prune();
        Ok(())
    }
}
