//! The table of filter classes the host can instantiate.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use weed_plant::{keys, LeafValue, Plant, PlantHandle, PlantType};

use crate::callbacks::FilterCallbacks;
use crate::connect::ParamLink;
use crate::filter::{self, Category, FilterClass, Rejection};
use crate::PluginCode;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("filter rejected with reason {code}: {0}", code = .0.code())]
    Rejected(Rejection),
    #[error("filter {0} is blacklisted")]
    Blacklisted(String),
    #[error("filter {0} is already registered")]
    Duplicate(String),
    #[error("compound filter part {0} is not registered")]
    UnknownPart(String),
    #[error("compound filter part {0} is not a single in, single out filter")]
    UnchainablePart(String),
    #[error("compound filter has no parts")]
    EmptyCompound,
    #[error("invalid parameter link: {0}")]
    InvalidLink(String),
}

/// A filter class accepted by the registry.
pub struct RegisteredFilter {
    class: FilterClass,
    plugin_name: String,
    hashname: String,
    loose_hashname: String,
    category: Category,
    callbacks: Arc<dyn FilterCallbacks>,
    parts: Vec<Arc<RegisteredFilter>>,
    param_links: Vec<ParamLink>,
}

impl RegisteredFilter {
    pub fn class(&self) -> &FilterClass {
        &self.class
    }

    pub fn name(&self) -> String {
        self.class.name()
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn hashname(&self) -> &str {
        &self.hashname
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn callbacks(&self) -> &Arc<dyn FilterCallbacks> {
        &self.callbacks
    }

    pub fn is_hidden(&self) -> bool {
        self.class.is_hidden()
    }

    pub fn is_generator(&self) -> bool {
        self.category == Category::Generator
    }

    /// Filters chained by a compound filter, in processing order.
    pub fn parts(&self) -> &[Arc<RegisteredFilter>] {
        &self.parts
    }

    pub fn is_compound(&self) -> bool {
        !self.parts.is_empty()
    }

    /// Parameter copies between parts, applied after each part runs.
    pub fn param_links(&self) -> &[ParamLink] {
        &self.param_links
    }
}

impl fmt::Debug for RegisteredFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFilter")
            .field("hashname", &self.hashname)
            .field("category", &self.category)
            .field("parts", &self.parts.len())
            .finish()
    }
}

/// Entry points of a compound filter; the work happens in its parts.
struct ChainCallbacks;

impl FilterCallbacks for ChainCallbacks {
    fn process(&self, _instance: &PlantHandle, _timecode: i64) -> PluginCode {
        PluginCode::Success
    }

    fn has_init(&self) -> bool {
        false
    }
}

fn check_link(parts: &[Arc<RegisteredFilter>], link: &ParamLink) -> Result<(), RegisterError> {
    let invalid = |what: &str| Err(RegisterError::InvalidLink(format!("{link:?}: {what}")));
    if link.from_part >= link.to_part {
        return invalid("parameters only flow to later parts");
    }
    let (Some(from), Some(to)) = (parts.get(link.from_part), parts.get(link.to_part)) else {
        return invalid("no such part");
    };
    let outs = from.class().out_param_templates();
    let ins = to.class().in_param_templates();
    let (Some(out), Some(input)) = (outs.get(link.out_param), ins.get(link.in_param)) else {
        return invalid("no such parameter");
    };
    if out.param_type() != input.param_type() {
        return invalid("parameter types differ");
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct FilterRegistry {
    filters: Vec<Arc<RegisteredFilter>>,
    blacklist: Vec<String>,
}

impl FilterRegistry {
    pub fn new(blacklist: Vec<String>) -> Self {
        Self {
            filters: Vec::new(),
            blacklist,
        }
    }

    /// Validate and add a filter class exported by `plugin_name`.
    ///
    /// Exact duplicates are refused. When another version of the same
    /// filter from the same plugin file is present, the older of the two is
    /// hidden from listings but stays usable.
    pub fn register(
        &mut self,
        plugin_name: &str,
        class: FilterClass,
        callbacks: Arc<dyn FilterCallbacks>,
    ) -> Result<usize, RegisterError> {
        filter::validate_filter(&class).map_err(RegisterError::Rejected)?;
        let hashname = filter::hashname(plugin_name, &class);
        if self
            .blacklist
            .iter()
            .any(|prefix| hashname.starts_with(prefix.as_str()))
        {
            return Err(RegisterError::Blacklisted(hashname));
        }
        if self.find(&hashname).is_some() {
            return Err(RegisterError::Duplicate(hashname));
        }
        let loose_hashname = filter::loose_hashname(plugin_name, &class);

        for other in &self.filters {
            if other.loose_hashname != loose_hashname || other.is_compound() {
                continue;
            }
            let hide = if class.version() > other.class.version() {
                &other.class
            } else {
                &class
            };
            let _ = hide.handle().write().force_set(keys::HOST_MENU_HIDE, true);
            tracing::debug!(
                filter = %loose_hashname,
                hidden_version = hide.version(),
                "partial duplicate filter hidden"
            );
        }

        filter::seal_filter(&class);
        let category = class.category();
        self.filters.push(Arc::new(RegisteredFilter {
            class,
            plugin_name: plugin_name.to_string(),
            hashname,
            loose_hashname,
            category,
            callbacks,
            parts: Vec::new(),
            param_links: Vec::new(),
        }));
        Ok(self.filters.len() - 1)
    }

    /// Chain registered filters into a compound filter. The compound takes
    /// its input channels from the first part, its output channels from the
    /// last and concatenates the parameters of all parts.
    pub fn register_compound(
        &mut self,
        name: &str,
        author: &str,
        part_hashnames: &[&str],
    ) -> Result<usize, RegisterError> {
        self.register_compound_linked(name, author, part_hashnames, &[])
    }

    /// Like [`FilterRegistry::register_compound`], with out parameters of
    /// earlier parts feeding in parameters of later ones.
    pub fn register_compound_linked(
        &mut self,
        name: &str,
        author: &str,
        part_hashnames: &[&str],
        links: &[ParamLink],
    ) -> Result<usize, RegisterError> {
        let mut parts = Vec::with_capacity(part_hashnames.len());
        for (pos, &hashname) in part_hashnames.iter().enumerate() {
            let part = self
                .find(hashname)
                .cloned()
                .ok_or_else(|| RegisterError::UnknownPart(hashname.to_string()))?;
            let class = part.class();
            let inputs = class.enabled_in_channels(false);
            let chainable = class.enabled_out_channels(false) == 1
                && (inputs == 1 || (pos == 0 && inputs == 0))
                && !part.is_compound();
            if !chainable {
                return Err(RegisterError::UnchainablePart(hashname.to_string()));
            }
            parts.push(part);
        }
        let (Some(first), Some(last)) = (parts.first(), parts.last()) else {
            return Err(RegisterError::EmptyCompound);
        };
        for link in links {
            check_link(&parts, link)?;
        }

        let mut plant = Plant::new(PlantType::FilterClass);
        let mut set = |key: &str, value: LeafValue| {
            let _ = plant.set(key, value);
        };
        set(keys::NAME, name.into());
        set(keys::AUTHOR, author.into());
        set(keys::VERSION, 1i32.into());
        set(keys::FLAGS, 0i32.into());
        set(keys::PROCESS_FUNC, LeafValue::FuncPtr(Vec::new()));
        set(
            keys::IN_CHANNEL_TEMPLATES,
            first.class().handle().plants(keys::IN_CHANNEL_TEMPLATES).into(),
        );
        set(
            keys::OUT_CHANNEL_TEMPLATES,
            last.class().handle().plants(keys::OUT_CHANNEL_TEMPLATES).into(),
        );
        let params: Vec<PlantHandle> = parts
            .iter()
            .flat_map(|part| part.class().handle().plants(keys::IN_PARAMETER_TEMPLATES))
            .collect();
        set(keys::IN_PARAMETER_TEMPLATES, params.into());

        let class = FilterClass::new(PlantHandle::from_plant(plant));
        let hashname = format!("{name}{author}1");
        if self.find(&hashname).is_some() {
            return Err(RegisterError::Duplicate(hashname));
        }
        let category = class.category();
        self.filters.push(Arc::new(RegisteredFilter {
            class,
            plugin_name: String::new(),
            loose_hashname: name.to_string(),
            hashname,
            category,
            callbacks: Arc::new(ChainCallbacks),
            parts,
            param_links: links.to_vec(),
        }));
        Ok(self.filters.len() - 1)
    }

    /// Index of the filter with `hashname`, or with a hashname starting with
    /// it when `fullname` is false.
    pub fn idx_for_hashname(&self, hashname: &str, fullname: bool) -> Option<usize> {
        self.filters.iter().position(|filter| {
            if fullname {
                filter.hashname == hashname
            } else {
                filter.hashname.starts_with(hashname)
            }
        })
    }

    pub fn find(&self, hashname: &str) -> Option<&Arc<RegisteredFilter>> {
        self.idx_for_hashname(hashname, true)
            .and_then(|idx| self.filters.get(idx))
    }

    pub fn get(&self, idx: usize) -> Option<&Arc<RegisteredFilter>> {
        self.filters.get(idx)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RegisteredFilter>> {
        self.filters.iter()
    }

    /// Filters shown to users: neither hidden duplicates nor converters.
    pub fn visible(&self) -> impl Iterator<Item = &Arc<RegisteredFilter>> {
        self.filters.iter().filter(|filter| !filter.is_hidden())
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }
}
