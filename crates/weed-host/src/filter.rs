//! Typed views over filter-class, channel-template and parameter-template
//! plants, plus the structural checks a filter must pass to be registered.

use std::fmt;
use std::path::Path;

use thiserror::Error;
use weed_plant::keys;
use weed_plant::palette::palette_list;
use weed_plant::{LeafFlags, LeafValue, Palette, PlantHandle};

use crate::flags;

/// Effect category derived from channel counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Unknown = 0,
    Generator = 1,
    Transition = 2,
    Filter = 3,
    Utility = 4,
    Compositor = 5,
    Tap = 6,
    Splitter = 7,
    Converter = 8,
}

impl Category {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn label(self) -> &'static str {
        match self {
            Category::Unknown => "unknown",
            Category::Generator => "generator",
            Category::Transition => "transition",
            Category::Filter => "filter",
            Category::Utility => "utility",
            Category::Compositor => "compositor",
            Category::Tap => "tap",
            Category::Splitter => "splitter",
            Category::Converter => "converter",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub fn categorise(is_converter: bool, inputs: usize, outputs: usize) -> Category {
    if is_converter {
        return Category::Converter;
    }
    match (inputs, outputs) {
        (0, out) if out > 0 => Category::Generator,
        (_, out) if out > 1 => Category::Splitter,
        (inp, 1) if inp > 2 => Category::Compositor,
        (2, 1) => Category::Transition,
        (1, 1) => Category::Filter,
        (inp, 0) if inp > 0 => Category::Tap,
        (0, 0) => Category::Utility,
        _ => Category::Unknown,
    }
}

/// Why a filter class was refused. The numeric codes appear in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Rejection {
    #[error("filter has no name")]
    NoName,
    #[error("filter has no author")]
    NoAuthor,
    #[error("filter has no version")]
    NoVersion,
    #[error("filter has no process function")]
    NoProcessFunc,
    #[error("filter is not realtime")]
    NonRealtime,
    #[error("in channel template lacks a name or palette list")]
    BadInTemplate,
    #[error("more than two mandatory video inputs")]
    TooManyVideoInputs,
    #[error("out channel template lacks a name or palette list")]
    BadOutTemplate,
    #[error("unsupported video output layout")]
    BadVideoOutputs,
    #[error("mandatory audio and video inputs mixed")]
    MixedInputs,
    #[error("unsupported audio output layout")]
    BadAudioOutputs,
    #[error("audio input without audio output or the reverse")]
    UnpairedAudio,
}

impl Rejection {
    pub fn code(self) -> u8 {
        match self {
            Rejection::NoName => 1,
            Rejection::NoAuthor => 2,
            Rejection::NoVersion => 3,
            Rejection::NoProcessFunc => 4,
            Rejection::NonRealtime => 5,
            Rejection::BadInTemplate => 6,
            Rejection::TooManyVideoInputs => 8,
            Rejection::BadOutTemplate => 9,
            Rejection::BadVideoOutputs => 11,
            Rejection::MixedInputs => 13,
            Rejection::BadAudioOutputs => 14,
            Rejection::UnpairedAudio => 15,
        }
    }
}

/// A registered or candidate filter class.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FilterClass(PlantHandle);

impl FilterClass {
    pub fn new(handle: PlantHandle) -> Self {
        FilterClass(handle)
    }

    pub fn handle(&self) -> &PlantHandle {
        &self.0
    }

    pub fn name(&self) -> String {
        self.0.string(keys::NAME).unwrap_or_default()
    }

    pub fn author(&self) -> String {
        self.0.string(keys::AUTHOR).unwrap_or_default()
    }

    pub fn version(&self) -> i32 {
        self.0.int_or(keys::VERSION, 0)
    }

    pub fn flags(&self) -> i32 {
        self.0.read().flag_bits()
    }

    pub fn has_flag(&self, bit: i32) -> bool {
        self.flags() & bit != 0
    }

    pub fn is_converter(&self) -> bool {
        self.has_flag(flags::FILTER_IS_CONVERTER)
    }

    pub fn may_thread(&self) -> bool {
        self.has_flag(flags::FILTER_HINT_MAY_THREAD)
    }

    pub fn is_stateless(&self) -> bool {
        self.has_flag(flags::FILTER_HINT_STATELESS)
    }

    pub fn in_channel_templates(&self) -> Vec<ChannelTemplate> {
        self.0
            .plants(keys::IN_CHANNEL_TEMPLATES)
            .into_iter()
            .map(ChannelTemplate)
            .collect()
    }

    pub fn out_channel_templates(&self) -> Vec<ChannelTemplate> {
        self.0
            .plants(keys::OUT_CHANNEL_TEMPLATES)
            .into_iter()
            .map(ChannelTemplate)
            .collect()
    }

    pub fn in_param_templates(&self) -> Vec<ParamTemplate> {
        self.0
            .plants(keys::IN_PARAMETER_TEMPLATES)
            .into_iter()
            .map(ParamTemplate)
            .collect()
    }

    pub fn out_param_templates(&self) -> Vec<ParamTemplate> {
        self.0
            .plants(keys::OUT_PARAMETER_TEMPLATES)
            .into_iter()
            .map(ParamTemplate)
            .collect()
    }

    /// Filter-wide palette list, used by templates without their own.
    pub fn palette_list(&self) -> Vec<Palette> {
        self.0
            .read()
            .get_ints(keys::PALETTE_LIST)
            .map(palette_list)
            .unwrap_or_default()
    }

    /// Palettes a template accepts, falling back to the filter's list.
    pub fn palettes_for(&self, template: &ChannelTemplate) -> Vec<Palette> {
        if template.handle().has_leaf(keys::PALETTE_LIST) {
            template.palette_list()
        } else {
            self.palette_list()
        }
    }

    /// Templates not disabled by the host. With `count_repeats` each
    /// repeatable template counts for its maximum repeats, unbounded ones
    /// for one million.
    pub fn enabled_in_channels(&self, count_repeats: bool) -> usize {
        count_enabled(&self.in_channel_templates(), count_repeats)
    }

    pub fn enabled_out_channels(&self, count_repeats: bool) -> usize {
        count_enabled(&self.out_channel_templates(), count_repeats)
    }

    pub fn is_generator(&self) -> bool {
        self.enabled_in_channels(false) == 0 && self.has_video_out(false)
    }

    pub fn has_video_in(&self, count_optional: bool) -> bool {
        self.in_channel_templates()
            .iter()
            .any(|t| (count_optional || !t.is_optional()) && !t.is_audio())
    }

    pub fn has_video_out(&self, count_optional: bool) -> bool {
        self.out_channel_templates()
            .iter()
            .any(|t| (count_optional || !t.is_optional()) && !t.is_audio())
    }

    pub fn has_audio_in(&self, count_optional: bool) -> bool {
        self.in_channel_templates()
            .iter()
            .any(|t| (count_optional || !t.is_optional()) && t.is_audio())
    }

    pub fn has_audio_out(&self, count_optional: bool) -> bool {
        self.out_channel_templates()
            .iter()
            .any(|t| (count_optional || !t.is_optional()) && t.is_audio())
    }

    pub fn category(&self) -> Category {
        categorise(
            self.is_converter(),
            self.enabled_in_channels(false),
            self.enabled_out_channels(false),
        )
    }

    pub fn plugin_info(&self) -> Option<PlantHandle> {
        self.0.plant(keys::PLUGIN_INFO)
    }

    pub fn is_hidden(&self) -> bool {
        self.0.bool_or(keys::HOST_MENU_HIDE, false)
    }
}

impl fmt::Debug for FilterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterClass")
            .field("name", &self.name())
            .field("author", &self.author())
            .field("version", &self.version())
            .finish()
    }
}

fn count_enabled(templates: &[ChannelTemplate], count_repeats: bool) -> usize {
    let mut enabled = 0;
    for template in templates {
        if !template.is_host_disabled() {
            enabled += 1;
        }
        if count_repeats {
            if let Some(repeats) = template.max_repeats() {
                enabled += if repeats == 0 {
                    1_000_000
                } else {
                    repeats.saturating_sub(1) as usize
                };
            }
        }
    }
    enabled
}

/// Identity string used to persist per-filter state across sessions:
/// plugin file stem, filter name, author and version run together.
pub fn hashname(plugin_name: &str, filter: &FilterClass) -> String {
    let stem = Path::new(plugin_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(plugin_name);
    format!(
        "{stem}{}{}{}",
        filter.name(),
        filter.author(),
        filter.version()
    )
}

/// Hashname without author and version, shared by versions of one filter.
pub fn loose_hashname(plugin_name: &str, filter: &FilterClass) -> String {
    let stem = Path::new(plugin_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(plugin_name);
    format!("{stem}{}", filter.name())
}

/// Check that a filter class describes something the host can drive.
///
/// Fills in missing `flags` leaves and marks optional channel templates
/// host-disabled; a rejected filter is left otherwise untouched.
pub fn validate_filter(filter: &FilterClass) -> Result<(), Rejection> {
    {
        let plant = filter.handle().read();
        if !plant.has_leaf(keys::NAME) {
            return Err(Rejection::NoName);
        }
        if !plant.has_leaf(keys::AUTHOR) {
            return Err(Rejection::NoAuthor);
        }
        if !plant.has_leaf(keys::VERSION) {
            return Err(Rejection::NoVersion);
        }
        if !plant.has_leaf(keys::PROCESS_FUNC) {
            return Err(Rejection::NoProcessFunc);
        }
    }
    ensure_flags(filter.handle());
    if filter.has_flag(flags::FILTER_NON_REALTIME) {
        return Err(Rejection::NonRealtime);
    }

    let filter_has_palettes = filter.handle().has_leaf(keys::PALETTE_LIST);
    let has_palettes = |t: &ChannelTemplate| filter_has_palettes || t.handle().has_leaf(keys::PALETTE_LIST);

    let ins = filter.in_channel_templates();
    for template in &ins {
        if !template.handle().has_leaf(keys::NAME) || (!template.is_audio() && !has_palettes(template)) {
            return Err(Rejection::BadInTemplate);
        }
    }
    let outs = filter.out_channel_templates();
    for template in &outs {
        if !template.handle().has_leaf(keys::NAME) || (!template.is_audio() && !has_palettes(template)) {
            return Err(Rejection::BadOutTemplate);
        }
    }

    let mut video_in = 0;
    let mut audio_in = 0;
    for template in &ins {
        ensure_flags(template.handle());
        if template.is_optional() {
            continue;
        }
        if template.is_audio() {
            audio_in += 1;
        } else if !filter.is_alpha_template(template) {
            video_in += 1;
        }
    }
    if video_in > 2 {
        return Err(Rejection::TooManyVideoInputs);
    }
    if audio_in > 0 && video_in > 0 {
        return Err(Rejection::MixedInputs);
    }

    let mut video_out = 0;
    let mut optional_out = 0;
    let mut alpha_out = 0;
    let mut audio_out = 0;
    for template in &outs {
        ensure_flags(template.handle());
        if template.is_optional() {
            optional_out += 1;
        } else if template.is_audio() {
            audio_out += 1;
        } else if filter.is_alpha_template(template) {
            alpha_out += 1;
        } else {
            video_out += 1;
        }
    }
    if video_out > 1 || video_out + optional_out + audio_out + alpha_out < 1 {
        return Err(Rejection::BadVideoOutputs);
    }
    if audio_out > 1 || (audio_out == 1 && video_out > 0) {
        return Err(Rejection::BadAudioOutputs);
    }
    if (audio_in == 1 && audio_out == 0) || (audio_in == 0 && audio_out == 1) {
        return Err(Rejection::UnpairedAudio);
    }

    for template in ins.iter().chain(outs.iter()) {
        if template.is_optional() {
            let _ = template.handle().write().force_set(keys::HOST_DISABLED, true);
        }
    }
    Ok(())
}

fn ensure_flags(handle: &PlantHandle) {
    let mut plant = handle.write();
    if !plant.has_leaf(keys::FLAGS) {
        let _ = plant.force_set(keys::FLAGS, 0);
    }
}

/// Freeze a validated filter against plugin writes.
pub fn seal_filter(filter: &FilterClass) {
    let plant = filter.handle();
    plant.write().add_flags_to_all(LeafFlags::READONLY_PLUGIN);
    if let Some(gui) = plant.plant(keys::GUI) {
        gui.write().add_flags_to_all(LeafFlags::READONLY_PLUGIN);
    }
    if filter.is_converter() {
        let _ = plant.write().force_set(keys::HOST_MENU_HIDE, true);
    }
}

impl FilterClass {
    /// A template whose palettes are all alpha-only carries masks between
    /// filters rather than frames from layers.
    pub fn is_alpha_template(&self, template: &ChannelTemplate) -> bool {
        if template.is_audio() {
            return false;
        }
        let palettes = self.palettes_for(template);
        !palettes.is_empty() && palettes.iter().all(|p| p.is_alpha())
    }
}

/// A channel template of a filter class.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChannelTemplate(PlantHandle);

impl ChannelTemplate {
    pub fn new(handle: PlantHandle) -> Self {
        ChannelTemplate(handle)
    }

    pub fn handle(&self) -> &PlantHandle {
        &self.0
    }

    pub fn name(&self) -> String {
        self.0.string(keys::NAME).unwrap_or_default()
    }

    pub fn flags(&self) -> i32 {
        self.0.read().flag_bits()
    }

    pub fn has_flag(&self, bit: i32) -> bool {
        self.flags() & bit != 0
    }

    pub fn is_audio(&self) -> bool {
        self.0.bool_or(keys::IS_AUDIO, false)
    }

    pub fn is_optional(&self) -> bool {
        self.has_flag(flags::CHANNEL_OPTIONAL)
    }

    /// `Some(0)` means unbounded repeats.
    pub fn max_repeats(&self) -> Option<i32> {
        self.0.read().get_int(keys::MAX_REPEATS).ok()
    }

    pub fn is_repeatable(&self) -> bool {
        self.max_repeats().is_some()
    }

    /// Number of channels an instance gets for this template.
    pub fn instance_count(&self) -> usize {
        match self.max_repeats() {
            Some(n) if n > 1 => n as usize,
            _ => 1,
        }
    }

    pub fn palette_list(&self) -> Vec<Palette> {
        self.0
            .read()
            .get_ints(keys::PALETTE_LIST)
            .map(palette_list)
            .unwrap_or_default()
    }

    pub fn is_host_disabled(&self) -> bool {
        self.0.bool_or(keys::HOST_DISABLED, false)
    }

    pub fn can_do_inplace(&self) -> bool {
        self.has_flag(flags::CHANNEL_CAN_DO_INPLACE)
    }

    pub fn int(&self, key: &str) -> Option<i32> {
        self.0.read().get_int(key).ok()
    }
}

impl fmt::Debug for ChannelTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelTemplate").field(&self.name()).finish()
    }
}

/// A parameter template of a filter class.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ParamTemplate(PlantHandle);

impl ParamTemplate {
    pub fn new(handle: PlantHandle) -> Self {
        ParamTemplate(handle)
    }

    pub fn handle(&self) -> &PlantHandle {
        &self.0
    }

    pub fn name(&self) -> String {
        self.0.string(keys::NAME).unwrap_or_default()
    }

    pub fn param_type(&self) -> i32 {
        self.0.int_or(keys::PARAM_TYPE, 0)
    }

    pub fn flags(&self) -> i32 {
        self.0.read().flag_bits()
    }

    pub fn is_per_channel(&self) -> bool {
        self.flags() & flags::PARAM_VALUE_PER_CHANNEL != 0
    }

    pub fn is_variable_size(&self) -> bool {
        self.flags() & flags::PARAM_VARIABLE_SIZE != 0
    }

    pub fn reinit_on_change(&self) -> bool {
        self.flags() & flags::PARAM_REINIT_ON_VALUE_CHANGE != 0
    }

    /// Integer parameter presented as a list of choices.
    pub fn has_choices(&self) -> bool {
        self.0
            .plant(keys::GUI)
            .map(|gui| gui.has_leaf(keys::CHOICES))
            .unwrap_or(false)
    }

    pub fn colorspace(&self) -> i32 {
        self.0.int_or(keys::COLORSPACE, flags::COLORSPACE_RGB)
    }

    /// Values per color element.
    pub fn color_components(&self) -> usize {
        if self.colorspace() == flags::COLORSPACE_RGBA {
            4
        } else {
            3
        }
    }

    /// The value a fresh parameter starts from: `host_default`, then
    /// `default`, then `new_default`.
    pub fn default_value(&self) -> Option<LeafValue> {
        let plant = self.0.read();
        [keys::HOST_DEFAULT, keys::DEFAULT, keys::NEW_DEFAULT]
            .into_iter()
            .find_map(|key| plant.value(key).cloned())
    }
}

impl fmt::Debug for ParamTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ParamTemplate").field(&self.name()).finish()
    }
}
