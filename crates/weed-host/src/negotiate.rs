//! Binding layers to instance channels and running one frame.
//!
//! [`Negotiator::apply`] maps timeline tracks onto the video channels of an
//! instance, temporarily disables channels that have nothing to show,
//! resizes and repacks layers until every channel template is satisfied,
//! allocates or aliases output buffers and finally calls the plugin. The
//! outputs are written back to the layers the out tracks name.

use weed_plant::{
    best_palette_match, keys, FrameBuffer, LeafValue, Palette, Plant, PlantHandle,
};

use crate::config::HostConfig;
use crate::connect::AlphaRouter;
use crate::convert::FrameConverter;
use crate::filter::{ChannelTemplate, FilterClass};
use crate::instance::Instance;
use crate::layer::{AudioBuffer, Layer, LayerStatus};
use crate::{flags, pipeline, FilterError, FilterResult, FilterStatus, PluginCode};

/// Row alignment of output buffers when the template asks for none.
pub const DEFAULT_ALIGNMENT: usize = 16;

const VIDEO_KEYS: [&str; 8] = [
    keys::CURRENT_PALETTE,
    keys::WIDTH,
    keys::HEIGHT,
    keys::ROWSTRIDES,
    keys::PIXEL_DATA,
    keys::YUV_CLAMPING,
    keys::YUV_SAMPLING,
    keys::YUV_SUBSPACE,
];

const AUDIO_KEYS: [&str; 4] = [
    keys::AUDIO_DATA,
    keys::AUDIO_DATA_LENGTH,
    keys::AUDIO_RATE,
    keys::AUDIO_CHANNELS,
];

/// Host-wide frame size bounds, in macropixels and rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    pub min_width: usize,
    pub min_height: usize,
    pub max_width: usize,
    pub max_height: usize,
}

impl SizeLimits {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            min_width: config.min_width,
            min_height: config.min_height,
            max_width: config.max_width,
            max_height: config.max_height,
        }
    }
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            min_width: 4,
            min_height: 4,
            max_width: 8192,
            max_height: 8192,
        }
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

fn positive(value: i32) -> Option<usize> {
    (value > 0).then_some(value as usize)
}

fn constraint(filter: &FilterClass, template: &ChannelTemplate, key: &str) -> Option<usize> {
    template
        .int(key)
        .or_else(|| filter.handle().read().get_int(key).ok())
        .and_then(positive)
}

fn constraint_list(filter: &FilterClass, template: &ChannelTemplate, key: &str) -> Option<Vec<usize>> {
    let read = |plant: &PlantHandle| {
        plant
            .read()
            .get_ints(key)
            .ok()
            .map(|values| values.iter().copied().filter_map(positive).collect::<Vec<_>>())
    };
    read(template.handle())
        .or_else(|| read(filter.handle()))
        .filter(|values| !values.is_empty())
}

/// Clamp into `[min, max]` and round down to a multiple of `step`, rounding
/// up instead when that would leave the bounds.
fn snap(value: usize, min: usize, max: usize, step: usize) -> usize {
    let max = max.max(min);
    let value = value.clamp(min, max);
    let down = value / step * step;
    if down >= min && down > 0 {
        return down;
    }
    let up = down + step;
    if up <= max {
        up
    } else {
        down.max(step)
    }
}

fn nearest_fixed(values: &[usize], target: usize) -> usize {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    sorted
        .iter()
        .copied()
        .find(|&value| value >= target)
        .or(sorted.last().copied())
        .unwrap_or(target)
}

#[allow(clippy::too_many_arguments)]
fn dimension(
    filter: &FilterClass,
    template: &ChannelTemplate,
    value: usize,
    host_min: usize,
    host_max: usize,
    min_key: &str,
    max_key: &str,
    step_key: &str,
) -> usize {
    let min = constraint(filter, template, min_key).map_or(host_min, |min| min.max(host_min));
    let max = constraint(filter, template, max_key).map_or(host_max, |max| max.min(host_max));
    let step = lcm(2, constraint(filter, template, step_key).unwrap_or(1));
    snap(value, min, max, step)
}

/// The channel size closest to `width` x `height` that the template (or
/// its filter) and the host accept. Applying it to its own result changes
/// nothing.
pub fn validate_channel_sizes(
    filter: &FilterClass,
    template: &ChannelTemplate,
    width: usize,
    height: usize,
    limits: &SizeLimits,
) -> (usize, usize) {
    let widths = constraint_list(filter, template, keys::FIXED_WIDTHS);
    let heights = constraint_list(filter, template, keys::FIXED_HEIGHTS);
    match (widths, heights) {
        (Some(widths), Some(heights)) => {
            let mut pairs: Vec<(usize, usize)> = widths.into_iter().zip(heights).collect();
            pairs.sort_unstable_by_key(|&(w, h)| (w * h, w));
            pairs
                .iter()
                .copied()
                .find(|&(w, h)| w >= width && h >= height)
                .or(pairs.last().copied())
                .unwrap_or((width, height))
        }
        (widths, heights) => {
            let width = match widths {
                Some(widths) => nearest_fixed(&widths, width),
                None => dimension(
                    filter,
                    template,
                    width,
                    limits.min_width,
                    limits.max_width,
                    keys::MINWIDTH,
                    keys::MAXWIDTH,
                    keys::HSTEP,
                ),
            };
            let height = match heights {
                Some(heights) => nearest_fixed(&heights, height),
                None => dimension(
                    filter,
                    template,
                    height,
                    limits.min_height,
                    limits.max_height,
                    keys::MINHEIGHT,
                    keys::MAXHEIGHT,
                    keys::VSTEP,
                ),
            };
            (width, height)
        }
    }
}

/// Loads pixel data for layers that name a frame but carry no buffer yet.
pub trait FrameSource: Send + Sync {
    fn pull_frame(&self, layer: &mut Layer, timecode: i64) -> bool;
}

/// Which layer feeds each input channel and receives each output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMap {
    pub in_tracks: Vec<i32>,
    pub out_tracks: Vec<i32>,
}

impl TrackMap {
    pub fn new(in_tracks: Vec<i32>, out_tracks: Vec<i32>) -> Self {
        Self {
            in_tracks,
            out_tracks,
        }
    }

    /// Inputs from tracks `0..inputs`, output to track 0.
    pub fn sequential(inputs: usize) -> Self {
        Self::new((0..inputs as i32).collect(), vec![0])
    }
}

fn template_of(channel: &PlantHandle) -> Option<ChannelTemplate> {
    channel.plant(keys::TEMPLATE).map(ChannelTemplate::new)
}

fn is_disabled(channel: &PlantHandle) -> bool {
    channel.bool_or(keys::DISABLED, false)
}

fn is_video(class: &FilterClass, channel: &PlantHandle) -> bool {
    template_of(channel).is_some_and(|t| !t.is_audio() && !class.is_alpha_template(&t))
}

fn alpha_template(class: &FilterClass, channel: &PlantHandle) -> Option<ChannelTemplate> {
    template_of(channel).filter(|t| class.is_alpha_template(t))
}

fn is_audio(channel: &PlantHandle) -> bool {
    template_of(channel).is_some_and(|t| t.is_audio())
}

fn may_skip(template: Option<&ChannelTemplate>) -> bool {
    template.is_some_and(|t| t.is_repeatable() || t.is_optional())
}

fn force_leaf(plant: &mut Plant, key: &str, value: impl Into<LeafValue>) {
    if let Err(err) = plant.force_set(key, value) {
        tracing::debug!(?err, key, "could not set channel leaf");
    }
}

fn set(channel: &PlantHandle, key: &str, value: impl Into<LeafValue>) {
    force_leaf(&mut channel.write(), key, value);
}

/// Copy `keys` from `source`, dropping the ones `source` lacks.
fn mirror_leaves(channel: &PlantHandle, source: &Plant, keys: &[&str]) {
    let mut plant = channel.write();
    for &key in keys {
        match source.value(key) {
            Some(value) => force_leaf(&mut plant, key, value.clone()),
            None => plant.remove(key),
        }
    }
}

fn bind_frame(channel: &PlantHandle, frame: &mut FrameBuffer) {
    let mut plant = Plant::bare();
    let _ = plant.set(keys::CURRENT_PALETTE, frame.palette().code());
    let _ = plant.set(keys::WIDTH, frame.width() as i32);
    let _ = plant.set(keys::HEIGHT, frame.height() as i32);
    let strides: Vec<i32> = frame.rowstrides().iter().map(|&s| s as i32).collect();
    let _ = plant.set(keys::ROWSTRIDES, strides);
    let _ = plant.set(keys::PIXEL_DATA, frame.plane_ptrs());
    mirror_leaves(channel, &plant, &VIDEO_KEYS);
}

fn bind_audio(channel: &PlantHandle, audio: &mut AudioBuffer) {
    let mut plant = Plant::bare();
    let _ = plant.set(keys::AUDIO_DATA, audio.channel_ptrs());
    let _ = plant.set(keys::AUDIO_DATA_LENGTH, audio.samples() as i32);
    let _ = plant.set(keys::AUDIO_RATE, audio.rate());
    let _ = plant.set(keys::AUDIO_CHANNELS, audio.num_channels() as i32);
    mirror_leaves(channel, &plant, &AUDIO_KEYS);
}

/// Geometry a channel had before this frame, for reinit decisions.
#[derive(Debug, PartialEq)]
struct ChannelShape {
    palette: i32,
    width: i32,
    height: i32,
    rowstrides: Vec<i32>,
}

impl ChannelShape {
    fn of(channel: &PlantHandle) -> Self {
        let plant = channel.read();
        Self {
            palette: plant.int_or(keys::CURRENT_PALETTE, 0),
            width: plant.int_or(keys::WIDTH, 0),
            height: plant.int_or(keys::HEIGHT, 0),
            rowstrides: plant
                .get_ints(keys::ROWSTRIDES)
                .map(<[i32]>::to_vec)
                .unwrap_or_default(),
        }
    }

    fn palette(&self) -> Option<Palette> {
        Palette::from_code(self.palette)
    }

    /// Whether moving to `new` needs a reinit under the template `flags`.
    /// A channel that was never bound needs none.
    fn requires_reinit(&self, new: &ChannelShape, flags: i32) -> bool {
        if self.palette == 0 {
            return false;
        }
        (flags & flags::CHANNEL_REINIT_ON_SIZE_CHANGE != 0
            && (self.width, self.height) != (new.width, new.height))
            || (flags & flags::CHANNEL_REINIT_ON_PALETTE_CHANGE != 0 && self.palette != new.palette)
            || (flags & flags::CHANNEL_REINIT_ON_ROWSTRIDES_CHANGE != 0
                && self.rowstrides != new.rowstrides)
    }
}

/// Channels switched off for one call. Dropping re-enables them.
#[derive(Default)]
struct TempDisabled(Vec<PlantHandle>);

impl TempDisabled {
    fn disable(&mut self, channel: &PlantHandle) {
        if is_disabled(channel) {
            return;
        }
        let mut plant = channel.write();
        force_leaf(&mut plant, keys::TEMP_DISABLED, true);
        force_leaf(&mut plant, keys::DISABLED, true);
        plant.remove(keys::PIXEL_DATA);
        plant.remove(keys::AUDIO_DATA);
        drop(plant);
        self.0.push(channel.clone());
    }
}

impl Drop for TempDisabled {
    fn drop(&mut self) {
        for channel in &self.0 {
            let mut plant = channel.write();
            force_leaf(&mut plant, keys::DISABLED, false);
            force_leaf(&mut plant, keys::TEMP_DISABLED, false);
        }
    }
}

/// Outputs allocated for one call, written back once the plugin returns.
enum Output {
    InPlace,
    Video(usize, FrameBuffer),
    Audio(usize, AudioBuffer),
}

/// Everything one apply needs besides the instance and its layers.
pub struct Negotiator<'a> {
    pub limits: SizeLimits,
    pub converter: &'a dyn FrameConverter,
    pub source: Option<&'a dyn FrameSource>,
    /// Slices per frame for filters that may thread.
    pub threads: usize,
    pub inplace_when_threaded: bool,
    /// Clip that only transitions and compositors may touch.
    pub scrap_clip: Option<i32>,
    pub fps: f64,
    /// Where alpha inputs come from and alpha outputs go.
    pub alpha: Option<&'a dyn AlphaRouter>,
}

impl<'a> Negotiator<'a> {
    pub fn new(converter: &'a dyn FrameConverter) -> Self {
        Self {
            limits: SizeLimits::default(),
            converter,
            source: None,
            threads: 1,
            inplace_when_threaded: false,
            scrap_clip: None,
            fps: 25.0,
            alpha: None,
        }
    }

    pub fn from_config(config: &HostConfig, converter: &'a dyn FrameConverter) -> Self {
        Self {
            limits: SizeLimits::from_config(config),
            threads: config.threads.max(1),
            inplace_when_threaded: config.inplace_when_threaded,
            ..Self::new(converter)
        }
    }

    /// Run `instance` over video `layers`. Without `tracks`, enabled input
    /// channels read layers in order and the output replaces layer 0;
    /// `opsize` caps the output size in pixels.
    pub fn apply(
        &self,
        instance: &Instance,
        layers: &mut [Layer],
        tracks: Option<&TrackMap>,
        opsize: Option<(usize, usize)>,
        timecode: i64,
    ) -> FilterResult {
        let class = instance.filter().class();
        let in_channels: Vec<PlantHandle> = instance
            .in_channels()
            .into_iter()
            .filter(|channel| !is_audio(channel))
            .collect();
        if !class.has_video_in(true) {
            return Err(if class.has_audio_in(true) || class.has_audio_out(true) {
                FilterError::IsAudio
            } else {
                FilterError::MissingChannel
            });
        }
        if in_channels.iter().all(is_disabled) {
            return Err(FilterError::MissingChannel);
        }
        if let Some(status) = self.skip_if_easing(instance) {
            return status;
        }
        if instance.is_compound() {
            return self.apply_chain(instance, layers, tracks, opsize, timecode);
        }
        let video: Vec<PlantHandle> = in_channels
            .into_iter()
            .filter(|channel| is_video(class, channel))
            .collect();
        let default_tracks;
        let tracks = match tracks {
            Some(tracks) => tracks,
            None => {
                default_tracks =
                    TrackMap::sequential(video.iter().filter(|c| !is_disabled(c)).count());
                &default_tracks
            }
        };
        with_busy_layers(layers, tracks, |layers| {
            self.apply_video(instance, &video, layers, tracks, opsize, timecode)
        })
    }

    /// Run the parts of a compound filter in order. Each part after the
    /// first reads and replaces the layer the previous one wrote.
    fn apply_chain(
        &self,
        instance: &Instance,
        layers: &mut [Layer],
        tracks: Option<&TrackMap>,
        opsize: Option<(usize, usize)>,
        timecode: i64,
    ) -> FilterResult {
        let mut status = FilterStatus::Success;
        let mut link: Option<TrackMap> = None;
        let parts: Vec<&Instance> = instance.chain().collect();
        let param_links = instance.filter().param_links();
        for (pos, part) in parts.iter().enumerate() {
            let part_tracks = link.as_ref().or(tracks);
            let part_status = self.apply(part, layers, part_tracks, opsize, timecode)?;
            if part_status != FilterStatus::Success {
                status = part_status;
            }
            for param_link in param_links.iter().filter(|l| l.from_part == pos) {
                let Some(source) = part.out_params().into_iter().nth(param_link.out_param) else {
                    continue;
                };
                let value = source.read().value(keys::VALUE).cloned();
                let (Some(value), Some(target)) = (value, parts.get(param_link.to_part)) else {
                    continue;
                };
                if target.set_param_value(param_link.in_param, value)? != FilterStatus::Success {
                    status = FilterStatus::InfoReinited;
                }
            }
            let out = part_tracks
                .and_then(|tracks| tracks.out_tracks.first().copied())
                .unwrap_or(0);
            link = Some(TrackMap::new(vec![out], vec![out]));
        }
        Ok(status)
    }

    fn skip_if_easing(&self, instance: &Instance) -> Option<FilterResult> {
        if !instance.is_easing_out() {
            return None;
        }
        if instance.ease_out_tick() == 0 {
            if let Err(err) = instance.deinit() {
                tracing::debug!(?err, "deinit after easing out failed");
            }
        }
        Some(Ok(FilterStatus::Success))
    }

    fn apply_video(
        &self,
        instance: &Instance,
        in_channels: &[PlantHandle],
        layers: &mut [Layer],
        tracks: &TrackMap,
        opsize: Option<(usize, usize)>,
        timecode: i64,
    ) -> FilterResult {
        let class = instance.filter().class();
        let mut temp = TempDisabled::default();
        let num_in_tracks = tracks.in_tracks.len().min(in_channels.len());
        for channel in &in_channels[num_in_tracks..] {
            temp.disable(channel);
        }

        // pair channels with layers
        let mut bound: Vec<(usize, usize)> = Vec::new();
        for (i, &track) in tracks.in_tracks[..num_in_tracks].iter().enumerate() {
            let channel = &in_channels[i];
            if track < 0 {
                return Err(FilterError::InvalidTrack);
            }
            if is_disabled(channel) {
                continue;
            }
            let template = template_of(channel);
            let track = track as usize;
            let Some(layer) = layers.get_mut(track) else {
                for channel in &in_channels[i..num_in_tracks] {
                    if !may_skip(template_of(channel).as_ref()) {
                        return Err(FilterError::MissingLayer);
                    }
                    temp.disable(channel);
                }
                break;
            };
            if layer.audio().is_some() {
                return Err(FilterError::InvalidTrack);
            }
            if !layer.has_pixels() {
                if layer.frame_number() == 0 {
                    if may_skip(template.as_ref()) {
                        temp.disable(channel);
                        continue;
                    }
                    return Err(FilterError::BlankFrame);
                }
                let pulled = self
                    .source
                    .is_some_and(|source| source.pull_frame(layer, timecode));
                if !pulled || !layer.has_pixels() {
                    return Err(FilterError::InvalidLayer);
                }
            }
            bound.push((i, track));
        }

        // alpha inputs come from the router, not from layers
        let mut needs_reinit = false;
        let mut masks: Vec<FrameBuffer> = Vec::new();
        for (idx, channel) in instance.in_channels().iter().enumerate() {
            let Some(template) = alpha_template(class, channel) else {
                continue;
            };
            if is_disabled(channel) {
                continue;
            }
            match self.alpha.and_then(|router| router.pull_alpha(instance, idx)) {
                Some(mut mask) => {
                    if !class.palettes_for(&template).contains(&mask.palette()) {
                        return Err(FilterError::TemplateMismatch);
                    }
                    let before = ChannelShape::of(channel);
                    bind_frame(channel, &mut mask);
                    set(channel, keys::TIMECODE, timecode);
                    needs_reinit |= before.requires_reinit(&ChannelShape::of(channel), template.flags());
                    masks.push(mask);
                }
                None if may_skip(Some(&template)) => temp.disable(channel),
                None => return Err(FilterError::MissingLayer),
            }
        }

        // every mandatory template keeps at least one live channel
        for template in class.in_channel_templates() {
            if template.is_optional() || template.is_audio() || class.is_alpha_template(&template) {
                continue;
            }
            let served = in_channels.iter().any(|channel| {
                !is_disabled(channel)
                    && template_of(channel).is_some_and(|t| t.handle() == template.handle())
            });
            if !served {
                return Err(FilterError::MissingLayer);
            }
        }

        if let Some(scrap) = self.scrap_clip {
            let single = tracks.in_tracks.len() == 1 && tracks.out_tracks.len() == 1;
            if single && bound.iter().any(|&(_, track)| layers[track].clip() == scrap) {
                return Err(FilterError::IsScrapFile);
            }
        }

        // output size in pixels: the largest input, capped by opsize
        let (mut op_width, mut op_height) = (4, 4);
        for &(_, track) in &bound {
            let layer = &layers[track];
            let ppm = layer.palette().map_or(1, |p| p.pixels_per_macropixel());
            op_width = op_width.max(layer.width() * ppm);
            op_height = op_height.max(layer.height());
        }
        if let Some((width, height)) = opsize {
            if width != 0 && width < op_width {
                op_width = width;
            }
            if height != 0 && height < op_height {
                op_height = height;
            }
        }

        let threaded = class.may_thread() && self.threads > 1;
        let mut first_palette: Option<Palette> = None;
        for &(i, track) in &bound {
            let channel = &in_channels[i];
            let template = template_of(channel).ok_or(FilterError::InvalidInstance)?;
            let layer = &mut layers[track];
            let layer_palette = layer.palette().ok_or(FilterError::InvalidLayer)?;
            let wanted = match first_palette {
                Some(palette) if !class.has_flag(flags::FILTER_PALETTES_MAY_VARY) => palette,
                _ => layer_palette,
            };
            let palette = best_palette_match(&class.palettes_for(&template), wanted)
                .ok_or(FilterError::TemplateMismatch)?;
            first_palette.get_or_insert(palette);

            let (width_px, height) = if class.has_flag(flags::FILTER_CHANNEL_SIZES_MAY_VARY) {
                (layer.width() * layer_palette.pixels_per_macropixel(), layer.height())
            } else {
                (op_width, op_height)
            };
            let (width, height) = validate_channel_sizes(
                class,
                &template,
                width_px / palette.pixels_per_macropixel(),
                height,
                &self.limits,
            );
            self.conform(layer, palette, width, height)?;

            let before = ChannelShape::of(channel);
            mirror_leaves(channel, &layer.plant().read(), &VIDEO_KEYS);
            set(channel, keys::TIMECODE, timecode);
            needs_reinit |= before.requires_reinit(&ChannelShape::of(channel), template.flags());
        }

        // outputs
        let out_channels: Vec<PlantHandle> = instance
            .out_channels()
            .into_iter()
            .filter(|channel| is_video(class, channel) && !is_disabled(channel))
            .collect();
        let def_channel = bound.first().map(|&(i, _)| &in_channels[i]);
        let def_palette = def_channel.and_then(|c| ChannelShape::of(c).palette());
        let mut outputs = Vec::new();
        for (i, &track) in tracks.out_tracks.iter().enumerate() {
            if track < 0 {
                return Err(FilterError::InvalidTrack);
            }
            let track = track as usize;
            if track >= layers.len() {
                return Err(FilterError::MissingLayer);
            }
            let Some(channel) = out_channels.get(i) else {
                break;
            };
            let template = template_of(channel).ok_or(FilterError::InvalidInstance)?;
            let palettes = class.palettes_for(&template);
            let before = ChannelShape::of(channel);
            set(channel, keys::TIMECODE, timecode);

            let inplace = i == 0
                && tracks.in_tracks.first() == Some(&(track as i32))
                && template.can_do_inplace()
                && (!threaded || self.inplace_when_threaded)
                && def_palette.is_some_and(|p| palettes.contains(&p));
            let output = match def_channel {
                Some(def_channel) if inplace => {
                    mirror_leaves(channel, &def_channel.read(), &VIDEO_KEYS);
                    set(channel, keys::INPLACE, true);
                    Output::InPlace
                }
                _ => {
                    let palette = def_palette
                        .or_else(|| palettes.first().copied())
                        .and_then(|p| best_palette_match(&palettes, p))
                        .ok_or(FilterError::TemplateMismatch)?;
                    let (width, height) = validate_channel_sizes(
                        class,
                        &template,
                        op_width / palette.pixels_per_macropixel(),
                        op_height,
                        &self.limits,
                    );
                    let mut frame = FrameBuffer::new(palette, width, height, alignment(&template));
                    bind_frame(channel, &mut frame);
                    set(channel, keys::INPLACE, false);
                    Output::Video(track, frame)
                }
            };
            needs_reinit |= before.requires_reinit(&ChannelShape::of(channel), template.flags());
            outputs.push(output);
        }

        let mut mask_outputs: Vec<(usize, FrameBuffer)> = Vec::new();
        for (idx, channel) in instance.out_channels().iter().enumerate() {
            let Some(template) = alpha_template(class, channel) else {
                continue;
            };
            if is_disabled(channel) {
                continue;
            }
            let palette = class
                .palettes_for(&template)
                .first()
                .copied()
                .ok_or(FilterError::TemplateMismatch)?;
            let (width, height) = validate_channel_sizes(
                class,
                &template,
                op_width / palette.pixels_per_macropixel(),
                op_height,
                &self.limits,
            );
            let before = ChannelShape::of(channel);
            let mut mask = FrameBuffer::new(palette, width, height, alignment(&template));
            bind_frame(channel, &mut mask);
            set(channel, keys::TIMECODE, timecode);
            set(channel, keys::INPLACE, false);
            needs_reinit |= before.requires_reinit(&ChannelShape::of(channel), template.flags());
            mask_outputs.push((idx, mask));
        }

        let status = if needs_reinit {
            instance.reinit()?
        } else {
            FilterStatus::Success
        };
        set(instance.plant(), keys::FPS, self.fps);
        let status = self.run(instance, timecode, if threaded { self.threads } else { 1 }, status)?;

        for output in outputs {
            if let Output::Video(track, frame) = output {
                layers[track].set_frame(frame);
            }
        }
        if let Some(router) = self.alpha {
            for (idx, mask) in mask_outputs {
                router.push_alpha(instance, idx, mask);
            }
        }
        drop(masks);
        drop(temp);
        Ok(status)
    }

    fn conform(&self, layer: &mut Layer, palette: Palette, width: usize, height: usize) -> Result<(), FilterError> {
        let frame = layer.frame().ok_or(FilterError::InvalidLayer)?;
        let converted = if frame.palette() != palette {
            Some(
                self.converter
                    .convert(frame, palette)
                    .ok_or(FilterError::InvalidLayer)?,
            )
        } else {
            None
        };
        let current = converted.as_ref().unwrap_or(frame);
        let resized = if (current.width(), current.height()) != (width, height) {
            Some(
                self.converter
                    .resize(current, width, height)
                    .ok_or(FilterError::InvalidLayer)?,
            )
        } else {
            None
        };
        if let Some(frame) = resized.or(converted) {
            layer.set_frame(frame);
        }
        Ok(())
    }

    /// Run `instance` over audio `layers`, checking rates and channel
    /// counts against the filter.
    pub fn apply_audio(
        &self,
        instance: &Instance,
        layers: &mut [Layer],
        tracks: Option<&TrackMap>,
        timecode: i64,
    ) -> FilterResult {
        let in_channels: Vec<PlantHandle> = instance
            .in_channels()
            .into_iter()
            .filter(is_audio)
            .collect();
        if in_channels.is_empty() || in_channels.iter().all(is_disabled) {
            return Err(FilterError::MissingChannel);
        }
        if let Some(status) = self.skip_if_easing(instance) {
            return status;
        }
        let default_tracks;
        let tracks = match tracks {
            Some(tracks) => tracks,
            None => {
                default_tracks =
                    TrackMap::sequential(in_channels.iter().filter(|c| !is_disabled(c)).count());
                &default_tracks
            }
        };
        with_busy_layers(layers, tracks, |layers| {
            self.apply_audio_inner(instance, &in_channels, layers, tracks, timecode)
        })
    }

    fn apply_audio_inner(
        &self,
        instance: &Instance,
        in_channels: &[PlantHandle],
        layers: &mut [Layer],
        tracks: &TrackMap,
        timecode: i64,
    ) -> FilterResult {
        let class = instance.filter().class();
        let mut temp = TempDisabled::default();
        let num_in_tracks = tracks.in_tracks.len().min(in_channels.len());
        for channel in &in_channels[num_in_tracks..] {
            temp.disable(channel);
        }

        let mut first: Option<usize> = None;
        for (i, &track) in tracks.in_tracks[..num_in_tracks].iter().enumerate() {
            let channel = &in_channels[i];
            if track < 0 {
                return Err(FilterError::InvalidTrack);
            }
            if is_disabled(channel) {
                continue;
            }
            let template = template_of(channel).ok_or(FilterError::InvalidInstance)?;
            let Some(layer) = layers.get(track as usize) else {
                if may_skip(Some(&template)) {
                    temp.disable(channel);
                    continue;
                }
                return Err(FilterError::MissingLayer);
            };
            let Some(audio) = layer.audio() else {
                if layer.has_pixels() {
                    return Err(FilterError::InvalidTrack);
                }
                if may_skip(Some(&template)) {
                    temp.disable(channel);
                    continue;
                }
                return Err(FilterError::BlankFrame);
            };
            check_audio(class, &template, audio)?;
            mirror_leaves(channel, &layer.plant().read(), &AUDIO_KEYS);
            set(channel, keys::TIMECODE, timecode);
            first.get_or_insert(track as usize);
        }

        for template in class.in_channel_templates() {
            if template.is_optional() || !template.is_audio() {
                continue;
            }
            let served = in_channels.iter().any(|channel| {
                !is_disabled(channel)
                    && template_of(channel).is_some_and(|t| t.handle() == template.handle())
            });
            if !served {
                return Err(FilterError::MissingLayer);
            }
        }

        let out_channels: Vec<PlantHandle> = instance
            .out_channels()
            .into_iter()
            .filter(|channel| is_audio(channel) && !is_disabled(channel))
            .collect();
        let mut outputs = Vec::new();
        for (i, &track) in tracks.out_tracks.iter().enumerate() {
            let Some(channel) = out_channels.get(i) else {
                break;
            };
            if track < 0 {
                return Err(FilterError::InvalidTrack);
            }
            let track = track as usize;
            let shape = first
                .and_then(|first| layers[first].audio())
                .map(|audio| (audio.rate(), audio.num_channels(), audio.samples()))
                .ok_or(FilterError::MissingLayer)?;
            if track >= layers.len() {
                return Err(FilterError::MissingLayer);
            }
            let template = template_of(channel).ok_or(FilterError::InvalidInstance)?;
            set(channel, keys::TIMECODE, timecode);
            let inplace = i == 0 && first == Some(track) && template.can_do_inplace();
            if inplace {
                mirror_leaves(channel, &layers[track].plant().read(), &AUDIO_KEYS);
                set(channel, keys::INPLACE, true);
                outputs.push(Output::InPlace);
            } else {
                let (rate, channels, samples) = shape;
                let mut audio = AudioBuffer::new(rate, channels, samples);
                bind_audio(channel, &mut audio);
                set(channel, keys::INPLACE, false);
                outputs.push(Output::Audio(track, audio));
            }
        }

        set(instance.plant(), keys::FPS, self.fps);
        let status = self.run(instance, timecode, 1, FilterStatus::Success)?;
        for output in outputs {
            if let Output::Audio(track, audio) = output {
                layers[track].set_audio(audio);
            }
        }
        drop(temp);
        Ok(status)
    }

    /// Render one frame of a generator into a new layer, sized by the
    /// `width` and `height` leaves of its first output channel.
    pub fn run_generator(&self, instance: &Instance, timecode: i64) -> Result<Layer, FilterError> {
        let class = instance.filter().class();
        let channel = instance
            .out_channels()
            .into_iter()
            .find(|channel| is_video(class, channel) && !is_disabled(channel))
            .ok_or(FilterError::MissingChannel)?;
        let template = template_of(&channel).ok_or(FilterError::InvalidInstance)?;
        let palette = class
            .palettes_for(&template)
            .first()
            .copied()
            .ok_or(FilterError::TemplateMismatch)?;
        let (width, height) = {
            let plant = channel.read();
            (
                plant.int_or(keys::WIDTH, 0).max(0) as usize,
                plant.int_or(keys::HEIGHT, 0).max(0) as usize,
            )
        };
        let (width, height) = validate_channel_sizes(class, &template, width, height, &self.limits);
        let mut frame = FrameBuffer::new(palette, width, height, alignment(&template));
        bind_frame(&channel, &mut frame);
        set(&channel, keys::TIMECODE, timecode);
        let threads = if class.may_thread() { self.threads } else { 1 };
        self.run(instance, timecode, threads, FilterStatus::Success)?;
        Ok(Layer::from_frame(frame))
    }

    /// Call the plugin, reiniting and retrying once when it asks for it.
    fn run(&self, instance: &Instance, timecode: i64, threads: usize, status: FilterStatus) -> FilterResult {
        match pipeline::process(instance, timecode, threads) {
            PluginCode::Success => Ok(status),
            PluginCode::ReinitNeeded => {
                tracing::debug!(filter = instance.filter().hashname(), "plugin asked for reinit");
                let retried = instance
                    .reinit()
                    .map(|_| pipeline::process(instance, timecode, threads));
                match retried {
                    Ok(PluginCode::Success) => Ok(FilterStatus::InfoReinited),
                    Ok(PluginCode::PluginInvalid) => Err(FilterError::InvalidPlugin),
                    Ok(PluginCode::ReinitNeeded) | Err(_) => {
                        if let Err(err) = instance.deinit() {
                            tracing::debug!(?err, "deinit after failed reinit");
                        }
                        Err(FilterError::CouldNotReinit)
                    }
                    Ok(code) => code.into_result().map(|()| FilterStatus::InfoReinited),
                }
            }
            code => code.into_result().map(|()| status),
        }
    }
}

fn alignment(template: &ChannelTemplate) -> usize {
    template
        .int(keys::ALIGNMENT)
        .and_then(positive)
        .unwrap_or(DEFAULT_ALIGNMENT)
}

fn check_audio(class: &FilterClass, template: &ChannelTemplate, audio: &AudioBuffer) -> Result<(), FilterError> {
    let rate = template
        .int(keys::AUDIO_RATE)
        .or_else(|| class.handle().read().get_int(keys::AUDIO_RATE).ok());
    if rate.is_some_and(|rate| rate != audio.rate())
        && !class.has_flag(flags::FILTER_AUDIO_RATES_MAY_VARY)
    {
        return Err(FilterError::TemplateMismatch);
    }
    let max_channels = template.int(keys::MAX_AUDIO_CHANNELS).and_then(positive);
    if max_channels.is_some_and(|max| audio.num_channels() > max) {
        return Err(FilterError::TemplateMismatch);
    }
    Ok(())
}

/// Mark every layer a track names busy while `f` runs, then ready (or
/// invalid on failure). Layers without data get their old status back.
fn with_busy_layers(
    layers: &mut [Layer],
    tracks: &TrackMap,
    f: impl FnOnce(&mut [Layer]) -> FilterResult,
) -> FilterResult {
    let mut used: Vec<usize> = tracks
        .in_tracks
        .iter()
        .chain(&tracks.out_tracks)
        .filter_map(|&track| usize::try_from(track).ok())
        .filter(|&track| track < layers.len())
        .collect();
    used.sort_unstable();
    used.dedup();
    let previous: Vec<LayerStatus> = used.iter().map(|&idx| layers[idx].begin_use()).collect();

    let result = f(layers);

    for (&idx, status) in used.iter().zip(previous) {
        let layer = &layers[idx];
        if layer.is_blank() {
            layer.set_status(status);
        } else {
            layer.end_use(result.is_ok());
        }
    }
    if let Err(err) = &result {
        tracing::debug!(?err, "effect skipped for this frame");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::convert::BasicConverter;
    use crate::instance::LiveCounter;
    use crate::callbacks::FilterCallbacks;
    use crate::connect::{AlphaConnections, ParamLink};
    use crate::registry::{FilterRegistry, RegisterError};
    use crate::testing::{
        add_flags, audio_template, optional, param_template, video_template, FakeCallbacks,
        FakeEffect, FilterBuilder,
    };

    fn instance_of(builder: FilterBuilder, callbacks: Arc<FakeCallbacks>) -> Instance {
        let instance = Instance::create(&builder.register(callbacks), &LiveCounter::default()).unwrap();
        instance.init().unwrap();
        instance
    }

    fn rgb_layer(width: usize, height: usize, byte: u8) -> Layer {
        let mut frame = FrameBuffer::new(Palette::Rgb24, width, height, 1);
        frame.fill(byte);
        Layer::from_frame(frame)
    }

    fn template_with(key: &str, value: impl Into<LeafValue>) -> (FilterClass, ChannelTemplate) {
        let out = video_template("out", &[Palette::Rgb24]);
        out.set(key, value).unwrap();
        let class = FilterBuilder::generator("gen").output(out.clone()).build_class();
        (class, ChannelTemplate::new(out))
    }

    #[test]
    fn sizes_are_clamped_and_made_even() {
        let (class, template) = template_with(keys::MAXWIDTH, 100);
        let limits = SizeLimits::default();
        assert_eq!(validate_channel_sizes(&class, &template, 1, 1, &limits), (4, 4));
        assert_eq!(validate_channel_sizes(&class, &template, 333, 333, &limits), (100, 332));
        assert_eq!(validate_channel_sizes(&class, &template, 9000, 9000, &limits), (100, 8192));
    }

    #[test]
    fn sizes_follow_steps() {
        let (class, template) = template_with(keys::HSTEP, 3);
        template.handle().set(keys::VSTEP, 8).unwrap();
        let limits = SizeLimits::default();
        assert_eq!(validate_channel_sizes(&class, &template, 20, 20, &limits), (18, 16));
    }

    #[test]
    fn fixed_sizes_snap_to_the_next_listed_value() {
        let (class, template) = template_with(keys::FIXED_WIDTHS, vec![320, 640, 160]);
        let limits = SizeLimits::default();
        assert_eq!(validate_channel_sizes(&class, &template, 300, 240, &limits).0, 320);
        assert_eq!(validate_channel_sizes(&class, &template, 700, 240, &limits).0, 640);

        template.handle().set(keys::FIXED_HEIGHTS, vec![240, 480, 120]).unwrap();
        assert_eq!(
            validate_channel_sizes(&class, &template, 300, 300, &limits),
            (640, 480)
        );
        assert_eq!(
            validate_channel_sizes(&class, &template, 100, 100, &limits),
            (160, 120)
        );
    }

    proptest! {
        #[test]
        fn size_validation_is_idempotent(
            width in 0usize..10_000,
            height in 0usize..10_000,
            hstep in 0i32..12,
            maxwidth in 0i32..600,
            minheight in 0i32..40,
        ) {
            let (class, template) = template_with(keys::HSTEP, hstep);
            template.handle().set(keys::MAXWIDTH, maxwidth).unwrap();
            template.handle().set(keys::MINHEIGHT, minheight).unwrap();
            let limits = SizeLimits::default();
            let once = validate_channel_sizes(&class, &template, width, height, &limits);
            let twice = validate_channel_sizes(&class, &template, once.0, once.1, &limits);
            prop_assert_eq!(once, twice);
        }
    }

    #[test]
    fn missing_track_for_a_mandatory_input() {
        let instance = instance_of(FilterBuilder::new("blur"), Arc::new(FakeCallbacks::default()));
        let converter = BasicConverter;
        let negotiator = Negotiator::new(&converter);
        let mut layers: Vec<Layer> = Vec::new();
        assert_eq!(
            negotiator.apply(&instance, &mut layers, None, None, 0),
            Err(FilterError::MissingLayer)
        );
        let tracks = TrackMap::new(vec![-1], vec![0]);
        let mut layers = vec![rgb_layer(8, 8, 0)];
        assert_eq!(
            negotiator.apply(&instance, &mut layers, Some(&tracks), None, 0),
            Err(FilterError::InvalidTrack)
        );
    }

    #[test]
    fn blank_frame_on_a_mandatory_input() {
        let instance = instance_of(FilterBuilder::new("blur"), Arc::new(FakeCallbacks::default()));
        let converter = BasicConverter;
        let negotiator = Negotiator::new(&converter);
        let mut layers = vec![Layer::blank(1)];
        assert_eq!(
            negotiator.apply(&instance, &mut layers, None, None, 0),
            Err(FilterError::BlankFrame)
        );
        assert_eq!(layers[0].status(), LayerStatus::Invalid);
    }

    #[test]
    fn output_replaces_the_layer() {
        let callbacks = Arc::new(FakeCallbacks::new(FakeEffect::Invert));
        let instance = instance_of(FilterBuilder::new("invert"), callbacks.clone());
        let converter = BasicConverter;
        let negotiator = Negotiator::new(&converter);
        let mut layers = vec![rgb_layer(8, 6, 10)];
        assert_eq!(
            negotiator.apply(&instance, &mut layers, None, None, 40),
            Ok(FilterStatus::Success)
        );
        let frame = layers[0].frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (8, 6));
        assert_eq!(frame.rowstrides(), &[32]);
        assert!(frame.row(0, 5).iter().all(|&b| b == 245));
        assert_eq!(layers[0].status(), LayerStatus::Ready);
        assert_eq!(FakeCallbacks::count(&callbacks.processed), 1);
        let out = instance.out_channels()[0].clone();
        assert_eq!(out.read().get_int64(keys::TIMECODE), Ok(40));
        assert!(!out.bool_or(keys::INPLACE, true));
    }

    #[test]
    fn inplace_output_aliases_the_input() {
        let out = video_template("out", &[Palette::Rgb24]);
        add_flags(&out, flags::CHANNEL_CAN_DO_INPLACE);
        let callbacks = Arc::new(FakeCallbacks::new(FakeEffect::Invert));
        let instance = instance_of(FilterBuilder::new("invert").output(out), callbacks);
        let converter = BasicConverter;
        let negotiator = Negotiator::new(&converter);
        let mut layers = vec![rgb_layer(8, 4, 0)];
        let before = layers[0].plant().read().get_voidptr(keys::PIXEL_DATA).unwrap();
        negotiator.apply(&instance, &mut layers, None, None, 0).unwrap();
        let after = layers[0].plant().read().get_voidptr(keys::PIXEL_DATA).unwrap();
        assert_eq!(before, after);
        assert!(layers[0].frame().unwrap().row(0, 3).iter().all(|&b| b == 255));
        assert!(instance.out_channels()[0].bool_or(keys::INPLACE, false));
    }

    #[test]
    fn layers_are_repacked_and_resized_to_fit() {
        let input = video_template("in", &[Palette::Bgra32]);
        let out = video_template("out", &[Palette::Bgra32]);
        let callbacks = Arc::new(FakeCallbacks::new(FakeEffect::Copy));
        let instance = instance_of(
            FilterBuilder::new("copy").input(input).output(out),
            callbacks,
        );
        let converter = BasicConverter;
        let negotiator = Negotiator::new(&converter);
        let mut layers = vec![rgb_layer(7, 5, 9)];
        negotiator.apply(&instance, &mut layers, None, None, 0).unwrap();
        let frame = layers[0].frame().unwrap();
        assert_eq!(frame.palette(), Palette::Bgra32);
        assert_eq!((frame.width(), frame.height()), (6, 4));
        assert_eq!(&frame.row(0, 0)[..4], &[9, 9, 9, 255]);
    }

    #[test]
    fn optional_inputs_are_disabled_for_the_call_only() {
        let second = optional(video_template("overlay", &[Palette::Rgb24]));
        let callbacks = Arc::new(FakeCallbacks::new(FakeEffect::Copy));
        let builder = FilterBuilder::new("mix")
            .input(video_template("in", &[Palette::Rgb24]))
            .input(second);
        let instance = instance_of(builder, callbacks);
        let overlay = instance.in_channels()[1].clone();
        overlay.set(keys::DISABLED, false).unwrap();
        let converter = BasicConverter;
        let negotiator = Negotiator::new(&converter);
        let tracks = TrackMap::new(vec![0, 1], vec![0]);
        let mut layers = vec![rgb_layer(8, 8, 1), Layer::blank(2)];
        assert_eq!(
            negotiator.apply(&instance, &mut layers, Some(&tracks), None, 0),
            Ok(FilterStatus::Success)
        );
        assert!(!overlay.bool_or(keys::DISABLED, true));
        assert!(!overlay.bool_or(keys::TEMP_DISABLED, true));
        assert_eq!(layers[1].status(), LayerStatus::Invalid);
    }

    #[test]
    fn audio_filters_are_refused_on_video() {
        let builder = FilterBuilder::bare("gain")
            .input(audio_template("in"))
            .output(audio_template("out"));
        let instance = instance_of(builder, Arc::new(FakeCallbacks::new(FakeEffect::Gain(0.5))));
        let converter = BasicConverter;
        let negotiator = Negotiator::new(&converter);
        let mut layers = vec![rgb_layer(8, 8, 1)];
        assert_eq!(
            negotiator.apply(&instance, &mut layers, None, None, 0),
            Err(FilterError::IsAudio)
        );
    }

    #[test]
    fn audio_gain_and_rate_checks() {
        let builder = FilterBuilder::bare("gain")
            .input(audio_template("in"))
            .output(audio_template("out"));
        let callbacks = Arc::new(FakeCallbacks::new(FakeEffect::Gain(0.5)));
        let instance = instance_of(builder, callbacks);
        instance
            .filter()
            .class()
            .handle()
            .write()
            .force_set(keys::AUDIO_RATE, 48_000)
            .unwrap();
        let converter = BasicConverter;
        let negotiator = Negotiator::new(&converter);

        let samples = vec![vec![1.0f32; 64], vec![-2.0f32; 64]];
        let mut layers = vec![Layer::from_audio(AudioBuffer::from_channels(48_000, samples))];
        assert_eq!(
            negotiator.apply_audio(&instance, &mut layers, None, 0),
            Ok(FilterStatus::Success)
        );
        let audio = layers[0].audio().unwrap();
        assert_eq!(audio.channel(0)[10], 0.5);
        assert_eq!(audio.channel(1)[63], -1.0);

        let mut layers = vec![Layer::from_audio(AudioBuffer::new(44_100, 2, 64))];
        assert_eq!(
            negotiator.apply_audio(&instance, &mut layers, None, 0),
            Err(FilterError::TemplateMismatch)
        );
    }

    #[test]
    fn reinit_request_is_retried_once() {
        let callbacks = Arc::new(FakeCallbacks::new(FakeEffect::Fill(3)).requesting_reinit(1));
        let instance = instance_of(FilterBuilder::new("fill"), callbacks.clone());
        let converter = BasicConverter;
        let negotiator = Negotiator::new(&converter);
        let mut layers = vec![rgb_layer(8, 8, 0)];
        assert_eq!(
            negotiator.apply(&instance, &mut layers, None, None, 0),
            Ok(FilterStatus::InfoReinited)
        );
        assert_eq!(FakeCallbacks::count(&callbacks.inits), 2);
        assert!(layers[0].frame().unwrap().row(0, 0).iter().all(|&b| b == 3));
    }

    #[test]
    fn repeated_reinit_requests_tear_the_instance_down() {
        let callbacks = Arc::new(FakeCallbacks::new(FakeEffect::Nothing).requesting_reinit(2));
        let instance = instance_of(FilterBuilder::new("flaky"), callbacks);
        let converter = BasicConverter;
        let negotiator = Negotiator::new(&converter);
        let mut layers = vec![rgb_layer(8, 8, 0)];
        assert_eq!(
            negotiator.apply(&instance, &mut layers, None, None, 0),
            Err(FilterError::CouldNotReinit)
        );
        assert!(!instance.is_inited());
    }

    #[test]
    fn invalid_plugin_is_reported() {
        let callbacks = Arc::new(FakeCallbacks::default());
        callbacks.set_process_error(Some(PluginCode::PluginInvalid));
        let instance = instance_of(FilterBuilder::new("gone"), callbacks);
        let converter = BasicConverter;
        let negotiator = Negotiator::new(&converter);
        let mut layers = vec![rgb_layer(8, 8, 0)];
        assert_eq!(
            negotiator.apply(&instance, &mut layers, None, None, 0),
            Err(FilterError::InvalidPlugin)
        );
    }

    #[test]
    fn scrap_clip_is_refused_for_plain_filters() {
        let instance = instance_of(FilterBuilder::new("blur"), Arc::new(FakeCallbacks::default()));
        let converter = BasicConverter;
        let negotiator = Negotiator {
            scrap_clip: Some(5),
            ..Negotiator::new(&converter)
        };
        let scrap = rgb_layer(8, 8, 0);
        scrap.plant().write().force_set(keys::CLIP, 5).unwrap();
        let mut layers = vec![scrap];
        assert_eq!(
            negotiator.apply(&instance, &mut layers, None, None, 0),
            Err(FilterError::IsScrapFile)
        );
    }

    #[test]
    fn easing_instances_pass_frames_through() {
        let callbacks = Arc::new(FakeCallbacks::new(FakeEffect::Fill(1)));
        let instance = instance_of(FilterBuilder::new("fade"), callbacks.clone());
        instance.ease_out(2);
        let converter = BasicConverter;
        let negotiator = Negotiator::new(&converter);
        let mut layers = vec![rgb_layer(8, 8, 0)];
        negotiator.apply(&instance, &mut layers, None, None, 0).unwrap();
        assert!(instance.is_inited());
        negotiator.apply(&instance, &mut layers, None, None, 0).unwrap();
        assert!(!instance.is_inited());
        assert_eq!(FakeCallbacks::count(&callbacks.processed), 0);
        assert!(layers[0].frame().unwrap().row(0, 0).iter().all(|&b| b == 0));
    }

    #[test]
    fn compound_parts_run_in_sequence() {
        let invert = Arc::new(FakeCallbacks::new(FakeEffect::Invert));
        let mut registry = crate::registry::FilterRegistry::default();
        let idx = registry
            .register("fx.so", FilterBuilder::new("invert").build_class(), invert.clone())
            .unwrap();
        let part = registry.get(idx).unwrap().hashname().to_string();
        let idx = registry.register_compound("twice", "tester", &[&part, &part]).unwrap();
        let compound = registry.get(idx).unwrap().clone();
        let instance = Instance::create(&compound, &LiveCounter::default()).unwrap();
        instance.init().unwrap();

        let converter = BasicConverter;
        let negotiator = Negotiator::new(&converter);
        let mut layers = vec![rgb_layer(8, 8, 10)];
        assert_eq!(
            negotiator.apply(&instance, &mut layers, None, None, 0),
            Ok(FilterStatus::Success)
        );
        assert_eq!(FakeCallbacks::count(&invert.processed), 2);
        assert!(layers[0].frame().unwrap().row(0, 7).iter().all(|&b| b == 10));
    }

    #[test]
    fn generators_render_into_a_new_layer() {
        let callbacks = Arc::new(FakeCallbacks::new(FakeEffect::Fill(0x40)));
        let instance = instance_of(FilterBuilder::generator("plasma"), callbacks);
        let out = instance.out_channels()[0].clone();
        out.set(keys::WIDTH, 33).unwrap();
        out.set(keys::HEIGHT, 20).unwrap();
        let converter = BasicConverter;
        let negotiator = Negotiator::new(&converter);
        let layer = negotiator.run_generator(&instance, 0).unwrap();
        let frame = layer.frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (32, 20));
        assert!(frame.row(0, 19).iter().all(|&b| b == 0x40));
    }

    /// Reports a fixed level through its first out parameter.
    struct Meter(i32);

    impl FilterCallbacks for Meter {
        fn process(&self, instance: &PlantHandle, _timecode: i64) -> PluginCode {
            if let Some(param) = instance.plants(keys::OUT_PARAMETERS).first() {
                param.write().force_set(keys::VALUE, self.0).unwrap();
            }
            PluginCode::Success
        }
    }

    #[test]
    fn linked_parameters_flow_to_later_parts() {
        let mut registry = FilterRegistry::default();
        let meter = FilterBuilder::new("meter")
            .out_param(param_template("level", flags::PARAM_INTEGER, 0))
            .build_class();
        registry.register("fx.so", meter, Arc::new(Meter(42))).unwrap();
        let gain = FilterBuilder::new("gain")
            .int_param("level", 0)
            .float_param("mix", 1.0)
            .build_class();
        registry
            .register("fx.so", gain, Arc::new(FakeCallbacks::default()))
            .unwrap();
        let parts = ["fxmetertester1", "fxgaintester1"];

        let backwards = registry.register_compound_linked("back", "tester", &parts, &[ParamLink::new(1, 0, 0, 0)]);
        assert!(matches!(backwards, Err(RegisterError::InvalidLink(_))));
        let mistyped = registry.register_compound_linked("typo", "tester", &parts, &[ParamLink::new(0, 0, 1, 1)]);
        assert!(matches!(mistyped, Err(RegisterError::InvalidLink(_))));
        let missing = registry.register_compound_linked("gone", "tester", &parts, &[ParamLink::new(0, 3, 1, 0)]);
        assert!(matches!(missing, Err(RegisterError::InvalidLink(_))));

        let idx = registry
            .register_compound_linked("metered", "tester", &parts, &[ParamLink::new(0, 0, 1, 0)])
            .unwrap();
        let compound = registry.get(idx).unwrap().clone();
        assert_eq!(compound.param_links(), &[ParamLink::new(0, 0, 1, 0)]);
        let instance = Instance::create(&compound, &LiveCounter::default()).unwrap();
        instance.init().unwrap();
        assert_eq!(instance.param_value(0), Some(LeafValue::from(0)));

        let converter = BasicConverter;
        let negotiator = Negotiator::new(&converter);
        let mut layers = vec![rgb_layer(8, 8, 10)];
        assert_eq!(
            negotiator.apply(&instance, &mut layers, None, None, 0),
            Ok(FilterStatus::Success)
        );
        let gain = instance.chain().nth(1).unwrap();
        assert_eq!(gain.param_value(0), Some(LeafValue::from(42)));
        assert_eq!(instance.param_value(0), Some(LeafValue::from(42)));
        assert_eq!(gain.param_value(1), Some(LeafValue::from(1.0)));
    }

    /// Fills every A8 output with a byte and records the first byte of
    /// every A8 input.
    struct Masking {
        fill: u8,
        seen: parking_lot::Mutex<Vec<u8>>,
    }

    impl Masking {
        fn new(fill: u8) -> Arc<Self> {
            Arc::new(Self {
                fill,
                seen: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    fn mask_plane(channel: &PlantHandle) -> Option<(*mut u8, usize)> {
        let plant = channel.read();
        if plant.get_int(keys::CURRENT_PALETTE).ok()? != Palette::A8.code() {
            return None;
        }
        let data = plant.get_voidptrs(keys::PIXEL_DATA).ok()?.first()?.as_ptr().cast::<u8>();
        let height = plant.get_int(keys::HEIGHT).ok()? as usize;
        let stride = *plant.get_ints(keys::ROWSTRIDES).ok()?.first()? as usize;
        Some((data, height * stride))
    }

    impl FilterCallbacks for Masking {
        fn process(&self, instance: &PlantHandle, _timecode: i64) -> PluginCode {
            for channel in instance.plants(keys::OUT_CHANNELS) {
                if let Some((data, len)) = mask_plane(&channel) {
                    unsafe { std::ptr::write_bytes(data, self.fill, len) };
                }
            }
            for channel in instance.plants(keys::IN_CHANNELS) {
                if let Some((data, _)) = mask_plane(&channel) {
                    self.seen.lock().push(unsafe { *data });
                }
            }
            PluginCode::Success
        }
    }

    fn masked_instance(builder: FilterBuilder, callbacks: Arc<Masking>) -> Instance {
        let instance = Instance::create(&builder.register(callbacks), &LiveCounter::default()).unwrap();
        instance.init().unwrap();
        instance
    }

    #[test]
    fn alpha_outputs_feed_connected_inputs() {
        let source = Masking::new(0x7f);
        let masker = masked_instance(
            FilterBuilder::new("masker")
                .output(video_template("out", &[Palette::Rgb24]))
                .output(video_template("mask", &[Palette::A8])),
            source.clone(),
        );
        let sink = Masking::new(0);
        let keyed = masked_instance(
            FilterBuilder::new("keyed")
                .input(video_template("in", &[Palette::Rgb24]))
                .input(video_template("mask", &[Palette::A8])),
            sink.clone(),
        );

        let converter = BasicConverter;
        let unrouted = Negotiator::new(&converter);
        let mut layers = vec![rgb_layer(8, 8, 1)];
        assert_eq!(
            unrouted.apply(&keyed, &mut layers, None, None, 0),
            Err(FilterError::MissingLayer)
        );

        let links = AlphaConnections::new();
        links.connect(&masker, 1, &keyed, 1).unwrap();
        let negotiator = Negotiator {
            alpha: Some(&links),
            ..Negotiator::new(&converter)
        };
        let mut layers = vec![rgb_layer(8, 8, 1)];
        assert_eq!(
            negotiator.apply(&keyed, &mut layers, None, None, 0),
            Err(FilterError::MissingLayer)
        );

        let mut layers = vec![rgb_layer(8, 8, 1)];
        negotiator.apply(&masker, &mut layers, None, None, 0).unwrap();
        let mask = links.pull_alpha(&keyed, 1).unwrap();
        assert_eq!((mask.palette(), mask.width(), mask.height()), (Palette::A8, 8, 8));
        assert!(mask.row(0, 7).iter().all(|&b| b == 0x7f));

        let mut layers = vec![rgb_layer(8, 8, 1)];
        assert_eq!(
            negotiator.apply(&keyed, &mut layers, None, None, 0),
            Ok(FilterStatus::Success)
        );
        assert_eq!(*sink.seen.lock(), vec![0x7f]);
        assert!(source.seen.lock().is_empty());
    }

    #[test]
    fn unconnected_optional_alpha_is_disabled_for_the_call() {
        let sink = Masking::new(0);
        let keyed = masked_instance(
            FilterBuilder::new("soft")
                .input(video_template("in", &[Palette::Rgb24]))
                .input(optional(video_template("mask", &[Palette::A8]))),
            sink.clone(),
        );
        let converter = BasicConverter;
        let links = AlphaConnections::new();
        let negotiator = Negotiator {
            alpha: Some(&links),
            ..Negotiator::new(&converter)
        };
        let mut layers = vec![rgb_layer(8, 8, 1)];
        assert_eq!(
            negotiator.apply(&keyed, &mut layers, None, None, 0),
            Ok(FilterStatus::Success)
        );
        assert!(sink.seen.lock().is_empty());
        let mask = keyed.in_channels()[1].clone();
        assert!(!mask.bool_or(keys::DISABLED, true));
    }
}
