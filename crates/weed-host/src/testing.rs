//! In-process stand-ins for native plugins, used by the unit tests, the
//! benchmarks and downstream crates that enable the `testing` feature.

use std::ffi::{c_int, c_void, CString};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use weed_plant::{keys, LeafValue, Palette, Plant, PlantHandle, PlantType, SeedType, VoidPtr};

use crate::abi::{self, BootstrapFn, DefaultGetterFn};
use crate::callbacks::FilterCallbacks;
use crate::filter::FilterClass;
use crate::flags;
use crate::registry::{FilterRegistry, RegisteredFilter};
use crate::PluginCode;

pub const DEFAULT_PALETTES: [Palette; 2] = [Palette::Rgb24, Palette::Rgba32];

fn codes(palettes: &[Palette]) -> Vec<i32> {
    palettes
        .iter()
        .map(|p| p.code())
        .chain(std::iter::once(weed_plant::palette::PALETTE_END))
        .collect()
}

pub fn video_template(name: &str, palettes: &[Palette]) -> PlantHandle {
    let mut plant = Plant::new(PlantType::ChannelTemplate);
    let _ = plant.set(keys::NAME, name);
    let _ = plant.set(keys::FLAGS, 0);
    let _ = plant.set(keys::PALETTE_LIST, codes(palettes));
    PlantHandle::from_plant(plant)
}

pub fn audio_template(name: &str) -> PlantHandle {
    let mut plant = Plant::new(PlantType::ChannelTemplate);
    let _ = plant.set(keys::NAME, name);
    let _ = plant.set(keys::FLAGS, 0);
    let _ = plant.set(keys::IS_AUDIO, true);
    PlantHandle::from_plant(plant)
}

/// Mark a channel template optional.
pub fn optional(template: PlantHandle) -> PlantHandle {
    add_flags(&template, flags::CHANNEL_OPTIONAL);
    template
}

pub fn add_flags(plant: &PlantHandle, bits: i32) {
    let mut plant = plant.write();
    let current = plant.flag_bits();
    let _ = plant.force_set(keys::FLAGS, current | bits);
}

pub fn param_template(name: &str, param_type: i32, default: impl Into<LeafValue>) -> PlantHandle {
    let mut plant = Plant::new(PlantType::ParameterTemplate);
    let _ = plant.set(keys::NAME, name);
    let _ = plant.set(keys::FLAGS, 0);
    let _ = plant.set(keys::PARAM_TYPE, param_type);
    let _ = plant.set(keys::DEFAULT, default);
    PlantHandle::from_plant(plant)
}

unsafe extern "C" fn noop_process(_instance: *mut c_void, _timecode: i64) -> c_int {
    0
}

/// Builds filter class plants the way a plugin would export them.
#[derive(Debug, Clone)]
pub struct FilterBuilder {
    name: String,
    author: String,
    version: i32,
    flags: i32,
    inputs: Option<Vec<PlantHandle>>,
    outputs: Option<Vec<PlantHandle>>,
    params: Vec<PlantHandle>,
    out_params: Vec<PlantHandle>,
}

impl FilterBuilder {
    /// One RGB input, one RGB output unless templates are added.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            author: "tester".to_string(),
            version: 1,
            flags: 0,
            inputs: None,
            outputs: None,
            params: Vec::new(),
            out_params: Vec::new(),
        }
    }

    /// No channel templates at all.
    pub fn bare(name: &str) -> Self {
        Self {
            inputs: Some(Vec::new()),
            outputs: Some(Vec::new()),
            ..Self::new(name)
        }
    }

    /// No inputs, one RGB output.
    pub fn generator(name: &str) -> Self {
        Self {
            inputs: Some(Vec::new()),
            ..Self::new(name)
        }
    }

    pub fn author(mut self, author: &str) -> Self {
        self.author = author.to_string();
        self
    }

    pub fn version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn flags(mut self, flags: i32) -> Self {
        self.flags |= flags;
        self
    }

    pub fn input(mut self, template: PlantHandle) -> Self {
        self.inputs.get_or_insert_with(Vec::new).push(template);
        self
    }

    pub fn output(mut self, template: PlantHandle) -> Self {
        self.outputs.get_or_insert_with(Vec::new).push(template);
        self
    }

    pub fn param(mut self, template: PlantHandle) -> Self {
        self.params.push(template);
        self
    }

    pub fn float_param(self, name: &str, default: f64) -> Self {
        self.param(param_template(name, flags::PARAM_FLOAT, default))
    }

    pub fn out_param(mut self, template: PlantHandle) -> Self {
        self.out_params.push(template);
        self
    }

    pub fn int_param(self, name: &str, default: i32) -> Self {
        self.param(param_template(name, flags::PARAM_INTEGER, default))
    }

    pub fn bool_param(self, name: &str, default: bool) -> Self {
        self.param(param_template(name, flags::PARAM_SWITCH, default))
    }

    pub fn text_param(self, name: &str, default: &str) -> Self {
        self.param(param_template(name, flags::PARAM_TEXT, default))
    }

    pub fn color_param(self, name: &str, default: [f64; 3]) -> Self {
        self.param(param_template(name, flags::PARAM_COLOR, default.to_vec()))
    }

    pub fn build_class(self) -> FilterClass {
        let inputs = self
            .inputs
            .unwrap_or_else(|| vec![video_template("in", &DEFAULT_PALETTES)]);
        let outputs = self
            .outputs
            .unwrap_or_else(|| vec![video_template("out", &DEFAULT_PALETTES)]);
        let mut plant = Plant::new(PlantType::FilterClass);
        let _ = plant.set(keys::NAME, self.name.as_str());
        let _ = plant.set(keys::AUTHOR, self.author.as_str());
        let _ = plant.set(keys::VERSION, self.version);
        let _ = plant.set(keys::FLAGS, self.flags);
        let _ = plant.set(
            keys::PROCESS_FUNC,
            LeafValue::FuncPtr(vec![VoidPtr::from_addr(noop_process as usize)]),
        );
        if !inputs.is_empty() {
            let _ = plant.set(keys::IN_CHANNEL_TEMPLATES, inputs);
        }
        if !outputs.is_empty() {
            let _ = plant.set(keys::OUT_CHANNEL_TEMPLATES, outputs);
        }
        if !self.params.is_empty() {
            let _ = plant.set(keys::IN_PARAMETER_TEMPLATES, self.params);
        }
        if !self.out_params.is_empty() {
            let _ = plant.set(keys::OUT_PARAMETER_TEMPLATES, self.out_params);
        }
        FilterClass::new(PlantHandle::from_plant(plant))
    }

    /// Register through a scratch registry and return the entry.
    pub fn register(self, callbacks: Arc<dyn FilterCallbacks>) -> Arc<RegisteredFilter> {
        let mut registry = FilterRegistry::default();
        let class = self.build_class();
        let idx = registry
            .register("test.so", class, callbacks)
            .expect("test filter must validate");
        registry.get(idx).cloned().expect("just registered")
    }
}

/// What a [`FakeCallbacks`] does to its channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FakeEffect {
    Nothing,
    /// Copy input 0 to output 0.
    Copy,
    /// Write `255 - input` into output 0.
    Invert,
    /// Fill output 0 with a byte.
    Fill(u8),
    /// Scale audio input 0 into audio output 0.
    Gain(f32),
}

/// A filter implemented in Rust that counts its calls.
#[derive(Debug)]
pub struct FakeCallbacks {
    effect: FakeEffect,
    fail_init: bool,
    stateful: bool,
    reinit_requests: AtomicUsize,
    process_error: Mutex<Option<PluginCode>>,
    pub inits: AtomicUsize,
    pub deinits: AtomicUsize,
    pub processed: AtomicUsize,
    pub state_updates: AtomicUsize,
}

impl Default for FakeCallbacks {
    fn default() -> Self {
        Self::new(FakeEffect::Nothing)
    }
}

impl FakeCallbacks {
    pub fn new(effect: FakeEffect) -> Self {
        Self {
            effect,
            fail_init: false,
            stateful: false,
            reinit_requests: AtomicUsize::new(0),
            process_error: Mutex::new(None),
            inits: AtomicUsize::new(0),
            deinits: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            state_updates: AtomicUsize::new(0),
        }
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Update shared state once per frame, honouring `state_updated`.
    pub fn stateful(mut self) -> Self {
        self.stateful = true;
        self
    }

    /// Ask for a reinit on the next `count` process calls.
    pub fn requesting_reinit(self, count: usize) -> Self {
        self.reinit_requests.store(count, Ordering::SeqCst);
        self
    }

    /// Make every process call return `code`, or succeed again with `None`.
    pub fn set_process_error(&self, code: Option<PluginCode>) {
        *self.process_error.lock() = code;
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

struct ChannelView {
    data: *mut u8,
    width_bytes: usize,
    height: usize,
    rowstride: usize,
    offset: usize,
}

fn channel_view(channel: &PlantHandle) -> Option<ChannelView> {
    let plant = channel.read();
    if plant.is_true(keys::DISABLED) {
        return None;
    }
    let data = plant.get_voidptr(keys::PIXEL_DATA).ok()?;
    let palette = Palette::from_code(plant.get_int(keys::CURRENT_PALETTE).ok()?)?;
    let width = plant.get_int(keys::WIDTH).ok()? as usize;
    Some(ChannelView {
        data: data.as_ptr().cast::<u8>(),
        width_bytes: palette.plane_row_bytes(width, 0),
        height: plant.get_int(keys::HEIGHT).ok()? as usize,
        rowstride: *plant.get_ints(keys::ROWSTRIDES).ok()?.first()? as usize,
        offset: plant.int_or(keys::OFFSET, 0).max(0) as usize,
    })
}

fn audio_view(channel: &PlantHandle) -> Option<(Vec<VoidPtr>, usize)> {
    let plant = channel.read();
    if plant.is_true(keys::DISABLED) {
        return None;
    }
    let data = plant.get_voidptrs(keys::AUDIO_DATA).ok()?.to_vec();
    let len = plant.get_int(keys::AUDIO_DATA_LENGTH).ok()? as usize;
    Some((data, len))
}

impl FakeCallbacks {
    fn apply_effect(&self, instance: &PlantHandle) {
        let ins = instance.plants(keys::IN_CHANNELS);
        let outs = instance.plants(keys::OUT_CHANNELS);
        let Some(out_channel) = outs.first() else {
            return;
        };
        match self.effect {
            FakeEffect::Nothing => {}
            FakeEffect::Fill(byte) => {
                if let Some(out) = channel_view(out_channel) {
                    for y in 0..out.height {
                        unsafe { ptr::write_bytes(out.data.add(y * out.rowstride), byte, out.width_bytes) };
                    }
                }
            }
            FakeEffect::Copy | FakeEffect::Invert => {
                let (Some(out), Some(input)) = (
                    channel_view(out_channel),
                    ins.first().and_then(channel_view),
                ) else {
                    return;
                };
                let len = out.width_bytes.min(input.width_bytes);
                for y in 0..out.height {
                    let src = unsafe { input.data.add((out.offset + y) * input.rowstride) };
                    let dst = unsafe { out.data.add(y * out.rowstride) };
                    for x in 0..len {
                        unsafe {
                            let value = *src.add(x);
                            *dst.add(x) = if self.effect == FakeEffect::Invert {
                                255 - value
                            } else {
                                value
                            };
                        }
                    }
                }
            }
            FakeEffect::Gain(gain) => {
                let (Some((out, out_len)), Some((input, in_len))) =
                    (audio_view(out_channel), ins.first().and_then(audio_view))
                else {
                    return;
                };
                let samples = out_len.min(in_len);
                for (dst, src) in out.iter().zip(input.iter()) {
                    let dst = dst.as_ptr().cast::<f32>();
                    let src = src.as_ptr().cast::<f32>();
                    for i in 0..samples {
                        unsafe { *dst.add(i) = *src.add(i) * gain };
                    }
                }
            }
        }
    }
}

impl FilterCallbacks for FakeCallbacks {
    fn init(&self, _instance: &PlantHandle) -> PluginCode {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            return PluginCode::MemoryAllocation;
        }
        PluginCode::Success
    }

    fn process(&self, instance: &PlantHandle, _timecode: i64) -> PluginCode {
        self.processed.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = *self.process_error.lock() {
            return code;
        }
        let wants_reinit = self
            .reinit_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if wants_reinit {
            return PluginCode::ReinitNeeded;
        }
        if self.stateful {
            let mut plant = instance.write();
            match plant.get_bool(keys::STATE_UPDATED) {
                Ok(true) => {}
                Ok(false) => {
                    self.state_updates.fetch_add(1, Ordering::SeqCst);
                    let _ = plant.set(keys::STATE_UPDATED, true);
                }
                Err(_) => {
                    self.state_updates.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        self.apply_effect(instance);
        PluginCode::Success
    }

    fn deinit(&self, _instance: &PlantHandle) -> PluginCode {
        self.deinits.fetch_add(1, Ordering::SeqCst);
        PluginCode::Success
    }
}

// A complete plugin driven only through the exported host functions.

fn c_key(key: &str) -> CString {
    CString::new(key).unwrap_or_default()
}

unsafe fn set_ints(plant: *mut c_void, key: &str, values: &[i32]) {
    let key = c_key(key);
    abi::leaf_set(
        plant,
        key.as_ptr(),
        SeedType::Int.code(),
        values.len() as c_int,
        values.as_ptr() as *mut c_void,
    );
}

unsafe fn set_string(plant: *mut c_void, key: &str, value: &str) {
    let key = c_key(key);
    let value = c_key(value);
    let ptrs = [value.as_ptr()];
    abi::leaf_set(
        plant,
        key.as_ptr(),
        SeedType::String.code(),
        1,
        ptrs.as_ptr() as *mut c_void,
    );
}

unsafe fn set_ptrs(plant: *mut c_void, key: &str, seed: SeedType, values: &[*mut c_void]) {
    let key = c_key(key);
    abi::leaf_set(
        plant,
        key.as_ptr(),
        seed.code(),
        values.len() as c_int,
        values.as_ptr() as *mut c_void,
    );
}

unsafe fn get<T: Default>(plant: *mut c_void, key: &str, idx: c_int) -> Option<T> {
    let key = c_key(key);
    let mut value = T::default();
    let code = abi::leaf_get(plant, key.as_ptr(), idx, (&mut value as *mut T).cast::<c_void>());
    (code == 0).then_some(value)
}

unsafe fn get_ptr(plant: *mut c_void, key: &str) -> *mut c_void {
    let key = c_key(key);
    let mut value: *mut c_void = ptr::null_mut();
    abi::leaf_get(plant, key.as_ptr(), 0, (&mut value as *mut *mut c_void).cast::<c_void>());
    value
}

/// Fills every row of its output with `0x80`.
unsafe extern "C" fn builtin_fill_process(instance: *mut c_void, _timecode: i64) -> c_int {
    let channel = get_ptr(instance, keys::OUT_CHANNELS);
    if channel.is_null() {
        return PluginCode::FilterInvalid.code();
    }
    let data = get_ptr(channel, keys::PIXEL_DATA).cast::<u8>();
    let height: Option<i32> = get(channel, keys::HEIGHT, 0);
    let rowstride: Option<i32> = get(channel, keys::ROWSTRIDES, 0);
    let (Some(height), Some(rowstride)) = (height, rowstride) else {
        return PluginCode::FilterInvalid.code();
    };
    if !data.is_null() {
        ptr::write_bytes(data, 0x80, (height * rowstride) as usize);
    }
    0
}

/// `weed_setup` of a one-filter generator plugin.
///
/// # Safety
/// `bootstrap` must be the host bootstrap.
pub unsafe extern "C" fn builtin_setup(bootstrap: BootstrapFn) -> *mut c_void {
    let mut getter: Option<DefaultGetterFn> = None;
    let host_info = bootstrap(&mut getter, 100, 200, 100, 200);
    if host_info.is_null() || getter.is_none() {
        return ptr::null_mut();
    }
    let info = abi::plant_new(PlantType::PluginInfo.code());
    let filter = abi::plant_new(PlantType::FilterClass.code());
    let out = abi::plant_new(PlantType::ChannelTemplate.code());

    set_string(out, keys::NAME, "out");
    set_ints(out, keys::FLAGS, &[0]);
    set_ints(out, keys::PALETTE_LIST, &codes(&DEFAULT_PALETTES));

    set_string(filter, keys::NAME, "fill");
    set_string(filter, keys::AUTHOR, "builtin");
    set_ints(filter, keys::VERSION, &[1]);
    set_ints(filter, keys::FLAGS, &[flags::FILTER_HINT_MAY_THREAD]);
    set_ptrs(
        filter,
        keys::PROCESS_FUNC,
        SeedType::FuncPtr,
        &[builtin_fill_process as usize as *mut c_void],
    );
    set_ptrs(filter, keys::OUT_CHANNEL_TEMPLATES, SeedType::PlantPtr, &[out]);

    set_ptrs(info, keys::HOST_INFO, SeedType::PlantPtr, &[host_info]);
    set_ints(info, keys::VERSION, &[1]);
    set_ptrs(info, keys::FILTERS, SeedType::PlantPtr, &[filter]);
    info
}

/// `weed_setup` that never answers.
///
/// # Safety
/// Always safe to call.
pub unsafe extern "C" fn empty_setup(_bootstrap: BootstrapFn) -> *mut c_void {
    ptr::null_mut()
}
