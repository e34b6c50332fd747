//! Live filter instances and their init/deinit state machine.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use weed_plant::{keys, LeafValue, Plant, PlantHandle, PlantType, SeedType};

use crate::filter::{ChannelTemplate, ParamTemplate};
use crate::flags;
use crate::registry::RegisteredFilter;
use crate::{FilterError, FilterResult, FilterStatus, PluginCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    Inited,
    Deinited,
}

/// Counts live instances against a ceiling.
#[derive(Debug, Clone)]
pub struct LiveCounter {
    count: Arc<AtomicUsize>,
    limit: usize,
}

impl LiveCounter {
    pub fn new(limit: usize) -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn try_acquire(&self) -> bool {
        self.count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for LiveCounter {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct InstanceInner {
    id: u64,
    plant: PlantHandle,
    filter: Arc<RegisteredFilter>,
    state: Mutex<LifecycleState>,
    easing_out: AtomicBool,
    state_updates: AtomicBool,
    chain: Vec<Instance>,
    counter: LiveCounter,
}

/// A reference to a live filter instance.
///
/// Cloning takes a reference and dropping releases it; the plugin state is
/// torn down when the last reference goes.
#[derive(Clone)]
pub struct Instance(Arc<InstanceInner>);

fn empty_value(template: &ParamTemplate) -> LeafValue {
    let seed = match template.param_type() {
        flags::PARAM_FLOAT | flags::PARAM_COLOR => SeedType::Double,
        flags::PARAM_TEXT => SeedType::String,
        flags::PARAM_SWITCH => SeedType::Boolean,
        _ => SeedType::Int,
    };
    LeafValue::empty(seed)
}

fn new_parameter(template: &ParamTemplate) -> PlantHandle {
    let mut plant = Plant::new(PlantType::Parameter);
    let _ = plant.set(keys::TEMPLATE, template.handle().clone());
    let value = template
        .default_value()
        .unwrap_or_else(|| empty_value(template));
    let _ = plant.set(keys::VALUE, value);
    PlantHandle::from_plant(plant)
}

fn new_channels(templates: &[ChannelTemplate]) -> Vec<PlantHandle> {
    let mut channels = Vec::new();
    for template in templates {
        for _ in 0..template.instance_count() {
            let mut plant = Plant::new(PlantType::Channel);
            let _ = plant.set(keys::TEMPLATE, template.handle().clone());
            let _ = plant.set(keys::DISABLED, template.is_host_disabled());
            channels.push(PlantHandle::from_plant(plant));
        }
    }
    channels
}

impl Instance {
    /// Build an uninitialised instance of `filter`, with channels for every
    /// template (repeatable ones up to their maximum) and parameters at
    /// their defaults.
    pub fn create(filter: &Arc<RegisteredFilter>, counter: &LiveCounter) -> Result<Self, FilterError> {
        let chain = filter
            .parts()
            .iter()
            .map(|part| Instance::create(part, counter))
            .collect::<Result<Vec<_>, _>>()?;
        if !counter.try_acquire() {
            tracing::warn!(filter = filter.hashname(), "instance limit reached");
            return Err(FilterError::Busy);
        }

        let class = filter.class();
        let mut plant = Plant::new(PlantType::FilterInstance);
        let _ = plant.set(keys::FILTER_CLASS, class.handle().clone());
        type Plants = Vec<PlantHandle>;
        let (in_channels, out_channels, in_params): (Plants, Plants, Plants) = match (chain.first(), chain.last()) {
            (Some(first), Some(last)) => (
                first.in_channels(),
                last.out_channels(),
                chain.iter().flat_map(Instance::in_params).collect(),
            ),
            _ => (
                new_channels(&class.in_channel_templates()),
                new_channels(&class.out_channel_templates()),
                class.in_param_templates().iter().map(new_parameter).collect(),
            ),
        };
        let out_params: Vec<PlantHandle> = class
            .out_param_templates()
            .iter()
            .map(new_parameter)
            .collect();
        for (key, plants) in [
            (keys::IN_CHANNELS, in_channels),
            (keys::OUT_CHANNELS, out_channels),
            (keys::IN_PARAMETERS, in_params),
            (keys::OUT_PARAMETERS, out_params),
        ] {
            if !plants.is_empty() {
                let _ = plant.set(key, plants);
            }
        }

        Ok(Instance(Arc::new(InstanceInner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            plant: PlantHandle::from_plant(plant),
            filter: Arc::clone(filter),
            state: Mutex::new(LifecycleState::Uninitialized),
            easing_out: AtomicBool::new(false),
            state_updates: AtomicBool::new(true),
            chain,
            counter: counter.clone(),
        })))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn plant(&self) -> &PlantHandle {
        &self.0.plant
    }

    pub fn filter(&self) -> &Arc<RegisteredFilter> {
        &self.0.filter
    }

    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Outstanding references, this one included.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn in_channels(&self) -> Vec<PlantHandle> {
        self.0.plant.plants(keys::IN_CHANNELS)
    }

    pub fn out_channels(&self) -> Vec<PlantHandle> {
        self.0.plant.plants(keys::OUT_CHANNELS)
    }

    pub fn in_params(&self) -> Vec<PlantHandle> {
        self.0.plant.plants(keys::IN_PARAMETERS)
    }

    pub fn out_params(&self) -> Vec<PlantHandle> {
        self.0.plant.plants(keys::OUT_PARAMETERS)
    }

    /// Sub-instances of a compound filter, in processing order.
    pub fn chain(&self) -> impl Iterator<Item = &Instance> {
        self.0.chain.iter()
    }

    pub fn is_compound(&self) -> bool {
        !self.0.chain.is_empty()
    }

    pub fn state(&self) -> LifecycleState {
        *self.0.state.lock()
    }

    pub fn is_inited(&self) -> bool {
        self.state() == LifecycleState::Inited
    }

    /// Run the plugin's init once; further calls while inited do nothing.
    pub fn init(&self) -> Result<(), FilterError> {
        let mut state = self.0.state.lock();
        if *state == LifecycleState::Inited {
            return Ok(());
        }
        self.init_locked(&mut state)
    }

    fn init_locked(&self, state: &mut LifecycleState) -> Result<(), FilterError> {
        let seed: i64 = rand::random();
        let _ = self.0.plant.write().force_set(keys::RANDOM_SEED, seed);

        for (pos, part) in self.0.chain.iter().enumerate() {
            if let Err(err) = part.init() {
                for inited in &self.0.chain[..pos] {
                    let _ = inited.deinit();
                }
                return Err(err);
            }
        }
        let code = self.0.filter.callbacks().init(&self.0.plant);
        if let Err(err) = code.into_result() {
            tracing::debug!(filter = self.0.filter.hashname(), ?code, "filter init failed");
            for part in &self.0.chain {
                let _ = part.deinit();
            }
            return Err(err);
        }
        *state = LifecycleState::Inited;
        self.0.easing_out.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Run the plugin's deinit if inited. Clears any easing-out state.
    pub fn deinit(&self) -> Result<(), FilterError> {
        let mut state = self.0.state.lock();
        self.deinit_locked(&mut state)
    }

    fn deinit_locked(&self, state: &mut LifecycleState) -> Result<(), FilterError> {
        self.0.easing_out.store(false, Ordering::SeqCst);
        if *state != LifecycleState::Inited {
            return Ok(());
        }
        *state = LifecycleState::Deinited;
        let code = self.0.filter.callbacks().deinit(&self.0.plant);
        let mut result = code.into_result();
        for part in &self.0.chain {
            if let Err(err) = part.deinit() {
                result = result.and(Err(err));
            }
        }
        result
    }

    /// Deinit and init again without another caller seeing the state in
    /// between.
    pub fn reinit(&self) -> FilterResult {
        let mut state = self.0.state.lock();
        let _ = self.deinit_locked(&mut state);
        match self.init_locked(&mut state) {
            Ok(()) => Ok(FilterStatus::InfoReinited),
            Err(_) => Err(FilterError::CouldNotReinit),
        }
    }

    /// Keep the instance bound but skip its output for `frames` frames
    /// before it is deinitialised.
    pub fn ease_out(&self, frames: i32) {
        let _ = self.0.plant.write().force_set(keys::EASE_OUT, frames);
        self.0.easing_out.store(true, Ordering::SeqCst);
    }

    pub fn is_easing_out(&self) -> bool {
        self.0.easing_out.load(Ordering::SeqCst)
    }

    /// Count down one eased-out frame and return the frames left.
    pub fn ease_out_tick(&self) -> i32 {
        let mut plant = self.0.plant.write();
        let left = (plant.int_or(keys::EASE_OUT, 0) - 1).max(0);
        let _ = plant.force_set(keys::EASE_OUT, left);
        left
    }

    /// Whether slice 0 of a threaded call may be waited on for its
    /// `state_updated` signal.
    pub fn state_updates_enabled(&self) -> bool {
        self.0.state_updates.load(Ordering::SeqCst)
    }

    pub fn disable_state_updates(&self) {
        self.0.state_updates.store(false, Ordering::SeqCst);
    }

    pub fn process(&self, timecode: i64) -> PluginCode {
        self.0.filter.callbacks().process(&self.0.plant, timecode)
    }

    pub fn param_value(&self, idx: usize) -> Option<LeafValue> {
        let param = self.in_params().into_iter().nth(idx)?;
        let value = param.read().value(keys::VALUE).cloned();
        value
    }

    /// Set an input parameter. Parameters flagged for it trigger a reinit
    /// of an inited instance when the value changes.
    pub fn set_param_value(&self, idx: usize, value: LeafValue) -> FilterResult {
        let param = self
            .in_params()
            .into_iter()
            .nth(idx)
            .ok_or(FilterError::InvalidInstance)?;
        let changed = {
            let mut plant = param.write();
            let changed = plant.value(keys::VALUE) != Some(&value);
            plant
                .force_set(keys::VALUE, value)
                .map_err(|_| FilterError::InvalidInstance)?;
            changed
        };
        let reinit_on_change = param
            .plant(keys::TEMPLATE)
            .map(ParamTemplate::new)
            .is_some_and(|template| template.reinit_on_change());
        if changed && reinit_on_change && self.is_inited() {
            return self.reinit();
        }
        Ok(FilterStatus::Success)
    }
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        if *self.state.get_mut() == LifecycleState::Inited {
            let _ = self.filter.callbacks().deinit(&self.plant);
        }
        self.counter.release();
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.0.id)
            .field("filter", &self.0.filter.hashname())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use weed_plant::Palette;

    use super::*;
    use crate::testing::{add_flags, video_template, FakeCallbacks, FakeEffect, FilterBuilder};
    use crate::registry::FilterRegistry;

    fn fake() -> Arc<FakeCallbacks> {
        Arc::new(FakeCallbacks::new(FakeEffect::Nothing))
    }

    #[test]
    fn init_and_deinit_are_idempotent() {
        let callbacks = fake();
        let filter = FilterBuilder::new("blur").register(callbacks.clone());
        let instance = Instance::create(&filter, &LiveCounter::default()).unwrap();
        assert_eq!(instance.state(), LifecycleState::Uninitialized);
        instance.init().unwrap();
        instance.init().unwrap();
        assert!(instance.plant().has_leaf(keys::RANDOM_SEED));
        instance.deinit().unwrap();
        instance.deinit().unwrap();
        assert_eq!(FakeCallbacks::count(&callbacks.inits), 1);
        assert_eq!(FakeCallbacks::count(&callbacks.deinits), 1);
        assert_eq!(instance.state(), LifecycleState::Deinited);
    }

    #[test]
    fn failed_init_leaves_the_instance_uninited() {
        let callbacks = Arc::new(FakeCallbacks::default().failing_init());
        let filter = FilterBuilder::new("broken").register(callbacks);
        let instance = Instance::create(&filter, &LiveCounter::default()).unwrap();
        assert_eq!(instance.init(), Err(FilterError::MemoryError));
        assert!(!instance.is_inited());
        assert_eq!(instance.reinit(), Err(FilterError::CouldNotReinit));
    }

    #[test]
    fn reinit_runs_both_callbacks() {
        let callbacks = fake();
        let filter = FilterBuilder::new("blur").register(callbacks.clone());
        let instance = Instance::create(&filter, &LiveCounter::default()).unwrap();
        instance.init().unwrap();
        assert_eq!(instance.reinit(), Ok(FilterStatus::InfoReinited));
        assert_eq!(FakeCallbacks::count(&callbacks.inits), 2);
        assert_eq!(FakeCallbacks::count(&callbacks.deinits), 1);
        assert!(instance.is_inited());
    }

    #[test]
    fn last_reference_deinits_and_frees() {
        let callbacks = fake();
        let filter = FilterBuilder::new("blur").register(callbacks.clone());
        let counter = LiveCounter::default();
        let instance = Instance::create(&filter, &counter).unwrap();
        instance.init().unwrap();
        let obtained = instance.clone();
        assert_eq!(instance.refcount(), 2);
        drop(instance);
        assert_eq!(counter.get(), 1);
        assert_eq!(FakeCallbacks::count(&callbacks.deinits), 0);
        drop(obtained);
        assert_eq!(counter.get(), 0);
        assert_eq!(FakeCallbacks::count(&callbacks.deinits), 1);
    }

    #[test]
    fn instance_limit() {
        let filter = FilterBuilder::new("blur").register(fake());
        let counter = LiveCounter::new(1);
        let first = Instance::create(&filter, &counter).unwrap();
        assert_eq!(Instance::create(&filter, &counter).unwrap_err(), FilterError::Busy);
        drop(first);
        assert!(Instance::create(&filter, &counter).is_ok());
    }

    #[test]
    fn channels_follow_templates() {
        let layers = video_template("layers", &[Palette::Rgb24]);
        layers.set(keys::MAX_REPEATS, 3).unwrap();
        let filter = FilterBuilder::new("stack").input(layers).register(fake());
        let instance = Instance::create(&filter, &LiveCounter::default()).unwrap();
        assert_eq!(instance.in_channels().len(), 3);
        assert_eq!(instance.out_channels().len(), 1);
    }

    #[test]
    fn easing_is_cleared_by_deinit() {
        let filter = FilterBuilder::new("fade").register(fake());
        let instance = Instance::create(&filter, &LiveCounter::default()).unwrap();
        instance.init().unwrap();
        instance.ease_out(10);
        assert!(instance.is_easing_out());
        assert!(instance.is_inited());
        instance.deinit().unwrap();
        assert!(!instance.is_easing_out());
    }

    #[test]
    fn reinit_on_parameter_change() {
        let callbacks = fake();
        let builder = FilterBuilder::new("blur").float_param("radius", 1.0);
        let class = builder.build_class();
        let radius = class.in_param_templates()[0].handle().clone();
        add_flags(&radius, flags::PARAM_REINIT_ON_VALUE_CHANGE);
        let mut registry = FilterRegistry::default();
        let idx = registry.register("fx.so", class, callbacks.clone()).unwrap();
        let filter = registry.get(idx).unwrap().clone();

        let instance = Instance::create(&filter, &LiveCounter::default()).unwrap();
        assert_eq!(instance.param_value(0), Some(LeafValue::from(1.0f64)));
        instance.init().unwrap();
        assert_eq!(instance.set_param_value(0, 1.0f64.into()), Ok(FilterStatus::Success));
        assert_eq!(
            instance.set_param_value(0, 2.0f64.into()),
            Ok(FilterStatus::InfoReinited)
        );
        assert_eq!(FakeCallbacks::count(&callbacks.inits), 2);
    }

    #[test]
    fn compound_instances_share_parameters_with_their_parts() {
        let a = fake();
        let b = fake();
        let mut registry = FilterRegistry::default();
        registry
            .register("fx.so", FilterBuilder::new("a").float_param("x", 0.5).build_class(), a.clone())
            .unwrap();
        registry
            .register("fx.so", FilterBuilder::new("b").int_param("y", 3).build_class(), b.clone())
            .unwrap();
        let idx = registry
            .register_compound("ab", "tester", &["fxatester1", "fxbtester1"])
            .unwrap();
        let compound = registry.get(idx).unwrap().clone();
        let counter = LiveCounter::default();
        let instance = Instance::create(&compound, &counter).unwrap();
        assert_eq!(counter.get(), 3);
        assert_eq!(instance.chain().count(), 2);

        instance.set_param_value(1, 7i32.into()).unwrap();
        let part_b = instance.chain().nth(1).unwrap();
        assert_eq!(part_b.param_value(0), Some(LeafValue::from(7i32)));

        instance.init().unwrap();
        assert_eq!(FakeCallbacks::count(&a.inits), 1);
        assert_eq!(FakeCallbacks::count(&b.inits), 1);
        drop(instance);
        assert_eq!(counter.get(), 0);
        assert_eq!(FakeCallbacks::count(&b.deinits), 1);
    }
}
