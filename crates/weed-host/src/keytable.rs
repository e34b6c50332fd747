//! Binding of user and timeline keys to filters.
//!
//! Every key holds an ordered list of filters (its modes), the index of the
//! active mode and, while the key is switched on, the instance of that
//! mode. Each key has its own reentrant lock so a call chain that already
//! holds a key can take it again, and work on different keys never
//! contends.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use thiserror::Error;

use crate::instance::{Instance, LiveCounter};
use crate::registry::{FilterRegistry, RegisteredFilter};
use crate::FilterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Index(usize),
    Next,
    Previous,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key {0} out of range")]
    InvalidKey(usize),
    #[error("no filter matches {0}")]
    NotFound(String),
    #[error("generators and other filters cannot share a key")]
    MixedGenerators,
    #[error("key has no free mode")]
    NoFreeMode,
    #[error("key {key} has no mode {mode}")]
    NoBinding { key: usize, mode: usize },
    #[error(transparent)]
    Instance(#[from] FilterError),
}

#[derive(Default)]
struct KeySlot {
    modes: Vec<Arc<RegisteredFilter>>,
    active_mode: usize,
    instance: Option<Instance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorSlot {
    Foreground,
    Background,
}

pub struct EffectKeyTable {
    slots: Vec<ReentrantMutex<RefCell<KeySlot>>>,
    modes_per_key: usize,
    counter: LiveCounter,
    foreground: Mutex<Option<Instance>>,
    background: Mutex<Option<Instance>>,
}

impl EffectKeyTable {
    pub fn new(keys: usize, modes_per_key: usize, counter: LiveCounter) -> Self {
        Self {
            slots: (0..keys)
                .map(|_| ReentrantMutex::new(RefCell::new(KeySlot::default())))
                .collect(),
            modes_per_key,
            counter,
            foreground: Mutex::new(None),
            background: Mutex::new(None),
        }
    }

    pub fn num_keys(&self) -> usize {
        self.slots.len()
    }

    pub fn modes_per_key(&self) -> usize {
        self.modes_per_key
    }

    pub fn counter(&self) -> &LiveCounter {
        &self.counter
    }

    fn slot(&self, key: usize) -> Result<&ReentrantMutex<RefCell<KeySlot>>, KeyError> {
        self.slots.get(key).ok_or(KeyError::InvalidKey(key))
    }

    /// Bind the filter matching `hashname` to the next free mode of `key`.
    pub fn add_effect_key(
        &self,
        registry: &FilterRegistry,
        key: usize,
        hashname: &str,
        fullname: bool,
    ) -> Result<usize, KeyError> {
        let filter = registry
            .idx_for_hashname(hashname, fullname)
            .and_then(|idx| registry.get(idx))
            .cloned()
            .ok_or_else(|| KeyError::NotFound(hashname.to_string()))?;
        let guard = self.slot(key)?.lock();
        let mut slot = guard.borrow_mut();
        if slot
            .modes
            .first()
            .is_some_and(|bound| bound.is_generator() != filter.is_generator())
        {
            return Err(KeyError::MixedGenerators);
        }
        if slot.modes.len() >= self.modes_per_key {
            return Err(KeyError::NoFreeMode);
        }
        slot.modes.push(filter);
        Ok(slot.modes.len() - 1)
    }

    /// Remove a mode. Higher modes move down by one; an active instance of
    /// the removed mode is deinitialised and released.
    pub fn delete_effect_key(&self, key: usize, mode: usize) -> Result<(), KeyError> {
        let guard = self.slot(key)?.lock();
        let released = {
            let mut slot = guard.borrow_mut();
            if mode >= slot.modes.len() {
                return Err(KeyError::NoBinding { key, mode });
            }
            slot.modes.remove(mode);
            let released = if slot.active_mode == mode {
                slot.instance.take()
            } else {
                None
            };
            if slot.active_mode > mode {
                slot.active_mode -= 1;
            }
            if slot.active_mode >= slot.modes.len() {
                slot.active_mode = slot.modes.len().saturating_sub(1);
            }
            released
        };
        if let Some(instance) = released {
            if let Err(err) = instance.deinit() {
                tracing::debug!(?err, "deinit of a released instance failed");
            }
        }
        Ok(())
    }

    pub fn num_modes(&self, key: usize) -> usize {
        self.slots
            .get(key)
            .map_or(0, |slot| slot.lock().borrow().modes.len())
    }

    pub fn active_mode(&self, key: usize) -> Option<usize> {
        let guard = self.slots.get(key)?.lock();
        let slot = guard.borrow();
        (!slot.modes.is_empty()).then_some(slot.active_mode)
    }

    pub fn bound_filter(&self, key: usize, mode: usize) -> Option<Arc<RegisteredFilter>> {
        let guard = self.slots.get(key)?.lock();
        let filter = guard.borrow().modes.get(mode).cloned();
        filter
    }

    pub fn is_active(&self, key: usize) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| slot.lock().borrow().instance.is_some())
    }

    /// Switch `key` on: instantiate and init the filter of its active mode.
    pub fn activate(&self, key: usize) -> Result<Instance, KeyError> {
        let guard = self.slot(key)?.lock();
        let (filter, existing) = {
            let slot = guard.borrow();
            let filter = slot
                .modes
                .get(slot.active_mode)
                .cloned()
                .ok_or(KeyError::NoBinding {
                    key,
                    mode: slot.active_mode,
                })?;
            (filter, slot.instance.clone())
        };
        if let Some(instance) = existing {
            return Ok(instance);
        }
        let instance = Instance::create(&filter, &self.counter)?;
        instance.init()?;
        guard.borrow_mut().instance = Some(instance.clone());
        Ok(instance)
    }

    /// Switch `key` off, deinitialising its instance. Other references to
    /// the instance stay valid.
    pub fn deactivate(&self, key: usize) -> Result<(), KeyError> {
        let guard = self.slot(key)?.lock();
        let instance = guard.borrow_mut().instance.take();
        if let Some(instance) = instance {
            instance.deinit()?;
        }
        Ok(())
    }

    /// Take a reference to the instance bound to `key`, provided `mode` is
    /// the active one (`None` meaning whichever is active).
    pub fn obtain(&self, key: usize, mode: Option<usize>) -> Option<Instance> {
        let guard = self.slots.get(key)?.lock();
        let slot = guard.borrow();
        if mode.is_some_and(|mode| mode != slot.active_mode) {
            return None;
        }
        slot.instance.clone()
    }

    /// Select the active mode of `key`, wrapping for `Next` and `Previous`.
    /// An active key is re-instantiated with the new mode's filter.
    pub fn set_mode(&self, key: usize, mode: Mode) -> Result<usize, KeyError> {
        let guard = self.slot(key)?.lock();
        let (target, current, was_active) = {
            let slot = guard.borrow();
            let count = slot.modes.len();
            if count == 0 {
                return Err(KeyError::NoBinding { key, mode: 0 });
            }
            let target = match mode {
                Mode::Index(n) if n < count => n,
                Mode::Index(n) => return Err(KeyError::NoBinding { key, mode: n }),
                Mode::Next => (slot.active_mode + 1) % count,
                Mode::Previous => (slot.active_mode + count - 1) % count,
            };
            (target, slot.active_mode, slot.instance.is_some())
        };
        if target == current && was_active {
            return Ok(target);
        }
        if was_active {
            self.deactivate(key)?;
        }
        guard.borrow_mut().active_mode = target;
        if was_active {
            self.activate(key)?;
        }
        Ok(target)
    }

    /// Rebind one mode slot to another filter, restarting the key when that
    /// mode is live.
    pub fn switch_key_mode(
        &self,
        registry: &FilterRegistry,
        key: usize,
        mode: usize,
        hashname: &str,
    ) -> Result<(), KeyError> {
        let filter = registry
            .find(hashname)
            .cloned()
            .ok_or_else(|| KeyError::NotFound(hashname.to_string()))?;
        let guard = self.slot(key)?.lock();
        let restart = {
            let mut slot = guard.borrow_mut();
            if mode >= slot.modes.len() {
                return Err(KeyError::NoBinding { key, mode });
            }
            let mixed = slot
                .modes
                .iter()
                .enumerate()
                .any(|(idx, bound)| idx != mode && bound.is_generator() != filter.is_generator());
            if mixed {
                return Err(KeyError::MixedGenerators);
            }
            slot.modes[mode] = filter;
            slot.active_mode == mode && slot.instance.is_some()
        };
        if restart {
            self.deactivate(key)?;
            self.activate(key)?;
        }
        Ok(())
    }

    /// Deinitialise every active key bound to an ordinary filter.
    pub fn deinit_all(&self) {
        for (key, slot) in self.slots.iter().enumerate() {
            let guard = slot.lock();
            let instance = {
                let mut slot = guard.borrow_mut();
                let ordinary = slot
                    .instance
                    .as_ref()
                    .is_some_and(|instance| !instance.filter().is_generator());
                if ordinary {
                    slot.instance.take()
                } else {
                    None
                }
            };
            if let Some(instance) = instance {
                if let Err(err) = instance.deinit() {
                    tracing::debug!(key, ?err, "deinit failed");
                }
            }
        }
    }

    fn generator_slot(&self, which: GeneratorSlot) -> &Mutex<Option<Instance>> {
        match which {
            GeneratorSlot::Foreground => &self.foreground,
            GeneratorSlot::Background => &self.background,
        }
    }

    pub fn generator(&self, which: GeneratorSlot) -> Option<Instance> {
        self.generator_slot(which).lock().clone()
    }

    /// Put `instance` in a generator slot, returning what was there.
    pub fn set_generator(&self, which: GeneratorSlot, instance: Option<Instance>) -> Option<Instance> {
        std::mem::replace(&mut *self.generator_slot(which).lock(), instance)
    }

    pub fn swap_fg_bg(&self) {
        let mut foreground = self.foreground.lock();
        let mut background = self.background.lock();
        std::mem::swap(&mut *foreground, &mut *background);
    }

    /// Live instances still held by the table.
    pub fn bound_instances(&self) -> usize {
        let keyed = self
            .slots
            .iter()
            .filter(|slot| slot.lock().borrow().instance.is_some())
            .count();
        keyed + usize::from(self.foreground.lock().is_some()) + usize::from(self.background.lock().is_some())
    }

    /// Drop every binding and instance.
    pub fn clear(&self) {
        for slot in &self.slots {
            let guard = slot.lock();
            let old = std::mem::take(&mut *guard.borrow_mut());
            drop(guard);
            if let Some(instance) = old.instance {
                if let Err(err) = instance.deinit() {
                    tracing::debug!(?err, "deinit of a replaced instance failed");
                }
            }
        }
        self.set_generator(GeneratorSlot::Foreground, None);
        self.set_generator(GeneratorSlot::Background, None);
    }
}

impl std::fmt::Debug for EffectKeyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectKeyTable")
            .field("keys", &self.slots.len())
            .field("modes_per_key", &self.modes_per_key)
            .field("live", &self.counter.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{FakeCallbacks, FilterBuilder};

    struct Fixture {
        registry: FilterRegistry,
        callbacks: Arc<FakeCallbacks>,
        table: EffectKeyTable,
    }

    fn fixture() -> Fixture {
        let callbacks = Arc::new(FakeCallbacks::default());
        let mut registry = FilterRegistry::default();
        for name in ["blur", "edge", "glow"] {
            registry
                .register("fx.so", FilterBuilder::new(name).build_class(), callbacks.clone())
                .unwrap();
        }
        registry
            .register("fx.so", FilterBuilder::generator("noise").build_class(), callbacks.clone())
            .unwrap();
        Fixture {
            registry,
            callbacks,
            table: EffectKeyTable::new(4, 3, LiveCounter::default()),
        }
    }

    fn bound_names(table: &EffectKeyTable, key: usize) -> Vec<String> {
        (0..table.num_modes(key))
            .filter_map(|mode| table.bound_filter(key, mode))
            .map(|filter| filter.name())
            .collect()
    }

    #[test]
    fn modes_fill_up_in_order() {
        let fx = fixture();
        assert_eq!(fx.table.add_effect_key(&fx.registry, 1, "fxblur", false), Ok(0));
        assert_eq!(fx.table.add_effect_key(&fx.registry, 1, "fxedge", false), Ok(1));
        assert_eq!(fx.table.add_effect_key(&fx.registry, 1, "fxglowtester1", true), Ok(2));
        assert_eq!(
            fx.table.add_effect_key(&fx.registry, 1, "fxblur", false),
            Err(KeyError::NoFreeMode)
        );
        assert_eq!(
            fx.table.add_effect_key(&fx.registry, 1, "fxglow", true),
            Err(KeyError::NotFound("fxglow".into()))
        );
        assert_eq!(
            fx.table.add_effect_key(&fx.registry, 9, "fxblur", false),
            Err(KeyError::InvalidKey(9))
        );
    }

    #[test]
    fn generators_do_not_mix_with_filters() {
        let fx = fixture();
        fx.table.add_effect_key(&fx.registry, 0, "fxblur", false).unwrap();
        assert_eq!(
            fx.table.add_effect_key(&fx.registry, 0, "fxnoise", false),
            Err(KeyError::MixedGenerators)
        );
        assert_eq!(
            fx.table.switch_key_mode(&fx.registry, 0, 0, "fxnoisetester1"),
            Ok(())
        );
    }

    #[test]
    fn mode_cycling_wraps() {
        let fx = fixture();
        for name in ["fxblur", "fxedge", "fxglow"] {
            fx.table.add_effect_key(&fx.registry, 2, name, false).unwrap();
        }
        assert_eq!(fx.table.set_mode(2, Mode::Previous), Ok(2));
        assert_eq!(fx.table.set_mode(2, Mode::Next), Ok(0));
        assert_eq!(fx.table.set_mode(2, Mode::Next), Ok(1));
        assert_eq!(
            fx.table.set_mode(2, Mode::Index(3)),
            Err(KeyError::NoBinding { key: 2, mode: 3 })
        );
    }

    #[test]
    fn deleting_a_mode_shifts_the_rest_down() {
        let fx = fixture();
        for name in ["fxblur", "fxedge", "fxglow"] {
            fx.table.add_effect_key(&fx.registry, 0, name, false).unwrap();
        }
        fx.table.set_mode(0, Mode::Index(2)).unwrap();
        fx.table.delete_effect_key(0, 0).unwrap();
        assert_eq!(bound_names(&fx.table, 0), vec!["edge", "glow"]);
        assert_eq!(fx.table.active_mode(0), Some(1));
        fx.table.delete_effect_key(0, 1).unwrap();
        assert_eq!(fx.table.active_mode(0), Some(0));
    }

    #[test]
    fn switching_modes_restarts_an_active_key() {
        let fx = fixture();
        fx.table.add_effect_key(&fx.registry, 0, "fxblur", false).unwrap();
        fx.table.add_effect_key(&fx.registry, 0, "fxedge", false).unwrap();
        let first = fx.table.activate(0).unwrap();
        assert_eq!(first.filter().name(), "blur");
        fx.table.set_mode(0, Mode::Next).unwrap();
        let second = fx.table.obtain(0, Some(1)).unwrap();
        assert_eq!(second.filter().name(), "edge");
        assert!(!first.is_inited());
        assert!(second.is_inited());
        assert_eq!(FakeCallbacks::count(&fx.callbacks.inits), 2);
        assert!(fx.table.obtain(0, Some(0)).is_none());
    }

    #[test]
    fn obtain_shares_the_bound_instance() {
        let fx = fixture();
        fx.table.add_effect_key(&fx.registry, 3, "fxblur", false).unwrap();
        assert!(fx.table.obtain(3, None).is_none());
        let instance = fx.table.activate(3).unwrap();
        let obtained = fx.table.obtain(3, None).unwrap();
        assert!(obtained.ptr_eq(&instance));
        assert_eq!(instance.refcount(), 3);
        fx.table.deactivate(3).unwrap();
        assert_eq!(instance.refcount(), 2);
        drop(obtained);
        assert_eq!(fx.table.counter().get(), 1);
        drop(instance);
        assert_eq!(fx.table.counter().get(), 0);
    }

    #[test]
    fn deinit_all_skips_generators() {
        let fx = fixture();
        fx.table.add_effect_key(&fx.registry, 0, "fxblur", false).unwrap();
        fx.table.add_effect_key(&fx.registry, 1, "fxnoise", false).unwrap();
        fx.table.activate(0).unwrap();
        fx.table.activate(1).unwrap();
        fx.table.deinit_all();
        assert!(!fx.table.is_active(0));
        assert!(fx.table.is_active(1));
    }

    #[test]
    fn generator_slots_swap() {
        let fx = fixture();
        let noise = fx.registry.find("fxnoisetester1").unwrap();
        let instance = Instance::create(noise, fx.table.counter()).unwrap();
        fx.table.set_generator(GeneratorSlot::Foreground, Some(instance.clone()));
        fx.table.swap_fg_bg();
        assert!(fx.table.generator(GeneratorSlot::Foreground).is_none());
        let background = fx.table.generator(GeneratorSlot::Background).unwrap();
        assert!(background.ptr_eq(&instance));
        assert_eq!(fx.table.bound_instances(), 1);
        fx.table.clear();
        assert_eq!(fx.table.bound_instances(), 0);
    }
}
