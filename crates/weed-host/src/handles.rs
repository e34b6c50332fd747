//! Address table for plants handed across the plugin boundary.
//!
//! Plugins only ever see raw `weed_plant_t *` values. Every address the host
//! gives out, and every plant a plugin creates through `weed_plant_new`, is
//! recorded here so the exported leaf functions can turn an address back
//! into a [`PlantHandle`] and reject pointers the host never issued.

use std::collections::HashMap;
use std::ffi::c_void;
use std::thread::{self, ThreadId};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use weed_plant::{PlantHandle, WeakPlant};

enum Slot {
    /// Created by a plugin; the table keeps it alive until `weed_plant_free`
    /// or until the loader takes ownership.
    Owned(PlantHandle),
    /// Owned elsewhere in the host.
    Borrowed(WeakPlant),
}

struct Entry {
    slot: Slot,
    generation: u64,
    thread: ThreadId,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<usize, Entry>,
    generation: u64,
}

pub struct HandleTable {
    inner: Mutex<Inner>,
}

static TABLE: Lazy<HandleTable> = Lazy::new(HandleTable::new);

pub fn table() -> &'static HandleTable {
    &TABLE
}

/// Record `handle` as plugin-visible and return the address to pass on.
pub fn expose(handle: &PlantHandle) -> *mut c_void {
    table().register(handle);
    handle.as_ptr()
}

/// Resolve an address received from a plugin.
pub fn resolve(ptr: *mut c_void) -> Option<PlantHandle> {
    table().resolve(ptr)
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn register(&self, handle: &PlantHandle) {
        let mut inner = self.inner.lock();
        let generation = inner.generation;
        let addr = handle.addr();
        match inner.entries.get(&addr) {
            Some(Entry {
                slot: Slot::Owned(existing),
                ..
            }) if existing.ptr_eq(handle) => {}
            _ => {
                inner.entries.insert(
                    addr,
                    Entry {
                        slot: Slot::Borrowed(handle.downgrade()),
                        generation,
                        thread: thread::current().id(),
                    },
                );
            }
        }
    }

    /// Keep `handle` alive on behalf of a plugin.
    pub fn adopt(&self, handle: PlantHandle) -> *mut c_void {
        let ptr = handle.as_ptr();
        let mut inner = self.inner.lock();
        let generation = inner.generation;
        inner.entries.insert(
            handle.addr(),
            Entry {
                slot: Slot::Owned(handle),
                generation,
                thread: thread::current().id(),
            },
        );
        ptr
    }

    pub fn resolve(&self, ptr: *mut c_void) -> Option<PlantHandle> {
        if ptr.is_null() {
            return None;
        }
        let addr = ptr as usize;
        let mut inner = self.inner.lock();
        let handle = match &inner.entries.get(&addr)?.slot {
            Slot::Owned(handle) => Some(handle.clone()),
            Slot::Borrowed(weak) => weak.upgrade(),
        };
        if handle.is_none() {
            inner.entries.remove(&addr);
        }
        handle
    }

    /// Forget `ptr`. Returns whether the table was keeping it alive.
    pub fn release(&self, ptr: *mut c_void) -> bool {
        let removed = self.inner.lock().entries.remove(&(ptr as usize));
        matches!(
            removed,
            Some(Entry {
                slot: Slot::Owned(_),
                ..
            })
        )
    }

    /// Start a new generation; plants adopted from now on can be collected
    /// with [`HandleTable::demote_since`].
    pub fn mark(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.generation
    }

    /// Hand every plant this thread adopted since `mark` over to the
    /// caller, leaving only weak entries behind.
    pub fn demote_since(&self, mark: u64) -> Vec<PlantHandle> {
        let current = thread::current().id();
        let mut inner = self.inner.lock();
        let mut taken = Vec::new();
        for entry in inner.entries.values_mut() {
            if entry.generation < mark || entry.thread != current {
                continue;
            }
            if let Slot::Owned(handle) = &entry.slot {
                let handle = handle.clone();
                entry.slot = Slot::Borrowed(handle.downgrade());
                taken.push(handle);
            }
        }
        taken
    }

    /// Drop entries whose plant no longer exists.
    pub fn prune(&self) {
        self.inner.lock().entries.retain(|_, entry| match &entry.slot {
            Slot::Owned(_) => true,
            Slot::Borrowed(weak) => weak.upgrade().is_some(),
        });
    }

    pub fn contains(&self, ptr: *mut c_void) -> bool {
        self.inner.lock().entries.contains_key(&(ptr as usize))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
