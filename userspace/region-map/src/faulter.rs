// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Threads blocked on unresolved page faults.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::fault::State;
use crate::region_map::RegionMap;

/// Kernel-side representation of a thread that can take page faults.
///
/// Implemented by the kernel glue; the region map only wakes, unmaps and
/// reports.
pub trait PagerObject: Send + Sync {
    /// Identifier used in diagnostics.
    fn badge(&self) -> u64;

    /// Resumes the thread after its fault was resolved.
    fn wake_up(&self);

    /// Called when a fault could not be resolved or forwarded.
    fn unresolved_page_fault_occurred(&self) {}

    /// Removes mappings in `[virt_base, virt_base + size)` from the thread's
    /// address space.
    fn unmap(&self, virt_base: usize, size: usize);
}

/// Capability naming a thread. May be invalid or outlive its thread.
#[derive(Clone, Debug, Default)]
pub struct ThreadCapability(Option<Weak<dyn PagerObject>>);

impl ThreadCapability {
    /// Capability that never resolves.
    pub fn invalid() -> Self {
        Self(None)
    }

    /// Names the thread backed by `pager`.
    pub fn new<P: PagerObject + 'static>(pager: &Arc<P>) -> Self {
        let weak: Weak<P> = Arc::downgrade(pager);
        Self(Some(weak))
    }

    pub(crate) fn resolve(&self) -> Option<Arc<dyn PagerObject>> {
        self.0.as_ref().and_then(Weak::upgrade)
    }
}

struct FaulterState {
    faulting: Option<Weak<RegionMap>>,
    state: State,
}

/// Fault record of one thread. Parked at no more than one region map.
pub struct Faulter {
    pager: Arc<dyn PagerObject>,
    inner: Mutex<FaulterState>,
}

impl core::fmt::Debug for Faulter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Faulter")
            .field("badge", &self.pager.badge())
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl Faulter {
    /// Creates an idle fault record for `pager`.
    pub fn new(pager: Arc<dyn PagerObject>) -> Arc<Self> {
        Arc::new(Self { pager, inner: Mutex::new(FaulterState { faulting: None, state: State::Ready }) })
    }

    /// The thread this record belongs to.
    pub fn pager(&self) -> &Arc<dyn PagerObject> {
        &self.pager
    }

    /// Recorded fault, `Ready` if the thread is not blocked.
    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Region map the thread is parked at, if it is still alive.
    pub fn faulting_region_map(&self) -> Option<Arc<RegionMap>> {
        self.inner.lock().faulting.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn record(&self, map: Weak<RegionMap>, state: State) {
        let mut inner = self.inner.lock();
        inner.faulting = Some(map);
        inner.state = state;
    }

    /// Returns `true` if the recorded fault address lies in `[addr, addr + size)`.
    pub fn fault_in_addr_range(&self, addr: usize, size: usize) -> bool {
        match self.inner.lock().state {
            State::Faulted { addr: fault, .. } => fault >= addr && fault - addr < size,
            State::Ready => false,
        }
    }

    /// Clears the fault record and resumes the thread.
    pub fn continue_after_resolved_fault(&self) {
        {
            let mut inner = self.inner.lock();
            inner.faulting = None;
            inner.state = State::Ready;
        }
        self.pager.wake_up();
    }

    /// Removes the record from the map it is parked at.
    pub fn dissolve_from_faulting_region_map(&self) {
        let map = {
            let mut inner = self.inner.lock();
            inner.state = State::Ready;
            inner.faulting.take()
        };
        if let Some(map) = map.and_then(|map| map.upgrade()) {
            map.discard_faulter(self);
        }
    }

    /// Drops the link to `map` without calling back into it.
    pub(crate) fn forget(&self, map: &Weak<RegionMap>) {
        let mut inner = self.inner.lock();
        if inner.faulting.as_ref().is_some_and(|m| Weak::ptr_eq(m, map)) {
            inner.faulting = None;
            inner.state = State::Ready;
        }
    }
}
