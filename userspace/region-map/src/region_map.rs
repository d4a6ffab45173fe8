// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Demand-paged region maps.
//!
//! A [`RegionMap`] records which dataspaces are attached where. Nothing is
//! mapped at attach time; mappings are computed per fault by
//! [`RegionMap::reverse_lookup`]. A region map created with
//! [`RegionMap::new_sub`] can itself be attached to a root region map as a
//! managed dataspace, giving one level of nesting.
//!
//! Locking: each map has a single mutex. The outer map's lock may be held
//! while taking the lock of a sub map attached to it, never the reverse.
//! Faulter locks are taken inside map locks. Threads are woken and unmapped
//! only after the map lock is released.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error as ThisError;

use crate::client::{FaulterRecord, Pageable, PagerCapability, RmClient};
use crate::config::Config;
use crate::dataspace::{
    AttachmentOwner, Dataspace, DataspaceCapability, DataspaceRef, MemoryDataspace,
};
use crate::error::{Error, FaultError, Result};
use crate::fault::{FaultArea, FaultType, MapFlags, Mapping, State};
use crate::faulter::{Faulter, ThreadCapability};
use crate::region::{AttachArgs, Region};
use crate::signal::{FaultNotifier, SignalContextCapability};
use crate::table::RegionTable;

/// Where a sub map is attached inside its parent.
#[derive(Clone, Debug)]
struct ParentLink {
    map: Weak<RegionMap>,
    base: usize,
    offset: usize,
    size: usize,
    // false once the parent detached the region
    active: bool,
}

struct Inner {
    table: RegionTable,
    faulters: VecDeque<Arc<Faulter>>,
    clients: Vec<Arc<RmClient>>,
    notifier: FaultNotifier,
    parent: Option<ParentLink>,
    // bumped by every attach; a faulter seen at an older epoch is not parked
    attach_epoch: u64,
}

/// Successful reverse lookup: where a fault address is backed.
#[derive(Clone, Debug)]
pub struct Lookup {
    /// Leaf memory dataspace.
    pub dataspace: Arc<MemoryDataspace>,
    /// Byte offset of the fault address within `dataspace`.
    pub offset: usize,
    /// Destination flexpage in the coordinates of the map the lookup started at.
    pub fault_area: FaultArea,
    /// Source flexpage in the dataspace's source address space.
    pub src_area: FaultArea,
    /// Log2 of the flexpage size shared by both areas.
    pub size_log2: u32,
    /// Writes are permitted along the whole lookup path.
    pub writable: bool,
    /// Instruction fetches are permitted along the whole lookup path.
    pub executable: bool,
    /// Region map holding the leaf region.
    pub region_map: Arc<RegionMap>,
    /// Fault address relative to `region_map`.
    pub local_addr: usize,
    pub(crate) epoch: u64,
}

impl Lookup {
    /// Mapping that resolves the fault.
    pub fn mapping(&self) -> Mapping {
        let mut flags = MapFlags::empty();
        flags.set(MapFlags::WRITABLE, self.writable);
        flags.set(MapFlags::EXECUTABLE, self.executable);
        flags.set(MapFlags::IO_MEM, self.dataspace.is_io_mem());
        Mapping {
            dst_base: self.fault_area.base(),
            src_base: self.src_area.base(),
            size_log2: self.size_log2,
            flags,
            cacheability: self.dataspace.cacheability(),
        }
    }

    /// Returns `true` if source and destination share the same offset within
    /// a page, which a mapping requires.
    pub fn congruent(&self, page_size_log2: u32) -> bool {
        let mask = (1usize << page_size_log2) - 1;
        (self.fault_area.fault_addr() ^ self.src_area.fault_addr()) & mask == 0
    }
}

/// Failed reverse lookup.
#[derive(Clone, Debug, ThisError)]
#[error("no region covers {addr:#x}")]
pub struct Miss {
    /// Innermost region map consulted, responsible for the fault.
    pub region_map: Arc<RegionMap>,
    /// Fault address relative to `region_map`.
    pub addr: usize,
    pub(crate) epoch: u64,
}

/// Outcome of [`RegionMap::park`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Parking {
    Parked,
    // an attach ran since the lookup; look up again
    Stale,
}

struct Detached {
    region: Region,
    clients: Vec<Arc<RmClient>>,
    parent: Option<ParentLink>,
}

/// Demand-paged virtual address space.
pub struct RegionMap {
    me: Weak<RegionMap>,
    config: Arc<Config>,
    vm_start: usize,
    vm_size: usize,
    sub_rm: bool,
    inner: Mutex<Inner>,
}

impl core::fmt::Debug for RegionMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegionMap")
            .field("vm_start", &format_args!("{:#x}", self.vm_start))
            .field("vm_size", &format_args!("{:#x}", self.vm_size))
            .field("sub_rm", &self.sub_rm)
            .finish()
    }
}

impl RegionMap {
    fn create(config: Arc<Config>, vm_start: usize, vm_size: usize, sub_rm: bool) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            inner: Mutex::new(Inner {
                table: RegionTable::new(config.max_regions),
                faulters: VecDeque::new(),
                clients: Vec::new(),
                notifier: FaultNotifier::default(),
                parent: None,
                attach_epoch: 0,
            }),
            config,
            vm_start,
            vm_size,
            sub_rm,
        })
    }

    /// Root region map spanning the whole address space.
    pub fn new(config: impl Into<Arc<Config>>) -> Result<Arc<Self>> {
        Ok(Self::create(Config::checked(config.into())?, 0, 0, false))
    }

    /// Root region map restricted to `[start, start + size)`.
    pub fn with_range(config: impl Into<Arc<Config>>, start: usize, size: usize) -> Result<Arc<Self>> {
        let config = Config::checked(config.into())?;
        let size = config.align_up(size).ok_or(Error::InvalidArgs)?;
        if size == 0 || !config.is_aligned(start) || start.checked_add(size).is_none() {
            return Err(Error::InvalidArgs);
        }
        Ok(Self::create(config, start, size, false))
    }

    /// Sub region map of `size` bytes, attachable once to a root map through
    /// [`RegionMap::dataspace`].
    pub fn new_sub(config: impl Into<Arc<Config>>, size: usize) -> Result<Arc<Self>> {
        let config = Config::checked(config.into())?;
        let size = config.align_up(size).ok_or(Error::InvalidArgs)?;
        if size == 0 {
            return Err(Error::InvalidArgs);
        }
        Ok(Self::create(config, 0, size, true))
    }

    /// Limits this map was created with.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Size of the managed range, `0` for an unbounded root map.
    pub fn size(&self) -> usize {
        self.vm_size
    }

    /// Returns `true` for maps created with [`RegionMap::new_sub`].
    pub fn is_sub(&self) -> bool {
        self.sub_rm
    }

    /// Base address inside the parent, once the sub map has been attached.
    pub fn attached_base(&self) -> Option<usize> {
        self.inner.lock().parent.as_ref().map(|link| link.base)
    }

    /// Number of attached regions.
    pub fn region_count(&self) -> usize {
        self.inner.lock().table.len()
    }

    /// Region starting at `base`, or an empty region.
    pub fn region_at(&self, base: usize) -> Region {
        self.inner.lock().table.find_by_base(base)
    }

    /// Snapshot of all attached regions ordered by base.
    pub fn regions(&self) -> Vec<Region> {
        let mut regions: Vec<Region> =
            self.inner.lock().table.iter().map(|(_, region)| region.clone()).collect();
        regions.sort_by_key(Region::base);
        regions
    }

    /// Number of parked faulters.
    pub fn faulter_count(&self) -> usize {
        self.inner.lock().faulters.len()
    }

    /// Managed-dataspace capability naming this map.
    pub fn dataspace(&self) -> DataspaceCapability {
        DataspaceCapability::from(DataspaceRef::Managed(self.me.clone()))
    }

    fn owner_key(&self) -> usize {
        self.me.as_ptr() as usize
    }

    fn vm_end(&self) -> Option<usize> {
        if self.vm_size == 0 {
            None
        } else {
            Some(self.vm_start + self.vm_size)
        }
    }

    fn in_range(&self, addr: usize, size: usize) -> bool {
        match self.vm_end() {
            None => true,
            Some(end) => addr >= self.vm_start && addr.checked_add(size).is_some_and(|e| e <= end),
        }
    }

    /// Picks the most naturally aligned free range of `size` bytes whose
    /// alignment the backing address `src` also has.
    fn place(&self, table: &RegionTable, size: usize, src: usize) -> Result<usize> {
        let page_log2 = self.config.page_size_log2;
        let natural = usize::BITS - 1 - size.leading_zeros();
        for align_log2 in (page_log2..=natural).rev() {
            if align_log2 > page_log2 && src & ((1usize << align_log2) - 1) != 0 {
                continue;
            }
            if let Some(addr) = table.find_free(self.vm_start, self.vm_end(), size, align_log2) {
                return Ok(addr);
            }
        }
        Err(Error::RegionConflict)
    }

    /// Attaches a dataspace and returns its local base address.
    ///
    /// Threads parked on a fault inside the new region are resumed.
    pub fn attach(&self, ds: &DataspaceCapability, args: AttachArgs) -> Result<usize> {
        let dataspace = ds.resolve().ok_or(Error::InvalidDataspace)?;
        let (size, offset) = args.extent(&self.config, dataspace.size())?;
        if let Dataspace::Managed(managed) = &dataspace {
            if self.sub_rm {
                return Err(Error::NestingTooDeep);
            }
            if !managed.sub_region_map().is_sub() {
                return Err(Error::InvalidDataspace);
            }
        }

        let mut inner = self.inner.lock();
        let mut sub_inner = match &dataspace {
            Dataspace::Managed(managed) => Some(managed.sub_region_map().inner.lock()),
            Dataspace::Memory(_) => None,
        };
        if sub_inner.as_ref().is_some_and(|sub| sub.parent.is_some()) {
            return Err(Error::AlreadyAttached);
        }

        let base = match args.at {
            Some(at) if self.in_range(at, size) => at,
            Some(_) => return Err(Error::RegionConflict),
            None => {
                let src = dataspace.phys_addr().wrapping_add(offset);
                self.place(&inner.table, size, src)?
            }
        };
        let region = Region::new(base, size, dataspace.downgrade(), offset)
            .with_permissions(args.writable, args.executable);
        inner.table.add(region)?;
        inner.attach_epoch = inner.attach_epoch.wrapping_add(1);

        match &dataspace {
            Dataspace::Memory(memory) => {
                let owner: Weak<dyn AttachmentOwner> = self.me.clone();
                memory.attached_to(owner, self.owner_key(), base);
            }
            Dataspace::Managed(_) => {
                if let Some(sub) = sub_inner.as_mut() {
                    sub.parent = Some(ParentLink {
                        map: self.me.clone(),
                        base,
                        offset,
                        size,
                        active: true,
                    });
                }
            }
        }
        drop(sub_inner);

        let mut resolved = Vec::new();
        inner.faulters.retain(|faulter| {
            let hit = faulter.fault_in_addr_range(base, size);
            if hit {
                resolved.push(Arc::clone(faulter));
            }
            !hit
        });
        drop(inner);

        if self.config.verbose {
            debug!("rm: attached {:#x} bytes at {:#x} (offset {:#x})", size, base, offset);
        }
        for faulter in resolved {
            faulter.continue_after_resolved_fault();
        }
        Ok(base)
    }

    /// Detaches the region starting at `addr`. Unknown addresses are ignored.
    pub fn detach(&self, addr: usize) {
        match self.detach_where(addr, |_| true) {
            Some(detached) => self.finish_detach(detached),
            None => warn!("rm: detach: no attachment at {:#x}", addr),
        }
    }

    fn detach_where(&self, base: usize, matches: impl Fn(&Region) -> bool) -> Option<Detached> {
        let mut inner = self.inner.lock();
        let region = inner.table.find_by_base(base);
        if !region.used() || !matches(&region) {
            return None;
        }
        inner.table.remove_by_base(base);
        Some(Detached { region, clients: inner.clients.clone(), parent: inner.parent.clone() })
    }

    fn finish_detach(&self, detached: Detached) {
        let Detached { region, clients, parent } = detached;
        match region.dataspace().and_then(DataspaceRef::upgrade) {
            Some(Dataspace::Memory(memory)) => memory.detached_from(self.owner_key(), region.base()),
            Some(Dataspace::Managed(managed)) => managed.sub_region_map().parent_detached(),
            None => {}
        }
        for client in &clients {
            client.pager_object().unmap(region.base(), region.size());
        }
        if let Some(link) = parent.filter(|link| link.active) {
            if let Some(parent) = link.map.upgrade() {
                parent.unmap_managed(&link, region.base(), region.size());
            }
        }
        if self.config.verbose {
            debug!("rm: detached {:#x} bytes at {:#x}", region.size(), region.base());
        }
    }

    /// Unmaps the part of `[base, base + size)` (sub map coordinates) that is
    /// visible through `link` from every client of this map.
    fn unmap_managed(&self, link: &ParentLink, base: usize, size: usize) {
        let lo = base.max(link.offset);
        let hi = base.saturating_add(size).min(link.offset.saturating_add(link.size));
        if lo >= hi {
            return;
        }
        let dst = link.base + (lo - link.offset);
        let clients = self.inner.lock().clients.clone();
        for client in clients {
            client.pager_object().unmap(dst, hi - lo);
        }
    }

    fn parent_detached(&self) {
        if let Some(link) = self.inner.lock().parent.as_mut() {
            link.active = false;
        }
    }

    fn release_sub_map(&self, sub: &Weak<RegionMap>, base: usize) {
        let detached = self.detach_where(base, |region| {
            matches!(region.dataspace(), Some(DataspaceRef::Managed(map)) if Weak::ptr_eq(map, sub))
        });
        if let Some(Detached { region, clients, .. }) = detached {
            for client in &clients {
                client.pager_object().unmap(region.base(), region.size());
            }
        }
    }

    /// Binds a thread to this map and returns its pager capability.
    pub fn add_client(&self, thread: &ThreadCapability) -> Result<PagerCapability> {
        let pager = thread.resolve().ok_or(Error::InvalidThread)?;
        let client = Arc::new(RmClient::new(pager, self.me.clone()));
        self.inner.lock().clients.push(Arc::clone(&client));
        Ok(PagerCapability::new(client))
    }

    /// Removes a client. Removing an unknown client has no effect.
    pub fn dissolve(&self, client: &RmClient) {
        client.faulter().dissolve_from_faulting_region_map();
        self.inner.lock().clients.retain(|c| !core::ptr::eq(Arc::as_ptr(c), client));
    }

    /// Number of bound clients.
    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Registers the signal context notified about unresolved faults. An
    /// invalid capability disables fault notification.
    pub fn fault_handler(&self, context: SignalContextCapability) {
        self.inner.lock().notifier.set(context);
    }

    /// Fault of the oldest parked faulter, or [`State::Ready`].
    pub fn state(&self) -> State {
        self.inner.lock().faulters.front().map_or(State::Ready, |faulter| faulter.state())
    }

    /// Parks `faulter` at this map and signals the fault handler.
    ///
    /// Without a live fault handler the fault is not recorded and
    /// [`FaultError::NoFaultHandler`] is returned.
    pub fn fault(&self, faulter: &Arc<Faulter>, addr: usize, kind: FaultType) -> core::result::Result<(), FaultError> {
        self.park(faulter, addr, kind, None).map(|_| ())
    }

    /// Like [`RegionMap::fault`], but refuses to park when an attach ran
    /// after the lookup that observed `seen_epoch`.
    pub(crate) fn park(
        &self,
        faulter: &Arc<Faulter>,
        addr: usize,
        kind: FaultType,
        seen_epoch: Option<u64>,
    ) -> core::result::Result<Parking, FaultError> {
        faulter.dissolve_from_faulting_region_map();

        let mut inner = self.inner.lock();
        if seen_epoch.is_some_and(|epoch| epoch != inner.attach_epoch) {
            return Ok(Parking::Stale);
        }
        if !inner.notifier.submit() {
            return Err(FaultError::NoFaultHandler);
        }
        faulter.record(self.me.clone(), State::Faulted { kind, addr });
        if !inner.faulters.iter().any(|f| Arc::ptr_eq(f, faulter)) {
            inner.faulters.push_back(Arc::clone(faulter));
        }
        Ok(Parking::Parked)
    }

    /// Removes `faulter` from the faulter list.
    pub fn discard_faulter(&self, faulter: &Faulter) {
        self.inner.lock().faulters.retain(|f| !core::ptr::eq(Arc::as_ptr(f), faulter));
    }

    /// Finds the memory dataspace backing `addr`, descending into one level of
    /// managed dataspaces.
    pub fn reverse_lookup(self: &Arc<Self>, addr: usize) -> core::result::Result<Lookup, Miss> {
        let page_log2 = self.config.page_size_log2;
        // Upgraded dataspaces must outlive the guard: their last drop re-enters this map.
        let mut keep: Vec<Dataspace> = Vec::new();
        let inner = self.inner.lock();
        let epoch = inner.attach_epoch;
        let miss = |map: &Arc<RegionMap>, addr, epoch| Miss { region_map: Arc::clone(map), addr, epoch };

        let Some(region) = inner.table.find_containing(addr).cloned() else {
            return Err(miss(self, addr, epoch));
        };
        let mut dst = FaultArea::new(addr);
        dst.constrain(region.base(), region.size(), page_log2);

        let backing = region.dataspace().and_then(DataspaceRef::upgrade);
        keep.extend(backing.clone());
        match backing {
            Some(Dataspace::Memory(memory)) => {
                let perms = (region.writable(), region.executable());
                self.leaf(memory, &region, addr, dst, perms, (self, epoch))
            }
            Some(Dataspace::Managed(managed)) => {
                let sub = managed.sub_region_map();
                let sub_addr = addr - region.base() + region.offset();
                let sub_inner = sub.inner.lock();
                let sub_epoch = sub_inner.attach_epoch;
                let Some(leaf) = sub_inner.table.find_containing(sub_addr).cloned() else {
                    return Err(miss(sub, sub_addr, sub_epoch));
                };
                drop(sub_inner);

                let lo = leaf.base().max(region.offset());
                let hi = leaf.end().min(region.offset() + region.size());
                dst.constrain(lo - region.offset() + region.base(), hi - lo, page_log2);

                let perms = (
                    region.writable() && leaf.writable(),
                    region.executable() && leaf.executable(),
                );
                let backing = leaf.dataspace().and_then(DataspaceRef::upgrade);
                keep.extend(backing.clone());
                match backing {
                    Some(Dataspace::Memory(memory)) => {
                        self.leaf(memory, &leaf, sub_addr, dst, perms, (sub, sub_epoch))
                    }
                    Some(Dataspace::Managed(_)) => {
                        warn!("rm: nested managed dataspace at {:#x} ignored", sub_addr);
                        Err(miss(sub, sub_addr, sub_epoch))
                    }
                    None => Err(miss(sub, sub_addr, sub_epoch)),
                }
            }
            None => Err(miss(self, addr, epoch)),
        }
    }

    fn leaf(
        &self,
        memory: Arc<MemoryDataspace>,
        region: &Region,
        local_addr: usize,
        mut dst: FaultArea,
        (writable, executable): (bool, bool),
        (holder, epoch): (&Arc<RegionMap>, u64),
    ) -> core::result::Result<Lookup, Miss> {
        let page_log2 = self.config.page_size_log2;
        let offset = local_addr - region.base() + region.offset();
        let miss = || Miss { region_map: Arc::clone(holder), addr: local_addr, epoch };

        let src_addr = memory.phys_addr().checked_add(offset).ok_or_else(miss)?;
        let mut src = FaultArea::new(src_addr);
        src.constrain(memory.phys_addr(), memory.size(), page_log2);
        if !dst.valid() || !src.valid() {
            return Err(miss());
        }

        let size_log2 =
            self.config.constrain_map_size_log2(FaultArea::common_size_log2(&dst, &src, page_log2));
        dst.constrain_size(size_log2);
        src.constrain_size(size_log2);

        Ok(Lookup {
            offset,
            fault_area: dst,
            src_area: src,
            size_log2,
            writable: writable && memory.writable(),
            executable,
            dataspace: memory,
            region_map: Arc::clone(holder),
            local_addr,
            epoch,
        })
    }
}

impl AttachmentOwner for RegionMap {
    fn release(&self, base: usize, ds: *const MemoryDataspace) {
        let detached = self.detach_where(base, |region| {
            region.dataspace().is_some_and(|d| d.is_memory(ds))
        });
        if let Some(detached) = detached {
            self.finish_detach(detached);
        }
    }
}

impl Drop for RegionMap {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let parent = inner.parent.take();
        let faulters = core::mem::take(&mut inner.faulters);
        let clients = core::mem::take(&mut inner.clients);
        let regions = inner.table.drain();

        if let Some(link) = parent {
            if let Some(parent) = link.map.upgrade() {
                parent.release_sub_map(&self.me, link.base);
            }
        }
        for faulter in faulters {
            faulter.forget(&self.me);
        }
        let key = self.owner_key();
        for region in regions {
            match region.dataspace().and_then(DataspaceRef::upgrade) {
                Some(Dataspace::Memory(memory)) => memory.detached_from(key, region.base()),
                Some(Dataspace::Managed(managed)) => managed.sub_region_map().parent_detached(),
                None => {}
            }
            for client in &clients {
                client.pager_object().unmap(region.base(), region.size());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Pageable;

    fn config() -> Config {
        Config { max_regions: 16, ..Config::default() }
    }

    fn memory(size: usize) -> Arc<MemoryDataspace> {
        Arc::new(MemoryDataspace::new(size))
    }

    #[test]
    fn attach_places_by_natural_alignment() {
        let map = RegionMap::new(config()).unwrap();
        let small = memory(0x1000);
        let big = memory(0x4000);
        let a = map.attach(&(&small).into(), AttachArgs::default()).unwrap();
        let b = map.attach(&(&big).into(), AttachArgs::default()).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 0x4000);
    }

    #[test]
    fn backing_alignment_limits_placement() {
        let map = RegionMap::new(config()).unwrap();
        let ds = Arc::new(MemoryDataspace::new(0x4000).with_phys_addr(0x1000));
        let low = memory(0x1000);
        map.attach(&(&low).into(), AttachArgs::default().at(0)).unwrap();
        let base = map.attach(&(&ds).into(), AttachArgs::default()).unwrap();
        assert_eq!(base, 0x1000);
    }

    #[test]
    fn fixed_address_must_lie_in_range() {
        let map = RegionMap::with_range(config(), 0x10_000, 0x10_000).unwrap();
        let ds = memory(0x2000);
        assert_eq!(
            map.attach(&(&ds).into(), AttachArgs::default().at(0x1f_000)),
            Err(Error::RegionConflict)
        );
        assert_eq!(map.attach(&(&ds).into(), AttachArgs::default()), Ok(0x10_000));
    }

    #[test]
    fn attach_records_dataspace_attachment() {
        let map = RegionMap::new(config()).unwrap();
        let ds = memory(0x1000);
        let base = map.attach(&(&ds).into(), AttachArgs::default()).unwrap();
        assert_eq!(ds.attachment_count(), 1);
        map.detach(base);
        assert_eq!(ds.attachment_count(), 0);
    }

    #[test]
    fn sub_map_cannot_hold_managed_dataspace() {
        let root = RegionMap::new(config()).unwrap();
        let sub = RegionMap::new_sub(config(), 0x4000).unwrap();
        let other = RegionMap::new_sub(config(), 0x4000).unwrap();
        assert_eq!(sub.attach(&other.dataspace(), AttachArgs::default()), Err(Error::NestingTooDeep));
        assert_eq!(root.attach(&root.dataspace(), AttachArgs::default()), Err(Error::InvalidDataspace));
    }

    #[test]
    fn lookup_translates_window_offset() {
        let root = RegionMap::new(config()).unwrap();
        let sub = RegionMap::new_sub(config(), 0x4000).unwrap();
        let ds = Arc::new(MemoryDataspace::new(0x4000).with_phys_addr(0x100_0000));
        sub.attach(&(&ds).into(), AttachArgs::default().at(0)).unwrap();
        root.attach(&sub.dataspace(), AttachArgs::sized(0x2000).offset(0x2000).at(0x8000)).unwrap();

        let lookup = root.reverse_lookup(0x9800).unwrap();
        assert_eq!(lookup.offset, 0x3800);
        assert_eq!(lookup.local_addr, 0x3800);
        assert!(Arc::ptr_eq(&lookup.region_map, &sub));
        assert!(lookup.fault_area.base() >= 0x8000);
        assert!(lookup.fault_area.contains(0x9800));
        assert_eq!(lookup.mapping().src_base & 0xfff, 0);
        assert!(lookup.congruent(12));
    }

    #[test]
    fn platform_limit_caps_mapping_size() {
        let limited = Config { max_map_size_log2: Some(13), ..config() };
        let map = RegionMap::new(limited).unwrap();
        let ds = memory(0x10_000);
        map.attach(&(&ds).into(), AttachArgs::default().at(0)).unwrap();
        let lookup = map.reverse_lookup(0x5000).unwrap();
        assert_eq!(lookup.size_log2, 13);
        assert_eq!(lookup.fault_area.base(), 0x4000);
        assert_eq!(lookup.src_area.base(), 0x4000);
    }

    #[test]
    fn read_only_dataspace_limits_permissions() {
        let map = RegionMap::new(config()).unwrap();
        let ds = Arc::new(MemoryDataspace::new(0x1000).read_only());
        map.attach(&(&ds).into(), AttachArgs::default().at(0x1000).executable()).unwrap();
        let lookup = map.reverse_lookup(0x1000).unwrap();
        assert!(!lookup.writable);
        assert!(lookup.executable);
        assert_eq!(lookup.mapping().flags, MapFlags::EXECUTABLE);
    }

    struct Idle;

    impl crate::faulter::PagerObject for Idle {
        fn badge(&self) -> u64 {
            1
        }
        fn wake_up(&self) {}
        fn unmap(&self, _: usize, _: usize) {}
    }

    #[test]
    fn attach_after_lookup_prevents_parking() {
        let map = RegionMap::new(config()).unwrap();
        let handler = crate::signal::SignalContext::new();
        map.fault_handler(SignalContextCapability::from(&handler));
        let thread = Arc::new(Idle);
        let faulter = Faulter::new(thread);

        let miss = map.reverse_lookup(0x8010).unwrap_err();
        let ds = memory(0x1000);
        map.attach(&(&ds).into(), AttachArgs::default().at(0x8000)).unwrap();
        assert_eq!(
            map.park(&faulter, miss.addr, FaultType::Read, Some(miss.epoch)),
            Ok(Parking::Stale)
        );
        assert_eq!(map.faulter_count(), 0);
        assert_eq!(faulter.state(), State::Ready);
        assert_eq!(handler.pending(), 0);

        let miss = map.reverse_lookup(0x9000).unwrap_err();
        assert_eq!(
            map.park(&faulter, miss.addr, FaultType::Read, Some(miss.epoch)),
            Ok(Parking::Parked)
        );
        assert_eq!(map.faulter_count(), 1);
    }

    #[test]
    fn invalid_config_rejected() {
        let bad = Config { page_size_log2: 64, ..config() };
        assert_eq!(RegionMap::new(bad).unwrap_err(), Error::InvalidConfig);
        let empty = Config { max_regions: 0, ..config() };
        assert_eq!(RegionMap::new_sub(empty, 0x1000).unwrap_err(), Error::InvalidConfig);
        let unbounded = Config { max_map_size_log2: Some(usize::BITS), ..config() };
        assert_eq!(
            RegionMap::with_range(unbounded, 0, 0x1000).unwrap_err(),
            Error::InvalidConfig
        );
    }

    #[test]
    fn dissolve_is_idempotent() {
        let map = RegionMap::new(config()).unwrap();
        let thread = Arc::new(Idle);
        let cap = map.add_client(&ThreadCapability::new(&thread)).unwrap();
        assert_eq!(map.client_count(), 1);
        map.dissolve(&cap);
        map.dissolve(&cap);
        assert_eq!(map.client_count(), 0);
        assert!(matches!(
            cap.pager(&crate::fault::PageFault::new(0, 0, FaultType::Read)),
            crate::client::Resolution::Fatal(FaultError::NoFaultHandler)
        ));
    }
}
