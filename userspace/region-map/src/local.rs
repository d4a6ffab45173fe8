// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Eagerly mapped region maps for a component's own address space.
//!
//! Unlike [`crate::RegionMap`], a [`LocalRegionMap`] installs mappings at
//! attach time through a [`Backing`]. Sub maps reserve their range in the
//! root map when attached; regions attached to a sub map are mapped at the
//! sub map's base plus their local address.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::config::Config;
use crate::dataspace::{AttachmentOwner, MemoryDataspace};
use crate::error::{Error, Result};
use crate::region::{AttachArgs, Region};
use crate::table::RegionTable;

/// Address-space primitive used to install mappings.
pub trait Backing: Send + Sync {
    /// Maps `size` bytes of `ds` starting at `offset` to `addr`.
    fn map(
        &self,
        addr: usize,
        ds: &MemoryDataspace,
        offset: usize,
        size: usize,
        writable: bool,
        executable: bool,
    ) -> Result<()>;

    /// Removes mappings and reservations inside `[addr, addr + size)`.
    fn unmap(&self, addr: usize, size: usize);

    /// Keeps `[addr, addr + size)` free for a sub map.
    fn reserve(&self, addr: usize, size: usize) -> Result<()>;
}

/// Mapping installed by a [`RecordingBacking`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedRange {
    /// Mapped bytes.
    pub size: usize,
    /// Source address of the first byte.
    pub src: usize,
    /// Writes are allowed.
    pub writable: bool,
    /// Instruction fetches are allowed.
    pub executable: bool,
}

/// Host backing that records mappings instead of touching page tables.
#[derive(Debug, Default)]
pub struct RecordingBacking {
    mappings: Mutex<BTreeMap<usize, MappedRange>>,
    reservations: Mutex<BTreeMap<usize, usize>>,
}

impl RecordingBacking {
    /// Creates an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mapping covering `addr`, with its base.
    pub fn mapping_at(&self, addr: usize) -> Option<(usize, MappedRange)> {
        self.mappings
            .lock()
            .range(..=addr)
            .next_back()
            .filter(|(base, range)| addr - **base < range.size)
            .map(|(base, range)| (*base, *range))
    }

    /// Number of installed mappings.
    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }

    /// Returns `true` if a reservation starts at `addr`.
    pub fn is_reserved(&self, addr: usize) -> bool {
        self.reservations.lock().contains_key(&addr)
    }
}

fn overlaps(a: usize, a_size: usize, b: usize, b_size: usize) -> bool {
    a < b.saturating_add(b_size) && b < a.saturating_add(a_size)
}

impl Backing for RecordingBacking {
    fn map(
        &self,
        addr: usize,
        ds: &MemoryDataspace,
        offset: usize,
        size: usize,
        writable: bool,
        executable: bool,
    ) -> Result<()> {
        let mut mappings = self.mappings.lock();
        if mappings.iter().any(|(base, range)| overlaps(*base, range.size, addr, size)) {
            return Err(Error::RegionConflict);
        }
        let src = ds.phys_addr().checked_add(offset).ok_or(Error::InvalidArgs)?;
        mappings.insert(addr, MappedRange { size, src, writable, executable });
        Ok(())
    }

    fn unmap(&self, addr: usize, size: usize) {
        self.mappings.lock().retain(|base, range| !overlaps(*base, range.size, addr, size));
        self.reservations.lock().retain(|base, len| !overlaps(*base, *len, addr, size));
    }

    fn reserve(&self, addr: usize, size: usize) -> Result<()> {
        let mut reservations = self.reservations.lock();
        if reservations.iter().any(|(base, len)| overlaps(*base, *len, addr, size)) {
            return Err(Error::RegionConflict);
        }
        reservations.insert(addr, size);
        Ok(())
    }
}

/// Dataspace attachable to a [`LocalRegionMap`].
#[derive(Clone, Debug)]
pub enum LocalDataspace {
    /// Ordinary memory.
    Memory(Arc<MemoryDataspace>),
    /// A local sub map.
    SubMap(Arc<LocalRegionMap>),
}

impl LocalDataspace {
    fn size(&self) -> usize {
        match self {
            LocalDataspace::Memory(ds) => ds.size(),
            LocalDataspace::SubMap(map) => map.size(),
        }
    }

    fn downgrade(&self) -> LocalDataspaceRef {
        match self {
            LocalDataspace::Memory(ds) => LocalDataspaceRef::Memory(Arc::downgrade(ds)),
            LocalDataspace::SubMap(map) => LocalDataspaceRef::SubMap(Arc::downgrade(map)),
        }
    }
}

/// Non-owning reference stored in local regions.
#[derive(Clone, Debug)]
pub enum LocalDataspaceRef {
    /// Ordinary memory.
    Memory(Weak<MemoryDataspace>),
    /// A local sub map.
    SubMap(Weak<LocalRegionMap>),
}

#[derive(Clone, Copy, Debug)]
struct Window {
    base: usize,
    offset: usize,
    size: usize,
}

impl Window {
    /// Parent address and length of the visible part of `[addr, addr + size)`.
    fn translate(&self, addr: usize, size: usize) -> Option<(usize, usize)> {
        let lo = addr.max(self.offset);
        let hi = addr.saturating_add(size).min(self.offset + self.size);
        if lo < hi {
            Some((self.base + (lo - self.offset), hi - lo))
        } else {
            None
        }
    }
}

struct Attachment {
    parent: Weak<LocalRegionMap>,
    window: Window,
    // false once the parent detached the region
    mapped: bool,
}

struct LocalInner {
    table: RegionTable<LocalDataspaceRef>,
    attachment: Option<Attachment>,
}

/// Sub map attachment states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachState {
    /// Never attached.
    Unattached,
    /// Attached at `base` in its parent.
    Attached {
        /// Base address inside the parent.
        base: usize,
    },
}

/// Region map that maps eagerly through a [`Backing`].
pub struct LocalRegionMap {
    me: Weak<LocalRegionMap>,
    config: Arc<Config>,
    backing: Arc<dyn Backing>,
    sub_rm: bool,
    size: usize,
    inner: Mutex<LocalInner>,
}

impl core::fmt::Debug for LocalRegionMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalRegionMap")
            .field("sub_rm", &self.sub_rm)
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

impl LocalRegionMap {
    fn create(config: Arc<Config>, backing: Arc<dyn Backing>, sub_rm: bool, size: usize) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            inner: Mutex::new(LocalInner {
                table: RegionTable::new(config.max_regions),
                attachment: None,
            }),
            config,
            backing,
            sub_rm,
            size,
        })
    }

    /// Root map of the component's address space.
    pub fn new(config: impl Into<Arc<Config>>, backing: Arc<dyn Backing>) -> Result<Arc<Self>> {
        Ok(Self::create(Config::checked(config.into())?, backing, false, 0))
    }

    /// Sub map of `size` bytes, mapped once attached to a root map.
    pub fn new_sub(
        config: impl Into<Arc<Config>>,
        backing: Arc<dyn Backing>,
        size: usize,
    ) -> Result<Arc<Self>> {
        let config = Config::checked(config.into())?;
        let size = config.align_up(size).ok_or(Error::InvalidArgs)?;
        if size == 0 {
            return Err(Error::InvalidArgs);
        }
        Ok(Self::create(config, backing, true, size))
    }

    /// Size of the map, `0` for the root map.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Attachment state of a sub map.
    pub fn attach_state(&self) -> AttachState {
        match &self.inner.lock().attachment {
            Some(attachment) => AttachState::Attached { base: attachment.window.base },
            None => AttachState::Unattached,
        }
    }

    /// Region starting at `base`, or an empty region.
    pub fn region_at(&self, base: usize) -> Region<LocalDataspaceRef> {
        self.inner.lock().table.find_by_base(base)
    }

    fn owner_key(&self) -> usize {
        self.me.as_ptr() as usize
    }

    /// Where local `[addr, addr + size)` lands in the address space, if mapped.
    fn target(&self, inner: &LocalInner, addr: usize, size: usize) -> Option<(usize, usize)> {
        if !self.sub_rm {
            return Some((addr, size));
        }
        inner
            .attachment
            .as_ref()
            .filter(|attachment| attachment.mapped)
            .and_then(|attachment| attachment.window.translate(addr, size))
    }

    /// Attaches and maps a dataspace, returning its local address.
    pub fn attach(&self, ds: &LocalDataspace, args: AttachArgs) -> Result<usize> {
        let (size, offset) = args.extent(&self.config, ds.size())?;
        if let LocalDataspace::SubMap(sub) = ds {
            if self.sub_rm {
                return Err(Error::NestingTooDeep);
            }
            if !sub.sub_rm {
                return Err(Error::InvalidDataspace);
            }
        }

        let mut inner = self.inner.lock();
        let mut sub_inner = match ds {
            LocalDataspace::SubMap(sub) => Some(sub.inner.lock()),
            LocalDataspace::Memory(_) => None,
        };
        if sub_inner.as_ref().is_some_and(|sub| sub.attachment.is_some()) {
            return Err(Error::AlreadyAttached);
        }

        let end = (self.size != 0).then_some(self.size);
        let base = match args.at {
            Some(at) if end.map_or(true, |end| at + size <= end) => at,
            Some(_) => return Err(Error::RegionConflict),
            None => inner
                .table
                .find_free(0, end, size, self.config.page_size_log2)
                .ok_or(Error::RegionConflict)?,
        };
        let region = Region::new(base, size, ds.downgrade(), offset)
            .with_permissions(args.writable, args.executable);
        inner.table.add(region)?;

        let installed = match ds {
            LocalDataspace::Memory(memory) => match self.target(&inner, base, size) {
                Some((addr, len)) => {
                    let skip = addr_skip(&inner, self.sub_rm, base);
                    self.backing.map(
                        addr,
                        memory,
                        offset + skip,
                        len,
                        args.writable && memory.writable(),
                        args.executable,
                    )
                }
                None => Ok(()),
            },
            LocalDataspace::SubMap(_) => self.backing.reserve(base, size).and_then(|()| {
                let window = Window { base, offset, size };
                let mapped = match sub_inner.as_mut() {
                    Some(sub) => map_sub_regions(self.backing.as_ref(), &sub.table, window)
                        .map(|()| {
                            sub.attachment =
                                Some(Attachment { parent: self.me.clone(), window, mapped: true });
                        }),
                    None => Ok(()),
                };
                if mapped.is_err() {
                    self.backing.unmap(base, size);
                }
                mapped
            }),
        };
        if let Err(err) = installed {
            inner.table.remove_by_base(base);
            return Err(err);
        }
        if let LocalDataspace::Memory(memory) = ds {
            let owner: Weak<dyn AttachmentOwner> = self.me.clone();
            memory.attached_to(owner, self.owner_key(), base);
        }

        if self.config.verbose {
            debug!("rm: local attach {:#x} bytes at {:#x}", size, base);
        }
        Ok(base)
    }

    /// Unmaps and removes the region at `addr`. Unknown addresses are ignored.
    pub fn detach(&self, addr: usize) {
        if !self.detach_where(addr, |_| true) {
            warn!("rm: local detach: no attachment at {:#x}", addr);
        }
    }

    fn detach_where(&self, base: usize, matches: impl Fn(&Region<LocalDataspaceRef>) -> bool) -> bool {
        let (region, target) = {
            let mut inner = self.inner.lock();
            let region = inner.table.find_by_base(base);
            if !region.used() || !matches(&region) {
                return false;
            }
            inner.table.remove_by_base(base);
            let target = self.target(&inner, region.base(), region.size());
            (region, target)
        };

        if let Some((addr, len)) = target {
            self.backing.unmap(addr, len);
        }
        match region.dataspace() {
            Some(LocalDataspaceRef::Memory(memory)) => {
                if let Some(memory) = memory.upgrade() {
                    memory.detached_from(self.owner_key(), region.base());
                }
            }
            Some(LocalDataspaceRef::SubMap(sub)) => {
                if let Some(sub) = sub.upgrade() {
                    sub.parent_detached();
                }
            }
            None => {}
        }
        if self.config.verbose {
            debug!("rm: local detach {:#x} bytes at {:#x}", region.size(), region.base());
        }
        true
    }

    fn parent_detached(&self) {
        if let Some(attachment) = self.inner.lock().attachment.as_mut() {
            attachment.mapped = false;
        }
    }
}

/// Offset into a window-clipped region: how many leading bytes of the
/// region at `base` are cut off by the sub map window.
fn addr_skip(inner: &LocalInner, sub_rm: bool, base: usize) -> usize {
    match inner.attachment.as_ref() {
        Some(attachment) if sub_rm => attachment.window.offset.saturating_sub(base),
        _ => 0,
    }
}

fn map_sub_regions(
    backing: &dyn Backing,
    table: &RegionTable<LocalDataspaceRef>,
    window: Window,
) -> Result<()> {
    for (_, region) in table.iter() {
        let Some(LocalDataspaceRef::Memory(memory)) = region.dataspace() else {
            continue;
        };
        let Some(memory) = memory.upgrade() else {
            continue;
        };
        if let Some((addr, len)) = window.translate(region.base(), region.size()) {
            let skip = window.offset.saturating_sub(region.base());
            backing.map(
                addr,
                &memory,
                region.offset() + skip,
                len,
                region.writable() && memory.writable(),
                region.executable(),
            )?;
        }
    }
    Ok(())
}

impl AttachmentOwner for LocalRegionMap {
    fn release(&self, base: usize, ds: *const MemoryDataspace) {
        self.detach_where(base, |region| {
            matches!(region.dataspace(), Some(LocalDataspaceRef::Memory(m)) if core::ptr::eq(m.as_ptr(), ds))
        });
    }
}

impl Drop for LocalRegionMap {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let attachment = inner.attachment.take();
        let regions = inner.table.drain();
        let key = self.owner_key();

        for region in &regions {
            match region.dataspace() {
                Some(LocalDataspaceRef::Memory(memory)) => {
                    if let Some(memory) = memory.upgrade() {
                        memory.detached_from(key, region.base());
                    }
                }
                Some(LocalDataspaceRef::SubMap(sub)) => {
                    if let Some(sub) = sub.upgrade() {
                        sub.parent_detached();
                    }
                }
                None => {}
            }
        }
        match attachment {
            Some(attachment) => {
                if let Some(parent) = attachment.parent.upgrade() {
                    let me = self.me.clone();
                    parent.detach_where(attachment.window.base, |region| {
                        matches!(region.dataspace(), Some(LocalDataspaceRef::SubMap(m)) if Weak::ptr_eq(m, &me))
                    });
                }
            }
            None if !self.sub_rm => {
                for region in &regions {
                    self.backing.unmap(region.base(), region.size());
                }
            }
            None => {}
        }
    }
}
