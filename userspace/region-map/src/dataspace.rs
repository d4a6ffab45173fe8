// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dataspaces: memory objects and region maps exposed as memory objects.
//!
//! Region maps never own dataspaces. Regions keep a [`DataspaceRef`], which
//! stops resolving once the last [`Arc`] to the dataspace is gone. A
//! [`MemoryDataspace`] remembers where it is attached and removes those
//! regions when it is dropped.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::region_map::RegionMap;

/// Caching attribute of a memory dataspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Cacheability {
    /// Normal cached memory.
    #[default]
    Cached,
    /// Write-combined, typically frame buffers.
    WriteCombined,
    /// Uncached device memory.
    Uncached,
}

/// Region map side of an attachment, notified when a dataspace vanishes.
pub(crate) trait AttachmentOwner: Send + Sync {
    /// Removes the region at `base` if it is still backed by `ds`.
    fn release(&self, base: usize, ds: *const MemoryDataspace);
}

struct Attachment {
    owner: Weak<dyn AttachmentOwner>,
    owner_key: usize,
    base: usize,
}

/// Plain memory object with a fixed size and source address.
pub struct MemoryDataspace {
    size: usize,
    phys_addr: usize,
    writable: bool,
    io_mem: bool,
    cacheability: Cacheability,
    attachments: Mutex<Vec<Attachment>>,
}

impl core::fmt::Debug for MemoryDataspace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryDataspace")
            .field("size", &self.size)
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr))
            .field("writable", &self.writable)
            .field("io_mem", &self.io_mem)
            .field("cacheability", &self.cacheability)
            .finish()
    }
}

impl MemoryDataspace {
    /// Writable cached RAM of `size` bytes at source address 0.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            phys_addr: 0,
            writable: true,
            io_mem: false,
            cacheability: Cacheability::Cached,
            attachments: Mutex::new(Vec::new()),
        }
    }

    /// Sets the source address mappings are taken from.
    pub fn with_phys_addr(mut self, phys_addr: usize) -> Self {
        self.phys_addr = phys_addr;
        self
    }

    /// Forbids writable mappings.
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    /// Marks the dataspace as device memory with the given caching attribute.
    pub fn io_mem(mut self, cacheability: Cacheability) -> Self {
        self.io_mem = true;
        self.cacheability = cacheability;
        self
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Source address of the first byte.
    pub fn phys_addr(&self) -> usize {
        self.phys_addr
    }

    /// Whether the dataspace may be mapped writable.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Whether the dataspace is device memory.
    pub fn is_io_mem(&self) -> bool {
        self.io_mem
    }

    /// Caching attribute.
    pub fn cacheability(&self) -> Cacheability {
        self.cacheability
    }

    /// Number of regions currently backed by this dataspace.
    pub fn attachment_count(&self) -> usize {
        self.attachments.lock().len()
    }

    pub(crate) fn attached_to(&self, owner: Weak<dyn AttachmentOwner>, owner_key: usize, base: usize) {
        self.attachments.lock().push(Attachment { owner, owner_key, base });
    }

    pub(crate) fn detached_from(&self, owner_key: usize, base: usize) {
        let mut attachments = self.attachments.lock();
        if let Some(pos) = attachments.iter().position(|a| a.owner_key == owner_key && a.base == base) {
            attachments.swap_remove(pos);
        }
    }
}

impl Drop for MemoryDataspace {
    fn drop(&mut self) {
        let attachments = core::mem::take(self.attachments.get_mut());
        let me: *const MemoryDataspace = self;
        for attachment in attachments {
            if let Some(owner) = attachment.owner.upgrade() {
                owner.release(attachment.base, me);
            }
        }
    }
}

/// Region map exposed as a dataspace.
#[derive(Clone, Debug)]
pub struct ManagedDataspace {
    map: Arc<RegionMap>,
}

impl ManagedDataspace {
    pub(crate) fn new(map: Arc<RegionMap>) -> Self {
        Self { map }
    }

    /// Size fixed when the sub region map was created.
    pub fn size(&self) -> usize {
        self.map.size()
    }

    /// Managed dataspaces have no source address of their own.
    pub fn phys_addr(&self) -> usize {
        0
    }

    /// Managed dataspaces are always writable, permissions come from the
    /// regions inside.
    pub fn writable(&self) -> bool {
        true
    }

    /// The region map populating this dataspace.
    pub fn sub_region_map(&self) -> &Arc<RegionMap> {
        &self.map
    }
}

/// Strong handle on a live dataspace.
#[derive(Clone, Debug)]
pub enum Dataspace {
    /// Ordinary memory.
    Memory(Arc<MemoryDataspace>),
    /// A sub region map.
    Managed(ManagedDataspace),
}

impl Dataspace {
    /// Size in bytes.
    pub fn size(&self) -> usize {
        match self {
            Dataspace::Memory(ds) => ds.size(),
            Dataspace::Managed(ds) => ds.size(),
        }
    }

    /// Source address of the first byte.
    pub fn phys_addr(&self) -> usize {
        match self {
            Dataspace::Memory(ds) => ds.phys_addr(),
            Dataspace::Managed(ds) => ds.phys_addr(),
        }
    }

    /// Whether the dataspace may be mapped writable.
    pub fn writable(&self) -> bool {
        match self {
            Dataspace::Memory(ds) => ds.writable(),
            Dataspace::Managed(ds) => ds.writable(),
        }
    }

    /// Non-owning reference stored in regions.
    pub fn downgrade(&self) -> DataspaceRef {
        match self {
            Dataspace::Memory(ds) => DataspaceRef::Memory(Arc::downgrade(ds)),
            Dataspace::Managed(ds) => DataspaceRef::Managed(Arc::downgrade(&ds.map)),
        }
    }
}

/// Non-owning dataspace reference held by regions.
#[derive(Clone, Debug)]
pub enum DataspaceRef {
    /// Ordinary memory.
    Memory(Weak<MemoryDataspace>),
    /// A sub region map.
    Managed(Weak<RegionMap>),
}

impl DataspaceRef {
    /// Returns the dataspace if it is still alive.
    pub fn upgrade(&self) -> Option<Dataspace> {
        match self {
            DataspaceRef::Memory(ds) => ds.upgrade().map(Dataspace::Memory),
            DataspaceRef::Managed(map) => {
                map.upgrade().map(|map| Dataspace::Managed(ManagedDataspace::new(map)))
            }
        }
    }

    /// Returns `true` if this references the memory dataspace at `ds`.
    pub(crate) fn is_memory(&self, ds: *const MemoryDataspace) -> bool {
        matches!(self, DataspaceRef::Memory(weak) if core::ptr::eq(weak.as_ptr(), ds))
    }
}

/// Capability naming a dataspace. May be invalid or outlive its target.
#[derive(Clone, Debug, Default)]
pub struct DataspaceCapability(Option<DataspaceRef>);

impl DataspaceCapability {
    /// Capability that never resolves.
    pub fn invalid() -> Self {
        Self(None)
    }

    /// Returns the dataspace if the capability is valid and the target alive.
    pub fn resolve(&self) -> Option<Dataspace> {
        self.0.as_ref().and_then(DataspaceRef::upgrade)
    }

    /// Returns `true` if the capability resolves.
    pub fn is_valid(&self) -> bool {
        self.resolve().is_some()
    }
}

impl From<&Arc<MemoryDataspace>> for DataspaceCapability {
    fn from(ds: &Arc<MemoryDataspace>) -> Self {
        Self(Some(DataspaceRef::Memory(Arc::downgrade(ds))))
    }
}

impl From<&Dataspace> for DataspaceCapability {
    fn from(ds: &Dataspace) -> Self {
        Self(Some(ds.downgrade()))
    }
}

impl From<DataspaceRef> for DataspaceCapability {
    fn from(ds: DataspaceRef) -> Self {
        Self(Some(ds))
    }
}
