// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Attached sub-ranges of a region map and the arguments that create them.

use crate::config::Config;
use crate::dataspace::DataspaceRef;
use crate::error::{Error, Result};

/// One attachment: `[base, base + size)` backed by a dataspace at `offset`.
///
/// A region with `size == 0` is an empty slot. The dataspace reference is
/// non-owning, the dataspace may disappear while the region still exists.
#[derive(Clone, Debug)]
pub struct Region<D = DataspaceRef> {
    base: usize,
    size: usize,
    offset: usize,
    writable: bool,
    executable: bool,
    dataspace: Option<D>,
}

impl<D> Default for Region<D> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<D> Region<D> {
    /// Creates a writable, non-executable region.
    pub fn new(base: usize, size: usize, dataspace: D, offset: usize) -> Self {
        Self { base, size, offset, writable: true, executable: false, dataspace: Some(dataspace) }
    }

    /// Returns the value stored in free slots.
    pub const fn empty() -> Self {
        Self { base: 0, size: 0, offset: 0, writable: false, executable: false, dataspace: None }
    }

    /// Overrides the access permissions of the region.
    pub fn with_permissions(mut self, writable: bool, executable: bool) -> Self {
        self.writable = writable;
        self.executable = executable;
        self
    }

    /// First address covered by the region.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Length of the region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Byte offset of `base` within the dataspace.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether the region may be mapped writable.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Whether the region may be mapped executable.
    pub fn executable(&self) -> bool {
        self.executable
    }

    /// Non-owning reference to the backing dataspace.
    pub fn dataspace(&self) -> Option<&D> {
        self.dataspace.as_ref()
    }

    /// Returns `true` unless this is an empty slot.
    pub fn used(&self) -> bool {
        self.size > 0
    }

    /// One past the last covered address, saturating at the top of the address space.
    pub fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    /// Returns `true` if `addr` lies inside the region.
    pub fn contains(&self, addr: usize) -> bool {
        self.used() && addr >= self.base && addr - self.base < self.size
    }

    /// Returns `true` if both regions are used and their ranges overlap.
    pub fn intersects<E>(&self, other: &Region<E>) -> bool {
        self.used() && other.used() && self.base < other.end() && other.base < self.end()
    }
}

/// Parameters of an attach request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachArgs {
    /// Bytes to attach, `0` attaches the dataspace from `offset` to its end.
    pub size: usize,
    /// Byte offset into the dataspace, must not be negative.
    pub offset: isize,
    /// Fixed local address, or `None` to let the region map choose.
    pub at: Option<usize>,
    /// Map the region executable.
    pub executable: bool,
    /// Map the region writable.
    pub writable: bool,
}

impl Default for AttachArgs {
    fn default() -> Self {
        Self { size: 0, offset: 0, at: None, executable: false, writable: true }
    }
}

impl AttachArgs {
    /// Attaches `size` bytes of the dataspace at an address chosen by the map.
    pub fn sized(size: usize) -> Self {
        Self { size, ..Self::default() }
    }

    /// Requests the fixed local address `addr`.
    pub fn at(mut self, addr: usize) -> Self {
        self.at = Some(addr);
        self
    }

    /// Starts the attachment at `offset` within the dataspace.
    pub fn offset(mut self, offset: isize) -> Self {
        self.offset = offset;
        self
    }

    /// Attaches the region read-only.
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    /// Attaches the region executable.
    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }

    /// Validates the request against a dataspace of `ds_size` bytes.
    ///
    /// Returns the page-aligned region size and the dataspace offset.
    pub(crate) fn extent(&self, config: &Config, ds_size: usize) -> Result<(usize, usize)> {
        let offset = usize::try_from(self.offset).map_err(|_| Error::InvalidArgs)?;
        if offset >= ds_size {
            return Err(Error::InvalidDataspace);
        }
        let size = if self.size == 0 { ds_size - offset } else { self.size };
        match offset.checked_add(size) {
            Some(end) if end <= ds_size => {}
            _ => return Err(Error::InvalidArgs),
        }
        let size = config.align_up(size).ok_or(Error::InvalidArgs)?;
        if let Some(addr) = self.at {
            if !config.is_aligned(addr) || addr.checked_add(size).is_none() {
                return Err(Error::InvalidArgs);
            }
        }
        Ok((size, offset))
    }
}
