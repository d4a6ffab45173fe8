// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity region arena with conflict-checked insertion.

use thiserror::Error;

use crate::dataspace::DataspaceRef;
use crate::region::Region;

/// Index of a slot inside a [`RegionTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegionId(usize);

impl RegionId {
    /// Returns the slot index.
    pub fn index(self) -> usize {
        self.0
    }

    /// Wraps a raw slot index, e.g. one received from a client.
    pub fn from_raw(index: usize) -> Self {
        Self(index)
    }
}

/// Reasons an insertion is refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// Every slot is occupied.
    #[error("no free region slot")]
    OutOfMetadata,
    /// The region overlaps a used slot.
    #[error("region overlaps an existing region")]
    Conflict,
}

/// Bounded collection of regions. No two used slots ever intersect.
#[derive(Debug)]
pub struct RegionTable<D = DataspaceRef> {
    slots: Box<[Region<D>]>,
    used: usize,
}

impl<D: Clone> RegionTable<D> {
    /// Creates a table with `capacity` empty slots.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Region::empty()).collect::<Vec<_>>().into_boxed_slice();
        Self { slots, used: 0 }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of used slots.
    pub fn len(&self) -> usize {
        self.used
    }

    /// Returns `true` if no slot is used.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Stores `region` in the first free slot.
    pub fn add(&mut self, region: Region<D>) -> Result<RegionId, InsertError> {
        if self.slots.iter().any(|slot| slot.intersects(&region)) {
            return Err(InsertError::Conflict);
        }
        let index =
            self.slots.iter().position(|slot| !slot.used()).ok_or(InsertError::OutOfMetadata)?;
        self.slots[index] = region;
        self.used += 1;
        Ok(RegionId(index))
    }

    /// Returns the region in slot `id`, or an empty region for an invalid id.
    pub fn get(&self, id: RegionId) -> Region<D> {
        self.slots.get(id.0).cloned().unwrap_or_default()
    }

    /// Returns the used region starting at `base`, or an empty region.
    pub fn find_by_base(&self, base: usize) -> Region<D> {
        self.slots
            .iter()
            .find(|slot| slot.used() && slot.base() == base)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the used region covering `addr`, if any.
    pub fn find_containing(&self, addr: usize) -> Option<&Region<D>> {
        self.slots.iter().find(|slot| slot.contains(addr))
    }

    /// Clears every used slot starting at `base` and returns the removed regions.
    pub fn remove_by_base(&mut self, base: usize) -> Vec<Region<D>> {
        let mut removed = Vec::new();
        for slot in self.slots.iter_mut().filter(|slot| slot.used() && slot.base() == base) {
            removed.push(core::mem::take(slot));
        }
        self.used -= removed.len();
        removed
    }

    /// Iterates over used slots.
    pub fn iter(&self) -> impl Iterator<Item = (RegionId, &Region<D>)> {
        self.slots.iter().enumerate().filter(|(_, slot)| slot.used()).map(|(i, s)| (RegionId(i), s))
    }

    /// Empties the table, returning every used region.
    pub fn drain(&mut self) -> Vec<Region<D>> {
        self.used = 0;
        self.slots.iter_mut().filter(|slot| slot.used()).map(core::mem::take).collect()
    }

    /// Finds the lowest `2^align_log2`-aligned address in `[start, end)` where
    /// `size` bytes fit without touching a used slot. `end == None` stands for
    /// the top of the address space.
    pub fn find_free(
        &self,
        start: usize,
        end: Option<usize>,
        size: usize,
        align_log2: u32,
    ) -> Option<usize> {
        if size == 0 || align_log2 >= usize::BITS {
            return None;
        }
        let limit = end.map_or(1u128 << usize::BITS, |end| end as u128);
        let align = 1u128 << align_log2;
        let fits = |gap_start: u128, gap_end: u128| -> Option<usize> {
            let candidate = (gap_start + align - 1) & !(align - 1);
            let candidate_end = candidate + size as u128;
            (candidate_end <= gap_end.min(limit)).then_some(candidate as usize)
        };

        let mut used: Vec<(u128, u128)> =
            self.iter().map(|(_, r)| (r.base() as u128, r.base() as u128 + r.size() as u128)).collect();
        used.sort_unstable();

        let mut cursor = start as u128;
        for (base, region_end) in used {
            if region_end <= cursor {
                continue;
            }
            if base > cursor {
                if let Some(found) = fits(cursor, base) {
                    return Some(found);
                }
            }
            cursor = cursor.max(region_end);
            if cursor >= limit {
                return None;
            }
        }
        fits(cursor, limit)
    }
}
