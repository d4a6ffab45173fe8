// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-fault records and flexpage arithmetic for mapping selection.
//!
//! A [`FaultArea`] starts out covering the whole address space around the
//! faulting address and is narrowed by every constraint a lookup passes
//! through: the region, the dataspace, and finally the largest flexpage the
//! source and destination side agree on.

use bitflags::bitflags;

use crate::dataspace::Cacheability;

/// Access that triggered a page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultType {
    /// Load from an unmapped address.
    Read,
    /// Store to an unmapped or read-only address.
    Write,
    /// Instruction fetch from an unmapped or non-executable address.
    Exec,
}

/// Pending-fault report of a region map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum State {
    /// No faulter is parked at the map.
    #[default]
    Ready,
    /// The oldest parked faulter touched `addr` with `kind`.
    Faulted {
        /// Access that faulted.
        kind: FaultType,
        /// Map-relative fault address.
        addr: usize,
    },
}

/// Page fault as delivered by the kernel layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting virtual address.
    pub addr: usize,
    /// Instruction pointer at the time of the fault.
    pub ip: usize,
    /// Access that faulted.
    pub kind: FaultType,
}

impl PageFault {
    /// Creates a fault record.
    pub fn new(addr: usize, ip: usize, kind: FaultType) -> Self {
        Self { addr, ip, kind }
    }
}

/// Naturally aligned window around a fault address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultArea {
    fault_addr: usize,
    base: usize,
    // usize::BITS: unbounded, 0: invalid
    size_log2: u32,
}

impl FaultArea {
    /// Area spanning the whole address space around `fault_addr`.
    pub fn new(fault_addr: usize) -> Self {
        Self { fault_addr, base: 0, size_log2: usize::BITS }
    }

    /// Area that no mapping can come from.
    pub fn invalid() -> Self {
        Self { fault_addr: 0, base: 0, size_log2: 0 }
    }

    /// Address the area is centred on.
    pub fn fault_addr(&self) -> usize {
        self.fault_addr
    }

    /// First address of the area.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Log2 of the area size; `usize::BITS` for an unconstrained area.
    pub fn size_log2(&self) -> u32 {
        self.size_log2
    }

    /// `false` once a constraint excluded the fault address.
    pub fn valid(&self) -> bool {
        self.size_log2 > 0
    }

    /// Last address of the area.
    fn upper_bound(&self) -> usize {
        if self.size_log2 >= usize::BITS {
            usize::MAX
        } else {
            self.base + ((1usize << self.size_log2) - 1)
        }
    }

    /// Returns `true` if `addr` lies inside a valid area.
    pub fn contains(&self, addr: usize) -> bool {
        self.valid() && addr >= self.base && addr <= self.upper_bound()
    }

    /// Narrows the area to the largest flexpage around the fault address that
    /// fits both the current area and `[region_base, region_base + region_size)`.
    ///
    /// Invalidates the area if not even a single page fits.
    pub fn constrain(&mut self, region_base: usize, region_size: usize, page_size_log2: u32) {
        let region_last = match region_size.checked_sub(1).and_then(|n| region_base.checked_add(n)) {
            Some(last) => last,
            None => {
                *self = Self { fault_addr: self.fault_addr, ..Self::invalid() };
                return;
            }
        };

        let mut best = None;
        for try_size_log2 in page_size_log2..usize::BITS {
            let span = (1usize << try_size_log2) - 1;
            let try_base = self.fault_addr & !span;
            let try_last = try_base + span;
            if try_base < self.base || try_last > self.upper_bound() {
                break;
            }
            if try_base < region_base || try_last > region_last {
                break;
            }
            best = Some((try_base, try_size_log2));
        }

        match best {
            Some((base, size_log2)) => {
                self.base = base;
                self.size_log2 = size_log2;
            }
            None => {
                self.base = 0;
                self.size_log2 = 0;
            }
        }
    }

    /// Shrinks the area to a flexpage of `2^size_log2` bytes. Larger sizes
    /// leave the area unchanged.
    pub fn constrain_size(&mut self, size_log2: u32) {
        if size_log2 >= self.size_log2 {
            return;
        }
        self.base = self.fault_addr & !((1usize << size_log2) - 1);
        self.size_log2 = size_log2;
    }

    /// Largest flexpage size for which the fault address has the same offset
    /// relative to the flexpage base in both areas.
    pub fn common_size_log2(a: &FaultArea, b: &FaultArea, page_size_log2: u32) -> u32 {
        let diff = (a.fault_addr - a.base) ^ (b.fault_addr - b.base);
        let limit = a.size_log2.min(b.size_log2).min(usize::BITS - 1);
        let mut n = page_size_log2;
        while n < limit && diff & (1usize << n) == 0 {
            n += 1;
        }
        n
    }
}

bitflags! {
    /// Access rights and memory type of a mapping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Writes are allowed.
        const WRITABLE   = 1 << 0;
        /// Instruction fetches are allowed.
        const EXECUTABLE = 1 << 1;
        /// The source is device memory.
        const IO_MEM     = 1 << 2;
    }
}

/// Mapping the kernel layer installs to resolve a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// Destination flexpage base in the faulting address space.
    pub dst_base: usize,
    /// Source flexpage base in physical (or backing) memory.
    pub src_base: usize,
    /// Log2 of the flexpage size.
    pub size_log2: u32,
    /// Access rights and memory type.
    pub flags: MapFlags,
    /// Caching attribute of the source memory.
    pub cacheability: Cacheability,
}

impl Mapping {
    /// Size of the flexpage in bytes.
    pub fn size(&self) -> usize {
        1usize << self.size_log2
    }

    /// Whether the mapping grants write access.
    pub fn writable(&self) -> bool {
        self.flags.contains(MapFlags::WRITABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PAGE: u32 = 12;

    #[test]
    fn fresh_area_is_unbounded() {
        let area = FaultArea::new(0x1234);
        assert!(area.valid());
        assert!(area.contains(0));
        assert!(area.contains(usize::MAX));
        assert_eq!(area.size_log2(), usize::BITS);
    }

    #[test]
    fn constrain_picks_largest_fitting_flexpage() {
        let mut area = FaultArea::new(0x1800);
        area.constrain(0x1000, 0x2000, PAGE);
        assert_eq!((area.base(), area.size_log2()), (0x1000, 12));

        let mut area = FaultArea::new(0x2800);
        area.constrain(0x0, 0x10_000, PAGE);
        assert_eq!((area.base(), area.size_log2()), (0x0, 16));

        let mut area = FaultArea::new(0x5300);
        area.constrain(0x4000, 0x4000, PAGE);
        assert_eq!((area.base(), area.size_log2()), (0x4000, 14));
    }

    #[test]
    fn constrain_outside_region_invalidates() {
        let mut area = FaultArea::new(0x800);
        area.constrain(0x1000, 0x1000, PAGE);
        assert!(!area.valid());

        let mut area = FaultArea::new(0x1000);
        area.constrain(0x1000, 0, PAGE);
        assert!(!area.valid());
    }

    #[test]
    fn constrain_never_widens() {
        let mut area = FaultArea::new(0x3000);
        area.constrain(0x2000, 0x2000, PAGE);
        assert_eq!((area.base(), area.size_log2()), (0x2000, 13));
        area.constrain(0x0, 0x100_000, PAGE);
        assert_eq!((area.base(), area.size_log2()), (0x2000, 13));
        area.constrain(0x3000, 0x1000, PAGE);
        assert_eq!((area.base(), area.size_log2()), (0x3000, 12));
    }

    #[test]
    fn constrain_size_shrinks_only() {
        let mut area = FaultArea::new(0x3456);
        area.constrain(0x0, 0x10_000, PAGE);
        area.constrain_size(20);
        assert_eq!(area.size_log2(), 16);
        area.constrain_size(12);
        assert_eq!((area.base(), area.size_log2()), (0x3000, 12));
    }

    #[test]
    fn common_size_follows_matching_offsets() {
        let mut dst = FaultArea::new(0x10_3000);
        dst.constrain(0x10_0000, 0x10_0000, PAGE);
        let mut src = FaultArea::new(0x40_3000);
        src.constrain(0x40_0000, 0x10_0000, PAGE);
        assert_eq!(FaultArea::common_size_log2(&dst, &src, PAGE), 20);

        let mut src = FaultArea::new(0x40_1000);
        src.constrain(0x40_0000, 0x10_0000, PAGE);
        assert_eq!(FaultArea::common_size_log2(&dst, &src, PAGE), 13);
    }

    #[test]
    fn mapping_flags() {
        let mapping = Mapping {
            dst_base: 0x1000,
            src_base: 0x8000,
            size_log2: 12,
            flags: MapFlags::WRITABLE | MapFlags::EXECUTABLE,
            cacheability: Cacheability::Cached,
        };
        assert_eq!(mapping.size(), 0x1000);
        assert!(mapping.writable());
    }

    proptest! {
        #[test]
        fn constrained_area_stays_inside_region(
            page in 0usize..4096,
            region_pages in 1usize..512,
            offset_pages in 0usize..512,
        ) {
            let region_base = page << PAGE;
            let region_size = region_pages << PAGE;
            let fault = region_base + ((offset_pages % region_pages) << PAGE) + 0x123;
            let mut area = FaultArea::new(fault);
            area.constrain(region_base, region_size, PAGE);
            prop_assert!(area.valid());
            prop_assert!(area.contains(fault));
            prop_assert!(area.base() >= region_base);
            prop_assert!(area.base() + (1usize << area.size_log2()) <= region_base + region_size);
            prop_assert_eq!(area.base() & ((1usize << area.size_log2()) - 1), 0);
        }
    }
}
