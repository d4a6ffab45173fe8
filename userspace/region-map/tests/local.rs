// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for eagerly mapped local region maps
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//!
//! TEST_SCOPE:
//!   - Eager mapping through a recording backing
//!   - Sub map reservation and deferred mapping
//!   - Sub map attach-once state machine and teardown
//!
//! TEST_SCENARIOS:
//!   - sub_map_regions_mapped_on_attach(): recorded regions appear once attached
//!   - attach_into_attached_sub_map(): mapping lands at parent base plus address
//!   - sub_map_attaches_once(): second attach fails, state unchanged
//!   - dropping_sub_map_unmaps_range(): parent region and mappings disappear
//!   - dropping_root_stops_mapping_sub_map(): orphaned sub map only records regions

use std::sync::Arc;

use nexus_region_map::local::MappedRange;
use nexus_region_map::{
    AttachArgs, AttachState, Config, Error, LocalDataspace, LocalRegionMap, MemoryDataspace,
    RecordingBacking,
};

fn config() -> Config {
    Config { max_regions: 16, ..Config::default() }
}

fn memory(size: usize, phys: usize) -> LocalDataspace {
    LocalDataspace::Memory(Arc::new(MemoryDataspace::new(size).with_phys_addr(phys)))
}

#[test]
fn sub_map_regions_mapped_on_attach() {
    let backing = RecordingBacking::new();
    let root = LocalRegionMap::new(config(), backing.clone()).unwrap();
    let sub = LocalRegionMap::new_sub(config(), backing.clone(), 0x8000).unwrap();

    let ds = memory(0x1000, 0x9000);
    sub.attach(&ds, AttachArgs::default().at(0x2000)).unwrap();
    assert_eq!(backing.mapping_count(), 0);
    assert_eq!(sub.attach_state(), AttachState::Unattached);

    let base = root.attach(&LocalDataspace::SubMap(sub.clone()), AttachArgs::default().at(0x40_000)).unwrap();
    assert_eq!(base, 0x40_000);
    assert!(backing.is_reserved(0x40_000));
    assert_eq!(sub.attach_state(), AttachState::Attached { base: 0x40_000 });
    let (at, range) = backing.mapping_at(0x42_000).unwrap();
    assert_eq!(at, 0x42_000);
    assert_eq!(range.src, 0x9000);
}

#[test]
fn attach_into_attached_sub_map() {
    let backing = RecordingBacking::new();
    let root = LocalRegionMap::new(config(), backing.clone()).unwrap();
    let sub = LocalRegionMap::new_sub(config(), backing.clone(), 0x8000).unwrap();
    root.attach(&LocalDataspace::SubMap(sub.clone()), AttachArgs::default().at(0x40_000)).unwrap();

    let ds = memory(0x2000, 0x10_000);
    let addr = sub.attach(&ds, AttachArgs::default().at(0x4000).read_only()).unwrap();
    assert_eq!(addr, 0x4000);
    assert_eq!(
        backing.mapping_at(0x44_000),
        Some((0x44_000, MappedRange { size: 0x2000, src: 0x10_000, writable: false, executable: false }))
    );

    sub.detach(addr);
    assert!(backing.mapping_at(0x44_000).is_none());
    assert!(!sub.region_at(addr).used());
}

#[test]
fn sub_map_attaches_once() {
    let backing = RecordingBacking::new();
    let first = LocalRegionMap::new(config(), backing.clone()).unwrap();
    let second = LocalRegionMap::new(config(), backing.clone()).unwrap();
    let sub = LocalRegionMap::new_sub(config(), backing.clone(), 0x4000).unwrap();

    let base = first.attach(&LocalDataspace::SubMap(sub.clone()), AttachArgs::default()).unwrap();
    assert_eq!(
        first.attach(&LocalDataspace::SubMap(sub.clone()), AttachArgs::default()),
        Err(Error::AlreadyAttached)
    );
    assert_eq!(
        second.attach(&LocalDataspace::SubMap(sub.clone()), AttachArgs::default().at(0x80_000)),
        Err(Error::AlreadyAttached)
    );
    assert_eq!(sub.attach_state(), AttachState::Attached { base });
    assert!(!second.region_at(0x80_000).used());
}

#[test]
fn nesting_limited_to_one_level() {
    let backing = RecordingBacking::new();
    let sub = LocalRegionMap::new_sub(config(), backing.clone(), 0x4000).unwrap();
    let inner = LocalRegionMap::new_sub(config(), backing.clone(), 0x1000).unwrap();
    let root = LocalRegionMap::new(config(), backing.clone()).unwrap();
    let other_root = LocalRegionMap::new(config(), backing).unwrap();

    assert_eq!(sub.attach(&LocalDataspace::SubMap(inner.clone()), AttachArgs::default()), Err(Error::NestingTooDeep));
    assert_eq!(root.attach(&LocalDataspace::SubMap(other_root), AttachArgs::default()), Err(Error::InvalidDataspace));
    assert_eq!(inner.attach_state(), AttachState::Unattached);
}

#[test]
fn attach_respects_sub_map_bounds() {
    let backing = RecordingBacking::new();
    let sub = LocalRegionMap::new_sub(config(), backing, 0x4000).unwrap();
    let small = memory(0x2000, 0);
    let large = memory(0x8000, 0);
    assert_eq!(sub.attach(&small, AttachArgs::default().at(0x3000)), Err(Error::RegionConflict));
    assert_eq!(sub.attach(&large, AttachArgs::default()), Err(Error::RegionConflict));
    assert_eq!(sub.attach(&small, AttachArgs::default()), Ok(0));
}

#[test]
fn detach_unknown_address_is_noop() {
    let backing = RecordingBacking::new();
    let root = LocalRegionMap::new(config(), backing.clone()).unwrap();
    let ds = memory(0x1000, 0);
    let base = root.attach(&ds, AttachArgs::default()).unwrap();
    root.detach(base + 0x1000);
    assert!(root.region_at(base).used());
    assert_eq!(backing.mapping_count(), 1);
}

#[test]
fn parent_detach_stops_mapping_sub_regions() {
    let backing = RecordingBacking::new();
    let root = LocalRegionMap::new(config(), backing.clone()).unwrap();
    let sub = LocalRegionMap::new_sub(config(), backing.clone(), 0x4000).unwrap();
    let base = root.attach(&LocalDataspace::SubMap(sub.clone()), AttachArgs::default()).unwrap();
    let first = memory(0x1000, 0);
    let second = memory(0x1000, 0);
    sub.attach(&first, AttachArgs::default().at(0)).unwrap();
    assert_eq!(backing.mapping_count(), 1);

    root.detach(base);
    assert_eq!(backing.mapping_count(), 0);
    assert!(!backing.is_reserved(base));
    sub.attach(&second, AttachArgs::default().at(0x1000)).unwrap();
    assert_eq!(backing.mapping_count(), 0);
}

#[test]
fn dropping_sub_map_unmaps_range() {
    let backing = RecordingBacking::new();
    let root = LocalRegionMap::new(config(), backing.clone()).unwrap();
    let sub = LocalRegionMap::new_sub(config(), backing.clone(), 0x4000).unwrap();
    let base = root.attach(&LocalDataspace::SubMap(sub.clone()), AttachArgs::default()).unwrap();
    let ds = memory(0x1000, 0);
    sub.attach(&ds, AttachArgs::default().at(0x1000)).unwrap();
    assert_eq!(backing.mapping_count(), 1);

    drop(sub);
    assert!(!root.region_at(base).used());
    assert_eq!(backing.mapping_count(), 0);
    assert!(!backing.is_reserved(base));
}

#[test]
fn dropping_dataspace_unmaps_it() {
    let backing = RecordingBacking::new();
    let root = LocalRegionMap::new(config(), backing.clone()).unwrap();
    let ds = Arc::new(MemoryDataspace::new(0x1000));
    let base = root.attach(&LocalDataspace::Memory(ds.clone()), AttachArgs::default()).unwrap();
    assert_eq!(ds.attachment_count(), 1);
    drop(ds);
    assert!(!root.region_at(base).used());
    assert_eq!(backing.mapping_count(), 0);
}

#[test]
fn dropping_root_stops_mapping_sub_map() {
    let backing = RecordingBacking::new();
    let root = LocalRegionMap::new(config(), backing.clone()).unwrap();
    let sub = LocalRegionMap::new_sub(config(), backing.clone(), 0x4000).unwrap();
    root.attach(&LocalDataspace::SubMap(sub.clone()), AttachArgs::default().at(0x10_000)).unwrap();

    drop(root);
    assert!(!backing.is_reserved(0x10_000));
    assert_eq!(sub.attach_state(), AttachState::Attached { base: 0x10_000 });

    let ds = memory(0x1000, 0);
    sub.attach(&ds, AttachArgs::default().at(0)).unwrap();
    assert!(sub.region_at(0).used());
    assert!(backing.mapping_at(0x10_000).is_none());
    assert_eq!(backing.mapping_count(), 0);
}

#[test]
fn invalid_config_rejected() {
    let backing = RecordingBacking::new();
    let bad = Config { page_size_log2: 64, ..config() };
    assert_eq!(LocalRegionMap::new(bad, backing.clone()).unwrap_err(), Error::InvalidConfig);
    let empty = Config { max_regions: 0, ..config() };
    assert_eq!(LocalRegionMap::new_sub(empty, backing, 0x1000).unwrap_err(), Error::InvalidConfig);
}
