// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host-first region maps: user-level virtual address spaces with demand
//! paging, managed dataspaces and fault forwarding.
//!
//! A [`RegionMap`] tracks which dataspaces are attached at which addresses.
//! Threads bound to it via [`RegionMap::add_client`] resolve their page
//! faults through [`Pageable::pager`]: the fault address is looked up (one
//! level of managed dataspaces deep) and either turned into a [`Mapping`] or
//! reported to the fault handler registered at the responsible region map,
//! where the thread stays parked until an attach covers the address.
//!
//! [`LocalRegionMap`] is the eager variant used for a component's own
//! address space: mappings are installed at attach time through a
//! [`Backing`].

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod cli;
pub mod client;
pub mod config;
pub mod dataspace;
pub mod error;
pub mod fault;
pub mod faulter;
pub mod local;
pub mod region;
pub mod region_map;
pub mod signal;
pub mod table;

pub use cli::{execute, help, run};
pub use client::{FaulterRecord, MapMember, Pageable, PagerCapability, Resolution, RmClient};
pub use config::{Config, ConfigError};
pub use dataspace::{Cacheability, Dataspace, DataspaceCapability, ManagedDataspace, MemoryDataspace};
pub use error::{Error, FaultError, Result};
pub use fault::{FaultArea, FaultType, MapFlags, Mapping, PageFault, State};
pub use faulter::{Faulter, PagerObject, ThreadCapability};
pub use local::{AttachState, Backing, LocalDataspace, LocalRegionMap, RecordingBacking};
pub use region::{AttachArgs, Region};
pub use region_map::{Lookup, Miss, RegionMap};
pub use signal::{SignalContext, SignalContextCapability};
pub use table::{InsertError, RegionId, RegionTable};
