// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Member threads of a region map and their page-fault handling.
//!
//! An [`RmClient`] binds a thread to the region map that serves as its
//! address space. When the thread faults, [`Pageable::pager`] looks the
//! address up and either yields a [`Mapping`] for the kernel layer to
//! install or parks the thread at the responsible region map until its fault
//! handler attaches something.

use std::sync::{Arc, Weak};

use log::{debug, error, warn};

use crate::error::FaultError;
use crate::fault::{FaultType, Mapping, PageFault};
use crate::faulter::{Faulter, PagerObject};
use crate::region_map::{Parking, RegionMap};

/// Outcome of a page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Install this mapping and resume the thread.
    Map(Mapping),
    /// The fault was reported to a fault handler; the thread stays blocked
    /// until the handler resolves it. `addr` is relative to the region map
    /// the fault was reported at.
    Forwarded {
        /// Map-relative fault address.
        addr: usize,
    },
    /// Nobody can resolve the fault.
    Fatal(FaultError),
}

/// Link from a thread to the region map it lives in.
pub trait MapMember {
    /// Region map serving as the thread's address space, if still alive.
    fn member_region_map(&self) -> Option<Arc<RegionMap>>;
}

/// Access to the fault record of a thread.
pub trait FaulterRecord {
    /// Fault record used to park the thread.
    fn faulter(&self) -> &Arc<Faulter>;
}

/// Page-fault handling for a member thread.
pub trait Pageable: MapMember + FaulterRecord {
    /// The thread as seen by the kernel layer.
    fn pager_object(&self) -> &Arc<dyn PagerObject>;

    /// Resolves `fault` to a mapping, or reports it to the fault handler of
    /// the responsible region map.
    fn pager(&self, fault: &PageFault) -> Resolution {
        let pager = self.pager_object();
        let Some(member) = self.member_region_map() else {
            error!("rm: page fault at {:#x} (badge {}) without region map", fault.addr, pager.badge());
            pager.unresolved_page_fault_occurred();
            return Resolution::Fatal(FaultError::NoRegionMap);
        };
        let config = member.config();
        if config.verbose_page_faults {
            debug!(
                "rm: page fault {:?} addr={:#x} ip={:#x} badge={}",
                fault.kind,
                fault.addr,
                fault.ip,
                pager.badge()
            );
        }

        loop {
            let (responsible, addr, epoch) = match member.reverse_lookup(fault.addr) {
                Ok(lookup) => {
                    let denied = match fault.kind {
                        FaultType::Read => false,
                        FaultType::Write => !lookup.writable,
                        FaultType::Exec => !lookup.executable,
                    };
                    if !denied && lookup.congruent(config.page_size_log2) {
                        return Resolution::Map(lookup.mapping());
                    }
                    if denied {
                        warn!(
                            "rm: {:?} fault at {:#x} (badge {}) not permitted by region",
                            fault.kind,
                            fault.addr,
                            pager.badge()
                        );
                    }
                    (lookup.region_map, lookup.local_addr, lookup.epoch)
                }
                Err(miss) => {
                    if Arc::ptr_eq(&miss.region_map, &member) {
                        warn!(
                            "rm: no attachment at {:#x} (ip {:#x}, badge {})",
                            fault.addr,
                            fault.ip,
                            pager.badge()
                        );
                    }
                    (miss.region_map, miss.addr, miss.epoch)
                }
            };

            match responsible.park(self.faulter(), addr, fault.kind, Some(epoch)) {
                Ok(Parking::Parked) => return Resolution::Forwarded { addr },
                Ok(Parking::Stale) => continue,
                Err(err) => {
                    error!(
                        "rm: unresolvable page fault at {:#x} (ip {:#x}, badge {}): {}",
                        fault.addr,
                        fault.ip,
                        pager.badge(),
                        err
                    );
                    pager.unresolved_page_fault_occurred();
                    return Resolution::Fatal(err);
                }
            }
        }
    }
}

/// Thread bound to a region map via [`RegionMap::add_client`].
pub struct RmClient {
    pager: Arc<dyn PagerObject>,
    member: Weak<RegionMap>,
    faulter: Arc<Faulter>,
}

impl core::fmt::Debug for RmClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RmClient").field("badge", &self.pager.badge()).finish()
    }
}

impl RmClient {
    pub(crate) fn new(pager: Arc<dyn PagerObject>, member: Weak<RegionMap>) -> Self {
        let faulter = Faulter::new(Arc::clone(&pager));
        Self { pager, member, faulter }
    }

    /// Identifier of the thread.
    pub fn badge(&self) -> u64 {
        self.pager.badge()
    }
}

impl MapMember for RmClient {
    fn member_region_map(&self) -> Option<Arc<RegionMap>> {
        self.member.upgrade()
    }
}

impl FaulterRecord for RmClient {
    fn faulter(&self) -> &Arc<Faulter> {
        &self.faulter
    }
}

impl Pageable for RmClient {
    fn pager_object(&self) -> &Arc<dyn PagerObject> {
        &self.pager
    }
}

/// Handle returned by [`RegionMap::add_client`].
#[derive(Clone, Debug)]
pub struct PagerCapability(Arc<RmClient>);

impl PagerCapability {
    pub(crate) fn new(client: Arc<RmClient>) -> Self {
        Self(client)
    }

    /// The bound client.
    pub fn client(&self) -> &Arc<RmClient> {
        &self.0
    }
}

impl core::ops::Deref for PagerCapability {
    type Target = RmClient;

    fn deref(&self) -> &RmClient {
        &self.0
    }
}
