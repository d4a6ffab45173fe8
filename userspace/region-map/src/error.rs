// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types reported by region maps.

use thiserror::Error;

use crate::table::InsertError;

/// Result alias for region-map session operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors reported synchronously to region-map clients.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The region table has no free slot left.
    #[error("out of region metadata")]
    OutOfMetadata,
    /// The requested range overlaps an existing attachment or leaves the map.
    #[error("region conflict")]
    RegionConflict,
    /// The dataspace capability does not refer to a live dataspace.
    #[error("invalid dataspace")]
    InvalidDataspace,
    /// Size, offset or address arguments are unusable.
    #[error("invalid arguments")]
    InvalidArgs,
    /// The thread capability does not refer to a live thread.
    #[error("invalid thread")]
    InvalidThread,
    /// The sub region map is already attached to a parent.
    #[error("sub region map already attached")]
    AlreadyAttached,
    /// Managed dataspaces may only be attached to root region maps.
    #[error("managed dataspace nesting too deep")]
    NestingTooDeep,
    /// The configuration failed [`crate::Config::validate`].
    #[error("invalid region map configuration")]
    InvalidConfig,
}

impl From<InsertError> for Error {
    fn from(value: InsertError) -> Self {
        match value {
            InsertError::OutOfMetadata => Self::OutOfMetadata,
            InsertError::Conflict => Self::RegionConflict,
        }
    }
}

/// Faults that cannot be forwarded to a fault handler.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// No valid signal context is registered at the responsible region map.
    #[error("no fault handler registered")]
    NoFaultHandler,
    /// The faulting thread's region map no longer exists.
    #[error("faulting client has no region map")]
    NoRegionMap,
}
