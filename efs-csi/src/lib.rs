//! efs-csi: CSI controller for access-point backed shared file systems.
//!
//! Each volume is an access point inside one shared elastic file system,
//! owned by a unique uid/gid and rooted at its own directory. This crate
//! implements the CSI Identity and Controller services that create and
//! delete those access points.

// Generated protobuf code has doc formatting issues
#![allow(clippy::doc_overindented_list_items)]
#![allow(clippy::doc_lazy_continuation)]
// tonic::Status is large by design (176 bytes)
#![allow(clippy::result_large_err)]

pub mod allocator;
pub mod capability;
pub mod cloud;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod identity;
pub mod mount;
pub mod params;
pub mod types;

pub mod csi {
    tonic::include_proto!("csi.v1");

    pub use prost_types::Timestamp;

    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("csi_descriptor");
}

pub use allocator::{GidAllocator, GidRange};
pub use cloud::{Cloud, CloudError, InMemoryCloud};
pub use config::Config;
pub use driver::{Driver, DriverState};
pub use error::{Error, Result};
pub use mount::{Mounter, SystemMounter};
pub use types::VolumeId;

#[cfg(test)]
pub(crate) mod test_util;
