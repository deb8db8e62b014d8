//! Cloud file system API.
//!
//! The driver talks to the storage provider through the [`Cloud`] trait.
//! Provider errors are collapsed into the closed [`CloudError`] set at this
//! boundary so callers match on the kind, never on an error value.

mod memory;

pub use memory::InMemoryCloud;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// Errors returned by a [`Cloud`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("{0}")]
    Other(String),
}

/// Which cloud call failed, carried in errors, logs and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudOp {
    DescribeFileSystem,
    CreateAccessPoint,
    DescribeAccessPoint,
    DeleteAccessPoint,
}

impl fmt::Display for CloudOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DescribeFileSystem => "describe file system",
            Self::CreateAccessPoint => "create access point",
            Self::DescribeAccessPoint => "describe access point",
            Self::DeleteAccessPoint => "delete access point",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystem {
    pub file_system_id: String,
}

/// Parameters for [`Cloud::create_access_point`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointOptions {
    pub file_system_id: String,
    /// Requested capacity. Carried for bookkeeping only; the file system is
    /// elastic and never enforces it.
    pub capacity_bytes: i64,
    pub tags: BTreeMap<String, String>,
    /// Octal permissions for the root directory, e.g. `"700"`.
    pub directory_perms: Option<String>,
    pub uid: u32,
    pub gid: u32,
    /// Absolute path of the access point's root within the file system.
    pub directory_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub access_point_id: String,
    pub file_system_id: String,
    pub uid: u32,
    pub gid: u32,
    pub root_directory: String,
    pub tags: BTreeMap<String, String>,
}

/// Storage provider operations used by the controller.
#[async_trait]
pub trait Cloud: Send + Sync {
    async fn describe_file_system(&self, file_system_id: &str) -> Result<FileSystem, CloudError>;

    /// Create an access point. `name` doubles as the idempotency token.
    async fn create_access_point(
        &self,
        name: &str,
        options: &AccessPointOptions,
    ) -> Result<AccessPoint, CloudError>;

    async fn describe_access_point(&self, access_point_id: &str)
    -> Result<AccessPoint, CloudError>;

    async fn delete_access_point(&self, access_point_id: &str) -> Result<(), CloudError>;
}
