//! Error types for the CSI driver.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tonic::Status;

use crate::allocator::GidRange;
use crate::cloud::{CloudError, CloudOp};

pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for validating required fields.
///
/// Returns `INVALID_ARGUMENT` status if the field is empty.
pub trait Require<T> {
    fn require(self, name: &str) -> std::result::Result<T, Status>;
}

impl Require<String> for String {
    fn require(self, name: &str) -> std::result::Result<String, Status> {
        if self.is_empty() {
            Err(Status::invalid_argument(format!("{name} not provided")))
        } else {
            Ok(self)
        }
    }
}

/// CSI driver errors with structured context.
#[derive(Debug, Error)]
pub enum Error {
    #[error("volume capabilities not provided")]
    MissingCapabilities,

    #[error("volume capabilities not supported")]
    UnsupportedCapabilities,

    #[error("missing {name} parameter")]
    MissingParameter { name: &'static str },

    #[error("parameter {name} cannot be empty")]
    EmptyParameter { name: &'static str },

    #[error(
        "provisioning mode {mode:?} is not supported, only access point provisioning {supported:?} is supported"
    )]
    UnsupportedProvisioningMode {
        mode: String,
        supported: &'static str,
    },

    #[error("failed to parse invalid {name} {value:?}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid gid range {min}-{max}: {reason}")]
    InvalidGidRange {
        min: i64,
        max: i64,
        reason: &'static str,
    },

    #[error(
        "gid range {requested} conflicts with range {established} already in use on file system {file_system_id}"
    )]
    GidRangeConflict {
        file_system_id: String,
        requested: GidRange,
        established: GidRange,
    },

    #[error("failed to locate a free gid in range {range} for file system {file_system_id}")]
    GidRangeExhausted {
        file_system_id: String,
        range: GidRange,
    },

    #[error("volume ID {volume_id:?} is invalid: {reason}")]
    InvalidVolumeId {
        volume_id: String,
        reason: &'static str,
    },

    #[error("failed to find access point for volume {volume_id:?}")]
    MissingAccessPoint { volume_id: String },

    #[error("file system {file_system_id} does not exist: {source}")]
    FileSystemNotFound {
        file_system_id: String,
        source: CloudError,
    },

    #[error("access point {name} already exists: {source}")]
    AccessPointAlreadyExists { name: String, source: CloudError },

    #[error("access denied during {op} of {target}, check the driver's cloud permissions: {source}")]
    AccessDenied {
        op: CloudOp,
        target: String,
        source: CloudError,
    },

    #[error("failed to {op} {target}: {source}")]
    Cloud {
        op: CloudOp,
        target: String,
        source: CloudError,
    },

    #[error("could not create dir {}: {source}", path.display())]
    MakeDir { path: PathBuf, source: io::Error },

    #[error("could not mount {mount_source} at {}: {source}", target.display())]
    Mount {
        mount_source: String,
        target: PathBuf,
        source: io::Error,
    },

    #[error("could not delete access point root directory {}: {source}", path.display())]
    RemoveRootDir { path: PathBuf, source: io::Error },

    #[error("could not unmount {}: {source}", target.display())]
    Unmount { target: PathBuf, source: io::Error },

    #[error("could not delete {}: {source}", path.display())]
    RemoveMountDir { path: PathBuf, source: io::Error },

    #[error("invalid endpoint: {endpoint}")]
    InvalidEndpoint { endpoint: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Classify a cloud error for `op` on `target`.
    ///
    /// Kinds with a dedicated status (`AccessDenied`) are mapped here; the
    /// orchestrator handles `NotFound` and `AlreadyExists` itself because
    /// their meaning depends on the call.
    pub fn cloud(op: CloudOp, target: impl Into<String>, source: CloudError) -> Self {
        let target = target.into();
        match source {
            CloudError::AccessDenied(_) => Self::AccessDenied { op, target, source },
            _ => Self::Cloud { op, target, source },
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid tag {tag:?}: expected key:value")]
    InvalidTag { tag: String },

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match &err {
            // INVALID_ARGUMENT: Client provided invalid input
            Error::MissingCapabilities
            | Error::UnsupportedCapabilities
            | Error::MissingParameter { .. }
            | Error::EmptyParameter { .. }
            | Error::UnsupportedProvisioningMode { .. }
            | Error::InvalidParameter { .. }
            | Error::InvalidGidRange { .. }
            | Error::GidRangeConflict { .. }
            | Error::FileSystemNotFound { .. }
            | Error::InvalidEndpoint { .. } => tonic::Status::invalid_argument(err.to_string()),

            // NOT_FOUND: Volume does not exist
            Error::InvalidVolumeId { .. } | Error::MissingAccessPoint { .. } => {
                tonic::Status::not_found(err.to_string())
            }

            // ALREADY_EXISTS: Access point collides with an existing one
            Error::AccessPointAlreadyExists { .. } => {
                tonic::Status::already_exists(err.to_string())
            }

            // RESOURCE_EXHAUSTED: No gid available on the file system
            Error::GidRangeExhausted { .. } => tonic::Status::resource_exhausted(err.to_string()),

            // UNAUTHENTICATED: Cloud refused the driver's credentials
            Error::AccessDenied { .. } => tonic::Status::unauthenticated(err.to_string()),

            // INTERNAL: Infrastructure errors
            Error::Cloud { .. }
            | Error::MakeDir { .. }
            | Error::Mount { .. }
            | Error::RemoveRootDir { .. }
            | Error::Unmount { .. }
            | Error::RemoveMountDir { .. }
            | Error::Config(_)
            | Error::Io(_) => tonic::Status::internal(err.to_string()),
        }
    }
}
