//! Storage class parameters accepted by `CreateVolume`.

use std::collections::HashMap;

use crate::allocator::GidRange;
use crate::error::{Error, Result};

pub const PROVISIONING_MODE: &str = "provisioningMode";
pub const FILE_SYSTEM_ID: &str = "fileSystemId";
pub const GID_RANGE_START: &str = "gidRangeStart";
pub const GID_RANGE_END: &str = "gidRangeEnd";
pub const DIRECTORY_PERMS: &str = "directoryPerms";
pub const BASE_PATH: &str = "basePath";

/// The only provisioning mode: one access point per volume.
pub const ACCESS_POINT_MODE: &str = "efs-ap";

/// Validated `CreateVolume` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeParameters {
    pub file_system_id: String,
    pub gid_range: GidRange,
    pub directory_perms: Option<String>,
    /// Prefix for the access point root directory. Empty when unset.
    pub base_path: String,
}

impl VolumeParameters {
    /// Validate raw parameters. Unknown keys are ignored; orchestrators
    /// routinely add their own.
    ///
    /// `default_range` applies when neither gid bound is given.
    pub fn parse(params: &HashMap<String, String>, default_range: GidRange) -> Result<Self> {
        let mode = params
            .get(PROVISIONING_MODE)
            .ok_or(Error::MissingParameter {
                name: PROVISIONING_MODE,
            })?;
        if mode != ACCESS_POINT_MODE {
            return Err(Error::UnsupportedProvisioningMode {
                mode: mode.clone(),
                supported: ACCESS_POINT_MODE,
            });
        }

        let file_system_id = params.get(FILE_SYSTEM_ID).ok_or(Error::MissingParameter {
            name: FILE_SYSTEM_ID,
        })?;
        if file_system_id.trim().is_empty() {
            return Err(Error::EmptyParameter {
                name: FILE_SYSTEM_ID,
            });
        }

        let gid_range = match (params.get(GID_RANGE_START), params.get(GID_RANGE_END)) {
            (None, None) => default_range,
            (Some(start), end) => {
                let min = parse_gid(GID_RANGE_START, start)?;
                let end = end.ok_or(Error::MissingParameter {
                    name: GID_RANGE_END,
                })?;
                let max = parse_gid(GID_RANGE_END, end)?;
                GidRange::new(min, max)?
            }
            (None, Some(_)) => {
                return Err(Error::MissingParameter {
                    name: GID_RANGE_START,
                });
            }
        };

        Ok(Self {
            file_system_id: file_system_id.clone(),
            gid_range,
            directory_perms: params.get(DIRECTORY_PERMS).cloned(),
            base_path: params.get(BASE_PATH).cloned().unwrap_or_default(),
        })
    }
}

fn parse_gid(name: &'static str, value: &str) -> Result<u32> {
    let invalid = |reason: String| Error::InvalidParameter {
        name,
        value: value.to_string(),
        reason,
    };
    let gid: i64 = value.trim().parse().map_err(|e| invalid(format!("{e}")))?;
    if gid <= 0 {
        return Err(invalid("must be greater than 0".to_string()));
    }
    u32::try_from(gid).map_err(|_| invalid(format!("must not exceed {}", u32::MAX)))
}
