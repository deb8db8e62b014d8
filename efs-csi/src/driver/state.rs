//! Volume provisioning state machines.
//!
//! [`DriverState`] turns CreateVolume and DeleteVolume into access point
//! lifecycles. It owns the gid allocator and nothing else; the cloud is
//! the source of truth for every volume.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::allocator::{GidAllocator, GidRange};
use crate::cloud::{AccessPointOptions, Cloud, CloudError, CloudOp};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::mount::{Mounter, ScopedMount};
use crate::params::VolumeParameters;
use crate::types::VolumeId;

use super::{DEFAULT_TAG_KEY, DEFAULT_TAG_VALUE, FS_TYPE, MOUNT_OPTIONS, ROOT_DIR_PREFIX};

/// Shared driver state.
pub struct DriverState {
    pub config: Config,
    cloud: Arc<dyn Cloud>,
    mounter: Arc<dyn Mounter>,
    gids: GidAllocator,
    default_gid_range: GidRange,
}

impl DriverState {
    pub fn new(config: Config, cloud: Arc<dyn Cloud>, mounter: Arc<dyn Mounter>) -> Result<Self> {
        let default_gid_range = config.default_gid_range()?;
        Ok(Self {
            config,
            cloud,
            mounter,
            gids: GidAllocator::new(),
            default_gid_range,
        })
    }

    pub fn gids(&self) -> &GidAllocator {
        &self.gids
    }

    /// Tags applied to every access point. Configured tags win over the
    /// default cluster tag.
    fn access_point_tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::from([(
            DEFAULT_TAG_KEY.to_string(),
            DEFAULT_TAG_VALUE.to_string(),
        )]);
        tags.extend(self.config.tags.clone());
        tags
    }

    /// Provision an access point for volume `name`.
    ///
    /// The caller has already checked the name and capabilities. The gid
    /// taken for the access point is released again if creation fails.
    /// Retrying with the same name after a failure allocates a fresh gid
    /// and root directory.
    pub async fn create_volume(
        &self,
        name: &str,
        capacity_bytes: i64,
        parameters: &HashMap<String, String>,
    ) -> Result<VolumeId> {
        debug_assert!(!name.is_empty(), "name must not be empty");

        let params = VolumeParameters::parse(parameters, self.default_gid_range)?;
        let file_system_id = params.file_system_id.as_str();

        self.cloud
            .describe_file_system(file_system_id)
            .await
            .map_err(|source| match source {
                CloudError::NotFound(_) => Error::FileSystemNotFound {
                    file_system_id: file_system_id.to_string(),
                    source,
                },
                source => Error::cloud(CloudOp::DescribeFileSystem, file_system_id, source),
            })?;

        let lease = self.gids.lease(file_system_id, params.gid_range)?;
        let gid = lease.gid();

        let options = AccessPointOptions {
            file_system_id: file_system_id.to_string(),
            capacity_bytes,
            tags: self.access_point_tags(),
            directory_perms: params.directory_perms.clone(),
            uid: gid,
            gid,
            directory_path: root_directory(&params.base_path, gid),
        };
        debug!(
            name,
            file_system_id,
            gid,
            root_directory = %options.directory_path,
            "creating access point"
        );

        let access_point = match self.cloud.create_access_point(name, &options).await {
            Ok(access_point) => access_point,
            Err(source) => {
                lease.release();
                return Err(match source {
                    CloudError::AlreadyExists(_) => Error::AccessPointAlreadyExists {
                        name: name.to_string(),
                        source,
                    },
                    source => Error::cloud(CloudOp::CreateAccessPoint, name, source),
                });
            }
        };
        lease.keep();

        let volume_id = VolumeId::new(file_system_id, "", access_point.access_point_id);
        info!(
            %volume_id,
            name,
            gid,
            root_directory = %options.directory_path,
            "volume created"
        );
        Ok(volume_id)
    }

    /// Delete the access point behind `volume_id`.
    ///
    /// Anything already gone counts as deleted, including an ID that does
    /// not decode. The one exception is a well formed ID naming no access
    /// point, reported as [`Error::MissingAccessPoint`].
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let id = match VolumeId::decode(volume_id) {
            Ok(id) => id,
            Err(e @ Error::MissingAccessPoint { .. }) => return Err(e),
            Err(e) => {
                warn!(volume_id, error = %e, "volume ID is malformed, treating as deleted");
                return Ok(());
            }
        };
        let access_point_id = id.access_point_id();

        if self.config.delete_access_point_root_dir {
            let access_point = match self.cloud.describe_access_point(access_point_id).await {
                Ok(access_point) => access_point,
                Err(CloudError::NotFound(_)) => {
                    info!(volume_id, "access point not found, volume already deleted");
                    return Ok(());
                }
                Err(source) => {
                    return Err(Error::cloud(
                        CloudOp::DescribeAccessPoint,
                        access_point_id,
                        source,
                    ));
                }
            };
            self.delete_root_directory(&id, &access_point.root_directory)
                .await?;
        }

        match self.cloud.delete_access_point(access_point_id).await {
            Ok(()) => {}
            Err(CloudError::NotFound(_)) => {
                debug!(volume_id, "access point not found on delete");
            }
            Err(source) => {
                return Err(Error::cloud(
                    CloudOp::DeleteAccessPoint,
                    access_point_id,
                    source,
                ));
            }
        }

        info!(volume_id, "volume deleted");
        Ok(())
    }

    /// Mount the file system root and remove an access point's root
    /// directory beneath it. Runs on the blocking pool.
    async fn delete_root_directory(&self, id: &VolumeId, root_directory: &str) -> Result<()> {
        let target = self
            .config
            .temp_mount_path_prefix
            .join(id.access_point_id());
        let relative = relative_root_directory(root_directory, &target)?;
        let mounter = Arc::clone(&self.mounter);
        let source = id.file_system_id().to_string();

        tokio::task::spawn_blocking(move || {
            let options: Vec<String> = MOUNT_OPTIONS.iter().map(|o| o.to_string()).collect();
            let mount = ScopedMount::mount(Arc::clone(&mounter), &source, target, FS_TYPE, &options)?;

            let root = mount.path().join(&relative);
            mounter
                .remove_all(&root)
                .map_err(|source| Error::RemoveRootDir {
                    path: root.clone(),
                    source,
                })?;
            debug!(path = %root.display(), "removed access point root directory");

            mount.release()
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

/// `basePath/efs-csi-ap-<gid>-<uuid>`. The suffix keeps roots unique even
/// when a gid is reused.
fn root_directory(base_path: &str, gid: u32) -> String {
    format!("{base_path}/{ROOT_DIR_PREFIX}-{gid}-{}", Uuid::new_v4())
}

/// Resolve an access point root directory to a path relative to the mount
/// point. It must name something strictly below the file system root.
fn relative_root_directory(root_directory: &str, mount_point: &Path) -> Result<PathBuf> {
    let relative = Path::new(root_directory.trim_start_matches('/'));
    let stays_below = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    let names_dir = relative
        .components()
        .any(|c| matches!(c, Component::Normal(_)));
    if !stays_below || !names_dir {
        return Err(Error::RemoveRootDir {
            path: mount_point.join(relative),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("root directory {root_directory:?} does not name a subdirectory"),
            ),
        });
    }
    Ok(relative.to_path_buf())
}
