//! Provisioning simulation harness.
//!
//! Drives [`DriverState`] against an in-memory cloud and a fake mounter,
//! injecting faults, and checks every step against a reference model of
//! live access points and held gids.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use efs_csi::cloud::{CloudOp, InMemoryCloud};
use efs_csi::mount::{FakeMounter, MountOp};
use efs_csi::{CloudError, Config, DriverState, Error, GidRange, VolumeId};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinSet;

use super::SimulationError;

/// File system with a small explicit gid range.
const SMALL_FS: &str = "fs-small";
const SMALL_RANGE: (u32, u32) = (100, 131);
/// File system using the default range.
const DEFAULT_FS: &str = "fs-default";
/// Never registered with the cloud.
const MISSING_FS: &str = "fs-missing";

const CAPACITY_BYTES: i64 = 1 << 30;

#[derive(Debug, Clone)]
pub enum Fault {
    Cloud(CloudOp, CloudError),
    Mount(MountOp),
}

#[derive(Debug, Clone)]
pub enum ProvisioningAction {
    Create {
        name: String,
        file_system_id: &'static str,
        fault: Option<Fault>,
    },
    /// Delete a volume this run created, live or already deleted.
    Delete {
        volume_id: String,
        fault: Option<Fault>,
    },
    /// Delete an ID the cloud never issued.
    DeleteUnknown { volume_id: String },
    ConcurrentCreate {
        file_system_id: &'static str,
        count: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LiveVolume {
    file_system_id: String,
    gid: u32,
}

/// Reference model of the provisioning state.
///
/// Gids are held from a successful create onward. Deleting a volume does
/// not release its gid; only a failed create does.
#[derive(Debug, Default)]
pub struct ProvisioningOracle {
    held: HashMap<String, BTreeSet<u32>>,
    live: BTreeMap<String, LiveVolume>,
}

impl ProvisioningOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowest gids not yet held, up to `count`.
    pub fn next_gids(&self, file_system_id: &str, range: GidRange, count: usize) -> Vec<u32> {
        let held = self.held.get(file_system_id);
        (range.min()..=range.max())
            .filter(|gid| held.is_none_or(|h| !h.contains(gid)))
            .take(count)
            .collect()
    }

    pub fn created(&mut self, access_point_id: &str, file_system_id: &str, gid: u32) {
        self.held
            .entry(file_system_id.to_string())
            .or_default()
            .insert(gid);
        self.live.insert(
            access_point_id.to_string(),
            LiveVolume {
                file_system_id: file_system_id.to_string(),
                gid,
            },
        );
    }

    pub fn deleted(&mut self, access_point_id: &str) {
        self.live.remove(access_point_id);
    }

    pub fn is_live(&self, access_point_id: &str) -> bool {
        self.live.contains_key(access_point_id)
    }

    pub fn held(&self, file_system_id: &str) -> Vec<u32> {
        self.held
            .get(file_system_id)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Clone)]
pub struct ProvisioningStats {
    pub operations: u64,
    pub created: u64,
    pub create_failures: u64,
    pub exhausted: u64,
    pub deleted: u64,
    pub delete_failures: u64,
    pub concurrent_batches: u64,
}

pub struct ProvisioningHarness {
    rng: SmallRng,
    state: Arc<DriverState>,
    cloud: Arc<InMemoryCloud>,
    mounter: Arc<FakeMounter>,
    oracle: ProvisioningOracle,
    delete_root_dir: bool,
    /// Every volume ID ever returned, so deletes can revisit dead volumes.
    issued: Vec<VolumeId>,
    name_counter: u64,
    stats: ProvisioningStats,
}

impl ProvisioningHarness {
    pub fn new(seed: u64) -> Result<Self, SimulationError> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let delete_root_dir = rng.random_bool(0.5);

        let config = Config {
            delete_access_point_root_dir: delete_root_dir,
            ..Default::default()
        };
        let cloud = Arc::new(
            InMemoryCloud::new()
                .with_file_system(SMALL_FS)
                .with_file_system(DEFAULT_FS),
        );
        let mounter = Arc::new(FakeMounter::new());
        let state = DriverState::new(config, cloud.clone(), mounter.clone())
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;

        Ok(Self {
            rng,
            state: Arc::new(state),
            cloud,
            mounter,
            oracle: ProvisioningOracle::new(),
            delete_root_dir,
            issued: Vec::new(),
            name_counter: 0,
            stats: ProvisioningStats::default(),
        })
    }

    pub fn delete_root_dir(&self) -> bool {
        self.delete_root_dir
    }

    pub async fn run(&mut self, operations: u64) -> Result<(), SimulationError> {
        for _ in 0..operations {
            let action = self.sample_action();
            self.execute(action).await?;
            self.stats.operations += 1;
            self.validate_invariants()?;
        }
        Ok(())
    }

    fn range_for(file_system_id: &str) -> GidRange {
        if file_system_id == SMALL_FS {
            GidRange::new(SMALL_RANGE.0, SMALL_RANGE.1).unwrap_or_default()
        } else {
            GidRange::DEFAULT
        }
    }

    fn parameters(file_system_id: &str) -> HashMap<String, String> {
        let mut params = HashMap::from([
            ("provisioningMode".to_string(), "efs-ap".to_string()),
            ("fileSystemId".to_string(), file_system_id.to_string()),
        ]);
        if file_system_id == SMALL_FS {
            params.insert("gidRangeStart".to_string(), SMALL_RANGE.0.to_string());
            params.insert("gidRangeEnd".to_string(), SMALL_RANGE.1.to_string());
        }
        params
    }

    fn next_name(&mut self) -> String {
        self.name_counter += 1;
        format!("pvc-{}", self.name_counter)
    }

    fn sample_cloud_error(&mut self, with_already_exists: bool) -> CloudError {
        match self.rng.random_range(0..3) {
            0 => CloudError::AccessDenied("simulated".to_string()),
            1 if with_already_exists => CloudError::AlreadyExists("simulated".to_string()),
            _ => CloudError::Other("simulated".to_string()),
        }
    }

    fn sample_action(&mut self) -> ProvisioningAction {
        let choice = self.rng.random_range(0..100);
        match choice {
            0..40 => {
                let file_system_id = match self.rng.random_range(0..10) {
                    0..6 => SMALL_FS,
                    6..9 => DEFAULT_FS,
                    _ => MISSING_FS,
                };
                let fault = self.sample_create_fault(file_system_id);
                ProvisioningAction::Create {
                    name: self.next_name(),
                    file_system_id,
                    fault,
                }
            }
            40..75 if !self.issued.is_empty() => {
                let volume_id = self.issued[self.rng.random_range(0..self.issued.len())].clone();
                let fault = if self.oracle.is_live(volume_id.access_point_id()) {
                    self.sample_delete_fault()
                } else {
                    None
                };
                ProvisioningAction::Delete {
                    volume_id: volume_id.encode(),
                    fault,
                }
            }
            75..88 => {
                let volume_id = match self.rng.random_range(0..4) {
                    0 => "garbage".to_string(),
                    1 => String::new(),
                    2 => format!("{SMALL_FS}:fsap-only-two"),
                    _ => VolumeId::new(SMALL_FS, "", "fsap-never-issued").encode(),
                };
                ProvisioningAction::DeleteUnknown { volume_id }
            }
            _ => ProvisioningAction::ConcurrentCreate {
                file_system_id: if self.rng.random_bool(0.7) {
                    SMALL_FS
                } else {
                    DEFAULT_FS
                },
                count: self.rng.random_range(2..=6),
            },
        }
    }

    /// Faults are only injected where the call they target is certain to
    /// run, so none are left queued for a later action.
    fn sample_create_fault(&mut self, file_system_id: &str) -> Option<Fault> {
        if file_system_id == MISSING_FS || !self.rng.random_bool(0.25) {
            return None;
        }
        let range = Self::range_for(file_system_id);
        let can_allocate = !self.oracle.next_gids(file_system_id, range, 1).is_empty();
        if can_allocate && self.rng.random_bool(0.5) {
            let err = self.sample_cloud_error(true);
            Some(Fault::Cloud(CloudOp::CreateAccessPoint, err))
        } else {
            let err = self.sample_cloud_error(false);
            Some(Fault::Cloud(CloudOp::DescribeFileSystem, err))
        }
    }

    fn sample_delete_fault(&mut self) -> Option<Fault> {
        if !self.rng.random_bool(0.25) {
            return None;
        }
        if !self.delete_root_dir {
            let err = self.sample_cloud_error(false);
            return Some(Fault::Cloud(CloudOp::DeleteAccessPoint, err));
        }
        Some(match self.rng.random_range(0..5) {
            0 => {
                let err = self.sample_cloud_error(false);
                Fault::Cloud(CloudOp::DescribeAccessPoint, err)
            }
            1 => Fault::Mount(MountOp::MakeDir),
            2 => Fault::Mount(MountOp::Mount),
            3 => Fault::Mount(MountOp::RemoveAll),
            _ => {
                let err = self.sample_cloud_error(false);
                Fault::Cloud(CloudOp::DeleteAccessPoint, err)
            }
        })
    }

    fn inject(&self, fault: &Fault) {
        match fault {
            Fault::Cloud(op, err) => self.cloud.fail_next(*op, err.clone()),
            Fault::Mount(op) => self.mounter.fail_next(*op, "simulated"),
        }
    }

    /// Whether `err` is what `fault` should surface as.
    fn matches_fault(fault: &Fault, err: &Error) -> bool {
        match (fault, err) {
            (Fault::Cloud(CloudOp::DescribeFileSystem, CloudError::NotFound(_)), e) => {
                matches!(e, Error::FileSystemNotFound { .. })
            }
            (Fault::Cloud(_, CloudError::AccessDenied(_)), e) => {
                matches!(e, Error::AccessDenied { .. })
            }
            (Fault::Cloud(CloudOp::CreateAccessPoint, CloudError::AlreadyExists(_)), e) => {
                matches!(e, Error::AccessPointAlreadyExists { .. })
            }
            (Fault::Cloud(_, _), e) => matches!(e, Error::Cloud { .. }),
            (Fault::Mount(MountOp::MakeDir), e) => matches!(e, Error::MakeDir { .. }),
            (Fault::Mount(MountOp::Mount), e) => matches!(e, Error::Mount { .. }),
            (Fault::Mount(MountOp::RemoveAll), e) => matches!(e, Error::RemoveRootDir { .. }),
            (Fault::Mount(MountOp::Unmount), e) => matches!(e, Error::Unmount { .. }),
            (Fault::Mount(MountOp::RemoveDir), e) => matches!(e, Error::RemoveMountDir { .. }),
        }
    }

    pub async fn execute(&mut self, action: ProvisioningAction) -> Result<(), SimulationError> {
        match action {
            ProvisioningAction::Create {
                name,
                file_system_id,
                fault,
            } => self.execute_create(&name, file_system_id, fault).await,
            ProvisioningAction::Delete { volume_id, fault } => {
                self.execute_delete(&volume_id, fault).await
            }
            ProvisioningAction::DeleteUnknown { volume_id } => {
                let result = self.state.delete_volume(&volume_id).await;
                match result {
                    Ok(()) => Ok(()),
                    Err(e) => Err(SimulationError::Mismatch {
                        context: format!("delete({volume_id:?}) of unknown volume failed: {e}"),
                    }),
                }
            }
            ProvisioningAction::ConcurrentCreate {
                file_system_id,
                count,
            } => self.execute_concurrent_create(file_system_id, count).await,
        }
    }

    async fn execute_create(
        &mut self,
        name: &str,
        file_system_id: &'static str,
        fault: Option<Fault>,
    ) -> Result<(), SimulationError> {
        if let Some(fault) = &fault {
            self.inject(fault);
        }
        let range = Self::range_for(file_system_id);
        let expected_gid = self.oracle.next_gids(file_system_id, range, 1).first().copied();

        let result = self
            .state
            .create_volume(name, CAPACITY_BYTES, &Self::parameters(file_system_id))
            .await;

        match (result, &fault) {
            (Err(e), Some(fault)) if Self::matches_fault(fault, &e) => {
                self.stats.create_failures += 1;
                Ok(())
            }
            (Err(Error::FileSystemNotFound { .. }), None) if file_system_id == MISSING_FS => {
                self.stats.create_failures += 1;
                Ok(())
            }
            (Err(Error::GidRangeExhausted { .. }), None) if expected_gid.is_none() => {
                self.stats.exhausted += 1;
                Ok(())
            }
            (Ok(volume_id), None) if file_system_id != MISSING_FS => {
                let gid = self.access_point_gid(&volume_id)?;
                if Some(gid) != expected_gid {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "create({name}) on {file_system_id}: expected gid {expected_gid:?}, got {gid}"
                        ),
                    });
                }
                self.oracle
                    .created(volume_id.access_point_id(), file_system_id, gid);
                self.issued.push(volume_id);
                self.stats.created += 1;
                Ok(())
            }
            (result, fault) => Err(SimulationError::Mismatch {
                context: format!(
                    "create({name}) on {file_system_id} with fault {fault:?}: unexpected {result:?}"
                ),
            }),
        }
    }

    async fn execute_delete(
        &mut self,
        volume_id: &str,
        fault: Option<Fault>,
    ) -> Result<(), SimulationError> {
        if let Some(fault) = &fault {
            self.inject(fault);
        }
        let access_point_id = VolumeId::decode(volume_id)
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?
            .access_point_id()
            .to_string();

        let result = self.state.delete_volume(volume_id).await;
        match (result, &fault) {
            (Ok(()), None) => {
                self.oracle.deleted(&access_point_id);
                self.stats.deleted += 1;
                Ok(())
            }
            (Err(e), Some(fault)) if Self::matches_fault(fault, &e) => {
                self.stats.delete_failures += 1;
                Ok(())
            }
            (result, fault) => Err(SimulationError::Mismatch {
                context: format!("delete({volume_id}) with fault {fault:?}: unexpected {result:?}"),
            }),
        }
    }

    async fn execute_concurrent_create(
        &mut self,
        file_system_id: &'static str,
        count: usize,
    ) -> Result<(), SimulationError> {
        self.stats.concurrent_batches += 1;
        let range = Self::range_for(file_system_id);
        let expected: BTreeSet<u32> = self
            .oracle
            .next_gids(file_system_id, range, count)
            .into_iter()
            .collect();

        let mut tasks = JoinSet::new();
        for _ in 0..count {
            let state = Arc::clone(&self.state);
            let name = self.next_name();
            let params = Self::parameters(file_system_id);
            tasks.spawn(async move { state.create_volume(&name, CAPACITY_BYTES, &params).await });
        }

        let mut created = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(|e| SimulationError::Unexpected(e.to_string()))? {
                Ok(volume_id) => created.push(volume_id),
                Err(Error::GidRangeExhausted { .. }) => self.stats.exhausted += 1,
                Err(e) => {
                    return Err(SimulationError::Mismatch {
                        context: format!("concurrent create on {file_system_id}: {e}"),
                    });
                }
            }
        }

        let mut actual = BTreeSet::new();
        for volume_id in &created {
            let gid = self.access_point_gid(volume_id)?;
            if !actual.insert(gid) {
                return Err(SimulationError::Mismatch {
                    context: format!("concurrent create handed out gid {gid} twice"),
                });
            }
            self.oracle
                .created(volume_id.access_point_id(), file_system_id, gid);
        }
        if actual != expected {
            return Err(SimulationError::Mismatch {
                context: format!(
                    "concurrent create on {file_system_id}: expected gids {expected:?}, got {actual:?}"
                ),
            });
        }
        self.stats.created += created.len() as u64;
        self.issued.extend(created);
        Ok(())
    }

    fn access_point_gid(&self, volume_id: &VolumeId) -> Result<u32, SimulationError> {
        self.cloud
            .access_point(volume_id.access_point_id())
            .map(|ap| ap.gid)
            .ok_or_else(|| SimulationError::Mismatch {
                context: format!("volume {volume_id} has no access point"),
            })
    }

    fn validate_invariants(&self) -> Result<(), SimulationError> {
        let access_points = self.cloud.access_points();

        let actual: BTreeMap<String, LiveVolume> = access_points
            .iter()
            .map(|ap| {
                (
                    ap.access_point_id.clone(),
                    LiveVolume {
                        file_system_id: ap.file_system_id.clone(),
                        gid: ap.gid,
                    },
                )
            })
            .collect();
        if actual != self.oracle.live {
            return Err(SimulationError::Mismatch {
                context: format!(
                    "live access points: expected {:?}, got {:?}",
                    self.oracle.live, actual
                ),
            });
        }

        let mut owners = BTreeSet::new();
        let mut roots = BTreeSet::new();
        for ap in &access_points {
            if !owners.insert((ap.file_system_id.as_str(), ap.gid)) {
                return Err(SimulationError::Mismatch {
                    context: format!("gid {} shared on {}", ap.gid, ap.file_system_id),
                });
            }
            if ap.uid != ap.gid {
                return Err(SimulationError::Mismatch {
                    context: format!("{} has uid {} != gid {}", ap.access_point_id, ap.uid, ap.gid),
                });
            }
            let prefix = format!("/efs-csi-ap-{}-", ap.gid);
            if !ap.root_directory.starts_with(&prefix) || !roots.insert(&ap.root_directory) {
                return Err(SimulationError::Mismatch {
                    context: format!("bad or duplicate root {}", ap.root_directory),
                });
            }
        }

        for file_system_id in [SMALL_FS, DEFAULT_FS] {
            let expected = self.oracle.held(file_system_id);
            let actual = self.state.gids().in_use(file_system_id);
            if expected != actual {
                return Err(SimulationError::Mismatch {
                    context: format!(
                        "{file_system_id} held gids: expected {expected:?}, got {actual:?}"
                    ),
                });
            }
        }

        let mounted = self.mounter.mounted();
        if !mounted.is_empty() {
            return Err(SimulationError::Mismatch {
                context: format!("mounts left behind: {mounted:?}"),
            });
        }
        Ok(())
    }

    pub fn stats(&self) -> &ProvisioningStats {
        &self.stats
    }
}
