//! In-process [`Cloud`] implementation.
//!
//! Backs the driver binary when no provider is wired in, and every test in
//! the workspace. Supports one-shot fault injection per operation and an
//! optional artificial latency so callers can exercise retries, rollback
//! and cancellation.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{AccessPoint, AccessPointOptions, Cloud, CloudError, CloudOp, FileSystem};

/// Length of the hex suffix in generated access point IDs.
const ACCESS_POINT_ID_SUFFIX_LEN: usize = 17;

#[derive(Debug, Default)]
struct Inner {
    file_systems: HashSet<String>,
    access_points: BTreeMap<String, AccessPoint>,
    /// Idempotency token -> (options used, access point ID).
    tokens: HashMap<String, (AccessPointOptions, String)>,
    faults: HashMap<CloudOp, VecDeque<CloudError>>,
    calls: Vec<CloudOp>,
}

impl Inner {
    fn record(&mut self, op: CloudOp) -> Result<(), CloudError> {
        self.calls.push(op);
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!(%op, error = %err, "injected cloud fault");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

/// A [`Cloud`] that keeps file systems and access points in memory.
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    inner: Mutex<Inner>,
    latency: Mutex<HashMap<CloudOp, Duration>>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`InMemoryCloud::add_file_system`].
    pub fn with_file_system(self, file_system_id: impl Into<String>) -> Self {
        self.add_file_system(file_system_id);
        self
    }

    pub fn add_file_system(&self, file_system_id: impl Into<String>) {
        self.inner.lock().file_systems.insert(file_system_id.into());
    }

    /// Make the next call of `op` fail with `err`. Faults queue up per
    /// operation and are consumed in order.
    pub fn fail_next(&self, op: CloudOp, err: CloudError) {
        self.inner
            .lock()
            .faults
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Delay calls of `op` by `latency` before they touch any state.
    pub fn set_latency(&self, op: CloudOp, latency: Option<Duration>) {
        let mut latencies = self.latency.lock();
        match latency {
            Some(latency) => latencies.insert(op, latency),
            None => latencies.remove(&op),
        };
    }

    /// Live access points, ordered by ID.
    pub fn access_points(&self) -> Vec<AccessPoint> {
        self.inner.lock().access_points.values().cloned().collect()
    }

    pub fn access_point(&self, access_point_id: &str) -> Option<AccessPoint> {
        self.inner.lock().access_points.get(access_point_id).cloned()
    }

    /// Every call made so far, in order, including ones that failed.
    pub fn calls(&self) -> Vec<CloudOp> {
        self.inner.lock().calls.clone()
    }

    /// Record `op` as issued, wait out its latency, then surface any
    /// injected fault.
    async fn begin(&self, op: CloudOp) -> Result<(), CloudError> {
        let fault = self.inner.lock().record(op);
        let latency = self.latency.lock().get(&op).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        fault
    }
}

fn new_access_point_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("fsap-{}", &suffix[..ACCESS_POINT_ID_SUFFIX_LEN])
}

#[async_trait]
impl Cloud for InMemoryCloud {
    async fn describe_file_system(&self, file_system_id: &str) -> Result<FileSystem, CloudError> {
        self.begin(CloudOp::DescribeFileSystem).await?;
        let inner = self.inner.lock();

        if !inner.file_systems.contains(file_system_id) {
            return Err(CloudError::NotFound(format!(
                "file system {file_system_id}"
            )));
        }
        Ok(FileSystem {
            file_system_id: file_system_id.to_string(),
        })
    }

    async fn create_access_point(
        &self,
        name: &str,
        options: &AccessPointOptions,
    ) -> Result<AccessPoint, CloudError> {
        self.begin(CloudOp::CreateAccessPoint).await?;
        let mut inner = self.inner.lock();

        if !inner.file_systems.contains(&options.file_system_id) {
            return Err(CloudError::NotFound(format!(
                "file system {}",
                options.file_system_id
            )));
        }

        // A repeated token with identical options returns the original
        // access point; any difference is a conflict.
        if let Some((previous, access_point_id)) = inner.tokens.get(name) {
            if previous == options
                && let Some(existing) = inner.access_points.get(access_point_id)
            {
                return Ok(existing.clone());
            }
            return Err(CloudError::AlreadyExists(format!(
                "access point with token {name}"
            )));
        }

        let root_in_use = inner.access_points.values().any(|ap| {
            ap.file_system_id == options.file_system_id
                && ap.root_directory == options.directory_path
        });
        if root_in_use {
            return Err(CloudError::AlreadyExists(format!(
                "access point rooted at {}",
                options.directory_path
            )));
        }

        let access_point = AccessPoint {
            access_point_id: new_access_point_id(),
            file_system_id: options.file_system_id.clone(),
            uid: options.uid,
            gid: options.gid,
            root_directory: options.directory_path.clone(),
            tags: options.tags.clone(),
        };
        inner.tokens.insert(
            name.to_string(),
            (options.clone(), access_point.access_point_id.clone()),
        );
        inner
            .access_points
            .insert(access_point.access_point_id.clone(), access_point.clone());

        debug!(
            access_point_id = %access_point.access_point_id,
            file_system_id = %access_point.file_system_id,
            gid = access_point.gid,
            "created access point"
        );
        Ok(access_point)
    }

    async fn describe_access_point(
        &self,
        access_point_id: &str,
    ) -> Result<AccessPoint, CloudError> {
        self.begin(CloudOp::DescribeAccessPoint).await?;
        let inner = self.inner.lock();

        inner
            .access_points
            .get(access_point_id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("access point {access_point_id}")))
    }

    async fn delete_access_point(&self, access_point_id: &str) -> Result<(), CloudError> {
        self.begin(CloudOp::DeleteAccessPoint).await?;
        let mut inner = self.inner.lock();

        if inner.access_points.remove(access_point_id).is_none() {
            return Err(CloudError::NotFound(format!(
                "access point {access_point_id}"
            )));
        }
        inner.tokens.retain(|_, (_, id)| id != access_point_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(gid: u32, path: &str) -> AccessPointOptions {
        AccessPointOptions {
            file_system_id: "fs-1".to_string(),
            capacity_bytes: 1 << 30,
            tags: BTreeMap::from([("k".to_string(), "v".to_string())]),
            directory_perms: Some("700".to_string()),
            uid: gid,
            gid,
            directory_path: path.to_string(),
        }
    }

    #[tokio::test]
    async fn slow_call_is_recorded_while_pending() {
        let cloud = InMemoryCloud::new().with_file_system("fs-1");
        cloud.set_latency(
            CloudOp::CreateAccessPoint,
            Some(std::time::Duration::from_secs(60)),
        );

        let opts = options(1, "/a");
        let create = cloud.create_access_point("pv-1", &opts);
        let result = tokio::time::timeout(std::time::Duration::from_millis(20), create).await;

        assert!(result.is_err());
        assert_eq!(cloud.calls(), vec![CloudOp::CreateAccessPoint]);
        assert!(cloud.access_points().is_empty());
    }

    #[tokio::test]
    async fn describe_file_system_reports_missing() {
        let cloud = InMemoryCloud::new().with_file_system("fs-1");

        assert!(cloud.describe_file_system("fs-1").await.is_ok());
        assert!(matches!(
            cloud.describe_file_system("fs-2").await,
            Err(CloudError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn create_access_point_generates_ids_and_keeps_tags() {
        let cloud = InMemoryCloud::new().with_file_system("fs-1");

        let ap = cloud
            .create_access_point("pv-1", &options(50000, "/a"))
            .await
            .unwrap();
        assert!(ap.access_point_id.starts_with("fsap-"));
        assert_eq!(ap.access_point_id.len(), "fsap-".len() + 17);
        assert_eq!(ap.gid, 50000);
        assert_eq!(ap.tags.get("k").map(String::as_str), Some("v"));
        assert_eq!(cloud.access_point(&ap.access_point_id), Some(ap));
    }

    #[tokio::test]
    async fn create_access_point_honors_token() {
        let cloud = InMemoryCloud::new().with_file_system("fs-1");

        let first = cloud
            .create_access_point("pv-1", &options(1, "/a"))
            .await
            .unwrap();
        let again = cloud
            .create_access_point("pv-1", &options(1, "/a"))
            .await
            .unwrap();
        assert_eq!(first, again);

        let err = cloud
            .create_access_point("pv-1", &options(2, "/b"))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::AlreadyExists(_)));
        assert_eq!(cloud.access_points().len(), 1);
    }

    #[tokio::test]
    async fn create_access_point_rejects_duplicate_root() {
        let cloud = InMemoryCloud::new().with_file_system("fs-1");

        cloud
            .create_access_point("pv-1", &options(1, "/a"))
            .await
            .unwrap();
        let err = cloud
            .create_access_point("pv-2", &options(2, "/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn delete_access_point_removes_and_reports_missing() {
        let cloud = InMemoryCloud::new().with_file_system("fs-1");
        let ap = cloud
            .create_access_point("pv-1", &options(1, "/a"))
            .await
            .unwrap();

        cloud.delete_access_point(&ap.access_point_id).await.unwrap();
        assert!(cloud.access_points().is_empty());
        assert!(matches!(
            cloud.delete_access_point(&ap.access_point_id).await,
            Err(CloudError::NotFound(_))
        ));

        // The token is free again once its access point is gone.
        cloud
            .create_access_point("pv-1", &options(1, "/a"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn injected_faults_fire_once_in_order() {
        let cloud = InMemoryCloud::new().with_file_system("fs-1");
        cloud.fail_next(
            CloudOp::DescribeFileSystem,
            CloudError::AccessDenied("denied".to_string()),
        );
        cloud.fail_next(
            CloudOp::DescribeFileSystem,
            CloudError::Other("throttled".to_string()),
        );

        assert!(matches!(
            cloud.describe_file_system("fs-1").await,
            Err(CloudError::AccessDenied(_))
        ));
        assert!(matches!(
            cloud.describe_file_system("fs-1").await,
            Err(CloudError::Other(_))
        ));
        assert!(cloud.describe_file_system("fs-1").await.is_ok());
        assert_eq!(cloud.calls(), vec![CloudOp::DescribeFileSystem; 3]);
    }
}
