//! Shared test utilities for CSI driver tests.

use std::collections::HashMap;
use std::sync::Arc;

use tempfile::TempDir;

use crate::cloud::InMemoryCloud;
use crate::config::Config;
use crate::controller::ControllerService;
use crate::driver::DriverState;
use crate::identity::IdentityService;
use crate::mount::FakeMounter;

/// Parameters for an access point volume on `file_system_id`.
pub fn volume_parameters(file_system_id: &str) -> HashMap<String, String> {
    HashMap::from([
        ("provisioningMode".to_string(), "efs-ap".to_string()),
        ("fileSystemId".to_string(), file_system_id.to_string()),
    ])
}

/// Test fixture providing isolated driver state for each test.
///
/// The cloud knows a single file system, `fs-1`.
pub struct TestFixture {
    pub state: Arc<DriverState>,
    pub cloud: Arc<InMemoryCloud>,
    pub mounter: Arc<FakeMounter>,
    _temp_dir: TempDir,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = Config {
            endpoint: "unix:///tmp/test.sock".to_string(),
            temp_mount_path_prefix: temp_dir.path().join("pv"),
            ..config
        };
        let cloud = Arc::new(InMemoryCloud::new().with_file_system("fs-1"));
        let mounter = Arc::new(FakeMounter::new());
        let state = DriverState::new(config, cloud.clone(), mounter.clone())
            .expect("failed to create driver state");
        Self {
            state: Arc::new(state),
            cloud,
            mounter,
            _temp_dir: temp_dir,
        }
    }

    pub fn identity_service(&self) -> IdentityService {
        IdentityService::new(Arc::clone(&self.state))
    }

    pub fn controller_service(&self) -> ControllerService {
        ControllerService::new(Arc::clone(&self.state))
    }
}
