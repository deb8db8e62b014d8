//! CSI driver implementation.
//!
//! - `Driver`: runs the gRPC server on a unix or tcp endpoint
//! - `DriverState`: the create/delete state machines (in `state` submodule)

mod state;

pub use state::DriverState;

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::UnixListener;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::cloud::Cloud;
use crate::config::Config;
use crate::controller::ControllerService;
use crate::csi::{
    FILE_DESCRIPTOR_SET, controller_server::ControllerServer, identity_server::IdentityServer,
};
use crate::error::{Error, Result};
use crate::identity::IdentityService;
use crate::mount::Mounter;

/// Execute a cleanup operation, logging any errors without failing.
///
/// Use this for cleanup paths where we want to attempt recovery but
/// cannot let cleanup failures mask the original error.
pub(crate) fn log_cleanup_error<F, E>(operation: &str, f: F)
where
    F: FnOnce() -> std::result::Result<(), E>,
    E: std::fmt::Display,
{
    if let Err(e) = f() {
        warn!(operation, error = %e, "cleanup failed");
    }
}

pub const DRIVER_NAME: &str = "efs.csi.aws.com";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix of every access point root directory.
pub const ROOT_DIR_PREFIX: &str = "efs-csi-ap";
/// Tag marking access points as managed by this driver.
pub const DEFAULT_TAG_KEY: &str = "efs.csi.aws.com/cluster";
pub const DEFAULT_TAG_VALUE: &str = "true";

/// File system type used to mount the file system root during cleanup.
const FS_TYPE: &str = "efs";
const MOUNT_OPTIONS: &[&str] = &["tls"];

// CSI limits plugin names to 63 characters.
const _: () = {
    assert!(DRIVER_NAME.len() <= 63);
    assert!(!ROOT_DIR_PREFIX.is_empty());
};

/// The CSI driver.
pub struct Driver {
    state: Arc<DriverState>,
}

impl Driver {
    pub fn new(config: Config, cloud: Arc<dyn Cloud>, mounter: Arc<dyn Mounter>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(DriverState::new(config, cloud, mounter)?),
        })
    }

    /// Run the CSI driver.
    pub async fn run(&self) -> Result<()> {
        let endpoint = &self.state.config.endpoint;
        info!(
            name = %self.state.config.name,
            version = %self.state.config.version,
            endpoint,
            "starting CSI driver"
        );

        if let Some(path) = endpoint.strip_prefix("unix://") {
            self.run_unix(path).await
        } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
            let addr: SocketAddr = addr.parse().map_err(|_| Error::InvalidEndpoint {
                endpoint: endpoint.clone(),
            })?;
            self.run_tcp(addr).await
        } else {
            Err(Error::InvalidEndpoint {
                endpoint: endpoint.clone(),
            })
        }
    }

    async fn run_unix(&self, path: &str) -> Result<()> {
        log_cleanup_error("remove stale socket", || match fs::remove_file(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        });
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);

        self.serve_grpc(incoming).await
    }

    async fn run_tcp(&self, addr: SocketAddr) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);

        self.serve_grpc(incoming).await
    }

    async fn serve_grpc<S, IO, E>(&self, incoming: S) -> Result<()>
    where
        S: tokio_stream::Stream<Item = std::result::Result<IO, E>> + Send + 'static,
        IO: tokio::io::AsyncRead
            + tokio::io::AsyncWrite
            + tonic::transport::server::Connected
            + Send
            + Unpin
            + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        let mut builder = Server::builder();
        if let Some(timeout) = self.state.config.request_timeout() {
            builder = builder.timeout(timeout);
        }

        builder
            .add_service(reflection)
            .add_service(IdentityServer::new(IdentityService::new(
                self.state.clone(),
            )))
            .add_service(ControllerServer::new(ControllerService::new(
                self.state.clone(),
            )))
            .serve_with_incoming(incoming)
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        Ok(())
    }
}
