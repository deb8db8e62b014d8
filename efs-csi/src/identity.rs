//! CSI Identity service.
//!
//! Advertises the driver name and the single plugin service this driver
//! runs: the controller. There is no node side, so orchestrators must not
//! schedule node RPCs here.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::csi;
use crate::csi::plugin_capability::service::Type as ServiceType;
use crate::driver::DriverState;

/// Plugin services advertised by GetPluginCapabilities.
const PLUGIN_SERVICES: &[ServiceType] = &[ServiceType::ControllerService];

pub struct IdentityService {
    state: Arc<DriverState>,
}

impl IdentityService {
    pub fn new(state: Arc<DriverState>) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        let config = &self.state.config;
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: config.name.clone(),
            vendor_version: config.version.clone(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let capabilities = PLUGIN_SERVICES
            .iter()
            .map(|service| csi::PluginCapability {
                r#type: Some(csi::plugin_capability::Type::Service(
                    csi::plugin_capability::Service {
                        r#type: *service as i32,
                    },
                )),
            })
            .collect();
        Ok(Response::new(csi::GetPluginCapabilitiesResponse { capabilities }))
    }

    /// The controller holds no connections of its own; once serving it is
    /// ready.
    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        debug!(driver = %self.state.config.name, "probe");
        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}
