//! CSI Controller service implementation.
//!
//! Thin gRPC layer that delegates to DriverState for business logic.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::capability::{is_supported, validate_volume_capabilities};
use crate::csi;
use crate::driver::DriverState;
use crate::error::Require;
use crate::types::VolumeId;

pub struct ControllerService {
    state: Arc<DriverState>,
}

impl ControllerService {
    pub fn new(state: Arc<DriverState>) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        let name = req.name.require("volume name")?;
        validate_volume_capabilities(&req.volume_capabilities)?;

        // Elastic storage: the requested size is echoed, never enforced.
        let capacity_bytes = req
            .capacity_range
            .as_ref()
            .map_or(0, |range| range.required_bytes);
        let volume_id = self
            .state
            .create_volume(&name, capacity_bytes, &req.parameters)
            .await?;

        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(csi::Volume {
                capacity_bytes,
                volume_id: volume_id.encode(),
                volume_context: HashMap::new(),
                content_source: None,
                accessible_topology: vec![],
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = req.volume_id.require("volume ID")?;

        self.state.delete_volume(&volume_id).await?;
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerPublishVolume is not implemented"))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerUnpublishVolume is not implemented"))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        let volume_id = req.volume_id.require("volume ID")?;
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("volume capabilities not provided"));
        }

        VolumeId::decode(&volume_id)
            .map_err(|e| Status::not_found(format!("volume {volume_id} not found: {e}")))?;

        if !req.volume_capabilities.iter().all(is_supported) {
            return Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: "volume capabilities not supported".to_string(),
            }));
        }

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: HashMap::new(),
                volume_capabilities: req.volume_capabilities,
                parameters: HashMap::new(),
            }),
            message: String::new(),
        }))
    }

    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        Err(Status::unimplemented("ListVolumes is not implemented"))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        Err(Status::unimplemented("GetCapacity is not implemented"))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = [Type::CreateDeleteVolume]
            .into_iter()
            .map(|t| csi::ControllerServiceCapability {
                r#type: Some(csi::controller_service_capability::Type::Rpc(
                    csi::controller_service_capability::Rpc { r#type: t as i32 },
                )),
            })
            .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("CreateSnapshot is not implemented"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("DeleteSnapshot is not implemented"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("ListSnapshots is not implemented"))
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerExpandVolume is not implemented"))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerGetVolume is not implemented"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::capability;
    use crate::cloud::{CloudError, CloudOp};
    use crate::csi::controller_server::Controller;
    use crate::csi::volume_capability::access_mode::Mode;
    use crate::test_util::{TestFixture, volume_parameters};
    use tonic::Code;

    const GIB: i64 = 1 << 30;

    /// Builder for CreateVolumeRequest to reduce test boilerplate.
    struct CreateVolumeRequestBuilder {
        name: String,
        capacity_bytes: i64,
        capabilities: Vec<csi::VolumeCapability>,
        parameters: HashMap<String, String>,
    }

    impl CreateVolumeRequestBuilder {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                capacity_bytes: GIB,
                capabilities: vec![capability(Mode::MultiNodeMultiWriter)],
                parameters: volume_parameters("fs-1"),
            }
        }

        fn capacity(mut self, bytes: i64) -> Self {
            self.capacity_bytes = bytes;
            self
        }

        fn capabilities(mut self, caps: Vec<csi::VolumeCapability>) -> Self {
            self.capabilities = caps;
            self
        }

        fn parameter(mut self, key: &str, value: &str) -> Self {
            self.parameters.insert(key.to_string(), value.to_string());
            self
        }

        fn without_parameter(mut self, key: &str) -> Self {
            self.parameters.remove(key);
            self
        }

        fn build(self) -> csi::CreateVolumeRequest {
            csi::CreateVolumeRequest {
                name: self.name,
                capacity_range: Some(csi::CapacityRange {
                    required_bytes: self.capacity_bytes,
                    limit_bytes: 0,
                }),
                volume_capabilities: self.capabilities,
                parameters: self.parameters,
                secrets: HashMap::new(),
                volume_content_source: None,
                accessibility_requirements: None,
            }
        }
    }

    async fn create(
        service: &ControllerService,
        request: csi::CreateVolumeRequest,
    ) -> Result<csi::Volume, Status> {
        let response = service.create_volume(Request::new(request)).await?;
        Ok(response.into_inner().volume.expect("volume should exist"))
    }

    fn delete_request(volume_id: &str) -> Request<csi::DeleteVolumeRequest> {
        Request::new(csi::DeleteVolumeRequest {
            volume_id: volume_id.to_string(),
            secrets: HashMap::new(),
        })
    }

    fn validate_request(
        volume_id: &str,
        caps: Vec<csi::VolumeCapability>,
    ) -> Request<csi::ValidateVolumeCapabilitiesRequest> {
        Request::new(csi::ValidateVolumeCapabilitiesRequest {
            volume_id: volume_id.to_string(),
            volume_context: HashMap::new(),
            volume_capabilities: caps,
            parameters: HashMap::new(),
            secrets: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn create_volume_returns_encoded_id_and_echoes_capacity() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        let volume = create(
            &service,
            CreateVolumeRequestBuilder::new("v1").capacity(5 * GIB).build(),
        )
        .await
        .expect("CreateVolume should succeed");

        let aps = fixture.cloud.access_points();
        assert_eq!(aps.len(), 1);
        let id = VolumeId::decode(&volume.volume_id).unwrap();
        assert_eq!(
            (id.file_system_id(), id.sub_path(), id.access_point_id()),
            ("fs-1", "", aps[0].access_point_id.as_str())
        );
        assert_eq!(volume.capacity_bytes, 5 * GIB);
        assert!(volume.volume_context.is_empty());
    }

    #[tokio::test]
    async fn create_volume_requires_name() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        let err = create(&service, CreateVolumeRequestBuilder::new("").build())
            .await
            .expect_err("CreateVolume without name should fail");

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_volume_requires_volume_capabilities() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        let request = CreateVolumeRequestBuilder::new("v1")
            .capabilities(vec![])
            .build();

        let err = create(&service, request)
            .await
            .expect_err("CreateVolume without capabilities should fail");

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_volume_rejects_unsupported_access_modes() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        let request = CreateVolumeRequestBuilder::new("v1")
            .capabilities(vec![capability(Mode::Unknown)])
            .build();

        let err = create(&service, request)
            .await
            .expect_err("CreateVolume with unknown access mode should fail");

        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(fixture.cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn create_volume_validates_parameters() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        let cases = [
            CreateVolumeRequestBuilder::new("v1").without_parameter("provisioningMode"),
            CreateVolumeRequestBuilder::new("v1").parameter("provisioningMode", "efs-dir"),
            CreateVolumeRequestBuilder::new("v1").without_parameter("fileSystemId"),
            CreateVolumeRequestBuilder::new("v1").parameter("fileSystemId", "   "),
            CreateVolumeRequestBuilder::new("v1").parameter("gidRangeEnd", "2000"),
            CreateVolumeRequestBuilder::new("v1")
                .parameter("gidRangeStart", "2000")
                .parameter("gidRangeEnd", "2000"),
        ];
        for builder in cases {
            let request = builder.build();
            let params = request.parameters.clone();
            let err = create(&service, request)
                .await
                .expect_err("invalid parameters should fail");
            assert_eq!(err.code(), Code::InvalidArgument, "{params:?}");
        }
        assert!(fixture.cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn create_volume_reports_unknown_file_system_as_invalid() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        let request = CreateVolumeRequestBuilder::new("v1")
            .parameter("fileSystemId", "fs-missing")
            .build();

        let err = create(&service, request).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_volume_maps_cloud_errors() {
        let cases = [
            (CloudError::AccessDenied("no".to_string()), Code::Unauthenticated),
            (CloudError::AlreadyExists("token".to_string()), Code::AlreadyExists),
            (CloudError::Other("boom".to_string()), Code::Internal),
        ];
        for (cloud_err, code) in cases {
            let fixture = TestFixture::new();
            let service = fixture.controller_service();
            fixture.cloud.fail_next(CloudOp::CreateAccessPoint, cloud_err);

            let err = create(&service, CreateVolumeRequestBuilder::new("v1").build())
                .await
                .unwrap_err();
            assert_eq!(err.code(), code);
            assert!(fixture.state.gids().in_use("fs-1").is_empty());
        }
    }

    #[tokio::test]
    async fn create_volume_exhausted_range_is_resource_exhausted() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        let builder = |name: &str| {
            CreateVolumeRequestBuilder::new(name)
                .parameter("gidRangeStart", "7")
                .parameter("gidRangeEnd", "8")
                .build()
        };

        create(&service, builder("a")).await.unwrap();
        create(&service, builder("b")).await.unwrap();
        let err = create(&service, builder("c")).await.unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn create_volume_retry_allocates_new_access_point() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        let first = create(&service, CreateVolumeRequestBuilder::new("v1").build())
            .await
            .unwrap();
        let err = create(&service, CreateVolumeRequestBuilder::new("v1").build())
            .await
            .unwrap_err();

        // The retry used a different gid and root, so the cloud sees a
        // conflicting request for the same token.
        assert_eq!(err.code(), Code::AlreadyExists);
        assert_eq!(fixture.cloud.access_points().len(), 1);
        assert_eq!(fixture.state.gids().in_use("fs-1"), vec![50000]);
        assert!(!first.volume_id.is_empty());
    }

    #[tokio::test]
    async fn delete_volume_removes_access_point() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        let volume = create(&service, CreateVolumeRequestBuilder::new("v1").build())
            .await
            .unwrap();

        service
            .delete_volume(delete_request(&volume.volume_id))
            .await
            .expect("DeleteVolume should succeed");
        assert!(fixture.cloud.access_points().is_empty());
    }

    #[tokio::test]
    async fn delete_volume_only_calls_delete_access_point() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        let volume_id = VolumeId::new("fs-1", "", "ap-1").encode();

        service
            .delete_volume(delete_request(&volume_id))
            .await
            .expect("DeleteVolume should succeed");

        assert_eq!(fixture.cloud.calls(), vec![CloudOp::DeleteAccessPoint]);
        assert!(fixture.mounter.calls().is_empty());
    }

    #[tokio::test]
    async fn delete_volume_is_idempotent_for_invalid_id() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        for _ in 0..2 {
            service
                .delete_volume(delete_request("nonexistent-volume-id"))
                .await
                .expect("DeleteVolume for malformed id should succeed");
        }
    }

    #[tokio::test]
    async fn delete_volume_requires_volume_id() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        let err = service
            .delete_volume(delete_request(""))
            .await
            .expect_err("DeleteVolume without volume_id should fail");

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn delete_volume_without_access_point_is_not_found() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        let err = service
            .delete_volume(delete_request("fs-1::"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn delete_volume_access_denied_is_unauthenticated() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        fixture.cloud.fail_next(
            CloudOp::DeleteAccessPoint,
            CloudError::AccessDenied("no".to_string()),
        );

        let err = service
            .delete_volume(delete_request("fs-1::fsap-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn validate_volume_capabilities_confirms_supported_capabilities() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        let caps = vec![
            capability(Mode::SingleNodeWriter),
            capability(Mode::MultiNodeReaderOnly),
        ];

        let response = service
            .validate_volume_capabilities(validate_request("fs-1::fsap-1", caps.clone()))
            .await
            .expect("ValidateVolumeCapabilities should succeed");

        let confirmed = response.into_inner().confirmed.expect("should confirm");
        assert_eq!(confirmed.volume_capabilities, caps);
    }

    #[tokio::test]
    async fn validate_volume_capabilities_reports_unsupported() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        let response = service
            .validate_volume_capabilities(validate_request(
                "fs-1::fsap-1",
                vec![capability(Mode::Unknown)],
            ))
            .await
            .expect("ValidateVolumeCapabilities should succeed");

        let response = response.into_inner();
        assert!(response.confirmed.is_none());
        assert!(!response.message.is_empty());
    }

    #[tokio::test]
    async fn validate_volume_capabilities_checks_request() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();
        let caps = vec![capability(Mode::SingleNodeWriter)];

        let err = service
            .validate_volume_capabilities(validate_request("", caps.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = service
            .validate_volume_capabilities(validate_request("fs-1::fsap-1", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = service
            .validate_volume_capabilities(validate_request("nonexistent-volume", caps))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn controller_get_capabilities_returns_create_delete_only() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        let response = service
            .controller_get_capabilities(Request::new(csi::ControllerGetCapabilitiesRequest {}))
            .await
            .expect("ControllerGetCapabilities should succeed");

        let caps = response.into_inner().capabilities;
        assert_eq!(caps.len(), 1);
        assert!(matches!(
            &caps[0].r#type,
            Some(csi::controller_service_capability::Type::Rpc(rpc))
                if rpc.r#type
                    == csi::controller_service_capability::rpc::Type::CreateDeleteVolume as i32
        ));
    }

    #[tokio::test]
    async fn unsupported_rpcs_are_unimplemented() {
        let fixture = TestFixture::new();
        let service = fixture.controller_service();

        let codes = [
            service
                .controller_publish_volume(Request::new(Default::default()))
                .await
                .unwrap_err()
                .code(),
            service
                .controller_unpublish_volume(Request::new(Default::default()))
                .await
                .unwrap_err()
                .code(),
            service
                .list_volumes(Request::new(Default::default()))
                .await
                .unwrap_err()
                .code(),
            service
                .get_capacity(Request::new(Default::default()))
                .await
                .unwrap_err()
                .code(),
            service
                .create_snapshot(Request::new(Default::default()))
                .await
                .unwrap_err()
                .code(),
            service
                .delete_snapshot(Request::new(Default::default()))
                .await
                .unwrap_err()
                .code(),
            service
                .list_snapshots(Request::new(Default::default()))
                .await
                .unwrap_err()
                .code(),
            service
                .controller_expand_volume(Request::new(Default::default()))
                .await
                .unwrap_err()
                .code(),
            service
                .controller_get_volume(Request::new(Default::default()))
                .await
                .unwrap_err()
                .code(),
        ];
        assert!(codes.iter().all(|code| *code == Code::Unimplemented));
    }
}
