//! The CSI identity service: plugin identity, capabilities and health.

use super::proto::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse, Status,
};
use super::util::{DRIVER_NAME, DRIVER_VERSION};

/// The CSI identity service.
pub struct IdentityService {
    name: String,
    version: String,
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityService {
    pub fn new() -> Self {
        Self {
            name: DRIVER_NAME.to_owned(),
            version: DRIVER_VERSION.to_owned(),
        }
    }

    pub async fn get_plugin_info(
        &self,
        _req: GetPluginInfoRequest,
    ) -> Result<GetPluginInfoResponse, Status> {
        Ok(GetPluginInfoResponse {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
        })
    }

    pub async fn get_plugin_capabilities(
        &self,
        _req: GetPluginCapabilitiesRequest,
    ) -> Result<GetPluginCapabilitiesResponse, Status> {
        Ok(GetPluginCapabilitiesResponse {
            capabilities: vec![
                PluginCapability::ControllerService,
                PluginCapability::VolumeAccessibilityConstraints,
                PluginCapability::VolumeExpansionOnline,
            ],
        })
    }

    pub async fn probe(&self, _req: ProbeRequest) -> Result<ProbeResponse, Status> {
        Ok(ProbeResponse { ready: true })
    }
}
