use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ControlPlaneOptions, DataPlaneOptions, ExtensionRef};

/// GatewayConfiguration customizes the DataPlane and ControlPlane the operator
/// provisions for every Gateway of a GatewayClass referencing it.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gateway-operator.konghq.com",
    version = "v1beta1",
    kind = "GatewayConfiguration",
    plural = "gatewayconfigurations",
    shortname = "kgwc",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfigurationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_plane_options: Option<DataPlaneOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_options: Option<ControlPlaneOptions>,
    /// Extensions attached to the ControlPlane of every Gateway.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<ExtensionRef>,
}
