use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ExtensionRef;
use crate::consts::OPERATOR_API_GROUP;

/// DataPlaneMetricsExtension enables Prometheus metrics on a Service proxied by
/// the DataPlane of the ControlPlane it is attached to.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gateway-operator.konghq.com",
    version = "v1alpha1",
    kind = "DataPlaneMetricsExtension",
    plural = "dataplanemetricsextensions",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneMetricsExtensionSpec {
    pub service_selector: ServiceSelector,
    #[serde(default)]
    pub config: MetricsConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSelector {
    pub match_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    #[serde(default)]
    pub latency: bool,
    #[serde(default)]
    pub bandwidth: bool,
    #[serde(default)]
    pub upstream_health_checks: bool,
    #[serde(default)]
    pub status_code_metrics: bool,
}

impl ExtensionRef {
    pub fn is_metrics_extension(&self) -> bool {
        (self.group.is_empty() || self.group == OPERATOR_API_GROUP)
            && self.kind == "DataPlaneMetricsExtension"
    }
}

/// KongPluginInstallation packages a custom Kong plugin into a ConfigMap that
/// DataPlanes can mount.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gateway-operator.konghq.com",
    version = "v1alpha1",
    kind = "KongPluginInstallation",
    plural = "kongplugininstallations",
    status = "KongPluginInstallationStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KongPluginInstallationSpec {
    pub image: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KongPluginInstallationStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<metav1::Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub underlying_config_map_name: Option<String>,
}
