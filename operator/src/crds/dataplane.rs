/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::collections::BTreeMap;

use k8s_openapi::api::autoscaling::v2::MetricSpec;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ExtensionRef, NamespacedRef};
use crate::consts::PROMOTE_WHEN_READY_ANNOTATION;
use crate::{Error, Result};

/// DataPlane is the desired state of a Kong proxy deployment.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gateway-operator.konghq.com",
    version = "v1beta1",
    kind = "DataPlane",
    plural = "dataplanes",
    shortname = "kdp",
    status = "DataPlaneStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".status.service"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneSpec {
    #[serde(flatten)]
    pub options: DataPlaneOptions,
}

/// DataPlaneOptions is shared between DataPlane and GatewayConfiguration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneOptions {
    #[serde(default)]
    pub deployment: DataPlaneDeploymentOptions,
    #[serde(default)]
    pub network: DataPlaneNetworkOptions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<ExtensionRef>,
    /// KongPluginInstallations whose plugins are mounted into the proxy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins_to_install: Vec<NamespacedRef>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneDeploymentOptions {
    /// Mutually exclusive with `scaling.horizontalScaling`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<Scaling>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template_spec: Option<PodTemplateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scaling {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_scaling: Option<HorizontalScaling>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScaling {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    pub max_replicas: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    pub strategy: RolloutStrategy,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blue_green: Option<BlueGreenStrategy>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlueGreenStrategy {
    #[serde(default)]
    pub promotion: Promotion,
    #[serde(default)]
    pub resources: RolloutResources,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Promotion {
    #[serde(default)]
    pub strategy: PromotionStrategy,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PromotionStrategy {
    /// Wait for the promote-when-ready annotation before promoting.
    #[default]
    BreakBeforePromotion,
    /// Promote as soon as the preview deployment is ready.
    AutomaticPromotion,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutResources {
    #[serde(default)]
    pub plan: RolloutResourcePlan,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutResourcePlan {
    #[serde(default)]
    pub deployment: RolloutResourcePlanDeployment,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RolloutResourcePlanDeployment {
    /// Keep the preview Deployment around with zero replicas between rollouts.
    #[default]
    ScaleDownOnPromotionScaleUpOnRollout,
    /// Delete the preview Deployment on promotion and recreate it for the next rollout.
    DeleteOnPromotionRecreateOnRollout,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneNetworkOptions {
    #[serde(default)]
    pub services: DataPlaneServices,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneServices {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<DataPlaneServiceOptions>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneServiceOptions {
    /// Fixed name for the live ingress Service. Generated when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<DataPlaneServicePort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_traffic_policy: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneServicePort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: i32,
    /// Container port the Service port forwards to. Defaults to `port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<i32>,
}

impl DataPlaneServicePort {
    pub fn target(&self) -> i32 {
        self.target_port.unwrap_or(self.port)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<metav1::Condition>,
    /// Name of the live ingress Service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<Address>,
    /// Label selector of the live pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<DataPlaneRolloutStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    /// IPAddress or Hostname.
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
    /// PublicLoadBalancer, PrivateLoadBalancer, PublicIP or PrivateIP.
    pub source_type: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneRolloutStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<metav1::Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<RolloutStatusDeployment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<RolloutStatusServices>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatusDeployment {
    /// Label selector of the preview pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatusServices {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<RolloutStatusService>,
    #[serde(rename = "adminAPI", default, skip_serializing_if = "Option::is_none")]
    pub admin_api: Option<RolloutStatusService>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatusService {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<Address>,
}

impl DataPlane {
    /// The blue-green strategy, if the DataPlane uses one.
    pub fn blue_green(&self) -> Option<&BlueGreenStrategy> {
        self.spec
            .options
            .deployment
            .rollout
            .as_ref()
            .and_then(|r| r.strategy.blue_green.as_ref())
    }

    pub fn horizontal_scaling(&self) -> Option<&HorizontalScaling> {
        self.spec
            .options
            .deployment
            .scaling
            .as_ref()
            .and_then(|s| s.horizontal_scaling.as_ref())
    }

    /// Whether the promote-when-ready annotation is set to "true".
    pub fn promote_when_ready(&self) -> bool {
        self.annotations()
            .get(PROMOTE_WHEN_READY_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    /// Checks invariants that admission does not guarantee. Failures are terminal for
    /// the current generation.
    pub fn validate(&self) -> Result<()> {
        let deployment = &self.spec.options.deployment;
        if deployment.replicas.is_some() && self.horizontal_scaling().is_some() {
            return Err(Error::SpecError(
                "DataPlane cannot set both replicas and horizontalScaling".to_string(),
            ));
        }
        if let Some(hs) = self.horizontal_scaling() {
            if hs.max_replicas < hs.min_replicas.unwrap_or(1) {
                return Err(Error::SpecError(
                    "horizontalScaling maxReplicas must not be lower than minReplicas".to_string(),
                ));
            }
        }
        if let Some(replicas) = deployment.replicas {
            if replicas < 0 {
                return Err(Error::SpecError(
                    "DataPlane replicas must not be negative".to_string(),
                ));
            }
        }
        Ok(())
    }
}
