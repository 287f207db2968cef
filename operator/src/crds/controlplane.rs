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

use std::fmt;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ExtensionRef;

/// ControlPlane is the desired state of a Kong ingress controller deployment
/// configuring one DataPlane.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gateway-operator.konghq.com",
    version = "v1beta1",
    kind = "ControlPlane",
    plural = "controlplanes",
    shortname = "kcp",
    status = "ControlPlaneStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"DataPlane","type":"string","jsonPath":".spec.dataPlane"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    #[serde(flatten)]
    pub options: ControlPlaneOptions,
    /// Name of the DataPlane, in the same namespace, this ControlPlane configures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_plane: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class: Option<String>,
}

/// ControlPlaneOptions is shared between ControlPlane and GatewayConfiguration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneOptions {
    #[serde(default)]
    pub deployment: ControlPlaneDeploymentOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_namespaces: Option<WatchNamespaces>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controllers: Vec<ControllerToggle>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<ExtensionRef>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneDeploymentOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template_spec: Option<PodTemplateSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WatchNamespaces {
    #[serde(rename = "type", default)]
    pub type_: WatchNamespacesType,
    /// Namespaces to watch when `type` is `list`. The ControlPlane's own namespace is
    /// always watched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum WatchNamespacesType {
    #[default]
    #[serde(rename = "all")]
    All,
    #[serde(rename = "own")]
    Own,
    #[serde(rename = "list")]
    List,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerToggle {
    pub name: String,
    pub state: ControllerState,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ControllerState {
    #[default]
    #[serde(rename = "enabled")]
    Enabled,
    #[serde(rename = "disabled")]
    Disabled,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Enabled => write!(f, "enabled"),
            ControllerState::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<metav1::Condition>,
    /// Effective state of every ingress controller sub-controller.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controllers: Vec<ControllerToggle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_plane: Option<String>,
}
