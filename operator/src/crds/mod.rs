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

//! Custom resources served by the operator, plus the Kong configuration
//! resources it creates or reads.

mod controlplane;
mod dataplane;
mod extensions;
mod gateway_configuration;
mod kong_plugin;
mod watch_namespace_grant;

pub use controlplane::*;
pub use dataplane::*;
pub use extensions::*;
pub use gateway_configuration::*;
pub use kong_plugin::*;
pub use watch_namespace_grant::*;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to an extension resource attached to a DataPlane, ControlPlane or
/// GatewayConfiguration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRef {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub name: String,
    /// Defaults to the namespace of the referencing object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Reference to a namespaced object by name.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Every CustomResourceDefinition served by the operator, in install order.
pub fn crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    use kube::CustomResourceExt;
    vec![
        GatewayConfiguration::crd(),
        DataPlane::crd(),
        ControlPlane::crd(),
        WatchNamespaceGrant::crd(),
        DataPlaneMetricsExtension::crd(),
        KongPluginInstallation::crd(),
    ]
}
