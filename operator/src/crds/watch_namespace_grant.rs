use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::consts::OPERATOR_API_GROUP;

/// WatchNamespaceGrant lives in a namespace a ControlPlane wants to watch and
/// authorizes ControlPlanes from the listed namespaces to do so.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gateway-operator.konghq.com",
    version = "v1alpha1",
    kind = "WatchNamespaceGrant",
    plural = "watchnamespacegrants",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WatchNamespaceGrantSpec {
    pub from: Vec<WatchNamespaceGrantFrom>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WatchNamespaceGrantFrom {
    pub group: String,
    pub kind: String,
    pub namespace: String,
}

impl WatchNamespaceGrant {
    /// Whether this grant lets ControlPlanes from `namespace` watch the grant's namespace.
    pub fn permits_controlplanes_from(&self, namespace: &str) -> bool {
        self.spec.from.iter().any(|from| {
            from.group == OPERATOR_API_GROUP
                && from.kind == "ControlPlane"
                && from.namespace == namespace
        })
    }
}
