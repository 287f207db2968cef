use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// KongPlugin from `configuration.konghq.com/v1`. The type carries its
/// configuration at the top level rather than under `spec`, so it implements
/// the k8s-openapi resource traits by hand instead of deriving a CustomResource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KongPlugin {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub plugin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl KongPlugin {
    pub fn new(metadata: ObjectMeta, plugin: &str, config: Option<serde_json::Value>) -> Self {
        KongPlugin {
            api_version: <Self as k8s_openapi::Resource>::API_VERSION.to_string(),
            kind: <Self as k8s_openapi::Resource>::KIND.to_string(),
            metadata,
            plugin: plugin.to_string(),
            config,
        }
    }
}

impl k8s_openapi::Resource for KongPlugin {
    const API_VERSION: &'static str = "configuration.konghq.com/v1";
    const GROUP: &'static str = "configuration.konghq.com";
    const KIND: &'static str = "KongPlugin";
    const VERSION: &'static str = "v1";
    const URL_PATH_SEGMENT: &'static str = "kongplugins";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl k8s_openapi::Metadata for KongPlugin {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &Self::Ty {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Self::Ty {
        &mut self.metadata
    }
}
