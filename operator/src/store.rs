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

//! Access to cluster state for the reconcilers.
//!
//! Reconcilers are generic over [`ObjectStore`] so the same code runs against the
//! API server ([`KubeStore`]) and against the in-memory store used by tests.

use std::fmt::Debug;

use async_trait::async_trait;
use gateway_api::apis::standard::{
    gatewayclasses::GatewayClass, gateways::Gateway, referencegrants::ReferenceGrant,
};
use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;

use crate::consts::OPERATOR_FIELD_MANAGER;
use crate::crds::{
    ControlPlane, DataPlane, DataPlaneMetricsExtension, GatewayConfiguration, KongPlugin,
    KongPluginInstallation, WatchNamespaceGrant,
};
use crate::labels::Selector;
use crate::utils::is_not_found;
use crate::{Error, Result};

/// A Kubernetes object type the operator reads or writes.
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const NAMESPACED: bool;

    /// Api handle for the object's scope. `namespace` is ignored for cluster-scoped
    /// types; `None` on a namespaced type addresses all namespaces.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced_object {
    ($($kind:ty),* $(,)?) => {
        $(
            impl Object for $kind {
                const NAMESPACED: bool = true;

                fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(ns) => Api::namespaced(client, ns),
                        None => Api::all(client),
                    }
                }
            }
        )*
    };
}

macro_rules! cluster_object {
    ($($kind:ty),* $(,)?) => {
        $(
            impl Object for $kind {
                const NAMESPACED: bool = false;

                fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                    Api::all(client)
                }
            }
        )*
    };
}

namespaced_object!(
    Deployment,
    Service,
    Secret,
    ServiceAccount,
    HorizontalPodAutoscaler,
    NetworkPolicy,
    DataPlane,
    ControlPlane,
    GatewayConfiguration,
    WatchNamespaceGrant,
    DataPlaneMetricsExtension,
    KongPluginInstallation,
    KongPlugin,
    Gateway,
    ReferenceGrant,
);

cluster_object!(
    ClusterRole,
    ClusterRoleBinding,
    ValidatingWebhookConfiguration,
    GatewayClass,
);

/// Reads and writes cluster objects.
///
/// Writes are optimistic: `update` sends the object's resourceVersion and fails with
/// a conflict if it is stale. Deleting an object that is already gone succeeds.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    async fn list<K: Object>(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<K>>;

    async fn create<K: Object>(&self, obj: &K) -> Result<K>;

    async fn update<K: Object>(&self, obj: &K) -> Result<K>;

    async fn update_status<K: Object>(&self, obj: &K) -> Result<K>;

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<()>;
}

/// [`ObjectStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        K::api(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(Error::KubeError)
    }

    async fn list<K: Object>(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_string());
        }
        let list = K::api(self.client.clone(), namespace)
            .list(&params)
            .await
            .map_err(Error::KubeError)?;
        Ok(list.items)
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let ns = obj.namespace();
        K::api(self.client.clone(), ns.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(Error::KubeError)
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K> {
        let ns = obj.namespace();
        K::api(self.client.clone(), ns.as_deref())
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_status<K: Object>(&self, obj: &K) -> Result<K> {
        let ns = obj.namespace();
        let value = serde_json::to_value(obj)?;
        let status = value.get("status").cloned().unwrap_or_default();
        let patch = Patch::Apply(json!({
            "apiVersion": K::api_version(&()),
            "kind": K::kind(&()),
            "status": status,
        }));
        let params = PatchParams::apply(OPERATOR_FIELD_MANAGER).force();
        K::api(self.client.clone(), ns.as_deref())
            .patch_status(&obj.name_any(), &params, &patch)
            .await
            .map_err(Error::KubeError)
    }

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        match K::api(self.client.clone(), namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(Error::KubeError(err)),
        }
    }
}
