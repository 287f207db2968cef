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

//! Pure construction of the objects owned by DataPlanes and ControlPlanes.
//! Nothing here talks to the API server; the same input always renders the
//! same objects.

pub mod controlplane;
pub mod dataplane;
pub mod kong_env;
pub mod pod_template;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::labels::OwnedLabels;
use crate::owned::controller_ref;

/// Metadata of an owned, namespaced object named from `generate_name`.
pub fn owned_meta<K: Resource<DynamicType = ()>>(
    owner: &K,
    generate_name: String,
    labels: &OwnedLabels,
) -> ObjectMeta {
    ObjectMeta {
        generate_name: Some(generate_name),
        namespace: owner.namespace(),
        labels: Some(labels.labels()),
        owner_references: controller_ref(owner).map(|r| vec![r]),
        ..Default::default()
    }
}

/// Metadata of an owned, cluster-scoped object. Owner references cannot cross
/// scopes, so ownership is tracked through labels only.
pub fn cluster_owned_meta(generate_name: String, labels: &OwnedLabels) -> ObjectMeta {
    ObjectMeta {
        generate_name: Some(generate_name),
        labels: Some(labels.labels()),
        ..Default::default()
    }
}

pub fn with_annotation(mut meta: ObjectMeta, key: &str, value: String) -> ObjectMeta {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value);
    meta
}

/// The named container of a pod template.
pub fn container<'a>(template: &'a PodTemplateSpec, name: &str) -> Option<&'a Container> {
    template.spec.as_ref()?.containers.iter().find(|c| c.name == name)
}

/// Value of a plain env var of a container.
pub fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
    container
        .env
        .as_ref()?
        .iter()
        .find(|e: &&EnvVar| e.name == name)?
        .value
        .as_deref()
}
