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

//! Converges the objects a custom resource owns.
//!
//! Owned objects are found only through label selectors. For every desired
//! object, [`ensure_owned`] lists the matches, keeps one, deletes the rest,
//! creates the object when nothing matches, and otherwise copies the fields
//! the operator manages onto the live object and updates it if anything
//! drifted. Fields other actors own (cluster IPs, node ports, replicas under
//! an autoscaler, annotations added by other tools) are left alone.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount, ServicePort};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::consts::{LAST_APPLIED_ANNOTATIONS, SPEC_HASH_ANNOTATION};
use crate::crds::{ControlPlane, DataPlane, KongPlugin};
use crate::labels::Selector;
use crate::store::{Object, ObjectStore};
use crate::Result;

/// An object type whose operator-managed fields can be copied onto a live copy.
pub trait Owned: Object {
    /// Copies the operator-managed fields of `desired` onto `self`, returning
    /// whether anything changed.
    fn adopt(&mut self, desired: &Self) -> bool;

    /// Whether `self` can only converge to `desired` by being recreated, e.g.
    /// because an immutable field differs.
    fn needs_recreate(&self, _desired: &Self) -> bool {
        false
    }
}

/// Returns an owner reference marking `owner` as the controller of an object.
pub fn controller_ref<K: Resource<DynamicType = ()>>(owner: &K) -> Option<OwnerReference> {
    owner.controller_owner_ref(&())
}

/// Makes exactly one object matching `selector` exist and carry the managed
/// fields of `desired`. Returns the live object.
///
/// When `desired` has a fixed name, a matching object with another name is
/// replaced by a new one with the fixed name.
pub async fn ensure_owned<S: ObjectStore, K: Owned>(
    store: &S,
    namespace: Option<&str>,
    selector: &Selector,
    desired: K,
) -> Result<K> {
    let mut desired = desired;
    stamp_last_applied(desired.meta_mut());
    let fixed_name = desired.meta().name.clone();

    let mut existing: Vec<K> = store.list(namespace, selector).await?;
    existing.sort_by(|a, b| {
        a.meta()
            .creation_timestamp
            .cmp(&b.meta().creation_timestamp)
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });

    let keep = match &fixed_name {
        Some(name) => existing.iter().position(|obj| &obj.name_any() == name),
        None if existing.is_empty() => None,
        None => Some(0),
    };
    let current = keep.map(|idx| existing.remove(idx));

    let live = match current {
        None => {
            let created = store.create(&desired).await?;
            info!(
                kind = %K::kind(&()),
                name = %created.name_any(),
                "created owned object"
            );
            created
        }
        Some(current) if current.needs_recreate(&desired) => {
            info!(
                kind = %K::kind(&()),
                name = %current.name_any(),
                "recreating owned object with immutable field changes"
            );
            store.delete::<K>(namespace, &current.name_any()).await?;
            store.create(&desired).await?
        }
        Some(current) => {
            let mut updated = current.clone();
            if updated.adopt(&desired) {
                info!(
                    kind = %K::kind(&()),
                    name = %updated.name_any(),
                    "drift detected; updating owned object"
                );
                store.update(&updated).await?
            } else {
                current
            }
        }
    };

    for extra in existing {
        debug!(
            kind = %K::kind(&()),
            name = %extra.name_any(),
            "deleting duplicate owned object"
        );
        store.delete::<K>(namespace, &extra.name_any()).await?;
    }

    Ok(live)
}

/// Deletes every object matching `selector`. Returns how many were deleted.
pub async fn delete_owned<S: ObjectStore, K: Owned>(
    store: &S,
    namespace: Option<&str>,
    selector: &Selector,
) -> Result<usize> {
    let existing: Vec<K> = store.list(namespace, selector).await?;
    for obj in &existing {
        info!(
            kind = %K::kind(&()),
            name = %obj.name_any(),
            "deleting owned object"
        );
        store.delete::<K>(namespace, &obj.name_any()).await?;
    }
    Ok(existing.len())
}

// Records which annotation keys the operator writes, so keys it stops writing
// can be removed later without touching annotations owned by other tools.
fn stamp_last_applied(meta: &mut ObjectMeta) {
    let Some(annotations) = meta.annotations.as_mut() else {
        return;
    };
    annotations.remove(LAST_APPLIED_ANNOTATIONS);
    if annotations.is_empty() {
        return;
    }
    let keys: Vec<&str> = annotations.keys().map(String::as_str).collect();
    let value = keys.join(",");
    annotations.insert(LAST_APPLIED_ANNOTATIONS.to_string(), value);
}

fn adopt_annotations(current: &mut ObjectMeta, desired: &ObjectMeta) -> bool {
    let mut changed = false;
    let desired_annotations = desired.annotations.clone().unwrap_or_default();
    let current_annotations = current.annotations.get_or_insert_with(BTreeMap::new);

    let previously_applied: BTreeSet<String> = current_annotations
        .get(LAST_APPLIED_ANNOTATIONS)
        .map(|keys| {
            keys.split(',')
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    for key in previously_applied
        .iter()
        .map(String::as_str)
        .chain([LAST_APPLIED_ANNOTATIONS])
    {
        if !desired_annotations.contains_key(key) && current_annotations.remove(key).is_some() {
            changed = true;
        }
    }

    for (key, value) in desired_annotations {
        if current_annotations.get(&key) != Some(&value) {
            current_annotations.insert(key, value);
            changed = true;
        }
    }
    changed
}

fn adopt_metadata(current: &mut ObjectMeta, desired: &ObjectMeta) -> bool {
    let mut changed = false;
    if let Some(labels) = &desired.labels {
        let current_labels = current.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in labels {
            if current_labels.get(key) != Some(value) {
                current_labels.insert(key.clone(), value.clone());
                changed = true;
            }
        }
    }
    if adopt_annotations(current, desired) {
        changed = true;
    }
    if desired.owner_references.is_some() && current.owner_references != desired.owner_references {
        current.owner_references.clone_from(&desired.owner_references);
        changed = true;
    }
    changed
}

fn spec_hash(meta: &ObjectMeta) -> Option<&String> {
    meta.annotations.as_ref()?.get(SPEC_HASH_ANNOTATION)
}

/// Whether every field set in `desired` holds the same value in `current`.
/// Fields `desired` leaves unset are skipped, so values the API server
/// defaults never count as drift. Zero values missing from `current` match,
/// since the API server omits them. Lists must match in length and order.
fn derived_from(desired: &Value, current: &Value) -> bool {
    match (desired, current) {
        (Value::Null, _) => true,
        (_, Value::Null) => is_zero(desired),
        (Value::Object(desired), Value::Object(current)) => desired
            .iter()
            .all(|(key, value)| derived_from(value, current.get(key).unwrap_or(&Value::Null))),
        (Value::Array(desired), Value::Array(current)) => {
            desired.len() == current.len() && desired.iter().zip(current).all(|(d, c)| derived_from(d, c))
        }
        _ => desired == current,
    }
}

fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.values().all(is_zero),
    }
}

fn drifted<T: Serialize>(desired: &T, current: &T) -> bool {
    match (serde_json::to_value(desired), serde_json::to_value(current)) {
        (Ok(desired), Ok(current)) => !derived_from(&desired, &current),
        _ => true,
    }
}

impl Owned for Deployment {
    // The spec hash catches template changes the operator made; the field
    // comparison catches edits made to the live object by anyone else.
    fn adopt(&mut self, desired: &Self) -> bool {
        let template_changed = spec_hash(&self.metadata) != spec_hash(&desired.metadata)
            || match (&desired.spec, &self.spec) {
                (Some(desired_spec), Some(spec)) => {
                    let mut wanted = desired_spec.clone();
                    wanted.replicas = None;
                    let mut live = spec.clone();
                    live.replicas = None;
                    drifted(&wanted, &live)
                }
                (Some(_), None) => true,
                (None, _) => false,
            };
        let mut changed = adopt_metadata(&mut self.metadata, &desired.metadata);

        let Some(desired_spec) = desired.spec.as_ref() else {
            return changed;
        };
        let spec = self.spec.get_or_insert_with(Default::default);
        if template_changed {
            let replicas = spec.replicas;
            *spec = desired_spec.clone();
            spec.replicas = replicas;
            changed = true;
        }
        // Without desired replicas an autoscaler owns the field.
        if desired_spec.replicas.is_some() && spec.replicas != desired_spec.replicas {
            spec.replicas = desired_spec.replicas;
            changed = true;
        }
        changed
    }

    fn needs_recreate(&self, desired: &Self) -> bool {
        let current = self.spec.as_ref().map(|s| &s.selector);
        let wanted = desired.spec.as_ref().map(|s| &s.selector);
        wanted.is_some() && current != wanted
    }
}

fn same_ports(current: &[ServicePort], desired: &[ServicePort]) -> bool {
    current.len() == desired.len()
        && current.iter().zip(desired).all(|(c, d)| {
            c.name == d.name
                && c.port == d.port
                && c.target_port == d.target_port
                && c.protocol.as_deref().unwrap_or("TCP") == d.protocol.as_deref().unwrap_or("TCP")
        })
}

impl Owned for Service {
    fn adopt(&mut self, desired: &Self) -> bool {
        let mut changed = adopt_metadata(&mut self.metadata, &desired.metadata);
        let Some(desired_spec) = desired.spec.as_ref() else {
            return changed;
        };
        let spec = self.spec.get_or_insert_with(Default::default);

        if spec.selector != desired_spec.selector {
            spec.selector.clone_from(&desired_spec.selector);
            changed = true;
        }
        let current_ports = spec.ports.clone().unwrap_or_default();
        let desired_ports = desired_spec.ports.clone().unwrap_or_default();
        if !same_ports(&current_ports, &desired_ports) {
            // Keep node ports the API server allocated for ports that survive.
            let ports = desired_ports
                .into_iter()
                .map(|mut port| {
                    port.node_port = current_ports
                        .iter()
                        .find(|p| p.name == port.name && p.port == port.port)
                        .and_then(|p| p.node_port);
                    port
                })
                .collect();
            spec.ports = Some(ports);
            changed = true;
        }
        if desired_spec.type_.is_some() && spec.type_ != desired_spec.type_ {
            spec.type_.clone_from(&desired_spec.type_);
            changed = true;
        }
        if spec.external_traffic_policy != desired_spec.external_traffic_policy
            && desired_spec.external_traffic_policy.is_some()
        {
            spec.external_traffic_policy
                .clone_from(&desired_spec.external_traffic_policy);
            changed = true;
        }
        changed
    }
}

impl Owned for Secret {
    fn adopt(&mut self, desired: &Self) -> bool {
        let mut changed = adopt_metadata(&mut self.metadata, &desired.metadata);
        if self.data != desired.data {
            self.data.clone_from(&desired.data);
            changed = true;
        }
        changed
    }

    fn needs_recreate(&self, desired: &Self) -> bool {
        desired.type_.is_some() && self.type_ != desired.type_
    }
}

impl Owned for ServiceAccount {
    fn adopt(&mut self, desired: &Self) -> bool {
        adopt_metadata(&mut self.metadata, &desired.metadata)
    }
}

impl Owned for HorizontalPodAutoscaler {
    fn adopt(&mut self, desired: &Self) -> bool {
        let mut changed = adopt_metadata(&mut self.metadata, &desired.metadata);
        let Some(desired_spec) = desired.spec.as_ref() else {
            return changed;
        };
        let spec = self.spec.get_or_insert_with(Default::default);
        if spec.scale_target_ref != desired_spec.scale_target_ref {
            spec.scale_target_ref = desired_spec.scale_target_ref.clone();
            changed = true;
        }
        if spec.min_replicas != desired_spec.min_replicas
            || spec.max_replicas != desired_spec.max_replicas
        {
            spec.min_replicas = desired_spec.min_replicas;
            spec.max_replicas = desired_spec.max_replicas;
            changed = true;
        }
        if desired_spec.metrics.is_some() && spec.metrics != desired_spec.metrics {
            spec.metrics.clone_from(&desired_spec.metrics);
            changed = true;
        }
        changed
    }
}

impl Owned for NetworkPolicy {
    fn adopt(&mut self, desired: &Self) -> bool {
        let mut changed = adopt_metadata(&mut self.metadata, &desired.metadata);
        if self.spec != desired.spec {
            self.spec.clone_from(&desired.spec);
            changed = true;
        }
        changed
    }
}

impl Owned for ClusterRole {
    // Rules are compared directly so rules removed out of band are restored.
    fn adopt(&mut self, desired: &Self) -> bool {
        let mut changed = adopt_metadata(&mut self.metadata, &desired.metadata);
        if self.rules != desired.rules {
            self.rules.clone_from(&desired.rules);
            changed = true;
        }
        changed
    }
}

impl Owned for ClusterRoleBinding {
    fn adopt(&mut self, desired: &Self) -> bool {
        let mut changed = adopt_metadata(&mut self.metadata, &desired.metadata);
        if self.subjects != desired.subjects {
            self.subjects.clone_from(&desired.subjects);
            changed = true;
        }
        changed
    }

    // roleRef is immutable.
    fn needs_recreate(&self, desired: &Self) -> bool {
        self.role_ref != desired.role_ref
    }
}

impl Owned for ValidatingWebhookConfiguration {
    fn adopt(&mut self, desired: &Self) -> bool {
        let webhooks_changed = spec_hash(&self.metadata) != spec_hash(&desired.metadata)
            || drifted(&desired.webhooks, &self.webhooks);
        let mut changed = adopt_metadata(&mut self.metadata, &desired.metadata);
        if webhooks_changed {
            self.webhooks.clone_from(&desired.webhooks);
            changed = true;
        }
        changed
    }
}

impl Owned for DataPlane {
    fn adopt(&mut self, desired: &Self) -> bool {
        let mut changed = adopt_metadata(&mut self.metadata, &desired.metadata);
        if self.spec != desired.spec {
            self.spec = desired.spec.clone();
            changed = true;
        }
        changed
    }
}

impl Owned for ControlPlane {
    fn adopt(&mut self, desired: &Self) -> bool {
        let mut changed = adopt_metadata(&mut self.metadata, &desired.metadata);
        if self.spec != desired.spec {
            self.spec = desired.spec.clone();
            changed = true;
        }
        changed
    }
}

impl Owned for KongPlugin {
    fn adopt(&mut self, desired: &Self) -> bool {
        let mut changed = adopt_metadata(&mut self.metadata, &desired.metadata);
        if self.plugin != desired.plugin || self.config != desired.config {
            self.plugin.clone_from(&desired.plugin);
            self.config.clone_from(&desired.config);
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeStore;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use pretty_assertions::assert_eq;

    fn selector() -> Selector {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "proxy".to_string());
        Selector::from(labels)
    }

    fn desired_service(annotations: &[(&str, &str)], port: i32) -> Service {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "proxy".to_string());
        Service {
            metadata: ObjectMeta {
                generate_name: Some("proxy-".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(labels),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port,
                    target_port: Some(IntOrString::Int(8000)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[tokio::test]
    async fn creates_then_converges_without_writes() {
        let store = FakeStore::default();
        let created = ensure_owned(&store, Some("default"), &selector(), desired_service(&[], 80))
            .await
            .unwrap();
        assert!(created.name_any().starts_with("proxy-"));
        assert_eq!(store.writes().len(), 1);

        store.clear_writes();
        ensure_owned(&store, Some("default"), &selector(), desired_service(&[], 80))
            .await
            .unwrap();
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn drift_is_patched_in_place_and_duplicates_removed() {
        let store = FakeStore::default();
        let first = ensure_owned(&store, Some("default"), &selector(), desired_service(&[], 80))
            .await
            .unwrap();
        let mut duplicate = desired_service(&[], 80);
        duplicate.metadata.generate_name = Some("proxy-dup-".to_string());
        store.create(&duplicate).await.unwrap();

        let live = ensure_owned(&store, Some("default"), &selector(), desired_service(&[], 8080))
            .await
            .unwrap();
        assert_eq!(live.name_any(), first.name_any());
        assert_eq!(live.spec.unwrap().ports.unwrap()[0].port, 8080);
        let remaining: Vec<Service> = store.list(Some("default"), &selector()).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn removed_annotations_are_dropped_but_foreign_ones_kept() {
        let store = FakeStore::default();
        let live = ensure_owned(
            &store,
            Some("default"),
            &selector(),
            desired_service(&[("konghq.com/plugins", "prometheus")], 80),
        )
        .await
        .unwrap();

        let mut foreign = live.clone();
        foreign
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert("example.com/owner".to_string(), "someone".to_string());
        store.update(&foreign).await.unwrap();

        let live = ensure_owned(&store, Some("default"), &selector(), desired_service(&[], 80))
            .await
            .unwrap();
        let annotations = live.metadata.annotations.unwrap_or_default();
        assert!(!annotations.contains_key("konghq.com/plugins"));
        assert!(!annotations.contains_key(LAST_APPLIED_ANNOTATIONS));
        assert_eq!(annotations.get("example.com/owner").map(String::as_str), Some("someone"));
    }

    #[tokio::test]
    async fn fixed_name_replaces_generated_object() {
        let store = FakeStore::default();
        ensure_owned(&store, Some("default"), &selector(), desired_service(&[], 80))
            .await
            .unwrap();

        let mut named = desired_service(&[], 80);
        named.metadata.name = Some("my-proxy".to_string());
        let live = ensure_owned(&store, Some("default"), &selector(), named)
            .await
            .unwrap();
        assert_eq!(live.name_any(), "my-proxy");
        let remaining: Vec<Service> = store.list(Some("default"), &selector()).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    fn desired_deployment(image: &str) -> Deployment {
        use k8s_openapi::api::apps::v1::DeploymentSpec;
        use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

        let labels: BTreeMap<String, String> = [("app".to_string(), "proxy".to_string())].into();
        Deployment {
            metadata: ObjectMeta {
                generate_name: Some("proxy-".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(labels.clone()),
                annotations: Some([(SPEC_HASH_ANNOTATION.to_string(), "abc".to_string())].into()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "proxy".to_string(),
                            image: Some(image.to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    #[tokio::test]
    async fn deployment_edits_are_reverted_but_defaults_kept() {
        let store = FakeStore::default();
        let live = ensure_owned(&store, Some("default"), &selector(), desired_deployment("kong:3.9"))
            .await
            .unwrap();
        let name = live.name_any();

        // Defaults filled in by the API server are not drift.
        store.modify::<Deployment>(Some("default"), &name, |d| {
            let pod = d.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
            pod.restart_policy = Some("Always".to_string());
            pod.containers[0].image_pull_policy = Some("IfNotPresent".to_string());
        });
        store.clear_writes();
        ensure_owned(&store, Some("default"), &selector(), desired_deployment("kong:3.9"))
            .await
            .unwrap();
        assert!(store.writes().is_empty());

        // An edit that leaves the hash annotation alone is still reverted.
        store.modify::<Deployment>(Some("default"), &name, |d| {
            let pod = d.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
            pod.containers[0].image = Some("example.com/other:1".to_string());
        });
        let live = ensure_owned(&store, Some("default"), &selector(), desired_deployment("kong:3.9"))
            .await
            .unwrap();
        assert_eq!(live.name_any(), name);
        let pod = live.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("kong:3.9"));
    }

    #[test]
    fn unset_fields_are_not_compared() {
        let desired = serde_json::json!({"a": 1, "b": {"c": "x"}, "d": null, "e": []});
        assert!(derived_from(&desired, &serde_json::json!({"a": 1, "b": {"c": "x", "z": 2}})));
        assert!(!derived_from(&desired, &serde_json::json!({"a": 2, "b": {"c": "x"}})));
        assert!(!derived_from(&desired, &serde_json::json!({"a": 1})));
        assert!(!derived_from(&serde_json::json!([1, 2]), &serde_json::json!([1, 2, 3])));
        assert!(derived_from(&serde_json::json!({"s": "", "n": 0, "f": false}), &serde_json::json!({})));
    }

    #[tokio::test]
    async fn delete_owned_removes_all_matches() {
        let store = FakeStore::default();
        store.create(&desired_service(&[], 80)).await.unwrap();
        store.create(&desired_service(&[], 81)).await.unwrap();
        let deleted = delete_owned::<_, Service>(&store, Some("default"), &selector())
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        let remaining: Vec<Service> = store.list(Some("default"), &selector()).await.unwrap();
        assert!(remaining.is_empty());
    }
}
