use std::collections::BTreeSet;

use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::builder::controlplane::{
    add_plugin, metrics_plugin, metrics_plugin_name, owner_labels, plugin_labels, remove_plugin,
    DataPlaneEndpoints, PROMETHEUS_PLUGIN,
};
use crate::builder::dataplane::service_labels;
use crate::consts::*;
use crate::crds::{ControlPlane, DataPlane, DataPlaneMetricsExtension, KongPlugin, WatchNamespaceGrant};
use crate::dataplane_utils::oldest;
use crate::labels::{Selector, ServiceType, State};
use crate::owned::{delete_owned, ensure_owned};
use crate::store::ObjectStore;
use crate::Result;

pub const FINALIZERS: [&str; 4] = [
    CLEANUP_CLUSTER_ROLE_FINALIZER,
    CLEANUP_CLUSTER_ROLE_BINDING_FINALIZER,
    CLEANUP_WEBHOOK_CONFIGURATION_FINALIZER,
    CLEANUP_PLUGIN_BINDINGS_FINALIZER,
];

/// Adds the cleanup finalizers the ControlPlane is missing. Returns `None` when
/// all are present.
pub fn with_finalizers(cp: &ControlPlane) -> Option<ControlPlane> {
    let present: BTreeSet<&str> = cp.finalizers().iter().map(String::as_str).collect();
    if FINALIZERS.iter().all(|f| present.contains(f)) {
        return None;
    }
    let mut updated = cp.clone();
    let finalizers = updated.meta_mut().finalizers.get_or_insert_with(Vec::new);
    for finalizer in FINALIZERS {
        if !finalizers.iter().any(|f| f == finalizer) {
            finalizers.push(finalizer.to_string());
        }
    }
    Some(updated)
}

pub fn has_finalizers(cp: &ControlPlane) -> bool {
    cp.finalizers().iter().any(|f| FINALIZERS.contains(&f.as_str()))
}

/// Removes what owner references cannot garbage collect: cluster-scoped
/// objects and the plugin bindings of metrics extensions.
pub async fn cleanup<S: ObjectStore>(store: &S, cp: &ControlPlane) -> Result<()> {
    let selector = owner_labels(cp).selector();
    delete_owned::<_, ValidatingWebhookConfiguration>(store, None, &selector).await?;
    delete_owned::<_, ClusterRoleBinding>(store, None, &selector).await?;
    delete_owned::<_, ClusterRole>(store, None, &selector).await?;
    reconcile_metrics_plugins(store, cp, &[]).await?;
    Ok(())
}

/// Drops the operator's finalizers, letting the API server finish deleting.
pub fn without_finalizers(cp: &ControlPlane) -> ControlPlane {
    let mut updated = cp.clone();
    if let Some(finalizers) = updated.meta_mut().finalizers.as_mut() {
        finalizers.retain(|f| !FINALIZERS.contains(&f.as_str()));
    }
    updated
}

/// The Services of the DataPlane a ControlPlane configures. `Err` carries a
/// human readable reason when there is nothing to configure yet.
pub async fn dataplane_endpoints<S: ObjectStore>(
    store: &S,
    cp: &ControlPlane,
) -> Result<std::result::Result<DataPlaneEndpoints, String>> {
    let Some(name) = cp.spec.data_plane.as_deref().filter(|n| !n.is_empty()) else {
        return Ok(Err("no DataPlane is configured".to_string()));
    };
    let namespace = cp.namespace();
    let Some(dp) = store.get::<DataPlane>(namespace.as_deref(), name).await? else {
        return Ok(Err(format!("DataPlane {name} not found")));
    };

    let live_service = |service_type| service_labels(&dp, service_type, State::Live).selector();
    let admin: Option<Service> = oldest(store.list(namespace.as_deref(), &live_service(ServiceType::Admin)).await?);
    let ingress: Option<Service> =
        oldest(store.list(namespace.as_deref(), &live_service(ServiceType::Ingress)).await?);
    match (admin, ingress) {
        (Some(admin), Some(ingress)) => Ok(Ok(DataPlaneEndpoints {
            admin_service: admin.name_any(),
            ingress_service: ingress.name_any(),
        })),
        _ => Ok(Err(format!("DataPlane {name} has no Services yet"))),
    }
}

/// Namespaces in `watched` that are neither the ControlPlane's own nor
/// granted by a WatchNamespaceGrant.
pub async fn missing_grants<S: ObjectStore>(
    store: &S,
    cp: &ControlPlane,
    watched: &[String],
) -> Result<Vec<String>> {
    let own = cp.namespace().unwrap_or_default();
    let mut missing = vec![];
    for namespace in watched.iter().filter(|ns| **ns != own) {
        let grants: Vec<WatchNamespaceGrant> = store.list(Some(namespace), &Selector::everything()).await?;
        if !grants.iter().any(|g| g.permits_controlplanes_from(&own)) {
            missing.push(namespace.clone());
        }
    }
    Ok(missing)
}

/// Metrics extensions the ControlPlane references that exist.
pub async fn metrics_extensions<S: ObjectStore>(
    store: &S,
    cp: &ControlPlane,
) -> Result<Vec<DataPlaneMetricsExtension>> {
    let own = cp.namespace().unwrap_or_default();
    let mut extensions = vec![];
    for reference in cp.spec.options.extensions.iter().filter(|e| e.is_metrics_extension()) {
        let namespace = reference.namespace.as_deref().unwrap_or(&own);
        match store
            .get::<DataPlaneMetricsExtension>(Some(namespace), &reference.name)
            .await?
        {
            Some(extension) => extensions.push(extension),
            None => debug!(
                name = %reference.name,
                namespace,
                "referenced DataPlaneMetricsExtension not found"
            ),
        }
    }
    Ok(extensions)
}

async fn bind_plugin<S: ObjectStore>(store: &S, namespace: &str, service: &str, plugin: &str) -> Result<()> {
    let Some(mut target) = store.get::<Service>(Some(namespace), service).await? else {
        debug!(service, namespace, "metrics extension target Service not found");
        return Ok(());
    };
    if let Some(value) = add_plugin(target.annotations(), plugin) {
        target
            .annotations_mut()
            .insert(KONG_PLUGINS_ANNOTATION.to_string(), value);
        info!(service, namespace, plugin, "binding plugin to Service");
        store.update(&target).await?;
    }
    Ok(())
}

/// Removes `plugin` from every Service in `namespace` not named in `keep`.
async fn unbind_plugin<S: ObjectStore>(store: &S, namespace: &str, plugin: &str, keep: &[&str]) -> Result<()> {
    let services: Vec<Service> = store.list(Some(namespace), &Selector::everything()).await?;
    for mut service in services {
        if keep.contains(&service.name_any().as_str()) {
            continue;
        }
        let Some(value) = remove_plugin(service.annotations(), plugin) else {
            continue;
        };
        if value.is_empty() {
            service.annotations_mut().remove(KONG_PLUGINS_ANNOTATION);
        } else {
            service
                .annotations_mut()
                .insert(KONG_PLUGINS_ANNOTATION.to_string(), value);
        }
        info!(service = %service.name_any(), namespace, plugin, "unbinding plugin from Service");
        store.update(&service).await?;
    }
    Ok(())
}

/// Makes one prometheus KongPlugin exist per metrics extension and binds it to
/// the extension's target Service. Plugins and bindings of extensions no
/// longer referenced are removed.
pub async fn reconcile_metrics_plugins<S: ObjectStore>(
    store: &S,
    cp: &ControlPlane,
    extensions: &[DataPlaneMetricsExtension],
) -> Result<()> {
    let plugin = metrics_plugin_name(cp);
    let selector = plugin_labels(cp, PROMETHEUS_PLUGIN).selector();

    let mut wanted = BTreeSet::new();
    for extension in extensions {
        let namespace = extension.namespace().unwrap_or_default();
        // One plugin per namespace; a second extension there only adds a binding.
        if wanted.insert(namespace.clone()) {
            ensure_owned(store, Some(&namespace), &selector, metrics_plugin(cp, extension)).await?;
        }
        let target = extension.spec.service_selector.match_name.as_str();
        bind_plugin(store, &namespace, target, &plugin).await?;
    }

    for namespace in &wanted {
        let targets: Vec<&str> = extensions
            .iter()
            .filter(|e| e.namespace().as_deref() == Some(namespace.as_str()))
            .map(|e| e.spec.service_selector.match_name.as_str())
            .collect();
        unbind_plugin(store, namespace, &plugin, &targets).await?;
    }

    let existing: Vec<KongPlugin> = store.list(None, &selector).await?;
    for stale in existing {
        let namespace = stale.namespace().unwrap_or_default();
        if wanted.contains(&namespace) {
            continue;
        }
        unbind_plugin(store, &namespace, &plugin, &[]).await?;
        info!(name = %stale.name_any(), namespace, "deleting metrics plugin");
        store.delete::<KongPlugin>(Some(&namespace), &stale.name_any()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{ExtensionRef, MetricsConfig, ServiceSelector, WatchNamespaceGrantFrom, WatchNamespaceGrantSpec};
    use crate::testing::FakeStore;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn controlplane(store: &FakeStore) -> ControlPlane {
        let mut cp = ControlPlane::new("kong", Default::default());
        cp.metadata.namespace = Some("default".to_string());
        store.insert(cp)
    }

    fn service(store: &FakeStore, namespace: &str, name: &str, plugins: Option<&str>) {
        let mut service = Service::default();
        service.metadata.name = Some(name.to_string());
        service.metadata.namespace = Some(namespace.to_string());
        service.metadata.annotations =
            plugins.map(|p| BTreeMap::from([(KONG_PLUGINS_ANNOTATION.to_string(), p.to_string())]));
        store.insert(service);
    }

    fn plugins_of(store: &FakeStore, name: &str) -> Option<String> {
        store
            .objects::<Service>()
            .into_iter()
            .find(|s| s.name_any() == name)
            .and_then(|s| s.annotations().get(KONG_PLUGINS_ANNOTATION).cloned())
    }

    fn extension(namespace: &str, target: &str) -> DataPlaneMetricsExtension {
        let mut ext = DataPlaneMetricsExtension::new(
            "metrics",
            crate::crds::DataPlaneMetricsExtensionSpec {
                service_selector: ServiceSelector {
                    match_name: target.to_string(),
                },
                config: MetricsConfig {
                    latency: true,
                    ..Default::default()
                },
            },
        );
        ext.metadata.namespace = Some(namespace.to_string());
        ext
    }

    #[test]
    fn finalizers_are_added_once() {
        let store = FakeStore::default();
        let cp = controlplane(&store);
        let with = with_finalizers(&cp).unwrap();
        assert_eq!(with.finalizers().len(), 4);
        assert!(has_finalizers(&with));
        assert!(with_finalizers(&with).is_none());
        assert!(!has_finalizers(&without_finalizers(&with)));
    }

    #[tokio::test]
    async fn grants_are_required_for_foreign_namespaces() {
        let store = FakeStore::default();
        let cp = controlplane(&store);
        let watched = vec!["apps".to_string(), "default".to_string()];
        assert_eq!(missing_grants(&store, &cp, &watched).await.unwrap(), vec!["apps"]);

        let mut grant = WatchNamespaceGrant::new(
            "allow",
            WatchNamespaceGrantSpec {
                from: vec![WatchNamespaceGrantFrom {
                    group: OPERATOR_API_GROUP.to_string(),
                    kind: "ControlPlane".to_string(),
                    namespace: "default".to_string(),
                }],
            },
        );
        grant.metadata.namespace = Some("apps".to_string());
        store.insert(grant);
        assert!(missing_grants(&store, &cp, &watched).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_extension_references_are_skipped() {
        let store = FakeStore::default();
        let mut cp = controlplane(&store);
        cp.spec.options.extensions = vec![ExtensionRef {
            group: OPERATOR_API_GROUP.to_string(),
            kind: "DataPlaneMetricsExtension".to_string(),
            name: "metrics".to_string(),
            namespace: None,
        }];
        assert!(metrics_extensions(&store, &cp).await.unwrap().is_empty());
        store.insert(extension("default", "echo"));
        assert_eq!(metrics_extensions(&store, &cp).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn plugin_binding_follows_the_extension() {
        let store = FakeStore::default();
        let cp = controlplane(&store);
        service(&store, "default", "echo", Some("rate-limit"));
        service(&store, "default", "other", None);
        let plugin = metrics_plugin_name(&cp);

        reconcile_metrics_plugins(&store, &cp, &[extension("default", "echo")])
            .await
            .unwrap();
        assert_eq!(plugins_of(&store, "echo"), Some(format!("rate-limit,{plugin}")));
        assert_eq!(store.objects::<KongPlugin>().len(), 1);

        // Retargeting moves the binding.
        reconcile_metrics_plugins(&store, &cp, &[extension("default", "other")])
            .await
            .unwrap();
        assert_eq!(plugins_of(&store, "echo"), Some("rate-limit".to_string()));
        assert_eq!(plugins_of(&store, "other"), Some(plugin.clone()));

        reconcile_metrics_plugins(&store, &cp, &[]).await.unwrap();
        assert_eq!(plugins_of(&store, "other"), None);
        assert!(store.objects::<KongPlugin>().is_empty());
    }
}
