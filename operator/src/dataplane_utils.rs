use gateway_api::apis::standard::referencegrants::ReferenceGrant;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::{Resource, ResourceExt};

use crate::builder::dataplane::ResolvedPlugin;
use crate::conditions::Reason;
use crate::consts::OPERATOR_API_GROUP;
use crate::crds::{Address, DataPlane, KongPluginInstallation, NamespacedRef};
use crate::labels::Selector;
use crate::store::ObjectStore;
use crate::Result;

/// Outcome of resolving `spec.pluginsToInstall`. Plugins that failed to
/// resolve are left out of `plugins`; the first failure is reported.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PluginResolution {
    pub plugins: Vec<ResolvedPlugin>,
    pub problem: Option<(Reason, String)>,
}

fn reference_permitted(grant: &ReferenceGrant, from_namespace: &str, plugin: &str) -> bool {
    let from = grant.spec.from.iter().any(|from| {
        from.group == OPERATOR_API_GROUP && from.kind == "DataPlane" && from.namespace == from_namespace
    });
    let to = grant.spec.to.iter().any(|to| {
        to.group == OPERATOR_API_GROUP
            && to.kind == "KongPluginInstallation"
            && to.name.as_deref().map_or(true, |name| name == plugin)
    });
    from && to
}

async fn resolve_plugin<S: ObjectStore>(
    store: &S,
    dp_namespace: &str,
    reference: &NamespacedRef,
) -> Result<std::result::Result<ResolvedPlugin, (Reason, String)>> {
    let namespace = reference.namespace.as_deref().unwrap_or(dp_namespace);
    let display = format!("{namespace}/{}", reference.name);

    if namespace != dp_namespace {
        let grants: Vec<ReferenceGrant> = store.list(Some(namespace), &Selector::everything()).await?;
        if !grants.iter().any(|g| reference_permitted(g, dp_namespace, &reference.name)) {
            return Ok(Err((
                Reason::RefNotPermitted,
                format!("no ReferenceGrant in {namespace} allows DataPlanes from {dp_namespace} to use KongPluginInstallation {display}"),
            )));
        }
    }

    let Some(installation) = store
        .get::<KongPluginInstallation>(Some(namespace), &reference.name)
        .await?
    else {
        return Ok(Err((
            Reason::InvalidKongPluginInstallation,
            format!("KongPluginInstallation {display} not found"),
        )));
    };
    match installation
        .status
        .as_ref()
        .and_then(|s| s.underlying_config_map_name.clone())
    {
        Some(config_map) => Ok(Ok(ResolvedPlugin {
            name: reference.name.clone(),
            config_map,
        })),
        None => Ok(Err((
            Reason::InvalidKongPluginInstallation,
            format!("KongPluginInstallation {display} has no ConfigMap yet"),
        ))),
    }
}

/// Resolves every plugin the DataPlane asks to install.
pub async fn resolve_plugins<S: ObjectStore>(store: &S, dp: &DataPlane) -> Result<PluginResolution> {
    let namespace = dp.namespace().unwrap_or_default();
    let mut resolution = PluginResolution::default();
    for reference in &dp.spec.options.plugins_to_install {
        match resolve_plugin(store, &namespace, reference).await? {
            Ok(plugin) => resolution.plugins.push(plugin),
            Err(problem) => {
                resolution.problem.get_or_insert(problem);
            }
        }
    }
    Ok(resolution)
}

/// The object a selector-based lookup settles on: the oldest, by creation
/// time and then name.
pub fn oldest<K: Resource>(mut objects: Vec<K>) -> Option<K> {
    objects.sort_by(|a, b| {
        a.meta()
            .creation_timestamp
            .cmp(&b.meta().creation_timestamp)
            .then_with(|| a.meta().name.cmp(&b.meta().name))
    });
    objects.into_iter().next()
}

fn observed_current(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .is_some_and(|s| s.observed_generation.is_some() && s.observed_generation == deployment.metadata.generation)
}

/// Whether the Deployment has rolled out its current template to at least
/// one available pod.
pub fn deployment_available(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    observed_current(deployment)
        && status.available_replicas.unwrap_or(0) >= 1
        && status.updated_replicas.unwrap_or(0) >= 1
}

/// Whether every requested replica is ready. A Deployment scaled to zero is
/// never ready.
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let wanted = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    wanted > 0 && observed_current(deployment) && ready >= wanted
}

pub fn replica_counts(deployment: &Deployment) -> (i32, i32) {
    let status = deployment.status.clone().unwrap_or_default();
    (status.replicas.unwrap_or(0), status.ready_replicas.unwrap_or(0))
}

/// Addresses a Service is reachable at: load balancer addresses first, then
/// the cluster IP.
pub fn service_addresses(service: &Service) -> Vec<Address> {
    let mut addresses = vec![];
    let ingress = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.clone())
        .unwrap_or_default();
    for entry in ingress {
        if let Some(ip) = entry.ip {
            addresses.push(Address {
                type_: "IPAddress".to_string(),
                value: ip,
                source_type: "PublicLoadBalancer".to_string(),
            });
        }
        if let Some(hostname) = entry.hostname {
            addresses.push(Address {
                type_: "Hostname".to_string(),
                value: hostname,
                source_type: "PublicLoadBalancer".to_string(),
            });
        }
    }
    if let Some(cluster_ip) = service.spec.as_ref().and_then(|s| s.cluster_ip.clone()) {
        if !cluster_ip.is_empty() && cluster_ip != "None" {
            addresses.push(Address {
                type_: "IPAddress".to_string(),
                value: cluster_ip,
                source_type: "PrivateIP".to_string(),
            });
        }
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{KongPluginInstallationSpec, KongPluginInstallationStatus};
    use crate::testing::FakeStore;
    use gateway_api::apis::standard::referencegrants::{
        ReferenceGrantFrom, ReferenceGrantSpec, ReferenceGrantTo,
    };
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus};
    use pretty_assertions::assert_eq;

    fn dataplane(plugins: Vec<NamespacedRef>) -> DataPlane {
        let mut dp = DataPlane::new("proxy", Default::default());
        dp.metadata.namespace = Some("default".to_string());
        dp.spec.options.plugins_to_install = plugins;
        dp
    }

    fn installation(namespace: &str, name: &str, config_map: Option<&str>) -> KongPluginInstallation {
        let mut kpi = KongPluginInstallation::new(
            name,
            KongPluginInstallationSpec {
                image: "plugins/myheader:1.0".to_string(),
            },
        );
        kpi.metadata.namespace = Some(namespace.to_string());
        kpi.status = Some(KongPluginInstallationStatus {
            conditions: vec![],
            underlying_config_map_name: config_map.map(str::to_string),
        });
        kpi
    }

    fn reference(name: &str, namespace: Option<&str>) -> NamespacedRef {
        NamespacedRef {
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn local_plugins_resolve_to_their_config_map() {
        let store = FakeStore::default();
        store.insert(installation("default", "myheader", Some("myheader-cm")));
        let resolution = resolve_plugins(&store, &dataplane(vec![reference("myheader", None)]))
            .await
            .unwrap();
        assert_eq!(
            resolution,
            PluginResolution {
                plugins: vec![ResolvedPlugin {
                    name: "myheader".to_string(),
                    config_map: "myheader-cm".to_string(),
                }],
                problem: None,
            }
        );
    }

    #[tokio::test]
    async fn cross_namespace_plugins_need_a_reference_grant() {
        let store = FakeStore::default();
        store.insert(installation("plugins", "myheader", Some("myheader-cm")));
        let dp = dataplane(vec![reference("myheader", Some("plugins"))]);

        let resolution = resolve_plugins(&store, &dp).await.unwrap();
        assert!(resolution.plugins.is_empty());
        assert_eq!(resolution.problem.map(|(reason, _)| reason), Some(Reason::RefNotPermitted));

        let mut grant = ReferenceGrant::new(
            "allow-dataplanes",
            ReferenceGrantSpec {
                from: vec![ReferenceGrantFrom {
                    group: OPERATOR_API_GROUP.to_string(),
                    kind: "DataPlane".to_string(),
                    namespace: "default".to_string(),
                }],
                to: vec![ReferenceGrantTo {
                    group: OPERATOR_API_GROUP.to_string(),
                    kind: "KongPluginInstallation".to_string(),
                    name: None,
                }],
            },
        );
        grant.metadata.namespace = Some("plugins".to_string());
        store.insert(grant);
        let resolution = resolve_plugins(&store, &dp).await.unwrap();
        assert_eq!(resolution.plugins.len(), 1);
        assert_eq!(resolution.problem, None);
    }

    #[tokio::test]
    async fn installation_without_config_map_is_invalid() {
        let store = FakeStore::default();
        store.insert(installation("default", "pending", None));
        let dp = dataplane(vec![reference("pending", None), reference("missing", None)]);
        let resolution = resolve_plugins(&store, &dp).await.unwrap();
        let (reason, message) = resolution.problem.unwrap();
        assert_eq!(reason, Reason::InvalidKongPluginInstallation);
        assert!(message.contains("default/pending"));
    }

    #[test]
    fn zero_replicas_are_never_ready() {
        let mut deployment = Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(0),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        deployment.metadata.generation = Some(1);
        assert!(!deployment_ready(&deployment));

        deployment.spec.as_mut().unwrap().replicas = Some(2);
        deployment.status.as_mut().unwrap().ready_replicas = Some(2);
        assert!(deployment_ready(&deployment));

        deployment.metadata.generation = Some(2);
        assert!(!deployment_ready(&deployment));
    }

    #[test]
    fn addresses_prefer_load_balancer() {
        let service = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.0.0.10".to_string()),
                ..Default::default()
            }),
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some("203.0.113.7".to_string()),
                        ..Default::default()
                    }]),
                }),
                conditions: None,
            }),
            ..Default::default()
        };
        let values: Vec<(String, String)> = service_addresses(&service)
            .into_iter()
            .map(|a| (a.value, a.source_type))
            .collect();
        assert_eq!(
            values,
            vec![
                ("203.0.113.7".to_string(), "PublicLoadBalancer".to_string()),
                ("10.0.0.10".to_string(), "PrivateIP".to_string()),
            ]
        );
    }
}
