//! Desired objects of a DataPlane: the proxy Deployment, ingress and admin
//! Services, HorizontalPodAutoscaler, NetworkPolicy and admin certificate.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec,
    Probe, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
    NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::kong_env::{self, KONG_ADMIN_LISTEN, KONG_PLUGINS, KONG_PROXY_LISTEN, KONG_STATUS_LISTEN};
use super::pod_template::merge_pod_template;
use super::{container, env_value, owned_meta, with_annotation};
use crate::certs::{service_dns_names, CertificateRequest, Usage};
use crate::consts::*;
use crate::crds::{DataPlane, DataPlaneServicePort};
use crate::labels::{pod_labels, Component, OwnedLabels, Selector, ServiceType, State};
use crate::utils::compute_hash;
use crate::{Error, Result};

/// A KongPluginInstallation resolved to the ConfigMap holding its files.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ResolvedPlugin {
    pub name: String,
    pub config_map: String,
}

fn generate_name(kind: Option<&str>, state: State, owner: &str) -> String {
    let mut parts = vec!["dataplane"];
    parts.extend(kind);
    if state == State::Preview {
        parts.push("preview");
    }
    parts.push(owner);
    format!("{}-", parts.join("-"))
}

pub fn deployment_labels(dp: &DataPlane, state: State) -> OwnedLabels {
    OwnedLabels::new(Component::DataPlane, dp).deployment_state(state)
}

pub fn service_labels(dp: &DataPlane, service_type: ServiceType, state: State) -> OwnedLabels {
    OwnedLabels::new(Component::DataPlane, dp)
        .service_type(service_type)
        .service_state(state)
}

pub fn certificate_labels(dp: &DataPlane, state: State) -> OwnedLabels {
    OwnedLabels::new(Component::DataPlane, dp)
        .service_type(ServiceType::Admin)
        .service_state(state)
}

pub fn owner_labels(dp: &DataPlane) -> OwnedLabels {
    OwnedLabels::new(Component::DataPlane, dp)
}

/// Selector of the pods of one state, as written in the DataPlane status.
pub fn pod_selector(dp: &DataPlane, state: State) -> Selector {
    Selector::from(pod_labels(Component::DataPlane, &dp.name_any(), Some(state)))
}

/// Ingress ports from the DataPlane options, or the defaults.
pub fn ingress_ports(dp: &DataPlane) -> Vec<DataPlaneServicePort> {
    dp.spec
        .options
        .network
        .services
        .ingress
        .as_ref()
        .map(|ingress| ingress.ports.clone())
        .filter(|ports| !ports.is_empty())
        .unwrap_or_else(kong_env::default_ingress_ports)
}

/// Replica count the Deployment of `state` should request. `None` leaves the
/// count to the autoscaler.
pub fn desired_replicas(dp: &DataPlane, state: State) -> Option<i32> {
    match (dp.horizontal_scaling(), state) {
        (Some(_), State::Live) => None,
        (Some(hs), State::Preview) => Some(hs.min_replicas.unwrap_or(1)),
        (None, _) => Some(dp.spec.options.deployment.replicas.unwrap_or(1)),
    }
}

fn proxy_container(dp: &DataPlane, default_image: Option<&str>, plugins: &[ResolvedPlugin]) -> Container {
    let ports = ingress_ports(dp);
    let mut env = kong_env::proxy_defaults(&ports);
    let mut volume_mounts = vec![VolumeMount {
        name: CLUSTER_CERTIFICATE_VOLUME.to_string(),
        mount_path: CLUSTER_CERTIFICATE_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    }];
    if !plugins.is_empty() {
        let names: Vec<&str> = plugins.iter().map(|p| p.name.as_str()).collect();
        for var in env.iter_mut().filter(|e| e.name == KONG_PLUGINS) {
            var.value = Some(format!("bundled,{}", names.join(",")));
        }
        env.push(kong_env::env(kong_env::KONG_LUA_PACKAGE_PATH, "/opt/?.lua;/opt/?/init.lua;;"));
        for plugin in plugins {
            volume_mounts.push(VolumeMount {
                name: plugin_volume_name(&plugin.name),
                mount_path: format!("{PLUGINS_MOUNT_PATH}/{}", plugin.name),
                read_only: Some(true),
                ..Default::default()
            });
        }
    }

    let port = |name: &str, port: i32| ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };
    Container {
        name: DATAPLANE_PROXY_CONTAINER.to_string(),
        image: default_image.map(str::to_string),
        env: Some(env),
        ports: Some(vec![
            port("proxy", PROXY_PORT),
            port("proxy-ssl", PROXY_SSL_PORT),
            port("admin-ssl", ADMIN_API_PORT),
            port("metrics", STATUS_PORT),
        ]),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/status/ready".to_string()),
                port: IntOrString::Int(STATUS_PORT),
                scheme: Some("HTTP".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            timeout_seconds: Some(1),
            success_threshold: Some(1),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    }
}

fn plugin_volume_name(plugin: &str) -> String {
    format!("plugin-{plugin}")
}

/// Hash of everything the proxy pod template is rendered from except the
/// rollout state. Live and preview Deployments of one spec share it.
pub fn template_hash(dp: &DataPlane, default_image: Option<&str>, plugins: &[ResolvedPlugin]) -> String {
    compute_hash(&(
        &dp.spec.options.deployment.pod_template_spec,
        ingress_ports(dp),
        plugins,
        default_image,
    ))
}

/// The proxy Deployment for `state`. Fails with a spec error when neither the
/// pod template nor the operator configuration provides an image.
pub fn deployment(
    dp: &DataPlane,
    state: State,
    default_image: Option<&str>,
    plugins: &[ResolvedPlugin],
    admin_cert_secret: &str,
) -> Result<Deployment> {
    let name = dp.name_any();
    let selector_labels = pod_labels(Component::DataPlane, &name, Some(state));

    let mut volumes = vec![Volume {
        name: CLUSTER_CERTIFICATE_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(admin_cert_secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }];
    for plugin in plugins {
        volumes.push(Volume {
            name: plugin_volume_name(&plugin.name),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(plugin.config_map.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let defaults = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(selector_labels.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![proxy_container(dp, default_image, plugins)],
            volumes: Some(volumes),
            ..Default::default()
        }),
    };
    let template = merge_pod_template(
        defaults,
        dp.spec.options.deployment.pod_template_spec.as_ref(),
    );
    let has_image = container(&template, DATAPLANE_PROXY_CONTAINER)
        .and_then(|c| c.image.as_deref())
        .is_some_and(|image| !image.is_empty());
    if !has_image {
        return Err(Error::SpecError("DataPlane requires an image".to_string()));
    }

    let spec = DeploymentSpec {
        replicas: None,
        selector: LabelSelector {
            match_labels: Some(selector_labels),
            match_expressions: None,
        },
        template,
        ..Default::default()
    };
    let metadata = with_annotation(
        with_annotation(
            owned_meta(dp, generate_name(None, state, &name), &deployment_labels(dp, state)),
            SPEC_HASH_ANNOTATION,
            compute_hash(&spec),
        ),
        TEMPLATE_HASH_ANNOTATION,
        template_hash(dp, default_image, plugins),
    );
    Ok(Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: desired_replicas(dp, state),
            ..spec
        }),
        status: None,
    })
}

/// The ingress Service for `state`. Only the live Service honours the configured
/// name, type, annotations and traffic policy; the preview Service is internal.
pub fn ingress_service(dp: &DataPlane, state: State) -> Service {
    let name = dp.name_any();
    let options = dp.spec.options.network.services.ingress.clone().unwrap_or_default();
    let mut metadata = owned_meta(
        dp,
        generate_name(Some("ingress"), state, &name),
        &service_labels(dp, ServiceType::Ingress, state),
    );
    let (type_, external_traffic_policy) = match state {
        State::Live => {
            if let Some(fixed) = &options.name {
                metadata.name = Some(fixed.clone());
                metadata.generate_name = None;
            }
            if !options.annotations.is_empty() {
                metadata.annotations = Some(options.annotations.clone());
            }
            (
                options.type_.clone().unwrap_or_else(|| "LoadBalancer".to_string()),
                options.external_traffic_policy.clone(),
            )
        }
        State::Preview => ("ClusterIP".to_string(), None),
    };

    let ports = ingress_ports(dp)
        .iter()
        .enumerate()
        .map(|(idx, p)| ServicePort {
            name: Some(p.name.clone().unwrap_or_else(|| format!("port-{idx}"))),
            port: p.port,
            target_port: Some(IntOrString::Int(p.target())),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some(type_),
            selector: Some(pod_labels(Component::DataPlane, &name, Some(state))),
            ports: Some(ports),
            external_traffic_policy,
            ..Default::default()
        }),
        status: None,
    }
}

/// Headless admin API Service, so the ingress controller can reach every proxy pod.
pub fn admin_service(dp: &DataPlane, state: State) -> Service {
    let name = dp.name_any();
    Service {
        metadata: owned_meta(
            dp,
            generate_name(Some("admin"), state, &name),
            &service_labels(dp, ServiceType::Admin, state),
        ),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(pod_labels(Component::DataPlane, &name, Some(state))),
            ports: Some(vec![ServicePort {
                name: Some("admin".to_string()),
                port: ADMIN_API_PORT,
                target_port: Some(IntOrString::Int(ADMIN_API_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Server certificate of the admin API for `state`, covering the admin
/// Service and its pod DNS names.
pub fn admin_certificate<'a>(
    dp: &DataPlane,
    state: State,
    admin_service: &str,
    selector: &'a Selector,
) -> CertificateRequest<'a> {
    let namespace = dp.namespace().unwrap_or_default();
    let mut dns_names = service_dns_names(admin_service, &namespace);
    dns_names.push(format!("*.{admin_service}.{namespace}.svc"));
    CertificateRequest {
        metadata: owned_meta(
            dp,
            generate_name(Some("admin-cert"), state, &dp.name_any()),
            &certificate_labels(dp, state),
        ),
        selector,
        common_name: admin_service.to_string(),
        dns_names,
        usage: Usage::Server,
    }
}

/// Autoscaler for the live Deployment, if horizontal scaling is configured.
pub fn horizontal_pod_autoscaler(dp: &DataPlane, live_deployment: &str) -> Option<HorizontalPodAutoscaler> {
    let hs = dp.horizontal_scaling()?;
    Some(HorizontalPodAutoscaler {
        metadata: owned_meta(dp, generate_name(None, State::Live, &dp.name_any()), &owner_labels(dp)),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: live_deployment.to_string(),
            },
            min_replicas: hs.min_replicas,
            max_replicas: hs.max_replicas,
            metrics: Some(hs.metrics.clone()).filter(|m| !m.is_empty()),
            behavior: None,
        }),
        status: None,
    })
}

fn policy_ports(ports: &[i32]) -> Option<Vec<NetworkPolicyPort>> {
    Some(
        ports
            .iter()
            .map(|port| NetworkPolicyPort {
                port: Some(IntOrString::Int(*port)),
                protocol: Some("TCP".to_string()),
                end_port: None,
            })
            .collect(),
    )
}

/// NetworkPolicy for all proxy pods of the DataPlane. Proxy and status ports
/// are open to everyone; the admin API only to ControlPlane pods.
pub fn network_policy(dp: &DataPlane, deployment: &Deployment) -> NetworkPolicy {
    let name = dp.name_any();
    let proxy = deployment
        .spec
        .as_ref()
        .and_then(|spec| container(&spec.template, DATAPLANE_PROXY_CONTAINER));
    let listen = |var: &str| -> Vec<i32> {
        proxy
            .and_then(|c| env_value(c, var))
            .map(kong_env::listen_ports)
            .unwrap_or_default()
    };
    let mut public_ports = listen(KONG_PROXY_LISTEN);
    public_ports.extend(listen(KONG_STATUS_LISTEN));
    let admin_ports = listen(KONG_ADMIN_LISTEN);

    let mut rules = vec![NetworkPolicyIngressRule {
        from: None,
        ports: policy_ports(&public_ports),
    }];
    if !admin_ports.is_empty() {
        rules.push(NetworkPolicyIngressRule {
            from: Some(vec![NetworkPolicyPeer {
                pod_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        MANAGED_BY_LABEL.to_string(),
                        MANAGED_BY_CONTROLPLANE.to_string(),
                    )])),
                    match_expressions: None,
                }),
                ..Default::default()
            }]),
            ports: policy_ports(&admin_ports),
        });
    }

    NetworkPolicy {
        metadata: owned_meta(dp, generate_name(None, State::Live, &name), &owner_labels(dp)),
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(pod_labels(Component::DataPlane, &name, None)),
                match_expressions: None,
            },
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(rules),
            egress: None,
        }),
    }
}

/// Reports a KONG_PORT_MAPS value in the user's pod template that disagrees
/// with the ingress Service ports.
pub fn port_map_problem(dp: &DataPlane) -> Option<String> {
    let template = dp.spec.options.deployment.pod_template_spec.as_ref()?;
    let value = env_value(container(template, DATAPLANE_PROXY_CONTAINER)?, kong_env::KONG_PORT_MAPS)?;
    kong_env::check_port_maps(value, &ingress_ports(dp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{DataPlaneServiceOptions, HorizontalScaling, Scaling};
    use k8s_openapi::api::core::v1::EnvVar;
    use pretty_assertions::assert_eq;

    fn dataplane() -> DataPlane {
        let mut dp = DataPlane::new("proxy", Default::default());
        dp.metadata.namespace = Some("default".to_string());
        dp.metadata.uid = Some("dp-uid".to_string());
        dp
    }

    fn proxy_env(deployment: &Deployment, name: &str) -> Option<String> {
        let spec = deployment.spec.as_ref().unwrap();
        env_value(container(&spec.template, DATAPLANE_PROXY_CONTAINER).unwrap(), name)
            .map(str::to_string)
    }

    #[test]
    fn live_deployment_defaults() {
        let dp = dataplane();
        let deployment = deployment(&dp, State::Live, Some("kong:3.8"), &[], "cert").unwrap();
        assert_eq!(deployment.metadata.generate_name.as_deref(), Some("dataplane-proxy-"));
        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(
            spec.selector.match_labels.as_ref().unwrap().get(DEPLOYMENT_STATE_LABEL).map(String::as_str),
            Some("live")
        );
        assert_eq!(proxy_env(&deployment, "KONG_DATABASE").as_deref(), Some("off"));
        assert_eq!(proxy_env(&deployment, "KONG_PORT_MAPS").as_deref(), Some("80:8000, 443:8443"));
        assert!(deployment
            .metadata
            .annotations
            .as_ref()
            .unwrap()
            .contains_key(SPEC_HASH_ANNOTATION));
    }

    #[test]
    fn missing_image_is_a_spec_error() {
        let err = deployment(&dataplane(), State::Live, None, &[], "cert").unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(err.to_string(), "DataPlane requires an image");
    }

    #[test]
    fn hash_ignores_replicas_but_tracks_template() {
        let mut dp = dataplane();
        let a = deployment(&dp, State::Live, Some("kong:3.8"), &[], "cert").unwrap();
        dp.spec.options.deployment.replicas = Some(3);
        let b = deployment(&dp, State::Live, Some("kong:3.8"), &[], "cert").unwrap();
        let c = deployment(&dp, State::Live, Some("kong:3.9"), &[], "cert").unwrap();
        let hash = |d: &Deployment| d.metadata.annotations.as_ref().unwrap()[SPEC_HASH_ANNOTATION].clone();
        assert_eq!(hash(&a), hash(&b));
        assert_ne!(hash(&a), hash(&c));
        assert_eq!(b.spec.unwrap().replicas, Some(3));
    }

    #[test]
    fn template_hash_is_shared_by_live_and_preview() {
        let dp = dataplane();
        let live = deployment(&dp, State::Live, Some("kong:3.8"), &[], "live-cert").unwrap();
        let preview = deployment(&dp, State::Preview, Some("kong:3.8"), &[], "preview-cert").unwrap();
        let annotation = |d: &Deployment, key: &str| d.metadata.annotations.as_ref().unwrap()[key].clone();
        assert_eq!(
            annotation(&live, TEMPLATE_HASH_ANNOTATION),
            annotation(&preview, TEMPLATE_HASH_ANNOTATION)
        );
        assert_ne!(
            annotation(&live, SPEC_HASH_ANNOTATION),
            annotation(&preview, SPEC_HASH_ANNOTATION)
        );
        assert_eq!(preview.metadata.generate_name.as_deref(), Some("dataplane-preview-proxy-"));
    }

    #[test]
    fn autoscaled_live_deployment_has_no_replicas() {
        let mut dp = dataplane();
        dp.spec.options.deployment.scaling = Some(Scaling {
            horizontal_scaling: Some(HorizontalScaling {
                min_replicas: Some(2),
                max_replicas: 5,
                metrics: vec![],
            }),
        });
        assert_eq!(desired_replicas(&dp, State::Live), None);
        assert_eq!(desired_replicas(&dp, State::Preview), Some(2));
        let hpa = horizontal_pod_autoscaler(&dp, "dataplane-proxy-abcde").unwrap();
        assert_eq!(hpa.spec.unwrap().scale_target_ref.name, "dataplane-proxy-abcde");
    }

    #[test]
    fn preview_service_selects_only_preview_pods() {
        let dp = dataplane();
        let live = ingress_service(&dp, State::Live);
        let preview = ingress_service(&dp, State::Preview);
        let selector = |s: &Service| s.spec.as_ref().unwrap().selector.clone().unwrap();
        assert_eq!(selector(&preview)[DEPLOYMENT_STATE_LABEL], "preview");
        assert_eq!(selector(&live)[DEPLOYMENT_STATE_LABEL], "live");
        assert_eq!(preview.spec.unwrap().type_.as_deref(), Some("ClusterIP"));
        assert_eq!(live.spec.unwrap().type_.as_deref(), Some("LoadBalancer"));
    }

    #[test]
    fn fixed_ingress_name_applies_to_live_only() {
        let mut dp = dataplane();
        dp.spec.options.network.services.ingress = Some(DataPlaneServiceOptions {
            name: Some("edge".to_string()),
            ..Default::default()
        });
        assert_eq!(ingress_service(&dp, State::Live).metadata.name.as_deref(), Some("edge"));
        assert_eq!(ingress_service(&dp, State::Preview).metadata.name, None);
    }

    #[test]
    fn network_policy_follows_listen_configuration() {
        let mut dp = dataplane();
        dp.spec.options.deployment.pod_template_spec = Some(PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: DATAPLANE_PROXY_CONTAINER.to_string(),
                    env: Some(vec![EnvVar {
                        name: KONG_PROXY_LISTEN.to_string(),
                        value: Some("0.0.0.0:9000".to_string()),
                        value_from: None,
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        });
        let deployment = deployment(&dp, State::Live, Some("kong:3.8"), &[], "cert").unwrap();
        let policy = network_policy(&dp, &deployment);
        let rules = policy.spec.unwrap().ingress.unwrap();
        let ports = |rule: &NetworkPolicyIngressRule| -> Vec<IntOrString> {
            rule.ports.clone().unwrap().into_iter().filter_map(|p| p.port).collect()
        };
        assert_eq!(ports(&rules[0]), vec![IntOrString::Int(9000), IntOrString::Int(8100)]);
        assert_eq!(ports(&rules[1]), vec![IntOrString::Int(8444)]);
        assert!(rules[1].from.is_some());
    }

    #[test]
    fn plugins_are_mounted_and_enabled() {
        let dp = dataplane();
        let plugins = vec![ResolvedPlugin {
            name: "myheader".to_string(),
            config_map: "myheader-abc".to_string(),
        }];
        let deployment = deployment(&dp, State::Live, Some("kong:3.8"), &plugins, "cert").unwrap();
        assert_eq!(proxy_env(&deployment, KONG_PLUGINS).as_deref(), Some("bundled,myheader"));
        let spec = deployment.spec.unwrap().template.spec.unwrap();
        assert!(spec
            .volumes
            .unwrap()
            .iter()
            .any(|v| v.config_map.as_ref().and_then(|c| c.name.as_deref()) == Some("myheader-abc")));
    }

    #[test]
    fn user_port_maps_must_match_ports() {
        let mut dp = dataplane();
        assert_eq!(port_map_problem(&dp), None);
        dp.spec.options.deployment.pod_template_spec = Some(PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: DATAPLANE_PROXY_CONTAINER.to_string(),
                    env: Some(vec![EnvVar {
                        name: "KONG_PORT_MAPS".to_string(),
                        value: Some("80:8000".to_string()),
                        value_from: None,
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        });
        assert!(port_map_problem(&dp).is_some());
    }
}
