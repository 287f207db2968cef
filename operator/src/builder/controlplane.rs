//! Desired objects of a ControlPlane: the ingress controller Deployment, its
//! RBAC, the admission webhook wiring and the metrics extension plugin.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    RuleWithOperations, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
    WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
    SecretVolumeSource, Service, ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use serde_json::json;

use super::kong_env::env;
use super::pod_template::merge_pod_template;
use super::{cluster_owned_meta, container, owned_meta, with_annotation};
use crate::certs::{service_dns_names, CertificateRequest, Usage};
use crate::consts::*;
use crate::crds::{
    ControlPlane, ControllerState, ControllerToggle, DataPlaneMetricsExtension, KongPlugin,
    WatchNamespacesType,
};
use crate::labels::{pod_labels, Component, OwnedLabels, Selector};
use crate::utils::compute_hash;
use crate::{Error, Result};

/// Sub-controllers of the ingress controller that `spec.controllers` can toggle,
/// with their default state.
pub const KNOWN_CONTROLLERS: [(&str, ControllerState); 18] = [
    ("INGRESS_NETV1", ControllerState::Enabled),
    ("INGRESS_CLASS_NETV1", ControllerState::Enabled),
    ("INGRESS_CLASS_PARAMETERS", ControllerState::Enabled),
    ("KONG_CLUSTERPLUGIN", ControllerState::Enabled),
    ("KONG_PLUGIN", ControllerState::Enabled),
    ("KONG_CONSUMER", ControllerState::Enabled),
    ("KONG_CONSUMERGROUP", ControllerState::Enabled),
    ("KONG_INGRESS", ControllerState::Enabled),
    ("KONG_UDPINGRESS", ControllerState::Enabled),
    ("KONG_TCPINGRESS", ControllerState::Enabled),
    ("KONG_CUSTOM_ENTITY", ControllerState::Enabled),
    ("KONG_VAULT", ControllerState::Enabled),
    ("KONG_LICENSE", ControllerState::Disabled),
    ("SERVICE", ControllerState::Enabled),
    ("GWAPI_GATEWAY", ControllerState::Enabled),
    ("GWAPI_HTTPROUTE", ControllerState::Enabled),
    ("GWAPI_GRPCROUTE", ControllerState::Enabled),
    ("GWAPI_REFERENCE_GRANT", ControllerState::Enabled),
];

/// Where the ingress controller finds the proxy it configures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPlaneEndpoints {
    pub admin_service: String,
    pub ingress_service: String,
}

/// Everything the ControlPlane Deployment depends on besides the ControlPlane itself.
pub struct ControlPlaneInputs<'a> {
    pub dataplane: Option<&'a DataPlaneEndpoints>,
    pub controllers: &'a [ControllerToggle],
    pub watch_namespaces: Option<&'a [String]>,
    pub service_account: &'a str,
    pub client_cert_secret: &'a str,
    pub webhook_cert_secret: &'a str,
    pub default_image: Option<&'a str>,
}

fn generate_name(kind: Option<&str>, owner: &str) -> String {
    match kind {
        Some(kind) => format!("controlplane-{kind}-{owner}-"),
        None => format!("controlplane-{owner}-"),
    }
}

pub fn owner_labels(cp: &ControlPlane) -> OwnedLabels {
    OwnedLabels::new(Component::ControlPlane, cp)
}

pub fn secret_labels(cp: &ControlPlane, purpose: &str) -> OwnedLabels {
    owner_labels(cp).secret_purpose(purpose)
}

pub fn plugin_labels(cp: &ControlPlane, plugin: &str) -> OwnedLabels {
    owner_labels(cp).plugin_type(plugin)
}

/// Effective state of every known sub-controller after applying
/// `spec.controllers`. Unknown names are a spec error.
pub fn effective_controllers(cp: &ControlPlane) -> Result<Vec<ControllerToggle>> {
    if let Some(unknown) = cp
        .spec
        .options
        .controllers
        .iter()
        .find(|toggle| !KNOWN_CONTROLLERS.iter().any(|(name, _)| *name == toggle.name))
    {
        return Err(Error::SpecError(format!(
            "unknown controller {} in spec.controllers",
            unknown.name
        )));
    }
    Ok(KNOWN_CONTROLLERS
        .iter()
        .map(|(name, default)| ControllerToggle {
            name: name.to_string(),
            state: cp
                .spec
                .options
                .controllers
                .iter()
                .rev()
                .find(|toggle| toggle.name == *name)
                .map(|toggle| toggle.state)
                .unwrap_or(*default),
        })
        .collect())
}

/// Namespaces the ingress controller watches. `None` means all namespaces.
/// The ControlPlane's own namespace is always part of a restricted set.
pub fn watch_namespaces(cp: &ControlPlane) -> Option<Vec<String>> {
    let own = cp.namespace().unwrap_or_default();
    let options = cp.spec.options.watch_namespaces.as_ref()?;
    let mut namespaces = match options.type_ {
        WatchNamespacesType::All => return None,
        WatchNamespacesType::Own => vec![],
        WatchNamespacesType::List => options.list.clone(),
    };
    namespaces.push(own);
    namespaces.sort();
    namespaces.dedup();
    Some(namespaces)
}

fn controller_env(cp: &ControlPlane, inputs: &ControlPlaneInputs<'_>) -> Vec<EnvVar> {
    let namespace = cp.namespace().unwrap_or_default();
    let cert_path = |file: &str| format!("{CLUSTER_CERTIFICATE_PATH}/{file}");
    let webhook_path = |file: &str| format!("{WEBHOOK_CERTIFICATE_PATH}/{file}");
    let mut vars = vec![
        env("CONTROLLER_ELECTION_ID", format!("{}.konghq.com", cp.name_any())),
        env("CONTROLLER_KONG_ADMIN_SVC_PORT_NAMES", "admin"),
        env("CONTROLLER_GATEWAY_DISCOVERY_DNS_STRATEGY", "service"),
        env("CONTROLLER_KONG_ADMIN_INIT_RETRY_DELAY", "5s"),
        env("CONTROLLER_KONG_ADMIN_TLS_CLIENT_CERT_FILE", cert_path(TLS_CERT_KEY)),
        env("CONTROLLER_KONG_ADMIN_TLS_CLIENT_KEY_FILE", cert_path(TLS_KEY_KEY)),
        env("CONTROLLER_KONG_ADMIN_CA_CERT_FILE", cert_path(CA_CERT_KEY)),
        env(
            "CONTROLLER_ADMISSION_WEBHOOK_LISTEN",
            format!("0.0.0.0:{WEBHOOK_PORT}"),
        ),
        env("CONTROLLER_ADMISSION_WEBHOOK_CERT_PATH", webhook_path(TLS_CERT_KEY)),
        env("CONTROLLER_ADMISSION_WEBHOOK_KEY_PATH", webhook_path(TLS_KEY_KEY)),
        env(
            "CONTROLLER_INGRESS_CLASS",
            cp.spec.ingress_class.clone().unwrap_or_else(|| "kong".to_string()),
        ),
    ];
    if let Some(dp) = inputs.dataplane {
        vars.push(env(
            "CONTROLLER_KONG_ADMIN_SVC",
            format!("{namespace}/{}", dp.admin_service),
        ));
        vars.push(env(
            "CONTROLLER_PUBLISH_SERVICE",
            format!("{namespace}/{}", dp.ingress_service),
        ));
    }
    if let Some(namespaces) = inputs.watch_namespaces {
        vars.push(env("CONTROLLER_WATCH_NAMESPACE", namespaces.join(",")));
    }
    for toggle in inputs.controllers {
        vars.push(env(
            &format!("CONTROLLER_ENABLE_CONTROLLER_{}", toggle.name),
            (toggle.state == ControllerState::Enabled).to_string(),
        ));
    }
    vars
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

fn probe(path: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(CONTROLPLANE_HEALTH_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        timeout_seconds: Some(1),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

/// The ingress controller Deployment. Without a DataPlane it is scaled to zero.
pub fn deployment(cp: &ControlPlane, inputs: &ControlPlaneInputs<'_>) -> Result<Deployment> {
    let name = cp.name_any();
    let selector_labels = pod_labels(Component::ControlPlane, &name, None);

    let defaults = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(selector_labels.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            service_account_name: Some(inputs.service_account.to_string()),
            containers: vec![Container {
                name: CONTROLPLANE_CONTAINER.to_string(),
                image: inputs.default_image.map(str::to_string),
                env: Some(controller_env(cp, inputs)),
                ports: Some(vec![
                    ContainerPort {
                        name: Some("webhook".to_string()),
                        container_port: WEBHOOK_PORT,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                    ContainerPort {
                        name: Some("health".to_string()),
                        container_port: CONTROLPLANE_HEALTH_PORT,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                ]),
                readiness_probe: Some(probe("/readyz")),
                liveness_probe: Some(probe("/healthz")),
                volume_mounts: Some(vec![
                    mount(CLUSTER_CERTIFICATE_VOLUME, CLUSTER_CERTIFICATE_PATH),
                    mount(WEBHOOK_CERTIFICATE_VOLUME, WEBHOOK_CERTIFICATE_PATH),
                ]),
                ..Default::default()
            }],
            volumes: Some(vec![
                secret_volume(CLUSTER_CERTIFICATE_VOLUME, inputs.client_cert_secret),
                secret_volume(WEBHOOK_CERTIFICATE_VOLUME, inputs.webhook_cert_secret),
            ]),
            ..Default::default()
        }),
    };
    let template = merge_pod_template(
        defaults,
        cp.spec.options.deployment.pod_template_spec.as_ref(),
    );
    let has_image = container(&template, CONTROLPLANE_CONTAINER)
        .and_then(|c| c.image.as_deref())
        .is_some_and(|image| !image.is_empty());
    if !has_image {
        return Err(Error::SpecError("ControlPlane requires an image".to_string()));
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
        owned_meta(cp, generate_name(None, &name), &owner_labels(cp)),
        SPEC_HASH_ANNOTATION,
        compute_hash(&spec),
    );
    let replicas = match inputs.dataplane {
        Some(_) => cp.spec.options.deployment.replicas.unwrap_or(1),
        None => 0,
    };
    Ok(Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            ..spec
        }),
        status: None,
    })
}

pub fn service_account(cp: &ControlPlane) -> ServiceAccount {
    ServiceAccount {
        metadata: owned_meta(cp, generate_name(None, &cp.name_any()), &owner_labels(cp)),
        ..Default::default()
    }
}

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(strings(groups)),
        resources: Some(strings(resources)),
        verbs: strings(verbs),
        ..Default::default()
    }
}

const READ: [&str; 3] = ["get", "list", "watch"];

/// Cluster-wide permissions the ingress controller needs.
pub fn cluster_role(cp: &ControlPlane) -> ClusterRole {
    ClusterRole {
        metadata: cluster_owned_meta(generate_name(None, &cp.name_any()), &owner_labels(cp)),
        rules: Some(vec![
            rule(
                &[""],
                &["configmaps", "endpoints", "nodes", "pods", "secrets", "services", "namespaces"],
                &READ,
            ),
            rule(&[""], &["events"], &["create", "patch"]),
            rule(&[""], &["services/status"], &["get", "patch", "update"]),
            rule(&["discovery.k8s.io"], &["endpointslices"], &READ),
            rule(&["coordination.k8s.io"], &["leases"], &["get", "list", "watch", "create", "update", "patch"]),
            rule(&["networking.k8s.io"], &["ingresses", "ingressclasses"], &READ),
            rule(&["networking.k8s.io"], &["ingresses/status"], &["get", "patch", "update"]),
            rule(&["configuration.konghq.com"], &["*"], &READ),
            rule(&["configuration.konghq.com"], &["*/status"], &["get", "patch", "update"]),
            rule(&["gateway.networking.k8s.io"], &["*"], &READ),
            rule(&["gateway.networking.k8s.io"], &["*/status"], &["get", "patch", "update"]),
        ]),
        aggregation_rule: None,
    }
}

pub fn cluster_role_binding(cp: &ControlPlane, cluster_role: &str, service_account: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: cluster_owned_meta(generate_name(None, &cp.name_any()), &owner_labels(cp)),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.to_string(),
            namespace: cp.namespace(),
            api_group: None,
        }]),
    }
}

/// Certificate the ingress controller presents to the DataPlane admin API.
pub fn client_certificate<'a>(cp: &ControlPlane, selector: &'a Selector) -> CertificateRequest<'a> {
    let name = cp.name_any();
    CertificateRequest {
        metadata: owned_meta(
            cp,
            generate_name(Some("admin-cert"), &name),
            &secret_labels(cp, SECRET_PURPOSE_ADMIN_CLIENT),
        ),
        selector,
        common_name: name.clone(),
        dns_names: vec![name],
        usage: Usage::Client,
    }
}

pub fn webhook_service(cp: &ControlPlane) -> Service {
    let name = cp.name_any();
    Service {
        metadata: owned_meta(cp, generate_name(Some("webhook"), &name), &owner_labels(cp)),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(pod_labels(Component::ControlPlane, &name, None)),
            ports: Some(vec![ServicePort {
                name: Some("webhook".to_string()),
                port: WEBHOOK_SERVICE_PORT,
                target_port: Some(IntOrString::Int(WEBHOOK_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Serving certificate of the admission webhook.
pub fn webhook_certificate<'a>(
    cp: &ControlPlane,
    webhook_service: &str,
    selector: &'a Selector,
) -> CertificateRequest<'a> {
    CertificateRequest {
        metadata: owned_meta(
            cp,
            generate_name(Some("webhook-cert"), &cp.name_any()),
            &secret_labels(cp, SECRET_PURPOSE_WEBHOOK),
        ),
        selector,
        common_name: webhook_service.to_string(),
        dns_names: service_dns_names(webhook_service, &cp.namespace().unwrap_or_default()),
        usage: Usage::Server,
    }
}

fn webhook_rule(group: &str, resources: &[&str]) -> RuleWithOperations {
    RuleWithOperations {
        api_groups: Some(vec![group.to_string()]),
        api_versions: Some(vec!["*".to_string()]),
        operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        scope: None,
    }
}

pub fn validating_webhook_configuration(
    cp: &ControlPlane,
    webhook_service: &str,
    ca_pem: &str,
) -> ValidatingWebhookConfiguration {
    let webhooks = vec![ValidatingWebhook {
        name: "validations.kong.konghq.com".to_string(),
        admission_review_versions: vec!["v1".to_string()],
        side_effects: "None".to_string(),
        failure_policy: Some("Ignore".to_string()),
        client_config: WebhookClientConfig {
            ca_bundle: Some(ByteString(ca_pem.as_bytes().to_vec())),
            service: Some(ServiceReference {
                name: webhook_service.to_string(),
                namespace: cp.namespace().unwrap_or_default(),
                path: Some("/".to_string()),
                port: Some(WEBHOOK_SERVICE_PORT),
            }),
            url: None,
        },
        rules: Some(vec![
            webhook_rule(
                "configuration.konghq.com",
                &["kongplugins", "kongclusterplugins", "kongconsumers", "kongconsumergroups", "kongingresses"],
            ),
            webhook_rule("gateway.networking.k8s.io", &["gateways", "httproutes"]),
        ]),
        ..Default::default()
    }];
    let metadata = with_annotation(
        cluster_owned_meta(generate_name(Some("webhook"), &cp.name_any()), &owner_labels(cp)),
        SPEC_HASH_ANNOTATION,
        compute_hash(&webhooks),
    );
    ValidatingWebhookConfiguration {
        metadata,
        webhooks: Some(webhooks),
    }
}

pub const PROMETHEUS_PLUGIN: &str = "prometheus";

/// Name of the prometheus KongPlugin a ControlPlane creates in the namespace
/// of a metrics extension.
pub fn metrics_plugin_name(cp: &ControlPlane) -> String {
    format!(
        "{}-{}-{PROMETHEUS_PLUGIN}",
        cp.namespace().unwrap_or_default(),
        cp.name_any()
    )
}

/// The prometheus KongPlugin for `extension`. It may live in another
/// namespace than the ControlPlane, so ownership is tracked by labels.
pub fn metrics_plugin(cp: &ControlPlane, extension: &DataPlaneMetricsExtension) -> KongPlugin {
    let config = &extension.spec.config;
    let metadata = ObjectMeta {
        name: Some(metrics_plugin_name(cp)),
        namespace: extension.namespace(),
        labels: Some(plugin_labels(cp, PROMETHEUS_PLUGIN).labels()),
        ..Default::default()
    };
    KongPlugin::new(
        metadata,
        PROMETHEUS_PLUGIN,
        Some(json!({
            "per_consumer": false,
            "latency_metrics": config.latency,
            "bandwidth_metrics": config.bandwidth,
            "upstream_health_metrics": config.upstream_health_checks,
            "status_code_metrics": config.status_code_metrics,
        })),
    )
}

/// Adds `plugin` to a comma-separated plugin annotation value.
pub fn add_plugin(annotations: &BTreeMap<String, String>, plugin: &str) -> Option<String> {
    let current = annotations.get(KONG_PLUGINS_ANNOTATION).map(String::as_str).unwrap_or("");
    let mut plugins: Vec<&str> = current.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
    if plugins.contains(&plugin) {
        return None;
    }
    plugins.push(plugin);
    Some(plugins.join(","))
}

/// Removes `plugin` from a comma-separated plugin annotation value. Returns
/// `None` when the plugin is not listed, and `Some("")` when nothing is left.
pub fn remove_plugin(annotations: &BTreeMap<String, String>, plugin: &str) -> Option<String> {
    let current = annotations.get(KONG_PLUGINS_ANNOTATION)?;
    let plugins: Vec<&str> = current.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
    if !plugins.contains(&plugin) {
        return None;
    }
    let remaining: Vec<&str> = plugins.into_iter().filter(|p| *p != plugin).collect();
    Some(remaining.join(","))
}
