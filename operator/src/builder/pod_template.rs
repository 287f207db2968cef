//! Merges a user supplied pod template over the operator's defaults.
//!
//! Containers, env vars, volume mounts, ports and volumes are matched by name.
//! Values set by the user win; anything the user did not set keeps its default.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};

fn merge_by_key<T: Clone>(
    defaults: Option<Vec<T>>,
    overrides: Option<&Vec<T>>,
    key: impl Fn(&T) -> Option<String>,
) -> Option<Vec<T>> {
    let Some(overrides) = overrides else {
        return defaults;
    };
    let mut merged = defaults.unwrap_or_default();
    for item in overrides {
        match merged
            .iter_mut()
            .find(|existing| key(existing).is_some() && key(existing) == key(item))
        {
            Some(existing) => *existing = item.clone(),
            None => merged.push(item.clone()),
        }
    }
    Some(merged)
}

fn merge_container(default: Container, user: &Container) -> Container {
    let mut merged = user.clone();
    merged.image = user.image.clone().or(default.image);
    merged.env = merge_by_key(default.env, user.env.as_ref(), |e| Some(e.name.clone()));
    merged.volume_mounts = merge_by_key(default.volume_mounts, user.volume_mounts.as_ref(), |m| {
        Some(m.name.clone())
    });
    merged.ports = merge_by_key(default.ports, user.ports.as_ref(), |p| p.name.clone());
    merged.readiness_probe = user.readiness_probe.clone().or(default.readiness_probe);
    merged.liveness_probe = user.liveness_probe.clone().or(default.liveness_probe);
    merged.resources = user.resources.clone().or(default.resources);
    merged.args = user.args.clone().or(default.args);
    merged.command = user.command.clone().or(default.command);
    merged
}

fn merge_labels(
    defaults: Option<BTreeMap<String, String>>,
    user: Option<&BTreeMap<String, String>>,
    user_wins: bool,
) -> Option<BTreeMap<String, String>> {
    let Some(user) = user else {
        return defaults;
    };
    let mut merged = user.clone();
    for (key, value) in defaults.unwrap_or_default() {
        if !user_wins || !merged.contains_key(&key) {
            merged.insert(key, value);
        }
    }
    Some(merged)
}

/// Merges `user` over `defaults`. Labels from `defaults` always win because
/// Deployment and Service selectors rely on them.
pub fn merge_pod_template(defaults: PodTemplateSpec, user: Option<&PodTemplateSpec>) -> PodTemplateSpec {
    let Some(user) = user else {
        return defaults;
    };
    let default_meta = defaults.metadata.unwrap_or_default();
    let user_meta = user.metadata.clone().unwrap_or_default();
    let mut metadata = user_meta.clone();
    metadata.labels = merge_labels(default_meta.labels, user_meta.labels.as_ref(), false);
    metadata.annotations = merge_labels(default_meta.annotations, user_meta.annotations.as_ref(), true);

    let default_spec = defaults.spec.unwrap_or_default();
    let spec = match user.spec.as_ref() {
        None => default_spec,
        Some(user_spec) => {
            let mut spec: PodSpec = user_spec.clone();
            let mut containers: Vec<Container> = vec![];
            for default in default_spec.containers {
                match user_spec.containers.iter().find(|c| c.name == default.name) {
                    Some(user_container) => containers.push(merge_container(default, user_container)),
                    None => containers.push(default),
                }
            }
            for user_container in &user_spec.containers {
                if !containers.iter().any(|c| c.name == user_container.name) {
                    containers.push(user_container.clone());
                }
            }
            spec.containers = containers;
            spec.volumes = merge_by_key(default_spec.volumes, user_spec.volumes.as_ref(), |v| {
                Some(v.name.clone())
            });
            spec.service_account_name = user_spec
                .service_account_name
                .clone()
                .or(default_spec.service_account_name);
            spec.termination_grace_period_seconds = user_spec
                .termination_grace_period_seconds
                .or(default_spec.termination_grace_period_seconds);
            spec
        }
    };

    PodTemplateSpec {
        metadata: Some(metadata),
        spec: Some(spec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::EnvVar;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use pretty_assertions::assert_eq;

    fn env(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        }
    }

    fn template(labels: &[(&str, &str)], containers: Vec<Container>) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn user_values_win_and_defaults_fill_gaps() {
        let defaults = template(
            &[("app", "proxy")],
            vec![Container {
                name: "proxy".to_string(),
                image: Some("kong:3.8".to_string()),
                env: Some(vec![env("KONG_DATABASE", "off"), env("KONG_PLUGINS", "bundled")]),
                ..Default::default()
            }],
        );
        let user = template(
            &[("app", "override"), ("team", "edge")],
            vec![
                Container {
                    name: "proxy".to_string(),
                    image: Some("kong:3.9".to_string()),
                    env: Some(vec![env("KONG_PLUGINS", "bundled,acme"), env("EXTRA", "1")]),
                    ..Default::default()
                },
                Container {
                    name: "sidecar".to_string(),
                    ..Default::default()
                },
            ],
        );

        let merged = merge_pod_template(defaults, Some(&user));
        let labels = merged.metadata.unwrap().labels.unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("proxy"));
        assert_eq!(labels.get("team").map(String::as_str), Some("edge"));

        let containers = merged.spec.unwrap().containers;
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].image.as_deref(), Some("kong:3.9"));
        assert_eq!(
            containers[0].env.clone().unwrap(),
            vec![
                env("KONG_DATABASE", "off"),
                env("KONG_PLUGINS", "bundled,acme"),
                env("EXTRA", "1"),
            ]
        );
        assert_eq!(containers[1].name, "sidecar");
    }

    #[test]
    fn missing_user_image_keeps_default() {
        let defaults = template(
            &[],
            vec![Container {
                name: "proxy".to_string(),
                image: Some("kong:3.8".to_string()),
                ..Default::default()
            }],
        );
        let user = template(
            &[],
            vec![Container {
                name: "proxy".to_string(),
                ..Default::default()
            }],
        );
        let merged = merge_pod_template(defaults, Some(&user));
        assert_eq!(merged.spec.unwrap().containers[0].image.as_deref(), Some("kong:3.8"));
    }
}
