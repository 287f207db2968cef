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

use std::collections::HashMap;

use chrono::Utc;
use gateway_api::apis::standard::{
    constants::{
        GatewayConditionReason, GatewayConditionType, ListenerConditionReason,
        ListenerConditionType,
    },
    gateways::{
        Gateway, GatewayListeners, GatewayListenersAllowedRoutesKinds, GatewayStatus,
        GatewayStatusAddresses, GatewayStatusListeners, GatewayStatusListenersSupportedKinds,
    },
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::ResourceExt;

use crate::builder::owned_meta;
use crate::consts::{PROXY_PORT, PROXY_SSL_PORT};
use crate::crds::{
    ControlPlane, ControlPlaneSpec, DataPlane, DataPlaneServicePort, DataPlaneSpec, GatewayConfiguration,
};
use crate::labels::{Component, OwnedLabels};
use crate::utils::set_condition;
use crate::{Error, Result};

const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";
const HTTP_ROUTE_KIND: &str = "HTTPRoute";

pub fn owner_labels(gateway: &Gateway) -> OwnedLabels {
    OwnedLabels::new(Component::Gateway, gateway)
}

// Proxy port a listener of the given protocol is served on, if supported.
fn listener_target_port(protocol: &str) -> Option<i32> {
    match protocol {
        "HTTP" => Some(PROXY_PORT),
        "HTTPS" => Some(PROXY_SSL_PORT),
        _ => None,
    }
}

/// Ingress Service ports for the Gateway's supported listeners.
pub fn listener_ports(gateway: &Gateway) -> Vec<DataPlaneServicePort> {
    gateway
        .spec
        .listeners
        .iter()
        .filter_map(|listener| {
            listener_target_port(&listener.protocol).map(|target| DataPlaneServicePort {
                name: Some(listener.name.clone()),
                port: listener.port,
                target_port: Some(target),
            })
        })
        .collect()
}

/// The DataPlane a Gateway runs on. Options come from the GatewayConfiguration;
/// ingress ports follow the listeners unless the configuration pins them.
pub fn dataplane(gateway: &Gateway, config: Option<&GatewayConfiguration>) -> DataPlane {
    let mut options = config
        .and_then(|c| c.spec.data_plane_options.clone())
        .unwrap_or_default();
    let ports = listener_ports(gateway);
    let ingress = options.network.services.ingress.get_or_insert_with(Default::default);
    if ingress.ports.is_empty() {
        ingress.ports = ports;
    }

    DataPlane {
        metadata: owned_meta(gateway, format!("{}-", gateway.name_any()), &owner_labels(gateway)),
        spec: DataPlaneSpec { options },
        status: None,
    }
}

/// The ControlPlane configuring `dataplane_name`. Extensions of the
/// GatewayConfiguration are attached after those of its ControlPlane options.
pub fn controlplane(
    gateway: &Gateway,
    config: Option<&GatewayConfiguration>,
    dataplane_name: &str,
) -> ControlPlane {
    let mut options = config
        .and_then(|c| c.spec.control_plane_options.clone())
        .unwrap_or_default();
    if let Some(config) = config {
        for extension in &config.spec.extensions {
            if !options.extensions.contains(extension) {
                options.extensions.push(extension.clone());
            }
        }
    }

    ControlPlane {
        metadata: owned_meta(gateway, format!("{}-", gateway.name_any()), &owner_labels(gateway)),
        spec: ControlPlaneSpec {
            options,
            data_plane: Some(dataplane_name.to_string()),
            ingress_class: None,
        },
        status: None,
    }
}

// Modifies the Gateway's status to reflect the addresses of its DataPlane's
// ingress Service. Addresses are only reported once the Service has one.
pub fn set_gateway_status_addresses(gateway: &mut Gateway, dataplane: &DataPlane) {
    let addresses: Vec<GatewayStatusAddresses> = dataplane
        .status
        .iter()
        .flat_map(|status| status.addresses.iter())
        .map(|addr| GatewayStatusAddresses {
            r#type: Some(addr.type_.clone()),
            value: addr.value.clone(),
        })
        .collect();

    let status = gateway.status.get_or_insert_with(GatewayStatus::default);
    status.addresses = (!addresses.is_empty()).then_some(addresses);
}

pub fn has_addresses(gateway: &Gateway) -> bool {
    gateway
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .is_some_and(|a| !a.is_empty())
}

fn condition(
    type_: impl ToString,
    status: bool,
    reason: impl ToString,
    message: impl Into<String>,
    generation: Option<i64>,
) -> metav1::Condition {
    metav1::Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        observed_generation: generation,
        last_transition_time: metav1::Time(Utc::now()),
        message: message.into(),
    }
}

// Returns the Gateway's "Accepted" condition. It follows the GatewayClass
// alone: `class_rejection` carries the reason and message of a class that is
// not accepted or whose parameters cannot be resolved. Invalid listeners are
// reported on the listeners themselves.
pub fn get_accepted_condition(gateway: &Gateway, class_rejection: Option<(&str, &str)>) -> metav1::Condition {
    let generation = gateway.metadata.generation;
    match class_rejection {
        None => condition(
            GatewayConditionType::Accepted,
            true,
            GatewayConditionReason::Accepted,
            "the Kong gateway operator accepts responsibility for this Gateway",
            generation,
        ),
        Some((reason, message)) => condition(
            GatewayConditionType::Accepted,
            false,
            reason,
            format!("GatewayClass {} is not accepted: {message}", gateway.spec.gateway_class_name),
            generation,
        ),
    }
}

// "Programmed" of a Gateway that is not provisioned because its class is rejected.
pub fn get_unprovisioned_condition(gateway: &Gateway) -> metav1::Condition {
    condition(
        GatewayConditionType::Programmed,
        false,
        GatewayConditionReason::Pending,
        "waiting for the GatewayClass to be accepted",
        gateway.metadata.generation,
    )
}

// Returns the "Programmed" condition: the DataPlane is ready and its Service
// has an address.
pub fn get_programmed_condition(gateway: &Gateway, dataplane: &DataPlane, dataplane_ready: bool) -> metav1::Condition {
    let generation = gateway.metadata.generation;
    if !dataplane_ready {
        condition(
            GatewayConditionType::Programmed,
            false,
            "Pending",
            format!("waiting for DataPlane {} to become ready", dataplane.name_any()),
            generation,
        )
    } else if !has_addresses(gateway) {
        condition(
            GatewayConditionType::Programmed,
            false,
            GatewayConditionReason::AddressNotAssigned,
            "the DataPlane ingress Service has no address yet",
            generation,
        )
    } else {
        condition(
            GatewayConditionType::Programmed,
            true,
            GatewayConditionReason::Programmed,
            "",
            generation,
        )
    }
}

// Inspects the provided Gateway and sets the status of its listeners.
// Conditions whose status did not change keep their transition time.
pub fn set_listener_status(gateway: &mut Gateway, dataplane_ready: bool) -> Result<()> {
    let generation = gateway
        .metadata
        .generation
        .ok_or(Error::InvalidConfigError("Gateway generation not found".to_string()))?;

    let mut current: HashMap<String, GatewayStatusListeners> = gateway
        .status
        .as_ref()
        .and_then(|s| s.listeners.clone())
        .unwrap_or_default()
        .into_iter()
        .map(|l| (l.name.clone(), l))
        .collect();

    let mut statuses = vec![];
    for listener in &gateway.spec.listeners {
        let (supported_kinds, conditions) = get_listener_status(listener, generation, dataplane_ready);
        let mut merged = current
            .remove(&listener.name)
            .map(|l| l.conditions)
            .unwrap_or_default();
        merged.retain(|c| conditions.iter().any(|n| n.type_ == c.type_));
        for condition in conditions {
            set_condition(&mut merged, condition);
        }
        statuses.push(GatewayStatusListeners {
            name: listener.name.clone(),
            attached_routes: 0,
            supported_kinds,
            conditions: merged,
        });
    }

    gateway
        .status
        .get_or_insert_with(GatewayStatus::default)
        .listeners = Some(statuses);
    Ok(())
}

// Inspects the provided listener and returns the route kinds it supports and
// its ResolvedRefs, Accepted and Programmed conditions.
fn get_listener_status(
    listener: &GatewayListeners,
    generation: i64,
    dataplane_ready: bool,
) -> (
    Vec<GatewayStatusListenersSupportedKinds>,
    Vec<metav1::Condition>,
) {
    let generation = Some(generation);
    if listener_target_port(&listener.protocol).is_none() {
        let message = format!(
            "unsupported protocol {}, must be one of HTTP or HTTPS",
            listener.protocol
        );
        return (
            vec![],
            vec![
                condition(
                    ListenerConditionType::ResolvedRefs,
                    true,
                    ListenerConditionReason::ResolvedRefs,
                    "",
                    generation,
                ),
                condition(
                    ListenerConditionType::Accepted,
                    false,
                    ListenerConditionReason::UnsupportedProtocol,
                    message.clone(),
                    generation,
                ),
                condition(
                    ListenerConditionType::Programmed,
                    false,
                    ListenerConditionReason::Invalid,
                    message,
                    generation,
                ),
            ],
        );
    }

    let supported_kinds = vec![GatewayStatusListenersSupportedKinds {
        group: Some(GATEWAY_API_GROUP.to_string()),
        kind: HTTP_ROUTE_KIND.to_string(),
    }];
    let route_kinds_problem = listener
        .allowed_routes
        .as_ref()
        .and_then(|routes| routes.kinds.as_deref())
        .and_then(check_route_kinds);

    let conditions = match route_kinds_problem {
        Some(message) => vec![
            condition(
                ListenerConditionType::ResolvedRefs,
                false,
                ListenerConditionReason::InvalidRouteKinds,
                message.clone(),
                generation,
            ),
            condition(
                ListenerConditionType::Accepted,
                true,
                ListenerConditionReason::Accepted,
                "",
                generation,
            ),
            condition(
                ListenerConditionType::Programmed,
                false,
                ListenerConditionReason::Invalid,
                message,
                generation,
            ),
        ],
        None => vec![
            condition(
                ListenerConditionType::ResolvedRefs,
                true,
                ListenerConditionReason::ResolvedRefs,
                "",
                generation,
            ),
            condition(
                ListenerConditionType::Accepted,
                true,
                ListenerConditionReason::Accepted,
                "",
                generation,
            ),
            if dataplane_ready {
                condition(
                    ListenerConditionType::Programmed,
                    true,
                    ListenerConditionType::Programmed,
                    "",
                    generation,
                )
            } else {
                condition(
                    ListenerConditionType::Programmed,
                    false,
                    "Pending",
                    "waiting for the DataPlane to become ready",
                    generation,
                )
            },
        ],
    };
    (supported_kinds, conditions)
}

fn check_route_kinds(kinds: &[GatewayListenersAllowedRoutesKinds]) -> Option<String> {
    kinds.iter().find_map(|rgk| {
        if rgk.kind != HTTP_ROUTE_KIND {
            return Some(format!(
                "unsupported route kind {}; only {HTTP_ROUTE_KIND} is supported",
                rgk.kind
            ));
        }
        match rgk.group.as_deref() {
            Some(group) if group != GATEWAY_API_GROUP => Some(format!("unsupported API group: {group}")),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{ControlPlaneOptions, ExtensionRef, GatewayConfigurationSpec};
    use gateway_api::apis::standard::gateways::{GatewayListenersAllowedRoutes, GatewaySpec};
    use pretty_assertions::assert_eq;

    fn listener(name: &str, protocol: &str, port: i32) -> GatewayListeners {
        GatewayListeners {
            name: name.to_string(),
            protocol: protocol.to_string(),
            port,
            ..Default::default()
        }
    }

    fn gateway(listeners: Vec<GatewayListeners>) -> Gateway {
        let mut gw = Gateway::new(
            "edge",
            GatewaySpec {
                gateway_class_name: "kong".to_string(),
                listeners,
                ..Default::default()
            },
        );
        gw.metadata.namespace = Some("default".to_string());
        gw.metadata.uid = Some("gw-uid".to_string());
        gw.metadata.generation = Some(2);
        gw
    }

    fn listener_condition(gw: &Gateway, name: &str, type_: &str) -> (String, String) {
        let status = gw.status.as_ref().unwrap();
        let listener = status
            .listeners
            .as_ref()
            .unwrap()
            .iter()
            .find(|l| l.name == name)
            .unwrap();
        let condition = listener.conditions.iter().find(|c| c.type_ == type_).unwrap();
        (condition.status.clone(), condition.reason.clone())
    }

    #[test]
    fn listeners_map_to_proxy_ports() {
        let gw = gateway(vec![
            listener("http", "HTTP", 80),
            listener("https", "HTTPS", 443),
            listener("tcp", "TCP", 9000),
        ]);
        let dp = dataplane(&gw, None);
        let ingress = dp.spec.options.network.services.ingress.unwrap();
        assert_eq!(
            ingress.ports,
            vec![
                DataPlaneServicePort {
                    name: Some("http".into()),
                    port: 80,
                    target_port: Some(8000)
                },
                DataPlaneServicePort {
                    name: Some("https".into()),
                    port: 443,
                    target_port: Some(8443)
                },
            ]
        );
        assert_eq!(dp.metadata.generate_name.as_deref(), Some("edge-"));
        assert_eq!(
            dp.metadata.owner_references.unwrap()[0].kind,
            "Gateway".to_string()
        );
    }

    #[test]
    fn configuration_extensions_follow_controlplane_options() {
        let gw = gateway(vec![listener("http", "HTTP", 80)]);
        let metrics = ExtensionRef {
            group: "gateway-operator.konghq.com".into(),
            kind: "DataPlaneMetricsExtension".into(),
            name: "metrics".into(),
            namespace: None,
        };
        let config = GatewayConfiguration::new(
            "custom",
            GatewayConfigurationSpec {
                control_plane_options: Some(ControlPlaneOptions {
                    extensions: vec![metrics.clone()],
                    ..Default::default()
                }),
                extensions: vec![metrics.clone()],
                ..Default::default()
            },
        );
        let cp = controlplane(&gw, Some(&config), "edge-abcde");
        assert_eq!(cp.spec.data_plane.as_deref(), Some("edge-abcde"));
        assert_eq!(cp.spec.options.extensions, vec![metrics]);
    }

    #[test]
    fn unsupported_protocol_rejects_listener_only() {
        let mut gw = gateway(vec![listener("http", "HTTP", 80), listener("udp", "UDP", 53)]);
        set_listener_status(&mut gw, true).unwrap();

        assert_eq!(
            listener_condition(&gw, "udp", "Accepted"),
            ("False".into(), "UnsupportedProtocol".into())
        );
        assert_eq!(
            listener_condition(&gw, "http", "Programmed"),
            ("True".into(), "Programmed".into())
        );
        let accepted = get_accepted_condition(&gw, None);
        assert_eq!(
            (accepted.status.as_str(), accepted.reason.as_str()),
            ("True", "Accepted")
        );

        let rejected = get_accepted_condition(&gw, Some(("InvalidParameters", "GatewayConfiguration default/custom not found")));
        assert_eq!(
            (rejected.status.as_str(), rejected.reason.as_str()),
            ("False", "InvalidParameters")
        );
        assert!(rejected.message.ends_with("GatewayConfiguration default/custom not found"));
    }

    #[test]
    fn listener_programmed_waits_for_dataplane() {
        let mut gw = gateway(vec![listener("http", "HTTP", 80)]);
        set_listener_status(&mut gw, false).unwrap();
        assert_eq!(
            listener_condition(&gw, "http", "Programmed"),
            ("False".into(), "Pending".into())
        );
        set_listener_status(&mut gw, true).unwrap();
        assert_eq!(
            listener_condition(&gw, "http", "Programmed"),
            ("True".into(), "Programmed".into())
        );
    }

    #[test]
    fn foreign_route_kinds_are_unresolved() {
        let mut http = listener("http", "HTTP", 80);
        http.allowed_routes = Some(GatewayListenersAllowedRoutes {
            kinds: Some(vec![GatewayListenersAllowedRoutesKinds {
                group: None,
                kind: "TCPRoute".into(),
            }]),
            namespaces: None,
        });
        let mut gw = gateway(vec![http]);
        set_listener_status(&mut gw, true).unwrap();
        assert_eq!(
            listener_condition(&gw, "http", "ResolvedRefs"),
            ("False".into(), "InvalidRouteKinds".into())
        );
        assert_eq!(
            listener_condition(&gw, "http", "Programmed"),
            ("False".into(), "Invalid".into())
        );
    }
}
