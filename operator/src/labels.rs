//! Typed construction of the label sets written on owned objects and of the
//! selectors used to find them again. Every "list my objects" query goes
//! through [`OwnedLabels::selector`], so selectors cannot drift from the
//! labels the builders write.

use std::collections::BTreeMap;
use std::fmt;

use kube::{Resource, ResourceExt};

use crate::consts::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    DataPlane,
    ControlPlane,
    Gateway,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::DataPlane => MANAGED_BY_DATAPLANE,
            Component::ControlPlane => MANAGED_BY_CONTROLPLANE,
            Component::Gateway => MANAGED_BY_GATEWAY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceType {
    Ingress,
    Admin,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Ingress => SERVICE_TYPE_INGRESS,
            ServiceType::Admin => SERVICE_TYPE_ADMIN,
        }
    }
}

/// Whether an object belongs to the live or the preview set of a DataPlane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    Live,
    Preview,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Live => STATE_LIVE,
            State::Preview => STATE_PREVIEW,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Equality-based label selector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    /// Selects every object.
    pub fn everything() -> Self {
        Selector(BTreeMap::new())
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl From<BTreeMap<String, String>> for Selector {
    fn from(labels: BTreeMap<String, String>) -> Self {
        Selector(labels)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&parts.join(","))
    }
}

/// Labels identifying an object owned by a custom resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedLabels {
    selecting: BTreeMap<String, String>,
    informational: BTreeMap<String, String>,
}

impl OwnedLabels {
    pub fn new<K: Resource>(component: Component, owner: &K) -> Self {
        let meta = owner.meta();
        let mut selecting = BTreeMap::new();
        selecting.insert(MANAGED_BY_LABEL.to_string(), component.as_str().to_string());
        selecting.insert(
            OWNER_UID_LABEL.to_string(),
            meta.uid.clone().unwrap_or_default(),
        );

        let mut informational = BTreeMap::new();
        if let Some(name) = &meta.name {
            informational.insert(OWNER_NAME_LABEL.to_string(), truncate_label_value(name));
        }
        if let Some(ns) = &meta.namespace {
            informational.insert(OWNER_NAMESPACE_LABEL.to_string(), ns.clone());
        }
        OwnedLabels {
            selecting,
            informational,
        }
    }

    pub fn service_type(mut self, service_type: ServiceType) -> Self {
        self.selecting.insert(
            SERVICE_TYPE_LABEL.to_string(),
            service_type.as_str().to_string(),
        );
        self
    }

    pub fn service_state(mut self, state: State) -> Self {
        self.selecting
            .insert(SERVICE_STATE_LABEL.to_string(), state.as_str().to_string());
        self
    }

    pub fn deployment_state(mut self, state: State) -> Self {
        self.selecting
            .insert(DEPLOYMENT_STATE_LABEL.to_string(), state.as_str().to_string());
        self
    }

    pub fn secret_purpose(mut self, purpose: &str) -> Self {
        self.selecting
            .insert(SECRET_PURPOSE_LABEL.to_string(), purpose.to_string());
        self
    }

    pub fn plugin_type(mut self, plugin: &str) -> Self {
        self.selecting
            .insert(PLUGIN_TYPE_LABEL.to_string(), plugin.to_string());
        self
    }

    /// Selector matching every object carrying these labels.
    pub fn selector(&self) -> Selector {
        Selector(self.selecting.clone())
    }

    /// The full label set to write on the object.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.informational.clone();
        labels.extend(self.selecting.clone());
        labels
    }
}

/// Labels on the pods of a DataPlane or ControlPlane Deployment. Deployment and
/// Service selectors use exactly this set, so a preview Service can never
/// select live pods.
pub fn pod_labels(component: Component, owner_name: &str, state: Option<State>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), truncate_label_value(owner_name));
    labels.insert(MANAGED_BY_LABEL.to_string(), component.as_str().to_string());
    if let Some(state) = state {
        labels.insert(DEPLOYMENT_STATE_LABEL.to_string(), state.as_str().to_string());
    }
    labels
}

/// Maps an owned object back to the namespace/name of its owner using the
/// informational labels.
pub fn owner_of<K: Resource>(obj: &K, component: Component) -> Option<(String, String)> {
    let labels = obj.labels();
    if labels.get(MANAGED_BY_LABEL).map(String::as_str) != Some(component.as_str()) {
        return None;
    }
    let name = labels.get(OWNER_NAME_LABEL)?.clone();
    let namespace = labels.get(OWNER_NAMESPACE_LABEL)?.clone();
    Some((namespace, name))
}

// Label values are limited to 63 characters.
fn truncate_label_value(value: &str) -> String {
    value.chars().take(63).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::DataPlane;
    use pretty_assertions::assert_eq;

    fn dataplane() -> DataPlane {
        let mut dp = DataPlane::new("proxy", Default::default());
        dp.metadata.namespace = Some("default".to_string());
        dp.metadata.uid = Some("uid-1".to_string());
        dp
    }

    #[test]
    fn selector_matches_the_labels_it_was_built_from() {
        let owned = OwnedLabels::new(Component::DataPlane, &dataplane())
            .service_type(ServiceType::Ingress)
            .service_state(State::Preview);
        assert!(owned.selector().matches(&owned.labels()));
        assert_eq!(
            owned.selector().to_string(),
            "gateway-operator.konghq.com/dataplane-service-state=preview,\
             gateway-operator.konghq.com/dataplane-service-type=ingress,\
             gateway-operator.konghq.com/managed-by=dataplane,\
             gateway-operator.konghq.com/owner-uid=uid-1"
        );
    }

    #[test]
    fn live_selector_does_not_match_preview_labels() {
        let dp = dataplane();
        let live = OwnedLabels::new(Component::DataPlane, &dp).deployment_state(State::Live);
        let preview = OwnedLabels::new(Component::DataPlane, &dp).deployment_state(State::Preview);
        assert!(!live.selector().matches(&preview.labels()));
        assert!(Selector::everything().matches(&preview.labels()));
    }

    #[test]
    fn owner_is_recovered_from_informational_labels() {
        let dp = dataplane();
        let mut obj = k8s_openapi::api::core::v1::Service::default();
        obj.metadata.labels = Some(OwnedLabels::new(Component::DataPlane, &dp).labels());
        assert_eq!(
            owner_of(&obj, Component::DataPlane),
            Some(("default".to_string(), "proxy".to_string()))
        );
        assert_eq!(owner_of(&obj, Component::ControlPlane), None);
    }
}
