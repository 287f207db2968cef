use gateway_api::apis::standard::{
    gatewayclasses::{GatewayClass, GatewayClassStatus},
    gateways::{Gateway, GatewayStatus},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

use crate::crds::{ControlPlane, ControlPlaneStatus, DataPlane, DataPlaneStatus};

pub trait HasConditions {
    fn conditions(&self) -> &[metav1::Condition];
    fn get_conditions_mut(&mut self) -> &mut Vec<metav1::Condition>;
}

impl HasConditions for Gateway {
    fn conditions(&self) -> &[metav1::Condition] {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default()
    }

    fn get_conditions_mut(&mut self) -> &mut Vec<metav1::Condition> {
        self.status
            .get_or_insert_with(GatewayStatus::default)
            .conditions
            .get_or_insert_with(Vec::new)
    }
}

impl HasConditions for GatewayClass {
    fn conditions(&self) -> &[metav1::Condition] {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default()
    }

    fn get_conditions_mut(&mut self) -> &mut Vec<metav1::Condition> {
        self.status
            .get_or_insert_with(GatewayClassStatus::default)
            .conditions
            .get_or_insert_with(Vec::new)
    }
}

impl HasConditions for DataPlane {
    fn conditions(&self) -> &[metav1::Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    fn get_conditions_mut(&mut self) -> &mut Vec<metav1::Condition> {
        &mut self
            .status
            .get_or_insert_with(DataPlaneStatus::default)
            .conditions
    }
}

impl HasConditions for ControlPlane {
    fn conditions(&self) -> &[metav1::Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    fn get_conditions_mut(&mut self) -> &mut Vec<metav1::Condition> {
        &mut self
            .status
            .get_or_insert_with(ControlPlaneStatus::default)
            .conditions
    }
}

impl HasConditions for Vec<metav1::Condition> {
    fn conditions(&self) -> &[metav1::Condition] {
        self.as_slice()
    }

    fn get_conditions_mut(&mut self) -> &mut Vec<metav1::Condition> {
        self
    }
}
