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

use gateway_api::apis::standard::gatewayclasses::GatewayClass;

use crate::conditions::{ConditionType, Reason, StatusBuilder};
use crate::consts::{GATEWAY_CLASS_CONTROLLER_NAME, OPERATOR_API_GROUP};
use crate::crds::GatewayConfiguration;
use crate::store::ObjectStore;
use crate::utils::is_condition_true;
use crate::Result;

const GATEWAY_CONFIGURATION_KIND: &str = "GatewayConfiguration";

pub fn is_ours(gateway_class: &GatewayClass) -> bool {
    gateway_class.spec.controller_name == GATEWAY_CLASS_CONTROLLER_NAME
}

pub fn is_accepted(gateway_class: &GatewayClass) -> bool {
    is_condition_true(gateway_class, ConditionType::Accepted.as_str())
}

/// Resolves the GatewayConfiguration named by `parametersRef`.
///
/// The outer result carries store failures; the inner one explains why the
/// reference is unusable. A class without `parametersRef` resolves to `None`.
pub async fn gateway_configuration<S: ObjectStore>(
    store: &S,
    gateway_class: &GatewayClass,
) -> Result<std::result::Result<Option<GatewayConfiguration>, String>> {
    let Some(params) = &gateway_class.spec.parameters_ref else {
        return Ok(Ok(None));
    };
    if params.group != OPERATOR_API_GROUP || params.kind != GATEWAY_CONFIGURATION_KIND {
        return Ok(Err(format!(
            "parametersRef must point to a {OPERATOR_API_GROUP}/{GATEWAY_CONFIGURATION_KIND}, got {}/{}",
            params.group, params.kind
        )));
    }
    let Some(namespace) = params.namespace.as_deref() else {
        return Ok(Err(format!(
            "parametersRef to {GATEWAY_CONFIGURATION_KIND} {} must set a namespace",
            params.name
        )));
    };
    match store
        .get::<GatewayConfiguration>(Some(namespace), &params.name)
        .await?
    {
        Some(config) => Ok(Ok(Some(config))),
        None => Ok(Err(format!(
            "{GATEWAY_CONFIGURATION_KIND} {namespace}/{} not found",
            params.name
        ))),
    }
}

/// Sets `Accepted` on the class: True, or False with `InvalidParameters` and
/// the reason the parameters could not be resolved.
pub fn accept(gateway_class: &mut GatewayClass, problem: Option<&str>) {
    let generation = gateway_class.metadata.generation;
    let mut status = StatusBuilder::new(gateway_class, generation);
    match problem {
        None => status.set(
            ConditionType::Accepted,
            true,
            Reason::Accepted,
            "the Kong gateway operator accepts responsibility for this GatewayClass",
        ),
        Some(problem) => status.set(
            ConditionType::Accepted,
            false,
            Reason::InvalidParameters,
            problem,
        ),
    }
}
