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

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use gateway_api::apis::standard::{gatewayclasses::GatewayClass, gateways::Gateway};
use kube::{
    api::{Api, ListParams},
    runtime::{
        controller::{self, Action},
        watcher, Controller,
    },
    Resource, ResourceExt,
};
use tracing::{debug, info, warn};

use crate::backoff::{object_key, requeue_on_error};
use crate::conditions::{is_ready, ConditionType, Reason, StatusBuilder};
use crate::consts::{MANAGED_BY_GATEWAY, MANAGED_BY_LABEL};
use crate::crds::{ControlPlane, DataPlane};
use crate::gateway_utils::*;
use crate::gatewayclass_utils::{gateway_configuration, is_accepted, is_ours};
use crate::owned::ensure_owned;
use crate::store::ObjectStore;
use crate::utils::{get_condition, set_condition};
use crate::{with_deadline, Context, Error, Result};

pub async fn reconcile<S: ObjectStore>(gateway: Arc<Gateway>, ctx: Arc<Context<S>>) -> Result<Action> {
    let start = Instant::now();
    let name = gateway.name_any();
    let namespace = gateway
        .namespace()
        .ok_or(Error::InvalidConfigError("invalid namespace".to_string()))?;

    let result = with_deadline(
        ctx.config.reconcile_timeout(),
        Box::pin(reconcile_gateway(&ctx, &namespace, &name)),
    )
    .await;
    if result.is_ok() {
        ctx.backoff.reset(&object_key(gateway.as_ref()));
    }
    info!(
        name,
        namespace,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "finished reconciling Gateway"
    );
    result
}

async fn reconcile_gateway<S: ObjectStore>(ctx: &Context<S>, namespace: &str, name: &str) -> Result<Action> {
    let store = &ctx.store;
    let Some(gw) = store.get::<Gateway>(Some(namespace), name).await? else {
        return Ok(Action::await_change());
    };
    if gw.meta().deletion_timestamp.is_some() {
        // The DataPlane and ControlPlane are garbage collected through owner references.
        return Ok(Action::await_change());
    }

    let class_name = &gw.spec.gateway_class_name;
    let Some(gateway_class) = store.get::<GatewayClass>(None, class_name).await? else {
        debug!(name, class_name, "GatewayClass not found");
        return Ok(Action::requeue(ctx.config.resync_period()));
    };
    if !is_ours(&gateway_class) {
        // Skip reconciling because we don't manage this resource.
        return Ok(Action::await_change());
    }
    let class_rejection = if is_accepted(&gateway_class) {
        match gateway_configuration(store, &gateway_class).await? {
            Ok(config) => Ok(config),
            Err(problem) => Err((Reason::InvalidParameters.to_string(), problem)),
        }
    } else {
        let (reason, message) = get_condition(&gateway_class, ConditionType::Accepted.as_str())
            .map(|c| (c.reason.clone(), c.message.clone()))
            .unwrap_or_else(|| (Reason::Pending.to_string(), "not reconciled yet".to_string()));
        Err((reason, message))
    };
    let config = match class_rejection {
        Ok(config) => config,
        Err((reason, message)) => {
            info!(name, class_name, reason = %reason, message = %message, "GatewayClass is not accepted");
            let mut updated = gw.clone();
            set_condition(&mut updated, get_accepted_condition(&gw, Some((reason.as_str(), message.as_str()))));
            set_condition(&mut updated, get_unprovisioned_condition(&gw));
            if serde_json::to_value(&updated.status)? != serde_json::to_value(&gw.status)? {
                store.update_status(&updated).await?;
            }
            return Ok(Action::requeue(ctx.config.resync_period()));
        }
    };

    let selector = owner_labels(&gw).selector();
    let dp = ensure_owned(
        store,
        Some(namespace),
        &selector,
        dataplane(&gw, config.as_ref()),
    )
    .await?;
    let cp = ensure_owned(
        store,
        Some(namespace),
        &selector,
        controlplane(&gw, config.as_ref(), &dp.name_any()),
    )
    .await?;

    let dataplane_ready = is_ready(&dp, dp.meta().generation);
    let controlplane_ready = is_ready(&cp, cp.meta().generation);

    let mut updated = gw.clone();
    set_listener_status(&mut updated, dataplane_ready)?;
    set_gateway_status_addresses(&mut updated, &dp);
    let accepted = get_accepted_condition(&updated, None);
    set_condition(&mut updated, accepted);
    let programmed = get_programmed_condition(&updated, &dp, dataplane_ready);
    set_condition(&mut updated, programmed);

    let generation = gw.meta().generation;
    let mut status = StatusBuilder::new(&mut updated, generation);
    for (type_, ready, kind, child) in [
        (ConditionType::DataPlaneReady, dataplane_ready, "DataPlane", dp.name_any()),
        (ConditionType::ControlPlaneReady, controlplane_ready, "ControlPlane", cp.name_any()),
    ] {
        if ready {
            status.set(type_, true, Reason::Ready, "");
        } else {
            status.set(
                type_,
                false,
                Reason::Pending,
                format!("waiting for {kind} {child} to become ready"),
            );
        }
    }

    if serde_json::to_value(&updated.status)? != serde_json::to_value(&gw.status)? {
        debug!(name, namespace, "updating Gateway status");
        store.update_status(&updated).await?;
    }

    Ok(Action::requeue(ctx.config.resync_period()))
}

pub async fn controller(ctx: Context) -> Result<()> {
    let client = ctx.store.client();
    let gateways = Api::<Gateway>::all(client.clone());
    gateways
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    let owned = watcher::Config::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_GATEWAY}"));
    let concurrency = ctx.config.concurrency;
    Controller::new(gateways, watcher::Config::default().any_semantic())
        .owns(Api::<DataPlane>::all(client.clone()), owned.clone())
        .owns(Api::<ControlPlane>::all(client), owned)
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .for_each(|result| async move {
            if let Err(err) = result {
                warn!("Gateway reconcile failed: {err}");
            }
        })
        .await;

    Ok(())
}

fn error_policy<S: ObjectStore>(gateway: Arc<Gateway>, error: &Error, ctx: Arc<Context<S>>) -> Action {
    requeue_on_error(gateway.as_ref(), error, &ctx.backoff, ctx.config.resync_period())
}
