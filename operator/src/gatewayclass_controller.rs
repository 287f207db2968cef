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
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use kube::{
    api::{Api, ListParams},
    runtime::{controller::Action, watcher::Config, Controller},
    ResourceExt,
};
use tracing::{debug, info, warn};

use crate::backoff::{object_key, requeue_on_error};
use crate::gatewayclass_utils::*;
use crate::store::ObjectStore;
use crate::{with_deadline, Context, Error, Result};

pub async fn reconcile<S: ObjectStore>(gateway_class: Arc<GatewayClass>, ctx: Arc<Context<S>>) -> Result<Action> {
    let start = Instant::now();
    let name = gateway_class.name_any();

    if !is_ours(&gateway_class) {
        // The controllerName is immutable, so this class never becomes ours.
        debug!(name, "ignoring GatewayClass of another controller");
        return Ok(Action::await_change());
    }

    let result = with_deadline(
        ctx.config.reconcile_timeout(),
        Box::pin(reconcile_gatewayclass(&ctx, &name)),
    )
    .await;
    if result.is_ok() {
        ctx.backoff.reset(&object_key(gateway_class.as_ref()));
    }
    info!(
        name,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "finished reconciling GatewayClass"
    );
    result
}

async fn reconcile_gatewayclass<S: ObjectStore>(ctx: &Context<S>, name: &str) -> Result<Action> {
    let store = &ctx.store;
    let Some(gwc) = store.get::<GatewayClass>(None, name).await? else {
        return Ok(Action::await_change());
    };

    let problem = gateway_configuration(store, &gwc).await?.err();
    let mut updated = gwc.clone();
    accept(&mut updated, problem.as_deref());

    if serde_json::to_value(&updated.status)? != serde_json::to_value(&gwc.status)? {
        match &problem {
            None => info!(name, "marking GatewayClass as accepted"),
            Some(problem) => warn!(name, problem, "GatewayClass parameters are invalid"),
        }
        store.update_status(&updated).await?;
    }

    // A GatewayConfiguration created later is picked up on resync.
    Ok(Action::requeue(ctx.config.resync_period()))
}

pub async fn controller(ctx: Context) -> Result<()> {
    let gwc_api = Api::<GatewayClass>::all(ctx.store.client());
    gwc_api
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    Controller::new(gwc_api, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .for_each(|result| async move {
            if let Err(err) = result {
                warn!("GatewayClass reconcile failed: {err}");
            }
        })
        .await;

    Ok(())
}

fn error_policy<S: ObjectStore>(gateway_class: Arc<GatewayClass>, error: &Error, ctx: Arc<Context<S>>) -> Action {
    requeue_on_error(
        gateway_class.as_ref(),
        error,
        &ctx.backoff,
        ctx.config.resync_period(),
    )
}
