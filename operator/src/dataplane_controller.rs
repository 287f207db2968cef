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
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
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
use crate::builder::dataplane::{self as build, ResolvedPlugin};
use crate::certs::{ensure_certificate_secret, ensure_cluster_ca, ClusterCa};
use crate::conditions::{ConditionType, Reason, StatusBuilder};
use crate::consts::{
    MANAGED_BY_DATAPLANE, MANAGED_BY_LABEL, PROMOTE_WHEN_READY_ANNOTATION, TEMPLATE_HASH_ANNOTATION,
};
use crate::crds::{
    DataPlane, DataPlaneRolloutStatus, RolloutResourcePlanDeployment, RolloutStatusDeployment,
    RolloutStatusService, RolloutStatusServices,
};
use crate::dataplane_rollout::{rollout_state, Observed, RolloutState};
use crate::dataplane_utils::*;
use crate::labels::{ServiceType, State};
use crate::owned::{delete_owned, ensure_owned};
use crate::store::ObjectStore;
use crate::{with_deadline, Context, Error, Result};

/// Ingress and admin Services of one state, plus the admin certificate Secret.
struct ServiceSet {
    ingress: Service,
    admin: Service,
    admin_cert: String,
}

pub async fn reconcile<S: ObjectStore>(dataplane: Arc<DataPlane>, ctx: Arc<Context<S>>) -> Result<Action> {
    let start = Instant::now();
    let name = dataplane.name_any();
    let namespace = dataplane
        .namespace()
        .ok_or(Error::InvalidConfigError("invalid namespace".to_string()))?;

    let result = with_deadline(
        ctx.config.reconcile_timeout(),
        Box::pin(reconcile_dataplane(&ctx, &namespace, &name)),
    )
    .await;
    if result.is_ok() {
        ctx.backoff.reset(&object_key(dataplane.as_ref()));
    }
    info!(
        name,
        namespace,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "finished reconciling DataPlane"
    );
    result
}

async fn reconcile_dataplane<S: ObjectStore>(ctx: &Context<S>, namespace: &str, name: &str) -> Result<Action> {
    let store = &ctx.store;
    // Work from a fresh read, not the (possibly stale) object the event carried.
    let Some(dp) = store.get::<DataPlane>(Some(namespace), name).await? else {
        return Ok(Action::await_change());
    };
    if dp.meta().deletion_timestamp.is_some() {
        // Owned objects are garbage collected through owner references.
        return Ok(Action::await_change());
    }

    let mut updated = dp.clone();
    match Box::pin(converge(ctx, &dp, &mut updated)).await {
        Ok(trigger_consumed) => {
            let current = write_status(store, &dp, &updated).await?;
            if trigger_consumed && current.promote_when_ready() {
                let mut cleared = current.clone();
                if let Some(annotations) = cleared.metadata.annotations.as_mut() {
                    annotations.remove(PROMOTE_WHEN_READY_ANNOTATION);
                }
                store.update(&cleared).await?;
                info!(name, namespace, "cleared promotion trigger");
            }
            Ok(Action::requeue(ctx.config.resync_period()))
        }
        Err(err) if err.is_terminal() => {
            let mut failed = dp.clone();
            let mut status = StatusBuilder::new(&mut failed, dp.meta().generation);
            status.set(ConditionType::OptionsValid, false, Reason::SpecInvalid, err.to_string());
            status.set(ConditionType::Ready, false, Reason::SpecInvalid, err.to_string());
            write_status(store, &dp, &failed).await?;
            Err(err)
        }
        Err(err) => Err(err),
    }
}

async fn write_status<S: ObjectStore>(store: &S, original: &DataPlane, updated: &DataPlane) -> Result<DataPlane> {
    if original.status == updated.status {
        return Ok(original.clone());
    }
    debug!(name = %original.name_any(), "updating DataPlane status");
    store.update_status(updated).await
}

/// Converges every object the DataPlane owns and records the outcome in
/// `updated`'s status. Returns whether a promotion finished, which consumes
/// the promotion trigger.
async fn converge<S: ObjectStore>(ctx: &Context<S>, dp: &DataPlane, updated: &mut DataPlane) -> Result<bool> {
    let store = &ctx.store;
    let namespace = dp.namespace();
    let ns = namespace.as_deref();
    let image = ctx.config.default_dataplane_image();
    let generation = dp.meta().generation;

    dp.validate()?;
    let ca = Box::pin(ensure_cluster_ca(store, &ctx.config)).await?;
    let resolution = resolve_plugins(store, dp).await?;

    let live_set = Box::pin(ensure_service_set(store, &ca, dp, State::Live)).await?;
    let desired_live = build::deployment(dp, State::Live, image, &resolution.plugins, &live_set.admin_cert)?;
    let desired_hash = desired_live
        .annotations()
        .get(TEMPLATE_HASH_ANNOTATION)
        .cloned()
        .unwrap_or_default();

    let live_selector = build::deployment_labels(dp, State::Live).selector();
    let preview_selector = build::deployment_labels(dp, State::Preview).selector();
    let live_existing: Option<Deployment> = oldest(store.list(ns, &live_selector).await?);
    let preview_existing: Option<Deployment> = oldest(store.list(ns, &preview_selector).await?);
    let preview_services = preview_services_exist(store, dp).await?;

    let state = rollout_state(
        dp,
        &desired_hash,
        &Observed {
            live: live_existing.as_ref(),
            preview: preview_existing.as_ref(),
            preview_services,
        },
    );
    debug!(
        name = %dp.name_any(),
        state = %state,
        preview = state.has_preview(),
        "derived rollout state"
    );

    let had_rollout = dp.status.as_ref().is_some_and(|s| s.rollout.is_some());
    let (live, rollout, trigger_consumed) = match (state, live_existing) {
        (RolloutState::Progressing | RolloutState::AwaitingPromotion, Some(live)) => {
            let (preview_set, _) = Box::pin(ensure_preview(store, &ca, dp, image, &resolution.plugins)).await?;
            let rollout = rollout_status(dp, state, &preview_set, generation);
            (live, Some(rollout), false)
        }
        (RolloutState::Promoting, _) => {
            info!(name = %dp.name_any(), "promoting preview Deployment to live");
            Box::pin(ensure_preview(store, &ca, dp, image, &resolution.plugins)).await?;
            let live = ensure_owned(store, ns, &live_selector, desired_live).await?;
            Box::pin(cleanup_preview(store, dp)).await?;
            // Kept until the trigger is removed; a leftover trigger is then
            // consumed rather than approving the next rollout.
            (live, Some(promoted_status(dp, generation)), true)
        }
        _ => {
            let live = ensure_owned(store, ns, &live_selector, desired_live).await?;
            Box::pin(cleanup_preview(store, dp)).await?;
            // A finished rollout whose trigger was never cleared; a trigger set
            // without a rollout in flight is kept as pre-approval.
            let rollout = dp
                .status
                .as_ref()
                .and_then(|s| s.rollout.clone())
                .filter(|r| dp.promote_when_ready() && is_promoted(r));
            (live, rollout, had_rollout)
        }
    };

    let owner_selector = build::owner_labels(dp).selector();
    match build::horizontal_pod_autoscaler(dp, &live.name_any()) {
        Some(hpa) => {
            ensure_owned(store, ns, &owner_selector, hpa).await?;
        }
        None => {
            delete_owned::<_, HorizontalPodAutoscaler>(store, ns, &owner_selector).await?;
        }
    }
    ensure_owned::<_, NetworkPolicy>(store, ns, &owner_selector, build::network_policy(dp, &live)).await?;

    let (replicas, ready_replicas) = replica_counts(&live);
    let status = updated.status.get_or_insert_with(Default::default);
    status.service = Some(live_set.ingress.name_any());
    status.addresses = service_addresses(&live_set.ingress);
    status.selector = Some(build::pod_selector(dp, State::Live).to_string());
    status.replicas = replicas;
    status.ready_replicas = ready_replicas;
    status.rollout = rollout;

    let mut conditions = StatusBuilder::new(updated, generation);
    conditions.set(
        ConditionType::Provisioned,
        true,
        Reason::Provisioned,
        "owned objects are in place",
    );
    match build::port_map_problem(dp) {
        Some(problem) => conditions.set(ConditionType::OptionsValid, false, Reason::PortMapMismatch, problem),
        None => conditions.set(ConditionType::OptionsValid, true, Reason::OptionsValid, ""),
    }
    match &resolution.problem {
        Some((reason, message)) => conditions.set(ConditionType::ResolvedRefs, false, *reason, message.clone()),
        None => conditions.set(ConditionType::ResolvedRefs, true, Reason::ResolvedRefs, ""),
    }
    conditions.set_ready(
        deployment_ready(&live),
        "waiting for the live Deployment's replicas to become ready",
    );

    Ok(trigger_consumed)
}

async fn ensure_service_set<S: ObjectStore>(
    store: &S,
    ca: &ClusterCa,
    dp: &DataPlane,
    state: State,
) -> Result<ServiceSet> {
    let namespace = dp.namespace();
    let ns = namespace.as_deref();
    let admin = ensure_owned(
        store,
        ns,
        &build::service_labels(dp, ServiceType::Admin, state).selector(),
        build::admin_service(dp, state),
    )
    .await?;
    let cert_selector = build::certificate_labels(dp, state).selector();
    let cert = Box::pin(ensure_certificate_secret(
        store,
        ca,
        build::admin_certificate(dp, state, &admin.name_any(), &cert_selector),
    ))
    .await?;
    let ingress = ensure_owned(
        store,
        ns,
        &build::service_labels(dp, ServiceType::Ingress, state).selector(),
        build::ingress_service(dp, state),
    )
    .await?;
    Ok(ServiceSet {
        ingress,
        admin,
        admin_cert: cert.name_any(),
    })
}

async fn ensure_preview<S: ObjectStore>(
    store: &S,
    ca: &ClusterCa,
    dp: &DataPlane,
    image: Option<&str>,
    plugins: &[ResolvedPlugin],
) -> Result<(ServiceSet, Deployment)> {
    let set = Box::pin(ensure_service_set(store, ca, dp, State::Preview)).await?;
    let desired = build::deployment(dp, State::Preview, image, plugins, &set.admin_cert)?;
    let namespace = dp.namespace();
    let preview = ensure_owned(
        store,
        namespace.as_deref(),
        &build::deployment_labels(dp, State::Preview).selector(),
        desired,
    )
    .await?;
    Ok((set, preview))
}

async fn preview_services_exist<S: ObjectStore>(store: &S, dp: &DataPlane) -> Result<bool> {
    let namespace = dp.namespace();
    for service_type in [ServiceType::Ingress, ServiceType::Admin] {
        let selector = build::service_labels(dp, service_type, State::Preview).selector();
        let services: Vec<Service> = store.list(namespace.as_deref(), &selector).await?;
        if services.is_empty() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Removes the preview set. The preview Deployment is scaled to zero instead
/// when the rollout plan keeps it between rollouts.
async fn cleanup_preview<S: ObjectStore>(store: &S, dp: &DataPlane) -> Result<()> {
    let namespace = dp.namespace();
    let ns = namespace.as_deref();
    let deployments = build::deployment_labels(dp, State::Preview).selector();
    let keep_deployment = dp
        .blue_green()
        .is_some_and(|bg| {
            bg.resources.plan.deployment == RolloutResourcePlanDeployment::ScaleDownOnPromotionScaleUpOnRollout
        });

    if keep_deployment {
        let previews: Vec<Deployment> = store.list(ns, &deployments).await?;
        for mut preview in previews {
            let spec = preview.spec.get_or_insert_with(Default::default);
            if spec.replicas != Some(0) {
                spec.replicas = Some(0);
                info!(name = %preview.name_any(), "scaling down preview Deployment");
                store.update(&preview).await?;
            }
        }
    } else {
        delete_owned::<_, Deployment>(store, ns, &deployments).await?;
    }

    for service_type in [ServiceType::Ingress, ServiceType::Admin] {
        let selector = build::service_labels(dp, service_type, State::Preview).selector();
        delete_owned::<_, Service>(store, ns, &selector).await?;
    }
    delete_owned::<_, Secret>(store, ns, &build::certificate_labels(dp, State::Preview).selector()).await?;
    Ok(())
}

fn rollout_status(
    dp: &DataPlane,
    state: RolloutState,
    preview: &ServiceSet,
    generation: Option<i64>,
) -> DataPlaneRolloutStatus {
    let (reason, message) = match state {
        RolloutState::AwaitingPromotion => (
            Reason::RolloutAwaitingPromotion,
            "preview Deployment is ready and waiting for promotion",
        ),
        _ => (Reason::RolloutProgressing, "preview Deployment is rolling out"),
    };
    let mut conditions = dp
        .status
        .as_ref()
        .and_then(|s| s.rollout.as_ref())
        .map(|r| r.conditions.clone())
        .unwrap_or_default();
    StatusBuilder::new(&mut conditions, generation).set(ConditionType::RolledOut, false, reason, message);

    let service_status = |service: &Service| RolloutStatusService {
        name: service.name_any(),
        addresses: service_addresses(service),
    };
    DataPlaneRolloutStatus {
        conditions,
        deployment: Some(RolloutStatusDeployment {
            selector: Some(build::pod_selector(dp, State::Preview).to_string()),
        }),
        services: Some(RolloutStatusServices {
            ingress: Some(service_status(&preview.ingress)),
            admin_api: Some(service_status(&preview.admin)),
        }),
    }
}

/// Rollout status of a promotion that finished but whose trigger is still set.
fn promoted_status(dp: &DataPlane, generation: Option<i64>) -> DataPlaneRolloutStatus {
    let mut conditions = dp
        .status
        .as_ref()
        .and_then(|s| s.rollout.as_ref())
        .map(|r| r.conditions.clone())
        .unwrap_or_default();
    StatusBuilder::new(&mut conditions, generation).set(
        ConditionType::RolledOut,
        true,
        Reason::RolloutPromotionDone,
        "preview Deployment was promoted to live",
    );
    DataPlaneRolloutStatus {
        conditions,
        deployment: None,
        services: None,
    }
}

fn is_promoted(rollout: &DataPlaneRolloutStatus) -> bool {
    rollout
        .conditions
        .iter()
        .any(|c| c.type_ == ConditionType::RolledOut.as_str() && c.reason == Reason::RolloutPromotionDone.as_str())
}

pub async fn controller(ctx: Context) -> Result<()> {
    let client = ctx.store.client();
    let dataplanes = Api::<DataPlane>::all(client.clone());
    dataplanes
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    let owned = watcher::Config::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_DATAPLANE}"));
    let concurrency = ctx.config.concurrency;
    Controller::new(dataplanes, watcher::Config::default().any_semantic())
        .owns(Api::<Deployment>::all(client.clone()), owned.clone())
        .owns(Api::<Service>::all(client.clone()), owned.clone())
        .owns(Api::<Secret>::all(client.clone()), owned.clone())
        .owns(Api::<HorizontalPodAutoscaler>::all(client.clone()), owned.clone())
        .owns(Api::<NetworkPolicy>::all(client), owned)
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .for_each(|result| async move {
            if let Err(err) = result {
                warn!("DataPlane reconcile failed: {err}");
            }
        })
        .await;

    Ok(())
}

fn error_policy<S: ObjectStore>(dataplane: Arc<DataPlane>, error: &Error, ctx: Arc<Context<S>>) -> Action {
    requeue_on_error(
        dataplane.as_ref(),
        error,
        &ctx.backoff,
        ctx.config.resync_period(),
    )
}
