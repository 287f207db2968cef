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
use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::{
    api::{Api, ListParams},
    runtime::{
        controller::{self, Action},
        reflector::ObjectRef,
        watcher, Controller,
    },
    Resource, ResourceExt,
};
use tracing::{debug, info, warn};

use crate::backoff::{object_key, requeue_on_error};
use crate::builder::controlplane::{self as build, ControlPlaneInputs};
use crate::certs::{ensure_certificate_secret, ensure_cluster_ca};
use crate::conditions::{ConditionType, Reason, StatusBuilder};
use crate::consts::{
    MANAGED_BY_CONTROLPLANE, MANAGED_BY_LABEL, SECRET_PURPOSE_ADMIN_CLIENT, SECRET_PURPOSE_WEBHOOK,
};
use crate::controlplane_utils::*;
use crate::crds::ControlPlane;
use crate::dataplane_utils::deployment_ready;
use crate::labels::{owner_of, Component};
use crate::owned::ensure_owned;
use crate::store::ObjectStore;
use crate::{with_deadline, Context, Error, Result};

pub async fn reconcile<S: ObjectStore>(controlplane: Arc<ControlPlane>, ctx: Arc<Context<S>>) -> Result<Action> {
    let start = Instant::now();
    let name = controlplane.name_any();
    let namespace = controlplane
        .namespace()
        .ok_or(Error::InvalidConfigError("invalid namespace".to_string()))?;

    let result = with_deadline(
        ctx.config.reconcile_timeout(),
        Box::pin(reconcile_controlplane(&ctx, &namespace, &name)),
    )
    .await;
    if result.is_ok() {
        ctx.backoff.reset(&object_key(controlplane.as_ref()));
    }
    info!(
        name,
        namespace,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "finished reconciling ControlPlane"
    );
    result
}

async fn reconcile_controlplane<S: ObjectStore>(ctx: &Context<S>, namespace: &str, name: &str) -> Result<Action> {
    let store = &ctx.store;
    let Some(mut cp) = store.get::<ControlPlane>(Some(namespace), name).await? else {
        return Ok(Action::await_change());
    };

    if cp.meta().deletion_timestamp.is_some() {
        if has_finalizers(&cp) {
            info!(name, namespace, "cleaning up deleted ControlPlane");
            cleanup(store, &cp).await?;
            store.update(&without_finalizers(&cp)).await?;
        }
        return Ok(Action::await_change());
    }
    if let Some(finalized) = with_finalizers(&cp) {
        debug!(name, namespace, "adding cleanup finalizers");
        cp = store.update(&finalized).await?;
    }

    let controllers = match build::effective_controllers(&cp) {
        Ok(controllers) => controllers,
        Err(err) => return fail(store, &cp, Reason::UnknownController, err).await,
    };

    let mut updated = cp.clone();
    match Box::pin(converge(ctx, &cp, &controllers, &mut updated)).await {
        Ok(()) => {
            if cp.status != updated.status {
                debug!(name, namespace, "updating ControlPlane status");
                store.update_status(&updated).await?;
            }
            Ok(Action::requeue(ctx.config.resync_period()))
        }
        Err(err) if err.is_terminal() => fail(store, &cp, Reason::SpecInvalid, err).await,
        Err(err) => Err(err),
    }
}

// Records a terminal spec error in the status and returns it.
async fn fail<S: ObjectStore>(store: &S, cp: &ControlPlane, reason: Reason, err: Error) -> Result<Action> {
    let mut failed = cp.clone();
    let mut status = StatusBuilder::new(&mut failed, cp.meta().generation);
    status.set(ConditionType::OptionsValid, false, reason, err.to_string());
    status.set(ConditionType::Ready, false, reason, err.to_string());
    if cp.status != failed.status {
        store.update_status(&failed).await?;
    }
    Err(err)
}

async fn converge<S: ObjectStore>(
    ctx: &Context<S>,
    cp: &ControlPlane,
    controllers: &[crate::crds::ControllerToggle],
    updated: &mut ControlPlane,
) -> Result<()> {
    let store = &ctx.store;
    let namespace = cp.namespace();
    let ns = namespace.as_deref();
    let selector = build::owner_labels(cp).selector();

    let ca = Box::pin(ensure_cluster_ca(store, &ctx.config)).await?;
    let dataplane = dataplane_endpoints(store, cp).await?;
    let watched = build::watch_namespaces(cp);
    let missing = match &watched {
        Some(namespaces) => missing_grants(store, cp, namespaces).await?,
        None => vec![],
    };

    let service_account = ensure_owned(store, ns, &selector, build::service_account(cp)).await?;
    let client_selector = build::secret_labels(cp, SECRET_PURPOSE_ADMIN_CLIENT).selector();
    let client_cert: Secret =
        Box::pin(ensure_certificate_secret(store, &ca, build::client_certificate(cp, &client_selector))).await?;
    let webhook_service: Service = ensure_owned(store, ns, &selector, build::webhook_service(cp)).await?;
    let webhook_selector = build::secret_labels(cp, SECRET_PURPOSE_WEBHOOK).selector();
    let webhook_cert = Box::pin(ensure_certificate_secret(
        store,
        &ca,
        build::webhook_certificate(cp, &webhook_service.name_any(), &webhook_selector),
    ))
    .await?;

    let cluster_role: ClusterRole = ensure_owned(store, None, &selector, build::cluster_role(cp)).await?;
    ensure_owned::<_, ClusterRoleBinding>(
        store,
        None,
        &selector,
        build::cluster_role_binding(cp, &cluster_role.name_any(), &service_account.name_any()),
    )
    .await?;
    ensure_owned::<_, ValidatingWebhookConfiguration>(
        store,
        None,
        &selector,
        build::validating_webhook_configuration(cp, &webhook_service.name_any(), ca.cert_pem()),
    )
    .await?;

    let desired = build::deployment(
        cp,
        &ControlPlaneInputs {
            dataplane: dataplane.as_ref().ok(),
            controllers,
            watch_namespaces: watched.as_deref(),
            service_account: &service_account.name_any(),
            client_cert_secret: &client_cert.name_any(),
            webhook_cert_secret: &webhook_cert.name_any(),
            default_image: ctx.config.default_controlplane_image(),
        },
    )?;
    let deployment: Deployment = ensure_owned(store, ns, &selector, desired).await?;

    let extensions = metrics_extensions(store, cp).await?;
    Box::pin(reconcile_metrics_plugins(store, cp, &extensions)).await?;

    let status = updated.status.get_or_insert_with(Default::default);
    status.controllers = controllers.to_vec();
    status.data_plane = cp.spec.data_plane.clone().filter(|_| dataplane.is_ok());

    let mut conditions = StatusBuilder::new(updated, cp.meta().generation);
    match &dataplane {
        Ok(_) => conditions.set(
            ConditionType::Provisioned,
            true,
            Reason::Provisioned,
            "owned objects are in place",
        ),
        Err(message) => conditions.set(ConditionType::Provisioned, false, Reason::NoDataPlane, message.clone()),
    }
    conditions.set(ConditionType::OptionsValid, true, Reason::OptionsValid, "");
    if missing.is_empty() {
        conditions.set(
            ConditionType::WatchNamespaceGrantValid,
            true,
            Reason::WatchNamespaceGrantValid,
            "",
        );
    } else {
        conditions.set(
            ConditionType::WatchNamespaceGrantValid,
            false,
            Reason::WatchNamespaceGrantMissing,
            format!("missing WatchNamespaceGrant in namespaces: {}", missing.join(",")),
        );
    }
    conditions.set_ready(
        deployment_ready(&deployment),
        "waiting for the ingress controller Deployment to become ready",
    );
    Ok(())
}

pub async fn controller(ctx: Context) -> Result<()> {
    let client = ctx.store.client();
    let controlplanes = Api::<ControlPlane>::all(client.clone());
    controlplanes
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    let owned = watcher::Config::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_CONTROLPLANE}"));
    let concurrency = ctx.config.concurrency;
    Controller::new(controlplanes, watcher::Config::default().any_semantic())
        .owns(Api::<Deployment>::all(client.clone()), owned.clone())
        .owns(Api::<Service>::all(client.clone()), owned.clone())
        .owns(Api::<Secret>::all(client.clone()), owned.clone())
        .owns(Api::<ServiceAccount>::all(client.clone()), owned.clone())
        .watches(Api::<ClusterRole>::all(client.clone()), owned.clone(), by_owner_labels::<ClusterRole>)
        .watches(Api::<ClusterRoleBinding>::all(client.clone()), owned.clone(), by_owner_labels::<ClusterRoleBinding>)
        .watches(Api::<ValidatingWebhookConfiguration>::all(client), owned, by_owner_labels::<ValidatingWebhookConfiguration>)
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .for_each(|result| async move {
            if let Err(err) = result {
                warn!("ControlPlane reconcile failed: {err}");
            }
        })
        .await;

    Ok(())
}

// Cluster-scoped children cannot carry owner references; they are mapped back
// through their owner labels.
fn by_owner_labels<K: Resource>(obj: K) -> Option<ObjectRef<ControlPlane>> {
    owner_of(&obj, Component::ControlPlane).map(|(namespace, name)| ObjectRef::new(&name).within(&namespace))
}

fn error_policy<S: ObjectStore>(controlplane: Arc<ControlPlane>, error: &Error, ctx: Arc<Context<S>>) -> Action {
    requeue_on_error(
        controlplane.as_ref(),
        error,
        &ctx.backoff,
        ctx.config.resync_period(),
    )
}
