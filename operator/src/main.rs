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

use anyhow::Context as _;
use clap::Parser;
use futures::future::{try_join_all, BoxFuture, FutureExt};
use gateway_operator::*;
use kube::Client;
use tracing::*;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::parse());
    init_tracing(config.log_json);

    let client = Client::try_default()
        .await
        .context("failed to create kube Client")?;
    let context = || Context::new(KubeStore::new(client.clone()), config.clone());

    let mut controllers: Vec<BoxFuture<'static, Result<()>>> = vec![];
    if config.enable_gateway_controller {
        controllers.push(gatewayclass_controller(context()).boxed());
        controllers.push(gateway_controller(context()).boxed());
    }
    if config.enable_dataplane_controller {
        controllers.push(dataplane_controller(context()).boxed());
    }
    if config.enable_controlplane_controller {
        controllers.push(controlplane_controller(context()).boxed());
    }
    if controllers.is_empty() {
        warn!("all controllers are disabled");
        return Ok(());
    }

    info!(
        namespace = %config.namespace,
        controllers = controllers.len(),
        "starting controllers"
    );
    try_join_all(controllers)
        .await
        .context("failed to start controllers")?;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
