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

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use config::Config;
pub use controlplane_controller::controller as controlplane_controller;
pub use dataplane_controller::controller as dataplane_controller;
pub use gateway_controller::controller as gateway_controller;
pub use gatewayclass_controller::controller as gatewayclass_controller;
pub use store::{KubeStore, ObjectStore};

pub mod consts;
pub mod crds;
pub mod labels;
pub mod store;

mod backoff;
mod builder;
mod certs;
mod conditions;
mod config;
mod controlplane_controller;
mod controlplane_utils;
mod dataplane_controller;
mod dataplane_rollout;
mod dataplane_utils;
mod gateway_controller;
mod gateway_utils;
mod gatewayclass_controller;
mod gatewayclass_utils;
mod owned;
mod traits;
mod utils;

#[cfg(test)]
mod testing;

// Context for our reconcilers
pub struct Context<S = KubeStore> {
    /// Access to cluster objects
    pub store: S,
    pub config: Arc<Config>,
    /// Per-object retry delays for failed reconciles
    pub backoff: backoff::ErrorBackoff,
}

impl<S: ObjectStore> Context<S> {
    pub fn new(store: S, config: Arc<Config>) -> Self {
        Context {
            store,
            config,
            backoff: backoff::ErrorBackoff::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[source] kube::Error),
    #[error("invalid configuration: `{0}`")]
    InvalidConfigError(String),
    #[error("error querying CRDs: `{0}`; are the CRDs installed?")]
    CRDNotFoundError(#[source] kube::Error),
    #[error("{0}")]
    SpecError(String),
    #[error("certificate error: {0}")]
    CertificateError(String),
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("reconcile did not finish within {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Terminal errors cannot be fixed by retrying; they wait for the object to change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::SpecError(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(err) if utils::is_conflict(err))
    }
}

impl From<rcgen::Error> for Error {
    fn from(err: rcgen::Error) -> Self {
        Error::CertificateError(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// Runs a single reconcile, failing it with Error::Timeout once `timeout` elapses.
pub(crate) async fn with_deadline<T>(
    timeout: Duration,
    reconcile: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, reconcile)
        .await
        .map_err(|_| Error::Timeout(timeout))?
}
