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

//! Blue-green rollout state of a DataPlane.
//!
//! The state is derived once per reconcile from what is observed in the
//! cluster, never stored. A rollout interrupted at any step lands in a state
//! whose actions finish it.

use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;

use crate::consts::TEMPLATE_HASH_ANNOTATION;
use crate::crds::{DataPlane, PromotionStrategy};
use crate::dataplane_utils::deployment_available;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloutState {
    /// No rollout strategy. The live set follows the spec directly.
    Simple,
    /// The live Deployment runs the desired spec, or does not exist yet.
    Steady,
    /// The preview Deployment runs the desired spec but is not available yet.
    Progressing,
    /// The preview is available and waits for the promotion trigger.
    AwaitingPromotion,
    /// The preview is available and the trigger is present.
    Promoting,
}

impl RolloutState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutState::Simple => "simple",
            RolloutState::Steady => "steady",
            RolloutState::Progressing => "progressing",
            RolloutState::AwaitingPromotion => "awaiting-promotion",
            RolloutState::Promoting => "promoting",
        }
    }

    /// Whether preview objects should exist in this state.
    pub fn has_preview(&self) -> bool {
        matches!(
            self,
            RolloutState::Progressing | RolloutState::AwaitingPromotion | RolloutState::Promoting
        )
    }
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The objects the rollout state is derived from.
pub struct Observed<'a> {
    pub live: Option<&'a Deployment>,
    pub preview: Option<&'a Deployment>,
    /// Both preview Services exist.
    pub preview_services: bool,
}

fn template_hash(deployment: &Deployment) -> Option<&str> {
    deployment
        .metadata
        .annotations
        .as_ref()?
        .get(TEMPLATE_HASH_ANNOTATION)
        .map(String::as_str)
}

/// Whether the promotion trigger is present: the promote-when-ready
/// annotation, or automatic promotion.
pub fn promotion_requested(dp: &DataPlane) -> bool {
    dp.promote_when_ready()
        || dp
            .blue_green()
            .is_some_and(|bg| bg.promotion.strategy == PromotionStrategy::AutomaticPromotion)
}

/// Derives the rollout state. `desired_hash` is the template hash of the
/// current DataPlane spec.
pub fn rollout_state(dp: &DataPlane, desired_hash: &str, observed: &Observed<'_>) -> RolloutState {
    if dp.blue_green().is_none() {
        return RolloutState::Simple;
    }
    let Some(live) = observed.live else {
        return RolloutState::Steady;
    };
    if template_hash(live) == Some(desired_hash) {
        return RolloutState::Steady;
    }
    let preview_ready = observed.preview.is_some_and(|preview| {
        template_hash(preview) == Some(desired_hash) && deployment_available(preview)
    });
    if !preview_ready || !observed.preview_services {
        return RolloutState::Progressing;
    }
    if promotion_requested(dp) {
        RolloutState::Promoting
    } else {
        RolloutState::AwaitingPromotion
    }
}
