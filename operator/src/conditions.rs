//! Condition vocabulary shared by the DataPlane, ControlPlane and Gateway
//! reconcilers, and the rules for deriving `Ready` from the other conditions.

use std::fmt;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

use crate::traits::HasConditions;
use crate::utils::{get_condition, set_condition};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionType {
    Ready,
    Provisioned,
    Accepted,
    Programmed,
    OptionsValid,
    WatchNamespaceGrantValid,
    RolledOut,
    ResolvedRefs,
    DataPlaneReady,
    ControlPlaneReady,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::Provisioned => "Provisioned",
            ConditionType::Accepted => "Accepted",
            ConditionType::Programmed => "Programmed",
            ConditionType::OptionsValid => "OptionsValid",
            ConditionType::WatchNamespaceGrantValid => "WatchNamespaceGrantValid",
            ConditionType::RolledOut => "RolledOut",
            ConditionType::ResolvedRefs => "ResolvedRefs",
            ConditionType::DataPlaneReady => "DataPlaneReady",
            ConditionType::ControlPlaneReady => "ControlPlaneReady",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    Ready,
    Provisioned,
    Pending,
    WaitingToBecomeReady,
    DependenciesNotReady,
    NoDataPlane,
    SpecInvalid,
    OptionsValid,
    UnknownController,
    PortMapMismatch,
    WatchNamespaceGrantValid,
    WatchNamespaceGrantMissing,
    ResolvedRefs,
    RefNotPermitted,
    InvalidKongPluginInstallation,
    RolloutProgressing,
    RolloutAwaitingPromotion,
    RolloutPromotionDone,
    InvalidParameters,
    Accepted,
    Programmed,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Ready => "Ready",
            Reason::Provisioned => "Provisioned",
            Reason::Pending => "Pending",
            Reason::WaitingToBecomeReady => "WaitingToBecomeReady",
            Reason::DependenciesNotReady => "DependenciesNotReady",
            Reason::NoDataPlane => "NoDataPlane",
            Reason::SpecInvalid => "SpecInvalid",
            Reason::OptionsValid => "OptionsValid",
            Reason::UnknownController => "UnknownController",
            Reason::PortMapMismatch => "PortMapMismatch",
            Reason::WatchNamespaceGrantValid => "WatchNamespaceGrantValid",
            Reason::WatchNamespaceGrantMissing => "WatchNamespaceGrantMissing",
            Reason::ResolvedRefs => "ResolvedRefs",
            Reason::RefNotPermitted => "RefNotPermitted",
            Reason::InvalidKongPluginInstallation => "InvalidKongPluginInstallation",
            Reason::RolloutProgressing => "RolloutProgressing",
            Reason::RolloutAwaitingPromotion => "RolloutAwaitingPromotion",
            Reason::RolloutPromotionDone => "RolloutPromotionDone",
            Reason::InvalidParameters => "InvalidParameters",
            Reason::Accepted => "Accepted",
            Reason::Programmed => "Programmed",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn new_condition(
    type_: ConditionType,
    status: bool,
    reason: Reason,
    message: impl Into<String>,
    generation: Option<i64>,
) -> metav1::Condition {
    metav1::Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        observed_generation: generation,
        last_transition_time: metav1::Time(Utc::now()),
    }
}

/// Collects the conditions of one reconcile and stamps them with the
/// generation being reconciled.
pub struct StatusBuilder<'a, T: HasConditions + ?Sized> {
    target: &'a mut T,
    generation: Option<i64>,
}

impl<'a, T: HasConditions + ?Sized> StatusBuilder<'a, T> {
    pub fn new(target: &'a mut T, generation: Option<i64>) -> Self {
        StatusBuilder { target, generation }
    }

    pub fn set(&mut self, type_: ConditionType, status: bool, reason: Reason, message: impl Into<String>) {
        set_condition(
            &mut *self.target,
            new_condition(type_, status, reason, message, self.generation),
        );
    }

    pub fn is_false(&self, type_: ConditionType) -> bool {
        get_condition(&*self.target, type_.as_str()).is_some_and(|c| c.status == "False")
    }

    /// Derives `Ready`: it requires `Provisioned=True`, no blocking condition set to
    /// False and a ready workload. The first failing rule supplies the reason.
    pub fn set_ready(&mut self, workload_ready: bool, waiting_message: &str) {
        let conditions = self.target.conditions();
        let provisioned = conditions
            .iter()
            .find(|c| c.type_ == ConditionType::Provisioned.as_str());
        let blocking = conditions.iter().find(|c| {
            c.status == "False" && BLOCKING.iter().any(|b| b.as_str() == c.type_)
        });

        let (status, reason, message) = match (provisioned, blocking) {
            (_, Some(cond)) => (
                false,
                Reason::DependenciesNotReady,
                format!("{} is False: {}", cond.type_, cond.message),
            ),
            (Some(p), None) if p.status != "True" => (false, Reason::Pending, p.message.clone()),
            (None, None) => (false, Reason::Pending, "not provisioned yet".to_string()),
            (Some(_), None) if !workload_ready => (
                false,
                Reason::WaitingToBecomeReady,
                waiting_message.to_string(),
            ),
            (Some(_), None) => (true, Reason::Ready, String::new()),
        };
        self.set(ConditionType::Ready, status, reason, message);
    }
}

// A False condition of one of these types keeps the owner from becoming Ready.
const BLOCKING: [ConditionType; 3] = [
    ConditionType::OptionsValid,
    ConditionType::WatchNamespaceGrantValid,
    ConditionType::ResolvedRefs,
];

/// Whether the conditions say the object is Ready for its current generation.
pub fn is_ready<T: HasConditions + ?Sized>(obj: &T, generation: Option<i64>) -> bool {
    get_condition(obj, ConditionType::Ready.as_str())
        .is_some_and(|c| c.status == "True" && (generation.is_none() || c.observed_generation == generation))
}
