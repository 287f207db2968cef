use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::traits::HasConditions;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use serde::Serialize;

// Sets the provided condition on any object implementing HasConditions.
//
// When a condition of the same type already has the same status its transition
// time is kept; reason, message and observed generation are always refreshed.
pub fn set_condition<T: HasConditions + ?Sized>(obj: &mut T, new_cond: metav1::Condition) {
    let conditions = obj.get_conditions_mut();
    for condition in conditions.iter_mut() {
        if condition.type_ == new_cond.type_ {
            if condition.status == new_cond.status {
                condition.observed_generation = new_cond.observed_generation;
                condition.reason = new_cond.reason;
                condition.message = new_cond.message;
                return;
            }
            *condition = new_cond;
            return;
        }
    }
    conditions.push(new_cond);
}

// Removes the condition of the given type, if present.
pub fn remove_condition<T: HasConditions + ?Sized>(obj: &mut T, type_: &str) {
    obj.get_conditions_mut().retain(|c| c.type_ != type_);
}

pub fn get_condition<'a, T: HasConditions + ?Sized>(
    obj: &'a T,
    type_: &str,
) -> Option<&'a metav1::Condition> {
    obj.conditions().iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true<T: HasConditions + ?Sized>(obj: &T, type_: &str) -> bool {
    get_condition(obj, type_).is_some_and(|c| c.status == "True")
}

// Returns true if the provided error is a not found error.
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

// Returns true if the provided error is an optimistic concurrency conflict or an
// already-exists error.
pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

// Stable 10-character hash of any serializable value, used to detect drift of
// rendered specs the API server defaults.
pub fn compute_hash<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_string(value).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    json.hash(&mut hasher);
    format!("{:016x}", hasher.finish())[..10].to_string()
}
