//! Per-object exponential backoff for failed reconciles.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::warn;

use crate::Error;

const INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(300);

/// Tracks consecutive failures per object key. The delay doubles with every
/// failure, from one second up to five minutes, and resets on success.
#[derive(Debug, Default)]
pub struct ErrorBackoff {
    failures: Mutex<HashMap<String, u32>>,
}

impl ErrorBackoff {
    /// Records a failure for `key` and returns how long to wait before retrying.
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = failures.entry(key.to_string()).or_insert(0);
        let delay = INITIAL_DELAY
            .checked_mul(2u32.saturating_pow(*count))
            .unwrap_or(MAX_DELAY)
            .min(MAX_DELAY);
        *count = count.saturating_add(1);
        delay
    }

    pub fn reset(&self, key: &str) {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures.remove(key);
    }
}

pub fn object_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    format!(
        "{}/{}/{}",
        K::kind(&()),
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

/// Shared error policy: terminal errors wait for the resync period, everything
/// else backs off exponentially.
pub fn requeue_on_error<K: Resource<DynamicType = ()>>(
    obj: &K,
    error: &Error,
    backoff: &ErrorBackoff,
    resync: Duration,
) -> Action {
    if error.is_terminal() {
        warn!(name = %obj.name_any(), "reconcile failed permanently: {error}");
        return Action::requeue(resync);
    }
    let delay = backoff.next_delay(&object_key(obj));
    warn!(name = %obj.name_any(), retry_in = ?delay, "reconcile failed: {error:?}");
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_up_to_the_cap_and_resets() {
        let backoff = ErrorBackoff::default();
        let delays: Vec<u64> = (0..11).map(|_| backoff.next_delay("a").as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300, 300]);

        assert_eq!(backoff.next_delay("b").as_secs(), 1);
        backoff.reset("a");
        assert_eq!(backoff.next_delay("a").as_secs(), 1);
    }
}
