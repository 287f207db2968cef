//! In-memory [`ObjectStore`] for reconciler tests.
//!
//! It mimics the API server behaviour the reconcilers rely on: generateName,
//! uid/resourceVersion/generation bookkeeping, conflicts on stale writes,
//! finalizer-aware deletion and status kept apart from the rest of the object.
//! Every write made through the trait is logged so tests can assert that a
//! converged reconcile writes nothing.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ErrorResponse;
use kube::ResourceExt;
use serde_json::Value;

use crate::labels::Selector;
use crate::store::{Object, ObjectStore};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Write {
    pub verb: &'static str,
    pub kind: String,
    pub name: String,
}

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    counter: u64,
    writes: Vec<Write>,
    failures: Vec<(&'static str, String)>,
    latency: Option<Duration>,
}

#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
}

fn kind_of<K: Object>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

// Cluster-scoped objects ignore the namespace, like the API server does.
fn key_of<K: Object>(namespace: Option<&str>, name: &str) -> Key {
    let namespace = if K::NAMESPACED { namespace.unwrap_or_default() } else { "" };
    (kind_of::<K>(), namespace.to_string(), name.to_string())
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn without_meta_and_status(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(map) = value.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    value
}

impl FakeStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn log(state: &mut State, verb: &'static str, kind: &str, name: &str) {
        state.writes.push(Write {
            verb,
            kind: kind.rsplit('/').next().unwrap_or(kind).to_string(),
            name: name.to_string(),
        });
    }

    fn do_create<K: Object>(&self, obj: &K, logged: bool) -> Result<K> {
        let mut state = self.lock();
        if logged {
            Self::injected_failure::<K>(&mut state, "create", &obj.name_any())?;
        }
        state.counter += 1;
        let n = state.counter;

        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        if meta.name.is_none() {
            let prefix = meta.generate_name.clone().ok_or_else(|| {
                api_error(422, "Invalid", "name or generateName is required".to_string())
            })?;
            meta.name = Some(format!("{prefix}{n:05x}"));
        }
        meta.uid = Some(format!("uid-{n}"));
        meta.resource_version = Some(n.to_string());
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(Utc.timestamp_opt(1_700_000_000 + n as i64, 0).unwrap()));
        meta.deletion_timestamp = None;

        let key = key_of::<K>(obj.namespace().as_deref(), &obj.name_any());
        if state.objects.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} {} already exists", key.0, key.2),
            ));
        }
        if logged {
            Self::log(&mut state, "create", &key.0, &key.2);
        }
        state.objects.insert(key, serde_json::to_value(&obj)?);
        Ok(obj)
    }

    /// Stores an object as another actor would, without logging the write.
    pub fn insert<K: Object>(&self, obj: K) -> K {
        self.do_create(&obj, false).unwrap()
    }

    /// All stored objects of one type.
    pub fn objects<K: Object>(&self) -> Vec<K> {
        let state = self.lock();
        let kind = kind_of::<K>();
        state
            .objects
            .iter()
            .filter(|(key, _)| key.0 == kind)
            .map(|(_, value)| serde_json::from_value(value.clone()).unwrap())
            .collect()
    }

    /// Changes a stored object as another actor would (the Deployment controller
    /// updating status, a user editing the spec), without logging the write.
    pub fn modify<K: Object>(&self, namespace: Option<&str>, name: &str, f: impl FnOnce(&mut K)) {
        let mut state = self.lock();
        state.counter += 1;
        let rv = state.counter.to_string();
        let key = key_of::<K>(namespace, name);
        let value = state.objects.get(&key).cloned().unwrap();
        let mut obj: K = serde_json::from_value(value.clone()).unwrap();
        f(&mut obj);
        let before = without_meta_and_status(&value);
        let meta = obj.meta_mut();
        meta.resource_version = Some(rv);
        let updated = serde_json::to_value(&obj).unwrap();
        if without_meta_and_status(&updated) != before {
            let generation = obj.meta().generation.map(|g| g + 1);
            obj.meta_mut().generation = generation;
        }
        state.objects.insert(key, serde_json::to_value(&obj).unwrap());
    }

    /// Removes an object regardless of finalizers, as an out-of-band delete would.
    pub fn remove<K: Object>(&self, namespace: Option<&str>, name: &str) {
        self.lock().objects.remove(&key_of::<K>(namespace, name));
    }

    /// Makes the next `verb` write of a `K` fail with a server error, as a
    /// dropped connection or an overloaded API server would.
    pub fn fail_next<K: Object>(&self, verb: &'static str) {
        self.lock().failures.push((verb, kind_of::<K>()));
    }

    fn injected_failure<K: Object>(state: &mut State, verb: &'static str, name: &str) -> Result<()> {
        let kind = kind_of::<K>();
        match state.failures.iter().position(|(v, k)| *v == verb && *k == kind) {
            Some(index) => {
                state.failures.remove(index);
                Err(api_error(500, "InternalError", format!("{verb} {kind} {name} failed")))
            }
            None => Ok(()),
        }
    }

    /// Delays every read by `latency`, as a slow API server would.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    async fn wait(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn writes(&self) -> Vec<Write> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        self.wait().await;
        let state = self.lock();
        match state.objects.get(&key_of::<K>(namespace, name)) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn list<K: Object>(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<K>> {
        self.wait().await;
        let state = self.lock();
        let kind = kind_of::<K>();
        let mut items = vec![];
        for ((k, ns, _), value) in &state.objects {
            let other_namespace =
                K::NAMESPACED && namespace.is_some_and(|wanted| wanted != ns.as_str());
            if *k != kind || other_namespace {
                continue;
            }
            let obj: K = serde_json::from_value(value.clone())?;
            if selector.matches(obj.labels()) {
                items.push(obj);
            }
        }
        Ok(items)
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        self.do_create(obj, true)
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K> {
        let mut state = self.lock();
        Self::injected_failure::<K>(&mut state, "update", &obj.name_any())?;
        let key = key_of::<K>(obj.namespace().as_deref(), &obj.name_any());
        let Some(stored) = state.objects.get(&key).cloned() else {
            return Err(api_error(404, "NotFound", format!("{} {} not found", key.0, key.2)));
        };
        let stored_obj: K = serde_json::from_value(stored.clone())?;
        if obj.resource_version().is_some() && obj.resource_version() != stored_obj.resource_version() {
            return Err(api_error(
                409,
                "Conflict",
                format!("{} {}: the object has been modified", key.0, key.2),
            ));
        }

        state.counter += 1;
        let rv = state.counter.to_string();

        let mut updated = serde_json::to_value(obj)?;
        if let Some(map) = updated.as_object_mut() {
            match stored.get("status") {
                Some(status) => map.insert("status".to_string(), status.clone()),
                None => map.remove("status"),
            };
        }
        let mut updated: K = serde_json::from_value(updated)?;
        let stored_meta = stored_obj.meta();
        let meta = updated.meta_mut();
        meta.uid.clone_from(&stored_meta.uid);
        meta.creation_timestamp.clone_from(&stored_meta.creation_timestamp);
        meta.deletion_timestamp.clone_from(&stored_meta.deletion_timestamp);
        meta.resource_version = Some(rv);
        meta.generation = stored_meta.generation;
        if without_meta_and_status(&serde_json::to_value(&updated)?) != without_meta_and_status(&stored) {
            updated.meta_mut().generation = stored_meta.generation.map(|g| g + 1);
        }

        Self::log(&mut state, "update", &key.0, &key.2);
        if updated.meta().deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, serde_json::to_value(&updated)?);
        }
        Ok(updated)
    }

    async fn update_status<K: Object>(&self, obj: &K) -> Result<K> {
        let mut state = self.lock();
        Self::injected_failure::<K>(&mut state, "update_status", &obj.name_any())?;
        let key = key_of::<K>(obj.namespace().as_deref(), &obj.name_any());
        let Some(mut stored) = state.objects.get(&key).cloned() else {
            return Err(api_error(404, "NotFound", format!("{} {} not found", key.0, key.2)));
        };
        state.counter += 1;
        let rv = state.counter.to_string();

        let status = serde_json::to_value(obj)?.get("status").cloned();
        if let Some(map) = stored.as_object_mut() {
            match status {
                Some(status) => map.insert("status".to_string(), status),
                None => map.remove("status"),
            };
        }
        let mut updated: K = serde_json::from_value(stored)?;
        updated.meta_mut().resource_version = Some(rv);

        Self::log(&mut state, "update_status", &key.0, &key.2);
        state.objects.insert(key, serde_json::to_value(&updated)?);
        Ok(updated)
    }

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let mut state = self.lock();
        Self::injected_failure::<K>(&mut state, "delete", name)?;
        let key = key_of::<K>(namespace, name);
        let Some(stored) = state.objects.get(&key).cloned() else {
            return Ok(());
        };
        let mut obj: K = serde_json::from_value(stored)?;
        Self::log(&mut state, "delete", &key.0, &key.2);
        if obj.finalizers().is_empty() {
            state.objects.remove(&key);
        } else if obj.meta().deletion_timestamp.is_none() {
            obj.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
            state.objects.insert(key, serde_json::to_value(&obj)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    // ConfigMap is not an Object of the operator; a local impl keeps the store tests
    // independent of the operator's own types.
    impl Object for ConfigMap {
        const NAMESPACED: bool = true;

        fn api(client: kube::Client, namespace: Option<&str>) -> kube::Api<Self> {
            kube::Api::namespaced(client, namespace.unwrap_or("default"))
        }
    }

    fn config_map(data: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                generate_name: Some("cm-".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("k".to_string(), data.to_string())])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = FakeStore::default();
        let created = store.create(&config_map("a")).await.unwrap();
        let mut first = created.clone();
        first.data = Some(BTreeMap::from([("k".to_string(), "b".to_string())]));
        let first = store.update(&first).await.unwrap();
        assert_eq!(first.metadata.generation, Some(2));

        let mut stale = created;
        stale.data = Some(BTreeMap::from([("k".to_string(), "c".to_string())]));
        let err = store.update(&stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn injected_failure_hits_one_write() {
        let store = FakeStore::default();
        let created = store.create(&config_map("a")).await.unwrap();
        store.fail_next::<ConfigMap>("update");
        assert!(store.update(&created).await.is_err());
        assert!(store.update(&created).await.is_ok());
    }

    #[tokio::test]
    async fn finalizers_defer_deletion() {
        let store = FakeStore::default();
        let mut cm = config_map("a");
        cm.metadata.finalizers = Some(vec!["example.com/cleanup".to_string()]);
        let created = store.create(&cm).await.unwrap();
        let name = created.name_any();

        store.delete::<ConfigMap>(Some("default"), &name).await.unwrap();
        let pending: ConfigMap = store.get(Some("default"), &name).await.unwrap().unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());

        let mut released = pending;
        released.metadata.finalizers = None;
        store.update(&released).await.unwrap();
        let gone: Option<ConfigMap> = store.get(Some("default"), &name).await.unwrap();
        assert!(gone.is_none());
        store.delete::<ConfigMap>(Some("default"), &name).await.unwrap();
    }
}
