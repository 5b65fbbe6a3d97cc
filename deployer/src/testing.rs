//! Extras that only show up during tests: a scripted in-memory apiserver
//! behind the narrow client interface.
#![allow(missing_docs)]

use std::collections::{BTreeMap, VecDeque};

use tokio::sync::Mutex;

use api::client::{ApiFuture, ClusterClient, Error as ClientError, GvkRef};

use crate::prelude::*;

/// Key_of renders the canonical object key `apiVersion/kind/ns/name`;
/// cluster-scoped objects use `_` for the namespace slot.
pub fn key_of(manifest: &Value) -> String {
    let api_version = manifest
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or("?");
    let kind = manifest.get("kind").and_then(Value::as_str).unwrap_or("?");
    let ns = manifest
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
        .unwrap_or("_");
    let name = manifest
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("?");
    format!("{api_version}/{kind}/{ns}/{name}")
}

fn key_parts(gvk: &GvkRef, name: &str, ns: Option<&str>) -> String {
    format!("{}/{}/{}/{name}", gvk.api_version, gvk.kind, ns.unwrap_or("_"))
}

#[derive(Default)]
struct MockState {
    objects: BTreeMap<String, Value>,
    /// Status documents merged into an object as soon as it exists.
    statuses: BTreeMap<String, Value>,
    /// Scripted one-shot failures keyed by `op key`.
    failures: BTreeMap<String, VecDeque<ClientError>>,
    log: Vec<String>,
}

/// MockClient is the scripted apiserver; state transitions are driven by the
/// test scenario, not by a reconciler.
#[derive(Default)]
pub struct MockClient {
    state: Mutex<MockState>,
}

impl MockClient {
    /// Script_status arranges for `status` to appear on the object as soon
    /// as it exists (and on later reads).
    pub async fn script_status<K: Into<String>>(&self, key: K, status: Value) {
        let key = key.into();
        let mut st = self.state.lock().await;
        if let Some(obj) = st.objects.get_mut(&key) {
            obj["status"] = status.clone();
        }
        st.statuses.insert(key, status);
    }

    /// Fail_with queues a one-shot error for the next `op` on `key`.
    pub async fn fail_with<K: Into<String>>(&self, op: &str, key: K, err: ClientError) {
        let mut st = self.state.lock().await;
        st.failures
            .entry(format!("{op} {}", key.into()))
            .or_default()
            .push_back(err);
    }

    /// Get_object reads the stored object without logging.
    pub async fn get_object(&self, key: &str) -> Option<Value> {
        self.state.lock().await.objects.get(key).cloned()
    }

    /// Log reports the operations seen so far, in order.
    pub async fn log(&self) -> Vec<String> {
        self.state.lock().await.log.clone()
    }

    fn check_failure(st: &mut MockState, op: &str, key: &str) -> Result<(), ClientError> {
        if let Some(q) = st.failures.get_mut(&format!("{op} {key}")) {
            if let Some(err) = q.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl ClusterClient for MockClient {
    fn create<'a>(&'a self, manifest: &'a Value) -> ApiFuture<'a, Value> {
        Box::pin(async move {
            let key = key_of(manifest);
            let mut st = self.state.lock().await;
            st.log.push(format!("create {key}"));
            Self::check_failure(&mut st, "create", &key)?;
            if st.objects.contains_key(&key) {
                return Err(ClientError::Api {
                    code: 409,
                    message: format!("{key} already exists"),
                });
            }
            let mut obj = manifest.clone();
            if let Some(status) = st.statuses.get(&key) {
                obj["status"] = status.clone();
            }
            st.objects.insert(key, obj.clone());
            Ok(obj)
        })
    }

    fn read<'a>(
        &'a self,
        gvk: &'a GvkRef,
        name: &'a str,
        namespace: Option<&'a str>,
    ) -> ApiFuture<'a, Value> {
        Box::pin(async move {
            let key = key_parts(gvk, name, namespace);
            let mut st = self.state.lock().await;
            st.log.push(format!("read {key}"));
            Self::check_failure(&mut st, "read", &key)?;
            match st.objects.get(&key) {
                Some(v) => Ok(v.clone()),
                None => Err(ClientError::not_found(&key)),
            }
        })
    }

    fn patch<'a>(&'a self, manifest: &'a Value) -> ApiFuture<'a, Value> {
        Box::pin(async move {
            let key = key_of(manifest);
            let mut st = self.state.lock().await;
            st.log.push(format!("patch {key}"));
            Self::check_failure(&mut st, "patch", &key)?;
            let mut obj = manifest.clone();
            if let Some(status) = st.statuses.get(&key) {
                obj["status"] = status.clone();
            }
            st.objects.insert(key, obj.clone());
            Ok(obj)
        })
    }

    fn replace<'a>(&'a self, manifest: &'a Value) -> ApiFuture<'a, Value> {
        Box::pin(async move {
            let key = key_of(manifest);
            let mut st = self.state.lock().await;
            st.log.push(format!("replace {key}"));
            Self::check_failure(&mut st, "replace", &key)?;
            if !st.objects.contains_key(&key) {
                return Err(ClientError::not_found(&key));
            }
            let obj = manifest.clone();
            st.objects.insert(key, obj.clone());
            Ok(obj)
        })
    }

    fn delete<'a>(
        &'a self,
        gvk: &'a GvkRef,
        name: &'a str,
        namespace: Option<&'a str>,
        _grace_period: Option<i64>,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let key = key_parts(gvk, name, namespace);
            let mut st = self.state.lock().await;
            st.log.push(format!("delete {key}"));
            Self::check_failure(&mut st, "delete", &key)?;
            match st.objects.remove(&key) {
                Some(_) => Ok(()),
                None => Err(ClientError::not_found(&key)),
            }
        })
    }

    fn list<'a>(
        &'a self,
        gvk: &'a GvkRef,
        namespace: Option<&'a str>,
        _selector: Option<&'a str>,
    ) -> ApiFuture<'a, Vec<Value>> {
        Box::pin(async move {
            let prefix = format!("{}/{}/{}/", gvk.api_version, gvk.kind, namespace.unwrap_or("_"));
            let st = self.state.lock().await;
            Ok(st
                .objects
                .iter()
                .filter(|(k, _)| k.starts_with(&prefix))
                .map(|(_, v)| v.clone())
                .collect())
        })
    }
}
