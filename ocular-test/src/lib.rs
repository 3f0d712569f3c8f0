//! A stateful stand-in for the Kubernetes apiserver.
//!
//! [`testcontext`] returns a real [`kube::Client`] whose transport is a
//! `tower_test` mock service. A background task answers every request from an
//! in-memory object store, so reconcilers can be driven pass by pass and their
//! effects inspected afterwards.
//!
//! Supported: get, list (namespace and equality label selectors), create
//! (including `generateName`), replace, merge/apply patch, delete, and the
//! `status` subresource. Watches and owner-reference garbage collection are not
//! simulated.
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use kube::{client::Body, Client, Resource};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

/// One request the fake apiserver answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
}

#[derive(Default)]
struct Store {
    /// collection key -> (namespace, name) -> object
    objects: BTreeMap<String, BTreeMap<(String, String), Value>>,
    requests: Vec<Recorded>,
}

/// Shared handle to the fake apiserver's state.
#[derive(Clone)]
pub struct FakeApiServer {
    store: Arc<Mutex<Store>>,
    counter: Arc<AtomicU64>,
}

/// Create a client backed by a fresh fake apiserver.
///
/// Must be called from within a tokio runtime.
pub fn testcontext() -> (Client, FakeApiServer) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    let server = FakeApiServer {
        store: Arc::default(),
        counter: Arc::new(AtomicU64::new(1)),
    };
    tokio::spawn(server.clone().serve(handle));
    (Client::new(mock_service, "default"), server)
}

/// Where a request points.
#[derive(Debug, PartialEq, Eq)]
struct Target {
    collection: String,
    namespace: Option<String>,
    name: Option<String>,
    status: bool,
}

fn parse_path(path: &str) -> Option<Target> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let (prefix, rest) = match segments.as_slice() {
        ["api", version, rest @ ..] => (format!("api/{version}"), rest),
        ["apis", group, version, rest @ ..] => (format!("apis/{group}/{version}"), rest),
        _ => return None,
    };
    let (namespace, rest) = match rest {
        ["namespaces", ns, rest @ ..] if !rest.is_empty() => (Some((*ns).to_string()), rest),
        _ => (None, rest),
    };
    let (plural, rest) = rest.split_first()?;
    Some(Target {
        collection: format!("{prefix}/{plural}"),
        namespace,
        name: rest.first().map(|n| (*n).to_string()),
        status: rest.get(1) == Some(&"status"),
    })
}

fn collection_of<K: Resource<DynamicType = ()>>() -> String {
    parse_path(&K::url_path(&(), None)).map_or_else(String::new, |t| t.collection)
}

fn matches_selector(obj: &Value, selector: &str) -> bool {
    let labels = &obj["metadata"]["labels"];
    selector.split(',').filter(|s| !s.is_empty()).all(|term| match term.split_once('=') {
        Some((key, value)) => labels[key].as_str() == Some(value),
        None => labels.get(term).is_some(),
    })
}

fn status_response(code: StatusCode, reason: &str, message: String) -> (StatusCode, Value) {
    let body = json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code.as_u16(),
    });
    (code, body)
}

fn not_found(target: &Target) -> (StatusCode, Value) {
    status_response(
        StatusCode::NOT_FOUND,
        "NotFound",
        format!("{} {:?} not found", target.collection, target.name),
    )
}

impl FakeApiServer {
    async fn serve(self, mut handle: ApiServerHandle) {
        while let Some((request, send)) = handle.next_request().await {
            let (parts, body) = request.into_parts();
            let bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(err) => {
                    tracing::error!("fake apiserver could not read body: {err}");
                    continue;
                }
            };
            let (code, value) = self.handle(&parts.method, &parts.uri, &bytes);
            let response = Response::builder()
                .status(code)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&value).unwrap_or_default()));
            match response {
                Ok(response) => send.send_response(response),
                Err(err) => tracing::error!("fake apiserver could not build response: {err}"),
            }
        }
    }

    fn handle(&self, method: &Method, uri: &http::Uri, body: &[u8]) -> (StatusCode, Value) {
        self.store.lock().requests.push(Recorded {
            method: method.clone(),
            path: uri.path().to_string(),
        });
        let Some(target) = parse_path(uri.path()) else {
            return status_response(StatusCode::NOT_FOUND, "NotFound", format!("no route {}", uri.path()));
        };
        let query: BTreeMap<String, String> = form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes())
            .into_owned()
            .collect();
        let payload: Value = if body.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(body) {
                Ok(v) => v,
                Err(err) => {
                    return status_response(StatusCode::BAD_REQUEST, "BadRequest", err.to_string());
                }
            }
        };

        match (method, target.name.is_some()) {
            (&Method::GET, true) => self.get_value(&target),
            (&Method::GET, false) => self.list_values(&target, query.get("labelSelector")),
            (&Method::POST, false) => self.create_value(&target, payload),
            (&Method::PUT, true) => self.replace_value(&target, payload),
            (&Method::PATCH, true) => self.patch_value(&target, &payload),
            (&Method::DELETE, true) => self.delete_value(&target),
            _ => status_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "MethodNotAllowed",
                format!("{method} {}", uri.path()),
            ),
        }
    }

    fn key(target: &Target) -> (String, String) {
        (
            target.namespace.clone().unwrap_or_default(),
            target.name.clone().unwrap_or_default(),
        )
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    fn lookup(&self, target: &Target) -> Option<Value> {
        let store = self.store.lock();
        store
            .objects
            .get(&target.collection)
            .and_then(|c| c.get(&Self::key(target)))
            .cloned()
    }

    fn get_value(&self, target: &Target) -> (StatusCode, Value) {
        match self.lookup(target) {
            Some(obj) => (StatusCode::OK, obj),
            None => not_found(target),
        }
    }

    fn list_values(&self, target: &Target, selector: Option<&String>) -> (StatusCode, Value) {
        let store = self.store.lock();
        let items: Vec<Value> = store
            .objects
            .get(&target.collection)
            .into_iter()
            .flat_map(|c| c.iter())
            .filter(|((ns, _), _)| target.namespace.as_ref().is_none_or(|want| want == ns))
            .filter(|(_, obj)| selector.is_none_or(|s| matches_selector(obj, s)))
            .map(|(_, obj)| obj.clone())
            .collect();
        let list = json!({
            "apiVersion": "v1",
            "kind": "List",
            "metadata": { "resourceVersion": self.next().to_string() },
            "items": items,
        });
        (StatusCode::OK, list)
    }

    fn create_value(&self, target: &Target, mut obj: Value) -> (StatusCode, Value) {
        let serial = self.next();
        let meta = &mut obj["metadata"];
        if meta["name"].as_str().is_none() {
            let generated = meta["generateName"].as_str().map(|prefix| format!("{prefix}{serial:05}"));
            match generated {
                Some(name) => meta["name"] = json!(name),
                None => {
                    return status_response(StatusCode::UNPROCESSABLE_ENTITY, "Invalid", "name is required".into());
                }
            }
        }
        if let Some(ns) = &target.namespace {
            meta["namespace"] = json!(ns);
        }
        meta["uid"] = json!(format!("uid-{serial}"));
        meta["resourceVersion"] = json!(serial.to_string());
        meta["creationTimestamp"] = json!(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        if meta["generation"].is_null() {
            meta["generation"] = json!(1);
        }
        let name = meta["name"].as_str().unwrap_or_default().to_string();

        let mut store = self.store.lock();
        let collection = store.objects.entry(target.collection.clone()).or_default();
        let key = (target.namespace.clone().unwrap_or_default(), name.clone());
        if collection.contains_key(&key) {
            return status_response(StatusCode::CONFLICT, "AlreadyExists", format!("{name} already exists"));
        }
        collection.insert(key, obj.clone());
        (StatusCode::CREATED, obj)
    }

    /// Store `updated` in place of the existing object, keeping what the subresource
    /// does not own.
    fn store_update(&self, target: &Target, existing: &Value, mut updated: Value) -> Value {
        if target.status {
            let status = updated["status"].take();
            updated = existing.clone();
            updated["status"] = status;
        } else {
            updated["status"] = existing["status"].clone();
            if updated["status"].is_null() {
                if let Some(map) = updated.as_object_mut() {
                    map.remove("status");
                }
            }
            let generation = existing["metadata"]["generation"].as_i64().unwrap_or(1);
            let bump = i64::from(updated["spec"] != existing["spec"]);
            updated["metadata"]["generation"] = json!(generation + bump);
        }
        for field in ["uid", "creationTimestamp", "namespace", "name"] {
            updated["metadata"][field] = existing["metadata"][field].clone();
        }
        updated["metadata"]["resourceVersion"] = json!(self.next().to_string());
        self.store
            .lock()
            .objects
            .entry(target.collection.clone())
            .or_default()
            .insert(Self::key(target), updated.clone());
        updated
    }

    fn replace_value(&self, target: &Target, obj: Value) -> (StatusCode, Value) {
        match self.lookup(target) {
            Some(existing) => (StatusCode::OK, self.store_update(target, &existing, obj)),
            None => not_found(target),
        }
    }

    fn patch_value(&self, target: &Target, patch: &Value) -> (StatusCode, Value) {
        match self.lookup(target) {
            Some(existing) => {
                let mut patched = existing.clone();
                json_patch::merge(&mut patched, patch);
                (StatusCode::OK, self.store_update(target, &existing, patched))
            }
            None => not_found(target),
        }
    }

    fn delete_value(&self, target: &Target) -> (StatusCode, Value) {
        let removed = self
            .store
            .lock()
            .objects
            .get_mut(&target.collection)
            .and_then(|c| c.remove(&Self::key(target)));
        match removed {
            Some(obj) => (StatusCode::OK, obj),
            None => not_found(target),
        }
    }

    /// Insert `obj` as if it had been created through the API.
    pub fn seed<K>(&self, obj: &K) -> K
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let target = Target {
            collection: collection_of::<K>(),
            namespace: obj.meta().namespace.clone(),
            name: None,
            status: false,
        };
        let value = serde_json::to_value(obj).unwrap_or(Value::Null);
        let (code, created) = self.create_value(&target, value);
        assert!(code.is_success(), "seeding failed: {created}");
        from_value(created)
    }

    /// Overwrite the stored status of an existing object, as a controller other than
    /// the one under test would.
    pub fn set_status<K>(&self, namespace: Option<&str>, name: &str, status: Value)
    where
        K: Resource<DynamicType = ()>,
    {
        let mut store = self.store.lock();
        let key = (namespace.unwrap_or_default().to_string(), name.to_string());
        let obj = store
            .objects
            .get_mut(&collection_of::<K>())
            .and_then(|c| c.get_mut(&key))
            .unwrap_or_else(|| panic!("no {name} to update"));
        obj["status"] = status;
    }

    /// Apply a merge patch to the stored object, bumping the generation on spec changes.
    pub fn patch<K>(&self, namespace: Option<&str>, name: &str, patch: Value)
    where
        K: Resource<DynamicType = ()>,
    {
        let target = Target {
            collection: collection_of::<K>(),
            namespace: namespace.map(String::from),
            name: Some(name.to_string()),
            status: false,
        };
        let (code, body) = self.patch_value(&target, &patch);
        assert!(code.is_success(), "patch failed: {body}");
    }

    /// Fetch a stored object.
    pub fn get<K>(&self, namespace: Option<&str>, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let store = self.store.lock();
        let key = (namespace.unwrap_or_default().to_string(), name.to_string());
        store
            .objects
            .get(&collection_of::<K>())
            .and_then(|c| c.get(&key))
            .cloned()
            .map(from_value)
    }

    /// All stored objects of kind `K`, ordered by namespace and name.
    pub fn list<K>(&self) -> Vec<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let store = self.store.lock();
        store
            .objects
            .get(&collection_of::<K>())
            .map(|c| c.values().cloned().map(from_value).collect())
            .unwrap_or_default()
    }

    /// Every request answered so far.
    pub fn requests(&self) -> Vec<Recorded> {
        self.store.lock().requests.clone()
    }

    /// Number of create calls answered so far.
    pub fn creates(&self) -> usize {
        self.store
            .lock()
            .requests
            .iter()
            .filter(|r| r.method == Method::POST)
            .count()
    }
}

fn from_value<K: DeserializeOwned>(value: Value) -> K {
    match serde_json::from_value(value) {
        Ok(obj) => obj,
        Err(err) => panic!("stored object does not deserialize: {err}"),
    }
}
