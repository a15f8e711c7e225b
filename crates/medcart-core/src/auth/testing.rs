//! Test doubles: a scripted transport, a fake storefront API, and storage
//! that fails on demand.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::api::{ApiRequest, ApiResponse, Transport, TransportError};

use super::store::{SecureStorage, StorageError};

type Handler = Arc<dyn Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync>;

pub(crate) fn respond(status: u16, body: Value) -> Result<ApiResponse, TransportError> {
    let status = StatusCode::from_u16(status).expect("valid status code");
    Ok(ApiResponse::new(status, body.to_string()))
}

/// Transport answering from per-path handlers and recording every request.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    routes: Mutex<HashMap<String, Handler>>,
    holds: Mutex<HashMap<String, Arc<Semaphore>>>,
    calls: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn route<F>(&self, path: &str, handler: F)
    where
        F: Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
    {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), Arc::new(handler));
    }

    /// Requests to `path` wait until the returned semaphore gets a permit.
    pub(crate) fn hold(&self, path: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.holds
            .lock()
            .unwrap()
            .insert(path.to_string(), gate.clone());
        gate
    }

    pub(crate) fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path() == path)
            .cloned()
            .collect()
    }

    pub(crate) fn calls_to(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Yield until at least `count` requests to `path` were made.
    pub(crate) async fn wait_for_calls(&self, path: &str, count: usize) {
        while self.calls_to(path) < count {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.calls.lock().unwrap().push(request.clone());

        let hold = self.holds.lock().unwrap().get(request.path()).cloned();
        if let Some(gate) = hold {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| TransportError::Other(e.to_string()))?;
        }

        let handler = self.routes.lock().unwrap().get(request.path()).cloned();
        match handler {
            Some(handler) => handler(request),
            None => respond(404, json!({ "detail": "Not found." })),
        }
    }
}

/// Server-side view of the fake storefront's token state.
pub(crate) struct FakeApi {
    valid_access: Mutex<Option<String>>,
    valid_refresh: Mutex<String>,
    minted: AtomicU32,
    rotate: AtomicBool,
}

pub(crate) const PASSWORD: &str = "correct-pw";

impl FakeApi {
    fn new() -> Self {
        Self {
            valid_access: Mutex::new(None),
            valid_refresh: Mutex::new("refresh-1".to_string()),
            minted: AtomicU32::new(0),
            rotate: AtomicBool::new(false),
        }
    }

    fn mint_access(&self) -> String {
        let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
        let token = format!("access-{}", n);
        *self.valid_access.lock().unwrap() = Some(token.clone());
        token
    }

    /// The server stops accepting the current access token.
    pub(crate) fn expire_access(&self) {
        *self.valid_access.lock().unwrap() = None;
    }

    /// Accept this access token (as if it had been issued earlier).
    pub(crate) fn accept_access(&self, token: &str) {
        *self.valid_access.lock().unwrap() = Some(token.to_string());
    }

    /// The server stops accepting the refresh token.
    pub(crate) fn revoke_refresh(&self) {
        *self.valid_refresh.lock().unwrap() = "revoked".to_string();
    }

    pub(crate) fn rotate_refresh_tokens(&self) {
        self.rotate.store(true, Ordering::SeqCst);
    }

    fn is_authorized(&self, request: &ApiRequest) -> bool {
        let valid = self.valid_access.lock().unwrap();
        matches!((valid.as_deref(), request.bearer_token()), (Some(v), Some(t)) if v == t)
    }

    fn login(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let body = request.body().cloned().unwrap_or(Value::Null);
        if body["username"] == "alice" && body["password"] == PASSWORD {
            let access = self.mint_access();
            let refresh = self.valid_refresh.lock().unwrap().clone();
            respond(
                200,
                json!({
                    "access": access,
                    "refresh": refresh,
                    "user": { "username": "alice", "first_name": "Alice" }
                }),
            )
        } else {
            respond(401, json!({ "error": "Invalid username or password" }))
        }
    }

    fn refresh(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let presented = request
            .body()
            .and_then(|b| b["refresh"].as_str())
            .unwrap_or_default()
            .to_string();
        let valid = self.valid_refresh.lock().unwrap().clone();
        if presented != valid {
            return respond(
                401,
                json!({ "detail": "Token is invalid or expired", "code": "token_not_valid" }),
            );
        }

        let access = self.mint_access();
        if self.rotate.load(Ordering::SeqCst) {
            let n = self.minted.load(Ordering::SeqCst);
            let rotated = format!("refresh-{}", n);
            *self.valid_refresh.lock().unwrap() = rotated.clone();
            respond(200, json!({ "access": access, "refresh": rotated }))
        } else {
            respond(200, json!({ "access": access }))
        }
    }

    fn protected(&self, request: &ApiRequest, body: Value) -> Result<ApiResponse, TransportError> {
        if self.is_authorized(request) {
            respond(200, body)
        } else {
            respond(
                401,
                json!({ "detail": "Given token not valid for any token type", "code": "token_not_valid" }),
            )
        }
    }
}

pub(crate) const ORDERS_PATH: &str = "/api/users/order/details";

/// A scripted transport wired to a fake storefront: login, refresh, logout,
/// profile and orders.
pub(crate) fn storefront() -> (Arc<ScriptedTransport>, Arc<FakeApi>) {
    let transport = Arc::new(ScriptedTransport::new());
    let api = Arc::new(FakeApi::new());

    let server = api.clone();
    transport.route("/api/users/login", move |req| server.login(req));

    let server = api.clone();
    transport.route("/api/token/refresh", move |req| server.refresh(req));

    transport.route("/api/users/logout", |_| {
        respond(200, json!({ "message": "Successfully logged out" }))
    });

    let server = api.clone();
    transport.route("/api/users/profile", move |req| {
        server.protected(
            req,
            json!({ "user_id": "u-1", "username": "alice", "first_name": "Alice", "last_name": "Nguyen" }),
        )
    });

    let server = api.clone();
    transport.route(ORDERS_PATH, move |req| {
        server.protected(req, json!({ "count": 0, "next": null, "previous": null, "results": [] }))
    });

    (transport, api)
}

/// In-memory storage whose writes or reads can be made to fail.
#[derive(Default)]
pub(crate) struct FlakyStorage {
    values: Mutex<HashMap<String, String>>,
    failing_sets: Mutex<HashSet<String>>,
    failing_reads: AtomicBool,
    failing_removes: AtomicBool,
}

impl FlakyStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_sets_for(&self, key: &str) {
        self.failing_sets.lock().unwrap().insert(key.to_string());
    }

    pub(crate) fn fail_reads(&self) {
        self.failing_reads.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_removes(&self) {
        self.failing_removes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn heal(&self) {
        self.failing_sets.lock().unwrap().clear();
        self.failing_reads.store(false, Ordering::SeqCst);
        self.failing_removes.store(false, Ordering::SeqCst);
    }

    fn injected() -> StorageError {
        StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "injected failure"))
    }
}

#[async_trait]
impl SecureStorage for FlakyStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        if self.failing_reads.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.failing_sets.lock().unwrap().contains(key) {
            return Err(Self::injected());
        }
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        if self.failing_removes.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}
