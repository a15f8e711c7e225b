//! Typed client for the storefront REST API.
//!
//! Every call is routed through the shared `SessionManager`, so bearer tokens
//! are attached and refreshed without the caller noticing.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::auth::session::PROFILE_PATH;
use crate::auth::SessionManager;
use crate::models::{Branch, NewOrder, Order, Page, Product, ProfileUpdate, UserProfile};

use super::request::ApiRequest;
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

const PRODUCTS_PATH: &str = "/api/products";
const BRANCHES_PATH: &str = "/api/branches";
const CREATE_ORDER_PATH: &str = "/api/users/create_order";
const ORDERS_PATH: &str = "/api/users/order/details";

/// Page size used when the caller doesn't pick one
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
/// 1 second is polite to the server while not making users wait too long.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Storefront API client.
/// Clone is cheap - the session manager is shared.
#[derive(Clone, Debug)]
pub struct ApiClient {
    session: Arc<SessionManager>,
}

impl ApiClient {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Send through the session and decode a successful body, backing off
    /// on 429.
    async fn execute<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self.session.send(request.clone()).await?;

            if response.is_success() {
                debug!(path = request.path(), status = response.status().as_u16(), "Response received");
                return response.json().map_err(|e| {
                    ApiError::InvalidResponse(format!("{} {}: {}", request.method(), request.path(), e))
                });
            }

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Err(ApiError::from_status(response.status(), response.text()));
            }

            // Rate limited
            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(path = request.path(), retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }

    // ===== Catalog =====

    /// Fetch one page of the product catalog. Works signed out.
    pub async fn fetch_products(&self, page: u32, page_size: u32) -> Result<Page<Product>, ApiError> {
        let request = ApiRequest::get(PRODUCTS_PATH)
            .query("page", page.max(1))
            .query("page_size", page_size);
        self.execute(request).await
    }

    /// Fetch all pharmacy branches
    pub async fn fetch_branches(&self) -> Result<Vec<Branch>, ApiError> {
        self.execute(ApiRequest::get(BRANCHES_PATH)).await
    }

    // ===== Account =====

    pub async fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
        Ok(self.session.fetch_profile().await?)
    }

    /// Save profile changes and return the updated profile.
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile, ApiError> {
        if update.is_empty() {
            return Err(ApiError::BadRequest("No profile changes to save".to_string()));
        }
        let request = ApiRequest::patch(PROFILE_PATH).json(update)?;
        let profile: UserProfile = self.execute(request).await?;
        self.session.remember_user(profile.clone()).await;
        Ok(profile)
    }

    // ===== Orders =====

    pub async fn create_order(&self, order: &NewOrder) -> Result<Order, ApiError> {
        if order.is_empty() {
            return Err(ApiError::BadRequest("Order has no items".to_string()));
        }
        let request = ApiRequest::post(CREATE_ORDER_PATH).json(order)?;
        let created: Order = self.execute(request).await?;
        debug!(order_id = %created.order_id, items = created.items.len(), "Order created");
        Ok(created)
    }

    /// Fetch one page of the signed-in user's order history
    pub async fn fetch_orders(&self, page: u32, page_size: u32) -> Result<Page<Order>, ApiError> {
        let request = ApiRequest::get(ORDERS_PATH)
            .query("page", page.max(1))
            .query("page_size", page_size);
        self.execute(request).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use reqwest::Method;
    use serde_json::json;

    use super::*;
    use crate::auth::store::MemoryStorage;
    use crate::auth::testing::{respond, storefront, FakeApi, ScriptedTransport, PASSWORD};

    fn client() -> (ApiClient, Arc<ScriptedTransport>, Arc<FakeApi>) {
        let (transport, api) = storefront();
        let session = Arc::new(SessionManager::new(transport.clone(), Arc::new(MemoryStorage::new())));
        (ApiClient::new(session), transport, api)
    }

    async fn signed_in_client() -> (ApiClient, Arc<ScriptedTransport>, Arc<FakeApi>) {
        let (client, transport, api) = client();
        client.session().login("alice", PASSWORD).await.unwrap();
        (client, transport, api)
    }

    fn product_page() -> serde_json::Value {
        json!({
            "count": 1,
            "next": null,
            "previous": null,
            "results": [{
                "product_id": "p-1",
                "name": "Paracetamol 500mg",
                "category": "Analgesic",
                "price": "12000.00",
                "quantity": "40",
                "need_approval": false
            }]
        })
    }

    // ===== Catalog =====

    #[tokio::test]
    async fn test_fetch_products_signed_out() {
        let (client, transport, _api) = client();
        transport.route(PRODUCTS_PATH, |_| respond(200, product_page()));

        let page = client.fetch_products(0, DEFAULT_PAGE_SIZE).await.unwrap();

        assert_eq!(page.count, 1);
        assert_eq!(page.results[0].name, "Paracetamol 500mg");
        assert_eq!(page.results[0].price, 12000.0);

        let sent = transport.requests_to(PRODUCTS_PATH);
        assert!(!sent[0].has_authorization());
        assert_eq!(
            sent[0].query_pairs(),
            &[
                ("page".to_string(), "1".to_string()),
                ("page_size".to_string(), "10".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_branches() {
        let (client, transport, _api) = client();
        transport.route(BRANCHES_PATH, |_| {
            respond(
                200,
                json!([{ "branch_id": "b-1", "name": "Central", "address": "1 Main St", "latitude": 10.77 }]),
            )
        });

        let branches = client.fetch_branches().await.unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].latitude, Some(10.77));
    }

    #[tokio::test]
    async fn test_not_found_maps_to_api_error() {
        let (client, _transport, _api) = client();
        let err = client.fetch_branches().await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(ref m) if m == "Not found."));
    }

    #[tokio::test]
    async fn test_invalid_body_is_reported() {
        let (client, transport, _api) = client();
        transport.route(BRANCHES_PATH, |_| respond(200, json!({ "unexpected": true })));

        let err = client.fetch_branches().await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    // ===== Rate limiting =====

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_request_is_retried() {
        let (client, transport, _api) = client();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        transport.route(PRODUCTS_PATH, move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                respond(429, json!({ "detail": "Request was throttled." }))
            } else {
                respond(200, product_page())
            }
        });

        let page = client.fetch_products(1, 20).await.unwrap();

        assert_eq!(page.results.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_gives_up_after_max_retries() {
        let (client, transport, _api) = client();
        transport.route(PRODUCTS_PATH, |_| respond(429, json!({})));

        let started = tokio::time::Instant::now();
        let err = client.fetch_products(1, 20).await.unwrap_err();

        assert!(matches!(err, ApiError::RateLimited));
        assert_eq!(transport.calls_to(PRODUCTS_PATH), 1 + MAX_RATE_LIMIT_RETRIES as usize);
        // 1s + 2s + 4s of backoff
        assert!(started.elapsed() >= Duration::from_millis(7000));
    }

    // ===== Account =====

    #[tokio::test]
    async fn test_fetch_profile_caches_user() {
        let (client, _transport, _api) = signed_in_client().await;

        let profile = client.fetch_profile().await.unwrap();

        assert_eq!(profile.user_id.as_deref(), Some("u-1"));
        assert_eq!(client.session().user().await, Some(profile));
    }

    #[tokio::test]
    async fn test_update_profile_sends_only_changes() {
        let (client, transport, _api) = signed_in_client().await;
        transport.route(PROFILE_PATH, |req| {
            assert_eq!(req.method(), &Method::PATCH);
            let body = req.body().cloned().unwrap_or_default();
            assert_eq!(body, json!({ "city": "Da Nang" }));
            respond(200, json!({ "username": "alice", "city": "Da Nang" }))
        });

        let update = ProfileUpdate {
            city: Some("Da Nang".to_string()),
            ..Default::default()
        };
        let profile = client.update_profile(&update).await.unwrap();

        assert_eq!(profile.city.as_deref(), Some("Da Nang"));
        let cached = client.session().user().await.unwrap();
        assert_eq!(cached.city.as_deref(), Some("Da Nang"));
    }

    #[tokio::test]
    async fn test_update_profile_without_changes() {
        let (client, transport, _api) = signed_in_client().await;
        let err = client.update_profile(&ProfileUpdate::default()).await.unwrap_err();

        assert!(matches!(err, ApiError::BadRequest(_)));
        assert_eq!(transport.calls_to(PROFILE_PATH), 0);
    }

    // ===== Orders =====

    #[tokio::test]
    async fn test_create_order() {
        let (client, transport, _api) = signed_in_client().await;
        transport.route(CREATE_ORDER_PATH, |req| {
            assert_eq!(req.bearer_token(), Some("access-1"));
            let body = req.body().cloned().unwrap_or_default();
            assert_eq!(body["items"][0]["quantity"], 3);
            respond(
                201,
                json!({
                    "order_id": "o-1",
                    "branch": "b-1",
                    "status": "pending",
                    "items": [{ "product": "p-1", "quantity": 3, "price": "12000.00" }]
                }),
            )
        });

        let order = NewOrder::new("b-1").add_item("p-1", 2).add_item("p-1", 1);
        let created = client.create_order(&order).await.unwrap();

        assert_eq!(created.order_id, "o-1");
        assert_eq!(created.total(), 36000.0);
    }

    #[tokio::test]
    async fn test_create_empty_order_is_rejected_locally() {
        let (client, transport, _api) = signed_in_client().await;
        let err = client.create_order(&NewOrder::new("b-1")).await.unwrap_err();

        assert!(matches!(err, ApiError::BadRequest(_)));
        assert_eq!(transport.calls_to(CREATE_ORDER_PATH), 0);
    }

    #[tokio::test]
    async fn test_fetch_orders_refreshes_expired_token() {
        let (client, transport, api) = signed_in_client().await;
        api.expire_access();

        let page = client.fetch_orders(1, DEFAULT_PAGE_SIZE).await.unwrap();

        assert!(page.results.is_empty());
        assert_eq!(transport.calls_to("/api/token/refresh"), 1);
        assert_eq!(transport.calls_to(ORDERS_PATH), 2);
    }

    #[tokio::test]
    async fn test_fetch_orders_after_session_expired() {
        let (client, _transport, api) = signed_in_client().await;
        api.expire_access();
        api.revoke_refresh();

        let err = client.fetch_orders(1, DEFAULT_PAGE_SIZE).await.unwrap_err();

        assert!(err.requires_login());
        assert!(!client.session().is_authenticated().await);
    }

    #[tokio::test]
    async fn test_fetch_orders_signed_out() {
        let (client, _transport, _api) = client();
        let err = client.fetch_orders(1, DEFAULT_PAGE_SIZE).await.unwrap_err();
        assert!(err.requires_login());
    }
}
