//! The session manager: sole owner and writer of the token pair.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::api::{ApiRequest, ApiResponse, Transport};
use crate::models::{Registration, UserProfile};

use super::error::{AuthError, FieldErrors, ServerMessage};
use super::store::SecureStorage;
use super::vault::{TokenPair, TokenVault};

// ============================================================================
// Constants
// ============================================================================

const LOGIN_PATH: &str = "/api/users/login";
const REGISTER_PATH: &str = "/api/users/register";
const LOGOUT_PATH: &str = "/api/users/logout";
const REFRESH_PATH: &str = "/api/token/refresh";
pub(crate) const PROFILE_PATH: &str = "/api/users/profile";

/// Replays allowed for a request rejected with 401.
/// One replay with a fresh token; a second rejection is final.
const MAX_AUTH_RETRIES: u32 = 1;

/// Buffered session events per subscriber
const EVENT_CHANNEL_CAPACITY: usize = 16;

const BLANK_FIELD: &str = "This field may not be blank.";

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum AuthStatus {
    /// Nothing loaded yet
    Uninitialized,
    /// Stored tokens found, validating them with the server
    Checking,
    Authenticated,
    /// Authenticated, with a token refresh in flight
    Refreshing,
    Unauthenticated,
}

/// Session transitions the UI reacts to.
///
/// `Expired` is a background event (failed refresh or invalid stored
/// session) and should redirect to login silently; `LoggedOut` follows an
/// explicit user action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum SessionEvent {
    LoggedIn,
    Refreshed,
    LoggedOut,
    Expired,
}

/// Returned by a successful login or registration.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub tokens: TokenPair,
    pub user: Option<UserProfile>,
    pub authenticated_at: DateTime<Utc>,
}

/// Outcome of validating the stored session at startup.
#[derive(Debug, Clone, PartialEq)]
pub enum StartupCheck {
    /// No usable tokens in storage
    NoSession,
    /// Server accepted the stored session
    Valid(UserProfile),
    /// Server rejected the stored session; tokens were cleared
    Invalid,
    /// Server unreachable or failing; tokens kept so the user can retry
    Degraded(AuthError),
}

// ============================================================================
// Internal state
// ============================================================================

/// Token payload of login, register and refresh responses.
#[derive(Debug, Deserialize)]
struct TokenGrant {
    #[serde(alias = "accessToken", alias = "access_token")]
    access: String,
    #[serde(default, alias = "refreshToken", alias = "refresh_token")]
    refresh: Option<String>,
    #[serde(default)]
    user: Option<UserProfile>,
}

struct SessionState {
    status: AuthStatus,
    tokens: Option<TokenPair>,
    user: Option<UserProfile>,
    /// Bumped whenever a session starts or ends. A refresh that sees a
    /// different epoch on completion belongs to a session that is gone.
    epoch: u64,
}

/// Manages the access/refresh token lifecycle for one user session.
///
/// Construct one per application and share it via `Arc`. All token writes
/// happen under the state lock, which is held across the storage write so a
/// refresh can never resurrect a session cleared by a concurrent logout.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    vault: TokenVault,
    state: Mutex<SessionState>,
    /// Serializes refreshes; holds the last transient refresh failure so
    /// callers that queued behind a failed attempt share its result.
    refresh_gate: Mutex<Option<AuthError>>,
    /// Completed refresh attempts
    refresh_rounds: AtomicU64,
    status_tx: watch::Sender<AuthStatus>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, storage: Arc<dyn SecureStorage>) -> Self {
        let (status_tx, _) = watch::channel(AuthStatus::Uninitialized);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            transport,
            vault: TokenVault::new(storage),
            state: Mutex::new(SessionState {
                status: AuthStatus::Uninitialized,
                tokens: None,
                user: None,
                epoch: 0,
            }),
            refresh_gate: Mutex::new(None),
            refresh_rounds: AtomicU64::new(0),
            status_tx,
            events_tx,
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub async fn status(&self) -> AuthStatus {
        self.state.lock().await.status
    }

    pub async fn is_authenticated(&self) -> bool {
        let st = self.state.lock().await;
        st.tokens.is_some()
            && matches!(st.status, AuthStatus::Authenticated | AuthStatus::Refreshing)
    }

    pub async fn access_token(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .tokens
            .as_ref()
            .map(|t| t.access_token.clone())
    }

    pub async fn user(&self) -> Option<UserProfile> {
        self.state.lock().await.user.clone()
    }

    /// Watch the authentication status.
    pub fn subscribe(&self) -> watch::Receiver<AuthStatus> {
        self.status_tx.subscribe()
    }

    /// Receive session transitions from now on.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    fn set_status(&self, st: &mut SessionState, status: AuthStatus) {
        if st.status != status {
            debug!(from = ?st.status, to = ?status, "Session status changed");
        }
        st.status = status;
        self.status_tx.send_replace(status);
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Load the stored session and validate it against the profile endpoint.
    pub async fn restore(&self) -> StartupCheck {
        {
            let mut st = self.state.lock().await;
            self.set_status(&mut st, AuthStatus::Checking);

            if !self.load_locked(&mut st).await {
                self.set_status(&mut st, AuthStatus::Unauthenticated);
                return StartupCheck::NoSession;
            }
        }

        match self.fetch_profile().await {
            Ok(profile) => {
                let mut st = self.state.lock().await;
                if st.tokens.is_none() {
                    // Ended while validating
                    return StartupCheck::Invalid;
                }
                self.set_status(&mut st, AuthStatus::Authenticated);
                info!(user = %profile.display_name(), "Stored session is valid");
                StartupCheck::Valid(profile)
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Could not validate stored session, keeping it");
                let mut st = self.state.lock().await;
                if st.tokens.is_none() {
                    return StartupCheck::Invalid;
                }
                self.set_status(&mut st, AuthStatus::Authenticated);
                StartupCheck::Degraded(e)
            }
            Err(e) => {
                info!(error = %e, "Stored session rejected, clearing it");
                if let Err(clear_err) = self.end_session(SessionEvent::Expired).await {
                    warn!(error = %clear_err, "Failed to clear rejected session from storage");
                }
                StartupCheck::Invalid
            }
        }
    }

    /// Load the stored session without contacting the server.
    ///
    /// The tokens are trusted as-is; a rejected token is still recovered from
    /// by the first `send`. Returns whether a session was found.
    pub async fn resume(&self) -> bool {
        let mut st = self.state.lock().await;
        let found = self.load_locked(&mut st).await;
        let status = if found {
            AuthStatus::Authenticated
        } else {
            AuthStatus::Unauthenticated
        };
        self.set_status(&mut st, status);
        found
    }

    /// Read the vault into memory. Unreadable storage counts as no session.
    async fn load_locked(&self, st: &mut SessionState) -> bool {
        match self.vault.load().await {
            Ok(Some(tokens)) => {
                st.epoch += 1;
                st.tokens = Some(tokens);
                true
            }
            Ok(None) => {
                debug!("No stored session");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to read stored tokens, starting signed out");
                st.tokens = None;
                false
            }
        }
    }

    // =========================================================================
    // Login / Register / Logout
    // =========================================================================

    /// Exchange a username and password for a session.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<SessionInfo, AuthError> {
        let identifier = identifier.trim();
        let mut missing = FieldErrors::new();
        if identifier.is_empty() {
            missing.insert("username".to_string(), vec![BLANK_FIELD.to_string()]);
        }
        if secret.is_empty() {
            missing.insert("password".to_string(), vec![BLANK_FIELD.to_string()]);
        }
        if !missing.is_empty() {
            return Err(AuthError::ValidationError(missing));
        }

        let request = ApiRequest::post(LOGIN_PATH)
            .json_body(json!({ "username": identifier, "password": secret }));

        debug!(username = identifier, "Logging in");
        self.exchange(request, "Login failed").await
    }

    /// Create an account; success signs the new user in.
    pub async fn register(&self, form: &Registration) -> Result<SessionInfo, AuthError> {
        let missing = form.missing_fields();
        if !missing.is_empty() {
            let fields = missing
                .into_iter()
                .map(|name| (name.to_string(), vec![BLANK_FIELD.to_string()]))
                .collect();
            return Err(AuthError::ValidationError(fields));
        }

        let body = serde_json::to_value(form)
            .map_err(|e| AuthError::field("form", &e.to_string()))?;
        let request = ApiRequest::post(REGISTER_PATH).json_body(body);

        debug!(username = %form.username, "Registering account");
        self.exchange(request, "Registration failed").await
    }

    /// End the session. The server is told on a best-effort basis; local
    /// tokens are cleared no matter what it answers.
    pub async fn logout(&self) -> Result<(), AuthError> {
        let tokens = self.state.lock().await.tokens.clone();

        match tokens {
            Some(tokens) => {
                let request = ApiRequest::post(LOGOUT_PATH)
                    .json_body(json!({ "refresh": tokens.refresh_token }))
                    .bearer(&tokens.access_token);

                match self.transport.execute(&request).await {
                    Ok(response) if response.is_success() => {
                        debug!("Server acknowledged logout");
                    }
                    Ok(response) => {
                        warn!(status = response.status().as_u16(), "Server rejected logout, clearing local session anyway");
                    }
                    Err(e) => {
                        warn!(error = %e, "Logout request failed, clearing local session anyway");
                    }
                }
            }
            None => debug!("No active session, clearing local state only"),
        }

        self.end_session(SessionEvent::LoggedOut).await
    }

    async fn exchange(&self, request: ApiRequest, fallback: &str) -> Result<SessionInfo, AuthError> {
        let result = self.request_grant(&request, fallback).await.and_then(|grant| {
            let refresh = grant.refresh.clone().filter(|r| !r.is_empty()).ok_or_else(|| {
                AuthError::ServerError("Token response is missing the refresh token".to_string())
            })?;
            Ok((grant, refresh))
        });

        let (grant, refresh) = match result {
            Ok(granted) => granted,
            Err(e) => {
                info!(path = request.path(), error = %e, "Credential exchange failed");
                let mut st = self.state.lock().await;
                if st.tokens.is_none() {
                    self.set_status(&mut st, AuthStatus::Unauthenticated);
                }
                return Err(e);
            }
        };

        self.establish(TokenPair::new(grant.access, refresh), grant.user)
            .await
    }

    async fn request_grant(&self, request: &ApiRequest, fallback: &str) -> Result<TokenGrant, AuthError> {
        let response = self.transport.execute(request).await?;

        if !response.is_success() {
            return Err(AuthError::from_rejection(
                response.status(),
                response.text(),
                fallback,
            ));
        }

        let grant: TokenGrant = response
            .json()
            .map_err(|e| AuthError::ServerError(format!("Invalid token response: {}", e)))?;
        if grant.access.is_empty() {
            return Err(AuthError::ServerError("Token response is missing the access token".to_string()));
        }
        Ok(grant)
    }

    /// Persist a fresh pair and mark the session authenticated.
    async fn establish(&self, tokens: TokenPair, user: Option<UserProfile>) -> Result<SessionInfo, AuthError> {
        let mut st = self.state.lock().await;

        if let Err(e) = self.vault.store_pair(&tokens).await {
            warn!(error = %e, "Failed to persist tokens, staying signed out");
            let _ = self.clear_locked(&mut st).await;
            return Err(e.into());
        }

        st.epoch += 1;
        st.tokens = Some(tokens.clone());
        st.user = user.clone();
        self.set_status(&mut st, AuthStatus::Authenticated);
        drop(st);

        self.emit(SessionEvent::LoggedIn);
        info!("Session established");

        Ok(SessionInfo {
            tokens,
            user,
            authenticated_at: Utc::now(),
        })
    }

    /// Drop the session from memory and storage.
    async fn end_session(&self, event: SessionEvent) -> Result<(), AuthError> {
        let mut st = self.state.lock().await;
        let was_active = st.tokens.is_some();
        let cleared = self.clear_locked(&mut st).await;
        drop(st);

        if was_active {
            self.emit(event);
            info!(?event, "Session ended");
        }
        cleared
    }

    /// Clear in-memory state first so a storage failure still fails closed.
    async fn clear_locked(&self, st: &mut SessionState) -> Result<(), AuthError> {
        st.epoch += 1;
        st.tokens = None;
        st.user = None;
        self.set_status(st, AuthStatus::Unauthenticated);

        self.vault.clear().await.map_err(|e| {
            warn!(error = %e, "Failed to clear stored tokens");
            AuthError::from(e)
        })
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Mint a new access token from the refresh token.
    ///
    /// Concurrent callers share a single refresh call.
    pub async fn refresh(&self) -> Result<String, AuthError> {
        let current = self.access_token().await;
        match current {
            Some(token) => self.refresh_after(Some(&token)).await,
            None => Err(AuthError::SessionExpired),
        }
    }

    /// Refresh because `failed` was rejected. If another caller already
    /// replaced that token while we waited, its result is reused.
    async fn refresh_after(&self, failed: Option<&str>) -> Result<String, AuthError> {
        let ticket = self.refresh_rounds.load(Ordering::Acquire);
        let mut gate = self.refresh_gate.lock().await;

        let (refresh_token, epoch) = {
            let mut st = self.state.lock().await;
            let Some(tokens) = st.tokens.as_ref() else {
                debug!("No session to refresh");
                return Err(AuthError::SessionExpired);
            };
            if failed != Some(tokens.access_token.as_str()) {
                debug!("Access token already replaced, reusing it");
                return Ok(tokens.access_token.clone());
            }
            if self.refresh_rounds.load(Ordering::Acquire) != ticket {
                if let Some(err) = (*gate).clone() {
                    debug!(error = %err, "Sharing result of the refresh we queued behind");
                    return Err(err);
                }
            }
            let refresh_token = tokens.refresh_token.clone();
            if st.status == AuthStatus::Authenticated {
                self.set_status(&mut st, AuthStatus::Refreshing);
            }
            (refresh_token, st.epoch)
        };

        info!("Refreshing access token");
        let outcome = self.request_refresh(&refresh_token).await;

        let result = self.apply_refresh(outcome, refresh_token, epoch).await;
        *gate = match &result {
            Err(e) if e.is_transient() => Some(e.clone()),
            _ => None,
        };
        self.refresh_rounds.fetch_add(1, Ordering::Release);
        result
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let request = ApiRequest::post(REFRESH_PATH).json_body(json!({ "refresh": refresh_token }));
        match self.request_grant(&request, "Token refresh failed").await {
            Ok(grant) => Ok(grant),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                debug!(error = %e, "Refresh token rejected");
                Err(AuthError::SessionExpired)
            }
        }
    }

    async fn apply_refresh(
        &self,
        outcome: Result<TokenGrant, AuthError>,
        refresh_token: String,
        epoch: u64,
    ) -> Result<String, AuthError> {
        let mut st = self.state.lock().await;

        if st.epoch != epoch || st.tokens.is_none() {
            info!("Session changed during refresh, discarding result");
            return Err(AuthError::SessionExpired);
        }

        match outcome {
            Ok(grant) => {
                let rotated = grant.refresh.filter(|r| !r.is_empty());
                let persisted = match rotated {
                    Some(ref new_refresh) => {
                        self.vault
                            .store_pair(&TokenPair::new(grant.access.clone(), new_refresh.clone()))
                            .await
                    }
                    None => self.vault.store_access(&grant.access).await,
                };

                if let Err(e) = persisted {
                    warn!(error = %e, "Failed to persist refreshed token, ending session");
                    let _ = self.clear_locked(&mut st).await;
                    drop(st);
                    self.emit(SessionEvent::Expired);
                    return Err(e.into());
                }

                let access = grant.access;
                st.tokens = Some(TokenPair::new(
                    access.clone(),
                    rotated.unwrap_or(refresh_token),
                ));
                if st.status == AuthStatus::Refreshing {
                    self.set_status(&mut st, AuthStatus::Authenticated);
                }
                drop(st);

                self.emit(SessionEvent::Refreshed);
                info!("Access token refreshed");
                Ok(access)
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Token refresh failed, keeping session");
                if st.status == AuthStatus::Refreshing {
                    self.set_status(&mut st, AuthStatus::Authenticated);
                }
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Refresh token rejected, ending session");
                let _ = self.clear_locked(&mut st).await;
                drop(st);
                self.emit(SessionEvent::Expired);
                Err(AuthError::SessionExpired)
            }
        }
    }

    // =========================================================================
    // Interceptors
    // =========================================================================

    /// Attach the current access token unless the request already carries a
    /// credential. No-op when signed out.
    pub async fn authorize(&self, request: ApiRequest) -> ApiRequest {
        if request.has_authorization() {
            return request;
        }
        match self.access_token().await {
            Some(token) => request.bearer(&token),
            None => request,
        }
    }

    /// React to a response of `request`. Anything but a 401 passes through.
    ///
    /// A first 401 triggers one refresh and one replay with the new token; a
    /// 401 on the replay is returned as `Unauthorized`.
    pub async fn handle_unauthorized(
        &self,
        request: ApiRequest,
        response: ApiResponse,
    ) -> Result<ApiResponse, AuthError> {
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        if request.attempt() >= MAX_AUTH_RETRIES {
            warn!(path = request.path(), attempt = request.attempt(), "Request still unauthorized after refresh");
            return Err(Self::rejection(&response));
        }

        let failed = request.bearer_token().map(str::to_string);
        if failed.is_none() && self.access_token().await.is_none() {
            debug!(path = request.path(), "Unauthorized without a session");
            return Err(Self::rejection(&response));
        }

        let token = self.refresh_after(failed.as_deref()).await?;

        let replay = request.retried().bearer(&token);
        debug!(path = replay.path(), attempt = replay.attempt(), "Replaying request with refreshed token");
        let response = self.transport.execute(&replay).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(path = replay.path(), "Request still unauthorized after refresh");
            return Err(Self::rejection(&response));
        }
        Ok(response)
    }

    /// Authorize, send, and recover from one 401.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, AuthError> {
        let request = self.authorize(request).await;
        let response = self.transport.execute(&request).await?;
        self.handle_unauthorized(request, response).await
    }

    fn rejection(response: &ApiResponse) -> AuthError {
        let reason = ServerMessage::parse(response.text())
            .summary()
            .unwrap_or_else(|| "Authentication required".to_string());
        AuthError::Unauthorized(reason)
    }

    // =========================================================================
    // Profile
    // =========================================================================

    /// Fetch the signed-in user and remember it on the session.
    pub async fn fetch_profile(&self) -> Result<UserProfile, AuthError> {
        let response = self.send(ApiRequest::get(PROFILE_PATH)).await?;
        let profile = Self::profile_from(&response)?;
        self.remember_user(profile.clone()).await;
        Ok(profile)
    }

    pub(crate) fn profile_from(response: &ApiResponse) -> Result<UserProfile, AuthError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .map_err(|e| AuthError::ServerError(format!("Invalid profile response: {}", e)));
        }

        let reason = ServerMessage::parse(response.text())
            .summary()
            .unwrap_or_else(|| status.to_string());
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::Unauthorized(reason)),
            _ => Err(AuthError::ServerError(reason)),
        }
    }

    /// Cache a profile on the active session. Ignored when signed out.
    pub(crate) async fn remember_user(&self, profile: UserProfile) {
        let mut st = self.state.lock().await;
        if st.tokens.is_some() {
            st.user = Some(profile);
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("status", &*self.status_tx.borrow())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
