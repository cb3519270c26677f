//! Session authority: login, logout, request authorization and the
//! single-flight refresh-and-retry protocol.
//!
//! Every request issued through [`SessionManager::send`] passes a pre-request
//! hook ([`SessionManager::authorize`]) and a post-response hook that turns a
//! 401 into at most one token refresh per burst and at most one retry per
//! request.

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{AccessError, AuthError, PortalError, RefreshError, TransportError};
use crate::session::{Credentials, Role, Session};
use crate::storage::{SessionStore, StorageKey};
use crate::transport::{ApiRequest, ApiResponse, Transport};

pub const LOGIN_PATH: &str = "api/login/";
pub const REFRESH_PATH: &str = "api/refresh-token/";

type Waiter = oneshot::Sender<Result<String, RefreshError>>;

/// At most one refresh is in flight; everyone else queues behind it.
enum RefreshState {
    Idle,
    Refreshing { waiters: Vec<Waiter> },
}

struct Inner {
    session: Session,
    refresh: RefreshState,
    /// Bumped whenever login or logout replaces the session, so a refresh
    /// that started against an older session does not overwrite a newer one.
    generation: u64,
}

/// How a request that got a 401 gets its next token.
enum Ticket {
    /// Someone already refreshed after this request was stamped.
    Fresh(String),
    /// A refresh is in flight; wait for its outcome.
    Wait(oneshot::Receiver<Result<String, RefreshError>>),
    /// This request drives the refresh.
    Lead { refresh: String, generation: u64 },
}

#[derive(Deserialize)]
struct LoginGrant {
    access: String,
    refresh: String,
    role: Role,
    #[serde(deserialize_with = "string_or_number")]
    unique_id: String,
}

#[derive(Deserialize)]
struct RefreshGrant {
    access: String,
    /// Present when the backend rotates refresh tokens.
    #[serde(default)]
    refresh: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// Application-level failure carried in an otherwise successful body.
fn server_error(body: &serde_json::Value) -> Option<String> {
    ["error", "detail"].iter().find_map(|key| match body.get(*key)? {
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null | serde_json::Value::Bool(false) => None,
        other => Some(other.to_string()),
    })
}

pub struct SessionManager {
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    inner: Mutex<Inner>,
}

impl SessionManager {
    /// Build a manager, seeding the session from `store`. The store is not
    /// read again afterwards.
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn SessionStore>) -> Self {
        let mut session = hydrate(store.as_ref());
        let half_session = !session.is_authenticated() && !session.is_empty();
        if half_session {
            warn!("Discarding stored session without both tokens");
            session = Session::default();
        } else if session.is_authenticated() {
            info!(role = ?session.role, "Restored session from storage");
        }
        let manager = Self {
            transport,
            store,
            inner: Mutex::new(Inner {
                session,
                refresh: RefreshState::Idle,
                generation: 0,
            }),
        };
        if half_session {
            for key in StorageKey::ALL {
                manager.mirror(key, None);
            }
        }
        manager
    }

    pub fn session(&self) -> Session {
        self.inner.lock().session.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.lock().session.is_authenticated()
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.lock().session.role
    }

    pub fn subject_id(&self) -> Option<String> {
        self.inner.lock().session.subject_id.clone()
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self.inner.lock().refresh, RefreshState::Refreshing { .. })
    }

    /// Protected-route guard.
    pub fn require_role(&self, required: Role) -> Result<Session, AccessError> {
        let session = self.session();
        if !session.is_authenticated() {
            return Err(AccessError::NotAuthenticated);
        }
        match session.role {
            Some(actual) if actual == required => Ok(session),
            Some(actual) => Err(AccessError::Forbidden { required, actual }),
            None => Err(AccessError::NotAuthenticated),
        }
    }

    /// Exchange credentials for a session. On any failure the current
    /// session is left untouched.
    pub async fn login(&self, credentials: Credentials) -> Result<Session, AuthError> {
        let requested = credentials.role();
        let request = ApiRequest::post(LOGIN_PATH).json(&credentials)?;
        let response = self.transport.send(request).await?;
        let body = response.json_value();

        if let Some(message) = server_error(&body) {
            warn!(role = %requested, status = %response.status, "Login rejected");
            return Err(AuthError::Rejected(message));
        }
        if !response.status.is_success() {
            warn!(role = %requested, status = %response.status, "Login rejected");
            return Err(AuthError::Rejected("Login Failed".to_string()));
        }

        let grant: LoginGrant = serde_json::from_value(body)
            .map_err(|e| AuthError::MalformedResponse(e.to_string()))?;
        if grant.role != requested {
            debug!(requested = %requested, granted = %grant.role, "Backend granted a different role");
        }

        let session = Session {
            access_token: Some(grant.access),
            refresh_token: Some(grant.refresh),
            role: Some(grant.role),
            subject_id: Some(grant.unique_id),
        };
        {
            let mut inner = self.inner.lock();
            inner.session = session.clone();
            inner.generation += 1;
            self.mirror_session(&session);
        }
        info!(role = %grant.role, subject_id = ?session.subject_id, "Logged in");
        Ok(session)
    }

    /// Drop the session from memory and storage. Safe to call repeatedly.
    pub fn logout(&self) {
        let mut inner = self.inner.lock();
        self.clear_locked(&mut inner);
    }

    /// Pre-request hook: stamp the current bearer token. A request issued
    /// while a refresh is in flight waits for it and gets the fresh token.
    ///
    /// Returns the token the request was stamped with.
    pub async fn authorize(&self, request: &mut ApiRequest) -> Result<Option<String>, PortalError> {
        let pending = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match &mut inner.refresh {
                RefreshState::Refreshing { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Err(rx)
                }
                RefreshState::Idle if inner.session.is_authenticated() => {
                    Ok(inner.session.access_token.clone())
                }
                RefreshState::Idle => Ok(None),
            }
        };

        let token = match pending {
            Ok(token) => token,
            Err(rx) => Some(wait_for_refresh(rx).await?),
        };
        if let Some(token) = &token {
            request.set_bearer(token)?;
        }
        Ok(token)
    }

    /// Send a request with session handling: authorize, dispatch, and on a
    /// 401 refresh once and retry once.
    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, PortalError> {
        let stamped = self.authorize(&mut request).await?;
        let response = self.transport.send(request.clone()).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }
        if request.retried {
            warn!(path = %request.path, "Unauthorized after retry");
            return Err(PortalError::Unauthorized);
        }

        request.retried = true;
        debug!(path = %request.path, "Unauthorized; recovering session");
        let token = self.recover(stamped.as_deref()).await?;
        request.set_bearer(&token)?;

        let response = self.transport.send(request).await?;
        if response.is_unauthorized() {
            warn!("Request still unauthorized after token refresh");
            return Err(PortalError::Unauthorized);
        }
        Ok(response)
    }

    /// Obtain a token to retry with after a 401 on a request stamped with
    /// `stale`.
    async fn recover(&self, stale: Option<&str>) -> Result<String, RefreshError> {
        let ticket = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if let RefreshState::Refreshing { waiters } = &mut inner.refresh {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                debug!(queued = waiters.len(), "Waiting on in-flight refresh");
                Ticket::Wait(rx)
            } else if let Some(refresh) = inner.session.refresh_token.clone() {
                match inner.session.access_token.clone() {
                    Some(current) if stale != Some(current.as_str()) => Ticket::Fresh(current),
                    _ => {
                        inner.refresh = RefreshState::Refreshing {
                            waiters: Vec::new(),
                        };
                        Ticket::Lead {
                            refresh,
                            generation: inner.generation,
                        }
                    }
                }
            } else {
                warn!("Unauthorized with no refresh token; forcing logout");
                self.clear_locked(inner);
                return Err(RefreshError::MissingRefreshToken);
            }
        };

        match ticket {
            Ticket::Fresh(token) => Ok(token),
            Ticket::Wait(rx) => wait_for_refresh(rx).await,
            Ticket::Lead {
                refresh,
                generation,
            } => {
                self.lead_refresh(refresh, generation)
                    .instrument(info_span!("refresh", id = %Uuid::new_v4()))
                    .await
            }
        }
    }

    async fn lead_refresh(&self, refresh: String, generation: u64) -> Result<String, RefreshError> {
        let mut pending = PendingRefresh {
            manager: self,
            armed: true,
        };
        let outcome = self.request_refresh(&refresh).await;
        pending.armed = false;

        let (outcome, waiters) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let waiters = match std::mem::replace(&mut inner.refresh, RefreshState::Idle) {
                RefreshState::Refreshing { waiters } => waiters,
                RefreshState::Idle => Vec::new(),
            };

            let outcome = if inner.generation != generation {
                debug!("Session replaced during refresh; discarding result");
                inner
                    .session
                    .access_token
                    .clone()
                    .ok_or(RefreshError::Interrupted)
            } else {
                match outcome {
                    Ok(grant) => {
                        inner.session.access_token = Some(grant.access.clone());
                        self.mirror(StorageKey::AccessToken, Some(&grant.access));
                        if let Some(rotated) = grant.refresh {
                            self.mirror(StorageKey::RefreshToken, Some(&rotated));
                            inner.session.refresh_token = Some(rotated);
                        }
                        info!(queued = waiters.len(), "Access token refreshed");
                        Ok(grant.access)
                    }
                    Err(e) => {
                        warn!(error = %e, queued = waiters.len(), "Token refresh failed; forcing logout");
                        self.clear_locked(inner);
                        Err(e)
                    }
                }
            };
            (outcome, waiters)
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        outcome
    }

    async fn request_refresh(&self, refresh: &str) -> Result<RefreshGrant, RefreshError> {
        info!("Refreshing access token");
        let request =
            ApiRequest::post(REFRESH_PATH).json(&serde_json::json!({ "refresh": refresh }))?;
        let response = self.transport.send(request).await?;
        let body = response.json_value();

        if !response.status.is_success() {
            let message =
                server_error(&body).unwrap_or_else(|| format!("HTTP {}", response.status));
            return Err(RefreshError::Rejected(message));
        }
        serde_json::from_value(body).map_err(|e| {
            RefreshError::Transport(TransportError::Decode(format!(
                "refresh response: {}",
                e
            )))
        })
    }

    /// Clear memory and storage. Caller holds the lock.
    fn clear_locked(&self, inner: &mut Inner) {
        let had_session = !inner.session.is_empty();
        if had_session {
            inner.session = Session::default();
            inner.generation += 1;
        }
        for key in StorageKey::ALL {
            self.mirror(key, None);
        }
        if had_session {
            info!("Logged out");
        }
    }

    fn mirror_session(&self, session: &Session) {
        self.mirror(StorageKey::AccessToken, session.access_token.as_deref());
        self.mirror(StorageKey::RefreshToken, session.refresh_token.as_deref());
        self.mirror(StorageKey::Role, session.role.map(Role::as_str));
        self.mirror(StorageKey::SubjectId, session.subject_id.as_deref());
    }

    fn mirror(&self, key: StorageKey, value: Option<&str>) {
        let result = match value {
            Some(value) => self.store.set(key, value),
            None => self.store.remove(key),
        };
        if let Err(e) = result {
            warn!(key = key.as_str(), error = %e, "Session storage write failed");
        }
    }
}

/// Resets the refresh state if the leading future is dropped mid-flight.
/// Queued requests see their sender dropped and fail as interrupted.
struct PendingRefresh<'a> {
    manager: &'a SessionManager,
    armed: bool,
}

impl Drop for PendingRefresh<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.manager.inner.lock();
        if let RefreshState::Refreshing { waiters } =
            std::mem::replace(&mut inner.refresh, RefreshState::Idle)
        {
            warn!(queued = waiters.len(), "Token refresh abandoned");
        }
    }
}

async fn wait_for_refresh(
    rx: oneshot::Receiver<Result<String, RefreshError>>,
) -> Result<String, RefreshError> {
    rx.await.unwrap_or(Err(RefreshError::Interrupted))
}

fn hydrate(store: &dyn SessionStore) -> Session {
    let role = store
        .get(StorageKey::Role)
        .and_then(|raw| match raw.parse::<Role>() {
            Ok(role) => Some(role),
            Err(e) => {
                warn!(error = %e, "Ignoring stored role");
                None
            }
        });
    Session {
        access_token: store.get(StorageKey::AccessToken),
        refresh_token: store.get(StorageKey::RefreshToken),
        role,
        subject_id: store.get(StorageKey::SubjectId),
    }
}
