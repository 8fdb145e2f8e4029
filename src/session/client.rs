//! Session registration and heartbeat against the remote authority.
//!
//! State machine:
//!
//! ```text
//! unregistered ──register──▶ registered ──heartbeat ok──▶ registered
//!                               │
//!                               └─heartbeat invalid─▶ unregistered ──re-register──▶ registered
//! ```
//!
//! The client is the only writer of its [`SessionState`]. Re-registration is
//! guarded by an atomic flag: a heartbeat tick that finds a re-registration
//! already running does nothing.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::identity::ClientIdentity;
use crate::models::session::{Scope, SessionState};
use crate::sandbox::remote::{API_KEY_HEADER, SESSION_HEADER};
use crate::sandbox::HeaderSource;
use crate::{AppError, Result};

/// Heartbeat interval used when the server does not advertise one.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Result of one heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Session is still valid.
    Refreshed,
    /// Session was invalid and has been replaced.
    Reregistered,
    /// A re-registration was already running; nothing was done.
    Skipped,
    /// The remote side could not be reached; state kept for the next tick.
    Transient,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    session_id: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    heartbeat_interval_ms: Option<u64>,
    #[serde(default)]
    features: Vec<String>,
    scope: Scope,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatResponse {
    valid: bool,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

struct HeartbeatTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Client for `/pml/register`, `/pml/heartbeat` and `/pml/unregister`.
pub struct SessionClient {
    base_url: String,
    api_key: Option<String>,
    identity: ClientIdentity,
    workspace: String,
    http: reqwest::Client,
    state: RwLock<Option<SessionState>>,
    reregistering: AtomicBool,
    heartbeat: Mutex<Option<HeartbeatTask>>,
}

impl SessionClient {
    /// Build a client for `base_url`; every request is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        identity: ClientIdentity,
        workspace: &Path,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Http(format!("failed to build http client: {err}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            identity,
            workspace: workspace.display().to_string(),
            http,
            state: RwLock::new(None),
            reregistering: AtomicBool::new(false),
            heartbeat: Mutex::new(None),
        })
    }

    /// Register a new session, replacing any existing state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` if the remote side rejects the handshake or
    /// cannot be reached. There is no session to fall back to.
    pub async fn register(&self) -> Result<SessionState> {
        let body = json!({
            "clientId": self.identity.client_id(),
            "version": env!("CARGO_PKG_VERSION"),
            "capabilities": {
                "sandbox": true,
                "clientTools": true,
                "hybridRouting": true,
            },
            "workspace": self.workspace,
        });

        let response = self
            .http
            .post(self.url("/pml/register"))
            .headers(self.api_key_headers())
            .json(&body)
            .send()
            .await
            .map_err(|err| AppError::Session(format!("register request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Session(format!("register rejected: HTTP {status}")));
        }
        let registered: RegisterResponse = response
            .json()
            .await
            .map_err(|err| AppError::Session(format!("invalid register response: {err}")))?;

        let state = SessionState {
            session_id: registered.session_id,
            expires_at: registered.expires_at,
            heartbeat_interval: registered
                .heartbeat_interval_ms
                .filter(|ms| *ms > 0)
                .map_or(DEFAULT_HEARTBEAT_INTERVAL, Duration::from_millis),
            scope: registered.scope,
            features: registered.features,
        };
        info!(
            session_id = %state.session_id,
            org = %state.scope.org,
            project = %state.scope.project,
            "session registered"
        );
        *self.write_state() = Some(state.clone());
        Ok(state)
    }

    /// Refresh the session, re-registering when it is no longer valid.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` if a needed re-registration fails.
    pub async fn heartbeat(&self) -> Result<HeartbeatOutcome> {
        if self.reregistering.load(Ordering::SeqCst) {
            debug!("heartbeat skipped: re-registration in progress");
            return Ok(HeartbeatOutcome::Skipped);
        }

        let Some(session) = self.state() else {
            debug!("heartbeat without a session; registering");
            return self.reregister().await;
        };
        if session.is_expired() {
            info!(session_id = %session.session_id, "session expired locally; re-registering");
            return self.replace_session(&session.session_id).await;
        }

        let response = match self
            .http
            .post(self.url("/pml/heartbeat"))
            .headers(self.headers())
            .json(&json!({ "sessionId": session.session_id }))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(session_id = %session.session_id, %err, "heartbeat failed; will retry");
                return Ok(HeartbeatOutcome::Transient);
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::NOT_FOUND {
            info!(session_id = %session.session_id, %status, "session rejected; re-registering");
            return self.replace_session(&session.session_id).await;
        }
        if !status.is_success() {
            warn!(session_id = %session.session_id, %status, "heartbeat returned an error; will retry");
            return Ok(HeartbeatOutcome::Transient);
        }

        let beat: HeartbeatResponse = match response.json().await {
            Ok(beat) => beat,
            Err(err) => {
                warn!(%err, "invalid heartbeat response; will retry");
                return Ok(HeartbeatOutcome::Transient);
            }
        };
        if !beat.valid {
            info!(session_id = %session.session_id, "session invalidated; re-registering");
            return self.replace_session(&session.session_id).await;
        }

        if let Some(current) = self.write_state().as_mut() {
            if current.session_id == session.session_id {
                current.expires_at = beat.expires_at.or(current.expires_at);
            }
        }
        debug!(session_id = %session.session_id, "heartbeat ok");
        Ok(HeartbeatOutcome::Refreshed)
    }

    /// Stop the heartbeat, tell the remote side (best effort), clear state.
    pub async fn unregister(&self) {
        self.stop_heartbeat().await;

        if let Some(session) = self.state() {
            let result = self
                .http
                .post(self.url("/pml/unregister"))
                .headers(self.headers())
                .json(&json!({ "sessionId": session.session_id }))
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    info!(session_id = %session.session_id, "session unregistered");
                }
                Ok(response) => {
                    warn!(session_id = %session.session_id, status = %response.status(), "unregister rejected");
                }
                Err(err) => warn!(session_id = %session.session_id, %err, "unregister failed"),
            }
        }

        self.clear_state();
    }

    /// Start the periodic heartbeat, replacing a running one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let period = self
            .state()
            .map_or(DEFAULT_HEARTBEAT_INTERVAL, |state| state.heartbeat_interval);
        let cancel = CancellationToken::new();
        let client = Arc::clone(self);
        let token = cancel.clone();

        let handle = tokio::spawn(
            async move {
                let mut current = period;
                let mut interval = heartbeat_timer(current);
                loop {
                    tokio::select! {
                        () = token.cancelled() => {
                            debug!("heartbeat task shutting down");
                            break;
                        }
                        _ = interval.tick() => {
                            if let Err(err) = client.heartbeat().await {
                                error!(%err, "heartbeat re-registration failed");
                            }
                            if let Some(next) = changed_period(current, client.state().as_ref()) {
                                debug!(?current, ?next, "heartbeat interval changed");
                                current = next;
                                interval = heartbeat_timer(current);
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("session_heartbeat", ?period)),
        );

        let previous = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(HeartbeatTask { cancel, handle });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    /// Stop the periodic heartbeat and wait for it to exit.
    pub async fn stop_heartbeat(&self) {
        let task = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(err) = task.handle.await {
                warn!(%err, "heartbeat task ended abnormally");
            }
        }
    }

    /// Current session, if registered.
    #[must_use]
    pub fn state(&self) -> Option<SessionState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Scope of the current session, if registered.
    #[must_use]
    pub fn scope(&self) -> Option<Scope> {
        self.state().map(|state| state.scope)
    }

    /// Whether a session is registered.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Drop `session_id` and register anew, unless it was already replaced.
    async fn replace_session(&self, session_id: &str) -> Result<HeartbeatOutcome> {
        if !self.clear_if_current(session_id) {
            debug!(session_id, "session already replaced; keeping the new one");
            return Ok(HeartbeatOutcome::Skipped);
        }
        self.reregister().await
    }

    async fn reregister(&self) -> Result<HeartbeatOutcome> {
        if self
            .reregistering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("re-registration already in progress");
            return Ok(HeartbeatOutcome::Skipped);
        }
        let result = self.register().await;
        self.reregistering.store(false, Ordering::SeqCst);
        result.map(|_| HeartbeatOutcome::Reregistered)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn api_key_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(key) = &self.api_key {
            insert_header(&mut headers, API_KEY_HEADER, key);
        }
        headers
    }

    fn clear_state(&self) {
        *self.write_state() = None;
    }

    fn clear_if_current(&self, session_id: &str) -> bool {
        let mut state = self.write_state();
        if state
            .as_ref()
            .is_some_and(|current| current.session_id == session_id)
        {
            *state = None;
            true
        } else {
            false
        }
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, Option<SessionState>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HeaderSource for SessionClient {
    fn headers(&self) -> HeaderMap {
        let mut headers = self.api_key_headers();
        if let Some(session) = self.state() {
            insert_header(&mut headers, SESSION_HEADER, &session.session_id);
        }
        headers
    }
}

/// Timer whose first tick is one `period` from now.
fn heartbeat_timer(period: Duration) -> tokio::time::Interval {
    tokio::time::interval_at(tokio::time::Instant::now() + period, period)
}

/// The advertised interval of `state` when it differs from `current`.
fn changed_period(current: Duration, state: Option<&SessionState>) -> Option<Duration> {
    state
        .map(|state| state.heartbeat_interval)
        .filter(|next| *next != current)
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => warn!(header = name, "header value is not valid http; omitted"),
    }
}
