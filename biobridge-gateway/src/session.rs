//! Upstream session manager.
//!
//! Owns the single authenticated upstream session. Callers hold a cheap
//! [`SessionManager`] handle and call [`SessionManager::acquire`] before every
//! request; nobody caches the session itself.
//!
//! - The fast path is a lock-free `ArcSwapOption` load.
//! - Logins are single-flight: the first caller spawns a login task and every
//!   concurrent caller waits on the same `watch` channel for its outcome.
//!   The task is detached, so a caller going away never cancels it.
//! - When every endpoint fails, one retry timer is armed. Until it fires,
//!   `acquire` fails fast with [`SessionError::BackingOff`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use biobridge_core::{SessionHealth, SessionPhase};
use chrono::{DateTime, Utc};
use reqwest::Url;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::upstream::{EnrollmentApi, SessionError, UpstreamError};

/// An authenticated upstream session.
#[derive(Clone)]
pub struct Session {
    pub endpoint: Url,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    issued: Instant,
}

impl Session {
    pub fn new(endpoint: Url, token: impl Into<String>) -> Self {
        Self {
            endpoint,
            token: token.into(),
            issued_at: Utc::now(),
            issued: Instant::now(),
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.issued.elapsed() >= ttl
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint.as_str())
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

type LoginOutcome = Result<Arc<Session>, SessionError>;

/// Mutable bookkeeping, only touched under the mutex and never across an await.
struct State {
    phase: SessionPhase,
    /// Receiver for the login in flight, if any.
    in_flight: Option<watch::Receiver<Option<LoginOutcome>>>,
    /// Deadline of the outstanding retry timer, if any.
    retry_at: Option<Instant>,
    /// Background retries since the last caller-initiated login.
    background_retries: u32,
    consecutive_failures: u32,
}

struct Inner {
    api: Arc<dyn EnrollmentApi>,
    config: SessionConfig,
    current: ArcSwapOption<Session>,
    state: Mutex<State>,
    login_attempts: AtomicU64,
    retries_scheduled: AtomicU64,
}

/// Shared handle to the upstream session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("health", &self.health())
            .finish()
    }
}

impl SessionManager {
    pub fn new(api: Arc<dyn EnrollmentApi>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                config,
                current: ArcSwapOption::empty(),
                state: Mutex::new(State {
                    phase: SessionPhase::Unauthenticated,
                    in_flight: None,
                    retry_at: None,
                    background_retries: 0,
                    consecutive_failures: 0,
                }),
                login_attempts: AtomicU64::new(0),
                retries_scheduled: AtomicU64::new(0),
            }),
        }
    }

    /// Return the current session, logging in first if needed.
    ///
    /// Concurrent callers share one login and all observe its outcome.
    pub async fn acquire(&self) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.inner.valid_session() {
            return Ok(session);
        }

        let mut rx = {
            let mut state = self.inner.lock_state();

            // Re-check: a login may have finished while we took the lock.
            if let Some(session) = self.inner.current.load_full() {
                if !session.is_expired(self.inner.config.ttl) {
                    return Ok(session);
                }
                tracing::info!(endpoint = %session.endpoint, "Upstream session expired");
                self.inner.current.store(None);
                state.phase = SessionPhase::Invalidated;
            }

            if let Some(rx) = &state.in_flight {
                rx.clone()
            } else if let Some(at) = state.retry_at {
                return Err(SessionError::BackingOff {
                    retry_in: at.saturating_duration_since(Instant::now()),
                });
            } else {
                state.background_retries = 0;
                Inner::start_login(&self.inner, &mut state)
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SessionError::LoginAborted)?;
        match &*outcome {
            Some(result) => result.clone(),
            None => Err(SessionError::LoginAborted),
        }
    }

    /// Drop `session` if it is still the current one.
    ///
    /// A rejection observed on an older token is ignored, so a stale failure
    /// cannot discard a freshly issued session. Idempotent.
    pub fn invalidate(&self, session: &Session) {
        let mut state = self.inner.lock_state();
        let Some(current) = self.inner.current.load_full() else {
            return;
        };
        if current.token != session.token || current.endpoint != session.endpoint {
            tracing::debug!("Ignoring invalidation of a superseded session");
            return;
        }
        self.inner.current.store(None);
        state.phase = SessionPhase::Invalidated;
        tracing::info!(endpoint = %current.endpoint, "Upstream session invalidated");
    }

    /// Snapshot of the manager's observable state.
    pub fn health(&self) -> SessionHealth {
        let state = self.inner.lock_state();
        let current = self.inner.current.load_full();

        let phase = match (&current, state.phase) {
            (Some(session), SessionPhase::Authenticated) if session.is_expired(self.inner.config.ttl) => {
                SessionPhase::Invalidated
            }
            (_, phase) => phase,
        };

        SessionHealth {
            phase,
            endpoint: current.as_ref().map(|s| s.endpoint.to_string()),
            issued_at: current.as_ref().map(|s| s.issued_at),
            consecutive_failures: state.consecutive_failures,
            retry_scheduled: state.retry_at.is_some(),
            retries_scheduled: self.inner.retries_scheduled.load(Ordering::Relaxed),
            login_attempts: self.inner.login_attempts.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn valid_session(&self) -> Option<Arc<Session>> {
        self.current
            .load_full()
            .filter(|s| !s.is_expired(self.config.ttl))
    }

    /// Spawn the login task and record it as in flight.
    fn start_login(
        this: &Arc<Self>,
        state: &mut State,
    ) -> watch::Receiver<Option<LoginOutcome>> {
        let (tx, rx) = watch::channel(None);
        state.in_flight = Some(rx.clone());
        state.phase = SessionPhase::Authenticating;

        let inner = Arc::clone(this);
        tokio::spawn(async move {
            let round = tokio::spawn(Self::login_round(Arc::clone(&inner)));
            let outcome = match round.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "Login task failed");
                    Err(SessionError::LoginAborted)
                }
            };
            Self::finish_login(&inner, &outcome);
            let _ = tx.send(Some(outcome));
        });

        rx
    }

    /// Try each endpoint in order; the first success wins.
    async fn login_round(this: Arc<Self>) -> LoginOutcome {
        let endpoints = &this.config.endpoints;
        if endpoints.is_empty() {
            return Err(SessionError::NoEndpoints);
        }

        let mut last_error = String::new();
        for endpoint in endpoints {
            this.login_attempts.fetch_add(1, Ordering::Relaxed);

            let result = tokio::time::timeout(
                this.config.login_timeout,
                this.api.login(endpoint, &this.config.credentials),
            )
            .await
            .unwrap_or(Err(UpstreamError::Timeout(this.config.login_timeout)));

            match result {
                Ok(token) => return Ok(Arc::new(Session::new(endpoint.clone(), token))),
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "Upstream login failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(SessionError::AllEndpointsFailed {
            attempts: endpoints.len(),
            last_error,
        })
    }

    fn finish_login(this: &Arc<Self>, outcome: &LoginOutcome) {
        let mut state = this.lock_state();
        state.in_flight = None;

        match outcome {
            Ok(session) => {
                this.current.store(Some(Arc::clone(session)));
                state.phase = SessionPhase::Authenticated;
                state.consecutive_failures = 0;
                state.background_retries = 0;
                tracing::info!(endpoint = %session.endpoint, "Upstream session established");
            }
            Err(e) => {
                state.phase = SessionPhase::Unauthenticated;
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);

                if state.background_retries < this.config.max_background_retries {
                    Self::schedule_retry(this, &mut state);
                    tracing::warn!(
                        error = %e,
                        backoff = ?this.config.backoff,
                        failures = state.consecutive_failures,
                        "Upstream login failed, retry scheduled"
                    );
                } else {
                    tracing::error!(
                        error = %e,
                        failures = state.consecutive_failures,
                        "Upstream login failed, background retries exhausted"
                    );
                }
            }
        }
    }

    fn schedule_retry(this: &Arc<Self>, state: &mut State) {
        if state.retry_at.is_some() {
            return;
        }
        let at = Instant::now() + this.config.backoff;
        state.retry_at = Some(at);
        this.retries_scheduled.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(this);
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            Self::fire_retry(&inner);
        });
    }

    fn fire_retry(this: &Arc<Self>) {
        let mut state = this.lock_state();
        state.retry_at = None;

        if state.in_flight.is_some() || this.valid_session().is_some() {
            return;
        }
        state.background_retries += 1;
        tracing::info!(attempt = state.background_retries, "Retrying upstream login");
        let _ = Self::start_login(this, &mut state);
    }
}
