//! Access-token lifecycle with single-flight refresh.
//!
//! # Design
//! The provider holds at most one token and at most one in-flight refresh.
//! Callers that find the token inside the refresh window all await the same
//! shared future. That future applies its outcome to the provider state
//! before yielding it, so every waiter observes the already-installed token.
//! A generation counter stops a refresh that finishes after `invalidate` or
//! `store` from resurrecting a stale token.
//!
//! Dropping one waiter never cancels the refresh for the others; if every
//! waiter goes away, the next caller resumes polling the same future.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{ApiError, ErrorKind};
use crate::types::TokenResponse;

/// Lifetime assumed when the token endpoint omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Instant,
}

impl AuthToken {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>, lifetime: Duration) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at: Instant::now() + lifetime,
        }
    }

    pub fn from_response(response: TokenResponse) -> Self {
        let lifetime = response
            .expires_in
            .map_or(DEFAULT_TOKEN_LIFETIME, Duration::from_secs);
        Self::new(response.access_token, response.refresh_token, lifetime)
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn needs_refresh(&self, skew: Duration, now: Instant) -> bool {
        now + skew >= self.expires_at
    }
}

// Tokens never reach logs.
impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Performs the refresh round trip.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<AuthToken, ApiError>;
}

type RefreshFuture = Shared<BoxFuture<'static, Result<AuthToken, ApiError>>>;

#[derive(Default)]
struct AuthState {
    token: Option<AuthToken>,
    in_flight: Option<(u64, RefreshFuture)>,
    generation: u64,
}

impl AuthState {
    /// Drop the token and detach any running refresh.
    fn reset(&mut self) {
        self.token = None;
        self.in_flight = None;
        self.generation += 1;
    }
}

pub struct AuthTokenProvider {
    state: Arc<Mutex<AuthState>>,
    refresher: Arc<dyn TokenRefresher>,
    refresh_skew: Duration,
}

impl AuthTokenProvider {
    pub fn new(refresher: Arc<dyn TokenRefresher>, refresh_skew: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(AuthState::default())),
            refresher,
            refresh_skew,
        }
    }

    /// Current access token, refreshing first if it is inside the skew window.
    ///
    /// # Errors
    ///
    /// `UNAUTHORIZED` when no token is held, the token expired without a
    /// refresh token, or the refresh was rejected; the refresher's own error
    /// for any other refresh failure.
    pub async fn get_valid_token(&self) -> Result<String, ApiError> {
        let refresh = {
            let mut state = self.state.lock();
            let now = Instant::now();

            let (refresh_token, unexpired) = match &state.token {
                None => return Err(ApiError::unauthorized("not authenticated")),
                Some(token) if !token.needs_refresh(self.refresh_skew, now) => {
                    return Ok(token.access_token.clone());
                }
                Some(token) => (
                    token.refresh_token.clone(),
                    (!token.is_expired(now)).then(|| token.access_token.clone()),
                ),
            };

            if let Some((_, in_flight)) = &state.in_flight {
                in_flight.clone()
            } else if let Some(refresh_token) = refresh_token {
                self.start_refresh(&mut state, refresh_token)
            } else if let Some(access_token) = unexpired {
                // Nothing to refresh with; use the token until it lapses.
                return Ok(access_token);
            } else {
                state.reset();
                return Err(ApiError::unauthorized("session expired"));
            }
        };

        refresh.await.map(|token| token.access_token)
    }

    fn start_refresh(&self, state: &mut AuthState, refresh_token: String) -> RefreshFuture {
        state.generation += 1;
        let generation = state.generation;
        let shared_state = Arc::clone(&self.state);
        let refresher = Arc::clone(&self.refresher);

        tracing::debug!(generation, "starting token refresh");
        let refresh = async move {
            let outcome = refresher.refresh(&refresh_token).await;

            let mut state = shared_state.lock();
            if state.generation == generation {
                state.in_flight = None;
                match &outcome {
                    Ok(token) => state.token = Some(token.clone()),
                    Err(err) if err.kind == ErrorKind::Unauthorized => {
                        tracing::warn!("refresh token rejected; clearing session");
                        state.token = None;
                    }
                    Err(err) => tracing::warn!(error = %err, "token refresh failed"),
                }
            }
            outcome
        }
        .boxed()
        .shared();

        state.in_flight = Some((generation, refresh.clone()));
        refresh
    }

    /// Install a freshly issued token, replacing any previous one.
    pub fn store(&self, token: AuthToken) {
        let mut state = self.state.lock();
        state.reset();
        state.token = Some(token);
    }

    /// Drop the current token, whatever it is. Used on logout.
    pub fn invalidate(&self) {
        self.state.lock().reset();
    }

    /// Drop the session only if it still holds `access_token`.
    ///
    /// Called after an upstream 401 with the token that request carried; a
    /// token installed by a sibling's refresh since then is left alone.
    /// Returns whether the session was dropped.
    pub fn invalidate_if(&self, access_token: &str) -> bool {
        let mut state = self.state.lock();
        let held = state
            .token
            .as_ref()
            .is_some_and(|token| token.access_token == access_token);
        if held {
            state.reset();
        }
        held
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().token.is_some()
    }
}

impl fmt::Debug for AuthTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AuthTokenProvider")
            .field("token", &state.token)
            .field("refreshing", &state.in_flight.is_some())
            .field("refresh_skew", &self.refresh_skew)
            .finish()
    }
}
