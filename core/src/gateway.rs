//! The request orchestrator.
//!
//! # Design
//! One call walks a fixed sequence: resolve the endpoint row, check the
//! cache, acquire a token, pick a dispatch target (mock adapter or
//! transport), dispatch under the endpoint timeout with bounded retries,
//! classify, then write the cache or invalidate resource families.
//!
//! Every collaborator is injected through `GatewayBuilder`, and the backend
//! mode lives in the `GatewayConfig` each gateway is built from, so
//! independent gateways with different modes can coexist in one process.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::auth::{AuthToken, AuthTokenProvider, TokenRefresher};
use crate::cache::CacheStore;
use crate::client::{build_request, classify_status, parse_response};
use crate::config::{ConfigError, GatewayConfig};
use crate::endpoints::{EndpointConfig, EndpointKey, EndpointRegistry, Params, RegistryError, ServiceId};
use crate::error::{ApiError, ErrorKind};
use crate::http::{HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};
use crate::mock::MockAdapter;
use crate::platform::{BackendMode, BaseUrlResolver, Platform, PlatformInfo, StaticPlatform};
use crate::response::ApiResponse;
use crate::retry::{ExponentialBackoff, RetryPolicy};
use crate::types::TokenResponse;

/// Failures while assembling a gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Per-call state, owned by the in-flight call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub endpoint: EndpointKey,
    pub params: Params,
    pub body: Option<Bytes>,
    /// Number of dispatches issued so far.
    pub attempt: u32,
    pub started_at: Instant,
}

impl RequestContext {
    pub fn new(endpoint: EndpointKey, params: Params, body: Option<Bytes>) -> Self {
        Self {
            endpoint,
            params,
            body,
            attempt: 0,
            started_at: Instant::now(),
        }
    }
}

enum Target {
    Mock { fallback: bool },
    Transport(HttpRequest),
}

pub struct Gateway {
    config: GatewayConfig,
    registry: EndpointRegistry,
    resolver: BaseUrlResolver,
    platform: Arc<dyn PlatformInfo>,
    auth: Arc<AuthTokenProvider>,
    cache: Arc<CacheStore>,
    retry: Arc<dyn RetryPolicy>,
    transport: Arc<dyn Transport>,
    mock: Arc<MockAdapter>,
    unavailable: RwLock<HashSet<ServiceId>>,
    sweeper: Option<JoinHandle<()>>,
}

impl Gateway {
    /// Gateway with default collaborators for `config`.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        GatewayBuilder::new(config).build()
    }

    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Issue one call against `endpoint_key`.
    ///
    /// The returned envelope holds the raw response payload, or the error
    /// that ended the call.
    pub async fn request(&self, endpoint_key: &str, params: Params, body: Option<Bytes>) -> ApiResponse<Bytes> {
        let span = tracing::info_span!("gateway.request", endpoint = endpoint_key);
        self.execute(endpoint_key, params, body).instrument(span).await.into()
    }

    /// `request` with the payload decoded as JSON.
    pub async fn request_json<T: DeserializeOwned>(&self, endpoint_key: &str, params: Params) -> ApiResponse<T> {
        self.request(endpoint_key, params, None)
            .await
            .into_result()
            .and_then(|payload| decode(&payload))
            .into()
    }

    /// `request` with `body` sent as JSON and the payload decoded as JSON.
    pub async fn send_json<B, T>(&self, endpoint_key: &str, params: Params, body: &B) -> ApiResponse<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = match serde_json::to_vec(body) {
            Ok(body) => Bytes::from(body),
            Err(err) => return ApiResponse::err(ApiError::validation(format!("request body: {err}"))),
        };
        self.request(endpoint_key, params, Some(body))
            .await
            .into_result()
            .and_then(|payload| decode(&payload))
            .into()
    }

    /// Exchange credentials for a token and start a fresh session.
    pub async fn login(&self, username: &str, password: &str) -> ApiResponse<()> {
        let form = match serde_urlencoded::to_string([
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
        ]) {
            Ok(form) => form,
            Err(err) => return ApiResponse::err(ApiError::validation(err.to_string())),
        };
        let outcome = self
            .request(EndpointKey::AuthToken.as_str(), Params::new(), Some(Bytes::from(form)))
            .await
            .into_result()
            .and_then(|payload| decode::<TokenResponse>(&payload));

        match outcome {
            Ok(token) => {
                self.auth.store(AuthToken::from_response(token));
                self.cache.clear();
                tracing::info!("session started");
                ApiResponse::ok(())
            }
            Err(err) => ApiResponse::err(err),
        }
    }

    /// Drop the session and every cached read made under it.
    pub fn logout(&self) {
        self.auth.invalidate();
        self.cache.clear();
        tracing::info!("session ended");
    }

    /// Drop cached reads of one resource family, for mutations the gateway
    /// did not originate. Returns the number of entries removed.
    pub fn invalidate_family(&self, family: &str) -> usize {
        let removed = self.cache.invalidate_prefix(&format!("{family}."));
        tracing::debug!(family, removed, "cache family invalidated");
        removed
    }

    /// Probe `service` and record the outcome.
    ///
    /// Services without a probe endpoint, and every service in mock mode,
    /// count as healthy.
    pub async fn check_health(&self, service: ServiceId) -> bool {
        if self.config.mode == BackendMode::Mock {
            return true;
        }
        let Some(probe) = self
            .registry
            .iter()
            .find(|endpoint| endpoint.key == EndpointKey::HealthCheck && endpoint.service == service)
        else {
            return true;
        };

        let base_url = self.resolver.resolve(service, self.config.mode, self.platform.as_ref());
        let healthy = match build_request(probe, &base_url, &Params::new(), None, None) {
            Ok(request) => matches!(
                tokio::time::timeout(probe.timeout, self.transport.send(request)).await,
                Ok(Ok(response)) if classify_status(response.status).is_none()
            ),
            Err(_) => false,
        };

        if healthy {
            self.mark_available(service);
        } else {
            self.mark_unavailable(service);
        }
        healthy
    }

    pub fn mark_unavailable(&self, service: ServiceId) {
        if self.unavailable.write().insert(service) {
            tracing::warn!(%service, "service flagged unavailable");
        }
    }

    pub fn mark_available(&self, service: ServiceId) {
        if self.unavailable.write().remove(&service) {
            tracing::info!(%service, "service available again");
        }
    }

    pub fn is_available(&self, service: ServiceId) -> bool {
        !self.unavailable.read().contains(&service)
    }

    pub fn mode(&self) -> BackendMode {
        self.config.mode
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn auth(&self) -> &AuthTokenProvider {
        &self.auth
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    async fn execute(&self, endpoint_key: &str, params: Params, body: Option<Bytes>) -> Result<Bytes, ApiError> {
        let endpoint = self.registry.lookup(endpoint_key)?;
        let mut ctx = RequestContext::new(endpoint.key, params, body);

        let cache_key = endpoint.cache_key(&ctx.params);
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key) {
                tracing::debug!(cache_key = %key, "cache hit");
                return Ok(hit);
            }
            tracing::debug!(cache_key = %key, "cache miss");
        }

        let token = if endpoint.requires_auth {
            Some(self.auth.get_valid_token().await?)
        } else {
            None
        };
        let target = self.target(endpoint, &ctx, token.as_deref())?;

        let stamp = self.cache.stamp();
        let payload = self
            .dispatch_with_retry(endpoint, &mut ctx, &target, token.as_deref())
            .await?;

        let from_fallback = matches!(target, Target::Mock { fallback: true });
        if let (Some(key), Some(policy), false) = (cache_key, endpoint.cache_policy, from_fallback) {
            if !self.cache.put_if_unchanged(key, payload.clone(), policy.ttl, stamp) {
                tracing::debug!("family invalidated during dispatch; response not cached");
            }
        }
        for family in endpoint.invalidated_families() {
            let removed = self.cache.invalidate_prefix(&format!("{family}."));
            tracing::debug!(family, removed, "cache family invalidated");
        }

        tracing::debug!(
            attempts = ctx.attempt,
            elapsed_ms = ctx.started_at.elapsed().as_millis() as u64,
            "request complete"
        );
        Ok(payload)
    }

    fn target(&self, endpoint: &EndpointConfig, ctx: &RequestContext, token: Option<&str>) -> Result<Target, ApiError> {
        if self.config.mode == BackendMode::Mock {
            return Ok(Target::Mock { fallback: false });
        }
        if !self.is_available(endpoint.service) && self.config.fallback_to_mock {
            // The mock never acknowledges a write.
            if endpoint.method.is_mutating() {
                return Err(ApiError::service_unavailable(format!(
                    "service `{}` is unavailable",
                    endpoint.service
                )));
            }
            if self.mock.can_handle(endpoint.key.as_str()) {
                tracing::debug!(service = %endpoint.service, "service unavailable; serving from mock");
                return Ok(Target::Mock { fallback: true });
            }
        }

        let base_url = self.resolver.resolve(endpoint.service, self.config.mode, self.platform.as_ref());
        let request = build_request(endpoint, &base_url, &ctx.params, ctx.body.clone(), token)?;
        tracing::debug!(method = endpoint.method.as_str(), url = %request.url, "dispatching");
        Ok(Target::Transport(request))
    }

    async fn dispatch_with_retry(
        &self,
        endpoint: &EndpointConfig,
        ctx: &mut RequestContext,
        target: &Target,
        token: Option<&str>,
    ) -> Result<Bytes, ApiError> {
        loop {
            ctx.attempt += 1;
            let outcome = match tokio::time::timeout(endpoint.timeout, self.dispatch(ctx, target)).await {
                Ok(response) => response.and_then(|response| parse_response(&response)),
                Err(_) => Err(ApiError::timeout(format!(
                    "`{}` gave no response within {}ms",
                    endpoint.key,
                    endpoint.timeout.as_millis()
                ))),
            };

            let err = match outcome {
                Ok(payload) => return Ok(payload),
                Err(err) => err,
            };

            if err.kind == ErrorKind::Unauthorized {
                // Retrying with a rejected token cannot succeed.
                if let Some(token) = token.filter(|_| endpoint.requires_auth) {
                    if self.auth.invalidate_if(token) {
                        tracing::warn!("upstream rejected the access token; invalidating session");
                    }
                }
                return Err(err);
            }

            let decision = self.retry.decide(err.kind, ctx.attempt);
            if !decision.retry {
                tracing::debug!(
                    attempt = ctx.attempt,
                    max_attempts = self.retry.max_attempts(),
                    kind = %err.kind,
                    "giving up"
                );
                return Err(err);
            }
            tracing::debug!(
                attempt = ctx.attempt,
                kind = %err.kind,
                delay_ms = decision.delay.as_millis() as u64,
                "retrying"
            );
            tokio::time::sleep(decision.delay).await;
        }
    }

    async fn dispatch(&self, ctx: &RequestContext, target: &Target) -> Result<HttpResponse, ApiError> {
        match target {
            Target::Mock { .. } => {
                self.mock
                    .respond(ctx.endpoint.as_str(), &ctx.params, ctx.body.as_deref())
                    .await
            }
            Target::Transport(request) => Ok(self.transport.send(request.clone()).await?),
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("mode", &self.config.mode)
            .field("platform", &self.platform.platform())
            .field("auth", &self.auth)
            .field("cached_entries", &self.cache.len())
            .field("unavailable", &*self.unavailable.read())
            .finish_non_exhaustive()
    }
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ApiError> {
    // Empty 2xx bodies decode as JSON null, so `()` and `Option<_>` accept them.
    let payload = if payload.is_empty() { b"null".as_slice() } else { payload };
    Ok(serde_json::from_slice(payload)?)
}

/// Refreshes tokens against the `auth.refresh` endpoint over the transport.
struct TransportRefresher {
    transport: Arc<dyn Transport>,
    endpoint: EndpointConfig,
    base_url: String,
}

#[async_trait]
impl TokenRefresher for TransportRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<AuthToken, ApiError> {
        let params: Params = [("grant_type", "refresh_token"), ("refresh_token", refresh_token)]
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        let request = build_request(&self.endpoint, &self.base_url, &params, None, None)?;
        let response = tokio::time::timeout(self.endpoint.timeout, self.transport.send(request))
            .await
            .map_err(|_| ApiError::timeout("token refresh timed out"))??;
        let payload = parse_response(&response)?;
        Ok(AuthToken::from_response(decode(&payload)?))
    }
}

/// Assembles a `Gateway`, defaulting every collaborator not supplied.
pub struct GatewayBuilder {
    config: GatewayConfig,
    registry: Option<EndpointRegistry>,
    platform: Option<Arc<dyn PlatformInfo>>,
    transport: Option<Arc<dyn Transport>>,
    retry: Option<Arc<dyn RetryPolicy>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    mock: Option<Arc<MockAdapter>>,
    cache: Option<Arc<CacheStore>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            registry: None,
            platform: None,
            transport: None,
            retry: None,
            refresher: None,
            mock: None,
            cache: None,
        }
    }

    #[must_use]
    pub fn registry(mut self, registry: EndpointRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn platform(mut self, platform: Arc<dyn PlatformInfo>) -> Self {
        self.platform = Some(platform);
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn retry_policy(mut self, retry: Arc<dyn RetryPolicy>) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    #[must_use]
    pub fn mock_adapter(mut self, mock: Arc<MockAdapter>) -> Self {
        self.mock = Some(mock);
        self
    }

    #[must_use]
    pub fn cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// # Errors
    ///
    /// An invalid config, an inconsistent endpoint table, or an HTTP client
    /// that cannot be created.
    pub fn build(self) -> Result<Gateway, GatewayError> {
        let config = self.config;
        config.validate()?;

        let registry = match self.registry {
            Some(registry) => registry,
            None => EndpointRegistry::builtin()?,
        };
        let platform = self
            .platform
            .unwrap_or_else(|| Arc::new(StaticPlatform(Platform::Web)));
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let resolver = BaseUrlResolver::new(config.hosts.clone());
        let mock = self
            .mock
            .unwrap_or_else(|| Arc::new(MockAdapter::new().with_latency(config.mock_latency())));
        let retry = self
            .retry
            .unwrap_or_else(|| Arc::new(ExponentialBackoff::from_settings(&config.retry)));

        let refresher: Arc<dyn TokenRefresher> = match self.refresher {
            Some(refresher) => refresher,
            None if config.mode == BackendMode::Mock => Arc::clone(&mock) as Arc<dyn TokenRefresher>,
            None => {
                let endpoint = registry
                    .get(EndpointKey::AuthRefresh)
                    .map_err(|_| RegistryError::Missing(EndpointKey::AuthRefresh))?;
                Arc::new(TransportRefresher {
                    transport: Arc::clone(&transport),
                    endpoint: endpoint.clone(),
                    base_url: resolver.resolve(endpoint.service, config.mode, platform.as_ref()),
                })
            }
        };
        let auth = Arc::new(AuthTokenProvider::new(refresher, config.refresh_skew()));

        let cache = self.cache.unwrap_or_default();
        let sweeper = match (config.cache_sweep_interval(), tokio::runtime::Handle::try_current()) {
            (Some(period), Ok(_)) => Some(cache.spawn_sweeper(period)),
            (Some(_), Err(_)) => {
                tracing::warn!("no tokio runtime; cache sweeper not started");
                None
            }
            (None, _) => None,
        };

        tracing::info!(mode = %config.mode, platform = ?platform.platform(), "gateway ready");
        Ok(Gateway {
            config,
            registry,
            resolver,
            platform,
            auth,
            cache,
            retry,
            transport,
            mock,
            unavailable: RwLock::new(HashSet::new()),
            sweeper,
        })
    }
}
