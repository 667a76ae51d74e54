//! Gateway behaviour against scripted transports.
//!
//! # Design
//! Each test builds a local-mode gateway around a `ScriptedTransport` that
//! records every request and answers from a closure, plus `NoDelay` retries,
//! so attempt counts and cache effects are asserted without a network or
//! real backoff time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gateway_core::{
    ApiError, AuthToken, BackendMode, EndpointKey, ErrorKind, Gateway, GatewayConfig, HttpMethod, HttpRequest,
    HttpResponse, NoDelay, Params, Platform, ServiceId, StaticPlatform, TokenRefresher, Transport, TransportError,
};
use gateway_core::types::{GlucoseReading, UserProfile};
use parking_lot::Mutex;
use serde_json::json;

type Responder = Box<dyn Fn(&HttpRequest, usize) -> Result<HttpResponse, TransportError> + Send + Sync>;
type Delay = Box<dyn Fn(&HttpRequest) -> Duration + Send + Sync>;

/// Records requests; answers with `responder(request, call_index)`.
///
/// The answer is computed when the request arrives and delivered after
/// `delay(request)`.
struct ScriptedTransport {
    requests: Mutex<Vec<HttpRequest>>,
    responder: Responder,
    delay: Delay,
}

impl ScriptedTransport {
    fn new(
        responder: impl Fn(&HttpRequest, usize) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::delayed(|_| Duration::ZERO, responder)
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Self::delayed(move |_| delay, |_, _| Ok(HttpResponse::new(200, "[]")))
    }

    fn delayed(
        delay: impl Fn(&HttpRequest) -> Duration + Send + Sync + 'static,
        responder: impl Fn(&HttpRequest, usize) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            delay: Box::new(delay),
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let index = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len() - 1
        };
        let response = (self.responder)(&request, index);
        let delay = (self.delay)(&request);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        response
    }
}

/// Counts refreshes and hands out `fresh-N` tokens.
#[derive(Default)]
struct CountingRefresher {
    calls: AtomicUsize,
    reject: bool,
}

#[async_trait]
impl TokenRefresher for CountingRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<AuthToken, ApiError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.reject {
            return Err(ApiError::unauthorized("invalid refresh token").with_status(401));
        }
        Ok(AuthToken::new(format!("fresh-{n}"), Some(format!("r{n}")), Duration::from_secs(3600)))
    }
}

fn local_gateway(transport: Arc<ScriptedTransport>, max_attempts: u32) -> Gateway {
    Gateway::builder(GatewayConfig::for_mode(BackendMode::Local))
        .transport(transport)
        .retry_policy(Arc::new(NoDelay::new(max_attempts)))
        .build()
        .unwrap()
}

fn fallback_gateway(transport: Arc<ScriptedTransport>) -> Gateway {
    let mut config = GatewayConfig::for_mode(BackendMode::Local);
    config.fallback_to_mock = true;
    Gateway::builder(config)
        .transport(transport)
        .retry_policy(Arc::new(NoDelay::new(3)))
        .build()
        .unwrap()
}

fn signed_in(gateway: Gateway) -> Gateway {
    gateway
        .auth()
        .store(AuthToken::new("tok", Some("r0".into()), Duration::from_secs(3600)));
    gateway
}

fn params(pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn path_of(request: &HttpRequest) -> &str {
    let path = request.url.trim_start_matches("http://localhost:8004");
    path.split('?').next().unwrap_or(path)
}

// --- cache ---

#[tokio::test(start_paused = true)]
async fn cache_hit_within_ttl_skips_dispatch() {
    let transport = ScriptedTransport::new(|_, _| Ok(HttpResponse::new(200, r#"[{"id":1,"value":120.0,"date":"d"}]"#)));
    let gateway = signed_in(local_gateway(transport.clone(), 3));
    let query = params(&[("userId", "u1"), ("offset", "0")]);

    let first = gateway.request("readings.list", query.clone(), None).await.into_result().unwrap();
    tokio::time::advance(Duration::from_secs(10)).await;
    let second = gateway.request("readings.list", query, None).await.into_result().unwrap();

    assert_eq!(first, second);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn cache_entry_expires_after_ttl() {
    let transport = ScriptedTransport::new(|_, _| Ok(HttpResponse::new(200, "[]")));
    let gateway = signed_in(local_gateway(transport.clone(), 3));

    gateway.request("readings.list", Params::new(), None).await.into_result().unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    gateway.request("readings.list", Params::new(), None).await.into_result().unwrap();

    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn differing_params_never_share_an_entry() {
    let transport = ScriptedTransport::new(|request, _| Ok(HttpResponse::new(200, request.url.clone())));
    let gateway = signed_in(local_gateway(transport.clone(), 3));

    let a = gateway
        .request("readings.list", params(&[("userId", "u1"), ("offset", "0")]), None)
        .await
        .into_result()
        .unwrap();
    let b = gateway
        .request("readings.list", params(&[("userId", "u1"), ("offset", "50")]), None)
        .await
        .into_result()
        .unwrap();

    assert_ne!(a, b);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn created_reading_invalidates_list_and_profile() {
    let transport = ScriptedTransport::new(|request, index| {
        Ok(match (request.method, path_of(request)) {
            (HttpMethod::Get, "/glucose/mine") if index == 0 => HttpResponse::new(200, "[]"),
            (HttpMethod::Get, "/glucose/mine") => {
                HttpResponse::new(200, r#"[{"id":7,"value":131.0,"date":"2025-11-30T10:00:00"}]"#)
            }
            (HttpMethod::Get, "/users/me") => HttpResponse::json(
                200,
                &json!({"user_id":1,"dni":"1000","name":"A","surname":"B","email":"e","times_measured":index}),
            ),
            (HttpMethod::Post, "/glucose/create") => {
                HttpResponse::new(201, r#"{"id":7,"value":131.0,"date":"2025-11-30T10:00:00"}"#)
            }
            _ => HttpResponse::new(404, ""),
        })
    });
    let gateway = signed_in(local_gateway(transport.clone(), 3));
    let query = params(&[("userId", "u1")]);

    let before: Vec<GlucoseReading> = gateway.request_json("readings.list", query.clone()).await.into_result().unwrap();
    assert!(before.is_empty());
    let profile_before: UserProfile = gateway.request_json("users.me", Params::new()).await.into_result().unwrap();

    let created: GlucoseReading = gateway
        .send_json("readings.create", query.clone(), &json!({"value":131.0,"date":"2025-11-30T10:00:00"}))
        .await
        .into_result()
        .unwrap();

    let after: Vec<GlucoseReading> = gateway.request_json("readings.list", query).await.into_result().unwrap();
    assert_eq!(after, vec![created]);
    let profile_after: UserProfile = gateway.request_json("users.me", Params::new()).await.into_result().unwrap();
    assert_ne!(profile_after.times_measured, profile_before.times_measured);
    assert_eq!(transport.calls(), 5);
}

#[tokio::test]
async fn invalidate_family_hook_drops_only_that_family() {
    let transport = ScriptedTransport::new(|_, _| Ok(HttpResponse::new(200, "[]")));
    let gateway = signed_in(local_gateway(transport.clone(), 3));

    gateway.request("appointments.list", Params::new(), None).await.into_result().unwrap();
    gateway.request("readings.list", Params::new(), None).await.into_result().unwrap();
    assert_eq!(gateway.invalidate_family("appointments"), 1);

    gateway.request("appointments.list", Params::new(), None).await.into_result().unwrap();
    gateway.request("readings.list", Params::new(), None).await.into_result().unwrap();
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn read_in_flight_during_mutation_is_not_cached() {
    let creates = Arc::new(AtomicUsize::new(0));
    let counter = creates.clone();
    let transport = ScriptedTransport::delayed(
        |request| match request.method {
            HttpMethod::Get => Duration::from_millis(50),
            _ => Duration::from_millis(10),
        },
        move |request, _| {
            Ok(match request.method {
                HttpMethod::Get => HttpResponse::new(200, format!("creates={}", counter.load(Ordering::SeqCst))),
                _ => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    HttpResponse::new(201, "{}")
                }
            })
        },
    );
    let gateway = signed_in(local_gateway(transport.clone(), 1));

    let (before, created) = tokio::join!(gateway.request("readings.list", Params::new(), None), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        gateway
            .request("readings.create", Params::new(), Some(Bytes::from_static(b"{}")))
            .await
    });
    assert_eq!(&before.into_result().unwrap()[..], b"creates=0");
    assert!(created.is_success());
    assert_eq!(creates.load(Ordering::SeqCst), 1);

    let after = gateway.request("readings.list", Params::new(), None).await.into_result().unwrap();
    assert_eq!(&after[..], b"creates=1");
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn failed_mutation_keeps_cached_reads() {
    let transport = ScriptedTransport::new(|request, _| {
        Ok(match request.method {
            HttpMethod::Get => HttpResponse::new(200, "[]"),
            _ => HttpResponse::new(422, r#"{"detail":"value must be positive"}"#),
        })
    });
    let gateway = signed_in(local_gateway(transport.clone(), 3));

    gateway.request("readings.list", Params::new(), None).await.into_result().unwrap();
    let err = gateway
        .request("readings.create", Params::new(), Some(Bytes::from_static(br#"{"value":-1}"#)))
        .await
        .into_result()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ValidationError);
    assert_eq!(err.message, "value must be positive");

    gateway.request("readings.list", Params::new(), None).await.into_result().unwrap();
    assert_eq!(transport.calls(), 2);
}

// --- classification and retry ---

#[tokio::test]
async fn unauthorized_invalidates_token_without_retry() {
    let transport =
        ScriptedTransport::new(|_, _| Ok(HttpResponse::new(401, r#"{"detail":"Could not validate credentials"}"#)));
    let gateway = signed_in(local_gateway(transport.clone(), 3));

    let err = gateway.request("users.me", Params::new(), None).await.into_result().unwrap_err();

    assert_eq!(err.kind, ErrorKind::Unauthorized);
    assert!(!err.retryable);
    assert_eq!(err.http_status, Some(401));
    assert_eq!(transport.calls(), 1);
    assert!(!gateway.auth().is_authenticated());
}

#[tokio::test]
async fn always_unavailable_uses_exactly_the_attempt_budget() {
    let transport = ScriptedTransport::new(|_, _| Ok(HttpResponse::new(503, "")));
    let gateway = signed_in(local_gateway(transport.clone(), 3));

    let err = gateway.request("appointments.state", Params::new(), None).await.into_result().unwrap_err();

    assert_eq!(err.kind, ErrorKind::ServiceUnavailable);
    assert!(err.retryable);
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn transient_failure_then_success() {
    let transport = ScriptedTransport::new(|_, index| match index {
        0 => Err(TransportError::Network("connection reset".into())),
        1 => Ok(HttpResponse::new(429, "")),
        _ => Ok(HttpResponse::new(200, r#"{"state":"NONE"}"#)),
    });
    let gateway = signed_in(local_gateway(transport.clone(), 3));

    let payload = gateway.request("appointments.state", Params::new(), None).await.into_result().unwrap();

    assert_eq!(payload, Bytes::from_static(br#"{"state":"NONE"}"#));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn network_errors_surface_after_budget() {
    let transport = ScriptedTransport::new(|_, _| Err(TransportError::Network("connection refused".into())));
    let gateway = local_gateway(transport.clone(), 2);

    let err = gateway.request("health.check", Params::new(), None).await.into_result().unwrap_err();

    assert_eq!(err.kind, ErrorKind::NetworkError);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn validation_error_is_not_retried() {
    let transport = ScriptedTransport::new(|_, _| Ok(HttpResponse::new(404, r#"{"detail":"Appointment not found"}"#)));
    let gateway = signed_in(local_gateway(transport.clone(), 3));

    let err = gateway
        .request("appointments.resolution", params(&[("id", "99")]), None)
        .await
        .into_result()
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::ValidationError);
    assert_eq!(err.message, "Appointment not found");
    assert_eq!(transport.calls(), 1);
    assert_eq!(transport.requests()[0].url, "http://localhost:8004/appointments/99/resolution");
}

#[tokio::test(start_paused = true)]
async fn slow_dispatch_times_out_per_attempt() {
    let transport = ScriptedTransport::slow(Duration::from_secs(60));
    let gateway = signed_in(local_gateway(transport.clone(), 2));

    let err = gateway.request("readings.list", Params::new(), None).await.into_result().unwrap_err();

    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(err.retryable);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn missing_path_param_fails_before_dispatch() {
    let transport = ScriptedTransport::new(|_, _| Ok(HttpResponse::new(200, "{}")));
    let gateway = signed_in(local_gateway(transport.clone(), 3));

    let err = gateway
        .request("appointments.resolution", Params::new(), None)
        .await
        .into_result()
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::ValidationError);
    assert_eq!(transport.calls(), 0);
}

// --- auth ---

#[tokio::test]
async fn bearer_token_and_platform_base_url_are_applied() {
    let transport = ScriptedTransport::new(|_, _| Ok(HttpResponse::new(200, "{}")));
    let gateway = Gateway::builder(GatewayConfig::for_mode(BackendMode::Local))
        .transport(transport.clone())
        .platform(Arc::new(StaticPlatform(Platform::AndroidEmulator)))
        .retry_policy(Arc::new(NoDelay::new(1)))
        .build()
        .unwrap();
    let gateway = signed_in(gateway);

    gateway.request("users.me", Params::new(), None).await.into_result().unwrap();
    gateway.request("health.check", Params::new(), None).await.into_result().unwrap();

    let requests = transport.requests();
    assert_eq!(requests[0].url, "http://10.0.2.2:8004/users/me");
    assert_eq!(requests[0].header("authorization"), Some("Bearer tok"));
    assert_eq!(requests[1].url, "http://10.0.2.2:8004/health");
    assert_eq!(requests[1].header("authorization"), None);
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh() {
    let transport = ScriptedTransport::new(|_, _| Ok(HttpResponse::new(200, "[]")));
    let refresher = Arc::new(CountingRefresher::default());
    let gateway = Gateway::builder(GatewayConfig::for_mode(BackendMode::Local))
        .transport(transport.clone())
        .token_refresher(refresher.clone())
        .retry_policy(Arc::new(NoDelay::new(1)))
        .build()
        .unwrap();
    // Inside the 300s refresh window.
    gateway
        .auth()
        .store(AuthToken::new("stale", Some("r0".into()), Duration::from_secs(60)));

    let calls = (0..8).map(|offset| {
        gateway.request("readings.list", params(&[("offset", &offset.to_string())]), None)
    });
    let responses = futures::future::join_all(calls).await;

    assert!(responses.iter().all(|response| response.is_success()));
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    assert!(transport
        .requests()
        .iter()
        .all(|request| request.header("authorization") == Some("Bearer fresh-1")));
}

#[tokio::test(start_paused = true)]
async fn late_rejection_of_a_replaced_token_keeps_the_session() {
    let transport = ScriptedTransport::delayed(
        |request| match request.header("authorization") {
            Some("Bearer old") => Duration::from_secs(2),
            _ => Duration::ZERO,
        },
        |request, _| {
            Ok(match request.header("authorization") {
                Some("Bearer old") => HttpResponse::new(401, r#"{"detail":"Could not validate credentials"}"#),
                _ => HttpResponse::new(200, "[]"),
            })
        },
    );
    let refresher = Arc::new(CountingRefresher::default());
    let gateway = Gateway::builder(GatewayConfig::for_mode(BackendMode::Local))
        .transport(transport.clone())
        .token_refresher(refresher.clone())
        .retry_policy(Arc::new(NoDelay::new(1)))
        .build()
        .unwrap();
    // Leaves the 300s refresh window one second from now.
    gateway
        .auth()
        .store(AuthToken::new("old", Some("r0".into()), Duration::from_secs(301)));

    let (rejected, sibling) = tokio::join!(gateway.request("users.me", Params::new(), None), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        gateway.request("readings.list", Params::new(), None).await
    });

    assert_eq!(rejected.into_result().unwrap_err().kind, ErrorKind::Unauthorized);
    assert!(sibling.is_success());
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    assert!(gateway.auth().is_authenticated());
    assert_eq!(gateway.auth().get_valid_token().await.unwrap(), "fresh-1");
}

#[tokio::test]
async fn rejected_refresh_fails_every_waiter() {
    let transport = ScriptedTransport::new(|_, _| Ok(HttpResponse::new(200, "[]")));
    let refresher = Arc::new(CountingRefresher {
        reject: true,
        ..CountingRefresher::default()
    });
    let gateway = Gateway::builder(GatewayConfig::for_mode(BackendMode::Local))
        .transport(transport.clone())
        .token_refresher(refresher.clone())
        .build()
        .unwrap();
    gateway
        .auth()
        .store(AuthToken::new("stale", Some("r0".into()), Duration::from_secs(60)));

    let (a, b) = tokio::join!(
        gateway.request("appointments.list", Params::new(), None),
        gateway.request("readings.list", Params::new(), None),
    );

    assert_eq!(a.error().map(|e| e.kind), Some(ErrorKind::Unauthorized));
    assert_eq!(b.error().map(|e| e.kind), Some(ErrorKind::Unauthorized));
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.calls(), 0);
    assert!(!gateway.auth().is_authenticated());
}

#[tokio::test]
async fn default_refresher_posts_refresh_grant() {
    let transport = ScriptedTransport::new(|request, _| {
        Ok(match path_of(request) {
            "/token" => HttpResponse::json(
                200,
                &json!({"access_token":"rotated","token_type":"bearer","expires_in":3600,"refresh_token":"r1"}),
            ),
            _ => HttpResponse::new(200, "[]"),
        })
    });
    let gateway = local_gateway(transport.clone(), 1);
    gateway
        .auth()
        .store(AuthToken::new("stale", Some("r0".into()), Duration::from_secs(60)));

    gateway.request("appointments.list", Params::new(), None).await.into_result().unwrap();

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, HttpMethod::Post);
    assert_eq!(requests[0].header("content-type"), Some("application/x-www-form-urlencoded"));
    assert_eq!(
        requests[0].body.as_deref(),
        Some(b"grant_type=refresh_token&refresh_token=r0".as_slice())
    );
    assert_eq!(requests[1].header("authorization"), Some("Bearer rotated"));
}

#[tokio::test]
async fn login_stores_token_and_clears_cache() {
    let transport = ScriptedTransport::new(|request, _| {
        Ok(match path_of(request) {
            "/token" => HttpResponse::json(200, &json!({"access_token":"issued","refresh_token":"r1"})),
            _ => HttpResponse::new(200, "[]"),
        })
    });
    let gateway = signed_in(local_gateway(transport.clone(), 1));
    gateway.request("readings.list", Params::new(), None).await.into_result().unwrap();
    assert_eq!(gateway.cache().len(), 1);

    gateway.login("1000", "secret").await.into_result().unwrap();

    assert!(gateway.cache().is_empty());
    let token_request = &transport.requests()[1];
    assert_eq!(token_request.header("authorization"), None);
    assert_eq!(
        token_request.body.as_deref(),
        Some(b"grant_type=password&username=1000&password=secret".as_slice())
    );
    gateway.request("readings.list", Params::new(), None).await.into_result().unwrap();
    assert_eq!(transport.requests()[2].header("authorization"), Some("Bearer issued"));
}

#[tokio::test]
async fn failed_login_is_unauthorized_and_leaves_no_session() {
    let transport =
        ScriptedTransport::new(|_, _| Ok(HttpResponse::new(401, r#"{"detail":"Incorrect username or password"}"#)));
    let gateway = local_gateway(transport.clone(), 3);

    let err = gateway.login("1000", "wrong").await.into_result().unwrap_err();

    assert_eq!(err.kind, ErrorKind::Unauthorized);
    assert_eq!(err.message, "Incorrect username or password");
    assert_eq!(transport.calls(), 1);
    assert!(!gateway.auth().is_authenticated());
}

#[tokio::test]
async fn logout_drops_session_and_cache() {
    let transport = ScriptedTransport::new(|_, _| Ok(HttpResponse::new(200, "[]")));
    let gateway = signed_in(local_gateway(transport.clone(), 1));
    gateway.request("readings.list", Params::new(), None).await.into_result().unwrap();

    gateway.logout();

    assert!(gateway.cache().is_empty());
    let err = gateway.request("readings.list", Params::new(), None).await.into_result().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unauthorized);
    assert_eq!(transport.calls(), 1);
}

// --- mock mode and fallback ---

#[tokio::test]
async fn mock_mode_session_never_touches_transport() {
    let transport = ScriptedTransport::new(|_, _| Ok(HttpResponse::new(500, "")));
    let gateway = Gateway::builder(GatewayConfig::for_mode(BackendMode::Mock))
        .transport(transport.clone())
        .build()
        .unwrap();

    gateway.login("demo", "demo").await.into_result().unwrap();
    let created: GlucoseReading = gateway
        .send_json("readings.create", Params::new(), &json!({"value": 98.0, "date": "2025-11-30T08:00:00"}))
        .await
        .into_result()
        .unwrap();
    let listed: Vec<GlucoseReading> = gateway.request_json("readings.list", Params::new()).await.into_result().unwrap();
    assert_eq!(listed, vec![created]);

    let err = gateway
        .request("tidepool.data", params(&[("userId", "u1")]), None)
        .await
        .into_result()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownEndpoint);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn unhealthy_service_falls_back_to_mock() {
    let healthy = Arc::new(AtomicUsize::new(0));
    let flag = healthy.clone();
    let transport = ScriptedTransport::new(move |request, _| {
        Ok(match path_of(request) {
            "/health" if flag.load(Ordering::SeqCst) == 0 => HttpResponse::new(503, ""),
            "/health" => HttpResponse::new(200, r#"{"status":"ok"}"#),
            _ => HttpResponse::new(200, r#"{"state":"ACCEPTED"}"#),
        })
    });
    let gateway = signed_in(fallback_gateway(transport.clone()));

    assert!(!gateway.check_health(ServiceId::ApiGateway).await);
    assert!(!gateway.is_available(ServiceId::ApiGateway));

    let payload = gateway.request("appointments.state", Params::new(), None).await.into_result().unwrap();
    assert_eq!(payload, Bytes::from_static(br#"{"state":"NONE"}"#));
    assert_eq!(transport.calls(), 1, "only the health probe reached the transport");
    assert!(gateway.cache().is_empty(), "fallback responses are not cached");

    healthy.store(1, Ordering::SeqCst);
    assert!(gateway.check_health(ServiceId::ApiGateway).await);
    let payload = gateway.request("appointments.state", Params::new(), None).await.into_result().unwrap();
    assert_eq!(payload, Bytes::from_static(br#"{"state":"ACCEPTED"}"#));
}

#[tokio::test]
async fn writes_to_unavailable_service_are_not_answered_by_mock() {
    let transport = ScriptedTransport::new(|_, _| Ok(HttpResponse::new(201, "{}")));
    let gateway = signed_in(fallback_gateway(transport.clone()));
    gateway.mark_unavailable(ServiceId::ApiGateway);

    let err = gateway
        .send_json::<_, GlucoseReading>(
            "readings.create",
            Params::new(),
            &json!({"value": 98.0, "date": "2025-11-30T08:00:00"}),
        )
        .await
        .into_result()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ServiceUnavailable);
    assert_eq!(transport.calls(), 0);

    // Reads still come from the mock, which never saw the write.
    let listed: Vec<GlucoseReading> = gateway.request_json("readings.list", Params::new()).await.into_result().unwrap();
    assert!(listed.is_empty());
    assert_eq!(transport.calls(), 0);
}

#[test]
fn fallback_to_mock_is_off_by_default() {
    assert!(!GatewayConfig::default().fallback_to_mock);
    assert!(!GatewayConfig::for_mode(BackendMode::Cloud).fallback_to_mock);
}

#[tokio::test]
async fn unavailable_service_without_fallback_uses_transport() {
    let transport = ScriptedTransport::new(|_, _| Ok(HttpResponse::new(200, "{}")));
    let mut config = GatewayConfig::for_mode(BackendMode::Local);
    config.fallback_to_mock = false;
    let gateway = Gateway::builder(config)
        .transport(transport.clone())
        .retry_policy(Arc::new(NoDelay::new(1)))
        .build()
        .unwrap();
    let gateway = signed_in(gateway);
    gateway.mark_unavailable(ServiceId::ApiGateway);

    gateway.request("users.me", Params::new(), None).await.into_result().unwrap();
    assert_eq!(transport.calls(), 1);
}

#[test]
fn every_builtin_key_resolves() {
    let gateway = Gateway::new(GatewayConfig::for_mode(BackendMode::Mock)).unwrap();
    for key in EndpointKey::ALL {
        assert_eq!(gateway.registry().lookup(key.as_str()).unwrap().key, key);
    }
}
