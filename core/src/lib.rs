//! Request orchestration core for the health app's backend calls.
//!
//! # Overview
//! Every backend call goes through `Gateway::request(endpoint_key, params,
//! body)`. The gateway resolves the key against a closed endpoint table,
//! serves cached reads, injects bearer tokens (refreshing them single-flight),
//! picks a base URL for the backend mode and client platform, and dispatches
//! to either the in-process mock adapter or an HTTP transport, retrying
//! transient failures with bounded backoff.
//!
//! # Design
//! - HTTP is reached only through the `Transport` trait; requests and
//!   responses are plain data (`HttpRequest` / `HttpResponse`), so request
//!   building and status classification are tested without a network.
//! - The backend mode is part of `GatewayConfig`, passed in at construction;
//!   nothing here is a process-wide global.
//! - Shared mutable state is limited to the cache, the token provider and the
//!   service-availability set, each behind a lock never held across `.await`.
//! - DTOs are defined independently from the mock-server crate; integration
//!   tests catch schema drift.

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod gateway;
pub mod http;
pub mod mock;
pub mod platform;
pub mod response;
pub mod retry;
pub mod types;

pub use auth::{AuthToken, AuthTokenProvider, TokenRefresher};
pub use cache::CacheStore;
pub use config::{ConfigError, GatewayConfig};
pub use endpoints::{EndpointConfig, EndpointKey, EndpointRegistry, Params, ServiceId};
pub use error::{ApiError, ErrorKind};
pub use gateway::{Gateway, GatewayBuilder, GatewayError, RequestContext};
pub use http::{HttpMethod, HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};
pub use mock::MockAdapter;
pub use platform::{BackendMode, Platform, PlatformInfo, StaticPlatform};
pub use response::ApiResponse;
pub use retry::{ExponentialBackoff, NoDelay, RetryPolicy};
