//! Endpoint registry: the single routing table for every backend call.
//!
//! # Design
//! Endpoint keys are a closed enum, so a typo in feature code fails when the
//! string is parsed rather than producing a silent fallthrough. The table is
//! validated when the registry is built: every key has exactly one row, path
//! templates are well-formed, and mutating endpoints carry no cache policy.
//! Adding a backend call means adding one variant and one row.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::http::HttpMethod;

/// Call parameters. A sorted map, so iteration order never depends on how the
/// caller inserted them.
pub type Params = BTreeMap<String, String>;

/// Characters left unescaped in path segments and cache fingerprints.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const AUTH_TIMEOUT: Duration = Duration::from_secs(20);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend service an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceId {
    /// Public API gateway in front of the login, glucose and appointment services.
    ApiGateway,
    /// External Tidepool data platform.
    Tidepool,
}

impl ServiceId {
    pub const ALL: [ServiceId; 2] = [ServiceId::ApiGateway, ServiceId::Tidepool];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceId::ApiGateway => "api_gateway",
            ServiceId::Tidepool => "tidepool",
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical identifier of one backend operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointKey {
    AuthToken,
    AuthRefresh,
    UsersMe,
    UsersUpdate,
    ReadingsList,
    ReadingsLatest,
    ReadingsCreate,
    AppointmentsList,
    AppointmentsState,
    AppointmentsPlacement,
    AppointmentsCreate,
    AppointmentsSubmit,
    AppointmentsResolution,
    HealthCheck,
    TidepoolData,
}

impl EndpointKey {
    pub const ALL: [EndpointKey; 15] = [
        EndpointKey::AuthToken,
        EndpointKey::AuthRefresh,
        EndpointKey::UsersMe,
        EndpointKey::UsersUpdate,
        EndpointKey::ReadingsList,
        EndpointKey::ReadingsLatest,
        EndpointKey::ReadingsCreate,
        EndpointKey::AppointmentsList,
        EndpointKey::AppointmentsState,
        EndpointKey::AppointmentsPlacement,
        EndpointKey::AppointmentsCreate,
        EndpointKey::AppointmentsSubmit,
        EndpointKey::AppointmentsResolution,
        EndpointKey::HealthCheck,
        EndpointKey::TidepoolData,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EndpointKey::AuthToken => "auth.token",
            EndpointKey::AuthRefresh => "auth.refresh",
            EndpointKey::UsersMe => "users.me",
            EndpointKey::UsersUpdate => "users.update",
            EndpointKey::ReadingsList => "readings.list",
            EndpointKey::ReadingsLatest => "readings.latest",
            EndpointKey::ReadingsCreate => "readings.create",
            EndpointKey::AppointmentsList => "appointments.list",
            EndpointKey::AppointmentsState => "appointments.state",
            EndpointKey::AppointmentsPlacement => "appointments.placement",
            EndpointKey::AppointmentsCreate => "appointments.create",
            EndpointKey::AppointmentsSubmit => "appointments.submit",
            EndpointKey::AppointmentsResolution => "appointments.resolution",
            EndpointKey::HealthCheck => "health.check",
            EndpointKey::TidepoolData => "tidepool.data",
        }
    }

    /// Resource family: the key segment before the first `.`.
    pub fn family(self) -> &'static str {
        let key = self.as_str();
        key.split_once('.').map_or(key, |(family, _)| family)
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointKey {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EndpointKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| ApiError::unknown_endpoint(s))
    }
}

/// How a request body is encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    Json,
    /// `application/x-www-form-urlencoded`, used by the token endpoint.
    Form,
}

impl BodyEncoding {
    pub fn content_type(self) -> &'static str {
        match self {
            BodyEncoding::Json => "application/json",
            BodyEncoding::Form => "application/x-www-form-urlencoded",
        }
    }
}

/// Per-endpoint caching rule.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub ttl: Duration,
    /// Derives the parameter fingerprint half of the cache key.
    pub key_fn: fn(&Params) -> String,
}

impl CachePolicy {
    /// Cache for `ttl`, fingerprinting every parameter.
    pub const fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            key_fn: canonical_params,
        }
    }

    pub const fn with_key_fn(mut self, key_fn: fn(&Params) -> String) -> Self {
        self.key_fn = key_fn;
        self
    }
}

/// Canonical `k=v&k=v` encoding of all parameters.
///
/// Keys come out sorted and both halves are percent-encoded, so distinct maps
/// always produce distinct strings.
pub fn canonical_params(params: &Params) -> String {
    params
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                utf8_percent_encode(key, UNRESERVED),
                utf8_percent_encode(value, UNRESERVED)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Immutable routing row for one endpoint key.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub key: EndpointKey,
    pub service: ServiceId,
    /// Path with `{name}` placeholders filled from call parameters.
    pub path_template: &'static str,
    pub method: HttpMethod,
    pub requires_auth: bool,
    pub timeout: Duration,
    pub cache_policy: Option<CachePolicy>,
    pub encoding: BodyEncoding,
    /// Extra resource families invalidated after a successful mutation, on
    /// top of the endpoint's own family.
    pub invalidates: &'static [&'static str],
}

impl EndpointConfig {
    fn row(
        key: EndpointKey,
        method: HttpMethod,
        path_template: &'static str,
        requires_auth: bool,
    ) -> Self {
        Self {
            key,
            service: ServiceId::ApiGateway,
            path_template,
            method,
            requires_auth,
            timeout: DEFAULT_TIMEOUT,
            cache_policy: None,
            encoding: BodyEncoding::Json,
            invalidates: &[],
        }
    }

    fn cached(mut self, ttl: Duration) -> Self {
        self.cache_policy = Some(CachePolicy::new(ttl));
        self
    }

    fn form(mut self) -> Self {
        self.encoding = BodyEncoding::Form;
        self
    }

    fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn service(mut self, service: ServiceId) -> Self {
        self.service = service;
        self
    }

    fn also_invalidates(mut self, families: &'static [&'static str]) -> Self {
        self.invalidates = families;
        self
    }

    /// Cache key for this call, or `None` if the endpoint is not cacheable.
    pub fn cache_key(&self, params: &Params) -> Option<String> {
        self.cache_policy
            .map(|policy| format!("{}|{}", self.key.as_str(), (policy.key_fn)(params)))
    }

    /// Families whose cache entries a successful call must drop.
    pub fn invalidated_families(&self) -> Vec<&'static str> {
        if !self.method.is_mutating() {
            return Vec::new();
        }
        let mut families = vec![self.key.family()];
        families.extend(self.invalidates.iter().copied().filter(|f| *f != self.key.family()));
        families
    }

    /// Substitute path placeholders from `params`.
    ///
    /// Returns the rendered path and the parameters the template did not
    /// consume.
    ///
    /// # Errors
    ///
    /// Returns a `VALIDATION_ERROR` when a placeholder has no value.
    pub fn render_path(&self, params: &Params) -> Result<(String, Params), ApiError> {
        let mut rendered = String::with_capacity(self.path_template.len());
        let mut leftover = params.clone();
        let mut rest = self.path_template;

        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                ApiError::validation(format!("malformed path template for `{}`", self.key))
            })?;
            let name = &after[..close];
            let value = params.get(name).ok_or_else(|| {
                ApiError::validation(format!(
                    "missing path parameter `{name}` for `{}`",
                    self.key
                ))
            })?;
            rendered.push_str(&utf8_percent_encode(value, UNRESERVED).to_string());
            leftover.remove(name);
            rest = &after[close + 1..];
        }
        rendered.push_str(rest);

        Ok((rendered, leftover))
    }
}

/// Extract `{name}` placeholders, or `None` if the template is malformed.
fn placeholders(template: &str) -> Option<Vec<&str>> {
    let mut names = Vec::new();
    let mut rest = template;
    loop {
        let open = rest.find('{');
        let close = rest.find('}');
        match (open, close) {
            (None, None) => return Some(names),
            (Some(open), Some(close)) if open < close => {
                let name = &rest[open + 1..close];
                if name.is_empty() || name.contains('{') {
                    return None;
                }
                names.push(name);
                rest = &rest[close + 1..];
            }
            _ => return None,
        }
    }
}

/// The built-in routing table.
pub fn builtin_table() -> Vec<EndpointConfig> {
    use EndpointKey as K;
    use HttpMethod::*;

    vec![
        EndpointConfig::row(K::AuthToken, Post, "/token", false)
            .form()
            .timeout(AUTH_TIMEOUT),
        EndpointConfig::row(K::AuthRefresh, Post, "/token", false)
            .form()
            .timeout(AUTH_TIMEOUT),
        EndpointConfig::row(K::UsersMe, Get, "/users/me", true).cached(Duration::from_secs(300)),
        EndpointConfig::row(K::UsersUpdate, Patch, "/users/me", true),
        EndpointConfig::row(K::ReadingsList, Get, "/glucose/mine", true).cached(Duration::from_secs(60)),
        EndpointConfig::row(K::ReadingsLatest, Get, "/glucose/mine/latest", true)
            .cached(Duration::from_secs(60)),
        // Creating a reading moves the streak counters on the profile.
        EndpointConfig::row(K::ReadingsCreate, Post, "/glucose/create", true).also_invalidates(&["users"]),
        EndpointConfig::row(K::AppointmentsList, Get, "/appointments/mine", true)
            .cached(Duration::from_secs(60)),
        EndpointConfig::row(K::AppointmentsState, Get, "/appointments/state", true)
            .cached(Duration::from_secs(30)),
        EndpointConfig::row(K::AppointmentsPlacement, Get, "/appointments/placement", true)
            .cached(Duration::from_secs(30)),
        EndpointConfig::row(K::AppointmentsCreate, Post, "/appointments/create", true),
        EndpointConfig::row(K::AppointmentsSubmit, Post, "/appointments/submit", true),
        EndpointConfig::row(K::AppointmentsResolution, Get, "/appointments/{id}/resolution", true)
            .cached(Duration::from_secs(60)),
        EndpointConfig::row(K::HealthCheck, Get, "/health", false).timeout(HEALTH_TIMEOUT),
        EndpointConfig::row(K::TidepoolData, Get, "/data/{userId}", false)
            .service(ServiceId::Tidepool)
            .cached(Duration::from_secs(300)),
    ]
}

/// Errors detected while validating a routing table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("endpoint `{0}` has no registry row")]
    Missing(EndpointKey),

    #[error("endpoint `{0}` has more than one registry row")]
    Duplicate(EndpointKey),

    #[error("endpoint `{key}` has malformed path template `{template}`")]
    MalformedTemplate {
        key: EndpointKey,
        template: &'static str,
    },

    #[error("endpoint `{0}` is mutating but declares a cache policy")]
    CachedMutation(EndpointKey),
}

/// Validated lookup table from endpoint key to configuration.
#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    entries: BTreeMap<EndpointKey, EndpointConfig>,
}

impl EndpointRegistry {
    /// Registry over the built-in table.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found in the table.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_table(builtin_table())
    }

    /// Validate and index a routing table.
    ///
    /// # Errors
    ///
    /// Fails on duplicate or missing keys, malformed templates, or a cache
    /// policy on a mutating endpoint.
    pub fn from_table(table: Vec<EndpointConfig>) -> Result<Self, RegistryError> {
        let mut entries = BTreeMap::new();
        for config in table {
            if !config.path_template.starts_with('/') || placeholders(config.path_template).is_none() {
                return Err(RegistryError::MalformedTemplate {
                    key: config.key,
                    template: config.path_template,
                });
            }
            if config.method.is_mutating() && config.cache_policy.is_some() {
                return Err(RegistryError::CachedMutation(config.key));
            }
            let key = config.key;
            if entries.insert(key, config).is_some() {
                return Err(RegistryError::Duplicate(key));
            }
        }

        let present: BTreeSet<EndpointKey> = entries.keys().copied().collect();
        if let Some(missing) = EndpointKey::ALL.into_iter().find(|key| !present.contains(key)) {
            return Err(RegistryError::Missing(missing));
        }

        Ok(Self { entries })
    }

    /// Resolve a string key to its configuration.
    ///
    /// # Errors
    ///
    /// Returns `UNKNOWN_ENDPOINT` for keys outside the registry.
    pub fn lookup(&self, key: &str) -> Result<&EndpointConfig, ApiError> {
        self.get(key.parse()?)
    }

    /// # Errors
    ///
    /// Returns `UNKNOWN_ENDPOINT` if the key has no row.
    pub fn get(&self, key: EndpointKey) -> Result<&EndpointConfig, ApiError> {
        self.entries
            .get(&key)
            .ok_or_else(|| ApiError::unknown_endpoint(key.as_str()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointConfig> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn builtin_table_is_valid() {
        let registry = EndpointRegistry::builtin().unwrap();
        assert_eq!(registry.iter().count(), EndpointKey::ALL.len());
    }

    #[test]
    fn every_registered_key_resolves() {
        let registry = EndpointRegistry::builtin().unwrap();
        for key in EndpointKey::ALL {
            let config = registry.lookup(key.as_str()).unwrap();
            assert_eq!(config.key, key);
        }
    }

    #[test]
    fn unknown_key_fails_with_unknown_endpoint() {
        let registry = EndpointRegistry::builtin().unwrap();
        for key in ["", "readings", "readings.delete", "READINGS.LIST", "appointments.create "] {
            let err = registry.lookup(key).unwrap_err();
            assert_eq!(err.kind, ErrorKind::UnknownEndpoint, "{key:?}");
        }
    }

    #[test]
    fn token_endpoints_are_form_encoded_and_unauthenticated() {
        let registry = EndpointRegistry::builtin().unwrap();
        for key in [EndpointKey::AuthToken, EndpointKey::AuthRefresh] {
            let config = registry.get(key).unwrap();
            assert_eq!(config.encoding, BodyEncoding::Form);
            assert!(!config.requires_auth);
        }
        let others = registry
            .iter()
            .filter(|c| c.encoding == BodyEncoding::Form)
            .count();
        assert_eq!(others, 2);
    }

    #[test]
    fn duplicate_rows_are_rejected() {
        let mut table = builtin_table();
        table.push(EndpointConfig::row(EndpointKey::UsersMe, HttpMethod::Get, "/users/me", true));
        let err = EndpointRegistry::from_table(table).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate(EndpointKey::UsersMe));
    }

    #[test]
    fn missing_rows_are_rejected() {
        let table: Vec<_> = builtin_table()
            .into_iter()
            .filter(|c| c.key != EndpointKey::HealthCheck)
            .collect();
        let err = EndpointRegistry::from_table(table).unwrap_err();
        assert_eq!(err, RegistryError::Missing(EndpointKey::HealthCheck));
    }

    #[test]
    fn malformed_templates_are_rejected() {
        let mut table: Vec<_> = builtin_table()
            .into_iter()
            .filter(|c| c.key != EndpointKey::AppointmentsResolution)
            .collect();
        table.push(EndpointConfig::row(
            EndpointKey::AppointmentsResolution,
            HttpMethod::Get,
            "/appointments/{id/resolution",
            true,
        ));
        let err = EndpointRegistry::from_table(table).unwrap_err();
        assert!(matches!(err, RegistryError::MalformedTemplate { .. }));
    }

    #[test]
    fn cached_mutations_are_rejected() {
        let table: Vec<_> = builtin_table()
            .into_iter()
            .map(|c| {
                if c.key == EndpointKey::ReadingsCreate {
                    c.cached(Duration::from_secs(10))
                } else {
                    c
                }
            })
            .collect();
        let err = EndpointRegistry::from_table(table).unwrap_err();
        assert_eq!(err, RegistryError::CachedMutation(EndpointKey::ReadingsCreate));
    }

    #[test]
    fn family_is_prefix_before_dot() {
        assert_eq!(EndpointKey::AppointmentsCreate.family(), "appointments");
        assert_eq!(EndpointKey::ReadingsList.family(), "readings");
        assert_eq!(EndpointKey::HealthCheck.family(), "health");
    }

    #[test]
    fn mutation_invalidates_own_family_and_extras() {
        let registry = EndpointRegistry::builtin().unwrap();
        let create = registry.get(EndpointKey::ReadingsCreate).unwrap();
        assert_eq!(create.invalidated_families(), vec!["readings", "users"]);

        let list = registry.get(EndpointKey::ReadingsList).unwrap();
        assert!(list.invalidated_families().is_empty());
    }

    #[test]
    fn cache_key_ignores_insertion_order() {
        let registry = EndpointRegistry::builtin().unwrap();
        let list = registry.get(EndpointKey::ReadingsList).unwrap();

        let mut a = Params::new();
        a.insert("userId".into(), "u1".into());
        a.insert("offset".into(), "0".into());
        let mut b = Params::new();
        b.insert("offset".into(), "0".into());
        b.insert("userId".into(), "u1".into());

        assert_eq!(list.cache_key(&a), list.cache_key(&b));
        assert_eq!(list.cache_key(&a).unwrap(), "readings.list|offset=0&userId=u1");
    }

    #[test]
    fn cache_key_differs_when_any_param_differs() {
        let registry = EndpointRegistry::builtin().unwrap();
        let list = registry.get(EndpointKey::ReadingsList).unwrap();
        let base = params(&[("userId", "u1"), ("offset", "0")]);
        let variants = [
            params(&[("userId", "u2"), ("offset", "0")]),
            params(&[("userId", "u1"), ("offset", "10")]),
            params(&[("userId", "u1"), ("offset", "0"), ("limit", "5")]),
            params(&[("userId", "u1")]),
            // Separator characters inside values must not alias other maps.
            params(&[("userId", "u1&offset=0")]),
        ];
        for variant in &variants {
            assert_ne!(list.cache_key(&base), list.cache_key(variant), "{variant:?}");
        }
    }

    #[test]
    fn non_cacheable_endpoint_has_no_cache_key() {
        let registry = EndpointRegistry::builtin().unwrap();
        let create = registry.get(EndpointKey::AppointmentsCreate).unwrap();
        assert!(create.cache_key(&Params::new()).is_none());
    }

    #[test]
    fn render_path_substitutes_and_returns_leftovers() {
        let registry = EndpointRegistry::builtin().unwrap();
        let resolution = registry.get(EndpointKey::AppointmentsResolution).unwrap();
        let (path, leftover) = resolution
            .render_path(&params(&[("id", "42"), ("verbose", "1")]))
            .unwrap();
        assert_eq!(path, "/appointments/42/resolution");
        assert_eq!(leftover, params(&[("verbose", "1")]));
    }

    #[test]
    fn render_path_escapes_values() {
        let registry = EndpointRegistry::builtin().unwrap();
        let data = registry.get(EndpointKey::TidepoolData).unwrap();
        let (path, _) = data.render_path(&params(&[("userId", "a/b c")])).unwrap();
        assert_eq!(path, "/data/a%2Fb%20c");
    }

    #[test]
    fn render_path_requires_placeholder_values() {
        let registry = EndpointRegistry::builtin().unwrap();
        let resolution = registry.get(EndpointKey::AppointmentsResolution).unwrap();
        let err = resolution.render_path(&Params::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
        assert!(err.message.contains("`id`"));
    }

    #[test]
    fn custom_key_fn_is_used() {
        fn user_only(params: &Params) -> String {
            params.get("userId").cloned().unwrap_or_default()
        }
        let config = EndpointConfig::row(EndpointKey::UsersMe, HttpMethod::Get, "/users/me", true);
        let config = EndpointConfig {
            cache_policy: Some(CachePolicy::new(Duration::from_secs(1)).with_key_fn(user_only)),
            ..config
        };
        let key = config.cache_key(&params(&[("userId", "u9"), ("noise", "x")]));
        assert_eq!(key.as_deref(), Some("users.me|u9"));
    }
}
