//! In-process mock backend.
//!
//! # Design
//! `MockAdapter` answers a subset of endpoint keys with synthesized HTTP
//! responses and keeps a small in-memory state per resource family, so a
//! session of create/read/update calls stays consistent: a reading created
//! through the mock shows up in the next mocked list. Responses go through the
//! same status classification as real transport responses.
//!
//! Keys without a mock implementation are refused with `UNKNOWN_ENDPOINT`;
//! the gateway never falls back to the network for them in mock mode.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::{AuthToken, TokenRefresher};
use crate::endpoints::{EndpointKey, Params};
use crate::error::{ApiError, ErrorKind};
use crate::http::HttpResponse;
use crate::types::{
    Appointment, AppointmentResolution, CreateAppointment, CreateReading, GlucoseReading, QueuePlacement,
    QueueState, QueueStatus, TokenResponse, UpdateProfile, UserProfile,
};

const MOCK_TOKEN_LIFETIME_SECS: u64 = 3600;
const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Deserialize)]
struct TokenForm {
    #[serde(default)]
    grant_type: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug)]
struct MockState {
    profile: UserProfile,
    readings: Vec<GlucoseReading>,
    next_reading_id: u64,
    appointments: Vec<Appointment>,
    next_appointment_id: u64,
    queue: QueueState,
    placement: Option<u64>,
    next_placement: u64,
    refresh_tokens: HashSet<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            profile: UserProfile {
                user_id: 1,
                dni: "1000".to_string(),
                name: "Demo".to_string(),
                surname: "Patient".to_string(),
                email: "demo@diabetactic.test".to_string(),
                times_measured: 0,
                streak: 0,
                max_streak: 0,
            },
            readings: Vec::new(),
            next_reading_id: 1,
            appointments: Vec::new(),
            next_appointment_id: 1,
            queue: QueueState::None,
            placement: None,
            next_placement: 1,
            refresh_tokens: HashSet::new(),
        }
    }
}

impl MockState {
    fn issue_token(&mut self) -> TokenResponse {
        let refresh_token = format!("mock-refresh-{}", Uuid::new_v4());
        self.refresh_tokens.insert(refresh_token.clone());
        TokenResponse {
            access_token: format!("mock-access-{}", Uuid::new_v4()),
            token_type: "bearer".to_string(),
            expires_in: Some(MOCK_TOKEN_LIFETIME_SECS),
            refresh_token: Some(refresh_token),
        }
    }
}

#[derive(Debug, Default)]
pub struct MockAdapter {
    state: Mutex<MockState>,
    latency: Duration,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated round-trip latency applied to every response.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn can_handle(&self, endpoint_key: &str) -> bool {
        endpoint_key.parse().is_ok_and(is_mocked)
    }

    /// Synthesize the response for one call.
    ///
    /// # Errors
    ///
    /// `UNKNOWN_ENDPOINT` for keys outside the mocked subset.
    pub async fn respond(
        &self,
        endpoint_key: &str,
        params: &Params,
        body: Option<&[u8]>,
    ) -> Result<HttpResponse, ApiError> {
        let key: EndpointKey = endpoint_key.parse()?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let response = self.respond_now(key, params, body).ok_or_else(|| {
            ApiError::new(
                ErrorKind::UnknownEndpoint,
                format!("no mock response registered for `{endpoint_key}`"),
            )
        })?;
        tracing::debug!(endpoint = %key, "mock response");
        Ok(response)
    }

    /// `None` for keys outside the mocked subset.
    fn respond_now(&self, key: EndpointKey, params: &Params, body: Option<&[u8]>) -> Option<HttpResponse> {
        let mut state = self.state.lock();
        let response = match key {
            EndpointKey::AuthToken => login(&mut state, body),
            EndpointKey::AuthRefresh => refresh(&mut state, body),
            EndpointKey::UsersMe => ok(&state.profile),
            EndpointKey::UsersUpdate => match parse_json::<UpdateProfile>(body) {
                Ok(update) => {
                    let profile = &mut state.profile;
                    if let Some(name) = update.name {
                        profile.name = name;
                    }
                    if let Some(surname) = update.surname {
                        profile.surname = surname;
                    }
                    if let Some(email) = update.email {
                        profile.email = email;
                    }
                    ok(&state.profile)
                }
                Err(response) => response,
            },
            EndpointKey::ReadingsList => {
                let offset = page_param(params, "offset").unwrap_or(0);
                let limit = page_param(params, "limit").unwrap_or(DEFAULT_PAGE_SIZE);
                let page: Vec<&GlucoseReading> = state.readings.iter().rev().skip(offset).take(limit).collect();
                ok(&page)
            }
            EndpointKey::ReadingsLatest => match state.readings.last() {
                Some(reading) => ok(reading),
                None => detail(404, "no readings recorded"),
            },
            EndpointKey::ReadingsCreate => match parse_json::<CreateReading>(body) {
                Ok(input) => {
                    let reading = GlucoseReading {
                        id: state.next_reading_id,
                        value: input.value,
                        date: input.date,
                        notes: input.notes,
                    };
                    state.next_reading_id += 1;
                    state.readings.push(reading.clone());
                    let profile = &mut state.profile;
                    profile.times_measured += 1;
                    profile.streak += 1;
                    profile.max_streak = profile.max_streak.max(profile.streak);
                    created(&reading)
                }
                Err(response) => response,
            },
            EndpointKey::AppointmentsList => ok(&state.appointments),
            EndpointKey::AppointmentsState => ok(&QueueStatus { state: state.queue }),
            EndpointKey::AppointmentsPlacement => ok(&QueuePlacement {
                placement: state.placement,
            }),
            EndpointKey::AppointmentsCreate => match parse_json::<CreateAppointment>(body) {
                Ok(input) => {
                    let appointment = Appointment {
                        appointment_id: state.next_appointment_id,
                        date: input.date,
                        reason: input.reason,
                    };
                    state.next_appointment_id += 1;
                    state.appointments.push(appointment.clone());
                    created(&appointment)
                }
                Err(response) => response,
            },
            EndpointKey::AppointmentsSubmit => {
                if state.queue == QueueState::Pending {
                    return Some(detail(409, "already waiting in the appointment queue"));
                }
                state.queue = QueueState::Pending;
                state.placement = Some(state.next_placement);
                state.next_placement += 1;
                ok(&QueuePlacement {
                    placement: state.placement,
                })
            }
            EndpointKey::AppointmentsResolution => {
                let id = params.get("id").and_then(|id| id.parse::<u64>().ok());
                match id.and_then(|id| state.appointments.iter().find(|a| a.appointment_id == id)) {
                    Some(appointment) => ok(&AppointmentResolution {
                        appointment_id: appointment.appointment_id,
                        status: "pending".to_string(),
                        notes: None,
                    }),
                    None => detail(404, "appointment not found"),
                }
            }
            EndpointKey::HealthCheck => HttpResponse::json(200, &json!({"status": "ok"})),
            EndpointKey::TidepoolData => return None,
        };
        Some(response)
    }
}

fn is_mocked(key: EndpointKey) -> bool {
    !matches!(key, EndpointKey::TidepoolData)
}

fn login(state: &mut MockState, body: Option<&[u8]>) -> HttpResponse {
    let Ok(form) = parse_form(body) else {
        return detail(422, "malformed token request");
    };
    match (form.username.as_deref(), form.password.as_deref()) {
        (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
            ok(&state.issue_token())
        }
        _ => detail(401, "Incorrect username or password"),
    }
}

fn refresh(state: &mut MockState, body: Option<&[u8]>) -> HttpResponse {
    let Ok(form) = parse_form(body) else {
        return detail(422, "malformed token request");
    };
    if form.grant_type.as_deref() != Some("refresh_token") {
        return detail(422, "unsupported grant_type");
    }
    match form.refresh_token {
        Some(token) if state.refresh_tokens.remove(&token) => ok(&state.issue_token()),
        _ => detail(401, "invalid refresh token"),
    }
}

fn parse_form(body: Option<&[u8]>) -> Result<TokenForm, serde_urlencoded::de::Error> {
    serde_urlencoded::from_bytes(body.unwrap_or_default())
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: Option<&[u8]>) -> Result<T, HttpResponse> {
    serde_json::from_slice(body.unwrap_or_default()).map_err(|e| detail(422, &e.to_string()))
}

fn page_param(params: &Params, name: &str) -> Option<usize> {
    params.get(name).and_then(|value| value.parse().ok())
}

fn ok<T: serde::Serialize + ?Sized>(value: &T) -> HttpResponse {
    to_response(200, value)
}

fn created<T: serde::Serialize>(value: &T) -> HttpResponse {
    to_response(201, value)
}

fn to_response<T: serde::Serialize + ?Sized>(status: u16, value: &T) -> HttpResponse {
    match serde_json::to_value(value) {
        Ok(json) => HttpResponse::json(status, &json),
        Err(e) => detail(500, &e.to_string()),
    }
}

/// Error body in the backend's `{"detail": ...}` shape.
fn detail(status: u16, message: &str) -> HttpResponse {
    HttpResponse::json(status, &json!({ "detail": message }))
}

/// The mock doubles as the refresher in mock mode.
#[async_trait]
impl TokenRefresher for MockAdapter {
    async fn refresh(&self, refresh_token: &str) -> Result<AuthToken, ApiError> {
        let form = serde_urlencoded::to_string([("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .map_err(|e| ApiError::validation(e.to_string()))?;
        let response = self
            .respond(EndpointKey::AuthRefresh.as_str(), &Params::new(), Some(form.as_bytes()))
            .await?;
        let body = crate::client::parse_response(&response)?;
        let token: TokenResponse = serde_json::from_slice(&body)?;
        Ok(AuthToken::from_response(token))
    }
}
