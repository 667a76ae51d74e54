//! Stand-in for the local containerized API gateway service.
//!
//! Serves the routes the gateway's endpoint table points at, with per-user
//! in-memory state, bearer-token checks and `{"detail": ...}` error bodies.
//! `POST /debug/fail` makes the next N requests fail with a chosen status so
//! retry and health handling can be exercised over real HTTP.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

pub const DEMO_USERNAME: &str = "1000";
pub const DEMO_PASSWORD: &str = "demo-password";
const TOKEN_LIFETIME_SECS: u64 = 3600;
const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: u64,
    pub dni: String,
    pub name: String,
    pub surname: String,
    pub email: String,
    pub times_measured: u32,
    pub streak: u32,
    pub max_streak: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateProfile {
    pub name: Option<String>,
    pub surname: Option<String>,
    pub email: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: u64,
    pub value: f64,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateReading {
    pub value: f64,
    pub date: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub appointment_id: u64,
    pub date: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateAppointment {
    pub date: String,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    None,
    Pending,
    Accepted,
    Denied,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenForm {
    #[serde(default)]
    pub grant_type: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Makes the next `count` requests fail with `status`.
#[derive(Debug, Deserialize)]
pub struct FaultSpec {
    pub status: u16,
    pub count: u32,
}

#[derive(Debug, Deserialize)]
pub struct Page {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug)]
struct Account {
    password: String,
    profile: UserProfile,
    readings: Vec<Reading>,
    appointments: Vec<Appointment>,
    queue: QueueState,
    placement: Option<u64>,
}

impl Account {
    fn new(user_id: u64, dni: &str, password: &str) -> Self {
        Self {
            password: password.to_string(),
            profile: UserProfile {
                user_id,
                dni: dni.to_string(),
                name: "Demo".to_string(),
                surname: "Patient".to_string(),
                email: format!("{dni}@diabetactic.test"),
                times_measured: 0,
                streak: 0,
                max_streak: 0,
            },
            readings: Vec::new(),
            appointments: Vec::new(),
            queue: QueueState::None,
            placement: None,
        }
    }
}

#[derive(Debug)]
pub struct Backend {
    accounts: HashMap<String, Account>,
    access_tokens: HashMap<String, String>,
    refresh_tokens: HashMap<String, String>,
    fault: Option<(StatusCode, u32)>,
    next_reading_id: u64,
    next_appointment_id: u64,
    next_placement: u64,
}

impl Default for Backend {
    fn default() -> Self {
        let mut accounts = HashMap::new();
        accounts.insert(DEMO_USERNAME.to_string(), Account::new(1, DEMO_USERNAME, DEMO_PASSWORD));
        Self {
            accounts,
            access_tokens: HashMap::new(),
            refresh_tokens: HashMap::new(),
            fault: None,
            next_reading_id: 1,
            next_appointment_id: 1,
            next_placement: 1,
        }
    }
}

impl Backend {
    fn issue_token(&mut self, dni: &str) -> TokenResponse {
        let access_token = Uuid::new_v4().to_string();
        let refresh_token = Uuid::new_v4().to_string();
        self.access_tokens.insert(access_token.clone(), dni.to_string());
        self.refresh_tokens.insert(refresh_token.clone(), dni.to_string());
        TokenResponse {
            access_token,
            token_type: "bearer".to_string(),
            expires_in: TOKEN_LIFETIME_SECS,
            refresh_token,
        }
    }

    fn take_fault(&mut self) -> Option<StatusCode> {
        let (status, remaining) = self.fault.as_mut()?;
        let status = *status;
        *remaining -= 1;
        if *remaining == 0 {
            self.fault = None;
        }
        Some(status)
    }

    fn account_for(&mut self, headers: &HeaderMap) -> Result<&mut Account, Detail> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| Detail::unauthorized("Not authenticated"))?;
        let dni = self
            .access_tokens
            .get(token)
            .ok_or_else(|| Detail::unauthorized("Could not validate credentials"))?;
        self.accounts
            .get_mut(dni)
            .ok_or_else(|| Detail::unauthorized("Could not validate credentials"))
    }
}

pub type Db = Arc<RwLock<Backend>>;

/// Error response in the `{"detail": ...}` shape.
#[derive(Debug)]
pub struct Detail(StatusCode, String);

impl Detail {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self(status, message.into())
    }

    fn unauthorized(message: &str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for Detail {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "detail": self.1 }))).into_response()
    }
}

pub fn app() -> Router {
    let db: Db = Arc::new(RwLock::new(Backend::default()));
    Router::new()
        .route("/token", post(token))
        .route("/users/me", get(get_profile).patch(update_profile))
        .route("/glucose/mine", get(list_readings))
        .route("/glucose/mine/latest", get(latest_reading))
        .route("/glucose/create", post(create_reading))
        .route("/appointments/mine", get(list_appointments))
        .route("/appointments/state", get(queue_state))
        .route("/appointments/placement", get(queue_placement))
        .route("/appointments/create", post(create_appointment))
        .route("/appointments/submit", post(submit_appointment))
        .route("/appointments/{id}/resolution", get(appointment_resolution))
        .route("/health", get(health))
        .route("/debug/fail", post(set_fault))
        .layer(middleware::from_fn_with_state(db.clone(), inject_faults))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn inject_faults(State(db): State<Db>, request: Request, next: Next) -> Response {
    if request.uri().path() != "/debug/fail" {
        if let Some(status) = db.write().await.take_fault() {
            tracing::debug!(%status, path = request.uri().path(), "injected fault");
            return Detail::new(status, "injected fault").into_response();
        }
    }
    next.run(request).await
}

async fn set_fault(State(db): State<Db>, Json(fault): Json<FaultSpec>) -> Result<StatusCode, Detail> {
    let status = StatusCode::from_u16(fault.status)
        .map_err(|_| Detail::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid status"))?;
    db.write().await.fault = (fault.count > 0).then_some((status, fault.count));
    Ok(StatusCode::NO_CONTENT)
}

async fn token(State(db): State<Db>, Form(form): Form<TokenForm>) -> Result<Json<TokenResponse>, Detail> {
    let mut backend = db.write().await;
    match form.grant_type.as_deref() {
        Some("refresh_token") => {
            let dni = form
                .refresh_token
                .and_then(|token| backend.refresh_tokens.remove(&token))
                .ok_or_else(|| Detail::unauthorized("Invalid refresh token"))?;
            Ok(Json(backend.issue_token(&dni)))
        }
        None | Some("password") => {
            let (Some(username), Some(password)) = (form.username, form.password) else {
                return Err(Detail::new(StatusCode::UNPROCESSABLE_ENTITY, "username and password are required"));
            };
            let valid = backend
                .accounts
                .get(&username)
                .is_some_and(|account| account.password == password);
            if !valid {
                return Err(Detail::unauthorized("Incorrect username or password"));
            }
            Ok(Json(backend.issue_token(&username)))
        }
        Some(other) => Err(Detail::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("unsupported grant_type `{other}`"),
        )),
    }
}

async fn get_profile(State(db): State<Db>, headers: HeaderMap) -> Result<Json<UserProfile>, Detail> {
    let mut backend = db.write().await;
    let account = backend.account_for(&headers)?;
    Ok(Json(account.profile.clone()))
}

async fn update_profile(
    State(db): State<Db>,
    headers: HeaderMap,
    Json(update): Json<UpdateProfile>,
) -> Result<Json<UserProfile>, Detail> {
    let mut backend = db.write().await;
    let profile = &mut backend.account_for(&headers)?.profile;
    if let Some(name) = update.name {
        profile.name = name;
    }
    if let Some(surname) = update.surname {
        profile.surname = surname;
    }
    if let Some(email) = update.email {
        profile.email = email;
    }
    Ok(Json(profile.clone()))
}

async fn list_readings(
    State(db): State<Db>,
    headers: HeaderMap,
    Query(page): Query<Page>,
) -> Result<Json<Vec<Reading>>, Detail> {
    let mut backend = db.write().await;
    let account = backend.account_for(&headers)?;
    let readings = account
        .readings
        .iter()
        .rev()
        .skip(page.offset.unwrap_or(0))
        .take(page.limit.unwrap_or(DEFAULT_PAGE_SIZE))
        .cloned()
        .collect();
    Ok(Json(readings))
}

async fn latest_reading(State(db): State<Db>, headers: HeaderMap) -> Result<Json<Reading>, Detail> {
    let mut backend = db.write().await;
    let account = backend.account_for(&headers)?;
    account
        .readings
        .last()
        .cloned()
        .map(Json)
        .ok_or_else(|| Detail::not_found("No readings recorded"))
}

async fn create_reading(
    State(db): State<Db>,
    headers: HeaderMap,
    Json(input): Json<CreateReading>,
) -> Result<(StatusCode, Json<Reading>), Detail> {
    let mut backend = db.write().await;
    let id = backend.next_reading_id;
    let account = backend.account_for(&headers)?;
    let reading = Reading {
        id,
        value: input.value,
        date: input.date,
        notes: input.notes,
    };
    account.readings.push(reading.clone());
    let profile = &mut account.profile;
    profile.times_measured += 1;
    profile.streak += 1;
    profile.max_streak = profile.max_streak.max(profile.streak);
    backend.next_reading_id += 1;
    Ok((StatusCode::CREATED, Json(reading)))
}

async fn list_appointments(State(db): State<Db>, headers: HeaderMap) -> Result<Json<Vec<Appointment>>, Detail> {
    let mut backend = db.write().await;
    let account = backend.account_for(&headers)?;
    Ok(Json(account.appointments.clone()))
}

async fn queue_state(State(db): State<Db>, headers: HeaderMap) -> Result<Json<serde_json::Value>, Detail> {
    let mut backend = db.write().await;
    let account = backend.account_for(&headers)?;
    Ok(Json(json!({ "state": account.queue })))
}

async fn queue_placement(State(db): State<Db>, headers: HeaderMap) -> Result<Json<serde_json::Value>, Detail> {
    let mut backend = db.write().await;
    let account = backend.account_for(&headers)?;
    Ok(Json(json!({ "placement": account.placement })))
}

async fn create_appointment(
    State(db): State<Db>,
    headers: HeaderMap,
    Json(input): Json<CreateAppointment>,
) -> Result<(StatusCode, Json<Appointment>), Detail> {
    let mut backend = db.write().await;
    let appointment_id = backend.next_appointment_id;
    let account = backend.account_for(&headers)?;
    let appointment = Appointment {
        appointment_id,
        date: input.date,
        reason: input.reason,
    };
    account.appointments.push(appointment.clone());
    backend.next_appointment_id += 1;
    Ok((StatusCode::CREATED, Json(appointment)))
}

async fn submit_appointment(State(db): State<Db>, headers: HeaderMap) -> Result<Json<serde_json::Value>, Detail> {
    let mut backend = db.write().await;
    let placement = backend.next_placement;
    let account = backend.account_for(&headers)?;
    if account.queue == QueueState::Pending {
        return Err(Detail::new(StatusCode::CONFLICT, "Already waiting in the appointment queue"));
    }
    account.queue = QueueState::Pending;
    account.placement = Some(placement);
    backend.next_placement += 1;
    Ok(Json(json!({ "placement": placement })))
}

async fn appointment_resolution(
    State(db): State<Db>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<Json<serde_json::Value>, Detail> {
    let mut backend = db.write().await;
    let account = backend.account_for(&headers)?;
    let appointment = account
        .appointments
        .iter()
        .find(|appointment| appointment.appointment_id == id)
        .ok_or_else(|| Detail::not_found("Appointment not found"))?;
    Ok(Json(json!({
        "appointment_id": appointment.appointment_id,
        "status": "pending",
    })))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
