//! Domain DTOs exchanged with the API gateway service.
//!
//! # Design
//! These mirror the backend schema but are defined independently of the
//! mock-server crate; the end-to-end tests catch drift between the two.

use serde::{Deserialize, Serialize};

/// Body of a successful `/token` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime in seconds; absent means the backend default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// Profile of the authenticated user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: u64,
    pub dni: String,
    pub name: String,
    pub surname: String,
    pub email: String,
    #[serde(default)]
    pub times_measured: u32,
    #[serde(default)]
    pub streak: u32,
    #[serde(default)]
    pub max_streak: u32,
}

/// Partial profile update; omitted fields stay unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub surname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A stored glucose reading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlucoseReading {
    pub id: u64,
    /// mg/dL.
    pub value: f64,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReading {
    pub value: f64,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Appointment {
    pub appointment_id: u64,
    pub date: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAppointment {
    pub date: String,
    pub reason: String,
}

/// Where the user stands in the appointment request queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    None,
    Pending,
    Accepted,
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStatus {
    pub state: QueueState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuePlacement {
    pub placement: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppointmentResolution {
    pub appointment_id: u64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}
