//! Request and response payloads for the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 80, message = "Name is required"))]
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub id: i64,
    pub name: String,
    pub code_hint: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user: UserSummary,
    /// Plaintext access code; returned exactly once, never persisted.
    pub code: String,
    pub message: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SessionRequest {
    #[validate(length(min = 4, message = "Code is too short"))]
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MealEntry {
    pub id: i64,
    pub user_id: i64,
    pub source: String,
    pub dish: String,
    pub meal_type: String,
    pub calories_kcal: Option<f64>,
    pub protein_g: Option<f64>,
    pub fiber_g: Option<f64>,
    pub confidence_score: Option<f64>,
    pub nutrients: Vec<String>,
    pub chemicals: Vec<String>,
    pub notes: Option<String>,
    pub eaten_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct MealListResponse {
    pub entries: Vec<MealEntry>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct MealsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub q: Option<String>,
    pub source: Option<String>,
    pub meal_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub days: i64,
    pub entries: i64,
    pub calories_kcal: f64,
    pub protein_g: f64,
    pub fiber_g: f64,
}

#[derive(Debug, Serialize)]
pub struct GoalsResponse {
    pub calories_kcal: f64,
    pub protein_g: f64,
    pub fiber_g: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct GoalsUpdateRequest {
    #[validate(range(min = 100.0, max = 10000.0))]
    pub calories_kcal: f64,
    #[validate(range(min = 0.0, max = 1000.0))]
    pub protein_g: f64,
    #[validate(range(min = 0.0, max = 300.0))]
    pub fiber_g: f64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ManualAnalysisRequest {
    #[validate(length(min = 2, message = "Text is too short"))]
    pub text: String,
    #[serde(default = "default_true")]
    pub save_entry: bool,
    #[serde(default = "default_meal_type")]
    #[validate(length(max = 30))]
    pub meal_type: String,
}

/// Structured nutrition facts extracted by a provider.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub dish: String,
    pub meal_type: String,
    pub calories_kcal: Option<f64>,
    pub protein_g: Option<f64>,
    pub fiber_g: Option<f64>,
    pub confidence_score: Option<f64>,
    pub nutrients: Vec<String>,
    pub chemicals: Vec<String>,
    pub notes: Option<String>,
    pub source: String,
    pub model: Option<String>,
    pub raw: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AdminOverview {
    pub users: i64,
    pub entries: i64,
    pub calories_kcal: f64,
}

#[derive(Debug, Serialize)]
pub struct AdminUser {
    pub id: i64,
    pub name: String,
    pub code_hint: String,
    pub created_at: DateTime<Utc>,
    pub entries: i64,
    pub calories_kcal: f64,
}

#[derive(Debug, Serialize)]
pub struct ResetCodeResponse {
    pub user: UserSummary,
    pub new_code: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub status: &'static str,
}

impl DeleteResponse {
    pub fn ok() -> Self {
        Self { status: "ok" }
    }
}

fn default_true() -> bool {
    true
}

fn default_meal_type() -> String {
    "other".to_string()
}
