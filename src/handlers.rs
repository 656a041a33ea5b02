//! HTTP handlers and shared application state.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use validator::Validate;

use crate::config::Config;
use crate::error::{ApiError, Result};
use crate::meals::{self, MealFilter, NewEntry, DEFAULT_LIST_LIMIT, DEFAULT_SUMMARY_DAYS};
use crate::models::{
    AdminOverview, AdminUser, AnalysisResult, DeleteResponse, GoalsResponse, GoalsUpdateRequest,
    ManualAnalysisRequest, MealListResponse, MealsQuery, RegisterRequest, RegisterResponse,
    ResetCodeResponse, SessionRequest, SessionResponse, SummaryQuery, SummaryResponse,
    UserSummary,
};
use crate::providers::{self, Provider};
use crate::rate_limit::RateLimiter;
use crate::users::{self, UserRecord};

pub const ACCESS_CODE_HEADER: &str = "x-access-code";
pub const ADMIN_CODE_HEADER: &str = "x-admin-code";

const CODE_NOTICE: &str = "Save this code now. It is only shown once.";

/// Shared application state, constructed once at startup and cloned into
/// every handler. Tests build isolated instances; nothing here is a
/// process global.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
}

async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<UserRecord> {
    let code = headers
        .get(ACCESS_CODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized("Missing access code"))?;
    users::find_by_code(&state.pool, &state.config.code_pepper, code)
        .await?
        .ok_or(ApiError::Unauthorized("Invalid access code"))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let presented = headers
        .get(ADMIN_CODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    match &state.config.admin_code {
        Some(expected) if !presented.is_empty() && presented == expected => Ok(()),
        _ => Err(ApiError::Unauthorized("Invalid admin code")),
    }
}

fn validated<T: Validate>(payload: T) -> Result<T> {
    payload
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    Ok(payload)
}

pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>> {
    let payload = validated(payload)?;
    let issued = users::create_user(&state.pool, &state.config.code_pepper, &payload.name).await?;
    tracing::info!(user_id = issued.user.id, "registered user");
    Ok(Json(RegisterResponse {
        user: issued.user.summary(),
        code: issued.code,
        message: CODE_NOTICE.to_string(),
    }))
}

pub async fn session(
    State(state): State<AppState>,
    Json(payload): Json<SessionRequest>,
) -> Result<Json<SessionResponse>> {
    let payload = validated(payload)?;

    if let Some(admin_code) = &state.config.admin_code {
        if payload.code.trim() == admin_code {
            return Ok(Json(SessionResponse {
                mode: "admin",
                user: None,
            }));
        }
    }

    let user = users::find_by_code(&state.pool, &state.config.code_pepper, &payload.code)
        .await?
        .ok_or(ApiError::NotFound("Invalid code"))?;
    Ok(Json(SessionResponse {
        mode: "user",
        user: Some(user.summary()),
    }))
}

pub async fn profile(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserSummary>> {
    let user = require_user(&state, &headers).await?;
    Ok(Json(user.summary()))
}

pub async fn list_meals(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<MealsQuery>,
) -> Result<Json<MealListResponse>> {
    let user = require_user(&state, &headers).await?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, meals::MAX_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);
    let filter = MealFilter {
        q: query.q,
        source: query.source,
        meal_type: query.meal_type,
    };

    let entries = meals::list_entries(&state.pool, user.id, limit, offset, &filter).await?;
    let total = meals::count_entries(&state.pool, user.id, &filter).await?;
    Ok(Json(MealListResponse {
        entries,
        total,
        limit,
        offset,
    }))
}

pub async fn delete_meal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(entry_id): Path<i64>,
) -> Result<Json<DeleteResponse>> {
    let user = require_user(&state, &headers).await?;
    if !meals::delete_entry(&state.pool, user.id, entry_id).await? {
        return Err(ApiError::NotFound("Entry not found"));
    }
    Ok(Json(DeleteResponse::ok()))
}

pub async fn summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<SummaryResponse>> {
    let user = require_user(&state, &headers).await?;
    let days = query.days.unwrap_or(DEFAULT_SUMMARY_DAYS);
    Ok(Json(meals::summary_for_user(&state.pool, user.id, days).await?))
}

pub async fn get_goals(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<GoalsResponse>> {
    let user = require_user(&state, &headers).await?;
    Ok(Json(meals::get_goals(&state.pool, user.id).await?))
}

pub async fn put_goals(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<GoalsUpdateRequest>,
) -> Result<Json<GoalsResponse>> {
    let user = require_user(&state, &headers).await?;
    let payload = validated(payload)?;
    Ok(Json(
        meals::upsert_goals(
            &state.pool,
            user.id,
            payload.calories_kcal,
            payload.protein_g,
            payload.fiber_g,
        )
        .await?,
    ))
}

pub async fn analyze_photo(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<AnalysisResult>> {
    let user = require_user(&state, &headers).await?;

    let mut image: Option<Vec<u8>> = None;
    let mut provider_raw = String::new();
    let mut save_entry = true;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(e.to_string()))?
    {
        match field.name().unwrap_or("") {
            "image" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Validation(e.to_string()))?;
                image = Some(bytes.to_vec());
            }
            "provider" => {
                provider_raw = field
                    .text()
                    .await
                    .map_err(|e| ApiError::Validation(e.to_string()))?;
            }
            "save_entry" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::Validation(e.to_string()))?;
                save_entry = matches!(text.trim().to_lowercase().as_str(), "true" | "1" | "yes");
            }
            _ => {}
        }
    }

    let image = image
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| ApiError::Validation("Image is empty".to_string()))?;
    let provider = Provider::parse(&provider_raw)?;

    let result = providers::analyze_image(&state.config, provider, &image).await?;
    if save_entry {
        meals::create_entry(&state.pool, user.id, &entry_from_analysis(&result)).await?;
    }
    Ok(Json(result))
}

pub async fn analyze_manual(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ManualAnalysisRequest>,
) -> Result<Json<AnalysisResult>> {
    let user = require_user(&state, &headers).await?;
    let payload = validated(payload)?;

    let result = providers::analyze_manual(&payload.text, &payload.meal_type);
    if payload.save_entry {
        meals::create_entry(&state.pool, user.id, &entry_from_analysis(&result)).await?;
    }
    Ok(Json(result))
}

fn entry_from_analysis(result: &AnalysisResult) -> NewEntry {
    NewEntry {
        source: result.source.clone(),
        dish: result.dish.clone(),
        meal_type: result.meal_type.clone(),
        calories_kcal: result.calories_kcal,
        protein_g: result.protein_g,
        fiber_g: result.fiber_g,
        confidence_score: result.confidence_score,
        nutrients: result.nutrients.clone(),
        chemicals: result.chemicals.clone(),
        notes: result.notes.clone(),
    }
}

pub async fn admin_overview(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AdminOverview>> {
    require_admin(&state, &headers)?;
    Ok(Json(meals::admin_overview(&state.pool).await?))
}

pub async fn admin_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<AdminUser>>> {
    require_admin(&state, &headers)?;
    Ok(Json(users::list_admin_users(&state.pool).await?))
}

pub async fn admin_reset_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<Json<ResetCodeResponse>> {
    require_admin(&state, &headers)?;
    let issued = users::reset_code(&state.pool, &state.config.code_pepper, user_id)
        .await?
        .ok_or(ApiError::NotFound("User not found"))?;
    tracing::info!(user_id, "reset access code");
    Ok(Json(ResetCodeResponse {
        user: issued.user.summary(),
        new_code: issued.code,
    }))
}

pub async fn admin_delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<Json<DeleteResponse>> {
    require_admin(&state, &headers)?;
    if !users::delete_user(&state.pool, user_id).await? {
        return Err(ApiError::NotFound("User not found"));
    }
    tracing::info!(user_id, "deleted user");
    Ok(Json(DeleteResponse::ok()))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}

/// Fallback for unknown `/api/...` paths; everything else falls through
/// to the SPA when static serving is configured.
pub async fn api_fallback() -> ApiError {
    ApiError::NotFound("Not found")
}
