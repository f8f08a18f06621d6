//! Operator-facing HTTP surface (axum).
//!
//! The rest of the process is synchronous; this module runs a tokio runtime
//! on its own thread and pushes all database and provider work through
//! `spawn_blocking`. Handlers open a fresh connection per request, which is
//! plenty at the traffic this service sees.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use diesel::{Connection, PgConnection};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SharedSettings;
use crate::db::models::{trigger_type, NewDevice};
use crate::mailer::{self, Mailer};
use crate::push::PushClient;
use crate::services::evaluation::{self, RunReport};
use crate::services::{receipts, registry};
use crate::utils::Shutdown;
use crate::weather::WeatherClient;

#[derive(Clone)]
pub struct AppState {
    pub database_url: String,
    pub settings: SharedSettings,
    pub weather: Arc<WeatherClient>,
    pub mailer: Arc<Mailer>,
    pub push: Arc<PushClient>,
    pub historical_years: u32,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn unprocessable(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<registry::RegistryError> for ApiError {
    fn from(value: registry::RegistryError) -> Self {
        match &value {
            registry::RegistryError::InvalidEmail(_) => ApiError::bad_request(value.to_string()),
            registry::RegistryError::DuplicateEmail(_) => ApiError::conflict(value.to_string()),
            registry::RegistryError::Db(_) => ApiError::internal(value.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

/// Run a closure against a fresh blocking database connection.
async fn with_conn<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, ApiError> + Send + 'static,
{
    let database_url = state.database_url.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = PgConnection::establish(&database_url)
            .map_err(|e| ApiError::internal(format!("DB connection failed: {}", e)))?;
        f(&mut conn)
    })
    .await
    .map_err(|e| ApiError::internal(format!("worker task failed: {}", e)))?
}

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    email: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnsubscribeRequest {
    email: String,
}

#[derive(Debug, Deserialize)]
struct RegisterDeviceRequest {
    push_token: String,
    platform: Option<String>,
    device_type: Option<String>,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnregisterDeviceRequest {
    push_token: String,
}

#[derive(Debug, Default, Deserialize)]
struct TriggerQuery {
    trigger: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SettingsView {
    threshold_f: f64,
    check_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
struct SettingsUpdate {
    threshold_f: Option<f64>,
    check_interval_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    last_run_at: Option<DateTime<Utc>>,
    last_run_status: Option<String>,
    /// Derived from the last run: did the weather provider return anything.
    weather_reachable: Option<bool>,
    subscribers: i64,
    active_devices: i64,
    pending_push_receipts: i64,
}

async fn subscribe(
    State(state): State<AppState>,
    Json(req): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let mailer = Arc::clone(&state.mailer);
    let threshold_f = state.settings.snapshot().threshold_f;
    let subscriber = with_conn(&state, move |conn| {
        let subscriber = registry::subscribe(conn, &req.email, req.location.as_deref())?;
        // Welcome email is best-effort; a bounce must not undo the signup.
        let body = mailer::welcome_body(&subscriber.location, threshold_f);
        if let Err(e) = mailer.send(&subscriber.email, &mailer::welcome_subject(), &body) {
            warn!("Welcome email to {} failed: {}", subscriber.email, e);
        }
        Ok(subscriber)
    })
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "message": "Successfully subscribed to temperature notifications",
            "email": subscriber.email,
        })),
    ))
}

async fn unsubscribe(
    State(state): State<AppState>,
    Json(req): Json<UnsubscribeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let email = req.email.clone();
    with_conn(&state, move |conn| Ok(registry::unsubscribe(conn, &req.email)?)).await?;
    Ok(Json(serde_json::json!({
        "message": "Successfully unsubscribed from temperature notifications",
        "email": email,
    })))
}

async fn list_subscribers(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let subscribers = with_conn(&state, |conn| {
        registry::list_subscribers(conn).map_err(ApiError::internal)
    })
    .await?;
    Ok(Json(serde_json::json!({
        "count": subscribers.len(),
        "subscribers": subscribers,
    })))
}

async fn register_device(
    State(state): State<AppState>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.push_token.trim().is_empty() {
        return Err(ApiError::bad_request("push_token is required"));
    }
    let device = with_conn(&state, move |conn| {
        let row = NewDevice {
            push_token: req.push_token.trim().to_string(),
            platform: req.platform,
            device_type: req.device_type,
            location: req
                .location
                .as_deref()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .unwrap_or("auto")
                .to_string(),
        };
        Ok(registry::register_device(conn, row)?)
    })
    .await?;
    Ok(Json(serde_json::json!({
        "message": "Device registered for push notifications",
        "push_token": device.push_token,
        "location": device.location,
    })))
}

async fn unregister_device(
    State(state): State<AppState>,
    Json(req): Json<UnregisterDeviceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let updated = with_conn(&state, move |conn| Ok(registry::unregister_device(conn, &req.push_token)?)).await?;
    Ok(Json(serde_json::json!({
        "message": "Device unregistered",
        "deactivated": updated,
    })))
}

async fn admin_delete_device(
    State(state): State<AppState>,
    Path(push_token): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = with_conn(&state, move |conn| Ok(registry::delete_device(conn, &push_token)?)).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

async fn check_temperatures(
    State(state): State<AppState>,
    Query(params): Query<TriggerQuery>,
) -> Result<Json<RunReport>, ApiError> {
    let trigger = match params.trigger.as_deref() {
        None | Some("http") => trigger_type::HTTP,
        Some("test") => trigger_type::TEST,
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "unknown trigger '{}'; expected http or test",
                other
            )))
        }
    }
    .to_string();

    let weather = Arc::clone(&state.weather);
    let mailer = Arc::clone(&state.mailer);
    let push = Arc::clone(&state.push);
    let settings = state.settings.snapshot();
    let historical_years = state.historical_years;
    let report = with_conn(&state, move |conn| {
        Ok(evaluation::run_pass(
            conn,
            &weather,
            &mailer,
            &push,
            settings,
            historical_years,
            &trigger,
        ))
    })
    .await?;
    Ok(Json(report))
}

async fn get_settings(State(state): State<AppState>) -> Json<SettingsView> {
    let snapshot = state.settings.snapshot();
    Json(SettingsView {
        threshold_f: snapshot.threshold_f,
        check_interval_secs: snapshot.check_interval.as_secs(),
    })
}

async fn put_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<SettingsView>, ApiError> {
    let mut candidate = state.settings.snapshot();
    if let Some(threshold_f) = update.threshold_f {
        candidate.threshold_f = threshold_f;
    }
    if let Some(secs) = update.check_interval_secs {
        candidate.check_interval = Duration::from_secs(secs);
    }

    let applied = state.settings.update(candidate).map_err(ApiError::unprocessable)?;
    info!(
        "Settings updated: threshold={}°F, interval={}s",
        applied.threshold_f,
        applied.check_interval.as_secs()
    );
    Ok(Json(SettingsView {
        threshold_f: applied.threshold_f,
        check_interval_secs: applied.check_interval.as_secs(),
    }))
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let response = with_conn(&state, |conn| {
        let last_run = evaluation::latest_run(conn).map_err(ApiError::internal)?;
        let subscribers = registry::subscriber_count(conn).map_err(ApiError::internal)?;
        let active_devices = registry::active_device_count(conn).map_err(ApiError::internal)?;
        let pending_push_receipts = receipts::pending_receipt_count(conn).map_err(ApiError::internal)?;

        let weather_reachable = last_run.as_ref().map(|run| {
            run.temperatures_found
                .as_object()
                .map(|m| !m.is_empty())
                .unwrap_or(false)
        });

        Ok(HealthResponse {
            status: "ok",
            last_run_at: last_run.as_ref().map(|run| run.created_at),
            last_run_status: last_run.map(|run| run.status),
            weather_reachable,
            subscribers,
            active_devices,
            pending_push_receipts,
        })
    })
    .await?;
    Ok(Json(response))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/subscribe", post(subscribe))
        .route("/api/unsubscribe", post(unsubscribe))
        .route("/api/subscribers", get(list_subscribers))
        .route("/api/devices", post(register_device))
        .route("/api/devices/unregister", post(unregister_device))
        .route("/api/admin/devices/:push_token", delete(admin_delete_device))
        .route("/api/check-temperatures", post(check_temperatures))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/health", get(health))
        .with_state(state)
}

/// Serve the control surface until Ctrl-C, then trip the shared shutdown
/// latch so the background loops stop too. Runs its own tokio runtime and
/// blocks the calling thread.
pub fn run_blocking(state: AppState, listen_addr: &str, shutdown: Arc<Shutdown>) -> Result<(), String> {
    let runtime = tokio::runtime::Runtime::new().map_err(|e| format!("tokio runtime init failed: {}", e))?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(listen_addr)
            .await
            .map_err(|e| format!("bind {} failed: {}", listen_addr, e))?;
        info!("HTTP control surface listening on {}", listen_addr);

        let signal_shutdown = Arc::clone(&shutdown);
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move {
                if tokio::signal::ctrl_c().await.is_err() {
                    warn!("Ctrl-C handler unavailable; running until killed");
                    std::future::pending::<()>().await;
                }
                info!("Shutdown signal received");
                signal_shutdown.trigger();
            })
            .await
            .map_err(|e| format!("http server failed: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_update_payload_allows_partial_fields() {
        let update: SettingsUpdate = serde_json::from_str(r#"{"threshold_f": 10.0}"#).unwrap();
        assert_eq!(update.threshold_f, Some(10.0));
        assert!(update.check_interval_secs.is_none());

        let update: SettingsUpdate = serde_json::from_str(r#"{"check_interval_secs": 7200}"#).unwrap();
        assert_eq!(update.check_interval_secs, Some(7200));
    }

    #[test]
    fn settings_view_round_trips() {
        let view = SettingsView {
            threshold_f: 1.0,
            check_interval_secs: 3600,
        };
        let json = serde_json::to_string(&view).unwrap();
        let back: SettingsView = serde_json::from_str(&json).unwrap();
        assert_eq!(back.threshold_f, 1.0);
        assert_eq!(back.check_interval_secs, 3600);
    }
}
