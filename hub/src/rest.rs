use crate::auth::{self, TokenSigner};
use crate::db;
use crate::errors::Error;
use crate::ingest;
use crate::metrics::HTTP_INGEST_TOTAL;
use crate::model::{DataPoint, Device, ReadingIn, TokenResponse};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::error;

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    signer: TokenSigner,
}

#[derive(Debug, Deserialize)]
struct DeviceLoginForm {
    device_id: i64,
    device_key: String,
}

#[derive(Debug, Deserialize)]
struct UserLoginForm {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LastParams {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    start: String,
    end: String,
}

pub fn create_router(pool: PgPool, signer: TokenSigner) -> Router {
    let state = AppState { pool, signer };

    Router::new()
        .route("/device/token", post(device_token))
        .route("/users/token", post(user_token))
        .route("/devices/data", post(ingest_reading))
        .route("/devices/:device_id/data/last", get(last_readings))
        .route("/devices/:device_id/data/range", get(range_readings))
        .with_state(state)
}

/// Device login: exchanges the long-lived device key for a short-lived
/// bearer token. The only place the slow hash runs.
async fn device_token(
    State(state): State<AppState>,
    Form(form): Form<DeviceLoginForm>,
) -> Result<Json<TokenResponse>, ApiError> {
    let device = auth::authenticate_device(&state.pool, form.device_id, &form.device_key)
        .await
        // An unknown device id gets the same 401 as a wrong key.
        .map_err(|e| match e {
            Error::NotFound => Error::InvalidCredential,
            e => e,
        })?;

    let token = state.signer.mint_device_token(device.id)?;
    Ok(Json(TokenResponse::bearer(token)))
}

/// Human login for the query endpoints.
async fn user_token(
    State(state): State<AppState>,
    Form(form): Form<UserLoginForm>,
) -> Result<Json<TokenResponse>, ApiError> {
    let user_id = auth::authenticate_user(&state.pool, &form.username, &form.password).await?;
    let token = state.signer.mint_user_token(user_id)?;
    Ok(Json(TokenResponse::bearer(token)))
}

/// HTTP ingestion: verify the bearer token, then run the same ingestion
/// function the broker adapter uses.
async fn ingest_reading(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(reading): Json<ReadingIn>,
) -> Result<Json<DataPoint>, ApiError> {
    let token = bearer_token(&headers)?;
    let device_id = state.signer.verify_device_token(token)?;

    let record = ingest::ingest(&state.pool, device_id, reading).await?;
    HTTP_INGEST_TOTAL.inc();

    Ok(Json(record))
}

async fn last_readings(
    State(state): State<AppState>,
    Path(device_id): Path<i64>,
    Query(params): Query<LastParams>,
    headers: HeaderMap,
) -> Result<Json<Vec<DataPoint>>, ApiError> {
    authorize_owner(&state, &headers, device_id).await?;

    let limit = params.limit.unwrap_or(10);
    if limit <= 0 {
        return Err(Error::Validation("limit must be a positive integer".to_string()).into());
    }

    let records = db::last_n(&state.pool, device_id, limit).await?;
    Ok(Json(records))
}

async fn range_readings(
    State(state): State<AppState>,
    Path(device_id): Path<i64>,
    Query(params): Query<RangeParams>,
    headers: HeaderMap,
) -> Result<Json<Vec<DataPoint>>, ApiError> {
    authorize_owner(&state, &headers, device_id).await?;

    let (start, end) = parse_range(&params.start, &params.end)?;
    let records = db::range(&state.pool, device_id, start, end).await?;
    Ok(Json(records))
}

/// Ownership gate for the query endpoints: a valid user token alone is not
/// enough, the device must belong to that user. Enforced identically on
/// every telemetry read.
async fn authorize_owner(
    state: &AppState,
    headers: &HeaderMap,
    device_id: i64,
) -> Result<Device, ApiError> {
    let token = bearer_token(headers)?;
    let user_id = state.signer.verify_user_token(token)?;

    let device = db::get_device(&state.pool, device_id)
        .await?
        .ok_or(Error::NotFound)?;

    if device.user_id != user_id {
        return Err(Error::Forbidden.into());
    }

    Ok(device)
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::InvalidToken)?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() => {
            Ok(token)
        }
        _ => Err(Error::InvalidToken.into()),
    }
}

fn parse_range(start: &str, end: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
    let start =
        parse_bound(start).ok_or_else(|| Error::InvalidRange(format!("bad start: {}", start)))?;
    let end = parse_bound(end).ok_or_else(|| Error::InvalidRange(format!("bad end: {}", end)))?;

    if start >= end {
        return Err(Error::InvalidRange("start must be before end".to_string()).into());
    }

    Ok((start, end))
}

/// ISO-8601 bound, with or without an offset. Offset-naive values are
/// taken as UTC.
fn parse_bound(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc())
}

/// Translates the internal failure taxonomy into HTTP signaling. The
/// broker adapter never goes through this; it logs and drops instead.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidCredential | Error::InvalidToken => StatusCode::UNAUTHORIZED,
            Error::Inactive | Error::Forbidden => StatusCode::FORBIDDEN,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::InvalidRange(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("API error: {}", self.0);
            // Internal detail stays in the logs.
            return (status, Json(json!({"detail": "Internal server error"}))).into_response();
        }

        (status, Json(json!({"detail": self.0.to_string()}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers).unwrap(), "abc.def");

        headers.insert("authorization", HeaderValue::from_static("bearer abc.def"));
        assert_eq!(bearer_token(&headers).unwrap(), "abc.def");
    }

    #[test]
    fn test_bearer_token_missing_or_malformed() {
        assert!(bearer_token(&HeaderMap::new()).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_err());

        headers.insert("authorization", HeaderValue::from_static("Bearer "));
        assert!(bearer_token(&headers).is_err());

        headers.insert("authorization", HeaderValue::from_static("token-without-scheme"));
        assert!(bearer_token(&headers).is_err());
    }

    #[test]
    fn test_parse_range_valid() {
        let (start, end) =
            parse_range("2025-07-24T00:00:00Z", "2025-07-25T00:00:00Z").unwrap();
        assert!(start < end);
    }

    #[test]
    fn test_parse_range_offset_naive() {
        let (start, end) =
            parse_range("2025-07-24T00:00:00", "2025-07-25T12:30:00.5").unwrap();
        assert!(start < end);
        // Naive bounds mean UTC, so they agree with their suffixed form
        let (start_z, _) =
            parse_range("2025-07-24T00:00:00Z", "2025-07-25T00:00:00Z").unwrap();
        assert_eq!(start, start_z);
    }

    #[test]
    fn test_parse_range_inverted() {
        assert!(parse_range("2025-07-25T00:00:00Z", "2025-07-24T00:00:00Z").is_err());
        assert!(parse_range("2025-07-24T00:00:00Z", "2025-07-24T00:00:00Z").is_err());
    }

    #[test]
    fn test_parse_range_malformed() {
        assert!(parse_range("yesterday", "2025-07-25T00:00:00Z").is_err());
        assert!(parse_range("2025-07-24T00:00:00Z", "").is_err());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ApiError(Error::InvalidToken).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError(Error::InvalidCredential).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError(Error::Forbidden).status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError(Error::Inactive).status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError(Error::NotFound).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError(Error::InvalidRange("x".to_string())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(Error::Validation("x".to_string())).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError(Error::ChannelSend).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
