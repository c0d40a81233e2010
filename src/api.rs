//! HTTP surface: manual backup triggers and the results listing.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::db::DbPool;
use crate::due;
use crate::error::Error;
use crate::policy::Tier;
use crate::queue::{DispatchRequest, JobQueue, TriggeredBy};
use crate::store::catalog;
use crate::store::results::{self, BackupResult, BackupStatus, ResultFilter};

const DEFAULT_PER_PAGE: i64 = 50;
const MAX_PER_PAGE: i64 = 500;

pub struct AppState {
    pub pool: DbPool,
    pub queue: Arc<dyn JobQueue>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/databases/{id}/tiers/{tier}/trigger", post(trigger_handler))
        .route("/results", get(list_results_handler))
        .with_state(state)
}

/// API error that maps onto a status code and a JSON body.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Policy(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

#[derive(Serialize)]
struct TriggerResponse {
    database_id: String,
    tier: Tier,
    bucket_key: String,
}

/// Manually dispatch a backup for one database tier.
///
/// The scheduler's marker is bypassed; duplicate suppression happens at
/// execution time against the bucket's existing result.
async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    Path((id, tier)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let tier = Tier::from_str(&tier).map_err(ApiError::from)?;

    let db = catalog::get_database(&state.pool, &id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::from(Error::NotFound(format!("database {}", id))))?;

    let now = Utc::now();
    let request = DispatchRequest {
        database_id: db.id.clone(),
        tier,
        bucket_key: due::bucket_key(tier, now),
        triggered_by: TriggeredBy::Manual,
        dispatch_time: now,
    };
    state.queue.enqueue(&request).await.map_err(ApiError::from)?;

    info!("manual trigger accepted for {} {}", db.id, tier);
    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            database_id: db.id,
            tier,
            bucket_key: request.bucket_key,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct ResultsQuery {
    database_id: Option<String>,
    tier: Option<String>,
    status: Option<String>,
    page: Option<i64>,
    per_page: Option<i64>,
}

#[derive(Serialize)]
struct ResultsResponse {
    page: i64,
    per_page: i64,
    results: Vec<BackupResult>,
}

async fn list_results_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<ResultsResponse>, ApiError> {
    let tier = query
        .tier
        .as_deref()
        .map(Tier::from_str)
        .transpose()
        .map_err(ApiError::from)?;
    let status = query
        .status
        .as_deref()
        .map(|s| {
            BackupStatus::parse(s).map_err(|_| ApiError {
                status: StatusCode::BAD_REQUEST,
                message: format!("unknown status: {}", s),
            })
        })
        .transpose()?;

    let page = query.page.unwrap_or(1).max(1);
    let per_page = query
        .per_page
        .unwrap_or(DEFAULT_PER_PAGE)
        .clamp(1, MAX_PER_PAGE);

    let filter = ResultFilter {
        database_id: query.database_id,
        tier,
        status,
        limit: per_page,
        offset: (page - 1) * per_page,
    };
    let rows = results::list_results(&state.pool, &filter)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(ResultsResponse {
        page,
        per_page,
        results: rows,
    }))
}
