use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::warn;

use super::{
    error::{AppError, WriteError},
    models::{Activity, ActivityPatch, ManyActivities, NewActivity, SearchFilters},
    state::{CatalogState, SearchState},
    utils::parse_ids,
};

#[derive(Deserialize)]
pub struct IdsQuery {
    #[serde(default)]
    ids: String,
}

#[derive(Deserialize)]
pub struct EnrollmentRequest {
    #[serde(default)]
    participant: String,
}

fn malformed<E: std::fmt::Display>(rejection: E) -> AppError {
    warn!("Rejected request: {rejection}");
    AppError::MalformedPayload
}

pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn list_activities_handler(
    State(state): State<Arc<CatalogState>>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.coordinator.list().await?))
}

pub async fn many_activities_handler(
    State(state): State<Arc<CatalogState>>,
    Query(query): Query<IdsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let ids = parse_ids(&query.ids);
    let activities: Vec<_> = state
        .coordinator
        .get_many(&ids)
        .await?
        .iter()
        .map(Activity::to_document)
        .collect();

    Ok(Json(ManyActivities {
        count: activities.len(),
        activities,
    }))
}

pub async fn statistics_handler(
    State(state): State<Arc<CatalogState>>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.coordinator.statistics().await?))
}

pub async fn create_activity_handler(
    State(state): State<Arc<CatalogState>>,
    payload: Result<Json<NewActivity>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(input) = payload.map_err(malformed)?;
    let activity = state.coordinator.create(&input).await?;

    Ok((StatusCode::CREATED, Json(activity)))
}

pub async fn get_activity_handler(
    State(state): State<Arc<CatalogState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.coordinator.get(&id).await?))
}

pub async fn update_activity_handler(
    State(state): State<Arc<CatalogState>>,
    Path(id): Path<String>,
    payload: Result<Json<ActivityPatch>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(patch) = payload.map_err(malformed)?;

    Ok(Json(state.coordinator.update(&id, &patch).await?))
}

pub async fn delete_activity_handler(
    State(state): State<Arc<CatalogState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.coordinator.delete(&id).await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn enroll_handler(
    State(state): State<Arc<CatalogState>>,
    Path(id): Path<String>,
    payload: Result<Json<EnrollmentRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload.map_err(malformed)?;

    Ok(Json(
        state.coordinator.enroll(&id, &request.participant).await?,
    ))
}

pub async fn unenroll_handler(
    State(state): State<Arc<CatalogState>>,
    Path(id): Path<String>,
    payload: Result<Json<EnrollmentRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload.map_err(malformed)?;

    Ok(Json(
        state.coordinator.unenroll(&id, &request.participant).await?,
    ))
}

pub async fn enrollments_handler(
    State(state): State<Arc<CatalogState>>,
    Path(participant): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.coordinator.enrollments_of(&participant).await?))
}

pub async fn search_handler(
    State(state): State<Arc<SearchState>>,
    filters: Result<Query<SearchFilters>, QueryRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Query(filters) = filters.map_err(malformed)?;

    Ok(Json(state.read_path.list(&filters).await?))
}

pub async fn search_by_id_handler(
    State(state): State<Arc<SearchState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let document = state
        .read_path
        .get_by_id(&id)
        .await?
        .ok_or(WriteError::NotFound)?;

    Ok(Json(document))
}
