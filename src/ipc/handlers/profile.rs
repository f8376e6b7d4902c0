use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::super::{ConsoleQuery, IPCServer, StatusResponse};
use crate::profile::Profile;
use crate::supervisor::SupervisorError;

/// GET /api/status — snapshot of every profile, in load order
pub async fn status_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    Json(StatusResponse {
        profiles: state.supervisor.snapshot_all(),
    })
}

/// GET /api/profiles
pub async fn list_profiles(State(state): State<IPCServer>) -> impl IntoResponse {
    Json(state.supervisor.profiles())
}

/// POST /api/profiles
pub async fn create_profile(
    State(state): State<IPCServer>,
    Json(profile): Json<Profile>,
) -> Result<impl IntoResponse, SupervisorError> {
    let added = state.supervisor.add_profile(profile).await?;
    Ok((StatusCode::CREATED, Json(added)))
}

/// GET /api/profile/:name
pub async fn get_profile(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let profile = state.supervisor.profile(&name)?;
    let snapshot = state.supervisor.snapshot(&name)?;
    Ok(Json(json!({ "profile": profile, "status": snapshot })))
}

/// PUT /api/profile/:name — only while the profile is idle
pub async fn update_profile(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(profile): Json<Profile>,
) -> Result<impl IntoResponse, SupervisorError> {
    let updated = state.supervisor.update_profile(&name, profile).await?;
    Ok(Json(updated))
}

/// DELETE /api/profile/:name — only while the profile is idle
pub async fn delete_profile(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let removed = state.supervisor.remove_profile(&name).await?;
    Ok(Json(json!({ "success": true, "removed": removed })))
}

/// POST /api/profile/:name/start
pub async fn start_profile_handler(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let snapshot = state.supervisor.start_profile(&name).await?;
    Ok(Json(snapshot))
}

/// POST /api/profile/:name/stop — returns once the stop has been initiated
pub async fn stop_profile_handler(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let request = state.supervisor.stop_profile(&name).await?;
    Ok((StatusCode::ACCEPTED, Json(request)))
}

/// POST /api/profile/:name/restart
pub async fn restart_profile_handler(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let snapshot = state.supervisor.restart_profile(&name).await?;
    Ok(Json(snapshot))
}

/// GET /api/profile/:name/usage
pub async fn usage_handler(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let usage = state.supervisor.resource_usage(&name).await?;
    Ok(Json(usage))
}

/// GET /api/profile/:name/console?since=0&count=100
pub async fn console_handler(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Query(query): Query<ConsoleQuery>,
) -> Result<impl IntoResponse, SupervisorError> {
    let lines = state
        .supervisor
        .recent_output(&name, query.since, query.count)?;
    Ok(Json(json!({ "lines": lines })))
}
