//! Task inspection and cancellation endpoints

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use orthos_api::responses::{CancelTaskResponse, ErrorResponse, TaskResponse};
use orthos_core::{CoreError, Task, TaskFilter, TaskState};
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::api::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListTasksQuery {
    /// Machine id
    pub machine: Option<String>,
    /// queued, running, succeeded, failed or cancelled
    pub state: Option<String>,
}

impl ListTasksQuery {
    pub(crate) fn filter(&self) -> Result<TaskFilter, CoreError> {
        let states = match self.state.as_deref() {
            Some(name) => vec![name.parse::<TaskState>()?],
            None => Vec::new(),
        };
        Ok(TaskFilter {
            machine_id: self.machine.clone(),
            states,
        })
    }
}

pub(crate) fn task_response(task: &Task) -> TaskResponse {
    TaskResponse {
        id: task.id,
        machine_id: task.machine_id.clone(),
        action: task.action.to_string(),
        requested_by: task.requested_by.clone(),
        enqueued_at: task.enqueued_at,
        state: task.state.to_string(),
        attempts: task.attempts,
        last_error: task.last_error.clone(),
        started_at: task.started_at,
        finished_at: task.finished_at,
    }
}

/// List tasks, oldest first
///
/// # Errors
/// Returns `AppError` for an unknown state name
#[utoipa::path(
    get,
    path = "/tasks",
    tag = "tasks",
    params(ListTasksQuery),
    responses(
        (status = 200, description = "Tasks", body = Vec<TaskResponse>),
        (status = 422, description = "Unknown state", body = ErrorResponse),
    ),
)]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.fleet.list_tasks(&query).await?))
}

/// Get one task
///
/// # Errors
/// Returns `AppError` if the task is unknown
#[utoipa::path(
    get,
    path = "/tasks/{id}",
    tag = "tasks",
    params(("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task", body = TaskResponse),
        (status = 404, description = "Unknown task", body = ErrorResponse),
    ),
)]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.fleet.get_task(id).await?))
}

/// Cancel a task
///
/// Queued tasks are cancelled at once; running tasks stop at the adapter's
/// next safe checkpoint.
///
/// # Errors
/// Returns `AppError` if the task is unknown
#[utoipa::path(
    post,
    path = "/tasks/{id}/cancel",
    tag = "tasks",
    params(("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Cancellation acknowledged", body = CancelTaskResponse),
        (status = 404, description = "Unknown task", body = ErrorResponse),
    ),
)]
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let response = state.fleet.cancel_task(id).await?;
    tracing::info!(task = %id, outcome = %response.outcome, "Cancellation requested");
    Ok(Json(response))
}
