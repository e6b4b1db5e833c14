//! Machine inventory and task submission endpoints

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use orthos_api::requests::{
    ActionRequest, EnqueueTaskRequest, RegisterMachineRequest, UpdateSystemRequest,
};
use orthos_api::responses::{
    EnqueueTaskResponse, ErrorResponse, MachineResponse, PaginatedResponse, Pagination,
    ReservationInfo, ReservationRecordResponse,
};
use orthos_core::{
    Architecture, CoreError, Machine, MachineFilter, MachineStatus, ReservationRecord,
    SystemClass, TaskAction,
};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::api::error::AppError;
use crate::state::AppState;

/// Query parameters for listing machines
#[derive(Debug, Deserialize, IntoParams)]
pub struct ListMachinesQuery {
    /// Page number (1-indexed)
    #[serde(default = "default_page")]
    pub page: u64,
    /// Items per page
    #[serde(default = "default_per_page")]
    pub per_page: u64,
    /// Architecture name, e.g. `x86_64`
    pub arch: Option<String>,
    /// Effective status
    pub status: Option<String>,
    /// Reservation holder
    pub reserved_by: Option<String>,
    /// Only unreserved machines outside maintenance
    #[serde(default)]
    pub free: bool,
    /// Case-insensitive fqdn substring
    pub q: Option<String>,
}

fn default_page() -> u64 {
    1
}

fn default_per_page() -> u64 {
    50
}

impl ListMachinesQuery {
    pub(crate) fn filter(&self) -> Result<MachineFilter, CoreError> {
        Ok(MachineFilter {
            architecture: self
                .arch
                .as_deref()
                .map(str::parse::<Architecture>)
                .transpose()?,
            status: self
                .status
                .as_deref()
                .map(str::parse::<MachineStatus>)
                .transpose()?,
            reserved_by: self.reserved_by.clone(),
            free_only: self.free,
            query: self.q.clone(),
        })
    }

    /// The requested page of an already filtered list
    pub(crate) fn page_of(&self, machines: &[Machine]) -> PaginatedResponse<MachineResponse> {
        let total_items = machines.len() as u64;
        let data = machines
            .iter()
            .skip(usize::try_from((self.page - 1) * self.per_page).unwrap_or(usize::MAX))
            .take(usize::try_from(self.per_page).unwrap_or(usize::MAX))
            .map(machine_response)
            .collect();
        PaginatedResponse {
            data,
            pagination: Pagination {
                page: self.page,
                per_page: self.per_page,
                total_items,
                total_pages: total_items.div_ceil(self.per_page),
            },
        }
    }
}

pub(crate) fn machine_response(machine: &Machine) -> MachineResponse {
    let now = Utc::now();
    MachineResponse {
        id: machine.id.clone(),
        fqdn: machine.fqdn.clone(),
        architecture: machine.architecture.to_string(),
        system: machine.system.to_string(),
        status: machine.status.to_string(),
        effective_status: machine.effective_status(now).to_string(),
        reservation: machine.reservation.as_ref().map(|r| ReservationInfo {
            owner: r.owner.clone(),
            reason: r.reason.clone(),
            reserved_at: r.reserved_at,
            until: r.until,
        }),
        has_remote_power: machine.has_remote_power(),
        last_probed: machine.last_probed,
        last_probe_detail: machine.last_probe_detail.clone(),
        last_successful_action: machine.last_successful_action,
    }
}

pub(crate) fn record_response(record: ReservationRecord) -> ReservationRecordResponse {
    ReservationRecordResponse {
        owner: record.owner,
        reason: record.reason,
        reserved_at: record.reserved_at,
        until: record.until,
        released_at: record.released_at,
    }
}

/// Wire action to engine action; system names are parsed here
pub(crate) fn task_action(action: ActionRequest) -> Result<TaskAction, CoreError> {
    Ok(match action {
        ActionRequest::PowerOn => TaskAction::PowerOn,
        ActionRequest::PowerOff => TaskAction::PowerOff,
        ActionRequest::PowerCycle => TaskAction::PowerCycle,
        ActionRequest::ConsoleAttach => TaskAction::ConsoleAttach,
        ActionRequest::Provision { choice, system } => TaskAction::Provision {
            choice,
            system: system.as_deref().map(str::parse::<SystemClass>).transpose()?,
        },
        ActionRequest::Reserve { reason, until } => TaskAction::Reserve { reason, until },
        ActionRequest::Release => TaskAction::Release,
        ActionRequest::Rescan => TaskAction::Rescan,
        ActionRequest::Maintenance { enabled } => TaskAction::SetMaintenance { enabled },
    })
}

/// List machines
///
/// # Errors
/// Returns `AppError` for unknown filter values or a zero page size
#[utoipa::path(
    get,
    path = "/machines",
    tag = "machines",
    params(ListMachinesQuery),
    responses(
        (status = 200, description = "Page of machines", body = PaginatedResponse<MachineResponse>),
        (status = 422, description = "Unknown filter value", body = ErrorResponse),
    ),
)]
pub async fn list_machines(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListMachinesQuery>,
) -> Result<impl IntoResponse, AppError> {
    if query.page == 0 || query.per_page == 0 {
        return Err(AppError::bad_request("page and per_page start at 1"));
    }
    Ok(Json(state.fleet.list_machines(&query).await?))
}

/// Register a machine
///
/// # Errors
/// Returns `AppError` if the pair is incompatible or the id is taken
#[utoipa::path(
    post,
    path = "/machines",
    tag = "machines",
    request_body = RegisterMachineRequest,
    responses(
        (status = 201, description = "Machine registered", body = MachineResponse),
        (status = 409, description = "Id already registered", body = ErrorResponse),
        (status = 422, description = "Incompatible architecture and system", body = ErrorResponse),
    ),
)]
pub async fn register_machine(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterMachineRequest>,
) -> Result<impl IntoResponse, AppError> {
    let response = state.fleet.register_machine(req).await?;
    tracing::info!(machine = %response.id, "Machine registered");
    Ok((StatusCode::CREATED, Json(response)))
}

/// Get one machine
///
/// # Errors
/// Returns `AppError` if the machine is unknown
#[utoipa::path(
    get,
    path = "/machines/{id}",
    tag = "machines",
    params(("id" = String, Path, description = "Machine id")),
    responses(
        (status = 200, description = "Machine", body = MachineResponse),
        (status = 404, description = "Unknown machine", body = ErrorResponse),
    ),
)]
pub async fn get_machine(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.fleet.get_machine(&id).await?))
}

/// Change a machine's system class
///
/// # Errors
/// Returns `AppError` if the machine is unknown or the system incompatible
#[utoipa::path(
    put,
    path = "/machines/{id}/system",
    tag = "machines",
    params(("id" = String, Path, description = "Machine id")),
    request_body = UpdateSystemRequest,
    responses(
        (status = 200, description = "Updated machine", body = MachineResponse),
        (status = 404, description = "Unknown machine", body = ErrorResponse),
        (status = 422, description = "Incompatible system", body = ErrorResponse),
    ),
)]
pub async fn update_system(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateSystemRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.fleet.update_system(&id, &req.system).await?))
}

/// Released reservations, oldest first
///
/// # Errors
/// Returns `AppError` if the machine is unknown
#[utoipa::path(
    get,
    path = "/machines/{id}/history",
    tag = "machines",
    params(("id" = String, Path, description = "Machine id")),
    responses(
        (status = 200, description = "Reservation history", body = Vec<ReservationRecordResponse>),
        (status = 404, description = "Unknown machine", body = ErrorResponse),
    ),
)]
pub async fn machine_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.fleet.machine_history(&id).await?))
}

/// Queue an action against a machine
///
/// # Errors
/// Returns `AppError` if the request fails admission
#[utoipa::path(
    post,
    path = "/machines/{id}/tasks",
    tag = "tasks",
    params(("id" = String, Path, description = "Machine id")),
    request_body = EnqueueTaskRequest,
    responses(
        (status = 202, description = "Task queued", body = EnqueueTaskResponse),
        (status = 404, description = "Unknown machine", body = ErrorResponse),
        (status = 409, description = "Reserved by someone else", body = ErrorResponse),
        (status = 422, description = "Rejected before queueing", body = ErrorResponse),
    ),
)]
pub async fn enqueue_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<EnqueueTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    let queued = state.fleet.enqueue_task(&id, req).await?;
    Ok((StatusCode::ACCEPTED, Json(queued)))
}
