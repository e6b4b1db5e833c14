//! Health, compatibility and statistics endpoints

use std::sync::Arc;

use axum::{Json, extract::State};
use orthos_api::requests::ValidateConfigurationRequest;
use orthos_api::responses::{
    ArchitectureCounts, ArchitectureEntry, ErrorResponse, HealthResponse, StatisticsResponse,
    ValidationResponse,
};
use orthos_core::compat::allowed_systems_by_name;
use orthos_core::{Architecture, Engine, FleetStatistics, allowed_systems};

use crate::api::error::AppError;
use crate::state::AppState;

/// Liveness and process role
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    responses((status = 200, description = "Daemon is up", body = HealthResponse)),
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        mode: state.mode.to_string(),
    })
}

/// Check an architecture/system pair without touching any machine
#[utoipa::path(
    post,
    path = "/validate",
    tag = "system",
    request_body = ValidateConfigurationRequest,
    responses((status = 200, description = "Compatibility verdict", body = ValidationResponse)),
)]
pub async fn validate(Json(req): Json<ValidateConfigurationRequest>) -> Json<ValidationResponse> {
    Json(ValidationResponse {
        compatible: Engine::validate_configuration(&req.architecture, &req.system),
        allowed: allowed_systems_by_name(&req.architecture)
            .iter()
            .map(ToString::to_string)
            .collect(),
    })
}

/// The full architecture to system class map
#[utoipa::path(
    get,
    path = "/architectures",
    tag = "system",
    responses((status = 200, description = "Compatibility map", body = Vec<ArchitectureEntry>)),
)]
pub async fn architectures() -> Json<Vec<ArchitectureEntry>> {
    Json(
        Architecture::ALL
            .into_iter()
            .map(|architecture| ArchitectureEntry {
                architecture: architecture.to_string(),
                systems: allowed_systems(architecture)
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            })
            .collect(),
    )
}

fn counts(architecture: &str, counts: orthos_core::ArchitectureCounts) -> ArchitectureCounts {
    ArchitectureCounts {
        architecture: architecture.to_string(),
        total: counts.total,
        free: counts.free,
        reachable: counts.reachable,
        reserved_unlimited: counts.reserved_unlimited,
    }
}

/// Per-architecture fleet counts
#[utoipa::path(
    get,
    path = "/statistics",
    tag = "system",
    responses(
        (status = 200, description = "Fleet statistics", body = StatisticsResponse),
        (status = 502, description = "Taskmanager unreachable", body = ErrorResponse),
    ),
)]
pub async fn statistics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatisticsResponse>, AppError> {
    Ok(Json(state.fleet.statistics().await?))
}

pub(crate) fn statistics_response(stats: FleetStatistics) -> StatisticsResponse {
    StatisticsResponse {
        per_architecture: stats
            .per_architecture
            .into_iter()
            .map(|(architecture, c)| counts(architecture.as_str(), c))
            .collect(),
        total: counts("total", stats.total),
    }
}
