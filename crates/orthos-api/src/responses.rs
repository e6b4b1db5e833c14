//! Response types for the API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Pagination {
    pub page: u64,
    pub per_page: u64,
    pub total_items: u64,
    pub total_pages: u64,
}

/// Error body returned with every non-2xx status
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Machine-readable code, e.g. `VALIDATION_FAILED`
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReservationInfo {
    pub owner: String,
    pub reason: String,
    pub reserved_at: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
}

/// Read-only machine snapshot
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MachineResponse {
    pub id: String,
    pub fqdn: String,
    pub architecture: String,
    pub system: String,
    /// Last probed or administrative status
    pub status: String,
    /// Status as shown to operators (reservation and maintenance applied)
    pub effective_status: String,
    pub reservation: Option<ReservationInfo>,
    pub has_remote_power: bool,
    pub last_probed: Option<DateTime<Utc>>,
    pub last_probe_detail: Option<String>,
    pub last_successful_action: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskResponse {
    pub id: Uuid,
    pub machine_id: String,
    pub action: String,
    pub requested_by: String,
    pub enqueued_at: DateTime<Utc>,
    pub state: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EnqueueTaskResponse {
    pub task_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CancelTaskResponse {
    pub task_id: Uuid,
    /// `cancelled`, `cancellation_requested` or `already_finished`
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ValidationResponse {
    pub compatible: bool,
    pub allowed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ArchitectureEntry {
    pub architecture: String,
    pub systems: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReservationRecordResponse {
    pub owner: String,
    pub reason: String,
    pub reserved_at: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
    pub released_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ArchitectureCounts {
    pub architecture: String,
    pub total: u64,
    pub free: u64,
    pub reachable: u64,
    pub reserved_unlimited: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatisticsResponse {
    pub per_architecture: Vec<ArchitectureCounts>,
    pub total: ArchitectureCounts,
}
