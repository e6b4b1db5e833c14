//! Fleet event types broadcast over WebSocket

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type")]
pub enum FleetEvent {
    TaskQueued {
        task_id: Uuid,
        machine: String,
        action: String,
    },
    TaskStateChanged {
        task_id: Uuid,
        machine: String,
        from: String,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    MachineStatusChanged {
        machine: String,
        from: String,
        to: String,
    },
    ReservationChanged {
        machine: String,
        owner: Option<String>,
    },
}

impl FleetEvent {
    /// Machine the event refers to
    #[must_use]
    pub fn machine(&self) -> &str {
        match self {
            FleetEvent::TaskQueued { machine, .. }
            | FleetEvent::TaskStateChanged { machine, .. }
            | FleetEvent::MachineStatusChanged { machine, .. }
            | FleetEvent::ReservationChanged { machine, .. } => machine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_is_tagged() {
        let event = FleetEvent::ReservationChanged {
            machine: "m1".to_string(),
            owner: Some("alice".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ReservationChanged");
        assert_eq!(json["owner"], "alice");
    }

    #[test]
    fn test_state_change_omits_missing_error() {
        let event = FleetEvent::TaskStateChanged {
            task_id: Uuid::nil(),
            machine: "m1".to_string(),
            from: "queued".to_string(),
            to: "running".to_string(),
            error: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("error"));
        assert_eq!(event.machine(), "m1");
    }
}
