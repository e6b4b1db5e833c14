//! Request types for the API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Action to enqueue against a machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionRequest {
    PowerOn,
    PowerOff,
    PowerCycle,
    ConsoleAttach,
    Provision {
        choice: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system: Option<String>,
    },
    Reserve {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<DateTime<Utc>>,
    },
    Release,
    Rescan,
    Maintenance {
        enabled: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EnqueueTaskRequest {
    pub action: ActionRequest,
    pub requested_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ValidateConfigurationRequest {
    pub architecture: String,
    pub system: String,
}

/// Inventory registration of a machine
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterMachineRequest {
    pub id: String,
    pub fqdn: String,
    pub architecture: String,
    pub system: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmc: Option<String>,
    #[serde(default)]
    pub maintenance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateSystemRequest {
    pub system: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_action_parses_from_kind() {
        let action: ActionRequest = serde_json::from_str(r#"{"kind":"power_cycle"}"#).unwrap();
        assert_eq!(action, ActionRequest::PowerCycle);
    }

    #[test]
    fn test_provision_system_is_optional() {
        let action: ActionRequest =
            serde_json::from_str(r#"{"kind":"provision","choice":"sles-16"}"#).unwrap();
        assert_eq!(
            action,
            ActionRequest::Provision {
                choice: "sles-16".to_string(),
                system: None
            }
        );
    }
}
