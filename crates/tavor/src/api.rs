//! Endpoint paths and JSON shapes of the sandbox service API.

use crate::config::SandboxConfig;
use crate::models::{CommandResult, CommandStatus, SandboxId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Collection endpoint for sandboxes.
pub const BOXES_PATH: &str = "/api/v2/boxes";

/// Path of a single sandbox (also the command queue endpoint).
pub fn box_path(id: &SandboxId) -> String {
    format!("{BOXES_PATH}/{id}")
}

/// Path of a queued command.
pub fn command_path(id: &SandboxId, command_id: &str) -> String {
    format!("{BOXES_PATH}/{id}/commands/{command_id}")
}

/// Path of the pause action.
pub fn pause_path(id: &SandboxId) -> String {
    format!("{BOXES_PATH}/{id}/pause")
}

/// Path of the resume action.
pub fn resume_path(id: &SandboxId) -> String {
    format!("{BOXES_PATH}/{id}/resume")
}

/// Path of the port exposure action.
pub fn expose_port_path(id: &SandboxId) -> String {
    format!("{BOXES_PATH}/{id}/expose_port")
}

/// `{"data": ...}` wrapper used by read endpoints.
#[derive(Debug, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

/// List responses may omit `data` entirely when empty.
#[derive(Debug, Deserialize)]
pub struct ListEnvelope<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

/// Body of `POST /api/v2/boxes`. Unset fields are left to the service.
#[derive(Debug, Serialize, PartialEq)]
pub struct CreateBoxRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mib_ram: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl From<&SandboxConfig> for CreateBoxRequest {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            cpu: config.cpu,
            mib_ram: config.mib_ram,
            timeout: config.timeout,
            metadata: config.metadata.clone().filter(|m| !m.is_empty()),
        }
    }
}

/// Response of `POST /api/v2/boxes`.
#[derive(Debug, Deserialize)]
pub struct CreateBoxResponse {
    pub id: SandboxId,
}

/// Body of the command queue request.
#[derive(Debug, Serialize)]
pub struct QueueCommandRequest<'a> {
    pub command: &'a str,
    pub stream: bool,
}

/// Response of the command queue request.
#[derive(Debug, Deserialize)]
pub struct QueuedCommand {
    pub id: String,
}

/// Body of the port exposure request.
#[derive(Debug, Serialize)]
pub struct ExposePortRequest {
    pub port: u16,
}

/// Command state as returned by `GET .../commands/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRecord {
    pub id: String,
    #[serde(default)]
    pub command: Option<String>,
    pub status: CommandStatus,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl CommandRecord {
    /// Convert a terminal record into a result.
    pub fn into_result(self, command: &str) -> CommandResult {
        let exit_code = self
            .exit_code
            .unwrap_or_else(|| self.status.implied_exit_code());
        CommandResult {
            id: self.id,
            command: self.command.unwrap_or_else(|| command.to_owned()),
            status: self.status,
            stdout: self.stdout.unwrap_or_default(),
            stderr: self.stderr.unwrap_or_default(),
            exit_code: Some(exit_code),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

/// Payload of the `start` stream event.
#[derive(Debug, Deserialize)]
pub struct StreamStart {
    #[serde(default)]
    pub command_id: Option<String>,
}

/// Payload of the `output` stream event.
#[derive(Debug, Deserialize)]
pub struct StreamOutput {
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}

/// Payload of the `status` stream event.
#[derive(Debug, Deserialize)]
pub struct StreamStatus {
    pub status: CommandStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Payload of the `end` stream event.
#[derive(Debug, Deserialize)]
pub struct StreamEnd {
    pub status: String,
}

/// Payload of the `error` stream event.
#[derive(Debug, Deserialize)]
pub struct StreamError {
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id() -> SandboxId {
        SandboxId::new("box-456").unwrap()
    }

    #[test]
    fn test_paths() {
        assert_eq!(box_path(&id()), "/api/v2/boxes/box-456");
        assert_eq!(command_path(&id(), "c1"), "/api/v2/boxes/box-456/commands/c1");
        assert_eq!(pause_path(&id()), "/api/v2/boxes/box-456/pause");
        assert_eq!(resume_path(&id()), "/api/v2/boxes/box-456/resume");
        assert_eq!(expose_port_path(&id()), "/api/v2/boxes/box-456/expose_port");
    }

    #[test]
    fn test_create_request_skips_unset_fields() {
        let body = serde_json::to_value(CreateBoxRequest::from(&SandboxConfig::default())).unwrap();
        assert_eq!(body, json!({"timeout": 600}));

        let config = SandboxConfig::builder()
            .cpu(2)
            .mib_ram(2048)
            .metadata("language", "rust")
            .build()
            .unwrap();
        let body = serde_json::to_value(CreateBoxRequest::from(&config)).unwrap();
        assert_eq!(
            body,
            json!({"cpu": 2, "mib_ram": 2048, "timeout": 600, "metadata": {"language": "rust"}})
        );
    }

    #[test]
    fn test_command_record_exit_code_rules() {
        let record: CommandRecord = serde_json::from_value(json!({
            "id": "c1",
            "status": "done",
            "stdout": "hi\n",
            "finished_at": "2026-01-01T00:00:05Z"
        }))
        .unwrap();
        let result = record.into_result("echo hi");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(
            result.finished_at.map(|t| t.to_rfc3339()),
            Some("2026-01-01T00:00:05+00:00".to_string())
        );
        assert_eq!(result.command, "echo hi");
        assert_eq!(result.stderr, "");
        assert!(result.success());

        let record: CommandRecord = serde_json::from_value(
            json!({"id": "c2", "command": "false", "status": "failed", "stderr": null}),
        )
        .unwrap();
        assert_eq!(record.into_result("ignored").exit_code, Some(1));

        let record: CommandRecord =
            serde_json::from_value(json!({"id": "c3", "status": "failed", "exit_code": 127}))
                .unwrap();
        assert_eq!(record.into_result("nope").exit_code, Some(127));
    }

    #[test]
    fn test_list_envelope_defaults_to_empty() {
        let list: ListEnvelope<serde_json::Value> = serde_json::from_str("{}").unwrap();
        assert!(list.data.is_empty());
    }
}
