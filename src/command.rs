use crate::prelude::*;

use serde::Serialize;

/// Requests accepted on the `{namespace}/cmd/...` control topics.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetSchedule(ScheduleRequest),
    GetSchedule,
    CancelSchedule,
    EnableCharging(u8),
    DisableCharging,
    Status,
}

impl Command {
    pub fn to_result_topic(&self, namespace: &str) -> String {
        use Command::*;

        let rest = match self {
            SetSchedule(_) => "schedule/set",
            GetSchedule => "schedule/get",
            CancelSchedule => "schedule/cancel",
            EnableCharging(_) => "charging/enable",
            DisableCharging => "charging/disable",
            Status => "status",
        };

        format!("{}/result/{}", namespace, rest)
    }
}

/// Body published on a result topic.
#[derive(Debug, Clone, Serialize)]
pub struct CommandReply {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandReply {
    pub fn ok(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    pub fn to_message(&self, command: &Command, namespace: &str) -> Result<mqtt::Message> {
        Ok(mqtt::Message {
            topic: command.to_result_topic(namespace),
            retain: false,
            payload: serde_json::to_string(self)?,
        })
    }
}
