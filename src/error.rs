use std::time::Duration;

/// Failures of the dongle command protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Not connected to the broker, or nothing is listening to publish.
    /// Returned immediately, no acknowledgment wait is started.
    #[error("transport unavailable")]
    TransportUnavailable,

    #[error("no response for {key} after {timeout:?}")]
    AcknowledgmentTimeout { key: String, timeout: Duration },

    #[error("dongle rejected {key}")]
    AcknowledgmentRejected { key: String },

    #[error("sequence incomplete, unconfirmed settings: {}", failed.join(", "))]
    SequenceIncomplete { failed: Vec<String> },
}

impl CommandError {
    /// Short reason string used in logs and control-topic replies.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TransportUnavailable => "not connected",
            Self::AcknowledgmentTimeout { .. } => "timeout",
            Self::AcknowledgmentRejected { .. } => "rejected",
            Self::SequenceIncomplete { .. } => "sequence incomplete",
        }
    }
}
