//! Wire protocol for the agent↔broker WebSocket.
//!
//! `Envelope` is `{id, type, payload}`; `GatewayMessage` is the adjacently
//! tagged payload, flattened into the envelope so the wire shape stays flat
//! rather than nesting a `payload` object one level deeper than necessary
//! on the Rust side only.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{JobId, ProcessedMessageId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    #[serde(flatten)]
    pub message: GatewayMessage,
}

impl Envelope {
    pub fn new(message: GatewayMessage) -> Self {
        Self { id: Uuid::new_v4(), message }
    }
}

/// Broker→agent and agent→broker frame payloads. Unknown `type` values
/// fail to deserialize into this enum; callers catch that at the raw-JSON
/// level and log+drop rather than closing the socket (see
/// [`super::read_loop`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// B→A: first message of a new job.
    StartConversation {
        message: String,
        processed_message_id: ProcessedMessageId,
        link: Option<String>,
        job_id: JobId,
    },
    /// B→A: a subsequent message dispatched to an already-assigned agent.
    UserMessage {
        message: String,
        processed_message_id: ProcessedMessageId,
        link: Option<String>,
        job_id: JobId,
    },
    /// B→A: the job this agent held has been unassigned (reclaim, manual
    /// completion, or idle reap); the agent must stop working on it.
    JobUnassigned { job_id: JobId },

    /// A→B: the agent's reply, posted back into the thread.
    AssistantMessage {
        job_id: JobId,
        processed_message_id: ProcessedMessageId,
        message: String,
    },
    /// A→B: an out-of-band system note (errors, diagnostics) from the agent.
    SystemMessage { job_id: JobId, message: String },
    /// A→B: acknowledgement that the agent has started on a message;
    /// flips the reaction to `eyes`.
    ProcessingMessage { processed_message_id: ProcessedMessageId },
    /// A→B: the job is finished; the broker deletes it and posts `reason`.
    JobComplete { job_id: JobId, reason: String },

    /// A↔B: heartbeat.
    HealthcheckPing,
    HealthcheckAck,

    /// A→B, connect-time only: the gateway needs `ccagent_secret_key` and
    /// `ccagent_id` from *somewhere* to authenticate the upgrade, and a
    /// first-frame envelope keeps that uniform with the rest of the
    /// protocol instead of a bespoke header scheme.
    Hello {
        ccagent_secret_key: String,
        ccagent_id: String,
        repo_url: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_with_flattened_type_and_payload() {
        let env = Envelope::new(GatewayMessage::JobUnassigned { job_id: JobId::generate() });
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "job_unassigned");
        assert!(json["payload"]["job_id"].is_string());
        assert!(json["id"].is_string());
    }

    #[test]
    fn healthcheck_variants_have_no_payload_fields() {
        let env = Envelope::new(GatewayMessage::HealthcheckPing);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "healthcheck_ping");
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = serde_json::json!({"id": Uuid::new_v4(), "type": "not_a_real_tag", "payload": {}});
        let parsed: Result<Envelope, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }
}
