use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Per-request state. Only `Committed` mutates persisted model state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Compiling,
    Generating,
    Executing,
    Committed,
    Rejected,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Compiling => "compiling",
            Self::Generating => "generating",
            Self::Executing => "executing",
            Self::Committed => "committed",
            Self::Rejected => "rejected",
        }
    }
}

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    StageChanged {
        request_id: Uuid,
        stage: Stage,
        #[serde(skip_serializing_if = "Option::is_none")]
        model_id: Option<i64>,
    },
    VersionCommitted {
        request_id: Uuid,
        model_id: i64,
        seq: i64,
    },
    RequestRejected {
        request_id: Uuid,
        kind: String,
        message: String,
    },
    ChatReplied {
        request_id: Uuid,
        conversation_id: Uuid,
    },
}

/// A serialized [`WsMessage`] and the owner allowed to see it.
#[derive(Debug, Clone)]
pub struct OwnedEvent {
    pub owner: String,
    pub payload: String,
}

pub type EventSender = broadcast::Sender<OwnedEvent>;

/// Serialize and broadcast a WsMessage on behalf of `owner`. Only that
/// owner's sockets forward it. Returns silently even if no clients are
/// connected.
pub fn broadcast_message(tx: &EventSender, owner: &str, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(payload) => {
            let _ = tx.send(OwnedEvent {
                owner: owner.to_string(),
                payload,
            });
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize WsMessage");
        }
    }
}
