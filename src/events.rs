use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{ChatEntry, MediaKind};

/// Ephemeral UI notifications derived from call-state transitions.
/// Consumed and dismissed independently of call logic; never fed back in.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum Notification {
    IncomingCall { caller_name: String, caller_id: String },
    UserJoined { user_id: String },
    UserLeft { user_id: String },
    MediaToggled { user_id: String, media_type: MediaKind, enabled: bool },
    ScreenShareToggled { user_id: String, sharing: bool },
    ConnectionIssue,
    Reconnected,
    NewChatMessage(ChatEntry),
    CallRejected { reason: Option<String> },
    CallEnded { by_remote: bool },
    /// Degraded-capability warning (e.g. mic unavailable, call continues).
    MediaWarning { detail: String },
}

pub type EventSender = broadcast::Sender<Notification>;
pub type EventReceiver = broadcast::Receiver<Notification>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}
