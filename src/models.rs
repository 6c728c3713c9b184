use serde::{Deserialize, Serialize};

/// Which media lane a state change refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Who initiated the call. Inferred at runtime, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Local participant media flags. Mutated only by local user action and
/// mirrored to the remote peer via signaling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub recording: bool,
}

/// Read-only mirror of the remote participant's announced media flags.
/// Written only from inbound `media_state_changed` / `screen_share_changed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoteMediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

/// A received call request waiting for accept/reject.
/// At most one exists per session at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomingCallRequest {
    pub caller_name: String,
    pub caller_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatSender {
    Local,
    Remote,
}

/// One in-call chat message. Append-only, in-memory for the call's lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct ChatEntry {
    pub id: String,
    pub sender: ChatSender,
    pub content: String,
    pub timestamp: i64,
}

impl ChatEntry {
    pub fn new(sender: ChatSender, content: String, timestamp: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender,
            content,
            timestamp,
        }
    }
}
