pub mod engine;

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::models::{
    CallRole, ChatEntry, IncomingCallRequest, MediaKind, MediaState, RemoteMediaState,
};
use crate::signaling::SignalMessage;

/// Where the session currently stands. `Ended` and `Failed` are terminal for
/// the call, not the session: the engine stays alive and a later
/// `incoming_call` re-arms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Idle,
    Room,
    Connecting,
    Connected,
    Ended,
    Failed,
}

/// Commands accepted by the call engine. All user intent flows through here.
#[derive(Debug)]
pub enum CallCommand {
    EnterRoom,
    StartCall,
    AcceptCall,
    RejectCall { reason: Option<String> },
    EndCall,
    SetAudio(bool),
    SetVideo(bool),
    SetRecording(bool),
    StartScreenShare,
    StopScreenShare,
    SendChat(String),
}

/// Point-in-time view of the call, published over a watch channel.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub role: Option<CallRole>,
    pub media: MediaState,
    pub remote_media: RemoteMediaState,
    pub incoming: Option<IncomingCallRequest>,
    pub remote_user: Option<String>,
    pub chat: Vec<ChatEntry>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            phase: CallPhase::Idle,
            role: None,
            media: MediaState::default(),
            remote_media: RemoteMediaState::default(),
            incoming: None,
            remote_user: None,
            chat: Vec::new(),
        }
    }
}

/// Cheap clonable command sender for the engine.
#[derive(Clone)]
pub struct CallHandle {
    cmd_tx: mpsc::UnboundedSender<CallCommand>,
}

impl CallHandle {
    pub(crate) fn new(cmd_tx: mpsc::UnboundedSender<CallCommand>) -> Self {
        Self { cmd_tx }
    }

    pub fn send(&self, cmd: CallCommand) {
        let _ = self.cmd_tx.send(cmd);
    }
}

pub type SnapshotReceiver = watch::Receiver<CallSnapshot>;

/// Build the outbound announcement for a local media toggle. A toggle with
/// no live capture pipeline changes the flag silently: there is nothing for
/// the remote side to act on, so no message goes out.
pub(crate) fn media_state_message(
    pipeline_live: bool,
    kind: MediaKind,
    enabled: bool,
) -> Option<SignalMessage> {
    if !pipeline_live {
        return None;
    }
    Some(SignalMessage::MediaState { media_type: kind, enabled })
}

/// Admission rule for incoming call requests: a request is only created
/// while no local call is active, and while one request is pending and
/// unresolved, later ones are dropped (first wins).
pub(crate) fn admit_incoming(
    in_call: bool,
    pending: &Option<IncomingCallRequest>,
    caller_name: String,
    caller_id: String,
) -> Option<IncomingCallRequest> {
    if in_call || pending.is_some() {
        return None;
    }
    Some(IncomingCallRequest { caller_name, caller_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_with_live_pipeline_announces() {
        let msg = media_state_message(true, MediaKind::Video, false);
        assert_eq!(
            msg,
            Some(SignalMessage::MediaState { media_type: MediaKind::Video, enabled: false })
        );
    }

    #[test]
    fn toggle_without_pipeline_is_silent() {
        assert_eq!(media_state_message(false, MediaKind::Video, false), None);
        assert_eq!(media_state_message(false, MediaKind::Audio, true), None);
    }

    #[test]
    fn first_incoming_call_is_admitted() {
        let pending = None;
        let admitted = admit_incoming(false, &pending, "Alice".into(), "u1".into());
        assert_eq!(
            admitted,
            Some(IncomingCallRequest { caller_name: "Alice".into(), caller_id: "u1".into() })
        );
    }

    #[test]
    fn second_incoming_call_is_dropped() {
        let pending = Some(IncomingCallRequest {
            caller_name: "Alice".into(),
            caller_id: "u1".into(),
        });
        assert_eq!(admit_incoming(false, &pending, "Mallory".into(), "u9".into()), None);
    }

    #[test]
    fn incoming_call_during_an_active_call_is_dropped() {
        // The pending slot is empty mid-call (it was taken at accept), so
        // the active-call check has to stand on its own.
        assert_eq!(admit_incoming(true, &None, "Carol".into(), "u3".into()), None);
    }
}
