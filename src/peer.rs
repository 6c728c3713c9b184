use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as WrtcMediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::CallError;

/// User-visible connection status derived from the underlying peer
/// connection state. Exactly one of these per state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Events emitted by the peer link back to the call engine.
#[derive(Debug)]
pub enum PeerEvent {
    StatusChanged(PeerStatus),
    /// ICE candidate gathered locally — must be relayed to the remote peer.
    IceCandidate(String),
    /// Remote media track arrived.
    RemoteTrack(Arc<TrackRemote>),
}

/// Holds ICE candidates that arrive before the remote description.
///
/// Closed until `open()` is called: every candidate is queued in arrival
/// order. `open()` drains the queue exactly once; afterwards `push()` hands
/// each candidate straight back for immediate application.
pub(crate) struct CandidateGate<T> {
    queued: Option<Vec<T>>,
}

impl<T> CandidateGate<T> {
    pub fn new() -> Self {
        Self { queued: Some(Vec::new()) }
    }

    /// Offer a candidate. `None` means it was queued; `Some` hands it back
    /// for immediate application.
    pub fn push(&mut self, candidate: T) -> Option<T> {
        match &mut self.queued {
            Some(queue) => {
                queue.push(candidate);
                None
            }
            None => Some(candidate),
        }
    }

    /// Mark the remote description as applied and drain the queue in
    /// arrival order. Subsequent calls return nothing.
    pub fn open(&mut self) -> Vec<T> {
        self.queued.take().unwrap_or_default()
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.queued.is_none()
    }
}

/// The one peer-to-peer media connection of a call. Owns the underlying
/// `RTCPeerConnection`, the local send tracks, and the candidate gate.
/// STUN only; NAT traversal beyond STUN is a known limitation.
pub struct PeerLink {
    pc: Arc<RTCPeerConnection>,
    gate: Arc<Mutex<CandidateGate<RTCIceCandidateInit>>>,
    video_sender: Arc<RTCRtpSender>,
    audio_track: Arc<TrackLocalStaticSample>,
    camera_track: Arc<TrackLocalStaticSample>,
    screen_track: Arc<TrackLocalStaticSample>,
}

impl PeerLink {
    /// Create the peer connection and register the local send tracks.
    /// No network activity happens until an offer/answer is exchanged.
    pub async fn new(
        stun_servers: &[String],
        event_tx: mpsc::Sender<PeerEvent>,
    ) -> Result<Self, CallError> {
        let mut media_engine = WrtcMediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        // Host candidates alone suffice on a LAN; an empty server list is
        // valid configuration, not an error.
        let ice_servers = if stun_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration { ice_servers, ..Default::default() };

        let pc = Arc::new(api.new_peer_connection(config).await?);

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 1,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            "audio".to_string(),
            "peerlink-call".to_string(),
        ));

        // The capture layer delivers pre-encoded frames; the sender treats
        // samples as opaque payloads.
        let video_capability = RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            ..Default::default()
        };
        let camera_track = Arc::new(TrackLocalStaticSample::new(
            video_capability.clone(),
            "camera".to_string(),
            "peerlink-call".to_string(),
        ));
        let screen_track = Arc::new(TrackLocalStaticSample::new(
            video_capability,
            "screen".to_string(),
            "peerlink-call".to_string(),
        ));

        let audio_sender = pc
            .add_track(audio_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        let video_sender = pc
            .add_track(camera_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Drain incoming RTCP so the interceptors keep working.
        spawn_rtcp_reader(audio_sender);
        spawn_rtcp_reader(video_sender.clone());

        let state_tx = event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                info!("peer connection state: {}", state);
                if let Some(status) = map_connection_state(state) {
                    let _ = tx.send(PeerEvent::StatusChanged(status)).await;
                }
            })
        }));

        let ice_tx = event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = ice_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    let json = match candidate.to_json() {
                        Ok(init) => serde_json::to_string(&init).unwrap_or_default(),
                        Err(e) => {
                            warn!("failed to serialize ICE candidate: {}", e);
                            return;
                        }
                    };
                    let _ = tx.send(PeerEvent::IceCandidate(json)).await;
                }
            })
        }));

        let track_tx = event_tx;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = track_tx.clone();
            Box::pin(async move {
                info!("remote {} track arrived", track.kind());
                let _ = tx.send(PeerEvent::RemoteTrack(track)).await;
            })
        }));

        Ok(Self {
            pc,
            gate: Arc::new(Mutex::new(CandidateGate::new())),
            video_sender,
            audio_track,
            camera_track,
            screen_track,
        })
    }

    pub fn audio_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.audio_track
    }

    pub fn camera_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.camera_track
    }

    pub fn screen_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.screen_track
    }

    /// Caller side: produce the local offer. Returns the serialized session
    /// description for the `sdp_offer` payload.
    pub async fn create_offer(&self) -> Result<String, CallError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        let sdp = serde_json::to_string(&offer)
            .map_err(|e| CallError::Transport(format!("failed to serialize offer: {e}")))?;
        info!("created local offer");
        Ok(sdp)
    }

    /// Callee side: apply the remote offer and release any queued ICE
    /// candidates before returning.
    pub async fn apply_remote_offer(&self, sdp_json: &str) -> Result<(), CallError> {
        let offer: RTCSessionDescription = serde_json::from_str(sdp_json)
            .map_err(|e| CallError::Transport(format!("failed to parse offer: {e}")))?;
        self.pc.set_remote_description(offer).await?;
        self.flush_candidates().await;
        info!("applied remote offer");
        Ok(())
    }

    /// Callee side: produce the local answer, mirroring the offer path.
    pub async fn create_answer(&self) -> Result<String, CallError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        let sdp = serde_json::to_string(&answer)
            .map_err(|e| CallError::Transport(format!("failed to serialize answer: {e}")))?;
        info!("created local answer");
        Ok(sdp)
    }

    /// Caller side: apply the remote answer and release queued candidates.
    pub async fn apply_remote_answer(&self, sdp_json: &str) -> Result<(), CallError> {
        let answer: RTCSessionDescription = serde_json::from_str(sdp_json)
            .map_err(|e| CallError::Transport(format!("failed to parse answer: {e}")))?;
        self.pc.set_remote_description(answer).await?;
        self.flush_candidates().await;
        info!("applied remote answer");
        Ok(())
    }

    /// Apply a relayed ICE candidate, or queue it while no remote
    /// description exists. Applying before the description is set is a
    /// protocol violation in the underlying stack and must never happen.
    pub async fn add_ice_candidate(&self, candidate_json: &str) -> Result<(), CallError> {
        let candidate: RTCIceCandidateInit = serde_json::from_str(candidate_json)
            .map_err(|e| CallError::Transport(format!("failed to parse ICE candidate: {e}")))?;

        let ready = self.gate.lock().await.push(candidate);
        match ready {
            Some(candidate) => {
                self.pc.add_ice_candidate(candidate).await?;
                debug!("applied ICE candidate");
            }
            None => debug!("queued ICE candidate until remote description"),
        }
        Ok(())
    }

    /// Swap the outbound video sender between camera and screen without
    /// renegotiation.
    pub async fn set_screen_sharing(&self, sharing: bool) -> Result<(), CallError> {
        let track = if sharing {
            self.screen_track.clone()
        } else {
            self.camera_track.clone()
        };
        self.video_sender
            .replace_track(Some(track as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        info!("outbound video sender now carries {}", if sharing { "screen" } else { "camera" });
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("error closing peer connection: {}", e);
        }
    }

    async fn flush_candidates(&self) {
        let queued = self.gate.lock().await.open();
        for candidate in queued {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!("failed to apply queued ICE candidate: {}", e);
            }
        }
    }
}

fn spawn_rtcp_reader(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<PeerStatus> {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
            Some(PeerStatus::Connecting)
        }
        RTCPeerConnectionState::Connected => Some(PeerStatus::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerStatus::Reconnecting),
        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
            Some(PeerStatus::Failed)
        }
        RTCPeerConnectionState::Unspecified => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_queues_until_opened_then_drains_in_order() {
        let mut gate = CandidateGate::new();
        assert_eq!(gate.push(1), None);
        assert_eq!(gate.push(2), None);
        assert_eq!(gate.push(3), None);
        assert!(!gate.is_open());

        assert_eq!(gate.open(), vec![1, 2, 3]);
        assert!(gate.is_open());
    }

    #[test]
    fn gate_drains_exactly_once() {
        let mut gate = CandidateGate::new();
        gate.push("a");
        assert_eq!(gate.open(), vec!["a"]);
        assert!(gate.open().is_empty());
    }

    #[test]
    fn gate_passes_through_after_open() {
        let mut gate = CandidateGate::new();
        gate.push(10);
        gate.open();
        // Late candidates apply immediately, never re-queued.
        assert_eq!(gate.push(11), Some(11));
        assert_eq!(gate.push(12), Some(12));
        assert!(gate.open().is_empty());
    }

    #[test]
    fn empty_gate_opens_clean() {
        let mut gate: CandidateGate<u8> = CandidateGate::new();
        assert!(gate.open().is_empty());
        assert_eq!(gate.push(7), Some(7));
    }

    #[test]
    fn connection_state_maps_to_exactly_one_status() {
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Connecting),
            Some(PeerStatus::Connecting)
        );
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Connected),
            Some(PeerStatus::Connected)
        );
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Disconnected),
            Some(PeerStatus::Reconnecting)
        );
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Failed),
            Some(PeerStatus::Failed)
        );
        assert_eq!(map_connection_state(RTCPeerConnectionState::Unspecified), None);
    }
}
