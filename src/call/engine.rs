use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::media::Sample;
use webrtc::track::track_remote::TrackRemote;

use crate::config::ClientConfig;
use crate::events::{EventSender, Notification};
use crate::media::audio::{self, CaptureHandle, PlaybackHandle};
use crate::media::codec::{OpusDecoder, OpusEncoder};
use crate::media::screen::{self, ScreenCaptureHandle};
use crate::media::video::{self, CameraHandle};
use crate::models::{CallRole, ChatEntry, ChatSender, MediaKind, MediaState, RemoteMediaState};
use crate::peer::{PeerEvent, PeerLink, PeerStatus};
use crate::signaling::{SignalEvent, SignalMessage, SignalingHandle};

use super::{admit_incoming, media_state_message, CallCommand, CallPhase, CallSnapshot};

const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(33);

/// Drives one session: reacts to user commands, relay messages, and peer
/// events, and owns the media pipelines for the duration of a call.
/// Runs until the command channel closes; call end does not stop it, a
/// later `incoming_call` re-arms the same engine.
pub(crate) async fn run_call_engine(
    cfg: ClientConfig,
    signaling: SignalingHandle,
    mut signal_rx: broadcast::Receiver<SignalEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<CallCommand>,
    events: EventSender,
    snapshot_tx: watch::Sender<CallSnapshot>,
) {
    let (peer_tx, mut peer_rx) = mpsc::channel::<PeerEvent>(64);
    let mut engine = CallEngine::new(cfg, signaling, events, snapshot_tx, peer_tx);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => engine.handle_command(cmd).await,
                None => break,
            },
            sig = signal_rx.recv() => match sig {
                Ok(event) => engine.handle_signal(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("call engine lagged {} signaling events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(event) = peer_rx.recv() => engine.handle_peer_event(event).await,
        }
    }

    engine.teardown().await;
    info!("call engine stopped");
}

struct CallEngine {
    cfg: ClientConfig,
    signaling: SignalingHandle,
    events: EventSender,
    snapshot_tx: watch::Sender<CallSnapshot>,
    peer_tx: mpsc::Sender<PeerEvent>,

    phase: CallPhase,
    role: Option<CallRole>,
    remote_user: Option<String>,
    incoming: Option<crate::models::IncomingCallRequest>,
    media: MediaState,
    remote_media: RemoteMediaState,
    chat: Vec<ChatEntry>,
    offer_sent: bool,
    transport_down: bool,
    peer_status: Option<PeerStatus>,

    peer: Option<PeerLink>,
    capture: Option<CaptureHandle>,
    camera: Option<CameraHandle>,
    screen: Option<ScreenCaptureHandle>,
    playback_tx: Option<mpsc::Sender<Vec<f32>>>,
    playback: Option<PlaybackHandle>,
    pump_tasks: Vec<JoinHandle<()>>,

    // Shared with the pump tasks so toggles take effect mid-stream.
    audio_on: Arc<AtomicBool>,
    video_on: Arc<AtomicBool>,
}

impl CallEngine {
    fn new(
        cfg: ClientConfig,
        signaling: SignalingHandle,
        events: EventSender,
        snapshot_tx: watch::Sender<CallSnapshot>,
        peer_tx: mpsc::Sender<PeerEvent>,
    ) -> Self {
        Self {
            cfg,
            signaling,
            events,
            snapshot_tx,
            peer_tx,
            phase: CallPhase::Idle,
            role: None,
            remote_user: None,
            incoming: None,
            media: MediaState::default(),
            remote_media: RemoteMediaState::default(),
            chat: Vec::new(),
            offer_sent: false,
            transport_down: false,
            peer_status: None,
            peer: None,
            capture: None,
            camera: None,
            screen: None,
            playback_tx: None,
            playback: None,
            pump_tasks: Vec::new(),
            audio_on: Arc::new(AtomicBool::new(true)),
            video_on: Arc::new(AtomicBool::new(true)),
        }
    }

    fn notify(&self, notification: Notification) {
        let _ = self.events.send(notification);
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(CallSnapshot {
            phase: self.phase,
            role: self.role,
            media: self.media,
            remote_media: self.remote_media,
            incoming: self.incoming.clone(),
            remote_user: self.remote_user.clone(),
            chat: self.chat.clone(),
        });
    }

    fn target_user(&self) -> String {
        self.remote_user.clone().unwrap_or_default()
    }

    fn in_call(&self) -> bool {
        matches!(self.phase, CallPhase::Connecting | CallPhase::Connected)
    }

    async fn handle_command(&mut self, cmd: CallCommand) {
        match cmd {
            CallCommand::EnterRoom => {
                if !self.in_call() {
                    self.phase = CallPhase::Room;
                    self.publish();
                }
            }
            CallCommand::StartCall => {
                if self.in_call() {
                    debug!("start_call ignored, already in a call");
                    return;
                }
                self.role = Some(CallRole::Caller);
                self.phase = CallPhase::Connecting;
                self.offer_sent = false;
                self.signaling.send(SignalMessage::CallInitiate {
                    caller_name: self.cfg.display_name.clone(),
                    timestamp: now_ms(),
                });
                info!("call initiated as {}", self.cfg.display_name);
                self.publish();
            }
            CallCommand::AcceptCall => {
                let Some(request) = self.incoming.take() else {
                    debug!("accept_call ignored, no pending incoming call");
                    return;
                };
                self.role = Some(CallRole::Callee);
                self.remote_user = Some(request.caller_id);
                self.phase = CallPhase::Connecting;
                self.signaling.send(SignalMessage::CallAccept { timestamp: now_ms() });
                // Tracks must exist before the answer is produced.
                self.ensure_peer().await;
                self.publish();
            }
            CallCommand::RejectCall { reason } => {
                if self.incoming.take().is_none() {
                    debug!("reject_call ignored, no pending incoming call");
                    return;
                }
                self.signaling.send(SignalMessage::CallReject { timestamp: now_ms(), reason });
                self.publish();
            }
            CallCommand::EndCall => self.end_call(false).await,
            CallCommand::SetAudio(enabled) => self.set_media(MediaKind::Audio, enabled),
            CallCommand::SetVideo(enabled) => self.set_media(MediaKind::Video, enabled),
            CallCommand::SetRecording(recording) => {
                // Local bookkeeping only; never announced on the wire.
                self.media.recording = recording;
                self.publish();
            }
            CallCommand::StartScreenShare => self.start_screen_share().await,
            CallCommand::StopScreenShare => self.stop_screen_share().await,
            CallCommand::SendChat(content) => {
                if !self.in_call() {
                    debug!("chat ignored outside an active call");
                    return;
                }
                let timestamp = now_ms();
                self.chat.push(ChatEntry::new(ChatSender::Local, content.clone(), timestamp));
                self.signaling.send(SignalMessage::ChatMessage { content, timestamp });
                self.publish();
            }
        }
    }

    fn set_media(&mut self, kind: MediaKind, enabled: bool) {
        let (flag, shared, live) = match kind {
            MediaKind::Audio => {
                (&mut self.media.audio_enabled, &self.audio_on, self.capture.is_some())
            }
            MediaKind::Video => {
                (&mut self.media.video_enabled, &self.video_on, self.camera.is_some())
            }
        };
        if *flag == enabled {
            return;
        }
        *flag = enabled;
        shared.store(enabled, Ordering::Relaxed);

        if let Some(msg) = media_state_message(live, kind, enabled) {
            self.signaling.send(msg);
        }
        self.notify(Notification::MediaToggled {
            user_id: self.cfg.user_id.clone(),
            media_type: kind,
            enabled,
        });
        self.publish();
    }

    async fn handle_signal(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::Open => {
                if self.transport_down {
                    self.transport_down = false;
                    self.notify(Notification::Reconnected);
                    // The relay may have lost our announcement while down.
                    if self.role == Some(CallRole::Caller)
                        && self.phase == CallPhase::Connecting
                        && !self.offer_sent
                    {
                        self.signaling.send(SignalMessage::CallInitiate {
                            caller_name: self.cfg.display_name.clone(),
                            timestamp: now_ms(),
                        });
                    }
                }
            }
            SignalEvent::Closed => {
                if !self.transport_down {
                    self.transport_down = true;
                    self.notify(Notification::ConnectionIssue);
                }
            }
            SignalEvent::Message(msg) => self.handle_message(msg).await,
        }
    }

    async fn handle_message(&mut self, msg: SignalMessage) {
        match msg {
            SignalMessage::IncomingCall { caller_name, caller_id } => {
                match admit_incoming(self.in_call(), &self.incoming, caller_name, caller_id) {
                    Some(request) => {
                        if matches!(self.phase, CallPhase::Ended | CallPhase::Failed) {
                            self.phase = CallPhase::Idle;
                        }
                        self.notify(Notification::IncomingCall {
                            caller_name: request.caller_name.clone(),
                            caller_id: request.caller_id.clone(),
                        });
                        self.incoming = Some(request);
                        self.publish();
                    }
                    None => debug!("dropping concurrent incoming call"),
                }
            }
            SignalMessage::CallAccepted { .. } | SignalMessage::CallAccept { .. } => {
                if self.role != Some(CallRole::Caller) || self.phase != CallPhase::Connecting {
                    debug!("call_accepted ignored in phase {:?}", self.phase);
                    return;
                }
                if self.offer_sent {
                    debug!("call_accepted repeated, offer already sent");
                    return;
                }
                self.ensure_peer().await;
                let Some(peer) = &self.peer else { return };
                match peer.create_offer().await {
                    Ok(sdp) => {
                        self.signaling.send(SignalMessage::SdpOffer {
                            target_user: self.target_user(),
                            sdp,
                        });
                        self.offer_sent = true;
                    }
                    Err(e) => {
                        error!("failed to create offer: {}", e);
                        self.fail_call().await;
                    }
                }
            }
            SignalMessage::CallRejected { reason, .. } | SignalMessage::CallReject { reason, .. } => {
                if self.role == Some(CallRole::Caller) && self.phase == CallPhase::Connecting {
                    self.notify(Notification::CallRejected { reason });
                    self.stop_media().await;
                    self.phase = CallPhase::Ended;
                    self.publish();
                }
            }
            SignalMessage::SdpOffer { sdp, .. } => {
                if self.role != Some(CallRole::Callee) {
                    debug!("sdp_offer ignored, not the callee");
                    return;
                }
                self.ensure_peer().await;
                let Some(peer) = &self.peer else { return };
                let answer = async {
                    peer.apply_remote_offer(&sdp).await?;
                    peer.create_answer().await
                }
                .await;
                match answer {
                    Ok(sdp) => {
                        self.signaling.send(SignalMessage::SdpAnswer {
                            target_user: self.target_user(),
                            sdp,
                        });
                        self.phase = CallPhase::Connected;
                        self.publish();
                    }
                    Err(e) => {
                        error!("failed to answer offer: {}", e);
                        self.fail_call().await;
                    }
                }
            }
            SignalMessage::SdpAnswer { sdp, .. } => {
                if self.role != Some(CallRole::Caller) {
                    debug!("sdp_answer ignored, not the caller");
                    return;
                }
                let Some(peer) = &self.peer else { return };
                match peer.apply_remote_answer(&sdp).await {
                    Ok(()) => {
                        self.phase = CallPhase::Connected;
                        self.publish();
                    }
                    Err(e) => {
                        error!("failed to apply answer: {}", e);
                        self.fail_call().await;
                    }
                }
            }
            SignalMessage::IceCandidate { candidate, .. } => match &self.peer {
                Some(peer) => {
                    if let Err(e) = peer.add_ice_candidate(&candidate).await {
                        warn!("failed to handle ICE candidate: {}", e);
                    }
                }
                None => debug!("ice_candidate before any peer connection, dropped"),
            },
            SignalMessage::MediaStateChanged { user_id, media_type, enabled } => {
                match media_type {
                    MediaKind::Audio => self.remote_media.audio_enabled = enabled,
                    MediaKind::Video => self.remote_media.video_enabled = enabled,
                }
                self.remote_user.get_or_insert(user_id.clone());
                self.notify(Notification::MediaToggled { user_id, media_type, enabled });
                self.publish();
            }
            SignalMessage::ScreenShareChanged { user_id, sharing } => {
                self.remote_media.screen_sharing = sharing;
                self.notify(Notification::ScreenShareToggled { user_id, sharing });
                self.publish();
            }
            SignalMessage::ChatMessage { content, timestamp } => {
                let entry = ChatEntry::new(ChatSender::Remote, content, timestamp);
                self.chat.push(entry.clone());
                self.notify(Notification::NewChatMessage(entry));
                self.publish();
            }
            SignalMessage::CallEnded | SignalMessage::CallEnd => {
                if self.in_call() {
                    self.stop_media().await;
                    self.phase = CallPhase::Ended;
                    self.notify(Notification::CallEnded { by_remote: true });
                    self.publish();
                }
            }
            SignalMessage::UserJoined { user_id } => {
                self.remote_user.get_or_insert(user_id.clone());
                self.notify(Notification::UserJoined { user_id });
            }
            SignalMessage::UserLeft { user_id } => {
                self.notify(Notification::UserLeft { user_id });
            }
            SignalMessage::CallInitiate { .. }
            | SignalMessage::MediaState { .. }
            | SignalMessage::ScreenShare { .. } => {
                debug!("outbound-only message type arrived inbound, ignored");
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::StatusChanged(status) => {
                let previous = self.peer_status.replace(status);
                match status {
                    PeerStatus::Connected => {
                        if previous == Some(PeerStatus::Reconnecting) {
                            self.notify(Notification::Reconnected);
                        }
                    }
                    PeerStatus::Reconnecting => self.notify(Notification::ConnectionIssue),
                    PeerStatus::Failed => {
                        if self.in_call() {
                            self.notify(Notification::ConnectionIssue);
                            self.fail_call().await;
                        }
                    }
                    PeerStatus::Connecting => {}
                }
            }
            PeerEvent::IceCandidate(candidate) => {
                self.signaling.send(SignalMessage::IceCandidate {
                    target_user: self.target_user(),
                    candidate,
                });
            }
            PeerEvent::RemoteTrack(track) => self.attach_remote_track(track),
        }
    }

    /// Create the peer link and bring up the local capture pipelines. A
    /// missing device degrades the call instead of failing it.
    async fn ensure_peer(&mut self) {
        if self.peer.is_some() {
            return;
        }
        match PeerLink::new(&self.cfg.stun_servers, self.peer_tx.clone()).await {
            Ok(peer) => {
                self.peer = Some(peer);
                self.start_media();
            }
            Err(e) => {
                error!("failed to create peer connection: {}", e);
                self.fail_call().await;
            }
        }
    }

    fn start_media(&mut self) {
        let Some(peer) = &self.peer else { return };

        self.media.audio_enabled = true;
        self.media.video_enabled = true;
        self.audio_on.store(true, Ordering::Relaxed);
        self.video_on.store(true, Ordering::Relaxed);

        match audio::start_capture(None) {
            Ok((handle, mut rx)) => {
                self.capture = Some(handle);
                let track = peer.audio_track().clone();
                let enabled = self.audio_on.clone();
                self.pump_tasks.push(tokio::spawn(async move {
                    let mut encoder = match OpusEncoder::new() {
                        Ok(enc) => enc,
                        Err(e) => {
                            error!("audio pipeline unavailable: {}", e);
                            return;
                        }
                    };
                    while let Some(frame) = rx.recv().await {
                        if !enabled.load(Ordering::Relaxed) {
                            continue;
                        }
                        match encoder.encode(&frame) {
                            Ok(data) => {
                                let sample = Sample {
                                    data: Bytes::from(data),
                                    duration: AUDIO_FRAME,
                                    ..Default::default()
                                };
                                if track.write_sample(&sample).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => debug!("dropping audio frame: {}", e),
                        }
                    }
                }));
            }
            Err(e) => {
                warn!("microphone unavailable, continuing without audio: {}", e);
                self.media.audio_enabled = false;
                self.notify(Notification::MediaWarning {
                    detail: format!("microphone unavailable: {e}"),
                });
            }
        }

        match video::start_camera(None) {
            Ok((handle, mut rx)) => {
                self.camera = Some(handle);
                let track = peer.camera_track().clone();
                let enabled = self.video_on.clone();
                self.pump_tasks.push(tokio::spawn(async move {
                    while let Some(frame) = rx.recv().await {
                        if !enabled.load(Ordering::Relaxed) {
                            continue;
                        }
                        let sample = Sample {
                            data: Bytes::from(frame.jpeg_data),
                            duration: VIDEO_FRAME,
                            ..Default::default()
                        };
                        if track.write_sample(&sample).await.is_err() {
                            break;
                        }
                    }
                }));
            }
            Err(e) => {
                warn!("camera unavailable, continuing without video: {}", e);
                self.media.video_enabled = false;
                self.notify(Notification::MediaWarning {
                    detail: format!("camera unavailable: {e}"),
                });
            }
        }
    }

    fn attach_remote_track(&mut self, track: Arc<TrackRemote>) {
        if track.kind() == webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio {
            if self.playback_tx.is_none() {
                match audio::start_playback(None) {
                    Ok((handle, tx)) => {
                        self.playback = Some(handle);
                        self.playback_tx = Some(tx);
                    }
                    Err(e) => {
                        warn!("speaker unavailable, remote audio discarded: {}", e);
                        self.notify(Notification::MediaWarning {
                            detail: format!("speaker unavailable: {e}"),
                        });
                        return;
                    }
                }
            }
            let Some(out) = self.playback_tx.clone() else { return };
            self.pump_tasks.push(tokio::spawn(async move {
                let mut decoder = match OpusDecoder::new() {
                    Ok(dec) => dec,
                    Err(e) => {
                        error!("remote audio pipeline unavailable: {}", e);
                        return;
                    }
                };
                let mut buf = vec![0u8; 1500];
                while let Ok((packet, _)) = track.read(&mut buf).await {
                    match decoder.decode(&packet.payload) {
                        Ok(pcm) => {
                            if out.send(pcm).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("dropping remote audio packet: {}", e),
                    }
                }
            }));
        } else {
            // Headless surface: drain video so RTCP reports keep flowing,
            // frame consumption is left to the embedding UI.
            self.pump_tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 65536];
                let mut frames = 0u64;
                while track.read(&mut buf).await.is_ok() {
                    frames += 1;
                    if frames % 300 == 0 {
                        debug!("remote video: {} packets received", frames);
                    }
                }
            }));
        }
    }

    async fn start_screen_share(&mut self) {
        if self.media.screen_sharing {
            return;
        }
        let Some(peer) = &self.peer else {
            debug!("screen share ignored, no active call");
            return;
        };
        let (handle, mut rx) = match screen::start_screen_capture() {
            Ok(pair) => pair,
            Err(e) => {
                warn!("screen share failed to start: {}", e);
                self.notify(Notification::MediaWarning {
                    detail: format!("screen share unavailable: {e}"),
                });
                return;
            }
        };
        if let Err(e) = peer.set_screen_sharing(true).await {
            error!("failed to switch video sender to screen: {}", e);
            handle.stop();
            return;
        }

        let track = peer.screen_track().clone();
        self.pump_tasks.push(tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let sample = Sample {
                    data: Bytes::from(frame.jpeg_data),
                    duration: Duration::from_millis(100),
                    ..Default::default()
                };
                if track.write_sample(&sample).await.is_err() {
                    break;
                }
            }
        }));
        self.screen = Some(handle);
        self.media.screen_sharing = true;
        self.signaling.send(SignalMessage::ScreenShare { sharing: true });
        self.publish();
    }

    async fn stop_screen_share(&mut self) {
        if !self.media.screen_sharing {
            return;
        }
        if let Some(handle) = self.screen.take() {
            handle.stop();
        }
        if let Some(peer) = &self.peer {
            if let Err(e) = peer.set_screen_sharing(false).await {
                warn!("failed to switch video sender back to camera: {}", e);
            }
        }
        self.media.screen_sharing = false;
        self.signaling.send(SignalMessage::ScreenShare { sharing: false });
        self.publish();
    }

    /// Local hangup. Safe to invoke repeatedly; a second call is a no-op.
    async fn end_call(&mut self, by_remote: bool) {
        if !self.in_call() {
            debug!("end_call in phase {:?}, nothing to do", self.phase);
            return;
        }
        if !by_remote {
            self.signaling.send(SignalMessage::CallEnd);
        }
        self.stop_media().await;
        self.phase = CallPhase::Ended;
        self.notify(Notification::CallEnded { by_remote });
        self.publish();
    }

    async fn fail_call(&mut self) {
        self.stop_media().await;
        self.phase = CallPhase::Failed;
        self.publish();
    }

    async fn stop_media(&mut self) {
        for task in self.pump_tasks.drain(..) {
            task.abort();
        }
        if let Some(handle) = self.capture.take() {
            handle.stop();
        }
        if let Some(handle) = self.camera.take() {
            handle.stop();
        }
        if let Some(handle) = self.screen.take() {
            handle.stop();
        }
        if let Some(handle) = self.playback.take() {
            handle.stop();
        }
        self.playback_tx = None;
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
        self.media = MediaState::default();
        self.remote_media = RemoteMediaState::default();
        self.chat.clear();
        self.role = None;
        self.offer_sent = false;
        self.peer_status = None;
    }

    async fn teardown(&mut self) {
        self.stop_media().await;
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
