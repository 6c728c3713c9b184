//! End-to-end call flows against an in-process relay.
//!
//! The relay mirrors the production one: per-session fanout with the
//! standard direction rewrites (`call_initiate` becomes `incoming_call`
//! and so on). Two real clients run their full engines against it; only
//! the capture devices are absent, which degrades media but not signaling.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use peerlink::call::{CallCommand, CallPhase};
use peerlink::config::ClientConfig;
use peerlink::error::CallError;
use peerlink::events::Notification;
use peerlink::CallClient;

const WAIT: Duration = Duration::from_secs(15);

/// Every message a client sent, in relay arrival order: (user id, type).
type MessageLog = Arc<Mutex<Vec<(String, String)>>>;

struct Relay {
    url: String,
    log: MessageLog,
}

async fn start_relay() -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let log: MessageLog = Arc::new(Mutex::new(Vec::new()));
    let peers: Arc<Mutex<Vec<(String, mpsc::UnboundedSender<String>)>>> =
        Arc::new(Mutex::new(Vec::new()));

    let log_srv = log.clone();
    tokio::spawn(async move {
        let mut next_id = 0u32;
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            next_id += 1;
            let user_id = format!("user-{next_id}");

            let callback = |req: &Request, resp: Response| {
                if req.uri().query().unwrap_or("").contains("token=bad") {
                    let mut denied = ErrorResponse::new(None);
                    *denied.status_mut() =
                        tokio_tungstenite::tungstenite::http::StatusCode::UNAUTHORIZED;
                    return Err(denied);
                }
                Ok(resp)
            };
            let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                continue;
            };

            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            {
                let mut peers = peers.lock().unwrap();
                for (other_id, other_tx) in peers.iter() {
                    let _ = other_tx
                        .send(format!(r#"{{"type":"user_joined","user_id":"{user_id}"}}"#));
                    let _ =
                        tx.send(format!(r#"{{"type":"user_joined","user_id":"{other_id}"}}"#));
                }
                peers.push((user_id.clone(), tx));
            }

            let peers = peers.clone();
            let log = log_srv.clone();
            tokio::spawn(async move {
                let (mut write, mut read) = ws.split();
                loop {
                    tokio::select! {
                        Some(out) = rx.recv() => {
                            if write.send(WsMessage::Text(out)).await.is_err() {
                                break;
                            }
                        }
                        frame = read.next() => {
                            let Some(Ok(WsMessage::Text(text))) = frame else { break };
                            let Some((kind, rewritten)) = rewrite(&user_id, &text) else {
                                continue;
                            };
                            log.lock().unwrap().push((user_id.clone(), kind));
                            let peers = peers.lock().unwrap();
                            for (other_id, other_tx) in peers.iter() {
                                if other_id != &user_id {
                                    let _ = other_tx.send(rewritten.clone());
                                }
                            }
                        }
                    }
                }
                peers.lock().unwrap().retain(|(id, _)| id != &user_id);
                let peers_left = peers.lock().unwrap().clone();
                for (_, other_tx) in peers_left {
                    let _ = other_tx
                        .send(format!(r#"{{"type":"user_left","user_id":"{user_id}"}}"#));
                }
            });
        }
    });

    Relay { url, log }
}

/// The relay's direction table: sender-side message types are rewritten to
/// their receiver-side counterparts, everything else is forwarded verbatim.
fn rewrite(sender: &str, text: &str) -> Option<(String, String)> {
    let mut v: Value = serde_json::from_str(text).ok()?;
    let kind = v["type"].as_str()?.to_string();
    match kind.as_str() {
        "call_initiate" => {
            v["type"] = "incoming_call".into();
            v["caller_id"] = sender.into();
            v.as_object_mut()?.remove("timestamp");
        }
        "call_accept" => v["type"] = "call_accepted".into(),
        "call_reject" => v["type"] = "call_rejected".into(),
        "call_end" => v["type"] = "call_ended".into(),
        "media_state" => {
            v["type"] = "media_state_changed".into();
            v["user_id"] = sender.into();
        }
        "screen_share" => {
            v["type"] = "screen_share_changed".into();
            v["user_id"] = sender.into();
        }
        "sdp_offer" | "sdp_answer" | "ice_candidate" | "chat_message" => {}
        _ => return None,
    }
    Some((kind, v.to_string()))
}

fn test_config(relay: &Relay, name: &str) -> ClientConfig {
    let mut cfg = ClientConfig::new(&relay.url, "abc123", "tok");
    cfg.display_name = name.to_string();
    // Loopback-only: host candidates are enough.
    cfg.stun_servers = Vec::new();
    cfg
}

async fn wait_for_phase(client: &CallClient, phase: CallPhase) {
    let mut rx = client.watch();
    timeout(WAIT, rx.wait_for(|s| s.phase == phase))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for phase {phase:?}"))
        .unwrap();
}

/// Accept the first incoming call, then keep pumping notifications.
fn auto_accept(client: &CallClient) {
    let handle = client.handle();
    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(notification) = events.recv().await {
            if matches!(notification, Notification::IncomingCall { .. }) {
                handle.send(CallCommand::AcceptCall);
            }
        }
    });
}

#[tokio::test]
async fn caller_and_callee_reach_connected_with_one_offer_answer_pair() {
    let relay = start_relay().await;

    let alice = CallClient::connect(test_config(&relay, "Alice")).await.unwrap();
    let bob = CallClient::connect(test_config(&relay, "Bob")).await.unwrap();
    auto_accept(&bob);

    alice.handle().send(CallCommand::EnterRoom);
    alice.handle().send(CallCommand::StartCall);

    wait_for_phase(&alice, CallPhase::Connected).await;
    wait_for_phase(&bob, CallPhase::Connected).await;

    let log = relay.log.lock().unwrap().clone();
    let count = |user: &str, kind: &str| {
        log.iter().filter(|(u, k)| u == user && k == kind).count()
    };
    // Role determinism: the initiator offers, the acceptor answers.
    assert_eq!(count("user-1", "sdp_offer"), 1);
    assert_eq!(count("user-2", "sdp_answer"), 1);
    assert_eq!(count("user-2", "sdp_offer"), 0);
    assert_eq!(count("user-1", "sdp_answer"), 0);

    let pos = |kind: &str| log.iter().position(|(_, k)| k == kind).unwrap();
    assert!(pos("call_initiate") < pos("call_accept"));
    assert!(pos("call_accept") < pos("sdp_offer"));
    assert!(pos("sdp_offer") < pos("sdp_answer"));

    let snapshot = alice.snapshot();
    assert_eq!(snapshot.role, Some(peerlink::models::CallRole::Caller));
    assert_eq!(bob.snapshot().role, Some(peerlink::models::CallRole::Callee));
}

#[tokio::test]
async fn ending_twice_produces_one_terminal_transition() {
    let relay = start_relay().await;

    let alice = CallClient::connect(test_config(&relay, "Alice")).await.unwrap();
    let bob = CallClient::connect(test_config(&relay, "Bob")).await.unwrap();
    auto_accept(&bob);

    let mut events = alice.subscribe();
    alice.handle().send(CallCommand::StartCall);
    wait_for_phase(&alice, CallPhase::Connected).await;

    alice.handle().send(CallCommand::EndCall);
    alice.handle().send(CallCommand::EndCall);
    wait_for_phase(&alice, CallPhase::Ended).await;
    wait_for_phase(&bob, CallPhase::Ended).await;

    let mut ended = 0;
    while let Ok(Ok(notification)) = timeout(Duration::from_secs(1), events.recv()).await {
        if matches!(notification, Notification::CallEnded { by_remote: false }) {
            ended += 1;
        }
    }
    assert_eq!(ended, 1);
    assert_eq!(alice.snapshot().phase, CallPhase::Ended);
    assert_eq!(relay.log.lock().unwrap().iter().filter(|(_, k)| k == "call_end").count(), 1);
}

#[tokio::test]
async fn rejection_reaches_the_caller_with_its_reason() {
    let relay = start_relay().await;

    let alice = CallClient::connect(test_config(&relay, "Alice")).await.unwrap();
    let bob = CallClient::connect(test_config(&relay, "Bob")).await.unwrap();

    let bob_handle = bob.handle();
    let mut bob_events = bob.subscribe();
    tokio::spawn(async move {
        while let Ok(notification) = bob_events.recv().await {
            if matches!(notification, Notification::IncomingCall { .. }) {
                bob_handle.send(CallCommand::RejectCall { reason: Some("busy".into()) });
            }
        }
    });

    let mut alice_events = alice.subscribe();
    alice.handle().send(CallCommand::StartCall);
    wait_for_phase(&alice, CallPhase::Ended).await;

    let rejected = loop {
        match timeout(WAIT, alice_events.recv()).await.unwrap().unwrap() {
            Notification::CallRejected { reason } => break reason,
            _ => continue,
        }
    };
    assert_eq!(rejected.as_deref(), Some("busy"));
    assert!(bob.snapshot().incoming.is_none());
}

#[tokio::test]
async fn remote_hangup_rearms_the_session_for_another_call() {
    let relay = start_relay().await;

    let alice = CallClient::connect(test_config(&relay, "Alice")).await.unwrap();
    let bob = CallClient::connect(test_config(&relay, "Bob")).await.unwrap();
    auto_accept(&bob);

    let mut alice_events = alice.subscribe();
    alice.handle().send(CallCommand::StartCall);
    wait_for_phase(&alice, CallPhase::Connected).await;

    bob.handle().send(CallCommand::EndCall);
    wait_for_phase(&alice, CallPhase::Ended).await;
    let ended_remotely = loop {
        match timeout(WAIT, alice_events.recv()).await.unwrap().unwrap() {
            Notification::CallEnded { by_remote } => break by_remote,
            _ => continue,
        }
    };
    assert!(ended_remotely);

    // The relay connection stayed up; a fresh call finds Alice again.
    bob.handle().send(CallCommand::StartCall);
    loop {
        match timeout(WAIT, alice_events.recv()).await.unwrap().unwrap() {
            Notification::IncomingCall { caller_name, .. } => {
                assert_eq!(caller_name, "Bob");
                break;
            }
            _ => continue,
        }
    }
    assert!(alice.snapshot().incoming.is_some());
}

#[tokio::test]
async fn concurrent_second_caller_is_ignored() {
    let relay = start_relay().await;

    let alice = CallClient::connect(test_config(&relay, "Alice")).await.unwrap();
    let bob = CallClient::connect(test_config(&relay, "Bob")).await.unwrap();
    let carol = CallClient::connect(test_config(&relay, "Carol")).await.unwrap();

    let mut alice_events = alice.subscribe();
    bob.handle().send(CallCommand::StartCall);
    loop {
        match timeout(WAIT, alice_events.recv()).await.unwrap().unwrap() {
            Notification::IncomingCall { .. } => break,
            _ => continue,
        }
    }
    carol.handle().send(CallCommand::StartCall);

    let mut extra_incoming = 0;
    while let Ok(Ok(notification)) = timeout(Duration::from_secs(2), alice_events.recv()).await {
        if matches!(notification, Notification::IncomingCall { .. }) {
            extra_incoming += 1;
        }
    }
    assert_eq!(extra_incoming, 0);
    assert_eq!(alice.snapshot().incoming.as_ref().unwrap().caller_name, "Bob");
}

#[tokio::test]
async fn third_party_caller_during_an_active_call_is_ignored() {
    let relay = start_relay().await;

    let alice = CallClient::connect(test_config(&relay, "Alice")).await.unwrap();
    let bob = CallClient::connect(test_config(&relay, "Bob")).await.unwrap();
    let carol = CallClient::connect(test_config(&relay, "Carol")).await.unwrap();
    auto_accept(&bob);

    alice.handle().send(CallCommand::StartCall);
    wait_for_phase(&alice, CallPhase::Connected).await;
    wait_for_phase(&bob, CallPhase::Connected).await;

    let mut alice_events = alice.subscribe();
    carol.handle().send(CallCommand::StartCall);

    let mut incoming = 0;
    while let Ok(Ok(notification)) = timeout(Duration::from_secs(2), alice_events.recv()).await {
        if matches!(notification, Notification::IncomingCall { .. }) {
            incoming += 1;
        }
    }
    assert_eq!(incoming, 0);

    // The live call is untouched: no pending overlay, no phase regression.
    let snapshot = alice.snapshot();
    assert!(snapshot.incoming.is_none());
    assert_eq!(snapshot.phase, CallPhase::Connected);
    assert_eq!(snapshot.role, Some(peerlink::models::CallRole::Caller));
}

#[tokio::test]
async fn chat_messages_are_delivered_both_ways() {
    let relay = start_relay().await;

    let alice = CallClient::connect(test_config(&relay, "Alice")).await.unwrap();
    let bob = CallClient::connect(test_config(&relay, "Bob")).await.unwrap();
    auto_accept(&bob);

    let mut bob_events = bob.subscribe();

    // Chat is a connected-call action; before any call it goes nowhere.
    alice.handle().send(CallCommand::SendChat("too early".into()));

    alice.handle().send(CallCommand::StartCall);
    wait_for_phase(&alice, CallPhase::Connected).await;
    assert!(alice.snapshot().chat.is_empty());
    assert_eq!(
        relay.log.lock().unwrap().iter().filter(|(_, k)| k == "chat_message").count(),
        0
    );

    alice.handle().send(CallCommand::SendChat("hello from Alice".into()));
    let entry = loop {
        match timeout(WAIT, bob_events.recv()).await.unwrap().unwrap() {
            Notification::NewChatMessage(entry) => break entry,
            _ => continue,
        }
    };
    assert_eq!(entry.content, "hello from Alice");
    assert_eq!(entry.sender, peerlink::models::ChatSender::Remote);

    let alice_chat = alice.snapshot().chat;
    assert_eq!(alice_chat.len(), 1);
    assert_eq!(alice_chat[0].sender, peerlink::models::ChatSender::Local);
}

#[tokio::test]
async fn rejected_token_surfaces_as_an_auth_error() {
    let relay = start_relay().await;

    let mut cfg = test_config(&relay, "Mallory");
    cfg.auth_token = "bad".into();
    let err = CallClient::connect(cfg).await.err().expect("connect should fail");
    assert!(matches!(err, CallError::Auth(_)), "expected an auth error, got {err}");
}
