pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod models;
pub mod peer;
pub mod room;
pub mod signaling;

use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::call::engine::run_call_engine;
use crate::call::{CallCommand, CallHandle, CallSnapshot, SnapshotReceiver};
use crate::config::ClientConfig;
use crate::error::CallError;
use crate::events::{create_event_bus, EventReceiver, EventSender};
use crate::signaling::SignalingTransport;

/// One signaling session: the relay connection, the call engine, and the
/// notification bus. The transport outlives individual calls so an
/// `incoming_call` can arrive at any time; dropping the client tears
/// everything down.
pub struct CallClient {
    transport: SignalingTransport,
    handle: CallHandle,
    events: EventSender,
    snapshot_rx: SnapshotReceiver,
}

impl CallClient {
    /// Connect to the relay and start the call engine. Fails only on the
    /// initial connection; later drops are retried by the transport.
    pub async fn connect(cfg: ClientConfig) -> Result<Self, CallError> {
        let transport = SignalingTransport::connect(&cfg).await?;
        let (events, _) = create_event_bus();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<CallCommand>();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());

        tokio::spawn(run_call_engine(
            cfg,
            transport.handle(),
            transport.subscribe(),
            cmd_rx,
            events.clone(),
            snapshot_tx,
        ));

        info!("call client ready");
        Ok(Self {
            transport,
            handle: CallHandle::new(cmd_tx),
            events,
            snapshot_rx,
        })
    }

    pub fn handle(&self) -> CallHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch(&self) -> SnapshotReceiver {
        self.snapshot_rx.clone()
    }

    /// Close the relay connection for good. The engine stops once its
    /// command channel drops with the client.
    pub fn close(&self) {
        self.transport.close();
    }
}
