pub mod message;
pub mod transport;

pub use message::SignalMessage;
pub use transport::{SignalEvent, SignalingHandle, SignalingTransport};
