use std::time::Duration;

/// Client configuration for one signaling session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `wss://relay.example.com`.
    pub relay_url: String,
    /// Opaque session id, externally assigned.
    pub session_id: String,
    /// Bearer token authenticating the signaling connection.
    pub auth_token: String,
    /// Local user id as known to the relay.
    pub user_id: String,
    /// Name announced in `call_initiate`.
    pub display_name: String,
    /// Public STUN servers for the peer connection. No TURN.
    pub stun_servers: Vec<String>,
    /// Fixed delay between signaling reconnect attempts.
    pub reconnect_delay: Duration,
    /// Upper bound for the microphone/camera readiness probes.
    pub probe_timeout: Duration,
}

impl ClientConfig {
    pub fn new(relay_url: &str, session_id: &str, auth_token: &str) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            session_id: session_id.to_string(),
            auth_token: auth_token.to_string(),
            user_id: uuid::Uuid::new_v4().to_string(),
            display_name: "Anonymous".to_string(),
            stun_servers: default_stun_servers(),
            reconnect_delay: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(3),
        }
    }

    /// Session-addressed WebSocket URL with the bearer token as a query
    /// parameter.
    pub fn signaling_url(&self) -> String {
        format!(
            "{}/ws/{}?token={}",
            self.relay_url.trim_end_matches('/'),
            self.session_id,
            self.auth_token
        )
    }
}

/// Fixed multi-vendor STUN list.
pub fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
        "stun:global.stun.twilio.com:3478".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaling_url_is_session_and_token_addressed() {
        let cfg = ClientConfig::new("wss://relay.example.com/", "abc123", "tok");
        assert_eq!(cfg.signaling_url(), "wss://relay.example.com/ws/abc123?token=tok");
    }
}
