use std::time::Duration;

use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::adapter::AdapterError;

/// Configuration for a mesh adapter. Immutable once the adapter is built.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Dial, read, and write deadline for the signaling socket, and the
    /// back-off between reconnect attempts.
    pub timeout: Duration,
    /// Emit a debug log line per significant signaling event.
    pub verbose: bool,
    /// Identity announced to the community. Blank means a fresh UUID is
    /// minted for every signaler session.
    pub id: String,
    /// Label of the data channel opened on every peer session.
    pub primary_channel_id: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            verbose: false,
            id: String::new(),
            primary_channel_id: "primary".to_string(),
        }
    }
}

impl AdapterConfig {
    /// A blank channel label falls back to `"primary"`.
    pub(crate) fn normalized(mut self) -> Self {
        if self.primary_channel_id.trim().is_empty() {
            self.primary_channel_id = "primary".to_string();
        }
        self
    }
}

/// Parses free-form ICE endpoint strings into `RTCIceServer` descriptors.
///
/// Entries containing `stun:` are passed through as URL-only servers.
/// Anything else must look like `username:credential@turn:host:port`.
/// Whitespace-only entries are skipped.
pub fn parse_ice_servers(entries: &[String]) -> Result<Vec<RTCIceServer>, AdapterError> {
    let mut servers = Vec::new();

    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        if entry.contains("stun:") {
            servers.push(RTCIceServer {
                urls: vec![entry.to_string()],
                ..Default::default()
            });
            continue;
        }

        let (auth, url) = entry
            .split_once('@')
            .ok_or(AdapterError::InvalidTurnServerAddr)?;
        let (username, credential) = auth
            .split_once(':')
            .ok_or(AdapterError::MissingTurnCredentials)?;

        servers.push(RTCIceServer {
            urls: vec![url.to_string()],
            username: username.to_string(),
            credential: credential.to_string(),
            credential_type: RTCIceCredentialType::Password,
            ..Default::default()
        });
    }

    Ok(servers)
}
