use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

/// Remote candidates buffered until the remote description is applied.
const CANDIDATE_QUEUE_DEPTH: usize = 32;

/// Live state for one negotiated (or negotiating) peer session.
pub(crate) struct PeerEntry {
    pub conn: Arc<RTCPeerConnection>,
    pub channels: HashMap<String, Arc<RTCDataChannel>>,
    /// Session instance token. Distinguishes a disconnect event of this
    /// session from one of a superseded session with the same peer id.
    pub iid: String,
    candidate_tx: mpsc::Sender<RTCIceCandidateInit>,
    candidate_rx: Option<mpsc::Receiver<RTCIceCandidateInit>>,
}

impl PeerEntry {
    pub fn new(conn: Arc<RTCPeerConnection>, iid: String) -> Self {
        let (candidate_tx, candidate_rx) = mpsc::channel(CANDIDATE_QUEUE_DEPTH);
        Self {
            conn,
            channels: HashMap::new(),
            iid,
            candidate_tx,
            candidate_rx: Some(candidate_rx),
        }
    }

    /// Takes the receiving half of the candidate queue, once. The caller
    /// drains it after the remote description has been applied.
    pub fn take_candidate_rx(&mut self) -> Option<mpsc::Receiver<RTCIceCandidateInit>> {
        self.candidate_rx.take()
    }

    /// Closes every channel and the connection. Close errors are logged and
    /// swallowed so teardown always runs to completion; dropping the entry
    /// drops the candidate sender, which ends any drain task.
    async fn teardown(self, verbose: bool) {
        for (label, channel) in &self.channels {
            if let Err(err) = channel.close().await {
                if verbose {
                    debug!(%label, error = %err, "closing data channel failed");
                }
            }
        }
        if let Err(err) = self.conn.close().await {
            if verbose {
                debug!(error = %err, "closing peer connection failed");
            }
        }
    }
}

/// Result of routing a remote candidate to a peer's queue.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EnqueueOutcome {
    Queued,
    UnknownPeer,
    QueueClosed,
    QueueFull,
}

/// Mapping from remote peer identity to its live session. All access runs
/// inside one mutex so at most one entry per peer is ever visible.
pub(crate) struct PeerRegistry {
    peers: Mutex<HashMap<String, PeerEntry>>,
    verbose: bool,
}

impl PeerRegistry {
    pub fn new(verbose: bool) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            verbose,
        }
    }

    /// Installs a fresh entry for `peer_id`, fully retiring any previous one
    /// before the new entry becomes visible to lookups.
    pub async fn upsert(&self, peer_id: &str, entry: PeerEntry) {
        let mut peers = self.peers.lock().await;
        if let Some(old) = peers.remove(peer_id) {
            if self.verbose {
                debug!(peer = peer_id, "superseding existing peer session");
            }
            old.teardown(self.verbose).await;
        }
        peers.insert(peer_id.to_string(), entry);
    }

    /// Removes and tears down the entry only if its instance token matches.
    /// A stale disconnect from a superseded session is a no-op. Returns
    /// whether an entry was removed.
    pub async fn remove_if_matches(&self, peer_id: &str, iid: &str) -> bool {
        let mut peers = self.peers.lock().await;
        let matches = peers
            .get(peer_id)
            .map(|entry| entry.iid == iid)
            .unwrap_or(false);
        if !matches {
            return false;
        }
        if let Some(entry) = peers.remove(peer_id) {
            entry.teardown(self.verbose).await;
        }
        true
    }

    /// Tears down every entry. Called when a signaler session ends.
    pub async fn clear(&self) {
        let mut peers = self.peers.lock().await;
        for (_, entry) in peers.drain() {
            entry.teardown(self.verbose).await;
        }
    }

    /// Connection handle for a peer, if a session exists.
    pub async fn connection(&self, peer_id: &str) -> Option<Arc<RTCPeerConnection>> {
        let peers = self.peers.lock().await;
        peers.get(peer_id).map(|entry| entry.conn.clone())
    }

    /// Takes the receiving half of a peer's candidate queue, once. The
    /// caller drains it after the remote description has been applied.
    pub async fn take_candidate_rx(
        &self,
        peer_id: &str,
    ) -> Option<mpsc::Receiver<RTCIceCandidateInit>> {
        let mut peers = self.peers.lock().await;
        peers
            .get_mut(peer_id)
            .and_then(|entry| entry.candidate_rx.take())
    }

    /// Routes a remote candidate to the peer's queue without blocking.
    pub async fn enqueue_candidate(
        &self,
        peer_id: &str,
        candidate: RTCIceCandidateInit,
    ) -> EnqueueOutcome {
        let peers = self.peers.lock().await;
        let Some(entry) = peers.get(peer_id) else {
            return EnqueueOutcome::UnknownPeer;
        };
        match entry.candidate_tx.try_send(candidate) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::QueueClosed,
            Err(mpsc::error::TrySendError::Full(_)) => EnqueueOutcome::QueueFull,
        }
    }

    /// Records an opened data channel on the peer's entry. The instance
    /// token must match: a channel belonging to a superseded session must
    /// not attach itself to the replacement entry.
    pub async fn register_channel(
        &self,
        peer_id: &str,
        iid: &str,
        channel: Arc<RTCDataChannel>,
    ) -> bool {
        let mut peers = self.peers.lock().await;
        match peers.get_mut(peer_id) {
            Some(entry) if entry.iid == iid => {
                entry
                    .channels
                    .insert(channel.label().to_string(), channel);
                true
            }
            _ => false,
        }
    }

    /// Forgets a closed data channel, handing the handle back for closing.
    /// Guarded by the instance token for the same reason as registration: a
    /// stale close event must not evict the superseding session's channel.
    pub async fn remove_channel(
        &self,
        peer_id: &str,
        iid: &str,
        label: &str,
    ) -> Option<Arc<RTCDataChannel>> {
        let mut peers = self.peers.lock().await;
        match peers.get_mut(peer_id) {
            Some(entry) if entry.iid == iid => entry.channels.remove(label),
            _ => None,
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    #[cfg(test)]
    pub async fn iid_of(&self, peer_id: &str) -> Option<String> {
        let peers = self.peers.lock().await;
        peers.get(peer_id).map(|entry| entry.iid.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

    async fn new_conn() -> Arc<RTCPeerConnection> {
        let api = APIBuilder::new().build();
        Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .expect("peer connection"),
        )
    }

    #[tokio::test]
    async fn upsert_supersedes_and_tears_down_the_old_entry() {
        let registry = PeerRegistry::new(false);
        let old_conn = new_conn().await;

        registry
            .upsert("b", PeerEntry::new(old_conn.clone(), "iid-1".to_string()))
            .await;
        registry
            .upsert("b", PeerEntry::new(new_conn().await, "iid-2".to_string()))
            .await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.iid_of("b").await.as_deref(), Some("iid-2"));
        assert_eq!(
            old_conn.connection_state(),
            RTCPeerConnectionState::Closed
        );
    }

    #[tokio::test]
    async fn stale_disconnect_does_not_evict_a_superseding_session() {
        let registry = PeerRegistry::new(false);
        registry
            .upsert("b", PeerEntry::new(new_conn().await, "iid-1".to_string()))
            .await;
        registry
            .upsert("b", PeerEntry::new(new_conn().await, "iid-2".to_string()))
            .await;

        assert!(!registry.remove_if_matches("b", "iid-1").await);
        assert_eq!(registry.iid_of("b").await.as_deref(), Some("iid-2"));

        assert!(registry.remove_if_matches("b", "iid-2").await);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn clear_empties_the_registry() {
        let registry = PeerRegistry::new(false);
        registry
            .upsert("a", PeerEntry::new(new_conn().await, "iid-1".to_string()))
            .await;
        registry
            .upsert("b", PeerEntry::new(new_conn().await, "iid-2".to_string()))
            .await;

        registry.clear().await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn candidate_routing_outcomes() {
        let registry = PeerRegistry::new(false);
        let init = RTCIceCandidateInit {
            candidate: "candidate:0".to_string(),
            ..Default::default()
        };

        assert_eq!(
            registry.enqueue_candidate("ghost", init.clone()).await,
            EnqueueOutcome::UnknownPeer
        );

        registry
            .upsert("b", PeerEntry::new(new_conn().await, "iid-1".to_string()))
            .await;
        assert_eq!(
            registry.enqueue_candidate("b", init.clone()).await,
            EnqueueOutcome::Queued
        );

        // Dropping the receiving half closes the queue; later enqueues are
        // silent skips for the dispatcher.
        let rx = registry.take_candidate_rx("b").await.expect("receiver");
        drop(rx);
        assert_eq!(
            registry.enqueue_candidate("b", init).await,
            EnqueueOutcome::QueueClosed
        );
    }

    #[tokio::test]
    async fn candidate_queue_reports_overflow() {
        let registry = PeerRegistry::new(false);
        registry
            .upsert("b", PeerEntry::new(new_conn().await, "iid-1".to_string()))
            .await;

        let init = RTCIceCandidateInit {
            candidate: "candidate:0".to_string(),
            ..Default::default()
        };
        for _ in 0..CANDIDATE_QUEUE_DEPTH {
            assert_eq!(
                registry.enqueue_candidate("b", init.clone()).await,
                EnqueueOutcome::Queued
            );
        }
        assert_eq!(
            registry.enqueue_candidate("b", init).await,
            EnqueueOutcome::QueueFull
        );
    }

    #[tokio::test]
    async fn channel_registration_follows_the_entry() {
        let registry = PeerRegistry::new(false);
        let conn = new_conn().await;
        let channel = conn
            .create_data_channel("primary", None)
            .await
            .expect("data channel");

        assert!(!registry.register_channel("b", "iid-1", channel.clone()).await);

        registry
            .upsert("b", PeerEntry::new(conn.clone(), "iid-1".to_string()))
            .await;
        assert!(registry.register_channel("b", "iid-1", channel.clone()).await);
        assert!(registry.remove_channel("b", "iid-1", "primary").await.is_some());
        assert!(registry.remove_channel("b", "iid-1", "primary").await.is_none());
    }

    #[tokio::test]
    async fn stale_channel_events_do_not_touch_a_superseding_session() {
        let registry = PeerRegistry::new(false);
        let old_conn = new_conn().await;
        let old_channel = old_conn
            .create_data_channel("primary", None)
            .await
            .expect("data channel");

        registry
            .upsert("b", PeerEntry::new(old_conn, "iid-1".to_string()))
            .await;

        let new_conn_handle = new_conn().await;
        let new_channel = new_conn_handle
            .create_data_channel("primary", None)
            .await
            .expect("data channel");
        registry
            .upsert("b", PeerEntry::new(new_conn_handle, "iid-2".to_string()))
            .await;
        assert!(registry.register_channel("b", "iid-2", new_channel).await);

        // Late events from the first session bounce off the new entry.
        assert!(!registry.register_channel("b", "iid-1", old_channel).await);
        assert!(registry.remove_channel("b", "iid-1", "primary").await.is_none());
        assert!(registry.remove_channel("b", "iid-2", "primary").await.is_some());
    }
}
