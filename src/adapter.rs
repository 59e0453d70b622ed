use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::{parse_ice_servers, AdapterConfig};
use crate::crypto::{self, CryptoError};
use crate::protocol::Envelope;
use crate::registry::{EnqueueOutcome, PeerEntry, PeerRegistry};
use crate::stream::{ChannelEvent, ChannelStream, PeerHandle};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid TURN server address")]
    InvalidTurnServerAddr,
    #[error("missing TURN server credentials")]
    MissingTurnCredentials,
    #[error("invalid signaler url: {0}")]
    InvalidSignalerUrl(#[from] url::ParseError),
    #[error("adapter already opened")]
    AlreadyOpened,
}

/// Errors that end the current signaler session. The outer loop backs off
/// and reconnects; only shutdown ends the adapter.
#[derive(Debug, Error)]
enum SessionError {
    #[error("dial timed out")]
    DialTimeout,
    #[error("read deadline expired")]
    ReadTimeout,
    #[error("write timed out")]
    WriteTimeout,
    #[error("signaling socket closed")]
    SocketClosed,
    #[error("websocket transport: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("ice engine: {0}")]
    Engine(#[from] webrtc::Error),
    #[error("envelope codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("envelope seal: {0}")]
    Seal(#[from] CryptoError),
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// State owned by the session loop and the per-peer engine callbacks.
struct Shared {
    url: Url,
    community: String,
    key: Vec<u8>,
    ice_servers: Vec<RTCIceServer>,
    config: AdapterConfig,
    registry: PeerRegistry,
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    peer_tx: mpsc::UnboundedSender<PeerHandle>,
    token: CancellationToken,
}

/// Client for a signaling community.
///
/// Joins the community named by the signaler URL, negotiates an encrypted
/// WebRTC session with every other member, and surfaces each opened data
/// channel as a [`PeerHandle`]. The signaling connection is kept alive with
/// pings and re-dialed with a back-off when it drops; every reconnect starts
/// from an empty peer registry.
pub struct Adapter {
    signaler: String,
    key: Vec<u8>,
    ice: Vec<String>,
    config: AdapterConfig,
    token: CancellationToken,
    peer_tx: StdMutex<Option<mpsc::UnboundedSender<PeerHandle>>>,
    peer_rx: AsyncMutex<mpsc::UnboundedReceiver<PeerHandle>>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Adapter {
    /// `signaler` is a websocket URL whose `community` query parameter names
    /// the room; `key` is the shared community key. Cancelling `shutdown`
    /// closes the adapter.
    pub fn new(
        signaler: impl Into<String>,
        key: impl Into<Vec<u8>>,
        ice: Vec<String>,
        config: AdapterConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            signaler: signaler.into(),
            key: key.into(),
            ice,
            config: config.normalized(),
            token: shutdown.child_token(),
            peer_tx: StdMutex::new(Some(peer_tx)),
            peer_rx: AsyncMutex::new(peer_rx),
            task: AsyncMutex::new(None),
        }
    }

    /// Starts the session loop. Returns a receiver yielding the local
    /// identity of each successful signaler session; it ends when the
    /// adapter closes. Configuration errors surface here and nothing is
    /// started.
    pub async fn open(&self) -> Result<mpsc::UnboundedReceiver<String>, AdapterError> {
        let url = Url::parse(&self.signaler)?;
        let community = community_of(&url);
        let ice_servers = parse_ice_servers(&self.ice)?;

        let peer_tx = self
            .peer_tx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(AdapterError::AlreadyOpened)?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (ids_tx, ids_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            url,
            community,
            key: self.key.clone(),
            ice_servers,
            config: self.config.clone(),
            registry: PeerRegistry::new(self.config.verbose),
            outbound_tx,
            peer_tx,
            token: self.token.clone(),
        });

        let handle = tokio::spawn(run_loop(shared, outbound_rx, ids_tx));
        *self.task.lock().await = Some(handle);
        Ok(ids_rx)
    }

    /// Waits for the next peer channel to open. Returns `None` once the
    /// adapter has closed and all pending handles were consumed.
    pub async fn accept(&self) -> Option<PeerHandle> {
        let mut peers = self.peer_rx.lock().await;
        peers.recv().await
    }

    /// Shuts the adapter down and waits for the session loop to finish
    /// tearing down peers. Idempotent.
    pub async fn close(&self) {
        self.token.cancel();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        self.token.cancel();
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

fn community_of(url: &Url) -> String {
    url.query_pairs()
        .find(|(key, _)| key == "community")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default()
}

fn session_identity(configured: &str) -> String {
    if configured.trim().is_empty() {
        Uuid::new_v4().to_string()
    } else {
        configured.to_string()
    }
}

/// Outer reconnect loop: one signaler session per iteration, an empty peer
/// registry at the start of each, a full teardown at the end of each, and a
/// `timeout`-long back-off in between.
async fn run_loop(
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    ids_tx: mpsc::UnboundedSender<String>,
) {
    loop {
        if shared.token.is_cancelled() {
            break;
        }
        shared.registry.clear().await;

        let result = run_session(&shared, &mut outbound_rx, &ids_tx).await;
        shared.registry.clear().await;

        match result {
            Ok(()) => break,
            Err(err) => {
                if shared.config.verbose {
                    debug!(signaler = %shared.url, error = %err, "signaler session ended");
                }
            }
        }

        if shared.config.verbose {
            debug!(
                signaler = %shared.url,
                backoff = ?shared.config.timeout,
                "reconnecting to signaler"
            );
        }
        tokio::select! {
            _ = shared.token.cancelled() => break,
            _ = sleep(shared.config.timeout) => {}
        }
    }
    shared.registry.clear().await;
}

/// One signaler session: dial, introduce, then multiplex inbound frames,
/// outbound envelopes, and keepalives until a transport or engine fault.
/// `Ok(())` means shutdown was requested.
async fn run_session(
    shared: &Arc<Shared>,
    outbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    ids_tx: &mpsc::UnboundedSender<String>,
) -> Result<(), SessionError> {
    let config = &shared.config;

    // Envelopes queued by a dead session must not leak into this one; the
    // introduction is the first frame of every session.
    while outbound_rx.try_recv().is_ok() {}

    let (socket, _) = timeout(config.timeout, connect_async(shared.url.as_str()))
        .await
        .map_err(|_| SessionError::DialTimeout)??;
    if config.verbose {
        debug!(signaler = %shared.url, community = %shared.community, "connected to signaler");
    }
    let (mut sink, mut source) = socket.split();

    let id = session_identity(&config.id);
    let _ = ids_tx.send(id.clone());

    send_frame(&mut sink, &Envelope::Introduction { from: id.clone() }, shared).await?;
    if config.verbose {
        debug!(%id, signaler = %shared.url, "introduced to community");
    }

    let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
    let session = Session {
        shared: shared.clone(),
        id,
        fault_tx,
    };

    let mut keepalive = interval_at(
        Instant::now() + config.timeout / 2,
        config.timeout / 2,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let read_deadline = sleep(config.timeout);
    tokio::pin!(read_deadline);

    loop {
        tokio::select! {
            _ = shared.token.cancelled() => return Ok(()),
            () = &mut read_deadline => return Err(SessionError::ReadTimeout),
            frame = source.next() => {
                read_deadline.as_mut().reset(Instant::now() + config.timeout);
                match frame {
                    None => return Err(SessionError::SocketClosed),
                    Some(Err(err)) => return Err(SessionError::Transport(err)),
                    Some(Ok(Message::Text(text))) => session.dispatch(text.as_bytes()).await?,
                    Some(Ok(Message::Binary(data))) => session.dispatch(&data).await?,
                    Some(Ok(Message::Close(_))) => return Err(SessionError::SocketClosed),
                    // Pings and pongs only re-arm the read deadline.
                    Some(Ok(_)) => {}
                }
            }
            envelope = outbound_rx.recv() => {
                match envelope {
                    Some(envelope) => send_frame(&mut sink, &envelope, shared).await?,
                    None => return Ok(()),
                }
            }
            fault = fault_rx.recv() => {
                if let Some(fault) = fault {
                    return Err(fault);
                }
            }
            _ = keepalive.tick() => {
                if config.verbose {
                    debug!(signaler = %shared.url, "sending keepalive ping");
                }
                write_with_deadline(&mut sink, Message::Ping(Vec::new()), shared).await?;
            }
        }
    }
}

/// Encrypts an envelope with the community key and writes it as one text
/// frame, bounded by the write deadline.
async fn send_frame(
    sink: &mut WsSink,
    envelope: &Envelope,
    shared: &Shared,
) -> Result<(), SessionError> {
    let plaintext = serde_json::to_vec(envelope)?;
    let sealed = crypto::seal(&plaintext, &shared.key)?;
    if shared.config.verbose {
        debug!(
            kind = envelope.kind(),
            len = sealed.len(),
            community = %shared.community,
            "sending envelope"
        );
    }
    write_with_deadline(sink, Message::Text(sealed), shared).await
}

async fn write_with_deadline(
    sink: &mut WsSink,
    message: Message,
    shared: &Shared,
) -> Result<(), SessionError> {
    timeout(shared.config.timeout, sink.send(message))
        .await
        .map_err(|_| SessionError::WriteTimeout)?
        .map_err(SessionError::Transport)
}

/// Per-session dispatch state: the identity announced on this session plus
/// a channel for faults raised by candidate drain tasks.
struct Session {
    shared: Arc<Shared>,
    id: String,
    fault_tx: mpsc::UnboundedSender<SessionError>,
}

impl Session {
    async fn dispatch(&self, frame: &[u8]) -> Result<(), SessionError> {
        let shared = &self.shared;

        let plaintext = match crypto::open(frame, &shared.key) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(
                    len = frame.len(),
                    community = %shared.community,
                    error = %err,
                    "dropping frame that failed decryption"
                );
                return Ok(());
            }
        };
        let envelope: Envelope = match serde_json::from_slice(&plaintext) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(community = %shared.community, error = %err, "dropping unparseable envelope");
                return Ok(());
            }
        };

        if shared.config.verbose {
            debug!(
                kind = envelope.kind(),
                from = envelope.sender(),
                community = %shared.community,
                "received envelope"
            );
        }

        match envelope {
            Envelope::Introduction { from } => self.on_introduction(from).await,
            Envelope::Offer { from, to, payload } => self.on_offer(from, to, payload).await,
            Envelope::Answer { from, to, payload } => self.on_answer(from, to, payload).await,
            Envelope::Candidate { from, to, payload } => self.on_candidate(from, to, payload).await,
        }
    }

    /// A peer announced itself: negotiate a fresh session towards it, even if
    /// one already exists (a rejoin supersedes the old session).
    async fn on_introduction(&self, from: String) -> Result<(), SessionError> {
        let shared = &self.shared;
        if from == self.id {
            if shared.config.verbose {
                debug!("ignoring our own introduction echoed by the signaler");
            }
            return Ok(());
        }

        let conn = self.new_peer_connection().await?;
        let iid = Uuid::new_v4().to_string();
        self.install_peer_callbacks(&conn, &from, &iid);

        let channel = conn
            .create_data_channel(&shared.config.primary_channel_id, None)
            .await?;
        wire_channel(shared, &from, &iid, channel.clone());

        let offer = conn.create_offer(None).await?;
        let payload = serde_json::to_value(&offer)?;

        let mut entry = PeerEntry::new(conn.clone(), iid);
        entry
            .channels
            .insert(channel.label().to_string(), channel);
        shared.registry.upsert(&from, entry).await;

        // The offer goes on the wire queue before gathering starts, so it
        // always precedes this session's candidates.
        let _ = shared.outbound_tx.send(Envelope::Offer {
            from: self.id.clone(),
            to: from.clone(),
            payload,
        });
        conn.set_local_description(offer).await?;

        if shared.config.verbose {
            debug!(peer = %from, "sent offer");
        }
        Ok(())
    }

    /// A peer offered us a session: answer it and start applying its queued
    /// candidates.
    async fn on_offer(&self, from: String, to: String, payload: Value) -> Result<(), SessionError> {
        let shared = &self.shared;
        if to != self.id {
            if shared.config.verbose {
                debug!(%from, %to, "discarding offer not addressed to us");
            }
            return Ok(());
        }
        let sdp: RTCSessionDescription = match serde_json::from_value(payload) {
            Ok(sdp) => sdp,
            Err(err) => {
                warn!(peer = %from, error = %err, "dropping offer with malformed description");
                return Ok(());
            }
        };

        let conn = self.new_peer_connection().await?;
        let iid = Uuid::new_v4().to_string();
        self.install_peer_callbacks(&conn, &from, &iid);

        conn.set_remote_description(sdp).await?;
        let answer = conn.create_answer(None).await?;
        let payload = serde_json::to_value(&answer)?;

        let mut entry = PeerEntry::new(conn.clone(), iid);
        let candidates = entry.take_candidate_rx();
        shared.registry.upsert(&from, entry).await;
        if let Some(candidates) = candidates {
            self.spawn_candidate_drain(conn.clone(), from.clone(), candidates);
        }

        let _ = shared.outbound_tx.send(Envelope::Answer {
            from: self.id.clone(),
            to: from.clone(),
            payload,
        });
        conn.set_local_description(answer).await?;

        if shared.config.verbose {
            debug!(peer = %from, "sent answer");
        }
        Ok(())
    }

    /// A peer answered our offer: apply the description and start draining
    /// its candidate queue.
    async fn on_answer(&self, from: String, to: String, payload: Value) -> Result<(), SessionError> {
        let shared = &self.shared;
        if to != self.id {
            if shared.config.verbose {
                debug!(%from, %to, "discarding answer not addressed to us");
            }
            return Ok(());
        }
        let sdp: RTCSessionDescription = match serde_json::from_value(payload) {
            Ok(sdp) => sdp,
            Err(err) => {
                warn!(peer = %from, error = %err, "dropping answer with malformed description");
                return Ok(());
            }
        };
        let Some(conn) = shared.registry.connection(&from).await else {
            if shared.config.verbose {
                debug!(peer = %from, "answer from unknown peer, skipping");
            }
            return Ok(());
        };

        conn.set_remote_description(sdp).await?;
        if let Some(candidates) = shared.registry.take_candidate_rx(&from).await {
            self.spawn_candidate_drain(conn, from.clone(), candidates);
        }

        if shared.config.verbose {
            debug!(peer = %from, "applied answer");
        }
        Ok(())
    }

    /// A remote candidate arrived; queue it for the peer's drain task. The
    /// queue may already be gone if the session was torn down in between.
    async fn on_candidate(
        &self,
        from: String,
        to: String,
        payload: String,
    ) -> Result<(), SessionError> {
        let shared = &self.shared;
        if to != self.id {
            if shared.config.verbose {
                debug!(%from, %to, "discarding candidate not addressed to us");
            }
            return Ok(());
        }
        let candidate = RTCIceCandidateInit {
            candidate: payload,
            ..Default::default()
        };
        match shared.registry.enqueue_candidate(&from, candidate).await {
            EnqueueOutcome::Queued => {
                if shared.config.verbose {
                    debug!(peer = %from, "queued remote candidate");
                }
            }
            EnqueueOutcome::UnknownPeer => {
                if shared.config.verbose {
                    debug!(peer = %from, "candidate for unknown peer, skipping");
                }
            }
            EnqueueOutcome::QueueClosed => {
                if shared.config.verbose {
                    debug!(peer = %from, "candidate queue closed, skipping");
                }
            }
            EnqueueOutcome::QueueFull => {
                warn!(peer = %from, "candidate queue full, dropping candidate");
            }
        }
        Ok(())
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, SessionError> {
        let api = APIBuilder::new().build();
        let conn = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: self.shared.ice_servers.clone(),
                ..Default::default()
            })
            .await?;
        Ok(Arc::new(conn))
    }

    /// Installs the per-peer engine callbacks: terminal-state cleanup guarded
    /// by the instance token, local-candidate publication, and wiring for
    /// remotely opened data channels.
    fn install_peer_callbacks(&self, conn: &Arc<RTCPeerConnection>, peer_id: &str, iid: &str) {
        let state_shared = self.shared.clone();
        let state_peer = peer_id.to_string();
        let state_iid = iid.to_string();
        conn.on_peer_connection_state_change(Box::new(move |state| {
            if matches!(
                state,
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
            ) {
                let shared = state_shared.clone();
                let peer = state_peer.clone();
                let iid = state_iid.clone();
                // Registry work happens on its own task; the engine may be
                // waiting on this callback while a teardown holds the lock.
                tokio::spawn(async move {
                    if shared.config.verbose {
                        debug!(%peer, ?state, "peer connection lost");
                    }
                    if !shared.registry.remove_if_matches(&peer, &iid).await
                        && shared.config.verbose
                    {
                        debug!(%peer, "peer already rejoined, keeping new session");
                    }
                });
            }
            Box::pin(async {})
        }));

        let candidate_shared = self.shared.clone();
        let candidate_from = self.id.clone();
        let candidate_to = peer_id.to_string();
        conn.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let shared = candidate_shared.clone();
            let from = candidate_from.clone();
            let to = candidate_to.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        if shared.config.verbose {
                            debug!(peer = %to, "publishing local candidate");
                        }
                        let _ = shared.outbound_tx.send(Envelope::Candidate {
                            from,
                            to,
                            payload: init.candidate,
                        });
                    }
                    Err(err) => {
                        warn!(peer = %to, error = %err, "serializing local candidate failed");
                    }
                }
            })
        }));

        let dc_shared = self.shared.clone();
        let dc_peer = peer_id.to_string();
        let dc_iid = iid.to_string();
        conn.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            wire_channel(&dc_shared, &dc_peer, &dc_iid, channel);
            Box::pin(async {})
        }));
    }

    /// Applies queued remote candidates after the remote description is set.
    /// The task ends when the entry (and with it the queue's sender) goes
    /// away; an engine failure is fatal to the session.
    fn spawn_candidate_drain(
        &self,
        conn: Arc<RTCPeerConnection>,
        peer: String,
        mut candidates: mpsc::Receiver<RTCIceCandidateInit>,
    ) {
        let shared = self.shared.clone();
        let faults = self.fault_tx.clone();
        tokio::spawn(async move {
            while let Some(candidate) = candidates.recv().await {
                if let Err(err) = conn.add_ice_candidate(candidate).await {
                    let _ = faults.send(SessionError::Engine(err));
                    return;
                }
                if shared.config.verbose {
                    debug!(peer = %peer, "added remote candidate");
                }
            }
        });
    }
}

/// Hooks a data channel (locally created or remotely announced) up to the
/// registry and the host: on open it is recorded on the peer's entry and a
/// [`PeerHandle`] is emitted, on close it is deregistered and closed. Both
/// paths carry the session instance token so events from a superseded
/// session cannot touch the replacement entry.
fn wire_channel(shared: &Arc<Shared>, peer_id: &str, iid: &str, channel: Arc<RTCDataChannel>) {
    let (stream, events_tx) = ChannelStream::wire(channel.clone());
    let slot = Arc::new(StdMutex::new(Some(stream)));

    let open_shared = shared.clone();
    let open_peer = peer_id.to_string();
    let open_iid = iid.to_string();
    let open_channel = channel.clone();
    channel.on_open(Box::new(move || {
        let shared = open_shared.clone();
        let peer = open_peer.clone();
        let iid = open_iid.clone();
        let channel = open_channel.clone();
        let stream = slot.lock().ok().and_then(|mut slot| slot.take());
        Box::pin(async move {
            let label = channel.label().to_string();
            if !shared.registry.register_channel(&peer, &iid, channel).await {
                if shared.config.verbose {
                    debug!(%peer, %label, "channel opened for a retired session");
                }
                return;
            }
            if shared.config.verbose {
                debug!(%peer, %label, "channel open");
            }
            if let Some(conn) = stream {
                let _ = shared.peer_tx.send(PeerHandle {
                    peer_id: peer,
                    channel_id: label,
                    conn,
                });
            }
        })
    }));

    let close_shared = shared.clone();
    let close_peer = peer_id.to_string();
    let close_iid = iid.to_string();
    let close_channel = channel.clone();
    channel.on_close(Box::new(move || {
        let shared = close_shared.clone();
        let peer = close_peer.clone();
        let iid = close_iid.clone();
        let channel = close_channel.clone();
        let events = events_tx.clone();
        Box::pin(async move {
            let label = channel.label().to_string();
            // Same rule as the state-change callback: registry work off the
            // engine's task. Spawned before the end-of-stream notification,
            // whose delivery waits behind any unread datagrams.
            {
                let shared = shared.clone();
                let peer = peer.clone();
                let label = label.clone();
                tokio::spawn(async move {
                    if let Some(channel) =
                        shared.registry.remove_channel(&peer, &iid, &label).await
                    {
                        let _ = channel.close().await;
                        if shared.config.verbose {
                            debug!(%peer, %label, "channel closed");
                        }
                    } else if shared.config.verbose {
                        debug!(%peer, %label, "close event for unknown channel");
                    }
                });
            }
            let _ = events.send(ChannelEvent::Closed).await;
        })
    }));
}
