//! Signaling sessions
//!
//! One session per WebSocket connection:
//!
//! ```text
//! Connected --offer--> Negotiating --answer sent--> Active
//!     |                     |                          |
//!     +---------------------+--- close / error --------+--> Closed
//! ```
//!
//! `play`, `pause` and `seek` go to the shared [`PlaybackController`] in any
//! state before `Closed`.

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::peer::PeerSession;
use super::signaling::{parse_offer, parse_seek, ControlEvent, ControlMessage};
use crate::error::{AppError, Result};
use crate::playback::PlaybackController;

/// Lifecycle of one signaling session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connected,
    Negotiating,
    Active,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connected => write!(f, "connected"),
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Snapshot of a live session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    pub state: SessionState,
}

struct SessionEntry {
    info: SessionInfo,
    cancel: CancellationToken,
}

/// Live sessions of the process
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session, returning its id and cancellation token
    pub async fn register(&self) -> (String, CancellationToken) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let cancel = self.shutdown.child_token();

        let entry = SessionEntry {
            info: SessionInfo {
                session_id: session_id.clone(),
                connected_at: Utc::now(),
                state: SessionState::Connected,
            },
            cancel: cancel.clone(),
        };
        self.sessions.write().await.insert(session_id.clone(), entry);

        (session_id, cancel)
    }

    pub async fn set_state(&self, session_id: &str, state: SessionState) {
        if let Some(entry) = self.sessions.write().await.get_mut(session_id) {
            entry.info.state = state;
        }
    }

    pub async fn remove(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        sessions.sort_by_key(|info| info.connected_at);
        sessions
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Ask every session, present and future, to close
    pub fn close_all(&self) {
        self.shutdown.cancel();
    }
}

/// Per-connection signaling state machine
pub struct SignalingSession {
    id: String,
    state: SessionState,
    peer: Box<dyn PeerSession>,
    controller: Arc<PlaybackController>,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
}

impl SignalingSession {
    pub fn new(
        id: String,
        peer: Box<dyn PeerSession>,
        controller: Arc<PlaybackController>,
        registry: Arc<SessionRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            state: SessionState::Connected,
            peer,
            controller,
            registry,
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    async fn transition(&mut self, state: SessionState) {
        debug!(session_id = %self.id, "Session {} -> {}", self.state, state);
        self.state = state;
        self.registry.set_state(&self.id, state).await;
    }

    /// Drive the session until the connection ends, then release the peer
    /// connection and deregister. Never fails: errors end this session only.
    pub async fn run<S, W>(mut self, mut inbound: S, mut outbound: W)
    where
        S: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin,
        W: Sink<Message> + Unpin,
        W::Error: std::fmt::Display,
    {
        info!(session_id = %self.id, "Signaling session opened");

        loop {
            let msg = tokio::select! {
                msg = inbound.next() => msg,
                _ = self.cancel.cancelled() => {
                    debug!(session_id = %self.id, "Session cancelled");
                    let _ = outbound.send(Message::Close(None)).await;
                    break;
                }
            };

            let text = match msg {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => {
                    debug!(session_id = %self.id, "Client closed the connection");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(session_id = %self.id, "WebSocket read failed: {}", e);
                    break;
                }
            };

            match self.handle_text(&text).await {
                Ok(Some(reply)) => {
                    if let Err(e) = outbound.send(Message::Text(reply)).await {
                        debug!(session_id = %self.id, "Reply not delivered: {}", e);
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(session_id = %self.id, "Closing session: {}", e);
                    break;
                }
            }
        }

        self.close().await;
    }

    /// Handle one text frame; `Ok(Some)` is a reply for the client, `Err`
    /// ends the session
    async fn handle_text(&mut self, text: &str) -> Result<Option<String>> {
        let message = ControlMessage::parse(text)?;

        match message.into_event() {
            ControlEvent::Offer(data) => self.handle_offer(&data).await.map(Some),
            ControlEvent::Play => {
                if let Err(e) = self.controller.play().await {
                    warn!(session_id = %self.id, "Play failed: {}", e);
                }
                Ok(None)
            }
            ControlEvent::Pause => {
                if let Err(e) = self.controller.pause().await {
                    warn!(session_id = %self.id, "Pause failed: {}", e);
                }
                Ok(None)
            }
            ControlEvent::Seek(data) => {
                match parse_seek(&data) {
                    Some(position) => {
                        if let Err(e) = self.controller.seek(position).await {
                            warn!(session_id = %self.id, "Seek failed: {}", e);
                        }
                    }
                    None => {
                        warn!(session_id = %self.id, "Ignoring seek with invalid position {:?}", data);
                    }
                }
                Ok(None)
            }
            ControlEvent::Unknown(event) => {
                debug!(session_id = %self.id, "Ignoring unknown event {:?}", event);
                Ok(None)
            }
        }
    }

    async fn handle_offer(&mut self, data: &str) -> Result<String> {
        if self.state != SessionState::Connected {
            return Err(AppError::Protocol(format!(
                "Offer received while {}",
                self.state
            )));
        }

        let offer = parse_offer(data)?;
        self.transition(SessionState::Negotiating).await;

        let answer = self.peer.accept_offer(offer).await?;
        let reply = ControlMessage::answer(&answer)?.to_json()?;

        self.transition(SessionState::Active).await;
        info!(session_id = %self.id, "Answer ready");
        Ok(reply)
    }

    async fn close(mut self) {
        self.transition(SessionState::Closed).await;
        if let Err(e) = self.peer.close().await {
            warn!(session_id = %self.id, "Peer close failed: {}", e);
        }
        self.registry.remove(&self.id).await;
        info!(session_id = %self.id, "Signaling session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaSource, SampleEmitter};
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

    #[derive(Default)]
    struct PeerLog {
        offers: AtomicUsize,
        closes: AtomicUsize,
    }

    struct StubPeer {
        log: Arc<PeerLog>,
    }

    #[async_trait]
    impl PeerSession for StubPeer {
        async fn accept_offer(
            &self,
            offer: RTCSessionDescription,
        ) -> Result<RTCSessionDescription> {
            self.log.offers.fetch_add(1, Ordering::SeqCst);
            let mut answer = RTCSessionDescription::default();
            answer.sdp_type = RTCSdpType::Answer;
            answer.sdp = offer.sdp;
            Ok(answer)
        }

        async fn close(&self) -> Result<()> {
            self.log.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct SourceLog {
        seeks: Mutex<Vec<Duration>>,
        plays: AtomicUsize,
    }

    struct StubSource {
        log: Arc<SourceLog>,
    }

    impl MediaSource for StubSource {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn start(&mut self, _emitter: SampleEmitter) -> Result<()> {
            Ok(())
        }

        fn play(&mut self) -> Result<()> {
            self.log.plays.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn pause(&mut self) -> Result<()> {
            Ok(())
        }

        fn seek(&mut self, position: Duration) -> Result<()> {
            self.log.seeks.lock().push(position);
            Ok(())
        }
    }

    struct Harness {
        client_tx: mpsc::UnboundedSender<std::result::Result<Message, axum::Error>>,
        server_rx: mpsc::UnboundedReceiver<Message>,
        peer: Arc<PeerLog>,
        source: Arc<SourceLog>,
        registry: Arc<SessionRegistry>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn harness() -> Harness {
        let peer = Arc::new(PeerLog::default());
        let source = Arc::new(SourceLog::default());
        let controller = Arc::new(PlaybackController::new(Box::new(StubSource {
            log: source.clone(),
        })));
        let registry = Arc::new(SessionRegistry::new());
        let (id, cancel) = registry.register().await;

        let session = SignalingSession::new(
            id,
            Box::new(StubPeer { log: peer.clone() }),
            controller,
            registry.clone(),
            cancel,
        );

        let (client_tx, inbound) = mpsc::unbounded();
        let (outbound, server_rx) = mpsc::unbounded();
        let task = tokio::spawn(session.run(inbound, outbound));

        Harness {
            client_tx,
            server_rx,
            peer,
            source,
            registry,
            task,
        }
    }

    impl Harness {
        fn send(&self, text: &str) {
            self.client_tx
                .unbounded_send(Ok(Message::Text(text.to_string())))
                .unwrap();
        }

        async fn next_text(&mut self) -> String {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.server_rx.next())
                .await
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => text,
                other => panic!("unexpected message {:?}", other),
            }
        }
    }

    const OFFER: &str = r#"{"event":"offer","data":"{\"type\":\"offer\",\"sdp\":\"v=0\\r\\n\"}"}"#;

    #[tokio::test]
    async fn test_offer_yields_one_answer() {
        let mut h = harness().await;
        h.send(OFFER);

        let reply = ControlMessage::parse(&h.next_text().await).unwrap();
        assert_eq!(reply.event, "answer");
        let answer: RTCSessionDescription = serde_json::from_str(&reply.data).unwrap();
        assert_eq!(answer.sdp_type, RTCSdpType::Answer);

        let sessions = h.registry.list().await;
        assert_eq!(sessions[0].state, SessionState::Active);

        // A second offer is a protocol violation and ends the session
        h.send(OFFER);
        h.task.await.unwrap();
        assert_eq!(h.peer.offers.load(Ordering::SeqCst), 1);
        assert_eq!(h.peer.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_seek_units_and_bad_values() {
        let h = harness().await;
        h.send(r#"{"event":"seek","data":"abc"}"#);
        h.send(r#"{"event":"seek","data":"30"}"#);
        h.send(r#"{"event":"play","data":""}"#);
        h.send(r#"{"event":"rewind","data":""}"#);
        drop(h.client_tx);
        h.task.await.unwrap();

        assert_eq!(*h.source.seeks.lock(), vec![Duration::from_secs(30)]);
        // The controller starts Idle, so play reaches the source
        assert_eq!(h.source.plays.load(Ordering::SeqCst), 1);
        assert_eq!(h.peer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_json_ends_session() {
        let h = harness().await;
        h.send("{not json");
        h.task.await.unwrap();
        assert_eq!(h.peer.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_bad_offer_payload_ends_session() {
        let h = harness().await;
        h.send(r#"{"event":"offer","data":"{\"sdp\":42}"}"#);
        h.task.await.unwrap();
        assert_eq!(h.peer.offers.load(Ordering::SeqCst), 0);
        assert_eq!(h.peer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_all_cancels_sessions() {
        let h = harness().await;
        h.registry.close_all();
        h.task.await.unwrap();
        assert_eq!(h.peer.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.count().await, 0);
    }
}
