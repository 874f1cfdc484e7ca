//! The Peer contract and its transports.
//!
//! A [`Peer`] is a pair of channels: incoming events and outgoing messages.
//! Network connections, in-memory pipes and storage backends all present
//! themselves to a node this way.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::Result;
use crate::messages::SyncMessage;

/// Default capacity of a peer's outgoing channel.
pub const DEFAULT_OUTGOING_CAPACITY: usize = 64;

/// Identifier of a peer connection, unique within a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a peer is to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// Receives updates only for CoValues it showed interest in.
    Client,
    /// Receives all updates and is asked when loading.
    Server,
    /// Durable storage; asked first when loading.
    Storage,
}

impl PeerRole {
    /// Whether the peer should receive every update we have.
    pub fn is_upstream(self) -> bool {
        matches!(self, PeerRole::Server | PeerRole::Storage)
    }

    /// Default scheduling rank; lower is asked first.
    pub fn default_priority(self) -> u8 {
        match self {
            PeerRole::Storage => 0,
            PeerRole::Server => 1,
            PeerRole::Client => 2,
        }
    }
}

/// Something that happened on a peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Message(SyncMessage),
    /// The other side went away.
    Disconnected,
    /// Nothing was received within the idle timeout.
    PingTimeout,
}

/// A peer connection as seen by a node.
pub struct Peer {
    pub id: PeerId,
    pub role: PeerRole,
    /// Rank among peers when loading; lower is asked first.
    pub priority: u8,
    /// Losing this peer is fatal to the node.
    pub crash_on_close: bool,
    pub incoming: mpsc::Receiver<PeerEvent>,
    pub outgoing: mpsc::Sender<SyncMessage>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("priority", &self.priority)
            .field("crash_on_close", &self.crash_on_close)
            .finish()
    }
}

/// Options for stream-backed peers.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub outgoing_capacity: usize,
    /// Emit [`PeerEvent::PingTimeout`] when nothing arrives for this long.
    pub idle_timeout: Option<Duration>,
    pub crash_on_close: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            outgoing_capacity: DEFAULT_OUTGOING_CAPACITY,
            idle_timeout: None,
            crash_on_close: false,
        }
    }
}

impl Peer {
    /// A peer from raw channels, with the role's default priority.
    pub fn from_channels(
        id: PeerId,
        role: PeerRole,
        incoming: mpsc::Receiver<PeerEvent>,
        outgoing: mpsc::Sender<SyncMessage>,
    ) -> Self {
        Self {
            id,
            role,
            priority: role.default_priority(),
            crash_on_close: false,
            incoming,
            outgoing,
        }
    }

    pub fn with_crash_on_close(mut self, crash_on_close: bool) -> Self {
        self.crash_on_close = crash_on_close;
        self
    }

    /// A peer speaking newline-delimited JSON over a byte stream.
    ///
    /// Spawns a reader and a writer task; must be called within a tokio runtime.
    pub fn from_stream<S>(id: PeerId, role: PeerRole, stream: S, options: StreamOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (event_tx, event_rx) = mpsc::channel(options.outgoing_capacity);
        let (out_tx, mut out_rx) = mpsc::channel::<SyncMessage>(options.outgoing_capacity);

        let reader_peer = id.clone();
        let idle_timeout = options.idle_timeout;
        tokio::spawn(async move {
            let mut reader = FrameReader::new(BufReader::new(read_half));
            loop {
                let next = match idle_timeout {
                    Some(limit) => match tokio::time::timeout(limit, reader.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            tracing::warn!(peer = %reader_peer, "ping timeout");
                            let _ = event_tx.send(PeerEvent::PingTimeout).await;
                            return;
                        }
                    },
                    None => reader.next().await,
                };
                match next {
                    Ok(Some(message)) => {
                        if event_tx.send(PeerEvent::Message(message)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(peer = %reader_peer, error = %e, "read failed");
                        break;
                    }
                }
            }
            let _ = event_tx.send(PeerEvent::Disconnected).await;
        });

        let writer_peer = id.clone();
        tokio::spawn(async move {
            let mut writer = FrameWriter::new(write_half);
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = writer.send(&message).await {
                    tracing::warn!(peer = %writer_peer, error = %e, "write failed");
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        Self {
            id,
            role,
            priority: role.default_priority(),
            crash_on_close: options.crash_on_close,
            incoming: event_rx,
            outgoing: out_tx,
        }
    }
}

/// Opens connections to an upstream peer, used for reconnecting.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Establish a new connection.
    async fn connect(&self) -> Result<Peer>;
}

/// Exponential backoff between reconnection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Give up after this many consecutive failures; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.map(|max| attempt < max).unwrap_or(true)
    }
}

/// In-memory peers for tests and same-process nodes.
pub mod memory {
    use super::*;

    fn pipe(
        capacity: usize,
    ) -> (mpsc::Sender<SyncMessage>, mpsc::Receiver<PeerEvent>) {
        let (out_tx, mut out_rx) = mpsc::channel::<SyncMessage>(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if event_tx.send(PeerEvent::Message(message)).await.is_err() {
                    return;
                }
            }
            let _ = event_tx.send(PeerEvent::Disconnected).await;
        });
        (out_tx, event_rx)
    }

    /// Two connected peers.
    ///
    /// The first is handed to node A and represents B (`b_id`, `b_role`);
    /// the second is handed to node B and represents A. Dropping either
    /// side's peer delivers [`PeerEvent::Disconnected`] to the other.
    /// Must be called within a tokio runtime.
    pub fn connected_pair(
        a_id: impl Into<String>,
        b_id: impl Into<String>,
        a_role: PeerRole,
        b_role: PeerRole,
    ) -> (Peer, Peer) {
        let (a_to_b, b_incoming) = pipe(DEFAULT_OUTGOING_CAPACITY);
        let (b_to_a, a_incoming) = pipe(DEFAULT_OUTGOING_CAPACITY);
        let peer_b_for_a = Peer::from_channels(PeerId::new(b_id), b_role, a_incoming, a_to_b);
        let peer_a_for_b = Peer::from_channels(PeerId::new(a_id), a_role, b_incoming, b_to_a);
        (peer_b_for_a, peer_a_for_b)
    }
}

#[cfg(test)]
mod tests {
    use super::memory::connected_pair;
    use super::*;
    use covalent_core::{CoId, KnownState};

    fn load(byte: u8) -> SyncMessage {
        SyncMessage::Load(KnownState::empty(CoId([byte; 32])))
    }

    #[tokio::test]
    async fn test_memory_pair_delivers_both_ways() {
        let (mut to_b, mut to_a) = connected_pair("a", "b", PeerRole::Client, PeerRole::Server);
        assert_eq!(to_b.id, PeerId::new("b"));
        assert_eq!(to_b.role, PeerRole::Server);
        assert_eq!(to_a.role, PeerRole::Client);

        to_b.outgoing.send(load(1)).await.unwrap();
        assert_eq!(to_a.incoming.recv().await, Some(PeerEvent::Message(load(1))));

        to_a.outgoing.send(load(2)).await.unwrap();
        assert_eq!(to_b.incoming.recv().await, Some(PeerEvent::Message(load(2))));
    }

    #[tokio::test]
    async fn test_memory_pair_disconnect() {
        let (to_b, mut to_a) = connected_pair("a", "b", PeerRole::Client, PeerRole::Server);
        drop(to_b);
        assert_eq!(to_a.incoming.recv().await, Some(PeerEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_stream_peers_over_duplex() {
        let (left, right) = tokio::io::duplex(4096);
        let a = Peer::from_stream(PeerId::new("right"), PeerRole::Server, left, StreamOptions::default());
        let mut b = Peer::from_stream(PeerId::new("left"), PeerRole::Client, right, StreamOptions::default());

        a.outgoing.send(load(7)).await.unwrap();
        assert_eq!(b.incoming.recv().await, Some(PeerEvent::Message(load(7))));

        drop(a);
        assert_eq!(b.incoming.recv().await, Some(PeerEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_stream_idle_timeout() {
        let (left, _right) = tokio::io::duplex(64);
        let options = StreamOptions {
            idle_timeout: Some(Duration::from_millis(20)),
            ..StreamOptions::default()
        };
        let mut peer = Peer::from_stream(PeerId::new("quiet"), PeerRole::Server, left, options);
        assert_eq!(peer.incoming.recv().await, Some(PeerEvent::PingTimeout));
    }

    #[test]
    fn test_reconnect_backoff() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_attempts: Some(5),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10), Duration::from_millis(1000));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }
}
