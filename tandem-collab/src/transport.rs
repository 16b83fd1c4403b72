//! The boundary to the network.
//!
//! The collaboration core never opens sockets. It hands envelopes to a
//! [`Transport`] and expects the transport to call back into a
//! [`MessageHandler`] when something arrives. [`MemoryNetwork`] is an
//! in-process transport with per-sender FIFO delivery and partitions,
//! used to run several collaborators against each other.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use thiserror::Error;

use tandem_core::UserId;

use crate::protocol::{Envelope, ProtocolError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Unreachable peers: {0:?}")]
    Unreachable(Vec<UserId>),
    #[error("Peer {0} sent no response")]
    NoResponse(UserId),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Best-effort delivery to `envelope.recipients`. Fails with
    /// `Unreachable` naming the recipients that could not be handed the
    /// message; the others still get it.
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Round trip to a single peer.
    async fn request(&self, peer: UserId, envelope: Envelope) -> Result<Envelope, TransportError>;
}

/// Inbound side, implemented by the collaborator.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// A one-way message arrived.
    async fn handle_message(&self, bytes: &[u8]);

    /// A request arrived and wants a response.
    async fn handle_request(&self, envelope: Envelope) -> Option<Envelope>;
}

#[derive(Default)]
struct NetworkState {
    handlers: HashMap<UserId, Weak<dyn MessageHandler>>,
    queue: VecDeque<(UserId, Arc<Vec<u8>>)>,
    /// Unordered pairs that cannot talk, stored as (min, max).
    cuts: HashSet<(UserId, UserId)>,
    delivered: u64,
    dropped: u64,
}

impl NetworkState {
    fn reachable(&self, a: UserId, b: UserId) -> bool {
        let key = if a < b { (a, b) } else { (b, a) };
        !self.cuts.contains(&key) && self.handlers.get(&b).is_some_and(|h| h.strong_count() > 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub queued: usize,
    pub delivered: u64,
    pub dropped: u64,
}

/// In-process transport.
///
/// Messages queue in one global FIFO and are handed over by
/// [`deliver_all`](MemoryNetwork::deliver_all), which preserves each
/// sender's order. Requests are answered immediately.
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetworkState::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register the handler for `user`. Only a weak reference is kept.
    pub fn connect(&self, user: UserId, handler: Arc<dyn MessageHandler>) {
        self.lock().handlers.insert(user, Arc::downgrade(&handler));
        log::debug!("Peer {user} connected to memory network");
    }

    pub fn disconnect(&self, user: UserId) {
        self.lock().handlers.remove(&user);
    }

    /// Cut the link between `a` and `b` in both directions.
    pub fn partition(&self, a: UserId, b: UserId) {
        let key = if a < b { (a, b) } else { (b, a) };
        self.lock().cuts.insert(key);
        log::info!("Partitioned {a} from {b}");
    }

    pub fn heal(&self) {
        self.lock().cuts.clear();
        log::info!("Network healed");
    }

    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn stats(&self) -> NetworkStats {
        let state = self.lock();
        NetworkStats {
            queued: state.queue.len(),
            delivered: state.delivered,
            dropped: state.dropped,
        }
    }

    /// Deliver queued messages, including any sent while delivering, until
    /// the queue is empty. Returns how many were delivered.
    pub async fn deliver_all(&self) -> usize {
        let mut count = 0;
        loop {
            let next = {
                let mut state = self.lock();
                let Some((recipient, bytes)) = state.queue.pop_front() else {
                    break;
                };
                let handler = state.handlers.get(&recipient).and_then(Weak::upgrade);
                if handler.is_some() {
                    state.delivered += 1;
                } else {
                    state.dropped += 1;
                }
                handler.map(|h| (h, bytes))
            };
            if let Some((handler, bytes)) = next {
                handler.handle_message(&bytes).await;
                count += 1;
            }
        }
        count
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let bytes = Arc::new(envelope.encode()?);
        let mut state = self.lock();
        let mut unreachable = Vec::new();
        for &recipient in &envelope.recipients {
            if recipient == envelope.sender {
                continue;
            }
            if state.reachable(envelope.sender, recipient) {
                state.queue.push_back((recipient, bytes.clone()));
            } else {
                state.dropped += 1;
                unreachable.push(recipient);
            }
        }
        if unreachable.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Unreachable(unreachable))
        }
    }

    async fn request(&self, peer: UserId, envelope: Envelope) -> Result<Envelope, TransportError> {
        let handler = {
            let state = self.lock();
            if !state.reachable(envelope.sender, peer) {
                return Err(TransportError::Unreachable(vec![peer]));
            }
            state.handlers.get(&peer).and_then(Weak::upgrade)
        };
        let handler = handler.ok_or_else(|| TransportError::Unreachable(vec![peer]))?;

        // Round-trip through the codec like a real link would.
        let request = Envelope::decode(&envelope.encode()?)?;
        let response = handler
            .handle_request(request)
            .await
            .ok_or(TransportError::NoResponse(peer))?;
        Ok(Envelope::decode(&response.encode()?)?)
    }
}
