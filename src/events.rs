// Channel types that tie the transport, the per-peer connection sessions and
// the engine loop together. Connection sessions run their own I/O on spawned
// tasks and marshal everything into the engine's single-consumer queue, so
// state mutation stays single-threaded per peer.

use std::collections::HashMap;

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::api::{GameEvent, Intent};
use crate::connection::ConnectionPhase;
use crate::protocol::{Envelope, Message};
use crate::types::PeerId;

/// Everything the engine loop consumes. Per-sender order is preserved by the
/// connection sessions; no global cross-peer order is needed.
#[derive(Debug)]
pub enum SessionInput {
    /// A local user intent.
    Intent(Intent),
    /// An ordered, deduplicated application message from a remote peer.
    FromPeer(Envelope),
    /// A connection session changed phase.
    Link { peer: PeerId, phase: ConnectionPhase },
}

pub type InputSender = mpsc::UnboundedSender<SessionInput>;
pub type InputReceiver = mpsc::UnboundedReceiver<SessionInput>;

/// Sender half used to publish discrete events to the presentation layer.
pub type EventSender = mpsc::UnboundedSender<GameEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<GameEvent>;

/// Outgoing handles to the two remote peers. The engine broadcasts messages
/// here; each link's connection session wraps them in sequenced envelopes
/// and handles delivery and retransmission.
pub struct PeerMap {
    links: HashMap<PeerId, mpsc::UnboundedSender<Message>>,
}

impl PeerMap {
    pub fn new() -> Self {
        PeerMap {
            links: HashMap::new(),
        }
    }

    pub fn add_link(&mut self, peer: PeerId, tx: mpsc::UnboundedSender<Message>) {
        self.links.insert(peer, tx);
    }

    /// Send to one remote peer. A dropped link is logged, not fatal; the
    /// connection session surfaces the failure through its own phase events.
    pub fn send_to(&self, peer: PeerId, message: Message) {
        let Some(tx) = self.links.get(&peer) else {
            warn!("no link to [peer {}] for {}", peer, message.name());
            return;
        };
        if tx.send(message).is_err() {
            debug!("link to [peer {}] closed by its session", peer);
        }
    }

    /// Send the same message to both remote peers.
    pub fn broadcast(&self, message: Message) {
        for (&peer, tx) in &self.links {
            if tx.send(message.clone()).is_err() {
                debug!("link to [peer {}] closed by its session", peer);
            }
        }
    }
}

impl Default for PeerMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Publish an event, tolerating a presentation layer that has gone away.
pub fn publish(events: &EventSender, event: GameEvent) {
    if events.send(event).is_err() {
        debug!("event consumer dropped");
    }
}
