// The transport-agnostic message protocol spoken between peers. Every
// application message travels inside an `Envelope` carrying the sender and a
// monotonic per-sender sequence number; the signaling messages additionally
// flow before a link is fully negotiated.

use serde::{Deserialize, Serialize};

use crate::state::GamePhase;
use crate::types::{Card, PeerId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // Signaling, consumed by the connection session rather than the engine.
    Offer { sdp: String },
    Answer { sdp: String },
    NetworkCandidate { candidate: String },

    // Session bootstrap.
    IdentityAnnounce { peer: PeerId, display_name: String },
    SeedContribution { value: u64 },

    // Game play.
    BidAnnounce { round: u32, value: u8 },
    CardPlayed { round: u32, trick: u8, card: Card },
    DiscardSet { round: u32, cards: Vec<Card> },
    TrumpChosen { card: Card },
    PhaseAck { phase: GamePhase, state_hash: Option<String> },
}

impl Message {
    /// Stable name for logs and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Offer { .. } => "Offer",
            Message::Answer { .. } => "Answer",
            Message::NetworkCandidate { .. } => "NetworkCandidate",
            Message::IdentityAnnounce { .. } => "IdentityAnnounce",
            Message::SeedContribution { .. } => "SeedContribution",
            Message::BidAnnounce { .. } => "BidAnnounce",
            Message::CardPlayed { .. } => "CardPlayed",
            Message::DiscardSet { .. } => "DiscardSet",
            Message::TrumpChosen { .. } => "TrumpChosen",
            Message::PhaseAck { .. } => "PhaseAck",
        }
    }

    /// Whether this message belongs to the connection handshake rather than
    /// the game engine.
    pub fn is_signaling(&self) -> bool {
        matches!(
            self,
            Message::Offer { .. } | Message::Answer { .. } | Message::NetworkCandidate { .. }
        )
    }
}

/// One application message on the wire. Sequence numbers start at 1 and are
/// strictly increasing per sender; the receiving session uses them to drop
/// retransmitted duplicates and restore send order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: PeerId,
    pub seq: u64,
    pub message: Message,
}
