// The surface between the engine and the excluded presentation layer: user
// intents flow in, immutable snapshots and discrete events flow out. The
// presentation side never touches game state directly.

use crate::connection::ConnectionPhase;
use crate::error::ProtocolViolation;
use crate::state::{GamePhase, GameState, RoundRecord, Trick};
use crate::types::{Card, PeerId, Suit};

/// A user action submitted to the engine. Rejections come back as
/// [`GameEvent::IntentRejected`]; the engine never crashes on a bad intent.
#[derive(Clone, Debug, PartialEq)]
pub enum Intent {
    ProposeBid(u8),
    PlayCard(Card),
    /// Turn the named stock card face up as the trump choice.
    ChooseTrump(Card),
    Discard(Vec<Card>),
    /// Voluntarily leave the table.
    Leave,
}

/// Discrete events published to the presentation layer. Snapshots travel
/// separately on the watch channel; these are the moments worth animating or
/// announcing.
#[derive(Clone, Debug, PartialEq)]
pub enum GameEvent {
    PhaseChanged(GamePhase),
    PeerLink {
        peer: PeerId,
        phase: ConnectionPhase,
    },
    TrumpFixed {
        suit: Suit,
        chooser: Option<PeerId>,
    },
    BidPlaced {
        peer: PeerId,
        bid: u8,
        forced: bool,
    },
    TrickResolved(Trick),
    RoundScored(RoundRecord),
    IntentRejected(ProtocolViolation),
    GameOver {
        winner: PeerId,
        scores: std::collections::BTreeMap<PeerId, i32>,
    },
    Aborted {
        reason: String,
    },
}

/// Serializable snapshot sufficient to resume mid-round after a restart.
/// The aggregate state already keeps every field a resume needs, so the
/// snapshot is the state itself.
pub type Snapshot = GameState;

/// Persist a snapshot for the external persistence collaborator.
pub fn encode_snapshot(snapshot: &Snapshot) -> serde_json::Result<String> {
    serde_json::to_string(snapshot)
}

pub fn decode_snapshot(json: &str) -> serde_json::Result<Snapshot> {
    serde_json::from_str(json)
}
