// Error taxonomy. Connection problems are retried and then surfaced as
// terminal link states; protocol violations are rejected without mutating
// state; a desync is fatal for the round.

use thiserror::Error;

use crate::connection::ConnectionPhase;
use crate::state::GamePhase;
use crate::types::{Card, PeerId};

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConnectionError {
    #[error("link to peer {0} is closed")]
    LinkClosed(PeerId),

    #[error("signal `{signal}` not expected in {phase:?}")]
    UnexpectedSignal {
        signal: &'static str,
        phase: ConnectionPhase,
    },
}

/// A message or intent that the rules reject. The sender's local state is
/// never mutated by a rejected input; remote violations are logged, local
/// ones are returned to the caller as events.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ProtocolViolation {
    #[error("`{message}` is not valid during {phase:?}")]
    PhaseMismatch {
        message: &'static str,
        phase: GamePhase,
    },

    #[error("peer {0} acted out of turn")]
    OutOfTurn(PeerId),

    #[error("peer {0} is not seated at this table")]
    UnknownPeer(PeerId),

    #[error("bid of {bid} exceeds the hand size of {hand_size}")]
    BidTooLarge { bid: u8, hand_size: u8 },

    #[error("bid of {bid} would make the bids sum to the round target of {target}")]
    ForbiddenBidSum { bid: u8, target: u8 },

    #[error("{0} is not in the player's hand")]
    CardNotInHand(Card),

    #[error("must follow the led suit")]
    MustFollowSuit,

    #[error("peer {0} may not choose the trump")]
    NotTrumpChooser(PeerId),

    #[error("discard of {got} cards does not match the {want} owed")]
    WrongDiscardCount { got: usize, want: usize },

    #[error("message refers to round {got}, current round is {want}")]
    StaleRound { got: u32, want: u32 },

    #[error("duplicate input from peer {0} for this phase")]
    DuplicateInput(PeerId),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Violation(#[from] ProtocolViolation),

    #[error("engine loop has shut down")]
    Closed,
}
