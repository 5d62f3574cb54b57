//! Peer-to-peer engine for a three-player trick-taking game with bidding.
//!
//! There is no server: each of the three peers runs an identical engine and
//! the message protocol keeps their game states structurally equal. Deals are
//! computed locally from a jointly agreed seed, phases advance only once all
//! peers acknowledge, and state hashes at every transition catch divergence.

pub mod api;
pub mod connection;
pub mod error;
pub mod events;
pub mod protocol;
pub mod rules;
pub mod scoring;
pub mod seed;
pub mod session;
pub mod stages;
pub mod state;
pub mod types;
pub mod wire_bridge;

pub use api::{GameEvent, Intent, Snapshot};
pub use session::{RuleConfig, Session, SessionHandle};
pub use state::{GamePhase, GameState};
pub use types::{Card, DeckVariant, PeerId, Rank, Suit};
