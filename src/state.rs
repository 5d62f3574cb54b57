// The replicated game state. Every peer owns one `GameState`, mutated only by
// its own phase engine; the message protocol keeps the three copies
// structurally equal. All collections are ordered so the serialized form, and
// therefore the integrity hash, is canonical.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Card, DeckVariant, PeerId, Suit};

/// Phase of the synchronized game engine. Advances only when every required
/// peer has produced a validated input for the current phase.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum GamePhase {
    WaitingForPlayers,
    ExchangingIdentities,
    ExchangingSeed,
    SetupRound,
    Dealing,
    ChoosingTrump,
    Bidding,
    Discarding,
    PlayingTricks,
    RoundScoring,
    GameOver,
    Aborted,
}

/// A resolved trick: who led, the three plays in play order, who won.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Trick {
    pub leader: PeerId,
    pub plays: Vec<(PeerId, Card)>,
    pub winner: PeerId,
}

/// Immutable once a round closes. Append-only history.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    pub bids: BTreeMap<PeerId, u8>,
    pub made: BTreeMap<PeerId, u8>,
    pub delta: BTreeMap<PeerId, i32>,
    pub cumulative: BTreeMap<PeerId, i32>,
}

/// The aggregate root. Serializable as-is for mid-round resume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub variant: DeckVariant,
    pub round: u32,
    pub phase: GamePhase,

    /// Ascending `PeerId`; fixed once three peers have announced.
    pub seating: Vec<PeerId>,
    pub names: BTreeMap<PeerId, String>,
    pub dealer: Option<PeerId>,

    pub hands: BTreeMap<PeerId, Vec<Card>>,
    /// Undealt remainder of the pack.
    pub deck: Vec<Card>,
    pub trump_stock: Vec<Card>,
    pub trump: Option<Suit>,

    /// Cards on the table for the trick in progress, in play order.
    pub table: Vec<(PeerId, Card)>,
    pub trick_leader: Option<PeerId>,
    pub turn: Option<PeerId>,
    pub tricks_won: BTreeMap<PeerId, u8>,
    pub trick_history: Vec<Trick>,

    pub bids: BTreeMap<PeerId, u8>,
    /// Extra handicap cards each peer still has to discard this round.
    pub owed_discards: BTreeMap<PeerId, u8>,

    pub scores: BTreeMap<PeerId, i32>,
    pub records: Vec<RoundRecord>,

    pub seed_parts: BTreeMap<PeerId, u64>,
    pub game_seed: Option<u64>,
}

impl GameState {
    pub fn new(variant: DeckVariant) -> Self {
        GameState {
            variant,
            round: 0,
            phase: GamePhase::WaitingForPlayers,
            seating: Vec::new(),
            names: BTreeMap::new(),
            dealer: None,
            hands: BTreeMap::new(),
            deck: Vec::new(),
            trump_stock: Vec::new(),
            trump: None,
            table: Vec::new(),
            trick_leader: None,
            turn: None,
            tricks_won: BTreeMap::new(),
            trick_history: Vec::new(),
            bids: BTreeMap::new(),
            owed_discards: BTreeMap::new(),
            scores: BTreeMap::new(),
            records: Vec::new(),
            seed_parts: BTreeMap::new(),
            game_seed: None,
        }
    }

    pub fn seated(&self, peer: PeerId) -> bool {
        self.seating.contains(&peer)
    }

    pub fn hand(&self, peer: PeerId) -> &[Card] {
        self.hands.get(&peer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Suit of the first card on the table, if a trick is underway.
    pub fn led_suit(&self) -> Option<Suit> {
        self.table.first().map(|&(_, c)| c.suit)
    }

    /// Blake3 hash of the canonical JSON encoding, compared across peers
    /// after phase transitions to detect divergence early.
    pub fn integrity_hash(&self) -> String {
        // BTreeMap keys and fixed field order make the encoding canonical.
        let bytes = serde_json::to_vec(self).expect("game state serializes");
        blake3::hash(&bytes).to_hex().to_string()
    }

    /// Deck, hands, trump stock and table are pairwise disjoint
    /// and together hold the full pack exactly once. Holds at every phase
    /// boundary of a round in progress.
    pub fn card_conservation_holds(&self) -> bool {
        let mut seen: Vec<Card> = Vec::with_capacity(self.variant.size());
        seen.extend(self.deck.iter().copied());
        seen.extend(self.trump_stock.iter().copied());
        seen.extend(self.table.iter().map(|&(_, c)| c));
        for hand in self.hands.values() {
            seen.extend(hand.iter().copied());
        }
        // Played-out tricks of the current round complete the set.
        let current_round_plays: usize = self
            .trick_history
            .iter()
            .map(|t| t.plays.len())
            .sum::<usize>();
        let accounted = seen.len() + current_round_plays;
        if accounted != self.variant.size() {
            return false;
        }
        let unique: std::collections::HashSet<Card> = seen.iter().copied().collect();
        unique.len() == seen.len()
    }

    /// Clear the per-round fields ahead of a new deal. History, scores and
    /// seating survive.
    pub fn reset_round(&mut self) {
        self.hands.clear();
        self.deck.clear();
        self.trump_stock.clear();
        self.trump = None;
        self.table.clear();
        self.trick_leader = None;
        self.turn = None;
        self.tricks_won.clear();
        self.trick_history.clear();
        self.bids.clear();
        self.owed_discards.clear();
    }
}
