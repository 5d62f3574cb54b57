// Card and peer value types shared by the engine, the rules helpers and the
// wire protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier for one of the three participants. Totally ordered so
/// simultaneous-message ties break the same way on every peer; seating order
/// is ascending `PeerId`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of participants. The protocol has no defined behavior for any other
/// table size.
pub const PLAYERS: usize = 3;

/// Cards set aside face down each of the first three rounds; the trump suit is
/// turned from these.
pub const TRUMP_STOCK_SIZE: usize = 4;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Suit {
    Spades,
    Clubs,
    Diamonds,
    Hearts,
}

pub const SUITS: [Suit; 4] = [Suit::Spades, Suit::Clubs, Suit::Diamonds, Suit::Hearts];

/// Rank order is the trick-resolution order: `Two < .. < Ace` in the 52-card
/// variant, `Seven < .. < Ace` in the short variant.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Rank {
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    Ten,
    Jack,
    Queen,
    King,
    Ace,
}

pub const RANKS: [Rank; 13] = [
    Rank::Two,
    Rank::Three,
    Rank::Four,
    Rank::Five,
    Rank::Six,
    Rank::Seven,
    Rank::Eight,
    Rank::Nine,
    Rank::Ten,
    Rank::Jack,
    Rank::Queen,
    Rank::King,
    Rank::Ace,
];

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Card {
    pub suit: Suit,
    pub rank: Rank,
}

impl Card {
    pub fn new(suit: Suit, rank: Rank) -> Self {
        Card { suit, rank }
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} of {:?}", self.rank, self.suit)
    }
}

/// Which physical deck the table plays with.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DeckVariant {
    /// Sevens up to aces, 32 cards.
    Short32,
    /// The full 52-card pack.
    Full52,
}

impl DeckVariant {
    pub fn size(self) -> usize {
        match self {
            DeckVariant::Short32 => 32,
            DeckVariant::Full52 => 52,
        }
    }

    /// Lowest rank present in the pack.
    pub fn low_rank(self) -> Rank {
        match self {
            DeckVariant::Short32 => Rank::Seven,
            DeckVariant::Full52 => Rank::Two,
        }
    }

    /// The rank that, when turned from the trump stock, lets the turner choose
    /// the trump suit. The lowest card of the pack plays that role.
    pub fn marker_rank(self) -> Rank {
        self.low_rank()
    }

    /// Populate the full ordered pack for this variant.
    pub fn deck(self) -> Vec<Card> {
        let low = self.low_rank();
        let mut deck = Vec::with_capacity(self.size());
        for &rank in RANKS.iter().filter(|&&r| r >= low) {
            for suit in SUITS {
                deck.push(Card { suit, rank });
            }
        }
        deck
    }
}
