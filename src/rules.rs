// Pure rules helpers invoked by the phase engine: round shape, bid
// validation, card legality and trick resolution. Nothing in here touches
// channels or mutates engine state.

use std::collections::BTreeMap;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::ProtocolViolation;
use crate::types::{Card, DeckVariant, PeerId, Suit, TRUMP_STOCK_SIZE};

/// Tricks available in a round: `round - 2`, floored at 1, capped by what the
/// pack can deal to three hands once the trump stock is set aside. This is
/// also the hand size, so the forbidden bid sum equals the tricks actually on
/// the table.
pub fn target_tricks(round: u32, variant: DeckVariant) -> u8 {
    let uncapped = round.saturating_sub(2).max(1);
    uncapped.min(hand_size_cap(variant) as u32) as u8
}

pub fn hand_size_for_round(round: u32, variant: DeckVariant) -> u8 {
    target_tricks(round, variant)
}

/// Largest hand three players can be dealt with the trump stock reserved.
pub fn hand_size_cap(variant: DeckVariant) -> u8 {
    ((variant.size() - TRUMP_STOCK_SIZE) / crate::types::PLAYERS) as u8
}

/// The game ends after the round that first deals the maximum hand.
pub fn is_final_round(round: u32, variant: DeckVariant) -> bool {
    round.saturating_sub(2).max(1) >= hand_size_cap(variant) as u32
}

/// Rounds 1-3 turn the trump from a stock instead of running free bidding.
pub fn is_trump_stock_round(round: u32) -> bool {
    round <= 3
}

/// Validate one announced bid. `others` are the bids already standing this
/// round; `is_last` marks the final bidder (the dealer), who alone is bound
/// by the forbidden-sum rule: the three bids may never sum to exactly the
/// round target, so no round can be won outright by everyone.
pub fn validate_bid(
    bid: u8,
    hand_size: u8,
    others: &[u8],
    is_last: bool,
    round: u32,
    variant: DeckVariant,
) -> Result<(), ProtocolViolation> {
    if bid > hand_size {
        return Err(ProtocolViolation::BidTooLarge { bid, hand_size });
    }
    let target = target_tricks(round, variant);
    if is_last {
        let sum: u32 = others.iter().map(|&b| b as u32).sum::<u32>() + bid as u32;
        if sum == target as u32 {
            return Err(ProtocolViolation::ForbiddenBidSum { bid, target });
        }
    }
    Ok(())
}

/// All cards the hand may legally put on the table. A hand holding the led
/// suit must follow it; otherwise anything goes, trump or discard. The first
/// card of a trick is unrestricted.
pub fn legal_plays(hand: &[Card], led: Option<Suit>) -> Vec<Card> {
    if let Some(led) = led {
        let following: Vec<Card> = hand.iter().copied().filter(|c| c.suit == led).collect();
        if !following.is_empty() {
            return following;
        }
    }
    hand.to_vec()
}

pub fn is_legal_play(hand: &[Card], card: Card, led: Option<Suit>) -> bool {
    legal_plays(hand, led).contains(&card)
}

/// Whether `challenger` beats the `incumbent` best card given the led and
/// trump suits. Trump beats anything non-trump; otherwise only a higher card
/// of the incumbent's effective suit wins.
pub fn card_beats(challenger: Card, incumbent: Card, led: Suit, trump: Option<Suit>) -> bool {
    if let Some(trump) = trump {
        match (challenger.suit == trump, incumbent.suit == trump) {
            (true, false) => return true,
            (false, true) => return false,
            (true, true) => return challenger.rank > incumbent.rank,
            (false, false) => {}
        }
    }
    challenger.suit == led && incumbent.suit == led && challenger.rank > incumbent.rank
        || challenger.suit == led && incumbent.suit != led
}

/// Winner of a completed trick. The led suit is the suit of the first play.
/// Deterministic: same plays, same trump, same winner on every peer.
pub fn resolve_trick(plays: &[(PeerId, Card)], trump: Option<Suit>) -> Option<PeerId> {
    let (_, first) = *plays.first()?;
    let led = first.suit;
    let mut best = 0usize;
    for i in 1..plays.len() {
        if card_beats(plays[i].1, plays[best].1, led, trump) {
            best = i;
        }
    }
    Some(plays[best].0)
}

/// Data-driven policy for the runaway-leader rule. When one peer's standing
/// score is at least `dominance_ratio` times the second-place score (and it
/// is strictly in front, in a bidding round), its announced bid is replaced
/// by a uniformly random legal value so optimal play cannot reinforce the
/// lead.
#[derive(Clone, Copy, Debug)]
pub struct BidPolicy {
    pub forced_random: bool,
    pub dominance_ratio: i32,
}

impl Default for BidPolicy {
    fn default() -> Self {
        BidPolicy {
            forced_random: true,
            dominance_ratio: 2,
        }
    }
}

impl BidPolicy {
    /// The peer whose bid must be randomized this round, if any. Applies only
    /// once free bidding starts (round > 3) and only to a strict leader with
    /// a positive score.
    pub fn forced_bidder(&self, scores: &BTreeMap<PeerId, i32>, round: u32) -> Option<PeerId> {
        if !self.forced_random || is_trump_stock_round(round) {
            return None;
        }
        let mut ranked: Vec<(PeerId, i32)> = scores.iter().map(|(&p, &s)| (p, s)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let (leader, top) = *ranked.first()?;
        let (_, second) = *ranked.get(1)?;
        if top > second && top > 0 && top >= second.saturating_mul(self.dominance_ratio) {
            Some(leader)
        } else {
            None
        }
    }
}

/// Uniformly random legal bid, drawn from a stream seeded identically on all
/// peers so the replacement converges without another message exchange.
pub fn random_legal_bid(
    hand_size: u8,
    others: &[u8],
    is_last: bool,
    round: u32,
    variant: DeckVariant,
    seed: u64,
) -> u8 {
    let legal: Vec<u8> = (0..=hand_size)
        .filter(|&b| validate_bid(b, hand_size, others, is_last, round, variant).is_ok())
        .collect();
    debug_assert!(!legal.is_empty());
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    legal[rng.gen_range(0..legal.len())]
}
