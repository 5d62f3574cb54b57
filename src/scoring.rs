// Pure scoring helpers: per-round score deltas, dealer rotation, the
// handicap (forced extra cards) policy and the across-session tally rules.
// Constants live in config structs; every peer must run identical values or
// the states diverge.

use std::collections::BTreeMap;

use crate::types::{DeckVariant, PeerId, TRUMP_STOCK_SIZE};

/// House-rule scoring constants.
#[derive(Clone, Copy, Debug)]
pub struct ScoreConfig {
    /// Score for making the announced bid exactly: `exact_bonus + bid`.
    pub exact_bonus: i32,
    /// Penalty per trick of under- or over-achievement.
    pub miss_penalty: i32,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        ScoreConfig {
            exact_bonus: 10,
            miss_penalty: 5,
        }
    }
}

/// Score delta for one peer's round.
pub fn round_delta(bid: u8, made: u8, cfg: &ScoreConfig) -> i32 {
    if made == bid {
        cfg.exact_bonus + bid as i32
    } else {
        -((made as i32 - bid as i32).abs() * cfg.miss_penalty)
    }
}

/// Dealer rotates by fixed seating order each round.
pub fn next_dealer(seating: &[PeerId], dealer: PeerId) -> PeerId {
    let i = seating
        .iter()
        .position(|&p| p == dealer)
        .unwrap_or(seating.len() - 1);
    seating[(i + 1) % seating.len()]
}

/// The peer seated after `peer`, in fixed order.
pub fn next_seat(seating: &[PeerId], peer: PeerId) -> PeerId {
    next_dealer(seating, peer)
}

/// Policy for the forced extra cards dealt to trailing peers. The bonus is
/// raised when a peer's rolling monthly-losses counter (persisted outside a
/// single session) crosses the threshold.
#[derive(Clone, Copy, Debug)]
pub struct HandicapPolicy {
    pub second_place: u8,
    pub third_place: u8,
    pub loss_threshold: u32,
    pub loss_bonus: u8,
}

impl Default for HandicapPolicy {
    fn default() -> Self {
        HandicapPolicy {
            second_place: 1,
            third_place: 2,
            loss_threshold: 10,
            loss_bonus: 1,
        }
    }
}

/// Extra cards owed to each trailing peer for the coming round. The total
/// deal is capped so it never exhausts the pack: one card always stays
/// undealt for the trump turn. Ties for a place blunt the handicap: peers
/// with equal standing scores receive the lesser bonus of the places they
/// span.
pub fn bonus_cards(
    standings: &BTreeMap<PeerId, i32>,
    monthly_losses: &BTreeMap<PeerId, u32>,
    policy: &HandicapPolicy,
    hand_size: u8,
    variant: DeckVariant,
    trump_stock_round: bool,
) -> BTreeMap<PeerId, u8> {
    let mut ranked: Vec<(PeerId, i32)> = standings.iter().map(|(&p, &s)| (p, s)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut bonus: BTreeMap<PeerId, u8> = BTreeMap::new();
    for (place, &(peer, score)) in ranked.iter().enumerate() {
        let base = match place {
            1 if score < ranked[0].1 => policy.second_place,
            2 if score < ranked[1].1 => policy.third_place,
            2 if score < ranked[0].1 => policy.second_place,
            _ => 0,
        };
        if base == 0 {
            bonus.insert(peer, 0);
            continue;
        }
        let losses = monthly_losses.get(&peer).copied().unwrap_or(0);
        let extra = if losses >= policy.loss_threshold {
            policy.loss_bonus
        } else {
            0
        };
        bonus.insert(peer, base + extra);
    }

    // Cap: base hands, the stock (or trump turn card) and all bonuses must
    // leave at least one undealt card.
    let reserved = if trump_stock_round { TRUMP_STOCK_SIZE } else { 1 };
    let base_dealt = hand_size as usize * standings.len() + reserved;
    let budget = variant.size().saturating_sub(base_dealt).saturating_sub(1);
    // Trim from the biggest bonus down until the deal fits.
    loop {
        let total: usize = bonus.values().map(|&b| b as usize).sum();
        if total <= budget || total == 0 {
            break;
        }
        let (&victim, _) = bonus
            .iter()
            .max_by_key(|(p, &b)| (b, std::cmp::Reverse(p.0)))
            .expect("bonus map is non-empty");
        *bonus.get_mut(&victim).expect("victim present") -= 1;
    }
    bonus
}

/// Tally values awarded per game in the across-session ranking.
#[derive(Clone, Copy, Debug)]
pub struct TallyConfig {
    pub top: u32,
    pub second: u32,
}

impl Default for TallyConfig {
    fn default() -> Self {
        TallyConfig { top: 3, second: 1 }
    }
}

/// Rank peers by per-game score and award tallies with the explicit tie
/// rules: all tied, everyone takes the top tally; top two tied, both take the
/// top tally and third takes zero; bottom two tied for second, the leader
/// takes the top tally and both others share the second tally.
pub fn session_tallies(
    scores: &BTreeMap<PeerId, i32>,
    cfg: &TallyConfig,
) -> BTreeMap<PeerId, u32> {
    let mut ranked: Vec<(PeerId, i32)> = scores.iter().map(|(&p, &s)| (p, s)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut tallies = BTreeMap::new();
    if ranked.len() < 3 {
        for (p, _) in ranked {
            tallies.insert(p, cfg.top);
        }
        return tallies;
    }

    let (first, second, third) = (ranked[0], ranked[1], ranked[2]);
    if first.1 == second.1 && second.1 == third.1 {
        // Everyone tied.
        for (p, _) in ranked {
            tallies.insert(p, cfg.top);
        }
    } else if first.1 == second.1 {
        tallies.insert(first.0, cfg.top);
        tallies.insert(second.0, cfg.top);
        tallies.insert(third.0, 0);
    } else if second.1 == third.1 {
        tallies.insert(first.0, cfg.top);
        tallies.insert(second.0, cfg.second);
        tallies.insert(third.0, cfg.second);
    } else {
        tallies.insert(first.0, cfg.top);
        tallies.insert(second.0, cfg.second);
        tallies.insert(third.0, 0);
    }
    tallies
}
