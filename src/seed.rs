// Shared-seed agreement and the deterministic shuffle built on it.
//
// Each peer contributes one random value per game; the combiner is wrapping
// addition, which is commutative and associative, so every peer arrives at
// the same seed no matter the order contributions land in, and no single
// peer can dictate the result. Hands are then computed locally from the
// combined seed instead of being sent over the wire.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::types::{Card, DeckVariant, PeerId};

/// Fold any number of seed contributions into the shared seed.
pub fn combine(contributions: impl IntoIterator<Item = u64>) -> u64 {
    contributions
        .into_iter()
        .fold(0u64, |acc, v| acc.wrapping_add(v))
}

/// Derive the per-round shuffle seed from the game seed. Different multiplier
/// offsets keep the shuffle stream and the forced-bid stream apart.
pub fn round_seed(game_seed: u64, round: u32) -> u64 {
    game_seed
        .wrapping_add((round as u64).wrapping_mul(1_000_003))
        .wrapping_add(1)
}

/// Derive the seed for a forced random bid, unique per (game, round, peer).
pub fn forced_bid_seed(game_seed: u64, round: u32, peer: PeerId) -> u64 {
    game_seed
        .wrapping_add((round as u64).wrapping_mul(10_007))
        .wrapping_add(peer.0.wrapping_mul(101))
        .wrapping_add(2)
}

/// The full pack in the permutation every peer computes for this seed. Same
/// algorithm and seed on each peer is what makes convergent deals possible
/// without exchanging hands.
pub fn shuffled_deck(variant: DeckVariant, seed: u64) -> Vec<Card> {
    let mut deck = variant.deck();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    deck.shuffle(&mut rng);
    deck
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn combiner_matches_sum_scenario() {
        // Three peers contribute 1, 2 and 3.
        assert_eq!(combine([1, 2, 3]), 6);
    }

    #[test]
    fn same_seed_same_permutation() {
        let a = shuffled_deck(DeckVariant::Short32, 6);
        let b = shuffled_deck(DeckVariant::Short32, 6);
        assert_eq!(a, b);
    }

    #[test]
    fn different_seeds_usually_differ() {
        let a = shuffled_deck(DeckVariant::Short32, 6);
        let b = shuffled_deck(DeckVariant::Short32, 7);
        assert_ne!(a, b);
    }

    #[test]
    fn derived_streams_are_separated() {
        let game_seed = 12345;
        assert_ne!(
            round_seed(game_seed, 4),
            forced_bid_seed(game_seed, 4, PeerId(0))
        );
        assert_ne!(
            forced_bid_seed(game_seed, 4, PeerId(1)),
            forced_bid_seed(game_seed, 4, PeerId(2))
        );
    }

    proptest! {
        #[test]
        fn combine_is_order_independent(a: u64, b: u64, c: u64) {
            let orderings = [
                [a, b, c], [a, c, b], [b, a, c],
                [b, c, a], [c, a, b], [c, b, a],
            ];
            let first = combine(orderings[0]);
            for ord in orderings {
                prop_assert_eq!(combine(ord), first);
            }
        }

        #[test]
        fn combine_is_associative(a: u64, b: u64, c: u64) {
            prop_assert_eq!(
                combine([combine([a, b]), c]),
                combine([a, combine([b, c])])
            );
        }

        #[test]
        fn shuffle_is_a_permutation(seed: u64) {
            let deck = shuffled_deck(DeckVariant::Full52, seed);
            let mut sorted = deck.clone();
            sorted.sort();
            let mut reference = DeckVariant::Full52.deck();
            reference.sort();
            prop_assert_eq!(sorted, reference);
        }
    }
}
