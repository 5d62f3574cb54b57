// Round setup and the deal. Everything here is computed locally from the
// shared seed: dealer rotation, handicap bonus cards, the shuffle and the
// hands. No card content crosses the wire; the acknowledgement gate's state
// hash verifies that all three peers derived the same deal.

use log::info;

use crate::api::GameEvent;
use crate::events::publish;
use crate::rules;
use crate::scoring;
use crate::seed;
use crate::state::GamePhase;
use crate::types::TRUMP_STOCK_SIZE;

use super::{Aborted, AckGate, Bidding, ChoosingTrump, Stage, StageCtx};

pub struct Dealing;

impl Dealing {
    pub fn enter(ctx: &mut StageCtx) -> Box<dyn Stage> {
        ctx.set_phase(GamePhase::SetupRound);

        ctx.state.round += 1;
        let round = ctx.state.round;
        ctx.state.reset_round();

        let seating = ctx.state.seating.clone();
        ctx.state.dealer = Some(match ctx.state.dealer {
            None => seating[0],
            Some(d) => scoring::next_dealer(&seating, d),
        });

        let variant = ctx.state.variant;
        let hand_size = rules::hand_size_for_round(round, variant);
        let trump_round = rules::is_trump_stock_round(round);

        // Handicap: trailing peers get extra cards to shed once bidding ends.
        if !trump_round {
            let bonus = scoring::bonus_cards(
                &ctx.state.scores,
                &ctx.cfg.monthly_losses,
                &ctx.cfg.handicap,
                hand_size,
                variant,
                trump_round,
            );
            for (peer, extra) in bonus {
                if extra > 0 {
                    ctx.state.owed_discards.insert(peer, extra);
                }
            }
        }

        let Some(game_seed) = ctx.state.game_seed else {
            return Aborted::enter(ctx, "no agreed seed for the deal".to_string());
        };
        let mut deck = seed::shuffled_deck(variant, seed::round_seed(game_seed, round));

        for &peer in &seating {
            let extra = ctx.state.owed_discards.get(&peer).copied().unwrap_or(0);
            let take = hand_size as usize + extra as usize;
            let mut hand: Vec<_> = deck.drain(..take).collect();
            hand.sort();
            ctx.state.hands.insert(peer, hand);
            ctx.state.tricks_won.insert(peer, 0);
        }

        if trump_round {
            ctx.state.trump_stock = deck.drain(..TRUMP_STOCK_SIZE).collect();
        } else {
            // The first undealt card is turned for trump and stays with the
            // pack.
            let turned = deck.first().copied();
            ctx.state.trump = turned.map(|c| c.suit);
            if let Some(suit) = ctx.state.trump {
                publish(
                    ctx.events,
                    GameEvent::TrumpFixed {
                        suit,
                        chooser: None,
                    },
                );
            }
        }
        ctx.state.deck = deck;

        info!(
            "[peer {}] round {} dealt: hand size {}, dealer {}",
            ctx.local,
            round,
            hand_size,
            ctx.state.dealer.expect("dealer set above"),
        );
        ctx.set_phase(GamePhase::Dealing);
        debug_assert!(ctx.state.card_conservation_holds());

        if trump_round {
            AckGate::enter(
                ctx,
                GamePhase::ChoosingTrump,
                Vec::new(),
                Box::new(ChoosingTrump::enter),
            )
        } else {
            AckGate::enter(ctx, GamePhase::Bidding, Vec::new(), Box::new(Bidding::enter))
        }
    }
}
