// Round close: score the bids against the tricks made, append the immutable
// round record, and either rotate into the next round or end the game.

use std::collections::BTreeMap;

use log::info;

use crate::api::GameEvent;
use crate::error::ProtocolViolation;
use crate::events::publish;
use crate::rules;
use crate::scoring;
use crate::state::{GamePhase, RoundRecord};

use super::{AckGate, Dealing, Stage, StageCtx, StageInput};

pub struct RoundScoring;

impl RoundScoring {
    pub fn enter(ctx: &mut StageCtx) -> Box<dyn Stage> {
        ctx.set_phase(GamePhase::RoundScoring);

        let mut bids = BTreeMap::new();
        let mut made = BTreeMap::new();
        let mut delta = BTreeMap::new();
        let mut cumulative = BTreeMap::new();
        for &peer in &ctx.state.seating.clone() {
            let bid = ctx.state.bids.get(&peer).copied().unwrap_or(0);
            let tricks = ctx.state.tricks_won.get(&peer).copied().unwrap_or(0);
            let d = scoring::round_delta(bid, tricks, &ctx.cfg.score);
            let total = ctx.state.scores.entry(peer).or_insert(0);
            *total += d;
            bids.insert(peer, bid);
            made.insert(peer, tricks);
            delta.insert(peer, d);
            cumulative.insert(peer, *total);
        }
        let record = RoundRecord {
            round: ctx.state.round,
            bids,
            made,
            delta,
            cumulative,
        };
        ctx.state.records.push(record.clone());
        info!(
            "[peer {}] round {} scored: {:?}",
            ctx.local, record.round, record.delta
        );
        publish(ctx.events, GameEvent::RoundScored(record));

        if rules::is_final_round(ctx.state.round, ctx.state.variant) {
            AckGate::enter(
                ctx,
                GamePhase::GameOver,
                Vec::new(),
                Box::new(GameOver::enter),
            )
        } else {
            AckGate::enter(ctx, GamePhase::SetupRound, Vec::new(), Box::new(Dealing::enter))
        }
    }
}

/// Terminal stage for a finished game. Ties break towards the lower peer id,
/// consistent with every other deterministic tie-break in the protocol.
pub struct GameOver;

impl GameOver {
    pub fn enter(ctx: &mut StageCtx) -> Box<dyn Stage> {
        ctx.set_phase(GamePhase::GameOver);
        let winner = ctx
            .state
            .scores
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(&p, _)| p)
            .expect("a finished game has seated peers");
        publish(
            ctx.events,
            GameEvent::GameOver {
                winner,
                scores: ctx.state.scores.clone(),
            },
        );
        Box::new(GameOver)
    }
}

impl Stage for GameOver {
    fn name(&self) -> &'static str {
        "game over"
    }

    fn process(self: Box<Self>, ctx: &mut StageCtx, input: StageInput) -> Box<dyn Stage> {
        match input {
            StageInput::Intent(_) => {
                ctx.reject(ProtocolViolation::PhaseMismatch {
                    message: "intent",
                    phase: GamePhase::GameOver,
                });
                self
            }
            _ => self,
        }
    }
}
