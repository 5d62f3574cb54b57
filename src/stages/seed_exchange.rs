// Seed agreement: every peer contributes one random value and the combined
// seed drives every deal of the game. The combiner is order-independent, so
// no leader election or locking is needed to merge the three contributions.

use log::info;

use crate::error::ProtocolViolation;
use crate::protocol::Message;
use crate::seed;
use crate::state::GamePhase;
use crate::types::{PeerId, PLAYERS};

use super::{Aborted, AckGate, Dealing, Stage, StageCtx, StageInput};

pub struct SeedExchange {
    early: Vec<(PeerId, Message)>,
}

impl SeedExchange {
    pub fn enter(ctx: &mut StageCtx) -> Box<dyn Stage> {
        ctx.set_phase(GamePhase::ExchangingSeed);

        // Fixed contributions are for tests; live tables draw fresh entropy.
        let part = ctx.cfg.seed_part.unwrap_or_else(rand::random);
        ctx.state.seed_parts.insert(ctx.local, part);
        ctx.links.broadcast(Message::SeedContribution { value: part });

        Box::new(SeedExchange { early: Vec::new() }).maybe_finish(ctx)
    }

    fn maybe_finish(self: Box<Self>, ctx: &mut StageCtx) -> Box<dyn Stage> {
        if ctx.state.seed_parts.len() < PLAYERS {
            return self;
        }
        let game_seed = seed::combine(ctx.state.seed_parts.values().copied());
        ctx.state.game_seed = Some(game_seed);
        info!("[peer {}] agreed on game seed {}", ctx.local, game_seed);
        AckGate::enter(
            ctx,
            GamePhase::SetupRound,
            self.early,
            Box::new(Dealing::enter),
        )
    }
}

impl Stage for SeedExchange {
    fn name(&self) -> &'static str {
        "exchanging seeds"
    }

    fn process(mut self: Box<Self>, ctx: &mut StageCtx, input: StageInput) -> Box<dyn Stage> {
        match input {
            StageInput::Message {
                from,
                message: Message::SeedContribution { value },
            } => {
                match ctx.state.seed_parts.get(&from) {
                    // Duplicate contributions are idempotent no-ops; a
                    // conflicting one is a protocol violation.
                    Some(existing) if existing == value => return self,
                    Some(_) => {
                        ctx.diagnose(from, ProtocolViolation::DuplicateInput(from));
                        return self;
                    }
                    None => {}
                }
                ctx.state.seed_parts.insert(from, *value);
                self.maybe_finish(ctx)
            }

            StageInput::Message { from, message } => {
                self.early.push((from, message.clone()));
                self
            }

            StageInput::Intent(crate::api::Intent::Leave) => {
                Aborted::enter(ctx, "local player left".to_string())
            }
            StageInput::Intent(_) => {
                ctx.reject(ProtocolViolation::PhaseMismatch {
                    message: "intent",
                    phase: ctx.state.phase,
                });
                self
            }

            StageInput::PeerLost(peer) => {
                Aborted::enter(ctx, format!("peer {peer} disconnected"))
            }
            StageInput::Timeout => {
                Aborted::enter(ctx, "timed out waiting for seed contributions".to_string())
            }
        }
    }
}
