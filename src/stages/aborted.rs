// Terminal stage entered when the session can no longer continue: a peer
// left mid-round, a phase timed out, or the states diverged. The 3-party
// protocol has no defined behavior with fewer than three active peers, so
// the round is abandoned rather than limped through.

use crate::api::GameEvent;
use crate::error::ProtocolViolation;
use crate::events::publish;
use crate::state::GamePhase;

use super::{Stage, StageCtx, StageInput};

pub struct Aborted;

impl Aborted {
    pub fn enter(ctx: &mut StageCtx, reason: String) -> Box<dyn Stage> {
        ctx.set_phase(GamePhase::Aborted);
        publish(ctx.events, GameEvent::Aborted { reason });
        Box::new(Aborted)
    }
}

impl Stage for Aborted {
    fn name(&self) -> &'static str {
        "aborted"
    }

    // Always reject; the session is over.
    fn process(self: Box<Self>, ctx: &mut StageCtx, input: StageInput) -> Box<dyn Stage> {
        if let StageInput::Intent(_) = input {
            ctx.reject(ProtocolViolation::PhaseMismatch {
                message: "intent",
                phase: GamePhase::Aborted,
            });
        }
        self
    }
}
