// Rounds 1-3: the trump suit comes from the four-card stock set aside at the
// deal. Stock cards are turned in seating order starting at the dealer; the
// peer who turns the pack's marker rank picks the trump from the stock, and
// if no marker shows, the last turned card fixes the trump by itself.

use log::info;

use crate::api::{GameEvent, Intent};
use crate::error::ProtocolViolation;
use crate::events::publish;
use crate::protocol::Message;
use crate::scoring;
use crate::state::GamePhase;
use crate::types::{Card, PeerId};

use super::{Aborted, AckGate, Bidding, Stage, StageCtx, StageInput};

pub struct ChoosingTrump {
    chooser: PeerId,
    early: Vec<(PeerId, Message)>,
}

impl ChoosingTrump {
    pub fn enter(ctx: &mut StageCtx) -> Box<dyn Stage> {
        ctx.set_phase(GamePhase::ChoosingTrump);

        let dealer = ctx.state.dealer.expect("dealer fixed at the deal");
        let marker = ctx.state.variant.marker_rank();

        // Deterministic turn order over the stock: dealer first, then round
        // the table.
        let mut turner = dealer;
        let mut chooser = None;
        for card in &ctx.state.trump_stock {
            if card.rank == marker {
                chooser = Some(turner);
                break;
            }
            turner = scoring::next_seat(&ctx.state.seating, turner);
        }

        match chooser {
            Some(chooser) => {
                info!(
                    "[peer {}] peer {} turned the marker and chooses trump",
                    ctx.local, chooser
                );
                Box::new(ChoosingTrump {
                    chooser,
                    early: Vec::new(),
                })
            }
            None => {
                let turned = *ctx
                    .state
                    .trump_stock
                    .last()
                    .expect("stock holds four cards");
                fix_trump(ctx, turned.suit, None)
            }
        }
    }

    fn apply_choice(
        &self,
        ctx: &StageCtx,
        from: PeerId,
        card: Card,
    ) -> Result<(), ProtocolViolation> {
        if from != self.chooser {
            return Err(ProtocolViolation::NotTrumpChooser(from));
        }
        if !ctx.state.trump_stock.contains(&card) {
            return Err(ProtocolViolation::CardNotInHand(card));
        }
        Ok(())
    }
}

fn fix_trump(ctx: &mut StageCtx, suit: crate::types::Suit, chooser: Option<PeerId>) -> Box<dyn Stage> {
    ctx.state.trump = Some(suit);
    publish(ctx.events, GameEvent::TrumpFixed { suit, chooser });
    AckGate::enter(ctx, GamePhase::Bidding, Vec::new(), Box::new(Bidding::enter))
}

impl Stage for ChoosingTrump {
    fn name(&self) -> &'static str {
        "choosing trump"
    }

    fn process(mut self: Box<Self>, ctx: &mut StageCtx, input: StageInput) -> Box<dyn Stage> {
        match input {
            StageInput::Message {
                from,
                message: Message::TrumpChosen { card },
            } => match self.apply_choice(ctx, from, *card) {
                Ok(()) => {
                    let early = std::mem::take(&mut self.early);
                    let stage = fix_trump(ctx, card.suit, Some(from));
                    replay(stage, ctx, early)
                }
                Err(violation) => {
                    ctx.diagnose(from, violation);
                    self
                }
            },

            StageInput::Message { from, message } => {
                self.early.push((from, message.clone()));
                self
            }

            StageInput::Intent(Intent::ChooseTrump(card)) => {
                match self.apply_choice(ctx, ctx.local, *card) {
                    Ok(()) => {
                        ctx.links.broadcast(Message::TrumpChosen { card: *card });
                        let early = std::mem::take(&mut self.early);
                        let local = ctx.local;
                        let stage = fix_trump(ctx, card.suit, Some(local));
                        replay(stage, ctx, early)
                    }
                    Err(violation) => {
                        ctx.reject(violation);
                        self
                    }
                }
            }
            StageInput::Intent(Intent::Leave) => {
                Aborted::enter(ctx, "local player left".to_string())
            }
            StageInput::Intent(_) => {
                ctx.reject(ProtocolViolation::PhaseMismatch {
                    message: "intent",
                    phase: ctx.state.phase,
                });
                self
            }

            StageInput::PeerLost(peer) => Aborted::enter(ctx, format!("peer {peer} disconnected")),
            StageInput::Timeout => {
                Aborted::enter(ctx, "timed out waiting for the trump choice".to_string())
            }
        }
    }
}

/// Feed messages that arrived ahead of the transition into the new stage.
fn replay(
    mut stage: Box<dyn Stage>,
    ctx: &mut StageCtx,
    early: Vec<(PeerId, Message)>,
) -> Box<dyn Stage> {
    for (from, message) in early {
        stage = stage.process(
            ctx,
            StageInput::Message {
                from,
                message: &message,
            },
        );
    }
    stage
}
