// Handicapped peers were dealt extra cards at the deal; after bidding they
// discard back down to the round's hand size. Discarded cards return to the
// undealt pack so the card-conservation invariant keeps holding.

use std::collections::HashSet;

use crate::api::Intent;
use crate::error::ProtocolViolation;
use crate::protocol::Message;
use crate::state::GamePhase;
use crate::types::{Card, PeerId};

use super::{Aborted, AckGate, Stage, StageCtx, StageInput, Tricks};

pub struct Discarding {
    early: Vec<(PeerId, Message)>,
}

impl Discarding {
    pub fn enter(ctx: &mut StageCtx) -> Box<dyn Stage> {
        ctx.set_phase(GamePhase::Discarding);
        debug_assert!(!ctx.state.owed_discards.is_empty());
        Box::new(Discarding { early: Vec::new() })
    }

    fn apply_discard(
        &self,
        ctx: &StageCtx,
        from: PeerId,
        round: u32,
        cards: &[Card],
    ) -> Result<(), ProtocolViolation> {
        if round != ctx.state.round {
            return Err(ProtocolViolation::StaleRound {
                got: round,
                want: ctx.state.round,
            });
        }
        let owed = ctx.state.owed_discards.get(&from).copied().unwrap_or(0);
        let unique: HashSet<Card> = cards.iter().copied().collect();
        if unique.len() != owed as usize || unique.len() != cards.len() {
            return Err(ProtocolViolation::WrongDiscardCount {
                got: cards.len(),
                want: owed as usize,
            });
        }
        let hand = ctx.state.hand(from);
        if let Some(&missing) = cards.iter().find(|c| !hand.contains(c)) {
            return Err(ProtocolViolation::CardNotInHand(missing));
        }
        Ok(())
    }

    fn commit_discard(
        mut self: Box<Self>,
        ctx: &mut StageCtx,
        from: PeerId,
        cards: &[Card],
    ) -> Box<dyn Stage> {
        let hand = ctx.state.hands.get_mut(&from).expect("peer holds a hand");
        hand.retain(|c| !cards.contains(c));
        // Back under the pack, face down. The undealt remainder has no
        // meaningful order once the trump is fixed; keeping it sorted makes
        // simultaneous discards commit to the same state on every peer.
        ctx.state.deck.extend(cards.iter().copied());
        ctx.state.deck.sort();
        ctx.state.owed_discards.remove(&from);
        debug_assert!(ctx.state.card_conservation_holds());

        if !ctx.state.owed_discards.is_empty() {
            return self;
        }
        let early = std::mem::take(&mut self.early);
        AckGate::enter(ctx, GamePhase::PlayingTricks, early, Box::new(Tricks::enter))
    }
}

impl Stage for Discarding {
    fn name(&self) -> &'static str {
        "discarding handicap cards"
    }

    fn process(mut self: Box<Self>, ctx: &mut StageCtx, input: StageInput) -> Box<dyn Stage> {
        match input {
            StageInput::Message {
                from,
                message: Message::DiscardSet { round, cards },
            } => match self.apply_discard(ctx, from, *round, cards) {
                Ok(()) => {
                    let cards = cards.clone();
                    self.commit_discard(ctx, from, &cards)
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

            StageInput::Intent(Intent::Discard(cards)) => {
                match self.apply_discard(ctx, ctx.local, ctx.state.round, cards) {
                    Ok(()) => {
                        ctx.links.broadcast(Message::DiscardSet {
                            round: ctx.state.round,
                            cards: cards.clone(),
                        });
                        let local = ctx.local;
                        let cards = cards.clone();
                        self.commit_discard(ctx, local, &cards)
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
                Aborted::enter(ctx, "timed out waiting for discards".to_string())
            }
        }
    }
}
