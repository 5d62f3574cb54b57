// Trick play. The peer left of the dealer leads the first trick; each winner
// leads the next. Cards move from hand to table under turn and suit-following
// checks, and a completed trick is resolved identically on every peer.

use log::info;

use crate::api::{GameEvent, Intent};
use crate::error::ProtocolViolation;
use crate::events::publish;
use crate::protocol::Message;
use crate::rules;
use crate::scoring;
use crate::state::{GamePhase, Trick};
use crate::types::{Card, PeerId, PLAYERS};

use super::{Aborted, AckGate, RoundScoring, Stage, StageCtx, StageInput};

pub struct Tricks {
    early: Vec<(PeerId, Message)>,
    /// Plays that overtook the one before them on the wire, including a
    /// winner's lead of the next trick arriving before the current trick's
    /// last card. Retried after every commit.
    held: Vec<(PeerId, Message)>,
}

impl Tricks {
    pub fn enter(ctx: &mut StageCtx) -> Box<dyn Stage> {
        ctx.set_phase(GamePhase::PlayingTricks);
        let dealer = ctx.state.dealer.expect("dealer fixed at the deal");
        let leader = scoring::next_seat(&ctx.state.seating, dealer);
        ctx.state.trick_leader = Some(leader);
        ctx.state.turn = Some(leader);
        Box::new(Tricks {
            early: Vec::new(),
            held: Vec::new(),
        })
    }

    fn apply_play(
        &self,
        ctx: &StageCtx,
        from: PeerId,
        round: u32,
        trick: u8,
        card: Card,
    ) -> Result<(), ProtocolViolation> {
        if round != ctx.state.round {
            return Err(ProtocolViolation::StaleRound {
                got: round,
                want: ctx.state.round,
            });
        }
        if trick as usize != ctx.state.trick_history.len() {
            return Err(ProtocolViolation::PhaseMismatch {
                message: "CardPlayed",
                phase: ctx.state.phase,
            });
        }
        if ctx.state.turn != Some(from) {
            return Err(ProtocolViolation::OutOfTurn(from));
        }
        let hand = ctx.state.hand(from);
        if !hand.contains(&card) {
            return Err(ProtocolViolation::CardNotInHand(card));
        }
        if !rules::is_legal_play(hand, card, ctx.state.led_suit()) {
            return Err(ProtocolViolation::MustFollowSuit);
        }
        Ok(())
    }

    fn commit_play(
        mut self: Box<Self>,
        ctx: &mut StageCtx,
        from: PeerId,
        card: Card,
    ) -> Box<dyn Stage> {
        let hand = ctx.state.hands.get_mut(&from).expect("peer holds a hand");
        hand.retain(|&c| c != card);
        ctx.state.table.push((from, card));

        if ctx.state.table.len() < PLAYERS {
            ctx.state.turn = Some(scoring::next_seat(&ctx.state.seating, from));
            return self;
        }

        // Table is full; resolve the trick.
        let plays = std::mem::take(&mut ctx.state.table);
        let winner = rules::resolve_trick(&plays, ctx.state.trump)
            .expect("a full trick always has a winner");
        let trick = Trick {
            leader: ctx.state.trick_leader.expect("a trick in play has a leader"),
            plays,
            winner,
        };
        *ctx.state.tricks_won.entry(winner).or_insert(0) += 1;
        ctx.state.trick_history.push(trick.clone());
        ctx.state.trick_leader = Some(winner);
        ctx.state.turn = Some(winner);
        info!(
            "[peer {}] trick {} won by {}",
            ctx.local,
            ctx.state.trick_history.len(),
            winner
        );
        publish(ctx.events, GameEvent::TrickResolved(trick));
        debug_assert!(ctx.state.card_conservation_holds());

        let hands_empty = ctx.state.hands.values().all(Vec::is_empty);
        if !hands_empty {
            return self;
        }
        ctx.state.turn = None;
        ctx.state.trick_leader = None;
        let early = std::mem::take(&mut self.early);
        AckGate::enter(
            ctx,
            GamePhase::RoundScoring,
            early,
            Box::new(RoundScoring::enter),
        )
    }
}

impl Stage for Tricks {
    fn name(&self) -> &'static str {
        "playing tricks"
    }

    fn process(mut self: Box<Self>, ctx: &mut StageCtx, input: StageInput) -> Box<dyn Stage> {
        match input {
            StageInput::Message {
                from,
                message: message @ Message::CardPlayed { round, trick, card },
            } => {
                // A play for a trick we have not resolved yet waits with the
                // out-of-turn ones.
                if *round == ctx.state.round
                    && *trick as usize > ctx.state.trick_history.len()
                {
                    self.held.push((from, message.clone()));
                    return self;
                }
                match self.apply_play(ctx, from, *round, *trick, *card) {
                    Ok(()) => {
                        let held = std::mem::take(&mut self.held);
                        let mut stage = self.commit_play(ctx, from, *card);
                        for (peer, held_message) in held {
                            stage = stage.process(
                                ctx,
                                StageInput::Message {
                                    from: peer,
                                    message: &held_message,
                                },
                            );
                        }
                        stage
                    }
                    Err(ProtocolViolation::OutOfTurn(_)) => {
                        self.held.push((from, message.clone()));
                        self
                    }
                    Err(violation) => {
                        ctx.diagnose(from, violation);
                        self
                    }
                }
            }

            StageInput::Message { from, message } => {
                self.early.push((from, message.clone()));
                self
            }

            StageInput::Intent(Intent::PlayCard(card)) => {
                let round = ctx.state.round;
                let trick = ctx.state.trick_history.len() as u8;
                match self.apply_play(ctx, ctx.local, round, trick, *card) {
                    Ok(()) => {
                        ctx.links.broadcast(Message::CardPlayed {
                            round,
                            trick,
                            card: *card,
                        });
                        let local = ctx.local;
                        let held = std::mem::take(&mut self.held);
                        let mut stage = self.commit_play(ctx, local, *card);
                        for (peer, held_message) in held {
                            stage = stage.process(
                                ctx,
                                StageInput::Message {
                                    from: peer,
                                    message: &held_message,
                                },
                            );
                        }
                        stage
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
                Aborted::enter(ctx, "timed out waiting for a card".to_string())
            }
        }
    }
}
