// The bidding cycle. Bids go around the table starting left of the dealer;
// the dealer bids last and is the only peer bound by the forbidden-sum rule.
// A runaway leader's bid is replaced by a seeded random legal value, computed
// identically on every peer from the shared seed.

use log::info;

use crate::api::{GameEvent, Intent};
use crate::error::ProtocolViolation;
use crate::events::publish;
use crate::protocol::Message;
use crate::rules;
use crate::scoring;
use crate::seed;
use crate::state::GamePhase;
use crate::types::PeerId;

use super::{Aborted, AckGate, Discarding, Stage, StageCtx, StageInput, Tricks};

pub struct Bidding {
    order: Vec<PeerId>,
    forced: Option<PeerId>,
    early: Vec<(PeerId, Message)>,
    /// Bids that overtook the one before them on the wire. Only per-sender
    /// order is guaranteed, so a later seat's bid can arrive first; it is
    /// retried after every commit.
    held: Vec<(PeerId, Message)>,
}

impl Bidding {
    pub fn enter(ctx: &mut StageCtx) -> Box<dyn Stage> {
        ctx.set_phase(GamePhase::Bidding);

        let seating = &ctx.state.seating;
        let dealer = ctx.state.dealer.expect("dealer fixed at the deal");
        let first = scoring::next_seat(seating, dealer);
        let second = scoring::next_seat(seating, first);
        let order = vec![first, second, dealer];
        ctx.state.turn = Some(first);

        let forced = ctx
            .cfg
            .bids
            .forced_bidder(&ctx.state.scores, ctx.state.round);
        if let Some(peer) = forced {
            info!(
                "[peer {}] dominant leader {} bids at random this round",
                ctx.local, peer
            );
        }

        Box::new(Bidding {
            order,
            forced,
            early: Vec::new(),
            held: Vec::new(),
        })
    }

    /// Validate a bid and return the value that actually stands, which for
    /// the forced bidder is the seeded random replacement.
    fn apply_bid(
        &self,
        ctx: &StageCtx,
        from: PeerId,
        round: u32,
        value: u8,
    ) -> Result<(u8, bool), ProtocolViolation> {
        if round != ctx.state.round {
            return Err(ProtocolViolation::StaleRound {
                got: round,
                want: ctx.state.round,
            });
        }
        if ctx.state.turn != Some(from) {
            return Err(ProtocolViolation::OutOfTurn(from));
        }
        let variant = ctx.state.variant;
        let hand_size = rules::hand_size_for_round(round, variant);
        let others: Vec<u8> = ctx.state.bids.values().copied().collect();
        let is_last = from == *self.order.last().expect("order holds three peers");

        if self.forced == Some(from) {
            let game_seed = ctx.state.game_seed.expect("seed agreed before bidding");
            let drawn = rules::random_legal_bid(
                hand_size,
                &others,
                is_last,
                round,
                variant,
                seed::forced_bid_seed(game_seed, round, from),
            );
            return Ok((drawn, true));
        }

        rules::validate_bid(value, hand_size, &others, is_last, round, variant)?;
        Ok((value, false))
    }

    fn commit_bid(
        mut self: Box<Self>,
        ctx: &mut StageCtx,
        from: PeerId,
        value: u8,
        forced: bool,
    ) -> Box<dyn Stage> {
        ctx.state.bids.insert(from, value);
        publish(
            ctx.events,
            GameEvent::BidPlaced {
                peer: from,
                bid: value,
                forced,
            },
        );

        let next = self
            .order
            .iter()
            .position(|&p| p == from)
            .and_then(|i| self.order.get(i + 1))
            .copied();
        ctx.state.turn = next;

        if ctx.state.bids.len() < self.order.len() {
            return self;
        }

        // All bids stand. Handicapped peers shed their extra cards first.
        let early = std::mem::take(&mut self.early);
        if ctx.state.owed_discards.is_empty() {
            AckGate::enter(ctx, GamePhase::PlayingTricks, early, Box::new(Tricks::enter))
        } else {
            AckGate::enter(ctx, GamePhase::Discarding, early, Box::new(Discarding::enter))
        }
    }
}

impl Stage for Bidding {
    fn name(&self) -> &'static str {
        "bidding"
    }

    fn process(mut self: Box<Self>, ctx: &mut StageCtx, input: StageInput) -> Box<dyn Stage> {
        match input {
            StageInput::Message {
                from,
                message: message @ Message::BidAnnounce { round, value },
            } => match self.apply_bid(ctx, from, *round, *value) {
                Ok((standing, forced)) => {
                    let held = std::mem::take(&mut self.held);
                    let mut stage = self.commit_bid(ctx, from, standing, forced);
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
                // The preceding seat's bid has not reached us yet; hold this
                // one until a commit makes it current.
                Err(ProtocolViolation::OutOfTurn(_)) => {
                    self.held.push((from, message.clone()));
                    self
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

            StageInput::Intent(Intent::ProposeBid(value)) => {
                match self.apply_bid(ctx, ctx.local, ctx.state.round, *value) {
                    Ok((standing, forced)) => {
                        // Broadcast the proposed value; every peer applies
                        // the same forced replacement, so the table
                        // converges on `standing`.
                        ctx.links.broadcast(Message::BidAnnounce {
                            round: ctx.state.round,
                            value: *value,
                        });
                        let local = ctx.local;
                        let held = std::mem::take(&mut self.held);
                        let mut stage = self.commit_bid(ctx, local, standing, forced);
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
                Aborted::enter(ctx, "timed out waiting for bids".to_string())
            }
        }
    }
}
