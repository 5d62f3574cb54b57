// The opening stage: waiting for the two remote links to come up and for all
// three identities to be announced. Seating is fixed in ascending peer-id
// order the moment the table is full.

use log::info;

use crate::error::ProtocolViolation;
use crate::protocol::Message;
use crate::state::GamePhase;
use crate::types::{PeerId, PLAYERS};

use super::{Aborted, AckGate, SeedExchange, Stage, StageCtx, StageInput};

pub struct Lobby {
    /// Acknowledgements and game messages that raced ahead of the final
    /// identity announcement.
    early: Vec<(PeerId, Message)>,
}

impl Lobby {
    pub fn enter(ctx: &mut StageCtx) -> Box<dyn Stage> {
        ctx.set_phase(GamePhase::WaitingForPlayers);
        let local = ctx.local;
        let name = ctx.cfg.display_name.clone();
        seat(ctx, local, name);
        Box::new(Lobby { early: Vec::new() })
    }
}

fn seat(ctx: &mut StageCtx, peer: PeerId, name: String) {
    if !ctx.state.seated(peer) {
        ctx.state.seating.push(peer);
        ctx.state.seating.sort();
        ctx.state.scores.entry(peer).or_insert(0);
        info!("[peer {}] seated peer {} ({})", ctx.local, peer, name);
    }
    ctx.state.names.insert(peer, name);
}

fn unseat(ctx: &mut StageCtx, peer: PeerId) {
    ctx.state.seating.retain(|&p| p != peer);
    ctx.state.names.remove(&peer);
    ctx.state.scores.remove(&peer);
    info!("[peer {}] unseated peer {}", ctx.local, peer);
}

impl Stage for Lobby {
    fn name(&self) -> &'static str {
        "in the lobby"
    }

    fn process(mut self: Box<Self>, ctx: &mut StageCtx, input: StageInput) -> Box<dyn Stage> {
        match input {
            StageInput::Message {
                from,
                message: Message::IdentityAnnounce { peer, display_name },
            } => {
                if from != *peer {
                    ctx.diagnose(from, ProtocolViolation::UnknownPeer(*peer));
                    return self;
                }
                if ctx.state.phase == GamePhase::WaitingForPlayers {
                    ctx.set_phase(GamePhase::ExchangingIdentities);
                }
                seat(ctx, *peer, display_name.clone());

                if ctx.state.seating.len() == PLAYERS {
                    info!("[peer {}] table is full, starting", ctx.local);
                    return AckGate::enter(
                        ctx,
                        GamePhase::ExchangingSeed,
                        self.early,
                        Box::new(SeedExchange::enter),
                    );
                }
                self
            }

            // A peer that already saw the full table may ack, or even send
            // its seed contribution, before the last identity reaches us.
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

            // Before the game proper starts a lost peer just frees its seat.
            StageInput::PeerLost(peer) => {
                unseat(ctx, peer);
                if ctx.state.phase == GamePhase::ExchangingIdentities
                    && ctx.state.seating.len() == 1
                {
                    ctx.set_phase(GamePhase::WaitingForPlayers);
                }
                self
            }

            // The lobby has no deadline; it waits for players.
            StageInput::Timeout => self,
        }
    }
}
