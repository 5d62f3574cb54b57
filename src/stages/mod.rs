// The major stages of a table session, coordinated by the engine loop. Each
// stage accepts local intents and remote messages and returns the next stage;
// advancement between phases goes through an all-acknowledged gate so no peer
// runs ahead of the others.

mod aborted;
mod bidding;
mod choosing_trump;
mod dealing;
mod discarding;
mod lobby;
mod round_scoring;
mod seed_exchange;
mod tricks;

pub use self::aborted::Aborted;
pub use self::bidding::Bidding;
pub use self::choosing_trump::ChoosingTrump;
pub use self::dealing::Dealing;
pub use self::discarding::Discarding;
pub use self::lobby::Lobby;
pub use self::round_scoring::RoundScoring;
pub use self::seed_exchange::SeedExchange;
pub use self::tricks::Tricks;

use std::collections::BTreeSet;

use log::{error, info, warn};

use crate::api::{GameEvent, Intent};
use crate::error::ProtocolViolation;
use crate::events::{publish, EventSender, PeerMap};
use crate::protocol::Message;
use crate::session::RuleConfig;
use crate::state::{GamePhase, GameState};
use crate::types::PeerId;

/// Everything a stage may touch while processing one input. The engine loop
/// owns these; the stage borrows them for the duration of the call.
pub struct StageCtx<'a> {
    pub local: PeerId,
    pub state: &'a mut GameState,
    pub links: &'a PeerMap,
    pub events: &'a EventSender,
    pub cfg: &'a RuleConfig,
}

impl StageCtx<'_> {
    /// Move the replicated phase and surface it to the presentation layer.
    pub fn set_phase(&mut self, phase: GamePhase) {
        if self.state.phase != phase {
            info!("[peer {}] phase {:?} -> {:?}", self.local, self.state.phase, phase);
            self.state.phase = phase;
            publish(self.events, GameEvent::PhaseChanged(phase));
        }
    }

    /// Report a rejected local intent back to the caller.
    pub fn reject(&mut self, violation: ProtocolViolation) {
        warn!("[peer {}] intent rejected: {}", self.local, violation);
        publish(self.events, GameEvent::IntentRejected(violation));
    }

    /// A remote peer sent something the rules reject. Local state is not
    /// mutated and the engine does not desync; the violation is diagnostic.
    pub fn diagnose(&mut self, from: PeerId, violation: ProtocolViolation) {
        error!("[peer {}] invalid message from {}: {}", self.local, from, violation);
    }
}

/// One input for the current stage.
pub enum StageInput<'a> {
    /// A local user intent.
    Intent(&'a Intent),
    /// A deduplicated, in-order message from a remote peer (or the local
    /// echo of our own broadcast path).
    Message { from: PeerId, message: &'a Message },
    /// A peer's link reached a terminal state mid-session.
    PeerLost(PeerId),
    /// The per-phase maximum wait elapsed without the required inputs.
    Timeout,
}

// `Send` so an engine that owns a stage can live on a spawned task.
pub trait Stage: Send {
    fn name(&self) -> &'static str;

    /// Accepts one input and returns the next stage of the session. A stage
    /// returns itself when the session stage hasn't changed.
    fn process(self: Box<Self>, ctx: &mut StageCtx, input: StageInput) -> Box<dyn Stage>;
}

/// Acknowledgement set for one phase transition. Inserts are idempotent, so
/// duplicate or re-sent acknowledgements are no-ops after the first.
#[derive(Debug, Default)]
pub struct AckSet {
    seen: BTreeSet<PeerId>,
}

impl AckSet {
    pub fn insert(&mut self, peer: PeerId) -> bool {
        self.seen.insert(peer)
    }

    /// The transition fires exactly when the set equals the full peer set.
    pub fn complete(&self, seating: &[PeerId]) -> bool {
        seating.iter().all(|p| self.seen.contains(p))
    }
}

/// The all-acknowledged gate between two phases. Entered once this peer's
/// work for the closing phase is done: it broadcasts our `PhaseAck`
/// (optionally carrying the state hash for the integrity check), collects the
/// others, and only then constructs the next stage. Game messages from peers
/// that cleared the gate first are buffered and replayed into the next stage.
pub struct AckGate {
    expect: GamePhase,
    our_hash: Option<String>,
    acks: AckSet,
    queued: Vec<(PeerId, Message)>,
    next: Box<dyn FnOnce(&mut StageCtx) -> Box<dyn Stage> + Send>,
}

impl AckGate {
    /// `early` holds acknowledgements that reached the previous stage before
    /// it finished its own work.
    pub fn enter(
        ctx: &mut StageCtx,
        expect: GamePhase,
        early: Vec<(PeerId, Message)>,
        next: Box<dyn FnOnce(&mut StageCtx) -> Box<dyn Stage> + Send>,
    ) -> Box<dyn Stage> {
        let our_hash = ctx
            .cfg
            .integrity_check
            .then(|| ctx.state.integrity_hash());
        ctx.links.broadcast(Message::PhaseAck {
            phase: expect,
            state_hash: our_hash.clone(),
        });
        let mut acks = AckSet::default();
        acks.insert(ctx.local);

        let mut gate = Box::new(AckGate {
            expect,
            our_hash,
            acks,
            queued: Vec::new(),
            next,
        });
        let mut early = early.into_iter();
        while let Some((from, message)) = early.next() {
            match gate.absorb(ctx, from, &message) {
                GateOutcome::Open => {
                    // Inputs that arrived after the opening acknowledgement
                    // belong to the next stage.
                    gate.queued.extend(early);
                    return gate.open(ctx);
                }
                GateOutcome::Fatal(stage) => return stage,
                GateOutcome::Waiting => {}
            }
        }
        gate
    }

    fn absorb(&mut self, ctx: &mut StageCtx, from: PeerId, message: &Message) -> GateOutcome {
        match message {
            Message::PhaseAck { phase, state_hash } if *phase == self.expect => {
                if let (Some(ours), Some(theirs)) = (&self.our_hash, state_hash) {
                    if ours != theirs {
                        error!(
                            "[peer {}] desync detected entering {:?}: ours {} theirs {} from {}",
                            ctx.local, self.expect, ours, theirs, from
                        );
                        return GateOutcome::Fatal(Aborted::enter(
                            ctx,
                            format!("state desync detected with peer {from}"),
                        ));
                    }
                }
                self.acks.insert(from);
                if self.acks.complete(&ctx.state.seating) {
                    GateOutcome::Open
                } else {
                    GateOutcome::Waiting
                }
            }
            // A faster peer has already entered the next phase; hold its
            // game messages, and its acknowledgement of its *next* gate,
            // until we open. Per-sender order means an acknowledgement for a
            // different phase can only belong to a later gate, never a
            // passed one.
            other => {
                self.queued.push((from, other.clone()));
                GateOutcome::Waiting
            }
        }
    }

    fn open(self: Box<Self>, ctx: &mut StageCtx) -> Box<dyn Stage> {
        let AckGate { queued, next, .. } = *self;
        let mut stage = next(ctx);
        for (from, message) in queued {
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
}

enum GateOutcome {
    Waiting,
    Open,
    Fatal(Box<dyn Stage>),
}

impl Stage for AckGate {
    fn name(&self) -> &'static str {
        "awaiting acknowledgements"
    }

    fn process(mut self: Box<Self>, ctx: &mut StageCtx, input: StageInput) -> Box<dyn Stage> {
        match input {
            StageInput::Message { from, message } => match self.absorb(ctx, from, message) {
                GateOutcome::Open => self.open(ctx),
                GateOutcome::Fatal(stage) => stage,
                GateOutcome::Waiting => self,
            },
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
            StageInput::Timeout => Aborted::enter(
                ctx,
                format!("timed out waiting for acknowledgements of {:?}", self.expect),
            ),
        }
    }
}
