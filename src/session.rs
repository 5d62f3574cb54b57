// The top-level engine instance for one peer. Owns the replicated game state
// and the current stage, consumes local intents and peer messages from a
// single queue, and publishes snapshots and events outward. All state
// mutation happens on this one consumer; connection I/O lives elsewhere.

use std::collections::BTreeMap;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, watch};

use crate::api::{GameEvent, Intent, Snapshot};
use crate::connection::ConnectionPhase;
use crate::error::EngineError;
use crate::events::{publish, EventReceiver, EventSender, InputReceiver, InputSender, PeerMap, SessionInput};
use crate::protocol::{Envelope, Message};
use crate::rules::BidPolicy;
use crate::scoring::{HandicapPolicy, ScoreConfig, TallyConfig};
use crate::stages::{Lobby, Stage, StageCtx, StageInput};
use crate::state::GameState;
use crate::types::{Card, DeckVariant, PeerId, PLAYERS};

/// Game-rule and engine configuration. Peers must run identical rule values;
/// the state hash in the acknowledgement gate catches tables that don't.
#[derive(Clone, Debug)]
pub struct RuleConfig {
    pub variant: DeckVariant,
    pub score: ScoreConfig,
    pub handicap: HandicapPolicy,
    pub bids: BidPolicy,
    pub tally: TallyConfig,
    /// Maximum wait within one phase before the slow peer is treated as
    /// disconnected and the round is aborted.
    pub phase_timeout: Duration,
    /// Compare state hashes at every phase transition.
    pub integrity_check: bool,
    pub display_name: String,
    /// Rolling per-peer loss counter maintained by the persistence
    /// collaborator; feeds the handicap policy.
    pub monthly_losses: BTreeMap<PeerId, u32>,
    /// Fixed seed contribution for tests; live tables draw fresh entropy.
    pub seed_part: Option<u64>,
}

impl Default for RuleConfig {
    fn default() -> Self {
        RuleConfig {
            variant: DeckVariant::Short32,
            score: ScoreConfig::default(),
            handicap: HandicapPolicy::default(),
            bids: BidPolicy::default(),
            tally: TallyConfig::default(),
            phase_timeout: Duration::from_secs(30),
            integrity_check: true,
            display_name: "player".to_string(),
            monthly_losses: BTreeMap::new(),
            seed_part: None,
        }
    }
}

pub struct Session {
    local: PeerId,
    cfg: RuleConfig,
    state: GameState,
    // Option so ownership can pass into the stage method and come back.
    stage: Option<Box<dyn Stage>>,
    links: PeerMap,
    events: EventSender,
    input_rx: InputReceiver,
    snapshot_tx: watch::Sender<Snapshot>,
}

impl Session {
    /// Build an engine for `local`, talking to the two remote peers through
    /// `links`. Returns the engine, the handle for the presentation layer
    /// and the transport, and the event stream.
    pub fn new(
        local: PeerId,
        cfg: RuleConfig,
        links: PeerMap,
    ) -> (Self, SessionHandle, EventReceiver) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut state = GameState::new(cfg.variant);
        let stage = {
            let mut ctx = StageCtx {
                local,
                state: &mut state,
                links: &links,
                events: &event_tx,
                cfg: &cfg,
            };
            Lobby::enter(&mut ctx)
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(state.clone());

        let session = Session {
            local,
            cfg,
            state,
            stage: Some(stage),
            links,
            events: event_tx,
            input_rx,
            snapshot_tx,
        };
        let handle = SessionHandle {
            input: input_tx,
            snapshot: snapshot_rx,
        };
        (session, handle, event_rx)
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Swap in the outgoing links. The transport needs the handle to deliver
    /// inbound traffic, so links are wired up after construction.
    pub fn set_links(&mut self, links: PeerMap) {
        self.links = links;
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    /// Process one input synchronously. Exposed so tests can drive three
    /// engines deterministically without timers.
    pub fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Link { peer, phase } => {
                publish(&self.events, GameEvent::PeerLink { peer, phase });
                match phase {
                    ConnectionPhase::Connected => {
                        // Introduce ourselves on the freshly-opened link.
                        // Identities only matter while the table is filling;
                        // a reconnecting link keeps its cached identity.
                        if self.state.seating.len() < PLAYERS {
                            self.links.send_to(
                                peer,
                                Message::IdentityAnnounce {
                                    peer: self.local,
                                    display_name: self.cfg.display_name.clone(),
                                },
                            );
                        }
                    }
                    ConnectionPhase::Failed | ConnectionPhase::Disconnected => {
                        self.step(StageInput::PeerLost(peer));
                    }
                    _ => {}
                }
            }
            SessionInput::FromPeer(env) => {
                if env.message.is_signaling() {
                    debug!(
                        "[peer {}] stray signaling message {} reached the engine",
                        self.local,
                        env.message.name()
                    );
                } else if matches!(
                    &env.message,
                    Message::IdentityAnnounce { peer, .. } if self.state.names.contains_key(peer)
                ) {
                    // Nothing past the lobby consumes an announcement, so a
                    // redundant one would otherwise ride the stage buffers
                    // for the rest of the game.
                    debug!(
                        "[peer {}] redundant identity announcement from {}",
                        self.local, env.sender
                    );
                } else {
                    self.step(StageInput::Message {
                        from: env.sender,
                        message: &env.message,
                    });
                }
            }
            SessionInput::Intent(intent) => {
                self.step(StageInput::Intent(&intent));
            }
        }
        self.publish_snapshot();
    }

    /// Run until every input handle is dropped.
    pub async fn run(mut self) {
        let mut phase = self.state.phase;
        let mut deadline = tokio::time::Instant::now() + self.cfg.phase_timeout;
        loop {
            tokio::select! {
                input = self.input_rx.recv() => {
                    let Some(input) = input else {
                        info!("[peer {}] all inputs dropped - engine exiting", self.local);
                        return;
                    };
                    self.handle_input(input);
                    if self.state.phase != phase {
                        phase = self.state.phase;
                        deadline = tokio::time::Instant::now() + self.cfg.phase_timeout;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.step(StageInput::Timeout);
                    self.publish_snapshot();
                    phase = self.state.phase;
                    deadline = tokio::time::Instant::now() + self.cfg.phase_timeout;
                }
            }
        }
    }

    fn step(&mut self, input: StageInput) {
        // Give up and then retake ownership of the stage object.
        let stage = self.stage.take().expect("engine always has a stage");
        let mut ctx = StageCtx {
            local: self.local,
            state: &mut self.state,
            links: &self.links,
            events: &self.events,
            cfg: &self.cfg,
        };
        self.stage = Some(stage.process(&mut ctx, input));
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.state.clone());
    }
}

/// Cheap cloneable handle: programmatic entry points for the presentation
/// layer plus the inbound path for the connection sessions.
#[derive(Clone)]
pub struct SessionHandle {
    input: InputSender,
    snapshot: watch::Receiver<Snapshot>,
}

impl SessionHandle {
    pub fn propose_bid(&self, bid: u8) -> Result<(), EngineError> {
        self.intent(Intent::ProposeBid(bid))
    }

    pub fn play_card(&self, card: Card) -> Result<(), EngineError> {
        self.intent(Intent::PlayCard(card))
    }

    pub fn choose_trump(&self, card: Card) -> Result<(), EngineError> {
        self.intent(Intent::ChooseTrump(card))
    }

    pub fn discard(&self, cards: Vec<Card>) -> Result<(), EngineError> {
        self.intent(Intent::Discard(cards))
    }

    pub fn leave(&self) -> Result<(), EngineError> {
        self.intent(Intent::Leave)
    }

    /// Ordered, deduplicated delivery from a connection session.
    pub fn on_peer_message(&self, envelope: Envelope) -> Result<(), EngineError> {
        self.send(SessionInput::FromPeer(envelope))
    }

    /// A connection session changed phase.
    pub fn link_update(&self, peer: PeerId, phase: ConnectionPhase) -> Result<(), EngineError> {
        self.send(SessionInput::Link { peer, phase })
    }

    /// The current immutable snapshot of the replicated state.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    fn intent(&self, intent: Intent) -> Result<(), EngineError> {
        self.send(SessionInput::Intent(intent))
    }

    fn send(&self, input: SessionInput) -> Result<(), EngineError> {
        self.input.send(input).map_err(|_| EngineError::Closed)
    }
}
