// Per-remote-peer connection session: the signaling handshake, reconnection
// with a cached identity, and the ordered, deduplicated message stream the
// engine sees. The machine is synchronous and I/O-free; the wire bridge (or a
// test) drives it and executes the commands it emits. Grounded on the
// offer/answer exchange shape of WebRTC-style signaling.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;
use crate::protocol::{Envelope, Message};
use crate::types::PeerId;

/// State of one peer link. One machine per remote peer, mutated only by that
/// peer's session.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ConnectionPhase {
    Idle,
    Initiating,
    Offering,
    WaitingForOffer,
    Answering,
    WaitingForAnswer,
    ExchangingNetworkInfo,
    Connecting,
    Reconnecting,
    Connected,
    Failed,
    Disconnected,
}

impl ConnectionPhase {
    /// Terminal for this attempt; only a fresh `start` leaves these.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionPhase::Failed | ConnectionPhase::Disconnected)
    }
}

/// Retry budgets and backoff shape for one link.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    /// Dial attempts during the initial handshake before `Failed`.
    pub handshake_attempts: u32,
    /// Re-dial attempts after an established link drops.
    pub reconnect_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            handshake_attempts: 4,
            reconnect_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryConfig {
    /// Bounded exponential backoff for the given zero-based attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

/// Effects for the driver to execute. The session never performs I/O itself.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionCommand {
    /// Signaling message for the remote peer.
    SendSignal(Message),
    /// Sequenced application envelope to write to the open transport.
    Transmit(Envelope),
    /// In-order application message for the engine.
    Deliver(Envelope),
    /// (Re)connect the transport after the delay.
    Dial { delay: Duration },
    /// Observable phase transition for the connection-status UI.
    PhaseChanged(ConnectionPhase),
}

/// Identity negotiated during the handshake; kept across reconnects so a
/// dropped link can renegotiate network info without starting over.
#[derive(Clone, Debug, Default)]
struct NegotiatedLink {
    remote_descriptor: String,
    remote_candidates: Vec<String>,
}

pub struct ConnectionSession {
    local: PeerId,
    remote: PeerId,
    cfg: RetryConfig,
    phase: ConnectionPhase,
    /// Opaque sdp-like blob describing this end, offered to the remote.
    local_descriptor: String,
    negotiated: Option<NegotiatedLink>,
    /// True once the link has been `Connected`; selects the reconnect budget.
    was_connected: bool,
    dial_attempts: u32,
    next_seq: u64,
    last_delivered: u64,
    reorder: BTreeMap<u64, Envelope>,
    /// Application messages queued until the link is `Connected`.
    pending: VecDeque<Message>,
}

impl ConnectionSession {
    pub fn new(local: PeerId, remote: PeerId, local_descriptor: String, cfg: RetryConfig) -> Self {
        ConnectionSession {
            local,
            remote,
            cfg,
            phase: ConnectionPhase::Idle,
            local_descriptor,
            negotiated: None,
            was_connected: false,
            dial_attempts: 0,
            next_seq: 1,
            last_delivered: 0,
            reorder: BTreeMap::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Begin the handshake. The initiator sends the offer; by convention the
    /// peer with the lower id initiates so both ends agree on roles.
    pub fn start(&mut self, initiator: bool) -> Vec<SessionCommand> {
        let mut cmds = Vec::new();
        self.set_phase(ConnectionPhase::Initiating, &mut cmds);
        if initiator {
            self.set_phase(ConnectionPhase::Offering, &mut cmds);
            cmds.push(SessionCommand::SendSignal(Message::Offer {
                sdp: self.local_descriptor.clone(),
            }));
            self.set_phase(ConnectionPhase::WaitingForAnswer, &mut cmds);
        } else {
            self.set_phase(ConnectionPhase::WaitingForOffer, &mut cmds);
        }
        cmds
    }

    /// Consume one signaling message from the remote peer.
    pub fn on_signal(&mut self, message: &Message) -> Result<Vec<SessionCommand>, ConnectionError> {
        let mut cmds = Vec::new();
        match (message, self.phase) {
            (Message::Offer { sdp }, ConnectionPhase::WaitingForOffer) => {
                self.negotiated = Some(NegotiatedLink {
                    remote_descriptor: sdp.clone(),
                    remote_candidates: Vec::new(),
                });
                self.set_phase(ConnectionPhase::Answering, &mut cmds);
                cmds.push(SessionCommand::SendSignal(Message::Answer {
                    sdp: self.local_descriptor.clone(),
                }));
                self.enter_network_info(&mut cmds);
            }
            (Message::Answer { sdp }, ConnectionPhase::WaitingForAnswer) => {
                self.negotiated = Some(NegotiatedLink {
                    remote_descriptor: sdp.clone(),
                    remote_candidates: Vec::new(),
                });
                self.enter_network_info(&mut cmds);
            }
            (Message::NetworkCandidate { candidate }, ConnectionPhase::ExchangingNetworkInfo) => {
                if let Some(link) = self.negotiated.as_mut() {
                    link.remote_candidates.push(candidate.clone());
                }
                self.set_phase(ConnectionPhase::Connecting, &mut cmds);
                cmds.push(SessionCommand::Dial {
                    delay: Duration::ZERO,
                });
            }
            // Late or repeated candidates refresh the cache without a phase
            // change.
            (Message::NetworkCandidate { candidate }, ConnectionPhase::Connecting)
            | (Message::NetworkCandidate { candidate }, ConnectionPhase::Connected)
            | (Message::NetworkCandidate { candidate }, ConnectionPhase::Reconnecting) => {
                if let Some(link) = self.negotiated.as_mut() {
                    link.remote_candidates.push(candidate.clone());
                }
            }
            (msg, phase) => {
                return Err(ConnectionError::UnexpectedSignal {
                    signal: msg.name(),
                    phase,
                });
            }
        }
        Ok(cmds)
    }

    /// The driver's transport came up.
    pub fn on_transport_open(&mut self) -> Vec<SessionCommand> {
        let mut cmds = Vec::new();
        match self.phase {
            ConnectionPhase::Connecting | ConnectionPhase::Reconnecting => {
                info!("[peer {}] link to {} established", self.local, self.remote);
                self.dial_attempts = 0;
                self.was_connected = true;
                self.set_phase(ConnectionPhase::Connected, &mut cmds);
                while let Some(message) = self.pending.pop_front() {
                    let env = self.envelope(message);
                    cmds.push(SessionCommand::Transmit(env));
                }
            }
            phase => {
                debug!(
                    "[peer {}] spurious transport open towards {} in {:?}",
                    self.local, self.remote, phase
                );
            }
        }
        cmds
    }

    /// The driver's transport failed or dropped.
    pub fn on_transport_lost(&mut self, reason: &str) -> Vec<SessionCommand> {
        let mut cmds = Vec::new();
        match self.phase {
            ConnectionPhase::Connected => {
                warn!(
                    "[peer {}] link to {} dropped: {}",
                    self.local, self.remote, reason
                );
                // Renegotiate network info with the cached identity rather
                // than redoing the whole handshake.
                self.dial_attempts = 0;
                self.set_phase(ConnectionPhase::Reconnecting, &mut cmds);
                self.retry(&mut cmds);
            }
            ConnectionPhase::Connecting
            | ConnectionPhase::ExchangingNetworkInfo
            | ConnectionPhase::Reconnecting => {
                self.retry(&mut cmds);
            }
            phase => {
                debug!(
                    "[peer {}] transport loss towards {} ignored in {:?}",
                    self.local, self.remote, phase
                );
            }
        }
        cmds
    }

    /// Queue an application message. Fails fast once the link is terminal.
    pub fn send(&mut self, message: Message) -> Result<Vec<SessionCommand>, ConnectionError> {
        match self.phase {
            ConnectionPhase::Failed | ConnectionPhase::Disconnected => {
                Err(ConnectionError::LinkClosed(self.remote))
            }
            ConnectionPhase::Connected => {
                let env = self.envelope(message);
                Ok(vec![SessionCommand::Transmit(env)])
            }
            _ => {
                self.pending.push_back(message);
                Ok(Vec::new())
            }
        }
    }

    /// Accept a received envelope. Retransmitted duplicates are suppressed by
    /// the per-sender sequence number and delivery is strictly in send order;
    /// out-of-order arrivals wait in a reorder buffer.
    pub fn accept(&mut self, env: Envelope) -> Vec<SessionCommand> {
        let mut cmds = Vec::new();
        if env.seq <= self.last_delivered {
            debug!(
                "[peer {}] dropped duplicate seq {} from {}",
                self.local, env.seq, self.remote
            );
            return cmds;
        }
        self.reorder.insert(env.seq, env);
        while let Some(env) = self.reorder.remove(&(self.last_delivered + 1)) {
            self.last_delivered = env.seq;
            cmds.push(SessionCommand::Deliver(env));
        }
        cmds
    }

    /// Local voluntary close; terminal for this attempt.
    pub fn close(&mut self) -> Vec<SessionCommand> {
        let mut cmds = Vec::new();
        if self.phase != ConnectionPhase::Disconnected {
            self.set_phase(ConnectionPhase::Disconnected, &mut cmds);
            self.pending.clear();
        }
        cmds
    }

    fn envelope(&mut self, message: Message) -> Envelope {
        let env = Envelope {
            sender: self.local,
            seq: self.next_seq,
            message,
        };
        self.next_seq += 1;
        env
    }

    fn enter_network_info(&mut self, cmds: &mut Vec<SessionCommand>) {
        self.set_phase(ConnectionPhase::ExchangingNetworkInfo, cmds);
        cmds.push(SessionCommand::SendSignal(Message::NetworkCandidate {
            candidate: self.local_descriptor.clone(),
        }));
    }

    /// One more dial attempt against whichever budget applies, or `Failed`.
    fn retry(&mut self, cmds: &mut Vec<SessionCommand>) {
        let budget = if self.was_connected {
            self.cfg.reconnect_attempts
        } else {
            self.cfg.handshake_attempts
        };
        if self.dial_attempts >= budget {
            warn!(
                "[peer {}] giving up on {} after {} attempts",
                self.local, self.remote, self.dial_attempts
            );
            self.set_phase(ConnectionPhase::Failed, cmds);
            return;
        }
        let delay = self.cfg.backoff_delay(self.dial_attempts);
        self.dial_attempts += 1;
        if self.phase != ConnectionPhase::Connecting {
            // Reconnects revisit the network-info step with the cached
            // identity before dialing again.
            if self.phase == ConnectionPhase::Reconnecting {
                self.enter_network_info(cmds);
            }
            self.set_phase(ConnectionPhase::Connecting, cmds);
        }
        cmds.push(SessionCommand::Dial { delay });
    }

    fn set_phase(&mut self, phase: ConnectionPhase, cmds: &mut Vec<SessionCommand>) {
        if self.phase != phase {
            debug!(
                "[peer {}] link to {}: {:?} -> {:?}",
                self.local, self.remote, self.phase, phase
            );
            self.phase = phase;
            cmds.push(SessionCommand::PhaseChanged(phase));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (ConnectionSession, ConnectionSession) {
        let a = ConnectionSession::new(
            PeerId(1),
            PeerId(2),
            "ws://a".into(),
            RetryConfig::default(),
        );
        let b = ConnectionSession::new(
            PeerId(2),
            PeerId(1),
            "ws://b".into(),
            RetryConfig::default(),
        );
        (a, b)
    }

    fn signals(cmds: &[SessionCommand]) -> Vec<Message> {
        cmds.iter()
            .filter_map(|c| match c {
                SessionCommand::SendSignal(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    fn wants_dial(cmds: &[SessionCommand]) -> bool {
        cmds.iter()
            .any(|c| matches!(c, SessionCommand::Dial { .. }))
    }

    /// Run the full offer/answer/candidate exchange between two sessions.
    fn handshake(a: &mut ConnectionSession, b: &mut ConnectionSession) {
        let mut from_a = signals(&a.start(true));
        let mut from_b = signals(&b.start(false));
        while !from_a.is_empty() || !from_b.is_empty() {
            let to_b = std::mem::take(&mut from_a);
            for m in to_b {
                from_b.extend(signals(&b.on_signal(&m).unwrap()));
            }
            let to_a = std::mem::take(&mut from_b);
            for m in to_a {
                from_a.extend(signals(&a.on_signal(&m).unwrap()));
            }
        }
        assert_eq!(a.phase(), ConnectionPhase::Connecting);
        assert_eq!(b.phase(), ConnectionPhase::Connecting);
        a.on_transport_open();
        b.on_transport_open();
    }

    #[test]
    fn handshake_reaches_connected_on_both_ends() {
        let (mut a, mut b) = pair();
        handshake(&mut a, &mut b);
        assert_eq!(a.phase(), ConnectionPhase::Connected);
        assert_eq!(b.phase(), ConnectionPhase::Connected);
    }

    #[test]
    fn initiator_emits_offer_first() {
        let (mut a, _) = pair();
        let cmds = a.start(true);
        assert!(matches!(
            signals(&cmds).first(),
            Some(Message::Offer { .. })
        ));
        assert_eq!(a.phase(), ConnectionPhase::WaitingForAnswer);
    }

    #[test]
    fn unexpected_signal_is_an_error_without_state_change() {
        let (mut a, _) = pair();
        a.start(true);
        let err = a
            .on_signal(&Message::Offer { sdp: "x".into() })
            .unwrap_err();
        assert!(matches!(err, ConnectionError::UnexpectedSignal { .. }));
        assert_eq!(a.phase(), ConnectionPhase::WaitingForAnswer);
    }

    #[test]
    fn messages_queued_before_connect_flush_in_order() {
        let (mut a, mut b) = pair();
        a.start(true);
        a.send(Message::SeedContribution { value: 7 }).unwrap();
        a.send(Message::SeedContribution { value: 8 }).unwrap();

        // Finish the handshake.
        let offer = Message::Offer {
            sdp: "ws://a".into(),
        };
        let mut b_out = signals(&b.start(false));
        b_out.extend(signals(&b.on_signal(&offer).unwrap()));
        for m in b_out {
            let _ = a.on_signal(&m);
        }
        let cmds = a.on_transport_open();
        let seqs: Vec<u64> = cmds
            .iter()
            .filter_map(|c| match c {
                SessionCommand::Transmit(env) => Some(env.seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn send_fails_fast_after_close() {
        let (mut a, _) = pair();
        a.start(true);
        a.close();
        let err = a
            .send(Message::SeedContribution { value: 1 })
            .unwrap_err();
        assert_eq!(err, ConnectionError::LinkClosed(PeerId(2)));
    }

    #[test]
    fn duplicates_are_suppressed_and_order_restored() {
        let (mut a, mut b) = pair();
        handshake(&mut a, &mut b);

        let env = |seq| Envelope {
            sender: PeerId(2),
            seq,
            message: Message::SeedContribution { value: seq },
        };

        // Arrivals: 2 (early), 1, 1 (dup), 3.
        assert!(a.accept(env(2)).is_empty());
        let delivered: Vec<u64> = a
            .accept(env(1))
            .iter()
            .filter_map(|c| match c {
                SessionCommand::Deliver(e) => Some(e.seq),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![1, 2]);
        assert!(a.accept(env(1)).is_empty());
        assert_eq!(a.accept(env(3)).len(), 1);
    }

    #[test]
    fn dropped_link_reconnects_then_fails_after_budget() {
        let cfg = RetryConfig {
            reconnect_attempts: 2,
            ..RetryConfig::default()
        };
        let mut a = ConnectionSession::new(PeerId(1), PeerId(2), "ws://a".into(), cfg);
        let mut b = ConnectionSession::new(PeerId(2), PeerId(1), "ws://b".into(), cfg);
        handshake(&mut a, &mut b);

        let cmds = a.on_transport_lost("read error");
        assert!(cmds.contains(&SessionCommand::PhaseChanged(
            ConnectionPhase::Reconnecting
        )));
        assert!(wants_dial(&cmds));
        assert_eq!(a.phase(), ConnectionPhase::Connecting);

        // Each re-dial fails; budget of 2 exhausts and the link dies.
        assert!(wants_dial(&a.on_transport_lost("refused")));
        let last = a.on_transport_lost("refused");
        assert!(last.contains(&SessionCommand::PhaseChanged(ConnectionPhase::Failed)));
        assert_eq!(a.phase(), ConnectionPhase::Failed);
    }

    #[test]
    fn handshake_dial_failures_exhaust_their_own_budget() {
        let cfg = RetryConfig {
            handshake_attempts: 1,
            ..RetryConfig::default()
        };
        let mut a = ConnectionSession::new(PeerId(1), PeerId(2), "ws://a".into(), cfg);
        a.start(true);
        a.on_signal(&Message::Answer { sdp: "b".into() }).unwrap();
        a.on_signal(&Message::NetworkCandidate {
            candidate: "c".into(),
        })
        .unwrap();
        assert_eq!(a.phase(), ConnectionPhase::Connecting);
        assert!(wants_dial(&a.on_transport_lost("refused")));
        let cmds = a.on_transport_lost("refused");
        assert!(cmds.contains(&SessionCommand::PhaseChanged(ConnectionPhase::Failed)));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.backoff_delay(0), Duration::from_millis(250));
        assert_eq!(cfg.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(cfg.backoff_delay(2), Duration::from_secs(1));
        assert_eq!(cfg.backoff_delay(10), Duration::from_secs(4));
        assert_eq!(cfg.backoff_delay(40), Duration::from_secs(4));
    }

    #[test]
    fn reconnect_renegotiates_network_info() {
        let (mut a, mut b) = pair();
        handshake(&mut a, &mut b);
        let cmds = a.on_transport_lost("reset");
        let resent = signals(&cmds);
        assert!(resent
            .iter()
            .any(|m| matches!(m, Message::NetworkCandidate { .. })));
        // Identity survives: no new Offer.
        assert!(!resent.iter().any(|m| matches!(m, Message::Offer { .. })));
    }
}
