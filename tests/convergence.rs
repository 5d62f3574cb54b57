// Three engines wired together through in-memory channels, driven to
// convergence without timers or sockets. The harness plays both roles of the
// wire bridge: it wraps outgoing messages in sequenced envelopes and delivers
// them in per-sender order.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use triowhist::api::{GameEvent, Intent};
use triowhist::connection::ConnectionPhase;
use triowhist::events::{EventReceiver, PeerMap, SessionInput};
use triowhist::protocol::{Envelope, Message};
use triowhist::rules;
use triowhist::scoring;
use triowhist::session::{RuleConfig, Session};
use triowhist::state::GamePhase;
use triowhist::types::{DeckVariant, PeerId};

const IDS: [PeerId; 3] = [PeerId(1), PeerId(2), PeerId(3)];

struct Table {
    engines: Vec<Session>,
    events: Vec<EventReceiver>,
    /// `taps[i]` holds, per destination peer, the queue of messages engine
    /// `i` has broadcast towards it.
    taps: Vec<Vec<(PeerId, mpsc::UnboundedReceiver<Message>)>>,
    seqs: BTreeMap<(PeerId, PeerId), u64>,
}

impl Table {
    fn new(seed_parts: [u64; 3]) -> Self {
        let mut engines = Vec::new();
        let mut events = Vec::new();
        let mut taps = Vec::new();
        for (i, &id) in IDS.iter().enumerate() {
            let mut links = PeerMap::new();
            let mut tap = Vec::new();
            for &other in IDS.iter().filter(|&&p| p != id) {
                let (tx, rx) = mpsc::unbounded_channel();
                links.add_link(other, tx);
                tap.push((other, rx));
            }
            let cfg = RuleConfig {
                display_name: format!("peer-{}", i + 1),
                seed_part: Some(seed_parts[i]),
                ..RuleConfig::default()
            };
            let (engine, _handle, event_rx) = Session::new(id, cfg, links);
            engines.push(engine);
            events.push(event_rx);
            taps.push(tap);
        }
        Table {
            engines,
            events,
            taps,
            seqs: BTreeMap::new(),
        }
    }

    fn index_of(peer: PeerId) -> usize {
        IDS.iter().position(|&p| p == peer).expect("known peer")
    }

    fn phase(&self, i: usize) -> GamePhase {
        self.engines[i].state().phase
    }

    /// Bring every link up; each engine announces itself to the other two.
    fn connect(&mut self) {
        for (i, &id) in IDS.iter().enumerate() {
            for &other in IDS.iter().filter(|&&p| p != id) {
                self.engines[i].handle_input(SessionInput::Link {
                    peer: other,
                    phase: ConnectionPhase::Connected,
                });
            }
        }
        self.pump();
    }

    /// Drain one sender's queue towards one destination, preserving the
    /// sender's order. Returns how many messages moved.
    fn deliver(&mut self, sender: PeerId, dest: PeerId) -> usize {
        let si = Self::index_of(sender);
        let t = self.taps[si]
            .iter()
            .position(|(d, _)| *d == dest)
            .expect("taps cover both remote peers");
        let mut moved = 0;
        loop {
            let message = match self.taps[si][t].1.try_recv() {
                Ok(m) => m,
                Err(_) => return moved,
            };
            let seq = self.seqs.entry((sender, dest)).or_insert(0);
            *seq += 1;
            let env = Envelope {
                sender,
                seq: *seq,
                message,
            };
            self.engines[Self::index_of(dest)].handle_input(SessionInput::FromPeer(env));
            moved += 1;
        }
    }

    /// Deliver queued messages until the table goes quiet. Per-sender order
    /// is preserved; cross-sender interleaving is arbitrary, as on the wire.
    fn pump(&mut self) {
        loop {
            let mut moved = 0;
            for sender in IDS {
                for dest in IDS {
                    if sender != dest {
                        moved += self.deliver(sender, dest);
                    }
                }
            }
            if moved == 0 {
                return;
            }
        }
    }

    /// Queue an intent on one engine without delivering its broadcasts, so a
    /// test can interleave two peers' actions by hand.
    fn send_intent(&mut self, peer: PeerId, intent: Intent) {
        self.engines[Self::index_of(peer)].handle_input(SessionInput::Intent(intent));
    }

    fn intent(&mut self, peer: PeerId, intent: Intent) {
        self.send_intent(peer, intent);
        self.pump();
    }

    fn assert_converged(&self) {
        let reference = self.engines[0].state();
        for engine in &self.engines[1..] {
            assert_eq!(engine.state(), reference, "states diverged");
        }
        let hash = reference.integrity_hash();
        for engine in &self.engines[1..] {
            assert_eq!(engine.state().integrity_hash(), hash);
        }
    }

    /// Mirror the trump-choice rule to find who must act, then act for them.
    fn choose_trump_if_needed(&mut self) {
        if self.phase(0) != GamePhase::ChoosingTrump {
            return;
        }
        let state = self.engines[0].state().clone();
        let marker = state.variant.marker_rank();
        let mut turner = state.dealer.expect("dealer is fixed");
        let mut chosen = None;
        for card in &state.trump_stock {
            if card.rank == marker {
                chosen = Some((turner, *card));
                break;
            }
            turner = scoring::next_seat(&state.seating, turner);
        }
        let (chooser, card) = chosen.expect("still choosing implies a marker was turned");
        self.intent(chooser, Intent::ChooseTrump(card));
        assert_ne!(self.phase(0), GamePhase::ChoosingTrump);
    }

    fn bid_if_needed(&mut self) {
        let mut guard = 0;
        while self.phase(0) == GamePhase::Bidding {
            let state = self.engines[0].state().clone();
            let bidder = state.turn.expect("someone's turn to bid");
            let hand_size = rules::hand_size_for_round(state.round, state.variant);
            let others: Vec<u8> = state.bids.values().copied().collect();
            let is_last = bidder == state.dealer.expect("dealer is fixed");
            let bid = (0..=hand_size)
                .find(|&b| {
                    rules::validate_bid(b, hand_size, &others, is_last, state.round, state.variant)
                        .is_ok()
                })
                .expect("some bid is always legal");
            self.intent(bidder, Intent::ProposeBid(bid));
            guard += 1;
            assert!(guard <= 3, "bidding did not terminate");
        }
    }

    fn discard_if_needed(&mut self) {
        let mut guard = 0;
        while self.phase(0) == GamePhase::Discarding {
            let state = self.engines[0].state().clone();
            let (&peer, &owed) = state
                .owed_discards
                .iter()
                .next()
                .expect("discarding implies cards owed");
            let cards: Vec<_> = state.hand(peer)[..owed as usize].to_vec();
            self.intent(peer, Intent::Discard(cards));
            guard += 1;
            assert!(guard <= 3, "discarding did not terminate");
        }
    }

    fn play_out_tricks(&mut self) {
        let mut guard = 0;
        while self.phase(0) == GamePhase::PlayingTricks {
            let state = self.engines[0].state().clone();
            assert!(state.card_conservation_holds());
            let player = state.turn.expect("someone's turn to play");
            let legal = rules::legal_plays(state.hand(player), state.led_suit());
            self.intent(player, Intent::PlayCard(legal[0]));
            guard += 1;
            assert!(guard <= 60, "trick play did not terminate");
        }
    }

    fn play_round(&mut self) {
        self.choose_trump_if_needed();
        self.bid_if_needed();
        self.discard_if_needed();
        self.play_out_tricks();
        self.assert_converged();
    }
}

#[test]
fn seed_exchange_combines_contributions_and_deals_identically() {
    let mut table = Table::new([1, 2, 3]);
    table.connect();

    // 1 + 2 + 3 under wrapping addition.
    for engine in &table.engines {
        assert_eq!(engine.state().game_seed, Some(6));
        assert_eq!(engine.state().round, 1);
        for &id in &IDS {
            assert_eq!(engine.state().hand(id).len(), 1, "round 1 deals one card");
        }
        assert_eq!(engine.state().trump_stock.len(), 4);
    }
    table.assert_converged();
}

#[test]
fn identities_and_seating_are_agreed() {
    let mut table = Table::new([10, 20, 30]);
    table.connect();
    let state = table.engines[2].state();
    assert_eq!(state.seating, IDS.to_vec());
    assert_eq!(state.names.len(), 3);
    assert_eq!(state.names[&PeerId(1)], "peer-1");
}

#[test]
fn first_round_plays_to_a_score() {
    let mut table = Table::new([5, 6, 7]);
    table.connect();
    table.play_round();

    let state = table.engines[0].state();
    assert_eq!(state.records.len(), 1);
    assert_eq!(state.round, 2, "the table rolled into round 2");
    let record = &state.records[0];
    let made: u8 = record.made.values().sum();
    assert_eq!(made as usize, 1, "round 1 has exactly one trick");
    // Exactly one peer took the trick; scores moved for everyone.
    assert_eq!(state.scores.len(), 3);
}

#[test]
fn dealer_rotates_every_round() {
    let mut table = Table::new([5, 6, 7]);
    table.connect();
    let first = table.engines[0].state().dealer;
    table.play_round();
    let second = table.engines[0].state().dealer;
    assert_ne!(first, second);
    let seating = table.engines[0].state().seating.clone();
    assert_eq!(
        second,
        Some(scoring::next_dealer(&seating, first.expect("dealer set")))
    );
}

#[test]
fn full_game_converges_to_the_same_winner() {
    let mut table = Table::new([11, 22, 33]);
    table.connect();

    let mut guard = 0;
    while table.phase(0) != GamePhase::GameOver {
        table.play_round();
        guard += 1;
        assert!(guard <= 16, "the game did not finish");
    }
    table.assert_converged();

    let state = table.engines[0].state();
    // Short pack: targets 1,1,1,2,..,9; the game ends when the cap is dealt.
    assert_eq!(state.records.len(), 11);
    assert!(state.hands.values().all(Vec::is_empty));

    // Every engine announced the same winner.
    let mut winners = Vec::new();
    for events in &mut table.events {
        while let Ok(event) = events.try_recv() {
            if let GameEvent::GameOver { winner, .. } = event {
                winners.push(winner);
            }
        }
    }
    assert_eq!(winners.len(), 3);
    assert!(winners.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn handicap_rounds_deal_extra_cards_and_discard_back() {
    let mut table = Table::new([11, 22, 33]);
    table.connect();
    for _ in 0..3 {
        table.play_round();
    }
    // Round 4: free bidding, and trailing peers owe discards unless all
    // three scores are tied.
    assert_eq!(table.engines[0].state().round, 4);
    let owed = table.engines[0].state().owed_discards.clone();
    let scores = table.engines[0].state().scores.clone();
    let distinct: std::collections::BTreeSet<i32> = scores.values().copied().collect();
    if distinct.len() > 1 {
        assert!(!owed.is_empty(), "trailing peers owe discards");
        for (&peer, &extra) in &owed {
            let hand_size = rules::hand_size_for_round(4, DeckVariant::Short32);
            assert_eq!(
                table.engines[0].state().hand(peer).len(),
                hand_size as usize + extra as usize
            );
        }
    }
    table.play_round();
    assert!(table.engines[0].state().records.len() == 4);
    table.assert_converged();
}

#[test]
fn mid_round_disconnect_aborts_the_session() {
    let mut table = Table::new([5, 6, 7]);
    table.connect();
    table.choose_trump_if_needed();
    table.bid_if_needed();
    assert_eq!(table.phase(0), GamePhase::PlayingTricks);

    table.engines[0].handle_input(SessionInput::Link {
        peer: IDS[1],
        phase: ConnectionPhase::Failed,
    });
    assert_eq!(table.phase(0), GamePhase::Aborted);

    let mut saw_abort = false;
    while let Ok(event) = table.events[0].try_recv() {
        if matches!(event, GameEvent::Aborted { .. }) {
            saw_abort = true;
        }
    }
    assert!(saw_abort, "the abort was surfaced as an event");
}

fn remote_env(sender: PeerId, seq: u64, message: Message) -> SessionInput {
    SessionInput::FromPeer(Envelope {
        sender,
        seq,
        message,
    })
}

#[test]
fn bids_overtaking_each_other_still_commit_everywhere() {
    let mut table = Table::new([5, 6, 7]);
    table.connect();
    table.choose_trump_if_needed();
    assert_eq!(table.phase(0), GamePhase::Bidding);

    let state = table.engines[0].state().clone();
    let dealer = state.dealer.expect("dealer is fixed");
    let first = scoring::next_seat(&state.seating, dealer);
    let second = scoring::next_seat(&state.seating, first);

    // Round 1 hand size is 1, so 0 is a legal bid for the first two seats.
    table.send_intent(first, Intent::ProposeBid(0));
    table.deliver(first, second);
    table.send_intent(second, Intent::ProposeBid(0));
    // The dealer hears the second bid before the first.
    table.deliver(second, dealer);
    table.deliver(first, dealer);

    let di = Table::index_of(dealer);
    assert_eq!(
        table.engines[di].state().bids.len(),
        2,
        "the overtaking bid was kept, not dropped"
    );
    table.pump();

    table.intent(dealer, Intent::ProposeBid(0));
    for i in 0..3 {
        assert_eq!(table.phase(i), GamePhase::PlayingTricks);
    }
    table.assert_converged();
}

#[test]
fn plays_overtaking_each_other_still_commit_everywhere() {
    let mut table = Table::new([5, 6, 7]);
    table.connect();
    table.choose_trump_if_needed();
    table.bid_if_needed();
    assert_eq!(table.phase(0), GamePhase::PlayingTricks);

    let state = table.engines[0].state().clone();
    let leader = state.turn.expect("someone leads the first trick");
    let second = scoring::next_seat(&state.seating, leader);
    let third = scoring::next_seat(&state.seating, second);

    // Round 1 hands hold one card each. The third peer hears the second
    // play before the lead.
    let lead = state.hand(leader)[0];
    table.send_intent(leader, Intent::PlayCard(lead));
    table.deliver(leader, second);
    let follow = table.engines[Table::index_of(second)].state().hand(second)[0];
    table.send_intent(second, Intent::PlayCard(follow));
    table.deliver(second, third);

    let ti = Table::index_of(third);
    assert!(
        table.engines[ti].state().table.is_empty(),
        "the overtaking play waits for the lead"
    );
    table.deliver(leader, third);
    assert_eq!(
        table.engines[ti].state().table.len(),
        2,
        "the held play was committed once the lead arrived"
    );

    let last = table.engines[ti].state().hand(third)[0];
    table.intent(third, Intent::PlayCard(last));

    for engine in &table.engines {
        assert_eq!(engine.state().records.len(), 1);
    }
    table.assert_converged();
}

#[test]
fn simultaneous_discards_leave_the_table_in_agreement() {
    let mut table = Table::new([11, 22, 33]);
    table.connect();

    let mut exercised = false;
    let mut guard = 0;
    while table.phase(0) != GamePhase::GameOver {
        table.choose_trump_if_needed();
        table.bid_if_needed();
        if table.phase(0) == GamePhase::Discarding {
            let owed = table.engines[0].state().owed_discards.clone();
            if owed.len() == 2 {
                // Both owing peers discard before either hears the other.
                for (&peer, &extra) in &owed {
                    let hand = table.engines[Table::index_of(peer)]
                        .state()
                        .hand(peer)
                        .to_vec();
                    table.send_intent(peer, Intent::Discard(hand[..extra as usize].to_vec()));
                }
                table.pump();
                assert_eq!(table.phase(0), GamePhase::PlayingTricks);
                table.assert_converged();
                exercised = true;
            } else {
                table.discard_if_needed();
            }
        }
        table.play_out_tricks();
        table.assert_converged();
        guard += 1;
        assert!(guard <= 16, "the game did not finish");
    }
    assert!(exercised, "no round put two peers in discard at once");
}

#[test]
fn acknowledgements_for_a_later_gate_wait_for_that_gate() {
    let mut links = PeerMap::new();
    let (tx2, _keep2) = mpsc::unbounded_channel();
    let (tx3, _keep3) = mpsc::unbounded_channel();
    links.add_link(PeerId(2), tx2);
    links.add_link(PeerId(3), tx3);
    let cfg = RuleConfig {
        display_name: "local".to_string(),
        seed_part: Some(1),
        integrity_check: false,
        ..RuleConfig::default()
    };
    let (mut engine, _handle, _events) = Session::new(PeerId(1), cfg, links);
    for peer in [PeerId(2), PeerId(3)] {
        engine.handle_input(SessionInput::Link {
            peer,
            phase: ConnectionPhase::Connected,
        });
    }
    engine.handle_input(remote_env(
        PeerId(2),
        1,
        Message::IdentityAnnounce {
            peer: PeerId(2),
            display_name: "p2".to_string(),
        },
    ));
    engine.handle_input(remote_env(
        PeerId(3),
        1,
        Message::IdentityAnnounce {
            peer: PeerId(3),
            display_name: "p3".to_string(),
        },
    ));

    // Peer 2 runs ahead: it clears the seed gate and acknowledges the setup
    // gate before peer 3's first acknowledgement arrives.
    engine.handle_input(remote_env(
        PeerId(2),
        2,
        Message::PhaseAck {
            phase: GamePhase::ExchangingSeed,
            state_hash: None,
        },
    ));
    engine.handle_input(remote_env(
        PeerId(2),
        3,
        Message::SeedContribution { value: 2 },
    ));
    engine.handle_input(remote_env(
        PeerId(2),
        4,
        Message::PhaseAck {
            phase: GamePhase::SetupRound,
            state_hash: None,
        },
    ));
    engine.handle_input(remote_env(
        PeerId(3),
        2,
        Message::PhaseAck {
            phase: GamePhase::ExchangingSeed,
            state_hash: None,
        },
    ));
    engine.handle_input(remote_env(
        PeerId(3),
        3,
        Message::SeedContribution { value: 3 },
    ));
    engine.handle_input(remote_env(
        PeerId(3),
        4,
        Message::PhaseAck {
            phase: GamePhase::SetupRound,
            state_hash: None,
        },
    ));

    // Both gates cleared: the engine dealt round 1 and now waits at the
    // trump gate, instead of stalling on the acknowledgement it consumed
    // too early.
    assert_eq!(engine.state().game_seed, Some(6));
    assert_eq!(engine.state().round, 1);
    assert_eq!(engine.state().phase, GamePhase::Dealing);
}

#[test]
fn link_flaps_mid_game_do_not_replay_identity_noise() {
    let mut table = Table::new([5, 6, 7]);
    table.connect();
    table.choose_trump_if_needed();
    assert_eq!(table.phase(0), GamePhase::Bidding);

    // The link to peer 2 flaps back up mid-game; the seated engine stays
    // quiet rather than re-announcing itself.
    table.engines[0].handle_input(SessionInput::Link {
        peer: IDS[1],
        phase: ConnectionPhase::Connected,
    });
    for (_, rx) in &mut table.taps[0] {
        assert!(rx.try_recv().is_err(), "a seated engine does not re-announce");
    }

    // A stray announcement from the reconnecting peer is dropped instead of
    // riding the stage buffers for the rest of the game.
    let before = table.engines[0].state().clone();
    let seq = {
        let s = table.seqs.entry((IDS[1], IDS[0])).or_insert(0);
        *s += 1;
        *s
    };
    table.engines[0].handle_input(remote_env(
        IDS[1],
        seq,
        Message::IdentityAnnounce {
            peer: IDS[1],
            display_name: "peer-2".to_string(),
        },
    ));
    assert_eq!(*table.engines[0].state(), before);

    table.bid_if_needed();
    table.play_out_tricks();
    table.assert_converged();
}

#[test]
fn intents_out_of_turn_are_rejected_without_state_change() {
    let mut table = Table::new([5, 6, 7]);
    table.connect();
    table.choose_trump_if_needed();

    let state = table.engines[0].state().clone();
    assert_eq!(state.phase, GamePhase::Bidding);
    let bidder = state.turn.expect("someone's turn");
    let intruder = IDS
        .iter()
        .copied()
        .find(|&p| p != bidder)
        .expect("two other peers");
    let before = table.engines[Table::index_of(intruder)].state().clone();
    table.intent(intruder, Intent::ProposeBid(0));
    assert_eq!(*table.engines[Table::index_of(intruder)].state(), before);

    let mut rejected = false;
    while let Ok(event) = table.events[Table::index_of(intruder)].try_recv() {
        if matches!(event, GameEvent::IntentRejected(_)) {
            rejected = true;
        }
    }
    assert!(rejected);
}
