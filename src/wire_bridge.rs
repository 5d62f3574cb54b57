// Drives one websocket per remote peer on behalf of the I/O-free connection
// sessions. The session decides what happens; this module executes its
// commands: writing frames, dialing with backoff, and forwarding delivered
// envelopes and link-phase changes into the engine's input queue.
//
// By convention the peer with the lower id dials; the other end accepts. The
// listener routes inbound sockets to the right link task using the `Hello`
// frame the dialer sends first.

use std::collections::{HashMap, VecDeque};

use futures_util::SinkExt;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite as tokio_ws2;
use tokio_ws2::tungstenite as ws2;
use unique_id::random::RandomGenerator;
use unique_id::Generator;

use crate::connection::{ConnectionPhase, ConnectionSession, RetryConfig, SessionCommand};
use crate::events::PeerMap;
use crate::protocol::{Envelope, Message};
use crate::session::SessionHandle;
use crate::types::PeerId;

type WsStream = tokio_ws2::WebSocketStream<tokio_ws2::MaybeTlsStream<TcpStream>>;

/// Address book entry for one remote peer.
#[derive(Clone, Debug)]
pub struct PeerSpec {
    pub id: PeerId,
    pub addr: String,
}

/// Everything that crosses a peer socket, as JSON text frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum WireFrame {
    /// First frame on a dialed socket: who is calling, with a token unique
    /// per connection attempt for the logs.
    Hello { peer: PeerId, token: i64 },
    /// Handshake signaling consumed by the connection session.
    Signal(Message),
    /// Sequenced application traffic.
    App(Envelope),
}

/// Start the listener and one link task per remote peer. Returns the map the
/// engine broadcasts through; everything else runs on spawned tasks.
pub fn start_links(
    local: PeerId,
    listen_addr: String,
    peers: Vec<PeerSpec>,
    handle: SessionHandle,
    retry: RetryConfig,
) -> PeerMap {
    let mut map = PeerMap::new();
    let mut inbound_routes: HashMap<PeerId, mpsc::UnboundedSender<WsStream>> = HashMap::new();

    for spec in peers {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (sock_tx, sock_rx) = mpsc::unbounded_channel();
        map.add_link(spec.id, msg_tx);

        let initiator = local < spec.id;
        if !initiator {
            inbound_routes.insert(spec.id, sock_tx);
        }
        tokio::spawn(run_link(
            local,
            spec,
            initiator,
            retry,
            msg_rx,
            sock_rx,
            handle.clone(),
        ));
    }

    tokio::spawn(run_listener(local, listen_addr, inbound_routes));
    map
}

// Accepts websockets and hands each one to the link task named in its Hello
// frame.
async fn run_listener(
    local: PeerId,
    addr: String,
    routes: HashMap<PeerId, mpsc::UnboundedSender<WsStream>>,
) {
    if routes.is_empty() {
        return;
    }
    let listener = tokio::net::TcpListener::bind(addr.clone())
        .await
        .expect("failed to bind the peer listener");
    info!("[peer {}] listening on {}", local, addr);

    loop {
        let Ok((stream, remote_addr)) = listener.accept().await else {
            error!("[peer {}] couldn't accept a TCP connection", local);
            continue;
        };
        let Ok(mut websocket) =
            tokio_ws2::accept_async(tokio_ws2::MaybeTlsStream::Plain(stream)).await
        else {
            error!(
                "[peer {}] websocket handshake with {} failed",
                local, remote_addr
            );
            continue;
        };

        // The dialer identifies itself before anything else flows.
        let Some(Ok(ws2::Message::Text(json))) = websocket.next().await else {
            warn!("[peer {}] {} hung up before hello", local, remote_addr);
            continue;
        };
        let Ok(WireFrame::Hello { peer, token }) = serde_json::from_str(&json) else {
            warn!("[peer {}] malformed hello from {}", local, remote_addr);
            continue;
        };
        info!(
            "[peer {}] inbound socket from peer {} at {} (attempt {})",
            local, peer, remote_addr, token
        );

        let Some(route) = routes.get(&peer) else {
            warn!("[peer {}] no link expects peer {}", local, peer);
            continue;
        };
        if route.send(websocket).is_err() {
            debug!("[peer {}] link task for peer {} is gone", local, peer);
        }
    }
}

// One task per remote peer: owns the connection session, the socket and the
// outgoing frame queue, and marshals deliveries into the engine.
async fn run_link(
    local: PeerId,
    spec: PeerSpec,
    initiator: bool,
    retry: RetryConfig,
    mut msg_rx: mpsc::UnboundedReceiver<Message>,
    mut sock_rx: mpsc::UnboundedReceiver<WsStream>,
    handle: SessionHandle,
) {
    let remote = spec.id;
    let mut session = ConnectionSession::new(local, remote, spec.addr.clone(), retry);
    let mut socket: Option<WsStream> = None;
    let mut outbox: VecDeque<WireFrame> = VecDeque::new();
    let mut redial_at: Option<tokio::time::Instant> = None;

    let mut cmds = session.start(initiator);
    if initiator {
        // The very first dial isn't a session decision; kick it off directly.
        redial_at = Some(tokio::time::Instant::now());
    }
    apply(&mut cmds, &mut outbox, &mut redial_at, remote, &handle);

    loop {
        let inbound = async {
            match socket.as_mut() {
                Some(ws) => ws.next().await,
                None => std::future::pending().await,
            }
        };
        let redial = async {
            match redial_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            outgoing = msg_rx.recv() => {
                let Some(message) = outgoing else {
                    debug!("[peer {}] engine dropped the link to {}", local, remote);
                    let mut cmds = session.close();
                    apply(&mut cmds, &mut outbox, &mut redial_at, remote, &handle);
                    return;
                };
                match session.send(message) {
                    Ok(mut cmds) => {
                        apply(&mut cmds, &mut outbox, &mut redial_at, remote, &handle)
                    }
                    Err(err) => warn!("[peer {}] can't send to {}: {}", local, remote, err),
                }
            }

            adopted = sock_rx.recv() => {
                let Some(ws) = adopted else { return };
                debug!("[peer {}] adopted inbound socket from {}", local, remote);
                socket = Some(ws);
                if matches!(
                    session.phase(),
                    ConnectionPhase::Connecting | ConnectionPhase::Reconnecting
                ) {
                    let mut cmds = session.on_transport_open();
                    apply(&mut cmds, &mut outbox, &mut redial_at, remote, &handle);
                }
            }

            result = inbound => {
                match result {
                    Some(Ok(ws2::Message::Text(json))) => {
                        let Ok(frame) = serde_json::from_str::<WireFrame>(&json) else {
                            error!("[peer {}] malformed frame from {}", local, remote);
                            continue;
                        };
                        let mut cmds = match frame {
                            WireFrame::Hello { peer, token } => {
                                debug!(
                                    "[peer {}] hello from {} (attempt {})",
                                    local, peer, token
                                );
                                continue;
                            }
                            WireFrame::Signal(message) => match session.on_signal(&message) {
                                Ok(cmds) => cmds,
                                Err(err) => {
                                    error!("[peer {}] bad signal from {}: {}", local, remote, err);
                                    continue;
                                }
                            },
                            WireFrame::App(env) => session.accept(env),
                        };
                        apply(&mut cmds, &mut outbox, &mut redial_at, remote, &handle);
                    }
                    Some(Ok(_)) => {
                        // Pings and binary frames are not part of the protocol.
                        debug!("[peer {}] ignoring non-text frame from {}", local, remote);
                    }
                    Some(Err(err)) => {
                        socket = None;
                        let mut cmds = session.on_transport_lost(&err.to_string());
                        apply(&mut cmds, &mut outbox, &mut redial_at, remote, &handle);
                    }
                    None => {
                        socket = None;
                        let mut cmds = session.on_transport_lost("socket closed");
                        apply(&mut cmds, &mut outbox, &mut redial_at, remote, &handle);
                    }
                }
            }

            _ = redial => {
                redial_at = None;
                if socket.is_some() {
                    // The transport is already up; this dial is the session
                    // confirming it wants to use it.
                    let mut cmds = session.on_transport_open();
                    apply(&mut cmds, &mut outbox, &mut redial_at, remote, &handle);
                } else if initiator {
                    match tokio_ws2::connect_async(format!("ws://{}", spec.addr)).await {
                        Ok((mut ws, _)) => {
                            info!("[peer {}] dialed {} at {}", local, remote, spec.addr);
                            let hello = WireFrame::Hello {
                                peer: local,
                                token: RandomGenerator::default().next_id() as i64,
                            };
                            let json = serde_json::to_string(&hello)
                                .expect("wire frames serialize");
                            if ws.send(ws2::Message::Text(json)).await.is_err() {
                                let mut cmds = session.on_transport_lost("hello failed");
                                apply(&mut cmds, &mut outbox, &mut redial_at, remote, &handle);
                                continue;
                            }
                            socket = Some(ws);
                            if matches!(
                                session.phase(),
                                ConnectionPhase::Connecting | ConnectionPhase::Reconnecting
                            ) {
                                let mut cmds = session.on_transport_open();
                                apply(&mut cmds, &mut outbox, &mut redial_at, remote, &handle);
                            }
                        }
                        Err(err) => {
                            let mut cmds = session.on_transport_lost(&err.to_string());
                            apply(&mut cmds, &mut outbox, &mut redial_at, remote, &handle);
                        }
                    }
                }
                // The accepting end waits for the dialer to come back.
            }
        }

        if session.phase().is_terminal() {
            // Drain anything the apply above queued, then let the task die;
            // the engine already saw the terminal phase change.
            let _ = flush(&mut socket, &mut outbox, local, remote).await;
            return;
        }
        if let Err(reason) = flush(&mut socket, &mut outbox, local, remote).await {
            let mut cmds = session.on_transport_lost(&reason);
            apply(&mut cmds, &mut outbox, &mut redial_at, remote, &handle);
        }
    }
}

// Execute the non-I/O parts of a command batch; frame writes and dial sleeps
// are deferred to the link loop.
fn apply(
    cmds: &mut Vec<SessionCommand>,
    outbox: &mut VecDeque<WireFrame>,
    redial_at: &mut Option<tokio::time::Instant>,
    remote: PeerId,
    handle: &SessionHandle,
) {
    for cmd in cmds.drain(..) {
        match cmd {
            SessionCommand::SendSignal(message) => {
                outbox.push_back(WireFrame::Signal(message));
            }
            SessionCommand::Transmit(env) => {
                outbox.push_back(WireFrame::App(env));
            }
            SessionCommand::Deliver(env) => {
                if handle.on_peer_message(env).is_err() {
                    debug!("engine input queue closed; dropping delivery");
                }
            }
            SessionCommand::Dial { delay } => {
                *redial_at = Some(tokio::time::Instant::now() + delay);
            }
            SessionCommand::PhaseChanged(phase) => {
                if handle.link_update(remote, phase).is_err() {
                    debug!("engine input queue closed; dropping phase change");
                }
            }
        }
    }
}

// Write queued frames out, leaving the queue intact from the first failure so
// a reconnected socket can resume.
async fn flush(
    socket: &mut Option<WsStream>,
    outbox: &mut VecDeque<WireFrame>,
    local: PeerId,
    remote: PeerId,
) -> Result<(), String> {
    let Some(ws) = socket.as_mut() else {
        return Ok(());
    };
    while let Some(frame) = outbox.front() {
        let json = serde_json::to_string(frame).expect("wire frames serialize");
        if let Err(err) = ws.send(ws2::Message::Text(json)).await {
            error!("[peer {}] write to {} failed: {}", local, remote, err);
            *socket = None;
            return Err(err.to_string());
        }
        outbox.pop_front();
    }
    Ok(())
}
