// Headless peer: joins the table, runs the engine and logs game events. The
// presentation layer connects through the library's `SessionHandle`; this
// binary exists to stand a peer up and watch a table converge.
//
// Try: triowhist 1 alice 127.0.0.1:9101 2=127.0.0.1:9102 3=127.0.0.1:9103

use std::env;

use log::{error, info};

use triowhist::connection::RetryConfig;
use triowhist::events::PeerMap;
use triowhist::session::{RuleConfig, Session};
use triowhist::types::PeerId;
use triowhist::wire_bridge::{self, PeerSpec};
use triowhist::GameEvent;

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() != 5 {
        eprintln!(
            "usage: triowhist <local-id> <display-name> <listen-addr> \
             <peer-id>=<addr> <peer-id>=<addr>"
        );
        std::process::exit(2);
    }

    let local = PeerId(args[0].parse().expect("local id must be an integer"));
    let cfg = RuleConfig {
        display_name: args[1].clone(),
        ..RuleConfig::default()
    };
    let listen_addr = args[2].clone();
    let peers: Vec<PeerSpec> = args[3..]
        .iter()
        .map(|spec| {
            let (id, addr) = spec
                .split_once('=')
                .expect("peer spec must look like <id>=<addr>");
            PeerSpec {
                id: PeerId(id.parse().expect("peer id must be an integer")),
                addr: addr.to_string(),
            }
        })
        .collect();

    // The bridge needs the engine's handle to deliver inbound traffic, so
    // the engine is built first and the links swapped in after.
    let (mut session, handle, mut events) = Session::new(local, cfg, PeerMap::new());
    let links = wire_bridge::start_links(
        local,
        listen_addr,
        peers,
        handle,
        RetryConfig::default(),
    );
    session.set_links(links);
    tokio::spawn(session.run());

    while let Some(event) = events.recv().await {
        match event {
            GameEvent::Aborted { reason } => {
                error!("session aborted: {}", reason);
                break;
            }
            GameEvent::GameOver { winner, scores } => {
                info!("game over: winner {} with scores {:?}", winner, scores);
                break;
            }
            event => info!("{:?}", event),
        }
    }
}
