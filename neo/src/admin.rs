//! One-shot admin commands (§6): connects to the primary master, issues a
//! single [`neo_admin::AdminClient`] call, prints the answer, and exits.
//! Unlike the master/storage roles this isn't a long-lived process — the
//! background poll thread it starts is left to die with the process once
//! the command completes.

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use neo_base::{err, Result};
use neo_dispatch::Dispatcher;
use neo_proto::{Frame, NodeRole, Packet, RequestIdentification, Uuid};
use neo_wire::EventLoop;

use crate::config::AdminCommand;

fn random_uuid() -> Uuid {
    use rand::Rng;
    let mut entropy = [0u8; 15];
    rand::thread_rng().fill(&mut entropy);
    Uuid::new(NodeRole::Admin, entropy)
}

/// Forwards every inbound frame straight to the dispatcher; admin has no
/// connection-phase state machine of its own.
struct AdminTransport {
    dispatcher: Dispatcher,
}

impl neo_wire::Transport for AdminTransport {
    fn on_accept(&mut self, _token: mio::Token, _peer: SocketAddr) {}
    fn on_connect(&mut self, _token: mio::Token) {}
    fn on_frame(&mut self, _token: mio::Token, frame: Frame) {
        self.dispatcher.deliver(frame.id, frame);
    }
    fn on_closed(&mut self, token: mio::Token) {
        self.dispatcher.fail_connection(token);
    }
    fn on_error(&mut self, token: mio::Token, error: neo_base::Error) {
        tracing::warn!(?token, %error, "admin connection error");
        self.dispatcher.fail_connection(token);
    }
}

pub fn run_admin(cluster_name: String, master: SocketAddr, command: AdminCommand) -> Result<()> {
    let mut event_loop = EventLoop::client_only()?;
    let token = event_loop.connect(master)?;
    let handle = event_loop.handle(token).ok_or_else(|| err("connection handle unavailable immediately after connect"))?;

    let dispatcher = Dispatcher::new();
    let poll_dispatcher = dispatcher.clone();
    thread::spawn(move || {
        let mut sink = AdminTransport { dispatcher: poll_dispatcher };
        loop {
            if event_loop.turn(Some(Duration::from_millis(200)), &mut sink).is_err() {
                break;
            }
        }
    });

    handle.send(&Frame::new(
        0,
        Packet::RequestIdentification(RequestIdentification { uuid: random_uuid(), address: None, cluster_name }),
    ))?;

    let client = neo_admin::AdminClient::new(handle, dispatcher, Duration::from_secs(5));

    match command {
        AdminCommand::Nodes => {
            let nodes = client.get_node_list()?;
            for node in nodes {
                println!("{:?}\t{:?}\t{:?}\t{:?}", node.uuid, node.role, node.state, node.address);
            }
        }
        AdminCommand::Partitions => {
            let table = client.get_partition_rows()?;
            for (partition, cells) in table.cells.iter().enumerate() {
                println!("{partition}: {cells:?}");
            }
        }
        AdminCommand::ClusterState => {
            let state = client.get_cluster_state()?;
            println!("{state:?}");
        }
        AdminCommand::Primary => {
            let primary = client.get_primary()?;
            println!("{primary:?}");
        }
    }
    Ok(())
}
