//! Control protocol (C7): OSC-style messages dispatched over TCP or UDP on
//! a single configurable port. [`dispatch`] itself is transport-agnostic,
//! the same shape as the teacher's WebSocket message handler: a pure
//! `match`-based function taking a shared handle and a decoded message and
//! returning the notifications it produced. [`tcp`]/[`udp`] own the actual
//! sockets and route those notifications to arbitrary connections.

pub mod dispatch;
pub mod tcp;
pub mod udp;

pub use dispatch::{
    dispatch, DispatchContext, Outbound, ReplyTarget, RequestSource, PROTOCOL_MAJOR, PROTOCOL_MINOR,
    PROTOCOL_PATCH,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::manager::Manager;
use crate::session::{ClientId, SubscriberTarget};

/// Shared handle the TCP and UDP listeners both hold: the manager, the
/// dispatch context, the UDP socket (shared because UDP notifications can
/// originate from a TCP-triggered event), and the live TCP connection
/// registry used to route a notification addressed to another connection.
pub struct ControlState {
    pub manager: Arc<Manager>,
    pub ctx: DispatchContext,
    pub udp_socket: Arc<UdpSocket>,
    connections: Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
    connection_owner: Mutex<HashMap<u64, ClientId>>,
    next_connection_id: AtomicU64,
}

impl ControlState {
    pub fn new(manager: Arc<Manager>, ctx: DispatchContext, udp_socket: Arc<UdpSocket>) -> Self {
        Self {
            manager,
            ctx,
            udp_socket,
            connections: Mutex::new(HashMap::new()),
            connection_owner: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(0),
        }
    }

    fn register_connection(&self, sender: mpsc::UnboundedSender<Vec<u8>>) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().insert(id, sender);
        id
    }

    fn deregister_connection(&self, connection_id: u64) -> Option<ClientId> {
        self.connections.lock().remove(&connection_id);
        self.connection_owner.lock().remove(&connection_id)
    }

    fn note_registered(&self, connection_id: u64, client_id: ClientId) {
        self.connection_owner.lock().insert(connection_id, client_id);
    }

    /// Send one notification to its target, whichever transport that is.
    pub async fn route(&self, outbound: Outbound) {
        match outbound.target {
            SubscriberTarget::Tcp(connection_id) => {
                let sender = self.connections.lock().get(&connection_id).cloned();
                if let Some(sender) = sender {
                    let framed = sam_protocol::osc::frame(&outbound.message.encode());
                    let _ = sender.send(framed);
                }
            }
            SubscriberTarget::Udp(addr) => {
                let _ = self.udp_socket.send_to(&outbound.message.encode(), addr).await;
            }
        }
    }

    pub async fn route_all(&self, outbounds: Vec<Outbound>) {
        for outbound in outbounds {
            self.route(outbound).await;
        }
    }
}
