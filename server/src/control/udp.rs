//! UDP control listener: one unframed message per datagram, used by UIs,
//! renderers, and clients that prefer fire-and-forget parameter sets.

use std::sync::Arc;

use sam_protocol::osc::OscMessage;
use tracing::debug;

use super::{dispatch, ControlState, RequestSource};

pub async fn run(state: Arc<ControlState>) {
    let mut buf = [0u8; 4096];
    loop {
        let (n, peer) = match state.udp_socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, "control UDP recv failed");
                continue;
            }
        };

        match OscMessage::decode(&buf[..n]) {
            Ok(msg) => {
                let outbounds = dispatch(&state.manager, &msg, RequestSource::Udp(peer), peer.ip(), &state.ctx);
                state.route_all(outbounds).await;
            }
            Err(e) => debug!(%peer, error = %e, "malformed control datagram"),
        }
    }
}
