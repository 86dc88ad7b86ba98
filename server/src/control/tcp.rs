//! TCP control listener: one task per connection, SLIP-framed OSC messages
//! in both directions. A TCP connection is authoritative for the session
//! it registers; losing it unregisters that session (§6).

use std::net::IpAddr;
use std::sync::Arc;

use sam_protocol::osc::{split_frames, OscMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{dispatch, ControlState, RequestSource};

pub async fn run(listener: TcpListener, state: Arc<ControlState>) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "control TCP accept failed");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            handle_connection(socket, peer.ip(), state).await;
        });
    }
}

async fn handle_connection(socket: TcpStream, peer_ip: IpAddr, state: Arc<ControlState>) {
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let connection_id = state.register_connection(tx);
    info!(connection_id, %peer_ip, "control TCP connection opened");

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        let (frames, consumed) = split_frames(&buf);
        buf.drain(..consumed);

        for payload in frames {
            match OscMessage::decode(&payload) {
                Ok(msg) => {
                    let outbounds = dispatch(
                        &state.manager,
                        &msg,
                        RequestSource::Tcp(connection_id),
                        peer_ip,
                        &state.ctx,
                    );
                    note_registration(&state, connection_id, &outbounds);
                    state.route_all(outbounds).await;
                }
                Err(e) => debug!(connection_id, error = %e, "malformed control message"),
            }
        }
    }

    if let Some(client_id) = state.deregister_connection(connection_id) {
        info!(connection_id, client_id, "control TCP connection closed, unregistering session");
        let unregister = OscMessage::new("/sam/app/unregister").with_int(client_id);
        let outbounds = dispatch(&state.manager, &unregister, RequestSource::Tcp(connection_id), peer_ip, &state.ctx);
        state.route_all(outbounds).await;
    }
    writer_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::dispatch::{DispatchContext, PROTOCOL_MAJOR, PROTOCOL_MINOR, PROTOCOL_PATCH};
    use crate::manager::Manager;
    use crate::routing::InProcessRouter;
    use crate::rtp::ReceiverConfig;
    use sam_protocol::osc::OscMessage;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn manager() -> Manager {
        Manager::new(4, vec![0, 1], vec![], 1.0, 0.0, 1000.0, 4800, Arc::new(InProcessRouter::new()))
    }

    fn ctx() -> DispatchContext {
        DispatchContext {
            sample_rate: 48_000,
            buffer_size: 256,
            rtp_base_port: 50_000,
            verify_patch_version: true,
            receiver_config: ReceiverConfig { queue_depth_samples: 1024, skew_threshold: 256, stats_interval_samples: 48_000 },
            delay_max_samples: 4096,
        }
    }

    /// S6: a TCP connection closing without an explicit unregister still
    /// tears the session down, notifying UI subscribers and the renderer,
    /// exactly as `handle_connection`'s disconnect branch does.
    #[test]
    fn disconnect_without_unregister_still_notifies_ui_and_renderer() {
        let mgr = manager();
        let c = ctx();
        let loopback = Ipv4Addr::LOCALHOST.into();

        let register = OscMessage::new("/sam/app/register")
            .with_string("client")
            .with_int(2)
            .with_int(0).with_int(0).with_int(0).with_int(0).with_int(0)
            .with_int(0)
            .with_int(0)
            .with_int(256)
            .with_int(4)
            .with_int(PROTOCOL_MAJOR)
            .with_int(PROTOCOL_MINOR)
            .with_int(PROTOCOL_PATCH)
            .with_int(0);
        dispatch(&mgr, &register, RequestSource::Tcp(1), loopback, &c);

        let ui_register = OscMessage::new("/sam/ui/register").with_int(9200);
        let ui_addr = "127.0.0.1:9200".parse().unwrap();
        dispatch(&mgr, &ui_register, RequestSource::Udp(ui_addr), loopback, &c);

        let render_register = OscMessage::new("/sam/render/register")
            .with_int(PROTOCOL_MAJOR).with_int(PROTOCOL_MINOR).with_int(PROTOCOL_PATCH).with_int(9300);
        let render_addr = "127.0.0.1:9300".parse().unwrap();
        dispatch(&mgr, &render_register, RequestSource::Udp(render_addr), loopback, &c);

        // Connection 1 drops without an explicit /sam/app/unregister.
        let unregister = OscMessage::new("/sam/app/unregister").with_int(0);
        let out = dispatch(&mgr, &unregister, RequestSource::Tcp(1), loopback, &c);

        assert!(out.iter().any(|o| o.message.address == "/sam/app/unregistered"
            && o.target == crate::session::SubscriberTarget::Udp(ui_addr)));
        assert!(out.iter().any(|o| o.message.address == "/sam/stream/remove"
            && o.target == crate::session::SubscriberTarget::Udp(render_addr)));

        // The audio thread's next block is what actually removes the slot.
        assert_eq!(mgr.reap_closed(), vec![0]);
        assert!(mgr.active_ids().is_empty());
    }
}

/// Watch for a successful `/sam/app/regconfirm` addressed back to this
/// connection so a later disconnect knows which session to tear down.
fn note_registration(state: &ControlState, connection_id: u64, outbounds: &[dispatch::Outbound]) {
    for out in outbounds {
        if out.message.address == "/sam/app/regconfirm" {
            if let Some(id) = out.message.args.first().and_then(|a| a.as_int()) {
                state.note_registered(connection_id, id);
            }
        }
    }
}
