//! Per-client network task (C3 arrival path): one task per registered
//! session, owning the UDP sockets at `rtp_base + 4*id` for exactly as long
//! as the session is active. Feeds decoded packets into the session's
//! playout queue and receiver statistics; the audio thread only ever reads
//! through [`crate::manager::Manager::with_session_mut`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sam_protocol::rtcp::SenderReport;
use sam_protocol::rtp::RtpHeader;
use tokio::net::UdpSocket;
use tokio::time::interval;
use tracing::{trace, warn};

use crate::audio::SharedClock;
use crate::manager::Manager;
use crate::rtp::queue::QueuedPacket;
use crate::session::ClientId;

/// Offsets within the four-port block reserved for one client (§6): audio
/// RTP in, RTCP for this stream (receiver reports out, sender reports in),
/// a reserved offset, and the return path for a stream the manager might
/// one day send back to the client. Nothing in this system sends RTP back
/// to a client yet, so the return-path socket is bound only to reserve the
/// port and otherwise sits idle.
const OFFSET_RTP: u16 = 0;
const OFFSET_RTCP: u16 = 1;
const OFFSET_SENDER_RETURN: u16 = 3;

/// Run one client's arrival path until the task is aborted by the manager
/// housekeeping loop on unregistration.
pub async fn run(
    manager: Arc<Manager>,
    client_id: ClientId,
    rtp_base_port: u16,
    sample_rate: u32,
    stats_interval_samples: u32,
    clock: SharedClock,
) {
    let base = rtp_base_port.wrapping_add((4 * client_id) as u16);

    let rtp_socket = match UdpSocket::bind(("0.0.0.0", base + OFFSET_RTP)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(client_id, error = %e, "failed to bind client RTP socket");
            return;
        }
    };
    let rtcp_socket = match UdpSocket::bind(("0.0.0.0", base + OFFSET_RTCP)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(client_id, error = %e, "failed to bind client RTCP socket");
            return;
        }
    };
    let _sender_return = UdpSocket::bind(("0.0.0.0", base + OFFSET_SENDER_RETURN)).await;

    let mut rtp_peer: Option<SocketAddr> = None;
    let mut rtp_buf = vec![0u8; 65_536];
    let mut rtcp_buf = [0u8; SenderReport::WIRE_LEN];
    let report_period = Duration::from_secs_f64(stats_interval_samples as f64 / sample_rate.max(1) as f64);
    let mut report_timer = interval(report_period.max(Duration::from_millis(1)));

    loop {
        tokio::select! {
            result = rtp_socket.recv_from(&mut rtp_buf) => {
                match result {
                    Ok((n, peer)) => {
                        rtp_peer = Some(peer);
                        handle_rtp_datagram(&manager, client_id, &rtp_buf[..n], clock());
                    }
                    Err(e) => warn!(client_id, error = %e, "RTP recv failed"),
                }
            }
            result = rtcp_socket.recv_from(&mut rtcp_buf) => {
                match result {
                    Ok((n, _peer)) => handle_sender_report(&manager, client_id, &rtcp_buf[..n], clock()),
                    Err(e) => warn!(client_id, error = %e, "RTCP recv failed"),
                }
            }
            _ = report_timer.tick() => {
                if let Some(peer) = rtp_peer {
                    send_receiver_report(&manager, client_id, sample_rate, clock(), &rtcp_socket, peer).await;
                }
            }
        }
    }
}

fn handle_rtp_datagram(manager: &Manager, client_id: ClientId, data: &[u8], arrival_time: u64) {
    let header = match RtpHeader::decode(data) {
        Ok(h) => h,
        Err(e) => {
            trace!(client_id, error = %e, "malformed RTP header");
            return;
        }
    };
    let payload = &data[sam_protocol::rtp::RTP_HEADER_LEN..];
    let arrival_u32 = arrival_time as u32;

    let outcome = manager.with_session_mut(client_id, |session| {
        session.receiver_stats.set_play_clock(arrival_u32);
        session.receiver_stats.on_packet(&header, payload, arrival_u32)
    });

    match outcome {
        Ok(Ok(arrival)) => {
            if let Some(packet) = arrival.packet {
                let _ = manager.with_session(client_id, |s| {
                    s.queue.insert(fixup_channels(packet, s.channels));
                });
            }
        }
        Ok(Err(reason)) => trace!(client_id, ?reason, "dropped RTP packet"),
        Err(e) => warn!(client_id, error = %e, "RTP packet for unknown session"),
    }
}

/// `ReceiverStats::on_packet` always stamps `channels: 1`; fix it up to the
/// session's negotiated channel count before the packet reaches the queue.
fn fixup_channels(mut packet: QueuedPacket, channels: usize) -> QueuedPacket {
    packet.channels = channels;
    packet
}

fn handle_sender_report(manager: &Manager, client_id: ClientId, data: &[u8], now: u64) {
    let report = match SenderReport::decode(data) {
        Ok(r) => r,
        Err(e) => {
            trace!(client_id, error = %e, "malformed RTCP sender report");
            return;
        }
    };
    let _ = manager.with_session_mut(client_id, |s| {
        s.receiver_stats.on_sender_report(report.ntp_time, now);
    });
}

async fn send_receiver_report(
    manager: &Manager,
    client_id: ClientId,
    sample_rate: u32,
    now: u64,
    rtcp_socket: &UdpSocket,
    peer: SocketAddr,
) {
    let report = manager.with_session_mut(client_id, |s| {
        let ssrc = client_id as u32;
        s.receiver_stats.build_receiver_report(ssrc, now, sample_rate)
    });
    let Ok(report) = report else { return };

    let mut buf = Vec::with_capacity(sam_protocol::rtcp::ReceiverReport::WIRE_LEN);
    report.encode(&mut buf);
    if let Err(e) = rtcp_socket.send_to(&buf, peer).await {
        warn!(client_id, error = %e, "failed to send RTCP receiver report");
    }
}
