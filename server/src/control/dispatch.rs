//! The OSC address dispatcher: one pure function mapping a decoded
//! message plus its origin to the manager state changes it causes and the
//! notifications that result. Transport-agnostic; [`super::tcp`] and
//! [`super::udp`] decode bytes into [`OscMessage`]s and push the returned
//! [`Outbound`]s back out over the right socket.

use std::net::{IpAddr, SocketAddr};

use sam_protocol::osc::{OscArg, OscMessage};
use tracing::debug;

use crate::error::{SamError, WireErrorCode};
use crate::manager::Manager;
use crate::rtp::ReceiverConfig;
use crate::session::{ClientId, ClientSession, Parameter, Position, SubscriberTarget};

pub const PROTOCOL_MAJOR: i32 = 1;
pub const PROTOCOL_MINOR: i32 = 0;
pub const PROTOCOL_PATCH: i32 = 0;

const GLOBAL_ID: ClientId = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestSource {
    Tcp(u64),
    Udp(SocketAddr),
}

pub type ReplyTarget = SubscriberTarget;

#[derive(Debug, Clone)]
pub struct Outbound {
    pub target: ReplyTarget,
    pub message: OscMessage,
}

fn outbound(target: ReplyTarget, message: OscMessage) -> Outbound {
    Outbound { target, message }
}

/// The settings dispatch needs beyond what the manager already tracks:
/// registration defaults and the version-handshake policy.
pub struct DispatchContext {
    pub sample_rate: u32,
    pub buffer_size: usize,
    pub rtp_base_port: u16,
    pub verify_patch_version: bool,
    pub receiver_config: ReceiverConfig,
    pub delay_max_samples: usize,
}

fn int(msg: &OscMessage, index: usize) -> i32 {
    msg.args.get(index).and_then(OscArg::as_int).unwrap_or(0)
}

fn float(msg: &OscMessage, index: usize) -> f32 {
    msg.args.get(index).and_then(OscArg::as_float).unwrap_or(0.0)
}

fn string(msg: &OscMessage, index: usize) -> String {
    msg.args.get(index).and_then(OscArg::as_str).unwrap_or_default().to_string()
}

/// A request's reply address. TCP requests always reply on the connection
/// they arrived on; UDP requests without a reply-port argument get no
/// reply at all (per the control-protocol contract).
fn reply_target(source: RequestSource, reply_port: i32, peer_ip: IpAddr) -> Option<ReplyTarget> {
    match source {
        RequestSource::Tcp(id) => Some(SubscriberTarget::Tcp(id)),
        RequestSource::Udp(_) => {
            if reply_port == 0 {
                None
            } else {
                Some(SubscriberTarget::Udp(SocketAddr::new(peer_ip, reply_port as u16)))
            }
        }
    }
}

fn version_ok(ctx: &DispatchContext, major: i32, minor: i32, patch: i32) -> bool {
    major == PROTOCOL_MAJOR
        && minor == PROTOCOL_MINOR
        && (!ctx.verify_patch_version || patch == PROTOCOL_PATCH)
}

fn error_code(err: &SamError) -> WireErrorCode {
    match err {
        SamError::RequestDenied(code) => *code,
        SamError::NoFreeOutput => WireErrorCode::NoFreeOutput,
        SamError::InvalidId(_) => WireErrorCode::InvalidId,
        SamError::InvalidType(_) => WireErrorCode::InvalidType,
        _ => WireErrorCode::Default,
    }
}

fn stream_add_message(manager: &Manager, id: ClientId) -> Option<OscMessage> {
    manager
        .with_session(id, |s| {
            let mut msg = OscMessage::new("/sam/stream/add")
                .with_int(s.id)
                .with_int(s.rendering_type)
                .with_int(s.preset)
                .with_int(s.channel_assignments.len() as i32);
            for channel in &s.channel_assignments {
                msg = msg.with_int(*channel as i32);
            }
            msg
        })
        .ok()
}

fn val_message(param: Parameter, session: &ClientSession, sample_rate: u32) -> OscMessage {
    match param {
        Parameter::Volume => OscMessage::new("/sam/val/volume").with_int(session.id).with_float(session.volume),
        Parameter::Mute => OscMessage::new("/sam/val/mute").with_int(session.id).with_int(session.mute as i32),
        Parameter::Solo => OscMessage::new("/sam/val/solo").with_int(session.id).with_int(session.solo as i32),
        Parameter::Delay => {
            let ms = session.delay_samples as f32 * 1000.0 / sample_rate.max(1) as f32;
            OscMessage::new("/sam/val/delay").with_int(session.id).with_float(ms)
        }
        Parameter::Position => OscMessage::new("/sam/val/position")
            .with_int(session.id)
            .with_int(session.position.x)
            .with_int(session.position.y)
            .with_int(session.position.width)
            .with_int(session.position.height)
            .with_int(session.position.depth),
        Parameter::RenderingType => OscMessage::new("/sam/val/type")
            .with_int(session.id)
            .with_int(session.rendering_type)
            .with_int(session.preset),
        Parameter::Meter => {
            let mut msg = OscMessage::new("/sam/val/meter")
                .with_int(session.id)
                .with_int(session.channels as i32);
            for ch in 0..session.channels {
                let snapshot = session.kernel.meter_snapshot(ch);
                msg = msg
                    .with_float(snapshot.rms_in)
                    .with_float(snapshot.peak_in)
                    .with_float(snapshot.rms_out)
                    .with_float(snapshot.peak_out);
            }
            msg
        }
    }
}

fn parse_param(name: &str) -> Option<Vec<Parameter>> {
    match name {
        "volume" => Some(vec![Parameter::Volume]),
        "mute" => Some(vec![Parameter::Mute]),
        "solo" => Some(vec![Parameter::Solo]),
        "delay" => Some(vec![Parameter::Delay]),
        "position" => Some(vec![Parameter::Position]),
        "type" => Some(vec![Parameter::RenderingType]),
        "meter" => Some(vec![Parameter::Meter]),
        "all" => Some(vec![
            Parameter::Volume,
            Parameter::Mute,
            Parameter::Solo,
            Parameter::Delay,
            Parameter::Position,
            Parameter::RenderingType,
            Parameter::Meter,
        ]),
        _ => None,
    }
}

/// Dispatch one decoded message, mutating `manager` as needed and
/// returning every notification it produced (possibly empty).
pub fn dispatch(
    manager: &Manager,
    msg: &OscMessage,
    source: RequestSource,
    peer_ip: IpAddr,
    ctx: &DispatchContext,
) -> Vec<Outbound> {
    match msg.address.as_str() {
        "/sam/app/register" => handle_register_app(manager, msg, source, peer_ip, ctx),
        "/sam/app/unregister" => handle_unregister_app(manager, msg),
        "/sam/render/register" => handle_register_renderer(manager, msg, source, peer_ip, ctx),
        "/sam/ui/register" => handle_register_ui(manager, msg, source, peer_ip, ctx),
        "/sam/set/volume" => handle_set(manager, msg, ctx, Parameter::Volume, |s, v| s.set_volume(v), float),
        "/sam/set/mute" => handle_set_bool(manager, msg, ctx, Parameter::Mute, |s, v| s.set_mute(v)),
        "/sam/set/solo" => handle_set_bool(manager, msg, ctx, Parameter::Solo, |s, v| s.set_solo(v)),
        "/sam/set/delay" => handle_set_delay(manager, msg, ctx),
        "/sam/set/position" => handle_set_position(manager, msg, ctx),
        "/sam/set/type" => handle_set_type(manager, msg, source, peer_ip, ctx),
        _ if msg.address.starts_with("/sam/subscribe/") => {
            handle_subscribe(manager, msg, source, peer_ip, ctx, true)
        }
        _ if msg.address.starts_with("/sam/unsubscribe/") => {
            handle_subscribe(manager, msg, source, peer_ip, ctx, false)
        }
        other => {
            debug!(address = other, "no handler for control address");
            Vec::new()
        }
    }
}

fn handle_register_app(
    manager: &Manager,
    msg: &OscMessage,
    source: RequestSource,
    peer_ip: IpAddr,
    ctx: &DispatchContext,
) -> Vec<Outbound> {
    let name = string(msg, 0);
    let channels = int(msg, 1).max(0) as usize;
    let position = Position {
        x: int(msg, 2),
        y: int(msg, 3),
        width: int(msg, 4),
        height: int(msg, 5),
        depth: int(msg, 6),
    };
    let rendering_type = int(msg, 7);
    let preset = int(msg, 8);
    let samples_per_packet = int(msg, 9).max(1) as u32;
    let (v_major, v_minor, v_patch) = (int(msg, 11), int(msg, 12), int(msg, 13));
    let reply_port = int(msg, 14);
    let target = reply_target(source, reply_port, peer_ip);

    if !version_ok(ctx, v_major, v_minor, v_patch) {
        return target
            .map(|t| {
                outbound(
                    t,
                    OscMessage::new("/sam/app/regdeny").with_int(WireErrorCode::VersionMismatch.as_i32()),
                )
            })
            .into_iter()
            .collect();
    }

    match manager.register(
        name,
        channels,
        position,
        rendering_type,
        preset,
        ctx.sample_rate,
        samples_per_packet,
        ctx.receiver_config,
        ctx.delay_max_samples,
    ) {
        Ok(id) => {
            let mut out = Vec::new();
            if let Some(t) = target {
                out.push(outbound(
                    t,
                    OscMessage::new("/sam/app/regconfirm")
                        .with_int(id)
                        .with_int(ctx.sample_rate as i32)
                        .with_int(ctx.buffer_size as i32)
                        .with_int(ctx.rtp_base_port as i32 + 4 * id),
                ));
            }
            for ui in manager.ui_subscribers() {
                out.push(outbound(ui, OscMessage::new("/sam/app/registered").with_int(id)));
            }
            if let Some(renderer) = manager.renderer() {
                if let Some(stream_add) = stream_add_message(manager, id) {
                    out.push(outbound(renderer.target, stream_add));
                }
            }
            out
        }
        Err(e) => target
            .map(|t| outbound(t, OscMessage::new("/sam/app/regdeny").with_int(error_code(&e).as_i32())))
            .into_iter()
            .collect(),
    }
}

fn handle_unregister_app(manager: &Manager, msg: &OscMessage) -> Vec<Outbound> {
    let id = int(msg, 0);
    if manager.begin_unregister(id).is_err() {
        return Vec::new();
    }
    teardown_notifications(manager, id)
}

/// Notifications for a session the audio thread has already reaped (its
/// slot is gone by the time this runs): every UI subscriber learns the id
/// unregistered, and the renderer, if any, is told to drop that stream.
/// Reused by both `handle_unregister_app` and the audio thread's reap path
/// so the two teardown routes fan out identically.
pub fn teardown_notifications(manager: &Manager, id: ClientId) -> Vec<Outbound> {
    let mut out = Vec::new();
    for ui in manager.ui_subscribers() {
        out.push(outbound(ui, OscMessage::new("/sam/app/unregistered").with_int(id)));
    }
    if let Some(renderer) = manager.renderer() {
        out.push(outbound(renderer.target, OscMessage::new("/sam/stream/remove").with_int(id)));
    }
    out
}

/// Meter notifications for every active session's meter subscribers, built
/// on the audio thread's publish tick and routed by an async task (the
/// audio thread itself never touches a socket).
pub fn meter_notifications(manager: &Manager, sample_rate: u32) -> Vec<Outbound> {
    let mut out = Vec::new();
    for id in manager.active_ids() {
        let _ = manager.with_session(id, |s| {
            for target in s.subscribers.list(Parameter::Meter) {
                out.push(outbound(*target, val_message(Parameter::Meter, s, sample_rate)));
            }
        });
    }
    out
}

fn handle_register_renderer(
    manager: &Manager,
    msg: &OscMessage,
    source: RequestSource,
    peer_ip: IpAddr,
    ctx: &DispatchContext,
) -> Vec<Outbound> {
    let (v_major, v_minor, v_patch) = (int(msg, 0), int(msg, 1), int(msg, 2));
    let reply_port = int(msg, 3);
    let Some(target) = reply_target(source, reply_port, peer_ip) else {
        return Vec::new();
    };

    if !version_ok(ctx, v_major, v_minor, v_patch) {
        return vec![outbound(
            target,
            OscMessage::new("/sam/render/regdeny").with_int(WireErrorCode::VersionMismatch.as_i32()),
        )];
    }

    manager.bind_renderer(target);
    let mut out = vec![outbound(target, OscMessage::new("/sam/render/regconfirm"))];
    for id in manager.active_ids() {
        if let Some(stream_add) = stream_add_message(manager, id) {
            out.push(outbound(target, stream_add));
        }
    }
    out
}

fn handle_register_ui(
    manager: &Manager,
    msg: &OscMessage,
    source: RequestSource,
    peer_ip: IpAddr,
    _ctx: &DispatchContext,
) -> Vec<Outbound> {
    let reply_port = int(msg, 0);
    let Some(target) = reply_target(source, reply_port, peer_ip) else {
        return Vec::new();
    };
    manager.subscribe_ui(target);

    let mut out = vec![outbound(
        target,
        OscMessage::new("/sam/ui/regconfirm")
            .with_int(manager.active_ids().len() as i32)
            .with_int(manager.global.mute() as i32)
            .with_float(manager.global.volume()),
    )];
    for id in manager.active_ids() {
        out.push(outbound(target, OscMessage::new("/sam/app/registered").with_int(id)));
    }
    out
}

fn handle_set(
    manager: &Manager,
    msg: &OscMessage,
    ctx: &DispatchContext,
    param: Parameter,
    apply: impl Fn(&mut ClientSession, f32),
    read_value: impl Fn(&OscMessage, usize) -> f32,
) -> Vec<Outbound> {
    let id = int(msg, 0);
    let value = read_value(msg, 1);
    if id == GLOBAL_ID {
        if matches!(param, Parameter::Volume) {
            manager.global.set_volume(value);
        }
        return Vec::new();
    }
    let result = manager.with_session_mut(id, |s| {
        apply(s, value);
        val_message(param, s, ctx.sample_rate)
    });
    fan_out_after_set(manager, id, param, result)
}

fn handle_set_bool(
    manager: &Manager,
    msg: &OscMessage,
    ctx: &DispatchContext,
    param: Parameter,
    apply: impl Fn(&mut ClientSession, bool),
) -> Vec<Outbound> {
    let id = int(msg, 0);
    let value = int(msg, 1) != 0;
    if id == GLOBAL_ID {
        if matches!(param, Parameter::Mute) {
            manager.global.set_mute(value);
        }
        return Vec::new();
    }
    let result = manager.with_session_mut(id, |s| {
        apply(s, value);
        val_message(param, s, ctx.sample_rate)
    });
    fan_out_after_set(manager, id, param, result)
}

fn handle_set_delay(manager: &Manager, msg: &OscMessage, ctx: &DispatchContext) -> Vec<Outbound> {
    let id = int(msg, 0);
    let delay_ms = float(msg, 1);
    if id == GLOBAL_ID {
        manager.global.set_delay_ms(delay_ms);
        return Vec::new();
    }
    let result = manager.with_session_mut(id, |s| {
        let samples = (delay_ms * ctx.sample_rate as f32 / 1000.0).round().max(0.0) as u32;
        s.set_delay_samples(samples, ctx.delay_max_samples as u32);
        val_message(Parameter::Delay, s, ctx.sample_rate)
    });
    fan_out_after_set(manager, id, Parameter::Delay, result)
}

fn handle_set_position(manager: &Manager, msg: &OscMessage, ctx: &DispatchContext) -> Vec<Outbound> {
    let id = int(msg, 0);
    let position = Position {
        x: int(msg, 1),
        y: int(msg, 2),
        width: int(msg, 3),
        height: int(msg, 4),
        depth: int(msg, 5),
    };
    let result = manager.with_session_mut(id, |s| {
        s.position = position;
        val_message(Parameter::Position, s, ctx.sample_rate)
    });
    fan_out_after_set(manager, id, Parameter::Position, result)
}

fn handle_set_type(
    manager: &Manager,
    msg: &OscMessage,
    source: RequestSource,
    peer_ip: IpAddr,
    ctx: &DispatchContext,
) -> Vec<Outbound> {
    let id = int(msg, 0);
    let rendering_type = int(msg, 1);
    let preset = int(msg, 2);
    let reply_port = int(msg, 3);
    let target = reply_target(source, reply_port, peer_ip);

    match manager.set_type(id, rendering_type, preset) {
        Ok(_assignments) => {
            let mut out: Vec<Outbound> = target
                .map(|t| outbound(t, OscMessage::new("/sam/type/confirm").with_int(id)))
                .into_iter()
                .collect();
            if let Some(renderer) = manager.renderer() {
                out.push(outbound(renderer.target, OscMessage::new("/sam/stream/remove").with_int(id)));
                if let Some(stream_add) = stream_add_message(manager, id) {
                    out.push(outbound(renderer.target, stream_add));
                }
            }
            if let Ok(val) = manager.with_session(id, |s| val_message(Parameter::RenderingType, s, ctx.sample_rate)) {
                if let Ok(targets) = manager.with_session(id, |s| s.subscribers.list(Parameter::RenderingType).to_vec()) {
                    for t in targets {
                        out.push(outbound(t, val.clone()));
                    }
                }
            }
            out
        }
        Err(e) => target
            .map(|t| outbound(t, OscMessage::new("/sam/type/deny").with_int(error_code(&e).as_i32())))
            .into_iter()
            .collect(),
    }
}

fn fan_out_after_set(
    manager: &Manager,
    id: ClientId,
    param: Parameter,
    result: Result<OscMessage, SamError>,
) -> Vec<Outbound> {
    let Ok(val) = result else { return Vec::new() };
    manager
        .with_session(id, |s| s.subscribers.list(param).to_vec())
        .unwrap_or_default()
        .into_iter()
        .map(|t| outbound(t, val.clone()))
        .collect()
}

fn handle_subscribe(
    manager: &Manager,
    msg: &OscMessage,
    source: RequestSource,
    peer_ip: IpAddr,
    ctx: &DispatchContext,
    subscribe: bool,
) -> Vec<Outbound> {
    let prefix_len = if subscribe { "/sam/subscribe/".len() } else { "/sam/unsubscribe/".len() };
    let Some(params) = parse_param(&msg.address[prefix_len..]) else {
        return Vec::new();
    };
    let id = int(msg, 0);
    let reply_port = int(msg, 1);
    let Some(target) = reply_target(source, reply_port, peer_ip) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for param in params {
        let _ = manager.with_session_mut(id, |s| {
            if subscribe {
                s.subscribers.subscribe(param, target);
            } else {
                s.subscribers.unsubscribe(param, target);
            }
        });
        if subscribe {
            if let Ok(val) = manager.with_session(id, |s| val_message(param, s, ctx.sample_rate)) {
                out.push(outbound(target, val));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::Manager;
    use crate::routing::InProcessRouter;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn manager() -> Manager {
        Manager::new(
            4,
            vec![0, 1],
            vec![],
            1.0,
            0.0,
            1000.0,
            4800,
            Arc::new(InProcessRouter::new()),
        )
    }

    fn ctx() -> DispatchContext {
        DispatchContext {
            sample_rate: 48_000,
            buffer_size: 256,
            rtp_base_port: 50_000,
            verify_patch_version: true,
            receiver_config: ReceiverConfig {
                queue_depth_samples: 1024,
                skew_threshold: 256,
                stats_interval_samples: 48_000,
            },
            delay_max_samples: 4096,
        }
    }

    fn register_message(reply_port: i32) -> OscMessage {
        OscMessage::new("/sam/app/register")
            .with_string("client")
            .with_int(2)
            .with_int(0)
            .with_int(0)
            .with_int(0)
            .with_int(0)
            .with_int(0)
            .with_int(0)
            .with_int(0)
            .with_int(256)
            .with_int(4)
            .with_int(PROTOCOL_MAJOR)
            .with_int(PROTOCOL_MINOR)
            .with_int(PROTOCOL_PATCH)
            .with_int(reply_port)
    }

    #[test]
    fn register_over_tcp_replies_with_regconfirm() {
        let mgr = manager();
        let msg = register_message(0);
        let out = dispatch(&mgr, &msg, RequestSource::Tcp(1), Ipv4Addr::LOCALHOST.into(), &ctx());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message.address, "/sam/app/regconfirm");
        assert_eq!(out[0].target, SubscriberTarget::Tcp(1));
    }

    #[test]
    fn register_with_version_mismatch_is_denied() {
        let mgr = manager();
        let mut msg = register_message(0);
        msg.args[11] = OscArg::Int(99);
        let out = dispatch(&mgr, &msg, RequestSource::Tcp(1), Ipv4Addr::LOCALHOST.into(), &ctx());
        assert_eq!(out[0].message.address, "/sam/app/regdeny");
    }

    #[test]
    fn set_volume_fans_out_to_subscribers() {
        let mgr = manager();
        let c = ctx();
        let msg = register_message(0);
        dispatch(&mgr, &msg, RequestSource::Tcp(1), Ipv4Addr::LOCALHOST.into(), &c);

        let subscribe_msg = OscMessage::new("/sam/subscribe/volume").with_int(0).with_int(9000);
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let subscribe_out = dispatch(&mgr, &subscribe_msg, RequestSource::Udp(addr), Ipv4Addr::LOCALHOST.into(), &c);
        assert_eq!(subscribe_out.len(), 1); // immediate publish

        let set_msg = OscMessage::new("/sam/set/volume").with_int(0).with_float(0.5);
        let set_out = dispatch(&mgr, &set_msg, RequestSource::Tcp(2), Ipv4Addr::LOCALHOST.into(), &c);
        assert_eq!(set_out.len(), 1);
        assert_eq!(set_out[0].target, SubscriberTarget::Udp(addr));
        assert_eq!(set_out[0].message.args[1].as_float(), Some(0.5));
    }

    #[test]
    fn udp_request_without_reply_port_gets_no_reply() {
        let mgr = manager();
        let msg = register_message(0);
        let out = dispatch(
            &mgr,
            &msg,
            RequestSource::Udp("127.0.0.1:1234".parse().unwrap()),
            Ipv4Addr::LOCALHOST.into(),
            &ctx(),
        );
        assert!(out.is_empty());
    }

    #[test]
    fn global_id_addresses_global_volume() {
        let mgr = manager();
        let msg = OscMessage::new("/sam/set/volume").with_int(-1).with_float(0.25);
        let out = dispatch(&mgr, &msg, RequestSource::Tcp(1), Ipv4Addr::LOCALHOST.into(), &ctx());
        assert!(out.is_empty());
        assert_eq!(mgr.global.volume(), 0.25);
    }

    #[test]
    fn renderer_registering_late_gets_stream_add_for_every_active_client() {
        let mgr = manager();
        let c = ctx();
        dispatch(&mgr, &register_message(0), RequestSource::Tcp(1), Ipv4Addr::LOCALHOST.into(), &c);
        dispatch(&mgr, &register_message(0), RequestSource::Tcp(2), Ipv4Addr::LOCALHOST.into(), &c);

        let render_msg = OscMessage::new("/sam/render/register")
            .with_int(PROTOCOL_MAJOR)
            .with_int(PROTOCOL_MINOR)
            .with_int(PROTOCOL_PATCH)
            .with_int(9100);
        let addr: SocketAddr = "127.0.0.1:9100".parse().unwrap();
        let out = dispatch(&mgr, &render_msg, RequestSource::Udp(addr), Ipv4Addr::LOCALHOST.into(), &c);

        let confirms = out.iter().filter(|o| o.message.address == "/sam/render/regconfirm").count();
        let stream_adds: Vec<_> = out.iter().filter(|o| o.message.address == "/sam/stream/add").collect();
        assert_eq!(confirms, 1);
        assert_eq!(stream_adds.len(), 2);
        assert!(stream_adds.iter().all(|o| o.target == SubscriberTarget::Udp(addr)));
        let ids: Vec<i32> = stream_adds.iter().map(|o| o.message.args[0].as_int().unwrap()).collect();
        assert_eq!(ids, vec![0, 1]);
    }
}
