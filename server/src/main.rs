//! Streaming Audio Manager server.
//!
//! Aggregates real-time audio streams from distributed clients over RTP,
//! mixes them per-client (gain, mute, solo, delay), routes the result to
//! physical outputs or a spatial renderer, and exposes an OSC-style
//! control protocol over TCP/UDP for clients, UIs, and the renderer.

mod audio;
mod config;
mod control;
mod engine;
mod error;
mod manager;
mod mixer;
mod routing;
mod rtp;
mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn, Level};

use crate::audio::{AudioInterface, CpalInterface, SharedClock, VirtualInterface};
use crate::config::ServerConfig;
use crate::control::{ControlState, DispatchContext};
use crate::engine::AudioEvent;
use crate::manager::Manager;
use crate::routing::InProcessRouter;
use crate::rtp::ReceiverConfig;
use crate::session::ClientId;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(true)
        .init();

    let config = ServerConfig::load()?;
    info!(
        sample_rate = config.sample_rate,
        buffer_size = config.buffer_size,
        max_clients = config.max_clients,
        "starting sam-server"
    );

    let router = Arc::new(InProcessRouter::new());
    let manager = Arc::new(Manager::new(
        config.max_clients,
        config.basic_channels.clone(),
        config.discrete_channels.clone(),
        config.initial_global_volume,
        config.initial_global_delay_ms,
        config.max_global_delay_ms,
        (config.meter_publish_interval_ms as u64 * config.sample_rate as u64) / 1000,
        router,
    ));

    if let Some(host) = config.renderer_host.clone() {
        if let Some(port) = config.renderer_port {
            match format!("{host}:{port}").parse() {
                Ok(addr) => manager.bind_renderer(session::SubscriberTarget::Udp(addr)),
                Err(e) => warn!(host, port, error = %e, "invalid configured renderer address"),
            }
        }
    }

    let output_ports = config.max_output_channels;
    let audio_interface: Box<dyn AudioInterface> = match CpalInterface::new(
        config.sample_rate,
        config.buffer_size,
        output_ports,
    ) {
        Ok(iface) => {
            info!("using cpal audio interface");
            Box::new(iface)
        }
        Err(e) => {
            warn!(error = %e, "no usable audio device, running headless");
            Box::new(VirtualInterface::new(config.sample_rate, config.buffer_size, output_ports))
        }
    };
    let audio_interface = Arc::new(Mutex::new(audio_interface));

    let clock_handle = audio_interface.clone();
    let clock: SharedClock = Arc::new(move || clock_handle.lock().current_sample_time());

    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel::<AudioEvent>();
    let callback = engine::build_callback(manager.clone(), event_tx);
    {
        let mut iface = audio_interface.lock();
        iface.set_callback(callback);
        iface.start()?;
    }
    info!("audio engine started");

    let ctx = DispatchContext {
        sample_rate: config.sample_rate,
        buffer_size: config.buffer_size,
        rtp_base_port: config.rtp_base_port,
        verify_patch_version: config.verify_patch_version,
        receiver_config: ReceiverConfig {
            queue_depth_samples: config.jitter_buffer_samples(),
            skew_threshold: config.clock_skew_threshold,
            stats_interval_samples: (config.meter_publish_interval_ms * config.sample_rate) / 1000,
        },
        delay_max_samples: (config.max_client_delay_ms * config.sample_rate as f32 / 1000.0) as usize,
    };

    let control_addr = format!("0.0.0.0:{}", config.control_port);
    let tcp_listener = TcpListener::bind(&control_addr).await?;
    let control_udp = Arc::new(UdpSocket::bind(&control_addr).await?);
    info!(addr = %control_addr, "control protocol listening");

    let control_state = Arc::new(ControlState::new(manager.clone(), ctx, control_udp));

    tokio::spawn(control::tcp::run(tcp_listener, control_state.clone()));
    tokio::spawn(control::udp::run(control_state.clone()));

    tokio::spawn(supervise(
        manager.clone(),
        control_state,
        event_rx,
        clock,
        config.rtp_base_port,
        config.sample_rate,
        (config.meter_publish_interval_ms * config.sample_rate) / 1000,
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    audio_interface.lock().stop()?;
    Ok(())
}

/// Owns the per-client network tasks and turns audio-thread events into
/// control-protocol notifications. Watches `Manager::active_ids()` on a
/// timer to notice newly registered sessions (registration itself happens
/// on the control thread, with no direct channel back to this task) and
/// spawns their arrival-path task; unwinds that task the moment the audio
/// thread reaps the session.
async fn supervise(
    manager: Arc<Manager>,
    control_state: Arc<ControlState>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<AudioEvent>,
    clock: SharedClock,
    rtp_base_port: u16,
    sample_rate: u32,
    stats_interval_samples: u32,
) {
    let mut network_tasks: HashMap<ClientId, JoinHandle<()>> = HashMap::new();
    let mut scan = interval(Duration::from_millis(50));

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    AudioEvent::MeterPublish(_) => {
                        let out = control::dispatch::meter_notifications(&manager, sample_rate);
                        control_state.route_all(out).await;
                    }
                    AudioEvent::SessionsReaped(ids) => {
                        for id in ids {
                            if let Some(handle) = network_tasks.remove(&id) {
                                handle.abort();
                            }
                            let out = control::dispatch::teardown_notifications(&manager, id);
                            control_state.route_all(out).await;
                        }
                    }
                }
            }
            _ = scan.tick() => {
                for id in manager.active_ids() {
                    if !network_tasks.contains_key(&id) {
                        let handle = tokio::spawn(rtp::network::run(
                            manager.clone(),
                            id,
                            rtp_base_port,
                            sample_rate,
                            stats_interval_samples,
                            clock.clone(),
                        ));
                        network_tasks.insert(id, handle);
                    }
                }
            }
        }
    }
}
