//! Client session (C5): owns one receiver+playout-queue pair and one
//! mix/effects kernel, plus the per-parameter subscriber fan-out and the
//! registration state machine.

use std::net::SocketAddr;

use crate::mixer::MixKernel;
use crate::rtp::{PlayoutQueue, ReceiverConfig, ReceiverStats};

pub type ClientId = i32;

/// `Available -> Initializing -> Active -> Closing -> Available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Available,
    Initializing,
    Active,
    Closing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub depth: i32,
}

/// A destination for a parameter notification: either a bare UDP return
/// address (typical for a UI) or a reference to a client's own persistent
/// TCP control connection (the control layer owns the actual socket and
/// resolves this id to a writer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberTarget {
    Udp(SocketAddr),
    Tcp(u64),
}

#[derive(Debug, Default)]
struct SubscriberList(Vec<SubscriberTarget>);

impl SubscriberList {
    fn subscribe(&mut self, target: SubscriberTarget) {
        if !self.0.contains(&target) {
            self.0.push(target);
        }
    }

    fn unsubscribe(&mut self, target: SubscriberTarget) {
        self.0.retain(|t| *t != target);
    }

    fn targets(&self) -> &[SubscriberTarget] {
        &self.0
    }
}

/// The seven parameter subscriber lists a session maintains (volume, mute,
/// solo, delay, position, type, meter).
#[derive(Debug, Default)]
pub struct Subscribers {
    pub volume: SubscriberList,
    pub mute: SubscriberList,
    pub solo: SubscriberList,
    pub delay: SubscriberList,
    pub position: SubscriberList,
    pub rendering_type: SubscriberList,
    pub meter: SubscriberList,
}

/// The parameter a subscribe/unsubscribe request names; `All` fans out to
/// every list except `meter` is handled identically to the others here
/// (the control dispatcher decides which notification to send immediately).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    Volume,
    Mute,
    Solo,
    Delay,
    Position,
    RenderingType,
    Meter,
}

impl Subscribers {
    pub fn list_mut(&mut self, param: Parameter) -> &mut SubscriberList {
        match param {
            Parameter::Volume => &mut self.volume,
            Parameter::Mute => &mut self.mute,
            Parameter::Solo => &mut self.solo,
            Parameter::Delay => &mut self.delay,
            Parameter::Position => &mut self.position,
            Parameter::RenderingType => &mut self.rendering_type,
            Parameter::Meter => &mut self.meter,
        }
    }

    pub fn list(&self, param: Parameter) -> &[SubscriberTarget] {
        match param {
            Parameter::Volume => self.volume.targets(),
            Parameter::Mute => self.mute.targets(),
            Parameter::Solo => self.solo.targets(),
            Parameter::Delay => self.delay.targets(),
            Parameter::Position => self.position.targets(),
            Parameter::RenderingType => self.rendering_type.targets(),
            Parameter::Meter => self.meter.targets(),
        }
    }

    pub fn subscribe(&mut self, param: Parameter, target: SubscriberTarget) {
        self.list_mut(param).subscribe(target);
    }

    pub fn unsubscribe(&mut self, param: Parameter, target: SubscriberTarget) {
        self.list_mut(param).unsubscribe(target);
    }
}

pub struct ClientSession {
    pub id: ClientId,
    pub name: String,
    pub channels: usize,
    pub sample_rate: u32,
    pub samples_per_packet: u32,
    pub rendering_type: i32,
    pub preset: i32,
    pub state: SessionState,
    pub position: Position,
    pub volume: f32,
    pub mute: bool,
    pub solo: bool,
    /// Per-client delay in samples, bounded by the configured maximum.
    pub delay_samples: u32,
    pub subscribers: Subscribers,
    /// Set by the control thread when this session should be torn down;
    /// observed (and acted on) by the audio thread on the next block.
    pub delete_me: bool,
    /// Output channel indices this session currently owns, in port order.
    /// Empty for a basic-type session that was assigned no outputs.
    pub channel_assignments: Vec<u32>,

    pub queue: PlayoutQueue,
    pub receiver_stats: ReceiverStats,
    pub kernel: MixKernel,
}

impl ClientSession {
    pub fn new(
        id: ClientId,
        name: String,
        channels: usize,
        sample_rate: u32,
        samples_per_packet: u32,
        rendering_type: i32,
        preset: i32,
        position: Position,
        delay_max: usize,
        receiver_config: ReceiverConfig,
    ) -> Self {
        Self {
            id,
            name,
            channels,
            sample_rate,
            samples_per_packet,
            rendering_type,
            preset,
            state: SessionState::Initializing,
            position,
            volume: 1.0,
            mute: false,
            solo: false,
            delay_samples: 0,
            subscribers: Subscribers::default(),
            delete_me: false,
            channel_assignments: Vec::new(),
            queue: PlayoutQueue::new(),
            receiver_stats: ReceiverStats::new(receiver_config),
            kernel: MixKernel::new(channels, delay_max.max(1)),
        }
    }

    pub fn activate(&mut self) {
        self.state = SessionState::Active;
    }

    pub fn begin_close(&mut self) {
        self.state = SessionState::Closing;
        self.delete_me = true;
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        self.kernel.set_volume(self.volume);
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
        self.kernel.set_mute(mute);
    }

    pub fn set_solo(&mut self, solo: bool) {
        self.solo = solo;
        self.kernel.set_solo(solo);
    }

    pub fn set_delay_samples(&mut self, delay_samples: u32, max_delay_samples: u32) {
        self.delay_samples = delay_samples.min(max_delay_samples);
        self.kernel.set_delay(self.delay_samples);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::ReceiverConfig;

    fn config() -> ReceiverConfig {
        ReceiverConfig {
            queue_depth_samples: 1024,
            skew_threshold: 256,
            stats_interval_samples: 48_000,
        }
    }

    #[test]
    fn state_machine_moves_available_to_active_to_closing() {
        let mut session = ClientSession::new(
            0,
            "client".into(),
            2,
            48_000,
            256,
            0,
            0,
            Position::default(),
            4096,
            config(),
        );
        assert_eq!(session.state, SessionState::Initializing);
        session.activate();
        assert!(session.is_active());
        session.begin_close();
        assert_eq!(session.state, SessionState::Closing);
        assert!(session.delete_me);
    }

    #[test]
    fn subscribe_is_idempotent() {
        let mut subs = Subscribers::default();
        let target = SubscriberTarget::Udp("127.0.0.1:9000".parse().unwrap());
        subs.subscribe(Parameter::Volume, target);
        subs.subscribe(Parameter::Volume, target);
        assert_eq!(subs.list(Parameter::Volume).len(), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let mut subs = Subscribers::default();
        let target = SubscriberTarget::Udp("127.0.0.1:9000".parse().unwrap());
        subs.subscribe(Parameter::Meter, target);
        subs.unsubscribe(Parameter::Meter, target);
        subs.unsubscribe(Parameter::Meter, target);
        assert!(subs.list(Parameter::Meter).is_empty());
    }

    #[test]
    fn delay_is_bounded() {
        let mut session = ClientSession::new(
            0,
            "client".into(),
            1,
            48_000,
            256,
            0,
            0,
            Position::default(),
            100,
            config(),
        );
        session.set_delay_samples(1000, 50);
        assert_eq!(session.delay_samples, 50);
    }
}
