//! The manager (C6): the session registry, the basic/discrete output
//! allocation policy, the rendering-type table, the renderer binding, and
//! the global mix parameters. Grounded on the teacher's `Mixer` for the
//! shape of a central registry guarded by a lock with per-field setters
//! returning the updated state; the NxM gain matrix is replaced by the
//! basic/discrete output-ownership map this system needs.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, SamError, WireErrorCode};
use crate::rtp::ReceiverConfig;
use crate::routing::{self, PortRouter};
use crate::session::{ClientId, ClientSession, Position, SubscriberTarget};

pub const BASIC_TYPE: i32 = 0;

/// Per-output-channel ownership, one array per channel family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOwner {
    DisabledBasic,
    DisabledDiscrete,
    EnabledBasic,
    EnabledDiscrete,
    Owned(ClientId),
}

#[derive(Debug, Clone)]
pub struct RenderingType {
    pub id: i32,
    pub name: String,
    pub presets: Vec<(i32, String)>,
}

#[derive(Debug, Clone)]
pub struct RendererBinding {
    pub target: SubscriberTarget,
    pub subscribed_types: Vec<i32>,
}

/// Master volume/mute/delay, double-buffered the same way a [`crate::mixer::MixKernel`]
/// double-buffers a session's own parameters.
pub struct GlobalState {
    volume_current_bits: AtomicU32,
    volume_next_bits: AtomicU32,
    mute_current: AtomicBool,
    mute_next: AtomicBool,
    delay_current_ms_bits: AtomicU32,
    delay_next_ms_bits: AtomicU32,
    max_delay_ms: f32,
    active_clients: AtomicUsize,
}

impl GlobalState {
    pub fn new(initial_volume: f32, initial_delay_ms: f32, max_delay_ms: f32) -> Self {
        Self {
            volume_current_bits: AtomicU32::new(initial_volume.to_bits()),
            volume_next_bits: AtomicU32::new(initial_volume.to_bits()),
            mute_current: AtomicBool::new(false),
            mute_next: AtomicBool::new(false),
            delay_current_ms_bits: AtomicU32::new(initial_delay_ms.to_bits()),
            delay_next_ms_bits: AtomicU32::new(initial_delay_ms.to_bits()),
            max_delay_ms,
            active_clients: AtomicUsize::new(0),
        }
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume_next_bits.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_next_bits.load(Ordering::Relaxed))
    }

    pub fn set_mute(&self, mute: bool) {
        self.mute_next.store(mute, Ordering::Relaxed);
    }

    pub fn mute(&self) -> bool {
        self.mute_next.load(Ordering::Relaxed)
    }

    pub fn set_delay_ms(&self, delay_ms: f32) {
        let bound = self.max_delay_ms;
        self.delay_next_ms_bits
            .store(delay_ms.clamp(0.0, bound).to_bits(), Ordering::Relaxed);
    }

    pub fn delay_ms(&self) -> f32 {
        f32::from_bits(self.delay_next_ms_bits.load(Ordering::Relaxed))
    }

    pub fn active_clients(&self) -> usize {
        self.active_clients.load(Ordering::Relaxed)
    }

    /// The effective `(start, end)` gain for the coming block; muted
    /// collapses both ends to zero so sessions ramp to silence with them.
    pub fn gain_window(&self) -> (f32, f32) {
        let mute_start = self.mute_current.load(Ordering::Relaxed);
        let mute_end = self.mute_next.load(Ordering::Relaxed);
        let start = f32::from_bits(self.volume_current_bits.load(Ordering::Relaxed));
        let end = f32::from_bits(self.volume_next_bits.load(Ordering::Relaxed));
        (
            if mute_start { 0.0 } else { start },
            if mute_end { 0.0 } else { end },
        )
    }

    /// Audio thread calls this once per block, after every session has been
    /// processed with the window from [`Self::gain_window`].
    pub fn latch(&self) {
        let next = self.volume_next_bits.load(Ordering::Relaxed);
        self.volume_current_bits.store(next, Ordering::Relaxed);
        let mute_next = self.mute_next.load(Ordering::Relaxed);
        self.mute_current.store(mute_next, Ordering::Relaxed);
        let delay_next = self.delay_next_ms_bits.load(Ordering::Relaxed);
        self.delay_current_ms_bits.store(delay_next, Ordering::Relaxed);
    }
}

struct OutputFamily {
    channels: Vec<u32>,
    owner: Vec<ChannelOwner>,
    next_free: usize,
}

pub struct Manager {
    slots: RwLock<Vec<Option<ClientSession>>>,
    max_clients: usize,
    basic: Mutex<OutputFamily>,
    discrete: Mutex<OutputFamily>,
    rendering_types: RwLock<Vec<RenderingType>>,
    renderer: RwLock<Option<RendererBinding>>,
    ui_subscribers: Mutex<Vec<SubscriberTarget>>,
    pub global: GlobalState,
    router: Arc<dyn PortRouter>,
    meter_publish_interval_samples: u64,
    last_meter_tick: AtomicU64,
}

impl Manager {
    pub fn new(
        max_clients: usize,
        basic_channels: Vec<u32>,
        discrete_channels: Vec<u32>,
        initial_volume: f32,
        initial_delay_ms: f32,
        max_delay_ms: f32,
        meter_publish_interval_samples: u64,
        router: Arc<dyn PortRouter>,
    ) -> Self {
        let basic_len = basic_channels.len();
        let discrete_len = discrete_channels.len();
        Self {
            slots: RwLock::new((0..max_clients).map(|_| None).collect()),
            max_clients,
            basic: Mutex::new(OutputFamily {
                channels: basic_channels,
                owner: vec![ChannelOwner::DisabledBasic; basic_len],
                next_free: 0,
            }),
            discrete: Mutex::new(OutputFamily {
                channels: discrete_channels,
                owner: vec![ChannelOwner::EnabledDiscrete; discrete_len],
                next_free: 0,
            }),
            rendering_types: RwLock::new(vec![RenderingType {
                id: BASIC_TYPE,
                name: "basic".to_string(),
                presets: vec![(0, "default".to_string())],
            }]),
            renderer: RwLock::new(None),
            ui_subscribers: Mutex::new(Vec::new()),
            global: GlobalState::new(initial_volume, initial_delay_ms, max_delay_ms),
            router,
            meter_publish_interval_samples: meter_publish_interval_samples.max(1),
            last_meter_tick: AtomicU64::new(0),
        }
    }

    /// §4.6 basic policy: first `min(channels, |basic|)` outputs, shared.
    fn allocate_basic(&self, channels: usize) -> Vec<u32> {
        let mut family = self.basic.lock();
        let take = channels.min(family.channels.len());
        let assigned: Vec<u32> = family.channels[..take].to_vec();
        for owner in family.owner[..take].iter_mut() {
            *owner = ChannelOwner::EnabledBasic;
        }
        assigned
    }

    /// §4.6 discrete policy: scan from `next_free`, take free slots, or roll
    /// back every partial assignment already made to this session.
    fn allocate_discrete(&self, id: ClientId, channels: usize) -> Result<Vec<u32>> {
        let mut family = self.discrete.lock();
        let total = family.channels.len();
        let mut assigned = Vec::with_capacity(channels);
        let mut scanned = 0;
        let mut cursor = family.next_free;
        while assigned.len() < channels && scanned < total {
            if family.owner[cursor] == ChannelOwner::EnabledDiscrete {
                family.owner[cursor] = ChannelOwner::Owned(id);
                assigned.push(family.channels[cursor]);
            }
            cursor = (cursor + 1) % total.max(1);
            scanned += 1;
        }
        if assigned.len() < channels {
            for owner in family.owner.iter_mut() {
                if *owner == ChannelOwner::Owned(id) {
                    *owner = ChannelOwner::EnabledDiscrete;
                }
            }
            return Err(SamError::NoFreeOutput);
        }
        family.next_free = cursor;
        Ok(assigned)
    }

    fn release_discrete(&self, id: ClientId) {
        let mut family = self.discrete.lock();
        for owner in family.owner.iter_mut() {
            if *owner == ChannelOwner::Owned(id) {
                *owner = ChannelOwner::EnabledDiscrete;
            }
        }
    }

    fn allocate_outputs(&self, id: ClientId, rendering_type: i32, channels: usize) -> Result<Vec<u32>> {
        if rendering_type == BASIC_TYPE {
            Ok(self.allocate_basic(channels))
        } else {
            self.allocate_discrete(id, channels)
        }
    }

    fn release_outputs(&self, id: ClientId, rendering_type: i32) {
        if rendering_type != BASIC_TYPE {
            self.release_discrete(id);
        }
    }

    /// Claim the physical destination port for each assigned output channel.
    /// A router rejection is logged and otherwise ignored: the channel is
    /// still reserved in the allocation table above, so two sessions never
    /// share a discrete output even if the router disagrees about its name.
    fn allocate_ports(&self, client_name: &str, assignments: &[u32]) {
        for (i, _channel) in assignments.iter().enumerate() {
            let name = routing::port_name(client_name, "out", i as u32 + 1);
            if let Err(e) = self.router.allocate(&name) {
                tracing::warn!(port = %name, error = %e, "output port allocation failed");
            }
        }
    }

    fn release_ports(&self, client_name: &str, assignments: &[u32]) {
        for (i, _channel) in assignments.iter().enumerate() {
            let name = routing::port_name(client_name, "out", i as u32 + 1);
            if let Err(e) = self.router.release(&name) {
                tracing::warn!(port = %name, error = %e, "output port release failed");
            }
        }
    }

    /// Register a new client session. Fails with `MaxClients` if every slot
    /// is occupied, or `NoFreeOutput` if the discrete allocation cannot be
    /// satisfied (no partial assignment survives either failure).
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        name: String,
        channels: usize,
        position: Position,
        rendering_type: i32,
        preset: i32,
        sample_rate: u32,
        samples_per_packet: u32,
        receiver_config: ReceiverConfig,
        delay_max_samples: usize,
    ) -> Result<ClientId> {
        let mut slots = self.slots.write();
        let index = slots
            .iter()
            .position(Option::is_none)
            .ok_or(SamError::RequestDenied(WireErrorCode::MaxClients))?;
        let id = index as ClientId;

        let assignments = self.allocate_outputs(id, rendering_type, channels)?;
        self.allocate_ports(&name, &assignments);

        let mut session = ClientSession::new(
            id,
            name,
            channels,
            sample_rate,
            samples_per_packet,
            rendering_type,
            preset,
            position,
            delay_max_samples,
            receiver_config,
        );
        session.channel_assignments = assignments;
        session.activate();
        slots[index] = Some(session);
        self.global.active_clients.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Control-thread side: flag a session for teardown. The audio thread
    /// observes `delete_me` on its next block; [`Self::reap_closed`] then
    /// performs the actual removal once that has happened.
    pub fn begin_unregister(&self, id: ClientId) -> Result<()> {
        let mut slots = self.slots.write();
        let session = slot_mut(slots.as_mut_slice(), id, self.max_clients)?;
        session.begin_close();
        Ok(())
    }

    /// Audio-thread side, called once per block after processing: remove
    /// every session flagged `delete_me`, releasing its discrete outputs.
    pub fn reap_closed(&self) -> Vec<ClientId> {
        let mut removed = Vec::new();
        let mut slots = self.slots.write();
        for slot in slots.iter_mut() {
            let should_remove = matches!(slot, Some(session) if session.delete_me);
            if should_remove {
                if let Some(session) = slot.take() {
                    self.release_outputs(session.id, session.rendering_type);
                    self.release_ports(&session.name, &session.channel_assignments);
                    self.global.active_clients.fetch_sub(1, Ordering::Relaxed);
                    removed.push(session.id);
                }
            }
        }
        removed
    }

    /// Re-run output allocation for a session whose rendering type changed.
    /// Non-discrete -> non-discrete (i.e. both basic) is a no-op. Does not
    /// touch the port router: a type change keeps the same client name and
    /// channel count far more often than not, and the router has no update
    /// operation, only allocate/release.
    pub fn set_type(&self, id: ClientId, rendering_type: i32, preset: i32) -> Result<Vec<u32>> {
        let mut slots = self.slots.write();
        let session = slot_mut(slots.as_mut_slice(), id, self.max_clients)?;
        let old_type = session.rendering_type;
        if old_type == rendering_type {
            session.preset = preset;
            return Ok(session.channel_assignments.clone());
        }

        self.release_outputs(id, old_type);
        match self.allocate_outputs(id, rendering_type, session.channels) {
            Ok(assignments) => {
                session.rendering_type = rendering_type;
                session.preset = preset;
                session.channel_assignments = assignments.clone();
                Ok(assignments)
            }
            Err(e) => {
                // Roll back to the old family so the session is not left
                // without outputs.
                if let Ok(assignments) = self.allocate_outputs(id, old_type, session.channels) {
                    session.channel_assignments = assignments;
                }
                Err(e)
            }
        }
    }

    pub fn with_session<T>(&self, id: ClientId, f: impl FnOnce(&ClientSession) -> T) -> Result<T> {
        let slots = self.slots.read();
        let session = slots
            .get(id as usize)
            .and_then(|s| s.as_ref())
            .ok_or(SamError::InvalidId(id))?;
        Ok(f(session))
    }

    pub fn with_session_mut<T>(&self, id: ClientId, f: impl FnOnce(&mut ClientSession) -> T) -> Result<T> {
        let mut slots = self.slots.write();
        let session = slot_mut(slots.as_mut_slice(), id, self.max_clients)?;
        Ok(f(session))
    }

    pub fn active_ids(&self) -> Vec<ClientId> {
        self.slots
            .read()
            .iter()
            .filter_map(|s| s.as_ref().map(|session| session.id))
            .collect()
    }

    pub fn register_rendering_type(&self, name: String, presets: Vec<(i32, String)>) -> i32 {
        let mut types = self.rendering_types.write();
        let id = types.iter().map(|t| t.id).max().unwrap_or(BASIC_TYPE) + 1;
        types.push(RenderingType { id, name, presets });
        id
    }

    pub fn rendering_types(&self) -> Vec<RenderingType> {
        self.rendering_types.read().clone()
    }

    pub fn bind_renderer(&self, target: SubscriberTarget) {
        *self.renderer.write() = Some(RendererBinding {
            target,
            subscribed_types: Vec::new(),
        });
    }

    pub fn unbind_renderer(&self) {
        *self.renderer.write() = None;
    }

    pub fn renderer(&self) -> Option<RendererBinding> {
        self.renderer.read().clone()
    }

    pub fn router(&self) -> &Arc<dyn PortRouter> {
        &self.router
    }

    pub fn subscribe_ui(&self, target: SubscriberTarget) {
        let mut subs = self.ui_subscribers.lock();
        if !subs.contains(&target) {
            subs.push(target);
        }
    }

    pub fn ui_subscribers(&self) -> Vec<SubscriberTarget> {
        self.ui_subscribers.lock().clone()
    }

    /// Lock-free comparison the audio thread can make every block without
    /// contending with the control thread; true at most once per interval.
    pub fn meter_publish_due(&self, current_sample_time: u64) -> bool {
        let last = self.last_meter_tick.load(Ordering::Relaxed);
        if current_sample_time.wrapping_sub(last) >= self.meter_publish_interval_samples {
            self.last_meter_tick.store(current_sample_time, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

fn slot_mut(
    slots: &mut [Option<ClientSession>],
    id: ClientId,
    max_clients: usize,
) -> Result<&mut ClientSession> {
    if id < 0 || id as usize >= max_clients {
        return Err(SamError::InvalidId(id));
    }
    slots[id as usize].as_mut().ok_or(SamError::InvalidId(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::InProcessRouter;

    fn receiver_config() -> ReceiverConfig {
        ReceiverConfig {
            queue_depth_samples: 1024,
            skew_threshold: 256,
            stats_interval_samples: 48_000,
        }
    }

    fn manager(basic: Vec<u32>, discrete: Vec<u32>, max_clients: usize) -> Manager {
        Manager::new(
            max_clients,
            basic,
            discrete,
            1.0,
            0.0,
            1000.0,
            4800,
            Arc::new(InProcessRouter::new()),
        )
    }

    #[test]
    fn basic_registration_shares_output_channels() {
        let mgr = manager(vec![0, 1], vec![], 4);
        let id_a = mgr
            .register("a".into(), 2, Position::default(), BASIC_TYPE, 0, 48_000, 256, receiver_config(), 4096)
            .unwrap();
        let id_b = mgr
            .register("b".into(), 2, Position::default(), BASIC_TYPE, 0, 48_000, 256, receiver_config(), 4096)
            .unwrap();
        let a_assignments = mgr.with_session(id_a, |s| s.channel_assignments.clone()).unwrap();
        let b_assignments = mgr.with_session(id_b, |s| s.channel_assignments.clone()).unwrap();
        assert_eq!(a_assignments, vec![0, 1]);
        assert_eq!(b_assignments, vec![0, 1]);
    }

    #[test]
    fn discrete_registration_fails_when_exhausted() {
        let mgr = manager(vec![], vec![0, 1], 4);
        mgr.register("a".into(), 2, Position::default(), 1, 0, 48_000, 256, receiver_config(), 4096)
            .unwrap();
        let err = mgr
            .register("b".into(), 1, Position::default(), 1, 0, 48_000, 256, receiver_config(), 4096)
            .unwrap_err();
        assert!(matches!(err, SamError::NoFreeOutput));
    }

    #[test]
    fn discrete_release_frees_channels_for_reuse() {
        let mgr = manager(vec![], vec![0, 1], 4);
        let id = mgr
            .register("a".into(), 2, Position::default(), 1, 0, 48_000, 256, receiver_config(), 4096)
            .unwrap();
        mgr.begin_unregister(id).unwrap();
        mgr.reap_closed();
        let id2 = mgr
            .register("b".into(), 2, Position::default(), 1, 0, 48_000, 256, receiver_config(), 4096)
            .unwrap();
        let assignments = mgr.with_session(id2, |s| s.channel_assignments.clone()).unwrap();
        assert_eq!(assignments, vec![0, 1]);
    }

    #[test]
    fn max_clients_is_enforced() {
        let mgr = manager(vec![0], vec![], 1);
        mgr.register("a".into(), 1, Position::default(), BASIC_TYPE, 0, 48_000, 256, receiver_config(), 4096)
            .unwrap();
        let err = mgr
            .register("b".into(), 1, Position::default(), BASIC_TYPE, 0, 48_000, 256, receiver_config(), 4096)
            .unwrap_err();
        assert!(matches!(err, SamError::RequestDenied(WireErrorCode::MaxClients)));
    }

    #[test]
    fn reap_only_removes_flagged_sessions() {
        let mgr = manager(vec![0], vec![], 2);
        let id = mgr
            .register("a".into(), 1, Position::default(), BASIC_TYPE, 0, 48_000, 256, receiver_config(), 4096)
            .unwrap();
        assert!(mgr.reap_closed().is_empty());
        mgr.begin_unregister(id).unwrap();
        assert_eq!(mgr.reap_closed(), vec![id]);
        assert!(mgr.active_ids().is_empty());
    }

    #[test]
    fn meter_publish_fires_once_per_interval() {
        let mgr = manager(vec![], vec![], 1);
        assert!(mgr.meter_publish_due(0));
        assert!(!mgr.meter_publish_due(100));
        assert!(mgr.meter_publish_due(4800));
    }

    #[test]
    fn basic_type_is_never_removed_from_table() {
        let mgr = manager(vec![], vec![], 1);
        let types = mgr.rendering_types();
        assert_eq!(types[0].id, BASIC_TYPE);
        assert_eq!(types[0].name, "basic");
    }
}
