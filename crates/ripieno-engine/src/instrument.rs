//! Opaque instrument interface consumed by the engine.
//!
//! The engine never parses instrument files. It sees an instrument as a
//! region lookup keyed by `(key, velocity, controller state, round robin)`,
//! and a region as a sample reference plus loop metadata and synthesis
//! defaults. Loaders living outside this crate build these structures.

use dashmap::DashMap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Mono sample frame storage, addressable by frame index. Implementations
/// may be RAM-resident or backed by a file; reads happen on the disk thread
/// (and once at preload time).
pub trait SampleSource: Send + Sync {
    /// Total frame count.
    fn frames(&self) -> u64;

    /// Read frames starting at `start` into `out`, returning how many were
    /// produced. Short reads only happen at end of sample.
    fn read(&self, start: u64, out: &mut [f32]) -> usize;
}

/// Sample held entirely in memory.
pub struct MemorySample {
    frames: Vec<f32>,
}

impl MemorySample {
    pub fn new(frames: Vec<f32>) -> Self {
        Self { frames }
    }
}

impl SampleSource for MemorySample {
    fn frames(&self) -> u64 {
        self.frames.len() as u64
    }

    fn read(&self, start: u64, out: &mut [f32]) -> usize {
        if start >= self.frames.len() as u64 {
            return 0;
        }
        let start = start as usize;
        let n = out.len().min(self.frames.len() - start);
        out[..n].copy_from_slice(&self.frames[start..start + n]);
        n
    }
}

/// Loop region of a sample, with an optional finite play count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopDescriptor {
    pub start: u64,
    /// Exclusive end frame.
    pub end: u64,
    /// `None` loops forever; `Some(n)` plays the loop body n times, then
    /// continues linearly to the sample end.
    pub play_count: Option<u32>,
}

/// When release-trigger voices are spawned for a region's key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseTrigger {
    /// Spawn on MIDI note-off.
    pub note_off: bool,
    /// Spawn on sustain pedal up, with velocity forced to 127.
    pub sustain_max_velocity: bool,
    /// Spawn on sustain pedal up, with the key's latest note-on velocity.
    pub sustain_key_velocity: bool,
}

impl ReleaseTrigger {
    pub fn none(&self) -> bool {
        !(self.note_off || self.sustain_max_velocity || self.sustain_key_velocity)
    }

    pub fn any_sustain(&self) -> bool {
        self.sustain_max_velocity || self.sustain_key_velocity
    }

    pub fn merge(&mut self, other: ReleaseTrigger) {
        self.note_off |= other.note_off;
        self.sustain_max_velocity |= other.sustain_max_velocity;
        self.sustain_key_velocity |= other.sustain_key_velocity;
    }
}

/// Default synthesis parameters of a region, before note overrides.
#[derive(Debug, Clone, Copy)]
pub struct SynthDefaults {
    /// Linear gain.
    pub volume: f32,
    /// -1.0 (left) .. 1.0 (right).
    pub pan: f32,
    /// MIDI key the sample is pitched for.
    pub root_key: u8,
    pub attack_s: f32,
    pub decay_s: f32,
    /// Sustain level as a fraction of peak.
    pub sustain_level: f32,
    pub release_s: f32,
    /// Normalised lowpass cutoff; 1.0 leaves the filter open (bypassed).
    pub cutoff: f32,
    /// Reserved for resonant filter models.
    pub resonance: f32,
    /// Amplitude LFO depth, 0.0 disables the LFO.
    pub amp_lfo_depth: f32,
    pub amp_lfo_freq_hz: f32,
    /// Pitch LFO (vibrato) depth in semitones, 0.0 disables it.
    pub pitch_lfo_depth_semitones: f32,
    pub pitch_lfo_freq_hz: f32,
    /// Per-voice FX send level.
    pub fx_send: f32,
}

impl Default for SynthDefaults {
    fn default() -> Self {
        Self {
            volume: 1.0,
            pan: 0.0,
            root_key: 60,
            attack_s: 0.001,
            decay_s: 0.010,
            sustain_level: 1.0,
            release_s: 0.050,
            cutoff: 1.0,
            resonance: 0.0,
            amp_lfo_depth: 0.0,
            amp_lfo_freq_hz: 5.0,
            pitch_lfo_depth_semitones: 0.0,
            pitch_lfo_freq_hz: 5.0,
            fx_send: 0.0,
        }
    }
}

/// One mapping zone of an instrument: a sample plus everything the engine
/// needs to synthesise it.
pub struct RegionData {
    pub sample: Arc<dyn SampleSource>,
    /// Head of the sample preloaded into RAM. Voices play from here while
    /// their disk stream spins up; samples fitting entirely are RAM-only.
    pub ram_head: Arc<[f32]>,
    pub looping: Option<LoopDescriptor>,
    pub defaults: SynthDefaults,
    /// Exclusive group: triggering this region mutes sounding members.
    pub key_group: Option<u32>,
    pub release_trigger: ReleaseTrigger,
}

impl RegionData {
    /// Build a region, preloading up to `ram_window` frames of the sample.
    pub fn new(sample: Arc<dyn SampleSource>, ram_window: u64) -> Self {
        let head_len = sample.frames().min(ram_window) as usize;
        let mut head = vec![0.0f32; head_len];
        let got = sample.read(0, &mut head);
        head.truncate(got);
        Self {
            sample,
            ram_head: head.into(),
            looping: None,
            defaults: SynthDefaults::default(),
            key_group: None,
            release_trigger: ReleaseTrigger::default(),
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.sample.frames()
    }

    /// Whether the whole sample fits in the preloaded head.
    pub fn is_ram_only(&self) -> bool {
        self.total_frames() <= self.ram_head.len() as u64 && self.looping.is_none()
    }
}

/// Region lookup context for one trigger.
pub struct RegionQuery<'a> {
    pub key: u8,
    pub velocity: u8,
    pub controllers: &'a [u8; 128],
    /// Forces the value CC64 appears to have during lookup, so release
    /// regions can distinguish pedal-up from note-off without the engine
    /// mutating its controller table.
    pub cc64_override: Option<u8>,
    pub round_robin: u32,
}

impl RegionQuery<'_> {
    pub fn controller(&self, cc: u8) -> u8 {
        if cc == 64 {
            if let Some(v) = self.cc64_override {
                return v;
            }
        }
        self.controllers[cc as usize]
    }
}

/// Result of a region lookup: the layers to trigger, in order.
pub type RegionSet = SmallVec<[Arc<RegionData>; 4]>;

/// An instrument as the engine sees it.
pub trait Instrument: Send + Sync {
    /// Regions triggered by a note-on.
    fn regions(&self, query: &RegionQuery) -> RegionSet;

    /// Regions triggered by a note-off or pedal-up (release samples).
    fn release_regions(&self, _query: &RegionQuery) -> RegionSet {
        RegionSet::new()
    }
}

/// A programmatic instrument mapping key/velocity ranges to regions.
/// Loaders for real instrument formats produce equivalent structures.
#[derive(Default)]
pub struct ZoneInstrument {
    zones: Vec<Zone>,
    release_zones: Vec<Zone>,
}

struct Zone {
    key_range: (u8, u8),
    velocity_range: (u8, u8),
    region: Arc<RegionData>,
}

impl ZoneInstrument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_zone(
        &mut self,
        key_range: (u8, u8),
        velocity_range: (u8, u8),
        region: Arc<RegionData>,
    ) -> &mut Self {
        self.zones.push(Zone {
            key_range,
            velocity_range,
            region,
        });
        self
    }

    pub fn add_release_zone(
        &mut self,
        key_range: (u8, u8),
        velocity_range: (u8, u8),
        region: Arc<RegionData>,
    ) -> &mut Self {
        self.release_zones.push(Zone {
            key_range,
            velocity_range,
            region,
        });
        self
    }

    fn matching(zones: &[Zone], query: &RegionQuery) -> RegionSet {
        zones
            .iter()
            .filter(|z| {
                (z.key_range.0..=z.key_range.1).contains(&query.key)
                    && (z.velocity_range.0..=z.velocity_range.1).contains(&query.velocity)
            })
            .map(|z| Arc::clone(&z.region))
            .collect()
    }
}

impl Instrument for ZoneInstrument {
    fn regions(&self, query: &RegionQuery) -> RegionSet {
        Self::matching(&self.zones, query)
    }

    fn release_regions(&self, query: &RegionQuery) -> RegionSet {
        Self::matching(&self.release_zones, query)
    }
}

/// Unique identifier of a registered instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrumentId(pub u64);

impl InstrumentId {
    /// Generate a new unique instrument ID.
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Shared registry of loaded instruments. This is the one shared-mutable
/// structure in the engine; it is touched only from loader and
/// channel-connect paths, never the audio thread.
#[derive(Default)]
pub struct InstrumentManager {
    instruments: DashMap<InstrumentId, Arc<dyn Instrument>>,
}

impl InstrumentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instrument: Arc<dyn Instrument>) -> InstrumentId {
        let id = InstrumentId::generate();
        self.instruments.insert(id, instrument);
        id
    }

    pub fn get(&self, id: InstrumentId) -> Option<Arc<dyn Instrument>> {
        self.instruments.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn remove(&self, id: InstrumentId) -> Option<Arc<dyn Instrument>> {
        self.instruments.remove(&id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_sample(len: usize) -> Arc<dyn SampleSource> {
        Arc::new(MemorySample::new((0..len).map(|i| i as f32).collect()))
    }

    #[test]
    fn test_memory_sample_short_read_at_end() {
        let sample = ramp_sample(10);
        let mut out = [0.0f32; 8];
        assert_eq!(sample.read(6, &mut out), 4);
        assert_eq!(&out[..4], &[6.0, 7.0, 8.0, 9.0]);
        assert_eq!(sample.read(10, &mut out), 0);
    }

    #[test]
    fn test_region_preloads_head() {
        let region = RegionData::new(ramp_sample(100), 16);
        assert_eq!(region.ram_head.len(), 16);
        assert_eq!(region.ram_head[15], 15.0);
        assert!(!region.is_ram_only());

        let small = RegionData::new(ramp_sample(8), 16);
        assert_eq!(small.ram_head.len(), 8);
        assert!(small.is_ram_only());
    }

    #[test]
    fn test_zone_instrument_lookup() {
        let mut instrument = ZoneInstrument::new();
        let region = Arc::new(RegionData::new(ramp_sample(32), 32));
        instrument.add_zone((60, 72), (1, 127), region);

        let controllers = [0u8; 128];
        let hit = RegionQuery {
            key: 64,
            velocity: 100,
            controllers: &controllers,
            cc64_override: None,
            round_robin: 0,
        };
        assert_eq!(instrument.regions(&hit).len(), 1);

        let miss = RegionQuery { key: 50, ..hit };
        assert!(instrument.regions(&miss).is_empty());
    }

    #[test]
    fn test_cc64_override_visible_in_query() {
        let mut controllers = [0u8; 128];
        controllers[64] = 10;
        let query = RegionQuery {
            key: 60,
            velocity: 100,
            controllers: &controllers,
            cc64_override: Some(127),
            round_robin: 0,
        };
        assert_eq!(query.controller(64), 127);
        assert_eq!(query.controller(1), 0);
    }

    #[test]
    fn test_instrument_manager_roundtrip() {
        let manager = InstrumentManager::new();
        let id = manager.register(Arc::new(ZoneInstrument::new()));
        assert!(manager.get(id).is_some());
        assert!(manager.remove(id).is_some());
        assert!(manager.get(id).is_none());
    }
}
