//! Notes: the grouping of voices spawned by one cause.

use ripieno_core::{Event, FadeCurve, NoteId, RtList, SchedTime, SynthParam};
use smallvec::SmallVec;

const DEFAULT_VOLUME_TIME_S: f32 = 0.013;
const DEFAULT_PITCH_TIME_S: f32 = 0.013;
const DEFAULT_PAN_TIME_S: f32 = 0.013;

/// Synthesis parameters a script may override per note. Values are linear
/// ratios (volume, pitch) or normalised 0..1 amounts; all start neutral.
#[derive(Debug, Clone, Copy)]
pub struct NoteOverrides {
    pub volume: f32,
    pub volume_time_s: f32,
    pub pitch: f32,
    pub pitch_time_s: f32,
    pub pan: f32,
    pub pan_time_s: f32,
    pub cutoff: f32,
    pub resonance: f32,
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
    pub amp_lfo_depth: f32,
    pub amp_lfo_freq: f32,
    pub cutoff_lfo_depth: f32,
    pub cutoff_lfo_freq: f32,
    pub pitch_lfo_depth: f32,
    pub pitch_lfo_freq: f32,
    pub volume_curve: FadeCurve,
    pub pitch_curve: FadeCurve,
    pub pan_curve: FadeCurve,
    /// Playback start override in microseconds; negative means unset.
    pub sample_offset_us: i64,
}

impl Default for NoteOverrides {
    fn default() -> Self {
        Self {
            volume: 1.0,
            volume_time_s: DEFAULT_VOLUME_TIME_S,
            pitch: 1.0,
            pitch_time_s: DEFAULT_PITCH_TIME_S,
            pan: 0.0,
            pan_time_s: DEFAULT_PAN_TIME_S,
            cutoff: 1.0,
            resonance: 1.0,
            attack: 1.0,
            decay: 1.0,
            sustain: 1.0,
            release: 1.0,
            amp_lfo_depth: 1.0,
            amp_lfo_freq: 1.0,
            cutoff_lfo_depth: 1.0,
            cutoff_lfo_freq: 1.0,
            pitch_lfo_depth: 1.0,
            pitch_lfo_freq: 1.0,
            volume_curve: FadeCurve::Linear,
            pitch_curve: FadeCurve::Linear,
            pan_curve: FadeCurve::Linear,
            sample_offset_us: -1,
        }
    }
}

impl NoteOverrides {
    /// Apply a script parameter change, absolute or relative.
    pub fn apply(&mut self, param: SynthParam, value: f32, relative: bool) -> f32 {
        // curve selectors are enums, not scalars
        match param {
            SynthParam::VolumeCurve => {
                self.volume_curve = FadeCurve::from_value(value);
                return value;
            }
            SynthParam::PitchCurve => {
                self.pitch_curve = FadeCurve::from_value(value);
                return value;
            }
            SynthParam::PanCurve => {
                self.pan_curve = FadeCurve::from_value(value);
                return value;
            }
            _ => {}
        }
        let slot = match param {
            SynthParam::Volume => &mut self.volume,
            SynthParam::VolumeTime => &mut self.volume_time_s,
            SynthParam::Pitch => &mut self.pitch,
            SynthParam::PitchTime => &mut self.pitch_time_s,
            SynthParam::Pan => &mut self.pan,
            SynthParam::PanTime => &mut self.pan_time_s,
            SynthParam::Cutoff => &mut self.cutoff,
            SynthParam::Resonance => &mut self.resonance,
            SynthParam::Attack => &mut self.attack,
            SynthParam::Decay => &mut self.decay,
            SynthParam::Sustain => &mut self.sustain,
            SynthParam::Release => &mut self.release,
            SynthParam::AmpLfoDepth => &mut self.amp_lfo_depth,
            SynthParam::AmpLfoFreq => &mut self.amp_lfo_freq,
            SynthParam::CutoffLfoDepth => &mut self.cutoff_lfo_depth,
            SynthParam::CutoffLfoFreq => &mut self.cutoff_lfo_freq,
            SynthParam::PitchLfoDepth => &mut self.pitch_lfo_depth,
            SynthParam::PitchLfoFreq => &mut self.pitch_lfo_freq,
            SynthParam::VolumeCurve | SynthParam::PitchCurve | SynthParam::PanCurve => {
                return value
            }
        };
        if relative {
            *slot *= value;
        } else {
            *slot = value;
        }
        *slot
    }
}

/// One triggering cause: a physical note-on or a script-spawned note.
/// Owns its voices via list membership in the engine's voice pool and is
/// freed once that list empties.
#[derive(Debug)]
pub struct Note {
    /// Key this note is allocated on. For child notes this is the parent's
    /// host key, so the pair releases together.
    pub host_key: u8,
    pub parent_id: Option<NoteId>,
    /// Child notes to release together with this one.
    pub child_ids: SmallVec<[NoteId; 4]>,
    /// Copy of the event that caused this note.
    pub cause: Event,
    /// Scheduler time at launch; voices born this fragment are unstealable.
    pub trigger_sched_time: SchedTime,
    pub overrides: NoteOverrides,
    /// Active voices, threaded through the engine's voice pool.
    pub voices: RtList,
    /// User slots for script set_event_par()/get_event_par().
    pub user_params: [i64; 4],
}

impl Default for Note {
    fn default() -> Self {
        Self {
            host_key: 0,
            parent_id: None,
            child_ids: SmallVec::new(),
            cause: Event::default(),
            trigger_sched_time: 0,
            overrides: NoteOverrides::default(),
            voices: RtList::new(),
            user_params: [0; 4],
        }
    }
}

impl Note {
    /// Re-initialise a pooled slot for a fresh launch.
    pub fn reset(&mut self, host_key: u8, cause: Event, trigger_sched_time: SchedTime) {
        self.host_key = host_key;
        self.parent_id = None;
        self.child_ids.clear();
        self.cause = cause;
        self.trigger_sched_time = trigger_sched_time;
        self.overrides = NoteOverrides::default();
        debug_assert!(self.voices.is_empty(), "note reused with live voices");
        self.user_params = [0; 4];
    }
}
