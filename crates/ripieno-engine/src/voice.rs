//! Voices: one active playback of one region's sample.

use crate::instrument::RegionData;
use crate::note::NoteOverrides;
use crate::stream::{StreamHandle, StreamReader};
use ripieno_core::{NoteId, SchedTime};
use std::sync::Arc;

/// Where the voice currently sources its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    /// Fully faded out / sample finished; slot awaits reaping.
    #[default]
    End,
    /// Triggered but not yet rendered.
    Init,
    /// Playing from the region's preloaded RAM head.
    Ram,
    /// Playing from the disk stream ring.
    Disk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceType {
    #[default]
    Normal,
    /// Spawned by note-off or pedal-up; exempt from release handling.
    ReleaseTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EgStage {
    Attack,
    Decay,
    Sustain,
    Release,
    /// Fast linear fade used by kills and voice stealing.
    FadeOut,
    Done,
}

/// Linear ADSR amplitude envelope with a separate kill fade.
#[derive(Debug, Clone, Copy)]
struct AmpEg {
    stage: EgStage,
    level: f32,
    attack_step: f32,
    decay_step: f32,
    sustain_level: f32,
    release_samples: f32,
    step: f32,
}

impl Default for AmpEg {
    fn default() -> Self {
        Self {
            stage: EgStage::Done,
            level: 0.0,
            attack_step: 1.0,
            decay_step: 0.0,
            sustain_level: 1.0,
            release_samples: 1.0,
            step: 0.0,
        }
    }
}

impl AmpEg {
    fn trigger(
        &mut self,
        attack_s: f32,
        decay_s: f32,
        sustain_level: f32,
        release_s: f32,
        sample_rate: u32,
    ) {
        let sr = sample_rate as f32;
        self.level = 0.0;
        self.attack_step = 1.0 / (attack_s * sr).max(1.0);
        self.sustain_level = sustain_level.clamp(0.0, 1.0);
        self.decay_step = (1.0 - self.sustain_level) / (decay_s * sr).max(1.0);
        self.release_samples = (release_s * sr).max(1.0);
        self.stage = EgStage::Attack;
        self.step = 0.0;
    }

    #[inline]
    fn next(&mut self) -> f32 {
        match self.stage {
            EgStage::Attack => {
                self.level += self.attack_step;
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.stage = if self.sustain_level >= 1.0 {
                        EgStage::Sustain
                    } else {
                        EgStage::Decay
                    };
                }
            }
            EgStage::Decay => {
                self.level -= self.decay_step;
                if self.level <= self.sustain_level {
                    self.level = self.sustain_level;
                    self.stage = EgStage::Sustain;
                }
            }
            EgStage::Sustain => {}
            EgStage::Release | EgStage::FadeOut => {
                self.level -= self.step;
                if self.level <= 0.0 {
                    self.level = 0.0;
                    self.stage = EgStage::Done;
                }
            }
            EgStage::Done => {}
        }
        self.level
    }

    fn release(&mut self) {
        if matches!(self.stage, EgStage::Done | EgStage::FadeOut) {
            return;
        }
        self.step = self.level / self.release_samples;
        self.stage = EgStage::Release;
    }

    fn cancel_release(&mut self) {
        if self.stage == EgStage::Release {
            self.stage = EgStage::Sustain;
        }
    }

    fn kill(&mut self, fade_samples: u32) {
        if self.stage == EgStage::Done {
            return;
        }
        self.step = self.level / fade_samples.max(1) as f32;
        self.stage = EgStage::FadeOut;
    }

    fn is_done(&self) -> bool {
        self.stage == EgStage::Done
    }
}

/// Per-render context resolved by the channel for this voice's key.
#[derive(Debug, Clone, Copy)]
pub struct VoiceRenderCtx<'a> {
    pub overrides: &'a NoteOverrides,
    /// Pitch factor from the channel's pitch wheel.
    pub pitch_bend: f32,
    /// Pitch factor from the engine's scale tuning for this key.
    pub scale_tune: f32,
    /// Channel master volume (CC7) as linear gain.
    pub channel_volume: f32,
    /// Per-key NRPN volume/pan.
    pub key_volume: f32,
    pub key_pan: f32,
}

/// One active playback of one region. Owned by exactly one note at a time
/// through list membership in the engine's voice pool.
#[derive(Default)]
pub struct Voice {
    pub active: bool,
    pub state: PlaybackState,
    pub voice_type: VoiceType,
    pub key: u8,
    pub velocity: u8,
    pub note_id: Option<NoteId>,
    /// Engine channel that spawned this voice.
    pub channel: usize,
    /// Scheduler time of the spawning fragment; voices spawned in the
    /// current fragment are not stealable.
    pub trigger_sched_time: SchedTime,
    /// Instrument was swapped away beneath this voice; its region reference
    /// is released to the instrument manager when it dies.
    pub orphan: bool,
    pub region: Option<Arc<RegionData>>,
    pub stream: Option<StreamHandle>,
    /// Frame the disk stream was launched at (end of the RAM head).
    pub stream_start_frame: u64,
    pub fx_send: f32,
    key_group: Option<u32>,
    base_pitch: f32,
    base_gain: f32,
    pan: f32,
    eg: AmpEg,
    /// Fractional playhead within the RAM head.
    pos: f64,
    /// First frame served by the disk stream; the RAM phase stops here
    /// (head end, or the loop end when the loop closes inside the head).
    ram_end: u64,
    /// Linear interpolation state over stream frames.
    hist_cur: f32,
    hist_next: f32,
    hist_frac: f64,
    hist_primed: bool,
    /// The stream's final frame is loaded into the interpolator.
    stream_final: bool,
    /// The final frame has been emitted; the next read ends the voice.
    stream_finished: bool,
    released: bool,
    sample_rate: u32,
    /// One-pole lowpass state; bypassed while the cutoff is fully open.
    lp_state: f32,
    amp_lfo_phase: f32,
    pitch_lfo_phase: f32,
}

/// Everything needed to start a voice.
pub struct VoiceTrigger {
    pub region: Arc<RegionData>,
    pub key: u8,
    pub velocity: u8,
    pub note_id: NoteId,
    pub channel: usize,
    pub voice_type: VoiceType,
    pub trigger_sched_time: SchedTime,
    pub sample_rate: u32,
    /// Start frame override resolved from the note's sample-offset.
    pub start_frame: u64,
    pub overrides: NoteOverrides,
}

impl Voice {
    pub fn key_group(&self) -> Option<u32> {
        self.key_group
    }

    /// Initialise the pooled slot for a new playback. The engine launches
    /// the disk stream separately when `needs_stream()` says so.
    pub fn trigger(&mut self, t: VoiceTrigger) {
        let d = t.region.defaults;
        self.active = true;
        self.state = PlaybackState::Init;
        self.voice_type = t.voice_type;
        self.key = t.key;
        self.velocity = t.velocity;
        self.note_id = Some(t.note_id);
        self.channel = t.channel;
        self.trigger_sched_time = t.trigger_sched_time;
        self.orphan = false;
        self.key_group = t.region.key_group;
        self.fx_send = d.fx_send;

        self.base_pitch = 2.0f32.powf((t.key as f32 - d.root_key as f32) / 12.0);
        let velocity_gain = (t.velocity as f32 / 127.0).powi(2);
        self.base_gain = d.volume * velocity_gain;
        self.pan = d.pan;

        self.eg.trigger(
            d.attack_s * t.overrides.attack,
            d.decay_s * t.overrides.decay,
            d.sustain_level * t.overrides.sustain,
            d.release_s * t.overrides.release,
            t.sample_rate,
        );

        let head_len = t.region.ram_head.len() as u64;
        self.ram_end = match t.region.looping {
            Some(l) if l.end < head_len => l.end,
            _ => head_len,
        };
        self.pos = t.start_frame.min(self.ram_end) as f64;
        self.stream_start_frame = self.ram_end.max(t.start_frame);
        self.stream = None;
        self.hist_cur = 0.0;
        self.hist_next = 0.0;
        self.hist_frac = 0.0;
        self.hist_primed = false;
        self.stream_final = false;
        self.stream_finished = false;
        self.released = false;
        self.sample_rate = t.sample_rate;
        self.lp_state = 0.0;
        self.amp_lfo_phase = 0.0;
        self.pitch_lfo_phase = 0.0;
        self.region = Some(t.region);
    }

    /// Whether this voice's sample outgrows the RAM head and needs a disk
    /// stream launched.
    pub fn needs_stream(&self) -> bool {
        self.region.as_ref().is_some_and(|r| !r.is_ram_only())
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Already fading out towards death (kill or steal in progress).
    pub fn is_dying(&self) -> bool {
        self.eg.stage == EgStage::FadeOut
    }

    /// Active, not already dying, and not spawned within the current
    /// fragment (a voice that has produced no audio yet is off-limits).
    pub fn is_stealable(&self, fragment_start: SchedTime) -> bool {
        self.active && !self.is_dying() && self.trigger_sched_time < fragment_start
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Enter the envelope's release stage. Release-trigger voices ignore
    /// this and play out.
    pub fn release(&mut self) {
        if self.voice_type == VoiceType::ReleaseTrigger {
            return;
        }
        self.released = true;
        self.eg.release();
    }

    /// Abort a pending release (new note-on under the same key).
    pub fn cancel_release(&mut self) {
        self.released = false;
        self.eg.cancel_release();
    }

    /// Fast fade-out within `fade_samples`, then the voice ends.
    pub fn kill(&mut self, fade_samples: u32) {
        self.eg.kill(fade_samples);
    }

    /// Stop without rendering another sample. Returns the disk stream to
    /// tear down, if any; the caller posts the kill and counts the pending
    /// deletion.
    pub fn kill_immediately(&mut self) -> Option<StreamHandle> {
        self.active = false;
        self.state = PlaybackState::End;
        self.region = None;
        self.eg = AmpEg::default();
        self.stream.take()
    }

    fn ram_frame(&self, region: &RegionData, pos: f64) -> Option<(f32, f32)> {
        let head = &region.ram_head;
        let limit = (self.ram_end as usize).min(head.len());
        let idx = pos as usize;
        if idx >= limit {
            return None;
        }
        let a = head[idx];
        let b = if idx + 1 < limit { head[idx + 1] } else { a };
        Some((a, b))
    }

    #[inline]
    fn next_stream_frame(&mut self, reader: &mut StreamReader, pitch: f64) -> Option<f32> {
        if self.stream_finished {
            return None;
        }
        if !self.hist_primed {
            self.hist_cur = reader.pop()?;
            self.hist_next = match reader.pop() {
                Some(v) => v,
                None => {
                    if reader.exhausted() {
                        self.stream_final = true;
                    }
                    self.hist_cur
                }
            };
            self.hist_frac = 0.0;
            self.hist_primed = true;
        }
        let out = self.hist_cur + (self.hist_next - self.hist_cur) * self.hist_frac as f32;
        self.hist_frac += pitch;
        while self.hist_frac >= 1.0 {
            match reader.pop() {
                Some(v) => {
                    self.hist_cur = self.hist_next;
                    self.hist_next = v;
                    self.hist_frac -= 1.0;
                }
                None if reader.exhausted() => {
                    if self.stream_final {
                        // `out` is the final frame; end on the next read
                        self.stream_finished = true;
                        break;
                    }
                    self.stream_final = true;
                    self.hist_cur = self.hist_next;
                    self.hist_frac -= 1.0;
                }
                None => {
                    // underrun: hold the last frame, report once per call
                    self.hist_frac = 1.0;
                    return Some(out);
                }
            }
        }
        Some(out)
    }

    /// Render `range` of the current fragment additively into the outputs.
    /// Returns `true` while the voice stays active.
    #[allow(clippy::too_many_arguments)]
    pub fn render(
        &mut self,
        out_left: &mut [f32],
        out_right: &mut [f32],
        fx_left: Option<&mut [f32]>,
        fx_right: Option<&mut [f32]>,
        range: std::ops::Range<usize>,
        ctx: &VoiceRenderCtx<'_>,
        mut stream: Option<&mut StreamReader>,
        metrics: &crate::metrics::EngineMetrics,
    ) -> bool {
        let region = match &self.region {
            Some(r) => Arc::clone(r),
            None => {
                self.active = false;
                return false;
            }
        };
        if self.state == PlaybackState::Init {
            self.state = PlaybackState::Ram;
        }

        let pitch = (self.base_pitch
            * ctx.overrides.pitch
            * ctx.pitch_bend
            * ctx.scale_tune)
            .max(1.0e-6) as f64;
        let gain =
            self.base_gain * ctx.overrides.volume * ctx.channel_volume * ctx.key_volume;

        let d = region.defaults;
        let sr = self.sample_rate.max(1) as f32;
        let cutoff = (d.cutoff * ctx.overrides.cutoff).clamp(0.0, 1.0);
        let lp_coeff = if cutoff >= 1.0 {
            1.0
        } else {
            (cutoff * cutoff).max(5.0e-4)
        };
        let amp_lfo_depth = (d.amp_lfo_depth * ctx.overrides.amp_lfo_depth).clamp(0.0, 1.0);
        let amp_lfo_inc =
            d.amp_lfo_freq_hz * ctx.overrides.amp_lfo_freq * std::f32::consts::TAU / sr;
        let pitch_lfo_depth = d.pitch_lfo_depth_semitones * ctx.overrides.pitch_lfo_depth;
        let pitch_lfo_inc =
            d.pitch_lfo_freq_hz * ctx.overrides.pitch_lfo_freq * std::f32::consts::TAU / sr;
        let pan = (self.pan + ctx.overrides.pan + ctx.key_pan).clamp(-1.0, 1.0);
        // equal-power pan
        let angle = (pan + 1.0) * std::f32::consts::FRAC_PI_4;
        let pan_l = angle.cos();
        let pan_r = angle.sin();

        let mut underrun_counted = false;
        let (mut fx_l, mut fx_r) = (fx_left, fx_right);

        for i in range {
            if self.eg.is_done() {
                self.active = false;
                self.state = PlaybackState::End;
                break;
            }

            let step = if pitch_lfo_depth != 0.0 {
                let semis = pitch_lfo_depth * self.pitch_lfo_phase.sin();
                self.pitch_lfo_phase =
                    (self.pitch_lfo_phase + pitch_lfo_inc) % std::f32::consts::TAU;
                pitch * 2.0f64.powf(semis as f64 / 12.0)
            } else {
                pitch
            };

            let frame = loop {
                match self.state {
                    PlaybackState::Ram => {
                        if let Some((a, b)) = self.ram_frame(&region, self.pos) {
                            let frac = (self.pos - self.pos.floor()) as f32;
                            let value = a + (b - a) * frac;
                            self.pos += step;
                            break Some(value);
                        }
                        if !self.needs_stream() {
                            break None;
                        }
                        // RAM head exhausted; same sample continues from disk
                        self.state = PlaybackState::Disk;
                    }
                    PlaybackState::Disk => {
                        break match stream.as_deref_mut() {
                            Some(reader) => {
                                let frame = self.next_stream_frame(reader, step);
                                if frame.is_none() && !reader.exhausted() && !underrun_counted {
                                    metrics.record_stream_underrun();
                                    underrun_counted = true;
                                }
                                match frame {
                                    Some(v) => Some(v),
                                    // substitute silence for the missing window
                                    None if !reader.exhausted() => Some(0.0),
                                    None => None,
                                }
                            }
                            None => None,
                        };
                    }
                    PlaybackState::Init | PlaybackState::End => break None,
                }
            };

            let frame = match frame {
                Some(v) => v,
                None => {
                    // sample finished
                    self.active = false;
                    self.state = PlaybackState::End;
                    break;
                }
            };

            let frame = if lp_coeff < 1.0 {
                self.lp_state += lp_coeff * (frame - self.lp_state);
                self.lp_state
            } else {
                frame
            };

            let mut amp = self.eg.next() * gain;
            if amp_lfo_depth > 0.0 {
                amp *= 1.0 - amp_lfo_depth * (0.5 + 0.5 * self.amp_lfo_phase.sin());
                self.amp_lfo_phase =
                    (self.amp_lfo_phase + amp_lfo_inc) % std::f32::consts::TAU;
            }
            let l = frame * amp * pan_l;
            let r = frame * amp * pan_r;
            out_left[i] += l;
            out_right[i] += r;
            if let (Some(fl), Some(fr)) = (fx_l.as_deref_mut(), fx_r.as_deref_mut()) {
                fl[i] += l * self.fx_send;
                fr[i] += r * self.fx_send;
            }
        }

        if self.eg.is_done() {
            self.active = false;
            self.state = PlaybackState::End;
        }
        self.active
    }
}
