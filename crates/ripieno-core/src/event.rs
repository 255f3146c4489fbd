//! Event records flowing from MIDI producers into the render loop.

use crate::clock::{EventClock, SchedTime, WallTime};
use crate::pool::ElementId;

/// ID of a `Note` pool element.
pub type NoteId = ElementId;
/// ID of an `Event` pool element.
pub type EventId = ElementId;
/// ID of a suspended script callback instance.
pub type ScriptCallbackId = ElementId;

/// What an event means. Separated from the payload so retyping an event
/// (note-on becoming `CancelReleaseKey`, note-off becoming `ReleaseKey`)
/// keeps its data and timing intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Real MIDI note-on.
    NoteOn,
    /// Real MIDI note-off.
    NoteOff,
    PitchBend,
    ControlChange,
    Sysex,
    /// Transformed from a note-on or sustain-pedal-down event; aborts
    /// release stages of voices on the key.
    CancelReleaseKey,
    /// Transformed from a note-off or sustain-pedal-up event; enters
    /// release stages of voices on the key.
    ReleaseKey,
    /// Transformed from a `StopNote` event; releases one note only.
    ReleaseNote,
    ChannelPressure,
    NotePressure,
    /// Script-spawned note (built-in `play_note`).
    PlayNote,
    /// Script-initiated release of one note (built-in `note_off`).
    StopNote,
    /// Script-initiated fade-out kill of one note (built-in `fade_out`).
    KillNote,
    /// Change of one note's synthesis parameter from a script.
    NoteSynthParam,
}

/// Per-note synthesis parameters addressable by scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthParam {
    Volume,
    VolumeTime,
    VolumeCurve,
    Pitch,
    PitchTime,
    PitchCurve,
    Pan,
    PanTime,
    PanCurve,
    Cutoff,
    Resonance,
    Attack,
    Decay,
    Sustain,
    Release,
    AmpLfoDepth,
    AmpLfoFreq,
    CutoffLfoDepth,
    CutoffLfoFreq,
    PitchLfoDepth,
    PitchLfoFreq,
}

/// Shape of a parameter transition requested per note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FadeCurve {
    #[default]
    Linear,
    EaseIn,
    EaseOut,
    EaseInEaseOut,
}

impl FadeCurve {
    /// Decode a script-supplied numeric curve selector.
    pub fn from_value(value: f32) -> Self {
        match value as i32 {
            1 => FadeCurve::EaseIn,
            2 => FadeCurve::EaseOut,
            3 => FadeCurve::EaseInEaseOut,
            _ => FadeCurve::Linear,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoteEvent {
    pub key: u8,
    pub velocity: u8,
    /// Region layer index, used when a note-on is re-run for a stolen voice.
    pub layer: u8,
    /// Whether the re-run spawns a release-trigger voice.
    pub release_trigger: bool,
    /// Note spawned by this event, filled in once the note is launched.
    pub note_id: Option<NoteId>,
    /// Parent note for script-spawned child notes.
    pub parent_note_id: Option<NoteId>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CcEvent {
    pub controller: u8,
    pub value: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PitchBendEvent {
    /// 14-bit pitch wheel value, centred on zero (-8192..=8191).
    pub value: i16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PressureEvent {
    pub value: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NotePressureEvent {
    pub key: u8,
    pub value: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct SynthParamEvent {
    pub note_id: Option<NoteId>,
    pub param: SynthParam,
    pub value: f32,
    /// Apply `value` as a delta against the current value instead of
    /// replacing it.
    pub relative: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum EventPayload {
    Note(NoteEvent),
    Cc(CcEvent),
    PitchBend(PitchBendEvent),
    ChannelPressure(PressureEvent),
    NotePressure(NotePressureEvent),
    Sysex { len: u32 },
    SynthParam(SynthParamEvent),
}

/// A timed event. Events live in the engine's event pool; per-channel and
/// per-key event lists are `RtList`s sharing that pool.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub kind: EventKind,
    pub payload: EventPayload,
    /// Wall-clock creation time, stamped by the producer.
    pub time: WallTime,
    /// Index of the engine channel this event belongs to; `None` for
    /// engine-global events (sysex).
    pub channel: Option<usize>,
    /// Lazily resolved intra-fragment sample offset; negative = unresolved.
    frag_pos: i32,
}

impl Event {
    pub fn new(kind: EventKind, payload: EventPayload, time: WallTime) -> Self {
        Self {
            kind,
            payload,
            time,
            channel: None,
            frag_pos: -1,
        }
    }

    /// Event pinned to a known intra-fragment offset (engine-synthesised).
    pub fn at_offset(kind: EventKind, payload: EventPayload, offset: u32) -> Self {
        Self {
            kind,
            payload,
            time: 0,
            channel: None,
            frag_pos: offset as i32,
        }
    }

    pub fn note_on(key: u8, velocity: u8, time: WallTime) -> Self {
        Self::new(
            EventKind::NoteOn,
            EventPayload::Note(NoteEvent {
                key,
                velocity,
                ..Default::default()
            }),
            time,
        )
    }

    pub fn note_off(key: u8, velocity: u8, time: WallTime) -> Self {
        Self::new(
            EventKind::NoteOff,
            EventPayload::Note(NoteEvent {
                key,
                velocity,
                ..Default::default()
            }),
            time,
        )
    }

    pub fn control_change(controller: u8, value: u8, time: WallTime) -> Self {
        Self::new(
            EventKind::ControlChange,
            EventPayload::Cc(CcEvent { controller, value }),
            time,
        )
    }

    pub fn pitch_bend(value: i16, time: WallTime) -> Self {
        Self::new(
            EventKind::PitchBend,
            EventPayload::PitchBend(PitchBendEvent { value }),
            time,
        )
    }

    /// Intra-fragment offset, resolved once per fragment and cached.
    pub fn fragment_pos(&mut self, clock: &EventClock) -> u32 {
        if self.frag_pos >= 0 {
            return self.frag_pos as u32;
        }
        let pos = clock.fragment_pos(self.time);
        self.frag_pos = pos as i32;
        pos
    }

    /// Cached offset, if already resolved this fragment.
    pub fn cached_fragment_pos(&self) -> Option<u32> {
        (self.frag_pos >= 0).then_some(self.frag_pos as u32)
    }

    /// Invalidate the cached offset (when an event survives into a later
    /// fragment, e.g. on the voice-stealing queue).
    pub fn reset_fragment_pos(&mut self) {
        self.frag_pos = -1;
    }

    /// Force the intra-fragment offset (delayed events merged back in).
    pub fn pin_fragment_pos(&mut self, offset: u32) {
        self.frag_pos = offset as i32;
    }

    pub fn copy_time_from(&mut self, other: &Event) {
        self.time = other.time;
        self.frag_pos = other.frag_pos;
    }

    /// Engine-global scheduler time of this event.
    pub fn sched_time(&mut self, clock: &EventClock) -> SchedTime {
        clock.fragment_start() + self.fragment_pos(clock) as u64
    }

    pub fn note(&self) -> Option<&NoteEvent> {
        match &self.payload {
            EventPayload::Note(n) => Some(n),
            _ => None,
        }
    }

    pub fn note_mut(&mut self) -> Option<&mut NoteEvent> {
        match &mut self.payload {
            EventPayload::Note(n) => Some(n),
            _ => None,
        }
    }

    pub fn cc(&self) -> Option<&CcEvent> {
        match &self.payload {
            EventPayload::Cc(cc) => Some(cc),
            _ => None,
        }
    }

    /// Whether this is a physical MIDI note-on rather than a script spawn.
    pub fn is_real_note_on(&self) -> bool {
        self.kind == EventKind::NoteOn
    }

    /// Whether this is a physical MIDI note-off rather than a script stop.
    pub fn is_real_note_off(&self) -> bool {
        self.kind == EventKind::NoteOff
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new(EventKind::NoteOn, EventPayload::Note(NoteEvent::default()), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_pos_cached_after_first_resolve() {
        let mut clock = EventClock::new(48000);
        clock.advance_fragment(256, 1_000_000);
        let mut ev = Event::note_on(60, 100, 1_002_000);
        let pos = ev.fragment_pos(&clock);
        assert_eq!(pos, 96); // 2ms at 48kHz
        // advancing the clock must not change the cached value
        clock.advance_fragment(256, 2_000_000);
        assert_eq!(ev.fragment_pos(&clock), 96);
        ev.reset_fragment_pos();
        assert_eq!(ev.cached_fragment_pos(), None);
    }

    #[test]
    fn test_retyping_keeps_payload() {
        let mut ev = Event::note_off(64, 80, 123);
        ev.kind = EventKind::ReleaseKey;
        let note = ev.note().unwrap();
        assert_eq!(note.key, 64);
        assert_eq!(note.velocity, 80);
        assert!(!ev.is_real_note_off());
    }

    #[test]
    fn test_pinned_offset_event() {
        let clock = EventClock::new(44100);
        let mut ev = Event::at_offset(
            EventKind::ReleaseKey,
            EventPayload::Note(NoteEvent {
                key: 60,
                velocity: 64,
                ..Default::default()
            }),
            100,
        );
        assert_eq!(ev.fragment_pos(&clock), 100);
    }
}
