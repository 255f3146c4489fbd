//! Per-MIDI-channel engine state.

use crate::fx::FxSend;
use crate::instrument::Instrument;
use crate::keyboard::MidiKeyboard;
use crate::script::ScriptProgram;
use crate::virt::{virtual_midi_device, VirtualMidiHost, VirtualMidiPort};
use arc_swap::ArcSwapOption;
use ripieno_core::{
    ring_buffer, AtomicFlag, Event, RingConsumer, RingProducer, RtList, ScheduledQueue, Token,
    WallTime,
};
use std::sync::Arc;

/// Instrument plus optional script, swapped in atomically as one unit.
pub struct InstrumentBinding {
    pub instrument: Arc<dyn Instrument>,
    pub script: Option<ScriptProgram>,
}

/// Producer handle for a MIDI input port feeding one channel.
pub struct EventSender {
    tx: RingProducer<Event>,
}

impl EventSender {
    pub fn send(&mut self, event: Event) -> bool {
        self.tx.push(event).is_ok()
    }

    pub fn note_on(&mut self, key: u8, velocity: u8, time: WallTime) -> bool {
        self.send(Event::note_on(key, velocity, time))
    }

    pub fn note_off(&mut self, key: u8, velocity: u8, time: WallTime) -> bool {
        self.send(Event::note_off(key, velocity, time))
    }

    pub fn control_change(&mut self, controller: u8, value: u8, time: WallTime) -> bool {
        self.send(Event::control_change(controller, value, time))
    }

    pub fn pitch_bend(&mut self, value: i16, time: WallTime) -> bool {
        self.send(Event::pitch_bend(value, time))
    }
}

/// Engine-side action required after a control change was absorbed into the
/// channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcEffect {
    None,
    SustainDown,
    SustainUp,
    SostenutoDown,
    SostenutoUp,
    /// Coarse tune changed; sounding voices are released to avoid hangs.
    TransposeChanged,
    AllSoundOff,
    AllNotesOff,
    ResetControllers,
}

const PORTAMENTO_TIME_MIN_S: f32 = 0.1;
const PORTAMENTO_TIME_MAX_S: f32 = 32.0;

/// Per-channel state: instrument binding, keyboard, controller table,
/// ingestion rings and FX sends. Mutated only by the audio thread, except
/// for the double-buffered instrument switch.
pub struct EngineChannel {
    pub index: usize,
    input: RingConsumer<Event>,
    sender: Option<RingProducer<Event>>,
    pub virtual_devices: Vec<VirtualMidiHost>,

    /// This fragment's imported events (list into the engine event pool).
    pub events: RtList,
    /// Delayed events parked across fragments (same pool).
    pub delayed_list: RtList,
    pub delayed: ScheduledQueue<Token>,

    pub keyboard: MidiKeyboard,
    pub controllers: [u8; 128],
    pub pitch_bend: i16,
    pub pitch_bend_range: u8,
    pub transpose: i32,
    pub portamento_mode: bool,
    pub portamento_time_s: f32,
    /// Current portamento position in key numbers; negative = unset.
    pub portamento_pos: f32,
    pub solo_mode: bool,
    /// Currently active solo key; negative = none.
    pub solo_key: i16,
    pub mute: bool,
    /// While muted, keep processing and rendering voices (silently) so
    /// unmuting resumes mid-phrase; when disabled, a muted channel drops
    /// its note events after notifying listeners.
    pub mute_rendering: bool,
    /// MIDI channel (0..15) this engine channel listens on; `None` = omni.
    /// Consulted by driver adapters when routing ports to channels.
    pub midi_channel: Option<u8>,
    /// Channel-wide round robin counter, advanced on real note-ons.
    pub round_robin: u32,
    pub fx_sends: Vec<FxSend>,
    pub voice_count: usize,
    pub stream_count: usize,
    /// Run the freshly swapped-in script's init handler at fragment start.
    pub script_init_pending: bool,

    current_instrument: Option<Arc<InstrumentBinding>>,
    next_instrument: ArcSwapOption<InstrumentBinding>,
    instrument_changed: AtomicFlag,

    rpn: Option<u16>,
    nrpn: Option<u16>,
}

impl EngineChannel {
    pub fn new(index: usize, input_queue_size: usize) -> Self {
        let (tx, rx) = ring_buffer(input_queue_size);
        let mut controllers = [0u8; 128];
        controllers[7] = 127;
        Self {
            index,
            input: rx,
            sender: Some(tx),
            virtual_devices: Vec::new(),
            events: RtList::new(),
            delayed_list: RtList::new(),
            delayed: ScheduledQueue::new(),
            keyboard: MidiKeyboard::new(),
            controllers,
            pitch_bend: 0,
            pitch_bend_range: 2,
            transpose: 0,
            portamento_mode: false,
            portamento_time_s: PORTAMENTO_TIME_MIN_S,
            portamento_pos: -1.0,
            solo_mode: false,
            solo_key: -1,
            mute: false,
            mute_rendering: false,
            midi_channel: None,
            round_robin: 0,
            fx_sends: Vec::new(),
            voice_count: 0,
            stream_count: 0,
            script_init_pending: false,
            current_instrument: None,
            next_instrument: ArcSwapOption::empty(),
            instrument_changed: AtomicFlag::new(false),
            rpn: None,
            nrpn: None,
        }
    }

    /// The input producer for a MIDI driver; available exactly once.
    pub fn event_sender(&mut self) -> Option<EventSender> {
        self.sender.take().map(|tx| EventSender { tx })
    }

    pub(crate) fn input(&mut self) -> &mut RingConsumer<Event> {
        &mut self.input
    }

    /// Register an in-process virtual MIDI device on this channel.
    pub fn add_virtual_device(&mut self, capacity: usize) -> VirtualMidiPort {
        let (host, port) = virtual_midi_device(capacity);
        self.virtual_devices.push(host);
        port
    }

    /// Request an instrument switch from a loader thread. The audio thread
    /// picks it up at the next fragment boundary; it never observes a torn
    /// binding.
    pub fn schedule_instrument_change(&self, binding: InstrumentBinding) {
        self.next_instrument.store(Some(Arc::new(binding)));
        self.instrument_changed.set(true);
    }

    /// Audio-thread side of the config switch. Returns `true` when a new
    /// binding was installed; the caller then orphans the old voices.
    pub fn take_pending_instrument(&mut self) -> bool {
        if !self.instrument_changed.swap(false) {
            return false;
        }
        let next = self.next_instrument.swap(None);
        self.script_init_pending = next
            .as_ref()
            .is_some_and(|b| b.script.as_ref().is_some_and(|s| s.on_init.is_some()));
        self.current_instrument = next;
        true
    }

    pub fn instrument(&self) -> Option<&Arc<InstrumentBinding>> {
        self.current_instrument.as_ref()
    }

    /// Linear gain from CC7.
    pub fn volume(&self) -> f32 {
        self.controllers[7] as f32 / 127.0
    }

    /// Pitch factor from the wheel position and configured bend range.
    pub fn pitch_bend_factor(&self) -> f32 {
        let semitones = self.pitch_bend as f32 / 8192.0 * self.pitch_bend_range as f32;
        2.0f32.powf(semitones / 12.0)
    }

    /// Absorb a control change into the channel state and report what the
    /// engine still has to do about it.
    pub fn apply_control_change(&mut self, controller: u8, value: u8) -> CcEffect {
        self.controllers[controller as usize] = value;
        match controller {
            5 => {
                self.portamento_time_s = PORTAMENTO_TIME_MIN_S
                    + value as f32 / 127.0 * (PORTAMENTO_TIME_MAX_S - PORTAMENTO_TIME_MIN_S);
                CcEffect::None
            }
            6 => self.apply_data_entry(value),
            65 => {
                self.portamento_mode = value >= 64;
                CcEffect::None
            }
            64 => {
                if value >= 64 {
                    if !self.keyboard.sustain_pedal {
                        self.keyboard.sustain_pedal = true;
                        return CcEffect::SustainDown;
                    }
                } else if self.keyboard.sustain_pedal {
                    self.keyboard.sustain_pedal = false;
                    return CcEffect::SustainUp;
                }
                CcEffect::None
            }
            66 => {
                if value >= 64 {
                    if !self.keyboard.sostenuto_pedal {
                        self.keyboard.sostenuto_down();
                        return CcEffect::SostenutoDown;
                    }
                } else if self.keyboard.sostenuto_pedal {
                    self.keyboard.sostenuto_up();
                    return CcEffect::SostenutoUp;
                }
                CcEffect::None
            }
            98 => {
                self.nrpn = Some((self.nrpn.unwrap_or(0) & !0x7F) | value as u16);
                self.rpn = None;
                CcEffect::None
            }
            99 => {
                self.nrpn = Some((self.nrpn.unwrap_or(0) & 0x7F) | ((value as u16) << 7));
                self.rpn = None;
                CcEffect::None
            }
            100 => {
                self.rpn = Some((self.rpn.unwrap_or(0) & !0x7F) | value as u16);
                self.nrpn = None;
                CcEffect::None
            }
            101 => {
                self.rpn = Some((self.rpn.unwrap_or(0) & 0x7F) | ((value as u16) << 7));
                self.nrpn = None;
                CcEffect::None
            }
            120 => CcEffect::AllSoundOff,
            121 => {
                self.reset_controllers();
                CcEffect::ResetControllers
            }
            123 => CcEffect::AllNotesOff,
            _ => CcEffect::None,
        }
    }

    fn apply_data_entry(&mut self, value: u8) -> CcEffect {
        if let Some(nrpn) = self.nrpn {
            let msb = (nrpn >> 7) as u8;
            let key = (nrpn & 0x7F) as u8;
            match msb {
                // per-key volume
                0x1A => {
                    self.keyboard.keys[key as usize].volume = value as f32 / 127.0;
                }
                // per-key pan
                0x1C => {
                    self.keyboard.keys[key as usize].pan = (value as f32 - 64.0) / 64.0;
                }
                _ => {}
            }
            // prevent following CC6 values being misread as the same target
            self.nrpn = None;
            return CcEffect::None;
        }
        if let Some(rpn) = self.rpn {
            match rpn {
                // pitch bend range in semitones
                0 => {
                    self.pitch_bend_range = value.min(24);
                }
                // coarse tuning, limited to +- two octaves
                2 => {
                    self.transpose = (value as i32 - 64).clamp(-24, 24);
                    self.rpn = None;
                    return CcEffect::TransposeChanged;
                }
                _ => {}
            }
            self.rpn = None;
        }
        CcEffect::None
    }

    /// CC121: back to power-on controller values.
    pub fn reset_controllers(&mut self) {
        self.controllers = [0; 128];
        self.controllers[7] = 127;
        self.pitch_bend = 0;
        self.rpn = None;
        self.nrpn = None;
        self.keyboard.sustain_pedal = false;
        self.keyboard.sostenuto_up();
        self.keyboard.sostenuto_pedal = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::ZoneInstrument;

    fn channel() -> EngineChannel {
        EngineChannel::new(0, 64)
    }

    #[test]
    fn test_event_sender_available_once() {
        let mut ch = channel();
        let mut sender = ch.event_sender().unwrap();
        assert!(ch.event_sender().is_none());
        assert!(sender.note_on(60, 100, 0));
        assert_eq!(ch.input().read_space(), 1);
    }

    #[test]
    fn test_sustain_pedal_edges() {
        let mut ch = channel();
        assert_eq!(ch.apply_control_change(64, 127), CcEffect::SustainDown);
        // repeated down is absorbed
        assert_eq!(ch.apply_control_change(64, 100), CcEffect::None);
        assert_eq!(ch.apply_control_change(64, 0), CcEffect::SustainUp);
        assert!(!ch.keyboard.sustain_pedal);
    }

    #[test]
    fn test_rpn_pitch_bend_range_and_transpose() {
        let mut ch = channel();
        // RPN 0 -> bend range 12
        ch.apply_control_change(101, 0);
        ch.apply_control_change(100, 0);
        assert_eq!(ch.apply_control_change(6, 12), CcEffect::None);
        assert_eq!(ch.pitch_bend_range, 12);

        // RPN 2 -> coarse tune +7, releases voices
        ch.apply_control_change(101, 0);
        ch.apply_control_change(100, 2);
        assert_eq!(ch.apply_control_change(6, 71), CcEffect::TransposeChanged);
        assert_eq!(ch.transpose, 7);

        // extreme values clamp to two octaves
        ch.apply_control_change(101, 0);
        ch.apply_control_change(100, 2);
        ch.apply_control_change(6, 127);
        assert_eq!(ch.transpose, 24);
    }

    #[test]
    fn test_nrpn_per_key_overrides() {
        let mut ch = channel();
        // key 60 volume to half
        ch.apply_control_change(99, 0x1A);
        ch.apply_control_change(98, 60);
        ch.apply_control_change(6, 64);
        assert!((ch.keyboard.keys[60].volume - 64.0 / 127.0).abs() < 1e-6);

        // key 60 pan hard left
        ch.apply_control_change(99, 0x1C);
        ch.apply_control_change(98, 60);
        ch.apply_control_change(6, 0);
        assert_eq!(ch.keyboard.keys[60].pan, -1.0);
    }

    #[test]
    fn test_pitch_bend_factor() {
        let mut ch = channel();
        assert_eq!(ch.pitch_bend_factor(), 1.0);
        ch.pitch_bend = 8191;
        // ~2 semitones up with the default range
        assert!((ch.pitch_bend_factor() - 2.0f32.powf(2.0 / 12.0)).abs() < 1e-3);
        ch.pitch_bend = -8192;
        assert!((ch.pitch_bend_factor() - 2.0f32.powf(-2.0 / 12.0)).abs() < 1e-3);
    }

    #[test]
    fn test_instrument_switch_is_deferred_until_taken() {
        let mut ch = channel();
        assert!(ch.instrument().is_none());
        ch.schedule_instrument_change(InstrumentBinding {
            instrument: Arc::new(ZoneInstrument::new()),
            script: None,
        });
        // not visible until the audio thread flips
        assert!(ch.instrument().is_none());
        assert!(ch.take_pending_instrument());
        assert!(ch.instrument().is_some());
        assert!(!ch.take_pending_instrument());
    }
}
