//! End-to-end tests driving the sampler through whole fragments.

use approx::assert_relative_eq;
use ripieno::{
    EngineConfig, Instrument, MemorySample, RegionData, RegionQuery, ReleaseTrigger, Sampler,
    ScriptAction, ScriptContext, ScriptProgram, ScriptStatus, SynthDefaults, ZoneInstrument,
};
use ripieno_engine::RegionSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const RATE: u32 = 48000;
const FRAG: usize = 256;

fn frag_us(n: u64) -> u64 {
    (n as f64 * FRAG as f64 * 1e6 / RATE as f64) as u64
}

fn dc_region(value: f32, len: usize) -> RegionData {
    let sample = Arc::new(MemorySample::new(vec![value; len]));
    let mut region = RegionData::new(sample, 1 << 20);
    region.defaults = SynthDefaults {
        attack_s: 0.0,
        decay_s: 0.0,
        sustain_level: 1.0,
        release_s: 0.001,
        ..Default::default()
    };
    region
}

fn simple_sampler(instrument: Arc<dyn Instrument>) -> Sampler {
    let mut sampler = Sampler::builder()
        .sample_rate(RATE)
        .channels(1)
        .build()
        .unwrap();
    let id = sampler.register_instrument(instrument);
    sampler.bind_instrument(0, id).unwrap();
    sampler
}

fn render(sampler: &mut Sampler, n: u64) -> Vec<f32> {
    let mut l = vec![0.0f32; FRAG];
    let mut r = vec![0.0f32; FRAG];
    sampler.render(&mut l, &mut r, frag_us(n));
    l
}

/// Release-region lookup that records what CC64 value it was shown, so the
/// pedal-up discipline is observable.
struct PedalAwareInstrument {
    inner: ZoneInstrument,
    release: Arc<RegionData>,
    seen_cc64: AtomicU8,
}

impl Instrument for PedalAwareInstrument {
    fn regions(&self, query: &RegionQuery) -> RegionSet {
        self.inner.regions(query)
    }

    fn release_regions(&self, query: &RegionQuery) -> RegionSet {
        self.seen_cc64.store(query.controller(64), Ordering::Relaxed);
        let mut set = RegionSet::new();
        set.push(Arc::clone(&self.release));
        set
    }
}

#[test]
fn test_sustain_pedal_scenario() {
    // normal region declares sustain-pedal release triggers
    let mut region = dc_region(0.5, 1 << 20);
    region.release_trigger = ReleaseTrigger {
        sustain_max_velocity: true,
        ..Default::default()
    };
    let mut inner = ZoneInstrument::new();
    inner.add_zone((0, 127), (1, 127), Arc::new(region));
    let instrument = Arc::new(PedalAwareInstrument {
        inner,
        release: Arc::new(dc_region(0.1, 4096)),
        seen_cc64: AtomicU8::new(255),
    });
    let mut sampler = simple_sampler(instrument.clone());
    let mut input = sampler.event_sender(0).unwrap();

    // pedal down, then play and physically release C4 D4 E4
    input.control_change(64, 127, 0);
    input.note_on(60, 100, 10);
    input.note_on(62, 100, 20);
    input.note_on(64, 100, 30);
    render(&mut sampler, 0);
    assert_eq!(sampler.engine().active_voice_count(), 3);

    input.note_off(60, 0, frag_us(1));
    input.note_off(62, 0, frag_us(1));
    input.note_off(64, 0, frag_us(1));
    render(&mut sampler, 1);
    // all three keys are pedal-held: no voice entered release
    assert_eq!(sampler.engine().active_voice_count(), 3);
    // no release regions were consulted yet
    assert_eq!(instrument.seen_cc64.load(Ordering::Relaxed), 255);

    // pedal up: all three release simultaneously and release-trigger
    // voices spawn
    input.control_change(64, 0, frag_us(2));
    render(&mut sampler, 2);

    // region selection observed CC64 as still down (forced to 127), even
    // though the channel's controller table already shows pedal up
    assert_eq!(instrument.seen_cc64.load(Ordering::Relaxed), 127);
    assert_eq!(sampler.engine().channel(0).unwrap().controllers[64], 0);

    // the 1ms releases finish; only the three release-trigger voices
    // (4096-frame samples) keep sounding
    render(&mut sampler, 3);
    assert_eq!(sampler.engine().active_voice_count(), 3);

    // release samples play out by themselves
    for n in 4..24 {
        render(&mut sampler, n);
    }
    assert_eq!(sampler.engine().active_voice_count(), 0);
}

#[test]
fn test_script_wait_spawns_child_note_sample_accurately() {
    let mut inner = ZoneInstrument::new();
    inner.add_zone((0, 127), (1, 127), Arc::new(dc_region(0.5, 1 << 20)));

    // on note { wait(1000); play_note($EVENT_NOTE + 12) }
    let on_note: Arc<dyn ripieno::ScriptHandler> = Arc::new(|ctx: &mut ScriptContext| {
        ctx.consume(2);
        if ctx.resume_point == 0 {
            ctx.resume_point = 1;
            return ScriptStatus::Suspended { resume_us: 1000 };
        }
        let key = ctx.cause.note().map(|n| n.key).unwrap_or(0);
        let velocity = ctx.cause.note().map(|n| n.velocity).unwrap_or(0);
        ctx.emit(ScriptAction::PlayNote {
            key: key + 12,
            velocity,
            delay_us: 0,
        });
        ScriptStatus::Finished
    });
    let script = ScriptProgram {
        on_note: Some(on_note),
        ..Default::default()
    };

    let mut sampler = Sampler::builder()
        .sample_rate(RATE)
        .channels(1)
        .build()
        .unwrap();
    let id = sampler.register_instrument(Arc::new(inner));
    sampler
        .bind_instrument_with_script(0, id, Some(script))
        .unwrap();
    let mut input = sampler.event_sender(0).unwrap();

    input.note_on(60, 127, 0);
    let left = render(&mut sampler, 0);

    // 1000us at 48kHz = exactly 48 samples: parent alone before, parent
    // plus child after
    assert_eq!(sampler.engine().active_voice_count(), 2);
    let one = 0.5 * std::f32::consts::FRAC_1_SQRT_2;
    assert_relative_eq!(left[47], one, epsilon = 1e-4);
    assert_relative_eq!(left[48], 2.0 * one, epsilon = 1e-4);
}

#[test]
fn test_sixtyfive_notes_on_sixtyfour_voices() {
    let mut inner = ZoneInstrument::new();
    inner.add_zone((0, 127), (1, 127), Arc::new(dc_region(0.01, 1 << 20)));
    let config = EngineConfig {
        sample_rate: RATE,
        max_voices: 64,
        max_notes: 128,
        ..Default::default()
    };
    let mut sampler = Sampler::builder()
        .config(config)
        .channels(1)
        .build()
        .unwrap();
    let id = sampler.register_instrument(Arc::new(inner));
    sampler.bind_instrument(0, id).unwrap();
    let mut input = sampler.event_sender(0).unwrap();

    for key in 0..64u8 {
        input.note_on(key, 100, 0);
    }
    let left = render(&mut sampler, 0);
    assert_eq!(sampler.engine().active_voice_count(), 64);
    assert!(left.iter().any(|&v| v != 0.0), "audio is flowing");

    // the 65th note steals the oldest voice; the count never exceeds 64
    input.note_on(100, 100, frag_us(1));
    render(&mut sampler, 1);
    assert!(sampler.engine().active_voice_count() <= 64);
    render(&mut sampler, 2);
    assert_eq!(sampler.engine().active_voice_count(), 64);

    let snap = sampler.engine().metrics().snapshot();
    assert_eq!(snap.voices_stolen, 1);
}

#[test]
fn test_all_simultaneous_notes_cap_without_steal() {
    // voices spawned in the current fragment are not stealable, so a
    // same-fragment overflow drops the surplus instead of clicking
    let mut inner = ZoneInstrument::new();
    inner.add_zone((0, 127), (1, 127), Arc::new(dc_region(0.01, 1 << 20)));
    let config = EngineConfig {
        sample_rate: RATE,
        max_voices: 16,
        max_notes: 64,
        ..Default::default()
    };
    let mut sampler = Sampler::builder()
        .config(config)
        .channels(1)
        .build()
        .unwrap();
    let id = sampler.register_instrument(Arc::new(inner));
    sampler.bind_instrument(0, id).unwrap();
    let mut input = sampler.event_sender(0).unwrap();

    for key in 0..17u8 {
        input.note_on(key, 100, 0);
    }
    render(&mut sampler, 0);
    assert_eq!(sampler.engine().active_voice_count(), 16);
    let snap = sampler.engine().metrics().snapshot();
    assert_eq!(snap.voices_stolen, 0);
    assert!(snap.steal_failures >= 1);
}

#[test]
fn test_virtual_device_injection_and_feedback() {
    let mut inner = ZoneInstrument::new();
    inner.add_zone((0, 127), (1, 127), Arc::new(dc_region(0.5, 1 << 20)));
    let mut sampler = simple_sampler(Arc::new(inner));
    let mut port = sampler.add_virtual_device(0, 64).unwrap();
    let mut input = sampler.event_sender(0).unwrap();

    // injected events flow through the normal ingestion path, and the
    // device sees its own note echoed like any other listener
    port.send_note_on(60, 100, 0);
    render(&mut sampler, 0);
    assert_eq!(sampler.engine().active_voice_count(), 1);
    assert_eq!(
        port.next_notification(),
        Some(ripieno::NoteNotification::NoteOn {
            key: 60,
            velocity: 100
        })
    );

    // a driver note-on is echoed back to the GUI listener
    input.note_on(64, 90, frag_us(1));
    render(&mut sampler, 1);
    assert_eq!(
        port.next_notification(),
        Some(ripieno::NoteNotification::NoteOn {
            key: 64,
            velocity: 90
        })
    );
    assert_eq!(port.next_notification(), None);
}

#[test]
fn test_fx_send_receives_voice_signal() {
    struct PassthroughChain {
        left: Vec<f32>,
        right: Vec<f32>,
    }
    impl ripieno::EffectChain for PassthroughChain {
        fn mix_input(&mut self, left: &[f32], right: &[f32]) {
            self.left[..left.len()].copy_from_slice(left);
            self.right[..right.len()].copy_from_slice(right);
        }
        fn render(&mut self, _frames: usize) {}
        fn tail(&self) -> (&[f32], &[f32]) {
            (&self.left, &self.right)
        }
    }

    let mut region = dc_region(0.5, 1 << 20);
    region.defaults.fx_send = 1.0;
    let mut inner = ZoneInstrument::new();
    inner.add_zone((0, 127), (1, 127), Arc::new(region));
    let mut sampler = simple_sampler(Arc::new(inner));
    sampler
        .engine_mut()
        .add_fx_send(
            0,
            1.0,
            Box::new(PassthroughChain {
                left: vec![0.0; 2048],
                right: vec![0.0; 2048],
            }),
        )
        .unwrap();
    let mut input = sampler.event_sender(0).unwrap();

    input.note_on(60, 127, 0);
    let left = render(&mut sampler, 0);
    // dry + 100% wet passthrough doubles the signal
    let dry = 0.5 * std::f32::consts::FRAC_1_SQRT_2;
    assert_relative_eq!(left[10], 2.0 * dry, epsilon = 1e-4);
}
