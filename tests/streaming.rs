//! Disk-streaming tests with the real disk thread in the loop.

use ripieno::{
    EngineConfig, MemorySample, RegionData, Sampler, SynthDefaults, ZoneInstrument,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const RATE: u32 = 44100;
const FRAG: usize = 512;

fn frag_us(n: u64) -> u64 {
    (n as f64 * FRAG as f64 * 1e6 / RATE as f64) as u64
}

#[test]
fn test_long_sample_streams_from_disk_gapless() {
    let total = 200_000usize;
    let sample = Arc::new(MemorySample::new((0..total).map(|i| i as f32 * 1e-6).collect()));
    let mut region = RegionData::new(sample, 8192);
    region.defaults = SynthDefaults {
        attack_s: 0.0,
        decay_s: 0.0,
        sustain_level: 1.0,
        release_s: 0.001,
        ..Default::default()
    };
    let mut instrument = ZoneInstrument::new();
    instrument.add_zone((0, 127), (1, 127), Arc::new(region));

    let config = EngineConfig {
        sample_rate: RATE,
        ram_prefetch_frames: 8192,
        stream_ring_frames: 32768,
        ..Default::default()
    };
    let mut sampler = Sampler::builder().config(config).channels(1).build().unwrap();
    let id = sampler.register_instrument(Arc::new(instrument));
    sampler.bind_instrument(0, id).unwrap();
    let mut input = sampler.event_sender(0).unwrap();

    input.note_on(60, 127, 0);

    let pan = std::f32::consts::FRAC_1_SQRT_2;
    let mut produced: Vec<f32> = Vec::with_capacity(total + FRAG);
    let mut l = vec![0.0f32; FRAG];
    let mut r = vec![0.0f32; FRAG];
    let fragments = (total / FRAG) + 4;
    for n in 0..fragments as u64 {
        sampler.render(&mut l, &mut r, frag_us(n));
        produced.extend_from_slice(&l);
        // slower than real-time; the disk thread keeps the ring ahead
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(sampler.engine().active_voice_count(), 0, "sample played out");

    // every produced frame matches the source, across the RAM/disk
    // boundary at frame 8192 and through every refill
    for (i, &got) in produced.iter().take(total).enumerate() {
        let expected = i as f32 * 1e-6 * pan;
        assert!(
            (got - expected).abs() < 1e-6,
            "frame {i}: got {got}, expected {expected}"
        );
    }
    // and silence after the end
    assert!(produced[total + FRAG..].iter().all(|&v| v == 0.0));

    // the voice's stream teardown is acknowledged by the disk thread
    let metrics = sampler.engine().metrics();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while metrics.snapshot().streams_deleted < 1 {
        assert!(std::time::Instant::now() < deadline, "teardown not confirmed");
        thread::sleep(Duration::from_millis(1));
    }
    let snap = metrics.snapshot();
    assert_eq!(snap.stream_underruns, 0, "no refill fell behind");
    assert_eq!(snap.streams_launched, 1);
}

#[test]
fn test_suspend_resume_with_streaming_voice() {
    let config = EngineConfig {
        sample_rate: RATE,
        ram_prefetch_frames: 2048,
        ..Default::default()
    };
    let mut sampler = Sampler::builder().config(config).channels(1).build().unwrap();

    let sample = Arc::new(MemorySample::new(vec![0.5f32; 1 << 18]));
    let region = sampler.make_region(sample);
    let mut instrument = ZoneInstrument::new();
    instrument.add_zone((0, 127), (1, 127), Arc::new(region));
    let id = sampler.register_instrument(Arc::new(instrument));
    sampler.bind_instrument(0, id).unwrap();
    let mut input = sampler.event_sender(0).unwrap();

    input.note_on(60, 100, 0);
    let mut l = vec![0.0f32; FRAG];
    let mut r = vec![0.0f32; FRAG];
    sampler.render(&mut l, &mut r, frag_us(0));
    assert_eq!(sampler.engine().active_voice_count(), 1);
    assert_eq!(sampler.engine().active_disk_stream_count(), 1);

    // returns only once the disk thread has confirmed the teardown
    sampler.engine_mut().suspend_all();
    assert_eq!(sampler.engine().active_disk_stream_count(), 0);
    assert_eq!(sampler.engine().metrics().snapshot().streams_deleted, 1);

    // while suspended, rendering produces silence
    sampler.render(&mut l, &mut r, frag_us(1));
    assert!(l.iter().all(|&v| v == 0.0));

    sampler.engine_mut().resume_all();
    input.note_on(62, 100, frag_us(10));
    sampler.render(&mut l, &mut r, frag_us(10));
    assert_eq!(sampler.engine().active_voice_count(), 1);
}
