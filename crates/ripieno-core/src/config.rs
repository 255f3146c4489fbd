//! Engine configuration.

use crate::{Error, Result};

/// Which voice is sacrificed when the voice pool runs dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceStealPolicy {
    /// Never steal; surplus note-ons are dropped.
    None,
    /// Oldest stealable voice on the triggering key, falling back to
    /// [`VoiceStealPolicy::OldestKey`] when the key has none.
    #[default]
    OldestVoiceOnKey,
    /// Oldest stealable voice on the oldest active key, round-robin
    /// across engine channels.
    OldestKey,
}

/// Configuration for the sampler engine, passed at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sample_rate: u32,
    /// Upper bound of concurrently sounding voices (voice pool size).
    pub max_voices: usize,
    /// Note pool size. One note groups all voices spawned by one cause.
    pub max_notes: usize,
    /// Event pool size shared by all channels of the engine.
    pub max_events: usize,
    /// Script event pool size (suspended callback instances).
    pub max_script_events: usize,
    /// Disk stream slots (voices whose sample exceeds the RAM window).
    pub max_disk_streams: usize,
    /// Capacity of each stream's refill ring, in frames.
    pub stream_ring_frames: usize,
    /// Below this many buffered frames a stream is considered urgent.
    pub stream_min_refill: usize,
    /// Upper bound of frames read from storage per refill of one stream.
    pub stream_max_refill: usize,
    /// How many streams the disk thread refills per cycle.
    pub refill_streams_per_run: usize,
    /// Frames of each sample kept in RAM; playback beyond streams from disk.
    pub ram_prefetch_frames: u64,
    /// Shortest release used for instant fade-outs (voice stealing, kills).
    pub min_release_time_s: f32,
    /// Largest fragment the driver may ask for.
    pub max_samples_per_cycle: u32,
    pub voice_steal_policy: VoiceStealPolicy,
    /// Per-fragment script instruction budget.
    pub script_instruction_budget: u32,
    /// fork() children allowed per handler instance.
    pub max_fork_per_handler: u32,
    /// Capacity of each channel's MIDI input ring.
    pub input_queue_size: usize,
    /// Default for new channels: keep rendering a muted channel's voices
    /// (silently) instead of dropping its note events outright.
    pub process_muted_channels: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            max_voices: 64,
            max_notes: 64,
            max_events: 1024,
            max_script_events: 256,
            max_disk_streams: 90,
            stream_ring_frames: 32768,
            stream_min_refill: 1024,
            stream_max_refill: 8192,
            refill_streams_per_run: 4,
            ram_prefetch_frames: 32768,
            min_release_time_s: 0.0025,
            max_samples_per_cycle: 2048,
            voice_steal_policy: VoiceStealPolicy::default(),
            script_instruction_budget: 5000,
            max_fork_per_handler: 8,
            input_queue_size: 1024,
            process_muted_channels: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate < 8000 || self.sample_rate > 384_000 {
            return Err(Error::InvalidConfig(format!(
                "sample_rate {} out of range (8000-384000 Hz)",
                self.sample_rate
            )));
        }
        if self.max_voices == 0 || self.max_notes == 0 || self.max_events == 0 {
            return Err(Error::InvalidConfig(
                "pool sizes must be non-zero".into(),
            ));
        }
        if self.stream_min_refill >= self.stream_max_refill {
            return Err(Error::InvalidConfig(format!(
                "stream_min_refill {} must be below stream_max_refill {}",
                self.stream_min_refill, self.stream_max_refill
            )));
        }
        if self.stream_max_refill > self.stream_ring_frames {
            return Err(Error::InvalidConfig(format!(
                "stream_max_refill {} exceeds ring capacity {}",
                self.stream_max_refill, self.stream_ring_frames
            )));
        }
        if self.max_samples_per_cycle == 0 {
            return Err(Error::InvalidConfig(
                "max_samples_per_cycle must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Samples needed for an instant fade-out without an audible click.
    /// Clamped to one fragment so a kill never outlives the cycle budget.
    pub fn min_fade_out_samples(&self) -> u32 {
        let samples = (self.sample_rate as f64 * self.min_release_time_s as f64) as u32;
        samples.saturating_sub(1).clamp(1, self.max_samples_per_cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.max_voices, 64);
    }

    #[test]
    fn test_bad_sample_rate_rejected() {
        let config = EngineConfig {
            sample_rate: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_refill_bounds_checked() {
        let config = EngineConfig {
            stream_min_refill: 8192,
            stream_max_refill: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_fade_out_clamped_to_cycle() {
        let config = EngineConfig {
            min_release_time_s: 1.0,
            max_samples_per_cycle: 512,
            ..Default::default()
        };
        assert_eq!(config.min_fade_out_samples(), 512);
    }
}
