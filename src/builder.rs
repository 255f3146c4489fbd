//! Top-level sampler facade and its builder.

use ripieno_core::{EngineConfig, Error, Result, VoiceStealPolicy, WallTime};
use ripieno_engine::{
    Engine, EventSender, Instrument, InstrumentBinding, InstrumentId, RegionData, ScriptProgram,
    StereoOut, VirtualMidiPort,
};
use std::sync::Arc;

/// Builder for a [`Sampler`].
///
/// # Example
///
/// ```no_run
/// # fn main() -> ripieno::Result<()> {
/// let sampler = ripieno::Sampler::builder()
///     .sample_rate(44100)
///     .max_voices(64)
///     .max_disk_streams(90)
///     .channels(2)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SamplerBuilder {
    config: EngineConfig,
    channels: usize,
}

impl Default for SamplerBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            channels: 1,
        }
    }
}

impl SamplerBuilder {
    pub fn sample_rate(mut self, sample_rate: u32) -> Self {
        self.config.sample_rate = sample_rate;
        self
    }

    pub fn max_voices(mut self, voices: usize) -> Self {
        self.config.max_voices = voices;
        self.config.max_notes = voices;
        self
    }

    pub fn max_disk_streams(mut self, streams: usize) -> Self {
        self.config.max_disk_streams = streams;
        self
    }

    pub fn voice_steal_policy(mut self, policy: VoiceStealPolicy) -> Self {
        self.config.voice_steal_policy = policy;
        self
    }

    pub fn channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    /// Override the full engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Sampler> {
        let mut engine = Engine::new(self.config)?;
        for _ in 0..self.channels {
            engine.add_channel();
        }
        Ok(Sampler { engine })
    }
}

/// A ready-to-render sampler: one engine plus its instrument registry.
pub struct Sampler {
    engine: Engine,
}

impl Sampler {
    pub fn builder() -> SamplerBuilder {
        SamplerBuilder::default()
    }

    /// Register an instrument with the engine's resource manager.
    pub fn register_instrument(&self, instrument: Arc<dyn Instrument>) -> InstrumentId {
        self.engine.instruments().register(instrument)
    }

    /// Bind a registered instrument to a channel.
    pub fn bind_instrument(&mut self, channel: usize, id: InstrumentId) -> Result<()> {
        self.bind_instrument_with_script(channel, id, None)
    }

    /// Bind a registered instrument plus a real-time script to a channel.
    pub fn bind_instrument_with_script(
        &mut self,
        channel: usize,
        id: InstrumentId,
        script: Option<ScriptProgram>,
    ) -> Result<()> {
        let instrument = self.engine.instruments().get(id).ok_or(Error::InvalidId)?;
        self.engine
            .load_instrument(channel, InstrumentBinding { instrument, script })
    }

    pub fn event_sender(&mut self, channel: usize) -> Option<EventSender> {
        self.engine.event_sender(channel)
    }

    /// Build a region for `sample` with the engine's configured RAM
    /// prefetch window; playback past the window streams from storage.
    pub fn make_region(&self, sample: Arc<dyn ripieno_engine::SampleSource>) -> RegionData {
        RegionData::new(sample, self.engine.config().ram_prefetch_frames)
    }

    pub fn add_virtual_device(&mut self, channel: usize, capacity: usize) -> Option<VirtualMidiPort> {
        self.engine.add_virtual_device(channel, capacity)
    }

    /// Render one fragment of `left.len()` frames starting at wall-clock
    /// time `now` (microseconds, same clock as event timestamps).
    pub fn render(&mut self, left: &mut [f32], right: &mut [f32], now: WallTime) {
        let mut out = StereoOut::new(left, right);
        self.engine.render(&mut out, now);
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripieno_engine::ZoneInstrument;

    #[test]
    fn test_builder_validates_config() {
        let result = Sampler::builder().sample_rate(100).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_creates_channels() {
        let sampler = Sampler::builder().channels(3).build().unwrap();
        assert_eq!(sampler.engine().channel_count(), 3);
    }

    #[test]
    fn test_bind_unknown_instrument_fails() {
        let mut sampler = Sampler::builder().build().unwrap();
        let bogus = InstrumentId(9999);
        assert!(sampler.bind_instrument(0, bogus).is_err());
    }

    #[test]
    fn test_register_and_bind() {
        let mut sampler = Sampler::builder().build().unwrap();
        let id = sampler.register_instrument(Arc::new(ZoneInstrument::new()));
        assert!(sampler.bind_instrument(0, id).is_ok());
        // binding is picked up at the next fragment boundary
        let (mut l, mut r) = (vec![0.0; 64], vec![0.0; 64]);
        sampler.render(&mut l, &mut r, 0);
        assert!(sampler.engine().channel(0).unwrap().instrument().is_some());
    }
}
