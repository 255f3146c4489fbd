//! # Ripieno - Real-time Streaming Sampler Engine
//!
//! Umbrella crate over the engine subsystems:
//! - **ripieno-core** - pools, rings, the fragment clock and event types
//! - **ripieno-engine** - voices, notes, channels, disk streaming, scripts
//!
//! ## Quick Start
//!
//! ```no_run
//! use ripieno::{Sampler, ZoneInstrument};
//! use std::sync::Arc;
//!
//! # fn main() -> ripieno::Result<()> {
//! let mut sampler = Sampler::builder()
//!     .sample_rate(48000)
//!     .max_voices(64)
//!     .channels(1)
//!     .build()?;
//!
//! let id = sampler.register_instrument(Arc::new(ZoneInstrument::new()));
//! sampler.bind_instrument(0, id)?;
//! let mut input = sampler.event_sender(0).expect("input port");
//!
//! input.note_on(60, 100, 0);
//! let (mut left, mut right) = (vec![0.0; 512], vec![0.0; 512]);
//! sampler.render(&mut left, &mut right, 0);
//! # Ok(())
//! # }
//! ```

/// Re-export of ripieno-core for direct access
pub use ripieno_core as core;
/// Re-export of ripieno-engine for direct access
pub use ripieno_engine as engine;

// Core types
pub use ripieno_core::{
    // Pools and lists
    ElementId, Pool, RtList, Token,

    // Rings
    ring_buffer, RingConsumer, RingProducer,

    // Clock and scheduling
    EventClock, SchedTime, ScheduledQueue, WallTime,

    // Events
    Event, EventId, EventKind, EventPayload, FadeCurve, NoteEvent, NoteId, SynthParam,

    // Lock-free primitives
    AtomicDouble, AtomicFlag, AtomicFloat,

    // Config
    EngineConfig, VoiceStealPolicy,

    // Error
    Error, Result,
};

// Engine types
pub use ripieno_engine::{
    Engine, EngineChannel, EngineMetrics, EventSender, MetricsSnapshot,
    Instrument, InstrumentBinding, InstrumentId, InstrumentManager,
    LoopDescriptor, MemorySample, RegionData, RegionQuery, ReleaseTrigger,
    SampleSource, SynthDefaults, ZoneInstrument,
    Note, NoteOverrides, PlaybackState, Voice, VoiceType,
    EffectChain, FxSend, StereoOut,
    HandlerPhase, ScriptAction, ScriptContext, ScriptHandler, ScriptProgram, ScriptStatus,
    NoteNotification, VirtualMidiPort,
};

mod builder;
pub use builder::{Sampler, SamplerBuilder};
