//! Allocation and timing primitives for the Ripieno sampler engine.
//!
//! Everything the audio thread allocates goes through the fixed-capacity
//! [`Pool`]; everything crossing a thread boundary goes through an SPSC
//! [`ring`](ring_buffer) or an atomic from [`lockfree`]; everything timed
//! goes through the [`EventClock`].

pub mod error;
pub use error::{Error, Result};

mod config;
pub use config::{EngineConfig, VoiceStealPolicy};

mod lockfree;
pub use lockfree::{AtomicDouble, AtomicFlag, AtomicFloat};

mod pool;
pub use pool::{ElementId, Pool, RtList, Token};

mod ring;
pub use ring::{ring_buffer, RingConsumer, RingProducer};

mod clock;
pub use clock::{EventClock, SchedTime, ScheduledQueue, WallTime};

mod event;
pub use event::{
    CcEvent, Event, EventId, EventKind, EventPayload, FadeCurve, NoteEvent, NoteId,
    NotePressureEvent, PitchBendEvent, PressureEvent, ScriptCallbackId, SynthParam,
    SynthParamEvent,
};
