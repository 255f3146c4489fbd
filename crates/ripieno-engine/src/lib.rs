//! The Ripieno sampling engine core.
//!
//! Given MIDI input events and pre-loaded instruments, produces audio
//! output at deterministic low latency:
//!
//! - **Engine / EngineChannel**: per-fragment render loop, event dispatch,
//!   per-MIDI-channel state and instrument binding
//! - **Note / Voice**: lifecycle of sounding samples, voice stealing
//! - **DiskThread / streams**: background refill of ring buffers for
//!   samples exceeding the RAM prefetch window
//! - **Scripts**: cooperative real-time instrument script host
//!
//! Driver adapters, instrument file parsers and control protocols live
//! outside this crate; they talk to the engine through [`EventSender`],
//! [`Instrument`] and the output buffers handed to [`Engine::render`].

pub mod instrument;
pub use instrument::{
    Instrument, InstrumentId, InstrumentManager, LoopDescriptor, MemorySample, RegionData,
    RegionQuery, RegionSet, ReleaseTrigger, SampleSource, SynthDefaults, ZoneInstrument,
};

mod stream;
pub use stream::{stream_pair, StreamHandle, StreamReader, StreamState, StreamWriter};

mod disk;
pub use disk::{post_command, DiskCommand, DiskConfig, DiskThread};

mod note;
pub use note::{Note, NoteOverrides};

mod voice;
pub use voice::{PlaybackState, Voice, VoiceRenderCtx, VoiceTrigger, VoiceType};

mod keyboard;
pub use keyboard::{MidiKey, MidiKeyboard, KEY_COUNT};

mod channel;
pub use channel::{CcEffect, EngineChannel, EventSender, InstrumentBinding};

mod engine;
pub use engine::Engine;

pub mod script;
pub use script::{
    HandlerPhase, ScriptAction, ScriptContext, ScriptEvent, ScriptHandler, ScriptProgram,
    ScriptRunner, ScriptStatus,
};

mod fx;
pub use fx::{EffectChain, FxSend};

mod virt;
pub use virt::{virtual_midi_device, NoteNotification, VirtualMidiHost, VirtualMidiPort};

mod metrics;
pub use metrics::{EngineMetrics, MetricsSnapshot};

mod output;
pub use output::{MixBuffers, StereoOut};
