//! The sampling engine: pools, event dispatch, voice rendering, stealing.
//!
//! One `Engine` drives one audio device. Per fragment the render loop pulls
//! events from every channel's input ring, converts timestamps to sample
//! offsets, runs scripts, merges delayed events, dispatches everything in
//! offset order, renders voices, then relaunches voices that had to steal.

use crate::channel::{CcEffect, EngineChannel, EventSender, InstrumentBinding};
use crate::disk::{post_command, DiskCommand, DiskConfig, DiskThread};
use crate::instrument::{InstrumentManager, RegionData, RegionQuery};
use crate::metrics::EngineMetrics;
use crate::note::Note;
use crate::output::StereoOut;
use crate::script::{HandlerPhase, ScriptAction, ScriptRunner};
use crate::stream::{stream_pair, StreamHandle, StreamReader};
use crate::virt::{NoteNotification, VirtualMidiPort};
use crate::voice::{Voice, VoiceRenderCtx, VoiceTrigger, VoiceType};
use crossbeam_channel::Sender;
use ripieno_core::{
    ring_buffer, AtomicFlag, EngineConfig, Error, Event, EventClock, EventKind, EventPayload,
    NoteEvent, NoteId, Pool, Result, RingConsumer, RingProducer, RtList, SchedTime, Token,
    VoiceStealPolicy, WallTime,
};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where the last voice was stolen from, advanced across steal requests
/// within one fragment so repeated steals spread over keys and channels.
#[derive(Debug, Default, Clone, Copy)]
struct StealCursor {
    channel: Option<usize>,
    key: Option<Token>,
}

/// A key event relevant to voice rendering, flattened for offset order.
#[derive(Debug, Clone, Copy)]
struct KeyEvt {
    offset: u32,
    kind: EventKind,
    note: Option<NoteId>,
}

pub struct Engine {
    config: EngineConfig,
    clock: EventClock,
    metrics: Arc<EngineMetrics>,
    instruments: Arc<InstrumentManager>,

    event_pool: Pool<Event>,
    note_pool: Pool<Note>,
    voice_pool: Pool<Voice>,

    channels: Vec<EngineChannel>,

    global_input: RingConsumer<Event>,
    global_sender: Option<RingProducer<Event>>,
    global_events: RtList,

    disk: DiskThread,
    disk_tx: Sender<DiskCommand>,
    stream_readers: Vec<StreamReader>,
    free_stream_slots: Vec<u32>,
    dying_stream_slots: Vec<u32>,
    pending_stream_deletions: usize,

    /// Note-on events postponed by voice shortage, re-launched after the
    /// regular voice render pass.
    steal_queue: RtList,
    voice_spawns_left: u32,
    min_fade_out_samples: u32,
    steal_cursor: StealCursor,

    scripts: ScriptRunner,

    scale_tuning_cents: [i8; 12],
    scale_tuning_changed: AtomicFlag,
    scale_tune_factors: [f32; 12],

    enabled: AtomicFlag,
    active_voice_count: usize,
    fx_send_seq: u32,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let mut stream_writers = Vec::with_capacity(config.max_disk_streams);
        let mut stream_readers = Vec::with_capacity(config.max_disk_streams);
        for _ in 0..config.max_disk_streams {
            let (writer, reader) = stream_pair(config.stream_ring_frames);
            stream_writers.push(writer);
            stream_readers.push(reader);
        }
        let free_stream_slots: Vec<u32> = (0..config.max_disk_streams as u32).rev().collect();

        let metrics = Arc::new(EngineMetrics::new());
        let mut disk = DiskThread::new(
            stream_writers,
            DiskConfig {
                min_refill: config.stream_min_refill,
                max_refill: config.stream_max_refill,
                streams_per_run: config.refill_streams_per_run,
            },
            Arc::clone(&metrics),
        );
        disk.start();
        let disk_tx = disk.command_sender();

        let (global_tx, global_rx) = ring_buffer(config.input_queue_size);

        Ok(Self {
            clock: EventClock::new(config.sample_rate),
            metrics,
            instruments: Arc::new(InstrumentManager::new()),
            event_pool: Pool::new(config.max_events),
            note_pool: Pool::new(config.max_notes),
            voice_pool: Pool::new(config.max_voices),
            channels: Vec::new(),
            global_input: global_rx,
            global_sender: Some(global_tx),
            global_events: RtList::new(),
            disk,
            disk_tx,
            stream_readers,
            free_stream_slots,
            dying_stream_slots: Vec::new(),
            pending_stream_deletions: 0,
            steal_queue: RtList::new(),
            voice_spawns_left: config.max_voices as u32,
            min_fade_out_samples: config.min_fade_out_samples(),
            steal_cursor: StealCursor::default(),
            scripts: ScriptRunner::new(
                config.max_script_events,
                config.script_instruction_budget,
                config.max_fork_per_handler,
            ),
            scale_tuning_cents: [0; 12],
            scale_tuning_changed: AtomicFlag::new(false),
            scale_tune_factors: [1.0; 12],
            enabled: AtomicFlag::new(true),
            active_voice_count: 0,
            fx_send_seq: 0,
            config,
        })
    }

    // === control surface ================================================

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn instruments(&self) -> Arc<InstrumentManager> {
        Arc::clone(&self.instruments)
    }

    pub fn sched_time(&self) -> SchedTime {
        self.clock.fragment_start()
    }

    pub fn active_voice_count(&self) -> usize {
        self.active_voice_count
    }

    pub fn active_disk_stream_count(&self) -> usize {
        self.config.max_disk_streams
            - self.free_stream_slots.len()
            - self.dying_stream_slots.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn add_channel(&mut self) -> usize {
        let index = self.channels.len();
        let mut channel = EngineChannel::new(index, self.config.input_queue_size);
        channel.mute_rendering = self.config.process_muted_channels;
        self.channels.push(channel);
        index
    }

    pub fn channel(&self, index: usize) -> Option<&EngineChannel> {
        self.channels.get(index)
    }

    pub fn channel_mut(&mut self, index: usize) -> Option<&mut EngineChannel> {
        self.channels.get_mut(index)
    }

    /// Remove a channel after killing everything it is sounding.
    pub fn remove_channel(&mut self, index: usize) -> Result<()> {
        if index >= self.channels.len() {
            return Err(Error::InvalidId);
        }
        self.kill_channel_voices(index);
        self.channels.remove(index);
        for (i, ch) in self.channels.iter_mut().enumerate() {
            ch.index = i;
        }
        Ok(())
    }

    /// The MIDI input producer of a channel, available once.
    pub fn event_sender(&mut self, channel: usize) -> Option<EventSender> {
        self.channels.get_mut(channel)?.event_sender()
    }

    /// Producer for engine-global events (sysex).
    pub fn global_sender(&mut self) -> Option<RingProducer<Event>> {
        self.global_sender.take()
    }

    pub fn add_virtual_device(&mut self, channel: usize, capacity: usize) -> Option<VirtualMidiPort> {
        Some(self.channels.get_mut(channel)?.add_virtual_device(capacity))
    }

    /// Bind an instrument (and optional script) to a channel through the
    /// lock-free config switch; safe to call from a loader thread via
    /// [`EngineChannel::schedule_instrument_change`] as well.
    pub fn load_instrument(&mut self, channel: usize, binding: InstrumentBinding) -> Result<()> {
        let ch = self.channels.get_mut(channel).ok_or(Error::InvalidId)?;
        ch.schedule_instrument_change(binding);
        Ok(())
    }

    pub fn set_max_voices(&mut self, voices: usize) -> Result<()> {
        if voices == 0 {
            return Err(Error::InvalidConfig("max_voices must be non-zero".into()));
        }
        self.voice_pool.resize(voices)?;
        self.note_pool.resize(voices)?;
        self.config.max_voices = voices;
        self.config.max_notes = voices;
        Ok(())
    }

    pub fn set_max_disk_streams(&mut self, streams: usize) -> Result<()> {
        if self.active_disk_stream_count() != 0 || self.pending_stream_deletions != 0 {
            return Err(Error::EngineBusy("disk streams still active"));
        }
        let mut writers = Vec::with_capacity(streams);
        let mut readers = Vec::with_capacity(streams);
        for _ in 0..streams {
            let (w, r) = stream_pair(self.config.stream_ring_frames);
            writers.push(w);
            readers.push(r);
        }
        let mut disk = DiskThread::new(
            writers,
            DiskConfig {
                min_refill: self.config.stream_min_refill,
                max_refill: self.config.stream_max_refill,
                streams_per_run: self.config.refill_streams_per_run,
            },
            Arc::clone(&self.metrics),
        );
        disk.start();
        self.disk_tx = disk.command_sender();
        self.disk = disk; // old thread joins on drop
        self.stream_readers = readers;
        self.free_stream_slots = (0..streams as u32).rev().collect();
        self.dying_stream_slots.clear();
        self.config.max_disk_streams = streams;
        Ok(())
    }

    pub fn add_fx_send(
        &mut self,
        channel: usize,
        level: f32,
        chain: Box<dyn crate::fx::EffectChain>,
    ) -> Result<u32> {
        let max_frames = self.config.max_samples_per_cycle as usize;
        let id = self.fx_send_seq;
        self.fx_send_seq += 1;
        let ch = self.channels.get_mut(channel).ok_or(Error::InvalidId)?;
        ch.fx_sends
            .push(crate::fx::FxSend::new(id, level, chain, max_frames));
        Ok(id)
    }

    pub fn remove_fx_send(&mut self, channel: usize, id: u32) -> Result<()> {
        let ch = self.channels.get_mut(channel).ok_or(Error::InvalidId)?;
        let before = ch.fx_sends.len();
        ch.fx_sends.retain(|s| s.id != id);
        if ch.fx_sends.len() == before {
            return Err(Error::InvalidId);
        }
        Ok(())
    }

    /// Cent offsets per pitch class, picked up at the next fragment start.
    pub fn set_scale_tuning(&mut self, cents: [i8; 12]) {
        self.scale_tuning_cents = cents;
        self.scale_tuning_changed.set(true);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn enable(&mut self) {
        self.enabled.set(true);
    }

    /// Stop rendering and silence everything; [`Engine::enable`] restores.
    pub fn disable(&mut self) {
        self.suspend_all();
    }

    /// Bind an engine channel to a MIDI channel number (`None` = omni),
    /// for driver adapters routing input ports.
    pub fn set_midi_channel(&mut self, channel: usize, midi_channel: Option<u8>) -> Result<()> {
        let ch = self.channels.get_mut(channel).ok_or(Error::InvalidId)?;
        ch.midi_channel = midi_channel;
        Ok(())
    }

    /// Stop rendering, kill all voices and wait for the disk thread to
    /// confirm teardown of every stream those voices held.
    pub fn suspend_all(&mut self) {
        self.enabled.set(false);
        for ci in 0..self.channels.len() {
            self.kill_channel_voices(ci);
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.pending_stream_deletions > 0 {
            self.collect_disposed_streams();
            if self.pending_stream_deletions == 0 {
                break;
            }
            if Instant::now() > deadline {
                tracing::warn!(
                    pending = self.pending_stream_deletions,
                    "disk thread did not confirm stream deletions in time"
                );
                break;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    pub fn resume_all(&mut self) {
        self.enabled.set(true);
    }

    /// Back to a just-constructed state: no voices, notes, events, scripts.
    pub fn reset(&mut self) {
        self.suspend_all();
        for ch in &mut self.channels {
            ch.delayed.clear();
            self.event_pool.clear_list(&mut ch.delayed_list);
            self.event_pool.clear_list(&mut ch.events);
            ch.keyboard.reset();
            ch.solo_key = -1;
            ch.portamento_pos = -1.0;
            ch.voice_count = 0;
            ch.stream_count = 0;
        }
        self.event_pool.clear_list(&mut self.global_events);
        self.event_pool.clear_list(&mut self.steal_queue);
        self.scripts.clear();
        self.enabled.set(true);
    }

    // === render loop ====================================================

    /// Render one fragment into driver-supplied output buffers. `now` is
    /// the wall-clock timestamp of the fragment start, in the same clock
    /// the MIDI producers stamp events with.
    pub fn render(&mut self, out: &mut StereoOut<'_>, now: WallTime) {
        let frames = out.frames();
        out.clear();
        if frames == 0 || frames > self.config.max_samples_per_cycle as usize {
            if frames != 0 {
                self.metrics.record_dropped_event();
            }
            return;
        }
        if !self.enabled.get() {
            return;
        }

        self.clock.advance_fragment(frames as u32, now);
        self.voice_spawns_left = self.config.max_voices as u32;
        self.steal_cursor = StealCursor::default();

        if self.scale_tuning_changed.swap(false) {
            for (factor, cents) in self
                .scale_tune_factors
                .iter_mut()
                .zip(self.scale_tuning_cents)
            {
                *factor = 2.0f32.powf(cents as f32 / 1200.0);
            }
        }

        self.collect_disposed_streams();
        self.handle_instrument_changes();
        self.import_global_events(frames);

        for ci in 0..self.channels.len() {
            self.import_channel_events(ci, frames);
        }
        // suspended callbacks left over from earlier fragments
        self.drain_due_scripts(frames);
        for ci in 0..self.channels.len() {
            self.run_channel_scripts(ci);
        }
        // waits issued above may land inside this same fragment
        self.drain_due_scripts(frames);
        for ci in 0..self.channels.len() {
            self.merge_delayed_events(ci, frames);
            self.dispatch_channel_events(ci, frames);
            self.steal_cursor = StealCursor::default();
        }

        self.active_voice_count = 0;
        for ci in 0..self.channels.len() {
            self.render_channel_voices(ci, frames, out);
        }
        self.render_stolen_voices(frames, out);
        for ci in 0..self.channels.len() {
            self.post_process_channel(ci, frames, out);
        }
        self.event_pool.clear_list(&mut self.global_events);
        self.event_pool.clear_list(&mut self.steal_queue);
    }

    fn handle_instrument_changes(&mut self) {
        for ci in 0..self.channels.len() {
            if !self.channels[ci].take_pending_instrument() {
                continue;
            }
            // the old instrument's voices keep sounding but must release
            // their region references through the disk thread once they die
            let Self {
                note_pool,
                voice_pool,
                event_pool: _,
                channels,
                ..
            } = self;
            let ch = &mut channels[ci];
            let mut key_cursor = ch.keyboard.first_active_key();
            while let Some((ktok, key)) = key_cursor {
                key_cursor = ch.keyboard.next_active_key(ktok);
                let mut note_cursor = note_pool.first(&ch.keyboard.keys[key as usize].active_notes);
                while let Some(ntok) = note_cursor {
                    note_cursor = note_pool.next(ntok);
                    let Some(note) = note_pool.get(ntok) else { continue };
                    let mut voice_cursor = voice_pool.first(&note.voices);
                    while let Some(vtok) = voice_cursor {
                        voice_cursor = voice_pool.next(vtok);
                        if let Some(voice) = voice_pool.get_mut(vtok) {
                            voice.orphan = true;
                        }
                    }
                }
            }

            if self.channels[ci].script_init_pending {
                self.channels[ci].script_init_pending = false;
                self.run_script_init(ci);
            }
        }
    }

    fn run_script_init(&mut self, ci: usize) {
        let handler = self.channels[ci]
            .instrument()
            .and_then(|b| b.script.as_ref())
            .and_then(|s| s.on_init.clone());
        let Some(handler) = handler else { return };
        let mut cause = Event::at_offset(
            EventKind::Sysex,
            EventPayload::Sysex { len: 0 },
            0,
        );
        cause.channel = Some(ci);
        let Some(token) = self
            .scripts
            .spawn(handler, HandlerPhase::Init, cause, None)
        else {
            self.metrics.record_dropped_event();
            return;
        };
        if let Some(outcome) = self.scripts.run(token, &self.clock, 0, &self.metrics) {
            self.apply_script_actions(ci, token, None, cause, outcome.actions);
            if outcome.finished {
                self.scripts.free(token);
            }
        }
    }

    fn import_global_events(&mut self, frames: usize) {
        let Self {
            event_pool,
            global_input,
            global_events,
            clock,
            metrics,
            ..
        } = self;
        loop {
            let due = match global_input.peek() {
                Some(ev) => clock.fragment_pos_unclamped(ev.time) < frames as i64,
                None => false,
            };
            if !due {
                break;
            }
            let Some(mut ev) = global_input.pop() else { break };
            ev.channel = None;
            ev.fragment_pos(clock);
            match event_pool.alloc_append(global_events) {
                Some(tok) => {
                    if let Some(slot) = event_pool.get_mut(tok) {
                        *slot = ev;
                    }
                }
                None => {
                    metrics.record_event_pool_exhausted();
                    metrics.record_dropped_event();
                }
            }
        }
    }

    fn import_channel_events(&mut self, ci: usize, frames: usize) {
        let Self {
            event_pool,
            channels,
            clock,
            metrics,
            ..
        } = self;
        let ch = &mut channels[ci];
        let transpose = ch.transpose;

        loop {
            let due = match ch.input().peek() {
                Some(ev) => clock.fragment_pos_unclamped(ev.time) < frames as i64,
                None => false,
            };
            if !due {
                break;
            }
            let Some(mut ev) = ch.input().pop() else { break };
            if !normalise_input_event(&mut ev, ci, transpose, clock) {
                metrics.record_dropped_event();
                continue;
            }
            match event_pool.alloc_append(&mut ch.events) {
                Some(tok) => {
                    if let Some(slot) = event_pool.get_mut(tok) {
                        *slot = ev;
                    }
                }
                None => {
                    metrics.record_event_pool_exhausted();
                    metrics.record_dropped_event();
                }
            }
        }

        // virtual device injections sort behind driver events of equal
        // offset (lower source priority)
        for di in 0..ch.virtual_devices.len() {
            loop {
                let due = match ch.virtual_devices[di].injected().peek() {
                    Some(ev) => clock.fragment_pos_unclamped(ev.time) < frames as i64,
                    None => false,
                };
                if !due {
                    break;
                }
                let Some(mut ev) = ch.virtual_devices[di].injected().pop() else {
                    break;
                };
                if !normalise_input_event(&mut ev, ci, transpose, clock) {
                    metrics.record_dropped_event();
                    continue;
                }
                if insert_sorted(event_pool, &mut ch.events, ev, false).is_none() {
                    metrics.record_event_pool_exhausted();
                    metrics.record_dropped_event();
                }
            }
        }
    }

    /// Resume every suspended script instance scheduled before the end of
    /// this fragment, in scheduler-time order.
    fn drain_due_scripts(&mut self, _frames: usize) {
        let end = self.clock.fragment_end();
        while let Some((time, token)) = self.scripts.resume_due(end) {
            let base = time.saturating_sub(self.clock.fragment_start()) as u32;
            let (ci, cause) = match self.scripts.get(token) {
                Some(ev) => (ev.ctx.cause.channel.unwrap_or(0), ev.ctx.cause),
                None => continue,
            };
            let mut cause = cause;
            cause.pin_fragment_pos(base);
            if let Some(outcome) = self.scripts.run(token, &self.clock, base, &self.metrics) {
                self.apply_script_actions(ci, token, None, cause, outcome.actions);
                if outcome.finished && !self.is_retained_script(ci, token) {
                    self.scripts.free(token);
                }
            }
        }
    }

    fn is_retained_script(&self, ci: usize, token: Token) -> bool {
        let Some(id) = self.scripts.id_of(token) else {
            return false;
        };
        self.channels[ci]
            .keyboard
            .keys
            .iter()
            .any(|k| k.script_event == Some(id))
    }

    /// Spawn handler instances for this fragment's fresh events.
    fn run_channel_scripts(&mut self, ci: usize) {
        let Some(binding) = self.channels[ci].instrument().cloned() else {
            return;
        };
        let Some(script) = binding.script.clone() else {
            return;
        };
        if script.on_note.is_none() && script.on_release.is_none() && script.on_controller.is_none()
        {
            return;
        }

        let mut cursor = self.event_pool.first(&self.channels[ci].events);
        while let Some(tok) = cursor {
            cursor = self.event_pool.next(tok);
            let Some(ev) = self.event_pool.get(tok).copied() else {
                continue;
            };
            match ev.kind {
                EventKind::NoteOn => {
                    let Some(handler) = script.on_note.clone() else {
                        continue;
                    };
                    let Some(stok) =
                        self.scripts.spawn(handler, HandlerPhase::Note, ev, None)
                    else {
                        self.metrics.record_dropped_event();
                        continue;
                    };
                    let base = ev.cached_fragment_pos().unwrap_or(0);
                    let outcome = self.scripts.run(stok, &self.clock, base, &self.metrics);
                    if let Some(outcome) = outcome {
                        self.apply_script_actions(ci, stok, Some(tok), ev, outcome.actions);
                        let key = ev.note().map(|n| n.key).unwrap_or(0) as usize;
                        let retained_id =
                            script.on_release.is_some().then(|| self.scripts.id_of(stok)).flatten();
                        match retained_id {
                            Some(id) => {
                                // retain for the matching release handler
                                let old = self.channels[ci].keyboard.keys[key]
                                    .script_event
                                    .replace(id);
                                if let Some(old_id) = old.filter(|&o| o != id) {
                                    if let Some(old_tok) = self.scripts.resolve(old_id) {
                                        self.scripts.free(old_tok);
                                    }
                                }
                            }
                            None => {
                                if outcome.finished {
                                    self.scripts.free(stok);
                                }
                            }
                        }
                    }
                }
                EventKind::NoteOff => {
                    let Some(handler) = script.on_release.clone() else {
                        continue;
                    };
                    let key = ev.note().map(|n| n.key).unwrap_or(0) as usize;
                    let retained = self.channels[ci].keyboard.keys[key]
                        .script_event
                        .take()
                        .and_then(|id| self.scripts.resolve(id));
                    let stok = match retained {
                        Some(stok) => {
                            if let Some(sev) = self.scripts.get_mut(stok) {
                                sev.phase = HandlerPhase::Release;
                                sev.handler = Some(handler);
                                sev.ctx.cause = ev;
                                sev.ctx.resume_point = 0;
                            }
                            Some(stok)
                        }
                        None => self.scripts.spawn(handler, HandlerPhase::Release, ev, None),
                    };
                    let Some(stok) = stok else {
                        self.metrics.record_dropped_event();
                        continue;
                    };
                    let base = ev.cached_fragment_pos().unwrap_or(0);
                    if let Some(outcome) = self.scripts.run(stok, &self.clock, base, &self.metrics)
                    {
                        self.apply_script_actions(ci, stok, Some(tok), ev, outcome.actions);
                        if outcome.finished {
                            self.scripts.free(stok);
                        }
                    }
                }
                EventKind::ControlChange
                | EventKind::ChannelPressure
                | EventKind::PitchBend => {
                    let Some(handler) = script.on_controller.clone() else {
                        continue;
                    };
                    let Some(stok) =
                        self.scripts
                            .spawn(handler, HandlerPhase::Controller, ev, None)
                    else {
                        self.metrics.record_dropped_event();
                        continue;
                    };
                    let base = ev.cached_fragment_pos().unwrap_or(0);
                    if let Some(outcome) = self.scripts.run(stok, &self.clock, base, &self.metrics)
                    {
                        self.apply_script_actions(ci, stok, Some(tok), ev, outcome.actions);
                        if outcome.finished {
                            self.scripts.free(stok);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Apply the side effects one handler slice requested.
    fn apply_script_actions(
        &mut self,
        ci: usize,
        script_token: Token,
        cause_token: Option<Token>,
        cause: Event,
        actions: SmallVec<[ScriptAction; 4]>,
    ) {
        let base = cause.cached_fragment_pos().unwrap_or(0);
        for action in actions {
            match action {
                ScriptAction::PlayNote {
                    key,
                    velocity,
                    delay_us,
                } => {
                    let parent = self
                        .scripts
                        .get(script_token)
                        .and_then(|s| s.ctx.note_id)
                        .or_else(|| cause.note().and_then(|n| n.note_id));
                    let mut ev = Event::at_offset(
                        EventKind::PlayNote,
                        EventPayload::Note(NoteEvent {
                            key,
                            velocity,
                            parent_note_id: parent,
                            ..Default::default()
                        }),
                        base,
                    );
                    ev.channel = Some(ci);
                    let Self {
                        event_pool,
                        channels,
                        clock,
                        metrics,
                        ..
                    } = self;
                    let ch = &mut channels[ci];
                    if delay_us == 0 {
                        if insert_sorted(event_pool, &mut ch.events, ev, true).is_none() {
                            metrics.record_event_pool_exhausted();
                            metrics.record_dropped_event();
                        }
                    } else {
                        match event_pool.alloc_append(&mut ch.delayed_list) {
                            Some(tok) => {
                                if let Some(slot) = event_pool.get_mut(tok) {
                                    *slot = ev;
                                }
                                let time = clock.schedule_time_ahead(base, delay_us);
                                ch.delayed.schedule(time, tok);
                            }
                            None => {
                                metrics.record_event_pool_exhausted();
                                metrics.record_dropped_event();
                            }
                        }
                    }
                }
                ScriptAction::StopNote { note } => {
                    self.synthesise_note_event(ci, EventKind::StopNote, note, base);
                }
                ScriptAction::KillNote { note } => {
                    self.synthesise_note_event(ci, EventKind::KillNote, note, base);
                }
                ScriptAction::ChangeParam {
                    note,
                    param,
                    value,
                    relative,
                } => {
                    if let Some(ntok) = self.note_pool.from_id(note) {
                        if let Some(n) = self.note_pool.get_mut(ntok) {
                            n.overrides.apply(param, value, relative);
                        }
                    }
                }
                ScriptAction::IgnoreEvent => {
                    if let Some(tok) = cause_token {
                        self.event_pool.free(&mut self.channels[ci].events, tok);
                    }
                }
                ScriptAction::Fork { children } => {
                    for _ in 0..children {
                        let Some(child) = self.scripts.fork(script_token, false) else {
                            self.metrics.record_dropped_event();
                            break;
                        };
                        if let Some(outcome) =
                            self.scripts.run(child, &self.clock, base, &self.metrics)
                        {
                            self.apply_script_actions(ci, child, None, cause, outcome.actions);
                            if outcome.finished {
                                self.scripts.free(child);
                            }
                        }
                    }
                }
            }
        }
    }

    fn synthesise_note_event(&mut self, ci: usize, kind: EventKind, note: NoteId, offset: u32) {
        let mut ev = Event::at_offset(
            kind,
            EventPayload::Note(NoteEvent {
                note_id: Some(note),
                ..Default::default()
            }),
            offset,
        );
        ev.channel = Some(ci);
        if let Some(ntok) = self.note_pool.from_id(note) {
            if let Some(n) = self.note_pool.get(ntok) {
                if let Some(nev) = ev.note_mut() {
                    nev.key = n.host_key;
                }
            }
        }
        let Self {
            event_pool,
            channels,
            metrics,
            ..
        } = self;
        if insert_sorted(event_pool, &mut channels[ci].events, ev, true).is_none() {
            metrics.record_event_pool_exhausted();
            metrics.record_dropped_event();
        }
    }

    fn merge_delayed_events(&mut self, ci: usize, _frames: usize) {
        let end = self.clock.fragment_end();
        let start = self.clock.fragment_start();
        loop {
            let Self {
                event_pool,
                channels,
                ..
            } = self;
            let ch = &mut channels[ci];
            let Some((time, tok)) = ch.delayed.pop_before(end) else {
                break;
            };
            let offset = time.saturating_sub(start) as u32;
            if let Some(ev) = event_pool.get_mut(tok) {
                ev.reset_fragment_pos();
                ev.pin_fragment_pos(offset);
            }
            // delayed (script-spawned) events outrank queue events of the
            // same offset
            let before = sorted_position(event_pool, &ch.events, offset, true, None);
            event_pool.move_before(&mut ch.delayed_list, &mut ch.events, tok, before);
        }
    }

    fn dispatch_channel_events(&mut self, ci: usize, frames: usize) {
        let mut cursor = self.event_pool.first(&self.channels[ci].events);
        while let Some(tok) = cursor {
            cursor = self.event_pool.next(tok);
            let Some(ev) = self.event_pool.get(tok).copied() else {
                continue;
            };
            match ev.kind {
                EventKind::NoteOn | EventKind::PlayNote => {
                    self.process_note_on(ci, tok, frames);
                }
                EventKind::NoteOff | EventKind::StopNote => {
                    self.process_note_off(ci, tok, frames);
                }
                EventKind::KillNote => self.process_kill_note(ci, tok),
                EventKind::ControlChange => self.process_control_change(ci, tok),
                EventKind::PitchBend => {
                    if let EventPayload::PitchBend(p) = ev.payload {
                        self.channels[ci].pitch_bend = p.value;
                    }
                }
                EventKind::NoteSynthParam => {
                    if let EventPayload::SynthParam(sp) = ev.payload {
                        if let Some(note) = sp.note_id {
                            if let Some(ntok) = self.note_pool.from_id(note) {
                                if let Some(n) = self.note_pool.get_mut(ntok) {
                                    n.overrides.apply(sp.param, sp.value, sp.relative);
                                }
                            }
                        }
                    }
                }
                // aftertouch is absorbed into the controller table only
                EventKind::ChannelPressure | EventKind::NotePressure => {}
                EventKind::Sysex => {}
                EventKind::CancelReleaseKey
                | EventKind::ReleaseKey
                | EventKind::ReleaseNote => {}
            }
        }
    }

    // === note processing ================================================

    fn process_note_on(&mut self, ci: usize, tok: Token, _frames: usize) {
        let Some(ev) = self.event_pool.get(tok).copied() else {
            return;
        };
        let Some(nev) = ev.note().copied() else {
            self.metrics.record_dropped_event();
            return;
        };
        let key = nev.key as usize;
        let velocity = nev.velocity;
        let real = ev.is_real_note_on();
        let offset = ev.cached_fragment_pos().unwrap_or(0);
        let trigger_time = self.clock.fragment_start() + offset as u64;

        if self.channels[ci].mute && !self.channels[ci].mute_rendering {
            // listeners still observe key activity on muted channels
            if real {
                for host in &mut self.channels[ci].virtual_devices {
                    host.notify(NoteNotification::NoteOn {
                        key: key as u8,
                        velocity,
                    });
                }
            }
            return;
        }
        if self.channels[ci].instrument().is_none() {
            return;
        }

        // the event now belongs to the key
        {
            let Self {
                event_pool,
                channels,
                ..
            } = self;
            let ch = &mut channels[ci];
            event_pool.move_to_end_of(
                &mut ch.events,
                &mut ch.keyboard.keys[key].events,
                tok,
            );
        }

        // solo mode: fade out whatever the previous solo key still sounds
        if self.channels[ci].solo_mode && real {
            if let Some((_, prev_key)) = self.channels[ci].keyboard.last_active_key() {
                if prev_key as usize != key && self.channels[ci].keyboard.keys[prev_key as usize].active
                {
                    if self.channels[ci].portamento_mode {
                        self.channels[ci].portamento_pos = prev_key as f32;
                    }
                    self.kill_voices_on_key(ci, prev_key as usize, false);
                }
            }
            self.channels[ci].solo_key = key as i16;
        }

        if real {
            let ch = &mut self.channels[ci];
            let k = &mut ch.keyboard.keys[key];
            k.pressed = true;
            k.velocity = velocity;
            k.note_on_time = trigger_time;
        }

        // abort release stages of earlier voices still sounding on the key
        if real
            && self.channels[ci].keyboard.keys[key].active
            && !self.channels[ci].keyboard.sustain_pedal
        {
            self.synthesise_key_event(ci, key, EventKind::CancelReleaseKey, offset, velocity);
        }

        let Some(note_tok) = self.launch_new_note(ci, tok, key, trigger_time) else {
            let Self {
                event_pool,
                channels,
                ..
            } = self;
            event_pool.free(&mut channels[ci].keyboard.keys[key].events, tok);
            return;
        };

        self.trigger_new_voices(ci, tok, note_tok, key, velocity, trigger_time);

        // nothing spawned and nothing queued: drop the event again
        let thefts = self.channels[ci].keyboard.keys[key].voice_thefts_queued;
        let has_voices = self
            .note_pool
            .get(note_tok)
            .map(|n| !n.voices.is_empty())
            .unwrap_or(false);
        if !has_voices && thefts == 0 {
            self.free_note(ci, note_tok);
            let Self {
                event_pool,
                channels,
                ..
            } = self;
            event_pool.free(&mut channels[ci].keyboard.keys[key].events, tok);
        }

        if real {
            let ch = &mut self.channels[ci];
            if !ch.solo_mode || ch.portamento_pos < 0.0 {
                ch.portamento_pos = key as f32;
            }
            ch.keyboard.round_robin[key] = ch.keyboard.round_robin[key].wrapping_add(1);
            ch.round_robin = ch.round_robin.wrapping_add(1);
            for host in &mut ch.virtual_devices {
                host.notify(NoteNotification::NoteOn {
                    key: key as u8,
                    velocity,
                });
            }
        }
    }

    /// Allocate and link a fresh note for a note-on event; stamps the new
    /// note's ID back onto the event.
    fn launch_new_note(
        &mut self,
        ci: usize,
        ev_tok: Token,
        key: usize,
        trigger_time: SchedTime,
    ) -> Option<Token> {
        if self.note_pool.is_exhausted() {
            self.metrics.record_note_pool_exhausted();
            return None;
        }
        let Self {
            event_pool,
            note_pool,
            channels,
            metrics,
            ..
        } = self;
        let ch = &mut channels[ci];
        let ev = event_pool.get(ev_tok).copied()?;
        let parent_id = ev.note().and_then(|n| n.parent_note_id);

        // a child note lands on its parent's key so both release together
        let mut host_key = key as u8;
        if let Some(pid) = parent_id {
            match note_pool.from_id(pid).and_then(|pt| note_pool.get(pt).map(|p| (pt, p.host_key)))
            {
                Some((_, parent_key)) => host_key = parent_key,
                None => {
                    // parent died already; the event is void
                    metrics.record_dropped_event();
                    return None;
                }
            }
        }
        let host = host_key as usize;
        let note_tok = note_pool.alloc_append(&mut ch.keyboard.keys[host].active_notes)?;
        let note_id = note_pool.id_of(note_tok)?;
        if let Some(note) = note_pool.get_mut(note_tok) {
            note.reset(host_key, ev, trigger_time);
            note.parent_id = parent_id;
        }
        if let Some(pid) = parent_id {
            if let Some(ptok) = note_pool.from_id(pid) {
                if let Some(parent) = note_pool.get_mut(ptok) {
                    parent.child_ids.push(note_id);
                }
            }
        }
        if let Some(slot) = event_pool.get_mut(ev_tok) {
            if let Some(nev) = slot.note_mut() {
                nev.note_id = Some(note_id);
            }
        }
        ch.keyboard.mark_key_active(host_key);
        Some(note_tok)
    }

    /// Spawn one voice per matching region layer, stealing when the pool
    /// runs dry.
    fn trigger_new_voices(
        &mut self,
        ci: usize,
        ev_tok: Token,
        note_tok: Token,
        key: usize,
        velocity: u8,
        trigger_time: SchedTime,
    ) {
        let Some(binding) = self.channels[ci].instrument().cloned() else {
            return;
        };
        let regions = {
            let ch = &self.channels[ci];
            let query = RegionQuery {
                key: key as u8,
                velocity,
                controllers: &ch.controllers,
                cc64_override: None,
                round_robin: ch.keyboard.round_robin[key],
            };
            binding.instrument.regions(&query)
        };
        if regions.is_empty() {
            return;
        }

        // key groups: a new member mutes sounding members of its group
        for region in &regions {
            if let Some(group) = region.key_group {
                self.kill_key_group(ci, group);
            }
            self.channels[ci].keyboard.keys[key]
                .release_trigger
                .merge(region.release_trigger);
        }

        for (layer, region) in regions.iter().enumerate() {
            if self.voice_pool.is_exhausted() {
                self.metrics.record_voice_pool_exhausted();
                if self.steal_voice(ci, key) {
                    self.queue_stolen_voice(ci, ev_tok, key, layer as u8, false);
                } else {
                    self.metrics.record_dropped_event();
                }
                continue;
            }
            if self
                .launch_voice(ci, note_tok, region, VoiceType::Normal, trigger_time)
                .is_none()
            {
                self.metrics.record_dropped_event();
            }
        }
    }

    fn launch_voice(
        &mut self,
        ci: usize,
        note_tok: Token,
        region: &Arc<RegionData>,
        voice_type: VoiceType,
        trigger_time: SchedTime,
    ) -> Option<Token> {
        let Self {
            note_pool,
            voice_pool,
            free_stream_slots,
            disk_tx,
            channels,
            clock,
            ..
        } = self;
        let note_id = note_pool.id_of(note_tok)?;
        let note = note_pool.get_mut(note_tok)?;
        let vtok = voice_pool.alloc_append(&mut note.voices)?;

        let start_frame = if note.overrides.sample_offset_us >= 0 {
            (note.overrides.sample_offset_us as u128 * clock.sample_rate() as u128 / 1_000_000)
                as u64
        } else {
            0
        };

        let voice = voice_pool.get_mut(vtok)?;
        voice.trigger(VoiceTrigger {
            region: Arc::clone(region),
            // pitch follows the event's key; the host key only groups lists
            key: note.cause.note().map(|n| n.key).unwrap_or(note.host_key),
            velocity: note.cause.note().map(|n| n.velocity).unwrap_or(127),
            note_id,
            channel: ci,
            voice_type,
            trigger_sched_time: trigger_time,
            sample_rate: clock.sample_rate(),
            start_frame,
            overrides: note.overrides,
        });

        if voice.needs_stream() {
            let Some(slot) = free_stream_slots.pop() else {
                // no stream slot: the voice cannot sound past its RAM head
                voice.kill_immediately();
                voice_pool.free(&mut note.voices, vtok);
                self.metrics.record_dropped_event();
                return None;
            };
            let launched = post_command(
                disk_tx,
                DiskCommand::Launch {
                    slot,
                    region: Arc::clone(region),
                    start_frame: voice.stream_start_frame,
                    do_loop: region.looping.is_some(),
                },
            );
            if !launched {
                free_stream_slots.push(slot);
                voice.kill_immediately();
                voice_pool.free(&mut note.voices, vtok);
                self.metrics.record_dropped_event();
                return None;
            }
            voice.stream = Some(StreamHandle(slot));
            channels[ci].stream_count += 1;
        }
        Some(vtok)
    }

    fn queue_stolen_voice(&mut self, ci: usize, ev_tok: Token, key: usize, layer: u8, release: bool) {
        let Self {
            event_pool,
            channels,
            steal_queue,
            metrics,
            ..
        } = self;
        let Some(ev) = event_pool.get(ev_tok).copied() else {
            return;
        };
        match event_pool.alloc_append(steal_queue) {
            Some(tok) => {
                if let Some(slot) = event_pool.get_mut(tok) {
                    *slot = ev;
                    if let Some(nev) = slot.note_mut() {
                        nev.layer = layer;
                        nev.release_trigger = release;
                    }
                }
                channels[ci].keyboard.keys[key].voice_thefts_queued += 1;
            }
            None => {
                metrics.record_event_pool_exhausted();
                metrics.record_dropped_event();
            }
        }
    }

    fn process_note_off(&mut self, ci: usize, tok: Token, frames: usize) {
        let Some(ev) = self.event_pool.get(tok).copied() else {
            return;
        };
        let Some(nev) = ev.note().copied() else {
            self.metrics.record_dropped_event();
            return;
        };
        let key = nev.key as usize;
        let real = ev.is_real_note_off();
        let offset = ev.cached_fragment_pos().unwrap_or(0);

        if self.channels[ci].mute && !self.channels[ci].mute_rendering {
            // listeners still observe key activity on muted channels
            if real {
                for host in &mut self.channels[ci].virtual_devices {
                    host.notify(NoteNotification::NoteOff {
                        key: key as u8,
                        velocity: nev.velocity,
                    });
                }
            }
            return;
        }

        if real {
            self.channels[ci].keyboard.keys[key].pressed = false;
        }

        // the event now belongs to the key
        {
            let Self {
                event_pool,
                channels,
                ..
            } = self;
            let ch = &mut channels[ci];
            event_pool.move_to_end_of(&mut ch.events, &mut ch.keyboard.keys[key].events, tok);
        }

        if real {
            let should_release = self.channels[ci].keyboard.keys[key].active
                && self.channels[ci].keyboard.should_release_key(key as u8);

            // solo mode: respawn the highest key still held
            if self.channels[ci].solo_mode
                && self.channels[ci].instrument().is_some()
                && self.channels[ci].solo_key == key as i16
            {
                self.channels[ci].solo_key = -1;
                let next_key = (1..128usize)
                    .rev()
                    .find(|&k| self.channels[ci].keyboard.keys[k].pressed);
                if let Some(other) = next_key {
                    self.channels[ci].solo_key = other as i16;
                    if self.channels[ci].portamento_mode {
                        self.channels[ci].portamento_pos = key as f32;
                    }
                    let velocity = self.channels[ci].keyboard.keys[other].velocity;
                    let mut pseudo = ev;
                    pseudo.kind = EventKind::NoteOn;
                    if let Some(p) = pseudo.note_mut() {
                        p.key = other as u8;
                        p.velocity = velocity;
                        p.note_id = None;
                    }
                    let Self {
                        event_pool,
                        channels,
                        metrics,
                        ..
                    } = self;
                    match event_pool.alloc_append(&mut channels[ci].events) {
                        Some(ptok) => {
                            if let Some(slot) = event_pool.get_mut(ptok) {
                                *slot = pseudo;
                            }
                            self.process_note_on(ci, ptok, frames);
                        }
                        None => {
                            metrics.record_event_pool_exhausted();
                            metrics.record_dropped_event();
                        }
                    }
                }
            }

            if should_release {
                if let Some(slot) = self.event_pool.get_mut(tok) {
                    slot.kind = EventKind::ReleaseKey;
                }
                if self.channels[ci].keyboard.keys[key].release_trigger.note_off {
                    let velocity = self.channels[ci].keyboard.keys[key].velocity;
                    self.trigger_release_voices(ci, key, velocity, None, offset);
                }
            }

            for host in &mut self.channels[ci].virtual_devices {
                host.notify(NoteNotification::NoteOff {
                    key: key as u8,
                    velocity: nev.velocity,
                });
            }
        } else {
            // a script stop affects one note (and its children), not the key
            if let Some(slot) = self.event_pool.get_mut(tok) {
                slot.kind = EventKind::ReleaseNote;
            }
            if let Some(note_id) = nev.note_id {
                self.release_child_notes(ci, note_id, offset);
            }
        }
    }

    /// Synthesise release events for every child of `note_id` on its host
    /// key, so script-spawned pairs stop together.
    fn release_child_notes(&mut self, ci: usize, note_id: NoteId, offset: u32) {
        let children: SmallVec<[NoteId; 4]> = match self.note_pool.from_id(note_id) {
            Some(ntok) => self
                .note_pool
                .get(ntok)
                .map(|n| n.child_ids.clone())
                .unwrap_or_default(),
            None => return,
        };
        for child in children {
            let Some(ctok) = self.note_pool.from_id(child) else {
                continue;
            };
            let Some(host_key) = self.note_pool.get(ctok).map(|n| n.host_key) else {
                continue;
            };
            let mut ev = Event::at_offset(
                EventKind::ReleaseNote,
                EventPayload::Note(NoteEvent {
                    key: host_key,
                    note_id: Some(child),
                    ..Default::default()
                }),
                offset,
            );
            ev.channel = Some(ci);
            let Self {
                event_pool,
                channels,
                metrics,
                ..
            } = self;
            match event_pool.alloc_append(&mut channels[ci].keyboard.keys[host_key as usize].events)
            {
                Some(tok) => {
                    if let Some(slot) = event_pool.get_mut(tok) {
                        *slot = ev;
                    }
                }
                None => {
                    metrics.record_event_pool_exhausted();
                    metrics.record_dropped_event();
                }
            }
            self.release_child_notes(ci, child, offset);
        }
    }

    fn process_kill_note(&mut self, _ci: usize, tok: Token) {
        let Some(ev) = self.event_pool.get(tok).copied() else {
            return;
        };
        let Some(note_id) = ev.note().and_then(|n| n.note_id) else {
            return;
        };
        let fade = self.min_fade_out_samples;
        let Self {
            note_pool,
            voice_pool,
            ..
        } = self;
        let Some(ntok) = note_pool.from_id(note_id) else {
            return;
        };
        let Some(note) = note_pool.get(ntok) else {
            return;
        };
        let mut cursor = voice_pool.first(&note.voices);
        while let Some(vtok) = cursor {
            cursor = voice_pool.next(vtok);
            if let Some(voice) = voice_pool.get_mut(vtok) {
                voice.kill(fade);
            }
        }
    }

    fn process_control_change(&mut self, ci: usize, tok: Token) {
        let Some(ev) = self.event_pool.get(tok).copied() else {
            return;
        };
        let Some(cc) = ev.cc().copied() else {
            return;
        };
        let offset = ev.cached_fragment_pos().unwrap_or(0);
        let effect = self.channels[ci].apply_control_change(cc.controller, cc.value);
        match effect {
            CcEffect::None | CcEffect::SostenutoDown | CcEffect::ResetControllers => {}
            CcEffect::SustainDown => {
                let keys: SmallVec<[u8; 16]> = self
                    .active_keys_of(ci)
                    .filter(|&k| self.channels[ci].keyboard.keys[k as usize].pressed)
                    .collect();
                for k in keys {
                    self.synthesise_key_event(
                        ci,
                        k as usize,
                        EventKind::CancelReleaseKey,
                        offset,
                        self.channels[ci].keyboard.keys[k as usize].velocity,
                    );
                }
            }
            CcEffect::SustainUp => {
                let keys: SmallVec<[u8; 16]> =
                    self.channels[ci].keyboard.pedal_held_keys().collect();
                for k in keys {
                    self.synthesise_key_event(
                        ci,
                        k as usize,
                        EventKind::ReleaseKey,
                        offset,
                        self.channels[ci].keyboard.keys[k as usize].velocity,
                    );
                    let trigger = self.channels[ci].keyboard.keys[k as usize].release_trigger;
                    if trigger.any_sustain() {
                        let velocity = if trigger.sustain_max_velocity {
                            127
                        } else {
                            self.channels[ci].keyboard.keys[k as usize].velocity
                        };
                        // region selection must see the pedal as still down
                        self.trigger_release_voices(ci, k as usize, velocity, Some(127), offset);
                    }
                }
            }
            CcEffect::SostenutoUp => {
                let sustain = self.channels[ci].keyboard.sustain_pedal;
                if !sustain {
                    let keys: SmallVec<[u8; 16]> =
                        self.channels[ci].keyboard.pedal_held_keys().collect();
                    for k in keys {
                        self.synthesise_key_event(
                            ci,
                            k as usize,
                            EventKind::ReleaseKey,
                            offset,
                            self.channels[ci].keyboard.keys[k as usize].velocity,
                        );
                    }
                }
            }
            CcEffect::TransposeChanged | CcEffect::AllNotesOff => {
                let keys: SmallVec<[u8; 16]> = self.active_keys_of(ci).collect();
                for k in keys {
                    self.synthesise_key_event(
                        ci,
                        k as usize,
                        EventKind::ReleaseKey,
                        offset,
                        self.channels[ci].keyboard.keys[k as usize].velocity,
                    );
                }
            }
            CcEffect::AllSoundOff => {
                let keys: SmallVec<[u8; 16]> = self.active_keys_of(ci).collect();
                for k in keys {
                    self.kill_voices_on_key(ci, k as usize, true);
                }
            }
        }
    }

    fn active_keys_of(&self, ci: usize) -> impl Iterator<Item = u8> + '_ {
        let kb = &self.channels[ci].keyboard;
        let mut cursor = kb.first_active_key();
        std::iter::from_fn(move || {
            let (tok, key) = cursor?;
            cursor = kb.next_active_key(tok);
            Some(key)
        })
    }

    fn synthesise_key_event(
        &mut self,
        ci: usize,
        key: usize,
        kind: EventKind,
        offset: u32,
        velocity: u8,
    ) {
        let mut ev = Event::at_offset(
            kind,
            EventPayload::Note(NoteEvent {
                key: key as u8,
                velocity,
                ..Default::default()
            }),
            offset,
        );
        ev.channel = Some(ci);
        let Self {
            event_pool,
            channels,
            metrics,
            ..
        } = self;
        match event_pool.alloc_append(&mut channels[ci].keyboard.keys[key].events) {
            Some(tok) => {
                if let Some(slot) = event_pool.get_mut(tok) {
                    *slot = ev;
                }
            }
            None => {
                metrics.record_event_pool_exhausted();
                metrics.record_dropped_event();
            }
        }
    }

    /// Spawn release-trigger voices for a key, grouped under a new note.
    fn trigger_release_voices(
        &mut self,
        ci: usize,
        key: usize,
        velocity: u8,
        cc64_override: Option<u8>,
        offset: u32,
    ) {
        let Some(binding) = self.channels[ci].instrument().cloned() else {
            return;
        };
        let regions = {
            let ch = &self.channels[ci];
            let query = RegionQuery {
                key: key as u8,
                velocity,
                controllers: &ch.controllers,
                cc64_override,
                round_robin: ch.keyboard.round_robin[key],
            };
            binding.instrument.release_regions(&query)
        };
        if regions.is_empty() {
            return;
        }
        let trigger_time = self.clock.fragment_start() + offset as u64;
        let mut cause = Event::at_offset(
            EventKind::NoteOn,
            EventPayload::Note(NoteEvent {
                key: key as u8,
                velocity,
                ..Default::default()
            }),
            offset,
        );
        cause.channel = Some(ci);

        let note_tok = {
            if self.note_pool.is_exhausted() {
                self.metrics.record_note_pool_exhausted();
                return;
            }
            let Self {
                note_pool,
                channels,
                ..
            } = self;
            let ch = &mut channels[ci];
            let Some(note_tok) = note_pool.alloc_append(&mut ch.keyboard.keys[key].active_notes)
            else {
                return;
            };
            if let Some(note) = note_pool.get_mut(note_tok) {
                note.reset(key as u8, cause, trigger_time);
            }
            ch.keyboard.mark_key_active(key as u8);
            note_tok
        };

        for region in regions.iter() {
            if self.voice_pool.is_exhausted() {
                self.metrics.record_voice_pool_exhausted();
                break;
            }
            self.launch_voice(ci, note_tok, region, VoiceType::ReleaseTrigger, trigger_time);
        }

        let empty = self
            .note_pool
            .get(note_tok)
            .map(|n| n.voices.is_empty())
            .unwrap_or(true);
        if empty {
            self.free_note(ci, note_tok);
        }
    }

    // === voice stealing =================================================

    /// Pick and kill one stealable voice per the configured policy. The
    /// caller then queues the causing event for re-launch.
    fn steal_voice(&mut self, ci: usize, key: usize) -> bool {
        if self.voice_spawns_left == 0 {
            self.metrics.record_steal_failure();
            return false;
        }
        if self.event_pool.is_exhausted() {
            self.metrics.record_event_pool_exhausted();
            self.metrics.record_steal_failure();
            return false;
        }
        let policy = self.config.voice_steal_policy;
        if policy == VoiceStealPolicy::None {
            self.metrics.record_steal_failure();
            return false;
        }

        let fragment_start = self.clock.fragment_start();
        let fade = self.min_fade_out_samples;

        if policy == VoiceStealPolicy::OldestVoiceOnKey
            && self.steal_from_key(ci, key, fragment_start, fade)
        {
            self.voice_spawns_left -= 1;
            self.metrics.record_voice_stolen();
            return true;
        }

        // oldest key, round-robin across channels starting after the
        // requester (or wherever the last steal left off)
        let channel_count = self.channels.len();
        let start = self
            .steal_cursor
            .channel
            .unwrap_or((ci + 1) % channel_count);
        for step in 0..channel_count {
            let c = (start + step) % channel_count;
            let resume_key = if self.steal_cursor.channel == Some(c) {
                self.steal_cursor.key
            } else {
                None
            };
            if let Some(key_tok) = self.steal_oldest_key(c, resume_key, fragment_start, fade) {
                self.steal_cursor = StealCursor {
                    channel: Some(c),
                    key: Some(key_tok),
                };
                self.voice_spawns_left -= 1;
                self.metrics.record_voice_stolen();
                return true;
            }
        }
        self.metrics.record_steal_failure();
        false
    }

    /// Oldest stealable voice among the notes of one key.
    fn steal_from_key(&mut self, ci: usize, key: usize, fragment_start: SchedTime, fade: u32) -> bool {
        let Self {
            note_pool,
            voice_pool,
            channels,
            ..
        } = self;
        let kb = &channels[ci].keyboard;
        let mut note_cursor = note_pool.first(&kb.keys[key].active_notes);
        while let Some(ntok) = note_cursor {
            note_cursor = note_pool.next(ntok);
            let Some(note) = note_pool.get(ntok) else { continue };
            let mut voice_cursor = voice_pool.first(&note.voices);
            while let Some(vtok) = voice_cursor {
                voice_cursor = voice_pool.next(vtok);
                if let Some(voice) = voice_pool.get_mut(vtok) {
                    if voice.is_stealable(fragment_start) {
                        voice.kill(fade);
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Oldest stealable voice on the oldest active key of one channel,
    /// optionally resuming after a previous steal's key.
    fn steal_oldest_key(
        &mut self,
        ci: usize,
        resume_after: Option<Token>,
        fragment_start: SchedTime,
        fade: u32,
    ) -> Option<Token> {
        let mut key_cursor = match resume_after {
            Some(tok) => self.channels[ci]
                .keyboard
                .next_active_key(tok)
                .or_else(|| self.channels[ci].keyboard.first_active_key()),
            None => self.channels[ci].keyboard.first_active_key(),
        };
        let mut visited = 0usize;
        let limit = self.channels[ci].keyboard.active_keys.len();
        while let Some((ktok, key)) = key_cursor {
            if visited >= limit {
                break;
            }
            visited += 1;
            if self.steal_from_key(ci, key as usize, fragment_start, fade) {
                return Some(ktok);
            }
            key_cursor = self.channels[ci]
                .keyboard
                .next_active_key(ktok)
                .or_else(|| self.channels[ci].keyboard.first_active_key());
        }
        None
    }

    // === voice rendering ================================================

    fn render_channel_voices(&mut self, ci: usize, frames: usize, out: &mut StereoOut<'_>) {
        let fragment_start = self.clock.fragment_start();
        let Self {
            event_pool,
            note_pool,
            voice_pool,
            channels,
            stream_readers,
            free_stream_slots: _,
            dying_stream_slots,
            pending_stream_deletions,
            disk_tx,
            metrics,
            scale_tune_factors,
            min_fade_out_samples,
            ..
        } = self;
        let ch = &mut channels[ci];
        let pitch_bend = ch.pitch_bend_factor();
        // a muted channel processing its voices contributes silence
        let channel_volume = if ch.mute { 0.0 } else { ch.volume() };
        let mut live_voices = 0usize;

        let mut key_cursor = ch.keyboard.first_active_key();
        while let Some((ktok, key)) = key_cursor {
            key_cursor = ch.keyboard.next_active_key(ktok);
            let key = key as usize;

            // flatten this key's fragment events into offset order
            let mut events: SmallVec<[KeyEvt; 8]> = SmallVec::new();
            let mut ev_cursor = event_pool.first(&ch.keyboard.keys[key].events);
            while let Some(etok) = ev_cursor {
                ev_cursor = event_pool.next(etok);
                if let Some(ev) = event_pool.get(etok) {
                    match ev.kind {
                        EventKind::ReleaseKey
                        | EventKind::CancelReleaseKey
                        | EventKind::ReleaseNote
                        | EventKind::KillNote => events.push(KeyEvt {
                            offset: ev.cached_fragment_pos().unwrap_or(0),
                            kind: ev.kind,
                            note: ev.note().and_then(|n| n.note_id),
                        }),
                        _ => {}
                    }
                }
            }
            events.sort_by_key(|e| e.offset);

            let key_volume = ch.keyboard.keys[key].volume;
            let key_pan = ch.keyboard.keys[key].pan;
            let scale_tune = scale_tune_factors[key % 12];

            let mut note_cursor = note_pool.first(&ch.keyboard.keys[key].active_notes);
            while let Some(ntok) = note_cursor {
                note_cursor = note_pool.next(ntok);
                let Some(note) = note_pool.get(ntok) else { continue };
                let overrides = note.overrides;
                let note_id = note_pool.id_of(ntok);

                let mut voice_cursor = voice_pool.first(&note.voices);
                while let Some(vtok) = voice_cursor {
                    voice_cursor = voice_pool.next(vtok);
                    let Some(voice) = voice_pool.get_mut(vtok) else {
                        continue;
                    };
                    let voice_start =
                        voice.trigger_sched_time.saturating_sub(fragment_start) as usize;
                    if voice_start >= frames {
                        // spawned for a later offset than this fragment holds
                        live_voices += 1;
                        continue;
                    }

                    let ctx = VoiceRenderCtx {
                        overrides: &overrides,
                        pitch_bend,
                        scale_tune,
                        channel_volume,
                        key_volume,
                        key_pan,
                    };

                    let mut seg_start = voice_start;
                    let mut alive = true;
                    for evt in &events {
                        let offset = (evt.offset as usize).min(frames);
                        if offset < voice_start {
                            continue;
                        }
                        if seg_start < offset && alive {
                            alive = render_segment(
                                voice,
                                stream_readers,
                                out,
                                &mut ch.fx_sends,
                                seg_start..offset,
                                &ctx,
                                metrics,
                            );
                        }
                        seg_start = offset.max(seg_start);
                        if !alive {
                            break;
                        }
                        match evt.kind {
                            EventKind::ReleaseKey => voice.release(),
                            EventKind::CancelReleaseKey => voice.cancel_release(),
                            EventKind::ReleaseNote => {
                                if evt.note == voice.note_id {
                                    voice.release();
                                }
                            }
                            EventKind::KillNote => {
                                if evt.note == voice.note_id {
                                    voice.kill(*min_fade_out_samples);
                                }
                            }
                            _ => {}
                        }
                    }
                    if alive && seg_start < frames {
                        alive = render_segment(
                            voice,
                            stream_readers,
                            out,
                            &mut ch.fx_sends,
                            seg_start..frames,
                            &ctx,
                            metrics,
                        );
                    }

                    if alive {
                        live_voices += 1;
                    } else {
                        if let Some(handle) = voice.kill_immediately() {
                            if post_command(disk_tx, DiskCommand::Kill { slot: handle.0 }) {
                                dying_stream_slots.push(handle.0);
                                *pending_stream_deletions += 1;
                            }
                            ch.stream_count = ch.stream_count.saturating_sub(1);
                        }
                        if let Some(note) = note_pool.get_mut(ntok) {
                            voice_pool.free(&mut note.voices, vtok);
                        }
                    }
                }

                // a note dies with its last voice
                let empty = note_pool.get(ntok).map(|n| n.voices.is_empty()).unwrap_or(true);
                if empty && ch.keyboard.keys[key].voice_thefts_queued == 0 {
                    note_pool.free(&mut ch.keyboard.keys[key].active_notes, ntok);
                }
            }
        }

        ch.voice_count = live_voices;
        self.active_voice_count += live_voices;
    }

    /// Re-launch note-ons postponed by voice stealing, after the regular
    /// render pass so the killed voices have vacated their slots.
    fn render_stolen_voices(&mut self, frames: usize, out: &mut StereoOut<'_>) {
        let fragment_start = self.clock.fragment_start();
        let mut cursor = self.event_pool.first(&self.steal_queue);
        while let Some(tok) = cursor {
            cursor = self.event_pool.next(tok);
            let Some(ev) = self.event_pool.get(tok).copied() else {
                continue;
            };
            let Some(ci) = ev.channel.filter(|&c| c < self.channels.len()) else {
                continue;
            };
            let Some(nev) = ev.note().copied() else { continue };
            let key = nev.key as usize;
            let offset = ev.cached_fragment_pos().unwrap_or(0).min(frames as u32) as usize;
            let trigger_time = fragment_start + offset as u64;

            self.channels[ci].keyboard.keys[key].voice_thefts_queued = self.channels[ci]
                .keyboard
                .keys[key]
                .voice_thefts_queued
                .saturating_sub(1);

            let Some(binding) = self.channels[ci].instrument().cloned() else {
                continue;
            };

            // the note usually still exists; recreate it when the steal
            // outlived it
            let note_tok = nev
                .note_id
                .and_then(|id| self.note_pool.from_id(id))
                .or_else(|| {
                    let Self {
                        note_pool,
                        channels,
                        ..
                    } = self;
                    let ch = &mut channels[ci];
                    let ntok =
                        note_pool.alloc_append(&mut ch.keyboard.keys[key].active_notes)?;
                    if let Some(note) = note_pool.get_mut(ntok) {
                        note.reset(key as u8, ev, trigger_time);
                    }
                    ch.keyboard.mark_key_active(key as u8);
                    Some(ntok)
                });
            let Some(note_tok) = note_tok else {
                self.metrics.record_note_pool_exhausted();
                continue;
            };

            let regions = {
                let ch = &self.channels[ci];
                let query = RegionQuery {
                    key: key as u8,
                    velocity: nev.velocity,
                    controllers: &ch.controllers,
                    cc64_override: None,
                    round_robin: ch.keyboard.round_robin[key],
                };
                if nev.release_trigger {
                    binding.instrument.release_regions(&query)
                } else {
                    binding.instrument.regions(&query)
                }
            };
            let Some(region) = regions.get(nev.layer as usize) else {
                continue;
            };
            let voice_type = if nev.release_trigger {
                VoiceType::ReleaseTrigger
            } else {
                VoiceType::Normal
            };
            let Some(vtok) = self.launch_voice(ci, note_tok, region, voice_type, trigger_time)
            else {
                self.metrics.record_dropped_event();
                continue;
            };

            // first render of the re-launched voice, from its offset
            let overrides = self
                .note_pool
                .get(note_tok)
                .map(|n| n.overrides)
                .unwrap_or_default();
            let Self {
                voice_pool,
                note_pool,
                channels,
                stream_readers,
                dying_stream_slots,
                pending_stream_deletions,
                disk_tx,
                metrics,
                scale_tune_factors,
                ..
            } = self;
            let ch = &mut channels[ci];
            let ctx = VoiceRenderCtx {
                overrides: &overrides,
                pitch_bend: ch.pitch_bend_factor(),
                scale_tune: scale_tune_factors[key % 12],
                channel_volume: if ch.mute { 0.0 } else { ch.volume() },
                key_volume: ch.keyboard.keys[key].volume,
                key_pan: ch.keyboard.keys[key].pan,
            };
            if let Some(voice) = voice_pool.get_mut(vtok) {
                let alive = render_segment(
                    voice,
                    stream_readers,
                    out,
                    &mut ch.fx_sends,
                    offset..frames,
                    &ctx,
                    metrics,
                );
                if alive {
                    self.active_voice_count += 1;
                    ch.voice_count += 1;
                } else {
                    if let Some(handle) = voice.kill_immediately() {
                        if post_command(disk_tx, DiskCommand::Kill { slot: handle.0 }) {
                            dying_stream_slots.push(handle.0);
                            *pending_stream_deletions += 1;
                        }
                        ch.stream_count = ch.stream_count.saturating_sub(1);
                    }
                    if let Some(note) = note_pool.get_mut(note_tok) {
                        voice_pool.free(&mut note.voices, vtok);
                    }
                }
            }

            // keys that never became active keep no events around
            if !ch.keyboard.keys[key].active && ch.keyboard.keys[key].voice_thefts_queued == 0 {
                self.event_pool
                    .clear_list(&mut ch.keyboard.keys[key].events);
            }
        }
    }

    fn post_process_channel(&mut self, ci: usize, frames: usize, out: &mut StereoOut<'_>) {
        let mut stale_scripts: SmallVec<[ripieno_core::ScriptCallbackId; 4]> = SmallVec::new();
        {
            let Self {
                event_pool,
                channels,
                ..
            } = self;
            let ch = &mut channels[ci];
            let mut key_cursor = ch.keyboard.first_active_key();
            while let Some((ktok, key)) = key_cursor {
                key_cursor = ch.keyboard.next_active_key(ktok);
                let key = key as usize;
                // the fragment's events die with the fragment
                event_pool.clear_list(&mut ch.keyboard.keys[key].events);
                let k = &ch.keyboard.keys[key];
                if k.active_notes.is_empty() && k.voice_thefts_queued == 0 {
                    if let Some(id) = ch.keyboard.keys[key].script_event.take() {
                        stale_scripts.push(id);
                    }
                    ch.keyboard.release_key_slot(key as u8);
                }
            }
            // undispatched channel-level leftovers die with the fragment too
            event_pool.clear_list(&mut ch.events);
        }
        // retained note-handler instances whose key went silent without a
        // note-off will never pair with a release handler
        for id in stale_scripts {
            if let Some(tok) = self.scripts.resolve(id) {
                self.scripts.free(tok);
            }
        }
        let ch = &mut self.channels[ci];
        for send in &mut ch.fx_sends {
            send.process(out.left, out.right, frames);
        }
    }

    // === housekeeping ===================================================

    fn collect_disposed_streams(&mut self) {
        let Self {
            stream_readers,
            free_stream_slots,
            dying_stream_slots,
            pending_stream_deletions,
            ..
        } = self;
        dying_stream_slots.retain(|&slot| {
            let reader = &mut stream_readers[slot as usize];
            if reader.is_disposed() {
                reader.drain();
                free_stream_slots.push(slot);
                *pending_stream_deletions = pending_stream_deletions.saturating_sub(1);
                false
            } else {
                true
            }
        });
    }

    /// Immediately silence a whole channel, returning streams for teardown.
    fn kill_channel_voices(&mut self, ci: usize) {
        let Self {
            event_pool,
            note_pool,
            voice_pool,
            channels,
            dying_stream_slots,
            pending_stream_deletions,
            disk_tx,
            ..
        } = self;
        let ch = &mut channels[ci];
        let mut key_cursor = ch.keyboard.first_active_key();
        while let Some((ktok, key)) = key_cursor {
            key_cursor = ch.keyboard.next_active_key(ktok);
            let key = key as usize;
            let mut note_cursor = note_pool.first(&ch.keyboard.keys[key].active_notes);
            while let Some(ntok) = note_cursor {
                note_cursor = note_pool.next(ntok);
                let Some(note) = note_pool.get(ntok) else { continue };
                let mut voice_cursor = voice_pool.first(&note.voices);
                while let Some(vtok) = voice_cursor {
                    voice_cursor = voice_pool.next(vtok);
                    if let Some(voice) = voice_pool.get_mut(vtok) {
                        if let Some(handle) = voice.kill_immediately() {
                            if post_command(disk_tx, DiskCommand::Kill { slot: handle.0 }) {
                                dying_stream_slots.push(handle.0);
                                *pending_stream_deletions += 1;
                            }
                        }
                    }
                    if let Some(note) = note_pool.get_mut(ntok) {
                        voice_pool.free(&mut note.voices, vtok);
                    }
                }
                note_pool.free(&mut ch.keyboard.keys[key].active_notes, ntok);
            }
            event_pool.clear_list(&mut ch.keyboard.keys[key].events);
            ch.keyboard.keys[key].voice_thefts_queued = 0;
            ch.keyboard.keys[key].script_event = None;
            ch.keyboard.release_key_slot(key as u8);
        }
        ch.voice_count = 0;
        ch.stream_count = 0;
    }

    /// Kill sounding members of an exclusive key group across the channel.
    fn kill_key_group(&mut self, ci: usize, group: u32) {
        let fade = self.min_fade_out_samples;
        let mut killed = false;
        let Self {
            note_pool,
            voice_pool,
            channels,
            metrics,
            ..
        } = self;
        let ch = &channels[ci];
        let mut key_cursor = ch.keyboard.first_active_key();
        while let Some((ktok, key)) = key_cursor {
            key_cursor = ch.keyboard.next_active_key(ktok);
            let mut note_cursor = note_pool.first(&ch.keyboard.keys[key as usize].active_notes);
            while let Some(ntok) = note_cursor {
                note_cursor = note_pool.next(ntok);
                let Some(note) = note_pool.get(ntok) else { continue };
                let mut voice_cursor = voice_pool.first(&note.voices);
                while let Some(vtok) = voice_cursor {
                    voice_cursor = voice_pool.next(vtok);
                    if let Some(voice) = voice_pool.get_mut(vtok) {
                        if voice.key_group() == Some(group) && voice.is_active() && !voice.is_dying()
                        {
                            voice.kill(fade);
                            killed = true;
                        }
                    }
                }
            }
        }
        if killed {
            metrics.record_key_group_kill();
        }
    }

    /// Fade out all voices on one key; release-trigger voices only when
    /// `include_release_trigger` is set.
    fn kill_voices_on_key(&mut self, ci: usize, key: usize, include_release_trigger: bool) {
        let fade = self.min_fade_out_samples;
        let Self {
            note_pool,
            voice_pool,
            channels,
            ..
        } = self;
        let ch = &channels[ci];
        let mut note_cursor = note_pool.first(&ch.keyboard.keys[key].active_notes);
        while let Some(ntok) = note_cursor {
            note_cursor = note_pool.next(ntok);
            let Some(note) = note_pool.get(ntok) else { continue };
            let mut voice_cursor = voice_pool.first(&note.voices);
            while let Some(vtok) = voice_cursor {
                voice_cursor = voice_pool.next(vtok);
                if let Some(voice) = voice_pool.get_mut(vtok) {
                    if include_release_trigger || voice.voice_type != VoiceType::ReleaseTrigger {
                        voice.kill(fade);
                    }
                }
            }
        }
    }

    /// Free a note from the key list it actually lives on (a child note's
    /// host key can differ from the event's key).
    fn free_note(&mut self, ci: usize, note_tok: Token) {
        let Self {
            note_pool,
            channels,
            ..
        } = self;
        let Some(host) = note_pool.get(note_tok).map(|n| n.host_key as usize) else {
            return;
        };
        note_pool.free(
            &mut channels[ci].keyboard.keys[host].active_notes,
            note_tok,
        );
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.disk.stop();
    }
}

/// Normalise a raw input event: stamp channel and fragment position, apply
/// transpose to real notes, reinterpret zero-velocity note-ons. Returns
/// `false` when the event must be dropped.
fn normalise_input_event(
    ev: &mut Event,
    ci: usize,
    transpose: i32,
    clock: &EventClock,
) -> bool {
    ev.channel = Some(ci);
    ev.fragment_pos(clock);
    match ev.kind {
        EventKind::NoteOn | EventKind::NoteOff => {
            let Some(nev) = ev.note_mut() else { return false };
            let key = nev.key as i32 + transpose;
            if !(0..=127).contains(&key) {
                return false;
            }
            nev.key = key as u8;
            if nev.velocity == 0 {
                // zero-velocity note-on is a note-off in disguise
                ev.kind = EventKind::NoteOff;
            }
            true
        }
        _ => true,
    }
}

/// First list position whose event offset exceeds `pos` (or ties, with
/// `before_equal`), skipping `skip`.
fn sorted_position(
    pool: &Pool<Event>,
    list: &RtList,
    pos: u32,
    before_equal: bool,
    skip: Option<Token>,
) -> Option<Token> {
    let mut cursor = pool.first(list);
    while let Some(tok) = cursor {
        if Some(tok) != skip {
            let tok_pos = pool
                .get(tok)
                .and_then(|e| e.cached_fragment_pos())
                .unwrap_or(0);
            if (before_equal && tok_pos >= pos) || (!before_equal && tok_pos > pos) {
                return Some(tok);
            }
        }
        cursor = pool.next(tok);
    }
    None
}

/// Allocate `ev` into `list` at its offset-sorted position.
fn insert_sorted(
    pool: &mut Pool<Event>,
    list: &mut RtList,
    ev: Event,
    before_equal: bool,
) -> Option<Token> {
    let pos = ev.cached_fragment_pos().unwrap_or(0);
    let tok = pool.alloc_append(list)?;
    if let Some(slot) = pool.get_mut(tok) {
        *slot = ev;
    }
    if let Some(before) = sorted_position(pool, list, pos, before_equal, Some(tok)) {
        pool.reposition_before(list, tok, Some(before));
    }
    Some(tok)
}

/// Render one segment of one voice, routing to the mains and the first FX
/// send's accumulators.
fn render_segment(
    voice: &mut Voice,
    stream_readers: &mut [StreamReader],
    out: &mut StereoOut<'_>,
    fx_sends: &mut [crate::fx::FxSend],
    range: std::ops::Range<usize>,
    ctx: &VoiceRenderCtx<'_>,
    metrics: &EngineMetrics,
) -> bool {
    if range.is_empty() {
        return voice.is_active();
    }
    let reader = voice
        .stream
        .map(|handle| handle.0 as usize)
        .map(|slot| &mut stream_readers[slot]);
    let (fx_l, fx_r) = match fx_sends.first_mut() {
        Some(send) => (
            Some(&mut send.buffers.left[..]),
            Some(&mut send.buffers.right[..]),
        ),
        None => (None, None),
    };
    voice.render(out.left, out.right, fx_l, fx_r, range, ctx, reader, metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{
        Instrument, LoopDescriptor, MemorySample, RegionData, ReleaseTrigger, SynthDefaults,
        ZoneInstrument,
    };

    const RATE: u32 = 44100;
    const FRAG: usize = 512;

    fn frag_us(n: u64) -> u64 {
        // wall-clock start of fragment n
        (n as f64 * FRAG as f64 * 1e6 / RATE as f64) as u64
    }

    fn offset_us(frag: u64, offset: u32) -> u64 {
        frag_us(frag) + (offset as f64 * 1e6 / RATE as f64 + 0.5) as u64
    }

    fn dc_instrument(sample_len: usize, release_s: f32) -> Arc<dyn Instrument> {
        let sample = Arc::new(MemorySample::new(vec![0.5; sample_len]));
        let mut region = RegionData::new(sample, 1 << 20);
        region.defaults = SynthDefaults {
            attack_s: 0.0,
            decay_s: 0.0,
            sustain_level: 1.0,
            release_s,
            ..Default::default()
        };
        let mut instrument = ZoneInstrument::new();
        instrument.add_zone((0, 127), (1, 127), Arc::new(region));
        Arc::new(instrument)
    }

    fn engine_with(instrument: Arc<dyn Instrument>, config: EngineConfig) -> (Engine, EventSender) {
        let mut engine = Engine::new(config).unwrap();
        let ci = engine.add_channel();
        engine
            .load_instrument(
                ci,
                InstrumentBinding {
                    instrument,
                    script: None,
                },
            )
            .unwrap();
        let sender = engine.event_sender(ci).unwrap();
        (engine, sender)
    }

    fn render_frag(engine: &mut Engine, n: u64) -> (Vec<f32>, Vec<f32>) {
        let mut l = vec![0.0f32; FRAG];
        let mut r = vec![0.0f32; FRAG];
        let mut out = StereoOut::new(&mut l, &mut r);
        engine.render(&mut out, frag_us(n));
        (l, r)
    }

    #[test]
    fn test_single_note_lifecycle() {
        let (mut engine, mut sender) = engine_with(
            dc_instrument(1 << 16, 0.01),
            EngineConfig::default(),
        );
        sender.note_on(60, 100, 0);
        render_frag(&mut engine, 0);
        assert_eq!(engine.active_voice_count(), 1);

        sender.note_off(60, 0, frag_us(1));
        // 10ms release at 44.1k = 441 samples, within one fragment
        render_frag(&mut engine, 1);
        render_frag(&mut engine, 2);
        assert_eq!(engine.active_voice_count(), 0);
        assert_eq!(engine.channel(0).unwrap().voice_count, 0);
    }

    #[test]
    fn test_note_starts_at_exact_fragment_offset() {
        let (mut engine, mut sender) = engine_with(
            dc_instrument(1 << 16, 0.05),
            EngineConfig::default(),
        );
        sender.note_on(60, 127, offset_us(0, 100));
        let (l, _) = render_frag(&mut engine, 0);
        assert_eq!(&l[..100], &vec![0.0; 100][..], "silent before the offset");
        assert!(l[100].abs() > 1e-4, "first rendered sample at offset 100");
    }

    #[test]
    fn test_zero_velocity_note_on_is_note_off() {
        let (mut engine, mut sender) = engine_with(
            dc_instrument(1 << 16, 0.001),
            EngineConfig::default(),
        );
        sender.note_on(60, 100, 0);
        render_frag(&mut engine, 0);
        assert_eq!(engine.active_voice_count(), 1);
        sender.note_on(60, 0, frag_us(1));
        render_frag(&mut engine, 1);
        render_frag(&mut engine, 2);
        assert_eq!(engine.active_voice_count(), 0);
    }

    #[test]
    fn test_sustain_pedal_holds_and_releases_keys() {
        let (mut engine, mut sender) = engine_with(
            dc_instrument(1 << 20, 0.001),
            EngineConfig::default(),
        );
        // pedal down, then play and release three keys
        sender.control_change(64, 127, 0);
        for (i, key) in [60u8, 62, 64].into_iter().enumerate() {
            sender.note_on(key, 100, 1000 + i as u64);
        }
        render_frag(&mut engine, 0);
        assert_eq!(engine.active_voice_count(), 3);

        for key in [60u8, 62, 64] {
            sender.note_off(key, 0, frag_us(1));
        }
        render_frag(&mut engine, 1);
        // releases are postponed by the pedal
        assert_eq!(engine.active_voice_count(), 3);

        sender.control_change(64, 0, frag_us(2));
        render_frag(&mut engine, 2);
        render_frag(&mut engine, 3);
        assert_eq!(engine.active_voice_count(), 0);
    }

    #[test]
    fn test_voice_stealing_keeps_count_at_max() {
        let config = EngineConfig {
            max_voices: 8,
            max_notes: 16,
            ..Default::default()
        };
        let (mut engine, mut sender) = engine_with(dc_instrument(1 << 20, 0.5), config);
        for key in 0..8u8 {
            sender.note_on(40 + key, 100, 0);
        }
        render_frag(&mut engine, 0);
        assert_eq!(engine.active_voice_count(), 8);

        // the ninth note steals the oldest voice
        sender.note_on(100, 100, frag_us(1));
        render_frag(&mut engine, 1);
        assert!(engine.active_voice_count() <= 8);
        assert_eq!(engine.metrics().snapshot().voices_stolen, 1);
        // the fade must complete within the configured budget
        render_frag(&mut engine, 2);
        assert_eq!(engine.active_voice_count(), 8);
    }

    #[test]
    fn test_solo_mode_kills_previous_key() {
        let (mut engine, mut sender) = engine_with(
            dc_instrument(1 << 20, 0.5),
            EngineConfig::default(),
        );
        engine.channel_mut(0).unwrap().solo_mode = true;
        sender.note_on(60, 100, 0);
        render_frag(&mut engine, 0);
        assert_eq!(engine.active_voice_count(), 1);

        sender.note_on(64, 100, frag_us(1));
        render_frag(&mut engine, 1);
        // old voice fades within min_fade_out_samples; next fragment only
        // the new key sounds
        render_frag(&mut engine, 2);
        assert_eq!(engine.active_voice_count(), 1);
        assert_eq!(engine.channel(0).unwrap().solo_key, 64);
    }

    #[test]
    fn test_release_trigger_voice_spawned_on_note_off() {
        let sample = Arc::new(MemorySample::new(vec![0.25; 4096]));
        let mut region = RegionData::new(sample, 1 << 16);
        region.defaults.attack_s = 0.0;
        region.release_trigger = ReleaseTrigger {
            note_off: true,
            ..Default::default()
        };
        let release_sample = Arc::new(MemorySample::new(vec![0.1; 2048]));
        let release_region = RegionData::new(release_sample, 1 << 16);
        let mut instrument = ZoneInstrument::new();
        instrument.add_zone((0, 127), (1, 127), Arc::new(region));
        instrument.add_release_zone((0, 127), (1, 127), Arc::new(release_region));

        let (mut engine, mut sender) = engine_with(Arc::new(instrument), EngineConfig::default());
        sender.note_on(60, 100, 0);
        render_frag(&mut engine, 0);
        assert_eq!(engine.active_voice_count(), 1);

        sender.note_off(60, 0, frag_us(1));
        render_frag(&mut engine, 1);
        // the release voice is sounding alongside (or instead of) the
        // original within this fragment
        assert!(engine.active_voice_count() >= 1);
        let snap = engine.metrics().snapshot();
        assert_eq!(snap.dropped_events, 0);
    }

    #[test]
    fn test_key_group_conflict_mutes_sounding_member() {
        let closed_hat = {
            let sample = Arc::new(MemorySample::new(vec![0.3; 1 << 16]));
            let mut region = RegionData::new(sample, 1 << 20);
            region.defaults.attack_s = 0.0;
            region.key_group = Some(1);
            Arc::new(region)
        };
        let open_hat = {
            let sample = Arc::new(MemorySample::new(vec![0.4; 1 << 16]));
            let mut region = RegionData::new(sample, 1 << 20);
            region.defaults.attack_s = 0.0;
            region.key_group = Some(1);
            Arc::new(region)
        };
        let mut instrument = ZoneInstrument::new();
        instrument.add_zone((42, 42), (1, 127), closed_hat);
        instrument.add_zone((46, 46), (1, 127), open_hat);

        let (mut engine, mut sender) = engine_with(Arc::new(instrument), EngineConfig::default());
        sender.note_on(46, 100, 0);
        render_frag(&mut engine, 0);
        assert_eq!(engine.active_voice_count(), 1);

        sender.note_on(42, 100, frag_us(1));
        render_frag(&mut engine, 1);
        render_frag(&mut engine, 2);
        // open hat was choked; only the closed hat remains
        assert_eq!(engine.active_voice_count(), 1);
        assert_eq!(engine.metrics().snapshot().key_group_kills, 1);
    }

    #[test]
    fn test_transpose_shifts_key_lookup() {
        let sample = Arc::new(MemorySample::new(vec![0.5; 1 << 16]));
        let mut region = RegionData::new(sample, 1 << 20);
        region.defaults.attack_s = 0.0;
        let mut instrument = ZoneInstrument::new();
        // only key 67 is mapped
        instrument.add_zone((67, 67), (1, 127), Arc::new(region));

        let (mut engine, mut sender) = engine_with(Arc::new(instrument), EngineConfig::default());
        // RPN 2: coarse tune +7 semitones
        sender.control_change(101, 0, 0);
        sender.control_change(100, 2, 1);
        sender.control_change(6, 71, 2);
        render_frag(&mut engine, 0);

        sender.note_on(60, 100, frag_us(1));
        render_frag(&mut engine, 1);
        assert_eq!(engine.active_voice_count(), 1);
    }

    #[test]
    fn test_suspend_all_waits_for_stream_teardown() {
        // small RAM window forces a disk stream
        let sample = Arc::new(MemorySample::new(vec![0.5; 1 << 18]));
        let region = RegionData::new(sample, 1024);
        let mut instrument = ZoneInstrument::new();
        instrument.add_zone((0, 127), (1, 127), Arc::new(region));
        let config = EngineConfig {
            ram_prefetch_frames: 1024,
            ..Default::default()
        };
        let (mut engine, mut sender) = engine_with(Arc::new(instrument), config);

        sender.note_on(60, 100, 0);
        render_frag(&mut engine, 0);
        assert_eq!(engine.active_voice_count(), 1);
        assert_eq!(engine.active_disk_stream_count(), 1);

        engine.suspend_all();
        assert_eq!(engine.active_disk_stream_count(), 0);
        let snap = engine.metrics().snapshot();
        assert_eq!(snap.streams_launched, 1);
        assert_eq!(snap.streams_deleted, 1);

        engine.resume_all();
        sender.note_on(62, 100, frag_us(10));
        render_frag(&mut engine, 10);
        assert_eq!(engine.active_voice_count(), 1);
    }

    #[test]
    fn test_looped_region_sustains_past_sample_end() {
        let sample = Arc::new(MemorySample::new(vec![0.5; 2048]));
        let mut region = RegionData::new(sample, 1 << 16);
        region.defaults.attack_s = 0.0;
        region.looping = Some(LoopDescriptor {
            start: 256,
            end: 2048,
            play_count: None,
        });
        let mut instrument = ZoneInstrument::new();
        instrument.add_zone((0, 127), (1, 127), Arc::new(region));
        let (mut engine, mut sender) = engine_with(Arc::new(instrument), EngineConfig::default());

        sender.note_on(60, 100, 0);
        // 2048-sample sample would end after 4 fragments; the loop holds it
        for n in 0..8 {
            render_frag(&mut engine, n);
            assert_eq!(engine.active_voice_count(), 1, "fragment {n}");
        }
    }

    #[test]
    fn test_mute_drops_notes_silently_but_notifies_listeners() {
        let (mut engine, mut sender) = engine_with(
            dc_instrument(1 << 16, 0.01),
            EngineConfig::default(),
        );
        let mut port = engine.add_virtual_device(0, 8).unwrap();
        engine.channel_mut(0).unwrap().mute = true;

        sender.note_on(60, 100, 0);
        let (l, _) = render_frag(&mut engine, 0);
        assert_eq!(engine.active_voice_count(), 0);
        assert!(l.iter().all(|&v| v == 0.0));
        // listeners still observe the key going down and up
        assert_eq!(
            port.next_notification(),
            Some(NoteNotification::NoteOn {
                key: 60,
                velocity: 100
            })
        );

        sender.note_off(60, 0, frag_us(1));
        render_frag(&mut engine, 1);
        assert_eq!(
            port.next_notification(),
            Some(NoteNotification::NoteOff {
                key: 60,
                velocity: 0
            })
        );
        assert_eq!(port.next_notification(), None);
    }

    #[test]
    fn test_muted_channel_keeps_rendering_when_enabled() {
        let config = EngineConfig {
            process_muted_channels: true,
            ..Default::default()
        };
        let (mut engine, mut sender) = engine_with(dc_instrument(1 << 16, 0.01), config);
        let mut port = engine.add_virtual_device(0, 8).unwrap();
        engine.channel_mut(0).unwrap().mute = true;

        sender.note_on(60, 100, 0);
        let (l, _) = render_frag(&mut engine, 0);
        // the voice is processed, its contribution silenced
        assert_eq!(engine.active_voice_count(), 1);
        assert!(l.iter().all(|&v| v == 0.0));
        assert_eq!(
            port.next_notification(),
            Some(NoteNotification::NoteOn {
                key: 60,
                velocity: 100
            })
        );

        sender.note_off(60, 0, frag_us(1));
        render_frag(&mut engine, 1);
        render_frag(&mut engine, 2);
        assert_eq!(engine.active_voice_count(), 0);
        assert_eq!(
            port.next_notification(),
            Some(NoteNotification::NoteOff {
                key: 60,
                velocity: 0
            })
        );
    }

    #[test]
    fn test_scale_tuning_applied_next_fragment() {
        let (mut engine, mut sender) = engine_with(
            dc_instrument(1 << 20, 0.5),
            EngineConfig::default(),
        );
        let mut cents = [0i8; 12];
        cents[0] = 50; // all Cs half a semitone sharp
        engine.set_scale_tuning(cents);
        sender.note_on(60, 100, 0);
        render_frag(&mut engine, 0);
        assert_eq!(engine.active_voice_count(), 1);
        // factor table was recomputed on the fragment boundary
        assert!((engine.scale_tune_factors[0] - 2.0f32.powf(50.0 / 1200.0)).abs() < 1e-5);
    }
}
