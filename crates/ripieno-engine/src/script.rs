//! Real-time instrument script host.
//!
//! Script handlers run on the audio thread under cooperative suspension:
//! the handler returns a status word instead of blocking, and a suspended
//! instance is re-queued at the precise sample time its `wait()` asked for.
//! Handlers are externally compiled callables; this module owns their
//! execution contexts, the suspension queue and the fork bookkeeping.

use ripieno_core::{
    Event, EventClock, NoteId, Pool, RtList, SchedTime, ScheduledQueue, ScriptCallbackId,
    SynthParam, Token,
};
use smallvec::SmallVec;
use std::sync::Arc;

/// Polyphonic variable slots carried from a `note` handler to its matching
/// `release` handler.
pub const POLYPHONIC_SLOTS: usize = 16;

/// Result of one execution slice of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStatus {
    Finished,
    /// Re-run this instance `resume_us` microseconds from its current
    /// position (built-in `wait()`), or at the instruction budget boundary
    /// (`resume_us == 0`).
    Suspended { resume_us: u64 },
}

/// Side effect requested by a handler, applied by the engine after the
/// execution slice returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScriptAction {
    /// Spawn a note, optionally delayed, as a child of the causing note.
    PlayNote {
        key: u8,
        velocity: u8,
        delay_us: u64,
    },
    /// Release one note (built-in `note_off()`).
    StopNote { note: NoteId },
    /// Fast fade-out of one note (built-in `fade_out()`).
    KillNote { note: NoteId },
    /// Change one of the causing note's synthesis parameters.
    ChangeParam {
        note: NoteId,
        param: SynthParam,
        value: f32,
        relative: bool,
    },
    /// Drop the causing event before regular dispatch.
    IgnoreEvent,
    /// Copy this execution instance (built-in `fork()`).
    Fork { children: u32 },
}

/// Execution state of one handler instance.
#[derive(Debug, Clone)]
pub struct ScriptContext {
    /// Copy of the event that spawned this instance.
    pub cause: Event,
    pub note_id: Option<NoteId>,
    pub polyphonic: [i64; POLYPHONIC_SLOTS],
    /// Handler-managed state machine cursor across suspensions.
    pub resume_point: u32,
    /// Instructions consumed in the current fragment.
    pub instructions: u32,
    /// Per-fragment instruction allowance.
    pub budget: u32,
    /// Set by `stop_wait(forever)`: all future waits complete immediately.
    pub wait_disabled: bool,
    /// Times this instance has been (re-)entered.
    pub execution_slices: u32,
    actions: SmallVec<[ScriptAction; 4]>,
}

impl Default for ScriptContext {
    fn default() -> Self {
        Self {
            cause: Event::default(),
            note_id: None,
            polyphonic: [0; POLYPHONIC_SLOTS],
            resume_point: 0,
            instructions: 0,
            budget: 0,
            wait_disabled: false,
            execution_slices: 0,
            actions: SmallVec::new(),
        }
    }
}

impl ScriptContext {
    pub fn emit(&mut self, action: ScriptAction) {
        self.actions.push(action);
    }

    /// Account `n` instructions; returns `false` once the budget for this
    /// fragment is spent and the handler should suspend.
    pub fn consume(&mut self, n: u32) -> bool {
        self.instructions = self.instructions.saturating_add(n);
        self.instructions <= self.budget
    }

    pub fn over_budget(&self) -> bool {
        self.instructions > self.budget
    }

    fn take_actions(&mut self) -> SmallVec<[ScriptAction; 4]> {
        std::mem::take(&mut self.actions)
    }
}

/// One compiled event handler.
pub trait ScriptHandler: Send + Sync {
    fn execute(&self, ctx: &mut ScriptContext) -> ScriptStatus;
}

impl<F> ScriptHandler for F
where
    F: Fn(&mut ScriptContext) -> ScriptStatus + Send + Sync,
{
    fn execute(&self, ctx: &mut ScriptContext) -> ScriptStatus {
        self(ctx)
    }
}

/// The handlers of one loaded script.
#[derive(Default, Clone)]
pub struct ScriptProgram {
    pub on_init: Option<Arc<dyn ScriptHandler>>,
    pub on_note: Option<Arc<dyn ScriptHandler>>,
    pub on_release: Option<Arc<dyn ScriptHandler>>,
    pub on_controller: Option<Arc<dyn ScriptHandler>>,
}

/// Which handler an instance is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerPhase {
    Init,
    #[default]
    Note,
    Release,
    Controller,
}

/// A pooled handler instance: context plus scheduling bookkeeping.
#[derive(Default)]
pub struct ScriptEvent {
    pub ctx: ScriptContext,
    pub phase: HandlerPhase,
    pub handler: Option<Arc<dyn ScriptHandler>>,
    pub parent: Option<ScriptCallbackId>,
    /// Terminate this instance when its parent handler terminates.
    pub auto_abort_by_parent: bool,
    pub forked_children: u32,
}

/// Outcome of one execution slice, for the engine to apply.
pub struct RunOutcome {
    pub actions: SmallVec<[ScriptAction; 4]>,
    pub finished: bool,
}

/// Owns the script event pool and the sample-accurate suspension queue.
pub struct ScriptRunner {
    pool: Pool<ScriptEvent>,
    live: RtList,
    queue: ScheduledQueue<ScriptCallbackId>,
    budget: u32,
    max_fork: u32,
}

impl ScriptRunner {
    pub fn new(capacity: usize, budget: u32, max_fork: u32) -> Self {
        Self {
            pool: Pool::new(capacity),
            live: RtList::new(),
            queue: ScheduledQueue::new(),
            budget,
            max_fork,
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn suspended_count(&self) -> usize {
        self.queue.len()
    }

    pub fn id_of(&self, token: Token) -> Option<ScriptCallbackId> {
        self.pool.id_of(token)
    }

    pub fn resolve(&self, id: ScriptCallbackId) -> Option<Token> {
        self.pool.from_id(id)
    }

    pub fn get(&self, token: Token) -> Option<&ScriptEvent> {
        self.pool.get(token)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut ScriptEvent> {
        self.pool.get_mut(token)
    }

    /// Allocate an instance for `handler`; `None` when the pool is dry.
    pub fn spawn(
        &mut self,
        handler: Arc<dyn ScriptHandler>,
        phase: HandlerPhase,
        cause: Event,
        note_id: Option<NoteId>,
    ) -> Option<Token> {
        let token = self.pool.alloc_append(&mut self.live)?;
        if let Some(ev) = self.pool.get_mut(token) {
            ev.ctx = ScriptContext {
                cause,
                note_id,
                ..Default::default()
            };
            ev.phase = phase;
            ev.handler = Some(handler);
            ev.parent = None;
            ev.auto_abort_by_parent = false;
            ev.forked_children = 0;
        }
        Some(token)
    }

    /// Run one execution slice. `fragment_pos_base` anchors any `wait()`
    /// the handler issues to the correct sample of the current fragment.
    pub fn run(
        &mut self,
        token: Token,
        clock: &EventClock,
        fragment_pos_base: u32,
        metrics: &crate::metrics::EngineMetrics,
    ) -> Option<RunOutcome> {
        let budget = self.budget;
        let ev = self.pool.get_mut(token)?;
        let handler = ev.handler.clone()?;
        ev.ctx.instructions = 0;
        ev.ctx.budget = budget;
        ev.ctx.execution_slices += 1;
        let status = handler.execute(&mut ev.ctx);
        if ev.ctx.over_budget() {
            metrics.record_script_overrun();
        }
        let actions = ev.ctx.take_actions();
        let wait_disabled = ev.ctx.wait_disabled;

        match status {
            ScriptStatus::Finished => Some(RunOutcome {
                actions,
                finished: true,
            }),
            ScriptStatus::Suspended { resume_us } => {
                let id = self.pool.id_of(token)?;
                let time = if wait_disabled || resume_us == 0 {
                    // resume at the next fragment boundary
                    clock.fragment_end()
                } else {
                    clock.schedule_time_ahead(fragment_pos_base, resume_us)
                };
                self.queue.schedule(time, id);
                Some(RunOutcome {
                    actions,
                    finished: false,
                })
            }
        }
    }

    /// Next suspended instance due before scheduler time `end`.
    pub fn resume_due(&mut self, end: SchedTime) -> Option<(SchedTime, Token)> {
        while let Some((time, id)) = self.queue.pop_before(end) {
            if let Some(token) = self.pool.from_id(id) {
                return Some((time, token));
            }
            // stale id: instance was freed while queued
        }
        None
    }

    /// Deep-copy `parent`'s execution state into a new instance. Bounded by
    /// the per-handler fork allowance.
    pub fn fork(&mut self, parent: Token, auto_abort: bool) -> Option<Token> {
        let (ctx, phase, handler, children, parent_id) = {
            let ev = self.pool.get(parent)?;
            if ev.forked_children >= self.max_fork {
                return None;
            }
            (
                ev.ctx.clone(),
                ev.phase,
                ev.handler.clone(),
                ev.forked_children,
                self.pool.id_of(parent)?,
            )
        };
        let token = self.pool.alloc_append(&mut self.live)?;
        if let Some(child) = self.pool.get_mut(token) {
            child.ctx = ctx;
            child.ctx.execution_slices = 0;
            child.phase = phase;
            child.handler = handler;
            child.parent = Some(parent_id);
            child.auto_abort_by_parent = auto_abort;
            child.forked_children = 0;
        }
        if let Some(parent_ev) = self.pool.get_mut(parent) {
            parent_ev.forked_children = children + 1;
        }
        Some(token)
    }

    /// Force a suspended instance to resume immediately; `forever` also
    /// disables all of its future waits.
    pub fn stop_wait(&mut self, id: ScriptCallbackId, forever: bool, now: SchedTime) -> bool {
        let token = match self.pool.from_id(id) {
            Some(t) => t,
            None => return false,
        };
        let was_queued = self.queue.remove_first(|&queued| queued == id).is_some();
        if let Some(ev) = self.pool.get_mut(token) {
            if forever {
                ev.ctx.wait_disabled = true;
            }
        }
        if was_queued {
            self.queue.schedule(now, id);
        }
        was_queued
    }

    /// Free an instance and abort any children flagged auto-abort.
    pub fn free(&mut self, token: Token) {
        let id = self.pool.id_of(token);
        self.pool.free(&mut self.live, token);
        let Some(parent_id) = id else { return };

        // collect matching children first; freeing invalidates iteration
        let mut doomed: SmallVec<[Token; 4]> = SmallVec::new();
        let mut cursor = self.pool.first(&self.live);
        while let Some(tok) = cursor {
            cursor = self.pool.next(tok);
            if let Some(ev) = self.pool.get(tok) {
                if ev.auto_abort_by_parent && ev.parent == Some(parent_id) {
                    doomed.push(tok);
                }
            }
        }
        for tok in doomed {
            self.free(tok);
        }
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.pool.clear_list(&mut self.live);
    }
}
