//! Per-voice disk streams.
//!
//! A stream is one SPSC ring: the disk thread owns the writer half and
//! refills it from a [`SampleSource`], the audio thread owns the reader
//! half and consumes frames during voice rendering. Streams live in a
//! fixed slot array created at engine start; launching and killing only
//! rebind a slot, they never allocate.

use crate::instrument::{LoopDescriptor, RegionData, SampleSource};
use ripieno_core::{ring_buffer, AtomicFlag, RingConsumer, RingProducer};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Index of a stream slot handed to a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u32);

/// Playback state of a stream, published by the disk thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Unused = 0,
    Active = 1,
    /// The sample (or its final loop pass) has been fully read; the ring
    /// still holds the tail.
    End = 2,
}

impl StreamState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => StreamState::Active,
            2 => StreamState::End,
            _ => StreamState::Unused,
        }
    }
}

/// State shared between the two halves of one stream slot.
#[derive(Debug)]
pub struct StreamShared {
    state: AtomicU8,
    /// Set by the disk thread once a kill has been fully processed; the
    /// audio thread may then recycle the slot.
    disposed: AtomicFlag,
}

impl StreamShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(StreamState::Unused as u8),
            disposed: AtomicFlag::new(false),
        }
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }
}

/// Audio-thread half: consumes frames during voice rendering.
pub struct StreamReader {
    cons: RingConsumer<f32>,
    shared: Arc<StreamShared>,
}

impl StreamReader {
    pub fn available(&self) -> usize {
        self.cons.read_space()
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// All data read and the producer has finished.
    pub fn exhausted(&self) -> bool {
        self.shared.state() == StreamState::End && self.cons.is_empty()
    }

    #[inline]
    pub fn pop(&mut self) -> Option<f32> {
        self.cons.pop()
    }

    pub fn read(&mut self, out: &mut [f32]) -> usize {
        self.cons.pop_slice(out)
    }

    /// Drop buffered frames after a kill so the slot starts clean.
    pub fn drain(&mut self) {
        self.cons.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }
}

/// Disk-thread half: refills the ring from sample storage.
pub struct StreamWriter {
    prod: RingProducer<f32>,
    shared: Arc<StreamShared>,
    region: Option<Arc<RegionData>>,
    /// Next frame to read from the sample.
    pos: u64,
    looping: Option<LoopDescriptor>,
    /// Remaining passes of a finite loop; `None` while looping infinitely.
    loop_cycles_left: Option<u32>,
}

impl StreamWriter {
    pub fn is_active(&self) -> bool {
        self.region.is_some()
    }

    pub fn write_space(&self) -> usize {
        self.prod.write_space()
    }

    /// Bind this slot to a region and start filling from `start_frame`.
    pub fn launch(&mut self, region: Arc<RegionData>, start_frame: u64, do_loop: bool) {
        self.looping = if do_loop { region.looping } else { None };
        self.loop_cycles_left = self.looping.and_then(|l| l.play_count);
        self.pos = match self.looping {
            // a start at or past the loop end folds back into the loop body
            Some(l) if start_frame >= l.end && l.end > l.start => {
                l.start + (start_frame - l.start) % (l.end - l.start)
            }
            _ => start_frame,
        };
        self.region = Some(region);
        self.shared.disposed.set(false);
        self.shared.set_state(StreamState::Active);
    }

    /// Tear the slot down and acknowledge towards the audio thread.
    pub fn kill(&mut self) {
        self.region = None;
        self.looping = None;
        self.loop_cycles_left = None;
        self.pos = 0;
        self.shared.set_state(StreamState::Unused);
        self.shared.disposed.set(true);
    }

    /// Refill up to `max_frames`, honouring loop crossings. Returns frames
    /// written to the ring.
    pub fn refill(&mut self, max_frames: usize, scratch: &mut Vec<f32>) -> usize {
        let region = match &self.region {
            Some(r) => Arc::clone(r),
            None => return 0,
        };
        let sample: &Arc<dyn SampleSource> = &region.sample;
        let budget = self.prod.write_space().min(max_frames);
        let mut written = 0;

        while written < budget {
            let want = budget - written;
            // limit the read to the loop end while the loop is live
            let (chunk, at_loop_end) = match self.looping {
                Some(l) if self.pos < l.end => {
                    let to_end = (l.end - self.pos) as usize;
                    (want.min(to_end), want >= to_end)
                }
                _ => (want, false),
            };

            scratch.resize(chunk, 0.0);
            let got = sample.read(self.pos, &mut scratch[..chunk]);
            if got == 0 {
                // storage exhausted (covers loop points past the sample end)
                self.shared.set_state(StreamState::End);
                break;
            }
            let pushed = self.prod.push_slice(&scratch[..got]);
            self.pos += pushed as u64;
            written += pushed;

            if pushed < chunk && !at_loop_end {
                // end of sample reached (or ring filled mid-chunk)
                if got < chunk {
                    self.shared.set_state(StreamState::End);
                }
                break;
            }

            if at_loop_end && self.pos >= self.looping.map(|l| l.end).unwrap_or(u64::MAX) {
                match self.loop_cycles_left {
                    Some(cycles) if cycles <= 1 => {
                        // final pass done; continue linearly to the end
                        self.looping = None;
                        self.loop_cycles_left = None;
                    }
                    Some(cycles) => {
                        self.loop_cycles_left = Some(cycles - 1);
                        if let Some(l) = self.looping {
                            self.pos = l.start;
                        }
                    }
                    None => {
                        if let Some(l) = self.looping {
                            self.pos = l.start;
                        }
                    }
                }
            }

            if pushed < got {
                break; // ring full
            }
        }

        if self.looping.is_none() && self.pos >= sample.frames() {
            self.shared.set_state(StreamState::End);
        }
        written
    }
}

/// Create one stream slot: a connected writer/reader pair plus shared state.
pub fn stream_pair(ring_frames: usize) -> (StreamWriter, StreamReader) {
    let (prod, cons) = ring_buffer(ring_frames);
    let shared = Arc::new(StreamShared::new());
    (
        StreamWriter {
            prod,
            shared: Arc::clone(&shared),
            region: None,
            pos: 0,
            looping: None,
            loop_cycles_left: None,
        },
        StreamReader { cons, shared },
    )
}
