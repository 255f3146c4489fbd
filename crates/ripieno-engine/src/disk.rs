//! Disk thread: background refill of voice stream rings.
//!
//! The audio thread posts launch/kill commands over a bounded channel and
//! never touches storage itself. Each cycle the disk thread services
//! commands, then refills the most-drained streams, bounded per run so one
//! hungry stream cannot starve the rest.

use crate::instrument::RegionData;
use crate::metrics::EngineMetrics;
use crate::stream::StreamWriter;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thread_priority::ThreadPriority;

/// Command posted from the audio thread to the disk thread.
pub enum DiskCommand {
    /// Bind a stream slot to a region and start refilling.
    Launch {
        slot: u32,
        region: Arc<RegionData>,
        start_frame: u64,
        do_loop: bool,
    },
    /// Tear a slot down; acknowledged through the slot's disposed flag and
    /// the deletion counter.
    Kill { slot: u32 },
    /// Stop the thread.
    Shutdown,
}

impl std::fmt::Debug for DiskCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskCommand::Launch {
                slot, start_frame, ..
            } => f
                .debug_struct("Launch")
                .field("slot", slot)
                .field("start_frame", start_frame)
                .finish(),
            DiskCommand::Kill { slot } => f.debug_struct("Kill").field("slot", slot).finish(),
            DiskCommand::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Refill tuning handed to the disk thread at start.
#[derive(Debug, Clone, Copy)]
pub struct DiskConfig {
    /// Streams with at least this much free ring space get refilled.
    pub min_refill: usize,
    /// Frames read from storage per stream per cycle, at most.
    pub max_refill: usize,
    /// Streams refilled per cycle.
    pub streams_per_run: usize,
}

/// Handle owning the disk thread.
pub struct DiskThread {
    command_tx: Sender<DiskCommand>,
    command_rx: Option<Receiver<DiskCommand>>,
    writers: Option<Vec<StreamWriter>>,
    config: DiskConfig,
    thread_handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    deleted: Arc<AtomicU64>,
    metrics: Arc<EngineMetrics>,
}

impl DiskThread {
    pub fn new(writers: Vec<StreamWriter>, config: DiskConfig, metrics: Arc<EngineMetrics>) -> Self {
        let (tx, rx) = bounded(writers.len().max(1) * 4);
        Self {
            command_tx: tx,
            command_rx: Some(rx),
            writers: Some(writers),
            config,
            thread_handle: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            deleted: Arc::new(AtomicU64::new(0)),
            metrics,
        }
    }

    pub fn command_sender(&self) -> Sender<DiskCommand> {
        self.command_tx.clone()
    }

    /// Running count of kill acknowledgements, for the stream-teardown
    /// handshake (`SuspendAll` waits until this catches up).
    pub fn deleted_streams(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.deleted)
    }

    pub fn start(&mut self) {
        if self.thread_handle.is_some() {
            return;
        }
        let rx = match self.command_rx.take() {
            Some(rx) => rx,
            None => return,
        };
        let writers = match self.writers.take() {
            Some(w) => w,
            None => return,
        };
        let shutdown = Arc::clone(&self.shutdown);
        let deleted = Arc::clone(&self.deleted);
        let metrics = Arc::clone(&self.metrics);
        let config = self.config;

        let handle = thread::Builder::new()
            .name("ripieno-disk".into())
            .spawn(move || {
                let _ = thread_priority::set_current_thread_priority(ThreadPriority::Max);
                disk_loop(rx, writers, config, shutdown, deleted, metrics);
            })
            .expect("failed to spawn disk thread");

        self.thread_handle = Some(handle);
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.command_tx.try_send(DiskCommand::Shutdown);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DiskThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn disk_loop(
    rx: Receiver<DiskCommand>,
    mut writers: Vec<StreamWriter>,
    config: DiskConfig,
    shutdown: Arc<AtomicBool>,
    deleted: Arc<AtomicU64>,
    metrics: Arc<EngineMetrics>,
) {
    let mut scratch: Vec<f32> = Vec::with_capacity(config.max_refill);
    let mut candidates: Vec<usize> = Vec::with_capacity(writers.len());

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let mut disconnected = false;
        loop {
            match rx.try_recv() {
                Ok(DiskCommand::Launch {
                    slot,
                    region,
                    start_frame,
                    do_loop,
                }) => {
                    if let Some(writer) = writers.get_mut(slot as usize) {
                        tracing::debug!(slot, start_frame, "launching disk stream");
                        writer.launch(region, start_frame, do_loop);
                        metrics.record_stream_launched();
                    } else {
                        tracing::warn!(slot, "launch for unknown stream slot");
                    }
                }
                Ok(DiskCommand::Kill { slot }) => {
                    if let Some(writer) = writers.get_mut(slot as usize) {
                        tracing::debug!(slot, "killing disk stream");
                        writer.kill();
                        deleted.fetch_add(1, Ordering::Release);
                        metrics.record_stream_deleted();
                    }
                }
                Ok(DiskCommand::Shutdown) => return,
                Err(crossbeam_channel::TryRecvError::Empty) => break,
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }
        if disconnected {
            return;
        }

        // refill the most-drained active streams first
        candidates.clear();
        candidates.extend(
            writers
                .iter()
                .enumerate()
                .filter(|(_, w)| w.is_active() && w.write_space() >= config.min_refill)
                .map(|(i, _)| i),
        );
        candidates.sort_by_key(|&i| std::cmp::Reverse(writers[i].write_space()));
        candidates.truncate(config.streams_per_run);

        let mut refilled = 0;
        for &i in &candidates {
            refilled += writers[i].refill(config.max_refill, &mut scratch);
        }

        if refilled == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Post a command without blocking; audio-thread safe.
pub fn post_command(tx: &Sender<DiskCommand>, cmd: DiskCommand) -> bool {
    match tx.try_send(cmd) {
        Ok(()) => true,
        Err(TrySendError::Full(cmd)) => {
            tracing::warn!(?cmd, "disk command queue full, command dropped");
            false
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MemorySample;
    use crate::stream::stream_pair;
    use std::time::Instant;

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_launch_refills_and_kill_acknowledges() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (writer, mut reader) = stream_pair(4096);
        let metrics = Arc::new(EngineMetrics::new());
        let mut disk = DiskThread::new(
            vec![writer],
            DiskConfig {
                min_refill: 64,
                max_refill: 1024,
                streams_per_run: 4,
            },
            metrics,
        );
        disk.start();
        let tx = disk.command_sender();
        let deleted = disk.deleted_streams();

        let sample = Arc::new(MemorySample::new((0..10_000).map(|i| i as f32).collect()));
        let region = Arc::new(RegionData::new(sample, 128));
        assert!(post_command(
            &tx,
            DiskCommand::Launch {
                slot: 0,
                region,
                start_frame: 128,
                do_loop: false,
            },
        ));

        wait_until(|| reader.available() >= 1024);
        let mut out = [0.0f32; 4];
        reader.read(&mut out);
        assert_eq!(out, [128.0, 129.0, 130.0, 131.0]);

        assert!(post_command(&tx, DiskCommand::Kill { slot: 0 }));
        wait_until(|| deleted.load(Ordering::Acquire) == 1);
        wait_until(|| reader.is_disposed());

        disk.stop();
    }

    #[test]
    fn test_reader_never_starves_at_realtime_rate() {
        // stream a long sample while consuming at 1x; the reader must
        // always find a contiguous block or the producer must be at End
        let (writer, mut reader) = stream_pair(8192);
        let metrics = Arc::new(EngineMetrics::new());
        let mut disk = DiskThread::new(
            vec![writer],
            DiskConfig {
                min_refill: 512,
                max_refill: 4096,
                streams_per_run: 2,
            },
            metrics,
        );
        disk.start();
        let tx = disk.command_sender();

        let total = 100_000usize;
        let sample = Arc::new(MemorySample::new((0..total).map(|i| i as f32).collect()));
        let region = Arc::new(RegionData::new(sample, 1024));
        post_command(
            &tx,
            DiskCommand::Launch {
                slot: 0,
                region,
                start_frame: 0,
                do_loop: false,
            },
        );

        wait_until(|| reader.available() >= 4096);

        let mut consumed = 0usize;
        let mut expect = 0.0f32;
        let mut block = [0.0f32; 512];
        while consumed < total {
            let n = reader.read(&mut block);
            if n == 0 {
                assert!(
                    !reader.exhausted() || consumed == total,
                    "stream ended early at {consumed}"
                );
                thread::sleep(Duration::from_micros(200));
                continue;
            }
            for &v in &block[..n] {
                assert_eq!(v, expect);
                expect += 1.0;
            }
            consumed += n;
            // roughly real-time pacing at 44.1kHz
            thread::sleep(Duration::from_micros(100));
        }
        disk.stop();
    }
}
