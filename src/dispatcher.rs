//! Frame admission and worker lifecycle.
//!
//! [`FrameDispatcher::submit`] is called by the acquisition loop for every
//! frame. While the pool is full it polls the active-worker counter with a
//! short sleep; frames are never queued. An admitted frame moves into its
//! own detached worker thread, which returns the pool slot through a scope
//! guard on every exit path.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::context::PipelineContext;
use crate::frame::Frame;
use crate::maps::CorrectionMaps;
use crate::sink::FrameSink;
use crate::worker::process_frame;

/// Counters over the lifetime of a dispatcher.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchStats {
    /// Frames admitted.
    pub submitted: u64,
    /// Frames that went through the pipeline, warm-up frames included.
    pub completed: u64,
    /// Frames dropped for malformed input or a failed thread spawn.
    pub failed: u64,
    /// Warm-up frames.
    pub digested: u64,
    /// Frames some hit-role policy fired on.
    pub hits: u64,
    /// Smoothed submission rate, frames per second.
    pub frame_rate: f64,
}

struct StatsState {
    stats: DispatchStats,
    last_submit: Option<Instant>,
}

struct Shared {
    ctx: PipelineContext,
    sinks: Vec<Arc<dyn FrameSink>>,
    active: AtomicUsize,
    stats: Mutex<StatsState>,
}

impl Shared {
    fn record<F: FnOnce(&mut DispatchStats)>(&self, f: F) {
        f(&mut self.stats.lock().stats);
    }

    fn flush(&self) {
        let snapshots = self.ctx.aggregator().snapshots();
        debug!("flushing {} running sums", snapshots.len());
        for sink in &self.sinks {
            sink.running_sums(&snapshots);
        }
    }
}

/// Owns one pool slot; dropping it frees the slot.
///
/// A worker unwinding with a slot held has left shared state in an unknown
/// condition, so the process aborts instead.
struct SlotGuard {
    shared: Arc<Shared>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("worker panicked while holding a pool slot, aborting");
            std::process::abort();
        }
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct FrameDispatcher {
    shared: Arc<Shared>,
    next_worker: AtomicU64,
}

impl FrameDispatcher {
    pub fn new(
        config: PipelineConfig,
        maps: CorrectionMaps,
        sinks: Vec<Arc<dyn FrameSink>>,
    ) -> Result<Self> {
        Ok(Self::from_context(PipelineContext::new(config, maps)?, sinks))
    }

    /// Dispatcher over an already built context.
    pub fn from_context(ctx: PipelineContext, sinks: Vec<Arc<dyn FrameSink>>) -> Self {
        info!(
            "dispatcher ready: pool capacity {}, {} sinks",
            ctx.config().dispatch.pool_capacity,
            sinks.len()
        );
        Self {
            shared: Arc::new(Shared {
                ctx,
                sinks,
                active: AtomicUsize::new(0),
                stats: Mutex::new(StatsState {
                    stats: DispatchStats::default(),
                    last_submit: None,
                }),
            }),
            next_worker: AtomicU64::new(0),
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.shared.ctx
    }

    /// Workers currently holding a pool slot.
    pub fn active_workers(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.stats.lock().stats.clone()
    }

    /// Admit a frame and start its worker. Polls while the pool is full.
    ///
    /// Returns the worker id, starting at 1.
    pub fn submit(&self, frame: Frame) -> u64 {
        let dispatch = &self.shared.ctx.config().dispatch;
        self.acquire_slot();
        let slot = SlotGuard {
            shared: Arc::clone(&self.shared),
        };

        let worker_id = self.next_worker.fetch_add(1, Ordering::Relaxed) + 1;
        let flush_due = {
            let mut state = self.shared.stats.lock();
            let now = Instant::now();
            if let Some(last) = state.last_submit {
                let dt = now.duration_since(last).as_secs_f64();
                if dt > 0.0 {
                    let instant = 1.0 / dt;
                    state.stats.frame_rate = if state.stats.frame_rate == 0.0 {
                        instant
                    } else {
                        (instant + 9.0 * state.stats.frame_rate) / 10.0
                    };
                }
            }
            state.last_submit = Some(now);
            state.stats.submitted += 1;
            let past_warm_up = state.stats.submitted.saturating_sub(dispatch.start_frames);
            dispatch.save_interval > 0
                && past_warm_up > 0
                && past_warm_up % dispatch.save_interval == 0
        };

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("frameproc-worker-{}", worker_id))
            .spawn(move || {
                let _slot = slot;
                run_worker(&shared, worker_id, frame);
            });
        if let Err(e) = spawned {
            // The closure, and with it the slot, has been dropped.
            error!("failed to start worker {}: {}; frame dropped", worker_id, e);
            self.shared.record(|s| s.failed += 1);
        }

        if flush_due {
            self.wait_idle();
            self.shared.flush();
        }
        worker_id
    }

    fn acquire_slot(&self) {
        let dispatch = &self.shared.ctx.config().dispatch;
        let active = &self.shared.active;
        loop {
            let current = active.load(Ordering::Acquire);
            if current < dispatch.pool_capacity {
                if active
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            thread::sleep(dispatch.poll_interval);
        }
    }

    /// Block until no worker is in flight.
    pub fn wait_idle(&self) {
        let poll = self.shared.ctx.config().dispatch.poll_interval;
        while self.active_workers() > 0 {
            thread::sleep(poll);
        }
    }

    /// Hand the current running sums to every sink.
    pub fn flush(&self) {
        self.shared.flush();
    }

    /// Swap in new calibration maps. Refused while workers are in flight.
    ///
    /// The whole pool is claimed for the duration of the swap, so a
    /// concurrent [`submit`](Self::submit) waits for it to finish.
    pub fn replace_maps(&self, maps: CorrectionMaps) -> Result<()> {
        let capacity = self.shared.ctx.config().dispatch.pool_capacity;
        if let Err(active) =
            self.shared
                .active
                .compare_exchange(0, capacity, Ordering::AcqRel, Ordering::Acquire)
        {
            bail!(
                "cannot replace calibration maps with {} workers in flight",
                active
            );
        }
        let replaced = self.shared.ctx.replace_maps(maps);
        self.shared.active.store(0, Ordering::Release);
        replaced
    }

    /// Drain the pool, flush the running sums one last time and return the
    /// final counters.
    pub fn finish(self) -> DispatchStats {
        self.wait_idle();
        self.shared.flush();
        let stats = self.stats();
        info!(
            "processed {} frames: {} hits, {} warm-up, {} failed",
            stats.completed, stats.hits, stats.digested, stats.failed
        );
        stats
    }
}

fn run_worker(shared: &Shared, worker_id: u64, frame: Frame) {
    match process_frame(&shared.ctx, worker_id, frame) {
        Ok(outcome) => {
            for sink in &shared.sinks {
                sink.frame_processed(&outcome);
            }
            shared.record(|s| {
                s.completed += 1;
                s.digested += outcome.digested as u64;
                s.hits += outcome.is_hit as u64;
            });
        }
        Err(e) => {
            warn!("worker {}: {}", worker_id, e);
            shared.record(|s| s.failed += 1);
        }
    }
}
