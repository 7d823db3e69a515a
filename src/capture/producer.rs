//! Periodic frame producer
//!
//! Each tick takes the head of the pending queue, paints the test pattern
//! into it and marks it DONE. Ticks with nothing queued are normal and
//! leave no trace besides the idle counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::capture::format::{PixelFormat, Rgb};
use crate::capture::pool::BufferInfo;
use crate::capture::session::{DeviceShared, DeviceState};

/// Colors of the top, middle and bottom thirds of every frame.
pub const PATTERN_BANDS: [Rgb; 3] = [Rgb::BLUE, Rgb::GREEN, Rgb::RED];

/// Paint three horizontal bands into `data` using `format`'s byte layout.
///
/// The frame is split by byte offset into three equal parts, so a frame
/// whose height is a multiple of three gets bands aligned on rows.
pub fn fill_pattern(format: &PixelFormat, data: &mut [u8]) {
    let bpp = format.bytes_per_pixel();
    if bpp == 0 {
        return;
    }
    let third = data.len() / 3;

    for (i, pixel) in data.chunks_exact_mut(bpp).enumerate() {
        let offset = i * bpp;
        let band = if offset < third {
            0
        } else if offset < third * 2 {
            1
        } else {
            2
        };
        format.write_pixel(PATTERN_BANDS[band], pixel);
    }
}

/// Callback run on every producer tick.
pub type TickFn = Box<dyn Fn() + Send + Sync>;

/// Runs a tick callback periodically until its token is cancelled.
pub trait TickScheduler: Send + Sync {
    fn schedule(&self, period: Duration, cancel: CancellationToken, tick: TickFn);
}

/// Scheduler backed by a tokio interval task.
pub struct TokioScheduler {
    handle: Handle,
    first_delay: Duration,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            first_delay: Duration::ZERO,
        }
    }

    /// Delay before the first tick after a stream starts.
    pub fn with_first_delay(mut self, delay: Duration) -> Self {
        self.first_delay = delay;
        self
    }
}

impl TickScheduler for TokioScheduler {
    fn schedule(&self, period: Duration, cancel: CancellationToken, tick: TickFn) {
        let start = tokio::time::Instant::now() + self.first_delay;
        self.handle.spawn(async move {
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => tick(),
                }
            }
            debug!("Producer task exited");
        });
    }
}

/// Scheduler whose ticks fire only when `fire` is called.
///
/// Gives tests full control over when frames are produced.
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<Vec<(CancellationToken, TickFn)>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one tick of every live task. Returns how many ran.
    pub fn fire(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|(cancel, _)| !cancel.is_cancelled());
        for (_, tick) in tasks.iter() {
            tick();
        }
        tasks.len()
    }

    /// Number of scheduled tasks that have not been cancelled.
    pub fn active(&self) -> usize {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.iter().filter(|(cancel, _)| !cancel.is_cancelled()).count()
    }
}

impl TickScheduler for ManualScheduler {
    fn schedule(&self, _period: Duration, cancel: CancellationToken, tick: TickFn) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((cancel, tick));
    }
}

#[derive(Default)]
struct Counters {
    frames_produced: AtomicU64,
    idle_ticks: AtomicU64,
    stale_ticks: AtomicU64,
}

/// Producer counters shared between the tick task and the session.
#[derive(Default)]
pub struct StatsCounters {
    counters: CachePadded<Counters>,
}

impl StatsCounters {
    pub fn snapshot(&self) -> ProducerStats {
        ProducerStats {
            frames_produced: self.counters.frames_produced.load(Ordering::Relaxed),
            idle_ticks: self.counters.idle_ticks.load(Ordering::Relaxed),
            stale_ticks: self.counters.stale_ticks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub frames_produced: u64,
    /// Ticks that found no queued buffer
    pub idle_ticks: u64,
    /// Ticks that fired after their stream was stopped
    pub stale_ticks: u64,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Produced(BufferInfo),
    Idle,
    /// The stream this tick belongs to is no longer running
    Stale,
}

/// Producer bound to one stream generation of a device.
pub(crate) struct FrameProducer {
    shared: Arc<DeviceShared>,
    generation: u64,
}

impl FrameProducer {
    pub(crate) fn new(shared: Arc<DeviceShared>, generation: u64) -> Self {
        Self { shared, generation }
    }

    /// Paint the head of the pending queue and mark it DONE.
    ///
    /// The pattern is written with the device lock released; the buffer is
    /// still QUEUED meanwhile, so neither the client nor another tick can
    /// touch it. A stop during the fill turns the tick stale.
    pub(crate) fn tick(&self) -> TickOutcome {
        let counters = &self.shared.stats.counters;
        let mut state = self.shared.lock();

        if !self.is_current(&state) {
            counters.stale_ticks.fetch_add(1, Ordering::Relaxed);
            return TickOutcome::Stale;
        }

        let format = state.format;
        let frame_size = state.pix.size_image as usize;
        let Some(ticket) = state.pool.begin_fill() else {
            counters.idle_ticks.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("producer_idle_ticks").increment(1);
            return TickOutcome::Idle;
        };
        drop(state);

        let fill_start = Instant::now();
        let used = ticket.fill(frame_size, |data| fill_pattern(format, data));
        let fill_time = fill_start.elapsed();

        let mut state = self.shared.lock();
        let completed = if self.is_current(&state) {
            let now = self.shared.epoch.elapsed();
            state.pool.finish_fill(ticket, used, now)
        } else {
            None
        };
        drop(state);

        let Some(info) = completed else {
            counters.stale_ticks.fetch_add(1, Ordering::Relaxed);
            debug!("Frame discarded, stream stopped during fill");
            return TickOutcome::Stale;
        };
        self.shared.completed.notify_all();

        counters.frames_produced.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_produced").increment(1);
        metrics::histogram!("frame_fill_time_us").record(fill_time.as_micros() as f64);
        trace!(
            "Frame {} written to buffer {} ({} bytes)",
            info.frame_counter, info.index, info.bytes_used
        );

        TickOutcome::Produced(info)
    }

    fn is_current(&self, state: &DeviceState) -> bool {
        state.streaming && state.generation == self.generation
    }
}
