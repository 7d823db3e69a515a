//! Virtual capture device and its single client session
//!
//! `VirtualDevice` owns the device context. `CaptureSession` is the only way
//! to drive it; at most one session exists per device at a time.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use bytes::Bytes;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::capture::format::{self, FormatDescriptor, FormatRequest, PixFormat, PixelFormat};
use crate::capture::frame::{Frame, FrameMetadata};
use crate::capture::pool::{BufferInfo, BufferPool, BufferState, MemoryType, PoolLimits};
use crate::capture::producer::{
    FrameProducer, ProducerStats, StatsCounters, TickOutcome, TickScheduler, TokioScheduler,
};
use crate::error::{DeviceError, Result};
use crate::{Config, DeviceConfig};

bitflags! {
    /// Capability bits reported by query-capability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapabilityFlags: u32 {
        const VIDEO_CAPTURE = 0x0000_0001;
        const STREAMING = 0x0400_0000;
        const DEVICE_CAPS = 0x8000_0000;
    }
}

/// Response to query-capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub version: u32,
    /// Capabilities of the whole device, including `DEVICE_CAPS`
    pub capabilities: CapabilityFlags,
    /// Capabilities of this device node
    pub device_caps: CapabilityFlags,
}

impl Capability {
    pub fn can_capture(&self) -> bool {
        self.device_caps.contains(CapabilityFlags::VIDEO_CAPTURE)
    }

    pub fn can_stream(&self) -> bool {
        self.device_caps.contains(CapabilityFlags::STREAMING)
    }
}

/// Buffer category named in a buffer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    VideoCapture,
    VideoOutput,
}

/// Arguments of request-buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    pub count: u32,
    pub buffer_type: BufferType,
    pub memory: MemoryType,
}

impl BufferRequest {
    /// Memory-mapped capture buffers.
    pub const fn capture(count: u32) -> Self {
        Self {
            count,
            buffer_type: BufferType::VideoCapture,
            memory: MemoryType::Mmap,
        }
    }
}

/// Mutable device context, guarded by `DeviceShared::state`.
pub(crate) struct DeviceState {
    pub(crate) pool: BufferPool,
    pub(crate) format: &'static PixelFormat,
    pub(crate) pix: PixFormat,
    pub(crate) streaming: bool,
    /// Bumped on every stream start; producers of older streams go stale
    pub(crate) generation: u64,
    pub(crate) session_held: bool,
    cancel: Option<CancellationToken>,
}

impl DeviceState {
    fn require_buffers(&self) -> Result<()> {
        if self.pool.is_empty() {
            return Err(DeviceError::invalid_state("no buffers requested"));
        }
        Ok(())
    }

    /// Stop the producer and hand queued buffers back. Idempotent.
    fn halt_stream(&mut self) -> usize {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.streaming = false;
        self.pool.cancel_queued()
    }
}

pub(crate) struct DeviceShared {
    state: Mutex<DeviceState>,
    /// Signalled when a buffer becomes DONE or the stream stops
    pub(crate) completed: Condvar,
    /// Origin of buffer timestamps
    pub(crate) epoch: Instant,
    pub(crate) stats: StatsCounters,
}

impl DeviceShared {
    /// Every critical section leaves the state consistent, so a poisoned
    /// lock is still safe to use.
    pub(crate) fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An emulated capture device.
///
/// Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct VirtualDevice {
    shared: Arc<DeviceShared>,
    scheduler: Arc<dyn TickScheduler>,
    config: Arc<DeviceConfig>,
    /// Format restored on every open
    default_pix: PixFormat,
    period: Duration,
}

impl VirtualDevice {
    /// Create a device whose producer runs on the given tokio runtime.
    pub fn new(config: &Config, handle: Handle) -> Result<Self> {
        let scheduler = TokioScheduler::new(handle)
            .with_first_delay(Duration::from_millis(config.producer.first_tick_delay_ms));
        Self::with_scheduler(config, Arc::new(scheduler))
    }

    /// Create a device with a custom tick scheduler.
    pub fn with_scheduler(config: &Config, scheduler: Arc<dyn TickScheduler>) -> Result<Self> {
        if config.producer.fps == 0 {
            return Err(DeviceError::invalid_argument("producer fps must be positive"));
        }
        let device = &config.device;
        if (device.default_width & !0x01) == 0 || device.default_height == 0 {
            return Err(DeviceError::invalid_argument(format!(
                "default resolution {}x{} is empty",
                device.default_width, device.default_height
            )));
        }

        let format = format::default_format();
        let default_pix =
            PixFormat::new(device.default_width & !0x01, device.default_height, format)?;
        let state = DeviceState {
            pool: BufferPool::new(PoolLimits::from(device)),
            format,
            pix: default_pix.clone(),
            streaming: false,
            generation: 0,
            session_held: false,
            cancel: None,
        };

        Ok(Self {
            shared: Arc::new(DeviceShared {
                state: Mutex::new(state),
                completed: Condvar::new(),
                epoch: Instant::now(),
                stats: StatsCounters::default(),
            }),
            scheduler,
            config: Arc::new(device.clone()),
            default_pix,
            period: Duration::from_secs(1) / config.producer.fps,
        })
    }

    /// Whether a session currently holds the device.
    pub fn is_held(&self) -> bool {
        self.shared.lock().session_held
    }

    /// Claim the device. Fails with `Busy` while another session holds it.
    ///
    /// Opening always resets the format to the device default.
    pub fn open(&self) -> Result<CaptureSession> {
        let mut state = self.shared.lock();
        if state.session_held {
            return Err(DeviceError::Busy);
        }

        state.session_held = true;
        state.format = format::default_format();
        state.pix = self.default_pix.clone();
        state.pool.release();
        info!(
            "Session opened: {}x{} {}",
            state.pix.width, state.pix.height, state.pix.fourcc
        );

        Ok(CaptureSession {
            device: self.clone(),
            closed: false,
        })
    }
}

/// The client's handle on an open device.
///
/// Commands take `&self` so one thread can block in `dequeue_buffer`
/// while another stops the stream. Dropping the session closes it.
pub struct CaptureSession {
    device: VirtualDevice,
    closed: bool,
}

impl CaptureSession {
    fn shared(&self) -> &Arc<DeviceShared> {
        &self.device.shared
    }

    pub fn query_capability(&self) -> Capability {
        let config = &self.device.config;
        let device_caps = CapabilityFlags::VIDEO_CAPTURE | CapabilityFlags::STREAMING;
        Capability {
            driver: config.driver.clone(),
            card: config.name.clone(),
            bus_info: config.bus_info.clone(),
            version: config.version,
            capabilities: device_caps | CapabilityFlags::DEVICE_CAPS,
            device_caps,
        }
    }

    pub fn enum_format(&self, index: u32) -> Result<FormatDescriptor> {
        format::enumerate(index)
    }

    pub fn get_format(&self) -> PixFormat {
        self.shared().lock().pix.clone()
    }

    /// Normalize a proposed format without applying it.
    pub fn try_format(&self, request: &FormatRequest) -> Result<PixFormat> {
        let (_, pix) = format::negotiate(request)?;
        Ok(pix)
    }

    /// Normalize and apply a proposed format.
    ///
    /// Rejected while streaming or while any buffer is queued or completed.
    pub fn set_format(&self, request: &FormatRequest) -> Result<PixFormat> {
        let (format, pix) = format::negotiate(request)?;

        let mut state = self.shared().lock();
        if state.streaming || state.pool.in_use() {
            return Err(DeviceError::invalid_state(
                "cannot change format while buffers are in use",
            ));
        }
        state.format = format;
        state.pix = pix.clone();
        info!("Format set: {}x{} {}", pix.width, pix.height, pix.fourcc);
        Ok(pix)
    }

    /// Allocate the buffer pool for the current format.
    #[instrument(skip(self), fields(count = request.count))]
    pub fn request_buffers(&self, request: &BufferRequest) -> Result<u32> {
        if request.buffer_type != BufferType::VideoCapture {
            return Err(DeviceError::invalid_argument(format!(
                "unsupported buffer type {:?}",
                request.buffer_type
            )));
        }
        if request.memory != MemoryType::Mmap {
            return Err(DeviceError::invalid_argument(format!(
                "unsupported memory type {:?}",
                request.memory
            )));
        }

        let mut state = self.shared().lock();
        if state.streaming {
            return Err(DeviceError::ResourceBusy("stream is running".into()));
        }
        let frame_size = state.pix.size_image as usize;
        let count = state.pool.allocate(request.count, frame_size)?;
        info!("{} buffers allocated ({} requested)", count, request.count);
        Ok(count)
    }

    pub fn query_buffer(&self, index: u32) -> Result<BufferInfo> {
        let state = self.shared().lock();
        state.require_buffers()?;
        state.pool.describe(index)
    }

    pub fn prepare_buffer(&self, index: u32) -> Result<()> {
        let mut state = self.shared().lock();
        state.require_buffers()?;
        let frame_size = state.pix.size_image as usize;
        state.pool.prepare(index, frame_size)
    }

    /// Hand a buffer to the producer.
    pub fn enqueue_buffer(&self, index: u32) -> Result<()> {
        let mut state = self.shared().lock();
        state.require_buffers()?;
        let frame_size = state.pix.size_image as usize;
        state.pool.enqueue(index, frame_size)
    }

    /// Take the oldest completed buffer.
    ///
    /// With `non_blocking`, returns `WouldBlock` when nothing is ready.
    /// Otherwise waits for a frame; a stream stop, or no running stream,
    /// ends the wait with `StreamStopped`.
    pub fn dequeue_buffer(&self, non_blocking: bool) -> Result<BufferInfo> {
        let shared = self.shared();
        let mut state = shared.lock();
        state.require_buffers()?;

        let mut waiting_on = None;
        loop {
            if let Some(info) = state.pool.pop_completed() {
                return Ok(info);
            }
            if non_blocking {
                return Err(DeviceError::WouldBlock);
            }
            if !state.streaming {
                return Err(DeviceError::StreamStopped);
            }
            match waiting_on {
                Some(generation) if generation != state.generation => {
                    return Err(DeviceError::StreamStopped);
                }
                _ => waiting_on = Some(state.generation),
            }
            state = shared
                .completed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Start the producer. Requires allocated buffers; a running stream is left as is.
    #[instrument(skip(self))]
    pub fn start_streaming(&self) -> Result<()> {
        let mut state = self.shared().lock();
        state.require_buffers()?;
        if state.streaming {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        state.generation += 1;
        state.streaming = true;
        state.cancel = Some(cancel.clone());
        state.pool.reset_sequence();
        let generation = state.generation;
        let queued = state.pool.queued_count();
        drop(state);

        let producer = FrameProducer::new(Arc::clone(self.shared()), generation);
        self.device.scheduler.schedule(
            self.device.period,
            cancel,
            Box::new(move || {
                producer.tick();
            }),
        );
        info!(
            "Streaming started ({} buffers queued, period {:?})",
            queued, self.device.period
        );
        Ok(())
    }

    /// Stop the producer, return queued buffers to FREE and wake blocked dequeues.
    ///
    /// No tick has any effect once this returns. Idempotent.
    #[instrument(skip(self))]
    pub fn stop_streaming(&self) {
        let mut state = self.shared().lock();
        let was_streaming = state.streaming;
        let discarded = state.halt_stream();
        drop(state);
        self.shared().completed.notify_all();

        if was_streaming {
            info!("Streaming stopped ({} queued buffers discarded)", discarded);
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.shared().lock().streaming
    }

    /// Whether a dequeue would return a buffer without blocking.
    pub fn poll(&self) -> bool {
        self.shared().lock().pool.has_completed()
    }

    /// Access the backing memory of a buffer.
    pub fn map_buffer(&self, index: u32) -> Result<BufferMapping> {
        let state = self.shared().lock();
        state.require_buffers()?;
        let info = state.pool.describe(index)?;
        debug!("Buffer {} mapped at offset {}", index, info.offset);
        Ok(BufferMapping {
            shared: Arc::clone(self.shared()),
            index,
            offset: info.offset,
            length: info.length,
            pool_epoch: state.pool.epoch(),
        })
    }

    /// Access buffer memory by its mapping offset, as reported by query-buffer.
    pub fn map_offset(&self, offset: u64) -> Result<BufferMapping> {
        let index = {
            let state = self.shared().lock();
            state.require_buffers()?;
            state.pool.find_offset(offset)?
        };
        self.map_buffer(index)
    }

    /// Copy a dequeued buffer's frame so it survives re-enqueueing.
    pub fn snapshot(&self, buffer: &BufferInfo) -> Result<Frame> {
        let state = self.shared().lock();
        let current = state.pool.describe(buffer.index)?;
        if current.state != BufferState::Done || current.frame_counter != buffer.frame_counter {
            return Err(DeviceError::invalid_state(format!(
                "buffer {} no longer holds frame {}",
                buffer.index, buffer.frame_counter
            )));
        }

        let data = state
            .pool
            .read(buffer.index, |mem| Bytes::copy_from_slice(&mem[..current.bytes_used]))?;
        let pix = &state.pix;
        Ok(Frame {
            data,
            meta: Arc::new(FrameMetadata {
                sequence: current.frame_counter,
                buffer_index: current.index,
                width: pix.width,
                height: pix.height,
                stride: pix.bytes_per_line,
                fourcc: pix.fourcc,
                device_timestamp: current.timestamp,
            }),
            timestamp: Instant::now(),
        })
    }

    pub fn producer_stats(&self) -> ProducerStats {
        self.shared().stats.snapshot()
    }

    /// Run one producer tick immediately, outside the scheduler.
    pub fn tick_now(&self) -> TickOutcome {
        let generation = self.shared().lock().generation;
        FrameProducer::new(Arc::clone(self.shared()), generation).tick()
    }

    /// Release the device: stop streaming, free buffers, drop ownership.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut state = self.shared().lock();
        state.halt_stream();
        state.pool.release();
        state.session_held = false;
        drop(state);
        self.shared().completed.notify_all();
        info!("Session closed");
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Client view of one buffer's backing memory.
///
/// Reads go straight to the memory the producer writes; there is no copy.
/// The view is refused while the buffer is queued and becomes stale once
/// the pool is reallocated or released.
pub struct BufferMapping {
    shared: Arc<DeviceShared>,
    index: u32,
    offset: u64,
    length: usize,
    pool_epoch: u64,
}

impl BufferMapping {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Borrow the mapped bytes.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let state = self.shared.lock();
        if state.pool.epoch() != self.pool_epoch {
            return Err(DeviceError::invalid_state(format!(
                "mapping of buffer {} outlived its pool",
                self.index
            )));
        }
        state.pool.read(self.index, f)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.read(<[u8]>::to_vec)
    }
}
