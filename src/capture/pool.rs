//! Capture buffer pool and buffer life-cycle
//!
//! Buffers move FREE -> (PREPARED) -> QUEUED -> DONE and back through
//! enqueue. Only a QUEUED buffer may be written by the producer, and a
//! QUEUED buffer is never readable by the client. The QUEUED buffers are
//! the pending queue, in enqueue order, plus at most one buffer taken off
//! its head and being filled. The completed queue holds DONE buffers not
//! yet handed to the client, in completion order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use memmap2::MmapMut;
use tracing::debug;

use crate::error::{DeviceError, Result};
use crate::DeviceConfig;

/// Mapping offsets are aligned to this boundary, like mmap cookies.
const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Free,
    Prepared,
    Queued,
    Done,
}

/// How buffer memory is provided to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Mmap,
    UserPtr,
}

/// Snapshot of one buffer's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: u32,
    pub state: BufferState,
    pub memory: MemoryType,
    /// Allocated length of the backing memory
    pub length: usize,
    /// Mapping offset for `map_offset`
    pub offset: u64,
    /// Bytes written by the last produced frame
    pub bytes_used: usize,
    pub frame_counter: u64,
    /// Monotonic time the frame was completed, relative to device creation
    pub timestamp: Duration,
}

struct Buffer {
    index: u32,
    state: BufferState,
    offset: u64,
    length: usize,
    /// Locked on its own so a frame can be painted outside the device lock
    memory: Arc<Mutex<MmapMut>>,
    bytes_used: usize,
    frame_counter: u64,
    timestamp: Duration,
}

impl Buffer {
    fn info(&self) -> BufferInfo {
        BufferInfo {
            index: self.index,
            state: self.state,
            memory: MemoryType::Mmap,
            length: self.length,
            offset: self.offset,
            bytes_used: self.bytes_used,
            frame_counter: self.frame_counter,
            timestamp: self.timestamp,
        }
    }
}

/// Allocation bounds for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub min_buffers: u32,
    pub default_buffers: u32,
    /// Ceiling on `count * frame_size`
    pub memory_limit: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            min_buffers: 4,
            default_buffers: 8,
            memory_limit: 16 * 1024 * 1024,
        }
    }
}

impl From<&DeviceConfig> for PoolLimits {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            min_buffers: config.min_buffers,
            default_buffers: config.default_buffers,
            memory_limit: config.memory_limit_mb as usize * 1024 * 1024,
        }
    }
}

impl PoolLimits {
    /// Clamp a requested buffer count for frames of `frame_size` bytes.
    pub fn clamp_count(&self, requested: u32, frame_size: usize) -> u32 {
        let mut count = if requested == 0 {
            self.default_buffers
        } else {
            requested
        };
        count = count.max(self.min_buffers);

        while count > 0 && count as usize * frame_size > self.memory_limit {
            count -= 1;
        }
        count
    }
}

/// Write access to a QUEUED buffer handed out by `BufferPool::begin_fill`.
pub struct FillTicket {
    index: u32,
    epoch: u64,
    memory: Arc<Mutex<MmapMut>>,
}

impl FillTicket {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Run `fill` over the first `frame_size` bytes. Returns the bytes written.
    pub fn fill<F>(&self, frame_size: usize, fill: F) -> usize
    where
        F: FnOnce(&mut [u8]),
    {
        let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let used = frame_size.min(memory.len());
        fill(&mut memory[..used]);
        used
    }
}

/// Fixed set of capture buffers and their queues.
pub struct BufferPool {
    buffers: Vec<Buffer>,
    pending: VecDeque<u32>,
    /// QUEUED buffer taken off the pending queue and being filled
    filling: Option<u32>,
    completed: VecDeque<u32>,
    sequence: u64,
    /// Bumped whenever the buffer set is replaced or released
    epoch: u64,
    limits: PoolLimits,
}

impl BufferPool {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            buffers: Vec::new(),
            pending: VecDeque::new(),
            filling: None,
            completed: VecDeque::new(),
            sequence: 0,
            epoch: 0,
            limits,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Whether any buffer is QUEUED or DONE.
    pub fn in_use(&self) -> bool {
        self.buffers
            .iter()
            .any(|b| matches!(b.state, BufferState::Queued | BufferState::Done))
    }

    pub fn queued_count(&self) -> usize {
        self.pending.len() + usize::from(self.filling.is_some())
    }

    pub fn has_completed(&self) -> bool {
        !self.completed.is_empty()
    }

    /// Replace the pool with freshly zeroed buffers for `frame_size`-byte frames.
    ///
    /// All-or-nothing: if any mapping fails the previous pool is kept.
    pub fn allocate(&mut self, requested: u32, frame_size: usize) -> Result<u32> {
        if self.in_use() {
            return Err(DeviceError::ResourceBusy(
                "stop streaming and dequeue before reallocating".into(),
            ));
        }
        if frame_size == 0 {
            return Err(DeviceError::invalid_argument("frame size is zero"));
        }

        let count = self.limits.clamp_count(requested, frame_size);
        if count == 0 {
            return Err(DeviceError::ResourceExhausted(format!(
                "a {} byte frame exceeds the {} byte memory limit",
                frame_size, self.limits.memory_limit
            )));
        }

        let stride = frame_size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let mut buffers = Vec::with_capacity(count as usize);
        for index in 0..count {
            let memory = MmapMut::map_anon(frame_size).map_err(|e| {
                DeviceError::ResourceExhausted(format!("buffer {} mapping failed: {}", index, e))
            })?;
            buffers.push(Buffer {
                index,
                state: BufferState::Free,
                offset: (index as usize * stride) as u64,
                length: frame_size,
                memory: Arc::new(Mutex::new(memory)),
                bytes_used: 0,
                frame_counter: 0,
                timestamp: Duration::ZERO,
            });
        }

        debug!(
            "Allocated {} buffers of {} bytes (requested {})",
            count, frame_size, requested
        );
        self.buffers = buffers;
        self.epoch += 1;
        self.pending.clear();
        self.filling = None;
        self.completed.clear();
        Ok(count)
    }

    /// Drop every buffer and its memory.
    pub fn release(&mut self) {
        if !self.buffers.is_empty() {
            debug!("Releasing {} buffers", self.buffers.len());
            self.epoch += 1;
        }
        self.buffers.clear();
        self.pending.clear();
        self.filling = None;
        self.completed.clear();
    }

    fn buffer(&self, index: u32) -> Result<&Buffer> {
        self.buffers.get(index as usize).ok_or_else(|| {
            DeviceError::invalid_argument(format!(
                "buffer index {} out of range ({} allocated)",
                index,
                self.buffers.len()
            ))
        })
    }

    fn buffer_mut(&mut self, index: u32) -> Result<&mut Buffer> {
        let len = self.buffers.len();
        self.buffers.get_mut(index as usize).ok_or_else(|| {
            DeviceError::invalid_argument(format!(
                "buffer index {} out of range ({} allocated)",
                index, len
            ))
        })
    }

    pub fn describe(&self, index: u32) -> Result<BufferInfo> {
        Ok(self.buffer(index)?.info())
    }

    /// Resolve a mapping offset to its buffer index.
    pub fn find_offset(&self, offset: u64) -> Result<u32> {
        self.buffers
            .iter()
            .find(|b| b.offset == offset)
            .map(|b| b.index)
            .ok_or_else(|| DeviceError::invalid_argument(format!("no buffer at offset {}", offset)))
    }

    /// Client ownership check shared by prepare and enqueue.
    fn check_owned_by_client(&self, buffer: &Buffer, frame_size: usize) -> Result<()> {
        match buffer.state {
            BufferState::Free | BufferState::Prepared => {}
            BufferState::Done if !self.completed.contains(&buffer.index) => {}
            BufferState::Done => {
                return Err(DeviceError::invalid_state(format!(
                    "buffer {} has not been dequeued",
                    buffer.index
                )))
            }
            BufferState::Queued => {
                return Err(DeviceError::invalid_state(format!(
                    "buffer {} is already queued",
                    buffer.index
                )))
            }
        }
        if buffer.length < frame_size {
            return Err(DeviceError::invalid_state(format!(
                "buffer {} holds {} bytes, format needs {}",
                buffer.index, buffer.length, frame_size
            )));
        }
        Ok(())
    }

    /// FREE/DONE -> PREPARED.
    pub fn prepare(&mut self, index: u32, frame_size: usize) -> Result<()> {
        let buffer = self.buffer(index)?;
        self.check_owned_by_client(buffer, frame_size)?;
        self.buffer_mut(index)?.state = BufferState::Prepared;
        Ok(())
    }

    /// FREE/PREPARED/DONE -> QUEUED, appended to the pending queue.
    pub fn enqueue(&mut self, index: u32, frame_size: usize) -> Result<()> {
        let buffer = self.buffer(index)?;
        self.check_owned_by_client(buffer, frame_size)?;
        self.buffer_mut(index)?.state = BufferState::Queued;
        self.pending.push_back(index);
        debug!("Buffer {} queued ({} pending)", index, self.pending.len());
        Ok(())
    }

    /// Pop the oldest completed buffer. It stays DONE until re-enqueued.
    pub fn pop_completed(&mut self) -> Option<BufferInfo> {
        let index = self.completed.pop_front()?;
        let info = self.buffers.get(index as usize)?.info();
        debug!("Buffer {} dequeued (frame {})", index, info.frame_counter);
        Some(info)
    }

    /// Take the head of the pending queue for filling. The buffer stays
    /// QUEUED until `finish_fill`.
    ///
    /// Returns `None` when nothing is queued or a fill is already running.
    pub fn begin_fill(&mut self) -> Option<FillTicket> {
        if self.filling.is_some() {
            return None;
        }
        let index = self.pending.pop_front()?;
        let buffer = self.buffers.get(index as usize)?;
        self.filling = Some(index);
        Some(FillTicket {
            index,
            epoch: self.epoch,
            memory: Arc::clone(&buffer.memory),
        })
    }

    /// Mark a filled buffer DONE and append it to the completed queue.
    ///
    /// Returns `None` if the fill was cancelled meanwhile by a stream stop
    /// or a reallocation; the buffer is then left as those put it.
    pub fn finish_fill(
        &mut self,
        ticket: FillTicket,
        used: usize,
        now: Duration,
    ) -> Option<BufferInfo> {
        if ticket.epoch != self.epoch || self.filling != Some(ticket.index) {
            return None;
        }
        self.filling = None;
        self.sequence += 1;
        let sequence = self.sequence;

        let buffer = self.buffers.get_mut(ticket.index as usize)?;
        debug_assert_eq!(buffer.state, BufferState::Queued);
        buffer.bytes_used = used;
        buffer.frame_counter = sequence;
        buffer.timestamp = now;
        buffer.state = BufferState::Done;

        self.completed.push_back(ticket.index);
        Some(buffer.info())
    }

    /// Return every QUEUED buffer to FREE, discarding pending frames.
    pub fn cancel_queued(&mut self) -> usize {
        let cancelled = self.queued_count();
        for index in self.pending.drain(..).chain(self.filling.take()) {
            if let Some(buffer) = self.buffers.get_mut(index as usize) {
                buffer.state = BufferState::Free;
            }
        }
        cancelled
    }

    /// Restart frame numbering for a new stream.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// Borrow a buffer's memory for reading. QUEUED buffers belong to the producer.
    pub fn read<R>(&self, index: u32, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let buffer = self.buffer(index)?;
        if buffer.state == BufferState::Queued {
            return Err(DeviceError::invalid_state(format!(
                "buffer {} is queued for capture",
                index
            )));
        }
        let memory = buffer.memory.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&memory[..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: usize = 8 * 3 * 4;

    fn pool() -> BufferPool {
        BufferPool::new(PoolLimits::default())
    }

    fn assert_queue_invariant(pool: &BufferPool) {
        for index in 0..pool.len() as u32 {
            let queued = pool.describe(index).unwrap().state == BufferState::Queued;
            let owned = pool.pending.contains(&index) || pool.filling == Some(index);
            assert_eq!(queued, owned, "buffer {}", index);
        }
    }

    fn complete_next<F>(pool: &mut BufferPool, now: Duration, fill: F) -> Option<BufferInfo>
    where
        F: FnOnce(&mut [u8]),
    {
        let ticket = pool.begin_fill()?;
        let used = ticket.fill(FRAME, fill);
        pool.finish_fill(ticket, used, now)
    }

    #[test]
    fn clamp_count_applies_default_and_floor() {
        let limits = PoolLimits::default();
        assert_eq!(limits.clamp_count(0, FRAME), 8);
        for requested in 1..4 {
            assert_eq!(limits.clamp_count(requested, FRAME), 4);
        }
        assert_eq!(limits.clamp_count(6, FRAME), 6);
    }

    #[test]
    fn clamp_count_respects_memory_limit() {
        let limits = PoolLimits::default();
        let frame = 800 * 480 * 4;
        for requested in [0, 1, 4, 8, 32] {
            let count = limits.clamp_count(requested, frame);
            assert!(count as usize * frame <= limits.memory_limit);
        }
        assert_eq!(limits.clamp_count(32, frame), 10);
        assert_eq!(limits.clamp_count(4, limits.memory_limit + 1), 0);
    }

    #[test]
    fn allocate_starts_free_and_zeroed() {
        let mut pool = pool();
        assert_eq!(pool.allocate(2, FRAME).unwrap(), 4);
        for index in 0..4 {
            let info = pool.describe(index).unwrap();
            assert_eq!(info.state, BufferState::Free);
            assert_eq!(info.length, FRAME);
            assert_eq!(info.offset, u64::from(index) * PAGE_SIZE as u64);
            assert!(pool.read(index, |data| data.iter().all(|b| *b == 0)).unwrap());
        }
        assert!(matches!(pool.describe(4), Err(DeviceError::InvalidArgument(_))));
        assert_eq!(pool.find_offset(PAGE_SIZE as u64).unwrap(), 1);
    }

    #[test]
    fn allocate_rejects_oversized_frame() {
        let mut pool = pool();
        let err = pool.allocate(4, 17 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, DeviceError::ResourceExhausted(_)));
        assert!(pool.is_empty());
    }

    #[test]
    fn exhausted_allocation_keeps_previous_pool() {
        let mut pool = pool();
        pool.allocate(4, FRAME).unwrap();
        pool.prepare(2, FRAME).unwrap();
        let epoch = pool.epoch();
        let before: Vec<_> = (0..4).map(|i| pool.describe(i).unwrap()).collect();

        let err = pool.allocate(4, 17 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, DeviceError::ResourceExhausted(_)));

        assert_eq!(pool.len(), 4);
        assert_eq!(pool.epoch(), epoch);
        let after: Vec<_> = (0..4).map(|i| pool.describe(i).unwrap()).collect();
        assert_eq!(before, after);
        pool.enqueue(2, FRAME).unwrap();
        assert_queue_invariant(&pool);
    }

    #[test]
    fn allocate_while_in_use_is_busy_and_keeps_pool() {
        let mut pool = pool();
        pool.allocate(4, FRAME).unwrap();
        pool.enqueue(1, FRAME).unwrap();

        assert!(matches!(pool.allocate(8, FRAME), Err(DeviceError::ResourceBusy(_))));
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.describe(1).unwrap().state, BufferState::Queued);
    }

    #[test]
    fn double_enqueue_is_rejected() {
        let mut pool = pool();
        pool.allocate(4, FRAME).unwrap();
        pool.enqueue(0, FRAME).unwrap();
        assert!(matches!(pool.enqueue(0, FRAME), Err(DeviceError::InvalidState(_))));
        assert_eq!(pool.queued_count(), 1);
        assert_queue_invariant(&pool);
    }

    #[test]
    fn done_buffer_must_be_dequeued_before_requeue() {
        let mut pool = pool();
        pool.allocate(4, FRAME).unwrap();
        pool.enqueue(2, FRAME).unwrap();
        complete_next(&mut pool, Duration::from_millis(5), |_| {});

        assert!(matches!(pool.enqueue(2, FRAME), Err(DeviceError::InvalidState(_))));
        let done = pool.pop_completed().unwrap();
        assert_eq!(done.index, 2);
        assert_eq!(done.state, BufferState::Done);
        pool.enqueue(2, FRAME).unwrap();
        assert_queue_invariant(&pool);
    }

    #[test]
    fn completion_order_and_counters() {
        let mut pool = pool();
        pool.allocate(4, FRAME).unwrap();
        for index in [3, 1, 2] {
            pool.enqueue(index, FRAME).unwrap();
        }

        let mut last_ts = Duration::ZERO;
        for (tick, expected) in [3u32, 1, 2].into_iter().enumerate() {
            let now = Duration::from_millis(tick as u64 * 33);
            let info = complete_next(&mut pool, now, |data| data.fill(0xab)).unwrap();
            assert_eq!(info.index, expected);
            assert_queue_invariant(&pool);
            assert!(info.timestamp >= last_ts);
            last_ts = info.timestamp;
        }
        assert!(complete_next(&mut pool, last_ts, |_| {}).is_none());

        let counters: Vec<_> = std::iter::from_fn(|| pool.pop_completed())
            .map(|info| (info.index, info.frame_counter))
            .collect();
        assert_eq!(counters, vec![(3, 1), (1, 2), (2, 3)]);
        assert!(pool.read(3, |data| data.iter().all(|b| *b == 0xab)).unwrap());
    }

    #[test]
    fn queued_buffer_is_not_readable() {
        let mut pool = pool();
        pool.allocate(4, FRAME).unwrap();
        pool.enqueue(0, FRAME).unwrap();
        assert!(matches!(pool.read(0, |_| ()), Err(DeviceError::InvalidState(_))));
    }

    #[test]
    fn cancel_queued_returns_buffers_to_free() {
        let mut pool = pool();
        pool.allocate(4, FRAME).unwrap();
        pool.enqueue(0, FRAME).unwrap();
        pool.enqueue(1, FRAME).unwrap();
        complete_next(&mut pool, Duration::ZERO, |_| {});

        assert_eq!(pool.cancel_queued(), 1);
        assert_eq!(pool.describe(1).unwrap().state, BufferState::Free);
        assert_eq!(pool.describe(0).unwrap().state, BufferState::Done);
        assert!(pool.has_completed());
        assert_queue_invariant(&pool);
    }

    #[test]
    fn prepare_checks_size_against_current_format() {
        let mut pool = pool();
        pool.allocate(4, FRAME).unwrap();
        pool.prepare(0, FRAME).unwrap();
        assert_eq!(pool.describe(0).unwrap().state, BufferState::Prepared);
        pool.enqueue(0, FRAME).unwrap();

        assert!(matches!(pool.prepare(1, FRAME * 2), Err(DeviceError::InvalidState(_))));
        assert!(matches!(pool.enqueue(1, FRAME * 2), Err(DeviceError::InvalidState(_))));
    }

    #[test]
    fn fill_runs_outside_the_pool_borrow() {
        let mut pool = pool();
        pool.allocate(4, FRAME).unwrap();
        pool.enqueue(0, FRAME).unwrap();
        pool.enqueue(1, FRAME).unwrap();

        let ticket = pool.begin_fill().unwrap();
        assert_eq!(ticket.index(), 0);
        // One fill at a time; the buffer being filled is still QUEUED
        assert!(pool.begin_fill().is_none());
        assert_eq!(pool.queued_count(), 2);
        assert_eq!(pool.describe(0).unwrap().state, BufferState::Queued);
        assert!(matches!(pool.read(0, |_| ()), Err(DeviceError::InvalidState(_))));
        assert_queue_invariant(&pool);

        let used = ticket.fill(FRAME, |data| data.fill(0x11));
        let info = pool.finish_fill(ticket, used, Duration::from_millis(1)).unwrap();
        assert_eq!((info.index, info.frame_counter, info.bytes_used), (0, 1, FRAME));
        assert!(pool.read(0, |data| data.iter().all(|b| *b == 0x11)).unwrap());
        assert_queue_invariant(&pool);
    }

    #[test]
    fn cancelled_fill_is_not_completed() {
        let mut pool = pool();
        pool.allocate(4, FRAME).unwrap();
        pool.enqueue(3, FRAME).unwrap();

        let ticket = pool.begin_fill().unwrap();
        assert_eq!(pool.cancel_queued(), 1);
        assert_eq!(pool.describe(3).unwrap().state, BufferState::Free);
        assert_queue_invariant(&pool);

        let used = ticket.fill(FRAME, |_| {});
        assert!(pool.finish_fill(ticket, used, Duration::ZERO).is_none());
        assert_eq!(pool.describe(3).unwrap().state, BufferState::Free);
        assert!(!pool.has_completed());

        // Numbering continues from the last completed frame
        pool.enqueue(3, FRAME).unwrap();
        let info = complete_next(&mut pool, Duration::ZERO, |_| {}).unwrap();
        assert_eq!(info.frame_counter, 1);
    }

    #[test]
    fn fill_across_reallocation_is_dropped() {
        let mut pool = pool();
        pool.allocate(4, FRAME).unwrap();
        pool.enqueue(0, FRAME).unwrap();
        let ticket = pool.begin_fill().unwrap();

        pool.release();
        pool.allocate(4, FRAME).unwrap();
        pool.enqueue(0, FRAME).unwrap();

        let used = ticket.fill(FRAME, |data| data.fill(0xee));
        assert!(pool.finish_fill(ticket, used, Duration::ZERO).is_none());
        assert_eq!(pool.describe(0).unwrap().state, BufferState::Queued);
        assert_queue_invariant(&pool);
    }
}
