//! Transfer-buffer ring that overlaps GPU pixel copies with CPU encoding.
//!
//! Frame `f` (1-based) copies the render target into slot `f % N`. Once the
//! ring is full, the same frame collects slot `(f + 1) % N`, which holds frame
//! `f - (N - 1)`. That copy has had N-1 frame periods to finish. The ring
//! still checks: a completion flag set by the queue tells whether the depth
//! was enough, and mapping always waits on the slot's own submission so a
//! shallow ring degrades into a stall instead of a torn read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use thiserror::Error;

use crate::sink::{FramePixels, FrameSink, SinkError};
use crate::types::RenderSize;

use super::target::RenderTarget;

#[derive(Debug, Error)]
pub enum ReadbackError {
    #[error("failed to allocate {bytes}-byte transfer buffer: {reason}")]
    Allocation { bytes: u64, reason: String },

    #[error("failed to map transfer buffer for frame {frame}: {reason}")]
    Map { frame: u64, reason: String },

    /// Runtime check of the ring lag. The current schedule never produces it;
    /// it guards against future changes to the slot arithmetic.
    #[error("slot holds frame {written}, too recent to read at frame {current}")]
    TooRecent { written: u64, current: u64 },

    #[error("frame {frame} could not be written: {source}")]
    Sink {
        frame: u64,
        #[source]
        source: SinkError,
    },
}

/// Bytes per row in a transfer buffer, padded to the copy alignment.
pub fn padded_row_bytes(width: u32) -> u32 {
    (width * 4).next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
}

/// A slot to read back and the frame it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collection {
    pub slot: usize,
    pub source_frame: u64,
}

/// Slot arithmetic for a ring of `depth` transfer buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSchedule {
    depth: u64,
}

impl RingSchedule {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1) as u64,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth as usize
    }

    /// Frames that must be issued after a copy before it may be mapped.
    pub fn lag(&self) -> u64 {
        self.depth - 1
    }

    /// Slot that receives the copy for `frame`.
    pub fn issue_slot(&self, frame: u64) -> usize {
        (frame % self.depth) as usize
    }

    /// Slot to map at `frame`, or `None` while the ring is still filling.
    pub fn collect_at(&self, frame: u64) -> Option<Collection> {
        if frame < self.depth {
            return None;
        }
        Some(Collection {
            slot: (self.issue_slot(frame) + 1) % self.depth(),
            source_frame: frame - self.lag(),
        })
    }

    /// True when a copy made at `written` is old enough to map at `current`.
    pub fn is_safe(&self, current: u64, written: u64) -> bool {
        current >= written.saturating_add(self.lag())
    }
}

/// Counters reported when the session finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadbackStats {
    pub copies: u64,
    pub collected: u64,
    pub skipped: u64,
    pub fence_stalls: u64,
}

struct PendingCopy {
    frame: u64,
    submission: Option<wgpu::SubmissionIndex>,
    done: Arc<AtomicBool>,
}

#[derive(Default)]
struct TransferSlot {
    buffer: Option<wgpu::Buffer>,
    capacity: u64,
    pending: Option<PendingCopy>,
}

pub(crate) struct TransferRing {
    schedule: RingSchedule,
    size: RenderSize,
    row_stride: u32,
    slots: Vec<TransferSlot>,
    stats: ReadbackStats,
}

impl TransferRing {
    pub(crate) fn new(depth: usize, size: RenderSize) -> Self {
        let schedule = RingSchedule::new(depth);
        Self {
            schedule,
            size,
            row_stride: padded_row_bytes(size.width),
            slots: (0..schedule.depth()).map(|_| TransferSlot::default()).collect(),
            stats: ReadbackStats::default(),
        }
    }

    pub(crate) fn stats(&self) -> ReadbackStats {
        self.stats
    }

    fn required_bytes(&self) -> u64 {
        u64::from(self.row_stride) * u64::from(self.size.height)
    }

    /// (Re)allocates the slot's buffer when it is missing or too small.
    fn ensure_capacity(&mut self, device: &wgpu::Device, slot: usize) -> Result<(), ReadbackError> {
        let bytes = self.required_bytes();
        let entry = &mut self.slots[slot];
        if entry.buffer.is_some() && entry.capacity >= bytes {
            return Ok(());
        }
        if let Some(old) = entry.buffer.take() {
            old.destroy();
        }
        entry.capacity = 0;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback transfer buffer"),
            size: bytes,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let out_of_memory = pollster::block_on(device.pop_error_scope());
        let invalid = pollster::block_on(device.pop_error_scope());
        if let Some(error) = out_of_memory.or(invalid) {
            return Err(ReadbackError::Allocation {
                bytes,
                reason: error.to_string(),
            });
        }

        tracing::debug!(slot, bytes, "allocated transfer buffer");
        entry.buffer = Some(buffer);
        entry.capacity = bytes;
        Ok(())
    }

    /// Records the copy of `target` into this frame's slot. Returns the slot
    /// index so the caller can report the submission once it is known.
    pub(crate) fn encode_copy(
        &mut self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        target: &RenderTarget,
        frame: u64,
    ) -> Result<usize, ReadbackError> {
        let slot = self.schedule.issue_slot(frame);
        self.retire_stale(slot);
        if let Err(err) = self.ensure_capacity(device, slot) {
            self.stats.skipped += 1;
            return Err(err);
        }

        let bytes = self.required_bytes();
        let entry = &mut self.slots[slot];
        let Some(buffer) = entry.buffer.as_ref() else {
            self.stats.skipped += 1;
            return Err(ReadbackError::Allocation {
                bytes,
                reason: "transfer buffer missing".to_string(),
            });
        };
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.row_stride),
                    rows_per_image: Some(self.size.height),
                },
            },
            self.size.extent(),
        );
        entry.pending = Some(PendingCopy {
            frame,
            submission: None,
            done: Arc::new(AtomicBool::new(false)),
        });
        self.stats.copies += 1;
        tracing::trace!(slot, frame, "encoded transfer copy");
        Ok(slot)
    }

    /// Drops a copy that was never collected from `slot`, counting it as
    /// skipped. Returns the frame it held.
    fn retire_stale(&mut self, slot: usize) -> Option<u64> {
        let stale = self.slots[slot].pending.take()?;
        tracing::debug!(slot, frame = stale.frame, "overwriting uncollected transfer");
        self.stats.skipped += 1;
        Some(stale.frame)
    }

    /// Attaches the submission that carries the slot's copy and arms the
    /// completion flag.
    pub(crate) fn mark_submitted(
        &mut self,
        queue: &wgpu::Queue,
        slot: usize,
        submission: wgpu::SubmissionIndex,
    ) {
        let Some(pending) = self.slots[slot].pending.as_mut() else {
            return;
        };
        pending.submission = Some(submission);
        let done = Arc::clone(&pending.done);
        queue.on_submitted_work_done(move || done.store(true, Ordering::Release));
    }

    /// Reads back the slot that became old enough at `frame`.
    ///
    /// Returns the source frame handed to `sink`, or `None` during warm-up or
    /// when that frame's copy had been skipped.
    pub(crate) fn collect(
        &mut self,
        device: &wgpu::Device,
        frame: u64,
        sink: &mut dyn FrameSink,
    ) -> Result<Option<u64>, ReadbackError> {
        let Some(plan) = self.schedule.collect_at(frame) else {
            tracing::trace!(frame, "readback ring filling; nothing to collect");
            return Ok(None);
        };
        self.collect_slot(device, plan.slot, Some(frame), sink)
    }

    /// Reads back every copy still in flight, oldest first.
    pub(crate) fn drain(
        &mut self,
        device: &wgpu::Device,
        sink: &mut dyn FrameSink,
    ) -> Vec<Result<Option<u64>, ReadbackError>> {
        let mut order: Vec<(u64, usize)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.pending.as_ref().map(|pending| (pending.frame, slot)))
            .collect();
        order.sort_unstable();
        order
            .into_iter()
            .map(|(_, slot)| self.collect_slot(device, slot, None, sink))
            .collect()
    }

    fn collect_slot(
        &mut self,
        device: &wgpu::Device,
        slot: usize,
        current: Option<u64>,
        sink: &mut dyn FrameSink,
    ) -> Result<Option<u64>, ReadbackError> {
        let Some(pending) = self.slots[slot].pending.take() else {
            return Ok(None);
        };
        if let Some(current) = current {
            if !self.schedule.is_safe(current, pending.frame) {
                self.stats.skipped += 1;
                return Err(ReadbackError::TooRecent {
                    written: pending.frame,
                    current,
                });
            }
        }

        let result = self.map_and_emit(device, slot, &pending, sink);
        match &result {
            Ok(()) => self.stats.collected += 1,
            Err(_) => self.stats.skipped += 1,
        }
        result.map(|()| Some(pending.frame))
    }

    fn map_and_emit(
        &mut self,
        device: &wgpu::Device,
        slot: usize,
        pending: &PendingCopy,
        sink: &mut dyn FrameSink,
    ) -> Result<(), ReadbackError> {
        let frame = pending.frame;
        let map_error = |reason: String| ReadbackError::Map { frame, reason };

        // Fires queue callbacks for work that already retired.
        device
            .poll(wgpu::PollType::Poll)
            .map_err(|err| map_error(err.to_string()))?;
        if !pending.done.load(Ordering::Acquire) {
            self.stats.fence_stalls += 1;
            tracing::warn!(
                frame,
                ring_depth = self.schedule.depth(),
                "transfer still in flight after ring lag; waiting on GPU"
            );
        }

        let Some(buffer) = self.slots[slot].buffer.as_ref() else {
            return Err(map_error("transfer buffer missing".to_string()));
        };
        let slice = buffer.slice(..self.required_bytes());
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });

        let wait = match pending.submission.clone() {
            Some(index) => wgpu::PollType::WaitForSubmissionIndex(index),
            None => wgpu::PollType::Wait,
        };
        if let Err(err) = device.poll(wait) {
            buffer.unmap();
            return Err(map_error(err.to_string()));
        }
        match receiver.try_recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                buffer.unmap();
                return Err(map_error(err.to_string()));
            }
            Err(_) => {
                buffer.unmap();
                return Err(map_error("map callback did not fire".to_string()));
            }
        }

        let written = {
            let mapped = slice.get_mapped_range();
            let pixels = FramePixels {
                width: self.size.width,
                height: self.size.height,
                row_stride: self.row_stride as usize,
                data: &mapped,
            };
            sink.write_frame(frame, &pixels)
        };
        buffer.unmap();
        tracing::trace!(slot, frame, "collected transfer");
        written.map_err(|source| ReadbackError::Sink { frame, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_collects_nothing() {
        let schedule = RingSchedule::new(3);
        assert_eq!(schedule.collect_at(1), None);
        assert_eq!(schedule.collect_at(2), None);
        assert_eq!(
            schedule.collect_at(3),
            Some(Collection {
                slot: 1,
                source_frame: 1,
            })
        );
    }

    #[test]
    fn collected_slot_is_never_the_one_being_written() {
        for depth in 2..=5 {
            let schedule = RingSchedule::new(depth);
            for frame in 1..200u64 {
                let issue = schedule.issue_slot(frame);
                if let Some(plan) = schedule.collect_at(frame) {
                    assert_ne!(plan.slot, issue, "depth {depth} frame {frame}");
                    assert_eq!(plan.slot, schedule.issue_slot(plan.source_frame));
                    assert_eq!(frame - plan.source_frame, (depth - 1) as u64);
                    assert!(schedule.is_safe(frame, plan.source_frame));
                }
            }
        }
    }

    #[test]
    fn every_frame_is_collected_exactly_once() {
        let schedule = RingSchedule::new(3);
        let last = 50u64;
        let collected: Vec<u64> = (1..=last)
            .filter_map(|frame| schedule.collect_at(frame))
            .map(|plan| plan.source_frame)
            .collect();
        let expected: Vec<u64> = (1..=last - schedule.lag()).collect();
        assert_eq!(collected, expected);
    }

    #[test]
    fn safety_requires_full_lag() {
        let schedule = RingSchedule::new(3);
        assert!(!schedule.is_safe(5, 4));
        assert!(!schedule.is_safe(5, 5));
        assert!(schedule.is_safe(5, 3));
        assert!(schedule.is_safe(9, 3));
    }

    fn pending(frame: u64) -> PendingCopy {
        PendingCopy {
            frame,
            submission: None,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn overwriting_uncollected_copy_counts_as_skipped() {
        let mut ring = TransferRing::new(3, RenderSize::new(8, 4).unwrap());
        ring.slots[1].pending = Some(pending(1));

        assert_eq!(ring.retire_stale(1), Some(1));
        assert_eq!(ring.stats().skipped, 1);
        assert!(ring.slots[1].pending.is_none());

        assert_eq!(ring.retire_stale(1), None);
        assert_eq!(ring.retire_stale(2), None);
        assert_eq!(ring.stats().skipped, 1);
    }

    #[test]
    fn fresh_ring_has_no_pending_copies() {
        let ring = TransferRing::new(4, RenderSize::new(65, 2).unwrap());
        assert_eq!(ring.slots.len(), 4);
        assert!(ring.slots.iter().all(|slot| slot.pending.is_none() && slot.buffer.is_none()));
        assert_eq!(ring.required_bytes(), 512 * 2);
        assert_eq!(ring.stats(), ReadbackStats::default());
    }

    #[test]
    fn rows_pad_to_copy_alignment() {
        assert_eq!(padded_row_bytes(1), 256);
        assert_eq!(padded_row_bytes(64), 256);
        assert_eq!(padded_row_bytes(65), 512);
        assert_eq!(padded_row_bytes(1920), 7680);
    }
}
