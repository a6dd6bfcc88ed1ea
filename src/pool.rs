//! Frame heaps shared between the capture workers and callback consumers.
//!
//! A heap is a small ring of equally sized slots. Filling a slot publishes it
//! as a [`SharedFrame`]; consumers may hold on to published frames for as
//! long as they like. A slot that is still referenced when the ring wraps
//! around gets a fresh allocation instead of being overwritten, and a heap
//! replaced by [`BufferPool::reallocate`] stays alive until its last frame is
//! dropped.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::error::{CaptureError, Result};
use crate::params::CameraParameters;
use crate::pipeline::PixelFormat;

/// Slots in the preview and recording rings.
pub const RING_SLOTS: usize = 4;

/// An immutable snapshot of one filled slot.
#[derive(Debug, Clone)]
pub struct SharedFrame {
    data: Arc<Vec<u8>>,
    len: usize,
    slot: usize,
    generation: u64,
}

impl SharedFrame {
    /// Slot the frame was published from.
    #[must_use]
    pub const fn slot(&self) -> usize {
        self.slot
    }

    /// Monotonic publish counter of the owning ring.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for SharedFrame {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.get(..self.len).unwrap_or_default()
    }
}

impl AsRef<[u8]> for SharedFrame {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

fn alloc(size: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|err| CaptureError::BufferAllocation(format!("{size} bytes: {err}")))?;
    buf.resize(size, 0);
    Ok(buf)
}

/// Fixed ring of equally sized frame slots.
#[derive(Debug)]
pub struct FrameRing {
    slots: Vec<Arc<Vec<u8>>>,
    frame_size: usize,
    next: usize,
    generation: u64,
}

impl FrameRing {
    /// Allocate `count` slots of `frame_size` bytes.
    pub fn new(count: usize, frame_size: usize) -> Result<Self> {
        let slots = (0..count.max(1))
            .map(|_| alloc(frame_size).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            slots,
            frame_size,
            next: 0,
            generation: 0,
        })
    }

    /// Bytes per slot.
    #[must_use]
    pub const fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false; a ring has at least one slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn writable(&mut self, slot: usize) -> Result<&mut Vec<u8>> {
        let frame_size = self.frame_size;
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| CaptureError::BufferAllocation(format!("no slot {slot}")))?;
        if Arc::get_mut(entry).is_none() {
            // Still held by a consumer; leave that copy alone.
            *entry = Arc::new(alloc(frame_size)?);
        }
        Arc::get_mut(entry)
            .ok_or_else(|| CaptureError::BufferAllocation(format!("slot {slot} is shared")))
    }

    /// Fill the next slot and publish all of it.
    ///
    /// If `fill` fails nothing is published and the ring does not advance.
    pub fn fill_next<T, F>(&mut self, fill: F) -> Result<(T, SharedFrame)>
    where
        F: FnOnce(&mut [u8]) -> Result<T>,
    {
        let size = self.frame_size;
        let mut value = None;
        let frame = self.fill_next_sized(|buf| {
            value = Some(fill(buf)?);
            Ok(size)
        })?;
        let value = value.ok_or_else(|| CaptureError::BufferAllocation("fill produced nothing".into()))?;
        Ok((value, frame))
    }

    /// Fill the next slot and publish the first `n` bytes, where `n` is what
    /// `fill` returns.
    pub fn fill_next_sized<F>(&mut self, fill: F) -> Result<SharedFrame>
    where
        F: FnOnce(&mut [u8]) -> Result<usize>,
    {
        let slot = self.next;
        let buf = self.writable(slot)?;
        let len = fill(buf.as_mut_slice())?.min(buf.len());
        self.next = (slot + 1) % self.slots.len();
        self.generation += 1;
        let data = self
            .slots
            .get(slot)
            .map(Arc::clone)
            .ok_or_else(|| CaptureError::BufferAllocation(format!("no slot {slot}")))?;
        Ok(SharedFrame {
            data,
            len,
            slot,
            generation: self.generation,
        })
    }
}

/// A ring shared between the coordinator and a worker thread.
pub type Heap = Arc<Mutex<FrameRing>>;

/// Lock a heap, recovering from a poisoned lock.
pub fn lock_heap(heap: &Heap) -> MutexGuard<'_, FrameRing> {
    heap.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Byte sizes every heap needs for a parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapSizes {
    /// Raw YUYV frames as grabbed.
    pub raw_preview: usize,
    /// Preview frames in the preview format.
    pub preview: usize,
    /// Recording frames in the video format.
    pub recording: usize,
    /// Raw YUYV still picture.
    pub raw_picture: usize,
    /// Compressed still picture budget.
    pub jpeg: usize,
}

impl HeapSizes {
    /// Sizes for `params`. While recording, raw frames are grabbed at the
    /// video size.
    #[must_use]
    pub fn compute(params: &CameraParameters, recording: bool) -> Self {
        let raw = params.raw_size(recording);
        let preview = params.preview_size();
        let video = params.video_size();
        let picture = params.picture_size();
        let px = |size: crate::surface::SurfaceSize| (size.width as usize, size.height as usize);
        let (rw, rh) = px(raw);
        let (pw, ph) = px(preview);
        let (vw, vh) = px(video);
        let (cw, ch) = px(picture);
        Self {
            raw_preview: PixelFormat::Yuyv.frame_size(rw, rh),
            preview: params.preview_format().frame_size(pw, ph),
            recording: params.video_format().frame_size(vw, vh),
            raw_picture: PixelFormat::Yuyv.frame_size(cw, ch),
            jpeg: PixelFormat::Jpeg.frame_size(cw, ch),
        }
    }
}

/// Every heap the camera uses.
#[derive(Debug, Default)]
pub struct BufferPool {
    sizes: HeapSizes,
    raw_preview: Option<Heap>,
    preview: Option<Heap>,
    recording: Option<Heap>,
    raw_picture: Option<Heap>,
    jpeg: Option<Heap>,
}

fn refresh(heap: &mut Option<Heap>, old: usize, new: usize, slots: usize, name: &str) -> Result<bool> {
    if heap.is_some() && old == new {
        return Ok(false);
    }
    debug!(heap = name, old, new, "reallocating heap");
    *heap = None;
    *heap = Some(Arc::new(Mutex::new(FrameRing::new(slots, new)?)));
    Ok(true)
}

impl BufferPool {
    /// An empty pool; nothing is allocated until [`BufferPool::reallocate`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current sizes.
    #[must_use]
    pub const fn sizes(&self) -> HeapSizes {
        self.sizes
    }

    /// Bring every heap in line with `sizes`.
    ///
    /// Returns `true` when a heap used by the preview worker was replaced,
    /// meaning a running preview must be restarted to pick it up.
    pub fn reallocate(&mut self, sizes: HeapSizes) -> Result<bool> {
        let old = self.sizes;
        let mut preview_changed = false;
        preview_changed |= refresh(&mut self.raw_preview, old.raw_preview, sizes.raw_preview, RING_SLOTS, "raw-preview")?;
        preview_changed |= refresh(&mut self.preview, old.preview, sizes.preview, RING_SLOTS, "preview")?;
        preview_changed |= refresh(&mut self.recording, old.recording, sizes.recording, RING_SLOTS, "recording")?;
        refresh(&mut self.raw_picture, old.raw_picture, sizes.raw_picture, 1, "raw-picture")?;
        refresh(&mut self.jpeg, old.jpeg, sizes.jpeg, 1, "jpeg")?;
        self.sizes = sizes;
        Ok(preview_changed)
    }

    /// Drop every heap. Frames already handed out stay valid.
    pub fn release(&mut self) {
        *self = Self::default();
    }

    /// Raw preview heap.
    #[must_use]
    pub fn raw_preview(&self) -> Option<Heap> {
        self.raw_preview.clone()
    }

    /// Converted preview heap.
    #[must_use]
    pub fn preview(&self) -> Option<Heap> {
        self.preview.clone()
    }

    /// Recording heap.
    #[must_use]
    pub fn recording(&self) -> Option<Heap> {
        self.recording.clone()
    }

    /// Raw picture heap.
    #[must_use]
    pub fn raw_picture(&self) -> Option<Heap> {
        self.raw_picture.clone()
    }

    /// Compressed picture heap.
    #[must_use]
    pub fn jpeg(&self) -> Option<Heap> {
        self.jpeg.clone()
    }
}
