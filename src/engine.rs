//! Capture engine: device selection, format negotiation, and the buffer ring.
//!
//! The engine walks `Closed -> Opened -> Initialized -> Streaming` and back.
//! Calls that make no sense in the current state fail with
//! [`CaptureError::InvalidState`]; teardown calls are no-ops when there is
//! nothing left to tear down.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::config::CameraSpec;
use crate::error::{CaptureError, Result};
use crate::surface::{SurfaceCatalog, SurfaceDesc, SurfaceSize};
use crate::traits::{
    CameraDevice, CaptureStream, DeviceCapabilities, DeviceProvider, Format, FourCC,
    FrameIntervals, FrameMetadata, FrameSizes,
};

/// Capture buffers requested from the driver.
pub const RING_BUFFERS: u32 = 4;

/// Common sizes probed inside a stepwise size range.
const STANDARD_SIZES: [(u32, u32); 14] = [
    (160, 120),
    (176, 144),
    (320, 240),
    (352, 288),
    (640, 480),
    (720, 480),
    (800, 600),
    (1024, 768),
    (1280, 720),
    (1280, 960),
    (1600, 1200),
    (1920, 1080),
    (2048, 1536),
    (2592, 1944),
];

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No device.
    Closed,
    /// Device open, catalog built.
    Opened,
    /// Format set and buffer ring mapped.
    Initialized,
    /// Stream on.
    Streaming,
}

impl EngineState {
    /// Lowercase name used in errors and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opened => "opened",
            Self::Initialized => "initialized",
            Self::Streaming => "streaming",
        }
    }
}

/// Who holds a capture slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOwner {
    /// Queued; the driver may fill it.
    Driver,
    /// Dequeued; the driver must not touch it.
    Application,
}

/// Ownership ledger for the mapped capture ring.
#[derive(Debug, Clone, Default)]
pub struct SlotRing {
    owners: Vec<SlotOwner>,
}

impl SlotRing {
    /// A ring of `count` slots, all queued to the driver.
    #[must_use]
    pub fn queued(count: usize) -> Self {
        Self {
            owners: vec![SlotOwner::Driver; count],
        }
    }

    /// Number of mapped slots.
    #[must_use]
    pub fn mapped(&self) -> usize {
        self.owners.len()
    }

    /// Number of slots owned by the driver.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.owners.iter().filter(|o| **o == SlotOwner::Driver).count()
    }

    /// Owner of a slot.
    #[must_use]
    pub fn owner(&self, slot: usize) -> Option<SlotOwner> {
        self.owners.get(slot).copied()
    }

    fn transfer(&mut self, slot: usize, from: SlotOwner, to: SlotOwner) -> Result<()> {
        match self.owners.get_mut(slot) {
            Some(owner) if *owner == from => {
                *owner = to;
                Ok(())
            }
            Some(owner) => Err(CaptureError::Io(std::io::Error::other(format!(
                "slot {slot} is owned by {owner:?}, expected {from:?}"
            )))),
            None => Err(CaptureError::Io(std::io::Error::other(format!(
                "slot {slot} is outside the ring"
            )))),
        }
    }

    /// Driver handed a filled slot to the application.
    pub fn dequeued(&mut self, slot: usize) -> Result<()> {
        self.transfer(slot, SlotOwner::Driver, SlotOwner::Application)
    }

    /// Application handed a slot back to the driver.
    pub fn requeued(&mut self, slot: usize) -> Result<()> {
        self.transfer(slot, SlotOwner::Application, SlotOwner::Driver)
    }

    fn set_all(&mut self, owner: SlotOwner) {
        self.owners.fill(owner);
    }
}

/// The format the driver agreed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    /// Pixel format; always YUYV.
    pub fourcc: FourCC,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Frame rate the driver settled on.
    pub fps: u32,
    /// Bytes per row.
    pub bytes_per_line: u32,
    /// Bytes per frame.
    pub buffer_size: u32,
}

/// Drives one video node through its streaming lifecycle.
pub struct CaptureEngine<P: DeviceProvider> {
    provider: P,
    spec: CameraSpec,
    state: EngineState,
    device: Option<P::Device>,
    stream: Option<<P::Device as CameraDevice>::Stream>,
    path: Option<PathBuf>,
    last_selected: Option<PathBuf>,
    unusable: HashSet<PathBuf>,
    catalog: SurfaceCatalog,
    negotiated: Option<NegotiatedFormat>,
    slots: SlotRing,
}

impl<P: DeviceProvider> std::fmt::Debug for CaptureEngine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("state", &self.state)
            .field("path", &self.path)
            .field("negotiated", &self.negotiated)
            .finish_non_exhaustive()
    }
}

impl<P: DeviceProvider> CaptureEngine<P> {
    /// A closed engine that selects devices according to `spec`.
    pub fn new(provider: P, spec: CameraSpec) -> Self {
        Self {
            provider,
            spec,
            state: EngineState::Closed,
            device: None,
            stream: None,
            path: None,
            last_selected: None,
            unusable: HashSet::new(),
            catalog: SurfaceCatalog::default(),
            negotiated: None,
            slots: SlotRing::default(),
        }
    }

    fn invalid(&self, operation: &'static str) -> CaptureError {
        CaptureError::InvalidState {
            operation,
            state: self.state.as_str(),
        }
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> EngineState {
        self.state
    }

    /// Device selection input.
    pub const fn spec(&self) -> &CameraSpec {
        &self.spec
    }

    /// Nodes to try, in order, without duplicates or excluded paths.
    fn candidates(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        self.last_selected
            .iter()
            .cloned()
            .chain(self.spec.devices.iter().cloned())
            .chain(self.provider.list_nodes())
            .filter(|path| !self.spec.is_excluded(path))
            .filter(|path| seen.insert(path.clone()))
            .collect()
    }

    /// Select and open a device. A no-op if one is already open.
    pub fn open(&mut self) -> Result<()> {
        if self.state != EngineState::Closed {
            return Ok(());
        }
        for path in self.candidates() {
            if self.unusable.contains(&path) {
                trace!(path = %path.display(), "skipping unusable node");
                continue;
            }
            let device = match self.provider.open(&path) {
                Ok(device) => device,
                Err(err) => {
                    debug!(path = %path.display(), %err, "cannot open node");
                    continue;
                }
            };
            let caps = device.capabilities();
            if !caps.can_capture || !caps.can_stream {
                debug!(path = %path.display(), card = %caps.card, "not a streaming capture node");
                self.unusable.insert(path);
                continue;
            }
            let catalog = build_catalog(&device, self.spec.preferred_size);
            if !catalog.has_usable() {
                debug!(path = %path.display(), modes = catalog.len(), "no YUYV capture mode");
                self.unusable.insert(path);
                continue;
            }
            info!(
                path = %path.display(),
                card = %device.capabilities().card,
                modes = catalog.len(),
                "opened capture device"
            );
            self.device = Some(device);
            self.catalog = catalog;
            self.last_selected = Some(path.clone());
            self.path = Some(path);
            self.state = EngineState::Opened;
            return Ok(());
        }
        Err(CaptureError::DeviceNotFound)
    }

    /// Negotiate the closest YUYV mode and map the capture ring.
    pub fn init(&mut self, width: u32, height: u32, fps: u32) -> Result<NegotiatedFormat> {
        if self.state != EngineState::Opened {
            return Err(self.invalid("init"));
        }
        let wanted = self.catalog.closest(width, height, fps).ok_or_else(|| {
            CaptureError::FormatNegotiation(format!("no YUYV mode near {width}x{height}@{fps}"))
        })?;
        let device = self.device.as_mut().ok_or(CaptureError::InvalidState {
            operation: "init",
            state: "opened without device",
        })?;

        let granted = device
            .set_format(&Format::new(wanted.width(), wanted.height(), FourCC::YUYV))
            .map_err(|err| CaptureError::FormatNegotiation(err.to_string()))?;
        if granted.fourcc != FourCC::YUYV {
            return Err(CaptureError::FormatNegotiation(format!(
                "driver switched to {}",
                granted.fourcc
            )));
        }
        let actual_fps = device.set_frame_rate(wanted.fps).unwrap_or_else(|err| {
            warn!(%err, fps = wanted.fps, "frame rate request refused");
            wanted.fps
        });

        let stream = device.create_stream(RING_BUFFERS).map_err(|err| match err {
            CaptureError::BufferAllocation(_) => err,
            other => CaptureError::BufferAllocation(other.to_string()),
        })?;
        if stream.buffer_count() == 0 {
            return Err(CaptureError::BufferAllocation(
                "driver granted no buffers".to_owned(),
            ));
        }

        let negotiated = NegotiatedFormat {
            fourcc: granted.fourcc,
            width: granted.width,
            height: granted.height,
            fps: actual_fps,
            bytes_per_line: granted.stride,
            buffer_size: granted.size,
        };
        info!(
            width = negotiated.width,
            height = negotiated.height,
            fps = negotiated.fps,
            buffers = stream.buffer_count(),
            "capture format negotiated"
        );
        self.slots = SlotRing::queued(stream.buffer_count());
        self.stream = Some(stream);
        self.negotiated = Some(negotiated);
        self.state = EngineState::Initialized;
        Ok(negotiated)
    }

    /// Turn streaming on. A no-op while already streaming.
    pub fn start_streaming(&mut self) -> Result<()> {
        match self.state {
            EngineState::Streaming => return Ok(()),
            EngineState::Initialized => {}
            _ => return Err(self.invalid("start_streaming")),
        }
        let stream = self.stream.as_mut().ok_or(CaptureError::InvalidState {
            operation: "start_streaming",
            state: "initialized without stream",
        })?;
        stream.start()?;
        self.slots.set_all(SlotOwner::Driver);
        self.state = EngineState::Streaming;
        debug!("streaming on");
        Ok(())
    }

    /// Turn streaming off. A no-op unless streaming.
    pub fn stop_streaming(&mut self) -> Result<()> {
        if self.state != EngineState::Streaming {
            return Ok(());
        }
        self.state = EngineState::Initialized;
        self.slots.set_all(SlotOwner::Application);
        if let Some(stream) = self.stream.as_mut() {
            stream.stop()?;
        }
        debug!("streaming off");
        Ok(())
    }

    /// Wait up to `timeout` for a frame and copy it into `buffer`.
    ///
    /// The slot is handed back to the stream before returning. The owner
    /// tags are logical: a V4L2 stream re-queues the buffer at its next
    /// dequeue.
    pub fn grab_raw_frame(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<FrameMetadata> {
        if self.state != EngineState::Streaming {
            return Err(self.invalid("grab_raw_frame"));
        }
        let stream = self.stream.as_mut().ok_or(CaptureError::InvalidState {
            operation: "grab_raw_frame",
            state: "streaming without stream",
        })?;
        let meta = stream.dequeue(buffer, timeout)?;
        self.slots.dequeued(meta.slot)?;
        stream.release(meta.slot)?;
        self.slots.requeued(meta.slot)?;
        trace!(slot = meta.slot, sequence = meta.sequence, bytes = meta.bytes_copied, "frame grabbed");
        Ok(meta)
    }

    /// Unmap the ring. Stops streaming first; a no-op when not initialized.
    pub fn uninit(&mut self) -> Result<()> {
        if !matches!(self.state, EngineState::Initialized | EngineState::Streaming) {
            return Ok(());
        }
        let stopped = self.stop_streaming();
        self.stream = None;
        self.slots = SlotRing::default();
        self.negotiated = None;
        self.state = EngineState::Opened;
        debug!("capture ring released");
        stopped
    }

    /// Release the device. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.state == EngineState::Closed {
            return Ok(());
        }
        let released = self.uninit();
        self.device = None;
        self.catalog = SurfaceCatalog::default();
        if let Some(path) = self.path.take() {
            info!(path = %path.display(), "closed capture device");
        }
        self.state = EngineState::Closed;
        released
    }

    /// Size negotiated by the last `init`.
    pub fn size(&self) -> Option<SurfaceSize> {
        self.negotiated.map(|n| SurfaceSize::new(n.width, n.height))
    }

    /// Frame rate negotiated by the last `init`.
    pub fn fps(&self) -> Option<u32> {
        self.negotiated.map(|n| n.fps)
    }

    /// Full negotiated format.
    pub const fn negotiated(&self) -> Option<NegotiatedFormat> {
        self.negotiated
    }

    /// Modes of the open device.
    pub const fn catalog(&self) -> &SurfaceCatalog {
        &self.catalog
    }

    /// Streamable sizes of the open device, ascending.
    pub fn available_sizes(&self) -> Vec<SurfaceSize> {
        self.catalog.available_sizes().into_iter().collect()
    }

    /// Streamable frame rates of the open device, ascending.
    pub fn available_fps(&self) -> Vec<u32> {
        self.catalog.available_fps().into_iter().collect()
    }

    /// Default preview mode of the open device.
    pub fn best_preview(&self) -> Option<SurfaceDesc> {
        self.catalog.best_preview()
    }

    /// Default picture mode of the open device.
    pub fn best_picture(&self) -> Option<SurfaceDesc> {
        self.catalog.best_picture()
    }

    /// Node of the open device.
    pub fn device_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Capabilities of the open device.
    pub fn capabilities(&self) -> Option<&DeviceCapabilities> {
        self.device.as_ref().map(CameraDevice::capabilities)
    }

    /// Mapped capture slots.
    pub fn mapped_slots(&self) -> usize {
        self.slots.mapped()
    }

    /// Capture slots currently queued to the driver.
    pub fn queued_slots(&self) -> usize {
        self.slots.queued_count()
    }
}

impl<P: DeviceProvider> Drop for CaptureEngine<P> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "error closing capture device");
        }
    }
}

/// Sizes a stepwise range expands to: every common size inside it plus both
/// corners.
fn expand_sizes(sizes: FrameSizes) -> Vec<(u32, u32)> {
    match sizes {
        FrameSizes::Discrete { width, height } => vec![(width, height)],
        FrameSizes::Stepwise {
            min_width,
            max_width,
            step_width,
            min_height,
            max_height,
            step_height,
        } => {
            let on_step = |value: u32, min: u32, step: u32| step <= 1 || (value - min) % step == 0;
            let mut out = vec![(min_width, min_height)];
            out.extend(STANDARD_SIZES.iter().copied().filter(|&(w, h)| {
                (min_width..=max_width).contains(&w)
                    && (min_height..=max_height).contains(&h)
                    && on_step(w, min_width, step_width)
                    && on_step(h, min_height, step_height)
            }));
            out.push((max_width, max_height));
            out.dedup();
            out
        }
    }
}

fn expand_fps(intervals: &[FrameIntervals]) -> Vec<u32> {
    let mut fps: Vec<u32> = intervals
        .iter()
        .flat_map(|interval| match *interval {
            FrameIntervals::Discrete(f) => vec![f.fps()],
            FrameIntervals::Stepwise { min, max } => vec![min.fps(), max.fps()],
        })
        .flatten()
        .filter(|&fps| fps > 0)
        .collect();
    fps.sort_unstable();
    fps.dedup();
    fps
}

/// Enumerate every format, size and frame rate a device offers.
fn build_catalog<D: CameraDevice>(device: &D, preferred: Option<SurfaceSize>) -> SurfaceCatalog {
    let mut catalog = SurfaceCatalog::new(preferred);
    let formats = device.enum_formats().unwrap_or_else(|err| {
        debug!(%err, "format enumeration failed");
        Vec::new()
    });
    for fourcc in formats {
        let sizes = device.enum_frame_sizes(fourcc).unwrap_or_default();
        for (width, height) in sizes.into_iter().flat_map(expand_sizes) {
            let intervals = device
                .enum_frame_intervals(fourcc, width, height)
                .unwrap_or_default();
            for fps in expand_fps(&intervals) {
                catalog.insert(SurfaceDesc::new(fourcc, width, height, fps));
            }
        }
    }
    catalog
}
