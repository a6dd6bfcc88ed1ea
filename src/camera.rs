//! Runtime coordinator: one camera, its workers, and the command surface.
//!
//! All commands serialize on one lock that guards the runtime state, the
//! parameters, the capture engine and the buffer pool. The preview worker
//! never takes that lock. It reads per-frame routing from a separate table
//! that is only written while the main lock is held, so a command holding
//! the main lock can always stop and join it.
//!
//! The capture engine is owned by exactly one party at a time: the idle
//! slot in the runtime, the hotplug worker while it probes, or the preview
//! worker while it streams. Stopping the preview worker hands it back.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::config::{CameraSpec, Facing, Orientation};
use crate::convert::YuyvView;
use crate::engine::CaptureEngine;
use crate::error::{CaptureError, Result};
use crate::params::CameraParameters;
use crate::pipeline::{self, ExposureMeter, PixelFormat, WindowBuffer};
use crate::pool::{lock_heap, BufferPool, Heap, HeapSizes, SharedFrame};
use crate::surface::SurfaceSize;
use crate::traits::{DeviceProvider, FrameMetadata};
use crate::worker::{StopToken, Worker};

/// Wait between device probes while no camera is attached.
pub const HOTPLUG_BACKOFF: Duration = Duration::from_secs(1);

/// Set of client messages that are switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct MessageMask(u32);

impl MessageMask {
    /// Asynchronous errors.
    pub const ERROR: Self = Self(0x001);
    /// Shutter fired for a still picture.
    pub const SHUTTER: Self = Self(0x002);
    /// Focus finished.
    pub const FOCUS: Self = Self(0x004);
    /// Preview frames.
    pub const PREVIEW_FRAME: Self = Self(0x010);
    /// Recording frames.
    pub const VIDEO_FRAME: Self = Self(0x020);
    /// Uncompressed still picture.
    pub const RAW_IMAGE: Self = Self(0x080);
    /// Compressed still picture.
    pub const COMPRESSED_IMAGE: Self = Self(0x100);
    /// Every message.
    pub const ALL: Self = Self(0x1b7);

    /// No message.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bit value.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones.
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for MessageMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MessageMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Asynchronous events sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The still picture was exposed.
    Shutter,
    /// Focus finished; `true` on success.
    Focus(bool),
    /// Capture failed and stopped.
    Error(String),
}

/// Client-side sinks. Every method has an empty default.
///
/// Called from worker threads, never with the camera lock held.
pub trait CameraCallbacks: Send + Sync {
    /// An event happened.
    fn notify(&self, _event: Notification) {}

    /// A preview frame in the preview format.
    fn preview_frame(&self, _frame: SharedFrame) {}

    /// A recording frame in the video format.
    fn recording_frame(&self, _timestamp: Duration, _frame: SharedFrame) {}

    /// The uncompressed still picture (YUYV).
    fn raw_picture(&self, _frame: SharedFrame) {}

    /// The compressed still picture (JPEG).
    fn compressed_picture(&self, _frame: SharedFrame) {}
}

/// A display surface fed by the preview worker.
pub trait PreviewWindow: Send + Sync {
    /// Announce the size and format of upcoming buffers.
    fn set_buffers_geometry(&self, width: usize, height: usize, format: PixelFormat) -> Result<()>;

    /// Borrow a buffer to draw into.
    fn dequeue_buffer(&self) -> Result<WindowBuffer>;

    /// Hand a drawn buffer back for display.
    fn enqueue_buffer(&self, buffer: WindowBuffer) -> Result<()>;

    /// Hand a buffer back without displaying it.
    fn cancel_buffer(&self, _buffer: WindowBuffer) {}
}

/// Static description of a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraInfo {
    /// Facing role.
    pub facing: Facing,
    /// Mounting rotation.
    pub orientation: Orientation,
}

impl From<&CameraSpec> for CameraInfo {
    fn from(spec: &CameraSpec) -> Self {
        Self {
            facing: spec.facing,
            orientation: spec.orientation,
        }
    }
}

/// What the preview worker consults for every frame.
#[derive(Clone, Default)]
struct FrameRoute {
    mask: MessageMask,
    recording: bool,
    callbacks: Option<Arc<dyn CameraCallbacks>>,
    window: Option<Arc<dyn PreviewWindow>>,
}

impl FrameRoute {
    fn notify(&self, event: Notification) {
        let wanted = match event {
            Notification::Shutter => MessageMask::SHUTTER,
            Notification::Focus(_) => MessageMask::FOCUS,
            Notification::Error(_) => MessageMask::ERROR,
        };
        if self.mask.contains(wanted) {
            if let Some(callbacks) = &self.callbacks {
                callbacks.notify(event);
            }
        }
    }
}

fn lock_route(route: &Mutex<FrameRoute>) -> MutexGuard<'_, FrameRoute> {
    route.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Preview frame timeout: 1.2 frame periods.
#[must_use]
pub fn frame_timeout(fps: u32) -> Duration {
    Duration::from_secs_f64(1.2 / f64::from(fps.max(1)))
}

const fn dims(size: SurfaceSize) -> (usize, usize) {
    (size.width as usize, size.height as usize)
}

type Engine<P> = Box<CaptureEngine<P>>;

enum EngineSlot<P: DeviceProvider> {
    Idle(Engine<P>),
    Lent,
}

impl<P: DeviceProvider> EngineSlot<P> {
    fn take(&mut self, operation: &'static str) -> Result<Engine<P>> {
        match std::mem::replace(self, Self::Lent) {
            Self::Idle(engine) => Ok(engine),
            Self::Lent => Err(CaptureError::InvalidState {
                operation,
                state: "busy",
            }),
        }
    }
}

/// Heaps, sizes and formats one preview session runs with.
struct PreviewPlan {
    route: Arc<Mutex<FrameRoute>>,
    raw_heap: Heap,
    preview_heap: Heap,
    recording_heap: Heap,
    raw_size: SurfaceSize,
    preview_size: SurfaceSize,
    preview_format: PixelFormat,
    video_size: SurfaceSize,
    video_format: PixelFormat,
    timeout: Duration,
}

/// Everything the preview worker owns while it runs.
struct PreviewJob<P: DeviceProvider> {
    engine: Engine<P>,
    plan: PreviewPlan,
}

impl<P: DeviceProvider> PreviewJob<P> {
    fn run(mut self, token: &StopToken) -> Engine<P> {
        let plan = &self.plan;
        let pass_through =
            pipeline::is_pass_through(plan.preview_format, plan.raw_size, plan.preview_size);
        info!(
            raw = %plan.raw_size,
            preview = %plan.preview_size,
            format = %plan.preview_format,
            pass_through,
            "preview started"
        );
        while !token.should_stop() {
            let route = lock_route(&plan.route).clone();
            let heap = if pass_through {
                &plan.preview_heap
            } else {
                &plan.raw_heap
            };
            let engine = &mut self.engine;
            let grabbed =
                lock_heap(heap).fill_next(|buf| engine.grab_raw_frame(buf, plan.timeout));
            let (meta, raw) = match grabbed {
                Ok(frame) => frame,
                Err(CaptureError::TimedOut) => {
                    trace!("preview frame not ready");
                    continue;
                }
                Err(err) => {
                    error!(%err, "preview capture failed");
                    teardown(engine);
                    route.notify(Notification::Error(err.to_string()));
                    break;
                }
            };
            if let Err(err) = plan.deliver(&route, &meta, &raw, pass_through) {
                warn!(%err, sequence = meta.sequence, "frame delivery failed");
            }
        }
        debug!("preview stopped");
        self.engine
    }
}

impl PreviewPlan {
    fn deliver(
        &self,
        route: &FrameRoute,
        meta: &FrameMetadata,
        raw: &SharedFrame,
        pass_through: bool,
    ) -> Result<()> {
        let (rw, rh) = dims(self.raw_size);
        let view = YuyvView::new(raw, rw, rh)?;

        if let Some(callbacks) = &route.callbacks {
            if route.recording && route.mask.contains(MessageMask::VIDEO_FRAME) {
                let (vw, vh) = dims(self.video_size);
                let format = self.video_format;
                let (_, frame) = lock_heap(&self.recording_heap)
                    .fill_next(|buf| pipeline::render(&view, buf, format, vw, vh))?;
                callbacks.recording_frame(meta.timestamp, frame);
            }
            if route.mask.contains(MessageMask::PREVIEW_FRAME) {
                let frame = if pass_through {
                    raw.clone()
                } else {
                    let (pw, ph) = dims(self.preview_size);
                    let format = self.preview_format;
                    lock_heap(&self.preview_heap)
                        .fill_next(|buf| pipeline::render(&view, buf, format, pw, ph))?
                        .1
                };
                callbacks.preview_frame(frame);
            }
        }
        if let Some(window) = &route.window {
            let mut buffer = window.dequeue_buffer()?;
            match pipeline::fill_window(&view, &mut buffer) {
                Ok(_) => window.enqueue_buffer(buffer)?,
                Err(err) => {
                    window.cancel_buffer(buffer);
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

/// A captured still picture.
struct Picture {
    raw: SharedFrame,
    jpeg: Option<SharedFrame>,
}

struct Runtime<P: DeviceProvider> {
    provider: P,
    spec: CameraSpec,
    ready: bool,
    released: bool,
    recording: bool,
    mask: MessageMask,
    params: CameraParameters,
    callbacks: Option<Arc<dyn CameraCallbacks>>,
    window: Option<Arc<dyn PreviewWindow>>,
    engine: EngineSlot<P>,
    pool: BufferPool,
    route: Arc<Mutex<FrameRoute>>,
    preview: Option<Worker<Engine<P>>>,
    hotplug: Option<Worker<()>>,
    picture: Option<Worker<()>>,
    focus: Option<Worker<()>>,
}

impl<P: DeviceProvider> Runtime<P> {
    fn sync_route(&self) {
        let mut route = lock_route(&self.route);
        route.mask = self.mask;
        route.recording = self.recording;
        route.callbacks.clone_from(&self.callbacks);
        route.window.clone_from(&self.window);
    }

    /// Recording frames are requested, so raw frames come at the video size.
    const fn records(&self) -> bool {
        self.recording && self.mask.contains(MessageMask::VIDEO_FRAME)
    }

    fn preview_running(&self) -> bool {
        self.preview.as_ref().is_some_and(|w| !w.is_finished())
    }

    fn return_engine(&mut self, engine: Option<Engine<P>>) {
        let engine = engine.unwrap_or_else(|| {
            warn!("capture engine lost; rebuilding");
            Box::new(CaptureEngine::new(self.provider.clone(), self.spec.clone()))
        });
        self.engine = EngineSlot::Idle(engine);
    }

    fn negotiate_window(&self, size: SurfaceSize) {
        if let Some(window) = &self.window {
            let (w, h) = dims(size);
            if let Err(err) = window.set_buffers_geometry(w, h, PixelFormat::Rgba8888) {
                warn!(%err, "preview window rejected geometry");
            }
        }
    }

    fn start_preview(&mut self) -> Result<()> {
        if !self.ready {
            return Err(CaptureError::NotReady);
        }
        if self.preview.is_some() {
            if self.preview_running() {
                return Ok(());
            }
            // The last session ended on its own; collect the engine first.
            self.stop_preview();
        }
        self.sync_route();

        let recording = self.records();
        let wanted = self.params.raw_size(recording);
        let fps = self.params.preview_fps();
        let mut engine = self.engine.take("start_preview")?;
        match self.prepare_stream(&mut engine, recording, wanted, fps) {
            Ok(plan) => {
                let job = PreviewJob { engine, plan };
                let worker = Worker::spawn("camera-preview", move |token| job.run(&token));
                match worker {
                    Ok(worker) => {
                        self.preview = Some(worker);
                        Ok(())
                    }
                    Err(err) => {
                        // The job and its engine went down with the failed spawn.
                        self.return_engine(None);
                        Err(err)
                    }
                }
            }
            Err(err) => {
                warn!(%err, "cannot start preview");
                teardown(&mut engine);
                self.return_engine(Some(engine));
                Err(err)
            }
        }
    }

    /// Open, negotiate, size the heaps and turn streaming on.
    fn prepare_stream(
        &mut self,
        engine: &mut CaptureEngine<P>,
        recording: bool,
        wanted: SurfaceSize,
        fps: u32,
    ) -> Result<PreviewPlan> {
        engine.open()?;
        let negotiated = engine.init(wanted.width, wanted.height, fps)?;
        let size = SurfaceSize::new(negotiated.width, negotiated.height);
        self.params.store_effective_size(recording, size);
        self.pool.reallocate(HeapSizes::compute(&self.params, recording))?;
        engine.start_streaming()?;
        self.negotiate_window(size);

        let missing = || CaptureError::BufferAllocation("preview heaps missing".to_owned());
        Ok(PreviewPlan {
            route: Arc::clone(&self.route),
            raw_heap: self.pool.raw_preview().ok_or_else(missing)?,
            preview_heap: self.pool.preview().ok_or_else(missing)?,
            recording_heap: self.pool.recording().ok_or_else(missing)?,
            raw_size: size,
            preview_size: self.params.preview_size(),
            preview_format: self.params.preview_format(),
            video_size: self.params.video_size(),
            video_format: self.params.video_format(),
            timeout: frame_timeout(negotiated.fps),
        })
    }

    fn stop_preview(&mut self) {
        let Some(worker) = self.preview.take() else {
            return;
        };
        match worker.stop() {
            Ok(mut engine) => {
                teardown(&mut engine);
                self.return_engine(Some(engine));
            }
            Err(err) => {
                warn!(%err, "preview worker did not stop cleanly");
                self.return_engine(None);
            }
        }
    }

    fn restart_preview(&mut self) -> Result<()> {
        self.stop_preview();
        self.start_preview()
    }

    /// Apply a change that may alter what the preview worker produces.
    fn reconfigure<F>(&mut self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let running = self.preview_running();
        let recorded = self.records();
        let before = self.params.clone();
        change(self)?;
        self.sync_route();
        let restart = running
            && (recorded != self.records() || before.affects_preview(&self.params));
        if restart {
            debug!("restarting preview for new configuration");
            self.stop_preview();
        }
        let heaps_changed = self
            .pool
            .reallocate(HeapSizes::compute(&self.params, self.records()))?;
        if restart || (running && heaps_changed) {
            self.restart_preview()?;
        }
        Ok(())
    }

    fn set_parameters(&mut self, params: CameraParameters) -> Result<()> {
        if params == self.params {
            return Ok(());
        }
        params.validate()?;
        self.reconfigure(|rt| {
            rt.params = params;
            Ok(())
        })
    }

    fn capture_picture(&mut self) -> Result<Picture> {
        if !self.ready {
            return Err(CaptureError::NotReady);
        }
        self.stop_preview();
        let mut engine = self.engine.take("take_picture")?;
        let result = self.capture_with(&mut engine);
        teardown(&mut engine);
        self.return_engine(Some(engine));
        result
    }

    fn capture_with(&mut self, engine: &mut CaptureEngine<P>) -> Result<Picture> {
        let wanted = self.params.picture_size();
        engine.open()?;
        let negotiated = engine.init(wanted.width, wanted.height, 1)?;
        let size = SurfaceSize::new(negotiated.width, negotiated.height);
        self.params.store_effective_picture_size(size);
        self.pool
            .reallocate(HeapSizes::compute(&self.params, self.records()))?;
        engine.start_streaming()?;

        let missing = || CaptureError::BufferAllocation("picture heaps missing".to_owned());
        let raw_heap = self.pool.raw_picture().ok_or_else(missing)?;
        let (w, h) = dims(size);
        let timeout = frame_timeout(negotiated.fps);
        let mut meter = ExposureMeter::new(w, h);
        let mut raw = None;
        for _ in 0..ExposureMeter::MAX_FRAMES {
            let grabbed = lock_heap(&raw_heap).fill_next(|buf| engine.grab_raw_frame(buf, timeout));
            let frame = match grabbed {
                Ok((_, frame)) => frame,
                Err(CaptureError::TimedOut) => continue,
                Err(err) => return Err(err),
            };
            let settled = meter.observe(&YuyvView::new(&frame, w, h)?);
            raw = Some(frame);
            if settled {
                break;
            }
        }
        let raw = raw.ok_or(CaptureError::TimedOut)?;
        debug!(frames = meter.frames(), "exposure settled");

        let jpeg = if self.mask.contains(MessageMask::COMPRESSED_IMAGE) {
            let view = YuyvView::new(&raw, w, h)?;
            let quality = self.params.jpeg_quality();
            let heap = self.pool.jpeg().ok_or_else(missing)?;
            let compressed = lock_heap(&heap).fill_next_sized(|buf| {
                let encoded = pipeline::encode_jpeg(&view, quality, buf.len())?;
                let out = buf.get_mut(..encoded.len()).ok_or_else(|| {
                    CaptureError::Encoding("jpeg exceeds picture heap".to_owned())
                })?;
                out.copy_from_slice(&encoded);
                Ok(encoded.len())
            });
            match compressed {
                Ok(frame) => {
                    info!(bytes = frame.len(), "picture compressed");
                    Some(frame)
                }
                Err(CaptureError::Encoding(reason)) => {
                    warn!(%reason, "compressed picture skipped");
                    None
                }
                Err(err) => return Err(err),
            }
        } else {
            None
        };
        Ok(Picture { raw, jpeg })
    }
}

fn teardown<P: DeviceProvider>(engine: &mut CaptureEngine<P>) {
    if let Err(err) = engine.stop_streaming() {
        warn!(%err, "stream off failed");
    }
    if let Err(err) = engine.uninit() {
        warn!(%err, "ring release failed");
    }
    if let Err(err) = engine.close() {
        warn!(%err, "device close failed");
    }
}

struct Inner<P: DeviceProvider> {
    state: Mutex<Runtime<P>>,
    ready: Condvar,
}

impl<P: DeviceProvider> Inner<P> {
    fn lock(&self) -> MutexGuard<'_, Runtime<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn hotplug_job<P: DeviceProvider>(inner: &Inner<P>, mut engine: Engine<P>, token: &StopToken) {
    let found = loop {
        match engine.open() {
            Ok(()) => break true,
            Err(err) => {
                trace!(%err, "no camera attached yet");
                if token.wait_for_stop(HOTPLUG_BACKOFF) {
                    break false;
                }
            }
        }
    };
    let params = found.then(|| CameraParameters::from_catalog(engine.catalog()));
    if let Err(err) = engine.close() {
        warn!(%err, "device close after probe failed");
    }

    let mut rt = inner.lock();
    rt.engine = EngineSlot::Idle(engine);
    if let Some(params) = params {
        if rt.released {
            return;
        }
        info!(
            preview = %params.preview_size(),
            fps = params.preview_fps(),
            picture = %params.picture_size(),
            "camera ready"
        );
        rt.params = params;
        let sizes = HeapSizes::compute(&rt.params, rt.records());
        if let Err(err) = rt.pool.reallocate(sizes) {
            warn!(%err, "initial heap allocation failed");
        }
        rt.ready = true;
        inner.ready.notify_all();
    }
}

fn picture_job<P: DeviceProvider>(inner: &Inner<P>) {
    let (outcome, route) = {
        let mut rt = inner.lock();
        let outcome = rt.capture_picture();
        let route = FrameRoute {
            mask: rt.mask,
            recording: rt.recording,
            callbacks: rt.callbacks.clone(),
            window: None,
        };
        (outcome, route)
    };

    match outcome {
        Ok(picture) => {
            route.notify(Notification::Shutter);
            let Some(callbacks) = &route.callbacks else {
                return;
            };
            if route.mask.contains(MessageMask::RAW_IMAGE) {
                callbacks.raw_picture(picture.raw);
            }
            if let Some(jpeg) = picture.jpeg {
                callbacks.compressed_picture(jpeg);
            }
        }
        Err(err) => {
            error!(%err, "still capture failed");
            route.notify(Notification::Error(err.to_string()));
        }
    }
}

/// One camera: detection, preview, recording and still capture.
pub struct Camera<P: DeviceProvider> {
    inner: Arc<Inner<P>>,
    lease: Option<Arc<AtomicBool>>,
}

impl<P: DeviceProvider> fmt::Debug for Camera<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rt = self.inner.lock();
        f.debug_struct("Camera")
            .field("ready", &rt.ready)
            .field("preview", &rt.preview_running())
            .field("recording", &rt.recording)
            .field("mask", &rt.mask)
            .finish_non_exhaustive()
    }
}

impl<P: DeviceProvider> Camera<P> {
    /// Create a camera and start looking for its device in the background.
    pub fn new(provider: P, spec: CameraSpec) -> Result<Self> {
        let engine = Box::new(CaptureEngine::new(provider.clone(), spec.clone()));
        let inner = Arc::new(Inner {
            state: Mutex::new(Runtime {
                provider,
                spec,
                ready: false,
                released: false,
                recording: false,
                mask: MessageMask::empty(),
                params: CameraParameters::default(),
                callbacks: None,
                window: None,
                engine: EngineSlot::Lent,
                pool: BufferPool::new(),
                route: Arc::new(Mutex::new(FrameRoute::default())),
                preview: None,
                hotplug: None,
                picture: None,
                focus: None,
            }),
            ready: Condvar::new(),
        });

        let job_inner = Arc::clone(&inner);
        let hotplug = Worker::spawn("camera-hotplug", move |token| {
            hotplug_job(&job_inner, engine, &token);
        })?;
        inner.lock().hotplug = Some(hotplug);
        Ok(Self { inner, lease: None })
    }

    pub(crate) fn with_lease(mut self, lease: Arc<AtomicBool>) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Static description from the configuration.
    pub fn camera_info(&self) -> CameraInfo {
        CameraInfo::from(&self.inner.lock().spec)
    }

    /// Install the client sinks.
    pub fn set_callbacks(&self, callbacks: Arc<dyn CameraCallbacks>) {
        let mut rt = self.inner.lock();
        rt.callbacks = Some(callbacks);
        rt.sync_route();
    }

    /// Attach or detach the display surface.
    pub fn set_preview_window(&self, window: Option<Arc<dyn PreviewWindow>>) {
        let mut rt = self.inner.lock();
        rt.window = window;
        if rt.preview_running() {
            let size = rt.params.raw_size(rt.records());
            rt.negotiate_window(size);
        }
        rt.sync_route();
    }

    /// Switch messages on.
    pub fn enable_messages(&self, mask: MessageMask) -> Result<()> {
        self.inner.lock().reconfigure(|rt| {
            rt.mask.insert(mask);
            Ok(())
        })
    }

    /// Switch messages off.
    pub fn disable_messages(&self, mask: MessageMask) -> Result<()> {
        self.inner.lock().reconfigure(|rt| {
            rt.mask.remove(mask);
            Ok(())
        })
    }

    /// Whether any message of `mask` is on.
    pub fn messages_enabled(&self, mask: MessageMask) -> bool {
        self.inner.lock().mask.intersects(mask)
    }

    /// Whether a device has been detected.
    pub fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    /// Block until a device is detected.
    pub fn await_ready(&self) -> Result<()> {
        let mut rt = self.inner.lock();
        while !rt.ready {
            if rt.released {
                return Err(CaptureError::NotReady);
            }
            rt = self
                .inner
                .ready
                .wait(rt)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }

    /// Wait up to `timeout` for a device. Returns whether it is ready.
    pub fn await_ready_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut rt = self.inner.lock();
        while !rt.ready && !rt.released {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            rt = self
                .inner
                .ready
                .wait_timeout(rt, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        rt.ready
    }

    /// Start streaming preview frames. A no-op if already running.
    pub fn start_preview(&self) -> Result<()> {
        self.inner.lock().start_preview()
    }

    /// Stop the preview and release the device. Idempotent.
    pub fn stop_preview(&self) {
        self.inner.lock().stop_preview();
    }

    /// Whether the preview worker is streaming.
    pub fn is_preview_enabled(&self) -> bool {
        self.inner.lock().preview_running()
    }

    /// Start delivering recording frames.
    pub fn start_recording(&self) -> Result<()> {
        self.inner.lock().reconfigure(|rt| {
            rt.recording = true;
            Ok(())
        })
    }

    /// Stop delivering recording frames.
    pub fn stop_recording(&self) {
        let stopped = self.inner.lock().reconfigure(|rt| {
            rt.recording = false;
            Ok(())
        });
        if let Err(err) = stopped {
            warn!(%err, "preview restart after recording failed");
        }
    }

    /// Whether recording frames are being delivered.
    pub fn is_recording_enabled(&self) -> bool {
        self.inner.lock().recording
    }

    /// Return a recording frame. Frames are reference counted, so this only
    /// drops the client's handle.
    pub fn release_recording_frame(&self, frame: SharedFrame) {
        trace!(slot = frame.slot(), "recording frame released");
    }

    /// Only frame data is supported in recording buffers.
    pub fn store_metadata_in_buffers(&self, enable: bool) -> Result<()> {
        if enable {
            return Err(CaptureError::InvalidParameter(
                "metadata in recording buffers is not supported".to_owned(),
            ));
        }
        Ok(())
    }

    /// Run focus. The lens is fixed, so this reports success right away.
    pub fn auto_focus(&self) -> Result<()> {
        // The focus worker runs client callbacks, so it is joined unlocked.
        let mut rt = loop {
            let mut rt = self.inner.lock();
            let Some(previous) = rt.focus.take() else {
                break rt;
            };
            drop(rt);
            if let Err(err) = previous.join() {
                warn!(%err, "previous focus worker failed");
            }
        };
        let route = Arc::clone(&rt.route);
        rt.focus = Some(Worker::spawn("camera-focus", move |_| {
            let route = lock_route(&route).clone();
            route.notify(Notification::Focus(true));
        })?);
        Ok(())
    }

    /// Nothing to cancel with a fixed lens.
    pub fn cancel_auto_focus(&self) -> Result<()> {
        Ok(())
    }

    /// Capture a still picture in the background. Stops the preview.
    pub fn take_picture(&self) -> Result<()> {
        let mut rt = self.inner.lock();
        if !rt.ready {
            return Err(CaptureError::NotReady);
        }
        if rt.picture.as_ref().is_some_and(|w| !w.is_finished()) {
            return Err(CaptureError::InvalidState {
                operation: "take_picture",
                state: "capturing",
            });
        }
        if let Some(previous) = rt.picture.take() {
            if let Err(err) = previous.join() {
                warn!(%err, "previous picture worker failed");
            }
        }
        let inner = Arc::clone(&self.inner);
        rt.picture = Some(Worker::spawn("camera-picture", move |_| picture_job(&inner))?);
        Ok(())
    }

    /// Wait for an in-flight picture to finish.
    pub fn cancel_picture(&self) -> Result<()> {
        let worker = self.inner.lock().picture.take();
        if let Some(worker) = worker {
            worker.join()?;
        }
        Ok(())
    }

    /// Replace the parameters. Restarts the preview if it is affected.
    pub fn set_parameters(&self, params: CameraParameters) -> Result<()> {
        self.inner.lock().set_parameters(params)
    }

    /// Apply a flattened `key=value;...` string.
    pub fn set_parameters_str(&self, text: &str) -> Result<()> {
        let mut rt = self.inner.lock();
        let params = rt.params.merge_flattened(text)?;
        rt.set_parameters(params)
    }

    /// Current parameters.
    pub fn parameters(&self) -> CameraParameters {
        self.inner.lock().params.clone()
    }

    /// Current parameters, flattened.
    pub fn parameters_str(&self) -> String {
        self.inner.lock().params.flatten()
    }

    /// Stop every worker and release every resource. Idempotent.
    pub fn release(&mut self) {
        let workers = {
            let mut rt = self.inner.lock();
            rt.released = true;
            rt.ready = false;
            rt.stop_preview();
            self.inner.ready.notify_all();
            [rt.hotplug.take(), rt.picture.take(), rt.focus.take()]
        };
        // Joined without the lock: the hotplug and picture workers take it.
        for worker in workers.into_iter().flatten() {
            let name = worker.name().to_owned();
            if let Err(err) = worker.stop() {
                warn!(worker = %name, %err, "worker failed during release");
            }
        }

        let mut rt = self.inner.lock();
        if let EngineSlot::Idle(engine) = &mut rt.engine {
            teardown(engine);
        }
        rt.pool.release();
        rt.callbacks = None;
        rt.window = None;
        rt.sync_route();
        drop(rt);
        if let Some(lease) = self.lease.take() {
            lease.store(false, Ordering::SeqCst);
            debug!("camera released");
        }
    }
}

impl<P: DeviceProvider> Drop for Camera<P> {
    fn drop(&mut self) {
        self.release();
    }
}
