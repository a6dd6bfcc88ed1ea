//! Scripted driver for testing without hardware.
//!
//! A [`MockProvider`] exposes a fixed set of nodes. Tests steer the driver at
//! runtime through the shared [`MockControl`]: pause frame delivery, unplug
//! the device, detach every node, or switch the test pattern.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{CaptureError, Result};
use crate::surface::SurfaceDesc;
use crate::traits::{
    CameraDevice, CaptureStream, DeviceCapabilities, DeviceProvider, Format, FourCC, Fraction,
    FrameIntervals, FrameMetadata, FrameSizes,
};

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
    /// Solid grey whose luma encodes the frame sequence number.
    Numbered,
}

/// Runtime knobs shared between a test and every device it opened.
#[derive(Debug)]
pub struct MockControl {
    attached: AtomicBool,
    paused: AtomicBool,
    unplugged: AtomicBool,
    fail_alloc: AtomicBool,
    pattern: Mutex<TestPattern>,
    opened: Mutex<Vec<PathBuf>>,
    mapped: AtomicUsize,
    frames: AtomicU32,
}

impl Default for MockControl {
    fn default() -> Self {
        Self {
            attached: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            unplugged: AtomicBool::new(false),
            fail_alloc: AtomicBool::new(false),
            pattern: Mutex::new(TestPattern::ColorBars),
            opened: Mutex::new(Vec::new()),
            mapped: AtomicUsize::new(0),
            frames: AtomicU32::new(0),
        }
    }
}

impl MockControl {
    /// Make nodes visible or invisible to enumeration and open.
    pub fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::SeqCst);
    }

    /// Stop or resume frame delivery; a paused stream times out.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Make every stream fail with `ENODEV`.
    pub fn unplug(&self) {
        self.unplugged.store(true, Ordering::SeqCst);
    }

    /// Make buffer requests fail.
    pub fn set_fail_alloc(&self, fail: bool) {
        self.fail_alloc.store(fail, Ordering::SeqCst);
    }

    /// Pattern used for subsequent frames.
    pub fn set_pattern(&self, pattern: TestPattern) {
        *self.pattern.lock().unwrap_or_else(PoisonError::into_inner) = pattern;
    }

    fn pattern(&self) -> TestPattern {
        *self.pattern.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every path passed to `open`, in order.
    pub fn opened(&self) -> Vec<PathBuf> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Capture buffers currently mapped across all streams.
    pub fn mapped(&self) -> usize {
        self.mapped.load(Ordering::SeqCst)
    }

    /// Frames delivered so far.
    pub fn frames(&self) -> u32 {
        self.frames.load(Ordering::SeqCst)
    }
}

/// One scripted video node.
#[derive(Debug, Clone)]
pub struct MockNode {
    /// Node path.
    pub path: PathBuf,
    /// Capabilities reported by `query_caps`.
    pub capabilities: DeviceCapabilities,
    /// Discrete modes.
    pub modes: Vec<SurfaceDesc>,
    /// Extra stepwise size/interval range for one format.
    pub stepwise: Option<(FourCC, FrameSizes, FrameIntervals)>,
    /// Whether `open` fails.
    pub fail_open: bool,
}

impl MockNode {
    /// A capture node offering the given YUYV modes.
    pub fn camera(path: &str, modes: &[(u32, u32, u32)]) -> Self {
        Self {
            path: PathBuf::from(path),
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: format!("mock:{path}"),
                can_capture: true,
                can_stream: true,
            },
            modes: modes
                .iter()
                .map(|&(w, h, fps)| SurfaceDesc::new(FourCC::YUYV, w, h, fps))
                .collect(),
            stepwise: None,
            fail_open: false,
        }
    }

    /// A node that is not a capture device (e.g. a metadata node).
    pub fn metadata(path: &str) -> Self {
        let mut node = Self::camera(path, &[]);
        node.capabilities.can_capture = false;
        node
    }

    /// A node that only offers compressed frames.
    pub fn mjpeg_only(path: &str) -> Self {
        let mut node = Self::camera(path, &[]);
        node.modes = vec![SurfaceDesc::new(FourCC::MJPG, 1280, 720, 30)];
        node
    }

    /// A node whose `open` fails.
    pub fn broken(path: &str) -> Self {
        let mut node = Self::camera(path, &[(640, 480, 30)]);
        node.fail_open = true;
        node
    }
}

/// Provider over scripted nodes.
#[derive(Debug, Clone)]
pub struct MockProvider {
    nodes: Vec<MockNode>,
    control: Arc<MockControl>,
}

impl MockProvider {
    /// Provider exposing `nodes`.
    pub fn new(nodes: Vec<MockNode>) -> Self {
        Self {
            nodes,
            control: Arc::new(MockControl::default()),
        }
    }

    /// Provider with a single VGA camera at `/dev/video0`.
    pub fn single() -> Self {
        Self::new(vec![MockNode::camera(
            "/dev/video0",
            &[(640, 480, 30), (320, 240, 30), (1280, 720, 30), (800, 600, 30)],
        )])
    }

    /// Shared runtime control.
    pub fn control(&self) -> Arc<MockControl> {
        Arc::clone(&self.control)
    }
}

impl DeviceProvider for MockProvider {
    type Device = MockDevice;

    fn list_nodes(&self) -> Vec<PathBuf> {
        if !self.control.attached.load(Ordering::SeqCst) {
            return Vec::new();
        }
        self.nodes.iter().map(|n| n.path.clone()).collect()
    }

    fn open(&self, path: &Path) -> Result<MockDevice> {
        self.control
            .opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.to_path_buf());
        let node = self
            .nodes
            .iter()
            .find(|n| n.path == path)
            .filter(|_| self.control.attached.load(Ordering::SeqCst))
            .ok_or_else(|| CaptureError::Io(std::io::Error::from_raw_os_error(libc::ENOENT)))?;
        if node.fail_open {
            return Err(CaptureError::Io(std::io::Error::from_raw_os_error(libc::EBUSY)));
        }
        let first = node.modes.first().map_or((640, 480), |d| (d.width(), d.height()));
        Ok(MockDevice {
            node: node.clone(),
            format: Format::new(first.0, first.1, FourCC::YUYV),
            fps: 30,
            control: Arc::clone(&self.control),
        })
    }
}

/// Mock device for testing without hardware.
#[derive(Debug)]
pub struct MockDevice {
    node: MockNode,
    format: Format,
    fps: u32,
    control: Arc<MockControl>,
}

impl CameraDevice for MockDevice {
    type Stream = MockStream;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.node.capabilities
    }

    fn enum_formats(&self) -> Result<Vec<FourCC>> {
        let mut formats: Vec<FourCC> = self.node.modes.iter().map(|d| d.fourcc).collect();
        formats.extend(self.node.stepwise.iter().map(|(f, _, _)| *f));
        formats.sort();
        formats.dedup();
        Ok(formats)
    }

    fn enum_frame_sizes(&self, fourcc: FourCC) -> Result<Vec<FrameSizes>> {
        let mut sizes: Vec<FrameSizes> = Vec::new();
        for desc in self.node.modes.iter().filter(|d| d.fourcc == fourcc) {
            let size = FrameSizes::Discrete {
                width: desc.width(),
                height: desc.height(),
            };
            if !sizes.contains(&size) {
                sizes.push(size);
            }
        }
        if let Some((f, range, _)) = self.node.stepwise {
            if f == fourcc {
                sizes.push(range);
            }
        }
        Ok(sizes)
    }

    fn enum_frame_intervals(&self, fourcc: FourCC, width: u32, height: u32) -> Result<Vec<FrameIntervals>> {
        let mut intervals: Vec<FrameIntervals> = self
            .node
            .modes
            .iter()
            .filter(|d| d.fourcc == fourcc && d.width() == width && d.height() == height)
            .map(|d| FrameIntervals::Discrete(Fraction::new(1, d.fps)))
            .collect();
        if let Some((f, _, range)) = self.node.stepwise {
            if f == fourcc && intervals.is_empty() {
                intervals.push(range);
            }
        }
        Ok(intervals)
    }

    fn format(&self) -> Result<Format> {
        Ok(self.format.clone())
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        let exact = self
            .node
            .modes
            .iter()
            .any(|d| d.fourcc == format.fourcc && d.width() == format.width && d.height() == format.height);
        let stepwise = matches!(
            self.node.stepwise,
            Some((f, FrameSizes::Stepwise { min_width, max_width, min_height, max_height, .. }, _))
                if f == format.fourcc
                    && (min_width..=max_width).contains(&format.width)
                    && (min_height..=max_height).contains(&format.height)
        );
        self.format = if exact || stepwise {
            Format::new(format.width, format.height, format.fourcc)
        } else {
            // Like a real driver: fall back to something it can do.
            let first = self
                .node
                .modes
                .first()
                .ok_or_else(|| CaptureError::Io(std::io::Error::from_raw_os_error(libc::EINVAL)))?;
            Format::new(first.width(), first.height(), first.fourcc)
        };
        Ok(self.format.clone())
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<u32> {
        let offered: Vec<u32> = self
            .node
            .modes
            .iter()
            .filter(|d| d.width() == self.format.width && d.height() == self.format.height)
            .map(|d| d.fps)
            .collect();
        self.fps = if offered.contains(&fps) || offered.is_empty() {
            fps.max(1)
        } else {
            offered.iter().copied().max().unwrap_or(30)
        };
        Ok(self.fps)
    }

    fn create_stream(&mut self, buffer_count: u32) -> Result<MockStream> {
        if self.control.fail_alloc.load(Ordering::SeqCst) {
            return Err(CaptureError::BufferAllocation(
                "mock driver refused buffers".to_owned(),
            ));
        }
        let count = buffer_count as usize;
        self.control.mapped.fetch_add(count, Ordering::SeqCst);
        Ok(MockStream {
            queued: VecDeque::new(),
            owned_by_app: vec![true; count],
            streaming: false,
            format: self.format.clone(),
            period: Duration::from_secs(1) / self.fps.max(1),
            next_due: Instant::now(),
            sequence: 0,
            scratch: vec![0; self.format.size as usize],
            control: Arc::clone(&self.control),
        })
    }
}

/// Mock capture stream with a real slot ring.
#[derive(Debug)]
pub struct MockStream {
    queued: VecDeque<usize>,
    owned_by_app: Vec<bool>,
    streaming: bool,
    format: Format,
    period: Duration,
    next_due: Instant,
    sequence: u32,
    scratch: Vec<u8>,
    control: Arc<MockControl>,
}

fn einval() -> CaptureError {
    CaptureError::Io(std::io::Error::from_raw_os_error(libc::EINVAL))
}

impl MockStream {
    /// Slots currently queued to the driver.
    pub fn queued(&self) -> usize {
        self.queued.len()
    }
}

impl CaptureStream for MockStream {
    fn buffer_count(&self) -> usize {
        self.owned_by_app.len()
    }

    fn start(&mut self) -> Result<()> {
        for (slot, owned) in self.owned_by_app.iter_mut().enumerate() {
            if *owned {
                *owned = false;
                self.queued.push_back(slot);
            }
        }
        self.streaming = true;
        self.next_due = Instant::now() + self.period;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.streaming = false;
        self.queued.clear();
        self.owned_by_app.fill(true);
        Ok(())
    }

    fn dequeue(&mut self, dst: &mut [u8], timeout: Duration) -> Result<FrameMetadata> {
        if self.control.unplugged.load(Ordering::SeqCst) {
            return Err(CaptureError::Io(std::io::Error::from_raw_os_error(libc::ENODEV)));
        }
        if !self.streaming {
            return Err(einval());
        }
        let now = Instant::now();
        let due_in = self.next_due.saturating_duration_since(now);
        if self.control.paused.load(Ordering::SeqCst) || due_in > timeout || self.queued.is_empty() {
            std::thread::sleep(timeout);
            return Err(CaptureError::TimedOut);
        }
        std::thread::sleep(due_in);
        self.next_due = self.next_due.max(now) + self.period;

        let slot = self.queued.pop_front().ok_or(CaptureError::TimedOut)?;
        if let Some(owned) = self.owned_by_app.get_mut(slot) {
            *owned = true;
        }
        let (width, height) = (self.format.width as usize, self.format.height as usize);
        generate_test_frame(&mut self.scratch, width, height, self.control.pattern(), self.sequence);
        let copied = dst.len().min(self.scratch.len());
        dst.get_mut(..copied)
            .unwrap_or_default()
            .copy_from_slice(self.scratch.get(..copied).unwrap_or_default());

        let sequence = self.sequence;
        self.sequence += 1;
        self.control.frames.fetch_add(1, Ordering::SeqCst);
        Ok(FrameMetadata {
            slot,
            sequence,
            timestamp: self.period * sequence,
            bytes_used: self.format.size,
            bytes_copied: copied,
        })
    }

    fn release(&mut self, slot: usize) -> Result<()> {
        match self.owned_by_app.get_mut(slot) {
            Some(owned) if *owned && self.streaming => {
                *owned = false;
                self.queued.push_back(slot);
                Ok(())
            }
            // Already queued, unknown, or stream off.
            _ => Err(einval()),
        }
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.control
            .mapped
            .fetch_sub(self.owned_by_app.len(), Ordering::SeqCst);
    }
}

/// Generate test frame data based on pattern.
pub fn generate_test_frame(data: &mut [u8], width: usize, height: usize, pattern: TestPattern, sequence: u32) {
    match pattern {
        TestPattern::ColorBars => generate_color_bars(data, width, height),
        TestPattern::Gradient => generate_gradient(data, width, height),
        TestPattern::Solid(y, u, v) => generate_solid(data, y, u, v),
        TestPattern::Numbered => {
            #[allow(clippy::cast_possible_truncation)]
            let luma = 16 + (sequence % 200) as u8;
            generate_solid(data, luma, 128, 128);
        }
    }
}

/// SMPTE bar colors in YUV: white, yellow, cyan, green, magenta, red, blue, black.
pub const BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

/// Generate YUYV color bars pattern.
pub fn generate_color_bars(data: &mut [u8], width: usize, height: usize) {
    let bar_width = (width / 8).max(1);
    for row in data.chunks_exact_mut(width * 2).take(height) {
        for (pair, quad) in row.chunks_exact_mut(4).enumerate() {
            let (y, u, v) = BARS[(pair * 2 / bar_width).min(7)];
            quad.copy_from_slice(&[y, u, y, v]);
        }
    }
}

/// Generate YUYV horizontal gradient pattern.
pub fn generate_gradient(data: &mut [u8], width: usize, height: usize) {
    for row in data.chunks_exact_mut(width * 2).take(height) {
        for (pair, quad) in row.chunks_exact_mut(4).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let y = (pair * 2 * 255 / width) as u8;
            quad.copy_from_slice(&[y, 128, y, 128]);
        }
    }
}

/// Generate solid color YUYV frame.
pub fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for quad in data.chunks_exact_mut(4) {
        quad.copy_from_slice(&[y, u, y, v]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_creation() {
        let provider = MockProvider::single();
        let device = provider.open(Path::new("/dev/video0")).expect("open should succeed");
        assert_eq!(device.capabilities().driver, "mock");
        assert!(device.capabilities().can_capture);
        assert!(device.capabilities().can_stream);
        assert_eq!(provider.control().opened(), vec![PathBuf::from("/dev/video0")]);
    }

    #[test]
    fn test_mock_device_format() {
        let provider = MockProvider::single();
        let mut device = provider.open(Path::new("/dev/video0")).expect("open should succeed");
        let format = device.format().expect("format should succeed");
        assert_eq!(format.width, 640);
        assert_eq!(format.height, 480);

        let actual = device
            .set_format(&Format::new(1280, 720, FourCC::YUYV))
            .expect("set_format should succeed");
        assert_eq!((actual.width, actual.height), (1280, 720));

        let adjusted = device
            .set_format(&Format::new(1024, 768, FourCC::YUYV))
            .expect("set_format should succeed");
        assert_eq!((adjusted.width, adjusted.height), (640, 480));
    }

    #[test]
    fn test_mock_stream_capture() {
        let provider = MockProvider::single();
        let mut device = provider.open(Path::new("/dev/video0")).expect("open should succeed");
        let mut stream = device.create_stream(4).expect("create_stream should succeed");
        assert_eq!(provider.control().mapped(), 4);
        stream.start().expect("start should succeed");
        assert_eq!(stream.queued(), 4);

        let mut buf = vec![0u8; 640 * 480 * 2];
        let first = stream
            .dequeue(&mut buf, Duration::from_secs(1))
            .expect("dequeue should succeed");
        assert_eq!(first.sequence, 0);
        assert_eq!(stream.queued(), 3);
        assert_eq!(buf[0], 235);

        stream.release(first.slot).expect("release should succeed");
        assert!(stream.release(first.slot).is_err(), "double release must fail");
        let second = stream
            .dequeue(&mut buf, Duration::from_secs(1))
            .expect("dequeue should succeed");
        assert_eq!(second.sequence, 1);

        drop(stream);
        assert_eq!(provider.control().mapped(), 0);
    }

    #[test]
    fn test_paused_stream_times_out() {
        let provider = MockProvider::single();
        let control = provider.control();
        let mut device = provider.open(Path::new("/dev/video0")).expect("open should succeed");
        let mut stream = device.create_stream(4).expect("create_stream should succeed");
        stream.start().expect("start should succeed");
        control.set_paused(true);
        let mut buf = vec![0u8; 16];
        assert!(matches!(
            stream.dequeue(&mut buf, Duration::from_millis(10)),
            Err(CaptureError::TimedOut)
        ));
        control.unplug();
        assert!(matches!(
            stream.dequeue(&mut buf, Duration::from_millis(10)),
            Err(CaptureError::Io(_))
        ));
    }

    #[test]
    fn test_color_bars_pattern() {
        let mut data = vec![0u8; 640 * 480 * 2];
        generate_test_frame(&mut data, 640, 480, TestPattern::ColorBars, 0);
        // First bar is white, last is black.
        assert_eq!(data[0], 235);
        assert_eq!(data[640 * 2 - 4], 16);
    }

    #[test]
    fn test_gradient_pattern() {
        let mut data = vec![0u8; 640 * 480 * 2];
        generate_test_frame(&mut data, 640, 480, TestPattern::Gradient, 0);

        // Left edge should be dark
        assert!(data[0] < 10);

        // Right edge should be bright (check last row, last pixel)
        let last_row_start = 479 * 640 * 2;
        assert!(data[last_row_start + 638 * 2] > 200);
    }

    #[test]
    fn test_solid_and_numbered_patterns() {
        let mut data = vec![0u8; 64 * 64 * 2];
        generate_test_frame(&mut data, 64, 64, TestPattern::Solid(128, 64, 192), 0);
        assert_eq!(&data[..4], &[128, 64, 128, 192]);

        generate_test_frame(&mut data, 64, 64, TestPattern::Numbered, 5);
        assert_eq!(data[0], 21);
    }
}
