//! V4L2 device implementation using the v4l crate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, trace};
use v4l::buffer::Type;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::{CaptureStream as V4lCaptureStream, Stream as V4lStream};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::error::{CaptureError, Result};
use crate::traits::{
    CameraDevice, CaptureStream, DeviceCapabilities, DeviceProvider, Format, FourCC, Fraction,
    FrameIntervals, FrameMetadata, FrameSizes,
};

/// Enumerates `/dev/video*` nodes through the v4l context API.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Provider;

impl DeviceProvider for V4l2Provider {
    type Device = V4L2Device;

    fn list_nodes(&self) -> Vec<PathBuf> {
        let mut nodes: Vec<_> = v4l::context::enum_devices()
            .into_iter()
            .map(|node| node.path().to_path_buf())
            .collect();
        nodes.sort();
        nodes
    }

    fn open(&self, path: &Path) -> Result<V4L2Device> {
        V4L2Device::open_path(path)
    }
}

fn from_v4l_format(fmt: &v4l::Format) -> Format {
    Format {
        width: fmt.width,
        height: fmt.height,
        fourcc: FourCC::from(fmt.fourcc),
        stride: fmt.stride,
        size: fmt.size,
    }
}

const fn fraction(f: v4l::Fraction) -> Fraction {
    Fraction::new(f.numerator, f.denominator)
}

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    device: Device,
    path: PathBuf,
    capabilities: DeviceCapabilities,
}

impl std::fmt::Debug for V4L2Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4L2Device")
            .field("path", &self.path)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl V4L2Device {
    /// Open a V4L2 device by node path (e.g. `/dev/video0`).
    pub fn open_path(path: &Path) -> Result<Self> {
        let device = Device::with_path(path).map_err(CaptureError::from_driver)?;
        let caps = device.query_caps().map_err(CaptureError::from_driver)?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };
        debug!(path = %path.display(), card = %capabilities.card, "queried capabilities");

        Ok(Self {
            device,
            path: path.to_path_buf(),
            capabilities,
        })
    }

    /// Open a V4L2 device by index (e.g., 0 for /dev/video0).
    pub fn open(index: usize) -> Result<Self> {
        Self::open_path(&PathBuf::from(format!("/dev/video{index}")))
    }

    /// Node this device was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CameraDevice for V4L2Device {
    type Stream = V4L2Stream;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn enum_formats(&self) -> Result<Vec<FourCC>> {
        let formats = self.device.enum_formats().map_err(CaptureError::from_driver)?;
        Ok(formats.into_iter().map(|d| FourCC::from(d.fourcc)).collect())
    }

    fn enum_frame_sizes(&self, fourcc: FourCC) -> Result<Vec<FrameSizes>> {
        let sizes = self
            .device
            .enum_framesizes(fourcc.into())
            .map_err(CaptureError::from_driver)?;
        Ok(sizes
            .into_iter()
            .map(|size| match size.size {
                FrameSizeEnum::Discrete(d) => FrameSizes::Discrete {
                    width: d.width,
                    height: d.height,
                },
                FrameSizeEnum::Stepwise(s) => FrameSizes::Stepwise {
                    min_width: s.min_width,
                    max_width: s.max_width,
                    step_width: s.step_width,
                    min_height: s.min_height,
                    max_height: s.max_height,
                    step_height: s.step_height,
                },
            })
            .collect())
    }

    fn enum_frame_intervals(
        &self,
        fourcc: FourCC,
        width: u32,
        height: u32,
    ) -> Result<Vec<FrameIntervals>> {
        let intervals = self
            .device
            .enum_frameintervals(fourcc.into(), width, height)
            .map_err(CaptureError::from_driver)?;
        Ok(intervals
            .into_iter()
            .map(|interval| match interval.interval {
                FrameIntervalEnum::Discrete(f) => FrameIntervals::Discrete(fraction(f)),
                FrameIntervalEnum::Stepwise(s) => FrameIntervals::Stepwise {
                    min: fraction(s.min),
                    max: fraction(s.max),
                },
            })
            .collect())
    }

    fn format(&self) -> Result<Format> {
        let fmt = self.device.format().map_err(CaptureError::from_driver)?;
        Ok(from_v4l_format(&fmt))
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        let mut fmt = self.device.format().map_err(CaptureError::from_driver)?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = self
            .device
            .set_format(&fmt)
            .map_err(CaptureError::from_driver)?;
        Ok(from_v4l_format(&fmt))
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<u32> {
        let params = self
            .device
            .set_params(&Parameters::with_fps(fps))
            .map_err(CaptureError::from_driver)?;
        Ok(fraction(params.interval).fps().unwrap_or(fps))
    }

    fn create_stream(&mut self, buffer_count: u32) -> Result<V4L2Stream> {
        let stream = Stream::with_buffers(&self.device, Type::VideoCapture, buffer_count)
            .map_err(|err| CaptureError::BufferAllocation(err.to_string()))?;

        Ok(V4L2Stream {
            stream,
            buffer_count: buffer_count as usize,
            armed: false,
            primed: false,
            held: None,
            next_slot: 0,
        })
    }
}

/// V4L2 capture stream wrapping mmap-based streaming.
///
/// The v4l stream queues every buffer and turns streaming on at its first
/// dequeue, and re-queues the previous buffer at each following one. Once
/// primed, frames are awaited with `poll` so that a timeout never leaves a
/// buffer queued twice.
///
/// v4l does not expose buffer indices, so slot numbers are assigned
/// round-robin. They identify the held buffer for `release` but are not the
/// driver's indices, and a released slot is only back with the driver after
/// the following dequeue.
pub struct V4L2Stream {
    stream: Stream<'static>,
    buffer_count: usize,
    armed: bool,
    primed: bool,
    held: Option<usize>,
    next_slot: usize,
}

impl V4L2Stream {
    fn wait_readable(&self, timeout: Duration) -> Result<()> {
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let ready = self
            .stream
            .handle()
            .poll(libc::POLLIN, millis)
            .map_err(CaptureError::from_driver)?;
        if ready == 0 {
            return Err(CaptureError::TimedOut);
        }
        Ok(())
    }

    fn halt(&mut self) -> Result<()> {
        self.primed = false;
        self.held = None;
        self.next_slot = 0;
        V4lStream::stop(&mut self.stream).map_err(CaptureError::from_driver)
    }
}

impl CaptureStream for V4L2Stream {
    fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    fn start(&mut self) -> Result<()> {
        self.armed = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.armed = false;
        if self.primed {
            self.halt()?;
        }
        Ok(())
    }

    fn dequeue(&mut self, dst: &mut [u8], timeout: Duration) -> Result<FrameMetadata> {
        if !self.armed {
            return Err(CaptureError::InvalidState {
                operation: "dequeue",
                state: "stream off",
            });
        }
        if self.primed {
            self.wait_readable(timeout)?;
        } else {
            self.stream.set_timeout(timeout);
        }

        let result = V4lCaptureStream::next(&mut self.stream).map(|(buf, meta)| {
            let copied = dst.len().min(buf.len());
            dst.get_mut(..copied)
                .unwrap_or_default()
                .copy_from_slice(buf.get(..copied).unwrap_or_default());
            (copied, *meta)
        });
        let (copied, meta) = match result {
            Ok(frame) => frame,
            Err(err) => {
                let err = CaptureError::from_driver(err);
                if !self.primed {
                    // Streaming went on with every buffer queued; turn it off
                    // so the next attempt starts from a clean ring.
                    if let Err(halt_err) = self.halt() {
                        trace!(%halt_err, "stream off after failed prime");
                    }
                }
                return Err(err);
            }
        };
        self.primed = true;

        let slot = self.next_slot;
        self.next_slot = (slot + 1) % self.buffer_count.max(1);
        self.held = Some(slot);

        // Safe conversions: V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        Ok(FrameMetadata {
            slot,
            sequence: meta.sequence,
            timestamp: Duration::new(secs, nanos),
            bytes_used: meta.bytesused,
            bytes_copied: copied,
        })
    }

    fn release(&mut self, slot: usize) -> Result<()> {
        // The v4l stream re-queues this buffer at the next dequeue.
        match self.held.take() {
            Some(held) if held == slot => Ok(()),
            other => {
                self.held = other;
                Err(CaptureError::InvalidParameter(format!(
                    "slot {slot} is not the dequeued slot"
                )))
            }
        }
    }
}
