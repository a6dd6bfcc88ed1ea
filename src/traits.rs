//! Core traits and types for the video driver abstraction.
//!
//! The capture engine only talks to hardware through these seams, which lets
//! the same engine run against the `v4l` binding in [`crate::device`] and the
//! scripted driver used by the unit tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a packed YUYV format description.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = width * 2; // YUYV is 2 bytes per pixel
        let size = stride * height;
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// A frame interval expressed as a fraction of a second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    /// Numerator.
    pub numerator: u32,
    /// Denominator.
    pub denominator: u32,
}

impl Fraction {
    /// Create a new fraction.
    #[must_use]
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Frames per second for an interval, rounded to the nearest integer.
    ///
    /// Returns `None` for degenerate intervals.
    #[must_use]
    pub const fn fps(&self) -> Option<u32> {
        if self.numerator == 0 || self.denominator == 0 {
            return None;
        }
        Some((self.denominator + self.numerator / 2) / self.numerator)
    }
}

/// Frame sizes advertised for one pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSizes {
    /// A single fixed size.
    Discrete {
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
    },
    /// A continuous or stepped range of sizes.
    Stepwise {
        /// Smallest width.
        min_width: u32,
        /// Largest width.
        max_width: u32,
        /// Width increment.
        step_width: u32,
        /// Smallest height.
        min_height: u32,
        /// Largest height.
        max_height: u32,
        /// Height increment.
        step_height: u32,
    },
}

/// Frame intervals advertised for one pixel format and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameIntervals {
    /// A single fixed interval.
    Discrete(Fraction),
    /// A range of intervals; `min` is the fastest rate.
    Stepwise {
        /// Shortest interval.
        min: Fraction,
        /// Longest interval.
        max: Fraction,
    },
}

/// Metadata for a dequeued frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Ring slot the frame was read from.
    pub slot: usize,
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Bytes the driver filled in the slot.
    pub bytes_used: u32,
    /// Bytes copied into the caller's buffer.
    pub bytes_copied: usize,
}

/// Abstraction over an opened video node.
pub trait CameraDevice: Send {
    /// The stream type returned by `create_stream`.
    type Stream: CaptureStream + 'static;

    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Pixel formats the driver can capture.
    fn enum_formats(&self) -> Result<Vec<FourCC>>;

    /// Frame sizes for a pixel format.
    fn enum_frame_sizes(&self, fourcc: FourCC) -> Result<Vec<FrameSizes>>;

    /// Frame intervals for a pixel format at a given size.
    fn enum_frame_intervals(
        &self,
        fourcc: FourCC,
        width: u32,
        height: u32,
    ) -> Result<Vec<FrameIntervals>>;

    /// Get current format.
    fn format(&self) -> Result<Format>;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, format: &Format) -> Result<Format>;

    /// Request a frame rate. Returns the rate the driver settled on.
    fn set_frame_rate(&mut self, fps: u32) -> Result<u32>;

    /// Request and map a ring of `buffer_count` capture buffers.
    fn create_stream(&mut self, buffer_count: u32) -> Result<Self::Stream>;
}

/// Abstraction over a mapped buffer ring.
pub trait CaptureStream: Send {
    /// Number of slots the driver actually granted.
    fn buffer_count(&self) -> usize;

    /// Turn streaming on.
    fn start(&mut self) -> Result<()>;

    /// Turn streaming off. The driver gives every slot back.
    fn stop(&mut self) -> Result<()>;

    /// Wait up to `timeout` for a filled slot and copy it into `dst`.
    ///
    /// The slot stays application-owned until [`CaptureStream::release`].
    fn dequeue(&mut self, dst: &mut [u8], timeout: Duration) -> Result<FrameMetadata>;

    /// Hand a dequeued slot back to the driver.
    fn release(&mut self, slot: usize) -> Result<()>;
}

/// Enumerates and opens video nodes.
pub trait DeviceProvider: Clone + Send + 'static {
    /// Device type produced by `open`.
    type Device: CameraDevice + 'static;

    /// Video nodes currently present on the system.
    fn list_nodes(&self) -> Vec<PathBuf>;

    /// Open a node by path.
    fn open(&self, path: &Path) -> Result<Self::Device>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction_fps_rounding() {
        assert_eq!(Fraction::new(1, 30).fps(), Some(30));
        assert_eq!(Fraction::new(1001, 30000).fps(), Some(30));
        assert_eq!(Fraction::new(2, 15).fps(), Some(8));
        assert_eq!(Fraction::new(0, 30).fps(), None);
    }

    #[test]
    fn test_fourcc_display() {
        assert_eq!(FourCC::YUYV.to_string(), "YUYV");
    }

    #[test]
    fn test_yuyv_format_geometry() {
        let format = Format::new(640, 480, FourCC::YUYV);
        assert_eq!(format.stride, 1280);
        assert_eq!(format.size, 614_400);
    }
}
