//! Catalog of capture modes advertised by a device.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::CaptureError;
use crate::traits::FourCC;

/// Widest mode considered for the default preview. Some UVC cameras
/// advertise huge modes at full rate that they cannot sustain.
pub const MAX_PREVIEW_WIDTH: u32 = 1920;

/// A frame size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceSize {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl SurfaceSize {
    /// Create a new size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixel count.
    #[must_use]
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl Ord for SurfaceSize {
    fn cmp(&self, other: &Self) -> Ordering {
        self.area()
            .cmp(&other.area())
            .then(self.width.cmp(&other.width))
    }
}

impl PartialOrd for SurfaceSize {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SurfaceSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for SurfaceSize {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| CaptureError::InvalidParameter(format!("bad size '{s}'")))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| CaptureError::InvalidParameter(format!("bad width in '{s}'")))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| CaptureError::InvalidParameter(format!("bad height in '{s}'")))?;
        Ok(Self::new(width, height))
    }
}

/// One capture mode: pixel format, size and frame rate.
///
/// Ordering is by frame rate, then size, then pixel format, so the maximum of
/// a set is the fastest mode at the largest resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceDesc {
    /// Pixel format.
    pub fourcc: FourCC,
    /// Frame size.
    pub size: SurfaceSize,
    /// Frames per second.
    pub fps: u32,
}

impl SurfaceDesc {
    /// Create a new mode description.
    #[must_use]
    pub const fn new(fourcc: FourCC, width: u32, height: u32, fps: u32) -> Self {
        Self {
            fourcc,
            size: SurfaceSize::new(width, height),
            fps,
        }
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.size.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.size.height
    }
}

impl Ord for SurfaceDesc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fps
            .cmp(&other.fps)
            .then(self.size.cmp(&other.size))
            .then(self.fourcc.cmp(&other.fourcc))
    }
}

impl PartialOrd for SurfaceDesc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SurfaceDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}@{}", self.fourcc, self.size, self.fps)
    }
}

/// Every mode a device advertised, built once per open.
#[derive(Debug, Clone, Default)]
pub struct SurfaceCatalog {
    modes: BTreeSet<SurfaceDesc>,
    preferred: Option<SurfaceSize>,
}

impl SurfaceCatalog {
    /// Empty catalog that favours `preferred` as the default preview size.
    #[must_use]
    pub const fn new(preferred: Option<SurfaceSize>) -> Self {
        Self {
            modes: BTreeSet::new(),
            preferred,
        }
    }

    /// Record a mode.
    pub fn insert(&mut self, desc: SurfaceDesc) {
        self.modes.insert(desc);
    }

    /// Number of recorded modes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modes.len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// All modes in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &SurfaceDesc> {
        self.modes.iter()
    }

    /// Modes the engine can stream (packed YUYV).
    pub fn usable(&self) -> impl Iterator<Item = &SurfaceDesc> {
        self.modes.iter().filter(|d| d.fourcc == FourCC::YUYV)
    }

    /// Whether at least one streamable mode exists.
    #[must_use]
    pub fn has_usable(&self) -> bool {
        self.usable().next().is_some()
    }

    /// Distinct streamable sizes, ascending.
    #[must_use]
    pub fn available_sizes(&self) -> BTreeSet<SurfaceSize> {
        self.usable().map(|d| d.size).collect()
    }

    /// Distinct streamable frame rates, ascending.
    #[must_use]
    pub fn available_fps(&self) -> BTreeSet<u32> {
        self.usable().map(|d| d.fps).collect()
    }

    /// Default preview mode: the preferred size at its fastest rate if the
    /// device offers it, otherwise the fastest mode at the largest size no
    /// wider than [`MAX_PREVIEW_WIDTH`].
    #[must_use]
    pub fn best_preview(&self) -> Option<SurfaceDesc> {
        if let Some(preferred) = self.preferred {
            let hit = self.usable().filter(|d| d.size == preferred).max();
            if hit.is_some() {
                return hit.copied();
            }
        }
        self.usable()
            .filter(|d| d.width() <= MAX_PREVIEW_WIDTH)
            .max()
            .or_else(|| self.usable().max())
            .copied()
    }

    /// Default picture mode: the largest size, fastest rate on ties.
    #[must_use]
    pub fn best_picture(&self) -> Option<SurfaceDesc> {
        self.usable()
            .max_by(|a, b| a.size.cmp(&b.size).then(a.fps.cmp(&b.fps)))
            .copied()
    }

    /// The streamable mode closest to a request: an exact match if there is
    /// one, otherwise the nearest by area and then by frame rate.
    #[must_use]
    pub fn closest(&self, width: u32, height: u32, fps: u32) -> Option<SurfaceDesc> {
        let wanted = SurfaceSize::new(width, height);
        let mut best: Option<(u64, u32, SurfaceDesc)> = None;
        for desc in self.usable() {
            if desc.size == wanted && desc.fps == fps {
                return Some(*desc);
            }
            let area_gap = desc.size.area().abs_diff(wanted.area());
            let size_gap = if desc.size == wanted { 0 } else { area_gap.max(1) };
            let fps_gap = desc.fps.abs_diff(fps);
            let better = best.map_or(true, |(a, f, _)| (size_gap, fps_gap) < (a, f));
            if better {
                best = Some((size_gap, fps_gap, *desc));
            }
        }
        best.map(|(_, _, desc)| desc)
    }
}
