//! Frame pipeline: turn one raw YUYV frame into whatever a sink asked for.
//!
//! Every stage here is stateless apart from [`ExposureMeter`]. Size mismatches
//! are resolved by centring: a larger source is cropped around its middle and
//! a smaller one is placed in the middle of a black frame.

use std::fmt;
use std::str::FromStr;

use crate::convert::{self, ChromaOrder, Plane, RgbLayout, YuyvView};
use crate::error::{CaptureError, Result};
use crate::surface::SurfaceSize;

/// Pixel formats a sink can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Packed 4:2:2, identical to the raw capture format.
    Yuyv,
    /// Semi-planar with V/U interleaved. Historically named 4:2:2 but laid
    /// out as 4:2:0, which is what consumers of this name expect.
    Yuv422Sp,
    /// Semi-planar 4:2:0 with V/U interleaved (NV21).
    Yuv420Sp,
    /// Planar 4:2:0 with V before U and 16-pixel aligned strides (YV12).
    Yuv420P,
    /// Planar 4:2:2 with V before U (YV16).
    Yuv422P,
    /// Packed 24-bit RGB.
    Rgb888,
    /// Packed RGBA.
    Rgba8888,
    /// Packed RGB with an opaque padding byte.
    Rgbx8888,
    /// Packed BGRA.
    Bgra8888,
    /// Packed 16-bit 5-6-5 RGB.
    Rgb565,
    /// JPEG-compressed still image.
    Jpeg,
}

impl PixelFormat {
    /// Parameter-string name of the format.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Yuyv => "yuv422i-yuyv",
            Self::Yuv422Sp => "yuv422sp",
            Self::Yuv420Sp => "yuv420sp",
            Self::Yuv420P => "yuv420p",
            Self::Yuv422P => "yuv422p",
            Self::Rgb888 => "rgb888",
            Self::Rgba8888 => "rgba8888",
            Self::Rgbx8888 => "rgbx8888",
            Self::Bgra8888 => "bgra8888",
            Self::Rgb565 => "rgb565",
            Self::Jpeg => "jpeg",
        }
    }

    /// Bytes needed for a tightly packed frame of this format.
    ///
    /// For JPEG this is the compression budget.
    #[must_use]
    pub const fn frame_size(self, width: usize, height: usize) -> usize {
        match self {
            Self::Yuv422Sp | Self::Yuv420Sp => width * height * 3 / 2,
            Self::Yuv420P => {
                let luma = convert::yv12_luma_stride(width) * height;
                let chroma = convert::yv12_chroma_stride(width) * (height / 2);
                luma + chroma * 2
            }
            Self::Rgb888 => width * height * 3,
            Self::Rgba8888 | Self::Rgbx8888 | Self::Bgra8888 => width * height * 4,
            Self::Yuyv | Self::Yuv422P | Self::Rgb565 | Self::Jpeg => width * height * 2,
        }
    }

    const fn rgb_layout(self) -> Option<RgbLayout> {
        match self {
            Self::Rgb888 => Some(RgbLayout::Rgb24),
            Self::Rgba8888 | Self::Rgbx8888 => Some(RgbLayout::Rgba32),
            Self::Bgra8888 => Some(RgbLayout::Bgra32),
            Self::Rgb565 => Some(RgbLayout::Rgb565),
            _ => None,
        }
    }

    /// First-plane geometry for a frame whose rows hold `stride` pixels.
    const fn plane(self, stride: usize, height: usize) -> Plane {
        let stride = match self {
            Self::Yuyv | Self::Rgb565 | Self::Jpeg => stride * 2,
            Self::Yuv420P => convert::yv12_luma_stride(stride),
            Self::Yuv422Sp | Self::Yuv420Sp | Self::Yuv422P => stride,
            Self::Rgb888 => stride * 3,
            Self::Rgba8888 | Self::Rgbx8888 | Self::Bgra8888 => stride * 4,
        };
        Plane { stride, height }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "yuv422i-yuyv" => Self::Yuyv,
            "yuv422sp" => Self::Yuv422Sp,
            "yuv420sp" => Self::Yuv420Sp,
            "yuv420p" => Self::Yuv420P,
            "yuv422p" => Self::Yuv422P,
            "rgb888" => Self::Rgb888,
            "rgba8888" => Self::Rgba8888,
            "rgbx8888" => Self::Rgbx8888,
            "bgra8888" => Self::Bgra8888,
            "rgb565" => Self::Rgb565,
            "jpeg" => Self::Jpeg,
            other => {
                return Err(CaptureError::InvalidParameter(format!(
                    "unknown pixel format '{other}'"
                )))
            }
        })
    }
}

/// Where a centred copy lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Left edge of the region read from the source.
    pub src_x: usize,
    /// Top edge of the region read from the source.
    pub src_y: usize,
    /// Left edge of the region written in the destination.
    pub dst_x: usize,
    /// Top edge of the region written in the destination.
    pub dst_y: usize,
    /// Region width.
    pub width: usize,
    /// Region height.
    pub height: usize,
}

impl Placement {
    /// Centre a `src` frame inside a `dst` frame. Offsets are even.
    #[must_use]
    pub fn center(src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Self {
        let axis = |src: usize, dst: usize| {
            if src > dst {
                (((src - dst) / 2) & !1, 0, dst)
            } else {
                (0, ((dst - src) / 2) & !1, src)
            }
        };
        let (src_x, dst_x, width) = axis(src_w, dst_w);
        let (src_y, dst_y, height) = axis(src_h, dst_h);
        Self {
            src_x,
            src_y,
            dst_x,
            dst_y,
            width,
            height,
        }
    }

    /// Whether part of the destination stays uncovered.
    #[must_use]
    pub const fn has_margins(&self, dst_w: usize, dst_h: usize) -> bool {
        self.width < dst_w || self.height < dst_h
    }
}

/// Paint a whole frame black in `format`.
pub fn fill_black(dst: &mut [u8], format: PixelFormat, stride: usize, height: usize) {
    let plane = format.plane(stride, height);
    let luma_len = (plane.stride * plane.height).min(dst.len());
    match format {
        PixelFormat::Yuyv => {
            for quad in dst.chunks_exact_mut(4) {
                quad.copy_from_slice(&[16, 128, 16, 128]);
            }
        }
        PixelFormat::Yuv422Sp
        | PixelFormat::Yuv420Sp
        | PixelFormat::Yuv420P
        | PixelFormat::Yuv422P => {
            let (luma, chroma) = dst.split_at_mut(luma_len);
            luma.fill(16);
            chroma.fill(128);
        }
        PixelFormat::Rgba8888 | PixelFormat::Rgbx8888 | PixelFormat::Bgra8888 => {
            for px in dst.chunks_exact_mut(4) {
                px.copy_from_slice(&[0, 0, 0, 0xff]);
            }
        }
        PixelFormat::Rgb888 | PixelFormat::Rgb565 | PixelFormat::Jpeg => dst.fill(0),
    }
}

/// Render `src` centred into a tightly packed `width` x `height` frame.
pub fn render(
    src: &YuyvView<'_>,
    dst: &mut [u8],
    format: PixelFormat,
    width: usize,
    height: usize,
) -> Result<Placement> {
    render_strided(src, dst, format, width, height, width)
}

/// Render `src` centred into a frame whose rows hold `stride` pixels.
pub fn render_strided(
    src: &YuyvView<'_>,
    dst: &mut [u8],
    format: PixelFormat,
    width: usize,
    height: usize,
    stride: usize,
) -> Result<Placement> {
    let placement = Placement::center(src.width(), src.height(), width, height);
    if placement.has_margins(width, height) {
        fill_black(dst, format, stride, height);
    }
    let region = src.crop(placement.src_x, placement.src_y, placement.width, placement.height);
    let plane = format.plane(stride, height);
    let (x, y) = (placement.dst_x, placement.dst_y);

    if let Some(layout) = format.rgb_layout() {
        convert::yuyv_to_rgb(&region, dst, plane, layout, x, y)?;
        return Ok(placement);
    }
    match format {
        PixelFormat::Yuyv => convert::copy_yuyv(&region, dst, plane, x, y)?,
        PixelFormat::Yuv422Sp | PixelFormat::Yuv420Sp => {
            convert::yuyv_to_yvu420sp(&region, dst, plane, x, y)?;
        }
        PixelFormat::Yuv420P => {
            let chroma_stride = convert::yv12_chroma_stride(stride);
            convert::yuyv_to_420p(&region, dst, plane, chroma_stride, ChromaOrder::Vu, x, y)?;
        }
        PixelFormat::Yuv422P => convert::yuyv_to_yvu422p(&region, dst, plane, x, y)?,
        _ => {
            return Err(CaptureError::InvalidParameter(format!(
                "cannot render a frame as {format}"
            )))
        }
    }
    Ok(placement)
}

/// Whether the raw frame can be grabbed straight into the preview heap.
#[must_use]
pub fn is_pass_through(preview_format: PixelFormat, raw: SurfaceSize, preview: SurfaceSize) -> bool {
    preview_format == PixelFormat::Yuyv && raw == preview
}

/// A display buffer borrowed from a preview window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowBuffer {
    /// Pixel storage.
    pub data: Vec<u8>,
    /// Visible width in pixels.
    pub width: usize,
    /// Visible height in pixels.
    pub height: usize,
    /// Row length in pixels.
    pub stride: usize,
    /// Layout of `data`.
    pub format: PixelFormat,
}

impl WindowBuffer {
    /// Allocate a zeroed buffer.
    #[must_use]
    pub fn new(width: usize, height: usize, stride: usize, format: PixelFormat) -> Self {
        Self {
            data: vec![0; format.frame_size(stride.max(width), height)],
            width,
            height,
            stride: stride.max(width),
            format,
        }
    }
}

/// Centre a raw frame into a window buffer, honouring its stride.
pub fn fill_window(src: &YuyvView<'_>, buffer: &mut WindowBuffer) -> Result<Placement> {
    render_strided(
        src,
        &mut buffer.data,
        buffer.format,
        buffer.width,
        buffer.height,
        buffer.stride,
    )
}

/// Compress a raw frame, bounded by `max_size` bytes.
pub fn encode_jpeg(src: &YuyvView<'_>, quality: u8, max_size: usize) -> Result<Vec<u8>> {
    convert::yuyv_to_jpeg(src, quality, max_size)
}

/// Sum of a sparse luma sample: every 16th pixel of every 16th row.
#[must_use]
pub fn luma_sample(src: &YuyvView<'_>) -> u64 {
    (0..src.height())
        .step_by(16)
        .flat_map(|y| src.row(y).iter().step_by(32))
        .map(|&luma| u64::from(luma))
        .sum()
}

/// Waits for auto exposure to settle before a still capture.
#[derive(Debug, Clone)]
pub struct ExposureMeter {
    threshold: u64,
    last: Option<u64>,
    stable: u32,
    frames: u32,
}

impl ExposureMeter {
    /// Frames inspected before giving up on settling.
    pub const MAX_FRAMES: u32 = 8;
    /// Consecutive frames that must agree.
    pub const STABLE_FRAMES: u32 = 4;

    /// Meter for frames of the given size.
    #[must_use]
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            threshold: ((width >> 4) * (height >> 4) * 12) as u64,
            last: None,
            stable: 1,
            frames: 0,
        }
    }

    /// Feed one frame. Returns `true` once exposure looks stable or the
    /// frame budget is spent.
    pub fn observe(&mut self, src: &YuyvView<'_>) -> bool {
        let sample = luma_sample(src);
        self.frames += 1;
        match self.last {
            Some(last) if last.abs_diff(sample) <= self.threshold => self.stable += 1,
            _ => self.stable = 1,
        }
        self.last = Some(sample);
        self.stable >= Self::STABLE_FRAMES || self.frames >= Self::MAX_FRAMES
    }

    /// Frames seen so far.
    #[must_use]
    pub const fn frames(&self) -> u32 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: usize, height: usize, luma: u8) -> Vec<u8> {
        let mut data = vec![0u8; width * height * 2];
        for quad in data.chunks_exact_mut(4) {
            quad.copy_from_slice(&[luma, 90, luma, 240]);
        }
        data
    }

    #[test]
    fn test_frame_sizes() {
        assert_eq!(PixelFormat::Yuyv.frame_size(640, 480), 614_400);
        assert_eq!(PixelFormat::Yuv420Sp.frame_size(640, 480), 460_800);
        assert_eq!(PixelFormat::Yuv422Sp.frame_size(640, 480), 460_800);
        assert_eq!(PixelFormat::Yuv422P.frame_size(640, 480), 614_400);
        // 120 wide: luma stride 128, chroma stride 64.
        assert_eq!(PixelFormat::Yuv420P.frame_size(120, 90), 128 * 90 + 2 * 64 * 45);
        assert_eq!(PixelFormat::Rgba8888.frame_size(10, 10), 400);
        assert_eq!(PixelFormat::Rgb565.frame_size(10, 10), 200);
    }

    #[test]
    fn test_format_names_round_trip() {
        for format in [
            PixelFormat::Yuyv,
            PixelFormat::Yuv422Sp,
            PixelFormat::Yuv420Sp,
            PixelFormat::Yuv420P,
            PixelFormat::Rgba8888,
            PixelFormat::Jpeg,
        ] {
            assert_eq!(format.as_str().parse::<PixelFormat>().ok(), Some(format));
        }
        assert!("nv12".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_smaller_source_is_centred_with_black_margins() {
        let raw = solid(640, 480, 200);
        let src = YuyvView::new(&raw, 640, 480).expect("valid view");
        let mut dst = vec![0u8; PixelFormat::Yuv420Sp.frame_size(800, 600)];
        let placement =
            render(&src, &mut dst, PixelFormat::Yuv420Sp, 800, 600).expect("render should succeed");

        assert_eq!((placement.dst_x, placement.dst_y), (80, 60));
        assert_eq!((placement.width, placement.height), (640, 480));
        // Margins are black, the centre carries the frame.
        assert_eq!(dst[0], 16);
        assert_eq!(dst[59 * 800 + 400], 16);
        assert_eq!(dst[60 * 800 + 79], 16);
        assert_eq!(dst[60 * 800 + 80], 200);
        assert_eq!(dst[539 * 800 + 719], 200);
        assert_eq!(dst[539 * 800 + 720], 16);
        assert_eq!(dst[540 * 800 + 400], 16);
        let chroma = 800 * 600;
        assert_eq!(dst[chroma], 128);
        assert_eq!(dst[chroma + 30 * 800 + 80], 240);
    }

    #[test]
    fn test_larger_source_is_cropped_around_centre() {
        let mut raw = solid(8, 4, 50);
        // Mark the pixel that must land at the destination origin.
        raw[2 * 2] = 99;
        let src = YuyvView::new(&raw, 8, 4).expect("valid view");
        let mut dst = vec![0u8; PixelFormat::Yuyv.frame_size(4, 2)];
        let placement = render(&src, &mut dst, PixelFormat::Yuyv, 4, 2).expect("render should succeed");
        assert_eq!((placement.src_x, placement.src_y), (2, 0));
        assert_eq!(dst[0], 99);
        assert_eq!(dst[2], 50);
    }

    #[test]
    fn test_pass_through_requires_yuyv_and_equal_size() {
        let vga = SurfaceSize::new(640, 480);
        assert!(is_pass_through(PixelFormat::Yuyv, vga, vga));
        assert!(!is_pass_through(PixelFormat::Yuv420Sp, vga, vga));
        assert!(!is_pass_through(PixelFormat::Yuyv, SurfaceSize::new(1280, 720), vga));
    }

    #[test]
    fn test_fill_window_honours_stride() {
        let raw = solid(4, 2, 235);
        let src = YuyvView::new(&raw, 4, 2).expect("valid view");
        let mut window = WindowBuffer::new(4, 2, 8, PixelFormat::Rgba8888);
        fill_window(&src, &mut window).expect("fill should succeed");
        let row = 8 * 4;
        assert_eq!(window.data[3], 0xff);
        assert_eq!(window.data[row + 3], 0xff);
        // Padding past the visible width is untouched.
        assert_eq!(window.data[4 * 4 + 3], 0);
    }

    #[test]
    fn test_jpeg_is_not_a_render_target() {
        let raw = solid(4, 2, 100);
        let src = YuyvView::new(&raw, 4, 2).expect("valid view");
        let mut dst = vec![0u8; 64];
        assert!(render(&src, &mut dst, PixelFormat::Jpeg, 4, 2).is_err());
    }

    #[test]
    fn test_exposure_meter_settles_on_stable_frames() {
        let raw = solid(64, 64, 120);
        let src = YuyvView::new(&raw, 64, 64).expect("valid view");
        let mut meter = ExposureMeter::new(64, 64);
        let settled_after = (1..=8).find(|_| meter.observe(&src));
        assert_eq!(settled_after, Some(ExposureMeter::STABLE_FRAMES));
    }

    #[test]
    fn test_exposure_meter_accepts_difference_at_threshold() {
        // 16 samples per 64x64 frame; a luma step of 12 moves the sum by
        // exactly the 192 threshold.
        let mut meter = ExposureMeter::new(64, 64);
        let settled_after = (1..=8).find(|i| {
            let raw = solid(64, 64, if i % 2 == 0 { 112 } else { 100 });
            meter.observe(&YuyvView::new(&raw, 64, 64).expect("valid view"))
        });
        assert_eq!(settled_after, Some(ExposureMeter::STABLE_FRAMES));
    }

    #[test]
    fn test_exposure_meter_gives_up_after_budget() {
        let mut meter = ExposureMeter::new(64, 64);
        let mut settled = false;
        for i in 0..ExposureMeter::MAX_FRAMES {
            let luma = if i % 2 == 0 { 20 } else { 220 };
            let raw = solid(64, 64, luma);
            let src = YuyvView::new(&raw, 64, 64).expect("valid view");
            settled = meter.observe(&src);
            if settled {
                break;
            }
        }
        assert!(settled);
        assert_eq!(meter.frames(), ExposureMeter::MAX_FRAMES);
    }
}
