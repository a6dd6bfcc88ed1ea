//! YUYV conversion routines.
//!
//! Every routine reads a packed YUYV source view and writes a region of the
//! same size into a destination frame at a given position. Positions and
//! widths are rounded down to even values so that chroma pairs never split.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::error::{CaptureError, Result};

/// Borrowed view of a packed YUYV image.
#[derive(Debug, Clone, Copy)]
pub struct YuyvView<'a> {
    data: &'a [u8],
    stride: usize,
    width: usize,
    height: usize,
}

impl<'a> YuyvView<'a> {
    /// View a tightly packed frame.
    pub fn new(data: &'a [u8], width: usize, height: usize) -> Result<Self> {
        Self::with_stride(data, width * 2, width, height)
    }

    /// View a frame whose rows are `stride` bytes apart.
    pub fn with_stride(data: &'a [u8], stride: usize, width: usize, height: usize) -> Result<Self> {
        let needed = if height == 0 {
            0
        } else {
            stride * (height - 1) + width * 2
        };
        if stride < width * 2 || data.len() < needed {
            return Err(CaptureError::InvalidParameter(format!(
                "YUYV view {width}x{height} stride {stride} needs {needed} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            stride,
            width,
            height,
        })
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Bytes between rows.
    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// One row of pixels.
    #[must_use]
    pub fn row(&self, y: usize) -> &'a [u8] {
        let start = y * self.stride;
        self.data.get(start..start + self.width * 2).unwrap_or_default()
    }

    /// Sub-view of `width` x `height` pixels starting at (`x`, `y`),
    /// clamped to the source bounds.
    #[must_use]
    pub fn crop(&self, x: usize, y: usize, width: usize, height: usize) -> Self {
        let x = (x & !1).min(self.width);
        let y = y.min(self.height);
        let width = width.min(self.width - x) & !1;
        let height = height.min(self.height - y);
        let start = y * self.stride + x * 2;
        Self {
            data: self.data.get(start..).unwrap_or_default(),
            stride: self.stride,
            width,
            height,
        }
    }

    /// Luma of a single pixel.
    #[must_use]
    pub fn luma(&self, x: usize, y: usize) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get(y * self.stride + x * 2).copied()
    }

    /// RGB value of a pixel. Odd pixels share the chroma of their pair.
    #[must_use]
    pub fn pixel_at(&self, x: usize, y: usize) -> Option<(u8, u8, u8)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let pair = y * self.stride + (x & !1) * 2;
        let quad = self.data.get(pair..pair + 4)?;
        let luma = if x % 2 == 0 { quad[0] } else { quad[2] };
        Some(yuv_to_rgb(luma, quad[1], quad[3]))
    }
}

/// Destination frame geometry: bytes per row of the first plane and rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    /// Bytes between rows of the first plane.
    pub stride: usize,
    /// Number of rows in the first plane.
    pub height: usize,
}

/// Order of the two chroma planes in a planar layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaOrder {
    /// Cb plane first (I420).
    Uv,
    /// Cr plane first (YV12 / YV16).
    Vu,
}

/// Packed RGB output layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RgbLayout {
    /// R, G, B bytes.
    Rgb24,
    /// R, G, B, 0xff.
    Rgba32,
    /// B, G, R, 0xff.
    Bgra32,
    /// 5-6-5 little endian.
    Rgb565,
}

impl RgbLayout {
    /// Bytes per output pixel.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb24 => 3,
            Self::Rgba32 | Self::Bgra32 => 4,
            Self::Rgb565 => 2,
        }
    }
}

/// Convert YUV values to RGB using the ITU-R BT.601 formula.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    (clamp_u8(r), clamp_u8(g), clamp_u8(b))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_u8(val: f32) -> u8 {
    val.round().clamp(0.0, 255.0) as u8
}

#[allow(clippy::cast_possible_truncation)]
const fn avg(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16 + 1) / 2) as u8
}

const fn align16(value: usize) -> usize {
    (value + 15) & !15
}

/// Row stride of the luma plane of a 16-pixel aligned planar 4:2:0 frame.
#[must_use]
pub const fn yv12_luma_stride(width: usize) -> usize {
    align16(width)
}

/// Row stride of each chroma plane of a 16-pixel aligned planar 4:2:0 frame.
#[must_use]
pub const fn yv12_chroma_stride(width: usize) -> usize {
    align16(align16(width) / 2)
}

fn region(src: &YuyvView<'_>, plane: Plane, row_bytes_per_px: usize, x: usize, y: usize) -> (usize, usize, usize, usize) {
    let x = x & !1;
    let max_w = (plane.stride / row_bytes_per_px).saturating_sub(x);
    let w = src.width.min(max_w) & !1;
    let h = src.height.min(plane.height.saturating_sub(y));
    (x, y, w, h)
}

fn ensure_len(dst: &[u8], needed: usize) -> Result<()> {
    if dst.len() < needed {
        return Err(CaptureError::InvalidParameter(format!(
            "destination holds {} bytes, conversion needs {needed}",
            dst.len()
        )));
    }
    Ok(())
}

fn rows_mut(plane: &mut [u8], stride: usize, x: usize, y: usize, width: usize) -> impl Iterator<Item = &mut [u8]> {
    plane
        .chunks_mut(stride)
        .skip(y)
        .filter_map(move |row| row.get_mut(x..x + width))
}

/// Copy YUYV into a YUYV destination.
pub fn copy_yuyv(src: &YuyvView<'_>, dst: &mut [u8], plane: Plane, x: usize, y: usize) -> Result<()> {
    ensure_len(dst, plane.stride * plane.height)?;
    let (x, y, w, h) = region(src, plane, 2, x, y);
    for (row, out) in rows_mut(dst, plane.stride, x * 2, y, w * 2).take(h).enumerate() {
        out.copy_from_slice(src.row(row).get(..w * 2).unwrap_or_default());
    }
    Ok(())
}

/// YUYV to semi-planar 4:2:0 with interleaved V/U (NV21).
///
/// The chroma plane follows the luma plane and shares its stride.
pub fn yuyv_to_yvu420sp(src: &YuyvView<'_>, dst: &mut [u8], plane: Plane, x: usize, y: usize) -> Result<()> {
    let luma_len = plane.stride * plane.height;
    ensure_len(dst, luma_len + plane.stride * (plane.height / 2))?;
    let (x, y, w, h) = region(src, plane, 1, x, y & !1);
    let h = h & !1;
    let (luma, chroma) = dst.split_at_mut(luma_len);

    for (row, out) in rows_mut(luma, plane.stride, x, y, w).take(h).enumerate() {
        for (px, yuyv) in out.iter_mut().zip(src.row(row).chunks_exact(2)) {
            *px = yuyv[0];
        }
    }
    for (pair, out) in rows_mut(chroma, plane.stride, x, y / 2, w).take(h / 2).enumerate() {
        let top = src.row(pair * 2);
        let bottom = src.row(pair * 2 + 1);
        for ((vu, a), b) in out.chunks_exact_mut(2).zip(top.chunks_exact(4)).zip(bottom.chunks_exact(4)) {
            vu[0] = avg(a[3], b[3]);
            vu[1] = avg(a[1], b[1]);
        }
    }
    Ok(())
}

/// YUYV to planar 4:2:0 with 16-pixel aligned strides.
///
/// `plane.stride` is the luma stride; each chroma plane uses
/// [`yv12_chroma_stride`] of the frame width and half the rows.
pub fn yuyv_to_420p(
    src: &YuyvView<'_>,
    dst: &mut [u8],
    plane: Plane,
    chroma_stride: usize,
    order: ChromaOrder,
    x: usize,
    y: usize,
) -> Result<()> {
    let luma_len = plane.stride * plane.height;
    let chroma_len = chroma_stride * (plane.height / 2);
    ensure_len(dst, luma_len + chroma_len * 2)?;
    let (x, y, w, h) = region(src, plane, 1, x, y & !1);
    let h = h & !1;
    let (luma, chroma) = dst.split_at_mut(luma_len);
    let (first, second) = chroma.split_at_mut(chroma_len);
    let (cb, cr) = match order {
        ChromaOrder::Uv => (first, second),
        ChromaOrder::Vu => (second, first),
    };

    for (row, out) in rows_mut(luma, plane.stride, x, y, w).take(h).enumerate() {
        for (px, yuyv) in out.iter_mut().zip(src.row(row).chunks_exact(2)) {
            *px = yuyv[0];
        }
    }
    let cb_rows = rows_mut(cb, chroma_stride, x / 2, y / 2, w / 2);
    let cr_rows = rows_mut(cr, chroma_stride, x / 2, y / 2, w / 2);
    for (pair, (u_out, v_out)) in cb_rows.zip(cr_rows).take(h / 2).enumerate() {
        let top = src.row(pair * 2);
        let bottom = src.row(pair * 2 + 1);
        for (((u, v), a), b) in u_out
            .iter_mut()
            .zip(v_out.iter_mut())
            .zip(top.chunks_exact(4))
            .zip(bottom.chunks_exact(4))
        {
            *u = avg(a[1], b[1]);
            *v = avg(a[3], b[3]);
        }
    }
    Ok(())
}

/// YUYV to planar 4:2:2 (YV16): luma, then V and U planes at half width.
pub fn yuyv_to_yvu422p(src: &YuyvView<'_>, dst: &mut [u8], plane: Plane, x: usize, y: usize) -> Result<()> {
    let luma_len = plane.stride * plane.height;
    let chroma_stride = plane.stride / 2;
    let chroma_len = chroma_stride * plane.height;
    ensure_len(dst, luma_len + chroma_len * 2)?;
    let (x, y, w, h) = region(src, plane, 1, x, y);
    let (luma, chroma) = dst.split_at_mut(luma_len);
    let (cr, cb) = chroma.split_at_mut(chroma_len);

    for (row, out) in rows_mut(luma, plane.stride, x, y, w).take(h).enumerate() {
        for (px, yuyv) in out.iter_mut().zip(src.row(row).chunks_exact(2)) {
            *px = yuyv[0];
        }
    }
    let cr_rows = rows_mut(cr, chroma_stride, x / 2, y, w / 2);
    let cb_rows = rows_mut(cb, chroma_stride, x / 2, y, w / 2);
    for (row, (v_out, u_out)) in cr_rows.zip(cb_rows).take(h).enumerate() {
        for ((v, u), quad) in v_out.iter_mut().zip(u_out.iter_mut()).zip(src.row(row).chunks_exact(4)) {
            *v = quad[3];
            *u = quad[1];
        }
    }
    Ok(())
}

/// YUYV to a packed RGB layout. `plane.stride` is in bytes.
pub fn yuyv_to_rgb(
    src: &YuyvView<'_>,
    dst: &mut [u8],
    plane: Plane,
    layout: RgbLayout,
    x: usize,
    y: usize,
) -> Result<()> {
    ensure_len(dst, plane.stride * plane.height)?;
    let bpp = layout.bytes_per_pixel();
    let (x, y, w, h) = region(src, plane, bpp, x, y);

    for (row, out) in rows_mut(dst, plane.stride, x * bpp, y, w * bpp).take(h).enumerate() {
        for (pixels, quad) in out.chunks_exact_mut(bpp * 2).zip(src.row(row).chunks_exact(4)) {
            let (first, second) = pixels.split_at_mut(bpp);
            write_rgb(first, yuv_to_rgb(quad[0], quad[1], quad[3]), layout);
            write_rgb(second, yuv_to_rgb(quad[2], quad[1], quad[3]), layout);
        }
    }
    Ok(())
}

fn write_rgb(out: &mut [u8], (r, g, b): (u8, u8, u8), layout: RgbLayout) {
    match layout {
        RgbLayout::Rgb24 => out.copy_from_slice(&[r, g, b]),
        RgbLayout::Rgba32 => out.copy_from_slice(&[r, g, b, 0xff]),
        RgbLayout::Bgra32 => out.copy_from_slice(&[b, g, r, 0xff]),
        RgbLayout::Rgb565 => {
            let packed = (u16::from(r >> 3) << 11) | (u16::from(g >> 2) << 5) | u16::from(b >> 3);
            out.copy_from_slice(&packed.to_le_bytes());
        }
    }
}

/// Rebuild packed YUYV from an NV21 frame of `width` x `height`.
pub fn yvu420sp_to_yuyv(src: &[u8], width: usize, height: usize) -> Result<Vec<u8>> {
    let luma_len = width * height;
    ensure_len(src, luma_len + width * (height / 2))?;
    let (luma, chroma) = src.split_at(luma_len);
    let mut out = vec![0u8; width * height * 2];
    for (row, out_row) in out.chunks_exact_mut(width * 2).enumerate() {
        let luma_row = luma.get(row * width..(row + 1) * width).unwrap_or_default();
        let chroma_row = chroma
            .get((row / 2) * width..(row / 2 + 1) * width)
            .unwrap_or_default();
        for ((quad, ys), vu) in out_row
            .chunks_exact_mut(4)
            .zip(luma_row.chunks_exact(2))
            .zip(chroma_row.chunks_exact(2))
        {
            quad.copy_from_slice(&[ys[0], vu[1], ys[1], vu[0]]);
        }
    }
    Ok(out)
}

/// Compress a YUYV view to JPEG, failing if the result exceeds `max_size`.
pub fn yuyv_to_jpeg(src: &YuyvView<'_>, quality: u8, max_size: usize) -> Result<Vec<u8>> {
    let (width, height) = (src.width(), src.height());
    let mut rgb = vec![0u8; width * height * 3];
    yuyv_to_rgb(
        src,
        &mut rgb,
        Plane {
            stride: width * 3,
            height,
        },
        RgbLayout::Rgb24,
        0,
        0,
    )?;

    let mut jpeg = Vec::with_capacity(max_size.min(width * height));
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100));
    let dims = u32::try_from(width).and_then(|w| u32::try_from(height).map(|h| (w, h)));
    let (w, h) = dims.map_err(|err| CaptureError::Encoding(err.to_string()))?;
    encoder
        .encode(&rgb, w, h, ExtendedColorType::Rgb8)
        .map_err(|err| CaptureError::Encoding(err.to_string()))?;

    if jpeg.len() > max_size {
        return Err(CaptureError::Encoding(format!(
            "compressed picture is {} bytes, budget is {max_size}",
            jpeg.len()
        )));
    }
    Ok(jpeg)
}
