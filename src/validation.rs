//! Frame validation utilities for test pattern verification.
//!
//! Checks that captured YUYV frames carry the pattern a virtual camera was
//! told to produce. Used by the integration tests against `vivid` and by the
//! mock-driven unit tests.

use crate::convert::YuyvView;
use crate::error::{CaptureError, Result};
use crate::traits::FrameMetadata;

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235), // White
    (235, 235, 11),  // Yellow
    (12, 236, 237),  // Cyan
    (13, 237, 13),   // Green
    (237, 13, 237),  // Magenta
    (238, 14, 13),   // Red
    (15, 15, 239),   // Blue
    (16, 16, 16),    // Black
];

/// Tolerance for RGB color matching (accounts for YUV->RGB conversion errors).
const COLOR_TOLERANCE: u32 = 15;

/// Minimum luminance rise across a gradient frame.
const GRADIENT_MIN_CHANGE: f32 = 50.0;

fn invalid(message: String) -> CaptureError {
    CaptureError::PatternMismatch(message)
}

/// Validates that a frame contains the SMPTE color bar pattern.
///
/// Samples the centre of each of the 8 vertical bars on the middle row.
///
/// # Errors
///
/// Returns [`CaptureError::PatternMismatch`] if any bar is off by more than the
/// tolerance on any channel, or if the frame is too small to hold 8 bars.
pub fn validate_color_bars(frame: &YuyvView<'_>) -> Result<()> {
    let bar_width = frame.width() / 8;
    let center_y = frame.height() / 2;

    for (bar_idx, expected_rgb) in SMPTE_COLOR_BARS.iter().enumerate() {
        let sample_x = bar_idx * bar_width + bar_width / 2;
        let actual_rgb = frame.pixel_at(sample_x, center_y).ok_or_else(|| {
            invalid(format!("Failed to get pixel at ({sample_x}, {center_y})"))
        })?;

        if !colors_match(actual_rgb, *expected_rgb, COLOR_TOLERANCE) {
            return Err(invalid(format!(
                "Color bar {bar_idx} mismatch at ({sample_x}, {center_y}): \
                 expected RGB{expected_rgb:?}, got RGB{actual_rgb:?}"
            )));
        }
    }

    Ok(())
}

/// Validates that a frame contains a left-to-right luminance gradient.
///
/// The middle row must brighten monotonically (small dips from rounding are
/// allowed) and rise by at least 50 overall.
pub fn validate_gradient(frame: &YuyvView<'_>) -> Result<()> {
    let center_y = frame.height() / 2;
    let mut first: Option<f32> = None;
    let mut prev: Option<f32> = None;

    for x in (0..frame.width()).step_by(10) {
        let (r, g, b) = frame
            .pixel_at(x, center_y)
            .ok_or_else(|| invalid(format!("Failed to get pixel at ({x}, {center_y})")))?;

        // Rec. 601 luma
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        if let Some(prev) = prev {
            if luminance < prev - 1.0 {
                return Err(invalid(format!(
                    "Gradient not monotonically increasing at x={x}: \
                     luminance {luminance} < previous {prev}"
                )));
            }
        }
        first.get_or_insert(luminance);
        prev = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first, prev) {
        let change = last - first;
        if change < GRADIENT_MIN_CHANGE {
            return Err(invalid(format!(
                "Insufficient luminance change for gradient: {change} \
                 (expected at least {GRADIENT_MIN_CHANGE})"
            )));
        }
    }

    Ok(())
}

/// Validates that frame sequence numbers increment by 1 with no gaps.
pub fn validate_frame_sequence(frames: &[FrameMetadata]) -> Result<()> {
    if frames.is_empty() {
        return Err(invalid("Cannot validate empty frame sequence".to_owned()));
    }

    for (i, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let expected = prev.sequence.wrapping_add(1);
            if curr.sequence != expected {
                return Err(invalid(format!(
                    "Frame sequence gap at index {}: expected {expected}, got {}",
                    i + 1,
                    curr.sequence
                )));
            }
        }
    }

    Ok(())
}

/// Whether all three channels are within `tolerance` of each other.
fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u32) -> bool {
    let (ar, ag, ab) = actual;
    let (er, eg, eb) = expected;

    u32::from(ar.abs_diff(er)) <= tolerance
        && u32::from(ag.abs_diff(eg)) <= tolerance
        && u32::from(ab.abs_diff(eb)) <= tolerance
}
