//! Camera parameters in typed form, plus the `key=value;key=value` form
//! clients exchange.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use tracing::debug;

use crate::error::{CaptureError, Result};
use crate::pipeline::PixelFormat;
use crate::surface::{SurfaceCatalog, SurfaceSize};

/// Formats accepted for preview and video frames.
pub const STREAM_FORMATS: [PixelFormat; 4] = [
    PixelFormat::Yuyv,
    PixelFormat::Yuv422Sp,
    PixelFormat::Yuv420Sp,
    PixelFormat::Yuv420P,
];

/// Parameter keys.
pub mod keys {
    /// Preview size, `WxH`.
    pub const PREVIEW_SIZE: &str = "preview-size";
    /// Supported preview sizes, comma separated.
    pub const PREVIEW_SIZE_VALUES: &str = "preview-size-values";
    /// Preview pixel format.
    pub const PREVIEW_FORMAT: &str = "preview-format";
    /// Supported preview pixel formats.
    pub const PREVIEW_FORMAT_VALUES: &str = "preview-format-values";
    /// Preview frame rate.
    pub const PREVIEW_FRAME_RATE: &str = "preview-frame-rate";
    /// Supported preview frame rates.
    pub const PREVIEW_FRAME_RATE_VALUES: &str = "preview-frame-rate-values";
    /// Still picture size.
    pub const PICTURE_SIZE: &str = "picture-size";
    /// Supported picture sizes.
    pub const PICTURE_SIZE_VALUES: &str = "picture-size-values";
    /// Still picture format.
    pub const PICTURE_FORMAT: &str = "picture-format";
    /// Supported picture formats.
    pub const PICTURE_FORMAT_VALUES: &str = "picture-format-values";
    /// Recording frame size.
    pub const VIDEO_SIZE: &str = "video-size";
    /// Recording pixel format.
    pub const VIDEO_FRAME_FORMAT: &str = "video-frame-format";
    /// JPEG quality, 1 to 100.
    pub const JPEG_QUALITY: &str = "jpeg-quality";
    /// Focus mode.
    pub const FOCUS_MODE: &str = "focus-mode";
    /// Supported focus modes.
    pub const FOCUS_MODE_VALUES: &str = "focus-mode-values";
    /// Focal length in millimetres.
    pub const FOCAL_LENGTH: &str = "focal-length";
    /// Horizontal field of view in degrees.
    pub const HORIZONTAL_VIEW_ANGLE: &str = "horizontal-view-angle";
    /// Vertical field of view in degrees.
    pub const VERTICAL_VIEW_ANGLE: &str = "vertical-view-angle";
}

const READ_ONLY: [(&str, &str); 5] = [
    (keys::FOCUS_MODE, "fixed"),
    (keys::FOCUS_MODE_VALUES, "fixed"),
    (keys::FOCAL_LENGTH, "4.31"),
    (keys::HORIZONTAL_VIEW_ANGLE, "54.8"),
    (keys::VERTICAL_VIEW_ANGLE, "42.5"),
];

/// The full parameter set of one camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraParameters {
    preview_size: SurfaceSize,
    preview_format: PixelFormat,
    preview_fps: u32,
    picture_size: SurfaceSize,
    video_size: SurfaceSize,
    video_format: PixelFormat,
    jpeg_quality: u8,
    supported_sizes: Vec<SurfaceSize>,
    supported_fps: Vec<u32>,
    extra: BTreeMap<String, String>,
}

impl Default for CameraParameters {
    /// Values used before any device was detected.
    fn default() -> Self {
        let qvga = SurfaceSize::new(320, 240);
        Self {
            preview_size: qvga,
            preview_format: PixelFormat::Yuv422Sp,
            preview_fps: 30,
            picture_size: qvga,
            video_size: qvga,
            video_format: PixelFormat::Yuv420P,
            jpeg_quality: 85,
            supported_sizes: vec![SurfaceSize::new(640, 480), qvga],
            supported_fps: vec![30],
            extra: READ_ONLY
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }
}

impl CameraParameters {
    /// Defaults derived from what a freshly opened device offers.
    #[must_use]
    pub fn from_catalog(catalog: &SurfaceCatalog) -> Self {
        let mut params = Self::default();
        let sizes: Vec<_> = catalog.available_sizes().into_iter().rev().collect();
        let fps: Vec<_> = catalog.available_fps().into_iter().rev().collect();
        if !sizes.is_empty() {
            params.supported_sizes = sizes;
        }
        if !fps.is_empty() {
            params.supported_fps = fps;
        }
        if let Some(best) = catalog.best_preview() {
            params.preview_size = best.size;
            params.preview_fps = best.fps;
            params.video_size = best.size;
        }
        if let Some(best) = catalog.best_picture() {
            params.picture_size = best.size;
        }
        params
    }

    /// Preview frame size.
    #[must_use]
    pub const fn preview_size(&self) -> SurfaceSize {
        self.preview_size
    }

    /// Preview pixel format.
    #[must_use]
    pub const fn preview_format(&self) -> PixelFormat {
        self.preview_format
    }

    /// Preview frame rate.
    #[must_use]
    pub const fn preview_fps(&self) -> u32 {
        self.preview_fps
    }

    /// Still picture size.
    #[must_use]
    pub const fn picture_size(&self) -> SurfaceSize {
        self.picture_size
    }

    /// Recording frame size.
    #[must_use]
    pub const fn video_size(&self) -> SurfaceSize {
        self.video_size
    }

    /// Recording pixel format.
    #[must_use]
    pub const fn video_format(&self) -> PixelFormat {
        self.video_format
    }

    /// JPEG quality.
    #[must_use]
    pub const fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
    }

    /// Sizes the device offers, largest first.
    #[must_use]
    pub fn supported_sizes(&self) -> &[SurfaceSize] {
        &self.supported_sizes
    }

    /// Frame rates the device offers, fastest first.
    #[must_use]
    pub fn supported_fps(&self) -> &[u32] {
        &self.supported_fps
    }

    /// Size raw frames are grabbed at.
    #[must_use]
    pub const fn raw_size(&self, recording: bool) -> SurfaceSize {
        if recording {
            self.video_size
        } else {
            self.preview_size
        }
    }

    fn check_size(&self, what: &str, size: SurfaceSize) -> Result<()> {
        if self.supported_sizes.contains(&size) {
            Ok(())
        } else {
            Err(CaptureError::InvalidParameter(format!(
                "{what} {size} is not supported"
            )))
        }
    }

    /// Change the preview size.
    pub fn set_preview_size(&mut self, size: SurfaceSize) -> Result<()> {
        self.check_size("preview size", size)?;
        self.preview_size = size;
        Ok(())
    }

    /// Change the picture size.
    pub fn set_picture_size(&mut self, size: SurfaceSize) -> Result<()> {
        self.check_size("picture size", size)?;
        self.picture_size = size;
        Ok(())
    }

    /// Change the recording size.
    pub fn set_video_size(&mut self, size: SurfaceSize) -> Result<()> {
        self.check_size("video size", size)?;
        self.video_size = size;
        Ok(())
    }

    /// Change the preview format.
    pub fn set_preview_format(&mut self, format: PixelFormat) -> Result<()> {
        if !STREAM_FORMATS.contains(&format) {
            return Err(CaptureError::InvalidParameter(format!(
                "preview format {format} is not supported"
            )));
        }
        self.preview_format = format;
        Ok(())
    }

    /// Change the recording format.
    pub fn set_video_format(&mut self, format: PixelFormat) -> Result<()> {
        if !STREAM_FORMATS.contains(&format) {
            return Err(CaptureError::InvalidParameter(format!(
                "video format {format} is not supported"
            )));
        }
        self.video_format = format;
        Ok(())
    }

    /// Change the preview frame rate.
    pub fn set_preview_fps(&mut self, fps: u32) -> Result<()> {
        if !self.supported_fps.contains(&fps) {
            return Err(CaptureError::InvalidParameter(format!(
                "preview frame rate {fps} is not supported"
            )));
        }
        self.preview_fps = fps;
        Ok(())
    }

    /// Change the JPEG quality.
    pub fn set_jpeg_quality(&mut self, quality: u8) -> Result<()> {
        if !(1..=100).contains(&quality) {
            return Err(CaptureError::InvalidParameter(format!(
                "jpeg quality {quality} is out of range"
            )));
        }
        self.jpeg_quality = quality;
        Ok(())
    }

    /// Store the size the driver actually granted for a stream.
    ///
    /// The driver may settle on a size outside the advertised list, so this
    /// bypasses validation.
    pub fn store_effective_size(&mut self, recording: bool, size: SurfaceSize) {
        if recording {
            self.video_size = size;
        } else {
            self.preview_size = size;
        }
    }

    /// Store the picture size the driver actually granted.
    pub fn store_effective_picture_size(&mut self, size: SurfaceSize) {
        self.picture_size = size;
    }

    /// Check every value against the supported lists.
    pub fn validate(&self) -> Result<()> {
        self.check_size("preview size", self.preview_size)?;
        self.check_size("picture size", self.picture_size)?;
        self.check_size("video size", self.video_size)?;
        if !STREAM_FORMATS.contains(&self.preview_format) {
            return Err(CaptureError::InvalidParameter(format!(
                "preview format {} is not supported",
                self.preview_format
            )));
        }
        if !STREAM_FORMATS.contains(&self.video_format) {
            return Err(CaptureError::InvalidParameter(format!(
                "video format {} is not supported",
                self.video_format
            )));
        }
        if !self.supported_fps.contains(&self.preview_fps) {
            return Err(CaptureError::InvalidParameter(format!(
                "preview frame rate {} is not supported",
                self.preview_fps
            )));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(CaptureError::InvalidParameter(format!(
                "jpeg quality {} is out of range",
                self.jpeg_quality
            )));
        }
        Ok(())
    }

    /// Whether moving to `other` changes what the preview worker produces.
    #[must_use]
    pub fn affects_preview(&self, other: &Self) -> bool {
        self.preview_size != other.preview_size
            || self.preview_format != other.preview_format
            || self.preview_fps != other.preview_fps
            || self.video_size != other.video_size
            || self.video_format != other.video_format
    }

    /// Render as `key=value;key=value`, keys sorted.
    #[must_use]
    pub fn flatten(&self) -> String {
        let mut map = self.extra.clone();
        let join_sizes = |sizes: &[SurfaceSize]| {
            sizes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        let sizes = join_sizes(&self.supported_sizes);
        let fps = self
            .supported_fps
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let formats = STREAM_FORMATS
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(",");

        for (key, value) in [
            (keys::PREVIEW_SIZE, self.preview_size.to_string()),
            (keys::PREVIEW_SIZE_VALUES, sizes.clone()),
            (keys::PREVIEW_FORMAT, self.preview_format.to_string()),
            (keys::PREVIEW_FORMAT_VALUES, formats),
            (keys::PREVIEW_FRAME_RATE, self.preview_fps.to_string()),
            (keys::PREVIEW_FRAME_RATE_VALUES, fps),
            (keys::PICTURE_SIZE, self.picture_size.to_string()),
            (keys::PICTURE_SIZE_VALUES, sizes),
            (keys::PICTURE_FORMAT, PixelFormat::Jpeg.to_string()),
            (keys::PICTURE_FORMAT_VALUES, PixelFormat::Jpeg.to_string()),
            (keys::VIDEO_SIZE, self.video_size.to_string()),
            (keys::VIDEO_FRAME_FORMAT, self.video_format.to_string()),
            (keys::JPEG_QUALITY, self.jpeg_quality.to_string()),
        ] {
            map.insert(key.to_owned(), value);
        }

        let mut out = String::new();
        for (key, value) in &map {
            if !out.is_empty() {
                out.push(';');
            }
            let _ = write!(out, "{key}={value}");
        }
        out
    }

    /// Parse a flattened parameter string, supported lists included.
    ///
    /// Keys that are absent keep their default. The result is not validated.
    pub fn unflatten(text: &str) -> Result<Self> {
        let mut params = Self::default();
        params.apply_flattened(text, true)?;
        Ok(params)
    }

    /// Apply a client's flattened string on top of these parameters.
    ///
    /// The supported lists are read-only and kept from `self`. The result is
    /// validated.
    pub fn merge_flattened(&self, text: &str) -> Result<Self> {
        let mut params = self.clone();
        params.apply_flattened(text, false)?;
        params.validate()?;
        Ok(params)
    }

    fn apply_flattened(&mut self, text: &str, with_lists: bool) -> Result<()> {
        for pair in text.split(';').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                CaptureError::InvalidParameter(format!("'{pair}' is not key=value"))
            })?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                keys::PREVIEW_SIZE => self.preview_size = value.parse()?,
                keys::PREVIEW_FORMAT => self.preview_format = value.parse()?,
                keys::PREVIEW_FRAME_RATE => self.preview_fps = parse_number(key, value)?,
                keys::PICTURE_SIZE => self.picture_size = value.parse()?,
                keys::PICTURE_FORMAT => {
                    if value.parse::<PixelFormat>()? != PixelFormat::Jpeg {
                        return Err(CaptureError::InvalidParameter(format!(
                            "picture format {value} is not supported"
                        )));
                    }
                }
                keys::VIDEO_SIZE => self.video_size = value.parse()?,
                keys::VIDEO_FRAME_FORMAT => self.video_format = value.parse()?,
                keys::JPEG_QUALITY => self.jpeg_quality = parse_number(key, value)?,
                keys::PREVIEW_SIZE_VALUES | keys::PICTURE_SIZE_VALUES => {
                    if with_lists {
                        self.supported_sizes = value
                            .split(',')
                            .map(str::parse)
                            .collect::<Result<Vec<_>>>()?;
                    }
                }
                keys::PREVIEW_FRAME_RATE_VALUES => {
                    if with_lists {
                        self.supported_fps = value
                            .split(',')
                            .map(|v| parse_number(key, v.trim()))
                            .collect::<Result<Vec<_>>>()?;
                    }
                }
                keys::PREVIEW_FORMAT_VALUES | keys::PICTURE_FORMAT_VALUES => {}
                _ => {
                    if READ_ONLY.iter().any(|(k, _)| *k == key) && !with_lists {
                        continue;
                    }
                    debug!(key, value, "keeping unrecognized parameter");
                    self.extra.insert(key.to_owned(), value.to_owned());
                }
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CaptureError::InvalidParameter(format!("{key}: '{value}' is not a number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::SurfaceDesc;
    use crate::traits::FourCC;

    #[test]
    fn test_defaults() {
        let params = CameraParameters::default();
        assert_eq!(params.preview_size(), SurfaceSize::new(320, 240));
        assert_eq!(params.preview_fps(), 30);
        assert_eq!(params.preview_format(), PixelFormat::Yuv422Sp);
        assert_eq!(params.video_format(), PixelFormat::Yuv420P);
        assert_eq!(params.jpeg_quality(), 85);
        params.validate().expect("defaults should validate");
    }

    #[test]
    fn test_from_catalog_seeds_best_modes() {
        let mut catalog = SurfaceCatalog::new(None);
        for (w, h, fps) in [(640, 480, 30), (1280, 720, 15), (2592, 1944, 5)] {
            catalog.insert(SurfaceDesc::new(FourCC::YUYV, w, h, fps));
        }
        let params = CameraParameters::from_catalog(&catalog);
        assert_eq!(params.preview_size(), SurfaceSize::new(640, 480));
        assert_eq!(params.video_size(), SurfaceSize::new(640, 480));
        assert_eq!(params.picture_size(), SurfaceSize::new(2592, 1944));
        assert_eq!(params.supported_sizes().first(), Some(&SurfaceSize::new(2592, 1944)));
        assert_eq!(params.supported_fps(), &[30, 15, 5]);
        params.validate().expect("seeded params should validate");
    }

    #[test]
    fn test_flatten_unflatten() {
        let mut params = CameraParameters::default();
        params
            .set_preview_size(SurfaceSize::new(640, 480))
            .expect("supported size");
        params.set_jpeg_quality(70).expect("valid quality");
        let text = params.flatten();
        assert!(text.contains("preview-size=640x480"));
        assert!(text.contains("picture-format=jpeg"));
        assert!(text.contains("focus-mode=fixed"));
        let parsed = CameraParameters::unflatten(&text).expect("flattened text should parse");
        assert_eq!(parsed, params);
    }

    #[test]
    fn test_merge_rejects_unsupported_values() {
        let params = CameraParameters::default();
        assert!(params.merge_flattened("preview-size=1024x768").is_err());
        assert!(params.merge_flattened("preview-format=rgb565").is_err());
        assert!(params.merge_flattened("picture-format=yuv420sp").is_err());
        assert!(params.merge_flattened("jpeg-quality=0").is_err());
        assert!(params.merge_flattened("preview-frame-rate=abc").is_err());
        assert!(params.merge_flattened("garbage").is_err());
    }

    #[test]
    fn test_merge_keeps_supported_lists_and_extra_keys() {
        let params = CameraParameters::default();
        let merged = params
            .merge_flattened("preview-size=640x480;preview-size-values=9999x9999;whitebalance=auto")
            .expect("merge should succeed");
        assert_eq!(merged.preview_size(), SurfaceSize::new(640, 480));
        assert_eq!(merged.supported_sizes(), params.supported_sizes());
        assert!(merged.flatten().contains("whitebalance=auto"));
    }

    #[test]
    fn test_affects_preview() {
        let params = CameraParameters::default();
        let mut other = params.clone();
        other.set_picture_size(SurfaceSize::new(640, 480)).expect("supported size");
        assert!(!params.affects_preview(&other));
        other.set_preview_format(PixelFormat::Yuyv).expect("supported format");
        assert!(params.affects_preview(&other));
    }
}
