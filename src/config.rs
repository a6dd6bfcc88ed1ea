//! Camera configuration input.
//!
//! The configuration is a line-oriented text file. Each non-blank line that
//! does not start with `#` is a keyword followed by its arguments:
//!
//! ```text
//! # force a node, tried before anything enumerated
//! device /dev/video2
//! # never touch this node
//! nodevice /dev/video0
//! resolution 1280x720
//! role front
//! orientation 90
//! # shorthand: facing, forced device and orientation in one line
//! back /dev/video3 180
//! ```
//!
//! Unrecognized lines are logged and skipped.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{CaptureError, Result};
use crate::surface::SurfaceSize;

/// Which way the camera points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Facing {
    /// Facing the user.
    Front,
    /// Facing away from the user.
    Back,
    /// Anything else, typically a USB camera.
    #[default]
    External,
}

/// Sensor mounting rotation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    /// No rotation.
    #[default]
    Deg0,
    /// 90 degrees.
    Deg90,
    /// 180 degrees.
    Deg180,
    /// 270 degrees.
    Deg270,
}

impl Orientation {
    /// Map a degree value; anything other than 0/90/180/270 becomes 0.
    #[must_use]
    pub const fn from_degrees(degrees: i64) -> Self {
        match degrees {
            90 => Self::Deg90,
            180 => Self::Deg180,
            270 => Self::Deg270,
            _ => Self::Deg0,
        }
    }

    /// Rotation in degrees.
    #[must_use]
    pub const fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }
}

/// Device selection and presentation details for one camera.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraSpec {
    /// Nodes to try first, in order.
    pub devices: Vec<PathBuf>,
    /// Nodes never to open.
    pub nodevices: Vec<PathBuf>,
    /// Size to favour for the default preview.
    pub preferred_size: Option<SurfaceSize>,
    /// Facing role.
    pub facing: Facing,
    /// Mounting orientation.
    pub orientation: Orientation,
}

impl CameraSpec {
    /// Spec that forces a single node.
    #[must_use]
    pub fn with_device<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            devices: vec![path.into()],
            ..Self::default()
        }
    }

    /// Whether `path` is on the exclusion list.
    #[must_use]
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.nodevices.iter().any(|p| p == path)
    }

    /// Read and parse a configuration file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        Ok(Self::parse(&read_config(path)?))
    }

    /// Read a file describing several cameras. See [`CameraSpec::parse_all`].
    pub fn load_all_from_file(path: &Path) -> Result<Vec<Self>> {
        Ok(Self::parse_all(&read_config(path)?))
    }

    /// Parse configuration text. Never fails; bad lines are skipped.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut spec = Self::default();
        for line in text.lines() {
            spec.apply_line(line);
        }
        spec
    }

    /// Parse text that lists several cameras.
    ///
    /// Every `front`/`back` shorthand line starts a new camera; other lines
    /// refine the camera started last.
    #[must_use]
    pub fn parse_all(text: &str) -> Vec<Self> {
        let mut specs: Vec<Self> = Vec::new();
        for line in text.lines() {
            let starts_camera = matches!(
                line.split_whitespace().next(),
                Some("front" | "back")
            );
            match specs.last_mut() {
                Some(spec) if !starts_camera => {
                    spec.apply_line(line);
                }
                _ => {
                    let mut spec = Self::default();
                    if spec.apply_line(line) {
                        specs.push(spec);
                    }
                }
            }
        }
        specs
    }

    /// Apply one line. Returns whether it carried a setting.
    fn apply_line(&mut self, line: &str) -> bool {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => return false,
            [first, ..] if first.starts_with('#') => return false,
            ["device", path] => self.devices.push(PathBuf::from(path)),
            ["nodevice", path] => self.nodevices.push(PathBuf::from(path)),
            ["resolution", size] => match size.parse() {
                Ok(size) => self.preferred_size = Some(size),
                Err(err) => {
                    warn!(line, %err, "ignoring bad resolution");
                    return false;
                }
            },
            ["role", "front"] => self.facing = Facing::Front,
            ["role", "back"] => self.facing = Facing::Back,
            ["role", _] => self.facing = Facing::External,
            ["orientation", degrees] => {
                self.orientation = Orientation::from_degrees(degrees.parse().unwrap_or(0));
            }
            [role @ ("front" | "back"), path, rest @ ..] if rest.len() <= 1 => {
                self.facing = if *role == "front" {
                    Facing::Front
                } else {
                    Facing::Back
                };
                self.devices.push(PathBuf::from(path));
                let degrees = rest.first().and_then(|d| d.parse().ok()).unwrap_or(0);
                self.orientation = Orientation::from_degrees(degrees);
            }
            _ => {
                debug!(line, "unrecognized config line");
                return false;
            }
        }
        true
    }
}

fn read_config(path: &Path) -> Result<String> {
    debug!(path = %path.display(), "loading camera configuration");
    let text = std::fs::read_to_string(path)
        .map_err(|err| CaptureError::Config(format!("{}: {err}", path.display())))?;
    if text.trim().is_empty() {
        return Err(CaptureError::Config(format!(
            "{}: configuration is empty",
            path.display()
        )));
    }
    Ok(text)
}
