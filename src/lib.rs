//! UVC-Cam-Capture: a USB camera capture engine over V4L2
//!
//! The crate finds a camera node, negotiates a YUYV mode, and runs preview,
//! recording and still capture on worker threads. Frames are converted into
//! the client's formats and delivered through callbacks and a preview window.
//! Device access sits behind the traits in [`traits`], so everything above the
//! driver also runs against a mock device in tests.

pub mod camera;
pub mod config;
pub mod convert;
pub mod device;
pub mod engine;
pub mod error;
pub mod params;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod surface;
pub mod traits;
pub mod validation;
pub mod worker;

#[cfg(test)]
pub mod mock;

pub use camera::{Camera, CameraCallbacks, CameraInfo, MessageMask, Notification, PreviewWindow};
pub use config::{CameraSpec, Facing, Orientation};
pub use device::{V4L2Device, V4l2Provider};
pub use engine::{CaptureEngine, EngineState, NegotiatedFormat};
pub use error::{CaptureError, Result};
pub use params::CameraParameters;
pub use pipeline::{PixelFormat, WindowBuffer};
pub use pool::SharedFrame;
pub use registry::CameraRegistry;
pub use surface::{SurfaceCatalog, SurfaceDesc, SurfaceSize};
pub use traits::{
    CameraDevice, CaptureStream, DeviceCapabilities, DeviceProvider, Format, FourCC, FrameMetadata,
};
