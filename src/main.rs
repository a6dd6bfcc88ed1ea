//! uvc-cam-capture binary: preview a camera for a while, then take a picture.
//!
//! Usage: `uvc-cam-capture [CONFIG] [CAMERA_ID] [SECONDS] [OUTPUT.jpg]`
//!
//! `CONFIG` defaults to `$UVC_CAMERA_CONFIG`, then to `/etc/camera.cfg`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use uvc_cam_capture::registry::DEFAULT_CONFIG_PATH;
use uvc_cam_capture::{
    CameraCallbacks, CameraRegistry, CaptureError, MessageMask, Notification, SharedFrame,
    V4l2Provider,
};

struct Options {
    config: PathBuf,
    camera: usize,
    preview: Duration,
    output: PathBuf,
}

impl Options {
    fn from_args() -> uvc_cam_capture::Result<Self> {
        let mut args = std::env::args().skip(1);
        let config = args
            .next()
            .or_else(|| std::env::var("UVC_CAMERA_CONFIG").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());
        let camera = parse_arg(args.next(), "camera id", 0)?;
        let seconds = parse_arg(args.next(), "seconds", 5)?;
        let output = args.next().unwrap_or_else(|| "capture.jpg".to_owned());
        Ok(Self {
            config: PathBuf::from(config),
            camera,
            preview: Duration::from_secs(seconds),
            output: PathBuf::from(output),
        })
    }
}

fn parse_arg<T: std::str::FromStr>(arg: Option<String>, what: &str, default: T) -> uvc_cam_capture::Result<T> {
    arg.map_or(Ok(default), |text| {
        text.parse()
            .map_err(|_| CaptureError::Config(format!("bad {what}: {text}")))
    })
}

/// Logs preview progress and hands the compressed picture to `main`.
struct Sink {
    previews: AtomicU64,
    picture: Mutex<Option<mpsc::Sender<SharedFrame>>>,
}

impl CameraCallbacks for Sink {
    fn notify(&self, event: Notification) {
        match event {
            Notification::Error(message) => error!(%message, "camera error"),
            other => info!(?other, "camera event"),
        }
    }

    fn preview_frame(&self, frame: SharedFrame) {
        let count = self.previews.fetch_add(1, Ordering::Relaxed) + 1;
        if count % 30 == 0 {
            info!(count, bytes = frame.len(), "preview frames");
        }
    }

    fn compressed_picture(&self, frame: SharedFrame) {
        let sender = self
            .picture
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            if sender.send(frame).is_err() {
                warn!("picture arrived after shutdown");
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("uvc_cam_capture=info")),
        )
        .init();

    if let Err(err) = run() {
        error!(%err, "capture failed");
        std::process::exit(1);
    }
}

fn run() -> uvc_cam_capture::Result<()> {
    let options = Options::from_args()?;
    let registry = CameraRegistry::from_config_file(V4l2Provider, &options.config);
    info!(cameras = registry.len(), "camera registry ready");

    let info = registry.camera_info(options.camera)?;
    info!(
        id = options.camera,
        facing = ?info.facing,
        orientation = info.orientation.degrees(),
        "opening camera"
    );
    let mut camera = registry.open(options.camera)?;
    if !camera.await_ready_timeout(Duration::from_secs(10)) {
        camera.release();
        return Err(CaptureError::DeviceNotFound);
    }
    info!(parameters = %camera.parameters_str(), "camera ready");

    let (sender, pictures) = mpsc::channel();
    camera.set_callbacks(Arc::new(Sink {
        previews: AtomicU64::new(0),
        picture: Mutex::new(Some(sender)),
    }));
    camera.enable_messages(
        MessageMask::ERROR
            | MessageMask::SHUTTER
            | MessageMask::PREVIEW_FRAME
            | MessageMask::COMPRESSED_IMAGE,
    )?;

    camera.start_preview()?;
    std::thread::sleep(options.preview);
    camera.take_picture()?;
    let picture = pictures
        .recv_timeout(Duration::from_secs(10))
        .map_err(|_| CaptureError::TimedOut)?;
    std::fs::write(&options.output, &*picture)?;
    info!(path = %options.output.display(), bytes = picture.len(), "picture saved");

    camera.release();
    Ok(())
}
