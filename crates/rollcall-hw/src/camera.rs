//! V4L2 camera capture via the `v4l` crate.

use std::path::Path;
use std::time::Instant;

use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

use crate::frame::{self, Frame};

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Conversion(#[from] frame::FrameError),
}

/// Anything that yields RGB frames one at a time.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;

    /// Human-readable name for logs.
    fn describe(&self) -> String;
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Motion JPEG, one compressed image per buffer.
    Mjpeg,
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" => Some(Self::Mjpeg),
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }
}

/// Resolve a configured video source. A bare index such as `"0"` names
/// `/dev/video0`; anything else is used as a device path.
pub fn resolve_source(source: &str) -> String {
    let trimmed = source.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        format!("/dev/video{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// V4L2 camera with a streaming mmap queue held open for its lifetime.
pub struct Camera {
    stream: MmapStream<'static>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera by path or index and start streaming.
    ///
    /// Formats are tried in order: MJPG, YUYV, GREY.
    pub fn open(source: &str) -> Result<Self, CameraError> {
        let device_path = resolve_source(source);
        if !Path::new(&device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path));
        }

        let device = Device::with_path(&device_path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        tracing::info!(
            device = %device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        let cap_flags = caps.capabilities;
        if !cap_flags.contains(v4l::capability::Flags::VIDEO_CAPTURE)
            || !cap_flags.contains(v4l::capability::Flags::STREAMING)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        let (negotiated, pixel_format) = negotiate(&device)?;
        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = %negotiated.fourcc,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        Ok(Self {
            stream,
            width: negotiated.width,
            height: negotiated.height,
            device_path,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    fn buf_to_rgb(&self, buf: &[u8]) -> Result<image::RgbImage, CameraError> {
        let image = match self.pixel_format {
            PixelFormat::Mjpeg => frame::mjpeg_to_rgb(buf)?,
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)?,
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height)?,
        };
        Ok(image)
    }
}

fn negotiate(device: &Device) -> Result<(v4l::Format, PixelFormat), CameraError> {
    let mut last_err = None;
    for fourcc in [b"MJPG", b"YUYV", b"GREY"] {
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(fourcc);
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        match device.set_format(&fmt) {
            Ok(negotiated) => {
                // Drivers substitute their own format when the request is unsupported.
                if let Some(pf) = PixelFormat::from_fourcc(negotiated.fourcc) {
                    return Ok((negotiated, pf));
                }
                tracing::debug!(requested = %fmt.fourcc, got = %negotiated.fourcc, "format not accepted");
            }
            Err(e) => {
                tracing::debug!(requested = %fmt.fourcc, error = %e, "set_format failed");
                last_err = Some(e.to_string());
            }
        }
    }
    Err(CameraError::FormatNegotiationFailed(
        last_err.unwrap_or_else(|| "no supported pixel format (need MJPG, YUYV or GREY)".into()),
    ))
}

impl FrameSource for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;
        // MJPG buffers are padded; the payload length is in `bytesused`.
        let used = (meta.bytesused as usize).min(buf.len());
        let payload = if used > 0 { &buf[..used] } else { buf };
        let payload = payload.to_vec();

        let image = self.buf_to_rgb(&payload)?;
        Ok(Frame {
            image,
            timestamp: Instant::now(),
            sequence,
        })
    }

    fn describe(&self) -> String {
        format!("{} ({:?} {}x{})", self.device_path, self.pixel_format, self.width, self.height)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "camera released");
    }
}
