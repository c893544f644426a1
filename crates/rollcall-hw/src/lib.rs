//! rollcall-hw: V4L2 camera capture into RGB frames.

pub mod camera;
pub mod frame;

pub use camera::{resolve_source, Camera, CameraError, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
