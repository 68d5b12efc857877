//! rollcall-hw — Hardware abstraction for camera capture.
//!
//! Provides V4L2-based capture sessions producing RGBA frames. A
//! [`CaptureSession`] owns the device handle exclusively; dropping it
//! releases the hardware, so holders get guaranteed release on every
//! exit path.

pub mod camera;
pub mod frame;

pub use camera::{CameraError, CaptureSession, DeviceInfo, PixelFormat};
pub use frame::Frame;
