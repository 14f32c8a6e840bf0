pub mod camera_module;
pub mod stub;
pub mod usb_webcam;

pub use camera_module::{CameraModuleBackend, CameraModuleParams};
pub use stub::{StubBackend, StubBehavior};
pub use usb_webcam::{UsbWebcamBackend, UsbWebcamParams};
