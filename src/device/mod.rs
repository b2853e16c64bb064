//! Device capability utilities.
//!
//! Describes the compute device kernels are compiled for and checks whether
//! an operation can run on it.

mod info;
mod manager;

pub use info::{device_cc, DeviceBackend, DeviceError, DeviceInfo};
pub use manager::{DeviceConfig, DeviceManager};
