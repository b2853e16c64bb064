//! Crate-level error type.

use thiserror::Error;

use crate::arguments::ArgumentError;
use crate::compiler::CompileError;
use crate::config::ConfigError;
use crate::device::DeviceError;
use crate::memory::MemoryError;
use crate::operation::LaunchError;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Argument(#[from] ArgumentError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Tensor element type mismatch: tensor holds {actual}, requested {requested}")]
    DTypeMismatch {
        actual: crate::library::DataType,
        requested: crate::library::DataType,
    },
}

pub type Result<T> = std::result::Result<T, BackendError>;
