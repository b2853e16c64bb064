//! Kernel operation descriptors.
//!
//! An operation names one kernel configuration, emits the template
//! instantiation that defines it, and knows how to pack its arguments and
//! size its launch grid.

pub mod conv2d;
pub mod gemm;
pub mod reduction;

use parking_lot::Mutex;
use thiserror::Error;

use crate::arguments::ArgumentError;
use crate::c_types::Dim3;
use crate::compiler::KernelHandle;
use crate::device::DeviceInfo;

pub use conv2d::{Conv2dArguments, Conv2dOperation, ConvKind, IteratorAlgorithm, SplitKMode, StrideSupport};
pub use gemm::{GemmArguments, GemmKind, GemmOperation, GroupedGemmArguments};
pub use reduction::{ReductionArguments, ReductionOperation, ThreadShape};

/// Largest thread block the launcher accepts.
pub const MAX_THREADS_PER_BLOCK: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Gemm,
    Conv2d,
    Reduction,
}

impl OperationKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Gemm => "gemm",
            Self::Conv2d => "conv2d",
            Self::Reduction => "reduction",
        }
    }
}

/// A compilable kernel configuration.
pub trait Operation: Send + Sync {
    fn kind(&self) -> OperationKind;

    /// Target architecture the kernel is instantiated for.
    fn arch(&self) -> u32;

    /// Unique, deterministic name of this configuration.
    fn procedural_name(&self) -> String;

    /// Exported symbol of the kernel entry point.
    fn kernel_name(&self) -> String {
        format!("{}_kernel", self.procedural_name())
    }

    /// Template instantiation source for this configuration.
    fn emit(&self) -> String;

    /// Dynamic shared memory the kernel needs per block.
    fn shared_memory_bytes(&self) -> u32;
}

/// Argument packing and grid sizing for an operation taking `A`.
pub trait Launchable<A> {
    fn pack_arguments(&self, args: &A) -> Result<Vec<u8>, ArgumentError>;
    fn launch_config(&self, args: &A, device: &DeviceInfo) -> Result<LaunchConfig, ArgumentError>;
}

/// Grid, block and shared memory of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_memory_bytes: u32,
}

impl LaunchConfig {
    pub fn total_threads(&self) -> u64 {
        self.grid.volume() * self.block.volume()
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Kernel not loaded: {0}")]
    KernelNotLoaded(String),

    #[error("Invalid launch configuration: {0}")]
    InvalidLaunch(String),

    #[error("Device launch failed: {0}")]
    Device(String),
}

/// Runs compiled kernels.
pub trait KernelExecutor: Send + Sync {
    fn launch(
        &self,
        kernel: &KernelHandle,
        launch: &LaunchConfig,
        params: &[u8],
    ) -> Result<(), LaunchError>;
}

/// One launch seen by a `RecordingExecutor`.
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub kernel_name: String,
    pub launch: LaunchConfig,
    pub params: Vec<u8>,
}

/// Executor that validates and records launches without running them.
///
/// Used by the CPU fallback device and in tests.
#[derive(Default)]
pub struct RecordingExecutor {
    launches: Mutex<Vec<LaunchRecord>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches.lock().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }
}

impl KernelExecutor for RecordingExecutor {
    fn launch(
        &self,
        kernel: &KernelHandle,
        launch: &LaunchConfig,
        params: &[u8],
    ) -> Result<(), LaunchError> {
        if !kernel.artifact().has_kernel(kernel.name()) {
            return Err(LaunchError::KernelNotLoaded(kernel.name().to_string()));
        }
        if launch.grid.volume() == 0 {
            return Err(LaunchError::InvalidLaunch("empty grid".into()));
        }
        let threads = launch.block.volume();
        if threads == 0 || threads > MAX_THREADS_PER_BLOCK {
            return Err(LaunchError::InvalidLaunch(format!(
                "{} threads per block (max {})",
                threads, MAX_THREADS_PER_BLOCK
            )));
        }
        self.launches.lock().push(LaunchRecord {
            kernel_name: kernel.name().to_string(),
            launch: *launch,
            params: params.to_vec(),
        });
        Ok(())
    }
}

pub(crate) fn ceil_div(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

/// Grid for a tiled `m x n` output using an identity swizzle of `log_tile`.
pub(crate) fn swizzled_grid(tiles_m: i64, tiles_n: i64, log_tile: u32, z: i64) -> Dim3 {
    let tile = 1i64 << log_tile;
    Dim3::new(
        (tiles_m * tile) as u32,
        ceil_div(tiles_n, tile) as u32,
        z as u32,
    )
}
