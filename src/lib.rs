//! Kernel Forge
//!
//! Glue layer of a GPU kernel code-generation backend. Operation descriptors
//! emit template instantiations, the artifact manager compiles and caches
//! them, and the pool memory manager owns device buffers across launches.
//!
//! # Components
//!
//! - **compiler**: artifact keys, memory and disk caches, external compilers
//! - **memory**: device allocator abstraction and the pool memory manager
//! - **operation**: GEMM, conv2d and split-K reduction descriptors
//! - **device**: device description and capability checks
//! - **frontend**: typed host tensors uploaded to pooled memory
//!
//! Nothing is created at load time. A [`Backend`] is constructed explicitly
//! and torn down with [`Backend::shutdown`].

pub mod arguments;
pub mod c_types;
pub mod cli;
pub mod compiler;
pub mod config;
pub mod device;
pub mod epilogue;
pub mod error;
pub mod frontend;
pub mod library;
pub mod memory;
pub mod operation;
pub mod telemetry;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use compiler::{ArtifactManager, ArtifactManagerConfig, KernelCompiler, KernelHandle};
use device::{DeviceConfig, DeviceError, DeviceInfo, DeviceManager};
use memory::{DeviceAllocator, HostDeviceAllocator, PoolConfig, PoolMemoryManager, PoolStats};
use operation::{
    Conv2dArguments, Conv2dOperation, KernelExecutor, LaunchConfig, Launchable, Operation, SplitKMode,
};

pub use error::{BackendError, Result};
pub use frontend::{DeviceTensor, HostElement};

/// Configuration of a [`Backend`].
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub device: DeviceConfig,
    pub pool: PoolConfig,
    pub artifacts: ArtifactManagerConfig,
}

/// What [`Backend::shutdown`] found and released.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Device buffers still alive at shutdown.
    pub live_allocations: usize,
    /// Bytes of idle segments returned to the device.
    pub released_bytes: usize,
    /// Artifacts dropped from the memory cache.
    pub artifacts_dropped: usize,
    pub pool: PoolStats,
}

/// One backend instance: active device, memory pool and artifact manager.
pub struct Backend {
    devices: DeviceManager,
    pool: PoolMemoryManager,
    artifacts: Arc<ArtifactManager>,
}

impl Backend {
    /// Build a backend on the host-backed allocator, sized to the device's
    /// memory.
    pub fn new(config: BackendConfig, compiler: Arc<dyn KernelCompiler>) -> Result<Self> {
        let devices = DeviceManager::new(config.device.clone())?;
        let active = devices.active_device();
        let memory = match active.total_memory {
            0 => config.device.total_memory,
            bytes => bytes,
        };
        let capacity = usize::try_from(memory).unwrap_or(usize::MAX);
        let allocator = Arc::new(HostDeviceAllocator::new(capacity, active.index));
        Self::assemble(devices, config, compiler, allocator)
    }

    /// Build a backend on a caller-supplied allocator.
    pub fn with_allocator(
        config: BackendConfig,
        compiler: Arc<dyn KernelCompiler>,
        allocator: Arc<dyn DeviceAllocator>,
    ) -> Result<Self> {
        let devices = DeviceManager::new(config.device.clone())?;
        Self::assemble(devices, config, compiler, allocator)
    }

    fn assemble(
        devices: DeviceManager,
        config: BackendConfig,
        compiler: Arc<dyn KernelCompiler>,
        allocator: Arc<dyn DeviceAllocator>,
    ) -> Result<Self> {
        let pool = PoolMemoryManager::new(allocator, config.pool)?;
        let artifacts = Arc::new(ArtifactManager::new(config.artifacts, compiler)?);
        info!(
            device = %devices.active_device().name,
            compiler = artifacts.compiler_name(),
            pool_reserved = pool.stats().reserved_bytes,
            "backend ready"
        );
        Ok(Self {
            devices,
            pool,
            artifacts,
        })
    }

    pub fn device(&self) -> &DeviceInfo {
        self.devices.active_device()
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    pub fn memory_pool(&self) -> &PoolMemoryManager {
        &self.pool
    }

    pub fn artifacts(&self) -> &Arc<ArtifactManager> {
        &self.artifacts
    }

    /// Check `ops` against the device, then compile them into one module.
    /// Returns one handle per operation, in order.
    pub fn prepare(&self, ops: &[&dyn Operation]) -> Result<Vec<KernelHandle>> {
        for op in ops {
            self.device().check_operation(*op)?;
        }
        let artifact = self.artifacts.compile(ops)?;
        Ok(ops
            .iter()
            .map(|op| KernelHandle::new(Arc::clone(&artifact), op.kernel_name()))
            .collect())
    }

    /// Async form of [`prepare`](Self::prepare); compilation runs on the
    /// blocking pool.
    pub async fn prepare_async(&self, ops: Vec<Arc<dyn Operation>>) -> Result<Vec<KernelHandle>> {
        for op in &ops {
            self.device().check_operation(op.as_ref())?;
        }
        let names: Vec<String> = ops.iter().map(|op| op.kernel_name()).collect();
        let artifact = self.artifacts.compile_async(ops).await?;
        Ok(names
            .into_iter()
            .map(|name| KernelHandle::new(Arc::clone(&artifact), name))
            .collect())
    }

    fn kernel_for(&self, op: &dyn Operation) -> Result<KernelHandle> {
        self.device().check_operation(op)?;
        if let Some(handle) = self.artifacts.kernel_for(op) {
            return Ok(handle);
        }
        let artifact = self.artifacts.compile(&[op])?;
        Ok(KernelHandle::new(artifact, op.kernel_name()))
    }

    /// Launch a prepared kernel.
    pub fn launch(
        &self,
        executor: &dyn KernelExecutor,
        kernel: &KernelHandle,
        launch: &LaunchConfig,
        params: &[u8],
    ) -> Result<()> {
        let device = self.device();
        if launch.shared_memory_bytes > device.max_shared_memory_per_block {
            return Err(DeviceError::SharedMemoryExceeded {
                required: launch.shared_memory_bytes,
                available: device.max_shared_memory_per_block,
            }
            .into());
        }
        debug!(
            kernel = kernel.name(),
            grid = ?launch.grid,
            block = ?launch.block,
            params = params.len(),
            "launch"
        );
        executor.launch(kernel, launch, params)?;
        Ok(())
    }

    /// Compile if needed, pack `args` and launch `op`.
    pub fn run<O, A>(&self, op: &O, args: &A, executor: &dyn KernelExecutor) -> Result<LaunchConfig>
    where
        O: Operation + Launchable<A>,
    {
        let kernel = self.kernel_for(op)?;
        let params = op.pack_arguments(args)?;
        let launch = op.launch_config(args, self.device())?;
        self.launch(executor, &kernel, &launch, &params)?;
        Ok(launch)
    }

    /// Run a convolution. Parallel split-K runs the partial-accumulation
    /// kernel into the workspace followed by the split-K reduction.
    pub fn run_conv2d(
        &self,
        op: &Conv2dOperation,
        args: &Conv2dArguments,
        executor: &dyn KernelExecutor,
    ) -> Result<Vec<LaunchConfig>> {
        if args.split_k_mode != SplitKMode::Parallel {
            return Ok(vec![self.run(op, args, executor)?]);
        }
        let partial = op.partial_accumulation();
        let reduction = op.split_k_reduction();
        self.prepare(&[&partial, &reduction])?;
        let reduction_args = op.reduction_arguments(args)?;
        let first = self.run(&partial, args, executor)?;
        let second = self.run(&reduction, &reduction_args, executor)?;
        Ok(vec![first, second])
    }

    /// Tear the backend down. Live buffers keep their memory until dropped
    /// and are reported.
    pub fn shutdown(self) -> ShutdownReport {
        let live_allocations = self.pool.stats().live_allocations;
        if live_allocations > 0 {
            warn!(live_allocations, "device buffers still alive at shutdown");
        }
        let released_bytes = self.pool.trim();
        let artifacts_dropped = self.artifacts.clear_memory();
        let pool = self.pool.stats();
        info!(released_bytes, artifacts_dropped, "backend shut down");
        ShutdownReport {
            live_allocations,
            released_bytes,
            artifacts_dropped,
            pool,
        }
    }
}
