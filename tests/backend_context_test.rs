//! End-to-end tests for the `Backend` context: device checks, compilation,
//! argument packing and launches on the recording executor.

use std::sync::Arc;

use kernel_forge::c_types::{
    Conv2dProblemSize, Dim3, GemmCoord, MatrixCoord, Tensor4DCoord, CONV_MODE_CROSS_CORRELATION,
};
use kernel_forge::cli::catalog;
use kernel_forge::compiler::MockCompiler;
use kernel_forge::device::{DeviceBackend, DeviceConfig, DeviceError};
use kernel_forge::library::{DataType, LayoutType};
use kernel_forge::memory::{DeviceAllocator, DevicePtr, HostDeviceAllocator, MemoryError, PoolConfig};
use kernel_forge::operation::{
    ConvKind, GemmKind, LaunchConfig, Launchable, Operation, RecordingExecutor, ReductionArguments,
};
use kernel_forge::{Backend, BackendConfig, BackendError, DeviceTensor};

const KB: usize = 1024;
const TN: (LayoutType, LayoutType) = (LayoutType::RowMajor, LayoutType::ColumnMajor);

fn small_pool() -> PoolConfig {
    PoolConfig {
        init_pool_size: 64 * KB,
        max_pool_size: 1024 * KB,
        grow_size: 64 * KB,
    }
}

fn backend_on(device: DeviceConfig) -> (Backend, Arc<MockCompiler>) {
    let mock = Arc::new(MockCompiler::new());
    let config = BackendConfig {
        device,
        pool: small_pool(),
        ..BackendConfig::default()
    };
    let backend = Backend::new(config, mock.clone()).unwrap();
    (backend, mock)
}

fn conv_problem(split_k_slices: i32) -> Conv2dProblemSize {
    Conv2dProblemSize::new(
        Tensor4DCoord::new(1, 16, 16, 64),
        Tensor4DCoord::new(64, 3, 3, 64),
        (1, 1),
        (1, 1),
        (1, 1),
        CONV_MODE_CROSS_CORRELATION,
        split_k_slices,
        1,
    )
}

#[test]
fn prepare_compiles_one_module_for_all_operations() {
    let (backend, mock) = backend_on(DeviceConfig::cuda(80, 108));
    let gemm = catalog::gemm(80, DataType::F16, TN, GemmKind::Universal).unwrap();
    let conv = catalog::conv2d(80, DataType::F16, ConvKind::Fprop).unwrap();

    let handles = backend.prepare(&[&gemm, &conv]).unwrap();
    assert_eq!(handles.len(), 2);
    assert_eq!(handles[0].name(), gemm.kernel_name());
    assert_eq!(handles[1].name(), conv.kernel_name());
    assert_eq!(handles[0].key(), handles[1].key());
    assert_eq!(mock.invocations(), 1);

    // Preparing again hits the memory cache.
    backend.prepare(&[&gemm, &conv]).unwrap();
    assert_eq!(mock.invocations(), 1);
    assert_eq!(backend.artifacts().stats().memory_hits, 1);
}

#[test]
fn gemm_runs_on_pooled_tensors() {
    let (backend, mock) = backend_on(DeviceConfig::cuda(80, 108));
    let pool = backend.memory_pool();
    let (m, n, k) = (256usize, 384usize, 64usize);

    let a = DeviceTensor::zeros(pool, DataType::F16, &[m, k]).unwrap();
    let b = DeviceTensor::zeros(pool, DataType::F16, &[k, n]).unwrap();
    let d = DeviceTensor::zeros(pool, DataType::F16, &[m, n]).unwrap();

    let op = catalog::gemm(80, DataType::F16, TN, GemmKind::Universal).unwrap();
    let args = op.arguments(
        GemmCoord::new(m as i32, n as i32, k as i32),
        a.ptr(),
        b.ptr(),
        d.ptr(),
        d.ptr(),
    );
    assert_eq!(args.lda, a.leading_dim(LayoutType::RowMajor) as i64);
    assert_eq!(args.ldd, d.leading_dim(LayoutType::RowMajor) as i64);

    let executor = RecordingExecutor::new();
    let launch = backend.run(&op, &args, &executor).unwrap();
    assert_eq!(launch.grid, Dim3::new(2, 3, 1));
    assert_eq!(launch.block, Dim3::linear(128));
    assert_eq!(launch.shared_memory_bytes, op.shared_memory_bytes());

    let records = executor.launches();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kernel_name, op.kernel_name());
    assert_eq!(records[0].params, op.pack_arguments(&args).unwrap());
    assert_eq!(mock.invocations(), 1, "run compiles on first use");

    backend.run(&op, &args, &executor).unwrap();
    assert_eq!(mock.invocations(), 1);
    assert_eq!(executor.launch_count(), 2);
}

#[test]
fn stream_k_grid_is_capped_by_multiprocessors() {
    let (backend, _) = backend_on(DeviceConfig::cuda(80, 4));
    let op = catalog::gemm(80, DataType::BF16, TN, GemmKind::StreamK).unwrap();
    let pool = backend.memory_pool();
    let a = pool.allocate(512 * 64 * 2).unwrap();
    let b = pool.allocate(64 * 512 * 2).unwrap();
    let d = pool.allocate(512 * 512 * 2).unwrap();

    let args = op.arguments(GemmCoord::new(512, 512, 64), a.ptr(), b.ptr(), d.ptr(), d.ptr());
    let launch = backend.run(&op, &args, &RecordingExecutor::new()).unwrap();
    // 16 output tiles on a 4-SM device
    assert_eq!(launch.grid, Dim3::linear(4));
}

#[test]
fn serial_conv_is_a_single_launch() {
    let (backend, _) = backend_on(DeviceConfig::cuda(86, 84));
    let op = catalog::conv2d(80, DataType::F16, ConvKind::Fprop).unwrap();
    let pool = backend.memory_pool();
    let problem = conv_problem(1);

    let x = pool.allocate(problem.activation_extent().numel() as usize * 2).unwrap();
    let w = pool.allocate(problem.filter_extent().numel() as usize * 2).unwrap();
    let y = pool.allocate(problem.output_extent().numel() as usize * 2).unwrap();

    let args = op.arguments(problem, x.ptr(), w.ptr(), y.ptr(), y.ptr());
    assert_eq!(op.workspace_bytes(&args), 0);

    let executor = RecordingExecutor::new();
    let launches = backend.run_conv2d(&op, &args, &executor).unwrap();
    assert_eq!(launches.len(), 1);
    // Implicit GEMM is 256 x 64 x 576.
    assert_eq!(op.implicit_gemm_size(&problem), GemmCoord::new(256, 64, 576));
    assert_eq!(launches[0].grid, Dim3::new(2, 1, 1));
    assert_eq!(executor.launches()[0].kernel_name, op.kernel_name());
}

#[test]
fn parallel_split_k_conv_runs_partials_then_reduction() {
    let (backend, mock) = backend_on(DeviceConfig::cuda(80, 108));
    let op = catalog::conv2d(80, DataType::F16, ConvKind::Fprop).unwrap();
    let pool = backend.memory_pool();
    let problem = conv_problem(4);

    let x = pool.allocate(problem.activation_extent().numel() as usize * 2).unwrap();
    let w = pool.allocate(problem.filter_extent().numel() as usize * 2).unwrap();
    let y = pool.allocate(problem.output_extent().numel() as usize * 2).unwrap();

    let serial = op.arguments(problem, x.ptr(), w.ptr(), y.ptr(), y.ptr());
    let sizing_args = serial.clone().with_parallel_split_k(x.ptr());
    let workspace = pool.allocate(op.workspace_bytes(&sizing_args)).unwrap();
    assert_eq!(workspace.len(), 4 * 256 * 64 * 4);
    let args = serial.with_parallel_split_k(workspace.ptr());

    let executor = RecordingExecutor::new();
    let launches = backend.run_conv2d(&op, &args, &executor).unwrap();
    assert_eq!(launches.len(), 2);

    let records = executor.launches();
    assert_eq!(records[0].kernel_name, op.partial_accumulation().kernel_name());
    assert_eq!(records[1].kernel_name, op.split_k_reduction().kernel_name());
    // Split slices ride in grid z of the partial pass.
    assert_eq!(launches[0].grid.z, 4);
    // 64 columns over 32 x 8 per block, 256 rows over 4 per block
    assert_eq!(launches[1].grid, Dim3::new(1, 64, 1));
    assert_eq!(launches[1].block, Dim3::new(32, 4, 1));
    assert_eq!(mock.invocations(), 1, "both stages share one module");
}

#[test]
fn parallel_split_k_without_workspace_is_rejected() {
    let (backend, _) = backend_on(DeviceConfig::default());
    let op = catalog::conv2d(80, DataType::F16, ConvKind::Fprop).unwrap();
    let buf = backend.memory_pool().allocate(4 * KB).unwrap();
    let mut args = op.arguments(conv_problem(2), buf.ptr(), buf.ptr(), buf.ptr(), buf.ptr());
    args = args.with_parallel_split_k(DevicePtr::NULL);

    let executor = RecordingExecutor::new();
    let result = backend.run_conv2d(&op, &args, &executor);
    assert!(matches!(result, Err(BackendError::Argument(_))));
    assert_eq!(executor.launch_count(), 0);
}

#[test]
fn reduction_runs_standalone() {
    let (backend, _) = backend_on(DeviceConfig::default());
    let op = catalog::reduction(80, DataType::F16);
    let pool = backend.memory_pool();
    let workspace = pool.allocate(2 * 64 * 128 * 4).unwrap();
    let out = pool.allocate(64 * 128 * 2).unwrap();

    let args = ReductionArguments::new(
        MatrixCoord::new(64, 128),
        2,
        workspace.ptr(),
        out.ptr(),
        DevicePtr::NULL,
    );
    let launch = backend.run(&op, &args, &RecordingExecutor::new()).unwrap();
    assert_eq!(launch.block, Dim3::new(32, 4, 1));
    assert_eq!(launch.grid, Dim3::new(1, 16, 1));
    assert_eq!(launch.shared_memory_bytes, 0);
}

#[test]
fn newer_arch_kernels_are_refused_before_compiling() {
    let (backend, mock) = backend_on(DeviceConfig::cuda(75, 40));
    let op = catalog::gemm(80, DataType::F16, TN, GemmKind::Universal).unwrap();

    match backend.prepare(&[&op]) {
        Err(BackendError::Device(DeviceError::UnsupportedArch {
            backend: DeviceBackend::Cuda,
            required,
            available,
        })) => {
            assert_eq!(required, 80);
            assert_eq!(available, 75);
        }
        other => panic!("expected UnsupportedArch, got {:?}", other.map(|h| h.len())),
    }
    assert_eq!(mock.invocations(), 0);

    // Older kernels still run on the newer-capability device.
    let older = catalog::gemm(75, DataType::F16, TN, GemmKind::Universal).unwrap();
    assert!(backend.prepare(&[&older]).is_ok());
}

#[test]
fn sycl_devices_need_an_exact_arch_match() {
    let (backend, _) = backend_on(DeviceConfig::sycl(11, 64));
    let pvc = catalog::gemm(11, DataType::BF16, TN, GemmKind::Universal).unwrap();
    let bmg = catalog::gemm(12, DataType::BF16, TN, GemmKind::Universal).unwrap();
    assert!(backend.prepare(&[&pvc]).is_ok());
    assert!(matches!(
        backend.prepare(&[&bmg]),
        Err(BackendError::Device(DeviceError::UnsupportedArch { .. }))
    ));
}

#[test]
fn oversized_shared_memory_launch_is_refused() {
    let (backend, _) = backend_on(DeviceConfig::cuda(80, 108));
    let op = catalog::gemm(80, DataType::F16, TN, GemmKind::Universal).unwrap();
    let handles = backend.prepare(&[&op]).unwrap();

    let launch = LaunchConfig {
        grid: Dim3::linear(1),
        block: Dim3::linear(128),
        shared_memory_bytes: 200 * 1024,
    };
    let executor = RecordingExecutor::new();
    match backend.launch(&executor, &handles[0], &launch, &[]) {
        Err(BackendError::Device(DeviceError::SharedMemoryExceeded { required, available })) => {
            assert_eq!(required, 200 * 1024);
            assert_eq!(available, 163 * 1024);
        }
        other => panic!("expected SharedMemoryExceeded, got {:?}", other),
    }
    assert_eq!(executor.launch_count(), 0);
}

#[test]
fn missing_gpu_falls_back_to_cpu_unless_required() {
    let mut config = DeviceConfig::cuda(0, 1);
    let (backend, _) = backend_on(config.clone());
    assert_eq!(backend.device().backend, DeviceBackend::Cpu);

    config.require_gpu = true;
    let result = Backend::new(
        BackendConfig {
            device: config,
            pool: small_pool(),
            ..BackendConfig::default()
        },
        Arc::new(MockCompiler::new()),
    );
    assert!(matches!(
        result,
        Err(BackendError::Device(DeviceError::NoDevicesAvailable(DeviceBackend::Cuda)))
    ));
}

#[test]
fn tensors_round_trip_through_the_pool() {
    let (backend, _) = backend_on(DeviceConfig::default());
    let data: Vec<f32> = (0..96).map(|i| i as f32 * 0.5).collect();
    let tensor = DeviceTensor::upload(backend.memory_pool(), &data, &[8, 12]).unwrap();
    assert_eq!(tensor.download::<f32>().unwrap(), data);
    assert!(matches!(
        tensor.download::<i32>(),
        Err(BackendError::DTypeMismatch {
            actual: DataType::F32,
            requested: DataType::S32
        })
    ));
}

#[test]
fn pool_exhaustion_surfaces_as_memory_error() {
    let (backend, _) = backend_on(DeviceConfig::default());
    let result = DeviceTensor::zeros(backend.memory_pool(), DataType::F32, &[1024, 1024]);
    assert!(matches!(
        result,
        Err(BackendError::Memory(MemoryError::OutOfMemory { .. }))
    ));
}

#[test]
fn custom_allocator_backs_the_pool() {
    let allocator = Arc::new(HostDeviceAllocator::new(512 * KB, 0));
    let backend = Backend::with_allocator(
        BackendConfig {
            pool: small_pool(),
            ..BackendConfig::default()
        },
        Arc::new(MockCompiler::new()),
        allocator.clone(),
    )
    .unwrap();
    assert_eq!(allocator.allocated_bytes(), 64 * KB);

    let big = backend.memory_pool().allocate(256 * KB).unwrap();
    assert!(allocator.allocated_bytes() >= 320 * KB);
    drop(big);

    let report = backend.shutdown();
    assert_eq!(report.live_allocations, 0);
    assert_eq!(allocator.allocated_bytes(), 0);
    assert_eq!(report.pool.reserved_bytes, 0);
}

#[test]
fn shutdown_reports_live_buffers() {
    let (backend, _) = backend_on(DeviceConfig::default());
    let op = catalog::reduction(80, DataType::F32);
    backend.prepare(&[&op]).unwrap();

    let held = backend.memory_pool().allocate(4 * KB).unwrap();
    let report = backend.shutdown();
    assert_eq!(report.live_allocations, 1);
    assert_eq!(report.artifacts_dropped, 1);
    assert_eq!(report.pool.live_allocations, 1);
    assert!(report.pool.reserved_bytes >= 4 * KB, "segment with a live buffer stays reserved");

    // The buffer outlives the backend and stays usable.
    held.copy_from_host(&[7u8; 16]).unwrap();
    drop(held);
}

#[tokio::test]
async fn prepare_async_matches_blocking_prepare() {
    let (backend, mock) = backend_on(DeviceConfig::cuda(90, 132));
    let ops: Vec<Arc<dyn Operation>> = vec![
        Arc::new(catalog::gemm(90, DataType::BF16, TN, GemmKind::Universal).unwrap()),
        Arc::new(catalog::conv2d(90, DataType::BF16, ConvKind::Wgrad).unwrap()),
    ];
    let handles = backend.prepare_async(ops.clone()).await.unwrap();
    assert_eq!(handles[0].name(), ops[0].kernel_name());
    assert_eq!(handles[1].name(), ops[1].kernel_name());

    let refs: Vec<&dyn Operation> = ops.iter().map(|op| op.as_ref()).collect();
    let again = backend.prepare(&refs).unwrap();
    assert_eq!(again[0].key(), handles[0].key());
    assert_eq!(mock.invocations(), 1);
}
