// Copyright 2024-2026 Kernel Forge Contributors
// Licensed under the Apache License, Version 2.0

//! GEMM operation descriptors: universal, stream-K and grouped kernels.

use serde::{Deserialize, Serialize};

use super::{ceil_div, swizzled_grid, LaunchConfig, Launchable, Operation, OperationKind};
use crate::arguments::{check_aligned, ArgumentBuffer, ArgumentError};
use crate::c_types::{bytes_of, Dim3, GemmCoord};
use crate::device::DeviceInfo;
use crate::epilogue::EpilogueFunctor;
use crate::library::{DataType, LayoutType, SwizzlingFunctor, TensorDescription, TileDescription};
use crate::memory::DevicePtr;

/// `GemmUniversalMode` values understood by the kernel.
const MODE_GEMM: i32 = 0;
const MODE_BATCHED: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GemmKind {
    Universal,
    StreamK,
    Grouped,
}

impl GemmKind {
    fn suffix(self) -> &'static str {
        match self {
            Self::Universal => "",
            Self::StreamK => "_streamk",
            Self::Grouped => "_grouped",
        }
    }
}

/// One GEMM kernel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GemmOperation {
    pub kind: GemmKind,
    pub arch: u32,
    pub tile: TileDescription,
    pub a: TensorDescription,
    pub b: TensorDescription,
    pub c: TensorDescription,
    pub epilogue: EpilogueFunctor,
    pub swizzle: SwizzlingFunctor,
}

impl GemmOperation {
    /// Build and validate a GEMM descriptor.
    ///
    /// Stream-K kernels always use the stream-K swizzle; the others start
    /// with `Identity1` and can be changed with [`with_swizzle`].
    ///
    /// [`with_swizzle`]: GemmOperation::with_swizzle
    pub fn new(
        kind: GemmKind,
        arch: u32,
        tile: TileDescription,
        a: TensorDescription,
        b: TensorDescription,
        c: TensorDescription,
        epilogue: EpilogueFunctor,
    ) -> Result<Self, ArgumentError> {
        tile.validate().map_err(ArgumentError::InvalidDescriptor)?;
        for (name, tensor) in [("A", &a), ("B", &b), ("C", &c)] {
            tensor
                .validate()
                .map_err(|e| ArgumentError::InvalidDescriptor(format!("operand {}: {}", name, e)))?;
            if tensor.layout == LayoutType::TensorNhwc {
                return Err(ArgumentError::InvalidDescriptor(format!(
                    "operand {} must be a matrix layout",
                    name
                )));
            }
        }
        if c.element != epilogue.element_output {
            return Err(ArgumentError::InvalidDescriptor(format!(
                "epilogue writes {} but C is {}",
                epilogue.element_output, c.element
            )));
        }
        let swizzle = match kind {
            GemmKind::StreamK => SwizzlingFunctor::StreamK,
            _ => SwizzlingFunctor::Identity1,
        };
        Ok(Self {
            kind,
            arch,
            tile,
            a,
            b,
            c,
            epilogue,
            swizzle,
        })
    }

    pub fn with_swizzle(mut self, swizzle: SwizzlingFunctor) -> Result<Self, ArgumentError> {
        let streamk = swizzle == SwizzlingFunctor::StreamK;
        if streamk != (self.kind == GemmKind::StreamK) {
            return Err(ArgumentError::InvalidDescriptor(format!(
                "swizzle {:?} does not match {:?} kernel",
                swizzle, self.kind
            )));
        }
        self.swizzle = swizzle;
        Ok(self)
    }

    /// `s16816gemm`, `hgemm`, ...
    fn core_name(&self) -> String {
        let inst = &self.tile.math_instruction;
        let acc = match inst.element_accumulator {
            DataType::F16 => "h",
            DataType::F32 | DataType::TF32 => "s",
            DataType::F64 => "d",
            DataType::S32 => "i",
            _ => "",
        };
        format!("{}{}gemm", acc, inst.shape_name())
    }

    /// Dense arguments for `problem` with leading dimensions taken from the
    /// operand layouts, `alpha = 1`, `beta = 0`.
    pub fn arguments(
        &self,
        problem: GemmCoord,
        ptr_a: DevicePtr,
        ptr_b: DevicePtr,
        ptr_c: DevicePtr,
        ptr_d: DevicePtr,
    ) -> GemmArguments {
        let (m, n, k) = (problem.m as usize, problem.n as usize, problem.k as usize);
        GemmArguments {
            problem,
            ptr_a,
            ptr_b,
            ptr_c,
            ptr_d,
            lda: self.a.layout.leading_dim(m, k) as i64,
            ldb: self.b.layout.leading_dim(k, n) as i64,
            ldc: self.c.layout.leading_dim(m, n) as i64,
            ldd: self.c.layout.leading_dim(m, n) as i64,
            alpha: 1.0,
            beta: 0.0,
            batch_count: 1,
            split_k_slices: 1,
        }
    }

    pub fn validate_arguments(&self, args: &GemmArguments) -> Result<(), ArgumentError> {
        if self.kind == GemmKind::Grouped {
            return Err(ArgumentError::InvalidProblem(
                "grouped GEMM takes GroupedGemmArguments".into(),
            ));
        }
        let p = args.problem;
        if p.m <= 0 || p.n <= 0 || p.k <= 0 {
            return Err(ArgumentError::InvalidProblem(format!(
                "extents must be positive, got {}x{}x{}",
                p.m, p.n, p.k
            )));
        }
        if args.batch_count < 1 || args.split_k_slices < 1 {
            return Err(ArgumentError::InvalidProblem(
                "batch_count and split_k_slices must be at least 1".into(),
            ));
        }
        if args.batch_count > 1 && args.split_k_slices > 1 {
            return Err(ArgumentError::InvalidProblem(
                "split-K cannot be combined with batching".into(),
            ));
        }
        if args.split_k_slices > 1 {
            if self.kind == GemmKind::StreamK {
                return Err(ArgumentError::InvalidProblem(
                    "stream-K kernels partition K themselves".into(),
                ));
            }
            let tb_k = self.tile.threadblock_shape[2] as i64;
            let max_slices = ceil_div(p.k as i64, tb_k);
            if args.split_k_slices as i64 > max_slices {
                return Err(ArgumentError::InvalidProblem(format!(
                    "{} split-K slices for K = {} with {}-deep tiles",
                    args.split_k_slices, p.k, tb_k
                )));
            }
        }

        let (m, n, k) = (p.m as i64, p.n as i64, p.k as i64);
        check_operand(&self.a, "lda", args.lda, (m, k))?;
        check_operand(&self.b, "ldb", args.ldb, (k, n))?;
        check_operand(&self.c, "ldc", args.ldc, (m, n))?;
        check_operand(&self.c, "ldd", args.ldd, (m, n))?;

        if args.ptr_a.is_null() || args.ptr_b.is_null() || args.ptr_d.is_null() {
            return Err(ArgumentError::InvalidProblem("A, B and D must be bound".into()));
        }
        if args.beta != 0.0 && args.ptr_c.is_null() {
            return Err(ArgumentError::InvalidProblem("beta != 0 needs a C operand".into()));
        }
        Ok(())
    }

    pub fn validate_grouped_arguments(&self, args: &GroupedGemmArguments) -> Result<(), ArgumentError> {
        if self.kind != GemmKind::Grouped {
            return Err(ArgumentError::InvalidProblem(format!(
                "{:?} GEMM takes GemmArguments",
                self.kind
            )));
        }
        if args.problems.is_empty() {
            return Err(ArgumentError::InvalidProblem("grouped GEMM has no problems".into()));
        }
        for (i, p) in args.problems.iter().enumerate() {
            if p.m <= 0 || p.n <= 0 || p.k <= 0 {
                return Err(ArgumentError::InvalidProblem(format!(
                    "problem {} has extents {}x{}x{}",
                    i, p.m, p.n, p.k
                )));
            }
            let (m, n, k) = (p.m as i64, p.n as i64, p.k as i64);
            check_aligned("A contiguous extent", contiguous(&self.a, (m, k)), self.a.alignment)?;
            check_aligned("B contiguous extent", contiguous(&self.b, (k, n)), self.b.alignment)?;
            check_aligned("C contiguous extent", contiguous(&self.c, (m, n)), self.c.alignment)?;
        }
        let arrays = [
            args.problem_sizes,
            args.ptr_a,
            args.ptr_b,
            args.ptr_c,
            args.ptr_d,
            args.lda,
            args.ldb,
            args.ldc,
            args.ldd,
        ];
        if arrays.iter().any(|p| p.is_null()) {
            return Err(ArgumentError::InvalidProblem(
                "grouped GEMM device arrays must all be bound".into(),
            ));
        }
        Ok(())
    }

    fn tiles(&self, problem: &GemmCoord) -> (i64, i64) {
        let [tb_m, tb_n, _] = self.tile.threadblock_shape;
        (
            ceil_div(problem.m as i64, tb_m as i64),
            ceil_div(problem.n as i64, tb_n as i64),
        )
    }
}

/// Extent along the contiguous dimension of a `rows x cols` operand.
fn contiguous(tensor: &TensorDescription, (rows, cols): (i64, i64)) -> i64 {
    match tensor.layout {
        LayoutType::ColumnMajor => rows,
        _ => cols,
    }
}

fn check_operand(
    tensor: &TensorDescription,
    ld_name: &'static str,
    ld: i64,
    shape: (i64, i64),
) -> Result<(), ArgumentError> {
    let extent = contiguous(tensor, shape);
    if ld < extent {
        return Err(ArgumentError::ShapeMismatch {
            expected: format!("{} >= {}", ld_name, extent),
            actual: ld.to_string(),
        });
    }
    check_aligned("contiguous extent", extent, tensor.alignment)?;
    check_aligned(ld_name, ld, tensor.alignment)
}

impl Operation for GemmOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::Gemm
    }

    fn arch(&self) -> u32 {
        self.arch
    }

    fn procedural_name(&self) -> String {
        let inst = &self.tile.math_instruction;
        format!(
            "cutlass_sm{}_{}_{}_{}_{}_{}_{}{}_align{}{}{}",
            self.arch,
            inst.opcode_class.short_name(),
            self.core_name(),
            self.a.element.short_name(),
            self.c.element.short_name(),
            self.tile.procedural_name(),
            self.a.layout.short_name(),
            self.b.layout.short_name(),
            self.a.alignment,
            self.epilogue.procedural_suffix(),
            self.kind.suffix(),
        )
    }

    fn emit(&self) -> String {
        let name = self.procedural_name();
        let inst = &self.tile.math_instruction;
        let [tb_m, tb_n, tb_k] = self.tile.threadblock_shape;
        let [w_m, w_n, w_k] = self.tile.warp_shape();
        let [i_m, i_n, i_k] = match inst.opcode_class {
            crate::library::OpcodeClass::Simt => [1, 1, 1],
            crate::library::OpcodeClass::TensorOp => inst.instruction_shape,
        };
        let operands = format!(
            "    {a}, {la}, cutlass::ComplexTransform::kNone, {aa},\n    \
             {b}, {lb}, cutlass::ComplexTransform::kNone, {ab},\n    \
             {c}, {lc},\n    {acc},",
            a = self.a.element.cpp_tag(),
            la = self.a.layout.cpp_tag(),
            aa = self.a.alignment,
            b = self.b.element.cpp_tag(),
            lb = self.b.layout.cpp_tag(),
            ab = self.b.alignment,
            c = self.c.element.cpp_tag(),
            lc = self.c.layout.cpp_tag(),
            acc = inst.element_accumulator.cpp_tag(),
        );
        let shapes = format!(
            "    {opclass},\n    cutlass::arch::Sm{arch},\n    \
             cutlass::gemm::GemmShape<{tb_m}, {tb_n}, {tb_k}>,\n    \
             cutlass::gemm::GemmShape<{w_m}, {w_n}, {w_k}>,\n    \
             cutlass::gemm::GemmShape<{i_m}, {i_n}, {i_k}>,\n    {epilogue},",
            opclass = inst.opcode_class.cpp_tag(),
            arch = self.arch,
            epilogue = self.epilogue.emit(),
        );
        let (template, schedule) = match self.kind {
            GemmKind::Grouped => (
                "DefaultGemmGrouped",
                format!(
                    "    cutlass::gemm::threadblock::GemmBatchedIdentityThreadblockSwizzle,\n    \
                     {},\n    cutlass::gemm::kernel::GroupScheduleMode::kDeviceOnly,\n    {}",
                    self.tile.stages,
                    inst.math_operation.cpp_tag()
                ),
            ),
            GemmKind::Universal | GemmKind::StreamK => (
                "DefaultGemmUniversal",
                format!(
                    "    {},\n    {},\n    {}",
                    self.swizzle.cpp_tag(),
                    self.tile.stages,
                    inst.math_operation.cpp_tag()
                ),
            ),
        };
        format!(
            "// Gemm operator {name}\n\
             using {name}_base =\n  typename cutlass::gemm::kernel::{template}<\n\
             {operands}\n{shapes}\n{schedule}\n  >::GemmKernel;\n\n\
             struct {name}_type : public {name}_base {{ }};\n\
             FORGE_KERNEL_ENTRY({kernel}, {name}_type)\n",
            kernel = self.kernel_name(),
        )
    }

    fn shared_memory_bytes(&self) -> u32 {
        let [tb_m, tb_n, tb_k] = self.tile.threadblock_shape;
        let per_stage = tb_m * tb_k * self.a.element.bits() + tb_n * tb_k * self.b.element.bits();
        self.tile.stages * per_stage / 8
    }
}

/// Arguments of a universal or stream-K GEMM: `D = alpha * A @ B + beta * C`.
#[derive(Debug, Clone, PartialEq)]
pub struct GemmArguments {
    pub problem: GemmCoord,
    pub ptr_a: DevicePtr,
    pub ptr_b: DevicePtr,
    pub ptr_c: DevicePtr,
    pub ptr_d: DevicePtr,
    pub lda: i64,
    pub ldb: i64,
    pub ldc: i64,
    pub ldd: i64,
    pub alpha: f64,
    pub beta: f64,
    pub batch_count: i32,
    pub split_k_slices: i32,
}

impl GemmArguments {
    pub fn with_scalars(mut self, alpha: f64, beta: f64) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self
    }

    pub fn with_split_k(mut self, slices: i32) -> Self {
        self.split_k_slices = slices;
        self
    }

    pub fn with_batch_count(mut self, batch_count: i32) -> Self {
        self.batch_count = batch_count;
        self
    }

    /// Dense per-batch strides of A, B, C and D in elements.
    fn batch_strides(&self) -> [i64; 4] {
        let (m, n, k) = (self.problem.m as i64, self.problem.n as i64, self.problem.k as i64);
        [m * k, k * n, m * n, m * n]
    }
}

impl Launchable<GemmArguments> for GemmOperation {
    /// Layout: mode, problem, batch/split count, alpha, beta, A..D
    /// pointers, batch strides, leading dimensions.
    fn pack_arguments(&self, args: &GemmArguments) -> Result<Vec<u8>, ArgumentError> {
        self.validate_arguments(args)?;
        let (mode, count) = if args.batch_count > 1 {
            (MODE_BATCHED, args.batch_count)
        } else {
            (MODE_GEMM, args.split_k_slices)
        };
        let mut buf = ArgumentBuffer::new();
        buf.push_i32(mode).push(&args.problem).push_i32(count);
        self.epilogue.pack_scalars(args.alpha, args.beta, &mut buf)?;
        buf.push_ptr(args.ptr_a)
            .push_ptr(args.ptr_b)
            .push_ptr(args.ptr_c)
            .push_ptr(args.ptr_d);
        for stride in args.batch_strides() {
            buf.push_i64(stride);
        }
        buf.push_i64(args.lda)
            .push_i64(args.ldb)
            .push_i64(args.ldc)
            .push_i64(args.ldd);
        buf.finish()
    }

    fn launch_config(&self, args: &GemmArguments, device: &DeviceInfo) -> Result<LaunchConfig, ArgumentError> {
        self.validate_arguments(args)?;
        let (tiles_m, tiles_n) = self.tiles(&args.problem);
        let grid = match self.kind {
            GemmKind::StreamK => {
                let total = tiles_m * tiles_n * args.batch_count as i64;
                Dim3::linear(total.min(device.multiprocessor_count.max(1) as i64) as u32)
            }
            _ => swizzled_grid(
                tiles_m,
                tiles_n,
                self.swizzle.log_tile(),
                (args.split_k_slices * args.batch_count) as i64,
            ),
        };
        Ok(LaunchConfig {
            grid,
            block: Dim3::linear(self.tile.threads()),
            shared_memory_bytes: self.shared_memory_bytes(),
        })
    }
}

/// Arguments of a grouped GEMM.
///
/// `problems` stays on the host for validation and scheduling; the kernel
/// reads the device copies behind `problem_sizes` and the per-problem
/// pointer and leading-dimension arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedGemmArguments {
    pub problems: Vec<GemmCoord>,
    pub problem_sizes: DevicePtr,
    pub ptr_a: DevicePtr,
    pub ptr_b: DevicePtr,
    pub ptr_c: DevicePtr,
    pub ptr_d: DevicePtr,
    pub lda: DevicePtr,
    pub ldb: DevicePtr,
    pub ldc: DevicePtr,
    pub ldd: DevicePtr,
    pub alpha: f64,
    pub beta: f64,
    /// Overrides the persistent CTA count, which defaults to one per SM.
    pub threadblock_count: Option<u32>,
}

impl GroupedGemmArguments {
    /// Unbound arguments for `problems`; device arrays start null.
    pub fn new(problems: Vec<GemmCoord>) -> Self {
        Self {
            problems,
            problem_sizes: DevicePtr::NULL,
            ptr_a: DevicePtr::NULL,
            ptr_b: DevicePtr::NULL,
            ptr_c: DevicePtr::NULL,
            ptr_d: DevicePtr::NULL,
            lda: DevicePtr::NULL,
            ldb: DevicePtr::NULL,
            ldc: DevicePtr::NULL,
            ldd: DevicePtr::NULL,
            alpha: 1.0,
            beta: 0.0,
            threadblock_count: None,
        }
    }

    pub fn problem_count(&self) -> usize {
        self.problems.len()
    }

    /// Host image of the problem size array to upload behind `problem_sizes`.
    pub fn problem_sizes_bytes(&self) -> Vec<u8> {
        self.problems.iter().flat_map(|p| bytes_of(p).to_vec()).collect()
    }

    /// Output tiles across all problems for `op`'s threadblock shape.
    pub fn total_tiles(&self, op: &GemmOperation) -> i64 {
        self.problems
            .iter()
            .map(|p| {
                let (tm, tn) = op.tiles(p);
                tm * tn
            })
            .sum()
    }
}

impl Launchable<GroupedGemmArguments> for GemmOperation {
    fn pack_arguments(&self, args: &GroupedGemmArguments) -> Result<Vec<u8>, ArgumentError> {
        self.validate_grouped_arguments(args)?;
        let mut buf = ArgumentBuffer::new();
        buf.push_i32(args.problems.len() as i32);
        self.epilogue.pack_scalars(args.alpha, args.beta, &mut buf)?;
        for ptr in [
            args.problem_sizes,
            args.ptr_a,
            args.ptr_b,
            args.ptr_c,
            args.ptr_d,
            args.lda,
            args.ldb,
            args.ldc,
            args.ldd,
        ] {
            buf.push_ptr(ptr);
        }
        buf.finish()
    }

    fn launch_config(&self, args: &GroupedGemmArguments, device: &DeviceInfo) -> Result<LaunchConfig, ArgumentError> {
        self.validate_grouped_arguments(args)?;
        let ctas = args
            .threadblock_count
            .unwrap_or(device.multiprocessor_count)
            .max(1);
        Ok(LaunchConfig {
            grid: Dim3::linear(ctas),
            block: Dim3::linear(self.tile.threads()),
            shared_memory_bytes: self.shared_memory_bytes(),
        })
    }
}
