//! 2-D convolution as implicit GEMM.

use serde::{Deserialize, Serialize};

use super::reduction::{ReductionArguments, ReductionOperation};
use super::{ceil_div, swizzled_grid, LaunchConfig, Launchable, Operation, OperationKind};
use crate::arguments::{check_aligned, ArgumentBuffer, ArgumentError};
use crate::c_types::{Conv2dProblemSize, Dim3, GemmCoord, MatrixCoord};
use crate::device::DeviceInfo;
use crate::epilogue::EpilogueFunctor;
use crate::library::{
    DataType, LayoutType, OpcodeClass, SwizzlingFunctor, TensorDescription, TileDescription,
};
use crate::memory::DevicePtr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvKind {
    /// Forward propagation: `y = conv(x, w)`.
    Fprop,
    /// Data gradient: `dx = conv_t(dy, w)`.
    Dgrad,
    /// Weight gradient: `dw = conv(x, dy)`.
    Wgrad,
}

impl ConvKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Fprop => "fprop",
            Self::Dgrad => "dgrad",
            Self::Wgrad => "wgrad",
        }
    }

    fn template(self) -> &'static str {
        match self {
            Self::Fprop => "DefaultConv2dFprop",
            Self::Dgrad => "DefaultConv2dDgrad",
            Self::Wgrad => "DefaultConv2dWgrad",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IteratorAlgorithm {
    Analytic,
    #[default]
    Optimized,
    /// Input channels equal the A alignment exactly.
    FixedChannels,
    /// Input channels are a small multiple of the A alignment.
    FewChannels,
}

impl IteratorAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            Self::Analytic => "analytic",
            Self::Optimized => "optimized",
            Self::FixedChannels => "fixed_channels",
            Self::FewChannels => "few_channels",
        }
    }

    fn cpp_tag(self) -> &'static str {
        match self {
            Self::Analytic => "cutlass::conv::IteratorAlgorithm::kAnalytic",
            Self::Optimized => "cutlass::conv::IteratorAlgorithm::kOptimized",
            Self::FixedChannels => "cutlass::conv::IteratorAlgorithm::kFixedChannels",
            Self::FewChannels => "cutlass::conv::IteratorAlgorithm::kFewChannels",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrideSupport {
    #[default]
    Strided,
    Unity,
}

impl StrideSupport {
    fn cpp_tag(self) -> &'static str {
        match self {
            Self::Strided => "cutlass::conv::StrideSupport::kStrided",
            Self::Unity => "cutlass::conv::StrideSupport::kUnity",
        }
    }
}

/// How split-K slices are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitKMode {
    /// Slices accumulate into the output in turn.
    #[default]
    Serial,
    /// Slices write partial sums to a workspace reduced by a second kernel.
    Parallel,
}

/// One convolution kernel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conv2dOperation {
    pub conv_kind: ConvKind,
    pub iterator_algorithm: IteratorAlgorithm,
    pub arch: u32,
    pub tile: TileDescription,
    pub a: TensorDescription,
    pub b: TensorDescription,
    pub c: TensorDescription,
    pub epilogue: EpilogueFunctor,
    pub swizzle: SwizzlingFunctor,
    pub stride_support: StrideSupport,
}

impl Conv2dOperation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conv_kind: ConvKind,
        iterator_algorithm: IteratorAlgorithm,
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
            if tensor.layout != LayoutType::TensorNhwc {
                return Err(ArgumentError::InvalidDescriptor(format!(
                    "operand {} must be NHWC",
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
        if matches!(
            iterator_algorithm,
            IteratorAlgorithm::FixedChannels | IteratorAlgorithm::FewChannels
        ) && conv_kind != ConvKind::Fprop
        {
            return Err(ArgumentError::InvalidDescriptor(format!(
                "{} iterators only exist for fprop",
                iterator_algorithm.name()
            )));
        }
        Ok(Self {
            conv_kind,
            iterator_algorithm,
            arch,
            tile,
            a,
            b,
            c,
            epilogue,
            swizzle: SwizzlingFunctor::Identity1,
            stride_support: StrideSupport::Strided,
        })
    }

    pub fn with_swizzle(mut self, swizzle: SwizzlingFunctor) -> Result<Self, ArgumentError> {
        if swizzle == SwizzlingFunctor::StreamK {
            return Err(ArgumentError::InvalidDescriptor(
                "stream-K is not available for convolutions".into(),
            ));
        }
        self.swizzle = swizzle;
        Ok(self)
    }

    pub fn with_stride_support(mut self, stride_support: StrideSupport) -> Self {
        self.stride_support = stride_support;
        self
    }

    fn element_accumulator(&self) -> DataType {
        self.tile.math_instruction.element_accumulator
    }

    /// GEMM extents the convolution maps onto. Products too large for `i32`
    /// saturate; `validate_arguments` rejects such problems.
    pub fn implicit_gemm_size(&self, problem: &Conv2dProblemSize) -> GemmCoord {
        let c = problem.c / problem.groups.max(1);
        match self.conv_kind {
            ConvKind::Fprop => GemmCoord::new(
                extent_product(&[problem.n, problem.p, problem.q]),
                problem.k,
                extent_product(&[problem.r, problem.s, c]),
            ),
            ConvKind::Dgrad => GemmCoord::new(
                extent_product(&[problem.n, problem.h, problem.w]),
                problem.c,
                extent_product(&[problem.k, problem.r, problem.s]),
            ),
            ConvKind::Wgrad => GemmCoord::new(
                problem.k,
                extent_product(&[problem.r, problem.s, c]),
                extent_product(&[problem.n, problem.p, problem.q]),
            ),
        }
    }

    /// The variant of this kernel that writes raw accumulators, used as the
    /// first stage of a parallel split-K convolution.
    pub fn partial_accumulation(&self) -> Self {
        let acc = self.element_accumulator();
        let mut partial = self.clone();
        // 128-bit stores of the accumulator type
        let per_access = (128 / acc.bits()).min(self.c.alignment.max(1) * 4).max(1);
        partial.c = TensorDescription::new(acc, LayoutType::TensorNhwc, per_access);
        partial.epilogue = EpilogueFunctor::linear_combination(acc, per_access, acc, acc);
        partial
    }

    /// Second stage of a parallel split-K convolution: sums the partials and
    /// applies this operation's epilogue.
    pub fn split_k_reduction(&self) -> ReductionOperation {
        ReductionOperation::new(self.arch, self.element_accumulator(), self.epilogue.clone())
    }

    /// Dense arguments with `alpha = 1`, `beta = 0`, serial split-K.
    pub fn arguments(
        &self,
        problem: Conv2dProblemSize,
        ptr_a: DevicePtr,
        ptr_b: DevicePtr,
        ptr_c: DevicePtr,
        ptr_d: DevicePtr,
    ) -> Conv2dArguments {
        Conv2dArguments {
            problem,
            ptr_a,
            ptr_b,
            ptr_c,
            ptr_d,
            alpha: 1.0,
            beta: 0.0,
            split_k_mode: SplitKMode::Serial,
            workspace: DevicePtr::NULL,
        }
    }

    /// Bytes of partial-sum workspace `args` needs; zero unless parallel.
    pub fn workspace_bytes(&self, args: &Conv2dArguments) -> usize {
        if args.split_k_mode != SplitKMode::Parallel {
            return 0;
        }
        let gemm = self.implicit_gemm_size(&args.problem);
        (args.problem.split_k_slices.max(1) as usize)
            .saturating_mul(gemm.m.max(0) as usize)
            .saturating_mul(gemm.n.max(0) as usize)
            .saturating_mul(self.element_accumulator().size_bytes())
    }

    /// Arguments of the reduction that completes a parallel split-K run.
    pub fn reduction_arguments(&self, args: &Conv2dArguments) -> Result<ReductionArguments, ArgumentError> {
        if args.split_k_mode != SplitKMode::Parallel {
            return Err(ArgumentError::InvalidProblem(
                "reduction only follows parallel split-K".into(),
            ));
        }
        if args.workspace.is_null() {
            return Err(ArgumentError::InvalidProblem("parallel split-K needs a workspace".into()));
        }
        let gemm = self.implicit_gemm_size(&args.problem);
        let mut reduction = ReductionArguments::new(
            MatrixCoord::new(gemm.m, gemm.n),
            args.problem.split_k_slices,
            args.workspace,
            args.ptr_d,
            args.ptr_c,
        );
        reduction.alpha = args.alpha;
        reduction.beta = args.beta;
        Ok(reduction)
    }

    pub fn validate_arguments(&self, args: &Conv2dArguments) -> Result<(), ArgumentError> {
        let problem = &args.problem;
        problem.validate().map_err(ArgumentError::InvalidProblem)?;

        if self.stride_support == StrideSupport::Unity && !problem.has_unit_stride() {
            return Err(ArgumentError::InvalidProblem(format!(
                "unity-stride kernel given stride {}x{}",
                problem.stride_h, problem.stride_w
            )));
        }

        let (a_channels, b_channels, c_channels) = match self.conv_kind {
            ConvKind::Fprop => (problem.c, problem.c, problem.k),
            ConvKind::Dgrad => (problem.k, problem.c, problem.c),
            ConvKind::Wgrad => (problem.k, problem.c, problem.c),
        };
        check_aligned("A channels", a_channels as i64, self.a.alignment)?;
        check_aligned("B channels", b_channels as i64, self.b.alignment)?;
        check_aligned("C channels", c_channels as i64, self.c.alignment)?;

        if self.iterator_algorithm == IteratorAlgorithm::FixedChannels
            && problem.c as u32 != self.a.alignment
        {
            return Err(ArgumentError::ShapeMismatch {
                expected: format!("C == {}", self.a.alignment),
                actual: problem.c.to_string(),
            });
        }

        let gemm = self.implicit_gemm_size(problem);
        let tb_k = self.tile.threadblock_shape[2] as i64;
        let max_slices = ceil_div(gemm.k as i64, tb_k);
        if problem.split_k_slices as i64 > max_slices {
            return Err(ArgumentError::InvalidProblem(format!(
                "{} split-K slices for implicit GEMM K = {}",
                problem.split_k_slices, gemm.k
            )));
        }

        if args.ptr_a.is_null() || args.ptr_b.is_null() || args.ptr_d.is_null() {
            return Err(ArgumentError::InvalidProblem("A, B and D must be bound".into()));
        }
        if args.beta != 0.0 && args.ptr_c.is_null() {
            return Err(ArgumentError::InvalidProblem("beta != 0 needs a C operand".into()));
        }

        if args.split_k_mode == SplitKMode::Parallel {
            if self.c.element != self.element_accumulator() {
                return Err(ArgumentError::InvalidProblem(
                    "parallel split-K runs the partial accumulation kernel".into(),
                ));
            }
            if args.workspace.is_null() {
                return Err(ArgumentError::InvalidProblem(
                    "parallel split-K needs a workspace".into(),
                ));
            }
        }
        Ok(())
    }

    fn core_name(&self) -> String {
        let inst = &self.tile.math_instruction;
        let acc = match inst.element_accumulator {
            DataType::F16 => "h",
            DataType::F32 | DataType::TF32 => "s",
            DataType::F64 => "d",
            DataType::S32 => "i",
            _ => "",
        };
        format!("{}{}{}", acc, inst.shape_name(), self.conv_kind.name())
    }
}

impl Operation for Conv2dOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::Conv2d
    }

    fn arch(&self) -> u32 {
        self.arch
    }

    fn procedural_name(&self) -> String {
        let stride = match self.stride_support {
            StrideSupport::Strided => "",
            StrideSupport::Unity => "_unity_stride",
        };
        format!(
            "cutlass_sm{}_{}_{}_{}_{}_{}_{}_nhwc_align{}{}{}",
            self.arch,
            self.tile.math_instruction.opcode_class.short_name(),
            self.core_name(),
            self.iterator_algorithm.name(),
            self.a.element.short_name(),
            self.c.element.short_name(),
            self.tile.procedural_name(),
            self.a.alignment,
            self.epilogue.procedural_suffix(),
            stride,
        )
    }

    fn emit(&self) -> String {
        let name = self.procedural_name();
        let inst = &self.tile.math_instruction;
        let [tb_m, tb_n, tb_k] = self.tile.threadblock_shape;
        let [w_m, w_n, w_k] = self.tile.warp_shape();
        let [i_m, i_n, i_k] = match inst.opcode_class {
            OpcodeClass::Simt => [1, 1, 1],
            OpcodeClass::TensorOp => inst.instruction_shape,
        };
        let mut src = format!("// Conv2d{} operator {}\n", self.conv_kind.name(), name);
        src.push_str(&format!(
            "using {}_base =\n  typename cutlass::conv::kernel::{}<\n",
            name,
            self.conv_kind.template()
        ));
        let params = [
            self.a.element.cpp_tag().to_string(),
            self.a.layout.cpp_tag().to_string(),
            self.b.element.cpp_tag().to_string(),
            self.b.layout.cpp_tag().to_string(),
            self.c.element.cpp_tag().to_string(),
            self.c.layout.cpp_tag().to_string(),
            inst.element_accumulator.cpp_tag().to_string(),
            inst.opcode_class.cpp_tag().to_string(),
            format!("cutlass::arch::Sm{}", self.arch),
            format!("cutlass::gemm::GemmShape<{}, {}, {}>", tb_m, tb_n, tb_k),
            format!("cutlass::gemm::GemmShape<{}, {}, {}>", w_m, w_n, w_k),
            format!("cutlass::gemm::GemmShape<{}, {}, {}>", i_m, i_n, i_k),
            self.epilogue.emit(),
            self.swizzle.cpp_tag().to_string(),
            self.tile.stages.to_string(),
            inst.math_operation.cpp_tag().to_string(),
            self.iterator_algorithm.cpp_tag().to_string(),
            self.stride_support.cpp_tag().to_string(),
            self.a.alignment.to_string(),
            self.b.alignment.to_string(),
        ];
        src.push_str("    ");
        src.push_str(&params.join(",\n    "));
        src.push_str("\n  >::Kernel;\n\n");
        src.push_str(&format!("struct {0}_type : public {0}_base {{ }};\n", name));
        src.push_str(&format!(
            "FORGE_KERNEL_ENTRY({}, {}_type)\n",
            self.kernel_name(),
            name
        ));
        src
    }

    fn shared_memory_bytes(&self) -> u32 {
        let [tb_m, tb_n, tb_k] = self.tile.threadblock_shape;
        let per_stage = tb_m * tb_k * self.a.element.bits() + tb_n * tb_k * self.b.element.bits();
        self.tile.stages * per_stage / 8
    }
}

/// Arguments of a convolution launch.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv2dArguments {
    pub problem: Conv2dProblemSize,
    pub ptr_a: DevicePtr,
    pub ptr_b: DevicePtr,
    pub ptr_c: DevicePtr,
    pub ptr_d: DevicePtr,
    pub alpha: f64,
    pub beta: f64,
    pub split_k_mode: SplitKMode,
    /// Partial sums of a parallel split-K run.
    pub workspace: DevicePtr,
}

impl Conv2dArguments {
    pub fn with_scalars(mut self, alpha: f64, beta: f64) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self
    }

    pub fn with_parallel_split_k(mut self, workspace: DevicePtr) -> Self {
        self.split_k_mode = SplitKMode::Parallel;
        self.workspace = workspace;
        self
    }

    /// `cutlass::conv::SplitKMode` value.
    fn mode_value(&self) -> i32 {
        if self.problem.split_k_slices <= 1 {
            return 0;
        }
        match self.split_k_mode {
            SplitKMode::Serial => 1,
            SplitKMode::Parallel => 2,
        }
    }
}

impl Launchable<Conv2dArguments> for Conv2dOperation {
    /// Layout: problem size, split-K mode, alpha, beta, A..D pointers.
    /// A parallel run writes raw partials to the workspace with unit alpha.
    fn pack_arguments(&self, args: &Conv2dArguments) -> Result<Vec<u8>, ArgumentError> {
        self.validate_arguments(args)?;
        let (alpha, beta, ptr_d) = match args.split_k_mode {
            SplitKMode::Parallel => (1.0, 0.0, args.workspace),
            SplitKMode::Serial => (args.alpha, args.beta, args.ptr_d),
        };
        let mut buf = ArgumentBuffer::new();
        buf.push(&args.problem).push_i32(args.mode_value());
        self.epilogue.pack_scalars(alpha, beta, &mut buf)?;
        buf.push_ptr(args.ptr_a)
            .push_ptr(args.ptr_b)
            .push_ptr(args.ptr_c)
            .push_ptr(ptr_d);
        buf.finish()
    }

    fn launch_config(&self, args: &Conv2dArguments, _device: &DeviceInfo) -> Result<LaunchConfig, ArgumentError> {
        self.validate_arguments(args)?;
        let gemm = self.implicit_gemm_size(&args.problem);
        let [tb_m, tb_n, _] = self.tile.threadblock_shape;
        let grid = swizzled_grid(
            ceil_div(gemm.m as i64, tb_m as i64),
            ceil_div(gemm.n as i64, tb_n as i64),
            self.swizzle.log_tile(),
            args.problem.split_k_slices.max(1) as i64,
        );
        Ok(LaunchConfig {
            grid,
            block: Dim3::linear(self.tile.threads()),
            shared_memory_bytes: self.shared_memory_bytes(),
        })
    }
}

fn extent_product(dims: &[i32]) -> i32 {
    let product: i64 = dims.iter().map(|&d| i64::from(d)).product();
    i32::try_from(product).unwrap_or(i32::MAX)
}
