//! Split-K reduction: sums partial accumulators and applies the epilogue.

use serde::{Deserialize, Serialize};

use super::{ceil_div, LaunchConfig, Launchable, Operation, OperationKind};
use crate::arguments::{check_aligned, ArgumentBuffer, ArgumentError};
use crate::c_types::{Dim3, MatrixCoord};
use crate::device::DeviceInfo;
use crate::epilogue::EpilogueFunctor;
use crate::library::DataType;
use crate::memory::DevicePtr;

/// Partitions summed per pipeline stage.
const PARTITIONS_PER_STAGE: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReductionOperation {
    pub arch: u32,
    pub element_accumulator: DataType,
    /// Threads per block as rows x columns.
    pub shape: ThreadShape,
    /// Elements each thread reduces per access.
    pub count: u32,
    pub epilogue: EpilogueFunctor,
}

/// Thread layout of a reduction block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadShape {
    pub rows: u32,
    pub columns: u32,
}

impl ReductionOperation {
    pub fn new(arch: u32, element_accumulator: DataType, epilogue: EpilogueFunctor) -> Self {
        let count = epilogue.elements_per_access.max(1);
        Self {
            arch,
            element_accumulator,
            shape: ThreadShape { rows: 4, columns: 32 },
            count,
            epilogue,
        }
    }

    pub fn validate_arguments(&self, args: &ReductionArguments) -> Result<(), ArgumentError> {
        let rows = args.problem.row as i64;
        let cols = args.problem.column as i64;
        if rows <= 0 || cols <= 0 {
            return Err(ArgumentError::InvalidProblem(format!(
                "reduction extent {}x{} must be positive",
                rows, cols
            )));
        }
        if args.partitions < 1 {
            return Err(ArgumentError::InvalidProblem("at least one partition required".into()));
        }
        check_aligned("columns", cols, self.count)?;
        for (name, ld) in [
            ("ld_workspace", args.ld_workspace),
            ("ld_destination", args.ld_destination),
            ("ld_source", args.ld_source),
        ] {
            if ld < cols {
                return Err(ArgumentError::ShapeMismatch {
                    expected: format!("{} >= {}", name, cols),
                    actual: ld.to_string(),
                });
            }
            check_aligned(name, ld, self.count)?;
        }
        if args.partitions > 1 && args.partition_stride < rows * args.ld_workspace {
            return Err(ArgumentError::ShapeMismatch {
                expected: format!("partition_stride >= {}", rows * args.ld_workspace),
                actual: args.partition_stride.to_string(),
            });
        }
        if args.workspace.is_null() || args.destination.is_null() {
            return Err(ArgumentError::InvalidProblem(
                "workspace and destination must be bound".into(),
            ));
        }
        if args.beta != 0.0 && args.source.is_null() {
            return Err(ArgumentError::InvalidProblem("beta != 0 needs a source".into()));
        }
        Ok(())
    }
}

impl Operation for ReductionOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::Reduction
    }

    fn arch(&self) -> u32 {
        self.arch
    }

    fn procedural_name(&self) -> String {
        format!(
            "cutlass_sm{}_reduce_split_k_{}_{}_{}x{}x{}{}",
            self.arch,
            self.element_accumulator.short_name(),
            self.epilogue.element_output.short_name(),
            self.count,
            self.shape.rows,
            self.shape.columns,
            self.epilogue.procedural_suffix(),
        )
    }

    fn emit(&self) -> String {
        let name = self.procedural_name();
        let acc = self.element_accumulator.cpp_tag();
        format!(
            "// Reduction operator {name}\n\
             using {name}_base = cutlass::reduction::kernel::ReduceSplitK<\n    \
             cutlass::MatrixShape<{rows}, {cols}>,\n    \
             {epilogue},\n    \
             cutlass::reduction::thread::ReduceAdd<{acc}, {acc}, {count}>,\n    \
             {stage}\n  >;\n\n\
             struct {name}_type : public {name}_base {{ }};\n\
             FORGE_KERNEL_ENTRY({kernel}, {name}_type)\n",
            rows = self.shape.rows,
            cols = self.shape.columns * self.count,
            epilogue = self.epilogue.emit(),
            count = self.count,
            stage = PARTITIONS_PER_STAGE,
            kernel = self.kernel_name(),
        )
    }

    fn shared_memory_bytes(&self) -> u32 {
        0
    }
}

/// Arguments of a split-K reduction over a row-major `problem` matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionArguments {
    pub problem: MatrixCoord,
    pub partitions: i32,
    /// Distance between partitions in the workspace, in elements.
    pub partition_stride: i64,
    pub workspace: DevicePtr,
    pub destination: DevicePtr,
    pub source: DevicePtr,
    pub ld_workspace: i64,
    pub ld_destination: i64,
    pub ld_source: i64,
    pub alpha: f64,
    pub beta: f64,
}

impl ReductionArguments {
    /// Dense row-major arguments with `alpha = 1`, `beta = 0`.
    pub fn new(
        problem: MatrixCoord,
        partitions: i32,
        workspace: DevicePtr,
        destination: DevicePtr,
        source: DevicePtr,
    ) -> Self {
        let cols = problem.column as i64;
        Self {
            problem,
            partitions,
            partition_stride: problem.row as i64 * cols,
            workspace,
            destination,
            source,
            ld_workspace: cols,
            ld_destination: cols,
            ld_source: cols,
            alpha: 1.0,
            beta: 0.0,
        }
    }
}

impl Launchable<ReductionArguments> for ReductionOperation {
    fn pack_arguments(&self, args: &ReductionArguments) -> Result<Vec<u8>, ArgumentError> {
        self.validate_arguments(args)?;
        let mut buf = ArgumentBuffer::new();
        buf.push(&args.problem)
            .push_i32(args.partitions)
            .push_i64(args.partition_stride)
            .push_ptr(args.workspace)
            .push_i64(args.ld_workspace)
            .push_ptr(args.destination)
            .push_i64(args.ld_destination)
            .push_ptr(args.source)
            .push_i64(args.ld_source);
        self.epilogue.pack_scalars(args.alpha, args.beta, &mut buf)?;
        buf.finish()
    }

    fn launch_config(&self, args: &ReductionArguments, _device: &DeviceInfo) -> Result<LaunchConfig, ArgumentError> {
        self.validate_arguments(args)?;
        let cols_per_block = (self.shape.columns * self.count) as i64;
        Ok(LaunchConfig {
            grid: Dim3::new(
                ceil_div(args.problem.column as i64, cols_per_block) as u32,
                ceil_div(args.problem.row as i64, self.shape.rows as i64) as u32,
                1,
            ),
            block: Dim3::new(self.shape.columns, self.shape.rows, 1),
            shared_memory_bytes: 0,
        })
    }
}
