//! Type descriptors shared by every kernel operation.
//!
//! These enums and structs name element types, layouts and tile shapes. They
//! drive both procedural kernel naming and template instantiation source.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Threads per warp (subgroup) assumed when sizing thread blocks.
pub const WARP_SIZE: u32 = 32;

/// Element data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    S8,
    U8,
    S32,
    F16,
    BF16,
    TF32,
    F32,
    F64,
}

impl DataType {
    /// Width of one element in bits.
    pub fn bits(self) -> u32 {
        match self {
            Self::S8 | Self::U8 => 8,
            Self::F16 | Self::BF16 => 16,
            Self::S32 | Self::TF32 | Self::F32 => 32,
            Self::F64 => 64,
        }
    }

    /// Width of one element in bytes.
    pub fn size_bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    /// Short name used in procedural kernel names.
    pub fn short_name(self) -> &'static str {
        match self {
            Self::S8 => "s8",
            Self::U8 => "u8",
            Self::S32 => "s32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::TF32 => "tf32",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    /// C++ type emitted into template instantiations.
    pub fn cpp_tag(self) -> &'static str {
        match self {
            Self::S8 => "int8_t",
            Self::U8 => "uint8_t",
            Self::S32 => "int32_t",
            Self::F16 => "cutlass::half_t",
            Self::BF16 => "cutlass::bfloat16_t",
            Self::TF32 => "cutlass::tfloat32_t",
            Self::F32 => "float",
            Self::F64 => "double",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::TF32 | Self::F32 | Self::F64)
    }

    pub fn is_integer(self) -> bool {
        !self.is_float()
    }

    /// Parse a short name such as `"f16"`.
    pub fn from_short_name(name: &str) -> Option<Self> {
        Some(match name {
            "s8" => Self::S8,
            "u8" => Self::U8,
            "s32" => Self::S32,
            "f16" => Self::F16,
            "bf16" => Self::BF16,
            "tf32" => Self::TF32,
            "f32" => Self::F32,
            "f64" => Self::F64,
            _ => return None,
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Memory layout of a tensor operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutType {
    RowMajor,
    ColumnMajor,
    TensorNhwc,
}

impl LayoutType {
    /// BLAS-style transpose letter (`t` row-major, `n` column-major).
    pub fn short_name(self) -> &'static str {
        match self {
            Self::RowMajor => "t",
            Self::ColumnMajor => "n",
            Self::TensorNhwc => "nhwc",
        }
    }

    pub fn cpp_tag(self) -> &'static str {
        match self {
            Self::RowMajor => "cutlass::layout::RowMajor",
            Self::ColumnMajor => "cutlass::layout::ColumnMajor",
            Self::TensorNhwc => "cutlass::layout::TensorNHWC",
        }
    }

    /// Leading dimension of a `rows x cols` matrix stored densely.
    pub fn leading_dim(self, rows: usize, cols: usize) -> usize {
        match self {
            Self::RowMajor | Self::TensorNhwc => cols,
            Self::ColumnMajor => rows,
        }
    }
}

/// Instruction family used by the mainloop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpcodeClass {
    Simt,
    TensorOp,
}

impl OpcodeClass {
    pub fn short_name(self) -> &'static str {
        match self {
            Self::Simt => "simt",
            Self::TensorOp => "tensorop",
        }
    }

    pub fn cpp_tag(self) -> &'static str {
        match self {
            Self::Simt => "cutlass::arch::OpClassSimt",
            Self::TensorOp => "cutlass::arch::OpClassTensorOp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathOperation {
    MultiplyAdd,
    MultiplyAddFastF32,
    MultiplyAddSaturate,
}

impl MathOperation {
    pub fn cpp_tag(self) -> &'static str {
        match self {
            Self::MultiplyAdd => "cutlass::arch::OpMultiplyAdd",
            Self::MultiplyAddFastF32 => "cutlass::arch::OpMultiplyAddFastF32",
            Self::MultiplyAddSaturate => "cutlass::arch::OpMultiplyAddSaturate",
        }
    }
}

/// Threadblock rasterization strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwizzlingFunctor {
    Identity1,
    Identity2,
    Identity4,
    Identity8,
    StreamK,
}

impl SwizzlingFunctor {
    /// log2 of the tile grouping along M.
    pub fn log_tile(self) -> u32 {
        match self {
            Self::Identity1 | Self::StreamK => 0,
            Self::Identity2 => 1,
            Self::Identity4 => 2,
            Self::Identity8 => 3,
        }
    }

    pub fn cpp_tag(self) -> &'static str {
        match self {
            Self::Identity1 => "cutlass::gemm::threadblock::GemmIdentityThreadblockSwizzle<1>",
            Self::Identity2 => "cutlass::gemm::threadblock::GemmIdentityThreadblockSwizzle<2>",
            Self::Identity4 => "cutlass::gemm::threadblock::GemmIdentityThreadblockSwizzle<4>",
            Self::Identity8 => "cutlass::gemm::threadblock::GemmIdentityThreadblockSwizzle<8>",
            Self::StreamK => "cutlass::gemm::threadblock::ThreadblockSwizzleStreamK",
        }
    }
}

/// Shape and element types of a single MMA instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MathInstruction {
    pub instruction_shape: [u32; 3],
    pub element_a: DataType,
    pub element_b: DataType,
    pub element_accumulator: DataType,
    pub opcode_class: OpcodeClass,
    pub math_operation: MathOperation,
}

impl MathInstruction {
    pub fn new(
        instruction_shape: [u32; 3],
        element_a: DataType,
        element_b: DataType,
        element_accumulator: DataType,
        opcode_class: OpcodeClass,
    ) -> Self {
        Self {
            instruction_shape,
            element_a,
            element_b,
            element_accumulator,
            opcode_class,
            math_operation: MathOperation::MultiplyAdd,
        }
    }

    /// Instruction shape rendered as `16816` (tensor op) or empty for SIMT.
    pub fn shape_name(&self) -> String {
        match self.opcode_class {
            OpcodeClass::Simt => String::new(),
            OpcodeClass::TensorOp => {
                let [m, n, k] = self.instruction_shape;
                format!("{}{}{}", m, n, k)
            }
        }
    }
}

/// Threadblock tiling and pipelining for one kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileDescription {
    pub threadblock_shape: [u32; 3],
    pub stages: u32,
    pub warp_count: [u32; 3],
    pub math_instruction: MathInstruction,
}

impl TileDescription {
    pub fn new(
        threadblock_shape: [u32; 3],
        stages: u32,
        warp_count: [u32; 3],
        math_instruction: MathInstruction,
    ) -> Self {
        Self {
            threadblock_shape,
            stages,
            warp_count,
            math_instruction,
        }
    }

    /// `128x128_32x3` style name.
    pub fn procedural_name(&self) -> String {
        let [m, n, k] = self.threadblock_shape;
        format!("{}x{}_{}x{}", m, n, k, self.stages)
    }

    /// Threads per threadblock.
    pub fn threads(&self) -> u32 {
        self.warp_count.iter().product::<u32>() * WARP_SIZE
    }

    /// Warp tile shape derived from threadblock shape and warp count.
    pub fn warp_shape(&self) -> [u32; 3] {
        let [m, n, k] = self.threadblock_shape;
        let [wm, wn, wk] = self.warp_count;
        [m / wm.max(1), n / wn.max(1), k / wk.max(1)]
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.threadblock_shape.iter().any(|&d| d == 0) {
            return Err(format!(
                "threadblock shape must be non-zero, got {:?}",
                self.threadblock_shape
            ));
        }
        if self.warp_count.iter().any(|&d| d == 0) {
            return Err(format!("warp count must be non-zero, got {:?}", self.warp_count));
        }
        if self.stages == 0 {
            return Err("stage count must be at least 1".into());
        }
        for (dim, (&tb, &wc)) in self
            .threadblock_shape
            .iter()
            .zip(self.warp_count.iter())
            .enumerate()
        {
            if tb % wc != 0 {
                return Err(format!(
                    "threadblock dim {} ({}) not divisible by warp count {}",
                    dim, tb, wc
                ));
            }
        }
        Ok(())
    }
}

/// Element type, layout and vector alignment of one operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDescription {
    pub element: DataType,
    pub layout: LayoutType,
    pub alignment: u32,
}

impl TensorDescription {
    pub fn new(element: DataType, layout: LayoutType, alignment: u32) -> Self {
        Self {
            element,
            layout,
            alignment,
        }
    }

    /// Alignment must be a power of two and fit a 128-bit access.
    pub fn validate(&self) -> Result<(), String> {
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(format!(
                "alignment {} is not a power of two",
                self.alignment
            ));
        }
        let access_bits = self.alignment * self.element.bits();
        if access_bits > 128 {
            return Err(format!(
                "alignment {} of {} is a {}-bit access (max 128)",
                self.alignment, self.element, access_bits
            ));
        }
        Ok(())
    }
}
