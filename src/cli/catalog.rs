//! Standard kernel configurations used by `emit` and `cache warm`.

use std::sync::Arc;

use crate::arguments::ArgumentError;
use crate::epilogue::EpilogueFunctor;
use crate::library::{DataType, LayoutType, MathInstruction, OpcodeClass, TensorDescription, TileDescription};
use crate::operation::{
    Conv2dOperation, ConvKind, GemmKind, GemmOperation, IteratorAlgorithm, Operation, ReductionOperation,
};

/// Element types the catalog has tile configurations for.
pub const CATALOG_DTYPES: &[DataType] = &[DataType::F16, DataType::BF16, DataType::F32];

/// Tile and operand alignment for `dtype`.
fn tile_for(dtype: DataType) -> Result<(TileDescription, u32), ArgumentError> {
    match dtype {
        DataType::F16 | DataType::BF16 => {
            let inst = MathInstruction::new([16, 8, 16], dtype, dtype, DataType::F32, OpcodeClass::TensorOp);
            Ok((TileDescription::new([128, 128, 32], 3, [2, 2, 1], inst), 8))
        }
        DataType::F32 => {
            let inst = MathInstruction::new([1, 1, 1], dtype, dtype, DataType::F32, OpcodeClass::Simt);
            Ok((TileDescription::new([128, 128, 8], 4, [2, 4, 1], inst), 1))
        }
        other => Err(ArgumentError::InvalidDescriptor(format!(
            "no catalog tile for {}",
            other
        ))),
    }
}

fn epilogue_for(dtype: DataType, alignment: u32) -> EpilogueFunctor {
    EpilogueFunctor::linear_combination(dtype, alignment, DataType::F32, DataType::F32)
}

/// Parse a BLAS-style layout pair such as `tn` into (A, B) layouts.
pub fn parse_layouts(s: &str) -> Option<(LayoutType, LayoutType)> {
    let mut chars = s.chars();
    let layout = |c: Option<char>| match c {
        Some('t') => Some(LayoutType::RowMajor),
        Some('n') => Some(LayoutType::ColumnMajor),
        _ => None,
    };
    let a = layout(chars.next())?;
    let b = layout(chars.next())?;
    if chars.next().is_some() {
        return None;
    }
    Some((a, b))
}

pub fn gemm(
    arch: u32,
    dtype: DataType,
    layouts: (LayoutType, LayoutType),
    kind: GemmKind,
) -> Result<GemmOperation, ArgumentError> {
    let (tile, align) = tile_for(dtype)?;
    GemmOperation::new(
        kind,
        arch,
        tile,
        TensorDescription::new(dtype, layouts.0, align),
        TensorDescription::new(dtype, layouts.1, align),
        TensorDescription::new(dtype, LayoutType::RowMajor, align),
        epilogue_for(dtype, align),
    )
}

pub fn conv2d(arch: u32, dtype: DataType, kind: ConvKind) -> Result<Conv2dOperation, ArgumentError> {
    let (tile, align) = tile_for(dtype)?;
    let nhwc = TensorDescription::new(dtype, LayoutType::TensorNhwc, align);
    Conv2dOperation::new(
        kind,
        IteratorAlgorithm::Optimized,
        arch,
        tile,
        nhwc,
        nhwc,
        nhwc,
        epilogue_for(dtype, align),
    )
}

/// Split-K reduction writing `dtype` with 128-bit accesses.
pub fn reduction(arch: u32, dtype: DataType) -> ReductionOperation {
    let per_access = (128 / dtype.bits()).max(1);
    ReductionOperation::new(arch, DataType::F32, epilogue_for(dtype, per_access))
}

/// Every standard configuration for `arch`.
pub fn standard_operations(arch: u32) -> Result<Vec<Arc<dyn Operation>>, ArgumentError> {
    let mut ops: Vec<Arc<dyn Operation>> = Vec::new();
    for &dtype in &[DataType::F16, DataType::BF16] {
        for layouts in ["tn", "nt", "nn", "tt"].iter().filter_map(|s| parse_layouts(s)) {
            ops.push(Arc::new(gemm(arch, dtype, layouts, GemmKind::Universal)?));
        }
        let tn = (LayoutType::RowMajor, LayoutType::ColumnMajor);
        ops.push(Arc::new(gemm(arch, dtype, tn, GemmKind::StreamK)?));
        for kind in [ConvKind::Fprop, ConvKind::Dgrad, ConvKind::Wgrad] {
            ops.push(Arc::new(conv2d(arch, dtype, kind)?));
        }
        ops.push(Arc::new(reduction(arch, dtype)));
    }
    let tn = (LayoutType::RowMajor, LayoutType::ColumnMajor);
    ops.push(Arc::new(gemm(arch, DataType::F32, tn, GemmKind::Universal)?));
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_layouts() {
        assert_eq!(
            parse_layouts("tn"),
            Some((LayoutType::RowMajor, LayoutType::ColumnMajor))
        );
        assert_eq!(
            parse_layouts("nn"),
            Some((LayoutType::ColumnMajor, LayoutType::ColumnMajor))
        );
        assert_eq!(parse_layouts("tnt"), None);
        assert_eq!(parse_layouts("x"), None);
    }

    #[test]
    fn test_standard_operations_have_unique_names() {
        let ops = standard_operations(80).unwrap();
        assert_eq!(ops.len(), 19);
        let names: HashSet<String> = ops.iter().map(|op| op.procedural_name()).collect();
        assert_eq!(names.len(), ops.len());
        assert!(ops.iter().all(|op| op.arch() == 80));
    }

    #[test]
    fn test_unsupported_dtype() {
        let tn = (LayoutType::RowMajor, LayoutType::ColumnMajor);
        assert!(gemm(80, DataType::S8, tn, GemmKind::Universal).is_err());
        assert!(conv2d(80, DataType::F64, ConvKind::Fprop).is_err());
    }

    #[test]
    fn test_reduction_uses_wide_accesses() {
        assert!(reduction(80, DataType::F16).procedural_name().ends_with("8x4x32"));
        assert!(reduction(80, DataType::F32).procedural_name().ends_with("4x4x32"));
    }
}
