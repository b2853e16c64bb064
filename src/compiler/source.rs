//! Translation unit assembly.

use std::collections::HashSet;

use super::error::CompileError;
use crate::operation::Operation;

/// Prelude of every emitted module.
///
/// `FORGE_KERNEL_ENTRY` exports an unmangled entry point that runs one
/// kernel type with its dynamic shared memory.
pub const MODULE_HEADER: &str = r#"// Generated by kernel-forge. Do not edit.
#include "cutlass/cutlass.h"
#include "cutlass/gemm/device/gemm_universal.h"
#include "cutlass/gemm/kernel/default_gemm_universal.h"
#include "cutlass/gemm/kernel/default_gemm_grouped.h"
#include "cutlass/conv/kernel/default_conv2d_fprop.h"
#include "cutlass/conv/kernel/default_conv2d_dgrad.h"
#include "cutlass/conv/kernel/default_conv2d_wgrad.h"
#include "cutlass/reduction/kernel/reduce_split_k.h"
#include "cutlass/reduction/thread/reduction_operators.h"

#define FORGE_KERNEL_ENTRY(NAME, TYPE)                                    \
  extern "C" __global__ void NAME(typename TYPE::Params params) {         \
    extern __shared__ int forge_smem[];                                   \
    TYPE op;                                                              \
    op(params, *reinterpret_cast<typename TYPE::SharedStorage*>(forge_smem)); \
  }

"#;

/// A module ready for compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    pub source: String,
    /// Exported kernel symbols, in emission order.
    pub kernel_names: Vec<String>,
}

/// Build one translation unit from `ops`.
///
/// Operations sharing a procedural name are emitted once, at their first
/// position.
pub fn emit_module_source(ops: &[&dyn Operation]) -> Result<ModuleSource, CompileError> {
    if ops.is_empty() {
        return Err(CompileError::EmptyModule);
    }
    let mut seen = HashSet::new();
    let mut source = String::from(MODULE_HEADER);
    let mut kernel_names = Vec::new();
    for op in ops {
        if !seen.insert(op.procedural_name()) {
            continue;
        }
        source.push_str(&op.emit());
        source.push('\n');
        kernel_names.push(op.kernel_name());
    }
    Ok(ModuleSource {
        source,
        kernel_names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;

    struct Fake(&'static str);

    impl Operation for Fake {
        fn kind(&self) -> OperationKind {
            OperationKind::Gemm
        }
        fn arch(&self) -> u32 {
            80
        }
        fn procedural_name(&self) -> String {
            self.0.to_string()
        }
        fn emit(&self) -> String {
            format!("// body {}\n", self.0)
        }
        fn shared_memory_bytes(&self) -> u32 {
            0
        }
    }

    #[test]
    fn test_empty_module_is_rejected() {
        assert!(matches!(emit_module_source(&[]), Err(CompileError::EmptyModule)));
    }

    #[test]
    fn test_duplicates_are_emitted_once_in_order() {
        let (a, b) = (Fake("a"), Fake("b"));
        let module = emit_module_source(&[&b, &a, &b]).unwrap();
        assert_eq!(module.kernel_names, vec!["b_kernel", "a_kernel"]);
        assert_eq!(module.source.matches("// body b").count(), 1);
        let pos_b = module.source.find("// body b").unwrap();
        let pos_a = module.source.find("// body a").unwrap();
        assert!(pos_b < pos_a);
        assert!(module.source.starts_with(MODULE_HEADER));
    }
}
