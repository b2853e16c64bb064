//! `emit` subcommand: print the module source for one operation.

use crate::compiler::emit_module_source;
use crate::library::{DataType, LayoutType};
use crate::operation::{ConvKind, GemmKind, Operation};

use super::catalog::{self, CATALOG_DTYPES};
use super::{flag_value, EXIT_FAILURE, EXIT_OK};

/// Parsed `emit` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitRequest {
    pub target: EmitTarget,
    pub arch: u32,
    pub dtype: DataType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitTarget {
    Gemm {
        kind: GemmKind,
        layouts: (LayoutType, LayoutType),
    },
    Conv2d(ConvKind),
    Reduction,
}

impl EmitRequest {
    /// Parse `args` following `emit`, e.g. `gemm --arch 90 --layout nt`.
    pub fn parse(args: &[String], default_arch: u32) -> Result<Self, String> {
        let what = args.first().map(String::as_str).ok_or("Missing emit target")?;
        let arch = match flag_value(args, "--arch")? {
            Some(v) => v.parse().map_err(|_| format!("Invalid --arch: {}", v))?,
            None => default_arch,
        };
        let dtype = match flag_value(args, "--dtype")? {
            Some(v) => DataType::from_short_name(v)
                .filter(|d| CATALOG_DTYPES.contains(d))
                .ok_or_else(|| format!("Unsupported --dtype: {}", v))?,
            None => DataType::F16,
        };
        let target = match what {
            "gemm" => {
                let kind = match flag_value(args, "--kind")?.unwrap_or("universal") {
                    "universal" => GemmKind::Universal,
                    "streamk" | "stream-k" => GemmKind::StreamK,
                    "grouped" => GemmKind::Grouped,
                    other => return Err(format!("Unknown --kind: {}", other)),
                };
                let layout = flag_value(args, "--layout")?.unwrap_or("tn");
                let layouts = catalog::parse_layouts(layout)
                    .ok_or_else(|| format!("Invalid --layout: {}", layout))?;
                EmitTarget::Gemm { kind, layouts }
            }
            "conv2d" => {
                let kind = match flag_value(args, "--conv")?.unwrap_or("fprop") {
                    "fprop" => ConvKind::Fprop,
                    "dgrad" => ConvKind::Dgrad,
                    "wgrad" => ConvKind::Wgrad,
                    other => return Err(format!("Unknown --conv: {}", other)),
                };
                EmitTarget::Conv2d(kind)
            }
            "reduction" => EmitTarget::Reduction,
            other => return Err(format!("Unknown emit target: {}", other)),
        };
        Ok(Self { target, arch, dtype })
    }

    /// Build the operation and render its module.
    pub fn render(&self) -> Result<(String, String), String> {
        let op: Box<dyn Operation> = match self.target {
            EmitTarget::Gemm { kind, layouts } => Box::new(
                catalog::gemm(self.arch, self.dtype, layouts, kind).map_err(|e| e.to_string())?,
            ),
            EmitTarget::Conv2d(kind) => {
                Box::new(catalog::conv2d(self.arch, self.dtype, kind).map_err(|e| e.to_string())?)
            }
            EmitTarget::Reduction => Box::new(catalog::reduction(self.arch, self.dtype)),
        };
        let module = emit_module_source(&[op.as_ref()]).map_err(|e| e.to_string())?;
        Ok((op.kernel_name(), module.source))
    }
}

/// Run `emit`. Prints the module source to stdout.
pub fn run_emit(args: &[String], default_arch: u32) -> i32 {
    let rendered = EmitRequest::parse(args, default_arch).and_then(|req| req.render());
    match rendered {
        Ok((kernel, source)) => {
            eprintln!("// kernel: {}", kernel);
            print!("{}", source);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("{}", e);
            EXIT_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_gemm_defaults() {
        let req = EmitRequest::parse(&args(&["gemm"]), 80).unwrap();
        assert_eq!(req.arch, 80);
        assert_eq!(req.dtype, DataType::F16);
        assert_eq!(
            req.target,
            EmitTarget::Gemm {
                kind: GemmKind::Universal,
                layouts: (LayoutType::RowMajor, LayoutType::ColumnMajor)
            }
        );
    }

    #[test]
    fn test_parse_options() {
        let req = EmitRequest::parse(
            &args(&["conv2d", "--conv", "wgrad", "--arch", "90", "--dtype", "bf16"]),
            80,
        )
        .unwrap();
        assert_eq!(req.target, EmitTarget::Conv2d(ConvKind::Wgrad));
        assert_eq!(req.arch, 90);
        assert_eq!(req.dtype, DataType::BF16);
    }

    #[test]
    fn test_parse_errors() {
        assert!(EmitRequest::parse(&args(&[]), 80).is_err());
        assert!(EmitRequest::parse(&args(&["softmax"]), 80).is_err());
        assert!(EmitRequest::parse(&args(&["gemm", "--dtype", "s8"]), 80).is_err());
        assert!(EmitRequest::parse(&args(&["gemm", "--layout", "xx"]), 80).is_err());
        assert!(EmitRequest::parse(&args(&["gemm", "--arch", "sm80"]), 80).is_err());
    }

    #[test]
    fn test_render_contains_entry_point() {
        let req = EmitRequest::parse(&args(&["gemm", "--kind", "streamk"]), 80).unwrap();
        let (kernel, source) = req.render().unwrap();
        assert!(kernel.ends_with("_kernel"));
        assert!(source.contains(&format!("FORGE_KERNEL_ENTRY({}", kernel)));

        let (kernel, _) = EmitRequest::parse(&args(&["reduction", "--dtype", "f32"]), 80)
            .unwrap()
            .render()
            .unwrap();
        assert!(kernel.starts_with("cutlass_sm80_reduce_split_k_f32_f32"));
    }
}
