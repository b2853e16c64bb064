//! Epilogue fusion helpers.
//!
//! An epilogue computes `D = activation(alpha * accum + beta * C)` as the
//! last stage of a GEMM or convolution. This module names the functor, emits
//! its C++ type and provides a host reference used to check device results.

use serde::{Deserialize, Serialize};

use crate::arguments::{ArgumentBuffer, ArgumentError, ScalarValue};
use crate::library::DataType;

/// Elementwise activation fused into the epilogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Identity,
    Relu,
    Gelu,
    Silu,
    Sigmoid,
    Tanh,
    HardSwish,
}

impl Activation {
    pub fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Relu => "relu",
            Self::Gelu => "gelu",
            Self::Silu => "silu",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::HardSwish => "hardswish",
        }
    }

    pub fn cpp_tag(self) -> &'static str {
        match self {
            Self::Identity => "cutlass::epilogue::thread::Identity",
            Self::Relu => "cutlass::epilogue::thread::ReLu",
            Self::Gelu => "cutlass::epilogue::thread::GELU_taylor",
            Self::Silu => "cutlass::epilogue::thread::SiLu",
            Self::Sigmoid => "cutlass::epilogue::thread::Sigmoid",
            Self::Tanh => "cutlass::epilogue::thread::Tanh",
            Self::HardSwish => "cutlass::epilogue::thread::HardSwish",
        }
    }

    /// Host reference of the activation.
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Identity => x,
            Self::Relu => x.max(0.0),
            Self::Gelu => {
                // tanh approximation, matching the Taylor device variant
                const K: f32 = 0.797_884_6; // sqrt(2/pi)
                0.5 * x * (1.0 + (K * (x + 0.044_715 * x * x * x)).tanh())
            }
            Self::Silu => x / (1.0 + (-x).exp()),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
            Self::HardSwish => x * (x + 3.0).clamp(0.0, 6.0) / 6.0,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "identity" => Self::Identity,
            "relu" => Self::Relu,
            "gelu" => Self::Gelu,
            "silu" => Self::Silu,
            "sigmoid" => Self::Sigmoid,
            "tanh" => Self::Tanh,
            "hardswish" => Self::HardSwish,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpilogueKind {
    #[default]
    LinearCombination,
    /// Saturates to the output type range before conversion.
    LinearCombinationClamp,
}

/// Epilogue functor attached to an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpilogueFunctor {
    pub kind: EpilogueKind,
    pub element_output: DataType,
    pub element_accumulator: DataType,
    pub element_epilogue: DataType,
    pub elements_per_access: u32,
    pub activation: Activation,
}

impl EpilogueFunctor {
    pub fn linear_combination(
        element_output: DataType,
        elements_per_access: u32,
        element_accumulator: DataType,
        element_epilogue: DataType,
    ) -> Self {
        Self {
            kind: EpilogueKind::LinearCombination,
            element_output,
            element_accumulator,
            element_epilogue,
            elements_per_access,
            activation: Activation::Identity,
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn clamped(mut self) -> Self {
        self.kind = EpilogueKind::LinearCombinationClamp;
        self
    }

    /// C++ type of the thread-level epilogue functor.
    pub fn emit(&self) -> String {
        let out = self.element_output.cpp_tag();
        let acc = self.element_accumulator.cpp_tag();
        let epi = self.element_epilogue.cpp_tag();
        let n = self.elements_per_access;
        match (self.kind, self.activation) {
            (EpilogueKind::LinearCombination, Activation::Identity) => format!(
                "cutlass::epilogue::thread::LinearCombination<{out}, {n}, {acc}, {epi}>"
            ),
            (EpilogueKind::LinearCombinationClamp, Activation::Identity) => format!(
                "cutlass::epilogue::thread::LinearCombinationClamp<{out}, {n}, {acc}, {epi}>"
            ),
            (_, act) => format!(
                "cutlass::epilogue::thread::LinearCombinationGeneric<{tag}, {out}, {n}, {acc}, {epi}>",
                tag = act.cpp_tag()
            ),
        }
    }

    /// Suffix appended to procedural names; empty for plain linear combination.
    pub fn procedural_suffix(&self) -> String {
        let mut suffix = String::new();
        if self.activation != Activation::Identity {
            suffix.push('_');
            suffix.push_str(self.activation.name());
        }
        if self.kind == EpilogueKind::LinearCombinationClamp {
            suffix.push_str("_clamp");
        }
        suffix
    }

    /// Host reference for one output element.
    pub fn apply(&self, alpha: f32, beta: f32, accum: f32, source: f32) -> f32 {
        let value = self.activation.apply(alpha * accum + beta * source);
        match self.kind {
            EpilogueKind::LinearCombination => value,
            EpilogueKind::LinearCombinationClamp => saturate(self.element_output, value),
        }
    }

    /// Pack `alpha, beta` as epilogue-typed scalars.
    pub fn pack_scalars(
        &self,
        alpha: f64,
        beta: f64,
        buf: &mut ArgumentBuffer,
    ) -> Result<(), ArgumentError> {
        buf.push_scalar(ScalarValue::from_f64(self.element_epilogue, alpha)?);
        buf.push_scalar(ScalarValue::from_f64(self.element_epilogue, beta)?);
        Ok(())
    }
}

fn saturate(dtype: DataType, value: f32) -> f32 {
    match dtype {
        DataType::S8 => value.round().clamp(i8::MIN as f32, i8::MAX as f32),
        DataType::U8 => value.round().clamp(0.0, u8::MAX as f32),
        DataType::S32 => value.round().clamp(i32::MIN as f32, i32::MAX as f32),
        DataType::F16 => value.clamp(-65504.0, 65504.0),
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f16_epilogue() -> EpilogueFunctor {
        EpilogueFunctor::linear_combination(DataType::F16, 8, DataType::F32, DataType::F32)
    }

    #[test]
    fn test_emit_plain_linear_combination() {
        let src = f16_epilogue().emit();
        assert_eq!(
            src,
            "cutlass::epilogue::thread::LinearCombination<cutlass::half_t, 8, float, float>"
        );
    }

    #[test]
    fn test_emit_fused_activation() {
        let src = f16_epilogue().with_activation(Activation::Relu).emit();
        assert!(src.starts_with("cutlass::epilogue::thread::LinearCombinationGeneric<"));
        assert!(src.contains("cutlass::epilogue::thread::ReLu"));
    }

    #[test]
    fn test_procedural_suffix() {
        assert_eq!(f16_epilogue().procedural_suffix(), "");
        let fused = f16_epilogue().with_activation(Activation::Silu).clamped();
        assert_eq!(fused.procedural_suffix(), "_silu_clamp");
    }

    #[test]
    fn test_host_reference() {
        let relu = f16_epilogue().with_activation(Activation::Relu);
        assert_eq!(relu.apply(2.0, 1.0, -3.0, 1.0), 0.0);
        assert_eq!(relu.apply(2.0, 0.5, 3.0, 2.0), 7.0);
        assert!((Activation::Sigmoid.apply(0.0) - 0.5).abs() < 1e-6);
        assert!((Activation::Gelu.apply(1.0) - 0.8412).abs() < 1e-3);
        assert_eq!(Activation::HardSwish.apply(-4.0), 0.0);
        assert_eq!(Activation::HardSwish.apply(4.0), 4.0);
    }

    #[test]
    fn test_clamp_saturates_integer_output() {
        let clamp =
            EpilogueFunctor::linear_combination(DataType::S8, 16, DataType::S32, DataType::F32)
                .clamped();
        assert_eq!(clamp.apply(1.0, 0.0, 300.0, 0.0), 127.0);
        assert_eq!(clamp.apply(1.0, 0.0, -300.0, 0.0), -128.0);
        assert_eq!(clamp.apply(0.5, 0.0, 5.0, 0.0), 3.0);
    }

    #[test]
    fn test_pack_scalars_uses_epilogue_type() {
        let epilogue =
            EpilogueFunctor::linear_combination(DataType::F16, 8, DataType::F16, DataType::F16);
        let mut buf = ArgumentBuffer::new();
        epilogue.pack_scalars(1.0, 0.0, &mut buf).unwrap();
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_activation_names_round_trip() {
        for act in [Activation::Relu, Activation::Gelu, Activation::HardSwish] {
            assert_eq!(Activation::from_name(act.name()), Some(act));
        }
    }
}
