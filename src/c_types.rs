// Copyright 2024-2026 Kernel Forge Contributors
// Licensed under the Apache License, Version 2.0

//! C-compatible descriptors passed by value into kernel parameter blocks.
//!
//! Every struct here is `#[repr(C)]` and made only of 32-bit fields, so its
//! byte image matches the device-side struct without padding surprises.

/// Marker for plain-old-data structs that may be viewed as raw bytes.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no padding bytes and hold no
/// pointers or references with lifetimes.
pub unsafe trait CStruct: Copy + 'static {}

/// View a `CStruct` as its raw byte image.
pub fn bytes_of<T: CStruct>(value: &T) -> &[u8] {
    // SAFETY: CStruct guarantees a padding-free repr(C) layout, so every byte
    // in the range is initialized.
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

/// GEMM problem extent.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GemmCoord {
    pub m: i32,
    pub n: i32,
    pub k: i32,
}

impl GemmCoord {
    pub fn new(m: i32, n: i32, k: i32) -> Self {
        Self { m, n, k }
    }

    /// Multiply-accumulate count.
    pub fn mnk(&self) -> i64 {
        self.m as i64 * self.n as i64 * self.k as i64
    }

    pub fn is_empty(&self) -> bool {
        self.m <= 0 || self.n <= 0 || self.k <= 0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MatrixCoord {
    pub row: i32,
    pub column: i32,
}

impl MatrixCoord {
    pub fn new(row: i32, column: i32) -> Self {
        Self { row, column }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Tensor4DCoord {
    pub n: i32,
    pub h: i32,
    pub w: i32,
    pub c: i32,
}

impl Tensor4DCoord {
    pub fn new(n: i32, h: i32, w: i32, c: i32) -> Self {
        Self { n, h, w, c }
    }

    pub fn numel(&self) -> i64 {
        self.n as i64 * self.h as i64 * self.w as i64 * self.c as i64
    }
}

/// Grid or block extent.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    pub fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl Default for Dim3 {
    fn default() -> Self {
        Self::linear(1)
    }
}

/// Cross-correlation (the deep learning convention).
pub const CONV_MODE_CROSS_CORRELATION: i32 = 0;
/// True convolution (filter flipped).
pub const CONV_MODE_CONVOLUTION: i32 = 1;

/// 2-D convolution problem size with derived output extent.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Conv2dProblemSize {
    pub n: i32,
    pub h: i32,
    pub w: i32,
    pub c: i32,
    pub k: i32,
    pub r: i32,
    pub s: i32,
    pub pad_h: i32,
    pub pad_w: i32,
    pub stride_h: i32,
    pub stride_w: i32,
    pub dilation_h: i32,
    pub dilation_w: i32,
    pub p: i32,
    pub q: i32,
    pub mode: i32,
    pub split_k_slices: i32,
    pub groups: i32,
}

impl Conv2dProblemSize {
    /// Build a problem from NHWC input and KRSC filter extents.
    ///
    /// `padding`, `stride` and `dilation` are `(h, w)` pairs.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input: Tensor4DCoord,
        filter: Tensor4DCoord,
        padding: (i32, i32),
        stride: (i32, i32),
        dilation: (i32, i32),
        mode: i32,
        split_k_slices: i32,
        groups: i32,
    ) -> Self {
        let p = output_extent(input.h, filter.h, padding.0, stride.0, dilation.0);
        let q = output_extent(input.w, filter.w, padding.1, stride.1, dilation.1);
        Self {
            n: input.n,
            h: input.h,
            w: input.w,
            c: input.c,
            k: filter.n,
            r: filter.h,
            s: filter.w,
            pad_h: padding.0,
            pad_w: padding.1,
            stride_h: stride.0,
            stride_w: stride.1,
            dilation_h: dilation.0,
            dilation_w: dilation.1,
            p,
            q,
            mode,
            split_k_slices,
            groups,
        }
    }

    pub fn activation_extent(&self) -> Tensor4DCoord {
        Tensor4DCoord::new(self.n, self.h, self.w, self.c)
    }

    pub fn filter_extent(&self) -> Tensor4DCoord {
        Tensor4DCoord::new(self.k, self.r, self.s, self.c / self.groups.max(1))
    }

    pub fn output_extent(&self) -> Tensor4DCoord {
        Tensor4DCoord::new(self.n, self.p, self.q, self.k)
    }

    pub fn has_unit_stride(&self) -> bool {
        self.stride_h == 1 && self.stride_w == 1
    }

    pub fn validate(&self) -> Result<(), String> {
        let extents = [self.n, self.h, self.w, self.c, self.k, self.r, self.s];
        if extents.iter().any(|&d| d <= 0) {
            return Err(format!("conv extents must be positive: {:?}", self));
        }
        if self.stride_h <= 0 || self.stride_w <= 0 {
            return Err("stride must be positive".into());
        }
        if self.dilation_h <= 0 || self.dilation_w <= 0 {
            return Err("dilation must be positive".into());
        }
        if self.pad_h < 0 || self.pad_w < 0 {
            return Err("padding must be non-negative".into());
        }
        if self.p <= 0 || self.q <= 0 {
            return Err(format!(
                "filter {}x{} does not fit padded input {}x{}",
                self.r, self.s, self.h, self.w
            ));
        }
        if self.groups <= 0 || self.c % self.groups != 0 || self.k % self.groups != 0 {
            return Err(format!(
                "groups {} must divide both C ({}) and K ({})",
                self.groups, self.c, self.k
            ));
        }
        if self.split_k_slices <= 0 {
            return Err("split_k_slices must be at least 1".into());
        }
        let products = [
            ("N*P*Q", [self.n, self.p, self.q]),
            ("N*H*W", [self.n, self.h, self.w]),
            ("R*S*C", [self.r, self.s, self.c]),
            ("K*R*S", [self.k, self.r, self.s]),
        ];
        for (name, dims) in products {
            let product: i64 = dims.iter().map(|&d| i64::from(d)).product();
            if product > i64::from(i32::MAX) {
                return Err(format!("implicit GEMM extent {name} = {product} overflows i32"));
            }
        }
        Ok(())
    }
}

/// Output rows or columns of a convolution; 0 when the dilated filter does
/// not fit the padded input.
fn output_extent(input: i32, filter: i32, pad: i32, stride: i32, dilation: i32) -> i32 {
    if stride <= 0 {
        return 0;
    }
    let span = i64::from(input) + 2 * i64::from(pad)
        - i64::from(dilation) * (i64::from(filter) - 1)
        - 1;
    if span < 0 {
        return 0;
    }
    i32::try_from(span / i64::from(stride) + 1).unwrap_or(0)
}

// SAFETY: all of the above are repr(C) and consist solely of 32-bit integers.
unsafe impl CStruct for GemmCoord {}
unsafe impl CStruct for MatrixCoord {}
unsafe impl CStruct for Tensor4DCoord {}
unsafe impl CStruct for Dim3 {}
unsafe impl CStruct for Conv2dProblemSize {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemm_coord_bytes() {
        let coord = GemmCoord::new(1, 2, 3);
        let bytes = bytes_of(&coord);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &1i32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &3i32.to_ne_bytes());
    }

    #[test]
    fn test_conv_output_extent_same_padding() {
        let problem = Conv2dProblemSize::new(
            Tensor4DCoord::new(1, 56, 56, 64),
            Tensor4DCoord::new(128, 3, 3, 64),
            (1, 1),
            (1, 1),
            (1, 1),
            CONV_MODE_CROSS_CORRELATION,
            1,
            1,
        );
        assert_eq!((problem.p, problem.q), (56, 56));
        assert!(problem.validate().is_ok());
    }

    #[test]
    fn test_conv_output_extent_strided_dilated() {
        let problem = Conv2dProblemSize::new(
            Tensor4DCoord::new(2, 32, 30, 8),
            Tensor4DCoord::new(16, 3, 3, 8),
            (0, 0),
            (2, 2),
            (2, 1),
            CONV_MODE_CROSS_CORRELATION,
            1,
            1,
        );
        // (32 - 4 - 1) / 2 + 1 = 14, (30 - 2 - 1) / 2 + 1 = 14
        assert_eq!((problem.p, problem.q), (14, 14));
        assert_eq!(problem.output_extent(), Tensor4DCoord::new(2, 14, 14, 16));
    }

    #[test]
    fn test_conv_validation_rejects_oversized_filter() {
        let problem = Conv2dProblemSize::new(
            Tensor4DCoord::new(1, 2, 2, 8),
            Tensor4DCoord::new(8, 5, 5, 8),
            (0, 0),
            (1, 1),
            (1, 1),
            CONV_MODE_CROSS_CORRELATION,
            1,
            1,
        );
        assert!(problem.validate().is_err());
    }

    #[test]
    fn test_conv_strided_filter_wider_than_input_has_no_output() {
        // (4 - 5 - 1) / 3 truncates toward zero; the extent must still be 0.
        let problem = Conv2dProblemSize::new(
            Tensor4DCoord::new(1, 4, 4, 8),
            Tensor4DCoord::new(8, 6, 6, 8),
            (0, 0),
            (3, 3),
            (1, 1),
            CONV_MODE_CROSS_CORRELATION,
            1,
            1,
        );
        assert_eq!((problem.p, problem.q), (0, 0));
        assert!(problem.validate().is_err());
    }

    #[test]
    fn test_conv_validation_rejects_i32_overflowing_gemm_extent() {
        let problem = Conv2dProblemSize::new(
            Tensor4DCoord::new(4096, 1024, 1024, 8),
            Tensor4DCoord::new(8, 1, 1, 8),
            (0, 0),
            (1, 1),
            (1, 1),
            CONV_MODE_CROSS_CORRELATION,
            1,
            1,
        );
        assert_eq!((problem.p, problem.q), (1024, 1024));
        let err = problem.validate().unwrap_err();
        assert!(err.contains("overflows i32"), "{err}");
    }

    #[test]
    fn test_conv_problem_is_padding_free() {
        assert_eq!(std::mem::size_of::<Conv2dProblemSize>(), 18 * 4);
    }
}
