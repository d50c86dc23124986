//! Quantization codec.
//!
//! Camera frames arrive as unsigned 8-bit samples while the model's input
//! tensor is signed 8-bit, so every sample is shifted by 128 before
//! invocation. The shift is a flip of the sign bit, which keeps the encode
//! path exact and free of floating point.
//!
//! On the way out, raw quantized outputs are mapped to real scores with the
//! output tensor's own affine parameters: `real = (raw - zero_point) * scale`.

use crate::tensor::{DType, QuantParams, TensorView, TensorViewMut};

/// Unsigned sample to signed tensor value (`u - 128` modulo 256).
#[inline]
pub fn to_signed(sample: u8) -> i8 {
    (sample ^ 0x80) as i8
}

/// Inverse of [`to_signed`].
#[inline]
pub fn to_unsigned(value: i8) -> u8 {
    (value as u8) ^ 0x80
}

/// Write `raw` into the signed 8-bit input tensor.
///
/// `raw.len()` must equal the tensor's element count (rows x cols x channels).
pub fn encode_input(raw: &[u8], input: &mut TensorViewMut<'_>) -> Result<(), CodecError> {
    let expected = input.numel();
    if raw.len() != expected {
        return Err(CodecError::LengthMismatch { expected, actual: raw.len() });
    }
    let dtype = input.dtype;
    let dst = input
        .as_i8_mut()
        .ok_or(CodecError::UnsupportedType(dtype))?;
    for (d, &s) in dst.iter_mut().zip(raw) {
        *d = to_signed(s);
    }
    Ok(())
}

/// Affine dequantization of a single raw value.
#[inline]
pub fn dequantize(raw: i32, params: QuantParams) -> f32 {
    (raw as i64 - params.zero_point as i64) as f32 * params.scale
}

/// Calibrated score for `class_index` of an 8-bit output tensor.
///
/// Signedness follows the tensor's declared dtype. Non-8-bit tensors decode
/// as `NaN`. Panics if `class_index` is outside the view.
pub fn decode_score(output: &TensorView<'_>, class_index: usize) -> f32 {
    let raw = match output.dtype {
        DType::I8 => output.bytes()[class_index] as i8 as i32,
        DType::U8 => output.bytes()[class_index] as i32,
        _ => return f32::NAN,
    };
    dequantize(raw, output.quant)
}

/// Decode `N` consecutive class scores starting at `first_class`.
pub fn decode_scores<const N: usize>(output: &TensorView<'_>, first_class: usize) -> [f32; N] {
    std::array::from_fn(|i| decode_score(output, first_class + i))
}

/// Errors raised while moving data between frames and tensors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("frame has {actual} samples but the input tensor expects {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("input tensor has element type {0}, expected i8")]
    UnsupportedType(DType),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f32, b: f32) {
        assert!((a - b).abs() < 1e-6, "{} vs {}", a, b);
    }

    #[test]
    fn test_encode_matches_wraparound_for_all_samples() {
        for u in 0..=255u8 {
            let expected = (u as i16 - 128) as i8;
            assert_eq!(to_signed(u), expected, "sample {}", u);
            assert_eq!(to_unsigned(to_signed(u)), u, "round trip {}", u);
        }
    }

    #[test]
    fn test_encode_known_points() {
        assert_eq!(to_signed(0), -128);
        assert_eq!(to_signed(128), 0);
        assert_eq!(to_signed(255), 127);
    }

    #[test]
    fn test_encode_input_writes_tensor() {
        let shape = [1usize, 2, 2, 1];
        let mut buf = [0u8; 4];
        let mut view = TensorViewMut::new("input", DType::I8, &shape, QuantParams::IDENTITY, &mut buf);
        encode_input(&[0, 127, 128, 255], &mut view).unwrap();
        assert_eq!(view.as_view().as_i8().unwrap(), &[-128, -1, 0, 127]);
    }

    #[test]
    fn test_encode_input_rejects_wrong_length() {
        let shape = [4usize];
        let mut buf = [0u8; 4];
        let mut view = TensorViewMut::new("input", DType::I8, &shape, QuantParams::IDENTITY, &mut buf);
        let err = encode_input(&[1, 2, 3], &mut view).unwrap_err();
        assert_eq!(err, CodecError::LengthMismatch { expected: 4, actual: 3 });
        assert_eq!(buf, [0u8; 4]);
    }

    #[test]
    fn test_encode_input_rejects_unsigned_tensor() {
        let shape = [2usize];
        let mut buf = [0u8; 2];
        let mut view = TensorViewMut::new("input", DType::U8, &shape, QuantParams::IDENTITY, &mut buf);
        assert_eq!(
            encode_input(&[1, 2], &mut view),
            Err(CodecError::UnsupportedType(DType::U8))
        );
    }

    #[test]
    fn test_decode_signed_output() {
        let shape = [1usize, 3];
        let data = [0u8, 0x80, 0x7f]; // 0, -128, 127
        let q = QuantParams::new(0.00390625, -128);
        let view = TensorView::new("out", DType::I8, &shape, q, &data);
        assert_close(decode_score(&view, 0), 0.5);
        assert_close(decode_score(&view, 1), 0.0);
        assert_close(decode_score(&view, 2), 255.0 * 0.00390625);
    }

    #[test]
    fn test_decode_unsigned_output() {
        let shape = [2usize];
        let data = [0u8, 255];
        let q = QuantParams::new(1.0 / 255.0, 0);
        let view = TensorView::new("out", DType::U8, &shape, q, &data);
        assert_close(decode_score(&view, 0), 0.0);
        assert_close(decode_score(&view, 1), 1.0);
    }

    #[test]
    fn test_decode_reads_params_from_tensor() {
        let shape = [1usize];
        let data = [10u8];
        let a = TensorView::new("a", DType::I8, &shape, QuantParams::new(0.5, 0), &data);
        let b = TensorView::new("b", DType::I8, &shape, QuantParams::new(2.0, 4), &data);
        assert_close(decode_score(&a, 0), 5.0);
        assert_close(decode_score(&b, 0), 12.0);
    }

    #[test]
    fn test_decode_monotonic_in_raw() {
        for &(scale, zp) in &[(0.00390625f32, -128i32), (0.1, 0), (0.02, 17), (1.5, -3)] {
            let q = QuantParams::new(scale, zp);
            let mut prev = f32::NEG_INFINITY;
            for raw in -128..=127i32 {
                let v = dequantize(raw, q);
                assert!(v >= prev, "scale={} zp={} raw={}", scale, zp, raw);
                prev = v;
            }
        }
    }

    #[test]
    fn test_decode_scores_window() {
        let shape = [1usize, 10];
        let data: Vec<u8> = (0..10).map(|i| i as u8).collect();
        let view = TensorView::new("out", DType::I8, &shape, QuantParams::IDENTITY, &data);
        let scores: [f32; 6] = decode_scores(&view, 0);
        assert_eq!(scores, [0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_dequantize_extreme_zero_point() {
        let low = QuantParams::new(1.0, i32::MIN);
        assert_close(dequantize(127, low) / 1e9, (127.0 - i32::MIN as f64) as f32 / 1e9);
        let high = QuantParams::new(1.0, i32::MAX);
        assert_close(dequantize(-128, high) / 1e9, (-128.0 - i32::MAX as f64) as f32 / 1e9);
    }
}
