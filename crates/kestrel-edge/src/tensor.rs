//! Tensor element types, affine quantization parameters and the non-owning
//! views the session hands out over arena and model memory.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Shape with inline storage for up to four dimensions (NHWC covers every
/// tensor a vision graph declares).
pub type Shape = SmallVec<[usize; 4]>;

/// Element types a model may declare for its tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 8-bit signed integer (quantized activations and weights)
    I8,
    /// 8-bit unsigned integer (legacy quantized models)
    U8,
    /// 16-bit signed integer
    I16,
    /// 32-bit signed integer (quantized biases)
    I32,
    /// 32-bit IEEE 754 float
    F32,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DType::I8 | DType::U8 => 1,
            DType::I16 => 2,
            DType::I32 | DType::F32 => 4,
        }
    }

    /// Bytes needed to store `n` elements.
    pub fn storage_bytes(&self, n: usize) -> usize {
        self.element_size() * n
    }

    /// Whether this is one of the two 8-bit quantized types.
    pub fn is_quantized_8bit(&self) -> bool {
        matches!(self, DType::I8 | DType::U8)
    }

    /// String tag used in the model header.
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::F32 => "f32",
        }
    }

    /// Parse from string tag.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "i8" => Some(DType::I8),
            "u8" => Some(DType::U8),
            "i16" => Some(DType::I16),
            "i32" => Some(DType::I32),
            "f32" => Some(DType::F32),
            _ => None,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Affine quantization pair: `real = (raw - zero_point) * scale`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    /// Parameters that leave raw values unchanged.
    pub const IDENTITY: QuantParams = QuantParams { scale: 1.0, zero_point: 0 };

    pub fn new(scale: f32, zero_point: i32) -> Self {
        Self { scale, zero_point }
    }
}

impl Default for QuantParams {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Read-only view of one tensor's bytes.
///
/// Points either into the arena (activations, graph inputs and outputs) or
/// into the model's constant blob (weights, biases).
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    pub name: &'a str,
    pub dtype: DType,
    pub shape: &'a [usize],
    pub quant: QuantParams,
    data: &'a [u8],
}

impl<'a> TensorView<'a> {
    pub fn new(name: &'a str, dtype: DType, shape: &'a [usize], quant: QuantParams, data: &'a [u8]) -> Self {
        Self { name, dtype, shape, quant, data }
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Raw backing bytes.
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Elements as `i8` (only for `I8` tensors).
    pub fn as_i8(&self) -> Option<&'a [i8]> {
        if self.dtype != DType::I8 {
            return None;
        }
        Some(bytemuck::cast_slice(self.data))
    }

    /// Elements as `u8` (only for `U8` tensors).
    pub fn as_u8(&self) -> Option<&'a [u8]> {
        if self.dtype != DType::U8 {
            return None;
        }
        Some(self.data)
    }

    /// Elements as `i32`. `None` for other dtypes or when the backing bytes are
    /// not 4-byte aligned in memory.
    pub fn as_i32(&self) -> Option<&'a [i32]> {
        if self.dtype != DType::I32 {
            return None;
        }
        bytemuck::try_cast_slice(self.data).ok()
    }

    /// Elements as `f32`, with the same alignment caveat as [`Self::as_i32`].
    pub fn as_f32(&self) -> Option<&'a [f32]> {
        if self.dtype != DType::F32 {
            return None;
        }
        bytemuck::try_cast_slice(self.data).ok()
    }
}

/// Writable view of one arena-resident tensor.
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    pub name: &'a str,
    pub dtype: DType,
    pub shape: &'a [usize],
    pub quant: QuantParams,
    data: &'a mut [u8],
}

impl<'a> TensorViewMut<'a> {
    pub fn new(name: &'a str, dtype: DType, shape: &'a [usize], quant: QuantParams, data: &'a mut [u8]) -> Self {
        Self { name, dtype, shape, quant, data }
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn bytes(&self) -> &[u8] {
        self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.data
    }

    pub fn as_i8_mut(&mut self) -> Option<&mut [i8]> {
        if self.dtype != DType::I8 {
            return None;
        }
        Some(bytemuck::cast_slice_mut(self.data))
    }

    pub fn as_u8_mut(&mut self) -> Option<&mut [u8]> {
        if self.dtype != DType::U8 {
            return None;
        }
        Some(self.data)
    }

    pub fn as_i32_mut(&mut self) -> Option<&mut [i32]> {
        if self.dtype != DType::I32 {
            return None;
        }
        bytemuck::try_cast_slice_mut(self.data).ok()
    }

    /// Reborrow as a read-only view.
    pub fn as_view(&self) -> TensorView<'_> {
        TensorView::new(self.name, self.dtype, self.shape, self.quant, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_storage() {
        assert_eq!(DType::I8.storage_bytes(10), 10);
        assert_eq!(DType::I16.storage_bytes(10), 20);
        assert_eq!(DType::I32.storage_bytes(10), 40);
        assert_eq!(DType::F32.storage_bytes(3), 12);
    }

    #[test]
    fn test_dtype_tags() {
        for dt in &[DType::I8, DType::U8, DType::I16, DType::I32, DType::F32] {
            assert_eq!(DType::from_str(dt.as_str()), Some(*dt));
        }
        assert_eq!(DType::from_str("f16"), None);
    }

    #[test]
    fn test_dtype_serde_tag() {
        let json = serde_json::to_string(&DType::I8).unwrap();
        assert_eq!(json, "\"i8\"");
        let back: DType = serde_json::from_str("\"u8\"").unwrap();
        assert_eq!(back, DType::U8);
    }

    #[test]
    fn test_view_typed_access() {
        let shape = [2usize, 2];
        let data = [0x80u8, 0x7f, 0x00, 0xff];
        let view = TensorView::new("t", DType::I8, &shape, QuantParams::IDENTITY, &data);
        assert_eq!(view.numel(), 4);
        assert_eq!(view.as_i8().unwrap(), &[-128, 127, 0, -1]);
        assert!(view.as_u8().is_none());
    }

    #[test]
    fn test_view_mut_writes_through() {
        let shape = [3usize];
        let mut data = [0u8; 3];
        {
            let mut view = TensorViewMut::new("t", DType::I8, &shape, QuantParams::IDENTITY, &mut data);
            view.as_i8_mut().unwrap().copy_from_slice(&[-1, 0, 1]);
            assert_eq!(view.as_view().as_i8().unwrap(), &[-1, 0, 1]);
        }
        assert_eq!(data, [0xff, 0x00, 0x01]);
    }
}
