//! Host-side tensor value passed through the attention dispatch path.
//!
//! A `Tensor` carries its shape, element type, the device it is resident on
//! and its storage. Storage always lives in host memory; the `Device` tag is
//! what the dispatcher's residency gate inspects.

use std::fmt;

use half::{bf16, f16};

use crate::backend_trait::{AttentionError, AttentionResult};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    BF16,
    Bool,
}

impl DType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
            Self::Bool => "bool",
        }
    }

    /// 16-bit floating point types accepted by the optimized kernel.
    #[inline(always)]
    pub fn is_half(&self) -> bool {
        matches!(self, Self::F16 | Self::BF16)
    }

    #[inline(always)]
    pub fn is_float(&self) -> bool {
        !matches!(self, Self::Bool)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Device a tensor is resident on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl Device {
    #[inline(always)]
    pub fn is_cuda(&self) -> bool {
        matches!(self, Self::Cuda(_))
    }

    /// Accelerator ordinal, `None` for host memory.
    pub fn ordinal(&self) -> Option<usize> {
        match self {
            Self::Cpu => None,
            Self::Cuda(ordinal) => Some(*ordinal),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

/// Typed element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    Bool(Vec<bool>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::F16(_) => DType::F16,
            Self::BF16(_) => DType::BF16,
            Self::Bool(_) => DType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::F16(v) => v.len(),
            Self::BF16(v) => v.len(),
            Self::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode f32 values into storage of the requested dtype.
    pub fn from_f32(values: &[f32], dtype: DType) -> Self {
        match dtype {
            DType::F32 => Self::F32(values.to_vec()),
            DType::F16 => Self::F16(values.iter().copied().map(f16::from_f32).collect()),
            DType::BF16 => Self::BF16(values.iter().copied().map(bf16::from_f32).collect()),
            DType::Bool => Self::Bool(values.iter().map(|&x| x != 0.0).collect()),
        }
    }

    /// Widen every element to f32 (`true` -> 1.0).
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Self::F32(v) => v.clone(),
            Self::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            Self::BF16(v) => v.iter().map(|x| x.to_f32()).collect(),
            Self::Bool(v) => v.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect(),
        }
    }
}

/// Dense row-major tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
    device: Device,
}

impl Tensor {
    /// Build a tensor, checking that the element count matches the shape.
    pub fn new(shape: impl Into<Vec<usize>>, data: TensorData, device: Device) -> AttentionResult<Self> {
        let shape = shape.into();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(AttentionError::Shape(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data, device })
    }

    pub fn from_f32(shape: impl Into<Vec<usize>>, values: Vec<f32>) -> AttentionResult<Self> {
        Self::new(shape, TensorData::F32(values), Device::Cpu)
    }

    pub fn from_f16(shape: impl Into<Vec<usize>>, values: Vec<f16>) -> AttentionResult<Self> {
        Self::new(shape, TensorData::F16(values), Device::Cpu)
    }

    pub fn from_bf16(shape: impl Into<Vec<usize>>, values: Vec<bf16>) -> AttentionResult<Self> {
        Self::new(shape, TensorData::BF16(values), Device::Cpu)
    }

    pub fn from_bool(shape: impl Into<Vec<usize>>, values: Vec<bool>) -> AttentionResult<Self> {
        Self::new(shape, TensorData::Bool(values), Device::Cpu)
    }

    pub fn zeros(shape: impl Into<Vec<usize>>, dtype: DType, device: Device) -> Self {
        let shape = shape.into();
        let numel = shape.iter().product::<usize>();
        Self {
            data: TensorData::from_f32(&vec![0.0; numel], dtype),
            shape,
            device,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Size of the innermost dimension (the head dimension for q/k/v).
    pub fn head_dim(&self) -> Option<usize> {
        self.shape.last().copied()
    }

    /// Same storage, tagged as resident on `device`.
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Convert the element type, rounding through f32.
    pub fn to_dtype(&self, dtype: DType) -> Self {
        if self.dtype() == dtype {
            return self.clone();
        }
        Self {
            shape: self.shape.clone(),
            data: TensorData::from_f32(&self.data.to_f32_vec(), dtype),
            device: self.device,
        }
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data.to_f32_vec()
    }
}
