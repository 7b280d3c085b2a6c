use std::fmt;

use thiserror::Error;

use crate::tensor::{DType, Tensor};

/// Errors raised by a reference attention implementation.
///
/// These are the only errors that cross the dispatcher: they propagate to the
/// caller exactly as the reference produced them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttentionError {
    #[error("invalid shape: {0}")]
    Shape(String),
    #[error("unsupported dtype: {0}")]
    DType(String),
    #[error("invalid attention mask: {0}")]
    Mask(String),
    #[error("dropout probability must be in [0, 1), got {0}")]
    Dropout(f32),
    #[error("attention backend error: {0}")]
    Backend(String),
}

pub type AttentionResult<T> = Result<T, AttentionError>;

/// Errors raised on the optimized path. Always absorbed by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("failed to load optimized kernel: {0}")]
    Load(String),
    #[error("kernel compilation failed: {0}")]
    Compile(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("kernel runtime error: {0}")]
    Runtime(String),
    #[error("out of device memory: {0}")]
    OutOfMemory(String),
    #[error("unsupported by kernel: {0}")]
    Unsupported(String),
    #[error("kernel panicked: {0}")]
    Panic(String),
}

impl KernelError {
    /// Stable category name, used as the log dedup key.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Load(_) => "LoadError",
            Self::Compile(_) => "CompileError",
            Self::ShapeMismatch(_) => "ShapeMismatchError",
            Self::Runtime(_) => "RuntimeError",
            Self::OutOfMemory(_) => "OutOfMemoryError",
            Self::Unsupported(_) => "UnsupportedError",
            Self::Panic(_) => "KernelPanic",
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Arguments of one scaled-dot-product-attention call.
///
/// Borrowed from the caller; the dispatcher forwards it untouched.
#[derive(Clone, Copy)]
pub struct AttentionCall<'a> {
    pub query: &'a Tensor,
    pub key: &'a Tensor,
    pub value: &'a Tensor,
    pub attn_mask: Option<&'a Tensor>,
    pub dropout_p: f32,
    pub is_causal: bool,
    pub scale: Option<f32>,
}

impl<'a> AttentionCall<'a> {
    pub fn new(query: &'a Tensor, key: &'a Tensor, value: &'a Tensor) -> Self {
        Self {
            query,
            key,
            value,
            attn_mask: None,
            dropout_p: 0.0,
            is_causal: false,
            scale: None,
        }
    }

    pub fn with_mask(mut self, mask: &'a Tensor) -> Self {
        self.attn_mask = Some(mask);
        self
    }

    pub fn with_dropout(mut self, dropout_p: f32) -> Self {
        self.dropout_p = dropout_p;
        self
    }

    pub fn causal(mut self, is_causal: bool) -> Self {
        self.is_causal = is_causal;
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Element type of the query, which decides kernel eligibility.
    pub fn dtype(&self) -> DType {
        self.query.dtype()
    }

    /// Scale actually applied to `Q·Kᵀ`.
    pub fn effective_scale(&self) -> f32 {
        self.scale.unwrap_or_else(|| {
            let head_dim = self.query.head_dim().unwrap_or(1).max(1);
            1.0 / (head_dim as f32).sqrt()
        })
    }
}

impl fmt::Debug for AttentionCall<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttentionCall")
            .field("q", &self.query.shape())
            .field("k", &self.key.shape())
            .field("v", &self.value.shape())
            .field("dtype", &self.query.dtype())
            .field("device", &self.query.device())
            .field("mask", &self.attn_mask.map(|m| m.shape()))
            .field("dropout_p", &self.dropout_p)
            .field("is_causal", &self.is_causal)
            .field("scale", &self.scale)
            .finish()
    }
}

/// An implementation of scaled-dot-product attention.
///
/// Hosts hold one of these as their active attention implementation;
/// installing the dispatcher swaps it for a wrapper with the same contract.
pub trait AttentionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn scaled_dot_product_attention(&self, call: &AttentionCall<'_>) -> AttentionResult<Tensor>;
}

impl<B: AttentionBackend + ?Sized> AttentionBackend for std::sync::Arc<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn scaled_dot_product_attention(&self, call: &AttentionCall<'_>) -> AttentionResult<Tensor> {
        (**self).scaled_dot_product_attention(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Device;

    #[test]
    fn test_kernel_error_kinds_are_distinct() {
        let errors = [
            KernelError::Load(String::new()),
            KernelError::Compile(String::new()),
            KernelError::ShapeMismatch(String::new()),
            KernelError::Runtime(String::new()),
            KernelError::OutOfMemory(String::new()),
            KernelError::Unsupported(String::new()),
            KernelError::Panic(String::new()),
        ];
        let kinds: std::collections::HashSet<_> = errors.iter().map(KernelError::kind).collect();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_kind_ignores_message() {
        let a = KernelError::Runtime("shape mismatch".into());
        let b = KernelError::Runtime("illegal address".into());
        assert_eq!(a.kind(), b.kind());
        assert_eq!(a.to_string(), "kernel runtime error: shape mismatch");
    }

    #[test]
    fn test_default_scale() {
        let q = Tensor::zeros([1, 1, 4, 64], DType::F32, Device::Cpu);
        let call = AttentionCall::new(&q, &q, &q);
        assert!((call.effective_scale() - 0.125).abs() < 1e-7);
        assert_eq!(call.with_scale(0.5).effective_scale(), 0.5);
    }

    #[test]
    fn test_builder() {
        let q = Tensor::zeros([2, 8], DType::F16, Device::Cuda(0));
        let mask = Tensor::zeros([2, 2], DType::Bool, Device::Cpu);
        let call = AttentionCall::new(&q, &q, &q)
            .with_mask(&mask)
            .with_dropout(0.1)
            .causal(true);
        assert!(call.attn_mask.is_some());
        assert_eq!(call.dropout_p, 0.1);
        assert!(call.is_causal);
        assert_eq!(call.dtype(), DType::F16);
    }
}
