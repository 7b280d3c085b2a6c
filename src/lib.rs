//! sage-dispatch: attention dispatch for image-generation pipelines.
//!
//! This crate provides a drop-in scaled-dot-product-attention wrapper with:
//! - **Capability Gating**: accelerator residency, f16/bf16 dtype, compute capability >= 8.0
//! - **Lazy Kernel Loading**: the optimized kernel library is resolved on first eligible call
//! - **Transparent Fallback**: every optimized-path failure replays the call on the reference
//! - **Dedup Logging**: each skip/error category is logged once per dispatcher
//!
//! Plus the operational helpers used around the pipeline: a batch selection
//! workflow, an output packager and a resource monitor.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use sage_dispatch::{install_default, AttentionCall, AttentionHost, CpuAttention};
//!
//! let host = AttentionHost::new(Arc::new(CpuAttention::new()));
//! let _guard = install_default(&host)?; // reports usage when dropped
//! let out = host.scaled_dot_product_attention(&AttentionCall::new(&q, &k, &v))?;
//! ```

pub mod backend_trait;
pub mod config;
pub mod kernel_dispatcher;
pub mod kernel_loader;
pub mod ops;
pub mod runtime_detection;
pub mod tensor;

// Operational helpers
pub mod batch_workflow;
pub mod outputs;
pub mod resource_monitor;

pub use backend_trait::{
    AttentionBackend, AttentionCall, AttentionError, AttentionResult, KernelError, KernelResult,
};
pub use config::{ConfigError, DispatchConfig, KernelProfile, LibraryConfig};
pub use kernel_dispatcher::{
    install_default, install_dispatcher, AttentionDispatcher, AttentionHost, DispatchState,
    DispatchStats, ReportGuard, SkipReason,
};
pub use kernel_loader::{DylibKernelLoader, KernelLoader, LazyKernel, OptimizedKernel};
pub use ops::attention::CpuAttention;
pub use runtime_detection::{
    detect_runtime, AcceleratorRuntime, ComputeCapability, DeviceInfo, StaticRuntime,
};
#[cfg(feature = "cuda")]
pub use runtime_detection::CudaRuntime;
pub use tensor::{DType, Device, Tensor, TensorData};
