//! Attention dispatch wrapper with runtime kernel selection.
//!
//! `AttentionDispatcher` wraps a reference scaled-dot-product-attention
//! implementation and routes each call to an optimized kernel when the call
//! and the hardware allow it:
//!
//! 1. accelerator available, query resident on it, query dtype f16/bf16
//! 2. compute capability major >= `min_compute_major`
//! 3. mask / dropout only when the kernel profile supports them
//! 4. head dimension in the kernel profile's allow-list
//! 5. kernel library resolved lazily on the first eligible call
//!
//! Anything that fails on the optimized path is absorbed and the call is
//! replayed on the reference implementation. Only the reference's own errors
//! reach the caller.
//!
//! ```ignore
//! use std::sync::Arc;
//! use sage_dispatch::{install_dispatcher, AttentionHost, CpuAttention, DispatchConfig, LazyKernel};
//!
//! let host = AttentionHost::new(Arc::new(CpuAttention::new()));
//! let config = DispatchConfig::from_env()?;
//! let kernel = LazyKernel::from_library(config.library.clone());
//! let _guard = install_dispatcher(&host, config, sage_dispatch::detect_runtime(), kernel);
//! let out = host.scaled_dot_product_attention(&call)?;
//! ```

use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::backend_trait::{AttentionBackend, AttentionCall, AttentionResult, KernelError, KernelResult};
use crate::config::{ConfigError, DispatchConfig, KernelProfile};
use crate::kernel_loader::{panic_message, LazyKernel};
use crate::runtime_detection::{detect_runtime, AcceleratorRuntime, ComputeCapability};
use crate::tensor::{DType, Tensor};

/// Counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStats {
    pub used: u64,
    pub fallback: u64,
}

impl DispatchStats {
    pub fn total(&self) -> u64 {
        self.used + self.fallback
    }
}

/// Shared dispatcher state: usage counters and the dedup-logging key set.
///
/// Counters are best-effort telemetry; relaxed atomics are enough.
#[derive(Debug, Default)]
pub struct DispatchState {
    used: AtomicU64,
    fallback: AtomicU64,
    logged_keys: Mutex<HashSet<String>>,
    reported: AtomicBool,
}

impl DispatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            used: self.used.load(Ordering::Relaxed),
            fallback: self.fallback.load(Ordering::Relaxed),
        }
    }

    fn record_used(&self) {
        self.used.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fallback(&self) {
        self.fallback.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `key`; true only the first time it is seen.
    pub fn first_occurrence(&self, key: &str) -> bool {
        let mut keys = self.logged_keys.lock().unwrap_or_else(|e| e.into_inner());
        if keys.contains(key) {
            return false;
        }
        keys.insert(key.to_string())
    }

    pub fn has_logged(&self, key: &str) -> bool {
        self.logged_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    /// Keys emitted so far, sorted.
    pub fn logged_keys(&self) -> Vec<String> {
        let keys = self.logged_keys.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = keys.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Emit the usage summary. Only the first call logs; later calls return false.
    pub fn report(&self, kernel_name: &str) -> bool {
        if self.reported.swap(true, Ordering::SeqCst) {
            return false;
        }
        let stats = self.stats();
        log::info!(
            "{} stats: used={}, fallback={}",
            kernel_name,
            stats.used,
            stats.fallback
        );
        true
    }
}

/// Why a call was kept on the reference path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoAccelerator,
    HostResident,
    UnsupportedDType(DType),
    Capability(Option<ComputeCapability>),
    Mask,
    Dropout,
    HeadDim(usize),
}

impl SkipReason {
    /// Dedup key for reasons that are logged once; `None` for silent ones.
    pub fn log_key(&self) -> Option<String> {
        match self {
            Self::Capability(_) => Some("capability".to_string()),
            Self::HeadDim(dim) => Some(format!("headdim_{dim}")),
            _ => None,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAccelerator => f.write_str("no accelerator available"),
            Self::HostResident => f.write_str("query is not resident on an accelerator"),
            Self::UnsupportedDType(dtype) => write!(f, "dtype {dtype} is not float16/bfloat16"),
            Self::Capability(Some(cap)) => write!(f, "compute capability {cap}"),
            Self::Capability(None) => f.write_str("compute capability unknown"),
            Self::Mask => f.write_str("attention mask not supported"),
            Self::Dropout => f.write_str("dropout not supported"),
            Self::HeadDim(dim) => write!(f, "head dim {dim} not supported"),
        }
    }
}

/// Drop-in `AttentionBackend` that prefers the optimized kernel.
pub struct AttentionDispatcher {
    reference: Arc<dyn AttentionBackend>,
    runtime: Arc<dyn AcceleratorRuntime>,
    kernel: LazyKernel,
    min_compute_major: i32,
    profile: KernelProfile,
    state: Arc<DispatchState>,
}

impl AttentionDispatcher {
    pub fn new(
        reference: Arc<dyn AttentionBackend>,
        runtime: Arc<dyn AcceleratorRuntime>,
        kernel: LazyKernel,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            reference,
            runtime,
            kernel,
            min_compute_major: config.min_compute_major,
            profile: config.kernel.clone(),
            state: Arc::new(DispatchState::new()),
        }
    }

    pub fn state(&self) -> &Arc<DispatchState> {
        &self.state
    }

    pub fn stats(&self) -> DispatchStats {
        self.state.stats()
    }

    pub fn profile(&self) -> &KernelProfile {
        &self.profile
    }

    /// The implementation calls fall back to.
    pub fn reference(&self) -> &Arc<dyn AttentionBackend> {
        &self.reference
    }

    /// Log the usage summary once.
    pub fn report(&self) -> bool {
        self.state.report(&self.profile.name)
    }

    /// Run one attention call.
    pub fn dispatch(&self, call: &AttentionCall<'_>) -> AttentionResult<Tensor> {
        if let Some(reason) = self.check_eligibility(call) {
            self.note_skip(&reason);
            return self.fallback(call);
        }

        match self.try_optimized(call) {
            Ok(output) => {
                self.state.record_used();
                Ok(output)
            }
            Err(e) => {
                self.note_kernel_error(call, &e);
                self.fallback(call)
            }
        }
    }

    /// Evaluate gates 1-4 in order; the first failing gate wins.
    pub fn check_eligibility(&self, call: &AttentionCall<'_>) -> Option<SkipReason> {
        let query = call.query;

        if !self.runtime.is_available() {
            return Some(SkipReason::NoAccelerator);
        }
        let Some(ordinal) = query.device().ordinal() else {
            return Some(SkipReason::HostResident);
        };
        if !query.dtype().is_half() {
            return Some(SkipReason::UnsupportedDType(query.dtype()));
        }

        match self.runtime.compute_capability(ordinal) {
            Some(cap) if cap.major >= self.min_compute_major => {}
            other => return Some(SkipReason::Capability(other)),
        }

        if call.attn_mask.is_some() && !self.profile.supports_mask {
            return Some(SkipReason::Mask);
        }
        if call.dropout_p > 0.0 && !self.profile.supports_dropout {
            return Some(SkipReason::Dropout);
        }

        match query.head_dim() {
            Some(dim) if self.profile.accepts_head_dim(dim) => None,
            Some(dim) => Some(SkipReason::HeadDim(dim)),
            None => Some(SkipReason::HeadDim(0)),
        }
    }

    fn fallback(&self, call: &AttentionCall<'_>) -> AttentionResult<Tensor> {
        self.state.record_fallback();
        self.reference.scaled_dot_product_attention(call)
    }

    fn try_optimized(&self, call: &AttentionCall<'_>) -> KernelResult<Tensor> {
        let kernel = self.kernel.get()?;
        catch_unwind(AssertUnwindSafe(|| kernel.forward(call)))
            .unwrap_or_else(|payload| Err(KernelError::Panic(panic_message(payload))))
    }

    fn note_skip(&self, reason: &SkipReason) {
        let Some(key) = reason.log_key() else {
            return;
        };
        if !self.state.first_occurrence(&key) {
            return;
        }
        match reason {
            SkipReason::Capability(_) => log::info!(
                "{} skipped ({} < {}.0).",
                self.profile.name,
                reason,
                self.min_compute_major
            ),
            _ => log::info!(
                "{} skipped ({}; allowed: {:?}).",
                self.profile.name,
                reason,
                self.profile.head_dims.as_deref().unwrap_or(&[])
            ),
        }
    }

    fn note_kernel_error(&self, call: &AttentionCall<'_>, error: &KernelError) {
        // Keyed by error kind only: distinct causes of one kind share a line.
        if !self.state.first_occurrence(error.kind()) {
            return;
        }

        let device = call.query.device();
        let (device_name, capability) = match device.ordinal() {
            Some(ordinal) => (
                self.runtime
                    .device_name(ordinal)
                    .unwrap_or_else(|| device.to_string()),
                self.runtime
                    .compute_capability(ordinal)
                    .map_or_else(|| "unknown".to_string(), |c| c.to_string()),
            ),
            None => (device.to_string(), "n/a".to_string()),
        };

        log::warn!(
            "{} unavailable ({}: {}); falling back to SDPA. device={} ({}) capability={} q={:?} k={:?} v={:?} dtype={} causal={}",
            self.profile.name,
            error.kind(),
            error,
            device_name,
            device,
            capability,
            call.query.shape(),
            call.key.shape(),
            call.value.shape(),
            call.query.dtype(),
            call.is_causal
        );
    }
}

impl AttentionBackend for AttentionDispatcher {
    fn name(&self) -> &'static str {
        "sage-dispatch"
    }

    fn scaled_dot_product_attention(&self, call: &AttentionCall<'_>) -> AttentionResult<Tensor> {
        self.dispatch(call)
    }
}

impl fmt::Debug for AttentionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttentionDispatcher")
            .field("reference", &self.reference.name())
            .field("runtime", &self.runtime.name())
            .field("kernel", &self.kernel)
            .field("min_compute_major", &self.min_compute_major)
            .field("profile", &self.profile)
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// Installation
// =============================================================================

/// Holds the process's active attention implementation.
///
/// Call sites go through the host, so replacing the backend redirects them
/// without code changes.
pub struct AttentionHost {
    active: RwLock<Arc<dyn AttentionBackend>>,
}

impl AttentionHost {
    pub fn new(reference: Arc<dyn AttentionBackend>) -> Self {
        Self {
            active: RwLock::new(reference),
        }
    }

    pub fn current(&self) -> Arc<dyn AttentionBackend> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swap in `backend`, returning the previous one.
    pub fn replace(&self, backend: Arc<dyn AttentionBackend>) -> Arc<dyn AttentionBackend> {
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *active, backend)
    }

    pub fn scaled_dot_product_attention(&self, call: &AttentionCall<'_>) -> AttentionResult<Tensor> {
        self.current().scaled_dot_product_attention(call)
    }
}

impl fmt::Debug for AttentionHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttentionHost")
            .field("active", &self.current().name())
            .finish()
    }
}

/// Emits the dispatcher's usage summary when dropped.
///
/// Keep it alive for the lifetime of the process (e.g. bind it in `main`).
#[must_use = "dropping the guard emits the usage summary immediately"]
#[derive(Debug)]
pub struct ReportGuard {
    dispatcher: Arc<AttentionDispatcher>,
}

impl ReportGuard {
    pub fn dispatcher(&self) -> &Arc<AttentionDispatcher> {
        &self.dispatcher
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }
}

impl Drop for ReportGuard {
    fn drop(&mut self) {
        self.dispatcher.report();
    }
}

/// Wrap the host's current implementation in a dispatcher and make it active.
///
/// Returns `None` (host untouched) when `config.enabled` is false. Installing
/// twice wraps the first dispatcher in a second one.
pub fn install_dispatcher(
    host: &AttentionHost,
    config: DispatchConfig,
    runtime: Arc<dyn AcceleratorRuntime>,
    kernel: LazyKernel,
) -> Option<ReportGuard> {
    if !config.enabled {
        log::info!("{} wrapper disabled by configuration.", config.kernel.name);
        return None;
    }

    let dispatcher = Arc::new(AttentionDispatcher::new(host.current(), runtime, kernel, &config));
    host.replace(dispatcher.clone());
    log::info!("{} wrapper installed (lazy import).", config.kernel.name);
    Some(ReportGuard { dispatcher })
}

/// Install with environment configuration (including a `SAGE_DISPATCH_CONFIG`
/// JSON file), detected runtime and the shared-library kernel loader.
pub fn install_default(host: &AttentionHost) -> Result<Option<ReportGuard>, ConfigError> {
    let config = DispatchConfig::from_env()?;
    let kernel = LazyKernel::from_library(config.library.clone());
    Ok(install_dispatcher(host, config, detect_runtime(), kernel))
}
