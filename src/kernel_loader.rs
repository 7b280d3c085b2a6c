//! Optional optimized-kernel loading.
//!
//! The optimized attention kernel lives in an external shared library that
//! may not be installed. It is resolved lazily, the first time a call is
//! eligible for it, and the outcome is cached for the process lifetime: a
//! failed load is remembered and never retried.

use std::any::Any;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use libloading::Library;

use crate::backend_trait::{AttentionCall, KernelError, KernelResult};
use crate::config::LibraryConfig;
use crate::tensor::{DType, Device, Tensor, TensorData};

/// An optimized attention kernel.
pub trait OptimizedKernel: Send + Sync {
    fn name(&self) -> &str;

    /// Run attention for a call that already passed every eligibility gate.
    fn forward(&self, call: &AttentionCall<'_>) -> KernelResult<Tensor>;
}

/// Resolves the optimized kernel. Called at most once per `LazyKernel`.
pub trait KernelLoader: Send + Sync {
    fn load(&self) -> KernelResult<Arc<dyn OptimizedKernel>>;
}

impl<F> KernelLoader for F
where
    F: Fn() -> KernelResult<Arc<dyn OptimizedKernel>> + Send + Sync,
{
    fn load(&self) -> KernelResult<Arc<dyn OptimizedKernel>> {
        self()
    }
}

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Lazily resolved, cached kernel handle.
///
/// The cached `Err` is the "permanently unavailable" state.
pub struct LazyKernel {
    loader: Box<dyn KernelLoader>,
    slot: OnceLock<KernelResult<Arc<dyn OptimizedKernel>>>,
}

impl LazyKernel {
    pub fn new(loader: impl KernelLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            slot: OnceLock::new(),
        }
    }

    /// Shared-library loader built from `config`.
    pub fn from_library(config: LibraryConfig) -> Self {
        Self::new(DylibKernelLoader::new(config))
    }

    /// Resolve on first use, then return the cached outcome.
    pub fn get(&self) -> KernelResult<Arc<dyn OptimizedKernel>> {
        self.slot
            .get_or_init(|| {
                let result = catch_unwind(AssertUnwindSafe(|| self.loader.load()))
                    .unwrap_or_else(|payload| Err(KernelError::Panic(panic_message(payload))));
                match &result {
                    Ok(kernel) => log::info!("Loaded optimized attention kernel: {}", kernel.name()),
                    Err(e) => log::debug!("Optimized attention kernel unavailable: {}", e),
                }
                result
            })
            .clone()
    }

    /// Whether a load has been attempted.
    pub fn is_resolved(&self) -> bool {
        self.slot.get().is_some()
    }
}

impl std::fmt::Debug for LazyKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.slot.get() {
            None => "unresolved",
            Some(Ok(_)) => "ready",
            Some(Err(_)) => "unavailable",
        };
        f.debug_struct("LazyKernel").field("state", &state).finish()
    }
}

// =============================================================================
// Shared library ABI
// =============================================================================

pub const ABI_OK: c_int = 0;
pub const ABI_SHAPE_MISMATCH: c_int = 1;
pub const ABI_OUT_OF_MEMORY: c_int = 2;
pub const ABI_COMPILE: c_int = 3;
pub const ABI_UNSUPPORTED: c_int = 4;

pub const ABI_DTYPE_F32: u32 = 0;
pub const ABI_DTYPE_F16: u32 = 1;
pub const ABI_DTYPE_BF16: u32 = 2;

/// Tensor view handed across the C ABI.
#[repr(C)]
pub struct RawTensor {
    pub data: *const c_void,
    pub shape: *const usize,
    pub rank: usize,
    pub dtype: u32,
    /// Device ordinal, -1 for host memory.
    pub device: c_int,
}

/// Output buffer handed across the C ABI.
#[repr(C)]
pub struct RawTensorMut {
    pub data: *mut c_void,
    pub shape: *const usize,
    pub rank: usize,
    pub dtype: u32,
    pub device: c_int,
}

type ForwardFn = unsafe extern "C" fn(
    q: *const RawTensor,
    k: *const RawTensor,
    v: *const RawTensor,
    out: *mut RawTensorMut,
    is_causal: c_int,
    scale: f32,
) -> c_int;
type InitFn = unsafe extern "C" fn() -> c_int;
type LastErrorFn = unsafe extern "C" fn() -> *const c_char;

fn abi_dtype(dtype: DType) -> KernelResult<u32> {
    match dtype {
        DType::F32 => Ok(ABI_DTYPE_F32),
        DType::F16 => Ok(ABI_DTYPE_F16),
        DType::BF16 => Ok(ABI_DTYPE_BF16),
        DType::Bool => Err(KernelError::Unsupported(format!("dtype {dtype}"))),
    }
}

fn abi_device(device: Device) -> c_int {
    device.ordinal().map_or(-1, |o| o as c_int)
}

fn data_ptr(data: &TensorData) -> *const c_void {
    match data {
        TensorData::F32(v) => v.as_ptr() as *const c_void,
        TensorData::F16(v) => v.as_ptr() as *const c_void,
        TensorData::BF16(v) => v.as_ptr() as *const c_void,
        TensorData::Bool(v) => v.as_ptr() as *const c_void,
    }
}

fn data_ptr_mut(data: &mut TensorData) -> *mut c_void {
    match data {
        TensorData::F32(v) => v.as_mut_ptr() as *mut c_void,
        TensorData::F16(v) => v.as_mut_ptr() as *mut c_void,
        TensorData::BF16(v) => v.as_mut_ptr() as *mut c_void,
        TensorData::Bool(v) => v.as_mut_ptr() as *mut c_void,
    }
}

/// The ABI carries no mask or dropout; such calls must not reach the library.
fn ensure_abi_supports(call: &AttentionCall<'_>) -> KernelResult<()> {
    if call.attn_mask.is_some() {
        return Err(KernelError::Unsupported("attention mask not representable in the C ABI".into()));
    }
    if call.dropout_p > 0.0 {
        return Err(KernelError::Unsupported(format!(
            "dropout {} not representable in the C ABI",
            call.dropout_p
        )));
    }
    Ok(())
}

fn raw_view(t: &Tensor) -> KernelResult<RawTensor> {
    Ok(RawTensor {
        data: data_ptr(t.data()),
        shape: t.shape().as_ptr(),
        rank: t.rank(),
        dtype: abi_dtype(t.dtype())?,
        device: abi_device(t.device()),
    })
}

/// Optimized kernel exported by a shared library.
pub struct DylibKernel {
    #[allow(dead_code)]
    lib: Library,
    path: PathBuf,
    forward: ForwardFn,
    last_error: Option<LastErrorFn>,
}

// Safety: DylibKernel holds function pointers from a loaded library.
// The library is kept alive by the struct and the pointers are immutable
// after loading; the ABI requires the entry points to be thread-safe.
unsafe impl Send for DylibKernel {}
unsafe impl Sync for DylibKernel {}

impl DylibKernel {
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn last_error_message(&self) -> String {
        let Some(last_error) = self.last_error else {
            return "no error detail".to_string();
        };
        // Safety: the ABI returns null or a NUL-terminated string owned by the library.
        unsafe {
            let ptr = last_error();
            if ptr.is_null() {
                "no error detail".to_string()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        }
    }

    fn map_status(&self, status: c_int) -> KernelError {
        let message = self.last_error_message();
        match status {
            ABI_SHAPE_MISMATCH => KernelError::ShapeMismatch(message),
            ABI_OUT_OF_MEMORY => KernelError::OutOfMemory(message),
            ABI_COMPILE => KernelError::Compile(message),
            ABI_UNSUPPORTED => KernelError::Unsupported(message),
            other => KernelError::Runtime(format!("status {other}: {message}")),
        }
    }
}

impl OptimizedKernel for DylibKernel {
    fn name(&self) -> &str {
        self.path.to_str().unwrap_or("shared library kernel")
    }

    fn forward(&self, call: &AttentionCall<'_>) -> KernelResult<Tensor> {
        ensure_abi_supports(call)?;
        let q = raw_view(call.query)?;
        let k = raw_view(call.key)?;
        let v = raw_view(call.value)?;

        let mut out_shape = call.query.shape().to_vec();
        let value_dim = call
            .value
            .head_dim()
            .ok_or_else(|| KernelError::ShapeMismatch("value has rank 0".into()))?;
        if let Some(last) = out_shape.last_mut() {
            *last = value_dim;
        }
        let numel = out_shape.iter().product::<usize>();
        let mut out_data = TensorData::from_f32(&vec![0.0; numel], call.query.dtype());

        let mut out = RawTensorMut {
            data: data_ptr_mut(&mut out_data),
            shape: out_shape.as_ptr(),
            rank: out_shape.len(),
            dtype: q.dtype,
            device: q.device,
        };

        // Safety: all views point into buffers that outlive the call, and the
        // output buffer has exactly `prod(out_shape)` elements of `q.dtype`.
        let status = unsafe {
            (self.forward)(
                &q,
                &k,
                &v,
                &mut out,
                c_int::from(call.is_causal),
                call.effective_scale(),
            )
        };
        if status != ABI_OK {
            return Err(self.map_status(status));
        }

        Tensor::new(out_shape, out_data, call.query.device())
            .map_err(|e| KernelError::Runtime(e.to_string()))
    }
}

/// Loads the optimized kernel from the first shared library that opens.
#[derive(Debug, Clone)]
pub struct DylibKernelLoader {
    config: LibraryConfig,
}

impl DylibKernelLoader {
    pub fn new(config: LibraryConfig) -> Self {
        Self { config }
    }

    fn open(&self) -> KernelResult<(Library, PathBuf)> {
        let mut failures = Vec::new();
        for path in &self.config.search_paths {
            // Safety: loading a library runs its initialisers; the search
            // paths are operator-provided.
            match unsafe { Library::new(path) } {
                Ok(lib) => return Ok((lib, path.clone())),
                Err(e) => failures.push(format!("{}: {e}", path.display())),
            }
        }
        Err(KernelError::Load(if failures.is_empty() {
            "no library search paths configured".to_string()
        } else {
            failures.join("; ")
        }))
    }
}

fn symbol_name(name: &str) -> Vec<u8> {
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

impl KernelLoader for DylibKernelLoader {
    fn load(&self) -> KernelResult<Arc<dyn OptimizedKernel>> {
        let (lib, path) = self.open()?;

        let forward: ForwardFn = unsafe {
            *lib.get::<ForwardFn>(&symbol_name(&self.config.forward_symbol))
                .map_err(|e| KernelError::Load(format!("{}: {e}", self.config.forward_symbol)))?
        };
        let last_error: Option<LastErrorFn> = unsafe {
            lib.get::<LastErrorFn>(&symbol_name(&self.config.error_symbol))
                .ok()
                .map(|sym| *sym)
        };
        let init: Option<InitFn> = unsafe {
            lib.get::<InitFn>(&symbol_name(&self.config.init_symbol))
                .ok()
                .map(|sym| *sym)
        };

        let kernel = DylibKernel {
            lib,
            path,
            forward,
            last_error,
        };

        if let Some(init) = init {
            // Safety: the init entry point takes no arguments per the ABI.
            let status = unsafe { init() };
            if status != ABI_OK {
                return Err(KernelError::Compile(kernel.last_error_message()));
            }
        }

        log::debug!("Resolved {} from {:?}", self.config.forward_symbol, kernel.path);
        Ok(Arc::new(kernel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    impl OptimizedKernel for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn forward(&self, call: &AttentionCall<'_>) -> KernelResult<Tensor> {
            Ok(call.value.clone())
        }
    }

    #[test]
    fn test_lazy_kernel_loads_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let lazy = LazyKernel::new(move || -> KernelResult<Arc<dyn OptimizedKernel>> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Echo))
        });

        assert!(!lazy.is_resolved());
        assert_eq!(lazy.get().unwrap().name(), "echo");
        assert_eq!(lazy.get().unwrap().name(), "echo");
        assert!(lazy.is_resolved());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_kernel_caches_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let lazy = LazyKernel::new(move || -> KernelResult<Arc<dyn OptimizedKernel>> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(KernelError::Load("libsageattention.so: not found".into()))
        });

        for _ in 0..3 {
            assert!(matches!(lazy.get(), Err(KernelError::Load(_))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(format!("{lazy:?}"), "LazyKernel { state: \"unavailable\" }");
    }

    #[test]
    fn test_lazy_kernel_absorbs_loader_panic() {
        let lazy = LazyKernel::new(|| -> KernelResult<Arc<dyn OptimizedKernel>> {
            panic!("triton exploded")
        });
        match lazy.get() {
            Err(KernelError::Panic(msg)) => assert!(msg.contains("triton exploded")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected a panic error"),
        }
    }

    #[test]
    fn test_missing_library_is_load_error() {
        let loader = DylibKernelLoader::new(LibraryConfig {
            search_paths: vec![PathBuf::from("/nonexistent/libsageattention-test.so")],
            ..LibraryConfig::default()
        });
        match loader.load() {
            Err(KernelError::Load(msg)) => assert!(msg.contains("libsageattention-test.so")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("library should not load"),
        }
    }

    #[test]
    fn test_empty_search_paths() {
        let loader = DylibKernelLoader::new(LibraryConfig {
            search_paths: Vec::new(),
            ..LibraryConfig::default()
        });
        assert!(matches!(loader.load(), Err(KernelError::Load(_))));
    }

    #[test]
    fn test_abi_rejects_mask_and_dropout() {
        let q = Tensor::zeros([1, 1, 4, 64], DType::F16, Device::Cuda(0));
        let mask = Tensor::zeros([4, 4], DType::Bool, Device::Cuda(0));

        assert!(ensure_abi_supports(&AttentionCall::new(&q, &q, &q).causal(true)).is_ok());
        assert!(matches!(
            ensure_abi_supports(&AttentionCall::new(&q, &q, &q).with_mask(&mask)),
            Err(KernelError::Unsupported(_))
        ));
        assert!(matches!(
            ensure_abi_supports(&AttentionCall::new(&q, &q, &q).with_dropout(0.1)),
            Err(KernelError::Unsupported(_))
        ));
    }

    #[test]
    fn test_abi_dtype_codes() {
        assert_eq!(abi_dtype(DType::F16).unwrap(), ABI_DTYPE_F16);
        assert_eq!(abi_dtype(DType::BF16).unwrap(), ABI_DTYPE_BF16);
        assert!(abi_dtype(DType::Bool).is_err());
        assert_eq!(abi_device(Device::Cpu), -1);
        assert_eq!(abi_device(Device::Cuda(2)), 2);
    }
}
