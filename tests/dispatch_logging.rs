//! Log output of the dispatcher: one line per category, one summary line.
//!
//! Records go to a process-wide capturing logger, so these tests run serially.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use half::f16;
use log::{Level, LevelFilter, Log, Metadata, Record};
use sage_dispatch::{
    install_dispatcher, AttentionCall, AttentionDispatcher, AttentionHost, ComputeCapability,
    CpuAttention, Device, DispatchConfig, KernelError, KernelResult, LazyKernel, OptimizedKernel,
    StaticRuntime, Tensor,
};
use serial_test::serial;

// ═══════════════════════════════════════════════════════════════════════
// Capturing logger
// ═══════════════════════════════════════════════════════════════════════

struct Capture {
    lines: Mutex<Vec<(Level, String)>>,
}

impl Log for Capture {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.target().starts_with("sage_dispatch")
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.lines
                .lock()
                .unwrap()
                .push((record.level(), record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture {
    lines: Mutex::new(Vec::new()),
};
static INIT: Once = Once::new();

/// Install the capturing logger (first call only) and drop earlier records.
fn start_capture() {
    INIT.call_once(|| {
        log::set_logger(&CAPTURE).expect("no other logger installed");
        log::set_max_level(LevelFilter::Trace);
    });
    CAPTURE.lines.lock().unwrap().clear();
}

fn captured() -> Vec<(Level, String)> {
    CAPTURE.lines.lock().unwrap().clone()
}

fn count_containing(needle: &str) -> usize {
    captured().iter().filter(|(_, line)| line.contains(needle)).count()
}

// ═══════════════════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════════════════

struct Failing(KernelError);

impl OptimizedKernel for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn forward(&self, _call: &AttentionCall<'_>) -> KernelResult<Tensor> {
        Err(self.0.clone())
    }
}

/// Fails with the next error from `errors` on each call, cycling.
struct Sequenced {
    errors: Vec<KernelError>,
    next: AtomicUsize,
}

impl OptimizedKernel for Sequenced {
    fn name(&self) -> &str {
        "sequenced"
    }

    fn forward(&self, _call: &AttentionCall<'_>) -> KernelResult<Tensor> {
        let i = self.next.fetch_add(1, Ordering::SeqCst);
        Err(self.errors[i % self.errors.len()].clone())
    }
}

fn failing_kernel(err: KernelError) -> LazyKernel {
    LazyKernel::new(move || -> KernelResult<Arc<dyn OptimizedKernel>> {
        Ok(Arc::new(Failing(err.clone())))
    })
}

fn dispatcher(runtime: StaticRuntime, kernel: LazyKernel) -> AttentionDispatcher {
    AttentionDispatcher::new(
        Arc::new(CpuAttention::new()),
        Arc::new(runtime),
        kernel,
        &DispatchConfig::default(),
    )
}

fn cuda_half(shape: &[usize]) -> Tensor {
    let numel = shape.iter().product::<usize>();
    let values = (0..numel).map(|i| f16::from_f32((i % 7) as f32 * 0.1)).collect();
    Tensor::from_f16(shape.to_vec(), values)
        .unwrap()
        .to_device(Device::Cuda(0))
}

// ═══════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════

#[test]
#[serial]
fn capability_skip_logged_once() {
    start_capture();
    let d = dispatcher(
        StaticRuntime::single("Tesla T4", ComputeCapability::new(7, 5)),
        failing_kernel(KernelError::Runtime("unused".into())),
    );
    let q = cuda_half(&[1, 1, 4, 64]);

    d.dispatch(&AttentionCall::new(&q, &q, &q)).unwrap();
    d.dispatch(&AttentionCall::new(&q, &q, &q)).unwrap();

    assert_eq!(count_containing("compute capability 7.5 < 8.0"), 1);
}

#[test]
#[serial]
fn head_dim_skip_names_the_allowed_dims() {
    start_capture();
    let d = dispatcher(
        StaticRuntime::single("NVIDIA RTX A6000", ComputeCapability::new(8, 6)),
        failing_kernel(KernelError::Runtime("unused".into())),
    );
    let q = cuda_half(&[1, 1, 4, 80]);

    for _ in 0..3 {
        d.dispatch(&AttentionCall::new(&q, &q, &q)).unwrap();
    }

    let lines: Vec<_> = captured()
        .into_iter()
        .filter(|(_, line)| line.contains("head dim 80"))
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].0, Level::Info);
    assert!(lines[0].1.contains("[64, 96, 128]"), "got: {}", lines[0].1);
}

#[test]
#[serial]
fn kernel_error_warning_carries_call_context() {
    start_capture();
    let d = dispatcher(
        StaticRuntime::single("NVIDIA RTX A6000", ComputeCapability::new(8, 6)),
        failing_kernel(KernelError::Runtime("shape mismatch".into())),
    );
    let q = cuda_half(&[2, 4, 16, 64]);
    let call = AttentionCall::new(&q, &q, &q).causal(true);

    d.dispatch(&call).unwrap();
    d.dispatch(&call).unwrap();

    let warnings: Vec<String> = captured()
        .into_iter()
        .filter(|(level, _)| *level == Level::Warn)
        .map(|(_, line)| line)
        .collect();
    assert_eq!(warnings.len(), 1);
    let line = &warnings[0];
    assert!(line.contains("RuntimeError"), "got: {line}");
    assert!(line.contains("shape mismatch"));
    assert!(line.contains("NVIDIA RTX A6000"));
    assert!(line.contains("capability=8.6"));
    assert!(line.contains("q=[2, 4, 16, 64]"));
    assert!(line.contains("dtype=float16"));
    assert!(line.contains("causal=true"));
}

#[test]
#[serial]
fn distinct_error_kinds_each_warn_once() {
    start_capture();
    let kernel = LazyKernel::new(|| -> KernelResult<Arc<dyn OptimizedKernel>> {
        Ok(Arc::new(Sequenced {
            errors: vec![
                KernelError::Runtime("launch failed".into()),
                KernelError::OutOfMemory("tried to allocate 2.00 GiB".into()),
            ],
            next: AtomicUsize::new(0),
        }))
    });
    let d = dispatcher(
        StaticRuntime::single("NVIDIA RTX A6000", ComputeCapability::new(8, 6)),
        kernel,
    );
    let q = cuda_half(&[1, 2, 8, 64]);

    for _ in 0..4 {
        d.dispatch(&AttentionCall::new(&q, &q, &q)).unwrap();
    }

    let warnings: Vec<String> = captured()
        .into_iter()
        .filter(|(level, _)| *level == Level::Warn)
        .map(|(_, line)| line)
        .collect();
    assert_eq!(warnings.len(), 2, "got: {warnings:?}");
    assert!(warnings[0].contains("RuntimeError"));
    assert!(warnings[1].contains("OutOfMemoryError"));
    assert_eq!(d.stats().fallback, 4);
    assert_eq!(d.stats().used, 0);
}

#[test]
#[serial]
fn summary_emitted_once_on_guard_drop() {
    start_capture();
    let host = AttentionHost::new(Arc::new(CpuAttention::new()));
    let runtime = StaticRuntime::single("NVIDIA RTX A6000", ComputeCapability::new(8, 6));
    let kernel = LazyKernel::new(|| -> KernelResult<Arc<dyn OptimizedKernel>> {
        Err(KernelError::Load("not installed".into()))
    });

    let guard = install_dispatcher(&host, DispatchConfig::default(), Arc::new(runtime), kernel)
        .expect("enabled by default");
    assert_eq!(count_containing("SageAttention wrapper installed (lazy import)."), 1);

    let q = cuda_half(&[1, 1, 4, 64]);
    let c = Tensor::zeros([1, 1, 4, 64], sage_dispatch::DType::F16, Device::Cpu);
    host.scaled_dot_product_attention(&AttentionCall::new(&q, &q, &q)).unwrap();
    host.scaled_dot_product_attention(&AttentionCall::new(&c, &c, &c)).unwrap();

    let dispatcher = guard.dispatcher().clone();
    drop(guard);
    assert!(!dispatcher.report(), "summary already emitted by the guard");

    assert_eq!(count_containing("SageAttention stats: used=0, fallback=2"), 1);
    assert_eq!(count_containing(" stats: "), 1);
}

#[test]
#[serial]
fn disabled_install_logs_and_leaves_host() {
    start_capture();
    let host = AttentionHost::new(Arc::new(CpuAttention::new()));
    let config = DispatchConfig {
        enabled: false,
        ..DispatchConfig::default()
    };

    let guard = install_dispatcher(
        &host,
        config,
        Arc::new(StaticRuntime::unavailable()),
        failing_kernel(KernelError::Load("unused".into())),
    );

    assert!(guard.is_none());
    assert_eq!(host.current().name(), "cpu-sdpa");
    assert_eq!(count_containing("wrapper disabled"), 1);
    assert_eq!(count_containing("wrapper installed"), 0);
    // No dispatcher, so no usage summary either.
    assert_eq!(count_containing(" stats: "), 0);
}
