//! Telemetry helpers for tracing spans and Prometheus metrics.

use std::{
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

use crate::pipeline::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

/// Keeps the subscriber installed on the current thread and flushes the
/// Chrome trace, if any, when dropped.
pub struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    chrome_guard: Option<tracing_chrome::FlushGuard>,
    chrome_trace_path: Option<PathBuf>,
}

impl TelemetryGuard {
    pub fn chrome_trace_path(&self) -> Option<&Path> {
        self.chrome_trace_path.as_deref()
    }
}

/// Ensure the global metrics recorder is installed and return the Prometheus handle.
pub fn init_metrics_recorder() -> Result<&'static PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle);
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).context("metrics recorder already installed")?;

    let upkeep_handle = handle.clone();
    let upkeep = spawn_thread("prometheus-upkeep", move || {
        loop {
            thread::sleep(Duration::from_secs(5));
            upkeep_handle.run_upkeep();
        }
    })
    .context("failed to spawn prometheus upkeep thread")?;
    let _ = PROM_UPKEEP_THREAD.set(upkeep);

    Ok(PROM_HANDLE.get_or_init(|| handle))
}

/// Prometheus exposition of everything recorded so far.
pub fn render_metrics() -> Option<String> {
    PROM_HANDLE.get().map(PrometheusHandle::render)
}

/// Install tracing subscribers for the current thread based on telemetry options.
pub fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut chrome_error = None;
    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_ref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                chrome_error = Some((path.clone(), err));
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::uptime())
        .with_filter(env_filter);

    let default_guard = tracing::subscriber::set_default(
        tracing_subscriber::registry()
            .with(chrome_layer.map(|layer| layer.with_filter(span_only_filter)))
            .with(fmt_layer)
            .with(tracing_error::ErrorLayer::default()),
    );
    if let Some((path, err)) = chrome_error {
        tracing::warn!(
            "failed to initialise chrome trace writer at {}: {err}",
            path.display()
        );
    }

    TelemetryGuard {
        _default_guard: default_guard,
        chrome_guard,
        chrome_trace_path: opts.chrome_trace_path.clone(),
    }
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> io::Result<(
    tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
    tracing_chrome::FlushGuard,
)> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.chrome_guard.take() {
            guard.flush();
        }
    }
}
