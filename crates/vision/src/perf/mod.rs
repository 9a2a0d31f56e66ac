//! On-demand resource sampling at pipeline milestones.
//!
//! Sampling never touches pipeline state. Callers own a [`ProbeContext`] per
//! thread and pass it to [`sample`] or [`log_all`] whenever a milestone is
//! reached; there is no timer and no process-wide instance.

mod format;
#[cfg(target_os = "linux")]
mod procfs;

use std::path::{Path, PathBuf};

use serde::Serialize;
use sysinfo::{Disks, Pid, ProcessesToUpdate, System};
use tracing::info;

pub use format::format_size;

const TARGET: &str = "app_performance";

/// Moments at which the surrounding application asks for a sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Milestone {
    SurfaceReady,
    DetectorReady,
    CameraBound,
    DetectionDispatched,
    CameraRestarted,
    OnDemand,
}

impl Milestone {
    pub fn label(self) -> &'static str {
        match self {
            Milestone::SurfaceReady => "surface_ready",
            Milestone::DetectorReady => "detector_ready",
            Milestone::CameraBound => "camera_bound",
            Milestone::DetectionDispatched => "detection_dispatched",
            Milestone::CameraRestarted => "camera_restarted",
            Milestone::OnDemand => "on_demand",
        }
    }
}

/// Process memory as seen by the allocator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HeapUsage {
    pub total: u64,
    pub free: u64,
    /// Upper bound the process may grow to, when one is set.
    pub max: Option<u64>,
    pub native_allocated: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeviceMemory {
    pub total: u64,
    pub available: u64,
}

/// Proportional set size of the current process, split by mapping kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProportionalMemory {
    pub anon: u64,
    pub file: u64,
    pub shmem: u64,
}

impl ProportionalMemory {
    pub fn total(&self) -> u64 {
        self.anon + self.file + self.shmem
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
    pub mount_point: PathBuf,
    pub total: u64,
    pub available: u64,
}

/// Snapshot produced by one [`sample`] call.
#[derive(Clone, Debug, Serialize)]
pub struct PerformanceSample {
    pub heap: HeapUsage,
    pub device: DeviceMemory,
    pub proportional: Option<ProportionalMemory>,
    pub app_storage: Option<StorageUsage>,
    pub device_storage: Option<StorageUsage>,
}

/// Caller-owned state reused across sampling calls.
pub struct ProbeContext {
    system: System,
    pid: Option<Pid>,
    app_data_dir: PathBuf,
    device_root: PathBuf,
}

impl ProbeContext {
    pub fn new(app_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
            app_data_dir: app_data_dir.into(),
            device_root: PathBuf::from("/"),
        }
    }

    /// Path whose partition is reported as device-global storage.
    pub fn with_device_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.device_root = root.into();
        self
    }

    pub fn app_data_dir(&self) -> &Path {
        &self.app_data_dir
    }
}

/// Take a fresh snapshot of heap, device memory, and storage.
pub fn sample(ctx: &mut ProbeContext) -> PerformanceSample {
    ctx.system.refresh_memory();
    let device = DeviceMemory {
        total: ctx.system.total_memory(),
        available: ctx.system.available_memory(),
    };

    let disks = Disks::new_with_refreshed_list();
    let mounts: Vec<StorageUsage> = disks
        .list()
        .iter()
        .map(|disk| StorageUsage {
            mount_point: disk.mount_point().to_path_buf(),
            total: disk.total_space(),
            available: disk.available_space(),
        })
        .collect();

    PerformanceSample {
        heap: heap_usage(ctx),
        device,
        proportional: proportional_memory(),
        app_storage: partition_for(&mounts, &ctx.app_data_dir),
        device_storage: partition_for(&mounts, &ctx.device_root),
    }
}

/// Sample and emit every category as its own structured event.
pub fn log_all(ctx: &mut ProbeContext, milestone: Milestone) -> PerformanceSample {
    let snapshot = sample(ctx);
    let m = milestone.label();
    info!(target: TARGET, milestone = m, "Just executed: {m}");

    let heap = &snapshot.heap;
    info!(target: TARGET, milestone = m, bytes = heap.total, "Total Memory: {} bytes", heap.total);
    info!(target: TARGET, milestone = m, bytes = heap.free, "Free Memory: {} bytes", heap.free);
    match heap.max {
        Some(max) => info!(target: TARGET, milestone = m, bytes = max, "Max Memory: {max} bytes"),
        None => info!(target: TARGET, milestone = m, "Max Memory: unlimited"),
    }
    info!(
        target: TARGET,
        milestone = m,
        bytes = heap.native_allocated,
        "Current allocated heap size: {} bytes",
        heap.native_allocated
    );

    emit_size(m, "Total Device Memory", snapshot.device.total);
    emit_size(m, "Available Device Memory", snapshot.device.available);
    if let Some(pss) = snapshot.proportional {
        emit_size(m, "App Anonymous Memory", pss.anon);
        emit_size(m, "App File Memory", pss.file);
        emit_size(m, "App Shared Memory", pss.shmem);
        emit_size(m, "App Total PSS", pss.total());
    }
    if let Some(storage) = snapshot.app_storage.as_ref() {
        emit_size(m, "App Data Total Storage", storage.total);
        emit_size(m, "App Data Available Storage", storage.available);
    }
    if let Some(storage) = snapshot.device_storage.as_ref() {
        emit_size(m, "Device Internal Storage Total", storage.total);
        emit_size(m, "Device Internal Storage Available", storage.available);
    }

    record_gauges(&snapshot);
    snapshot
}

fn emit_size(milestone: &'static str, what: &'static str, bytes: u64) {
    info!(target: TARGET, milestone, bytes, "{what}: {}", format_size(bytes));
}

fn record_gauges(snapshot: &PerformanceSample) {
    metrics::gauge!("perf_heap_total_bytes").set(snapshot.heap.total as f64);
    metrics::gauge!("perf_heap_free_bytes").set(snapshot.heap.free as f64);
    metrics::gauge!("perf_native_allocated_bytes").set(snapshot.heap.native_allocated as f64);
    metrics::gauge!("perf_device_memory_available_bytes").set(snapshot.device.available as f64);
    if let Some(pss) = snapshot.proportional {
        metrics::gauge!("perf_pss_total_bytes").set(pss.total() as f64);
    }
    if let Some(storage) = snapshot.app_storage.as_ref() {
        metrics::gauge!("perf_app_storage_available_bytes").set(storage.available as f64);
    }
}

#[cfg(target_os = "linux")]
fn heap_usage(ctx: &mut ProbeContext) -> HeapUsage {
    procfs::read_heap().unwrap_or_else(|| process_heap(ctx))
}

#[cfg(not(target_os = "linux"))]
fn heap_usage(ctx: &mut ProbeContext) -> HeapUsage {
    process_heap(ctx)
}

/// Portable fallback built from the process's virtual and resident sizes.
fn process_heap(ctx: &mut ProbeContext) -> HeapUsage {
    let Some(pid) = ctx.pid else {
        return HeapUsage::default();
    };
    ctx.system
        .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    match ctx.system.process(pid) {
        Some(process) => HeapUsage {
            total: process.virtual_memory(),
            free: process.virtual_memory().saturating_sub(process.memory()),
            max: None,
            native_allocated: process.memory(),
        },
        None => HeapUsage::default(),
    }
}

#[cfg(target_os = "linux")]
fn proportional_memory() -> Option<ProportionalMemory> {
    procfs::read_proportional()
}

#[cfg(not(target_os = "linux"))]
fn proportional_memory() -> Option<ProportionalMemory> {
    None
}

/// Partition holding `path`: the mount with the longest matching prefix.
fn partition_for(mounts: &[StorageUsage], path: &Path) -> Option<StorageUsage> {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    mounts
        .iter()
        .filter(|mount| resolved.starts_with(&mount.mount_point))
        .max_by_key(|mount| mount.mount_point.components().count())
        .cloned()
}
