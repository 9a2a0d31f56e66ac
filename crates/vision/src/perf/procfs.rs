//! Readers for the Linux `/proc/self` files backing heap and PSS figures.
//!
//! Parsing is kept separate from file access so it can be exercised on any
//! platform.

use std::fs;

use super::{HeapUsage, ProportionalMemory};

/// Value of a `Name:   1234 kB` line, converted to bytes.
pub(crate) fn kb_field(text: &str, name: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let rest = line.strip_prefix(name)?.strip_prefix(':')?;
        let mut parts = rest.split_whitespace();
        let value: u64 = parts.next()?.parse().ok()?;
        match parts.next() {
            Some("kB") => Some(value.saturating_mul(1024)),
            _ => None,
        }
    })
}

/// Soft limit of a `/proc/self/limits` row; `None` when unlimited or absent.
pub(crate) fn soft_limit(text: &str, name: &str) -> Option<u64> {
    let line = text.lines().find(|line| line.starts_with(name))?;
    let soft = line[name.len()..].split_whitespace().next()?;
    soft.parse().ok()
}

pub(crate) fn heap_from(status: &str, limits: Option<&str>) -> Option<HeapUsage> {
    let total = kb_field(status, "VmData")?;
    let anon = kb_field(status, "RssAnon").unwrap_or(0);
    Some(HeapUsage {
        total,
        free: total.saturating_sub(anon),
        max: limits.and_then(|text| soft_limit(text, "Max data size")),
        native_allocated: anon,
    })
}

pub(crate) fn proportional_from(smaps_rollup: &str) -> Option<ProportionalMemory> {
    Some(ProportionalMemory {
        anon: kb_field(smaps_rollup, "Pss_Anon")?,
        file: kb_field(smaps_rollup, "Pss_File").unwrap_or(0),
        shmem: kb_field(smaps_rollup, "Pss_Shmem").unwrap_or(0),
    })
}

pub(crate) fn read_heap() -> Option<HeapUsage> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    let limits = fs::read_to_string("/proc/self/limits").ok();
    heap_from(&status, limits.as_deref())
}

pub(crate) fn read_proportional() -> Option<ProportionalMemory> {
    let text = fs::read_to_string("/proc/self/smaps_rollup").ok()?;
    proportional_from(&text)
}
