//! Shared helpers for the ring buffer benchmarks.

pub fn temp_ring_name(label: &str) -> String {
    let pid = std::process::id();
    format!("ffado_bench_{label}_{pid}")
}
