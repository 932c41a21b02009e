//! Host facts for the `--utilization` report.
//!
//! Reports the basics the ingestion side prices on: hostname, logical
//! processors, and total RAM, each overridable from configuration. Cloud
//! and container probing is deliberately absent.

use serde_json::json;
use teld_core::config::UtilizationConfig;

/// Gather host facts as a JSON document.
#[must_use]
pub fn gather(cfg: &UtilizationConfig) -> serde_json::Value {
    let hostname = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();

    let logical_processors = cfg.logical_processors.unwrap_or_else(|| {
        std::thread::available_parallelism().map_or(1, |n| n.get() as u64)
    });

    let total_ram_mib = cfg.total_ram_mib.or_else(meminfo_total_mib);

    let mut facts = json!({
        "metadata_version": 1,
        "hostname": hostname,
        "logical_processors": logical_processors,
        "total_ram_mib": total_ram_mib,
    });
    if !cfg.billing_hostname.is_empty() {
        facts["billing_hostname"] = json!(cfg.billing_hostname);
    }
    facts
}

fn meminfo_total_mib() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib / 1024)
}
