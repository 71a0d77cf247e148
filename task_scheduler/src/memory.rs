//! Process memory sampling and the background monitor thread.
//!
//! The monitor only samples and sets a high-usage flag; it never
//! touches scheduling state. The loop reads the flag and decides.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::scheduler::SchedulerError;

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryUsage {
    pub rss_mb: f64,
    pub vms_mb: f64,
}

/// Read RSS and virtual size of the current process from
/// /proc/self/status (Linux only, like the rest of the service).
pub fn current_usage() -> Result<MemoryUsage, SchedulerError> {
    let status = std::fs::read_to_string("/proc/self/status")?;
    let mut usage = MemoryUsage::default();
    for line in status.lines() {
        if let Some(raw) = line.strip_prefix("VmRSS:") {
            usage.rss_mb = parse_status_kb(raw) / 1024.0;
        } else if let Some(raw) = line.strip_prefix("VmSize:") {
            usage.vms_mb = parse_status_kb(raw) / 1024.0;
        }
    }
    Ok(usage)
}

fn parse_status_kb(raw: &str) -> f64 {
    raw.trim()
        .trim_end_matches("kB")
        .trim()
        .parse::<f64>()
        .unwrap_or(0.0)
}

const MONITOR_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Background sampler with a shared RSS ceiling. `start` spawns the
/// thread, `stop` joins it; the ceiling can be retargeted live from a
/// config reload.
#[derive(Debug)]
pub struct MemoryMonitor {
    max_memory_mb: Arc<AtomicU64>,
    high_usage: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MemoryMonitor {
    pub fn new(max_memory_mb: u64) -> Self {
        Self {
            max_memory_mb: Arc::new(AtomicU64::new(max_memory_mb)),
            high_usage: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn set_limit_mb(&self, max_memory_mb: u64) {
        self.max_memory_mb.store(max_memory_mb, Ordering::Relaxed);
    }

    pub fn limit_mb(&self) -> u64 {
        self.max_memory_mb.load(Ordering::Relaxed)
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        self.stop.store(false, Ordering::Relaxed);
        let limit = Arc::clone(&self.max_memory_mb);
        let high = Arc::clone(&self.high_usage);
        let stop = Arc::clone(&self.stop);
        self.handle = Some(std::thread::spawn(move || {
            info!("started memory monitoring");
            while !stop.load(Ordering::Relaxed) {
                match current_usage() {
                    Ok(usage) => {
                        let over = usage.rss_mb > limit.load(Ordering::Relaxed) as f64;
                        if over && !high.load(Ordering::Relaxed) {
                            warn!(
                                "high memory usage detected: {:.1} MB rss (limit {} MB)",
                                usage.rss_mb,
                                limit.load(Ordering::Relaxed)
                            );
                        }
                        high.store(over, Ordering::Relaxed);
                    }
                    Err(err) => debug!("memory sample failed: {}", err),
                }
                // Sleep in short steps so stop() is not held up.
                let mut slept = Duration::ZERO;
                while slept < MONITOR_CHECK_INTERVAL && !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_secs(1));
                    slept += Duration::from_secs(1);
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("memory monitor thread panicked");
            } else {
                info!("stopped memory monitoring");
            }
        }
    }

    /// Flag set by the sampler thread; also refreshed here from a
    /// direct sample so the loop sees a breach even between samples.
    pub fn is_usage_high(&self) -> bool {
        if self.high_usage.load(Ordering::Relaxed) {
            return true;
        }
        match current_usage() {
            Ok(usage) => usage.rss_mb > self.max_memory_mb.load(Ordering::Relaxed) as f64,
            Err(_) => false,
        }
    }

    /// Periodic housekeeping entry point called from the loop.
    pub fn log_usage(&self) {
        match current_usage() {
            Ok(usage) => debug!(
                "memory usage: {:.1} MB rss, {:.1} MB vms (limit {} MB)",
                usage.rss_mb,
                usage.vms_mb,
                self.limit_mb()
            ),
            Err(err) => debug!("memory sample failed: {}", err),
        }
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_usage_reports_nonzero_rss() {
        let usage = current_usage().expect("proc status");
        assert!(usage.rss_mb > 0.0);
        assert!(usage.vms_mb >= usage.rss_mb);
    }

    #[test]
    fn parse_status_kb_handles_units() {
        assert_eq!(parse_status_kb("  2048 kB"), 2048.0);
        assert_eq!(parse_status_kb("garbage"), 0.0);
    }

    #[test]
    fn generous_limit_is_not_high() {
        let monitor = MemoryMonitor::new(1_000_000);
        assert!(!monitor.is_usage_high());
    }
}
