//! Figma process detection with short-lived result caching.
//!
//! Detection is a full process-table scan, so results are cached for a small
//! TTL to bound scan frequency independently of the poll interval. A failed
//! scan resolves to "not detected" and never escapes this module.

use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, System};
use tracing::{debug, warn};

/// How long a scan result stays valid. Callers invoking [`ProcessDetector::check`]
/// faster than this (manual checks, short poll intervals) get the cached answer.
pub const CACHE_TTL: Duration = Duration::from_millis(2000);

/// Process names that identify a running Figma desktop app, lowercase.
#[cfg(target_os = "windows")]
const TARGET_PROCESSES: &[&str] = &["figma.exe", "figmaagent.exe"];
#[cfg(target_os = "macos")]
const TARGET_PROCESSES: &[&str] = &["figma", "figma helper"];
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const TARGET_PROCESSES: &[&str] = &["figma-linux", "figma"];

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("process query failed: {0}")]
    Query(String),
}

/// Capability for asking the OS whether the target application is running.
/// One variant per platform backend, selected at construction time.
pub trait ProcessProbe {
    fn scan(&mut self) -> Result<bool, ProbeError>;
}

/// Probe backed by the OS process table via `sysinfo`.
pub struct SystemProcessProbe {
    system: System,
}

impl SystemProcessProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SystemProcessProbe {
    fn scan(&mut self) -> Result<bool, ProbeError> {
        self.system
            .refresh_processes_specifics(ProcessRefreshKind::new());
        Ok(self
            .system
            .processes()
            .values()
            .any(|process| name_matches_target(process.name())))
    }
}

fn name_matches_target(name: &str) -> bool {
    let name = name.to_lowercase();
    TARGET_PROCESSES.iter().any(|target| name.contains(target))
}

struct CachedResult {
    observed_at: Instant,
    detected: bool,
}

/// Detector facade over a [`ProcessProbe`] with TTL caching.
pub struct ProcessDetector {
    probe: Box<dyn ProcessProbe>,
    cache_ttl: Duration,
    cached: Option<CachedResult>,
}

impl ProcessDetector {
    pub fn new(probe: Box<dyn ProcessProbe>) -> Self {
        Self {
            probe,
            cache_ttl: CACHE_TTL,
            cached: None,
        }
    }

    /// Returns whether the target application is currently running.
    ///
    /// Serves the cached result while it is fresh. A probe failure returns
    /// `false` without caching, so the next call retries the scan.
    pub fn check(&mut self) -> bool {
        if let Some(cached) = &self.cached {
            if cached.observed_at.elapsed() < self.cache_ttl {
                return cached.detected;
            }
        }

        match self.probe.scan() {
            Ok(detected) => {
                debug!(detected, "Process scan completed");
                self.cached = Some(CachedResult {
                    observed_at: Instant::now(),
                    detected,
                });
                detected
            }
            Err(err) => {
                warn!(error = %err, "Process scan failed, treating as not detected");
                self.cached = None;
                false
            }
        }
    }

    /// Forces the next [`check`](Self::check) to bypass the TTL. Used by
    /// manual one-shot checks.
    pub fn clear_cache(&mut self) {
        self.cached = None;
    }
}
