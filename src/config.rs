//! Aggregates every named, defaulted tunable into one `Config` the host
//! constructs once and hands to the Scheduler/Reconciler. Plain struct with
//! a `Default` impl, not a file-format parser — the host owns config
//! sourcing (env, file, flags) rather than this crate introducing a
//! `config`/`figment`-style dependency it has no other use for.

use crate::chunking::ChunkingOptions;
use crate::clock::CalibrationConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub chunking: ChunkingOptions,
    pub calibration: CalibrationConfig,
    pub transport_message_timeout_ms: u64,
    /// Session-wide cap on bytes received into the ROWS/PAYLOAD staging area
    /// before the session aborts with `SyncError::StagingOverflow`.
    pub reconciler_max_staged_bytes: u64,
    pub clock_backward_fatal_ms: i64,
    /// Maximum `physical_ms` advance per `Clock::now()` call while absorbing
    /// a backward jump (see `clock_backward_fatal_ms`).
    pub clock_catchup_step_ms: i64,
    /// Page size used for every `enumerate_range` call; every component that
    /// walks a table needs one, so it lives here rather than being
    /// hardcoded per call site.
    pub enumerate_page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chunking: ChunkingOptions::default(),
            calibration: CalibrationConfig::default(),
            transport_message_timeout_ms: 30_000,
            reconciler_max_staged_bytes: 67_108_864,
            clock_backward_fatal_ms: 1_000,
            clock_catchup_step_ms: 100,
            enumerate_page_size: 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tunables() {
        let config = Config::default();
        assert_eq!(config.chunking.min_size, 32);
        assert_eq!(config.chunking.max_size, 10_000);
        assert_eq!(config.chunking.age_bucket_ms, 86_400_000);
        assert_eq!(config.calibration.samples, 5);
        assert_eq!(config.calibration.emergency_samples, 10);
        assert_eq!(config.calibration.offset_threshold_ms, 500);
        assert_eq!(config.calibration.ttl_ms, 60_000);
        assert_eq!(config.transport_message_timeout_ms, 30_000);
        assert_eq!(config.reconciler_max_staged_bytes, 67_108_864);
        assert_eq!(config.clock_backward_fatal_ms, 1_000);
        assert_eq!(config.clock_catchup_step_ms, 100);
    }
}
