use crate::batch::types::SchedulingMode;
use crate::error::{MuralError, Result};

/// Tunable knobs for a batch run.
///
/// Every field is clamped to its documented range when a run starts, so a
/// config assembled from untrusted input can be passed through as-is.
#[derive(Debug, Clone)]
pub struct BatchRunConfig {
    /// Maximum anchors generating concurrently, clamped to `[1, 16]`
    pub max_parallel: usize,
    /// Extra attempts after the first failed generation, clamped to `[0, 10]`
    pub max_generate_retries: u32,
    /// Extra attempts after the first failed parent job, clamped to `[0, 10]`
    pub parent_job_retries: u32,
    /// Parent worker tasks, clamped to `[1, 4]`
    pub parent_worker_concurrency: usize,
    /// Debounce window before flushing dirty leaves, clamped to `[0, 60_000]` ms
    pub parent_debounce_ms: u64,
    /// Successful waves per flush, clamped to `[1, 64]`
    pub parent_wave_batch_size: u32,
    /// Dirty leaves per flush, clamped to `[1, 10_000]`
    pub parent_leaf_batch_size: usize,
    /// Zoom levels a single parent job cascades upward, clamped to `[0, z]`
    pub parent_cascade_depth: u32,
    /// Wave formation strategy
    pub scheduling_mode: SchedulingMode,
}

impl Default for BatchRunConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_generate_retries: 3,
            parent_job_retries: 2,
            parent_worker_concurrency: 1,
            parent_debounce_ms: 1000,
            parent_wave_batch_size: 3,
            parent_leaf_batch_size: 256,
            parent_cascade_depth: 2,
            scheduling_mode: SchedulingMode::WaveBarrier,
        }
    }
}

impl BatchRunConfig {
    /// Return a copy with every knob forced into its valid range.
    ///
    /// `leaf_z` bounds the cascade depth: one parent job never climbs past
    /// the root zoom level.
    pub fn clamped(&self, leaf_z: u32) -> Self {
        Self {
            max_parallel: self.max_parallel.clamp(1, 16),
            max_generate_retries: self.max_generate_retries.min(10),
            parent_job_retries: self.parent_job_retries.min(10),
            parent_worker_concurrency: self.parent_worker_concurrency.clamp(1, 4),
            parent_debounce_ms: self.parent_debounce_ms.min(60_000),
            parent_wave_batch_size: self.parent_wave_batch_size.clamp(1, 64),
            parent_leaf_batch_size: self.parent_leaf_batch_size.clamp(1, 10_000),
            parent_cascade_depth: self.parent_cascade_depth.min(leaf_z),
            scheduling_mode: self.scheduling_mode,
        }
    }

    /// Build a config from `MURAL_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("MURAL_MAX_PARALLEL") {
            config.max_parallel = raw.parse().map_err(|e| {
                MuralError::Configuration(format!("invalid MURAL_MAX_PARALLEL: {e}"))
            })?;
        }

        if let Ok(raw) = std::env::var("MURAL_MAX_GENERATE_RETRIES") {
            config.max_generate_retries = raw.parse().map_err(|e| {
                MuralError::Configuration(format!("invalid MURAL_MAX_GENERATE_RETRIES: {e}"))
            })?;
        }

        if let Ok(raw) = std::env::var("MURAL_PARENT_JOB_RETRIES") {
            config.parent_job_retries = raw.parse().map_err(|e| {
                MuralError::Configuration(format!("invalid MURAL_PARENT_JOB_RETRIES: {e}"))
            })?;
        }

        if let Ok(raw) = std::env::var("MURAL_PARENT_WORKER_CONCURRENCY") {
            config.parent_worker_concurrency = raw.parse().map_err(|e| {
                MuralError::Configuration(format!("invalid MURAL_PARENT_WORKER_CONCURRENCY: {e}"))
            })?;
        }

        if let Ok(raw) = std::env::var("MURAL_PARENT_DEBOUNCE_MS") {
            config.parent_debounce_ms = raw.parse().map_err(|e| {
                MuralError::Configuration(format!("invalid MURAL_PARENT_DEBOUNCE_MS: {e}"))
            })?;
        }

        if let Ok(raw) = std::env::var("MURAL_PARENT_WAVE_BATCH_SIZE") {
            config.parent_wave_batch_size = raw.parse().map_err(|e| {
                MuralError::Configuration(format!("invalid MURAL_PARENT_WAVE_BATCH_SIZE: {e}"))
            })?;
        }

        if let Ok(raw) = std::env::var("MURAL_PARENT_LEAF_BATCH_SIZE") {
            config.parent_leaf_batch_size = raw.parse().map_err(|e| {
                MuralError::Configuration(format!("invalid MURAL_PARENT_LEAF_BATCH_SIZE: {e}"))
            })?;
        }

        if let Ok(raw) = std::env::var("MURAL_PARENT_CASCADE_DEPTH") {
            config.parent_cascade_depth = raw.parse().map_err(|e| {
                MuralError::Configuration(format!("invalid MURAL_PARENT_CASCADE_DEPTH: {e}"))
            })?;
        }

        if let Ok(raw) = std::env::var("MURAL_SCHEDULING_MODE") {
            config.scheduling_mode = raw.parse().map_err(|e: String| {
                MuralError::Configuration(format!("invalid MURAL_SCHEDULING_MODE: {e}"))
            })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BatchRunConfig::default();
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.max_generate_retries, 3);
        assert_eq!(config.parent_job_retries, 2);
        assert_eq!(config.parent_worker_concurrency, 1);
        assert_eq!(config.parent_debounce_ms, 1000);
        assert_eq!(config.parent_wave_batch_size, 3);
        assert_eq!(config.parent_leaf_batch_size, 256);
        assert_eq!(config.parent_cascade_depth, 2);
        assert_eq!(config.scheduling_mode, SchedulingMode::WaveBarrier);
    }

    #[test]
    fn clamps_out_of_range_values() {
        let config = BatchRunConfig {
            max_parallel: 99,
            max_generate_retries: 50,
            parent_job_retries: 50,
            parent_worker_concurrency: 0,
            parent_debounce_ms: 120_000,
            parent_wave_batch_size: 0,
            parent_leaf_batch_size: 1_000_000,
            parent_cascade_depth: 9,
            scheduling_mode: SchedulingMode::RollingFill,
        }
        .clamped(6);

        assert_eq!(config.max_parallel, 16);
        assert_eq!(config.max_generate_retries, 10);
        assert_eq!(config.parent_job_retries, 10);
        assert_eq!(config.parent_worker_concurrency, 1);
        assert_eq!(config.parent_debounce_ms, 60_000);
        assert_eq!(config.parent_wave_batch_size, 1);
        assert_eq!(config.parent_leaf_batch_size, 10_000);
        assert_eq!(config.parent_cascade_depth, 6);
    }

    #[test]
    fn cascade_depth_clamped_to_leaf_zoom() {
        let config = BatchRunConfig {
            parent_cascade_depth: 4,
            ..BatchRunConfig::default()
        }
        .clamped(1);
        assert_eq!(config.parent_cascade_depth, 1);
    }
}
