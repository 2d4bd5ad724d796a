//! Runtime-configurable tuning parameters for gradhook.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `GRADHOOK_`) or by constructing a custom `HookConfig`.

use std::time::Duration;

/// Tuning parameters for the in-process transport and coalesced broadcast.
#[derive(Debug, Clone)]
pub struct HookConfig {
    /// Timeout for each receive inside a collective.
    pub collective_timeout: Duration,

    /// Byte threshold used when coalescing tensors for broadcast.
    pub broadcast_bucket_bytes: usize,

    /// Number of coalesced broadcast runs allowed in flight at once.
    pub broadcast_pipeline_depth: usize,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            collective_timeout: Duration::from_secs(30),
            broadcast_bucket_bytes: 250 * 1024 * 1024, // 250 MiB
            broadcast_pipeline_depth: 2,
        }
    }
}

impl HookConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `GRADHOOK_COLLECTIVE_TIMEOUT_SECS`
    /// - `GRADHOOK_BROADCAST_BUCKET_BYTES`
    /// - `GRADHOOK_BROADCAST_PIPELINE_DEPTH`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("GRADHOOK_COLLECTIVE_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.collective_timeout = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("GRADHOOK_BROADCAST_BUCKET_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    cfg.broadcast_bucket_bytes = n;
                }
            }
        }
        if let Ok(v) = std::env::var("GRADHOOK_BROADCAST_PIPELINE_DEPTH") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.broadcast_pipeline_depth = n.max(1);
            }
        }

        cfg
    }
}
