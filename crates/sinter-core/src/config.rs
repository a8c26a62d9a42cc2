//! Per-pass configuration.
//!
//! The textual configuration loader lives outside this crate; the pass only
//! sees this small struct, read once per invocation.

use serde::{Deserialize, Serialize};

/// Hard upper bound on the multi-consumer budget. A configured budget above
/// this is rejected and falls back to 1.
pub const MAX_MULTI_CONSUMERS_IN_CLUSTER: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FusionConfig {
    /// Master switch for the whole pass.
    pub enabled: bool,

    /// Budget for multi-consumer / multi-output nodes per cluster.
    /// 0 disables the multi-consumer relaxation entirely.
    pub max_multi_consumers: usize,

    /// Honor clusters pre-extracted by the complex-operation expansion.
    pub honor_prebuilt_clusters: bool,

    /// Advertise dynamic-shape support to the external optimizer.
    pub supports_dynamic_shapes: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_multi_consumers: 1,
            honor_prebuilt_clusters: true,
            supports_dynamic_shapes: false,
        }
    }
}

impl FusionConfig {
    /// Read overrides from the environment (`SINTER_FUSION_*`).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("SINTER_FUSION_ENABLED") {
            cfg.enabled = v != "0" && v != "false";
        }
        if let Ok(v) = std::env::var("SINTER_FUSION_MAX_MULTI_CONSUMERS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.max_multi_consumers = n;
            }
        }
        if let Ok(v) = std::env::var("SINTER_FUSION_PREBUILT_CLUSTERS") {
            cfg.honor_prebuilt_clusters = v != "0" && v != "false";
        }
        if let Ok(v) = std::env::var("SINTER_FUSION_DYNAMIC_SHAPES") {
            cfg.supports_dynamic_shapes = v != "0" && v != "false";
        }
        cfg
    }

    /// The effective multi-consumer budget. Out-of-range values collapse to 1.
    pub fn clamped_budget(&self) -> usize {
        if self.max_multi_consumers > MAX_MULTI_CONSUMERS_IN_CLUSTER {
            log::warn!(
                "unsupported multi-consumer budget {}, falling back to 1",
                self.max_multi_consumers
            );
            1
        } else {
            self.max_multi_consumers
        }
    }

    pub fn multi_consumer_enabled(&self) -> bool {
        self.clamped_budget() > 0
    }
}
