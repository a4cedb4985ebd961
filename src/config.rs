//! Pipeline configuration root.

use std::time::Duration;

use anyhow::{ensure, Result};

use crate::aggregate::{AggregateConfig, DARKCAL_CLASS};
use crate::angular::AngularConfig;
use crate::correction::CorrectionConfig;
use crate::correlation::CorrelationConfig;
use crate::hitfinder::HitfinderPolicy;

/// Admission control and flush cadence of the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Maximum number of frames processed concurrently.
    /// Default: 16
    pub pool_capacity: usize,

    /// Sleep between admission polls while the pool is full.
    /// Default: 10 ms
    pub poll_interval: Duration,

    /// Warm-up frames. Workers with an id at or below this only update the
    /// persistent background and hot-pixel state, then return.
    /// Default: 0
    pub start_frames: u64,

    /// Hand running sums to the sinks every this many submitted frames past
    /// warm-up, after waiting for in-flight frames to finish. `0` disables
    /// periodic flushes.
    /// Default: 1000
    pub save_interval: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 16,
            poll_interval: Duration::from_millis(10),
            start_frames: 0,
            save_interval: 1000,
        }
    }
}

/// Everything the pipeline needs besides calibration arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub corrections: CorrectionConfig,

    /// Classifiers run on every frame past warm-up, in order.
    /// Default: one connected-component policy named "standard"
    pub hitfinders: Vec<HitfinderPolicy>,

    pub aggregate: AggregateConfig,

    /// Angular correlation; `None` disables it.
    /// Default: None
    pub correlation: Option<CorrelationConfig>,

    pub angular: AngularConfig,

    pub dispatch: DispatchConfig,

    /// Treat every frame as kept: assemble, correlate and pass on the full
    /// buffers regardless of classification.
    /// Default: false
    pub dump_all: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            corrections: CorrectionConfig::default(),
            hitfinders: vec![HitfinderPolicy::default()],
            aggregate: AggregateConfig::default(),
            correlation: None,
            angular: AngularConfig::default(),
            dispatch: DispatchConfig::default(),
            dump_all: false,
        }
    }
}

impl PipelineConfig {
    /// Range checks, run once before any frame is processed.
    pub fn validate(&self, pixel_count: usize) -> Result<()> {
        ensure!(pixel_count > 0, "detector has no pixels");
        ensure!(
            self.dispatch.pool_capacity > 0,
            "pool capacity must be at least one"
        );
        self.corrections.validate()?;
        for policy in &self.hitfinders {
            policy.validate(pixel_count)?;
            ensure!(
                policy.name != DARKCAL_CLASS,
                "hitfinder policy name {:?} is reserved",
                DARKCAL_CLASS
            );
        }
        for (i, a) in self.hitfinders.iter().enumerate() {
            ensure!(
                !self.hitfinders[..i].iter().any(|b| b.name == a.name),
                "hitfinder policy {} defined twice",
                a.name
            );
        }
        if let Some(correlation) = &self.correlation {
            correlation.validate()?;
        }
        self.angular.validate()?;
        Ok(())
    }
}
