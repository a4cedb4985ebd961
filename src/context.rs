//! State shared by every worker of one pipeline.
//!
//! Each field carries its own synchronization. The calibration maps and the
//! correlation engine built from their geometry form one [`Calibration`]
//! snapshot behind a read-write lock that only recalibration writes. The
//! correction chain and aggregator lock per stage and per class, and hit
//! counters are atomics. Nothing takes a lock spanning two of them.

use std::sync::Arc;

use anyhow::{ensure, Context as _, Result};
use parking_lot::RwLock;
use tracing::info;

use crate::aggregate::Aggregator;
use crate::config::PipelineConfig;
use crate::correction::CorrectionPipeline;
use crate::correlation::{CorrelationEngine, CorrelationLut};
use crate::detector::DetectorLayout;
use crate::hitfinder::Hitfinder;
use crate::maps::CorrectionMaps;

/// Calibration maps together with the correlation engine set up for their
/// geometry. Replaced as a unit, so a frame never sees one without the other.
pub struct Calibration {
    maps: CorrectionMaps,
    correlation: Option<CorrelationEngine>,
}

impl Calibration {
    pub fn maps(&self) -> &CorrectionMaps {
        &self.maps
    }

    pub fn correlation(&self) -> Option<&CorrelationEngine> {
        self.correlation.as_ref()
    }
}

pub struct PipelineContext {
    config: PipelineConfig,
    layout: DetectorLayout,
    calibration: RwLock<Arc<Calibration>>,
    corrections: CorrectionPipeline,
    hitfinders: Vec<Hitfinder>,
    aggregator: Aggregator,
}

impl PipelineContext {
    /// Validate `config` against the detector of `maps` and set up every
    /// shared stage.
    pub fn new(config: PipelineConfig, maps: CorrectionMaps) -> Result<Self> {
        Self::build(config, maps, None)
    }

    /// Like [`new`](Self::new), remapping through a precomputed lookup table.
    pub fn with_correlation_lut(
        config: PipelineConfig,
        maps: CorrectionMaps,
        lut: CorrelationLut,
    ) -> Result<Self> {
        Self::build(config, maps, Some(lut))
    }

    fn build(config: PipelineConfig, maps: CorrectionMaps, lut: Option<CorrelationLut>) -> Result<Self> {
        let layout = *maps.layout();
        let pixel_count = layout.pixel_count();
        config
            .validate(pixel_count)
            .context("invalid pipeline configuration")?;

        let correlation = build_correlation(&config, &maps, lut)?;
        let corrections = CorrectionPipeline::new(config.corrections.clone(), pixel_count);
        let hitfinders: Vec<Hitfinder> = config
            .hitfinders
            .iter()
            .cloned()
            .map(Hitfinder::new)
            .collect();
        let aggregator = Aggregator::new(
            config.aggregate.clone(),
            config.hitfinders.iter().map(|p| p.name.clone()),
            pixel_count,
        );

        info!(
            "pipeline ready: {} modules, {} pixels, {} hitfinders, correlation {}",
            layout.module_count(),
            pixel_count,
            hitfinders.len(),
            if correlation.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            config,
            layout,
            calibration: RwLock::new(Arc::new(Calibration { maps, correlation })),
            corrections,
            hitfinders,
            aggregator,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &DetectorLayout {
        &self.layout
    }

    /// Current calibration. Workers hold the returned `Arc` for the whole
    /// frame.
    pub fn calibration(&self) -> Arc<Calibration> {
        self.calibration.read().clone()
    }

    pub fn corrections(&self) -> &CorrectionPipeline {
        &self.corrections
    }

    pub fn hitfinders(&self) -> &[Hitfinder] {
        &self.hitfinders
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Swap in new calibration maps, rebuilding the correlation grid for the
    /// new geometry. Callers must make sure no frame is in flight.
    pub(crate) fn replace_maps(&self, maps: CorrectionMaps) -> Result<()> {
        ensure!(
            *maps.layout() == self.layout,
            "new maps are for a {}×{} detector, pipeline runs {}×{}",
            maps.layout().width(),
            maps.layout().height(),
            self.layout.width(),
            self.layout.height()
        );
        let correlation = build_correlation(&self.config, &maps, None)?;
        *self.calibration.write() = Arc::new(Calibration { maps, correlation });
        info!("calibration maps replaced");
        Ok(())
    }
}

fn build_correlation(
    config: &PipelineConfig,
    maps: &CorrectionMaps,
    lut: Option<CorrelationLut>,
) -> Result<Option<CorrelationEngine>> {
    let Some(cc) = config.correlation.as_ref().filter(|c| c.enabled) else {
        return Ok(None);
    };
    let engine = CorrelationEngine::new(cc.clone(), maps.geometry())
        .context("failed to set up the correlation engine")?;
    let engine = match lut {
        Some(lut) => engine.with_lut(lut)?,
        None => engine,
    };
    Ok(Some(engine))
}
