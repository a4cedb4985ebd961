//! The per-frame flow run by every worker.
//!
//! ```text
//! validate → correct → classify → background update (non-hits)
//!   → [warm-up frames stop here]
//!   → attenuation → intensity average
//!   → kept frames: polarization, angular average, correlation, assembly
//!   → running sums
//! ```
//!
//! Everything the frame allocates is owned by the stack of [`process_frame`]
//! and released when it returns, on every path.

use tracing::{debug, info, warn};

use crate::angular::{angular_average, AngularProfile, QCalibration};
use crate::assemble::assemble_image;
use crate::context::PipelineContext;
use crate::correction::beam::apply_attenuation;
use crate::correlation::CorrelationResult;
use crate::error::FrameError;
use crate::frame::{Frame, FrameMetadata};
use crate::hitfinder::PolicyRole;

/// Outcome of one classifier policy on one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierOutcome {
    pub name: String,
    pub role: PolicyRole,
    pub is_hit: bool,
    pub peak_count: usize,
    /// The outcome selects the frame for this policy's class.
    pub selected: bool,
}

/// Everything a worker produced for one frame.
#[derive(Debug, Clone)]
pub struct FrameOutcome {
    pub worker_id: u64,
    pub metadata: FrameMetadata,
    pub event_name: String,
    /// Warm-up frame: only the cross-frame correction state was updated.
    pub digested: bool,
    /// Corrected pixels, raw layout.
    pub corrected: Vec<f32>,
    /// Common-mode level subtracted per module.
    pub common_mode: Vec<f32>,
    pub hot_pixels: usize,
    pub classifications: Vec<ClassifierOutcome>,
    /// Some hit-role policy fired.
    pub is_hit: bool,
    /// Selected for full output: assembled, correlated and passed on.
    pub kept: bool,
    /// Mean corrected intensity.
    pub intensity_average: f64,
    pub assembled: Option<Vec<f32>>,
    pub angular: Option<AngularProfile>,
    pub correlation: Option<CorrelationResult>,
    /// Optional steps skipped for this frame only.
    pub skipped: Vec<FrameError>,
}

impl FrameOutcome {
    /// Textual log line: sequence id, timestamp, event name, average
    /// intensity and per-classifier peak counts.
    pub fn log_line(&self) -> String {
        let mut line = format!(
            "{} {:.6} {} avg={:.3}",
            self.metadata.sequence_id,
            self.metadata.timestamp(),
            self.event_name,
            self.intensity_average
        );
        for c in &self.classifications {
            line.push_str(&format!(
                " {}={}{}",
                c.name,
                c.peak_count,
                if c.is_hit { "*" } else { "" }
            ));
        }
        if self.digested {
            line.push_str(" (warm-up)");
        }
        line
    }
}

/// Run one frame through the pipeline.
///
/// Only an input fault fails the frame; precondition faults of optional
/// steps are collected in [`FrameOutcome::skipped`].
pub fn process_frame(
    ctx: &PipelineContext,
    worker_id: u64,
    frame: Frame,
) -> Result<FrameOutcome, FrameError> {
    frame.validate(ctx.layout())?;
    let Frame { raw, metadata } = frame;
    let id = metadata.sequence_id;

    let config = ctx.config();
    let calibration = ctx.calibration();
    let maps = calibration.maps();
    let layout = ctx.layout();

    let corrected = ctx.corrections().apply(&raw, maps);
    drop(raw);

    let classifications: Vec<ClassifierOutcome> = ctx
        .hitfinders()
        .iter()
        .map(|hf| {
            let outcome = hf.classify(&corrected.pixels, layout);
            ClassifierOutcome {
                name: hf.name().to_string(),
                role: hf.policy().role,
                is_hit: outcome.is_hit,
                peak_count: outcome.peak_count,
                selected: hf.selects(&outcome),
            }
        })
        .collect();
    let is_hit = classifications
        .iter()
        .any(|c| c.role == PolicyRole::Hit && c.is_hit);

    if !is_hit {
        ctx.corrections()
            .update_background(&corrected, metadata.gmd_mj);
    }

    let event_name = metadata.event_name();
    let mut outcome = FrameOutcome {
        worker_id,
        event_name,
        digested: false,
        common_mode: corrected.common_mode,
        hot_pixels: corrected.hot_pixels,
        corrected: corrected.pixels,
        classifications,
        is_hit,
        kept: false,
        intensity_average: 0.0,
        assembled: None,
        angular: None,
        correlation: None,
        skipped: Vec::new(),
        metadata,
    };

    if worker_id <= config.dispatch.start_frames {
        outcome.digested = true;
        outcome.intensity_average = mean(&outcome.corrected);
        debug!(target: "frameproc::frame", "{}", outcome.log_line());
        return Ok(outcome);
    }

    if let Some(table) = &config.corrections.attenuation {
        match outcome.metadata.filter_thickness_um {
            Some(thickness) => match table.factor(thickness) {
                Some(factor) => apply_attenuation(&mut outcome.corrected, factor),
                None => warn!(
                    "frame {}: no attenuation entry for {} µm of filters, not corrected",
                    id, thickness
                ),
            },
            None => debug!("frame {}: no filter thickness, attenuation skipped", id),
        }
    }

    outcome.intensity_average = mean(&outcome.corrected);
    outcome.kept = config.dump_all
        || ctx
            .hitfinders()
            .iter()
            .zip(&outcome.classifications)
            .any(|(hf, c)| hf.policy().save_hits && c.selected);

    let geometry = maps.geometry();
    let mask = config
        .corrections
        .apply_bad_pixel_mask
        .then(|| maps.good_pixels());

    if outcome.kept {
        if let Some(polarization) = &config.corrections.polarization {
            if let Err(e) = polarization.apply(
                &mut outcome.corrected,
                geometry,
                outcome.metadata.detector_position_mm,
            ) {
                outcome
                    .skipped
                    .push(FrameError::precondition(id, "polarization correction", e));
            }
        }

        if config.angular.enabled {
            let mut profile = angular_average(&outcome.corrected, geometry, mask, &config.angular);
            match QCalibration::new(
                outcome.metadata.detector_position_mm,
                outcome.metadata.wavelength_a,
                geometry.pixel_size_um as f64,
            ) {
                Ok(cal) => profile.q = Some(cal.calibrate(&profile.radius)),
                Err(e) => outcome
                    .skipped
                    .push(FrameError::precondition(id, "q calibration", e)),
            }
            outcome.angular = Some(profile);
        }

        if let Some(engine) = calibration.correlation() {
            let q_cal = if engine.config().q_calibrate {
                QCalibration::new(
                    outcome.metadata.detector_position_mm,
                    outcome.metadata.wavelength_a,
                    geometry.pixel_size_um as f64,
                )
                .map(Some)
            } else {
                Ok(None)
            };
            match q_cal {
                Ok(q_cal) => {
                    let mut result = engine.correlate(&outcome.corrected, geometry, mask);
                    if let Some(cal) = &q_cal {
                        result.calibrate(cal);
                    }
                    outcome.correlation = Some(result);
                }
                Err(e) => outcome
                    .skipped
                    .push(FrameError::precondition(id, "correlation", e)),
            }
        }

        outcome.assembled = Some(assemble_image(&outcome.corrected, geometry));
    }

    for e in &outcome.skipped {
        warn!("{}", e);
    }

    let aggregator = ctx.aggregator();
    let assembled = outcome.assembled.as_deref();
    let correlation = outcome.correlation.as_ref().map(|c| c.values.as_slice());
    for (hf, c) in ctx.hitfinders().iter().zip(&outcome.classifications) {
        if hf.policy().accumulate && c.selected {
            aggregator.accumulate(hf.name(), &outcome.corrected, assembled, correlation);
        }
    }
    aggregator.accumulate_darkcal(&outcome.corrected, assembled);

    info!(target: "frameproc::frame", "{}", outcome.log_line());
    Ok(outcome)
}

fn mean(values: &[f32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64
}
