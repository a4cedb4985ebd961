//! Per-frame fault types.
//!
//! Only faults that are local to a single frame are typed here. Setup and
//! load-time operations return `anyhow::Result`, and configuration mismatches
//! in calibration arrays are downgraded to neutral defaults (see
//! [`CorrectionMaps`](crate::CorrectionMaps)).

use thiserror::Error;

/// A numerical precondition required by an optional processing step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PreconditionError {
    /// Detector distance outside the range where the small-angle geometry holds.
    #[error("detector position {0} mm outside the accepted range (60, 600) mm")]
    DetectorDistance(f64),
    /// Wavelength undefined (NaN), infinite or not positive.
    #[error("wavelength {0} Å is undefined")]
    Wavelength(f64),
}

/// Fault raised while processing one frame.
///
/// `Input` drops the whole frame. `Precondition` only skips the named step;
/// the frame continues through the rest of the pipeline and the fault is
/// reported alongside the outcome.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("frame {sequence_id}: malformed input: {reason}")]
    Input { sequence_id: u64, reason: String },

    #[error("frame {sequence_id}: {step} skipped: {source}")]
    Precondition {
        sequence_id: u64,
        step: &'static str,
        #[source]
        source: PreconditionError,
    },
}

impl FrameError {
    pub fn input(sequence_id: u64, reason: impl Into<String>) -> Self {
        FrameError::Input {
            sequence_id,
            reason: reason.into(),
        }
    }

    pub fn precondition(sequence_id: u64, step: &'static str, source: PreconditionError) -> Self {
        FrameError::Precondition {
            sequence_id,
            step,
            source,
        }
    }
}
