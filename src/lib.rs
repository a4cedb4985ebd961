//! # frameproc
//!
//! Real-time, per-shot processing core for a tiled pixel-array detector
//! running inside a streaming acquisition loop.
//!
//! For every incoming frame the pipeline:
//!
//! 1. applies the pixel correction chain (dark offset, common mode, gain,
//!    bad pixels, persistent background, hot pixels),
//! 2. classifies the frame under any number of independently configured
//!    hitfinder policies,
//! 3. optionally computes the angular auto/cross-correlation of the corrected
//!    intensities (directly or through FFTs),
//! 4. folds the frame into running per-class aggregates,
//! 5. hands the result to the configured [`FrameSink`]s.
//!
//! Frames are processed concurrently, one OS thread per in-flight frame,
//! bounded by the pool capacity of the [`FrameDispatcher`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use frameproc::{
//!     CorrectionMaps, DetectorLayout, Frame, FrameDispatcher, FrameMetadata, MemorySink,
//!     PipelineConfig,
//! };
//!
//! let layout = DetectorLayout::new(2, 2, 32, 32);
//! let maps = CorrectionMaps::builder(layout).build();
//! let sink = Arc::new(MemorySink::default());
//! let dispatcher =
//!     FrameDispatcher::new(PipelineConfig::default(), maps, vec![sink.clone()]).unwrap();
//!
//! let raw = vec![0u16; layout.pixel_count()];
//! dispatcher.submit(Frame::new(raw, FrameMetadata::default()));
//! let stats = dispatcher.finish();
//! println!("processed {} frames, {} hits", stats.completed, stats.hits);
//! ```
//!
//! ## Collaborators
//!
//! Acquisition, calibration-file parsing and persistence live outside this
//! crate. Calibration arrays arrive already parsed into memory
//! ([`CorrectionMaps::builder`]); results leave through [`FrameSink`].

pub mod aggregate;
pub mod angular;
pub mod assemble;
pub mod commonmode;
pub mod config;
pub mod context;
pub mod correction;
pub mod correlation;
pub mod detector;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod hitfinder;
pub mod maps;
pub mod peakdetect;
pub mod sink;
pub mod worker;

pub use aggregate::{AggregateConfig, AggregateSnapshot, Aggregator, RunningAggregate};
pub use angular::{angular_average, QCalibration};
pub use commonmode::{CommonModeAlgorithm, CommonModeConfig};
pub use config::{DispatchConfig, PipelineConfig};
pub use context::{Calibration, PipelineContext};
pub use correction::{BackgroundConfig, CorrectionConfig, CorrectionPipeline, HotPixelConfig};
pub use correlation::{
    CorrelationAlgorithm, CorrelationConfig, CorrelationEngine, CorrelationLut, CorrelationMode,
    CorrelationResult, Normalization, RemapMode,
};
pub use detector::DetectorLayout;
pub use dispatcher::{DispatchStats, FrameDispatcher};
pub use error::{FrameError, PreconditionError};
pub use frame::{Frame, FrameMetadata};
pub use hitfinder::{HitAlgorithm, HitOutcome, Hitfinder, HitfinderPolicy, PolicyRole};
pub use maps::{CorrectionMaps, MapStatus, PixelGeometry};
pub use peakdetect::{find_all, Extremum, PeakSet};
pub use sink::{FrameSink, MemorySink};
pub use worker::{ClassifierOutcome, FrameOutcome};

// Pixel positions are stored in single precision; accumulators use f64.
pub type Vector3 = nalgebra::Vector3<f32>;
