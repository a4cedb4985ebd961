//! Angular auto- and cross-correlation of scattered intensity (XCCA).
//!
//! The corrected frame is remapped onto a regular (q, φ) grid, each cell
//! holding the mean of the pixels that fall in it. Optionally the ring mean is
//! subtracted from every occupied cell. For radial bins `q1`, `q2` and angular
//! lag `k`:
//!
//! ```text
//! C(q1, q2, k) = Σ_l s(q1, l)·s(q2, l+k) / P(q1, q2, k)
//! ```
//!
//! where `P` counts the occupied cell pairs at that lag. With
//! [`Normalization::PairCountAndIntensity`] the result is further divided by
//! `I(q1)·I(q2)`, the ring-averaged intensities.
//!
//! The direct algorithm evaluates the sums explicitly; the FFT algorithm uses
//! the correlation theorem. Both agree to floating-point tolerance.
//!
//! # Example
//!
//! ```no_run
//! use frameproc::correlation::{CorrelationConfig, CorrelationEngine};
//! use frameproc::{DetectorLayout, PixelGeometry};
//!
//! let layout = DetectorLayout::new(2, 2, 64, 64);
//! let geometry = PixelGeometry::regular(&layout, 110.0);
//! let engine = CorrelationEngine::new(CorrelationConfig::default(), &geometry).unwrap();
//!
//! let frame = vec![1.0f32; layout.pixel_count()];
//! let result = engine.correlate(&frame, &geometry, None);
//! println!("C(q=3, lag=0) = {:?}", result.at(3, 3, 0));
//! ```

pub mod direct;
pub mod fft;
pub mod polar;

pub use fft::FftPlanCache;
pub use polar::{CorrelationLut, PolarGrid, PolarImage};

use anyhow::{ensure, Result};
use tracing::debug;

use crate::angular::QCalibration;
use crate::maps::PixelGeometry;

/// Which radial pairs are correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorrelationMode {
    /// `q1 == q2` only; output shape `n_q × n_lag`.
    #[default]
    Auto,
    /// Every `(q1, q2)`; output shape `n_q × n_q × n_lag`.
    Cross,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorrelationAlgorithm {
    Direct,
    #[default]
    Fft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Normalization {
    /// Divide by the number of contributing cell pairs.
    PairCount,
    /// Divide by the pair count and by `I(q1)·I(q2)`.
    #[default]
    PairCountAndIntensity,
}

/// How pixels are assigned to polar cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemapMode {
    /// Bin each pixel from its exact position on every call.
    #[default]
    Direct,
    /// Nearest node of an `nx × ny` lookup table built once.
    Lookup { nx: usize, ny: usize },
}

/// Configuration of the correlation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationConfig {
    /// Run the correlation on frames that are kept.
    /// Default: false
    pub enabled: bool,

    /// Number of radial bins.
    /// Default: 32
    pub n_q: usize,

    /// Number of angular bins.
    /// Default: 256
    pub n_phi: usize,

    /// Number of angular lags computed. `None` means `n_phi / 2 + 1`.
    /// Default: None
    pub n_lag: Option<usize>,

    /// Inner radius of the first radial bin, pixels.
    /// Default: 0.0
    pub q_min: f64,

    /// Outer radius of the last radial bin, pixels. `None` uses the largest
    /// pixel radius of the geometry.
    /// Default: None
    pub q_max: Option<f64>,

    /// Beam center offset relative to the geometry origin, pixels.
    /// Default: (0.0, 0.0)
    pub center: (f64, f64),

    pub mode: CorrelationMode,
    pub algorithm: CorrelationAlgorithm,
    pub normalization: Normalization,
    pub remap: RemapMode,

    /// Subtract the ring mean from each cell before correlating.
    /// Default: true
    pub subtract_angular_mean: bool,

    /// Convert radial bins to momentum transfer. Frames whose detector
    /// distance or wavelength is unusable then skip the correlation.
    /// Default: false
    pub q_calibrate: bool,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            n_q: 32,
            n_phi: 256,
            n_lag: None,
            q_min: 0.0,
            q_max: None,
            center: (0.0, 0.0),
            mode: CorrelationMode::Auto,
            algorithm: CorrelationAlgorithm::Fft,
            normalization: Normalization::PairCountAndIntensity,
            remap: RemapMode::Direct,
            subtract_angular_mean: true,
            q_calibrate: false,
        }
    }
}

impl CorrelationConfig {
    pub fn lags(&self) -> usize {
        self.n_lag.unwrap_or(self.n_phi / 2 + 1)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.n_q > 0, "correlation needs at least one radial bin");
        ensure!(self.n_phi >= 2, "correlation needs at least two angular bins");
        ensure!(
            self.lags() > 0 && self.lags() <= self.n_phi,
            "lag count {} outside 1..={}",
            self.lags(),
            self.n_phi
        );
        ensure!(self.q_min >= 0.0, "q_min is negative");
        if let Some(q_max) = self.q_max {
            ensure!(
                q_max > self.q_min,
                "q_max {} not above q_min {}",
                q_max,
                self.q_min
            );
        }
        Ok(())
    }

    /// Polar grid for `geometry`.
    pub fn grid(&self, geometry: &PixelGeometry) -> Result<PolarGrid> {
        self.validate()?;
        let q_max = match self.q_max {
            Some(q) => q,
            // Include the outermost pixel.
            None => geometry.max_radius() as f64 * (1.0 + 1e-6) + 1e-6,
        };
        ensure!(
            q_max > self.q_min,
            "q_max {} not above q_min {}",
            q_max,
            self.q_min
        );
        Ok(PolarGrid {
            n_q: self.n_q,
            n_phi: self.n_phi,
            q_min: self.q_min,
            q_max,
            center: self.center,
        })
    }
}

// ── Result ──────────────────────────────────────────────────────────────────

/// Correlation of one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationResult {
    pub mode: CorrelationMode,
    pub n_q: usize,
    pub n_lag: usize,
    /// Mean pixel intensity per radial bin.
    pub angular_average: Vec<f64>,
    /// Radial bin centers: pixels, or Å⁻¹ after [`calibrate`](Self::calibrate).
    pub q_values: Vec<f64>,
    /// `[q][lag]` for auto, `[q1][q2][lag]` for cross, row-major.
    pub values: Vec<f64>,
}

impl CorrelationResult {
    /// Value at `(q1, q2, lag)`. Auto results only hold `q1 == q2`.
    pub fn at(&self, q1: usize, q2: usize, lag: usize) -> Option<f64> {
        if q1 >= self.n_q || q2 >= self.n_q || lag >= self.n_lag {
            return None;
        }
        let idx = match self.mode {
            CorrelationMode::Auto if q1 == q2 => q1 * self.n_lag + lag,
            CorrelationMode::Auto => return None,
            CorrelationMode::Cross => (q1 * self.n_q + q2) * self.n_lag + lag,
        };
        self.values.get(idx).copied()
    }

    /// Lags `0..n_lag` of the `(q1, q2)` pair.
    pub fn lags(&self, q1: usize, q2: usize) -> Option<&[f64]> {
        let start = match self.mode {
            CorrelationMode::Auto if q1 == q2 && q1 < self.n_q => q1 * self.n_lag,
            CorrelationMode::Cross if q1 < self.n_q && q2 < self.n_q => {
                (q1 * self.n_q + q2) * self.n_lag
            }
            _ => return None,
        };
        self.values.get(start..start + self.n_lag)
    }

    /// Replace pixel radii with momentum transfer.
    pub fn calibrate(&mut self, calibration: &QCalibration) {
        self.q_values = calibration.calibrate(&self.q_values);
    }
}

// ── Shared kernel input ─────────────────────────────────────────────────────

/// Polar cell means ready for correlation.
pub struct Speckle {
    pub n_q: usize,
    pub n_phi: usize,
    /// Cell mean, ring mean subtracted if requested; 0 for empty cells.
    pub values: Vec<f64>,
    /// 1 for occupied cells, 0 otherwise.
    pub occupancy: Vec<f64>,
    pub angular_average: Vec<f64>,
}

impl Speckle {
    pub fn from_polar(polar: &PolarImage, subtract_mean: bool) -> Self {
        let (n_q, n_phi) = (polar.n_q(), polar.n_phi());
        let angular_average = polar.angular_average();
        let mut values = vec![0.0; n_q * n_phi];
        let mut occupancy = vec![0.0; n_q * n_phi];
        for q in 0..n_q {
            let mean = if subtract_mean { angular_average[q] } else { 0.0 };
            for phi in 0..n_phi {
                if let Some(v) = polar.cell_mean(q, phi) {
                    values[q * n_phi + phi] = v - mean;
                    occupancy[q * n_phi + phi] = 1.0;
                }
            }
        }
        Self {
            n_q,
            n_phi,
            values,
            occupancy,
            angular_average,
        }
    }

    pub fn row(&self, q: usize) -> &[f64] {
        &self.values[q * self.n_phi..(q + 1) * self.n_phi]
    }

    pub fn occupancy_row(&self, q: usize) -> &[f64] {
        &self.occupancy[q * self.n_phi..(q + 1) * self.n_phi]
    }
}

pub(crate) fn normalize(
    sum: f64,
    pair_count: f64,
    i1: f64,
    i2: f64,
    normalization: Normalization,
) -> f64 {
    if pair_count <= 0.0 {
        return 0.0;
    }
    let v = sum / pair_count;
    match normalization {
        Normalization::PairCount => v,
        Normalization::PairCountAndIntensity => {
            let denom = i1 * i2;
            if denom != 0.0 {
                v / denom
            } else {
                0.0
            }
        }
    }
}

fn radial_pairs(mode: CorrelationMode, n_q: usize) -> Vec<(usize, usize)> {
    match mode {
        CorrelationMode::Auto => (0..n_q).map(|q| (q, q)).collect(),
        CorrelationMode::Cross => (0..n_q)
            .flat_map(|a| (0..n_q).map(move |b| (a, b)))
            .collect(),
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// Correlation engine shared by all workers.
pub struct CorrelationEngine {
    config: CorrelationConfig,
    grid: PolarGrid,
    lut: Option<CorrelationLut>,
    plans: FftPlanCache,
}

impl CorrelationEngine {
    /// Build the polar grid, and the lookup table when the remap mode asks
    /// for one.
    pub fn new(config: CorrelationConfig, geometry: &PixelGeometry) -> Result<Self> {
        let grid = config.grid(geometry)?;
        let lut = match config.remap {
            RemapMode::Direct => None,
            RemapMode::Lookup { nx, ny } => Some(CorrelationLut::build(geometry, &grid, nx, ny)?),
        };
        debug!(
            "correlation engine: {}×{} polar grid, {} lags, {:?} {:?}",
            grid.n_q,
            grid.n_phi,
            config.lags(),
            config.mode,
            config.algorithm
        );
        Ok(Self {
            config,
            grid,
            lut,
            plans: FftPlanCache::new(),
        })
    }

    /// Use a precomputed lookup table instead of the one built from geometry.
    pub fn with_lut(mut self, lut: CorrelationLut) -> Result<Self> {
        lut.validate()?;
        ensure!(
            lut.matches(&self.grid),
            "lookup table was built for a different polar grid"
        );
        self.lut = Some(lut);
        Ok(self)
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    pub fn grid(&self) -> &PolarGrid {
        &self.grid
    }

    pub fn lut(&self) -> Option<&CorrelationLut> {
        self.lut.as_ref()
    }

    /// Remap a frame onto the polar grid.
    pub fn polar_image(
        &self,
        values: &[f32],
        geometry: &PixelGeometry,
        mask: Option<&[f32]>,
    ) -> PolarImage {
        match &self.lut {
            Some(lut) => PolarImage::from_lut(values, geometry, lut, mask),
            None => PolarImage::from_direct(values, geometry, &self.grid, mask),
        }
    }

    /// Correlate a frame. Pixels whose `mask` factor is zero are left out.
    pub fn correlate(
        &self,
        values: &[f32],
        geometry: &PixelGeometry,
        mask: Option<&[f32]>,
    ) -> CorrelationResult {
        let polar = self.polar_image(values, geometry, mask);
        self.correlate_polar(&polar)
    }

    /// Correlate an already remapped frame.
    pub fn correlate_polar(&self, polar: &PolarImage) -> CorrelationResult {
        let speckle = Speckle::from_polar(polar, self.config.subtract_angular_mean);
        let pairs = radial_pairs(self.config.mode, speckle.n_q);
        let n_lag = self.config.lags().min(speckle.n_phi);

        let values = match self.config.algorithm {
            CorrelationAlgorithm::Direct => {
                direct::correlate(&speckle, &pairs, n_lag, self.config.normalization)
            }
            CorrelationAlgorithm::Fft => fft::correlate(
                &speckle,
                &pairs,
                n_lag,
                self.config.normalization,
                &self.plans,
            ),
        };

        CorrelationResult {
            mode: self.config.mode,
            n_q: speckle.n_q,
            n_lag,
            angular_average: speckle.angular_average,
            q_values: self.grid.q_centers(),
            values,
        }
    }
}
