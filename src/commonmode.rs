//! Per-module common-mode estimation and subtraction.
//!
//! Every module (tile) shares one readout amplifier, so a single electronic
//! offset is estimated per module per frame from a histogram of that module's
//! corrected pixel values and subtracted from all of its pixels. Histograms are
//! call-local; nothing here touches shared state.

use tracing::warn;

use crate::correction::ADC_LIMIT;
use crate::detector::{DetectorLayout, PixelRegion};
use crate::peakdetect::find_all_labeled;

/// How the per-module offset is found in the histogram.
#[derive(Debug, Clone, PartialEq)]
pub enum CommonModeAlgorithm {
    /// Right-most histogram maximum whose preceding minimum is lower by more
    /// than `peak_gap` counts, searched within `[window_min, window_max]` ADC.
    Peak {
        window_min: i32,
        window_max: i32,
        /// Noise delta handed to the peak detector, in counts.
        delta: f64,
        /// Required height of the maximum above its preceding minimum, in counts.
        peak_gap: f64,
    },
    /// First ADC bin at which the cumulative count exceeds
    /// `floor × module pixel count`.
    Median { floor: f32 },
    /// [`Median`](CommonModeAlgorithm::Median) applied to each cell of an
    /// `divisions × divisions` subdivision of every module.
    SubModule { divisions: usize, floor: f32 },
}

/// Configuration for common-mode subtraction.
#[derive(Debug, Clone, PartialEq)]
pub struct CommonModeConfig {
    pub algorithm: CommonModeAlgorithm,

    /// Modules known to be defective. Their common mode is forced to zero
    /// and they never raise a missing-peak warning.
    /// Default: empty
    pub excluded_modules: Vec<usize>,

    /// Lowest ADC bin a histogram may span; values below are counted in it.
    /// Default: -32767
    pub histogram_min: i32,

    /// Highest ADC bin a histogram may span; values above are counted in it.
    /// Default: 32767
    pub histogram_max: i32,
}

impl Default for CommonModeConfig {
    fn default() -> Self {
        Self {
            algorithm: CommonModeAlgorithm::Median { floor: 0.1 },
            excluded_modules: Vec::new(),
            histogram_min: -(ADC_LIMIT as i32),
            histogram_max: ADC_LIMIT as i32,
        }
    }
}

impl CommonModeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.histogram_min < self.histogram_max,
            "common-mode histogram range [{}, {}] is empty",
            self.histogram_min,
            self.histogram_max
        );
        match self.algorithm {
            CommonModeAlgorithm::Peak {
                window_min,
                window_max,
                delta,
                peak_gap,
            } => {
                anyhow::ensure!(
                    window_min < window_max,
                    "common-mode peak window [{}, {}] is empty",
                    window_min,
                    window_max
                );
                anyhow::ensure!(delta >= 0.0 && peak_gap >= 0.0, "negative peak delta or gap");
            }
            CommonModeAlgorithm::Median { floor } => check_floor(floor)?,
            CommonModeAlgorithm::SubModule { divisions, floor } => {
                anyhow::ensure!(divisions > 0, "sub-module divisions must be positive");
                check_floor(floor)?;
            }
        }
        Ok(())
    }
}

fn check_floor(floor: f32) -> anyhow::Result<()> {
    anyhow::ensure!(
        (0.0..1.0).contains(&floor),
        "common-mode floor {} outside [0, 1)",
        floor
    );
    Ok(())
}

// ── Histogram ───────────────────────────────────────────────────────────────

/// Integer-binned histogram spanning the occupied range of one tile.
///
/// Each bin also keeps the sum of the values it counted, so a level is
/// reported as the mean of its bin rather than the bin's integer label.
struct Histogram {
    offset: i32,
    counts: Vec<u32>,
    sums: Vec<f64>,
    total: usize,
}

impl Histogram {
    fn build(values: &[f32], min: i32, max: i32) -> Self {
        let bin_of = |v: f32| (v.round() as i32).clamp(min, max);
        let (lo, hi) = values
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if lo > hi {
            return Self {
                offset: min,
                counts: Vec::new(),
                sums: Vec::new(),
                total: 0,
            };
        }

        let offset = bin_of(lo);
        let len = (bin_of(hi) - offset + 1) as usize;
        let mut counts = vec![0u32; len];
        let mut sums = vec![0.0f64; len];
        for &v in values {
            let i = (bin_of(v) - offset) as usize;
            counts[i] += 1;
            sums[i] += v as f64;
        }
        Self {
            offset,
            counts,
            sums,
            total: values.len(),
        }
    }

    /// Mean of the values counted in bin `adc`.
    fn level(&self, adc: i32) -> f32 {
        let i = (adc - self.offset) as usize;
        match self.counts.get(i) {
            Some(&n) if n > 0 => (self.sums[i] / n as f64) as f32,
            _ => adc as f32,
        }
    }

    fn median(&self, floor: f32) -> f32 {
        let threshold = floor as f64 * self.total as f64;
        let mut cumulative = 0u64;
        for (i, &c) in self.counts.iter().enumerate() {
            cumulative += c as u64;
            if cumulative as f64 > threshold {
                return self.level(self.offset + i as i32);
            }
        }
        0.0
    }

    fn peak(&self, window_min: i32, window_max: i32, delta: f64, peak_gap: f64) -> Option<f32> {
        let lo = window_min.max(self.offset);
        let hi = window_max.min(self.offset + self.counts.len() as i32 - 1);
        if lo > hi {
            return None;
        }

        // An empty bin at each end closes a peak sitting on the window edge.
        let mut labels = Vec::with_capacity((hi - lo + 3) as usize);
        let mut values = Vec::with_capacity(labels.capacity());
        labels.push((lo - 1) as f64);
        values.push(0.0);
        for adc in lo..=hi {
            labels.push(adc as f64);
            values.push(self.counts[(adc - self.offset) as usize] as f64);
        }
        labels.push((hi + 1) as f64);
        values.push(0.0);

        let peaks = find_all_labeled(&labels, &values, delta);
        (0..peaks.maxima.len()).rev().find_map(|i| {
            let max = peaks.maxima[i];
            let min = peaks.preceding_minimum(i)?;
            (max.y - min.y > peak_gap).then(|| self.level(max.x as i32))
        })
    }
}

// ── Subtraction ─────────────────────────────────────────────────────────────

/// Estimate and subtract the common mode of every module in place.
///
/// Returns the level subtracted from each module (for sub-module mode, the
/// mean of that module's cell levels).
pub fn subtract_common_mode(
    corrected: &mut [f32],
    layout: &DetectorLayout,
    config: &CommonModeConfig,
) -> Vec<f32> {
    let mut levels = vec![0.0f32; layout.module_count()];

    for (module, level) in levels.iter_mut().enumerate() {
        if config.excluded_modules.contains(&module) {
            continue;
        }

        match config.algorithm {
            CommonModeAlgorithm::SubModule { divisions, floor } => {
                let cells = layout.sub_regions(module, divisions);
                let mut sum = 0.0;
                for cell in &cells {
                    let cell_level = histogram(corrected, layout, *cell, config).median(floor);
                    subtract(corrected, layout, *cell, cell_level);
                    sum += cell_level;
                }
                *level = sum / cells.len().max(1) as f32;
            }
            CommonModeAlgorithm::Peak {
                window_min,
                window_max,
                delta,
                peak_gap,
            } => {
                let region = layout.module_region(module);
                *level = histogram(corrected, layout, region, config)
                    .peak(window_min, window_max, delta, peak_gap)
                    .unwrap_or_else(|| {
                        warn!(
                            "module {}: no common-mode peak found, using 0",
                            layout.module_id(module)
                        );
                        0.0
                    });
                subtract(corrected, layout, region, *level);
            }
            CommonModeAlgorithm::Median { floor } => {
                let region = layout.module_region(module);
                *level = histogram(corrected, layout, region, config).median(floor);
                subtract(corrected, layout, region, *level);
            }
        }
    }
    levels
}

fn histogram(
    corrected: &[f32],
    layout: &DetectorLayout,
    region: PixelRegion,
    config: &CommonModeConfig,
) -> Histogram {
    let values: Vec<f32> = layout.region_indices(region).map(|i| corrected[i]).collect();
    Histogram::build(&values, config.histogram_min, config.histogram_max)
}

fn subtract(corrected: &mut [f32], layout: &DetectorLayout, region: PixelRegion, level: f32) {
    if level == 0.0 {
        return;
    }
    for i in layout.region_indices(region) {
        corrected[i] -= level;
    }
}
