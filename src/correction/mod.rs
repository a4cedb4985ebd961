//! Per-frame pixel correction chain.
//!
//! Stages run in a fixed order, each one switched on by its configuration:
//!
//! 1. dark-offset subtraction (clamped to ±32767)
//! 2. common-mode subtraction per module
//! 3. gain correction
//! 4. bad-pixel masking
//! 5. persistent-background subtraction
//! 6. hot-pixel suppression
//!
//! The background image and the hot-pixel frequency map are shared across
//! workers; each has its own lock, taken for its stage only.

pub mod background;
pub mod beam;
pub mod hotpixel;

pub use background::{BackgroundConfig, PersistentBackground};
pub use beam::{AttenuationTable, PolarizationConfig};
pub use hotpixel::{HotPixelConfig, HotPixelTracker};

use crate::commonmode::{subtract_common_mode, CommonModeConfig};
use crate::maps::CorrectionMaps;

/// Corrected values are kept within the range of a signed 16-bit readout.
pub const ADC_LIMIT: f32 = 32767.0;

#[inline]
pub(crate) fn clamp_adc(v: f32) -> f32 {
    v.clamp(-ADC_LIMIT, ADC_LIMIT)
}

/// Which corrections run, and their parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionConfig {
    /// Subtract the dark offset.
    /// Default: true
    pub subtract_dark: bool,

    /// Common-mode subtraction; `None` disables it.
    /// Default: None
    pub common_mode: Option<CommonModeConfig>,

    /// Multiply by the (pre-inverted) gain map.
    /// Default: false
    pub apply_gain: bool,

    /// Zero pixels flagged in the bad-pixel mask.
    /// Default: false
    pub apply_bad_pixel_mask: bool,

    /// Persistent-background subtraction; `None` disables it.
    /// Default: None
    pub background: Option<BackgroundConfig>,

    /// Hot-pixel suppression; `None` disables it.
    /// Default: None
    pub hot_pixels: Option<HotPixelConfig>,

    /// Filter attenuation correction, applied after warm-up.
    /// Default: None
    pub attenuation: Option<AttenuationTable>,

    /// Polarization correction, applied to frames that are kept.
    /// Default: None
    pub polarization: Option<PolarizationConfig>,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            subtract_dark: true,
            common_mode: None,
            apply_gain: false,
            apply_bad_pixel_mask: false,
            background: None,
            hot_pixels: None,
            attenuation: None,
            polarization: None,
        }
    }
}

impl CorrectionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(cm) = &self.common_mode {
            cm.validate()?;
        }
        if let Some(bg) = &self.background {
            anyhow::ensure!(bg.memory > 0, "background memory must be at least one frame");
        }
        if let Some(hot) = &self.hot_pixels {
            anyhow::ensure!(hot.memory > 0, "hot-pixel memory must be at least one frame");
            anyhow::ensure!(
                (0.0..=1.0).contains(&hot.max_frequency),
                "hot-pixel frequency {} outside [0, 1]",
                hot.max_frequency
            );
        }
        if let Some(pol) = &self.polarization {
            anyhow::ensure!(
                (0.0..=1.0).contains(&pol.horizontal_fraction),
                "horizontal polarization {} outside [0, 1]",
                pol.horizontal_fraction
            );
        }
        Ok(())
    }
}

/// Corrected pixels of one frame plus what the chain did to them.
#[derive(Debug, Clone, Default)]
pub struct CorrectedFrame {
    /// Same length as the raw buffer.
    pub pixels: Vec<f32>,
    /// Common-mode level subtracted per module (empty when disabled).
    pub common_mode: Vec<f32>,
    /// Scale applied to the persistent background.
    pub background_scale: Option<f32>,
    /// The frame as it was right before background subtraction; folded into
    /// the background once the frame is known not to be a hit.
    pub background_input: Option<Vec<f32>>,
    /// Pixels zeroed by hot-pixel suppression.
    pub hot_pixels: usize,
}

/// The correction chain together with its cross-frame state.
pub struct CorrectionPipeline {
    config: CorrectionConfig,
    background: Option<PersistentBackground>,
    hot_pixels: Option<HotPixelTracker>,
}

impl CorrectionPipeline {
    pub fn new(config: CorrectionConfig, pixel_count: usize) -> Self {
        let background = config
            .background
            .clone()
            .map(|c| PersistentBackground::new(c, pixel_count));
        let hot_pixels = config
            .hot_pixels
            .clone()
            .map(|c| HotPixelTracker::new(c, pixel_count));
        Self {
            config,
            background,
            hot_pixels,
        }
    }

    pub fn config(&self) -> &CorrectionConfig {
        &self.config
    }

    pub fn background(&self) -> Option<&PersistentBackground> {
        self.background.as_ref()
    }

    pub fn hot_pixel_tracker(&self) -> Option<&HotPixelTracker> {
        self.hot_pixels.as_ref()
    }

    /// Run the correction chain on a raw buffer.
    ///
    /// `raw` must match the layout of `maps`.
    pub fn apply(&self, raw: &[u16], maps: &CorrectionMaps) -> CorrectedFrame {
        let mut pixels: Vec<f32> = if self.config.subtract_dark {
            raw.iter()
                .zip(maps.dark())
                .map(|(&r, &d)| clamp_adc(r as f32 - d))
                .collect()
        } else {
            raw.iter().map(|&r| r as f32).collect()
        };

        let common_mode = match &self.config.common_mode {
            Some(cm) => subtract_common_mode(&mut pixels, maps.layout(), cm),
            None => Vec::new(),
        };

        if self.config.apply_gain {
            apply_gain(&mut pixels, maps.gain());
        }
        if self.config.apply_bad_pixel_mask {
            apply_mask(&mut pixels, maps.good_pixels());
        }

        let (background_scale, background_input) = match &self.background {
            Some(bg) => {
                let input = pixels.clone();
                (Some(bg.subtract(&mut pixels)), Some(input))
            }
            None => (None, None),
        };

        let hot_pixels = match &self.hot_pixels {
            Some(tracker) => tracker.suppress(&mut pixels),
            None => 0,
        };

        CorrectedFrame {
            pixels,
            common_mode,
            background_scale,
            background_input,
            hot_pixels,
        }
    }

    /// Fold a non-hit frame into the persistent background.
    pub fn update_background(&self, frame: &CorrectedFrame, gmd: f64) {
        if let (Some(bg), Some(input)) = (&self.background, &frame.background_input) {
            bg.update(input, gmd);
        }
    }
}

/// Multiply by per-pixel gain factors.
pub fn apply_gain(pixels: &mut [f32], gain: &[f32]) {
    for (v, &g) in pixels.iter_mut().zip(gain) {
        *v *= g;
    }
}

/// Multiply by the 0/1 good-pixel mask.
pub fn apply_mask(pixels: &mut [f32], good: &[f32]) {
    for (v, &m) in pixels.iter_mut().zip(good) {
        *v *= m;
    }
}
