//! Beam-dependent intensity corrections: filter attenuation and polarization.

use anyhow::{ensure, Result};

use crate::angular::{check_detector_distance, scattering_angle};
use crate::error::PreconditionError;
use crate::maps::PixelGeometry;

/// Transmission of each known total filter thickness.
#[derive(Debug, Clone, PartialEq)]
pub struct AttenuationTable {
    entries: Vec<(u32, f64)>,
}

impl AttenuationTable {
    /// `entries` are `(total thickness µm, transmitted fraction)` pairs.
    pub fn new(entries: Vec<(u32, f64)>) -> Result<Self> {
        for &(thickness, transmission) in &entries {
            ensure!(
                transmission > 0.0 && transmission.is_finite(),
                "transmission {} for {} µm is not a positive fraction",
                transmission,
                thickness
            );
        }
        Ok(Self { entries })
    }

    /// Intensity correction factor `1 / transmission` for a thickness.
    pub fn factor(&self, thickness_um: u32) -> Option<f64> {
        self.entries
            .iter()
            .find(|(t, _)| *t == thickness_um)
            .map(|(_, transmission)| 1.0 / transmission)
    }
}

impl Default for AttenuationTable {
    fn default() -> Self {
        Self {
            entries: vec![(0, 1.0)],
        }
    }
}

pub fn apply_attenuation(corrected: &mut [f32], factor: f64) {
    let factor = factor as f32;
    for v in corrected.iter_mut() {
        *v *= factor;
    }
}

/// Polarization correction for a horizontally polarized beam.
#[derive(Debug, Clone, PartialEq)]
pub struct PolarizationConfig {
    /// Fraction of the beam polarized horizontally.
    /// Default: 0.99
    pub horizontal_fraction: f64,
}

impl Default for PolarizationConfig {
    fn default() -> Self {
        Self {
            horizontal_fraction: 0.99,
        }
    }
}

impl PolarizationConfig {
    /// Divide every pixel by its polarization factor
    /// `h(1 - sin²φ sin²θ) + (1 - h)(1 - cos²φ sin²θ)`.
    pub fn apply(
        &self,
        corrected: &mut [f32],
        geometry: &PixelGeometry,
        detector_position_mm: f64,
    ) -> Result<(), PreconditionError> {
        check_detector_distance(detector_position_mm)?;
        let h = self.horizontal_fraction;
        let pixel_size = geometry.pixel_size_um as f64;
        for ((v, &r), &phi) in corrected
            .iter_mut()
            .zip(geometry.radius())
            .zip(geometry.azimuth())
        {
            let theta = scattering_angle(r as f64, pixel_size, detector_position_mm);
            let sin2_theta = theta.sin().powi(2);
            let phi = phi as f64;
            let factor = h * (1.0 - phi.sin().powi(2) * sin2_theta)
                + (1.0 - h) * (1.0 - phi.cos().powi(2) * sin2_theta);
            *v = (*v as f64 / factor) as f32;
        }
        Ok(())
    }
}
