//! Radial (angular) averages and momentum-transfer calibration.

use crate::error::PreconditionError;
use crate::maps::PixelGeometry;

/// Accepted sample-to-detector distance, mm (exclusive on both ends).
pub const DETECTOR_DISTANCE_RANGE_MM: (f64, f64) = (60.0, 600.0);

/// Configuration for per-frame angular averages.
#[derive(Debug, Clone, PartialEq)]
pub struct AngularConfig {
    /// Compute the angular average of frames that are kept.
    /// Default: false
    pub enabled: bool,

    /// Radius of the first bin, pixels.
    /// Default: 0.0
    pub start_radius: f32,

    /// Radial bin width, pixels.
    /// Default: 1.0
    pub step: f32,

    /// Number of radial bins. `None` covers the whole detector.
    /// Default: None
    pub bins: Option<usize>,
}

impl Default for AngularConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_radius: 0.0,
            step: 1.0,
            bins: None,
        }
    }
}

impl AngularConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.step > 0.0, "angular step must be positive");
        anyhow::ensure!(self.start_radius >= 0.0, "angular start radius is negative");
        Ok(())
    }

    fn bin_count(&self, geometry: &PixelGeometry) -> usize {
        self.bins.unwrap_or_else(|| {
            let span = (geometry.max_radius() - self.start_radius).max(0.0);
            (span / self.step).round() as usize + 1
        })
    }
}

/// Mean intensity per radial bin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AngularProfile {
    /// Bin center radius, pixels.
    pub radius: Vec<f64>,
    /// Mean intensity of the bin (0 when empty).
    pub intensity: Vec<f64>,
    /// Number of contributing pixels.
    pub counts: Vec<u32>,
    /// Momentum transfer of each bin, Å⁻¹, when calibrated.
    pub q: Option<Vec<f64>>,
}

/// Average `values` over rings of constant radius.
///
/// Pixel `i` falls in bin `round((r_i - start) / step)`. Pixels whose
/// `mask` factor is zero are left out.
pub fn angular_average(
    values: &[f32],
    geometry: &PixelGeometry,
    mask: Option<&[f32]>,
    config: &AngularConfig,
) -> AngularProfile {
    let n = config.bin_count(geometry);
    let mut sum = vec![0.0f64; n];
    let mut counts = vec![0u32; n];

    for (i, (&v, &r)) in values.iter().zip(geometry.radius()).enumerate() {
        if mask.is_some_and(|m| m[i] == 0.0) {
            continue;
        }
        let bin = ((r - config.start_radius) / config.step).round();
        if bin < 0.0 || bin as usize >= n {
            continue;
        }
        sum[bin as usize] += v as f64;
        counts[bin as usize] += 1;
    }

    let intensity = sum
        .iter()
        .zip(&counts)
        .map(|(&s, &c)| if c > 0 { s / c as f64 } else { 0.0 })
        .collect();
    let radius = (0..n)
        .map(|i| config.start_radius as f64 + i as f64 * config.step as f64)
        .collect();

    AngularProfile {
        radius,
        intensity,
        counts,
        q: None,
    }
}

/// Check the detector distance lies in [`DETECTOR_DISTANCE_RANGE_MM`].
pub fn check_detector_distance(detector_position_mm: f64) -> Result<(), PreconditionError> {
    let (lo, hi) = DETECTOR_DISTANCE_RANGE_MM;
    if detector_position_mm > lo && detector_position_mm < hi {
        Ok(())
    } else {
        Err(PreconditionError::DetectorDistance(detector_position_mm))
    }
}

/// Scattering angle of a pixel at `radius_px`, radians.
pub fn scattering_angle(radius_px: f64, pixel_size_um: f64, detector_position_mm: f64) -> f64 {
    (pixel_size_um * 1e-3 * radius_px / detector_position_mm).atan()
}

/// Converts pixel radius to momentum transfer for one frame's beam geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QCalibration {
    detector_position_mm: f64,
    wavelength_a: f64,
    pixel_size_um: f64,
}

impl QCalibration {
    pub fn new(
        detector_position_mm: f64,
        wavelength_a: f64,
        pixel_size_um: f64,
    ) -> Result<Self, PreconditionError> {
        check_detector_distance(detector_position_mm)?;
        if !(wavelength_a.is_finite() && wavelength_a > 0.0) {
            return Err(PreconditionError::Wavelength(wavelength_a));
        }
        Ok(Self {
            detector_position_mm,
            wavelength_a,
            pixel_size_um,
        })
    }

    /// `q = 4π·sin(2θ/2)/λ`, Å⁻¹.
    pub fn q(&self, radius_px: f64) -> f64 {
        let two_theta = scattering_angle(radius_px, self.pixel_size_um, self.detector_position_mm);
        4.0 * std::f64::consts::PI * (two_theta / 2.0).sin() / self.wavelength_a
    }

    pub fn calibrate(&self, radii_px: &[f64]) -> Vec<f64> {
        radii_px.iter().map(|&r| self.q(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_average_with_mask() {
        // Four pixels at r=1, one at r=2.
        let x = [1.0, -1.0, 0.0, 0.0, 2.0];
        let y = [0.0, 0.0, 1.0, -1.0, 0.0];
        let geom = PixelGeometry::from_xyz(&x, &y, &[0.0; 5], 110.0).unwrap();
        let values = [1.0, 3.0, 5.0, 100.0, 7.0];
        let mask = [1.0, 1.0, 1.0, 0.0, 1.0];
        let profile = angular_average(&values, &geom, Some(&mask), &AngularConfig::default());

        assert_eq!(profile.intensity.len(), 3);
        assert_eq!(profile.counts, vec![0, 3, 1]);
        assert!((profile.intensity[1] - 3.0).abs() < 1e-12);
        assert_eq!(profile.intensity[2], 7.0);
        assert_eq!(profile.intensity[0], 0.0);
    }

    #[test]
    fn test_q_calibration_preconditions() {
        assert_eq!(
            QCalibration::new(50.0, 1.5, 110.0),
            Err(PreconditionError::DetectorDistance(50.0))
        );
        assert!(QCalibration::new(f64::NAN, 1.5, 110.0).is_err());
        assert!(matches!(
            QCalibration::new(100.0, f64::NAN, 110.0),
            Err(PreconditionError::Wavelength(_))
        ));
        assert!(QCalibration::new(100.0, 1.5, 110.0).is_ok());
    }

    #[test]
    fn test_q_values() {
        let cal = QCalibration::new(100.0, 2.0, 100.0).unwrap();
        assert_eq!(cal.q(0.0), 0.0);
        // r = 1000 px at 100 µm -> 100 mm, 2θ = 45°
        let expected = 4.0 * std::f64::consts::PI * (std::f64::consts::FRAC_PI_8).sin() / 2.0;
        assert!((cal.q(1000.0) - expected).abs() < 1e-12);
        let qs = cal.calibrate(&[10.0, 20.0, 30.0]);
        assert!(qs.windows(2).all(|w| w[1] > w[0]));
    }
}
