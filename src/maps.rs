//! Per-pixel calibration arrays and detector geometry.
//!
//! [`CorrectionMaps`] is built once from in-memory arrays handed over by the
//! calibration-loading side and is shared read-only by every worker. A map
//! whose length disagrees with the detector layout is replaced by its neutral
//! default (zero dark, unity gain, all pixels good, regular grid geometry)
//! and a single warning is logged at build time.

use anyhow::{ensure, Result};
use tracing::{debug, warn};

use crate::detector::DetectorLayout;
use crate::Vector3;

/// Whether a map came from calibration data or was substituted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapStatus {
    Loaded,
    Neutral,
}

/// Load status of each calibration map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapsStatus {
    pub dark: MapStatus,
    pub gain: MapStatus,
    pub bad_pixel: MapStatus,
    pub geometry: MapStatus,
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Per-pixel geometric positions in raw-buffer order.
///
/// `x` and `y` are in pixel units relative to the beam center; `z` is the
/// per-pixel distance offset in mm (zero for a flat detector).
#[derive(Debug, Clone, PartialEq)]
pub struct PixelGeometry {
    positions: Vec<Vector3>,
    radius: Vec<f32>,
    azimuth: Vec<f32>,
    image_nx: usize,
    /// Physical pixel pitch in µm.
    pub pixel_size_um: f32,
}

impl PixelGeometry {
    /// Build from per-pixel coordinates.
    pub fn from_xyz(x: &[f32], y: &[f32], z: &[f32], pixel_size_um: f32) -> Result<Self> {
        ensure!(
            x.len() == y.len() && x.len() == z.len(),
            "coordinate arrays differ in length: x={}, y={}, z={}",
            x.len(),
            y.len(),
            z.len()
        );
        ensure!(
            pixel_size_um.is_finite() && pixel_size_um > 0.0,
            "pixel size must be positive, got {}",
            pixel_size_um
        );
        let finite = |i: usize| x[i].is_finite() && y[i].is_finite() && z[i].is_finite();
        if let Some(i) = (0..x.len()).find(|&i| !finite(i)) {
            anyhow::bail!(
                "pixel {} has non-finite coordinates ({}, {}, {})",
                i,
                x[i],
                y[i],
                z[i]
            );
        }
        let positions = x
            .iter()
            .zip(y)
            .zip(z)
            .map(|((&x, &y), &z)| Vector3::new(x, y, z))
            .collect();
        Ok(Self::from_positions(positions, pixel_size_um))
    }

    /// Modules tiled edge to edge in readout order, centered on the beam.
    pub fn regular(layout: &DetectorLayout, pixel_size_um: f32) -> Self {
        let cx = (layout.width() as f32 - 1.0) / 2.0;
        let cy = (layout.height() as f32 - 1.0) / 2.0;
        let mut positions = Vec::with_capacity(layout.pixel_count());
        for row in 0..layout.height() {
            for col in 0..layout.width() {
                positions.push(Vector3::new(col as f32 - cx, row as f32 - cy, 0.0));
            }
        }
        Self::from_positions(positions, pixel_size_um)
    }

    fn from_positions(positions: Vec<Vector3>, pixel_size_um: f32) -> Self {
        let radius: Vec<f32> = positions.iter().map(|p| p.x.hypot(p.y)).collect();
        let azimuth = positions.iter().map(|p| p.y.atan2(p.x)).collect();
        let extent = positions
            .iter()
            .map(|p| p.x.abs().max(p.y.abs()))
            .fold(0.0f32, f32::max);
        let image_nx = 2 * extent.ceil() as usize + 2;
        Self {
            positions,
            radius,
            azimuth,
            image_nx,
            pixel_size_um,
        }
    }

    /// Shift the beam center by `(dx, dy)` pixels and rederive radius/azimuth.
    pub fn recentered(&self, dx: f32, dy: f32) -> Self {
        let positions = self
            .positions
            .iter()
            .map(|p| Vector3::new(p.x - dx, p.y - dy, p.z))
            .collect();
        Self::from_positions(positions, self.pixel_size_um)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[Vector3] {
        &self.positions
    }

    /// Distance from the beam center, pixel units.
    pub fn radius(&self) -> &[f32] {
        &self.radius
    }

    /// Azimuthal angle, radians in (-π, π].
    pub fn azimuth(&self) -> &[f32] {
        &self.azimuth
    }

    /// Side length of the square assembled image.
    pub fn image_nx(&self) -> usize {
        self.image_nx
    }

    pub fn max_radius(&self) -> f32 {
        self.radius.iter().copied().fold(0.0, f32::max)
    }
}

// ── Correction maps ─────────────────────────────────────────────────────────

/// Immutable calibration state shared by all workers.
#[derive(Debug, Clone)]
pub struct CorrectionMaps {
    layout: DetectorLayout,
    dark: Vec<f32>,
    gain: Vec<f32>,
    good_pixels: Vec<f32>,
    geometry: PixelGeometry,
    status: MapsStatus,
}

impl CorrectionMaps {
    pub fn builder(layout: DetectorLayout) -> CorrectionMapsBuilder {
        CorrectionMapsBuilder::new(layout)
    }

    /// All maps at their neutral defaults.
    pub fn neutral(layout: DetectorLayout) -> Self {
        Self::builder(layout).build()
    }

    pub fn layout(&self) -> &DetectorLayout {
        &self.layout
    }

    /// Dark offset per pixel.
    pub fn dark(&self) -> &[f32] {
        &self.dark
    }

    /// Gain factors, already inverted: multiply to correct.
    pub fn gain(&self) -> &[f32] {
        &self.gain
    }

    /// 1.0 for good pixels, 0.0 for bad ones.
    pub fn good_pixels(&self) -> &[f32] {
        &self.good_pixels
    }

    pub fn geometry(&self) -> &PixelGeometry {
        &self.geometry
    }

    pub fn status(&self) -> MapsStatus {
        self.status
    }

    /// Replace the geometry, keeping every other map.
    pub fn with_geometry(&self, geometry: PixelGeometry) -> Self {
        let mut out = self.clone();
        if geometry.len() == self.layout.pixel_count() {
            out.geometry = geometry;
            out.status.geometry = MapStatus::Loaded;
        } else {
            warn!(
                "geometry has {} pixels, detector has {}; keeping current geometry",
                geometry.len(),
                self.layout.pixel_count()
            );
        }
        out
    }
}

enum GainInput {
    Measured(Vec<f32>),
    Factors(Vec<f32>),
}

/// Assembles [`CorrectionMaps`] from in-memory calibration arrays.
pub struct CorrectionMapsBuilder {
    layout: DetectorLayout,
    dark: Option<Vec<f32>>,
    gain: Option<GainInput>,
    bad_pixels: Option<Vec<bool>>,
    geometry: Option<PixelGeometry>,
    pixel_size_um: f32,
}

impl CorrectionMapsBuilder {
    fn new(layout: DetectorLayout) -> Self {
        Self {
            layout,
            dark: None,
            gain: None,
            bad_pixels: None,
            geometry: None,
            pixel_size_um: 110.0,
        }
    }

    /// Dark offset (darkcal) per pixel.
    pub fn dark(mut self, dark: Vec<f32>) -> Self {
        self.dark = Some(dark);
        self
    }

    /// Measured relative gain per pixel. Inverted at build time; pixels with
    /// zero measured gain get a zero factor.
    pub fn measured_gain(mut self, gain: Vec<f32>) -> Self {
        self.gain = Some(GainInput::Measured(gain));
        self
    }

    /// Gain correction factors applied as-is.
    pub fn gain_factors(mut self, factors: Vec<f32>) -> Self {
        self.gain = Some(GainInput::Factors(factors));
        self
    }

    /// Bad-pixel flags, `true` marks a bad pixel.
    pub fn bad_pixels(mut self, bad: Vec<bool>) -> Self {
        self.bad_pixels = Some(bad);
        self
    }

    pub fn geometry(mut self, geometry: PixelGeometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Pixel pitch used for the default geometry. Default: 110 µm.
    pub fn pixel_size_um(mut self, pixel_size_um: f32) -> Self {
        self.pixel_size_um = pixel_size_um;
        self
    }

    pub fn build(self) -> CorrectionMaps {
        let n = self.layout.pixel_count();

        let (dark, dark_status) = match self.dark {
            Some(d) if checked_len("dark offset", d.len(), n) => (d, MapStatus::Loaded),
            _ => (vec![0.0; n], MapStatus::Neutral),
        };

        let (gain, gain_status) = match self.gain {
            Some(GainInput::Measured(g)) if checked_len("gain", g.len(), n) => {
                let inverted = g
                    .iter()
                    .map(|&v| if v == 0.0 { 0.0 } else { 1.0 / v })
                    .collect();
                (inverted, MapStatus::Loaded)
            }
            Some(GainInput::Factors(g)) if checked_len("gain", g.len(), n) => {
                (g, MapStatus::Loaded)
            }
            _ => (vec![1.0; n], MapStatus::Neutral),
        };

        let (good_pixels, bad_status) = match self.bad_pixels {
            Some(b) if checked_len("bad-pixel mask", b.len(), n) => {
                let good = b.iter().map(|&bad| if bad { 0.0 } else { 1.0 }).collect();
                (good, MapStatus::Loaded)
            }
            _ => (vec![1.0; n], MapStatus::Neutral),
        };

        let (geometry, geometry_status) = match self.geometry {
            Some(g) if checked_len("geometry", g.len(), n) => (g, MapStatus::Loaded),
            _ => (
                PixelGeometry::regular(&self.layout, self.pixel_size_um),
                MapStatus::Neutral,
            ),
        };

        let status = MapsStatus {
            dark: dark_status,
            gain: gain_status,
            bad_pixel: bad_status,
            geometry: geometry_status,
        };
        debug!("correction maps built for {} pixels: {:?}", n, status);

        CorrectionMaps {
            layout: self.layout,
            dark,
            gain,
            good_pixels,
            geometry,
            status,
        }
    }
}

fn checked_len(name: &str, got: usize, expected: usize) -> bool {
    if got != expected {
        warn!(
            "{} map has {} values, detector has {} pixels; using neutral default",
            name, got, expected
        );
        return false;
    }
    true
}
