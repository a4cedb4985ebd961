//! Remapping of detector pixels onto a regular (q, φ) grid.
//!
//! Two remap paths produce the same [`PolarImage`]: direct binning from each
//! pixel's position, and a quantized nearest-neighbour lookup table
//! ([`CorrelationLut`]) that trades precision for an O(1) table read.

use std::f64::consts::TAU;

use anyhow::{ensure, Result};
use rkyv::{Archive, Deserialize, Serialize};
use tracing::debug;

use crate::maps::PixelGeometry;

/// Regular polar binning around the beam center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolarGrid {
    pub n_q: usize,
    pub n_phi: usize,
    /// Inner edge of the first radial bin, pixels.
    pub q_min: f64,
    /// Outer edge of the last radial bin, pixels.
    pub q_max: f64,
    /// Beam center offset relative to the geometry origin, pixels.
    pub center: (f64, f64),
}

impl PolarGrid {
    pub fn dq(&self) -> f64 {
        (self.q_max - self.q_min) / self.n_q as f64
    }

    pub fn dphi(&self) -> f64 {
        TAU / self.n_phi as f64
    }

    /// Radial and angular bin of a position, or `None` outside `[q_min, q_max)`.
    pub fn bin(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let dx = x - self.center.0;
        let dy = y - self.center.1;
        let q = dx.hypot(dy);
        if !(q >= self.q_min && q < self.q_max) {
            return None;
        }
        let qi = (((q - self.q_min) / self.dq()) as usize).min(self.n_q - 1);
        let phi = dy.atan2(dx).rem_euclid(TAU);
        let pi = ((phi / self.dphi()) as usize) % self.n_phi;
        Some((qi, pi))
    }

    /// Center radius of each radial bin, pixels.
    pub fn q_centers(&self) -> Vec<f64> {
        let dq = self.dq();
        (0..self.n_q)
            .map(|i| self.q_min + (i as f64 + 0.5) * dq)
            .collect()
    }
}

/// Intensities accumulated per (q, φ) cell.
#[derive(Debug, Clone, PartialEq)]
pub struct PolarImage {
    n_q: usize,
    n_phi: usize,
    sum: Vec<f64>,
    count: Vec<u32>,
}

impl PolarImage {
    pub fn new(n_q: usize, n_phi: usize) -> Self {
        Self {
            n_q,
            n_phi,
            sum: vec![0.0; n_q * n_phi],
            count: vec![0; n_q * n_phi],
        }
    }

    /// Bin every unmasked pixel by its exact position.
    pub fn from_direct(
        values: &[f32],
        geometry: &PixelGeometry,
        grid: &PolarGrid,
        mask: Option<&[f32]>,
    ) -> Self {
        let mut image = Self::new(grid.n_q, grid.n_phi);
        for (i, (&v, p)) in values.iter().zip(geometry.positions()).enumerate() {
            if mask.is_some_and(|m| m[i] == 0.0) {
                continue;
            }
            if let Some((q, phi)) = grid.bin(p.x as f64, p.y as f64) {
                image.add(q, phi, v as f64);
            }
        }
        image
    }

    /// Bin every unmasked pixel through the lookup table.
    pub fn from_lut(
        values: &[f32],
        geometry: &PixelGeometry,
        lut: &CorrelationLut,
        mask: Option<&[f32]>,
    ) -> Self {
        let mut image = Self::new(lut.n_q as usize, lut.n_phi as usize);
        for (i, (&v, p)) in values.iter().zip(geometry.positions()).enumerate() {
            if mask.is_some_and(|m| m[i] == 0.0) {
                continue;
            }
            if let Some((q, phi)) = lut.lookup(p.x as f64, p.y as f64) {
                image.add(q, phi, v as f64);
            }
        }
        image
    }

    #[inline]
    fn add(&mut self, q: usize, phi: usize, v: f64) {
        let idx = q * self.n_phi + phi;
        self.sum[idx] += v;
        self.count[idx] += 1;
    }

    pub fn n_q(&self) -> usize {
        self.n_q
    }

    pub fn n_phi(&self) -> usize {
        self.n_phi
    }

    pub fn count(&self, q: usize, phi: usize) -> u32 {
        self.count[q * self.n_phi + phi]
    }

    /// Mean intensity of a cell, `None` when no pixel fell in it.
    pub fn cell_mean(&self, q: usize, phi: usize) -> Option<f64> {
        let idx = q * self.n_phi + phi;
        (self.count[idx] > 0).then(|| self.sum[idx] / self.count[idx] as f64)
    }

    /// Mean pixel intensity of each ring (0 for empty rings).
    pub fn angular_average(&self) -> Vec<f64> {
        (0..self.n_q)
            .map(|q| {
                let row = q * self.n_phi..(q + 1) * self.n_phi;
                let s: f64 = self.sum[row.clone()].iter().sum();
                let c: u64 = self.count[row].iter().map(|&c| c as u64).sum();
                if c > 0 {
                    s / c as f64
                } else {
                    0.0
                }
            })
            .collect()
    }
}

// ── Lookup table ────────────────────────────────────────────────────────────

const NO_BIN: u32 = u32::MAX;

/// Nearest-neighbour table from a quantized (x, y) grid to polar cells.
///
/// Node `(ix, iy)` sits at `(x_min + ix·step_x, y_min + iy·step_y)` and
/// stores the flattened cell index `q·n_phi + φ` of that position.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct CorrelationLut {
    pub nx: u32,
    pub ny: u32,
    pub x_min: f64,
    pub y_min: f64,
    pub step_x: f64,
    pub step_y: f64,
    pub n_q: u32,
    pub n_phi: u32,
    /// Grid the table was built for: q_min, q_max, center x, center y.
    pub grid_params: [f64; 4],
    bins: Vec<u32>,
}

impl CorrelationLut {
    /// Build an `nx × ny` table spanning the geometry's pixel positions.
    pub fn build(geometry: &PixelGeometry, grid: &PolarGrid, nx: usize, ny: usize) -> Result<Self> {
        ensure!(nx >= 2 && ny >= 2, "lookup table needs at least 2×2 nodes, got {}×{}", nx, ny);
        ensure!(!geometry.is_empty(), "cannot build a lookup table for an empty geometry");

        let (mut x_min, mut x_max) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut y_min, mut y_max) = (f64::INFINITY, f64::NEG_INFINITY);
        for p in geometry.positions() {
            x_min = x_min.min(p.x as f64);
            x_max = x_max.max(p.x as f64);
            y_min = y_min.min(p.y as f64);
            y_max = y_max.max(p.y as f64);
        }
        let step_x = ((x_max - x_min) / (nx - 1) as f64).max(f64::EPSILON);
        let step_y = ((y_max - y_min) / (ny - 1) as f64).max(f64::EPSILON);

        let mut bins = Vec::with_capacity(nx * ny);
        for iy in 0..ny {
            let y = y_min + iy as f64 * step_y;
            for ix in 0..nx {
                let x = x_min + ix as f64 * step_x;
                bins.push(match grid.bin(x, y) {
                    Some((q, phi)) => (q * grid.n_phi + phi) as u32,
                    None => NO_BIN,
                });
            }
        }
        debug!(
            "built {}×{} correlation lookup table for {}×{} polar cells",
            nx, ny, grid.n_q, grid.n_phi
        );

        Ok(Self {
            nx: nx as u32,
            ny: ny as u32,
            x_min,
            y_min,
            step_x,
            step_y,
            n_q: grid.n_q as u32,
            n_phi: grid.n_phi as u32,
            grid_params: [grid.q_min, grid.q_max, grid.center.0, grid.center.1],
            bins,
        })
    }

    /// Polar cell of the node nearest to `(x, y)`.
    pub fn lookup(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let ix = ((x - self.x_min) / self.step_x).round();
        let iy = ((y - self.y_min) / self.step_y).round();
        if ix < 0.0 || iy < 0.0 || ix >= self.nx as f64 || iy >= self.ny as f64 {
            return None;
        }
        let bin = *self.bins.get(iy as usize * self.nx as usize + ix as usize)?;
        let n_phi = self.n_phi as usize;
        if bin == NO_BIN || n_phi == 0 || bin as usize >= self.n_q as usize * n_phi {
            return None;
        }
        Some((bin as usize / n_phi, bin as usize % n_phi))
    }

    /// Check that the table's shape is consistent and every node names a
    /// cell inside its `n_q × n_phi` grid.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.n_q > 0 && self.n_phi > 0,
            "lookup table has an empty {}×{} polar grid",
            self.n_q,
            self.n_phi
        );
        ensure!(
            self.bins.len() == self.nx as usize * self.ny as usize,
            "lookup table has {} bins for a {}×{} grid",
            self.bins.len(),
            self.nx,
            self.ny
        );
        ensure!(
            self.step_x.is_finite()
                && self.step_y.is_finite()
                && self.step_x > 0.0
                && self.step_y > 0.0
                && self.x_min.is_finite()
                && self.y_min.is_finite(),
            "lookup table node spacing is not finite and positive"
        );
        let cells = self.n_q as u64 * self.n_phi as u64;
        if let Some((node, bin)) = self
            .bins
            .iter()
            .enumerate()
            .find(|&(_, &b)| b != NO_BIN && b as u64 >= cells)
        {
            anyhow::bail!(
                "lookup table node {} names cell {} outside the {}×{} polar grid",
                node,
                bin,
                self.n_q,
                self.n_phi
            );
        }
        Ok(())
    }

    /// Whether the table was built for `grid`.
    pub fn matches(&self, grid: &PolarGrid) -> bool {
        self.n_q as usize == grid.n_q
            && self.n_phi as usize == grid.n_phi
            && self.grid_params == [grid.q_min, grid.q_max, grid.center.0, grid.center.1]
    }

    /// Serialize the table to bytes using rkyv.
    pub fn to_rkyv_bytes(&self) -> Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| anyhow::anyhow!("rkyv serialization failed: {}", e))?;
        Ok(bytes.to_vec())
    }

    /// Deserialize a table produced by [`to_rkyv_bytes`](Self::to_rkyv_bytes).
    pub fn from_rkyv_bytes(bytes: &[u8]) -> Result<Self> {
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        let lut = rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| anyhow::anyhow!("rkyv deserialization failed: {}", e))?;
        lut.validate()?;
        Ok(lut)
    }
}
