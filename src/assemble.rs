//! Interpolate the raw-layout buffer onto a regular square image.

use crate::maps::PixelGeometry;

/// Cells receiving less total interpolation weight than this are left at zero.
pub const MIN_WEIGHT: f32 = 0.05;

/// Bilinearly splat every pixel onto an `image_nx × image_nx` grid.
///
/// The beam center sits at cell `(image_nx/2, image_nx/2)`; each pixel's
/// value is distributed over the four surrounding cells by fractional
/// overlap, and every cell is normalized by its accumulated weight.
/// The result is row-major with `y` as the row.
pub fn assemble_image(corrected: &[f32], geometry: &PixelGeometry) -> Vec<f32> {
    let nx = geometry.image_nx();
    let half = (nx / 2) as f32;
    let mut data = vec![0.0f32; nx * nx];
    let mut weight = vec![0.0f32; nx * nx];

    let mut splat = |ix: i64, iy: i64, w: f32, v: f32| {
        if ix < 0 || iy < 0 || ix >= nx as i64 || iy >= nx as i64 {
            return;
        }
        let idx = iy as usize * nx + ix as usize;
        data[idx] += w * v;
        weight[idx] += w;
    };

    for (p, &v) in geometry.positions().iter().zip(corrected) {
        let x = p.x + half;
        let y = p.y + half;
        let (fx0, fy0) = (x.floor(), y.floor());
        let (fx, fy) = (x - fx0, y - fy0);
        let (ix, iy) = (fx0 as i64, fy0 as i64);

        splat(ix, iy, (1.0 - fx) * (1.0 - fy), v);
        splat(ix + 1, iy, fx * (1.0 - fy), v);
        splat(ix, iy + 1, (1.0 - fx) * fy, v);
        splat(ix + 1, iy + 1, fx * fy, v);
    }

    for (d, &w) in data.iter_mut().zip(&weight) {
        if w < MIN_WEIGHT {
            *d = 0.0;
        } else {
            *d /= w;
        }
    }
    data
}
