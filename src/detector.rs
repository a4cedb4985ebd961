//! Detector layout: a rectangular grid of identical readout modules (tiles).
//!
//! The pixel buffer is row-major over the whole detector. Module `(mx, my)`
//! occupies rows `my*module_rows .. (my+1)*module_rows` and columns
//! `mx*module_cols .. (mx+1)*module_cols`. Modules are numbered row-major,
//! `module = my * modules_x + mx`.

use std::fmt;

/// Geometry of a tiled pixel-array detector in raw (readout) layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorLayout {
    /// Number of modules along the x (column) direction.
    pub modules_x: usize,
    /// Number of modules along the y (row) direction.
    pub modules_y: usize,
    /// Pixel rows per module.
    pub module_rows: usize,
    /// Pixel columns per module.
    pub module_cols: usize,
}

/// Identifies one module by its grid position. Displays as `(mx,my)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId {
    pub mx: usize,
    pub my: usize,
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.mx, self.my)
    }
}

/// A rectangular block of pixels in raw layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRegion {
    pub row0: usize,
    pub col0: usize,
    pub rows: usize,
    pub cols: usize,
}

impl PixelRegion {
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DetectorLayout {
    pub fn new(modules_x: usize, modules_y: usize, module_rows: usize, module_cols: usize) -> Self {
        Self {
            modules_x,
            modules_y,
            module_rows,
            module_cols,
        }
    }

    /// Full detector width in pixels.
    pub fn width(&self) -> usize {
        self.modules_x * self.module_cols
    }

    /// Full detector height in pixels.
    pub fn height(&self) -> usize {
        self.modules_y * self.module_rows
    }

    pub fn pixel_count(&self) -> usize {
        self.width() * self.height()
    }

    pub fn module_count(&self) -> usize {
        self.modules_x * self.modules_y
    }

    pub fn module_pixel_count(&self) -> usize {
        self.module_rows * self.module_cols
    }

    /// Linear buffer index of `(row, col)` in detector coordinates.
    #[inline]
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.width() + col
    }

    pub fn module_id(&self, module: usize) -> ModuleId {
        ModuleId {
            mx: module % self.modules_x,
            my: module / self.modules_x,
        }
    }

    /// Pixel region covered by a module.
    pub fn module_region(&self, module: usize) -> PixelRegion {
        let id = self.module_id(module);
        PixelRegion {
            row0: id.my * self.module_rows,
            col0: id.mx * self.module_cols,
            rows: self.module_rows,
            cols: self.module_cols,
        }
    }

    /// Linear indices of every pixel inside `region`, row by row.
    pub fn region_indices(&self, region: PixelRegion) -> impl Iterator<Item = usize> + '_ {
        (region.row0..region.row0 + region.rows).flat_map(move |row| {
            let base = self.index(row, region.col0);
            base..base + region.cols
        })
    }

    /// Split a module into an `n × n` grid of sub-regions.
    ///
    /// Sub-regions are `ceil(rows/n) × ceil(cols/n)`; the last row/column of
    /// sub-regions absorbs the remainder and may be smaller.
    pub fn sub_regions(&self, module: usize, n: usize) -> Vec<PixelRegion> {
        let region = self.module_region(module);
        let n = n.max(1);
        let step_r = region.rows.div_ceil(n).max(1);
        let step_c = region.cols.div_ceil(n).max(1);

        let mut out = Vec::with_capacity(n * n);
        let mut r = 0;
        while r < region.rows {
            let mut c = 0;
            while c < region.cols {
                out.push(PixelRegion {
                    row0: region.row0 + r,
                    col0: region.col0 + c,
                    rows: step_r.min(region.rows - r),
                    cols: step_c.min(region.cols - c),
                });
                c += step_c;
            }
            r += step_r;
        }
        out
    }
}

impl Default for DetectorLayout {
    /// 8×8 modules of 194×185 pixels.
    fn default() -> Self {
        Self::new(8, 8, 194, 185)
    }
}
