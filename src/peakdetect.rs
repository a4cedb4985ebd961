//! Extrema detection over a 1D sampled signal with a noise floor.
//!
//! The scan tracks a running maximum and minimum. It starts out looking for a
//! minimum; once the signal rises more than `delta` above the running minimum,
//! the minimum is committed and the scan switches to tracking a maximum, and
//! vice versa. The last running minimum is appended when the scan ends, so
//! `minima.len()` is `maxima.len()` or `maxima.len() + 1`.

/// A committed extremum: sample coordinate and value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extremum {
    pub x: f64,
    pub y: f64,
}

/// Committed maxima and minima in scan order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeakSet {
    pub maxima: Vec<Extremum>,
    pub minima: Vec<Extremum>,
}

impl PeakSet {
    /// The minimum committed immediately before maximum `i`, if any.
    pub fn preceding_minimum(&self, i: usize) -> Option<&Extremum> {
        if i < self.maxima.len() {
            self.minima.get(i)
        } else {
            None
        }
    }
}

/// Find extrema of `values`, using the sample index as coordinate.
pub fn find_all(values: &[f64], delta: f64) -> PeakSet {
    scan(values.iter().enumerate().map(|(i, &y)| (i as f64, y)), delta)
}

/// Find extrema of `values` sampled at coordinates `labels`.
///
/// Extra samples in the longer of the two slices are ignored.
pub fn find_all_labeled(labels: &[f64], values: &[f64], delta: f64) -> PeakSet {
    scan(labels.iter().copied().zip(values.iter().copied()), delta)
}

fn scan(samples: impl Iterator<Item = (f64, f64)>, delta: f64) -> PeakSet {
    let mut max = Extremum {
        x: -1.0,
        y: f64::NEG_INFINITY,
    };
    let mut min = Extremum {
        x: -1.0,
        y: f64::INFINITY,
    };
    let mut find_max = false;
    let mut seen = false;
    let mut out = PeakSet::default();

    for (x, y) in samples {
        seen = true;
        if y > max.y {
            max = Extremum { x, y };
        }
        // Until the first minimum is committed, ties move the candidate right.
        if y < min.y || (out.minima.is_empty() && y <= min.y) {
            min = Extremum { x, y };
        }

        if find_max {
            if y < max.y - delta {
                out.maxima.push(max);
                min = Extremum { x, y };
                find_max = false;
            }
        } else if y > min.y + delta {
            out.minima.push(min);
            max = Extremum { x, y };
            find_max = true;
        }
    }

    if seen {
        out.minima.push(min);
    }
    out
}
