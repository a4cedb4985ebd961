//! FFT angular correlation.
//!
//! For each ring the angular series is transformed once; the correlation of
//! rings `a` and `b` is `IFFT(conj(A)·B) / n_phi`. The pair count at each lag
//! goes through the same transforms applied to the occupancy masks.
//!
//! Plans are created once per transform length under a lock and shared as
//! `Arc<dyn Fft>`. Executing a plan needs only `&self`, so every worker runs
//! its own transforms with its own scratch buffer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::{normalize, Normalization, Speckle};

/// Forward and inverse plans for one transform length.
#[derive(Clone)]
pub struct FftPair {
    pub forward: Arc<dyn Fft<f64>>,
    pub inverse: Arc<dyn Fft<f64>>,
}

/// Shared cache of transform plans, keyed by length.
#[derive(Default)]
pub struct FftPlanCache {
    plans: Mutex<HashMap<usize, FftPair>>,
}

impl FftPlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plans for `len`, created on first use.
    pub fn plans(&self, len: usize) -> FftPair {
        let mut plans = self.plans.lock();
        plans
            .entry(len)
            .or_insert_with(|| {
                let mut planner = FftPlanner::new();
                FftPair {
                    forward: planner.plan_fft_forward(len),
                    inverse: planner.plan_fft_inverse(len),
                }
            })
            .clone()
    }
}

/// Same contract and output layout as [`super::direct::correlate`].
pub fn correlate(
    speckle: &Speckle,
    pairs: &[(usize, usize)],
    n_lag: usize,
    normalization: Normalization,
    cache: &FftPlanCache,
) -> Vec<f64> {
    let n_phi = speckle.n_phi;
    let plans = cache.plans(n_phi);
    let scratch_len = plans
        .forward
        .get_inplace_scratch_len()
        .max(plans.inverse.get_inplace_scratch_len());
    let mut scratch = vec![Complex::new(0.0, 0.0); scratch_len];

    let transform = |row: &[f64], scratch: &mut [Complex<f64>]| -> Vec<Complex<f64>> {
        let mut buf: Vec<Complex<f64>> = row.iter().map(|&v| Complex::new(v, 0.0)).collect();
        plans.forward.process_with_scratch(&mut buf, scratch);
        buf
    };

    let mut spectra: Vec<Option<(Vec<Complex<f64>>, Vec<Complex<f64>>)>> = vec![None; speckle.n_q];
    for &(q1, q2) in pairs {
        for q in [q1, q2] {
            if spectra[q].is_none() {
                let s = transform(speckle.row(q), &mut scratch);
                let m = transform(speckle.occupancy_row(q), &mut scratch);
                spectra[q] = Some((s, m));
            }
        }
    }

    let scale = 1.0 / n_phi as f64;
    let mut num = vec![Complex::new(0.0, 0.0); n_phi];
    let mut cnt = vec![Complex::new(0.0, 0.0); n_phi];
    let mut out = Vec::with_capacity(pairs.len() * n_lag);

    for &(q1, q2) in pairs {
        let (Some((s1, m1)), Some((s2, m2))) = (&spectra[q1], &spectra[q2]) else {
            continue;
        };
        for i in 0..n_phi {
            num[i] = s1[i].conj() * s2[i];
            cnt[i] = m1[i].conj() * m2[i];
        }
        plans.inverse.process_with_scratch(&mut num, &mut scratch);
        plans.inverse.process_with_scratch(&mut cnt, &mut scratch);

        for k in 0..n_lag {
            // Pair counts are integers; rounding removes transform noise.
            let pair_count = (cnt[k].re * scale).round();
            out.push(normalize(
                num[k].re * scale,
                pair_count,
                speckle.angular_average[q1],
                speckle.angular_average[q2],
                normalization,
            ));
        }
    }
    out
}
