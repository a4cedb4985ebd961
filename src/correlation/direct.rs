//! Direct angular correlation: explicit sums over φ for every lag.

use super::{normalize, Normalization, Speckle};

/// `C(q1, q2, k) = Σ_l s(q1, l)·s(q2, (l+k) mod n_phi)`, normalized by the
/// number of occupied cell pairs at that lag.
///
/// Output is laid out pair-major, `values[pair * n_lag + k]`.
pub fn correlate(
    speckle: &Speckle,
    pairs: &[(usize, usize)],
    n_lag: usize,
    normalization: Normalization,
) -> Vec<f64> {
    let n_phi = speckle.n_phi;
    let mut out = Vec::with_capacity(pairs.len() * n_lag);

    for &(q1, q2) in pairs {
        let a = speckle.row(q1);
        let b = speckle.row(q2);
        let ma = speckle.occupancy_row(q1);
        let mb = speckle.occupancy_row(q2);
        for k in 0..n_lag {
            let mut num = 0.0;
            let mut pairs_at_lag = 0.0;
            for l in 0..n_phi {
                let m = (l + k) % n_phi;
                num += a[l] * b[m];
                pairs_at_lag += ma[l] * mb[m];
            }
            out.push(normalize(
                num,
                pairs_at_lag,
                speckle.angular_average[q1],
                speckle.angular_average[q2],
                normalization,
            ));
        }
    }
    out
}
