//! Frame classification ("hit finding").
//!
//! A [`HitfinderPolicy`] names one classifier: its algorithm and thresholds.
//! Any number of policies run against the same corrected frame; each works on
//! its own scratch copy, so classification never modifies the frame.
//!
//! Algorithms:
//! - **Threshold count**: count pixels above `adc`; hit iff count ≥ `nat`.
//! - **Cluster count**: for each pixel above `adc`, count the pixels above
//!   `adc` in its 3×3 neighbourhood (itself included); if that reaches
//!   `cluster`, count one cluster and zero the 3×3 block. Hit iff the
//!   cluster count is ≥ `min_pix_count`.
//! - **Connected component** (default): grow an 8-connected region from
//!   every above-threshold seed within its module, zeroing pixels as they
//!   join. A region is a peak iff its size lies in
//!   `[min_pix_count, max_pix_count]`; hit iff the peak count lies in
//!   `[npeaks, npeaks_max]`.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::ensure;

use crate::detector::DetectorLayout;

/// Hit-finding algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HitAlgorithm {
    ThresholdCount,
    ClusterCount,
    #[default]
    ConnectedComponent,
}

/// What a policy's positive outcome means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyRole {
    /// A positive outcome marks the frame as a hit.
    #[default]
    Hit,
    /// A positive outcome marks the frame as background; frames that are
    /// *not* background are the interesting ones.
    Background,
}

/// A named classifier configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HitfinderPolicy {
    /// Class name, also used as the aggregate class ("standard", "water", ...).
    pub name: String,

    pub role: PolicyRole,

    pub algorithm: HitAlgorithm,

    /// Pixel threshold in corrected ADC units.
    /// Default: 100.0
    pub adc: f32,

    /// Threshold count: pixels above `adc` needed for a hit.
    /// Default: 100
    pub nat: usize,

    /// Cluster count: above-threshold pixels needed in a 3×3 neighbourhood.
    /// Default: 2
    pub cluster: usize,

    /// Smallest connected region counted as a peak. Cluster count uses it as
    /// the minimum number of clusters for a hit.
    /// Default: 3
    pub min_pix_count: usize,

    /// Largest connected region counted as a peak.
    /// Default: 20
    pub max_pix_count: usize,

    /// Fewest peaks for a hit.
    /// Default: 50
    pub npeaks: usize,

    /// Most peaks for a hit.
    /// Default: 100000
    pub npeaks_max: usize,

    /// Peak-search mask multiplied into the scratch copy before searching.
    /// Default: None
    pub peak_mask: Option<Vec<f32>>,

    /// Frames selected by this policy are assembled, correlated and passed
    /// on in full.
    /// Default: false
    pub save_hits: bool,

    /// Frames selected by this policy are added to the aggregate class of
    /// the same name.
    /// Default: true
    pub accumulate: bool,
}

impl Default for HitfinderPolicy {
    fn default() -> Self {
        Self {
            name: "standard".to_string(),
            role: PolicyRole::Hit,
            algorithm: HitAlgorithm::ConnectedComponent,
            adc: 100.0,
            nat: 100,
            cluster: 2,
            min_pix_count: 3,
            max_pix_count: 20,
            npeaks: 50,
            npeaks_max: 100_000,
            peak_mask: None,
            save_hits: false,
            accumulate: true,
        }
    }
}

impl HitfinderPolicy {
    pub fn named(name: impl Into<String>, role: PolicyRole) -> Self {
        Self {
            name: name.into(),
            role,
            ..Default::default()
        }
    }

    pub fn validate(&self, pixel_count: usize) -> anyhow::Result<()> {
        ensure!(!self.name.is_empty(), "hitfinder policy has no name");
        ensure!(
            self.min_pix_count <= self.max_pix_count,
            "{}: min_pix_count {} > max_pix_count {}",
            self.name,
            self.min_pix_count,
            self.max_pix_count
        );
        ensure!(
            self.npeaks <= self.npeaks_max,
            "{}: npeaks {} > npeaks_max {}",
            self.name,
            self.npeaks,
            self.npeaks_max
        );
        if let Some(mask) = &self.peak_mask {
            ensure!(
                mask.len() == pixel_count,
                "{}: peak mask has {} values, detector has {}",
                self.name,
                mask.len(),
                pixel_count
            );
        }
        Ok(())
    }
}

/// Result of one policy on one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitOutcome {
    pub is_hit: bool,
    /// Above-threshold pixels, clusters or peaks, depending on the algorithm.
    pub peak_count: usize,
}

/// Classify a corrected frame under `policy`. Pure.
pub fn classify(corrected: &[f32], layout: &DetectorLayout, policy: &HitfinderPolicy) -> HitOutcome {
    let mut scratch = corrected.to_vec();
    if let Some(mask) = &policy.peak_mask {
        for (v, &m) in scratch.iter_mut().zip(mask) {
            *v *= m;
        }
    }

    match policy.algorithm {
        HitAlgorithm::ThresholdCount => {
            let nat = scratch.iter().filter(|&&v| v > policy.adc).count();
            HitOutcome {
                is_hit: nat >= policy.nat,
                peak_count: nat,
            }
        }
        HitAlgorithm::ClusterCount => {
            let clusters = count_clusters(&mut scratch, layout, policy.adc, policy.cluster);
            HitOutcome {
                is_hit: clusters >= policy.min_pix_count,
                peak_count: clusters,
            }
        }
        HitAlgorithm::ConnectedComponent => {
            let peaks = count_peaks(&mut scratch, layout, policy);
            HitOutcome {
                is_hit: peaks >= policy.npeaks && peaks <= policy.npeaks_max,
                peak_count: peaks,
            }
        }
    }
}

const NEIGHBOURS: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

fn count_clusters(scratch: &mut [f32], layout: &DetectorLayout, adc: f32, cluster: usize) -> usize {
    let (w, h) = (layout.width(), layout.height());
    let mut count = 0;
    for row in 1..h.saturating_sub(1) {
        for col in 1..w.saturating_sub(1) {
            if scratch[row * w + col] <= adc {
                continue;
            }
            let mut nn = 0;
            for r in row - 1..=row + 1 {
                for c in col - 1..=col + 1 {
                    if scratch[r * w + c] > adc {
                        nn += 1;
                    }
                }
            }
            if nn >= cluster {
                count += 1;
                // Only the 3×3 block is cleared, not the whole cluster.
                for r in row - 1..=row + 1 {
                    for c in col - 1..=col + 1 {
                        scratch[r * w + c] = 0.0;
                    }
                }
            }
        }
    }
    count
}

fn count_peaks(scratch: &mut [f32], layout: &DetectorLayout, policy: &HitfinderPolicy) -> usize {
    let w = layout.width();
    let adc = policy.adc;
    let size_range = policy.min_pix_count..=policy.max_pix_count;
    let mut members: Vec<(usize, usize)> = Vec::new();
    let mut peaks = 0;

    for module in 0..layout.module_count() {
        let region = layout.module_region(module);
        let (r_end, c_end) = (region.row0 + region.rows, region.col0 + region.cols);

        // Seeds stay off the module border; regions may grow onto it.
        for row in region.row0 + 1..r_end.saturating_sub(1) {
            for col in region.col0 + 1..c_end.saturating_sub(1) {
                if scratch[row * w + col] <= adc {
                    continue;
                }
                scratch[row * w + col] = 0.0;
                members.clear();
                members.push((row, col));

                let mut k = 0;
                while k < members.len() {
                    let (pr, pc) = members[k];
                    for (dr, dc) in NEIGHBOURS {
                        let (nr, nc) = (pr as isize + dr, pc as isize + dc);
                        if nr < region.row0 as isize
                            || nc < region.col0 as isize
                            || nr >= r_end as isize
                            || nc >= c_end as isize
                        {
                            continue;
                        }
                        let idx = nr as usize * w + nc as usize;
                        if scratch[idx] > adc {
                            scratch[idx] = 0.0;
                            members.push((nr as usize, nc as usize));
                        }
                    }
                    k += 1;
                }

                if size_range.contains(&members.len()) {
                    peaks += 1;
                }
            }
        }
    }
    peaks
}

/// A policy together with its running hit counter.
#[derive(Debug)]
pub struct Hitfinder {
    policy: HitfinderPolicy,
    hits: AtomicU64,
}

impl Hitfinder {
    pub fn new(policy: HitfinderPolicy) -> Self {
        Self {
            policy,
            hits: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &HitfinderPolicy {
        &self.policy
    }

    pub fn name(&self) -> &str {
        &self.policy.name
    }

    /// Classify and count positive outcomes.
    pub fn classify(&self, corrected: &[f32], layout: &DetectorLayout) -> HitOutcome {
        let outcome = classify(corrected, layout, &self.policy);
        if outcome.is_hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Positive outcomes so far.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Whether `outcome` selects the frame for this policy's class.
    pub fn selects(&self, outcome: &HitOutcome) -> bool {
        match self.policy.role {
            PolicyRole::Hit => outcome.is_hit,
            PolicyRole::Background => !outcome.is_hit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(layout: &DetectorLayout, pixels: &[(usize, usize, f32)]) -> Vec<f32> {
        let mut frame = vec![0.0; layout.pixel_count()];
        for &(r, c, v) in pixels {
            frame[layout.index(r, c)] = v;
        }
        frame
    }

    #[test]
    fn test_threshold_count_boundary() {
        let layout = DetectorLayout::new(1, 1, 10, 10);
        let policy = HitfinderPolicy {
            algorithm: HitAlgorithm::ThresholdCount,
            adc: 100.0,
            nat: 5,
            ..Default::default()
        };
        let five = frame_with(&layout, &[(0, 0, 150.0), (1, 1, 150.0), (2, 2, 150.0), (3, 3, 150.0), (4, 4, 150.0)]);
        let outcome = classify(&five, &layout, &policy);
        assert!(outcome.is_hit);
        assert_eq!(outcome.peak_count, 5);

        let four = frame_with(&layout, &[(0, 0, 150.0), (1, 1, 150.0), (2, 2, 150.0), (3, 3, 150.0)]);
        assert!(!classify(&four, &layout, &policy).is_hit);
    }

    #[test]
    fn test_isolated_pixel_is_size_one_peak() {
        let layout = DetectorLayout::new(1, 1, 8, 8);
        let frame = frame_with(&layout, &[(4, 4, 500.0)]);
        let policy = HitfinderPolicy {
            min_pix_count: 1,
            max_pix_count: 1,
            npeaks: 1,
            ..Default::default()
        };
        let outcome = classify(&frame, &layout, &policy);
        assert_eq!(outcome.peak_count, 1);
        assert!(outcome.is_hit);

        let policy = HitfinderPolicy {
            min_pix_count: 2,
            max_pix_count: 10,
            npeaks: 1,
            ..Default::default()
        };
        let outcome = classify(&frame, &layout, &policy);
        assert_eq!(outcome.peak_count, 0);
        assert!(!outcome.is_hit);
    }

    #[test]
    fn test_connected_region_counts_once() {
        let layout = DetectorLayout::new(1, 1, 10, 10);
        // An L-shaped blob of 4 pixels and a diagonal pair.
        let frame = frame_with(
            &layout,
            &[
                (2, 2, 300.0),
                (2, 3, 300.0),
                (3, 2, 300.0),
                (4, 2, 300.0),
                (7, 7, 300.0),
                (8, 8, 300.0),
            ],
        );
        let policy = HitfinderPolicy {
            min_pix_count: 2,
            max_pix_count: 4,
            npeaks: 2,
            ..Default::default()
        };
        let outcome = classify(&frame, &layout, &policy);
        assert_eq!(outcome.peak_count, 2);
        assert!(outcome.is_hit);

        let policy = HitfinderPolicy {
            min_pix_count: 3,
            ..policy
        };
        assert_eq!(classify(&frame, &layout, &policy).peak_count, 1);
    }

    #[test]
    fn test_regions_do_not_cross_modules() {
        let layout = DetectorLayout::new(2, 1, 6, 6);
        // Adjacent pixels straddling the module boundary at column 6.
        let frame = frame_with(&layout, &[(3, 4, 300.0), (3, 5, 300.0), (3, 6, 300.0), (3, 7, 300.0)]);
        let policy = HitfinderPolicy {
            min_pix_count: 2,
            max_pix_count: 4,
            npeaks: 1,
            ..Default::default()
        };
        assert_eq!(classify(&frame, &layout, &policy).peak_count, 2);
    }

    #[test]
    fn test_cluster_count_clears_only_the_block() {
        let layout = DetectorLayout::new(1, 1, 5, 8);
        // A horizontal streak of 5 pixels: the first 3×3 clear leaves the tail.
        let frame = frame_with(
            &layout,
            &[
                (2, 1, 200.0),
                (2, 2, 200.0),
                (2, 3, 200.0),
                (2, 4, 200.0),
                (2, 5, 200.0),
            ],
        );
        let policy = HitfinderPolicy {
            algorithm: HitAlgorithm::ClusterCount,
            cluster: 2,
            min_pix_count: 2,
            ..Default::default()
        };
        let outcome = classify(&frame, &layout, &policy);
        assert_eq!(outcome.peak_count, 2);
        assert!(outcome.is_hit);
    }

    #[test]
    fn test_peak_mask_hides_pixels() {
        let layout = DetectorLayout::new(1, 1, 4, 4);
        let frame = vec![200.0; 16];
        let mut mask = vec![1.0; 16];
        mask[..8].iter_mut().for_each(|m| *m = 0.0);
        let policy = HitfinderPolicy {
            algorithm: HitAlgorithm::ThresholdCount,
            nat: 9,
            peak_mask: Some(mask),
            ..Default::default()
        };
        let outcome = classify(&frame, &layout, &policy);
        assert_eq!(outcome.peak_count, 8);
        assert!(!outcome.is_hit);
        assert!(frame.iter().all(|&v| v == 200.0));
    }

    #[test]
    fn test_hitfinder_counts_and_selects() {
        let layout = DetectorLayout::new(1, 1, 4, 4);
        let policy = HitfinderPolicy {
            algorithm: HitAlgorithm::ThresholdCount,
            nat: 1,
            ..HitfinderPolicy::named("background", PolicyRole::Background)
        };
        let finder = Hitfinder::new(policy);
        let bright = vec![500.0; 16];
        let dark = vec![0.0; 16];
        let a = finder.classify(&bright, &layout);
        let b = finder.classify(&dark, &layout);
        assert_eq!(finder.hits(), 1);
        assert!(!finder.selects(&a));
        assert!(finder.selects(&b));
    }

    #[test]
    fn test_validate() {
        let policy = HitfinderPolicy {
            min_pix_count: 10,
            max_pix_count: 2,
            ..Default::default()
        };
        assert!(policy.validate(16).is_err());
        let policy = HitfinderPolicy {
            peak_mask: Some(vec![1.0; 3]),
            ..Default::default()
        };
        assert!(policy.validate(16).is_err());
        assert!(HitfinderPolicy::default().validate(16).is_ok());
    }
}
