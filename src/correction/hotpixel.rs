//! Hot-pixel suppression from a rolling per-pixel firing frequency.

use parking_lot::Mutex;

/// Configuration for hot-pixel suppression.
#[derive(Debug, Clone, PartialEq)]
pub struct HotPixelConfig {
    /// A pixel "fires" on a frame when its corrected value exceeds this.
    /// Default: 1000.0
    pub adc: f32,

    /// Number of frames the rolling frequency remembers.
    /// Default: 50
    pub memory: u32,

    /// Pixels firing more often than this fraction of frames are zeroed.
    /// Default: 0.9
    pub max_frequency: f32,
}

impl Default for HotPixelConfig {
    fn default() -> Self {
        Self {
            adc: 1000.0,
            memory: 50,
            max_frequency: 0.9,
        }
    }
}

/// Per-pixel firing frequency shared by all workers.
pub struct HotPixelTracker {
    config: HotPixelConfig,
    frequency: Mutex<Vec<f32>>,
}

impl HotPixelTracker {
    pub fn new(config: HotPixelConfig, pixel_count: usize) -> Self {
        Self {
            config,
            frequency: Mutex::new(vec![0.0; pixel_count]),
        }
    }

    /// Update the rolling frequency with this frame and zero the hot pixels.
    ///
    /// Returns the number of pixels zeroed.
    pub fn suppress(&self, corrected: &mut [f32]) -> usize {
        let m = self.config.memory.max(1) as f32;
        let mut hot = 0;
        let mut frequency = self.frequency.lock();
        for (f, x) in frequency.iter_mut().zip(corrected.iter_mut()) {
            let fired = if *x > self.config.adc { 1.0 } else { 0.0 };
            *f = ((m - 1.0) * *f + fired) / m;
            if *f > self.config.max_frequency {
                *x = 0.0;
                hot += 1;
            }
        }
        hot
    }

    /// Copy of the current frequency map.
    pub fn frequency(&self) -> Vec<f32> {
        self.frequency.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_crosses_threshold() {
        let tracker = HotPixelTracker::new(
            HotPixelConfig {
                adc: 100.0,
                memory: 10,
                max_frequency: 0.5,
            },
            2,
        );
        // 1 - 0.9^6 ≈ 0.47, 1 - 0.9^7 ≈ 0.52
        for frame_no in 1..=7 {
            let mut frame = vec![500.0, 5.0];
            let hot = tracker.suppress(&mut frame);
            if frame_no < 7 {
                assert_eq!(hot, 0, "frame {} suppressed too early", frame_no);
                assert_eq!(frame[0], 500.0);
            } else {
                assert_eq!(hot, 1);
                assert_eq!(frame[0], 0.0);
            }
            assert_eq!(frame[1], 5.0);
        }
        assert_eq!(tracker.frequency()[1], 0.0);
    }
}
