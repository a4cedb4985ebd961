//! Persistent (self-generated) background.
//!
//! An exponentially weighted running image built from non-hit frames,
//! `bg = (x + (N-1)·bg) / N`, subtracted from every frame. The shared image
//! and its running pulse-energy average sit behind one lock, held for a single
//! subtraction or update at a time.

use parking_lot::Mutex;

use super::clamp_adc;

/// Configuration for the persistent background.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundConfig {
    /// Number of frames the running background remembers (N).
    /// Default: 50
    pub memory: u32,

    /// Scale the background to each frame by a least-squares factor before
    /// subtracting.
    /// Default: false
    pub scale: bool,

    /// Only pixels at or below this value enter the scale fit, keeping photon
    /// peaks out of it.
    /// Default: 100.0
    pub scale_adc_ceiling: f32,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            memory: 50,
            scale: false,
            scale_adc_ceiling: 100.0,
        }
    }
}

struct BackgroundState {
    image: Vec<f32>,
    average_gmd: f64,
    updates: u64,
}

/// Running background shared by all workers.
pub struct PersistentBackground {
    config: BackgroundConfig,
    state: Mutex<BackgroundState>,
}

impl PersistentBackground {
    pub fn new(config: BackgroundConfig, pixel_count: usize) -> Self {
        Self {
            config,
            state: Mutex::new(BackgroundState {
                image: vec![0.0; pixel_count],
                average_gmd: 0.0,
                updates: 0,
            }),
        }
    }

    /// Subtract the (optionally scaled) background in place.
    ///
    /// Returns the scale factor used.
    pub fn subtract(&self, corrected: &mut [f32]) -> f32 {
        let state = self.state.lock();
        let bg = &state.image;

        let factor = if self.config.scale {
            let mut top = 0.0f64;
            let mut s1 = 0.0f64;
            for (&b, &x) in bg.iter().zip(corrected.iter()) {
                if x > self.config.scale_adc_ceiling {
                    continue;
                }
                top += b as f64 * x as f64;
                s1 += b as f64 * b as f64;
            }
            if s1 > 0.0 {
                (top / s1) as f32
            } else {
                1.0
            }
        } else {
            1.0
        };

        for (x, &b) in corrected.iter_mut().zip(bg.iter()) {
            *x = clamp_adc(*x - factor * b);
        }
        factor
    }

    /// Fold a pre-subtraction frame into the running background.
    pub fn update(&self, input: &[f32], gmd: f64) {
        let n = self.config.memory.max(1) as f32;
        let mut state = self.state.lock();
        for (b, &x) in state.image.iter_mut().zip(input) {
            *b = (x + (n - 1.0) * *b) / n;
        }
        let n = n as f64;
        state.average_gmd = (gmd + (n - 1.0) * state.average_gmd) / n;
        state.updates += 1;
    }

    /// Copy of the current background image.
    pub fn image(&self) -> Vec<f32> {
        self.state.lock().image.clone()
    }

    /// Running average pulse energy of the frames folded in so far.
    pub fn average_gmd(&self) -> f64 {
        self.state.lock().average_gmd
    }

    /// Number of frames folded in so far.
    pub fn updates(&self) -> u64 {
        self.state.lock().updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_converges_to_constant_input() {
        let bg = PersistentBackground::new(
            BackgroundConfig {
                memory: 4,
                ..Default::default()
            },
            3,
        );
        for _ in 0..200 {
            bg.update(&[8.0, 8.0, 8.0], 1.0);
        }
        assert!(bg.image().iter().all(|&v| (v - 8.0).abs() < 1e-3));
        assert_eq!(bg.updates(), 200);
        assert!((bg.average_gmd() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_first_update_weight() {
        let bg = PersistentBackground::new(
            BackgroundConfig {
                memory: 10,
                ..Default::default()
            },
            1,
        );
        bg.update(&[100.0], 0.0);
        assert_eq!(bg.image(), vec![10.0]);
    }

    #[test]
    fn test_scaled_subtraction_removes_scaled_background() {
        let bg = PersistentBackground::new(
            BackgroundConfig {
                memory: 1,
                scale: true,
                scale_adc_ceiling: 100.0,
            },
            4,
        );
        bg.update(&[10.0, 20.0, 30.0, 40.0], 0.0);
        // Frame is twice the background plus one bright pixel outside the fit.
        let mut frame = vec![20.0, 40.0, 60.0, 500.0];
        let factor = bg.subtract(&mut frame);
        assert!((factor - 2.0).abs() < 1e-5);
        assert!(frame[..3].iter().all(|v| v.abs() < 1e-3));
        assert!((frame[3] - 420.0).abs() < 1e-3);
    }

    #[test]
    fn test_subtraction_clamps() {
        let bg = PersistentBackground::new(
            BackgroundConfig {
                memory: 1,
                ..Default::default()
            },
            1,
        );
        bg.update(&[60000.0], 0.0);
        let mut frame = vec![0.0];
        bg.subtract(&mut frame);
        assert_eq!(frame[0], -32767.0);
    }
}
