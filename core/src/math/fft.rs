use std::sync::Arc;

use num_complex::Complex32;
use rustfft::{num_traits::Zero, Fft, FftPlanner};

/// Forward/inverse plan pair of one size, reused across sweeps.
pub struct FftHelper {
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex32>,
}

impl FftHelper {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        Self {
            forward,
            inverse,
            scratch: vec![Complex32::zero(); scratch_len],
        }
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transforms `buffer` in place. The buffer must be exactly `len()` long.
    pub fn forward(&mut self, buffer: &mut [Complex32]) {
        self.forward.process_with_scratch(buffer, &mut self.scratch);
    }

    /// Inverse transform, scaled so that `inverse(forward(x)) == x`.
    pub fn inverse(&mut self, buffer: &mut [Complex32]) {
        self.inverse.process_with_scratch(buffer, &mut self.scratch);
        let scale = 1.0 / buffer.len().max(1) as f32;
        buffer.iter_mut().for_each(|value| *value *= scale);
    }

    /// Zero-phase filtering: multiplies the spectrum of `signal` (zero padded to
    /// `len()`) by the real `gain` evaluated at each bin's normalized frequency.
    ///
    /// Normalized frequency is relative to Nyquist, so it runs from 0 to 1.
    pub fn apply_gain<F>(&mut self, signal: &[Complex32], gain: F) -> Vec<Complex32>
    where
        F: Fn(f32) -> f32,
    {
        let size = self.len();
        let mut buffer = vec![Complex32::zero(); size];
        let used = signal.len().min(size);
        buffer[..used].copy_from_slice(&signal[..used]);

        self.forward(&mut buffer);
        for (bin, value) in buffer.iter_mut().enumerate() {
            let folded = bin.min(size - bin);
            let frequency = 2.0 * folded as f32 / size as f32;
            *value *= gain(frequency);
        }
        self.inverse(&mut buffer);

        buffer.truncate(signal.len());
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_undoes_forward() {
        let mut helper = FftHelper::new(4);
        let original = vec![
            Complex32::new(1.0, 0.0),
            Complex32::new(0.0, 2.0),
            Complex32::new(-1.0, 0.0),
            Complex32::new(0.5, -0.5),
        ];
        let mut buffer = original.clone();
        helper.forward(&mut buffer);
        helper.inverse(&mut buffer);
        for (a, b) in buffer.iter().zip(&original) {
            assert!((a - b).norm() < 1e-5);
        }
    }

    #[test]
    fn unit_gain_preserves_signal() {
        let mut helper = FftHelper::new(8);
        let signal = vec![Complex32::new(3.0, 1.0); 5];
        let filtered = helper.apply_gain(&signal, |_| 1.0);
        assert_eq!(filtered.len(), 5);
        assert!((filtered[2] - signal[2]).norm() < 1e-4);
    }
}
