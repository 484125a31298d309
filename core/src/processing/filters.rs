//! Smoothing-factor conversions and the range-axis filters shared by the
//! detectors.

use std::f32::consts::PI;

use num_complex::Complex32;

use crate::interface::{SubsweepConfig, APPROX_BASE_STEP_LENGTH_M};
use crate::math::FftHelper;

/// Exponential smoothing factor whose -3 dB point sits at `cutoff_hz` when
/// updated at `sample_rate_hz`. Cutoffs above Nyquist give no smoothing.
pub fn cutoff_to_sf(cutoff_hz: f32, sample_rate_hz: f32) -> f32 {
    if cutoff_hz > 0.5 * sample_rate_hz {
        return 0.0;
    }
    let cos_w = (2.0 * PI * cutoff_hz / sample_rate_hz).cos();
    2.0 - cos_w - (cos_w * cos_w - 4.0 * cos_w + 3.0).sqrt()
}

/// Smoothing factor for a first-order filter with time constant `tc_s`.
pub fn tc_to_sf(tc_s: f32, sample_rate_hz: f32) -> f32 {
    if tc_s <= 0.0 {
        return 0.0;
    }
    (-1.0 / (tc_s * sample_rate_hz)).exp()
}

/// Ramps a smoothing factor in over the first updates so early output is
/// not dominated by the zero initial state.
pub fn dynamic_sf(static_sf: f32, update_index: u64) -> f32 {
    static_sf.min(1.0 - 1.0 / (1.0 + update_index as f32))
}

/// One exponential smoothing step applied point-wise.
pub fn smooth(state: &mut [f32], input: &[f32], sf: f32) {
    for (acc, &value) in state.iter_mut().zip(input) {
        *acc = sf * *acc + (1.0 - sf) * value;
    }
}

/// Number of points one pulse envelope spans, at least one.
pub fn depth_filter_length(subsweep: &SubsweepConfig) -> usize {
    let points = subsweep.profile.envelope_fwhm_m() / subsweep.step_length_m();
    (points.round() as usize).max(1)
}

/// Moving average along depth, centred and the same length as the input.
/// Outside the sweep counts as zero.
pub fn depth_filter(values: &[f32], length: usize) -> Vec<f32> {
    let n = values.len();
    let length = length.max(1);
    let centre = (length - 1) / 2;
    let scale = 1.0 / length as f32;
    (0..n)
        .map(|i| {
            let last = i + length - 1 - centre;
            let first = last.saturating_sub(length - 1);
            let last = last.min(n.saturating_sub(1));
            if first > last {
                return 0.0;
            }
            values[first..=last].iter().sum::<f32>() * scale
        })
        .collect()
}

/// Zero-phase low-pass along the range axis, matched to the pulse length.
///
/// The gain is the squared magnitude of a second-order Butterworth response,
/// which is what running the filter forward and backward produces.
pub struct DistanceFilter {
    fft: FftHelper,
    cutoff: f32,
}

impl DistanceFilter {
    pub fn new(sweep_len: usize, subsweep: &SubsweepConfig) -> Self {
        let cutoff = APPROX_BASE_STEP_LENGTH_M * f32::from(subsweep.step_length)
            / subsweep.profile.envelope_fwhm_m();
        Self {
            fft: FftHelper::new((2 * sweep_len).max(2)),
            cutoff,
        }
    }

    /// Normalized cutoff relative to Nyquist.
    pub fn cutoff(&self) -> f32 {
        self.cutoff
    }

    pub fn apply(&mut self, sweep: &[Complex32]) -> Vec<Complex32> {
        let cutoff = self.cutoff;
        self.fft
            .apply_gain(sweep, |frequency| 1.0 / (1.0 + (frequency / cutoff).powi(4)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::Profile;

    #[test]
    fn cutoff_above_nyquist_disables_smoothing() {
        assert_eq!(cutoff_to_sf(20.0, 10.0), 0.0);
        let sf = cutoff_to_sf(0.2, 10.0);
        assert!(sf > 0.8 && sf < 1.0);
    }

    #[test]
    fn time_constant_conversion() {
        assert_eq!(tc_to_sf(0.0, 10.0), 0.0);
        assert!((tc_to_sf(1.0, 10.0) - (-0.1f32).exp()).abs() < 1e-6);
    }

    #[test]
    fn dynamic_sf_ramps_in() {
        assert_eq!(dynamic_sf(0.9, 0), 0.0);
        assert_eq!(dynamic_sf(0.9, 1), 0.5);
        assert_eq!(dynamic_sf(0.9, 1000), 0.9);
    }

    #[test]
    fn depth_filter_averages_neighbours() {
        let filtered = depth_filter(&[0.0, 3.0, 0.0, 0.0], 3);
        assert_eq!(filtered, vec![1.0, 1.0, 1.0, 0.0]);
        assert_eq!(depth_filter(&[2.0, 4.0], 1), vec![2.0, 4.0]);
    }

    #[test]
    fn depth_filter_length_follows_profile() {
        let subsweep = SubsweepConfig {
            profile: Profile::P1,
            step_length: 1,
            ..Default::default()
        };
        assert_eq!(depth_filter_length(&subsweep), 16);
    }

    #[test]
    fn distance_filter_passes_dc_and_attenuates_alternation() {
        let subsweep = SubsweepConfig {
            profile: Profile::P1,
            step_length: 1,
            num_points: 64,
            ..Default::default()
        };
        let mut filter = DistanceFilter::new(64, &subsweep);
        let flat = vec![Complex32::new(10.0, 0.0); 64];
        let out = filter.apply(&flat);
        assert!((out[32].re - 10.0).abs() < 0.5);

        let alternating: Vec<Complex32> = (0..64)
            .map(|i| Complex32::new(if i % 2 == 0 { 10.0 } else { -10.0 }, 0.0))
            .collect();
        let out = filter.apply(&alternating);
        assert!(out[32].norm() < 0.5);
    }
}
