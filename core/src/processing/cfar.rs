//! Constant false alarm rate thresholding and peak search on amplitude sweeps.

use crate::interface::SubsweepConfig;

const GUARD_LENGTH_ADJUSTMENT: f32 = 4.0;
const WINDOW_LENGTH_ADJUSTMENT: f32 = 0.25;

/// Sliding two-sided CFAR: each point's threshold is the mean of two windows
/// placed beyond a guard interval on either side, plus the noise level,
/// times `num_stds`.
#[derive(Debug, Clone, PartialEq)]
pub struct Cfar {
    pub guard_half_length: usize,
    pub window_length: usize,
    pub num_stds: f32,
}

impl Cfar {
    pub fn for_subsweep(subsweep: &SubsweepConfig, sensitivity: f32) -> Self {
        let fwhm = subsweep.profile.envelope_fwhm_m();
        let step_m = subsweep.step_length_m();
        Self {
            guard_half_length: (fwhm * GUARD_LENGTH_ADJUSTMENT / 2.0 / step_m) as usize,
            window_length: ((fwhm * WINDOW_LENGTH_ADJUSTMENT / step_m) as usize).max(1),
            num_stds: num_stds_for(sensitivity),
        }
    }

    /// Points closer than this to either end get no threshold.
    pub fn margin(&self) -> usize {
        self.guard_half_length + self.window_length - 1
    }

    /// Threshold per point, `None` where the windows would leave the sweep.
    pub fn threshold(&self, amplitude: &[f32], noise: &[f32]) -> Vec<Option<f32>> {
        let n = amplitude.len();
        let margin = self.margin();
        let mut threshold = vec![None; n];
        if n <= 2 * margin {
            // windows never fit
            return threshold;
        }
        let taps = 2 * self.window_length;
        for (idx, slot) in threshold.iter_mut().enumerate().take(n - margin).skip(margin) {
            let sum: f32 = (0..self.window_length)
                .map(|k| {
                    let offset = self.guard_half_length + k;
                    amplitude[idx - offset] + amplitude[idx + offset]
                })
                .sum();
            let floor = noise.get(idx).copied().unwrap_or(0.0);
            *slot = Some((sum / taps as f32 + floor) * self.num_stds);
        }
        threshold
    }
}

/// Maps sensitivity in `[0, 1]` to a threshold multiplier. Higher
/// sensitivity lowers the threshold.
pub fn num_stds_for(sensitivity: f32) -> f32 {
    8.0 - 7.0 * sensitivity.clamp(0.0, 1.0)
}

/// Local maxima lying above the threshold. A plateau counts once, at its
/// first point.
pub fn find_peaks(amplitude: &[f32], threshold: &[Option<f32>]) -> Vec<usize> {
    let n = amplitude.len();
    let above = |i: usize| matches!(threshold[i], Some(t) if amplitude[i] > t);
    let mut peaks = Vec::new();
    let mut d = 1;
    while d + 1 < n {
        if threshold[d - 1].is_none() {
            d += 1;
            continue;
        }
        if threshold[d + 1].is_none() {
            break;
        }
        if !above(d) {
            d += 2;
            continue;
        }
        if !above(d - 1) || amplitude[d - 1] >= amplitude[d] {
            d += 1;
            continue;
        }
        let mut upper = d + 1;
        loop {
            if upper + 1 >= n || !above(upper) || amplitude[upper] > amplitude[d] {
                break;
            }
            if amplitude[upper] < amplitude[d] {
                peaks.push(d);
                break;
            }
            upper += 1;
        }
        d = upper;
    }
    peaks
}

/// Parabolic refinement through a peak and its two neighbours. Returns the
/// fractional index and the interpolated amplitude.
pub fn interpolate_peak(amplitude: &[f32], index: usize) -> (f32, f32) {
    if index == 0 || index + 1 >= amplitude.len() {
        return (index as f32, amplitude.get(index).copied().unwrap_or(0.0));
    }
    let (y0, y1, y2) = (amplitude[index - 1], amplitude[index], amplitude[index + 1]);
    let denominator = y0 - 2.0 * y1 + y2;
    if denominator.abs() <= f32::EPSILON {
        return (index as f32, y1);
    }
    let delta = 0.5 * (y0 - y2) / denominator;
    let peak = y1 - 0.25 * (y0 - y2) * delta;
    (index as f32 + delta, peak)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::Profile;

    fn p1() -> SubsweepConfig {
        SubsweepConfig {
            profile: Profile::P1,
            step_length: 1,
            ..Default::default()
        }
    }

    #[test]
    fn window_sizes_follow_profile() {
        let cfar = Cfar::for_subsweep(&p1(), 0.5);
        assert_eq!(cfar.guard_half_length, 32);
        assert_eq!(cfar.window_length, 4);
        assert_eq!(cfar.margin(), 35);
        assert_eq!(cfar.num_stds, 4.5);
    }

    #[test]
    fn sensitivity_is_clamped() {
        assert_eq!(num_stds_for(-1.0), 8.0);
        assert_eq!(num_stds_for(2.0), 1.0);
    }

    #[test]
    fn threshold_is_undefined_near_edges() {
        let cfar = Cfar {
            guard_half_length: 1,
            window_length: 1,
            num_stds: 2.0,
        };
        let amplitude = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let threshold = cfar.threshold(&amplitude, &[0.5; 6]);
        assert_eq!(threshold[0], None);
        assert_eq!(threshold[1], Some(3.0));
        assert_eq!(threshold[4], Some(3.0));
        assert_eq!(threshold[5], None);
    }

    #[test]
    fn single_peak_is_found() {
        let amplitude = [0.0, 1.0, 2.0, 5.0, 2.0, 1.0, 0.0];
        let threshold = vec![Some(1.5); amplitude.len()];
        assert_eq!(find_peaks(&amplitude, &threshold), vec![3]);
    }

    #[test]
    fn peaks_below_threshold_are_ignored() {
        let amplitude = [0.0, 1.0, 2.0, 5.0, 2.0, 1.0, 0.0];
        let threshold = vec![Some(6.0); amplitude.len()];
        assert!(find_peaks(&amplitude, &threshold).is_empty());
    }

    #[test]
    fn parabola_vertex_is_recovered() {
        // y = 10 - (x - 3.25)^2
        let amplitude: Vec<f32> = (0..6).map(|x| 10.0 - (x as f32 - 3.25).powi(2)).collect();
        let (index, peak) = interpolate_peak(&amplitude, 3);
        assert!((index - 3.25).abs() < 1e-4);
        assert!((peak - 10.0).abs() < 1e-4);
    }
}
