use num_complex::Complex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use sweepcore::interface::{SensorConfig, SubsweepConfig, APPROX_BASE_STEP_LENGTH_M};

/// Carrier wavelength of the emulated 60 GHz radio.
const WAVELENGTH_M: f32 = 4.96e-3;
const FWHM_TO_SIGMA: f32 = 2.355;

/// A point reflector in the synthetic scene.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Target {
    pub distance_m: f32,
    pub amplitude: f32,
    /// Radial velocity, positive away from the sensor.
    pub velocity_mps: f32,
    /// Peak displacement of a sinusoidal motion around the current distance.
    pub oscillation_m: f32,
    pub oscillation_hz: f32,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            distance_m: 0.5,
            amplitude: 2000.0,
            velocity_mps: 0.0,
            oscillation_m: 0.0,
            oscillation_hz: 0.0,
        }
    }
}

impl Target {
    pub fn position_at(&self, time_s: f32) -> f32 {
        self.distance_m
            + self.velocity_mps * time_s
            + self.oscillation_m * (2.0 * PI * self.oscillation_hz * time_s).sin()
    }
}

/// Configuration for generating synthetic sweeps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SceneConfig {
    pub targets: Vec<Target>,
    /// Peak amplitude of the uniform noise added to each IQ component.
    pub noise: f32,
    /// Static leakage added to every point, as `[re, im]`.
    pub direct_leakage: [f32; 2],
    pub seed: u64,
    /// Sensor temperature at session start, in degrees Celsius.
    pub temperature_c: f32,
    pub temperature_drift_c_per_s: f32,
    pub description: Option<String>,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            targets: vec![Target::default()],
            noise: 8.0,
            direct_leakage: [0.0, 0.0],
            seed: 0,
            temperature_c: 25.0,
            temperature_drift_c_per_s: 0.0,
            description: None,
        }
    }
}

/// Produces frames of IQ sweeps for one sensor from a [`SceneConfig`].
pub struct SweepGenerator {
    subsweeps: Vec<SubsweepConfig>,
    sweeps_per_frame: usize,
    sweep_period_s: f32,
    scene: SceneConfig,
    rng: StdRng,
    saturated: bool,
}

impl SweepGenerator {
    /// `seed_offset` keeps several sensors on one scene from sharing noise.
    pub fn new(config: &SensorConfig, sweep_rate: f32, scene: SceneConfig, seed_offset: u64) -> Self {
        Self {
            subsweeps: config.subsweeps.clone(),
            sweeps_per_frame: usize::from(config.sweeps_per_frame.max(1)),
            sweep_period_s: if sweep_rate > 0.0 { 1.0 / sweep_rate } else { 0.0 },
            rng: StdRng::seed_from_u64(scene.seed.wrapping_add(seed_offset)),
            scene,
            saturated: false,
        }
    }

    pub fn points_per_sweep(&self) -> usize {
        self.subsweeps.iter().map(|s| usize::from(s.num_points)).sum()
    }

    /// Whether any sample of the last frame was clipped.
    pub fn saturated(&self) -> bool {
        self.saturated
    }

    pub fn temperature_at(&self, time_s: f32) -> i16 {
        let celsius = self.scene.temperature_c + self.scene.temperature_drift_c_per_s * time_s;
        celsius.round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
    }

    /// One frame starting at `frame_time_s`, row-major `(sweep, point)`.
    pub fn frame(&mut self, frame_time_s: f32) -> Vec<Complex<i16>> {
        self.saturated = false;
        let mut samples = Vec::with_capacity(self.sweeps_per_frame * self.points_per_sweep());
        for sweep in 0..self.sweeps_per_frame {
            let time_s = frame_time_s + sweep as f32 * self.sweep_period_s;
            for index in 0..self.subsweeps.len() {
                self.push_subsweep(index, time_s, &mut samples);
            }
        }
        samples
    }

    fn push_subsweep(&mut self, index: usize, time_s: f32, out: &mut Vec<Complex<i16>>) {
        let subsweep = &self.subsweeps[index];
        let sigma = subsweep.profile.envelope_fwhm_m() / FWHM_TO_SIGMA;
        let gain = subsweep.profile.amplitude_gain();
        let echoes: Vec<(f32, Complex<f32>)> = self
            .scene
            .targets
            .iter()
            .map(|target| {
                let position = target.position_at(time_s);
                let phase = 4.0 * PI * position / WAVELENGTH_M;
                (position, Complex::from_polar(target.amplitude * gain, phase))
            })
            .collect();

        for point in 0..i32::from(subsweep.num_points) {
            let distance = (subsweep.start_point + point * i32::from(subsweep.step_length)) as f32
                * APPROX_BASE_STEP_LENGTH_M;
            let mut value = Complex::new(self.scene.direct_leakage[0], self.scene.direct_leakage[1]);
            for (position, echo) in &echoes {
                let x = (distance - position) / sigma;
                value += echo * (-0.5 * x * x).exp();
            }
            if self.scene.noise > 0.0 {
                value.re += self.rng.gen_range(-self.scene.noise..=self.scene.noise);
                value.im += self.rng.gen_range(-self.scene.noise..=self.scene.noise);
            }
            self.saturated |= clips(value.re) || clips(value.im);
            out.push(Complex::new(saturate(value.re), saturate(value.im)));
        }
    }
}

fn clips(value: f32) -> bool {
    value.round() >= f32::from(i16::MAX) || value.round() <= f32::from(i16::MIN)
}

fn saturate(value: f32) -> i16 {
    value.round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweepcore::interface::Profile;

    fn config() -> SensorConfig {
        SensorConfig {
            sweeps_per_frame: 4,
            ..SensorConfig::single(SubsweepConfig {
                start_point: 100,
                num_points: 120,
                profile: Profile::P2,
                ..Default::default()
            })
        }
    }

    fn strongest_point(samples: &[Complex<i16>]) -> usize {
        samples
            .iter()
            .enumerate()
            .max_by_key(|(_, s)| i32::from(s.re).pow(2) + i32::from(s.im).pow(2))
            .map(|(i, _)| i)
            .unwrap()
    }

    #[test]
    fn generator_places_echo_at_target_distance() {
        let scene = SceneConfig {
            targets: vec![Target {
                distance_m: 0.4,
                ..Default::default()
            }],
            noise: 1.0,
            ..Default::default()
        };
        let mut generator = SweepGenerator::new(&config(), 100.0, scene, 0);
        let frame = generator.frame(0.0);
        assert_eq!(frame.len(), 4 * 120);
        // 0.4 m is point 160, i.e. index 60 of the subsweep starting at 100.
        let peak = strongest_point(&frame[..120]);
        assert!((peak as i64 - 60).abs() <= 1);
    }

    #[test]
    fn same_seed_repeats_frames() {
        let mut a = SweepGenerator::new(&config(), 100.0, SceneConfig::default(), 3);
        let mut b = SweepGenerator::new(&config(), 100.0, SceneConfig::default(), 3);
        assert_eq!(a.frame(0.5), b.frame(0.5));
        let mut c = SweepGenerator::new(&config(), 100.0, SceneConfig::default(), 4);
        assert_ne!(a.frame(0.6), c.frame(0.6));
    }

    #[test]
    fn moving_target_rotates_phase_between_sweeps() {
        let scene = SceneConfig {
            targets: vec![Target {
                distance_m: 0.4,
                velocity_mps: 0.5,
                ..Default::default()
            }],
            noise: 0.0,
            ..Default::default()
        };
        let mut generator = SweepGenerator::new(&config(), 200.0, scene, 0);
        let frame = generator.frame(0.0);
        assert_ne!(frame[60], frame[120 + 60]);
    }

    #[test]
    fn samples_saturate_instead_of_wrapping() {
        let scene = SceneConfig {
            targets: vec![Target {
                distance_m: 0.4,
                amplitude: 1.0e6,
                ..Default::default()
            }],
            noise: 0.0,
            ..Default::default()
        };
        let mut generator = SweepGenerator::new(&config(), 100.0, scene, 0);
        let frame = generator.frame(0.0);
        assert!(frame.iter().any(|s| s.re == i16::MAX || s.re == i16::MIN || s.im == i16::MAX || s.im == i16::MIN));
        assert!(generator.saturated());

        let mut quiet = SweepGenerator::new(&config(), 100.0, SceneConfig::default(), 0);
        quiet.frame(0.0);
        assert!(!quiet.saturated());
    }

    #[test]
    fn temperature_follows_drift() {
        let scene = SceneConfig {
            temperature_c: 20.0,
            temperature_drift_c_per_s: 0.5,
            ..Default::default()
        };
        let generator = SweepGenerator::new(&config(), 100.0, scene, 0);
        assert_eq!(generator.temperature_at(0.0), 20);
        assert_eq!(generator.temperature_at(30.0), 35);
    }
}
