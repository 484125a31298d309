pub struct StatsHelper;

impl StatsHelper {
    pub fn mean(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<f32>() / samples.len() as f32
    }

    /// Mean of the smaller half of the values; a robust floor estimate.
    pub fn lower_half_mean(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let half = (sorted.len() / 2).max(1);
        Self::mean(&sorted[..half])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_nothing_is_zero() {
        assert_eq!(StatsHelper::mean(&[]), 0.0);
        assert_eq!(StatsHelper::mean(&[2.0, 4.0]), 3.0);
    }

    #[test]
    fn lower_half_mean_ignores_outliers() {
        let samples = [1.0, 100.0, 1.0, 3.0];
        assert_eq!(StatsHelper::lower_half_mean(&samples), 1.0);
        assert_eq!(StatsHelper::lower_half_mean(&[7.0]), 7.0);
    }
}
