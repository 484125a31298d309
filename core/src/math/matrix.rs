use ndarray::{Array1, Array2, ArrayView2, Axis};
use num_complex::Complex32;

pub struct MatrixHelper;

impl MatrixHelper {
    /// Complex mean of every column (range point) over the rows (sweeps).
    pub fn column_mean(frame: ArrayView2<Complex32>) -> Array1<Complex32> {
        frame
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(frame.ncols()))
    }

    /// Per-column mean absolute deviation over rows, scaled by
    /// `sqrt(n / (n - ddof))`. With `subtract_mean` false the column is taken
    /// to be zero-mean already.
    pub fn column_abs_dev(frame: ArrayView2<Complex32>, ddof: usize, subtract_mean: bool) -> Array1<f32> {
        let rows = frame.nrows();
        if rows <= ddof {
            return Array1::zeros(frame.ncols());
        }
        let mean = if subtract_mean {
            Self::column_mean(frame)
        } else {
            Array1::zeros(frame.ncols())
        };
        let scale = (rows as f32 / (rows - ddof) as f32).sqrt() / rows as f32;
        Array1::from_shape_fn(frame.ncols(), |point| {
            let sum: f32 = frame.column(point).iter().map(|x| (x - mean[point]).norm()).sum();
            sum * scale
        })
    }

    /// Third-order difference along the sweep axis.
    pub fn third_difference(frame: ArrayView2<Complex32>) -> Array2<Complex32> {
        let rows = frame.nrows();
        if rows < 4 {
            return Array2::zeros((0, frame.ncols()));
        }
        Array2::from_shape_fn((rows - 3, frame.ncols()), |(row, point)| {
            frame[[row + 3, point]] - frame[[row + 2, point]] * 3.0
                + frame[[row + 1, point]] * 3.0
                - frame[[row, point]]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn column_mean_averages_sweeps() {
        let frame = array![
            [Complex32::new(1.0, 0.0), Complex32::new(0.0, 2.0)],
            [Complex32::new(3.0, 0.0), Complex32::new(0.0, 4.0)]
        ];
        let mean = MatrixHelper::column_mean(frame.view());
        assert_eq!(mean[0], Complex32::new(2.0, 0.0));
        assert_eq!(mean[1], Complex32::new(0.0, 3.0));
    }

    #[test]
    fn third_difference_cancels_quadratic_trend() {
        let frame = Array2::from_shape_fn((6, 1), |(row, _)| {
            Complex32::new((row * row) as f32, 0.0)
        });
        let diff = MatrixHelper::third_difference(frame.view());
        assert_eq!(diff.nrows(), 3);
        assert!(diff.iter().all(|v| v.norm() < 1e-6));
    }

    #[test]
    fn abs_dev_of_constant_column_is_zero() {
        let frame = Array2::from_elem((4, 3), Complex32::new(5.0, -1.0));
        let dev = MatrixHelper::column_abs_dev(frame.view(), 1, true);
        assert!(dev.iter().all(|&v| v == 0.0));

        let raw = MatrixHelper::column_abs_dev(frame.view(), 0, false);
        assert!((raw[0] - Complex32::new(5.0, -1.0).norm()).abs() < 1e-5);
    }
}
