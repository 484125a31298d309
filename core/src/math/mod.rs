pub mod crc;
pub mod fft;
pub mod matrix;
pub mod stats;

pub use crc::crc16;
pub use fft::FftHelper;
pub use matrix::MatrixHelper;
pub use stats::StatsHelper;
