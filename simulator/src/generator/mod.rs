pub mod scene;

pub use scene::{SceneConfig, SweepGenerator, Target};
