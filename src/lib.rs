//! Hand-landmark gesture control: landmark frames in, pointer and key actions out.

pub mod actions;
pub mod calibration;
pub mod cli;
pub mod config;
pub mod engine;
pub mod features;
pub mod gestures;
pub mod ipc;
pub mod logging;
pub mod pinch;
pub mod smoothing;
pub mod tracker;

pub use actions::{ActError, ActionCommand, ActionSink, MouseButton};
pub use calibration::CalibrationRegion;
pub use config::Profile;
pub use engine::{Engine, EngineConfig, EngineError, EngineStatus};
pub use features::{FeatureExtractor, FeatureSet};
pub use gestures::GestureLabel;
pub use tracker::{HandLandmarks, Point, Snapshot};
