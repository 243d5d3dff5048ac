//! GPU spectral persistence display: FFT, waterfall, persistence histogram
//! and live/max-hold spectrum, computed on the best available device and
//! drawn through a pluggable graphics surface.

pub mod action;
pub mod backend;
pub mod config;
pub mod device;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod render;
pub mod surface;
pub mod util;
pub mod worker;

pub use engine::{Engine, EngineOptions};
pub use error::{DeviceError, EngineError};
pub use worker::{Worker, WorkerSetup};
