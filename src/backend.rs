//! Compute-backend contract shared by the host and wgpu implementations.

pub mod gpu;
pub mod host;

use crate::error::DeviceError;
use bytemuck::{Pod, Zeroable};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};

pub const FFT_LEN_LOG2: u32 = 10;
pub const FFT_LEN: usize = 1 << FFT_LEN_LOG2;
/// Batches must hold a multiple of this many spectra.
pub const BATCH_MULTIPLE: usize = 16;
/// Largest number of spectra accepted in one batch.
pub const MAX_BATCH: usize = 1024;

pub const WATERFALL_ROWS: usize = 1024;
pub const HISTOGRAM_ROWS: usize = 128;
pub const SPECTRUM_LEN: usize = 2 * FFT_LEN;

/// Stored `log10|X|` for "nothing received yet".
pub const NOISE_FLOOR: f32 = -10.0;

/// Persistence constants of the display kernel, counted in spectra.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulationTuning {
    pub histogram_rise: f32,
    pub histogram_decay: f32,
    pub live_alpha: f32,
}

impl Default for AccumulationTuning {
    fn default() -> Self {
        Self {
            histogram_rise: 16.0,
            histogram_decay: 1024.0,
            live_alpha: 0.002,
        }
    }
}

impl AccumulationTuning {
    pub fn sanitize(&mut self) {
        self.histogram_rise = finite_or(self.histogram_rise, 16.0).clamp(1.0, 65_536.0);
        self.histogram_decay = finite_or(self.histogram_decay, 1024.0).clamp(1.0, 1.0e7);
        self.live_alpha = finite_or(self.live_alpha, 0.002).clamp(1.0e-6, 1.0);
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() { value } else { fallback }
}

/// Parameters of one display-kernel dispatch. Layout matches the WGSL uniform.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DisplayParams {
    pub waterfall_pos: u32,
    pub spectra: u32,
    pub histo_scale: f32,
    pub histo_offset: f32,
    pub rise: f32,
    pub decay: f32,
    pub live_alpha: f32,
    pub reset_hold: u32,
}

/// Host-visible copies of the three result surfaces.
#[derive(Debug, Clone)]
pub struct HostMirrors {
    /// `WATERFALL_ROWS` rows of `FFT_LEN` bins, row-major.
    pub waterfall: Vec<f32>,
    /// `HISTOGRAM_ROWS` rows of `FFT_LEN` bins, row 0 is the lowest power.
    pub histogram: Vec<f32>,
    /// Live trace followed by the max-hold trace.
    pub spectrum: Vec<f32>,
}

impl Default for HostMirrors {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMirrors {
    pub fn new() -> Self {
        Self {
            waterfall: vec![NOISE_FLOOR; FFT_LEN * WATERFALL_ROWS],
            histogram: vec![0.0; FFT_LEN * HISTOGRAM_ROWS],
            spectrum: vec![NOISE_FLOOR; SPECTRUM_LEN],
        }
    }

    pub fn clear(&mut self) {
        self.waterfall.fill(NOISE_FLOOR);
        self.histogram.fill(0.0);
        self.spectrum.fill(NOISE_FLOOR);
    }

    pub fn live(&self) -> &[f32] {
        &self.spectrum[..FFT_LEN]
    }

    pub fn hold(&self) -> &[f32] {
        &self.spectrum[FFT_LEN..]
    }

    pub fn waterfall_row(&self, row: usize) -> &[f32] {
        let row = row % WATERFALL_ROWS;
        &self.waterfall[row * FFT_LEN..(row + 1) * FFT_LEN]
    }

    pub fn histogram_cell(&self, bin: usize, row: usize) -> f32 {
        self.histogram[row * FFT_LEN + bin]
    }

    pub fn is_baseline(&self) -> bool {
        self.waterfall.iter().all(|&v| v == NOISE_FLOOR)
            && self.histogram.iter().all(|&v| v == 0.0)
            && self.spectrum.iter().all(|&v| v == NOISE_FLOOR)
    }
}

/// Operations a compute device must offer to run the pipeline.
///
/// Every call may be asynchronous on the device; only `drain` and
/// `read_back` are required to block until the queue has caught up.
pub trait ComputeBackend: Send {
    fn name(&self) -> &str;

    fn write_window(&mut self, coeffs: &[f32]) -> Result<(), DeviceError>;

    fn write_samples(&mut self, samples: &[Complex32]) -> Result<(), DeviceError>;

    /// Windowed FFT over `spectra` consecutive blocks of `FFT_LEN` samples.
    fn run_fft(&mut self, spectra: usize) -> Result<(), DeviceError>;

    /// Accumulates the last FFT output into the result surfaces.
    fn run_display(&mut self, params: &DisplayParams) -> Result<(), DeviceError>;

    /// Resets all three result surfaces to the noise-floor baseline.
    fn clear_surfaces(&mut self) -> Result<(), DeviceError>;

    fn acquire_surfaces(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn release_surfaces(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn read_back(&mut self, mirrors: &mut HostMirrors) -> Result<(), DeviceError>;

    fn drain(&mut self) -> Result<(), DeviceError>;

    /// Result surfaces as graphics-consumable buffers, when the device can share them.
    fn shared_surfaces(&self) -> Option<gpu::SharedSurfaces> {
        None
    }

    fn can_share(&self) -> bool {
        self.shared_surfaces().is_some()
    }
}
