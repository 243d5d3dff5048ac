//! CPU compute backend. Runs the same kernels as the WGSL shaders, on the host.

use super::{
    ComputeBackend, DisplayParams, FFT_LEN, HISTOGRAM_ROWS, HostMirrors, MAX_BATCH, NOISE_FLOOR,
    WATERFALL_ROWS,
};
use crate::error::{DeviceError, DeviceStage};
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

pub struct HostBackend {
    fft: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex32>,
    window: Vec<f32>,
    input: Vec<Complex32>,
    input_len: usize,
    output: Vec<Complex32>,
    spectra: usize,
    surfaces: HostMirrors,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub const NAME: &'static str = "host";

    pub fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_LEN);
        let scratch = vec![Complex32::default(); fft.get_inplace_scratch_len()];
        Self {
            fft,
            scratch,
            window: vec![1.0; FFT_LEN],
            input: vec![Complex32::default(); FFT_LEN * MAX_BATCH],
            input_len: 0,
            output: vec![Complex32::default(); FFT_LEN * MAX_BATCH],
            spectra: 0,
            surfaces: HostMirrors::new(),
        }
    }

    /// Device-side surfaces, for inspection without a read-back.
    pub fn surfaces(&self) -> &HostMirrors {
        &self.surfaces
    }
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn write_window(&mut self, coeffs: &[f32]) -> Result<(), DeviceError> {
        if coeffs.len() != FFT_LEN {
            return Err(DeviceError::new(
                DeviceStage::Upload,
                format!("window has {} coefficients, expected {FFT_LEN}", coeffs.len()),
            ));
        }
        self.window.copy_from_slice(coeffs);
        Ok(())
    }

    fn write_samples(&mut self, samples: &[Complex32]) -> Result<(), DeviceError> {
        if samples.len() > self.input.len() {
            return Err(DeviceError::new(
                DeviceStage::Upload,
                format!("{} samples exceed the input buffer", samples.len()),
            ));
        }
        self.input[..samples.len()].copy_from_slice(samples);
        self.input_len = samples.len();
        Ok(())
    }

    fn run_fft(&mut self, spectra: usize) -> Result<(), DeviceError> {
        let len = spectra * FFT_LEN;
        if spectra > MAX_BATCH || len > self.input_len {
            return Err(DeviceError::new(
                DeviceStage::Fft,
                format!("{spectra} spectra requested, {} samples staged", self.input_len),
            ));
        }

        for (src, dst) in self.input[..len]
            .chunks_exact(FFT_LEN)
            .zip(self.output[..len].chunks_exact_mut(FFT_LEN))
        {
            for ((out, sample), w) in dst.iter_mut().zip(src).zip(&self.window) {
                *out = *sample * *w;
            }
            self.fft.process_with_scratch(dst, &mut self.scratch);
        }
        self.spectra = spectra;
        Ok(())
    }

    fn run_display(&mut self, params: &DisplayParams) -> Result<(), DeviceError> {
        let spectra = params.spectra as usize;
        if spectra > self.spectra {
            return Err(DeviceError::new(
                DeviceStage::Display,
                format!("{spectra} spectra requested, {} transformed", self.spectra),
            ));
        }

        let (live, hold) = self.surfaces.spectrum.split_at_mut(FFT_LEN);
        for bin in 0..FFT_LEN {
            let column = display_column(bin);
            let mut cell = ColumnState {
                live: &mut live[column],
                hold: &mut hold[column],
            };
            if params.reset_hold != 0 {
                *cell.hold = NOISE_FLOOR;
            }
            for s in 0..spectra {
                let value = self.output[s * FFT_LEN + bin];
                let lp = log_magnitude(value.norm_sqr());
                let row = (params.waterfall_pos as usize + s) % WATERFALL_ROWS;
                self.surfaces.waterfall[row * FFT_LEN + column] = lp;
                accumulate_histogram(
                    &mut self.surfaces.histogram,
                    column,
                    histogram_row(lp, params.histo_scale, params.histo_offset),
                    params.rise,
                    params.decay,
                );
                cell.update(lp, params.live_alpha);
            }
        }
        Ok(())
    }

    fn clear_surfaces(&mut self) -> Result<(), DeviceError> {
        self.surfaces.clear();
        Ok(())
    }

    fn read_back(&mut self, mirrors: &mut HostMirrors) -> Result<(), DeviceError> {
        mirrors.clone_from(&self.surfaces);
        Ok(())
    }

    fn drain(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

struct ColumnState<'a> {
    live: &'a mut f32,
    hold: &'a mut f32,
}

impl ColumnState<'_> {
    fn update(&mut self, lp: f32, alpha: f32) {
        *self.live += alpha * (lp - *self.live);
        *self.hold = self.hold.max(lp);
    }
}

/// FFT bin to display column: negative frequencies first, DC in the middle.
#[inline]
pub fn display_column(bin: usize) -> usize {
    bin ^ (FFT_LEN >> 1)
}

/// `log10|X|` from `|X|²`, floored at the noise baseline.
#[inline]
pub fn log_magnitude(norm_sqr: f32) -> f32 {
    (0.5 * norm_sqr.max(1.0e-20).log10()).max(NOISE_FLOOR)
}

/// Histogram row hit by `lp`, if it lies inside the configured power range.
#[inline]
pub fn histogram_row(lp: f32, scale: f32, offset: f32) -> Option<usize> {
    let pos = scale * (lp + offset);
    (pos >= 0.0 && pos < HISTOGRAM_ROWS as f32).then_some(pos as usize)
}

/// One persistence step for a histogram column: every cell decays, the hit cell rises.
pub fn accumulate_histogram(
    histogram: &mut [f32],
    column: usize,
    hit: Option<usize>,
    rise: f32,
    decay: f32,
) {
    let keep = 1.0 - 1.0 / decay;
    let gain = 1.0 / rise;
    for row in 0..HISTOGRAM_ROWS {
        let cell = &mut histogram[row * FFT_LEN + column];
        let mut v = *cell * keep;
        if hit == Some(row) {
            v += (1.0 - *cell) * gain;
        }
        *cell = v.clamp(0.0, 1.0);
    }
}
