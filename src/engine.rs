//! The long-lived engine: device, pipeline, power and frequency state.

pub mod broker;
pub mod pipeline;
pub mod window;

use crate::backend::gpu::{GpuBackend, GpuContext, SharedSurfaces};
use crate::backend::host::HostBackend;
use crate::backend::{AccumulationTuning, ComputeBackend, FFT_LEN, HISTOGRAM_ROWS, HostMirrors};
use crate::device::{self, DeviceHandle, Selection, VendorPolicy};
use crate::error::EngineError;
use crate::util::resource::ResourceLoader;
use broker::{SharingMode, SurfaceLock};
use iced_wgpu::wgpu;
use num_complex::Complex32;
use pipeline::{ComputePipeline, PipelineState};
use std::sync::Arc;
use tracing::{debug, info, warn};
use window::WindowKind;

/// dB-per-division steps offered to the user.
pub const DB_PER_DIV_STEPS: [f32; 5] = [1.0, 2.0, 5.0, 10.0, 20.0];
pub const DEFAULT_DB_PER_DIV_INDEX: usize = 3;
/// Vertical power divisions in the histogram view.
pub const POWER_DIVISIONS: usize = 10;

/// Reference level and vertical scale of the power axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerRange {
    pub reference_db: f32,
    pub db_per_div: f32,
}

impl Default for PowerRange {
    fn default() -> Self {
        Self {
            reference_db: 0.0,
            db_per_div: DB_PER_DIV_STEPS[DEFAULT_DB_PER_DIV_INDEX],
        }
    }
}

impl PowerRange {
    /// Bottom of the plotted range.
    pub fn floor_db(&self) -> f32 {
        self.reference_db - POWER_DIVISIONS as f32 * self.db_per_div
    }

    /// Linear scale from stored `log10|X|` to [0, 1] over the plotted range.
    pub fn scale(&self) -> f32 {
        20.0 / (self.reference_db - self.floor_db())
    }

    /// Offset added to `log10|X|` before scaling; folds in the FFT gain.
    pub fn offset(&self) -> f32 {
        -((FFT_LEN as f32).log10() + self.floor_db() / 20.0)
    }

    /// Stored `log10|X|` to normalised power, 0 at the floor and 1 at the reference.
    pub fn normalize(&self, log_mag: f32) -> f32 {
        self.scale() * (log_mag + self.offset())
    }
}

/// Absolute centre frequency and analysis bandwidth, in Hz.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyRange {
    pub center: f64,
    pub span: f64,
}

impl Default for FrequencyRange {
    fn default() -> Self {
        Self {
            center: 0.0,
            span: 1.0e6,
        }
    }
}

/// Everything the render geometry needs to know about the engine.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DisplayScales {
    pub power: PowerRange,
    pub frequency: FrequencyRange,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub vendor_policy: VendorPolicy,
    pub device_override: Option<String>,
    pub tuning: AccumulationTuning,
    pub window: WindowKind,
    pub power: PowerRange,
    pub frequency: FrequencyRange,
    pub resources: ResourceLoader,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            vendor_policy: VendorPolicy::default(),
            device_override: None,
            tuning: AccumulationTuning::default(),
            window: WindowKind::Default,
            power: PowerRange::default(),
            frequency: FrequencyRange::default(),
            resources: ResourceLoader::from_env(),
        }
    }
}

/// Owns the compute pipeline and the device it runs on.
///
/// Dropping it tears down kernels and buffers (inside the pipeline) before
/// the device context.
pub struct Engine {
    pipeline: ComputePipeline,
    gpu: Option<GpuContext>,
    selection: Option<Selection>,
    power: PowerRange,
    frequency: FrequencyRange,
    window_kind: WindowKind,
}

impl Engine {
    /// Enumerates devices, picks one and brings the pipeline up on it.
    pub fn new(options: &EngineOptions) -> Result<Self, EngineError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let discovered = device::discover(&instance);
        let candidates: Vec<_> = discovered.iter().map(|d| d.candidate.clone()).collect();
        let selection = device::select(
            &candidates,
            &options.vendor_policy,
            options.device_override.as_deref(),
        )?;
        let handle = discovered
            .get(selection.index)
            .map(|d| d.handle.clone())
            .ok_or(EngineError::NoSuitableDevice)?;

        let mut engine = match handle {
            DeviceHandle::Host => {
                Self::with_backend(Box::new(HostBackend::new()), SharingMode::Mirrored, None, options)
            }
            DeviceHandle::Wgpu(adapter)
                if kernel_path(true, device::advanced_compute()) == KernelPath::Host =>
            {
                warn!(
                    "[pipeline] {} lacks the workgroup features for the device kernels, running them on the host",
                    selection.candidate.name
                );
                let ctx = GpuContext::open(&adapter)?;
                Self::with_backend(
                    Box::new(HostBackend::new()),
                    SharingMode::Mirrored,
                    Some(ctx),
                    options,
                )
            }
            DeviceHandle::Wgpu(adapter) => {
                let ctx = GpuContext::open(&adapter)?;
                let sharing = selection.sharing();
                let backend = GpuBackend::new(ctx.clone(), &options.resources, sharing)?;
                let mode = if sharing {
                    SharingMode::Shared
                } else {
                    SharingMode::Mirrored
                };
                Self::with_backend(Box::new(backend), mode, Some(ctx), options)
            }
        }?;
        engine.selection = Some(selection);
        Ok(engine)
    }

    /// Builds an engine on an already opened backend.
    pub fn with_backend(
        backend: Box<dyn ComputeBackend>,
        mode: SharingMode,
        gpu: Option<GpuContext>,
        options: &EngineOptions,
    ) -> Result<Self, EngineError> {
        let window = options.window.coefficients(FFT_LEN);
        let mut pipeline = ComputePipeline::new(backend, mode, window);
        pipeline.set_tuning(options.tuning);
        let mut engine = Self {
            pipeline,
            gpu,
            selection: None,
            power: options.power,
            frequency: options.frequency,
            window_kind: options.window,
        };
        engine.set_power_range(options.power.reference_db, options.power.db_per_div)?;
        engine.set_frequency_range(options.frequency.center, options.frequency.span)?;
        info!(
            "[pipeline] engine up on {} ({})",
            engine.pipeline.backend_name(),
            if engine.sharing() { "shared" } else { "mirrored" }
        );
        Ok(engine)
    }

    pub fn process(&mut self, samples: &[Complex32]) -> Result<(), EngineError> {
        self.pipeline.process(samples)
    }

    pub fn finish(&mut self) -> Result<bool, EngineError> {
        self.pipeline.finish()
    }

    pub fn state(&self) -> PipelineState {
        self.pipeline.state()
    }

    pub fn waterfall_pos(&self) -> usize {
        self.pipeline.waterfall_pos()
    }

    pub fn sharing(&self) -> bool {
        self.pipeline.sharing()
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn gpu(&self) -> Option<&GpuContext> {
        self.gpu.as_ref()
    }

    pub fn surface_lock(&self) -> Arc<SurfaceLock> {
        self.pipeline.surface_lock()
    }

    pub fn mirrors(&self) -> &HostMirrors {
        self.pipeline.mirrors()
    }

    pub fn shared_surfaces(&self) -> Option<&SharedSurfaces> {
        self.pipeline.shared_surfaces()
    }

    pub fn set_power_range(&mut self, reference_db: f32, db_per_div: f32) -> Result<(), EngineError> {
        if !reference_db.is_finite() || !db_per_div.is_finite() || db_per_div <= 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "power range {reference_db} dB at {db_per_div} dB/div"
            )));
        }
        self.power = PowerRange {
            reference_db,
            db_per_div,
        };
        self.pipeline.histogram_range(
            self.power.scale() * HISTOGRAM_ROWS as f32,
            self.power.offset(),
        );
        debug!("[pipeline] power range {reference_db} dB, {db_per_div} dB/div");
        Ok(())
    }

    pub fn power_range(&self) -> PowerRange {
        self.power
    }

    pub fn set_frequency_range(&mut self, center: f64, span: f64) -> Result<(), EngineError> {
        if !center.is_finite() || !span.is_finite() || span <= 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "frequency range {center} Hz / {span} Hz"
            )));
        }
        self.frequency = FrequencyRange { center, span };
        Ok(())
    }

    pub fn frequency_range(&self) -> FrequencyRange {
        self.frequency
    }

    pub fn scales(&self) -> DisplayScales {
        DisplayScales {
            power: self.power,
            frequency: self.frequency,
        }
    }

    pub fn load_window(&mut self, coeffs: &[f32]) -> Result<(), EngineError> {
        self.pipeline.load_window(coeffs)
    }

    pub fn set_window_kind(&mut self, kind: WindowKind) -> Result<(), EngineError> {
        self.pipeline.load_window(&kind.coefficients(FFT_LEN))?;
        self.window_kind = kind;
        Ok(())
    }

    pub fn window_kind(&self) -> WindowKind {
        self.window_kind
    }

    pub fn set_tuning(&mut self, tuning: AccumulationTuning) {
        self.pipeline.set_tuning(tuning);
    }

    pub fn reset_max_hold(&mut self) {
        self.pipeline.reset_max_hold();
    }

    /// Where the FFT and display kernels of this engine run.
    pub fn kernel_path(&self) -> KernelPath {
        if self.pipeline.backend_name() == HostBackend::NAME {
            KernelPath::Host
        } else {
            KernelPath::Device
        }
    }
}

/// Where the FFT and display kernels run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelPath {
    Host,
    Device,
}

/// Device kernels need a GPU that also passed the process-wide advanced
/// compute check; anything else runs them on the host.
fn kernel_path(gpu: bool, advanced: bool) -> KernelPath {
    if gpu && advanced {
        KernelPath::Device
    } else {
        KernelPath::Host
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.drain() {
            debug!("[pipeline] drain on teardown: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NOISE_FLOOR, WATERFALL_ROWS, host::display_column};
    use pipeline::BATCH_GRANULE;

    fn host_engine() -> Engine {
        Engine::with_backend(
            Box::new(HostBackend::new()),
            SharingMode::Shared,
            None,
            &EngineOptions {
                resources: ResourceLoader::embedded_only(),
                ..EngineOptions::default()
            },
        )
        .unwrap()
    }

    fn tone(bin: usize, amplitude: f32, len: usize) -> Vec<Complex32> {
        (0..len)
            .map(|n| {
                let phase =
                    core::f32::consts::TAU * ((bin * n) % FFT_LEN) as f32 / FFT_LEN as f32;
                Complex32::new(phase.cos(), phase.sin()) * amplitude
            })
            .collect()
    }

    #[test]
    fn power_mapping_constants() {
        let power = PowerRange::default();
        assert_eq!(power.floor_db(), -100.0);
        assert!((power.scale() - 0.2).abs() < 1e-6);
        assert!((power.offset() - (5.0 - 1024f32.log10())).abs() < 1e-5);
        // a full-scale tone with unit window gain sits at the reference level
        assert!((power.normalize(1024f32.log10()) - 1.0).abs() < 1e-5);
        assert!(power.normalize(1024f32.log10() - 5.0).abs() < 1e-5);
    }

    #[test]
    fn rejects_degenerate_ranges() {
        let mut engine = host_engine();
        assert!(engine.set_power_range(0.0, 0.0).is_err());
        assert!(engine.set_frequency_range(1.0e6, -5.0).is_err());
        assert!(engine.set_power_range(f32::NAN, 10.0).is_err());
        assert_eq!(engine.power_range(), PowerRange::default());
    }

    #[test]
    fn host_engine_is_mirrored() {
        let engine = host_engine();
        assert!(!engine.sharing());
        assert!(engine.shared_surfaces().is_none());
        assert_eq!(engine.state(), PipelineState::Booting);
        assert_eq!(engine.kernel_path(), KernelPath::Host);
    }

    #[test]
    fn device_kernels_need_advanced_compute() {
        assert_eq!(kernel_path(true, true), KernelPath::Device);
        assert_eq!(kernel_path(true, false), KernelPath::Host);
        assert_eq!(kernel_path(false, true), KernelPath::Host);
        assert_eq!(kernel_path(false, false), KernelPath::Host);
    }

    #[test]
    fn fresh_engine_finishes_to_baseline() {
        let mut engine = host_engine();
        assert!(engine.finish().unwrap());
        assert_eq!(engine.state(), PipelineState::Ready);
        assert!(engine.mirrors().is_baseline());
    }

    #[test]
    fn tone_lands_in_histogram_row_for_its_power() {
        let mut engine = host_engine();
        // -20 dBFS tone: normalised power 0.8 at 0 dB ref, 10 dB/div
        let samples = tone(64, 0.1, BATCH_GRANULE * 4);
        for _ in 0..8 {
            engine.process(&samples).unwrap();
        }
        assert!(engine.finish().unwrap());

        let column = display_column(64);
        let mirrors = engine.mirrors();
        let row = (0..HISTOGRAM_ROWS)
            .max_by(|&a, &b| {
                mirrors
                    .histogram_cell(column, a)
                    .total_cmp(&mirrors.histogram_cell(column, b))
            })
            .unwrap();
        let expected = (0.8 * HISTOGRAM_ROWS as f32) as usize;
        assert!(row.abs_diff(expected) <= 1, "row {row}, expected {expected}");
        assert!(mirrors.hold()[column] > NOISE_FLOOR);
        assert_eq!(engine.waterfall_pos(), (8 * 64) % WATERFALL_ROWS);
    }

    #[test]
    fn max_hold_reset_takes_effect_on_next_batch() {
        let mut engine = host_engine();
        let column = display_column(10);
        engine.process(&tone(10, 1.0, BATCH_GRANULE)).unwrap();
        engine.finish().unwrap();
        let loud = engine.mirrors().hold()[column];

        engine.reset_max_hold();
        engine.process(&tone(10, 0.01, BATCH_GRANULE)).unwrap();
        engine.finish().unwrap();
        let quiet = engine.mirrors().hold()[column];
        assert!(quiet < loud - 1.0, "{quiet} vs {loud}");

        engine.process(&tone(10, 1.0, BATCH_GRANULE)).unwrap();
        engine.process(&tone(10, 0.01, BATCH_GRANULE)).unwrap();
        engine.finish().unwrap();
        assert!((engine.mirrors().hold()[column] - loud).abs() < 1e-3);
    }
}
