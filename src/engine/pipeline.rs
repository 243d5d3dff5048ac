//! Batched FFT + accumulation on the selected compute backend.

use super::broker::{SharingMode, SurfaceBroker, SurfaceLock};
use crate::backend::{
    AccumulationTuning, BATCH_MULTIPLE, ComputeBackend, DisplayParams, FFT_LEN, HostMirrors,
    MAX_BATCH, WATERFALL_ROWS, gpu::SharedSurfaces,
};
use crate::error::{DeviceError, EngineError};
use num_complex::Complex32;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Consecutive device failures after which the device is reported lost.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 8;

/// Smallest accepted batch, in samples.
pub const BATCH_GRANULE: usize = FFT_LEN * BATCH_MULTIPLE;
/// Largest accepted batch, in samples.
pub const BATCH_LIMIT: usize = FFT_LEN * MAX_BATCH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Nothing processed yet; surfaces hold undefined memory.
    Booting,
    /// Compute work submitted; graphics must not sample the surfaces.
    Pending,
    /// Results visible to graphics.
    Ready,
}

pub fn validate_batch_len(len: usize) -> Result<usize, EngineError> {
    if len == 0 || !len.is_multiple_of(BATCH_GRANULE) || len > BATCH_LIMIT {
        return Err(EngineError::InvalidArgument(format!(
            "batch of {len} samples must be a non-zero multiple of {BATCH_GRANULE} up to {BATCH_LIMIT}"
        )));
    }
    Ok(len / FFT_LEN)
}

pub struct ComputePipeline {
    broker: SurfaceBroker,
    state: PipelineState,
    waterfall_pos: usize,
    window: Vec<f32>,
    window_dirty: bool,
    histo_scale: f32,
    histo_offset: f32,
    tuning: AccumulationTuning,
    reset_hold: bool,
    failures: u32,
    backend: Box<dyn ComputeBackend>,
}

impl ComputePipeline {
    pub fn new(backend: Box<dyn ComputeBackend>, mode: SharingMode, window: Vec<f32>) -> Self {
        let broker = SurfaceBroker::new(mode, backend.as_ref());
        Self {
            broker,
            state: PipelineState::Booting,
            waterfall_pos: 0,
            window,
            window_dirty: true,
            histo_scale: 0.0,
            histo_offset: 0.0,
            tuning: AccumulationTuning::default(),
            reset_hold: false,
            failures: 0,
            backend,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn waterfall_pos(&self) -> usize {
        self.waterfall_pos
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn sharing(&self) -> bool {
        self.broker.sharing()
    }

    pub fn broker(&self) -> &SurfaceBroker {
        &self.broker
    }

    pub fn surface_lock(&self) -> Arc<SurfaceLock> {
        self.broker.lock()
    }

    pub fn mirrors(&self) -> &HostMirrors {
        self.broker.mirrors()
    }

    pub fn shared_surfaces(&self) -> Option<&SharedSurfaces> {
        self.broker.shared_surfaces()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Stages new window coefficients; they are uploaded by the next `process`.
    pub fn load_window(&mut self, coeffs: &[f32]) -> Result<(), EngineError> {
        if coeffs.len() != FFT_LEN {
            return Err(EngineError::InvalidArgument(format!(
                "window needs {FFT_LEN} coefficients, got {}",
                coeffs.len()
            )));
        }
        self.window.clear();
        self.window.extend_from_slice(coeffs);
        self.window_dirty = true;
        Ok(())
    }

    /// Histogram row scale and `log10|X|` offset used by the next display dispatch.
    pub fn histogram_range(&mut self, scale: f32, offset: f32) {
        self.histo_scale = scale;
        self.histo_offset = offset;
    }

    pub fn set_tuning(&mut self, tuning: AccumulationTuning) {
        self.tuning = tuning;
    }

    /// Max-hold restarts from the noise floor at the next display dispatch.
    pub fn reset_max_hold(&mut self) {
        self.reset_hold = true;
    }

    pub fn process(&mut self, samples: &[Complex32]) -> Result<(), EngineError> {
        let spectra = validate_batch_len(samples.len())?;
        let mut acquired = false;
        match self.run_batch(samples, spectra, &mut acquired) {
            Ok(()) => {
                self.waterfall_pos = (self.waterfall_pos + spectra) % WATERFALL_ROWS;
                self.state = PipelineState::Pending;
                self.window_dirty = false;
                self.reset_hold = false;
                self.failures = 0;
                Ok(())
            }
            Err(err) => {
                if acquired
                    && let Err(release) = self.broker.release(self.backend.as_mut())
                {
                    warn!("[pipeline] release after failed batch: {release}");
                }
                Err(self.note_failure(err))
            }
        }
    }

    fn run_batch(
        &mut self,
        samples: &[Complex32],
        spectra: usize,
        acquired: &mut bool,
    ) -> Result<(), DeviceError> {
        let backend = self.backend.as_mut();
        if self.window_dirty {
            backend.write_window(&self.window)?;
        }
        backend.write_samples(samples)?;
        backend.run_fft(spectra)?;

        if self.broker.sharing()
            && matches!(self.state, PipelineState::Ready | PipelineState::Booting)
        {
            self.broker.acquire(backend)?;
            *acquired = true;
        }
        if self.state == PipelineState::Booting {
            backend.clear_surfaces()?;
        }

        backend.run_display(&DisplayParams {
            waterfall_pos: self.waterfall_pos as u32,
            spectra: spectra as u32,
            histo_scale: self.histo_scale,
            histo_offset: self.histo_offset,
            rise: self.tuning.histogram_rise,
            decay: self.tuning.histogram_decay,
            live_alpha: self.tuning.live_alpha,
            reset_hold: u32::from(self.reset_hold),
        })
    }

    /// Makes the last batch visible to graphics. Returns whether the host
    /// mirrors were refreshed and must be re-uploaded.
    pub fn finish(&mut self) -> Result<bool, EngineError> {
        if self.state == PipelineState::Ready {
            return Ok(false);
        }
        match self.settle() {
            Ok(refreshed) => {
                match self.state {
                    PipelineState::Booting => {
                        debug!("[pipeline] baseline published before first batch")
                    }
                    PipelineState::Pending => self.failures = 0,
                    PipelineState::Ready => {}
                }
                self.state = PipelineState::Ready;
                Ok(refreshed)
            }
            Err(err) => Err(self.note_failure(err)),
        }
    }

    fn settle(&mut self) -> Result<bool, DeviceError> {
        let backend = self.backend.as_mut();
        if self.state == PipelineState::Booting {
            if self.broker.sharing() && !self.broker.held() {
                self.broker.acquire(backend)?;
            }
            if let Err(err) = backend.clear_surfaces() {
                if self.broker.held()
                    && let Err(release) = self.broker.release(backend)
                {
                    warn!("[pipeline] release after failed clear: {release}");
                }
                return Err(err);
            }
        }
        if self.broker.sharing() {
            if self.broker.held() {
                self.broker.release(backend)?;
            }
            return Ok(false);
        }
        let refreshed = self.broker.refresh(backend)?;
        backend.drain()?;
        Ok(refreshed)
    }

    /// Waits for outstanding device work, used before teardown.
    pub fn drain(&mut self) -> Result<(), EngineError> {
        self.backend.drain().map_err(EngineError::from)
    }

    fn note_failure(&mut self, err: DeviceError) -> EngineError {
        self.failures += 1;
        if self.failures >= MAX_CONSECUTIVE_FAILURES {
            error!(
                "[pipeline] {} lost after {} failures: {err}",
                self.backend.name(),
                self.failures
            );
            EngineError::DeviceLost {
                failures: self.failures,
            }
        } else {
            warn!("[pipeline] batch dropped: {err}");
            EngineError::Device(err)
        }
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        if self.broker.held() {
            let _ = self.broker.release(self.backend.as_mut());
        }
        if self.state == PipelineState::Pending {
            let _ = self.backend.drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostBackend;
    use crate::backend::NOISE_FLOOR;
    use crate::engine::broker::SurfaceOwner;
    use crate::error::DeviceStage;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counters {
        acquires: AtomicU32,
        releases: AtomicU32,
        read_backs: AtomicU32,
    }

    /// Host backend that pretends to share and can fail at a chosen stage.
    struct Flaky {
        inner: HostBackend,
        fail_at: Option<DeviceStage>,
        share: bool,
        counters: Arc<Counters>,
    }

    impl Flaky {
        fn new(share: bool) -> (Self, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            (
                Self {
                    inner: HostBackend::new(),
                    fail_at: None,
                    share,
                    counters: Arc::clone(&counters),
                },
                counters,
            )
        }

        fn check(&self, stage: DeviceStage) -> Result<(), DeviceError> {
            match self.fail_at {
                Some(at) if at == stage => Err(DeviceError::new(stage, "injected")),
                _ => Ok(()),
            }
        }
    }

    impl ComputeBackend for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn write_window(&mut self, coeffs: &[f32]) -> Result<(), DeviceError> {
            self.check(DeviceStage::Upload)?;
            self.inner.write_window(coeffs)
        }
        fn write_samples(&mut self, samples: &[Complex32]) -> Result<(), DeviceError> {
            self.check(DeviceStage::Upload)?;
            self.inner.write_samples(samples)
        }
        fn run_fft(&mut self, spectra: usize) -> Result<(), DeviceError> {
            self.check(DeviceStage::Fft)?;
            self.inner.run_fft(spectra)
        }
        fn run_display(&mut self, params: &DisplayParams) -> Result<(), DeviceError> {
            self.check(DeviceStage::Display)?;
            self.inner.run_display(params)
        }
        fn clear_surfaces(&mut self) -> Result<(), DeviceError> {
            self.check(DeviceStage::Clear)?;
            self.inner.clear_surfaces()
        }
        fn acquire_surfaces(&mut self) -> Result<(), DeviceError> {
            self.check(DeviceStage::Acquire)?;
            self.counters.acquires.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn release_surfaces(&mut self) -> Result<(), DeviceError> {
            self.check(DeviceStage::Release)?;
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn read_back(&mut self, mirrors: &mut HostMirrors) -> Result<(), DeviceError> {
            self.check(DeviceStage::ReadBack)?;
            self.counters.read_backs.fetch_add(1, Ordering::SeqCst);
            self.inner.read_back(mirrors)
        }
        fn drain(&mut self) -> Result<(), DeviceError> {
            self.check(DeviceStage::Drain)?;
            Ok(())
        }
        fn can_share(&self) -> bool {
            self.share
        }
    }

    fn pipeline(backend: Box<dyn ComputeBackend>) -> ComputePipeline {
        let mode = if backend.can_share() {
            SharingMode::Shared
        } else {
            SharingMode::Mirrored
        };
        let mut pipeline = ComputePipeline::new(
            backend,
            mode,
            crate::engine::window::WindowKind::Default.coefficients(FFT_LEN),
        );
        pipeline.histogram_range(0.2 * 128.0, -(3.0103 - 5.0));
        pipeline
    }

    fn noise(len: usize) -> Vec<Complex32> {
        (0..len)
            .map(|i| Complex32::new(((i * 7919) % 101) as f32 / 101.0 - 0.5, 0.0))
            .collect()
    }

    #[test]
    fn finish_before_any_batch_publishes_baseline() {
        let mut p = pipeline(Box::new(HostBackend::new()));
        assert_eq!(p.state(), PipelineState::Booting);
        assert!(p.finish().unwrap());
        assert_eq!(p.state(), PipelineState::Ready);
        assert!(p.mirrors().is_baseline());
        assert!(!p.finish().unwrap(), "finish on Ready is a no-op");
    }

    #[test]
    fn valid_lengths_advance_waterfall() {
        let mut p = pipeline(Box::new(HostBackend::new()));
        let mut expected = 0;
        for spectra in [16, 1024, 32, 1008, 16] {
            p.process(&noise(spectra * FFT_LEN)).unwrap();
            assert_eq!(p.state(), PipelineState::Pending);
            p.finish().unwrap();
            assert_eq!(p.state(), PipelineState::Ready);
            expected = (expected + spectra) % WATERFALL_ROWS;
            assert_eq!(p.waterfall_pos(), expected);
        }
    }

    #[test]
    fn invalid_lengths_leave_state_alone() {
        let mut p = pipeline(Box::new(HostBackend::new()));
        for len in [0, FFT_LEN, BATCH_GRANULE + 1, BATCH_LIMIT + BATCH_GRANULE, 3 * FFT_LEN * 7] {
            let err = p.process(&noise(len)).unwrap_err();
            assert!(matches!(err, EngineError::InvalidArgument(_)), "len {len}");
            assert_eq!(p.state(), PipelineState::Booting);
            assert_eq!(p.waterfall_pos(), 0);
        }
        assert_eq!(p.failures(), 0);
    }

    #[test]
    fn first_batch_clears_surfaces() {
        let mut p = pipeline(Box::new(HostBackend::new()));
        p.process(&vec![Complex32::default(); BATCH_GRANULE]).unwrap();
        p.finish().unwrap();
        let mirrors = p.mirrors();
        assert!(mirrors.live().iter().all(|&v| v == NOISE_FLOOR));
        assert!(mirrors.waterfall_row(0).iter().all(|&v| v == NOISE_FLOOR));
    }

    #[test]
    fn two_batches_without_finish_acquire_once() {
        let (backend, counters) = Flaky::new(true);
        let mut p = pipeline(Box::new(backend));
        assert!(p.sharing());
        p.process(&noise(BATCH_GRANULE)).unwrap();
        p.process(&noise(BATCH_GRANULE)).unwrap();
        assert_eq!(p.waterfall_pos(), 32);
        assert_eq!(counters.acquires.load(Ordering::SeqCst), 1);
        assert_eq!(p.surface_lock().owner(), SurfaceOwner::Compute);

        assert!(!p.finish().unwrap(), "shared surfaces need no re-upload");
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert_eq!(counters.read_backs.load(Ordering::SeqCst), 0);
        assert_eq!(p.surface_lock().owner(), SurfaceOwner::Free);

        p.process(&noise(BATCH_GRANULE)).unwrap();
        assert_eq!(counters.acquires.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn mirrored_finish_reads_back() {
        let (backend, counters) = Flaky::new(false);
        let mut p = pipeline(Box::new(backend));
        assert!(!p.sharing());
        p.process(&noise(BATCH_GRANULE)).unwrap();
        p.process(&noise(BATCH_GRANULE)).unwrap();
        assert_eq!(counters.acquires.load(Ordering::SeqCst), 0);
        assert!(p.finish().unwrap());
        assert_eq!(counters.read_backs.load(Ordering::SeqCst), 1);
        assert!(!p.mirrors().is_baseline());
    }

    #[test]
    fn process_waits_for_graphics_to_let_go() {
        let (backend, _) = Flaky::new(true);
        let mut p = pipeline(Box::new(backend));
        p.process(&noise(BATCH_GRANULE)).unwrap();
        p.finish().unwrap();

        let lock = p.surface_lock();
        let access = lock.read().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || {
            let result = p.process(&noise(BATCH_GRANULE));
            let _ = tx.send(());
            (result, p)
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(rx.try_recv().is_err(), "process ran while graphics held the surfaces");
        drop(access);

        let (result, p) = worker.join().unwrap();
        result.unwrap();
        assert_eq!(p.waterfall_pos(), 32);
        assert_eq!(lock.owner(), SurfaceOwner::Compute);
    }

    #[test]
    fn failed_shared_batch_releases_surfaces() {
        let (mut backend, counters) = Flaky::new(true);
        backend.fail_at = Some(DeviceStage::Display);
        let mut p = pipeline(Box::new(backend));
        assert!(p.process(&noise(BATCH_GRANULE)).is_err());
        assert_eq!(counters.acquires.load(Ordering::SeqCst), 1);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert_eq!(p.surface_lock().owner(), SurfaceOwner::Free);
        assert_eq!(p.state(), PipelineState::Booting);
    }

    #[test]
    fn failed_batch_commits_nothing() {
        let (mut backend, _) = Flaky::new(false);
        backend.fail_at = Some(DeviceStage::Display);
        let mut p = pipeline(Box::new(backend));
        let err = p.process(&noise(BATCH_GRANULE)).unwrap_err();
        assert!(matches!(err, EngineError::Device(ref e) if e.stage == DeviceStage::Display));
        assert_eq!(p.state(), PipelineState::Booting);
        assert_eq!(p.waterfall_pos(), 0);
        assert_eq!(p.surface_lock().owner(), SurfaceOwner::Free);
    }

    #[test]
    fn repeated_failures_report_device_lost() {
        let (mut backend, _) = Flaky::new(false);
        backend.fail_at = Some(DeviceStage::Fft);
        let mut p = pipeline(Box::new(backend));
        for _ in 1..MAX_CONSECUTIVE_FAILURES {
            assert!(matches!(
                p.process(&noise(BATCH_GRANULE)),
                Err(EngineError::Device(_))
            ));
        }
        assert_eq!(
            p.process(&noise(BATCH_GRANULE)).unwrap_err(),
            EngineError::DeviceLost {
                failures: MAX_CONSECUTIVE_FAILURES
            }
        );
    }

    #[test]
    fn finish_between_failed_batches_still_escalates() {
        let (mut backend, _) = Flaky::new(false);
        backend.fail_at = Some(DeviceStage::Fft);
        let mut p = pipeline(Box::new(backend));
        for attempt in 1..MAX_CONSECUTIVE_FAILURES {
            assert!(matches!(
                p.process(&noise(BATCH_GRANULE)),
                Err(EngineError::Device(_))
            ));
            p.finish().unwrap();
            assert_eq!(p.failures(), attempt);
        }
        assert_eq!(
            p.process(&noise(BATCH_GRANULE)).unwrap_err(),
            EngineError::DeviceLost {
                failures: MAX_CONSECUTIVE_FAILURES
            }
        );
    }

    #[test]
    fn committed_batch_clears_failure_count() {
        let (backend, _) = Flaky::new(false);
        let mut p = pipeline(Box::new(backend));
        p.failures = 3;
        p.finish().unwrap();
        assert_eq!(p.failures(), 3, "baseline publish is not a committed batch");
        p.process(&noise(BATCH_GRANULE)).unwrap();
        assert_eq!(p.failures(), 0);
    }

    #[test]
    fn baseline_clear_waits_for_graphics_to_let_go() {
        let (backend, counters) = Flaky::new(true);
        let mut p = pipeline(Box::new(backend));
        let lock = p.surface_lock();
        let access = lock.read().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || {
            let result = p.finish();
            let _ = tx.send(());
            (result, p)
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(rx.try_recv().is_err(), "surfaces cleared while graphics held them");
        drop(access);

        let (result, p) = worker.join().unwrap();
        assert!(!result.unwrap());
        assert_eq!(p.state(), PipelineState::Ready);
        assert_eq!(counters.acquires.load(Ordering::SeqCst), 1);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert_eq!(lock.owner(), SurfaceOwner::Free);
    }

    #[test]
    fn failed_baseline_clear_releases_surfaces() {
        let (mut backend, counters) = Flaky::new(true);
        backend.fail_at = Some(DeviceStage::Clear);
        let mut p = pipeline(Box::new(backend));
        let err = p.finish().unwrap_err();
        assert!(matches!(err, EngineError::Device(ref e) if e.stage == DeviceStage::Clear));
        assert_eq!(p.state(), PipelineState::Booting);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert_eq!(p.surface_lock().owner(), SurfaceOwner::Free);
    }

    #[test]
    fn read_back_failure_keeps_pending() {
        let (mut backend, _) = Flaky::new(false);
        backend.fail_at = Some(DeviceStage::ReadBack);
        let mut p = pipeline(Box::new(backend));
        p.process(&noise(BATCH_GRANULE)).unwrap();
        assert!(p.finish().is_err());
        assert_eq!(p.state(), PipelineState::Pending);
        assert_eq!(p.waterfall_pos(), 16);
    }

    #[test]
    fn window_must_match_fft_length() {
        let mut p = pipeline(Box::new(HostBackend::new()));
        assert!(matches!(
            p.load_window(&[1.0; 10]),
            Err(EngineError::InvalidArgument(_))
        ));
        p.load_window(&[1.0; FFT_LEN]).unwrap();
    }
}
