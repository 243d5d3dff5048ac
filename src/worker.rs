//! The process → finish → draw → poll loop, on its own thread.
//!
//! The engine is built on the worker thread so the device context never
//! crosses threads. Spawning blocks until that first step has either
//! succeeded or failed, so a fatal start-up error reaches the caller.

use crate::action::{DisplayControls, Effect, UiAction};
use crate::backend::gpu::GpuContext;
use crate::engine::Engine;
use crate::engine::pipeline::{BATCH_GRANULE, BATCH_LIMIT};
use crate::error::EngineError;
use crate::render::compositor::{DrawList, compose};
use crate::render::gpu::GpuRenderer;
use crate::surface::{GraphicsSurface, MonospaceMetrics, SurfaceEvent, TextMetrics, TextPainter};
use crate::util::fifo::SampleFifo;
use crate::util::resource::ResourceLoader;
use num_complex::Complex32;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Batches consumed per loop iteration before a frame is drawn.
pub const MAX_ITERATIONS: usize = 8;
const IDLE_WAIT: Duration = Duration::from_millis(20);
const THREAD_NAME: &str = "afterglow-worker";

/// Largest valid batch that `available` readable samples can supply.
pub fn batch_len(available: usize) -> usize {
    (available / BATCH_GRANULE * BATCH_GRANULE).min(BATCH_LIMIT)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub frames: u64,
    pub batches: u64,
    pub samples: u64,
    pub device_errors: u64,
    /// Samples thrown away while frozen.
    pub dropped: u64,
}

/// Everything the loop needs besides the engine.
pub struct WorkerSetup {
    pub controls: DisplayControls,
    pub fifo: Arc<SampleFifo>,
    pub surface: Box<dyn GraphicsSurface>,
    pub painter: Option<Box<dyn TextPainter>>,
    pub resources: ResourceLoader,
}

pub struct Worker {
    active: Arc<AtomicBool>,
    actions: mpsc::Sender<UiAction>,
    stats: Arc<Mutex<WorkerStats>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Starts the loop. `engine_factory` runs on the new thread; its error is returned here.
    pub fn spawn<F>(engine_factory: F, setup: WorkerSetup) -> Result<Self, EngineError>
    where
        F: FnOnce() -> Result<Engine, EngineError> + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let (action_tx, action_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let thread_active = Arc::clone(&active);
        let thread_stats = Arc::clone(&stats);
        let handle = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || {
                let started = engine_factory().and_then(|engine| {
                    WorkerLoop::new(engine, setup, thread_active, thread_stats, action_rx)
                });
                match started {
                    Ok(worker) => {
                        let _ = ready_tx.send(Ok(()));
                        worker.run();
                    }
                    Err(err) => {
                        error!("[worker] failed to start: {err}");
                        let _ = ready_tx.send(Err(err));
                    }
                }
            })
            .map_err(|err| EngineError::Initialization(format!("failed to spawn worker: {err}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                active,
                actions: action_tx,
                stats,
                handle: Some(handle),
            }),
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => {
                let _ = handle.join();
                Err(EngineError::Initialization(
                    "worker exited before reporting".into(),
                ))
            }
        }
    }

    /// Queues `action` for the next iteration. Returns false once the loop is gone.
    pub fn send(&self, action: UiAction) -> bool {
        self.actions.send(action).is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> WorkerStats {
        *self.stats.lock()
    }

    /// Clears the active flag and waits for the loop to tear the engine down.
    pub fn stop(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("[worker] thread panicked");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Graphics {
    gpu: GpuContext,
    renderer: GpuRenderer,
    needs_upload: bool,
}

struct WorkerLoop {
    engine: Engine,
    controls: DisplayControls,
    fifo: Arc<SampleFifo>,
    batch: Vec<Complex32>,
    surface: Box<dyn GraphicsSurface>,
    painter: Option<Box<dyn TextPainter>>,
    graphics: Option<Graphics>,
    active: Arc<AtomicBool>,
    stats: Arc<Mutex<WorkerStats>>,
    actions: mpsc::Receiver<UiAction>,
}

impl WorkerLoop {
    fn new(
        mut engine: Engine,
        setup: WorkerSetup,
        active: Arc<AtomicBool>,
        stats: Arc<Mutex<WorkerStats>>,
        actions: mpsc::Receiver<UiAction>,
    ) -> Result<Self, EngineError> {
        let WorkerSetup {
            mut controls,
            fifo,
            mut surface,
            painter,
            resources,
        } = setup;

        let graphics = open_graphics(&engine, surface.as_mut(), &resources)?;
        let (width, height) = surface.size();
        controls.resize(width, height);
        let power = controls.power_range();
        engine.set_power_range(power.reference_db, power.db_per_div)?;

        Ok(Self {
            engine,
            controls,
            fifo,
            batch: Vec::new(),
            surface,
            painter,
            graphics,
            active,
            stats,
            actions,
        })
    }

    fn running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn run(mut self) {
        info!("[worker] running");
        while self.running() {
            self.handle_input();
            if !self.running() {
                break;
            }
            let consumed = self.consume();
            self.frame();
            if consumed == 0 && self.running() {
                self.fifo.wait_readable(BATCH_GRANULE, IDLE_WAIT);
            }
        }
        if let Err(err) = self.engine.finish() {
            warn!("[worker] final drain failed: {err}");
        }
        self.graphics = None;
        self.surface.release();
        info!("[worker] stopped");
    }

    fn handle_input(&mut self) {
        let mut actions: Vec<UiAction> = self.actions.try_iter().collect();
        for event in self.surface.pump_events() {
            match event {
                SurfaceEvent::Resized { width, height } => {
                    debug!("[worker] surface resized to {width}x{height}");
                    self.controls.resize(width, height);
                }
                SurfaceEvent::Action(action) => actions.push(action),
                SurfaceEvent::Close => {
                    info!("[worker] surface closed");
                    self.active.store(false, Ordering::Release);
                }
            }
        }
        for action in actions {
            self.apply(action);
        }
    }

    fn apply(&mut self, action: UiAction) {
        match self.controls.apply(action) {
            Effect::Power => {
                let power = self.controls.power_range();
                if let Err(err) = self
                    .engine
                    .set_power_range(power.reference_db, power.db_per_div)
                {
                    warn!("[worker] rejected power range: {err}");
                }
            }
            Effect::ResetMaxHold => self.engine.reset_max_hold(),
            Effect::Freeze(frozen) => {
                info!("[worker] {}", if frozen { "frozen" } else { "resumed" });
            }
            Effect::Layout | Effect::None => {}
        }
    }

    /// Runs up to [`MAX_ITERATIONS`] batches. Returns how many samples went through the engine.
    fn consume(&mut self) -> usize {
        if self.controls.frozen() {
            let dropped = self.fifo.discard_all();
            self.stats.lock().dropped += dropped as u64;
            return 0;
        }

        let mut consumed = 0;
        for _ in 0..MAX_ITERATIONS {
            let len = batch_len(self.fifo.used().min(self.fifo.read_max_contiguous()));
            if len == 0 {
                break;
            }
            let Some(reader) = self.fifo.read_peek(len, false, &mut self.batch) else {
                break;
            };
            let len = reader.len();
            match self.engine.process(reader.samples()) {
                Ok(()) => {
                    reader.discard(len);
                    consumed += len;
                    let mut stats = self.stats.lock();
                    stats.batches += 1;
                    stats.samples += len as u64;
                }
                Err(err @ EngineError::InvalidArgument(_)) => {
                    warn!("[worker] dropped batch: {err}");
                    break;
                }
                Err(err @ EngineError::DeviceLost { .. }) => {
                    error!("[worker] {err}, stopping");
                    self.active.store(false, Ordering::Release);
                    break;
                }
                Err(err) => {
                    warn!("[worker] batch failed: {err}");
                    reader.discard(len);
                    self.stats.lock().device_errors += 1;
                }
            }
        }
        consumed
    }

    fn frame(&mut self) {
        let refreshed = match self.engine.finish() {
            Ok(refreshed) => refreshed,
            Err(err @ EngineError::DeviceLost { .. }) => {
                error!("[worker] {err}, stopping");
                self.active.store(false, Ordering::Release);
                return;
            }
            Err(err) => {
                warn!("[worker] finish failed: {err}");
                self.stats.lock().device_errors += 1;
                return;
            }
        };

        let lock = self.engine.surface_lock();
        let Some(_access) = lock.read() else {
            debug!("[worker] surfaces busy, frame skipped");
            return;
        };

        let scales = self.engine.scales();
        let pos = self.engine.waterfall_pos();
        let fallback = MonospaceMetrics::default();
        let lists: Vec<DrawList> = {
            let metrics: &dyn TextMetrics = match self.painter.as_deref() {
                Some(painter) => painter,
                None => &fallback,
            };
            self.controls
                .descriptors()
                .map(|desc| compose(desc, &scales, pos, metrics))
                .collect()
        };

        if let Some(graphics) = self.graphics.as_mut() {
            if (refreshed || graphics.needs_upload) && graphics.renderer.mirrored() {
                match graphics
                    .renderer
                    .upload(&graphics.gpu, self.engine.mirrors())
                {
                    Ok(()) => graphics.needs_upload = false,
                    Err(err) => {
                        warn!("[worker] {err}");
                        self.stats.lock().device_errors += 1;
                    }
                }
            }
            if let Some(target) = self.surface.target(Some(&graphics.gpu)) {
                let size = self.surface.size();
                let painter = self
                    .painter
                    .as_deref_mut()
                    .map(|p| p as &mut dyn TextPainter);
                if let Err(err) = graphics
                    .renderer
                    .draw(&graphics.gpu, &lists, &target, size, painter)
                {
                    warn!("[worker] {err}");
                    self.stats.lock().device_errors += 1;
                }
            }
        }

        self.surface.present();
        self.stats.lock().frames += 1;
    }
}

/// Picks the graphics context: the engine's device when it has one,
/// else a default adapter if the surface cannot do without.
fn open_graphics(
    engine: &Engine,
    surface: &mut dyn GraphicsSurface,
    resources: &ResourceLoader,
) -> Result<Option<Graphics>, EngineError> {
    if let Some(gpu) = engine.gpu() {
        surface.acquire(Some(gpu))?;
        let renderer = GpuRenderer::new(gpu, surface.format(), resources, engine.shared_surfaces())?;
        return Ok(Some(Graphics {
            gpu: gpu.clone(),
            needs_upload: renderer.mirrored(),
            renderer,
        }));
    }

    if surface.acquire(None).is_ok() {
        return Ok(None);
    }
    let gpu = GpuContext::open_default().inspect_err(|err| {
        warn!("[worker] no graphics device for the surface: {err}");
    })?;
    surface.acquire(Some(&gpu))?;
    let renderer = GpuRenderer::new(&gpu, surface.format(), resources, None)?;
    Ok(Some(Graphics {
        gpu,
        renderer,
        needs_upload: true,
    }))
}
