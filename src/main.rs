use afterglow::action::DisplayControls;
use afterglow::config::SettingsStore;
use afterglow::dsp::overlap::OverlapFramer;
use afterglow::surface::HeadlessSurface;
use afterglow::util::fifo::SampleFifo;
use afterglow::util::resource::ResourceLoader;
use afterglow::{Engine, Worker, WorkerSetup};
use anyhow::Context;
use num_complex::Complex32;
use std::f32::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_RUN_SECS: u64 = 10;
const CHUNK: usize = 4096;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let run_for = std::env::args()
        .nth(1)
        .map(|arg| arg.parse::<u64>().context("run time must be whole seconds"))
        .transpose()?
        .map_or(Duration::from_secs(DEFAULT_RUN_SECS), Duration::from_secs);

    let store = SettingsStore::load_or_default();
    let settings = store.data.clone();
    info!("[settings] loaded {:?}", store.path());

    let fifo = Arc::new(SampleFifo::new(settings.fifo_capacity));
    let (surface, _events) = HeadlessSurface::new(settings.display.width, settings.display.height);
    let controls = DisplayControls::new(
        settings.render_options(),
        settings.power.reference_db,
        settings.power.db_per_div_index,
    );
    let setup = WorkerSetup {
        controls,
        fifo: Arc::clone(&fifo),
        surface: Box::new(surface),
        painter: None,
        resources: ResourceLoader::from_env(),
    };
    let options = settings.engine_options();
    let mut worker = Worker::spawn(move || Engine::new(&options), setup)
        .context("display engine failed to start")?;

    let running = Arc::new(AtomicBool::new(true));
    let producer = {
        let running = Arc::clone(&running);
        let fifo = Arc::clone(&fifo);
        let rate = settings.frequency.span;
        let framer = OverlapFramer::new(settings.overlap());
        thread::Builder::new()
            .name("afterglow-tone".into())
            .spawn(move || run_tone(&fifo, framer, rate, &running))
            .context("failed to spawn tone producer")?
    };

    let started = Instant::now();
    while started.elapsed() < run_for && worker.is_active() {
        thread::sleep(Duration::from_millis(250));
    }

    running.store(false, Ordering::Release);
    fifo.close();
    if let Err(panic) = producer.join() {
        warn!("[worker] tone producer panicked: {}", panic_message(panic.as_ref()));
    }
    worker.stop();

    let stats = worker.stats();
    info!(
        "[worker] {} frames, {} batches, {} samples, {} device errors, {} dropped",
        stats.frames, stats.batches, stats.samples, stats.device_errors, stats.dropped
    );
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

/// Feeds a slowly sweeping tone over a weak second carrier, paced to `rate` samples per second.
fn run_tone(fifo: &SampleFifo, mut framer: OverlapFramer, rate: f64, running: &AtomicBool) {
    let mut raw = vec![Complex32::default(); CHUNK];
    let mut framed = Vec::new();
    let mut n: u64 = 0;
    let chunk_time = Duration::from_secs_f64(CHUNK as f64 / rate.max(1.0));
    let mut next = Instant::now();

    while running.load(Ordering::Acquire) {
        for sample in raw.iter_mut() {
            let t = n as f32;
            let sweep = 0.25 * (t * 1e-6).sin();
            *sample = Complex32::from_polar(0.5, TAU * sweep * t)
                + Complex32::from_polar(0.01, TAU * -0.3 * t);
            n += 1;
        }
        framed.clear();
        framer.process_into(&raw, &mut framed);
        if fifo.push(&framed, true) < framed.len() {
            break;
        }

        next += chunk_time;
        match next.checked_duration_since(Instant::now()) {
            Some(wait) => thread::sleep(wait),
            None => next = Instant::now(),
        }
    }
}
