//! wgpu compute backend: WGSL FFT, display and clear kernels.

use super::{
    ComputeBackend, DisplayParams, FFT_LEN, HISTOGRAM_ROWS, HostMirrors, MAX_BATCH, SPECTRUM_LEN,
    WATERFALL_ROWS,
};
use crate::error::{DeviceError, DeviceStage, EngineError};
use crate::util::resource::ResourceLoader;
use bytemuck::{Pod, Zeroable};
use iced_wgpu::wgpu;
use num_complex::Complex32;
use parking_lot::Mutex;
use std::mem::size_of;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Serialises first-time device creation across engine instances.
static CONTEXT_INIT: Mutex<()> = Mutex::new(());

const WORKGROUP: u32 = 256;
const QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

const WATERFALL_BYTES: u64 = (FFT_LEN * WATERFALL_ROWS * size_of::<f32>()) as u64;
const HISTOGRAM_BYTES: u64 = (FFT_LEN * HISTOGRAM_ROWS * size_of::<f32>()) as u64;
const SPECTRUM_BYTES: u64 = (SPECTRUM_LEN * size_of::<f32>()) as u64;
const SAMPLE_BYTES: u64 = (FFT_LEN * MAX_BATCH * size_of::<Complex32>()) as u64;

/// Device and queue opened on a selected adapter.
#[derive(Debug, Clone)]
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub info: wgpu::AdapterInfo,
}

impl GpuContext {
    pub fn open(adapter: &wgpu::Adapter) -> Result<Self, EngineError> {
        let _guard = CONTEXT_INIT.lock();
        let info = adapter.get_info();
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("afterglow device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            ..Default::default()
        }))
        .map_err(|err| EngineError::Initialization(format!("{}: {err}", info.name)))?;
        info!("[device] opened {} ({:?})", info.name, info.backend);
        Ok(Self {
            device,
            queue,
            info,
        })
    }

    /// Opens the default adapter, for drawing when the compute side has no device.
    pub fn open_default() -> Result<Self, EngineError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(|err| EngineError::Initialization(format!("no graphics adapter: {err}")))?;
        Self::open(&adapter)
    }

    /// Compiles a WGSL resource, capturing the build log on failure.
    pub fn shader_module(
        &self,
        resources: &ResourceLoader,
        name: &str,
    ) -> Result<wgpu::ShaderModule, EngineError> {
        let source = resources.get_text(name)?;
        self.scoped(|| {
            self.device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(name),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                })
        })
        .map_err(|log| EngineError::ShaderBuild {
            name: name.to_string(),
            log,
        })
    }

    /// Runs `f` inside validation and out-of-memory error scopes.
    pub fn scoped<T>(&self, f: impl FnOnce() -> T) -> Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        match validation.or(oom) {
            Some(err) => Err(err.to_string()),
            None => Ok(out),
        }
    }

    /// Polls the device until `rx` yields or the queue timeout expires.
    pub fn wait_for<T>(&self, rx: &mpsc::Receiver<T>, stage: DeviceStage) -> Result<T, DeviceError> {
        let deadline = Instant::now() + QUEUE_TIMEOUT;
        loop {
            let _ = self.device.poll(wgpu::PollType::Poll);
            match rx.try_recv() {
                Ok(value) => return Ok(value),
                Err(mpsc::TryRecvError::Disconnected) => {
                    return Err(DeviceError::new(stage, "device dropped the callback"));
                }
                Err(mpsc::TryRecvError::Empty) => {}
            }
            if Instant::now() > deadline {
                return Err(DeviceError::new(stage, "timed out waiting for the queue"));
            }
            std::thread::yield_now();
        }
    }

    pub fn drain(&self) -> Result<(), DeviceError> {
        let (tx, rx) = mpsc::channel();
        self.queue.on_submitted_work_done(move || {
            let _ = tx.send(());
        });
        self.wait_for(&rx, DeviceStage::Drain)
    }
}

/// Result surfaces as storage buffers both contexts can bind.
#[derive(Debug, Clone)]
pub struct SharedSurfaces {
    pub waterfall: wgpu::Buffer,
    pub histogram: wgpu::Buffer,
    pub spectrum: wgpu::Buffer,
}

impl SharedSurfaces {
    fn new(device: &wgpu::Device) -> Self {
        let usage =
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
        let make = |label, size| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        };
        Self {
            waterfall: make("afterglow waterfall", WATERFALL_BYTES),
            histogram: make("afterglow histogram", HISTOGRAM_BYTES),
            spectrum: make("afterglow spectrum", SPECTRUM_BYTES),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FftParams {
    spectra: u32,
    _pad: [u32; 3],
}

struct Staging {
    waterfall: wgpu::Buffer,
    histogram: wgpu::Buffer,
    spectrum: wgpu::Buffer,
}

impl Staging {
    fn new(device: &wgpu::Device) -> Self {
        let make = |label, size| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        Self {
            waterfall: make("afterglow waterfall read-back", WATERFALL_BYTES),
            histogram: make("afterglow histogram read-back", HISTOGRAM_BYTES),
            spectrum: make("afterglow spectrum read-back", SPECTRUM_BYTES),
        }
    }
}

/// Compute backend running on a wgpu device.
///
/// Fields drop in declaration order: kernels, programs, shared surfaces,
/// plain buffers, then the queue and device.
pub struct GpuBackend {
    fft_pipeline: wgpu::ComputePipeline,
    display_pipeline: wgpu::ComputePipeline,
    clear_pipeline: wgpu::ComputePipeline,
    fft_bind_group: wgpu::BindGroup,
    display_bind_group: wgpu::BindGroup,
    _fft_module: wgpu::ShaderModule,
    _display_module: wgpu::ShaderModule,
    surfaces: SharedSurfaces,
    staging: Option<Staging>,
    samples: wgpu::Buffer,
    window: wgpu::Buffer,
    spectra: wgpu::Buffer,
    fft_params: wgpu::Buffer,
    display_params: wgpu::Buffer,
    staged_samples: usize,
    transformed: usize,
    sharing: bool,
    ctx: GpuContext,
}

impl GpuBackend {
    pub fn new(
        ctx: GpuContext,
        resources: &ResourceLoader,
        sharing: bool,
    ) -> Result<Self, EngineError> {
        let device = &ctx.device;
        let fft_module = ctx.shader_module(resources, "fft.wgsl")?;
        let display_module = ctx.shader_module(resources, "display.wgsl")?;

        let buffer = |label, size, usage| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        };
        let storage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        let uniform = wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST;
        let samples = buffer("afterglow samples", SAMPLE_BYTES, storage);
        let spectra = buffer("afterglow spectra", SAMPLE_BYTES, storage);
        let window = buffer(
            "afterglow window",
            (FFT_LEN * size_of::<f32>()) as u64,
            storage,
        );
        let fft_params = buffer(
            "afterglow fft params",
            size_of::<FftParams>() as u64,
            uniform,
        );
        let display_params = buffer(
            "afterglow display params",
            size_of::<DisplayParams>() as u64,
            uniform,
        );
        let surfaces = SharedSurfaces::new(device);

        let fft_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("afterglow fft layout"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, false),
                uniform_entry(3),
            ],
        });
        let display_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("afterglow display layout"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, false),
                storage_entry(2, false),
                storage_entry(3, false),
                uniform_entry(4),
            ],
        });

        let fft_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("afterglow fft bindings"),
            layout: &fft_layout,
            entries: &[
                bind(0, &samples),
                bind(1, &window),
                bind(2, &spectra),
                bind(3, &fft_params),
            ],
        });
        let display_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("afterglow display bindings"),
            layout: &display_layout,
            entries: &[
                bind(0, &spectra),
                bind(1, &surfaces.waterfall),
                bind(2, &surfaces.histogram),
                bind(3, &surfaces.spectrum),
                bind(4, &display_params),
            ],
        });

        let fft_pipeline =
            build_kernel(&ctx, &fft_layout, &fft_module, "fft.wgsl", "fft_1024")?;
        let display_pipeline =
            build_kernel(&ctx, &display_layout, &display_module, "display.wgsl", "display")?;
        let clear_pipeline =
            build_kernel(&ctx, &display_layout, &display_module, "display.wgsl", "clear")?;

        debug!("[pipeline] wgpu kernels ready on {}", ctx.info.name);

        Ok(Self {
            fft_pipeline,
            display_pipeline,
            clear_pipeline,
            fft_bind_group,
            display_bind_group,
            _fft_module: fft_module,
            _display_module: display_module,
            surfaces,
            staging: None,
            samples,
            window,
            spectra,
            fft_params,
            display_params,
            staged_samples: 0,
            transformed: 0,
            sharing,
            ctx,
        })
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    fn dispatch(
        &self,
        stage: DeviceStage,
        label: &'static str,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        groups: u32,
    ) -> Result<(), DeviceError> {
        self.ctx
            .scoped(|| {
                let mut encoder = self
                    .ctx
                    .device
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
                {
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some(label),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(pipeline);
                    pass.set_bind_group(0, bind_group, &[]);
                    pass.dispatch_workgroups(groups, 1, 1);
                }
                self.ctx.queue.submit(Some(encoder.finish()));
            })
            .map_err(|msg| DeviceError::new(stage, msg))
    }
}

impl ComputeBackend for GpuBackend {
    fn name(&self) -> &str {
        &self.ctx.info.name
    }

    fn write_window(&mut self, coeffs: &[f32]) -> Result<(), DeviceError> {
        if coeffs.len() != FFT_LEN {
            return Err(DeviceError::new(
                DeviceStage::Upload,
                format!("window has {} coefficients, expected {FFT_LEN}", coeffs.len()),
            ));
        }
        self.ctx
            .scoped(|| {
                self.ctx
                    .queue
                    .write_buffer(&self.window, 0, bytemuck::cast_slice(coeffs))
            })
            .map_err(|msg| DeviceError::new(DeviceStage::Upload, msg))
    }

    fn write_samples(&mut self, samples: &[Complex32]) -> Result<(), DeviceError> {
        if samples.len() > FFT_LEN * MAX_BATCH {
            return Err(DeviceError::new(
                DeviceStage::Upload,
                format!("{} samples exceed the input buffer", samples.len()),
            ));
        }
        if !samples.is_empty() {
            self.ctx
                .scoped(|| {
                    self.ctx
                        .queue
                        .write_buffer(&self.samples, 0, bytemuck::cast_slice(samples))
                })
                .map_err(|msg| DeviceError::new(DeviceStage::Upload, msg))?;
        }
        self.staged_samples = samples.len();
        Ok(())
    }

    fn run_fft(&mut self, spectra: usize) -> Result<(), DeviceError> {
        if spectra > MAX_BATCH || spectra * FFT_LEN > self.staged_samples {
            return Err(DeviceError::new(
                DeviceStage::Fft,
                format!("{spectra} spectra requested, {} samples staged", self.staged_samples),
            ));
        }
        let params = FftParams {
            spectra: spectra as u32,
            _pad: [0; 3],
        };
        self.ctx
            .queue
            .write_buffer(&self.fft_params, 0, bytemuck::bytes_of(&params));
        self.dispatch(
            DeviceStage::Fft,
            "afterglow fft",
            &self.fft_pipeline,
            &self.fft_bind_group,
            spectra as u32,
        )?;
        self.transformed = spectra;
        Ok(())
    }

    fn run_display(&mut self, params: &DisplayParams) -> Result<(), DeviceError> {
        if params.spectra as usize > self.transformed {
            return Err(DeviceError::new(
                DeviceStage::Display,
                format!(
                    "{} spectra requested, {} transformed",
                    params.spectra, self.transformed
                ),
            ));
        }
        self.ctx
            .queue
            .write_buffer(&self.display_params, 0, bytemuck::bytes_of(params));
        self.dispatch(
            DeviceStage::Display,
            "afterglow display",
            &self.display_pipeline,
            &self.display_bind_group,
            (FFT_LEN as u32).div_ceil(WORKGROUP),
        )
    }

    fn clear_surfaces(&mut self) -> Result<(), DeviceError> {
        let cells = (FFT_LEN * WATERFALL_ROWS) as u32;
        self.dispatch(
            DeviceStage::Clear,
            "afterglow clear",
            &self.clear_pipeline,
            &self.display_bind_group,
            cells.div_ceil(WORKGROUP),
        )
    }

    fn read_back(&mut self, mirrors: &mut HostMirrors) -> Result<(), DeviceError> {
        let staging = self
            .staging
            .get_or_insert_with(|| Staging::new(&self.ctx.device));
        let pairs = [
            (&self.surfaces.waterfall, &staging.waterfall, WATERFALL_BYTES),
            (&self.surfaces.histogram, &staging.histogram, HISTOGRAM_BYTES),
            (&self.surfaces.spectrum, &staging.spectrum, SPECTRUM_BYTES),
        ];

        self.ctx
            .scoped(|| {
                let mut encoder =
                    self.ctx
                        .device
                        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                            label: Some("afterglow read-back"),
                        });
                for (src, dst, size) in pairs {
                    encoder.copy_buffer_to_buffer(src, 0, dst, 0, size);
                }
                self.ctx.queue.submit(Some(encoder.finish()));
            })
            .map_err(|msg| DeviceError::new(DeviceStage::ReadBack, msg))?;

        let (tx, rx) = mpsc::channel();
        for (index, (_, dst, _)) in pairs.iter().enumerate() {
            let tx = tx.clone();
            dst.slice(..)
                .map_async(wgpu::MapMode::Read, move |result| {
                    let _ = tx.send((index, result));
                });
        }
        drop(tx);
        for _ in 0..pairs.len() {
            let (index, result) = self.ctx.wait_for(&rx, DeviceStage::ReadBack)?;
            result.map_err(|err| {
                DeviceError::new(DeviceStage::ReadBack, format!("surface {index}: {err}"))
            })?;
        }

        let targets: [&mut Vec<f32>; 3] = [
            &mut mirrors.waterfall,
            &mut mirrors.histogram,
            &mut mirrors.spectrum,
        ];
        let mut outcome = Ok(());
        for ((_, dst, _), target) in pairs.iter().zip(targets) {
            {
                let view = dst.slice(..).get_mapped_range();
                match bytemuck::try_cast_slice::<u8, f32>(&view) {
                    Ok(values) if values.len() == target.len() => target.copy_from_slice(values),
                    Ok(values) => {
                        outcome = Err(DeviceError::new(
                            DeviceStage::ReadBack,
                            format!("mapped {} values into {}", values.len(), target.len()),
                        ));
                    }
                    Err(err) => {
                        outcome = Err(DeviceError::new(DeviceStage::ReadBack, err.to_string()));
                    }
                }
            }
            dst.unmap();
        }
        outcome
    }

    fn drain(&mut self) -> Result<(), DeviceError> {
        self.ctx.drain()
    }

    fn shared_surfaces(&self) -> Option<SharedSurfaces> {
        self.sharing.then(|| self.surfaces.clone())
    }
}

fn build_kernel(
    ctx: &GpuContext,
    layout: &wgpu::BindGroupLayout,
    module: &wgpu::ShaderModule,
    name: &str,
    entry_point: &'static str,
) -> Result<wgpu::ComputePipeline, EngineError> {
    ctx.scoped(|| {
        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(entry_point),
                bind_group_layouts: &[layout],
                push_constant_ranges: &[],
            });
        ctx.device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&pipeline_layout),
                module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            })
    })
    .map_err(|log| EngineError::ShaderBuild {
        name: format!("{name}:{entry_point}"),
        log,
    })
}

pub(crate) fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn bind(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}
