//! Executes composed draw lists with wgpu.
//!
//! Each frame is planned first ([`plan`]) into SDF vertices, colour-map and
//! spectrum draws and text labels; [`GpuRenderer::draw`] then uploads the
//! plan and records one render pass. Labels go to the text painter after
//! the pass so they land on top.

use super::cmap;
use super::common::{
    ClipTransform, FrameVertices, PipelineDesc, SdfVertex, buffer_entry, create_render_pipeline,
    create_sdf_pipeline, gradient_quad_vertices, line_vertices, quad_vertices,
};
use super::compositor::{DrawCommand, DrawList, Label, Rect, SpectrumStrip, SurfaceKind, SurfaceQuad};
use crate::backend::gpu::{GpuContext, SharedSurfaces, bind};
use crate::backend::{FFT_LEN, HISTOGRAM_ROWS, HostMirrors, SPECTRUM_LEN, WATERFALL_ROWS};
use crate::error::{DeviceError, DeviceStage, EngineError};
use crate::surface::TextPainter;
use crate::util::resource::ResourceLoader;
use bytemuck::{Pod, Zeroable};
use iced_wgpu::wgpu;
use std::mem::size_of;
use std::ops::Range;
use tracing::{debug, info, warn};

const LEGEND_STEPS: usize = 32;
const LINE_WIDTH: f32 = 1.0;
const LINE_FEATHER: f32 = 0.5;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SurfaceUniforms {
    /// Top-left and bottom-right corners in clip space.
    pub rect: [f32; 4],
    /// `(u0, v_top, u1, v_bottom)`.
    pub uv: [f32; 4],
    pub scale: f32,
    pub offset: f32,
    pub rows: u32,
    pub wrap: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct StripUniforms {
    pub transform: [f32; 4],
    pub color: [f32; 4],
    pub clip_scale: [f32; 2],
    _pad: [f32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMapFilter {
    Bicubic,
    Bilinear,
}

/// CPU copies of the colour tables, for the legend bars.
#[derive(Debug, Clone, PartialEq)]
pub struct Palettes {
    pub waterfall: Vec<[f32; 4]>,
    pub histogram: Vec<[f32; 4]>,
}

impl Default for Palettes {
    fn default() -> Self {
        Self {
            waterfall: cmap::waterfall_palette(),
            histogram: cmap::histogram_palette(),
        }
    }
}

impl Palettes {
    fn get(&self, kind: SurfaceKind) -> &[[f32; 4]] {
        match kind {
            SurfaceKind::Waterfall => &self.waterfall,
            SurfaceKind::Histogram => &self.histogram,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Sdf(Range<u32>),
    Surface {
        kind: SurfaceKind,
        uniforms: SurfaceUniforms,
    },
    Strip {
        uniforms: StripUniforms,
        points: Range<u32>,
        /// `x, y, width, height` in target pixels.
        scissor: [u32; 4],
    },
}

/// One frame ready for upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FramePlan {
    pub vertices: Vec<SdfVertex>,
    pub ops: Vec<Op>,
    pub labels: Vec<Label>,
}

impl FramePlan {
    fn push_sdf(&mut self, vertices: &[SdfVertex]) {
        let start = self.vertices.len() as u32;
        self.vertices.extend_from_slice(vertices);
        let end = self.vertices.len() as u32;
        match self.ops.last_mut() {
            Some(Op::Sdf(range)) if range.end == start => range.end = end,
            _ => self.ops.push(Op::Sdf(start..end)),
        }
    }
}

/// Turns draw lists into vertices and draws for a `size` pixel target.
pub fn plan(lists: &[DrawList], size: (u32, u32), palettes: &Palettes) -> FramePlan {
    let (width, height) = (size.0.max(1), size.1.max(1));
    let clip = ClipTransform::new(width as f32, height as f32);
    let mut frame = FramePlan::default();

    for command in lists.iter().flat_map(DrawList::iter) {
        match command {
            DrawCommand::Fill { rect, color } => {
                frame.push_sdf(&quad_vertices(rect.x0, rect.y0, rect.x1, rect.y1, clip, *color));
            }
            DrawCommand::Line { from, to, color } => {
                frame.push_sdf(&line_vertices(
                    (from[0], from[1]),
                    (to[0], to[1]),
                    *color,
                    LINE_WIDTH,
                    LINE_FEATHER,
                    clip,
                ));
            }
            DrawCommand::ColorScale { kind, rect } => {
                frame.push_sdf(&legend_vertices(*rect, palettes.get(*kind), clip));
            }
            DrawCommand::Surface(quad) => frame.ops.push(Op::Surface {
                kind: quad.kind,
                uniforms: surface_uniforms(quad, clip),
            }),
            DrawCommand::Spectrum(strip) => {
                if let Some(scissor) = scissor(strip.clip, width, height) {
                    frame.ops.push(strip_op(strip, clip, scissor));
                }
            }
            DrawCommand::Text(label) => frame.labels.push(label.clone()),
        }
    }
    frame
}

fn legend_vertices(rect: Rect, palette: &[[f32; 4]], clip: ClipTransform) -> Vec<SdfVertex> {
    let height = rect.height();
    (0..LEGEND_STEPS)
        .flat_map(|k| {
            let t0 = k as f32 / LEGEND_STEPS as f32;
            let t1 = (k + 1) as f32 / LEGEND_STEPS as f32;
            gradient_quad_vertices(
                rect.x0,
                rect.y1 - t1 * height,
                rect.x1,
                rect.y1 - t0 * height,
                clip,
                cmap::lookup(palette, t1),
                cmap::lookup(palette, t0),
            )
        })
        .collect()
}

fn surface_uniforms(quad: &SurfaceQuad, clip: ClipTransform) -> SurfaceUniforms {
    let [x0, y0] = clip.to_clip(quad.rect.x0, quad.rect.y0);
    let [x1, y1] = clip.to_clip(quad.rect.x1, quad.rect.y1);
    let (rows, wrap) = match quad.kind {
        SurfaceKind::Waterfall => (WATERFALL_ROWS as u32, 1),
        SurfaceKind::Histogram => (HISTOGRAM_ROWS as u32, 0),
    };
    SurfaceUniforms {
        rect: [x0, y0, x1, y1],
        uv: [quad.u[0], quad.v[0], quad.u[1], quad.v[1]],
        scale: quad.scale,
        offset: quad.offset,
        rows,
        wrap,
    }
}

fn strip_op(strip: &SpectrumStrip, clip: ClipTransform, scissor: [u32; 4]) -> Op {
    Op::Strip {
        uniforms: StripUniforms {
            transform: strip.transform,
            color: strip.color,
            clip_scale: clip.scale(),
            _pad: [0.0; 2],
        },
        points: strip.first..strip.first + strip.count,
        scissor,
    }
}

/// Pixel rectangle of `rect` inside the target, `None` when empty.
fn scissor(rect: Rect, width: u32, height: u32) -> Option<[u32; 4]> {
    let x0 = rect.x0.floor().clamp(0.0, width as f32) as u32;
    let y0 = rect.y0.floor().clamp(0.0, height as f32) as u32;
    let x1 = rect.x1.ceil().clamp(0.0, width as f32) as u32;
    let y1 = rect.y1.ceil().clamp(0.0, height as f32) as u32;
    (x1 > x0 && y1 > y0).then(|| [x0, y0, x1 - x0, y1 - y0])
}

struct Slot {
    params: wgpu::Buffer,
    group: wgpu::BindGroup,
}

/// Uniform buffers and bind groups for one binding set, reused across frames.
///
/// `inputs` are bound at 0.. and the uniform right after them.
struct SlotPool {
    label: &'static str,
    size: u64,
    inputs: Vec<wgpu::Buffer>,
    slots: Vec<Slot>,
    used: usize,
}

impl SlotPool {
    fn new(label: &'static str, size: usize, inputs: Vec<wgpu::Buffer>) -> Self {
        Self {
            label,
            size: size as u64,
            inputs,
            slots: Vec::new(),
            used: 0,
        }
    }

    fn reset(&mut self) {
        self.used = 0;
    }

    fn write(&mut self, gpu: &GpuContext, layout: &wgpu::BindGroupLayout, bytes: &[u8]) -> usize {
        if self.used == self.slots.len() {
            let params = gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(self.label),
                size: self.size,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut entries: Vec<_> = self
                .inputs
                .iter()
                .enumerate()
                .map(|(binding, buffer)| bind(binding as u32, buffer))
                .collect();
            entries.push(bind(self.inputs.len() as u32, &params));
            let group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(self.label),
                layout,
                entries: &entries,
            });
            self.slots.push(Slot { params, group });
        }
        let index = self.used;
        gpu.queue.write_buffer(&self.slots[index].params, 0, bytes);
        self.used += 1;
        index
    }

    fn group(&self, index: usize) -> &wgpu::BindGroup {
        &self.slots[index].group
    }
}

/// Draws composed frames into a target texture.
///
/// Binds the engine's result buffers directly when built with shared
/// surfaces; otherwise owns copies that [`GpuRenderer::upload`] refreshes
/// from the host mirrors.
pub struct GpuRenderer {
    sdf_pipeline: wgpu::RenderPipeline,
    strip_pipeline: wgpu::RenderPipeline,
    cmap_pipeline: wgpu::RenderPipeline,
    surface_layout: wgpu::BindGroupLayout,
    strip_layout: wgpu::BindGroupLayout,
    waterfall_slots: SlotPool,
    histogram_slots: SlotPool,
    strip_slots: SlotPool,
    vertices: FrameVertices<SdfVertex>,
    surfaces: SharedSurfaces,
    mirrored: bool,
    palettes: Palettes,
    filter: ColorMapFilter,
    format: wgpu::TextureFormat,
}

impl GpuRenderer {
    pub fn new(
        gpu: &GpuContext,
        format: wgpu::TextureFormat,
        resources: &ResourceLoader,
        shared: Option<&SharedSurfaces>,
    ) -> Result<Self, EngineError> {
        let device = &gpu.device;
        let (surfaces, mirrored) = match shared {
            Some(surfaces) => (surfaces.clone(), false),
            None => (mirror_buffers(device), true),
        };

        let palettes = Palettes::default();
        let palette_buffer = |label, colors: &[[f32; 4]]| {
            let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: (colors.len() * size_of::<[f32; 4]>()) as u64,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            gpu.queue
                .write_buffer(&buffer, 0, bytemuck::cast_slice(colors));
            buffer
        };
        let waterfall_palette = palette_buffer("afterglow waterfall palette", &palettes.waterfall);
        let histogram_palette = palette_buffer("afterglow histogram palette", &palettes.histogram);

        let read_only = wgpu::BufferBindingType::Storage { read_only: true };
        let surface_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("afterglow cmap layout"),
            entries: &[
                buffer_entry(0, wgpu::ShaderStages::FRAGMENT, read_only),
                buffer_entry(1, wgpu::ShaderStages::FRAGMENT, read_only),
                buffer_entry(
                    2,
                    wgpu::ShaderStages::VERTEX_FRAGMENT,
                    wgpu::BufferBindingType::Uniform,
                ),
            ],
        });
        let strip_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("afterglow spectrum layout"),
            entries: &[
                buffer_entry(0, wgpu::ShaderStages::VERTEX, read_only),
                buffer_entry(
                    1,
                    wgpu::ShaderStages::VERTEX_FRAGMENT,
                    wgpu::BufferBindingType::Uniform,
                ),
            ],
        });

        let sdf_pipeline = create_sdf_pipeline(gpu, format, resources)?;
        let strip_module = gpu.shader_module(resources, "spectrum.wgsl")?;
        let strip_pipeline = create_render_pipeline(
            gpu,
            format,
            PipelineDesc {
                label: "afterglow spectrum",
                module: &strip_module,
                layouts: &[&strip_layout],
                buffers: &[],
                topology: wgpu::PrimitiveTopology::LineStrip,
            },
        )?;
        let (cmap_pipeline, filter) = build_cmap_pipeline(gpu, format, resources, &surface_layout)?;

        info!(
            "[render] renderer ready ({}, {filter:?} colour map)",
            if mirrored { "mirrored" } else { "shared" }
        );

        Ok(Self {
            sdf_pipeline,
            strip_pipeline,
            cmap_pipeline,
            waterfall_slots: SlotPool::new(
                "afterglow waterfall quad",
                size_of::<SurfaceUniforms>(),
                vec![surfaces.waterfall.clone(), waterfall_palette],
            ),
            histogram_slots: SlotPool::new(
                "afterglow histogram quad",
                size_of::<SurfaceUniforms>(),
                vec![surfaces.histogram.clone(), histogram_palette],
            ),
            strip_slots: SlotPool::new(
                "afterglow spectrum strip",
                size_of::<StripUniforms>(),
                vec![surfaces.spectrum.clone()],
            ),
            surface_layout,
            strip_layout,
            vertices: FrameVertices::new(device, "afterglow sdf vertices", 4096),
            surfaces,
            mirrored,
            palettes,
            filter,
            format,
        })
    }

    pub fn filter(&self) -> ColorMapFilter {
        self.filter
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    /// Whether the renderer owns surface copies that need [`GpuRenderer::upload`].
    pub fn mirrored(&self) -> bool {
        self.mirrored
    }

    /// Copies refreshed host mirrors into the renderer's own surface buffers.
    pub fn upload(&mut self, gpu: &GpuContext, mirrors: &HostMirrors) -> Result<(), DeviceError> {
        if !self.mirrored {
            return Ok(());
        }
        gpu.scoped(|| {
            let queue = &gpu.queue;
            queue.write_buffer(
                &self.surfaces.waterfall,
                0,
                bytemuck::cast_slice(&mirrors.waterfall),
            );
            queue.write_buffer(
                &self.surfaces.histogram,
                0,
                bytemuck::cast_slice(&mirrors.histogram),
            );
            queue.write_buffer(
                &self.surfaces.spectrum,
                0,
                bytemuck::cast_slice(&mirrors.spectrum),
            );
        })
        .map_err(|msg| DeviceError::new(DeviceStage::Upload, msg))
    }

    pub fn draw(
        &mut self,
        gpu: &GpuContext,
        lists: &[DrawList],
        target: &wgpu::TextureView,
        size: (u32, u32),
        painter: Option<&mut dyn TextPainter>,
    ) -> Result<(), DeviceError> {
        let frame = plan(lists, size, &self.palettes);
        let (width, height) = (size.0.max(1), size.1.max(1));

        self.vertices.upload(gpu, &frame.vertices);

        self.waterfall_slots.reset();
        self.histogram_slots.reset();
        self.strip_slots.reset();
        let slots: Vec<usize> = frame
            .ops
            .iter()
            .map(|op| match op {
                Op::Sdf(_) => 0,
                Op::Surface { kind, uniforms } => {
                    let pool = match kind {
                        SurfaceKind::Waterfall => &mut self.waterfall_slots,
                        SurfaceKind::Histogram => &mut self.histogram_slots,
                    };
                    pool.write(gpu, &self.surface_layout, bytemuck::bytes_of(uniforms))
                }
                Op::Strip { uniforms, .. } => {
                    self.strip_slots
                        .write(gpu, &self.strip_layout, bytemuck::bytes_of(uniforms))
                }
            })
            .collect();

        gpu.scoped(|| {
            let mut encoder = gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("afterglow frame"),
                });
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("afterglow frame"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: target,
                        resolve_target: None,
                        depth_slice: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                for (op, slot) in frame.ops.iter().zip(&slots) {
                    match op {
                        Op::Sdf(range) => {
                            pass.set_pipeline(&self.sdf_pipeline);
                            pass.set_vertex_buffer(0, self.vertices.slice());
                            pass.draw(range.clone(), 0..1);
                        }
                        Op::Surface { kind, .. } => {
                            let pool = match kind {
                                SurfaceKind::Waterfall => &self.waterfall_slots,
                                SurfaceKind::Histogram => &self.histogram_slots,
                            };
                            pass.set_pipeline(&self.cmap_pipeline);
                            pass.set_bind_group(0, pool.group(*slot), &[]);
                            pass.draw(0..6, 0..1);
                        }
                        Op::Strip {
                            points, scissor, ..
                        } => {
                            let [x, y, w, h] = *scissor;
                            pass.set_scissor_rect(x, y, w, h);
                            pass.set_pipeline(&self.strip_pipeline);
                            pass.set_bind_group(0, self.strip_slots.group(*slot), &[]);
                            pass.draw(points.clone(), 0..1);
                            pass.set_scissor_rect(0, 0, width, height);
                        }
                    }
                }
            }
            if let Some(painter) = painter
                && !frame.labels.is_empty()
            {
                painter.paint(gpu, &mut encoder, target, (width, height), &frame.labels);
            }
            gpu.queue.submit(Some(encoder.finish()));
        })
        .map_err(|msg| DeviceError::new(DeviceStage::Render, msg))
    }
}

fn mirror_buffers(device: &wgpu::Device) -> SharedSurfaces {
    let make = |label, len: usize| {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (len * size_of::<f32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    };
    SharedSurfaces {
        waterfall: make("afterglow waterfall mirror", FFT_LEN * WATERFALL_ROWS),
        histogram: make("afterglow histogram mirror", FFT_LEN * HISTOGRAM_ROWS),
        spectrum: make("afterglow spectrum mirror", SPECTRUM_LEN),
    }
}

/// Bicubic when it builds, bilinear otherwise.
fn build_cmap_pipeline(
    gpu: &GpuContext,
    format: wgpu::TextureFormat,
    resources: &ResourceLoader,
    layout: &wgpu::BindGroupLayout,
) -> Result<(wgpu::RenderPipeline, ColorMapFilter), EngineError> {
    let build = |name: &str, label: &'static str| -> Result<wgpu::RenderPipeline, EngineError> {
        let module = gpu.shader_module(resources, name)?;
        create_render_pipeline(
            gpu,
            format,
            PipelineDesc {
                label,
                module: &module,
                layouts: &[layout],
                buffers: &[],
                topology: wgpu::PrimitiveTopology::TriangleList,
            },
        )
    };
    match build("cmap_bicubic.wgsl", "afterglow cmap bicubic") {
        Ok(pipeline) => Ok((pipeline, ColorMapFilter::Bicubic)),
        Err(err) => {
            warn!("[render] bicubic colour map unavailable, using bilinear: {err}");
            let pipeline = build("cmap_simple.wgsl", "afterglow cmap bilinear")?;
            debug!("[render] bilinear colour map built");
            Ok((pipeline, ColorMapFilter::Bilinear))
        }
    }
}
