//! Vertex types, buffers and pipeline builders shared by the render passes.

use crate::backend::gpu::GpuContext;
use crate::error::EngineError;
use crate::util::resource::ResourceLoader;
use bytemuck::{Pod, Zeroable};
use iced_wgpu::wgpu;
use std::marker::PhantomData;
use std::mem::size_of;

/// Transforms pixel coordinates to clip space coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipTransform(f32, f32);

impl ClipTransform {
    pub fn new(w: f32, h: f32) -> Self {
        Self(2.0 / w.max(1.0), 2.0 / h.max(1.0))
    }

    #[inline]
    pub fn to_clip(self, x: f32, y: f32) -> [f32; 2] {
        [x * self.0 - 1.0, 1.0 - y * self.1]
    }

    /// Per-axis factors the shaders multiply pixel coordinates by.
    pub fn scale(self) -> [f32; 2] {
        [self.0, self.1]
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct SdfVertex {
    pub position: [f32; 2],
    pub color: [f32; 4],
    pub params: [f32; 4],
}

impl SdfVertex {
    pub const SOLID_PARAMS: [f32; 4] = [0.0, 0.0, 1000.0, 1.0];
    const ATTRIBUTES: [wgpu::VertexAttribute; 3] =
        wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x4, 2 => Float32x4];

    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: size_of::<Self>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBUTES,
        }
    }

    #[inline]
    pub fn solid(position: [f32; 2], color: [f32; 4]) -> Self {
        Self {
            position,
            color,
            params: Self::SOLID_PARAMS,
        }
    }
}

/// Vertex storage that grows to the largest frame seen so far.
#[derive(Debug)]
pub struct FrameVertices<V: Pod> {
    label: &'static str,
    buffer: wgpu::Buffer,
    len: u32,
    _vertex: PhantomData<V>,
}

impl<V: Pod> FrameVertices<V> {
    pub fn new(device: &wgpu::Device, label: &'static str, capacity: usize) -> Self {
        Self {
            label,
            buffer: Self::allocate(device, label, (capacity * size_of::<V>()) as u64),
            len: 0,
            _vertex: PhantomData,
        }
    }

    fn allocate(device: &wgpu::Device, label: &'static str, bytes: u64) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes.max(size_of::<V>() as u64),
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Replaces the contents with `vertices`, reallocating when they do not fit.
    pub fn upload(&mut self, gpu: &GpuContext, vertices: &[V]) {
        let bytes = std::mem::size_of_val(vertices) as u64;
        if bytes > self.buffer.size() {
            self.buffer = Self::allocate(&gpu.device, self.label, bytes.next_power_of_two());
        }
        if !vertices.is_empty() {
            gpu.queue
                .write_buffer(&self.buffer, 0, bytemuck::cast_slice(vertices));
        }
        self.len = vertices.len() as u32;
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The part of the buffer written by the last upload.
    pub fn slice(&self) -> wgpu::BufferSlice<'_> {
        self.buffer
            .slice(..u64::from(self.len) * size_of::<V>() as u64)
    }
}

pub fn buffer_entry(
    binding: u32,
    visibility: wgpu::ShaderStages,
    ty: wgpu::BufferBindingType,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Describes a render pipeline over one shader module, without building it.
pub struct PipelineDesc<'a> {
    pub label: &'static str,
    pub module: &'a wgpu::ShaderModule,
    pub layouts: &'a [&'a wgpu::BindGroupLayout],
    pub buffers: &'a [wgpu::VertexBufferLayout<'static>],
    pub topology: wgpu::PrimitiveTopology,
}

/// Builds `desc` inside an error scope; the error carries the validation log.
pub fn create_render_pipeline(
    gpu: &GpuContext,
    format: wgpu::TextureFormat,
    desc: PipelineDesc<'_>,
) -> Result<wgpu::RenderPipeline, EngineError> {
    gpu.scoped(|| {
        let device = &gpu.device;
        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(desc.label),
            layout: Some(
                &device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(desc.label),
                    bind_group_layouts: desc.layouts,
                    push_constant_ranges: &[],
                }),
            ),
            vertex: wgpu::VertexState {
                module: desc.module,
                entry_point: Some("vs_main"),
                buffers: desc.buffers,
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: desc.module,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: desc.topology,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: Default::default(),
            multiview: None,
            cache: None,
        })
    })
    .map_err(|log| EngineError::ShaderBuild {
        name: desc.label.to_string(),
        log,
    })
}

/// Creates the triangle-list pipeline for `sdf.wgsl`.
pub fn create_sdf_pipeline(
    gpu: &GpuContext,
    format: wgpu::TextureFormat,
    resources: &ResourceLoader,
) -> Result<wgpu::RenderPipeline, EngineError> {
    let module = gpu.shader_module(resources, "sdf.wgsl")?;
    create_render_pipeline(
        gpu,
        format,
        PipelineDesc {
            label: "afterglow sdf",
            module: &module,
            layouts: &[],
            buffers: &[SdfVertex::layout()],
            topology: wgpu::PrimitiveTopology::TriangleList,
        },
    )
}

/// Six vertices forming a solid quad.
#[inline]
pub fn quad_vertices(
    x0: f32,
    y0: f32,
    x1: f32,
    y1: f32,
    clip: ClipTransform,
    color: [f32; 4],
) -> [SdfVertex; 6] {
    gradient_quad_vertices(x0, y0, x1, y1, clip, color, color)
}

/// Quad with per-edge colors for vertical gradients.
#[inline]
pub fn gradient_quad_vertices(
    x0: f32,
    y0: f32,
    x1: f32,
    y1: f32,
    clip: ClipTransform,
    top: [f32; 4],
    bot: [f32; 4],
) -> [SdfVertex; 6] {
    let (tl, tr, bl, br) = (
        clip.to_clip(x0, y0),
        clip.to_clip(x1, y0),
        clip.to_clip(x0, y1),
        clip.to_clip(x1, y1),
    );
    [
        SdfVertex::solid(tl, top),
        SdfVertex::solid(bl, bot),
        SdfVertex::solid(br, bot),
        SdfVertex::solid(tl, top),
        SdfVertex::solid(br, bot),
        SdfVertex::solid(tr, top),
    ]
}

/// Six vertices forming an antialiased line segment.
#[inline]
pub fn line_vertices(
    p0: (f32, f32),
    p1: (f32, f32),
    color: [f32; 4],
    width: f32,
    feather: f32,
    clip: ClipTransform,
) -> [SdfVertex; 6] {
    let (dx, dy) = (p1.0 - p0.0, p1.1 - p0.1);
    let inv = (dx * dx + dy * dy).sqrt().max(1e-6).recip();
    let (half, outer) = (width * 0.5, width + feather);
    let (ox, oy) = (-dy * inv * outer, dx * inv * outer);
    let v = |px, py, d| SdfVertex {
        position: clip.to_clip(px, py),
        color,
        params: [d, 0.0, half, feather],
    };
    [
        v(p0.0 - ox, p0.1 - oy, -outer),
        v(p0.0 + ox, p0.1 + oy, outer),
        v(p1.0 - ox, p1.1 - oy, -outer),
        v(p0.0 + ox, p0.1 + oy, outer),
        v(p1.0 + ox, p1.1 + oy, outer),
        v(p1.0 - ox, p1.1 - oy, -outer),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_transform_maps_corners() {
        let clip = ClipTransform::new(200.0, 100.0);
        assert_eq!(clip.to_clip(0.0, 0.0), [-1.0, 1.0]);
        assert_eq!(clip.to_clip(200.0, 100.0), [1.0, -1.0]);
        assert_eq!(clip.to_clip(100.0, 50.0), [0.0, 0.0]);
        assert_eq!(ClipTransform::new(0.0, 0.0).scale(), [2.0, 2.0]);
    }

    #[test]
    fn vertex_layout_matches_struct() {
        assert_eq!(size_of::<SdfVertex>(), 40);
        let layout = SdfVertex::layout();
        assert_eq!(layout.array_stride, 40);
        let offsets: Vec<_> = layout.attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, [0, 8, 24]);
    }

    #[test]
    fn gradient_quad_colours_edges() {
        let clip = ClipTransform::new(10.0, 10.0);
        let top = [1.0, 0.0, 0.0, 1.0];
        let bot = [0.0, 0.0, 1.0, 1.0];
        let quad = gradient_quad_vertices(0.0, 0.0, 10.0, 10.0, clip, top, bot);
        for v in quad {
            let expected = if v.position[1] > 0.0 { top } else { bot };
            assert_eq!(v.color, expected);
        }
    }

    #[test]
    fn horizontal_line_is_offset_vertically() {
        let clip = ClipTransform::new(100.0, 100.0);
        let verts = line_vertices((10.0, 50.0), (90.0, 50.0), [1.0; 4], 1.0, 0.5, clip);
        let ys: Vec<f32> = verts.iter().map(|v| v.position[1]).collect();
        assert!(ys.iter().all(|y| (y.abs() - 0.03).abs() < 1e-5));
        assert!(verts.iter().all(|v| v.params[2] == 0.5 && v.params[3] == 0.5));
    }
}
