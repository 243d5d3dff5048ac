//! Drawing-surface and text collaborators the worker draws through.
//!
//! A windowing toolkit plugs in by implementing [`GraphicsSurface`]; labels
//! are measured by a [`TextMetrics`] and, when a [`TextPainter`] is supplied,
//! drawn by it after the rest of the frame.

use crate::action::UiAction;
use crate::backend::gpu::GpuContext;
use crate::error::{DeviceError, DeviceStage, EngineError};
use crate::render::compositor::Label;
use iced_wgpu::wgpu;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use tracing::debug;

pub const DEFAULT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SurfaceEvent {
    Resized { width: u32, height: u32 },
    Action(UiAction),
    Close,
}

pub trait GraphicsSurface: Send {
    /// Prepares the surface for drawing on `gpu`, when there is one.
    fn acquire(&mut self, gpu: Option<&GpuContext>) -> Result<(), EngineError>;

    fn size(&self) -> (u32, u32);

    fn format(&self) -> wgpu::TextureFormat {
        DEFAULT_FORMAT
    }

    /// View to draw the next frame into. `None` skips GPU drawing.
    fn target(&mut self, gpu: Option<&GpuContext>) -> Option<wgpu::TextureView>;

    fn present(&mut self);

    fn pump_events(&mut self) -> Vec<SurfaceEvent>;

    fn notify_resized(&mut self, width: u32, height: u32);

    fn release(&mut self);
}

pub trait TextMetrics {
    fn width(&self, text: &str) -> f32;
    fn line_height(&self) -> f32;
}

/// Draws labels on top of a finished frame.
pub trait TextPainter: TextMetrics + Send {
    fn paint(
        &mut self,
        gpu: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::TextureView,
        size: (u32, u32),
        labels: &[Label],
    );
}

/// Fixed-advance metrics, used when no text painter is attached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonospaceMetrics {
    pub advance: f32,
    pub line_height: f32,
}

impl Default for MonospaceMetrics {
    fn default() -> Self {
        Self {
            advance: 7.0,
            line_height: 12.0,
        }
    }
}

impl TextMetrics for MonospaceMetrics {
    fn width(&self, text: &str) -> f32 {
        text.chars().count() as f32 * self.advance
    }

    fn line_height(&self) -> f32 {
        self.line_height
    }
}

#[derive(Debug, Default)]
struct HeadlessShared {
    events: Mutex<VecDeque<SurfaceEvent>>,
    frames: AtomicU64,
}

/// A surface with no pixels: frames are composed and counted, never drawn.
#[derive(Debug)]
pub struct HeadlessSurface {
    width: u32,
    height: u32,
    shared: Arc<HeadlessShared>,
}

/// Feeds events into a [`HeadlessSurface`] from another thread.
#[derive(Debug, Clone)]
pub struct SurfaceHandle {
    shared: Arc<HeadlessShared>,
}

impl HeadlessSurface {
    pub fn new(width: u32, height: u32) -> (Self, SurfaceHandle) {
        let shared = Arc::new(HeadlessShared::default());
        let handle = SurfaceHandle {
            shared: Arc::clone(&shared),
        };
        (
            Self {
                width,
                height,
                shared,
            },
            handle,
        )
    }
}

impl SurfaceHandle {
    pub fn send(&self, event: SurfaceEvent) {
        self.shared.events.lock().push_back(event);
    }

    pub fn frames(&self) -> u64 {
        self.shared.frames.load(Ordering::Acquire)
    }
}

impl GraphicsSurface for HeadlessSurface {
    fn acquire(&mut self, _gpu: Option<&GpuContext>) -> Result<(), EngineError> {
        Ok(())
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn target(&mut self, _gpu: Option<&GpuContext>) -> Option<wgpu::TextureView> {
        None
    }

    fn present(&mut self) {
        self.shared.frames.fetch_add(1, Ordering::AcqRel);
    }

    fn pump_events(&mut self) -> Vec<SurfaceEvent> {
        let events: Vec<_> = self.shared.events.lock().drain(..).collect();
        for event in &events {
            if let SurfaceEvent::Resized { width, height } = *event {
                self.width = width;
                self.height = height;
            }
        }
        events
    }

    fn notify_resized(&mut self, width: u32, height: u32) {
        self.shared
            .events
            .lock()
            .push_back(SurfaceEvent::Resized { width, height });
    }

    fn release(&mut self) {}
}

/// Renders into a texture that can be read back, for snapshots and tests.
#[derive(Debug)]
pub struct OffscreenSurface {
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
    texture: Option<wgpu::Texture>,
    stale: bool,
    frames: u64,
    events: VecDeque<SurfaceEvent>,
}

impl OffscreenSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            format: DEFAULT_FORMAT,
            texture: None,
            stale: true,
            frames: 0,
            events: VecDeque::new(),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn push_event(&mut self, event: SurfaceEvent) {
        self.events.push_back(event);
    }

    fn ensure_texture(&mut self, gpu: &GpuContext) {
        if self.texture.is_some() && !self.stale {
            return;
        }
        self.texture = Some(gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("afterglow offscreen target"),
            size: wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        }));
        self.stale = false;
        debug!("[render] offscreen target {}x{}", self.width, self.height);
    }

    /// Copies the last frame out as tightly packed RGBA rows.
    pub fn read_pixels(&self, gpu: &GpuContext) -> Result<Vec<u8>, DeviceError> {
        let texture = self
            .texture
            .as_ref()
            .ok_or_else(|| DeviceError::new(DeviceStage::ReadBack, "no frame has been drawn"))?;
        let row = self.width * 4;
        let padded = row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("afterglow offscreen read-back"),
            size: u64::from(padded) * u64::from(self.height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        gpu.scoped(|| {
            let mut encoder = gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("afterglow offscreen read-back"),
                });
            encoder.copy_texture_to_buffer(
                wgpu::TexelCopyTextureInfo {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::TexelCopyBufferInfo {
                    buffer: &staging,
                    layout: wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(padded),
                        rows_per_image: Some(self.height),
                    },
                },
                wgpu::Extent3d {
                    width: self.width,
                    height: self.height,
                    depth_or_array_layers: 1,
                },
            );
            gpu.queue.submit(Some(encoder.finish()));
        })
        .map_err(|msg| DeviceError::new(DeviceStage::ReadBack, msg))?;

        let (tx, rx) = mpsc::channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        gpu.wait_for(&rx, DeviceStage::ReadBack)?
            .map_err(|err| DeviceError::new(DeviceStage::ReadBack, err.to_string()))?;

        let mut pixels = Vec::with_capacity((row * self.height) as usize);
        {
            let view = staging.slice(..).get_mapped_range();
            for chunk in view.chunks(padded as usize) {
                pixels.extend_from_slice(&chunk[..row as usize]);
            }
        }
        staging.unmap();
        Ok(pixels)
    }
}

impl GraphicsSurface for OffscreenSurface {
    fn acquire(&mut self, gpu: Option<&GpuContext>) -> Result<(), EngineError> {
        let gpu = gpu.ok_or_else(|| {
            EngineError::Initialization("offscreen surface needs a GPU context".into())
        })?;
        self.ensure_texture(gpu);
        Ok(())
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    fn target(&mut self, gpu: Option<&GpuContext>) -> Option<wgpu::TextureView> {
        self.ensure_texture(gpu?);
        self.texture
            .as_ref()
            .map(|texture| texture.create_view(&wgpu::TextureViewDescriptor::default()))
    }

    fn present(&mut self) {
        self.frames += 1;
    }

    fn pump_events(&mut self) -> Vec<SurfaceEvent> {
        self.events.drain(..).collect()
    }

    fn notify_resized(&mut self, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) != (self.width, self.height) {
            self.width = width;
            self.height = height;
            self.stale = true;
        }
        self.events
            .push_back(SurfaceEvent::Resized { width, height });
    }

    fn release(&mut self) {
        self.texture = None;
        self.stale = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monospace_width_counts_characters() {
        let metrics = MonospaceMetrics::default();
        assert_eq!(metrics.width(""), 0.0);
        assert_eq!(metrics.width("-10"), 21.0);
        assert_eq!(metrics.width("12.5 µs"), 49.0);
    }

    #[test]
    fn headless_surface_counts_frames_and_forwards_events() {
        let (mut surface, handle) = HeadlessSurface::new(640, 480);
        surface.acquire(None).unwrap();
        assert!(surface.target(None).is_none());
        surface.present();
        surface.present();
        assert_eq!(handle.frames(), 2);

        handle.send(SurfaceEvent::Action(UiAction::FreezeToggle));
        surface.notify_resized(800, 600);
        let events = surface.pump_events();
        assert_eq!(
            events,
            [
                SurfaceEvent::Action(UiAction::FreezeToggle),
                SurfaceEvent::Resized {
                    width: 800,
                    height: 600
                }
            ]
        );
        assert_eq!(surface.size(), (800, 600));
        assert!(surface.pump_events().is_empty());
    }

    #[test]
    fn offscreen_surface_requires_a_gpu() {
        let mut surface = OffscreenSurface::new(0, 0);
        assert_eq!(surface.size(), (1, 1));
        assert!(matches!(
            surface.acquire(None),
            Err(EngineError::Initialization(_))
        ));
        assert!(surface.target(None).is_none());
        surface.notify_resized(320, 200);
        assert_eq!(surface.size(), (320, 200));
        assert_eq!(surface.pump_events().len(), 1);
    }

    #[test]
    fn offscreen_surface_queues_pushed_events() {
        let mut surface = OffscreenSurface::new(64, 32);
        surface.push_event(SurfaceEvent::Action(UiAction::FreezeToggle));
        surface.notify_resized(64, 32);
        let events = surface.pump_events();
        assert_eq!(
            events,
            vec![
                SurfaceEvent::Action(UiAction::FreezeToggle),
                SurfaceEvent::Resized {
                    width: 64,
                    height: 32
                },
            ]
        );
        assert!(surface.pump_events().is_empty());
    }

    #[test]
    fn offscreen_surface_reads_back_a_cleared_frame() {
        let Ok(gpu) = GpuContext::open_default() else {
            return;
        };
        let mut surface = OffscreenSurface::new(70, 3);
        assert_eq!(
            surface.read_pixels(&gpu).unwrap_err().stage,
            DeviceStage::ReadBack
        );

        surface.acquire(Some(&gpu)).unwrap();
        let view = surface.target(Some(&gpu)).unwrap();
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: None,
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &view,
                resolve_target: None,
                depth_slice: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::RED),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        gpu.queue.submit(Some(encoder.finish()));
        surface.present();

        // 70 px rows are padded on the device side and must come back tight
        let pixels = surface.read_pixels(&gpu).unwrap();
        assert_eq!(pixels.len(), 70 * 3 * 4);
        assert!(pixels.chunks(4).all(|px| px == [255, 0, 0, 255]));
        assert_eq!(surface.frames(), 1);
    }
}
