//! Render geometry, draw-list composition and wgpu execution.

pub mod axis;
pub mod channels;
pub mod cmap;
pub mod common;
pub mod compositor;
pub mod geometry;
pub mod gpu;
pub mod options;

pub use compositor::{DrawList, compose};
pub use geometry::RenderDescriptor;
pub use gpu::GpuRenderer;
pub use options::{Channel, Layers, RenderOptions};
