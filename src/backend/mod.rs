//! Graphics stack helpers
//!
//! Collection of common traits and implementations around the buffers clients share
//! with the compositor and the hardware consuming them:
//!
//! - [`allocator`] describes dmabuf buffer objects and the catalog of importable formats
//! - [`renderer`] realizes dmabufs as textures through a [`GpuContext`](renderer::GpuContext)
//! - [`drm`] tries to hand dmabufs directly to the display controller

pub mod allocator;
pub mod drm;
pub mod renderer;
