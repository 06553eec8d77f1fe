//! Buffer description and format management.
//!
//! Collection of common types around the buffers clients submit and the
//! formats the compositor is able to consume.
//!
//! - [`Dmabuf`](dmabuf::Dmabuf) describes a client submitted, multi-planar dmabuf
//! - [`FormatCatalog`](catalog::FormatCatalog) holds the formats and modifiers the GPU can import
//! - [`format`] provides lookups into the closed table of known pixel formats

pub mod catalog;
pub mod dmabuf;
pub mod format;

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, DrmVendor as Vendor,
    UnrecognizedFourcc, UnrecognizedVendor,
};

/// Common trait describing common properties of most types of buffers.
pub trait Buffer {
    /// Width of the two-dimensional buffer
    fn width(&self) -> u32;
    /// Height of the two-dimensional buffer
    fn height(&self) -> u32;
    /// Size (w x h) of the two-dimensional buffer
    fn size(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
    /// Pixel format of the buffer
    fn format(&self) -> Format;
}
