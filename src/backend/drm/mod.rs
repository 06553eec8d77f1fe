//! Direct scanout of client buffers
//!
//! The display/KMS stack is an external collaborator, described by two traits:
//!
//! - [`ScanoutDevice`] is the device backing an output. It imports dmabufs as native buffer
//!   objects and wraps them as framebuffers.
//! - [`ScanoutOutput`] is a display output (a crtc). It reports the formats and modifiers
//!   its planes accept and decides whether a framebuffer fits its current configuration.
//!
//! [`try_acquire_scanout`](scanout::try_acquire_scanout) combines both into a best-effort
//! zero-copy path. With the `backend_gbm` feature, [`gbm::GbmScanoutDevice`] implements
//! [`ScanoutDevice`] on top of libgbm.

use std::fmt;

use crate::backend::allocator::{Fourcc, Modifier};

#[cfg(feature = "backend_gbm")]
pub mod gbm;
pub mod scanout;
#[cfg(any(test, feature = "test_backend"))]
pub mod test;

pub use self::scanout::{BoImport, ScanoutBuffer, ScanoutBufferInfo};

/// Identifier of a crtc of a display device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CrtcId(pub u32);

impl From<u32> for CrtcId {
    fn from(id: u32) -> Self {
        CrtcId(id)
    }
}

impl fmt::Display for CrtcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "crtc-{}", self.0)
    }
}

/// A display output a buffer may be scanned out on
pub trait ScanoutOutput {
    /// The crtc driving this output
    fn crtc_id(&self) -> CrtcId;

    /// Returns true if the primary plane of the output accepts the format with any layout
    fn supports_format(&self, code: Fourcc) -> bool;

    /// Returns true if the primary plane of the output accepts the format with the given modifier
    fn supports_modifier(&self, code: Fourcc, modifier: Modifier) -> bool;

    /// Returns true if a framebuffer described by `info` can be posted with the current
    /// configuration of the output (format, modifier and any active pipeline constraints).
    fn is_scanout_compatible(&self, info: &ScanoutBufferInfo) -> bool;
}

/// Device backing a display output
pub trait ScanoutDevice {
    /// Native buffer object type
    type BufferObject;
    /// Framebuffer type, releasing the framebuffer on drop
    type Framebuffer;
    /// Error type of this device
    type Error: std::error::Error + Send + Sync + 'static;

    /// Import dmabuf planes as a native buffer object
    fn import_buffer_object(&self, import: &BoImport<'_>) -> Result<Self::BufferObject, Self::Error>;

    /// Wrap a buffer object as a framebuffer
    ///
    /// `use_modifier` is set, if the buffer object was imported with an explicit modifier.
    fn create_framebuffer(
        &self,
        bo: Self::BufferObject,
        use_modifier: bool,
    ) -> Result<Self::Framebuffer, Self::Error>;
}
