//! Texture realization of client buffers.
//!
//! The compositor's rendering context is an external collaborator described by the
//! [`GpuContext`] trait: it answers driver queries about importable formats and turns
//! dmabuf plane descriptions into external images and textures.
//!
//! Every [`GpuContext`] automatically implements [`ImportDma`], which realizes a
//! [`Dmabuf`] as a texture exactly once and caches the result on the buffer itself.

use std::error::Error;
use std::os::unix::io::BorrowedFd;

use rustix::fs::Dev;
use smallvec::SmallVec;
use tracing::{debug, instrument, trace};

use crate::backend::allocator::{
    dmabuf::{Dmabuf, MAX_PLANES},
    format::{pixel_format, PixelFormat},
    Buffer, Fourcc, Modifier,
};


/// Abstraction of a texture handle of a [`GpuContext`]
pub trait Texture {
    /// Size of the texture plane
    fn size(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
    /// Width of the texture plane
    fn width(&self) -> u32;
    /// Height of the texture plane
    fn height(&self) -> u32;
}

bitflags::bitflags! {
    /// Flags for textures created from external images
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureFlags: u32 {
        /// The texture content must not be read back through generic texture-data apis,
        /// as it might not live in host-addressable memory.
        const NO_GET_DATA = 1;
    }
}

/// Description of a single dmabuf plane handed to the driver
#[derive(Debug, Clone, Copy)]
pub struct PlaneAttributes<'a> {
    /// File descriptor of the plane
    pub fd: BorrowedFd<'a>,
    /// Offset from the start of the file descriptor in bytes
    pub offset: u32,
    /// Stride of the plane in bytes
    pub stride: u32,
    /// Layout modifier of the plane
    pub modifier: Modifier,
}

/// Everything a driver needs to create an external image from a dmabuf
#[derive(Debug, Clone)]
pub struct DmabufImageAttributes<'a> {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Fourcc code of the buffer
    pub format: Fourcc,
    /// Planes present, contiguous from index 0
    pub planes: SmallVec<[PlaneAttributes<'a>; MAX_PLANES]>,
}

impl<'a> DmabufImageAttributes<'a> {
    /// Describe the given dmabuf
    pub fn from_dmabuf(dmabuf: &'a Dmabuf) -> Self {
        let modifier = dmabuf.modifier();
        DmabufImageAttributes {
            width: dmabuf.width(),
            height: dmabuf.height(),
            format: dmabuf.format().code,
            planes: dmabuf
                .handles()
                .zip(dmabuf.offsets())
                .zip(dmabuf.strides())
                .map(|((fd, offset), stride)| PlaneAttributes {
                    fd,
                    offset,
                    stride,
                    modifier,
                })
                .collect(),
        }
    }
}

/// A GPU rendering context able to import dmabufs
pub trait GpuContext {
    /// Error type returned by driver operations
    type Error: Error + Send + Sync + 'static;
    /// External image handle created from dmabuf planes
    type Image;
    /// Texture handle type used by this context
    type Texture: Texture + Clone + Send + Sync + 'static;

    /// Fourcc codes the driver is able to import
    fn dmabuf_formats(&self) -> Result<Vec<Fourcc>, Self::Error>;

    /// Modifiers the driver is able to import for a given format.
    ///
    /// Returns `Ok(None)`, if the driver cannot be queried for modifiers at all.
    fn dmabuf_modifiers(&self, format: Fourcc) -> Result<Option<Vec<Modifier>>, Self::Error>;

    /// Create an external image from the given planes
    fn create_image_from_dmabuf(
        &mut self,
        attributes: &DmabufImageAttributes<'_>,
    ) -> Result<Self::Image, Self::Error>;

    /// Wrap an external image as a 2D texture
    fn texture_from_image(
        &mut self,
        image: Self::Image,
        size: (u32, u32),
        format: PixelFormat,
        flags: TextureFlags,
    ) -> Result<Self::Texture, Self::Error>;

    /// Device id of the render node used by this context, if known
    fn render_device(&self) -> Option<Dev>;
}

/// A texture realized from a [`Dmabuf`]
#[derive(Debug, Clone)]
pub struct DmabufTexture<T> {
    texture: T,
    format: PixelFormat,
    y_inverted: bool,
}

impl<T> DmabufTexture<T> {
    /// The texture handle
    pub fn texture(&self) -> &T {
        &self.texture
    }

    /// Component ordering of the texture
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Returns true if the rows of the texture run bottom-to-top
    pub fn y_inverted(&self) -> bool {
        self.y_inverted
    }
}

/// Errors of buffer realization
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// The format is not one the compositor knows how to texture
    #[error("Unsupported buffer format: {0}")]
    UnsupportedFormat(Fourcc),
    /// The driver rejected the plane/format/modifier combination
    #[error("The driver failed to import the buffer")]
    ImportFailed(#[source] Box<dyn Error + Send + Sync>),
    /// The driver failed to wrap the imported image as a texture
    #[error("The driver failed to create a texture from the imported buffer")]
    TextureFailed(#[source] Box<dyn Error + Send + Sync>),
    /// The buffer already carries a texture of a different rendering context
    #[error("The buffer was already realized by another rendering context")]
    ForeignTexture,
}

/// Realization of [`Dmabuf`]s as textures
///
/// Implemented for every [`GpuContext`].
pub trait ImportDma: GpuContext {
    /// Realize a dmabuf as a texture.
    ///
    /// The texture is created at most once per buffer, subsequent calls return the cached texture.
    #[instrument(level = "trace", skip_all)]
    #[profiling::function]
    fn import_dmabuf(&mut self, dmabuf: &Dmabuf) -> Result<DmabufTexture<Self::Texture>, ImportError> {
        if let Some(existing) = dmabuf.texture_slot().get() {
            trace!("Re-using texture for {:?}", dmabuf.format());
            return existing
                .downcast_ref::<DmabufTexture<Self::Texture>>()
                .cloned()
                .ok_or(ImportError::ForeignTexture);
        }

        let code = dmabuf.format().code;
        let format = pixel_format(code).ok_or(ImportError::UnsupportedFormat(code))?;

        let attributes = DmabufImageAttributes::from_dmabuf(dmabuf);
        trace!(
            format = ?code,
            modifier = ?dmabuf.modifier(),
            planes = attributes.planes.len(),
            "Importing dmabuf"
        );
        let image = self.create_image_from_dmabuf(&attributes).map_err(|err| {
            debug!(?err, format = ?code, modifier = ?dmabuf.modifier(), "Driver rejected dmabuf");
            ImportError::ImportFailed(Box::new(err))
        })?;
        let texture = self
            .texture_from_image(image, dmabuf.size(), format, TextureFlags::NO_GET_DATA)
            .map_err(|err| ImportError::TextureFailed(Box::new(err)))?;

        let texture = DmabufTexture {
            texture,
            format,
            y_inverted: dmabuf.y_inverted(),
        };
        if dmabuf.texture_slot().set(Box::new(texture.clone())).is_err() {
            // realized concurrently by another holder, hand out the winner
            return dmabuf
                .texture_slot()
                .get()
                .and_then(|existing| existing.downcast_ref::<DmabufTexture<Self::Texture>>())
                .cloned()
                .ok_or(ImportError::ForeignTexture);
        }
        Ok(texture)
    }
}

impl<G: GpuContext> ImportDma for G {}
