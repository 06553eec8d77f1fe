//! Best-effort direct scanout of dmabufs
//!
//! Every failure on this path is invisible to clients: it is logged and the compositor
//! keeps rendering the buffer through its already realized texture.

use std::os::unix::io::BorrowedFd;

use tracing::{debug, instrument, trace};

use super::{ScanoutDevice, ScanoutOutput};
use crate::backend::allocator::{
    dmabuf::{Dmabuf, MAX_PLANES},
    Buffer, Format, Fourcc, Modifier,
};

/// Parameters of a native buffer object import
#[derive(Debug)]
pub enum BoImport<'a> {
    /// Single plane, implicit layout and no offset
    Legacy {
        /// Descriptor of the only plane
        fd: BorrowedFd<'a>,
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
        /// Stride in bytes
        stride: u32,
        /// Fourcc code
        format: Fourcc,
    },
    /// Explicit modifier, multiple planes or plane offsets
    WithModifier {
        /// Number of planes present
        num_planes: usize,
        /// Plane descriptors, `None` past `num_planes`
        fds: [Option<BorrowedFd<'a>>; MAX_PLANES],
        /// Plane strides in bytes
        strides: [u32; MAX_PLANES],
        /// Plane offsets in bytes
        offsets: [u32; MAX_PLANES],
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
        /// Fourcc code
        format: Fourcc,
        /// Layout modifier
        modifier: Modifier,
    },
}

impl<'a> BoImport<'a> {
    /// Choose the import path for a dmabuf
    pub fn from_dmabuf(dmabuf: &'a Dmabuf) -> Option<BoImport<'a>> {
        let num_planes = dmabuf.num_planes().min(MAX_PLANES);
        let mut fds = [None; MAX_PLANES];
        let mut strides = [0u32; MAX_PLANES];
        let mut offsets = [0u32; MAX_PLANES];
        for (i, ((fd, stride), offset)) in dmabuf
            .handles()
            .zip(dmabuf.strides())
            .zip(dmabuf.offsets())
            .take(MAX_PLANES)
            .enumerate()
        {
            fds[i] = Some(fd);
            strides[i] = stride;
            offsets[i] = offset;
        }

        let format = dmabuf.format();
        if format.modifier != Modifier::Invalid || num_planes > 1 || offsets[0] != 0 {
            Some(BoImport::WithModifier {
                num_planes,
                fds,
                strides,
                offsets,
                width: dmabuf.width(),
                height: dmabuf.height(),
                format: format.code,
                modifier: format.modifier,
            })
        } else {
            Some(BoImport::Legacy {
                fd: fds[0]?,
                width: dmabuf.width(),
                height: dmabuf.height(),
                stride: strides[0],
                format: format.code,
            })
        }
    }

    /// Returns true if the import passes an explicit modifier
    pub fn uses_modifier(&self) -> bool {
        matches!(self, BoImport::WithModifier { .. })
    }
}

/// Description of a framebuffer handed to [`ScanoutOutput::is_scanout_compatible`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanoutBufferInfo {
    /// Format and modifier of the buffer
    pub format: Format,
    /// Size of the buffer in pixels
    pub size: (u32, u32),
    /// Number of planes
    pub num_planes: usize,
    /// The buffer object was imported with an explicit modifier
    pub uses_modifier: bool,
}

/// A dmabuf ready to be posted directly on a crtc
///
/// Keeps the dmabuf alive for as long as the framebuffer exists.
#[derive(Debug)]
pub struct ScanoutBuffer<F> {
    framebuffer: F,
    dmabuf: Dmabuf,
    info: ScanoutBufferInfo,
}

impl<F> ScanoutBuffer<F> {
    /// The framebuffer to post
    pub fn framebuffer(&self) -> &F {
        &self.framebuffer
    }

    /// The client buffer backing the framebuffer
    pub fn dmabuf(&self) -> &Dmabuf {
        &self.dmabuf
    }

    /// Description of the framebuffer
    pub fn info(&self) -> &ScanoutBufferInfo {
        &self.info
    }
}

#[derive(Debug, thiserror::Error)]
enum ScanoutError {
    #[error("The buffer has no planes")]
    NoPlanes,
    #[error("Native buffer import failed")]
    Import(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Framebuffer creation failed")]
    Framebuffer(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("The output cannot scan out {0:?}")]
    Incompatible(Format),
}

/// Try to make a dmabuf directly postable on an output.
///
/// Returns `None` on any failure. Callers are expected to fall back to composition.
#[instrument(level = "trace", skip_all, fields(crtc = %output.crtc_id()))]
#[profiling::function]
pub fn try_acquire_scanout<D, O>(
    device: &D,
    dmabuf: &Dmabuf,
    output: &O,
) -> Option<ScanoutBuffer<D::Framebuffer>>
where
    D: ScanoutDevice,
    O: ScanoutOutput + ?Sized,
{
    match acquire(device, dmabuf, output) {
        Ok(buffer) => {
            trace!(format = ?buffer.info.format, "Acquired buffer for direct scanout");
            Some(buffer)
        }
        Err(err) => {
            debug!(?err, format = ?dmabuf.format(), "Direct scanout not possible");
            None
        }
    }
}

fn acquire<D, O>(
    device: &D,
    dmabuf: &Dmabuf,
    output: &O,
) -> Result<ScanoutBuffer<D::Framebuffer>, ScanoutError>
where
    D: ScanoutDevice,
    O: ScanoutOutput + ?Sized,
{
    let import = BoImport::from_dmabuf(dmabuf).ok_or(ScanoutError::NoPlanes)?;
    let uses_modifier = import.uses_modifier();

    let bo = device
        .import_buffer_object(&import)
        .map_err(|err| ScanoutError::Import(Box::new(err)))?;
    let framebuffer = device
        .create_framebuffer(bo, uses_modifier)
        .map_err(|err| ScanoutError::Framebuffer(Box::new(err)))?;

    let info = ScanoutBufferInfo {
        format: dmabuf.format(),
        size: dmabuf.size(),
        num_planes: dmabuf.num_planes(),
        uses_modifier,
    };
    if !output.is_scanout_compatible(&info) {
        return Err(ScanoutError::Incompatible(info.format));
    }

    Ok(ScanoutBuffer {
        framebuffer,
        dmabuf: dmabuf.clone(),
        info,
    })
}
