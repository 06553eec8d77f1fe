//! [`ScanoutDevice`] implementation on top of libgbm and kms framebuffers

use std::{io, os::unix::io::AsFd, sync::Arc};

use drm::control::{framebuffer, Device as ControlDevice, FbCmd2Flags};
use gbm::{BufferObject, BufferObjectFlags, Device as GbmDevice};
use tracing::{trace, warn};

use super::{BoImport, ScanoutDevice};

/// Scanout device importing dmabufs through libgbm
#[derive(Debug)]
pub struct GbmScanoutDevice<A: AsFd + 'static> {
    gbm: Arc<GbmDevice<A>>,
}

impl<A: AsFd + ControlDevice + 'static> GbmScanoutDevice<A> {
    /// Wrap a gbm device opened on the kms device of an output
    pub fn new(gbm: GbmDevice<A>) -> Self {
        GbmScanoutDevice { gbm: Arc::new(gbm) }
    }
}

/// A kms framebuffer backed by an imported gbm buffer object
///
/// The framebuffer is removed from the device on drop.
#[derive(Debug)]
pub struct GbmFramebuffer<A: AsFd + ControlDevice + 'static> {
    _bo: BufferObject<()>,
    fb: framebuffer::Handle,
    device: Arc<GbmDevice<A>>,
}

impl<A: AsFd + ControlDevice + 'static> GbmFramebuffer<A> {
    /// Handle of the framebuffer
    pub fn handle(&self) -> framebuffer::Handle {
        self.fb
    }
}

impl<A: AsFd + ControlDevice + 'static> Drop for GbmFramebuffer<A> {
    fn drop(&mut self) {
        trace!(fb = ?self.fb, "destroying framebuffer");
        if let Err(err) = self.device.destroy_framebuffer(self.fb) {
            warn!(fb = ?self.fb, ?err, "failed to destroy framebuffer");
        }
    }
}

impl<A: AsFd + ControlDevice + 'static> ScanoutDevice for GbmScanoutDevice<A> {
    type BufferObject = BufferObject<()>;
    type Framebuffer = GbmFramebuffer<A>;
    type Error = io::Error;

    #[profiling::function]
    fn import_buffer_object(&self, import: &BoImport<'_>) -> Result<BufferObject<()>, io::Error> {
        match *import {
            BoImport::Legacy {
                fd,
                width,
                height,
                stride,
                format,
            } => self.gbm.import_buffer_object_from_dma_buf(
                fd,
                width,
                height,
                stride,
                format,
                BufferObjectFlags::SCANOUT,
            ),
            BoImport::WithModifier {
                num_planes,
                fds,
                strides,
                offsets,
                width,
                height,
                format,
                modifier,
            } => self.gbm.import_buffer_object_from_dma_buf_with_modifiers(
                num_planes as u32,
                fds,
                width,
                height,
                format,
                BufferObjectFlags::SCANOUT,
                strides.map(|stride| stride as i32),
                offsets.map(|offset| offset as i32),
                modifier,
            ),
        }
    }

    #[profiling::function]
    fn create_framebuffer(
        &self,
        bo: BufferObject<()>,
        use_modifier: bool,
    ) -> Result<GbmFramebuffer<A>, io::Error> {
        let flags = if use_modifier {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };
        let fb = self.gbm.add_planar_framebuffer(&bo, flags)?;
        trace!(?fb, use_modifier, "added framebuffer for imported buffer object");

        Ok(GbmFramebuffer {
            _bo: bo,
            fb,
            device: self.gbm.clone(),
        })
    }
}
