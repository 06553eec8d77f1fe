#![allow(missing_docs)]
use std::cell::{Cell, RefCell};

use super::{BoImport, CrtcId, ScanoutBufferInfo, ScanoutDevice, ScanoutOutput};
use crate::backend::allocator::{format::FormatSet, Format, Fourcc, Modifier};

#[derive(Debug, thiserror::Error)]
pub enum DummyScanoutError {
    #[error("Import refused")]
    Import,
    #[error("Framebuffer refused")]
    Framebuffer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DummyBufferObject {
    pub format: Fourcc,
    pub num_planes: usize,
    pub uses_modifier: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DummyFramebuffer {
    pub id: u32,
    pub bo: DummyBufferObject,
    pub use_modifier: bool,
}

/// Scanout device double recording every import
#[derive(Debug, Default)]
pub struct DummyScanoutDevice {
    pub refuse_import: bool,
    pub refuse_framebuffer: bool,
    pub imports: RefCell<Vec<DummyBufferObject>>,
    next_fb: Cell<u32>,
}

impl ScanoutDevice for DummyScanoutDevice {
    type BufferObject = DummyBufferObject;
    type Framebuffer = DummyFramebuffer;
    type Error = DummyScanoutError;

    fn import_buffer_object(&self, import: &BoImport<'_>) -> Result<DummyBufferObject, DummyScanoutError> {
        if self.refuse_import {
            return Err(DummyScanoutError::Import);
        }
        let bo = match import {
            BoImport::Legacy { format, .. } => DummyBufferObject {
                format: *format,
                num_planes: 1,
                uses_modifier: false,
            },
            BoImport::WithModifier {
                format, num_planes, ..
            } => DummyBufferObject {
                format: *format,
                num_planes: *num_planes,
                uses_modifier: true,
            },
        };
        self.imports.borrow_mut().push(bo.clone());
        Ok(bo)
    }

    fn create_framebuffer(
        &self,
        bo: DummyBufferObject,
        use_modifier: bool,
    ) -> Result<DummyFramebuffer, DummyScanoutError> {
        if self.refuse_framebuffer {
            return Err(DummyScanoutError::Framebuffer);
        }
        let id = self.next_fb.get() + 1;
        self.next_fb.set(id);
        Ok(DummyFramebuffer { id, bo, use_modifier })
    }
}

/// Output double accepting a fixed set of formats on its primary plane
#[derive(Debug, Clone)]
pub struct DummyOutput {
    pub crtc: CrtcId,
    pub formats: FormatSet,
    /// Rejects every framebuffer in the compatibility check, e.g. due to an active color pipeline
    pub locked: bool,
}

impl DummyOutput {
    pub fn new(crtc: u32, formats: impl IntoIterator<Item = Format>) -> DummyOutput {
        DummyOutput {
            crtc: CrtcId(crtc),
            formats: formats.into_iter().collect(),
            locked: false,
        }
    }
}

impl ScanoutOutput for DummyOutput {
    fn crtc_id(&self) -> CrtcId {
        self.crtc
    }

    fn supports_format(&self, code: Fourcc) -> bool {
        self.formats.contains_code(code)
    }

    fn supports_modifier(&self, code: Fourcc, modifier: Modifier) -> bool {
        self.formats.contains(&Format { code, modifier })
    }

    fn is_scanout_compatible(&self, info: &ScanoutBufferInfo) -> bool {
        if self.locked {
            return false;
        }
        if info.format.modifier == Modifier::Invalid {
            self.supports_format(info.format.code)
        } else {
            self.supports_modifier(info.format.code, info.format.modifier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        allocator::dmabuf::{tests::memfd, Dmabuf, DmabufFlags},
        drm::scanout::try_acquire_scanout,
    };

    fn dmabuf(format: Fourcc, modifier: Modifier, planes: &[(u32, u32)]) -> Dmabuf {
        let mut builder = Dmabuf::builder((32, 32), format, modifier, DmabufFlags::empty());
        for (idx, (offset, stride)) in planes.iter().enumerate() {
            builder.add_plane(memfd(8192), idx as u32, *offset, *stride);
        }
        builder.build().unwrap()
    }

    fn argb_linear() -> Format {
        Format {
            code: Fourcc::Argb8888,
            modifier: Modifier::Linear,
        }
    }

    #[test]
    fn legacy_import_for_implicit_single_plane() {
        let device = DummyScanoutDevice::default();
        let output = DummyOutput::new(
            1,
            [Format {
                code: Fourcc::Xrgb8888,
                modifier: Modifier::Linear,
            }],
        );
        let buffer = dmabuf(Fourcc::Xrgb8888, Modifier::Invalid, &[(0, 128)]);

        let scanout = try_acquire_scanout(&device, &buffer, &output).unwrap();
        assert!(!scanout.info().uses_modifier);
        assert!(!scanout.framebuffer().use_modifier);
        assert_eq!(scanout.dmabuf(), &buffer);
        assert_eq!(scanout.info().size, (32, 32));
    }

    #[test]
    fn modifier_import_paths() {
        let device = DummyScanoutDevice::default();
        let output = DummyOutput::new(1, [argb_linear()]);

        let explicit = dmabuf(Fourcc::Argb8888, Modifier::Linear, &[(0, 128)]);
        let scanout = try_acquire_scanout(&device, &explicit, &output).unwrap();
        assert!(scanout.info().uses_modifier);

        let offset = dmabuf(Fourcc::Argb8888, Modifier::Invalid, &[(64, 128)]);
        assert!(BoImport::from_dmabuf(&offset).unwrap().uses_modifier());

        let planar = dmabuf(Fourcc::Argb8888, Modifier::Invalid, &[(0, 128), (4096, 64)]);
        assert!(BoImport::from_dmabuf(&planar).unwrap().uses_modifier());
        assert!(try_acquire_scanout(&device, &planar, &output).is_some());

        let imports = device.imports.borrow();
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[1].num_planes, 2);
    }

    #[test]
    fn incompatible_format_returns_none() {
        let device = DummyScanoutDevice::default();
        let output = DummyOutput::new(1, [argb_linear()]);
        let buffer = dmabuf(Fourcc::Abgr2101010, Modifier::Linear, &[(0, 128)]);

        assert!(try_acquire_scanout(&device, &buffer, &output).is_none());
        // the import itself succeeded, only the output refused it
        assert_eq!(device.imports.borrow().len(), 1);
    }

    #[test]
    fn device_failures_return_none() {
        let output = DummyOutput::new(1, [argb_linear()]);
        let buffer = dmabuf(Fourcc::Argb8888, Modifier::Linear, &[(0, 128)]);

        let device = DummyScanoutDevice {
            refuse_import: true,
            ..Default::default()
        };
        assert!(try_acquire_scanout(&device, &buffer, &output).is_none());

        let device = DummyScanoutDevice {
            refuse_framebuffer: true,
            ..Default::default()
        };
        assert!(try_acquire_scanout(&device, &buffer, &output).is_none());

        let mut locked = output.clone();
        locked.locked = true;
        assert!(try_acquire_scanout(&DummyScanoutDevice::default(), &buffer, &locked).is_none());
    }
}
