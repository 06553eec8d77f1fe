//! Module for [dmabuf](https://docs.kernel.org/driver-api/dma-buf.html) buffers.
//!
//! `Dmabuf`s act alike to smart pointers and can be freely cloned and passed around.
//! Once the last `Dmabuf` reference is dropped, its file descriptors are closed and
//! underlying resources (including a realized texture) are freed.
//!
//! If you want to hold on to a potentially alive dmabuf without blocking the free up
//! of the underlying resources, you may `downgrade` a `Dmabuf` reference to a `WeakDmabuf`.

use super::{Buffer, Format, Fourcc, Modifier};
use smallvec::SmallVec;
use std::any::Any;
use std::hash::{Hash, Hasher};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, OnceLock, Weak};

/// Maximum amount of planes this implementation supports
pub const MAX_PLANES: usize = 4;

pub(crate) type TextureSlot = OnceLock<Box<dyn Any + Send + Sync>>;

#[derive(Debug)]
pub(crate) struct DmabufInternal {
    /// The submitted planes, contiguous from index 0
    pub planes: SmallVec<[Plane; MAX_PLANES]>,
    pub width: u32,
    pub height: u32,
    pub format: Fourcc,
    /// Layout modifier shared by all planes
    pub modifier: Modifier,
    pub flags: DmabufFlags,
    /// Texture realized from this buffer, set at most once
    pub texture: TextureSlot,
}

#[derive(Debug)]
pub(crate) struct Plane {
    pub fd: OwnedFd,
    /// The plane index
    pub plane_idx: u32,
    /// Offset from the start of the Fd
    pub offset: u32,
    /// Stride for this plane
    pub stride: u32,
}

bitflags::bitflags! {
    /// Possible flags for a DMA buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DmabufFlags: u32 {
        /// The buffer content is Y-inverted
        const Y_INVERT = 1;
        /// The buffer content is interlaced
        const INTERLACED = 2;
        /// The buffer content if interlaced is bottom-field first
        const BOTTOM_FIRST = 4;
    }
}

#[derive(Debug, Clone)]
/// Strong reference to a dmabuf handle
pub struct Dmabuf(pub(crate) Arc<DmabufInternal>);

#[derive(Debug, Clone)]
/// Weak reference to a dmabuf handle
pub struct WeakDmabuf(pub(crate) Weak<DmabufInternal>);

impl PartialEq for Dmabuf {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Dmabuf {}

impl PartialEq for WeakDmabuf {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for WeakDmabuf {}

impl Hash for Dmabuf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state)
    }
}
impl Hash for WeakDmabuf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.as_ptr().hash(state)
    }
}

impl Buffer for Dmabuf {
    fn width(&self) -> u32 {
        self.0.width
    }

    fn height(&self) -> u32 {
        self.0.height
    }

    fn format(&self) -> Format {
        Format {
            code: self.0.format,
            modifier: self.0.modifier,
        }
    }
}

/// Builder for Dmabufs
#[derive(Debug)]
pub struct DmabufBuilder {
    internal: DmabufInternal,
}

impl DmabufBuilder {
    /// Add a plane to the constructed Dmabuf
    ///
    /// The builder takes ownership of the file descriptor, it is closed once the
    /// resulting `Dmabuf` (or the builder) is dropped.
    ///
    /// *Note*: Each Dmabuf needs at least one plane.
    /// [`MAX_PLANES`] notes the maximum amount of planes any format may use with this implementation.
    /// Returns `false` and drops the descriptor, if that amount is exceeded.
    pub fn add_plane(&mut self, fd: OwnedFd, idx: u32, offset: u32, stride: u32) -> bool {
        if self.internal.planes.len() == MAX_PLANES {
            return false;
        }
        self.internal.planes.push(Plane {
            fd,
            plane_idx: idx,
            offset,
            stride,
        });

        true
    }

    /// Build a `Dmabuf` out of the provided parameters and planes
    ///
    /// Returns `None` if the builder has no planes attached.
    pub fn build(mut self) -> Option<Dmabuf> {
        if self.internal.planes.is_empty() {
            return None;
        }

        self.internal.planes.sort_by_key(|plane| plane.plane_idx);
        Some(Dmabuf(Arc::new(self.internal)))
    }
}

impl Dmabuf {
    /// Create a new Dmabuf builder
    pub fn builder(
        (width, height): (u32, u32),
        format: Fourcc,
        modifier: Modifier,
        flags: DmabufFlags,
    ) -> DmabufBuilder {
        DmabufBuilder {
            internal: DmabufInternal {
                planes: SmallVec::new(),
                width,
                height,
                format,
                modifier,
                flags,
                texture: OnceLock::new(),
            },
        }
    }

    /// The amount of planes this Dmabuf has
    pub fn num_planes(&self) -> usize {
        self.0.planes.len()
    }

    /// Returns the file descriptors of the planes of this buffer
    pub fn handles(&self) -> impl Iterator<Item = BorrowedFd<'_>> + '_ {
        self.0.planes.iter().map(|p| p.fd.as_fd())
    }

    /// Returns offsets for the planes of this buffer
    pub fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.offset)
    }

    /// Returns strides for the planes of this buffer
    pub fn strides(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.stride)
    }

    /// Layout modifier of this buffer
    pub fn modifier(&self) -> Modifier {
        self.0.modifier
    }

    /// Flags the buffer was created with
    pub fn flags(&self) -> DmabufFlags {
        self.0.flags
    }

    /// Returns if this buffer format has any vendor-specific modifiers set or is implicit/linear
    pub fn has_modifier(&self) -> bool {
        self.0.modifier != Modifier::Invalid && self.0.modifier != Modifier::Linear
    }

    /// Returns if the buffer rows are stored bottom-to-top relative to the compositor's
    /// rendering convention.
    ///
    /// Clients set [`DmabufFlags::Y_INVERT`] to declare the content already has the
    /// orientation the compositor expects, so this is the negation of that flag.
    pub fn y_inverted(&self) -> bool {
        !self.0.flags.contains(DmabufFlags::Y_INVERT)
    }

    /// Create a weak reference to this dmabuf
    pub fn weak(&self) -> WeakDmabuf {
        WeakDmabuf(Arc::downgrade(&self.0))
    }

    pub(crate) fn texture_slot(&self) -> &TextureSlot {
        &self.0.texture
    }

    /// Returns true if a texture was already realized from this buffer
    pub fn is_realized(&self) -> bool {
        self.0.texture.get().is_some()
    }
}

impl WeakDmabuf {
    /// Try to upgrade to a strong reference of this buffer.
    ///
    /// Fails if no strong references exist anymore and the handles were already closed.
    pub fn upgrade(&self) -> Option<Dmabuf> {
        self.0.upgrade().map(Dmabuf)
    }

    /// Returns true if there are not any strong references remaining
    pub fn is_gone(&self) -> bool {
        self.0.strong_count() == 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rustix::{fs::MemfdFlags, pipe::PipeFlags};

    pub(crate) fn memfd(size: u64) -> OwnedFd {
        let fd = rustix::fs::memfd_create("dmabuf-test", MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, size).unwrap();
        fd
    }

    /// A nonblocking pipe, the write end stands in for a plane descriptor
    pub(crate) fn plane_pipe() -> (OwnedFd, OwnedFd) {
        rustix::pipe::pipe_with(PipeFlags::NONBLOCK | PipeFlags::CLOEXEC).unwrap()
    }

    /// Returns true once every copy of the write end of `read`'s pipe is closed
    pub(crate) fn write_end_closed(read: &OwnedFd) -> bool {
        let mut buf = [0u8; 1];
        match rustix::io::read(read, &mut buf) {
            Ok(0) => true,
            Err(rustix::io::Errno::AGAIN) => false,
            other => panic!("unexpected read on plane pipe: {:?}", other),
        }
    }

    #[test]
    fn planes_are_sorted_and_described() {
        let mut builder = Dmabuf::builder(
            (64, 32),
            Fourcc::Argb8888,
            Modifier::Linear,
            DmabufFlags::empty(),
        );
        assert!(builder.add_plane(memfd(4096), 1, 2048, 128));
        assert!(builder.add_plane(memfd(4096), 0, 0, 256));
        let dmabuf = builder.build().unwrap();

        assert_eq!(dmabuf.num_planes(), 2);
        assert_eq!(dmabuf.offsets().collect::<Vec<_>>(), vec![0, 2048]);
        assert_eq!(dmabuf.strides().collect::<Vec<_>>(), vec![256, 128]);
        assert_eq!(dmabuf.size(), (64, 32));
        assert_eq!(
            dmabuf.format(),
            Format {
                code: Fourcc::Argb8888,
                modifier: Modifier::Linear
            }
        );
        assert!(!dmabuf.has_modifier());
    }

    #[test]
    fn plane_limit() {
        let mut builder = Dmabuf::builder((1, 1), Fourcc::Argb8888, Modifier::Invalid, DmabufFlags::empty());
        for idx in 0..MAX_PLANES as u32 {
            assert!(builder.add_plane(memfd(0), idx, 0, 4));
        }
        assert!(!builder.add_plane(memfd(0), 4, 0, 4));
    }

    #[test]
    fn empty_builder_fails() {
        let builder = Dmabuf::builder((1, 1), Fourcc::Argb8888, Modifier::Invalid, DmabufFlags::empty());
        assert!(builder.build().is_none());
    }

    #[test]
    fn y_orientation_follows_flag() {
        let mut builder = Dmabuf::builder((1, 1), Fourcc::Xrgb8888, Modifier::Invalid, DmabufFlags::empty());
        builder.add_plane(memfd(4), 0, 0, 4);
        assert!(builder.build().unwrap().y_inverted());

        let mut builder = Dmabuf::builder((1, 1), Fourcc::Xrgb8888, Modifier::Invalid, DmabufFlags::Y_INVERT);
        builder.add_plane(memfd(4), 0, 0, 4);
        assert!(!builder.build().unwrap().y_inverted());
    }

    #[test]
    fn weak_reference_tracks_lifetime() {
        let mut builder = Dmabuf::builder((1, 1), Fourcc::Xrgb8888, Modifier::Invalid, DmabufFlags::empty());
        builder.add_plane(memfd(4), 0, 0, 4);
        let dmabuf = builder.build().unwrap();
        let weak = dmabuf.weak();
        let clone = dmabuf.clone();
        assert_eq!(weak.upgrade(), Some(dmabuf.clone()));

        drop(dmabuf);
        assert!(!weak.is_gone());
        drop(clone);
        assert!(weak.is_gone());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn planes_are_closed_with_the_last_holder() {
        let (read, write) = plane_pipe();
        let mut builder = Dmabuf::builder((1, 1), Fourcc::Xrgb8888, Modifier::Invalid, DmabufFlags::empty());
        builder.add_plane(write, 0, 0, 4);
        let dmabuf = builder.build().unwrap();
        let clone = dmabuf.clone();

        drop(dmabuf);
        assert!(!write_end_closed(&read));
        drop(clone);
        assert!(write_end_closed(&read));
    }
}
