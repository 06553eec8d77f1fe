//! Assembly of client buffer submissions
//!
//! A [`DmabufParams`] collects up to [`MAX_PLANES`] plane descriptions and turns them into a
//! [`Dmabuf`] exactly once. It moves through `Building → Committed | Destroyed`, there is no way
//! back. Any commit, successful or not, consumes the params.

use std::os::unix::io::{AsFd, OwnedFd};

use rustix::fs::SeekFrom;
use tracing::trace;

use crate::backend::allocator::{
    dmabuf::{Dmabuf, DmabufFlags, MAX_PLANES},
    Fourcc, Modifier,
};

/// Protocol error code of a [`ParamsError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamsErrorCode {
    /// The params object was already used
    AlreadyUsed,
    /// Plane index out of bounds
    PlaneIdx,
    /// The plane index was already set
    PlaneSet,
    /// Missing or too many planes
    Incomplete,
    /// Format not supported
    InvalidFormat,
    /// Invalid width or height
    InvalidDimensions,
    /// Offset + stride * height goes out of the dmabuf bounds
    OutOfBounds,
    /// Invalid wl_buffer resulted from importing dmabufs
    InvalidWlBuffer,
}

/// Structural errors of a buffer submission
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamsError {
    /// The params were already committed or destroyed
    #[error("This buffer_params has already been used to create a buffer.")]
    AlreadyUsed,
    /// A plane index above the supported plane count was given
    #[error("Plane index {0} is out of bounds")]
    PlaneIndexOutOfRange(u32),
    /// The plane was already added
    #[error("Plane index {0} is already set.")]
    PlaneAlreadySet(u32),
    /// A plane was added with a modifier different from earlier planes
    #[error("Plane {plane} uses modifier {got:?}, but earlier planes use {expected:?}")]
    ModifierMismatch {
        /// Index of the offending plane
        plane: u32,
        /// Modifier of the earlier planes
        expected: Modifier,
        /// Modifier of the offending plane
        got: Modifier,
    },
    /// A plane is missing, either plane 0 or a gap in front of a later plane
    #[error("Plane {missing_plane} is missing")]
    Incomplete {
        /// First missing plane index
        missing_plane: u32,
    },
    /// Flags outside of the recognized set were given
    #[error("Unknown buffer flags {0:#x}")]
    UnknownFlags(u32),
    /// The format code is not a known fourcc code
    #[error("Format {0:#x} is not supported")]
    InvalidFormat(u32),
    /// Width or height is smaller than one
    #[error("Invalid dimensions {width}x{height}")]
    InvalidDimensions {
        /// Requested width
        width: i32,
        /// Requested height
        height: i32,
    },
    /// A plane does not fit into its file
    #[error("Plane {plane} is out of bounds: {reason}")]
    OutOfBounds {
        /// Index of the offending plane
        plane: u32,
        /// What exceeded the bounds
        reason: &'static str,
    },
}

impl ParamsError {
    /// Protocol error code to report this error with
    pub fn protocol_error(&self) -> ParamsErrorCode {
        match self {
            ParamsError::AlreadyUsed => ParamsErrorCode::AlreadyUsed,
            ParamsError::PlaneIndexOutOfRange(_) => ParamsErrorCode::PlaneIdx,
            ParamsError::PlaneAlreadySet(_) => ParamsErrorCode::PlaneSet,
            ParamsError::Incomplete { .. } => ParamsErrorCode::Incomplete,
            ParamsError::InvalidFormat(_) => ParamsErrorCode::InvalidFormat,
            ParamsError::InvalidDimensions { .. } => ParamsErrorCode::InvalidDimensions,
            ParamsError::OutOfBounds { .. } => ParamsErrorCode::OutOfBounds,
            ParamsError::ModifierMismatch { .. } | ParamsError::UnknownFlags(_) => {
                ParamsErrorCode::InvalidWlBuffer
            }
        }
    }
}

#[derive(Debug)]
struct PendingPlane {
    fd: OwnedFd,
    offset: u32,
    stride: u32,
}

#[derive(Debug, Default)]
struct PendingBuffer {
    planes: [Option<PendingPlane>; MAX_PLANES],
    modifier: Option<Modifier>,
}

#[derive(Debug)]
enum ParamsState {
    Building(PendingBuffer),
    Committed,
    Destroyed,
}

/// State machine of a single buffer submission
#[derive(Debug)]
pub struct DmabufParams {
    state: ParamsState,
}

impl Default for DmabufParams {
    fn default() -> Self {
        Self::new()
    }
}

impl DmabufParams {
    /// Start a new submission
    pub fn new() -> DmabufParams {
        DmabufParams {
            state: ParamsState::Building(PendingBuffer::default()),
        }
    }

    /// Returns true if planes may still be added
    pub fn is_building(&self) -> bool {
        matches!(self.state, ParamsState::Building(_))
    }

    /// Add a plane.
    ///
    /// Takes ownership of `fd`. On error the descriptor is closed right away.
    pub fn add(
        &mut self,
        fd: OwnedFd,
        plane_idx: u32,
        offset: u32,
        stride: u32,
        modifier: Modifier,
    ) -> Result<(), ParamsError> {
        let ParamsState::Building(pending) = &mut self.state else {
            return Err(ParamsError::AlreadyUsed);
        };

        let slot = pending
            .planes
            .get_mut(plane_idx as usize)
            .ok_or(ParamsError::PlaneIndexOutOfRange(plane_idx))?;
        if slot.is_some() {
            return Err(ParamsError::PlaneAlreadySet(plane_idx));
        }

        // an unspecified layout on earlier planes may still be refined
        match pending.modifier {
            Some(expected) if expected != Modifier::Invalid && expected != modifier => {
                return Err(ParamsError::ModifierMismatch {
                    plane: plane_idx,
                    expected,
                    got: modifier,
                });
            }
            _ => pending.modifier = Some(modifier),
        }

        trace!(plane_idx, offset, stride, ?modifier, "Adding plane");
        *slot = Some(PendingPlane { fd, offset, stride });
        Ok(())
    }

    /// Turn the collected planes into a [`Dmabuf`].
    ///
    /// The params are consumed regardless of the outcome. On error every collected
    /// descriptor is closed.
    pub fn commit(
        &mut self,
        width: i32,
        height: i32,
        format: u32,
        flags: u32,
    ) -> Result<Dmabuf, ParamsError> {
        let ParamsState::Building(pending) = std::mem::replace(&mut self.state, ParamsState::Committed) else {
            return Err(ParamsError::AlreadyUsed);
        };

        if pending.planes[0].is_none() {
            return Err(ParamsError::Incomplete { missing_plane: 0 });
        }
        // planes have to be contiguous, starting at 0
        let num_planes = pending.planes.iter().take_while(|plane| plane.is_some()).count();
        if pending.planes[num_planes..].iter().any(Option::is_some) {
            return Err(ParamsError::Incomplete {
                missing_plane: num_planes as u32,
            });
        }

        let flags = match DmabufFlags::from_bits(flags) {
            Some(flags) if (flags - DmabufFlags::Y_INVERT).is_empty() => flags,
            _ => return Err(ParamsError::UnknownFlags(flags)),
        };

        let code = Fourcc::try_from(format).map_err(|_| ParamsError::InvalidFormat(format))?;

        if width < 1 || height < 1 {
            return Err(ParamsError::InvalidDimensions { width, height });
        }

        let modifier = pending.modifier.unwrap_or(Modifier::Invalid);
        let mut builder = Dmabuf::builder((width as u32, height as u32), code, modifier, flags);
        for (idx, plane) in pending.planes.into_iter().flatten().enumerate() {
            check_bounds(&plane, idx as u32, height as u32)?;
            builder.add_plane(plane.fd, idx as u32, plane.offset, plane.stride);
        }

        builder.build().ok_or(ParamsError::Incomplete { missing_plane: 0 })
    }

    /// Drop the params, closing every collected descriptor
    pub fn destroy(&mut self) {
        self.state = ParamsState::Destroyed;
    }
}

fn check_bounds(plane: &PendingPlane, idx: u32, height: u32) -> Result<(), ParamsError> {
    let end = plane
        .stride
        .checked_mul(height)
        .and_then(|size| size.checked_add(plane.offset))
        .ok_or(ParamsError::OutOfBounds {
            plane: idx,
            reason: "size overflow",
        })?;

    // Not every descriptor is seekable, skip the checks for those
    if let Ok(size) = rustix::fs::seek(plane.fd.as_fd(), SeekFrom::End(0)) {
        // Reset seek point
        let _ = rustix::fs::seek(plane.fd.as_fd(), SeekFrom::Start(0));

        if u64::from(plane.offset) > size {
            return Err(ParamsError::OutOfBounds {
                plane: idx,
                reason: "invalid offset",
            });
        }

        if u64::from(plane.offset) + u64::from(plane.stride) > size {
            return Err(ParamsError::OutOfBounds {
                plane: idx,
                reason: "invalid stride",
            });
        }

        // Planes > 0 can be subsampled, in which case 'size' will be smaller than expected.
        if idx == 0 && u64::from(end) > size {
            return Err(ParamsError::OutOfBounds {
                plane: idx,
                reason: "invalid stride or height",
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::{
        dmabuf::tests::{memfd, plane_pipe, write_end_closed},
        Buffer,
    };

    const ARGB: u32 = Fourcc::Argb8888 as u32;

    fn add(params: &mut DmabufParams, idx: u32, modifier: Modifier) -> Result<(), ParamsError> {
        params.add(memfd(64 * 64 * 4), idx, 0, 64 * 4, modifier)
    }

    #[test]
    fn single_plane_commit() {
        let mut params = DmabufParams::new();
        add(&mut params, 0, Modifier::Linear).unwrap();
        let dmabuf = params.commit(64, 64, ARGB, 0).unwrap();

        assert_eq!(dmabuf.num_planes(), 1);
        assert_eq!(dmabuf.size(), (64, 64));
        assert_eq!(dmabuf.modifier(), Modifier::Linear);
        assert!(dmabuf.y_inverted());
        assert!(!params.is_building());
    }

    #[test]
    fn missing_plane_zero_is_incomplete() {
        for later in 1..MAX_PLANES as u32 {
            let mut params = DmabufParams::new();
            add(&mut params, later, Modifier::Invalid).unwrap();
            assert_eq!(
                params.commit(64, 64, ARGB, 0).unwrap_err(),
                ParamsError::Incomplete { missing_plane: 0 }
            );
        }
    }

    #[test]
    fn gaps_are_incomplete() {
        for (set, missing) in [(&[0u32, 2][..], 1u32), (&[0, 1, 3][..], 2), (&[0, 3][..], 1)] {
            let mut params = DmabufParams::new();
            for idx in set {
                add(&mut params, *idx, Modifier::Invalid).unwrap();
            }
            let err = params.commit(64, 64, ARGB, 0).unwrap_err();
            assert_eq!(err, ParamsError::Incomplete { missing_plane: missing });
            assert_eq!(err.protocol_error(), ParamsErrorCode::Incomplete);
        }
    }

    #[test]
    fn add_after_commit_or_destroy_is_already_used() {
        let mut committed = DmabufParams::new();
        add(&mut committed, 0, Modifier::Invalid).unwrap();
        committed.commit(64, 64, ARGB, 0).unwrap();
        assert_eq!(add(&mut committed, 1, Modifier::Invalid), Err(ParamsError::AlreadyUsed));
        assert_eq!(
            committed.commit(64, 64, ARGB, 0).unwrap_err(),
            ParamsError::AlreadyUsed
        );

        let mut destroyed = DmabufParams::new();
        add(&mut destroyed, 0, Modifier::Invalid).unwrap();
        destroyed.destroy();
        assert_eq!(add(&mut destroyed, 1, Modifier::Invalid), Err(ParamsError::AlreadyUsed));
    }

    #[test]
    fn failed_commit_consumes_params() {
        let mut params = DmabufParams::new();
        add(&mut params, 1, Modifier::Invalid).unwrap();
        assert!(params.commit(64, 64, ARGB, 0).is_err());
        assert_eq!(add(&mut params, 0, Modifier::Invalid), Err(ParamsError::AlreadyUsed));
    }

    #[test]
    fn plane_index_checks() {
        let mut params = DmabufParams::new();
        assert_eq!(add(&mut params, 4, Modifier::Invalid), Err(ParamsError::PlaneIndexOutOfRange(4)));
        add(&mut params, 0, Modifier::Invalid).unwrap();
        let err = add(&mut params, 0, Modifier::Invalid).unwrap_err();
        assert_eq!(err, ParamsError::PlaneAlreadySet(0));
        assert_eq!(err.protocol_error(), ParamsErrorCode::PlaneSet);
    }

    #[test]
    fn modifier_mismatch() {
        let mut params = DmabufParams::new();
        add(&mut params, 0, Modifier::Linear).unwrap();
        add(&mut params, 1, Modifier::Linear).unwrap();
        let err = add(&mut params, 2, Modifier::I915_x_tiled).unwrap_err();
        assert_eq!(
            err,
            ParamsError::ModifierMismatch {
                plane: 2,
                expected: Modifier::Linear,
                got: Modifier::I915_x_tiled,
            }
        );
        assert_eq!(err.protocol_error(), ParamsErrorCode::InvalidWlBuffer);
        // the params stay usable
        assert!(params.is_building());
    }

    #[test]
    fn unspecified_modifier_is_refined() {
        let mut params = DmabufParams::new();
        add(&mut params, 0, Modifier::Invalid).unwrap();
        add(&mut params, 1, Modifier::Linear).unwrap();
        let dmabuf = params.commit(64, 64, ARGB, 0).unwrap();
        assert_eq!(dmabuf.modifier(), Modifier::Linear);
    }

    #[test]
    fn flags() {
        let mut params = DmabufParams::new();
        add(&mut params, 0, Modifier::Invalid).unwrap();
        let dmabuf = params.commit(64, 64, ARGB, DmabufFlags::Y_INVERT.bits()).unwrap();
        assert!(!dmabuf.y_inverted());

        let mut params = DmabufParams::new();
        add(&mut params, 0, Modifier::Invalid).unwrap();
        assert_eq!(
            params.commit(64, 64, ARGB, DmabufFlags::INTERLACED.bits()).unwrap_err(),
            ParamsError::UnknownFlags(2)
        );

        let mut params = DmabufParams::new();
        add(&mut params, 0, Modifier::Invalid).unwrap();
        assert_eq!(
            params.commit(64, 64, ARGB, 0x100).unwrap_err(),
            ParamsError::UnknownFlags(0x100)
        );
    }

    #[test]
    fn format_and_dimensions() {
        let mut params = DmabufParams::new();
        add(&mut params, 0, Modifier::Invalid).unwrap();
        assert_eq!(
            params.commit(64, 64, 0xdeadbeef, 0).unwrap_err(),
            ParamsError::InvalidFormat(0xdeadbeef)
        );

        let mut params = DmabufParams::new();
        add(&mut params, 0, Modifier::Invalid).unwrap();
        let err = params.commit(0, 64, ARGB, 0).unwrap_err();
        assert_eq!(err, ParamsError::InvalidDimensions { width: 0, height: 64 });
        assert_eq!(err.protocol_error(), ParamsErrorCode::InvalidDimensions);
    }

    #[test]
    fn bounds() {
        let mut params = DmabufParams::new();
        params.add(memfd(1024), 0, 0, 256, Modifier::Invalid).unwrap();
        assert_eq!(
            params.commit(64, 64, ARGB, 0).unwrap_err(),
            ParamsError::OutOfBounds {
                plane: 0,
                reason: "invalid stride or height",
            }
        );

        let mut params = DmabufParams::new();
        params.add(memfd(1024), 0, 2048, 256, Modifier::Invalid).unwrap();
        assert!(matches!(
            params.commit(1, 1, ARGB, 0).unwrap_err(),
            ParamsError::OutOfBounds {
                reason: "invalid offset",
                ..
            }
        ));

        let mut params = DmabufParams::new();
        params.add(memfd(1024), 0, 0, u32::MAX, Modifier::Invalid).unwrap();
        assert!(matches!(
            params.commit(64, 64, ARGB, 0).unwrap_err(),
            ParamsError::OutOfBounds {
                reason: "size overflow",
                ..
            }
        ));

        // subsampled planes only need to fit one row
        let mut params = DmabufParams::new();
        params.add(memfd(64 * 256), 0, 0, 256, Modifier::Invalid).unwrap();
        params.add(memfd(256), 1, 0, 256, Modifier::Invalid).unwrap();
        assert!(params.commit(64, 64, ARGB, 0).is_ok());
    }

    #[test]
    fn destroy_closes_planes() {
        let (read, write) = plane_pipe();
        let mut params = DmabufParams::new();
        params.add(write, 0, 0, 256, Modifier::Linear).unwrap();
        assert!(!write_end_closed(&read));

        params.destroy();
        assert!(write_end_closed(&read));
    }

    #[test]
    fn rejected_commit_closes_planes() {
        let (read, write) = plane_pipe();
        let mut params = DmabufParams::new();
        params.add(write, 0, 0, 256, Modifier::Linear).unwrap();

        assert!(matches!(
            params.commit(0, 64, ARGB, 0),
            Err(ParamsError::InvalidDimensions { .. })
        ));
        assert!(write_end_closed(&read));
    }

    #[test]
    fn rejected_plane_is_closed() {
        let (read, write) = plane_pipe();
        let mut params = DmabufParams::new();
        assert!(params.add(write, 4, 0, 256, Modifier::Linear).is_err());
        assert!(write_end_closed(&read));
    }
}
