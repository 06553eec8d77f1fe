//! Format info tables for the DRM formats the compositor knows how to texture.
//!
//! The table is closed: only formats listed here can ever be realized as textures,
//! and [`SUPPORTED_FORMATS`] lists them in the order they are probed and advertised.
//!
//! [`get_opaque`] returns the opaque alternative of a DRM format with an alpha channel.
//!
//! ```
//! # use wl_dmabuf::backend::allocator::Fourcc;
//! # use wl_dmabuf::backend::allocator::format::get_opaque;
//! assert_eq!(Some(Fourcc::Xrgb8888), get_opaque(Fourcc::Argb8888));
//! ```
//!
//! [`has_alpha`] returns true if the format has an alpha channel.
//!
//! ```
//! # use wl_dmabuf::backend::allocator::Fourcc;
//! # use wl_dmabuf::backend::allocator::format::has_alpha;
//! assert!(has_alpha(Fourcc::Argb8888));
//! assert!(!has_alpha(Fourcc::Xrgb8888));
//! ```
//!
//! [`get_bpp`] returns the number of bits per pixel of a format.
//!
//! ```
//! # use wl_dmabuf::backend::allocator::Fourcc;
//! # use wl_dmabuf::backend::allocator::format::get_bpp;
//! assert_eq!(get_bpp(Fourcc::Argb8888), Some(32));
//! assert_eq!(get_bpp(Fourcc::Rgb565), Some(16));
//! ```
//!
//! [`pixel_format`] maps a format to the component ordering used for texturing.
//!
//! ```
//! # use wl_dmabuf::backend::allocator::Fourcc;
//! # use wl_dmabuf::backend::allocator::format::{pixel_format, PixelFormat};
//! assert_eq!(pixel_format(Fourcc::Xbgr8888), Some(PixelFormat::Xbgr8888));
//! assert_eq!(pixel_format(Fourcc::Nv12), None);
//! ```

use std::sync::Arc;

use super::Format;
use indexmap::IndexSet;

/// Component ordering of a realized texture.
///
/// This only describes how the channels of a texel are to be interpreted by the
/// rendering pipeline. Memory layout (tiling, compression, plane arrangement) is
/// described by the fourcc code and modifier and interpreted by the GPU driver.
///
/// Formats carrying alpha are always treated as premultiplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit red, green, blue, padding
    Xrgb8888,
    /// 8-bit premultiplied alpha, red, green, blue
    Argb8888Premultiplied,
    /// 8-bit blue, green, red, padding
    Xbgr8888,
    /// 8-bit premultiplied alpha, blue, green, red
    Abgr8888Premultiplied,
    /// 10-bit red, green, blue, 2-bit padding
    Xrgb2101010,
    /// 10-bit red, green, blue, 2-bit premultiplied alpha
    Argb2101010Premultiplied,
    /// 10-bit blue, green, red, 2-bit padding
    Xbgr2101010,
    /// 10-bit blue, green, red, 2-bit premultiplied alpha
    Abgr2101010Premultiplied,
    /// 5-bit red, 6-bit green, 5-bit blue
    Rgb565,
    /// 16-bit float red, green, blue, padding
    Xrgb16161616f,
    /// 16-bit float premultiplied alpha, red, green, blue
    Argb16161616fPremultiplied,
    /// 16-bit float blue, green, red, padding
    Xbgr16161616f,
    /// 16-bit float premultiplied alpha, blue, green, red
    Abgr16161616fPremultiplied,
}

impl PixelFormat {
    /// Returns true if the texel has a (premultiplied) alpha component.
    pub fn has_alpha(&self) -> bool {
        matches!(
            self,
            PixelFormat::Argb8888Premultiplied
                | PixelFormat::Abgr8888Premultiplied
                | PixelFormat::Argb2101010Premultiplied
                | PixelFormat::Abgr2101010Premultiplied
                | PixelFormat::Argb16161616fPremultiplied
                | PixelFormat::Abgr16161616fPremultiplied
        )
    }
}

/// Macro to generate table lookup functions for formats.
///
/// See the module documentation for usage details.
macro_rules! format_tables {
    (
        $($fourcc: ident {
            $(opaque: $opaque: ident,)?
            alpha: $alpha: expr,
            bpp: $bpp: expr,
            pixel: $pixel: ident $(,)?
        }),* $(,)?
    ) => {
        /// Formats the compositor can realize as textures, in probing order.
        pub const SUPPORTED_FORMATS: &[$crate::backend::allocator::Fourcc] = &[
            $(
                $crate::backend::allocator::Fourcc::$fourcc,
            )*
        ];

        /// Returns the opaque alternative of the specified format.
        ///
        /// If the format has an alpha channel, this may return the corresponding opaque format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_opaque(
            fourcc: $crate::backend::allocator::Fourcc,
        ) -> Option<$crate::backend::allocator::Fourcc> {
            match fourcc {
                $($(
                    $crate::backend::allocator::Fourcc::$fourcc
                        => Some($crate::backend::allocator::Fourcc::$opaque),
                )?)*
                _ => None,
            }
        }

        /// Returns the transparent alternative of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_transparent(
            fourcc: $crate::backend::allocator::Fourcc,
        ) -> Option<$crate::backend::allocator::Fourcc> {
            match fourcc {
                $($(
                    $crate::backend::allocator::Fourcc::$opaque
                        => Some($crate::backend::allocator::Fourcc::$fourcc),
                )?)*
                _ => None,
            }
        }

        /// Returns true if the format has an alpha channel.
        ///
        /// Unknown formats will always return `false`.
        pub const fn has_alpha(fourcc: $crate::backend::allocator::Fourcc) -> bool {
            match fourcc {
                $(
                    $crate::backend::allocator::Fourcc::$fourcc => $alpha,
                )*
                _ => false,
            }
        }

        /// Returns the bits per pixel of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_bpp(
            fourcc: $crate::backend::allocator::Fourcc,
        ) -> Option<usize> {
            match fourcc {
                $($crate::backend::allocator::Fourcc::$fourcc => Some($bpp),)*
                _ => None,
            }
        }

        /// Returns the texture component ordering of the specified format.
        ///
        /// Formats the compositor cannot texture return [`None`].
        pub const fn pixel_format(
            fourcc: $crate::backend::allocator::Fourcc,
        ) -> Option<PixelFormat> {
            match fourcc {
                $($crate::backend::allocator::Fourcc::$fourcc => Some(PixelFormat::$pixel),)*
                _ => None,
            }
        }
    };
}

format_tables! {
    // 8 bpc
    Argb8888 {
        opaque: Xrgb8888,
        alpha: true,
        bpp: 32,
        pixel: Argb8888Premultiplied,
    },
    Abgr8888 {
        opaque: Xbgr8888,
        alpha: true,
        bpp: 32,
        pixel: Abgr8888Premultiplied,
    },
    Xrgb8888 { alpha: false, bpp: 32, pixel: Xrgb8888 },
    Xbgr8888 { alpha: false, bpp: 32, pixel: Xbgr8888 },

    // 10 bpc
    Argb2101010 {
        opaque: Xrgb2101010,
        alpha: true,
        bpp: 32,
        pixel: Argb2101010Premultiplied,
    },
    Abgr2101010 {
        opaque: Xbgr2101010,
        alpha: true,
        bpp: 32,
        pixel: Abgr2101010Premultiplied,
    },
    Xrgb2101010 { alpha: false, bpp: 32, pixel: Xrgb2101010 },
    Xbgr2101010 { alpha: false, bpp: 32, pixel: Xbgr2101010 },

    // packed 16 bpp
    Rgb565 { alpha: false, bpp: 16, pixel: Rgb565 },

    // 16 bpc floating point
    Abgr16161616f {
        opaque: Xbgr16161616f,
        alpha: true,
        bpp: 64,
        pixel: Abgr16161616fPremultiplied,
    },
    Xbgr16161616f { alpha: false, bpp: 64, pixel: Xbgr16161616f },
    Xrgb16161616f { alpha: false, bpp: 64, pixel: Xrgb16161616f },
    Argb16161616f {
        opaque: Xrgb16161616f,
        alpha: true,
        bpp: 64,
        pixel: Argb16161616fPremultiplied,
    },
}

/// Immutable, cheaply clonable set of [`Format`]s
///
/// Insertion order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatSet {
    formats: Arc<IndexSet<Format>>,
}

impl FormatSet {
    /// Returns true if the set contains the given format.
    pub fn contains(&self, format: &Format) -> bool {
        self.formats.contains(format)
    }

    /// Returns true if the set contains any modifier for the given fourcc code.
    pub fn contains_code(&self, code: super::Fourcc) -> bool {
        self.formats.iter().any(|f| f.code == code)
    }

    /// Iterate over the contained formats
    pub fn iter(&self) -> impl Iterator<Item = &Format> + '_ {
        self.formats.iter()
    }

    /// Amount of contained formats
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// Returns true if the set is empty
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}

impl FromIterator<Format> for FormatSet {
    #[inline]
    fn from_iter<T: IntoIterator<Item = Format>>(iter: T) -> Self {
        Self {
            formats: Arc::new(IndexSet::from_iter(iter)),
        }
    }
}
