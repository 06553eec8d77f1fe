//! Catalog of the formats and modifiers the GPU can import.
//!
//! A [`FormatCatalog`] is built once per GPU session and is immutable afterwards.
//! Its entries are serialized into a sealed, read-only memory file following the
//! `linux-dmabuf` format table layout, so the same file descriptor can be handed
//! to any number of clients:
//!
//! ```text
//! [ 32 bit format ][ 32 bit padding ][ 64 bit modifier ]
//! ```
//!
//! Entries are addressed by their 16-bit table index, which equals their insertion order.

use std::os::unix::io::{AsFd, BorrowedFd};

use indexmap::IndexSet;
use tracing::{debug, info, trace, warn};

use super::{format::SUPPORTED_FORMATS, Format, Fourcc, Modifier};
use crate::{backend::renderer::GpuContext, utils::SealedFile};

const TABLE_ENTRY_SIZE: usize = 16;

/// A single importable (format, modifier) combination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatEntry {
    /// Fourcc code of the format
    pub code: Fourcc,
    /// Layout modifier, [`Modifier::Invalid`] for the unspecified layout
    pub modifier: Modifier,
    /// Position in the serialized table
    pub table_index: u16,
}

impl FormatEntry {
    /// The (format, modifier) pair of this entry
    pub fn format(&self) -> Format {
        Format {
            code: self.code,
            modifier: self.modifier,
        }
    }
}

/// Errors of building a [`FormatCatalog`]
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The driver could not be queried for importable formats
    #[error("Failed to query the driver for dmabuf formats")]
    Query(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// None of the formats known to the compositor is importable
    #[error("The driver supports none of the known dmabuf formats")]
    NoFormats,
    /// The shared format table could not be created
    #[error("Failed to create the format table: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordered, immutable table of importable formats
#[derive(Debug)]
pub struct FormatCatalog {
    entries: Vec<FormatEntry>,
    table: SealedFile,
    modifiers_advertised: bool,
}

impl FormatCatalog {
    /// Query the driver of `gpu` for every known format and its modifiers.
    ///
    /// With `advertise_modifiers` unset (e.g. on secondary or unaccelerated paths) only the
    /// unspecified layout is advertised for every format. The same happens for formats whose
    /// modifiers cannot be queried.
    ///
    /// Fails, if not a single format is importable.
    #[profiling::function]
    pub fn build<G: GpuContext>(gpu: &G, advertise_modifiers: bool) -> Result<FormatCatalog, CatalogError> {
        let driver_formats = gpu
            .dmabuf_formats()
            .map_err(|err| CatalogError::Query(Box::new(err)))?;

        let mut formats = Vec::new();
        for &code in SUPPORTED_FORMATS {
            if !driver_formats.contains(&code) {
                trace!(format = ?code, "Format not importable by the driver");
                continue;
            }

            let modifiers = if advertise_modifiers {
                match gpu.dmabuf_modifiers(code) {
                    Ok(Some(modifiers)) => modifiers,
                    Ok(None) => Vec::new(),
                    Err(err) => {
                        warn!(?err, format = ?code, "Failed to query modifiers");
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };

            if modifiers.is_empty() {
                debug!(format = ?code, "Advertising unspecified modifier only");
                formats.push(Format {
                    code,
                    modifier: Modifier::Invalid,
                });
            } else {
                formats.extend(modifiers.into_iter().map(|modifier| Format { code, modifier }));
            }
        }

        let catalog = FormatCatalog::from_formats(formats, advertise_modifiers)?;
        info!(entries = catalog.entries.len(), "Built dmabuf format catalog");
        Ok(catalog)
    }

    /// Create a catalog from an explicit list of formats.
    ///
    /// Duplicate (format, modifier) pairs are dropped, the remaining order is preserved.
    pub fn from_formats(
        formats: impl IntoIterator<Item = Format>,
        modifiers_advertised: bool,
    ) -> Result<FormatCatalog, CatalogError> {
        let formats = formats.into_iter().collect::<IndexSet<_>>();
        if formats.is_empty() {
            return Err(CatalogError::NoFormats);
        }

        let max_entries = u16::MAX as usize + 1;
        if formats.len() > max_entries {
            warn!(
                dropped = formats.len() - max_entries,
                "Format table exceeds the addressable range, dropping entries"
            );
        }

        let entries = formats
            .into_iter()
            .take(max_entries)
            .enumerate()
            .map(|(idx, format)| FormatEntry {
                code: format.code,
                modifier: format.modifier,
                table_index: idx as u16,
            })
            .collect::<Vec<_>>();

        let data = serialize(&entries);
        let table = SealedFile::with_data("dmabuf-format-table", &data)?;

        Ok(FormatCatalog {
            entries,
            table,
            modifiers_advertised,
        })
    }

    /// All entries in table order
    pub fn entries(&self) -> &[FormatEntry] {
        &self.entries
    }

    /// Look up an entry by its table index
    pub fn get(&self, table_index: u16) -> Option<&FormatEntry> {
        self.entries.get(table_index as usize)
    }

    /// Table index of a (format, modifier) pair
    pub fn index_of(&self, format: &Format) -> Option<u16> {
        self.entries
            .iter()
            .find(|entry| entry.code == format.code && entry.modifier == format.modifier)
            .map(|entry| entry.table_index)
    }

    /// Every table index, in order
    pub fn indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries.iter().map(|entry| entry.table_index)
    }

    /// Distinct fourcc codes in order of their first appearance
    pub fn codes(&self) -> impl Iterator<Item = Fourcc> {
        self.entries
            .iter()
            .map(|entry| entry.code)
            .collect::<IndexSet<_>>()
            .into_iter()
    }

    /// Returns true if real modifiers were queried when building this catalog
    pub fn modifiers_advertised(&self) -> bool {
        self.modifiers_advertised
    }

    /// Read-only descriptor of the serialized table
    pub fn table_fd(&self) -> BorrowedFd<'_> {
        self.table.as_fd()
    }

    /// Size of the serialized table in bytes
    pub fn table_size(&self) -> u32 {
        self.table.size() as u32
    }
}

fn serialize(entries: &[FormatEntry]) -> Vec<u8> {
    let mut data = Vec::with_capacity(entries.len() * TABLE_ENTRY_SIZE);
    for entry in entries {
        data.extend_from_slice(&(entry.code as u32).to_ne_bytes());
        data.extend_from_slice(&0u32.to_ne_bytes());
        data.extend_from_slice(&u64::from(entry.modifier).to_ne_bytes());
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::renderer::test::DummyGpu;

    fn read_table(catalog: &FormatCatalog) -> Vec<u8> {
        let mut data = vec![0u8; catalog.table_size() as usize];
        let read = rustix::io::pread(catalog.table_fd(), &mut data, 0).unwrap();
        assert_eq!(read, data.len());
        data
    }

    fn scenario_gpu() -> DummyGpu {
        DummyGpu::new(None)
            .with_format(
                Fourcc::Argb8888,
                Some(vec![Modifier::Linear, Modifier::I915_x_tiled]),
            )
            .with_format(Fourcc::Xrgb8888, None)
    }

    #[test]
    fn modifiers_and_fallback() {
        let catalog = FormatCatalog::build(&scenario_gpu(), true).unwrap();
        let formats = catalog.entries().iter().map(|e| e.format()).collect::<Vec<_>>();
        assert_eq!(
            formats,
            vec![
                Format {
                    code: Fourcc::Argb8888,
                    modifier: Modifier::Linear
                },
                Format {
                    code: Fourcc::Argb8888,
                    modifier: Modifier::I915_x_tiled
                },
                Format {
                    code: Fourcc::Xrgb8888,
                    modifier: Modifier::Invalid
                },
            ]
        );
        assert_eq!(catalog.indices().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(catalog.modifiers_advertised());
    }

    #[test]
    fn disabled_modifiers_use_fallback() {
        let catalog = FormatCatalog::build(&scenario_gpu(), false).unwrap();
        assert_eq!(catalog.entries().len(), 2);
        assert!(catalog.entries().iter().all(|e| e.modifier == Modifier::Invalid));
        assert!(!catalog.modifiers_advertised());
    }

    #[test]
    fn empty_modifier_list_uses_fallback() {
        let gpu = DummyGpu::new(None).with_format(Fourcc::Abgr8888, Some(Vec::new()));
        let catalog = FormatCatalog::build(&gpu, true).unwrap();
        assert_eq!(
            catalog.entries(),
            &[FormatEntry {
                code: Fourcc::Abgr8888,
                modifier: Modifier::Invalid,
                table_index: 0,
            }]
        );
    }

    #[test]
    fn unknown_driver_formats_are_skipped() {
        let gpu = DummyGpu::new(None).with_format(Fourcc::Nv12, Some(vec![Modifier::Linear]));
        assert!(matches!(
            FormatCatalog::build(&gpu, true),
            Err(CatalogError::NoFormats)
        ));
    }

    #[test]
    fn failing_driver_is_reported() {
        let mut gpu = scenario_gpu();
        gpu.failing_queries = true;
        assert!(matches!(
            FormatCatalog::build(&gpu, true),
            Err(CatalogError::Query(_))
        ));
    }

    #[test]
    fn catalog_order_follows_known_formats() {
        let gpu = DummyGpu::new(None)
            .with_format(Fourcc::Rgb565, None)
            .with_format(Fourcc::Xbgr8888, None)
            .with_format(Fourcc::Argb8888, None);
        let catalog = FormatCatalog::build(&gpu, true).unwrap();
        assert_eq!(
            catalog.codes().collect::<Vec<_>>(),
            vec![Fourcc::Argb8888, Fourcc::Xbgr8888, Fourcc::Rgb565]
        );
    }

    #[test]
    fn serialized_table_layout() {
        let catalog = FormatCatalog::build(&scenario_gpu(), true).unwrap();
        let data = read_table(&catalog);
        assert_eq!(data.len(), 3 * TABLE_ENTRY_SIZE);

        for entry in catalog.entries() {
            let offset = entry.table_index as usize * TABLE_ENTRY_SIZE;
            let record = &data[offset..offset + TABLE_ENTRY_SIZE];
            let code = u32::from_ne_bytes(record[0..4].try_into().unwrap());
            let pad = u32::from_ne_bytes(record[4..8].try_into().unwrap());
            let modifier = u64::from_ne_bytes(record[8..16].try_into().unwrap());
            assert_eq!(code, entry.code as u32);
            assert_eq!(pad, 0);
            assert_eq!(Modifier::from(modifier), entry.modifier);
            assert_eq!(catalog.get(entry.table_index), Some(entry));
            assert_eq!(catalog.index_of(&entry.format()), Some(entry.table_index));
        }
    }

    #[test]
    fn duplicates_are_dropped() {
        let format = Format {
            code: Fourcc::Xrgb8888,
            modifier: Modifier::Linear,
        };
        let catalog = FormatCatalog::from_formats([format, format], true).unwrap();
        assert_eq!(catalog.entries().len(), 1);
        assert_eq!(catalog.table_size() as usize, TABLE_ENTRY_SIZE);
    }
}
