//! Format feedback negotiation
//!
//! A [`DmabufFeedback`] tells clients which device to allocate on and which entries of the
//! [`FormatCatalog`] to prefer, grouped into prioritized [`FeedbackTranche`]s.
//!
//! The [`FeedbackNegotiator`] keeps one default feedback shared by all clients and a lazily
//! created copy per surface. A surface copy gains a scanout tranche while the surface is a
//! direct scanout candidate, and every subscriber of the surface is re-sent the feedback
//! whenever that tranche changes.
//!
//! Clients bound at protocol versions without feedback objects receive
//! [`announce_legacy`] instead.

use std::{collections::HashMap, hash::Hash, os::unix::io::BorrowedFd, sync::Arc};

use rustix::fs::Dev;
use tracing::{debug, instrument, trace};

use crate::backend::{
    allocator::{catalog::FormatCatalog, Modifier},
    drm::{CrtcId, ScanoutOutput},
};

/// Priority of tranches clients should try first
pub const TRANCHE_PRIORITY_HIGH: u32 = 0;
/// Priority of the tranche containing every catalog entry
pub const TRANCHE_PRIORITY_DEFAULT: u32 = 10;

bitflags::bitflags! {
    /// Flags of a feedback tranche
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TrancheFlags: u32 {
        /// Buffers allocated from this tranche are suitable for direct scanout
        const SCANOUT = 1;
    }
}

/// A prioritized, device-scoped subset of the format table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackTranche {
    target_device: Dev,
    indices: Vec<u16>,
    priority: u32,
    flags: TrancheFlags,
    scanout_crtc: Option<CrtcId>,
}

impl FeedbackTranche {
    /// Device buffers of this tranche should be allocated on
    pub fn target_device(&self) -> Dev {
        self.target_device
    }

    /// Table indices of the contained formats
    pub fn indices(&self) -> &[u16] {
        &self.indices
    }

    /// Priority, lower values are preferred
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Flags of this tranche
    pub fn flags(&self) -> TrancheFlags {
        self.flags
    }

    /// Crtc a scanout tranche was computed for
    pub fn scanout_crtc(&self) -> Option<CrtcId> {
        self.scanout_crtc
    }
}

/// Receiver of feedback events, usually a `zwp_linux_dmabuf_feedback_v1` resource
pub trait FeedbackSink {
    /// Send the format table
    fn format_table(&self, fd: BorrowedFd<'_>, size: u32);
    /// Send the main device
    fn main_device(&self, device: Vec<u8>);
    /// Send the target device of the current tranche
    fn tranche_target_device(&self, device: Vec<u8>);
    /// Send the flags of the current tranche
    fn tranche_flags(&self, flags: TrancheFlags);
    /// Send the table indices of the current tranche
    fn tranche_formats(&self, indices: Vec<u8>);
    /// Finish the current tranche
    fn tranche_done(&self);
    /// Finish the feedback
    fn done(&self);
}

/// Receiver of format announcements for protocol versions without feedback objects
pub trait FormatAnnouncer {
    /// Announce a format code
    fn format(&self, format: u32);
    /// Announce a modifier of an already announced format
    fn modifier(&self, format: u32, modifier_hi: u32, modifier_lo: u32);
}

/// Device identity and prioritized tranches offered to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmabufFeedback {
    main_device: Dev,
    tranches: Vec<FeedbackTranche>,
}

impl DmabufFeedback {
    /// Feedback with a single default tranche referencing every catalog entry
    pub fn default_for(catalog: &FormatCatalog, main_device: Dev) -> DmabufFeedback {
        DmabufFeedback {
            main_device,
            tranches: vec![FeedbackTranche {
                target_device: main_device,
                indices: catalog.indices().collect(),
                priority: TRANCHE_PRIORITY_DEFAULT,
                flags: TrancheFlags::empty(),
                scanout_crtc: None,
            }],
        }
    }

    /// The main device
    pub fn main_device(&self) -> Dev {
        self.main_device
    }

    /// Tranches in ascending priority
    pub fn tranches(&self) -> &[FeedbackTranche] {
        &self.tranches
    }

    /// The scanout tranche, if present
    pub fn scanout_tranche(&self) -> Option<&FeedbackTranche> {
        self.tranches
            .iter()
            .find(|tranche| tranche.flags.contains(TrancheFlags::SCANOUT))
    }

    /// Insert a tranche, keeping ascending priority order
    ///
    /// Tranches of equal priority keep their insertion order.
    pub fn add_tranche(&mut self, tranche: FeedbackTranche) {
        let pos = self
            .tranches
            .iter()
            .position(|existing| existing.priority > tranche.priority)
            .unwrap_or(self.tranches.len());
        self.tranches.insert(pos, tranche);
    }

    /// Remove the scanout tranche, returns true if one existed
    pub fn clear_scanout_tranche(&mut self) -> bool {
        let len = self.tranches.len();
        self.tranches
            .retain(|tranche| !tranche.flags.contains(TrancheFlags::SCANOUT));
        len != self.tranches.len()
    }

    /// Send the whole feedback to `sink`
    #[instrument(level = "trace", skip_all)]
    pub fn send(&self, catalog: &FormatCatalog, sink: &impl FeedbackSink) {
        sink.format_table(catalog.table_fd(), catalog.table_size());
        sink.main_device(device_bytes(self.main_device));
        for tranche in &self.tranches {
            sink.tranche_target_device(device_bytes(tranche.target_device));
            sink.tranche_flags(tranche.flags);
            sink.tranche_formats(
                tranche
                    .indices
                    .iter()
                    .flat_map(|index| index.to_ne_bytes())
                    .collect(),
            );
            sink.tranche_done();
        }
        sink.done();
    }
}

fn device_bytes(device: Dev) -> Vec<u8> {
    device.to_ne_bytes().to_vec()
}

/// Compute the scanout tranche of `output`
///
/// With modifiers advertised every catalog entry the output accepts is offered, otherwise only
/// entries with unspecified layout whose format the output accepts. Returns `None` if nothing
/// would be offered.
pub fn scanout_tranche(
    catalog: &FormatCatalog,
    main_device: Dev,
    output: &(impl ScanoutOutput + ?Sized),
) -> Option<FeedbackTranche> {
    let indices = catalog
        .entries()
        .iter()
        .filter(|entry| {
            if catalog.modifiers_advertised() {
                output.supports_modifier(entry.code, entry.modifier)
            } else {
                entry.modifier == Modifier::Invalid && output.supports_format(entry.code)
            }
        })
        .map(|entry| entry.table_index)
        .collect::<Vec<_>>();

    if indices.is_empty() {
        return None;
    }

    Some(FeedbackTranche {
        target_device: main_device,
        indices,
        priority: TRANCHE_PRIORITY_HIGH,
        flags: TrancheFlags::SCANOUT,
        scanout_crtc: Some(output.crtc_id()),
    })
}

/// Announce the catalog to a client bound at a version without feedback objects
///
/// Every format code is announced once, in order of its first catalog entry, directly followed
/// by all of its modifiers. Modifiers are only sent if `send_modifiers` is set.
pub fn announce_legacy(catalog: &FormatCatalog, announcer: &impl FormatAnnouncer, send_modifiers: bool) {
    for code in catalog.codes() {
        announcer.format(code as u32);
        if !send_modifiers {
            continue;
        }

        for entry in catalog.entries().iter().filter(|entry| entry.code == code) {
            let modifier = u64::from(entry.modifier);
            announcer.modifier(code as u32, (modifier >> 32) as u32, (modifier & 0xFFFFFFFF) as u32);
        }
    }
}

#[derive(Debug)]
struct SurfaceFeedback<S> {
    feedback: DmabufFeedback,
    subscribers: Vec<S>,
}

/// Default and per-surface feedback bookkeeping
///
/// `K` identifies a surface, `S` is a subscribed feedback resource.
#[derive(Debug)]
pub struct FeedbackNegotiator<K, S> {
    catalog: Arc<FormatCatalog>,
    default: DmabufFeedback,
    surfaces: HashMap<K, SurfaceFeedback<S>>,
}

impl<K, S> FeedbackNegotiator<K, S>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    S: FeedbackSink + PartialEq,
{
    /// Build the default feedback for `catalog`
    pub fn new(catalog: Arc<FormatCatalog>, main_device: Dev) -> Self {
        let default = DmabufFeedback::default_for(&catalog, main_device);
        FeedbackNegotiator {
            catalog,
            default,
            surfaces: HashMap::new(),
        }
    }

    /// The catalog feedback is computed from
    pub fn catalog(&self) -> &Arc<FormatCatalog> {
        &self.catalog
    }

    /// The feedback shared by every client not referencing a surface
    pub fn default_feedback(&self) -> &DmabufFeedback {
        &self.default
    }

    /// Send the default feedback once
    pub fn send_default(&self, sink: &S) {
        self.default.send(&self.catalog, sink);
    }

    /// The cached feedback of a surface, if any client holds one
    pub fn surface_feedback(&self, surface: &K) -> Option<&DmabufFeedback> {
        self.surfaces.get(surface).map(|surface| &surface.feedback)
    }

    /// Number of subscribers of a surface
    pub fn subscriber_count(&self, surface: &K) -> usize {
        self.surfaces
            .get(surface)
            .map(|surface| surface.subscribers.len())
            .unwrap_or(0)
    }

    fn ensure(&mut self, surface: &K) -> &mut SurfaceFeedback<S> {
        let default = &self.default;
        self.surfaces.entry(surface.clone()).or_insert_with(|| {
            trace!(?surface, "Creating surface feedback");
            SurfaceFeedback {
                feedback: default.clone(),
                subscribers: Vec::new(),
            }
        })
    }

    /// Subscribe `sink` to the feedback of `surface` and send the current feedback
    pub fn subscribe(&mut self, surface: &K, sink: S) {
        let catalog = self.catalog.clone();
        let entry = self.ensure(surface);
        entry.feedback.send(&catalog, &sink);
        entry.subscribers.push(sink);
    }

    /// Remove `sink` from the subscribers of `surface`
    ///
    /// The surface feedback is dropped together with its last subscriber.
    pub fn unsubscribe(&mut self, surface: &K, sink: &S) {
        let Some(entry) = self.surfaces.get_mut(surface) else {
            return;
        };
        entry.subscribers.retain(|subscriber| subscriber != sink);
        if entry.subscribers.is_empty() {
            trace!(?surface, "Dropping surface feedback");
            self.surfaces.remove(surface);
        }
    }

    /// Update the scanout tranche of a surface after its scanout candidacy changed.
    ///
    /// `output` is the output the surface is now a candidate for, or `None`. The tranche is
    /// recomputed from scratch. If the resulting tranches differ from the current ones, every
    /// subscriber receives the new feedback and `true` is returned.
    #[instrument(level = "trace", skip(self, output), fields(crtc = ?output.map(|o| o.crtc_id())))]
    #[profiling::function]
    pub fn scanout_candidate_changed(&mut self, surface: &K, output: Option<&dyn ScanoutOutput>) -> bool {
        let Some(entry) = self.surfaces.get_mut(surface) else {
            return false;
        };

        let mut updated = entry.feedback.clone();
        updated.clear_scanout_tranche();
        if let Some(output) = output {
            match scanout_tranche(&self.catalog, updated.main_device, output) {
                Some(tranche) => updated.add_tranche(tranche),
                None => debug!(crtc = %output.crtc_id(), "Output accepts none of the catalog formats"),
            }
        }

        if updated == entry.feedback {
            return false;
        }

        entry.feedback = updated;
        for subscriber in &entry.subscribers {
            entry.feedback.send(&self.catalog, subscriber);
        }
        trace!(subscribers = entry.subscribers.len(), "Re-sent surface feedback");
        true
    }

    /// Forget the feedback of a destroyed surface
    ///
    /// Remaining subscribers stay valid, but receive no further updates.
    pub fn surface_destroyed(&mut self, surface: &K) {
        self.surfaces.remove(surface);
    }
}
