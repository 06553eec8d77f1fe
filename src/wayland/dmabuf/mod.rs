//! Linux DMABUF protocol
//!
//! This module provides helpers to handle the `linux-dmabuf` protocol, which allows clients to submit their
//! contents as dmabuf file descriptors.
//!
//! - [`DmabufParams`] aggregates the planes of a submission and validates them
//! - [`FeedbackNegotiator`] advertises the
//!   [`FormatCatalog`](crate::backend::allocator::catalog::FormatCatalog) to clients and keeps
//!   per-surface scanout tranches up to date
//!
//! With the `wayland_frontend` feature, [`DmabufState`] additionally drives these for a `wayland-server`
//! display.
//!
//! ## How to use
//!
//! ```ignore
//! # extern crate wayland_server;
//! use std::sync::Arc;
//! use wl_dmabuf::{
//!     delegate_dmabuf,
//!     backend::{allocator::catalog::FormatCatalog, renderer::GpuContext},
//!     wayland::dmabuf::{DmabufGlobal, DmabufHandler, DmabufState},
//! };
//! # use wl_dmabuf::backend::renderer::test::DummyGpu as MyGpu;
//!
//! pub struct State {
//!     dmabuf_state: DmabufState,
//!     gpu: MyGpu,
//! }
//!
//! impl DmabufHandler for State {
//!     type Gpu = MyGpu;
//!
//!     fn dmabuf_state(&mut self) -> &mut DmabufState {
//!         &mut self.dmabuf_state
//!     }
//!
//!     fn gpu_context(&mut self) -> &mut MyGpu {
//!         &mut self.gpu
//!     }
//! }
//!
//! // Delegate dmabuf handling for State to DmabufState.
//! delegate_dmabuf!(State);
//!
//! # let gpu = MyGpu::new(None);
//! # let mut display = wayland_server::Display::<State>::new().unwrap();
//! # let display_handle = display.handle();
//! // The catalog is built once per gpu session
//! let catalog = Arc::new(FormatCatalog::build(&gpu, true).expect("No usable dmabuf formats"));
//! let mut dmabuf_state = DmabufState::new(catalog, gpu.render_device());
//! let dmabuf_global = dmabuf_state.create_global::<State>(&display_handle);
//!
//! let state = State { dmabuf_state, gpu };
//!
//! // Rest of the compositor goes here...
//! // Whenever a surface becomes (or stops being) a direct scanout candidate, call
//! // `DmabufState::surface_scanout_candidate_changed` to update its feedback.
//! ```

mod feedback;
mod params;

#[cfg(feature = "wayland_frontend")]
mod dispatch;
#[cfg(feature = "wayland_frontend")]
mod global;

pub use self::feedback::{
    announce_legacy, scanout_tranche, DmabufFeedback, FeedbackNegotiator, FeedbackSink, FeedbackTranche,
    FormatAnnouncer, TrancheFlags, TRANCHE_PRIORITY_DEFAULT, TRANCHE_PRIORITY_HIGH,
};
pub use self::params::{DmabufParams, ParamsError, ParamsErrorCode};

#[cfg(feature = "wayland_frontend")]
pub use self::global::{
    get_dmabuf, DmabufData, DmabufFeedbackData, DmabufGlobal, DmabufGlobalData, DmabufHandler,
    DmabufParamsData, DmabufState, FEEDBACK_VERSION, LEGACY_VERSION,
};
