#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like DRM
#![allow(clippy::upper_case_acronyms)]

//! # wl-dmabuf: dmabuf buffer sharing for wayland compositors
//!
//! This crate implements the buffer-sharing subsystem of a wayland compositor: it accepts GPU buffers
//! submitted by clients as dmabuf file descriptors, negotiates which formats and modifiers the
//! compositor's GPU can consume, imports those buffers as textures and, where the hardware allows it,
//! hands them directly to the display controller for zero-copy scanout.
//!
//! ## Structure of the crate
//!
//! The provided helpers are split into two main modules:
//!
//! - [`backend`] contains everything that talks to the graphics stack: the
//!   [`Dmabuf`](backend::allocator::dmabuf::Dmabuf) buffer object, the
//!   [`FormatCatalog`](backend::allocator::catalog::FormatCatalog) of importable formats, texture
//!   realization through a [`GpuContext`](backend::renderer::GpuContext) and best-effort direct
//!   scanout through [`try_acquire_scanout`](backend::drm::scanout::try_acquire_scanout).
//! - [`wayland`] contains the protocol-facing logic of `linux-dmabuf`: the buffer params state machine,
//!   format feedback negotiation and (with the `wayland_frontend` feature) the `wayland-server` glue.
//!
//! The GPU rendering context, the display/KMS output abstraction and the generic surface tree are external
//! collaborators. This crate only describes them as traits, the compositor provides the implementations.
//!
//! ## Threading
//!
//! Everything in this crate is meant to run on the compositor's event-processing thread. Buffer import and
//! feedback recomputation are synchronous, there is no deferred import path.
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod utils;
pub mod wayland;

pub mod reexports;
