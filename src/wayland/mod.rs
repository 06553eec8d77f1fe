//! Protocol-related utilities
//!
//! This module contains the compositor side of the `linux-dmabuf` protocol family.
//!
//! The protocol logic itself (params assembly, feedback negotiation) does not depend on
//! `wayland-server` and can be driven by any dispatch layer. With the `wayland_frontend`
//! feature, [`dmabuf`] additionally provides a ready-to-use global for `wayland-server`.

pub mod dmabuf;
