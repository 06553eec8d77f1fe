//! Reexports of crates, that are part of the public api, for convenience

#[cfg(feature = "backend_gbm")]
pub use drm;
pub use drm_fourcc;
#[cfg(feature = "backend_gbm")]
pub use gbm;
pub use rustix;
#[cfg(feature = "wayland_frontend")]
pub use wayland_protocols;
#[cfg(feature = "wayland_frontend")]
pub use wayland_server;
