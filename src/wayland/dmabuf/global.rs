use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use rustix::fs::Dev;
use tracing::{debug, info};
use wayland_protocols::wp::linux_dmabuf::zv1::server::{
    zwp_linux_dmabuf_feedback_v1, zwp_linux_dmabuf_v1,
};
use wayland_server::{
    backend::{GlobalId, ObjectId},
    protocol::{wl_buffer::WlBuffer, wl_surface::WlSurface},
    Client, DisplayHandle, GlobalDispatch, Resource,
};

use super::{
    feedback::{DmabufFeedback, FeedbackNegotiator},
    params::{DmabufParams, ParamsError},
};
use crate::{
    backend::{
        allocator::{catalog::FormatCatalog, dmabuf::Dmabuf, Modifier},
        drm::ScanoutOutput,
        renderer::{GpuContext, ImportDma, ImportError},
    },
    utils::UnmanagedResource,
};

/// Protocol version offering feedback objects
pub const FEEDBACK_VERSION: u32 = 4;
/// Highest protocol version without feedback objects
pub const LEGACY_VERSION: u32 = 3;

static NEXT_GLOBAL_ID: AtomicUsize = AtomicUsize::new(0);

/// Delegate type for all dmabuf globals.
///
/// Owns the shared [`FormatCatalog`] and the feedback bookkeeping of every surface.
#[derive(Debug)]
pub struct DmabufState {
    pub(super) catalog: Arc<FormatCatalog>,
    pub(super) feedback: FeedbackNegotiator<ObjectId, zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1>,
    pub(super) globals: HashMap<usize, GlobalId>,
    version: u32,
}

impl DmabufState {
    /// Creates a new [`DmabufState`] delegate type.
    ///
    /// `main_device` is the device id of the render node the catalog was built for,
    /// usually [`GpuContext::render_device`]. Without it, globals are limited to
    /// protocol version 3, which has no feedback objects.
    pub fn new(catalog: Arc<FormatCatalog>, main_device: Option<Dev>) -> DmabufState {
        let version = if main_device.is_some() {
            FEEDBACK_VERSION
        } else {
            debug!("No main device known, limiting linux-dmabuf to version {}", LEGACY_VERSION);
            LEGACY_VERSION
        };

        DmabufState {
            feedback: FeedbackNegotiator::new(catalog.clone(), main_device.unwrap_or(0)),
            catalog,
            globals: HashMap::new(),
            version,
        }
    }

    /// Creates a dmabuf global.
    pub fn create_global<D>(&mut self, display: &DisplayHandle) -> DmabufGlobal
    where
        D: GlobalDispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, DmabufGlobalData> + DmabufHandler + 'static,
    {
        self.create_global_with_filter::<D, _>(display, |_| true)
    }

    /// Creates a dmabuf global visible only to clients accepted by `filter`.
    ///
    /// This may be used on multi-gpu systems in order to make a client choose the correct gpu.
    pub fn create_global_with_filter<D, F>(&mut self, display: &DisplayHandle, filter: F) -> DmabufGlobal
    where
        D: GlobalDispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, DmabufGlobalData> + DmabufHandler + 'static,
        F: for<'c> Fn(&'c Client) -> bool + Send + Sync + 'static,
    {
        let id = NEXT_GLOBAL_ID.fetch_add(1, Ordering::Relaxed);
        let data = DmabufGlobalData {
            filter: Box::new(filter),
            id,
        };

        let global = display.create_global::<D, zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, _>(self.version, data);
        self.globals.insert(id, global);
        info!(id, version = self.version, "Created linux-dmabuf global");

        DmabufGlobal { id }
    }

    /// Disables a dmabuf global.
    ///
    /// This operation is permanent and there is no way to re-enable a global.
    pub fn disable_global<D: 'static>(&mut self, display: &DisplayHandle, global: &DmabufGlobal) {
        if let Some(id) = self.globals.get(&global.id) {
            display.disable_global::<D>(id.clone());
        }
    }

    /// Destroys a dmabuf global.
    ///
    /// Params created from this global afterwards fail to create buffers.
    pub fn destroy_global<D: 'static>(&mut self, display: &DisplayHandle, global: DmabufGlobal) {
        if let Some(id) = self.globals.remove(&global.id) {
            display.remove_global::<D>(id);
        }
    }

    /// Protocol version globals are advertised with
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The format catalog shared with clients
    pub fn catalog(&self) -> &Arc<FormatCatalog> {
        &self.catalog
    }

    /// The feedback sent to clients not referencing a surface
    pub fn default_feedback(&self) -> &DmabufFeedback {
        self.feedback.default_feedback()
    }

    /// The feedback of a surface, if a client subscribed to it
    pub fn surface_feedback(&self, surface: &WlSurface) -> Option<&DmabufFeedback> {
        self.feedback.surface_feedback(&surface.id())
    }

    /// Notify about a changed scanout candidacy of a surface.
    ///
    /// `output` is the output the surface can now be directly scanned out on, if any.
    /// Returns true if subscribed clients were sent updated feedback.
    pub fn surface_scanout_candidate_changed(
        &mut self,
        surface: &WlSurface,
        output: Option<&dyn ScanoutOutput>,
    ) -> bool {
        self.feedback.scanout_candidate_changed(&surface.id(), output)
    }

    /// Forget the feedback of a destroyed surface
    pub fn surface_destroyed(&mut self, surface: &WlSurface) {
        self.feedback.surface_destroyed(&surface.id());
    }
}

/// A handle to a registered dmabuf global.
///
/// This type may be used in equitability checks to determine which global a dmabuf is being imported to.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DmabufGlobal {
    pub(super) id: usize,
}

/// Data associated with a dmabuf global.
pub struct DmabufGlobalData {
    pub(super) filter: Box<dyn for<'c> Fn(&'c Client) -> bool + Send + Sync>,
    pub(super) id: usize,
}

impl std::fmt::Debug for DmabufGlobalData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmabufGlobalData")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Data associated with a dmabuf global protocol object.
#[derive(Debug)]
pub struct DmabufData {
    pub(super) id: usize,
}

/// Data associated with a pending [`Dmabuf`] import.
#[derive(Debug)]
pub struct DmabufParamsData {
    /// Id of the dmabuf global these params were created from.
    pub(super) id: usize,
    pub(super) params: Mutex<DmabufParams>,
}

impl DmabufParamsData {
    pub(super) fn add(
        &self,
        fd: std::os::unix::io::OwnedFd,
        plane_idx: u32,
        offset: u32,
        stride: u32,
        modifier: Modifier,
    ) -> Result<(), ParamsError> {
        self.params
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(fd, plane_idx, offset, stride, modifier)
    }

    pub(super) fn commit(
        &self,
        width: i32,
        height: i32,
        format: u32,
        flags: u32,
    ) -> Result<Dmabuf, ParamsError> {
        self.params
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .commit(width, height, format, flags)
    }

    pub(super) fn destroy(&self) {
        self.params.lock().unwrap_or_else(PoisonError::into_inner).destroy();
    }
}

/// Data associated with a feedback protocol object.
#[derive(Debug)]
pub struct DmabufFeedbackData {
    /// Surface the feedback was requested for, `None` for the default feedback
    pub(super) surface: Option<ObjectId>,
}

/// Handler trait for [`Dmabuf`] import from the compositor.
pub trait DmabufHandler {
    /// The rendering context buffers are imported with
    type Gpu: GpuContext;

    /// Returns a mutable reference to the [`DmabufState`] delegate type.
    fn dmabuf_state(&mut self) -> &mut DmabufState;

    /// Returns the rendering context buffers are imported with
    fn gpu_context(&mut self) -> &mut Self::Gpu;

    /// This function is called when a client has committed a [`Dmabuf`].
    ///
    /// The buffer is only handed to the client if this returns `Ok`. The default implementation
    /// realizes the buffer as a texture of [`DmabufHandler::gpu_context`].
    fn dmabuf_imported(&mut self, global: &DmabufGlobal, dmabuf: &Dmabuf) -> Result<(), ImportError> {
        let _ = global;
        self.gpu_context().import_dmabuf(dmabuf).map(|_| ())
    }

    /// The `wl_buffer` of a [`Dmabuf`] was destroyed.
    ///
    /// Other holders of the [`Dmabuf`] keep it alive.
    fn dmabuf_destroyed(&mut self, dmabuf: &Dmabuf) {
        let _ = dmabuf;
    }
}

/// Gets the [`Dmabuf`] of a `wl_buffer` created by a dmabuf global.
///
/// Buffers of other kinds (e.g. shm buffers) return an [`UnmanagedResource`] error.
pub fn get_dmabuf(buffer: &WlBuffer) -> Result<Dmabuf, UnmanagedResource> {
    buffer.data::<Dmabuf>().cloned().ok_or(UnmanagedResource)
}

/// Macro to delegate implementation of the linux dmabuf to [`DmabufState`].
///
/// You must also implement [`DmabufHandler`] to use this.
#[macro_export]
macro_rules! delegate_dmabuf {
    ($(@<$( $lt:tt $( : $clt:tt $(+ $dlt:tt )* )? ),+>)? $ty: ty) => {
        type __ZwpLinuxDmabufV1 =
            $crate::reexports::wayland_protocols::wp::linux_dmabuf::zv1::server::zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1;
        type __ZwpLinuxBufferParamsV1 =
            $crate::reexports::wayland_protocols::wp::linux_dmabuf::zv1::server::zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1;
        type __ZwpLinuxDmabufFeedbackV1 =
            $crate::reexports::wayland_protocols::wp::linux_dmabuf::zv1::server::zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1;

        $crate::reexports::wayland_server::delegate_global_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            __ZwpLinuxDmabufV1: $crate::wayland::dmabuf::DmabufGlobalData
        ] => $crate::wayland::dmabuf::DmabufState);

        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            __ZwpLinuxDmabufV1: $crate::wayland::dmabuf::DmabufData
        ] => $crate::wayland::dmabuf::DmabufState);
        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            __ZwpLinuxBufferParamsV1: $crate::wayland::dmabuf::DmabufParamsData
        ] => $crate::wayland::dmabuf::DmabufState);
        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            __ZwpLinuxDmabufFeedbackV1: $crate::wayland::dmabuf::DmabufFeedbackData
        ] => $crate::wayland::dmabuf::DmabufState);
        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_server::protocol::wl_buffer::WlBuffer: $crate::backend::allocator::dmabuf::Dmabuf
        ] => $crate::wayland::dmabuf::DmabufState);
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        allocator::{Format, Fourcc},
        renderer::test::DummyGpu,
    };
    use wayland_server::Display;

    struct State {
        dmabuf_state: DmabufState,
        gpu: DummyGpu,
    }

    impl DmabufHandler for State {
        type Gpu = DummyGpu;

        fn dmabuf_state(&mut self) -> &mut DmabufState {
            &mut self.dmabuf_state
        }

        fn gpu_context(&mut self) -> &mut DummyGpu {
            &mut self.gpu
        }
    }

    crate::delegate_dmabuf!(State);

    fn catalog() -> Arc<FormatCatalog> {
        Arc::new(
            FormatCatalog::from_formats(
                [Format {
                    code: Fourcc::Argb8888,
                    modifier: Modifier::Linear,
                }],
                true,
            )
            .unwrap(),
        )
    }

    #[test]
    fn version_depends_on_main_device() {
        assert_eq!(DmabufState::new(catalog(), Some(0xe280)).version(), FEEDBACK_VERSION);
        assert_eq!(DmabufState::new(catalog(), None).version(), LEGACY_VERSION);
    }

    #[test]
    fn global_lifecycle() {
        let display = Display::<State>::new().unwrap();
        let handle = display.handle();
        let mut state = State {
            dmabuf_state: DmabufState::new(catalog(), Some(0xe280)),
            gpu: DummyGpu::new(Some(0xe280)),
        };

        let global = state.dmabuf_state.create_global::<State>(&handle);
        let other = state
            .dmabuf_state
            .create_global_with_filter::<State, _>(&handle, |_| false);
        assert_ne!(global, other);
        assert_eq!(state.dmabuf_state.globals.len(), 2);

        state.dmabuf_state.disable_global::<State>(&handle, &global);
        assert_eq!(state.dmabuf_state.globals.len(), 2);
        state.dmabuf_state.destroy_global::<State>(&handle, global);
        assert_eq!(state.dmabuf_state.globals.len(), 1);

        assert_eq!(
            state.dmabuf_state.default_feedback().tranches()[0].indices(),
            &[0]
        );
        assert!(state.gpu_context().render_device().is_some());
    }
}
