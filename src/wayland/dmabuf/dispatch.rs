use std::{os::unix::io::BorrowedFd, sync::Mutex};

use tracing::{debug, error, trace};
use wayland_protocols::wp::linux_dmabuf::zv1::server::{
    zwp_linux_buffer_params_v1, zwp_linux_dmabuf_feedback_v1, zwp_linux_dmabuf_v1,
};
use wayland_server::{
    backend::ClientId, protocol::wl_buffer, Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New,
    Resource,
};

use super::{
    announce_legacy, DmabufData, DmabufFeedbackData, DmabufGlobal, DmabufGlobalData, DmabufHandler,
    DmabufParams, DmabufParamsData, DmabufState, FeedbackSink, FormatAnnouncer, ParamsError, ParamsErrorCode,
    TrancheFlags,
};
use crate::backend::allocator::{dmabuf::Dmabuf, Modifier};

impl From<ParamsErrorCode> for zwp_linux_buffer_params_v1::Error {
    fn from(code: ParamsErrorCode) -> Self {
        match code {
            ParamsErrorCode::AlreadyUsed => zwp_linux_buffer_params_v1::Error::AlreadyUsed,
            ParamsErrorCode::PlaneIdx => zwp_linux_buffer_params_v1::Error::PlaneIdx,
            ParamsErrorCode::PlaneSet => zwp_linux_buffer_params_v1::Error::PlaneSet,
            ParamsErrorCode::Incomplete => zwp_linux_buffer_params_v1::Error::Incomplete,
            ParamsErrorCode::InvalidFormat => zwp_linux_buffer_params_v1::Error::InvalidFormat,
            ParamsErrorCode::InvalidDimensions => zwp_linux_buffer_params_v1::Error::InvalidDimensions,
            ParamsErrorCode::OutOfBounds => zwp_linux_buffer_params_v1::Error::OutOfBounds,
            ParamsErrorCode::InvalidWlBuffer => zwp_linux_buffer_params_v1::Error::InvalidWlBuffer,
        }
    }
}

impl FeedbackSink for zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1 {
    fn format_table(&self, fd: BorrowedFd<'_>, size: u32) {
        zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1::format_table(self, fd, size)
    }

    fn main_device(&self, device: Vec<u8>) {
        zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1::main_device(self, device)
    }

    fn tranche_target_device(&self, device: Vec<u8>) {
        zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1::tranche_target_device(self, device)
    }

    fn tranche_flags(&self, flags: TrancheFlags) {
        zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1::tranche_flags(
            self,
            zwp_linux_dmabuf_feedback_v1::TrancheFlags::from_bits_truncate(flags.bits()),
        )
    }

    fn tranche_formats(&self, indices: Vec<u8>) {
        zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1::tranche_formats(self, indices)
    }

    fn tranche_done(&self) {
        zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1::tranche_done(self)
    }

    fn done(&self) {
        zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1::done(self)
    }
}

impl FormatAnnouncer for zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1 {
    fn format(&self, format: u32) {
        zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1::format(self, format)
    }

    fn modifier(&self, format: u32, modifier_hi: u32, modifier_lo: u32) {
        zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1::modifier(self, format, modifier_hi, modifier_lo)
    }
}

impl<D> GlobalDispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, DmabufGlobalData, D> for DmabufState
where
    D: GlobalDispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, DmabufGlobalData>
        + Dispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, DmabufData>
        + DmabufHandler
        + 'static,
{
    fn bind(
        state: &mut D,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1>,
        global_data: &DmabufGlobalData,
        data_init: &mut DataInit<'_, D>,
    ) {
        let zwp_dmabuf = data_init.init(resource, DmabufData { id: global_data.id });

        // Clients without feedback objects learn the formats right away
        let version = zwp_dmabuf.version();
        if let Some(send_modifiers) = legacy_announcement(version) {
            trace!(version, send_modifiers, "Announcing formats to legacy client");
            let catalog = state.dmabuf_state().catalog.clone();
            announce_legacy(&catalog, &zwp_dmabuf, send_modifiers);
        }
    }

    fn can_view(client: Client, global_data: &DmabufGlobalData) -> bool {
        (global_data.filter)(&client)
    }
}

impl<D> Dispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, DmabufData, D> for DmabufState
where
    D: Dispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, DmabufData>
        + Dispatch<zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1, DmabufParamsData>
        + Dispatch<zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1, DmabufFeedbackData>
        + DmabufHandler
        + 'static,
{
    fn request(
        state: &mut D,
        _client: &Client,
        _resource: &zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
        request: zwp_linux_dmabuf_v1::Request,
        data: &DmabufData,
        _dh: &DisplayHandle,
        data_init: &mut DataInit<'_, D>,
    ) {
        match request {
            zwp_linux_dmabuf_v1::Request::Destroy => {}

            zwp_linux_dmabuf_v1::Request::CreateParams { params_id } => {
                data_init.init(
                    params_id,
                    DmabufParamsData {
                        id: data.id,
                        params: Mutex::new(DmabufParams::new()),
                    },
                );
            }

            zwp_linux_dmabuf_v1::Request::GetDefaultFeedback { id } => {
                let feedback = data_init.init(id, DmabufFeedbackData { surface: None });
                state.dmabuf_state().feedback.send_default(&feedback);
            }

            zwp_linux_dmabuf_v1::Request::GetSurfaceFeedback { id, surface } => {
                let surface = surface.id();
                let feedback = data_init.init(
                    id,
                    DmabufFeedbackData {
                        surface: Some(surface.clone()),
                    },
                );
                state.dmabuf_state().feedback.subscribe(&surface, feedback);
            }

            _ => unreachable!(),
        }
    }
}

impl<D> Dispatch<zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1, DmabufFeedbackData, D>
    for DmabufState
where
    D: Dispatch<zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1, DmabufFeedbackData> + DmabufHandler,
{
    fn request(
        _state: &mut D,
        _client: &Client,
        _resource: &zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1,
        request: zwp_linux_dmabuf_feedback_v1::Request,
        _data: &DmabufFeedbackData,
        _dh: &DisplayHandle,
        _data_init: &mut DataInit<'_, D>,
    ) {
        match request {
            zwp_linux_dmabuf_feedback_v1::Request::Destroy => {}
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut D,
        _client: ClientId,
        resource: &zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1,
        data: &DmabufFeedbackData,
    ) {
        if let Some(surface) = data.surface.as_ref() {
            state.dmabuf_state().feedback.unsubscribe(surface, resource);
        }
    }
}

impl<D> Dispatch<zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1, DmabufParamsData, D> for DmabufState
where
    D: Dispatch<zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1, DmabufParamsData>
        + Dispatch<wl_buffer::WlBuffer, Dmabuf>
        + DmabufHandler
        + 'static,
{
    fn request(
        state: &mut D,
        client: &Client,
        params: &zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1,
        request: zwp_linux_buffer_params_v1::Request,
        data: &DmabufParamsData,
        dh: &DisplayHandle,
        data_init: &mut DataInit<'_, D>,
    ) {
        match request {
            zwp_linux_buffer_params_v1::Request::Destroy => data.destroy(),

            zwp_linux_buffer_params_v1::Request::Add {
                fd,
                plane_idx,
                offset,
                stride,
                modifier_hi,
                modifier_lo,
            } => {
                let modifier = Modifier::from(((modifier_hi as u64) << 32) | (modifier_lo as u64));
                if let Err(err) = data.add(fd, plane_idx, offset, stride, modifier) {
                    post_params_error(params, &err);
                }
            }

            zwp_linux_buffer_params_v1::Request::Create {
                width,
                height,
                format,
                flags,
            } => match commit_create(state, data, width, height, format, flags.into()) {
                CommitOutcome::Accepted(dmabuf) => {
                    match client.create_resource::<wl_buffer::WlBuffer, Dmabuf, D>(dh, 1, dmabuf) {
                        Ok(buffer) => params.created(&buffer),
                        Err(err) => {
                            error!(?err, "Failed to create protocol object for \"create\" request");
                            params.failed();
                        }
                    }
                }
                CommitOutcome::Failed => params.failed(),
                CommitOutcome::ProtocolError(code, message) => {
                    params.post_error(zwp_linux_buffer_params_v1::Error::from(code), message)
                }
            },

            zwp_linux_buffer_params_v1::Request::CreateImmed {
                buffer_id,
                width,
                height,
                format,
                flags,
            } => match commit_create_immed(state, data, width, height, format, flags.into()) {
                Ok(dmabuf) => {
                    data_init.init(buffer_id, dmabuf);
                }
                Err((code, message)) => {
                    error!(?code, reason = %message, "Killing client for invalid buffer params");
                    params.post_error(zwp_linux_buffer_params_v1::Error::from(code), message);
                }
            },

            _ => unreachable!(),
        }
    }
}

impl<D> Dispatch<wl_buffer::WlBuffer, Dmabuf, D> for DmabufState
where
    D: Dispatch<wl_buffer::WlBuffer, Dmabuf> + DmabufHandler,
{
    fn request(
        _state: &mut D,
        _client: &Client,
        _resource: &wl_buffer::WlBuffer,
        request: wl_buffer::Request,
        _data: &Dmabuf,
        _dh: &DisplayHandle,
        _data_init: &mut DataInit<'_, D>,
    ) {
        match request {
            wl_buffer::Request::Destroy => {}
            _ => unreachable!(),
        }
    }

    fn destroyed(state: &mut D, _client: ClientId, _resource: &wl_buffer::WlBuffer, data: &Dmabuf) {
        state.dmabuf_destroyed(data);
    }
}

/// Result of committing params on behalf of a client
#[derive(Debug)]
enum CommitOutcome {
    /// The buffer was accepted and may be handed to the client
    Accepted(Dmabuf),
    /// The client is told through the `failed` event
    Failed,
    /// The client is killed with a protocol error
    ProtocolError(ParamsErrorCode, String),
}

/// Protocol version without feedback objects, returns whether modifiers are announced
fn legacy_announcement(version: u32) -> Option<bool> {
    (version < zwp_linux_dmabuf_v1::REQ_GET_DEFAULT_FEEDBACK_SINCE)
        .then_some(version >= zwp_linux_dmabuf_v1::EVT_MODIFIER_SINCE)
}

/// Commit for a `create` request, which answers with exactly one of `created` or `failed`
fn commit_create<D: DmabufHandler>(
    state: &mut D,
    data: &DmabufParamsData,
    width: i32,
    height: i32,
    format: u32,
    flags: u32,
) -> CommitOutcome {
    match data.commit(width, height, format, flags) {
        Ok(dmabuf) if import_dmabuf(state, data.id, &dmabuf) => CommitOutcome::Accepted(dmabuf),
        Ok(_) => CommitOutcome::Failed,
        // there is no way to report a consumed params object through `failed`
        Err(err @ ParamsError::AlreadyUsed) => {
            CommitOutcome::ProtocolError(err.protocol_error(), err.to_string())
        }
        Err(err) => {
            debug!(?err, "Rejecting buffer params");
            CommitOutcome::Failed
        }
    }
}

/// Commit for a `create_immed` request, every failure is a protocol error
fn commit_create_immed<D: DmabufHandler>(
    state: &mut D,
    data: &DmabufParamsData,
    width: i32,
    height: i32,
    format: u32,
    flags: u32,
) -> Result<Dmabuf, (ParamsErrorCode, String)> {
    let dmabuf = data
        .commit(width, height, format, flags)
        .map_err(|err| (err.protocol_error(), err.to_string()))?;
    if !import_dmabuf(state, data.id, &dmabuf) {
        // No event is left to signal the failure on an already existing buffer
        return Err((ParamsErrorCode::InvalidWlBuffer, "buffer import failed".into()));
    }
    Ok(dmabuf)
}

fn post_params_error(params: &zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1, err: &ParamsError) {
    params.post_error(
        zwp_linux_buffer_params_v1::Error::from(err.protocol_error()),
        err.to_string(),
    );
}

/// Hand a committed buffer to the compositor, returns true if it was accepted
fn import_dmabuf<D: DmabufHandler>(state: &mut D, global_id: usize, dmabuf: &Dmabuf) -> bool {
    // If the dmabuf global was destroyed, we cannot import any buffers.
    if !state.dmabuf_state().globals.contains_key(&global_id) {
        debug!(global_id, "Dmabuf global was destroyed, rejecting buffer");
        return false;
    }

    match state.dmabuf_imported(&DmabufGlobal { id: global_id }, dmabuf) {
        Ok(()) => true,
        Err(err) => {
            debug!(?err, "Dmabuf import failed");
            false
        }
    }
}
