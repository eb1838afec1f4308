//! Command list recording.
//!
//! A [`CommandList`] is plain recorded data: uploads, copies, dispatches
//! and download requests. No validation happens at record time — the
//! device validates the whole batch at [`schedule`](crate::Device::schedule)
//! and rejects it atomically if anything is wrong.

use crate::resources::{Buffer, InResourceTable, OutResourceTable, ResourceHandle, Texture};
use crate::shader::ShaderHandle;

pub(crate) enum Command {
    UploadBuffer {
        buffer: Buffer,
        offset: u64,
        data: Vec<u8>,
    },
    UploadTexture {
        texture: Texture,
        mip: u32,
        slice: u32,
        data: Vec<u8>,
    },
    CopyBuffer {
        src: Buffer,
        dst: Buffer,
    },
    Dispatch {
        shader: ShaderHandle,
        input: Option<InResourceTable>,
        output: Option<OutResourceTable>,
        groups: [u32; 3],
    },
    Download {
        resource: ResourceHandle,
        mip: u32,
        slice: u32,
    },
}

/// A recorded batch of device commands.
#[derive(Default)]
pub struct CommandList {
    pub(crate) commands: Vec<Command>,
}

impl CommandList {
    /// Create an empty command list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Record a byte upload into a buffer at `offset`.
    pub fn upload_buffer(&mut self, buffer: Buffer, offset: u64, data: impl Into<Vec<u8>>) {
        self.commands.push(Command::UploadBuffer {
            buffer,
            offset,
            data: data.into(),
        });
    }

    /// Record a typed upload into a buffer at `offset`.
    pub fn upload_slice<T: bytemuck::NoUninit>(&mut self, buffer: Buffer, offset: u64, data: &[T]) {
        self.upload_buffer(buffer, offset, bytemuck::cast_slice(data).to_vec());
    }

    /// Record an upload into one (mip, slice) subresource of a texture.
    /// The data must cover the subresource exactly.
    pub fn upload_texture(
        &mut self,
        texture: Texture,
        mip: u32,
        slice: u32,
        data: impl Into<Vec<u8>>,
    ) {
        self.commands.push(Command::UploadTexture {
            texture,
            mip,
            slice,
            data: data.into(),
        });
    }

    /// Record a whole-buffer copy.
    pub fn copy_buffer(&mut self, src: Buffer, dst: Buffer) {
        self.commands.push(Command::CopyBuffer { src, dst });
    }

    /// Record a compute dispatch.
    pub fn dispatch(
        &mut self,
        shader: ShaderHandle,
        input: Option<InResourceTable>,
        output: Option<OutResourceTable>,
        groups: [u32; 3],
    ) {
        self.commands.push(Command::Dispatch {
            shader,
            input,
            output,
            groups,
        });
    }

    /// Request a CPU readback of one (mip, slice) subresource.
    ///
    /// The readiness of the download is queried through
    /// [`download_status`](crate::Device::download_status) with the work
    /// handle returned by `schedule`.
    pub fn download(&mut self, resource: impl Into<ResourceHandle>, mip: u32, slice: u32) {
        self.commands.push(Command::Download {
            resource: resource.into(),
            mip,
            slice,
        });
    }

    /// Request a CPU readback of a whole buffer (or mip 0, slice 0 of a
    /// texture).
    pub fn download_resource(&mut self, resource: impl Into<ResourceHandle>) {
        self.download(resource, 0, 0);
    }
}
