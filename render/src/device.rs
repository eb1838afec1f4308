//! The device façade.
//!
//! [`Device`] composes the lifecycle core into one coherent surface:
//! resource creation through the handle tables, command-list scheduling
//! with fence-tagged work handles, CPU readback staged through the
//! buffer pool, and fence-gated deferred destruction.
//!
//! # Thread Safety
//!
//! `Device` is `Send + Sync`. Handle tables are behind reader/writer
//! locks (many pollers, occasional writer); the readback pool is behind a
//! mutex and only driven from the scheduling and reclamation paths.
//!
//! # Blocking
//!
//! `schedule` never blocks; [`Device::wait_on_cpu`] is the only call here
//! that can block the invoking thread, and only for as long as its
//! timeout allows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ember_core::{Handle, HandleTable};
use parking_lot::{Mutex, RwLock};

use crate::backend::{
    BackendOp, GpuBackend, GpuObject, SubmitBatch, create_backend,
};
use crate::cmd::{Command, CommandList};
use crate::error::DeviceError;
use crate::gc::DeferredDestructor;
use crate::readback::{ReadbackBlock, ReadbackBufferPool};
use crate::resources::{
    Buffer, InResourceTable, OutResourceTable, ResourceHandle, ResourcePayload, ResourceState,
    ResourceTableDesc, Sampler, SamplerTable, TableHandle, TableKind, TableState, Texture,
};
use crate::shader::ShaderDatabase;
use crate::types::{BufferDescriptor, BufferUsage, SamplerDescriptor, TextureDescriptor, TextureUsage};

/// Handle to one scheduled command-list batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WorkHandle(pub(crate) Handle<WorkState>);

impl WorkHandle {
    /// Whether this handle names a batch at all (not whether it is live).
    pub fn is_valid(&self) -> bool {
        self.0.is_valid()
    }
}

type DownloadKey = (ResourceHandle, u32, u32);

#[derive(Default)]
pub(crate) struct WorkState {
    fence_value: u64,
    downloads: HashMap<DownloadKey, ReadbackBlock>,
}

/// Timeout policy for [`Device::wait_on_cpu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Check and return immediately.
    Poll,
    /// Block for at most this many milliseconds.
    Millis(u32),
    /// Block until the work completes.
    Infinite,
}

/// Outcome of [`Device::wait_on_cpu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The batch has retired on the GPU.
    Complete,
    /// The timeout elapsed first.
    TimedOut,
    /// The work handle is stale or was never issued.
    InvalidHandle,
}

/// Outcome of [`Device::download_status`].
#[derive(Debug)]
pub enum DownloadStatus {
    /// The readback region is filled; the view holds the bytes.
    Ready(ReadbackView),
    /// The GPU has not retired the batch yet. Poll again later.
    NotReady,
    /// No download of this subresource was recorded in the batch —
    /// a caller error.
    NotRequested,
    /// The work handle is stale or was never issued.
    InvalidHandle,
}

impl DownloadStatus {
    /// Whether the download completed.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// Downloaded bytes, copied out of the readback staging block.
#[derive(Debug, Clone)]
pub struct ReadbackView {
    bytes: Vec<u8>,
}

impl ReadbackView {
    /// The downloaded bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Take ownership of the downloaded bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    /// Size of the downloaded region.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Size and layout summary for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceMemoryInfo {
    /// Total byte size (mip 0 for textures).
    pub size_in_bytes: u64,
    /// Bytes per row for textures; equals `size_in_bytes` for buffers.
    pub row_pitch: u64,
    /// Whether the resource is a buffer.
    pub is_buffer: bool,
}

/// Persistently mapped CPU view of a `MAP_READ`/`MAP_WRITE` buffer.
///
/// Holds the backing storage alive; reads and writes are not synchronized
/// against in-flight GPU work — fence first, exactly as on hardware.
#[derive(Debug, Clone)]
pub struct MappedMemory {
    gpu: crate::backend::GpuBuffer,
    size: u64,
}

impl MappedMemory {
    /// Size of the mapped range.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copy the mapped bytes out.
    pub fn read(&self) -> Vec<u8> {
        let crate::backend::GpuBuffer::Software(storage) = &self.gpu;
        storage.read(0, self.size)
    }

    /// Write bytes into the mapped range at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) {
        let crate::backend::GpuBuffer::Software(storage) = &self.gpu;
        storage.write(offset, data);
    }
}

/// Device creation parameters.
pub struct DeviceConfig {
    /// Display name.
    pub name: String,
    /// Backend to drive; the software backend when absent.
    pub backend: Option<Arc<dyn GpuBackend>>,
    /// Shader database consulted when validating dispatches.
    pub shader_db: Option<Arc<ShaderDatabase>>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "ember device".to_string(),
            backend: None,
            shader_db: None,
        }
    }
}

/// Static information about a created device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Display name.
    pub name: String,
    /// Name of the backend in use.
    pub backend: &'static str,
}

pub(crate) enum DeferredPayload {
    Object(GpuObject),
    Blocks(Vec<ReadbackBlock>),
}

/// Cross-backend GPU compute device.
pub struct Device {
    backend: Arc<dyn GpuBackend>,
    info: DeviceInfo,
    shader_db: Option<Arc<ShaderDatabase>>,
    resources: RwLock<HandleTable<ResourceState>>,
    tables: RwLock<HandleTable<TableState>>,
    work: RwLock<HandleTable<WorkState>>,
    readback: Mutex<ReadbackBufferPool>,
    gc: DeferredDestructor<DeferredPayload>,
}

impl Device {
    /// Create a device.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot create the initial readback heap.
    pub fn new(config: DeviceConfig) -> Result<Self, DeviceError> {
        let backend = config.backend.unwrap_or_else(create_backend);
        let readback = ReadbackBufferPool::new(Arc::clone(&backend))?;
        let info = DeviceInfo {
            name: config.name,
            backend: backend.name(),
        };
        log::info!("created device '{}' on {} backend", info.name, info.backend);
        Ok(Self {
            backend,
            info,
            shader_db: config.shader_db,
            resources: RwLock::new(HandleTable::new()),
            tables: RwLock::new(HandleTable::new()),
            work: RwLock::new(HandleTable::new()),
            readback: Mutex::new(readback),
            gc: DeferredDestructor::new(),
        })
    }

    /// Static device information.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// The shader database attached at creation, if any.
    pub fn shader_db(&self) -> Option<&Arc<ShaderDatabase>> {
        self.shader_db.as_ref()
    }

    // ------------------------------------------------------------------
    // Resource creation
    // ------------------------------------------------------------------

    /// Create a buffer.
    pub fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<Buffer, DeviceError> {
        if descriptor.size == 0 {
            return Err(DeviceError::InvalidParameter(
                "buffer size cannot be zero".to_string(),
            ));
        }
        let gpu = self.backend.create_buffer(descriptor)?;
        let mut resources = self.resources.write();
        let (handle, state) = resources.allocate();
        state.payload = ResourcePayload::Buffer {
            desc: descriptor.clone(),
            gpu,
        };
        log::trace!(
            "device: created buffer {:?}, size={}",
            descriptor.label,
            descriptor.size
        );
        Ok(Buffer(ResourceHandle(handle)))
    }

    /// Create a texture.
    pub fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<Texture, DeviceError> {
        if descriptor.width == 0 || descriptor.height == 0 {
            return Err(DeviceError::InvalidParameter(
                "texture dimensions cannot be zero".to_string(),
            ));
        }
        if descriptor.mip_levels == 0 || descriptor.array_slices == 0 {
            return Err(DeviceError::InvalidParameter(
                "texture must have at least one mip and one slice".to_string(),
            ));
        }
        let gpu = self.backend.create_texture(descriptor)?;
        let mut resources = self.resources.write();
        let (handle, state) = resources.allocate();
        state.payload = ResourcePayload::Texture {
            desc: descriptor.clone(),
            gpu,
        };
        log::trace!(
            "device: created texture {:?}, {}x{}",
            descriptor.label,
            descriptor.width,
            descriptor.height
        );
        Ok(Texture(ResourceHandle(handle)))
    }

    /// Recreate a texture under its existing handle.
    ///
    /// Outstanding copies of the handle stay valid and observe the new
    /// contents; the old backend object is destroyed once in-flight GPU
    /// work retires.
    pub fn recreate_texture(
        &self,
        texture: Texture,
        descriptor: &TextureDescriptor,
    ) -> Result<(), DeviceError> {
        if descriptor.width == 0 || descriptor.height == 0 {
            return Err(DeviceError::InvalidParameter(
                "texture dimensions cannot be zero".to_string(),
            ));
        }
        let gpu = self.backend.create_texture(descriptor)?;
        let old = {
            let mut resources = self.resources.write();
            let Some(state) = resources.get_mut(texture.0.0) else {
                return Err(DeviceError::InvalidHandle);
            };
            if !matches!(state.payload, ResourcePayload::Texture { .. }) {
                return Err(DeviceError::InvalidHandle);
            }
            std::mem::replace(
                &mut state.payload,
                ResourcePayload::Texture {
                    desc: descriptor.clone(),
                    gpu,
                },
            )
        };
        if let Some(object) = old.into_gpu_object() {
            self.gc.defer(
                DeferredPayload::Object(object),
                self.backend.last_submitted_fence_value(),
            );
        }
        self.collect_garbage();
        Ok(())
    }

    /// Create a sampler.
    pub fn create_sampler(&self, descriptor: &SamplerDescriptor) -> Result<Sampler, DeviceError> {
        let gpu = self.backend.create_sampler(descriptor)?;
        let mut resources = self.resources.write();
        let (handle, state) = resources.allocate();
        state.payload = ResourcePayload::Sampler {
            desc: descriptor.clone(),
            gpu,
        };
        log::trace!("device: created sampler {:?}", descriptor.label);
        Ok(Sampler(ResourceHandle(handle)))
    }

    /// Create a table of read-only dispatch inputs.
    pub fn create_in_resource_table(
        &self,
        descriptor: &ResourceTableDesc,
    ) -> Result<InResourceTable, DeviceError> {
        self.create_table(descriptor, TableKind::In)
            .map(|h| InResourceTable(h))
    }

    /// Create a table of writable dispatch outputs. Every member must be
    /// `STORAGE`-capable.
    pub fn create_out_resource_table(
        &self,
        descriptor: &ResourceTableDesc,
    ) -> Result<OutResourceTable, DeviceError> {
        self.create_table(descriptor, TableKind::Out)
            .map(|h| OutResourceTable(h))
    }

    /// Create a table of samplers.
    pub fn create_sampler_table(
        &self,
        descriptor: &ResourceTableDesc,
    ) -> Result<SamplerTable, DeviceError> {
        self.create_table(descriptor, TableKind::Sampler)
            .map(|h| SamplerTable(h))
    }

    fn create_table(
        &self,
        descriptor: &ResourceTableDesc,
        kind: TableKind,
    ) -> Result<TableHandle, DeviceError> {
        if descriptor.resources.is_empty() {
            return Err(DeviceError::InvalidParameter(
                "resource table cannot be empty".to_string(),
            ));
        }
        {
            let resources = self.resources.read();
            for &member in &descriptor.resources {
                let Some(state) = resources.get(member.0) else {
                    return Err(DeviceError::InvalidHandle);
                };
                match (&state.payload, kind) {
                    (ResourcePayload::Buffer { .. }, TableKind::In)
                    | (ResourcePayload::Texture { .. }, TableKind::In) => {}
                    (ResourcePayload::Buffer { desc, .. }, TableKind::Out) => {
                        if !desc.usage.contains(BufferUsage::STORAGE) {
                            return Err(DeviceError::InvalidParameter(
                                "out table member buffer lacks STORAGE usage".to_string(),
                            ));
                        }
                    }
                    (ResourcePayload::Texture { desc, .. }, TableKind::Out) => {
                        if !desc.usage.contains(TextureUsage::STORAGE) {
                            return Err(DeviceError::InvalidParameter(
                                "out table member texture lacks STORAGE usage".to_string(),
                            ));
                        }
                    }
                    (ResourcePayload::Sampler { .. }, TableKind::Sampler) => {}
                    // Samplers in in/out tables, or non-samplers in a
                    // sampler table, are cross-kind handle misuse.
                    _ => return Err(DeviceError::InvalidHandle),
                }
            }
        }
        let mut tables = self.tables.write();
        let (handle, state) = tables.allocate();
        state.kind = kind;
        state.resources = descriptor.resources.clone();
        log::trace!(
            "device: created {:?} table {:?} with {} members",
            kind,
            descriptor.label,
            descriptor.resources.len()
        );
        Ok(TableHandle(handle))
    }

    // ------------------------------------------------------------------
    // Resource queries
    // ------------------------------------------------------------------

    /// Persistent CPU mapping of a `MAP_READ`/`MAP_WRITE` buffer.
    pub fn mapped_memory(&self, buffer: Buffer) -> Result<MappedMemory, DeviceError> {
        let resources = self.resources.read();
        let Some(state) = resources.get(buffer.0.0) else {
            return Err(DeviceError::InvalidHandle);
        };
        let ResourcePayload::Buffer { desc, gpu } = &state.payload else {
            return Err(DeviceError::InvalidHandle);
        };
        if !desc
            .usage
            .intersects(BufferUsage::MAP_READ | BufferUsage::MAP_WRITE)
        {
            return Err(DeviceError::InvalidParameter(
                "buffer was not created with MAP_READ or MAP_WRITE".to_string(),
            ));
        }
        Ok(MappedMemory {
            gpu: gpu.clone(),
            size: desc.size,
        })
    }

    /// Size and layout information for a resource.
    pub fn resource_memory_info(
        &self,
        resource: impl Into<ResourceHandle>,
    ) -> Result<ResourceMemoryInfo, DeviceError> {
        let resource = resource.into();
        let resources = self.resources.read();
        let Some(state) = resources.get(resource.0) else {
            return Err(DeviceError::InvalidHandle);
        };
        match &state.payload {
            ResourcePayload::Buffer { desc, .. } => Ok(ResourceMemoryInfo {
                size_in_bytes: desc.size,
                row_pitch: desc.size,
                is_buffer: true,
            }),
            ResourcePayload::Texture { desc, .. } => Ok(ResourceMemoryInfo {
                size_in_bytes: desc.mip_byte_size(0),
                row_pitch: desc.row_pitch(0),
                is_buffer: false,
            }),
            _ => Err(DeviceError::InvalidParameter(
                "resource has no memory".to_string(),
            )),
        }
    }

    /// Number of live resources. Diagnostic hook.
    pub fn resource_count(&self) -> usize {
        self.resources.read().len()
    }

    // ------------------------------------------------------------------
    // Release paths
    // ------------------------------------------------------------------

    /// Release a resource.
    ///
    /// The handle dies immediately; the backend object is destroyed only
    /// once all GPU work enqueued so far has retired.
    pub fn release_resource(
        &self,
        resource: impl Into<ResourceHandle>,
    ) -> Result<(), DeviceError> {
        let resource = resource.into();
        let state = { self.resources.write().release(resource.0) };
        let Some(state) = state else {
            debug_assert!(false, "releasing an invalid resource handle");
            return Err(DeviceError::InvalidHandle);
        };
        if let Some(object) = state.payload.into_gpu_object() {
            self.gc
                .defer(DeferredPayload::Object(object), self.backend.last_submitted_fence_value());
        }
        self.collect_garbage();
        Ok(())
    }

    /// Release a resource table. Tables hold no backend memory, so the
    /// slot is recycled immediately.
    pub fn release_table(&self, table: impl Into<TableHandle>) -> Result<(), DeviceError> {
        let table = table.into();
        match self.tables.write().release(table.0) {
            Some(_) => Ok(()),
            None => {
                debug_assert!(false, "releasing an invalid table handle");
                Err(DeviceError::InvalidHandle)
            }
        }
    }

    /// Release a work handle, returning its readback staging to the pool
    /// once the batch's fence retires.
    pub fn release_work(&self, handle: WorkHandle) -> Result<(), DeviceError> {
        let state = { self.work.write().release(handle.0) };
        let Some(state) = state else {
            return Err(DeviceError::InvalidHandle);
        };
        let blocks: Vec<ReadbackBlock> = state.downloads.into_values().collect();
        if !blocks.is_empty() {
            self.gc
                .defer(DeferredPayload::Blocks(blocks), state.fence_value);
        }
        self.collect_garbage();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduling and completion
    // ------------------------------------------------------------------

    /// Submit a batch of command lists. Non-blocking.
    ///
    /// The whole batch is validated first and rejected atomically —
    /// nothing reaches the backend and no work slot is consumed on error.
    pub fn schedule(&self, lists: Vec<CommandList>) -> Result<WorkHandle, DeviceError> {
        if lists.is_empty() {
            return Err(DeviceError::EmptySchedule);
        }

        let mut ops = Vec::new();
        let mut downloads: HashMap<DownloadKey, ReadbackBlock> = HashMap::new();
        if let Err(err) = self.lower_batch(lists, &mut ops, &mut downloads) {
            self.return_blocks(downloads.into_values().collect());
            return Err(err);
        }

        let fence_value = match self.backend.submit(SubmitBatch { ops }) {
            Ok(value) => value,
            Err(err) => {
                self.return_blocks(downloads.into_values().collect());
                return Err(err);
            }
        };

        let handle = {
            let mut work = self.work.write();
            let (handle, state) = work.allocate();
            state.fence_value = fence_value;
            state.downloads = downloads;
            WorkHandle(handle)
        };
        log::trace!("device: scheduled work {:?} (fence {})", handle, fence_value);

        self.collect_garbage();
        Ok(handle)
    }

    fn lower_batch(
        &self,
        lists: Vec<CommandList>,
        ops: &mut Vec<BackendOp>,
        downloads: &mut HashMap<DownloadKey, ReadbackBlock>,
    ) -> Result<(), DeviceError> {
        let resources = self.resources.read();
        let tables = self.tables.read();

        for list in lists {
            for command in list.commands {
                match command {
                    Command::UploadBuffer {
                        buffer,
                        offset,
                        data,
                    } => {
                        let Some(state) = resources.get(buffer.0.0) else {
                            return Err(DeviceError::InvalidHandle);
                        };
                        let ResourcePayload::Buffer { desc, gpu } = &state.payload else {
                            return Err(DeviceError::InvalidHandle);
                        };
                        if offset + data.len() as u64 > desc.size {
                            return Err(DeviceError::InvalidParameter(
                                "buffer upload out of range".to_string(),
                            ));
                        }
                        ops.push(BackendOp::WriteBuffer {
                            dst: gpu.clone(),
                            offset,
                            data,
                        });
                    }
                    Command::UploadTexture {
                        texture,
                        mip,
                        slice,
                        data,
                    } => {
                        let Some(state) = resources.get(texture.0.0) else {
                            return Err(DeviceError::InvalidHandle);
                        };
                        let ResourcePayload::Texture { desc, gpu } = &state.payload else {
                            return Err(DeviceError::InvalidHandle);
                        };
                        if mip >= desc.mip_levels || slice >= desc.array_slices {
                            return Err(DeviceError::InvalidParameter(
                                "texture upload subresource out of range".to_string(),
                            ));
                        }
                        if data.len() as u64 != desc.mip_byte_size(mip) {
                            return Err(DeviceError::InvalidParameter(
                                "texture upload must cover the subresource exactly".to_string(),
                            ));
                        }
                        ops.push(BackendOp::WriteTexture {
                            dst: gpu.clone(),
                            mip,
                            slice,
                            data,
                        });
                    }
                    Command::CopyBuffer { src, dst } => {
                        let (src_gpu, src_size) = {
                            let Some(state) = resources.get(src.0.0) else {
                                return Err(DeviceError::InvalidHandle);
                            };
                            let ResourcePayload::Buffer { desc, gpu } = &state.payload else {
                                return Err(DeviceError::InvalidHandle);
                            };
                            (gpu.clone(), desc.size)
                        };
                        let Some(state) = resources.get(dst.0.0) else {
                            return Err(DeviceError::InvalidHandle);
                        };
                        let ResourcePayload::Buffer { desc, gpu } = &state.payload else {
                            return Err(DeviceError::InvalidHandle);
                        };
                        if desc.size < src_size {
                            return Err(DeviceError::InvalidParameter(
                                "copy destination smaller than source".to_string(),
                            ));
                        }
                        ops.push(BackendOp::CopyBuffer {
                            src: src_gpu,
                            dst: gpu.clone(),
                        });
                    }
                    Command::Dispatch {
                        shader,
                        input,
                        output,
                        groups,
                    } => {
                        if groups.iter().any(|&g| g == 0) {
                            return Err(DeviceError::InvalidParameter(
                                "dispatch group counts must be non-zero".to_string(),
                            ));
                        }
                        let Some(db) = &self.shader_db else {
                            return Err(DeviceError::InvalidParameter(
                                "device has no shader database".to_string(),
                            ));
                        };
                        if !db.is_valid(shader) {
                            return Err(DeviceError::ShaderNotReady);
                        }
                        if let Some(input) = input {
                            let state = match tables.get(input.0.0) {
                                Some(state) if state.kind == TableKind::In => state,
                                _ => return Err(DeviceError::InvalidHandle),
                            };
                            // Members may have been released since the
                            // table was built.
                            for member in &state.resources {
                                if resources.get(member.0).is_none() {
                                    return Err(DeviceError::InvalidHandle);
                                }
                            }
                        }
                        if let Some(output) = output {
                            let state = match tables.get(output.0.0) {
                                Some(state) if state.kind == TableKind::Out => state,
                                _ => return Err(DeviceError::InvalidHandle),
                            };
                            for member in &state.resources {
                                if resources.get(member.0).is_none() {
                                    return Err(DeviceError::InvalidHandle);
                                }
                            }
                        }
                        ops.push(BackendOp::Dispatch { groups });
                    }
                    Command::Download {
                        resource,
                        mip,
                        slice,
                    } => {
                        let Some(state) = resources.get(resource.0) else {
                            return Err(DeviceError::InvalidHandle);
                        };
                        let key = (resource, mip, slice);
                        if downloads.contains_key(&key) {
                            return Err(DeviceError::InvalidParameter(
                                "duplicate download of the same subresource".to_string(),
                            ));
                        }
                        match &state.payload {
                            ResourcePayload::Buffer { desc, gpu } => {
                                if mip != 0 || slice != 0 {
                                    return Err(DeviceError::InvalidParameter(
                                        "buffer downloads address mip 0, slice 0".to_string(),
                                    ));
                                }
                                let block = self.readback.lock().allocate(desc.size)?;
                                ops.push(BackendOp::ReadbackBuffer {
                                    src: gpu.clone(),
                                    dst: block.mapped,
                                    size: desc.size,
                                });
                                downloads.insert(key, block);
                            }
                            ResourcePayload::Texture { desc, gpu } => {
                                if mip >= desc.mip_levels || slice >= desc.array_slices {
                                    return Err(DeviceError::InvalidParameter(
                                        "download subresource out of range".to_string(),
                                    ));
                                }
                                let size = desc.mip_byte_size(mip);
                                let block = self.readback.lock().allocate(size)?;
                                ops.push(BackendOp::ReadbackTexture {
                                    src: gpu.clone(),
                                    mip,
                                    slice,
                                    dst: block.mapped,
                                    size,
                                });
                                downloads.insert(key, block);
                            }
                            _ => {
                                return Err(DeviceError::InvalidParameter(
                                    "cannot download a sampler".to_string(),
                                ));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Block until the batch retires, up to the timeout.
    pub fn wait_on_cpu(&self, handle: WorkHandle, timeout: WaitTimeout) -> WaitStatus {
        let fence_value = {
            let work = self.work.read();
            work.get(handle.0).map(|state| state.fence_value)
        };
        let Some(fence_value) = fence_value else {
            return WaitStatus::InvalidHandle;
        };

        let complete = match timeout {
            WaitTimeout::Poll => self.backend.completed_fence_value() >= fence_value,
            WaitTimeout::Millis(ms) => self
                .backend
                .wait_fence_value(fence_value, Some(Duration::from_millis(u64::from(ms)))),
            WaitTimeout::Infinite => self.backend.wait_fence_value(fence_value, None),
        };

        self.collect_garbage();
        if complete {
            WaitStatus::Complete
        } else {
            WaitStatus::TimedOut
        }
    }

    /// Query the state of a download recorded in `work`.
    ///
    /// Querying a subresource the batch never downloaded returns
    /// [`DownloadStatus::NotRequested`] — that is a caller error, not a
    /// pending state.
    pub fn download_status(
        &self,
        work: WorkHandle,
        resource: impl Into<ResourceHandle>,
        mip: u32,
        slice: u32,
    ) -> DownloadStatus {
        let resource = resource.into();
        let work_table = self.work.read();
        let Some(state) = work_table.get(work.0) else {
            return DownloadStatus::InvalidHandle;
        };
        let Some(block) = state.downloads.get(&(resource, mip, slice)) else {
            return DownloadStatus::NotRequested;
        };
        if self.backend.completed_fence_value() >= state.fence_value {
            // SAFETY: the fence covering the batch that fills this block
            // has been observed signaled, and the block stays allocated
            // until the work handle is released.
            let bytes = unsafe { block.bytes() }.to_vec();
            DownloadStatus::Ready(ReadbackView { bytes })
        } else {
            DownloadStatus::NotReady
        }
    }

    /// Number of live work handles. Diagnostic hook.
    pub fn work_count(&self) -> usize {
        self.work.read().len()
    }

    // ------------------------------------------------------------------
    // Reclamation
    // ------------------------------------------------------------------

    /// Destroy every deferred object whose fence has retired.
    ///
    /// Runs opportunistically on `schedule` and `wait_on_cpu`; call it
    /// directly to reclaim eagerly.
    pub fn collect_garbage(&self) {
        let completed = self.backend.completed_fence_value();
        let payloads = self.gc.collect(completed);
        if !payloads.is_empty() {
            log::trace!("device: reclaiming {} deferred payloads", payloads.len());
            self.dispose(payloads);
        }
    }

    /// Number of objects still waiting on a fence. Diagnostic hook.
    pub fn deferred_count(&self) -> usize {
        self.gc.pending_count()
    }

    /// Block until all submitted work retires, then reclaim everything
    /// deferred.
    pub fn wait_idle(&self) {
        self.backend.wait_idle();
        self.collect_garbage();
    }

    fn dispose(&self, payloads: Vec<DeferredPayload>) {
        for payload in payloads {
            match payload {
                DeferredPayload::Object(object) => self.backend.destroy(object),
                DeferredPayload::Blocks(blocks) => self.return_blocks(blocks),
            }
        }
    }

    fn return_blocks(&self, blocks: Vec<ReadbackBlock>) {
        if blocks.is_empty() {
            return;
        }
        let mut pool = self.readback.lock();
        for block in blocks {
            pool.free(block);
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.backend.wait_idle();

        // Return download staging still owned by unreleased work handles.
        {
            let mut work = self.work.write();
            let mut handles = Vec::new();
            work.for_each(|handle, _| handles.push(handle));
            if !handles.is_empty() {
                log::warn!(
                    "device dropped with {} unreleased work handles",
                    handles.len()
                );
            }
            let mut pool = self.readback.lock();
            for handle in handles {
                if let Some(state) = work.release(handle) {
                    for (_, block) in state.downloads {
                        pool.free(block);
                    }
                }
            }
        }

        let payloads = self.gc.drain_all();
        self.dispose(payloads);

        // Destroy resources still alive; the GPU is idle now.
        {
            let mut resources = self.resources.write();
            let mut handles = Vec::new();
            resources.for_each(|handle, _| handles.push(handle));
            if !handles.is_empty() {
                log::debug!(
                    "destroying {} live resources at device teardown",
                    handles.len()
                );
            }
            for handle in handles {
                if let Some(state) = resources.release(handle) {
                    if let Some(object) = state.payload.into_gpu_object() {
                        self.backend.destroy(object);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.info.name)
            .field("backend", &self.info.backend)
            .finish()
    }
}

static_assertions::assert_impl_all!(Device: Send, Sync);
