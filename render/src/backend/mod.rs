//! GPU backend abstraction layer.
//!
//! This module provides a trait-based abstraction for GPU backends,
//! allowing the device core to work with different GPU APIs. The lifecycle
//! core (handle tables, readback pool, shader database, deferred
//! destructor) is backend-agnostic and only ever talks to [`GpuBackend`].
//!
//! # Available Backends
//!
//! - `software` (default): CPU-side backend that moves real bytes, used
//!   for tests and headless development.
//!
//! Native backends (Vulkan, D3D12, wgpu) are external collaborators: they
//! would add variants to the resource enums and an implementation of the
//! trait, behind cargo features, without touching the core.

pub mod software;

use std::sync::Arc;
use std::time::Duration;

use crate::error::DeviceError;
use crate::types::{BufferDescriptor, SamplerDescriptor, TextureDescriptor};

pub use software::{SoftwareBackend, SoftwareStorage, SoftwareTexture};

/// Raw pointer into CPU-mappable backend memory.
///
/// Backend memory stays alive for as long as the object that handed the
/// pointer out (a readback heap or a mappable buffer), which the pool and
/// the resource tables guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(pub *mut u8);

// SAFETY: the pointer is only dereferenced by backend op execution and by
// readback views after fence completion; the pointee is plain bytes.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    /// Null pointer, for default-initialized blocks.
    pub fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    /// Offset the pointer by `bytes` forward.
    ///
    /// # Safety
    ///
    /// The result must stay inside the same backend allocation.
    pub unsafe fn add(self, bytes: u64) -> Self {
        Self(unsafe { self.0.add(bytes as usize) })
    }

    /// Offset the pointer by `bytes` backward.
    ///
    /// # Safety
    ///
    /// The result must stay inside the same backend allocation.
    pub unsafe fn sub(self, bytes: u64) -> Self {
        Self(unsafe { self.0.sub(bytes as usize) })
    }
}

impl Default for MappedPtr {
    fn default() -> Self {
        Self::null()
    }
}

/// Handle to a GPU buffer resource.
#[derive(Debug, Clone)]
pub enum GpuBuffer {
    /// Software backend buffer (CPU-side storage).
    Software(SoftwareStorage),
}

/// Handle to a GPU texture resource.
#[derive(Debug, Clone)]
pub enum GpuTexture {
    /// Software backend texture (CPU-side storage per subresource).
    Software(SoftwareTexture),
}

/// Handle to a GPU sampler resource.
#[derive(Debug, Clone)]
pub enum GpuSampler {
    /// Software backend sampler (no state beyond the descriptor).
    Software,
}

/// An owned backend object queued for destruction.
#[derive(Debug)]
pub enum GpuObject {
    Buffer(GpuBuffer),
    Texture(GpuTexture),
    Sampler(GpuSampler),
}

/// A CPU-mappable heap created for the readback pool.
///
/// The buffer keeps the backing memory alive; `mapped` points at its base.
#[derive(Debug)]
pub struct ReadbackHeap {
    pub buffer: GpuBuffer,
    pub mapped: MappedPtr,
    pub size: u64,
}

/// One lowered command inside a submitted batch.
///
/// The device façade validates command lists and lowers them into these
/// ops; backends only execute.
pub enum BackendOp {
    /// Write bytes into a buffer.
    WriteBuffer {
        dst: GpuBuffer,
        offset: u64,
        data: Vec<u8>,
    },
    /// Write bytes into one (mip, slice) subresource of a texture.
    WriteTexture {
        dst: GpuTexture,
        mip: u32,
        slice: u32,
        data: Vec<u8>,
    },
    /// Copy the whole contents of one buffer into another.
    CopyBuffer { src: GpuBuffer, dst: GpuBuffer },
    /// Execute a compute dispatch.
    Dispatch { groups: [u32; 3] },
    /// Copy a buffer's contents into mapped readback memory.
    ReadbackBuffer {
        src: GpuBuffer,
        dst: MappedPtr,
        size: u64,
    },
    /// Copy a texture subresource into mapped readback memory.
    ReadbackTexture {
        src: GpuTexture,
        mip: u32,
        slice: u32,
        dst: MappedPtr,
        size: u64,
    },
}

/// A batch of lowered commands submitted as one unit of GPU work.
#[derive(Default)]
pub struct SubmitBatch {
    pub ops: Vec<BackendOp>,
}

/// GPU backend trait for abstracting different GPU APIs.
///
/// Submission is fenced: every `submit` returns the fence value that will
/// be signaled on the backend's timeline once the batch retires. The
/// device core never blocks inside `submit`.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Create a buffer resource.
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, DeviceError>;

    /// Create a texture resource.
    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<GpuTexture, DeviceError>;

    /// Create a sampler resource.
    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> Result<GpuSampler, DeviceError>;

    /// Create a CPU-mappable heap for the readback pool.
    fn create_readback_heap(&self, size: u64) -> Result<ReadbackHeap, DeviceError>;

    /// Submit a batch; returns the fence value associated with it.
    fn submit(&self, batch: SubmitBatch) -> Result<u64, DeviceError>;

    /// Highest fence value observed signaled on the CPU.
    fn completed_fence_value(&self) -> u64;

    /// Fence value of the most recent submission (0 if none yet).
    fn last_submitted_fence_value(&self) -> u64;

    /// Block until `value` is signaled or the timeout elapses.
    ///
    /// `None` waits forever. Returns `true` if the value was reached.
    fn wait_fence_value(&self, value: u64, timeout: Option<Duration>) -> bool;

    /// Destroy a backend object. The caller guarantees the GPU is done
    /// with it (the deferred destructor provides that guarantee).
    fn destroy(&self, object: GpuObject);

    /// Block until all submitted work has retired.
    fn wait_idle(&self);
}

/// Create the default backend.
pub fn create_backend() -> Arc<dyn GpuBackend> {
    log::info!("using software backend");
    Arc::new(SoftwareBackend::new())
}
