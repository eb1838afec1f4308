//! Software GPU backend.
//!
//! A CPU-side backend that moves real bytes: uploads, copies, and
//! readbacks behave like a GPU with zero latency, and dispatches are
//! accepted but perform no shader execution. Used for tests and headless
//! development without GPU hardware.
//!
//! Two completion modes:
//!
//! - *immediate* (default): the fence timeline is signaled inside
//!   `submit`, so work is complete by the time `submit` returns.
//! - *manual* ([`SoftwareBackend::manual`]): batches queue up until the
//!   test calls [`advance`](SoftwareBackend::advance) or
//!   [`signal_all`](SoftwareBackend::signal_all), which is how the
//!   not-ready and deferred-destruction paths are exercised.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::DeviceError;
use crate::sync::Timeline;
use crate::types::{BufferDescriptor, SamplerDescriptor, TextureDescriptor};

use super::{
    BackendOp, GpuBackend, GpuBuffer, GpuObject, GpuSampler, GpuTexture, MappedPtr, ReadbackHeap,
    SubmitBatch,
};

struct StorageCell {
    bytes: UnsafeCell<Box<[u8]>>,
}

// SAFETY: access is serialized by the fence protocol — the backend writes
// during batch execution, the CPU reads after observing the fence. This is
// the same contract persistently mapped GPU memory has; racing it is a
// caller error, exactly as on hardware.
unsafe impl Send for StorageCell {}
unsafe impl Sync for StorageCell {}

/// CPU-side storage backing one software buffer or texture subresource.
///
/// Cheap to clone (shared contents); the base pointer is stable for the
/// storage's lifetime.
#[derive(Clone)]
pub struct SoftwareStorage {
    cell: Arc<StorageCell>,
}

impl SoftwareStorage {
    pub(crate) fn new(size: u64) -> Self {
        Self {
            cell: Arc::new(StorageCell {
                bytes: UnsafeCell::new(vec![0u8; size as usize].into_boxed_slice()),
            }),
        }
    }

    /// Size of the storage in bytes.
    pub fn len(&self) -> u64 {
        unsafe { (&(*self.cell.bytes.get())).len() as u64 }
    }

    /// Whether the storage is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stable pointer to the first byte.
    pub(crate) fn base_ptr(&self) -> MappedPtr {
        MappedPtr(unsafe { (*self.cell.bytes.get()).as_mut_ptr() })
    }

    pub(crate) fn write(&self, offset: u64, data: &[u8]) {
        let bytes = unsafe { &mut *self.cell.bytes.get() };
        let offset = offset as usize;
        debug_assert!(offset + data.len() <= bytes.len(), "write out of bounds");
        if offset >= bytes.len() {
            return;
        }
        let n = data.len().min(bytes.len() - offset);
        bytes[offset..offset + n].copy_from_slice(&data[..n]);
    }

    pub(crate) fn read(&self, offset: u64, size: u64) -> Vec<u8> {
        let bytes = unsafe { &*self.cell.bytes.get() };
        let offset = offset as usize;
        let size = size as usize;
        debug_assert!(offset + size <= bytes.len(), "read out of bounds");
        if offset >= bytes.len() {
            return Vec::new();
        }
        let n = size.min(bytes.len() - offset);
        bytes[offset..offset + n].to_vec()
    }
}

impl std::fmt::Debug for SoftwareStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareStorage")
            .field("len", &self.len())
            .finish()
    }
}

/// CPU-side texture: one storage per (mip, slice) subresource.
#[derive(Debug, Clone)]
pub struct SoftwareTexture {
    subresources: Vec<SoftwareStorage>,
    mip_levels: u32,
    array_slices: u32,
}

impl SoftwareTexture {
    fn new(descriptor: &TextureDescriptor) -> Self {
        let mut subresources = Vec::new();
        for _slice in 0..descriptor.array_slices {
            for mip in 0..descriptor.mip_levels {
                subresources.push(SoftwareStorage::new(descriptor.mip_byte_size(mip)));
            }
        }
        Self {
            subresources,
            mip_levels: descriptor.mip_levels,
            array_slices: descriptor.array_slices,
        }
    }

    /// Storage for one subresource, if in range.
    pub(crate) fn subresource(&self, mip: u32, slice: u32) -> Option<&SoftwareStorage> {
        if mip >= self.mip_levels || slice >= self.array_slices {
            return None;
        }
        self.subresources
            .get((slice * self.mip_levels + mip) as usize)
    }
}

/// Software GPU backend. See the module docs for the completion modes.
pub struct SoftwareBackend {
    timeline: Timeline,
    submitted: AtomicU64,
    manual: bool,
    pending: Mutex<VecDeque<(u64, SubmitBatch)>>,
    readback_budget: Mutex<Option<u64>>,
}

impl SoftwareBackend {
    /// Create a backend that completes batches inside `submit`.
    pub fn new() -> Self {
        Self {
            timeline: Timeline::new(),
            submitted: AtomicU64::new(0),
            manual: false,
            pending: Mutex::new(VecDeque::new()),
            readback_budget: Mutex::new(None),
        }
    }

    /// Create a backend that holds batches until [`advance`](Self::advance)
    /// or [`signal_all`](Self::signal_all).
    pub fn manual() -> Self {
        Self {
            manual: true,
            ..Self::new()
        }
    }

    /// Cap the total bytes of readback heaps this backend will create.
    /// Requests beyond the budget fail with [`DeviceError::OutOfMemory`].
    pub fn with_readback_budget(self, bytes: u64) -> Self {
        *self.readback_budget.lock() = Some(bytes);
        self
    }

    /// Execute and signal the oldest pending batch. Returns `false` if
    /// nothing was pending.
    pub fn advance(&self) -> bool {
        let entry = self.pending.lock().pop_front();
        match entry {
            Some((value, batch)) => {
                self.execute_batch(batch);
                self.timeline.signal(value);
                true
            }
            None => false,
        }
    }

    /// Execute and signal everything still pending.
    pub fn signal_all(&self) {
        while self.advance() {}
    }

    fn execute_batch(&self, batch: SubmitBatch) {
        for op in batch.ops {
            match op {
                BackendOp::WriteBuffer { dst, offset, data } => {
                    let GpuBuffer::Software(storage) = dst;
                    storage.write(offset, &data);
                }
                BackendOp::WriteTexture {
                    dst,
                    mip,
                    slice,
                    data,
                } => {
                    let GpuTexture::Software(texture) = dst;
                    if let Some(storage) = texture.subresource(mip, slice) {
                        storage.write(0, &data);
                    }
                }
                BackendOp::CopyBuffer { src, dst } => {
                    let GpuBuffer::Software(src) = src;
                    let GpuBuffer::Software(dst) = dst;
                    let bytes = src.read(0, src.len());
                    dst.write(0, &bytes);
                }
                BackendOp::Dispatch { groups } => {
                    log::trace!(
                        "software dispatch: {}x{}x{} groups",
                        groups[0],
                        groups[1],
                        groups[2]
                    );
                }
                BackendOp::ReadbackBuffer { src, dst, size } => {
                    let GpuBuffer::Software(storage) = src;
                    let bytes = storage.read(0, size);
                    unsafe {
                        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.0, bytes.len());
                    }
                }
                BackendOp::ReadbackTexture {
                    src,
                    mip,
                    slice,
                    dst,
                    size,
                } => {
                    let GpuTexture::Software(texture) = src;
                    if let Some(storage) = texture.subresource(mip, slice) {
                        let bytes = storage.read(0, size);
                        unsafe {
                            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.0, bytes.len());
                        }
                    }
                }
            }
        }
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software"
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, DeviceError> {
        log::trace!(
            "software backend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        Ok(GpuBuffer::Software(SoftwareStorage::new(descriptor.size)))
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<GpuTexture, DeviceError> {
        log::trace!(
            "software backend: creating texture {:?} ({}x{}, {} mips, {} slices)",
            descriptor.label,
            descriptor.width,
            descriptor.height,
            descriptor.mip_levels,
            descriptor.array_slices
        );
        Ok(GpuTexture::Software(SoftwareTexture::new(descriptor)))
    }

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> Result<GpuSampler, DeviceError> {
        log::trace!("software backend: creating sampler {:?}", descriptor.label);
        Ok(GpuSampler::Software)
    }

    fn create_readback_heap(&self, size: u64) -> Result<ReadbackHeap, DeviceError> {
        let mut budget = self.readback_budget.lock();
        if let Some(remaining) = budget.as_mut() {
            if size > *remaining {
                return Err(DeviceError::OutOfMemory);
            }
            *remaining -= size;
        }
        let storage = SoftwareStorage::new(size);
        let mapped = storage.base_ptr();
        Ok(ReadbackHeap {
            buffer: GpuBuffer::Software(storage),
            mapped,
            size,
        })
    }

    fn submit(&self, batch: SubmitBatch) -> Result<u64, DeviceError> {
        let value = self.submitted.fetch_add(1, Ordering::AcqRel) + 1;
        if self.manual {
            self.pending.lock().push_back((value, batch));
        } else {
            self.execute_batch(batch);
            self.timeline.signal(value);
        }
        Ok(value)
    }

    fn completed_fence_value(&self) -> u64 {
        self.timeline.completed()
    }

    fn last_submitted_fence_value(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    fn wait_fence_value(&self, value: u64, timeout: Option<Duration>) -> bool {
        self.timeline.wait_for(value, timeout)
    }

    fn destroy(&self, object: GpuObject) {
        match &object {
            GpuObject::Buffer(_) => log::trace!("software backend: destroying buffer"),
            GpuObject::Texture(_) => log::trace!("software backend: destroying texture"),
            GpuObject::Sampler(_) => log::trace!("software backend: destroying sampler"),
        }
        drop(object);
    }

    fn wait_idle(&self) {
        self.signal_all();
        let last = self.last_submitted_fence_value();
        if last > 0 {
            self.timeline.wait_for(last, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_round_trip() {
        let storage = SoftwareStorage::new(16);
        storage.write(4, &[1, 2, 3, 4]);
        assert_eq!(storage.read(4, 4), vec![1, 2, 3, 4]);
        assert_eq!(storage.read(0, 2), vec![0, 0]);
    }

    #[test]
    fn immediate_mode_signals_at_submit() {
        let backend = SoftwareBackend::new();
        let value = backend.submit(SubmitBatch::default()).unwrap();
        assert_eq!(value, 1);
        assert_eq!(backend.completed_fence_value(), 1);
    }

    #[test]
    fn manual_mode_defers_completion() {
        let backend = SoftwareBackend::manual();
        let value = backend.submit(SubmitBatch::default()).unwrap();
        assert_eq!(backend.completed_fence_value(), 0);
        assert!(!backend.wait_fence_value(value, Some(Duration::from_millis(5))));

        assert!(backend.advance());
        assert_eq!(backend.completed_fence_value(), value);
        assert!(backend.wait_fence_value(value, None));
    }

    #[test]
    fn manual_batches_execute_in_order() {
        let backend = SoftwareBackend::manual();
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(4, Default::default()))
            .unwrap();

        let write = |data: Vec<u8>| SubmitBatch {
            ops: vec![BackendOp::WriteBuffer {
                dst: buffer.clone(),
                offset: 0,
                data,
            }],
        };
        backend.submit(write(vec![1, 1, 1, 1])).unwrap();
        backend.submit(write(vec![2, 2, 2, 2])).unwrap();
        backend.signal_all();

        let GpuBuffer::Software(storage) = &buffer;
        assert_eq!(storage.read(0, 4), vec![2, 2, 2, 2]);
    }

    #[test]
    fn readback_budget_is_enforced() {
        let backend = SoftwareBackend::new().with_readback_budget(1024);
        assert!(backend.create_readback_heap(512).is_ok());
        assert!(backend.create_readback_heap(512).is_ok());
        assert_eq!(
            backend.create_readback_heap(1).unwrap_err(),
            DeviceError::OutOfMemory
        );
    }

    #[test]
    fn texture_subresource_bounds() {
        let backend = SoftwareBackend::new();
        let desc = TextureDescriptor::new_2d(
            8,
            8,
            crate::types::TextureFormat::Rgba8Unorm,
            Default::default(),
        )
        .with_mip_levels(2);
        let GpuTexture::Software(texture) = backend.create_texture(&desc).unwrap();
        assert!(texture.subresource(0, 0).is_some());
        assert!(texture.subresource(1, 0).is_some());
        assert!(texture.subresource(2, 0).is_none());
        assert!(texture.subresource(0, 1).is_none());
    }
}
