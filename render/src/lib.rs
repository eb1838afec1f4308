//! # Ember Render
//!
//! Cross-backend GPU compute device abstraction.
//!
//! One capability interface ([`backend::GpuBackend`]) with
//! interchangeable backend bodies, and a backend-agnostic lifecycle core:
//!
//! - [`Device`] — the façade: resource creation, command-list scheduling,
//!   work completion queries, CPU readback
//! - [`shader::ShaderDatabase`] — asynchronous shader compile pipeline
//! - [`readback::ReadbackBufferPool`] — best-fit, coalescing allocator
//!   for CPU-mappable download staging
//! - [`gc::DeferredDestructor`] — fence-gated deferred destruction
//!
//! ## Example
//!
//! ```ignore
//! let device = Device::new(DeviceConfig::default())?;
//! let buffer = device.create_buffer(&BufferDescriptor::new(1024, BufferUsage::STORAGE))?;
//!
//! let mut cmd = CommandList::new();
//! cmd.upload_slice(buffer, 0, &data);
//! cmd.download_resource(buffer);
//! let work = device.schedule(vec![cmd])?;
//!
//! device.wait_on_cpu(work, WaitTimeout::Infinite);
//! let status = device.download_status(work, buffer, 0, 0);
//! ```

pub mod backend;
pub mod cmd;
pub mod device;
pub mod error;
pub mod gc;
pub mod readback;
pub mod resources;
pub mod shader;
pub mod sync;
pub mod types;

// Re-export main types for convenience
pub use cmd::CommandList;
pub use device::{
    Device, DeviceConfig, DeviceInfo, DownloadStatus, MappedMemory, ReadbackView,
    ResourceMemoryInfo, WaitStatus, WaitTimeout, WorkHandle,
};
pub use error::DeviceError;
pub use resources::{
    Buffer, InResourceTable, OutResourceTable, ResourceHandle, ResourceTableDesc, Sampler,
    SamplerTable, TableHandle, Texture,
};
pub use shader::{ShaderDatabase, ShaderDbDesc, ShaderDesc, ShaderHandle, WgslCompiler};
pub use types::{
    BufferDescriptor, BufferUsage, SamplerDescriptor, TextureDescriptor, TextureFormat,
    TextureUsage,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the render subsystem. Logs the version; safe to call more
/// than once.
pub fn init() {
    log::info!("ember render v{VERSION} initialized");
}
