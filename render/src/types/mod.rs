//! Resource descriptors and related value types.

mod buffer;
mod sampler;
mod texture;

pub use buffer::{BufferDescriptor, BufferUsage};
pub use sampler::{AddressMode, FilterMode, SamplerDescriptor};
pub use texture::{TextureDescriptor, TextureFormat, TextureUsage};
