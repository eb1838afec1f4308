//! Typed resource handles and their table-resident state.
//!
//! Every GPU entity lives in one resource table keyed by
//! [`ResourceHandle`]; [`Buffer`], [`Texture`] and [`Sampler`] are typed
//! wrappers over it. The wrappers make cross-kind misuse (passing a
//! buffer where a texture is expected) detectable at validation time
//! instead of silently aliasing.

use ember_core::Handle;

use crate::backend::{GpuBuffer, GpuObject, GpuSampler, GpuTexture};
use crate::types::{BufferDescriptor, SamplerDescriptor, TextureDescriptor};

/// Untyped handle to any device resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourceHandle(pub(crate) Handle<ResourceState>);

impl ResourceHandle {
    /// Whether this handle names a resource at all (not whether it is live).
    pub fn is_valid(&self) -> bool {
        self.0.is_valid()
    }
}

macro_rules! typed_resource_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub(crate) ResourceHandle);

        impl $name {
            /// The untyped handle behind this resource.
            pub fn handle(&self) -> ResourceHandle {
                self.0
            }

            /// Whether this handle names a resource at all.
            pub fn is_valid(&self) -> bool {
                self.0.is_valid()
            }
        }

        impl From<$name> for ResourceHandle {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

typed_resource_handle!(
    /// Handle to a device buffer.
    Buffer
);
typed_resource_handle!(
    /// Handle to a device texture.
    Texture
);
typed_resource_handle!(
    /// Handle to a device sampler.
    Sampler
);

#[derive(Default)]
pub(crate) struct ResourceState {
    pub(crate) payload: ResourcePayload,
}

#[derive(Default)]
pub(crate) enum ResourcePayload {
    #[default]
    Empty,
    Buffer {
        desc: BufferDescriptor,
        gpu: GpuBuffer,
    },
    Texture {
        desc: TextureDescriptor,
        gpu: GpuTexture,
    },
    Sampler {
        #[allow(dead_code)]
        desc: SamplerDescriptor,
        gpu: GpuSampler,
    },
}

impl ResourcePayload {
    /// Take the backend object out for destruction.
    pub(crate) fn into_gpu_object(self) -> Option<GpuObject> {
        match self {
            Self::Empty => None,
            Self::Buffer { gpu, .. } => Some(GpuObject::Buffer(gpu)),
            Self::Texture { gpu, .. } => Some(GpuObject::Texture(gpu)),
            Self::Sampler { gpu, .. } => Some(GpuObject::Sampler(gpu)),
        }
    }
}

// ============================================================================
// Resource tables
// ============================================================================

/// Kind discriminator for resource tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum TableKind {
    /// Read-only inputs to a dispatch.
    #[default]
    In,
    /// Writable outputs of a dispatch.
    Out,
    /// Samplers.
    Sampler,
}

#[derive(Default)]
pub(crate) struct TableState {
    pub(crate) kind: TableKind,
    pub(crate) resources: Vec<ResourceHandle>,
}

/// Untyped handle to a resource table of any kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TableHandle(pub(crate) Handle<TableState>);

macro_rules! typed_table_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub(crate) TableHandle);

        impl $name {
            /// Whether this handle names a table at all.
            pub fn is_valid(&self) -> bool {
                self.0.0.is_valid()
            }
        }

        impl From<$name> for TableHandle {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

typed_table_handle!(
    /// Table of read-only dispatch inputs.
    InResourceTable
);
typed_table_handle!(
    /// Table of writable dispatch outputs.
    OutResourceTable
);
typed_table_handle!(
    /// Table of samplers.
    SamplerTable
);

/// Descriptor for creating a resource table.
#[derive(Debug, Clone, Default)]
pub struct ResourceTableDesc {
    /// Debug label for the table.
    pub label: Option<String>,
    /// Member resources, bound in order.
    pub resources: Vec<ResourceHandle>,
}

impl ResourceTableDesc {
    pub fn new(resources: Vec<ResourceHandle>) -> Self {
        Self {
            label: None,
            resources,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}
