//! # Ember Core
//!
//! Foundation utilities shared by the Ember crates. The main export is the
//! generational [`HandleTable`], the identity map behind every GPU-side
//! entity (resources, shaders, in-flight work, tasks).

pub mod handle;

pub use handle::{Handle, HandleTable};
