//! Common utilities for device integration tests.
//!
//! Builds the full collaborator stack the device core runs on: a task
//! system, an asynchronous file system rooted at a per-test temp dir, a
//! shader database, and a device over the software backend.

use std::path::PathBuf;
use std::sync::Arc;

use ember_render::backend::{GpuBackend, SoftwareBackend};
use ember_render::{Device, DeviceConfig, ShaderDatabase, ShaderDbDesc, WgslCompiler};
use ember_tasks::{TaskSystem, TaskSystemDesc};
use ember_vfs::AsyncFileSystem;

/// A trivial compute shader that compiles under any validator.
#[allow(dead_code)]
pub const TRIVIAL_SHADER: &str = "@compute @workgroup_size(1) fn main() { }\n";

/// Full test stack: task system, file system, shader database, device.
pub struct TestContext {
    pub ts: Arc<TaskSystem>,
    pub fs: Arc<AsyncFileSystem>,
    pub db: Arc<ShaderDatabase>,
    pub backend: Arc<SoftwareBackend>,
    pub device: Device,
    pub dir: PathBuf,
}

impl TestContext {
    /// Context over an immediate-completion software backend.
    pub fn new(name: &str) -> Self {
        Self::build(name, SoftwareBackend::new())
    }

    /// Context over a manually-signaled software backend, for observing
    /// in-flight states.
    #[allow(dead_code)]
    pub fn manual(name: &str) -> Self {
        Self::build(name, SoftwareBackend::manual())
    }

    fn build(name: &str, backend: SoftwareBackend) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = std::env::temp_dir().join(format!("ember_render_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let ts = Arc::new(TaskSystem::start_new(TaskSystemDesc {
            thread_pool_size: 4,
        }));
        let fs = Arc::new(AsyncFileSystem::with_root(Arc::clone(&ts), &dir));
        let db = Arc::new(ShaderDatabase::new(ShaderDbDesc {
            ts: Arc::clone(&ts),
            fs: Arc::clone(&fs),
            compiler: Arc::new(WgslCompiler::new()),
        }));
        let backend = Arc::new(backend);
        let backend_dyn: Arc<dyn GpuBackend> = backend.clone();
        let device = Device::new(DeviceConfig {
            name: format!("test-{name}"),
            backend: Some(backend_dyn),
            shader_db: Some(Arc::clone(&db)),
        })
        .unwrap();

        Self {
            ts,
            fs,
            db,
            backend,
            device,
            dir,
        }
    }

    /// Write a shader source file under the test root.
    #[allow(dead_code)]
    pub fn write_shader(&self, relative: &str, contents: &str) {
        let path = self.dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Deterministic byte pattern for upload/download comparisons.
#[allow(dead_code)]
pub fn test_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
