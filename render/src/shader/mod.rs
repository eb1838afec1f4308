//! Shader database: asynchronous compile pipeline.
//!
//! [`ShaderDatabase::request_compile`] is non-blocking. It allocates a
//! handle immediately, kicks off a streaming source read on the file
//! system, and registers a compile task that depends on the read. The
//! compile task preprocesses includes (each resolved by synchronously
//! driving one async read — the compiler sees a blocking call), invokes
//! the backend compiler, and publishes the terminal `ready`/`success`
//! flags under the shader table's write lock.
//!
//! Per-shader state machine: requested → reading → compiling →
//! succeeded/failed, terminal until [`resolve`](ShaderDatabase::resolve)
//! tears the transient compile state down. `is_valid` may be polled from
//! any thread at any time; observing `false` while a compile is in flight
//! is a normal, non-error condition.
//!
//! Dependencies (task system, file system, compiler) are injected through
//! [`ShaderDbDesc`], keeping the pipeline testable with fakes.

mod compiler;
mod preprocess;

pub use compiler::{
    CompileResult, CompiledShader, FinishedFn, IncludeFn, ShaderCompiler, ShaderDesc, WgslCompiler,
};

use std::sync::Arc;

use ember_core::{Handle, HandleTable};
use ember_tasks::{Task, TaskSystem};
use ember_vfs::{AsyncFileHandle, AsyncFileSystem, FileChunk, FileReadRequest};
use parking_lot::{Mutex, RwLock};

/// Handle to a shader in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShaderHandle(pub(crate) Handle<ShaderState>);

impl ShaderHandle {
    /// Whether this handle names a shader at all (not whether it compiled).
    pub fn is_valid(&self) -> bool {
        self.0.is_valid()
    }
}

/// Construction parameters for [`ShaderDatabase`].
pub struct ShaderDbDesc {
    pub ts: Arc<TaskSystem>,
    pub fs: Arc<AsyncFileSystem>,
    pub compiler: Arc<dyn ShaderCompiler>,
}

#[derive(Default)]
pub(crate) struct ShaderState {
    ready: bool,
    success: bool,
    diagnostic: Option<String>,
    artifact: Option<CompiledShader>,
    compile_state: Option<CompileState>,
}

/// Transient per-compile state, owned until `resolve` tears it down.
struct CompileState {
    core: Arc<CompileCore>,
    read_step: AsyncFileHandle,
    compile_step: Task,
}

/// Shared between the read callback and the compile task.
struct CompileCore {
    /// Source bytes, appended chunk by chunk by the read callback.
    source: Mutex<Vec<u8>>,
    /// Set by the read callback on failure; checked before compiling.
    read_error: Mutex<Option<String>>,
}

struct ShaderDbInner {
    ts: Arc<TaskSystem>,
    fs: Arc<AsyncFileSystem>,
    compiler: Arc<dyn ShaderCompiler>,
    shaders: RwLock<HandleTable<ShaderState>>,
}

impl ShaderDbInner {
    fn run_compile(&self, handle: ShaderHandle, name: &str, entry_point: &str, core: &CompileCore) {
        // The only write path to the completion flags; runs on whatever
        // thread executes the compile, hence the exclusive lock.
        let mut publish = |result: CompileResult| {
            if !result.success {
                if let Some(diagnostic) = &result.diagnostic {
                    log::warn!("shader '{name}' failed: {diagnostic}");
                }
            }
            let mut shaders = self.shaders.write();
            if let Some(state) = shaders.get_mut(handle.0) {
                state.ready = true;
                state.success = result.success;
                state.diagnostic = result.diagnostic;
                state.artifact = result.artifact;
            }
        };

        let read_error = core.read_error.lock().take();
        match read_error {
            Some(err) => publish(CompileResult::failure(format!("source read failed: {err}"))),
            None => {
                let source = {
                    let bytes = core.source.lock();
                    String::from_utf8_lossy(&bytes).into_owned()
                };
                let mut on_include = |path: &str| self.read_include(path);
                self.compiler
                    .compile(name, entry_point, &source, &mut on_include, &mut publish);
            }
        }
    }

    /// Synchronous include read: issue the request, then drive this one
    /// request's execute/wait/close sequence inline. The compiler sees a
    /// blocking call; the compile already runs off the caller's thread
    /// inside a task.
    fn read_include(&self, path: &str) -> Result<Vec<u8>, String> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let status = Arc::new(Mutex::new(None::<Result<(), String>>));

        let cb_buffer = Arc::clone(&buffer);
        let cb_status = Arc::clone(&status);
        let handle = self.fs.read(FileReadRequest::new(path, move |chunk| {
            match chunk {
                FileChunk::Reading(bytes) => cb_buffer.lock().extend_from_slice(bytes),
                FileChunk::Success => *cb_status.lock() = Some(Ok(())),
                FileChunk::Fail(err) => *cb_status.lock() = Some(Err(err.to_string())),
            }
        }));

        self.fs.execute(handle);
        self.fs.wait(handle);
        self.fs.close_handle(handle);

        let status = status.lock().take();
        match status {
            Some(Ok(())) => Ok(std::mem::take(&mut *buffer.lock())),
            Some(Err(err)) => Err(err),
            None => Err("include read reported no terminal status".to_string()),
        }
    }
}

impl Drop for ShaderDbInner {
    fn drop(&mut self) {
        let shaders = self.shaders.read();
        let mut unresolved = 0;
        shaders.for_each(|_, state| {
            if state.compile_state.is_some() {
                unresolved += 1;
            }
        });
        if unresolved > 0 {
            log::error!("{unresolved} unresolved shaders at teardown; expect leaked compile state");
            debug_assert!(false, "{unresolved} unresolved shaders at teardown");
        }
    }
}

/// Thread-safe shader database. Shared as `Arc<ShaderDatabase>`.
pub struct ShaderDatabase {
    inner: Arc<ShaderDbInner>,
}

impl ShaderDatabase {
    pub fn new(desc: ShaderDbDesc) -> Self {
        Self {
            inner: Arc::new(ShaderDbInner {
                ts: desc.ts,
                fs: desc.fs,
                compiler: desc.compiler,
                shaders: RwLock::new(HandleTable::new()),
            }),
        }
    }

    /// Start compiling a shader. Non-blocking; the returned handle is
    /// immediately usable for `is_valid` polls (which report not-ready
    /// until the pipeline finishes).
    pub fn request_compile(&self, desc: ShaderDesc) -> ShaderHandle {
        let core = Arc::new(CompileCore {
            source: Mutex::new(Vec::new()),
            read_error: Mutex::new(None),
        });

        let read_core = Arc::clone(&core);
        let read_name = desc.name.clone();
        let read_step = self
            .inner
            .fs
            .read(FileReadRequest::new(&desc.path, move |chunk| match chunk {
                FileChunk::Reading(bytes) => read_core.source.lock().extend_from_slice(bytes),
                FileChunk::Success => {}
                FileChunk::Fail(err) => {
                    log::warn!("failed reading shader '{read_name}': {err}");
                    *read_core.read_error.lock() = Some(err.to_string());
                }
            }));

        let handle = {
            let mut shaders = self.inner.shaders.write();
            let (handle, _) = shaders.allocate();
            ShaderHandle(handle)
        };

        let inner = Arc::clone(&self.inner);
        let task_core = Arc::clone(&core);
        let name = desc.name.clone();
        let entry_point = desc.entry_point.clone();
        let compile_step = self
            .inner
            .ts
            .create_task(format!("compile {}", desc.name), move || {
                inner.run_compile(handle, &name, &entry_point, &task_core);
            });

        {
            let mut shaders = self.inner.shaders.write();
            if let Some(state) = shaders.get_mut(handle.0) {
                state.compile_state = Some(CompileState {
                    core,
                    read_step,
                    compile_step,
                });
            }
        }

        self.inner
            .ts
            .depends(compile_step, self.inner.fs.as_task(read_step));
        self.inner.ts.execute(compile_step);

        log::trace!("shader db: requested compile of '{}'", desc.name);
        handle
    }

    /// Whether the shader finished compiling successfully.
    ///
    /// `false` for in-flight compiles, failed compiles, and invalid
    /// handles alike; use [`compile_error`](Self::compile_error) to
    /// discriminate failures.
    pub fn is_valid(&self, handle: ShaderHandle) -> bool {
        let shaders = self.inner.shaders.read();
        shaders
            .get(handle.0)
            .map(|state| state.ready && state.success)
            .unwrap_or(false)
    }

    /// Whether the compile reached a terminal state (either outcome).
    pub fn is_ready(&self, handle: ShaderHandle) -> bool {
        let shaders = self.inner.shaders.read();
        shaders
            .get(handle.0)
            .map(|state| state.ready)
            .unwrap_or(false)
    }

    /// Diagnostic for a failed compile, distinguishing I/O failures from
    /// compiler rejections.
    pub fn compile_error(&self, handle: ShaderHandle) -> Option<String> {
        let shaders = self.inner.shaders.read();
        shaders.get(handle.0).and_then(|state| state.diagnostic.clone())
    }

    /// Block until the compile finishes and tear down the transient
    /// compile state, leaving only the terminal flags.
    ///
    /// Calling `resolve` again after the state has been torn down is a
    /// no-op, as is resolving an invalid handle.
    pub fn resolve(&self, handle: ShaderHandle) {
        let steps = {
            let shaders = self.inner.shaders.read();
            shaders.get(handle.0).and_then(|state| {
                state
                    .compile_state
                    .as_ref()
                    .map(|cs| (cs.read_step, cs.compile_step))
            })
        };
        let Some((read_step, compile_step)) = steps else {
            return;
        };

        self.inner.ts.wait(compile_step);
        if read_step.is_valid() {
            self.inner.fs.close_handle(read_step);
        }
        self.inner.ts.clean_task_tree(compile_step);

        let mut shaders = self.inner.shaders.write();
        if let Some(state) = shaders.get_mut(handle.0) {
            state.compile_state = None;
        }
    }

    /// Resolve and release the shader's slot. The handle is invalid for
    /// further queries afterwards.
    pub fn release(&self, handle: ShaderHandle) {
        self.resolve(handle);
        let mut shaders = self.inner.shaders.write();
        shaders.release(handle.0);
    }

    /// Number of shaders currently in the table.
    pub fn shader_count(&self) -> usize {
        self.inner.shaders.read().len()
    }
}

static_assertions::assert_impl_all!(ShaderDatabase: Send, Sync);
