//! Streaming asynchronous file reads.
//!
//! Each read request becomes a task on the shared [`TaskSystem`]. The
//! request callback observes the file as a sequence of [`FileChunk`]
//! values: zero or more `Reading` chunks, then exactly one `Success` or
//! `Fail`. The callback runs on whatever worker thread executes the read
//! task, never on the issuing thread.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use ember_core::{Handle, HandleTable};
use ember_tasks::{Task, TaskSystem};
use parking_lot::Mutex;

use crate::VfsError;
use crate::path;

/// Size of a streamed read segment.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// One step of a streaming read, delivered to the request callback.
pub enum FileChunk<'a> {
    /// A segment of the file, in order. More chunks may follow.
    Reading(&'a [u8]),
    /// The file was read to the end. Terminal.
    Success,
    /// The read failed. Terminal; no further chunks follow.
    Fail(VfsError),
}

type ResponseFn = Box<dyn FnMut(FileChunk<'_>) + Send>;

/// A read request: a path plus the callback that receives the chunks.
pub struct FileReadRequest {
    pub path: String,
    pub on_response: ResponseFn,
}

impl FileReadRequest {
    pub fn new(path: impl Into<String>, on_response: impl FnMut(FileChunk<'_>) + Send + 'static) -> Self {
        Self {
            path: path.into(),
            on_response: Box::new(on_response),
        }
    }
}

/// Handle to an in-flight (or finished but not yet closed) read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsyncFileHandle(Handle<RequestSlot>);

impl AsyncFileHandle {
    /// Whether this handle names a request at all.
    pub fn is_valid(&self) -> bool {
        self.0.is_valid()
    }
}

#[derive(Default)]
pub(crate) struct RequestSlot {
    task: Task,
    path: String,
}

/// Asynchronous file system.
///
/// Reads are scheduled as soon as they are issued; [`execute`](Self::execute)
/// is an idempotent re-schedule kept for callers that drive one request
/// synchronously (`execute` / `wait` / `close_handle`).
///
/// Thread-safe; shared as `Arc<AsyncFileSystem>`.
pub struct AsyncFileSystem {
    ts: Arc<TaskSystem>,
    root: Option<PathBuf>,
    requests: Mutex<HandleTable<RequestSlot>>,
}

impl AsyncFileSystem {
    /// Create a file system that resolves paths as given.
    pub fn new(ts: Arc<TaskSystem>) -> Self {
        Self {
            ts,
            root: None,
            requests: Mutex::new(HandleTable::new()),
        }
    }

    /// Create a file system rooted at a directory.
    ///
    /// Request paths are normalized (separators collapsed, `..` rejected)
    /// and joined onto the root.
    pub fn with_root(ts: Arc<TaskSystem>, root: impl Into<PathBuf>) -> Self {
        Self {
            ts,
            root: Some(root.into()),
            requests: Mutex::new(HandleTable::new()),
        }
    }

    /// Issue a streaming read and kick it off.
    pub fn read(&self, request: FileReadRequest) -> AsyncFileHandle {
        let FileReadRequest { path, mut on_response } = request;
        let resolved = self.resolve(&path);

        let task = self.ts.create_task(format!("read {path}"), move || {
            let full_path = match resolved {
                Ok(p) => p,
                Err(err) => {
                    on_response(FileChunk::Fail(err));
                    return;
                }
            };
            let mut file = match std::fs::File::open(&full_path) {
                Ok(f) => f,
                Err(err) => {
                    on_response(FileChunk::Fail(err.into()));
                    return;
                }
            };
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            loop {
                match file.read(&mut buf) {
                    Ok(0) => {
                        on_response(FileChunk::Success);
                        return;
                    }
                    Ok(n) => on_response(FileChunk::Reading(&buf[..n])),
                    Err(err) => {
                        on_response(FileChunk::Fail(err.into()));
                        return;
                    }
                }
            }
        });

        let handle = {
            let mut requests = self.requests.lock();
            let (handle, slot) = requests.allocate();
            slot.task = task;
            slot.path = path;
            AsyncFileHandle(handle)
        };

        self.ts.execute(task);
        handle
    }

    /// Schedule the request if it is not already running. Idempotent.
    pub fn execute(&self, handle: AsyncFileHandle) {
        if let Some(task) = self.task_of(handle) {
            self.ts.execute(task);
        }
    }

    /// Block until the request's terminal chunk has been delivered.
    pub fn wait(&self, handle: AsyncFileHandle) {
        if let Some(task) = self.task_of(handle) {
            self.ts.wait(task);
        }
    }

    /// The task backing this request, for dependency links.
    ///
    /// Returns [`Task::default`] (invalid) for a stale handle.
    pub fn as_task(&self, handle: AsyncFileHandle) -> Task {
        self.task_of(handle).unwrap_or_default()
    }

    /// Release the request slot and clean its task.
    ///
    /// Waits for the read to finish first, so it is safe to call right
    /// after issuing. Closing a stale handle is a no-op.
    pub fn close_handle(&self, handle: AsyncFileHandle) {
        let slot = { self.requests.lock().release(handle.0) };
        if let Some(slot) = slot {
            self.ts.wait(slot.task);
            self.ts.clean_task_tree(slot.task);
            log::trace!("vfs: closed read of '{}'", slot.path);
        }
    }

    /// Number of open (not yet closed) requests.
    pub fn open_requests(&self) -> usize {
        self.requests.lock().len()
    }

    fn task_of(&self, handle: AsyncFileHandle) -> Option<Task> {
        let requests = self.requests.lock();
        let slot = requests.get(handle.0)?;
        Some(slot.task)
    }

    fn resolve(&self, raw: &str) -> Result<PathBuf, VfsError> {
        match &self.root {
            Some(root) => {
                let normalized = path::normalize(raw)?;
                Ok(root.join(normalized))
            }
            None => {
                if raw.is_empty() {
                    return Err(VfsError::InvalidPath("empty path".into()));
                }
                Ok(PathBuf::from(raw))
            }
        }
    }
}

impl Drop for AsyncFileSystem {
    fn drop(&mut self) {
        let requests = self.requests.lock();
        if !requests.is_empty() {
            log::warn!(
                "file system dropped with {} open read handles",
                requests.len()
            );
            debug_assert!(requests.is_empty(), "unclosed file read handles");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_tasks::TaskSystemDesc;

    fn test_system() -> Arc<TaskSystem> {
        Arc::new(TaskSystem::start_new(TaskSystemDesc {
            thread_pool_size: 2,
        }))
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ember_vfs_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Collects chunks into a shared buffer and records the terminal status.
    fn collecting_request(
        path: &str,
        data: Arc<Mutex<Vec<u8>>>,
        ok: Arc<Mutex<Option<bool>>>,
    ) -> FileReadRequest {
        FileReadRequest::new(path, move |chunk| match chunk {
            FileChunk::Reading(bytes) => data.lock().extend_from_slice(bytes),
            FileChunk::Success => *ok.lock() = Some(true),
            FileChunk::Fail(_) => *ok.lock() = Some(false),
        })
    }

    #[test]
    fn read_small_file() {
        let ts = test_system();
        let dir = temp_dir("small");
        std::fs::write(dir.join("hello.txt"), b"hello world").unwrap();

        let fs = AsyncFileSystem::with_root(ts, &dir);
        let data = Arc::new(Mutex::new(Vec::new()));
        let ok = Arc::new(Mutex::new(None));
        let handle = fs.read(collecting_request(
            "hello.txt",
            Arc::clone(&data),
            Arc::clone(&ok),
        ));
        fs.wait(handle);
        fs.close_handle(handle);

        assert_eq!(*ok.lock(), Some(true));
        assert_eq!(&*data.lock(), b"hello world");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn read_streams_multiple_chunks() {
        let ts = test_system();
        let dir = temp_dir("chunks");
        let expected: Vec<u8> = (0..(READ_CHUNK_SIZE * 2 + 1234))
            .map(|i| (i % 251) as u8)
            .collect();
        std::fs::write(dir.join("big.bin"), &expected).unwrap();

        let fs = AsyncFileSystem::with_root(ts, &dir);
        let data = Arc::new(Mutex::new(Vec::new()));
        let ok = Arc::new(Mutex::new(None));
        let handle = fs.read(collecting_request(
            "big.bin",
            Arc::clone(&data),
            Arc::clone(&ok),
        ));
        fs.wait(handle);
        fs.close_handle(handle);

        assert_eq!(*ok.lock(), Some(true));
        assert_eq!(*data.lock(), expected);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_reports_fail() {
        let ts = test_system();
        let dir = temp_dir("missing");

        let fs = AsyncFileSystem::with_root(ts, &dir);
        let data = Arc::new(Mutex::new(Vec::new()));
        let ok = Arc::new(Mutex::new(None));
        let handle = fs.read(collecting_request(
            "nope.txt",
            Arc::clone(&data),
            Arc::clone(&ok),
        ));
        fs.wait(handle);
        fs.close_handle(handle);

        assert_eq!(*ok.lock(), Some(false));
        assert!(data.lock().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn traversal_path_reports_fail() {
        let ts = test_system();
        let dir = temp_dir("traversal");

        let fs = AsyncFileSystem::with_root(ts, &dir);
        let ok = Arc::new(Mutex::new(None));
        let ok2 = Arc::clone(&ok);
        let handle = fs.read(FileReadRequest::new("../secret.txt", move |chunk| {
            if let FileChunk::Fail(err) = chunk {
                assert!(matches!(err, VfsError::InvalidPath(_)));
                *ok2.lock() = Some(false);
            }
        }));
        fs.wait(handle);
        fs.close_handle(handle);

        assert_eq!(*ok.lock(), Some(false));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn synchronous_drive_of_single_request() {
        // The execute/wait/close pattern used by the shader include path.
        let ts = test_system();
        let dir = temp_dir("sync_drive");
        std::fs::write(dir.join("inc.wgsl"), b"const K: f32 = 1.0;").unwrap();

        let fs = AsyncFileSystem::with_root(ts, &dir);
        let data = Arc::new(Mutex::new(Vec::new()));
        let ok = Arc::new(Mutex::new(None));
        let handle = fs.read(collecting_request(
            "inc.wgsl",
            Arc::clone(&data),
            Arc::clone(&ok),
        ));
        fs.execute(handle);
        fs.wait(handle);
        fs.close_handle(handle);

        assert_eq!(*ok.lock(), Some(true));
        assert_eq!(&*data.lock(), b"const K: f32 = 1.0;");
        assert_eq!(fs.open_requests(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn dependent_task_runs_after_read() {
        let ts = test_system();
        let dir = temp_dir("dependent");
        std::fs::write(dir.join("src.txt"), b"abc").unwrap();

        let fs = AsyncFileSystem::with_root(Arc::clone(&ts), &dir);
        let data = Arc::new(Mutex::new(Vec::new()));
        let ok = Arc::new(Mutex::new(None));
        let handle = fs.read(collecting_request(
            "src.txt",
            Arc::clone(&data),
            Arc::clone(&ok),
        ));

        // The dependent task must observe the complete file contents.
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let data2 = Arc::clone(&data);
        let consume = ts.create_task("consume", move || {
            seen2.lock().extend_from_slice(&data2.lock());
        });
        ts.depends(consume, fs.as_task(handle));
        ts.execute(consume);
        ts.wait(consume);

        assert_eq!(&*seen.lock(), b"abc");

        ts.clean_task_tree(consume);
        fs.close_handle(handle);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn close_without_wait_is_safe() {
        let ts = test_system();
        let dir = temp_dir("close_early");
        std::fs::write(dir.join("f.txt"), vec![7u8; READ_CHUNK_SIZE]).unwrap();

        let fs = AsyncFileSystem::with_root(ts, &dir);
        let handle = fs.read(FileReadRequest::new("f.txt", |_| {}));
        // close_handle waits internally before releasing.
        fs.close_handle(handle);
        assert_eq!(fs.open_requests(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
