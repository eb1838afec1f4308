//! # Ember Tasks
//!
//! A small worker-thread task system. Tasks are closures registered
//! against a handle table, optionally linked by dependencies, and drained
//! by a shared pool of worker threads. The render crate uses it to
//! pipeline shader source reads and compilation; the vfs crate runs its
//! streaming file reads on it.
//!
//! # Lifecycle
//!
//! ```ignore
//! let ts = Arc::new(TaskSystem::new(TaskSystemDesc::default()));
//! ts.start();
//!
//! let read = ts.create_task("read", || { /* ... */ });
//! let compile = ts.create_task("compile", || { /* ... */ });
//! ts.depends(compile, read);
//! ts.execute(compile); // schedules the whole chain
//! ts.wait(compile);
//! ts.clean_task_tree(compile);
//!
//! ts.signal_stop();
//! ts.join();
//! ```

mod system;

pub use system::{Task, TaskSystem, TaskSystemDesc};
