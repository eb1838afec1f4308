//! Task system implementation.
//!
//! Tasks live in a generational [`HandleTable`] guarded by a single mutex;
//! a separate ready queue feeds the worker threads. A task becomes ready
//! when it has been scheduled via [`TaskSystem::execute`] and its last
//! unfinished dependency completes.
//!
//! [`TaskSystem::wait`] can *inline-drive* the awaited task: if the task
//! is ready but no worker has started it yet, the waiting thread claims
//! and runs it in place. This keeps a blocking wait issued from inside a
//! task (the shader include path does exactly that) from deadlocking the
//! pool even at a pool size of one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use ember_core::{Handle, HandleTable};
use parking_lot::{Condvar, Mutex};

/// Configuration for [`TaskSystem::new`].
#[derive(Debug, Clone)]
pub struct TaskSystemDesc {
    /// Number of worker threads. Must be at least one.
    pub thread_pool_size: usize,
}

impl Default for TaskSystemDesc {
    fn default() -> Self {
        Self {
            thread_pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Handle to a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Task(pub(crate) Handle<TaskSlot>);

impl Task {
    /// Whether this handle names a task at all (not whether it is live).
    pub fn is_valid(&self) -> bool {
        self.0.is_valid()
    }
}

type WorkFn = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub(crate) struct TaskSlot {
    name: String,
    work: Option<WorkFn>,
    dependencies: Vec<Task>,
    dependents: Vec<Task>,
    unfinished_deps: usize,
    scheduled: bool,
    finished: bool,
}

struct TaskSystemInner {
    tasks: Mutex<HandleTable<TaskSlot>>,
    ready: Mutex<VecDeque<Task>>,
    /// Wakes workers when the ready queue grows or the system stops.
    work_cv: Condvar,
    /// Wakes `wait` callers when any task finishes. Paired with `tasks`.
    finish_cv: Condvar,
    running: AtomicBool,
}

impl TaskSystemInner {
    /// Mark a task finished and promote dependents whose last dependency
    /// this was.
    fn finish_task(&self, task: Task) {
        let mut newly_ready = Vec::new();
        {
            let mut tasks = self.tasks.lock();
            let dependents = match tasks.get_mut(task.0) {
                Some(slot) => {
                    slot.finished = true;
                    std::mem::take(&mut slot.dependents)
                }
                None => return,
            };
            for dependent in dependents {
                if let Some(slot) = tasks.get_mut(dependent.0) {
                    debug_assert!(slot.unfinished_deps > 0);
                    slot.unfinished_deps -= 1;
                    if slot.scheduled && slot.unfinished_deps == 0 {
                        newly_ready.push(dependent);
                    }
                }
            }
        }
        if !newly_ready.is_empty() {
            self.ready.lock().extend(newly_ready);
            self.work_cv.notify_all();
        }
        self.finish_cv.notify_all();
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let task = {
                let mut ready = self.ready.lock();
                loop {
                    if let Some(task) = ready.pop_front() {
                        break Some(task);
                    }
                    if !self.running.load(Ordering::Acquire) {
                        break None;
                    }
                    self.work_cv.wait(&mut ready);
                }
            };
            let Some(task) = task else {
                return;
            };

            // Claim the work closure under the table lock. A `wait` caller
            // may have inline-driven the task already, in which case the
            // closure is gone and there is nothing left to do.
            let work = self.tasks.lock().get_mut(task.0).and_then(|s| s.work.take());
            if let Some(work) = work {
                work();
                self.finish_task(task);
            }
        }
    }
}

/// Worker-thread task system with dependency links.
///
/// Thread-safe; typically shared as `Arc<TaskSystem>`. See the crate docs
/// for the lifecycle.
pub struct TaskSystem {
    inner: Arc<TaskSystemInner>,
    desc: TaskSystemDesc,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSystem {
    /// Create a stopped task system. Call [`start`](Self::start) before
    /// executing tasks.
    pub fn new(desc: TaskSystemDesc) -> Self {
        assert!(desc.thread_pool_size >= 1, "thread pool needs at least one worker");
        Self {
            inner: Arc::new(TaskSystemInner {
                tasks: Mutex::new(HandleTable::new()),
                ready: Mutex::new(VecDeque::new()),
                work_cv: Condvar::new(),
                finish_cv: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            desc,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Create and immediately start a task system.
    pub fn start_new(desc: TaskSystemDesc) -> Self {
        let system = Self::new(desc);
        system.start();
        system
    }

    /// Spawn the worker threads. Idempotent.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        for index in 0..self.desc.thread_pool_size {
            let inner = Arc::clone(&self.inner);
            let handle = std::thread::Builder::new()
                .name(format!("ember-task-{index}"))
                .spawn(move || inner.worker_loop())
                .expect("failed to spawn task worker");
            workers.push(handle);
        }
        log::debug!("task system started with {} workers", self.desc.thread_pool_size);
    }

    /// Ask the workers to stop once the ready queue drains.
    pub fn signal_stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.work_cv.notify_all();
    }

    /// Join all worker threads. Call [`signal_stop`](Self::signal_stop) first.
    pub fn join(&self) {
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Register a task. The task is not scheduled until
    /// [`execute`](Self::execute) is called on it (or on a dependent).
    pub fn create_task(
        &self,
        name: impl Into<String>,
        work: impl FnOnce() + Send + 'static,
    ) -> Task {
        let mut tasks = self.inner.tasks.lock();
        let (handle, slot) = tasks.allocate();
        slot.name = name.into();
        slot.work = Some(Box::new(work));
        Task(handle)
    }

    /// Record that `dependent` must not run before `dependency` finishes.
    ///
    /// Must be called before `dependent` is executed. Links to an already
    /// finished dependency are accepted and have no effect.
    pub fn depends(&self, dependent: Task, dependency: Task) {
        let mut tasks = self.inner.tasks.lock();
        let dependency_finished = match tasks.get(dependency.0) {
            Some(slot) => slot.finished,
            None => {
                debug_assert!(false, "depends: invalid dependency handle");
                return;
            }
        };
        let Some(slot) = tasks.get_mut(dependent.0) else {
            debug_assert!(false, "depends: invalid dependent handle");
            return;
        };
        debug_assert!(!slot.scheduled, "depends: dependency added after execute");
        slot.dependencies.push(dependency);
        if !dependency_finished {
            slot.unfinished_deps += 1;
            tasks[dependency.0].dependents.push(dependent);
        }
    }

    /// Schedule a task for execution, transitively scheduling any of its
    /// dependencies that have not been scheduled yet. Idempotent.
    pub fn execute(&self, task: Task) {
        let mut to_queue = Vec::new();
        {
            let mut tasks = self.inner.tasks.lock();
            let mut stack = vec![task];
            while let Some(current) = stack.pop() {
                let Some(slot) = tasks.get_mut(current.0) else {
                    debug_assert!(false, "execute: invalid task handle");
                    continue;
                };
                if slot.scheduled || slot.finished {
                    continue;
                }
                slot.scheduled = true;
                stack.extend(slot.dependencies.iter().copied());
                if slot.unfinished_deps == 0 {
                    to_queue.push(current);
                }
            }
        }
        if !to_queue.is_empty() {
            self.inner.ready.lock().extend(to_queue);
            self.inner.work_cv.notify_all();
        }
    }

    /// Block until the task finishes.
    ///
    /// If the task is ready but not yet picked up by a worker, the calling
    /// thread claims and runs it in place instead of sleeping. Waiting on
    /// a released handle returns immediately.
    pub fn wait(&self, task: Task) {
        let mut tasks = self.inner.tasks.lock();
        loop {
            let Some(slot) = tasks.get_mut(task.0) else {
                return;
            };
            if slot.finished {
                return;
            }
            debug_assert!(slot.scheduled, "waiting on a task that was never executed");
            if slot.unfinished_deps == 0 {
                if let Some(work) = slot.work.take() {
                    drop(tasks);
                    work();
                    self.inner.finish_task(task);
                    return;
                }
            }
            self.inner.finish_cv.wait(&mut tasks);
        }
    }

    /// Non-blocking completion poll. A released handle reads as finished.
    pub fn is_finished(&self, task: Task) -> bool {
        self.inner
            .tasks
            .lock()
            .get(task.0)
            .map(|slot| slot.finished)
            .unwrap_or(true)
    }

    /// Release the task and its dependency closure from the table.
    ///
    /// Every task in the tree must have finished (or never been
    /// scheduled). Tasks already cleaned through another tree are skipped.
    pub fn clean_task_tree(&self, task: Task) {
        let mut tasks = self.inner.tasks.lock();
        let mut stack = vec![task];
        while let Some(current) = stack.pop() {
            if let Some(slot) = tasks.release(current.0) {
                debug_assert!(
                    slot.finished || !slot.scheduled,
                    "cleaning unfinished task '{}'",
                    slot.name
                );
                stack.extend(slot.dependencies);
            }
        }
    }

    /// Number of tasks currently registered (finished-but-not-cleaned
    /// tasks included).
    pub fn live_tasks(&self) -> usize {
        self.inner.tasks.lock().len()
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        self.signal_stop();
        self.join();
        let tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            log::warn!("task system dropped with {} uncleaned tasks", tasks.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn small_system() -> TaskSystem {
        TaskSystem::start_new(TaskSystemDesc {
            thread_pool_size: 2,
        })
    }

    #[test]
    fn execute_runs_task() {
        let ts = small_system();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let task = ts.create_task("t", move || flag.store(true, Ordering::Release));
        ts.execute(task);
        ts.wait(task);
        assert!(ran.load(Ordering::Acquire));
        ts.clean_task_tree(task);
        assert_eq!(ts.live_tasks(), 0);
    }

    #[test]
    fn dependency_runs_first() {
        let ts = small_system();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        let first = ts.create_task("first", move || o.lock().push(1));
        let o = Arc::clone(&order);
        let second = ts.create_task("second", move || o.lock().push(2));

        ts.depends(second, first);
        ts.execute(second); // schedules `first` transitively
        ts.wait(second);

        assert_eq!(*order.lock(), vec![1, 2]);
        ts.clean_task_tree(second);
        assert_eq!(ts.live_tasks(), 0);
    }

    #[test]
    fn diamond_dependencies_complete() {
        let ts = small_system();
        let counter = Arc::new(AtomicUsize::new(0));

        let mk = |name: &str| {
            let c = Arc::clone(&counter);
            ts.create_task(name, move || {
                c.fetch_add(1, Ordering::AcqRel);
            })
        };
        let a = mk("a");
        let b = mk("b");
        let c = mk("c");
        let d = mk("d");
        ts.depends(b, a);
        ts.depends(c, a);
        ts.depends(d, b);
        ts.depends(d, c);

        ts.execute(d);
        ts.wait(d);
        assert_eq!(counter.load(Ordering::Acquire), 4);
        ts.clean_task_tree(d);
    }

    #[test]
    fn wait_inline_drives_with_single_worker() {
        // One worker, occupied by a task that itself waits on a second
        // task. The nested wait must run the inner task in place instead
        // of deadlocking.
        let ts = Arc::new(TaskSystem::start_new(TaskSystemDesc {
            thread_pool_size: 1,
        }));

        let inner_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&inner_ran);
        let inner = ts.create_task("inner", move || flag.store(true, Ordering::Release));

        let ts2 = Arc::clone(&ts);
        let outer = ts.create_task("outer", move || {
            ts2.execute(inner);
            ts2.wait(inner);
        });
        ts.execute(outer);
        ts.wait(outer);

        assert!(inner_ran.load(Ordering::Acquire));
        ts.clean_task_tree(outer);
        ts.clean_task_tree(inner);
    }

    #[test]
    fn wait_on_cleaned_task_returns() {
        let ts = small_system();
        let task = ts.create_task("t", || {});
        ts.execute(task);
        ts.wait(task);
        ts.clean_task_tree(task);
        // Handle is stale now; wait must not block or panic.
        ts.wait(task);
        assert!(ts.is_finished(task));
    }

    #[test]
    fn many_independent_tasks() {
        let ts = small_system();
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let c = Arc::clone(&counter);
                let t = ts.create_task(format!("t{i}"), move || {
                    c.fetch_add(1, Ordering::AcqRel);
                });
                ts.execute(t);
                t
            })
            .collect();
        for &t in &tasks {
            ts.wait(t);
        }
        assert_eq!(counter.load(Ordering::Acquire), 64);
        for &t in &tasks {
            ts.clean_task_tree(t);
        }
        assert_eq!(ts.live_tasks(), 0);
    }

    #[test]
    fn dependency_on_finished_task_is_noop() {
        let ts = small_system();
        let first = ts.create_task("first", || {});
        ts.execute(first);
        ts.wait(first);

        let second = ts.create_task("second", || {});
        ts.depends(second, first);
        ts.execute(second);
        ts.wait(second);
        assert!(ts.is_finished(second));

        ts.clean_task_tree(second);
        ts.clean_task_tree(first);
    }
}
