//! Deferred destruction of GPU-visible state.
//!
//! GPU commands execute asynchronously: when a batch is submitted the CPU
//! moves on while the GPU may still be reading the resources the batch
//! referenced. Destruction is therefore deferred — each released object is
//! tagged with the fence value that covers all GPU work enqueued so far,
//! and only destroyed once that value is observed signaled on the CPU.
//!
//! Entries are enqueued in non-decreasing fence order, so a collection
//! pass walks the queue front and stops at the first unsignaled entry; a
//! single frontier, no scanning past it. Ordering is per logical queue —
//! the device drives one — and nothing stronger is guaranteed.
//!
//! The destructor is payload-generic and does not destroy anything
//! itself: [`collect`](DeferredDestructor::collect) returns the payloads
//! whose fences have retired and the owner disposes of them (backend
//! destroy, pool free, work-slot release).

use std::collections::VecDeque;

use parking_lot::Mutex;

struct Entry<P> {
    payload: P,
    fence_value: u64,
}

/// Fence-gated deferred destruction queue.
pub struct DeferredDestructor<P> {
    pending: Mutex<VecDeque<Entry<P>>>,
}

impl<P> DeferredDestructor<P> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue a payload to be reclaimed once `fence_value` is signaled.
    ///
    /// The queue keeps fence values non-decreasing: a payload tagged with
    /// an older fence than the current tail is clamped up to the tail's
    /// value. Reclamation only gets more conservative, never less safe.
    pub fn defer(&self, payload: P, fence_value: u64) {
        let mut pending = self.pending.lock();
        let fence_value = pending
            .back()
            .map_or(fence_value, |e| e.fence_value.max(fence_value));
        pending.push_back(Entry {
            payload,
            fence_value,
        });
    }

    /// Pop every entry whose fence value is `<= completed`, in enqueue
    /// order, stopping at the first unsignaled entry.
    pub fn collect(&self, completed: u64) -> Vec<P> {
        let mut pending = self.pending.lock();
        let mut reclaimed = Vec::new();
        while let Some(front) = pending.front() {
            if front.fence_value > completed {
                break;
            }
            reclaimed.push(pending.pop_front().unwrap().payload);
        }
        reclaimed
    }

    /// Drain everything regardless of fence state.
    ///
    /// Shutdown path only: the caller must have waited for the GPU to go
    /// idle first.
    pub fn drain_all(&self) -> Vec<P> {
        self.pending.lock().drain(..).map(|e| e.payload).collect()
    }

    /// Number of entries waiting on a fence.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl<P> Default for DeferredDestructor<P> {
    fn default() -> Self {
        Self::new()
    }
}
