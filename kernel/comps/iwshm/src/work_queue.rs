// SPDX-License-Identifier: MPL-2.0

//! Deferred work.
//!
//! Notifications from the peer arrive on the event dispatcher's call stack.
//! Work that must not run there (e.g., dropping the last reference to a
//! registration, which may block on a hypervisor handshake) is submitted to a
//! [`WorkQueue`] and executed once the dispatcher has left its callbacks.
//!
//! # Examples
//!
//! ```ignore
//! let queue = WorkQueue::new();
//! queue.submit_work_func(|| debug!("later"));
//! // ... on the draining context:
//! queue.run_pending();
//! ```

use core::sync::atomic::{AtomicBool, Ordering};

use intrusive_collections::{LinkedListAtomicLink, intrusive_adapter, linked_list::LinkedList};

use crate::prelude::*;

/// A task to be executed by the context draining a [`WorkQueue`].
pub struct WorkItem {
    work_func: Box<dyn Fn() + Send + Sync>,
    was_pending: AtomicBool,
    link: LinkedListAtomicLink,
}

intrusive_adapter!(WorkItemAdapter = Arc<WorkItem>: WorkItem { link: LinkedListAtomicLink });

impl WorkItem {
    pub fn new(work_func: Box<dyn Fn() + Send + Sync>) -> Arc<WorkItem> {
        Arc::new(WorkItem {
            work_func,
            was_pending: AtomicBool::new(false),
            link: LinkedListAtomicLink::new(),
        })
    }

    pub fn is_pending(&self) -> bool {
        self.was_pending.load(Ordering::Acquire)
    }

    fn try_pending(&self) -> bool {
        self.was_pending
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn set_processing(&self) {
        self.was_pending.store(false, Ordering::Release);
    }

    fn call_work_func(&self) {
        (self.work_func)()
    }
}

/// A queue of pending [`WorkItem`]s.
pub struct WorkQueue {
    pending_work_items: Mutex<LinkedList<WorkItemAdapter>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            pending_work_items: Mutex::new(LinkedList::new(WorkItemAdapter::new())),
        }
    }

    /// Submits a function.
    pub fn submit_work_func<F>(&self, work_func: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.enqueue(WorkItem::new(Box::new(work_func)));
    }

    /// Submits a work item. Returns `false` if the work item is currently pending.
    pub fn enqueue(&self, work_item: Arc<WorkItem>) -> bool {
        if !work_item.try_pending() {
            return false;
        }
        self.pending_work_items.lock().push_back(work_item);
        true
    }

    pub fn has_pending_work_items(&self) -> bool {
        !self.pending_work_items.lock().is_empty()
    }

    /// Runs the pending work items, including those submitted meanwhile.
    ///
    /// Returns the number of items that ran.
    pub fn run_pending(&self) -> usize {
        let mut nr_run = 0;
        loop {
            // Avoid holding the lock when calling the work function
            let Some(work_item) = self.pending_work_items.lock().pop_front() else {
                break;
            };
            work_item.set_processing();
            work_item.call_work_func();
            nr_run += 1;
        }
        nr_run
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for WorkQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("has_pending", &self.has_pending_work_items())
            .finish()
    }
}
