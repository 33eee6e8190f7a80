use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::looper::{LoopCallback, LoopHandle};

/// Result returned by a deferred task body. Errors are routed to the
/// owning loop's fault handling; they are never retried.
pub type TaskResult = anyhow::Result<()>;

/// An opaque unit of work. The same reference may be posted any number of
/// times; cancellation matches by reference identity, so keep a clone of
/// the `Arc` around if you intend to cancel later.
pub type Task = Arc<dyn Fn() -> TaskResult + Send + Sync>;

/// Tag for bulk cancellation of related tasks. `Category(0)` marks tasks
/// posted without an explicit category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Category(pub u32);

impl Category {
    /// Tasks posted through [`DeferredTaskScheduler::post`] and
    /// [`DeferredTaskScheduler::post_idle`] carry this tag.
    pub const DEFAULT: Category = Category(0);
}

/// How an entry is drained: on the next loop turn, or only once the loop
/// reports itself idle. Never exposed to callers.
#[derive(Clone, Copy)]
enum TaskKind {
    Immediate,
    Idle,
}

struct Entry {
    task: Task,
    category: Category,
    kind: TaskKind,
}

/// FIFO queue of pending tasks executed on the owning thread.
///
/// Tasks may be posted from any thread; execution is serialized on the
/// owning thread, one task per loop turn, in enqueue order. Idle tasks are
/// drained only once the loop has no other pending work, though never
/// before immediate tasks queued ahead of them.
///
/// The scheduler is cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct DeferredTaskScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Mutex<VecDeque<Entry>>,
    handle: Arc<dyn LoopHandle>,
}

impl DeferredTaskScheduler {
    pub fn new(handle: Arc<dyn LoopHandle>) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                handle,
            }),
        }
    }

    /// Append `task` to the queue tail, to run on the owning thread's next
    /// available turn.
    pub fn post(&self, task: Task) {
        self.post_with_category(task, Category::DEFAULT);
    }

    pub fn post_with_category(&self, task: Task, category: Category) {
        Inner::push(
            &self.inner,
            Entry {
                task,
                category,
                kind: TaskKind::Immediate,
            },
        );
    }

    /// Append `task` to the queue tail, to run once the owning thread's
    /// loop has no other pending work.
    pub fn post_idle(&self, task: Task) {
        self.post_idle_with_category(task, Category::DEFAULT);
    }

    pub fn post_idle_with_category(&self, task: Task, category: Category) {
        Inner::push(
            &self.inner,
            Entry {
                task,
                category,
                kind: TaskKind::Idle,
            },
        );
    }

    /// Remove every queued occurrence of `task`, matched by reference
    /// identity. A task already popped for execution is unaffected.
    pub fn cancel(&self, task: &Task) {
        let mut queue = self.inner.queue.lock().unwrap();
        queue.retain(|entry| !Arc::ptr_eq(&entry.task, task));
    }

    /// Remove every queued task tagged with `category`, immediate and idle
    /// alike. Other tasks keep their relative order.
    pub fn cancel_all_of_category(&self, category: Category) {
        let mut queue = self.inner.queue.lock().unwrap();
        let before = queue.len();
        queue.retain(|entry| entry.category != category);
        trace!(
            category = category.0,
            removed = before - queue.len(),
            "cancelled tasks by category"
        );
    }

    /// Clear the queue unconditionally. A task already in progress is
    /// unaffected.
    pub fn cancel_all(&self) {
        let mut queue = self.inner.queue.lock().unwrap();
        debug!(removed = queue.len(), "cancelled all queued tasks");
        queue.clear();
    }

    /// Synchronously run, on the calling thread and in FIFO order, every
    /// task queued at the moment of the call. Tasks enqueued while the
    /// flush is running are not part of the pass; they stay queued.
    pub fn flush(&self) {
        let drained: Vec<Entry> = {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.drain(..).collect()
        };

        trace!(count = drained.len(), "flushing queued tasks");
        for entry in drained {
            if let Err(error) = (entry.task)() {
                self.inner.handle.report_fault("flushed task failed", error);
            }
        }
    }

    /// Number of tasks currently queued (not counting one in progress).
    pub fn len(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().unwrap().is_empty()
    }
}

impl Inner {
    fn push(this: &Arc<Inner>, entry: Entry) {
        let mut queue = this.queue.lock().unwrap();
        let was_empty = queue.is_empty();
        queue.push_back(entry);

        // a non-empty queue already has a drain scheduled for its head
        if was_empty {
            Inner::schedule_next_locked(this, &queue);
        }
    }

    fn schedule_next_locked(this: &Arc<Inner>, queue: &VecDeque<Entry>) {
        let Some(head) = queue.front() else {
            return;
        };

        let inner = Arc::clone(this);
        let step: LoopCallback = Box::new(move || Inner::drain_one(&inner));

        match head.kind {
            TaskKind::Immediate => this.handle.post(step),
            TaskKind::Idle => this.handle.add_idle_observer(step),
        }
    }

    /// One drain step: pop the head under the lock, run it outside the
    /// lock so the task may enqueue more work, then decide whether another
    /// step is needed.
    fn drain_one(this: &Arc<Inner>) {
        let entry = {
            let mut queue = this.queue.lock().unwrap();
            match queue.pop_front() {
                Some(entry) => entry,
                // cancelled or flushed since this step was scheduled
                None => return,
            }
        };

        // the continuation must survive a panicking task body
        let _continuation = ScheduleNext {
            inner: Arc::clone(this),
        };

        trace!(category = entry.category.0, "draining task");
        if let Err(error) = (entry.task)() {
            this.handle.report_fault("deferred task failed", error);
        }
    }
}

struct ScheduleNext {
    inner: Arc<Inner>,
}

impl Drop for ScheduleNext {
    fn drop(&mut self) {
        let queue = self.inner.queue.lock().unwrap();
        Inner::schedule_next_locked(&self.inner, &queue);
    }
}
