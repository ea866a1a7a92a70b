//! The deferred task queue promises dispatch their reactions through.
//!
//! Nothing in this crate runs a reaction synchronously. Every reaction is
//! handed to a [`Schedule`] and runs once the host drains it. [`TaskQueue`]
//! is the single-threaded FIFO implementation; hosts with their own event
//! loop can implement [`Schedule`] instead.
use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Accepts tasks to run later.
///
/// `enqueue` must not run the task before returning. Tasks must run in the
/// order they were enqueued.
pub trait Schedule {
    fn enqueue(&self, task: Task);
}

/// A manually drained FIFO of tasks.
///
/// Clones share the same queue.
///
/// # Examples
///
/// ```
/// use promise_chain::{Schedule, TaskQueue};
/// use std::{cell::Cell, rc::Rc};
///
/// let queue = TaskQueue::new();
/// let ran = Rc::new(Cell::new(false));
/// let flag = ran.clone();
/// queue.enqueue(Box::new(move || flag.set(true)));
/// assert!(!ran.get());
/// assert_eq!(queue.run_until_stalled(), 1);
/// assert!(ran.get());
/// ```
#[derive(Clone, Default)]
pub struct TaskQueue {
    tasks: Rc<RefCell<VecDeque<Task>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tasks: Rc::new(RefCell::new(VecDeque::with_capacity(capacity))),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Runs the oldest task. Returns `false` if there was nothing to run.
    pub fn run_next(&self) -> bool {
        // The borrow has to end before the task runs, it may enqueue more.
        let task = self.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks until the queue is empty, including tasks enqueued while
    /// draining. Returns how many tasks ran.
    pub fn run_until_stalled(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        tracing::trace!(ran, "task queue stalled");
        ran
    }
}

impl Schedule for TaskQueue {
    fn enqueue(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue").field("len", &self.len()).finish()
    }
}
