//! One OS worker = a main thread + an aux thread, each with their own
//! [`ThreadQueue`], letting a running task suspend on a blocking call without
//! tying up the worker: the blocking call is handed to the aux thread while
//! the main thread recursively enters its own scheduler loop to service other
//! ready work.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::queue::ThreadQueue;
use crate::task::{Task, TaskContext, TaskFn};

/// A closure run on the aux thread to perform a blocking operation.
pub type BlockFn = Box<dyn FnOnce() + Send>;

pub enum ThreadWorkerMessage {
    RunJob {
        body: TaskFn,
        ctx: TaskContext,
    },
    RunAuxLambda {
        block_fn: BlockFn,
        target_stack: i64,
    },
    /// `target_stack < 0` means "unconditional": exit regardless of nesting depth.
    Signal {
        target_stack: i64,
    },
    Exit,
}

impl ThreadWorkerMessage {
    fn target_stack(&self) -> Option<i64> {
        match self {
            ThreadWorkerMessage::Signal { target_stack } => Some(*target_stack),
            ThreadWorkerMessage::Exit => Some(-1),
            _ => None,
        }
    }
}

/// Queue used by a worker's main thread, augmented with an "inactive
/// messages" holding pen for exit/signal messages that arrived for an outer
/// stack frame while a nested frame was still running.
struct WorkerQueue {
    queue: ThreadQueue<ThreadWorkerMessage>,
    inactive: Mutex<Vec<ThreadWorkerMessage>>,
}

impl WorkerQueue {
    fn new() -> Self {
        WorkerQueue {
            queue: ThreadQueue::new(),
            inactive: Mutex::new(Vec::new()),
        }
    }

    fn add_inactive(&self, msg: ThreadWorkerMessage) {
        self.inactive.lock().expect("inactive list poisoned").push(msg);
    }

    fn recover_inactive_messages(&self) {
        let mut inactive = self.inactive.lock().expect("inactive list poisoned");
        for msg in inactive.drain(..) {
            self.queue.push(msg);
        }
    }
}

thread_local! {
    static LOCAL_WORKER: Cell<*const ThreadWorker> = Cell::new(std::ptr::null());
}

/// Callback invoked (on the worker's main thread) after a task body returns.
pub type OnTaskComplete = Arc<dyn Fn(Task) + Send + Sync>;

pub struct ThreadWorker {
    main_queue: WorkerQueue,
    aux_queue: ThreadQueue<ThreadWorkerMessage>,
    active_depth: AtomicI64,
    on_task_complete: OnTaskComplete,
    threads: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl ThreadWorker {
    /// Spawn a worker's main and aux OS threads.
    pub fn start(on_task_complete: OnTaskComplete) -> Arc<Self> {
        let worker = Arc::new(ThreadWorker {
            main_queue: WorkerQueue::new(),
            aux_queue: ThreadQueue::new(),
            active_depth: AtomicI64::new(0),
            on_task_complete,
            threads: Mutex::new(None),
        });

        let main_worker = Arc::clone(&worker);
        let main_thread = std::thread::Builder::new()
            .name("splat-worker".into())
            .spawn(move || {
                Self::install_local(&main_worker);
                main_worker.run();
                debug_assert_eq!(main_worker.active_depth.load(Ordering::SeqCst), 0);
                Self::clear_local();
            })
            .expect("failed to spawn worker main thread");

        let aux_worker = Arc::clone(&worker);
        let aux_thread = std::thread::Builder::new()
            .name("splat-worker-aux".into())
            .spawn(move || {
                Self::install_local(&aux_worker);
                aux_worker.aux_loop();
                Self::clear_local();
            })
            .expect("failed to spawn worker aux thread");

        *worker.threads.lock().expect("threads mutex poisoned") = Some((main_thread, aux_thread));
        worker
    }

    fn install_local(worker: &Arc<ThreadWorker>) {
        LOCAL_WORKER.with(|cell| cell.set(Arc::as_ptr(worker)));
    }

    fn clear_local() {
        LOCAL_WORKER.with(|cell| cell.set(std::ptr::null()));
    }

    /// Returns the worker dispatching the currently-running task, or `None`
    /// if the calling thread is not one of a worker's main/aux threads.
    pub fn local() -> Option<*const ThreadWorker> {
        let ptr = LOCAL_WORKER.with(|cell| cell.get());
        if ptr.is_null() {
            None
        } else {
            Some(ptr)
        }
    }

    pub fn queue_len(&self) -> usize {
        self.main_queue.queue.len()
    }

    /// Main thread loop. Recursable: `wait_until` calls this again to form a
    /// nested scheduler frame.
    fn run(&self) {
        loop {
            let msg = self.main_queue.queue.wait_pop();
            match msg {
                ThreadWorkerMessage::RunJob { body, ctx } => {
                    self.run_in_thread(body, ctx);
                }
                other => {
                    let target = other.target_stack().unwrap_or(-1);
                    let depth = self.active_depth.load(Ordering::SeqCst);
                    if target == depth || target < 0 {
                        return;
                    }
                    self.main_queue.add_inactive(other);
                }
            }
        }
    }

    /// Run a job body directly on the calling thread, bypassing the queue.
    /// Used by [`crate::task::TaskSystem::yield_now`] to run a stolen job
    /// inline on the current stack frame.
    pub(crate) fn run_in_thread(&self, body: TaskFn, ctx: TaskContext) {
        debug_assert!(Self::local().is_some());
        let task = ctx.task;
        let result = panic::catch_unwind(AssertUnwindSafe(|| body(&ctx)));
        if let Err(panic) = result {
            tracing::error!(?task, "task body panicked, recording as failed");
            drop(panic);
        }
        (self.on_task_complete)(task);
    }

    fn aux_loop(&self) {
        loop {
            let msg = self.aux_queue.wait_pop();
            match msg {
                ThreadWorkerMessage::RunAuxLambda {
                    block_fn,
                    target_stack,
                } => {
                    block_fn();
                    self.main_queue.queue.push(ThreadWorkerMessage::Signal { target_stack });
                }
                ThreadWorkerMessage::Exit => return,
                _ => unreachable!("aux queue only ever holds RunAuxLambda/Exit"),
            }
        }
    }

    /// The suspension primitive: hand `block_fn` to the aux thread and nest a
    /// new scheduler frame on the calling (main) thread until it signals back.
    pub fn wait_until(&self, block_fn: BlockFn) {
        let target_stack = self.active_depth.load(Ordering::SeqCst) + 1;
        self.aux_queue.push(ThreadWorkerMessage::RunAuxLambda {
            block_fn,
            target_stack,
        });
        self.active_depth.fetch_add(1, Ordering::SeqCst);
        self.run();
        self.active_depth.fetch_sub(1, Ordering::SeqCst);
        self.main_queue.recover_inactive_messages();
    }

    /// Pop the first `RunJob` message off the main queue without disturbing
    /// the order of anything else, for use by [`crate::task::TaskSystem::yield_now`].
    pub fn steal_job(&self) -> Option<(TaskFn, TaskContext)> {
        let mut guard = self.main_queue.queue.acquire_thread();
        let mut skipped = Vec::new();
        let mut found = None;
        while let Some(msg) = self.main_queue.queue.unsafe_pop(&mut guard) {
            match msg {
                ThreadWorkerMessage::RunJob { body, ctx } => {
                    found = Some((body, ctx));
                    break;
                }
                other => skipped.push(other),
            }
        }
        for msg in skipped {
            self.main_queue.queue.unsafe_push(&mut guard, msg);
        }
        self.main_queue.queue.release_thread(guard);
        found
    }

    pub fn schedule(&self, body: TaskFn, ctx: TaskContext) {
        self.main_queue.queue.push(ThreadWorkerMessage::RunJob { body, ctx });
    }

    pub fn signal_stop(&self) {
        self.main_queue.queue.push(ThreadWorkerMessage::Exit);
        self.aux_queue.push(ThreadWorkerMessage::Exit);
    }

    pub fn join(&self) {
        let handles = self.threads.lock().expect("threads mutex poisoned").take();
        if let Some((main, aux)) = handles {
            let _ = main.join();
            let _ = aux.join();
        }
    }
}

/// Run `block_fn` via the local worker's aux-thread trap, or inline if the
/// calling thread is not a worker's main thread.
///
/// # Safety
///
/// Must only be called while [`ThreadWorker::local`] is non-null and the
/// calling thread is that worker's own main thread — callers from the aux
/// thread or a foreign thread must not reach this path (the task system's
/// `yield_until` enforces this by checking `ThreadWorker::local()` first).
pub(crate) unsafe fn wait_until_on_local_worker(worker: *const ThreadWorker, block_fn: BlockFn) {
    (*worker).wait_until(block_fn);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    #[test]
    fn run_job_invokes_completion_callback() {
        let (tx, rx) = mpsc::channel();
        let on_complete: OnTaskComplete = Arc::new(move |task| {
            tx.send(task).unwrap();
        });
        let worker = ThreadWorker::start(on_complete);

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let body: TaskFn = Box::new(move |_ctx| {
            ran_clone.store(true, Ordering::SeqCst);
        });
        let task = Task::from_raw_for_test(0, 0);
        worker.schedule(body, TaskContext { task });

        let completed = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(completed, task);
        assert!(ran.load(Ordering::SeqCst));

        worker.signal_stop();
        worker.join();
    }

    #[test]
    fn wait_until_services_other_jobs_while_blocked() {
        let (tx, rx) = mpsc::channel();
        let on_complete: OnTaskComplete = Arc::new(move |task| {
            tx.send(task).unwrap();
        });
        let worker = ThreadWorker::start(on_complete);

        let order = Arc::new(Mutex::new(Vec::new()));
        let order_for_blocker = Arc::clone(&order);
        let order_for_other = Arc::clone(&order);

        let (unblock_tx, unblock_rx) = mpsc::channel::<()>();
        let blocking_task = Task::from_raw_for_test(0, 0);
        let blocker_body: TaskFn = Box::new(move |ctx| {
            let local = ThreadWorker::local().expect("running inside worker");
            let order = Arc::clone(&order_for_blocker);
            unsafe {
                wait_until_on_local_worker(
                    local,
                    Box::new(move || {
                        unblock_rx.recv().unwrap();
                        order.lock().unwrap().push("blocked-done");
                    }),
                );
            }
            let _ = ctx;
        });
        worker.schedule(blocker_body, TaskContext { task: blocking_task });

        // Give the worker a moment to pick up the blocking task and start waiting.
        std::thread::sleep(std::time::Duration::from_millis(20));

        let other_task = Task::from_raw_for_test(1, 0);
        let other_body: TaskFn = Box::new(move |_ctx| {
            order_for_other.lock().unwrap().push("other-ran");
        });
        worker.schedule(other_body, TaskContext { task: other_task });

        // The "other" job must complete while the blocker is still suspended.
        let first = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(first, other_task);

        unblock_tx.send(()).unwrap();
        let second = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(second, blocking_task);

        let order = order.lock().unwrap();
        assert_eq!(&order[..], &["other-ran", "blocked-done"]);

        worker.signal_stop();
        worker.join();
    }
}
