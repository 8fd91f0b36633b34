//! Cooperative task graph on top of a fixed pool of [`ThreadWorker`]s:
//! create tasks, wire up-front dependency edges between them, execute the
//! roots, and let completions cascade through the graph.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use smallvec::SmallVec;

use crate::error::Error;
use crate::handle::HandleTable;
use crate::worker::{wait_until_on_local_worker, OnTaskComplete, ThreadWorker};

/// Opaque reference to a scheduled unit of work.
pub type Task = crate::handle::Handle<TaskRecord>;

/// What a running task body sees. Unlike the source's `void* data` payload,
/// the body closure captures whatever state it needs directly, so the only
/// thing left to thread through is the task's own identity.
pub struct TaskContext {
    pub task: Task,
}

/// A task body. Boxed and type-erased the way a worker queue entry has to
/// be, but owned rather than a borrowed `void*` — the closure captures its
/// payload by value.
pub type TaskFn = Box<dyn FnOnce(&TaskContext) + Send>;

/// What to run when a task is executed, and its display name for logging.
pub struct TaskDesc {
    pub name: &'static str,
    body: Option<TaskFn>,
}

impl TaskDesc {
    pub fn new(name: &'static str, body: impl FnOnce(&TaskContext) + Send + 'static) -> Self {
        TaskDesc {
            name,
            body: Some(Box::new(body)),
        }
    }

    /// A task with no body of its own — useful as a join point for a set of
    /// dependencies, or as the root of a subtree cleaned with
    /// [`TaskSystem::clean_task_tree`].
    pub fn placeholder(name: &'static str) -> Self {
        TaskDesc { name, body: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Created,
    Scheduled,
    Running,
    Completed,
}

pub struct TaskRecord {
    name: &'static str,
    body: Option<TaskFn>,
    state: TaskState,
    pending_deps: usize,
    children: SmallVec<[Task; 4]>,
}

/// Worker-pool sizing. Defaults to the number of logical CPUs, mirroring
/// the source's "one worker per hardware thread" default.
pub struct TaskSystemConfig {
    pub num_workers: usize,
}

impl Default for TaskSystemConfig {
    fn default() -> Self {
        TaskSystemConfig {
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

struct Inner {
    tasks: Mutex<HandleTable<TaskRecord>>,
    completed: Condvar,
    workers: Vec<Arc<ThreadWorker>>,
    next_worker: AtomicUsize,
}

/// Owns a worker pool and the handle table backing every task it schedules.
#[derive(Clone)]
pub struct TaskSystem(Arc<Inner>);

impl TaskSystem {
    pub fn new(config: TaskSystemConfig) -> Self {
        let num_workers = config.num_workers.max(1);
        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<Inner>| {
            let weak = weak.clone();
            let on_task_complete: OnTaskComplete = Arc::new(move |task| {
                if let Some(inner) = weak.upgrade() {
                    Self::handle_completion(&inner, task);
                }
            });
            let workers = (0..num_workers)
                .map(|_| ThreadWorker::start(Arc::clone(&on_task_complete)))
                .collect();
            Inner {
                tasks: Mutex::new(HandleTable::new()),
                completed: Condvar::new(),
                workers,
                next_worker: AtomicUsize::new(0),
            }
        });
        TaskSystem(inner)
    }

    fn pick_worker(&self) -> Arc<ThreadWorker> {
        let index = self.0.next_worker.fetch_add(1, Ordering::Relaxed) % self.0.workers.len();
        Arc::clone(&self.0.workers[index])
    }

    /// Register a task. It is not scheduled until its dependency count
    /// reaches zero and either [`TaskSystem::execute`] names it directly or
    /// one of its dependencies completes.
    pub fn create_task(&self, desc: TaskDesc) -> Task {
        let record = TaskRecord {
            name: desc.name,
            body: desc.body,
            state: TaskState::Created,
            pending_deps: 0,
            children: SmallVec::new(),
        };
        let mut tasks = self.0.tasks.lock().expect("task table poisoned");
        tasks
            .allocate(record)
            .expect("task table has unbounded capacity")
    }

    /// `dst` will not become eligible to run until `src` completes. Illegal
    /// (and rejected) once `src` has already started.
    pub fn depends(&self, src: Task, dst: Task) -> Result<(), Error> {
        let mut tasks = self.0.tasks.lock().expect("task table poisoned");
        let src_state = tasks
            .get(src)
            .map(|r| r.state)
            .ok_or(Error::Contract("depends: unknown source task"))?;
        if src_state != TaskState::Created {
            return Err(Error::Contract(
                "depends: source task has already started running",
            ));
        }
        if !tasks.contains(dst) {
            return Err(Error::Contract("depends: unknown destination task"));
        }
        tasks.get_mut(dst).unwrap().pending_deps += 1;
        tasks.get_mut(src).unwrap().children.push(dst);
        Ok(())
    }

    /// Schedule `task` if it has no outstanding dependencies. A task with
    /// pending dependencies is scheduled transitively once they complete.
    pub fn execute(&self, task: Task) {
        let ready = {
            let mut tasks = self.0.tasks.lock().expect("task table poisoned");
            match tasks.get_mut(task) {
                Some(record) if record.state == TaskState::Created && record.pending_deps == 0 => {
                    record.state = TaskState::Scheduled;
                    true
                }
                _ => false,
            }
        };
        if ready {
            self.dispatch(task);
        }
    }

    pub fn execute_many(&self, tasks: impl IntoIterator<Item = Task>) {
        for task in tasks {
            self.execute(task);
        }
    }

    fn dispatch(&self, task: Task) {
        let body = {
            let mut tasks = self.0.tasks.lock().expect("task table poisoned");
            match tasks.get_mut(task) {
                Some(record) => {
                    record.state = TaskState::Running;
                    record.body.take()
                }
                None => return,
            }
        };
        let body: TaskFn = body.unwrap_or_else(|| Box::new(|_ctx| {}));
        self.pick_worker().schedule(body, TaskContext { task });
    }

    fn handle_completion(inner: &Arc<Inner>, task: Task) {
        let ready_children = {
            let mut tasks = inner.tasks.lock().expect("task table poisoned");
            let children = match tasks.get_mut(task) {
                Some(record) => {
                    record.state = TaskState::Completed;
                    std::mem::take(&mut record.children)
                }
                None => SmallVec::new(),
            };
            let mut ready = Vec::new();
            for child in children {
                if let Some(child_record) = tasks.get_mut(child) {
                    child_record.pending_deps = child_record.pending_deps.saturating_sub(1);
                    if child_record.pending_deps == 0 && child_record.state == TaskState::Created {
                        child_record.state = TaskState::Scheduled;
                        ready.push(child);
                    }
                }
            }
            ready
        };
        inner.completed.notify_all();
        let system = TaskSystem(Arc::clone(inner));
        for child in ready_children {
            system.dispatch(child);
        }
    }

    pub fn is_completed(&self, task: Task) -> bool {
        let tasks = self.0.tasks.lock().expect("task table poisoned");
        match tasks.get(task) {
            Some(record) => record.state == TaskState::Completed,
            // A handle absent from the table was already cleaned up, which
            // only happens to tasks that finished.
            None => true,
        }
    }

    /// Block the calling thread (or, if it's a worker thread, suspend the
    /// running task) until `task` completes.
    pub fn wait(&self, task: Task) {
        if self.is_completed(task) {
            return;
        }
        let inner = Arc::clone(&self.0);
        yield_until(move || {
            let mut tasks = inner.tasks.lock().expect("task table poisoned");
            loop {
                match tasks.get(task) {
                    Some(record) if record.state != TaskState::Completed => {}
                    _ => return,
                }
                tasks = inner
                    .completed
                    .wait(tasks)
                    .expect("task completion condvar poisoned");
            }
        });
    }

    /// If the calling thread is a worker's main thread and another job is
    /// waiting in its queue, run it inline on the current stack frame.
    /// Otherwise returns immediately.
    pub fn yield_now(&self) {
        let Some(ptr) = ThreadWorker::local() else {
            return;
        };
        // SAFETY: `ThreadWorker::local()` only returns non-null on a
        // worker's own main/aux thread, and the pointee outlives every call
        // made from that thread (see `ThreadWorker::start`).
        let worker = unsafe { &*ptr };
        if let Some((body, ctx)) = worker.steal_job() {
            worker.run_in_thread(body, ctx);
        }
    }

    /// Free the record of every task currently in the `Completed` state.
    pub fn clean_finished_tasks(&self) {
        let mut tasks = self.0.tasks.lock().expect("task table poisoned");
        let mut done = Vec::new();
        tasks.for_each(|handle, record| {
            if record.state == TaskState::Completed {
                done.push(handle);
            }
        });
        for handle in done {
            tasks.free(handle);
        }
    }

    /// Free `root` and every descendant reachable through its child edges,
    /// provided each one has completed. Used to release the task subtree
    /// behind a finished file read or scene load once its result has been
    /// consumed.
    pub fn clean_task_tree(&self, root: Task) {
        let mut tasks = self.0.tasks.lock().expect("task table poisoned");
        let mut stack = vec![root];
        let mut to_free = Vec::new();
        while let Some(handle) = stack.pop() {
            if let Some(record) = tasks.get(handle) {
                if record.state == TaskState::Completed {
                    stack.extend(record.children.iter().copied());
                    to_free.push(handle);
                }
            }
        }
        for handle in to_free {
            tasks.free(handle);
        }
    }

    pub fn task_name(&self, task: Task) -> Option<&'static str> {
        self.0
            .tasks
            .lock()
            .expect("task table poisoned")
            .get(task)
            .map(|record| record.name)
    }

    pub fn shutdown(&self) {
        for worker in &self.0.workers {
            worker.signal_stop();
        }
        for worker in &self.0.workers {
            worker.join();
        }
    }
}

/// Suspend the calling thread inside `block_fn`, routing through the local
/// worker's aux-thread trap when running on a worker's main thread so other
/// ready work keeps flowing; runs `block_fn` inline otherwise (e.g. when
/// called from a test or from outside the pool entirely).
pub fn yield_until(block_fn: impl FnOnce() + Send + 'static) {
    match ThreadWorker::local() {
        // SAFETY: see `yield_now`.
        Some(ptr) => unsafe { wait_until_on_local_worker(ptr, Box::new(block_fn)) },
        None => block_fn(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn system(workers: usize) -> TaskSystem {
        TaskSystem::new(TaskSystemConfig { num_workers: workers })
    }

    #[test]
    fn single_task_runs_and_completes() {
        let ts = system(2);
        let ran = Arc::new(AtomicU32::new(0));
        let ran_clone = Arc::clone(&ran);
        let task = ts.create_task(TaskDesc::new("incr", move |_ctx| {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));
        ts.execute(task);
        ts.wait(task);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(ts.is_completed(task));
        ts.shutdown();
    }

    #[test]
    fn dependency_runs_only_after_parent_completes() {
        let ts = system(2);
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_a = Arc::clone(&order);
        let order_b = Arc::clone(&order);

        let a = ts.create_task(TaskDesc::new("a", move |_| {
            order_a.lock().unwrap().push("a");
        }));
        let b = ts.create_task(TaskDesc::new("b", move |_| {
            order_b.lock().unwrap().push("b");
        }));
        ts.depends(a, b).unwrap();

        ts.execute(b); // not ready yet: pending_deps == 1
        ts.execute(a);
        ts.wait(b);

        assert_eq!(&order.lock().unwrap()[..], &["a", "b"]);
        ts.shutdown();
    }

    #[test]
    fn depends_after_start_is_rejected() {
        let ts = system(1);
        let a = ts.create_task(TaskDesc::new("a", |_| {
            std::thread::sleep(Duration::from_millis(50));
        }));
        let b = ts.create_task(TaskDesc::placeholder("b"));
        ts.execute(a);
        std::thread::sleep(Duration::from_millis(10));
        let err = ts.depends(a, b);
        assert!(err.is_err());
        ts.wait(a);
        ts.shutdown();
    }

    #[test]
    fn clean_finished_tasks_frees_completed_records() {
        let ts = system(1);
        let task = ts.create_task(TaskDesc::placeholder("noop"));
        ts.execute(task);
        ts.wait(task);
        ts.clean_finished_tasks();
        assert!(ts.task_name(task).is_none());
        ts.shutdown();
    }

    #[test]
    fn clean_task_tree_frees_completed_subtree() {
        let ts = system(2);
        let root = ts.create_task(TaskDesc::placeholder("root"));
        let child = ts.create_task(TaskDesc::placeholder("child"));
        ts.depends(root, child).unwrap();
        ts.execute(root);
        ts.wait(child);
        ts.clean_task_tree(root);
        assert!(ts.task_name(root).is_none());
        assert!(ts.task_name(child).is_none());
        ts.shutdown();
    }
}
