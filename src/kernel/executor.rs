//! Tick-based executor for cooperative tasks
//!
//! Both halves of the system use one: the supervisor runs its loopback
//! continuations on it, every sandbox runs syscall continuations and socket
//! work on it. Nothing blocks; a host calls `tick` from its event loop.
//!
//! - Proper wake semantics: only woken tasks are polled
//! - Tasks may spawn more tasks mid-tick through a `Spawner`

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, RawWaker, RawWakerVTable, Waker};

/// A boxed future representing a spawned task
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// State shared between the executor, its spawners and its wakers
struct Shared {
    /// Tasks that are ready to be polled (signaled by waker)
    ready: RefCell<HashSet<TaskId>>,
    /// Tasks waiting to be integrated (added during tick)
    pending_spawn: RefCell<VecDeque<(TaskId, BoxFuture)>>,
    next_id: Cell<u64>,
}

/// Cloneable handle that queues new tasks
#[derive(Clone)]
pub struct Spawner {
    shared: Rc<Shared>,
}

impl Spawner {
    /// Spawn a future, returns its task ID. Usable while the executor ticks.
    pub fn spawn<F>(&self, future: F) -> TaskId
    where
        F: Future<Output = ()> + 'static,
    {
        let id = TaskId(self.shared.next_id.get());
        self.shared.next_id.set(id.0 + 1);

        self.shared
            .pending_spawn
            .borrow_mut()
            .push_back((id, Box::pin(future)));
        // Mark as ready to run immediately
        self.shared.ready.borrow_mut().insert(id);
        id
    }
}

/// The executor - runs async tasks cooperatively, one tick at a time
pub struct Executor {
    /// All tasks, indexed by ID
    tasks: BTreeMap<TaskId, BoxFuture>,
    shared: Rc<Shared>,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            shared: Rc::new(Shared {
                ready: RefCell::new(HashSet::new()),
                pending_spawn: RefCell::new(VecDeque::new()),
                next_id: Cell::new(0),
            }),
        }
    }

    pub fn spawner(&self) -> Spawner {
        Spawner {
            shared: self.shared.clone(),
        }
    }

    /// Spawn a future, returns task ID
    pub fn spawn<F>(&mut self, future: F) -> TaskId
    where
        F: Future<Output = ()> + 'static,
    {
        self.spawner().spawn(future)
    }

    /// Integrate pending spawns into the task map
    fn integrate_pending(&mut self) {
        let mut pending = self.shared.pending_spawn.borrow_mut();
        while let Some((id, future)) = pending.pop_front() {
            self.tasks.insert(id, future);
        }
    }

    /// Run one tick of execution
    ///
    /// Polls every ready task once, oldest first. Returns the number of
    /// tasks that were polled.
    pub fn tick(&mut self) -> usize {
        self.integrate_pending();

        let mut ready_ids: Vec<TaskId> = self.shared.ready.borrow_mut().drain().collect();
        ready_ids.sort();

        let mut polled = 0;

        for task_id in ready_ids {
            // Need to remove to get mutable access to the future
            let Some(mut future) = self.tasks.remove(&task_id) else {
                continue;
            };

            let waker = self.create_waker(task_id);
            let mut cx = Context::from_waker(&waker);
            polled += 1;

            if future.as_mut().poll(&mut cx).is_pending() {
                // Re-added to the ready set when its waker fires
                self.tasks.insert(task_id, future);
            }
        }

        self.integrate_pending();
        polled
    }

    /// Tick until no task is ready. Bounded so a task that wakes itself
    /// forever cannot wedge the caller.
    pub fn run_until_stalled(&mut self) -> usize {
        let mut total = 0;
        for _ in 0..1024 {
            let polled = self.tick();
            total += polled;
            if polled == 0 && self.shared.ready.borrow().is_empty() {
                break;
            }
        }
        total
    }

    /// Check if there are any active tasks
    pub fn has_tasks(&self) -> bool {
        !self.tasks.is_empty() || !self.shared.pending_spawn.borrow().is_empty()
    }

    /// Get count of active tasks
    pub fn task_count(&self) -> usize {
        self.tasks.len() + self.shared.pending_spawn.borrow().len()
    }

    /// Check if any task is waiting to be polled
    pub fn has_ready(&self) -> bool {
        !self.shared.ready.borrow().is_empty()
    }

    fn create_waker(&self, task_id: TaskId) -> Waker {
        let state = Box::new(WakerState {
            task_id,
            shared: self.shared.clone(),
        });
        let ptr = Box::into_raw(state) as *const ();
        let raw = RawWaker::new(ptr, &WAKER_VTABLE);
        unsafe { Waker::from_raw(raw) }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state for waker to signal task readiness
struct WakerState {
    task_id: TaskId,
    shared: Rc<Shared>,
}

// Waker implementation that properly signals task readiness. Everything
// here runs on one thread; wakers never leave it.

const WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(waker_clone, waker_wake, waker_wake_by_ref, waker_drop);

unsafe fn waker_clone(ptr: *const ()) -> RawWaker {
    unsafe {
        let state = &*(ptr as *const WakerState);
        let cloned = Box::new(WakerState {
            task_id: state.task_id,
            shared: state.shared.clone(),
        });
        RawWaker::new(Box::into_raw(cloned) as *const (), &WAKER_VTABLE)
    }
}

unsafe fn waker_wake(ptr: *const ()) {
    unsafe {
        let state = Box::from_raw(ptr as *mut WakerState);
        state.shared.ready.borrow_mut().insert(state.task_id);
    }
}

unsafe fn waker_wake_by_ref(ptr: *const ()) {
    unsafe {
        let state = &*(ptr as *const WakerState);
        state.shared.ready.borrow_mut().insert(state.task_id);
    }
}

unsafe fn waker_drop(ptr: *const ()) {
    unsafe {
        drop(Box::from_raw(ptr as *mut WakerState));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::oneshot;

    #[test]
    fn test_spawn_and_complete() {
        let mut exec = Executor::new();
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();

        exec.spawn(async move {
            flag.set(true);
        });

        assert_eq!(exec.task_count(), 1);
        exec.tick();
        assert!(done.get());
        assert!(!exec.has_tasks());
    }

    #[test]
    fn test_tick_without_wake_leaves_task_pending() {
        let mut exec = Executor::new();
        let counter = Rc::new(Cell::new(0));
        let counter_clone = counter.clone();

        exec.spawn(async move {
            counter_clone.set(counter_clone.get() + 1);
            futures::pending!(); // Yield without waking
            counter_clone.set(counter_clone.get() + 1);
        });

        exec.tick();
        exec.tick();
        assert_eq!(counter.get(), 1);
        assert!(exec.has_tasks());
    }

    #[test]
    fn test_wake_from_oneshot() {
        let mut exec = Executor::new();
        let (tx, rx) = oneshot::channel::<u32>();
        let got = Rc::new(Cell::new(0));
        let slot = got.clone();

        exec.spawn(async move {
            if let Ok(v) = rx.await {
                slot.set(v);
            }
        });

        exec.run_until_stalled();
        assert_eq!(got.get(), 0);
        assert!(!exec.has_ready());

        tx.send(7).unwrap();
        assert!(exec.has_ready());
        exec.run_until_stalled();
        assert_eq!(got.get(), 7);
        assert!(!exec.has_tasks());
    }

    #[test]
    fn test_spawner_mid_tick() {
        let mut exec = Executor::new();
        let spawner = exec.spawner();
        let order = Rc::new(RefCell::new(Vec::new()));

        let outer = order.clone();
        exec.spawn(async move {
            outer.borrow_mut().push("outer");
            let inner = outer.clone();
            spawner.spawn(async move {
                inner.borrow_mut().push("inner");
            });
        });

        exec.run_until_stalled();
        assert_eq!(order.borrow().as_slice(), &["outer", "inner"]);
    }

    #[test]
    fn test_tasks_polled_in_spawn_order() {
        let mut exec = Executor::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            exec.spawn(async move {
                order.borrow_mut().push(i);
            });
        }
        exec.tick();
        assert_eq!(order.borrow().as_slice(), &[0, 1, 2, 3, 4]);
    }
}
