//! Lightweight task scheduler.
//!
//! Tasks are futures multiplexed onto a fixed pool of carrier threads that
//! share one run queue. A task that returns `Pending` is `Suspended` and its
//! carrier moves on; the task's waker puts it back on the queue exactly once.
//! Native calls go to a separate native-call pool (see [`native`]), so a
//! blocking foreign function never pins a carrier.
//!
//! Each task gets its own [`OwnerId`](frankenffi_membrane::OwnerId), installed
//! around every poll, so confined arenas follow the task across carriers.
//! Confined arenas the task opens are recorded in its ledger and closed when
//! it terminates, whichever way it terminates.
//!
//! Lifecycle: `Runnable -> Running -> (Suspended <-> Running)* -> Completed | Failed`.

mod carrier;
mod diagnostics;
mod join;
pub mod native;
mod suspend;
mod task;

use std::cell::RefCell;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use frankenffi_membrane::metrics::{FfiMetrics, global_metrics};
use frankenffi_membrane::{BoxError, FfiError, FfiResult, RuntimeConfig, runtime_config};
use parking_lot::Mutex;
use serde::Serialize;

use self::carrier::CarrierMessage;
use self::diagnostics::Diagnostics;
use self::join::JoinState;
use self::native::NativeMessage;
use self::task::{TaskCell, TaskFuture};
use crate::context;
use crate::structured_log::{LogEmitter, LogLevel};

pub use self::diagnostics::UnjoinedFailure;
pub use self::join::JoinHandle;
pub use self::native::invoke;
pub use self::suspend::{YieldNow, checkpoint, write_shared, yield_now};
pub use self::task::{TaskId, TaskState, current_task_id};

/// State shared by carriers, native threads and task cells.
pub(crate) struct Shared {
    run_tx: Sender<CarrierMessage>,
    run_rx: Receiver<CarrierMessage>,
    native_tx: Sender<NativeMessage>,
    native_rx: Receiver<NativeMessage>,
    carriers: usize,
    native_threads: usize,
    cancel_check_interval: Option<Duration>,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    live: Mutex<HashMap<TaskId, Weak<TaskCell>>>,
    diagnostics: Arc<Diagnostics>,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn enter_active(&self) {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_active.fetch_max(now, Ordering::AcqRel);
    }

    fn leave_active(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    fn track(&self, task: &Arc<TaskCell>) {
        self.live.lock().insert(task.id(), Arc::downgrade(task));
    }

    fn forget(&self, id: TaskId) {
        self.live.lock().remove(&id);
    }
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub carriers: usize,
    pub native_threads: usize,
    pub active_carriers: usize,
    pub peak_active_carriers: usize,
    pub live_tasks: usize,
}

pub(crate) struct SchedulerInner {
    shared: Arc<Shared>,
    carriers: Mutex<Vec<thread::JoinHandle<()>>>,
    natives: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl SchedulerInner {
    fn shutdown(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let carriers = std::mem::take(&mut *self.carriers.lock());
        let natives = std::mem::take(&mut *self.natives.lock());
        for _ in 0..shared.carriers {
            let _ = shared.run_tx.send(CarrierMessage::Shutdown);
        }
        for _ in 0..shared.native_threads {
            let _ = shared.native_tx.send(NativeMessage::Shutdown);
        }
        let me = thread::current().id();
        for handle in carriers.into_iter().chain(natives) {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }

        // Unissued native calls release their leases here.
        while shared.native_rx.try_recv().is_ok() {}
        while let Ok(message) = shared.run_rx.try_recv() {
            if let CarrierMessage::Run(task) = message {
                task.abort(FfiError::Cancelled {
                    task: task.id().as_u64(),
                });
            }
        }
        let pending: Vec<Arc<TaskCell>> = shared
            .live
            .lock()
            .drain()
            .filter_map(|(_, task)| task.upgrade())
            .collect();
        for task in pending {
            task.abort(FfiError::Cancelled {
                task: task.id().as_u64(),
            });
        }

        shared.diagnostics.with_log(|log| {
            let entry = log
                .entry(LogLevel::Debug, "scheduler.shutdown")
                .with_details(serde_json::json!({
                    "peak_active_carriers": shared.peak_active.load(Ordering::Acquire),
                }));
            let _ = log.emit(&entry).and_then(|_| log.flush());
        });
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

std::thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Weak<SchedulerInner>>> = const { RefCell::new(None) };
}

pub(crate) struct CurrentScheduler {
    previous: Option<Weak<SchedulerInner>>,
}

impl CurrentScheduler {
    pub(crate) fn enter(scheduler: Weak<SchedulerInner>) -> Self {
        let previous = CURRENT_SCHEDULER.with(|cell| cell.replace(Some(scheduler)));
        Self { previous }
    }
}

impl Drop for CurrentScheduler {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// Handle to a carrier pool. Clones share the pool; the last clone shuts it down.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Scheduler configured from the process environment.
    pub fn from_env() -> io::Result<Self> {
        Self::new(runtime_config())
    }

    /// Scheduler logging to stderr.
    pub fn new(config: &RuntimeConfig) -> io::Result<Self> {
        Self::with_log(config, LogEmitter::to_stderr("scheduler", config.log))
    }

    /// Scheduler writing its structured log through `log`.
    pub fn with_log(config: &RuntimeConfig, log: LogEmitter) -> io::Result<Self> {
        let (run_tx, run_rx) = crossbeam_channel::unbounded();
        let (native_tx, native_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            run_tx,
            run_rx,
            native_tx,
            native_rx,
            carriers: config.carriers.max(1),
            native_threads: config.native_threads.max(1),
            cancel_check_interval: config.cancel_check_interval,
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            live: Mutex::new(HashMap::new()),
            diagnostics: Arc::new(Diagnostics::new(log)),
            closed: AtomicBool::new(false),
        });
        let inner = Arc::new(SchedulerInner {
            shared: Arc::clone(&shared),
            carriers: Mutex::new(Vec::new()),
            natives: Mutex::new(Vec::new()),
        });

        let natives = native::spawn_native_threads(shared.native_threads, &shared.native_rx)?;
        *inner.natives.lock() = natives;
        let carriers = carrier::spawn_carriers(&shared, &Arc::downgrade(&inner), &shared.run_rx)?;
        *inner.carriers.lock() = carriers;

        Ok(Self { inner })
    }

    /// The scheduler driving the current carrier thread, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT_SCHEDULER
            .with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
            .map(|inner| Self { inner })
    }

    /// Spawn a task running `body`. The caller's context frame is captured.
    pub fn spawn<F, T, E>(&self, body: F) -> JoinHandle<T>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let shared = &self.inner.shared;
        let id = TaskId::next();
        let join = Arc::new(JoinState::new(id, Arc::clone(&shared.diagnostics)));
        let future = TaskFuture::new(id, body, Arc::clone(&join));
        let task = Arc::new(TaskCell::new(
            id,
            context::capture(),
            Box::new(future),
            Arc::clone(shared),
        ));
        FfiMetrics::inc(&global_metrics().tasks_spawned);

        let cancelled = || FfiError::Cancelled { task: id.as_u64() };
        if shared.is_closed() {
            task.abort(cancelled());
        } else {
            shared.track(&task);
            task.schedule();
            // Lost a race with shutdown.
            if shared.is_closed() {
                task.abort(cancelled());
            }
        }
        JoinHandle::new(task, join)
    }

    /// Run `future` as a task and block the calling thread until it finishes.
    pub fn block_on<F, T>(&self, future: F) -> FfiResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(async move { Ok::<T, Infallible>(future.await) })
            .join_blocking()
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let shared = &self.inner.shared;
        SchedulerStats {
            carriers: shared.carriers,
            native_threads: shared.native_threads,
            active_carriers: shared.active.load(Ordering::Acquire),
            peak_active_carriers: shared.peak_active.load(Ordering::Acquire),
            live_tasks: shared.live.lock().len(),
        }
    }

    /// Unjoined failures reported since the last drain.
    #[must_use]
    pub fn drain_unjoined_failures(&self) -> Vec<UnjoinedFailure> {
        self.inner.shared.diagnostics.drain()
    }

    /// Channel receiving unjoined failures. It holds at most 1024 undrained
    /// records; failures past that are only logged.
    #[must_use]
    pub fn unjoined_failures(&self) -> Receiver<UnjoinedFailure> {
        self.inner.shared.diagnostics.receiver()
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shared.is_closed()
    }

    /// Stop carriers and native-call threads. Pending tasks are dropped and
    /// their handles resolve to `Cancelled`.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("stats", &self.stats()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structured_log::LogBuffer;
    use frankenffi_membrane::{ArenaKind, ErrorKind, LogFilter, open_arena};
    use std::sync::atomic::AtomicU32;

    fn scheduler(carriers: usize) -> (Scheduler, LogBuffer) {
        let buffer = LogBuffer::new();
        let config = RuntimeConfig::default()
            .with_carriers(carriers)
            .with_native_threads(2);
        let log = LogEmitter::to_buffer(&buffer, "test", LogFilter::Warn);
        (Scheduler::with_log(&config, log).unwrap(), buffer)
    }

    #[test]
    fn block_on_returns_value() {
        let (sched, _) = scheduler(2);
        assert_eq!(sched.block_on(async { 6 * 7 }).unwrap(), 42);
    }

    #[test]
    fn body_errors_become_task_failed() {
        let (sched, _) = scheduler(1);
        let handle = sched.spawn(async { Err::<(), _>("card declined") });
        let id = handle.id();
        let err = handle.join_blocking().unwrap_err();
        match err {
            FfiError::TaskFailed { task, ref source } => {
                assert_eq!(task, id.as_u64());
                assert_eq!(source.to_string(), "card declined");
            }
            other => panic!("expected TaskFailed, got {other:?}"),
        }
    }

    #[test]
    fn panics_are_isolated() {
        let (sched, _) = scheduler(1);
        let bad = sched.spawn(async {
            if true {
                panic!("boom");
            }
            Ok::<(), Infallible>(())
        });
        let err = bad.join_blocking().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskFailed);
        assert!(err.to_string().contains("boom"), "{err}");
        // The carrier survives.
        assert_eq!(sched.block_on(async { 1 }).unwrap(), 1);
    }

    #[test]
    fn tasks_await_each_other() {
        let (sched, _) = scheduler(2);
        let inner = sched.clone();
        let total = sched
            .block_on(async move {
                let a = inner.spawn(async { Ok::<_, Infallible>(20) });
                let b = inner.spawn(async { Ok::<_, Infallible>(22) });
                a.await.unwrap() + b.await.unwrap()
            })
            .unwrap();
        assert_eq!(total, 42);
    }

    #[test]
    fn current_is_set_on_carriers_only() {
        let (sched, _) = scheduler(1);
        assert!(Scheduler::current().is_none());
        let seen = sched
            .block_on(async { Scheduler::current().is_some() && current_task_id().is_some() })
            .unwrap();
        assert!(seen);
    }

    #[test]
    fn cancel_before_first_poll() {
        let (sched, _) = scheduler(1);
        let gate = Arc::new(parking_lot::Mutex::new(()));
        let held = gate.lock();
        // Occupy the only carrier so the victim stays queued.
        let blocker_gate = Arc::clone(&gate);
        let blocker = sched.spawn(async move {
            drop(blocker_gate.lock());
            Ok::<_, Infallible>(())
        });
        let ran = Arc::new(AtomicU32::new(0));
        let ran_in_task = Arc::clone(&ran);
        let victim = sched.spawn(async move {
            ran_in_task.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(())
        });
        victim.cancel();
        drop(held);
        blocker.join_blocking().unwrap();
        let err = victim.join_blocking().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancellation_closes_confined_arenas() {
        let (sched, _) = scheduler(2);
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = sched.spawn(async move {
            let arena = open_arena(ArenaKind::Confined);
            let seg = arena.allocate(20)?;
            tx.send(seg.clone()).map_err(|_| "receiver gone")?;
            // Leak the owning handle; only the task's ledger can close it now.
            std::mem::forget(arena);
            while seg.is_alive() {
                checkpoint().await?;
                yield_now().await;
            }
            Ok::<(), BoxError>(())
        });
        let seg = rx.recv().unwrap();
        handle.cancel();
        assert_eq!(handle.join_blocking().unwrap_err().kind(), ErrorKind::Cancelled);
        assert!(!seg.is_alive());
    }

    #[test]
    fn unjoined_failures_are_reported() {
        let (sched, log) = scheduler(1);
        let failures = sched.unjoined_failures();
        drop(sched.spawn(async { Err::<(), _>("nobody listens") }));
        let record = failures
            .recv_timeout(Duration::from_secs(10))
            .expect("unjoined failure reported");
        assert_eq!(record.kind, "task_failed");
        assert!(record.error.contains("nobody listens"));

        let lines = log.lines();
        let line = lines
            .iter()
            .find(|l| l.contains("task.unjoined_failure"))
            .expect("logged");
        let entry = crate::structured_log::validate_log_line(line).unwrap();
        assert_eq!(entry.task, Some(record.task.as_u64()));
    }

    #[test]
    fn joined_failures_are_not_reported() {
        let (sched, _) = scheduler(1);
        let handle = sched.spawn(async { Err::<(), _>("seen") });
        assert!(handle.join_blocking().is_err());
        let quiet = sched.spawn(async { Ok::<_, Infallible>(()) });
        drop(quiet);
        sched.block_on(async {}).unwrap();
        assert!(sched.drain_unjoined_failures().is_empty());
    }

    #[test]
    fn shutdown_cancels_pending_tasks() {
        let (sched, _) = scheduler(1);
        let stuck = sched.spawn(std::future::pending::<Result<(), Infallible>>());
        while stuck.state() == TaskState::Runnable {
            thread::yield_now();
        }
        sched.shutdown();
        assert!(sched.is_shut_down());
        assert_eq!(stuck.join_blocking().unwrap_err().kind(), ErrorKind::Cancelled);
        let late = sched.spawn(async { Ok::<_, Infallible>(()) });
        assert_eq!(late.join_blocking().unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn busy_task_does_not_hold_the_other_carrier() {
        let (sched, _) = scheduler(2);
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let mut first = true;
        let busy = sched.spawn(std::future::poll_fn(move |cx| {
            if first {
                first = false;
                // Wake during the poll so the task is queued while running.
                cx.waker().wake_by_ref();
                let _ = started_tx.send(());
                thread::sleep(Duration::from_millis(800));
                return std::task::Poll::Pending;
            }
            std::task::Poll::Ready(Ok::<_, Infallible>(2))
        }));
        started_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let quick = sched.spawn(async { Ok::<_, Infallible>(1) });
        assert_eq!(quick.join_blocking().unwrap(), 1);
        let waited = started.elapsed();
        assert!(waited < Duration::from_millis(400), "queued behind busy task for {waited:?}");
        // The wake that arrived mid-poll is not lost.
        assert_eq!(busy.join_blocking().unwrap(), 2);
    }

    #[test]
    fn shutdown_from_inside_a_task_resolves_its_handle() {
        let (sched, _) = scheduler(2);
        let handle = sched.spawn(async {
            if let Some(current) = Scheduler::current() {
                current.shutdown();
            }
            yield_now().await;
            Ok::<_, Infallible>(1)
        });
        let (tx, rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let _ = tx.send(handle.join_blocking());
        });
        let result = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("handle resolves after shutdown");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
        assert!(sched.is_shut_down());
    }
}
