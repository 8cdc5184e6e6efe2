//! Task cells: state machine, polling, cancellation and termination.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use frankenffi_membrane::metrics::{FfiMetrics, global_metrics};
use frankenffi_membrane::{ArenaLedger, BoxError, FfiError, FfiResult, OwnerId, OwnerScope};
use parking_lot::Mutex;
use serde::Serialize;

use super::Shared;
use super::carrier::CarrierMessage;
use super::join::JoinState;
use crate::context::Frame;

static NEXT_TASK: AtomicU64 = AtomicU64::new(1);

// Poll coordination between carriers.
const IDLE: u8 = 0;
const POLLING: u8 = 1;
const NOTIFIED: u8 = 2;

/// Process-unique task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Lifecycle state. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum TaskState {
    Runnable = 0,
    Running = 1,
    Suspended = 2,
    Completed = 3,
    Failed = 4,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Runnable,
            1 => Self::Running,
            2 => Self::Suspended,
            3 => Self::Completed,
            _ => Self::Failed,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// How a task body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

/// Type-erased task body plus its pending result.
pub(crate) trait ErasedTask: Send {
    /// Poll the body. On `Ready` the body has been dropped and the result is
    /// held until [`ErasedTask::publish`].
    fn poll_task(&mut self, cx: &mut Context<'_>) -> Poll<Outcome>;

    /// Drop the body and record `error` as the result.
    fn abort(&mut self, error: FfiError) -> Outcome;

    /// Hand the held result to the join handle.
    fn publish(self: Box<Self>);
}

pub(crate) struct TaskFuture<F, T, E> {
    id: TaskId,
    body: Option<Pin<Box<F>>>,
    result: Option<FfiResult<T>>,
    join: Arc<JoinState<T>>,
    _error: PhantomData<fn() -> E>,
}

impl<F, T, E> TaskFuture<F, T, E> {
    pub(crate) fn new(id: TaskId, body: F, join: Arc<JoinState<T>>) -> Self {
        Self {
            id,
            body: Some(Box::pin(body)),
            result: None,
            join,
            _error: PhantomData,
        }
    }

    fn outcome(&self) -> Outcome {
        match &self.result {
            Some(Ok(_)) => Outcome::Completed,
            Some(Err(FfiError::Cancelled { .. })) => Outcome::Cancelled,
            _ => Outcome::Failed,
        }
    }

    fn failure(&self, err: BoxError) -> FfiError {
        let task = self.id.as_u64();
        match err.downcast::<FfiError>() {
            Ok(inner) if matches!(*inner, FfiError::Cancelled { .. }) => FfiError::Cancelled { task },
            Ok(inner) => FfiError::TaskFailed {
                task,
                source: inner,
            },
            Err(other) => FfiError::TaskFailed {
                task,
                source: other,
            },
        }
    }
}

impl<F, T, E> ErasedTask for TaskFuture<F, T, E>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError> + 'static,
{
    fn poll_task(&mut self, cx: &mut Context<'_>) -> Poll<Outcome> {
        let Some(body) = self.body.as_mut() else {
            return Poll::Ready(self.outcome());
        };
        let polled = catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(cx)));
        let result = match polled {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(Ok(value))) => Ok(value),
            Ok(Poll::Ready(Err(err))) => Err(self.failure(err.into())),
            Err(payload) => Err(FfiError::TaskFailed {
                task: self.id.as_u64(),
                source: panic_message(payload.as_ref()).into(),
            }),
        };
        self.body = None;
        self.result = Some(result);
        Poll::Ready(self.outcome())
    }

    fn abort(&mut self, error: FfiError) -> Outcome {
        self.body = None;
        self.result = Some(Err(error));
        self.outcome()
    }

    fn publish(self: Box<Self>) {
        let this = *self;
        if let Some(result) = this.result {
            this.join.complete(result);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

/// Scheduler-side state of one task.
pub(crate) struct TaskCell {
    id: TaskId,
    owner: OwnerId,
    ledger: Arc<ArenaLedger>,
    frame: Frame,
    state: AtomicU8,
    scheduled: AtomicBool,
    polling: AtomicU8,
    cancel: AtomicBool,
    no_return: AtomicUsize,
    last_yield: Mutex<Instant>,
    body: Mutex<Option<Box<dyn ErasedTask>>>,
    shared: Arc<Shared>,
}

impl TaskCell {
    pub(crate) fn new(id: TaskId, frame: Frame, body: Box<dyn ErasedTask>, shared: Arc<Shared>) -> Self {
        Self {
            id,
            owner: OwnerId::fresh(),
            ledger: Arc::new(ArenaLedger::new()),
            frame,
            state: AtomicU8::new(TaskState::Runnable as u8),
            scheduled: AtomicBool::new(false),
            polling: AtomicU8::new(IDLE),
            cancel: AtomicBool::new(false),
            no_return: AtomicUsize::new(0),
            last_yield: Mutex::new(Instant::now()),
            body: Mutex::new(Some(body)),
            shared,
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn check_cancelled(&self) -> FfiResult<()> {
        if self.cancel_requested() {
            return Err(FfiError::Cancelled {
                task: self.id.as_u64(),
            });
        }
        Ok(())
    }

    pub(crate) fn request_cancel(self: &Arc<Self>) {
        if !self.cancel.swap(true, Ordering::AcqRel) {
            self.schedule();
        }
    }

    pub(crate) fn since_last_yield(&self) -> Duration {
        self.last_yield.lock().elapsed()
    }

    /// Enter a native call; cancellation is deferred until the matching exit.
    pub(crate) fn enter_native(&self) {
        self.no_return.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave_native(&self) {
        self.no_return.fetch_sub(1, Ordering::AcqRel);
    }

    /// Enqueue for polling unless already queued or terminated.
    pub(crate) fn schedule(self: &Arc<Self>) {
        if self.state().is_terminal() || self.shared.is_closed() {
            return;
        }
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.shared.run_tx.send(CarrierMessage::Run(Arc::clone(self))).is_err() {
            self.scheduled.store(false, Ordering::Release);
        }
    }

    /// Poll once on the calling carrier.
    ///
    /// A carrier that dequeues a task another carrier is already polling
    /// leaves a notification and moves on; the polling carrier re-enqueues
    /// the task once its poll returns `Pending`.
    pub(crate) fn run(self: &Arc<Self>) {
        self.scheduled.store(false, Ordering::Release);
        if self.state().is_terminal() || !self.begin_poll() {
            return;
        }

        let mut slot = self.body.lock();
        let Some(body) = slot.as_mut() else {
            self.polling.store(IDLE, Ordering::Release);
            return;
        };

        if self.cancel_requested() && self.no_return.load(Ordering::Acquire) == 0 {
            let outcome = body.abort(FfiError::Cancelled {
                task: self.id.as_u64(),
            });
            let body = slot.take();
            drop(slot);
            self.polling.store(IDLE, Ordering::Release);
            self.finish(outcome, body);
            return;
        }

        self.set_state(TaskState::Running);
        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        let polled = {
            let _owner = OwnerScope::enter(self.owner, Some(Arc::clone(&self.ledger)));
            let _frame = self.frame.enter();
            let _current = CurrentTask::enter(Arc::clone(self));
            body.poll_task(&mut cx)
        };

        match polled {
            Poll::Ready(outcome) => {
                let body = slot.take();
                drop(slot);
                self.polling.store(IDLE, Ordering::Release);
                self.finish(outcome, body);
            }
            // Shutdown could not abort this task while it was being polled.
            Poll::Pending if self.shared.is_closed() => {
                let outcome = body.abort(FfiError::Cancelled {
                    task: self.id.as_u64(),
                });
                let body = slot.take();
                drop(slot);
                self.polling.store(IDLE, Ordering::Release);
                self.finish(outcome, body);
            }
            Poll::Pending => {
                *self.last_yield.lock() = Instant::now();
                self.set_state(TaskState::Suspended);
                FfiMetrics::inc(&global_metrics().suspensions);
                drop(slot);
                if self.end_poll() {
                    self.schedule();
                }
            }
        }
    }

    /// Claim the poll. Returns `false` after leaving a notification for the
    /// carrier that holds it.
    fn begin_poll(&self) -> bool {
        let mut current = self.polling.load(Ordering::Acquire);
        loop {
            let next = if current == IDLE { POLLING } else { NOTIFIED };
            match self
                .polling
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return current == IDLE,
                Err(actual) => current = actual,
            }
        }
    }

    /// Release the poll. Returns `true` if a wake arrived while polling.
    fn end_poll(&self) -> bool {
        self.polling.swap(IDLE, Ordering::AcqRel) == NOTIFIED
    }

    /// Terminate without polling again. A task some carrier is polling is
    /// flagged instead and terminates when that poll returns.
    pub(crate) fn abort(&self, error: FfiError) {
        let Some(mut slot) = self.body.try_lock() else {
            self.cancel.store(true, Ordering::Release);
            return;
        };
        let Some(mut body) = slot.take() else {
            return;
        };
        drop(slot);
        let outcome = body.abort(error);
        self.finish(outcome, Some(body));
    }

    fn finish(&self, outcome: Outcome, body: Option<Box<dyn ErasedTask>>) {
        self.ledger.release_all();
        let metrics = global_metrics();
        match outcome {
            Outcome::Completed => {
                FfiMetrics::inc(&metrics.tasks_completed);
                self.set_state(TaskState::Completed);
            }
            Outcome::Failed => {
                FfiMetrics::inc(&metrics.tasks_failed);
                self.set_state(TaskState::Failed);
            }
            Outcome::Cancelled => {
                FfiMetrics::inc(&metrics.tasks_failed);
                FfiMetrics::inc(&metrics.tasks_cancelled);
                self.set_state(TaskState::Failed);
            }
        }
        self.shared.forget(self.id);
        if let Some(body) = body {
            body.publish();
        }
    }
}

impl Wake for TaskCell {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

std::thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<TaskCell>>> = const { RefCell::new(None) };
}

/// The task being polled on this thread, if any.
pub(crate) fn current_task() -> Option<Arc<TaskCell>> {
    CURRENT_TASK.with(|cell| cell.borrow().clone())
}

/// Id of the task being polled on this thread.
#[must_use]
pub fn current_task_id() -> Option<TaskId> {
    CURRENT_TASK.with(|cell| cell.borrow().as_ref().map(|task| task.id))
}

struct CurrentTask {
    previous: Option<Arc<TaskCell>>,
}

impl CurrentTask {
    fn enter(task: Arc<TaskCell>) -> Self {
        let previous = CURRENT_TASK.with(|cell| cell.replace(Some(task)));
        Self { previous }
    }
}

impl Drop for CurrentTask {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_TASK.with(|cell| *cell.borrow_mut() = previous);
    }
}
