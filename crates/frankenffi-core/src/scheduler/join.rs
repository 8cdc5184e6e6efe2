//! Join handles and the result slot they wait on.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use frankenffi_membrane::{FfiError, FfiResult};
use parking_lot::{Condvar, Mutex};

use super::diagnostics::Diagnostics;
use super::task::{TaskCell, TaskId, TaskState};

struct JoinSlot<T> {
    result: Option<FfiResult<T>>,
    finished: bool,
    detached: bool,
    waker: Option<Waker>,
}

/// Result slot shared by a task and its handle.
pub(crate) struct JoinState<T> {
    task: TaskId,
    diagnostics: Arc<Diagnostics>,
    slot: Mutex<JoinSlot<T>>,
    ready: Condvar,
}

impl<T> JoinState<T> {
    pub(crate) fn new(task: TaskId, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            task,
            diagnostics,
            slot: Mutex::new(JoinSlot {
                result: None,
                finished: false,
                detached: false,
                waker: None,
            }),
            ready: Condvar::new(),
        }
    }

    /// Publish the terminal result. Failures of detached tasks go to diagnostics.
    pub(crate) fn complete(&self, result: FfiResult<T>) {
        let mut slot = self.slot.lock();
        slot.finished = true;
        if slot.detached {
            drop(slot);
            if let Err(err) = &result {
                self.report_unjoined(err);
            }
            return;
        }
        slot.result = Some(result);
        let waker = slot.waker.take();
        drop(slot);
        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn detach(&self) {
        let mut slot = self.slot.lock();
        slot.detached = true;
        slot.waker = None;
        let unread = slot.result.take();
        drop(slot);
        if let Some(Err(err)) = unread {
            self.report_unjoined(&err);
        }
    }

    fn report_unjoined(&self, err: &FfiError) {
        if matches!(err, FfiError::TaskFailed { .. }) {
            self.diagnostics.report(self.task, err);
        }
    }

    fn is_finished(&self) -> bool {
        self.slot.lock().finished
    }

    fn poll_result(&self, cx: &mut Context<'_>) -> Poll<FfiResult<T>> {
        let mut slot = self.slot.lock();
        if let Some(result) = slot.result.take() {
            return Poll::Ready(result);
        }
        if slot.finished {
            return Poll::Ready(Err(self.already_taken()));
        }
        slot.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn wait(&self) -> FfiResult<T> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.result.take() {
                return result;
            }
            if slot.finished {
                return Err(self.already_taken());
            }
            self.ready.wait(&mut slot);
        }
    }

    fn already_taken(&self) -> FfiError {
        FfiError::Cancelled {
            task: self.task.as_u64(),
        }
    }
}

/// Handle to a spawned task's result.
///
/// Awaiting the handle suspends the awaiting task until the spawned task
/// terminates. Dropping it without joining detaches the task; if the task
/// then fails, the failure is reported as an unjoined failure.
pub struct JoinHandle<T> {
    task: Arc<TaskCell>,
    state: Arc<JoinState<T>>,
    joined: bool,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: Arc<TaskCell>, state: Arc<JoinState<T>>) -> Self {
        Self {
            task,
            state,
            joined: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.task.request_cancel();
    }

    /// Block the current thread until the task terminates.
    ///
    /// Meant for threads outside the scheduler; from inside a task, await
    /// the handle instead.
    pub fn join_blocking(mut self) -> FfiResult<T> {
        self.joined = true;
        self.state.wait()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = FfiResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<FfiResult<T>> {
        let this = self.get_mut();
        let polled = this.state.poll_result(cx);
        if polled.is_ready() {
            this.joined = true;
        }
        polled
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if !self.joined {
            self.state.detach();
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("task", &self.task.id())
            .field("state", &self.task.state())
            .finish()
    }
}
