//! Cooperative suspension points.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use frankenffi_membrane::{FfiResult, Segment, WriteAttempt};

use super::task::current_task;

/// Yield the carrier once; the task is re-queued immediately.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Observe cancellation.
///
/// Fails with `Cancelled` once cancellation was requested. With a cancel
/// check interval configured, also yields when the task has run that long
/// since it last suspended. Outside a task this is a no-op.
pub async fn checkpoint() -> FfiResult<()> {
    let Some(task) = current_task() else {
        return Ok(());
    };
    task.check_cancelled()?;
    let due = task
        .shared()
        .cancel_check_interval
        .is_some_and(|interval| task.since_last_yield() >= interval);
    if due {
        yield_now().await;
        task.check_cancelled()?;
    }
    Ok(())
}

/// Write to a shared-arena segment, yielding while the write gate is busy.
pub async fn write_shared(segment: &Segment, offset: usize, bytes: &[u8]) -> FfiResult<()> {
    loop {
        match segment.try_write(offset, bytes)? {
            WriteAttempt::Written => return Ok(()),
            WriteAttempt::Contended => yield_now().await,
        }
    }
}
