//! Native-call offload.
//!
//! A native call cannot be interrupted, so a task calling one hands the
//! prepared call to a dedicated native-call thread and suspends; its carrier
//! goes back to the run queue. Argument checks and segment leases are taken
//! on the carrier under the task's owner identity before the handoff, so
//! confined segments stay usable even though another thread issues the call.
//!
//! While the call is in flight the task is past its point of no return:
//! cancellation requested meanwhile is observed once the call completes.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;

use crossbeam_channel::{Receiver, SendError};
use frankenffi_abi::{NativeArg, NativeBinding, NativeValue, PreparedCall};
use frankenffi_membrane::FfiResult;
use parking_lot::Mutex;

use super::task::{TaskCell, current_task};

pub(crate) type NativeJob = Box<dyn FnOnce() + Send>;

pub(crate) enum NativeMessage {
    Job(NativeJob),
    Shutdown,
}

pub(crate) fn spawn_native_threads(
    count: usize,
    rx: &Receiver<NativeMessage>,
) -> io::Result<Vec<thread::JoinHandle<()>>> {
    (0..count)
        .map(|index| {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("frankenffi-native-{index}"))
                .spawn(move || {
                    for message in rx.iter() {
                        match message {
                            NativeMessage::Job(job) => job(),
                            NativeMessage::Shutdown => break,
                        }
                    }
                })
        })
        .collect()
}

/// Invoke `binding` with `args`.
///
/// Inside a scheduler task the call runs on a native-call thread while the
/// task is suspended. Elsewhere it runs inline on the calling thread.
pub async fn invoke(binding: &NativeBinding, args: &[NativeArg]) -> FfiResult<NativeValue> {
    let prepared = binding.prepare(args)?;
    match current_task() {
        Some(task) => NativeCall::submit(&task, prepared).await,
        None => prepared.call(),
    }
}

#[derive(Default)]
struct CallSlot {
    result: Option<FfiResult<NativeValue>>,
    waker: Option<Waker>,
}

struct NativeCall {
    slot: Arc<Mutex<CallSlot>>,
}

impl NativeCall {
    fn submit(task: &Arc<TaskCell>, prepared: PreparedCall) -> Self {
        let slot = Arc::new(Mutex::new(CallSlot::default()));
        task.enter_native();

        let job_slot = Arc::clone(&slot);
        let job_task = Arc::clone(task);
        let job: NativeJob = Box::new(move || {
            let result = prepared.call();
            job_task.leave_native();
            let waker = {
                let mut slot = job_slot.lock();
                slot.result = Some(result);
                slot.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        });

        // Pool already stopped: issue the call here.
        if let Err(SendError(NativeMessage::Job(job))) =
            task.shared().native_tx.send(NativeMessage::Job(job))
        {
            job();
        }
        Self { slot }
    }
}

impl Future for NativeCall {
    type Output = FfiResult<NativeValue>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.lock();
        match slot.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}
