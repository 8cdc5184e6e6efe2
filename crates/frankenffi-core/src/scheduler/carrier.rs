//! Carrier threads: pull runnable tasks off the shared queue and poll them.

use std::io;
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel::Receiver;

use super::task::TaskCell;
use super::{CurrentScheduler, SchedulerInner, Shared};

pub(crate) enum CarrierMessage {
    Run(Arc<TaskCell>),
    Shutdown,
}

pub(crate) fn spawn_carriers(
    shared: &Arc<Shared>,
    scheduler: &Weak<SchedulerInner>,
    rx: &Receiver<CarrierMessage>,
) -> io::Result<Vec<thread::JoinHandle<()>>> {
    (0..shared.carriers)
        .map(|index| {
            let shared = Arc::clone(shared);
            let scheduler = Weak::clone(scheduler);
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("frankenffi-carrier-{index}"))
                .spawn(move || carrier_loop(&shared, scheduler, &rx))
        })
        .collect()
}

fn carrier_loop(shared: &Shared, scheduler: Weak<SchedulerInner>, rx: &Receiver<CarrierMessage>) {
    let _current = CurrentScheduler::enter(scheduler);
    for message in rx.iter() {
        match message {
            CarrierMessage::Shutdown => break,
            CarrierMessage::Run(task) => {
                shared.enter_active();
                task.run();
                shared.leave_active();
                // Shutdown issued from a task on this carrier drained our message.
                if shared.is_closed() && rx.is_empty() {
                    break;
                }
            }
        }
    }
}
