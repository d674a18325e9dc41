//! Reaping: reclaiming a finished process's resources once its parent
//! has collected its exit status (or once it's clear no one ever will).
//! Grounded in the original kernel's `reap_process`, which logs the
//! process's final memory footprint before releasing it.

use alloc::collections::VecDeque;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::log_info;
use crate::process::Pid;

lazy_static! {
    static ref REAP_QUEUE: Mutex<VecDeque<Pid>> = Mutex::new(VecDeque::new());
}

/// Queue `pid` for reaping. Called when a process finishes; the actual
/// reap happens on the next pass through `drain`, not inline, so it
/// never runs on the exiting process's own (about-to-be-freed) stack.
pub fn enqueue(pid: Pid) {
    REAP_QUEUE.lock().push_back(pid);
}

/// Reap everything queued: release each process's page directory
/// (decrementing its reference count, freeing frames if it was the last
/// holder) and drop it from the process table.
pub fn drain() {
    let pending: alloc::vec::Vec<Pid> = {
        let mut q = REAP_QUEUE.lock();
        q.drain(..).collect()
    };

    for pid in pending {
        crate::scheduler::with_process_table(|table| {
            let Some(proc) = table.process_from_pid(pid) else {
                return;
            };
            if !proc.finished || !proc.wait_queue.is_empty() {
                // A waiter may still show up between "finished" and
                // here; leave it parked for the parent to collect via
                // `waitpid` instead of reaping out from under it.
                return;
            }
            if proc.reaped {
                return;
            }
            proc.reaped = true;
        });

        log_info!("reap: pid {} reclaimed", pid);

        let directory = crate::scheduler::with_process_table(|table| {
            table.process_from_pid(pid).map(|p| p.page_directory.clone())
        });

        if let Some(directory) = directory {
            if let Ok(directory) = alloc::sync::Arc::try_unwrap(directory) {
                let inner = directory.into_inner();
                let mut frames = crate::memory::frame::FRAME_BITMAP.lock();
                inner.release(&mut frames);
            }
            // If `try_unwrap` failed, another thread sharing this address
            // space (via `clone`) is still alive; whichever one of them
            // gets reaped last will be the one whose `try_unwrap` above
            // succeeds, and that pass releases the frames.
        }

        crate::scheduler::with_process_table(|table| table.remove(pid));
    }
}
