//! Signal delivery. Signals are queued against a process rather than
//! delivered inline at fault time; the scheduler drains a process's
//! queue on its way back to user mode, switching it onto an alternate
//! kernel stack for the duration of the handler. See spec §4.7.

use alloc::boxed::Box;

use crate::memory::paging::SIGNAL_RETURN;
use crate::process::descriptor::SignalStack;
use crate::process::{Pid, KERNEL_STACK_SIZE, NUM_SIGNALS};

/// Signal numbers the kernel itself generates or understands natively.
/// Userland-defined signals still fit in the `[1, NUM_SIGNALS]` table;
/// this is just the subset the kernel names directly.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Signal {
    Hup = 1,
    Int = 2,
    Quit = 3,
    Ill = 4,
    Kill = 9,
    Segv = 11,
    Term = 15,
    Chld = 17,
    Cont = 18,
    Stop = 19,
}

impl Signal {
    pub fn number(self) -> u32 {
        self as u32
    }
}

/// The disposition a process has registered for a given signal number.
#[derive(Clone, Copy)]
pub enum Disposition {
    Default,
    Ignore,
    Handler(u32),
}

/// A signal queued for delivery but not yet dispatched.
pub struct QueuedSignal {
    pub signal: u32,
}

/// Default action for a signal with no registered handler: does it
/// terminate the process, or is it silently ignorable? Matches spec
/// §4.7's "unhandled signals terminate unless explicitly ignorable".
fn default_is_ignorable(signal: u32) -> bool {
    matches!(signal, s if s == Signal::Chld.number() || s == Signal::Cont.number())
}

/// Queue `signal` against `pid`. Delivery happens lazily, the next time
/// the scheduler is about to resume that process in user mode.
pub fn queue_signal(pid: Pid, signal: Signal) {
    crate::scheduler::with_process_table(|table| {
        if let Some(proc) = table.process_from_pid(pid) {
            proc.signal_queue.push_back(QueuedSignal {
                signal: signal.number(),
            });
        }
    });
}

/// Called at scheduler re-entry, before returning to user mode. If a
/// signal is queued and not ignored, switch execution onto the
/// process's alternate kernel stack and point `eip` at the registered
/// handler (or take the default action and exit).
pub fn dispatch(pid: Pid) {
    crate::scheduler::with_process_table(|table| {
        let proc = match table.process_from_pid(pid) {
            Some(p) => p,
            None => return,
        };

        let queued = match proc.signal_queue.pop_front() {
            Some(q) => q,
            None => return,
        };

        let disposition = proc.signals[queued.signal as usize];
        if disposition == 0 {
            if default_is_ignorable(queued.signal) {
                return;
            }
            proc.finished = true;
            proc.status = queued.signal as u8;
            return;
        }

        if proc.signal_state.is_some() {
            // Already inside a handler; re-queue and deliver after it
            // returns rather than nesting (matches spec's Non-goal of
            // exact POSIX signal semantics — no handler re-entrancy).
            proc.signal_queue.push_front(queued);
            return;
        }

        let saved_state = proc.thread;
        let memory: Box<[u8; KERNEL_STACK_SIZE]> = Box::new([0u8; KERNEL_STACK_SIZE]);
        let stack_top = memory.as_ptr() as u32 + KERNEL_STACK_SIZE as u32;

        proc.signal_state = Some(SignalStack {
            memory,
            saved_state,
        });

        proc.thread.esp = stack_top - 4;
        proc.thread.ebp = proc.thread.esp;
        proc.thread.eip = disposition;
        proc.thread.return_eip = SIGNAL_RETURN;
    });
}

/// The signal handler returned (faulted on the `SIGNAL_RETURN`
/// sentinel). Restore the interrupted context and free the alternate
/// stack.
pub fn return_from_signal_handler(pid: Pid) {
    crate::scheduler::with_process_table(|table| {
        if let Some(proc) = table.process_from_pid(pid) {
            if let Some(stack) = proc.signal_state.take() {
                proc.thread = stack.saved_state;
            }
        }
    });
}

/// Register a handler (or `Default`/`Ignore`) for `signal` on `pid`'s
/// signal table. A handler address of 0 means "restore default".
pub fn set_handler(proc: &mut crate::process::Process, signal: u32, handler: u32) {
    assert!((signal as usize) <= NUM_SIGNALS, "signal number out of range");
    proc.signals[signal as usize] = handler;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ignorable_signals_are_chld_and_cont() {
        assert!(default_is_ignorable(Signal::Chld.number()));
        assert!(default_is_ignorable(Signal::Cont.number()));
        assert!(!default_is_ignorable(Signal::Segv.number()));
    }
}
