//! The preemptive round-robin scheduler. A single global ready queue of
//! pids, woken by the timer ISR; see spec §4.4/§4.5.

pub mod context;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::ipc::IpcState;
use crate::log_info;
use crate::process::{Pid, ProcessStatus, ProcessTable};
use context::{Context, RESUME_SENTINEL};

lazy_static! {
    static ref PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());
    static ref READY_QUEUE: Mutex<VecDeque<Pid>> = Mutex::new(VecDeque::new());
}

static CURRENT: Mutex<Pid> = Mutex::new(0);

/// Run `f` with exclusive access to the global process table. Every
/// subsystem that needs to look a process up by pid (signals, IPC,
/// sleep/wait, fork) goes through this rather than threading a
/// `&mut ProcessTable` through every call site, since the table is
/// reached from interrupt context as well as ordinary syscalls.
pub fn with_process_table<F, R>(f: F) -> R
where
    F: FnOnce(&mut ProcessTable) -> R,
{
    let mut table = PROCESS_TABLE.lock();
    f(&mut table)
}

pub fn current_pid() -> Pid {
    *CURRENT.lock()
}

/// Add `pid` to the back of the ready queue.
pub fn enqueue_ready(pid: Pid) {
    READY_QUEUE.lock().push_back(pid);
}

/// Boot the scheduler: install process 1 (init) as the current process
/// and bring up the ready queue with it as the sole entry.
pub fn init(kernel_directory: &crate::memory::paging::PageDirectory, directory_phys: u32) {
    let pid = with_process_table(|table| table.spawn_init("init", kernel_directory, directory_phys));
    *CURRENT.lock() = pid;
    log_info!("scheduler: init is pid {}", pid);
}

/// Pick the next ready, non-finished process and return its pid,
/// requeuing anything skipped over back at the tail. Round-robin: the
/// current process (if still runnable) goes to the back of the line.
fn pick_next() -> Option<Pid> {
    let mut queue = READY_QUEUE.lock();
    let attempts = queue.len();
    for _ in 0..attempts {
        let candidate = queue.pop_front()?;
        let runnable = with_process_table(|table| {
            table
                .process_from_pid(candidate)
                .map(|p| p.is_ready_to_run())
                .unwrap_or(false)
        });
        if runnable {
            return Some(candidate);
        }
        // Finished/reaped/blocked: drop it from the ready queue entirely
        // rather than requeueing (sleeping/waiting processes are woken
        // back onto this queue explicitly by `sleep`/IPC/`wait`).
    }
    None
}

/// Voluntarily (`reschedule = true`) or forcibly (from the timer ISR,
/// `reschedule = false`) give up the CPU. The current process goes back
/// to the ready queue (if still runnable) before picking the next one.
/// Uses the two-return `read_eip` trick: on a freshly-created context
/// this returns immediately with `RESUME_SENTINEL` rather than actually
/// switching, since there is nothing saved yet to switch *from*.
pub fn switch_task(reschedule: bool) {
    let current = current_pid();
    let eip = context::read_eip();
    if eip == RESUME_SENTINEL {
        return;
    }

    let saved_esp: u32;
    let saved_ebp: u32;
    unsafe {
        core::arch::asm!("mov {0}, esp", out(reg) saved_esp, options(nostack, preserves_flags));
        core::arch::asm!("mov {0}, ebp", out(reg) saved_ebp, options(nostack, preserves_flags));
    }

    with_process_table(|table| {
        if let Some(proc) = table.process_from_pid(current) {
            proc.thread.eip = eip;
            proc.thread.esp = saved_esp;
            proc.thread.ebp = saved_ebp;
        }
    });

    if reschedule {
        let runnable =
            with_process_table(|table| table.process_from_pid(current).map(|p| p.is_ready_to_run()).unwrap_or(false));
        if runnable {
            enqueue_ready(current);
        }
    }

    switch_next();
}

/// Unconditionally hand the CPU to the next ready process, never
/// returning to the caller (the caller's own context was already saved
/// by `switch_task`, or it has none worth saving, as with `task_exit`).
pub fn switch_next() -> ! {
    let next = loop {
        if let Some(pid) = pick_next() {
            break pid;
        }
        // Ready queue drained: nothing runnable. Halt until the next
        // interrupt (timer, device) makes something ready again.
        unsafe { core::arch::asm!("sti", "hlt", options(nomem, nostack)) };
    };

    *CURRENT.lock() = next;

    // Deliver any signal queued against the incoming task now, at
    // scheduler re-entry, rather than against the task being switched
    // away from.
    crate::signals::dispatch(next);

    let next_context: Context =
        with_process_table(|table| table.process_from_pid(next).map(|p| p.thread).unwrap_or_default());

    unsafe { context::context_switch(&next_context) };
}

/// Terminate `pid`: mark it finished, record its status, wake anyone in
/// `waitpid` on it, and hand the CPU to the next ready process. Called
/// both from the `exit` syscall and from `handle_page_fault`'s
/// thread-exit sentinel case.
pub fn task_exit(pid: Pid, status: u8) -> ! {
    let waiters: Vec<Pid> = with_process_table(|table| {
        let proc = match table.process_from_pid(pid) {
            Some(p) => p,
            None => return Vec::new(),
        };
        proc.finished = true;
        proc.status = status;
        core::mem::take(&mut proc.wait_queue)
    });

    for waiter in waiters {
        with_process_table(|table| {
            if let Some(proc) = table.process_from_pid(waiter) {
                proc.ipc = IpcState::Running;
            }
        });
        enqueue_ready(waiter);
    }

    crate::reap::enqueue(pid);
    switch_next();
}

/// Block the calling process `pid` until `target` finishes, returning
/// its exit status. Enrolls `pid` on `target.wait_queue`; `task_exit`
/// wakes every entry there once `target` is finished. A `target` that
/// no longer exists (already reaped) has nothing left to collect, so
/// this returns a status of `0` immediately rather than blocking
/// forever.
pub fn waitpid(pid: Pid, target: Pid) -> ProcessStatus {
    loop {
        let outcome = with_process_table(|table| match table.process_from_pid(target) {
            Some(proc) if proc.finished => Some(proc.status),
            Some(proc) => {
                if !proc.wait_queue.contains(&pid) {
                    proc.wait_queue.push(pid);
                }
                None
            }
            None => Some(0),
        });

        if let Some(status) = outcome {
            return status;
        }

        with_process_table(|table| {
            if let Some(proc) = table.process_from_pid(pid) {
                proc.ipc = IpcState::Waiting;
            }
        });
        switch_task(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_next_skips_finished_processes() {
        let kernel = crate::memory::paging::PageDirectory::empty(0x1000);
        let init = with_process_table(|t| t.spawn_init("init", &kernel, 0x2000));
        let dir = crate::memory::paging::PageDirectory::new_with_kernel_base(&kernel, 0x3000);
        let child = with_process_table(|t| t.spawn_process("child", init, dir));

        with_process_table(|t| t.process_from_pid(init).unwrap().finished = true);
        enqueue_ready(init);
        enqueue_ready(child);

        assert_eq!(pick_next(), Some(child));
    }

    #[test]
    fn waitpid_returns_immediately_for_an_already_finished_target() {
        let kernel = crate::memory::paging::PageDirectory::empty(0x1000);
        let init = with_process_table(|t| t.spawn_init("init", &kernel, 0x2000));
        let dir = crate::memory::paging::PageDirectory::new_with_kernel_base(&kernel, 0x3000);
        let child = with_process_table(|t| t.spawn_process("child", init, dir));

        with_process_table(|t| {
            let proc = t.process_from_pid(child).unwrap();
            proc.finished = true;
            proc.status = 7;
        });

        assert_eq!(waitpid(init, child), 7);
    }

    #[test]
    fn task_exit_wakes_waiters_and_resets_their_ipc_state() {
        let kernel = crate::memory::paging::PageDirectory::empty(0x1000);
        let init = with_process_table(|t| t.spawn_init("init", &kernel, 0x2000));
        let dir = crate::memory::paging::PageDirectory::new_with_kernel_base(&kernel, 0x3000);
        let child = with_process_table(|t| t.spawn_process("child", init, dir));

        with_process_table(|t| {
            let proc = t.process_from_pid(child).unwrap();
            proc.wait_queue.push(init);
        });
        with_process_table(|t| {
            t.process_from_pid(init).unwrap().ipc = IpcState::Waiting;
        });

        let waiters: Vec<Pid> = with_process_table(|table| {
            let proc = table.process_from_pid(child).unwrap();
            proc.finished = true;
            proc.status = 3;
            core::mem::take(&mut proc.wait_queue)
        });
        for waiter in waiters {
            with_process_table(|table| {
                if let Some(proc) = table.process_from_pid(waiter) {
                    proc.ipc = IpcState::Running;
                }
            });
            enqueue_ready(waiter);
        }

        with_process_table(|t| {
            let proc = t.process_from_pid(init).unwrap();
            assert!(matches!(proc.ipc, IpcState::Running));
        });
        assert_eq!(waitpid(init, child), 3);
    }
}
