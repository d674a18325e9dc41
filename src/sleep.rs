//! Timed sleep. A sorted list of (wake tick, pid) pairs, checked once
//! per timer tick; see spec §4.8.

use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::ipc::IpcState;
use crate::process::Pid;

struct Sleeper {
    wake_at: u64,
    pid: Pid,
}

lazy_static! {
    static ref SLEEPERS: Mutex<Vec<Sleeper>> = Mutex::new(Vec::new());
    static ref TICKS: Mutex<u64> = Mutex::new(0);
}

/// Advance the tick counter by one; called from the timer ISR.
pub fn tick() -> u64 {
    let mut ticks = TICKS.lock();
    *ticks += 1;
    *ticks
}

pub fn now() -> u64 {
    *TICKS.lock()
}

/// Park `pid` until `now() >= wake_at`. The process is marked
/// `Sleeping` so the scheduler skips it, and inserted into the sleeper
/// list in wake-time order so `wake_sleepers` only has to look at the
/// front of the list each tick.
pub fn sleep_until(pid: Pid, wake_at: u64) {
    crate::scheduler::with_process_table(|table| {
        if let Some(proc) = table.process_from_pid(pid) {
            proc.ipc = IpcState::Sleeping;
        }
    });

    let mut sleepers = SLEEPERS.lock();
    let idx = sleepers.partition_point(|s| s.wake_at <= wake_at);
    sleepers.insert(idx, Sleeper { wake_at, pid });
}

/// Wake every sleeper whose time has come, returning them to the ready
/// queue. Called once per timer tick after `tick()`.
pub fn wake_sleepers(current_tick: u64) {
    let mut sleepers = SLEEPERS.lock();
    let split = sleepers.partition_point(|s| s.wake_at <= current_tick);
    let woken: Vec<Sleeper> = sleepers.drain(..split).collect();
    drop(sleepers);

    for sleeper in woken {
        crate::scheduler::with_process_table(|table| {
            if let Some(proc) = table.process_from_pid(sleeper.pid) {
                proc.ipc = IpcState::Running;
            }
        });
        crate::scheduler::enqueue_ready(sleeper.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleepers_stay_ordered_by_wake_time() {
        let mut sleepers = Vec::new();
        for (wake_at, pid) in [(10u64, 1i32), (3, 2), (7, 3)] {
            let idx = sleepers.partition_point(|s: &Sleeper| s.wake_at <= wake_at);
            sleepers.insert(idx, Sleeper { wake_at, pid });
        }
        let order: Vec<u64> = sleepers.iter().map(|s| s.wake_at).collect();
        assert_eq!(order, alloc::vec![3, 7, 10]);
    }
}
