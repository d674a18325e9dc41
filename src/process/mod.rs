//! Process descriptors, the process tree, and the process table. See
//! spec §3 and §4.4.

pub mod descriptor;
pub mod table;
pub mod tree;

pub use descriptor::{Image, Pid, Process, ProcessStatus, PID_ANY, PID_NONE};
pub use table::ProcessTable;

/// Size of each process's primary (and, when needed, alternate/signal)
/// kernel stack.
pub const KERNEL_STACK_SIZE: usize = 0x8000;

/// Number of distinct signal numbers a process's signal table covers
/// (signal 0 is reserved/unused, matching spec's `functions[NUMSIGNALS+1]`).
pub const NUM_SIGNALS: usize = 32;
