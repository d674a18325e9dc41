//! The process descriptor itself: identity, image metadata, the
//! kernel-stack pair, and every piece of queue membership a process can
//! be in. See spec §3.

use alloc::string::String;
use alloc::vec::Vec;

use crate::ipc::{IpcQueue, IpcState, Message};
use crate::memory::paging::PageDirectory;
use crate::process::tree;
use crate::process::{KERNEL_STACK_SIZE, NUM_SIGNALS};
use crate::scheduler::context::Context;
use crate::signals::QueuedSignal;
use crate::vfs::FdTable;

/// Process ID. Signed to match the Unix `pid_t` convention the spec
/// carries over (negative values are never assigned, but the type
/// allows sentinel values like "any"/"no task" at the IPC layer).
pub type Pid = i32;

pub const PID_ANY: Pid = -1;
pub const PID_NONE: Pid = -2;

/// Portable binary image metadata: spec §3's `image_t`.
#[derive(Default, Clone, Copy)]
pub struct Image {
    pub size: u32,
    pub entry: u32,
    pub heap: u32,
    pub heap_actual: u32,
    /// Top of the process's primary kernel stack.
    pub stack: u32,
    pub user_stack: u32,
    pub start: u32,
}

/// One-byte process status, as spec §3 specifies (`status_t`). Holds
/// either the `kexit` return value or the terminating signal number.
pub type ProcessStatus = u8;

/// A handle into the alternate ("signal") kernel stack, allocated lazily
/// the first time a process has a signal queued while running.
pub struct SignalStack {
    pub memory: alloc::boxed::Box<[u8; KERNEL_STACK_SIZE]>,
    pub saved_state: Context,
}

/// A Unix-style process descriptor. See spec §3 for the field-by-field
/// rationale; this struct carries every one of them.
pub struct Process {
    pub pid: Pid,
    pub name: String,
    pub user: u32,
    pub mask: u32,

    pub group: Pid,
    pub job: Pid,
    pub session: Pid,

    pub thread: Context,
    pub page_directory: alloc::sync::Arc<spin::Mutex<PageDirectory>>,

    pub tree_entry: tree::NodeId,
    pub image: Image,

    pub fds: alloc::sync::Arc<spin::Mutex<FdTable>>,

    pub status: ProcessStatus,
    pub signals: [u32; NUM_SIGNALS + 1],
    pub signal_queue: alloc::collections::VecDeque<QueuedSignal>,
    pub signal_state: Option<SignalStack>,

    pub finished: bool,
    pub started: bool,
    pub reaped: bool,

    /// Offset of the saved syscall register frame within the primary
    /// kernel stack, so it can be relocated verbatim when `fork` copies
    /// the stack into the child (spec §4.6 step 6d).
    pub syscall_registers_offset: usize,

    /// Other processes blocked in `waitpid` on this one.
    pub wait_queue: Vec<Pid>,

    /// Opaque shared-memory mapping tokens (spec §6's `shm_mappings`).
    pub shm_mappings: Vec<crate::shm::MappingToken>,

    pub ipc: IpcState,
    pub pending_message: Option<Message>,
    /// Senders currently parked waiting to deliver to this process (spec
    /// §3's "sender queue").
    pub ipc_queue: IpcQueue,

    pub kernel_stack: alloc::boxed::Box<[u8; KERNEL_STACK_SIZE]>,
}

impl Process {
    pub fn is_ready_to_run(&self) -> bool {
        !self.finished && matches!(self.ipc, IpcState::Running)
    }
}
