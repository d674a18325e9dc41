//! The process table: an O(n)-scanned array of process slots, the
//! process tree, and the handful of operations that create or look up
//! a process. See spec §3 and §4.4.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::ipc::IpcState;
use crate::memory::frame::FrameBitmap;
use crate::memory::paging::PageDirectory;
use crate::process::descriptor::{Image, Process, ProcessStatus, PID_NONE};
use crate::process::tree::{NodeId, ProcessTree};
use crate::process::{Pid, KERNEL_STACK_SIZE, NUM_SIGNALS};
use crate::vfs::FdTable;

/// The process table itself: spec §4.4's "array of process descriptors,
/// scanned linearly by pid; slots are reused once reaped." A `None`
/// slot is a free (or not-yet-allocated) entry.
pub struct ProcessTable {
    processes: Vec<Option<Process>>,
    tree: ProcessTree,
    next_pid: Pid,
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            processes: Vec::new(),
            tree: ProcessTree::new(),
            next_pid: 1,
        }
    }

    fn allocate_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    fn slot_for(&mut self, pid: Pid) -> &mut Option<Process> {
        let idx = pid as usize;
        if idx >= self.processes.len() {
            self.processes.resize_with(idx + 1, || None);
        }
        &mut self.processes[idx]
    }

    /// O(n) scan for the descriptor with this pid, per spec §4.4 (the
    /// table is small enough in practice that a scan beats the
    /// bookkeeping of a free list).
    pub fn process_from_pid(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes
            .get_mut(pid as usize)
            .and_then(|slot| slot.as_mut())
    }

    pub fn process_from_pid_ref(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(pid as usize).and_then(|slot| slot.as_ref())
    }

    pub fn tree(&self) -> &ProcessTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut ProcessTree {
        &mut self.tree
    }

    /// Build process 1 (init): no parent, a freshly aliased kernel
    /// directory, and an empty descriptor table. Everything else in the
    /// tree descends from this call.
    pub fn spawn_init(
        &mut self,
        name: &str,
        kernel_directory: &PageDirectory,
        directory_physical_address: u32,
    ) -> Pid {
        let pid = self.allocate_pid();
        assert_eq!(pid, 1, "init must be the first process spawned");
        let tree_entry = self.tree.insert_root(pid);

        let directory =
            PageDirectory::new_with_kernel_base(kernel_directory, directory_physical_address);

        let process = new_process(pid, name, tree_entry, directory, PID_NONE);
        *self.slot_for(pid) = Some(process);
        pid
    }

    /// Create a new process as a child of `parent`, with its own fresh
    /// directory (callers building a forked child instead populate the
    /// directory separately and overwrite the placeholder; this is the
    /// entry point for processes not descended by `fork`, e.g. spawned
    /// directly by the kernel).
    pub fn spawn_process(
        &mut self,
        name: &str,
        parent: Pid,
        directory: PageDirectory,
    ) -> Pid {
        let pid = self.allocate_pid();
        let parent_tree_entry = self
            .process_from_pid_ref(parent)
            .map(|p| p.tree_entry)
            .expect("spawn_process: parent must exist");
        let tree_entry = self.tree.insert_child(pid, parent_tree_entry);

        let group = self.process_from_pid_ref(parent).map(|p| p.group).unwrap_or(pid);
        let mut process = new_process(pid, name, tree_entry, directory, parent);
        process.group = group;
        if let Some(parent_proc) = self.process_from_pid_ref(parent) {
            process.job = parent_proc.job;
            process.session = parent_proc.session;
            process.user = parent_proc.user;
        }
        *self.slot_for(pid) = Some(process);
        pid
    }

    /// Build the child half of a `fork()`: a new process attached under
    /// `parent` in the tree, inheriting its image/group/job/session/user
    /// metadata, with `directory` as its (already cloned) address space
    /// and a fresh, empty descriptor table of its own.
    pub fn fork_process(&mut self, parent: Pid, directory: PageDirectory) -> Pid {
        let pid = self.allocate_pid();
        let parent_proc = self
            .process_from_pid_ref(parent)
            .expect("fork_process: parent must exist");
        let parent_tree_entry = parent_proc.tree_entry;
        let image = parent_proc.image;
        let group = parent_proc.group;
        let job = parent_proc.job;
        let session = parent_proc.session;
        let user = parent_proc.user;

        let tree_entry = self.tree.insert_child(pid, parent_tree_entry);
        let mut process = new_process(pid, "fork", tree_entry, directory, parent);
        process.image = image;
        process.group = group;
        process.job = job;
        process.session = session;
        process.user = user;
        *self.slot_for(pid) = Some(process);
        pid
    }

    /// Build the child half of a `clone()`: a new process attached under
    /// `parent` in the tree, sharing `directory` and `fds` outright
    /// (both already reference-counted by the caller) rather than
    /// copying them.
    pub fn clone_thread(
        &mut self,
        parent: Pid,
        directory: Arc<Mutex<PageDirectory>>,
        fds: Arc<Mutex<FdTable>>,
    ) -> Pid {
        let pid = self.allocate_pid();
        let parent_proc = self
            .process_from_pid_ref(parent)
            .expect("clone_thread: parent must exist");
        let parent_tree_entry = parent_proc.tree_entry;
        let image = parent_proc.image;
        let group = if parent_proc.group != 0 { parent_proc.group } else { parent };
        let job = parent_proc.job;
        let session = parent_proc.session;
        let user = parent_proc.user;

        let tree_entry = self.tree.insert_child(pid, parent_tree_entry);
        let mut process = Process {
            pid,
            name: String::from("clone"),
            user,
            mask: 0,
            group,
            job,
            session,
            thread: crate::scheduler::context::Context::default(),
            page_directory: directory,
            tree_entry,
            image,
            fds,
            status: 0,
            signals: [0u32; NUM_SIGNALS + 1],
            signal_queue: alloc::collections::VecDeque::new(),
            signal_state: None,
            finished: false,
            started: false,
            reaped: false,
            syscall_registers_offset: 0,
            wait_queue: Vec::new(),
            shm_mappings: Vec::new(),
            ipc: IpcState::Running,
            pending_message: None,
            ipc_queue: crate::ipc::IpcQueue::new(),
            kernel_stack: Box::new([0u8; KERNEL_STACK_SIZE]),
        };
        process.group = group;
        *self.slot_for(pid) = Some(process);
        pid
    }

    /// Remove a reaped process from the table and the tree entirely,
    /// freeing its pid slot for reuse is deliberately *not* done (spec
    /// never asks for pid recycling, and recycling pids is a classic
    /// source of stale-reference bugs).
    pub fn remove(&mut self, pid: Pid) {
        if let Some(proc) = self.process_from_pid_ref(pid) {
            let entry = proc.tree_entry;
            self.tree.remove(entry);
        }
        if let Some(slot) = self.processes.get_mut(pid as usize) {
            *slot = None;
        }
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Process> {
        self.processes.iter_mut().filter_map(|s| s.as_mut())
    }
}

fn new_process(
    pid: Pid,
    name: &str,
    tree_entry: NodeId,
    directory: PageDirectory,
    parent: Pid,
) -> Process {
    Process {
        pid,
        name: String::from(name),
        user: 0,
        mask: 0,
        group: parent.max(pid),
        job: parent,
        session: parent,
        thread: crate::scheduler::context::Context::default(),
        page_directory: Arc::new(Mutex::new(directory)),
        tree_entry,
        image: Image::default(),
        fds: Arc::new(Mutex::new(FdTable::new())),
        status: 0 as ProcessStatus,
        signals: [0u32; NUM_SIGNALS + 1],
        signal_queue: alloc::collections::VecDeque::new(),
        signal_state: None,
        finished: false,
        started: false,
        reaped: false,
        syscall_registers_offset: 0,
        wait_queue: Vec::new(),
        shm_mappings: Vec::new(),
        ipc: IpcState::Running,
        pending_message: None,
        ipc_queue: crate::ipc::IpcQueue::new(),
        kernel_stack: Box::new([0u8; KERNEL_STACK_SIZE]),
    }
}

/// Append a new file handle to `pid`'s descriptor table at the lowest
/// free slot, returning the new fd number. Matches spec §3's
/// "append/move" fd-table operations; capacity growth is handled inside
/// `FdTable` itself.
pub fn process_append_fd(
    table: &mut ProcessTable,
    pid: Pid,
    handle: Arc<crate::vfs::FileHandle>,
) -> Option<i32> {
    table.process_from_pid(pid).map(|p| p.fds.lock().append(handle))
}

/// Move whatever is at `src` fd to `dst` fd in `pid`'s table (used by
/// `dup2`-style redirection and by the loader setting up stdio).
pub fn process_move_fd(table: &mut ProcessTable, pid: Pid, src: i32, dst: i32) -> bool {
    let proc = match table.process_from_pid(pid) {
        Some(p) => p,
        None => return false,
    };
    let mut fds = proc.fds.lock();
    match fds.get(src) {
        Some(handle) => {
            fds.place(dst, handle);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::paging::PageDirectory;

    #[test]
    fn spawn_init_is_always_pid_one() {
        let kernel = PageDirectory::empty(0x1000);
        let mut table = ProcessTable::new();
        let pid = table.spawn_init("init", &kernel, 0x2000);
        assert_eq!(pid, 1);
        assert!(table.process_from_pid(1).is_some());
    }

    #[test]
    fn spawn_process_attaches_to_parent_in_tree() {
        let kernel = PageDirectory::empty(0x1000);
        let mut table = ProcessTable::new();
        let init = table.spawn_init("init", &kernel, 0x2000);
        let child_dir = PageDirectory::new_with_kernel_base(&kernel, 0x3000);
        let child = table.spawn_process("child", init, child_dir);

        assert_eq!(table.tree().parent_of(table.process_from_pid_ref(child).unwrap().tree_entry), Some(init));
    }

    #[test]
    fn append_fd_grows_and_returns_lowest_free_slot() {
        let kernel = PageDirectory::empty(0x1000);
        let mut table = ProcessTable::new();
        let init = table.spawn_init("init", &kernel, 0x2000);
        let fd = process_append_fd(&mut table, init, crate::vfs::FileHandle::new());
        assert_eq!(fd, Some(0));
    }
}
