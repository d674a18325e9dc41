//! The process-facing slice of the file descriptor layer: an opaque,
//! reference-counted handle type and the per-process table of them.
//! The filesystem behind a handle (VFS tree, mounts, pipes, `ramfs`) is
//! out of scope here; this module only owns the table `fork`/`clone`/
//! syscalls actually touch.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

/// An opaque, reference-counted file handle. What it actually refers to
/// (a console, a pipe end, an inode) is the concern of the filesystem
/// layer; the process/fork/clone machinery only ever copies the `Arc`.
pub struct FileHandle {
    inner: Mutex<FileHandleInner>,
}

struct FileHandleInner {
    offset: u64,
}

impl FileHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(FileHandle {
            inner: Mutex::new(FileHandleInner { offset: 0 }),
        })
    }

    pub fn offset(&self) -> u64 {
        self.inner.lock().offset
    }

    pub fn set_offset(&self, offset: u64) {
        self.inner.lock().offset = offset;
    }
}

/// Initial and growth-step capacity for a process's descriptor table.
const FD_TABLE_INITIAL_CAPACITY: usize = 4;

/// A process's table of open file handles, indexed by file descriptor
/// number. Slots are `None` when the descriptor is closed. Capacity
/// doubles on overflow rather than growing one slot at a time, so a
/// process opening many files doesn't pay for a `Vec` reallocation on
/// every single `open`.
pub struct FdTable {
    slots: Vec<Option<Arc<FileHandle>>>,
}

impl FdTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(FD_TABLE_INITIAL_CAPACITY);
        slots.resize_with(FD_TABLE_INITIAL_CAPACITY, || None);
        FdTable { slots }
    }

    /// Install `handle` at the lowest free descriptor number, growing
    /// the table (doubling its capacity) if every slot is taken.
    pub fn append(&mut self, handle: Arc<FileHandle>) -> i32 {
        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[idx] = Some(handle);
            return idx as i32;
        }
        let old_len = self.slots.len();
        self.slots.resize_with(old_len * 2, || None);
        self.slots[old_len] = Some(handle);
        old_len as i32
    }

    /// Install `handle` at a specific descriptor number, growing the
    /// table if `fd` doesn't fit yet (used by `dup2`-style moves and by
    /// `fork`, which preserves the child's descriptor numbers exactly).
    pub fn place(&mut self, fd: i32, handle: Arc<FileHandle>) {
        let fd = fd as usize;
        if fd >= self.slots.len() {
            let mut new_len = self.slots.len().max(1);
            while new_len <= fd {
                new_len *= 2;
            }
            self.slots.resize_with(new_len, || None);
        }
        self.slots[fd] = Some(handle);
    }

    pub fn get(&self, fd: i32) -> Option<Arc<FileHandle>> {
        if fd < 0 {
            return None;
        }
        self.slots.get(fd as usize).and_then(|s| s.clone())
    }

    pub fn close(&mut self, fd: i32) -> bool {
        if fd < 0 {
            return false;
        }
        match self.slots.get_mut(fd as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Deep-clone the table for `fork`: every live handle's `Arc` is
    /// cloned (shared, not duplicated), matching the spec's "each entry
    /// is an `Arc`-clone of the parent's, so the underlying resource is
    /// shared" fork semantics.
    pub fn fork(&self) -> Self {
        FdTable {
            slots: self.slots.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_fills_lowest_free_slot() {
        let mut table = FdTable::new();
        let a = table.append(FileHandle::new());
        let b = table.append(FileHandle::new());
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        table.close(0);
        let c = table.append(FileHandle::new());
        assert_eq!(c, 0);
    }

    #[test]
    fn append_doubles_capacity_on_overflow() {
        let mut table = FdTable::new();
        for _ in 0..FD_TABLE_INITIAL_CAPACITY {
            table.append(FileHandle::new());
        }
        let overflow = table.append(FileHandle::new());
        assert_eq!(overflow, FD_TABLE_INITIAL_CAPACITY as i32);
        assert!(table.slots.len() >= FD_TABLE_INITIAL_CAPACITY + 1);
    }

    #[test]
    fn fork_shares_handles_via_arc_clone() {
        let mut table = FdTable::new();
        let fd = table.append(FileHandle::new());
        let handle = table.get(fd).unwrap();
        handle.set_offset(42);

        let forked = table.fork();
        let shared = forked.get(fd).unwrap();
        assert_eq!(shared.offset(), 42);
        assert!(Arc::ptr_eq(&handle, &shared));
    }

    #[test]
    fn close_then_get_returns_none() {
        let mut table = FdTable::new();
        let fd = table.append(FileHandle::new());
        assert!(table.close(fd));
        assert!(table.get(fd).is_none());
        assert!(!table.close(fd));
    }
}
