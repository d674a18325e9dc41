//! Two-level x86 page tables: page-table entries, page tables, and page
//! directories, plus the operations that build, clone, and tear them
//! down. See spec §3 and §4.2.
//!
//! A directory models spec.md §9's suggested split directly: each slot
//! is either empty, a table this directory owns outright (freed when the
//! directory's reference count reaches zero), or a table shared with the
//! kernel directory (never freed — the kernel directory outlives every
//! process). A parallel `physical_tables` array is kept in the exact
//! hardware format the CPU requires in CR3, mirroring whichever of the
//! three states each slot is in.

use alloc::boxed::Box;
use bit_field::BitField;

use super::{PhysicalMemory, FRAME_SIZE, PAGE_ENTRIES, SHM_BOUNDARY, TABLE_SPAN};
use crate::signals::{self, Signal};

/// One page-table entry: present/rw/user/accessed/dirty flags and a
/// 20-bit physical frame index, packed into 32 bits the way the CPU
/// expects. Physical address = `frame * FRAME_SIZE + offset`.
#[repr(transparent)]
#[derive(Clone, Copy, Default)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub fn present(&self) -> bool {
        self.0.get_bit(0)
    }
    pub fn set_present(&mut self, v: bool) {
        self.0.set_bit(0, v);
    }
    pub fn rw(&self) -> bool {
        self.0.get_bit(1)
    }
    pub fn set_rw(&mut self, v: bool) {
        self.0.set_bit(1, v);
    }
    pub fn user(&self) -> bool {
        self.0.get_bit(2)
    }
    pub fn set_user(&mut self, v: bool) {
        self.0.set_bit(2, v);
    }
    pub fn accessed(&self) -> bool {
        self.0.get_bit(5)
    }
    pub fn set_accessed(&mut self, v: bool) {
        self.0.set_bit(5, v);
    }
    pub fn dirty(&self) -> bool {
        self.0.get_bit(6)
    }
    pub fn set_dirty(&mut self, v: bool) {
        self.0.set_bit(6, v);
    }
    pub fn frame(&self) -> u32 {
        self.0.get_bits(12..32)
    }
    pub fn set_frame(&mut self, frame: u32) {
        self.0.set_bits(12..32, frame);
    }
}

/// A page table: 1024 entries, covering 4 MiB of address space.
#[repr(C, align(4096))]
pub struct PageTable {
    pub pages: [PageTableEntry; PAGE_ENTRIES],
}

impl PageTable {
    fn zeroed() -> Box<PageTable> {
        // A boxed, zero-initialized, page-aligned table. `Box::new` of a
        // large zeroed array relies on the allocator's fresh-page-is-zero
        // guarantee in practice, but we zero explicitly to not depend on
        // it.
        let mut table = Box::new(PageTable {
            pages: [PageTableEntry::default(); PAGE_ENTRIES],
        });
        for pte in table.pages.iter_mut() {
            *pte = PageTableEntry::default();
        }
        table
    }
}

/// What a directory slot holds: nothing yet, a table this directory
/// owns, or a table aliased from the kernel directory.
enum TableSlot {
    Empty,
    Owned(Box<PageTable>),
    Shared(*mut PageTable),
}

// SAFETY: directories are only ever mutated with interrupts masked (see
// spec §5); there is no concurrent access to the raw `Shared` pointer.
unsafe impl Send for TableSlot {}

/// A page directory: 1024 table slots, a parallel hardware-format
/// physical pointer array (the form CR3 requires), and a reference
/// count shared by every address space alias (forked children get a
/// fresh directory; cloned threads share this one).
pub struct PageDirectory {
    tables: alloc::vec::Vec<TableSlot>,
    /// Hardware-format slot contents: `physical_addr | flags`, or 0 if
    /// the slot is empty. Kept in sync with `tables` on every mutation.
    pub physical_tables: alloc::vec::Vec<u32>,
    /// Physical address of this directory's own `physical_tables`
    /// buffer — what gets loaded into CR3.
    pub physical_address: u32,
    pub ref_count: usize,
}

fn table_index(addr: u32) -> usize {
    (addr / TABLE_SPAN) as usize
}

fn page_index(addr: u32) -> usize {
    ((addr / FRAME_SIZE) % PAGE_ENTRIES as u32) as usize
}

impl PageDirectory {
    /// Build an empty directory with no tables at all. Used only to
    /// bootstrap the kernel directory itself.
    pub fn empty(physical_address: u32) -> Self {
        let mut tables = alloc::vec::Vec::with_capacity(PAGE_ENTRIES);
        for _ in 0..PAGE_ENTRIES {
            tables.push(TableSlot::Empty);
        }
        PageDirectory {
            tables,
            physical_tables: alloc::vec![0u32; PAGE_ENTRIES],
            physical_address,
            ref_count: 1,
        }
    }

    /// Is slot `idx` already backed by the same physical table as the
    /// kernel directory's slot `idx`? Compared by physical address
    /// (masking off the flag bits), exactly what the hardware-format
    /// array is for.
    fn is_shared_with_kernel(&self, idx: usize, kernel: &PageDirectory) -> bool {
        let self_phys = self.physical_tables[idx] & !0xFFF;
        let kernel_phys = kernel.physical_tables[idx] & !0xFFF;
        self_phys != 0 && self_phys == kernel_phys
    }

    /// Return the page-table entry governing `addr`, creating the
    /// intermediate table on demand if `make` is set. Matches spec
    /// §4.2's `get_page`.
    pub fn get_page(
        &mut self,
        addr: u32,
        make: bool,
        frames: &mut super::frame::FrameBitmap,
    ) -> Option<&mut PageTableEntry> {
        let ti = table_index(addr);
        let pi = page_index(addr);

        if matches!(self.tables[ti], TableSlot::Empty) {
            if !make {
                return None;
            }
            let mut table = PageTable::zeroed();
            let table_phys = table.as_mut() as *mut PageTable as u32;
            self.physical_tables[ti] = table_phys | 0b111; // present|rw|user
            self.tables[ti] = TableSlot::Owned(table);
        }

        match &mut self.tables[ti] {
            TableSlot::Owned(t) => Some(&mut t.pages[pi]),
            TableSlot::Shared(ptr) => {
                // SAFETY: the pointee is the kernel's table, which lives
                // for the lifetime of the kernel and is only mutated with
                // interrupts masked.
                Some(unsafe { &mut (**ptr).pages[pi] })
            }
            TableSlot::Empty => {
                let _ = frames;
                unreachable!("just populated above")
            }
        }
    }

    /// Clone this directory and its contents per spec §4.2:
    /// - slots aliased with the kernel directory stay aliased (shared
    ///   tables, shared physical pointers);
    /// - slots in the shared-memory region (`>= SHM_BOUNDARY`) are left
    ///   untouched;
    /// - every other present slot is deep-copied via `clone_table`.
    pub fn clone_directory(
        &self,
        kernel: &PageDirectory,
        frames: &mut super::frame::FrameBitmap,
        mem: &mut impl PhysicalMemory,
        new_physical_address: u32,
    ) -> PageDirectory {
        let mut dir = PageDirectory::empty(new_physical_address);

        for i in 0..PAGE_ENTRIES {
            if self.is_shared_with_kernel(i, kernel) {
                match &kernel.tables[i] {
                    TableSlot::Owned(t) => {
                        let ptr = t.as_ref() as *const PageTable as *mut PageTable;
                        dir.tables[i] = TableSlot::Shared(ptr);
                        dir.physical_tables[i] = kernel.physical_tables[i];
                    }
                    TableSlot::Shared(ptr) => {
                        dir.tables[i] = TableSlot::Shared(*ptr);
                        dir.physical_tables[i] = kernel.physical_tables[i];
                    }
                    TableSlot::Empty => {}
                }
                continue;
            }

            let addr_base = i as u32 * TABLE_SPAN;
            if addr_base >= SHM_BOUNDARY {
                // Shared-memory slots are left untouched; the shared
                // memory subsystem (out of scope here) repopulates them.
                continue;
            }

            if let TableSlot::Owned(src_table) = &self.tables[i] {
                let (new_table, phys) = clone_table(src_table, frames, mem);
                dir.physical_tables[i] = phys | 0b111;
                dir.tables[i] = TableSlot::Owned(new_table);
            }
        }

        dir
    }

    /// Build a fresh directory that aliases every populated kernel slot
    /// directly (not a `clone_directory`-style deep copy — used when a
    /// brand-new address space is created rather than forked, e.g.
    /// `spawn_init`, or when `clone()` hands a new thread the parent's
    /// directory outright).
    pub fn new_with_kernel_base(kernel: &PageDirectory, physical_address: u32) -> Self {
        let mut dir = PageDirectory::empty(physical_address);
        for i in 0..PAGE_ENTRIES {
            match &kernel.tables[i] {
                TableSlot::Owned(t) => {
                    let ptr = t.as_ref() as *const PageTable as *mut PageTable;
                    dir.tables[i] = TableSlot::Shared(ptr);
                    dir.physical_tables[i] = kernel.physical_tables[i];
                }
                TableSlot::Shared(ptr) => {
                    dir.tables[i] = TableSlot::Shared(*ptr);
                    dir.physical_tables[i] = kernel.physical_tables[i];
                }
                TableSlot::Empty => {}
            }
        }
        dir
    }

    /// Decrement the reference count; on reaching zero, free every
    /// frame referenced by a non-shared, non-SHM slot, free the table
    /// itself, and (by being dropped) free the directory. Matches spec
    /// §4.2's `release_directory`.
    pub fn release(mut self, frames: &mut super::frame::FrameBitmap) {
        self.ref_count -= 1;
        if self.ref_count > 0 {
            // Ownership doesn't actually transfer out in this branch;
            // the caller keeps the directory alive via its own Arc/refcount
            // bookkeeping. We only reach `drop` semantics below when this
            // really was the last reference.
            core::mem::forget(self);
            return;
        }

        for i in 0..PAGE_ENTRIES {
            let addr_base = i as u32 * TABLE_SPAN;
            if addr_base >= SHM_BOUNDARY {
                continue;
            }
            if let TableSlot::Owned(table) = &mut self.tables[i] {
                for pte in table.pages.iter_mut() {
                    if pte.frame() != 0 {
                        frames.free(pte);
                    }
                }
            }
        }
        // `self.tables`/`self.physical_tables` drop normally here, freeing
        // every owned `Box<PageTable>` and the directory's own storage.
    }

    pub fn decrement_ref_count(&mut self) {
        assert!(self.ref_count > 0, "page directory ref_count underflow");
        self.ref_count -= 1;
    }

    pub fn increment_ref_count(&mut self) {
        self.ref_count += 1;
    }

    /// Install this directory into hardware: load `physical_address`
    /// into CR3 and ensure paging is enabled.
    ///
    /// # Safety
    /// `physical_address` must be the physical address of a valid,
    /// fully-populated hardware page directory buffer.
    pub unsafe fn switch_page_directory(physical_address: u32) {
        core::arch::asm!(
            "mov cr3, {addr}",
            "mov {tmp}, cr0",
            "or {tmp}, 0x80000000",
            "mov cr0, {tmp}",
            addr = in(reg) physical_address,
            tmp = out(reg) _,
            options(nostack, preserves_flags),
        );
    }
}

/// Deep-copy a page table: for every present entry, allocate a fresh
/// frame, copy the 4 KiB physically, and preserve the access flags.
/// Matches spec §4.2's `clone_table`.
fn clone_table(
    src: &PageTable,
    frames: &mut super::frame::FrameBitmap,
    mem: &mut impl PhysicalMemory,
) -> (Box<PageTable>, u32) {
    let mut table = PageTable::zeroed();
    let phys = table.as_mut() as *mut PageTable as u32;

    for (i, src_pte) in src.pages.iter().enumerate() {
        if src_pte.frame() == 0 {
            continue;
        }
        let dst_pte = &mut table.pages[i];
        frames.alloc(dst_pte, false, false);
        dst_pte.set_present(src_pte.present());
        dst_pte.set_rw(src_pte.rw());
        dst_pte.set_user(src_pte.user());
        dst_pte.set_accessed(src_pte.accessed());
        dst_pte.set_dirty(src_pte.dirty());
        mem.copy_frame(src_pte.frame(), dst_pte.frame());
    }

    (table, phys)
}

/// Reserved instruction-pointer values that never name real code:
/// faulting on one triggers a specific kernel action instead of a
/// segmentation signal. See spec §6.
pub const SIGNAL_RETURN: u32 = 0xFFFF_FFFE;
pub const THREAD_RETURN: u32 = 0xFFFF_FFFD;

/// Page-fault policy: classify the fault by the faulting instruction
/// pointer, per spec §4.2.
pub enum FaultAction {
    ReturnFromSignal,
    ThreadExit,
    Segfault,
}

pub fn classify_fault(faulting_eip: u32) -> FaultAction {
    if faulting_eip == SIGNAL_RETURN {
        FaultAction::ReturnFromSignal
    } else if faulting_eip == THREAD_RETURN {
        FaultAction::ThreadExit
    } else {
        FaultAction::Segfault
    }
}

/// Entry point the IDT's page-fault handler calls after reading CR2 and
/// the faulting EIP out of the interrupt frame. Queues `SIGSEGV` on the
/// faulting case rather than delivering it inline (delivery happens at
/// the next scheduler entry, per spec §4.7).
pub fn handle_page_fault(faulting_eip: u32, pid: crate::process::Pid) {
    match classify_fault(faulting_eip) {
        FaultAction::ReturnFromSignal => signals::return_from_signal_handler(pid),
        FaultAction::ThreadExit => crate::scheduler::task_exit(pid, 0),
        FaultAction::Segfault => signals::queue_signal(pid, Signal::Segv),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame::FrameBitmap;

    struct FakePhysicalMemory {
        frames: alloc::vec::Vec<[u8; FRAME_SIZE as usize]>,
    }

    impl FakePhysicalMemory {
        fn new() -> Self {
            FakePhysicalMemory {
                frames: alloc::vec![[0u8; FRAME_SIZE as usize]; super::super::MAX_FRAMES.min(4096)],
            }
        }
    }

    impl PhysicalMemory for FakePhysicalMemory {
        fn zero_frame(&mut self, frame: u32) {
            self.frames[frame as usize] = [0; FRAME_SIZE as usize];
        }
        fn copy_frame(&mut self, src_frame: u32, dst_frame: u32) {
            let src = self.frames[src_frame as usize];
            self.frames[dst_frame as usize] = src;
        }
    }

    fn fresh_bitmap() -> FrameBitmap {
        let mut b = FrameBitmap::new();
        b.init(4096);
        b
    }

    #[test]
    fn pte_bit_packing_round_trips() {
        let mut pte = PageTableEntry::default();
        pte.set_present(true);
        pte.set_rw(true);
        pte.set_user(false);
        pte.set_frame(0x12345);
        assert!(pte.present());
        assert!(pte.rw());
        assert!(!pte.user());
        assert_eq!(pte.frame(), 0x12345);
    }

    #[test]
    fn get_page_creates_table_on_demand() {
        let mut frames = fresh_bitmap();
        let mut dir = PageDirectory::empty(0);
        assert!(dir.get_page(0x1000, false, &mut frames).is_none());
        assert!(dir.get_page(0x1000, true, &mut frames).is_some());
    }

    #[test]
    fn clone_directory_deep_copies_user_tables() {
        let mut frames = fresh_bitmap();
        let mut mem = FakePhysicalMemory::new();
        let kernel = PageDirectory::empty(0);

        let mut src = PageDirectory::empty(0x1000);
        {
            let pte = src.get_page(0x2000, true, &mut frames).unwrap();
            frames.alloc(pte, false, true);
        }

        let cloned = src.clone_directory(&kernel, &mut frames, &mut mem, 0x2000);
        let src_frame = {
            let pte = src.get_page(0x2000, false, &mut frames).unwrap();
            pte.frame()
        };
        let mut cloned = cloned;
        let dst_frame = {
            let pte = cloned.get_page(0x2000, false, &mut frames).unwrap();
            pte.frame()
        };
        assert_ne!(src_frame, dst_frame, "clone must allocate a fresh frame");
    }

    #[test]
    fn clone_then_release_restores_bitmap() {
        let mut frames = fresh_bitmap();
        let mut mem = FakePhysicalMemory::new();
        let kernel = PageDirectory::empty(0);

        let mut src = PageDirectory::empty(0x1000);
        {
            let pte = src.get_page(0x2000, true, &mut frames).unwrap();
            frames.alloc(pte, false, true);
        }

        let before = frames.first_free();
        let cloned = src.clone_directory(&kernel, &mut frames, &mut mem, 0x3000);
        assert_ne!(frames.first_free(), before, "clone must consume frames");
        cloned.release(&mut frames);
        assert_eq!(
            frames.first_free(),
            before,
            "releasing the clone must restore the bitmap"
        );
    }

    #[test]
    fn shm_region_is_left_untouched_on_clone() {
        let mut frames = fresh_bitmap();
        let mut mem = FakePhysicalMemory::new();
        let kernel = PageDirectory::empty(0);
        let mut src = PageDirectory::empty(0x1000);
        {
            let pte = src.get_page(SHM_BOUNDARY, true, &mut frames).unwrap();
            frames.alloc(pte, false, true);
        }
        let mut cloned = src.clone_directory(&kernel, &mut frames, &mut mem, 0x3000);
        assert!(cloned.get_page(SHM_BOUNDARY, false, &mut frames).is_none());
    }

    #[test]
    fn classify_fault_matches_sentinels() {
        assert!(matches!(
            classify_fault(SIGNAL_RETURN),
            FaultAction::ReturnFromSignal
        ));
        assert!(matches!(
            classify_fault(THREAD_RETURN),
            FaultAction::ThreadExit
        ));
        assert!(matches!(classify_fault(0x1234), FaultAction::Segfault));
    }
}
