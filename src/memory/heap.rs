//! The kernel heap: a placement (bump) allocator used before the heap is
//! installed, then a conventional allocator over a growable, brk-style
//! region. See spec §4.3.

use linked_list_allocator::LockedHeap;
use spin::Mutex;

use super::paging::PageDirectory;
use super::FRAME_SIZE;

/// Ceiling on kernel heap growth: `sbrk` past this is a fatal
/// precondition violation, per spec §4.3.
pub const HEAP_CEILING: u32 = 0x4000_0000;

/// Fixed virtual base for the heap phase, set once by `heap_install`.
static PLACEMENT: Mutex<PlacementState> = Mutex::new(PlacementState {
    next: 0,
    heap_installed: false,
});

struct PlacementState {
    next: u32,
    heap_installed: bool,
}

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

/// Placement phase: record the end of the kernel image as the initial
/// bump pointer. Called once, early, before any frame allocation.
pub fn init_placement(boot_info: &multiboot2::BootInformation) {
    let end = boot_info.end_address() as u32;
    let mut state = PLACEMENT.lock();
    state.next = end;
}

/// `kmalloc_real`: before `heap_install`, bump-allocate `size` bytes
/// (`align`ing up to a page boundary first if requested) directly out of
/// the placement region, identity-mapped so virtual and physical
/// addresses coincide. After `heap_install`, delegate to the installed
/// heap allocator instead and resolve the physical frame backing the
/// returned address through the kernel directory — mirroring the
/// original `kmalloc_real`'s branch on `heap_end` to `malloc`/`valloc`
/// plus a `get_page` lookup.
pub fn kmalloc_real(size: u32, align: bool, phys_out: Option<&mut u32>) -> u32 {
    if PLACEMENT.lock().heap_installed {
        return kmalloc_through_heap(size, align, phys_out);
    }

    let mut state = PLACEMENT.lock();
    if align && state.next & 0xFFF != 0 {
        state.next = (state.next & !0xFFF) + FRAME_SIZE;
    }
    let addr = state.next;
    state.next += size;
    if let Some(out) = phys_out {
        // Identity-mapped at boot, so virtual == physical here.
        *out = addr;
    }
    addr
}

/// Post-install allocation path: hand the request to the global
/// `alloc`-crate heap, then, if a physical address was requested,
/// resolve it by walking the kernel directory for the mapping
/// `heap_install`/`sbrk` already installed for this address.
fn kmalloc_through_heap(size: u32, align: bool, phys_out: Option<&mut u32>) -> u32 {
    let alignment = if align {
        FRAME_SIZE as usize
    } else {
        core::mem::align_of::<u64>()
    };
    let layout = core::alloc::Layout::from_size_align(size as usize, alignment)
        .expect("kmalloc_real: invalid layout");

    // SAFETY: `layout` has a non-zero size and a power-of-two alignment;
    // the returned pointer is checked for null immediately below.
    let ptr = unsafe { alloc::alloc::alloc(layout) };
    assert!(!ptr.is_null(), "kmalloc_real: heap allocation failed");
    let addr = ptr as u32;

    if let Some(out) = phys_out {
        *out = super::with_kernel_directory_mut(|kernel| {
            let mut frames = super::frame::FRAME_BITMAP.lock();
            let pte = kernel
                .get_page(addr, false, &mut frames)
                .expect("kmalloc_real: heap address has no mapping");
            pte.frame() * FRAME_SIZE + (addr & 0xFFF)
        });
    }

    addr
}

/// Record the current placement pointer (rounded up to a page) as the
/// start of the heap-phase region, and hand that region to the global
/// allocator. After this call, `kmalloc_real`'s bump pointer is frozen;
/// ordinary allocation goes through `alloc::alloc` / `Box` / `Vec`.
///
/// # Safety
/// Must be called exactly once, after the frame allocator and kernel
/// page directory are both initialized, and before any `alloc`-crate
/// allocation is attempted.
pub unsafe fn heap_install(kernel_directory: &mut PageDirectory, frames: &mut super::frame::FrameBitmap) {
    let mut state = PLACEMENT.lock();
    assert!(!state.heap_installed, "heap_install called twice");
    let heap_start = (state.next + FRAME_SIZE - 1) & !(FRAME_SIZE - 1);
    state.next = heap_start;
    state.heap_installed = true;
    drop(state);

    // Back the first page of the heap immediately so the allocator has
    // somewhere to carve blocks from; `sbrk` grows it from here.
    let initial_pages = 16u32;
    for i in 0..initial_pages {
        let addr = heap_start + i * FRAME_SIZE;
        let pte = kernel_directory
            .get_page(addr, true, frames)
            .expect("kernel directory must have room for the heap");
        frames.alloc(pte, true, true);
    }

    HEAP.lock()
        .init(heap_start as *mut u8, (initial_pages * FRAME_SIZE) as usize);

    let mut state = PLACEMENT.lock();
    state.next = heap_start + initial_pages * FRAME_SIZE;
}

/// Grow the heap by `n` bytes, backing each new page with a frame from
/// the kernel directory. `n` must be a page multiple; the current heap
/// end must be page-aligned (it always is, by construction); and
/// `heap_end + n` must not exceed `HEAP_CEILING`. Any violation is
/// fatal, per spec §4.3/§7.
pub fn sbrk(n: u32, kernel_directory: &mut PageDirectory, frames: &mut super::frame::FrameBitmap) -> u32 {
    assert!(n % FRAME_SIZE == 0, "sbrk: size must be a page multiple");
    let mut state = PLACEMENT.lock();
    assert!(state.heap_installed, "sbrk before heap_install");
    assert!(state.next % FRAME_SIZE == 0, "sbrk: heap end not page-aligned");
    assert!(
        state.next.checked_add(n).map(|e| e <= HEAP_CEILING) == Some(true),
        "sbrk: would exceed heap ceiling"
    );

    let old_end = state.next;
    let pages = n / FRAME_SIZE;
    for i in 0..pages {
        let addr = old_end + i * FRAME_SIZE;
        let pte = kernel_directory
            .get_page(addr, true, frames)
            .expect("kernel directory must have room for heap growth");
        frames.alloc(pte, true, true);
    }
    state.next = old_end + n;
    drop(state);

    // SAFETY: the pages just mapped in above are freshly allocated,
    // zero-filled frames, handed exclusively to the heap allocator.
    unsafe {
        HEAP.lock().extend(n as usize);
    }
    old_end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kmalloc_real_bumps_monotonically() {
        let mut state = PLACEMENT.lock();
        state.next = 0x1000;
        state.heap_installed = false;
        drop(state);

        let mut phys = 0u32;
        let a = kmalloc_real(64, false, Some(&mut phys));
        let b = kmalloc_real(64, false, None);
        assert_eq!(a, 0x1000);
        assert_eq!(phys, 0x1000);
        assert_eq!(b, 0x1040);
    }

    #[test]
    fn kmalloc_real_page_aligns_when_requested() {
        let mut state = PLACEMENT.lock();
        state.next = 0x1234;
        state.heap_installed = false;
        drop(state);

        let a = kmalloc_real(16, true, None);
        assert_eq!(a % FRAME_SIZE, 0);
    }
}
