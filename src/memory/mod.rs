//! Physical/virtual memory subsystem: frame bitmap, page directories, and
//! the kernel heap. See `frame`, `paging`, and `heap` for the three
//! components described in the process/memory core design.

pub mod frame;
pub mod heap;
pub mod paging;

use lazy_static::lazy_static;
use spin::Mutex;

use paging::PageDirectory;

/// Size in bytes of one physical page frame.
pub const FRAME_SIZE: u32 = 0x1000;

/// Number of entries in one page table / one page directory.
pub const PAGE_ENTRIES: usize = 1024;

/// Bytes covered by a single page table (`PAGE_ENTRIES` frames).
pub const TABLE_SPAN: u32 = FRAME_SIZE * PAGE_ENTRIES as u32;

/// Virtual address at and above which page-directory slots are shared
/// shared-memory-chunk territory: never deep-copied on `clone_directory`,
/// left untouched for the shared-memory subsystem (out of scope here) to
/// populate. Chosen, like the teacher's SHM window, to leave the top
/// eighth of the 32-bit address space for shared mappings.
pub const SHM_BOUNDARY: u32 = 0xE000_0000;

/// Highest physical frame this kernel can track with a static bitmap,
/// i.e. the most physical memory `frame::FrameBitmap` can describe
/// (4 GiB / `FRAME_SIZE`).
pub const MAX_FRAMES: usize = 0x10_0000;

/// A seam over raw physical-memory access, so that the frame/table
/// copying primitives in `paging` can be driven in tests without a real
/// identity mapping. See SPEC_FULL.md §4.10.
pub trait PhysicalMemory {
    /// Zero an entire physical frame.
    fn zero_frame(&mut self, frame: u32);
    /// Copy one physical frame's contents onto another.
    fn copy_frame(&mut self, src_frame: u32, dst_frame: u32);
}

/// The hardware implementation of [`PhysicalMemory`]: physical memory
/// below the kernel's identity-mapped window is accessed directly by
/// treating the physical address as a virtual one, exactly as the boot
/// sequence's identity map (§4.2) guarantees for low memory.
pub struct IdentityMappedMemory;

impl PhysicalMemory for IdentityMappedMemory {
    fn zero_frame(&mut self, frame: u32) {
        let ptr = (frame * FRAME_SIZE) as usize as *mut u8;
        // SAFETY: `frame` is a frame index returned by the frame allocator,
        // which only ever hands out frames within the identity-mapped
        // region established at boot.
        unsafe {
            core::ptr::write_bytes(ptr, 0, FRAME_SIZE as usize);
        }
    }

    fn copy_frame(&mut self, src_frame: u32, dst_frame: u32) {
        let src = (src_frame * FRAME_SIZE) as usize as *const u8;
        let dst = (dst_frame * FRAME_SIZE) as usize as *mut u8;
        // SAFETY: both frames are identity-mapped physical frames and do
        // not overlap (a fresh frame is never the source of its own copy).
        unsafe {
            core::ptr::copy_nonoverlapping(src, dst, FRAME_SIZE as usize);
        }
    }
}

lazy_static! {
    /// The kernel's own page directory, shared (by alias, never by
    /// copy) into every process's address space. Every other directory
    /// is built relative to this one.
    static ref KERNEL_DIRECTORY: Mutex<Option<PageDirectory>> = Mutex::new(None);
}

/// Install `directory` as the kernel directory. Called once, during
/// boot, before any process is spawned.
pub fn install_kernel_directory(directory: PageDirectory) {
    let mut slot = KERNEL_DIRECTORY.lock();
    assert!(slot.is_none(), "kernel directory installed twice");
    *slot = Some(directory);
}

/// Run `f` with a reference to the kernel directory. Panics if called
/// before `install_kernel_directory`.
pub fn with_kernel_directory<F, R>(f: F) -> R
where
    F: FnOnce(&PageDirectory) -> R,
{
    let guard = KERNEL_DIRECTORY.lock();
    f(guard.as_ref().expect("kernel directory not installed"))
}

/// Run `f` with mutable access to the kernel directory (page-table
/// lookups that may need to resolve, but not create, a mapping). Panics
/// if called before `install_kernel_directory`.
pub fn with_kernel_directory_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut PageDirectory) -> R,
{
    let mut guard = KERNEL_DIRECTORY.lock();
    f(guard.as_mut().expect("kernel directory not installed"))
}

/// Initialize the memory subsystem: size the frame bitmap from the
/// Multiboot2 memory map, reserve the frames already in use by the
/// kernel image and the placement allocator, and install the kernel
/// page directory.
///
/// # Safety
/// `multiboot_info_addr` must be the physical address the bootloader
/// passed in, and must still be valid (not yet overwritten).
pub unsafe fn init(multiboot_info_addr: usize) {
    let boot_info = multiboot2::BootInformation::load(multiboot_info_addr as *const _)
        .expect("failed to load Multiboot2 info");
    let memory_map = boot_info
        .memory_map_tag()
        .expect("Multiboot2 memory map tag required");

    let highest_addr = memory_map
        .memory_areas()
        .iter()
        .map(|area| area.end_address())
        .max()
        .unwrap_or(0);
    let nframes = (highest_addr as usize / FRAME_SIZE as usize).min(MAX_FRAMES);

    {
        let mut bitmap = frame::FRAME_BITMAP.lock();
        bitmap.init(nframes);
    }

    heap::init_placement(&boot_info);

    crate::log_info!(
        "memory: bitmap sized for {} frames ({} MiB)",
        nframes,
        (nframes as u64 * FRAME_SIZE as u64) / (1024 * 1024)
    );
}
