//! CPU-entry glue: the GDT/TSS and the IDT/PIC setup the rest of the
//! kernel needs before it can take an interrupt or drop to ring 3. Pure
//! ambient boot machinery — none of it is part of the process/memory
//! core, but nothing else runs without it.

pub mod gdt;
pub mod idt;

/// Bring up the CPU-entry machinery: GDT/TSS first (so `idt::init`'s
/// handlers can reference `gdt::KERNEL_CODE_SELECTOR`), then the IDT
/// and PIC remap.
///
/// # Safety
/// Must run exactly once, very early in boot, before paging or the
/// scheduler are touched.
pub unsafe fn init() {
    gdt::init();
    idt::init();
}
