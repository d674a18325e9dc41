//! The 32-bit flat-model GDT and the one Task State Segment used to
//! load `esp0` on a ring3→ring0 transition. Ambient boot glue: none of
//! this is part of the process/memory core, but the core can't run
//! without it.

use core::mem::size_of;

use bitflags::bitflags;
use lazy_static::lazy_static;
use spin::Mutex;

const GDT_ENTRIES: usize = 6;

bitflags! {
    /// Access byte for a GDT descriptor: present bit, descriptor
    /// privilege level, and the type bits that distinguish code, data,
    /// and the TSS.
    #[derive(Clone, Copy)]
    struct Access: u8 {
        const PRESENT    = 1 << 7;
        const RING3      = 0b0110_0000;
        const CODE_DATA  = 1 << 4;
        const EXECUTABLE = 1 << 3;
        const READ_WRITE = 1 << 1;
        const TSS_TYPE   = 0b0000_1001;
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_middle: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        GdtEntry {
            limit_low: 0,
            base_low: 0,
            base_middle: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
        }
    }

    const fn new(base: u32, limit: u32, access: u8, granularity: u8) -> Self {
        GdtEntry {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_middle: ((base >> 16) & 0xFF) as u8,
            access,
            granularity: (granularity & 0xF0) | (((limit >> 16) & 0x0F) as u8),
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }
}

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Tss {
    prev_tss: u32,
    pub esp0: u32,
    pub ss0: u32,
    unused: [u32; 23],
    iomap_base: u16,
}

impl Tss {
    const fn empty() -> Self {
        Tss {
            prev_tss: 0,
            esp0: 0,
            ss0: 0x10,
            unused: [0; 23],
            iomap_base: size_of::<Tss>() as u16,
        }
    }
}

struct GdtTable {
    entries: [GdtEntry; GDT_ENTRIES],
    tss: Tss,
}

lazy_static! {
    static ref GDT: Mutex<GdtTable> = Mutex::new(GdtTable {
        entries: [GdtEntry::null(); GDT_ENTRIES],
        tss: Tss::empty(),
    });
}

/// Segment selectors the rest of the kernel (and the IDT's ISR stubs)
/// reference by name rather than by raw index.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;
pub const TSS_SELECTOR: u16 = 0x28;

/// Build and load the GDT: null, kernel code/data, user code/data, and
/// the TSS, then reload the segment registers and `ltr` the TSS.
///
/// # Safety
/// Must run once, early in boot, before any interrupt or ring
/// transition; invalidates every previously loaded segment selector.
pub unsafe fn init() {
    let tss_base;
    {
        let mut table = GDT.lock();
        let kernel_code = Access::PRESENT | Access::CODE_DATA | Access::EXECUTABLE | Access::READ_WRITE;
        let kernel_data = Access::PRESENT | Access::CODE_DATA | Access::READ_WRITE;
        let user_code = kernel_code | Access::RING3;
        let user_data = kernel_data | Access::RING3;
        let tss_access = Access::PRESENT | Access::TSS_TYPE;

        table.entries[1] = GdtEntry::new(0, 0xFFFFF, kernel_code.bits(), 0xC0);
        table.entries[2] = GdtEntry::new(0, 0xFFFFF, kernel_data.bits(), 0xC0);
        table.entries[3] = GdtEntry::new(0, 0xFFFFF, user_code.bits(), 0xC0);
        table.entries[4] = GdtEntry::new(0, 0xFFFFF, user_data.bits(), 0xC0);

        let tss_addr = &table.tss as *const Tss as u32;
        tss_base = tss_addr;
        let tss_limit = size_of::<Tss>() as u32 - 1;
        table.entries[5] = GdtEntry::new(tss_addr, tss_limit, tss_access.bits(), 0x00);
    }
    let _ = tss_base;

    let table = GDT.lock();
    let pointer = GdtPointer {
        limit: (size_of::<GdtEntry>() * GDT_ENTRIES - 1) as u16,
        base: table.entries.as_ptr() as u32,
    };

    core::arch::asm!(
        "lgdt [{ptr}]",
        "mov ax, {data_sel:x}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "mov ss, ax",
        "ltr {tss_sel:x}",
        ptr = in(reg) &pointer,
        data_sel = in(reg) KERNEL_DATA_SELECTOR,
        tss_sel = in(reg) TSS_SELECTOR,
        out("ax") _,
    );
}

/// Update the kernel stack pointer the CPU loads on the next
/// ring3→ring0 transition (the top of whichever kernel stack the
/// about-to-run process owns).
pub fn set_kernel_stack(esp0: u32) {
    GDT.lock().tss.esp0 = esp0;
}
