//! The 32-bit IDT: gate descriptors, the PIC8259 remap, and the
//! handful of ISR stubs the process/memory core actually drives (timer,
//! page fault). Syscall dispatch itself is out of scope; this only
//! wires the vector up to whatever the syscall layer installs.

use core::mem::size_of;

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;

const IDT_ENTRIES: usize = 256;

pub const PIC_1_OFFSET: u8 = 0x20;
pub const PIC_2_OFFSET: u8 = 0x28;

pub const TIMER_VECTOR: u8 = PIC_1_OFFSET;
pub const KEYBOARD_VECTOR: u8 = PIC_1_OFFSET + 1;
pub const PAGE_FAULT_VECTOR: u8 = 14;
pub const SYSCALL_VECTOR: u8 = 0x80;

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn new(handler: u32, selector: u16, type_attr: u8) -> Self {
        IdtEntry {
            offset_low: (handler & 0xFFFF) as u16,
            selector,
            zero: 0,
            type_attr,
            offset_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

struct Idt {
    entries: [IdtEntry; IDT_ENTRIES],
}

lazy_static! {
    static ref IDT: Mutex<Idt> = Mutex::new(Idt {
        entries: [IdtEntry::missing(); IDT_ENTRIES],
    });
}

/// Register a handler for `vector`, a 32-bit interrupt gate in ring 0.
pub fn set_handler(vector: u8, handler: u32) {
    let mut idt = IDT.lock();
    idt.entries[vector as usize] = IdtEntry::new(handler, super::gdt::KERNEL_CODE_SELECTOR, 0x8E);
}

/// Remap the PICs above the CPU's own exception vectors, build the IDT
/// with the handlers this kernel actually cares about, and load it.
///
/// # Safety
/// Must run once during boot, with interrupts still masked; installs
/// raw function-pointer handlers that the assembly ISR stubs expect to
/// find at these exact vectors.
pub unsafe fn init() {
    PICS.lock().initialize();

    set_handler(PAGE_FAULT_VECTOR, page_fault_stub as u32);
    set_handler(TIMER_VECTOR, timer_stub as u32);

    let idt = IDT.lock();
    let pointer = IdtPointer {
        limit: (size_of::<IdtEntry>() * IDT_ENTRIES - 1) as u16,
        base: idt.entries.as_ptr() as u32,
    };
    core::arch::asm!("lidt [{0}]", in(reg) &pointer);
}

/// Acknowledge the interrupt that's currently being serviced so the PIC
/// will deliver further ones.
pub fn end_of_interrupt(vector: u8) {
    unsafe { PICS.lock().notify_end_of_interrupt(vector) };
}

extern "C" fn page_fault_stub() {
    let faulting_eip: u32;
    let cr2: u32;
    unsafe {
        core::arch::asm!("mov {0}, cr2", out(reg) cr2, options(nostack, preserves_flags));
    }
    faulting_eip = cr2;
    let pid = crate::scheduler::current_pid();
    crate::memory::paging::handle_page_fault(faulting_eip, pid);
    end_of_interrupt(PAGE_FAULT_VECTOR);
}

extern "C" fn timer_stub() {
    let tick = crate::sleep::tick();
    crate::sleep::wake_sleepers(tick);
    end_of_interrupt(TIMER_VECTOR);
    crate::scheduler::switch_task(false);
}
