//! Panic handling: print to both consoles, then halt forever. A kernel
//! panic has nowhere left to unwind to (`panic = "abort"` in both
//! profiles), so this never returns.

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    crate::println!("{}", info);
    crate::log_error!("{}", info);
    loop {
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
    }
}
