//! Saved thread state and the fork/clone suspension trick. See spec
//! §3 (`thread_t`) and §4.5/§4.6.
//!
//! `fork`/`clone` use the classic "two-return" trick: the parent calls
//! `read_eip()`, which on its *first* return gives the parent its own
//! `eip` to stash in the child's saved context. Control is later handed
//! to the child by loading that saved `esp`/`ebp`/`eip` triple and
//! `jmp`-ing to `eip` directly; from the child's point of view, this
//! looks exactly like `read_eip()` returning a *second* time (with the
//! resume sentinel already popped off the stack), so it falls through
//! the same `if` the parent took and returns from `fork` as the child.

/// A fixed guard value pushed below the saved register state and
/// checked after every context switch; a mismatch means something
/// walked off the end of a kernel stack.
pub const TASK_MAGIC: u32 = 0xDEADBEEF;

/// Stand-in `eip` the scheduler recognizes as "this thread has never
/// run yet; resume through the normal return path". See spec §4.5.
pub const RESUME_SENTINEL: u32 = 0x1_0000;

/// Saved 32-bit thread context: just enough to resume execution.
/// General-purpose registers aren't part of this — they're saved on
/// the kernel stack itself by the interrupt/syscall entry trampoline
/// and restored by the matching `iret`/`ret`; this only needs to carry
/// the values a context switch actually swaps.
#[derive(Clone, Copy, Default)]
pub struct Context {
    pub esp: u32,
    pub ebp: u32,
    pub eip: u32,
    /// Where the signal-handler preamble should resume if delivery is
    /// later reverted (see `signals::return_from_signal_handler`).
    pub return_eip: u32,
    pub fpu: FpuState,
}

/// Opaque 512-byte FXSAVE region, lazily saved/restored only for
/// threads that actually touch the FPU/SSE registers.
#[derive(Clone, Copy)]
pub struct FpuState {
    pub region: [u8; 512],
    pub used: bool,
}

impl Default for FpuState {
    fn default() -> Self {
        FpuState {
            region: [0u8; 512],
            used: false,
        }
    }
}

/// Save the current FXSAVE area into `state`.
///
/// # Safety
/// Caller must ensure SSE/FPU support was detected at boot.
pub unsafe fn fpu_save(state: &mut FpuState) {
    core::arch::asm!(
        "fxsave [{ptr}]",
        ptr = in(reg) state.region.as_mut_ptr(),
        options(nostack),
    );
    state.used = true;
}

/// Restore a previously-saved FXSAVE area.
///
/// # Safety
/// `state` must have been populated by a prior `fpu_save` on the same
/// CPU.
pub unsafe fn fpu_restore(state: &FpuState) {
    if !state.used {
        return;
    }
    core::arch::asm!(
        "fxrstor [{ptr}]",
        ptr = in(reg) state.region.as_ptr(),
        options(nostack),
    );
}

/// Read the caller's own instruction pointer. Returns once normally on
/// the call that invoked it; a saved context built from that same
/// `eip`/`esp`/`ebp` triple, resumed later by `context_switch`, makes it
/// "return" a second time straight into the caller's continuation,
/// without ever calling this function again.
#[inline(never)]
#[no_mangle]
pub extern "C" fn read_eip() -> u32 {
    let eip: u32;
    unsafe {
        core::arch::asm!(
            "mov {0}, [esp]",
            out(reg) eip,
            options(nostack, pure, readonly),
        );
    }
    eip
}

/// Switch the CPU's stack/frame pointers onto `next`'s, then jump to
/// its saved `eip`. Never returns to the caller in the conventional
/// sense — control resumes wherever `next.eip` points, which for a
/// freshly-forked child is the line right after its `read_eip()` call.
///
/// # Safety
/// `next` must be a context previously saved by this same mechanism (or
/// synthesized by `fork`/`clone` to look like one); `esp`/`ebp` must
/// point into a live, correctly laid-out kernel stack.
#[inline(never)]
pub unsafe fn context_switch(next: &Context) {
    // `eip`'s target is pinned to a register other than `eax` so the
    // `mov eax, {sentinel}` right before the jump can't clobber it.
    core::arch::asm!(
        "mov esp, ecx",
        "mov ebp, edx",
        "mov eax, {sentinel}",
        "jmp ebx",
        in("ecx") next.esp,
        in("edx") next.ebp,
        in("ebx") next.eip,
        sentinel = const RESUME_SENTINEL,
        options(noreturn),
    );
}
