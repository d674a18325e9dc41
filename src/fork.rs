//! `fork()` and `clone()`: the two ways a new thread of execution comes
//! into being. Both use the two-return `read_eip` trick in
//! `scheduler::context` to make a single call site return twice — once
//! in the parent (with the child's pid) and once in the child (as if
//! it had called `fork`/`clone` itself and gotten 0 back). See spec
//! §4.6.

use crate::memory::paging::IdentityMappedMemory;
use crate::memory::{frame::FRAME_BITMAP, heap, with_kernel_directory};
use crate::process::{Pid, KERNEL_STACK_SIZE};
use crate::scheduler::context::{read_eip, TASK_MAGIC};

/// Relocate the saved syscall-register frame by the same byte offset
/// in the copied stack, so it still points at the right spot once the
/// child's stack lives at a different address than the parent's.
fn copy_kernel_stack(
    parent_stack: &[u8; KERNEL_STACK_SIZE],
    child_stack: &mut [u8; KERNEL_STACK_SIZE],
) {
    child_stack.copy_from_slice(parent_stack);
}

/// `fork()`: duplicate the calling process's address space and kernel
/// stack into a brand-new process. Returns the child's pid to the
/// parent and `0` to the child, exactly like the Unix syscall.
///
/// # Safety
/// Must be called with interrupts masked and on the calling process's
/// own kernel stack; relies on `read_eip` and stack-pointer arithmetic
/// that assumes the caller's stack frame is undisturbed until the
/// second "return".
pub unsafe fn fork() -> Pid {
    let guard = TASK_MAGIC;
    let parent_pid = crate::scheduler::current_pid();

    let child_pid = crate::scheduler::with_process_table(|table| {
        let parent_directory = table
            .process_from_pid(parent_pid)
            .expect("fork: no current process")
            .page_directory
            .clone();

        let mut new_directory_phys = 0u32;
        heap::kmalloc_real(4096, true, Some(&mut new_directory_phys));
        let new_directory = with_kernel_directory(|kernel| {
            let mut frames = FRAME_BITMAP.lock();
            let mut mem = IdentityMappedMemory;
            parent_directory
                .lock()
                .clone_directory(kernel, &mut frames, &mut mem, new_directory_phys)
        });

        table.fork_process(parent_pid, new_directory)
    });

    let eip = read_eip();
    if crate::scheduler::current_pid() == parent_pid {
        assert_eq!(guard, TASK_MAGIC, "fork: parent stack corrupted");

        let esp: u32;
        let ebp: u32;
        core::arch::asm!("mov {0}, esp", out(reg) esp, options(nostack, preserves_flags));
        core::arch::asm!("mov {0}, ebp", out(reg) ebp, options(nostack, preserves_flags));

        crate::scheduler::with_process_table(|table| {
            let parent_stack_top = table.process_from_pid_ref(parent_pid).unwrap().image.stack;
            let parent_stack = table.process_from_pid_ref(parent_pid).unwrap().kernel_stack.clone();
            let offset = table.process_from_pid_ref(parent_pid).unwrap().syscall_registers_offset;
            let child_stack_top = table.process_from_pid_ref(child_pid).unwrap().image.stack;

            let (new_esp, new_ebp) = if parent_stack_top > child_stack_top {
                let delta = parent_stack_top - child_stack_top;
                (esp.wrapping_sub(delta), ebp.wrapping_sub(delta))
            } else {
                let delta = child_stack_top - parent_stack_top;
                (esp.wrapping_add(delta), ebp.wrapping_sub(delta))
            };

            if let Some(child) = table.process_from_pid(child_pid) {
                copy_kernel_stack(&parent_stack, &mut child.kernel_stack);
                child.syscall_registers_offset = offset;
                child.thread.esp = new_esp;
                child.thread.ebp = new_ebp;
                child.thread.eip = eip;
                child.started = true;
            }
        });

        crate::scheduler::enqueue_ready(child_pid);
        child_pid
    } else {
        assert_eq!(guard, TASK_MAGIC, "fork: child stack corrupted");
        0
    }
}

/// `clone()`: spawn a new thread in the *same* address space, running
/// `entry(arg)` on `new_stack`. The new thread shares the parent's page
/// directory (reference-counted, not copied) and file descriptor table.
///
/// # Safety
/// Same caller requirements as `fork`; additionally `new_stack` must
/// point at the top of a valid, otherwise-unused stack region the new
/// thread is free to write into immediately.
pub unsafe fn clone(new_stack: u32, entry: u32, arg: u32) -> Pid {
    let guard = TASK_MAGIC;
    let parent_pid = crate::scheduler::current_pid();

    let child_pid = crate::scheduler::with_process_table(|table| {
        let parent = table.process_from_pid(parent_pid).unwrap();
        let directory = parent.page_directory.clone();
        let fds = parent.fds.clone();
        directory.lock().increment_ref_count();
        table.clone_thread(parent_pid, directory, fds)
    });

    let eip = read_eip();
    if crate::scheduler::current_pid() == parent_pid {
        assert_eq!(guard, TASK_MAGIC, "clone: parent stack corrupted");

        let mut stack = new_stack;
        // Push `arg`, then a bogus return address the thread "returns"
        // into when its entry function finishes — `THREAD_RETURN`
        // faults immediately and the fault handler tears the thread
        // down, matching the original kernel's `clone` stack setup.
        stack -= 4;
        let arg_slot = stack as *mut u32;
        stack -= 4;
        let ret_slot = stack as *mut u32;
        core::ptr::write(arg_slot, arg);
        core::ptr::write(ret_slot, crate::memory::paging::THREAD_RETURN);

        crate::scheduler::with_process_table(|table| {
            if let Some(child) = table.process_from_pid(child_pid) {
                child.thread.esp = stack;
                child.thread.ebp = new_stack;
                child.thread.eip = eip;
                child.image.entry = entry;
                child.started = true;
            }
        });

        crate::scheduler::enqueue_ready(child_pid);
        child_pid
    } else {
        assert_eq!(guard, TASK_MAGIC, "clone: child stack corrupted");
        0
    }
}
