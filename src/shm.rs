//! Shared-memory mapping bookkeeping. The chunk allocator and actual
//! region backing are owned by the (out-of-scope) shared-memory
//! subsystem; this module only owns the per-process token list that
//! `fork`/`exit` need to walk to release what a process is still
//! attached to.

use alloc::vec::Vec;

/// Opaque handle to one shared-memory mapping a process has attached.
/// What region it names, and how it's backed, belongs to the shared-
/// memory subsystem; the process table only needs to know how many a
/// process holds and to hand them back on exit.
#[derive(Clone, Copy)]
pub struct MappingToken {
    pub id: u32,
    pub base: u32,
}

/// Detach every mapping in `mappings`, per spec §6's "chunk of memory
/// two-plus processes can map into their own address space; acquire/
/// release reference-counted" interface. The actual detach call lives
/// on the shared-memory subsystem's boundary; this just walks the list
/// a process owns and clears it.
pub fn release_all(mappings: &mut Vec<MappingToken>) {
    for token in mappings.drain(..) {
        detach(token);
    }
}

/// Detach a single token. Out of scope here: the real implementation
/// decrements the region's reference count and unmaps the directory
/// slot backing it.
fn detach(_token: MappingToken) {}
