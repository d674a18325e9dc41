//! Physical frame bitmap: one bit per 4 KiB physical page frame, bit set
//! iff the frame is in use. See spec §4.1.

use lazy_static::lazy_static;
use spin::Mutex;

use super::paging::PageTableEntry;
use super::{FRAME_SIZE, MAX_FRAMES};

const BITMAP_WORDS: usize = MAX_FRAMES / 32;

/// Bitmap over physical frames. Backed by a fixed-size static array sized
/// for the largest physical address space this 32-bit kernel supports
/// (4 GiB); `nframes` narrows the usable range down to what the boot
/// memory map actually reported.
pub struct FrameBitmap {
    words: [u32; BITMAP_WORDS],
    nframes: usize,
}

lazy_static! {
    pub static ref FRAME_BITMAP: Mutex<FrameBitmap> = Mutex::new(FrameBitmap::new());
}

impl FrameBitmap {
    pub(crate) const fn new() -> Self {
        FrameBitmap {
            words: [0; BITMAP_WORDS],
            nframes: 0,
        }
    }

    /// Set the number of frames this bitmap tracks. Called once at boot
    /// after the Multiboot2 memory map has been parsed.
    pub fn init(&mut self, nframes: usize) {
        self.nframes = nframes.min(MAX_FRAMES);
    }

    #[inline]
    fn index_bit(frame: u32) -> (usize, u32) {
        ((frame / 32) as usize, frame % 32)
    }

    /// Mark the frame containing `addr` as in use.
    pub fn set(&mut self, addr: u32) {
        let frame = addr / FRAME_SIZE;
        let (word, bit) = Self::index_bit(frame);
        self.words[word] |= 1 << bit;
    }

    /// Mark the frame containing `addr` as free.
    pub fn clear(&mut self, addr: u32) {
        let frame = addr / FRAME_SIZE;
        let (word, bit) = Self::index_bit(frame);
        self.words[word] &= !(1 << bit);
    }

    /// Test whether the frame containing `addr` is in use.
    pub fn test(&self, addr: u32) -> bool {
        let frame = addr / FRAME_SIZE;
        let (word, bit) = Self::index_bit(frame);
        self.words[word] & (1 << bit) != 0
    }

    /// Scan for the lowest-addressed free frame: word-at-a-time, skipping
    /// saturated (`0xFFFF_FFFF`) words, then bit-at-a-time LSB-first
    /// within the first non-saturated word.
    pub fn first_free(&self) -> Option<u32> {
        let last_word = self.nframes / 32;
        for (i, word) in self.words.iter().enumerate().take(last_word + 1) {
            if *word == 0xFFFF_FFFF {
                continue;
            }
            for bit in 0..32 {
                let frame = (i * 32) as u32 + bit;
                if frame as usize >= self.nframes {
                    return None;
                }
                if word & (1 << bit) == 0 {
                    return Some(frame);
                }
            }
        }
        None
    }

    /// Reserve the lowest free frame into `pte`, asserting the given
    /// access flags. A no-op on an already-populated entry besides
    /// re-asserting the flags — matches spec §4.1.
    pub fn alloc(&mut self, pte: &mut PageTableEntry, kernel: bool, writable: bool) {
        if pte.frame() != 0 {
            pte.set_present(true);
            pte.set_rw(writable);
            pte.set_user(!kernel);
            return;
        }
        let frame = self
            .first_free()
            .unwrap_or_else(|| panic!("out of physical memory: frame allocator exhausted"));
        self.set(frame * FRAME_SIZE);
        pte.set_frame(frame);
        pte.set_present(true);
        pte.set_rw(writable);
        pte.set_user(!kernel);
    }

    /// Directly map a known physical address into `pte` (DMA / MMIO
    /// regions that must live at a fixed frame rather than whatever the
    /// allocator would pick).
    pub fn dma(&mut self, pte: &mut PageTableEntry, kernel: bool, writable: bool, phys_addr: u32) {
        let frame = phys_addr / FRAME_SIZE;
        self.set(phys_addr);
        pte.set_frame(frame);
        pte.set_present(true);
        pte.set_rw(writable);
        pte.set_user(!kernel);
    }

    /// Release the frame referenced by `pte` and clear the entry.
    pub fn free(&mut self, pte: &mut PageTableEntry) {
        let frame = pte.frame();
        assert!(self.test(frame * FRAME_SIZE), "double free of frame {frame}");
        self.clear(frame * FRAME_SIZE);
        pte.set_frame(0);
        pte.set_present(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(nframes: usize) -> FrameBitmap {
        let mut b = FrameBitmap::new();
        b.init(nframes);
        b
    }

    #[test]
    fn first_free_is_zero_on_empty_bitmap() {
        let b = bitmap(64);
        assert_eq!(b.first_free(), Some(0));
    }

    #[test]
    fn set_clear_test_round_trip() {
        let mut b = bitmap(64);
        b.set(3 * FRAME_SIZE);
        assert!(b.test(3 * FRAME_SIZE));
        b.clear(3 * FRAME_SIZE);
        assert!(!b.test(3 * FRAME_SIZE));
    }

    #[test]
    fn first_free_skips_saturated_words_and_breaks_ties_by_address() {
        let mut b = bitmap(96);
        for frame in 0..32 {
            b.set(frame * FRAME_SIZE);
        }
        // word 0 is fully saturated; the next free frame is 32, not some
        // higher index within word 0.
        assert_eq!(b.first_free(), Some(32));
        b.set(32 * FRAME_SIZE);
        assert_eq!(b.first_free(), Some(33));
    }

    #[test]
    fn alloc_on_populated_entry_is_a_no_op_reassert() {
        let mut b = bitmap(64);
        let mut pte = PageTableEntry::default();
        b.alloc(&mut pte, false, true);
        let frame = pte.frame();
        assert!(b.test(frame * FRAME_SIZE));

        // Re-alloc with different flags must not pick a new frame, only
        // flip the access bits.
        b.alloc(&mut pte, true, false);
        assert_eq!(pte.frame(), frame);
        assert!(!pte.rw());
        assert!(!pte.user());
    }

    #[test]
    fn alloc_then_free_restores_bitmap() {
        let mut b = bitmap(64);
        let mut pte = PageTableEntry::default();
        b.alloc(&mut pte, false, true);
        let frame = pte.frame();
        assert!(b.test(frame * FRAME_SIZE));
        b.free(&mut pte);
        assert!(!b.test(frame * FRAME_SIZE));
        assert_eq!(pte.frame(), 0);
        assert!(!pte.present());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_asserts() {
        let mut b = bitmap(64);
        let mut pte = PageTableEntry::default();
        b.alloc(&mut pte, false, true);
        b.free(&mut pte);
        b.free(&mut pte);
    }
}
