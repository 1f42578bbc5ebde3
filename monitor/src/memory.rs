use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use usize_conversions::usize_from;
use x86_64::structures::paging::PageTableFlags as Flags;

pub const PAGE_SIZE: u64 = 4096;

/// Marks a mapping as the owner of its frame. Aliases created by the gate-A20
/// wraparound carry the same frame with this bit cleared, so teardown and
/// remapping account for each frame exactly once.
const FRAME_OWNED: Flags = Flags::BIT_9;

/// End of conventional guest memory.
const LOW_MEMORY_END: u64 = 0xA_0000;
/// The adapter/BIOS window 0xA0000..0x100000 is mapped read-only; guests
/// probe it freely and must not be able to scribble on it.
const ROM_WINDOW_END: u64 = 0x10_0000;
/// One real-mode segment above 1 MiB is reachable with gate A20 open
/// (0xFFFF:0xFFFF = 0x10FFEF); the address space always covers it.
const WRAP_WINDOW_END: u64 = 0x11_0000;
const WRAP_PAGES: usize = 16;

/// Computes the guest-physical address of a real-mode `seg:off` pair.
pub fn linear(seg: u16, off: u32) -> u64 {
    (u64::from(seg) << 4) + u64::from(off)
}

#[derive(Debug, Clone, Copy)]
struct PageEntry {
    frame: Option<usize>,
    flags: Flags,
}

impl PageEntry {
    const fn absent() -> Self {
        Self {
            frame: None,
            flags: Flags::empty(),
        }
    }

    fn present(&self) -> bool {
        self.flags.contains(Flags::PRESENT)
    }
}

/// The paged physical memory of one guest.
///
/// Pages below 1 MiB are populated eagerly (conventional memory writable,
/// the adapter window read-only); extended memory appears on first touch as
/// zeroed frames. The gate-A20 state decides whether the sixteen pages above
/// 1 MiB alias the bottom of memory or stand on their own.
pub struct GuestAddressSpace {
    pages: Vec<PageEntry>,
    frames: Vec<Box<[u8]>>,
    a20_enabled: bool,
    saved_wrap: Option<[PageEntry; WRAP_PAGES]>,
}

impl GuestAddressSpace {
    pub fn new(memory_kib: u32) -> Self {
        let bytes = core::cmp::max(u64::from(memory_kib) * 1024, WRAP_WINDOW_END);
        let page_count = usize_from(bytes.div_ceil(PAGE_SIZE));
        let mut space = Self {
            pages: vec![PageEntry::absent(); page_count],
            frames: Vec::new(),
            a20_enabled: true,
            saved_wrap: None,
        };

        for page in 0..usize_from(ROM_WINDOW_END / PAGE_SIZE) {
            let mut flags = Flags::PRESENT | Flags::USER_ACCESSIBLE | FRAME_OWNED;
            if (page as u64) * PAGE_SIZE < LOW_MEMORY_END {
                flags |= Flags::WRITABLE;
            }
            let frame = space.alloc_frame();
            space.pages[page] = PageEntry {
                frame: Some(frame),
                flags,
            };
        }

        space
    }

    fn alloc_frame(&mut self) -> usize {
        self.frames.push(vec![0u8; usize_from(PAGE_SIZE)].into_boxed_slice());
        self.frames.len() - 1
    }

    pub fn a20_enabled(&self) -> bool {
        self.a20_enabled
    }

    /// Opens or closes the A20 gate.
    ///
    /// Closing saves the sixteen page entries above 1 MiB and aliases them
    /// onto the bottom sixteen, without the ownership bit; opening restores
    /// the saved entries.
    pub fn set_a20(&mut self, enabled: bool) {
        if enabled == self.a20_enabled {
            return;
        }
        if enabled {
            if let Some(saved) = self.saved_wrap.take() {
                let base = usize_from(ROM_WINDOW_END / PAGE_SIZE);
                self.pages[base..base + WRAP_PAGES].copy_from_slice(&saved);
            }
        } else {
            let base = usize_from(ROM_WINDOW_END / PAGE_SIZE);
            let mut saved = [PageEntry::absent(); WRAP_PAGES];
            saved.copy_from_slice(&self.pages[base..base + WRAP_PAGES]);
            self.saved_wrap = Some(saved);
            for i in 0..WRAP_PAGES {
                self.pages[base + i] = PageEntry {
                    frame: self.pages[i].frame,
                    flags: self.pages[i].flags - FRAME_OWNED,
                };
            }
        }
        self.a20_enabled = enabled;
    }

    fn page_of(addr: u64) -> usize {
        usize_from(addr / PAGE_SIZE)
    }

    /// Maps a zeroed frame at the page containing `addr` if nothing is
    /// mapped there yet. Returns whether the page is mapped afterwards.
    pub fn demand_map(&mut self, addr: u64) -> bool {
        let page = Self::page_of(addr);
        if page >= self.pages.len() {
            return false;
        }
        if self.pages[page].present() {
            return true;
        }

        let wrap_base = usize_from(ROM_WINDOW_END / PAGE_SIZE);
        if !self.a20_enabled && (wrap_base..wrap_base + WRAP_PAGES).contains(&page) {
            // With the gate closed the wrap window shadows low memory.
            let low = page - wrap_base;
            self.pages[page] = PageEntry {
                frame: self.pages[low].frame,
                flags: self.pages[low].flags - FRAME_OWNED,
            };
            return self.pages[page].present();
        }

        let frame = self.alloc_frame();
        self.pages[page] = PageEntry {
            frame: Some(frame),
            flags: Flags::PRESENT | Flags::WRITABLE | Flags::USER_ACCESSIBLE | FRAME_OWNED,
        };
        if !self.a20_enabled && page < WRAP_PAGES {
            // Keep the alias above 1 MiB in step with the new mapping.
            self.pages[wrap_base + page] = PageEntry {
                frame: Some(frame),
                flags: self.pages[page].flags - FRAME_OWNED,
            };
        }
        true
    }

    pub fn is_present(&self, addr: u64) -> bool {
        let page = Self::page_of(addr);
        page < self.pages.len() && self.pages[page].present()
    }

    pub fn is_writable(&self, addr: u64) -> bool {
        let page = Self::page_of(addr);
        page < self.pages.len() && self.pages[page].flags.contains(Flags::WRITABLE)
    }

    pub fn read_u8(&mut self, addr: u64) -> u8 {
        if !self.demand_map(addr) {
            return 0xFF;
        }
        let entry = self.pages[Self::page_of(addr)];
        let frame = entry.frame.expect("present page without frame");
        self.frames[frame][usize_from(addr % PAGE_SIZE)]
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) {
        if !self.demand_map(addr) {
            log::trace!("dropped write outside guest memory: {addr:#x}");
            return;
        }
        let entry = self.pages[Self::page_of(addr)];
        if !entry.flags.contains(Flags::WRITABLE) {
            log::trace!("dropped write to read-only guest page: {addr:#x}");
            return;
        }
        let frame = entry.frame.expect("present page without frame");
        self.frames[frame][usize_from(addr % PAGE_SIZE)] = value;
    }

    pub fn read_u16(&mut self, addr: u64) -> u16 {
        u16::from_le_bytes([self.read_u8(addr), self.read_u8(addr + 1)])
    }

    pub fn write_u16(&mut self, addr: u64, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.write_u8(addr, lo);
        self.write_u8(addr + 1, hi);
    }

    pub fn read_u32(&mut self, addr: u64) -> u32 {
        u32::from(self.read_u16(addr)) | u32::from(self.read_u16(addr + 2)) << 16
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write_u16(addr, value as u16);
        self.write_u16(addr + 2, (value >> 16) as u16);
    }

    pub fn read_bytes(&mut self, addr: u64, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.read_u8(addr + i as u64);
        }
    }

    /// Reads the real-mode interrupt vector table entry for `vector`,
    /// returning `(segment, offset)`.
    pub fn ivt_entry(&mut self, vector: u8) -> (u16, u16) {
        let base = u64::from(vector) * 4;
        let offset = self.read_u16(base);
        let segment = self.read_u16(base + 2);
        (segment, offset)
    }

    #[cfg(test)]
    fn owners_of_frame(&self, frame: usize) -> usize {
        self.pages
            .iter()
            .filter(|p| p.frame == Some(frame) && p.flags.contains(FRAME_OWNED))
            .count()
    }
}
