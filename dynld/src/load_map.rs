//! The load map: where each PT_LOAD segment ended up at runtime.
//!
//! On MMU targets every segment shares one base displacement; on FDPIC each
//! segment may land anywhere, so virtual-to-runtime translation is a
//! piecewise lookup over the (vaddr-sorted) segment list.

use crate::elf::{ElfPtrSize, EA_UNDEF};
use crate::sys::mem::MemorySystem;
use crate::util::{round_down, round_up};

#[derive(Debug, Clone)]
pub struct Segment {
    pub runtime_addr: ElfPtrSize,
    pub vaddr: ElfPtrSize,
    pub memsz: ElfPtrSize,
    pub prot: i32,
    /// PT_LOAD `p_flags`.
    pub flags: u32,
    /// Mapped from shared physical memory on a NOMMU target; unmapping it
    /// would corrupt the system-wide mapping, so destruction skips it.
    pub unmappable: bool,
}

impl Segment {
    pub fn contains(&self, vaddr: ElfPtrSize) -> bool {
        self.vaddr <= vaddr && vaddr < self.vaddr + self.memsz
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadMap {
    /// Sorted by ascending virtual address.
    pub segments: Vec<Segment>,
}

impl LoadMap {
    /// Translates a link-time virtual address to its runtime address.
    ///
    /// Falls back to the last segment when no segment covers the address: a
    /// register-relative symbol (e.g. the RISC-V `gp` anchor at
    /// `.data + 0x800`) may legitimately sit just beyond the data memsz.
    pub fn relocate(&self, vaddr: ElfPtrSize) -> ElfPtrSize {
        if vaddr == EA_UNDEF {
            return 0;
        }
        let seg = self.segments[..self.segments.len() - 1]
            .iter()
            .find(|seg| seg.contains(vaddr))
            .unwrap_or_else(|| self.segments.last().expect("load map has segments"));
        vaddr.wrapping_sub(seg.vaddr).wrapping_add(seg.runtime_addr)
    }

    /// Base displacement of the segment covering `vaddr`.
    pub fn displacement(&self, vaddr: ElfPtrSize) -> ElfPtrSize {
        self.relocate(vaddr).wrapping_sub(vaddr)
    }

    /// Unmaps every segment, page-rounded, skipping the ones whose backing
    /// refuses unmapping. Failures are ignored: destruction must not stop
    /// halfway through the map.
    pub fn unmap<M: MemorySystem>(&self, mem: &M) {
        let page = mem.page_size();
        for seg in &self.segments {
            if seg.unmappable {
                continue;
            }
            let start = round_down(seg.runtime_addr, page);
            let end = round_up(seg.runtime_addr + seg.memsz, page);
            if end > start {
                let _ = mem.unmap(start, end - start);
            }
        }
    }
}
