//! Function-descriptor manager for FDPIC targets.
//!
//! A function pointer on FDPIC is a two-word `{entry, got}` descriptor, not
//! an address. Descriptors handed out to user code must stay valid for as
//! long as the owning object is loaded, so each object owns an arena of
//! descriptor pages that is unmapped with the object.

use eyre::Result;

use crate::elf::ElfPtrSize;
use crate::error::LoadError;
use crate::sys::mem::{MapRequest, MemorySystem, PROT_READ, PROT_WRITE};
use crate::util::round_up;

pub const PTR_SIZE: ElfPtrSize = std::mem::size_of::<ElfPtrSize>() as ElfPtrSize;
pub const DESC_SIZE: ElfPtrSize = 2 * PTR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncDesc {
    pub entry: ElfPtrSize,
    pub got: ElfPtrSize,
}

impl FuncDesc {
    /// Writes the descriptor into target memory at `addr`, GOT word first.
    /// A concurrent reader that observes the new entry word is then
    /// guaranteed to observe the matching GOT word as well.
    pub fn store<M: MemorySystem>(&self, mem: &M, addr: ElfPtrSize) -> Result<()> {
        mem.write_ptr(addr + PTR_SIZE, self.got)?;
        mem.write_ptr(addr, self.entry)
    }

    pub fn load<M: MemorySystem>(mem: &M, addr: ElfPtrSize) -> Result<Self> {
        Ok(FuncDesc {
            entry: mem.read_ptr(addr)?,
            got: mem.read_ptr(addr + PTR_SIZE)?,
        })
    }
}

/// Per-object descriptor storage.
///
/// Two allocation paths feed it: an array preallocated to the exact number
/// of FUNCDESC relocations the object emits, consumed in relocation order,
/// and a lazy list for descriptors materialised at run time (address-of, or
/// a debugger asking for one). Both live in arena pages owned by the object.
#[derive(Debug, Default)]
pub struct DescriptorTable {
    /// Arena pages, `(addr, len)`.
    pages: Vec<(ElfPtrSize, ElfPtrSize)>,
    /// Bump cursor into the last page: `(next_addr, remaining)`.
    cursor: Option<(ElfPtrSize, ElfPtrSize)>,
    prealloc_next: ElfPtrSize,
    prealloc_remaining: usize,
    /// Lazily allocated descriptor addresses, owner-rooted.
    lazy: Vec<ElfPtrSize>,
}

impl DescriptorTable {
    /// Sizes the preallocated array to `count` descriptors.
    pub fn preallocate<M: MemorySystem>(&mut self, mem: &M, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let base = self.carve(mem, count as ElfPtrSize * DESC_SIZE)?;
        self.prealloc_next = base;
        self.prealloc_remaining = count;
        Ok(())
    }

    /// Takes the next slot of the preallocated array.
    pub fn alloc_prealloc<M: MemorySystem>(
        &mut self,
        mem: &M,
        desc: FuncDesc,
    ) -> Result<ElfPtrSize> {
        if self.prealloc_remaining == 0 {
            return Err(LoadError::OutOfMemory {
                context: "function descriptor array".into(),
            }
            .into());
        }
        let addr = self.prealloc_next;
        self.prealloc_next += DESC_SIZE;
        self.prealloc_remaining -= 1;
        desc.store(mem, addr)?;
        Ok(addr)
    }

    /// Allocates a single descriptor outside the preallocated array.
    pub fn alloc_lazy<M: MemorySystem>(&mut self, mem: &M, desc: FuncDesc) -> Result<ElfPtrSize> {
        let addr = self.carve(mem, DESC_SIZE)?;
        desc.store(mem, addr)?;
        self.lazy.push(addr);
        Ok(addr)
    }

    pub fn lazy_descriptors(&self) -> &[ElfPtrSize] {
        &self.lazy
    }

    /// Releases every arena page. Called only when the owning object is
    /// destroyed; any descriptor handed out becomes invalid with it.
    pub fn free<M: MemorySystem>(&mut self, mem: &M) {
        for (addr, len) in self.pages.drain(..) {
            let _ = mem.unmap(addr, len);
        }
        self.cursor = None;
        self.prealloc_remaining = 0;
        self.lazy.clear();
    }

    fn carve<M: MemorySystem>(&mut self, mem: &M, size: ElfPtrSize) -> Result<ElfPtrSize> {
        if let Some((next, remaining)) = self.cursor {
            if remaining >= size {
                self.cursor = Some((next + size, remaining - size));
                return Ok(next);
            }
        }
        let len = round_up(size, mem.page_size());
        let addr = mem
            .map(MapRequest::anonymous(len, PROT_READ | PROT_WRITE))
            .map_err(|_| LoadError::OutOfMemory {
                context: "function descriptor arena".into(),
            })?;
        self.pages.push((addr, len));
        self.cursor = Some((addr + size, len - size));
        Ok(addr)
    }
}
