//! Kernel memory interface.
//!
//! Everything the loader does to an address space goes through
//! [`MemorySystem`]: reserving and mapping segments, carving BSS, patching
//! relocation slots, and invoking ifunc resolvers. The production
//! implementation is a thin wrapper over `mmap`/`munmap`/`mprotect`; tests
//! substitute an in-memory fake so the whole loader runs against a synthetic
//! address space.

use eyre::Result;

use crate::elf::ElfPtrSize;
use crate::source::ImageSource;

pub use libc::{PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE};

/// What backs a mapping.
pub enum Backing<'a> {
    Anonymous,
    /// File or physical image bytes starting at `offset`.
    Image { source: &'a ImageSource, offset: u64 },
}

pub struct MapRequest<'a> {
    /// `Some` requests fixed placement (the caller owns that range).
    pub fixed_addr: Option<ElfPtrSize>,
    pub len: ElfPtrSize,
    pub prot: i32,
    pub backing: Backing<'a>,
}

impl<'a> MapRequest<'a> {
    pub fn anonymous(len: ElfPtrSize, prot: i32) -> Self {
        MapRequest {
            fixed_addr: None,
            len,
            prot,
            backing: Backing::Anonymous,
        }
    }

    pub fn image(source: &'a ImageSource, offset: u64, len: ElfPtrSize, prot: i32) -> Self {
        MapRequest {
            fixed_addr: None,
            len,
            prot,
            backing: Backing::Image { source, offset },
        }
    }

    pub fn at(mut self, addr: ElfPtrSize) -> Self {
        self.fixed_addr = Some(addr);
        self
    }
}

/// Converts PT_LOAD `p_flags` into mapping protection bits.
pub fn prot_from_flags(p_flags: u32) -> i32 {
    use crate::elf::program_header::{PF_R, PF_W, PF_X};

    let mut prot = PROT_NONE;
    if p_flags & PF_R != 0 {
        prot |= PROT_READ;
    }
    if p_flags & PF_W != 0 {
        prot |= PROT_WRITE;
    }
    if p_flags & PF_X != 0 {
        prot |= PROT_EXEC;
    }
    prot
}

pub trait MemorySystem: Send + Sync {
    fn page_size(&self) -> ElfPtrSize;

    /// False on NOMMU targets, where fixed placement and private file views
    /// are unavailable and mappings land wherever the kernel puts them.
    fn has_mmu(&self) -> bool;

    /// Whether anonymous pages are guaranteed zero-filled. Platforms where
    /// they are not get their BSS cleared explicitly.
    fn anonymous_zeroed(&self) -> bool;

    fn map(&self, req: MapRequest<'_>) -> Result<ElfPtrSize>;

    fn unmap(&self, addr: ElfPtrSize, len: ElfPtrSize) -> Result<()>;

    fn protect(&self, addr: ElfPtrSize, len: ElfPtrSize, prot: i32) -> Result<()>;

    fn read(&self, addr: ElfPtrSize, buf: &mut [u8]) -> Result<()>;

    fn write(&self, addr: ElfPtrSize, buf: &[u8]) -> Result<()>;

    /// Pointer-sized store; atomic with release ordering when the slot is
    /// naturally aligned. Relocation slots may be misaligned, in which case
    /// the store degrades to a byte copy.
    fn write_ptr(&self, addr: ElfPtrSize, value: ElfPtrSize) -> Result<()> {
        self.write(addr, &value.to_ne_bytes())
    }

    fn read_ptr(&self, addr: ElfPtrSize) -> Result<ElfPtrSize> {
        let mut buf = [0u8; std::mem::size_of::<ElfPtrSize>()];
        self.read(addr, &mut buf)?;
        Ok(ElfPtrSize::from_ne_bytes(buf))
    }

    /// Invokes the ifunc resolver stored at `entry` and returns the real
    /// target it selects.
    fn resolve_ifunc(&self, entry: ElfPtrSize) -> Result<ElfPtrSize>;

    /// Data barrier issued after rewriting a call site, so instruction
    /// fetch on weakly-ordered ISAs observes the new slot value.
    fn code_barrier(&self);
}

#[cfg(unix)]
pub use self::unix::MmapSystem;

#[cfg(unix)]
mod unix {
    use std::num::NonZeroUsize;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{fence, AtomicUsize, Ordering};

    use eyre::{eyre, Result, WrapErr};
    use nix::sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags};
    use once_cell::sync::Lazy;

    use super::{Backing, MapRequest, MemorySystem};
    use crate::elf::ElfPtrSize;
    use crate::source::ImageSource;

    static PAGE_SIZE: Lazy<ElfPtrSize> =
        Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as ElfPtrSize);

    /// Production memory interface for hosts with an MMU.
    #[derive(Default)]
    pub struct MmapSystem;

    impl MemorySystem for MmapSystem {
        fn page_size(&self) -> ElfPtrSize {
            *PAGE_SIZE
        }

        fn has_mmu(&self) -> bool {
            true
        }

        fn anonymous_zeroed(&self) -> bool {
            true
        }

        fn map(&self, req: MapRequest<'_>) -> Result<ElfPtrSize> {
            let mut flags = MapFlags::MAP_PRIVATE;
            if req.fixed_addr.is_some() {
                flags |= MapFlags::MAP_FIXED;
            }
            let (fd, offset) = match req.backing {
                Backing::Anonymous => {
                    flags |= MapFlags::MAP_ANONYMOUS;
                    (-1, 0)
                }
                Backing::Image {
                    source: ImageSource::File { file, .. },
                    offset,
                } => (file.as_raw_fd(), offset as libc::off_t),
                Backing::Image { source, .. } => {
                    // Physical-memory images exist only on targets whose
                    // kernel exposes them; this host has no such mapping.
                    return Err(eyre!(
                        "{}: physical-memory mappings are not supported here",
                        source.identity()
                    ));
                }
            };

            let addr = unsafe {
                mmap(
                    req.fixed_addr
                        .and_then(|a| NonZeroUsize::new(a as usize)),
                    NonZeroUsize::new(req.len as usize)
                        .ok_or_else(|| eyre!("cannot map an empty range"))?,
                    ProtFlags::from_bits_truncate(req.prot),
                    flags,
                    fd,
                    offset,
                )
            }
            .wrap_err("mmap failed")?;
            Ok(addr as usize as ElfPtrSize)
        }

        fn unmap(&self, addr: ElfPtrSize, len: ElfPtrSize) -> Result<()> {
            unsafe { munmap(addr as usize as *mut _, len as usize) }.wrap_err("munmap failed")
        }

        fn protect(&self, addr: ElfPtrSize, len: ElfPtrSize, prot: i32) -> Result<()> {
            unsafe {
                mprotect(
                    addr as usize as *mut _,
                    len as usize,
                    ProtFlags::from_bits_truncate(prot),
                )
            }
            .wrap_err("mprotect failed")
        }

        fn read(&self, addr: ElfPtrSize, buf: &mut [u8]) -> Result<()> {
            unsafe {
                std::ptr::copy_nonoverlapping(addr as usize as *const u8, buf.as_mut_ptr(), buf.len())
            };
            Ok(())
        }

        fn write(&self, addr: ElfPtrSize, buf: &[u8]) -> Result<()> {
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), addr as usize as *mut u8, buf.len())
            };
            Ok(())
        }

        fn write_ptr(&self, addr: ElfPtrSize, value: ElfPtrSize) -> Result<()> {
            if addr as usize % std::mem::size_of::<usize>() == 0 {
                // SAFETY: the slot is naturally aligned and owned by a
                // mapped segment of the object being relocated.
                let slot = unsafe { &*(addr as usize as *const AtomicUsize) };
                slot.store(value as usize, Ordering::Release);
                Ok(())
            } else {
                self.write(addr, &value.to_ne_bytes())
            }
        }

        fn resolve_ifunc(&self, entry: ElfPtrSize) -> Result<ElfPtrSize> {
            // SAFETY: `entry` is the relocated address of an STT_GNU_IFUNC
            // resolver inside a mapped, executable segment.
            let resolver: extern "C" fn() -> usize =
                unsafe { std::mem::transmute(entry as usize) };
            Ok(resolver() as ElfPtrSize)
        }

        fn code_barrier(&self) {
            fence(Ordering::SeqCst);
        }
    }
}
