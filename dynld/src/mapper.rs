//! Maps an ELF image into memory and produces an as-yet-unrelocated
//! [`Object`].
//!
//! Two placement strategies exist. With an MMU, one contiguous anonymous
//! region spanning the object's whole virtual extent is reserved (over-mapped
//! and trimmed when a segment demands more than page alignment), segments are
//! file-mapped over it with fixed placement, and the left-over reservation is
//! unmapped. On FDPIC/NOMMU each segment is mapped wherever the kernel puts
//! it and the per-segment addresses are recorded in the load map; writable
//! segments backed by a shared physical image are copied into fresh
//! anonymous memory.

use eyre::Result;
use log::debug;

use crate::config::{Abi, LinkerConfig};
use crate::elf::header::{Header, EI_CLASS, EI_DATA, EI_VERSION, ELFCLASS, ELFMAG, EV_CURRENT, SELFMAG, SIZEOF_EHDR};
use crate::elf::program_header::{
    ProgramHeader, PF_W, PT_DYNAMIC, PT_GNU_RELRO, PT_INTERP, PT_LOAD, PT_PHDR, PT_TLS,
    SIZEOF_PHDR,
};
use crate::elf::{ElfPtrSize, EA_UNDEF, ET_DYN, ET_EXEC, ELFDATA_HOST, PT_ARM_EXIDX};
use crate::error::LoadError;
use crate::load_map::{LoadMap, Segment};
use crate::object::{Object, TlsInfo};
use crate::source::ImageSource;
use crate::sys::mem::{prot_from_flags, MapRequest, MemorySystem, PROT_NONE, PROT_READ, PROT_WRITE};
use crate::util::{is_aligned, round_down, round_up};

/// Raw mappings made so far, unwound in reverse on failure.
struct MappedRegions<'m, M: MemorySystem> {
    mem: &'m M,
    regions: Vec<(ElfPtrSize, ElfPtrSize)>,
    armed: bool,
}

impl<'m, M: MemorySystem> MappedRegions<'m, M> {
    fn new(mem: &'m M) -> Self {
        MappedRegions {
            mem,
            regions: Vec::new(),
            armed: true,
        }
    }

    fn push(&mut self, addr: ElfPtrSize, len: ElfPtrSize) {
        self.regions.push((addr, len));
    }

    /// Records that `len` bytes at the start of the most recent region were
    /// trimmed off (alignment over-map).
    fn trim_front(&mut self, len: ElfPtrSize) {
        if let Some(last) = self.regions.last_mut() {
            last.0 += len;
            last.1 -= len;
        }
    }

    fn trim_back(&mut self, len: ElfPtrSize) {
        if let Some(last) = self.regions.last_mut() {
            last.1 -= len;
        }
    }

    /// The object now owns the mappings; nothing to unwind.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<'m, M: MemorySystem> Drop for MappedRegions<'m, M> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for &(addr, len) in self.regions.iter().rev() {
            if len != 0 {
                let _ = self.mem.unmap(addr, len);
            }
        }
    }
}

/// Maps `source` and returns the object, ready for dynamic digestion.
pub fn map_object<M: MemorySystem>(
    mem: &M,
    config: &LinkerConfig,
    source: &ImageSource,
) -> Result<Object> {
    let path = source.identity();
    let page = mem.page_size();

    if source.size() < SIZEOF_EHDR as u64 {
        return Err(LoadError::malformed(&path, "not ELF file (too short)").into());
    }

    // Map the first page to read the ELF header and program headers from.
    let first_page = mem
        .map(MapRequest::image(source, 0, page, PROT_READ))
        .map_err(|e| LoadError::malformed(&path, format!("read error: {:#}", e)))?;
    let mut first = vec![0u8; page as usize];
    let header = (|| -> Result<Header> {
        mem.read(first_page, &mut first)
            .map_err(|e| LoadError::malformed(&path, format!("read error: {:#}", e)))?;
        let mut ehdr_bytes = [0u8; SIZEOF_EHDR];
        ehdr_bytes.copy_from_slice(&first[..SIZEOF_EHDR]);
        Ok(*Header::from_bytes(&ehdr_bytes))
    })();
    let _ = mem.unmap(first_page, page);
    let header = header?;

    if &header.e_ident[..SELFMAG] != ELFMAG {
        return Err(LoadError::malformed(&path, "not ELF file (magic number bad)").into());
    }
    if header.e_ident[EI_CLASS] != ELFCLASS {
        return Err(LoadError::malformed(
            &path,
            format!(
                "invalid ELF class {:#x}; expected {:#x}",
                header.e_ident[EI_CLASS],
                ELFCLASS
            ),
        )
        .into());
    }
    if header.e_ident[EI_DATA] != ELFDATA_HOST
        || header.e_ident[EI_VERSION] != EV_CURRENT
        || header.e_version != EV_CURRENT as u32
    {
        return Err(LoadError::malformed(&path, "unsupported file version").into());
    }
    if header.e_type != ET_EXEC && header.e_type != ET_DYN {
        return Err(LoadError::malformed(&path, "unsupported file type").into());
    }
    let machine = config.machine_spec(header.e_machine).ok_or_else(|| {
        LoadError::malformed(&path, format!("unsupported machine {:#x}", header.e_machine))
    })?;

    if header.e_phentsize as usize != SIZEOF_PHDR {
        return Err(LoadError::malformed(&path, "unexpected program header entry size").into());
    }
    let phsize = header.e_phnum as usize * SIZEOF_PHDR;
    if header.e_phoff as usize + phsize > page as usize {
        return Err(
            LoadError::malformed(&path, "program headers not within the first page").into(),
        );
    }
    let phdrs = ProgramHeader::from_bytes(
        &first[header.e_phoff as usize..header.e_phoff as usize + phsize],
        header.e_phnum as usize,
    );

    let (dev, ino) = source.dev_ino();
    let mut obj = Object::new(path.clone(), dev, ino, machine.kind, machine.abi);
    obj.is_dynamic = header.e_type == ET_DYN;
    obj.phdrs = phdrs.clone();

    // Scan the program headers, saving virtual addresses to be translated
    // to runtime addresses once the load map exists.
    let mut loads: Vec<ProgramHeader> = Vec::new();
    let mut dynamic_vaddr = EA_UNDEF;
    let mut interp_vaddr = EA_UNDEF;
    let mut tls_phdr: Option<ProgramHeader> = None;
    let mut relro_vaddr = EA_UNDEF;
    let mut exidx_vaddr = EA_UNDEF;
    let mut phdr_vaddr = EA_UNDEF;
    let mut phdr_memsz: ElfPtrSize = 0;

    let contiguous = matches!(machine.abi, Abi::Direct);
    if contiguous && !mem.has_mmu() {
        return Err(LoadError::AddressSpace {
            path,
            reason: "direct-base objects need an MMU".into(),
        }
        .into());
    }

    for phdr in &phdrs {
        match phdr.p_type {
            PT_LOAD => {
                if contiguous && phdr.p_align != 0 && !is_aligned(phdr.p_align as ElfPtrSize, page)
                {
                    return Err(LoadError::malformed(
                        &path,
                        format!("PT_LOAD segment {} not page-aligned", loads.len()),
                    )
                    .into());
                }
                debug!("{}: PT_LOAD {:#x} memsz {:#x}", path, phdr.p_vaddr, phdr.p_memsz);
                loads.push(*phdr);
            }
            PT_INTERP => interp_vaddr = phdr.p_vaddr as ElfPtrSize,
            PT_PHDR => {
                phdr_vaddr = phdr.p_vaddr as ElfPtrSize;
                phdr_memsz = phdr.p_memsz as ElfPtrSize;
            }
            PT_DYNAMIC => {
                dynamic_vaddr = phdr.p_vaddr as ElfPtrSize;
                obj.dynamic_size = phdr.p_memsz as ElfPtrSize;
            }
            PT_TLS => tls_phdr = Some(*phdr),
            PT_GNU_RELRO => {
                relro_vaddr = phdr.p_vaddr as ElfPtrSize;
                obj.relro_size = phdr.p_memsz as ElfPtrSize;
            }
            PT_ARM_EXIDX => {
                exidx_vaddr = phdr.p_vaddr as ElfPtrSize;
                obj.exidx_size = phdr.p_memsz as ElfPtrSize;
            }
            _ => {}
        }
    }

    if dynamic_vaddr == EA_UNDEF {
        return Err(LoadError::malformed(&path, "not dynamically linked").into());
    }
    if loads.is_empty() {
        return Err(LoadError::malformed(&path, "no loadable segments").into());
    }
    loads.sort_by_key(|phdr| phdr.p_vaddr);

    if let Some(tls) = tls_phdr {
        obj.tls = Some(TlsInfo {
            index: 0, // assigned by the registry
            size: tls.p_memsz as ElfPtrSize,
            align: tls.p_align as ElfPtrSize,
            init_size: tls.p_filesz as ElfPtrSize,
            init_addr: tls.p_vaddr as ElfPtrSize, // translated below
            static_offset: None,
        });
    }

    let mut mapped = MappedRegions::new(mem);
    let mut segments: Vec<Segment> = Vec::new();

    if contiguous {
        map_contiguous(mem, source, &obj.path, &loads, obj.is_dynamic, &mut mapped, &mut segments)?;
    } else {
        map_per_segment(mem, source, &obj.path, &loads, &mut mapped, &mut segments)?;
    }

    segments.sort_by_key(|seg| seg.vaddr);
    obj.load_map = LoadMap { segments };

    // Locate the program headers inside a mapped segment, if any covers
    // them; otherwise the parsed copy made above stands in.
    for phdr in &loads {
        let p_vaddr = phdr.p_vaddr as ElfPtrSize;
        if phdr_vaddr != EA_UNDEF
            && p_vaddr <= phdr_vaddr
            && phdr_vaddr + phdr_memsz <= p_vaddr + phdr.p_memsz as ElfPtrSize
        {
            obj.phdr_loaded = true;
        }
        if phdr.p_offset <= header.e_phoff
            && header.e_phoff - phdr.p_offset + phsize as ElfPtrSize
                <= phdr.p_filesz as ElfPtrSize
        {
            phdr_vaddr = p_vaddr + (header.e_phoff - phdr.p_offset) as ElfPtrSize;
            phdr_memsz = phsize as ElfPtrSize;
            obj.phdr_loaded = true;
        }
    }

    // Translate every recorded virtual address through the load map.
    obj.dynamic_addr = obj.load_map.relocate(dynamic_vaddr);
    if header.e_entry != 0 {
        obj.entry = obj.load_map.relocate(header.e_entry as ElfPtrSize);
    }
    if interp_vaddr != EA_UNDEF {
        obj.interp = obj.load_map.relocate(interp_vaddr);
    }
    if obj.phdr_loaded {
        obj.phdr_addr = obj.load_map.relocate(phdr_vaddr);
    }
    if relro_vaddr != EA_UNDEF {
        obj.relro_addr = obj.load_map.relocate(relro_vaddr);
    }
    if exidx_vaddr != EA_UNDEF {
        obj.exidx_start = obj.load_map.relocate(exidx_vaddr);
    }
    if let Some(tls) = obj.tls.as_mut() {
        tls.init_addr = obj.load_map.relocate(tls.init_addr);
    }

    mapped.disarm();
    debug!("{}: mapped {} segments", obj.path, obj.load_map.segments.len());
    Ok(obj)
}

/// MMU path: reserve, overlay with fixed mappings, trim the reservation.
fn map_contiguous<M: MemorySystem>(
    mem: &M,
    source: &ImageSource,
    path: &str,
    loads: &[ProgramHeader],
    is_dynamic: bool,
    mapped: &mut MappedRegions<'_, M>,
    segments: &mut Vec<Segment>,
) -> Result<()> {
    let page = mem.page_size();
    let last = loads.last().expect("at least one PT_LOAD");

    let base_align = loads
        .iter()
        .map(|phdr| phdr.p_align as ElfPtrSize)
        .max()
        .unwrap_or(page)
        .max(page);
    let base_vaddr = round_down(loads[0].p_vaddr as ElfPtrSize, page);
    let base_vlimit = round_up(last.p_vaddr as ElfPtrSize + last.p_memsz as ElfPtrSize, page);
    let mapsize = base_vlimit - base_vaddr;
    let overmap = base_align - page;

    // A fixed-base executable must land exactly at its link address.
    let mut request = MapRequest::anonymous(mapsize + overmap, PROT_NONE);
    if !is_dynamic {
        request = request.at(base_vaddr);
    }
    let mut mapbase = mem.map(request).map_err(|e| LoadError::AddressSpace {
        path: path.to_owned(),
        reason: format!("mmap of entire address space failed: {:#}", e),
    })?;
    mapped.push(mapbase, mapsize + overmap);

    // Trim the over-reservation so the base meets the requested alignment.
    if overmap != 0 {
        let front = (base_align - (mapbase & (base_align - 1))) & (base_align - 1);
        if front != 0 {
            mem.unmap(mapbase, front)?;
            mapped.trim_front(front);
            mapbase += front;
        }
        if overmap > front {
            mem.unmap(mapbase + mapsize, overmap - front)?;
            mapped.trim_back(overmap - front);
        }
    }

    if !is_dynamic && mapbase != base_vaddr {
        return Err(LoadError::AddressSpace {
            path: path.to_owned(),
            reason: "executable could not be placed at its requested base".into(),
        }
        .into());
    }

    for phdr in loads {
        let p_vaddr = phdr.p_vaddr as ElfPtrSize;
        let p_filesz = phdr.p_filesz as ElfPtrSize;
        let p_memsz = phdr.p_memsz as ElfPtrSize;
        let prot = prot_from_flags(phdr.p_flags);

        let data_offset = round_down(phdr.p_offset as ElfPtrSize, page);
        let data_vaddr = round_down(p_vaddr, page);
        let data_vlimit = round_up(p_vaddr + p_filesz, page);
        let seg_addr = mapbase + (data_vaddr - base_vaddr);

        // Overlay the file bytes onto the reservation.
        if data_vlimit > data_vaddr {
            mem.map(
                MapRequest::image(source, data_offset as u64, data_vlimit - data_vaddr, prot)
                    .at(seg_addr),
            )
            .map_err(|e| LoadError::AddressSpace {
                path: path.to_owned(),
                reason: format!("mmap of data failed: {:#}", e),
            })?;
        }

        if p_filesz != p_memsz {
            // Clear any BSS in the last page of the file mapping, then map
            // anonymous pages for the rest.
            let clear_vaddr = p_vaddr + p_filesz;
            let nclear = data_vlimit.saturating_sub(clear_vaddr);
            if nclear > 0 {
                write_zeros(mem, mapbase + (clear_vaddr - base_vaddr), nclear, prot, page)?;
            }

            let bss_vaddr = data_vlimit;
            let bss_vlimit = round_up(p_vaddr + p_memsz, page);
            if bss_vlimit > bss_vaddr {
                let bss_addr = mapbase + (bss_vaddr - base_vaddr);
                mem.map(MapRequest::anonymous(bss_vlimit - bss_vaddr, prot).at(bss_addr))
                    .map_err(|e| LoadError::AddressSpace {
                        path: path.to_owned(),
                        reason: format!("mmap of bss failed: {:#}", e),
                    })?;
                if !mem.anonymous_zeroed() {
                    write_zeros(mem, bss_addr, bss_vlimit - bss_vaddr, prot, page)?;
                }
            }
        }

        segments.push(Segment {
            runtime_addr: seg_addr + (p_vaddr & (page - 1)),
            vaddr: p_vaddr,
            memsz: p_memsz,
            prot,
            flags: phdr.p_flags,
            unmappable: false,
        });
    }

    // Unmap the reservation gaps between and around the segments.
    let mut unmap_base = mapbase;
    for seg in segments.iter() {
        let seg_start = round_down(seg.runtime_addr, page);
        if unmap_base < seg_start {
            mem.unmap(unmap_base, seg_start - unmap_base)?;
        }
        unmap_base = round_up(seg.runtime_addr + seg.memsz, page);
    }
    if unmap_base < mapbase + mapsize {
        mem.unmap(unmap_base, mapbase + mapsize - unmap_base)?;
    }

    Ok(())
}

/// NOMMU/FDPIC path: every segment is mapped independently with no address
/// hint; writable segments backed by a shared physical image are copied.
fn map_per_segment<M: MemorySystem>(
    mem: &M,
    source: &ImageSource,
    path: &str,
    loads: &[ProgramHeader],
    mapped: &mut MappedRegions<'_, M>,
    segments: &mut Vec<Segment>,
) -> Result<()> {
    let page = mem.page_size();

    for phdr in loads {
        let p_vaddr = phdr.p_vaddr as ElfPtrSize;
        let p_filesz = phdr.p_filesz as ElfPtrSize;
        let p_memsz = phdr.p_memsz as ElfPtrSize;
        let prot = prot_from_flags(phdr.p_flags);
        let writable = phdr.p_flags & PF_W != 0;

        let data_offset = round_down(phdr.p_offset as ElfPtrSize, page);
        let data_vaddr = round_down(p_vaddr, page);
        let data_vlimit = round_up(p_vaddr + p_filesz, page);
        let bss_vlimit = round_up(p_vaddr + p_memsz, page);

        let seg_page_addr;
        let mut unmappable = false;

        if data_vlimit > data_vaddr {
            let data_addr = mem
                .map(MapRequest::image(
                    source,
                    data_offset as u64,
                    data_vlimit - data_vaddr,
                    prot,
                ))
                .map_err(|e| LoadError::AddressSpace {
                    path: path.to_owned(),
                    reason: format!("mmap of data failed: {:#}", e),
                })?;
            mapped.push(data_addr, data_vlimit - data_vaddr);

            if source.is_physical() && writable {
                // The physical mapping is shared system-wide; take a private
                // copy. BSS is part of the same mapping so nothing can slide
                // in between on a NOMMU kernel.
                let copy_len = bss_vlimit - data_vaddr;
                let copy = mem
                    .map(MapRequest::anonymous(copy_len, prot))
                    .map_err(|_| LoadError::OutOfMemory {
                        context: format!("{}: data copy", path),
                    })?;
                mapped.push(copy, copy_len);

                copy_bytes(
                    mem,
                    data_addr + (phdr.p_offset as ElfPtrSize & (page - 1)),
                    copy + (p_vaddr & (page - 1)),
                    p_filesz,
                )?;
                write_zeros(
                    mem,
                    copy + (p_vaddr & (page - 1)) + p_filesz,
                    p_memsz - p_filesz,
                    prot,
                    page,
                )?;

                // The shared physical mapping cannot be unmapped on NOMMU.
                if mem.has_mmu() {
                    mem.unmap(data_addr, data_vlimit - data_vaddr)?;
                }
                mapped.regions.retain(|&(addr, _)| addr != data_addr);
                seg_page_addr = copy;
            } else {
                unmappable = source.is_physical() && !mem.has_mmu();

                if p_memsz > p_filesz {
                    let nclear = data_vlimit - (p_vaddr + p_filesz);
                    if nclear > 0 {
                        write_zeros(
                            mem,
                            data_addr + (p_vaddr & (page - 1)) + p_filesz,
                            nclear,
                            prot,
                            page,
                        )?;
                    }
                    if bss_vlimit > data_vlimit {
                        // Keep the BSS adjacent to the data mapping.
                        let bss_addr = data_addr + (data_vlimit - data_vaddr);
                        mem.map(
                            MapRequest::anonymous(bss_vlimit - data_vlimit, prot).at(bss_addr),
                        )
                        .map_err(|e| LoadError::AddressSpace {
                            path: path.to_owned(),
                            reason: format!("mmap of bss failed: {:#}", e),
                        })?;
                        mapped.push(bss_addr, bss_vlimit - data_vlimit);
                        if !mem.anonymous_zeroed() {
                            write_zeros(mem, bss_addr, bss_vlimit - data_vlimit, prot, page)?;
                        }
                    }
                }
                seg_page_addr = data_addr;
            }
        } else {
            // BSS-only segment.
            let len = bss_vlimit - data_vaddr;
            let addr = mem
                .map(MapRequest::anonymous(len, prot))
                .map_err(|_| LoadError::OutOfMemory {
                    context: format!("{}: bss", path),
                })?;
            mapped.push(addr, len);
            if !mem.anonymous_zeroed() {
                write_zeros(mem, addr, len, prot, page)?;
            }
            seg_page_addr = addr;
        }

        segments.push(Segment {
            runtime_addr: seg_page_addr + (p_vaddr & (page - 1)),
            vaddr: p_vaddr,
            memsz: p_memsz,
            prot,
            flags: phdr.p_flags,
            unmappable,
        });
    }

    Ok(())
}

/// Zeroes a range, opening a temporary write window when the segment
/// protection does not allow stores.
fn write_zeros<M: MemorySystem>(
    mem: &M,
    addr: ElfPtrSize,
    len: ElfPtrSize,
    prot: i32,
    page: ElfPtrSize,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let window_start = round_down(addr, page);
    let window_len = round_up(addr + len, page) - window_start;
    let needs_window = prot & PROT_WRITE == 0;
    if needs_window {
        mem.protect(window_start, window_len, prot | PROT_WRITE)?;
    }
    let zeros = vec![0u8; 0x1000.min(len as usize)];
    let mut done: ElfPtrSize = 0;
    while done < len {
        let chunk = zeros.len().min((len - done) as usize);
        mem.write(addr + done, &zeros[..chunk])?;
        done += chunk as ElfPtrSize;
    }
    if needs_window {
        mem.protect(window_start, window_len, prot)?;
    }
    Ok(())
}

fn copy_bytes<M: MemorySystem>(
    mem: &M,
    src: ElfPtrSize,
    dst: ElfPtrSize,
    len: ElfPtrSize,
) -> Result<()> {
    let mut buf = vec![0u8; 0x1000];
    let mut done: ElfPtrSize = 0;
    while done < len {
        let chunk = buf.len().min((len - done) as usize);
        mem.read(src + done, &mut buf[..chunk])?;
        mem.write(dst + done, &buf[..chunk])?;
        done += chunk as ElfPtrSize;
    }
    Ok(())
}
