//! Test doubles: an in-memory address space honouring placement and
//! protection, a syspage catalog fake, and a synthetic ELF image builder.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use eyre::{eyre, Result};
use scroll::Pwrite;

use crate::config::{Abi, LinkerConfig, MachineKind, MachineSpec};
use crate::elf::dynamic::{
    Dyn, DT_HASH, DT_INIT, DT_JMPREL, DT_NEEDED, DT_NULL, DT_PLTGOT, DT_PLTREL, DT_PLTRELSZ,
    DT_REL, DT_RELA, DT_RELASZ, DT_RELSZ, DT_STRSZ, DT_STRTAB, DT_SYMBOLIC, DT_SYMTAB,
    DT_TEXTREL,
};
use crate::elf::header::{Header, EI_CLASS, EI_DATA, EI_VERSION, ELFCLASS, ELFMAG, EV_CURRENT, SELFMAG, SIZEOF_EHDR};
use crate::elf::program_header::{
    ProgramHeader, PF_R, PF_W, PF_X, PT_DYNAMIC, PT_LOAD, PT_TLS, SIZEOF_PHDR,
};
use crate::elf::reloc::{Rel, Rela};
use crate::elf::sym::Sym;
use crate::elf::{
    r_info, ElfPtrSize, ElfSxword, DT_FLAGS_1, DT_GNU_HASH, ELFDATA_HOST, EM_ARM, ET_DYN,
    ET_EXEC, SIZEOF_REL, SIZEOF_RELA, SIZEOF_SYM,
};
use crate::fdpic::FuncDesc;
use crate::linker::Linker;
use crate::source::ImageSource;
use crate::symbols::elf_hash;
use crate::sys::mem::{Backing, MapRequest, MemorySystem, PROT_WRITE};
use crate::sys::syspage::{SyspageCatalog, SyspageProgram};

pub const PAGE: ElfPtrSize = 0x1000;

/// What [`FakeMemory`] adds to an unregistered ifunc resolver's address to
/// produce its "resolved" target.
pub const IFUNC_BIAS: ElfPtrSize = 0x10_0000;

// ---------------------------------------------------------------------------
// FakeMemory

struct Region {
    data: Vec<u8>,
}

#[derive(Default)]
struct FakeMemoryInner {
    /// Keyed by start address; regions never overlap.
    regions: BTreeMap<ElfPtrSize, Region>,
    /// Per-page protection bits.
    prot: HashMap<ElfPtrSize, i32>,
    next_addr: ElfPtrSize,
    physical: HashMap<u64, Vec<u8>>,
    ifuncs: HashMap<ElfPtrSize, ElfPtrSize>,
}

/// An in-memory address space. Fixed placement carves existing regions the
/// way `MAP_FIXED` does; writes honour page protection so protection bugs
/// show up in tests.
pub struct FakeMemory {
    inner: Mutex<FakeMemoryInner>,
    has_mmu: bool,
    /// Phoenix semantics by default: anonymous pages are NOT zeroed.
    zeroed: bool,
}

impl FakeMemory {
    pub fn new() -> Self {
        FakeMemory {
            inner: Mutex::new(FakeMemoryInner {
                next_addr: 0x1000_0000,
                ..Default::default()
            }),
            has_mmu: true,
            zeroed: false,
        }
    }

    pub fn nommu() -> Self {
        FakeMemory {
            has_mmu: false,
            ..Self::new()
        }
    }

    /// Registers a physical ("syspage") image at `addr`.
    pub fn add_physical_image(&self, addr: u64, data: Vec<u8>) {
        self.inner.lock().unwrap().physical.insert(addr, data);
    }

    /// Registers the answer an ifunc resolver at `resolver` would return.
    pub fn add_ifunc(&self, resolver: ElfPtrSize, target: ElfPtrSize) {
        self.inner.lock().unwrap().ifuncs.insert(resolver, target);
    }

    /// Number of mapped bytes covering `addr`, or None when unmapped.
    pub fn is_mapped(&self, addr: ElfPtrSize) -> bool {
        let inner = self.inner.lock().unwrap();
        FakeMemoryInner::region_at(&inner.regions, addr).is_some()
    }

    /// Total mapped bytes; lets tests assert that an unwind returned the
    /// address space to its prior state.
    pub fn mapped_bytes(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.regions.values().map(|region| region.data.len()).sum()
    }

    pub fn prot_at(&self, addr: ElfPtrSize) -> Option<i32> {
        let inner = self.inner.lock().unwrap();
        inner.prot.get(&(addr & !(PAGE - 1))).copied()
    }
}

impl FakeMemoryInner {
    fn region_at(
        regions: &BTreeMap<ElfPtrSize, Region>,
        addr: ElfPtrSize,
    ) -> Option<(ElfPtrSize, &Region)> {
        let (&start, region) = regions.range(..=addr).next_back()?;
        (addr < start + region.data.len() as ElfPtrSize).then_some((start, region))
    }

    /// Removes the range `[addr, addr+len)` from the region table, keeping
    /// any protruding head/tail pieces.
    fn carve(&mut self, addr: ElfPtrSize, len: ElfPtrSize) {
        let end = addr + len;
        let overlapping: Vec<ElfPtrSize> = self
            .regions
            .iter()
            .filter(|(&start, region)| start < end && start + region.data.len() as ElfPtrSize > addr)
            .map(|(&start, _)| start)
            .collect();
        for start in overlapping {
            let region = self.regions.remove(&start).unwrap();
            let rend = start + region.data.len() as ElfPtrSize;
            if start < addr {
                let head = region.data[..(addr - start) as usize].to_vec();
                self.regions.insert(start, Region { data: head });
            }
            if rend > end {
                let tail = region.data[(end - start) as usize..].to_vec();
                self.regions.insert(end, Region { data: tail });
            }
        }
    }
}

impl MemorySystem for FakeMemory {
    fn page_size(&self) -> ElfPtrSize {
        PAGE
    }

    fn has_mmu(&self) -> bool {
        self.has_mmu
    }

    fn anonymous_zeroed(&self) -> bool {
        self.zeroed
    }

    fn map(&self, req: MapRequest<'_>) -> Result<ElfPtrSize> {
        let len = crate::util::round_up(req.len.max(1), PAGE);
        let mut inner = self.inner.lock().unwrap();

        let addr = match req.fixed_addr {
            Some(addr) => {
                if !self.has_mmu {
                    return Err(eyre!("fixed placement without an MMU"));
                }
                if addr & (PAGE - 1) != 0 {
                    return Err(eyre!("fixed mapping at unaligned address {:#x}", addr));
                }
                inner.carve(addr, len);
                addr
            }
            None => {
                let addr = inner.next_addr;
                // Leave a guard gap so adjacent mappings stay distinct.
                inner.next_addr += len + PAGE;
                addr
            }
        };

        let mut data = match &req.backing {
            Backing::Anonymous => {
                if self.zeroed {
                    vec![0u8; len as usize]
                } else {
                    // Dirty pages: code that needs zeros must clear them.
                    vec![0xaa; len as usize]
                }
            }
            Backing::Image { source, offset } => {
                let mut data = vec![0u8; len as usize];
                match source {
                    ImageSource::File { .. } => source.read_at(*offset, &mut data)?,
                    ImageSource::Syspage { addr: image_addr, .. } => {
                        let images = &inner.physical;
                        let image = images
                            .get(image_addr)
                            .ok_or_else(|| eyre!("no physical image at {:#x}", image_addr))?;
                        let offset = *offset as usize;
                        let available = image.len().saturating_sub(offset).min(data.len());
                        data[..available]
                            .copy_from_slice(&image[offset..offset + available]);
                    }
                }
                data
            }
        };
        data.resize(len as usize, if self.zeroed { 0 } else { 0xaa });

        inner.regions.insert(addr, Region { data });
        for page in (addr..addr + len).step_by(PAGE as usize) {
            inner.prot.insert(page, req.prot);
        }
        Ok(addr)
    }

    fn unmap(&self, addr: ElfPtrSize, len: ElfPtrSize) -> Result<()> {
        let len = crate::util::round_up(len.max(1), PAGE);
        let mut inner = self.inner.lock().unwrap();
        inner.carve(addr, len);
        for page in (addr..addr + len).step_by(PAGE as usize) {
            inner.prot.remove(&page);
        }
        Ok(())
    }

    fn protect(&self, addr: ElfPtrSize, len: ElfPtrSize, prot: i32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for page in (addr..addr + len).step_by(PAGE as usize) {
            let page = page & !(PAGE - 1);
            if !inner.prot.contains_key(&page) {
                return Err(eyre!("mprotect of unmapped page {:#x}", page));
            }
            inner.prot.insert(page, prot);
        }
        Ok(())
    }

    fn read(&self, addr: ElfPtrSize, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let mut cursor = addr;
        let mut done = 0usize;
        while done < buf.len() {
            let (start, region) = FakeMemoryInner::region_at(&inner.regions, cursor)
                .ok_or_else(|| eyre!("fault: read of unmapped address {:#x}", cursor))?;
            let offset = (cursor - start) as usize;
            let available = (region.data.len() - offset).min(buf.len() - done);
            buf[done..done + available]
                .copy_from_slice(&region.data[offset..offset + available]);
            done += available;
            cursor += available as ElfPtrSize;
        }
        Ok(())
    }

    fn write(&self, addr: ElfPtrSize, buf: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for page in (addr & !(PAGE - 1)..addr + buf.len() as ElfPtrSize).step_by(PAGE as usize) {
            match inner.prot.get(&page) {
                Some(prot) if prot & PROT_WRITE != 0 => {}
                Some(_) => return Err(eyre!("fault: write to protected page {:#x}", page)),
                None => return Err(eyre!("fault: write to unmapped page {:#x}", page)),
            }
        }
        let mut cursor = addr;
        let mut done = 0usize;
        while done < buf.len() {
            let (start, _) = FakeMemoryInner::region_at(&inner.regions, cursor)
                .ok_or_else(|| eyre!("fault: write to unmapped address {:#x}", cursor))?;
            let region = inner.regions.get_mut(&start).unwrap();
            let offset = (cursor - start) as usize;
            let available = (region.data.len() - offset).min(buf.len() - done);
            region.data[offset..offset + available]
                .copy_from_slice(&buf[done..done + available]);
            done += available;
            cursor += available as ElfPtrSize;
        }
        Ok(())
    }

    fn resolve_ifunc(&self, entry: ElfPtrSize) -> Result<ElfPtrSize> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .ifuncs
            .get(&entry)
            .copied()
            // Unregistered resolvers "return" a predictable transform so
            // tests can compute the expected slot value up front.
            .unwrap_or(entry.wrapping_add(IFUNC_BIAS)))
    }

    fn code_barrier(&self) {}
}

// ---------------------------------------------------------------------------
// Syspage catalog fake

pub struct FakeSyspage {
    pub programs: Vec<SyspageProgram>,
}

impl SyspageCatalog for FakeSyspage {
    fn programs(&self) -> Result<Vec<SyspageProgram>> {
        Ok(self.programs.clone())
    }
}

// ---------------------------------------------------------------------------
// Synthetic ELF images

pub struct TestSym {
    pub name: String,
    pub value: ElfPtrSize,
    pub size: ElfPtrSize,
    pub info: u8,
    pub shndx: u16,
}

pub struct TestReloc {
    pub rtype: u32,
    pub sym: u32,
    pub offset: ElfPtrSize,
    pub addend: Option<ElfSxword>,
}

/// Builds a dynamic ELF image of the host class: an RX text segment over the
/// headers, a read-only metadata segment (dynamic array, hash, symbols,
/// strings, relocations) and an RW data segment with caller-chosen content.
pub struct ElfBuilder {
    machine: u16,
    executable: bool,
    rela: bool,
    pub base: ElfPtrSize,
    pub data_vaddr: ElfPtrSize,
    align: ElfPtrSize,
    data: Vec<u8>,
    bss: ElfPtrSize,
    pltgot_vaddr: ElfPtrSize,
    symbols: Vec<TestSym>,
    needed: Vec<String>,
    relocs: Vec<TestReloc>,
    plt_relocs: Vec<TestReloc>,
    symbolic: bool,
    textrel: bool,
    flags_1: ElfPtrSize,
    tls: Option<ProgramHeader>,
    gnu_hash: bool,
    no_dynamic: bool,
    init_vaddr: Option<ElfPtrSize>,
}

impl ElfBuilder {
    pub fn new(machine: u16, rela: bool) -> Self {
        let base = 0x1_0000;
        ElfBuilder {
            machine,
            executable: false,
            rela,
            base,
            data_vaddr: base + 0x8000,
            align: PAGE,
            data: vec![0u8; 0x200],
            bss: 0,
            pltgot_vaddr: base + 0x8000,
            symbols: Vec::new(),
            needed: Vec::new(),
            relocs: Vec::new(),
            plt_relocs: Vec::new(),
            symbolic: false,
            textrel: false,
            flags_1: 0,
            tls: None,
            gnu_hash: false,
            no_dynamic: false,
            init_vaddr: None,
        }
    }

    /// Host-native numbering (the default test target).
    pub fn host() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                Self::new(crate::elf::EM_X86_64, true)
            } else if #[cfg(target_arch = "aarch64")] {
                Self::new(crate::elf::EM_AARCH64, true)
            } else {
                Self::new(crate::elf::EM_ARM, false)
            }
        }
    }

    /// ARM with FDPIC descriptor relocations, REL-style records.
    pub fn arm_fdpic() -> Self {
        Self::new(EM_ARM, false)
    }

    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }

    pub fn align(mut self, align: ElfPtrSize) -> Self {
        self.align = align;
        self
    }

    pub fn no_dynamic(mut self) -> Self {
        self.no_dynamic = true;
        self
    }

    pub fn gnu_hash(mut self) -> Self {
        self.gnu_hash = true;
        self
    }

    pub fn symbolic(mut self) -> Self {
        self.symbolic = true;
        self
    }

    pub fn textrel(mut self) -> Self {
        self.textrel = true;
        self
    }

    pub fn flags_1(mut self, flags: ElfPtrSize) -> Self {
        self.flags_1 = flags;
        self
    }

    pub fn init(mut self, vaddr: ElfPtrSize) -> Self {
        self.init_vaddr = Some(vaddr);
        self
    }

    pub fn bss(mut self, bss: ElfPtrSize) -> Self {
        self.bss = bss;
        self
    }

    pub fn tls(mut self, filesz: ElfPtrSize, memsz: ElfPtrSize, align: ElfPtrSize) -> Self {
        self.tls = Some(ProgramHeader {
            p_type: PT_TLS,
            p_flags: PF_R,
            p_vaddr: self.data_vaddr as _,
            p_filesz: filesz as _,
            p_memsz: memsz as _,
            p_align: align as _,
            ..Default::default()
        });
        self
    }

    pub fn needed(mut self, name: &str) -> Self {
        self.needed.push(name.to_owned());
        self
    }

    /// Adds a dynamic symbol; returns its symbol-table index.
    pub fn add_symbol(&mut self, sym: TestSym) -> u32 {
        self.symbols.push(sym);
        self.symbols.len() as u32
    }

    pub fn add_reloc(&mut self, reloc: TestReloc) {
        self.relocs.push(reloc);
    }

    pub fn add_plt_reloc(&mut self, reloc: TestReloc) {
        self.plt_relocs.push(reloc);
    }

    /// Writes bytes into the data segment image at `vaddr`.
    pub fn set_data(&mut self, vaddr: ElfPtrSize, bytes: &[u8]) {
        let offset = (vaddr - self.data_vaddr) as usize;
        if self.data.len() < offset + bytes.len() {
            self.data.resize(offset + bytes.len(), 0);
        }
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn set_data_ptr(&mut self, vaddr: ElfPtrSize, value: ElfPtrSize) {
        self.set_data(vaddr, &value.to_ne_bytes());
    }

    pub fn data_size(&mut self, size: usize) {
        if self.data.len() < size {
            self.data.resize(size, 0);
        }
    }

    pub fn build(&self) -> Vec<u8> {
        if self.no_dynamic {
            return self.build_static();
        }

        // ---- string table -------------------------------------------------
        let mut strtab: Vec<u8> = vec![0];
        let mut sym_names = Vec::new();
        for sym in &self.symbols {
            sym_names.push(strtab.len() as u32);
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
        }
        let mut needed_offsets = Vec::new();
        for name in &self.needed {
            needed_offsets.push(strtab.len() as ElfPtrSize);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }
        while strtab.len() % 8 != 0 {
            strtab.push(0);
        }

        // ---- symbol table (index 0 reserved) ------------------------------
        let nsyms = self.symbols.len() + 1;
        let mut symtab = vec![0u8; nsyms * SIZEOF_SYM];
        for (index, sym) in self.symbols.iter().enumerate() {
            let record = Sym {
                st_name: sym_names[index],
                st_info: sym.info,
                st_other: 0,
                st_shndx: sym.shndx as _,
                st_value: sym.value as _,
                st_size: sym.size as _,
            };
            symtab
                .pwrite_with(record, (index + 1) * SIZEOF_SYM, scroll::NATIVE)
                .unwrap();
        }

        // ---- hash tables --------------------------------------------------
        let hash = if self.gnu_hash {
            self.build_gnu_hash()
        } else {
            self.build_sysv_hash(nsyms)
        };

        // ---- relocation tables --------------------------------------------
        let rel_bytes = self.build_relocs(&self.relocs);
        let plt_bytes = self.build_relocs(&self.plt_relocs);

        // ---- dynamic array ------------------------------------------------
        let meta_vaddr = self.base + PAGE;
        let mut entries: Vec<(ElfPtrSize, ElfPtrSize)> = Vec::new();
        // Section offsets inside the metadata segment, after the dynamic
        // array whose length we can already compute.
        let mut dyn_count = 5; // STRTAB STRSZ SYMTAB HASH NULL
        dyn_count += if self.relocs.is_empty() { 0 } else { 2 };
        dyn_count += if self.plt_relocs.is_empty() { 0 } else { 3 };
        dyn_count += 1; // PLTGOT
        dyn_count += self.needed.len();
        dyn_count += usize::from(self.symbolic);
        dyn_count += usize::from(self.textrel);
        dyn_count += usize::from(self.flags_1 != 0);
        dyn_count += usize::from(self.init_vaddr.is_some());
        let dyn_size = dyn_count * crate::elf::SIZEOF_DYN;

        let hash_off = dyn_size;
        let symtab_off = hash_off + hash.len();
        let strtab_off = symtab_off + symtab.len();
        let rel_off = strtab_off + strtab.len();
        let plt_off = rel_off + rel_bytes.len();
        let meta_len = plt_off + plt_bytes.len();

        for name_off in &needed_offsets {
            entries.push((DT_NEEDED, *name_off));
        }
        entries.push((DT_STRTAB, meta_vaddr + strtab_off as ElfPtrSize));
        entries.push((DT_STRSZ, strtab.len() as ElfPtrSize));
        entries.push((DT_SYMTAB, meta_vaddr + symtab_off as ElfPtrSize));
        if self.gnu_hash {
            entries.push((DT_GNU_HASH, meta_vaddr + hash_off as ElfPtrSize));
        } else {
            entries.push((DT_HASH, meta_vaddr + hash_off as ElfPtrSize));
        }
        if !self.relocs.is_empty() {
            if self.rela {
                entries.push((DT_RELA, meta_vaddr + rel_off as ElfPtrSize));
                entries.push((DT_RELASZ, rel_bytes.len() as ElfPtrSize));
            } else {
                entries.push((DT_REL, meta_vaddr + rel_off as ElfPtrSize));
                entries.push((DT_RELSZ, rel_bytes.len() as ElfPtrSize));
            }
        }
        if !self.plt_relocs.is_empty() {
            entries.push((DT_JMPREL, meta_vaddr + plt_off as ElfPtrSize));
            entries.push((DT_PLTRELSZ, plt_bytes.len() as ElfPtrSize));
            entries.push((DT_PLTREL, if self.rela { DT_RELA } else { DT_REL }));
        }
        entries.push((DT_PLTGOT, self.pltgot_vaddr));
        if self.symbolic {
            entries.push((DT_SYMBOLIC, 0));
        }
        if self.textrel {
            entries.push((DT_TEXTREL, 0));
        }
        if self.flags_1 != 0 {
            entries.push((DT_FLAGS_1, self.flags_1));
        }
        if let Some(init) = self.init_vaddr {
            entries.push((DT_INIT, init));
        }
        entries.push((DT_NULL, 0));
        assert_eq!(entries.len(), dyn_count);

        let mut meta = vec![0u8; meta_len];
        for (index, (tag, val)) in entries.iter().enumerate() {
            meta.pwrite_with(
                Dyn {
                    d_tag: *tag,
                    d_val: *val,
                },
                index * crate::elf::SIZEOF_DYN,
                scroll::NATIVE,
            )
            .unwrap();
        }
        meta[hash_off..hash_off + hash.len()].copy_from_slice(&hash);
        meta[symtab_off..symtab_off + symtab.len()].copy_from_slice(&symtab);
        meta[strtab_off..strtab_off + strtab.len()].copy_from_slice(&strtab);
        meta[rel_off..rel_off + rel_bytes.len()].copy_from_slice(&rel_bytes);
        meta[plt_off..plt_off + plt_bytes.len()].copy_from_slice(&plt_bytes);

        // ---- program headers and file image -------------------------------
        let meta_file_len = crate::util::round_up(meta.len() as ElfPtrSize, PAGE);
        let data_off = PAGE + meta_file_len;

        let mut phdrs = vec![
            ProgramHeader {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_X,
                p_offset: 0,
                p_vaddr: self.base as _,
                p_paddr: self.base as _,
                p_filesz: PAGE as _,
                p_memsz: PAGE as _,
                p_align: self.align as _,
            },
            ProgramHeader {
                p_type: PT_LOAD,
                p_flags: PF_R,
                p_offset: PAGE as _,
                p_vaddr: meta_vaddr as _,
                p_paddr: meta_vaddr as _,
                p_filesz: meta.len() as _,
                p_memsz: meta.len() as _,
                p_align: self.align as _,
            },
            ProgramHeader {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_W,
                p_offset: data_off as _,
                p_vaddr: self.data_vaddr as _,
                p_paddr: self.data_vaddr as _,
                p_filesz: self.data.len() as _,
                p_memsz: (self.data.len() as ElfPtrSize + self.bss) as _,
                p_align: self.align as _,
            },
            ProgramHeader {
                p_type: PT_DYNAMIC,
                p_flags: PF_R,
                p_offset: PAGE as _,
                p_vaddr: meta_vaddr as _,
                p_paddr: meta_vaddr as _,
                p_filesz: dyn_size as _,
                p_memsz: dyn_size as _,
                p_align: 8,
            },
        ];
        if let Some(tls) = self.tls {
            phdrs.push(tls);
        }

        let mut image = vec![0u8; data_off as usize + self.data.len()];
        let header = self.header(phdrs.len());
        image.pwrite_with(header, 0, scroll::NATIVE).unwrap();
        for (index, phdr) in phdrs.iter().enumerate() {
            image
                .pwrite_with(*phdr, SIZEOF_EHDR + index * SIZEOF_PHDR, scroll::NATIVE)
                .unwrap();
        }
        image[PAGE as usize..PAGE as usize + meta.len()].copy_from_slice(&meta);
        image[data_off as usize..data_off as usize + self.data.len()]
            .copy_from_slice(&self.data);
        image
    }

    /// The S1 shape: one RX PT_LOAD, no PT_DYNAMIC.
    fn build_static(&self) -> Vec<u8> {
        let phdr = ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_X,
            p_offset: 0,
            p_vaddr: self.base as _,
            p_paddr: self.base as _,
            p_filesz: 0x200,
            p_memsz: 0x200,
            p_align: self.align as _,
        };
        let mut image = vec![0u8; 0x200];
        let header = self.header(1);
        image.pwrite_with(header, 0, scroll::NATIVE).unwrap();
        image.pwrite_with(phdr, SIZEOF_EHDR, scroll::NATIVE).unwrap();
        image
    }

    fn header(&self, phnum: usize) -> Header {
        let mut e_ident = [0u8; 16];
        e_ident[..SELFMAG].copy_from_slice(ELFMAG);
        e_ident[EI_CLASS] = ELFCLASS;
        e_ident[EI_DATA] = ELFDATA_HOST;
        e_ident[EI_VERSION] = EV_CURRENT;
        Header {
            e_ident,
            e_type: if self.executable { ET_EXEC } else { ET_DYN },
            e_machine: self.machine,
            e_version: EV_CURRENT as u32,
            e_entry: (self.base + 0x100) as _,
            e_phoff: SIZEOF_EHDR as _,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: SIZEOF_EHDR as u16,
            e_phentsize: SIZEOF_PHDR as u16,
            e_phnum: phnum as u16,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }

    fn build_sysv_hash(&self, nsyms: usize) -> Vec<u8> {
        let nbucket = 4usize;
        let mut buckets = vec![0u32; nbucket];
        let mut chains = vec![0u32; nsyms];
        for (index, sym) in self.symbols.iter().enumerate() {
            let symnum = index as u32 + 1;
            let bucket = elf_hash(&sym.name) as usize % nbucket;
            chains[symnum as usize] = buckets[bucket];
            buckets[bucket] = symnum;
        }
        let mut out = Vec::new();
        out.extend_from_slice(&(nbucket as u32).to_ne_bytes());
        out.extend_from_slice(&(nsyms as u32).to_ne_bytes());
        for word in buckets.iter().chain(chains.iter()) {
            out.extend_from_slice(&word.to_ne_bytes());
        }
        out
    }

    /// Degenerate but valid GNU hash: one bucket, an all-ones bloom word,
    /// every symbol on the single chain in table order.
    fn build_gnu_hash(&self) -> Vec<u8> {
        let symoffset = 1u32;
        let mut out = Vec::new();
        out.extend_from_slice(&1u32.to_ne_bytes()); // nbuckets
        out.extend_from_slice(&symoffset.to_ne_bytes());
        out.extend_from_slice(&1u32.to_ne_bytes()); // bloom_size
        out.extend_from_slice(&5u32.to_ne_bytes()); // bloom_shift
        out.extend_from_slice(&ElfPtrSize::MAX.to_ne_bytes());
        let first = if self.symbols.is_empty() { 0u32 } else { 1u32 };
        out.extend_from_slice(&first.to_ne_bytes());
        for (index, sym) in self.symbols.iter().enumerate() {
            let mut hash = crate::symbols::gnu_hash(&sym.name);
            if index + 1 == self.symbols.len() {
                hash |= 1;
            } else {
                hash &= !1;
            }
            out.extend_from_slice(&hash.to_ne_bytes());
        }
        out
    }

    fn build_relocs(&self, relocs: &[TestReloc]) -> Vec<u8> {
        let entsize = if self.rela { SIZEOF_RELA } else { SIZEOF_REL };
        let mut out = vec![0u8; relocs.len() * entsize];
        for (index, reloc) in relocs.iter().enumerate() {
            if self.rela {
                out.pwrite_with(
                    Rela {
                        r_offset: reloc.offset as _,
                        r_info: r_info(reloc.sym, reloc.rtype),
                        r_addend: reloc.addend.unwrap_or(0) as _,
                    },
                    index * entsize,
                    scroll::NATIVE,
                )
                .unwrap();
            } else {
                out.pwrite_with(
                    Rel {
                        r_offset: reloc.offset as _,
                        r_info: r_info(reloc.sym, reloc.rtype),
                    },
                    index * entsize,
                    scroll::NATIVE,
                )
                .unwrap();
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Linker fixtures

/// A config accepting the host machine plus ARM FDPIC, with a recognisable
/// trampoline descriptor and no filesystem search paths.
pub fn test_config() -> LinkerConfig {
    let mut config = LinkerConfig::default();
    config.search_paths.clear();
    config.machines.push(MachineSpec {
        machine: EM_ARM,
        kind: MachineKind::Arm,
        abi: Abi::Fdpic,
    });
    config.bind_start = FuncDesc {
        entry: 0xdead_0000,
        got: 0xdead_0010,
    };
    config
}

/// Registers `image` as a physical image and returns a syspage source for
/// it, for driving the mapper directly.
pub fn physical_source(mem: &FakeMemory, addr: u64, image: Vec<u8>) -> ImageSource {
    mem.add_physical_image(addr, image.clone());
    ImageSource::Syspage {
        name: format!("img{:x}", addr),
        addr,
        size: image.len() as u64,
    }
}

/// Builds a linker over a fake address space whose syspage catalog serves
/// the given images as `syspage:<name>` paths.
pub fn syspage_linker(images: Vec<(&str, Vec<u8>)>) -> Linker<FakeMemory> {
    let mem = FakeMemory::new();
    let mut programs = Vec::new();
    for (index, (name, image)) in images.into_iter().enumerate() {
        let addr = 0x8000_0000 + (index as u64) * 0x10_0000;
        mem.add_physical_image(addr, image.clone());
        programs.push(SyspageProgram {
            name: (*name).to_owned(),
            addr,
            size: image.len() as u64,
        });
    }
    Linker::new(mem, test_config()).with_catalog(Box::new(FakeSyspage { programs }))
}

/// Runtime address of `vaddr` inside a loaded object.
pub fn runtime_of(
    linker: &Linker<FakeMemory>,
    id: crate::object::ObjectId,
    vaddr: ElfPtrSize,
) -> ElfPtrSize {
    linker.with_read(|state| state.object(id).unwrap().load_map.relocate(vaddr))
}

/// Reads the pointer-sized slot at virtual address `vaddr` of a loaded
/// object.
pub fn read_slot(
    linker: &Linker<FakeMemory>,
    id: crate::object::ObjectId,
    vaddr: ElfPtrSize,
) -> ElfPtrSize {
    let addr = runtime_of(linker, id, vaddr);
    linker.mem().read_ptr(addr).unwrap()
}
