//! In-memory representation of one loaded ELF object.

use crate::config::{Abi, MachineKind};
use crate::elf::program_header::ProgramHeader;
use crate::elf::sym::Sym;
use crate::elf::{ElfPtrSize, ElfSxword};
use crate::fdpic::DescriptorTable;
use crate::load_map::LoadMap;
use crate::symbols::{GnuHash, SysvHash};

/// Stable handle into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub usize);

/// One DT_NEEDED edge; resolved to a registry handle in load order.
#[derive(Debug, Clone)]
pub struct Needed {
    pub name: String,
    pub obj: Option<ObjectId>,
}

#[derive(Debug, Clone)]
pub struct TlsInfo {
    /// Module index handed to DTPMOD relocations.
    pub index: usize,
    pub size: ElfPtrSize,
    pub align: ElfPtrSize,
    pub init_size: ElfPtrSize,
    /// Runtime address of the init image.
    pub init_addr: ElfPtrSize,
    /// Assigned on demand by the first TPOFF relocation against this module.
    pub static_offset: Option<ElfPtrSize>,
}

/// One relocation record, unified over REL and RELA tables.
#[derive(Debug, Clone, Copy)]
pub struct RelocEntry {
    pub offset: ElfPtrSize,
    pub sym: u32,
    pub rtype: u32,
    /// `Some` for RELA records; REL records take the addend from the slot.
    pub addend: Option<ElfSxword>,
}

#[derive(Debug)]
pub struct Object {
    /// Canonical pathname (`syspage:<name>` for in-kernel images).
    pub path: String,
    /// Device and inode; nil for syspage images.
    pub dev: u64,
    pub ino: u64,

    pub load_map: LoadMap,
    pub machine: MachineKind,
    pub abi: Abi,
    pub is_dynamic: bool,

    // Runtime addresses, translated through the load map by the mapper.
    pub entry: ElfPtrSize,
    pub interp: ElfPtrSize,
    pub dynamic_addr: ElfPtrSize,
    pub dynamic_size: ElfPtrSize,
    pub relro_addr: ElfPtrSize,
    pub relro_size: ElfPtrSize,
    pub exidx_start: ElfPtrSize,
    pub exidx_size: ElfPtrSize,

    /// Program headers; a fresh copy when no PT_LOAD covered them.
    pub phdrs: Vec<ProgramHeader>,
    pub phdr_addr: ElfPtrSize,
    pub phdr_loaded: bool,

    // Digested tables.
    pub strtab: Vec<u8>,
    pub symtab: Vec<Sym>,
    pub sysv_hash: Option<SysvHash>,
    pub gnu_hash: Option<GnuHash>,
    pub rel: Vec<RelocEntry>,
    pub plt_rel: Vec<RelocEntry>,
    /// Byte size of one PLT relocation record; the binder divides the
    /// trampoline's byte offset by it.
    pub plt_entsize: usize,
    pub pltgot: ElfPtrSize,
    pub needed: Vec<Needed>,

    pub init: ElfPtrSize,
    pub fini: ElfPtrSize,
    pub init_array: ElfPtrSize,
    pub init_array_count: usize,
    pub fini_array: ElfPtrSize,
    pub fini_array_count: usize,

    // DT_FLAGS / DT_FLAGS_1.
    pub symbolic: bool,
    pub textrel: bool,
    pub bind_now: bool,
    pub no_delete: bool,
    pub no_open: bool,
    pub pie: bool,

    pub main_ref: bool,
    pub global_ref: bool,
    /// The object's dependency DAG has been pinned for NODELETE.
    pub ref_nodel: bool,

    pub refcount: usize,
    /// Load and relocation are complete; later loads must not redo them.
    pub relocated: bool,
    /// The object's dependency DAG, the lookup scope that extends the
    /// global list when this object's references are resolved.
    pub dag: Vec<ObjectId>,
    pub tls: Option<TlsInfo>,
    pub descriptors: DescriptorTable,

    /// Counts of IRELATIVE entries left for the deferred ifunc pass.
    pub ifunc_remaining: usize,
    pub ifunc_remaining_plt: usize,
}

impl Object {
    pub fn new(path: String, dev: u64, ino: u64, machine: MachineKind, abi: Abi) -> Self {
        Object {
            path,
            dev,
            ino,
            load_map: LoadMap::default(),
            machine,
            abi,
            is_dynamic: false,
            entry: 0,
            interp: 0,
            dynamic_addr: 0,
            dynamic_size: 0,
            relro_addr: 0,
            relro_size: 0,
            exidx_start: 0,
            exidx_size: 0,
            phdrs: Vec::new(),
            phdr_addr: 0,
            phdr_loaded: false,
            strtab: Vec::new(),
            symtab: Vec::new(),
            sysv_hash: None,
            gnu_hash: None,
            rel: Vec::new(),
            plt_rel: Vec::new(),
            plt_entsize: 0,
            pltgot: 0,
            needed: Vec::new(),
            init: 0,
            fini: 0,
            init_array: 0,
            init_array_count: 0,
            fini_array: 0,
            fini_array_count: 0,
            symbolic: false,
            textrel: false,
            bind_now: false,
            no_delete: false,
            no_open: false,
            pie: false,
            main_ref: false,
            global_ref: false,
            ref_nodel: false,
            refcount: 0,
            relocated: false,
            dag: Vec::new(),
            tls: None,
            descriptors: DescriptorTable::default(),
            ifunc_remaining: 0,
            ifunc_remaining_plt: 0,
        }
    }

    /// NUL-terminated name at `st_name` in the string table; empty when out
    /// of range (a truncated string table is a malformed image, but symbol
    /// names feed error messages and must not panic).
    pub fn str_at(&self, offset: u32) -> &str {
        let start = offset as usize;
        if start >= self.strtab.len() {
            return "";
        }
        let tail = &self.strtab[start..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end]).unwrap_or("")
    }

    pub fn symbol(&self, index: u32) -> Option<&Sym> {
        self.symtab.get(index as usize)
    }

    pub fn symbol_name(&self, index: u32) -> &str {
        self.symbol(index)
            .map(|sym| self.str_at(sym.st_name))
            .unwrap_or("")
    }

    /// Runtime address of a defined symbol's value.
    pub fn relocate(&self, vaddr: ElfPtrSize) -> ElfPtrSize {
        self.load_map.relocate(vaddr)
    }
}

#[cfg(test)]
mod test {
    use crate::config::{Abi, MachineKind};

    use super::*;

    #[test]
    fn test_str_at_bounds() {
        let mut obj = Object::new("/t".into(), 0, 0, MachineKind::Arm, Abi::Fdpic);
        obj.strtab = b"\0foo\0bar\0".to_vec();
        assert_eq!(obj.str_at(1), "foo");
        assert_eq!(obj.str_at(5), "bar");
        assert_eq!(obj.str_at(100), "");
    }
}
