//! Digests the `DT_*` array of a freshly mapped object: saves the tables,
//! the needed list and the PLT/relocation sections, then translates every
//! recorded pointer through the load map exactly once.

use eyre::Result;
use log::debug;
use scroll::Pread;

use crate::elf::dynamic::{
    Dyn, DT_BIND_NOW, DT_FINI, DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_HASH, DT_INIT, DT_INIT_ARRAY,
    DT_INIT_ARRAYSZ, DT_JMPREL, DT_NEEDED, DT_NULL, DT_PLTGOT, DT_PLTREL, DT_PLTRELSZ, DT_REL,
    DT_RELA, DT_RELASZ, DT_RELSZ, DT_STRSZ, DT_STRTAB, DT_SYMBOLIC, DT_SYMTAB, DT_TEXTREL,
};
use crate::elf::reloc::{Rel, Rela};
use crate::elf::sym::Sym;
use crate::elf::{
    r_sym, ElfPtrSize, ElfSxword, DF_1_GLOBAL, DF_1_NODELETE, DF_1_NOOPEN, DF_1_NOW, DF_1_PIE,
    DF_BIND_NOW, DF_SYMBOLIC, DF_TEXTREL, DT_FLAGS, DT_FLAGS_1, DT_GNU_HASH, EA_UNDEF, SIZEOF_REL,
    SIZEOF_RELA, SIZEOF_SYM,
};
use crate::error::LoadError;
use crate::object::{Needed, Object, RelocEntry};
use crate::symbols::{GnuHash, SysvHash};
use crate::sys::mem::MemorySystem;

/// Iterator over the entries of a dynamic segment image.
pub struct DynIter {
    data: Vec<u8>,
    offset: usize,
}

impl DynIter {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, offset: 0 }
    }
}

impl Iterator for DynIter {
    type Item = Dyn;

    fn next(&mut self) -> Option<Self::Item> {
        let entry: Dyn = self.data.gread(&mut self.offset).ok()?;
        (entry.d_tag != DT_NULL).then_some(entry)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RelStyle {
    Rel,
    Rela,
}

/// Walks the PT_DYNAMIC array of `obj` and fills in its tables.
pub fn digest_dynamic<M: MemorySystem>(mem: &M, obj: &mut Object) -> Result<()> {
    let path = obj.path.clone();
    let malformed =
        |reason: String| -> eyre::Report { LoadError::malformed(&path, reason).into() };

    let mut dyn_bytes = vec![0u8; obj.dynamic_size as usize];
    mem.read(obj.dynamic_addr, &mut dyn_bytes)
        .map_err(|e| malformed(format!("cannot read dynamic segment: {:#}", e)))?;

    let mut strtab_vaddr = EA_UNDEF;
    let mut strsz: ElfPtrSize = 0;
    let mut symtab_vaddr = EA_UNDEF;
    let mut hash_vaddr = EA_UNDEF;
    let mut gnu_hash_vaddr = EA_UNDEF;
    let mut rel_vaddr = EA_UNDEF;
    let mut rel_size: ElfPtrSize = 0;
    let mut rela_vaddr = EA_UNDEF;
    let mut rela_size: ElfPtrSize = 0;
    let mut jmprel_vaddr = EA_UNDEF;
    let mut pltrelsz: ElfPtrSize = 0;
    let mut pltrel_style = RelStyle::Rel;
    let mut pltgot_vaddr = EA_UNDEF;
    let mut needed_indices: Vec<ElfPtrSize> = Vec::new();
    let mut init_vaddr = EA_UNDEF;
    let mut fini_vaddr = EA_UNDEF;
    let mut init_array_vaddr = EA_UNDEF;
    let mut init_array_size: ElfPtrSize = 0;
    let mut fini_array_vaddr = EA_UNDEF;
    let mut fini_array_size: ElfPtrSize = 0;

    for entry in DynIter::new(dyn_bytes) {
        match entry.d_tag {
            DT_STRTAB => strtab_vaddr = entry.d_val,
            DT_STRSZ => strsz = entry.d_val,
            DT_SYMTAB => symtab_vaddr = entry.d_val,
            DT_HASH => hash_vaddr = entry.d_val,
            DT_REL => rel_vaddr = entry.d_val,
            DT_RELSZ => rel_size = entry.d_val,
            DT_RELA => rela_vaddr = entry.d_val,
            DT_RELASZ => rela_size = entry.d_val,
            DT_JMPREL => jmprel_vaddr = entry.d_val,
            DT_PLTRELSZ => pltrelsz = entry.d_val,
            DT_PLTREL => {
                pltrel_style = if entry.d_val == DT_RELA {
                    RelStyle::Rela
                } else {
                    RelStyle::Rel
                }
            }
            DT_PLTGOT => pltgot_vaddr = entry.d_val,
            DT_NEEDED => needed_indices.push(entry.d_val),
            DT_INIT => init_vaddr = entry.d_val,
            DT_FINI => fini_vaddr = entry.d_val,
            DT_INIT_ARRAY => init_array_vaddr = entry.d_val,
            DT_INIT_ARRAYSZ => init_array_size = entry.d_val,
            DT_FINI_ARRAY => fini_array_vaddr = entry.d_val,
            DT_FINI_ARRAYSZ => fini_array_size = entry.d_val,
            DT_SYMBOLIC => obj.symbolic = true,
            DT_TEXTREL => obj.textrel = true,
            DT_BIND_NOW => obj.bind_now = true,
            DT_FLAGS => {
                obj.symbolic |= entry.d_val & DF_SYMBOLIC != 0;
                obj.textrel |= entry.d_val & DF_TEXTREL != 0;
                obj.bind_now |= entry.d_val & DF_BIND_NOW != 0;
            }
            tag if tag == DT_FLAGS_1 => {
                obj.bind_now |= entry.d_val & DF_1_NOW != 0;
                obj.global_ref |= entry.d_val & DF_1_GLOBAL != 0;
                obj.no_delete |= entry.d_val & DF_1_NODELETE != 0;
                obj.no_open |= entry.d_val & DF_1_NOOPEN != 0;
                obj.pie |= entry.d_val & DF_1_PIE != 0;
            }
            tag if tag == DT_GNU_HASH => gnu_hash_vaddr = entry.d_val,
            _ => {}
        }
    }

    if strtab_vaddr == EA_UNDEF || symtab_vaddr == EA_UNDEF {
        return Err(malformed("dynamic segment lacks string/symbol tables".into()));
    }

    // Translate every recorded pointer through the load map, exactly once.
    let strtab_addr = obj.load_map.relocate(strtab_vaddr);
    let symtab_addr = obj.load_map.relocate(symtab_vaddr);
    if pltgot_vaddr != EA_UNDEF {
        obj.pltgot = obj.load_map.relocate(pltgot_vaddr);
    }
    if init_vaddr != EA_UNDEF {
        obj.init = obj.load_map.relocate(init_vaddr);
    }
    if fini_vaddr != EA_UNDEF {
        obj.fini = obj.load_map.relocate(fini_vaddr);
    }
    if init_array_vaddr != EA_UNDEF {
        obj.init_array = obj.load_map.relocate(init_array_vaddr);
        obj.init_array_count = (init_array_size / PTR_BYTES) as usize;
    }
    if fini_array_vaddr != EA_UNDEF {
        obj.fini_array = obj.load_map.relocate(fini_array_vaddr);
        obj.fini_array_count = (fini_array_size / PTR_BYTES) as usize;
    }

    // String table.
    let mut strtab = vec![0u8; strsz as usize];
    mem.read(strtab_addr, &mut strtab)
        .map_err(|e| malformed(format!("cannot read string table: {:#}", e)))?;
    obj.strtab = strtab;

    // Relocation tables.
    if rel_vaddr != EA_UNDEF {
        obj.rel = read_relocs(mem, obj, rel_vaddr, rel_size, RelStyle::Rel, &path)?;
    }
    if rela_vaddr != EA_UNDEF {
        let mut relas = read_relocs(mem, obj, rela_vaddr, rela_size, RelStyle::Rela, &path)?;
        obj.rel.append(&mut relas);
    }
    if jmprel_vaddr != EA_UNDEF {
        obj.plt_rel = read_relocs(mem, obj, jmprel_vaddr, pltrelsz, pltrel_style, &path)?;
        obj.plt_entsize = match pltrel_style {
            RelStyle::Rel => SIZEOF_REL,
            RelStyle::Rela => SIZEOF_RELA,
        };
    }

    // Hash tables; they also bound the symbol table, which has no size tag
    // of its own.
    let mut symcount: usize = 0;
    if hash_vaddr != EA_UNDEF {
        let sysv = read_sysv_hash(mem, obj.load_map.relocate(hash_vaddr), &path)?;
        symcount = symcount.max(sysv.chains.len());
        obj.sysv_hash = Some(sysv);
    }
    if gnu_hash_vaddr != EA_UNDEF {
        let (gnu, highest) = read_gnu_hash(mem, obj.load_map.relocate(gnu_hash_vaddr), &path)?;
        symcount = symcount.max(highest);
        obj.gnu_hash = Some(gnu);
    }
    let highest_ref = obj
        .rel
        .iter()
        .chain(obj.plt_rel.iter())
        .map(|entry| entry.sym as usize + 1)
        .max()
        .unwrap_or(0);
    symcount = symcount.max(highest_ref).max(1);

    // Symbol table.
    let mut sym_bytes = vec![0u8; symcount * SIZEOF_SYM];
    mem.read(symtab_addr, &mut sym_bytes)
        .map_err(|e| malformed(format!("cannot read symbol table: {:#}", e)))?;
    obj.symtab = Vec::with_capacity(symcount);
    let mut offset = 0;
    while offset < sym_bytes.len() {
        let sym: Sym = sym_bytes
            .gread(&mut offset)
            .map_err(|_| malformed("truncated symbol table".into()))?;
        obj.symtab.push(sym);
    }

    // Needed list, in dynamic-section order.
    let needed: Vec<Needed> = needed_indices
        .into_iter()
        .map(|index| Needed {
            name: obj.str_at(index as u32).to_owned(),
            obj: None,
        })
        .collect();
    obj.needed = needed;

    debug!(
        "{}: digested {} symbols, {} relocs, {} plt relocs, {} needed",
        obj.path,
        obj.symtab.len(),
        obj.rel.len(),
        obj.plt_rel.len(),
        obj.needed.len()
    );
    Ok(())
}

const PTR_BYTES: ElfPtrSize = std::mem::size_of::<ElfPtrSize>() as ElfPtrSize;

fn read_relocs<M: MemorySystem>(
    mem: &M,
    obj: &Object,
    vaddr: ElfPtrSize,
    size: ElfPtrSize,
    style: RelStyle,
    path: &str,
) -> Result<Vec<RelocEntry>> {
    let mut bytes = vec![0u8; size as usize];
    mem.read(obj.load_map.relocate(vaddr), &mut bytes)
        .map_err(|e| LoadError::malformed(path, format!("cannot read relocations: {:#}", e)))?;

    let entsize = match style {
        RelStyle::Rel => SIZEOF_REL,
        RelStyle::Rela => SIZEOF_RELA,
    };
    let mut entries = Vec::with_capacity(bytes.len() / entsize);
    let mut offset = 0;
    while offset + entsize <= bytes.len() {
        let entry = match style {
            RelStyle::Rel => {
                let rel: Rel = bytes
                    .gread(&mut offset)
                    .map_err(|_| LoadError::malformed(path, "truncated relocation table"))?;
                RelocEntry {
                    offset: rel.r_offset,
                    sym: r_sym(rel.r_info),
                    rtype: crate::elf::r_type(rel.r_info),
                    addend: None,
                }
            }
            RelStyle::Rela => {
                let rela: Rela = bytes
                    .gread(&mut offset)
                    .map_err(|_| LoadError::malformed(path, "truncated relocation table"))?;
                RelocEntry {
                    offset: rela.r_offset,
                    sym: r_sym(rela.r_info),
                    rtype: crate::elf::r_type(rela.r_info),
                    addend: Some(rela.r_addend as ElfSxword),
                }
            }
        };
        entries.push(entry);
    }
    Ok(entries)
}

fn read_u32s<M: MemorySystem>(mem: &M, addr: ElfPtrSize, count: usize) -> Result<Vec<u32>> {
    let mut bytes = vec![0u8; count * 4];
    mem.read(addr, &mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_ne_bytes(chunk.try_into().unwrap()))
        .collect())
}

fn read_sysv_hash<M: MemorySystem>(
    mem: &M,
    addr: ElfPtrSize,
    path: &str,
) -> Result<SysvHash> {
    let header = read_u32s(mem, addr, 2)
        .map_err(|e| LoadError::malformed(path, format!("cannot read hash table: {:#}", e)))?;
    let (nbucket, nchain) = (header[0] as usize, header[1] as usize);
    let buckets = read_u32s(mem, addr + 8, nbucket)
        .map_err(|e| LoadError::malformed(path, format!("cannot read hash table: {:#}", e)))?;
    let chains = read_u32s(mem, addr + 8 + 4 * nbucket as ElfPtrSize, nchain)
        .map_err(|e| LoadError::malformed(path, format!("cannot read hash table: {:#}", e)))?;
    Ok(SysvHash { buckets, chains })
}

/// Reads a GNU hash table; also returns one past the highest hashed symbol
/// index, found by walking each bucket's chain to its terminator.
fn read_gnu_hash<M: MemorySystem>(
    mem: &M,
    addr: ElfPtrSize,
    path: &str,
) -> Result<(GnuHash, usize)> {
    let whine =
        |e: eyre::Report| LoadError::malformed(path, format!("cannot read GNU hash: {:#}", e));
    let header = read_u32s(mem, addr, 4).map_err(whine)?;
    let (nbuckets, symoffset, bloom_size, bloom_shift) =
        (header[0], header[1], header[2] as usize, header[3]);

    let bloom_addr = addr + 16;
    let mut bloom = Vec::with_capacity(bloom_size);
    for index in 0..bloom_size {
        bloom.push(
            mem.read_ptr(bloom_addr + index as ElfPtrSize * PTR_BYTES)
                .map_err(whine)?,
        );
    }

    let buckets_addr = bloom_addr + bloom_size as ElfPtrSize * PTR_BYTES;
    let buckets = read_u32s(mem, buckets_addr, nbuckets as usize).map_err(whine)?;
    let chains_addr = buckets_addr + 4 * nbuckets as ElfPtrSize;

    // The chain length is implicit: walk every bucket to its end marker.
    let mut highest: usize = 0;
    for &bucket in &buckets {
        if bucket < symoffset {
            continue;
        }
        let mut index = bucket;
        loop {
            let word = read_u32s(mem, chains_addr + 4 * (index - symoffset) as ElfPtrSize, 1)
                .map_err(whine)?[0];
            highest = highest.max(index as usize + 1);
            if word & 1 != 0 {
                break;
            }
            index += 1;
        }
    }
    let chains = if highest > symoffset as usize {
        read_u32s(mem, chains_addr, highest - symoffset as usize).map_err(whine)?
    } else {
        Vec::new()
    };

    Ok((
        GnuHash {
            symoffset,
            bloom_shift,
            bloom,
            buckets,
            chains,
        },
        highest,
    ))
}
