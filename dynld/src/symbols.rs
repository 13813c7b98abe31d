//! Symbol resolution across the loaded-object graph.
//!
//! Each object carries whichever hash tables its dynamic section advertised;
//! lookups prefer the GNU table. The cross-object scan walks the global list
//! in load order, biased to the caller's own object under DT_SYMBOLIC, and
//! falls back to the best weak definition seen.

use eyre::{eyre, Result};

use crate::elf::sym::Sym;
use crate::elf::{
    st_bind, st_type, ElfPtrSize, SHN_UNDEF, STB_GLOBAL, STB_LOCAL, STB_WEAK, STT_ARM_TFUNC,
    STT_FUNC, STT_GNU_IFUNC, STT_SECTION,
};
use crate::object::{Object, ObjectId};
use crate::registry::LinkerState;

/// Classic SysV `DT_HASH` table. Entries are 32-bit words in both classes.
#[derive(Debug, Clone)]
pub struct SysvHash {
    pub buckets: Vec<u32>,
    pub chains: Vec<u32>,
}

impl SysvHash {
    pub fn lookup(&self, obj: &Object, name: &str) -> Option<u32> {
        if self.buckets.is_empty() {
            return None;
        }
        let mut index = self.buckets[elf_hash(name) as usize % self.buckets.len()];
        while index != 0 {
            if obj.symbol_name(index) == name {
                return Some(index);
            }
            index = *self.chains.get(index as usize)?;
        }
        None
    }
}

/// `DT_GNU_HASH` table: bloom filter plus sorted chains.
#[derive(Debug, Clone)]
pub struct GnuHash {
    pub symoffset: u32,
    pub bloom_shift: u32,
    pub bloom: Vec<ElfPtrSize>,
    pub buckets: Vec<u32>,
    pub chains: Vec<u32>,
}

impl GnuHash {
    pub fn lookup(&self, obj: &Object, name: &str) -> Option<u32> {
        if self.buckets.is_empty() || self.bloom.is_empty() {
            return None;
        }
        let hash = gnu_hash(name);
        let bits = ElfPtrSize::BITS;
        let word = self.bloom[(hash / bits) as usize % self.bloom.len()];
        let mask: ElfPtrSize =
            (1 as ElfPtrSize) << (hash % bits) | (1 as ElfPtrSize) << ((hash >> self.bloom_shift) % bits);
        if word & mask != mask {
            return None;
        }

        let mut index = self.buckets[hash as usize % self.buckets.len()];
        if index < self.symoffset {
            return None;
        }
        loop {
            let chain_hash = *self.chains.get((index - self.symoffset) as usize)?;
            if chain_hash | 1 == hash | 1 && obj.symbol_name(index) == name {
                return Some(index);
            }
            if chain_hash & 1 != 0 {
                return None;
            }
            index += 1;
        }
    }
}

pub fn elf_hash(name: &str) -> u32 {
    let mut hash: u32 = 0;
    for byte in name.bytes() {
        hash = (hash << 4).wrapping_add(byte as u32);
        let high = hash & 0xf000_0000;
        if high != 0 {
            hash ^= high >> 24;
        }
        hash &= !high;
    }
    hash
}

pub fn gnu_hash(name: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in name.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    hash
}

/// Outcome of a resolution request.
#[derive(Clone, Copy)]
pub enum ResolvedSym {
    Def { obj: ObjectId, sym: Sym },
    /// The reserved sentinel for weak references that went unresolved:
    /// relocations consuming it write a null slot without failing the load.
    Zero,
}

fn eligible(sym: &Sym, in_plt: bool) -> bool {
    if sym.st_shndx as u16 == SHN_UNDEF {
        return false;
    }
    let bind = st_bind(sym.st_info);
    if bind != STB_GLOBAL && bind != STB_WEAK {
        return false;
    }
    if in_plt {
        // PLT lookups only accept things that can be called.
        matches!(st_type(sym.st_info), 0 | STT_FUNC | STT_GNU_IFUNC | STT_ARM_TFUNC)
    } else {
        true
    }
}

/// Hash lookup within one object, honouring the eligibility rules.
pub fn find_in_object(obj: &Object, name: &str, in_plt: bool) -> Option<Sym> {
    let index = match (&obj.gnu_hash, &obj.sysv_hash) {
        (Some(gnu), _) => gnu.lookup(obj, name),
        (None, Some(sysv)) => sysv.lookup(obj, name),
        (None, None) => None,
    }?;
    let sym = *obj.symbol(index)?;
    eligible(&sym, in_plt).then_some(sym)
}

/// `find_sym`: scan for a definition of `name` on behalf of `caller`.
///
/// A DT_SYMBOLIC caller is searched first; then the global list in load
/// order. A global definition wins immediately; a weak one is remembered and
/// returned only if nothing stronger shows up.
pub fn find_sym(
    state: &LinkerState,
    caller_id: ObjectId,
    caller: &Object,
    name: &str,
    in_plt: bool,
) -> Option<(ObjectId, Sym)> {
    let mut weak: Option<(ObjectId, Sym)> = None;

    let mut consider = |id: ObjectId, obj: &Object, weak: &mut Option<(ObjectId, Sym)>| {
        match find_in_object(obj, name, in_plt) {
            Some(sym) if st_bind(sym.st_info) == STB_GLOBAL => Some((id, sym)),
            Some(sym) => {
                weak.get_or_insert((id, sym));
                None
            }
            None => None,
        }
    };

    if caller.symbolic {
        if let Some(found) = consider(caller_id, caller, &mut weak) {
            return Some(found);
        }
    }
    // The global scope first, then the caller's own dependency DAG (for
    // objects opened outside the global scope).
    for &id in state.global.iter().chain(caller.dag.iter()) {
        let obj = if id == caller_id {
            caller
        } else {
            match state.object(id) {
                Some(obj) => obj,
                None => continue,
            }
        };
        if let Some(found) = consider(id, obj, &mut weak) {
            return Some(found);
        }
    }
    weak
}

/// Resolves the symbol referenced by relocation symbol index `symnum` of
/// `caller`, with the per-ABI rules of the relocator:
/// local and section symbols bind to the caller itself, everything else goes
/// through the global scan, and an unresolved weak reference yields the zero
/// sentinel.
pub fn find_symdef(
    state: &LinkerState,
    caller_id: ObjectId,
    caller: &Object,
    symnum: u32,
    in_plt: bool,
) -> Result<ResolvedSym> {
    let rsym = *caller
        .symbol(symnum)
        .ok_or_else(|| eyre!("relocation references symbol {} out of range", symnum))?;

    if st_bind(rsym.st_info) == STB_LOCAL || st_type(rsym.st_info) == STT_SECTION {
        return Ok(ResolvedSym::Def {
            obj: caller_id,
            sym: rsym,
        });
    }

    let name = caller.str_at(rsym.st_name);
    match find_sym(state, caller_id, caller, name, in_plt) {
        Some((obj, sym)) => Ok(ResolvedSym::Def { obj, sym }),
        None if st_bind(rsym.st_info) == STB_WEAK => Ok(ResolvedSym::Zero),
        None => Err(eyre!("unresolved non-weak symbol \"{}\"", name)),
    }
}

/// Definition lookup for a COPY relocation in the main program: the source
/// must come from a library, so the main object itself is skipped.
pub fn find_copy_def(
    state: &LinkerState,
    skip: ObjectId,
    name: &str,
) -> Option<(ObjectId, Sym)> {
    let mut weak: Option<(ObjectId, Sym)> = None;
    for &id in &state.global {
        if id == skip {
            continue;
        }
        let obj = match state.object(id) {
            Some(obj) => obj,
            None => continue,
        };
        if let Some(sym) = find_in_object(obj, name, false) {
            if st_bind(sym.st_info) == STB_GLOBAL {
                return Some((id, sym));
            }
            weak.get_or_insert((id, sym));
        }
    }
    weak
}

/// Name lookup over the whole global scope (the `dlsym(RTLD_DEFAULT)`
/// shape): load order, weak fallback, no caller bias.
pub fn lookup_name(state: &LinkerState, name: &str) -> Option<(ObjectId, Sym)> {
    let mut weak: Option<(ObjectId, Sym)> = None;
    for &id in &state.global {
        let obj = match state.object(id) {
            Some(obj) => obj,
            None => continue,
        };
        if let Some(sym) = find_in_object(obj, name, false) {
            if st_bind(sym.st_info) == STB_GLOBAL {
                return Some((id, sym));
            }
            weak.get_or_insert((id, sym));
        }
    }
    weak
}
