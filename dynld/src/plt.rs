//! PLT relocation and the lazy binder.
//!
//! Under lazy binding (the default) the PLTGOT trampoline words are primed
//! with the in-linker binder and every PLT slot is run through the object's
//! base displacement, so unresolved slots point at the object's own PLT
//! stubs. The first call through such a stub lands in [`bind_slot`], which
//! resolves the symbol and rewrites the slot; later calls go straight to
//! the target.

use eyre::{eyre, Result};
use log::trace;

use crate::config::Abi;
use crate::elf::{st_type, ElfPtrSize, STT_GNU_IFUNC};
use crate::error::LoadError;
use crate::fdpic::{FuncDesc, PTR_SIZE};
use crate::object::{Object, ObjectId};
use crate::registry::LinkerState;
use crate::reloc::{classify, definition_address, pltgot_of, RelocKind};
use crate::symbols::{find_symdef, ResolvedSym};
use crate::sys::mem::MemorySystem;

/// Primes the PLTGOT trampoline words. Done under both binding modes:
/// a later `dlopen` may introduce PLT entries that still bind lazily.
pub fn setup_pltgot<M: MemorySystem>(
    mem: &M,
    obj: &Object,
    bind_start: &FuncDesc,
) -> Result<()> {
    if obj.pltgot == 0 {
        return Ok(());
    }
    mem.write_ptr(obj.pltgot, bind_start.entry)?;
    mem.write_ptr(obj.pltgot + PTR_SIZE, bind_start.got)?;
    Ok(())
}

fn expect_plt_kind(obj: &Object, rtype: u32, offset: ElfPtrSize) -> Result<RelocKind> {
    match classify(obj.machine, obj.abi, rtype) {
        Some(kind @ (RelocKind::JumpSlot | RelocKind::Irelative | RelocKind::FuncDescValue)) => {
            Ok(kind)
        }
        _ => Err(LoadError::relocation(
            &obj.path,
            offset,
            "",
            format!("unexpected relocation type {} in PLT", rtype),
        )
        .into()),
    }
}

/// Lazy path: leave every slot unresolved but displace it to the object's
/// own PLT stub.
pub fn relocate_plt_lazy<M: MemorySystem>(mem: &M, obj: &mut Object) -> Result<()> {
    for entry in obj.plt_rel.clone().iter().rev() {
        let kind = expect_plt_kind(obj, entry.rtype, entry.offset)?;
        let slot = obj.load_map.relocate(entry.offset);

        if kind == RelocKind::Irelative {
            obj.ifunc_remaining_plt += 1;
        }
        if kind == RelocKind::FuncDescValue {
            mem.write_ptr(slot + PTR_SIZE, obj.pltgot)?;
        }

        // Just relocate the GOT slot pointing into the PLT.
        let stub = obj.load_map.relocate(mem.read_ptr(slot)?);
        mem.write_ptr(slot, stub)?;
        trace!("{}: plt fixup @ {:#x} -> {:#x}", obj.path, slot, stub);
    }
    Ok(())
}

/// Immediate binding: resolve every PLT entry as an ordinary jump slot.
pub fn relocate_plt_now<M: MemorySystem>(
    mem: &M,
    state: &LinkerState,
    obj_id: ObjectId,
    obj: &mut Object,
) -> Result<()> {
    let mut cached: Option<(u32, ResolvedSym)> = None;
    for entry in obj.plt_rel.clone() {
        expect_plt_kind(obj, entry.rtype, entry.offset)?;

        let resolved = match cached {
            Some((symnum, resolved)) if symnum == entry.sym => resolved,
            _ => {
                let resolved = find_symdef(state, obj_id, obj, entry.sym, true).map_err(|e| {
                    LoadError::relocation(
                        &obj.path,
                        entry.offset,
                        obj.symbol_name(entry.sym),
                        format!("{:#}", e),
                    )
                })?;
                cached = Some((entry.sym, resolved));
                resolved
            }
        };
        let (def_id, sym) = match resolved {
            // Unresolved weak: leave the slot alone.
            ResolvedSym::Zero => continue,
            ResolvedSym::Def { obj, sym } => (obj, sym),
        };

        let slot = obj.load_map.relocate(entry.offset);
        let mut target = definition_address(state, obj_id, obj, def_id, &sym);
        if st_type(sym.st_info) == STT_GNU_IFUNC {
            target = mem.resolve_ifunc(target)?;
        }
        if obj.abi == Abi::Fdpic {
            FuncDesc {
                entry: target,
                got: pltgot_of(state, obj_id, obj, def_id),
            }
            .store(mem, slot)?;
        } else {
            mem.write_ptr(slot, target)?;
        }
    }
    mem.code_barrier();
    Ok(())
}

/// Resolves the IRELATIVE entries the lazy pass counted: their slots hold
/// relocated resolver addresses by now.
pub fn call_plt_ifuncs<M: MemorySystem>(mem: &M, obj: &mut Object) -> Result<()> {
    if obj.ifunc_remaining_plt == 0 {
        return Ok(());
    }
    for entry in obj.plt_rel.clone() {
        if classify(obj.machine, obj.abi, entry.rtype) != Some(RelocKind::Irelative) {
            continue;
        }
        let slot = obj.load_map.relocate(entry.offset);
        let resolver = mem.read_ptr(slot)?;
        let target = mem.resolve_ifunc(resolver)?;
        mem.write_ptr(slot, target)?;
    }
    obj.ifunc_remaining_plt = 0;
    mem.code_barrier();
    Ok(())
}

/// The binder: called from the trampoline with the caller's PLTGOT identity
/// and the byte offset of the relocation inside the PLT-relocation array.
/// Resolves the target, rewrites the slot and returns the target for the
/// stub to tail-call.
pub fn bind_slot<M: MemorySystem>(
    mem: &M,
    state: &LinkerState,
    pltgot: ElfPtrSize,
    reloff: ElfPtrSize,
) -> Result<FuncDesc> {
    let obj_id = state
        .find_by_pltgot(pltgot)
        .ok_or_else(|| eyre!("bind: no object with PLTGOT {:#x}", pltgot))?;
    let obj = state.object(obj_id).expect("binder caller is resident");

    let index = reloff as usize / obj.plt_entsize.max(1);
    let entry = *obj
        .plt_rel
        .get(index)
        .ok_or_else(|| eyre!("{}: bind: relocation offset {:#x} out of range", obj.path, reloff))?;
    expect_plt_kind(obj, entry.rtype, entry.offset)?;

    let resolved = find_symdef(state, obj_id, obj, entry.sym, true).map_err(|e| {
        eyre!(
            "{}: cannot bind \"{}\": {:#}",
            obj.path,
            obj.symbol_name(entry.sym),
            e
        )
    })?;
    let (def_id, sym) = match resolved {
        ResolvedSym::Zero => return Ok(FuncDesc { entry: 0, got: 0 }),
        ResolvedSym::Def { obj, sym } => (obj, sym),
    };

    let slot = obj.load_map.relocate(entry.offset);
    let mut target = definition_address(state, obj_id, obj, def_id, &sym);
    if st_type(sym.st_info) == STT_GNU_IFUNC {
        target = mem.resolve_ifunc(target)?;
    }

    let desc = FuncDesc {
        entry: target,
        got: pltgot_of(state, obj_id, obj, def_id),
    };
    if obj.abi == Abi::Fdpic {
        desc.store(mem, slot)?;
    } else {
        mem.write_ptr(slot, target)?;
    }
    // The caller's instruction stream must observe the rewritten slot.
    mem.code_barrier();

    trace!(
        "{}: bound {} -> {:#x}",
        obj.path,
        obj.symbol_name(entry.sym),
        target
    );
    Ok(desc)
}
