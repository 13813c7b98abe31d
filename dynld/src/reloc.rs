//! Non-PLT relocation.
//!
//! The relocation variety is a closed set of kinds; each architecture's
//! numeric codes are classified into it up front so the apply loop is
//! machine-independent. Slot accesses go through the memory interface as
//! byte copies, which also covers the misaligned slots compilers emit for
//! packed data.

use eyre::Result;
use log::trace;

use crate::config::{Abi, MachineKind};
use crate::elf::{r_aarch64, r_arm, r_x86_64, st_type, ElfPtrSize, STT_ARM_TFUNC, STT_SECTION};
use crate::error::LoadError;
use crate::fdpic::FuncDesc;
use crate::object::{Object, ObjectId, RelocEntry};
use crate::registry::LinkerState;
use crate::symbols::{find_copy_def, find_symdef, ResolvedSym};
use crate::sys::mem::{MemorySystem, PROT_READ, PROT_WRITE};
use crate::sys::tls::StaticTlsAllocator;
use crate::util::{round_down, round_up};

/// ABI-neutral relocation kinds the loader implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    None,
    Relative,
    Abs,
    JumpSlot,
    Copy,
    Irelative,
    TlsDtpMod,
    TlsDtpOff,
    TlsTpOff,
    FuncDesc,
    FuncDescValue,
}

/// Maps a machine-specific relocation code to its kind. FDPIC descriptor
/// kinds are only recognised for objects on that ABI.
pub fn classify(machine: MachineKind, abi: Abi, rtype: u32) -> Option<RelocKind> {
    let kind = match machine {
        MachineKind::X86_64 => match rtype {
            r_x86_64::NONE => RelocKind::None,
            r_x86_64::R64 | r_x86_64::GLOB_DAT => RelocKind::Abs,
            r_x86_64::JUMP_SLOT => RelocKind::JumpSlot,
            r_x86_64::RELATIVE => RelocKind::Relative,
            r_x86_64::COPY => RelocKind::Copy,
            r_x86_64::IRELATIVE => RelocKind::Irelative,
            r_x86_64::DTPMOD64 => RelocKind::TlsDtpMod,
            r_x86_64::DTPOFF64 => RelocKind::TlsDtpOff,
            r_x86_64::TPOFF64 => RelocKind::TlsTpOff,
            _ => return None,
        },
        MachineKind::Aarch64 => match rtype {
            r_aarch64::NONE => RelocKind::None,
            r_aarch64::ABS64 | r_aarch64::GLOB_DAT => RelocKind::Abs,
            r_aarch64::JUMP_SLOT => RelocKind::JumpSlot,
            r_aarch64::RELATIVE => RelocKind::Relative,
            r_aarch64::COPY => RelocKind::Copy,
            r_aarch64::IRELATIVE => RelocKind::Irelative,
            r_aarch64::TLS_DTPMOD => RelocKind::TlsDtpMod,
            r_aarch64::TLS_DTPREL => RelocKind::TlsDtpOff,
            r_aarch64::TLS_TPREL => RelocKind::TlsTpOff,
            _ => return None,
        },
        MachineKind::Arm => match rtype {
            r_arm::NONE => RelocKind::None,
            r_arm::ABS32 | r_arm::GLOB_DAT => RelocKind::Abs,
            r_arm::JUMP_SLOT => RelocKind::JumpSlot,
            r_arm::RELATIVE => RelocKind::Relative,
            r_arm::COPY => RelocKind::Copy,
            r_arm::IRELATIVE => RelocKind::Irelative,
            r_arm::TLS_DTPMOD32 => RelocKind::TlsDtpMod,
            r_arm::TLS_DTPOFF32 => RelocKind::TlsDtpOff,
            r_arm::TLS_TPOFF32 => RelocKind::TlsTpOff,
            r_arm::FUNCDESC => RelocKind::FuncDesc,
            r_arm::FUNCDESC_VALUE => RelocKind::FuncDescValue,
            _ => return None,
        },
    };
    match kind {
        RelocKind::FuncDesc | RelocKind::FuncDescValue if abi != Abi::Fdpic => None,
        kind => Some(kind),
    }
}

pub struct RelocContext<'a, M: MemorySystem> {
    pub mem: &'a M,
    pub state: &'a mut LinkerState,
    pub tls: &'a mut dyn StaticTlsAllocator,
    pub tcb_size: ElfPtrSize,
}

/// Applies `obj`'s non-PLT relocation array. `obj` has been taken out of
/// its registry slot; the resolver consults the rest of the registry plus
/// this reference.
pub fn relocate_non_plt<M: MemorySystem>(
    ctx: &mut RelocContext<'_, M>,
    obj_id: ObjectId,
    obj: &mut Object,
) -> Result<()> {
    // Size the descriptor array to exactly the FUNCDESC count.
    if obj.abi == Abi::Fdpic {
        let count = obj
            .rel
            .iter()
            .filter(|entry| {
                classify(obj.machine, obj.abi, entry.rtype) == Some(RelocKind::FuncDesc)
            })
            .count();
        obj.descriptors.preallocate(ctx.mem, count)?;
    }

    let textrel_window = obj.textrel;
    if textrel_window {
        protect_text(ctx.mem, obj, true)?;
    }
    let result = apply_entries(ctx, obj_id, obj);
    if textrel_window {
        // The writable window must close even when relocation failed; the
        // caller unwinds the object afterwards.
        protect_text(ctx.mem, obj, false)?;
    }
    result
}

fn apply_entries<M: MemorySystem>(
    ctx: &mut RelocContext<'_, M>,
    obj_id: ObjectId,
    obj: &mut Object,
) -> Result<()> {
    let entries = obj.rel.clone();
    // The resolver is consulted once per symbol index; consecutive entries
    // against the same symbol reuse the result.
    let mut cached: Option<(u32, ResolvedSym)> = None;

    for entry in &entries {
        let kind = classify(obj.machine, obj.abi, entry.rtype).ok_or_else(|| {
            relocation_error(
                obj,
                entry,
                format!("unsupported relocation type {}", entry.rtype),
            )
        })?;
        let slot = obj.load_map.relocate(entry.offset);

        match kind {
            RelocKind::None => {}

            RelocKind::Relative | RelocKind::Irelative => {
                let target = match entry.addend {
                    Some(addend) => addend as ElfPtrSize,
                    None => ctx.mem.read_ptr(slot)?,
                };
                let value = obj.load_map.relocate(target);
                ctx.mem.write_ptr(slot, value)?;
                if kind == RelocKind::Irelative {
                    obj.ifunc_remaining += 1;
                }
                trace!("{}: RELATIVE {:#x} -> {:#x}", obj.path, entry.offset, value);
            }

            RelocKind::Abs | RelocKind::JumpSlot => {
                let resolved = resolve_cached(ctx, obj_id, obj, entry, &mut cached, false)?;
                let value = match resolved {
                    ResolvedSym::Zero => 0,
                    ResolvedSym::Def { obj: def_id, sym } => {
                        let mut value = definition_address(ctx.state, obj_id, obj, def_id, &sym);
                        value = match (kind, entry.addend) {
                            // RELA carries the addend in the record.
                            (_, Some(addend)) => value.wrapping_add(addend as ElfPtrSize),
                            // REL ABS slots carry it in place; JUMP_SLOT
                            // slots hold a stub address, not an addend.
                            (RelocKind::Abs, None) => {
                                value.wrapping_add(ctx.mem.read_ptr(slot)?)
                            }
                            (_, None) => value,
                        };
                        value
                    }
                };
                ctx.mem.write_ptr(slot, value)?;
                trace!(
                    "{}: ABS {} -> {:#x} @ {:#x}",
                    obj.path,
                    obj.symbol_name(entry.sym),
                    value,
                    slot
                );
            }

            RelocKind::Copy => {
                // Only the main program may carry COPY relocations; in a
                // shared object they would shadow the very definition they
                // copy from.
                if obj.is_dynamic {
                    return Err(relocation_error(
                        obj,
                        entry,
                        "unexpected COPY relocation in shared library",
                    )
                    .into());
                }
                apply_copy(ctx, obj_id, obj, entry, slot)?;
            }

            RelocKind::TlsDtpMod => {
                let resolved = resolve_cached(ctx, obj_id, obj, entry, &mut cached, false)?;
                let value = match resolved {
                    ResolvedSym::Zero => 0,
                    ResolvedSym::Def { obj: def_id, sym: _ } => {
                        tls_of(ctx.state, obj_id, obj, def_id, |tls| tls.index as ElfPtrSize)
                            .ok_or_else(|| {
                                relocation_error(obj, entry, "DTPMOD against object without TLS")
                            })?
                    }
                };
                ctx.mem.write_ptr(slot, value)?;
            }

            RelocKind::TlsDtpOff => {
                let resolved = resolve_cached(ctx, obj_id, obj, entry, &mut cached, false)?;
                let value = match resolved {
                    ResolvedSym::Zero => 0,
                    ResolvedSym::Def { sym, .. } => {
                        let addend = entry.addend.unwrap_or(0) as ElfPtrSize;
                        (sym.st_value as ElfPtrSize).wrapping_add(addend)
                    }
                };
                ctx.mem.write_ptr(slot, value)?;
            }

            RelocKind::TlsTpOff => {
                apply_tpoff(ctx, obj_id, obj, entry, slot, &mut cached)?;
            }

            RelocKind::FuncDesc => {
                let resolved = resolve_cached(ctx, obj_id, obj, entry, &mut cached, false)?;
                let value = match resolved {
                    ResolvedSym::Zero => 0,
                    ResolvedSym::Def { obj: def_id, sym } => {
                        let entry_addr =
                            definition_address(ctx.state, obj_id, obj, def_id, &sym);
                        if entry_addr == 0 {
                            0
                        } else {
                            let got = pltgot_of(ctx.state, obj_id, obj, def_id);
                            obj.descriptors.alloc_prealloc(
                                ctx.mem,
                                FuncDesc {
                                    entry: entry_addr,
                                    got,
                                },
                            )?
                        }
                    }
                };
                ctx.mem.write_ptr(slot, value)?;
            }

            RelocKind::FuncDescValue => {
                let resolved = resolve_cached(ctx, obj_id, obj, entry, &mut cached, false)?;
                match resolved {
                    ResolvedSym::Zero => {
                        FuncDesc { entry: 0, got: 0 }.store(ctx.mem, slot)?;
                    }
                    ResolvedSym::Def { obj: def_id, sym } => {
                        let addr = definition_address(ctx.state, obj_id, obj, def_id, &sym);
                        let entry_word = if st_type(sym.st_info) == STT_SECTION {
                            // Section symbols keep the in-place addend.
                            ctx.mem.read_ptr(slot)?.wrapping_add(addr)
                        } else {
                            addr
                        };
                        let got = pltgot_of(ctx.state, obj_id, obj, def_id);
                        FuncDesc {
                            entry: entry_word,
                            got,
                        }
                        .store(ctx.mem, slot)?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Deferred ifunc resolution: after ordinary relocation the slot holds the
/// relocated resolver address; call it and store the answer.
pub fn call_ifuncs<M: MemorySystem>(mem: &M, obj: &mut Object) -> Result<()> {
    if obj.ifunc_remaining == 0 {
        return Ok(());
    }
    for entry in obj.rel.clone() {
        if classify(obj.machine, obj.abi, entry.rtype) != Some(RelocKind::Irelative) {
            continue;
        }
        let slot = obj.load_map.relocate(entry.offset);
        let resolver = mem.read_ptr(slot)?;
        let target = mem.resolve_ifunc(resolver)?;
        mem.write_ptr(slot, target)?;
        trace!("{}: IRELATIVE {:#x} -> {:#x}", obj.path, resolver, target);
    }
    obj.ifunc_remaining = 0;
    mem.code_barrier();
    Ok(())
}

fn apply_copy<M: MemorySystem>(
    ctx: &mut RelocContext<'_, M>,
    obj_id: ObjectId,
    obj: &Object,
    entry: &RelocEntry,
    slot: ElfPtrSize,
) -> Result<()> {
    let name = obj.symbol_name(entry.sym).to_owned();
    let rsym = obj.symbol(entry.sym).copied().unwrap_or_default();
    let (def_id, sym) = match find_copy_def(ctx.state, obj_id, &name) {
        Some(found) => found,
        None if crate::elf::st_bind(rsym.st_info) == crate::elf::STB_WEAK => return Ok(()),
        None => {
            return Err(relocation_error(obj, entry, "unresolved non-weak symbol").into());
        }
    };
    let defobj = ctx
        .state
        .object(def_id)
        .expect("copy definition object is resident");
    let src = defobj.load_map.relocate(sym.st_value as ElfPtrSize);
    let mut buf = vec![0u8; sym.st_size as usize];
    ctx.mem.read(src, &mut buf)?;
    ctx.mem.write(slot, &buf)?;
    trace!(
        "{}: COPY {} ({} bytes) from {}",
        obj.path,
        name,
        sym.st_size,
        defobj.path
    );
    Ok(())
}

fn apply_tpoff<M: MemorySystem>(
    ctx: &mut RelocContext<'_, M>,
    obj_id: ObjectId,
    obj: &mut Object,
    entry: &RelocEntry,
    slot: ElfPtrSize,
    cached: &mut Option<(u32, ResolvedSym)>,
) -> Result<()> {
    let resolved = resolve_cached(ctx, obj_id, obj, entry, cached, false)?;
    let (def_id, sym) = match resolved {
        ResolvedSym::Zero => {
            ctx.mem.write_ptr(slot, 0)?;
            return Ok(());
        }
        ResolvedSym::Def { obj, sym } => (obj, sym),
    };

    // Allocate the defining object's static TLS offset on demand.
    let needs_offset = tls_of(ctx.state, obj_id, obj, def_id, |tls| {
        tls.static_offset.is_none()
    })
    .ok_or_else(|| relocation_error(obj, entry, "TPOFF against object without TLS"))?;
    if needs_offset {
        let (size, align) =
            tls_of(ctx.state, obj_id, obj, def_id, |tls| (tls.size, tls.align)).unwrap();
        let offset = ctx.tls.reserve(size, align)?;
        let def = if def_id == obj_id {
            &mut *obj
        } else {
            ctx.state.object_mut(def_id).expect("defobj is resident")
        };
        def.tls.as_mut().unwrap().static_offset = Some(offset);
    }

    let tls_offset =
        tls_of(ctx.state, obj_id, obj, def_id, |tls| tls.static_offset.unwrap()).unwrap();
    let base = match entry.addend {
        Some(addend) => addend as ElfPtrSize,
        None => ctx.mem.read_ptr(slot)?,
    };
    let value = base
        .wrapping_add(sym.st_value as ElfPtrSize)
        .wrapping_add(tls_offset)
        .wrapping_add(ctx.tcb_size);
    ctx.mem.write_ptr(slot, value)
}

fn resolve_cached<M: MemorySystem>(
    ctx: &RelocContext<'_, M>,
    obj_id: ObjectId,
    obj: &Object,
    entry: &RelocEntry,
    cached: &mut Option<(u32, ResolvedSym)>,
    in_plt: bool,
) -> Result<ResolvedSym> {
    if let Some((symnum, resolved)) = cached {
        if *symnum == entry.sym {
            return Ok(*resolved);
        }
    }
    let resolved = find_symdef(ctx.state, obj_id, obj, entry.sym, in_plt)
        .map_err(|e| relocation_error(obj, entry, format!("{:#}", e)))?;
    *cached = Some((entry.sym, resolved));
    Ok(resolved)
}

/// Runtime address of a resolved definition, honouring the Thumb bit.
pub fn definition_address(
    state: &LinkerState,
    caller_id: ObjectId,
    caller: &Object,
    def_id: ObjectId,
    sym: &crate::elf::sym::Sym,
) -> ElfPtrSize {
    let defobj = if def_id == caller_id {
        caller
    } else {
        state.object(def_id).expect("defining object is resident")
    };
    let mut addr = defobj.load_map.relocate(sym.st_value as ElfPtrSize);
    if defobj.machine == MachineKind::Arm && st_type(sym.st_info) == STT_ARM_TFUNC && addr != 0 {
        addr |= 1;
    }
    addr
}

pub fn pltgot_of(
    state: &LinkerState,
    caller_id: ObjectId,
    caller: &Object,
    def_id: ObjectId,
) -> ElfPtrSize {
    if def_id == caller_id {
        caller.pltgot
    } else {
        state.object(def_id).map(|o| o.pltgot).unwrap_or(0)
    }
}

fn tls_of<R>(
    state: &LinkerState,
    caller_id: ObjectId,
    caller: &Object,
    def_id: ObjectId,
    f: impl FnOnce(&crate::object::TlsInfo) -> R,
) -> Option<R> {
    let defobj = if def_id == caller_id {
        caller
    } else {
        state.object(def_id)?
    };
    defobj.tls.as_ref().map(f)
}

fn relocation_error(obj: &Object, entry: &RelocEntry, reason: impl Into<String>) -> LoadError {
    LoadError::relocation(&obj.path, entry.offset, obj.symbol_name(entry.sym), reason)
}

/// Opens or closes the temporary write window over text segments that a
/// TEXTREL object relocates through.
fn protect_text<M: MemorySystem>(mem: &M, obj: &Object, writable: bool) -> Result<()> {
    let page = mem.page_size();
    for seg in &obj.load_map.segments {
        if seg.prot & PROT_WRITE != 0 {
            continue;
        }
        let prot = if writable {
            seg.prot | PROT_WRITE
        } else {
            seg.prot
        };
        let start = round_down(seg.runtime_addr, page);
        let len = round_up(seg.runtime_addr + seg.memsz, page) - start;
        mem.protect(start, len, prot)?;
    }
    Ok(())
}

/// Seals PT_GNU_RELRO ranges after relocation.
pub fn protect_relro<M: MemorySystem>(mem: &M, obj: &Object) -> Result<()> {
    if obj.relro_size == 0 {
        return Ok(());
    }
    let page = mem.page_size();
    let start = round_down(obj.relro_addr, page);
    let end = round_down(obj.relro_addr + obj.relro_size, page);
    if end > start {
        mem.protect(start, end - start, PROT_READ)?;
    }
    Ok(())
}
