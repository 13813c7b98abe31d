//! The linker's public operations and its locking discipline.
//!
//! All load-time work (mapping, digesting, relocation, open/close) runs
//! under the exclusive registry lock; lazy binding runs under the shared
//! lock so multiple threads can bind different PLT entries concurrently. A
//! load waiting on the exclusive lock thereby waits for in-flight binders
//! to drain.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use eyre::{eyre, Result, WrapErr};
use log::{debug, warn};

use crate::config::LinkerConfig;
use crate::dynamic::digest_dynamic;
use crate::elf::ElfPtrSize;
use crate::error::LoadError;
use crate::fdpic::FuncDesc;
use crate::mapper::map_object;
use crate::object::{Object, ObjectId};
use crate::plt;
use crate::registry::LinkerState;
use crate::reloc::{self, definition_address, RelocContext};
use crate::rendezvous::{link_maps, LinkMapEntry};
use crate::source::ImageSource;
use crate::symbols::lookup_name;
use crate::sys::mem::MemorySystem;
use crate::sys::syspage::{syspage_library_name, NoSyspage, SyspageCatalog};
use crate::sys::tls::{StaticTlsAllocator, StaticTlsPool};

/// How an object is being opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Add the object's DAG to the default lookup scope.
    pub global: bool,
    /// Only succeed if the object is already resident.
    pub no_load: bool,
}

pub type FatalHook = Box<dyn Fn(&str) + Send + Sync>;

pub struct Linker<M: MemorySystem> {
    mem: M,
    config: LinkerConfig,
    catalog: Box<dyn SyspageCatalog>,
    tls: Mutex<Box<dyn StaticTlsAllocator>>,
    state: RwLock<LinkerState>,
    /// Binder-time errors have no useful continuation; this hook receives
    /// the message and is not expected to return.
    fatal: FatalHook,
}

impl<M: MemorySystem> Linker<M> {
    pub fn new(mem: M, config: LinkerConfig) -> Self {
        let tls: Box<dyn StaticTlsAllocator> =
            Box::new(StaticTlsPool::new(config.static_tls_capacity));
        Linker {
            mem,
            config,
            catalog: Box::new(NoSyspage),
            tls: Mutex::new(tls),
            state: RwLock::new(LinkerState::new()),
            fatal: Box::new(|msg| {
                log::error!("{}", msg);
            }),
        }
    }

    pub fn with_catalog(mut self, catalog: Box<dyn SyspageCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal = hook;
        self
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }

    /// Shared-lock view of the registry.
    pub fn with_read<R>(&self, f: impl FnOnce(&LinkerState) -> R) -> R {
        f(&self.state.read().expect("linker state poisoned"))
    }

    /// Exclusive-lock view of the registry.
    pub fn with_write<R>(&self, f: impl FnOnce(&mut LinkerState) -> R) -> R {
        f(&mut self.state.write().expect("linker state poisoned"))
    }

    /// Loads the main program and its dependency graph, relocates
    /// everything and publishes the graph in the global lookup scope.
    pub fn load_main(&self, path: &str) -> Result<ObjectId> {
        let mut state = self.state.write().expect("linker state poisoned");
        if state.main.is_some() {
            return Err(eyre!("main program already loaded"));
        }
        let root = self
            .load_and_relocate(&mut state, path, OpenFlags { global: true, no_load: false }, false)
            .wrap_err_with(|| format!("cannot load \"{}\"", path))?;
        state.main = Some(root);
        for id in state.dependency_closure(root) {
            if let Some(obj) = state.object_mut(id) {
                obj.main_ref = true;
            }
        }
        Ok(root)
    }

    /// Loads a space- or colon-separated list of objects into the main
    /// scope, ahead of needed processing.
    pub fn preload(&self, list: &str) -> Result<()> {
        let mut state = self.state.write().expect("linker state poisoned");
        for path in list.split([' ', ':']).filter(|p| !p.is_empty()) {
            self.load_and_relocate(
                &mut state,
                path,
                OpenFlags { global: true, no_load: false },
                false,
            )
            .wrap_err_with(|| format!("cannot preload \"{}\"", path))?;
            debug!("preloaded \"{}\"", path);
        }
        Ok(())
    }

    /// The `dlopen` shape: load (or find) an object, honouring its load
    /// policy flags.
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<ObjectId> {
        let mut state = self.state.write().expect("linker state poisoned");
        self.load_and_relocate(&mut state, path, flags, true)
            .wrap_err_with(|| format!("cannot open \"{}\"", path))
    }

    /// Drops one reference to `root`'s dependency closure, destroying every
    /// member that reaches zero (unless pinned by NODELETE).
    pub fn close(&self, root: ObjectId) -> Result<()> {
        let mut state = self.state.write().expect("linker state poisoned");
        if state.object(root).is_none() {
            return Err(eyre!("close of unknown object"));
        }
        self.unref_closure(&mut state, root);
        Ok(())
    }

    /// The lazy-binding trampoline target. Resolves the PLT entry at byte
    /// offset `reloff` for the object whose PLTGOT is `pltgot`, rewrites
    /// the slot and returns the call target.
    ///
    /// Binding failures are unrecoverable: the fatal hook is invoked and
    /// the process does not continue.
    pub fn bind(&self, pltgot: ElfPtrSize, reloff: ElfPtrSize) -> FuncDesc {
        let state = self.state.read().expect("linker state poisoned");
        match plt::bind_slot(&self.mem, &state, pltgot, reloff) {
            Ok(desc) => desc,
            Err(e) => {
                let msg = format!("fatal relocation error: {:#}", e);
                (self.fatal)(&msg);
                panic!("{}", msg);
            }
        }
    }

    /// Looks a symbol up in the default scope and returns its defining
    /// object and runtime address.
    pub fn find_symbol(&self, name: &str) -> Option<(ObjectId, ElfPtrSize)> {
        let state = self.state.read().expect("linker state poisoned");
        let (id, sym) = lookup_name(&state, name)?;
        let obj = state.object(id)?;
        Some((id, definition_address(&state, id, obj, id, &sym)))
    }

    /// Materialises a function descriptor for an address at run time (the
    /// address-of / `dladdr` path on FDPIC). The descriptor lives on the
    /// owning object's lazy list.
    pub fn function_descriptor(&self, id: ObjectId, entry: ElfPtrSize) -> Result<ElfPtrSize> {
        let mut state = self.state.write().expect("linker state poisoned");
        let got = state
            .object(id)
            .ok_or_else(|| eyre!("descriptor request for unknown object"))?
            .pltgot;
        let obj = state.object_mut(id).expect("object just looked up");
        obj.descriptors.alloc_lazy(&self.mem, FuncDesc { entry, got })
    }

    /// Debugger view of the loaded objects.
    pub fn link_maps(&self) -> Vec<LinkMapEntry> {
        let state = self.state.read().expect("linker state poisoned");
        link_maps(&state)
    }

    /// Constructor entry points for `root`'s graph, dependencies before
    /// dependents: each object's DT_INIT first, then its init array.
    pub fn init_functions(&self, root: ObjectId) -> Result<Vec<(ObjectId, ElfPtrSize)>> {
        let state = self.state.read().expect("linker state poisoned");
        let mut out = Vec::new();
        for &id in state.dependency_closure(root).iter().rev() {
            let Some(obj) = state.object(id) else {
                continue;
            };
            if obj.init != 0 {
                out.push((id, obj.init));
            }
            for index in 0..obj.init_array_count {
                let slot = obj.init_array + (index as ElfPtrSize) * PTR_BYTES;
                out.push((id, self.mem.read_ptr(slot)?));
            }
        }
        Ok(out)
    }

    // ---- load orchestration ----------------------------------------------

    /// Loads `path` and its needed graph, then relocates every object that
    /// is not yet relocated. On any failure the whole partial graph is
    /// unwound: fresh objects are destroyed, refcounts taken on resident
    /// ones are dropped.
    fn load_and_relocate(
        &self,
        state: &mut LinkerState,
        path: &str,
        flags: OpenFlags,
        dlopen: bool,
    ) -> Result<ObjectId> {
        // Every refcount taken by this operation, in order; `true` marks a
        // freshly created object.
        let mut taken: Vec<(ObjectId, bool)> = Vec::new();

        let result = match self.load_graph(state, path, flags, dlopen, &mut taken) {
            Ok(root) => {
                if flags.global || !dlopen {
                    state.push_global_dag(root);
                }
                self.relocate_graph(state).map(|_| root)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(root) => Ok(root),
            Err(e) => {
                for &(id, created) in taken.iter().rev() {
                    if created {
                        self.destroy_object(state, id);
                    } else if let Some(obj) = state.object_mut(id) {
                        obj.refcount = obj.refcount.saturating_sub(1);
                    }
                }
                Err(e)
            }
        }
    }

    /// Breadth-first needed loading: the registry grows at the tail while
    /// the scan walks towards it, so dependencies land in load order.
    fn load_graph(
        &self,
        state: &mut LinkerState,
        path: &str,
        flags: OpenFlags,
        dlopen: bool,
        taken: &mut Vec<(ObjectId, bool)>,
    ) -> Result<ObjectId> {
        let mut visited: HashSet<ObjectId> = HashSet::new();
        let root = self.load_object(state, path, dlopen, flags.no_load, &mut visited, taken)?;

        let mut queue = vec![root];
        let mut cursor = 0;
        while cursor < queue.len() {
            let id = queue[cursor];
            cursor += 1;

            let names: Vec<String> = state
                .object(id)
                .expect("queued object is resident")
                .needed
                .iter()
                .map(|needed| needed.name.clone())
                .collect();
            for (index, name) in names.iter().enumerate() {
                let already = visited.clone();
                let dep = self
                    .load_object(state, name, false, false, &mut visited, taken)
                    .wrap_err_with(|| format!("loading dependencies of \"{}\"", path))?;
                if let Some(obj) = state.object_mut(id) {
                    obj.needed[index].obj = Some(dep);
                }
                if !already.contains(&dep) {
                    queue.push(dep);
                }

                // A NODELETE dependency pins its whole DAG.
                let pin = state
                    .object(dep)
                    .map(|o| o.no_delete && !o.ref_nodel)
                    .unwrap_or(false);
                if pin {
                    debug!("object {} nodelete", name);
                    for member in state.dependency_closure(dep) {
                        if let Some(obj) = state.object_mut(member) {
                            obj.refcount += 1;
                        }
                    }
                    state.object_mut(dep).unwrap().ref_nodel = true;
                }
            }
        }

        // Record each new object's lookup DAG now that edges are resolved.
        for &(id, created) in taken.iter() {
            if created {
                let dag = state.dependency_closure(id);
                if let Some(obj) = state.object_mut(id) {
                    obj.dag = dag;
                }
            }
        }
        Ok(root)
    }

    /// Loads one object, deduplicating by canonical path and then by
    /// device+inode. A hit within the current operation does not take a
    /// second reference.
    fn load_object(
        &self,
        state: &mut LinkerState,
        name: &str,
        dlopen: bool,
        no_load: bool,
        visited: &mut HashSet<ObjectId>,
        taken: &mut Vec<(ObjectId, bool)>,
    ) -> Result<ObjectId> {
        let source = match self.resolve_name(state, name)? {
            Resolution::Resident(id) => {
                return Ok(self.reference(state, id, visited, taken));
            }
            Resolution::Source(source) => source,
        };

        // Check again with the opened file's identity: multiple links or
        // `..` components must not produce a duplicate object.
        if let Some(id) = state.find_by_path(&source.identity()) {
            return Ok(self.reference(state, id, visited, taken));
        }
        let (dev, ino) = source.dev_ino();
        if let Some(id) = state.find_by_ino(dev, ino) {
            return Ok(self.reference(state, id, visited, taken));
        }

        if no_load {
            return Err(LoadError::Policy {
                path: source.identity(),
            }
            .into());
        }

        // First use of this object: map it in and digest its metadata.
        let mut obj = map_object(&self.mem, &self.config, &source)?;
        if let Err(e) = digest_dynamic(&self.mem, &mut obj) {
            obj.load_map.unmap(&self.mem);
            return Err(e);
        }
        if dlopen && obj.no_open {
            debug!("refusing to load non-loadable \"{}\"", obj.path);
            obj.load_map.unmap(&self.mem);
            return Err(LoadError::Policy { path: obj.path }.into());
        }
        if obj.textrel {
            warn!("{} has impure text", obj.path);
        }
        if let Some(tls) = obj.tls.as_mut() {
            tls.index = state.next_tls_index();
        }
        obj.refcount = 1;

        let id = state.insert_tail(obj);
        visited.insert(id);
        taken.push((id, true));
        debug!("loaded \"{}\"", name);
        Ok(id)
    }

    fn reference(
        &self,
        state: &mut LinkerState,
        id: ObjectId,
        visited: &mut HashSet<ObjectId>,
        taken: &mut Vec<(ObjectId, bool)>,
    ) -> ObjectId {
        if visited.insert(id) {
            if let Some(obj) = state.object_mut(id) {
                obj.refcount += 1;
            }
            taken.push((id, false));
        }
        id
    }

    fn resolve_name(&self, state: &LinkerState, name: &str) -> Result<Resolution> {
        if let Some(id) = state.find_by_path(name) {
            return Ok(Resolution::Resident(id));
        }

        if let Some(libname) = syspage_library_name(name) {
            let program = self
                .catalog
                .find(libname)
                .wrap_err("cannot enumerate syspage programs")?
                .ok_or_else(|| LoadError::NotFound {
                    name: name.to_owned(),
                })?;
            return Ok(Resolution::Source(ImageSource::from_syspage(program)));
        }

        if name.contains('/') {
            return Ok(Resolution::Source(ImageSource::open(name.as_ref())?));
        }
        for dir in &self.config.search_paths {
            let candidate: PathBuf = dir.join(name);
            if candidate.exists() {
                return Ok(Resolution::Source(ImageSource::open(&candidate)?));
            }
        }
        Err(LoadError::NotFound {
            name: name.to_owned(),
        }
        .into())
    }

    /// Relocates, in load order, every object the graph walk left
    /// unrelocated.
    fn relocate_graph(&self, state: &mut LinkerState) -> Result<()> {
        let pending: Vec<ObjectId> = state
            .order
            .iter()
            .copied()
            .filter(|&id| state.object(id).map_or(false, |obj| !obj.relocated))
            .collect();

        for id in pending {
            let mut obj = state.take_object(id).expect("pending object is resident");
            let result = self.relocate_object(state, id, &mut obj);
            state.put_object(id, obj);
            result?;
        }
        Ok(())
    }

    fn relocate_object(
        &self,
        state: &mut LinkerState,
        id: ObjectId,
        obj: &mut Object,
    ) -> Result<()> {
        let mut tls = self.tls.lock().expect("tls allocator poisoned");
        let mut ctx = RelocContext {
            mem: &self.mem,
            state: &mut *state,
            tls: &mut **tls,
            tcb_size: self.config.tcb_size,
        };
        reloc::relocate_non_plt(&mut ctx, id, obj)?;
        drop(ctx);
        drop(tls);

        if obj.bind_now || self.config.bind_now {
            plt::relocate_plt_now(&self.mem, state, id, obj)?;
        } else {
            plt::relocate_plt_lazy(&self.mem, obj)?;
        }
        plt::setup_pltgot(&self.mem, obj, &self.config.bind_start)?;

        reloc::call_ifuncs(&self.mem, obj)?;
        plt::call_plt_ifuncs(&self.mem, obj)?;
        reloc::protect_relro(&self.mem, obj)?;

        obj.relocated = true;
        debug!("relocated \"{}\"", obj.path);
        Ok(())
    }

    // ---- destruction -----------------------------------------------------

    fn unref_closure(&self, state: &mut LinkerState, root: ObjectId) {
        let closure = state.dependency_closure(root);
        let mut dead: Vec<ObjectId> = Vec::new();
        for &id in &closure {
            if let Some(obj) = state.object_mut(id) {
                obj.refcount = obj.refcount.saturating_sub(1);
                if obj.refcount == 0 && !obj.no_delete {
                    dead.push(id);
                }
            }
        }

        // Destroy in reverse load order.
        let position: std::collections::HashMap<ObjectId, usize> = state
            .order
            .iter()
            .copied()
            .enumerate()
            .map(|(index, id)| (id, index))
            .collect();
        dead.sort_by_key(|id| std::cmp::Reverse(position.get(id).copied().unwrap_or(0)));
        for id in dead {
            self.destroy_object(state, id);
        }
    }

    /// Unmaps segments, frees the descriptor arena and releases the static
    /// TLS reservation of a dead object.
    fn destroy_object(&self, state: &mut LinkerState, id: ObjectId) {
        let Some(mut obj) = state.remove(id) else {
            return;
        };
        debug!("destroying \"{}\"", obj.path);
        obj.descriptors.free(&self.mem);
        if let Some(tls) = obj.tls.as_ref() {
            if let Some(offset) = tls.static_offset {
                let mut alloc = self.tls.lock().expect("tls allocator poisoned");
                alloc.release(offset, tls.size);
            }
        }
        obj.load_map.unmap(&self.mem);
    }
}

const PTR_BYTES: ElfPtrSize = std::mem::size_of::<ElfPtrSize>() as ElfPtrSize;

enum Resolution {
    Resident(ObjectId),
    Source(ImageSource),
}
