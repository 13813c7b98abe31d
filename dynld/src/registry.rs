//! Process-wide linker state: the load-order registry and the global lookup
//! list. All mutation happens under the linker's exclusive lock; the lazy
//! binder only ever reads.

use std::collections::HashSet;

use crate::elf::ElfPtrSize;
use crate::object::{Object, ObjectId};

#[derive(Default)]
pub struct LinkerState {
    /// Slot per ever-assigned id; destroyed objects leave a hole so ids
    /// stay stable.
    objects: Vec<Option<Object>>,
    /// Load order; head is the main program, tail the most recent load.
    pub order: Vec<ObjectId>,
    /// Default symbol-lookup scope, in load order.
    pub global: Vec<ObjectId>,
    pub main: Option<ObjectId>,

    /// Per-process TLS module bookkeeping.
    pub tls_max_index: usize,
    pub tls_dtv_generation: u64,
}

impl LinkerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tail(&mut self, obj: Object) -> ObjectId {
        let id = ObjectId(self.objects.len());
        self.objects.push(Some(obj));
        self.order.push(id);
        id
    }

    pub fn object(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(id.0).and_then(|slot| slot.as_ref())
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(id.0).and_then(|slot| slot.as_mut())
    }

    /// Temporarily removes an object so it can be mutated while the rest of
    /// the registry is consulted. Must be paired with [`Self::put_object`].
    pub fn take_object(&mut self, id: ObjectId) -> Option<Object> {
        self.objects.get_mut(id.0).and_then(|slot| slot.take())
    }

    pub fn put_object(&mut self, id: ObjectId, obj: Object) {
        self.objects[id.0] = Some(obj);
    }

    pub fn find_by_path(&self, path: &str) -> Option<ObjectId> {
        self.order
            .iter()
            .copied()
            .find(|&id| self.object(id).map_or(false, |obj| obj.path == path))
    }

    pub fn find_by_ino(&self, dev: u64, ino: u64) -> Option<ObjectId> {
        if (dev, ino) == (0, 0) {
            return None;
        }
        self.order.iter().copied().find(|&id| {
            self.object(id)
                .map_or(false, |obj| obj.dev == dev && obj.ino == ino)
        })
    }

    /// Objects whose PLTGOT matches; used by the binder to identify the
    /// caller from the value its stub passed in.
    pub fn find_by_pltgot(&self, pltgot: ElfPtrSize) -> Option<ObjectId> {
        self.order.iter().copied().find(|&id| {
            self.object(id)
                .map_or(false, |obj| obj.pltgot != 0 && obj.pltgot == pltgot)
        })
    }

    /// Adds the dependency DAG of `root` to the global lookup scope. The
    /// walk is depth-first with duplicates skipped; the list itself is kept
    /// in load order, which is what symbol lookup scans.
    pub fn push_global_dag(&mut self, root: ObjectId) {
        let mut stack = vec![root];
        let mut seen: HashSet<ObjectId> = self.global.iter().copied().collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            self.global.push(id);
            if let Some(obj) = self.object_mut(id) {
                obj.global_ref = true;
            }
            if let Some(obj) = self.object(id) {
                // Depth-first: push children in reverse so the first needed
                // entry is visited first.
                for needed in obj.needed.iter().rev() {
                    if let Some(dep) = needed.obj {
                        stack.push(dep);
                    }
                }
            }
        }

        let position: std::collections::HashMap<ObjectId, usize> = self
            .order
            .iter()
            .copied()
            .enumerate()
            .map(|(index, id)| (id, index))
            .collect();
        self.global
            .sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));
    }

    /// The set of objects reachable from `root` over needed edges,
    /// de-duplicated, in breadth-first order starting at the root.
    pub fn dependency_closure(&self, root: ObjectId) -> Vec<ObjectId> {
        let mut closure = vec![root];
        let mut seen: HashSet<ObjectId> = closure.iter().copied().collect();
        let mut cursor = 0;
        while cursor < closure.len() {
            let id = closure[cursor];
            cursor += 1;
            if let Some(obj) = self.object(id) {
                for needed in &obj.needed {
                    if let Some(dep) = needed.obj {
                        if seen.insert(dep) {
                            closure.push(dep);
                        }
                    }
                }
            }
        }
        closure
    }

    /// Drops a destroyed object from every list. The slot stays occupied by
    /// `None` so other ids remain stable.
    pub fn remove(&mut self, id: ObjectId) -> Option<Object> {
        let obj = self.objects.get_mut(id.0).and_then(|slot| slot.take())?;
        self.order.retain(|&o| o != id);
        self.global.retain(|&o| o != id);
        if self.main == Some(id) {
            self.main = None;
        }
        Some(obj)
    }

    pub fn next_tls_index(&mut self) -> usize {
        self.tls_dtv_generation += 1;
        self.tls_max_index += 1;
        self.tls_max_index
    }
}
