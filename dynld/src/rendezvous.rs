//! Debugger rendezvous: an ordered view of the loaded objects in the shape
//! debuggers expect from the run-time linker's link map.

use crate::elf::ElfPtrSize;
use crate::registry::LinkerState;

/// One link-map node: enough for a debugger to find the object's image and
/// dynamic section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMapEntry {
    /// Runtime address of the first segment (the base displacement anchor).
    pub addr: ElfPtrSize,
    pub name: String,
    /// Runtime address of the dynamic section.
    pub ld: ElfPtrSize,
}

/// Builds the link-map view in load order. Entries appear when an object is
/// inserted and vanish when it is destroyed, so the view always reflects the
/// registry.
pub fn link_maps(state: &LinkerState) -> Vec<LinkMapEntry> {
    state
        .order
        .iter()
        .filter_map(|&id| state.object(id))
        .map(|obj| LinkMapEntry {
            addr: obj
                .load_map
                .segments
                .first()
                .map(|seg| seg.runtime_addr)
                .unwrap_or(0),
            name: obj.path.clone(),
            ld: obj.dynamic_addr,
        })
        .collect()
}
