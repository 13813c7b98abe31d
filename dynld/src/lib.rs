//! Dynamic shared-object loader and runtime relocator for ELF systems with
//! MMU and NOMMU (FDPIC) targets.
//!
//! The loader maps the objects named by an executable's needed-library
//! list, digests their dynamic linking metadata, resolves symbols across
//! the load-order graph and applies relocations, either eagerly or through
//! a lazy procedure-linkage-table binder. On FDPIC targets it additionally
//! owns each object's function-descriptor storage.

pub mod config;
pub mod dynamic;
pub mod elf;
pub mod error;
pub mod fdpic;
pub mod linker;
pub mod load_map;
pub mod mapper;
pub mod object;
pub mod plt;
pub mod registry;
pub mod reloc;
pub mod rendezvous;
pub mod source;
pub mod symbols;
pub mod sys;
#[cfg(test)]
pub mod test_utils;
mod util;

pub use crate::config::{Abi, LinkerConfig, MachineKind};
pub use crate::elf::ElfPtrSize;
pub use crate::error::{load_error, LoadError};
pub use crate::fdpic::FuncDesc;
pub use crate::linker::{Linker, OpenFlags};
pub use crate::object::ObjectId;
