use std::path::PathBuf;

use crate::elf::ElfPtrSize;
use crate::fdpic::FuncDesc;

/// Relocation numbering understood by the relocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineKind {
    X86_64,
    Aarch64,
    Arm,
}

/// How segments are placed and what a function pointer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    /// All segments share one base displacement; a function pointer is an
    /// entry address.
    Direct,
    /// Segments are placed independently; a function pointer is an
    /// `{entry, got}` descriptor.
    Fdpic,
}

#[derive(Debug, Clone)]
pub struct MachineSpec {
    /// `e_machine` value accepted by the mapper.
    pub machine: u16,
    pub kind: MachineKind,
    pub abi: Abi,
}

pub struct LinkerConfig {
    /// Directories searched for needed names without a `/`.
    pub search_paths: Vec<PathBuf>,
    /// Resolve every PLT entry at load time regardless of object flags.
    pub bind_now: bool,
    /// Accepted machine set; the first entry is the native one.
    pub machines: Vec<MachineSpec>,
    /// Size of the thread control block, added to static TLS offsets.
    pub tcb_size: ElfPtrSize,
    /// Capacity handed to the static TLS allocator.
    pub static_tls_capacity: ElfPtrSize,
    /// Entry/GOT of the in-linker trampoline primed into each PLTGOT.
    pub bind_start: FuncDesc,
}

impl LinkerConfig {
    pub fn machine_spec(&self, e_machine: u16) -> Option<&MachineSpec> {
        self.machines.iter().find(|m| m.machine == e_machine)
    }
}

impl Default for LinkerConfig {
    fn default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                let native = MachineSpec {
                    machine: crate::elf::EM_X86_64,
                    kind: MachineKind::X86_64,
                    abi: Abi::Direct,
                };
            } else if #[cfg(target_arch = "aarch64")] {
                let native = MachineSpec {
                    machine: crate::elf::EM_AARCH64,
                    kind: MachineKind::Aarch64,
                    abi: Abi::Direct,
                };
            } else {
                let native = MachineSpec {
                    machine: crate::elf::EM_ARM,
                    kind: MachineKind::Arm,
                    abi: Abi::Direct,
                };
            }
        }
        LinkerConfig {
            search_paths: vec![PathBuf::from("/lib"), PathBuf::from("/usr/lib")],
            bind_now: false,
            machines: vec![native],
            tcb_size: 2 * std::mem::size_of::<ElfPtrSize>() as ElfPtrSize,
            static_tls_capacity: 0x1000,
            bind_start: FuncDesc { entry: 0, got: 0 },
        }
    }
}
