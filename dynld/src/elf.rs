//! ELF definitions at the host word size.
//!
//! The loader only ever maps objects of its own class, so the width is
//! fixed at compile time and the goblin modules for that width are
//! re-exported as `crate::elf::*`. A few numeric constants the width
//! modules do not carry (FDPIC relocation codes, architecture-specific
//! program headers, dynamic flag masks) live here.

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        pub use goblin::elf64::{dynamic, header, program_header, reloc, sym};

        pub type ElfPtrSize = u64;
        pub type ElfSxword = i64;

        pub const SIZEOF_SYM: usize = 24;
        pub const SIZEOF_REL: usize = 16;
        pub const SIZEOF_RELA: usize = 24;
        pub const SIZEOF_DYN: usize = 16;

        /// Symbol index of a relocation `r_info`.
        pub fn r_sym(info: ElfPtrSize) -> u32 {
            (info >> 32) as u32
        }

        /// Relocation type of a relocation `r_info`.
        pub fn r_type(info: ElfPtrSize) -> u32 {
            (info & 0xffff_ffff) as u32
        }

        pub fn r_info(sym: u32, rtype: u32) -> ElfPtrSize {
            ((sym as u64) << 32) | rtype as u64
        }
    } else {
        pub use goblin::elf32::{dynamic, header, program_header, reloc, sym};

        pub type ElfPtrSize = u32;
        pub type ElfSxword = i32;

        pub const SIZEOF_SYM: usize = 16;
        pub const SIZEOF_REL: usize = 8;
        pub const SIZEOF_RELA: usize = 12;
        pub const SIZEOF_DYN: usize = 8;

        /// Symbol index of a relocation `r_info`.
        pub fn r_sym(info: ElfPtrSize) -> u32 {
            info >> 8
        }

        /// Relocation type of a relocation `r_info`.
        pub fn r_type(info: ElfPtrSize) -> u32 {
            info & 0xff
        }

        pub fn r_info(sym: u32, rtype: u32) -> ElfPtrSize {
            (sym << 8) | (rtype & 0xff)
        }
    }
}

/// "Undefined" virtual address marker used before a field is filled in.
pub const EA_UNDEF: ElfPtrSize = !0;

// e_ident[EI_DATA] values.
pub const ELFDATA2LSB: u8 = 1;
pub const ELFDATA2MSB: u8 = 2;

#[cfg(target_endian = "little")]
pub const ELFDATA_HOST: u8 = ELFDATA2LSB;
#[cfg(target_endian = "big")]
pub const ELFDATA_HOST: u8 = ELFDATA2MSB;

// Machine ids consulted by the mapper's target set.
pub const EM_ARM: u16 = 40;
pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

// Object file types.
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

/// ARM unwind-index table segment.
pub const PT_ARM_EXIDX: u32 = 0x7000_0001;

pub const DT_FLAGS: ElfPtrSize = 30;
pub const DT_GNU_HASH: ElfPtrSize = 0x6fff_fef5;

// DT_FLAGS bits.
pub const DF_SYMBOLIC: ElfPtrSize = 0x2;
pub const DF_TEXTREL: ElfPtrSize = 0x4;
pub const DF_BIND_NOW: ElfPtrSize = 0x8;

// DT_FLAGS_1 bits.
pub const DT_FLAGS_1: ElfPtrSize = 0x6fff_fffb;
pub const DF_1_NOW: ElfPtrSize = 0x1;
pub const DF_1_GLOBAL: ElfPtrSize = 0x2;
pub const DF_1_NODELETE: ElfPtrSize = 0x8;
pub const DF_1_NOOPEN: ElfPtrSize = 0x40;
pub const DF_1_PIE: ElfPtrSize = 0x0800_0000;

// Symbol binding and type; the helpers mirror the ELF_ST_* macros.
pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

pub const STT_FUNC: u8 = 2;
pub const STT_SECTION: u8 = 3;
pub const STT_GNU_IFUNC: u8 = 10;
/// Old ARM marker for Thumb entry points (`STT_LOPROC`).
pub const STT_ARM_TFUNC: u8 = 13;

pub const SHN_UNDEF: u16 = 0;

pub fn st_bind(info: u8) -> u8 {
    info >> 4
}

pub fn st_type(info: u8) -> u8 {
    info & 0xf
}

pub fn st_info(bind: u8, typ: u8) -> u8 {
    (bind << 4) | (typ & 0xf)
}

// Relocation codes, by machine. Names follow the ABI documents; only the
// kinds the relocator implements are listed.
pub mod r_x86_64 {
    pub const NONE: u32 = 0;
    pub const R64: u32 = 1;
    pub const COPY: u32 = 5;
    pub const GLOB_DAT: u32 = 6;
    pub const JUMP_SLOT: u32 = 7;
    pub const RELATIVE: u32 = 8;
    pub const DTPMOD64: u32 = 16;
    pub const DTPOFF64: u32 = 17;
    pub const TPOFF64: u32 = 18;
    pub const IRELATIVE: u32 = 37;
}

pub mod r_aarch64 {
    pub const NONE: u32 = 0;
    pub const ABS64: u32 = 257;
    pub const COPY: u32 = 1024;
    pub const GLOB_DAT: u32 = 1025;
    pub const JUMP_SLOT: u32 = 1026;
    pub const RELATIVE: u32 = 1027;
    pub const TLS_DTPMOD: u32 = 1028;
    pub const TLS_DTPREL: u32 = 1029;
    pub const TLS_TPREL: u32 = 1030;
    pub const IRELATIVE: u32 = 1032;
}

pub mod r_arm {
    pub const NONE: u32 = 0;
    pub const ABS32: u32 = 2;
    pub const TLS_DTPMOD32: u32 = 17;
    pub const TLS_DTPOFF32: u32 = 18;
    pub const TLS_TPOFF32: u32 = 19;
    pub const COPY: u32 = 20;
    pub const GLOB_DAT: u32 = 21;
    pub const JUMP_SLOT: u32 = 22;
    pub const RELATIVE: u32 = 23;
    pub const IRELATIVE: u32 = 160;
    // ARM FDPIC ABI v1.0.
    pub const FUNCDESC: u32 = 163;
    pub const FUNCDESC_VALUE: u32 = 164;
}
