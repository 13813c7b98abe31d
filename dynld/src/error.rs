//! Error kinds surfaced by the loader.
//!
//! Fallible operations return `eyre::Result` and attach a [`LoadError`] so
//! callers can recover the kind with `downcast_ref` through any context
//! layers added along the way.

use thiserror::Error;

use crate::elf::ElfPtrSize;

#[derive(Error, Debug)]
pub enum LoadError {
    /// A needed library name could not be located in any search path, nor in
    /// the syspage catalog.
    #[error("cannot find needed object \"{name}\"")]
    NotFound { name: String },

    /// The image failed validation or program-header digestion.
    #[error("{path}: {reason}")]
    MalformedImage { path: String, reason: String },

    /// An allocation or anonymous mapping failed.
    #[error("{context}: out of memory")]
    OutOfMemory { context: String },

    /// The object's virtual range could not be reserved, or a fixed-base
    /// executable could not be placed at its requested base.
    #[error("{path}: cannot reserve address space: {reason}")]
    AddressSpace { path: String, reason: String },

    /// Unsupported relocation type, unresolved non-weak symbol, or a COPY
    /// relocation in a shared object.
    #[error("{path}: relocation at offset {offset:#x} ({symbol}): {reason}")]
    Relocation {
        path: String,
        offset: ElfPtrSize,
        symbol: String,
        reason: String,
    },

    /// Attempt to open an object marked NOOPEN, or NOLOAD for an object that
    /// is not already resident.
    #[error("cannot open non-loadable \"{path}\"")]
    Policy { path: String },
}

impl LoadError {
    pub fn malformed(path: &str, reason: impl Into<String>) -> Self {
        LoadError::MalformedImage {
            path: path.to_owned(),
            reason: reason.into(),
        }
    }

    pub fn relocation(
        path: &str,
        offset: ElfPtrSize,
        symbol: &str,
        reason: impl Into<String>,
    ) -> Self {
        LoadError::Relocation {
            path: path.to_owned(),
            offset,
            symbol: symbol.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Recover the [`LoadError`] kind from an `eyre` report, if one is attached.
pub fn load_error(report: &eyre::Report) -> Option<&LoadError> {
    report.downcast_ref::<LoadError>()
}
