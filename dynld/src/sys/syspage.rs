//! Catalog of programs shipped inside the kernel image rather than on a
//! filesystem. Paths of the form `syspage:<name>` are resolved here.

use eyre::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyspageProgram {
    pub name: String,
    /// Physical address of the image.
    pub addr: u64,
    pub size: u64,
}

pub trait SyspageCatalog: Send + Sync {
    fn programs(&self) -> Result<Vec<SyspageProgram>>;

    fn find(&self, name: &str) -> Result<Option<SyspageProgram>> {
        Ok(self.programs()?.into_iter().find(|p| p.name == name))
    }
}

/// Catalog for hosts whose kernel ships no programs.
pub struct NoSyspage;

impl SyspageCatalog for NoSyspage {
    fn programs(&self) -> Result<Vec<SyspageProgram>> {
        Ok(vec![])
    }
}

/// Returns the catalog name for a `syspage:`-prefixed path.
pub fn syspage_library_name(path: &str) -> Option<&str> {
    path.strip_prefix("syspage:")
}
