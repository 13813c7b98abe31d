//! Where an object's bytes come from: an open file on a filesystem, or an
//! image shipped inside the kernel ("syspage" program).

use std::fs::File;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};

use eyre::{eyre, Result, WrapErr};

use crate::error::LoadError;
use crate::sys::syspage::SyspageProgram;

pub enum ImageSource {
    File {
        file: File,
        /// Canonical pathname; also the registry identity.
        path: PathBuf,
        dev: u64,
        ino: u64,
        size: u64,
    },
    Syspage {
        name: String,
        /// Physical address of the image.
        addr: u64,
        size: u64,
    },
}

impl ImageSource {
    /// Opens a file and records its identity. The file is opened before
    /// `stat` so a rename between the two cannot alias a different object.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|_| LoadError::NotFound {
            name: path.display().to_string(),
        })?;
        let metadata = file
            .metadata()
            .wrap_err_with(|| format!("cannot stat \"{}\"", path.display()))?;
        let canonical = path
            .canonicalize()
            .wrap_err_with(|| format!("cannot canonicalize \"{}\"", path.display()))?;
        Ok(ImageSource::File {
            dev: metadata.dev(),
            ino: metadata.ino(),
            size: metadata.len(),
            file,
            path: canonical,
        })
    }

    pub fn from_syspage(program: SyspageProgram) -> Self {
        ImageSource::Syspage {
            name: program.name,
            addr: program.addr,
            size: program.size,
        }
    }

    /// Registry identity: canonical pathname, `syspage:`-prefixed for
    /// in-kernel images.
    pub fn identity(&self) -> String {
        match self {
            ImageSource::File { path, .. } => path.display().to_string(),
            ImageSource::Syspage { name, .. } => format!("syspage:{}", name),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            ImageSource::File { size, .. } => *size,
            ImageSource::Syspage { size, .. } => *size,
        }
    }

    /// Device and inode; nil for syspage images.
    pub fn dev_ino(&self) -> (u64, u64) {
        match self {
            ImageSource::File { dev, ino, .. } => (*dev, *ino),
            ImageSource::Syspage { .. } => (0, 0),
        }
    }

    pub fn is_physical(&self) -> bool {
        matches!(self, ImageSource::Syspage { .. })
    }

    /// Reads file bytes at `offset`, zero-filling past the end of the file
    /// the way a partial trailing page of a mapping reads. Only valid for
    /// file sources; syspage images are read through their mapping.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            ImageSource::File { file, size, .. } => {
                let available = size.saturating_sub(offset).min(buf.len() as u64) as usize;
                buf[available..].fill(0);
                file.read_exact_at(&mut buf[..available], offset)
                    .wrap_err_with(|| format!("{}: read error", self.identity()))
            }
            ImageSource::Syspage { .. } => {
                Err(eyre!("{}: physical image has no file backing", self.identity()))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_file_identity_and_padding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libx.so");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0xaa; 16])
            .unwrap();

        let source = ImageSource::open(&path).unwrap();
        assert_eq!(source.size(), 16);
        let (dev, ino) = source.dev_ino();
        assert_ne!((dev, ino), (0, 0));

        let mut buf = [0xff_u8; 32];
        source.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..16], &[0xaa; 16]);
        assert_eq!(&buf[16..], &[0; 16]);
    }

    #[test]
    fn test_syspage_identity() {
        let source = ImageSource::from_syspage(SyspageProgram {
            name: "libc".into(),
            addr: 0x2000_0000,
            size: 0x4000,
        });
        assert_eq!(source.identity(), "syspage:libc");
        assert_eq!(source.dev_ino(), (0, 0));
        assert!(source.is_physical());
    }
}
