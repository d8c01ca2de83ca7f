//! Interface to Linux Kernel modules, on disk
//!
//! A module file is an ELF object, possibly compressed. This module loads
//! the bytes (decompressing by magic number), exposes the embedded
//! `.modinfo` metadata, and carries them over the kernel syscall boundary:
//! `finit_module` through a memory file, falling back to `init_module`,
//! and `delete_module` for removal.
use std::{
    ffi::CString,
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use bitflags::bitflags;
#[cfg(feature = "gz")]
use flate2::bufread::GzDecoder;
use log::debug;
use nix::kmod::{delete_module, finit_module, init_module, DeleteModuleFlags, ModuleInitFlags};
#[cfg(feature = "xz")]
use xz2::bufread::XzDecoder;
#[cfg(feature = "zst")]
use zstd::stream::read::Decoder as ZstDecoder;

use crate::{
    elf::{Elf, StripFlags},
    error::{Error, Result},
    extensions::FileExt,
    util::path_to_modname,
};

const MAGIC_ELF: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const MAGIC_XZ: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
const MAGIC_GZ: [u8; 2] = [0x1F, 0x8B];
const MAGIC_ZSTD: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

bitflags! {
    /// Force-loading switches; each strips the corresponding check from
    /// the image in user space before it reaches the kernel.
    pub struct InsertFlags: u32 {
        /// Strip `__versions`, ignoring per-symbol CRCs.
        const FORCE_MODVERSION = 1 << 0;
        /// Clear `vermagic=`, ignoring the kernel ABI string.
        const FORCE_VERMAGIC = 1 << 1;
    }
}

bitflags! {
    /// Switches for module removal.
    pub struct RemoveFlags: u32 {
        /// Remove even with a nonzero refcount. Dangerous.
        const FORCE = 1 << 0;
        /// Do not block waiting for the module to become unused.
        const NOWAIT = 1 << 1;
        /// Skip any configured remove command.
        const IGNORE_COMMAND = 1 << 2;
    }
}

/// Load the bytes of a possibly-compressed module file.
///
/// The compression scheme is sniffed from the leading magic, not the file
/// name. Plain ELF data is returned as-is.
///
/// # Errors
///
/// - [`Error::Io`] on read failure
/// - [`Error::InvalidInput`] on an unknown magic, or a compression scheme
///   this build carries no decoder for
pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    let data = fs::read(path)?;
    decompress(path, data)
}

fn decompress(path: &Path, data: Vec<u8>) -> Result<Vec<u8>> {
    if data.starts_with(&MAGIC_ELF) {
        return Ok(data);
    }

    if data.starts_with(&MAGIC_XZ) {
        #[cfg(feature = "xz")]
        {
            let mut out = Vec::new();
            XzDecoder::new(data.as_slice())
                .read_to_end(&mut out)
                .map_err(|e| decompress_error(path, &e))?;
            return Ok(out);
        }
        #[cfg(not(feature = "xz"))]
        return Err(unsupported(path, "xz"));
    }

    if data.starts_with(&MAGIC_GZ) {
        #[cfg(feature = "gz")]
        {
            let mut out = Vec::new();
            GzDecoder::new(data.as_slice())
                .read_to_end(&mut out)
                .map_err(|e| decompress_error(path, &e))?;
            return Ok(out);
        }
        #[cfg(not(feature = "gz"))]
        return Err(unsupported(path, "gzip"));
    }

    if data.starts_with(&MAGIC_ZSTD) {
        #[cfg(feature = "zst")]
        {
            let mut out = Vec::new();
            ZstDecoder::new(data.as_slice())
                .map_err(|e| decompress_error(path, &e))?
                .read_to_end(&mut out)
                .map_err(|e| decompress_error(path, &e))?;
            return Ok(out);
        }
        #[cfg(not(feature = "zst"))]
        return Err(unsupported(path, "zstd"));
    }

    Err(Error::InvalidInput(format!(
        "unknown module format in {}",
        path.display()
    )))
}

fn decompress_error(path: &Path, e: &dyn std::fmt::Display) -> Error {
    Error::InvalidInput(format!("error decompressing {}: {e}", path.display()))
}

#[allow(dead_code)]
fn unsupported(path: &Path, scheme: &str) -> Error {
    Error::InvalidInput(format!(
        "{} is {scheme}-compressed but this build has no {scheme} support",
        path.display()
    ))
}

/// A Linux Kernel Module file on disk, decompressed into memory.
#[derive(Debug)]
pub struct ModuleFile {
    name: String,
    path: PathBuf,
    image: Vec<u8>,
}

// Constructors
impl ModuleFile {
    /// Read the module at `path`.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] / [`Error::InvalidInput`] from [`read_bytes`]
    /// - [`Error::InvalidInput`] if the path carries no module name or the
    ///   content is not ELF
    pub fn open(path: &Path) -> Result<Self> {
        let name = path_to_modname(path)
            .ok_or_else(|| Error::InvalidInput(format!("no modname in {}", path.display())))?;
        let image = read_bytes(path)?;

        Elf::new(&image).map_err(|e| Error::InvalidInput(format!("{}: {e}", path.display())))?;

        Ok(Self {
            name,
            path: path.to_path_buf(),
            image,
        })
    }
}

// Attributes
impl ModuleFile {
    /// Normalized module name, from the file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path to the module file.
    ///
    /// May no longer exist or match the bytes initially read.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decompressed ELF image.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// `.modinfo` contents as `(tag, value)` pairs, in section order.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if the image fails to parse
    pub fn modinfo(&self) -> Result<Vec<(String, String)>> {
        let elf = self.elf()?;
        let strings = elf
            .modinfo()
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        Ok(strings
            .into_iter()
            .filter_map(|s| {
                s.split_once('=')
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
            })
            .collect())
    }

    pub(crate) fn elf(&self) -> Result<Elf<'_>> {
        Elf::new(&self.image).map_err(|e| Error::InvalidInput(e.to_string()))
    }
}

// Operations
impl ModuleFile {
    /// Insert this module into the kernel.
    ///
    /// This requires the `CAP_SYS_MODULE` capability.
    ///
    /// With force flags the corresponding checks are stripped from a copy
    /// of the image in user space first. The image goes through
    /// `finit_module` on a memory file; kernels without it get
    /// `init_module`.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyLoaded`] if the kernel already has the module
    /// - [`Error::LoadError`] for any other kernel refusal
    ///
    /// # Panics
    ///
    /// - if `options` has any internal nul bytes.
    pub fn insert(&self, options: &str, flags: InsertFlags) -> Result<()> {
        let mut strip = StripFlags::empty();
        if flags.contains(InsertFlags::FORCE_MODVERSION) {
            strip |= StripFlags::MODVERSION;
        }
        if flags.contains(InsertFlags::FORCE_VERMAGIC) {
            strip |= StripFlags::VERMAGIC;
        }

        let stripped;
        let image: &[u8] = if strip.is_empty() {
            &self.image
        } else {
            stripped = self
                .elf()?
                .strip(strip)
                .map_err(|e| Error::LoadError(self.name.clone(), e.to_string()))?;
            &stripped
        };

        let params =
            CString::new(options).expect("module options can't have internal null bytes");

        // The image is already stripped, but kernels honoring these bits
        // skip the same checks on the finit path.
        let mut init_flags = ModuleInitFlags::empty();
        if flags.contains(InsertFlags::FORCE_MODVERSION) {
            init_flags |= ModuleInitFlags::MODULE_INIT_IGNORE_MODVERSIONS;
        }
        if flags.contains(InsertFlags::FORCE_VERMAGIC) {
            init_flags |= ModuleInitFlags::MODULE_INIT_IGNORE_VERMAGIC;
        }

        let mut file = fs::File::create_memory(&self.name);
        file.write_all(image)
            .map_err(|e| Error::LoadError(self.name.clone(), e.to_string()))?;

        match finit_module(&file, &params, init_flags) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ENOSYS) => {
                debug!("finit_module unavailable, falling back to init_module");
                match init_module(image, &params) {
                    Ok(()) => Ok(()),
                    Err(e) => Err(self.load_error(e)),
                }
            }
            Err(e) => Err(self.load_error(e)),
        }
    }

    fn load_error(&self, errno: nix::errno::Errno) -> Error {
        match errno {
            nix::errno::Errno::EEXIST => Error::AlreadyLoaded(self.name.clone()),
            e => Error::LoadError(
                self.name.clone(),
                io::Error::from_raw_os_error(e as i32).to_string(),
            ),
        }
    }
}

/// Unload a module by name.
///
/// # Errors
///
/// - [`Error::NotFound`] if no such module is loaded
/// - [`Error::InUse`] if the module has users and force was not given
/// - [`Error::UnloadError`] for any other kernel refusal
///
/// # Panics
///
/// - if `name` has any internal nul bytes.
pub fn remove_module(name: &str, flags: RemoveFlags) -> Result<()> {
    let mut delete_flags = DeleteModuleFlags::empty();
    if flags.contains(RemoveFlags::FORCE) {
        delete_flags |= DeleteModuleFlags::O_TRUNC;
    }
    if flags.contains(RemoveFlags::NOWAIT) {
        delete_flags |= DeleteModuleFlags::O_NONBLOCK;
    }

    match delete_module(
        &CString::new(name).expect("module name can't have internal null bytes"),
        delete_flags,
    ) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ENOENT) => Err(Error::NotFound(name.to_owned())),
        Err(nix::errno::Errno::EWOULDBLOCK) | Err(nix::errno::Errno::EBUSY) => {
            Err(Error::InUse(name.to_owned()))
        }
        Err(e) => Err(Error::UnloadError(
            name.to_owned(),
            io::Error::from_raw_os_error(e as i32).to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::TempDir;

    use crate::elf::testelf::Builder;

    use super::*;

    fn fake_module() -> Vec<u8> {
        Builder::new(false, false)
            .section(".modinfo", b"license=GPL\0author=X\0".to_vec())
            .build()
    }

    #[test]
    fn open_reads_plain_elf() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("fake-mod.ko");
        fs::write(&path, fake_module())?;

        let file = ModuleFile::open(&path)?;
        assert_eq!(file.name(), "fake_mod");
        assert_eq!(
            file.modinfo()?,
            [
                ("license".to_owned(), "GPL".to_owned()),
                ("author".to_owned(), "X".to_owned())
            ]
        );
        Ok(())
    }

    #[cfg(feature = "gz")]
    #[test]
    fn open_decompresses_by_magic() -> Result<()> {
        use flate2::{write::GzEncoder, Compression};

        let dir = TempDir::new()?;
        let path = dir.path().join("fake-mod.ko.gz");
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&fake_module())?;
        fs::write(&path, enc.finish()?)?;

        let file = ModuleFile::open(&path)?;
        assert_eq!(file.name(), "fake_mod");
        assert!(file.image().starts_with(&MAGIC_ELF));
        Ok(())
    }

    #[test]
    fn open_rejects_garbage() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("junk.ko");
        fs::write(&path, b"this is not a module")?;
        assert!(ModuleFile::open(&path).is_err());
        Ok(())
    }
}
