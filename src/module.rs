//! Module records and the process-wide pool
//!
//! A module is uniquely identified by its normalized name. Records live in
//! a pool owned by the [`Context`](crate::context::Context) and are
//! addressed by [`ModuleId`] handles; dependency edges are handle lists, so
//! cyclic softdep graphs never create ownership cycles.
//!
//! The pool key is the normalized name, or `"<name>\<alias>"` for records
//! created through an alias lookup: the same underlying module may appear
//! as multiple entries distinguished by provenance.
use std::{
    collections::HashMap,
    fs::{self, DirEntry},
    io,
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    context::Context,
    error::{Error, Result},
};

/// Stable handle of a module record within one [`Context`]'s pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub(crate) usize);

/// Module Init State, as reported by `/sys/module/<name>/initstate`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// Compiled into the kernel image.
    Builtin,

    /// Normal state, fully loaded.
    Live,

    /// Running module init
    Coming,

    /// Going away
    Going,
}

impl InitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Live => "live",
            Self::Coming => "coming",
            Self::Going => "going",
        }
    }
}

/// An ELF section of a loaded module, from `/sys/module/<name>/sections/`.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    Unknown,
    No,
    Yes,
}

/// One pool entry. Lazy fields start out `None` and are populated on
/// demand; population failures are logged and leave the field empty.
pub(crate) struct ModuleRecord {
    pub name: String,
    pub hashkey: String,
    pub alias: Option<String>,
    pub path: Option<PathBuf>,
    pub refcount: u32,
    pub builtin: Builtin,

    // Probe-planner visit flags.
    pub visited: bool,
    pub required: bool,
    pub ignore_cmd: bool,

    /// Direct dependencies from the `modules.dep` line.
    pub dep: Option<Vec<ModuleId>>,
    /// Concatenated configuration options.
    pub options: Option<String>,
    /// `Some(None)` means "computed, no command configured".
    pub install_command: Option<Option<String>>,
    pub remove_command: Option<Option<String>>,
}

impl ModuleRecord {
    fn new(hashkey: &str, name: &str, alias: Option<&str>) -> Self {
        Self {
            name: name.to_owned(),
            hashkey: hashkey.to_owned(),
            alias: alias.map(str::to_owned),
            path: None,
            refcount: 1,
            builtin: Builtin::Unknown,
            visited: false,
            required: false,
            ignore_cmd: false,
            dep: None,
            options: None,
            install_command: None,
            remove_command: None,
        }
    }
}

/// Name-keyed deduplication of module records.
#[derive(Default)]
pub(crate) struct Pool {
    records: Vec<ModuleRecord>,
    by_key: HashMap<String, ModuleId>,
}

impl Pool {
    /// Fetch-or-create under `hashkey`. An existing record gains a
    /// reference.
    pub fn get_or_insert(&mut self, hashkey: &str, name: &str, alias: Option<&str>) -> ModuleId {
        if let Some(&id) = self.by_key.get(hashkey) {
            self.records[id.0].refcount += 1;
            return id;
        }
        let id = ModuleId(self.records.len());
        debug!("new module record key='{hashkey}'");
        self.records.push(ModuleRecord::new(hashkey, name, alias));
        self.by_key.insert(hashkey.to_owned(), id);
        id
    }

    pub fn record(&self, id: ModuleId) -> &ModuleRecord {
        &self.records[id.0]
    }

    pub fn record_mut(&mut self, id: ModuleId) -> &mut ModuleRecord {
        &mut self.records[id.0]
    }

    /// Drop one reference; at zero the hash key is retired so a later
    /// lookup builds a fresh record.
    pub fn release(&mut self, id: ModuleId) {
        let rec = &mut self.records[id.0];
        rec.refcount = rec.refcount.saturating_sub(1);
        if rec.refcount == 0 {
            debug!("module record '{}' released", rec.hashkey);
            self.by_key.remove(&rec.hashkey);
        }
    }

    /// Clear probe-planner flags on every record.
    pub fn clear_visit_flags(&mut self) {
        for rec in &mut self.records {
            rec.visited = false;
            rec.required = false;
        }
    }
}

/// A kernel module, resolved against a [`Context`].
///
/// Cheap to copy; all state lives in the context's pool.
#[derive(Clone, Copy)]
pub struct Module<'ctx> {
    pub(crate) ctx: &'ctx Context,
    pub(crate) id: ModuleId,
}

impl std::fmt::Debug for Module<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module").field("name", &self.name()).finish()
    }
}

// Attributes
impl<'ctx> Module<'ctx> {
    pub(crate) fn id(&self) -> ModuleId {
        self.id
    }

    /// Normalized module name
    pub fn name(&self) -> String {
        self.ctx.with_record(self.id, |r| r.name.clone())
    }

    /// The alias this record was looked up through, if any
    pub fn alias(&self) -> Option<String> {
        self.ctx.with_record(self.id, |r| r.alias.clone())
    }

    /// Absolute path of the module file, if known
    pub fn path(&self) -> Option<PathBuf> {
        self.ctx.with_record(self.id, |r| r.path.clone())
    }

    /// Whether the module is built into the kernel image
    pub fn is_builtin(&self) -> bool {
        self.ctx.module_is_builtin(self.id)
    }

    /// Direct dependencies, from the `modules.dep` index
    pub fn dependencies(&self) -> Vec<Module<'ctx>> {
        self.ctx
            .module_dependencies(self.id)
            .into_iter()
            .map(|id| Module { ctx: self.ctx, id })
            .collect()
    }

    /// Configuration options concatenated from every matching `options`
    /// line
    pub fn options(&self) -> Option<String> {
        self.ctx.module_options(self.id)
    }

    /// First matching `install` command, if any
    pub fn install_command(&self) -> Option<String> {
        self.ctx.module_install_command(self.id)
    }

    /// First matching `remove` command, if any
    pub fn remove_command(&self) -> Option<String> {
        self.ctx.module_remove_command(self.id)
    }

    /// Soft dependencies `(pre, post)` from the configuration
    pub fn softdeps(&self) -> (Vec<Module<'ctx>>, Vec<Module<'ctx>>) {
        self.ctx.module_softdeps(self.id)
    }

    /// Weak dependencies from the configuration
    pub fn weakdeps(&self) -> Vec<Module<'ctx>> {
        self.ctx.module_weakdeps(self.id)
    }

    /// Drop this handle's reference in the pool.
    pub fn release(self) {
        self.ctx.release_module(self.id);
    }
}

// Runtime state, via sysfs
impl Module<'_> {
    /// Module init state.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the module is neither loaded nor builtin
    /// - [`Error::Io`] on any other sysfs error
    pub fn initstate(&self) -> Result<InitState> {
        if self.is_builtin() {
            return Ok(InitState::Builtin);
        }
        read_initstate(self.ctx.sysfs_root(), &self.name())
    }

    /// Whether the module is in the kernel (live or builtin).
    pub fn is_inkernel(&self) -> bool {
        matches!(
            self.initstate(),
            Ok(InitState::Live) | Ok(InitState::Builtin)
        )
    }

    /// Module reference count.
    ///
    /// A kernel without `MODULE_UNLOAD` has no `refcnt` attribute; that
    /// reads as zero.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] on any sysfs error other than the attribute missing
    /// - [`Error::InvalidInput`] on unparsable attribute data
    pub fn refcount(&self) -> Result<u32> {
        match read_attribute(&self.sysfs_dir(), "refcnt") {
            Ok(s) => s
                .parse()
                .map_err(|_| Error::InvalidInput(format!("bad refcnt `{s}`"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Module core section size in bytes.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] on any sysfs error
    /// - [`Error::InvalidInput`] on unparsable attribute data
    pub fn size(&self) -> Result<u64> {
        let s = read_attribute(&self.sysfs_dir(), "coresize")?;
        s.parse()
            .map_err(|_| Error::InvalidInput(format!("bad coresize `{s}`")))
    }

    /// Other loaded modules currently using this one.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] on any sysfs error
    pub fn holders(&self) -> Result<Vec<Module<'_>>> {
        let mut holders = Vec::new();
        let dir = self.sysfs_dir().join("holders");
        if !dir.exists() {
            return Ok(holders);
        }
        for entry in fs::read_dir(dir)? {
            let entry: DirEntry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                holders.push(self.ctx.module_from_name(name));
            }
        }
        Ok(holders)
    }

    /// Sections of the loaded module and their load addresses.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] on any sysfs error
    pub fn sections(&self) -> Result<Vec<Section>> {
        read_sections(&self.sysfs_dir())
    }

    fn sysfs_dir(&self) -> PathBuf {
        self.ctx.sysfs_root().join("module").join(self.name())
    }
}

/// Read and trim the sysfs `attribute` under `base`.
pub(crate) fn read_attribute(base: &Path, attribute: &str) -> io::Result<String> {
    fs::read_to_string(base.join(attribute)).map(|s| s.trim().to_owned())
}

pub(crate) fn read_initstate(sysfs: &Path, name: &str) -> Result<InitState> {
    let dir = sysfs.join("module").join(name);
    match read_attribute(&dir, "initstate") {
        Ok(s) => match s.as_str() {
            "live" => Ok(InitState::Live),
            "coming" => Ok(InitState::Coming),
            "going" => Ok(InitState::Going),
            s => Err(Error::InvalidInput(format!("initstate `{s}`"))),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if !dir.is_dir() {
                return Err(Error::NotFound(name.to_owned()));
            }
            // Builtins with parameters or a version get a directory but no
            // initstate or coresize. A loadable module without initstate is
            // mid-insertion: the attribute shows up a moment after the
            // directory.
            if dir.join("coresize").exists() {
                Ok(InitState::Coming)
            } else {
                Ok(InitState::Builtin)
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn read_sections(dir: &Path) -> Result<Vec<Section>> {
    let mut out = Vec::new();
    let sections = dir.join("sections");
    if !sections.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(sections)? {
        let entry: DirEntry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if name.starts_with('.') && entry.path().is_dir() {
            continue;
        }
        let addr = read_attribute(dir, &format!("sections/{name}"))?;
        let address = u64::from_str_radix(addr.trim_start_matches("0x"), 16).unwrap_or(0);
        out.push(Section { name, address });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::Result;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn pool_dedups_by_key() {
        let mut pool = Pool::default();
        let a = pool.get_or_insert("ext4", "ext4", None);
        let b = pool.get_or_insert("ext4", "ext4", None);
        assert_eq!(a, b);
        assert_eq!(pool.record(a).refcount, 2);

        // Alias provenance gets its own entry.
        let c = pool.get_or_insert("ext4\\pci:123", "ext4", Some("pci:123"));
        assert_ne!(a, c);
        assert_eq!(pool.record(c).alias.as_deref(), Some("pci:123"));
    }

    #[test]
    fn pool_release_retires_key() {
        let mut pool = Pool::default();
        let a = pool.get_or_insert("loop", "loop", None);
        pool.release(a);
        let b = pool.get_or_insert("loop", "loop", None);
        assert_ne!(a, b);
    }

    #[test]
    fn initstate_from_sysfs() -> Result<()> {
        let sysfs = TempDir::new()?;
        let dir = sysfs.path().join("module/fake_mod");
        fs::create_dir_all(&dir)?;

        // A directory without coresize is a builtin exposing parameters.
        assert_eq!(
            read_initstate(sysfs.path(), "fake_mod")?,
            InitState::Builtin
        );

        // With coresize but no initstate the module is mid-insertion.
        fs::write(dir.join("coresize"), "4096\n")?;
        assert_eq!(
            read_initstate(sysfs.path(), "fake_mod")?,
            InitState::Coming
        );

        fs::write(dir.join("initstate"), "live\n")?;
        assert_eq!(read_initstate(sysfs.path(), "fake_mod")?, InitState::Live);

        fs::write(dir.join("initstate"), "going\n")?;
        assert_eq!(read_initstate(sysfs.path(), "fake_mod")?, InitState::Going);

        assert!(matches!(
            read_initstate(sysfs.path(), "not_there"),
            Err(Error::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn sections_parse_addresses() -> Result<()> {
        let sysfs = TempDir::new()?;
        let dir = sysfs.path().join("module/fake_mod/sections");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(".text"), "0xffffffffc0200000\n")?;

        let sections = read_sections(&sysfs.path().join("module/fake_mod"))?;
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].name, ".text");
        assert_eq!(sections[0].address, 0xffff_ffff_c020_0000);
        Ok(())
    }
}
