//! Process-wide library context
//!
//! A [`Context`] carries the module directory, the parsed configuration,
//! the five module indexes and the module pool. Contexts are independent of
//! each other and single-threaded; everything that needs shared state takes
//! the context explicitly.
use std::{
    cell::RefCell,
    env, fs,
    io::Write,
    path::{Path, PathBuf},
};

use glob::Pattern;
use log::{debug, warn};

use crate::{
    config::Config,
    error::{Error, Result},
    index::{Index, IndexValue},
    module::{Builtin, Module, ModuleId, ModuleRecord, Pool},
    system::kernel_info,
    util::{modname_normalize, path_mstamp, path_to_modname, CONFIG_PATHS, MODULE_PATH, SYSFS_PATH},
};

/// Module compression scheme the running kernel was built to accept,
/// from `/sys/module/compression`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelCompression {
    None,
    Zlib,
    Xz,
    Zstd,
}

/// The five index files, in lookup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Dep = 0,
    Alias = 1,
    Symbols = 2,
    Builtin = 3,
    BuiltinAlias = 4,
}

pub(crate) const INDEX_FILES: [&str; 5] = [
    "modules.dep",
    "modules.alias",
    "modules.symbols",
    "modules.builtin",
    "modules.builtin.alias",
];

const INDEX_COUNT: usize = INDEX_FILES.len();

/// Outcome of [`Context::validate_resources`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Everything matches the on-disk state.
    Ok,

    /// An index file changed; reload the indexes.
    MustReload,

    /// A configuration file changed; recreate the context.
    MustRecreate,
}

/// Process-wide handle over one module directory.
pub struct Context {
    dirname: PathBuf,
    sysfs: PathBuf,
    compression: KernelCompression,
    config: Config,
    indexes: RefCell<[Option<Index>; INDEX_COUNT]>,
    pool: RefCell<Pool>,
}

// Constructors
impl Context {
    /// Context over `/lib/modules/<uname -r>` with the default
    /// configuration directories.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the kernel release cannot be determined
    pub fn new() -> Result<Self> {
        Self::with_config(None, None)
    }

    /// Context with an explicit module directory and/or configuration
    /// paths.
    ///
    /// With explicit configuration paths the caller controls the whole
    /// configuration: the kernel command line is only overlaid for the
    /// default set.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if no directory was given and the kernel release
    ///   cannot be determined
    pub fn with_config(dirname: Option<&Path>, config_paths: Option<&[PathBuf]>) -> Result<Self> {
        let dirname = match dirname {
            Some(d) if d.is_absolute() => d.to_path_buf(),
            Some(d) => env::current_dir()?.join(d),
            None => Path::new(MODULE_PATH).join(kernel_info()?.release()),
        };

        let config = match config_paths {
            Some(paths) => Config::load_files(paths),
            None => {
                let default_paths: Vec<PathBuf> =
                    CONFIG_PATHS.iter().map(PathBuf::from).collect();
                Config::load(&default_paths)
            }
        };

        let sysfs = PathBuf::from(SYSFS_PATH);
        let compression = detect_kernel_compression(&sysfs);

        debug!("context over {}", dirname.display());
        Ok(Self {
            dirname,
            sysfs,
            compression,
            config,
            indexes: RefCell::new(Default::default()),
            pool: RefCell::new(Pool::default()),
        })
    }

    /// Module directory this context operates on.
    pub fn dirname(&self) -> &Path {
        &self.dirname
    }

    /// Parsed configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Compression scheme the kernel accepts for module files.
    pub fn kernel_compression(&self) -> KernelCompression {
        self.compression
    }

    pub(crate) fn sysfs_root(&self) -> &Path {
        &self.sysfs
    }

    /// Point sysfs reads somewhere else. Useful with a staged tree.
    pub fn set_sysfs_root(&mut self, root: &Path) {
        self.sysfs = root.to_path_buf();
    }
}

// Module pool access
impl Context {
    pub(crate) fn with_record<R>(&self, id: ModuleId, f: impl FnOnce(&ModuleRecord) -> R) -> R {
        f(self.pool.borrow().record(id))
    }

    pub(crate) fn with_record_mut<R>(
        &self,
        id: ModuleId,
        f: impl FnOnce(&mut ModuleRecord) -> R,
    ) -> R {
        f(self.pool.borrow_mut().record_mut(id))
    }

    pub(crate) fn release_module(&self, id: ModuleId) {
        self.pool.borrow_mut().release(id);
    }

    pub(crate) fn clear_visit_flags(&self) {
        self.pool.borrow_mut().clear_visit_flags();
    }

    pub(crate) fn wrap(&self, id: ModuleId) -> Module<'_> {
        Module { ctx: self, id }
    }

    /// Module record by (normalized) name; deduplicated in the pool.
    pub fn module_from_name(&self, name: &str) -> Module<'_> {
        let name = modname_normalize(name);
        let id = self.pool.borrow_mut().get_or_insert(&name, &name, None);
        self.wrap(id)
    }

    /// Module record created through an alias lookup: pool key is
    /// `"<name>\<alias>"`.
    pub(crate) fn module_from_alias(&self, alias: &str, name: &str) -> Module<'_> {
        let key = format!("{name}\\{alias}");
        let id = self.pool.borrow_mut().get_or_insert(&key, name, Some(alias));
        self.wrap(id)
    }

    /// Module record for the file at `path`.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file cannot be stat'ed
    /// - [`Error::InvalidInput`] if the path has no usable name, or a
    ///   record of the same name already points to a different file
    pub fn module_from_path(&self, path: &Path) -> Result<Module<'_>> {
        let abspath = if path.is_absolute() {
            path.to_path_buf()
        } else {
            env::current_dir()?.join(path)
        };

        fs::metadata(&abspath)?;

        let name = path_to_modname(&abspath)
            .ok_or_else(|| Error::InvalidInput(format!("no modname in {}", path.display())))?;

        let id = self.pool.borrow_mut().get_or_insert(&name, &name, None);
        {
            let mut pool = self.pool.borrow_mut();
            let rec = pool.record_mut(id);
            match &rec.path {
                None => rec.path = Some(abspath),
                Some(p) if *p == abspath => {}
                Some(p) => {
                    let existing = p.display().to_string();
                    drop(pool);
                    self.release_module(id);
                    return Err(Error::InvalidInput(format!(
                        "module '{name}' already exists with different path: \
                         new-path='{}' old-path='{existing}'",
                        abspath.display()
                    )));
                }
            }
            pool.record_mut(id).builtin = Builtin::No;
        }
        Ok(self.wrap(id))
    }

    /// Currently loaded modules, from `/proc/modules`.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if `/proc/modules` cannot be read
    pub fn loaded_modules(&self) -> Result<Vec<Module<'_>>> {
        let text = fs::read_to_string("/proc/modules")?;
        Ok(text
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(|name| self.module_from_name(name))
            .collect())
    }
}

// Lazy module fields
impl Context {
    pub(crate) fn module_is_builtin(&self, id: ModuleId) -> bool {
        let state = self.with_record(id, |r| r.builtin);
        if state == Builtin::Unknown {
            let name = self.with_record(id, |r| r.name.clone());
            let yes = self
                .index_search(IndexKind::Builtin, &name)
                .is_some();
            self.with_record_mut(id, |r| {
                r.builtin = if yes { Builtin::Yes } else { Builtin::No }
            });
            return yes;
        }
        state == Builtin::Yes
    }

    pub(crate) fn set_builtin(&self, id: ModuleId, yes: bool) {
        self.with_record_mut(id, |r| {
            r.builtin = if yes { Builtin::Yes } else { Builtin::No }
        });
    }

    /// Direct dependencies; populated from the `modules.dep` index on
    /// first use. Failures leave the list empty.
    pub(crate) fn module_dependencies(&self, id: ModuleId) -> Vec<ModuleId> {
        if let Some(dep) = self.with_record(id, |r| r.dep.clone()) {
            return dep;
        }

        let name = self.with_record(id, |r| r.name.clone());
        let dep = match self.search_moddep(&name) {
            Some(line) => self.parse_depline(id, &line),
            None => Vec::new(),
        };
        self.with_record_mut(id, |r| r.dep = Some(dep.clone()));
        dep
    }

    /// Parse a `modules.dep` line: `<relpath>: <relpath>*`. Fills the
    /// record's path as a side effect when it has none.
    pub(crate) fn parse_depline(&self, id: ModuleId, line: &str) -> Vec<ModuleId> {
        let Some((selfpath, deps)) = line.split_once(':') else {
            return Vec::new();
        };

        if self.with_record(id, |r| r.path.is_none()) {
            let path = self.join_dirname(selfpath);
            self.with_record_mut(id, |r| r.path = Some(path));
        }

        let mut out = Vec::new();
        for tok in deps.split_whitespace() {
            let path = self.join_dirname(tok);
            match self.module_from_path(&path) {
                Ok(m) => out.push(m.id()),
                Err(e) => {
                    warn!("could not create module for dep {}: {e}", path.display());
                    return Vec::new();
                }
            }
        }
        out
    }

    fn join_dirname(&self, relpath: &str) -> PathBuf {
        let p = Path::new(relpath);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.dirname.join(p)
        }
    }

    /// Concatenated options from every configuration entry matching the
    /// module's name or alias.
    pub(crate) fn module_options(&self, id: ModuleId) -> Option<String> {
        if let Some(cached) = self.with_record(id, |r| r.options.clone()) {
            return if cached.is_empty() { None } else { Some(cached) };
        }

        let (name, alias) = self.with_record(id, |r| (r.name.clone(), r.alias.clone()));
        let mut opts = String::new();
        for entry in &self.config.options {
            let matched = pattern_matches(&entry.modname, &name)
                || alias
                    .as_deref()
                    .map_or(false, |a| pattern_matches(&entry.modname, a));
            if !matched || entry.options.is_empty() {
                continue;
            }
            if !opts.is_empty() {
                opts.push(' ');
            }
            opts.push_str(&entry.options);
        }

        self.with_record_mut(id, |r| r.options = Some(opts.clone()));
        if opts.is_empty() {
            None
        } else {
            Some(opts)
        }
    }

    pub(crate) fn module_install_command(&self, id: ModuleId) -> Option<String> {
        if let Some(cached) = self.with_record(id, |r| r.install_command.clone()) {
            return cached;
        }
        let name = self.with_record(id, |r| r.name.clone());
        let cmd = self
            .config
            .install_commands
            .iter()
            .find(|c| pattern_matches(&c.modname, &name))
            .map(|c| c.command.clone());
        self.with_record_mut(id, |r| r.install_command = Some(cmd.clone()));
        cmd
    }

    pub(crate) fn set_install_command(&self, id: ModuleId, cmd: &str) {
        self.with_record_mut(id, |r| r.install_command = Some(Some(cmd.to_owned())));
    }

    pub(crate) fn module_remove_command(&self, id: ModuleId) -> Option<String> {
        if let Some(cached) = self.with_record(id, |r| r.remove_command.clone()) {
            return cached;
        }
        let name = self.with_record(id, |r| r.name.clone());
        let cmd = self
            .config
            .remove_commands
            .iter()
            .find(|c| pattern_matches(&c.modname, &name))
            .map(|c| c.command.clone());
        self.with_record_mut(id, |r| r.remove_command = Some(cmd.clone()));
        cmd
    }

    pub(crate) fn set_remove_command(&self, id: ModuleId, cmd: &str) {
        self.with_record_mut(id, |r| r.remove_command = Some(Some(cmd.to_owned())));
    }

    /// Soft dependencies: every matching configuration line contributes,
    /// in file order. Each named dependency goes through full alias
    /// resolution.
    pub(crate) fn module_softdeps(&self, id: ModuleId) -> (Vec<Module<'_>>, Vec<Module<'_>>) {
        let name = self.with_record(id, |r| r.name.clone());
        let mut pre_names = Vec::new();
        let mut post_names = Vec::new();
        for dep in &self.config.softdeps {
            if pattern_matches(&dep.name, &name) {
                pre_names.extend(dep.pre.iter().cloned());
                post_names.extend(dep.post.iter().cloned());
            }
        }
        (self.lookup_dep(&pre_names), self.lookup_dep(&post_names))
    }

    pub(crate) fn module_weakdeps(&self, id: ModuleId) -> Vec<Module<'_>> {
        let name = self.with_record(id, |r| r.name.clone());
        let mut weak_names = Vec::new();
        for dep in &self.config.weakdeps {
            if pattern_matches(&dep.name, &name) {
                weak_names.extend(dep.weak.iter().cloned());
            }
        }
        self.lookup_dep(&weak_names)
    }

    fn lookup_dep(&self, names: &[String]) -> Vec<Module<'_>> {
        let mut out = Vec::new();
        for name in names {
            match self.lookup_alias(name) {
                Ok(mods) => out.extend(mods),
                Err(e) => {
                    warn!("failed to lookup dependency '{name}', continuing anyway: {e}");
                }
            }
        }
        out
    }
}

// Index resources
impl Context {
    fn index_path(&self, kind: IndexKind) -> PathBuf {
        self.dirname
            .join(format!("{}.bin", INDEX_FILES[kind as usize]))
    }

    /// Mmap all five indexes up front.
    ///
    /// `modules.builtin.alias.bin` is considered optional: older
    /// installations may not have it.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if a mandatory index cannot be opened
    pub fn load_resources(&self) -> Result<()> {
        let mut indexes = self.indexes.borrow_mut();
        for kind in [
            IndexKind::Dep,
            IndexKind::Alias,
            IndexKind::Symbols,
            IndexKind::Builtin,
            IndexKind::BuiltinAlias,
        ] {
            if indexes[kind as usize].is_some() {
                debug!("index {} already loaded", INDEX_FILES[kind as usize]);
                continue;
            }
            let path = self.index_path(kind);
            match Index::open(&path) {
                Ok(idx) => indexes[kind as usize] = Some(idx),
                Err(e) if kind == IndexKind::BuiltinAlias => {
                    debug!("optional index {}: {e}", path.display());
                }
                Err(e) => {
                    debug!("could not load {}: {e}", path.display());
                    drop(indexes);
                    self.unload_resources();
                    return Err(Error::NotFound(path.display().to_string()));
                }
            }
        }
        Ok(())
    }

    pub fn unload_resources(&self) {
        *self.indexes.borrow_mut() = Default::default();
    }

    /// Compare recorded mtimes against the filesystem.
    pub fn validate_resources(&self) -> Validation {
        for (path, stamp) in self.config.paths() {
            if path_mstamp(path) != *stamp {
                return Validation::MustRecreate;
            }
        }

        let indexes = self.indexes.borrow();
        for (i, index) in indexes.iter().enumerate() {
            let Some(index) = index else { continue };
            let path = self
                .dirname
                .join(format!("{}.bin", INDEX_FILES[i]));
            if path_mstamp(&path) != index.stamp() {
                return Validation::MustReload;
            }
        }

        Validation::Ok
    }

    /// Run `f` over the index of `kind`: the loaded mapping if resources
    /// are loaded, a transient mapping otherwise.
    fn with_index<R>(&self, kind: IndexKind, f: impl FnOnce(&Index) -> R) -> Option<R> {
        let indexes = self.indexes.borrow();
        if let Some(idx) = &indexes[kind as usize] {
            return Some(f(idx));
        }
        drop(indexes);

        let path = self.index_path(kind);
        match Index::open(&path) {
            Ok(idx) => Some(f(&idx)),
            Err(e) => {
                debug!("could not open index {}: {e}", path.display());
                None
            }
        }
    }

    pub(crate) fn index_search(&self, kind: IndexKind, key: &str) -> Option<String> {
        self.with_index(kind, |idx| idx.search(key)).flatten()
    }

    pub(crate) fn index_search_wild(&self, kind: IndexKind, key: &str) -> Vec<IndexValue> {
        self.with_index(kind, |idx| idx.search_wild(key))
            .unwrap_or_default()
    }

    /// `modules.dep.bin` line for a module name.
    pub(crate) fn search_moddep(&self, name: &str) -> Option<String> {
        self.index_search(IndexKind::Dep, name)
    }

    /// Write the contents of one index through `w`, one value per line.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the index cannot be opened
    /// - [`Error::Io`] from the writer
    pub fn dump_index(&self, kind: IndexKind, w: &mut dyn Write) -> Result<()> {
        let alias_prefix = matches!(kind, IndexKind::Alias | IndexKind::Symbols);
        match self.with_index(kind, |idx| idx.dump(w, alias_prefix)) {
            None => Err(Error::NotFound(
                self.index_path(kind).display().to_string(),
            )),
            Some(r) => r.map_err(Error::from),
        }
    }
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches(name),
        Err(_) => pattern == name,
    }
}

fn detect_kernel_compression(sysfs: &Path) -> KernelCompression {
    let path = sysfs.join("module/compression");
    match fs::read_to_string(&path) {
        Ok(s) => match s.trim() {
            "zstd" => KernelCompression::Zstd,
            "xz" => KernelCompression::Xz,
            "gzip" => KernelCompression::Zlib,
            other => {
                debug!("unknown kernel compression {other}");
                KernelCompression::None
            }
        },
        // Not having the file is not an error: kernel may be too old.
        Err(_) => KernelCompression::None,
    }
}
