//! depmod: compile the module indexes from a module tree
//!
//! Walks the module directory, reads every module's ELF symbol tables,
//! resolves inter-module dependencies through a global symbol table, orders
//! the result topologically and emits the text and binary index files.
//! Every output is written to a temporary file in the output directory and
//! atomically renamed into place; no timestamps are embedded, so the same
//! input tree produces byte-identical artifacts.
use std::{
    collections::HashMap,
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use log::{debug, error, warn};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::{
    context::Context,
    elf::{Elf, Symbol, SymbolBind},
    error::{Error, Result},
    index::IndexBuilder,
    module_file::read_bytes,
    util::{alias_normalize, path_ends_with_kmod_ext, path_to_modname},
};

/// One entry of the search order used to break same-name conflicts.
#[derive(Debug, Clone)]
pub enum SearchEntry {
    /// The canonical module tree (`kernel/` and friends).
    Builtin,

    /// Every configured external directory, ranked individually.
    External,

    /// A subdirectory of the module directory, e.g. `updates`.
    Path(String),
}

/// Configuration of one depmod run.
#[derive(Debug, Clone)]
pub struct DepmodConfig {
    /// Conflict-resolution order; earlier entries win.
    pub searches: Vec<SearchEntry>,

    /// Relative paths that always win a conflict.
    pub overrides: Vec<String>,

    /// Module directories outside the canonical tree.
    pub externals: Vec<PathBuf>,

    /// Directory names to skip while scanning.
    pub excludes: Vec<String>,

    /// Compare dependency CRCs against the symbol table.
    pub check_symvers: bool,

    /// Warn about unresolved symbols.
    pub print_unknown: bool,

    /// Warn when an index key receives duplicate values.
    pub warn_dups: bool,

    /// Architecture symbol prefix (`_` on some ABIs).
    pub sym_prefix: Option<char>,
}

impl Default for DepmodConfig {
    fn default() -> Self {
        Self {
            searches: vec![SearchEntry::Builtin],
            overrides: Vec::new(),
            externals: Vec::new(),
            excludes: Vec::new(),
            check_symvers: false,
            print_unknown: false,
            warn_dups: false,
            sym_prefix: None,
        }
    }
}

/// A module discovered during the scan.
struct Mod {
    path: PathBuf,
    /// Path under the module directory, compression suffix included.
    relpath: Option<String>,
    /// `relpath` with the compression suffix removed.
    uncrelpath: Option<String>,
    modname: String,
    idx: usize,
    sort_idx: i64,
    dep_sort_idx: i64,
    /// Indexes into the modules array.
    deps: Vec<usize>,
    /// How many modules depend on this one.
    users: u32,
    /// Raw `.modinfo` strings.
    info: Vec<String>,
    dep_syms: Vec<Symbol>,
}

impl Mod {
    /// The path emitted into text artifacts.
    fn output_path(&self) -> String {
        match &self.relpath {
            Some(rel) => rel.clone(),
            None => self.path.display().to_string(),
        }
    }
}

struct SymEntry {
    crc: u64,
    /// Index of the exporting module; `None` for kernel symbols.
    owner: Option<usize>,
}

/// The builder. Drive it with [`Depmod::run`], or call the phases
/// individually.
pub struct Depmod<'ctx> {
    ctx: &'ctx Context,
    cfg: DepmodConfig,
    modules: Vec<Mod>,
    by_name: HashMap<String, usize>,
    symbols: HashMap<String, SymEntry>,
}

// Construction and driving
impl<'ctx> Depmod<'ctx> {
    pub fn new(ctx: &'ctx Context, cfg: DepmodConfig) -> Self {
        Self {
            ctx,
            cfg,
            modules: Vec::new(),
            by_name: HashMap::new(),
            symbols: HashMap::new(),
        }
    }

    /// Scan, resolve and emit into the module directory.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the module directory is unreadable
    /// - [`Error::Cycle`] on a dependency cycle
    pub fn run(&mut self) -> Result<()> {
        self.scan()?;
        self.load()?;
        self.write_outputs(None)
    }

    /// Walk the module tree (and external directories) collecting module
    /// files, resolving same-name conflicts by priority.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the module directory cannot be walked
    pub fn scan(&mut self) -> Result<()> {
        let dirname = self.ctx.dirname().to_path_buf();
        self.scan_path(&dirname, true)?;

        for ext in self.cfg.externals.clone() {
            if let Err(e) = self.scan_path(&ext, false) {
                debug!("skipping external dir {}: {e}", ext.display());
            }
        }
        Ok(())
    }

    fn scan_path(&mut self, base: &Path, required: bool) -> Result<()> {
        if !base.is_dir() {
            if required {
                return Err(Error::NotFound(base.display().to_string()));
            }
            return Ok(());
        }

        let excludes = self.cfg.excludes.clone();
        let walker = WalkDir::new(base)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| {
                if e.depth() == 0 || !e.file_type().is_dir() {
                    return true;
                }
                let name = e.file_name().to_string_lossy();
                !should_exclude_dir(&name, &excludes)
            });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("failed scanning {}: {e}", base.display());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !path_ends_with_kmod_ext(&name) {
                continue;
            }
            self.add_candidate(entry.path());
        }
        Ok(())
    }

    fn add_candidate(&mut self, path: &Path) {
        let Some(modname) = path_to_modname(path) else {
            error!("could not get modname from path {}", path.display());
            return;
        };

        let relpath = path
            .strip_prefix(self.ctx.dirname())
            .ok()
            .map(|p| p.to_string_lossy().into_owned());
        debug!("try {} ({modname})", path.display());

        if let Some(&i) = self.by_name.get(&modname) {
            if self.existing_is_higher_priority(&self.modules[i], path, relpath.as_deref()) {
                debug!("ignored lower priority: {}", path.display());
                return;
            }
            debug!(
                "replace lower priority {} with new module {}",
                self.modules[i].path.display(),
                path.display()
            );
            let uncrelpath = relpath.as_deref().map(strip_compression_suffix);
            let m = &mut self.modules[i];
            m.path = path.to_path_buf();
            m.relpath = relpath;
            m.uncrelpath = uncrelpath;
            return;
        }

        let idx = self.modules.len();
        self.modules.push(Mod {
            path: path.to_path_buf(),
            uncrelpath: relpath.as_deref().map(strip_compression_suffix),
            relpath,
            modname: modname.clone(),
            idx,
            sort_idx: idx as i64,
            dep_sort_idx: idx as i64,
            deps: Vec::new(),
            users: 0,
            info: Vec::new(),
            dep_syms: Vec::new(),
        });
        self.by_name.insert(modname, idx);
    }

    /// Whether the already-scanned module outranks the new path.
    ///
    /// Overrides always win; otherwise the module under the search entry
    /// listed first wins, with the `built-in` pseudo-entry standing in for
    /// unmatched paths. Ties keep the existing module.
    fn existing_is_higher_priority(
        &self,
        existing: &Mod,
        newpath: &Path,
        newrel: Option<&str>,
    ) -> bool {
        let oldrel = existing.relpath.as_deref();

        for ov in &self.cfg.overrides {
            if newrel == Some(ov.as_str()) {
                return false;
            }
            if oldrel == Some(ov.as_str()) {
                return true;
            }
        }

        // Search entries are ranked back-to-front so that a larger index
        // means an earlier (higher-priority) entry.
        let mut bprio: i64 = -1;
        let mut newprio: i64 = -1;
        let mut oldprio: i64 = -1;
        let mut i: i64 = 0;
        for se in self.cfg.searches.iter().rev() {
            match se {
                SearchEntry::Builtin => bprio = i,
                SearchEntry::External => {
                    for ext in &self.cfg.externals {
                        if newpath.starts_with(ext) {
                            newprio = i;
                        }
                        if existing.path.starts_with(ext) {
                            oldprio = i;
                        }
                        i += 1;
                    }
                }
                SearchEntry::Path(sub) => {
                    if rel_under(newrel, sub) {
                        newprio = i;
                    } else if rel_under(oldrel, sub) {
                        oldprio = i;
                    }
                }
            }
            i += 1;
        }

        if newprio < 0 {
            newprio = bprio;
        }
        if oldprio < 0 {
            oldprio = bprio;
        }
        debug!("priorities: built-in: {bprio}, old: {oldprio}, new: {newprio}");

        newprio <= oldprio
    }
}

// Symbol table and dependency resolution
impl Depmod<'_> {
    /// Seed symbols, read every module, resolve dependencies and order
    /// them.
    ///
    /// # Errors
    ///
    /// - [`Error::Cycle`] if the dependency graph is not a DAG
    pub fn load(&mut self) -> Result<()> {
        self.sort_by_order_file();
        self.add_fake_syms();
        self.load_modules();
        self.load_dependencies();
        self.calculate_dependencies()
    }

    /// `modules.order` assigns listed modules negative sort keys so they
    /// precede everything else, in list order.
    fn sort_by_order_file(&mut self) {
        let path = self.ctx.dirname().join("modules.order");
        let Ok(text) = fs::read_to_string(&path) else {
            return;
        };

        let by_uncrelpath: HashMap<String, usize> = self
            .modules
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.uncrelpath.clone().map(|p| (p, i)))
            .collect();

        let mut next = -(self.modules.len() as i64);
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let Some(&i) = by_uncrelpath.get(line) else {
                continue;
            };
            if self.modules[i].sort_idx < 0 {
                continue;
            }
            self.modules[i].sort_idx = next;
            next += 1;
        }

        self.modules.sort_by_key(|m| m.sort_idx);
        for (i, m) in self.modules.iter_mut().enumerate() {
            m.idx = i;
        }
        self.by_name = self
            .modules
            .iter()
            .enumerate()
            .map(|(i, m)| (m.modname.clone(), i))
            .collect();
    }

    fn symbol_add(&mut self, name: &str, prefix_skipped: bool, crc: u64, owner: Option<usize>) {
        let mut name = name;
        if !prefix_skipped {
            if let Some(prefix) = self.cfg.sym_prefix {
                name = name.strip_prefix(prefix).unwrap_or(name);
            }
        }
        debug!("add sym={name}, owner={owner:?}");
        self.symbols
            .entry(name.to_owned())
            .or_insert(SymEntry { crc, owner });
    }

    fn symbol_find(&self, name: &str) -> Option<&SymEntry> {
        // PPC64 needs this: .foo == foo
        let name = name.strip_prefix('.').unwrap_or(name);
        let name = match self.cfg.sym_prefix {
            Some(prefix) => name.strip_prefix(prefix).unwrap_or(name),
            None => name,
        };
        self.symbols.get(name)
    }

    fn add_fake_syms(&mut self) {
        // __this_module is magically inserted by the kernel loader.
        self.symbol_add("__this_module", true, 0, None);
        // On S390, this is faked up too.
        self.symbol_add("_GLOBAL_OFFSET_TABLE_", true, 0, None);
        // On PowerPC64 ABIv2, .TOC. is more or less _GLOBAL_OFFSET_TABLE_.
        if self.symbol_find("TOC.").is_none() {
            self.symbol_add("TOC.", true, 0, None);
        }
    }

    /// Seed kernel symbols from a `Module.symvers` file.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file cannot be read
    pub fn load_symvers(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)?;
        for (linenum, line) in text.lines().enumerate() {
            // e.g. "0xb352177e\tfind_first_bit\tvmlinux\tEXPORT_SYMBOL"
            let mut fields = line.split_whitespace();
            let (Some(ver), Some(sym), Some(whence)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if whence != "vmlinux" {
                continue;
            }
            match u64::from_str_radix(ver.trim_start_matches("0x"), 16) {
                Ok(crc) => self.symbol_add(sym, false, crc, None),
                Err(_) => error!("{}:{} invalid symbol version {ver}", path.display(), linenum + 1),
            }
        }
        Ok(())
    }

    /// Seed kernel symbols from a `System.map` file: only `__crc_` entries
    /// carry version information there.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file cannot be read
    pub fn load_system_map(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)?;
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let (Some(addr), Some(_kind), Some(name)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let stripped = match self.cfg.sym_prefix {
                Some(prefix) => name.strip_prefix(prefix).unwrap_or(name),
                None => name,
            };
            let Some(sym) = stripped.strip_prefix("__crc_") else {
                continue;
            };
            if let Ok(crc) = u64::from_str_radix(addr, 16) {
                self.symbol_add(sym, true, crc, None);
            }
        }
        Ok(())
    }

    /// Read every module's ELF data: exported symbols into the global
    /// table, `.modinfo` and dependency symbols onto the module. Broken
    /// modules are logged and skipped.
    fn load_modules(&mut self) {
        debug!("load symbols ({} modules)", self.modules.len());

        for i in 0..self.modules.len() {
            let path = self.modules[i].path.clone();
            let image = match read_bytes(&path) {
                Ok(data) => data,
                Err(e) => {
                    error!("failed to read {}: {e}", path.display());
                    continue;
                }
            };
            let elf = match Elf::new(&image) {
                Ok(elf) => elf,
                Err(e) => {
                    error!("failed to parse {}: {e}", path.display());
                    continue;
                }
            };

            match elf.symbols() {
                Ok(syms) if syms.is_empty() => debug!("ignoring {}: no symbols", path.display()),
                Ok(syms) => {
                    for sym in syms {
                        self.symbol_add(&sym.name, false, sym.crc, Some(i));
                    }
                }
                Err(e) => error!("failed to load symbols from {}: {e}", path.display()),
            }

            self.modules[i].info = elf.modinfo().unwrap_or_default();
            self.modules[i].dep_syms = match elf.dependency_symbols() {
                Ok(syms) => syms,
                Err(e) => {
                    debug!("no dependency symbols in {}: {e}", path.display());
                    Vec::new()
                }
            };
        }

        debug!(
            "loaded symbols ({} modules, {} symbols)",
            self.modules.len(),
            self.symbols.len()
        );
    }

    fn load_dependencies(&mut self) {
        for i in 0..self.modules.len() {
            let dep_syms = std::mem::take(&mut self.modules[i].dep_syms);
            for sym in &dep_syms {
                let is_weak = sym.bind == SymbolBind::Weak;
                let Some(entry) = self.symbol_find(&sym.name) else {
                    if self.cfg.print_unknown && !is_weak {
                        warn!(
                            "{} needs unknown symbol {}",
                            self.modules[i].path.display(),
                            sym.name
                        );
                    }
                    continue;
                };

                if self.cfg.check_symvers && entry.crc != sym.crc && !is_weak {
                    if self.cfg.print_unknown {
                        warn!(
                            "{} disagrees about version of symbol {}",
                            self.modules[i].path.display(),
                            sym.name
                        );
                    }
                }

                let Some(owner) = entry.owner else { continue };
                if owner == i {
                    continue;
                }
                if !self.modules[i].deps.contains(&owner) {
                    debug!(
                        "{} depends on {}",
                        self.modules[i].modname, self.modules[owner].modname
                    );
                    self.modules[i].deps.push(owner);
                    self.modules[owner].users += 1;
                }
            }
            self.modules[i].dep_syms = dep_syms;
        }
    }

    /// Kahn-style topological sort. Leftover nodes form cycles, which are
    /// reported with the full chain.
    fn calculate_dependencies(&mut self) -> Result<()> {
        let n_mods = self.modules.len();
        debug!("calculate dependencies and ordering ({n_mods} modules)");

        let mut users: Vec<u32> = self.modules.iter().map(|m| m.users).collect();
        let mut roots: Vec<usize> = (0..n_mods).filter(|&i| users[i] == 0).collect();
        let mut n_sorted = 0;

        while let Some(src) = roots.pop() {
            self.modules[src].dep_sort_idx = n_sorted;
            n_sorted += 1;
            for d in self.modules[src].deps.clone() {
                users[d] -= 1;
                if users[d] == 0 {
                    roots.push(d);
                }
            }
        }

        if (n_sorted as usize) < n_mods {
            let chains = self.report_cycles(&users);
            error!(
                "Found {} modules in dependency cycles!",
                chains.iter().map(|c| c.1).sum::<usize>()
            );
            return Err(Error::Cycle(
                chains
                    .into_iter()
                    .map(|c| c.0)
                    .collect::<Vec<_>>()
                    .join(", "),
            ));
        }

        let dep_sort: Vec<i64> = self.modules.iter().map(|m| m.dep_sort_idx).collect();
        for m in &mut self.modules {
            m.deps.sort_by_key(|&d| dep_sort[d]);
        }

        debug!("calculated dependencies and ordering ({n_mods} modules)");
        Ok(())
    }

    /// Walk the unsorted remainder of the graph and extract each cycle as
    /// a printable chain. Returns `(chain, member count)` pairs.
    fn report_cycles(&self, users: &[u32]) -> Vec<(String, usize)> {
        let remaining: Vec<bool> = users.iter().map(|&u| u > 0).collect();
        let mut in_cycle = vec![false; self.modules.len()];
        let mut chains = Vec::new();

        for start in 0..self.modules.len() {
            if !remaining[start] || in_cycle[start] {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = vec![false; self.modules.len()];
            if let Some(chain) =
                self.find_cycle_from(start, &remaining, &in_cycle, &mut path, &mut on_path)
            {
                for &i in &chain {
                    in_cycle[i] = true;
                }
                let mut names: Vec<&str> =
                    chain.iter().map(|&i| self.modules[i].modname.as_str()).collect();
                names.push(&self.modules[chain[0]].modname);
                let text = names.join(" -> ");
                error!("Cycle detected: {text}");
                chains.push((text, chain.len()));
            }
        }
        chains
    }

    fn find_cycle_from(
        &self,
        node: usize,
        remaining: &[bool],
        in_cycle: &[bool],
        path: &mut Vec<usize>,
        on_path: &mut [bool],
    ) -> Option<Vec<usize>> {
        if on_path[node] {
            let pos = path.iter().position(|&p| p == node).unwrap();
            return Some(path[pos..].to_vec());
        }

        path.push(node);
        on_path[node] = true;
        for &d in &self.modules[node].deps {
            if !remaining[d] || in_cycle[d] {
                continue;
            }
            if let Some(chain) = self.find_cycle_from(d, remaining, in_cycle, path, on_path) {
                return Some(chain);
            }
        }
        path.pop();
        on_path[node] = false;
        None
    }

    /// Transitive dependency closure of module `i`, ordered by the
    /// topological sort.
    fn all_sorted_dependencies(&self, i: usize) -> Vec<usize> {
        let mut out = Vec::new();
        self.fill_unique_deps(i, &mut out);
        out.sort_by_key(|&d| self.modules[d].dep_sort_idx);
        out
    }

    fn fill_unique_deps(&self, i: usize, out: &mut Vec<usize>) {
        for &d in &self.modules[i].deps {
            if !out.contains(&d) {
                out.push(d);
                self.fill_unique_deps(d, out);
            }
        }
    }
}

// Output emission
impl Depmod<'_> {
    /// Write every artifact into `outdir` (default: the module
    /// directory), each through a temp file renamed into place.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] on write or rename failure
    pub fn write_outputs(&self, outdir: Option<&Path>) -> Result<()> {
        let dir = outdir.unwrap_or_else(|| self.ctx.dirname());
        fs::create_dir_all(dir)?;

        type EmitFn = fn(&Depmod, &mut dyn Write) -> Result<()>;
        let outputs: [(&str, EmitFn); 11] = [
            ("modules.dep", |d, w| d.output_deps(w)),
            ("modules.dep.bin", |d, w| d.output_deps_bin(w)),
            ("modules.alias", |d, w| d.output_aliases(w)),
            ("modules.alias.bin", |d, w| d.output_aliases_bin(w)),
            ("modules.softdep", |d, w| d.output_softdeps(w)),
            ("modules.weakdep", |d, w| d.output_weakdeps(w)),
            ("modules.symbols", |d, w| d.output_symbols(w)),
            ("modules.symbols.bin", |d, w| d.output_symbols_bin(w)),
            ("modules.builtin.bin", |d, w| d.output_builtin_bin(w)),
            ("modules.builtin.alias.bin", |d, w| d.output_builtin_alias_bin(w)),
            ("modules.devname", |d, w| d.output_devname(w)),
        ];

        for (name, emit) in outputs {
            let tmp = NamedTempFile::new_in(dir)?;
            {
                let mut writer = BufWriter::new(tmp.as_file());
                emit(self, &mut writer)?;
                writer.flush()?;
            }
            tmp.persist(dir.join(name)).map_err(|e| Error::Io(e.error))?;
        }
        Ok(())
    }

    fn info_values<'a>(&'a self, m: &'a Mod, key: &'a str) -> impl Iterator<Item = &'a str> {
        m.info.iter().filter_map(move |s| {
            s.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    fn output_deps(&self, out: &mut dyn Write) -> Result<()> {
        for m in &self.modules {
            writeln!(out, "{}", self.dep_line(m))?;
        }
        Ok(())
    }

    fn dep_line(&self, m: &Mod) -> String {
        let mut line = format!("{}:", m.output_path());
        for d in self.all_sorted_dependencies(m.idx) {
            line.push(' ');
            line.push_str(&self.modules[d].output_path());
        }
        line
    }

    fn output_deps_bin(&self, out: &mut dyn Write) -> Result<()> {
        let mut idx = IndexBuilder::new();
        for m in &self.modules {
            let line = self.dep_line(m);
            let duplicate = idx.insert(&m.modname, &line, m.idx as u32);
            if duplicate && self.cfg.warn_dups {
                warn!("duplicate module deps:\n{line}");
            }
        }
        write_index(&idx, out)
    }

    fn output_aliases(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "# Aliases extracted from modules themselves.")?;
        for m in &self.modules {
            for value in self.info_values(m, "alias") {
                writeln!(out, "alias {value} {}", m.modname)?;
            }
        }
        Ok(())
    }

    fn output_aliases_bin(&self, out: &mut dyn Write) -> Result<()> {
        let mut idx = IndexBuilder::new();
        for m in &self.modules {
            for value in self.info_values(m, "alias") {
                let alias = match alias_normalize(value) {
                    Ok(a) => a,
                    Err(_) => {
                        warn!("Unmatched bracket in {value}");
                        continue;
                    }
                };
                let duplicate = idx.insert(&alias, &m.modname, m.idx as u32);
                if duplicate && self.cfg.warn_dups {
                    warn!("duplicate module alias:\n{alias} {}", m.modname);
                }
            }
        }
        write_index(&idx, out)
    }

    fn output_softdeps(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "# Soft dependencies extracted from modules themselves.")?;
        for m in &self.modules {
            for value in self.info_values(m, "softdep") {
                writeln!(out, "softdep {} {value}", m.modname)?;
            }
        }
        Ok(())
    }

    fn output_weakdeps(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "# Weak dependencies extracted from modules themselves.")?;
        for m in &self.modules {
            for value in self.info_values(m, "weakdep") {
                writeln!(out, "weakdep {} {value}", m.modname)?;
            }
        }
        Ok(())
    }

    /// Symbols sorted by name so the artifact is reproducible.
    fn sorted_owned_symbols(&self) -> Vec<(&str, usize)> {
        let mut syms: Vec<(&str, usize)> = self
            .symbols
            .iter()
            .filter_map(|(name, entry)| entry.owner.map(|o| (name.as_str(), o)))
            .collect();
        syms.sort_by_key(|&(name, _)| name);
        syms
    }

    fn output_symbols(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "# Aliases for symbols, used by symbol_request().")?;
        for (name, owner) in self.sorted_owned_symbols() {
            writeln!(out, "alias symbol:{name} {}", self.modules[owner].modname)?;
        }
        Ok(())
    }

    fn output_symbols_bin(&self, out: &mut dyn Write) -> Result<()> {
        let mut idx = IndexBuilder::new();
        for (name, owner) in self.sorted_owned_symbols() {
            let key = format!("symbol:{name}");
            let m = &self.modules[owner];
            let duplicate = idx.insert(&key, &m.modname, m.idx as u32);
            if duplicate && self.cfg.warn_dups {
                warn!("duplicate module syms:\n{key} {}", m.modname);
            }
        }
        write_index(&idx, out)
    }

    /// `modules.builtin` (written by the kernel build) becomes a
    /// membership set.
    fn output_builtin_bin(&self, out: &mut dyn Write) -> Result<()> {
        let mut idx = IndexBuilder::new();
        if let Ok(text) = fs::read_to_string(self.ctx.dirname().join("modules.builtin")) {
            for line in text.lines() {
                if !line.starts_with(|c: char| c.is_ascii_alphabetic()) {
                    if !line.is_empty() {
                        error!("Invalid modules.builtin line: {line}");
                    }
                    continue;
                }
                if let Some(modname) = path_to_modname(Path::new(line)) {
                    idx.insert(&modname, "", 0);
                }
            }
        }
        write_index(&idx, out)
    }

    /// `modules.builtin.modinfo` holds `modname.key=value` records,
    /// nul-separated; the alias entries become an index of their own.
    fn output_builtin_alias_bin(&self, out: &mut dyn Write) -> Result<()> {
        let mut idx = IndexBuilder::new();
        if let Ok(data) = fs::read(self.ctx.dirname().join("modules.builtin.modinfo")) {
            for record in data.split(|&b| b == 0) {
                let Ok(record) = std::str::from_utf8(record) else {
                    continue;
                };
                let Some((lhs, value)) = record.split_once('=') else {
                    continue;
                };
                let Some((modname, key)) = lhs.split_once('.') else {
                    continue;
                };
                if key != "alias" || value.is_empty() {
                    continue;
                }
                match alias_normalize(value) {
                    Ok(alias) => {
                        idx.insert(&alias, modname, 0);
                    }
                    Err(_) => warn!("Unmatched bracket in {value}"),
                }
            }
        }
        write_index(&idx, out)
    }

    fn output_devname(&self, out: &mut dyn Write) -> Result<()> {
        let mut empty = true;
        for m in &self.modules {
            let mut devname = None;
            let mut node = None;
            for value in self.info_values(m, "alias") {
                if let Some(name) = value.strip_prefix("devname:") {
                    devname = Some(name);
                } else if let Some((maj, min)) = parse_major_minor(value, "char-major-") {
                    node = Some(('c', maj, min));
                } else if let Some((maj, min)) = parse_major_minor(value, "block-major-") {
                    node = Some(('b', maj, min));
                }
                if devname.is_some() && node.is_some() {
                    break;
                }
            }

            let Some(devname) = devname else { continue };
            let Some((kind, maj, min)) = node else {
                error!(
                    "Module '{}' has devname ({devname}) but lacks major and minor \
                     information. Ignoring.",
                    m.modname
                );
                continue;
            };
            if empty {
                writeln!(out, "# Device nodes to trigger on-demand module loading.")?;
                empty = false;
            }
            writeln!(out, "{} {devname} {kind}{maj}:{min}", m.modname)?;
        }
        Ok(())
    }
}

fn write_index(idx: &IndexBuilder, out: &mut dyn Write) -> Result<()> {
    // The trie serializer needs to seek back to patch the root offset.
    let mut buf = std::io::Cursor::new(Vec::new());
    idx.write(&mut buf)?;
    out.write_all(&buf.into_inner())?;
    Ok(())
}

fn should_exclude_dir(name: &str, excludes: &[String]) -> bool {
    if name.starts_with('.') {
        return true;
    }
    if name == "build" || name == "source" {
        return true;
    }
    excludes.iter().any(|e| e == name)
}

fn strip_compression_suffix(relpath: &str) -> String {
    for suffix in [".gz", ".xz", ".zst"] {
        if let Some(stripped) = relpath.strip_suffix(suffix) {
            return stripped.to_owned();
        }
    }
    relpath.to_owned()
}

fn rel_under(rel: Option<&str>, sub: &str) -> bool {
    rel.map_or(false, |r| {
        r.len() > sub.len() && r.starts_with(sub) && r.as_bytes()[sub.len()] == b'/'
    })
}

fn parse_major_minor(value: &str, prefix: &str) -> Option<(u32, u32)> {
    let rest = value.strip_prefix(prefix)?;
    let (maj, min) = rest.split_once('-')?;
    Some((maj.parse().ok()?, min.parse().ok()?))
}
