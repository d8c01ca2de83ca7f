//! Alias resolution
//!
//! Turns a user-supplied string (module name, alias pattern, `symbol:<sym>`
//! form, device alias) into module records. Sources are consulted in a
//! fixed order and the first non-empty result wins:
//!
//! 1. configuration aliases (pattern match)
//! 2. `modules.dep` (exact)
//! 3. `modules.symbols` (wildcard, `symbol:` prefix only)
//! 4. configuration install/remove commands (exact)
//! 5. `modules.alias` (wildcard)
//! 6. `modules.builtin.alias` (wildcard)
//! 7. `modules.builtin` (exact)
use glob::Pattern;
use log::debug;

use crate::{
    context::{Context, IndexKind},
    error::Result,
    module::Module,
    util::{alias_normalize, modname_normalize},
};

type LookupFn = for<'ctx> fn(&'ctx Context, &str, &mut Vec<Module<'ctx>>) -> Result<()>;

impl Context {
    /// Resolve `given_alias` to module records.
    ///
    /// # Errors
    ///
    /// - [`crate::error::Error::InvalidInput`] on a malformed alias
    pub fn lookup_alias(&self, given_alias: &str) -> Result<Vec<Module<'_>>> {
        static LOOKUP: &[LookupFn] = &[
            lookup_config_aliases,
            lookup_moddep,
            lookup_symbols_index,
            lookup_commands,
            lookup_aliases_index,
            lookup_builtin_aliases_index,
            lookup_builtin_index,
        ];

        let alias = alias_normalize(given_alias)?;
        debug!("input alias={given_alias}, normalized={alias}");
        self.run_lookup(LOOKUP, &alias)
    }

    /// Strict by-name resolution: only `modules.dep` and the builtin
    /// indexes are consulted.
    ///
    /// # Errors
    ///
    /// Same as [`Context::lookup_alias`].
    pub fn lookup_name(&self, modname: &str) -> Result<Option<Module<'_>>> {
        static LOOKUP: &[LookupFn] = &[
            lookup_moddep,
            lookup_builtin_aliases_index,
            lookup_builtin_index,
        ];

        let name = modname_normalize(modname);
        debug!("input modname={modname}, normalized={name}");
        Ok(self.run_lookup(LOOKUP, &name)?.into_iter().next())
    }

    fn run_lookup<'ctx>(
        &'ctx self,
        lookup: &[LookupFn],
        s: &str,
    ) -> Result<Vec<Module<'ctx>>> {
        let mut list = Vec::new();
        for f in lookup {
            f(self, s, &mut list)?;
            if !list.is_empty() {
                return Ok(list);
            }
        }
        Ok(list)
    }
}

/// Source 1: `alias` lines from modprobe.d, matched as patterns.
fn lookup_config_aliases<'ctx>(
    ctx: &'ctx Context,
    name: &str,
    list: &mut Vec<Module<'ctx>>,
) -> Result<()> {
    for alias in &ctx.config().aliases {
        let matches = Pattern::new(&alias.name)
            .map(|p| p.matches(name))
            .unwrap_or(false);
        if matches {
            list.push(ctx.module_from_alias(&alias.name, &alias.modname));
        }
    }
    Ok(())
}

/// Source 2: exact `modules.dep` hit. Fills the dependency list from the
/// same line while it is at hand.
fn lookup_moddep<'ctx>(ctx: &'ctx Context, name: &str, list: &mut Vec<Module<'ctx>>) -> Result<()> {
    // Module names do not contain ':'; return early if we know the
    // search cannot succeed.
    if name.contains(':') {
        return Ok(());
    }

    if let Some(line) = ctx.search_moddep(name) {
        let m = ctx.module_from_name(name);
        if ctx.with_record(m.id(), |r| r.dep.is_none()) {
            let deps = ctx.parse_depline(m.id(), &line);
            ctx.with_record_mut(m.id(), |r| r.dep = Some(deps));
        }
        list.push(m);
    }
    Ok(())
}

/// Source 3: `modules.symbols`, only for `symbol:`-prefixed input.
fn lookup_symbols_index<'ctx>(
    ctx: &'ctx Context,
    name: &str,
    list: &mut Vec<Module<'ctx>>,
) -> Result<()> {
    if !name.starts_with("symbol:") {
        return Ok(());
    }
    for value in ctx.index_search_wild(IndexKind::Symbols, name) {
        list.push(ctx.module_from_alias(name, &value.value));
    }
    Ok(())
}

/// Source 4: install/remove commands name a module even without a file on
/// disk. Exact match; first hit wins, install before remove.
fn lookup_commands<'ctx>(
    ctx: &'ctx Context,
    name: &str,
    list: &mut Vec<Module<'ctx>>,
) -> Result<()> {
    for cmd in &ctx.config().install_commands {
        if cmd.modname == name {
            let m = ctx.module_from_name(name);
            ctx.set_install_command(m.id(), &cmd.command);
            list.push(m);
            return Ok(());
        }
    }
    for cmd in &ctx.config().remove_commands {
        if cmd.modname == name {
            let m = ctx.module_from_name(name);
            ctx.set_remove_command(m.id(), &cmd.command);
            list.push(m);
            return Ok(());
        }
    }
    Ok(())
}

/// Source 5: the big device-alias index.
fn lookup_aliases_index<'ctx>(
    ctx: &'ctx Context,
    name: &str,
    list: &mut Vec<Module<'ctx>>,
) -> Result<()> {
    for value in ctx.index_search_wild(IndexKind::Alias, name) {
        list.push(ctx.module_from_alias(name, &value.value));
    }
    Ok(())
}

/// Source 6: aliases of builtin modules; results are marked builtin.
fn lookup_builtin_aliases_index<'ctx>(
    ctx: &'ctx Context,
    name: &str,
    list: &mut Vec<Module<'ctx>>,
) -> Result<()> {
    for value in ctx.index_search_wild(IndexKind::BuiltinAlias, name) {
        let m = ctx.module_from_alias(name, &value.value);
        ctx.set_builtin(m.id(), true);
        list.push(m);
    }
    Ok(())
}

/// Source 7: the builtin membership set, exact match.
fn lookup_builtin_index<'ctx>(
    ctx: &'ctx Context,
    name: &str,
    list: &mut Vec<Module<'ctx>>,
) -> Result<()> {
    if ctx.index_search(IndexKind::Builtin, name).is_some() {
        let m = ctx.module_from_name(name);
        ctx.set_builtin(m.id(), true);
        list.push(m);
    }
    Ok(())
}
