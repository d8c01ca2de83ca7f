//! Probe planning: ordered module insertion and removal
//!
//! A probe takes a root module and produces the flat, ordered action list
//! that gets it (and everything it needs) into or out of the kernel:
//! dependencies first, then softdep-pre modules, the module itself, then
//! softdep-post modules. Visit flags on the pool records keep cyclic
//! softdep graphs from recursing forever, and every module appears at most
//! once.
//!
//! Execution is routed through a [`ProbeRunner`] so the shell-command and
//! syscall boundary stays injectable.
use std::collections::HashSet;

use bitflags::bitflags;
use log::{debug, warn};

use crate::{
    context::Context,
    error::{Error, Result},
    module::{Module, ModuleId},
    module_file::{remove_module, InsertFlags, ModuleFile, RemoveFlags},
};

bitflags! {
    /// Behavior switches for [`Module::probe_insert`].
    pub struct ProbeFlags: u32 {
        /// Pretend nothing is loaded; insert everything again.
        const IGNORE_LOADED = 1 << 0;
        /// Never run the root's install command, insert it directly.
        const IGNORE_COMMAND = 1 << 1;
        /// Report [`Error::AlreadyLoaded`] when the root is in the kernel.
        const FAIL_ON_LOADED = 1 << 2;
        /// Filter blacklisted modules out of the plan.
        const APPLY_BLACKLIST = 1 << 3;
    }
}

/// One step of a probe plan.
#[derive(Debug)]
pub enum ProbeAction<'ctx> {
    /// Run a configured install command.
    Install {
        module: Module<'ctx>,
        command: String,
    },

    /// Insert the module image with the given options.
    Insert {
        module: Module<'ctx>,
        options: String,
    },
}

impl<'ctx> ProbeAction<'ctx> {
    pub fn module(&self) -> &Module<'ctx> {
        match self {
            Self::Install { module, .. } | Self::Insert { module, .. } => module,
        }
    }
}

/// Boundary between planning and the world: shell commands and the module
/// syscalls. Tests inject a recorder.
pub trait ProbeRunner {
    /// Run an install/remove shell command.
    ///
    /// # Errors
    ///
    /// On spawn failure or nonzero exit.
    fn run_command(&mut self, modname: &str, command: &str) -> Result<()>;

    /// Insert a module image into the kernel.
    ///
    /// # Errors
    ///
    /// On read or syscall failure.
    fn insert(&mut self, module: &Module, options: &str) -> Result<()>;

    /// Remove a module from the kernel.
    ///
    /// # Errors
    ///
    /// On syscall failure.
    fn remove(&mut self, modname: &str, flags: RemoveFlags) -> Result<()>;
}

/// The production runner: `sh -c` for commands, the kmod syscalls for
/// insertion and removal.
#[derive(Debug, Default)]
pub struct KernelRunner;

impl ProbeRunner for KernelRunner {
    fn run_command(&mut self, modname: &str, command: &str) -> Result<()> {
        debug!("run {command}");
        let status = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .env("MODPROBE_MODULE", modname)
            .status()?;
        if !status.success() {
            return Err(Error::InvalidInput(format!(
                "command '{command}' for module {modname} exited with {status}"
            )));
        }
        Ok(())
    }

    fn insert(&mut self, module: &Module, options: &str) -> Result<()> {
        let name = module.name();
        let path = module.path().ok_or_else(|| Error::NotFound(name.clone()))?;
        ModuleFile::open(&path)?.insert(options, InsertFlags::empty())
    }

    fn remove(&mut self, modname: &str, flags: RemoveFlags) -> Result<()> {
        remove_module(modname, flags)
    }
}

/// Ordered, deduplicated probe list under construction.
struct ListBuilder {
    list: Vec<ModuleId>,
    appended: HashSet<ModuleId>,
}

impl ListBuilder {
    fn new() -> Self {
        Self {
            list: Vec::new(),
            appended: HashSet::new(),
        }
    }

    fn push(&mut self, id: ModuleId) {
        if self.appended.insert(id) {
            self.list.push(id);
        }
    }
}

fn get_probe_list(root: &Module, ignorecmd: bool) -> Vec<ModuleId> {
    let ctx = root.ctx;

    // Make sure we don't get screwed by previous calls.
    ctx.clear_visit_flags();

    let mut builder = ListBuilder::new();
    visit(ctx, root.id, true, ignorecmd, &mut builder);
    builder.list
}

fn visit(ctx: &Context, id: ModuleId, required: bool, ignorecmd: bool, out: &mut ListBuilder) {
    if ctx.with_record(id, |r| r.visited) {
        debug!("ignore module: already visited");
        return;
    }
    ctx.with_record_mut(id, |r| r.visited = true);

    let deps = ctx.module_dependencies(id);
    if required {
        // Set the required flag on the root and its dependency closure
        // before any of them can be reached through a softdep.
        ctx.with_record_mut(id, |r| r.required = true);
        for &d in &deps {
            ctx.with_record_mut(d, |r| r.required = true);
        }
    }

    for &d in &deps {
        fill_softdep(ctx, d, out);
    }

    if ignorecmd {
        out.push(id);
        ctx.with_record_mut(id, |r| r.ignore_cmd = true);
    } else {
        fill_softdep(ctx, id, out);
    }
}

fn fill_softdep(ctx: &Context, id: ModuleId, out: &mut ListBuilder) {
    let (pre, post) = ctx.module_softdeps(id);

    for m in &pre {
        visit(ctx, m.id, false, false, out);
    }

    out.push(id);
    // Install commands must not fire when softdeps orchestrate the
    // sequence.
    ctx.with_record_mut(id, |r| r.ignore_cmd = !pre.is_empty() || !post.is_empty());

    for m in &post {
        visit(ctx, m.id, false, false, out);
    }
}

impl Context {
    /// Drop modules whose name is blacklisted in the configuration.
    pub fn filter_blacklisted<'ctx>(&self, modules: Vec<Module<'ctx>>) -> Vec<Module<'ctx>> {
        modules
            .into_iter()
            .filter(|m| {
                let name = m.name();
                let out = self.config().blacklists.iter().any(|b| *b == name);
                if out {
                    debug!("filtering blacklisted module {name}");
                }
                !out
            })
            .collect()
    }

    pub(crate) fn is_blacklisted(&self, name: &str) -> bool {
        self.config().blacklists.iter().any(|b| b == name)
    }
}

// Probe operations
impl<'ctx> Module<'ctx> {
    /// Build the ordered action plan for inserting this module.
    ///
    /// Invariants: every required dependency precedes the root, each
    /// softdep-pre module precedes its dependent, each softdep-post
    /// follows it, and no module appears twice.
    ///
    /// # Errors
    ///
    /// - [`Error::Blacklisted`] if the root is filtered away
    pub fn probe_plan(
        &self,
        flags: ProbeFlags,
        extra_options: Option<&str>,
    ) -> Result<Vec<ProbeAction<'ctx>>> {
        let ctx = self.ctx;

        if flags.contains(ProbeFlags::APPLY_BLACKLIST) && ctx.is_blacklisted(&self.name()) {
            return Err(Error::Blacklisted(self.name()));
        }

        let list = get_probe_list(self, flags.contains(ProbeFlags::IGNORE_COMMAND));

        let mut actions = Vec::new();
        for id in list {
            let m = ctx.wrap(id);
            if flags.contains(ProbeFlags::APPLY_BLACKLIST) && ctx.is_blacklisted(&m.name()) {
                continue;
            }

            let mut options = m.options().unwrap_or_default();
            if id == self.id {
                if let Some(extra) = extra_options {
                    if !options.is_empty() {
                        options.push(' ');
                    }
                    options.push_str(extra);
                }
            }

            let ignore_cmd = ctx.with_record(id, |r| r.ignore_cmd);
            match m.install_command() {
                Some(cmd) if !ignore_cmd => {
                    let command = cmd.replace("$CMDLINE_OPTS", &options);
                    actions.push(ProbeAction::Install { module: m, command });
                }
                _ => actions.push(ProbeAction::Insert { module: m, options }),
            }
        }
        Ok(actions)
    }

    /// Resolve, order and insert this module together with its closure.
    ///
    /// Errors on the root or a required dependency abort the probe;
    /// errors on softdeps and other non-required modules are logged and
    /// skipped.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyLoaded`] with [`ProbeFlags::FAIL_ON_LOADED`]
    /// - [`Error::Blacklisted`] if the root is filtered away
    /// - whatever the runner reports for the root or a required module
    pub fn probe_insert(
        &self,
        flags: ProbeFlags,
        extra_options: Option<&str>,
        runner: &mut dyn ProbeRunner,
    ) -> Result<()> {
        if !flags.contains(ProbeFlags::IGNORE_LOADED) && self.is_inkernel() {
            if flags.contains(ProbeFlags::FAIL_ON_LOADED) {
                return Err(Error::AlreadyLoaded(self.name()));
            }
            return Ok(());
        }

        for action in self.probe_plan(flags, extra_options)? {
            let m = action.module();
            let name = m.name();

            if !flags.contains(ProbeFlags::IGNORE_LOADED) && m.is_inkernel() {
                debug!("ignoring module '{name}': already loaded");
                if m.id == self.id && flags.contains(ProbeFlags::FAIL_ON_LOADED) {
                    return Err(Error::AlreadyLoaded(name));
                }
                continue;
            }

            let result = match &action {
                ProbeAction::Install { command, .. } => runner.run_command(&name, command),
                ProbeAction::Insert { options, .. } => runner.insert(m, options),
            };

            if let Err(e) = result {
                // Racing another loader is fine unless the caller asked
                // to fail on it.
                if let Error::AlreadyLoaded(_) = e {
                    if m.id == self.id && flags.contains(ProbeFlags::FAIL_ON_LOADED) {
                        return Err(e);
                    }
                    continue;
                }
                let required = self.ctx.with_record(m.id, |r| r.required);
                if required {
                    return Err(e);
                }
                warn!("could not insert '{name}': {e}");
            }
        }
        Ok(())
    }

    /// Remove this module and, first, everything holding it.
    ///
    /// Holders are taken down in reverse order; a configured remove
    /// command replaces the syscall unless
    /// [`RemoveFlags::IGNORE_COMMAND`] is set.
    ///
    /// # Errors
    ///
    /// - [`Error::InUse`] if the refcount stays nonzero and
    ///   [`RemoveFlags::FORCE`] is unset
    pub fn probe_remove(&self, flags: RemoveFlags, runner: &mut dyn ProbeRunner) -> Result<()> {
        let name = self.name();

        let mut holders = self.holders().unwrap_or_default();
        holders.reverse();
        for holder in holders {
            holder.probe_remove(flags, runner)?;
        }

        let refcnt = self.refcount().unwrap_or(0);
        if refcnt > 0 && !flags.contains(RemoveFlags::FORCE) {
            return Err(Error::InUse(name));
        }

        match self.remove_command() {
            Some(cmd) if !flags.contains(RemoveFlags::IGNORE_COMMAND) => {
                runner.run_command(&name, &cmd)
            }
            _ => runner.remove(&name, flags),
        }
    }
}
