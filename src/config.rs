//! modprobe.d configuration model
//!
//! Parses an ordered list of configuration directories (or single files)
//! into flat, file-ordered lists of directives, then overlays
//! `/proc/cmdline`. The result is immutable; the source paths and their
//! mtimes are recorded so a [`crate::context::Context`] can detect
//! staleness.
//!
//! Within one directory files are sorted by name and only `.conf` and
//! `.alias` files are considered; a basename seen in an earlier directory
//! shadows the same basename in later ones.
use std::{
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use crate::util::{alias_normalize, path_mstamp};

/// `alias PATTERN MODNAME`
#[derive(Debug, Clone)]
pub struct Alias {
    pub name: String,
    pub modname: String,
}

/// `options MODNAME STRING`
#[derive(Debug, Clone)]
pub struct Options {
    pub modname: String,
    pub options: String,
}

/// `install MODNAME CMD` / `remove MODNAME CMD`
#[derive(Debug, Clone)]
pub struct Command {
    pub modname: String,
    pub command: String,
}

/// `softdep MODNAME pre: MODS... post: MODS...`
#[derive(Debug, Clone)]
pub struct Softdep {
    pub name: String,
    pub pre: Vec<String>,
    pub post: Vec<String>,
}

/// `weakdep MODNAME MODS...`
#[derive(Debug, Clone)]
pub struct Weakdep {
    pub name: String,
    pub weak: Vec<String>,
}

/// Parsed configuration, in file order.
#[derive(Debug, Default)]
pub struct Config {
    pub aliases: Vec<Alias>,
    pub blacklists: Vec<String>,
    pub options: Vec<Options>,
    pub install_commands: Vec<Command>,
    pub remove_commands: Vec<Command>,
    pub softdeps: Vec<Softdep>,
    pub weakdeps: Vec<Weakdep>,
    /// Source paths with their mtime stamps at parse time.
    paths: Vec<(PathBuf, u64)>,
}

// Constructors
impl Config {
    /// Parse every configuration file reachable from `config_paths`, then
    /// overlay the kernel command line.
    ///
    /// Unreadable paths are skipped with a debug message; a missing
    /// `/proc/cmdline` is not an error.
    pub fn load(config_paths: &[PathBuf]) -> Self {
        let mut config = Self::load_files(config_paths);
        if let Ok(cmdline) = fs::read_to_string("/proc/cmdline") {
            config.parse_kcmdline(&cmdline);
        }
        config
    }

    /// [`Config::load`] without the `/proc/cmdline` overlay.
    pub fn load_files(config_paths: &[PathBuf]) -> Self {
        let mut config = Self::default();
        let mut files: Vec<(String, PathBuf)> = Vec::new();

        for path in config_paths {
            let meta = match fs::metadata(path) {
                Ok(m) => m,
                Err(e) => {
                    debug!("could not stat {}: {e}", path.display());
                    continue;
                }
            };
            config.paths.push((path.clone(), path_mstamp(path)));

            if meta.is_file() {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if !files.iter().any(|(n, _)| *n == name) {
                    files.push((name, path.clone()));
                }
                continue;
            }

            let entries = match fs::read_dir(path) {
                Ok(e) => e,
                Err(e) => {
                    debug!("could not read {}: {e}", path.display());
                    continue;
                }
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if filter_out_conf_file(&name) || entry.path().is_dir() {
                    continue;
                }
                if files.iter().any(|(n, _)| *n == name) {
                    debug!("ignoring duplicate config file {name}");
                    continue;
                }
                files.push((name, entry.path()));
            }
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, path) in &files {
            config.parse_file(path);
        }
        config
    }

    fn parse_file(&mut self, path: &Path) {
        let file = match fs::File::open(path) {
            Ok(f) => f,
            Err(e) => {
                debug!("could not open {}: {e}", path.display());
                return;
            }
        };
        debug!("parsing file {}", path.display());

        let filename = path.display().to_string();
        let mut reader = BufReader::new(file);
        let mut linenum = 0;
        while let Some(line) = getline_wrapped(&mut reader, &mut linenum) {
            self.parse_line(&line, &filename, linenum);
        }
    }

    /// Source paths with their mtimes, for staleness checks.
    pub(crate) fn paths(&self) -> &[(PathBuf, u64)] {
        &self.paths
    }
}

// Line grammar
impl Config {
    fn parse_line(&mut self, line: &str, filename: &str, linenum: u32) {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            return;
        }

        let Some((cmd, rest)) = split_token(line) else {
            return;
        };

        let parsed = match cmd {
            "alias" => self.parse_alias(rest),
            "blacklist" => self.parse_blacklist(rest),
            "options" => self.parse_options(rest),
            "install" => self.parse_command(rest, true),
            "remove" => self.parse_command(rest, false),
            "softdep" => self.parse_softdep(rest),
            "weakdep" => self.parse_weakdep(rest),
            "include" | "config" => {
                info!("{filename}: command {cmd} not implemented yet");
                Some(())
            }
            _ => None,
        };

        if parsed.is_none() {
            warn!("{filename} line {linenum}: ignoring bad line starting with '{cmd}'");
        }
    }

    fn parse_alias(&mut self, rest: &str) -> Option<()> {
        let (alias, rest) = split_token(rest)?;
        let (modname, _) = split_token(rest)?;
        self.aliases.push(Alias {
            name: alias_normalize(alias).ok()?,
            modname: alias_normalize(modname).ok()?,
        });
        Some(())
    }

    fn parse_blacklist(&mut self, rest: &str) -> Option<()> {
        let (modname, _) = split_token(rest)?;
        self.blacklists.push(alias_normalize(modname).ok()?);
        Some(())
    }

    fn parse_options(&mut self, rest: &str) -> Option<()> {
        let (modname, options) = split_token(rest)?;
        if options.is_empty() {
            return None;
        }
        self.options.push(Options {
            modname: alias_normalize(modname).ok()?,
            options: options.replace('\t', " "),
        });
        Some(())
    }

    fn parse_command(&mut self, rest: &str, install: bool) -> Option<()> {
        let (modname, command) = split_token(rest)?;
        if command.is_empty() {
            return None;
        }
        let list = if install {
            &mut self.install_commands
        } else {
            &mut self.remove_commands
        };
        list.push(Command {
            modname: alias_normalize(modname).ok()?,
            command: command.to_owned(),
        });
        Some(())
    }

    fn parse_softdep(&mut self, rest: &str) -> Option<()> {
        let (modname, deps) = split_token(rest)?;
        if deps.is_empty() {
            return None;
        }

        let mut pre = Vec::new();
        let mut post = Vec::new();
        let mut mode: Option<&mut Vec<String>> = None;
        for tok in deps.split_whitespace() {
            match tok {
                "pre:" => mode = Some(&mut pre),
                "post:" => mode = Some(&mut post),
                dep => {
                    if let Some(list) = mode.as_mut() {
                        list.push(alias_normalize(dep).ok()?);
                    }
                }
            }
        }

        self.softdeps.push(Softdep {
            name: alias_normalize(modname).ok()?,
            pre,
            post,
        });
        Some(())
    }

    fn parse_weakdep(&mut self, rest: &str) -> Option<()> {
        let (modname, deps) = split_token(rest)?;
        if deps.is_empty() {
            return None;
        }
        let weak = deps
            .split_whitespace()
            .map(alias_normalize)
            .collect::<Result<Vec<_>, _>>()
            .ok()?;
        self.weakdeps.push(Weakdep {
            name: alias_normalize(modname).ok()?,
            weak,
        });
        Some(())
    }
}

// Kernel command line
impl Config {
    /// Overlay the kernel command line: `<modname>.<param>=<value>` tokens
    /// become options entries, `modprobe.blacklist=<comma-list>` adds
    /// blacklist entries.
    pub fn parse_kcmdline(&mut self, cmdline: &str) {
        for token in cmdline.split_whitespace() {
            let Some((lhs, value)) = token.split_once('=') else {
                continue;
            };
            let Some((modname, param)) = lhs.split_once('.') else {
                continue;
            };
            if modname.is_empty() || param.is_empty() {
                continue;
            }

            if modname == "modprobe" && param == "blacklist" {
                for name in value.split(',').filter(|n| !n.is_empty()) {
                    if let Ok(name) = alias_normalize(name) {
                        self.blacklists.push(name);
                    }
                }
                continue;
            }

            debug!("kcmdline option {modname}.{param}");
            if let Ok(modname) = alias_normalize(modname) {
                self.options.push(Options {
                    modname,
                    options: format!("{param}={value}"),
                });
            }
        }
    }
}

/// First whitespace-delimited token and the trimmed remainder.
fn split_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(|c: char| c.is_whitespace()) {
        Some(at) => Some((&s[..at], s[at..].trim_start())),
        None => Some((s, "")),
    }
}

/// Read one logical line, joining physical lines ending in `\`.
fn getline_wrapped<R: BufRead>(reader: &mut R, linenum: &mut u32) -> Option<String> {
    let mut out = String::new();
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) if out.is_empty() => return None,
            Ok(0) => return Some(out),
            Ok(_) => {}
            Err(_) => return None,
        }
        *linenum += 1;

        let trimmed = line.trim_end_matches(|c| c == '\n' || c == '\r');
        if let Some(stripped) = trimmed.strip_suffix('\\') {
            out.push_str(stripped);
            continue;
        }
        out.push_str(trimmed);
        return Some(out);
    }
}

fn filter_out_conf_file(name: &str) -> bool {
    if name.starts_with('.') {
        return true;
    }
    !(name.ends_with(".conf") || name.ends_with(".alias"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use anyhow::Result;
    use tempfile::TempDir;

    use super::*;

    fn write_conf(dir: &TempDir, name: &str, content: &str) -> Result<()> {
        let mut f = fs::File::create(dir.path().join(name))?;
        f.write_all(content.as_bytes())?;
        Ok(())
    }

    fn load_dir(dir: &TempDir) -> Config {
        Config::load_files(&[dir.path().to_path_buf()])
    }

    #[test]
    fn parses_all_directives() -> Result<()> {
        let dir = TempDir::new()?;
        write_conf(
            &dir,
            "10-test.conf",
            "# a comment\n\
             \n\
             alias net-pf-16 af_netlink\n\
             blacklist pcspkr\n\
             options snd-intel8x0\tindex=0\n\
             install fake-mod /bin/true $CMDLINE_OPTS\n\
             remove fake-mod /bin/false\n\
             softdep snd-pcm pre: dep-a dep-b post: dep-c\n\
             weakdep xhci-hcd extra-mod\n",
        )?;
        let config = load_dir(&dir);

        assert_eq!(config.aliases.len(), 1);
        assert_eq!(config.aliases[0].name, "net_pf_16");
        assert_eq!(config.aliases[0].modname, "af_netlink");

        assert_eq!(config.blacklists, ["pcspkr"]);

        assert_eq!(config.options[0].modname, "snd_intel8x0");
        assert_eq!(config.options[0].options, "index=0");

        assert_eq!(config.install_commands[0].modname, "fake_mod");
        assert_eq!(config.install_commands[0].command, "/bin/true $CMDLINE_OPTS");
        assert_eq!(config.remove_commands[0].command, "/bin/false");

        let dep = &config.softdeps[0];
        assert_eq!(dep.name, "snd_pcm");
        assert_eq!(dep.pre, ["dep_a", "dep_b"]);
        assert_eq!(dep.post, ["dep_c"]);

        assert_eq!(config.weakdeps[0].name, "xhci_hcd");
        assert_eq!(config.weakdeps[0].weak, ["extra_mod"]);
        Ok(())
    }

    #[test]
    fn continuation_lines_join() -> Result<()> {
        let dir = TempDir::new()?;
        write_conf(&dir, "a.conf", "alias some-\\\nalias target-mod\n")?;
        let config = load_dir(&dir);
        assert_eq!(config.aliases[0].name, "some_alias");
        assert_eq!(config.aliases[0].modname, "target_mod");
        Ok(())
    }

    #[test]
    fn bad_lines_are_skipped() -> Result<()> {
        let dir = TempDir::new()?;
        write_conf(
            &dir,
            "a.conf",
            "frobnicate everything\nalias missing-modname\nblacklist floppy\n",
        )?;
        let config = load_dir(&dir);
        assert!(config.aliases.is_empty());
        assert_eq!(config.blacklists, ["floppy"]);
        Ok(())
    }

    #[test]
    fn files_sorted_by_name_across_dirs() -> Result<()> {
        let first = TempDir::new()?;
        let second = TempDir::new()?;
        write_conf(&first, "20-b.conf", "blacklist bbb\n")?;
        write_conf(&second, "10-a.conf", "blacklist aaa\n")?;

        let config =
            Config::load_files(&[first.path().to_path_buf(), second.path().to_path_buf()]);
        assert_eq!(config.blacklists, ["aaa", "bbb"]);
        Ok(())
    }

    #[test]
    fn duplicate_basenames_shadow() -> Result<()> {
        let first = TempDir::new()?;
        let second = TempDir::new()?;
        write_conf(&first, "same.conf", "blacklist from-first\n")?;
        write_conf(&second, "same.conf", "blacklist from-second\n")?;

        let config =
            Config::load_files(&[first.path().to_path_buf(), second.path().to_path_buf()]);
        assert_eq!(config.blacklists, ["from_first"]);
        Ok(())
    }

    #[test]
    fn non_conf_files_ignored() -> Result<()> {
        let dir = TempDir::new()?;
        write_conf(&dir, "readme.txt", "blacklist nope\n")?;
        write_conf(&dir, ".hidden.conf", "blacklist nope\n")?;
        write_conf(&dir, "real.conf", "blacklist yes-mod\n")?;
        let config = load_dir(&dir);
        assert_eq!(config.blacklists, ["yes_mod"]);
        Ok(())
    }

    #[test]
    fn multiple_softdep_lines_accumulate() -> Result<()> {
        let dir = TempDir::new()?;
        write_conf(
            &dir,
            "a.conf",
            "softdep mod-m pre: first\nsoftdep mod-m post: second\n",
        )?;
        let config = load_dir(&dir);
        assert_eq!(config.softdeps.len(), 2);
        assert_eq!(config.softdeps[0].pre, ["first"]);
        assert_eq!(config.softdeps[1].post, ["second"]);
        Ok(())
    }

    #[test]
    fn kcmdline_overlay() {
        let mut config = Config::default();
        config.parse_kcmdline(
            "quiet root=/dev/sda1 i915.fastboot=1 modprobe.blacklist=floppy,pcspkr acpi=off",
        );

        assert_eq!(config.options.len(), 1);
        assert_eq!(config.options[0].modname, "i915");
        assert_eq!(config.options[0].options, "fastboot=1");
        assert_eq!(config.blacklists, ["floppy", "pcspkr"]);
    }
}
