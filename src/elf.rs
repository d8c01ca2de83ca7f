//! ELF object reader for kernel modules
//!
//! Reads the handful of sections module management cares about (`.modinfo`,
//! `__versions`, symbol tables) from a byte slice holding an already
//! decompressed module image. Both ELF classes and both byte orders are
//! supported; every multi-byte field goes through an endianness-aware
//! helper and every offset+size pair is bounds-checked against the image.
use std::fmt;

use bitflags::bitflags;
use log::debug;

mod error {
    use displaydoc::Display;
    use thiserror::Error;

    /// Failure parsing an ELF image.
    #[derive(Debug, Display, Error, PartialEq, Eq)]
    #[non_exhaustive]
    pub enum ElfError {
        /// not an ELF file
        NotElf,

        /// unsupported ELF class {0}
        BadClass(u8),

        /// unsupported ELF data encoding {0}
        BadData(u8),

        /// unexpected end of image
        Truncated,

        /// malformed ELF: {0}
        Malformed(&'static str),
    }
}
pub use error::ElfError;

type Result<T, E = ElfError> = std::result::Result<T, E>;

const EI_NIDENT: usize = 16;
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFMAG: &[u8] = b"\x7fELF";
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;

const SHN_UNDEF: u16 = 0;
const SHN_ABS: u16 = 0xfff1;
const SHF_ALLOC: u64 = 0x2;

const STB_WEAK: u8 = 2;
const STT_REGISTER: u8 = 13;

const EM_SPARC: u16 = 2;
const EM_SPARCV9: u16 = 43;

/// Fixed-size `__versions` records: a CRC followed by a 0-padded name that
/// must be nul-terminated within the field. Both layouts are 64 bytes.
const MODVERSION_LEN: u64 = 64;

bitflags! {
    /// What [`Elf::strip`] removes from the image copy.
    pub struct StripFlags: u32 {
        /// Clear `SHF_ALLOC` on `__versions` so the kernel skips CRC checks.
        const MODVERSION = 1;
        /// Zero the `vermagic=` string in `.modinfo`.
        const VERMAGIC = 2;
    }
}

/// Symbol binding, collapsed to what dependency resolution needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolBind {
    None,
    Local,
    Global,
    Weak,
    Undef,
}

/// An entry of `__versions` or a symbol-table extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub crc: u64,
    pub bind: SymbolBind,
    pub name: String,
}

/// The sections cached at parse time.
#[derive(Clone, Copy)]
enum Sec {
    Ksymtab = 0,
    Modinfo = 1,
    Strtab = 2,
    Symtab = 3,
    Versions = 4,
}

const SECTION_NAMES: [&str; 5] = [
    "__ksymtab_strings",
    ".modinfo",
    ".strtab",
    ".symtab",
    "__versions",
];

/// A parsed view over a module image.
pub struct Elf<'a> {
    memory: &'a [u8],
    x32: bool,
    msb: bool,
    machine: u16,
    sh_off: u64,
    sh_count: u16,
    sh_entsize: u16,
    strings_off: u64,
    strings_size: u64,
    /// `(offset, size)` of each known section; offset 0 means absent.
    sections: [(u64, u64); 5],
}

impl fmt::Debug for Elf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Elf")
            .field("class", if self.x32 { &32 } else { &64 })
            .field("msb", &self.msb)
            .field("machine", &self.machine)
            .field("sections", &self.sh_count)
            .finish()
    }
}

// Constructors
impl<'a> Elf<'a> {
    /// Parse the ELF header and locate the section table.
    ///
    /// # Errors
    ///
    /// - [`ElfError::NotElf`] if the magic is wrong
    /// - [`ElfError::BadClass`] / [`ElfError::BadData`] on an unknown class
    ///   or byte order
    /// - [`ElfError::Truncated`] if any header lies outside the image
    /// - [`ElfError::Malformed`] on inconsistent header contents
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() <= EI_NIDENT || &bytes[..4] != ELFMAG {
            return Err(ElfError::NotElf);
        }

        let x32 = match bytes[EI_CLASS] {
            ELFCLASS32 => true,
            ELFCLASS64 => false,
            c => return Err(ElfError::BadClass(c)),
        };
        let msb = match bytes[EI_DATA] {
            ELFDATA2LSB => false,
            ELFDATA2MSB => true,
            d => return Err(ElfError::BadData(d)),
        };

        let mut elf = Self {
            memory: bytes,
            x32,
            msb,
            machine: 0,
            sh_off: 0,
            sh_count: 0,
            sh_entsize: 0,
            strings_off: 0,
            strings_size: 0,
            sections: [(0, 0); 5],
        };

        let (ehdr_size, shdr_size) = if x32 { (52, 40) } else { (64, 64) };
        elf.check_range(0, ehdr_size)?;

        // e_machine sits right after e_ident in both classes.
        elf.machine = elf.get_uint(EI_NIDENT as u64 + 2, 2)? as u16;
        let (shoff_at, shentsize_at, shnum_at, shstrndx_at) = if x32 {
            (32, 46, 48, 50)
        } else {
            (40, 58, 60, 62)
        };
        elf.sh_off = elf.get_uint(shoff_at, if x32 { 4 } else { 8 })?;
        elf.sh_entsize = elf.get_uint(shentsize_at, 2)? as u16;
        elf.sh_count = elf.get_uint(shnum_at, 2)? as u16;
        let shstrndx = elf.get_uint(shstrndx_at, 2)? as u16;

        if elf.sh_entsize as u64 != shdr_size {
            return Err(ElfError::Malformed("unexpected section entry size"));
        }
        elf.check_range(elf.sh_off, shdr_size * elf.sh_count as u64)?;

        if shstrndx == SHN_UNDEF || shstrndx >= elf.sh_count {
            return Err(ElfError::Malformed("missing section strings table"));
        }
        let (off, size, _) = elf.section_header(shstrndx)?;
        if size == 0 || elf.bytes(off, size)?[size as usize - 1] != 0 {
            return Err(ElfError::Malformed("strings section does not end with NUL"));
        }
        elf.strings_off = off;
        elf.strings_size = size;

        elf.save_sections();
        Ok(elf)
    }
}

// Raw access helpers
impl<'a> Elf<'a> {
    fn check_range(&self, offset: u64, size: u64) -> Result<()> {
        let end = offset.checked_add(size).ok_or(ElfError::Truncated)?;
        if end > self.memory.len() as u64 {
            return Err(ElfError::Truncated);
        }
        Ok(())
    }

    fn bytes(&self, offset: u64, size: u64) -> Result<&'a [u8]> {
        self.check_range(offset, size)?;
        Ok(&self.memory[offset as usize..(offset + size) as usize])
    }

    /// Endianness-aware unsigned read of `size` bytes (size <= 8).
    fn get_uint(&self, offset: u64, size: u64) -> Result<u64> {
        let b = self.bytes(offset, size)?;
        let mut v: u64 = 0;
        if self.msb {
            for &x in b {
                v = (v << 8) | u64::from(x);
            }
        } else {
            for &x in b.iter().rev() {
                v = (v << 8) | u64::from(x);
            }
        }
        Ok(v)
    }

    /// Nul-terminated string limited to the `[offset, offset + max)` window.
    fn get_cstr(&self, offset: u64, max: u64) -> Result<&'a [u8]> {
        let window = self.bytes(offset, max)?;
        let nul = window
            .iter()
            .position(|&b| b == 0)
            .ok_or(ElfError::Malformed("unterminated string"))?;
        Ok(&window[..nul])
    }

    /// `(sh_offset, sh_size, sh_name)` of section header `idx`. Contents are
    /// range checked.
    fn section_header(&self, idx: u16) -> Result<(u64, u64, u32)> {
        if idx == SHN_UNDEF || idx >= self.sh_count {
            return Err(ElfError::Malformed("invalid section index"));
        }
        let base = self.sh_off + u64::from(idx) * u64::from(self.sh_entsize);

        let name = self.get_uint(base, 4)? as u32;
        let (offset, size) = if self.x32 {
            (self.get_uint(base + 16, 4)?, self.get_uint(base + 20, 4)?)
        } else {
            (self.get_uint(base + 24, 8)?, self.get_uint(base + 32, 8)?)
        };
        self.check_range(offset, size)?;
        Ok((offset, size, name))
    }

    fn section_name(&self, name_off: u32) -> Result<&'a [u8]> {
        if u64::from(name_off) >= self.strings_size {
            return Err(ElfError::Malformed("section name out of range"));
        }
        self.get_cstr(
            self.strings_off + u64::from(name_off),
            self.strings_size - u64::from(name_off),
        )
    }

    fn save_sections(&mut self) {
        for i in 1..self.sh_count {
            let Ok((off, size, name_off)) = self.section_header(i) else {
                continue;
            };
            let Ok(name) = self.section_name(name_off) else {
                continue;
            };
            for (sec, sec_name) in SECTION_NAMES.iter().enumerate() {
                if self.sections[sec].0 == 0 && name == sec_name.as_bytes() {
                    self.sections[sec] = (off, size);
                }
            }
        }
    }

    fn sec(&self, s: Sec) -> (u64, u64) {
        self.sections[s as usize]
    }
}

// Extraction
impl<'a> Elf<'a> {
    pub fn machine(&self) -> u16 {
        self.machine
    }

    pub fn is_64bit(&self) -> bool {
        !self.x32
    }

    /// Find a section by name. Returns `(offset, size)`, or [`None`] if no
    /// section with that name exists.
    pub fn section(&self, name: &str) -> Option<(u64, u64)> {
        self.section_index(name).map(|(_, off, size)| (off, size))
    }

    fn section_index(&self, name: &str) -> Option<(u16, u64, u64)> {
        for i in 1..self.sh_count {
            let Ok((off, size, name_off)) = self.section_header(i) else {
                continue;
            };
            if self.section_name(name_off).ok() == Some(name.as_bytes()) {
                return Some((i, off, size));
            }
        }
        None
    }

    /// The `tag=value` strings of `.modinfo`, in section order.
    ///
    /// Leading nul padding is skipped and an unterminated trailing string is
    /// still returned. Returns an empty list when the section is absent.
    ///
    /// # Errors
    ///
    /// - [`ElfError::Truncated`] if the section lies outside the image
    pub fn modinfo(&self) -> Result<Vec<String>> {
        let (off, size) = self.sec(Sec::Modinfo);
        if off == 0 {
            return Ok(Vec::new());
        }
        let data = self.bytes(off, size)?;

        Ok(data
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect())
    }

    /// The `(crc, symbol)` records of `__versions`.
    ///
    /// Record layout depends on class: a 32-bit image holds a `u32` CRC and
    /// a 60-byte name field, a 64-bit image a `u64` CRC and a 56-byte name
    /// field. Returns an empty list when the section is absent.
    ///
    /// # Errors
    ///
    /// - [`ElfError::Malformed`] if the section size is not a record
    ///   multiple or a name is not nul-terminated within its field
    pub fn modversions(&self) -> Result<Vec<Symbol>> {
        let (off, size) = self.sec(Sec::Versions);
        if off == 0 {
            return Ok(Vec::new());
        }
        if size % MODVERSION_LEN != 0 {
            return Err(ElfError::Malformed("odd __versions size"));
        }
        let crc_len = self.crc_len();

        let mut out = Vec::with_capacity((size / MODVERSION_LEN) as usize);
        let mut rec = off;
        while rec < off + size {
            let crc = self.get_uint(rec, crc_len)?;
            let mut name = self.get_cstr(rec + crc_len, MODVERSION_LEN - crc_len)?;
            if name.len() as u64 == MODVERSION_LEN - crc_len {
                return Err(ElfError::Malformed("__versions symbol name too long"));
            }
            // PowerPC dot symbols: .foo == foo
            if name.first() == Some(&b'.') {
                name = &name[1..];
            }
            out.push(Symbol {
                crc,
                bind: SymbolBind::Undef,
                name: String::from_utf8_lossy(name).into_owned(),
            });
            rec += MODVERSION_LEN;
        }
        Ok(out)
    }

    fn crc_len(&self) -> u64 {
        if self.x32 {
            4
        } else {
            8
        }
    }

    fn sym_len(&self) -> u64 {
        if self.x32 {
            16
        } else {
            24
        }
    }

    /// `(st_name, st_value, st_info, st_shndx)` of symbol-table entry `i`.
    fn symtab_entry(&self, sym_off: u64) -> Result<(u32, u64, u8, u16)> {
        if self.x32 {
            Ok((
                self.get_uint(sym_off, 4)? as u32,
                self.get_uint(sym_off + 4, 4)?,
                self.get_uint(sym_off + 12, 1)? as u8,
                self.get_uint(sym_off + 14, 2)? as u16,
            ))
        } else {
            Ok((
                self.get_uint(sym_off, 4)? as u32,
                self.get_uint(sym_off + 8, 8)?,
                self.get_uint(sym_off + 4, 1)? as u8,
                self.get_uint(sym_off + 6, 2)? as u16,
            ))
        }
    }

    /// Symbols this module exports, with their CRCs.
    ///
    /// Prefers `.symtab` entries named `__crc_<sym>`; the CRC value is read
    /// from the section `st_shndx` points into at offset `st_value`
    /// (`SHN_ABS`/`SHN_UNDEF` keep `st_value` itself). Falls back to
    /// enumerating `__ksymtab_strings` with zero CRCs when no `__crc_`
    /// symbols exist.
    ///
    /// # Errors
    ///
    /// - [`ElfError::Malformed`] on a symbol table of odd size
    pub fn symbols(&self) -> Result<Vec<Symbol>> {
        const CRC_PREFIX: &[u8] = b"__crc_";

        let (str_off, str_len) = self.sec(Sec::Strtab);
        let (sym_off, sym_len) = self.sec(Sec::Symtab);
        if str_off == 0 || sym_off == 0 {
            return self.symbols_from_ksymtab();
        }

        let entry = self.sym_len();
        if sym_len % entry != 0 {
            return Err(ElfError::Malformed("odd .symtab size"));
        }

        let mut out = Vec::new();
        let count = sym_len / entry;
        for i in 1..count {
            let (name_off, value, info, shndx) = self.symtab_entry(sym_off + i * entry)?;
            if u64::from(name_off) >= str_len {
                debug!("symtab entry {i} names past .strtab");
                return self.symbols_from_ksymtab();
            }
            let name = self.get_cstr(str_off + u64::from(name_off), str_len - u64::from(name_off))?;
            let Some(name) = name.strip_prefix(CRC_PREFIX) else {
                continue;
            };

            out.push(Symbol {
                crc: self.resolve_crc(value, shndx),
                bind: bind_from_elf(info >> 4),
                name: String::from_utf8_lossy(name).into_owned(),
            });
        }

        if out.is_empty() {
            return self.symbols_from_ksymtab();
        }
        Ok(out)
    }

    /// CRCs live either in `st_value` directly or at `st_value` bytes into
    /// the section `shndx` references.
    fn resolve_crc(&self, value: u64, shndx: u16) -> u64 {
        if shndx == SHN_ABS || shndx == SHN_UNDEF {
            return value;
        }
        let Ok((off, size, _)) = self.section_header(shndx) else {
            debug!("no section {shndx} for crc");
            return u64::MAX;
        };
        if size < 4 || value > size - 4 {
            debug!("crc offset {value} too big for section {shndx}");
            return u64::MAX;
        }
        self.get_uint(off + value, 4).unwrap_or(u64::MAX)
    }

    fn symbols_from_ksymtab(&self) -> Result<Vec<Symbol>> {
        let (off, size) = self.sec(Sec::Ksymtab);
        if off == 0 {
            return Ok(Vec::new());
        }
        let data = self.bytes(off, size)?;
        if data.last() != Some(&0) && !data.is_empty() {
            return Err(ElfError::Malformed(
                "__ksymtab_strings does not end with NUL",
            ));
        }

        Ok(data
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| Symbol {
                crc: 0,
                bind: SymbolBind::Global,
                name: String::from_utf8_lossy(s).into_owned(),
            })
            .collect())
    }

    /// Symbols this module needs from the kernel or other modules.
    ///
    /// Enumerates undefined `.symtab` entries (skipping SPARC register
    /// pseudo-symbols), resolving each CRC from `__versions`. Entries of
    /// `__versions` that no undefined symbol referenced are appended too:
    /// `module_layout`/`struct_module` are never referenced but still
    /// needed for ABI checks.
    ///
    /// # Errors
    ///
    /// - [`ElfError::Malformed`] if `.symtab`/`.strtab` are missing or
    ///   inconsistent
    pub fn dependency_symbols(&self) -> Result<Vec<Symbol>> {
        let (mut ver_off, mut ver_size) = self.sec(Sec::Versions);
        let crc_len = self.crc_len();
        if ver_off != 0 && ver_size % MODVERSION_LEN != 0 {
            debug!("unexpected __versions size {ver_size}");
            ver_off = 0;
            ver_size = 0;
        }

        let (str_off, str_len) = self.sec(Sec::Strtab);
        let (sym_off, sym_len) = self.sec(Sec::Symtab);
        if str_off == 0 {
            return Err(ElfError::Malformed("no .strtab"));
        }
        if sym_off == 0 {
            return Err(ElfError::Malformed("no .symtab"));
        }

        let entry = self.sym_len();
        if sym_len % entry != 0 {
            return Err(ElfError::Malformed("odd .symtab size"));
        }

        let handle_register_symbols =
            self.machine == EM_SPARC || self.machine == EM_SPARCV9;

        let ver_count = if ver_off == 0 {
            0
        } else {
            (ver_size / MODVERSION_LEN) as usize
        };
        let mut visited = vec![false; ver_count];

        let mut out = Vec::new();
        let count = sym_len / entry;
        for i in 1..count {
            let (name_off, _, info, shndx) = self.symtab_entry(sym_off + i * entry)?;
            if shndx != SHN_UNDEF {
                continue;
            }
            if handle_register_symbols && info & 0xf == STT_REGISTER {
                // Not really undefined: sparc gcc creates U references for
                // global asm variables.
                continue;
            }
            if u64::from(name_off) >= str_len {
                return Err(ElfError::Malformed(".symtab entry names past .strtab"));
            }
            let name = self.get_cstr(str_off + u64::from(name_off), str_len - u64::from(name_off))?;
            if name.is_empty() {
                debug!("empty symbol name at index {i}");
                continue;
            }

            let crc = match self.crc_find(ver_off, ver_size, name)? {
                Some((idx, crc)) => {
                    visited[idx] = true;
                    crc
                }
                None => 0,
            };

            let bind = if info >> 4 == STB_WEAK {
                SymbolBind::Weak
            } else {
                SymbolBind::Undef
            };
            out.push(Symbol {
                crc,
                bind,
                name: String::from_utf8_lossy(name).into_owned(),
            });
        }

        for (idx, seen) in visited.iter().enumerate() {
            if *seen {
                continue;
            }
            let rec = ver_off + idx as u64 * MODVERSION_LEN;
            let name = self.get_cstr(rec + crc_len, MODVERSION_LEN - crc_len)?;
            if name.len() as u64 == MODVERSION_LEN - crc_len {
                return Err(ElfError::Malformed("__versions symbol name too long"));
            }
            out.push(Symbol {
                crc: self.get_uint(rec, crc_len)?,
                bind: SymbolBind::Undef,
                name: String::from_utf8_lossy(name).into_owned(),
            });
        }

        Ok(out)
    }

    /// Look `name` up in `__versions`. A record whose name field is not
    /// nul-terminated within its fixed size never matches.
    fn crc_find(&self, ver_off: u64, ver_size: u64, name: &[u8]) -> Result<Option<(usize, u64)>> {
        if ver_off == 0 {
            return Ok(None);
        }
        let crc_len = self.crc_len();
        let mut rec = ver_off;
        let mut idx = 0;
        while rec < ver_off + ver_size {
            let window = self.bytes(rec + crc_len, MODVERSION_LEN - crc_len)?;
            match window.iter().position(|&b| b == 0) {
                Some(nul) if &window[..nul] == name => {
                    return Ok(Some((idx, self.get_uint(rec, crc_len)?)));
                }
                _ => {}
            }
            rec += MODVERSION_LEN;
            idx += 1;
        }
        Ok(None)
    }

    /// Produce a copy of the image with version checking data removed, for
    /// force loading.
    ///
    /// [`StripFlags::MODVERSION`] clears `SHF_ALLOC` on `__versions`;
    /// [`StripFlags::VERMAGIC`] zeroes the `vermagic=` string in
    /// `.modinfo`.
    ///
    /// # Errors
    ///
    /// - [`ElfError::Malformed`] if vermagic stripping was requested but no
    ///   `vermagic=` entry exists
    ///
    /// # Panics
    ///
    /// If `flags` is empty.
    pub fn strip(&self, flags: StripFlags) -> Result<Vec<u8>> {
        assert!(!flags.is_empty(), "strip requires at least one flag");

        let mut changed = self.memory.to_vec();

        if flags.contains(StripFlags::MODVERSION) {
            self.strip_versions_section(&mut changed)?;
        }
        if flags.contains(StripFlags::VERMAGIC) {
            self.strip_vermagic(&mut changed)?;
        }

        Ok(changed)
    }

    fn strip_versions_section(&self, changed: &mut [u8]) -> Result<()> {
        let Some((idx, _, _)) = self.section_index("__versions") else {
            return Ok(());
        };

        let base = self.sh_off + u64::from(idx) * u64::from(self.sh_entsize);
        let (flags_at, flags_len) = if self.x32 { (8, 4) } else { (8, 8) };
        let val = self.get_uint(base + flags_at, flags_len)? & !SHF_ALLOC;
        set_uint(changed, self.msb, base + flags_at, flags_len, val);
        Ok(())
    }

    fn strip_vermagic(&self, changed: &mut [u8]) -> Result<()> {
        let (off, size) = self.sec(Sec::Modinfo);
        if off == 0 {
            return Ok(());
        }
        let data = self.bytes(off, size)?;

        let mut i = 0;
        while i < data.len() {
            if data[i] == 0 {
                i += 1;
                continue;
            }
            let end = data[i..]
                .iter()
                .position(|&b| b == 0)
                .map_or(data.len(), |p| i + p);
            if data[i..end].starts_with(b"vermagic=") {
                let at = off as usize + i;
                changed[at..at + (end - i)].fill(0);
                return Ok(());
            }
            i = end;
        }

        debug!("no vermagic found in .modinfo");
        Err(ElfError::Malformed("no vermagic in .modinfo"))
    }
}

fn bind_from_elf(bind: u8) -> SymbolBind {
    match bind {
        0 => SymbolBind::Local,
        1 => SymbolBind::Global,
        2 => SymbolBind::Weak,
        _ => SymbolBind::None,
    }
}

/// Endianness-aware in-place write used by stripping.
fn set_uint(buf: &mut [u8], msb: bool, offset: u64, size: u64, value: u64) {
    let off = offset as usize;
    let mut v = value;
    if msb {
        for i in (0..size as usize).rev() {
            buf[off + i] = (v & 0xff) as u8;
            v >>= 8;
        }
    } else {
        for i in 0..size as usize {
            buf[off + i] = (v & 0xff) as u8;
            v >>= 8;
        }
    }
}

/// Synthetic ELF images for the test suite: a minimal writer producing any
/// class/endianness combination the reader accepts.
#[cfg(test)]
pub(crate) mod testelf {
    /// `(name, sh_flags, data)` plus optional symbols make a module image.
    pub struct Section {
        pub name: &'static str,
        pub flags: u64,
        pub data: Vec<u8>,
    }

    pub struct Builder {
        pub x32: bool,
        pub msb: bool,
        pub machine: u16,
        sections: Vec<Section>,
    }

    impl Builder {
        pub fn new(x32: bool, msb: bool) -> Self {
            Self {
                x32,
                msb,
                machine: if x32 { 3 } else { 62 },
                sections: Vec::new(),
            }
        }

        pub fn section(mut self, name: &'static str, data: Vec<u8>) -> Self {
            self.sections.push(Section {
                name,
                flags: 0,
                data,
            });
            self
        }

        pub fn section_with_flags(mut self, name: &'static str, flags: u64, data: Vec<u8>) -> Self {
            self.sections.push(Section { name, flags, data });
            self
        }

        /// A `.symtab` made of `(name_offset_into_strtab, value, info,
        /// shndx)` entries; entry 0 (all zeros) is added automatically.
        pub fn symtab(self, entries: &[(u32, u64, u8, u16)]) -> Self {
            let x32 = self.x32;
            let msb = self.msb;
            let mut data = Vec::new();
            let mut push = |entry: &(u32, u64, u8, u16), data: &mut Vec<u8>| {
                let (name, value, info, shndx) = *entry;
                if x32 {
                    wr(data, msb, u64::from(name), 4);
                    wr(data, msb, value, 4);
                    wr(data, msb, 0, 4); // st_size
                    data.push(info);
                    data.push(0); // st_other
                    wr(data, msb, u64::from(shndx), 2);
                } else {
                    wr(data, msb, u64::from(name), 4);
                    data.push(info);
                    data.push(0);
                    wr(data, msb, u64::from(shndx), 2);
                    wr(data, msb, value, 8);
                    wr(data, msb, 0, 8); // st_size
                }
            };
            push(&(0, 0, 0, 0), &mut data);
            for entry in entries {
                push(entry, &mut data);
            }
            self.section(".symtab", data)
        }

        /// A `__versions` section from `(crc, name)` records.
        pub fn versions(self, entries: &[(u64, &str)]) -> Self {
            let crc_len: usize = if self.x32 { 4 } else { 8 };
            let msb = self.msb;
            let x32 = self.x32;
            let mut data = Vec::new();
            for (crc, name) in entries {
                wr(&mut data, msb, *crc, crc_len);
                let mut field = vec![0u8; 64 - if x32 { 4 } else { 8 }];
                field[..name.len()].copy_from_slice(name.as_bytes());
                data.extend_from_slice(&field);
            }
            self.section("__versions", data)
        }

        pub fn build(self) -> Vec<u8> {
            let (ehdr_size, shdr_size): (usize, usize) =
                if self.x32 { (52, 40) } else { (64, 64) };
            let msb = self.msb;

            // Section string table: index 0 is the empty name.
            let mut shstrtab = vec![0u8];
            let mut name_offs = Vec::new();
            for s in &self.sections {
                name_offs.push(shstrtab.len() as u32);
                shstrtab.extend_from_slice(s.name.as_bytes());
                shstrtab.push(0);
            }
            let shstrtab_name = shstrtab.len() as u32;
            shstrtab.extend_from_slice(b".shstrtab\0");

            // Layout: ehdr, section bodies, shstrtab body, header table.
            let mut offs = Vec::new();
            let mut pos = ehdr_size;
            for s in &self.sections {
                offs.push(pos as u64);
                pos += s.data.len();
            }
            let shstrtab_off = pos as u64;
            pos += shstrtab.len();
            let sh_off = pos as u64;
            let sh_count = self.sections.len() + 2; // null + shstrtab

            let mut out = Vec::new();
            out.extend_from_slice(b"\x7fELF");
            out.push(if self.x32 { 1 } else { 2 });
            out.push(if msb { 2 } else { 1 });
            out.push(1); // EI_VERSION
            out.resize(16, 0);
            wr(&mut out, msb, 1, 2); // e_type ET_REL
            wr(&mut out, msb, u64::from(self.machine), 2);
            wr(&mut out, msb, 1, 4); // e_version
            if self.x32 {
                wr(&mut out, msb, 0, 4); // e_entry
                wr(&mut out, msb, 0, 4); // e_phoff
                wr(&mut out, msb, sh_off, 4);
                wr(&mut out, msb, 0, 4); // e_flags
                wr(&mut out, msb, ehdr_size as u64, 2);
                wr(&mut out, msb, 0, 2); // e_phentsize
                wr(&mut out, msb, 0, 2); // e_phnum
                wr(&mut out, msb, shdr_size as u64, 2);
                wr(&mut out, msb, sh_count as u64, 2);
                wr(&mut out, msb, sh_count as u64 - 1, 2); // e_shstrndx
            } else {
                wr(&mut out, msb, 0, 8);
                wr(&mut out, msb, 0, 8);
                wr(&mut out, msb, sh_off, 8);
                wr(&mut out, msb, 0, 4);
                wr(&mut out, msb, ehdr_size as u64, 2);
                wr(&mut out, msb, 0, 2);
                wr(&mut out, msb, 0, 2);
                wr(&mut out, msb, shdr_size as u64, 2);
                wr(&mut out, msb, sh_count as u64, 2);
                wr(&mut out, msb, sh_count as u64 - 1, 2);
            }
            assert_eq!(out.len(), ehdr_size);

            for s in &self.sections {
                out.extend_from_slice(&s.data);
            }
            out.extend_from_slice(&shstrtab);

            // Null section header.
            out.resize(out.len() + shdr_size, 0);
            for (i, s) in self.sections.iter().enumerate() {
                write_shdr(
                    &mut out,
                    self.x32,
                    msb,
                    name_offs[i],
                    s.flags,
                    offs[i],
                    s.data.len() as u64,
                );
            }
            write_shdr(
                &mut out,
                self.x32,
                msb,
                shstrtab_name,
                0,
                shstrtab_off,
                shstrtab.len() as u64,
            );

            out
        }
    }

    fn write_shdr(
        out: &mut Vec<u8>,
        x32: bool,
        msb: bool,
        name: u32,
        flags: u64,
        offset: u64,
        size: u64,
    ) {
        wr(out, msb, u64::from(name), 4);
        wr(out, msb, 1, 4); // sh_type SHT_PROGBITS
        if x32 {
            wr(out, msb, flags, 4);
            wr(out, msb, 0, 4); // sh_addr
            wr(out, msb, offset, 4);
            wr(out, msb, size, 4);
            wr(out, msb, 0, 4); // sh_link
            wr(out, msb, 0, 4); // sh_info
            wr(out, msb, 0, 4); // sh_addralign
            wr(out, msb, 0, 4); // sh_entsize
        } else {
            wr(out, msb, flags, 8);
            wr(out, msb, 0, 8);
            wr(out, msb, offset, 8);
            wr(out, msb, size, 8);
            wr(out, msb, 0, 4);
            wr(out, msb, 0, 4);
            wr(out, msb, 0, 8);
            wr(out, msb, 0, 8);
        }
    }

    pub fn wr(out: &mut Vec<u8>, msb: bool, value: u64, size: usize) {
        let mut bytes = Vec::with_capacity(size);
        let mut v = value;
        for _ in 0..size {
            bytes.push((v & 0xff) as u8);
            v >>= 8;
        }
        if msb {
            bytes.reverse();
        }
        out.extend_from_slice(&bytes);
    }

    /// A strtab from names; returns `(data, offsets)` aligned with input.
    pub fn strtab(names: &[&str]) -> (Vec<u8>, Vec<u32>) {
        let mut data = vec![0u8];
        let mut offs = Vec::new();
        for name in names {
            offs.push(data.len() as u32);
            data.extend_from_slice(name.as_bytes());
            data.push(0);
        }
        (data, offs)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::{testelf::*, *};

    fn modinfo_image(x32: bool, msb: bool) -> Vec<u8> {
        Builder::new(x32, msb)
            .section(".modinfo", b"license=GPL\0author=X\0".to_vec())
            .build()
    }

    #[test]
    fn rejects_non_elf() {
        assert_eq!(Elf::new(b"not an elf file").unwrap_err(), ElfError::NotElf);
        let mut bad = modinfo_image(false, false);
        bad[4] = 9;
        assert_eq!(Elf::new(&bad).unwrap_err(), ElfError::BadClass(9));
        let mut bad = modinfo_image(false, false);
        bad[5] = 9;
        assert_eq!(Elf::new(&bad).unwrap_err(), ElfError::BadData(9));
    }

    #[test]
    fn modinfo_strings() -> Result<()> {
        for (x32, msb) in [(false, false), (false, true), (true, false), (true, true)] {
            let img = modinfo_image(x32, msb);
            let elf = Elf::new(&img)?;
            assert_eq!(elf.modinfo()?, ["license=GPL", "author=X"], "{x32}/{msb}");
        }
        Ok(())
    }

    #[test]
    fn modinfo_skips_leading_padding() -> Result<()> {
        let img = Builder::new(false, false)
            .section(".modinfo", b"\0\0\0alias=x\0depends=\0".to_vec())
            .build();
        let elf = Elf::new(&img)?;
        assert_eq!(elf.modinfo()?, ["alias=x", "depends="]);
        Ok(())
    }

    #[test]
    fn section_lookup() -> Result<()> {
        let img = modinfo_image(false, false);
        let elf = Elf::new(&img)?;
        assert!(elf.section(".modinfo").is_some());
        assert!(elf.section(".does-not-exist").is_none());
        Ok(())
    }

    #[test]
    fn modversions_all_encodings() -> Result<()> {
        let records = [(0xdead_beefu64, "symbol_a"), (0x1234_5678, "symbol_b")];
        let mut seen = Vec::new();
        for (x32, msb) in [(false, false), (false, true), (true, false), (true, true)] {
            let img = Builder::new(x32, msb).versions(&records).build();
            let elf = Elf::new(&img)?;
            let versions = elf.modversions()?;
            assert_eq!(versions.len(), 2);
            assert_eq!(versions[0].crc, 0xdead_beef);
            assert_eq!(versions[0].name, "symbol_a");
            seen.push(versions);
        }
        // Same semantic content regardless of class/endianness.
        assert!(seen.windows(2).all(|w| w[0] == w[1]));
        Ok(())
    }

    #[test]
    fn modversions_rejects_unterminated_name() {
        let crc_len = 8;
        let mut data = Vec::new();
        wr(&mut data, false, 1, crc_len);
        data.extend_from_slice(&[b'x'; 56]); // fills the whole name field
        let img = Builder::new(false, false)
            .section("__versions", data)
            .build();
        let elf = Elf::new(&img).unwrap();
        assert!(matches!(elf.modversions(), Err(ElfError::Malformed(_))));
    }

    #[test]
    fn symbols_via_crc_entries() -> Result<()> {
        let (strtab, offs) = strtab(&["__crc_exported_sym", "other"]);
        // SHN_ABS keeps st_value as the CRC.
        let img = Builder::new(false, false)
            .section(".strtab", strtab)
            .symtab(&[(offs[0], 0xabcd, 1 << 4, 0xfff1), (offs[1], 7, 1 << 4, 0xfff1)])
            .build();
        let elf = Elf::new(&img)?;
        let syms = elf.symbols()?;
        assert_eq!(syms.len(), 1);
        assert_eq!(syms[0].name, "exported_sym");
        assert_eq!(syms[0].crc, 0xabcd);
        assert_eq!(syms[0].bind, SymbolBind::Global);
        Ok(())
    }

    #[test]
    fn symbols_fall_back_to_ksymtab() -> Result<()> {
        let img = Builder::new(false, false)
            .section("__ksymtab_strings", b"\0first_sym\0second_sym\0".to_vec())
            .build();
        let elf = Elf::new(&img)?;
        let syms = elf.symbols()?;
        let names: Vec<_> = syms.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["first_sym", "second_sym"]);
        assert!(syms.iter().all(|s| s.crc == 0));
        Ok(())
    }

    #[test]
    fn dependency_symbols_with_versions() -> Result<()> {
        let (strtab, offs) = strtab(&["needed_sym"]);
        let img = Builder::new(false, false)
            .section(".strtab", strtab)
            .symtab(&[(offs[0], 0, 0, 0)]) // SHN_UNDEF
            .versions(&[(0x1111, "needed_sym"), (0x2222, "module_layout")])
            .build();
        let elf = Elf::new(&img)?;
        let deps = elf.dependency_symbols()?;

        // The referenced symbol resolves its CRC; the unreferenced
        // module_layout record is appended anyway.
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].name, "needed_sym");
        assert_eq!(deps[0].crc, 0x1111);
        assert_eq!(deps[1].name, "module_layout");
        assert_eq!(deps[1].crc, 0x2222);
        Ok(())
    }

    #[test]
    fn dependency_symbols_require_symtab() {
        let img = modinfo_image(false, false);
        let elf = Elf::new(&img).unwrap();
        assert!(matches!(
            elf.dependency_symbols(),
            Err(ElfError::Malformed(_))
        ));
    }

    #[test]
    fn strip_vermagic_zeroes_string() -> Result<()> {
        let img = Builder::new(false, true)
            .section(
                ".modinfo",
                b"license=GPL\0vermagic=6.1.0 SMP mod_unload\0".to_vec(),
            )
            .build();
        let elf = Elf::new(&img)?;
        let stripped = elf.strip(StripFlags::VERMAGIC)?;

        let elf = Elf::new(&stripped)?;
        let info = elf.modinfo()?;
        assert_eq!(info, ["license=GPL"]);
        Ok(())
    }

    #[test]
    fn strip_versions_clears_alloc_flag() -> Result<()> {
        for (x32, msb) in [(false, false), (true, true)] {
            let img = Builder::new(x32, msb)
                .section_with_flags("__versions", SHF_ALLOC, {
                    let mut data = Vec::new();
                    wr(&mut data, msb, 0x42, if x32 { 4 } else { 8 });
                    let mut field = vec![0u8; 64 - if x32 { 4 } else { 8 }];
                    field[..3].copy_from_slice(b"sym");
                    data.extend_from_slice(&field);
                    data
                })
                .build();
            let elf = Elf::new(&img)?;
            let stripped = elf.strip(StripFlags::MODVERSION)?;

            let elf = Elf::new(&stripped)?;
            let (idx, _, _) = elf.section_index("__versions").unwrap();
            let base = elf.sh_off + u64::from(idx) * u64::from(elf.sh_entsize);
            let flags = elf.get_uint(base + 8, if x32 { 4 } else { 8 })?;
            assert_eq!(flags & SHF_ALLOC, 0);

            // Content untouched.
            assert_eq!(elf.modversions()?[0].crc, 0x42);
        }
        Ok(())
    }

    #[test]
    fn strip_missing_vermagic_is_an_error() {
        let img = modinfo_image(false, false);
        let elf = Elf::new(&img).unwrap();
        assert!(elf.strip(StripFlags::VERMAGIC).is_err());
    }
}
