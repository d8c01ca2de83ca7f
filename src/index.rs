//! On-disk module index files
//!
//! An index maps keys to values; both are 7-bit ASCII strings and each key
//! can carry multiple values sorted by an integer priority. The file layout
//! is a Patricia trie: every node stores the remainder of its arc label as a
//! `prefix`, a `[first, last]` range of child arcs with one big-endian
//! offset per arc, and a value list.
//!
//! All integers are stored big-endian. Node offsets carry flags in the high
//! nibble saying which of the three sections (prefix, children, values) are
//! present; the low 28 bits are the file offset of the node body.
//!
//! Two implementations share the format: [`Index`] maps a finished file and
//! navigates it in place without parsing it up front, and [`IndexBuilder`]
//! accumulates keys in heap nodes during compilation and serializes them
//! post-order, so either side can consume what the other produced.
use std::{
    fmt,
    fs::File,
    io::{self, Seek, SeekFrom, Write},
    path::Path,
    str,
};

use glob::Pattern;
use memmap2::Mmap;

use crate::util::path_mstamp;

/// Spells "BOOTFAST".
const INDEX_MAGIC: u32 = 0xB007_F457;
const INDEX_VERSION_MAJOR: u16 = 0x0002;
const INDEX_VERSION_MINOR: u16 = 0x0001;
const INDEX_VERSION: u32 = ((INDEX_VERSION_MAJOR as u32) << 16) | INDEX_VERSION_MINOR as u32;

/// Keys are 7-bit ASCII; child arrays are indexed by character.
const INDEX_CHILDMAX: usize = 128;

const INDEX_NODE_PREFIX: u32 = 0x8000_0000;
const INDEX_NODE_VALUES: u32 = 0x4000_0000;
const INDEX_NODE_CHILDS: u32 = 0x2000_0000;
const INDEX_NODE_MASK: u32 = 0x0FFF_FFFF;

mod error {
    use displaydoc::Display;
    use std::io;
    use thiserror::Error;

    /// Failure opening an index file.
    #[derive(Debug, Display, Error)]
    #[non_exhaustive]
    pub enum OpenError {
        /// IO Failed
        Io(#[from] io::Error),

        /// bad magic {0:#010x}
        BadMagic(u32),

        /// unsupported index version {0}.{1}
        BadVersion(u16, u16),

        /// file too short to be an index
        Truncated,
    }
}
pub use error::OpenError;

/// A value attached to an index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexValue {
    /// Lower sorts first.
    pub priority: u32,

    pub value: String,
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Decoded view of one on-disk node. Borrows from the mapping.
struct Node<'a> {
    prefix: &'a [u8],
    first: u8,
    last: u8,
    /// Offset of the child-offset array within the file, if any.
    children: Option<usize>,
    value_count: u32,
    /// Offset of the first value record within the file.
    values: usize,
}

/// A memory-mapped index file.
///
/// The mapping is read-only and navigated by offset; nothing is parsed ahead
/// of lookups, so opening a multi-megabyte alias table is cheap.
pub struct Index {
    map: Mmap,
    root_offset: u32,
    stamp: u64,
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("size", &self.map.len())
            .field("stamp", &self.stamp)
            .finish()
    }
}

// Constructors
impl Index {
    /// Map the index file at `path`.
    ///
    /// # Errors
    ///
    /// - [`OpenError::Io`] if the file cannot be opened or mapped
    /// - [`OpenError::Truncated`] if it is shorter than the header
    /// - [`OpenError::BadMagic`] / [`OpenError::BadVersion`] on format
    ///   mismatch (only the major version must match)
    pub fn open(path: &Path) -> Result<Self, OpenError> {
        let file = File::open(path)?;
        // Safety: the mapping is private and read-only; a concurrent writer
        // replaces index files atomically by rename, never in place.
        let map = unsafe { Mmap::map(&file)? };

        if map.len() < 12 {
            return Err(OpenError::Truncated);
        }

        let magic = read_u32(&map, 0).ok_or(OpenError::Truncated)?;
        if magic != INDEX_MAGIC {
            return Err(OpenError::BadMagic(magic));
        }

        let version = read_u32(&map, 4).ok_or(OpenError::Truncated)?;
        if (version >> 16) as u16 != INDEX_VERSION_MAJOR {
            return Err(OpenError::BadVersion(
                (version >> 16) as u16,
                version as u16,
            ));
        }

        let root_offset = read_u32(&map, 8).ok_or(OpenError::Truncated)?;

        Ok(Self {
            map,
            root_offset,
            stamp: path_mstamp(path),
        })
    }

    /// Mtime stamp of the file at open time, for staleness detection.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }
}

// Searching
impl Index {
    /// Exact-match search. Returns the first (highest-priority) value.
    pub fn search(&self, key: &str) -> Option<String> {
        let mut node = self.read_node(self.root_offset)?;
        let mut key = key.as_bytes();

        loop {
            for (j, &ch) in node.prefix.iter().enumerate() {
                if key.get(j) != Some(&ch) {
                    return None;
                }
            }
            key = &key[node.prefix.len()..];

            if key.is_empty() {
                if node.value_count == 0 {
                    return None;
                }
                let (_, value) = self.read_value(node.values)?;
                return Some(String::from_utf8_lossy(value).into_owned());
            }

            node = self.read_child(&node, key[0])?;
            key = &key[1..];
        }
    }

    /// Wildcard search: keys stored in the index are patterns and may
    /// contain `*`, `?` and `[`.
    ///
    /// Returns every value whose key, interpreted as a shell glob, matches
    /// `key`, sorted by ascending priority (insertion order among equals).
    pub fn search_wild(&self, key: &str) -> Vec<IndexValue> {
        let mut out = Vec::new();
        if let Some(root) = self.read_node(self.root_offset) {
            let mut buf = String::new();
            self.search_wild_node(root, key.as_bytes(), &mut buf, &mut out);
        }
        out.sort_by_key(|v| v.priority);
        out
    }

    /// Descend the trie matching `key` exactly until a wildcard is reached.
    fn search_wild_node(&self, node: Node, key: &[u8], buf: &mut String, out: &mut Vec<IndexValue>) {
        let mut node = node;
        let mut key = key;

        loop {
            for (j, &ch) in node.prefix.iter().enumerate() {
                if ch == b'*' || ch == b'?' || ch == b'[' {
                    self.search_wild_all(&node, j, buf, &key[j..], out);
                    return;
                }
                if key.get(j) != Some(&ch) {
                    return;
                }
            }
            key = &key[node.prefix.len()..];

            for ch in [b'*', b'?', b'['] {
                if let Some(child) = self.read_child(&node, ch) {
                    buf.push(ch as char);
                    self.search_wild_all(&child, 0, buf, key, out);
                    buf.pop();
                }
            }

            if key.is_empty() {
                self.push_values(&node, out);
                return;
            }

            node = match self.read_child(&node, key[0]) {
                Some(n) => n,
                None => return,
            };
            key = &key[1..];
        }
    }

    /// Exhaustively enumerate a sub-keyspace that starts with a wildcard,
    /// glob-matching each complete pattern against `subkey`.
    fn search_wild_all(
        &self,
        node: &Node,
        j: usize,
        buf: &mut String,
        subkey: &[u8],
        out: &mut Vec<IndexValue>,
    ) {
        let pushed = node.prefix.len() - j;
        for &ch in &node.prefix[j..] {
            buf.push(ch as char);
        }

        for ch in node.first..=node.last {
            if let Some(child) = self.read_child(node, ch) {
                buf.push(ch as char);
                self.search_wild_all(&child, 0, buf, subkey, out);
                buf.pop();
            }
        }

        if node.value_count > 0 {
            let matched = str::from_utf8(subkey)
                .ok()
                .zip(Pattern::new(buf).ok())
                .map_or(false, |(key, pat)| pat.matches(key));
            if matched {
                self.push_values(node, out);
            }
        }

        buf.truncate(buf.len() - pushed);
    }

    /// In-order traversal writing `<key> <value>` per value, with an
    /// optional `alias ` line prefix.
    ///
    /// # Errors
    ///
    /// Returns any error from `w`.
    pub fn dump(&self, w: &mut dyn Write, alias_prefix: bool) -> io::Result<()> {
        let root = match self.read_node(self.root_offset) {
            Some(n) => n,
            None => return Ok(()),
        };
        let mut buf = String::new();
        if alias_prefix {
            buf.push_str("alias ");
        }
        self.dump_node(root, &mut buf, w)
    }

    fn dump_node(&self, node: Node, buf: &mut String, w: &mut dyn Write) -> io::Result<()> {
        let pushed = node.prefix.len();
        for &ch in node.prefix {
            buf.push(ch as char);
        }

        let mut off = node.values;
        for _ in 0..node.value_count {
            let (_, value) = match self.read_value(off) {
                Some(v) => v,
                None => break,
            };
            w.write_all(buf.as_bytes())?;
            w.write_all(b" ")?;
            w.write_all(value)?;
            w.write_all(b"\n")?;
            off += 4 + value.len() + 1;
        }

        for ch in node.first..=node.last {
            if let Some(child) = self.read_child(&node, ch) {
                buf.push(ch as char);
                self.dump_node(child, buf, w)?;
                buf.pop();
            }
        }

        buf.truncate(buf.len() - pushed);
        Ok(())
    }
}

// Raw node decoding
impl Index {
    fn read_node(&self, offset: u32) -> Option<Node<'_>> {
        let mut pos = (offset & INDEX_NODE_MASK) as usize;
        if pos == 0 || pos >= self.map.len() {
            return None;
        }

        let prefix = if offset & INDEX_NODE_PREFIX != 0 {
            let s = read_cstr(&self.map, pos)?;
            pos += s.len() + 1;
            s
        } else {
            &[]
        };

        let (first, last, children) = if offset & INDEX_NODE_CHILDS != 0 {
            let first = *self.map.get(pos)?;
            let last = *self.map.get(pos + 1)?;
            if first > last || last as usize >= INDEX_CHILDMAX {
                return None;
            }
            let children = pos + 2;
            pos = children + 4 * (last - first + 1) as usize;
            (first, last, Some(children))
        } else {
            (INDEX_CHILDMAX as u8, 0, None)
        };

        let (value_count, values) = if offset & INDEX_NODE_VALUES != 0 {
            (read_u32(&self.map, pos)?, pos + 4)
        } else {
            (0, pos)
        };

        Some(Node {
            prefix,
            first,
            last,
            children,
            value_count,
            values,
        })
    }

    fn read_child(&self, parent: &Node, ch: u8) -> Option<Node<'_>> {
        if ch < parent.first || ch > parent.last {
            return None;
        }
        let base = parent.children?;
        let off = read_u32(&self.map, base + 4 * (ch - parent.first) as usize)?;
        self.read_node(off)
    }

    /// A value record is a big-endian priority followed by a nul-terminated
    /// string.
    fn read_value(&self, off: usize) -> Option<(u32, &[u8])> {
        let priority = read_u32(&self.map, off)?;
        let value = read_cstr(&self.map, off + 4)?;
        Some((priority, value))
    }

    fn push_values(&self, node: &Node, out: &mut Vec<IndexValue>) {
        let mut off = node.values;
        for _ in 0..node.value_count {
            let (priority, value) = match self.read_value(off) {
                Some(v) => v,
                None => break,
            };
            out.push(IndexValue {
                priority,
                value: String::from_utf8_lossy(value).into_owned(),
            });
            off += 4 + value.len() + 1;
        }
    }
}

fn read_u32(buf: &[u8], off: usize) -> Option<u32> {
    let b = buf.get(off..off + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_cstr(buf: &[u8], off: usize) -> Option<&[u8]> {
    let tail = buf.get(off..)?;
    let nul = tail.iter().position(|&b| b == 0)?;
    Some(&tail[..nul])
}

/// Heap node used during compilation: a dense child-pointer array indexed by
/// character, path-compressed through `prefix`.
struct BuildNode {
    prefix: Vec<u8>,
    /// Sorted by ascending priority, insertion order among equals.
    values: Vec<(u32, String)>,
    first: usize,
    last: usize,
    children: [Option<Box<BuildNode>>; INDEX_CHILDMAX],
}

impl BuildNode {
    fn new(prefix: &[u8]) -> Box<Self> {
        Box::new(Self {
            prefix: prefix.to_vec(),
            values: Vec::new(),
            first: INDEX_CHILDMAX,
            last: 0,
            children: std::array::from_fn(|_| None),
        })
    }

    fn has_children(&self) -> bool {
        self.first < INDEX_CHILDMAX
    }

    fn add_value(&mut self, value: &str, priority: u32) -> bool {
        let duplicate = self.values.iter().any(|(_, v)| v == value);
        let pos = self
            .values
            .iter()
            .position(|(p, _)| *p > priority)
            .unwrap_or(self.values.len());
        self.values.insert(pos, (priority, value.to_owned()));
        duplicate
    }
}

/// Builds an index in memory and serializes it in the on-disk format.
pub struct IndexBuilder {
    root: Box<BuildNode>,
}

impl Default for IndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self {
            root: BuildNode::new(b""),
        }
    }

    /// Classic Patricia insert: walk the matching prefix, split the node
    /// where the label diverges, otherwise descend or grow a child.
    ///
    /// Returns whether an identical value already existed at `key`.
    ///
    /// # Panics
    ///
    /// Index files only support 7-bit ASCII; a key or value outside that
    /// range is a caller bug.
    pub fn insert(&mut self, key: &str, value: &str, priority: u32) -> bool {
        assert!(
            key.bytes().chain(value.bytes()).all(|b| (b as usize) < INDEX_CHILDMAX),
            "only 7-bit ASCII is supported in index files: {key} {value}"
        );

        let mut node = &mut self.root;
        let mut key = key.as_bytes();

        loop {
            // Ensure node.prefix is a prefix of key; split otherwise.
            let split = node
                .prefix
                .iter()
                .enumerate()
                .find(|(j, &ch)| key.get(*j) != Some(&ch))
                .map(|(j, &ch)| (j, ch));
            if let Some((j, ch)) = split {
                let parent_prefix = node.prefix[..j].to_vec();
                let child_prefix = node.prefix[j + 1..].to_vec();

                let mut child = BuildNode::new(&child_prefix);
                child.values = std::mem::take(&mut node.values);
                child.first = node.first;
                child.last = node.last;
                child.children = std::mem::replace(
                    &mut node.children,
                    std::array::from_fn(|_| None),
                );

                node.prefix = parent_prefix;
                node.values = Vec::new();
                node.first = ch as usize;
                node.last = ch as usize;
                node.children[ch as usize] = Some(child);
            }

            key = &key[node.prefix.len()..];

            let ch = match key.first() {
                None => return node.add_value(value, priority),
                Some(&ch) => ch as usize,
            };

            if node.children[ch].is_none() {
                node.first = node.first.min(ch);
                node.last = node.last.max(ch);
                node.children[ch] = Some(BuildNode::new(&key[1..]));
                let child = node.children[ch].as_mut().unwrap();
                return child.add_value(value, priority);
            }

            node = node.children[ch].as_mut().unwrap();
            key = &key[1..];
        }
    }

    /// Serialize the trie.
    ///
    /// Nodes are written post-order, then the root offset is patched into
    /// the header. The byte stream for a given set of insertions is fully
    /// deterministic.
    ///
    /// # Errors
    ///
    /// Returns any error from `out`.
    pub fn write<W: Write + Seek>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&INDEX_MAGIC.to_be_bytes())?;
        out.write_all(&INDEX_VERSION.to_be_bytes())?;

        // Reserved for the root offset.
        out.write_all(&0u32.to_be_bytes())?;

        let root = Self::write_node(&self.root, out)?;

        let end = out.stream_position()?;
        out.seek(SeekFrom::Start(8))?;
        out.write_all(&root.to_be_bytes())?;
        out.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    fn write_node<W: Write + Seek>(node: &BuildNode, out: &mut W) -> io::Result<u32> {
        // Children first so their offsets are known when this node's body
        // is emitted.
        let mut child_offs = Vec::new();
        if node.has_children() {
            for ch in node.first..=node.last {
                let off = match &node.children[ch] {
                    Some(child) => Self::write_node(child, out)?,
                    None => 0,
                };
                child_offs.push(off);
            }
        }

        let mut offset = out.stream_position()? as u32;

        if !node.prefix.is_empty() {
            out.write_all(&node.prefix)?;
            out.write_all(&[0])?;
            offset |= INDEX_NODE_PREFIX;
        }

        if !child_offs.is_empty() {
            out.write_all(&[node.first as u8, node.last as u8])?;
            for off in &child_offs {
                out.write_all(&off.to_be_bytes())?;
            }
            offset |= INDEX_NODE_CHILDS;
        }

        if !node.values.is_empty() {
            out.write_all(&(node.values.len() as u32).to_be_bytes())?;
            for (priority, value) in &node.values {
                out.write_all(&priority.to_be_bytes())?;
                out.write_all(value.as_bytes())?;
                out.write_all(&[0])?;
            }
            offset |= INDEX_NODE_VALUES;
        }

        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use anyhow::Result;
    use tempfile::NamedTempFile;

    use super::*;

    fn build_and_open(entries: &[(&str, &str, u32)]) -> Result<(Index, NamedTempFile)> {
        let mut builder = IndexBuilder::new();
        for (key, value, priority) in entries {
            builder.insert(key, value, *priority);
        }
        let mut file = NamedTempFile::new()?;
        builder.write(file.as_file_mut())?;
        let idx = Index::open(file.path())?;
        Ok((idx, file))
    }

    #[test]
    fn exact_search() -> Result<()> {
        let (idx, _file) = build_and_open(&[
            ("ask", "value-ask", 0),
            ("ate", "value-ate", 1),
            ("on", "value-on", 2),
            ("once", "value-once", 3),
            ("one", "value-one", 4),
        ])?;

        assert_eq!(idx.search("ask").as_deref(), Some("value-ask"));
        assert_eq!(idx.search("once").as_deref(), Some("value-once"));
        assert_eq!(idx.search("on").as_deref(), Some("value-on"));
        assert_eq!(idx.search("o"), None);
        assert_eq!(idx.search("onc"), None);
        assert_eq!(idx.search("missing"), None);
        Ok(())
    }

    #[test]
    fn priorities_order_results() -> Result<()> {
        let (idx, _file) = build_and_open(&[
            ("key", "third", 30),
            ("key", "first", 10),
            ("key", "second", 20),
        ])?;

        // Exact search returns the lowest priority.
        assert_eq!(idx.search("key").as_deref(), Some("first"));

        let all = idx.search_wild("key");
        let values: Vec<_> = all.iter().map(|v| v.value.as_str()).collect();
        assert_eq!(values, ["first", "second", "third"]);
        Ok(())
    }

    #[test]
    fn equal_priorities_keep_insertion_order() -> Result<()> {
        let (idx, _file) =
            build_and_open(&[("key", "a", 5), ("key", "b", 5), ("key", "c", 5)])?;
        let values: Vec<_> = idx.search_wild("key").into_iter().map(|v| v.value).collect();
        assert_eq!(values, ["a", "b", "c"]);
        Ok(())
    }

    #[test]
    fn duplicate_detection() {
        let mut builder = IndexBuilder::new();
        assert!(!builder.insert("mod", "line", 0));
        assert!(!builder.insert("mod", "other", 1));
        assert!(builder.insert("mod", "line", 2));
    }

    #[test]
    fn wildcard_search_matches_globs() -> Result<()> {
        let (idx, _file) = build_and_open(&[
            ("pci:v0000103Cd*sv*sd*bc01sc04i*", "mod_fake", 0),
            ("usb:v*p*", "usb_mod", 1),
            ("plainkey", "plain_mod", 2),
        ])?;

        let hits = idx.search_wild("pci:v0000103Cd0000323Asv0000103Csd00003233bc01sc04i00");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].value, "mod_fake");

        let hits = idx.search_wild("usb:v1234pABCD");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].value, "usb_mod");

        // A non-matching device id finds nothing.
        assert!(idx.search_wild("pci:v0000FFFFd0000323A").is_empty());

        // Exact keys still match through the wildcard path.
        let hits = idx.search_wild("plainkey");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].value, "plain_mod");
        Ok(())
    }

    #[test]
    fn wildcard_range_patterns() -> Result<()> {
        let (idx, _file) = build_and_open(&[("mod_foo_[a-c]", "mod_foo", 0)])?;
        assert_eq!(idx.search_wild("mod_foo_b").len(), 1);
        assert!(idx.search_wild("mod_foo_z").is_empty());
        Ok(())
    }

    #[test]
    fn roundtrip_preserves_every_key() -> Result<()> {
        let entries: Vec<(String, String, u32)> = (0..200)
            .map(|i| (format!("key{i:03}"), format!("value{i}"), i))
            .collect();
        let mut builder = IndexBuilder::new();
        for (k, v, p) in &entries {
            builder.insert(k, v, *p);
        }
        let mut file = NamedTempFile::new()?;
        builder.write(file.as_file_mut())?;
        let idx = Index::open(file.path())?;

        for (k, v, _) in &entries {
            assert_eq!(idx.search(k).as_deref(), Some(v.as_str()), "key {k}");
        }
        Ok(())
    }

    #[test]
    fn dump_lists_all_values() -> Result<()> {
        let (idx, _file) = build_and_open(&[
            ("bbb", "2", 1),
            ("aaa", "1", 0),
        ])?;
        let mut out = Vec::new();
        idx.dump(&mut out, false)?;
        let text = String::from_utf8(out)?;
        assert_eq!(text, "aaa 1\nbbb 2\n");

        let mut out = Vec::new();
        idx.dump(&mut out, true)?;
        let text = String::from_utf8(out)?;
        assert_eq!(text, "alias aaa 1\nalias bbb 2\n");
        Ok(())
    }

    #[test]
    fn open_rejects_bad_files() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        file.as_file_mut().write_all(&[0u8; 16])?;
        assert!(matches!(
            Index::open(file.path()),
            Err(OpenError::BadMagic(_))
        ));

        let mut file = NamedTempFile::new()?;
        {
            let f = file.as_file_mut();
            f.write_all(&INDEX_MAGIC.to_be_bytes())?;
            // major version 3
            f.write_all(&0x0003_0001u32.to_be_bytes())?;
            f.write_all(&0u32.to_be_bytes())?;
        }
        assert!(matches!(
            Index::open(file.path()),
            Err(OpenError::BadVersion(3, 1))
        ));

        let mut file = NamedTempFile::new()?;
        file.as_file_mut().write_all(b"xy")?;
        assert!(matches!(Index::open(file.path()), Err(OpenError::Truncated)));
        Ok(())
    }

    #[test]
    fn deterministic_output() -> Result<()> {
        let mut write_one = || -> Result<Vec<u8>> {
            let mut builder = IndexBuilder::new();
            builder.insert("ext4", "kernel/fs/ext4/ext4.ko:", 0);
            builder.insert("ext3", "kernel/fs/ext3/ext3.ko:", 1);
            let mut buf = Cursor::new(Vec::new());
            builder.write(&mut buf)?;
            Ok(buf.into_inner())
        };
        assert_eq!(write_one()?, write_one()?);
        Ok(())
    }
}
