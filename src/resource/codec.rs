//! `.rsrc` wire codec (C6): decode/encode between the on-disk resource
//! directory tree and [`Rsrc`], plus `shift` — the RVA-relocation helper
//! `malloc` runs whenever a `.rsrc` section's address changes.
//!
//! All three operations work with section-relative offsets, mirroring real
//! IMAGE_RESOURCE_DIRECTORY layout: a 16-byte directory header followed by
//! 8-byte `(name, data)` entry pairs, where the top bit of each word flags
//! "this points at another directory/string" vs "this is data".

use super::entry::{Body, Identity, Rsrc};
use crate::error::{Error, Result};
use std::collections::{HashMap, VecDeque};

const HIGH_BIT: u32 = 0x8000_0000;
const DIR_HEADER_SIZE: usize = 16;
const ENTRY_SIZE: usize = 8;
const DATA_ENTRY_SIZE: usize = 16;

fn get_u16(buf: &[u8], offset: usize) -> Result<u16> {
    let b = buf.get(offset..offset + 2).ok_or(Error::TruncatedInput {
        needed: offset + 2,
        available: buf.len(),
    })?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn get_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let b = buf.get(offset..offset + 4).ok_or(Error::TruncatedInput {
        needed: offset + 4,
        available: buf.len(),
    })?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn set_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

/// Patch every data entry's `data_rva` field by `delta`, in place.
/// Directory back-references are section-relative and untouched; name-word
/// string pointers are untouched too — see DESIGN.md's Open Question note.
pub fn shift(buf: &mut [u8], delta: i64) -> Result<()> {
    log::trace!("shifting .rsrc data entries by {:#x}", delta);
    shift_directory(buf, delta, 0).map_err(|e| {
        log::warn!("failed to shift .rsrc: {}", e);
        e
    })
}

fn shift_directory(buf: &mut [u8], delta: i64, dir_off: usize) -> Result<()> {
    let num_named = get_u16(buf, dir_off + 12)? as usize;
    let num_id = get_u16(buf, dir_off + 14)? as usize;
    for i in 0..num_named + num_id {
        let entry_off = dir_off + DIR_HEADER_SIZE + i * ENTRY_SIZE;
        let data_word = get_u32(buf, entry_off + 4)?;
        if data_word & HIGH_BIT != 0 {
            let sub_off = (data_word & !HIGH_BIT) as usize;
            shift_directory(buf, delta, sub_off)?;
        } else {
            let data_entry_off = data_word as usize;
            let old_rva = get_u32(buf, data_entry_off)?;
            let new_rva = (old_rva as i64 + delta) as u32;
            set_u32(buf, data_entry_off, new_rva);
        }
    }
    Ok(())
}

/// Decode a `.rsrc` section (already placed at `section_va`) into a
/// resource tree.
pub fn decode(section_bytes: &[u8], section_va: u32) -> Result<Rsrc> {
    log::debug!("decoding .rsrc ({} bytes, va={:#x})", section_bytes.len(), section_va);
    let mut buf = section_bytes.to_vec();
    shift(&mut buf, -(section_va as i64)).map_err(|e| {
        log::warn!("failed to un-shift .rsrc for decode: {}", e);
        e
    })?;

    let mut tree = Rsrc::empty();
    let root = decode_directory(&mut tree, &buf, 0, None).map_err(|e| {
        log::warn!("failed to decode .rsrc directory tree: {}", e);
        e
    })?;
    tree.set_root(root);
    log::trace!("decoded .rsrc tree, root node {:?}", root.0);
    Ok(tree)
}

fn decode_directory(
    tree: &mut Rsrc,
    buf: &[u8],
    dir_off: usize,
    parent: Option<super::entry::NodeId>,
) -> Result<super::entry::NodeId> {
    let characteristics = get_u32(buf, dir_off)?;
    let timestamp = get_u32(buf, dir_off + 4)?;
    let version_major = get_u16(buf, dir_off + 8)?;
    let version_minor = get_u16(buf, dir_off + 10)?;
    let num_named = get_u16(buf, dir_off + 12)? as usize;
    let num_id = get_u16(buf, dir_off + 14)? as usize;

    let node_id = tree.push_node(
        None,
        Body::Directory {
            children: Vec::new(),
            characteristics,
            timestamp,
            version_major,
            version_minor,
        },
        parent,
    );

    let mut children = Vec::with_capacity(num_named + num_id);
    for i in 0..num_named + num_id {
        let entry_off = dir_off + DIR_HEADER_SIZE + i * ENTRY_SIZE;
        let name_word = get_u32(buf, entry_off)?;
        let data_word = get_u32(buf, entry_off + 4)?;

        let identity = if name_word & HIGH_BIT != 0 {
            let str_off = (name_word & !HIGH_BIT) as usize;
            let len = get_u16(buf, str_off)? as usize;
            let mut units = Vec::with_capacity(len);
            for k in 0..len {
                units.push(get_u16(buf, str_off + 2 + 2 * k)?);
            }
            let s: String = char::decode_utf16(units)
                .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect();
            Identity::Name(s)
        } else {
            Identity::Id(name_word)
        };

        let child_id = if data_word & HIGH_BIT != 0 {
            let sub_off = (data_word & !HIGH_BIT) as usize;
            decode_directory(tree, buf, sub_off, Some(node_id))?
        } else {
            let data_entry_off = data_word as usize;
            let data_rva = get_u32(buf, data_entry_off)?;
            let size = get_u32(buf, data_entry_off + 4)? as usize;
            let codepage = get_u32(buf, data_entry_off + 8)?;
            let reserved = get_u32(buf, data_entry_off + 12)?;
            let start = data_rva as usize;
            let end = start + size;
            let bytes = buf
                .get(start..end)
                .ok_or(Error::TruncatedInput {
                    needed: end,
                    available: buf.len(),
                })?
                .to_vec();
            tree.push_node(
                None,
                Body::Data {
                    bytes,
                    codepage,
                    reserved,
                },
                Some(node_id),
            )
        };

        tree.set_identity(child_id, identity);
        children.push(child_id);
    }

    tree.set_children(node_id, children);
    Ok(node_id)
}

/// Encode `tree` into section-relative bytes, ready to be placed by `malloc`
/// and (if its VA turns out non-zero) `shift`ed by the caller.
///
/// Directories are written breadth-first via a work queue — the real-world
/// `.rsrc` layout groups all directories at one depth before the next — and
/// named/ID children are kept in insertion order rather than re-sorted to
/// the PE-spec's documented name-then-ID-ascending order (DESIGN.md's Open
/// Question: source-fidelity wins over spec-literal ordering here).
pub fn encode(tree: &Rsrc) -> Result<Vec<u8>> {
    log::debug!("encoding resource tree");
    use super::entry::NodeId;

    // Pass 1: write the directory region breadth-first, recording
    // placeholder slots to patch once offsets/layout are known.
    let mut dirs = Vec::new(); // section-relative bytes for the directory region
    let mut dir_offsets: HashMap<usize, usize> = HashMap::new();
    let mut dir_backpatches: Vec<(usize, NodeId)> = Vec::new(); // (pos in dirs, target dir)
    let mut data_backpatches: Vec<(usize, NodeId)> = Vec::new(); // (pos in dirs, target data node)
    let mut string_backpatches: Vec<(usize, String)> = Vec::new(); // (pos in dirs, string)

    let mut queue: VecDeque<NodeId> = VecDeque::new();
    queue.push_back(tree.root());

    while let Some(dir_id) = queue.pop_front() {
        let offset = dirs.len();
        dir_offsets.insert(dir_id.0, offset);

        let (children, characteristics, timestamp, version_major, version_minor) = match tree.body(dir_id) {
            Body::Directory {
                children,
                characteristics,
                timestamp,
                version_major,
                version_minor,
            } => (children.clone(), *characteristics, *timestamp, *version_major, *version_minor),
            Body::Data { .. } => {
                return Err(Error::ResourceShapeInvalid {
                    detail: "encode queue contained a data node as a directory",
                })
            }
        };

        if children.is_empty() && dir_id.0 != tree.root().0 {
            log::warn!("encode: non-root directory {:?} has no children", dir_id.0);
            return Err(Error::ResourceShapeInvalid {
                detail: "a non-root directory must have at least one child",
            });
        }

        let (named, ids): (Vec<NodeId>, Vec<NodeId>) = children
            .into_iter()
            .partition(|&c| matches!(tree.identity(c), Some(Identity::Name(_))));

        dirs.extend_from_slice(&characteristics.to_le_bytes());
        dirs.extend_from_slice(&timestamp.to_le_bytes());
        dirs.extend_from_slice(&version_major.to_le_bytes());
        dirs.extend_from_slice(&version_minor.to_le_bytes());
        dirs.extend_from_slice(&(named.len() as u16).to_le_bytes());
        dirs.extend_from_slice(&(ids.len() as u16).to_le_bytes());

        for &child in named.iter().chain(ids.iter()) {
            match tree.identity(child) {
                Some(Identity::Name(s)) => {
                    let pos = dirs.len();
                    dirs.extend_from_slice(&0u32.to_le_bytes());
                    string_backpatches.push((pos, s.clone()));
                }
                Some(Identity::Id(v)) => {
                    dirs.extend_from_slice(&v.to_le_bytes());
                }
                None => {
                    log::warn!("encode: entry {:?} has neither a name nor an id", child.0);
                    return Err(Error::ResourceShapeInvalid {
                        detail: "a non-root entry must have a name or an id",
                    })
                }
            }

            if tree.is_directory(child) {
                let pos = dirs.len();
                dirs.extend_from_slice(&0u32.to_le_bytes());
                dir_backpatches.push((pos, child));
                queue.push_back(child);
            } else {
                let pos = dirs.len();
                dirs.extend_from_slice(&0u32.to_le_bytes());
                data_backpatches.push((pos, child));
            }
        }
    }

    let directory_size = dirs.len();
    let data_entry_size = data_backpatches.len() * DATA_ENTRY_SIZE;

    // Unique strings, first-seen order, for coalescing.
    let mut unique_order: Vec<String> = Vec::new();
    let mut seen: HashMap<String, ()> = HashMap::new();
    for (_, s) in &string_backpatches {
        if seen.insert(s.clone(), ()).is_none() {
            unique_order.push(s.clone());
        }
    }
    let string_size: usize = unique_order
        .iter()
        .map(|s| 2 + 2 * s.encode_utf16().count())
        .sum();

    let blob_start = directory_size + data_entry_size + string_size;
    let data_size: usize = data_backpatches
        .iter()
        .map(|(_, id)| match tree.body(*id) {
            Body::Data { bytes, .. } => bytes.len(),
            Body::Directory { .. } => 0,
        })
        .sum();

    let total = blob_start + data_size;
    let mut out = vec![0u8; total];
    out[..directory_size].copy_from_slice(&dirs);

    for (pos, target) in &dir_backpatches {
        let off = *dir_offsets.get(&target.0).ok_or_else(|| {
            log::warn!("encode: directory {:?} was never patched", target.0);
            Error::ResourceShapeInvalid {
                detail: "directory back-reference never patched",
            }
        })?;
        set_u32(&mut out, *pos, off as u32 | HIGH_BIT);
    }

    let mut blob_cursor = blob_start;
    for (i, (pos, data_id)) in data_backpatches.iter().enumerate() {
        let record_offset = directory_size + i * DATA_ENTRY_SIZE;
        set_u32(&mut out, *pos, record_offset as u32);

        let (bytes, codepage, reserved) = match tree.body(*data_id) {
            Body::Data {
                bytes,
                codepage,
                reserved,
            } => (bytes, *codepage, *reserved),
            Body::Directory { .. } => {
                return Err(Error::ResourceShapeInvalid {
                    detail: "encode queue contained a directory as a data entry",
                })
            }
        };

        set_u32(&mut out, record_offset, blob_cursor as u32);
        set_u32(&mut out, record_offset + 4, bytes.len() as u32);
        set_u32(&mut out, record_offset + 8, codepage);
        set_u32(&mut out, record_offset + 12, reserved);

        out[blob_cursor..blob_cursor + bytes.len()].copy_from_slice(bytes);
        blob_cursor += bytes.len();
    }

    let mut string_offsets: HashMap<String, usize> = HashMap::new();
    let mut cursor = directory_size + data_entry_size;
    for s in &unique_order {
        let units: Vec<u16> = s.encode_utf16().collect();
        string_offsets.insert(s.clone(), cursor);
        out[cursor..cursor + 2].copy_from_slice(&(units.len() as u16).to_le_bytes());
        let mut pos = cursor + 2;
        for unit in &units {
            out[pos..pos + 2].copy_from_slice(&unit.to_le_bytes());
            pos += 2;
        }
        cursor += 2 + 2 * units.len();
    }

    for (pos, s) in &string_backpatches {
        let off = string_offsets[s];
        set_u32(&mut out, *pos, off as u32 | HIGH_BIT);
    }

    log::trace!("encoded resource tree into {} bytes", out.len());
    Ok(out)
}
