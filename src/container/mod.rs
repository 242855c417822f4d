//! The PE container (C4): parse, the two allocation passes, header rewrite,
//! and `malloc`.
//!
//! The parse half generalizes the teacher's `parse_pe_header`/
//! `parse_sections_table` (`parser/header_parse.rs`); the teacher never
//! writes a PE back out, so the emit half (virtual/file allocation,
//! header rewrite, output assembly) is new, built in the same fixed-offset
//! cursor style the teacher reads with.

use crate::alloc_span::{align_up, align_up_u64, AllocationMap, Span};
use crate::error::{Error, Result, SectionTag};
use crate::resource::{codec, Rsrc};
use crate::section::Section;

/// Default `expected_headers_size`: the common real-world `SizeOfHeaders`
/// value for tools that pad headers to a page.
pub const DEFAULT_HEADERS_SIZE: u32 = 0x1000;

// Offsets are all relative to `NtHeadersOffset` (the `u32@0x3C` pointer to
// the "PE\0\0" signature), except where noted. These match the real
// IMAGE_NT_HEADERS32/IMAGE_FILE_HEADER layout: the signature occupies 4
// bytes, IMAGE_FILE_HEADER the next 20, and the optional header starts at
// NtHeaders+0x18 — which is also where the section table formula below
// ("NtHeaders + 4 + 0x14 + SizeOfOptionalHeader") lands once you walk it out.
// A couple of naive offset derivations (PointerToSymbolTable at NtHeaders+8,
// SizeOfOptionalHeader at NtHeaders+0x10) are short by exactly 4 bytes
// against that formula and against real IMAGE_FILE_HEADER layout; the ones
// below follow the self-consistent formula instead, since that's the one
// the loader actually has to agree with.
const DOS_E_LFANEW: usize = 0x3C;
const NT_SIGNATURE: usize = 0x00;
const NT_MACHINE: usize = 0x04;
const NT_NUMBER_OF_SECTIONS: usize = 0x06;
const NT_POINTER_TO_SYMBOL_TABLE: usize = 0x0C;
const NT_SIZE_OF_OPTIONAL_HEADER: usize = 0x14;
const NT_OPTIONAL_HEADER_START: usize = 0x18;

const OH_MAGIC: usize = 0x00;
const OH_SECTION_ALIGNMENT: usize = 0x20;
const OH_FILE_ALIGNMENT: usize = 0x24;
const OH_SIZE_OF_IMAGE: usize = 0x38;
const OH_SIZE_OF_HEADERS: usize = 0x3C;
const OH_RESOURCE_TABLE_RVA: usize = 0x70;

const MIN_OPTIONAL_HEADER_SIZE: u16 = 0x78;
const PE32_MAGIC: u16 = 0x010B;
const PE_SIGNATURE: u32 = 0x0000_4550;

const SECTION_HEADER_SIZE: usize = 40;
const SEC_TAG: usize = 0;
const SEC_VIRTUAL_SIZE: usize = 8;
const SEC_VIRTUAL_ADDRESS: usize = 12;
const SEC_SIZE_OF_RAW_DATA: usize = 16;
const SEC_POINTER_TO_RAW_DATA: usize = 20;
const SEC_POINTER_TO_RELOCATIONS: usize = 24;
const SEC_POINTER_TO_LINENUMBERS: usize = 28;
const SEC_NUMBER_OF_RELOCATIONS: usize = 32;
const SEC_NUMBER_OF_LINENUMBERS: usize = 34;
const SEC_CHARACTERISTICS: usize = 36;

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

fn set_u16(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn set_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

/// A parsed (or freshly built) PE image: the verbatim early-header bytes
/// plus a live section list.
#[derive(Debug, Clone)]
pub struct PE {
    early_header: Vec<u8>,
    sections: Vec<Section>,
    expected_headers_size: u32,
}

impl PE {
    fn nt_offset(&self) -> Result<usize> {
        Ok(get_u32(&self.early_header, DOS_E_LFANEW)? as usize)
    }

    fn oh_start(&self) -> Result<usize> {
        Ok(self.nt_offset()? + NT_OPTIONAL_HEADER_START)
    }

    /// Parse a PE image out of `bytes`. `expected_headers_size` defaults to
    /// [`DEFAULT_HEADERS_SIZE`] when `None`.
    pub fn parse(bytes: &[u8], expected_headers_size: Option<u32>) -> Result<PE> {
        let expected = expected_headers_size.unwrap_or(DEFAULT_HEADERS_SIZE);
        log::debug!(
            "parsing PE image: {} bytes, expected_headers_size={:#x}",
            bytes.len(),
            expected
        );
        if (bytes.len() as u64) < expected as u64 {
            log::warn!(
                "input too short for headers: {} bytes, need {:#x}",
                bytes.len(),
                expected
            );
            return Err(Error::NotAPE);
        }
        let early_header = bytes[..expected as usize].to_vec();

        let nt_off = get_u32(&early_header, DOS_E_LFANEW)? as usize;
        let signature = get_u32(&early_header, nt_off + NT_SIGNATURE)?;
        if signature != PE_SIGNATURE {
            log::warn!("missing PE signature at nt_off={:#x}", nt_off);
            return Err(Error::NotAPE);
        }

        let number_of_sections = get_u16(&early_header, nt_off + NT_NUMBER_OF_SECTIONS)?;
        let symbol_table_ptr = get_u32(&early_header, nt_off + NT_POINTER_TO_SYMBOL_TABLE)?;
        if symbol_table_ptr != 0 {
            log::warn!("COFF symbol table present at {:#x}", symbol_table_ptr);
            return Err(Error::SymbolTablePresent);
        }

        let size_of_optional_header = get_u16(&early_header, nt_off + NT_SIZE_OF_OPTIONAL_HEADER)?;
        if size_of_optional_header < MIN_OPTIONAL_HEADER_SIZE {
            log::warn!("optional header too small: {:#x}", size_of_optional_header);
            return Err(Error::OptionalHeaderTooSmall {
                found: size_of_optional_header,
            });
        }

        let oh_start = nt_off + NT_OPTIONAL_HEADER_START;
        let magic = get_u16(&early_header, oh_start + OH_MAGIC)?;
        if magic != PE32_MAGIC {
            log::warn!("unsupported optional header magic {:#06x}", magic);
            return Err(Error::UnsupportedOptionalMagic { found: magic });
        }

        let size_of_headers = get_u32(&early_header, oh_start + OH_SIZE_OF_HEADERS)?;
        if size_of_headers != expected {
            log::warn!(
                "SizeOfHeaders mismatch: expected {:#x}, found {:#x}",
                expected,
                size_of_headers
            );
            return Err(Error::HeadersSizeMismatch {
                expected,
                found: size_of_headers,
            });
        }

        let section_table_start = oh_start + size_of_optional_header as usize;
        let mut sections = Vec::with_capacity(number_of_sections as usize);
        for i in 0..number_of_sections as usize {
            let off = section_table_start + i * SECTION_HEADER_SIZE;
            let tag_bytes = early_header
                .get(off + SEC_TAG..off + SEC_TAG + 8)
                .ok_or(Error::TruncatedInput {
                    needed: off + SEC_TAG + 8,
                    available: early_header.len(),
                })?;
            let mut tag = [0u8; 8];
            tag.copy_from_slice(tag_bytes);

            let virtual_size = get_u32(&early_header, off + SEC_VIRTUAL_SIZE)?;
            let virtual_address = get_u32(&early_header, off + SEC_VIRTUAL_ADDRESS)?;
            let size_of_raw_data = get_u32(&early_header, off + SEC_SIZE_OF_RAW_DATA)?;
            let pointer_to_raw_data = get_u32(&early_header, off + SEC_POINTER_TO_RAW_DATA)?;
            let number_of_relocations = get_u16(&early_header, off + SEC_NUMBER_OF_RELOCATIONS)?;
            let number_of_linenumbers = get_u16(&early_header, off + SEC_NUMBER_OF_LINENUMBERS)?;
            let characteristics = get_u32(&early_header, off + SEC_CHARACTERISTICS)?;

            if number_of_relocations != 0 {
                log::warn!("section {} has relocations", SectionTag(tag));
                return Err(Error::RelocationsPresent { tag: SectionTag(tag) });
            }
            if number_of_linenumbers != 0 {
                log::warn!("section {} has COFF line numbers", SectionTag(tag));
                return Err(Error::LineNumbersPresent { tag: SectionTag(tag) });
            }

            let raw_start = pointer_to_raw_data as usize;
            let raw_end = raw_start + size_of_raw_data as usize;
            let raw_data = bytes
                .get(raw_start..raw_end)
                .ok_or(Error::TruncatedInput {
                    needed: raw_end,
                    available: bytes.len(),
                })?
                .to_vec();

            let meta_linearize = pointer_to_raw_data == virtual_address;
            log::trace!(
                "section {} va={:#x} vs={:#x} raw={}@{:#x} linearize={}",
                SectionTag(tag),
                virtual_address,
                virtual_size,
                size_of_raw_data,
                pointer_to_raw_data,
                meta_linearize
            );

            let mut section = Section::new(tag, virtual_address, virtual_size, raw_data);
            section.file_address = pointer_to_raw_data;
            section.characteristics = characteristics;
            section.meta_linearize = meta_linearize;
            sections.push(section);
        }

        sections.sort_by_key(|s| s.virtual_address);
        check_virtual_integrity(&sections).map_err(|e| {
            log::warn!("virtual integrity check failed on parse: {}", e);
            e
        })?;

        Ok(PE {
            early_header,
            sections,
            expected_headers_size: expected,
        })
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn sections_mut(&mut self) -> &mut [Section] {
        &mut self.sections
    }

    pub fn expected_headers_size(&self) -> u32 {
        self.expected_headers_size
    }

    pub fn section_index_by_tag(&self, tag: &[u8; 8]) -> Option<usize> {
        self.sections.iter().position(|s| &s.tag == tag)
    }

    /// Read a `u32` at `offset` bytes into the optional header.
    pub fn get_optional_header_u32(&self, offset: usize) -> Result<u32> {
        let oh_start = self.oh_start()?;
        get_u32(&self.early_header, oh_start + offset)
    }

    /// Overwrite a `u32` at `offset` bytes into the optional header.
    pub fn set_optional_header_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        let oh_start = self.oh_start()?;
        set_u32(&mut self.early_header, oh_start + offset, value);
        Ok(())
    }

    pub fn section_alignment(&self) -> Result<u32> {
        self.get_optional_header_u32(OH_SECTION_ALIGNMENT)
    }

    pub fn file_alignment(&self) -> Result<u32> {
        self.get_optional_header_u32(OH_FILE_ALIGNMENT)
    }

    /// Index of the section whose RVA matches the optional header's
    /// ResourceTable directory entry, or `None` if this image has no
    /// `.rsrc` (a Rust-idiomatic stand-in for the 0-based/-1-sentinel
    /// convention; see DESIGN.md).
    pub fn resources_index(&self) -> Result<Option<usize>> {
        let rva = self.get_optional_header_u32(OH_RESOURCE_TABLE_RVA)?;
        if rva == 0 {
            return Ok(None);
        }
        Ok(self.sections.iter().position(|s| s.virtual_address == rva))
    }

    /// Resolve an RVA to `(section_index, offset_into_raw_data)`, or `None`
    /// if it falls outside every section's virtual range.
    pub fn setup_rva_cursor(&self, rva: u32) -> Option<(usize, u32)> {
        self.sections.iter().enumerate().find_map(|(i, s)| {
            if s.virtual_range().contains(&(rva as u64)) {
                Some((i, rva - s.virtual_address))
            } else {
                None
            }
        })
    }

    /// Decode the `.rsrc` section into a resource tree, if present.
    pub fn rsrc(&self) -> Result<Option<Rsrc>> {
        let idx = match self.resources_index()? {
            Some(i) => i,
            None => return Ok(None),
        };
        let section = &self.sections[idx];
        log::trace!(
            "decoding .rsrc: section {} ({} bytes)",
            section.tag_display(),
            section.raw_data.len()
        );
        let tree = codec::decode(&section.raw_data, section.virtual_address).map_err(|e| {
            log::warn!("failed to decode .rsrc: {}", e);
            e
        })?;
        Ok(Some(tree))
    }

    /// Encode `tree` and install it as this image's `.rsrc` section,
    /// replacing any existing one and rewriting the optional header's
    /// ResourceTable RVA.
    pub fn set_resources(&mut self, tree: &Rsrc) -> Result<()> {
        log::debug!("encoding resource tree into .rsrc");
        let raw = codec::encode(tree).map_err(|e| {
            log::warn!("failed to encode resource tree: {}", e);
            e
        })?;
        // The old `.rsrc`, if any, is dropped outright: the freshly encoded
        // bytes replace it entirely and start out section-relative (as if
        // placed at VA 0), so `place_rsrc` below shifts from 0, not from the
        // old section's address.
        if let Some(idx) = self.resources_index()? {
            log::trace!("replacing existing .rsrc section at index {}", idx);
            self.sections.remove(idx);
        }
        let mut section = Section::new(Section::make_tag(".rsrc"), 0, raw.len() as u32, raw);
        section.characteristics = crate::section::SectionFlag::CNT_INITIALIZED_DATA.bits()
            | crate::section::SectionFlag::MEM_READ.bits();

        let alignment = self.section_alignment()?;
        self.place_rsrc(section, alignment)?;
        self.sections.sort_by_key(|s| s.virtual_address);
        Ok(())
    }

    /// Place `section` after the current image end, keeping `.rsrc` last and
    /// relocating/shifting it if one exists.
    pub fn malloc(&mut self, mut section: Section, resort: bool) -> Result<()> {
        log::debug!("malloc: inserting section {}", section.tag_display());
        let alignment = self.section_alignment()?;
        let rsrc = match self.resources_index()? {
            Some(idx) => Some(self.sections.remove(idx)),
            None => None,
        };

        let start = self.early_header.len() as u32;
        self.place(&mut section, start, alignment);
        log::trace!(
            "placed section {} at va={:#x}",
            section.tag_display(),
            section.virtual_address
        );
        self.sections.push(section);

        if let Some(rsrc_section) = rsrc {
            self.place_rsrc(rsrc_section, alignment)?;
        }

        if resort {
            self.sections.sort_by_key(|s| s.virtual_address);
        }
        Ok(())
    }

    /// Place `rsrc_section` past the current section list, shift its `.rsrc`
    /// bytes from its current address to the newly assigned one, push it
    /// back onto `self.sections`, and rewrite the optional header's
    /// ResourceTable RVA to match. `rsrc_section.virtual_address` is read
    /// before placement as the "current address" the shift is relative to —
    /// callers that haven't placed it yet (freshly encoded bytes) pass it in
    /// at VA 0, matching `codec::encode`'s section-relative output.
    fn place_rsrc(&mut self, mut rsrc_section: Section, alignment: u32) -> Result<()> {
        let old_va = rsrc_section.virtual_address;
        let start = self
            .sections
            .iter()
            .map(|s| s.virtual_address + s.virtual_size)
            .max()
            .unwrap_or(0);
        self.place(&mut rsrc_section, start, alignment);
        let delta = rsrc_section.virtual_address as i64 - old_va as i64;
        if delta != 0 {
            codec::shift(&mut rsrc_section.raw_data, delta).map_err(|e| {
                log::warn!("failed to shift .rsrc by {:#x}: {}", delta, e);
                e
            })?;
        }
        let new_rva = rsrc_section.virtual_address;
        log::trace!(".rsrc placed at va={:#x} (delta={:#x})", new_rva, delta);
        self.sections.push(rsrc_section);
        self.set_optional_header_u32(OH_RESOURCE_TABLE_RVA, new_rva)
    }

    /// First-fit aligned placement for a section not yet in `self.sections`.
    fn place(&self, section: &mut Section, start: u32, alignment: u32) {
        let align = if alignment == 0 { 1 } else { alignment };
        let mut candidate = align_up(start, align);
        let size = align_up(section.virtual_size.max(1), align);
        loop {
            let span = Span::new(candidate, size);
            let collides = self.sections.iter().any(|s| {
                let other_size = align_up(s.virtual_size.max(1), align);
                span.collides(&Span::new(s.virtual_address, other_size))
            });
            if !collides {
                break;
            }
            candidate += align;
        }
        section.virtual_address = candidate;
    }

    /// Drop stale `.flrXXXX` fillers and insert fresh ones covering every
    /// gap in the virtual layout (implemented in `filler.rs`).
    pub fn fill_virtual_layout_gaps(&mut self) -> Result<()> {
        crate::filler::fill_virtual_layout_gaps(self)
    }

    /// Drop every section for which `keep` returns `false`. Used by
    /// `filler.rs` to remove stale `.flrXXXX` sections before recomputing gaps.
    pub(crate) fn retain_sections(&mut self, keep: impl FnMut(&Section) -> bool) {
        self.sections.retain(keep);
    }

    pub(crate) fn sort_sections_by_va(&mut self) {
        self.sections.sort_by_key(|s| s.virtual_address);
    }

    /// Append `section` as-is, without running it through `place`. Used by
    /// tests that need to set up a specific (possibly non-contiguous or
    /// overlapping) virtual layout directly.
    #[cfg(test)]
    pub(crate) fn push_section_raw(&mut self, section: Section) {
        self.sections.push(section);
    }

    /// Insert `section` at exactly `virtual_address`, bypassing `place`'s
    /// first-fit search. Used by `filler.rs`, which has already located the
    /// gap it's patching and must not let a generic search wander into some
    /// other free span instead.
    pub(crate) fn insert_section_at(&mut self, mut section: Section, virtual_address: u32) {
        section.virtual_address = virtual_address;
        log::trace!(
            "inserting section {} at fixed va={:#x}",
            section.tag_display(),
            virtual_address
        );
        self.sections.push(section);
    }

    /// Re-run the ascending-VA, non-overlapping check emit relies on, without
    /// performing a full emit. Useful after manual edits to `sections()`.
    pub fn check_virtual_integrity(&self) -> Result<()> {
        let mut sorted = self.sections.clone();
        sorted.sort_by_key(|s| s.virtual_address);
        check_virtual_integrity(&sorted)
    }

    /// Emit the image back to bytes.
    pub fn write(&mut self) -> Result<Vec<u8>> {
        log::debug!("emitting PE image: {} sections", self.sections.len());

        // Virtual integrity pass: sections sorted ascending by VA, no overlaps.
        self.sections.sort_by_key(|s| s.virtual_address);
        check_virtual_integrity(&self.sections).map_err(|e| {
            log::warn!("virtual integrity check failed on emit: {}", e);
            e
        })?;

        // File allocation pass: linearized sections get first pick at their
        // preferred file offset, everything else is packed first-fit.
        let file_alignment = self.file_alignment()?;
        let align = if file_alignment == 0 { 1 } else { file_alignment };

        let mut map = AllocationMap::new();
        map.reserve(Span::new(0, self.early_header.len() as u32));

        let mut file_addrs = vec![0u32; self.sections.len()];
        let mut placed = vec![false; self.sections.len()];

        for (i, s) in self.sections.iter().enumerate() {
            if s.meta_linearize {
                let span = Span::new(s.virtual_address, s.raw_data.len() as u32);
                if !map.collides(&span) {
                    map.reserve(span);
                    file_addrs[i] = s.virtual_address;
                    placed[i] = true;
                }
            }
        }

        for (i, s) in self.sections.iter().enumerate() {
            if placed[i] {
                continue;
            }
            let mut position = 0u32;
            loop {
                let span = Span::new(position, s.raw_data.len() as u32);
                if !map.collides(&span) {
                    break;
                }
                position += align;
            }
            map.reserve(Span::new(position, s.raw_data.len() as u32));
            file_addrs[i] = position;
        }

        for (i, s) in self.sections.iter_mut().enumerate() {
            s.file_address = file_addrs[i];
        }

        self.rewrite_headers()?;

        let file_size = align_up_u64(map.extent(), align);
        log::trace!("output buffer size={:#x}", file_size);
        let mut out = vec![0u8; file_size as usize];
        out[..self.early_header.len()].copy_from_slice(&self.early_header);
        for s in &self.sections {
            let start = s.file_address as usize;
            let end = start + s.raw_data.len();
            out[start..end].copy_from_slice(&s.raw_data);
        }
        Ok(out)
    }

    fn rewrite_headers(&mut self) -> Result<()> {
        let nt_off = self.nt_offset()?;
        set_u16(
            &mut self.early_header,
            nt_off + NT_NUMBER_OF_SECTIONS,
            self.sections.len() as u16,
        );

        let size_of_optional_header = get_u16(&self.early_header, nt_off + NT_SIZE_OF_OPTIONAL_HEADER)?;
        let oh_start = nt_off + NT_OPTIONAL_HEADER_START;
        let section_table_start = oh_start + size_of_optional_header as usize;

        let needed = section_table_start + self.sections.len() * SECTION_HEADER_SIZE;
        if needed > self.early_header.len() {
            return Err(Error::TruncatedInput {
                needed,
                available: self.early_header.len(),
            });
        }

        for (i, s) in self.sections.iter().enumerate() {
            let off = section_table_start + i * SECTION_HEADER_SIZE;
            self.early_header[off + SEC_TAG..off + SEC_TAG + 8].copy_from_slice(&s.tag);
            set_u32(&mut self.early_header, off + SEC_VIRTUAL_SIZE, s.virtual_size);
            set_u32(&mut self.early_header, off + SEC_VIRTUAL_ADDRESS, s.virtual_address);
            set_u32(
                &mut self.early_header,
                off + SEC_SIZE_OF_RAW_DATA,
                s.raw_data.len() as u32,
            );
            set_u32(&mut self.early_header, off + SEC_POINTER_TO_RAW_DATA, s.file_address);
            set_u32(&mut self.early_header, off + SEC_POINTER_TO_RELOCATIONS, 0);
            set_u32(&mut self.early_header, off + SEC_POINTER_TO_LINENUMBERS, 0);
            set_u16(&mut self.early_header, off + SEC_NUMBER_OF_RELOCATIONS, 0);
            set_u16(&mut self.early_header, off + SEC_NUMBER_OF_LINENUMBERS, 0);
            set_u32(&mut self.early_header, off + SEC_CHARACTERISTICS, s.characteristics);
        }

        let section_alignment = get_u32(&self.early_header, oh_start + OH_SECTION_ALIGNMENT)?;
        let image_size = self
            .sections
            .iter()
            .map(|s| s.virtual_address as u64 + s.virtual_size as u64)
            .max()
            .unwrap_or(0);
        let image_size = align_up_u64(image_size, section_alignment) as u32;
        set_u32(&mut self.early_header, oh_start + OH_SIZE_OF_IMAGE, image_size);

        Ok(())
    }
}

/// `sections` must already be sorted ascending by `virtual_address`; callers
/// sort in place right before this check rather than on every insertion.
fn check_virtual_integrity(sections: &[Section]) -> Result<()> {
    let mut floor = 0u64;
    let mut prev: Option<&Section> = None;
    for s in sections {
        if (s.virtual_address as u64) < floor {
            let first = prev.expect("floor only advances once a section has been seen");
            return Err(Error::SectionRVAOverlap {
                first: SectionTag(first.tag),
                second: SectionTag(s.tag),
            });
        }
        floor = s.virtual_address as u64 + s.virtual_size as u64;
        prev = Some(s);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_headers(section_alignment: u32, file_alignment: u32, headers_size: u32) -> Vec<u8> {
        let nt_off = 0x80usize;
        let size_of_optional_header: u16 = 0xE0;
        let oh_start = nt_off + NT_OPTIONAL_HEADER_START;
        let mut buf = vec![0u8; headers_size as usize];
        set_u32(&mut buf, DOS_E_LFANEW, nt_off as u32);
        set_u32(&mut buf, nt_off + NT_SIGNATURE, PE_SIGNATURE);
        set_u16(&mut buf, nt_off + NT_NUMBER_OF_SECTIONS, 0);
        set_u32(&mut buf, nt_off + NT_POINTER_TO_SYMBOL_TABLE, 0);
        set_u16(
            &mut buf,
            nt_off + NT_SIZE_OF_OPTIONAL_HEADER,
            size_of_optional_header,
        );
        set_u16(&mut buf, oh_start + OH_MAGIC, PE32_MAGIC);
        set_u32(&mut buf, oh_start + OH_SECTION_ALIGNMENT, section_alignment);
        set_u32(&mut buf, oh_start + OH_FILE_ALIGNMENT, file_alignment);
        set_u32(&mut buf, oh_start + OH_SIZE_OF_HEADERS, headers_size);
        buf
    }

    #[test]
    fn parse_rejects_short_input() {
        let bytes = vec![0u8; 0x10];
        assert_eq!(PE::parse(&bytes, Some(0x1000)), Err(Error::NotAPE));
    }

    #[test]
    fn parse_rejects_missing_signature() {
        let bytes = vec![0u8; 0x1000];
        assert_eq!(PE::parse(&bytes, Some(0x1000)), Err(Error::NotAPE));
    }

    #[test]
    fn parse_accepts_minimal_header_with_no_sections() {
        let bytes = minimal_headers(0x1000, 0x200, 0x1000);
        let pe = PE::parse(&bytes, Some(0x1000)).expect("should parse");
        assert_eq!(pe.sections().len(), 0);
        assert_eq!(pe.section_alignment().unwrap(), 0x1000);
        assert_eq!(pe.file_alignment().unwrap(), 0x200);
    }

    #[test]
    fn parse_accepts_a_single_text_section_at_a_nonlinear_file_offset() {
        let nt_off = 0x80usize;
        let oh_start = nt_off + NT_OPTIONAL_HEADER_START;
        let section_table_start = oh_start + 0xE0;
        let headers_size = 0x400u32;
        let mut buf = minimal_headers(0x1000, 0x200, headers_size);
        buf.resize((section_table_start + SECTION_HEADER_SIZE).max(buf.len()), 0);
        buf[section_table_start..section_table_start + 5].copy_from_slice(b".text");
        set_u32(&mut buf, section_table_start + SEC_VIRTUAL_SIZE, 0x100);
        set_u32(&mut buf, section_table_start + SEC_VIRTUAL_ADDRESS, 0x1000);
        set_u32(&mut buf, section_table_start + SEC_SIZE_OF_RAW_DATA, 0x200);
        set_u32(&mut buf, section_table_start + SEC_POINTER_TO_RAW_DATA, 0x400);
        set_u16(&mut buf, nt_off + NT_NUMBER_OF_SECTIONS, 1);

        let payload = vec![0x90u8; 0x200];
        let mut bytes = buf.clone();
        bytes.resize(0x600, 0);
        bytes[0x400..0x600].copy_from_slice(&payload);

        let pe = PE::parse(&bytes, Some(headers_size)).expect("should parse");
        assert_eq!(pe.sections().len(), 1);
        assert_eq!(pe.sections()[0].tag_display().trim_end_matches('\0'), ".text");
        assert_eq!(pe.sections()[0].virtual_address, 0x1000);
        assert_eq!(pe.sections()[0].virtual_size, 0x100);
        assert_eq!(pe.sections()[0].raw_data, payload);
        assert!(!pe.sections()[0].meta_linearize);
    }

    #[test]
    fn parse_rejects_symbol_table() {
        let mut bytes = minimal_headers(0x1000, 0x200, 0x1000);
        set_u32(&mut bytes, 0x80 + NT_POINTER_TO_SYMBOL_TABLE, 0x500);
        assert_eq!(PE::parse(&bytes, Some(0x1000)), Err(Error::SymbolTablePresent));
    }

    #[test]
    fn malloc_places_new_section_past_headers() {
        let bytes = minimal_headers(0x1000, 0x200, 0x1000);
        let mut pe = PE::parse(&bytes, Some(0x1000)).expect("should parse");
        let section = Section::new(Section::make_tag(".data"), 0, 0x50, vec![1, 2, 3]);
        pe.malloc(section, true).expect("malloc should succeed");
        assert_eq!(pe.sections().len(), 1);
        assert_eq!(pe.sections()[0].virtual_address, 0x1000);
    }

    #[test]
    fn malloc_avoids_collisions_with_existing_sections() {
        let bytes = minimal_headers(0x1000, 0x200, 0x1000);
        let mut pe = PE::parse(&bytes, Some(0x1000)).expect("should parse");
        pe.malloc(
            Section::new(Section::make_tag(".a"), 0, 0x50, vec![0; 0x10]),
            true,
        )
        .unwrap();
        pe.malloc(
            Section::new(Section::make_tag(".b"), 0, 0x50, vec![0; 0x10]),
            true,
        )
        .unwrap();
        let vas: Vec<u32> = pe.sections().iter().map(|s| s.virtual_address).collect();
        assert_eq!(vas, vec![0x1000, 0x2000]);
    }

    #[test]
    fn malloc_shifts_rsrc_data_rva_when_relocating() {
        use crate::resource::{Identity, Rsrc};

        let mut tree = Rsrc::new();
        let root = tree.root();
        let type_dir = tree.add_sub_entry(root, Identity::Id(3)).unwrap();
        let lang_dir = tree.add_sub_entry(type_dir, Identity::Id(1)).unwrap();
        let leaf = tree.add_sub_entry(lang_dir, Identity::Id(1033)).unwrap();
        let payload = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x13, 0x37];
        tree.set_data(leaf, payload.clone(), 0, 0).unwrap();

        let mut raw = codec::encode(&tree).expect("encode should succeed");
        let blob_start = raw
            .windows(payload.len())
            .position(|w| w == payload.as_slice())
            .expect("payload bytes should be present in the encoded blob");
        let record_offset = blob_start - 16; // DATA_ENTRY_SIZE, single data entry, no strings
        let field_at = |b: &[u8]| u32::from_le_bytes(b[record_offset..record_offset + 4].try_into().unwrap());
        assert_eq!(field_at(&raw), blob_start as u32);

        // Simulate this tree already being installed at VA 0x5000.
        codec::shift(&mut raw, 0x5000).expect("shift should succeed");
        let original_data_rva = field_at(&raw);
        assert_eq!(original_data_rva, blob_start as u32 + 0x5000);

        let headers_size = 0x1000u32;
        let bytes = minimal_headers(0x1000, 0x200, headers_size);
        let mut pe = PE::parse(&bytes, Some(headers_size)).expect("should parse");

        let mut rsrc_section = Section::new(Section::make_tag(".rsrc"), 0x5000, raw.len() as u32, raw);
        rsrc_section.characteristics = crate::section::SectionFlag::CNT_INITIALIZED_DATA.bits()
            | crate::section::SectionFlag::MEM_READ.bits();
        pe.push_section_raw(rsrc_section);
        pe.set_optional_header_u32(OH_RESOURCE_TABLE_RVA, 0x5000).unwrap();

        // Sized so the new section's end lands exactly on 0x7000, pinning
        // where `.rsrc`'s own first-fit relocation will land.
        let other = Section::new(Section::make_tag(".data"), 0, 0x6000, vec![0; 0x10]);
        pe.malloc(other, true).expect("malloc should succeed");

        let rsrc_idx = pe
            .resources_index()
            .unwrap()
            .expect(".rsrc should still be found via the rewritten ResourceTable RVA");
        let relocated = &pe.sections()[rsrc_idx];
        assert_eq!(relocated.virtual_address, 0x7000);
        assert_eq!(field_at(&relocated.raw_data), original_data_rva + 0x2000);
    }

    // Scenario 5 ("resource round trip against a real notepad.exe") is not
    // covered: this workspace has no real-world PE fixture to source it
    // from.

    #[test]
    fn write_round_trips_a_clean_layout() {
        let bytes = minimal_headers(0x1000, 0x200, 0x1000);
        let mut pe = PE::parse(&bytes, Some(0x1000)).expect("should parse");
        pe.malloc(
            Section::new(Section::make_tag(".data"), 0, 0x10, vec![0xAA; 0x10]),
            true,
        )
        .unwrap();
        let out = pe.write().expect("emit should succeed");
        let reparsed = PE::parse(&out, Some(0x1000)).expect("re-parse should succeed");
        assert_eq!(reparsed.sections().len(), 1);
        assert_eq!(reparsed.sections()[0].virtual_address, 0x1000);
        assert_eq!(reparsed.sections()[0].raw_data, vec![0xAA; 0x10]);
    }

    #[test]
    fn parse_rejects_relocations() {
        let mut bytes = minimal_headers(0x1000, 0x200, 0x1000);
        set_u16(&mut bytes, 0x80 + NT_NUMBER_OF_SECTIONS, 1);
        let oh_start = 0x80 + NT_OPTIONAL_HEADER_START;
        let section_table_start = oh_start + 0xE0;
        bytes.resize((section_table_start + SECTION_HEADER_SIZE).max(bytes.len()), 0);
        bytes[section_table_start..section_table_start + 5].copy_from_slice(b".text");
        set_u32(&mut bytes, section_table_start + SEC_VIRTUAL_SIZE, 0x10);
        set_u32(&mut bytes, section_table_start + SEC_VIRTUAL_ADDRESS, 0x1000);
        set_u16(&mut bytes, section_table_start + SEC_NUMBER_OF_RELOCATIONS, 2);
        assert!(matches!(
            PE::parse(&bytes, Some(0x1000)),
            Err(Error::RelocationsPresent { .. })
        ));
    }

    #[test]
    fn linearized_section_keeps_its_file_address_on_re_emit() {
        let nt_off = 0x80usize;
        let oh_start = nt_off + NT_OPTIONAL_HEADER_START;
        let section_table_start = oh_start + 0xE0;
        let headers_size = 0x1000u32;
        let mut buf = minimal_headers(0x1000, 0x200, headers_size);
        let payload = vec![0x42u8; 0x10];
        buf.resize((section_table_start + SECTION_HEADER_SIZE).max(buf.len()), 0);
        buf[section_table_start..section_table_start + 5].copy_from_slice(b".data");
        set_u32(&mut buf, section_table_start + SEC_VIRTUAL_SIZE, 0x10);
        set_u32(&mut buf, section_table_start + SEC_VIRTUAL_ADDRESS, 0x1000);
        set_u32(&mut buf, section_table_start + SEC_SIZE_OF_RAW_DATA, 0x10);
        // linearized: file_address == virtual_address, here both 0x1000.
        set_u32(&mut buf, section_table_start + SEC_POINTER_TO_RAW_DATA, 0x1000);
        set_u16(&mut buf, nt_off + NT_NUMBER_OF_SECTIONS, 1);

        let mut bytes = buf.clone();
        bytes.resize(0x1010, 0);
        bytes[0x1000..0x1010].copy_from_slice(&payload);

        let mut pe = PE::parse(&bytes, Some(headers_size)).expect("should parse");
        assert!(pe.sections()[0].meta_linearize);
        let out = pe.write().expect("emit should succeed");
        // A linearized section that doesn't collide with anything keeps
        // file_address == virtual_address on re-emit.
        assert_eq!(pe.sections()[0].file_address, 0x1000);
        assert_eq!(&out[0x1000..0x1010], &payload[..]);
    }

    #[test]
    fn virtual_overlap_is_rejected_at_emit() {
        let bytes = minimal_headers(0x1000, 0x200, 0x1000);
        let mut pe = PE::parse(&bytes, Some(0x1000)).expect("should parse");
        pe.sections
            .push(Section::new(Section::make_tag(".a"), 0x1000, 0x100, vec![]));
        pe.sections
            .push(Section::new(Section::make_tag(".b"), 0x1050, 0x100, vec![]));
        assert!(matches!(pe.write(), Err(Error::SectionRVAOverlap { .. })));
    }
}
