//! Filler-section policy (C7): keep the virtual layout free of gaps so a
//! Windows 10 loader accepts the image.
//!
//! Every PE section after the last one occupies contiguous, gapless virtual
//! space on real Windows builds; this module re-derives that property after
//! arbitrary edits by dropping any filler sections left over from a previous
//! pass and synthesizing fresh ones to patch whatever gaps remain.

use crate::alloc_span::align_up;
use crate::container::PE;
use crate::error::Result;
use crate::section::{Section, SectionFlag};

/// `.flrXXXX`, four uppercase hex digits, exactly filling the 8-byte tag.
fn filler_suffix(tag: &[u8; 8]) -> Option<u16> {
    if &tag[0..4] != b".flr" {
        return None;
    }
    let hex = &tag[4..8];
    if !hex
        .iter()
        .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(b))
    {
        return None;
    }
    let s = std::str::from_utf8(hex).ok()?;
    u16::from_str_radix(s, 16).ok()
}

fn is_filler(section: &Section) -> bool {
    filler_suffix(&section.tag).is_some()
        && section.characteristics & SectionFlag::CNT_UNINITIALIZED_DATA.bits() != 0
}

pub fn fill_virtual_layout_gaps(pe: &mut PE) -> Result<()> {
    log::debug!("filling virtual layout gaps");

    pe.retain_sections(|s| !is_filler(s));
    pe.sort_sections_by_va();

    let alignment = pe.section_alignment()?;

    let mut gaps = Vec::new();
    for window in pe.sections().windows(2) {
        let prev = &window[0];
        let next = &window[1];
        let floor = align_up(prev.virtual_address + prev.virtual_size, alignment);
        if next.virtual_address > floor {
            gaps.push((floor, next.virtual_address - floor));
        }
    }

    log::debug!("found {} gap(s) to fill", gaps.len());

    for (i, (last, size)) in gaps.into_iter().enumerate() {
        let tag_str = format!(".flr{:04X}", i);
        log::trace!("filling gap at va={:#x} ({} bytes)", last, size);
        let mut filler = Section::new(Section::make_tag(&tag_str), last, size, Vec::new());
        filler.characteristics = SectionFlag::CNT_UNINITIALIZED_DATA.bits()
            | SectionFlag::MEM_READ.bits()
            | SectionFlag::MEM_WRITE.bits();
        pe.insert_section_at(filler, last);
    }

    pe.sort_sections_by_va();
    Ok(())
}
