//! One PE section (C3).

use std::borrow::Cow;
use strum::EnumIter;
use strum::IntoEnumIterator;

/// Standard PE section-characteristics bitfield. The crate stores and emits
/// the raw 32-bit value verbatim; this enum only exists to decompose it for
/// display, mirroring the teacher's `Characteristics::get_characteristics`
/// (`parser/utils.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
#[allow(non_camel_case_types)]
pub enum SectionFlag {
    CNT_CODE,
    CNT_INITIALIZED_DATA,
    CNT_UNINITIALIZED_DATA,
    MEM_DISCARDABLE,
    MEM_NOT_CACHED,
    MEM_NOT_PAGED,
    MEM_SHARED,
    MEM_EXECUTE,
    MEM_READ,
    MEM_WRITE,
}

impl SectionFlag {
    pub const fn bits(self) -> u32 {
        match self {
            SectionFlag::CNT_CODE => 0x0000_0020,
            SectionFlag::CNT_INITIALIZED_DATA => 0x0000_0040,
            SectionFlag::CNT_UNINITIALIZED_DATA => 0x0000_0080,
            SectionFlag::MEM_DISCARDABLE => 0x0200_0000,
            SectionFlag::MEM_NOT_CACHED => 0x0400_0000,
            SectionFlag::MEM_NOT_PAGED => 0x0800_0000,
            SectionFlag::MEM_SHARED => 0x1000_0000,
            SectionFlag::MEM_EXECUTE => 0x2000_0000,
            SectionFlag::MEM_READ => 0x4000_0000,
            SectionFlag::MEM_WRITE => 0x8000_0000,
        }
    }

    /// Decompose a raw `characteristics` value into the flags it sets.
    pub fn decompose(value: u32) -> Vec<SectionFlag> {
        SectionFlag::iter().filter(|f| value & f.bits() != 0).collect()
    }
}

/// One PE section: tag, RVA, virtual size, raw bytes, file offset, flags,
/// linearization hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Fixed 8-byte identifier, raw bytes (trailing NULs preserved exactly).
    pub tag: [u8; 8],

    /// RVA.
    pub virtual_address: u32,

    /// Virtual size.
    pub virtual_size: u32,

    /// On-file bytes; length is the section's on-file size. May be empty
    /// for `CNT_UNINITIALIZED_DATA` sections.
    pub raw_data: Vec<u8>,

    /// Assigned by the container during emit; callers must not set this
    /// themselves (it's recomputed by the allocation pass every time).
    pub file_address: u32,

    /// Raw PE section-characteristics bitfield, stored and emitted verbatim.
    pub characteristics: u32,

    /// Set on parse when the source had `file_address == virtual_address`;
    /// requests linearized placement on the next emit.
    pub meta_linearize: bool,
}

impl Section {
    pub fn new(tag: [u8; 8], virtual_address: u32, virtual_size: u32, raw_data: Vec<u8>) -> Self {
        Section {
            tag,
            virtual_address,
            virtual_size,
            raw_data,
            file_address: 0,
            characteristics: 0,
            meta_linearize: false,
        }
    }

    /// `[VA, VA+VS)` as an exclusive range, for overlap checks.
    pub fn virtual_range(&self) -> std::ops::Range<u64> {
        self.virtual_address as u64..(self.virtual_address as u64 + self.virtual_size as u64)
    }

    /// The raw tag decoded as Windows-1252 for display. Never affects what
    /// gets parsed or re-emitted — `tag` stays the source of truth.
    pub fn tag_display(&self) -> Cow<'_, str> {
        let (text, _, _) = encoding_rs::WINDOWS_1252.decode(&self.tag);
        match text {
            Cow::Borrowed(s) => Cow::Borrowed(s),
            Cow::Owned(s) => Cow::Owned(s),
        }
    }

    pub fn characteristics_flags(&self) -> Vec<SectionFlag> {
        SectionFlag::decompose(self.characteristics)
    }

    /// Build a raw 8-byte tag from a str, NUL-padding (or truncating) to 8 bytes.
    pub fn make_tag(name: &str) -> [u8; 8] {
        let mut tag = [0u8; 8];
        let bytes = name.as_bytes();
        let n = bytes.len().min(8);
        tag[..n].copy_from_slice(&bytes[..n]);
        tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_display_trims_trailing_nuls() {
        let s = Section::new(Section::make_tag(".text"), 0x1000, 0x100, vec![]);
        assert_eq!(s.tag_display().trim_end_matches('\0'), ".text");
        assert_eq!(s.tag, [b'.', b't', b'e', b'x', b't', 0, 0, 0]);
    }

    #[test]
    fn characteristics_decompose_round_trips_known_bits() {
        let mut s = Section::new(Section::make_tag(".text"), 0, 0, vec![]);
        s.characteristics = SectionFlag::CNT_CODE.bits()
            | SectionFlag::MEM_EXECUTE.bits()
            | SectionFlag::MEM_READ.bits();
        let flags = s.characteristics_flags();
        assert!(flags.contains(&SectionFlag::CNT_CODE));
        assert!(flags.contains(&SectionFlag::MEM_EXECUTE));
        assert!(flags.contains(&SectionFlag::MEM_READ));
        assert!(!flags.contains(&SectionFlag::MEM_WRITE));
    }

    #[test]
    fn virtual_range_is_half_open() {
        let s = Section::new(Section::make_tag(".data"), 0x2000, 0x50, vec![]);
        let r = s.virtual_range();
        assert_eq!(r.start, 0x2000);
        assert_eq!(r.end, 0x2050);
    }
}
