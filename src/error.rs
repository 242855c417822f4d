//! Crate-wide error type.
//!
//! One variant per diagnostic named in the design, each carrying whatever
//! context (offset, tag, path) makes the failure locatable. No `thiserror`:
//! the pack's own PE/ELF readers hand-roll `Display`/`std::error::Error`,
//! and a dozen variants does not need a derive macro to stay readable.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Input shorter than `expected_headers_size`, or missing the `"PE\0\0"` signature.
    NotAPE,

    /// `PointerToSymbolTable` is non-zero.
    SymbolTablePresent,

    /// `SizeOfOptionalHeader` is less than `0x78`.
    OptionalHeaderTooSmall { found: u16 },

    /// Optional header magic is not `0x010B` (PE32).
    UnsupportedOptionalMagic { found: u16 },

    /// `SizeOfHeaders` does not match `expected_headers_size`.
    HeadersSizeMismatch { expected: u32, found: u32 },

    /// A section header declares relocations.
    RelocationsPresent { tag: SectionTag },

    /// A section header declares COFF line numbers.
    LineNumbersPresent { tag: SectionTag },

    /// Two sections' `[VA, VA+VS)` ranges overlap, at parse or at emit time.
    SectionRVAOverlap { first: SectionTag, second: SectionTag },

    /// A resource entry has neither children nor data, or a directory back-reference
    /// was never patched during encode.
    ResourceShapeInvalid { detail: &'static str },

    /// A `Rsrc` handle was requested from a `PE` with no `.rsrc` section.
    ResourceMissing,

    /// `path_lookup` walked off the end of the tree.
    PathNotFound { path: String },

    /// `path_lookup` tried to descend through a data (non-directory) entry.
    PathNotADirectory { path: String },

    /// Read past the end of a buffer while decoding a fixed-size field.
    TruncatedInput { needed: usize, available: usize },
}

/// An 8-byte section tag, kept raw for error messages (trailing NULs and all).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionTag(pub [u8; 8]);

impl fmt::Display for SectionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (cow, _, _) = encoding_rs::WINDOWS_1252.decode(&self.0);
        write!(f, "{}", cow.trim_end_matches('\0'))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotAPE => write!(f, "not a PE image: missing or truncated MZ/PE signature"),
            Error::SymbolTablePresent => {
                write!(f, "COFF symbol table present; refusing to touch this file")
            }
            Error::OptionalHeaderTooSmall { found } => write!(
                f,
                "optional header too small: {:#x} bytes, need at least 0x78",
                found
            ),
            Error::UnsupportedOptionalMagic { found } => write!(
                f,
                "unsupported optional header magic {:#06x}, only PE32 (0x010b) is supported",
                found
            ),
            Error::HeadersSizeMismatch { expected, found } => write!(
                f,
                "SizeOfHeaders mismatch: expected {:#x}, found {:#x}",
                expected, found
            ),
            Error::RelocationsPresent { tag } => {
                write!(f, "section {} has relocations", tag)
            }
            Error::LineNumbersPresent { tag } => {
                write!(f, "section {} has COFF line numbers", tag)
            }
            Error::SectionRVAOverlap { first, second } => write!(
                f,
                "sections {} and {} overlap in virtual address space",
                first, second
            ),
            Error::ResourceShapeInvalid { detail } => {
                write!(f, "invalid resource tree shape: {}", detail)
            }
            Error::ResourceMissing => write!(f, "this PE has no .rsrc section"),
            Error::PathNotFound { path } => write!(f, "resource path not found: {}", path),
            Error::PathNotADirectory { path } => write!(
                f,
                "resource path segment is not a directory: {}",
                path
            ),
            Error::TruncatedInput { needed, available } => write!(
                f,
                "truncated input: needed {} bytes, {} available",
                needed, available
            ),
        }
    }
}

impl std::error::Error for Error {}
