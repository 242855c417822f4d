//! A library for parsing and re-emitting PE32 images: section tables,
//! virtual/file layout, and the `.rsrc` resource tree.
//!
//! Parsing is strict: anything with a COFF symbol table, per-section
//! relocations, or line numbers is rejected rather than silently dropped,
//! since this crate edits and re-emits what it reads rather than just
//! inspecting it.

pub mod alloc_span;
pub mod byteio;
pub mod container;
mod filler;
pub mod resource;
pub mod section;

mod error;
pub use error::{Error, Result, SectionTag};

pub use container::PE;
pub use resource::{Body, Identity, NodeId, Rsrc, RsrcEntry};
pub use section::{Section, SectionFlag};
