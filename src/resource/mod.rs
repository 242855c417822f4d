//! Resources: the `.rsrc` tree model (C5) and its wire codec (C6).

pub mod codec;
mod entry;

pub use entry::{Body, Identity, NodeId, Rsrc, RsrcEntry};
