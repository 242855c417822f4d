//! The resource tree (C5): an arena-indexed tree of directory/data entries.
//! A parent-owns-child layout with optional slots would force either
//! `Rc<RefCell<_>>` or unsafe back-pointers in Rust, so entries live in a
//! flat `Vec<Node>` addressed by `NodeId` handles, with `parent:
//! Option<NodeId>` for upward walks (`path`, `get_entry_from_path`).

use crate::error::{Error, Result};

/// Opaque handle into a [`Rsrc`] arena. Only meaningful against the tree
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// A resource entry's name, either a UTF-16 string or a 32-bit numeric ID.
/// Modeled as a tagged sum instead of an optional-name/optional-id pair,
/// since a real resource entry is always exactly one or the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Name(String),
    Id(u32),
}

/// An entry's payload: either more children, or a data blob. A tagged sum
/// in place of a nullable both-slots shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Directory {
        children: Vec<NodeId>,
        characteristics: u32,
        timestamp: u32,
        version_major: u16,
        version_minor: u16,
    },
    Data {
        bytes: Vec<u8>,
        codepage: u32,
        reserved: u32,
    },
}

#[derive(Debug, Clone)]
struct Node {
    identity: Option<Identity>,
    body: Body,
    parent: Option<NodeId>,
}

/// The `.rsrc` resource tree: a root directory plus everything under it.
#[derive(Debug, Clone)]
pub struct Rsrc {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Default for Rsrc {
    fn default() -> Self {
        Rsrc::new()
    }
}

impl Rsrc {
    pub fn new() -> Self {
        let root = Node {
            identity: None,
            body: Body::Directory {
                children: Vec::new(),
                characteristics: 0,
                timestamp: 0,
                version_major: 0,
                version_minor: 0,
            },
            parent: None,
        };
        Rsrc {
            nodes: vec![root],
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub(crate) fn push_node(&mut self, identity: Option<Identity>, body: Body, parent: Option<NodeId>) -> NodeId {
        self.nodes.push(Node {
            identity,
            body,
            parent,
        });
        NodeId(self.nodes.len() - 1)
    }

    pub(crate) fn set_children(&mut self, id: NodeId, children: Vec<NodeId>) {
        if let Body::Directory { children: c, .. } = &mut self.node_mut(id).body {
            *c = children;
        }
    }

    pub(crate) fn set_root(&mut self, id: NodeId) {
        self.root = id;
    }

    pub(crate) fn set_identity(&mut self, id: NodeId, identity: Identity) {
        self.node_mut(id).identity = Some(identity);
    }

    /// An arena with no nodes yet; used by the decoder, which only learns
    /// the root's final `NodeId` once the whole tree has been built.
    pub(crate) fn empty() -> Self {
        Rsrc {
            nodes: Vec::new(),
            root: NodeId(0),
        }
    }

    pub fn is_directory(&self, id: NodeId) -> bool {
        matches!(self.node(id).body, Body::Directory { .. })
    }

    pub fn identity(&self, id: NodeId) -> Option<&Identity> {
        self.node(id).identity.as_ref()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub(crate) fn body(&self, id: NodeId) -> &Body {
        &self.node(id).body
    }

    /// The children of a directory entry, in insertion order.
    pub fn children(&self, id: NodeId) -> Result<&[NodeId]> {
        match &self.node(id).body {
            Body::Directory { children, .. } => Ok(children),
            Body::Data { .. } => Err(Error::ResourceShapeInvalid {
                detail: "a data entry has no children",
            }),
        }
    }

    /// `(characteristics, timestamp, version_major, version_minor)` for a
    /// directory entry.
    pub fn directory_meta(&self, id: NodeId) -> Result<(u32, u32, u16, u16)> {
        match &self.node(id).body {
            Body::Directory {
                characteristics,
                timestamp,
                version_major,
                version_minor,
                ..
            } => Ok((*characteristics, *timestamp, *version_major, *version_minor)),
            Body::Data { .. } => Err(Error::ResourceShapeInvalid {
                detail: "a data entry has no directory metadata",
            }),
        }
    }

    /// The raw bytes of a data entry.
    pub fn data(&self, id: NodeId) -> Result<&[u8]> {
        match &self.node(id).body {
            Body::Data { bytes, .. } => Ok(bytes),
            Body::Directory { .. } => Err(Error::ResourceShapeInvalid {
                detail: "a directory entry has no data",
            }),
        }
    }

    pub fn get_sub_entry_by_name(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.children(parent).ok()?.iter().copied().find(|&c| {
            matches!(self.identity(c), Some(Identity::Name(n)) if n == name)
        })
    }

    pub fn get_sub_entry_by_id(&self, parent: NodeId, id: u32) -> Option<NodeId> {
        self.children(parent).ok()?.iter().copied().find(|&c| {
            matches!(self.identity(c), Some(Identity::Id(v)) if *v == id)
        })
    }

    pub fn has_sub_entry_by_name(&self, parent: NodeId, name: &str) -> bool {
        self.get_sub_entry_by_name(parent, name).is_some()
    }

    pub fn has_sub_entry_by_id(&self, parent: NodeId, id: u32) -> bool {
        self.get_sub_entry_by_id(parent, id).is_some()
    }

    /// Append a new, empty directory entry as a child of `parent`.
    /// Use [`Rsrc::set_data`] to turn it into a leaf.
    pub fn add_sub_entry(&mut self, parent: NodeId, identity: Identity) -> Result<NodeId> {
        if !self.is_directory(parent) {
            return Err(Error::ResourceShapeInvalid {
                detail: "cannot add a child to a data entry",
            });
        }
        let child = self.push_node(
            Some(identity),
            Body::Directory {
                children: Vec::new(),
                characteristics: 0,
                timestamp: 0,
                version_major: 0,
                version_minor: 0,
            },
            Some(parent),
        );
        if let Body::Directory { children, .. } = &mut self.node_mut(parent).body {
            children.push(child);
        }
        Ok(child)
    }

    /// Turn `id` into a data leaf, replacing whatever body it had. Errors if
    /// it is currently a non-empty directory — an entry is either a
    /// directory or data, never both.
    pub fn set_data(&mut self, id: NodeId, bytes: Vec<u8>, codepage: u32, reserved: u32) -> Result<()> {
        if let Body::Directory { children, .. } = &self.node(id).body {
            if !children.is_empty() {
                return Err(Error::ResourceShapeInvalid {
                    detail: "cannot turn a non-empty directory into a data entry",
                });
            }
        }
        self.node_mut(id).body = Body::Data {
            bytes,
            codepage,
            reserved,
        };
        Ok(())
    }

    /// Slash-separated path from the root, using names where present and
    /// decimal IDs otherwise.
    pub fn path(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            if c.0 == self.root.0 {
                break;
            }
            match self.identity(c) {
                Some(Identity::Name(s)) => parts.push(s.clone()),
                Some(Identity::Id(v)) => parts.push(v.to_string()),
                None => {}
            }
            cur = self.parent(c);
        }
        parts.reverse();
        parts.join("/")
    }

    /// Resolve a `/`-separated path from the root. Each segment is tried as
    /// a name first, then as a numeric ID.
    pub fn get_entry_from_path(&self, path: &str) -> Result<NodeId> {
        let mut current = self.root;
        if path.is_empty() {
            return Ok(current);
        }
        for seg in path.split('/') {
            if !self.is_directory(current) {
                return Err(Error::PathNotADirectory {
                    path: path.to_string(),
                });
            }
            let next = self.get_sub_entry_by_name(current, seg).or_else(|| {
                seg.parse::<u32>()
                    .ok()
                    .and_then(|id| self.get_sub_entry_by_id(current, id))
            });
            current = next.ok_or_else(|| Error::PathNotFound {
                path: path.to_string(),
            })?;
        }
        Ok(current)
    }
}

/// A `(tree, node)` handle pairing, exposing a dot-call surface
/// (`RsrcEntry.is_directory`, `.path`, `.get_sub_entry_by_id(...)`) instead
/// of making every caller thread a bare [`NodeId`] through free functions on
/// [`Rsrc`]. Read-only: mutation (`add_sub_entry`, `set_data`) stays on
/// `Rsrc` itself, since a handle that can mutate through a shared reference
/// would need `RefCell` — the same trade-off DESIGN.md already declines for
/// the PE/Rsrc back-reference.
#[derive(Clone, Copy)]
pub struct RsrcEntry<'a> {
    tree: &'a Rsrc,
    id: NodeId,
}

impl<'a> RsrcEntry<'a> {
    pub fn id(self) -> NodeId {
        self.id
    }

    pub fn is_directory(self) -> bool {
        self.tree.is_directory(self.id)
    }

    pub fn identity(self) -> Option<&'a Identity> {
        self.tree.identity(self.id)
    }

    pub fn parent(self) -> Option<RsrcEntry<'a>> {
        self.tree.parent(self.id).map(|p| self.tree.entry(p))
    }

    pub fn children(self) -> Result<Vec<RsrcEntry<'a>>> {
        Ok(self
            .tree
            .children(self.id)?
            .iter()
            .map(|&c| self.tree.entry(c))
            .collect())
    }

    pub fn directory_meta(self) -> Result<(u32, u32, u16, u16)> {
        self.tree.directory_meta(self.id)
    }

    pub fn data(self) -> Result<&'a [u8]> {
        self.tree.data(self.id)
    }

    pub fn get_sub_entry_by_name(self, name: &str) -> Option<RsrcEntry<'a>> {
        self.tree.get_sub_entry_by_name(self.id, name).map(|c| self.tree.entry(c))
    }

    pub fn get_sub_entry_by_id(self, id: u32) -> Option<RsrcEntry<'a>> {
        self.tree.get_sub_entry_by_id(self.id, id).map(|c| self.tree.entry(c))
    }

    pub fn has_sub_entry_by_name(self, name: &str) -> bool {
        self.tree.has_sub_entry_by_name(self.id, name)
    }

    pub fn has_sub_entry_by_id(self, id: u32) -> bool {
        self.tree.has_sub_entry_by_id(self.id, id)
    }

    pub fn path(self) -> String {
        self.tree.path(self.id)
    }
}

impl Rsrc {
    /// Wrap `id` as a [`RsrcEntry`] handle against this tree.
    pub fn entry(&self, id: NodeId) -> RsrcEntry<'_> {
        RsrcEntry { tree: self, id }
    }

    /// The root directory, as a handle.
    pub fn root_entry(&self) -> RsrcEntry<'_> {
        self.entry(self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tree_has_an_empty_root_directory() {
        let tree = Rsrc::new();
        assert!(tree.is_directory(tree.root()));
        assert_eq!(tree.children(tree.root()).unwrap().len(), 0);
    }

    #[test]
    fn add_and_look_up_by_name_and_id() {
        let mut tree = Rsrc::new();
        let root = tree.root();
        let icon_type = tree
            .add_sub_entry(root, Identity::Id(3))
            .expect("add should succeed");
        let named = tree
            .add_sub_entry(root, Identity::Name("APP".to_string()))
            .expect("add should succeed");

        assert_eq!(tree.get_sub_entry_by_id(root, 3), Some(icon_type));
        assert_eq!(tree.get_sub_entry_by_name(root, "APP"), Some(named));
        assert!(!tree.has_sub_entry_by_id(root, 99));
    }

    #[test]
    fn set_data_on_empty_directory_converts_it_to_a_leaf() {
        let mut tree = Rsrc::new();
        let root = tree.root();
        let entry = tree.add_sub_entry(root, Identity::Id(1)).unwrap();
        tree.set_data(entry, vec![1, 2, 3], 0, 0).unwrap();
        assert!(!tree.is_directory(entry));
        assert_eq!(tree.data(entry).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn set_data_on_nonempty_directory_is_rejected() {
        let mut tree = Rsrc::new();
        let root = tree.root();
        let dir = tree.add_sub_entry(root, Identity::Id(1)).unwrap();
        tree.add_sub_entry(dir, Identity::Id(2)).unwrap();
        assert!(tree.set_data(dir, vec![], 0, 0).is_err());
    }

    #[test]
    fn path_and_get_entry_from_path_round_trip() {
        let mut tree = Rsrc::new();
        let root = tree.root();
        let icon_type = tree.add_sub_entry(root, Identity::Id(3)).unwrap();
        let name = tree
            .add_sub_entry(icon_type, Identity::Name("MAINICON".to_string()))
            .unwrap();
        let lang = tree.add_sub_entry(name, Identity::Id(1033)).unwrap();
        tree.set_data(lang, vec![0xDE, 0xAD], 0, 0).unwrap();

        assert_eq!(tree.path(lang), "3/MAINICON/1033");
        assert_eq!(tree.get_entry_from_path("3/MAINICON/1033").unwrap(), lang);
        assert!(tree.get_entry_from_path("3/NOPE/1033").is_err());
    }

    #[test]
    fn rsrc_entry_handle_mirrors_the_free_function_api() {
        let mut tree = Rsrc::new();
        let root = tree.root();
        let icon_type = tree.add_sub_entry(root, Identity::Id(3)).unwrap();
        let name = tree
            .add_sub_entry(icon_type, Identity::Name("MAINICON".to_string()))
            .unwrap();
        tree.set_data(name, vec![9, 9], 0, 0).unwrap();

        let root_entry = tree.root_entry();
        assert!(root_entry.is_directory());
        let icon_entry = root_entry.get_sub_entry_by_id(3).expect("icon type");
        assert_eq!(icon_entry.id(), icon_type);
        let name_entry = icon_entry
            .get_sub_entry_by_name("MAINICON")
            .expect("name entry");
        assert!(!name_entry.is_directory());
        assert_eq!(name_entry.data().unwrap(), &[9, 9]);
        assert_eq!(name_entry.path(), "3/MAINICON");
        assert_eq!(name_entry.parent().unwrap().id(), icon_type);
    }

    #[test]
    fn path_through_a_data_entry_fails() {
        let mut tree = Rsrc::new();
        let root = tree.root();
        let leaf = tree.add_sub_entry(root, Identity::Id(1)).unwrap();
        tree.set_data(leaf, vec![], 0, 0).unwrap();
        assert!(matches!(
            tree.get_entry_from_path("1/2"),
            Err(Error::PathNotADirectory { .. })
        ));
    }
}
