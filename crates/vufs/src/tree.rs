//! The in-memory file tree.
//!
//! One node per real path under the export root. Nodes are kept in an
//! arena keyed by [`NodeId`]; parent and child links are ids, so the
//! parent/child cycle of the on-disk hierarchy never becomes an ownership
//! cycle. Children are kept sorted by name, which is also the order
//! directory reads enumerate them in.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use tokio::fs;

use crate::fcall::{dm, Qid, QidType, Stat};
use crate::ownership;
use crate::utils::Result;

/// Handle to a node in the tree arena.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

/// A file-tree entry, unique per real path across the server.
#[derive(Debug)]
pub struct Node {
    /// Protocol identity.
    pub qid: Qid,
    /// Permission bits plus DMDIR and friends.
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    /// Last element of the path; `/` for the root.
    pub name: String,
    /// Virtual owner.
    pub uid: String,
    /// Virtual group.
    pub gid: String,
    /// Virtual last modifier. Not persisted; lost on restart.
    pub muid: String,
    /// Parent node; the root is its own parent.
    pub parent: NodeId,
    /// Child name to child node, sorted by name. Empty for files.
    pub children: BTreeMap<String, NodeId>,
    /// Absolute path on the underlying filesystem.
    pub ospath: PathBuf,
    /// Host handle shared by every open fid on this node.
    pub handle: Option<fs::File>,
    /// Number of open fids pointing here.
    pub refcnt: u32,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        self.mode & dm::DIR != 0
    }

    /// The directory entry for this node.
    pub fn stat(&self) -> Stat {
        Stat {
            typ: 0,
            dev: 0,
            qid: self.qid,
            mode: self.mode,
            atime: self.atime,
            mtime: self.mtime,
            length: self.length,
            name: self.name.clone(),
            uid: self.uid.clone(),
            gid: self.gid.clone(),
            muid: self.muid.clone(),
        }
    }
}

/// The server-wide tree mirroring the exported subtree.
#[derive(Debug)]
pub struct Tree {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    next: u64,
}

impl Tree {
    /// Walk the export root and build a node per directory entry.
    ///
    /// The root's mode is forced to 0777; restricting access to the
    /// export is the operator's job at the process level.
    pub async fn load(root_path: impl Into<PathBuf>) -> Result<Tree> {
        let root_path = root_path.into();
        let meta = fs::metadata(&root_path).await?;
        let (uid, gid) = ownership::read_ownership(&root_path).await?;

        let mut tree = Tree {
            nodes: HashMap::new(),
            root: NodeId(0),
            next: 0,
        };

        let root = tree.next_id();
        tree.nodes.insert(
            root,
            Node {
                qid: Qid {
                    typ: QidType::DIR,
                    version: mtime_millis(&meta),
                    path: meta.ino(),
                },
                mode: dm::DIR | 0o777,
                atime: meta.atime() as u32,
                mtime: meta.mtime() as u32,
                length: 0,
                name: "/".to_owned(),
                muid: uid.clone(),
                uid,
                gid,
                parent: root,
                children: BTreeMap::new(),
                ospath: root_path.clone(),
                handle: None,
                refcnt: 0,
            },
        );
        tree.root = root;

        let mut pending = vec![(root, root_path)];
        while let Some((dir_id, dir_path)) = pending.pop() {
            let mut entries = fs::read_dir(&dir_path).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = match entry.file_name().into_string() {
                    Ok(name) => name,
                    Err(_) => continue,
                };
                let path = entry.path();
                let meta = entry.metadata().await?;
                let (uid, gid) = ownership::read_ownership(&path).await?;

                let is_dir = meta.is_dir();
                let id = tree.next_id();
                tree.nodes.insert(
                    id,
                    Node {
                        qid: Qid {
                            typ: QidType::from(meta.file_type()),
                            version: mtime_millis(&meta),
                            path: meta.ino(),
                        },
                        mode: (meta.mode() & 0o777) | if is_dir { dm::DIR } else { 0 },
                        atime: meta.atime() as u32,
                        mtime: meta.mtime() as u32,
                        length: if is_dir { 0 } else { meta.len() },
                        name: name.clone(),
                        muid: uid.clone(),
                        uid,
                        gid,
                        parent: dir_id,
                        children: BTreeMap::new(),
                        ospath: path.clone(),
                        handle: None,
                        refcnt: 0,
                    },
                );
                insert_child(&mut tree, dir_id, name, id);

                if is_dir {
                    pending.push((id, path));
                }
            }
        }

        Ok(tree)
    }

    fn next_id(&mut self) -> NodeId {
        let id = NodeId(self.next);
        self.next += 1;
        id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Find a child of `dir` by name.
    pub fn lookup(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        self.get(dir)?.children.get(name).copied()
    }

    /// Add a freshly created node under its parent.
    pub fn attach(&mut self, node: Node) -> NodeId {
        let parent = node.parent;
        let name = node.name.clone();
        let id = self.next_id();
        self.nodes.insert(id, node);
        insert_child(self, parent, name, id);
        id
    }

    /// Detach a node from its parent and drop it from the arena,
    /// returning it so the caller can release host resources.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        if id != self.root {
            if let Some(parent) = self.nodes.get_mut(&node.parent) {
                parent.children.remove(&node.name);
            }
        }
        Some(node)
    }

    /// Move a node to a new name within the same directory.
    pub fn rename(&mut self, id: NodeId, newname: &str, newpath: PathBuf) {
        let (parent, oldname) = match self.nodes.get(&id) {
            Some(node) => (node.parent, node.name.clone()),
            None => return,
        };
        if let Some(parent) = self.nodes.get_mut(&parent) {
            parent.children.remove(&oldname);
            parent.children.insert(newname.to_owned(), id);
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.name = newname.to_owned();
            node.ospath = newpath;
        }
    }
}

#[cfg(test)]
impl Tree {
    pub(crate) fn empty_for_tests() -> Tree {
        Tree {
            nodes: HashMap::new(),
            root: NodeId(0),
            next: 0,
        }
    }
}

fn insert_child(tree: &mut Tree, parent: NodeId, name: String, child: NodeId) {
    if let Some(dir) = tree.nodes.get_mut(&parent) {
        dir.children.insert(name, child);
    }
}

/// Millisecond-resolution modification stamp used as the qid version.
fn mtime_millis(meta: &std::fs::Metadata) -> u32 {
    (meta.mtime() * 1000 + meta.mtime_nsec() / 1_000_000) as u32
}
