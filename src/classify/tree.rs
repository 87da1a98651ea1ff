//! Arena of classified nodes for one subtree.
//!
//! Nodes are stored in walk order (parents before children) and refer to each
//! other by index, so every later pass is a plain loop over the vector.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{is_container_path, Classification, DirShape, PathClassifier};
use crate::common::{Entry, EntryKind};
use crate::error::ClassificationError;

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub entry: Entry,
    /// Symlink-resolved path, used to refuse entering the same directory twice.
    pub canonical: PathBuf,
    pub classification: Classification,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub depth: usize,
    pub shape: DirShape,
    /// A symbolic link to a directory outside the scanned root. Never descended.
    pub escapes: bool,
}

#[derive(Debug)]
pub struct ClassifiedTree {
    nodes: Vec<TreeNode>,
    issues: Vec<ClassificationError>,
}

impl ClassifiedTree {
    /// Walks `root` (following symbolic links that stay inside it) and labels
    /// every node.
    ///
    /// Unreadable entries below the root are recorded in [`issues`](Self::issues)
    /// and labelled [`Classification::Unknown`]; only a missing root fails.
    /// Directory links resolving outside `root` become childless nodes with
    /// [`escapes`](TreeNode::escapes) set.
    pub fn scan(root: &Path, classifier: &PathClassifier) -> Result<Self, ClassificationError> {
        let root_canonical =
            fs::canonicalize(root).map_err(|e| ClassificationError::from_io(root, e))?;

        let mut nodes: Vec<TreeNode> = Vec::new();
        let mut issues = Vec::new();
        let mut index: HashMap<PathBuf, NodeId> = HashMap::new();
        let mut unreadable: HashSet<NodeId> = HashSet::new();

        let mut walker = WalkDir::new(root).follow_links(true).sort_by_file_name().into_iter();
        while let Some(item) = walker.next() {
            let mut escapes = false;
            let (path, depth, entry, canonical) = match item {
                Ok(dent) => {
                    let path = dent.path().to_path_buf();
                    let meta = match dent.metadata() {
                        Ok(meta) => meta,
                        Err(e) => {
                            issues.push(walk_issue(&path, e.into_io_error()));
                            continue;
                        }
                    };
                    let entry = Entry::from_metadata(path.clone(), &meta);
                    let canonical = if dent.depth() == 0 {
                        root_canonical.clone()
                    } else if dent.path_is_symlink() {
                        let target = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
                        if meta.is_dir() && !target.starts_with(&root_canonical) {
                            debug!(path = %path.display(), target = %target.display(), "link leaves the root");
                            walker.skip_current_dir();
                            escapes = true;
                        }
                        target
                    } else {
                        let parent = path.parent().and_then(|p| index.get(p));
                        match (parent, path.file_name()) {
                            (Some(&pid), Some(name)) => nodes[pid].canonical.join(name),
                            _ => path.clone(),
                        }
                    };
                    (path, dent.depth(), entry, canonical)
                }
                Err(err) => {
                    let Some(path) = err.path().map(Path::to_path_buf) else {
                        issues.push(walk_issue(root, err.into_io_error()));
                        continue;
                    };
                    if let Some(ancestor) = err.loop_ancestor() {
                        // Keep the link as a childless directory whose canonical
                        // path is the ancestor it points back to.
                        debug!(path = %path.display(), "symbolic link loop");
                        let canonical = fs::canonicalize(ancestor)
                            .unwrap_or_else(|_| ancestor.to_path_buf());
                        let entry = Entry {
                            path: path.clone(),
                            kind: EntryKind::Directory,
                            size: 0,
                            modified_time: 0,
                        };
                        (path, err.depth(), entry, canonical)
                    } else {
                        let depth = err.depth();
                        let io_err = err.into_io_error();
                        if depth == 0 && nodes.is_empty() {
                            return Err(walk_issue(&path, io_err));
                        }
                        if let Some(&id) = index.get(&path) {
                            unreadable.insert(id);
                        }
                        warn!(path = %path.display(), "unreadable entry excluded from the plan");
                        issues.push(walk_issue(&path, io_err));
                        continue;
                    }
                }
            };

            let parent = if depth == 0 {
                None
            } else {
                match path.parent().and_then(|p| index.get(p)) {
                    Some(&pid) => Some(pid),
                    // Parent was dropped as unreadable.
                    None => continue,
                }
            };

            let id = nodes.len();
            if entry.is_dir() {
                index.insert(path, id);
            }
            if let Some(pid) = parent {
                nodes[pid].children.push(id);
            }
            nodes.push(TreeNode {
                entry,
                canonical,
                classification: Classification::Unknown,
                parent,
                children: Vec::new(),
                depth,
                shape: DirShape::default(),
                escapes,
            });
        }

        if nodes.is_empty() {
            return Err(ClassificationError::Vanished {
                path: root.to_path_buf(),
            });
        }

        // Children always come after their parent, so a reverse pass sees every
        // subtree complete before its parent.
        for id in (0..nodes.len()).rev() {
            let node = &nodes[id];
            let (is_file, container, files_below) = (
                node.entry.is_file(),
                is_container_path(&node.entry.path),
                node.shape.descendant_files,
            );
            let is_dir = node.entry.is_dir();
            if let Some(pid) = node.parent {
                let shape = &mut nodes[pid].shape;
                if is_file {
                    shape.files += 1;
                    shape.descendant_files += 1;
                    if container {
                        shape.containers += 1;
                    }
                } else if is_dir {
                    shape.dirs += 1;
                    shape.descendant_files += files_below;
                }
            }
        }

        for (id, node) in nodes.iter_mut().enumerate() {
            node.classification = match node.entry.kind {
                _ if unreadable.contains(&id) => Classification::Unknown,
                EntryKind::File => Classification::SingleFile {
                    container: is_container_path(&node.entry.path),
                },
                EntryKind::Directory => classifier.classify_dir(&node.entry.path, &node.shape),
                EntryKind::Other => Classification::Unknown,
            };
        }

        debug!(root = %root.display(), nodes = nodes.len(), "classified subtree");
        Ok(Self { nodes, issues })
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &TreeNode)> {
        self.nodes.iter().enumerate()
    }

    /// Deepest node depth; the root is depth 0.
    pub fn max_depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    pub fn issues(&self) -> &[ClassificationError] {
        &self.issues
    }

    pub fn into_issues(self) -> Vec<ClassificationError> {
        self.issues
    }

    /// Immediate children of `id`, in name order.
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = (NodeId, &TreeNode)> {
        self.nodes[id].children.iter().map(|&c| (c, &self.nodes[c]))
    }

    /// Every file below `id`, sorted by path.
    pub fn files_under(&self, id: NodeId) -> Vec<Entry> {
        let mut files = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = &self.nodes[current];
            if node.entry.is_file() {
                files.push(node.entry.clone());
            }
            stack.extend(node.children.iter().copied());
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }
}

fn walk_issue(path: &Path, err: Option<io::Error>) -> ClassificationError {
    match err {
        Some(source) => ClassificationError::from_io(path, source),
        None => ClassificationError::Vanished {
            path: path.to_path_buf(),
        },
    }
}
