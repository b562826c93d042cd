//! File tree model for repository snapshots.
//!
//! The tree is an ordered nested structure built from the flat path list
//! the hosting provider returns. It serializes to the wire shape used by
//! `/parse-repo` and round-trips losslessly: paths and entry types are
//! preserved exactly.

use serde::{Deserialize, Serialize};

/// Entry type in the repository tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file (git blob).
    File,
    /// Directory (git tree).
    Dir,
}

/// A node in the nested file tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Final path segment.
    pub name: String,
    /// Full path from the repository root.
    pub path: String,
    /// Entry type.
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Child nodes (directories only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
    /// Whether deeper entries under this directory were elided by the
    /// node cap.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub elided: bool,
}

impl TreeNode {
    fn new(name: String, path: String, kind: EntryKind) -> Self {
        Self {
            name,
            path,
            kind,
            children: Vec::new(),
            elided: false,
        }
    }

    /// Number of files in this subtree.
    fn file_count(&self) -> usize {
        match self.kind {
            EntryKind::File => 1,
            EntryKind::Dir => self.children.iter().map(TreeNode::file_count).sum(),
        }
    }
}

/// An ordered nested file tree with truncation bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTree {
    /// Top-level entries.
    pub roots: Vec<TreeNode>,
    /// Number of entries in the original flat listing.
    pub total_entries: usize,
    /// Whether the node cap elided deeper entries.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl FileTree {
    /// Build a tree from a flat `(path, kind)` listing.
    ///
    /// When the listing exceeds `max_entries`, entries below the deepest
    /// depth that still fits are elided and the surviving ancestor
    /// directories are marked, so rendering shows a truncation marker.
    pub fn from_flat(entries: &[(String, EntryKind)], max_entries: usize) -> Self {
        let total = entries.len();
        let depth_limit = if total > max_entries && max_entries > 0 {
            deepest_fitting_depth(entries, max_entries)
        } else {
            usize::MAX
        };

        let mut tree = Self {
            roots: Vec::new(),
            total_entries: total,
            truncated: false,
        };

        for (path, kind) in entries {
            let depth = path.split('/').filter(|s| !s.is_empty()).count();
            if depth == 0 {
                continue;
            }
            if depth <= depth_limit {
                tree.insert(path, *kind);
            } else {
                tree.truncated = true;
                tree.mark_elided(path, depth_limit);
            }
        }

        sort_children(&mut tree.roots);
        tree
    }

    /// Insert one path, creating intermediate directories as needed.
    fn insert(&mut self, path: &str, kind: EntryKind) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut nodes = &mut self.roots;
        let mut prefix = String::new();

        for (i, segment) in segments.iter().enumerate() {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            let last = i + 1 == segments.len();
            let node_kind = if last { kind } else { EntryKind::Dir };

            let pos = match nodes.iter().position(|n| n.path == prefix) {
                Some(pos) => pos,
                None => {
                    nodes.push(TreeNode::new((*segment).to_owned(), prefix.clone(), node_kind));
                    nodes.len() - 1
                }
            };
            nodes = &mut nodes[pos].children;
        }
    }

    /// Mark the surviving ancestor of an elided path.
    fn mark_elided(&mut self, path: &str, depth_limit: usize) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() <= depth_limit {
            return;
        }
        let ancestor = segments[..depth_limit].join("/");
        self.insert(&ancestor, EntryKind::Dir);

        let mut nodes = &mut self.roots;
        let mut prefix = String::new();
        for segment in &segments[..depth_limit] {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            let Some(pos) = nodes.iter().position(|n| n.path == prefix) else {
                return;
            };
            if prefix == ancestor {
                nodes[pos].elided = true;
                return;
            }
            nodes = &mut nodes[pos].children;
        }
    }

    /// Whether a path exists in the tree (markers excluded).
    pub fn contains_path(&self, path: &str) -> bool {
        fn walk(nodes: &[TreeNode], path: &str) -> bool {
            nodes
                .iter()
                .any(|n| n.path == path || walk(&n.children, path))
        }
        walk(&self.roots, path)
    }

    /// Flatten back to `(path, kind)` pairs in render order.
    pub fn flatten(&self) -> Vec<(String, EntryKind)> {
        fn walk(nodes: &[TreeNode], out: &mut Vec<(String, EntryKind)>) {
            for node in nodes {
                out.push((node.path.clone(), node.kind));
                walk(&node.children, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.roots, &mut out);
        out
    }

    /// Number of files in the tree.
    pub fn file_count(&self) -> usize {
        self.roots.iter().map(TreeNode::file_count).sum()
    }

    /// Pretty-print the full tree with two-space indentation.
    pub fn render(&self) -> String {
        let mut out = String::new();
        render_nodes(&self.roots, 0, usize::MAX, &mut out);
        out
    }

    /// Pretty-print the tree down to `max_depth`; deeper subtrees are
    /// collapsed to a file count, e.g. `src/ (… 47 files)`.
    pub fn render_collapsed(&self, max_depth: usize) -> String {
        let mut out = String::new();
        render_nodes(&self.roots, 0, max_depth, &mut out);
        out
    }
}

fn render_nodes(nodes: &[TreeNode], depth: usize, max_depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    for node in nodes {
        match node.kind {
            EntryKind::File => {
                out.push_str(&indent);
                out.push_str(&node.name);
                out.push('\n');
            }
            EntryKind::Dir => {
                if depth + 1 >= max_depth && !node.children.is_empty() {
                    out.push_str(&format!(
                        "{indent}{}/ (… {} files)\n",
                        node.name,
                        node.file_count()
                    ));
                    continue;
                }
                out.push_str(&format!("{indent}{}/\n", node.name));
                render_nodes(&node.children, depth + 1, max_depth, out);
                if node.elided {
                    out.push_str(&format!("{}  … (truncated)\n", indent));
                }
            }
        }
    }
}

/// Deepest depth `d` such that the entries at depth ≤ d fit the cap.
fn deepest_fitting_depth(entries: &[(String, EntryKind)], max_entries: usize) -> usize {
    let mut counts_by_depth: Vec<usize> = Vec::new();
    for (path, _) in entries {
        let depth = path.split('/').filter(|s| !s.is_empty()).count();
        if depth == 0 {
            continue;
        }
        if counts_by_depth.len() < depth {
            counts_by_depth.resize(depth, 0);
        }
        counts_by_depth[depth - 1] += 1;
    }

    let mut cumulative = 0;
    let mut best = 1;
    for (i, count) in counts_by_depth.iter().enumerate() {
        cumulative += count;
        if cumulative <= max_entries {
            best = i + 1;
        } else {
            break;
        }
    }
    best
}

fn sort_children(nodes: &mut [TreeNode]) {
    // Directories first, then files, each alphabetical.
    nodes.sort_by(|a, b| match (a.kind, b.kind) {
        (EntryKind::Dir, EntryKind::File) => std::cmp::Ordering::Less,
        (EntryKind::File, EntryKind::Dir) => std::cmp::Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });
    for node in nodes.iter_mut() {
        sort_children(&mut node.children);
    }
}
