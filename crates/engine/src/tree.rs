//! Call-tree store (spec §4.D): an ordered trie over label-id sequences
//! with per-node sample counts, merge/subtract, and a versioned
//! preorder binary format.

use std::sync::Arc;

use profilestore_core::{round_half_even, Error, NoopRecorder, Recorder, Result};
use profilestore_storage::varint::{read_uvarint, write_uvarint};
use profilestore_storage::{Backend, Cache, CacheConfig};

const TREE_FORMAT_VERSION: u8 = 1;
const TREE_STORE_PREFIX: &[u8] = b"t:";

/// Backend key for the tree rooted at `segkey`'s `(level, t_start)`
/// bucket (spec §4.D).
pub fn tree_key(segkey: &str, level: u8, t_start: u64) -> String {
    format!("{segkey}_{level}_{t_start}")
}

/// One node of a [`Tree`]: a label id, the samples whose stack ends
/// exactly here, and children ordered by strictly increasing
/// `label_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    /// Dictionary id of this node's label. The root's is always `0`.
    pub label_id: u64,
    /// Samples whose call stack terminates at this node.
    pub self_samples: u64,
    /// Children, strictly increasing by `label_id`.
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn leaf(label_id: u64, self_samples: u64) -> Self {
        TreeNode {
            label_id,
            self_samples,
            children: Vec::new(),
        }
    }

    fn find_child_idx(&self, label_id: u64) -> std::result::Result<usize, usize> {
        self.children.binary_search_by_key(&label_id, |c| c.label_id)
    }

    fn subtree_total(&self) -> u64 {
        self.self_samples + self.children.iter().map(TreeNode::subtree_total).sum::<u64>()
    }

    fn node_count(&self) -> usize {
        1 + self.children.iter().map(TreeNode::node_count).sum::<usize>()
    }
}

/// A rooted ordered trie over label-id sequences (spec §4.D). The root
/// always has `label_id == 0` and typically `self_samples == 0` (no
/// stack terminates at the empty path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    root: TreeNode,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// An empty tree: just the root.
    pub fn new() -> Self {
        Tree {
            root: TreeNode::leaf(0, 0),
        }
    }

    /// The root node.
    pub fn root(&self) -> &TreeNode {
        &self.root
    }

    /// Total nodes in the tree, including the root.
    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }

    /// Total samples represented anywhere in the tree.
    pub fn total_samples(&self) -> u64 {
        self.root.subtree_total()
    }

    /// Walk `path` (creating nodes as needed) and add `samples` to the
    /// leaf's `self_samples`.
    pub fn insert_stack(&mut self, path: &[u64], samples: u64) {
        let mut node = &mut self.root;
        for &label_id in path {
            let idx = match node.find_child_idx(label_id) {
                Ok(idx) => idx,
                Err(insert_at) => {
                    node.children.insert(insert_at, TreeNode::leaf(label_id, 0));
                    insert_at
                }
            };
            node = &mut node.children[idx];
        }
        node.self_samples += samples;
    }

    /// Sum `self_samples` at matching paths; tree-union otherwise.
    /// Commutative and associative (spec P5).
    pub fn merge(&self, other: &Tree) -> Tree {
        Tree {
            root: merge_nodes(&self.root, &other.root),
        }
    }

    /// Subtract `other`'s samples from matching paths, dropping any
    /// node (and its subtree) whose total drops to zero.
    pub fn subtract(&self, other: &Tree) -> Tree {
        Tree {
            root: subtract_nodes(&self.root, Some(&other.root))
                .unwrap_or_else(|| TreeNode::leaf(0, 0)),
        }
    }

    /// Depth-first preorder walk. `path` is the sequence of labels from
    /// the root to the visited node (the root itself is visited with an
    /// empty path).
    pub fn iterate(&self, mut visit: impl FnMut(&[u64], u64)) {
        let mut path = Vec::new();
        walk(&self.root, &mut path, &mut visit);
    }

    /// Drop the smallest-sample leaves, repeatedly, until the tree has
    /// at most `max_nodes` nodes (spec §6: `max_nodes_serialization`).
    /// A no-op if the tree already fits.
    pub fn prune_to_max_nodes(&mut self, max_nodes: usize) {
        while self.node_count() > max_nodes {
            let mut best: Option<(Vec<u64>, u64)> = None;
            let mut path = Vec::new();
            find_smallest_leaf(&self.root, &mut path, &mut best);
            match best {
                Some((leaf_path, _)) if !leaf_path.is_empty() => {
                    remove_path(&mut self.root, &leaf_path);
                }
                _ => break,
            }
        }
    }

    /// Serialize to the versioned preorder binary format (spec §4.D).
    /// Deserializing the result reproduces an equal tree (P1), and
    /// equal trees always serialize identically.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![TREE_FORMAT_VERSION];
        serialize_node(&self.root, 0, &mut buf);
        buf
    }

    /// Parse the format written by [`Tree::serialize`].
    pub fn deserialize(bytes: &[u8]) -> Result<Tree> {
        let version = *bytes
            .first()
            .ok_or_else(|| Error::CorruptEntry("empty tree record".to_string()))?;
        if version != TREE_FORMAT_VERSION {
            return Err(Error::CorruptEntry(format!(
                "unsupported tree format version {version}"
            )));
        }
        let mut pos = 1;
        let root = deserialize_node(bytes, &mut pos, 0)?;
        if pos != bytes.len() {
            return Err(Error::CorruptEntry("trailing bytes after tree record".to_string()));
        }
        Ok(Tree { root })
    }

    /// Scale every node's `self_samples` by `numerator / denominator`
    /// using banker's rounding, preserving tree shape. Used to weight a
    /// per-bucket slice of an incoming tree (spec §4.G) or a covering
    /// node's tree by its overlap ratio on `Get`.
    pub fn scale(&self, numerator: u64, denominator: u64) -> Tree {
        Tree {
            root: scale_node(&self.root, numerator, denominator),
        }
    }
}

fn scale_node(node: &TreeNode, numerator: u64, denominator: u64) -> TreeNode {
    TreeNode {
        label_id: node.label_id,
        self_samples: round_half_even(node.self_samples, numerator, denominator),
        children: node
            .children
            .iter()
            .map(|c| scale_node(c, numerator, denominator))
            .collect(),
    }
}

/// Cache-layer-backed store of call-trees keyed by `segkey + "_" +
/// level + "_" + t_start` (spec §4.D).
pub struct TreeStore {
    entries: Cache<String, Tree>,
}

impl TreeStore {
    /// Open the tree store on `backend`.
    pub fn open(backend: Arc<Backend>) -> Self {
        Self::open_with_recorder(backend, Arc::new(NoopRecorder))
    }

    /// Open with an injected [`Recorder`].
    pub fn open_with_recorder(backend: Arc<Backend>, recorder: Arc<dyn Recorder>) -> Self {
        let entries = Cache::new(
            CacheConfig {
                name: "tree_store".to_string(),
                prefix: TREE_STORE_PREFIX.to_vec(),
                serialize: Arc::new(|_k: &String, v: &Tree| v.serialize()),
                deserialize: Arc::new(|bytes| Tree::deserialize(bytes)),
                new_default: None,
                always_save: false,
            },
            backend,
            recorder,
        );
        TreeStore { entries }
    }

    /// The tree at `key`, or an empty tree if none has been written yet.
    pub fn get(&self, key: &str) -> Result<Tree> {
        match self.entries.get(&key.to_string()) {
            Ok(tree) => Ok(tree),
            Err(Error::Missing(_)) => Ok(Tree::new()),
            Err(e) => Err(e),
        }
    }

    /// Replace the tree at `key`.
    pub fn put(&self, key: String, tree: Tree) -> Result<()> {
        self.entries.put(key, tree)
    }

    /// Remove the tree at `key`. Absent is a no-op.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.entries.delete(&key.to_string())
    }

    /// Flush the underlying cache.
    pub fn flush(&self) {
        self.entries.flush();
    }

    /// Evict `fraction` of the least-frequently-used entries (spec
    /// §4.G: periodic eviction task).
    pub fn evict(&self, fraction: f64) {
        self.entries.evict(fraction);
    }
}

fn walk(node: &TreeNode, path: &mut Vec<u64>, visit: &mut impl FnMut(&[u64], u64)) {
    visit(path, node.self_samples);
    for child in &node.children {
        path.push(child.label_id);
        walk(child, path, visit);
        path.pop();
    }
}

fn merge_nodes(a: &TreeNode, b: &TreeNode) -> TreeNode {
    debug_assert_eq!(a.label_id, b.label_id);
    let mut children = Vec::with_capacity(a.children.len().max(b.children.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.children.len() && j < b.children.len() {
        let (ca, cb) = (&a.children[i], &b.children[j]);
        match ca.label_id.cmp(&cb.label_id) {
            std::cmp::Ordering::Equal => {
                children.push(merge_nodes(ca, cb));
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => {
                children.push(ca.clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                children.push(cb.clone());
                j += 1;
            }
        }
    }
    children.extend_from_slice(&a.children[i..]);
    children.extend_from_slice(&b.children[j..]);
    TreeNode {
        label_id: a.label_id,
        self_samples: a.self_samples + b.self_samples,
        children,
    }
}

fn subtract_nodes(a: &TreeNode, b: Option<&TreeNode>) -> Option<TreeNode> {
    let self_samples = a
        .self_samples
        .saturating_sub(b.map_or(0, |n| n.self_samples));
    let mut children = Vec::with_capacity(a.children.len());
    for ca in &a.children {
        let cb = b.and_then(|bn| {
            bn.children
                .binary_search_by_key(&ca.label_id, |c| c.label_id)
                .ok()
                .map(|idx| &bn.children[idx])
        });
        if let Some(child) = subtract_nodes(ca, cb) {
            children.push(child);
        }
    }
    let subtree_sum = self_samples + children.iter().map(TreeNode::subtree_total).sum::<u64>();
    if subtree_sum == 0 && a.label_id != 0 {
        None
    } else {
        Some(TreeNode {
            label_id: a.label_id,
            self_samples,
            children,
        })
    }
}

fn find_smallest_leaf(node: &TreeNode, path: &mut Vec<u64>, best: &mut Option<(Vec<u64>, u64)>) {
    if node.children.is_empty() {
        if best.is_none() || node.self_samples < best.as_ref().unwrap().1 {
            *best = Some((path.clone(), node.self_samples));
        }
        return;
    }
    for child in &node.children {
        path.push(child.label_id);
        find_smallest_leaf(child, path, best);
        path.pop();
    }
}

fn remove_path(root: &mut TreeNode, path: &[u64]) {
    let mut node = root;
    for &label_id in &path[..path.len() - 1] {
        let idx = node
            .find_child_idx(label_id)
            .expect("path must describe an existing node");
        node = &mut node.children[idx];
    }
    let last = *path.last().expect("path is non-empty");
    if let Ok(idx) = node.find_child_idx(last) {
        node.children.remove(idx);
    }
}

fn serialize_node(node: &TreeNode, prev_sibling_id: u64, buf: &mut Vec<u8>) {
    write_uvarint(buf, node.label_id - prev_sibling_id);
    write_uvarint(buf, node.self_samples);
    write_uvarint(buf, node.children.len() as u64);
    let mut prev = 0;
    for child in &node.children {
        serialize_node(child, prev, buf);
        prev = child.label_id;
    }
}

fn deserialize_node(buf: &[u8], pos: &mut usize, prev_sibling_id: u64) -> Result<TreeNode> {
    let delta = read_uvarint(buf, pos)?;
    let label_id = prev_sibling_id + delta;
    let self_samples = read_uvarint(buf, pos)?;
    let num_children = read_uvarint(buf, pos)?;
    let mut children = Vec::with_capacity(num_children as usize);
    let mut prev = 0;
    for _ in 0..num_children {
        let child = deserialize_node(buf, pos, prev)?;
        prev = child.label_id;
        children.push(child);
    }
    Ok(TreeNode {
        label_id,
        self_samples,
        children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_stack_builds_expected_shape() {
        let mut t = Tree::new();
        t.insert_stack(&[1, 2], 1); // a;b
        t.insert_stack(&[1, 3], 2); // a;c
        assert_eq!(t.total_samples(), 3);
        assert_eq!(t.root().children.len(), 1);
        assert_eq!(t.root().children[0].label_id, 1);
        assert_eq!(t.root().children[0].children.len(), 2);
    }

    #[test]
    fn children_stay_sorted_by_label_id() {
        let mut t = Tree::new();
        t.insert_stack(&[5], 1);
        t.insert_stack(&[2], 1);
        t.insert_stack(&[9], 1);
        let ids: Vec<u64> = t.root().children.iter().map(|c| c.label_id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[test]
    fn round_trip_preserves_tree() {
        let mut t = Tree::new();
        t.insert_stack(&[1, 2], 1);
        t.insert_stack(&[1, 3], 2);
        t.insert_stack(&[4], 7);
        let bytes = t.serialize();
        let back = Tree::deserialize(&bytes).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn equal_trees_serialize_identically() {
        let mut a = Tree::new();
        a.insert_stack(&[1, 2], 1);
        let mut b = Tree::new();
        b.insert_stack(&[1, 2], 1);
        assert_eq!(a.serialize(), b.serialize());
    }

    #[test]
    fn merge_is_commutative_and_sums_samples() {
        let mut a = Tree::new();
        a.insert_stack(&[1, 2], 1);
        a.insert_stack(&[1, 3], 2);
        let mut b = Tree::new();
        b.insert_stack(&[1, 2], 5);
        b.insert_stack(&[9], 1);

        let ab = a.merge(&b);
        let ba = b.merge(&a);
        assert_eq!(ab, ba);
        assert_eq!(ab.total_samples(), 1 + 2 + 5 + 1);

        let mut path_12 = None;
        ab.iterate(|path, samples| {
            if path == [1, 2] {
                path_12 = Some(samples);
            }
        });
        assert_eq!(path_12, Some(6));
    }

    #[test]
    fn subtract_drops_zeroed_subtrees() {
        let mut a = Tree::new();
        a.insert_stack(&[1, 2], 5);
        a.insert_stack(&[1, 3], 2);
        let mut b = Tree::new();
        b.insert_stack(&[1, 2], 5);

        let diff = a.subtract(&b);
        assert_eq!(diff.total_samples(), 2);
        let mut saw_12 = false;
        diff.iterate(|path, _| {
            if path == [1, 2] {
                saw_12 = true;
            }
        });
        assert!(!saw_12, "zeroed subtree must be dropped");
    }

    #[test]
    fn prune_drops_smallest_leaves_first() {
        let mut t = Tree::new();
        t.insert_stack(&[1], 100);
        t.insert_stack(&[2], 1);
        t.insert_stack(&[3], 50);
        assert_eq!(t.node_count(), 4); // root + 3 leaves
        t.prune_to_max_nodes(3);
        assert_eq!(t.node_count(), 3);
        let mut samples = Vec::new();
        t.iterate(|path, s| {
            if path.len() == 1 {
                samples.push(s);
            }
        });
        assert!(!samples.contains(&1), "smallest leaf should have been pruned");
    }

    #[test]
    fn unknown_format_version_is_corrupt_entry() {
        let mut bytes = Tree::new().serialize();
        bytes[0] = 99;
        assert!(Tree::deserialize(&bytes).is_err());
    }

    #[test]
    fn scale_applies_banker_rounding_per_node() {
        let mut t = Tree::new();
        t.insert_stack(&[1], 100);
        let half = t.scale(10, 20);
        let mut total = 0;
        half.iterate(|_, s| total += s);
        assert_eq!(total, 50);
    }

    mod store {
        use super::super::*;
        use tempfile::tempdir;

        #[test]
        fn put_then_get_roundtrips_through_backend() {
            let dir = tempdir().unwrap();
            let backend = Arc::new(Backend::open(dir.path()).unwrap());
            let store = TreeStore::open(backend);
            let mut t = Tree::new();
            t.insert_stack(&[1, 2], 5);
            store.put(tree_key("app{}", 0, 10), t.clone()).unwrap();
            assert_eq!(store.get(&tree_key("app{}", 0, 10)).unwrap(), t);
        }

        #[test]
        fn get_on_unwritten_key_is_an_empty_tree() {
            let dir = tempdir().unwrap();
            let backend = Arc::new(Backend::open(dir.path()).unwrap());
            let store = TreeStore::open(backend);
            assert_eq!(store.get("missing").unwrap(), Tree::new());
        }

        #[test]
        fn delete_removes_the_entry() {
            let dir = tempdir().unwrap();
            let backend = Arc::new(Backend::open(dir.path()).unwrap());
            let store = TreeStore::open(backend);
            let mut t = Tree::new();
            t.insert_stack(&[1], 1);
            store.put("k".to_string(), t).unwrap();
            store.delete("k").unwrap();
            assert_eq!(store.get("k").unwrap(), Tree::new());
        }
    }
}
