//! The tile tree.
//!
//! Three node kinds form a closed sum type:
//!
//! - [`ScopeNode`]: ordered siblings
//! - [`TileNode`]: one loop-nest level of one operator, exactly one child
//! - [`OpNode`]: a primitive operator instance (leaf)
//!
//! Nodes live in a [`SlotMap`] arena owned by [`Tree`]. Children are owned
//! through their ids; parents are plain back-references stored next to each
//! node, so restructuring is id rearrangement inside the arena.
//!
//! Every tile carries a relation: an affine map from its nearest enclosing
//! tile's domain to its own domain. Top-level tiles and freshly built chains
//! carry identities; merging composes the producer/consumer relation in.

use std::fmt;

use itertools::Itertools;
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;
use snafu::{ResultExt, ensure};
use strata_affine::AffineMap;

use crate::error::*;
use crate::group::{BufferId, ElemType, OpId, Primitive, Slot};

new_key_type! {
    /// Arena key of a tree node.
    pub struct NodeId;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeNode {
    pub children: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileNode {
    pub op: OpId,
    /// Memory level this tile stages data for; 0 is closest to compute.
    pub level: usize,
    pub dims: SmallVec<[String; 4]>,
    /// Enclosing tile's domain to this tile's domain.
    pub relation: AffineMap,
    pub child: NodeId,
}

impl TileNode {
    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }
}

/// Input `slot` of an op is produced by `producer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dep {
    pub slot: usize,
    pub producer: OpId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpNode {
    pub op: OpId,
    pub name: String,
    pub dims: SmallVec<[String; 4]>,
    pub bounds: SmallVec<[i64; 4]>,
    pub inputs: SmallVec<[AffineMap; 3]>,
    pub output: AffineMap,
    pub deps: SmallVec<[Dep; 2]>,
    pub primitive: Primitive,
    pub elem: ElemType,
    /// Result leaves the group.
    pub is_output: bool,
}

impl OpNode {
    pub fn num_dims(&self) -> usize {
        self.bounds.len()
    }

    pub fn access(&self, slot: Slot) -> &AffineMap {
        match slot {
            Slot::Input(i) => &self.inputs[i],
            Slot::Output => &self.output,
        }
    }

    pub fn buffers(&self) -> impl Iterator<Item = BufferId> + '_ {
        (0..self.inputs.len()).map(|i| BufferId::input(self.op, i)).chain(std::iter::once(BufferId::output(self.op)))
    }

    pub fn producer_of(&self, slot: usize) -> Option<OpId> {
        self.deps.iter().find(|d| d.slot == slot).map(|d| d.producer)
    }

    /// Tensor extents touched over the full domain.
    pub fn full_shape(&self, slot: Slot) -> SmallVec<[i64; 4]> {
        self.access(slot).results().iter().map(|r| r.footprint(&self.bounds)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Scope(ScopeNode),
    Tile(TileNode),
    Op(OpNode),
}

#[derive(Debug, Clone)]
struct Entry {
    parent: Option<NodeId>,
    node: Node,
}

/// Dispatch over the three node kinds.
///
/// `A` is the per-call argument threaded down by the implementation.
pub trait Visitor<A> {
    type Output;

    fn visit_scope(&mut self, tree: &Tree, id: NodeId, scope: &ScopeNode, arg: A) -> Self::Output;
    fn visit_tile(&mut self, tree: &Tree, id: NodeId, tile: &TileNode, arg: A) -> Self::Output;
    fn visit_op(&mut self, tree: &Tree, id: NodeId, op: &OpNode, arg: A) -> Self::Output;
}

/// Owned structural copy of a tree, for deep-equality checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Scope(Vec<Snapshot>),
    Tile { op: OpId, level: usize, dims: Vec<String>, relation: AffineMap, child: Box<Snapshot> },
    Op { op: OpId, name: String },
}

#[derive(Debug, Clone)]
pub struct Tree {
    nodes: SlotMap<NodeId, Entry>,
    root: NodeId,
    /// Op node per `OpId`.
    ops: Vec<NodeId>,
    levels: usize,
}

impl Tree {
    /// Empty tree with a root scope, tiled over `levels` memory levels.
    pub fn new(levels: usize) -> Self {
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(Entry { parent: None, node: Node::Scope(ScopeNode::default()) });
        Self { nodes, root, ops: Vec::new(), levels }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id].node
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id].node
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) {
        self.nodes[id].parent = parent;
    }

    pub fn tile(&self, id: NodeId) -> Option<&TileNode> {
        match self.node(id) {
            Node::Tile(tile) => Some(tile),
            _ => None,
        }
    }

    pub fn scope(&self, id: NodeId) -> Option<&ScopeNode> {
        match self.node(id) {
            Node::Scope(scope) => Some(scope),
            _ => None,
        }
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match self.node(id) {
            Node::Scope(scope) => &scope.children,
            Node::Tile(tile) => std::slice::from_ref(&tile.child),
            Node::Op(_) => &[],
        }
    }

    /// Add a node to the arena. Its children are re-parented to it and op
    /// nodes are registered under their id. The node itself stays detached.
    pub fn insert(&mut self, node: Node) -> NodeId {
        let op = match &node {
            Node::Op(op) => Some(op.op),
            _ => None,
        };
        let id = self.nodes.insert(Entry { parent: None, node });
        for child in self.children(id).to_vec() {
            self.nodes[child].parent = Some(id);
        }
        if let Some(op) = op {
            if self.ops.len() <= op.index() {
                self.ops.resize(op.index() + 1, NodeId::default());
            }
            self.ops[op.index()] = id;
        }
        id
    }

    /// Append `child` to the scope `scope`.
    pub fn push_child(&mut self, scope: NodeId, child: NodeId) -> Result<()> {
        let Node::Scope(s) = self.node_mut(scope) else {
            return TreeInvariantSnafu { node: format!("{scope:?}"), reason: "children can only be pushed to scopes" }
                .fail();
        };
        s.children.push(child);
        self.nodes[child].parent = Some(scope);
        Ok(())
    }

    /// Drop a node from the arena; its children are left in place.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.nodes.remove(id).map(|e| e.node)
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn op_node(&self, op: OpId) -> Option<NodeId> {
        self.ops.get(op.index()).copied().filter(|&id| self.nodes.contains_key(id))
    }

    pub fn op(&self, op: OpId) -> Option<&OpNode> {
        match self.node(self.op_node(op)?) {
            Node::Op(node) => Some(node),
            _ => None,
        }
    }

    /// Op nodes in id order.
    pub fn ops(&self) -> impl Iterator<Item = &OpNode> + '_ {
        self.ops.iter().filter_map(|&id| match self.nodes.get(id).map(|e| &e.node) {
            Some(Node::Op(op)) => Some(op),
            _ => None,
        })
    }

    /// Strict ancestors, innermost first.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.parent(id), move |&p| self.parent(p))
    }

    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        self.ancestors(id).any(|a| a == ancestor)
    }

    /// Nearest strict ancestor that is a tile.
    pub fn parent_tile(&self, id: NodeId) -> Option<NodeId> {
        self.ancestors(id).find(|&a| matches!(self.node(a), Node::Tile(_)))
    }

    /// Tiles enclosing `op`, innermost first.
    pub fn chain(&self, op: OpId) -> SmallVec<[NodeId; 8]> {
        match self.op_node(op) {
            Some(id) => self.ancestors(id).filter(|&a| matches!(self.node(a), Node::Tile(_))).collect(),
            None => SmallVec::new(),
        }
    }

    /// Whether the two ops sit under a common tile.
    pub fn share_tile(&self, a: OpId, b: OpId) -> bool {
        let chain_b = self.chain(b);
        self.chain(a).iter().any(|t| chain_b.contains(t))
    }

    /// All nodes, parents before children, siblings in order.
    pub fn pre_order(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        out
    }

    /// Ops in the subtree of `id`, in tree order.
    pub fn ops_under(&self, id: NodeId) -> SmallVec<[OpId; 4]> {
        let mut out = SmallVec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if let Node::Op(op) = self.node(n) {
                out.push(op.op);
            }
            stack.extend(self.children(n).iter().rev().copied());
        }
        out
    }

    /// Map from the domain of the enclosing tile `tile` to `op`'s domain.
    pub fn domain_map(&self, op: OpId, tile: NodeId) -> Result<AffineMap> {
        let node = self.op_node(op).ok_or(Error::UnknownOp { op })?;
        let op_dims = self.op(op).map_or(0, OpNode::num_dims);
        let mut map = AffineMap::identity(op_dims);
        let mut cur = self.parent_tile(node);
        while let Some(t) = cur {
            if t == tile {
                return Ok(map);
            }
            if let Some(inner) = self.tile(t) {
                map = map.compose(&inner.relation).context(RelationSnafu)?;
            }
            cur = self.parent_tile(t);
        }
        TreeInvariantSnafu { node: format!("{tile:?}"), reason: "not a tile enclosing the op" }.fail()
    }

    /// For each dimension of `op`, the dimension of enclosing `tile` that drives it.
    pub fn related_dims(&self, op: OpId, tile: NodeId) -> Result<SmallVec<[Option<usize>; 4]>> {
        let map = self.domain_map(op, tile)?;
        Ok(map.results().iter().map(unit_dim).collect())
    }

    /// For each dimension of tile `id`, the enclosing tile's dimension it follows.
    pub fn parent_dims(&self, id: NodeId) -> SmallVec<[Option<usize>; 4]> {
        match (self.tile(id), self.parent_tile(id)) {
            (Some(tile), Some(_)) => tile.relation.results().iter().map(unit_dim).collect(),
            (Some(tile), None) => SmallVec::from_elem(None, tile.num_dims()),
            _ => SmallVec::new(),
        }
    }

    /// Replace every non-root scope with a single child by that child.
    pub fn collapse_scopes(&mut self) {
        let scopes: Vec<NodeId> = self
            .pre_order()
            .into_iter()
            .filter(|&id| id != self.root && matches!(self.node(id), Node::Scope(s) if s.children.len() == 1))
            .collect();
        for scope in scopes {
            let child = self.children(scope)[0];
            let Some(parent) = self.parent(scope) else { continue };
            match self.node_mut(parent) {
                Node::Scope(s) => {
                    for c in s.children.iter_mut().filter(|c| **c == scope) {
                        *c = child;
                    }
                }
                Node::Tile(t) => t.child = child,
                Node::Op(_) => continue,
            }
            self.nodes[child].parent = Some(parent);
            self.nodes.remove(scope);
        }
    }

    pub fn accept<A, V: Visitor<A>>(&self, id: NodeId, visitor: &mut V, arg: A) -> V::Output {
        match self.node(id) {
            Node::Scope(scope) => visitor.visit_scope(self, id, scope, arg),
            Node::Tile(tile) => visitor.visit_tile(self, id, tile, arg),
            Node::Op(op) => visitor.visit_op(self, id, op, arg),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.accept(self.root, &mut SnapshotVisitor, ())
    }

    /// Check the structural invariants: parent links, single-child tiles,
    /// relation arities, strictly decreasing levels and that every op is
    /// reachable exactly once.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.parent(self.root).is_none(),
            TreeInvariantSnafu { node: "root".to_string(), reason: "root has a parent" }
        );
        let mut checker = Checker { seen: vec![0; self.ops.len()] };
        self.accept(self.root, &mut checker, None)?;
        for (i, &count) in checker.seen.iter().enumerate() {
            ensure!(
                count == 1,
                TreeInvariantSnafu { node: OpId(i as u32).to_string(), reason: "op not reachable exactly once" }
            );
        }
        Ok(())
    }
}

fn unit_dim(expr: &strata_affine::AffineExpr) -> Option<usize> {
    match expr.single_dim() {
        Some((d, 1)) if expr.offset() == 0 => Some(d),
        _ => None,
    }
}

struct SnapshotVisitor;

impl Visitor<()> for SnapshotVisitor {
    type Output = Snapshot;

    fn visit_scope(&mut self, tree: &Tree, _: NodeId, scope: &ScopeNode, _: ()) -> Snapshot {
        Snapshot::Scope(scope.children.iter().map(|&c| tree.accept(c, self, ())).collect())
    }

    fn visit_tile(&mut self, tree: &Tree, _: NodeId, tile: &TileNode, _: ()) -> Snapshot {
        Snapshot::Tile {
            op: tile.op,
            level: tile.level,
            dims: tile.dims.to_vec(),
            relation: tile.relation.clone(),
            child: Box::new(tree.accept(tile.child, self, ())),
        }
    }

    fn visit_op(&mut self, _: &Tree, _: NodeId, op: &OpNode, _: ()) -> Snapshot {
        Snapshot::Op { op: op.op, name: op.name.clone() }
    }
}

/// Validation walk; the argument is the nearest enclosing tile.
struct Checker {
    seen: Vec<usize>,
}

impl Checker {
    fn check_link(tree: &Tree, parent: NodeId, child: NodeId) -> Result<()> {
        ensure!(tree.contains(child), TreeInvariantSnafu { node: format!("{parent:?}"), reason: "dangling child" });
        ensure!(
            tree.parent(child) == Some(parent),
            TreeInvariantSnafu { node: format!("{child:?}"), reason: "parent link does not match owner" }
        );
        Ok(())
    }
}

impl Visitor<Option<NodeId>> for Checker {
    type Output = Result<()>;

    fn visit_scope(&mut self, tree: &Tree, id: NodeId, scope: &ScopeNode, enclosing: Option<NodeId>) -> Result<()> {
        if id != tree.root() {
            ensure!(
                scope.children.len() >= 2,
                TreeInvariantSnafu { node: format!("{id:?}"), reason: "non-root scope with fewer than two children" }
            );
        }
        for &child in &scope.children {
            Self::check_link(tree, id, child)?;
            tree.accept(child, self, enclosing)?;
        }
        Ok(())
    }

    fn visit_tile(&mut self, tree: &Tree, id: NodeId, tile: &TileNode, enclosing: Option<NodeId>) -> Result<()> {
        let enclosing = enclosing.and_then(|e| tree.tile(e));
        let node = format!("{} L{}", tile.op, tile.level);
        ensure!(tile.level < tree.levels(), TreeInvariantSnafu { node: node.clone(), reason: "level out of range" });
        ensure!(
            tile.relation.num_results() == tile.num_dims(),
            TreeInvariantSnafu { node: node.clone(), reason: "relation results differ from tile dims" }
        );
        let expected = enclosing.map_or(tile.num_dims(), TileNode::num_dims);
        ensure!(
            tile.relation.num_dims() == expected,
            TreeInvariantSnafu { node: node.clone(), reason: "relation domain differs from enclosing tile" }
        );
        if let Some(outer) = enclosing {
            ensure!(tile.level < outer.level, TreeInvariantSnafu { node, reason: "level not below enclosing tile" });
        }
        Self::check_link(tree, id, tile.child)?;
        tree.accept(tile.child, self, Some(id))
    }

    fn visit_op(&mut self, tree: &Tree, _: NodeId, op: &OpNode, enclosing: Option<NodeId>) -> Result<()> {
        let enclosing = enclosing.and_then(|e| tree.tile(e));
        let node = op.op.to_string();
        ensure!(op.op.index() < self.seen.len(), TreeInvariantSnafu { node: node.clone(), reason: "unregistered op" });
        self.seen[op.op.index()] += 1;
        if let Some(tile) = enclosing {
            ensure!(tile.op == op.op, TreeInvariantSnafu { node: node.clone(), reason: "innermost tile belongs to another op" });
            ensure!(
                tile.num_dims() == op.num_dims(),
                TreeInvariantSnafu { node, reason: "innermost tile dims differ from op domain" }
            );
        }
        Ok(())
    }
}

struct Printer<'a, 'b> {
    f: &'a mut fmt::Formatter<'b>,
}

impl Visitor<usize> for Printer<'_, '_> {
    type Output = fmt::Result;

    fn visit_scope(&mut self, tree: &Tree, _: NodeId, scope: &ScopeNode, depth: usize) -> fmt::Result {
        writeln!(self.f, "{:indent$}scope", "", indent = depth * 2)?;
        for &child in &scope.children {
            tree.accept(child, self, depth + 1)?;
        }
        Ok(())
    }

    fn visit_tile(&mut self, tree: &Tree, _: NodeId, tile: &TileNode, depth: usize) -> fmt::Result {
        writeln!(
            self.f,
            "{:indent$}tile {} L{} [{}] {}",
            "",
            tile.op,
            tile.level,
            tile.dims.iter().join(", "),
            tile.relation,
            indent = depth * 2
        )?;
        tree.accept(tile.child, self, depth + 1)
    }

    fn visit_op(&mut self, _: &Tree, _: NodeId, op: &OpNode, depth: usize) -> fmt::Result {
        writeln!(
            self.f,
            "{:indent$}op {} '{}' {} {} [{}]",
            "",
            op.op,
            op.name,
            op.primitive,
            op.elem,
            op.bounds.iter().join(", "),
            indent = depth * 2
        )
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.accept(self.root, &mut Printer { f }, 0)
    }
}
