//! Data structures shared by the strata scheduler passes.
//!
//! # Module Organization
//!
//! - [`group`] - the fused operator group handed to the scheduler
//! - [`tree`] - the `Scope | Tile | Op` tile tree, its arena and visitor
//! - [`lowered`] - the nested-loop program produced after solving
//! - [`error`] - error types

pub mod error;
pub mod group;
pub mod lowered;
pub mod tree;


pub use error::{Error, Result};
pub use group::{Body, BufferId, Dependence, ElemType, FusedGroup, OpDesc, OpId, Primitive, Slot};
pub use lowered::{BufferDecl, Emit, IndexExpr, LoopVar, MemSpace, Param, ParamDir, Proc, ProcBuilder, Stmt, SubView, Value};
pub use tree::{Dep, Node, NodeId, OpNode, ScopeNode, Snapshot, TileNode, Tree, Visitor};
