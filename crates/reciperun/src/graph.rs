//! Boundary to a graph compiler that produces [`Recipe`]s.

use std::sync::Arc;

use crate::dtype::DType;
use crate::error::LaunchResult;
use crate::recipe::{NodeId, Recipe, SectionId, TensorId};
use crate::tensor::{Shape, TensorKind};

/// Placement of a persistent tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionPlacement {
    pub section: SectionId,
    pub offset: u64,
}

/// Everything the compiler needs to create one tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDesc {
    pub name: String,
    pub dtype: DType,
    pub kind: TensorKind,
    pub max_shape: Shape,
    pub min_shape: Shape,
    /// `None` for intermediates that live in the workspace.
    pub placement: Option<SectionPlacement>,
    /// Baked contents for tensors placed in a const section.
    pub const_data: Option<Arc<[u8]>>,
}

#[derive(Debug, Clone, Copy)]
pub struct NodeDesc<'a> {
    pub guid: &'a str,
    pub name: &'a str,
    pub inputs: &'a [TensorId],
    pub outputs: &'a [TensorId],
    pub params: &'a [u8],
}

/// Graph construction and compilation entry points.
///
/// Every graph is an independent arena: ids handed out by one graph mean nothing to another.
/// Graphs are cloneable so a caller can restore an earlier state after a failed edit.
pub trait GraphCompiler {
    type Graph: Clone;

    fn create_graph(&self) -> LaunchResult<Self::Graph>;

    fn create_section(&self, graph: &mut Self::Graph, is_const: bool) -> LaunchResult<SectionId>;

    fn create_tensor(&self, graph: &mut Self::Graph, desc: &TensorDesc) -> LaunchResult<TensorId>;

    fn add_node(&self, graph: &mut Self::Graph, node: &NodeDesc<'_>) -> LaunchResult<NodeId>;

    /// Makes every node in `blocked` wait for every node in `blocking`.
    fn set_node_dependency(
        &self,
        graph: &mut Self::Graph,
        blocking: &[NodeId],
        blocked: &[NodeId],
    ) -> LaunchResult<()>;

    /// Compiles with `config` applied as ordered key/value overrides.
    fn compile(
        &self,
        graph: &Self::Graph,
        name: &str,
        config: &[(String, String)],
    ) -> LaunchResult<Arc<dyn Recipe>>;
}
