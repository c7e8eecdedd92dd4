//! Conversion of control flow graphs into `petgraph` graphs, for clients
//! that want to run graph algorithms over them.

use std::collections::BTreeMap;

use petgraph::graph::{DiGraph, NodeIndex};

use super::cfg::{CfgNode, ControlFlowGraph};

impl ControlFlowGraph {
    /// Builds a directed `petgraph` graph with one node per basic block,
    /// catch node, and synthetic exit, and one edge per control transfer.
    #[must_use]
    pub fn to_petgraph(&self) -> DiGraph<CfgNode, ()> {
        let mut graph = DiGraph::new();
        let mut indices: BTreeMap<CfgNode, NodeIndex> = BTreeMap::new();
        let mut index_of = |node: CfgNode, graph: &mut DiGraph<CfgNode, ()>| {
            *indices.entry(node).or_insert_with(|| graph.add_node(node))
        };
        for block in self.blocks() {
            index_of(CfgNode::Block(block.start_pc), &mut graph);
        }
        for catch in self.catch_nodes() {
            index_of(CfgNode::Catch(catch.handler_index), &mut graph);
        }
        for (from, to) in self.edges() {
            let from = index_of(from, &mut graph);
            let to = index_of(to, &mut graph);
            graph.add_edge(from, to, ());
        }
        graph
    }
}
