//! The immutable recovery snapshot.
//!
//! `RecoveredProgram` is the single output of a recovery run. All vectors
//! are sorted by address at assembly time so that lookups are binary
//! searches and serialized snapshots are byte-identical across runs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::address::Addr;
use crate::core::block::Block;
use crate::core::data_object::DataObject;
use crate::core::edge::Edge;
use crate::core::symbolic::SymbolicExpression;

/// Per-run counters reported on the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    /// Successfully decoded candidates in the superset table.
    pub candidate_count: usize,
    /// Explicit invalid slots in the superset table.
    pub invalid_slot_count: usize,
    /// Candidates marked statically invalid by transitive invalidation.
    pub static_invalid_count: usize,
    /// Total fact bits set at convergence.
    pub fact_count: usize,
    /// Rounds the monotone fixpoint ran before converging.
    pub fixpoint_rounds: usize,
    /// Conflicting reachable candidates discarded by resolution.
    pub conflicts_resolved: usize,
    /// Instructions in the final selection.
    pub selected_count: usize,
    /// Recovered blocks.
    pub block_count: usize,
    /// Recovered edges.
    pub edge_count: usize,
    /// Inferred data objects.
    pub data_object_count: usize,
    /// Wall-clock time of the whole run.
    pub elapsed_ms: u64,
}

/// Immutable snapshot of one recovery run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveredProgram {
    blocks: Vec<Block>,
    edges: Vec<Edge>,
    data_objects: Vec<DataObject>,
    expressions: Vec<SymbolicExpression>,
    labels: BTreeMap<Addr, String>,
    undecidable: Vec<Addr>,
    stats: RecoveryStats,
}

impl RecoveredProgram {
    /// Assemble a snapshot. Inputs are sorted here so callers may build
    /// them in any order.
    pub fn new(
        mut blocks: Vec<Block>,
        mut edges: Vec<Edge>,
        mut data_objects: Vec<DataObject>,
        mut expressions: Vec<SymbolicExpression>,
        labels: BTreeMap<Addr, String>,
        mut undecidable: Vec<Addr>,
        stats: RecoveryStats,
    ) -> Self {
        blocks.sort_by_key(|b| b.start);
        edges.sort_by_key(|e| (e.source, e.kind as u8));
        data_objects.sort_by_key(|d| d.start);
        expressions.sort_by_key(|e| e.operand);
        undecidable.sort();
        undecidable.dedup();
        Self {
            blocks,
            edges,
            data_objects,
            expressions,
            labels,
            undecidable,
            stats,
        }
    }

    /// Blocks in ascending start order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Edges in ascending source order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Data objects in ascending start order.
    pub fn data_objects(&self) -> &[DataObject] {
        &self.data_objects
    }

    /// Symbolized operands in operand-key order.
    pub fn expressions(&self) -> &[SymbolicExpression] {
        &self.expressions
    }

    /// Synthesized and reused labels, keyed by address.
    pub fn labels(&self) -> &BTreeMap<Addr, String> {
        &self.labels
    }

    /// Addresses the engine could not commit to code or data.
    pub fn undecidable(&self) -> &[Addr] {
        &self.undecidable
    }

    /// Per-run counters.
    pub fn stats(&self) -> &RecoveryStats {
        &self.stats
    }

    /// The block starting exactly at `addr`, if any.
    pub fn block_starting_at(&self, addr: Addr) -> Option<&Block> {
        self.blocks
            .binary_search_by_key(&addr, |b| b.start)
            .ok()
            .map(|i| &self.blocks[i])
    }

    /// The block containing `addr`, if any.
    pub fn block_at(&self, addr: Addr) -> Option<&Block> {
        let idx = self.blocks.partition_point(|b| b.start <= addr);
        let b = self.blocks.get(idx.checked_sub(1)?)?;
        b.contains(addr).then_some(b)
    }

    /// The data object containing `addr`, if any.
    pub fn data_object_at(&self, addr: Addr) -> Option<&DataObject> {
        let idx = self.data_objects.partition_point(|d| d.start <= addr);
        let d = self.data_objects.get(idx.checked_sub(1)?)?;
        d.contains(addr).then_some(d)
    }

    /// Label at exactly `addr`, if one was synthesized or reused.
    pub fn label_at(&self, addr: Addr) -> Option<&str> {
        self.labels.get(&addr).map(String::as_str)
    }

    /// Edges whose targets stayed statically unresolved.
    pub fn unresolved_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(|e| e.is_unresolved())
    }

    /// Operand bindings that stayed statically unresolved.
    pub fn unresolved_bindings(&self) -> impl Iterator<Item = &SymbolicExpression> {
        self.expressions.iter().filter(|e| e.target.is_unresolved())
    }

    /// Outgoing edges of the block starting at `addr`.
    pub fn edges_from(&self, addr: Addr) -> &[Edge] {
        let lo = self.edges.partition_point(|e| e.source < addr);
        let hi = self.edges.partition_point(|e| e.source <= addr);
        &self.edges[lo..hi]
    }
}

impl fmt::Display for RecoveredProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "recovered program: {} blocks, {} edges, {} data objects, {} expressions",
            self.blocks.len(),
            self.edges.len(),
            self.data_objects.len(),
            self.expressions.len()
        )
    }
}
