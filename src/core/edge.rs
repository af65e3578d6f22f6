//! Control-flow edge types.
//!
//! Edges connect blocks by start address. An edge's target is either a
//! block start or explicitly `Unresolved`; indirect transfers keep their
//! flagged, targetless edges instead of being dropped, so the snapshot
//! can enumerate exactly where static resolution gave up.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::Addr;

/// What kind of control transfer an edge records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Sequential execution into the next block.
    Fallthrough,
    /// Taken side of a direct branch.
    BranchTaken,
    /// Untaken side of a conditional branch.
    BranchFallthrough,
    /// Direct call to the callee's entry block.
    Call,
    /// Implicit edge from a call site to its return site.
    CallFallthrough,
    /// Return; target statically unknown.
    Return,
    /// Indirect branch or call; target statically unknown.
    IndirectUnresolved,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EdgeKind::Fallthrough => "fallthrough",
            EdgeKind::BranchTaken => "branch-taken",
            EdgeKind::BranchFallthrough => "branch-fallthrough",
            EdgeKind::Call => "call",
            EdgeKind::CallFallthrough => "call-fallthrough",
            EdgeKind::Return => "return",
            EdgeKind::IndirectUnresolved => "indirect-unresolved",
        };
        write!(f, "{}", s)
    }
}

/// Where an edge lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeTarget {
    /// A block identified by its start address.
    Block(Addr),
    /// No statically known target.
    Unresolved,
}

/// One control-flow edge between blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Start address of the source block.
    pub source: Addr,
    /// Resolved or unresolved target.
    pub target: EdgeTarget,
    /// Transfer classification.
    pub kind: EdgeKind,
}

impl Edge {
    pub fn new(source: Addr, target: EdgeTarget, kind: EdgeKind) -> Self {
        Self {
            source,
            target,
            kind,
        }
    }

    /// Resolved target block start, if any.
    pub fn target_block(&self) -> Option<Addr> {
        match self.target {
            EdgeTarget::Block(a) => Some(a),
            EdgeTarget::Unresolved => None,
        }
    }

    /// Whether this edge records a statically unresolved transfer.
    pub fn is_unresolved(&self) -> bool {
        matches!(self.target, EdgeTarget::Unresolved)
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            EdgeTarget::Block(t) => write!(f, "{} -> {} ({})", self.source, t, self.kind),
            EdgeTarget::Unresolved => write!(f, "{} -> ? ({})", self.source, self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_and_unresolved_targets() {
        let e = Edge::new(Addr(0x1000), EdgeTarget::Block(Addr(0x2000)), EdgeKind::Call);
        assert_eq!(e.target_block(), Some(Addr(0x2000)));
        assert!(!e.is_unresolved());

        let r = Edge::new(Addr(0x1005), EdgeTarget::Unresolved, EdgeKind::Return);
        assert_eq!(r.target_block(), None);
        assert!(r.is_unresolved());
    }

    #[test]
    fn display_marks_unresolved() {
        let e = Edge::new(
            Addr(0x1000),
            EdgeTarget::Unresolved,
            EdgeKind::IndirectUnresolved,
        );
        assert_eq!(format!("{}", e), "0x1000 -> ? (indirect-unresolved)");
    }
}
