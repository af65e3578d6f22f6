//! Symbolic re-expression of address-valued operands.
//!
//! The symbolizer rewrites every retained address-valued operand as a
//! `SymbolicExpression`: which operand of which selected instruction, and
//! what its address actually denotes. Indirect operands are flagged
//! `UnresolvedIndirect` rather than bound to a default.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::Addr;

/// Identity of one operand of one selected instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperandKey {
    /// Address of the owning selected instruction.
    pub instruction: Addr,
    /// Operand position within the instruction.
    pub operand_index: u8,
}

impl OperandKey {
    pub fn new(instruction: Addr, operand_index: u8) -> Self {
        Self {
            instruction,
            operand_index,
        }
    }
}

impl fmt::Display for OperandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.instruction, self.operand_index)
    }
}

/// What an operand's address denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolBindingTarget {
    /// Start of a recovered block.
    Block(Addr),
    /// A byte inside a recovered data object.
    Data { object_start: Addr, offset: u64 },
    /// An externally supplied symbol, by index into the image's table.
    Symbol(usize),
    /// A plain constant; the address matched nothing in the image.
    Constant(u64),
    /// Indirect operand; statically unresolved.
    UnresolvedIndirect,
}

impl SymbolBindingTarget {
    /// Whether this binding marks an unresolved indirect operand.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, SymbolBindingTarget::UnresolvedIndirect)
    }
}

impl fmt::Display for SymbolBindingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolBindingTarget::Block(a) => write!(f, "block {}", a),
            SymbolBindingTarget::Data {
                object_start,
                offset,
            } => write!(f, "data {}+{}", object_start, offset),
            SymbolBindingTarget::Symbol(i) => write!(f, "symbol #{}", i),
            SymbolBindingTarget::Constant(v) => write!(f, "const {:#x}", v),
            SymbolBindingTarget::UnresolvedIndirect => write!(f, "unresolved-indirect"),
        }
    }
}

/// One symbolized operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolicExpression {
    /// Which operand this expression re-expresses.
    pub operand: OperandKey,
    /// What the operand's address denotes.
    pub target: SymbolBindingTarget,
}

impl SymbolicExpression {
    pub fn new(operand: OperandKey, target: SymbolBindingTarget) -> Self {
        Self { operand, target }
    }
}

impl fmt::Display for SymbolicExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.operand, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_keys_order_by_address_then_index() {
        let a = OperandKey::new(Addr(0x1000), 0);
        let b = OperandKey::new(Addr(0x1000), 1);
        let c = OperandKey::new(Addr(0x1005), 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn unresolved_flagging() {
        assert!(SymbolBindingTarget::UnresolvedIndirect.is_unresolved());
        assert!(!SymbolBindingTarget::Constant(7).is_unresolved());
    }

    #[test]
    fn display_format() {
        let e = SymbolicExpression::new(
            OperandKey::new(Addr(0x1000), 0),
            SymbolBindingTarget::Data {
                object_start: Addr(0x2000),
                offset: 8,
            },
        );
        assert_eq!(format!("{}", e), "0x1000#0 => data 0x2000+8");
    }
}
