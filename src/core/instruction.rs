//! Candidate instruction and operand reference types.
//!
//! A `CandidateInstruction` is one *possible* decoding at one address. The
//! superset builder produces a candidate at every byte offset of every
//! code-eligible range; most of them are wrong, and the inference engine's
//! whole job is to keep a consistent subset. Candidates therefore stay
//! compact: the control-transfer class and the address-valued operands are
//! the only decoded detail the engine reasons about.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::Addr;

/// Closed classification of control-transfer behavior.
///
/// The set is fixed by the target architecture; exhaustive matches over it
/// are relied on throughout the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstructionClass {
    /// No control transfer; execution falls through.
    Ordinary,
    /// Unconditional direct branch.
    Branch,
    /// Conditional direct branch; falls through on the untaken side.
    CondBranch,
    /// Direct call; execution resumes at the return site.
    Call,
    /// Return; statically unresolved target, terminal.
    Return,
    /// Indirect branch through a register or memory.
    IndirectBranch,
    /// Indirect call through a register or memory.
    IndirectCall,
    /// Halts execution; no fallthrough.
    Halt,
}

impl InstructionClass {
    /// Whether execution can continue at the next sequential address.
    pub fn falls_through(&self) -> bool {
        match self {
            InstructionClass::Ordinary
            | InstructionClass::CondBranch
            | InstructionClass::Call
            | InstructionClass::IndirectCall => true,
            InstructionClass::Branch
            | InstructionClass::Return
            | InstructionClass::IndirectBranch
            | InstructionClass::Halt => false,
        }
    }

    /// Whether this class carries a statically known transfer target.
    pub fn has_direct_target(&self) -> bool {
        matches!(
            self,
            InstructionClass::Branch | InstructionClass::CondBranch | InstructionClass::Call
        )
    }

    /// Whether the transfer target is only known at run time.
    pub fn is_indirect(&self) -> bool {
        matches!(
            self,
            InstructionClass::IndirectBranch | InstructionClass::IndirectCall
        )
    }
}

impl fmt::Display for InstructionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstructionClass::Ordinary => "ordinary",
            InstructionClass::Branch => "branch",
            InstructionClass::CondBranch => "cond-branch",
            InstructionClass::Call => "call",
            InstructionClass::Return => "return",
            InstructionClass::IndirectBranch => "indirect-branch",
            InstructionClass::IndirectCall => "indirect-call",
            InstructionClass::Halt => "halt",
        };
        write!(f, "{}", s)
    }
}

/// Addressing mode of an address-valued operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressingMode {
    /// Absolute constant that denotes an address.
    Absolute,
    /// PC-relative displacement; resolved against the instruction end.
    PcRelative,
    /// Through a register; unresolved until run time.
    IndirectRegister,
}

impl fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressingMode::Absolute => write!(f, "absolute"),
            AddressingMode::PcRelative => write!(f, "pc-relative"),
            AddressingMode::IndirectRegister => write!(f, "indirect"),
        }
    }
}

/// One address-valued operand of a candidate instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandReference {
    /// Operand position within the instruction.
    pub index: u8,
    /// How the address is expressed.
    pub mode: AddressingMode,
    /// The referenced address; `None` for `IndirectRegister`.
    pub target: Option<Addr>,
}

impl OperandReference {
    pub fn absolute(index: u8, target: Addr) -> Self {
        Self {
            index,
            mode: AddressingMode::Absolute,
            target: Some(target),
        }
    }

    pub fn pc_relative(index: u8, target: Addr) -> Self {
        Self {
            index,
            mode: AddressingMode::PcRelative,
            target: Some(target),
        }
    }

    pub fn indirect(index: u8) -> Self {
        Self {
            index,
            mode: AddressingMode::IndirectRegister,
            target: None,
        }
    }
}

/// One possible decoding at one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInstruction {
    /// Starting address of this decoding.
    pub address: Addr,
    /// Encoded length in bytes; always > 0 for a successful decode.
    pub length: u8,
    /// Control-transfer classification.
    pub class: InstructionClass,
    /// Address-valued operands, in operand order.
    pub operands: Vec<OperandReference>,
}

impl CandidateInstruction {
    /// Address of the byte immediately after this instruction.
    pub fn end(&self) -> Addr {
        Addr(self.address.0 + self.length as u64)
    }

    /// The statically known transfer target, if the class carries one.
    pub fn direct_target(&self) -> Option<Addr> {
        if !self.class.has_direct_target() {
            return None;
        }
        self.operands.iter().find_map(|op| match op.mode {
            AddressingMode::Absolute | AddressingMode::PcRelative => op.target,
            AddressingMode::IndirectRegister => None,
        })
    }

    /// Whether the byte ranges of two candidates overlap without coinciding.
    pub fn conflicts_with(&self, other: &CandidateInstruction) -> bool {
        if self.address == other.address {
            return false;
        }
        self.address < other.end() && other.address < self.end()
    }
}

impl fmt::Display for CandidateInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} len={}", self.address, self.class, self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(addr: u64, len: u8, class: InstructionClass) -> CandidateInstruction {
        CandidateInstruction {
            address: Addr(addr),
            length: len,
            class,
            operands: Vec::new(),
        }
    }

    #[test]
    fn fallthrough_classes() {
        assert!(InstructionClass::Ordinary.falls_through());
        assert!(InstructionClass::CondBranch.falls_through());
        assert!(InstructionClass::Call.falls_through());
        assert!(!InstructionClass::Branch.falls_through());
        assert!(!InstructionClass::Return.falls_through());
        assert!(!InstructionClass::Halt.falls_through());
    }

    #[test]
    fn direct_target_extraction() {
        let mut ins = candidate(0x1000, 5, InstructionClass::Call);
        ins.operands.push(OperandReference::pc_relative(0, Addr(0x2000)));
        assert_eq!(ins.direct_target(), Some(Addr(0x2000)));

        let mut ind = candidate(0x1000, 2, InstructionClass::IndirectCall);
        ind.operands.push(OperandReference::indirect(0));
        assert_eq!(ind.direct_target(), None);
    }

    #[test]
    fn overlap_is_conflict_unless_coincident() {
        let a = candidate(0x1000, 4, InstructionClass::Ordinary);
        let b = candidate(0x1002, 4, InstructionClass::Ordinary);
        let c = candidate(0x1004, 4, InstructionClass::Ordinary);
        assert!(a.conflicts_with(&b));
        assert!(b.conflicts_with(&a));
        assert!(!a.conflicts_with(&c));
        assert!(!a.conflicts_with(&a.clone()));
    }

    #[test]
    fn end_address() {
        let a = candidate(0x1000, 3, InstructionClass::Ordinary);
        assert_eq!(a.end(), Addr(0x1003));
    }
}
