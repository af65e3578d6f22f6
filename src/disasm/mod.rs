//! Candidate decoding: the trait seam between the engine and the decoder.
//!
//! The engine never talks to a disassembler library directly; it goes
//! through [`CandidateDecoder`], which decodes exactly one candidate at one
//! address. Decoding is pure: same bytes, same address, same result.
//!
//! Always-on backend:
//! - iced-x86 for x86/x64

pub mod iced;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::Addr;
use crate::core::instruction::CandidateInstruction;
use crate::error::{Result, ScathaError};

/// Errors from decoding a single candidate.
///
/// These are per-address outcomes, not engine failures: the superset
/// builder records them as invalid slots and moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodeError {
    /// The bytes do not encode any instruction.
    InvalidInstruction,
    /// The buffer ends before the instruction does.
    InsufficientBytes,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidInstruction => write!(f, "InvalidInstruction"),
            DecodeError::InsufficientBytes => write!(f, "InsufficientBytes"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Result type for single-candidate decoding.
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Architectures the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    /// x86 (32-bit)
    X86,
    /// x86-64 (64-bit)
    X86_64,
    /// ARM64/AArch64; no decoder backend wired up.
    ARM64,
}

impl Architecture {
    /// Address size in bits.
    pub fn address_bits(&self) -> u8 {
        match self {
            Architecture::X86 => 32,
            Architecture::X86_64 => 64,
            Architecture::ARM64 => 64,
        }
    }

    /// Pointer width in bytes, for data-cell scanning.
    pub fn pointer_bytes(&self) -> u64 {
        (self.address_bits() / 8) as u64
    }

    pub fn is_64_bit(&self) -> bool {
        self.address_bits() == 64
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86 => write!(f, "x86"),
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::ARM64 => write!(f, "arm64"),
        }
    }
}

/// Decodes one candidate instruction at one address.
///
/// Implementations must be pure functions of `(addr, bytes)`; the superset
/// builder calls them from many threads at once.
pub trait CandidateDecoder: Send + Sync {
    /// Decode the candidate starting at `addr` from `bytes`.
    ///
    /// `bytes` runs from `addr` to the end of its range; the decoder reads
    /// at most [`max_instruction_len`](Self::max_instruction_len) of them.
    fn decode(&self, addr: Addr, bytes: &[u8]) -> DecodeResult<CandidateInstruction>;

    /// Longest possible instruction encoding, in bytes.
    fn max_instruction_len(&self) -> usize;

    /// The architecture this decoder handles.
    fn architecture(&self) -> Architecture;
}

/// Select the decoder backend for `arch`.
pub fn decoder_for(arch: Architecture) -> Result<Box<dyn CandidateDecoder>> {
    match arch {
        Architecture::X86 | Architecture::X86_64 => Ok(Box::new(iced::IcedDecoder::new(arch))),
        Architecture::ARM64 => Err(ScathaError::UnsupportedArchitecture(arch.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_widths() {
        assert_eq!(Architecture::X86.address_bits(), 32);
        assert_eq!(Architecture::X86_64.pointer_bytes(), 8);
        assert!(Architecture::X86_64.is_64_bit());
        assert!(!Architecture::X86.is_64_bit());
    }

    #[test]
    fn decoder_selection() {
        assert!(decoder_for(Architecture::X86_64).is_ok());
        assert!(matches!(
            decoder_for(Architecture::ARM64),
            Err(ScathaError::UnsupportedArchitecture(_))
        ));
    }
}
