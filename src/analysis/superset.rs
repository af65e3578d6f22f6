//! Superset construction: one decode attempt at every code-eligible byte.
//!
//! The table is dense over the image span, one slot per byte offset.
//! Slots are written exactly once, in parallel over disjoint chunks, and
//! the table is frozen afterwards. Conflict relations are derived from
//! slot geometry on demand; there is no materialized pair list.

use rayon::prelude::*;
use tracing::debug;

use crate::core::address::Addr;
use crate::core::image::LoadedImage;
use crate::core::instruction::CandidateInstruction;
use crate::disasm::{CandidateDecoder, DecodeError};

/// Per-byte decode outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeSlot {
    /// A successful decoding starting at this byte.
    Candidate(CandidateInstruction),
    /// Decode failed here; recorded so neighbors are unaffected.
    Invalid,
    /// Byte is not in any code-eligible range (gap or data-only).
    NotCode,
}

/// Dense decode table over the whole image span.
pub struct SupersetTable {
    base: Addr,
    slots: Vec<DecodeSlot>,
    max_instruction_len: usize,
}

// Slot chunk size for parallel decoding; each worker owns whole chunks.
const DECODE_CHUNK: usize = 4096;

impl SupersetTable {
    /// Decode a candidate at every byte of every code-eligible range.
    ///
    /// Decoding is per-slot independent; a failure at one address never
    /// affects its neighbors.
    pub fn build(image: &LoadedImage, decoder: &dyn CandidateDecoder) -> Self {
        let span = image.span() as usize;
        let mut slots = vec![DecodeSlot::NotCode; span];
        for loaded in image.ranges() {
            if !loaded.range.perms.is_code_eligible() {
                continue;
            }
            let lo = (loaded.range.start.0 - image.low_addr().0) as usize;
            let hi = lo + loaded.range.size as usize;
            let range_start = loaded.range.start;
            let bytes = &loaded.bytes;
            slots[lo..hi]
                .par_chunks_mut(DECODE_CHUNK)
                .enumerate()
                .for_each(|(chunk_idx, chunk)| {
                    let chunk_base = chunk_idx * DECODE_CHUNK;
                    for (i, slot) in chunk.iter_mut().enumerate() {
                        let off = chunk_base + i;
                        let addr = Addr(range_start.0 + off as u64);
                        *slot = match decoder.decode(addr, &bytes[off..]) {
                            Ok(ins) => DecodeSlot::Candidate(ins),
                            Err(DecodeError::InvalidInstruction)
                            | Err(DecodeError::InsufficientBytes) => DecodeSlot::Invalid,
                        };
                    }
                });
        }
        let table = Self {
            base: image.low_addr(),
            slots,
            max_instruction_len: decoder.max_instruction_len(),
        };
        debug!(
            candidates = table.candidate_count(),
            invalid = table.invalid_count(),
            "superset table built"
        );
        table
    }

    /// Base address of slot 0.
    pub fn base(&self) -> Addr {
        self.base
    }

    /// Number of slots (the image span).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Longest instruction encoding the decoder can produce.
    pub fn max_instruction_len(&self) -> usize {
        self.max_instruction_len
    }

    fn index_of(&self, addr: Addr) -> Option<usize> {
        if addr < self.base {
            return None;
        }
        let idx = (addr.0 - self.base.0) as usize;
        (idx < self.slots.len()).then_some(idx)
    }

    /// The slot at `addr`; `NotCode` for addresses outside the span.
    pub fn slot_at(&self, addr: Addr) -> &DecodeSlot {
        self.index_of(addr)
            .map(|i| &self.slots[i])
            .unwrap_or(&DecodeSlot::NotCode)
    }

    /// The candidate starting at `addr`, if one decoded there.
    pub fn candidate_at(&self, addr: Addr) -> Option<&CandidateInstruction> {
        match self.slot_at(addr) {
            DecodeSlot::Candidate(ins) => Some(ins),
            _ => None,
        }
    }

    /// All candidates in ascending address order.
    pub fn candidates(&self) -> impl Iterator<Item = &CandidateInstruction> {
        self.slots.iter().filter_map(|s| match s {
            DecodeSlot::Candidate(ins) => Some(ins),
            _ => None,
        })
    }

    /// Successful decodings in the table.
    pub fn candidate_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, DecodeSlot::Candidate(_)))
            .count()
    }

    /// Explicit decode failures in the table.
    pub fn invalid_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, DecodeSlot::Invalid))
            .count()
    }

    /// Start addresses of candidates whose byte ranges overlap `ins`
    /// without coinciding. Derived from slot geometry: overlap can only
    /// come from starts within one max instruction length before `ins`
    /// or from starts strictly inside it.
    pub fn conflicting_starts(&self, ins: &CandidateInstruction) -> Vec<Addr> {
        let mut out = Vec::new();
        let lo = ins.address.0.saturating_sub(self.max_instruction_len as u64 - 1);
        for a in lo..ins.end().0 {
            let addr = Addr(a);
            if addr == ins.address {
                continue;
            }
            if let Some(other) = self.candidate_at(addr) {
                if ins.conflicts_with(other) {
                    out.push(addr);
                }
            }
        }
        out
    }
}

/// Statically invalid candidate starts, computed before reachability.
///
/// A candidate is statically invalid when its direct transfer target
/// cannot be code (out of image, not code-eligible, or itself invalid),
/// or when it must fall through into such an address. The poisoning is
/// transitive, so the set is a fixpoint of its own; it depends only on
/// the frozen table, never on reachability.
pub struct StaticInvalidSet {
    base: Addr,
    bits: Vec<bool>,
}

impl StaticInvalidSet {
    pub fn compute(table: &SupersetTable, image: &LoadedImage) -> Self {
        let mut set = Self {
            base: table.base(),
            bits: vec![false; table.len()],
        };
        // Sweep to fixpoint. Each sweep only sets bits, so the loop
        // terminates after at most `len` rounds; in practice invalidation
        // chains are short and a handful of sweeps suffice.
        let mut changed = true;
        let mut rounds = 0usize;
        while changed {
            changed = false;
            rounds += 1;
            for idx in (0..table.len()).rev() {
                if set.bits[idx] {
                    continue;
                }
                let addr = Addr(set.base.0 + idx as u64);
                let ins = match table.candidate_at(addr) {
                    Some(ins) => ins,
                    None => continue,
                };
                if set.candidate_is_invalid(ins, table, image) {
                    set.bits[idx] = true;
                    changed = true;
                }
            }
        }
        debug!(
            invalidated = set.count(),
            rounds, "static invalidation converged"
        );
        set
    }

    fn candidate_is_invalid(
        &self,
        ins: &CandidateInstruction,
        table: &SupersetTable,
        image: &LoadedImage,
    ) -> bool {
        if let Some(target) = ins.direct_target() {
            if !self.transfer_ok(target, table, image) {
                return true;
            }
        }
        if ins.class.falls_through() && !self.transfer_ok(ins.end(), table, image) {
            return true;
        }
        false
    }

    /// Whether control can legitimately arrive at `addr`.
    fn transfer_ok(&self, addr: Addr, table: &SupersetTable, image: &LoadedImage) -> bool {
        if !image.is_code_addr(addr) {
            return false;
        }
        match table.slot_at(addr) {
            DecodeSlot::Candidate(_) => !self.is_invalid(addr),
            _ => false,
        }
    }

    /// Whether the candidate starting at `addr` is statically invalid.
    pub fn is_invalid(&self, addr: Addr) -> bool {
        if addr < self.base {
            return false;
        }
        let idx = (addr.0 - self.base.0) as usize;
        self.bits.get(idx).copied().unwrap_or(false)
    }

    /// Number of invalidated candidate starts.
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }
}
