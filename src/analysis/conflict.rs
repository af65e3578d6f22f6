//! Stratified conflict resolution.
//!
//! Runs exactly once, after the monotone fixpoint has converged, against
//! the frozen `ReachabilitySet`. Mutually overlapping reachable candidates
//! are grouped into connected components and thinned by a fixed tie-break
//! tuple until no overlaps remain. The resolver never writes back into the
//! fact table; its only output is the `SelectedSet`.

use std::cmp::Reverse;
use tracing::{debug, info};

use crate::analysis::facts::{FactSet, FactTable, ReachabilitySet};
use crate::analysis::superset::SupersetTable;
use crate::core::address::Addr;
use crate::core::instruction::CandidateInstruction;

/// Fallthrough steps the lookahead score may walk.
const LOOKAHEAD_BOUND: usize = 64;

/// The conflict-free final selection of instruction starts.
pub struct SelectedSet {
    base: Addr,
    bits: Vec<bool>,
    discarded: usize,
}

impl SelectedSet {
    pub fn is_selected(&self, addr: Addr) -> bool {
        if addr < self.base {
            return false;
        }
        let idx = (addr.0 - self.base.0) as usize;
        self.bits.get(idx).copied().unwrap_or(false)
    }

    /// Selected starts in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Addr> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(move |(i, b)| b.then(|| Addr(self.base.0 + i as u64)))
    }

    pub fn len(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.bits.iter().any(|b| *b)
    }

    /// Reachable candidates dropped to resolve overlaps.
    pub fn discarded_count(&self) -> usize {
        self.discarded
    }
}

/// Resolves overlap conflicts among reachable candidates.
pub struct ConflictResolver<'a> {
    table: &'a SupersetTable,
    facts: &'a FactTable,
    reachable: &'a ReachabilitySet,
    /// Reachable direct/fallthrough predecessors per dense index.
    predecessors: Vec<Vec<Addr>>,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(
        table: &'a SupersetTable,
        facts: &'a FactTable,
        reachable: &'a ReachabilitySet,
    ) -> Self {
        let mut predecessors = vec![Vec::new(); table.len()];
        let base = table.base();
        for addr in reachable.iter() {
            let ins = match table.candidate_at(addr) {
                Some(ins) => ins,
                None => continue,
            };
            let mut record = |target: Addr| {
                if target >= base {
                    let idx = (target.0 - base.0) as usize;
                    if let Some(preds) = predecessors.get_mut(idx) {
                        preds.push(addr);
                    }
                }
            };
            if ins.class.falls_through() {
                record(ins.end());
            }
            if let Some(target) = ins.direct_target() {
                record(target);
            }
        }
        Self {
            table,
            facts,
            reachable,
            predecessors,
        }
    }

    /// Produce the conflict-free selection.
    pub fn resolve(&self) -> SelectedSet {
        let mut selected = SelectedSet {
            base: self.table.base(),
            bits: vec![false; self.table.len()],
            discarded: 0,
        };

        let candidates: Vec<&CandidateInstruction> = self
            .reachable
            .iter()
            .filter_map(|addr| self.table.candidate_at(addr))
            .collect();

        // Connected components of the overlap graph. Candidates are
        // sorted by start, so a component extends exactly while the next
        // start lies before the furthest end seen so far.
        let mut component: Vec<&CandidateInstruction> = Vec::new();
        let mut component_end = Addr(0);
        let mut components = 0usize;
        for ins in candidates {
            if !component.is_empty() && ins.address < component_end {
                component.push(ins);
                component_end = component_end.max(ins.end());
                continue;
            }
            if !component.is_empty() {
                self.thin_component(&component, &mut selected);
                components += 1;
            }
            component_end = ins.end();
            component = vec![ins];
        }
        if !component.is_empty() {
            self.thin_component(&component, &mut selected);
            components += 1;
        }

        info!(
            selected = selected.len(),
            discarded = selected.discarded,
            components,
            "conflict resolution done"
        );
        selected
    }

    /// Greedy thinning of one component: repeatedly keep the best
    /// candidate and drop everything still overlapping it.
    fn thin_component(&self, component: &[&CandidateInstruction], selected: &mut SelectedSet) {
        if component.len() == 1 {
            self.mark(component[0].address, selected);
            return;
        }
        debug!(
            start = %component[0].address,
            size = component.len(),
            "thinning conflict component"
        );
        // Component membership, sorted by construction.
        let members: Vec<Addr> = component.iter().map(|ins| ins.address).collect();
        let mut alive: Vec<(&CandidateInstruction, (u32, u8, u32, Reverse<Addr>))> = component
            .iter()
            .map(|ins| (*ins, self.score(ins, &members)))
            .collect();
        while !alive.is_empty() {
            // Addresses are unique, so the score tuple is a total order
            // and the maximum is unambiguous.
            let best = alive
                .iter()
                .enumerate()
                .max_by_key(|(_, (_, score))| *score)
                .map(|(i, _)| i)
                .unwrap_or(0);
            let winner = alive.remove(best).0;
            self.mark(winner.address, selected);
            let before = alive.len();
            alive.retain(|(ins, _)| !ins.conflicts_with(winner));
            selected.discarded += before - alive.len();
        }
    }

    fn mark(&self, addr: Addr, selected: &mut SelectedSet) {
        let idx = (addr.0 - selected.base.0) as usize;
        selected.bits[idx] = true;
    }

    /// Tie-break tuple: corroboration, seed alignment, conflict-free
    /// lookahead, then lowest address. Pure function of frozen inputs.
    ///
    /// Corroboration counts only predecessors from outside the conflict
    /// component; paths inside the cluster are not independent evidence.
    fn score(&self, ins: &CandidateInstruction, members: &[Addr]) -> (u32, u8, u32, Reverse<Addr>) {
        let idx = (ins.address.0 - self.table.base().0) as usize;
        let corroboration = self
            .predecessors
            .get(idx)
            .map(|preds| {
                preds
                    .iter()
                    .filter(|p| members.binary_search(p).is_err())
                    .count() as u32
            })
            .unwrap_or(0);
        let seed = u8::from(self.facts.contains(ins.address, FactSet::SEED));
        let lookahead = self.lookahead(ins);
        (corroboration, seed, lookahead, Reverse(ins.address))
    }

    /// Walk fallthrough successors counting instructions until a slot
    /// that fails to decode, was invalidated, or overlaps another
    /// reachable candidate outside the walked chain.
    fn lookahead(&self, ins: &CandidateInstruction) -> u32 {
        let mut visited: Vec<Addr> = Vec::with_capacity(LOOKAHEAD_BOUND);
        let mut count = 0u32;
        let mut cur = ins;
        for _ in 0..LOOKAHEAD_BOUND {
            visited.push(cur.address);
            count += 1;
            if !cur.class.falls_through() {
                break;
            }
            let next = match self.table.candidate_at(cur.end()) {
                Some(next) if self.facts.contains(next.address, FactSet::VALID_START) => next,
                _ => break,
            };
            let blocked = self
                .table
                .conflicting_starts(next)
                .into_iter()
                .any(|a| self.reachable.is_reachable(a) && !visited.contains(&a));
            if blocked {
                break;
            }
            cur = next;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::fixpoint;
    use crate::analysis::superset::StaticInvalidSet;
    use crate::core::image::{LoadedImage, LoadedRange};
    use crate::core::range::{ByteRange, RangePerms};
    use crate::core::symbol::{Symbol, SymbolBinding, SymbolKind};
    use crate::disasm::iced::IcedDecoder;
    use crate::disasm::Architecture;

    fn resolve(img: &LoadedImage) -> (SelectedSet, SupersetTable) {
        let table = SupersetTable::build(img, &IcedDecoder::new(Architecture::X86_64));
        let invalid = StaticInvalidSet::compute(&table, img);
        let out = fixpoint::run(img, &table, &invalid, None).unwrap();
        let selected = ConflictResolver::new(&table, &out.facts, &out.reachable).resolve();
        (selected, table)
    }

    fn image_with_symbols(bytes: Vec<u8>, symbols: Vec<Symbol>) -> LoadedImage {
        let size = bytes.len() as u64;
        LoadedImage::new(
            vec![LoadedRange::new(
                ByteRange::new(Addr(0x1000), size, RangePerms::CODE, ".text"),
                bytes,
            )],
            symbols,
            Vec::new(),
            Addr(0x1000),
        )
        .unwrap()
    }

    #[test]
    fn non_conflicting_selection_is_untouched() {
        // nop; nop; ret -- one straight chain, nothing to thin
        let img = image_with_symbols(vec![0x90, 0x90, 0xc3], Vec::new());
        let (selected, _) = resolve(&img);
        assert_eq!(
            selected.iter().collect::<Vec<_>>(),
            vec![Addr(0x1000), Addr(0x1001), Addr(0x1002)]
        );
        assert_eq!(selected.discarded_count(), 0);
    }

    #[test]
    fn longer_clean_chain_beats_embedded_bytes() {
        // mov eax, 0x90909090; ret -- the imm bytes decode as nops and a
        // symbol makes one reachable, creating a real overlap
        let img = image_with_symbols(
            vec![0xb8, 0x90, 0x90, 0x90, 0x90, 0xc3],
            vec![Symbol::new(
                "phantom",
                Addr(0x1001),
                SymbolKind::Function,
                SymbolBinding::Local,
            )],
        );
        let (selected, _) = resolve(&img);
        assert!(selected.is_selected(Addr(0x1000)));
        assert!(!selected.is_selected(Addr(0x1001)));
        assert!(selected.is_selected(Addr(0x1005)));
        assert!(selected.discarded_count() > 0);
    }

    #[test]
    fn corroborated_target_beats_seeded_overlap() {
        // jmp 0x1007 corroborates the nop chain; the overlapping mov at
        // 0x1006 is only seed-aligned and loses
        let bytes = vec![
            0xeb, 0x05, // 0x1000 jmp 0x1007
            0x90, 0x90, 0x90, 0x90, // filler, unreachable
            0xb8, 0x90, 0x90, 0x90, 0x90, // 0x1006 mov eax, imm32
            0xc3, // 0x100b ret
        ];
        let img = image_with_symbols(
            bytes,
            vec![Symbol::new(
                "overlay",
                Addr(0x1006),
                SymbolKind::Function,
                SymbolBinding::Local,
            )],
        );
        let (selected, _) = resolve(&img);
        assert!(selected.is_selected(Addr(0x1007)));
        assert!(!selected.is_selected(Addr(0x1006)));
        assert!(selected.is_selected(Addr(0x100b)));
    }

    #[test]
    fn selection_has_no_overlaps() {
        let img = image_with_symbols(
            vec![0xb8, 0x90, 0x90, 0x90, 0x90, 0xc3],
            vec![Symbol::new(
                "phantom",
                Addr(0x1003),
                SymbolKind::Function,
                SymbolBinding::Local,
            )],
        );
        let (selected, table) = resolve(&img);
        let picked: Vec<_> = selected
            .iter()
            .filter_map(|a| table.candidate_at(a))
            .collect();
        for a in &picked {
            for b in &picked {
                assert!(!a.conflicts_with(b), "{} overlaps {}", a, b);
            }
        }
    }
}
