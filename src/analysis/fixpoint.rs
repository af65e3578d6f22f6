//! Monotone reachability fixpoint over the superset table.
//!
//! Facts only ever accumulate, so the least fixpoint exists and is
//! independent of evaluation order. Rounds propose new facts in parallel
//! from a read-only snapshot; proposals are merged at a barrier by set
//! union, which is commutative, so the worker count cannot change the
//! converged table.

use rayon::prelude::*;
use std::time::Instant;
use tracing::{debug, info};

use crate::analysis::facts::{FactSet, FactTable, ReachabilitySet};
use crate::analysis::superset::{StaticInvalidSet, SupersetTable};
use crate::core::address::Addr;
use crate::core::image::LoadedImage;
use crate::core::instruction::{AddressingMode, InstructionClass};
use crate::error::{Result, ScathaError};

/// Converged fixpoint output.
pub struct FixpointOutcome {
    pub facts: FactTable,
    pub reachable: ReachabilitySet,
    pub rounds: usize,
}

// Frontier chunk size for one worker's share of a round.
const ROUND_CHUNK: usize = 1024;

/// Run seeding and reachability propagation to convergence.
pub fn run(
    image: &LoadedImage,
    table: &SupersetTable,
    invalid: &StaticInvalidSet,
    deadline: Option<Instant>,
) -> Result<FixpointOutcome> {
    let started = Instant::now();
    let mut facts = FactTable::new(image.low_addr(), table.len());

    // Stratum 0: decode validity, already computed against the frozen table.
    for ins in table.candidates() {
        if invalid.is_invalid(ins.address) {
            facts.set(ins.address, FactSet::STATIC_INVALID);
        } else {
            facts.set(ins.address, FactSet::VALID_START);
        }
    }

    let mut frontier = seed(image, table, &mut facts);
    let mut rounds = 0usize;

    while !frontier.is_empty() {
        check_deadline(deadline, started)?;
        rounds += 1;

        let batches: Vec<Vec<(Addr, FactSet)>> = frontier
            .par_chunks(ROUND_CHUNK)
            .map(|chunk| {
                let mut out = Vec::new();
                for &addr in chunk {
                    propose(addr, image, table, &facts, &mut out);
                }
                out
            })
            .collect();

        let mut next = Vec::new();
        for (addr, new_facts) in batches.into_iter().flatten() {
            if facts.set(addr, new_facts) && new_facts.contains(FactSet::REACHABLE) {
                next.push(addr);
            }
        }
        next.sort();
        next.dedup();
        debug!(round = rounds, frontier = next.len(), "fixpoint round merged");
        frontier = next;
    }

    let reachable = ReachabilitySet::from_table(&facts);
    info!(
        rounds,
        reachable = reachable.len(),
        fact_bits = facts.total_bits(),
        "fixpoint converged"
    );
    Ok(FixpointOutcome {
        facts,
        reachable,
        rounds,
    })
}

/// Plant seed facts and return the initial frontier.
///
/// Seeds: the entry point, loader symbols, resolved relocation targets,
/// and absolute-constant operands of decoded candidates. The speculative
/// operand seeds only take when the referenced address itself decodes as
/// a statically valid candidate.
fn seed(image: &LoadedImage, table: &SupersetTable, facts: &mut FactTable) -> Vec<Addr> {
    fn plant(addr: Addr, facts: &mut FactTable, frontier: &mut Vec<Addr>) {
        facts.set(addr, FactSet::SEED);
        if facts.contains(addr, FactSet::VALID_START) && facts.set(addr, FactSet::REACHABLE) {
            frontier.push(addr);
        }
    }

    let mut frontier = Vec::new();
    plant(image.entry(), facts, &mut frontier);
    for sym in image.symbols() {
        plant(sym.address, facts, &mut frontier);
    }
    for reloc in image.relocations() {
        if let Some(target) = reloc.target {
            plant(target, facts, &mut frontier);
        }
    }
    for ins in table.candidates() {
        for op in &ins.operands {
            if op.mode != AddressingMode::Absolute {
                continue;
            }
            if let Some(target) = op.target {
                if facts.contains(target, FactSet::VALID_START) {
                    plant(target, facts, &mut frontier);
                } else if image.is_data_addr(target) {
                    facts.set(target, FactSet::DATA_REFERENCED);
                }
            }
        }
    }

    frontier.sort();
    frontier.dedup();
    debug!(seeds = frontier.len(), "seeding complete");
    frontier
}

/// Propose facts derivable from one reachable candidate.
///
/// Pure reader of the current table snapshot; all writes go through the
/// caller's merge.
fn propose(
    addr: Addr,
    image: &LoadedImage,
    table: &SupersetTable,
    facts: &FactTable,
    out: &mut Vec<(Addr, FactSet)>,
) {
    let ins = match table.candidate_at(addr) {
        Some(ins) => ins,
        None => return,
    };
    if ins.class.falls_through() {
        let next = ins.end();
        if facts.contains(next, FactSet::VALID_START) {
            out.push((next, FactSet::REACHABLE));
        }
    }
    if let Some(target) = ins.direct_target() {
        if facts.contains(target, FactSet::VALID_START) {
            let mut new = FactSet::REACHABLE;
            if ins.class == InstructionClass::Call {
                new = new | FactSet::CALL_TARGET;
            }
            out.push((target, new));
        }
    }
    for op in &ins.operands {
        let target = match (op.mode, op.target) {
            (AddressingMode::Absolute | AddressingMode::PcRelative, Some(t)) => t,
            _ => continue,
        };
        if image.is_data_addr(target) {
            out.push((target, FactSet::DATA_REFERENCED));
        }
    }
}

fn check_deadline(deadline: Option<Instant>, started: Instant) -> Result<()> {
    if let Some(d) = deadline {
        if Instant::now() >= d {
            return Err(ScathaError::BudgetExceeded {
                phase: "fixpoint",
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::image::LoadedRange;
    use crate::core::range::{ByteRange, RangePerms};
    use crate::disasm::iced::IcedDecoder;
    use crate::disasm::Architecture;

    fn image(bytes: Vec<u8>) -> LoadedImage {
        let size = bytes.len() as u64;
        LoadedImage::new(
            vec![LoadedRange::new(
                ByteRange::new(Addr(0x1000), size, RangePerms::CODE, ".text"),
                bytes,
            )],
            Vec::new(),
            Vec::new(),
            Addr(0x1000),
        )
        .unwrap()
    }

    fn converge(img: &LoadedImage) -> FixpointOutcome {
        let table = SupersetTable::build(img, &IcedDecoder::new(Architecture::X86_64));
        let invalid = StaticInvalidSet::compute(&table, img);
        run(img, &table, &invalid, None).unwrap()
    }

    #[test]
    fn entry_reaches_straight_line_code() {
        // nop; nop; ret
        let img = image(vec![0x90, 0x90, 0xc3]);
        let out = converge(&img);
        assert!(out.reachable.is_reachable(Addr(0x1000)));
        assert!(out.reachable.is_reachable(Addr(0x1001)));
        assert!(out.reachable.is_reachable(Addr(0x1002)));
    }

    #[test]
    fn nothing_propagates_past_a_return() {
        // ret; nop -- the nop is valid but unreached
        let img = image(vec![0xc3, 0x90]);
        let out = converge(&img);
        assert!(out.reachable.is_reachable(Addr(0x1000)));
        assert!(!out.reachable.is_reachable(Addr(0x1001)));
        assert!(out.facts.contains(Addr(0x1001), FactSet::VALID_START));
    }

    #[test]
    fn call_target_gets_marked() {
        // call +2; ret; ret  (call lands on the second ret)
        let img = image(vec![0xe8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0xc3]);
        let out = converge(&img);
        assert!(out.reachable.is_reachable(Addr(0x1006)));
        assert!(out.facts.contains(Addr(0x1006), FactSet::CALL_TARGET));
        // call falls through to its return site as well
        assert!(out.reachable.is_reachable(Addr(0x1005)));
    }

    #[test]
    fn conditional_branch_reaches_both_sides() {
        // je +1; ret; ret
        let img = image(vec![0x74, 0x01, 0xc3, 0xc3]);
        let out = converge(&img);
        assert!(out.reachable.is_reachable(Addr(0x1002)));
        assert!(out.reachable.is_reachable(Addr(0x1003)));
    }

    #[test]
    fn indirect_targets_are_not_guessed() {
        // jmp rax; ret -- the ret is valid but nothing reaches it
        let img = image(vec![0xff, 0xe0, 0xc3]);
        let out = converge(&img);
        assert!(out.reachable.is_reachable(Addr(0x1000)));
        assert!(!out.reachable.is_reachable(Addr(0x1002)));
    }

    #[test]
    fn symbol_seeds_reach_otherwise_dead_code() {
        use crate::core::symbol::{Symbol, SymbolBinding, SymbolKind};
        let bytes = vec![0xc3, 0x90, 0xc3];
        let size = bytes.len() as u64;
        let img = LoadedImage::new(
            vec![LoadedRange::new(
                ByteRange::new(Addr(0x1000), size, RangePerms::CODE, ".text"),
                bytes,
            )],
            vec![Symbol::new(
                "helper",
                Addr(0x1001),
                SymbolKind::Function,
                SymbolBinding::Global,
            )],
            Vec::new(),
            Addr(0x1000),
        )
        .unwrap();
        let out = converge(&img);
        assert!(out.reachable.is_reachable(Addr(0x1001)));
        assert!(out.facts.contains(Addr(0x1001), FactSet::SEED));
    }

    #[test]
    fn data_references_are_hints_not_code() {
        // mov eax, [0x2000] with a data range at 0x2000
        // a1 is mov eax, moffs32 in 32-bit; use 64-bit absolute form:
        // 8b 04 25 00 20 00 00  mov eax, [0x2000]
        let code = vec![0x8b, 0x04, 0x25, 0x00, 0x20, 0x00, 0x00, 0xc3];
        let size = code.len() as u64;
        let img = LoadedImage::new(
            vec![
                LoadedRange::new(
                    ByteRange::new(Addr(0x1000), size, RangePerms::CODE, ".text"),
                    code,
                ),
                LoadedRange::new(
                    ByteRange::new(Addr(0x2000), 8, RangePerms::DATA, ".data"),
                    vec![0; 8],
                ),
            ],
            Vec::new(),
            Vec::new(),
            Addr(0x1000),
        )
        .unwrap();
        let out = converge(&img);
        assert!(out.facts.contains(Addr(0x2000), FactSet::DATA_REFERENCED));
        assert!(!out.reachable.is_reachable(Addr(0x2000)));
    }

    #[test]
    fn reachable_set_grows_monotonically_with_more_seeds() {
        let bytes = vec![0xc3, 0x90, 0x90, 0xc3];
        let img_plain = image(bytes.clone());
        let base = converge(&img_plain);

        use crate::core::symbol::{Symbol, SymbolBinding, SymbolKind};
        let size = bytes.len() as u64;
        let img_seeded = LoadedImage::new(
            vec![LoadedRange::new(
                ByteRange::new(Addr(0x1000), size, RangePerms::CODE, ".text"),
                bytes,
            )],
            vec![Symbol::new(
                "extra",
                Addr(0x1001),
                SymbolKind::Function,
                SymbolBinding::Local,
            )],
            Vec::new(),
            Addr(0x1000),
        )
        .unwrap();
        let seeded = converge(&img_seeded);

        for addr in base.reachable.iter() {
            assert!(seeded.reachable.is_reachable(addr));
        }
        assert!(seeded.reachable.len() > base.reachable.len());
    }
}
