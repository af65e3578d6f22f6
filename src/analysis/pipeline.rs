//! Recovery pipeline: from a loaded image to the immutable snapshot.
//!
//! Phases run in a fixed order with a deadline check at every barrier:
//! superset decode, static invalidation, reachability fixpoint, conflict
//! resolution, block construction, then symbolization and data inference
//! side by side. All parallelism lives inside a dedicated worker pool
//! whose size must never change the output.

use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span};

use crate::analysis::blocks;
use crate::analysis::conflict::ConflictResolver;
use crate::analysis::data_objects;
use crate::analysis::fixpoint;
use crate::analysis::superset::{StaticInvalidSet, SupersetTable};
use crate::analysis::symbolize::{self, ProvisionalBinding, ProvisionalExpression};
use crate::core::address::Addr;
use crate::core::data_object::DataObject;
use crate::core::edge::{Edge, EdgeKind};
use crate::core::image::LoadedImage;
use crate::core::result::{RecoveredProgram, RecoveryStats};
use crate::core::symbolic::{SymbolBindingTarget, SymbolicExpression};
use crate::disasm::{decoder_for, Architecture, CandidateDecoder};
use crate::error::{Result, ScathaError};

/// Largest dense image span accepted by default.
const DEFAULT_MAX_IMAGE_SPAN: u64 = 1 << 30;

/// Tunables for one recovery run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Instruction set of the image.
    pub architecture: Architecture,
    /// Worker threads; 0 takes the rayon default.
    pub threads: usize,
    /// Wall-clock budget for the whole run.
    pub time_budget: Option<Duration>,
    /// Largest dense image span accepted, in bytes.
    pub max_image_span: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::X86_64,
            threads: 0,
            time_budget: None,
            max_image_span: DEFAULT_MAX_IMAGE_SPAN,
        }
    }
}

/// Run the full recovery pipeline.
pub fn recover(image: &LoadedImage, config: &RecoveryConfig) -> Result<RecoveredProgram> {
    if image.span() > config.max_image_span {
        return Err(ScathaError::MalformedImage {
            reason: format!(
                "image span {} exceeds the configured maximum {}",
                image.span(),
                config.max_image_span
            ),
        });
    }
    let decoder = decoder_for(config.architecture)?;
    let pool = ThreadPoolBuilder::new()
        .num_threads(config.threads)
        .build()
        .map_err(|e| ScathaError::Internal(format!("worker pool: {e}")))?;
    let started = Instant::now();
    let deadline = config.time_budget.map(|b| started + b);
    pool.install(|| run_phases(image, config, decoder.as_ref(), started, deadline))
}

fn run_phases(
    image: &LoadedImage,
    config: &RecoveryConfig,
    decoder: &dyn CandidateDecoder,
    started: Instant,
    deadline: Option<Instant>,
) -> Result<RecoveredProgram> {
    let _span = info_span!("recover", arch = %config.architecture).entered();

    let table = SupersetTable::build(image, decoder);
    barrier("superset", started, deadline)?;

    let invalid = StaticInvalidSet::compute(&table, image);
    barrier("static-invalid", started, deadline)?;

    let fix = fixpoint::run(image, &table, &invalid, deadline)?;
    barrier("fixpoint", started, deadline)?;

    let selected = ConflictResolver::new(&table, &fix.facts, &fix.reachable).resolve();
    barrier("conflict", started, deadline)?;

    let built = blocks::build(&table, &selected);
    barrier("blocks", started, deadline)?;

    let (sym, objects) = rayon::join(
        || symbolize::run(image, &table, &selected, &fix.facts, &built.blocks),
        || {
            data_objects::run(
                image,
                &table,
                &selected,
                &fix.facts,
                config.architecture.pointer_bytes(),
            )
        },
    );
    barrier("symbolize", started, deadline)?;

    let expressions = resolve_expressions(image, &objects, sym.expressions);
    let mut labels = sym.labels;
    for obj in &objects {
        let name = match image.symbol_at(obj.start) {
            Some(s) => s.name.clone(),
            None => format!("data_{:x}", obj.start.0),
        };
        labels.insert(obj.start, name);
    }
    let undecidable = collect_undecidable(&built.edges, &expressions);

    let stats = RecoveryStats {
        candidate_count: table.candidate_count(),
        invalid_slot_count: table.invalid_count(),
        static_invalid_count: invalid.count(),
        fact_count: fix.facts.total_bits(),
        fixpoint_rounds: fix.rounds,
        conflicts_resolved: selected.discarded_count(),
        selected_count: selected.len(),
        block_count: built.blocks.len(),
        edge_count: built.edges.len(),
        data_object_count: objects.len(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        blocks = stats.block_count,
        edges = stats.edge_count,
        data_objects = stats.data_object_count,
        elapsed_ms = stats.elapsed_ms,
        "recovery complete"
    );
    Ok(RecoveredProgram::new(
        built.blocks,
        built.edges,
        objects,
        expressions,
        labels,
        undecidable,
        stats,
    ))
}

/// Deadline check at a phase boundary.
fn barrier(phase: &'static str, started: Instant, deadline: Option<Instant>) -> Result<()> {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    if let Some(d) = deadline {
        if Instant::now() >= d {
            return Err(ScathaError::BudgetExceeded { phase, elapsed_ms });
        }
    }
    debug!(phase, elapsed_ms, "phase barrier passed");
    Ok(())
}

fn resolve_expressions(
    image: &LoadedImage,
    objects: &[DataObject],
    provisional: Vec<ProvisionalExpression>,
) -> Vec<SymbolicExpression> {
    provisional
        .into_iter()
        .map(|e| {
            let target = match e.binding {
                ProvisionalBinding::Block(a) => SymbolBindingTarget::Block(a),
                ProvisionalBinding::Data(a) => resolve_data(image, objects, a),
                ProvisionalBinding::Symbol(i) => SymbolBindingTarget::Symbol(i),
                ProvisionalBinding::Constant(v) => SymbolBindingTarget::Constant(v),
                ProvisionalBinding::UnresolvedIndirect => SymbolBindingTarget::UnresolvedIndirect,
            };
            SymbolicExpression::new(e.operand, target)
        })
        .collect()
}

/// A provisional data reference normally lands inside a built object;
/// selected code in a dual-eligible range is the one case it cannot, and
/// the binding then falls back to symbol or plain constant.
fn resolve_data(image: &LoadedImage, objects: &[DataObject], addr: Addr) -> SymbolBindingTarget {
    let idx = objects.partition_point(|o| o.start <= addr);
    if let Some(obj) = idx.checked_sub(1).and_then(|i| objects.get(i)) {
        if obj.contains(addr) {
            return SymbolBindingTarget::Data {
                object_start: obj.start,
                offset: addr.0 - obj.start.0,
            };
        }
    }
    if let Some(i) = image.symbols().iter().position(|s| s.address == addr) {
        return SymbolBindingTarget::Symbol(i);
    }
    SymbolBindingTarget::Constant(addr.0)
}

/// Addresses the engine could not commit: sources of flagged indirect
/// edges and instructions with unresolved operand bindings. Returns are
/// terminal on purpose and not counted.
fn collect_undecidable(edges: &[Edge], expressions: &[SymbolicExpression]) -> Vec<Addr> {
    let mut out = Vec::new();
    for e in edges {
        if e.kind == EdgeKind::IndirectUnresolved {
            out.push(e.source);
        }
    }
    for x in expressions {
        if x.target.is_unresolved() {
            out.push(x.operand.instruction);
        }
    }
    out
}
