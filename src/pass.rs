//! The `looptime` pass: per-loop orchestration and pipeline dispatch.
//!
//! For every natural loop, in discovery order: derive the loop's name,
//! validate simplified form (warn and skip otherwise), place the timing
//! probes, and — for innermost loops — build the loop DAG, solve the
//! Ball–Larus numbering, emit the counter machinery, and append the path
//! report. Loops whose path count overflows 32 bits keep their probes but
//! skip path profiling with a warning.
//!
//! The pass is one-shot per loop per module: a header that already calls the
//! header probe is left untouched.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;
use tracing::{debug, warn};

use crate::ballarus::PathProfile;
use crate::instrument::{self, Probes};
use crate::ir::{BlockId, FuncId, Function, Module};
use crate::loops::{build_loop_dag, LoopForest, LoopId};
use crate::report;

/// Numbers loops that have no source location. Process-wide so fallback
/// names stay unique across modules within one compilation.
static FALLBACK_LOOP_ID: AtomicU32 = AtomicU32::new(0);

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PassConfig {
    /// Where the path report accumulates, one JSON document per loop.
    pub report_path: PathBuf,
    /// Upper bound on enumerated paths per loop in the report.
    pub max_report_paths: usize,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            report_path: PathBuf::from("PathProfile.json"),
            max_report_paths: 4096,
        }
    }
}

impl PassConfig {
    /// Defaults, overridden by `LOOPTIME_REPORT` and `LOOPTIME_MAX_PATHS`.
    ///
    /// Panics on a malformed `LOOPTIME_MAX_PATHS`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(path) = std::env::var("LOOPTIME_REPORT") {
            cfg.report_path = PathBuf::from(path);
        }
        if let Ok(value) = std::env::var("LOOPTIME_MAX_PATHS") {
            cfg.max_report_paths = value
                .parse()
                .unwrap_or_else(|_| panic!("invalid LOOPTIME_MAX_PATHS={value:?}; expected an integer"));
        }
        cfg
    }
}

// ─── Stats and pipeline errors ──────────────────────────────────────────────

/// What one run did, for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassStats {
    pub loops_seen: usize,
    pub probed: usize,
    pub path_instrumented: usize,
    pub skipped_not_simplified: usize,
    pub skipped_overflow: usize,
    pub skipped_already_instrumented: usize,
}

impl PassStats {
    fn merge(&mut self, other: &PassStats) {
        self.loops_seen += other.loops_seen;
        self.probed += other.probed;
        self.path_instrumented += other.path_instrumented;
        self.skipped_not_simplified += other.skipped_not_simplified;
        self.skipped_overflow += other.skipped_overflow;
        self.skipped_already_instrumented += other.skipped_already_instrumented;
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown pass token {0:?}")]
    UnknownToken(String),
}

// ─── The pass ───────────────────────────────────────────────────────────────

pub struct LoopTimePass {
    config: PassConfig,
}

impl LoopTimePass {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }

    /// Declare the runtime ABI, hook constructors/destructors, and process
    /// every loop of every defined function.
    pub fn run_on_module(&self, module: &mut Module) -> PassStats {
        let probes = Probes::declare(module);
        probes.attach_ctor_dtor(module);

        let mut stats = PassStats::default();
        let fids: Vec<FuncId> = module.funcs.ids().collect();
        for fid in fids {
            if module.funcs[fid].is_declaration || module.funcs[fid].entry.is_none() {
                continue;
            }
            self.run_on_function(module, fid, &probes, &mut stats);
        }
        stats
    }

    fn run_on_function(
        &self,
        module: &mut Module,
        fid: FuncId,
        probes: &Probes,
        stats: &mut PassStats,
    ) {
        let mut forest = LoopForest::compute(&module.funcs[fid]);
        let loop_ids: Vec<LoopId> = forest.loops.ids().collect();

        for id in loop_ids {
            stats.loops_seen += 1;
            let name = loop_name(&module.funcs[fid], &module.name, forest.loops[id].header);
            debug!(target: "looptime", which = %name, "enter");

            if !forest.is_simplified(&module.funcs[fid], id) {
                warn!(target: "looptime", "{name} is not in simplified form; skipped");
                stats.skipped_not_simplified += 1;
                continue;
            }
            if instrument::already_instrumented(&module.funcs[fid], forest.loops[id].header, probes)
            {
                debug!(target: "looptime", which = %name, "already instrumented; skipped");
                stats.skipped_already_instrumented += 1;
                continue;
            }

            // Path machinery first, so the header probe ends up ahead of the
            // counter store once the probes go in.
            if forest.is_innermost(id) {
                let dag = build_loop_dag(&module.funcs[fid], &forest, id);
                match PathProfile::compute(&dag) {
                    Ok(profile) => {
                        instrument::instrument_path_profile(
                            &mut module.funcs[fid],
                            &mut forest,
                            id,
                            &dag,
                            &profile,
                            probes,
                        );
                        self.emit_report(&module.funcs[fid], &name, &dag, &profile);
                        stats.path_instrumented += 1;
                    }
                    Err(overflow) => {
                        warn!(target: "looptime", "{name}: {overflow}; path profiling skipped");
                        stats.skipped_overflow += 1;
                    }
                }
            }

            let global = module.add_global_string(".loopidentifier", name);
            instrument::place_loop_probes(&mut module.funcs[fid], &forest, id, probes, global);
            stats.probed += 1;
        }
    }

    fn emit_report(
        &self,
        func: &Function,
        name: &str,
        dag: &crate::graph::LoopDag<BlockId>,
        profile: &PathProfile<BlockId>,
    ) {
        let (rep, truncated) =
            report::build_loop_report(func, dag, profile, self.config.max_report_paths);
        if truncated {
            warn!(
                target: "looptime",
                "{name}: report truncated to {} of {} paths",
                rep.paths.len(),
                profile.num_paths()
            );
        }
        report::append_report(&self.config.report_path, &rep).unwrap_or_else(|err| {
            panic!(
                "cannot write path report {}: {err}",
                self.config.report_path.display()
            )
        });
    }
}

/// The loop's user-facing name: the source location of the header, or a
/// numbered fallback when debug info is absent.
fn loop_name(func: &Function, module_name: &str, header: BlockId) -> String {
    match func.blocks[header].first_loc() {
        Some(loc) => loc.to_string(),
        None => {
            let n = FALLBACK_LOOP_ID.fetch_add(1, Ordering::Relaxed);
            format!("{module_name}: loop {n}")
        }
    }
}

/// Dispatch a comma-separated pipeline string over the module. The
/// `looptime` token runs the pass; anything else is an error.
pub fn run_pipeline(
    module: &mut Module,
    pipeline: &str,
    config: &PassConfig,
) -> Result<PassStats, PipelineError> {
    let mut stats = PassStats::default();
    for token in pipeline.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match token {
            "looptime" => {
                let s = LoopTimePass::new(config.clone()).run_on_module(module);
                stats.merge(&s);
            }
            other => return Err(PipelineError::UnknownToken(other.to_string())),
        }
    }
    Ok(stats)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
