//! The JSON path report.
//!
//! One document per instrumented loop, appended to the report file:
//! block names mapped to their deduplicated source lines, and path ids
//! mapped to the block sequence realizing each path. Path enumeration is
//! iterative (an explicit DFS stack) and bounded, so loops with enormous
//! path counts cannot blow the stack or the report.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::ballarus::PathProfile;
use crate::graph::LoopDag;
use crate::ir::{BlockId, Function};

/// The report document for one loop. `BTreeMap` keys keep enumeration
/// deterministic across equivalent inputs.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct LoopReport {
    #[serde(rename = "BasicBlocks")]
    pub basic_blocks: BTreeMap<String, Vec<String>>,
    #[serde(rename = "Paths")]
    pub paths: BTreeMap<String, Vec<String>>,
}

/// Render the report for one loop. The second return is true when `max_paths`
/// cut the enumeration short.
pub fn build_loop_report(
    func: &Function,
    dag: &LoopDag<BlockId>,
    profile: &PathProfile<BlockId>,
    max_paths: usize,
) -> (LoopReport, bool) {
    let mut basic_blocks = BTreeMap::new();
    for bb in dag.graph().nodes() {
        let block = &func.blocks[bb];
        let lines: BTreeSet<String> = block
            .insts
            .iter()
            .map(|inst| match &inst.loc {
                Some(loc) => loc.to_string(),
                None => "unavailable".to_string(),
            })
            .collect();
        basic_blocks.insert(block.name.clone(), lines.into_iter().collect());
    }

    let mut paths = BTreeMap::new();
    let emitted = profile.for_each_path(dag, max_paths, |id, blocks| {
        paths.insert(
            id.to_string(),
            blocks.iter().map(|&b| func.blocks[b].name.clone()).collect(),
        );
    });

    let truncated = (emitted as i64) < profile.num_paths();
    (LoopReport { basic_blocks, paths }, truncated)
}

/// Append one report document (plus a trailing newline) to the report file,
/// creating it if needed.
pub fn append_report(path: &Path, report: &LoopReport) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let doc = serde_json::to_string_pretty(report).expect("report serialization cannot fail");
    writeln!(file, "{doc}")
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballarus::PathProfile;
    use crate::ir::{FuncBuilder, Operand};
    use crate::loops::{build_loop_dag, LoopForest};

    fn diamond_loop_func() -> Function {
        let mut fb = FuncBuilder::new("f");
        let pre = fb.block("pre");
        let header = fb.block("header");
        let a = fb.block("a");
        let b = fb.block("b");
        let latch = fb.block("latch");
        let exit = fb.block("exit");
        fb.br(pre, header);
        fb.set_loc("demo.c", 3);
        let c = fb.binop(
            header,
            crate::ir::BinOp::Eq,
            Operand::Const(0),
            Operand::Const(0),
        );
        fb.cond_br(header, Operand::Value(c), a, b);
        fb.set_loc("demo.c", 4);
        let _ = fb.binop(a, crate::ir::BinOp::Add, Operand::Const(1), Operand::Const(1));
        fb.clear_loc();
        fb.br(a, latch);
        fb.br(b, latch);
        fb.cond_br(latch, Operand::Const(1), header, exit);
        fb.ret(exit, None);
        fb.finish()
    }

    #[test]
    fn report_lists_blocks_and_paths() {
        let func = diamond_loop_func();
        let forest = LoopForest::compute(&func);
        let id = forest.loops.ids().next().unwrap();
        let dag = build_loop_dag(&func, &forest, id);
        let profile = PathProfile::compute(&dag).unwrap();

        let (report, truncated) = build_loop_report(&func, &dag, &profile, 4096);
        assert!(!truncated);

        assert_eq!(report.basic_blocks.len(), 4);
        assert_eq!(report.basic_blocks["header"], vec!["demo.c:3"]);
        assert_eq!(report.basic_blocks["a"], vec!["demo.c:4"]);
        assert_eq!(report.basic_blocks["b"], Vec::<String>::new());

        assert_eq!(report.paths.len(), 2);
        assert_eq!(report.paths["0"], vec!["header", "a", "latch"]);
        assert_eq!(report.paths["1"], vec!["header", "b", "latch"]);
    }

    #[test]
    fn source_lines_deduplicate_within_a_block() {
        let mut fb = FuncBuilder::new("g");
        let pre = fb.block("pre");
        let header = fb.block("header");
        let latch = fb.block("latch");
        let exit = fb.block("exit");
        fb.br(pre, header);
        fb.set_loc("demo.c", 9);
        let x = fb.binop(header, crate::ir::BinOp::Add, Operand::Const(1), Operand::Const(2));
        let _ = fb.binop(header, crate::ir::BinOp::Add, Operand::Value(x), Operand::Const(3));
        fb.br(header, latch);
        fb.clear_loc();
        fb.cond_br(latch, Operand::Const(1), header, exit);
        fb.ret(exit, None);
        let func = fb.finish();

        let forest = LoopForest::compute(&func);
        let id = forest.loops.ids().next().unwrap();
        let dag = build_loop_dag(&func, &forest, id);
        let profile = PathProfile::compute(&dag).unwrap();

        let (report, _) = build_loop_report(&func, &dag, &profile, 4096);
        assert_eq!(report.basic_blocks["header"], vec!["demo.c:9"]);
    }

    #[test]
    fn truncation_reports_incomplete_enumeration() {
        let func = diamond_loop_func();
        let forest = LoopForest::compute(&func);
        let id = forest.loops.ids().next().unwrap();
        let dag = build_loop_dag(&func, &forest, id);
        let profile = PathProfile::compute(&dag).unwrap();

        let (report, truncated) = build_loop_report(&func, &dag, &profile, 1);
        assert!(truncated);
        assert_eq!(report.paths.len(), 1);
    }

    #[test]
    fn append_accumulates_documents() {
        let func = diamond_loop_func();
        let forest = LoopForest::compute(&func);
        let id = forest.loops.ids().next().unwrap();
        let dag = build_loop_dag(&func, &forest, id);
        let profile = PathProfile::compute(&dag).unwrap();
        let (report, _) = build_loop_report(&func, &dag, &profile, 4096);

        let path = std::env::temp_dir().join(format!(
            "looptime-report-test-{}.json",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        append_report(&path, &report).unwrap();
        append_report(&path, &report).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("\"BasicBlocks\"").count(), 2);
        assert_eq!(text.matches("\"Paths\"").count(), 2);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn json_shape_matches_the_contract() {
        let func = diamond_loop_func();
        let forest = LoopForest::compute(&func);
        let id = forest.loops.ids().next().unwrap();
        let dag = build_loop_dag(&func, &forest, id);
        let profile = PathProfile::compute(&dag).unwrap();
        let (report, _) = build_loop_report(&func, &dag, &profile, 4096);

        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&report).unwrap()).unwrap();
        assert!(value.get("BasicBlocks").is_some());
        assert!(value.get("Paths").is_some());
        assert_eq!(value["Paths"]["0"][0], "header");
    }
}
