//! End-to-end scenarios: build a module, run the pass, execute the
//! instrumented IR, and check the probe stream and the JSON report.

use looptime::interp::{Interp, ProbeEvent};
use looptime::ir::{BinOp, FuncBuilder, Module, Operand};
use looptime::pass::{LoopTimePass, PassConfig};

fn test_config(tag: &str) -> PassConfig {
    PassConfig {
        report_path: std::env::temp_dir().join(format!(
            "looptime-e2e-{}-{tag}.json",
            std::process::id()
        )),
        max_report_paths: 4096,
    }
}

fn run_pass(module: &mut Module, cfg: &PassConfig) -> looptime::PassStats {
    let _ = std::fs::remove_file(&cfg.report_path);
    LoopTimePass::new(cfg.clone()).run_on_module(module)
}

/// Header events carrying `name`, in order.
fn headers_named(events: &[ProbeEvent], name: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ProbeEvent::Header(n) if n == name))
        .count()
}

/// A loop whose body branches on `i % 2`, iterated `trips` times:
///
/// pre -> header -> {a, b} -> latch -> {header, exit}
fn diamond_module(trips: i64) -> Module {
    let mut module = Module::new("diamond.ll");
    let mut fb = FuncBuilder::new("main");
    let pre = fb.block("pre");
    let header = fb.block("header");
    let a = fb.block("a");
    let b = fb.block("b");
    let latch = fb.block("latch");
    let exit = fb.block("exit");

    fb.br(pre, header);
    fb.set_loc("diamond.c", 3);
    let i = fb.phi(header, &[(Operand::Const(0), pre)]);
    let parity = fb.binop(header, BinOp::Rem, Operand::Value(i), Operand::Const(2));
    let even = fb.binop(header, BinOp::Eq, Operand::Value(parity), Operand::Const(0));
    fb.cond_br(header, Operand::Value(even), a, b);
    fb.clear_loc();
    fb.br(a, latch);
    fb.br(b, latch);
    let i2 = fb.binop(latch, BinOp::Add, Operand::Value(i), Operand::Const(1));
    let more = fb.binop(latch, BinOp::Slt, Operand::Value(i2), Operand::Const(trips));
    fb.cond_br(latch, Operand::Value(more), header, exit);
    fb.ret(exit, None);
    fb.add_phi_incoming(header, i, Operand::Value(i2), latch);

    module.add_function(fb.finish());
    module
}

#[test]
fn diamond_reports_alternating_path_ids() {
    let mut module = diamond_module(4);
    let cfg = test_config("diamond");
    let stats = run_pass(&mut module, &cfg);
    assert_eq!(stats.path_instrumented, 1);

    let main = module.func_by_name("main").unwrap();
    let mut interp = Interp::new(&module);
    interp.run_program(main);

    // Even iterations take `a` (id 0), odd take `b` (id 1).
    assert_eq!(interp.path_ids(), vec![0, 1, 0, 1]);

    // Constructors bracket the run.
    assert_eq!(interp.events.first(), Some(&ProbeEvent::Initialize));
    assert_eq!(interp.events.last(), Some(&ProbeEvent::Cleanup));

    // Header and latch probes fire per iteration, the exit probe once, all
    // naming the loop by its source location.
    assert_eq!(headers_named(&interp.events, "diamond.c:3"), 4);
    let latches = interp
        .events
        .iter()
        .filter(|e| matches!(e, ProbeEvent::Latch(n) if n == "diamond.c:3"))
        .count();
    assert_eq!(latches, 4);
    let exits: Vec<_> = interp
        .events
        .iter()
        .filter(|e| matches!(e, ProbeEvent::ExitLoop(_)))
        .collect();
    assert_eq!(exits.len(), 1);

    let _ = std::fs::remove_file(&cfg.report_path);
}

#[test]
fn linear_loop_needs_no_counter_updates() {
    // pre -> header -> b1 -> b2 -> latch -> {header, exit}
    let mut module = Module::new("linear.ll");
    let mut fb = FuncBuilder::new("main");
    let pre = fb.block("pre");
    let header = fb.block("header");
    let b1 = fb.block("b1");
    let b2 = fb.block("b2");
    let latch = fb.block("latch");
    let exit = fb.block("exit");

    fb.br(pre, header);
    let i = fb.phi(header, &[(Operand::Const(0), pre)]);
    fb.br(header, b1);
    fb.br(b1, b2);
    fb.br(b2, latch);
    let i2 = fb.binop(latch, BinOp::Add, Operand::Value(i), Operand::Const(1));
    let more = fb.binop(latch, BinOp::Slt, Operand::Value(i2), Operand::Const(3));
    fb.cond_br(latch, Operand::Value(more), header, exit);
    fb.ret(exit, None);
    fb.add_phi_incoming(header, i, Operand::Value(i2), latch);
    let main = module.add_function(fb.finish());

    let blocks_before = module.funcs[main].blocks.len();
    let cfg = test_config("linear");
    let stats = run_pass(&mut module, &cfg);
    assert_eq!(stats.path_instrumented, 1);

    // Single path, all edges in the tree: nothing split, nothing added.
    assert_eq!(module.funcs[main].blocks.len(), blocks_before);

    let mut interp = Interp::new(&module);
    interp.run_program(main);
    assert_eq!(interp.path_ids(), vec![0, 0, 0]);

    let _ = std::fs::remove_file(&cfg.report_path);
}

#[test]
fn two_diamonds_cover_the_four_ids() {
    // pre -> header -> {a, b} -> mid -> {c, d} -> latch -> {header, exit}
    let mut module = Module::new("twodiamonds.ll");
    let mut fb = FuncBuilder::new("main");
    let pre = fb.block("pre");
    let header = fb.block("header");
    let a = fb.block("a");
    let b = fb.block("b");
    let mid = fb.block("mid");
    let c = fb.block("c");
    let d = fb.block("d");
    let latch = fb.block("latch");
    let exit = fb.block("exit");

    fb.br(pre, header);
    let i = fb.phi(header, &[(Operand::Const(0), pre)]);
    let parity = fb.binop(header, BinOp::Rem, Operand::Value(i), Operand::Const(2));
    let even = fb.binop(header, BinOp::Eq, Operand::Value(parity), Operand::Const(0));
    fb.cond_br(header, Operand::Value(even), a, b);
    fb.br(a, mid);
    fb.br(b, mid);
    let low = fb.binop(mid, BinOp::Slt, Operand::Value(i), Operand::Const(2));
    fb.cond_br(mid, Operand::Value(low), c, d);
    fb.br(c, latch);
    fb.br(d, latch);
    let i2 = fb.binop(latch, BinOp::Add, Operand::Value(i), Operand::Const(1));
    let more = fb.binop(latch, BinOp::Slt, Operand::Value(i2), Operand::Const(4));
    fb.cond_br(latch, Operand::Value(more), header, exit);
    fb.ret(exit, None);
    fb.add_phi_incoming(header, i, Operand::Value(i2), latch);
    let main = module.add_function(fb.finish());

    let cfg = test_config("twodiamonds");
    let stats = run_pass(&mut module, &cfg);
    assert_eq!(stats.path_instrumented, 1);

    let mut interp = Interp::new(&module);
    interp.run_program(main);

    // Edge values: header->b carries 2, mid->d carries 1. The iterations
    // visit (a,c), (b,c), (a,d), (b,d).
    assert_eq!(interp.path_ids(), vec![0, 2, 1, 3]);

    let mut sorted = interp.path_ids();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![0, 1, 2, 3]);

    let _ = std::fs::remove_file(&cfg.report_path);
}

#[test]
fn triangle_exercises_the_latch_boundary_increment() {
    // pre -> header -> {a, latch}, a -> latch, latch -> {header, exit}
    let mut module = Module::new("triangle.ll");
    let mut fb = FuncBuilder::new("main");
    let pre = fb.block("pre");
    let header = fb.block("header");
    let a = fb.block("a");
    let latch = fb.block("latch");
    let exit = fb.block("exit");

    fb.br(pre, header);
    let i = fb.phi(header, &[(Operand::Const(0), pre)]);
    let parity = fb.binop(header, BinOp::Rem, Operand::Value(i), Operand::Const(2));
    let even = fb.binop(header, BinOp::Eq, Operand::Value(parity), Operand::Const(0));
    fb.cond_br(header, Operand::Value(even), a, latch);
    fb.br(a, latch);
    let i2 = fb.binop(latch, BinOp::Add, Operand::Value(i), Operand::Const(1));
    let more = fb.binop(latch, BinOp::Slt, Operand::Value(i2), Operand::Const(4));
    fb.cond_br(latch, Operand::Value(more), header, exit);
    fb.ret(exit, None);
    fb.add_phi_incoming(header, i, Operand::Value(i2), latch);
    let main = module.add_function(fb.finish());

    let cfg = test_config("triangle");
    let stats = run_pass(&mut module, &cfg);
    assert_eq!(stats.path_instrumented, 1);

    let mut interp = Interp::new(&module);
    interp.run_program(main);

    // The path through `a` is id 0; the direct header->latch path is id 1,
    // realized entirely by the increment at the iteration boundary.
    assert_eq!(interp.path_ids(), vec![0, 1, 0, 1]);

    let _ = std::fs::remove_file(&cfg.report_path);
}

#[test]
fn nested_loops_profile_only_the_innermost() {
    let mut module = Module::new("nest.ll");
    let mut fb = FuncBuilder::new("main");
    let entry = fb.block("entry");
    let oh = fb.block("outer.header");
    let ipre = fb.block("inner.pre");
    let ih = fb.block("inner.header");
    let a = fb.block("a");
    let b = fb.block("b");
    let ilatch = fb.block("inner.latch");
    let olatch = fb.block("outer.latch");
    let exit = fb.block("exit");

    fb.br(entry, oh);
    fb.set_loc("nest.c", 2);
    let j = fb.phi(oh, &[(Operand::Const(0), entry)]);
    fb.br(oh, ipre);
    fb.clear_loc();
    fb.br(ipre, ih);
    fb.set_loc("nest.c", 5);
    let i = fb.phi(ih, &[(Operand::Const(0), ipre)]);
    let parity = fb.binop(ih, BinOp::Rem, Operand::Value(i), Operand::Const(2));
    let even = fb.binop(ih, BinOp::Eq, Operand::Value(parity), Operand::Const(0));
    fb.cond_br(ih, Operand::Value(even), a, b);
    fb.clear_loc();
    fb.br(a, ilatch);
    fb.br(b, ilatch);
    let i2 = fb.binop(ilatch, BinOp::Add, Operand::Value(i), Operand::Const(1));
    let imore = fb.binop(ilatch, BinOp::Slt, Operand::Value(i2), Operand::Const(2));
    fb.cond_br(ilatch, Operand::Value(imore), ih, olatch);
    let j2 = fb.binop(olatch, BinOp::Add, Operand::Value(j), Operand::Const(1));
    let jmore = fb.binop(olatch, BinOp::Slt, Operand::Value(j2), Operand::Const(2));
    fb.cond_br(olatch, Operand::Value(jmore), oh, exit);
    fb.ret(exit, None);
    fb.add_phi_incoming(ih, i, Operand::Value(i2), ilatch);
    fb.add_phi_incoming(oh, j, Operand::Value(j2), olatch);
    let main = module.add_function(fb.finish());

    let cfg = test_config("nested");
    let stats = run_pass(&mut module, &cfg);
    assert_eq!(stats.loops_seen, 2);
    assert_eq!(stats.probed, 2);
    assert_eq!(stats.path_instrumented, 1);

    let mut interp = Interp::new(&module);
    interp.run_program(main);

    // Two outer trips of two inner trips each; only the inner loop reports.
    assert_eq!(interp.path_ids(), vec![0, 1, 0, 1]);
    assert_eq!(headers_named(&interp.events, "nest.c:2"), 2);
    assert_eq!(headers_named(&interp.events, "nest.c:5"), 4);

    // The report holds exactly one document: the inner loop's two paths.
    let text = std::fs::read_to_string(&cfg.report_path).unwrap();
    assert_eq!(text.matches("\"Paths\"").count(), 1);
    let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(doc["Paths"].as_object().unwrap().len(), 2);
    assert!(doc["BasicBlocks"].as_object().unwrap().contains_key("inner.header"));
    assert!(!doc["BasicBlocks"].as_object().unwrap().contains_key("outer.header"));

    let _ = std::fs::remove_file(&cfg.report_path);
}

#[test]
fn multi_latch_loop_leaves_the_module_unchanged() {
    let func = looptime::ir_parse::parse_cfg(
        "f",
        "pre -> header\nheader -> l1, l2\nl1 -> header, exit\nl2 -> header, exit\nexit\n",
    )
    .unwrap();
    let mut module = Module::new("irreducible.ll");
    let fid = module.add_function(func);

    let cfg = test_config("multilatch");
    let stats = run_pass(&mut module, &cfg);

    assert_eq!(stats.skipped_not_simplified, 1);
    assert_eq!(stats.probed, 0);
    assert!(module.funcs[fid]
        .blocks
        .iter()
        .all(|(_, b)| b.insts.is_empty()));
    assert!(!cfg.report_path.exists());
}

#[test]
fn reinstrumentation_adds_no_second_counter() {
    let mut module = diamond_module(2);
    let cfg = test_config("oneshot");
    let first = run_pass(&mut module, &cfg);
    assert_eq!(first.path_instrumented, 1);

    let main = module.func_by_name("main").unwrap();
    let blocks = module.funcs[main].blocks.len();
    let insts: usize = module.funcs[main]
        .blocks
        .iter()
        .map(|(_, b)| b.insts.len())
        .sum();

    let second = LoopTimePass::new(cfg.clone()).run_on_module(&mut module);
    assert_eq!(second.skipped_already_instrumented, 1);
    assert_eq!(module.funcs[main].blocks.len(), blocks);
    let insts_after: usize = module.funcs[main]
        .blocks
        .iter()
        .map(|(_, b)| b.insts.len())
        .sum();
    assert_eq!(insts_after, insts);

    // The probe stream is unchanged too.
    let mut interp = Interp::new(&module);
    interp.run_program(main);
    assert_eq!(interp.path_ids(), vec![0, 1]);

    let _ = std::fs::remove_file(&cfg.report_path);
}

#[test]
fn declarations_are_shared_across_functions() {
    // Two functions, each with a loop: one probe set, one ctor hook.
    let f1 = looptime::ir_parse::parse_cfg(
        "first",
        "pre -> header\nheader -> latch\nlatch -> header, exit\nexit\n",
    )
    .unwrap();
    let f2 = looptime::ir_parse::parse_cfg(
        "second",
        "pre -> header\nheader -> latch\nlatch -> header, exit\nexit\n",
    )
    .unwrap();
    let mut module = Module::new("two.ll");
    module.add_function(f1);
    module.add_function(f2);

    let cfg = test_config("twofuncs");
    let stats = run_pass(&mut module, &cfg);
    assert_eq!(stats.path_instrumented, 2);

    let probe_decls = module
        .funcs
        .iter()
        .filter(|(_, f)| f.name.starts_with("INSTRUMENT_"))
        .count();
    assert_eq!(probe_decls, 7);
    assert_eq!(module.ctors.len(), 1);
    assert_eq!(module.dtors.len(), 1);

    // Two loop-name globals, one per loop.
    assert_eq!(module.globals.len(), 2);

    let _ = std::fs::remove_file(&cfg.report_path);
}
