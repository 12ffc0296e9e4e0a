//! Ball–Larus path-profiling instrumentation for loops in SSA IR.
//!
//! The pass walks every natural loop of a module and inserts calls to a
//! host-supplied runtime: timing probes at the loop header, latch, and
//! exits, plus — for innermost loops — a per-iteration path id computed by
//! the Ball–Larus numbering. Each acyclic path through the loop body gets a
//! unique id in `0..num_paths`, maintained at runtime by a handful of adds
//! on carefully chosen edges.
//!
//! The pipeline per innermost loop:
//!
//! 1. [`loops`] finds the loop and checks the canonical shape (preheader,
//!    single latch, dedicated exits).
//! 2. [`loops::build_loop_dag`] projects the body into a single-entry/
//!    single-exit DAG by cutting the back edge ([`graph`], [`topo`]).
//! 3. [`ballarus`] numbers the paths: edge values in reverse topological
//!    order, a maximum spanning tree over the re-added back edge, and one
//!    increment per chord.
//! 4. [`instrument`] mutates the IR: counter slot, chord updates on split
//!    edges, probe calls.
//! 5. [`report`] appends a JSON document per loop mapping path ids to block
//!    sequences.
//!
//! [`pass::run_pipeline`] dispatches the `looptime` pipeline token;
//! [`interp`] executes instrumented modules in tests and records the probe
//! stream.

pub mod ballarus;
pub mod graph;
pub mod instrument;
pub mod interp;
pub mod ir;
pub mod ir_parse;
pub mod loops;
pub mod pass;
pub mod report;
pub mod topo;

pub use ballarus::{PathOverflow, PathProfile};
pub use graph::{DiGraph, LoopDag};
pub use ir::{FuncBuilder, Function, Module};
pub use pass::{run_pipeline, LoopTimePass, PassConfig, PassStats};
