//! Textual CFG fixtures.
//!
//! Tests describe control-flow shapes as text instead of hand-wiring
//! builders. One block per line, successors after `->`, `#` comments:
//!
//! ```text
//! pre -> header
//! header -> a, b       # two-way branch
//! a -> latch
//! b -> latch
//! latch -> header, exit
//! exit
//! ```
//!
//! The first line is the entry block; a line without successors returns.
//! Two-way branches get a constant-false condition — parsed functions have
//! the right shape for loop analysis, not meaningful data flow.

use std::collections::HashMap;

use chumsky::prelude::*;
use thiserror::Error;

use crate::ir::{BlockId, FuncBuilder, Function, Operand};

type Extra<'src> = extra::Err<Rich<'src, char>>;

#[derive(Debug, Error)]
pub enum CfgParseError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("block {0} is defined twice")]
    Redefined(String),
    #[error("block {0} is referenced but never defined")]
    Undefined(String),
    #[error("block {0} has {1} successors, more than a terminator can carry")]
    TooManySuccessors(String, usize),
}

#[derive(Debug)]
struct AstBlock {
    name: String,
    succs: Vec<String>,
}

// ─── Parsers ────────────────────────────────────────────────────────────────

fn inline_ws<'src>() -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    any()
        .filter(|c: &char| *c == ' ' || *c == '\t')
        .repeated()
        .ignored()
}

fn ident<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_ascii_alphanumeric() || matches!(*c, '_' | '.'))
        .repeated()
        .at_least(1)
        .to_slice()
        .map(|s: &str| s.to_string())
}

/// One source line: optional block definition, optional comment.
fn line<'src>() -> impl Parser<'src, &'src str, Option<AstBlock>, Extra<'src>> + Clone {
    let succs = just("->").padded_by(inline_ws()).ignore_then(
        ident()
            .separated_by(just(",").padded_by(inline_ws()))
            .at_least(1)
            .collect::<Vec<_>>(),
    );

    let comment = just("#")
        .then(any().filter(|c: &char| *c != '\n').repeated())
        .ignored();

    let def = ident().then(succs.or_not()).map(|(name, succs)| AstBlock {
        name,
        succs: succs.unwrap_or_default(),
    });

    inline_ws()
        .ignore_then(def.or_not())
        .then_ignore(inline_ws())
        .then_ignore(comment.or_not())
}

// ─── Resolution ─────────────────────────────────────────────────────────────

/// Parse a CFG description into a [`Function`] named `name`.
pub fn parse_cfg(name: &str, src: &str) -> Result<Function, CfgParseError> {
    let lines = line()
        .separated_by(just('\n'))
        .collect::<Vec<_>>()
        .then_ignore(end())
        .parse(src)
        .into_result()
        .map_err(|errs| {
            CfgParseError::Syntax(
                errs.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;

    let defs: Vec<AstBlock> = lines.into_iter().flatten().collect();
    if defs.is_empty() {
        return Err(CfgParseError::Syntax("no blocks defined".to_string()));
    }

    let mut fb = FuncBuilder::new(name);
    let mut ids: HashMap<&str, BlockId> = HashMap::new();
    for def in &defs {
        if ids.contains_key(def.name.as_str()) {
            return Err(CfgParseError::Redefined(def.name.clone()));
        }
        ids.insert(def.name.as_str(), fb.block(def.name.as_str()));
    }

    for def in &defs {
        let bb = ids[def.name.as_str()];
        let resolve = |n: &String| {
            ids.get(n.as_str())
                .copied()
                .ok_or_else(|| CfgParseError::Undefined(n.clone()))
        };
        match def.succs.as_slice() {
            [] => fb.ret(bb, None),
            [t] => {
                let t = resolve(t)?;
                fb.br(bb, t);
            }
            [t, e] => {
                let t = resolve(t)?;
                let e = resolve(e)?;
                fb.cond_br(bb, Operand::Const(0), t, e);
            }
            many => {
                return Err(CfgParseError::TooManySuccessors(
                    def.name.clone(),
                    many.len(),
                ))
            }
        }
    }

    Ok(fb.finish())
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loops::LoopForest;

    #[test]
    fn parses_a_diamond_loop() {
        let func = parse_cfg(
            "fixture",
            "pre -> header\n\
             header -> a, b   # branch\n\
             a -> latch\n\
             b -> latch\n\
             latch -> header, exit\n\
             exit\n",
        )
        .unwrap();

        assert_eq!(func.blocks.len(), 6);
        let forest = LoopForest::compute(&func);
        assert_eq!(forest.loops.len(), 1);
        let id = forest.loops.ids().next().unwrap();
        assert!(forest.is_simplified(&func, id));
        assert_eq!(forest.loops[id].blocks.len(), 4);
    }

    #[test]
    fn blank_lines_and_comments_are_ignored() {
        let func = parse_cfg(
            "fixture",
            "# a tiny chain\n\
             \n\
             a -> b\n\
             \n\
             b   # falls off\n",
        )
        .unwrap();
        assert_eq!(func.blocks.len(), 2);
    }

    #[test]
    fn first_block_is_the_entry() {
        let func = parse_cfg("fixture", "start -> stop\nstop\n").unwrap();
        assert_eq!(func.blocks[func.entry()].name, "start");
    }

    #[test]
    fn undefined_successor_is_an_error() {
        let err = parse_cfg("fixture", "a -> ghost\n").unwrap_err();
        assert!(matches!(err, CfgParseError::Undefined(name) if name == "ghost"));
    }

    #[test]
    fn duplicate_definition_is_an_error() {
        let err = parse_cfg("fixture", "a -> b\nb\na -> b\n").unwrap_err();
        assert!(matches!(err, CfgParseError::Redefined(name) if name == "a"));
    }

    #[test]
    fn three_successors_do_not_fit_a_terminator() {
        let err = parse_cfg("fixture", "a -> b, c, d\nb\nc\nd\n").unwrap_err();
        assert!(matches!(err, CfgParseError::TooManySuccessors(_, 3)));
    }

    #[test]
    fn garbage_is_a_syntax_error() {
        let err = parse_cfg("fixture", "a -> \n").unwrap_err();
        assert!(matches!(err, CfgParseError::Syntax(_)));
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(parse_cfg("fixture", "").is_err());
        assert!(parse_cfg("fixture", "# only a comment\n").is_err());
    }
}
