//! Internal compiler errors. These are violated invariants of the compiler
//! itself (or of an earlier pass), never mistakes in the compiled source. Any
//! of them aborts the compilation unit; user facing problems go through
//! [`crate::diagnostics`] instead.

use crate::{
    frontend::{ast::NodeId, ast::Position, symbol::SymbolId},
    middle::il::BlockId,
};

#[derive(Debug, thiserror::Error)]
pub enum InternalError {
    #[error("{kind} node at {position} should have been eliminated before IL generation")]
    UnexpectedNode {
        kind: &'static str,
        position: Position,
    },

    #[error(
        "IL strictness violation: use of '{variable}' in block {block} (at {position}) has no dominating definition"
    )]
    StrictnessViolation {
        variable: String,
        block: BlockId,
        position: Position,
    },

    #[error("phi function for '{variable}' in block {block} has a parameter from non-predecessor {source_block}")]
    PhiSourceNotPredecessor {
        variable: String,
        block: BlockId,
        source_block: BlockId,
    },

    #[error(
        "phi function for '{variable}' in block {block} has {parameters} parameters but the block has {predecessors} predecessors"
    )]
    IncompletePhi {
        variable: String,
        block: BlockId,
        parameters: usize,
        predecessors: usize,
    },

    #[error("linking {from} -> {to} joins two disjoint dominator trees")]
    DisjointDominatorTrees { from: BlockId, to: BlockId },

    #[error("incremental dominator of {block} is {incremental:?} but the CFG says {batch:?}")]
    DominatorMismatch {
        block: BlockId,
        incremental: Option<BlockId>,
        batch: Option<BlockId>,
    },

    #[error("builtin function '{0}' is not registered")]
    UnknownBuiltin(&'static str),

    #[error("no type recorded for expression node {0:?}")]
    MissingType(NodeId),

    #[error("symbol {0:?} is not a function")]
    NotAFunction(SymbolId),

    #[error("malformed input at {position}: {message}")]
    Malformed { position: Position, message: String },
}

pub type Result<T, E = InternalError> = std::result::Result<T, E>;
