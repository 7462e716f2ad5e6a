//! Consistency checks of generated IL: phi completeness, the incremental
//! dominator tree against a batch computation, and strict SSA form.

use hashbrown::HashMap;

use crate::{
    error::{InternalError, Result},
    frontend::ast::Position,
    middle::il::{AssignSsaVariable, BlockId, CodedFunction, Module, SsaVariable, VariableId},
};

pub fn verify_module(module: &Module) -> Result<()> {
    for function in &module.functions {
        verify_function(module, function)?;
    }
    Ok(())
}

pub fn verify_function(module: &Module, function: &CodedFunction) -> Result<()> {
    let name = |variable: VariableId| module.variables[variable].name.clone();

    check_phis(function, &name)?;
    check_dominators(function)?;
    check_strictness(function, &name)?;

    tracing::trace!(function = %function.name, "IL verified");
    Ok(())
}

fn check_phis(function: &CodedFunction, name: &impl Fn(VariableId) -> String) -> Result<()> {
    for block_id in function.cfg.reverse_postorder() {
        let block = function.cfg.block(block_id);

        for phi in &block.phis {
            if phi.parameters.len() != block.predecessors.len() {
                return Err(InternalError::IncompletePhi {
                    variable: name(phi.target.variable),
                    block: block_id,
                    parameters: phi.parameters.len(),
                    predecessors: block.predecessors.len(),
                });
            }

            if let Some((_, source)) = phi
                .parameters
                .iter()
                .find(|(_, source)| !block.predecessors.contains(source))
            {
                return Err(InternalError::PhiSourceNotPredecessor {
                    variable: name(phi.target.variable),
                    block: block_id,
                    source_block: *source,
                });
            }
        }
    }

    Ok(())
}

/// Immediate dominators computed from scratch with the iterative algorithm
/// of Cooper, Harvey and Kennedy. Unreachable blocks are absent.
pub fn batch_dominators(function: &CodedFunction) -> HashMap<BlockId, Option<BlockId>> {
    let cfg = &function.cfg;
    let order = cfg.reverse_postorder();
    let rank = order
        .iter()
        .enumerate()
        .map(|(rank, block)| (*block, rank))
        .collect::<HashMap<_, _>>();

    let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
    idom.insert(cfg.entry(), cfg.entry());

    let intersect = |idom: &HashMap<BlockId, BlockId>, mut a: BlockId, mut b: BlockId| {
        while a != b {
            while rank[&a] > rank[&b] {
                a = idom[&a];
            }
            while rank[&b] > rank[&a] {
                b = idom[&b];
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;

        for block in order.iter().skip(1) {
            let mut processed = cfg
                .block(*block)
                .predecessors
                .iter()
                .filter(|p| idom.contains_key(*p));

            let Some(first) = processed.next() else {
                continue;
            };
            let new_idom = processed.fold(*first, |acc, p| intersect(&idom, *p, acc));

            if idom.get(block) != Some(&new_idom) {
                idom.insert(*block, new_idom);
                changed = true;
            }
        }
    }

    order
        .iter()
        .map(|block| {
            let dominator = (*block != cfg.entry()).then(|| idom[block]);
            (*block, dominator)
        })
        .collect()
}

fn check_dominators(function: &CodedFunction) -> Result<()> {
    let batch = batch_dominators(function);

    for block in function.cfg.reverse_postorder() {
        let incremental = function.cfg.block(block).dominator;
        let expected = batch.get(&block).copied().flatten();

        if incremental != expected {
            return Err(InternalError::DominatorMismatch {
                block,
                incremental,
                batch: expected,
            });
        }
    }

    Ok(())
}

/// Where a version is defined: the block, and the instruction index (phis
/// and entry definitions sit before index 0)
#[derive(Debug, Clone, Copy)]
struct Definition {
    block: BlockId,
    index: Option<usize>,
}

fn check_strictness(function: &CodedFunction, name: &impl Fn(VariableId) -> String) -> Result<()> {
    let cfg = &function.cfg;
    let mut definitions: HashMap<AssignSsaVariable, Definition> = HashMap::new();

    for version in &function.entry_definitions {
        definitions.insert(
            *version,
            Definition {
                block: cfg.entry(),
                index: None,
            },
        );
    }

    let reachable = cfg.reverse_postorder();
    for block_id in &reachable {
        let block = cfg.block(*block_id);
        for phi in &block.phis {
            definitions.insert(
                phi.target,
                Definition {
                    block: *block_id,
                    index: None,
                },
            );
        }
        for (index, instruction) in block.instructions.iter().enumerate() {
            for def in instruction.all_defs() {
                definitions.insert(
                    def,
                    Definition {
                        block: *block_id,
                        index: Some(index),
                    },
                );
            }
        }
    }

    let violation = |used: SsaVariable, block: BlockId, position: Position| InternalError::StrictnessViolation {
        variable: format!("{} ({used})", name(used.variable)),
        block,
        position,
    };

    let available = |used: SsaVariable, block: BlockId, index: usize| -> bool {
        if used.is_anonymous() {
            return false;
        }
        let version = AssignSsaVariable {
            variable: used.variable,
            version: used.version,
        };
        match definitions.get(&version) {
            Some(definition) if definition.block == block => definition.index.is_none_or(|i| i < index),
            Some(definition) => cfg.dominates(definition.block, block),
            None => false,
        }
    };

    for block_id in &reachable {
        let block = cfg.block(*block_id);

        for phi in &block.phis {
            for (version, source) in &phi.parameters {
                // read at the end of the predecessor
                if !available(version.as_use(), *source, usize::MAX) {
                    return Err(violation(version.as_use(), *block_id, Position::default()));
                }
            }
        }

        for (index, instruction) in block.instructions.iter().enumerate() {
            for used in instruction.all_uses() {
                if !available(used, *block_id, index) {
                    return Err(violation(used, *block_id, instruction.position));
                }
            }
        }
    }

    tracing::trace!(
        function = %function.name,
        versions = definitions.len(),
        blocks = reachable.len(),
        "strictness checked"
    );

    Ok(())
}
