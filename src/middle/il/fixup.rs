//! Resolution of anonymous uses. Runs once per function after generation,
//! when every phi function exists.

use hashbrown::HashMap;

use crate::{
    error::{InternalError, Result},
    index::IndexVec,
    middle::il::{BlockId, CodedFunction, FlowState, Variable, VariableId},
};

/// Walks the dominator tree from the entry. A block starts from its recorded
/// entry state, or else from the exit state of its immediate dominator, and
/// every anonymous use is bound to the version visible at that point.
pub fn fix_function(function: &mut CodedFunction, variables: &IndexVec<VariableId, Variable>) -> Result<()> {
    let mut exit_states: HashMap<BlockId, FlowState> = HashMap::new();

    for block_id in function.cfg.dominator_preorder() {
        let block = function.cfg.block_mut(block_id);

        let mut state = match (&block.entry_state, block.dominator) {
            (Some(state), _) => state.clone(),
            (None, Some(dominator)) => exit_states.get(&dominator).cloned().unwrap_or_default(),
            (None, None) => FlowState::new(),
        };

        for phi in &block.phis {
            state.define(phi.target);
        }

        for instruction in &mut block.instructions {
            let position = instruction.position;

            for used in instruction.uses_mut() {
                if !used.is_anonymous() {
                    continue;
                }

                let version = state
                    .get(used.variable)
                    .ok_or_else(|| InternalError::StrictnessViolation {
                        variable: variables[used.variable].name.clone(),
                        block: block_id,
                        position,
                    })?;
                *used = version.as_use();
            }

            for def in instruction.all_defs() {
                state.define(def);
            }
        }

        exit_states.insert(block_id, state);
    }

    Ok(())
}
