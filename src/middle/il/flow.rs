use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::middle::il::{AssignSsaVariable, BlockId, VariableId};

/// The version of every variable visible at one point of a function
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowState {
    visible: BTreeMap<VariableId, AssignSsaVariable>,
}

impl FlowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, variable: VariableId) -> Option<AssignSsaVariable> {
        self.visible.get(&variable).copied()
    }

    /// Makes `version` the visible version of its variable
    pub fn define(&mut self, version: AssignSsaVariable) {
        self.visible.insert(version.variable, version);
    }

    pub fn iter(&self) -> impl Iterator<Item = AssignSsaVariable> + '_ {
        self.visible.values().copied()
    }

    pub fn len(&self) -> usize {
        self.visible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }

    pub fn apply_replacements(&mut self, replacements: &HashMap<AssignSsaVariable, AssignSsaVariable>) {
        for version in self.visible.values_mut() {
            if let Some(replacement) = replacements.get(version) {
                *version = *replacement;
            }
        }
    }
}

impl FromIterator<AssignSsaVariable> for FlowState {
    fn from_iter<T: IntoIterator<Item = AssignSsaVariable>>(iter: T) -> Self {
        let mut state = FlowState::new();
        for version in iter {
            state.define(version);
        }
        state
    }
}

/// Control leaving `block` with `state`, not yet attached to a successor
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub block: BlockId,
    pub state: FlowState,
}

impl Flow {
    pub fn new(block: BlockId, state: FlowState) -> Self {
        Self { block, state }
    }
}

/// How a set of incoming flows combines at a merge block
#[derive(Debug, Default, PartialEq)]
pub struct MergePlan {
    /// Variables with the same version in every flow
    pub agreed: FlowState,
    /// Variables visible in every flow but with differing versions, with
    /// the version per flow (in flow order)
    pub divergent: Vec<(VariableId, Vec<AssignSsaVariable>)>,
}

/// Variables missing from any flow are dropped; they are not definitely
/// assigned after the merge.
pub fn plan_merge(flows: &[Flow]) -> MergePlan {
    let mut plan = MergePlan::default();
    let Some((first, rest)) = flows.split_first() else {
        return plan;
    };

    for version in first.state.iter() {
        let variable = version.variable;
        let versions = std::iter::once(Some(version))
            .chain(rest.iter().map(|flow| flow.state.get(variable)))
            .collect::<Option<Vec<_>>>();

        let Some(versions) = versions else {
            continue;
        };

        if versions.iter().all(|v| *v == version) {
            plan.agreed.define(version);
        } else {
            plan.divergent.push((variable, versions));
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::index::Index;

    fn version(variable: usize, version: u32) -> AssignSsaVariable {
        AssignSsaVariable {
            variable: VariableId::new(variable),
            version,
        }
    }

    #[test]
    fn merge_keeps_agreement_and_drops_partial_variables() {
        let left = Flow::new(
            BlockId::new(1),
            [version(0, 1), version(1, 1), version(2, 4)].into_iter().collect(),
        );
        let right = Flow::new(BlockId::new(2), [version(0, 1), version(1, 2)].into_iter().collect());

        let plan = plan_merge(&[left, right]);

        assert_eq!(plan.agreed, [version(0, 1)].into_iter().collect());
        assert_eq!(
            plan.divergent,
            vec![(VariableId::new(1), vec![version(1, 1), version(1, 2)])]
        );
    }

    #[test]
    fn replacements_rewrite_visible_versions() {
        let mut state: FlowState = [version(0, 1), version(1, 3)].into_iter().collect();
        let replacements = [(version(0, 1), version(0, 7))].into_iter().collect();

        state.apply_replacements(&replacements);

        assert_eq!(state.get(VariableId::new(0)), Some(version(0, 7)));
        assert_eq!(state.get(VariableId::new(1)), Some(version(1, 3)));
    }
}
