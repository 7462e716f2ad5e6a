use hashbrown::HashSet;

use crate::{
    error::{InternalError, Result},
    index::IndexVec,
    middle::il::{BasicBlock, BlockId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Normal,
    /// Control transfer when an instruction in the source block throws
    Throw,
}

/// The blocks of one function. Edges can only be added through
/// [`ControlFlowGraph::attach_edge`], which keeps the dominator tree up to
/// date while the graph grows.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlFlowGraph {
    pub blocks: IndexVec<BlockId, BasicBlock>,
}

impl Default for ControlFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlFlowGraph {
    /// A graph holding only the entry block
    pub fn new() -> Self {
        let mut blocks = IndexVec::new();
        blocks.push(BasicBlock::default());
        Self { blocks }
    }

    pub fn entry(&self) -> BlockId {
        BlockId::ENTRY
    }

    pub fn create_block(&mut self) -> BlockId {
        self.blocks.push(BasicBlock::default())
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The block itself followed by all its dominators up to the entry
    pub fn dominator_chain(&self, block: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        std::iter::successors(Some(block), |b| self.blocks[*b].dominator)
    }

    pub fn dominates(&self, dominator: BlockId, block: BlockId) -> bool {
        self.dominator_chain(block).any(|b| b == dominator)
    }

    /// All successors, exception edges included
    pub fn all_successors(&self, block: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        let block = &self.blocks[block];
        block
            .successors
            .iter()
            .chain(block.throw_catchers.iter())
            .copied()
    }

    /// Adds the edge `from -> to`. The dominator of `to` becomes the nearest
    /// common dominator of `from` and its previous dominator.
    pub fn attach_edge(&mut self, from: BlockId, to: BlockId, kind: EdgeKind) -> Result<()> {
        match kind {
            EdgeKind::Normal => self.blocks[from].successors.push(to),
            EdgeKind::Throw => {
                self.blocks[from].throw_catchers.push(to);
                self.blocks[to].is_exception_target = true;
            }
        }
        self.blocks[to].predecessors.push(from);

        if to == self.entry() {
            return Ok(());
        }

        let new_dominator = match self.blocks[to].dominator {
            None => from,
            Some(old) => {
                let chain = self.dominator_chain(from).collect::<HashSet<_>>();
                self.dominator_chain(old)
                    .find(|b| chain.contains(b))
                    .ok_or(InternalError::DisjointDominatorTrees { from, to })?
            }
        };

        if let Some(old) = self.blocks[to].dominator {
            if old == new_dominator {
                return Ok(());
            }
            self.blocks[old].dominees.retain(|b| *b != to);
        }

        self.blocks[to].dominator = Some(new_dominator);
        self.blocks[new_dominator].dominees.push(to);

        Ok(())
    }

    /// Blocks reachable from the entry in reverse postorder
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = HashSet::new();
        let mut postorder = Vec::new();
        let mut stack = vec![(self.entry(), false)];

        while let Some((block, expanded)) = stack.pop() {
            if expanded {
                postorder.push(block);
                continue;
            }
            if !visited.insert(block) {
                continue;
            }

            stack.push((block, true));
            let successors = self.all_successors(block).collect::<Vec<_>>();
            for successor in successors.into_iter().rev() {
                if !visited.contains(&successor) {
                    stack.push((successor, false));
                }
            }
        }

        postorder.reverse();
        postorder
    }

    /// The dominator tree in preorder, starting at the entry
    pub fn dominator_preorder(&self) -> Vec<BlockId> {
        let mut order = Vec::new();
        let mut stack = vec![self.entry()];

        while let Some(block) = stack.pop() {
            order.push(block);
            stack.extend(self.blocks[block].dominees.iter().rev().copied());
        }

        order
    }
}
