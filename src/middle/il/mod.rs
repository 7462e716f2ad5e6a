//! IL (Intermediate Language). Functions are graphs of basic blocks whose
//! instructions read and write SSA versions of variables. Control flow merges
//! carry explicit phi functions; exception edges are kept apart from normal
//! successors.

use std::collections::BTreeMap;

use crate::{
    frontend::{
        ast::{BinaryOperator, Constant, NodeId, Position, UnaryOperator},
        intern::InternedSymbol,
        symbol::SymbolId,
        types::VariableType,
    },
    index::{IndexVec, simple_index},
};

pub mod cfg;
pub mod fixup;
pub mod flow;
pub mod generator;
pub mod pretty_print;
pub mod verify;

pub use cfg::{ControlFlowGraph, EdgeKind};
pub use flow::FlowState;

simple_index! {
    /// Identifies an IL variable (a storage location, not a version of it)
    pub struct VariableId;
}

simple_index! {
    /// Identifies a basic block within one function
    pub struct BlockId;
}

impl BlockId {
    pub const ENTRY: Self = Self(0);
}

impl core::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ".block_{}", self.0)
    }
}

impl core::fmt::Display for SsaVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_anonymous() {
            write!(f, "%{}:?", self.variable.0)
        } else {
            write!(f, "%{}:{}", self.variable.0, self.version)
        }
    }
}

impl core::fmt::Display for AssignSsaVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}:{}", self.variable.0, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StorageClass {
    Stack,
    Global,
    /// Only sequences side effects, never holds a value
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub ty: VariableType,
    pub storage: StorageClass,
    pub name: String,
    /// Absent for compiler generated temporaries
    pub symbol: Option<SymbolId>,
}

/// A use of a variable. Version 0 is an anonymous use that the fixup pass
/// resolves to whatever version is visible at that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SsaVariable {
    pub variable: VariableId,
    pub version: u32,
}

impl SsaVariable {
    pub const fn anonymous(variable: VariableId) -> Self {
        Self {
            variable,
            version: 0,
        }
    }

    pub fn is_anonymous(self) -> bool {
        self.version == 0
    }
}

/// The definition of a version; every one of these is created exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssignSsaVariable {
    pub variable: VariableId,
    pub version: u32,
}

impl AssignSsaVariable {
    pub fn as_use(self) -> SsaVariable {
        SsaVariable {
            variable: self.variable,
            version: self.version,
        }
    }
}

impl From<AssignSsaVariable> for SsaVariable {
    fn from(value: AssignSsaVariable) -> Self {
        value.as_use()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstructionKind {
    Assign {
        target: AssignSsaVariable,
        source: SsaVariable,
    },
    Constant {
        target: AssignSsaVariable,
        value: Constant,
    },
    Unary {
        target: AssignSsaVariable,
        operator: UnaryOperator,
        operand: SsaVariable,
    },
    Binary {
        target: AssignSsaVariable,
        operator: BinaryOperator,
        lhs: SsaVariable,
        rhs: SsaVariable,
    },
    Cast {
        target: AssignSsaVariable,
        value: SsaVariable,
        to: VariableType,
    },
    RecordCellGet {
        target: AssignSsaVariable,
        record: SsaVariable,
        column: InternedSymbol,
    },
    FunctionCall {
        target: Option<AssignSsaVariable>,
        function: SymbolId,
        arguments: Vec<SsaVariable>,
    },
    FunctionPtrCall {
        target: Option<AssignSsaVariable>,
        pointer: SsaVariable,
        arguments: Vec<SsaVariable>,
    },
    MakeFunctionPtr {
        target: AssignSsaVariable,
        function: SymbolId,
    },
    ObjectMemberGet {
        target: AssignSsaVariable,
        object: SsaVariable,
        member: InternedSymbol,
    },
    ObjectMemberSet {
        object: SsaVariable,
        member: InternedSymbol,
        value: SsaVariable,
    },
    ObjectMethodCall {
        target: Option<AssignSsaVariable>,
        object: SsaVariable,
        method: InternedSymbol,
        arguments: Vec<SsaVariable>,
    },
    /// Reads the exception being handled, first instruction of a catch block
    LoadException {
        target: AssignSsaVariable,
    },
    /// Ends a block with two successors: `[true, false]`
    ConditionalJump {
        condition: SsaVariable,
    },
    Return {
        value: Option<SsaVariable>,
    },
    Throw {
        exception: SsaVariable,
        is_rethrow: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub kind: InstructionKind,
    pub position: Position,
    /// Implicit uses: globals read by a call, the extstate token
    pub uses: Vec<SsaVariable>,
    /// Implicit definitions: globals written by a call, the extstate token
    pub defs: Vec<AssignSsaVariable>,
}

impl Instruction {
    pub fn new(kind: InstructionKind, position: Position) -> Self {
        Self {
            kind,
            position,
            uses: Vec::new(),
            defs: Vec::new(),
        }
    }

    /// Whether executing the instruction can raise an exception
    pub fn can_throw(&self) -> bool {
        match &self.kind {
            InstructionKind::Assign { .. }
            | InstructionKind::Constant { .. }
            | InstructionKind::Unary { .. }
            | InstructionKind::MakeFunctionPtr { .. }
            | InstructionKind::LoadException { .. }
            | InstructionKind::ConditionalJump { .. }
            | InstructionKind::Return { .. } => false,
            InstructionKind::Binary { operator, .. } => operator.can_throw(),
            InstructionKind::Cast { .. }
            | InstructionKind::RecordCellGet { .. }
            | InstructionKind::FunctionCall { .. }
            | InstructionKind::FunctionPtrCall { .. }
            | InstructionKind::ObjectMemberGet { .. }
            | InstructionKind::ObjectMemberSet { .. }
            | InstructionKind::ObjectMethodCall { .. }
            | InstructionKind::Throw { .. } => true,
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstructionKind::ConditionalJump { .. }
                | InstructionKind::Return { .. }
                | InstructionKind::Throw { .. }
        )
    }

    /// The explicitly assigned version, if any
    pub fn target(&self) -> Option<AssignSsaVariable> {
        match &self.kind {
            InstructionKind::Assign { target, .. }
            | InstructionKind::Constant { target, .. }
            | InstructionKind::Unary { target, .. }
            | InstructionKind::Binary { target, .. }
            | InstructionKind::Cast { target, .. }
            | InstructionKind::RecordCellGet { target, .. }
            | InstructionKind::MakeFunctionPtr { target, .. }
            | InstructionKind::ObjectMemberGet { target, .. }
            | InstructionKind::LoadException { target } => Some(*target),
            InstructionKind::FunctionCall { target, .. }
            | InstructionKind::FunctionPtrCall { target, .. }
            | InstructionKind::ObjectMethodCall { target, .. } => *target,
            InstructionKind::ObjectMemberSet { .. }
            | InstructionKind::ConditionalJump { .. }
            | InstructionKind::Return { .. }
            | InstructionKind::Throw { .. } => None,
        }
    }

    /// Explicit and implicit definitions
    pub fn all_defs(&self) -> impl Iterator<Item = AssignSsaVariable> + '_ {
        self.target().into_iter().chain(self.defs.iter().copied())
    }

    /// Explicit and implicit uses, mutable so the fixup pass can resolve them
    pub fn uses_mut(&mut self) -> Vec<&mut SsaVariable> {
        let mut result: Vec<&mut SsaVariable> = Vec::new();

        match &mut self.kind {
            InstructionKind::Assign { source, .. } => result.push(source),
            InstructionKind::Constant { .. }
            | InstructionKind::MakeFunctionPtr { .. }
            | InstructionKind::LoadException { .. } => {}
            InstructionKind::Unary { operand, .. } => result.push(operand),
            InstructionKind::Binary { lhs, rhs, .. } => {
                result.push(lhs);
                result.push(rhs);
            }
            InstructionKind::Cast { value, .. } => result.push(value),
            InstructionKind::RecordCellGet { record, .. } => result.push(record),
            InstructionKind::FunctionCall { arguments, .. } => result.extend(arguments.iter_mut()),
            InstructionKind::FunctionPtrCall {
                pointer, arguments, ..
            } => {
                result.push(pointer);
                result.extend(arguments.iter_mut());
            }
            InstructionKind::ObjectMemberGet { object, .. } => result.push(object),
            InstructionKind::ObjectMemberSet { object, value, .. } => {
                result.push(object);
                result.push(value);
            }
            InstructionKind::ObjectMethodCall {
                object, arguments, ..
            } => {
                result.push(object);
                result.extend(arguments.iter_mut());
            }
            InstructionKind::ConditionalJump { condition } => result.push(condition),
            InstructionKind::Return { value } => result.extend(value.as_mut()),
            InstructionKind::Throw { exception, .. } => result.push(exception),
        }

        result.extend(self.uses.iter_mut());
        result
    }

    pub fn all_uses(&self) -> Vec<SsaVariable> {
        let mut copy = self.clone();
        copy.uses_mut().into_iter().map(|u| *u).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhiFunction {
    pub target: AssignSsaVariable,
    /// One `(version, predecessor)` pair per predecessor of the block
    pub parameters: Vec<(AssignSsaVariable, BlockId)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicBlock {
    pub instructions: Vec<Instruction>,
    pub phis: Vec<PhiFunction>,
    pub predecessors: Vec<BlockId>,
    /// Normal successors. After a conditional jump: `[true, false]`
    pub successors: Vec<BlockId>,
    /// Blocks receiving control when an instruction in this block throws
    pub throw_catchers: Vec<BlockId>,
    pub dominator: Option<BlockId>,
    pub dominees: Vec<BlockId>,
    pub is_exception_target: bool,
    /// Flow state at the start of the block, recorded for exception targets
    /// and merge points (after their phis)
    pub entry_state: Option<FlowState>,
    /// Relative execution frequency hint, not semantically meaningful
    pub frequency: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodedFunction {
    pub symbol: SymbolId,
    pub name: String,
    pub parameters: Vec<AssignSsaVariable>,
    /// Versions defined on function entry: parameters, every global and the
    /// extstate token
    pub entry_definitions: Vec<AssignSsaVariable>,
    pub cfg: ControlFlowGraph,
    /// For every TRY/CATCH and TRY/FINALLY, whether control can fall out of
    /// the try block
    pub try_end_reachability: BTreeMap<NodeId, bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub source_name: String,
    pub functions: Vec<CodedFunction>,
    pub variables: IndexVec<VariableId, Variable>,
    pub globals: Vec<VariableId>,
    pub exports: Vec<SymbolId>,
    pub loadlibs: Vec<String>,
    pub deinit_macro: Option<SymbolId>,
}

impl Module {
    pub fn function(&self, symbol: SymbolId) -> Option<&CodedFunction> {
        self.functions.iter().find(|f| f.symbol == symbol)
    }

    pub fn variable_by_name(&self, name: &str) -> Option<VariableId> {
        self.variables
            .enumerate()
            .find(|(_, variable)| variable.name.eq_ignore_ascii_case(name))
            .map(|(id, _)| id)
    }
}
