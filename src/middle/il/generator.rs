//! Lowering of function bodies to SSA IL.
//!
//! The AST is walked once per function. Blocks are linked as they are
//! created (which keeps the dominator tree current), and every merge of
//! control flow goes through [`FunctionGenerator::merge_flows`], the only
//! place phi functions are created. Reads of variables are emitted as
//! anonymous uses; the fixup pass resolves them once all phis exist.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;
use itertools::Itertools;

use crate::{
    diagnostics::{ErrorCode, ErrorHandler},
    error::{InternalError, Result},
    frontend::{
        ast::{
            self, Ast, BinaryOperator, Constant, DeepOperation, DeepOperationKind, LayerKind,
            NodeId, NodeKind, Position,
        },
        intern::InternedSymbol,
        symbol::{SymbolFlags, SymbolId, SymbolTable},
        types::{TypeStorage, VariableType},
    },
    index::IndexVec,
    middle::{
        il::{
            self, AssignSsaVariable, BlockId, CodedFunction, ControlFlowGraph, EdgeKind, FlowState,
            Instruction, InstructionKind, PhiFunction, SsaVariable, StorageClass, Variable,
            VariableId, fixup,
            flow::{self, Flow},
        },
        use_analysis::UseAnalysis,
    },
    options::CompilerOptions,
};

/// A non-local exit waiting for a finally block to run. The payload of a
/// throw or return travels in the finally's value slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PendingExit {
    /// Falling out of the try block
    Normal,
    Throw,
    Return,
    Break,
    Continue,
}

impl PendingExit {
    /// The runtime value of the finally's discriminant variable
    fn discriminant(self) -> i32 {
        match self {
            PendingExit::Normal => 0,
            PendingExit::Throw => 1,
            PendingExit::Return => 2,
            PendingExit::Break => 3,
            PendingExit::Continue => 4,
        }
    }
}

#[derive(Debug, Default)]
struct LoopContext {
    breaks: Vec<Flow>,
    continues: Vec<Flow>,
}

/// Exception targets created while generating a try block
#[derive(Debug, Default)]
struct CatchContext {
    targets: Vec<BlockId>,
}

#[derive(Debug)]
struct FinallyContext {
    discriminant: VariableId,
    value: VariableId,
    /// Number of enclosing loops, a break or continue only passes through
    /// the finally when its loop is outside of it
    loop_depth: usize,
    pending: Vec<(PendingExit, Flow)>,
}

/// State shared by all functions of a module: the IL variables and their
/// version counters.
struct ModuleGenerator<'a> {
    ast: &'a Ast,
    symbols: &'a SymbolTable,
    types: &'a TypeStorage,
    analysis: &'a UseAnalysis,
    options: &'a CompilerOptions,
    diagnostics: &'a mut dyn ErrorHandler,

    variables: IndexVec<VariableId, Variable>,
    symbol_variables: HashMap<SymbolId, VariableId>,
    versions: HashMap<VariableId, u32>,
    next_global_version: u32,
    temporary_counter: u32,
}

impl<'a> ModuleGenerator<'a> {
    fn variable_for(&mut self, symbol: SymbolId) -> VariableId {
        if let Some(variable) = self.symbol_variables.get(&symbol) {
            return *variable;
        }

        let storage = if symbol == self.analysis.outside_state {
            StorageClass::None
        } else if self.analysis.is_global(symbol) {
            StorageClass::Global
        } else {
            StorageClass::Stack
        };

        let variable = self.variables.push(Variable {
            ty: self.symbols.variable_type(symbol),
            storage,
            name: self.symbols.name(symbol).to_owned(),
            symbol: Some(symbol),
        });
        self.symbol_variables.insert(symbol, variable);
        variable
    }

    fn extstate(&mut self) -> VariableId {
        self.variable_for(self.analysis.outside_state)
    }

    fn temporary(&mut self, ty: VariableType) -> VariableId {
        let name = format!("_t{}", self.temporary_counter);
        self.temporary_counter += 1;

        self.variables.push(Variable {
            ty,
            storage: StorageClass::Stack,
            name,
            symbol: None,
        })
    }

    /// Version numbers start at 1, 0 marks an anonymous use
    fn new_version(&mut self, variable: VariableId) -> AssignSsaVariable {
        let version = if self.options.debug_ssa_ids {
            self.next_global_version += 1;
            self.next_global_version
        } else {
            let counter = self.versions.entry(variable).or_insert(0);
            *counter += 1;
            *counter
        };

        AssignSsaVariable { variable, version }
    }

    fn type_of(&self, node: NodeId) -> VariableType {
        self.types.get(node).unwrap_or(VariableType::Variant)
    }

    fn generate_function(&mut self, function: &ast::Function) -> Result<CodedFunction> {
        let symbols = self.symbols;
        let analysis = self.analysis;
        let definition = symbols.function(function.symbol)?;
        let name = symbols.name(function.symbol);

        tracing::debug!(function = name, "generating IL");

        let parameters = definition
            .arguments
            .iter()
            .map(|argument| {
                let variable = self.variable_for(*argument);
                self.new_version(variable)
            })
            .collect::<Vec<_>>();

        let mut entry_definitions = parameters.clone();
        for global in &analysis.globals {
            let variable = self.variable_for(*global);
            entry_definitions.push(self.new_version(variable));
        }
        let entry_state = entry_definitions.iter().copied().collect::<FlowState>();

        let mut exit_uses = analysis
            .effects(function.symbol)
            .1
            .iter()
            .map(|global| self.variable_for(*global))
            .collect::<BTreeSet<_>>();
        exit_uses.insert(self.extstate());

        let mut cfg = ControlFlowGraph::new();
        let entry = cfg.entry();
        cfg.block_mut(entry).entry_state = Some(entry_state.clone());

        let mut generator = FunctionGenerator {
            module: self,
            symbol: function.symbol,
            position: function.position,
            is_macro: definition.is_macro(),
            cfg,
            current: Some(Flow::new(entry, entry_state)),
            loops: Vec::new(),
            catchers: Vec::new(),
            finallies: Vec::new(),
            exit_uses: exit_uses.into_iter().collect(),
            try_end_reachability: BTreeMap::new(),
        };

        generator.lower_statement(function.body)?;
        generator.finish()?;

        let FunctionGenerator {
            cfg,
            try_end_reachability,
            ..
        } = generator;

        let mut coded = CodedFunction {
            symbol: function.symbol,
            name: name.to_owned(),
            parameters,
            entry_definitions,
            cfg,
            try_end_reachability,
        };

        fixup::fix_function(&mut coded, &self.variables)?;

        tracing::debug!(function = name, blocks = coded.cfg.len(), "generated IL");

        Ok(coded)
    }
}

struct FunctionGenerator<'m, 'a> {
    module: &'m mut ModuleGenerator<'a>,
    symbol: SymbolId,
    position: Position,
    is_macro: bool,

    cfg: ControlFlowGraph,
    /// Where generation continues, `None` when the current point is
    /// unreachable
    current: Option<Flow>,

    loops: Vec<LoopContext>,
    catchers: Vec<CatchContext>,
    finallies: Vec<FinallyContext>,

    /// Variables kept live by leaving the function: the globals it defines
    /// and the extstate token
    exit_uses: Vec<VariableId>,
    try_end_reachability: BTreeMap<NodeId, bool>,
}

impl FunctionGenerator<'_, '_> {
    fn malformed(position: Position, message: &str) -> InternalError {
        InternalError::Malformed {
            position,
            message: message.to_owned(),
        }
    }

    fn unexpected(&self, node: NodeId) -> InternalError {
        let ast = self.module.ast;
        InternalError::UnexpectedNode {
            kind: ast.kind(node).name(),
            position: ast.position(node),
        }
    }

    /* Emission */

    fn emit(&mut self, instruction: Instruction) -> Result<()> {
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };

        // a throwing instruction has run its side effects but not stored
        // its result
        for def in &instruction.defs {
            current.state.define(*def);
        }

        let target = instruction.target();
        let can_throw = instruction.can_throw();
        self.cfg.block_mut(current.block).instructions.push(instruction);

        if can_throw {
            self.divert_exception()?;
        }

        if let (Some(target), Some(current)) = (target, self.current.as_mut()) {
            current.state.define(target);
        }

        Ok(())
    }

    /// Links the current block to a fresh exception target of the innermost
    /// try, which starts with the state right after the throwing instruction.
    fn divert_exception(&mut self) -> Result<()> {
        let (Some(current), Some(context)) = (&self.current, self.catchers.last()) else {
            return Ok(());
        };

        if let Some(last) = context.targets.last() {
            let target = self.cfg.block(*last);
            if target.predecessors == [current.block] && target.entry_state.as_ref() == Some(&current.state) {
                return Ok(());
            }
        }

        let block = current.block;
        let state = current.state.clone();

        let target = self.cfg.create_block();
        self.cfg.attach_edge(block, target, EdgeKind::Throw)?;
        self.cfg.block_mut(target).entry_state = Some(state);

        if let Some(context) = self.catchers.last_mut() {
            context.targets.push(target);
        }

        Ok(())
    }

    fn temporary(&mut self, ty: VariableType) -> AssignSsaVariable {
        let variable = self.module.temporary(ty);
        self.module.new_version(variable)
    }

    fn constant(&mut self, value: Constant, position: Position) -> Result<SsaVariable> {
        let target = self.temporary(value.ty());
        self.emit(Instruction::new(InstructionKind::Constant { target, value }, position))?;
        Ok(target.as_use())
    }

    fn assign_variable(&mut self, variable: VariableId, source: SsaVariable, position: Position) -> Result<()> {
        let target = self.module.new_version(variable);
        self.emit(Instruction::new(InstructionKind::Assign { target, source }, position))
    }

    fn read_variable(&mut self, symbol: SymbolId, position: Position) -> Result<SsaVariable> {
        let variable = self.module.variable_for(symbol);
        let source = SsaVariable::anonymous(variable);

        if self.module.variables[variable].storage != StorageClass::Global {
            return Ok(source);
        }

        // a call later in the same expression may define a new version
        let ty = self.module.variables[variable].ty;
        let copy = self.temporary(ty);
        self.emit(Instruction::new(InstructionKind::Assign { target: copy, source }, position))?;
        Ok(copy.as_use())
    }

    /// Makes an instruction read and write every global and the extstate
    /// token, for operations that can run arbitrary user code.
    fn touch_everything(&mut self, instruction: &mut Instruction) {
        let analysis = self.module.analysis;

        let mut variables = analysis
            .globals
            .iter()
            .map(|global| self.module.variable_for(*global))
            .collect::<BTreeSet<_>>();
        variables.insert(self.module.extstate());

        instruction.uses = variables.iter().map(|v| SsaVariable::anonymous(*v)).collect();
        instruction.defs = variables.iter().map(|v| self.module.new_version(*v)).collect();
    }

    fn exit_instruction(&mut self, kind: InstructionKind, position: Position) -> Instruction {
        let mut instruction = Instruction::new(kind, position);
        instruction.uses = self.exit_uses.iter().map(|v| SsaVariable::anonymous(*v)).collect();
        instruction
    }

    /* Merging */

    /// Joins flows into one point of continuation. A single flow continues
    /// in its own block; more get a new block with a phi for every variable
    /// that is visible in all flows with differing versions.
    fn merge_flows(&mut self, mut flows: Vec<Flow>) -> Result<Option<Flow>> {
        if flows.len() <= 1 {
            return Ok(flows.pop());
        }

        let plan = flow::plan_merge(&flows);
        let block = self.cfg.create_block();
        for flow in &flows {
            self.cfg.attach_edge(flow.block, block, EdgeKind::Normal)?;
        }

        let mut state = plan.agreed;
        let mut phis = Vec::new();
        for (variable, versions) in plan.divergent {
            let target = self.module.new_version(variable);
            let parameters = versions
                .into_iter()
                .zip(flows.iter().map(|flow| flow.block))
                .collect();

            phis.push(PhiFunction { target, parameters });
            state.define(target);
        }

        let merged = self.cfg.block_mut(block);
        merged.phis = phis;
        merged.entry_state = Some(state.clone());

        Ok(Some(Flow::new(block, state)))
    }

    /// Ends the current block with a conditional jump and generates both
    /// arms, merging whatever falls out of them.
    fn branch(
        &mut self,
        condition: SsaVariable,
        position: Position,
        on_true: impl FnOnce(&mut Self) -> Result<()>,
        on_false: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.emit(Instruction::new(InstructionKind::ConditionalJump { condition }, position))?;
        let Some(flow) = self.current.take() else {
            return Ok(());
        };

        let true_block = self.cfg.create_block();
        let false_block = self.cfg.create_block();
        self.cfg.attach_edge(flow.block, true_block, EdgeKind::Normal)?;
        self.cfg.attach_edge(flow.block, false_block, EdgeKind::Normal)?;

        self.current = Some(Flow::new(true_block, flow.state.clone()));
        on_true(self)?;
        let true_flow = self.current.take();

        self.current = Some(Flow::new(false_block, flow.state));
        on_false(self)?;
        let false_flow = self.current.take();

        self.current = self.merge_flows(true_flow.into_iter().chain(false_flow).collect())?;
        Ok(())
    }

    /* Calls */

    fn call(&mut self, function: SymbolId, arguments: Vec<SsaVariable>, position: Position) -> Result<Option<SsaVariable>> {
        let symbols = self.module.symbols;
        let analysis = self.module.analysis;
        let definition = symbols.function(function)?;
        let flags = symbols.flags(function);

        let target = (definition.return_type != VariableType::NoReturn).then(|| self.temporary(definition.return_type));

        let (uses, defs) = analysis.effects(function);
        let mut used = uses.iter().map(|s| self.module.variable_for(*s)).collect::<BTreeSet<_>>();
        let mut defined = defs.iter().map(|s| self.module.variable_for(*s)).collect::<BTreeSet<_>>();

        if !flags.contains(SymbolFlags::NO_STATE_MODIFY) {
            let extstate = self.module.extstate();
            used.insert(extstate);
            defined.insert(extstate);
        }

        let mut instruction = Instruction::new(
            InstructionKind::FunctionCall {
                target,
                function,
                arguments,
            },
            position,
        );
        instruction.uses = used.into_iter().map(SsaVariable::anonymous).collect();
        instruction.defs = defined.into_iter().map(|v| self.module.new_version(v)).collect();
        self.emit(instruction)?;

        if flags.contains(SymbolFlags::TERMINATES) {
            // never returns; anything after it is dead
            self.call_builtin(":THROWERROR", Vec::new(), position)?;
            self.current = None;
        }

        Ok(target.map(AssignSsaVariable::as_use))
    }

    fn call_builtin(&mut self, name: &'static str, arguments: Vec<SsaVariable>, position: Position) -> Result<Option<SsaVariable>> {
        let function = self.module.symbols.resolve_builtin(name)?;
        self.call(function, arguments, position)
    }

    fn call_builtin_value(&mut self, name: &'static str, arguments: Vec<SsaVariable>, position: Position) -> Result<SsaVariable> {
        self.call_builtin(name, arguments, position)?
            .ok_or_else(|| Self::malformed(position, "builtin used as a value has no result"))
    }

    fn lower_call(&mut self, function: SymbolId, arguments: &[NodeId], position: Position) -> Result<Option<SsaVariable>> {
        let symbols = self.module.symbols;
        let definition = symbols.function(function)?;

        let var_arg = symbols.flags(function).contains(SymbolFlags::VAR_ARG);
        let fixed = if var_arg {
            definition.arguments.len().saturating_sub(1).min(arguments.len())
        } else {
            arguments.len()
        };

        let mut values = self.lower_expressions(&arguments[..fixed])?;

        if var_arg {
            // trailing arguments travel as one VARIANT ARRAY
            let mut rest = self.constant(Constant::Default(VariableType::VariantArray), position)?;
            for argument in &arguments[fixed..] {
                let value = self.lower_expression(*argument)?;
                rest = self.call_builtin_value(":ARRAYAPPEND", vec![rest, value], position)?;
            }
            values.push(rest);
        }

        self.call(function, values, position)
    }

    fn throw_error(&mut self, position: Position) -> Result<()> {
        self.call_builtin(":THROWERROR", Vec::new(), position)?;
        Ok(())
    }

    /* Expressions */

    fn lower_expression(&mut self, id: NodeId) -> Result<SsaVariable> {
        let ast = self.module.ast;
        let position = ast.position(id);
        let ty = self.module.type_of(id);

        match ast.kind(id) {
            NodeKind::Constant(value) => self.constant(value.clone(), position),
            NodeKind::Variable(symbol) => self.read_variable(*symbol, position),
            NodeKind::Unary { operator, operand } => {
                let operand = self.lower_expression(*operand)?;
                let target = self.temporary(ty);
                self.emit(Instruction::new(
                    InstructionKind::Unary {
                        target,
                        operator: *operator,
                        operand,
                    },
                    position,
                ))?;
                Ok(target.as_use())
            }
            NodeKind::Binary {
                operator: operator @ (BinaryOperator::And | BinaryOperator::Or),
                lhs,
                rhs,
            } => self.lower_short_circuit(*operator, *lhs, *rhs, position),
            NodeKind::Binary { operator, lhs, rhs } => {
                let lhs = self.lower_expression(*lhs)?;
                let rhs = self.lower_expression(*rhs)?;
                let target = self.temporary(ty);
                self.emit(Instruction::new(
                    InstructionKind::Binary {
                        target,
                        operator: *operator,
                        lhs,
                        rhs,
                    },
                    position,
                ))?;
                Ok(target.as_use())
            }
            NodeKind::Conditional {
                condition,
                if_true,
                if_false,
            } => {
                let condition = self.lower_expression(*condition)?;
                let result = self.module.temporary(ty);
                let (if_true, if_false) = (*if_true, *if_false);

                self.branch(
                    condition,
                    position,
                    |g| {
                        let value = g.lower_expression(if_true)?;
                        g.assign_variable(result, value, position)
                    },
                    |g| {
                        let value = g.lower_expression(if_false)?;
                        g.assign_variable(result, value, position)
                    },
                )?;

                Ok(SsaVariable::anonymous(result))
            }
            NodeKind::Cast { value, to } => {
                let value = self.lower_expression(*value)?;
                let target = self.temporary(*to);
                self.emit(Instruction::new(InstructionKind::Cast { target, value, to: *to }, position))?;
                Ok(target.as_use())
            }
            NodeKind::FunctionCall {
                function,
                arguments,
            } => self
                .lower_call(*function, arguments, position)?
                .ok_or_else(|| Self::malformed(position, "macro call used as a value")),
            NodeKind::FunctionPtrCall { pointer, arguments } => {
                let pointer = self.lower_expression(*pointer)?;
                let arguments = self.lower_expressions(arguments)?;
                let target = (ty != VariableType::NoReturn).then(|| self.temporary(ty));

                let mut instruction = Instruction::new(
                    InstructionKind::FunctionPtrCall {
                        target,
                        pointer,
                        arguments,
                    },
                    position,
                );
                self.touch_everything(&mut instruction);
                self.emit(instruction)?;

                target
                    .map(AssignSsaVariable::as_use)
                    .ok_or_else(|| Self::malformed(position, "macro pointer call used as a value"))
            }
            NodeKind::MakeFunctionPtr { function } => {
                let target = self.temporary(VariableType::FunctionPtr);
                self.emit(Instruction::new(
                    InstructionKind::MakeFunctionPtr {
                        target,
                        function: *function,
                    },
                    position,
                ))?;
                Ok(target.as_use())
            }
            NodeKind::RecordColumn { record, column } => {
                let record = self.lower_expression(*record)?;
                let target = self.temporary(ty);
                self.emit(Instruction::new(
                    InstructionKind::RecordCellGet {
                        target,
                        record,
                        column: *column,
                    },
                    position,
                ))?;
                Ok(target.as_use())
            }
            NodeKind::ObjectMember { object, member } => {
                let object = self.lower_expression(*object)?;
                let target = self.temporary(ty);

                let mut instruction = Instruction::new(
                    InstructionKind::ObjectMemberGet {
                        target,
                        object,
                        member: *member,
                    },
                    position,
                );
                self.touch_everything(&mut instruction);
                self.emit(instruction)?;
                Ok(target.as_use())
            }
            NodeKind::ObjectMethodCall {
                object,
                method,
                arguments,
            } => self
                .lower_method_call(*object, *method, arguments, ty, position)?
                .ok_or_else(|| Self::malformed(position, "macro method call used as a value")),
            NodeKind::RecordConstructor(cells) => {
                let mut record = self.constant(Constant::Default(VariableType::Record), position)?;
                for (name, value) in cells {
                    let name = self.constant(Constant::String(name.value().to_owned()), position)?;
                    let value = self.lower_expression(*value)?;
                    record = self.call_builtin_value(":RECORDCELLCREATE", vec![record, name, value], position)?;
                }
                Ok(record)
            }
            NodeKind::ArrayConstructor { ty, elements } => {
                let mut array = self.constant(Constant::Default(*ty), position)?;
                for element in elements {
                    let value = self.lower_expression(*element)?;
                    array = self.call_builtin_value(":ARRAYAPPEND", vec![array, value], position)?;
                }
                Ok(array)
            }
            NodeKind::BlockExpression { block, result } => {
                self.lower_statement(*block)?;
                self.lower_expression(*result)
            }

            // must have been folded or rewritten by earlier passes
            NodeKind::ConstantRecord(_)
            | NodeKind::ConstantArray(_)
            | NodeKind::ArrayElement { .. }
            | NodeKind::SqlSelect(_) => Err(self.unexpected(id)),

            NodeKind::Block(_)
            | NodeKind::ExpressionStatement(_)
            | NodeKind::VariableDeclaration { .. }
            | NodeKind::Assignment { .. }
            | NodeKind::If { .. }
            | NodeKind::Loop { .. }
            | NodeKind::Break
            | NodeKind::Continue
            | NodeKind::Return(_)
            | NodeKind::Throw { .. }
            | NodeKind::TryCatch { .. }
            | NodeKind::TryFinally { .. }
            | NodeKind::DeepOperation(_)
            | NodeKind::ObjectMemberAssign { .. }
            | NodeKind::SqlDelete(_)
            | NodeKind::SqlUpdate(_)
            | NodeKind::SqlInsert(_) => Err(self.unexpected(id)),
        }
    }

    fn lower_expressions(&mut self, nodes: &[NodeId]) -> Result<Vec<SsaVariable>> {
        nodes.iter().map(|node| self.lower_expression(*node)).collect()
    }

    fn lower_short_circuit(&mut self, operator: BinaryOperator, lhs: NodeId, rhs: NodeId, position: Position) -> Result<SsaVariable> {
        let lhs = self.lower_expression(lhs)?;
        let result = self.module.temporary(VariableType::Boolean);
        self.assign_variable(result, lhs, position)?;

        let evaluate_rhs = move |g: &mut Self| {
            let value = g.lower_expression(rhs)?;
            g.assign_variable(result, value, position)
        };

        match operator {
            BinaryOperator::And => self.branch(lhs, position, evaluate_rhs, |_| Ok(()))?,
            _ => self.branch(lhs, position, |_| Ok(()), evaluate_rhs)?,
        }

        Ok(SsaVariable::anonymous(result))
    }

    fn lower_method_call(
        &mut self,
        object: NodeId,
        method: InternedSymbol,
        arguments: &[NodeId],
        ty: VariableType,
        position: Position,
    ) -> Result<Option<SsaVariable>> {
        let object = self.lower_expression(object)?;
        let arguments = self.lower_expressions(arguments)?;
        let target = (ty != VariableType::NoReturn).then(|| self.temporary(ty));

        let mut instruction = Instruction::new(
            InstructionKind::ObjectMethodCall {
                target,
                object,
                method,
                arguments,
            },
            position,
        );
        self.touch_everything(&mut instruction);
        self.emit(instruction)?;

        Ok(target.map(AssignSsaVariable::as_use))
    }

    /* Statements */

    fn lower_statement(&mut self, id: NodeId) -> Result<()> {
        if self.current.is_none() {
            return Ok(());
        }

        let ast = self.module.ast;
        let position = ast.position(id);

        match ast.kind(id) {
            NodeKind::Block(statements) => {
                for statement in statements {
                    self.lower_statement(*statement)?;
                }
            }
            NodeKind::ExpressionStatement(expression) => match ast.kind(*expression) {
                NodeKind::FunctionCall {
                    function,
                    arguments,
                } => {
                    self.lower_call(*function, arguments, ast.position(*expression))?;
                }
                NodeKind::ObjectMethodCall {
                    object,
                    method,
                    arguments,
                } => {
                    let ty = self.module.type_of(*expression);
                    self.lower_method_call(*object, *method, arguments, ty, ast.position(*expression))?;
                }
                _ => {
                    self.lower_expression(*expression)?;
                }
            },
            NodeKind::VariableDeclaration {
                symbol,
                initializer,
            } => {
                let value = match initializer {
                    Some(initializer) => self.lower_expression(*initializer)?,
                    None => {
                        let ty = self.module.symbols.variable_type(*symbol);
                        self.constant(Constant::Default(ty), position)?
                    }
                };
                let variable = self.module.variable_for(*symbol);
                self.assign_variable(variable, value, position)?;
            }
            NodeKind::Assignment { symbol, value } => {
                let value = self.lower_expression(*value)?;
                let variable = self.module.variable_for(*symbol);
                self.assign_variable(variable, value, position)?;
            }
            NodeKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let condition = self.lower_expression(*condition)?;
                let (then_branch, else_branch) = (*then_branch, *else_branch);

                self.branch(
                    condition,
                    position,
                    |g| g.lower_statement(then_branch),
                    |g| match else_branch {
                        Some(else_branch) => g.lower_statement(else_branch),
                        None => Ok(()),
                    },
                )?;
            }
            NodeKind::Loop {
                precondition,
                increment,
                body,
            } => self.lower_loop(*precondition, *increment, *body, position)?,
            NodeKind::Break => self.lower_break(position)?,
            NodeKind::Continue => self.lower_continue(position)?,
            NodeKind::Return(value) => {
                let value = value.map(|value| self.lower_expression(value)).transpose()?;
                self.lower_return(value, position)?;
            }
            NodeKind::Throw {
                exception,
                is_rethrow,
            } => {
                let exception = self.lower_expression(*exception)?;
                self.lower_throw(exception, *is_rethrow, position)?;
            }
            NodeKind::TryCatch {
                try_block,
                exception,
                catch_block,
            } => self.lower_try_catch(id, *try_block, *exception, *catch_block, position)?,
            NodeKind::TryFinally {
                try_block,
                finally_block,
            } => self.lower_try_finally(id, *try_block, *finally_block, position)?,
            NodeKind::DeepOperation(operation) => self.lower_deep_operation(operation, position)?,
            NodeKind::ObjectMemberAssign {
                object,
                member,
                value,
            } => {
                let object = self.lower_expression(*object)?;
                let value = self.lower_expression(*value)?;

                let mut instruction = Instruction::new(
                    InstructionKind::ObjectMemberSet {
                        object,
                        member: *member,
                        value,
                    },
                    position,
                );
                self.touch_everything(&mut instruction);
                self.emit(instruction)?;
            }

            NodeKind::SqlDelete(_) | NodeKind::SqlUpdate(_) | NodeKind::SqlInsert(_) => {
                return Err(self.unexpected(id));
            }

            NodeKind::Constant(_)
            | NodeKind::ConstantRecord(_)
            | NodeKind::ConstantArray(_)
            | NodeKind::Variable(_)
            | NodeKind::Unary { .. }
            | NodeKind::Binary { .. }
            | NodeKind::Conditional { .. }
            | NodeKind::Cast { .. }
            | NodeKind::FunctionCall { .. }
            | NodeKind::FunctionPtrCall { .. }
            | NodeKind::MakeFunctionPtr { .. }
            | NodeKind::RecordColumn { .. }
            | NodeKind::ArrayElement { .. }
            | NodeKind::ObjectMember { .. }
            | NodeKind::ObjectMethodCall { .. }
            | NodeKind::RecordConstructor(_)
            | NodeKind::ArrayConstructor { .. }
            | NodeKind::BlockExpression { .. }
            | NodeKind::SqlSelect(_) => return Err(self.unexpected(id)),
        }

        Ok(())
    }

    /// Like [`Self::merge_flows`], but a single flow also continues in a
    /// block of its own
    fn enter_block(&mut self, mut flows: Vec<Flow>) -> Result<Option<Flow>> {
        if flows.len() > 1 {
            return self.merge_flows(flows);
        }
        let Some(flow) = flows.pop() else {
            return Ok(None);
        };

        let block = self.cfg.create_block();
        self.cfg.attach_edge(flow.block, block, EdgeKind::Normal)?;
        Ok(Some(Flow::new(block, flow.state)))
    }

    /// Evaluates the precondition at the end of the current block. The
    /// false edge is left in `exits`, the current flow continues on the
    /// true edge.
    fn test_precondition(&mut self, precondition: Option<NodeId>, position: Position, exits: &mut Vec<Flow>) -> Result<()> {
        let Some(precondition) = precondition else {
            return Ok(());
        };

        let condition = self.lower_expression(precondition)?;
        self.emit(Instruction::new(InstructionKind::ConditionalJump { condition }, position))?;
        if let Some(flow) = &self.current {
            exits.push(flow.clone());
        }
        Ok(())
    }

    /// Six blocks: entry check, header, body, increment, recheck and exit.
    /// The precondition runs once in the entry check and again in the
    /// recheck after every increment, both jump to the header or the exit.
    /// Breaks go to the exit, continues to the increment.
    ///
    /// The header phis are only known once the back edge from the recheck
    /// exists, so everything after the header is generated against the
    /// entry versions and patched afterwards.
    fn lower_loop(&mut self, precondition: Option<NodeId>, increment: Option<NodeId>, body: NodeId, position: Position) -> Result<()> {
        let Some(before) = self.current.take() else {
            return Ok(());
        };

        self.current = self.enter_block(vec![before])?;
        let mut entry_exits = Vec::new();
        self.test_precondition(precondition, position, &mut entry_exits)?;

        let Some(entry) = self.current.take() else {
            self.current = self.enter_block(entry_exits)?;
            return Ok(());
        };

        let header = self.cfg.create_block();
        self.cfg.attach_edge(entry.block, header, EdgeKind::Normal)?;
        let body_block = self.cfg.create_block();
        self.cfg.attach_edge(header, body_block, EdgeKind::Normal)?;
        self.current = Some(Flow::new(body_block, entry.state.clone()));

        self.loops.push(LoopContext::default());
        self.lower_statement(body)?;
        let context = self
            .loops
            .pop()
            .ok_or_else(|| Self::malformed(position, "loop context vanished"))?;

        let flows = self.current.take().into_iter().chain(context.continues).collect();
        self.current = self.enter_block(flows)?;
        if let Some(increment) = increment {
            self.lower_statement(increment)?;
        }

        let flows = self.current.take().into_iter().collect();
        self.current = self.enter_block(flows)?;
        let mut recheck_exits = Vec::new();
        if self.current.is_some() {
            self.test_precondition(precondition, position, &mut recheck_exits)?;
        }

        let back_edge = self.current.take();
        if let Some(back) = &back_edge {
            self.cfg.attach_edge(back.block, header, EdgeKind::Normal)?;
        }

        /* Header phis, now that the back edge is known */

        let mut replacements = HashMap::new();
        let mut header_state = entry.state.clone();
        let mut phis = Vec::new();

        if let Some(back) = &back_edge {
            for version in entry.state.iter() {
                let Some(back_version) = back.state.get(version.variable) else {
                    continue;
                };
                if back_version == version {
                    continue;
                }

                let target = self.module.new_version(version.variable);
                phis.push(PhiFunction {
                    target,
                    parameters: vec![(version, entry.block), (back_version, back.block)],
                });
                replacements.insert(version, target);
                header_state.define(target);
            }
        }

        let header_block = self.cfg.block_mut(header);
        header_block.phis = phis;
        header_block.entry_state = Some(header_state);

        let mut breaks = context.breaks;
        if !replacements.is_empty() {
            tracing::trace!(%header, replaced = replacements.len(), "loop header phis");
            self.replace_versions_after(header, &replacements);

            for flow in breaks.iter_mut().chain(recheck_exits.iter_mut()) {
                flow.state.apply_replacements(&replacements);
            }
        }

        // the entry check exit never passed the header and keeps its versions
        let exits = entry_exits.into_iter().chain(recheck_exits).chain(breaks).collect();
        self.current = self.enter_block(exits)?;

        Ok(())
    }

    /// Rewrites the versions that a loop header phi replaced in everything
    /// generated after the header.
    fn replace_versions_after(&mut self, header: BlockId, replacements: &HashMap<AssignSsaVariable, AssignSsaVariable>) {
        for block in self.cfg.blocks.indices().filter(|block| *block > header).collect::<Vec<_>>() {
            let block = self.cfg.block_mut(block);

            for phi in &mut block.phis {
                for (version, _) in &mut phi.parameters {
                    if let Some(replacement) = replacements.get(version) {
                        *version = *replacement;
                    }
                }
            }

            if let Some(state) = &mut block.entry_state {
                state.apply_replacements(replacements);
            }
        }

        for finally in &mut self.finallies {
            for (_, flow) in &mut finally.pending {
                if flow.block > header {
                    flow.state.apply_replacements(replacements);
                }
            }
        }
    }

    fn lower_break(&mut self, position: Position) -> Result<()> {
        if self.loops.is_empty() {
            return Err(Self::malformed(position, "BREAK outside of a loop"));
        }
        if self.finallies.last().is_some_and(|f| f.loop_depth == self.loops.len()) {
            return self.route_exit(PendingExit::Break, None, position);
        }

        if let (Some(flow), Some(context)) = (self.current.take(), self.loops.last_mut()) {
            context.breaks.push(flow);
        }
        Ok(())
    }

    fn lower_continue(&mut self, position: Position) -> Result<()> {
        if self.loops.is_empty() {
            return Err(Self::malformed(position, "CONTINUE outside of a loop"));
        }
        if self.finallies.last().is_some_and(|f| f.loop_depth == self.loops.len()) {
            return self.route_exit(PendingExit::Continue, None, position);
        }

        if let (Some(flow), Some(context)) = (self.current.take(), self.loops.last_mut()) {
            context.continues.push(flow);
        }
        Ok(())
    }

    fn lower_return(&mut self, value: Option<SsaVariable>, position: Position) -> Result<()> {
        if !self.finallies.is_empty() {
            return self.route_exit(PendingExit::Return, value, position);
        }

        let instruction = self.exit_instruction(InstructionKind::Return { value }, position);
        self.emit(instruction)?;
        self.current = None;
        Ok(())
    }

    fn lower_throw(&mut self, exception: SsaVariable, is_rethrow: bool, position: Position) -> Result<()> {
        let kind = InstructionKind::Throw {
            exception,
            is_rethrow,
        };
        let instruction = if self.catchers.is_empty() {
            self.exit_instruction(kind, position)
        } else {
            Instruction::new(kind, position)
        };

        self.emit(instruction)?;
        self.current = None;
        Ok(())
    }

    fn lower_try_catch(
        &mut self,
        node: NodeId,
        try_block: NodeId,
        exception: Option<SymbolId>,
        catch_block: NodeId,
        position: Position,
    ) -> Result<()> {
        self.catchers.push(CatchContext::default());
        self.lower_statement(try_block)?;
        let context = self
            .catchers
            .pop()
            .ok_or_else(|| Self::malformed(position, "catch context vanished"))?;

        self.try_end_reachability.insert(node, self.current.is_some());
        let try_end = self.current.take();

        let targets = self.exception_flows(&context);
        self.current = self.merge_flows(targets)?;

        if self.current.is_some() {
            if let Some(exception) = exception {
                let variable = self.module.variable_for(exception);
                let target = self.module.new_version(variable);
                self.emit(Instruction::new(InstructionKind::LoadException { target }, position))?;
            }
            self.lower_statement(catch_block)?;
        }
        let catch_end = self.current.take();

        self.current = self.merge_flows(try_end.into_iter().chain(catch_end).collect())?;
        Ok(())
    }

    fn exception_flows(&self, context: &CatchContext) -> Vec<Flow> {
        context
            .targets
            .iter()
            .map(|target| {
                let state = self.cfg.block(*target).entry_state.clone().unwrap_or_default();
                Flow::new(*target, state)
            })
            .collect()
    }

    fn route_exit(&mut self, exit: PendingExit, value: Option<SsaVariable>, position: Position) -> Result<()> {
        let Some(finally) = self.finallies.last() else {
            return Err(Self::malformed(position, "no finally block to route through"));
        };
        let (discriminant, slot) = (finally.discriminant, finally.value);

        let code = self.constant(Constant::Integer(exit.discriminant()), position)?;
        self.assign_variable(discriminant, code, position)?;
        if let Some(value) = value {
            self.assign_variable(slot, value, position)?;
        }

        if let (Some(flow), Some(finally)) = (self.current.take(), self.finallies.last_mut()) {
            finally.pending.push((exit, flow));
        }
        Ok(())
    }

    /// All exits of the try block (normal, throw, return, break, continue)
    /// set a discriminant and meet before the single copy of the finally
    /// block, which then dispatches on the discriminant.
    fn lower_try_finally(&mut self, node: NodeId, try_block: NodeId, finally_block: NodeId, position: Position) -> Result<()> {
        let discriminant = self.module.temporary(VariableType::Integer);
        let value = self.module.temporary(VariableType::Variant);

        let code = self.constant(Constant::Integer(PendingExit::Normal.discriminant()), position)?;
        self.assign_variable(discriminant, code, position)?;
        let nothing = self.constant(Constant::Default(VariableType::Variant), position)?;
        self.assign_variable(value, nothing, position)?;

        self.finallies.push(FinallyContext {
            discriminant,
            value,
            loop_depth: self.loops.len(),
            pending: Vec::new(),
        });
        self.catchers.push(CatchContext::default());

        self.lower_statement(try_block)?;

        let catcher = self
            .catchers
            .pop()
            .ok_or_else(|| Self::malformed(position, "catch context vanished"))?;
        let mut finally = self
            .finallies
            .pop()
            .ok_or_else(|| Self::malformed(position, "finally context vanished"))?;

        self.try_end_reachability.insert(node, self.current.is_some());
        if let Some(flow) = self.current.take() {
            finally.pending.push((PendingExit::Normal, flow));
        }

        let targets = self.exception_flows(&catcher);
        self.current = self.merge_flows(targets)?;
        if self.current.is_some() {
            let target = self.module.new_version(value);
            self.emit(Instruction::new(InstructionKind::LoadException { target }, position))?;
            let code = self.constant(Constant::Integer(PendingExit::Throw.discriminant()), position)?;
            self.assign_variable(discriminant, code, position)?;

            if let Some(flow) = self.current.take() {
                finally.pending.push((PendingExit::Throw, flow));
            }
        }

        let exits = finally.pending.iter().map(|(exit, _)| *exit).collect::<BTreeSet<_>>();
        let flows = finally.pending.into_iter().map(|(_, flow)| flow).collect();
        self.current = self.merge_flows(flows)?;

        self.lower_statement(finally_block)?;

        let falls_through = exits.contains(&PendingExit::Normal);
        let abnormal = exits
            .into_iter()
            .filter(|exit| *exit != PendingExit::Normal)
            .collect_vec();

        for (i, exit) in abnormal.iter().copied().enumerate() {
            if self.current.is_none() {
                break;
            }

            if i + 1 == abnormal.len() && !falls_through {
                self.resume_exit(exit, value, position)?;
                break;
            }

            let code = self.constant(Constant::Integer(exit.discriminant()), position)?;
            let test = self.temporary(VariableType::Boolean);
            self.emit(Instruction::new(
                InstructionKind::Binary {
                    target: test,
                    operator: BinaryOperator::Equal,
                    lhs: SsaVariable::anonymous(discriminant),
                    rhs: code,
                },
                position,
            ))?;

            self.branch(test.as_use(), position, |g| g.resume_exit(exit, value, position), |_| Ok(()))?;
        }

        Ok(())
    }

    /// Continues a non-local exit after its finally block ran
    fn resume_exit(&mut self, exit: PendingExit, slot: VariableId, position: Position) -> Result<()> {
        let value = SsaVariable::anonymous(slot);

        match exit {
            PendingExit::Normal => Ok(()),
            PendingExit::Throw => self.lower_throw(value, true, position),
            PendingExit::Return => {
                let value = (!self.is_macro).then_some(value);
                self.lower_return(value, position)
            }
            PendingExit::Break => self.lower_break(position),
            PendingExit::Continue => self.lower_continue(position),
        }
    }

    fn lower_deep_operation(&mut self, operation: &DeepOperation, position: Position) -> Result<()> {
        let symbols = self.module.symbols;

        let base = self.read_variable(operation.base, position)?;
        let tag = operation.layers.iter().map(|layer| layer.kind.to_string()).collect::<String>();
        let tag = self.constant(Constant::String(tag), position)?;

        let mut arguments = vec![base, tag];
        for layer in &operation.layers {
            arguments.push(self.lower_expression(layer.key)?);
        }
        if let DeepOperationKind::ArrayInsert { at: Some(at) } = operation.kind {
            arguments.push(self.lower_expression(at)?);
        }
        if let Some(value) = operation.value {
            arguments.push(self.lower_expression(value)?);
        }

        let name = match operation.kind {
            DeepOperationKind::Set => ":DEEPSET",
            DeepOperationKind::ArrayInsert { at: Some(_) } => ":DEEPARRAYINSERT",
            DeepOperationKind::ArrayInsert { at: None } => ":DEEPARRAYAPPEND",
            DeepOperationKind::ArrayDelete => ":DEEPARRAYDELETE",
        };
        let function = symbols.resolve_builtin(name)?;

        let through_object = operation
            .layers
            .first()
            .is_some_and(|layer| layer.kind == LayerKind::Object);

        if through_object {
            // the object keeps its identity, member setters may run user code
            let mut instruction = Instruction::new(
                InstructionKind::FunctionCall {
                    target: None,
                    function,
                    arguments,
                },
                position,
            );
            self.touch_everything(&mut instruction);
            self.emit(instruction)
        } else {
            let variable = self.module.variable_for(operation.base);
            let target = self.module.new_version(variable);
            self.emit(Instruction::new(
                InstructionKind::FunctionCall {
                    target: Some(target),
                    function,
                    arguments,
                },
                position,
            ))
        }
    }

    fn finish(&mut self) -> Result<()> {
        if self.current.is_none() {
            return Ok(());
        }

        if self.is_macro {
            let instruction = self.exit_instruction(InstructionKind::Return { value: None }, self.position);
            self.emit(instruction)?;
        } else {
            let name = self.module.symbols.name(self.symbol).to_owned();
            self.module
                .diagnostics
                .add_error(self.position, ErrorCode::FunctionMustReturnValue, Some(name));
            self.throw_error(self.position)?;
        }

        self.current = None;
        Ok(())
    }
}

/// Generates the IL of every function with a body, then resolves all
/// anonymous uses.
pub fn generate_module(
    ast: &Ast,
    module: &ast::Module,
    symbols: &SymbolTable,
    types: &TypeStorage,
    analysis: &UseAnalysis,
    options: &CompilerOptions,
    diagnostics: &mut dyn ErrorHandler,
) -> Result<il::Module> {
    let mut generator = ModuleGenerator {
        ast,
        symbols,
        types,
        analysis,
        options,
        diagnostics,
        variables: IndexVec::new(),
        symbol_variables: HashMap::new(),
        versions: HashMap::new(),
        next_global_version: 0,
        temporary_counter: 0,
    };

    let mut functions = Vec::with_capacity(module.functions.len());
    let mut deinit_macro = None;

    for function in &module.functions {
        if symbols.flags(function.symbol).contains(SymbolFlags::DEINIT_MACRO) {
            if deinit_macro.is_some() {
                generator.diagnostics.add_error(
                    function.position,
                    ErrorCode::MultipleDeinitMacros,
                    Some(symbols.name(function.symbol).to_owned()),
                );
            } else {
                deinit_macro = Some(function.symbol);
            }
        }

        functions.push(generator.generate_function(function)?);
    }

    let globals = analysis
        .globals
        .iter()
        .map(|global| generator.variable_for(*global))
        .collect();

    let exported_functions = module
        .functions
        .iter()
        .map(|function| function.symbol)
        .filter(|symbol| symbols.flags(*symbol).contains(SymbolFlags::PUBLIC));
    let exported_variables = analysis
        .globals
        .iter()
        .copied()
        .filter(|symbol| symbols.flags(*symbol).contains(SymbolFlags::PUBLIC));
    let exports = exported_functions.chain(exported_variables).sorted().dedup().collect();

    Ok(il::Module {
        source_name: module.source_name.clone(),
        functions,
        variables: generator.variables,
        globals,
        exports,
        loadlibs: module.loadlibs.clone(),
        deinit_macro,
    })
}
