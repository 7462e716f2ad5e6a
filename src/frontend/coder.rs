//! Factory for new AST nodes. Passes that synthesize code never build
//! [`NodeKind`] values by hand; they go through [`AstCoder`], which records
//! the type of every expression it creates and keeps the stack of statements
//! under construction.

use crate::{
    error::{InternalError, Result},
    frontend::{
        ast::{
            Ast, BinaryOperator, Constant, DeepOperation, NodeId, NodeKind, Position,
            UnaryOperator, visit,
        },
        intern::InternedSymbol,
        symbol::{SymbolFlags, SymbolId, SymbolTable},
        types::{TypeStorage, VariableType},
    },
};

#[derive(Debug)]
enum FrameKind {
    Block,
    Then {
        condition: NodeId,
    },
    Else {
        condition: NodeId,
        then_branch: NodeId,
    },
    LoopBody {
        precondition: Option<NodeId>,
    },
    Try,
    Catch {
        try_block: NodeId,
        exception: Option<SymbolId>,
    },
    Finally {
        try_block: NodeId,
    },
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    position: Position,
    statements: Vec<NodeId>,
}

pub struct AstCoder<'a> {
    pub ast: &'a mut Ast,
    pub types: &'a mut TypeStorage,
    pub symbols: &'a mut SymbolTable,
    frames: Vec<Frame>,
    temporary_counter: u32,
}

impl<'a> AstCoder<'a> {
    pub fn new(ast: &'a mut Ast, types: &'a mut TypeStorage, symbols: &'a mut SymbolTable) -> Self {
        Self {
            ast,
            types,
            symbols,
            frames: Vec::new(),
            temporary_counter: 0,
        }
    }

    fn expression(&mut self, position: Position, kind: NodeKind, ty: VariableType) -> NodeId {
        let id = self.ast.push(position, kind);
        self.types.set(id, ty);
        id
    }

    pub fn type_of(&self, node: NodeId) -> Result<VariableType> {
        self.types.get(node)
    }

    /* Symbols */

    /// Registers a compiler generated local variable
    pub fn temporary(&mut self, hint: &str, ty: VariableType) -> SymbolId {
        let name = format!("__{hint}{}", self.temporary_counter);
        self.temporary_counter += 1;

        self.symbols
            .register_variable(&name, Position::default(), ty, SymbolFlags::empty())
    }

    /* Rvalues */

    pub fn constant(&mut self, position: Position, constant: Constant) -> NodeId {
        let ty = constant.ty();
        self.expression(position, NodeKind::Constant(constant), ty)
    }

    pub fn boolean(&mut self, position: Position, value: bool) -> NodeId {
        self.constant(position, Constant::Boolean(value))
    }

    pub fn integer(&mut self, position: Position, value: i32) -> NodeId {
        self.constant(position, Constant::Integer(value))
    }

    pub fn string(&mut self, position: Position, value: &str) -> NodeId {
        self.constant(position, Constant::String(value.to_owned()))
    }

    pub fn default_value(&mut self, position: Position, ty: VariableType) -> NodeId {
        self.constant(position, Constant::Default(ty))
    }

    pub fn variable(&mut self, position: Position, symbol: SymbolId) -> NodeId {
        let ty = self.symbols.variable_type(symbol);
        self.expression(position, NodeKind::Variable(symbol), ty)
    }

    pub fn unary(&mut self, position: Position, operator: UnaryOperator, operand: NodeId) -> Result<NodeId> {
        let ty = match operator {
            UnaryOperator::Not => VariableType::Boolean,
            _ => self.types.get(operand)?,
        };

        Ok(self.expression(position, NodeKind::Unary { operator, operand }, ty))
    }

    pub fn binary(
        &mut self,
        position: Position,
        operator: BinaryOperator,
        lhs: NodeId,
        rhs: NodeId,
    ) -> Result<NodeId> {
        let ty = if operator.is_comparison() || operator.is_logical() {
            VariableType::Boolean
        } else {
            self.types.get(lhs)?
        };

        Ok(self.expression(position, NodeKind::Binary { operator, lhs, rhs }, ty))
    }

    pub fn conditional(
        &mut self,
        position: Position,
        condition: NodeId,
        if_true: NodeId,
        if_false: NodeId,
    ) -> Result<NodeId> {
        let ty = self.types.get(if_true)?;

        Ok(self.expression(
            position,
            NodeKind::Conditional {
                condition,
                if_true,
                if_false,
            },
            ty,
        ))
    }

    pub fn cast(&mut self, position: Position, value: NodeId, to: VariableType) -> NodeId {
        self.expression(position, NodeKind::Cast { value, to }, to)
    }

    pub fn call(&mut self, position: Position, function: SymbolId, arguments: Vec<NodeId>) -> Result<NodeId> {
        let ty = self.symbols.function(function)?.return_type;

        Ok(self.expression(
            position,
            NodeKind::FunctionCall {
                function,
                arguments,
            },
            ty,
        ))
    }

    pub fn builtin(
        &mut self,
        position: Position,
        name: &'static str,
        arguments: Vec<NodeId>,
    ) -> Result<NodeId> {
        let function = self.symbols.resolve_builtin(name)?;
        self.call(position, function, arguments)
    }

    pub fn record_column(
        &mut self,
        position: Position,
        record: NodeId,
        column: InternedSymbol,
        ty: VariableType,
    ) -> NodeId {
        self.expression(position, NodeKind::RecordColumn { record, column }, ty)
    }

    pub fn record_constructor(&mut self, position: Position, cells: Vec<(InternedSymbol, NodeId)>) -> NodeId {
        self.expression(position, NodeKind::RecordConstructor(cells), VariableType::Record)
    }

    pub fn array_constructor(&mut self, position: Position, ty: VariableType, elements: Vec<NodeId>) -> NodeId {
        self.expression(position, NodeKind::ArrayConstructor { ty, elements }, ty)
    }

    pub fn block_expression(&mut self, position: Position, block: NodeId, result: NodeId) -> Result<NodeId> {
        let ty = self.types.get(result)?;
        Ok(self.expression(position, NodeKind::BlockExpression { block, result }, ty))
    }

    /// Copies a subtree so it can be used a second time in the tree
    pub fn deep_copy(&mut self, node: NodeId) -> NodeId {
        let position = self.ast.position(node);
        let kind = self.ast.kind(node).clone();
        let kind = visit::map_children(&kind, |child| self.deep_copy(child));

        let copy = self.ast.push(position, kind);
        if let Ok(ty) = self.types.get(node) {
            self.types.set(copy, ty);
        }
        copy
    }

    /* Statements */

    fn frame(&mut self) -> Result<&mut Frame> {
        self.frames.last_mut().ok_or_else(|| InternalError::Malformed {
            position: Position::default(),
            message: "no open block in the AST coder".to_owned(),
        })
    }

    fn pop_frame(&mut self) -> Result<Frame> {
        self.frames.pop().ok_or_else(|| InternalError::Malformed {
            position: Position::default(),
            message: "closing a block that was never opened".to_owned(),
        })
    }

    fn mismatch(frame: &Frame, expected: &str) -> InternalError {
        InternalError::Malformed {
            position: frame.position,
            message: format!("AST coder expected to close {expected}, found {:?}", frame.kind),
        }
    }

    fn push_frame(&mut self, position: Position, kind: FrameKind) {
        self.frames.push(Frame {
            kind,
            position,
            statements: Vec::new(),
        });
    }

    /// Appends a statement to the innermost open block
    pub fn add(&mut self, statement: NodeId) -> Result<()> {
        self.frame()?.statements.push(statement);
        Ok(())
    }

    fn add_new(&mut self, position: Position, kind: NodeKind) -> Result<NodeId> {
        let id = self.ast.push(position, kind);
        self.add(id)?;
        Ok(id)
    }

    fn block_of(&mut self, frame: Frame) -> NodeId {
        self.ast.push(frame.position, NodeKind::Block(frame.statements))
    }

    pub fn open_block(&mut self, position: Position) {
        self.push_frame(position, FrameKind::Block);
    }

    /// Closes the innermost block and returns it. The block is not added to
    /// the enclosing one.
    pub fn close_block(&mut self) -> Result<NodeId> {
        let frame = self.pop_frame()?;
        match frame.kind {
            FrameKind::Block => Ok(self.block_of(frame)),
            _ => Err(Self::mismatch(&frame, "a block")),
        }
    }

    pub fn open_if(&mut self, position: Position, condition: NodeId) {
        self.push_frame(position, FrameKind::Then { condition });
    }

    pub fn open_else(&mut self) -> Result<()> {
        let frame = self.pop_frame()?;
        let position = frame.position;
        let FrameKind::Then { condition } = frame.kind else {
            return Err(Self::mismatch(&frame, "an IF"));
        };

        let then_branch = self.block_of(frame);
        self.push_frame(
            position,
            FrameKind::Else {
                condition,
                then_branch,
            },
        );
        Ok(())
    }

    pub fn close_if(&mut self) -> Result<NodeId> {
        let frame = self.pop_frame()?;
        let position = frame.position;

        let kind = match frame.kind {
            FrameKind::Then { condition } => NodeKind::If {
                condition,
                then_branch: self.block_of(frame),
                else_branch: None,
            },
            FrameKind::Else {
                condition,
                then_branch,
            } => NodeKind::If {
                condition,
                then_branch,
                else_branch: Some(self.block_of(frame)),
            },
            _ => return Err(Self::mismatch(&frame, "an IF")),
        };

        self.add_new(position, kind)
    }

    pub fn open_loop(&mut self, position: Position, precondition: Option<NodeId>) {
        self.push_frame(position, FrameKind::LoopBody { precondition });
    }

    pub fn close_loop(&mut self, increment: Option<NodeId>) -> Result<NodeId> {
        let frame = self.pop_frame()?;
        let position = frame.position;
        let FrameKind::LoopBody { precondition } = frame.kind else {
            return Err(Self::mismatch(&frame, "a loop"));
        };

        let body = self.block_of(frame);
        self.add_new(
            position,
            NodeKind::Loop {
                precondition,
                increment,
                body,
            },
        )
    }

    pub fn open_try(&mut self, position: Position) {
        self.push_frame(position, FrameKind::Try);
    }

    pub fn open_catch(&mut self, exception: Option<SymbolId>) -> Result<()> {
        let frame = self.pop_frame()?;
        let position = frame.position;
        let FrameKind::Try = frame.kind else {
            return Err(Self::mismatch(&frame, "a TRY"));
        };

        let try_block = self.block_of(frame);
        self.push_frame(
            position,
            FrameKind::Catch {
                try_block,
                exception,
            },
        );
        Ok(())
    }

    pub fn close_try_catch(&mut self) -> Result<NodeId> {
        let frame = self.pop_frame()?;
        let position = frame.position;
        let FrameKind::Catch {
            try_block,
            exception,
        } = frame.kind
        else {
            return Err(Self::mismatch(&frame, "a CATCH"));
        };

        let catch_block = self.block_of(frame);
        self.add_new(
            position,
            NodeKind::TryCatch {
                try_block,
                exception,
                catch_block,
            },
        )
    }

    /// Ends the try block of a TRY/FINALLY and opens the finally block
    pub fn open_finally(&mut self) -> Result<()> {
        let frame = self.pop_frame()?;
        let position = frame.position;
        let FrameKind::Try = frame.kind else {
            return Err(Self::mismatch(&frame, "a TRY"));
        };

        let try_block = self.block_of(frame);
        self.push_frame(position, FrameKind::Finally { try_block });
        Ok(())
    }

    pub fn close_try_finally(&mut self) -> Result<NodeId> {
        let frame = self.pop_frame()?;
        let position = frame.position;
        let FrameKind::Finally { try_block } = frame.kind else {
            return Err(Self::mismatch(&frame, "a FINALLY"));
        };

        let finally_block = self.block_of(frame);
        self.add_new(
            position,
            NodeKind::TryFinally {
                try_block,
                finally_block,
            },
        )
    }

    /// A statement node that is built without adding it to the open block
    pub fn assignment_node(&mut self, position: Position, symbol: SymbolId, value: NodeId) -> NodeId {
        self.ast.push(position, NodeKind::Assignment { symbol, value })
    }

    pub fn assign(&mut self, position: Position, symbol: SymbolId, value: NodeId) -> Result<NodeId> {
        self.add_new(position, NodeKind::Assignment { symbol, value })
    }

    pub fn declare(&mut self, position: Position, symbol: SymbolId, initializer: Option<NodeId>) -> Result<NodeId> {
        self.add_new(
            position,
            NodeKind::VariableDeclaration {
                symbol,
                initializer,
            },
        )
    }

    pub fn evaluate(&mut self, position: Position, expression: NodeId) -> Result<NodeId> {
        self.add_new(position, NodeKind::ExpressionStatement(expression))
    }

    pub fn call_statement(
        &mut self,
        position: Position,
        name: &'static str,
        arguments: Vec<NodeId>,
    ) -> Result<NodeId> {
        let call = self.builtin(position, name, arguments)?;
        self.evaluate(position, call)
    }

    pub fn break_loop(&mut self, position: Position) -> Result<NodeId> {
        self.add_new(position, NodeKind::Break)
    }

    pub fn continue_loop(&mut self, position: Position) -> Result<NodeId> {
        self.add_new(position, NodeKind::Continue)
    }

    pub fn return_value(&mut self, position: Position, value: Option<NodeId>) -> Result<NodeId> {
        self.add_new(position, NodeKind::Return(value))
    }

    pub fn throw(&mut self, position: Position, exception: NodeId, is_rethrow: bool) -> Result<NodeId> {
        self.add_new(
            position,
            NodeKind::Throw {
                exception,
                is_rethrow,
            },
        )
    }

    pub fn deep_operation(&mut self, position: Position, operation: DeepOperation) -> Result<NodeId> {
        self.add_new(position, NodeKind::DeepOperation(Box::new(operation)))
    }

    /// Whether all opened blocks have been closed again
    pub fn is_balanced(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Ast, TypeStorage, SymbolTable) {
        let mut symbols = SymbolTable::new();
        symbols.register_builtins();
        (Ast::new(), TypeStorage::new(), symbols)
    }

    #[test]
    fn nested_constructs_close_in_order() {
        let (mut ast, mut types, mut symbols) = setup();
        let mut coder = AstCoder::new(&mut ast, &mut types, &mut symbols);
        let p = Position::new(1, 1);

        let x = coder.temporary("x", VariableType::Integer);

        coder.open_block(p);
        let condition = coder.boolean(p, true);
        coder.open_if(p, condition);
        let one = coder.integer(p, 1);
        coder.assign(p, x, one).unwrap();
        coder.open_else().unwrap();
        coder.open_loop(p, None);
        coder.break_loop(p).unwrap();
        coder.close_loop(None).unwrap();
        coder.close_if().unwrap();
        let block = coder.close_block().unwrap();

        assert!(coder.is_balanced());

        let NodeKind::Block(statements) = ast.kind(block) else {
            panic!("expected a block");
        };
        assert_eq!(statements.len(), 1);
        assert!(matches!(
            ast.kind(statements[0]),
            NodeKind::If {
                else_branch: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn mismatched_close_is_an_internal_error() {
        let (mut ast, mut types, mut symbols) = setup();
        let mut coder = AstCoder::new(&mut ast, &mut types, &mut symbols);

        coder.open_try(Position::new(4, 2));

        assert!(matches!(
            coder.close_block(),
            Err(InternalError::Malformed { .. })
        ));
    }

    #[test]
    fn deep_copy_duplicates_nodes_and_types() {
        let (mut ast, mut types, mut symbols) = setup();
        let mut coder = AstCoder::new(&mut ast, &mut types, &mut symbols);
        let p = Position::new(3, 9);

        let s = coder.string(p, "abc");
        let upper = coder.builtin(p, "TOUPPERCASE", vec![s]).unwrap();
        let copy = coder.deep_copy(upper);

        assert_ne!(copy, upper);
        assert!(coder.ast.same_expression(copy, upper));
        assert_eq!(coder.type_of(copy).unwrap(), VariableType::String);
    }
}
