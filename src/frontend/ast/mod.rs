//! The typed AST. All nodes of one compilation unit live in a single [`Ast`]
//! arena and refer to their children by [`NodeId`]. Every node is used only
//! once in the tree; passes that need an expression twice make a deep copy
//! through the coder.

use crate::{
    frontend::{intern::InternedSymbol, symbol::SymbolId, types::VariableType},
    index::{IndexVec, simple_index},
};

pub mod visit;

simple_index! {
    /// Identifies a node in the [`Ast`] arena
    pub struct NodeId;
}

/// Line and column of a node in the source file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl core::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub position: Position,
    pub kind: NodeKind,
}

#[derive(Debug, Default)]
pub struct Ast {
    nodes: IndexVec<NodeId, Node>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, position: Position, kind: NodeKind) -> NodeId {
        self.nodes.push(Node { position, kind })
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id].kind
    }

    pub fn position(&self, id: NodeId) -> Position {
        self.nodes[id].position
    }

    /// Swaps the contents of a node for a new kind, keeping its id (and so its
    /// place in the parent and its type annotation).
    pub fn replace(&mut self, id: NodeId, kind: NodeKind) -> NodeKind {
        std::mem::replace(&mut self.nodes[id].kind, kind)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes of the subtree rooted at `root`, in pre-order
    pub fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut stack = vec![root];

        while let Some(id) = stack.pop() {
            result.push(id);

            let children = visit::children(self.kind(id));
            stack.extend(children.into_iter().rev());
        }

        result
    }

    /// Whether the subtree reads any of the given symbols
    pub fn references_any(&self, root: NodeId, symbols: &[SymbolId]) -> bool {
        self.descendants(root)
            .into_iter()
            .any(|id| matches!(self.kind(id), NodeKind::Variable(symbol) if symbols.contains(symbol)))
    }

    /// Structural equality of two expressions, ignoring positions
    pub fn same_expression(&self, a: NodeId, b: NodeId) -> bool {
        let left = self.kind(a);
        let right = self.kind(b);

        let left_children = visit::children(left);
        let right_children = visit::children(right);

        if left_children.len() != right_children.len() {
            return false;
        }

        // compare the kinds with all children erased
        let erase = |kind: &NodeKind| visit::map_children(kind, |_| NodeId(0));
        if erase(left) != erase(right) {
            return false;
        }

        left_children
            .into_iter()
            .zip(right_children)
            .all(|(a, b)| self.same_expression(a, b))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Boolean(bool),
    Integer(i32),
    Integer64(i64),
    Float(f64),
    String(String),
    /// The default value of a type (empty string, empty array, non-existing
    /// record, ...)
    Default(VariableType),
}

impl Constant {
    pub fn ty(&self) -> VariableType {
        match self {
            Constant::Boolean(_) => VariableType::Boolean,
            Constant::Integer(_) => VariableType::Integer,
            Constant::Integer64(_) => VariableType::Integer64,
            Constant::Float(_) => VariableType::Float,
            Constant::String(_) => VariableType::String,
            Constant::Default(ty) => *ty,
        }
    }
}

impl core::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Boolean(value) => write!(f, "{}", if *value { "TRUE" } else { "FALSE" }),
            Constant::Integer(value) => write!(f, "{value}"),
            Constant::Integer64(value) => write!(f, "{value}i64"),
            Constant::Float(value) => write!(f, "{value:?}"),
            Constant::String(value) => write!(f, "{value:?}"),
            Constant::Default(ty) => write!(f, "DEFAULT {ty}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum UnaryOperator {
    #[strum(to_string = "NOT")]
    Not,
    #[strum(to_string = "-")]
    Negate,
    #[strum(to_string = "+")]
    Plus,
    #[strum(to_string = "BITNEG")]
    BitNegate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum BinaryOperator {
    #[strum(to_string = "AND")]
    And,
    #[strum(to_string = "OR")]
    Or,
    #[strum(to_string = "=")]
    Equal,
    #[strum(to_string = "!=")]
    NotEqual,
    #[strum(to_string = "<")]
    Less,
    #[strum(to_string = "<=")]
    LessEqual,
    #[strum(to_string = ">")]
    Greater,
    #[strum(to_string = ">=")]
    GreaterEqual,
    #[strum(to_string = "LIKE")]
    Like,
    #[strum(to_string = "IN")]
    In,
    #[strum(to_string = "+")]
    Add,
    #[strum(to_string = "-")]
    Subtract,
    #[strum(to_string = "*")]
    Multiply,
    #[strum(to_string = "/")]
    Divide,
    #[strum(to_string = "%")]
    Modulo,
    #[strum(to_string = "||")]
    Concat,
    #[strum(to_string = "BITAND")]
    BitAnd,
    #[strum(to_string = "BITOR")]
    BitOr,
    #[strum(to_string = "BITXOR")]
    BitXor,
}

impl BinaryOperator {
    pub fn is_comparison(self) -> bool {
        use BinaryOperator::*;

        matches!(
            self,
            Equal | NotEqual | Less | LessEqual | Greater | GreaterEqual | Like | In
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOperator::And | BinaryOperator::Or)
    }

    /// The operator to use when both operands trade places, if there is one
    pub fn swapped(self) -> Option<Self> {
        use BinaryOperator::*;

        Some(match self {
            Equal => Equal,
            NotEqual => NotEqual,
            Less => Greater,
            LessEqual => GreaterEqual,
            Greater => Less,
            GreaterEqual => LessEqual,
            _ => return None,
        })
    }

    /// Whether evaluating the operator can raise an exception at runtime
    pub fn can_throw(self) -> bool {
        matches!(self, BinaryOperator::Divide | BinaryOperator::Modulo)
    }
}

/// One step of the access path of a deep operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LayerKind {
    #[strum(to_string = "A")]
    Array,
    #[strum(to_string = "R")]
    Record,
    #[strum(to_string = "O")]
    Object,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub kind: LayerKind,
    /// Array index, or a string expression naming the record cell or member
    pub key: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeepOperationKind {
    Set,
    /// Insert into an array at a position, or append when there is none
    ArrayInsert { at: Option<NodeId> },
    ArrayDelete,
}

/// `base[a].b[c] := value` and its insert/delete cousins. Layers run from the
/// base outwards.
#[derive(Debug, Clone, PartialEq)]
pub struct DeepOperation {
    pub kind: DeepOperationKind,
    pub base: SymbolId,
    pub layers: Vec<Layer>,
    pub value: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum SqlSourceKind {
    Table,
    #[strum(to_string = "RECORDARRAY")]
    RecordArray,
}

/// A source of a query, bound to a row variable for the duration of the query
#[derive(Debug, Clone, PartialEq)]
pub struct SqlSource {
    pub position: Position,
    pub kind: SqlSourceKind,
    pub expression: NodeId,
    pub row: SymbolId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub name: InternedSymbol,
    pub expression: NodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expression: NodeId,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlSelect {
    pub sources: Vec<SqlSource>,
    /// `TEMPORARY name := expression`, evaluated per row before the WHERE
    pub temporaries: Vec<(SymbolId, NodeId)>,
    pub where_clause: Option<NodeId>,
    pub items: Vec<SelectItem>,
    pub group_by: Vec<NodeId>,
    pub having: Option<NodeId>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlDelete {
    pub source: SqlSource,
    pub where_clause: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlUpdate {
    pub source: SqlSource,
    pub assignments: Vec<(InternedSymbol, NodeId)>,
    pub where_clause: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlInsert {
    pub kind: SqlSourceKind,
    pub target: NodeId,
    pub values: Vec<(InternedSymbol, NodeId)>,
}

#[derive(Debug, Clone, PartialEq, strum::IntoStaticStr)]
pub enum NodeKind {
    /* Statements */
    Block(Vec<NodeId>),
    ExpressionStatement(NodeId),
    VariableDeclaration {
        symbol: SymbolId,
        initializer: Option<NodeId>,
    },
    Assignment {
        symbol: SymbolId,
        value: NodeId,
    },
    If {
        condition: NodeId,
        then_branch: NodeId,
        else_branch: Option<NodeId>,
    },
    /// All loop forms (`FOR`, `WHILE`, `FOREVERY` after desugaring)
    Loop {
        precondition: Option<NodeId>,
        increment: Option<NodeId>,
        body: NodeId,
    },
    Break,
    Continue,
    Return(Option<NodeId>),
    Throw {
        exception: NodeId,
        is_rethrow: bool,
    },
    TryCatch {
        try_block: NodeId,
        exception: Option<SymbolId>,
        catch_block: NodeId,
    },
    TryFinally {
        try_block: NodeId,
        finally_block: NodeId,
    },
    DeepOperation(Box<DeepOperation>),
    ObjectMemberAssign {
        object: NodeId,
        member: InternedSymbol,
        value: NodeId,
    },
    SqlDelete(Box<SqlDelete>),
    SqlUpdate(Box<SqlUpdate>),
    SqlInsert(Box<SqlInsert>),

    /* Rvalues */
    Constant(Constant),
    ConstantRecord(Vec<(InternedSymbol, Constant)>),
    ConstantArray(Vec<Constant>),
    Variable(SymbolId),
    Unary {
        operator: UnaryOperator,
        operand: NodeId,
    },
    Binary {
        operator: BinaryOperator,
        lhs: NodeId,
        rhs: NodeId,
    },
    Conditional {
        condition: NodeId,
        if_true: NodeId,
        if_false: NodeId,
    },
    Cast {
        value: NodeId,
        to: VariableType,
    },
    FunctionCall {
        function: SymbolId,
        arguments: Vec<NodeId>,
    },
    FunctionPtrCall {
        pointer: NodeId,
        arguments: Vec<NodeId>,
    },
    MakeFunctionPtr {
        function: SymbolId,
    },
    RecordColumn {
        record: NodeId,
        column: InternedSymbol,
    },
    ArrayElement {
        array: NodeId,
        index: NodeId,
    },
    ObjectMember {
        object: NodeId,
        member: InternedSymbol,
    },
    ObjectMethodCall {
        object: NodeId,
        method: InternedSymbol,
        arguments: Vec<NodeId>,
    },
    RecordConstructor(Vec<(InternedSymbol, NodeId)>),
    ArrayConstructor {
        ty: VariableType,
        elements: Vec<NodeId>,
    },
    /// Runs a block, then evaluates to `result`
    BlockExpression {
        block: NodeId,
        result: NodeId,
    },
    SqlSelect(Box<SqlSelect>),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    pub fn is_sql(&self) -> bool {
        matches!(
            self,
            NodeKind::SqlSelect(_)
                | NodeKind::SqlDelete(_)
                | NodeKind::SqlUpdate(_)
                | NodeKind::SqlInsert(_)
        )
    }

    pub fn as_boolean_constant(&self) -> Option<bool> {
        match self {
            NodeKind::Constant(Constant::Boolean(value)) => Some(*value),
            _ => None,
        }
    }
}

/// A function with a body in the compiled module
#[derive(Debug, Clone)]
pub struct Function {
    pub symbol: SymbolId,
    pub position: Position,
    pub body: NodeId,
}

/// A type checked module, ready for the middle end
#[derive(Debug, Clone)]
pub struct Module {
    pub source_name: String,
    pub functions: Vec<Function>,
    /// The implicit function running the top level code of the library
    pub initializer: SymbolId,
    /// The token standing in for all unmodeled external effects
    pub outside_state: SymbolId,
    pub loadlibs: Vec<String>,
}

impl Module {
    pub fn function(&self, symbol: SymbolId) -> Option<&Function> {
        self.functions.iter().find(|f| f.symbol == symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;

    #[test]
    fn descendants_are_preorder() {
        let mut ast = Ast::new();
        let p = Position::new(1, 1);
        let a = ast.push(p, NodeKind::Constant(Constant::Integer(1)));
        let b = ast.push(p, NodeKind::Constant(Constant::Integer(2)));
        let sum = ast.push(
            p,
            NodeKind::Binary {
                operator: BinaryOperator::Add,
                lhs: a,
                rhs: b,
            },
        );
        let statement = ast.push(p, NodeKind::ExpressionStatement(sum));

        assert_eq!(ast.descendants(statement), vec![statement, sum, a, b]);
    }

    #[test]
    fn same_expression_ignores_positions() {
        let mut ast = Ast::new();
        let x = SymbolId::new(3);

        let first = {
            let v = ast.push(Position::new(1, 1), NodeKind::Variable(x));
            ast.push(
                Position::new(1, 1),
                NodeKind::RecordColumn {
                    record: v,
                    column: InternedSymbol::new("A"),
                },
            )
        };
        let second = {
            let v = ast.push(Position::new(9, 4), NodeKind::Variable(x));
            ast.push(
                Position::new(9, 2),
                NodeKind::RecordColumn {
                    record: v,
                    column: InternedSymbol::new("A"),
                },
            )
        };
        let other = {
            let v = ast.push(Position::new(9, 4), NodeKind::Variable(x));
            ast.push(
                Position::new(9, 2),
                NodeKind::RecordColumn {
                    record: v,
                    column: InternedSymbol::new("B"),
                },
            )
        };

        assert!(ast.same_expression(first, second));
        assert!(!ast.same_expression(first, other));
    }

    #[test]
    fn node_kind_names() {
        assert_eq!(NodeKind::Break.name(), "Break");
        assert_eq!(NodeKind::ConstantArray(vec![]).name(), "ConstantArray");
    }
}
