//! Splitting of a WHERE clause into conditions the query engine evaluates
//! (single column directives and two source relations) and a residual
//! expression for generated code. The conditional structure of the clause is
//! kept as a tree of [`TreeLevel`]s, so every part is still evaluated under
//! the same guards as in the source.

use std::collections::VecDeque;

use crate::{
    diagnostics::{ErrorHandler, WarningCode},
    frontend::{
        ast::{Ast, BinaryOperator, NodeId, NodeKind, Position, UnaryOperator},
        intern::InternedSymbol,
        symbol::{SymbolId, SymbolTable},
    },
};

/// A `source.column` operand, found by [`QuerySources::table_column`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnRef {
    pub source: usize,
    pub column: InternedSymbol,
    /// Wrapped in `TOUPPERCASE`, compared case insensitively
    pub uppercase: bool,
}

/// How a directive gets its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveValue {
    Expression(NodeId),
    /// A bare boolean column used as a condition
    Boolean(bool),
}

/// `column <operator> value` for one source
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub column: ColumnRef,
    pub operator: BinaryOperator,
    pub value: DirectiveValue,
    /// The leaf this directive was made from
    pub origin: NodeId,
}

/// `left <operator> right` across two sources
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub left: ColumnRef,
    pub operator: BinaryOperator,
    pub right: ColumnRef,
    pub origin: NodeId,
}

/// A guard that does not depend on the rows
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub condition: NodeId,
    pub if_true: TreeLevel,
    pub if_false: TreeLevel,
}

/// One conjunction: all directives, relations, branches and residual
/// conditions of a level must hold together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeLevel {
    pub directives: Vec<Directive>,
    pub relations: Vec<Relation>,
    pub branches: Vec<Branch>,
    pub rest: Vec<NodeId>,
    /// Every leaf at or below this level was pushed down
    pub fully_optimized: bool,
}

impl TreeLevel {
    /// A level that always holds
    pub fn always() -> Self {
        Self {
            fully_optimized: true,
            ..Default::default()
        }
    }

    pub fn has_pushdown(&self) -> bool {
        !self.directives.is_empty()
            || !self.relations.is_empty()
            || self
                .branches
                .iter()
                .any(|b| b.if_true.has_pushdown() || b.if_false.has_pushdown())
    }

    pub fn has_rest(&self) -> bool {
        !self.rest.is_empty()
            || self
                .branches
                .iter()
                .any(|b| b.if_true.has_rest() || b.if_false.has_rest())
    }

    fn update_optimized(&mut self) {
        self.fully_optimized = self.rest.is_empty()
            && self
                .branches
                .iter()
                .all(|b| b.if_true.fully_optimized && b.if_false.fully_optimized);
    }
}

/// The row variables of a query, and whatever else varies per row
pub struct QuerySources<'a> {
    pub ast: &'a Ast,
    pub symbols: &'a SymbolTable,
    /// Row variable per source, in source order
    pub rows: Vec<SymbolId>,
    /// Row variables plus per row temporaries
    pub dependent: Vec<SymbolId>,
}

impl QuerySources<'_> {
    /// Whether the expression is the same for every row
    pub fn is_independent(&self, node: NodeId) -> bool {
        !self.ast.references_any(node, &self.dependent)
    }

    /// Recognizes `[TOUPPERCASE(] [cast] row.column [)]`. This is the only
    /// place column identity is decided.
    pub fn table_column(&self, node: NodeId) -> Option<ColumnRef> {
        let mut node = node;
        let mut uppercase = false;

        if let NodeKind::FunctionCall {
            function,
            arguments,
        } = self.ast.kind(node)
        {
            if self.symbols.name(*function) == "TOUPPERCASE" && arguments.len() == 1 {
                uppercase = true;
                node = arguments[0];
            }
        }

        if let NodeKind::Cast { value, .. } = self.ast.kind(node) {
            node = *value;
        }

        let NodeKind::RecordColumn { record, column } = self.ast.kind(node) else {
            return None;
        };
        let NodeKind::Variable(row) = self.ast.kind(*record) else {
            return None;
        };

        let source = self.rows.iter().position(|r| r == row)?;
        Some(ColumnRef {
            source,
            column: *column,
            uppercase,
        })
    }
}

fn pushable(operator: BinaryOperator) -> bool {
    use BinaryOperator::*;
    matches!(
        operator,
        Equal | NotEqual | LessEqual | Less | GreaterEqual | Greater | Like | In
    )
}

/// What a single leaf of a conjunction turned out to be
enum Leaf {
    Always,
    Directive(Directive),
    Relation(Relation),
    Rest,
}

struct Decomposer<'s, 'a> {
    sources: &'s QuerySources<'a>,
    /// Some pushable leaf was kept residual
    demoted: bool,
}

impl Decomposer<'_, '_> {
    /// Classifies the conjuncts of `expression` left to right. Once a level
    /// (or the level it hangs under) holds a residual part, later pushable
    /// leaves stay residual too.
    fn convert(&mut self, expression: NodeId, mut optimizable: bool) -> TreeLevel {
        let ast = self.sources.ast;
        let mut level = TreeLevel::default();
        let mut worklist = VecDeque::from([expression]);

        while let Some(node) = worklist.pop_front() {
            match ast.kind(node) {
                NodeKind::Binary {
                    operator: BinaryOperator::And,
                    lhs,
                    rhs,
                } => {
                    // keep source order: lhs is classified first
                    worklist.push_front(*rhs);
                    worklist.push_front(*lhs);
                }
                NodeKind::Conditional {
                    condition,
                    if_true,
                    if_false,
                } if self.sources.is_independent(*condition) => {
                    let branch = Branch {
                        condition: *condition,
                        if_true: self.convert(*if_true, optimizable),
                        if_false: self.convert(*if_false, optimizable),
                    };
                    optimizable &= branch.if_true.fully_optimized && branch.if_false.fully_optimized;
                    level.branches.push(branch);
                }
                NodeKind::Binary {
                    operator: BinaryOperator::Or,
                    lhs,
                    rhs,
                } => {
                    let independent = (
                        self.sources.is_independent(*lhs),
                        self.sources.is_independent(*rhs),
                    );
                    let (condition, dependent) = match independent {
                        (true, false) => (*lhs, *rhs),
                        (false, true) => (*rhs, *lhs),
                        _ => {
                            level.rest.push(node);
                            optimizable = false;
                            continue;
                        }
                    };
                    let branch = Branch {
                        condition,
                        if_true: TreeLevel::always(),
                        if_false: self.convert(dependent, optimizable),
                    };
                    optimizable &= branch.if_false.fully_optimized;
                    level.branches.push(branch);
                }
                _ => match self.classify_leaf(node) {
                    Leaf::Always => {}
                    Leaf::Rest => {
                        level.rest.push(node);
                        optimizable = false;
                    }
                    Leaf::Directive(_) | Leaf::Relation(_) if !optimizable => {
                        level.rest.push(node);
                        self.demoted = true;
                    }
                    Leaf::Directive(directive) => level.directives.push(directive),
                    Leaf::Relation(relation) => level.relations.push(relation),
                },
            }
        }

        level.update_optimized();
        level
    }

    fn classify_leaf(&self, node: NodeId) -> Leaf {
        let ast = self.sources.ast;

        if ast.kind(node).as_boolean_constant() == Some(true) {
            return Leaf::Always;
        }

        // NOT row.flag, row.flag
        let (inner, expected) = match ast.kind(node) {
            NodeKind::Unary {
                operator: UnaryOperator::Not,
                operand,
            } => (*operand, false),
            _ => (node, true),
        };
        if let Some(column) = self.sources.table_column(inner).filter(|c| !c.uppercase) {
            return Leaf::Directive(Directive {
                column,
                operator: BinaryOperator::Equal,
                value: DirectiveValue::Boolean(expected),
                origin: node,
            });
        }

        let NodeKind::Binary { operator, lhs, rhs } = ast.kind(node) else {
            return Leaf::Rest;
        };
        if !pushable(*operator) {
            return Leaf::Rest;
        }

        let left = self.sources.table_column(*lhs);
        let right = self.sources.table_column(*rhs);

        match (left, right) {
            (Some(column), None) if self.sources.is_independent(*rhs) => Leaf::Directive(Directive {
                column,
                operator: *operator,
                value: DirectiveValue::Expression(*rhs),
                origin: node,
            }),
            (None, Some(column)) if self.sources.is_independent(*lhs) => match operator.swapped() {
                Some(operator) => Leaf::Directive(Directive {
                    column,
                    operator,
                    value: DirectiveValue::Expression(*lhs),
                    origin: node,
                }),
                None => Leaf::Rest,
            },
            // both sides must agree on case treatment
            (Some(left), Some(right))
                if left.source != right.source
                    && left.uppercase == right.uppercase
                    && operator.swapped().is_some() =>
            {
                Leaf::Relation(Relation {
                    left,
                    operator: *operator,
                    right,
                    origin: node,
                })
            }
            _ => Leaf::Rest,
        }
    }
}

/// Decomposes a WHERE clause. With `pushdown` off everything is residual.
pub fn decompose(
    sources: &QuerySources<'_>,
    where_clause: Option<NodeId>,
    pushdown: bool,
    position: Position,
    diagnostics: &mut dyn ErrorHandler,
) -> TreeLevel {
    let Some(where_clause) = where_clause else {
        return TreeLevel::always();
    };

    if !pushdown {
        return TreeLevel {
            rest: vec![where_clause],
            ..Default::default()
        };
    }

    let mut decomposer = Decomposer {
        sources,
        demoted: false,
    };
    let root = decomposer.convert(where_clause, true);

    if decomposer.demoted {
        diagnostics.add_warning(position, WarningCode::PartlyUnoptimizedWhere, None);
    }

    tracing::debug!(
        directives = root.directives.len(),
        relations = root.relations.len(),
        branches = root.branches.len(),
        rest = root.rest.len(),
        fully_optimized = root.fully_optimized,
        "decomposed WHERE clause"
    );

    root
}
