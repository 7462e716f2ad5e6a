//! Trait definition for an AST visitor which walks the tree in DFS order, plus
//! the child enumeration every pass relies on. Both matches below are
//! exhaustive on purpose: a new node kind must be handled here before any
//! pass can see it.

use super::{
    Ast, DeepOperation, DeepOperationKind, Layer, NodeId, NodeKind, OrderItem, SelectItem,
    SqlDelete, SqlInsert, SqlSelect, SqlSource, SqlUpdate,
};

pub trait Visitor: Sized {
    fn visit_node(&mut self, ast: &Ast, id: NodeId) {
        walk_node(self, ast, id)
    }
}

pub fn walk_node<V: Visitor>(visitor: &mut V, ast: &Ast, id: NodeId) {
    for child in children(ast.kind(id)) {
        visitor.visit_node(ast, child);
    }
}

fn source_children(source: &SqlSource, out: &mut Vec<NodeId>) {
    out.push(source.expression);
}

/// Direct children of a node, in evaluation order
pub fn children(kind: &NodeKind) -> Vec<NodeId> {
    let mut out = Vec::new();

    match kind {
        NodeKind::Block(statements) => out.extend(statements.iter().copied()),
        NodeKind::ExpressionStatement(expression) => out.push(*expression),
        NodeKind::VariableDeclaration { initializer, .. } => out.extend(*initializer),
        NodeKind::Assignment { value, .. } => out.push(*value),
        NodeKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            out.push(*condition);
            out.push(*then_branch);
            out.extend(*else_branch);
        }
        NodeKind::Loop {
            precondition,
            increment,
            body,
        } => {
            out.extend(*precondition);
            out.push(*body);
            out.extend(*increment);
        }
        NodeKind::Break | NodeKind::Continue => {}
        NodeKind::Return(value) => out.extend(*value),
        NodeKind::Throw { exception, .. } => out.push(*exception),
        NodeKind::TryCatch {
            try_block,
            catch_block,
            ..
        } => {
            out.push(*try_block);
            out.push(*catch_block);
        }
        NodeKind::TryFinally {
            try_block,
            finally_block,
        } => {
            out.push(*try_block);
            out.push(*finally_block);
        }
        NodeKind::DeepOperation(operation) => {
            out.extend(operation.layers.iter().map(|layer| layer.key));
            if let DeepOperationKind::ArrayInsert { at: Some(at) } = operation.kind {
                out.push(at);
            }
            out.extend(operation.value);
        }
        NodeKind::ObjectMemberAssign { object, value, .. } => {
            out.push(*object);
            out.push(*value);
        }
        NodeKind::SqlDelete(delete) => {
            source_children(&delete.source, &mut out);
            out.extend(delete.where_clause);
        }
        NodeKind::SqlUpdate(update) => {
            source_children(&update.source, &mut out);
            out.extend(update.assignments.iter().map(|(_, value)| *value));
            out.extend(update.where_clause);
        }
        NodeKind::SqlInsert(insert) => {
            out.push(insert.target);
            out.extend(insert.values.iter().map(|(_, value)| *value));
        }
        NodeKind::Constant(_)
        | NodeKind::ConstantRecord(_)
        | NodeKind::ConstantArray(_)
        | NodeKind::Variable(_)
        | NodeKind::MakeFunctionPtr { .. } => {}
        NodeKind::Unary { operand, .. } => out.push(*operand),
        NodeKind::Binary { lhs, rhs, .. } => {
            out.push(*lhs);
            out.push(*rhs);
        }
        NodeKind::Conditional {
            condition,
            if_true,
            if_false,
        } => {
            out.push(*condition);
            out.push(*if_true);
            out.push(*if_false);
        }
        NodeKind::Cast { value, .. } => out.push(*value),
        NodeKind::FunctionCall { arguments, .. } => out.extend(arguments.iter().copied()),
        NodeKind::FunctionPtrCall { pointer, arguments } => {
            out.push(*pointer);
            out.extend(arguments.iter().copied());
        }
        NodeKind::RecordColumn { record, .. } => out.push(*record),
        NodeKind::ArrayElement { array, index } => {
            out.push(*array);
            out.push(*index);
        }
        NodeKind::ObjectMember { object, .. } => out.push(*object),
        NodeKind::ObjectMethodCall {
            object, arguments, ..
        } => {
            out.push(*object);
            out.extend(arguments.iter().copied());
        }
        NodeKind::RecordConstructor(cells) => out.extend(cells.iter().map(|(_, value)| *value)),
        NodeKind::ArrayConstructor { elements, .. } => out.extend(elements.iter().copied()),
        NodeKind::BlockExpression { block, result } => {
            out.push(*block);
            out.push(*result);
        }
        NodeKind::SqlSelect(select) => {
            for source in &select.sources {
                source_children(source, &mut out);
            }
            out.extend(select.temporaries.iter().map(|(_, value)| *value));
            out.extend(select.where_clause);
            out.extend(select.items.iter().map(|item| item.expression));
            out.extend(select.group_by.iter().copied());
            out.extend(select.having);
            out.extend(select.order_by.iter().map(|item| item.expression));
            out.extend(select.limit);
        }
    }

    out
}

fn map_source(source: &SqlSource, f: &mut impl FnMut(NodeId) -> NodeId) -> SqlSource {
    SqlSource {
        position: source.position,
        kind: source.kind,
        expression: f(source.expression),
        row: source.row,
    }
}

/// Rebuilds a node kind with every child id passed through `f`. Children are
/// visited in the same order as [`children`].
pub fn map_children(kind: &NodeKind, mut f: impl FnMut(NodeId) -> NodeId) -> NodeKind {
    let f = &mut f;

    match kind {
        NodeKind::Block(statements) => NodeKind::Block(statements.iter().map(|s| f(*s)).collect()),
        NodeKind::ExpressionStatement(expression) => NodeKind::ExpressionStatement(f(*expression)),
        NodeKind::VariableDeclaration {
            symbol,
            initializer,
        } => NodeKind::VariableDeclaration {
            symbol: *symbol,
            initializer: initializer.map(&mut *f),
        },
        NodeKind::Assignment { symbol, value } => NodeKind::Assignment {
            symbol: *symbol,
            value: f(*value),
        },
        NodeKind::If {
            condition,
            then_branch,
            else_branch,
        } => NodeKind::If {
            condition: f(*condition),
            then_branch: f(*then_branch),
            else_branch: else_branch.map(&mut *f),
        },
        NodeKind::Loop {
            precondition,
            increment,
            body,
        } => {
            let precondition = precondition.map(&mut *f);
            let body = f(*body);
            let increment = increment.map(&mut *f);
            NodeKind::Loop {
                precondition,
                increment,
                body,
            }
        }
        NodeKind::Break => NodeKind::Break,
        NodeKind::Continue => NodeKind::Continue,
        NodeKind::Return(value) => NodeKind::Return(value.map(&mut *f)),
        NodeKind::Throw {
            exception,
            is_rethrow,
        } => NodeKind::Throw {
            exception: f(*exception),
            is_rethrow: *is_rethrow,
        },
        NodeKind::TryCatch {
            try_block,
            exception,
            catch_block,
        } => NodeKind::TryCatch {
            try_block: f(*try_block),
            exception: *exception,
            catch_block: f(*catch_block),
        },
        NodeKind::TryFinally {
            try_block,
            finally_block,
        } => NodeKind::TryFinally {
            try_block: f(*try_block),
            finally_block: f(*finally_block),
        },
        NodeKind::DeepOperation(operation) => {
            let layers = operation
                .layers
                .iter()
                .map(|layer| Layer {
                    kind: layer.kind,
                    key: f(layer.key),
                })
                .collect();
            let kind = match operation.kind {
                DeepOperationKind::ArrayInsert { at } => DeepOperationKind::ArrayInsert {
                    at: at.map(&mut *f),
                },
                other => other,
            };
            NodeKind::DeepOperation(Box::new(DeepOperation {
                kind,
                base: operation.base,
                layers,
                value: operation.value.map(&mut *f),
            }))
        }
        NodeKind::ObjectMemberAssign {
            object,
            member,
            value,
        } => NodeKind::ObjectMemberAssign {
            object: f(*object),
            member: *member,
            value: f(*value),
        },
        NodeKind::SqlDelete(delete) => NodeKind::SqlDelete(Box::new(SqlDelete {
            source: map_source(&delete.source, &mut *f),
            where_clause: delete.where_clause.map(&mut *f),
        })),
        NodeKind::SqlUpdate(update) => {
            let source = map_source(&update.source, &mut *f);
            let assignments = update
                .assignments
                .iter()
                .map(|(column, value)| (*column, f(*value)))
                .collect();
            NodeKind::SqlUpdate(Box::new(SqlUpdate {
                source,
                assignments,
                where_clause: update.where_clause.map(&mut *f),
            }))
        }
        NodeKind::SqlInsert(insert) => {
            let target = f(insert.target);
            NodeKind::SqlInsert(Box::new(SqlInsert {
                kind: insert.kind,
                target,
                values: insert
                    .values
                    .iter()
                    .map(|(column, value)| (*column, f(*value)))
                    .collect(),
            }))
        }
        NodeKind::Constant(constant) => NodeKind::Constant(constant.clone()),
        NodeKind::ConstantRecord(cells) => NodeKind::ConstantRecord(cells.clone()),
        NodeKind::ConstantArray(elements) => NodeKind::ConstantArray(elements.clone()),
        NodeKind::Variable(symbol) => NodeKind::Variable(*symbol),
        NodeKind::MakeFunctionPtr { function } => NodeKind::MakeFunctionPtr {
            function: *function,
        },
        NodeKind::Unary { operator, operand } => NodeKind::Unary {
            operator: *operator,
            operand: f(*operand),
        },
        NodeKind::Binary { operator, lhs, rhs } => {
            let lhs = f(*lhs);
            let rhs = f(*rhs);
            NodeKind::Binary {
                operator: *operator,
                lhs,
                rhs,
            }
        }
        NodeKind::Conditional {
            condition,
            if_true,
            if_false,
        } => {
            let condition = f(*condition);
            let if_true = f(*if_true);
            let if_false = f(*if_false);
            NodeKind::Conditional {
                condition,
                if_true,
                if_false,
            }
        }
        NodeKind::Cast { value, to } => NodeKind::Cast {
            value: f(*value),
            to: *to,
        },
        NodeKind::FunctionCall {
            function,
            arguments,
        } => NodeKind::FunctionCall {
            function: *function,
            arguments: arguments.iter().map(|a| f(*a)).collect(),
        },
        NodeKind::FunctionPtrCall { pointer, arguments } => {
            let pointer = f(*pointer);
            NodeKind::FunctionPtrCall {
                pointer,
                arguments: arguments.iter().map(|a| f(*a)).collect(),
            }
        }
        NodeKind::RecordColumn { record, column } => NodeKind::RecordColumn {
            record: f(*record),
            column: *column,
        },
        NodeKind::ArrayElement { array, index } => {
            let array = f(*array);
            let index = f(*index);
            NodeKind::ArrayElement { array, index }
        }
        NodeKind::ObjectMember { object, member } => NodeKind::ObjectMember {
            object: f(*object),
            member: *member,
        },
        NodeKind::ObjectMethodCall {
            object,
            method,
            arguments,
        } => {
            let object = f(*object);
            NodeKind::ObjectMethodCall {
                object,
                method: *method,
                arguments: arguments.iter().map(|a| f(*a)).collect(),
            }
        }
        NodeKind::RecordConstructor(cells) => NodeKind::RecordConstructor(
            cells.iter().map(|(name, value)| (*name, f(*value))).collect(),
        ),
        NodeKind::ArrayConstructor { ty, elements } => NodeKind::ArrayConstructor {
            ty: *ty,
            elements: elements.iter().map(|e| f(*e)).collect(),
        },
        NodeKind::BlockExpression { block, result } => {
            let block = f(*block);
            let result = f(*result);
            NodeKind::BlockExpression { block, result }
        }
        NodeKind::SqlSelect(select) => {
            let sources = select.sources.iter().map(|s| map_source(s, &mut *f)).collect();
            let temporaries = select
                .temporaries
                .iter()
                .map(|(symbol, value)| (*symbol, f(*value)))
                .collect();
            let where_clause = select.where_clause.map(&mut *f);
            let items = select
                .items
                .iter()
                .map(|item| SelectItem {
                    name: item.name,
                    expression: f(item.expression),
                })
                .collect();
            let group_by = select.group_by.iter().map(|g| f(*g)).collect();
            let having = select.having.map(&mut *f);
            let order_by = select
                .order_by
                .iter()
                .map(|item| OrderItem {
                    expression: f(item.expression),
                    ascending: item.ascending,
                })
                .collect();
            let limit = select.limit.map(&mut *f);
            NodeKind::SqlSelect(Box::new(SqlSelect {
                sources,
                temporaries,
                where_clause,
                items,
                group_by,
                having,
                order_by,
                limit,
            }))
        }
    }
}
