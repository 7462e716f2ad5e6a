use crate::{
    error::Result,
    frontend::{
        ast::{BinaryOperator, NodeId, NodeKind, UnaryOperator},
        coder::AstCoder,
    },
};

/// Simplifies generated expressions before they are placed in the tree
pub trait ExpressionOptimizer {
    fn optimize(&mut self, coder: &mut AstCoder<'_>, expression: NodeId) -> Result<NodeId>;
}

/// Folds boolean constants through AND, OR, NOT and the conditional
/// operator. Operands with possible side effects are never dropped when
/// they would have been evaluated.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConstantFolder;

impl ConstantFolder {
    fn constant(coder: &AstCoder<'_>, node: NodeId) -> Option<bool> {
        coder.ast.kind(node).as_boolean_constant()
    }

    fn is_plain_read(coder: &AstCoder<'_>, node: NodeId) -> bool {
        matches!(coder.ast.kind(node), NodeKind::Variable(_) | NodeKind::Constant(_))
    }
}

impl ExpressionOptimizer for ConstantFolder {
    fn optimize(&mut self, coder: &mut AstCoder<'_>, expression: NodeId) -> Result<NodeId> {
        let position = coder.ast.position(expression);

        match coder.ast.kind(expression).clone() {
            NodeKind::Binary {
                operator: operator @ (BinaryOperator::And | BinaryOperator::Or),
                lhs,
                rhs,
            } => {
                let lhs = self.optimize(coder, lhs)?;
                let rhs = self.optimize(coder, rhs)?;
                // the value that decides the outcome on its own
                let absorbing = operator == BinaryOperator::Or;

                match (Self::constant(coder, lhs), Self::constant(coder, rhs)) {
                    (Some(value), _) if value == absorbing => Ok(lhs),
                    (Some(_), _) => Ok(rhs),
                    (None, Some(value)) if value != absorbing => Ok(lhs),
                    (None, Some(_)) if Self::is_plain_read(coder, lhs) => Ok(rhs),
                    _ => coder.binary(position, operator, lhs, rhs),
                }
            }
            NodeKind::Unary {
                operator: UnaryOperator::Not,
                operand,
            } => {
                let operand = self.optimize(coder, operand)?;
                match Self::constant(coder, operand) {
                    Some(value) => Ok(coder.boolean(position, !value)),
                    None => coder.unary(position, UnaryOperator::Not, operand),
                }
            }
            NodeKind::Conditional {
                condition,
                if_true,
                if_false,
            } => {
                let condition = self.optimize(coder, condition)?;
                let if_true = self.optimize(coder, if_true)?;
                let if_false = self.optimize(coder, if_false)?;

                match Self::constant(coder, condition) {
                    Some(true) => return Ok(if_true),
                    Some(false) => return Ok(if_false),
                    None => {}
                }

                let same_constant = Self::constant(coder, if_true).is_some()
                    && Self::constant(coder, if_true) == Self::constant(coder, if_false);
                if same_constant && Self::is_plain_read(coder, condition) {
                    return Ok(if_true);
                }

                coder.conditional(position, condition, if_true, if_false)
            }
            _ => Ok(expression),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{
        ast::{Ast, Position},
        symbol::{SymbolFlags, SymbolTable},
        types::{TypeStorage, VariableType},
    };

    const P: Position = Position::new(1, 1);

    #[test]
    fn folds_boolean_constants() {
        let mut ast = Ast::new();
        let mut types = TypeStorage::new();
        let mut symbols = SymbolTable::new();
        let flag = symbols.register_variable("flag", P, VariableType::Boolean, SymbolFlags::empty());
        let mut coder = AstCoder::new(&mut ast, &mut types, &mut symbols);

        let yes = coder.boolean(P, true);
        let read = coder.variable(P, flag);
        let and = coder.binary(P, BinaryOperator::And, yes, read).unwrap();
        assert_eq!(ConstantFolder.optimize(&mut coder, and).unwrap(), read);

        let no = coder.boolean(P, false);
        let read = coder.variable(P, flag);
        let or = coder.binary(P, BinaryOperator::Or, read, no).unwrap();
        assert_eq!(ConstantFolder.optimize(&mut coder, or).unwrap(), read);

        let no = coder.boolean(P, false);
        let not = coder.unary(P, UnaryOperator::Not, no).unwrap();
        let folded = ConstantFolder.optimize(&mut coder, not).unwrap();
        assert_eq!(coder.ast.kind(folded).as_boolean_constant(), Some(true));

        let read = coder.variable(P, flag);
        let yes = coder.boolean(P, true);
        let also_yes = coder.boolean(P, true);
        let conditional = coder.conditional(P, read, yes, also_yes).unwrap();
        let folded = ConstantFolder.optimize(&mut coder, conditional).unwrap();
        assert_eq!(coder.ast.kind(folded).as_boolean_constant(), Some(true));
    }

    #[test]
    fn keeps_operands_with_side_effects() {
        let mut ast = Ast::new();
        let mut types = TypeStorage::new();
        let mut symbols = SymbolTable::new();
        symbols.register_builtins();
        let probe = symbols.register_function("probe", P, &[], VariableType::Boolean, SymbolFlags::empty());
        let mut coder = AstCoder::new(&mut ast, &mut types, &mut symbols);

        let call = coder.call(P, probe, vec![]).unwrap();
        let no = coder.boolean(P, false);
        let and = coder.binary(P, BinaryOperator::And, call, no).unwrap();
        let folded = ConstantFolder.optimize(&mut coder, and).unwrap();

        assert!(matches!(
            coder.ast.kind(folded),
            NodeKind::Binary {
                operator: BinaryOperator::And,
                ..
            }
        ));
    }
}
