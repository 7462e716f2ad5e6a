use std::fmt::Write;

use colored::Colorize;
use itertools::Itertools;

use crate::{
    frontend::symbol::SymbolTable,
    middle::il::{
        AssignSsaVariable, BasicBlock, BlockId, CodedFunction, Instruction, InstructionKind, Module,
        SsaVariable, VariableId,
    },
};

pub fn pretty_print_module(module: &Module, symbols: &SymbolTable) {
    for function in &module.functions {
        print!("{}", format_function(module, symbols, function));
    }
}

pub fn pretty_print_function(module: &Module, symbols: &SymbolTable, function: &CodedFunction) {
    print!("{}", format_function(module, symbols, function));
}

/// The textual IL of one function, one instruction per line
pub fn format_function(module: &Module, symbols: &SymbolTable, function: &CodedFunction) -> String {
    let printer = Printer { module, symbols };
    let mut out = String::new();

    let parameters = function.parameters.iter().map(|p| printer.def(*p)).join(", ");
    let _ = writeln!(
        out,
        "{} {}{}{}{}",
        "function".magenta(),
        function.name.blue(),
        "(".white(),
        parameters,
        ") {".white()
    );

    for (id, block) in function.cfg.blocks.enumerate() {
        printer.block(&mut out, id, block);
    }

    let _ = writeln!(out, "{}", "}".white());
    out
}

struct Printer<'a> {
    module: &'a Module,
    symbols: &'a SymbolTable,
}

impl Printer<'_> {
    fn name(&self, variable: VariableId) -> &str {
        &self.module.variables[variable].name
    }

    fn def(&self, version: AssignSsaVariable) -> String {
        format!("{}:{}", self.name(version.variable), version.version.to_string().yellow())
    }

    fn use_(&self, used: SsaVariable) -> String {
        if used.is_anonymous() {
            format!("{}:{}", self.name(used.variable), "?".yellow())
        } else {
            format!("{}:{}", self.name(used.variable), used.version.to_string().yellow())
        }
    }

    fn uses(&self, uses: &[SsaVariable]) -> String {
        uses.iter().map(|u| self.use_(*u)).join(", ")
    }

    fn block(&self, out: &mut String, id: BlockId, block: &BasicBlock) {
        let label = format!("{id}:").bright_red();
        if block.is_exception_target {
            let _ = writeln!(out, "{label} {}", "(catch)".bright_black());
        } else {
            let _ = writeln!(out, "{label}");
        }

        for phi in &block.phis {
            let parameters = phi
                .parameters
                .iter()
                .map(|(version, source)| format!("[{}, {}]", self.def(*version), source.to_string().bright_red()))
                .join(", ");
            let _ = writeln!(
                out,
                "    {} {} {} {parameters}",
                self.def(phi.target),
                "=".white(),
                "phi".bright_green()
            );
        }

        for instruction in &block.instructions {
            let _ = writeln!(out, "    {}", self.instruction(instruction, block));
        }

        let falls_through = block.instructions.last().is_none_or(|i| !i.is_terminator());
        if falls_through {
            if let Some(successor) = block.successors.first() {
                let _ = writeln!(out, "    {} {}", "goto".cyan(), successor.to_string().bright_red());
            }
        }
    }

    fn call(&self, target: Option<AssignSsaVariable>, opcode: &str, callee: String, arguments: &[SsaVariable]) -> String {
        let assignment = target
            .map(|target| format!("{} {} ", self.def(target), "=".white()))
            .unwrap_or_default();
        format!("{assignment}{} {callee}({})", opcode.cyan(), self.uses(arguments))
    }

    fn instruction(&self, instruction: &Instruction, block: &BasicBlock) -> String {
        let assign = |target: AssignSsaVariable| format!("{} {}", self.def(target), "=".white());

        let mut text = match &instruction.kind {
            InstructionKind::Assign { target, source } => format!("{} {}", assign(*target), self.use_(*source)),
            InstructionKind::Constant { target, value } => {
                format!("{} {} {}", assign(*target), "const".cyan(), value.to_string().purple())
            }
            InstructionKind::Unary {
                target,
                operator,
                operand,
            } => format!("{} {} {}", assign(*target), operator.to_string().cyan(), self.use_(*operand)),
            InstructionKind::Binary {
                target,
                operator,
                lhs,
                rhs,
            } => format!(
                "{} {} {} {}",
                assign(*target),
                self.use_(*lhs),
                operator.to_string().cyan(),
                self.use_(*rhs)
            ),
            InstructionKind::Cast { target, value, to } => {
                format!("{} {} {} {}", assign(*target), "cast".cyan(), self.use_(*value), to)
            }
            InstructionKind::RecordCellGet {
                target,
                record,
                column,
            } => format!("{} {} {}.{column}", assign(*target), "cell".cyan(), self.use_(*record)),
            InstructionKind::FunctionCall {
                target,
                function,
                arguments,
            } => self.call(*target, "call", self.symbols.name(*function).blue().to_string(), arguments),
            InstructionKind::FunctionPtrCall {
                target,
                pointer,
                arguments,
            } => self.call(*target, "call_ptr", self.use_(*pointer), arguments),
            InstructionKind::MakeFunctionPtr { target, function } => {
                format!("{} {} {}", assign(*target), "ptr".cyan(), self.symbols.name(*function).blue())
            }
            InstructionKind::ObjectMemberGet {
                target,
                object,
                member,
            } => format!("{} {} {}->{member}", assign(*target), "member".cyan(), self.use_(*object)),
            InstructionKind::ObjectMemberSet {
                object,
                member,
                value,
            } => format!(
                "{} {}->{member} {} {}",
                "member".cyan(),
                self.use_(*object),
                ":=".white(),
                self.use_(*value)
            ),
            InstructionKind::ObjectMethodCall {
                target,
                object,
                method,
                arguments,
            } => self.call(*target, "method", format!("{}->{method}", self.use_(*object)), arguments),
            InstructionKind::LoadException { target } => {
                format!("{} {}", assign(*target), "load_exception".cyan())
            }
            InstructionKind::ConditionalJump { condition } => {
                let arm = |i: usize| {
                    block
                        .successors
                        .get(i)
                        .map(|b| b.to_string().bright_red().to_string())
                        .unwrap_or_default()
                };
                format!("{} {} ? {} : {}", "jump_if".cyan(), self.use_(*condition), arm(0), arm(1))
            }
            InstructionKind::Return { value } => match value {
                Some(value) => format!("{} {}", "return".cyan(), self.use_(*value)),
                None => "return".cyan().to_string(),
            },
            InstructionKind::Throw {
                exception,
                is_rethrow,
            } => {
                let opcode = if *is_rethrow { "rethrow" } else { "throw" };
                format!("{} {}", opcode.cyan(), self.use_(*exception))
            }
        };

        if !instruction.uses.is_empty() {
            let _ = write!(text, " {} {}", "; uses".bright_black(), self.uses(&instruction.uses));
        }
        if !instruction.defs.is_empty() {
            let defs = instruction.defs.iter().map(|d| self.def(*d)).join(", ");
            let _ = write!(text, " {} {defs}", "; defs".bright_black());
        }

        text
    }
}
